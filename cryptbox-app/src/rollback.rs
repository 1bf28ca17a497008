// SPDX-License-Identifier: GPL-3.0-only

//! Compensating actions for partially completed lifecycle operations

use cryptbox_types::Result;
use tracing::{debug, warn};

type Action<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;

/// Stack of labelled undo actions.
///
/// Actions are pushed as resources are acquired and run in reverse order when
/// the scope is dropped, unless [`RollbackScope::commit`] was called. Each
/// action runs at most once; a failing action is logged and the rest still run.
pub struct RollbackScope<'a> {
    operation: &'static str,
    actions: Vec<(String, Action<'a>)>,
    committed: bool,
}

impl<'a> RollbackScope<'a> {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            actions: Vec::new(),
            committed: false,
        }
    }

    pub fn push<F>(&mut self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> Result<()> + 'a,
    {
        let label = label.into();
        debug!("{}: registered rollback '{}'", self.operation, label);
        self.actions.push((label, Box::new(action)));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Keep every acquired resource; nothing is undone.
    pub fn commit(mut self) {
        self.committed = true;
        self.actions.clear();
    }

    /// Undo now instead of at drop, returning the labels of failed actions.
    pub fn rollback(mut self) -> Vec<String> {
        self.unwind()
    }

    fn unwind(&mut self) -> Vec<String> {
        let mut failed = Vec::new();
        if !self.actions.is_empty() {
            warn!(
                "{}: rolling back {} step(s)",
                self.operation,
                self.actions.len()
            );
        }
        while let Some((label, action)) = self.actions.pop() {
            match action() {
                Ok(()) => debug!("{}: rollback '{}' done", self.operation, label),
                Err(error) => {
                    warn!("{}: rollback '{}' failed: {}", self.operation, label, error);
                    failed.push(label);
                }
            }
        }
        failed
    }
}

impl Drop for RollbackScope<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.unwind();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryptbox_types::ContainerError;
    use std::cell::RefCell;

    #[test]
    fn runs_actions_in_reverse_on_drop() {
        let log = RefCell::new(Vec::new());
        {
            let mut scope = RollbackScope::new("test");
            for step in ["file", "loop", "mapping"] {
                let log = &log;
                scope.push(step, move || {
                    log.borrow_mut().push(step);
                    Ok(())
                });
            }
            assert_eq!(scope.len(), 3);
        }
        assert_eq!(*log.borrow(), vec!["mapping", "loop", "file"]);
    }

    #[test]
    fn commit_skips_every_action() {
        let ran = RefCell::new(false);
        let mut scope = RollbackScope::new("test");
        scope.push("never", || {
            *ran.borrow_mut() = true;
            Ok(())
        });
        scope.commit();
        assert!(!*ran.borrow());
    }

    #[test]
    fn failures_do_not_stop_the_unwind() {
        let log = RefCell::new(Vec::new());
        let mut scope = RollbackScope::new("test");
        scope.push("first", || {
            log.borrow_mut().push("first");
            Ok(())
        });
        scope.push("broken", || Err(ContainerError::busy("/dev/loop0", "in use")));
        scope.push("last", || {
            log.borrow_mut().push("last");
            Ok(())
        });

        let failed = scope.rollback();
        assert_eq!(failed, vec!["broken".to_string()]);
        assert_eq!(*log.borrow(), vec!["last", "first"]);
    }
}
