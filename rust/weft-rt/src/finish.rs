//! Finish scopes: hierarchical completion counters.
//!
//! A [`FinishScope`] completes only when every task spawned under it
//! (transitively, through child scopes) has retired. The counter holds one
//! unit per in-flight task, one per open child scope, and one for the
//! opening fiber itself. That opener unit means the count can only reach
//! zero after the opener has committed to waiting — by then the completion
//! promise is installed — so the zero transition always has somewhere to
//! report to.
//!
//! # Invariants
//!
//! 1. The counter is non-negative; an underflow is a runtime bug and
//!    panics.
//! 2. Only the opening fiber writes the completion slot, and it does so
//!    before releasing its own unit.
//! 3. The parent pointer is immutable after construction; a child scope
//!    holds one unit on its parent for as long as it lives.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::promise::Promise;

pub(crate) struct FinishScope {
    /// In-flight tasks + open child scopes + the opener's unit.
    counter: AtomicUsize,
    parent: Option<Arc<FinishScope>>,
    /// Installed by the opener on entry to helper mode; fulfilled by the
    /// task whose retirement drops the counter to zero.
    completion: Mutex<Option<Promise<()>>>,
}

impl FinishScope {
    /// A fresh scope starts with the opener's unit.
    pub(crate) fn new(parent: Option<Arc<FinishScope>>) -> Arc<Self> {
        Arc::new(Self {
            counter: AtomicUsize::new(1),
            parent,
            completion: Mutex::new(None),
        })
    }

    pub(crate) fn parent(&self) -> Option<&Arc<FinishScope>> {
        self.parent.as_ref()
    }

    pub(crate) fn count(&self) -> usize {
        self.counter.load(Ordering::Acquire)
    }

    /// Register one more unit (a spawned task or a newly opened child
    /// scope).
    pub(crate) fn check_in(&self) {
        self.counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Retire one unit. On the zero transition, fulfill the completion
    /// promise if one is installed (the fast close path never installs
    /// one).
    pub(crate) fn check_out(&self) {
        let prior = self.counter.fetch_sub(1, Ordering::AcqRel);
        assert!(prior > 0, "finish scope counter underflow");
        if prior == 1 {
            let completion = self.completion.lock().unwrap().clone();
            if let Some(promise) = completion {
                promise.put(());
            }
        }
    }

    /// Opener-only: install the completion promise before releasing the
    /// opener's unit.
    pub(crate) fn install_completion(&self, promise: Promise<()>) {
        let mut slot = self.completion.lock().unwrap();
        debug_assert!(slot.is_none(), "completion promise installed twice");
        *slot = Some(promise);
    }

    /// Opener-only: release the completion promise once the scope has
    /// closed.
    pub(crate) fn take_completion(&self) {
        *self.completion.lock().unwrap() = None;
    }
}

impl fmt::Debug for FinishScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinishScope")
            .field("count", &self.count())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_scope_carries_the_opener_unit() {
        let f = FinishScope::new(None);
        assert_eq!(f.count(), 1);
    }

    #[test]
    fn check_in_and_out_balance() {
        let f = FinishScope::new(None);
        f.check_in();
        f.check_in();
        assert_eq!(f.count(), 3);
        f.check_out();
        f.check_out();
        assert_eq!(f.count(), 1);
    }

    #[test]
    fn zero_transition_fires_installed_completion() {
        let f = FinishScope::new(None);
        let done = Promise::new();
        f.install_completion(done.clone());
        assert!(!done.is_fulfilled());
        // Releasing the opener's unit is the last one out.
        f.check_out();
        assert!(done.is_fulfilled());
    }

    #[test]
    fn zero_transition_without_completion_is_silent() {
        let f = FinishScope::new(None);
        f.check_out();
        assert_eq!(f.count(), 0);
    }

    #[test]
    #[should_panic(expected = "counter underflow")]
    fn underflow_panics() {
        let f = FinishScope::new(None);
        f.check_out();
        f.check_out();
    }

    #[test]
    fn parent_link_is_preserved() {
        let parent = FinishScope::new(None);
        parent.check_in(); // the child scope's unit
        let child = FinishScope::new(Some(Arc::clone(&parent)));
        assert!(Arc::ptr_eq(child.parent().unwrap(), &parent));
        assert_eq!(parent.count(), 2);
    }
}
