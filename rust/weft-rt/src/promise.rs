//! Single-assignment promises and dependency triggers.
//!
//! A [`Promise`] is a write-once cell: it starts empty, is fulfilled exactly
//! once by [`Promise::put`], and once fulfilled its value is observable from
//! any thread through [`Promise::get`]. Tasks that need a set of promises
//! use a [`Trigger`]: the trigger walks its dependency list, parking on the
//! first unfulfilled promise, and enqueues its task exactly once when the
//! frontier walks off the end of the list.
//!
//! # Invariants
//!
//! 1. A promise transitions empty → fulfilled at most once; a second `put`
//!    is a contract violation and panics.
//! 2. The value written by `put` is published with Release ordering and read
//!    with Acquire, so a reader that observes fulfillment observes the value.
//! 3. A trigger's owner task is enqueued exactly once, and only after every
//!    dependency has been observed fulfilled.
//!
//! Registration re-checks the fulfillment flag under the promise's waiter
//! lock — the same lock `put` drains waiters under — so a trigger is either
//! drained by the fulfilling thread or observes fulfillment and advances
//! itself; never both, never neither.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::task::Task;
use crate::worker;

const EMPTY: u8 = 0;
const FULFILLED: u8 = 1;

// ---------------------------------------------------------------------------
// Promise
// ---------------------------------------------------------------------------

struct Inner<T> {
    state: AtomicU8,
    value: UnsafeCell<Option<T>>,
    waiters: Mutex<Vec<Arc<Trigger>>>,
}

// The value cell is written once, before the Release store of FULFILLED,
// and only read after an Acquire load observes FULFILLED.
unsafe impl<T: Send + Sync> Send for Inner<T> {}
unsafe impl<T: Send + Sync> Sync for Inner<T> {}

/// A single-assignment cell delivering a value from one producer to any
/// number of consumers.
///
/// Cloning a `Promise` clones a handle to the same underlying cell.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> Promise<T> {
    /// Create a new, empty promise.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(EMPTY),
                value: UnsafeCell::new(None),
                waiters: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Fulfill the promise with `value`, waking every parked trigger.
    ///
    /// # Panics
    ///
    /// Panics if the promise was already fulfilled. Fulfilling a promise
    /// that has parked tasks is only valid from runtime context (the woken
    /// tasks are enqueued on the calling worker's deque).
    pub fn put(&self, value: T) {
        let drained = {
            let mut waiters = self.inner.waiters.lock().unwrap();
            assert_eq!(
                self.inner.state.load(Ordering::Relaxed),
                EMPTY,
                "promise fulfilled twice"
            );
            unsafe { *self.inner.value.get() = Some(value) };
            self.inner.state.store(FULFILLED, Ordering::Release);
            std::mem::take(&mut *waiters)
        };
        for trigger in drained {
            trigger.advance();
        }
    }

    /// Read the fulfilled value.
    ///
    /// # Panics
    ///
    /// Panics if the promise has not been fulfilled. Callers arrange a safe
    /// point with a trigger ([`spawn_await`](crate::runtime::spawn_await))
    /// rather than polling.
    pub fn get(&self) -> &T {
        assert_eq!(
            self.inner.state.load(Ordering::Acquire),
            FULFILLED,
            "promise read before it was fulfilled"
        );
        unsafe { (*self.inner.value.get()).as_ref().unwrap() }
    }

    /// Non-panicking read: `None` until the promise is fulfilled.
    pub fn try_get(&self) -> Option<&T> {
        if self.inner.state.load(Ordering::Acquire) == FULFILLED {
            Some(unsafe { (*self.inner.value.get()).as_ref().unwrap() })
        } else {
            None
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == FULFILLED
    }

    /// A type-erased handle usable in a [`spawn_await`] dependency list.
    ///
    /// [`spawn_await`]: crate::runtime::spawn_await
    pub fn dep(&self) -> Dep {
        Dep(Arc::clone(&self.inner) as Arc<dyn DepCell>)
    }
}

impl<T: Send + Sync + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.state.load(Ordering::Acquire) {
            FULFILLED => "fulfilled",
            _ => "empty",
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

// ---------------------------------------------------------------------------
// Dep — type-erased promise handle
// ---------------------------------------------------------------------------

trait DepCell: Send + Sync {
    fn is_fulfilled(&self) -> bool;

    /// Park `trigger` on this cell's waiter list. Returns `false` if the
    /// cell is already fulfilled, in which case the caller advances past it.
    fn register(&self, trigger: &Arc<Trigger>) -> bool;
}

impl<T: Send + Sync> DepCell for Inner<T> {
    fn is_fulfilled(&self) -> bool {
        self.state.load(Ordering::Acquire) == FULFILLED
    }

    fn register(&self, trigger: &Arc<Trigger>) -> bool {
        let mut waiters = self.waiters.lock().unwrap();
        // Re-check under the lock: a concurrent put drains this list under
        // the same lock, so after this check exactly one side owns the
        // trigger's next advance.
        if self.state.load(Ordering::Acquire) == FULFILLED {
            return false;
        }
        waiters.push(Arc::clone(trigger));
        true
    }
}

/// An opaque dependency handle produced by [`Promise::dep`].
#[derive(Clone)]
pub struct Dep(Arc<dyn DepCell>);

impl fmt::Debug for Dep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dep")
            .field("fulfilled", &self.0.is_fulfilled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// Binds a task to an ordered list of dependencies.
///
/// The frontier index only grows. Whoever moves it off the end of the list
/// (the spawning worker, or the thread fulfilling the last blocking promise)
/// enqueues the owner task on its own deque.
pub(crate) struct Trigger {
    task: Mutex<Option<Box<Task>>>,
    deps: Vec<Dep>,
    next: AtomicUsize,
}

impl Trigger {
    pub(crate) fn new(task: Box<Task>, deps: Vec<Dep>) -> Arc<Self> {
        Arc::new(Self {
            task: Mutex::new(Some(task)),
            deps,
            next: AtomicUsize::new(0),
        })
    }

    /// Walk the frontier from the current index: skip fulfilled promises,
    /// park on the first empty one, enqueue the task when the list is done.
    ///
    /// Only one thread operates a given trigger at a time — registration
    /// hands it off to the fulfilling thread — so the index needs no
    /// stronger ordering than the promise locks already provide.
    pub(crate) fn advance(self: &Arc<Self>) {
        loop {
            let i = self.next.load(Ordering::Relaxed);
            if i == self.deps.len() {
                let task = self
                    .task
                    .lock()
                    .unwrap()
                    .take()
                    .expect("trigger fired its task twice");
                worker::schedule_ready(task);
                return;
            }
            if self.deps[i].0.register(self) {
                return;
            }
            self.next.store(i + 1, Ordering::Relaxed);
        }
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("deps", &self.deps.len())
            .field("next", &self.next.load(Ordering::Relaxed))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
