//! Work-stealing deques.
//!
//! [`WorkDeque`] is a bounded Chase–Lev deque: the owning worker pushes and
//! pops at the bottom (LIFO) while any other worker steals from the top
//! (FIFO). Indices are monotone `u64`s so the ring wraps without an ABA
//! hazard; a CAS on `top` arbitrates between competing stealers and, for the
//! last element, between a stealer and the owner.
//!
//! Unlike a growable Chase–Lev deque the buffer is fixed: [`WorkDeque::push`]
//! reports a full deque to the caller instead of reallocating, and the caller
//! is expected to run the task in place (losing parallelism, never progress).
//!
//! [`CommQueue`] is the second queue flavor: multi-producer, single-consumer,
//! used only for tasks bound to the designated communication worker. Its one
//! contract is that the consumer observes every pushed task exactly once.
//!
//! # Ownership contract
//!
//! `push` and `pop` must only ever be called by the deque's owning worker;
//! they require no synchronization against each other. `steal` may be called
//! from any thread and races with `pop` at the opposite end. The runtime
//! upholds this by indexing one deque per (place, worker) pair.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

// ---------------------------------------------------------------------------
// Steal result
// ---------------------------------------------------------------------------

/// Outcome of a [`WorkDeque::steal`] attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Steal<T> {
    /// A task was taken from the top of the deque.
    Taken(T),
    /// The deque was observed empty.
    Empty,
    /// Lost a race against another stealer (or the owner); retrying may
    /// succeed.
    Retry,
}

impl<T> Steal<T> {
    #[cfg(test)]
    fn take(self) -> Option<T> {
        match self {
            Steal::Taken(t) => Some(t),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Ring buffer
// ---------------------------------------------------------------------------

/// Fixed ring of slots. Indices are masked, so capacity must be a power of
/// two.
struct Buffer<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: u64,
}

impl<T> Buffer<T> {
    fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "deque capacity must be a power of two, got {capacity}"
        );
        let slots: Vec<_> = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Self {
            slots: slots.into_boxed_slice(),
            mask: capacity as u64 - 1,
        }
    }

    #[inline]
    fn slot(&self, index: u64) -> &UnsafeCell<MaybeUninit<T>> {
        // Index is masked to the ring size.
        unsafe { self.slots.get_unchecked((index & self.mask) as usize) }
    }

    /// Write `value` into the slot for `index`.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive write access to the slot (owner-side
    /// push below `bottom`).
    #[inline]
    unsafe fn write(&self, index: u64, value: T) {
        (*self.slot(index).get()).write(value);
    }

    /// Read the value at `index`.
    ///
    /// # Safety
    ///
    /// The slot must have been initialized. A stealer's read is speculative:
    /// if the subsequent CAS on `top` fails the copy must be `mem::forget`-ed,
    /// never dropped or used.
    #[inline]
    unsafe fn read(&self, index: u64) -> T {
        (*self.slot(index).get()).assume_init_read()
    }
}

// ---------------------------------------------------------------------------
// WorkDeque
// ---------------------------------------------------------------------------

/// Bounded work-stealing deque. See the module docs for the ownership
/// contract.
pub(crate) struct WorkDeque<T: Send> {
    /// Owner end. Only the owning worker writes this.
    bottom: CachePadded<AtomicU64>,
    /// Thief end. Advanced by CAS from any thread.
    top: CachePadded<AtomicU64>,
    buffer: Buffer<T>,
}

unsafe impl<T: Send> Send for WorkDeque<T> {}
unsafe impl<T: Send> Sync for WorkDeque<T> {}

impl<T: Send> WorkDeque<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            bottom: CachePadded::new(AtomicU64::new(0)),
            top: CachePadded::new(AtomicU64::new(0)),
            buffer: Buffer::new(capacity),
        }
    }

    /// Approximate number of queued tasks. Exact when called by the owner
    /// with no concurrent stealers.
    pub(crate) fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        b.saturating_sub(t) as usize
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owner-only: push a task at the bottom.
    ///
    /// Returns the task back when the deque is full so the caller can execute
    /// it in place.
    pub(crate) fn push(&self, task: T) -> Result<(), T> {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);

        if b.wrapping_sub(t) >= self.buffer.slots.len() as u64 {
            return Err(task);
        }

        // The slot below `bottom` is invisible to stealers until the store
        // of the incremented index publishes it.
        unsafe { self.buffer.write(b, task) };
        self.bottom.store(b + 1, Ordering::Release);
        Ok(())
    }

    /// Owner-only: pop the most recently pushed task (LIFO).
    pub(crate) fn pop(&self) -> Option<T> {
        let b = self.bottom.load(Ordering::Relaxed);
        if b == self.top.load(Ordering::Relaxed) {
            return None;
        }
        let b = b - 1;
        self.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        if t > b {
            // A stealer emptied the deque under us; restore bottom.
            self.bottom.store(b + 1, Ordering::Relaxed);
            return None;
        }

        let task = unsafe { self.buffer.read(b) };
        if t == b {
            // Last element: race a concurrent stealer for it.
            let won = self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            self.bottom.store(b + 1, Ordering::Relaxed);
            if !won {
                // The stealer owns the element; our copy must not be dropped.
                std::mem::forget(task);
                return None;
            }
        }
        Some(task)
    }

    /// Steal the oldest task from the top (FIFO). Safe from any thread.
    pub(crate) fn steal(&self) -> Steal<T> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);

        if t >= b {
            return Steal::Empty;
        }

        // Speculative read; only valid if the CAS below claims index `t`.
        let task = unsafe { self.buffer.read(t) };
        if self
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            std::mem::forget(task);
            return Steal::Retry;
        }
        Steal::Taken(task)
    }
}

impl<T: Send> Drop for WorkDeque<T> {
    fn drop(&mut self) {
        // Exclusive access here; drain whatever is left so element drops run.
        while self.pop().is_some() {}
    }
}

impl<T: Send> fmt::Debug for WorkDeque<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkDeque")
            .field("bottom", &self.bottom.load(Ordering::Relaxed))
            .field("top", &self.top.load(Ordering::Relaxed))
            .field("capacity", &self.buffer.slots.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// CommQueue
// ---------------------------------------------------------------------------

/// Multi-producer, single-consumer queue for the communication worker.
///
/// Any worker may [`push`](CommQueue::push); only the designated worker may
/// [`pop`](CommQueue::pop). Stealing from this queue is forbidden, which the
/// type enforces by simply not offering a steal operation.
pub(crate) struct CommQueue<T> {
    tx: crossbeam_channel::Sender<T>,
    rx: crossbeam_channel::Receiver<T>,
}

impl<T: Send> CommQueue<T> {
    pub(crate) fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    pub(crate) fn push(&self, task: T) {
        // The receiver lives as long as the queue, so a send cannot fail.
        self.tx
            .send(task)
            .unwrap_or_else(|_| unreachable!("comm queue receiver dropped"));
    }

    /// Consumer-only: take the next task, if any.
    pub(crate) fn pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<T> fmt::Debug for CommQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommQueue")
            .field("len", &self.rx.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
