//! Per-thread worker state and the work loop.
//!
//! Each OS thread in the pool owns a [`WorkerState`], reachable through a
//! thread-local slot. The state itself is thread-confined (plain cells);
//! everything shared — deques, counters, shutdown flags — lives in the
//! runtime context behind atomics.
//!
//! # The loop
//!
//! ```text
//! while running(my id) {
//!     task = local pop (comm queue first for the designated worker)
//!     if none: one deterministic steal sweep over my victim list
//!     if task: execute it
//! }
//! ```
//!
//! # Fibers and worker identity
//!
//! A task body can suspend at a scope boundary and resume on a *different*
//! worker thread. The worker reference returned by [`current`] is only
//! meaningful until the next operation that can suspend; every path here
//! re-reads the thread-local after executing a task, and so must any caller.

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::deque::Steal;
use crate::fiber::Fiber;
use crate::finish::FinishScope;
use crate::place::PlaceId;
use crate::runtime::RuntimeInner;
use crate::stats::WorkerCounters;
use crate::task::Task;

/// How long an idle worker parks after a fruitless steal sweep.
const IDLE_PARK: Duration = Duration::from_micros(200);

// ---------------------------------------------------------------------------
// WorkerState
// ---------------------------------------------------------------------------

pub(crate) struct WorkerState {
    id: usize,
    rt: Arc<RuntimeInner>,
    home: PlaceId,
    /// Victim deques in deterministic order. See `Topology::steal_path`.
    steal_path: Vec<(PlaceId, usize)>,
    /// Scope that spawns on this thread are registered under. Updated on
    /// every task entry and at scope boundaries.
    pub(crate) current_finish: RefCell<Option<Arc<FinishScope>>>,
    /// Fiber currently executing on this thread.
    pub(crate) curr_fiber: Cell<*mut Fiber>,
    /// Proxy for the thread's original stack, swapped back to at shutdown.
    pub(crate) orig_fiber: Cell<*mut Fiber>,
}

impl WorkerState {
    pub(crate) fn new(rt: Arc<RuntimeInner>, id: usize) -> Box<Self> {
        let home = rt.topology().home_of(id);
        let steal_path = rt.topology().steal_path(id);
        Box::new(Self {
            id,
            rt,
            home,
            steal_path,
            current_finish: RefCell::new(None),
            curr_fiber: Cell::new(ptr::null_mut()),
            orig_fiber: Cell::new(ptr::null_mut()),
        })
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn rt(&self) -> &Arc<RuntimeInner> {
        &self.rt
    }

    pub(crate) fn home(&self) -> PlaceId {
        self.home
    }

    fn counters(&self) -> &WorkerCounters {
        self.rt.stats().worker(self.id)
    }
}

// ---------------------------------------------------------------------------
// Thread-local current worker
// ---------------------------------------------------------------------------

thread_local! {
    static CURRENT: Cell<*const WorkerState> = const { Cell::new(ptr::null()) };
}

pub(crate) fn install(ws: &WorkerState) {
    CURRENT.with(|c| {
        assert!(
            c.get().is_null(),
            "a weft worker is already installed on this thread"
        );
        c.set(ws as *const WorkerState);
    });
}

pub(crate) fn uninstall() {
    CURRENT.with(|c| c.set(ptr::null()));
}

/// The worker bound to the calling OS thread.
///
/// The returned reference is valid until the thread's worker is torn down;
/// callers must re-fetch it after any operation that can suspend the
/// current fiber, because the fiber may resume on a different thread.
pub(crate) fn current() -> &'static WorkerState {
    try_current().expect("not called from a weft worker thread")
}

pub(crate) fn try_current() -> Option<&'static WorkerState> {
    CURRENT.with(|c| {
        let p = c.get();
        // The pointee is owned by this thread's worker routine and outlives
        // every fiber the thread runs.
        if p.is_null() {
            None
        } else {
            Some(unsafe { &*p })
        }
    })
}

// ---------------------------------------------------------------------------
// Scheduling entry points
// ---------------------------------------------------------------------------

/// Enqueue a ready task on the calling worker's home deque.
pub(crate) fn schedule_ready(task: Box<Task>) {
    let w = current();
    push_local(w, w.home(), task);
}

/// Enqueue a ready task on `place`'s deque for the calling worker, falling
/// back to inline execution when the deque is full.
pub(crate) fn push_local(w: &WorkerState, place: PlaceId, task: Box<Task>) {
    let deque = w.rt().topology().place(place).deque(w.id());
    match deque.push(task) {
        Ok(()) => WorkerCounters::bump(&w.counters().pushes),
        Err(task) => {
            // Progress over parallelism: run it on the current stack.
            log::warn!(
                "worker {}: deque at {place} is full, executing task in place",
                w.id()
            );
            WorkerCounters::bump(&w.counters().inline_execs);
            let saved = w.current_finish.borrow().clone();
            execute(task);
            // The task may have suspended and resumed us on another thread.
            let w = current();
            *w.current_finish.borrow_mut() = saved;
        }
    }
}

/// Run one task to retirement: adopt its scope, call the body, check out.
///
/// Adopting the scope before the body runs is what makes nested spawns
/// inherit the task's finish rather than whatever scope the previous task
/// left behind on this thread.
pub(crate) fn execute(task: Box<Task>) {
    if task.is_escaping() {
        log::trace!("worker {}: running escaping task", current().id());
    }
    let (body, finish) = task.into_parts();
    *current().current_finish.borrow_mut() = finish.clone();

    // A panic escaping a task body has no recovery path: the scope counter
    // and any registered triggers would be left dangling.
    if panic::catch_unwind(AssertUnwindSafe(move || body())).is_err() {
        log::error!("task body panicked; aborting");
        std::process::abort();
    }

    if let Some(scope) = finish {
        scope.check_out();
    }
}

// ---------------------------------------------------------------------------
// The work loop
// ---------------------------------------------------------------------------

/// Pop-steal-execute until this thread's shutdown flag clears.
///
/// Runs on loop fibers, helper fibers, and whatever fiber inherits a thread
/// after a help-finish resume — all of them share this body.
pub(crate) fn work_loop() {
    loop {
        let w = current();
        if !w.rt().running(w.id()) {
            return;
        }
        find_and_run();
    }
}

/// One scheduling round: local work, then a steal sweep, then execution.
fn find_and_run() {
    let w = current();
    let round_start = Instant::now();
    let mut task = pop_local(w);
    w.counters().add_overhead(round_start.elapsed());

    if task.is_none() {
        let search_start = Instant::now();
        task = steal_sweep(w);
        w.counters().add_search(search_start.elapsed());
    }

    match task {
        Some(task) => {
            // Time is attributed to the worker that started the task even
            // if the body migrates; see the stats module docs.
            let counters = w.counters();
            let work_start = Instant::now();
            execute(task);
            counters.add_work(work_start.elapsed());
        }
        None => std::thread::park_timeout(IDLE_PARK),
    }
}

fn pop_local(w: &WorkerState) -> Option<Box<Task>> {
    // The designated communication worker drains its queue with priority;
    // nobody else may touch it.
    if w.rt().is_comm_designee(w.id()) {
        if let Some(task) = w.rt().comm_pop() {
            return Some(task);
        }
    }
    let task = w.rt().topology().place(w.home()).deque(w.id()).pop();
    if task.is_some() {
        WorkerCounters::bump(&w.counters().pops);
    }
    task
}

/// One pass over the victim list. Transient CAS losses retry the same
/// victim; an empty victim moves the sweep on.
fn steal_sweep(w: &WorkerState) -> Option<Box<Task>> {
    for &(place, victim) in &w.steal_path {
        let deque = w.rt().topology().place(place).deque(victim);
        loop {
            match deque.steal() {
                Steal::Taken(task) => {
                    WorkerCounters::bump(&w.counters().steals);
                    return Some(task);
                }
                Steal::Empty => break,
                Steal::Retry => std::hint::spin_loop(),
            }
        }
    }
    None
}
