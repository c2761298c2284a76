//! Runtime context, spawn operations, finish scopes, and launch/teardown.
//!
//! [`launch`] (or [`launch_with`]) is the one entry point: it builds the
//! topology, starts N−1 pinned worker threads, promotes the calling thread
//! to worker 0, opens the root finish scope, spawns the entry closure as
//! the first task, and drives worker 0's share of the computation from
//! inside the root scope's close. When the root scope drains, the shutdown
//! flags flip, the workers unwind to their original stacks, and `launch`
//! returns with a statistics snapshot.
//!
//! Requiring `launch` (instead of exposing bare init/finalize) means every
//! `end_finish` in the program runs on a runtime-managed fiber. The scope
//! close can then always capture the current context and swap away, without
//! first having to decide whether the caller's stack is one the runtime is
//! allowed to suspend.
//!
//! # Helper mode
//!
//! [`end_finish`] on a scope with live tasks must not block its kernel
//! thread. Instead it parks the current fiber and hands the thread a fresh
//! helper fiber running the ordinary work loop:
//!
//! 1. install a completion promise on the scope;
//! 2. swap to a new helper fiber, remembering the parked one;
//! 3. from the helper, spawn an *escaping* task — counted by no scope —
//!    that awaits the completion promise and swaps back into the parked
//!    fiber;
//! 4. release the opener's unit and keep scheduling tasks.
//!
//! The escaping resume task is the reason scope-less tasks exist at all: if
//! the resume were registered under the scope being closed, the scope could
//! never reach zero. When the last task checks out, the promise fires, some
//! worker runs the resume task, and `end_finish` continues — on whichever
//! thread that was; the fiber that ran the resume is dead and is reclaimed
//! through the `prev` link.

use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use thiserror::Error;

use crate::config::{Config, ConfigError};
use crate::deque::CommQueue;
use crate::fiber::{self, Fiber, FiberPtr};
use crate::finish::FinishScope;
use crate::place::{PlaceId, Topology};
use crate::promise::{Dep, Promise, Trigger};
use crate::stats::{RuntimeStats, StatsRegistry};
use crate::task::Task;
use crate::worker::{self, WorkerState};

/// Worker that owns the communication queue when the feature is enabled.
const COMM_WORKER_ID: usize = 0;

/// Errors surfaced while bringing the runtime up.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Runtime context
// ---------------------------------------------------------------------------

pub(crate) struct RuntimeInner {
    topology: Topology,
    /// Per-worker run flags: true while the worker should keep scheduling.
    running: Vec<AtomicBool>,
    stats: StatsRegistry,
    comm: Option<CommQueue<Box<Task>>>,
    stack_size: usize,
    bind_threads: bool,
}

impl RuntimeInner {
    pub(crate) fn topology(&self) -> &Topology {
        &self.topology
    }

    pub(crate) fn stats(&self) -> &StatsRegistry {
        &self.stats
    }

    pub(crate) fn nworkers(&self) -> usize {
        self.running.len()
    }

    pub(crate) fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub(crate) fn running(&self, worker: usize) -> bool {
        self.running[worker].load(Ordering::Acquire)
    }

    fn signal_shutdown(&self) {
        for flag in &self.running {
            flag.store(false, Ordering::Release);
        }
    }

    pub(crate) fn is_comm_designee(&self, worker: usize) -> bool {
        self.comm.is_some() && worker == COMM_WORKER_ID
    }

    pub(crate) fn comm_pop(&self) -> Option<Box<Task>> {
        self.comm.as_ref().and_then(|q| q.pop())
    }
}

// ---------------------------------------------------------------------------
// Launch and teardown
// ---------------------------------------------------------------------------

/// Initialize the runtime from `WEFT_*` environment variables, run `entry`
/// as the first task under the root finish scope, and tear everything back
/// down. Returns once the computation has completed.
pub fn launch<F>(entry: F) -> Result<RuntimeStats, RuntimeError>
where
    F: FnOnce() + Send + 'static,
{
    launch_with(Config::from_env()?, entry)
}

/// [`launch`] with an explicit configuration.
pub fn launch_with<F>(config: Config, entry: F) -> Result<RuntimeStats, RuntimeError>
where
    F: FnOnce() + Send + 'static,
{
    let desc = config.resolve_topology()?;
    let topology = Topology::build(&desc, config.deque_capacity).map_err(ConfigError::from)?;
    let nworkers = topology.nworkers();
    let nplaces = topology.nplaces();

    let rt = Arc::new(RuntimeInner {
        topology,
        running: (0..nworkers).map(|_| AtomicBool::new(true)).collect(),
        stats: StatsRegistry::new(nworkers),
        comm: config.comm_worker.then(CommQueue::new),
        stack_size: config.stack_size,
        bind_threads: config.bind_threads,
    });

    if config.stats {
        config.print_banner(nworkers, nplaces);
    }
    log::debug!("launching runtime with {nworkers} workers over {nplaces} places");
    let start = Instant::now();

    let mut joins = Vec::with_capacity(nworkers.saturating_sub(1));
    for wid in 1..nworkers {
        let rt = Arc::clone(&rt);
        let handle = thread::Builder::new()
            .name(format!("weft-worker-{wid}"))
            .spawn(move || worker_routine(rt, wid))
            .expect("failed to spawn worker thread");
        joins.push(handle);
    }

    // The calling thread becomes worker 0.
    if rt.bind_threads {
        bind_thread(0);
    }
    let ws0 = WorkerState::new(Arc::clone(&rt), 0);
    worker::install(&ws0);

    start_finish();
    spawn(entry);
    finalize();

    for handle in joins {
        handle.join().expect("worker thread panicked");
    }

    worker::uninstall();
    drop(ws0);

    debug_assert!(
        rt.topology.all_deques_empty(),
        "tasks left queued after the root scope closed"
    );
    debug_assert!(
        rt.comm.as_ref().is_none_or(|q| q.is_empty()),
        "communication tasks left queued after the root scope closed"
    );
    let stats = rt.stats.snapshot(start.elapsed());
    if config.stats {
        stats.print_report();
    }
    log::debug!("runtime torn down: {stats}");
    Ok(stats)
}

/// Close the root scope and shut the pool down.
///
/// Runs the close on a fresh fiber so `end_finish` can suspend; the
/// original stack is proxied and swapped back to once a fiber on this
/// thread observes the shutdown flag.
fn finalize() {
    let orig = Fiber::proxy();
    let stack_size = {
        let w = worker::current();
        w.orig_fiber.set(orig);
        w.rt().stack_size()
    };

    let fin = Fiber::create(
        stack_size,
        Box::new(|me| {
            worker::current().curr_fiber.set(me);
            end_finish();
            // The close may have migrated this fiber; signal shutdown from
            // wherever we ended up.
            worker::current().rt().signal_shutdown();
            exit_to_orig();
        }),
    );
    unsafe { fiber::swap(orig, fin) };

    // Back on the original stack. The fiber that swapped here observed the
    // shutdown flag and is done.
    let w = worker::current();
    w.curr_fiber.set(ptr::null_mut());
    w.orig_fiber.set(ptr::null_mut());
    unsafe {
        fiber::destroy((*orig).prev());
        fiber::destroy(orig);
    }
}

/// Body of worker threads 1..N: proxy the OS stack, run the work loop on a
/// fiber, and reclaim whatever fiber delivered the shutdown swap.
fn worker_routine(rt: Arc<RuntimeInner>, wid: usize) {
    if rt.bind_threads {
        bind_thread(wid);
    }
    log::debug!("worker {wid} up");

    let ws = WorkerState::new(Arc::clone(&rt), wid);
    worker::install(&ws);

    let orig = Fiber::proxy();
    ws.orig_fiber.set(orig);

    let loop_fiber = Fiber::create(
        rt.stack_size,
        Box::new(|me| {
            worker::current().curr_fiber.set(me);
            worker::work_loop();
            exit_to_orig();
        }),
    );
    unsafe { fiber::swap(orig, loop_fiber) };

    unsafe {
        fiber::destroy((*orig).prev());
        fiber::destroy(orig);
    }
    worker::uninstall();
    log::debug!("worker {wid} down");
    drop(ws);
}

/// Final swap of a finished fiber, back to the current thread's original
/// stack. The departing fiber is reclaimed by the resumed worker routine.
fn exit_to_orig() -> ! {
    let w = worker::current();
    let me = w.curr_fiber.get();
    let orig = w.orig_fiber.get();
    unsafe { fiber::swap(me, orig) };
    unreachable!("fiber resumed after its final swap");
}

fn bind_thread(wid: usize) {
    match core_affinity::get_core_ids() {
        Some(cores) if !cores.is_empty() => {
            let core = cores[wid % cores.len()];
            if !core_affinity::set_for_current(core) {
                log::warn!("worker {wid}: failed to pin to {core:?}");
            }
        }
        _ => log::warn!("worker {wid}: no hardware contexts visible, not pinning"),
    }
}

// ---------------------------------------------------------------------------
// Finish scopes
// ---------------------------------------------------------------------------

/// Open a finish scope on the calling worker. Every task spawned until the
/// matching [`end_finish`] — transitively — must retire before that call
/// returns.
pub fn start_finish() {
    let w = worker::current();
    let parent = w.current_finish.borrow().clone();
    if let Some(parent) = &parent {
        parent.check_in();
    }
    let scope = FinishScope::new(parent);
    *w.current_finish.borrow_mut() = Some(scope);
}

/// Close the innermost finish scope, helping with scheduling until every
/// enclosed task has retired.
pub fn end_finish() {
    let scope = worker::current()
        .current_finish
        .borrow()
        .clone()
        .expect("end_finish without a matching start_finish");

    if scope.count() > 1 {
        help_finish(&scope);
    } else {
        // Only the opener's unit is left; no task can race us here.
        scope.check_out();
    }
    assert_eq!(scope.count(), 0, "finish scope closed with live tasks");

    // Helper mode may have moved us to another worker thread: pop the scope
    // on whichever worker is executing this fiber now.
    let w = worker::current();
    *w.current_finish.borrow_mut() = scope.parent().cloned();
    if let Some(parent) = scope.parent() {
        parent.check_out();
    }
}

/// Run `body` inside a finish scope: `start_finish(); body(); end_finish()`.
pub fn finish<F: FnOnce()>(body: F) {
    start_finish();
    body();
    end_finish();
}

/// Park the current fiber until `scope` drains, scheduling other tasks on
/// this thread in the meantime. See the module docs for the protocol.
fn help_finish(scope: &Arc<FinishScope>) {
    let completion = Promise::new();
    scope.install_completion(completion.clone());
    let dep = completion.dep();
    drop(completion);

    let (parked, stack_size) = {
        let w = worker::current();
        (w.curr_fiber.get(), w.rt().stack_size())
    };

    let helper_scope = Arc::clone(scope);
    let helper = Fiber::create(
        stack_size,
        Box::new(move |me| helper_fiber_main(me, helper_scope, dep)),
    );
    unsafe { fiber::swap(parked, helper) };

    // The escaping resume task swapped us back in — possibly on a different
    // worker thread. The fiber that performed the swap is dead.
    let w = worker::current();
    w.curr_fiber.set(parked);
    unsafe { fiber::destroy((*parked).prev()) };
    scope.take_completion();
}

fn helper_fiber_main(me: *mut Fiber, scope: Arc<FinishScope>, completion: Dep) {
    let parked = {
        let w = worker::current();
        w.curr_fiber.set(me);
        unsafe { (*me).prev() }
    };

    // The resume must escape: were it registered under `scope`, the scope
    // could never reach zero and this fiber would wait forever.
    let resume_to = FiberPtr(parked);
    spawn_escaping_owned(vec![completion], move || {
        let resume_to = resume_to;
        let w = worker::current();
        let me = w.curr_fiber.get();
        unsafe { fiber::swap(me, resume_to.0) };
        unreachable!("help-finish resume task resumed");
    });

    // Release the opener's unit. From here on the scope can reach zero.
    scope.check_out();

    // Nothing owned may survive past this point: this fiber is reclaimed
    // without unwinding once the resume task runs.
    drop(scope);

    worker::work_loop();
    exit_to_orig();
}

// ---------------------------------------------------------------------------
// Spawn operations
// ---------------------------------------------------------------------------

/// Spawn `f` as a task under the current finish scope, on the calling
/// worker's deque.
pub fn spawn<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    let task = make_scoped_task(f);
    worker::schedule_ready(task);
}

/// Spawn `f` under the current finish scope, eligible to run only once
/// every promise in `deps` has been fulfilled.
pub fn spawn_await<F>(deps: &[Dep], f: F)
where
    F: FnOnce() + Send + 'static,
{
    let task = make_scoped_task(f);
    dispatch_with_deps(task, deps.to_vec());
}

/// Spawn `f` outside every finish scope, eligible once `deps` are all
/// fulfilled.
///
/// Escaping tasks are completion machinery: no scope waits for them, so a
/// program that reaches teardown with an unfired escaping task simply never
/// runs it. User code almost always wants [`spawn_await`] instead.
pub fn spawn_escaping<F>(deps: &[Dep], f: F)
where
    F: FnOnce() + Send + 'static,
{
    spawn_escaping_owned(deps.to_vec(), f);
}

fn spawn_escaping_owned<F>(deps: Vec<Dep>, f: F)
where
    F: FnOnce() + Send + 'static,
{
    let task = Task::new_escaping(f);
    dispatch_with_deps(task, deps);
}

/// Spawn `f` under the current finish scope onto `place`'s deque, where
/// workers seated at (or near) `place` will find it first.
pub fn spawn_at<F>(place: PlaceId, f: F)
where
    F: FnOnce() + Send + 'static,
{
    let w = worker::current();
    assert!(
        w.rt().topology().contains(place),
        "spawn_at: {place} is not in the topology"
    );
    let task = make_scoped_task(f);
    worker::push_local(w, place, task);
}

/// Spawn `f` under the current finish scope onto the communication queue.
///
/// # Panics
///
/// Panics if the runtime was launched without
/// [`Config::comm_worker`](crate::config::Config::comm_worker).
pub fn spawn_comm<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    let w = worker::current();
    let comm = w
        .rt()
        .comm
        .as_ref()
        .expect("spawn_comm: communication worker is not enabled");
    let task = make_scoped_task(f);
    comm.push(task);
    w.rt().stats.bump_comm_push();
}

fn make_scoped_task<F>(f: F) -> Box<Task>
where
    F: FnOnce() + Send + 'static,
{
    let w = worker::current();
    let scope = w.current_finish.borrow().clone();
    if let Some(scope) = &scope {
        scope.check_in();
    }
    Task::new(scope, f)
}

fn dispatch_with_deps(task: Box<Task>, deps: Vec<Dep>) {
    if deps.is_empty() {
        worker::schedule_ready(task);
    } else {
        Trigger::new(task, deps).advance();
    }
}

// ---------------------------------------------------------------------------
// Introspection
// ---------------------------------------------------------------------------

/// Size of the worker pool. Must be called from runtime context.
pub fn num_workers() -> usize {
    worker::current().rt().nworkers()
}

/// Id of the worker executing the caller, in `[0, num_workers)`.
///
/// Re-read this after any operation that can suspend; the executing worker
/// can change across a scope boundary.
pub fn current_worker_id() -> usize {
    worker::current().id()
}

/// All place ids in the topology, in descriptor order.
pub fn places() -> Vec<PlaceId> {
    let n = worker::current().rt().topology().nplaces();
    (0..n).map(PlaceId).collect()
}

/// Home place of the worker executing the caller.
pub fn current_place() -> PlaceId {
    worker::current().home()
}
