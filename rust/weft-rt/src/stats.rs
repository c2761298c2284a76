//! Runtime statistics: per-worker counters and the end-of-run report.
//!
//! Counters are one cache line per worker so the hot paths never contend;
//! the only global counter is the communication-queue push count. Time is
//! accumulated in nanoseconds with relaxed atomics — a task that suspends
//! and resumes elsewhere has its whole duration attributed to the worker
//! that started it, which keeps the fast path cheap and is close enough for
//! a profile-shaped report.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_utils::CachePadded;

// ---------------------------------------------------------------------------
// Per-worker counters
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct WorkerCounters {
    pub(crate) pushes: AtomicU64,
    pub(crate) pops: AtomicU64,
    pub(crate) steals: AtomicU64,
    pub(crate) inline_execs: AtomicU64,
    work_ns: AtomicU64,
    search_ns: AtomicU64,
    overhead_ns: AtomicU64,
}

impl WorkerCounters {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_work(&self, d: Duration) {
        self.work_ns.fetch_add(d.as_nanos() as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_search(&self, d: Duration) {
        self.search_ns
            .fetch_add(d.as_nanos() as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_overhead(&self, d: Duration) {
        self.overhead_ns
            .fetch_add(d.as_nanos() as u64, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub(crate) struct StatsRegistry {
    workers: Vec<CachePadded<WorkerCounters>>,
    comm_pushes: AtomicU64,
}

impl StatsRegistry {
    pub(crate) fn new(nworkers: usize) -> Self {
        Self {
            workers: (0..nworkers)
                .map(|_| CachePadded::new(WorkerCounters::default()))
                .collect(),
            comm_pushes: AtomicU64::new(0),
        }
    }

    pub(crate) fn worker(&self, id: usize) -> &WorkerCounters {
        &self.workers[id]
    }

    pub(crate) fn bump_comm_push(&self) {
        self.comm_pushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, elapsed: Duration) -> RuntimeStats {
        let n = self.workers.len().max(1) as u64;
        let sum = |f: fn(&WorkerCounters) -> &AtomicU64| {
            self.workers
                .iter()
                .map(|w| f(w).load(Ordering::Relaxed))
                .sum::<u64>()
        };
        RuntimeStats {
            elapsed,
            workers: self.workers.len(),
            comm_pushes: self.comm_pushes.load(Ordering::Relaxed),
            local_pushes: sum(|w| &w.pushes),
            pops: sum(|w| &w.pops),
            steals: sum(|w| &w.steals),
            inline_execs: sum(|w| &w.inline_execs),
            avg_work: Duration::from_nanos(sum(|w| &w.work_ns) / n),
            avg_search: Duration::from_nanos(sum(|w| &w.search_ns) / n),
            avg_overhead: Duration::from_nanos(sum(|w| &w.overhead_ns) / n),
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Totals for one run, returned by
/// [`launch_with`](crate::runtime::launch_with).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Wall-clock time between launch and teardown.
    pub elapsed: Duration,
    /// Worker pool size.
    pub workers: usize,
    /// Tasks pushed onto the communication queue.
    pub comm_pushes: u64,
    /// Tasks pushed onto worker deques, summed across workers.
    pub local_pushes: u64,
    /// Tasks taken by their owning worker.
    pub pops: u64,
    /// Tasks taken from another worker's deque.
    pub steals: u64,
    /// Tasks executed in place because a deque was full.
    pub inline_execs: u64,
    /// Mean per-worker time spent inside task bodies.
    pub avg_work: Duration,
    /// Mean per-worker time spent in scheduler bookkeeping.
    pub avg_overhead: Duration,
    /// Mean per-worker time spent searching for work.
    pub avg_search: Duration,
}

const REPORT_HEADER: &str = "==================== weft runtime statistics ====================";
const REPORT_FOOTER: &str = "-------------------- end weft runtime statistics ----------------";

impl RuntimeStats {
    /// Print the terminal statistics block: a fixed header, the column
    /// names, one tab-separated data line, and a fixed footer.
    pub fn print_report(&self) {
        println!("{REPORT_HEADER}");
        println!("time.ms\tcommPush\tlocalPush\tsteals\ttWork\ttOverhead\ttSearch");
        println!(
            "{:.3}\t{}\t{}\t{}\t{:.4}\t{:.4}\t{:.5}",
            self.elapsed.as_secs_f64() * 1e3,
            self.comm_pushes,
            self.local_pushes,
            self.steals,
            self.avg_work.as_secs_f64() * 1e3,
            self.avg_overhead.as_secs_f64() * 1e3,
            self.avg_search.as_secs_f64() * 1e3,
        );
        println!("{REPORT_FOOTER}");
    }
}

impl fmt::Display for RuntimeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} workers, {:.3} ms, {} pushes ({} comm), {} pops, {} steals, {} inline",
            self.workers,
            self.elapsed.as_secs_f64() * 1e3,
            self.local_pushes,
            self.comm_pushes,
            self.pops,
            self.steals,
            self.inline_execs,
        )
    }
}
