//! Weft — a work-stealing runtime for fine-grained task parallelism.
//!
//! Programs express parallelism three ways:
//!
//! * **spawn** — [`spawn`] and its variants create asynchronous tasks;
//! * **finish** — [`finish`] (or [`start_finish`]/[`end_finish`]) groups
//!   tasks into scopes that complete only when every transitively spawned
//!   task has retired, without ever blocking a kernel thread;
//! * **promises** — a [`Promise`] is a single-assignment cell, and
//!   [`spawn_await`] makes a task runnable only once its promises are
//!   fulfilled.
//!
//! Under the hood a fixed pool of workers runs a Chase–Lev work-stealing
//! protocol over a tree of places, and every task executes on a stackful
//! fiber so a scope boundary can suspend mid-body while its worker thread
//! keeps scheduling.
//!
//! ```no_run
//! use weft_rt::{launch_with, spawn, finish, Config, Promise};
//!
//! let sum = Promise::new();
//! let out = sum.clone();
//! launch_with(Config::default().workers(4), move || {
//!     finish(|| {
//!         spawn(move || out.put(2 + 2));
//!     });
//! })
//! .unwrap();
//! assert_eq!(*sum.get(), 4);
//! ```

pub mod config;
mod deque;
mod fiber;
mod finish;
pub mod place;
pub mod promise;
pub mod runtime;
pub mod stats;
mod task;
mod worker;

pub use config::{Config, ConfigError};
pub use place::{PlaceDesc, PlaceId, TopologyDesc, TopologyError};
pub use promise::{Dep, Promise};
pub use runtime::{
    current_place, current_worker_id, end_finish, finish, launch, launch_with, num_workers,
    places, spawn, spawn_at, spawn_await, spawn_comm, spawn_escaping, start_finish, RuntimeError,
};
pub use stats::RuntimeStats;
