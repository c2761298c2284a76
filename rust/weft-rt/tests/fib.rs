//! End-to-end Fibonacci over promises: one promise per recursive call,
//! combining tasks gated on dependency triggers. The result must not depend
//! on the worker count.

use weft_rt::{finish, launch_with, spawn, spawn_await, Config, Promise};

fn fib(n: u64, res: Promise<u64>) {
    if n <= 1 {
        res.put(n);
        return;
    }

    let f1 = Promise::new();
    let f2 = Promise::new();
    {
        let f1 = f1.clone();
        spawn(move || fib(n - 1, f1));
    }
    fib(n - 2, f2.clone());

    let deps = [f1.dep(), f2.dep()];
    spawn_await(&deps, move || {
        res.put(*f1.get() + *f2.get());
    });
}

fn run_fib(n: u64, workers: usize) -> u64 {
    let result = Promise::new();
    let out = result.clone();
    launch_with(Config::default().workers(workers), move || {
        finish(|| fib(n, out));
    })
    .unwrap();
    *result.get()
}

#[test]
fn fib_10_single_worker() {
    assert_eq!(run_fib(10, 1), 55);
}

#[test]
fn fib_10_eight_workers() {
    assert_eq!(run_fib(10, 8), 55);
}

#[test]
fn fib_20_single_worker() {
    assert_eq!(run_fib(20, 1), 6765);
}

#[test]
fn fib_20_eight_workers() {
    assert_eq!(run_fib(20, 8), 6765);
}

#[test]
fn fib_matches_across_worker_counts() {
    let reference = run_fib(15, 1);
    for workers in [2, 4, 8] {
        assert_eq!(run_fib(15, workers), reference);
    }
}
