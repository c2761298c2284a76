//! Finish-scope semantics: root completion, nesting, helper-mode progress,
//! and deep nesting without kernel-stack growth.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use weft_rt::{end_finish, finish, launch_with, spawn, start_finish, Config};

#[test]
fn root_finish_waits_for_ten_thousand_spawns() {
    let counter = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&counter);
    launch_with(Config::default().workers(4), move || {
        for _ in 0..10_000 {
            let c = Arc::clone(&c);
            spawn(move || {
                c.fetch_add(1, Ordering::Relaxed);
            });
        }
    })
    .unwrap();
    assert_eq!(counter.load(Ordering::Relaxed), 10_000);
}

#[test]
fn nested_scopes_complete_inside_out() {
    // Outer spawns A; A opens an inner scope around B and C. B and C must
    // retire before A does, and A before the outer scope closes.
    let b_done = Arc::new(AtomicBool::new(false));
    let c_done = Arc::new(AtomicBool::new(false));
    let a_done = Arc::new(AtomicBool::new(false));

    let (b, c, a) = (
        Arc::clone(&b_done),
        Arc::clone(&c_done),
        Arc::clone(&a_done),
    );
    launch_with(Config::default().workers(4), move || {
        let a_in = Arc::clone(&a);
        finish(move || {
            spawn(move || {
                let (b_in, c_in) = (Arc::clone(&b), Arc::clone(&c));
                finish(move || {
                    spawn(move || {
                        b_in.store(true, Ordering::Release);
                    });
                    spawn(move || {
                        c_in.store(true, Ordering::Release);
                    });
                });
                // The inner scope has closed: both children are visible.
                assert!(b.load(Ordering::Acquire));
                assert!(c.load(Ordering::Acquire));
                a_in.store(true, Ordering::Release);
            });
        });
        assert!(a.load(Ordering::Acquire));
    })
    .unwrap();
    assert!(a_done.load(Ordering::Acquire));
}

#[test]
fn helper_mode_makes_progress_on_one_worker() {
    // With a single worker, end_finish must execute the pending task itself
    // instead of deadlocking on it.
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    launch_with(Config::default().workers(1), move || {
        finish(move || {
            spawn(move || {
                // Enough work to make sure the scope close sees a live task.
                let mut acc = 0u64;
                for i in 0..100_000u64 {
                    acc = acc.wrapping_add(i * i);
                }
                assert!(acc != 0);
                flag.store(true, Ordering::Release);
            });
        });
    })
    .unwrap();
    assert!(ran.load(Ordering::Acquire));
}

#[test]
fn empty_scope_close_is_a_noop() {
    // start_finish(); end_finish() with nothing in between must not disturb
    // the enclosing scope's accounting: spawns before and after still
    // complete, repeatedly.
    let counter = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&counter);
    launch_with(Config::default().workers(2), move || {
        for _ in 0..100 {
            start_finish();
            end_finish();
        }
        for _ in 0..100 {
            let c = Arc::clone(&c);
            spawn(move || {
                c.fetch_add(1, Ordering::Relaxed);
            });
        }
    })
    .unwrap();
    assert_eq!(counter.load(Ordering::Relaxed), 100);
}

fn nest(depth: usize, visited: Arc<AtomicUsize>) {
    visited.fetch_add(1, Ordering::Relaxed);
    finish(move || {
        if depth > 0 {
            spawn(move || nest(depth - 1, visited));
        }
    });
}

#[test]
fn thousand_deep_nesting_closes_cleanly() {
    // Every level parks its fiber in end_finish and hands the thread a
    // fresh helper, so kernel-thread stacks stay flat no matter the depth.
    // Small fiber stacks keep the thousand suspended contexts cheap.
    let visited = Arc::new(AtomicUsize::new(0));
    let v = Arc::clone(&visited);
    launch_with(
        Config::default().workers(2).stack_size(128 * 1024),
        move || nest(1_000, v),
    )
    .unwrap();
    assert_eq!(visited.load(Ordering::Relaxed), 1_001);
}

#[test]
fn sequential_launches_share_a_process() {
    // Teardown must leave the thread reusable: no worker threads alive, no
    // thread-local worker left installed.
    for round in 1..=3 {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        launch_with(Config::default().workers(round), move || {
            for _ in 0..50 {
                let c = Arc::clone(&c);
                spawn(move || {
                    c.fetch_add(1, Ordering::Relaxed);
                });
            }
        })
        .unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 50);
    }
}

#[test]
fn scopes_after_suspension_keep_spawning() {
    // A task that suspends at an inner scope boundary may resume on another
    // worker; spawns issued after the resume must land in the right scope.
    let total = Arc::new(AtomicUsize::new(0));
    let t = Arc::clone(&total);
    launch_with(Config::default().workers(4), move || {
        for _ in 0..8 {
            let t = Arc::clone(&t);
            spawn(move || {
                finish({
                    let t = Arc::clone(&t);
                    move || {
                        for _ in 0..10 {
                            let t = Arc::clone(&t);
                            spawn(move || {
                                t.fetch_add(1, Ordering::Relaxed);
                            });
                        }
                    }
                });
                // Past the inner close: spawn under the root again.
                for _ in 0..5 {
                    let t = Arc::clone(&t);
                    spawn(move || {
                        t.fetch_add(1, Ordering::Relaxed);
                    });
                }
            });
        }
    })
    .unwrap();
    assert_eq!(total.load(Ordering::Relaxed), 8 * 15);
}
