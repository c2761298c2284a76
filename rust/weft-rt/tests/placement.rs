//! Place-targeted spawning over a hierarchical topology, and the
//! communication-worker queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use weft_rt::{
    current_place, current_worker_id, launch_with, num_workers, places, spawn, spawn_at,
    spawn_comm, Config, TopologyDesc,
};

fn two_sockets() -> TopologyDesc {
    TopologyDesc::parse(
        r#"
        [[place]]
        workers = 0

        [[place]]
        parent = 0
        workers = 2

        [[place]]
        parent = 0
        workers = 2
    "#,
    )
    .unwrap()
}

#[test]
fn hierarchical_topology_runs_tasks_everywhere() {
    let counter = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&counter);
    launch_with(Config::default().topology(two_sockets()), move || {
        assert_eq!(num_workers(), 4);
        assert_eq!(places().len(), 3);

        for place in places() {
            for _ in 0..25 {
                let c = Arc::clone(&c);
                spawn_at(place, move || {
                    c.fetch_add(1, Ordering::Relaxed);
                });
            }
        }
    })
    .unwrap();
    assert_eq!(counter.load(Ordering::Relaxed), 75);
}

#[test]
fn workers_report_their_seats() {
    launch_with(Config::default().topology(two_sockets()), move || {
        // The entry task runs on worker 0, seated at the first socket.
        assert_eq!(current_worker_id(), 0);
        let home = current_place();
        assert!(places().contains(&home));
    })
    .unwrap();
}

#[test]
fn spawn_at_current_place_behaves_like_spawn() {
    let counter = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&counter);
    launch_with(Config::default().workers(2), move || {
        let here = current_place();
        for _ in 0..100 {
            let c = Arc::clone(&c);
            spawn_at(here, move || {
                c.fetch_add(1, Ordering::Relaxed);
            });
        }
    })
    .unwrap();
    assert_eq!(counter.load(Ordering::Relaxed), 100);
}

#[test]
fn comm_tasks_run_on_the_designated_worker() {
    let ran = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&ran);
    let stats = launch_with(
        Config::default().workers(3).comm_worker(true),
        move || {
            for _ in 0..64 {
                let c = Arc::clone(&c);
                spawn_comm(move || {
                    // Only the designated worker drains the comm queue.
                    assert_eq!(current_worker_id(), 0);
                    c.fetch_add(1, Ordering::Relaxed);
                });
            }
        },
    )
    .unwrap();
    assert_eq!(ran.load(Ordering::Relaxed), 64);
    assert_eq!(stats.comm_pushes, 64);
}

#[test]
fn comm_spawns_from_every_worker_are_delivered() {
    let ran = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&ran);
    let stats = launch_with(
        Config::default().workers(4).comm_worker(true),
        move || {
            // Fan out ordinary tasks which each push one comm task, so the
            // pushes come from many workers.
            for _ in 0..32 {
                let c = Arc::clone(&c);
                spawn(move || {
                    let c = Arc::clone(&c);
                    spawn_comm(move || {
                        assert_eq!(current_worker_id(), 0);
                        c.fetch_add(1, Ordering::Relaxed);
                    });
                });
            }
        },
    )
    .unwrap();
    assert_eq!(ran.load(Ordering::Relaxed), 32);
    assert_eq!(stats.comm_pushes, 32);
}
