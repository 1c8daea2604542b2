//! Scheduler-facing behavior: sleeping, migration, bound tasks, processor
//! control commands, and the blocking primitives.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use sequential_test::sequential;
use weft::sync::{Condvar, Mutex, OwnerLock, Semaphore};
use weft::{Cluster, Processor};

#[test]
#[sequential]
fn sleep_blocks_for_the_duration() {
    weft::logger::init();
    let cluster = Cluster::new("sleep");
    let _p = Processor::new(&cluster);
    let elapsed_us = Arc::new(AtomicU64::new(0));
    let e = elapsed_us.clone();
    cluster
        .spawn("sleeper", move || {
            let begin = Instant::now();
            weft::sleep(Duration::from_millis(100));
            e.store(begin.elapsed().as_micros() as u64, Ordering::SeqCst);
        })
        .join();
    let elapsed = elapsed_us.load(Ordering::SeqCst);
    assert!((100_000..200_000).contains(&elapsed), "slept {elapsed}us");
}

#[test]
#[sequential]
fn migration_moves_a_task_between_clusters() {
    weft::logger::init();
    let home = Cluster::new("home");
    let away = Cluster::new("away");
    let _p1 = Processor::new(&home);
    let _p2 = Processor::new(&away);

    let moved = Arc::new(AtomicBool::new(false));
    let hold = Arc::new(AtomicBool::new(true));
    let (away2, moved2, hold2) = (away.clone(), moved.clone(), hold.clone());
    let traveler = home.spawn("traveler", move || {
        weft::migrate(&away2);
        moved2.store(true, Ordering::SeqCst);
        while hold2.load(Ordering::SeqCst) {
            weft::yield_now();
        }
    });

    while !moved.load(Ordering::SeqCst) {
        std::thread::yield_now();
    }
    // Settled on the target cluster: counted there, not at home.
    assert_eq!(away.task_count(), 2, "traveler plus the processor task");
    assert_eq!(home.task_count(), 1, "only the home processor task");
    hold.store(false, Ordering::SeqCst);
    traveler.join();
}

#[test]
#[sequential]
fn bound_task_runs_on_its_processor() {
    weft::logger::init();
    let cluster = Cluster::new("bound");
    let _p1 = Processor::new(&cluster);
    let p2 = Processor::new(&cluster);

    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    cluster
        .task_builder("pinned")
        .bound_to(&p2)
        .spawn(move || {
            for _ in 0..10 {
                weft::yield_now();
            }
            r.store(true, Ordering::SeqCst);
        })
        .join();
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
#[sequential]
fn processor_control_commands_apply() {
    weft::logger::init();
    let first = Cluster::new("first");
    let second = Cluster::new("second");
    let p = Processor::with_config(&first, 10, 200);

    p.set_preemption(5);
    p.set_affinity(&[0]);
    p.set_cluster(&second);

    // The processor now serves the second cluster.
    let done = Arc::new(AtomicBool::new(false));
    let d = done.clone();
    second
        .spawn("relocated", move || {
            d.store(true, Ordering::SeqCst);
        })
        .join();
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(second.processor_count(), 1);
    assert_eq!(first.processor_count(), 0);
}

#[test]
#[sequential]
fn semaphore_timed_wait_expires() {
    weft::logger::init();
    let cluster = Cluster::new("sem");
    let _p = Processor::new(&cluster);
    let outcome = Arc::new(AtomicU32::new(u32::MAX));
    let o = outcome.clone();
    cluster
        .spawn("timed-p", move || {
            let sem = Semaphore::new(0);
            let begin = Instant::now();
            let got = sem.p_for(Duration::from_millis(80));
            assert!(begin.elapsed() >= Duration::from_millis(80));
            o.store(got as u32, Ordering::SeqCst);
        })
        .join();
    assert_eq!(outcome.load(Ordering::SeqCst), 0, "empty semaphore times out");
}

#[test]
#[sequential]
fn semaphore_handoff_and_condvar() {
    weft::logger::init();
    let cluster = Cluster::new("handoff");
    let _p1 = Processor::new(&cluster);
    let _p2 = Processor::new(&cluster);

    // Baton pass: each P atomically Vs the other side.
    let here = Arc::new(Semaphore::new(0));
    let there = Arc::new(Semaphore::new(0));
    let laps = Arc::new(AtomicU32::new(0));

    let (here2, there2, laps2) = (here.clone(), there.clone(), laps.clone());
    let runner = cluster.spawn("baton-runner", move || {
        for _ in 0..100 {
            here2.p_with_v(&there2);
            laps2.fetch_add(1, Ordering::SeqCst);
        }
    });
    let (here3, there3) = (here.clone(), there.clone());
    let partner = cluster.spawn("baton-partner", move || {
        for _ in 0..100 {
            there3.p_with_v(&here3);
        }
    });
    runner.join();
    partner.join();
    assert_eq!(laps.load(Ordering::SeqCst), 100);

    // Condvar: producer fills, broadcast wakes every consumer.
    let slots = Arc::new(Mutex::new(0u32));
    let ready = Arc::new(Condvar::new());
    let served = Arc::new(AtomicU32::new(0));
    let consumers: Vec<_> = (0..4)
        .map(|i| {
            let (slots, ready, served) = (slots.clone(), ready.clone(), served.clone());
            cluster.spawn(&format!("consumer-{i}"), move || {
                let mut guard = slots.lock();
                while *guard == 0 {
                    guard = ready.wait(guard);
                }
                served.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    cluster
        .spawn("producer", move || {
            weft::sleep(Duration::from_millis(20));
            *slots.lock() = 1;
            ready.broadcast();
        })
        .detach();
    for c in consumers {
        c.join();
    }
    assert_eq!(served.load(Ordering::SeqCst), 4);
}

#[test]
#[sequential]
fn owner_lock_recursion() {
    weft::logger::init();
    let cluster = Cluster::new("owner");
    let _p = Processor::new(&cluster);
    cluster
        .spawn("recursive", || {
            let lock = OwnerLock::new();
            lock.acquire();
            lock.acquire();
            assert_eq!(lock.times(), 2);
            assert!(lock.try_acquire());
            lock.release();
            lock.release();
            lock.release();
            assert_eq!(lock.times(), 0);
        })
        .join();
}

#[test]
#[sequential]
fn custom_ready_queue_cluster() {
    weft::logger::init();
    let cluster = Cluster::builder("custom")
        .stack_size(128 * 1024)
        .ready_queue(Box::new(weft::sched::FifoQueue::new()))
        .build();
    let _p = Processor::new(&cluster);
    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    cluster
        .spawn("on-custom", move || r.store(true, Ordering::SeqCst))
        .join();
    assert!(ran.load(Ordering::SeqCst));
}
