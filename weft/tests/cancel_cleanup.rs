//! Cancellation: forced unwinding runs cleanup handlers newest-first, a
//! second cancel is a no-op, and a disabled cancel state defers delivery.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use sequential_test::sequential;
use weft::{Cluster, Processor};

fn runtime() -> (Cluster, Processor) {
    weft::logger::init();
    let cluster = Cluster::new("cancel");
    let p = Processor::new(&cluster);
    (cluster, p)
}

#[test]
#[sequential]
fn cleanups_run_in_reverse_order_once() {
    let (cluster, _p) = runtime();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let order_t = order.clone();
    let victim = cluster.spawn("victim", move || {
        for tag in [1u32, 2, 3] {
            let order_t = order_t.clone();
            weft::cleanup_push(move || order_t.lock().unwrap().push(tag));
        }
        loop {
            weft::yield_now();
        }
    });

    // Give the task time to install its handlers before cancelling.
    std::thread::sleep(std::time::Duration::from_millis(50));
    victim.cancel();
    victim.cancel(); // idempotent: same effect as one
    victim.join();

    assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
}

#[test]
#[sequential]
fn disabled_cancellation_is_deferred() {
    let (cluster, _p) = runtime();
    let progressed = Arc::new(AtomicUsize::new(0));
    let unwound = Arc::new(AtomicBool::new(false));

    let (progressed_t, unwound_t) = (progressed.clone(), unwound.clone());
    let task = cluster.spawn("shielded", move || {
        let unwound_t2 = unwound_t.clone();
        weft::cleanup_push(move || unwound_t2.store(true, Ordering::SeqCst));
        weft::cancel::set_enabled(false);
        // The mark arrives somewhere in here; none of these polls may act
        // on it while delivery is disabled.
        for _ in 0..200 {
            weft::yield_now();
            progressed_t.fetch_add(1, Ordering::SeqCst);
        }
        weft::cancel::set_enabled(true);
        loop {
            weft::yield_now();
        }
    });

    std::thread::sleep(std::time::Duration::from_millis(20));
    task.cancel();
    task.join();

    assert_eq!(progressed.load(Ordering::SeqCst), 200);
    assert!(unwound.load(Ordering::SeqCst));
}

#[test]
#[sequential]
fn cleanup_pop_executes_or_discards() {
    let (cluster, _p) = runtime();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    cluster
        .spawn("popper", move || {
            let h1 = h.clone();
            weft::cleanup_push(move || {
                h1.fetch_add(1, Ordering::SeqCst);
            });
            let h2 = h.clone();
            weft::cleanup_push(move || {
                h2.fetch_add(10, Ordering::SeqCst);
            });
            weft::cleanup_pop(false); // discarded
            weft::cleanup_pop(true); // executed
        })
        .join();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
