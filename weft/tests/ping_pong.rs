//! Two tasks alternate incrementing a shared counter under a task mutex,
//! across two processors.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use weft::sync::Mutex;
use weft::{Cluster, Processor};

const ITERATIONS: u64 = 1_000_000;

#[test]
fn ping_pong_counter() {
    weft::logger::init();
    let cluster = Cluster::new("ping-pong");
    let _p1 = Processor::new(&cluster);
    let _p2 = Processor::new(&cluster);

    let counter = Arc::new(Mutex::new(0u64));

    let spawn_incrementer = |name: &str| {
        let counter = counter.clone();
        cluster.spawn(name, move || {
            for _ in 0..ITERATIONS {
                *counter.lock() += 1;
            }
        })
    };
    let ping = spawn_incrementer("ping");
    let pong = spawn_incrementer("pong");
    ping.join();
    pong.join();

    // The final read has to happen on a task as well.
    let result = Arc::new(AtomicU64::new(0));
    let (counter2, result2) = (counter.clone(), result.clone());
    cluster
        .spawn("check", move || {
            result2.store(*counter2.lock(), Ordering::SeqCst);
        })
        .join();
    assert_eq!(result.load(Ordering::SeqCst), 2 * ITERATIONS);
}
