//! Two tasks batting a baton back and forth across two processors.

use std::sync::Arc;

use weft::sync::Semaphore;
use weft::{Cluster, Processor};

const LAPS: u32 = 100_000;

fn main() {
    weft::logger::init();
    let cluster = Cluster::new("ping-pong");
    let _p1 = Processor::new(&cluster);
    let _p2 = Processor::new(&cluster);

    let ping = Arc::new(Semaphore::new(1));
    let pong = Arc::new(Semaphore::new(0));

    let (a_in, a_out) = (ping.clone(), pong.clone());
    let a = cluster.spawn("ping", move || {
        for _ in 0..LAPS {
            a_in.p();
            a_out.v();
        }
    });
    let (b_in, b_out) = (pong.clone(), ping.clone());
    let b = cluster.spawn("pong", move || {
        for _ in 0..LAPS {
            b_in.p();
            b_out.v();
        }
    });

    let start = std::time::Instant::now();
    a.join();
    b.join();
    let elapsed = start.elapsed();
    println!(
        "{LAPS} laps in {elapsed:?} ({:.0} ns per handoff)",
        elapsed.as_nanos() as f64 / (2.0 * LAPS as f64)
    );
}
