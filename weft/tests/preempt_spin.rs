//! A task that never yields must still lose the processor to the preemption
//! timer, and observe a flag set by its neighbor promptly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use weft::{Cluster, Processor};

#[test]
fn preempted_spinner_sees_flag() {
    weft::logger::init();
    let cluster = Cluster::new("preempt");
    // One processor, 10 ms preemption: the spinner and setter share it.
    let _p = Processor::with_config(&cluster, 10, 100);

    let start = Instant::now();
    let flag = Arc::new(AtomicBool::new(false));
    let set_at_us = Arc::new(AtomicU64::new(0));
    let seen_at_us = Arc::new(AtomicU64::new(0));

    let (flag_r, seen) = (flag.clone(), seen_at_us.clone());
    let spinner = cluster.spawn("spinner", move || {
        while !flag_r.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
        seen.store(start.elapsed().as_micros() as u64, Ordering::SeqCst);
    });

    let (flag_w, set) = (flag.clone(), set_at_us.clone());
    let setter = cluster.spawn("setter", move || {
        weft::sleep(Duration::from_millis(50));
        set.store(start.elapsed().as_micros() as u64, Ordering::SeqCst);
        flag_w.store(true, Ordering::Release);
    });

    spinner.join();
    setter.join();

    let set_at = set_at_us.load(Ordering::SeqCst);
    let seen_at = seen_at_us.load(Ordering::SeqCst);
    assert!(set_at >= 50_000, "setter fired early: {set_at}us");
    assert!(
        seen_at >= set_at && seen_at - set_at < 60_000,
        "spinner took {}us to notice the flag",
        seen_at - set_at
    );
}
