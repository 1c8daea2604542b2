//! Coroutine laws: resume/suspend duality, resumption events searching the
//! dynamic resumer chain, nonlocal delivery, and backward propagation of an
//! escaped panic.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use weft::resume::{RaiseInfo, ResumeEvent, handle, raise};
use weft::{Cluster, Coroutine, CoroutineState, Processor};

struct Probe {
    answer: u32,
}

impl ResumeEvent for Probe {}

fn runtime(name: &str) -> (Cluster, Processor) {
    weft::logger::init();
    let cluster = Cluster::new(name);
    let p = Processor::new(&cluster);
    (cluster, p)
}

#[test]
fn suspend_returns_to_resumer_repeatedly() {
    let (cluster, _p) = runtime("duality");
    cluster
        .spawn("driver", || {
            let ticks = Arc::new(AtomicU32::new(0));
            let t = ticks.clone();
            let generator = Coroutine::new("generator", move || {
                for _ in 0..5 {
                    t.fetch_add(1, Ordering::SeqCst);
                    weft::suspend();
                }
            });
            for round in 1..=5 {
                generator.resume();
                assert_eq!(ticks.load(Ordering::SeqCst), round);
            }
            // The sixth resume lets the main run off its end.
            generator.resume();
            assert_eq!(generator.state(), CoroutineState::Halt);
        })
        .join();
}

#[test]
fn resumption_searches_the_resumer_chain() {
    let (cluster, _p) = runtime("chain");
    cluster
        .spawn("outer", || {
            let answer = Arc::new(AtomicU32::new(0));
            let source_ok = Arc::new(AtomicBool::new(false));

            let source_ok2 = source_ok.clone();
            let mut handler = move |e: &mut Probe, info: &RaiseInfo| {
                e.answer = 42;
                source_ok2.store(info.source_name() == "C", Ordering::SeqCst);
            };
            let _scope = handle::<Probe, _>(&mut handler);

            let answer2 = answer.clone();
            let c = Coroutine::new("C", move || {
                // No handler here or in B: the chain search lands on the
                // outer task's handler.
                let e = raise(Probe { answer: 0 }).expect("handled along the chain");
                answer2.store(e.answer, Ordering::SeqCst);
            });
            let b = Coroutine::new("B", move || {
                c.resume();
            });
            b.resume();

            assert_eq!(answer.load(Ordering::SeqCst), 42);
            assert!(source_ok.load(Ordering::SeqCst), "handler saw the raiser");
        })
        .join();
}

#[test]
fn nonlocal_event_delivered_at_poll_point() {
    let (cluster, _p) = runtime("nonlocal");
    let delivered = Arc::new(AtomicU32::new(0));

    let d = delivered.clone();
    let listener = cluster.spawn("listener", move || {
        let d2 = d.clone();
        let mut handler = move |e: &mut Probe, _info: &RaiseInfo| {
            d2.store(e.answer, Ordering::SeqCst);
        };
        let _scope = handle::<Probe, _>(&mut handler);
        let _enable = weft::resume::enable::<Probe>();
        while d.load(Ordering::SeqCst) == 0 {
            weft::yield_now();
        }
    });

    std::thread::sleep(std::time::Duration::from_millis(50));
    listener.raise_at(Probe { answer: 7 });
    listener.join();
    assert_eq!(delivered.load(Ordering::SeqCst), 7);
}

#[test]
fn escaped_panic_rethrows_at_the_resumer() {
    let (cluster, _p) = runtime("escape");
    cluster
        .spawn("resumer", || {
            let bomber = Coroutine::new("bomber", || {
                panic!("boom");
            });
            let err = catch_unwind(AssertUnwindSafe(|| bomber.resume()))
                .expect_err("the coroutine's panic arrives here");
            let forwarded = err
                .downcast::<weft::UnhandledPanic>()
                .expect("escaped panics arrive wrapped");
            assert_eq!(forwarded.source_name(), "bomber");
            assert_eq!(forwarded.hops(), 1);
            let payload = forwarded.into_payload();
            assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
            assert_eq!(bomber.state(), CoroutineState::Halt);
        })
        .join();
}
