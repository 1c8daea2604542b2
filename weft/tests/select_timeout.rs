//! Timeout behavior of the poller: a wait on a descriptor that never turns
//! ready completes with zero after its timeout; a zero timeout polls exactly
//! once; an unbounded wait parks until data arrives.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use sequential_test::sequential;
use weft::{Cluster, FdInterest, FdSet, Processor};

fn nonblocking_pipe() -> (i32, i32) {
    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);
    (fds[0], fds[1])
}

fn read_one(fd: i32) -> impl FnMut() -> io::Result<usize> + Send {
    move || {
        let mut byte = 0u8;
        let n = unsafe { libc::read(fd, (&mut byte as *mut u8).cast(), 1) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

#[test]
#[sequential]
fn wait_times_out_with_zero_count() {
    weft::logger::init();
    let cluster = Cluster::new("timeout");
    let _p = Processor::new(&cluster);
    let (rfd, wfd) = nonblocking_pipe();

    let elapsed_us = Arc::new(AtomicU64::new(0));
    let got = Arc::new(AtomicU64::new(u64::MAX));
    let (cluster2, elapsed2, got2) = (cluster.clone(), elapsed_us.clone(), got.clone());
    cluster
        .spawn("timed-reader", move || {
            let begin = Instant::now();
            let n = cluster2
                .poll_fd(
                    rfd,
                    FdInterest::READ,
                    Some(Duration::from_millis(100)),
                    read_one(rfd),
                )
                .expect("poll_fd");
            elapsed2.store(begin.elapsed().as_micros() as u64, Ordering::SeqCst);
            got2.store(n as u64, Ordering::SeqCst);
        })
        .join();

    assert_eq!(got.load(Ordering::SeqCst), 0, "nothing was ever readable");
    let elapsed = elapsed_us.load(Ordering::SeqCst);
    assert!(
        (100_000..150_000).contains(&elapsed),
        "timeout resolved after {elapsed}us"
    );
    unsafe {
        libc::close(rfd);
        libc::close(wfd);
    }
}

#[test]
#[sequential]
fn zero_timeout_polls_exactly_once() {
    weft::logger::init();
    let cluster = Cluster::new("zero-poll");
    let _p = Processor::new(&cluster);
    let (rfd, wfd) = nonblocking_pipe();

    let mut rset = FdSet::new();
    rset.set(rfd);
    let begin = Instant::now();
    let n = cluster
        .select(rfd + 1, Some(&mut rset), None, None, Some(Duration::ZERO))
        .expect("select");
    assert_eq!(n, 0);
    assert!(begin.elapsed() < Duration::from_millis(20));

    // With a byte buffered the same poll reports it immediately.
    assert_eq!(unsafe { libc::write(wfd, b"x".as_ptr().cast(), 1) }, 1);
    let mut rset = FdSet::new();
    rset.set(rfd);
    let n = cluster
        .select(rfd + 1, Some(&mut rset), None, None, Some(Duration::ZERO))
        .expect("select");
    assert_eq!(n, 1);
    assert!(rset.is_set(rfd));
    unsafe {
        libc::close(rfd);
        libc::close(wfd);
    }
}

#[test]
#[sequential]
fn unbounded_wait_parks_until_data() {
    weft::logger::init();
    let cluster = Cluster::new("unbounded");
    let _p = Processor::new(&cluster);
    let (rfd, wfd) = nonblocking_pipe();

    let woke_after_us = Arc::new(AtomicU64::new(0));
    let (cluster2, woke2) = (cluster.clone(), woke_after_us.clone());
    let begin = Instant::now();
    let reader = cluster.spawn("reader", move || {
        let n = cluster2
            .poll_fd(rfd, FdInterest::READ, None, read_one(rfd))
            .expect("poll_fd");
        assert_eq!(n, 1);
        woke2.store(begin.elapsed().as_micros() as u64, Ordering::SeqCst);
    });

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(unsafe { libc::write(wfd, b"x".as_ptr().cast(), 1) }, 1);
    reader.join();

    let woke = woke_after_us.load(Ordering::SeqCst);
    assert!(woke >= 100_000, "reader returned before any data: {woke}us");
    unsafe {
        libc::close(rfd);
        libc::close(wfd);
    }
}
