//! Ten tasks wait for the same pipe descriptor. One written byte wakes
//! exactly one of them; the rest keep waiting with their interest re-armed.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use weft::{Cluster, FdInterest, Processor};

fn nonblocking_pipe() -> (i32, i32) {
    let mut fds = [0i32; 2];
    let r = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
    assert_eq!(r, 0, "pipe2: {}", io::Error::last_os_error());
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
fn one_reader_wins_per_byte() {
    weft::logger::init();
    let cluster = Cluster::new("select-race");
    let _p1 = Processor::new(&cluster);
    let _p2 = Processor::new(&cluster);

    let (rfd, wfd) = nonblocking_pipe();
    let winners = Arc::new(AtomicUsize::new(0));

    let readers: Vec<_> = (0..10)
        .map(|i| {
            let cluster2 = cluster.clone();
            let winners = winners.clone();
            cluster.spawn(&format!("reader-{i}"), move || {
                let n = cluster2
                    .poll_fd(rfd, FdInterest::READ, None, read_one(rfd))
                    .expect("poll_fd");
                assert_eq!(n, 1, "reader got an unexpected count");
                winners.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    // Let every reader register and block, then feed one byte.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(winners.load(Ordering::SeqCst), 0);
    assert_eq!(unsafe { libc::write(wfd, b"x".as_ptr().cast(), 1) }, 1);

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(
        winners.load(Ordering::SeqCst),
        1,
        "exactly one reader should consume the byte"
    );

    // Release the other nine.
    assert_eq!(unsafe { libc::write(wfd, b"abcdefghi".as_ptr().cast(), 9) }, 9);
    for reader in readers {
        reader.join();
    }
    assert_eq!(winners.load(Ordering::SeqCst), 10);

    unsafe {
        libc::close(rfd);
        libc::close(wfd);
    }
}
