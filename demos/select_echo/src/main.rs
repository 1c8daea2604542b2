//! A reader task waiting on a pipe through the cluster poller, fed by a
//! producer task sleeping between writes.

use std::io;
use std::time::Duration;

use weft::{Cluster, FdInterest, Processor};

fn nonblocking_pipe() -> (i32, i32) {
    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);
    (fds[0], fds[1])
}

fn main() {
    weft::logger::init();
    let cluster = Cluster::new("echo");
    let _p = Processor::new(&cluster);
    let (rfd, wfd) = nonblocking_pipe();

    let reader_cluster = cluster.clone();
    let reader = cluster.spawn("reader", move || {
        let mut line = Vec::new();
        loop {
            let mut buf = [0u8; 64];
            let n = reader_cluster
                .poll_fd(rfd, FdInterest::READ, None, || {
                    let n = unsafe { libc::read(rfd, buf.as_mut_ptr().cast(), buf.len()) };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                })
                .expect("poll_fd");
            if n == 0 {
                break; // writer hung up
            }
            line.extend_from_slice(&buf[..n]);
            if let Some(at) = line.iter().position(|b| *b == b'\n') {
                print!("echo: {}", String::from_utf8_lossy(&line[..=at]));
                line.drain(..=at);
            }
        }
    });

    cluster
        .spawn("producer", move || {
            for word in ["weft\n", "clusters\n", "processors\n", "tasks\n"] {
                weft::sleep(Duration::from_millis(100));
                unsafe { libc::write(wfd, word.as_ptr().cast(), word.len()) };
            }
            unsafe { libc::close(wfd) };
        })
        .detach();

    reader.join();
    unsafe { libc::close(rfd) };
}
