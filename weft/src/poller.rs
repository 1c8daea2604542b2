//! The per-cluster non-blocking I/O poller.
//!
//! Tasks that hit `EWOULDBLOCK` register interest and block on a per-call
//! semaphore; the first waiter becomes the *poller task* and issues `pselect`
//! on behalf of everyone. Interest lives in two bitset families: `single`
//! masks for plain one-descriptor waits (indexed per-fd wait lists) and
//! `multi` masks for full-set selects and any wait carrying a timeout (one
//! pending list, rescanned each cycle). Both merge into `master` sets before
//! each `pselect`.
//!
//! The poller decides between a zero-timeout poll (work is visible on the
//! cluster, other tasks deserve the processor back quickly) and an unbounded
//! wait. The unbounded wait uses the signal-mask bracket: SIGALRM/SIGUSR1
//! are blocked before the poller publishes itself as blocked, and `pselect`
//! atomically re-opens the saved mask, so a wake signalled in between stays
//! pending and surfaces as EINTR instead of being lost.
//!
//! Completed descriptors are consumed on the poller's stack: each waiter's
//! action closure (the actual system call) runs there, and an action that
//! reports `EWOULDBLOCK` lost the race to another waiter on the same
//! descriptor — its interest stays armed and it keeps waiting. This is what
//! gives the one-winner guarantee when several tasks watch one descriptor.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use spin::Mutex;

use crate::cancel;
use crate::cluster::ClusterCore;
use crate::preempt::{self, Expire, interrupts};
use crate::sync::Semaphore;
use crate::task::{self, TaskCore};
use crate::{kabort, local, signals};

/// Highest descriptor count `select` can express.
pub const SETSIZE: usize = libc::FD_SETSIZE as usize;

const WORD_BITS: usize = 8 * core::mem::size_of::<libc::c_ulong>();
const WORDS: usize = SETSIZE / WORD_BITS;

bitflags! {
    /// Readiness directions for a single-descriptor wait.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct FdInterest: u8 {
        const READ = 1;
        const WRITE = 2;
        const EXCEPT = 4;
    }
}

/// A descriptor bitset, layout-compatible with `libc::fd_set` so whole-word
/// merges and splits work without per-bit traffic.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FdSet {
    bits: [libc::c_ulong; WORDS],
}

const _: () = assert!(core::mem::size_of::<FdSet>() == core::mem::size_of::<libc::fd_set>());

impl FdSet {
    pub const fn new() -> FdSet {
        FdSet { bits: [0; WORDS] }
    }

    pub fn set(&mut self, fd: i32) {
        let fd = fd as usize;
        self.bits[fd / WORD_BITS] |= 1 << (fd % WORD_BITS);
    }

    pub fn clear(&mut self, fd: i32) {
        let fd = fd as usize;
        self.bits[fd / WORD_BITS] &= !(1 << (fd % WORD_BITS));
    }

    pub fn is_set(&self, fd: i32) -> bool {
        let fd = fd as usize;
        self.bits[fd / WORD_BITS] & (1 << (fd % WORD_BITS)) != 0
    }

    pub fn zero(&mut self) {
        self.bits = [0; WORDS];
    }

    fn or_up_to(&mut self, other: &FdSet, nfds: usize) {
        for w in 0..nfds.div_ceil(WORD_BITS) {
            self.bits[w] |= other.bits[w];
        }
    }

    fn and_with(&mut self, other: &FdSet, nfds: usize) {
        let words = nfds.div_ceil(WORD_BITS);
        for w in 0..words {
            self.bits[w] &= other.bits[w];
        }
        for w in words..WORDS {
            self.bits[w] = 0;
        }
    }

    fn count_up_to(&self, nfds: usize) -> usize {
        let mut n = 0;
        for w in 0..nfds.div_ceil(WORD_BITS) {
            n += self.bits[w].count_ones() as usize;
        }
        n
    }

    fn as_raw(&mut self) -> *mut libc::fd_set {
        self as *mut FdSet as *mut libc::fd_set
    }
}

impl Default for FdSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Recompute an nfds bound by scanning backward from the previous bound over
/// the three masks until a set bit is found.
fn rescan_nfds(sets: &[FdSet; 3], from: usize) -> usize {
    for fd in (0..from).rev() {
        if sets.iter().any(|s| s.is_set(fd as i32)) {
            return fd + 1;
        }
    }
    0
}

fn ready_dirs(ready: &[FdSet; 3], fd: usize) -> FdInterest {
    let mut dirs = FdInterest::empty();
    if ready[0].is_set(fd as i32) {
        dirs |= FdInterest::READ;
    }
    if ready[1].is_set(fd as i32) {
        dirs |= FdInterest::WRITE;
    }
    if ready[2].is_set(fd as i32) {
        dirs |= FdInterest::EXCEPT;
    }
    dirs
}

type IoAction = dyn FnMut() -> io::Result<usize> + Send;

struct IoDone {
    complete: bool,
    result: Option<io::Result<usize>>,
}

enum IoKind {
    Single {
        fd: usize,
        interest: FdInterest,
        /// The waiter's system call, run on the poller's stack. Points into
        /// the waiter's frame, which stays alive until completion wakes it.
        action: *mut IoAction,
        timed: bool,
    },
    Multi {
        nfds: usize,
        req: [FdSet; 3],
        out: Mutex<[FdSet; 3]>,
    },
}

pub(crate) struct IoWait {
    task: Arc<TaskCore>,
    sem: Semaphore,
    done: Mutex<IoDone>,
    timed_out: AtomicBool,
    nominated: AtomicBool,
    kind: IoKind,
}

// Safety: the action pointer is dereferenced only by the poller while the
// owning waiter is blocked; the node itself is shared state behind locks.
unsafe impl Send for IoWait {}
unsafe impl Sync for IoWait {}

impl IoWait {
    fn is_complete(&self) -> bool {
        interrupts::disable();
        let complete = self.done.lock().complete;
        interrupts::enable();
        complete
    }
}

struct PollerInner {
    single: [FdSet; 3],
    multi: [FdSet; 3],
    master: [FdSet; 3],
    single_nfds: usize,
    multi_nfds: usize,
    single_waiters: Vec<VecDeque<Arc<IoWait>>>,
    pending: VecDeque<Arc<IoWait>>,
    poller: Option<Arc<IoWait>>,
}

pub(crate) struct PollerState {
    inner: Mutex<PollerInner>,
    /// Kernel thread currently inside the unbounded `pselect`, if any.
    /// Outside `inner`: completion wakeups read it while `inner` is held.
    blocked: Mutex<Option<libc::pthread_t>>,
}

impl PollerState {
    pub(crate) fn new() -> PollerState {
        PollerState {
            inner: Mutex::new(PollerInner {
                single: [FdSet::new(); 3],
                multi: [FdSet::new(); 3],
                master: [FdSet::new(); 3],
                single_nfds: 0,
                multi_nfds: 0,
                single_waiters: (0..SETSIZE).map(|_| VecDeque::new()).collect(),
                pending: VecDeque::new(),
                poller: None,
            }),
            blocked: Mutex::new(None),
        }
    }

    /// Thread to kick when new work must break an in-flight unbounded wait.
    /// Callers are preemption-excluded.
    pub(crate) fn blocked_thread(&self) -> Option<libc::pthread_t> {
        *self.blocked.lock()
    }
}

/// Timeout payload for a waiter: flags it and kicks the poller so the next
/// cycle completes it with a zero count.
struct IoTimeout {
    wait: Arc<IoWait>,
    cluster: Weak<ClusterCore>,
}

impl Expire for IoTimeout {
    fn fire(&self) {
        self.wait.timed_out.store(true, Ordering::Release);
        if let Some(cluster) = self.cluster.upgrade() {
            if let Some(tid) = cluster.poller.blocked_thread() {
                signals::wake_thread(tid);
            }
        }
    }
}

fn pselect_raw(
    nfds: usize,
    sets: &mut [FdSet; 3],
    zero_timeout: bool,
    sigmask: Option<&libc::sigset_t>,
) -> io::Result<usize> {
    let ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let r = unsafe {
        libc::pselect(
            nfds as libc::c_int,
            sets[0].as_raw(),
            sets[1].as_raw(),
            sets[2].as_raw(),
            if zero_timeout { &ts } else { std::ptr::null() },
            sigmask.map_or(std::ptr::null(), |m| m as *const _),
        )
    };
    if r < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(r as usize)
    }
}

/// Register a waiter. Returns whether it claimed the poller role; otherwise
/// a blocked poller is kicked so it folds the new interest in.
fn register(cluster: &Arc<ClusterCore>, wait: &Arc<IoWait>) -> bool {
    interrupts::disable();
    let mut p = cluster.poller.inner.lock();
    match &wait.kind {
        IoKind::Single {
            fd,
            interest,
            timed: false,
            ..
        } => {
            if interest.contains(FdInterest::READ) {
                p.single[0].set(*fd as i32);
            }
            if interest.contains(FdInterest::WRITE) {
                p.single[1].set(*fd as i32);
            }
            if interest.contains(FdInterest::EXCEPT) {
                p.single[2].set(*fd as i32);
            }
            p.single_nfds = p.single_nfds.max(fd + 1);
            p.single_waiters[*fd].push_back(wait.clone());
        }
        IoKind::Single { fd, .. } => {
            // Timeout-carrying waits live on the multi side.
            p.multi_nfds = p.multi_nfds.max(fd + 1);
            p.pending.push_back(wait.clone());
        }
        IoKind::Multi { nfds, .. } => {
            p.multi_nfds = p.multi_nfds.max(*nfds);
            p.pending.push_back(wait.clone());
        }
    }
    let became_poller = p.poller.is_none();
    if became_poller {
        p.poller = Some(wait.clone());
    }
    drop(p);
    if !became_poller {
        // A poller camped in its unbounded wait must fold the new bits in.
        if let Some(tid) = cluster.poller.blocked_thread() {
            signals::wake_thread(tid);
        }
    }
    interrupts::enable();
    became_poller
}

/// Mark a waiter finished and wake it (unless it is the poller itself).
fn complete(me: &Arc<IoWait>, wait: &Arc<IoWait>, result: io::Result<usize>) {
    {
        let mut done = wait.done.lock();
        done.complete = true;
        done.result = Some(result);
    }
    if !Arc::ptr_eq(wait, me) {
        wait.sem.v();
    }
}

/// One harvest pass over the post-`pselect` ready sets (zeroed after EINTR:
/// timeout processing must still run). Preemption-excluded.
fn harvest(cluster: &Arc<ClusterCore>, me: &Arc<IoWait>, ready: &[FdSet; 3]) {
    let mut p = cluster.poller.inner.lock();

    // Pending side: timeouts, full-set matches, timed single-fd actions.
    let mut still = VecDeque::new();
    while let Some(w) = p.pending.pop_front() {
        if w.timed_out.load(Ordering::Acquire) {
            if let IoKind::Multi { out, .. } = &w.kind {
                *out.lock() = [FdSet::new(); 3];
            }
            complete(me, &w, Ok(0));
            continue;
        }
        match &w.kind {
            IoKind::Single {
                fd,
                interest,
                action,
                ..
            } => {
                if (ready_dirs(ready, *fd) & *interest).is_empty() {
                    still.push_back(w);
                } else {
                    match unsafe { (&mut **action)() } {
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => still.push_back(w),
                        res => complete(me, &w, res),
                    }
                }
            }
            IoKind::Multi { nfds, req, out } => {
                let mut hit = *req;
                let mut count = 0;
                for i in 0..3 {
                    hit[i].and_with(&ready[i], *nfds);
                    count += hit[i].count_up_to(*nfds);
                }
                if count > 0 {
                    *out.lock() = hit;
                    complete(me, &w, Ok(count));
                } else {
                    still.push_back(w);
                }
            }
        }
    }
    p.pending = still;

    // Single-fd side: run each ready list's actions in arrival order. An
    // action that would block lost its readiness to an earlier waiter; its
    // bit stays armed for the next cycle.
    for fd in 0..p.single_nfds {
        if p.single_waiters[fd].is_empty() {
            continue;
        }
        let rd = ready_dirs(ready, fd);
        if rd.is_empty() {
            continue;
        }
        let mut keep = VecDeque::new();
        while let Some(w) = p.single_waiters[fd].pop_front() {
            let IoKind::Single {
                interest, action, ..
            } = &w.kind
            else {
                keep.push_back(w);
                continue;
            };
            if (rd & *interest).is_empty() {
                keep.push_back(w);
                continue;
            }
            match unsafe { (&mut **action)() } {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => keep.push_back(w),
                res => complete(me, &w, res),
            }
        }
        if keep.is_empty() {
            for s in p.single.iter_mut() {
                s.clear(fd as i32);
            }
        } else {
            // Remaining waiters may want fewer directions; rebuild this fd.
            let mut dirs = FdInterest::empty();
            for w in &keep {
                if let IoKind::Single { interest, .. } = &w.kind {
                    dirs |= *interest;
                }
            }
            for (i, flag) in [FdInterest::READ, FdInterest::WRITE, FdInterest::EXCEPT]
                .iter()
                .enumerate()
            {
                if dirs.contains(*flag) {
                    p.single[i].set(fd as i32);
                } else {
                    p.single[i].clear(fd as i32);
                }
            }
        }
        p.single_waiters[fd] = keep;
    }
    p.single_nfds = rescan_nfds(&p.single, p.single_nfds);
}

/// A bad descriptor poisons the whole `pselect`: wake everyone with the
/// error and clear all interest; each caller re-discovers its own state.
fn ebadf_sweep(cluster: &Arc<ClusterCore>, me: &Arc<IoWait>) {
    let mut p = cluster.poller.inner.lock();
    let mut all: Vec<Arc<IoWait>> = p.pending.drain(..).collect();
    for fd in 0..p.single_nfds {
        all.extend(p.single_waiters[fd].drain(..));
    }
    for s in p.single.iter_mut() {
        s.zero();
    }
    for s in p.multi.iter_mut() {
        s.zero();
    }
    p.single_nfds = 0;
    p.multi_nfds = 0;
    drop(p);
    for w in all {
        complete(me, &w, Err(io::Error::from_raw_os_error(libc::EBADF)));
    }
}

/// Hand the poller role to the next waiter: the head of the pending list,
/// else the head of the highest-indexed non-empty per-fd list.
fn nominate_successor(cluster: &Arc<ClusterCore>, me: &Arc<IoWait>) {
    interrupts::disable();
    let next = {
        let mut p = cluster.poller.inner.lock();
        debug_assert!(
            p.poller.as_ref().is_some_and(|w| Arc::ptr_eq(w, me)),
            "poller role lost mid-poll"
        );
        p.poller = None;
        let next = p.pending.front().cloned().or_else(|| {
            (0..p.single_nfds)
                .rev()
                .find_map(|fd| p.single_waiters[fd].front().cloned())
        });
        if let Some(n) = &next {
            n.nominated.store(true, Ordering::Release);
            p.poller = Some(n.clone());
        }
        next
    };
    if let Some(n) = next {
        n.sem.v();
    }
    interrupts::enable();
}

/// The polling cycle, run by whichever task currently holds the poller role,
/// until its own I/O completes.
fn poll_loop(cluster: &Arc<ClusterCore>, me: &Arc<IoWait>) {
    loop {
        if me.is_complete() {
            break;
        }

        interrupts::disable();
        // Signals first: once the blocked marker is published, a waker's
        // SIGUSR1 must stay pending rather than hit an open mask and vanish.
        let old_mask = signals::block_runtime();
        let (mut master, nfds, unbounded) = {
            let mut p = cluster.poller.inner.lock();

            // The multi side changes as pending waiters come and go;
            // rebuild it from scratch each cycle.
            let mut multi = [FdSet::new(); 3];
            let mut multi_nfds = 0;
            for w in &p.pending {
                match &w.kind {
                    IoKind::Single { fd, interest, .. } => {
                        if interest.contains(FdInterest::READ) {
                            multi[0].set(*fd as i32);
                        }
                        if interest.contains(FdInterest::WRITE) {
                            multi[1].set(*fd as i32);
                        }
                        if interest.contains(FdInterest::EXCEPT) {
                            multi[2].set(*fd as i32);
                        }
                        multi_nfds = multi_nfds.max(fd + 1);
                    }
                    IoKind::Multi { nfds, req, .. } => {
                        for i in 0..3 {
                            multi[i].or_up_to(&req[i], *nfds);
                        }
                        multi_nfds = multi_nfds.max(*nfds);
                    }
                }
            }
            p.multi = multi;
            p.multi_nfds = multi_nfds;

            let nfds = p.single_nfds.max(p.multi_nfds);
            let mut master = [FdSet::new(); 3];
            for i in 0..3 {
                master[i] = p.single[i];
                master[i].or_up_to(&multi[i], nfds);
            }
            p.master = master;

            // An already-flagged timeout must reach the next harvest; never
            // park over one.
            let timeout_due = p
                .pending
                .iter()
                .any(|w| w.timed_out.load(Ordering::Acquire));
            let unbounded = if timeout_due || cluster.has_visible_work() {
                false
            } else {
                *cluster.poller.blocked.lock() = Some(unsafe { libc::pthread_self() });
                true
            };
            (master, nfds, unbounded)
        };

        let result = if unbounded {
            let rf_pending = local::with(|l| l.rf_pending.get());
            let r = if rf_pending {
                // A deferred preemption wants servicing; poll instead of
                // sleeping on it.
                pselect_raw(nfds, &mut master, true, None)
            } else {
                pselect_raw(nfds, &mut master, false, Some(&old_mask))
            };
            *cluster.poller.blocked.lock() = None;
            r
        } else {
            pselect_raw(nfds, &mut master, true, None)
        };
        signals::restore_mask(&old_mask);

        match result {
            Ok(_) => harvest(cluster, me, &master),
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => {
                // Interrupted: no readiness, but timeouts flagged meanwhile
                // must still complete.
                harvest(cluster, me, &[FdSet::new(); 3]);
            }
            Err(e) if e.raw_os_error() == Some(libc::EBADF) => {
                ebadf_sweep(cluster, me);
            }
            Err(e) => kabort!("pselect failed: {e}"),
        }
        interrupts::enable();

        if me.is_complete() {
            break;
        }
        // Let ready tasks run between polling cycles.
        task::yield_no_poll();
    }
    nominate_successor(cluster, me);
}

fn wait_for_completion(cluster: &Arc<ClusterCore>, wait: &Arc<IoWait>, became_poller: bool) {
    if became_poller {
        poll_loop(cluster, wait);
    } else {
        wait.sem.p_uninterruptible();
        if wait.nominated.load(Ordering::Acquire) && !wait.is_complete() {
            poll_loop(cluster, wait);
        }
    }
}

fn take_result(wait: &Arc<IoWait>) -> io::Result<usize> {
    interrupts::disable();
    let result = wait.done.lock().result.take();
    interrupts::enable();
    result.unwrap_or_else(|| {
        kabort!(
            "I/O wait of task '{}' woke without a result",
            wait.task.name()
        )
    })
}

/// Single-descriptor entry point; see [`crate::cluster::Cluster::poll_fd`].
pub(crate) fn poll_fd<F>(
    cluster: &Arc<ClusterCore>,
    fd: i32,
    interest: FdInterest,
    timeout: Option<Duration>,
    mut action: F,
) -> io::Result<usize>
where
    F: FnMut() -> io::Result<usize> + Send,
{
    if fd < 0 || fd as usize >= SETSIZE {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if interest.is_empty() {
        return Err(io::Error::from(io::ErrorKind::InvalidInput));
    }
    // First attempt on the caller's stack; the poller path assumes the
    // descriptor has reported would-block at least once.
    match action() {
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        other => return other,
    }
    let Some(me) = task::current() else {
        kabort!("blocking I/O off-task");
    };
    // Safety: erases the borrow's lifetime to store the action as a raw
    // pointer; the pointee is the `action` local above, which this function
    // keeps alive on its stack frame until the wait completes (see the
    // `IoWait::kind` doc comment and the `Send`/`Sync` impl above it).
    let action_ref: &mut (dyn FnMut() -> io::Result<usize> + Send + '_) = &mut action;
    let action_ptr: *mut IoAction = unsafe { std::mem::transmute(action_ref) };
    let wait = Arc::new(IoWait {
        task: me,
        sem: Semaphore::new(0),
        done: Mutex::new(IoDone {
            complete: false,
            result: None,
        }),
        timed_out: AtomicBool::new(false),
        nominated: AtomicBool::new(false),
        kind: IoKind::Single {
            fd: fd as usize,
            interest,
            action: action_ptr,
            timed: timeout.is_some(),
        },
    });
    if let Some(timeout) = timeout {
        preempt::register_user_event(
            Instant::now() + timeout,
            Arc::new(IoTimeout {
                wait: wait.clone(),
                cluster: Arc::downgrade(cluster),
            }),
        );
    }
    let became_poller = register(cluster, &wait);
    wait_for_completion(cluster, &wait, became_poller);
    let result = take_result(&wait);
    cancel::poll();
    result
}

/// Full-set entry point; see [`crate::cluster::Cluster::select`].
pub(crate) fn select(
    cluster: &Arc<ClusterCore>,
    nfds: i32,
    mut rfds: Option<&mut FdSet>,
    mut wfds: Option<&mut FdSet>,
    mut efds: Option<&mut FdSet>,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    if nfds < 0 || nfds as usize > SETSIZE {
        return Err(io::Error::from(io::ErrorKind::InvalidInput));
    }
    let nfds = nfds as usize;
    let req = [
        rfds.as_deref().copied().unwrap_or_default(),
        wfds.as_deref().copied().unwrap_or_default(),
        efds.as_deref().copied().unwrap_or_default(),
    ];

    // A zero timeout polls exactly once, on the caller's stack.
    if timeout == Some(Duration::ZERO) {
        let mut sets = req;
        let count = loop {
            match pselect_raw(nfds, &mut sets, true, None) {
                Ok(n) => break n,
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => {
                    sets = req; // contents are undefined after a failure
                    continue;
                }
                Err(e) => return Err(e),
            }
        };
        write_back(&sets, &mut rfds, &mut wfds, &mut efds);
        return Ok(count);
    }

    let Some(me) = task::current() else {
        kabort!("blocking I/O off-task");
    };
    let wait = Arc::new(IoWait {
        task: me,
        sem: Semaphore::new(0),
        done: Mutex::new(IoDone {
            complete: false,
            result: None,
        }),
        timed_out: AtomicBool::new(false),
        nominated: AtomicBool::new(false),
        kind: IoKind::Multi {
            nfds,
            req,
            out: Mutex::new([FdSet::new(); 3]),
        },
    });
    if let Some(timeout) = timeout {
        preempt::register_user_event(
            Instant::now() + timeout,
            Arc::new(IoTimeout {
                wait: wait.clone(),
                cluster: Arc::downgrade(cluster),
            }),
        );
    }
    let became_poller = register(cluster, &wait);
    wait_for_completion(cluster, &wait, became_poller);
    let result = take_result(&wait);
    if result.is_ok() {
        if let IoKind::Multi { out, .. } = &wait.kind {
            interrupts::disable();
            let sets = *out.lock();
            interrupts::enable();
            write_back(&sets, &mut rfds, &mut wfds, &mut efds);
        }
    }
    cancel::poll();
    result
}

fn write_back(
    sets: &[FdSet; 3],
    rfds: &mut Option<&mut FdSet>,
    wfds: &mut Option<&mut FdSet>,
    efds: &mut Option<&mut FdSet>,
) {
    if let Some(r) = rfds {
        **r = sets[0];
    }
    if let Some(w) = wfds {
        **w = sets[1];
    }
    if let Some(e) = efds {
        **e = sets[2];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fd_set_bit_ops() {
        let mut set = FdSet::new();
        set.set(3);
        set.set(130);
        assert!(set.is_set(3));
        assert!(set.is_set(130));
        assert!(!set.is_set(4));
        assert_eq!(set.count_up_to(SETSIZE), 2);
        assert_eq!(set.count_up_to(64), 1);
        set.clear(3);
        assert!(!set.is_set(3));
    }

    #[test]
    fn nfds_rescan_finds_highest_bit() {
        let mut sets = [FdSet::new(); 3];
        assert_eq!(rescan_nfds(&sets, SETSIZE), 0);
        sets[1].set(77);
        assert_eq!(rescan_nfds(&sets, SETSIZE), 78);
        sets[0].set(200);
        assert_eq!(rescan_nfds(&sets, SETSIZE), 201);
    }

    #[test]
    fn word_merge_respects_bound() {
        let mut dst = FdSet::new();
        let mut src = FdSet::new();
        src.set(10);
        src.set(500);
        dst.or_up_to(&src, 64);
        assert!(dst.is_set(10));
        assert!(!dst.is_set(500));
    }
}
