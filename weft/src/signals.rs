//! Process-wide signal plumbing.
//!
//! SIGALRM drives preemption and timed events, SIGUSR1 breaks `sigsuspend`
//! and `pselect` waits, and SIGSEGV is intercepted on an alternate stack to
//! diagnose guard-page hits. Both runtime handlers run with the runtime
//! signal set blocked (`sa_mask`).

use crate::preempt;
use crate::stack;

pub(crate) const PREEMPT_SIGNAL: libc::c_int = libc::SIGALRM;
pub(crate) const WAKE_SIGNAL: libc::c_int = libc::SIGUSR1;

extern "C" fn sigusr1_handler(_sig: libc::c_int) {
    // Nothing to do: delivery alone breaks sigsuspend/pselect.
}

extern "C" fn sigsegv_handler(
    _sig: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    let addr = unsafe { (*info).si_addr() } as usize;
    if stack::guard_hit(addr) {
        // Async-signal-safe output only: no formatting, no allocation.
        const MSG: &[u8] = b"weft: stack overflow (guard page hit), aborting\n";
        unsafe { libc::write(2, MSG.as_ptr().cast(), MSG.len()) };
        std::process::abort();
    }
    // Not ours: fall back to the default action and let the fault re-raise.
    unsafe {
        let mut dfl: libc::sigaction = std::mem::zeroed();
        dfl.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(libc::SIGSEGV, &dfl, std::ptr::null_mut());
    }
}

fn runtime_sigset() -> libc::sigset_t {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, PREEMPT_SIGNAL);
        libc::sigaddset(&mut set, WAKE_SIGNAL);
        set
    }
}

/// Install the process-wide handlers. Called once at runtime boot.
pub(crate) fn install_handlers() {
    unsafe {
        let mask = runtime_sigset();

        let mut alrm: libc::sigaction = std::mem::zeroed();
        alrm.sa_sigaction = preempt::sigalrm_handler as usize;
        alrm.sa_mask = mask;
        alrm.sa_flags = libc::SA_RESTART;
        if libc::sigaction(PREEMPT_SIGNAL, &alrm, std::ptr::null_mut()) != 0 {
            crate::kabort!("sigaction(SIGALRM) failed: {}", std::io::Error::last_os_error());
        }

        let mut usr1: libc::sigaction = std::mem::zeroed();
        usr1.sa_sigaction = sigusr1_handler as usize;
        usr1.sa_mask = mask;
        // No SA_RESTART: a wake must surface as EINTR from pselect.
        usr1.sa_flags = 0;
        if libc::sigaction(WAKE_SIGNAL, &usr1, std::ptr::null_mut()) != 0 {
            crate::kabort!("sigaction(SIGUSR1) failed: {}", std::io::Error::last_os_error());
        }

        let mut segv: libc::sigaction = std::mem::zeroed();
        segv.sa_sigaction = sigsegv_handler as usize;
        segv.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        if libc::sigaction(libc::SIGSEGV, &segv, std::ptr::null_mut()) != 0 {
            crate::kabort!("sigaction(SIGSEGV) failed: {}", std::io::Error::last_os_error());
        }
    }
}

/// Block SIGALRM/SIGUSR1 on this thread, returning the previous mask. The
/// bracket around `sigsuspend` and the blocking `pselect`: a wake signalled
/// after the block stays pending until the wait atomically re-opens the old
/// mask.
pub(crate) fn block_runtime() -> libc::sigset_t {
    unsafe {
        let new = runtime_sigset();
        let mut old: libc::sigset_t = std::mem::zeroed();
        if libc::sigprocmask(libc::SIG_BLOCK, &new, &mut old) != 0 {
            crate::kabort!("sigprocmask failed: {}", std::io::Error::last_os_error());
        }
        old
    }
}

pub(crate) fn restore_mask(old: &libc::sigset_t) {
    unsafe {
        if libc::sigprocmask(libc::SIG_SETMASK, old, std::ptr::null_mut()) != 0 {
            crate::kabort!("sigprocmask failed: {}", std::io::Error::last_os_error());
        }
    }
}

/// Re-open the runtime signals from inside a handler, so a preemption that
/// context-switches away does not leave them blocked on this kernel thread.
pub(crate) fn unblock_runtime() {
    unsafe {
        let set = runtime_sigset();
        libc::sigprocmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
    }
}

/// Wait for a signal with `old` installed; returns after any handler ran.
pub(crate) fn suspend(old: &libc::sigset_t) {
    unsafe { libc::sigsuspend(old) };
}

/// Best-effort wakeup of a specific kernel thread.
pub(crate) fn wake_thread(tid: libc::pthread_t) {
    unsafe { libc::pthread_kill(tid, WAKE_SIGNAL) };
}

/// Alternate signal stack for the SIGSEGV handler; a guard-page fault cannot
/// be handled on the faulted stack.
pub(crate) struct AltStack {
    base: *mut libc::c_void,
    len: usize,
}

impl AltStack {
    pub(crate) fn install() -> AltStack {
        let len = 64 * 1024;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            crate::kabort!("alternate signal stack allocation failed");
        }
        let ss = libc::stack_t {
            ss_sp: base,
            ss_flags: 0,
            ss_size: len,
        };
        unsafe { libc::sigaltstack(&ss, std::ptr::null_mut()) };
        AltStack { base, len }
    }
}

impl Drop for AltStack {
    fn drop(&mut self) {
        let ss = libc::stack_t {
            ss_sp: std::ptr::null_mut(),
            ss_flags: libc::SS_DISABLE,
            ss_size: 0,
        };
        unsafe {
            libc::sigaltstack(&ss, std::ptr::null_mut());
            libc::munmap(self.base, self.len);
        }
    }
}
