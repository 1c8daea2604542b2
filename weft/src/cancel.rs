//! Cooperative cancellation and forced unwinding.
//!
//! `cancel` marks a coroutine; the mark is acted on at poll points (context
//! switches and explicit [`poll`]). Delivery is a panic carrying a private
//! sentinel, so the stack unwinds normally — destructors run — and the entry
//! trampoline recognizes the sentinel, runs the registered cleanup handlers
//! in LIFO order, and halts the coroutine without forwarding anything.

use std::panic::panic_any;
use std::sync::atomic::{AtomicBool, Ordering};

use atomic_enum::atomic_enum;
use spin::Mutex;

use crate::coroutine::CoroutineCore;
use crate::{kabort, resume, task};

/// When a cancellation mark is delivered.
///
/// `Polled` delivers at poll points. `Asynchronous` additionally allows the
/// runtime to treat any interrupt point as a poll point; on this platform a
/// signal frame cannot be unwound, so delivery still happens at the next
/// cooperative suspension.
#[atomic_enum]
#[derive(PartialEq, Eq)]
pub enum CancelMode {
    Polled,
    Asynchronous,
}

/// Sentinel panic payload for a forced unwind. Private: the entry trampoline
/// is the single consumer, so nothing else can swallow a cancellation.
pub(crate) struct CancelUnwind;

pub(crate) struct CancelBlock {
    pub(crate) cancelled: AtomicBool,
    pub(crate) enabled: AtomicBool,
    pub(crate) mode: AtomicCancelMode,
    pub(crate) unwinding: AtomicBool,
    cleanups: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl CancelBlock {
    pub(crate) fn new() -> Self {
        CancelBlock {
            cancelled: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            mode: AtomicCancelMode::new(CancelMode::Polled),
            unwinding: AtomicBool::new(false),

            cleanups: Mutex::new(Vec::new()),
        }
    }
}

/// Deliver a pending cancellation or nonlocal event on the current
/// coroutine. Automatic at every context switch; call it from long
/// computations that never suspend.
pub fn poll() {
    poll_current();
}

pub(crate) fn poll_current() {
    // Only the coroutine actually executing is polled: a mark on a task's
    // root waits until control is back on the root stack, where the unwind
    // belongs.
    let Some(co) = task::current_coroutine() else {
        return;
    };
    poll_on(&co);
}

fn poll_on(co: &std::sync::Arc<CoroutineCore>) {
    let c = &co.cancel;
    // Disabled cancellation defers both the mark and nonlocal delivery; a
    // coroutine already unwinding delivers nothing more.
    if !c.enabled.load(Ordering::Acquire) || c.unwinding.load(Ordering::Relaxed) {
        return;
    }
    if c.cancelled.load(Ordering::Acquire) {
        c.unwinding.store(true, Ordering::Relaxed);
        panic_any(CancelUnwind);
    }
    resume::deliver_mailbox(co);
}

/// Enable or disable cancellation delivery for the current coroutine.
/// Returns the previous state.
pub fn set_enabled(enabled: bool) -> bool {
    let Some(co) = task::current_coroutine() else {
        kabort!("cancellation state changed outside a task or coroutine");
    };
    co.cancel.enabled.swap(enabled, Ordering::AcqRel)
}

/// Select the cancellation delivery mode for the current coroutine. Returns
/// the previous mode.
pub fn set_mode(mode: CancelMode) -> CancelMode {
    let Some(co) = task::current_coroutine() else {
        kabort!("cancellation mode changed outside a task or coroutine");
    };
    co.cancel.mode.swap(mode, Ordering::AcqRel)
}

/// Whether the current coroutine carries an undelivered cancellation mark.
pub fn is_cancelled() -> bool {
    task::current_coroutine()
        .map(|co| co.cancel.cancelled.load(Ordering::Acquire))
        .unwrap_or(false)
}

/// Register a cancellation cleanup handler on the current coroutine.
/// Handlers run in reverse registration order during a forced unwind; a main
/// that returns normally drops them unexecuted.
pub fn cleanup_push(f: impl FnOnce() + Send + 'static) {
    let Some(co) = task::current_coroutine() else {
        kabort!("cleanup_push outside a task or coroutine");
    };
    co.cancel.cleanups.lock().push(Box::new(f));
}

/// Remove the most recently pushed cleanup handler, optionally running it.
pub fn cleanup_pop(execute: bool) {
    let Some(co) = task::current_coroutine() else {
        kabort!("cleanup_pop outside a task or coroutine");
    };
    let handler = co.cancel.cleanups.lock().pop();
    match handler {
        Some(f) if execute => f(),
        Some(_) | None => {}
    }
}

/// Run the remaining cleanup handlers after a forced unwind reached the entry
/// trampoline, newest first. The unwind-in-progress flag stays set; the
/// trampoline consumes it when choosing the terminal transfer target.
pub(crate) fn finish_unwind(co: &CoroutineCore) {
    loop {
        let handler = co.cancel.cleanups.lock().pop();
        match handler {
            Some(f) => f(),
            None => break,
        }
    }
}
