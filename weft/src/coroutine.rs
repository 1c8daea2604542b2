//! Coroutines: first-class stacks with explicit resume/suspend.
//!
//! A coroutine alternates between `Active` and `Inactive` from its first
//! resume until its main returns or is unwound, after which it is `Halt` and
//! can never run again. Control transfers stay within the resuming task;
//! serial ownership (at most one task executing a given coroutine chain) is
//! enforced at every transfer.
//!
//! A panic that escapes a coroutine's main does not kill the program
//! directly: it is wrapped and re-raised at the last resumer when control
//! gets back there, so unhandled failures travel backward along the dynamic
//! resume chain. Only when the chain ends at a task root does the process
//! abort.

use std::any::Any;
use std::cell::UnsafeCell;
use std::panic::{AssertUnwindSafe, catch_unwind, panic_any};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};

use atomic_enum::atomic_enum;
use spin::Mutex;

use crate::cancel::{self, CancelBlock, CancelMode};
use crate::context::{self, CpuContext};
use crate::preempt::interrupts;
use crate::resume::EhBlock;
use crate::stack::{self, Stack};
use crate::task::{self, TaskCore};
use crate::{kabort, local};

#[atomic_enum]
#[derive(PartialEq, Eq)]
pub enum CoroutineState {
    /// Constructed, never resumed.
    Start,
    /// Started and currently suspended.
    Inactive,
    /// Currently executing on some task.
    Active,
    /// Main returned or was unwound; terminal.
    Halt,
}

fn next_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

struct CoLinks {
    /// The coroutine that performed the first resume; terminal target.
    starter: Option<std::sync::Weak<CoroutineCore>>,
    /// The most recent resumer; target of a normal suspend.
    last_resumer: Option<std::sync::Weak<CoroutineCore>>,
}

/// A panic that escaped a coroutine main, in flight toward the resume chain.
/// Catch it around `resume()` to observe a failed coroutine.
pub struct UnhandledPanic {
    payload: Box<dyn Any + Send>,
    source_id: u64,
    source_name: Box<str>,
    hops: u32,
}

impl UnhandledPanic {
    /// Id of the coroutine whose main failed.
    pub fn source_id(&self) -> u64 {
        self.source_id
    }

    /// Name of the coroutine whose main failed.
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// How many coroutine boundaries the failure has crossed.
    pub fn hops(&self) -> u32 {
        self.hops
    }

    /// The original panic payload.
    pub fn into_payload(self) -> Box<dyn Any + Send> {
        self.payload
    }
}

pub(crate) struct CoroutineCore {
    id: u64,
    name: Box<str>,
    pub(crate) state: AtomicCoroutineState,
    is_task_root: bool,
    ctx: UnsafeCell<CpuContext>,
    stack: Stack,
    links: Mutex<CoLinks>,
    /// Task currently executing this coroutine's chain; null when the
    /// coroutine is a suspended leaf.
    owner_task: AtomicPtr<TaskCore>,
    entry: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    pub(crate) cancel: CancelBlock,
    pub(crate) eh: EhBlock,
    forwarded: Mutex<Option<UnhandledPanic>>,
    low_warned: AtomicBool,
}

// Safety: the context cell is written only by the execution holding the
// coroutine (serial ownership); everything else is behind locks or atomics.
unsafe impl Send for CoroutineCore {}
unsafe impl Sync for CoroutineCore {}

impl CoroutineCore {
    pub(crate) fn new(
        name: &str,
        stack: Stack,
        entry: Box<dyn FnOnce() + Send>,
        is_task_root: bool,
    ) -> Arc<CoroutineCore> {
        let core = Arc::new(CoroutineCore {
            id: next_id(),
            name: name.into(),
            state: AtomicCoroutineState::new(CoroutineState::Start),
            is_task_root,
            ctx: UnsafeCell::new(CpuContext::zeroed()),
            stack,
            links: Mutex::new(CoLinks {
                starter: None,
                last_resumer: None,
            }),
            owner_task: AtomicPtr::new(std::ptr::null_mut()),
            entry: Mutex::new(Some(entry)),
            cancel: CancelBlock::new(),
            eh: EhBlock::new(),
            forwarded: Mutex::new(None),
            low_warned: AtomicBool::new(false),
        });
        unsafe {
            (*core.ctx.get()).prepare(
                coroutine_entry as usize,
                Arc::as_ptr(&core) as usize,
                core.stack.top(),
            );
        }
        core
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn context(&self) -> *mut CpuContext {
        self.ctx.get()
    }

    pub(crate) fn last_resumer(&self) -> Option<Arc<CoroutineCore>> {
        self.links
            .lock()
            .last_resumer
            .as_ref()
            .and_then(|w| w.upgrade())
    }

    fn starter(&self) -> Option<Arc<CoroutineCore>> {
        self.links.lock().starter.as_ref().and_then(|w| w.upgrade())
    }

    /// Saved-stack sanity after this coroutine switched away: the suspended
    /// stack pointer must lie inside its stack, and suspending nearly out of
    /// stack draws a one-time warning.
    pub(crate) fn verify_suspended(&self) {
        let sp = unsafe { (*self.ctx.get()).stack_pointer() };
        if sp == 0 {
            return;
        }
        self.verify_sp(sp);
    }

    pub(crate) fn verify_sp(&self, sp: usize) {
        if !self.stack.contains(sp) {
            kabort!(
                "coroutine '{}': stack pointer {sp:#x} outside [{:#x}, {:#x}]",
                self.name,
                self.stack.limit(),
                self.stack.top()
            );
        }
        if self.stack.remaining(sp) < stack::LOW_WATERMARK
            && !self.low_warned.swap(true, Ordering::Relaxed)
        {
            log::warn!(
                "coroutine '{}' running with {} bytes of stack left",
                self.name,
                self.stack.remaining(sp)
            );
        }
    }

    pub(crate) fn take_forwarded(&self) -> Option<UnhandledPanic> {
        self.forwarded.lock().take()
    }
}

/// Transfer control into `target` from the current coroutine of the current
/// task. Core of both `Coroutine::resume` and the drop-time unwind.
pub(crate) fn resume_core(target: &Arc<CoroutineCore>) {
    let Some(task) = local::current_task() else {
        kabort!("resume outside a task context");
    };
    let cur = task.current_coroutine();
    if Arc::ptr_eq(&cur, target) {
        kabort!("coroutine '{}' resumed itself", target.name);
    }
    match target.state.load(Ordering::Acquire) {
        CoroutineState::Halt => {
            kabort!("resume of terminated coroutine '{}'", target.name)
        }
        CoroutineState::Active => {
            kabort!("coroutine '{}' is already executing", target.name)
        }
        _ => {}
    }
    let owner = target.owner_task.load(Ordering::Acquire);
    if !owner.is_null() && owner != Arc::as_ptr(&task) as *mut _ {
        kabort!(
            "coroutine '{}' is held by another task; concurrent resume",
            target.name
        );
    }

    // Poll point: deliver pending cancellation/events before transferring.
    cancel::poll_current();

    interrupts::disable();
    {
        let mut links = target.links.lock();
        if target.state.load(Ordering::Relaxed) == CoroutineState::Start {
            links.starter = Some(Arc::downgrade(&cur));
        }
        links.last_resumer = Some(Arc::downgrade(&cur));
    }
    target
        .owner_task
        .store(Arc::as_ptr(&task) as *mut _, Ordering::Release);
    task.set_current_coroutine(target);
    cur.state.store(CoroutineState::Inactive, Ordering::Release);
    target.state.store(CoroutineState::Active, Ordering::Release);
    unsafe { context::switch(cur.ctx.get(), target.ctx.get()) };
    // Back here: this side is running again, possibly on a different task.
    reestablish(&cur);
    interrupts::enable();

    // A coroutine that terminated with an escaped panic re-raises it at its
    // resumer: that is us, right now.
    if let Some(forwarded) = target.take_forwarded() {
        panic_any(forwarded);
    }

    // Poll point on the way out, so a mark that landed while the target ran
    // is honored without waiting for the next explicit suspension.
    cancel::poll_current();
}

/// Suspend the current coroutine, returning control to its last resumer.
pub fn suspend() {
    let Some(task) = local::current_task() else {
        kabort!("suspend outside a task context");
    };
    let cur = task.current_coroutine();
    if cur.is_task_root {
        kabort!("task '{}' attempted to suspend its root", cur.name);
    }
    cancel::poll_current();

    let Some(resumer) = cur.last_resumer() else {
        kabort!(
            "coroutine '{}' suspending toward a terminated resumer",
            cur.name
        );
    };
    if resumer.state.load(Ordering::Acquire) == CoroutineState::Halt {
        kabort!(
            "coroutine '{}' suspending toward halted resumer '{}'",
            cur.name,
            resumer.name
        );
    }

    interrupts::disable();
    task.set_current_coroutine(&resumer);
    resumer.state.store(CoroutineState::Active, Ordering::Release);
    cur.owner_task
        .store(std::ptr::null_mut(), Ordering::Release);
    cur.state.store(CoroutineState::Inactive, Ordering::Release);
    unsafe { context::switch(cur.ctx.get(), resumer.ctx.get()) };
    reestablish(&cur);
    interrupts::enable();

    // Resumed again: honor a cancellation that arrived while suspended.
    cancel::poll_current();
}

/// Check the current coroutine's stack bounds in place: aborts when the
/// stack pointer has left its region, warns once near exhaustion. Deep
/// recursions can call this ahead of the guard page.
pub fn verify() {
    let Some(co) = task::current_coroutine() else {
        return;
    };
    co.verify_sp(context::current_stack_pointer());
}

/// Post-switch bookkeeping for the side that just regained control.
fn reestablish(me: &Arc<CoroutineCore>) {
    let Some(task) = local::current_task() else {
        kabort!("coroutine resumed outside a task context");
    };
    task.set_current_coroutine(me);
    me.owner_task
        .store(Arc::as_ptr(&task) as *mut _, Ordering::Release);
    me.state.store(CoroutineState::Active, Ordering::Release);
}

/// Entry trampoline for every fresh context: run the stored main under the
/// escape triage, then perform the terminal transfer.
pub(crate) extern "C" fn coroutine_entry(core: *const CoroutineCore) -> ! {
    // Entered with the suspend-side interrupt mask still held.
    let core = unsafe { &*core };
    interrupts::enable();

    let entry = core.entry.lock().take();
    let Some(entry) = entry else {
        kabort!("coroutine '{}' started twice", core.name);
    };
    match catch_unwind(AssertUnwindSafe(entry)) {
        Ok(()) => {}
        Err(payload) => {
            if payload.is::<cancel::CancelUnwind>() {
                // Forced unwind: run cleanups, halt quietly, forward nothing.
                cancel::finish_unwind(core);
            } else {
                match payload.downcast::<UnhandledPanic>() {
                    Ok(forwarded) => {
                        let mut forwarded = *forwarded;
                        forwarded.hops += 1;
                        *core.forwarded.lock() = Some(forwarded);
                    }
                    Err(payload) => {
                        log::error!(
                            "'{}' terminated with an unhandled panic; forwarding to its resumer",
                            core.name
                        );
                        *core.forwarded.lock() = Some(UnhandledPanic {
                            payload,
                            source_id: core.id,
                            source_name: core.name.clone(),
                            hops: 1,
                        });
                    }
                }
            }
        }
    }

    interrupts::disable();
    core.owner_task
        .store(std::ptr::null_mut(), Ordering::Release);
    core.state.store(CoroutineState::Halt, Ordering::Release);

    if core.is_task_root {
        if let Some(forwarded) = core.forwarded.lock().take() {
            kabort!(
                "unhandled panic reached the root of task '{}' after {} coroutine hops",
                forwarded.source_name,
                forwarded.hops
            );
        }
        // Never returns: the kernel finalizes the task on its own stack.
        task::terminate_current();
    }

    // Terminal transfer: the starter after a normal return; the last resumer
    // when an escaped panic waits for it or a forced unwind brought us down
    // (the canceller resumed us, so control belongs back there).
    let was_forced = core.cancel.unwinding.swap(false, Ordering::AcqRel);
    let target = if was_forced || core.forwarded.lock().is_some() {
        core.last_resumer()
    } else {
        core.starter()
    };
    let Some(target) = target else {
        kabort!(
            "coroutine '{}' terminated but its return target is gone",
            core.name
        );
    };
    if target.state.load(Ordering::Acquire) == CoroutineState::Halt {
        kabort!(
            "coroutine '{}' terminated toward halted coroutine '{}'",
            core.name,
            target.name
        );
    }
    let Some(task) = local::current_task() else {
        kabort!("coroutine terminating outside a task context");
    };
    task.set_current_coroutine(&target);
    target.state.store(CoroutineState::Active, Ordering::Release);
    unsafe { context::switch(core.ctx.get(), target.ctx.get()) };
    kabort!("terminated coroutine '{}' was resumed", core.name);
}

/// A first-class coroutine handle.
///
/// Dropping a started, unfinished coroutine cancels it and drives the forced
/// unwind to completion before the stack is released.
pub struct Coroutine {
    core: Arc<CoroutineCore>,
}

impl Coroutine {
    /// Create a coroutine with the default stack size.
    pub fn new<F>(name: &str, f: F) -> Coroutine
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack_size(name, stack::DEFAULT_STACK_SIZE, f)
    }

    /// Create a coroutine with a runtime-allocated stack of `stack_size`
    /// bytes (plus a guard page).
    pub fn with_stack_size<F>(name: &str, stack_size: usize, f: F) -> Coroutine
    where
        F: FnOnce() + Send + 'static,
    {
        Coroutine {
            core: CoroutineCore::new(name, Stack::alloc(stack_size), Box::new(f), false),
        }
    }

    /// Create a coroutine running on caller-supplied stack storage. The
    /// storage is returned to the allocator only when the coroutine is
    /// dropped; no guard page is installed.
    pub fn with_stack<F>(name: &str, storage: Box<[u8]>, f: F) -> Coroutine
    where
        F: FnOnce() + Send + 'static,
    {
        Coroutine {
            core: CoroutineCore::new(name, Stack::from_user(storage), Box::new(f), false),
        }
    }

    /// Transfer control to this coroutine until it suspends or terminates.
    pub fn resume(&self) {
        resume_core(&self.core);
    }

    pub fn state(&self) -> CoroutineState {
        self.core.state.load(Ordering::Acquire)
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Mark the coroutine cancelled; delivery happens at its poll points.
    /// Idempotent.
    pub fn cancel(&self) {
        self.core.cancel.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.cancel.cancelled.load(Ordering::Acquire)
    }

    /// Enable or disable cancellation delivery. Returns the previous state.
    pub fn set_cancel_state(&self, enabled: bool) -> bool {
        self.core.cancel.enabled.swap(enabled, Ordering::AcqRel)
    }

    /// Select the cancellation delivery mode. Returns the previous mode.
    pub fn set_cancel_type(&self, mode: CancelMode) -> CancelMode {
        self.core.cancel.mode.swap(mode, Ordering::AcqRel)
    }

    /// Post a resumption event to this coroutine, delivered nonlocally at
    /// its next poll point with the type enabled.
    pub fn raise_at<E: crate::resume::ResumeEvent>(&self, event: E) {
        crate::resume::post(&self.core, Box::new(event));
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        match self.core.state.load(Ordering::Acquire) {
            CoroutineState::Start | CoroutineState::Halt => {}
            CoroutineState::Active => {
                kabort!(
                    "coroutine '{}' dropped while executing",
                    self.core.name
                );
            }
            CoroutineState::Inactive => {
                // Destructor-initiated cancellation: unwind the suspended
                // stack before the storage goes away. Overrides a disabled
                // cancel state; the coroutine is going away regardless.
                if local::current_task().is_none() {
                    kabort!(
                        "started coroutine '{}' dropped outside a task context",
                        self.core.name
                    );
                }
                self.core.cancel.cancelled.store(true, Ordering::Release);
                self.core.cancel.enabled.store(true, Ordering::Release);
                while self.core.state.load(Ordering::Acquire) != CoroutineState::Halt {
                    resume_core(&self.core);
                }
            }
        }
    }
}
