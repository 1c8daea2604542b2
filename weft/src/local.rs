//! Per-kernel-thread data.
//!
//! Every processor thread carries the scheduler context it switches back to,
//! the task it is currently running, and the interrupt-masking counters. The
//! record is plain data with no destructor: it is read from signal handlers
//! and from inside the allocation bracket, so access must never allocate or
//! run lazy initialization.

use core::cell::{Cell, UnsafeCell};

use crate::context::CpuContext;
use crate::processor::ProcessorCore;
use crate::task::TaskCore;

/// Deferred work the processor kernel performs on its own stack right after a
/// task has switched away. Raw pointers carry ownership transferred with
/// `Arc::into_raw`; the kernel is the single consumer.
pub(crate) enum OnBehalf {
    None,
    Release {
        lock: *const (),
        unlock: unsafe fn(*const ()),
    },
    Wake {
        task: *const TaskCore,
    },
    ReleaseWake {
        lock: *const (),
        unlock: unsafe fn(*const ()),
        task: *const TaskCore,
    },
    Requeue {
        task: *const TaskCore,
    },
    Finalize {
        task: *const TaskCore,
    },
}

impl Default for OnBehalf {
    fn default() -> Self {
        OnBehalf::None
    }
}

pub(crate) struct ProcessorLocal {
    pub kernel_id: Cell<u32>,
    pub processor: Cell<*const ProcessorCore>,
    pub current_task: Cell<*const TaskCore>,
    /// True while execution is on the processor-kernel stack.
    pub in_kernel: Cell<bool>,
    pub kernel_ctx: UnsafeCell<CpuContext>,
    pub disable_int: Cell<bool>,
    pub disable_int_cnt: Cell<u32>,
    /// A preemption arrived while interrupts were disabled.
    pub rf_pending: Cell<bool>,
    pub rf_in_progress: Cell<bool>,
    pub on_behalf: Cell<OnBehalf>,
}

impl ProcessorLocal {
    const fn new() -> Self {
        ProcessorLocal {
            kernel_id: Cell::new(u32::MAX),
            processor: Cell::new(core::ptr::null()),
            current_task: Cell::new(core::ptr::null()),
            in_kernel: Cell::new(false),
            kernel_ctx: UnsafeCell::new(CpuContext::zeroed()),
            disable_int: Cell::new(false),
            disable_int_cnt: Cell::new(0),
            rf_pending: Cell::new(false),
            rf_in_progress: Cell::new(false),
            on_behalf: Cell::new(OnBehalf::None),
        }
    }
}

thread_local! {
    static LOCAL: ProcessorLocal = const { ProcessorLocal::new() };
}

pub(crate) fn with<R>(f: impl FnOnce(&ProcessorLocal) -> R) -> R {
    LOCAL.with(f)
}

pub(crate) fn try_get_processor() -> Option<*const ProcessorCore> {
    let p = with(|l| l.processor.get());
    if p.is_null() { None } else { Some(p) }
}

pub(crate) fn kernel_id() -> Option<u32> {
    with(|l| {
        if l.processor.get().is_null() {
            None
        } else {
            Some(l.kernel_id.get())
        }
    })
}

/// Clone out the currently running task, if this thread is mid-dispatch.
pub(crate) fn current_task() -> Option<std::sync::Arc<TaskCore>> {
    let p = with(|l| l.current_task.get());
    if p.is_null() {
        None
    } else {
        // Safety: the dispatch frame on this processor holds a strong
        // reference for as long as the pointer is published.
        unsafe {
            std::sync::Arc::increment_strong_count(p);
            Some(std::sync::Arc::from_raw(p))
        }
    }
}

pub(crate) fn has_current_task() -> bool {
    with(|l| !l.current_task.get().is_null())
}

pub(crate) fn set_on_behalf(action: OnBehalf) {
    with(|l| l.on_behalf.set(action));
}
