//! Preemption and the per-processor event engine.
//!
//! Each processor owns a POSIX timer that delivers SIGALRM to its own kernel
//! thread (`SIGEV_THREAD_ID`), armed to the earliest entry of its event list.
//! The context-switch event is periodic and forces the running task to yield;
//! user events carry timed waits and I/O timeouts. A signal that lands while
//! interrupts are masked is remembered and rolled forward when the mask
//! drops.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::local;
use crate::{kabort, task};

/// Interrupt masking as a thread-local counter.
///
/// `disable`/`enable` nest; when the count returns to zero a deferred
/// preemption (roll-forward) runs, unless one is already in progress.
pub(crate) mod interrupts {
    use crate::local;

    pub(crate) fn disable() {
        local::with(|l| {
            l.disable_int.set(true);
            l.disable_int_cnt.set(l.disable_int_cnt.get() + 1);
        });
    }

    pub(crate) fn enable() {
        let roll = local::with(|l| {
            let cnt = l.disable_int_cnt.get();
            debug_assert!(cnt > 0, "interrupt enable without matching disable");
            l.disable_int_cnt.set(cnt - 1);
            if cnt == 1 {
                l.disable_int.set(false);
                l.rf_pending.get() && !l.rf_in_progress.get()
            } else {
                false
            }
        });
        if roll {
            super::roll_forward(false);
        }
    }

    /// Drop the mask without running a pending roll-forward; used on the
    /// back side of a preemption, where the signal frame is still on the
    /// stack.
    pub(crate) fn enable_no_rf() {
        local::with(|l| {
            let cnt = l.disable_int_cnt.get();
            debug_assert!(cnt > 0, "interrupt enable without matching disable");
            l.disable_int_cnt.set(cnt - 1);
            if cnt == 1 {
                l.disable_int.set(false);
            }
        });
    }

    #[allow(dead_code)]
    pub(crate) fn are_disabled() -> bool {
        local::with(|l| l.disable_int.get())
    }
}

/// A deadline-driven callback owned by one processor's event list. Fired
/// from signal context: implementations stay within spin-locked queue
/// operations and wakeups.
pub(crate) trait Expire: Send + Sync {
    fn fire(&self);
}

pub(crate) enum EventKind {
    ContextSwitch,
    User(Arc<dyn Expire>),
}

pub(crate) struct Event {
    pub deadline: Instant,
    pub period: Option<Duration>,
    pub kind: EventKind,
}

/// Deadline-ordered event list. Owned by one processor; the only cross-thread
/// traffic is lazy (fired events check an armed flag on their payload).
pub(crate) struct EventList {
    queue: Vec<Event>,
}

impl EventList {
    pub(crate) const fn new() -> Self {
        EventList { queue: Vec::new() }
    }

    fn insert(&mut self, ev: Event) {
        let at = self
            .queue
            .partition_point(|e| e.deadline <= ev.deadline);
        self.queue.insert(at, ev);
    }

    fn remove_context_switch(&mut self) {
        self.queue
            .retain(|e| !matches!(e.kind, EventKind::ContextSwitch));
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.queue.first().map(|e| e.deadline)
    }

    /// Earliest deadline that is not the context-switch event; an idle
    /// processor keeps its alarm armed for these.
    pub(crate) fn next_user_deadline(&self) -> Option<Instant> {
        self.queue
            .iter()
            .find(|e| matches!(e.kind, EventKind::User(_)))
            .map(|e| e.deadline)
    }

    /// Fire everything due at `now`. Returns whether the context-switch
    /// event was among them. Periodic events re-insert before firing, so the
    /// list never grows here.
    pub(crate) fn expire(&mut self, now: Instant) -> bool {
        let mut cs_due = false;
        while let Some(head) = self.queue.first() {
            if head.deadline > now {
                break;
            }
            let ev = self.queue.remove(0);
            if let Some(period) = ev.period {
                self.insert(Event {
                    deadline: now + period,
                    period: ev.period,
                    kind: match &ev.kind {
                        EventKind::ContextSwitch => EventKind::ContextSwitch,
                        EventKind::User(u) => EventKind::User(u.clone()),
                    },
                });
            }
            match ev.kind {
                EventKind::ContextSwitch => cs_due = true,
                EventKind::User(u) => u.fire(),
            }
        }
        cs_due
    }
}

/// Create this thread's preemption timer: SIGALRM, delivered to exactly this
/// kernel thread.
pub(crate) fn create_timer() -> libc::timer_t {
    let mut sev: libc::sigevent = unsafe { std::mem::zeroed() };
    sev.sigev_notify = libc::SIGEV_THREAD_ID;
    sev.sigev_signo = libc::SIGALRM;
    sev.sigev_notify_thread_id = unsafe { libc::gettid() };
    let mut timer: libc::timer_t = std::ptr::null_mut();
    if unsafe { libc::timer_create(libc::CLOCK_MONOTONIC, &mut sev, &mut timer) } != 0 {
        kabort!(
            "timer_create failed: {}",
            std::io::Error::last_os_error()
        );
    }
    timer
}

pub(crate) fn delete_timer(timer: libc::timer_t) {
    unsafe { libc::timer_delete(timer) };
}

/// Arm `timer` as a single shot for `deadline`, or disarm it.
pub(crate) fn arm_timer(timer: libc::timer_t, deadline: Option<Instant>) {
    let mut its: libc::itimerspec = unsafe { std::mem::zeroed() };
    if let Some(deadline) = deadline {
        let delta = deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_micros(1));
        its.it_value.tv_sec = delta.as_secs() as libc::time_t;
        its.it_value.tv_nsec = delta.subsec_nanos() as _;
    }
    if unsafe { libc::timer_settime(timer, 0, &its, std::ptr::null_mut()) } != 0 {
        kabort!("timer_settime failed: {}", std::io::Error::last_os_error());
    }
}

/// Install, replace or clear the periodic context-switch event on the current
/// processor. A zero period disarms preemption. Must be called with
/// interrupts disabled (scheduler frames only).
pub(crate) fn set_context_switch_event(period_ms: u64) {
    debug_assert!(local::with(|l| l.disable_int.get() || l.in_kernel.get()));
    let Some(proc_ptr) = local::try_get_processor() else {
        kabort!("context-switch event programmed off-processor");
    };
    let proc = unsafe { &*proc_ptr };
    {
        let mut events = proc.events.lock();
        events.remove_context_switch();
        if period_ms > 0 {
            let period = Duration::from_millis(period_ms);
            events.insert(Event {
                deadline: Instant::now() + period,
                period: Some(period),
                kind: EventKind::ContextSwitch,
            });
        }
    }
    proc.rearm_timer();
}

/// Register a one-shot user event on the current processor. The payload's
/// `fire` runs in signal context at (or after) `deadline`.
pub(crate) fn register_user_event(deadline: Instant, payload: Arc<dyn Expire>) {
    let Some(proc_ptr) = local::try_get_processor() else {
        kabort!("timed event registered off-processor");
    };
    let proc = unsafe { &*proc_ptr };
    interrupts::disable();
    proc.events.lock().insert(Event {
        deadline,
        period: None,
        kind: EventKind::User(payload),
    });
    proc.rearm_timer();
    interrupts::enable();
}

/// Run a deferred (or immediate) preemption: expire due events, re-arm the
/// alarm, and if the context-switch event fired while a task was running,
/// force it to yield. Re-entry is prevented by the in-progress flag.
pub(crate) fn roll_forward(from_handler: bool) {
    let Some(proc_ptr) = local::try_get_processor() else {
        local::with(|l| l.rf_pending.set(false));
        return;
    };
    let proc = unsafe { &*proc_ptr };
    local::with(|l| {
        l.rf_in_progress.set(true);
        l.rf_pending.set(false);
    });
    let cs_due = proc.events.lock().expire(Instant::now());
    proc.rearm_timer();
    local::with(|l| l.rf_in_progress.set(false));
    if cs_due && !local::with(|l| l.in_kernel.get()) && local::has_current_task() {
        task::preempt_yield(from_handler);
    }
}

/// SIGALRM entry point. With interrupts masked (or on the kernel stack) the
/// preemption is deferred to the next enable; otherwise it runs in place and
/// the running task yields from signal context.
pub(crate) extern "C" fn sigalrm_handler(_sig: libc::c_int) {
    let errno = unsafe { *libc::__errno_location() };
    let defer = local::with(|l| {
        if l.processor.get().is_null() {
            return None;
        }
        Some(l.in_kernel.get() || l.disable_int.get() || l.rf_in_progress.get())
    });
    match defer {
        None => {}
        Some(true) => local::with(|l| l.rf_pending.set(true)),
        Some(false) => roll_forward(true),
    }
    unsafe { *libc::__errno_location() = errno };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);
    impl Expire for Counter {
        fn fire(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn events_fire_in_deadline_order() {
        let mut list = EventList::new();
        let now = Instant::now();
        let hit = Arc::new(Counter(AtomicUsize::new(0)));
        list.insert(Event {
            deadline: now + Duration::from_millis(5),
            period: None,
            kind: EventKind::User(hit.clone()),
        });
        list.insert(Event {
            deadline: now + Duration::from_secs(60),
            period: None,
            kind: EventKind::User(hit.clone()),
        });
        assert_eq!(list.next_deadline(), Some(now + Duration::from_millis(5)));

        assert!(!list.expire(now + Duration::from_millis(10)));
        assert_eq!(hit.0.load(Ordering::SeqCst), 1);
        assert_eq!(list.next_user_deadline(), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn periodic_context_switch_reinserts() {
        let mut list = EventList::new();
        let now = Instant::now();
        let period = Duration::from_millis(10);
        list.insert(Event {
            deadline: now,
            period: Some(period),
            kind: EventKind::ContextSwitch,
        });
        assert!(list.expire(now));
        // Re-armed one period ahead of the expiry time.
        assert!(list.next_deadline().is_some());
        assert!(list.next_user_deadline().is_none());
    }
}
