//! Counting semaphore with timed acquisition.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use spin::Mutex;

use crate::cancel;
use crate::kabort;
use crate::preempt::{self, Expire, interrupts};
use crate::task::{self, TaskCore};

struct SemWaiter {
    task: Arc<TaskCore>,
    timed: Option<Arc<TimedWake>>,
}

struct SemInner {
    count: usize,
    waiters: VecDeque<SemWaiter>,
}

pub(crate) struct SemShared {
    inner: Mutex<SemInner>,
}

/// Timeout payload for a timed `P`. Registered with the waiter's processor;
/// fires lazily — a waiter granted in time is simply no longer queued.
struct TimedWake {
    shared: Weak<SemShared>,
    fired: AtomicBool,
    timed_out: AtomicBool,
}

impl Expire for TimedWake {
    fn fire(&self) {
        self.fired.store(true, Ordering::Release);
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let me: *const TimedWake = self;
        let mut inner = shared.inner.lock();
        let at = inner.waiters.iter().position(|w| {
            w.timed
                .as_ref()
                .is_some_and(|t| std::ptr::eq(Arc::as_ptr(t), me))
        });
        if let Some(at) = at {
            let waiter = inner.waiters.remove(at).unwrap();
            self.timed_out.store(true, Ordering::Release);
            drop(inner);
            task::wake(waiter.task);
        }
    }
}

/// Counting semaphore. `P` blocks the calling task; `V` wakes the oldest
/// waiter or banks the count. Waits may carry a relative or absolute
/// deadline.
pub struct Semaphore {
    shared: Arc<SemShared>,
}

impl Semaphore {
    pub fn new(count: usize) -> Semaphore {
        Semaphore {
            shared: Arc::new(SemShared {
                inner: Mutex::new(SemInner {
                    count,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    pub fn count(&self) -> usize {
        interrupts::disable();
        let count = self.shared.inner.lock().count;
        interrupts::enable();
        count
    }

    /// Acquire one unit, blocking the task as needed. A poll point.
    pub fn p(&self) {
        self.wait(None, true);
    }

    /// Acquire without the poll point; runtime-internal waits that must not
    /// unwind mid-protocol use this.
    pub(crate) fn p_uninterruptible(&self) {
        self.wait(None, false);
    }

    /// Acquire if a unit is banked; never blocks.
    pub fn try_p(&self) -> bool {
        interrupts::disable();
        let mut inner = self.shared.inner.lock();
        let got = inner.count > 0;
        if got {
            inner.count -= 1;
        }
        drop(inner);
        interrupts::enable();
        got
    }

    /// Acquire with a relative timeout. Returns false on expiry.
    pub fn p_for(&self, timeout: Duration) -> bool {
        self.p_until(Instant::now() + timeout)
    }

    /// Acquire with an absolute deadline. Returns false on expiry.
    pub fn p_until(&self, deadline: Instant) -> bool {
        let timed = Arc::new(TimedWake {
            shared: Arc::downgrade(&self.shared),
            fired: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
        });
        preempt::register_user_event(deadline, timed.clone());
        self.wait(Some(timed), true)
    }

    fn wait(&self, timed: Option<Arc<TimedWake>>, poll: bool) -> bool {
        interrupts::disable();
        let mut inner = self.shared.inner.lock();
        if inner.count > 0 {
            inner.count -= 1;
            drop(inner);
            interrupts::enable();
            if poll {
                cancel::poll_current();
            }
            return true;
        }
        let Some(me) = task::current() else {
            kabort!("semaphore wait off-task");
        };
        if let Some(t) = &timed {
            // The alarm may already have fired between registration and the
            // queue push; waiting now would wait forever.
            if t.fired.load(Ordering::Acquire) {
                drop(inner);
                interrupts::enable();
                return false;
            }
        }
        inner.waiters.push_back(SemWaiter {
            task: me,
            timed: timed.clone(),
        });
        std::mem::forget(inner);
        task::schedule_release(&self.shared.inner);
        interrupts::enable();
        if poll {
            cancel::poll_current();
        }
        match timed {
            Some(t) => !t.timed_out.load(Ordering::Acquire),
            None => true,
        }
    }

    /// Release one unit of `other` and acquire from this semaphore, with the
    /// release ordered before the block: a waiter of `other` that V's back
    /// immediately finds either a banked count or this task already off-CPU.
    /// The two locks are taken in sequence, never nested.
    pub fn p_with_v(&self, other: &Semaphore) {
        interrupts::disable();
        // Stage the release: pop other's waiter now (or bank the count), but
        // defer its wake to the kernel stack.
        let handoff = {
            let mut o = other.shared.inner.lock();
            match o.waiters.pop_front() {
                Some(w) => Some(w.task),
                None => {
                    o.count += 1;
                    None
                }
            }
        };
        let mut inner = self.shared.inner.lock();
        if inner.count > 0 {
            inner.count -= 1;
            drop(inner);
            if let Some(t) = handoff {
                task::wake(t);
            }
            interrupts::enable();
            cancel::poll_current();
            return;
        }
        let Some(me) = task::current() else {
            kabort!("semaphore wait off-task");
        };
        inner.waiters.push_back(SemWaiter {
            task: me,
            timed: None,
        });
        std::mem::forget(inner);
        match handoff {
            Some(t) => task::schedule_release_wake(&self.shared.inner, t),
            None => task::schedule_release(&self.shared.inner),
        }
        interrupts::enable();
        cancel::poll_current();
    }

    /// Release one unit.
    pub fn v(&self) {
        interrupts::disable();
        let mut inner = self.shared.inner.lock();
        match inner.waiters.pop_front() {
            Some(waiter) => {
                drop(inner);
                task::wake(waiter.task);
            }
            None => {
                inner.count += 1;
                drop(inner);
            }
        }
        interrupts::enable();
    }

    /// Release `n` units at once.
    pub fn v_n(&self, n: usize) {
        for _ in 0..n {
            self.v();
        }
    }
}
