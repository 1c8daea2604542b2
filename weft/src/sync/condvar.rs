//! Condition variable layered on the task mutex.

use std::collections::VecDeque;
use std::sync::Arc;

use spin::Mutex as RawLock;

use crate::cancel;
use crate::kabort;
use crate::preempt::interrupts;
use crate::sync::MutexGuard;
use crate::task::{self, TaskCore};

/// Condition variable for [`crate::sync::Mutex`]. `wait` releases the mutex
/// and blocks atomically with respect to `signal`: the waiter is queued
/// before the mutex is released, so a signal sent by the next lock holder
/// cannot be missed.
pub struct Condvar {
    queue: RawLock<VecDeque<Arc<TaskCore>>>,
}

impl Condvar {
    pub fn new() -> Condvar {
        Condvar {
            queue: RawLock::new(VecDeque::new()),
        }
    }

    /// Release the guard's mutex and block until signalled; re-acquires the
    /// mutex before returning. A poll point (after re-acquisition).
    ///
    /// The mutex successor's wake is deferred to the kernel stack along with
    /// the queue-lock release, so the successor cannot observe the waiter's
    /// stack still on-CPU.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let Some(me) = task::current() else {
            kabort!("condition wait off-task");
        };
        let mutex = guard.mutex();
        std::mem::forget(guard);
        interrupts::disable();
        let mut queue = self.queue.lock();
        queue.push_back(me);
        let successor = mutex.release_deferred();
        std::mem::forget(queue);
        match successor {
            Some(next) => task::schedule_release_wake(&self.queue, next),
            None => task::schedule_release(&self.queue),
        }
        interrupts::enable();
        let guard = mutex.lock();
        cancel::poll_current();
        guard
    }

    /// Wake the oldest waiter, if any.
    pub fn signal(&self) {
        interrupts::disable();
        let next = self.queue.lock().pop_front();
        if let Some(next) = next {
            task::wake(next);
        }
        interrupts::enable();
    }

    /// Wake every waiter. Waiters on one cluster are enqueued under a single
    /// ready-lock acquisition.
    pub fn broadcast(&self) {
        interrupts::disable();
        let mut drained: Vec<Arc<TaskCore>> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        while let Some(first) = drained.first().cloned() {
            let cluster = first.cluster();
            let (batch, rest): (Vec<_>, Vec<_>) = drained
                .into_iter()
                .partition(|t| Arc::ptr_eq(&t.cluster(), &cluster));
            cluster.make_task_ready_batch(batch);
            drained = rest;
        }
        interrupts::enable();
    }

    /// Number of tasks currently waiting.
    pub fn waiters(&self) -> usize {
        interrupts::disable();
        let n = self.queue.lock().len();
        interrupts::enable();
        n
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
