//! Spinlock with interrupt-disable bookkeeping.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use crate::preempt::interrupts;

/// A spinlock whose `lock` also masks preemption for the critical section,
/// so the holder cannot be context-switched away mid-section and leave other
/// tasks on the same kernel thread spinning on it.
///
/// `lock_raw` skips the bookkeeping for contexts that are already
/// preemption-excluded.
pub struct SpinLock<T> {
    inner: spin::Mutex<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        SpinLock {
            inner: spin::Mutex::new(value),
        }
    }

    /// Acquire with the interrupt-disable bracket; released (and a deferred
    /// preemption run) when the guard drops.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        interrupts::disable();
        SpinLockGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
        }
    }

    /// Acquire without the bracket. Caller must already be
    /// preemption-excluded.
    pub fn lock_raw(&self) -> spin::MutexGuard<'_, T> {
        self.inner.lock()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

pub struct SpinLockGuard<'a, T> {
    guard: ManuallyDrop<spin::MutexGuard<'a, T>>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        interrupts::enable();
    }
}
