//! Task mutexes: the owner-recursive lock and the data-carrying mutex.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use spin::Mutex as RawLock;

use crate::kabort;
use crate::preempt::interrupts;
use crate::task::{self, TaskCore};

struct OlInner {
    owner: *const TaskCore,
    times: usize,
    waiters: VecDeque<Arc<TaskCore>>,
}

/// Owner-recursive lock: the holding task may re-acquire; release hands the
/// lock to the oldest waiter directly.
pub struct OwnerLock {
    inner: RawLock<OlInner>,
}

// Safety: the raw owner pointer is an identity tag, only compared.
unsafe impl Send for OwnerLock {}
unsafe impl Sync for OwnerLock {}

impl OwnerLock {
    pub fn new() -> OwnerLock {
        OwnerLock {
            inner: RawLock::new(OlInner {
                owner: std::ptr::null(),
                times: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn acquire(&self) {
        let Some(me) = task::current() else {
            kabort!("owner lock used off-task");
        };
        let me_ptr = Arc::as_ptr(&me);
        interrupts::disable();
        let mut inner = self.inner.lock();
        if inner.owner.is_null() {
            inner.owner = me_ptr;
            inner.times = 1;
            drop(inner);
            interrupts::enable();
        } else if inner.owner == me_ptr {
            inner.times += 1;
            drop(inner);
            interrupts::enable();
        } else {
            inner.waiters.push_back(me);
            std::mem::forget(inner);
            // Ownership is assigned by the releaser before the wake.
            task::schedule_release(&self.inner);
            interrupts::enable();
        }
    }

    pub fn try_acquire(&self) -> bool {
        let Some(me) = task::current() else {
            kabort!("owner lock used off-task");
        };
        let me_ptr = Arc::as_ptr(&me);
        interrupts::disable();
        let mut inner = self.inner.lock();
        let got = if inner.owner.is_null() {
            inner.owner = me_ptr;
            inner.times = 1;
            true
        } else if inner.owner == me_ptr {
            inner.times += 1;
            true
        } else {
            false
        };
        drop(inner);
        interrupts::enable();
        got
    }

    pub fn release(&self) {
        let Some(me) = task::current() else {
            kabort!("owner lock used off-task");
        };
        interrupts::disable();
        let mut inner = self.inner.lock();
        if inner.owner != Arc::as_ptr(&me) {
            kabort!("owner lock released by a task that does not hold it");
        }
        inner.times -= 1;
        if inner.times == 0 {
            match inner.waiters.pop_front() {
                Some(next) => {
                    inner.owner = Arc::as_ptr(&next);
                    inner.times = 1;
                    drop(inner);
                    task::wake(next);
                }
                None => {
                    inner.owner = std::ptr::null();
                    drop(inner);
                }
            }
        } else {
            drop(inner);
        }
        interrupts::enable();
    }

    /// Current recursion depth; 0 when free.
    pub fn times(&self) -> usize {
        interrupts::disable();
        let times = self.inner.lock().times;
        interrupts::enable();
        times
    }
}

impl Default for OwnerLock {
    fn default() -> Self {
        Self::new()
    }
}

struct MxInner {
    owner: *const TaskCore,
    waiters: VecDeque<Arc<TaskCore>>,
}

/// Non-recursive task mutex guarding `T`. FIFO handoff: unlock assigns
/// ownership to the oldest waiter before waking it.
pub struct Mutex<T: ?Sized> {
    inner: RawLock<MxInner>,
    data: UnsafeCell<T>,
}

// Safety: the data is handed out only under ownership; the owner pointer is
// an identity tag.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Mutex<T> {
        Mutex {
            inner: RawLock::new(MxInner {
                owner: std::ptr::null(),
                waiters: VecDeque::new(),
            }),
            data: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let Some(me) = task::current() else {
            kabort!("mutex used off-task");
        };
        let me_ptr = Arc::as_ptr(&me);
        interrupts::disable();
        let mut inner = self.inner.lock();
        if inner.owner.is_null() {
            inner.owner = me_ptr;
            drop(inner);
            interrupts::enable();
        } else if inner.owner == me_ptr {
            kabort!("recursive acquisition of a non-recursive mutex");
        } else {
            inner.waiters.push_back(me);
            std::mem::forget(inner);
            task::schedule_release(&self.inner);
            interrupts::enable();
        }
        MutexGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let Some(me) = task::current() else {
            kabort!("mutex used off-task");
        };
        interrupts::disable();
        let mut inner = self.inner.lock();
        let got = inner.owner.is_null();
        if got {
            inner.owner = Arc::as_ptr(&me);
        }
        drop(inner);
        interrupts::enable();
        got.then_some(MutexGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    pub(crate) fn unlock_internal(&self) {
        interrupts::disable();
        if let Some(next) = self.release_deferred() {
            task::wake(next);
        }
        interrupts::enable();
    }

    /// Release ownership but hand the successor back instead of waking it;
    /// the condition variable defers that wake to the kernel stack.
    pub(crate) fn release_deferred(&self) -> Option<Arc<TaskCore>> {
        interrupts::disable();
        let mut inner = self.inner.lock();
        let next = match inner.waiters.pop_front() {
            Some(next) => {
                inner.owner = Arc::as_ptr(&next);
                Some(next)
            }
            None => {
                inner.owner = std::ptr::null();
                None
            }
        };
        drop(inner);
        interrupts::enable();
        next
    }
}

pub struct MutexGuard<'a, T: ?Sized> {
    lock: &'a Mutex<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> MutexGuard<'a, T> {
    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.lock
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_internal();
    }
}
