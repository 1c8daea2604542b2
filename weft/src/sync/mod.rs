//! Blocking primitives for tasks.
//!
//! Everything here parks the *task*, never the kernel thread: a blocked
//! waiter hands its processor to the next ready task. The spinlock is the
//! exception — it spins — and exists for the short critical sections the
//! rest of the runtime is built from.

mod condvar;
mod mutex;
mod semaphore;
mod spinlock;

pub use condvar::Condvar;
pub use mutex::{Mutex, MutexGuard, OwnerLock};
pub use semaphore::Semaphore;
pub use spinlock::{SpinLock, SpinLockGuard};
