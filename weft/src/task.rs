//! Tasks: coroutines with a schedulable state.
//!
//! A task leaves `Running` through one of the `schedule_*` entry points. The
//! work done "on behalf of" the blocking task — releasing the lock it held,
//! waking its successor, requeueing it after a yield — is handed to the
//! processor kernel and runs on the kernel stack *after* the context switch,
//! so the blocking side's stack is off-CPU before anyone can observe it
//! blocked. That ordering is what makes wake-before-block impossible.

use std::cell::Cell;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use atomic_enum::atomic_enum;
use spin::Mutex;

use crate::cancel::{self, CancelMode};
use crate::cluster::{Cluster, ClusterCore};
use crate::context;
use crate::coroutine::CoroutineCore;
use crate::local::{self, OnBehalf};
use crate::preempt::{self, Expire, interrupts};
use crate::processor::ProcessorCore;
use crate::stack::Stack;
use crate::{kabort, signals};

#[atomic_enum]
#[derive(PartialEq, Eq)]
pub enum TaskState {
    /// Created, never dispatched.
    Start,
    /// Linked into a ready or external queue.
    Ready,
    /// Some processor's current task.
    Running,
    /// Suspended with no queue linkage; owned by whatever will wake it.
    Blocked,
    /// Main returned; terminal.
    Terminate,
}

fn next_task_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Default)]
struct JoinState {
    done: bool,
    tasks: Vec<Arc<TaskCore>>,
    threads: Vec<std::thread::Thread>,
}

/// Shared task record. Queues and current-task slots hold `Arc`s; the
/// cluster's task set holds a weak back-reference.
pub struct TaskCore {
    id: u64,
    name: Box<str>,
    pub(crate) state: AtomicTaskState,
    root: Arc<CoroutineCore>,
    /// Lock-free: read from the preemption path, which may interrupt any
    /// instruction. The pointee is kept alive by `root` or by the live
    /// `Coroutine` handle (which cannot drop while its coroutine executes).
    curr_co: AtomicPtr<CoroutineCore>,
    cluster: Mutex<Arc<ClusterCore>>,
    pub(crate) bound: Mutex<Option<Weak<ProcessorCore>>>,
    join: Mutex<JoinState>,
}

impl TaskCore {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        self.state.load(Ordering::Acquire)
    }

    pub(crate) fn cluster(&self) -> Arc<ClusterCore> {
        self.cluster.lock().clone()
    }

    pub(crate) fn set_cluster(&self, cluster: &Arc<ClusterCore>) {
        interrupts::disable();
        *self.cluster.lock() = cluster.clone();
        interrupts::enable();
    }

    pub(crate) fn root_coroutine(&self) -> Arc<CoroutineCore> {
        self.root.clone()
    }

    pub(crate) fn current_coroutine(&self) -> Arc<CoroutineCore> {
        let p = self.curr_co.load(Ordering::Acquire);
        // Safety: see the field invariant; the pointee is alive.
        unsafe {
            Arc::increment_strong_count(p);
            Arc::from_raw(p)
        }
    }

    pub(crate) fn set_current_coroutine(&self, co: &Arc<CoroutineCore>) {
        self.curr_co
            .store(Arc::as_ptr(co) as *mut CoroutineCore, Ordering::Release);
    }

    pub(crate) fn bound_processor(&self) -> Option<Arc<ProcessorCore>> {
        self.bound.lock().as_ref().and_then(|w| w.upgrade())
    }
}

/// The coroutine the calling context is executing right now.
pub(crate) fn current_coroutine() -> Option<Arc<CoroutineCore>> {
    local::current_task().map(|t| t.current_coroutine())
}

/// The task the calling context runs on, if any.
pub(crate) fn current() -> Option<Arc<TaskCore>> {
    local::current_task()
}

/// Name of the current task, for diagnostics.
pub fn current_name() -> Option<String> {
    local::current_task().map(|t| t.name.to_string())
}

// ---------------------------------------------------------------------------
// The scheduling protocol.

/// Switch from the current task's coroutine to the processor kernel.
///
/// # Safety
/// Must run on a task with interrupts disabled; the kernel context of this
/// thread must be live (the thread is a processor).
unsafe fn switch_to_kernel() {
    let (co_ctx, kernel_ctx) = local::with(|l| {
        debug_assert!(l.disable_int.get(), "scheduling with interrupts enabled");
        let task = unsafe { &*l.current_task.get() };
        (task.current_coroutine().context(), l.kernel_ctx.get())
    });
    unsafe { context::switch(co_ctx, kernel_ctx) };
}

unsafe fn unlock_shim<T>(lock: *const ()) {
    unsafe { (*(lock as *const Mutex<T>)).force_unlock() };
}

fn current_or_die() -> Arc<TaskCore> {
    local::current_task()
        .unwrap_or_else(|| kabort!("scheduling entry point used off-task"))
}

/// Block the current task. Interrupts must be disabled; the caller re-enables
/// (and polls) after the task is woken.
pub(crate) fn schedule() {
    let task = current_or_die();
    task.state.store(TaskState::Blocked, Ordering::Release);
    local::set_on_behalf(OnBehalf::None);
    unsafe { switch_to_kernel() };
}

/// Block the current task; the processor kernel releases `lock` after the
/// switch. The caller must hold `lock` with its guard forgotten.
pub(crate) fn schedule_release<T>(lock: &Mutex<T>) {
    let task = current_or_die();
    task.state.store(TaskState::Blocked, Ordering::Release);
    local::set_on_behalf(OnBehalf::Release {
        lock: lock as *const Mutex<T> as *const (),
        unlock: unlock_shim::<T>,
    });
    unsafe { switch_to_kernel() };
}

/// Block the current task; the processor kernel then makes `target` ready.
pub(crate) fn schedule_wake(target: Arc<TaskCore>) {
    let task = current_or_die();
    task.state.store(TaskState::Blocked, Ordering::Release);
    local::set_on_behalf(OnBehalf::Wake {
        task: Arc::into_raw(target),
    });
    unsafe { switch_to_kernel() };
}

/// Block the current task; the processor kernel releases `lock` and then
/// makes `target` ready.
pub(crate) fn schedule_release_wake<T>(lock: &Mutex<T>, target: Arc<TaskCore>) {
    let task = current_or_die();
    task.state.store(TaskState::Blocked, Ordering::Release);
    local::set_on_behalf(OnBehalf::ReleaseWake {
        lock: lock as *const Mutex<T> as *const (),
        unlock: unlock_shim::<T>,
        task: Arc::into_raw(target),
    });
    unsafe { switch_to_kernel() };
}

/// Give up the processor; the task goes to the back of its cluster's ready
/// queue. A poll point.
pub fn yield_now() {
    let Some(task) = local::current_task() else {
        // Off the runtime there is nothing to schedule around.
        std::thread::yield_now();
        return;
    };
    interrupts::disable();
    local::set_on_behalf(OnBehalf::Requeue {
        task: Arc::into_raw(task),
    });
    unsafe { switch_to_kernel() };
    interrupts::enable();
    cancel::poll_current();
}

/// Yield without the poll point; the poller uses this between cycles so a
/// cancellation cannot unwind it while it holds the poller role.
pub(crate) fn yield_no_poll() {
    let Some(task) = local::current_task() else {
        return;
    };
    interrupts::disable();
    local::set_on_behalf(OnBehalf::Requeue {
        task: Arc::into_raw(task),
    });
    unsafe { switch_to_kernel() };
    interrupts::enable();
}

/// Forced yield from the preemption path. When entered from the SIGALRM
/// handler the runtime signals are re-opened first, so the thread does not
/// run its next task with them blocked. No poll point: a panic cannot unwind
/// a signal frame.
pub(crate) fn preempt_yield(from_handler: bool) {
    let Some(task) = local::current_task() else {
        return;
    };
    interrupts::disable();
    if from_handler {
        signals::unblock_runtime();
    }
    local::set_on_behalf(OnBehalf::Requeue {
        task: Arc::into_raw(task),
    });
    unsafe { switch_to_kernel() };
    interrupts::enable_no_rf();
}

/// Terminal transfer of a finished task: the kernel finalizes it (task-set
/// removal, join wakeups) on its own stack.
pub(crate) fn terminate_current() -> ! {
    let task = current_or_die();
    task.state.store(TaskState::Terminate, Ordering::Release);
    local::set_on_behalf(OnBehalf::Finalize {
        task: Arc::into_raw(task),
    });
    unsafe { switch_to_kernel() };
    kabort!("terminated task was rescheduled");
}

/// Make a blocked task ready on its home cluster.
pub(crate) fn wake(task: Arc<TaskCore>) {
    let state = task.state.load(Ordering::Acquire);
    if state != TaskState::Blocked {
        kabort!("wake of task '{}' in state {:?}", task.name, state);
    }
    let cluster = task.cluster();
    cluster.make_task_ready(task);
}

/// Execute the deferred on-behalf action; processor-kernel stack only.
pub(crate) fn run_on_behalf() {
    let action = local::with(|l| l.on_behalf.take());
    match action {
        OnBehalf::None => {}
        OnBehalf::Release { lock, unlock } => unsafe { unlock(lock) },
        OnBehalf::Wake { task } => {
            let task = unsafe { Arc::from_raw(task) };
            wake(task);
        }
        OnBehalf::ReleaseWake { lock, unlock, task } => {
            unsafe { unlock(lock) };
            let task = unsafe { Arc::from_raw(task) };
            wake(task);
        }
        OnBehalf::Requeue { task } => {
            let task = unsafe { Arc::from_raw(task) };
            let cluster = task.cluster();
            cluster.make_task_ready(task);
        }
        OnBehalf::Finalize { task } => {
            let task = unsafe { Arc::from_raw(task) };
            finalize(task);
        }
    }
}

fn finalize(task: Arc<TaskCore>) {
    let cluster = task.cluster();
    cluster.task_remove(&task);
    let (waiting_tasks, waiting_threads) = {
        let mut join = task.join.lock();
        join.done = true;
        (
            std::mem::take(&mut join.tasks),
            std::mem::take(&mut join.threads),
        )
    };
    for waiter in waiting_tasks {
        wake(waiter);
    }
    for thread in waiting_threads {
        thread.unpark();
    }
}

struct SleepWake {
    task: Mutex<Option<Arc<TaskCore>>>,
}

impl Expire for SleepWake {
    fn fire(&self) {
        if let Some(task) = self.task.lock().take() {
            wake(task);
        }
    }
}

/// Block the current task for at least `duration`. Resolution is the
/// preemption period of the processor the task sleeps on, finer if a sooner
/// event is armed. A poll point.
pub fn sleep(duration: std::time::Duration) {
    let Some(me) = local::current_task() else {
        std::thread::sleep(duration);
        return;
    };
    // Registration and block share one bracket so the alarm cannot fire on
    // this processor before the sleeper is off-CPU.
    interrupts::disable();
    preempt::register_user_event(
        std::time::Instant::now() + duration,
        Arc::new(SleepWake {
            task: Mutex::new(Some(me)),
        }),
    );
    schedule();
    interrupts::enable();
    cancel::poll_current();
}

/// Move the current task to another cluster. Takes effect at the requeue:
/// the task lands on the target cluster's ready queue.
pub fn migrate(to: &Cluster) {
    let Some(task) = local::current_task() else {
        kabort!("migrate off-task");
    };
    let to_core = to.core().clone();
    interrupts::disable();
    let from = task.cluster.lock().clone();
    if Arc::ptr_eq(&from, &to_core) {
        interrupts::enable();
        return;
    }
    *task.cluster.lock() = to_core.clone();
    interrupts::enable();
    from.task_remove(&task);
    to_core.task_add(&task);
    yield_now();
}

// ---------------------------------------------------------------------------
// The public handle.

/// Owning handle to a spawned task. Dropping it joins first, so a task's
/// stack never outlives the handle unseen; use [`Task::detach`] to opt out.
pub struct Task {
    core: Arc<TaskCore>,
    joined: Cell<bool>,
}

impl Task {
    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn state(&self) -> TaskState {
        self.core.state()
    }

    /// Mark the task cancelled; delivered at its poll points. Idempotent.
    pub fn cancel(&self) {
        self.core.root.cancel.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.root.cancel.cancelled.load(Ordering::Acquire)
    }

    /// Enable or disable cancellation delivery. Returns the previous state.
    pub fn set_cancel_state(&self, enabled: bool) -> bool {
        self.core.root.cancel.enabled.swap(enabled, Ordering::AcqRel)
    }

    /// Select the cancellation delivery mode. Returns the previous mode.
    pub fn set_cancel_type(&self, mode: CancelMode) -> CancelMode {
        self.core.root.cancel.mode.swap(mode, Ordering::AcqRel)
    }

    /// Post a resumption event, delivered at the task's next poll point with
    /// the event type enabled.
    pub fn raise_at<E: crate::resume::ResumeEvent>(&self, event: E) {
        crate::resume::post(&self.core.root, Box::new(event));
    }

    /// Wait until the task's main has returned. Callable from another task
    /// or from any plain OS thread.
    pub fn join(&self) {
        self.joined.set(true);
        if let Some(me) = local::current_task() {
            if Arc::ptr_eq(&me, &self.core) {
                kabort!("task '{}' joining itself", self.core.name);
            }
            interrupts::disable();
            let mut join = self.core.join.lock();
            if join.done {
                drop(join);
                interrupts::enable();
                return;
            }
            join.tasks.push(me);
            std::mem::forget(join);
            schedule_release(&self.core.join);
            interrupts::enable();
            cancel::poll_current();
        } else {
            loop {
                {
                    let mut join = self.core.join.lock();
                    if join.done {
                        return;
                    }
                    join.threads.push(std::thread::current());
                }
                std::thread::park();
            }
        }
    }

    /// Release the handle without joining.
    pub fn detach(self) {
        self.joined.set(true);
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<TaskCore> {
        &self.core
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if !self.joined.get() {
            self.join();
        }
    }
}

/// Configuration for a task before it is spawned.
pub struct TaskBuilder<'c> {
    cluster: &'c Cluster,
    name: String,
    stack_size: Option<usize>,
    stack: Option<Box<[u8]>>,
    bound: Option<Weak<ProcessorCore>>,
}

impl<'c> TaskBuilder<'c> {
    pub(crate) fn new(cluster: &'c Cluster, name: &str) -> Self {
        TaskBuilder {
            cluster,
            name: name.to_string(),
            stack_size: None,
            stack: None,
            bound: None,
        }
    }

    /// Runtime-allocated stack of this size (plus guard page).
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Run on caller-supplied stack storage; no guard page.
    pub fn stack(mut self, storage: Box<[u8]>) -> Self {
        self.stack = Some(storage);
        self
    }

    /// Bind the task to one processor: it is dispatched only from that
    /// processor's external queue.
    pub fn bound_to(mut self, processor: &crate::processor::Processor) -> Self {
        self.bound = Some(Arc::downgrade(processor.core()));
        self
    }

    pub(crate) fn bound_to_core(mut self, processor: &Arc<ProcessorCore>) -> Self {
        self.bound = Some(Arc::downgrade(processor));
        self
    }

    pub fn spawn<F>(self, f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        let cluster_core = self.cluster.core().clone();
        let stack = match self.stack {
            Some(storage) => Stack::from_user(storage),
            None => Stack::alloc(
                self.stack_size
                    .unwrap_or_else(|| cluster_core.default_stack_size()),
            ),
        };
        let root = CoroutineCore::new(&self.name, stack, Box::new(f), true);
        let core = Arc::new(TaskCore {
            id: next_task_id(),
            name: self.name.into(),
            state: AtomicTaskState::new(TaskState::Start),
            curr_co: AtomicPtr::new(Arc::as_ptr(&root) as *mut CoroutineCore),
            root,
            cluster: Mutex::new(cluster_core.clone()),
            bound: Mutex::new(self.bound),
            join: Mutex::new(JoinState::default()),
        });
        cluster_core.task_add(&core);
        log::trace!("task '{}' spawned on cluster '{}'", core.name, cluster_core.name());
        interrupts::disable();
        cluster_core.make_task_ready(core.clone());
        interrupts::enable();
        Task {
            core,
            joined: Cell::new(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Cluster, Processor};
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicUsize, Ordering as AtOrd};

    /// Exercise the bare scheduling protocol: one task parks with the plain
    /// variant, its partner blocks with the handoff variant, and each wakes
    /// the other exactly once.
    #[test]
    fn schedule_and_handoff_round_trip() {
        let cluster = Cluster::new("sched-unit");
        // Preemption off: the park/handoff order must stay deterministic.
        let _processor = Processor::with_config(&cluster, 0, 1000);
        let order = Arc::new(AtomicUsize::new(0));
        let partner: Arc<OnceLock<Arc<TaskCore>>> = Arc::new(OnceLock::new());

        let order_a = order.clone();
        let partner_a = partner.clone();
        let a = cluster.spawn("parker", move || {
            interrupts::disable();
            schedule();
            interrupts::enable();
            // Woken by the handoff; now unpark the partner.
            assert_eq!(order_a.fetch_add(1, AtOrd::SeqCst), 0);
            loop {
                if let Some(b) = partner_a.get() {
                    interrupts::disable();
                    wake(b.clone());
                    interrupts::enable();
                    break;
                }
                yield_now();
            }
        });

        let a_core = a.core().clone();
        let order_b = order.clone();
        let b = cluster.spawn("handoff", move || {
            interrupts::disable();
            schedule_wake(a_core);
            interrupts::enable();
            assert_eq!(order_b.fetch_add(1, AtOrd::SeqCst), 1);
        });
        partner.set(b.core().clone()).ok().unwrap();

        a.join();
        b.join();
        assert_eq!(order.load(AtOrd::SeqCst), 2);
    }

    #[test]
    fn yield_requeues_the_only_task() {
        let cluster = Cluster::new("yield-unit");
        let _processor = Processor::new(&cluster);
        let spins = Arc::new(AtomicUsize::new(0));
        let s = spins.clone();
        cluster
            .spawn("yielder", move || {
                for _ in 0..100 {
                    yield_now();
                    s.fetch_add(1, AtOrd::SeqCst);
                }
            })
            .join();
        assert_eq!(spins.load(AtOrd::SeqCst), 100);
    }
}
