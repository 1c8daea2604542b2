//! Clusters: isolated scheduling domains.
//!
//! A cluster owns one ready queue, the set of processors currently serving
//! it, a LIFO stack of the idle ones (last-idled first, to keep caches warm),
//! the task set, and one I/O poller state. All list manipulation happens
//! under a single spinlock held only across O(1) link operations; wakeup
//! signals are sent after the lock is released.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use spin::Mutex;

use crate::poller::{FdInterest, FdSet, PollerState};
use crate::preempt::{self, interrupts};
use crate::processor::ProcessorCore;
use crate::sched::{FifoQueue, ReadyQueue};
use crate::stack::DEFAULT_STACK_SIZE;
use crate::task::{Task, TaskBuilder, TaskCore, TaskState};
use crate::{local, signals};

fn next_cluster_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) struct ClusterSched {
    pub ready: Box<dyn ReadyQueue>,
    pub idle: Vec<Arc<ProcessorCore>>,
}

pub struct ClusterCore {
    id: u64,
    name: Box<str>,
    default_stack: AtomicUsize,
    pub(crate) sched: Mutex<ClusterSched>,
    tasks: Mutex<Vec<Weak<TaskCore>>>,
    pub(crate) procs: Mutex<Vec<Weak<ProcessorCore>>>,
    pub(crate) poller: PollerState,
}

impl ClusterCore {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn default_stack_size(&self) -> usize {
        self.default_stack.load(Ordering::Relaxed)
    }

    /// Make `task` ready to run. Requires the interrupt-disable bracket.
    ///
    /// Bound tasks go to their processor's external queue; everything else
    /// joins the ready queue. One idle processor is woken when the task came
    /// from elsewhere (a migration or an off-cluster waker) or when ready
    /// work is already backed up; otherwise the waker's own processor will
    /// pick the task up at its next dispatch. With no idle processor left,
    /// a poller blocked in its wait is kicked instead.
    pub(crate) fn make_task_ready(self: &Arc<Self>, task: Arc<TaskCore>) {
        let state = task.state.load(Ordering::Acquire);
        match state {
            TaskState::Ready | TaskState::Terminate => {
                crate::kabort!(
                    "task '{}' made ready while already {:?}",
                    task.name(),
                    state
                );
            }
            _ => {}
        }
        task.state.store(TaskState::Ready, Ordering::Release);

        if let Some(processor) = task.bound_processor() {
            // Push before the idle check: the pause protocol rechecks the
            // external queue inside the same sched critical section it uses
            // to go idle, so one of the two sides must observe the other.
            processor.external.lock().push_back(task);
            let mut wake = None;
            {
                let mut sched = self.sched.lock();
                if let Some(at) = sched
                    .idle
                    .iter()
                    .position(|p| Arc::ptr_eq(p, &processor))
                {
                    sched.idle.remove(at);
                    wake = processor.thread_id();
                }
            }
            if let Some(tid) = wake {
                signals::wake_thread(tid);
            }
            return;
        }

        let cross_cluster = match local::try_get_processor() {
            Some(p) => !Arc::ptr_eq(&unsafe { &*p }.cluster(), self),
            None => true,
        };
        let (wake, want_wake) = {
            let mut sched = self.sched.lock();
            sched.ready.push(task);
            let want_wake = cross_cluster || sched.ready.len() > 1;
            let wake = if want_wake {
                sched.idle.pop().and_then(|p| p.thread_id())
            } else {
                None
            };
            (wake, want_wake)
        };
        if let Some(tid) = wake {
            signals::wake_thread(tid);
        } else if want_wake {
            // Every processor is busy or camped inside the poller's wait.
            if let Some(tid) = self.poller.blocked_thread() {
                signals::wake_thread(tid);
            }
        }
    }

    /// Batch variant: enqueue everything, then wake up to one idle processor
    /// per task under a single lock acquisition.
    pub(crate) fn make_task_ready_batch(self: &Arc<Self>, tasks: Vec<Arc<TaskCore>>) {
        if tasks.is_empty() {
            return;
        }
        let mut unbound = Vec::with_capacity(tasks.len());
        for task in tasks {
            if task.bound_processor().is_some() {
                self.make_task_ready(task);
            } else {
                unbound.push(task);
            }
        }
        let mut wakes = Vec::new();
        {
            let mut sched = self.sched.lock();
            for task in unbound {
                task.state.store(TaskState::Ready, Ordering::Release);
                sched.ready.push(task);
                if let Some(p) = sched.idle.pop() {
                    wakes.extend(p.thread_id());
                }
            }
        }
        for tid in wakes {
            signals::wake_thread(tid);
        }
    }

    /// Park the calling processor until work or a signal arrives. Kernel
    /// stack only.
    ///
    /// The mask bracket is load-bearing: the runtime signals are blocked
    /// before the idle stack push, and `sigsuspend` atomically re-opens the
    /// saved mask, so a wakeup signalled between the two stays pending
    /// rather than lost. A preemption deferred into the bracket aborts the
    /// pause instead of sleeping on it.
    pub(crate) fn processor_pause(self: &Arc<Self>, processor: &Arc<ProcessorCore>) {
        if processor.preemption_ms() != 0 {
            // Keep the alarm armed only for user events while idle.
            preempt::set_context_switch_event(0);
        }

        let sched = self.sched.lock();
        let has_work = !sched.ready.is_empty() || !processor.external.lock().is_empty();
        if has_work {
            drop(sched);
        } else {
            let mut sched = sched;
            let old_mask = signals::block_runtime();
            let rf_pending =
                local::with(|l| l.rf_pending.get() && !l.rf_in_progress.get());
            if rf_pending {
                drop(sched);
                signals::restore_mask(&old_mask);
            } else {
                sched.idle.push(processor.clone());
                drop(sched);
                signals::suspend(&old_mask);
                signals::restore_mask(&old_mask);
                // May have been popped by the waker already.
                let mut sched = self.sched.lock();
                if let Some(at) = sched
                    .idle
                    .iter()
                    .position(|p| Arc::ptr_eq(p, processor))
                {
                    sched.idle.remove(at);
                }
            }
        }

        if processor.preemption_ms() != 0 {
            preempt::set_context_switch_event(processor.preemption_ms());
        }
    }

    /// Work visible to the poller's zero-vs-unbounded decision: anything in
    /// the ready queue or any processor's external queue.
    pub(crate) fn has_visible_work(&self) -> bool {
        if !self.sched.lock().ready.is_empty() {
            return true;
        }
        self.procs
            .lock()
            .iter()
            .filter_map(|w| w.upgrade())
            .any(|p| !p.external.lock().is_empty())
    }

    pub(crate) fn task_add(&self, task: &Arc<TaskCore>) {
        interrupts::disable();
        let mut tasks = self.tasks.lock();
        tasks.retain(|w| w.strong_count() > 0);
        tasks.push(Arc::downgrade(task));
        drop(tasks);
        interrupts::enable();
    }

    pub(crate) fn task_remove(&self, task: &Arc<TaskCore>) {
        interrupts::disable();
        self.tasks
            .lock()
            .retain(|w| w.upgrade().is_some_and(|t| !Arc::ptr_eq(&t, task)));
        interrupts::enable();
    }

    pub(crate) fn processor_add(&self, processor: &Arc<ProcessorCore>) {
        interrupts::disable();
        self.procs.lock().push(Arc::downgrade(processor));
        interrupts::enable();
    }

    pub(crate) fn processor_remove(&self, processor: &Arc<ProcessorCore>) {
        interrupts::disable();
        {
            let mut sched = self.sched.lock();
            if let Some(at) = sched
                .idle
                .iter()
                .position(|p| Arc::ptr_eq(p, processor))
            {
                sched.idle.remove(at);
            }
        }
        self.procs
            .lock()
            .retain(|w| w.upgrade().is_some_and(|p| !Arc::ptr_eq(&p, processor)));
        interrupts::enable();
    }

    pub(crate) fn task_count(&self) -> usize {
        self.tasks
            .lock()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub(crate) fn processor_count(&self) -> usize {
        self.procs
            .lock()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

/// Handle to a scheduling domain. Clones share the same cluster.
#[derive(Clone)]
pub struct Cluster {
    core: Arc<ClusterCore>,
}

impl Cluster {
    /// A cluster with FIFO dispatch and default stack size.
    pub fn new(name: &str) -> Cluster {
        Self::builder(name).build()
    }

    pub fn builder(name: &str) -> ClusterBuilder {
        ClusterBuilder {
            name: name.to_string(),
            stack_size: DEFAULT_STACK_SIZE,
            ready_queue: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn id(&self) -> u64 {
        self.core.id()
    }

    pub fn default_stack_size(&self) -> usize {
        self.core.default_stack_size()
    }

    pub fn set_default_stack_size(&self, bytes: usize) {
        self.core.default_stack.store(bytes, Ordering::Relaxed);
    }

    /// Number of live tasks on this cluster.
    pub fn task_count(&self) -> usize {
        self.core.task_count()
    }

    /// Number of processors currently serving this cluster.
    pub fn processor_count(&self) -> usize {
        self.core.processor_count()
    }

    /// Spawn a task with defaults; see [`Cluster::task_builder`] for knobs.
    pub fn spawn<F>(&self, name: &str, f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        self.task_builder(name).spawn(f)
    }

    pub fn task_builder(&self, name: &str) -> TaskBuilder<'_> {
        TaskBuilder::new(self, name)
    }

    /// Wait until `fd` is ready for `interest`, then perform `action` (the
    /// actual non-blocking system call). `action` is attempted once up
    /// front; on `WouldBlock` the task joins the cluster's poller. A timeout
    /// completes with `Ok(0)`.
    pub fn poll_fd<F>(
        &self,
        fd: i32,
        interest: FdInterest,
        timeout: Option<std::time::Duration>,
        action: F,
    ) -> std::io::Result<usize>
    where
        F: FnMut() -> std::io::Result<usize> + Send,
    {
        crate::poller::poll_fd(&self.core, fd, interest, timeout, action)
    }

    /// `select`-shaped multiplexing across full descriptor sets. Ready
    /// descriptors are written back into the passed sets; the return value
    /// counts them. A zero timeout polls exactly once; `None` waits
    /// indefinitely.
    pub fn select(
        &self,
        nfds: i32,
        rfds: Option<&mut FdSet>,
        wfds: Option<&mut FdSet>,
        efds: Option<&mut FdSet>,
        timeout: Option<std::time::Duration>,
    ) -> std::io::Result<usize> {
        crate::poller::select(&self.core, nfds, rfds, wfds, efds, timeout)
    }

    pub(crate) fn core(&self) -> &Arc<ClusterCore> {
        &self.core
    }
}

pub struct ClusterBuilder {
    name: String,
    stack_size: usize,
    ready_queue: Option<Box<dyn ReadyQueue>>,
}

impl ClusterBuilder {
    /// Default stack size for tasks spawned here.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Replace the FIFO dispatch discipline.
    pub fn ready_queue(mut self, queue: Box<dyn ReadyQueue>) -> Self {
        self.ready_queue = Some(queue);
        self
    }

    pub fn build(self) -> Cluster {
        crate::bootstrap();
        let core = Arc::new(ClusterCore {
            id: next_cluster_id(),
            name: self.name.into(),
            default_stack: AtomicUsize::new(self.stack_size),
            sched: Mutex::new(ClusterSched {
                ready: self
                    .ready_queue
                    .unwrap_or_else(|| Box::new(FifoQueue::new())),
                idle: Vec::new(),
            }),
            tasks: Mutex::new(Vec::new()),
            procs: Mutex::new(Vec::new()),
            poller: PollerState::new(),
        });
        crate::register_cluster(&core);
        log::debug!("cluster '{}' created", core.name);
        Cluster { core }
    }
}
