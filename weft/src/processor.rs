//! Virtual processors and the per-processor scheduler kernel.
//!
//! A processor is a kernel thread bound to one cluster at a time. Its thread
//! runs the processor kernel on the thread's own stack: dequeue a task
//! (external queue first, so bound work is preferred), switch into it, run
//! the deferred on-behalf action when control comes back, repeat. With
//! nothing to do it spins briefly, then parks in the cluster's pause
//! protocol.
//!
//! Every processor also owns a *processor task* — a bound task that serves
//! as its control channel. Re-binding, preemption changes and termination
//! are commands executed by that task on the processor itself, so timer and
//! affinity calls always run on the thread they affect.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use force_send_sync::SendSync;
use spin::{Mutex, Once};

use crate::cluster::{Cluster, ClusterCore};
use crate::preempt::{self, EventList, interrupts};
use crate::sync::Semaphore;
use crate::task::{self, TaskCore, TaskState};
use crate::{kabort, local, signals};

/// Default preemption period, in milliseconds.
pub const DEFAULT_PREEMPTION_MS: u64 = 10;

/// Default number of empty scheduler iterations before a processor parks.
pub const DEFAULT_SPIN: u32 = 1000;

fn next_processor_id() -> u32 {
    static NEXT_ID: AtomicU32 = AtomicU32::new(0);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

enum ProcCmd {
    SetPreemption(u64),
    SetCluster(Arc<ClusterCore>),
    SetAffinity(Vec<usize>),
    Terminate,
}

pub struct ProcessorCore {
    id: u32,
    cluster: Mutex<Arc<ClusterCore>>,
    preemption_ms: AtomicU64,
    spin_budget: AtomicU32,
    /// Work targeted at this specific processor (bound tasks).
    pub(crate) external: Mutex<VecDeque<Arc<TaskCore>>>,
    pub(crate) events: Mutex<EventList>,
    timer: Once<SendSync<libc::timer_t>>,
    tid: Once<libc::pthread_t>,
    terminated: AtomicBool,
    ctl_cmds: Mutex<VecDeque<ProcCmd>>,
    ctl_sem: Semaphore,
}

impl ProcessorCore {
    pub(crate) fn cluster(&self) -> Arc<ClusterCore> {
        self.cluster.lock().clone()
    }

    pub(crate) fn preemption_ms(&self) -> u64 {
        self.preemption_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn thread_id(&self) -> Option<libc::pthread_t> {
        self.tid.get().copied()
    }

    /// Re-arm this processor's alarm for the earliest event, or disarm it
    /// when the list is empty.
    pub(crate) fn rearm_timer(&self) {
        if let Some(timer) = self.timer.get() {
            let next = self.events.lock().next_deadline();
            preempt::arm_timer(**timer, next);
        }
    }
}

fn send_cmd(core: &Arc<ProcessorCore>, cmd: ProcCmd) {
    interrupts::disable();
    core.ctl_cmds.lock().push_back(cmd);
    interrupts::enable();
    core.ctl_sem.v();
}

/// Main loop of the processor task (the control channel).
fn ctl_main(proc: Arc<ProcessorCore>) {
    loop {
        proc.ctl_sem.p_uninterruptible();
        loop {
            interrupts::disable();
            let cmd = proc.ctl_cmds.lock().pop_front();
            interrupts::enable();
            let Some(cmd) = cmd else { break };
            match cmd {
                ProcCmd::SetPreemption(ms) => {
                    proc.preemption_ms.store(ms, Ordering::Relaxed);
                    interrupts::disable();
                    preempt::set_context_switch_event(ms);
                    interrupts::enable();
                }
                ProcCmd::SetCluster(to) => {
                    let from = proc.cluster();
                    if !Arc::ptr_eq(&from, &to) {
                        from.processor_remove(&proc);
                        interrupts::disable();
                        *proc.cluster.lock() = to.clone();
                        interrupts::enable();
                        to.processor_add(&proc);
                        // The control task follows its processor.
                        if let Some(me) = task::current() {
                            from.task_remove(&me);
                            to.task_add(&me);
                            me.set_cluster(&to);
                        }
                        log::debug!(
                            "processor {} moved from cluster '{}' to '{}'",
                            proc.id,
                            from.name(),
                            to.name()
                        );
                    }
                }
                ProcCmd::SetAffinity(cpus) => {
                    unsafe {
                        let mut set: libc::cpu_set_t = std::mem::zeroed();
                        libc::CPU_ZERO(&mut set);
                        for cpu in cpus {
                            libc::CPU_SET(cpu, &mut set);
                        }
                        libc::pthread_setaffinity_np(
                            libc::pthread_self(),
                            std::mem::size_of::<libc::cpu_set_t>(),
                            &set,
                        );
                    }
                }
                ProcCmd::Terminate => {
                    proc.terminated.store(true, Ordering::Release);
                    return;
                }
            }
        }
    }
}

/// Switch into `task` and take care of the aftermath once it switches back.
fn dispatch(task: Arc<TaskCore>) {
    debug_assert_eq!(task.state(), TaskState::Ready);
    task.state.store(TaskState::Running, Ordering::Release);
    let co_ctx = task.current_coroutine().context();
    let kernel_ctx = local::with(|l| {
        l.current_task.set(Arc::as_ptr(&task));
        l.in_kernel.set(false);
        l.kernel_ctx.get()
    });
    unsafe { crate::context::switch(kernel_ctx, co_ctx) };
    local::with(|l| {
        l.in_kernel.set(true);
        l.current_task.set(std::ptr::null());
    });
    // Before the on-behalf action publishes the task to wakers: nobody else
    // can be touching the suspended context yet.
    task.current_coroutine().verify_suspended();
    task::run_on_behalf();
}

/// The processor kernel: runs on the kernel thread's own stack for the life
/// of the processor.
fn kernel_main(proc: Arc<ProcessorCore>) {
    local::with(|l| {
        l.kernel_id.set(proc.id);
        l.processor.set(Arc::as_ptr(&proc));
        l.in_kernel.set(true);
        l.disable_int.set(true);
        l.disable_int_cnt.set(1);
    });
    proc.tid.call_once(|| unsafe { libc::pthread_self() });
    let _alt_stack = signals::AltStack::install();
    proc.timer
        .call_once(|| unsafe { SendSync::new(preempt::create_timer()) });
    preempt::set_context_switch_event(proc.preemption_ms());
    log::debug!(
        "processor {} serving cluster '{}'",
        proc.id,
        proc.cluster().name()
    );

    let mut spin: u32 = 0;
    loop {
        if proc.terminated.load(Ordering::Acquire) {
            break;
        }
        let cluster = proc.cluster();
        let next = {
            let external = proc.external.lock().pop_front();
            external.or_else(|| cluster.sched.lock().ready.pop())
        };
        match next {
            Some(task) => {
                spin = 0;
                dispatch(task);
            }
            None => {
                let roll = local::with(|l| l.rf_pending.get() && !l.rf_in_progress.get());
                if roll {
                    preempt::roll_forward(false);
                }
                spin += 1;
                for _ in 0..64 {
                    core::hint::spin_loop();
                }
                if spin > proc.spin_budget.load(Ordering::Relaxed) {
                    cluster.processor_pause(&proc);
                    spin = 0;
                }
            }
        }
    }

    preempt::set_context_switch_event(0);
    if let Some(timer) = proc.timer.get() {
        preempt::delete_timer(**timer);
    }
    proc.cluster().processor_remove(&proc);
    local::with(|l| {
        l.processor.set(std::ptr::null());
        l.in_kernel.set(false);
        l.disable_int.set(false);
        l.disable_int_cnt.set(0);
    });
    log::debug!("processor {} stopped", proc.id);
}

/// Handle to a virtual processor. Dropping it terminates the kernel thread
/// (after the current task switches out) and joins it.
pub struct Processor {
    core: Arc<ProcessorCore>,
    thread: Option<std::thread::JoinHandle<()>>,
    ctl_task: Option<task::Task>,
}

impl Processor {
    /// A processor with the default preemption period and spin budget.
    pub fn new(cluster: &Cluster) -> Processor {
        Self::with_config(cluster, DEFAULT_PREEMPTION_MS, DEFAULT_SPIN)
    }

    /// A processor with an explicit preemption period (milliseconds, 0
    /// disables) and spin budget.
    pub fn with_config(cluster: &Cluster, preemption_ms: u64, spin_budget: u32) -> Processor {
        crate::bootstrap();
        let core = Arc::new(ProcessorCore {
            id: next_processor_id(),
            cluster: Mutex::new(cluster.core().clone()),
            preemption_ms: AtomicU64::new(preemption_ms),
            spin_budget: AtomicU32::new(spin_budget),
            external: Mutex::new(VecDeque::new()),
            events: Mutex::new(EventList::new()),
            timer: Once::new(),
            tid: Once::new(),
            terminated: AtomicBool::new(false),
            ctl_cmds: Mutex::new(VecDeque::new()),
            ctl_sem: Semaphore::new(0),
        });
        cluster.core().processor_add(&core);
        crate::register_processor(&core);

        let ctl_core = core.clone();
        let ctl_task = cluster
            .task_builder(&format!("processor-{}-ctl", core.id))
            .stack_size(crate::stack::MIN_STACK_SIZE * 4)
            .bound_to_core(&core)
            .spawn(move || ctl_main(ctl_core));

        let thread_core = core.clone();
        let thread = std::thread::Builder::new()
            .name(format!("weft-processor-{}", core.id))
            .spawn(move || kernel_main(thread_core))
            .unwrap_or_else(|e| kabort!("processor thread spawn failed: {e}"));

        Processor {
            core,
            thread: Some(thread),
            ctl_task: Some(ctl_task),
        }
    }

    pub fn id(&self) -> u32 {
        self.core.id
    }

    /// Current preemption period in milliseconds (0 = disabled).
    pub fn preemption(&self) -> u64 {
        self.core.preemption_ms()
    }

    /// Re-program the preemption period, applied on the processor itself.
    pub fn set_preemption(&self, period_ms: u64) {
        send_cmd(&self.core, ProcCmd::SetPreemption(period_ms));
    }

    /// Migrate the processor (and its control task) to another cluster.
    pub fn set_cluster(&self, cluster: &Cluster) {
        send_cmd(&self.core, ProcCmd::SetCluster(cluster.core().clone()));
    }

    /// Pin the processor's kernel thread to the given CPUs.
    pub fn set_affinity(&self, cpus: &[usize]) {
        send_cmd(&self.core, ProcCmd::SetAffinity(cpus.to_vec()));
    }

    pub(crate) fn core(&self) -> &Arc<ProcessorCore> {
        &self.core
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        if let Some(me) = local::try_get_processor() {
            if std::ptr::eq(me, Arc::as_ptr(&self.core)) {
                kabort!("processor {} dropped from a task it is running", self.core.id);
            }
        }
        send_cmd(&self.core, ProcCmd::Terminate);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.ctl_task.take();
    }
}
