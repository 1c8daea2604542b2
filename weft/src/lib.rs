//! weft: a user-level M:N threading runtime.
//!
//! Lightweight tasks and coroutines are multiplexed over a small pool of
//! kernel threads (*processors*) grouped into isolated scheduling domains
//! (*clusters*). Scheduling is cooperative FIFO with SIGALRM-driven
//! preemption; blocking I/O funnels through one `pselect`-driven poller per
//! cluster, so a would-block system call suspends only the calling task.
//!
//! ```no_run
//! let cluster = weft::Cluster::new("main");
//! let _processor = weft::Processor::new(&cluster);
//! let task = cluster.spawn("hello", || {
//!     weft::yield_now();
//! });
//! task.join();
//! ```

/// Unrecoverable runtime fault: report and abort. Internal invariant
/// violations are never unwound past.
macro_rules! kabort {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        eprintln!("weft: fatal: {}", format_args!($($arg)*));
        std::process::abort();
    }};
}
pub(crate) use kabort;

mod context;
mod heap;
mod local;
mod preempt;
mod signals;
mod stack;

pub mod cancel;
pub mod cluster;
pub mod coroutine;
pub mod logger;
pub mod poller;
pub mod processor;
pub mod resume;
pub mod sched;
pub mod sync;
pub mod task;
pub mod time;

pub use cancel::{CancelMode, cleanup_pop, cleanup_push, poll};
pub use cluster::{Cluster, ClusterBuilder};
pub use coroutine::{Coroutine, CoroutineState, UnhandledPanic, suspend, verify};
pub use poller::{FdInterest, FdSet};
pub use processor::Processor;
pub use stack::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
pub use task::{Task, TaskBuilder, TaskState, current_name, migrate, sleep, yield_now};

use std::sync::{Arc, Weak};

use spin::{Mutex, Once};

static BOOT: Once<()> = Once::new();

/// One-time process setup: the signal contract. Runs on first cluster or
/// processor construction.
pub(crate) fn bootstrap() {
    BOOT.call_once(|| {
        signals::install_handlers();
    });
}

// Process-wide cluster/processor registries, touched only at lifecycle
// boundaries.
static GLOBAL_CLUSTERS: Mutex<Vec<Weak<cluster::ClusterCore>>> = Mutex::new(Vec::new());
static GLOBAL_PROCESSORS: Mutex<Vec<Weak<processor::ProcessorCore>>> = Mutex::new(Vec::new());

pub(crate) fn register_cluster(cluster: &Arc<cluster::ClusterCore>) {
    let mut clusters = GLOBAL_CLUSTERS.lock();
    clusters.retain(|w| w.strong_count() > 0);
    clusters.push(Arc::downgrade(cluster));
}

pub(crate) fn register_processor(processor: &Arc<processor::ProcessorCore>) {
    let mut processors = GLOBAL_PROCESSORS.lock();
    processors.retain(|w| w.strong_count() > 0);
    processors.push(Arc::downgrade(processor));
}

/// Number of live clusters in the process.
pub fn cluster_count() -> usize {
    GLOBAL_CLUSTERS
        .lock()
        .iter()
        .filter(|w| w.strong_count() > 0)
        .count()
}

/// Number of live processors in the process.
pub fn processor_count() -> usize {
    GLOBAL_PROCESSORS
        .lock()
        .iter()
        .filter(|w| w.strong_count() > 0)
        .count()
}
