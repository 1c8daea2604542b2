//! Time helpers for the event engine and timed waits.

use std::time::{Duration, Instant};

/// A preemption period in milliseconds. Zero disables preemption.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Period(u64);

impl Period {
    /// Creates a new period with the specified milliseconds.
    pub fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    pub fn is_disabled(&self) -> bool {
        self.0 == 0
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.0)
    }
}

impl From<Period> for u64 {
    /// Returns the period in milliseconds.
    fn from(p: Period) -> Self {
        p.0
    }
}

/// Monotonic now; the base of every deadline in the runtime.
pub fn now() -> Instant {
    Instant::now()
}

/// Absolute deadline a relative wait maps to.
pub fn deadline_in(after: Duration) -> Instant {
    Instant::now() + after
}
