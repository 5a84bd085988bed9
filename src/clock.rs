//! Time source used to compute read deadlines.

use std::fmt;

use tokio::time::Instant;

/// Source of the current instant.
///
/// Injected through [`ConnectionOptions`](crate::ConnectionOptions) so
/// keepalive deadlines can be computed against a controlled clock.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current instant.
    fn now(&self) -> Instant;
}

/// Clock backed by the tokio timer.
///
/// Honors `tokio::time::pause`, which keeps deadline tests deterministic.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl fmt::Debug for dyn Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Clock")
    }
}
