//! Retry backoff strategies.

use std::fmt;
use std::time::Duration;

use spool_core::defaults::BACKOFF_BASE_SECS;

/// Computes how long a failed job waits before it is eligible again.
///
/// `retry_count` is the job's retry count *after* the failed attempt has been
/// recorded, so the first reschedule sees `1`.
pub trait BackoffStrategy: Send + Sync + fmt::Debug {
    fn delay(&self, retry_count: u32) -> Duration;
}

/// `base * retry_count^3`: 0s, 30s, 240s, 810s, ... with the default base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CubicBackoff {
    base: Duration,
}

impl CubicBackoff {
    pub fn new(base: Duration) -> Self {
        Self { base }
    }
}

impl Default for CubicBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(BACKOFF_BASE_SECS))
    }
}

impl BackoffStrategy for CubicBackoff {
    fn delay(&self, retry_count: u32) -> Duration {
        let factor = u64::from(retry_count).saturating_pow(3);
        match u32::try_from(factor) {
            Ok(factor) => self.base.saturating_mul(factor),
            Err(_) if self.base.is_zero() => Duration::ZERO,
            Err(_) => Duration::MAX,
        }
    }
}

/// Same delay after every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantBackoff(pub Duration);

impl BackoffStrategy for ConstantBackoff {
    fn delay(&self, _retry_count: u32) -> Duration {
        self.0
    }
}
