//! Injectable wall-clock source so TTL and expiry logic is deterministic under test.

use std::{sync::Arc, time::SystemTime};

/// Shared handle to the clock used across the synchronization layer.
pub type SharedClock = Arc<dyn Clock>;

/// Source of wall-clock time for cache freshness and session expiry decisions.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> SystemTime;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}
