use std::fmt::Debug;
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Milliseconds between the Unix epoch and the DTN epoch
/// (2000-01-01T00:00:00Z).
pub const DTN_EPOCH_UNIX_MS: u64 = 946_684_800_000;

/// Milliseconds since the DTN epoch.
pub type DtnTime = u64;

/// Source of wall-clock and monotonic time for the agent.
///
/// All protocol timestamps are expressed as milliseconds since the DTN
/// epoch. Abstracting the clock keeps the processor, router, and contact
/// manager deterministic under test.
pub trait TimeProvider: Send + Sync + Debug {
    fn now_instant(&self) -> Instant;

    /// Current time in milliseconds since the DTN epoch.
    fn now_dtn_ms(&self) -> DtnTime;
}

/// The real system clock, shifted by an optional launch-time offset.
#[derive(Debug, Default)]
pub struct SystemTimeProvider {
    offset_ms: i64,
}

impl SystemTimeProvider {
    pub fn new() -> Self {
        Self { offset_ms: 0 }
    }

    /// A clock shifted by `offset_ms` relative to the system clock,
    /// e.g. for nodes without a synchronized RTC.
    pub fn with_offset(offset_ms: i64) -> Self {
        Self { offset_ms }
    }
}

impl TimeProvider for SystemTimeProvider {
    fn now_instant(&self) -> Instant {
        Instant::now()
    }

    fn now_dtn_ms(&self) -> DtnTime {
        let unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let dtn = unix_ms.saturating_sub(DTN_EPOCH_UNIX_MS) as i64 + self.offset_ms;
        dtn.max(0) as DtnTime
    }
}

/// A manual time provider for deterministic tests.
#[derive(Debug)]
pub struct ManualTimeProvider {
    instant: RwLock<Instant>,
    dtn_ms: RwLock<DtnTime>,
}

impl ManualTimeProvider {
    pub fn new(dtn_ms: DtnTime) -> Self {
        Self {
            instant: RwLock::new(Instant::now()),
            dtn_ms: RwLock::new(dtn_ms),
        }
    }

    pub fn set(&self, dtn_ms: DtnTime) {
        *self.dtn_ms.write().unwrap() = dtn_ms;
    }

    pub fn advance(&self, duration: Duration) {
        *self.instant.write().unwrap() += duration;
        *self.dtn_ms.write().unwrap() += duration.as_millis() as u64;
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now_instant(&self) -> Instant {
        *self.instant.read().unwrap()
    }

    fn now_dtn_ms(&self) -> DtnTime {
        *self.dtn_ms.read().unwrap()
    }
}
