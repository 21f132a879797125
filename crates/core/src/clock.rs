//! Wall-clock sources.
//!
//! Lease deadlines are wall-clock timestamps stored in the row, but the
//! code that computes and compares them must be testable without sleeping.
//! Everything that needs "now" takes an `Arc<dyn Clock>`.

use std::sync::Arc;

use chrono::Utc;

use crate::types::Timestamp;

/// A source of the current UTC time.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Timestamp;
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// Wall clock anchored at construction and advanced by tokio's monotonic
/// clock.
///
/// Under `#[tokio::test(start_paused = true)]` this clock only moves when the
/// test calls `tokio::time::advance`, so lease expiry and the timers that
/// enforce it stay in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    base_wall: Timestamp,
    base_instant: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::anchored_at(Utc::now())
    }

    /// Anchor the clock at a fixed wall time.
    pub fn anchored_at(base_wall: Timestamp) -> Self {
        Self {
            base_wall,
            base_instant: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Timestamp {
        let elapsed = self.base_instant.elapsed();
        let elapsed = chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        self.base_wall + elapsed
    }
}
