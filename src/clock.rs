//! Wall-clock source for expiry decisions.
//!
//! Stores take a single `now_ms()` snapshot per operation so an expiry check
//! and the eviction it triggers always agree.

use chrono::Utc;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Source of epoch milliseconds.
pub trait Clock: Send + Sync + fmt::Debug {
  fn now_ms(&self) -> i64;
}

pub type SharedClock = Arc<dyn Clock>;

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now_ms(&self) -> i64 {
    Utc::now().timestamp_millis()
  }
}

/// Shared system clock.
pub fn system() -> SharedClock {
  Arc::new(SystemClock)
}

/// Clock that only moves when told to. Used to drive expiry deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
  now: AtomicI64,
}

impl ManualClock {
  pub fn new(start_ms: i64) -> Self {
    Self {
      now: AtomicI64::new(start_ms),
    }
  }

  pub fn advance(&self, by: Duration) {
    self.now.fetch_add(duration_ms(by), Ordering::SeqCst);
  }

  pub fn set(&self, now_ms: i64) {
    self.now.store(now_ms, Ordering::SeqCst);
  }
}

impl Clock for ManualClock {
  fn now_ms(&self) -> i64 {
    self.now.load(Ordering::SeqCst)
  }
}

/// Convert a duration to whole milliseconds, saturating at `i64::MAX`.
pub fn duration_ms(d: Duration) -> i64 {
  i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_manual_clock_advance() {
    let clock = ManualClock::new(1_000);
    clock.advance(Duration::from_millis(250));
    assert_eq!(clock.now_ms(), 1_250);

    clock.set(5);
    assert_eq!(clock.now_ms(), 5);
  }

  #[test]
  fn test_system_clock_is_recent() {
    // 2020-01-01T00:00:00Z
    assert!(SystemClock.now_ms() > 1_577_836_800_000);
  }

  #[test]
  fn test_duration_ms_saturates() {
    assert_eq!(duration_ms(Duration::from_secs(2)), 2_000);
    assert_eq!(duration_ms(Duration::MAX), i64::MAX);
  }
}
