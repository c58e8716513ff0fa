//! Time source for freshness checks.

use chrono::Utc;
use std::sync::Arc;
#[cfg(test)]
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of the current time in epoch milliseconds.
pub trait Clock: Send + Sync {
  fn now_millis(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now_millis(&self) -> i64 {
    Utc::now().timestamp_millis()
  }
}

/// Clock that only moves when told to.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct ManualClock {
  millis: AtomicI64,
}

#[cfg(test)]
impl ManualClock {
  pub fn at(millis: i64) -> Self {
    Self {
      millis: AtomicI64::new(millis),
    }
  }

  pub fn set(&self, millis: i64) {
    self.millis.store(millis, Ordering::SeqCst);
  }

  pub fn advance(&self, millis: i64) {
    self.millis.fetch_add(millis, Ordering::SeqCst);
  }
}

#[cfg(test)]
impl Clock for ManualClock {
  fn now_millis(&self) -> i64 {
    self.millis.load(Ordering::SeqCst)
  }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
  fn now_millis(&self) -> i64 {
    (**self).now_millis()
  }
}
