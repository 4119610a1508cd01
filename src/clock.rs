use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;

/// Wall-clock abstraction used for all due-time computations.
///
/// The scheduler never calls `Utc::now()` directly; it reads the injected
/// clock so tests can control time deterministically.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// The real system clock. This is the default for production schedulers.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A manually controlled clock for tests.
///
/// Starts at a fixed instant and only moves when told to via [`ManualClock::set`]
/// or [`ManualClock::advance`].
#[derive(Clone)]
pub struct ManualClock {
  current: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      current: Arc::new(Mutex::new(start)),
    }
  }

  pub fn set(&self, to: DateTime<Utc>) {
    *self.current.lock() = to;
  }

  pub fn advance(&self, by: Duration) {
    let mut guard = self.current.lock();
    let delta = ChronoDuration::from_std(by).unwrap_or_else(|_| ChronoDuration::seconds(0));
    *guard += delta;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.current.lock()
  }
}

impl fmt::Debug for ManualClock {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ManualClock")
      .field("current", &*self.current.lock())
      .finish()
  }
}
