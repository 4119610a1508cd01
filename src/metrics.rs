use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A basic concurrent histogram storing count and sum.
///
/// Suitable for simple latency tracking without detailed percentile
/// information. Uses `Relaxed` ordering; strict inter-metric consistency is
/// not needed here.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl SimpleHistogram {
  /// Records a duration observation in the histogram.
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  /// Total number of observations recorded.
  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  /// Total sum of durations recorded, in microseconds.
  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

/// Internal state for tracking scheduler metrics using atomic counters.
///
/// Cloned and shared between the dispatcher, the workers, and the recovery
/// pass. Cloning only clones the `Arc`s, so all clones observe the same
/// underlying values.
#[derive(Debug, Clone)]
pub struct SchedulerMetrics {
  // --- Counters (monotonically increasing) ---
  /// Occurrences this instance claimed from the store.
  pub occurrences_claimed: Arc<AtomicUsize>,
  /// Executions that completed successfully.
  pub executed_success: Arc<AtomicUsize>,
  /// Executions that returned an error.
  pub executed_fail: Arc<AtomicUsize>,
  /// Executions cut off by their per-job timeout.
  pub executed_timeout: Arc<AtomicUsize>,
  /// Executions that panicked.
  pub jobs_panicked: Arc<AtomicUsize>,
  /// Retry occurrences scheduled after a failed attempt.
  pub retries_scheduled: Arc<AtomicUsize>,
  /// Occurrences marked Failed after exhausting all retry attempts.
  pub permanently_failed: Arc<AtomicUsize>,
  /// Planning enqueues skipped because the slot already existed.
  pub duplicates_skipped: Arc<AtomicUsize>,
  /// Stale claims released back to Pending by the recovery pass.
  pub occurrences_recovered: Arc<AtomicUsize>,
  /// Store operations that failed with an error.
  pub store_errors: Arc<AtomicUsize>,

  // --- Gauges (current state values) ---
  /// Workers currently executing an occurrence.
  pub workers_active_current: Arc<AtomicUsize>,

  // --- Histograms ---
  /// Execution duration of occurrences (in microseconds).
  pub execution_duration: Arc<SimpleHistogram>,
}

impl Default for SchedulerMetrics {
  fn default() -> Self {
    Self::new()
  }
}

impl SchedulerMetrics {
  /// Creates a new `SchedulerMetrics` instance with all counters at zero.
  pub fn new() -> Self {
    Self {
      occurrences_claimed: Default::default(),
      executed_success: Default::default(),
      executed_fail: Default::default(),
      executed_timeout: Default::default(),
      jobs_panicked: Default::default(),
      retries_scheduled: Default::default(),
      permanently_failed: Default::default(),
      duplicates_skipped: Default::default(),
      occurrences_recovered: Default::default(),
      store_errors: Default::default(),
      workers_active_current: Default::default(),
      execution_duration: Arc::new(SimpleHistogram::default()),
    }
  }

  /// Creates a point-in-time snapshot of the current metric values.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;
    MetricsSnapshot {
      occurrences_claimed: self.occurrences_claimed.load(order),
      executed_success: self.executed_success.load(order),
      executed_fail: self.executed_fail.load(order),
      executed_timeout: self.executed_timeout.load(order),
      jobs_panicked: self.jobs_panicked.load(order),
      retries_scheduled: self.retries_scheduled.load(order),
      permanently_failed: self.permanently_failed.load(order),
      duplicates_skipped: self.duplicates_skipped.load(order),
      occurrences_recovered: self.occurrences_recovered.load(order),
      store_errors: self.store_errors.load(order),
      workers_active_current: self.workers_active_current.load(order),
      execution_duration_count: self.execution_duration.get_count(),
      execution_duration_sum_micros: self.execution_duration.get_sum_micros(),
    }
  }
}

/// A snapshot of the scheduler's metrics at a specific point in time.
///
/// Plain data, cheap to clone and serialize for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
  // Counters
  pub occurrences_claimed: usize,
  pub executed_success: usize,
  pub executed_fail: usize,
  pub executed_timeout: usize,
  pub jobs_panicked: usize,
  pub retries_scheduled: usize,
  pub permanently_failed: usize,
  pub duplicates_skipped: usize,
  pub occurrences_recovered: usize,
  pub store_errors: usize,
  // Gauges
  pub workers_active_current: usize,
  // Histogram data
  pub execution_duration_count: usize,
  pub execution_duration_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Mean execution duration in microseconds, or `None` before the first
  /// completed execution.
  pub fn mean_execution_duration_micros(&self) -> Option<f64> {
    if self.execution_duration_count == 0 {
      None
    } else {
      Some(self.execution_duration_sum_micros as f64 / self.execution_duration_count as f64)
    }
  }

  /// Mean execution duration, or `None` before the first completed execution.
  pub fn mean_execution_duration(&self) -> Option<Duration> {
    self
      .mean_execution_duration_micros()
      .map(|micros| Duration::from_micros(micros as u64))
  }
}
