use crate::cron::CronExpr;
use crate::error::ScheduleError;

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use uuid::Uuid;

// --- Public Type Aliases ---

/// Unique identifier of a job definition. Uses UUID v4.
pub type JobId = Uuid;

/// Unique identifier of one concrete occurrence of a job. Uses UUID v4.
pub type OccurrenceId = Uuid;

/// Type alias for the simple numeric ID assigned to worker tasks for logging.
pub(crate) type WorkerId = usize;

// --- Schedule ---

/// When a job runs: exactly once at a fixed time, or recurring per a cron
/// expression. Next-occurrence computation is a pure function of the
/// schedule and a reference time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
  /// Run once at the given UTC time.
  Once(DateTime<Utc>),
  /// Run repeatedly per a standard 5-field cron expression (UTC).
  Cron(CronExpr),
}

impl Schedule {
  /// Convenience constructor that parses and validates a cron expression.
  pub fn cron(expr: &str) -> Result<Self, ScheduleError> {
    Ok(Schedule::Cron(CronExpr::parse(expr)?))
  }

  /// The next due time strictly after `after`, or `None` if the schedule
  /// has no further occurrences (a consumed one-off, or a cron expression
  /// that never matches again).
  pub fn next_occurrence(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match self {
      Schedule::Once(run_at) => {
        if *run_at > after {
          Some(*run_at)
        } else {
          None
        }
      }
      Schedule::Cron(expr) => expr.next_after(after),
    }
  }

  pub fn is_recurring(&self) -> bool {
    matches!(self, Schedule::Cron(_))
  }
}

// --- Retry policy ---

/// Retry behavior after a failed execution.
///
/// `backoff` is an ordered list of delays indexed by the attempt that just
/// failed (attempt 1 uses `backoff[0]`, and so on, clamped to the last
/// entry). An empty list selects the exponential default: 60s base, factor
/// 3, exponent capped at 5 (~4h ceiling).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Maximum retry attempts after the initial one. `max_retries = 3` means
  /// at most 4 total attempts.
  pub max_retries: u32,
  pub backoff: Vec<StdDuration>,
}

impl RetryPolicy {
  pub fn none() -> Self {
    Self {
      max_retries: 0,
      backoff: Vec::new(),
    }
  }

  /// Exponential backoff with the default curve.
  pub fn exponential(max_retries: u32) -> Self {
    Self {
      max_retries,
      backoff: Vec::new(),
    }
  }

  /// Explicit backoff ladder. The list is clamped to its last entry when
  /// attempts outnumber entries.
  pub fn fixed(max_retries: u32, backoff: Vec<StdDuration>) -> Self {
    Self {
      max_retries,
      backoff,
    }
  }

  /// The delay to wait before re-running after `failed_attempt` (1-based)
  /// has failed.
  pub fn delay_for_attempt(&self, failed_attempt: u32) -> StdDuration {
    if let Some(last) = self.backoff.last() {
      let idx = (failed_attempt.saturating_sub(1) as usize).min(self.backoff.len() - 1);
      return self.backoff.get(idx).copied().unwrap_or(*last);
    }

    // Exponential default: 60s * 3^(attempt-1), exponent capped at 5.
    let base_delay_secs: u64 = 60;
    let factor: u64 = 3;
    let max_exponent: u32 = 5;
    let exponent = std::cmp::min(failed_attempt.saturating_sub(1), max_exponent);
    let factor_pow = factor.checked_pow(exponent).unwrap_or(u64::MAX);
    let secs = base_delay_secs.checked_mul(factor_pow).unwrap_or(u64::MAX);
    StdDuration::from_secs(secs)
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::none()
  }
}

// --- Job definition ---

/// The user-supplied description of a job, passed to `Scheduler::create_job`.
///
/// `name` doubles as the function key: execution looks the name up in the
/// [`JobRegistry`](crate::registry::JobRegistry).
#[derive(Debug, Clone)]
pub struct JobSpec {
  /// Stable name identifying the job function in the registry.
  pub name: String,
  pub schedule: Schedule,
  /// Opaque arguments handed to the job function on every execution.
  /// Ambient context (trace ids, tenant, ...) belongs in here, captured at
  /// enqueue time.
  pub payload: serde_json::Value,
  pub retry: RetryPolicy,
  /// Per-execution wall time limit. On expiry the invocation is abandoned
  /// (its task is aborted at the next await point) and the attempt is
  /// treated as a failure.
  pub timeout: Option<StdDuration>,
  /// Whether occurrences of this job may run concurrently with each other.
  /// Defaults to false: while one occurrence is claimed or running, later
  /// due occurrences stay Pending.
  pub allow_overlap: bool,
}

impl JobSpec {
  pub fn new(name: &str, schedule: Schedule) -> Self {
    Self {
      name: name.to_string(),
      schedule,
      payload: serde_json::Value::Null,
      retry: RetryPolicy::none(),
      timeout: None,
      allow_overlap: false,
    }
  }

  pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
    self.payload = payload;
    self
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn with_timeout(mut self, timeout: StdDuration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn with_allow_overlap(mut self, allow: bool) -> Self {
    self.allow_overlap = allow;
    self
  }
}

/// The canonical, persisted form of a job. Owned by the store; in-memory
/// copies are non-authoritative snapshots.
#[derive(Debug, Clone)]
pub struct JobDefinition {
  pub id: JobId,
  pub name: String,
  pub schedule: Schedule,
  pub payload: serde_json::Value,
  pub retry: RetryPolicy,
  pub timeout: Option<StdDuration>,
  pub allow_overlap: bool,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl JobDefinition {
  /// Materializes a `JobSpec` into a definition ready for `JobStore::create_job`.
  /// `Scheduler::create_job` does this internally; direct store users call
  /// it themselves.
  pub fn from_spec(spec: JobSpec, id: JobId, now: DateTime<Utc>) -> Self {
    Self {
      id,
      name: spec.name,
      schedule: spec.schedule,
      payload: spec.payload,
      retry: spec.retry,
      timeout: spec.timeout,
      allow_overlap: spec.allow_overlap,
      created_at: now,
      updated_at: now,
    }
  }
}

/// A partial update to a job definition. `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
  pub schedule: Option<Schedule>,
  pub payload: Option<serde_json::Value>,
  pub retry: Option<RetryPolicy>,
  pub timeout: Option<Option<StdDuration>>,
  pub allow_overlap: Option<bool>,
}

// --- Occurrence ---

/// Lifecycle state of an occurrence.
///
/// `Pending -> Claimed -> Running -> {Succeeded, Failed}`; a retryable
/// failure moves the row back to Pending with an incremented attempt.
/// `Succeeded`, `Failed` and `Canceled` are terminal and immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OccurrenceState {
  Pending,
  Claimed,
  Running,
  Succeeded,
  Failed,
  Canceled,
}

impl OccurrenceState {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      OccurrenceState::Succeeded | OccurrenceState::Failed | OccurrenceState::Canceled
    )
  }

  /// Holds a live claim: the occurrence belongs to exactly one owner.
  pub fn is_claimed(&self) -> bool {
    matches!(self, OccurrenceState::Claimed | OccurrenceState::Running)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      OccurrenceState::Pending => "pending",
      OccurrenceState::Claimed => "claimed",
      OccurrenceState::Running => "running",
      OccurrenceState::Succeeded => "succeeded",
      OccurrenceState::Failed => "failed",
      OccurrenceState::Canceled => "canceled",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    Some(match s {
      "pending" => OccurrenceState::Pending,
      "claimed" => OccurrenceState::Claimed,
      "running" => OccurrenceState::Running,
      "succeeded" => OccurrenceState::Succeeded,
      "failed" => OccurrenceState::Failed,
      "canceled" => OccurrenceState::Canceled,
      _ => return None,
    })
  }
}

/// One concrete scheduled execution of a job at a specific due time.
///
/// Invariant: at most one occurrence row exists per `(job_id, due_time)`,
/// and at most one occurrence holds a claim on it at any moment.
#[derive(Debug, Clone)]
pub struct Occurrence {
  pub id: OccurrenceId,
  pub job_id: JobId,
  pub due_time: DateTime<Utc>,
  pub state: OccurrenceState,
  /// Which scheduler instance claimed this occurrence, while Claimed/Running.
  pub claim_owner: Option<String>,
  pub claim_time: Option<DateTime<Utc>>,
  /// 1-based execution attempt this row represents (or will represent, while
  /// Pending).
  pub attempt: u32,
  pub last_error: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// The result of one execution attempt, applied to the occurrence through
/// the store.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
  /// Terminal success.
  Succeeded,
  /// Terminal failure (retries exhausted, or none configured).
  Failed { error: String },
  /// Retryable failure: back to Pending at `next_due` with `attempt + 1`.
  Retry {
    error: String,
    next_due: DateTime<Utc>,
  },
}

pub(crate) fn add_std_duration(t: DateTime<Utc>, d: StdDuration) -> DateTime<Utc> {
  match ChronoDuration::from_std(d) {
    Ok(delta) => t.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC),
    Err(_) => DateTime::<Utc>::MAX_UTC,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn once_schedule_fires_only_before_its_time() {
    let run_at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
    let schedule = Schedule::Once(run_at);
    assert_eq!(
      schedule.next_occurrence(run_at - ChronoDuration::hours(1)),
      Some(run_at)
    );
    assert_eq!(schedule.next_occurrence(run_at), None);
    assert_eq!(schedule.next_occurrence(run_at + ChronoDuration::seconds(1)), None);
  }

  #[test]
  fn fixed_backoff_clamps_to_last_entry() {
    let policy = RetryPolicy::fixed(
      5,
      vec![
        StdDuration::from_secs(1),
        StdDuration::from_secs(5),
        StdDuration::from_secs(30),
      ],
    );
    assert_eq!(policy.delay_for_attempt(1), StdDuration::from_secs(1));
    assert_eq!(policy.delay_for_attempt(2), StdDuration::from_secs(5));
    assert_eq!(policy.delay_for_attempt(3), StdDuration::from_secs(30));
    assert_eq!(policy.delay_for_attempt(9), StdDuration::from_secs(30));
  }

  #[test]
  fn exponential_backoff_caps_exponent() {
    let policy = RetryPolicy::exponential(10);
    assert_eq!(policy.delay_for_attempt(1), StdDuration::from_secs(60));
    assert_eq!(policy.delay_for_attempt(2), StdDuration::from_secs(180));
    assert_eq!(policy.delay_for_attempt(3), StdDuration::from_secs(540));
    // Capped at 3^5.
    assert_eq!(policy.delay_for_attempt(6), StdDuration::from_secs(60 * 243));
    assert_eq!(policy.delay_for_attempt(40), StdDuration::from_secs(60 * 243));
  }

  #[test]
  fn terminal_states_are_terminal() {
    assert!(!OccurrenceState::Pending.is_terminal());
    assert!(!OccurrenceState::Claimed.is_terminal());
    assert!(!OccurrenceState::Running.is_terminal());
    assert!(OccurrenceState::Succeeded.is_terminal());
    assert!(OccurrenceState::Failed.is_terminal());
    assert!(OccurrenceState::Canceled.is_terminal());
  }
}
