use crate::job::{JobId, OccurrenceId};

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur during the scheduler building phase using `SchedulerBuilder`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("Maximum worker count (`max_workers`) must be specified and greater than zero")]
  MissingOrZeroMaxWorkers,
  #[error("A `JobStore` implementation must be provided via `store(..)`")]
  MissingStore,
}

/// Errors surfaced when validating a job's schedule at creation/update time.
///
/// These are never swallowed: a malformed cron expression or a one-off time
/// already in the past is rejected before anything is persisted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
  #[error("invalid cron expression '{expr}': {reason}")]
  InvalidCron { expr: String, reason: String },
  #[error("one-off run time {0} is in the past")]
  PastOneOff(DateTime<Utc>),
}

/// Errors reported by a `JobStore` implementation.
#[derive(Error, Debug)]
pub enum StoreError {
  #[error("job {0} not found")]
  JobNotFound(JobId),
  #[error("occurrence {0} not found")]
  OccurrenceNotFound(OccurrenceId),
  /// An occurrence already exists for this `(job, due_time)` pair.
  /// The dispatcher treats this as an idempotent no-op; direct API callers
  /// see it as an error.
  #[error("occurrence for job {job_id} at {due_time} already exists")]
  DuplicateOccurrence {
    job_id: JobId,
    due_time: DateTime<Utc>,
  },
  /// The occurrence is not in the state (or not claimed by the owner) the
  /// operation requires. Expected under concurrency; recovered on the next tick.
  #[error("claim conflict on occurrence {0}")]
  ClaimConflict(OccurrenceId),
  /// The occurrence already reached a terminal state and is immutable.
  #[error("occurrence {0} is terminal and cannot be modified")]
  TerminalOccurrence(OccurrenceId),
  /// The persistence layer is unreachable or failed an operation. The
  /// dispatcher backs off and retries; it never crashes the process.
  #[error("store unavailable: {0}")]
  Unavailable(String),
}

/// Logical failure of a user job function.
///
/// Returned from a registered handler to signal that the run failed and the
/// occurrence should be retried (or terminally failed once retries are
/// exhausted). The message is recorded as the occurrence's `last_error`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct JobRunError {
  pub message: String,
}

impl JobRunError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }
}

impl From<&str> for JobRunError {
  fn from(message: &str) -> Self {
    Self::new(message)
  }
}

impl From<String> for JobRunError {
  fn from(message: String) -> Self {
    Self { message }
  }
}

/// Errors returned by the scheduler's job management API.
///
/// Wraps schedule validation failures and store failures under one type so
/// callers of `create_job` and friends handle a single error.
#[derive(Error, Debug)]
pub enum SchedulerError {
  #[error(transparent)]
  Schedule(#[from] ScheduleError),
  #[error(transparent)]
  Store(#[from] StoreError),
}

/// Errors related to the scheduler shutdown process (`shutdown_graceful`, `shutdown_force`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Failed to send shutdown signal (scheduler already shut down or watch channel error).")]
  SignalFailed,
  #[error("Timed out waiting for scheduler tasks (dispatcher, workers) to complete shutdown.")]
  Timeout,
  #[error("A worker or dispatcher task panicked during the shutdown process.")]
  TaskPanic,
  #[error("Scheduler was never started.")]
  NotStarted,
}
