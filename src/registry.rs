//! Explicit job function registry.
//!
//! Jobs are looked up by their stable name at execution time. Registration
//! happens once at startup via [`JobRegistry::register`]; there is no
//! reflection or attribute scanning. A name scheduled without a matching
//! registration fails at execution time and follows the job's retry policy.

use crate::error::JobRunError;
use crate::job::{JobId, OccurrenceId};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// The function type that job occurrences execute.
///
/// The function receives the [`JobContext`] for the occurrence and must be
/// `Send + Sync + 'static`. Panics are caught by the worker and treated as
/// failures.
pub type BoxedJobFn = Box<
  dyn Fn(JobContext) -> Pin<Box<dyn Future<Output = Result<(), JobRunError>> + Send + 'static>>
    + Send
    + Sync
    + 'static,
>;

/// Everything an execution attempt knows about itself.
///
/// The payload carries the caller's arguments exactly as stored at enqueue
/// time; any ambient context a job needs (trace ids, tenant, ...) travels in
/// the payload rather than through task-locals.
#[derive(Clone)]
pub struct JobContext {
  pub job_id: JobId,
  pub occurrence_id: OccurrenceId,
  pub job_name: String,
  pub payload: serde_json::Value,
  /// 1-based attempt number of this execution.
  pub attempt: u32,
  pub due_time: DateTime<Utc>,
  /// Flips to `true` when the scheduler wants this invocation to stop
  /// (timeout elapsed or forced shutdown). Long-running handlers should
  /// check it at convenient points; the task is also aborted at its next
  /// await point.
  pub cancelled: watch::Receiver<bool>,
}

impl JobContext {
  /// True once cancellation has been requested for this invocation.
  pub fn is_cancelled(&self) -> bool {
    *self.cancelled.borrow()
  }
}

impl fmt::Debug for JobContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobContext")
      .field("job_id", &self.job_id)
      .field("occurrence_id", &self.occurrence_id)
      .field("job_name", &self.job_name)
      .field("attempt", &self.attempt)
      .field("due_time", &self.due_time)
      .finish()
  }
}

/// Maps job names to their execution functions.
///
/// Populated at startup, then shared immutably with the worker pool.
#[derive(Default)]
pub struct JobRegistry {
  handlers: HashMap<String, Arc<BoxedJobFn>>,
}

impl JobRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers `handler` under `name`, replacing any previous registration.
  pub fn register<F, Fut>(&mut self, name: &str, handler: F) -> &mut Self
  where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobRunError>> + Send + 'static,
  {
    let boxed: BoxedJobFn = Box::new(move |ctx| Box::pin(handler(ctx)));
    self.handlers.insert(name.to_string(), Arc::new(boxed));
    self
  }

  pub fn get(&self, name: &str) -> Option<Arc<BoxedJobFn>> {
    self.handlers.get(name).cloned()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.handlers.contains_key(name)
  }

  pub fn len(&self) -> usize {
    self.handlers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.handlers.is_empty()
  }
}

impl fmt::Debug for JobRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
    names.sort_unstable();
    f.debug_struct("JobRegistry").field("names", &names).finish()
  }
}
