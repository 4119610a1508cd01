use crate::clock::{Clock, SystemClock};
use crate::dispatcher::Dispatcher;
use crate::error::{BuildError, ScheduleError, SchedulerError, ShutdownError, StoreError};
use crate::job::{
  JobDefinition, JobId, JobPatch, JobSpec, Occurrence, OccurrenceId, Schedule,
};
use crate::metrics::{MetricsSnapshot, SchedulerMetrics};
use crate::recovery::recover_stale_claims;
use crate::registry::JobRegistry;
use crate::store::JobStore;
use crate::worker::Worker;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_BATCH_SIZE: usize = 16;
const DEFAULT_STALE_CLAIM_AFTER: Duration = Duration::from_secs(300);
const DEFAULT_DISPATCH_BOUND: usize = 16;

/// How the scheduler should wind down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Stop claiming new occurrences; in-flight executions run to completion.
  Graceful,
  /// Abort in-flight executions at their next await point. Their claims are
  /// released so another instance (or a restart) can re-run them.
  Force,
}

/// Builder for configuring and creating a [`Scheduler`] instance.
///
/// A store and a worker count are required; everything else has defaults.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use tickvault::{JobRegistry, Scheduler};
/// use tickvault::store::InMemoryStore;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mut registry = JobRegistry::new();
/// registry.register("send_report", |_ctx| async move { Ok(()) });
///
/// let scheduler = Scheduler::builder()
///   .store(Arc::new(InMemoryStore::new()))
///   .registry(registry)
///   .max_workers(4)
///   .build()?;
/// scheduler.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct SchedulerBuilder {
  store: Option<Arc<dyn JobStore>>,
  registry: JobRegistry,
  max_workers: Option<usize>,
  clock: Arc<dyn Clock>,
  instance_id: Option<String>,
  poll_interval: Duration,
  batch_size: usize,
  stale_claim_after: Duration,
  dispatch_buffer_size: usize,
  retention: Option<Duration>,
}

impl Default for SchedulerBuilder {
  fn default() -> Self {
    Self {
      store: None,
      registry: JobRegistry::new(),
      max_workers: None,
      clock: Arc::new(SystemClock),
      instance_id: None,
      poll_interval: DEFAULT_POLL_INTERVAL,
      batch_size: DEFAULT_BATCH_SIZE,
      stale_claim_after: DEFAULT_STALE_CLAIM_AFTER,
      dispatch_buffer_size: DEFAULT_DISPATCH_BOUND,
      retention: None,
    }
  }
}

impl SchedulerBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets the durable store shared by all scheduler instances (required).
  pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
    self.store = Some(store);
    self
  }

  /// Sets the registry of job functions this instance can execute.
  pub fn registry(mut self, registry: JobRegistry) -> Self {
    self.registry = registry;
    self
  }

  /// Sets the maximum number of occurrences executing concurrently
  /// (required, must be greater than zero).
  pub fn max_workers(mut self, count: usize) -> Self {
    self.max_workers = Some(count);
    self
  }

  /// Overrides the time source. Defaults to the system clock; tests inject
  /// a [`ManualClock`](crate::clock::ManualClock).
  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Sets the identifier recorded as claim owner. Defaults to a random id
  /// per built scheduler; set it explicitly when claim ownership should be
  /// traceable to a host or process.
  pub fn instance_id(mut self, id: impl Into<String>) -> Self {
    self.instance_id = Some(id.into());
    self
  }

  /// How often the dispatcher polls the store for due occurrences.
  /// Defaults to 500ms; this bounds dispatch latency past a due time.
  pub fn poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = interval;
    self
  }

  /// Maximum occurrences claimed per poll. Defaults to 16.
  pub fn batch_size(mut self, size: usize) -> Self {
    self.batch_size = size.max(1);
    self
  }

  /// Claim age after which a claim is presumed abandoned and eligible for
  /// recovery. Defaults to 5 minutes; must comfortably exceed the longest
  /// expected execution (including timeout), or live executions will be
  /// double-run.
  pub fn stale_claim_after(mut self, age: Duration) -> Self {
    self.stale_claim_after = age;
    self
  }

  /// Size of the dispatcher-to-worker channel. Small values (default 16)
  /// keep claimed-but-waiting occurrences few.
  pub fn dispatch_buffer_size(mut self, size: usize) -> Self {
    self.dispatch_buffer_size = size.max(1);
    self
  }

  /// Enables retention: terminal occurrences older than `max_age` are
  /// periodically purged, along with finished one-off definitions. Off by
  /// default (history kept forever).
  pub fn retention(mut self, max_age: Duration) -> Self {
    self.retention = Some(max_age);
    self
  }

  /// Builds the scheduler. Nothing runs until [`Scheduler::start`] is
  /// called; the job management API works immediately.
  ///
  /// # Errors
  ///
  /// - [`BuildError::MissingStore`] if no store was provided.
  /// - [`BuildError::MissingOrZeroMaxWorkers`] if `max_workers` was not set
  ///   or is zero.
  pub fn build(self) -> Result<Scheduler, BuildError> {
    let store = self.store.ok_or(BuildError::MissingStore)?;
    let max_workers = self
      .max_workers
      .filter(|&n| n > 0)
      .ok_or(BuildError::MissingOrZeroMaxWorkers)?;

    let (shutdown_tx, shutdown_rx) = watch::channel::<Option<ShutdownMode>>(None);

    Ok(Scheduler {
      instance_id: self.instance_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
      store,
      registry: Arc::new(self.registry),
      clock: self.clock,
      metrics: SchedulerMetrics::new(),
      max_workers,
      poll_interval: self.poll_interval,
      batch_size: self.batch_size,
      stale_claim_after: self.stale_claim_after,
      dispatch_buffer_size: self.dispatch_buffer_size,
      retention: self.retention,
      shutdown_tx,
      shutdown_rx,
      task_handles: Mutex::new(Vec::new()),
    })
  }
}

/// A durable background job scheduler instance.
///
/// Holds no authoritative state: jobs and occurrences live in the shared
/// [`JobStore`], and any number of instances pointed at the same store
/// cooperate through its atomic claims. The management API (create, update,
/// cancel, trigger, inspect) talks to the store directly and works whether
/// or not this instance's dispatch loop has been started.
pub struct Scheduler {
  instance_id: String,
  store: Arc<dyn JobStore>,
  registry: Arc<JobRegistry>,
  clock: Arc<dyn Clock>,
  metrics: SchedulerMetrics,
  max_workers: usize,
  poll_interval: Duration,
  batch_size: usize,
  stale_claim_after: Duration,
  dispatch_buffer_size: usize,
  retention: Option<Duration>,
  shutdown_tx: watch::Sender<Option<ShutdownMode>>,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
  /// Returns a builder to configure and create a `Scheduler` instance.
  pub fn builder() -> SchedulerBuilder {
    SchedulerBuilder::new()
  }

  /// The id this instance stamps on its claims.
  pub fn instance_id(&self) -> &str {
    &self.instance_id
  }

  // --- Lifecycle ---

  /// Starts executing: runs the stale-claim recovery pass, then spawns the
  /// dispatcher and the worker pool. Calling `start` twice is a logged
  /// no-op.
  ///
  /// # Errors
  ///
  /// Propagates a store failure from the recovery pass; nothing is spawned
  /// in that case and `start` can be retried.
  pub async fn start(&self) -> Result<(), StoreError> {
    let mut handles = self.task_handles.lock().await;
    if !handles.is_empty() {
      warn!("Scheduler already started, ignoring start request.");
      return Ok(());
    }

    let now = self.clock.now();
    recover_stale_claims(&self.store, now, self.stale_claim_after, &self.metrics).await?;

    let (dispatch_tx, dispatch_rx) =
      async_channel::bounded::<Occurrence>(self.dispatch_buffer_size);

    let mut dispatcher = Dispatcher::new(
      self.instance_id.clone(),
      self.store.clone(),
      self.clock.clone(),
      self.metrics.clone(),
      self.shutdown_rx.clone(),
      dispatch_tx,
      self.poll_interval,
      self.batch_size,
      self.retention,
    );
    handles.push(tokio::spawn(async move {
      dispatcher.run().await;
    }));

    for worker_id in 0..self.max_workers {
      let mut worker = Worker::new(
        worker_id,
        self.instance_id.clone(),
        self.store.clone(),
        self.registry.clone(),
        self.clock.clone(),
        self.metrics.clone(),
        self.shutdown_rx.clone(),
        dispatch_rx.clone(),
      );
      handles.push(tokio::spawn(async move {
        worker.run().await;
      }));
    }

    info!(
      instance_id = self.instance_id.as_str(),
      max_workers = self.max_workers,
      "Scheduler started."
    );
    Ok(())
  }

  /// Initiates a graceful shutdown: the dispatcher stops claiming, workers
  /// finish their in-flight executions, and all tasks are joined (bounded
  /// by `timeout` if given).
  ///
  /// # Errors
  ///
  /// - [`ShutdownError::NotStarted`] if `start` was never called.
  /// - [`ShutdownError::Timeout`] if tasks outlived the timeout.
  /// - [`ShutdownError::TaskPanic`] if a task panicked while winding down.
  pub async fn shutdown_graceful(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    info!("Initiating graceful shutdown...");
    self
      .shutdown_tx
      .send(Some(ShutdownMode::Graceful))
      .map_err(|_| ShutdownError::SignalFailed)?;
    self.await_shutdown(timeout).await
  }

  /// Initiates a forced shutdown: in-flight executions are aborted at their
  /// next await point and their claims released for re-execution elsewhere.
  pub async fn shutdown_force(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    info!("Initiating forced shutdown...");
    self
      .shutdown_tx
      .send(Some(ShutdownMode::Force))
      .map_err(|_| ShutdownError::SignalFailed)?;
    self.await_shutdown(timeout).await
  }

  async fn await_shutdown(&self, timeout_duration: Option<Duration>) -> Result<(), ShutdownError> {
    let handles = {
      let mut guard = self.task_handles.lock().await;
      std::mem::take(&mut *guard)
    };
    if handles.is_empty() {
      return Err(ShutdownError::NotStarted);
    }

    let tasks: Vec<_> = handles
      .into_iter()
      .map(|handle| async move {
        match handle.await {
          Ok(()) => Ok(()),
          Err(e) => {
            error!("Scheduler task panicked during shutdown: {:?}", e);
            Err(ShutdownError::TaskPanic)
          }
        }
      })
      .collect();
    let join_all_fut = try_join_all(tasks);

    let result = if let Some(timeout) = timeout_duration {
      match tokio::time::timeout(timeout, join_all_fut).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(_) => {
          error!("Shutdown timed out after {:?}", timeout);
          Err(ShutdownError::Timeout)
        }
      }
    } else {
      join_all_fut.await.map(|_| ())
    };

    if result.is_ok() {
      info!("All scheduler tasks joined.");
    }
    result
  }

  // --- Job management API ---

  /// Creates a job and plans its first occurrence. Returns the new job's id.
  ///
  /// A one-off whose run time is not in the future is rejected with
  /// [`ScheduleError::PastOneOff`]; cron expressions were already validated
  /// when the [`Schedule`] was constructed.
  pub async fn create_job(&self, spec: JobSpec) -> Result<JobId, SchedulerError> {
    let now = self.clock.now();
    validate_schedule(&spec.schedule, now)?;

    let def = JobDefinition::from_spec(spec, Uuid::new_v4(), now);
    let first_due = def.schedule.next_occurrence(now);
    let job_id = self.store.create_job(def).await?;

    if let Some(due) = first_due {
      match self.store.enqueue_occurrence(job_id, due, now).await {
        // The dispatcher's planner may have gotten there first.
        Ok(_) | Err(StoreError::DuplicateOccurrence { .. }) => {}
        Err(e) => return Err(e.into()),
      }
      info!(job_id = %job_id, due = %due, "Created job with first occurrence planned.");
    } else {
      warn!(job_id = %job_id, "Created job whose schedule never fires.");
    }
    Ok(job_id)
  }

  /// Applies a partial update. A schedule change discards the job's Pending
  /// occurrences and plans afresh from the new schedule; an in-flight
  /// execution finishes under the old one.
  pub async fn update_job(&self, id: JobId, patch: JobPatch) -> Result<(), SchedulerError> {
    let now = self.clock.now();
    if let Some(schedule) = &patch.schedule {
      validate_schedule(schedule, now)?;
    }
    let schedule_changed = patch.schedule.is_some();
    self.store.update_job(id, patch, now).await?;

    if schedule_changed {
      let job = self.store.get_job(id).await?;
      if let Some(due) = job.schedule.next_occurrence(now) {
        match self.store.enqueue_occurrence(id, due, now).await {
          Ok(_) | Err(StoreError::DuplicateOccurrence { .. }) => {}
          Err(e) => return Err(e.into()),
        }
      }
    }
    Ok(())
  }

  /// Cancels a job: deletes its definition and cancels every non-terminal
  /// occurrence. An execution already in flight finishes, but its outcome
  /// is discarded. Terminal history is kept until retention purges it.
  pub async fn cancel_job(&self, id: JobId) -> Result<(), StoreError> {
    let now = self.clock.now();
    self.store.delete_job(id, now).await?;
    info!(job_id = %id, "Job canceled.");
    Ok(())
  }

  /// Plans an extra occurrence of the job due immediately, without touching
  /// its regular schedule. Fails with [`StoreError::DuplicateOccurrence`]
  /// if one already exists at this exact instant.
  pub async fn trigger_now(&self, id: JobId) -> Result<OccurrenceId, StoreError> {
    let now = self.clock.now();
    let occurrence_id = self.store.enqueue_occurrence(id, now, now).await?;
    info!(job_id = %id, occurrence_id = %occurrence_id, "Job triggered manually.");
    Ok(occurrence_id)
  }

  // --- Inspection ---

  pub async fn get_job(&self, id: JobId) -> Result<JobDefinition, StoreError> {
    self.store.get_job(id).await
  }

  pub async fn list_jobs(&self) -> Result<Vec<JobDefinition>, StoreError> {
    self.store.list_jobs().await
  }

  pub async fn get_occurrence(&self, id: OccurrenceId) -> Result<Occurrence, StoreError> {
    self.store.get_occurrence(id).await
  }

  /// All occurrences of a job, ordered by due time. Terminal rows double as
  /// execution history.
  pub async fn list_occurrences(&self, job_id: JobId) -> Result<Vec<Occurrence>, StoreError> {
    self.store.list_occurrences(job_id).await
  }

  /// A point-in-time snapshot of this instance's metrics.
  pub fn metrics_snapshot(&self) -> MetricsSnapshot {
    self.metrics.snapshot()
  }
}

fn validate_schedule(schedule: &Schedule, now: DateTime<Utc>) -> Result<(), ScheduleError> {
  if let Schedule::Once(at) = schedule {
    if *at <= now {
      return Err(ScheduleError::PastOneOff(*at));
    }
  }
  Ok(())
}
