use crate::clock::Clock;
use crate::error::{JobRunError, StoreError};
use crate::job::{
  add_std_duration, ExecutionOutcome, JobDefinition, Occurrence, WorkerId,
};
use crate::metrics::SchedulerMetrics;
use crate::registry::{JobContext, JobRegistry};
use crate::scheduler::ShutdownMode;
use crate::store::JobStore;

use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Instant;

use async_channel::Receiver as DispatchReceiver;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// How one execution attempt ended, before the outcome is applied to the
/// store.
enum ExecResult {
  Success,
  Fail(String),
  Panic,
  TimedOut,
  /// Cut short by a forced shutdown. The claim is released instead of the
  /// attempt being charged.
  Aborted,
}

/// A worker task executing claimed occurrences.
///
/// Workers wait for claimed occurrences from the dispatcher via a shared
/// channel, run the registered job function in a spawned task (isolating
/// panics), enforce the per-job timeout, and write the outcome back to the
/// store.
pub(crate) struct Worker {
  id: WorkerId,
  instance_id: String,
  store: Arc<dyn JobStore>,
  registry: Arc<JobRegistry>,
  clock: Arc<dyn Clock>,
  metrics: SchedulerMetrics,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  dispatch_rx: DispatchReceiver<Occurrence>,
}

impl Worker {
  pub fn new(
    id: WorkerId,
    instance_id: String,
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
    metrics: SchedulerMetrics,
    shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
    dispatch_rx: DispatchReceiver<Occurrence>,
  ) -> Self {
    Self {
      id,
      instance_id,
      store,
      registry,
      clock,
      metrics,
      shutdown_rx,
      dispatch_rx,
    }
  }

  /// Runs the main loop for the worker task. Waits for dispatched
  /// occurrences or a shutdown signal.
  pub async fn run(&mut self) {
    info!(worker_id = self.id, "Worker started. Waiting for occurrences...");

    loop {
      if self.is_shutting_down() {
        break;
      }

      tokio::select! {
        biased;

        Ok(()) = self.shutdown_rx.changed() => {
          if self.is_shutting_down() {
            info!(worker_id = self.id, "Worker received shutdown signal.");
            break;
          }
        }

        result = self.dispatch_rx.recv() => {
          match result {
            Ok(occurrence) => {
              let span = tracing::span!(
                tracing::Level::INFO,
                "occurrence_exec",
                worker_id = self.id,
                occurrence_id = %occurrence.id,
                job_id = %occurrence.job_id,
                attempt = occurrence.attempt,
              );
              self.execute_occurrence(occurrence).instrument(span).await;
            }
            Err(_) => {
              if !self.is_shutting_down() {
                error!(worker_id = self.id, "Dispatch channel closed unexpectedly. Worker exiting.");
              } else {
                info!(worker_id = self.id, "Dispatch channel closed during shutdown. Worker exiting.");
              }
              break;
            }
          }
        }
      }
    }

    // Claims buffered in the channel but never executed would otherwise sit
    // until another instance's recovery pass. Release them now.
    while let Ok(occurrence) = self.dispatch_rx.try_recv() {
      let now = self.clock.now();
      if let Err(e) = self.store.release_claim(occurrence.id, now).await {
        warn!(
          worker_id = self.id,
          occurrence_id = %occurrence.id,
          error = %e,
          "Failed to release undispatched claim during shutdown."
        );
      }
    }

    info!(worker_id = self.id, "Worker task shutting down.");
  }

  fn is_shutting_down(&self) -> bool {
    self.shutdown_rx.borrow().is_some()
  }

  async fn execute_occurrence(&self, occurrence: Occurrence) {
    self
      .metrics
      .workers_active_current
      .fetch_add(1, AtomicOrdering::Relaxed);

    self.execute_occurrence_inner(&occurrence).await;

    self
      .metrics
      .workers_active_current
      .fetch_sub(1, AtomicOrdering::Relaxed);
  }

  async fn execute_occurrence_inner(&self, occurrence: &Occurrence) {
    let job = match self.store.get_job(occurrence.job_id).await {
      Ok(job) => job,
      Err(StoreError::JobNotFound(_)) => {
        // Deleted between claim and execution; deletion already canceled the
        // occurrence.
        debug!("Job definition gone, discarding claimed occurrence.");
        return;
      }
      Err(e) => {
        error!(error = %e, "Failed to load job definition; releasing claim.");
        self.metrics.store_errors.fetch_add(1, AtomicOrdering::Relaxed);
        self.release_quietly(occurrence).await;
        return;
      }
    };

    let now = self.clock.now();
    match self
      .store
      .mark_running(occurrence.id, &self.instance_id, now)
      .await
    {
      Ok(()) => {}
      Err(StoreError::ClaimConflict(_)) => {
        // The claim was recovered by another instance in the meantime.
        warn!("Claim no longer held by this instance, skipping execution.");
        return;
      }
      Err(e) => {
        error!(error = %e, "Failed to mark occurrence running; releasing claim.");
        self.metrics.store_errors.fetch_add(1, AtomicOrdering::Relaxed);
        self.release_quietly(occurrence).await;
        return;
      }
    }

    info!(job_name = job.name.as_str(), "Starting occurrence execution.");
    let start = Instant::now();
    let result = match self.registry.get(&job.name) {
      Some(handler) => {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = JobContext {
          job_id: job.id,
          occurrence_id: occurrence.id,
          job_name: job.name.clone(),
          payload: job.payload.clone(),
          attempt: occurrence.attempt,
          due_time: occurrence.due_time,
          cancelled: cancel_rx,
        };
        self.run_handler(handler(ctx), &job, &cancel_tx).await
      }
      None => {
        warn!(job_name = job.name.as_str(), "No function registered for job name.");
        ExecResult::Fail(format!("no function registered under name '{}'", job.name))
      }
    };
    let duration = start.elapsed();
    self.metrics.execution_duration.record(duration);

    let outcome_str = match &result {
      ExecResult::Success => "Success",
      ExecResult::Fail(_) => "Fail",
      ExecResult::Panic => "Panic",
      ExecResult::TimedOut => "Timeout",
      ExecResult::Aborted => "Aborted",
    };
    info!(
      duration_ms = duration.as_millis(),
      outcome = outcome_str,
      "Finished occurrence execution."
    );

    self.apply_result(occurrence, &job, result).await;
  }

  /// Runs the handler future in its own task so a panic cannot take the
  /// worker down, enforcing the job's timeout and reacting to a forced
  /// shutdown.
  async fn run_handler(
    &self,
    future: impl std::future::Future<Output = Result<(), JobRunError>> + Send + 'static,
    job: &JobDefinition,
    cancel_tx: &watch::Sender<bool>,
  ) -> ExecResult {
    let mut task: JoinHandle<Result<(), JobRunError>> = tokio::spawn(future);
    let abort = task.abort_handle();
    let mut shutdown_rx = self.shutdown_rx.clone();

    let attempt = async {
      match job.timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
          Ok(join) => classify_join(join, &self.metrics),
          Err(_) => {
            // Signal cooperative cancellation, then abort at the next await
            // point. A handler blocking the thread cannot be stopped; it is
            // abandoned and its outcome discarded.
            let _ = cancel_tx.send(true);
            abort.abort();
            let _ = (&mut task).await;
            self
              .metrics
              .executed_timeout
              .fetch_add(1, AtomicOrdering::Relaxed);
            ExecResult::TimedOut
          }
        },
        None => classify_join((&mut task).await, &self.metrics),
      }
    };
    tokio::pin!(attempt);

    loop {
      tokio::select! {
        biased;

        Ok(()) = shutdown_rx.changed() => {
          if matches!(*shutdown_rx.borrow(), Some(ShutdownMode::Force)) {
            warn!("Forced shutdown, aborting in-flight occurrence.");
            let _ = cancel_tx.send(true);
            abort.abort();
            return ExecResult::Aborted;
          }
        }

        result = &mut attempt => return result,
      }
    }
  }

  /// Translates the execution result into a store outcome per the job's
  /// retry policy and applies it.
  async fn apply_result(&self, occurrence: &Occurrence, job: &JobDefinition, result: ExecResult) {
    let now = self.clock.now();

    let error = match result {
      ExecResult::Success => {
        self.complete(occurrence, ExecutionOutcome::Succeeded, now).await;
        return;
      }
      ExecResult::Aborted => {
        // Not charged as an attempt; the occurrence goes back to Pending for
        // any instance to claim after restart.
        if let Err(e) = self.store.release_claim(occurrence.id, now).await {
          warn!(error = %e, "Failed to release claim after aborted execution.");
          self.metrics.store_errors.fetch_add(1, AtomicOrdering::Relaxed);
        }
        return;
      }
      ExecResult::Fail(message) => message,
      ExecResult::Panic => "job function panicked".to_string(),
      ExecResult::TimedOut => match job.timeout {
        Some(limit) => format!("execution exceeded timeout of {limit:?}"),
        None => "execution timed out".to_string(),
      },
    };

    if occurrence.attempt <= job.retry.max_retries {
      let delay = job.retry.delay_for_attempt(occurrence.attempt);
      let next_due = add_std_duration(now, delay);
      info!(
        retry_attempt = occurrence.attempt + 1,
        max_attempts = job.retry.max_retries + 1,
        next_due = %next_due,
        "Attempt failed, scheduling retry."
      );
      self
        .metrics
        .retries_scheduled
        .fetch_add(1, AtomicOrdering::Relaxed);
      self
        .complete(occurrence, ExecutionOutcome::Retry { error, next_due }, now)
        .await;
    } else {
      error!(
        attempts = occurrence.attempt,
        "Occurrence failed permanently after exhausting retries."
      );
      self
        .metrics
        .permanently_failed
        .fetch_add(1, AtomicOrdering::Relaxed);
      self
        .complete(occurrence, ExecutionOutcome::Failed { error }, now)
        .await;
    }
  }

  async fn complete(
    &self,
    occurrence: &Occurrence,
    outcome: ExecutionOutcome,
    now: chrono::DateTime<chrono::Utc>,
  ) {
    match self
      .store
      .complete_occurrence(occurrence.id, &self.instance_id, outcome, now)
      .await
    {
      Ok(()) => {}
      Err(StoreError::TerminalOccurrence(_)) | Err(StoreError::ClaimConflict(_)) => {
        // The occurrence was canceled or recovered while we were executing.
        warn!("Occurrence moved on before its outcome could be recorded.");
      }
      Err(e) => {
        error!(error = %e, "Failed to record execution outcome.");
        self.metrics.store_errors.fetch_add(1, AtomicOrdering::Relaxed);
      }
    }
  }

  async fn release_quietly(&self, occurrence: &Occurrence) {
    let now = self.clock.now();
    if let Err(e) = self.store.release_claim(occurrence.id, now).await {
      warn!(error = %e, "Failed to release claim.");
    }
  }
}

fn classify_join(
  join: Result<Result<(), JobRunError>, tokio::task::JoinError>,
  metrics: &SchedulerMetrics,
) -> ExecResult {
  match join {
    Ok(Ok(())) => {
      metrics
        .executed_success
        .fetch_add(1, AtomicOrdering::Relaxed);
      ExecResult::Success
    }
    Ok(Err(e)) => {
      metrics.executed_fail.fetch_add(1, AtomicOrdering::Relaxed);
      ExecResult::Fail(e.message)
    }
    Err(join_error) if join_error.is_panic() => {
      error!("Job function panicked!");
      metrics.jobs_panicked.fetch_add(1, AtomicOrdering::Relaxed);
      ExecResult::Panic
    }
    Err(_) => {
      // Aborted from outside; the caller decides what that means.
      warn!("Job task was cancelled during execution.");
      metrics.executed_fail.fetch_add(1, AtomicOrdering::Relaxed);
      ExecResult::Fail("job task was cancelled".to_string())
    }
  }
}
