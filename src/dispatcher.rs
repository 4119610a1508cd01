//! The polling dispatcher.
//!
//! One dispatcher task per scheduler instance. Each tick it (1) plans the
//! next occurrence for every job that has none pending, (2) claims due
//! occurrences from the store under this instance's id, and (3) hands the
//! claims to the worker pool over a bounded channel. Persistent store
//! failures back the tick off exponentially instead of crashing the loop.

use crate::clock::Clock;
use crate::error::StoreError;
use crate::job::Occurrence;
use crate::metrics::SchedulerMetrics;
use crate::scheduler::ShutdownMode;
use crate::store::JobStore;

use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Duration;

use async_channel::Sender as DispatchSender;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub(crate) struct Dispatcher {
  instance_id: String,
  store: Arc<dyn JobStore>,
  clock: Arc<dyn Clock>,
  metrics: SchedulerMetrics,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  dispatch_tx: DispatchSender<Occurrence>,
  poll_interval: Duration,
  batch_size: usize,
  /// Terminal occurrences older than this are purged. `None` keeps history
  /// forever.
  retention: Option<Duration>,
  purge_interval: Duration,
  next_purge_at: Option<DateTime<Utc>>,
  consecutive_failures: u32,
}

impl Dispatcher {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    instance_id: String,
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    metrics: SchedulerMetrics,
    shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
    dispatch_tx: DispatchSender<Occurrence>,
    poll_interval: Duration,
    batch_size: usize,
    retention: Option<Duration>,
  ) -> Self {
    Self {
      instance_id,
      store,
      clock,
      metrics,
      shutdown_rx,
      dispatch_tx,
      poll_interval,
      batch_size,
      retention,
      purge_interval: Duration::from_secs(60),
      next_purge_at: None,
      consecutive_failures: 0,
    }
  }

  pub async fn run(&mut self) {
    info!(
      instance_id = self.instance_id.as_str(),
      poll_interval_ms = self.poll_interval.as_millis(),
      batch_size = self.batch_size,
      "Dispatcher started."
    );

    loop {
      if self.is_shutting_down() {
        break;
      }

      let delay = self.current_delay();
      tokio::select! {
        biased;

        Ok(()) = self.shutdown_rx.changed() => {
          if self.is_shutting_down() {
            info!("Dispatcher received shutdown signal.");
            break;
          }
        }

        _ = tokio::time::sleep(delay) => {
          match self.tick().await {
            Ok(()) => {
              self.consecutive_failures = 0;
            }
            Err(e) => {
              self.consecutive_failures = self.consecutive_failures.saturating_add(1);
              self.metrics.store_errors.fetch_add(1, AtomicOrdering::Relaxed);
              warn!(
                error = %e,
                consecutive_failures = self.consecutive_failures,
                "Dispatcher tick failed, backing off."
              );
            }
          }
        }
      }
    }

    // Dropping the sender closes the channel; workers drain what is buffered
    // and exit.
    self.dispatch_tx.close();
    info!("Dispatcher task shutting down.");
  }

  fn is_shutting_down(&self) -> bool {
    self.shutdown_rx.borrow().is_some()
  }

  /// Poll interval, stretched exponentially while the store is failing.
  fn current_delay(&self) -> Duration {
    if self.consecutive_failures == 0 {
      return self.poll_interval;
    }
    let shift = self.consecutive_failures.min(8);
    let factor = 1u32 << shift;
    self
      .poll_interval
      .checked_mul(factor)
      .map(|d| d.min(MAX_BACKOFF))
      .unwrap_or(MAX_BACKOFF)
  }

  async fn tick(&mut self) -> Result<(), StoreError> {
    let now = self.clock.now();
    self.plan_occurrences(now).await?;
    self.claim_and_dispatch(now).await?;
    self.maybe_purge(now).await;
    Ok(())
  }

  /// Lazy one-step-ahead planning: any job with no Pending occurrence gets
  /// its next one enqueued, referenced from whichever is later of its
  /// latest known due time and now. Losing the enqueue race to another
  /// instance is a logged no-op.
  async fn plan_occurrences(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
    for job in self.store.list_jobs().await? {
      let horizon = self.store.horizon(job.id).await?;
      if horizon.has_pending {
        continue;
      }
      let reference = match horizon.latest_due {
        Some(latest) if latest > now => latest,
        _ => now,
      };
      let Some(next_due) = job.schedule.next_occurrence(reference) else {
        continue;
      };
      match self.store.enqueue_occurrence(job.id, next_due, now).await {
        Ok(_) => {
          debug!(job_id = %job.id, due = %next_due, "Planned next occurrence.");
        }
        Err(StoreError::DuplicateOccurrence { .. }) => {
          // Another instance planned the same slot first.
          self
            .metrics
            .duplicates_skipped
            .fetch_add(1, AtomicOrdering::Relaxed);
          debug!(job_id = %job.id, due = %next_due, "Occurrence already planned elsewhere.");
        }
        Err(StoreError::JobNotFound(_)) => {
          // Deleted since we listed it.
          debug!(job_id = %job.id, "Job deleted mid-planning, skipping.");
        }
        Err(e) => return Err(e),
      }
    }
    Ok(())
  }

  async fn claim_and_dispatch(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
    let claimed = self
      .store
      .claim_due(now, &self.instance_id, self.batch_size)
      .await?;
    if claimed.is_empty() {
      return Ok(());
    }

    debug!(count = claimed.len(), "Claimed due occurrences.");
    self
      .metrics
      .occurrences_claimed
      .fetch_add(claimed.len(), AtomicOrdering::Relaxed);

    let mut queue = claimed.into_iter();
    while let Some(occurrence) = queue.next() {
      if let Err(returned) = self.dispatch_tx.send(occurrence).await {
        // Workers are gone (shutdown); give the whole unsent remainder back,
        // not just the occurrence in hand.
        warn!("Worker pool unavailable, releasing unsent claims.");
        let now = self.clock.now();
        for unsent in std::iter::once(returned.0).chain(queue.by_ref()) {
          if let Err(e) = self.store.release_claim(unsent.id, now).await {
            warn!(occurrence_id = %unsent.id, error = %e, "Failed to release unsent claim.");
            self.metrics.store_errors.fetch_add(1, AtomicOrdering::Relaxed);
          }
        }
        break;
      }
    }
    Ok(())
  }

  /// Applies the retention policy on a coarse cadence. Purge failures are
  /// logged but never fail the tick.
  async fn maybe_purge(&mut self, now: DateTime<Utc>) {
    let Some(max_age) = self.retention else {
      return;
    };
    match self.next_purge_at {
      Some(at) if now < at => return,
      _ => {}
    }
    self.next_purge_at = Some(crate::job::add_std_duration(now, self.purge_interval));

    let cutoff = now
      - chrono::Duration::from_std(max_age)
        .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 2_000));
    match self.store.purge_terminal(cutoff).await {
      Ok(0) => {}
      Ok(purged) => {
        info!(purged, ?cutoff, "Purged terminal occurrences past retention.");
      }
      Err(e) => {
        warn!(error = %e, "Retention purge failed.");
        self.metrics.store_errors.fetch_add(1, AtomicOrdering::Relaxed);
      }
    }
  }
}
