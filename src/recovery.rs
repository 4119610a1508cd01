//! Stale-claim recovery.
//!
//! A scheduler instance that crashes mid-execution leaves its occurrences
//! stuck in Claimed or Running. Liveness of the owning instance cannot be
//! observed directly, so a claim is presumed abandoned once its age exceeds
//! the configured threshold. The recovery pass runs once at startup, before
//! dispatching begins, and releases such claims back to Pending so any
//! instance can pick them up again.
//!
//! The release preserves the attempt count; a recovered occurrence may
//! re-execute work the dead owner already performed, which is the documented
//! at-least-once behavior.

use crate::error::StoreError;
use crate::metrics::SchedulerMetrics;
use crate::store::JobStore;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// Releases every claim older than `stale_claim_after` back to Pending.
///
/// Returns the number of occurrences recovered. Store errors on individual
/// releases are logged and counted but do not abort the pass.
pub(crate) async fn recover_stale_claims(
  store: &Arc<dyn JobStore>,
  now: DateTime<Utc>,
  stale_claim_after: Duration,
  metrics: &SchedulerMetrics,
) -> Result<usize, StoreError> {
  let cutoff = now
    - chrono::Duration::from_std(stale_claim_after)
      .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 2_000));

  let stale = store.find_stale_claims(cutoff).await?;
  if stale.is_empty() {
    info!("Recovery: no stale claims found.");
    return Ok(0);
  }

  info!(count = stale.len(), ?cutoff, "Recovery: releasing stale claims.");
  let mut recovered = 0;
  for occ in stale {
    match store.release_claim(occ.id, now).await {
      Ok(true) => {
        info!(
          occurrence_id = %occ.id,
          job_id = %occ.job_id,
          owner = occ.claim_owner.as_deref().unwrap_or("<none>"),
          attempt = occ.attempt,
          "Recovery: released stale claim back to pending."
        );
        recovered += 1;
      }
      Ok(false) => {
        // The occurrence moved on between find and release. Not an error.
        info!(occurrence_id = %occ.id, "Recovery: occurrence no longer claimed, skipping.");
      }
      Err(e) => {
        warn!(occurrence_id = %occ.id, error = %e, "Recovery: failed to release claim.");
        metrics.store_errors.fetch_add(1, Ordering::Relaxed);
      }
    }
  }

  metrics
    .occurrences_recovered
    .fetch_add(recovered, Ordering::Relaxed);
  Ok(recovered)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::job::{JobDefinition, JobSpec, OccurrenceState, Schedule};
  use crate::store::InMemoryStore;

  #[tokio::test]
  async fn releases_only_claims_past_the_threshold() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryStore::new());
    let metrics = SchedulerMetrics::new();
    let t0 = Utc::now();

    let spec = JobSpec::new("stale-job", Schedule::Once(t0));
    let job_id = store
      .create_job(JobDefinition::from_spec(spec, uuid::Uuid::new_v4(), t0))
      .await
      .unwrap();
    let occ_id = store.enqueue_occurrence(job_id, t0, t0).await.unwrap();

    // Claim at t0, then run recovery "ten minutes later" with a five minute
    // threshold.
    let claimed = store.claim_due(t0, "dead-instance", 8).await.unwrap();
    assert_eq!(claimed.len(), 1);

    let later = t0 + chrono::Duration::minutes(10);
    let recovered = recover_stale_claims(
      &store,
      later,
      Duration::from_secs(300),
      &metrics,
    )
    .await
    .unwrap();

    assert_eq!(recovered, 1);
    let occ = store.get_occurrence(occ_id).await.unwrap();
    assert_eq!(occ.state, OccurrenceState::Pending);
    assert_eq!(occ.claim_owner, None);
    assert_eq!(occ.attempt, 1);
    assert_eq!(metrics.snapshot().occurrences_recovered, 1);
  }

  #[tokio::test]
  async fn fresh_claims_are_left_alone() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryStore::new());
    let metrics = SchedulerMetrics::new();
    let t0 = Utc::now();

    let spec = JobSpec::new("fresh-job", Schedule::Once(t0));
    let job_id = store
      .create_job(JobDefinition::from_spec(spec, uuid::Uuid::new_v4(), t0))
      .await
      .unwrap();
    let occ_id = store.enqueue_occurrence(job_id, t0, t0).await.unwrap();
    store.claim_due(t0, "live-instance", 8).await.unwrap();

    // Ten seconds of claim age, five minute threshold.
    let later = t0 + chrono::Duration::seconds(10);
    let recovered = recover_stale_claims(
      &store,
      later,
      Duration::from_secs(300),
      &metrics,
    )
    .await
    .unwrap();

    assert_eq!(recovered, 0);
    let occ = store.get_occurrence(occ_id).await.unwrap();
    assert_eq!(occ.state, OccurrenceState::Claimed);
  }
}
