//! In-process `JobStore` backed by a single mutex.
//!
//! Claims are one critical section, which makes the at-most-one-claim
//! property trivial within a process. Ships for tests and embedded
//! single-process deployments; durability across restarts requires a
//! persistent backend such as [`SqliteStore`](crate::store::SqliteStore).

use crate::error::StoreError;
use crate::job::{
  ExecutionOutcome, JobDefinition, JobId, JobPatch, Occurrence, OccurrenceId, OccurrenceState,
};
use crate::store::{JobStore, OccurrenceHorizon, StoreResult};

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct State {
  jobs: HashMap<JobId, JobDefinition>,
  occurrences: HashMap<OccurrenceId, Occurrence>,
  // Uniqueness index enforcing one occurrence per (job, due time).
  by_due: HashMap<(JobId, DateTime<Utc>), OccurrenceId>,
}

impl State {
  /// Moves an occurrence's due time, keeping the uniqueness index in step.
  /// Nudges forward by a millisecond on the rare collision with an existing
  /// row (e.g. a retry landing exactly on an already planned due time).
  fn reindex_due(&mut self, id: OccurrenceId, job_id: JobId, old: DateTime<Utc>, new: DateTime<Utc>) -> DateTime<Utc> {
    self.by_due.remove(&(job_id, old));
    let mut due = new;
    while self.by_due.contains_key(&(job_id, due)) {
      due += ChronoDuration::milliseconds(1);
    }
    self.by_due.insert((job_id, due), id);
    due
  }
}

/// A `JobStore` holding everything in memory.
#[derive(Default)]
pub struct InMemoryStore {
  state: Mutex<State>,
}

impl InMemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl JobStore for InMemoryStore {
  async fn create_job(&self, def: JobDefinition) -> StoreResult<JobId> {
    let id = def.id;
    self.state.lock().jobs.insert(id, def);
    Ok(id)
  }

  async fn get_job(&self, id: JobId) -> StoreResult<JobDefinition> {
    self
      .state
      .lock()
      .jobs
      .get(&id)
      .cloned()
      .ok_or(StoreError::JobNotFound(id))
  }

  async fn list_jobs(&self) -> StoreResult<Vec<JobDefinition>> {
    let mut jobs: Vec<JobDefinition> = self.state.lock().jobs.values().cloned().collect();
    jobs.sort_by_key(|j| j.created_at);
    Ok(jobs)
  }

  async fn update_job(&self, id: JobId, patch: JobPatch, now: DateTime<Utc>) -> StoreResult<()> {
    let mut state = self.state.lock();
    let job = state.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;

    let schedule_changed = patch.schedule.is_some();
    if let Some(schedule) = patch.schedule {
      job.schedule = schedule;
    }
    if let Some(payload) = patch.payload {
      job.payload = payload;
    }
    if let Some(retry) = patch.retry {
      job.retry = retry;
    }
    if let Some(timeout) = patch.timeout {
      job.timeout = timeout;
    }
    if let Some(allow_overlap) = patch.allow_overlap {
      job.allow_overlap = allow_overlap;
    }
    job.updated_at = now;

    // Pending occurrences reflect the old schedule. They are planning
    // artifacts, not history, so drop them outright and free their slots;
    // otherwise a new schedule firing at the same instant could never be
    // planned. Claimed/Running ones finish on their own.
    if schedule_changed {
      let stale: Vec<OccurrenceId> = state
        .occurrences
        .values()
        .filter(|o| o.job_id == id && o.state == OccurrenceState::Pending)
        .map(|o| o.id)
        .collect();
      for occ_id in stale {
        if let Some(occ) = state.occurrences.remove(&occ_id) {
          state.by_due.remove(&(occ.job_id, occ.due_time));
        }
      }
    }
    Ok(())
  }

  async fn delete_job(&self, id: JobId, now: DateTime<Utc>) -> StoreResult<()> {
    let mut state = self.state.lock();
    state.jobs.remove(&id).ok_or(StoreError::JobNotFound(id))?;

    let open: Vec<OccurrenceId> = state
      .occurrences
      .values()
      .filter(|o| o.job_id == id && !o.state.is_terminal())
      .map(|o| o.id)
      .collect();
    for occ_id in open {
      if let Some(occ) = state.occurrences.get_mut(&occ_id) {
        occ.state = OccurrenceState::Canceled;
        occ.claim_owner = None;
        occ.claim_time = None;
        occ.updated_at = now;
      }
    }
    Ok(())
  }

  async fn enqueue_occurrence(
    &self,
    job_id: JobId,
    due_time: DateTime<Utc>,
    now: DateTime<Utc>,
  ) -> StoreResult<OccurrenceId> {
    let mut state = self.state.lock();
    if !state.jobs.contains_key(&job_id) {
      return Err(StoreError::JobNotFound(job_id));
    }
    if state.by_due.contains_key(&(job_id, due_time)) {
      return Err(StoreError::DuplicateOccurrence { job_id, due_time });
    }

    let id = Uuid::new_v4();
    state.by_due.insert((job_id, due_time), id);
    state.occurrences.insert(
      id,
      Occurrence {
        id,
        job_id,
        due_time,
        state: OccurrenceState::Pending,
        claim_owner: None,
        claim_time: None,
        attempt: 1,
        last_error: None,
        created_at: now,
        updated_at: now,
      },
    );
    Ok(id)
  }

  async fn claim_due(
    &self,
    now: DateTime<Utc>,
    owner_id: &str,
    limit: usize,
  ) -> StoreResult<Vec<Occurrence>> {
    let mut state = self.state.lock();

    // Jobs that already hold a live claim; serialized jobs must not gain a
    // second one.
    let mut active_jobs: HashSet<JobId> = state
      .occurrences
      .values()
      .filter(|o| o.state.is_claimed())
      .map(|o| o.job_id)
      .collect();

    let mut candidates: Vec<(DateTime<Utc>, OccurrenceId, JobId)> = state
      .occurrences
      .values()
      .filter(|o| o.state == OccurrenceState::Pending && o.due_time <= now)
      .map(|o| (o.due_time, o.id, o.job_id))
      .collect();
    candidates.sort();

    let mut claimed = Vec::new();
    for (_, occ_id, job_id) in candidates {
      if claimed.len() >= limit {
        break;
      }
      let allow_overlap = state
        .jobs
        .get(&job_id)
        .map(|j| j.allow_overlap)
        .unwrap_or(false);
      if !allow_overlap && active_jobs.contains(&job_id) {
        continue;
      }
      if let Some(occ) = state.occurrences.get_mut(&occ_id) {
        occ.state = OccurrenceState::Claimed;
        occ.claim_owner = Some(owner_id.to_string());
        occ.claim_time = Some(now);
        occ.updated_at = now;
        active_jobs.insert(job_id);
        claimed.push(occ.clone());
      }
    }
    Ok(claimed)
  }

  async fn mark_running(
    &self,
    id: OccurrenceId,
    owner_id: &str,
    now: DateTime<Utc>,
  ) -> StoreResult<()> {
    let mut state = self.state.lock();
    let occ = state
      .occurrences
      .get_mut(&id)
      .ok_or(StoreError::OccurrenceNotFound(id))?;
    if occ.state != OccurrenceState::Claimed || occ.claim_owner.as_deref() != Some(owner_id) {
      return Err(StoreError::ClaimConflict(id));
    }
    occ.state = OccurrenceState::Running;
    occ.updated_at = now;
    Ok(())
  }

  async fn complete_occurrence(
    &self,
    id: OccurrenceId,
    owner_id: &str,
    outcome: ExecutionOutcome,
    now: DateTime<Utc>,
  ) -> StoreResult<()> {
    let mut state = self.state.lock();
    let occ = state
      .occurrences
      .get(&id)
      .ok_or(StoreError::OccurrenceNotFound(id))?;
    if occ.state.is_terminal() {
      return Err(StoreError::TerminalOccurrence(id));
    }
    if !occ.state.is_claimed() || occ.claim_owner.as_deref() != Some(owner_id) {
      return Err(StoreError::ClaimConflict(id));
    }
    let (job_id, old_due) = (occ.job_id, occ.due_time);

    match outcome {
      // Terminal rows keep their (job, due) slot until purged, so the slot
      // cannot be replanned while the history row exists.
      ExecutionOutcome::Succeeded => {
        if let Some(occ) = state.occurrences.get_mut(&id) {
          occ.state = OccurrenceState::Succeeded;
          occ.claim_owner = None;
          occ.claim_time = None;
          occ.updated_at = now;
        }
      }
      ExecutionOutcome::Failed { error } => {
        if let Some(occ) = state.occurrences.get_mut(&id) {
          occ.state = OccurrenceState::Failed;
          occ.last_error = Some(error);
          occ.claim_owner = None;
          occ.claim_time = None;
          occ.updated_at = now;
        }
      }
      ExecutionOutcome::Retry { error, next_due } => {
        let due = state.reindex_due(id, job_id, old_due, next_due);
        if let Some(occ) = state.occurrences.get_mut(&id) {
          occ.state = OccurrenceState::Pending;
          occ.due_time = due;
          occ.attempt += 1;
          occ.last_error = Some(error);
          occ.claim_owner = None;
          occ.claim_time = None;
          occ.updated_at = now;
        }
      }
    }
    Ok(())
  }

  async fn find_stale_claims(&self, older_than: DateTime<Utc>) -> StoreResult<Vec<Occurrence>> {
    let state = self.state.lock();
    let mut stale: Vec<Occurrence> = state
      .occurrences
      .values()
      .filter(|o| o.state.is_claimed() && o.claim_time.map(|t| t < older_than).unwrap_or(true))
      .cloned()
      .collect();
    stale.sort_by_key(|o| o.claim_time);
    Ok(stale)
  }

  async fn release_claim(&self, id: OccurrenceId, now: DateTime<Utc>) -> StoreResult<bool> {
    let mut state = self.state.lock();
    let occ = state
      .occurrences
      .get_mut(&id)
      .ok_or(StoreError::OccurrenceNotFound(id))?;
    if !occ.state.is_claimed() {
      return Ok(false);
    }
    occ.state = OccurrenceState::Pending;
    occ.claim_owner = None;
    occ.claim_time = None;
    occ.updated_at = now;
    Ok(true)
  }

  async fn get_occurrence(&self, id: OccurrenceId) -> StoreResult<Occurrence> {
    self
      .state
      .lock()
      .occurrences
      .get(&id)
      .cloned()
      .ok_or(StoreError::OccurrenceNotFound(id))
  }

  async fn list_occurrences(&self, job_id: JobId) -> StoreResult<Vec<Occurrence>> {
    let state = self.state.lock();
    let mut occurrences: Vec<Occurrence> = state
      .occurrences
      .values()
      .filter(|o| o.job_id == job_id)
      .cloned()
      .collect();
    occurrences.sort_by_key(|o| o.due_time);
    Ok(occurrences)
  }

  async fn horizon(&self, job_id: JobId) -> StoreResult<OccurrenceHorizon> {
    let state = self.state.lock();
    let mut latest_due = None;
    let mut has_pending = false;
    for occ in state.occurrences.values().filter(|o| o.job_id == job_id) {
      if latest_due.map(|d| occ.due_time > d).unwrap_or(true) {
        latest_due = Some(occ.due_time);
      }
      has_pending |= occ.state == OccurrenceState::Pending;
    }
    Ok(OccurrenceHorizon {
      latest_due,
      has_pending,
    })
  }

  async fn purge_terminal(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
    let mut state = self.state.lock();
    let doomed: Vec<OccurrenceId> = state
      .occurrences
      .values()
      .filter(|o| o.state.is_terminal() && o.updated_at < older_than)
      .map(|o| o.id)
      .collect();
    let purged = doomed.len() as u64;
    for id in doomed {
      if let Some(occ) = state.occurrences.remove(&id) {
        state.by_due.remove(&(occ.job_id, occ.due_time));
      }
    }

    // One-off definitions with no occurrence rows left are finished.
    let finished: Vec<JobId> = state
      .jobs
      .values()
      .filter(|j| !j.schedule.is_recurring())
      .map(|j| j.id)
      .filter(|id| !state.occurrences.values().any(|o| o.job_id == *id))
      .collect();
    for id in finished {
      state.jobs.remove(&id);
    }
    Ok(purged)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::job::{JobSpec, Schedule};

  fn one_off_def(at: DateTime<Utc>) -> JobDefinition {
    let spec = JobSpec::new("test-job", Schedule::Once(at));
    JobDefinition::from_spec(spec, Uuid::new_v4(), at - ChronoDuration::minutes(5))
  }

  #[tokio::test]
  async fn duplicate_enqueue_is_rejected() {
    let store = InMemoryStore::new();
    let now = Utc::now();
    let def = one_off_def(now);
    let job_id = store.create_job(def).await.unwrap();

    store.enqueue_occurrence(job_id, now, now).await.unwrap();
    let err = store.enqueue_occurrence(job_id, now, now).await.unwrap_err();
    assert!(matches!(err, StoreError::DuplicateOccurrence { .. }));

    // Only one row exists.
    assert_eq!(store.list_occurrences(job_id).await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn claim_transitions_and_stamps_owner() {
    let store = InMemoryStore::new();
    let now = Utc::now();
    let job_id = store.create_job(one_off_def(now)).await.unwrap();
    store.enqueue_occurrence(job_id, now, now).await.unwrap();

    let claimed = store.claim_due(now, "worker-a", 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].state, OccurrenceState::Claimed);
    assert_eq!(claimed[0].claim_owner.as_deref(), Some("worker-a"));
    assert_eq!(claimed[0].claim_time, Some(now));

    // Nothing left to claim.
    assert!(store.claim_due(now, "worker-b", 10).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn future_occurrences_are_not_claimable() {
    let store = InMemoryStore::new();
    let now = Utc::now();
    let due = now + ChronoDuration::minutes(10);
    let job_id = store.create_job(one_off_def(due)).await.unwrap();
    store.enqueue_occurrence(job_id, due, now).await.unwrap();

    assert!(store.claim_due(now, "w", 10).await.unwrap().is_empty());
    assert_eq!(store.claim_due(due, "w", 10).await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn terminal_occurrences_are_immutable() {
    let store = InMemoryStore::new();
    let now = Utc::now();
    let job_id = store.create_job(one_off_def(now)).await.unwrap();
    let occ_id = store.enqueue_occurrence(job_id, now, now).await.unwrap();

    store.claim_due(now, "w", 1).await.unwrap();
    store
      .complete_occurrence(occ_id, "w", ExecutionOutcome::Succeeded, now)
      .await
      .unwrap();

    let err = store
      .complete_occurrence(occ_id, "w", ExecutionOutcome::Succeeded, now)
      .await
      .unwrap_err();
    assert!(matches!(err, StoreError::TerminalOccurrence(_)));

    assert!(!store.release_claim(occ_id, now).await.unwrap());
  }

  #[tokio::test]
  async fn retry_outcome_resets_to_pending_with_bumped_attempt() {
    let store = InMemoryStore::new();
    let now = Utc::now();
    let job_id = store.create_job(one_off_def(now)).await.unwrap();
    let occ_id = store.enqueue_occurrence(job_id, now, now).await.unwrap();

    store.claim_due(now, "w", 1).await.unwrap();
    let next_due = now + ChronoDuration::seconds(30);
    store
      .complete_occurrence(
        occ_id,
        "w",
        ExecutionOutcome::Retry {
          error: "boom".to_string(),
          next_due,
        },
        now,
      )
      .await
      .unwrap();

    let occ = store.get_occurrence(occ_id).await.unwrap();
    assert_eq!(occ.state, OccurrenceState::Pending);
    assert_eq!(occ.attempt, 2);
    assert_eq!(occ.due_time, next_due);
    assert_eq!(occ.last_error.as_deref(), Some("boom"));
    assert!(occ.claim_owner.is_none());
  }

  #[tokio::test]
  async fn purge_removes_old_terminal_rows_and_finished_one_offs() {
    let store = InMemoryStore::new();
    let now = Utc::now();
    let job_id = store.create_job(one_off_def(now)).await.unwrap();
    let occ_id = store.enqueue_occurrence(job_id, now, now).await.unwrap();
    store.claim_due(now, "w", 1).await.unwrap();
    store
      .complete_occurrence(occ_id, "w", ExecutionOutcome::Succeeded, now)
      .await
      .unwrap();

    // Not old enough yet.
    assert_eq!(store.purge_terminal(now).await.unwrap(), 0);
    let later = now + ChronoDuration::hours(1);
    assert_eq!(store.purge_terminal(later).await.unwrap(), 1);
    assert!(matches!(
      store.get_job(job_id).await.unwrap_err(),
      StoreError::JobNotFound(_)
    ));
  }
}
