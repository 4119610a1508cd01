//! Durable storage for job definitions and occurrences.
//!
//! The store is the single source of truth shared by every scheduler
//! instance; all cross-instance coordination happens through its atomic
//! claim primitive. Scheduler instances hold no authoritative state of
//! their own.

pub mod memory;
#[cfg(feature = "sqlite-store")]
pub mod sqlite;

use crate::error::StoreError;
use crate::job::{
  ExecutionOutcome, JobDefinition, JobId, JobPatch, Occurrence, OccurrenceId,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::InMemoryStore;
#[cfg(feature = "sqlite-store")]
pub use sqlite::SqliteStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Planning input for the dispatcher's lazy one-step-ahead enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OccurrenceHorizon {
  /// Largest `due_time` across all occurrences of the job, any state.
  pub latest_due: Option<DateTime<Utc>>,
  /// Whether any occurrence of the job is currently Pending.
  pub has_pending: bool,
}

/// Durable, crash-safe storage with atomic claim semantics.
///
/// Implementations must make every write durable before returning, and must
/// implement [`claim_due`](JobStore::claim_due) as a single atomic
/// read-modify-write so concurrent callers never claim the same occurrence.
#[async_trait]
pub trait JobStore: Send + Sync {
  // --- Job definitions ---

  async fn create_job(&self, def: JobDefinition) -> StoreResult<JobId>;

  async fn get_job(&self, id: JobId) -> StoreResult<JobDefinition>;

  async fn list_jobs(&self) -> StoreResult<Vec<JobDefinition>>;

  /// Applies a partial update. Fields left `None` in the patch are unchanged.
  /// A schedule change deletes the job's Pending occurrences (they are
  /// planning artifacts of the old schedule); Claimed/Running ones finish.
  async fn update_job(&self, id: JobId, patch: JobPatch, now: DateTime<Utc>) -> StoreResult<()>;

  /// Deletes the definition and cancels its non-terminal occurrences.
  /// Terminal occurrence rows are kept for history until purged.
  async fn delete_job(&self, id: JobId, now: DateTime<Utc>) -> StoreResult<()>;

  // --- Occurrences ---

  /// Inserts a Pending occurrence for `(job_id, due_time)`.
  ///
  /// Fails with [`StoreError::DuplicateOccurrence`] if one already exists
  /// for the pair, making repeated enqueue attempts idempotent.
  async fn enqueue_occurrence(
    &self,
    job_id: JobId,
    due_time: DateTime<Utc>,
    now: DateTime<Utc>,
  ) -> StoreResult<OccurrenceId>;

  /// Atomically claims up to `limit` due Pending occurrences for `owner_id`.
  ///
  /// Skips occurrences whose job already has a Claimed/Running occurrence
  /// unless that job allows overlap. Exactly one claimer wins each
  /// occurrence across any number of concurrent callers.
  async fn claim_due(
    &self,
    now: DateTime<Utc>,
    owner_id: &str,
    limit: usize,
  ) -> StoreResult<Vec<Occurrence>>;

  /// Claimed -> Running, verifying the claim is held by `owner_id`.
  async fn mark_running(
    &self,
    id: OccurrenceId,
    owner_id: &str,
    now: DateTime<Utc>,
  ) -> StoreResult<()>;

  /// Applies an execution outcome to a Claimed/Running occurrence, verifying
  /// the claim is still held by `owner_id` (an owner whose claim was
  /// recovered in the meantime gets [`StoreError::ClaimConflict`]).
  ///
  /// `Succeeded`/`Failed` are terminal; `Retry` resets the row to Pending at
  /// the new due time with `attempt + 1`. Terminal rows are immutable and
  /// yield [`StoreError::TerminalOccurrence`].
  async fn complete_occurrence(
    &self,
    id: OccurrenceId,
    owner_id: &str,
    outcome: ExecutionOutcome,
    now: DateTime<Utc>,
  ) -> StoreResult<()>;

  /// Occurrences stuck in Claimed/Running since before `older_than`,
  /// for the recovery manager.
  async fn find_stale_claims(&self, older_than: DateTime<Utc>) -> StoreResult<Vec<Occurrence>>;

  /// Resets a Claimed/Running occurrence to Pending, clearing the claim and
  /// preserving the attempt count. Returns false if the occurrence moved on
  /// in the meantime (already terminal or back to Pending).
  async fn release_claim(&self, id: OccurrenceId, now: DateTime<Utc>) -> StoreResult<bool>;

  // --- Monitoring / planning reads ---

  async fn get_occurrence(&self, id: OccurrenceId) -> StoreResult<Occurrence>;

  async fn list_occurrences(&self, job_id: JobId) -> StoreResult<Vec<Occurrence>>;

  async fn horizon(&self, job_id: JobId) -> StoreResult<OccurrenceHorizon>;

  // --- Retention ---

  /// Deletes terminal occurrences whose `updated_at` precedes `older_than`,
  /// plus one-off job definitions left with no occurrence rows. Returns the
  /// number of occurrences purged.
  async fn purge_terminal(&self, older_than: DateTime<Utc>) -> StoreResult<u64>;
}
