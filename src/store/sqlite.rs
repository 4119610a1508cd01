//! Durable `JobStore` on SQLite via sqlx.
//!
//! One database file is shared by every scheduler instance pointed at it.
//! Claims run inside a transaction with a conditional `UPDATE .. WHERE
//! state = 'pending'` per row, so a row moves to Claimed exactly once no
//! matter how many instances poll concurrently. All timestamps are stored
//! as INTEGER microseconds since the Unix epoch.

use crate::cron::CronExpr;
use crate::error::StoreError;
use crate::job::{
  ExecutionOutcome, JobDefinition, JobId, JobPatch, Occurrence, OccurrenceId, OccurrenceState,
  Schedule,
};
use crate::store::{JobStore, OccurrenceHorizon, StoreResult};

use std::str::FromStr;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS job_definitions (
  id                 TEXT PRIMARY KEY,
  name               TEXT NOT NULL,
  schedule_kind      TEXT NOT NULL,
  schedule_value     TEXT NOT NULL,
  payload            TEXT NOT NULL,
  max_retries        INTEGER NOT NULL,
  retry_backoff_secs TEXT NOT NULL,
  timeout_secs       INTEGER,
  allow_overlap      INTEGER NOT NULL,
  created_at         INTEGER NOT NULL,
  updated_at         INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS occurrences (
  id          TEXT PRIMARY KEY,
  job_id      TEXT NOT NULL REFERENCES job_definitions(id),
  due_time    INTEGER NOT NULL,
  state       TEXT NOT NULL,
  claim_owner TEXT,
  claim_time  INTEGER,
  attempt     INTEGER NOT NULL,
  last_error  TEXT,
  created_at  INTEGER NOT NULL,
  updated_at  INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_occurrences_job_due
  ON occurrences (job_id, due_time);
CREATE INDEX IF NOT EXISTS idx_occurrences_state_due
  ON occurrences (state, due_time);
"#;

/// A `JobStore` persisted in a SQLite database.
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Opens (creating if missing) the database at `url` and ensures the
  /// schema exists. `sqlite::memory:` is accepted for tests; in-memory
  /// databases are pinned to a single connection so every handle sees the
  /// same data.
  pub async fn connect(url: &str) -> StoreResult<Self> {
    let options = SqliteConnectOptions::from_str(url)
      .map_err(unavailable)?
      .create_if_missing(true)
      .journal_mode(SqliteJournalMode::Wal)
      .busy_timeout(StdDuration::from_secs(5));

    let max_connections = if url.contains(":memory:") { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
      .max_connections(max_connections)
      .connect_with(options)
      .await
      .map_err(unavailable)?;
    Self::from_pool(pool).await
  }

  /// Wraps an existing pool, ensuring the schema exists.
  pub async fn from_pool(pool: SqlitePool) -> StoreResult<Self> {
    sqlx::raw_sql(SCHEMA)
      .execute(&pool)
      .await
      .map_err(unavailable)?;
    Ok(Self { pool })
  }

  pub fn pool(&self) -> &SqlitePool {
    &self.pool
  }
}

fn unavailable(e: impl std::fmt::Display) -> StoreError {
  StoreError::Unavailable(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
  matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn micros(t: DateTime<Utc>) -> i64 {
  t.timestamp_micros()
}

fn from_micros(v: i64) -> StoreResult<DateTime<Utc>> {
  DateTime::<Utc>::from_timestamp_micros(v)
    .ok_or_else(|| StoreError::Unavailable(format!("timestamp {v} out of range")))
}

fn parse_id(s: &str) -> StoreResult<Uuid> {
  Uuid::parse_str(s).map_err(|e| StoreError::Unavailable(format!("corrupt id '{s}': {e}")))
}

fn encode_schedule(schedule: &Schedule) -> (&'static str, String) {
  match schedule {
    Schedule::Once(at) => ("once", at.to_rfc3339()),
    Schedule::Cron(expr) => ("cron", expr.source().to_string()),
  }
}

fn decode_schedule(kind: &str, value: &str) -> StoreResult<Schedule> {
  match kind {
    "once" => {
      let at = DateTime::parse_from_rfc3339(value)
        .map_err(|e| StoreError::Unavailable(format!("corrupt one-off time '{value}': {e}")))?;
      Ok(Schedule::Once(at.with_timezone(&Utc)))
    }
    "cron" => {
      let expr = CronExpr::parse(value)
        .map_err(|e| StoreError::Unavailable(format!("corrupt cron expression: {e}")))?;
      Ok(Schedule::Cron(expr))
    }
    other => Err(StoreError::Unavailable(format!(
      "unknown schedule kind '{other}'"
    ))),
  }
}

fn job_from_row(row: &SqliteRow) -> StoreResult<JobDefinition> {
  let id = parse_id(&row.try_get::<String, _>("id").map_err(unavailable)?)?;
  let kind: String = row.try_get("schedule_kind").map_err(unavailable)?;
  let value: String = row.try_get("schedule_value").map_err(unavailable)?;
  let payload_text: String = row.try_get("payload").map_err(unavailable)?;
  let payload = serde_json::from_str(&payload_text)
    .map_err(|e| StoreError::Unavailable(format!("corrupt payload: {e}")))?;
  let backoff_text: String = row.try_get("retry_backoff_secs").map_err(unavailable)?;
  let backoff_secs: Vec<u64> = serde_json::from_str(&backoff_text)
    .map_err(|e| StoreError::Unavailable(format!("corrupt backoff list: {e}")))?;
  let timeout_secs: Option<i64> = row.try_get("timeout_secs").map_err(unavailable)?;

  Ok(JobDefinition {
    id,
    name: row.try_get("name").map_err(unavailable)?,
    schedule: decode_schedule(&kind, &value)?,
    payload,
    retry: crate::job::RetryPolicy {
      max_retries: row.try_get::<i64, _>("max_retries").map_err(unavailable)? as u32,
      backoff: backoff_secs
        .into_iter()
        .map(StdDuration::from_secs)
        .collect(),
    },
    timeout: timeout_secs.map(|s| StdDuration::from_secs(s as u64)),
    allow_overlap: row.try_get::<i64, _>("allow_overlap").map_err(unavailable)? != 0,
    created_at: from_micros(row.try_get("created_at").map_err(unavailable)?)?,
    updated_at: from_micros(row.try_get("updated_at").map_err(unavailable)?)?,
  })
}

fn occurrence_from_row(row: &SqliteRow) -> StoreResult<Occurrence> {
  let state_text: String = row.try_get("state").map_err(unavailable)?;
  let state = OccurrenceState::parse(&state_text)
    .ok_or_else(|| StoreError::Unavailable(format!("unknown occurrence state '{state_text}'")))?;
  let claim_time: Option<i64> = row.try_get("claim_time").map_err(unavailable)?;

  Ok(Occurrence {
    id: parse_id(&row.try_get::<String, _>("id").map_err(unavailable)?)?,
    job_id: parse_id(&row.try_get::<String, _>("job_id").map_err(unavailable)?)?,
    due_time: from_micros(row.try_get("due_time").map_err(unavailable)?)?,
    state,
    claim_owner: row.try_get("claim_owner").map_err(unavailable)?,
    claim_time: claim_time.map(from_micros).transpose()?,
    attempt: row.try_get::<i64, _>("attempt").map_err(unavailable)? as u32,
    last_error: row.try_get("last_error").map_err(unavailable)?,
    created_at: from_micros(row.try_get("created_at").map_err(unavailable)?)?,
    updated_at: from_micros(row.try_get("updated_at").map_err(unavailable)?)?,
  })
}

fn backoff_json(backoff: &[StdDuration]) -> String {
  let secs: Vec<u64> = backoff.iter().map(|d| d.as_secs()).collect();
  serde_json::to_string(&secs).unwrap_or_else(|_| "[]".to_string())
}

#[async_trait]
impl JobStore for SqliteStore {
  async fn create_job(&self, def: JobDefinition) -> StoreResult<JobId> {
    let (kind, value) = encode_schedule(&def.schedule);
    let payload =
      serde_json::to_string(&def.payload).map_err(|e| StoreError::Unavailable(e.to_string()))?;
    sqlx::query(
      "INSERT INTO job_definitions \
         (id, name, schedule_kind, schedule_value, payload, max_retries, \
          retry_backoff_secs, timeout_secs, allow_overlap, created_at, updated_at) \
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(def.id.to_string())
    .bind(&def.name)
    .bind(kind)
    .bind(value)
    .bind(payload)
    .bind(def.retry.max_retries as i64)
    .bind(backoff_json(&def.retry.backoff))
    .bind(def.timeout.map(|d| d.as_secs() as i64))
    .bind(def.allow_overlap as i64)
    .bind(micros(def.created_at))
    .bind(micros(def.updated_at))
    .execute(&self.pool)
    .await
    .map_err(unavailable)?;
    Ok(def.id)
  }

  async fn get_job(&self, id: JobId) -> StoreResult<JobDefinition> {
    let row = sqlx::query("SELECT * FROM job_definitions WHERE id = ?")
      .bind(id.to_string())
      .fetch_optional(&self.pool)
      .await
      .map_err(unavailable)?
      .ok_or(StoreError::JobNotFound(id))?;
    job_from_row(&row)
  }

  async fn list_jobs(&self) -> StoreResult<Vec<JobDefinition>> {
    let rows = sqlx::query("SELECT * FROM job_definitions ORDER BY created_at")
      .fetch_all(&self.pool)
      .await
      .map_err(unavailable)?;
    rows.iter().map(job_from_row).collect()
  }

  async fn update_job(&self, id: JobId, patch: JobPatch, now: DateTime<Utc>) -> StoreResult<()> {
    let mut job = self.get_job(id).await?;

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

    let (kind, value) = encode_schedule(&job.schedule);
    let payload =
      serde_json::to_string(&job.payload).map_err(|e| StoreError::Unavailable(e.to_string()))?;

    let mut tx = self.pool.begin().await.map_err(unavailable)?;
    sqlx::query(
      "UPDATE job_definitions SET schedule_kind = ?, schedule_value = ?, payload = ?, \
         max_retries = ?, retry_backoff_secs = ?, timeout_secs = ?, allow_overlap = ?, \
         updated_at = ? \
       WHERE id = ?",
    )
    .bind(kind)
    .bind(value)
    .bind(payload)
    .bind(job.retry.max_retries as i64)
    .bind(backoff_json(&job.retry.backoff))
    .bind(job.timeout.map(|d| d.as_secs() as i64))
    .bind(job.allow_overlap as i64)
    .bind(micros(now))
    .bind(id.to_string())
    .execute(&mut *tx)
    .await
    .map_err(unavailable)?;

    // Pending occurrences reflect the old schedule. They are planning
    // artifacts, not history, so drop them outright and free their slots;
    // otherwise a new schedule firing at the same instant could never be
    // planned. Claimed/Running ones finish on their own.
    if schedule_changed {
      sqlx::query("DELETE FROM occurrences WHERE job_id = ? AND state = 'pending'")
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;
    }
    tx.commit().await.map_err(unavailable)
  }

  async fn delete_job(&self, id: JobId, now: DateTime<Utc>) -> StoreResult<()> {
    let mut tx = self.pool.begin().await.map_err(unavailable)?;
    let deleted = sqlx::query("DELETE FROM job_definitions WHERE id = ?")
      .bind(id.to_string())
      .execute(&mut *tx)
      .await
      .map_err(unavailable)?;
    if deleted.rows_affected() == 0 {
      return Err(StoreError::JobNotFound(id));
    }
    sqlx::query(
      "UPDATE occurrences SET state = 'canceled', claim_owner = NULL, claim_time = NULL, \
         updated_at = ? \
       WHERE job_id = ? AND state IN ('pending', 'claimed', 'running')",
    )
    .bind(micros(now))
    .bind(id.to_string())
    .execute(&mut *tx)
    .await
    .map_err(unavailable)?;
    tx.commit().await.map_err(unavailable)
  }

  async fn enqueue_occurrence(
    &self,
    job_id: JobId,
    due_time: DateTime<Utc>,
    now: DateTime<Utc>,
  ) -> StoreResult<OccurrenceId> {
    let exists = sqlx::query("SELECT 1 FROM job_definitions WHERE id = ?")
      .bind(job_id.to_string())
      .fetch_optional(&self.pool)
      .await
      .map_err(unavailable)?;
    if exists.is_none() {
      return Err(StoreError::JobNotFound(job_id));
    }

    let id = Uuid::new_v4();
    let result = sqlx::query(
      "INSERT INTO occurrences \
         (id, job_id, due_time, state, attempt, created_at, updated_at) \
       VALUES (?, ?, ?, 'pending', 1, ?, ?)",
    )
    .bind(id.to_string())
    .bind(job_id.to_string())
    .bind(micros(due_time))
    .bind(micros(now))
    .bind(micros(now))
    .execute(&self.pool)
    .await;

    match result {
      Ok(_) => Ok(id),
      Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateOccurrence { job_id, due_time }),
      Err(e) => Err(unavailable(e)),
    }
  }

  async fn claim_due(
    &self,
    now: DateTime<Utc>,
    owner_id: &str,
    limit: usize,
  ) -> StoreResult<Vec<Occurrence>> {
    let mut tx = self.pool.begin().await.map_err(unavailable)?;

    let rows = sqlx::query(
      "SELECT o.* FROM occurrences o \
         JOIN job_definitions j ON j.id = o.job_id \
       WHERE o.state = 'pending' AND o.due_time <= ? \
         AND (j.allow_overlap != 0 OR NOT EXISTS ( \
               SELECT 1 FROM occurrences a \
               WHERE a.job_id = o.job_id AND a.state IN ('claimed', 'running'))) \
       ORDER BY o.due_time \
       LIMIT ?",
    )
    .bind(micros(now))
    .bind(limit as i64)
    .fetch_all(&mut *tx)
    .await
    .map_err(unavailable)?;

    let mut claimed = Vec::with_capacity(rows.len());
    let mut jobs_in_batch = std::collections::HashSet::new();
    for row in &rows {
      let mut occ = occurrence_from_row(row)?;
      // One claim per serialized job within the batch too.
      let allow_overlap: i64 = sqlx::query("SELECT allow_overlap FROM job_definitions WHERE id = ?")
        .bind(occ.job_id.to_string())
        .fetch_one(&mut *tx)
        .await
        .map_err(unavailable)?
        .try_get("allow_overlap")
        .map_err(unavailable)?;
      if allow_overlap == 0 && !jobs_in_batch.insert(occ.job_id) {
        continue;
      }

      // Conditional update: a concurrent claimer that won this row leaves
      // rows_affected at zero and we simply move on.
      let updated = sqlx::query(
        "UPDATE occurrences SET state = 'claimed', claim_owner = ?, claim_time = ?, \
           updated_at = ? \
         WHERE id = ? AND state = 'pending'",
      )
      .bind(owner_id)
      .bind(micros(now))
      .bind(micros(now))
      .bind(occ.id.to_string())
      .execute(&mut *tx)
      .await
      .map_err(unavailable)?;
      if updated.rows_affected() == 1 {
        occ.state = OccurrenceState::Claimed;
        occ.claim_owner = Some(owner_id.to_string());
        occ.claim_time = Some(now);
        occ.updated_at = now;
        claimed.push(occ);
      }
    }

    tx.commit().await.map_err(unavailable)?;
    Ok(claimed)
  }

  async fn mark_running(
    &self,
    id: OccurrenceId,
    owner_id: &str,
    now: DateTime<Utc>,
  ) -> StoreResult<()> {
    let updated = sqlx::query(
      "UPDATE occurrences SET state = 'running', updated_at = ? \
       WHERE id = ? AND state = 'claimed' AND claim_owner = ?",
    )
    .bind(micros(now))
    .bind(id.to_string())
    .bind(owner_id)
    .execute(&self.pool)
    .await
    .map_err(unavailable)?;
    if updated.rows_affected() == 1 {
      return Ok(());
    }
    // Distinguish a lost claim from a missing row.
    self.get_occurrence(id).await?;
    Err(StoreError::ClaimConflict(id))
  }

  async fn complete_occurrence(
    &self,
    id: OccurrenceId,
    owner_id: &str,
    outcome: ExecutionOutcome,
    now: DateTime<Utc>,
  ) -> StoreResult<()> {
    let result = match &outcome {
      ExecutionOutcome::Succeeded => sqlx::query(
        "UPDATE occurrences SET state = 'succeeded', claim_owner = NULL, claim_time = NULL, \
           updated_at = ? \
         WHERE id = ? AND state IN ('claimed', 'running') AND claim_owner = ?",
      )
      .bind(micros(now))
      .bind(id.to_string())
      .bind(owner_id)
      .execute(&self.pool)
      .await
      .map_err(unavailable)?,
      ExecutionOutcome::Failed { error } => sqlx::query(
        "UPDATE occurrences SET state = 'failed', last_error = ?, claim_owner = NULL, \
           claim_time = NULL, updated_at = ? \
         WHERE id = ? AND state IN ('claimed', 'running') AND claim_owner = ?",
      )
      .bind(error)
      .bind(micros(now))
      .bind(id.to_string())
      .bind(owner_id)
      .execute(&self.pool)
      .await
      .map_err(unavailable)?,
      ExecutionOutcome::Retry { error, next_due } => {
        // Moving the due time can collide with an already planned occurrence
        // for the same job; nudge forward a millisecond until the slot is
        // free.
        let mut due = *next_due;
        loop {
          let result = sqlx::query(
            "UPDATE occurrences SET state = 'pending', due_time = ?, attempt = attempt + 1, \
               last_error = ?, claim_owner = NULL, claim_time = NULL, updated_at = ? \
             WHERE id = ? AND state IN ('claimed', 'running') AND claim_owner = ?",
          )
          .bind(micros(due))
          .bind(error)
          .bind(micros(now))
          .bind(id.to_string())
          .bind(owner_id)
          .execute(&self.pool)
          .await;
          match result {
            Ok(r) => break r,
            Err(e) if is_unique_violation(&e) => {
              due += ChronoDuration::milliseconds(1);
            }
            Err(e) => return Err(unavailable(e)),
          }
        }
      }
    };

    if result.rows_affected() == 1 {
      return Ok(());
    }
    let current = self.get_occurrence(id).await?;
    if current.state.is_terminal() {
      Err(StoreError::TerminalOccurrence(id))
    } else {
      Err(StoreError::ClaimConflict(id))
    }
  }

  async fn find_stale_claims(&self, older_than: DateTime<Utc>) -> StoreResult<Vec<Occurrence>> {
    let rows = sqlx::query(
      "SELECT * FROM occurrences \
       WHERE state IN ('claimed', 'running') AND (claim_time IS NULL OR claim_time < ?) \
       ORDER BY claim_time",
    )
    .bind(micros(older_than))
    .fetch_all(&self.pool)
    .await
    .map_err(unavailable)?;
    rows.iter().map(occurrence_from_row).collect()
  }

  async fn release_claim(&self, id: OccurrenceId, now: DateTime<Utc>) -> StoreResult<bool> {
    let updated = sqlx::query(
      "UPDATE occurrences SET state = 'pending', claim_owner = NULL, claim_time = NULL, \
         updated_at = ? \
       WHERE id = ? AND state IN ('claimed', 'running')",
    )
    .bind(micros(now))
    .bind(id.to_string())
    .execute(&self.pool)
    .await
    .map_err(unavailable)?;
    if updated.rows_affected() == 1 {
      return Ok(true);
    }
    self.get_occurrence(id).await?;
    Ok(false)
  }

  async fn get_occurrence(&self, id: OccurrenceId) -> StoreResult<Occurrence> {
    let row = sqlx::query("SELECT * FROM occurrences WHERE id = ?")
      .bind(id.to_string())
      .fetch_optional(&self.pool)
      .await
      .map_err(unavailable)?
      .ok_or(StoreError::OccurrenceNotFound(id))?;
    occurrence_from_row(&row)
  }

  async fn list_occurrences(&self, job_id: JobId) -> StoreResult<Vec<Occurrence>> {
    let rows = sqlx::query("SELECT * FROM occurrences WHERE job_id = ? ORDER BY due_time")
      .bind(job_id.to_string())
      .fetch_all(&self.pool)
      .await
      .map_err(unavailable)?;
    rows.iter().map(occurrence_from_row).collect()
  }

  async fn horizon(&self, job_id: JobId) -> StoreResult<OccurrenceHorizon> {
    let row = sqlx::query(
      "SELECT MAX(due_time) AS latest_due, \
              MAX(CASE WHEN state = 'pending' THEN 1 ELSE 0 END) AS has_pending \
       FROM occurrences WHERE job_id = ?",
    )
    .bind(job_id.to_string())
    .fetch_one(&self.pool)
    .await
    .map_err(unavailable)?;
    let latest_due: Option<i64> = row.try_get("latest_due").map_err(unavailable)?;
    let has_pending: Option<i64> = row.try_get("has_pending").map_err(unavailable)?;
    Ok(OccurrenceHorizon {
      latest_due: latest_due.map(from_micros).transpose()?,
      has_pending: has_pending.unwrap_or(0) != 0,
    })
  }

  async fn purge_terminal(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
    let mut tx = self.pool.begin().await.map_err(unavailable)?;
    let purged = sqlx::query(
      "DELETE FROM occurrences \
       WHERE state IN ('succeeded', 'failed', 'canceled') AND updated_at < ?",
    )
    .bind(micros(older_than))
    .execute(&mut *tx)
    .await
    .map_err(unavailable)?
    .rows_affected();

    // One-off definitions with no occurrence rows left are finished.
    sqlx::query(
      "DELETE FROM job_definitions \
       WHERE schedule_kind = 'once' \
         AND NOT EXISTS (SELECT 1 FROM occurrences o WHERE o.job_id = job_definitions.id)",
    )
    .execute(&mut *tx)
    .await
    .map_err(unavailable)?;

    tx.commit().await.map_err(unavailable)?;
    Ok(purged)
  }
}
