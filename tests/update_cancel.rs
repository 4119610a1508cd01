//! tests/update_cancel.rs
//! Partial job updates, schedule replanning, and cancellation.

mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration as ChronoDuration, TimeZone, Timelike, Utc};

use crate::common::{build_scheduler, setup_tracing};
use tickvault::clock::ManualClock;
use tickvault::store::InMemoryStore;
use tickvault::{
  JobPatch, JobRegistry, JobSpec, OccurrenceState, RetryPolicy, Schedule, ScheduleError,
  Scheduler, SchedulerError, StoreError,
};

#[tokio::test]
async fn schedule_change_discards_pending_and_replans() {
  setup_tracing();
  let scheduler = build_scheduler(Arc::new(InMemoryStore::new()), JobRegistry::new(), 1);

  let spec = JobSpec::new("rollup", Schedule::cron("0 0 * * *").unwrap());
  let job_id = scheduler.create_job(spec).await.unwrap();

  let patch = JobPatch {
    schedule: Some(Schedule::cron("0 12 * * *").unwrap()),
    ..Default::default()
  };
  scheduler.update_job(job_id, patch).await.unwrap();

  // The midnight row was a planning artifact of the old schedule; it is
  // gone, replaced by a single pending row from the new one.
  let occurrences = scheduler.list_occurrences(job_id).await.unwrap();
  assert_eq!(occurrences.len(), 1);
  assert_eq!(occurrences[0].state, OccurrenceState::Pending);
  assert_eq!(occurrences[0].due_time.hour(), 12);

  let job = scheduler.get_job(job_id).await.unwrap();
  assert_eq!(job.schedule, Schedule::cron("0 12 * * *").unwrap());
}

#[tokio::test]
async fn schedule_update_keeps_a_coinciding_slot_firable() {
  setup_tracing();
  let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 30).unwrap();
  let clock = Arc::new(ManualClock::new(t0));
  let scheduler = Scheduler::builder()
    .store(Arc::new(InMemoryStore::new()))
    .registry(JobRegistry::new())
    .max_workers(1)
    .clock(clock)
    .build()
    .unwrap();

  // Every minute; the first occurrence lands on the next minute boundary.
  let spec = JobSpec::new("heartbeat", Schedule::cron("* * * * *").unwrap());
  let job_id = scheduler.create_job(spec).await.unwrap();
  let slot = Utc.with_ymd_and_hms(2024, 5, 1, 10, 1, 0).unwrap();
  let before = scheduler.list_occurrences(job_id).await.unwrap();
  assert_eq!(before.len(), 1);
  assert_eq!(before[0].due_time, slot);

  // An equivalent schedule fires at the exact same instant. The slot must
  // stay planned, not be shadowed by a leftover row from the old schedule.
  let patch = JobPatch {
    schedule: Some(Schedule::cron("* * * * *").unwrap()),
    ..Default::default()
  };
  scheduler.update_job(job_id, patch).await.unwrap();

  let after = scheduler.list_occurrences(job_id).await.unwrap();
  assert_eq!(after.len(), 1);
  assert_eq!(after[0].state, OccurrenceState::Pending);
  assert_eq!(after[0].due_time, slot);
}

#[tokio::test]
async fn payload_and_retry_patches_leave_occurrences_alone() {
  setup_tracing();
  let scheduler = build_scheduler(Arc::new(InMemoryStore::new()), JobRegistry::new(), 1);

  let spec = JobSpec::new("rollup", Schedule::cron("0 0 * * *").unwrap());
  let job_id = scheduler.create_job(spec).await.unwrap();
  let before = scheduler.list_occurrences(job_id).await.unwrap();

  let patch = JobPatch {
    payload: Some(serde_json::json!({ "tenant": "acme" })),
    retry: Some(RetryPolicy::exponential(5)),
    ..Default::default()
  };
  scheduler.update_job(job_id, patch).await.unwrap();

  let after = scheduler.list_occurrences(job_id).await.unwrap();
  assert_eq!(before.len(), after.len());
  assert_eq!(before[0].id, after[0].id);
  assert_eq!(after[0].state, OccurrenceState::Pending);

  let job = scheduler.get_job(job_id).await.unwrap();
  assert_eq!(job.payload["tenant"], "acme");
  assert_eq!(job.retry.max_retries, 5);
}

#[tokio::test]
async fn updating_to_a_past_one_off_is_rejected() {
  setup_tracing();
  let scheduler = build_scheduler(Arc::new(InMemoryStore::new()), JobRegistry::new(), 1);

  let spec = JobSpec::new("rollup", Schedule::cron("0 0 * * *").unwrap());
  let job_id = scheduler.create_job(spec).await.unwrap();

  let patch = JobPatch {
    schedule: Some(Schedule::Once(Utc::now() - ChronoDuration::hours(1))),
    ..Default::default()
  };
  let err = scheduler.update_job(job_id, patch).await.unwrap_err();
  assert!(matches!(
    err,
    SchedulerError::Schedule(ScheduleError::PastOneOff(_))
  ));

  // Unchanged.
  let job = scheduler.get_job(job_id).await.unwrap();
  assert_eq!(job.schedule, Schedule::cron("0 0 * * *").unwrap());
}

#[tokio::test]
async fn cancel_removes_the_job_and_cancels_pending_work() {
  setup_tracing();
  let scheduler = build_scheduler(Arc::new(InMemoryStore::new()), JobRegistry::new(), 1);

  let spec = JobSpec::new(
    "one_shot",
    Schedule::Once(Utc::now() + ChronoDuration::minutes(30)),
  );
  let job_id = scheduler.create_job(spec).await.unwrap();

  scheduler.cancel_job(job_id).await.unwrap();

  let err = scheduler.get_job(job_id).await.unwrap_err();
  assert!(matches!(err, StoreError::JobNotFound(_)));

  // The occurrence row survives as history, in Canceled state.
  let occurrences = scheduler.list_occurrences(job_id).await.unwrap();
  assert_eq!(occurrences.len(), 1);
  assert_eq!(occurrences[0].state, OccurrenceState::Canceled);

  // Cancel is not idempotent on a missing job.
  let err = scheduler.cancel_job(job_id).await.unwrap_err();
  assert!(matches!(err, StoreError::JobNotFound(_)));
}
