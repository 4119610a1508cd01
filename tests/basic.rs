//! tests/basic.rs
//! Basic scheduling tests (one-off execution, validation, manual trigger).

mod common;

use std::sync::{
  atomic::{AtomicBool, AtomicUsize, Ordering},
  Arc,
};
use std::time::Duration as StdDuration;

use chrono::{Duration as ChronoDuration, Utc};

use crate::common::{
  build_scheduler, register_counter, register_flag, setup_tracing, wait_until,
};
use tickvault::store::InMemoryStore;
use tickvault::{
  JobRegistry, JobSpec, OccurrenceState, Schedule, ScheduleError, SchedulerError,
};

#[tokio::test]
async fn one_off_job_executes_and_succeeds() {
  setup_tracing();
  let store = Arc::new(InMemoryStore::new());
  let executed = Arc::new(AtomicBool::new(false));

  let mut registry = JobRegistry::new();
  register_flag(&mut registry, "send_report", executed.clone(), StdDuration::ZERO);

  let scheduler = build_scheduler(store, registry, 1);
  scheduler.start().await.unwrap();

  let run_time = Utc::now() + ChronoDuration::milliseconds(150);
  let spec = JobSpec::new("send_report", Schedule::Once(run_time))
    .with_payload(serde_json::json!({ "recipient": "ops@example.com" }));
  let job_id = scheduler.create_job(spec).await.unwrap();

  assert!(
    wait_until(|| executed.load(Ordering::SeqCst), StdDuration::from_secs(3)).await,
    "one-off job should have executed"
  );

  let occurrences = wait_until_terminal(&scheduler, job_id).await;
  assert_eq!(occurrences.len(), 1);
  assert_eq!(occurrences[0].state, OccurrenceState::Succeeded);
  assert_eq!(occurrences[0].attempt, 1);
  assert_eq!(occurrences[0].due_time, run_time);

  let metrics = scheduler.metrics_snapshot();
  assert_eq!(metrics.executed_success, 1);
  assert_eq!(metrics.executed_fail, 0);

  scheduler.shutdown_graceful(None).await.unwrap();
}

#[tokio::test]
async fn past_one_off_is_rejected() {
  setup_tracing();
  let scheduler = build_scheduler(Arc::new(InMemoryStore::new()), JobRegistry::new(), 1);

  let spec = JobSpec::new(
    "whatever",
    Schedule::Once(Utc::now() - ChronoDuration::hours(1)),
  );
  let err = scheduler.create_job(spec).await.unwrap_err();
  assert!(matches!(
    err,
    SchedulerError::Schedule(ScheduleError::PastOneOff(_))
  ));

  // Nothing was persisted.
  assert!(scheduler.list_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn malformed_cron_is_rejected_before_persisting() {
  setup_tracing();
  let err = Schedule::cron("not a cron").unwrap_err();
  assert!(matches!(err, ScheduleError::InvalidCron { .. }));
}

#[tokio::test]
async fn trigger_now_runs_outside_the_schedule() {
  setup_tracing();
  let store = Arc::new(InMemoryStore::new());
  let counter = Arc::new(AtomicUsize::new(0));

  let mut registry = JobRegistry::new();
  register_counter(&mut registry, "nightly_rollup", counter.clone());

  let scheduler = build_scheduler(store, registry, 1);
  scheduler.start().await.unwrap();

  // Daily at midnight: the regular occurrence is far away.
  let spec = JobSpec::new("nightly_rollup", Schedule::cron("0 0 * * *").unwrap());
  let job_id = scheduler.create_job(spec).await.unwrap();

  let occurrence_id = scheduler.trigger_now(job_id).await.unwrap();

  assert!(
    wait_until(|| counter.load(Ordering::SeqCst) == 1, StdDuration::from_secs(3)).await,
    "manual trigger should have executed"
  );
  let occ = scheduler.get_occurrence(occurrence_id).await.unwrap();
  assert_eq!(occ.state, OccurrenceState::Succeeded);

  // The regular pending occurrence is untouched.
  let pending: Vec<_> = scheduler
    .list_occurrences(job_id)
    .await
    .unwrap()
    .into_iter()
    .filter(|o| o.state == OccurrenceState::Pending)
    .collect();
  assert_eq!(pending.len(), 1);

  scheduler.shutdown_graceful(None).await.unwrap();
}

#[tokio::test]
async fn unregistered_job_name_fails_the_occurrence() {
  setup_tracing();
  let store = Arc::new(InMemoryStore::new());
  let scheduler = build_scheduler(store, JobRegistry::new(), 1);
  scheduler.start().await.unwrap();

  let spec = JobSpec::new(
    "nobody_home",
    Schedule::Once(Utc::now() + ChronoDuration::milliseconds(100)),
  );
  let job_id = scheduler.create_job(spec).await.unwrap();

  let occurrences = wait_until_terminal(&scheduler, job_id).await;
  assert_eq!(occurrences[0].state, OccurrenceState::Failed);
  let last_error = occurrences[0].last_error.as_deref().unwrap_or_default();
  assert!(
    last_error.contains("no function registered"),
    "unexpected error: {last_error}"
  );

  scheduler.shutdown_graceful(None).await.unwrap();
}

// Waits for the job's occurrences to all be terminal and returns them.
async fn wait_until_terminal(
  scheduler: &tickvault::Scheduler,
  job_id: tickvault::JobId,
) -> Vec<tickvault::Occurrence> {
  let deadline = tokio::time::Instant::now() + StdDuration::from_secs(5);
  loop {
    let occurrences = scheduler.list_occurrences(job_id).await.unwrap();
    if !occurrences.is_empty() && occurrences.iter().all(|o| o.state.is_terminal()) {
      return occurrences;
    }
    assert!(
      tokio::time::Instant::now() < deadline,
      "occurrences never became terminal: {occurrences:?}"
    );
    tokio::time::sleep(StdDuration::from_millis(25)).await;
  }
}
