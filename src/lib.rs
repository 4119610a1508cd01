//! TickVault: A Durable Background Job Scheduler
//!
//! Schedules one-off and recurring (cron) jobs against a persistent store,
//! executes them on a pool of async workers with per-job timeout and retry
//! policies, and survives restarts: every job, planned occurrence, and
//! outcome lives in the store, not in process memory.
//!
//! # Features
//!
//! - Schedule jobs using:
//!   - One-time execution at a specific `DateTime<Utc>`.
//!   - Standard 5-field cron expressions (UTC), including lists, ranges and
//!     steps, with classic day-of-month OR day-of-week matching.
//! - Durable by construction: job definitions and occurrences persist in a
//!   [`JobStore`](store::JobStore) (bundled: in-memory for tests, SQLite via
//!   the default `sqlite-store` feature).
//! - Multiple scheduler instances can share one store; atomic claims
//!   guarantee each occurrence executes on exactly one instance.
//! - Job functions are plain async closures registered by name in a
//!   [`JobRegistry`]; the stored job carries the name and a JSON payload.
//! - Configurable retry policies (fixed ladder or exponential backoff) with
//!   a per-execution timeout; panics are isolated and treated as failures.
//! - Startup recovery releases claims abandoned by crashed instances.
//! - Manual triggering, partial updates, and cancellation of jobs.
//! - Built-in metrics collection (queryable [`MetricsSnapshot`]).
//! - Graceful and forced shutdown procedures (with optional timeout).
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use chrono::Utc;
//! use tickvault::{JobRegistry, JobSpec, RetryPolicy, Schedule, Scheduler};
//! use tickvault::store::InMemoryStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Register job functions by name. The stored job carries the name
//!     // and payload; the function itself never leaves this process.
//!     let mut registry = JobRegistry::new();
//!     registry.register("send_report", |ctx| async move {
//!         println!("sending report to {}", ctx.payload["recipient"]);
//!         Ok(())
//!     });
//!
//!     // Swap in SqliteStore::connect("sqlite://jobs.db") for persistence
//!     // across restarts.
//!     let store = Arc::new(InMemoryStore::new());
//!
//!     let scheduler = Scheduler::builder()
//!         .store(store)
//!         .registry(registry)
//!         .max_workers(4)
//!         .poll_interval(Duration::from_millis(200))
//!         .build()?;
//!     scheduler.start().await?;
//!
//!     // A one-off job five seconds from now, retried up to 3 times.
//!     let spec = JobSpec::new(
//!         "send_report",
//!         Schedule::Once(Utc::now() + chrono::Duration::seconds(5)),
//!     )
//!     .with_payload(serde_json::json!({ "recipient": "ops@example.com" }))
//!     .with_retry(RetryPolicy::fixed(3, vec![Duration::from_secs(10)]))
//!     .with_timeout(Duration::from_secs(30));
//!     let job_id = scheduler.create_job(spec).await?;
//!
//!     // A recurring job: every day at 06:30 UTC.
//!     let daily = JobSpec::new("send_report", Schedule::cron("30 6 * * *")?);
//!     scheduler.create_job(daily).await?;
//!
//!     // Run it once right now as well, outside the regular schedule.
//!     scheduler.trigger_now(job_id).await?;
//!
//!     tokio::time::sleep(Duration::from_secs(10)).await;
//!     println!("metrics: {:#?}", scheduler.metrics_snapshot());
//!
//!     scheduler.shutdown_graceful(Some(Duration::from_secs(10))).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Execution Semantics
//!
//! - Delivery is at-least-once. A claim abandoned by a crashed instance is
//!   released after a configurable age and re-executed; job functions should
//!   be idempotent.
//! - An occurrence's attempt counter is 1-based: `max_retries = 3` allows 4
//!   total attempts, after which the occurrence is terminally Failed with
//!   its last error recorded.
//! - By default occurrences of one job never run concurrently; later due
//!   occurrences wait until the in-flight one finishes
//!   ([`JobSpec::with_allow_overlap`] relaxes this per job).
//! - On timeout the job's task is aborted at its next await point and the
//!   attempt counts as a failure; a handler that blocks the thread cannot be
//!   stopped and is abandoned instead.
//!
//! # Observability
//!
//! - Retrieve metrics snapshots using [`Scheduler::metrics_snapshot`].
//! - Inspect jobs and their occurrence history with [`Scheduler::get_job`],
//!   [`Scheduler::list_jobs`] and [`Scheduler::list_occurrences`].
//! - Integrate with the `tracing` crate for detailed logs.

pub mod clock;
pub mod cron;
mod dispatcher;
pub mod error;
pub mod job;
pub mod metrics;
mod recovery;
pub mod registry;
pub mod scheduler;
pub mod store;
mod worker;

// --- Public Re-exports ---

// Core scheduler components
pub use scheduler::{Scheduler, SchedulerBuilder, ShutdownMode};

// Error types
pub use error::{
  BuildError, JobRunError, ScheduleError, SchedulerError, ShutdownError, StoreError,
};

// Job related types
pub use cron::CronExpr;
pub use job::{
  ExecutionOutcome, JobDefinition, JobId, JobPatch, JobSpec, Occurrence, OccurrenceId,
  OccurrenceState, RetryPolicy, Schedule,
};
pub use registry::{JobContext, JobRegistry};

// Metrics related types
pub use metrics::{MetricsSnapshot, SchedulerMetrics};
