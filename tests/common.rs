//! tests/common.rs
//! Shared helper functions for integration tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use tracing_subscriber::fmt::TestWriter;

use tickvault::store::JobStore;
use tickvault::{JobRegistry, JobRunError, Scheduler};

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_writer(TestWriter::new())
    .with_test_writer()
    .try_init();
}

// Builds a scheduler with a fast poll interval so tests settle quickly.
pub fn build_scheduler(
  store: Arc<dyn JobStore>,
  registry: JobRegistry,
  max_workers: usize,
) -> Scheduler {
  Scheduler::builder()
    .store(store)
    .registry(registry)
    .max_workers(max_workers)
    .poll_interval(StdDuration::from_millis(50))
    .stale_claim_after(StdDuration::from_secs(60))
    .build()
    .expect("scheduler should build")
}

// Registers a job function that increments a counter and succeeds.
pub fn register_counter(registry: &mut JobRegistry, name: &str, counter: Arc<AtomicUsize>) {
  registry.register(name, move |_ctx| {
    let counter = counter.clone();
    async move {
      let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
      tracing::debug!("Counter job executing (count: {})", count);
      Ok(())
    }
  });
}

// Registers a job function that sets a flag after an optional delay.
pub fn register_flag(
  registry: &mut JobRegistry,
  name: &str,
  flag: Arc<AtomicBool>,
  delay: StdDuration,
) {
  registry.register(name, move |_ctx| {
    let flag = flag.clone();
    async move {
      if delay > StdDuration::ZERO {
        tokio::time::sleep(delay).await;
      }
      flag.store(true, Ordering::SeqCst);
      tracing::debug!("Flag job set flag to true");
      Ok(())
    }
  });
}

// Registers a job function that fails the first `failures` executions, then
// succeeds. Counts every execution.
pub fn register_fail_then_succeed(
  registry: &mut JobRegistry,
  name: &str,
  counter: Arc<AtomicUsize>,
  failures: usize,
) {
  registry.register(name, move |_ctx| {
    let counter = counter.clone();
    async move {
      let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
      if count <= failures {
        tracing::debug!("Flaky job failing (attempt {})", count);
        Err(JobRunError::new(format!("induced failure #{count}")))
      } else {
        tracing::debug!("Flaky job succeeding (attempt {})", count);
        Ok(())
      }
    }
  });
}

// Registers a job function that always fails.
pub fn register_always_fail(registry: &mut JobRegistry, name: &str, counter: Arc<AtomicUsize>) {
  register_fail_then_succeed(registry, name, counter, usize::MAX);
}

// Registers a job function that panics after counting its execution.
pub fn register_panic(registry: &mut JobRegistry, name: &str, counter: Arc<AtomicUsize>) {
  registry.register(name, move |_ctx| {
    let counter = counter.clone();
    async move {
      counter.fetch_add(1, Ordering::SeqCst);
      tokio::task::yield_now().await;
      panic!("Job forced panic!");
      #[allow(unreachable_code)]
      Ok(())
    }
  });
}

// Registers a job function that sleeps, marking entry and completion.
pub fn register_slow(
  registry: &mut JobRegistry,
  name: &str,
  started: Arc<AtomicBool>,
  finished: Arc<AtomicBool>,
  delay: StdDuration,
) {
  registry.register(name, move |_ctx| {
    let started = started.clone();
    let finished = finished.clone();
    async move {
      started.store(true, Ordering::SeqCst);
      tokio::time::sleep(delay).await;
      finished.store(true, Ordering::SeqCst);
      Ok(())
    }
  });
}

// Polls `cond` until it holds or the timeout elapses. Returns the final value.
pub async fn wait_until<F: Fn() -> bool>(cond: F, timeout: StdDuration) -> bool {
  let deadline = tokio::time::Instant::now() + timeout;
  while tokio::time::Instant::now() < deadline {
    if cond() {
      return true;
    }
    tokio::time::sleep(StdDuration::from_millis(20)).await;
  }
  cond()
}
