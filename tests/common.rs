//! tests/common.rs
//! Shared helper functions for integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use jobkeeper::{
  error::BuildError, run_fn, BoxedRunFn, InMemoryStore, InstanceId, InstanceStatus, JobKeeper,
  JobRegistry, JobStore,
};
use tracing_subscriber::fmt::TestWriter;

/// Poll interval used by test engines, short to keep tests fast.
pub const TEST_POLL: StdDuration = StdDuration::from_millis(25);

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_writer(TestWriter::new())
    .with_test_writer()
    .try_init();
}

// Builds an engine over its own in-memory store.
pub fn build_keeper(registry: JobRegistry, max_workers: usize) -> Result<JobKeeper, BuildError> {
  JobKeeper::builder()
    .registry(registry)
    .max_workers(max_workers)
    .poll_interval(TEST_POLL)
    .build()
}

// Builds an engine over a shared store, as a separate "process" would.
pub fn build_keeper_on(
  registry: JobRegistry,
  store: Arc<InMemoryStore>,
  max_workers: usize,
  holder_id: &str,
) -> Result<JobKeeper, BuildError> {
  JobKeeper::builder()
    .registry(registry)
    .store(store)
    .max_workers(max_workers)
    .poll_interval(TEST_POLL)
    .holder_id(holder_id)
    .build()
}

/// Polls `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: StdDuration, mut check: F) -> bool
where
  F: FnMut() -> Fut,
  Fut: Future<Output = bool>,
{
  let deadline = tokio::time::Instant::now() + timeout;
  loop {
    if check().await {
      return true;
    }
    if tokio::time::Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(StdDuration::from_millis(10)).await;
  }
}

/// Waits until the instance reaches `status`.
pub async fn wait_for_status(
  keeper: &JobKeeper,
  instance_id: InstanceId,
  status: InstanceStatus,
  timeout: StdDuration,
) -> bool {
  wait_until(timeout, || async {
    keeper
      .get_instance(instance_id)
      .await
      .map(|instance| instance.status == status)
      .unwrap_or(false)
  })
  .await
}

pub async fn count_in_store(store: &Arc<dyn JobStore>, job_name: &str) -> usize {
  store
    .count_instances(jobkeeper::InstanceFilter::new().job_name(job_name))
    .await
    .unwrap_or(0)
}

// Creates a run function that increments a counter, optionally delays,
// and then succeeds or fails.
pub fn run_counter_result(counter: Arc<AtomicUsize>, delay: StdDuration, succeeds: bool) -> BoxedRunFn {
  run_fn! {
    { let ctr = counter.clone(); }
    |_data, info| {
      let count = ctr.fetch_add(1, Ordering::SeqCst) + 1;
      tracing::debug!(
        instance_id = %info.instance_id(),
        "Counter job executing (Count: {}, WillSucceed: {})",
        count,
        succeeds
      );
      if delay > StdDuration::ZERO {
        tokio::time::sleep(delay).await;
      }
      if succeeds {
        Ok(serde_json::json!({ "count": count }))
      } else {
        Err(format!("forced failure #{}", count).into())
      }
    }
  }
}

// Creates a run function that panics.
pub fn run_panic() -> BoxedRunFn {
  run_fn! {
    |_data, _info| {
      tracing::debug!("Panic job executing...");
      tokio::task::yield_now().await;
      if true {
        panic!("Job forced panic!");
      }
      Ok(serde_json::Value::Null)
    }
  }
}

// Creates a run function for concurrency testing.
// Increments active count on start, decrements on end. Updates max observed.
pub fn run_concurrency_tracker(
  active_counter: Arc<AtomicUsize>,
  max_observed_active: Arc<AtomicUsize>,
  delay: StdDuration,
) -> BoxedRunFn {
  run_fn! {
    {
      let active = active_counter.clone();
      let max_obs = max_observed_active.clone();
    }
    |_data, _info| {
      let current_active = active.fetch_add(1, Ordering::SeqCst) + 1;
      tracing::debug!("Concurrency job START (Active: {})", current_active);
      max_obs.fetch_max(current_active, Ordering::SeqCst);

      if delay > StdDuration::ZERO {
        tokio::time::sleep(delay).await;
      }

      let current_active_after = active.fetch_sub(1, Ordering::SeqCst) - 1;
      tracing::debug!("Concurrency job END (Active: {})", current_active_after);
      Ok(serde_json::Value::Null)
    }
  }
}
