//! tests/panic.rs
//! Panicking run functions are contained and recorded as failures

mod common;

use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc,
};
use std::time::Duration as StdDuration;

use crate::common::{build_keeper, run_counter_result, run_panic, setup_tracing, wait_for_status};

use jobkeeper::{InstanceStatus, JobDefinition, JobKind, JobRegistry, ScheduleOptions};

#[tokio::test]
async fn test_panic_marks_instance_failed() {
  setup_tracing();
  let mut registry = JobRegistry::new();
  registry
    .register("explodes", JobDefinition::from_boxed(JobKind::Single, run_panic()))
    .unwrap();
  let keeper = build_keeper(registry, 1).unwrap();
  let mut failures = keeper.subscribe_failures();

  let instance_id = keeper
    .schedule("explodes", serde_json::Value::Null, ScheduleOptions::new())
    .await
    .unwrap()
    .instance_id()
    .unwrap();

  assert!(wait_for_status(&keeper, instance_id, InstanceStatus::Failed, StdDuration::from_secs(3)).await);
  let instance = keeper.get_instance(instance_id).await.unwrap();
  assert_eq!(instance.fail_count, 1);
  let reason = instance.fail_reason.unwrap();
  assert!(reason.contains("panicked"), "reason was {:?}", reason);
  assert!(reason.contains("Job forced panic!"));
  assert!(instance.lease.is_none());

  let notice = tokio::time::timeout(StdDuration::from_secs(1), failures.recv())
    .await
    .unwrap()
    .unwrap();
  assert_eq!(notice.instance_id, instance_id);

  let metrics = keeper.get_metrics_snapshot();
  assert_eq!(metrics.jobs_panicked, 1);
  assert_eq!(metrics.jobs_failed, 0);
  assert_eq!(metrics.workers_active_current, 0);

  keeper.shutdown_graceful(Some(StdDuration::from_secs(2))).await.unwrap();
}

#[tokio::test]
async fn test_worker_survives_panic() {
  setup_tracing();
  let counter = Arc::new(AtomicUsize::new(0));
  let mut registry = JobRegistry::new();
  registry
    .register("explodes", JobDefinition::from_boxed(JobKind::Single, run_panic()).max_retries(1))
    .unwrap();
  registry
    .register(
      "fine",
      JobDefinition::from_boxed(
        JobKind::Single,
        run_counter_result(counter.clone(), StdDuration::ZERO, true),
      ),
    )
    .unwrap();
  // A single worker must handle both the panics and the healthy job.
  let keeper = build_keeper(registry, 1).unwrap();

  let bad = keeper
    .schedule("explodes", serde_json::Value::Null, ScheduleOptions::new())
    .await
    .unwrap()
    .instance_id()
    .unwrap();
  let good = keeper
    .schedule("fine", serde_json::Value::Null, ScheduleOptions::new())
    .await
    .unwrap()
    .instance_id()
    .unwrap();

  assert!(wait_for_status(&keeper, bad, InstanceStatus::Failed, StdDuration::from_secs(3)).await);
  assert!(wait_for_status(&keeper, good, InstanceStatus::Completed, StdDuration::from_secs(3)).await);
  assert_eq!(keeper.get_instance(bad).await.unwrap().fail_count, 2, "Panics are retried like errors");
  assert_eq!(counter.load(Ordering::SeqCst), 1);
  assert_eq!(keeper.get_metrics_snapshot().jobs_panicked, 2);

  keeper.shutdown_graceful(None).await.unwrap();
}
