//! tests/context.rs
//! Task-local job context and the JobInfo handed to run functions
#![cfg(feature = "job_context")]

mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::common::{build_keeper, setup_tracing, wait_for_status};
use parking_lot::Mutex;

use jobkeeper::{
  job_context, run_fn, try_get_current_job_context, InstanceStatus, JobContext, JobDefinition,
  JobInfo, JobKind, JobRegistry, Priority, ScheduleOptions,
};

#[tokio::test]
async fn test_context_matches_info_inside_run() {
  setup_tracing();
  let seen: Arc<Mutex<Option<(JobContext, JobContext, JobInfo)>>> = Arc::new(Mutex::new(None));
  let seen_in_job = seen.clone();
  let mut registry = JobRegistry::new();
  registry
    .register(
      "introspect",
      JobDefinition::from_boxed(
        JobKind::Single,
        run_fn! {
          { let seen = seen_in_job.clone(); }
          |_data, info| {
            let tried = try_get_current_job_context().ok_or("context missing")?;
            tokio::task::yield_now().await;
            // Still set after a suspension point.
            let from_macro = job_context!();
            *seen.lock() = Some((tried, from_macro, info));
            Ok(serde_json::Value::Null)
          }
        },
      )
      .display_name("Introspection job")
      .priority(Priority::High),
    )
    .unwrap();
  let keeper = build_keeper(registry, 1).unwrap();

  let instance_id = keeper
    .schedule(
      "introspect",
      serde_json::Value::Null,
      ScheduleOptions::new().unique("introspect-once"),
    )
    .await
    .unwrap()
    .instance_id()
    .unwrap();

  assert!(wait_for_status(&keeper, instance_id, InstanceStatus::Completed, StdDuration::from_secs(3)).await);

  let (tried, from_macro, info) = seen.lock().take().expect("run function did not record context");
  assert_eq!(tried.instance_id, instance_id);
  assert_eq!(tried.job_name, "introspect");
  assert_eq!(tried.times_executed, 0);
  assert_eq!(tried.lease_token, info.lease().token);
  assert_eq!(from_macro.instance_id, tried.instance_id);
  assert_eq!(from_macro.lease_token, tried.lease_token);

  assert_eq!(info.instance_id(), instance_id);
  assert_eq!(info.display_name(), Some("Introspection job"));
  assert_eq!(info.priority(), Priority::High.value());
  assert_eq!(info.uniqueness_key(), Some("introspect-once"));
  assert_eq!(info.lease().holder_id, keeper.holder_id());

  keeper.shutdown_graceful(None).await.unwrap();
}

#[tokio::test]
async fn test_no_context_outside_jobs() {
  assert!(try_get_current_job_context().is_none());
}
