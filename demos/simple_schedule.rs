//! demos/simple_schedule.rs
//!
//! Demonstrates basic usage of JobKeeper:
//! - Registering a single job that persists its result.
//! - Scheduling instances with payloads, a human-readable run time and a uniqueness key.
//! - Watching terminal failures.
//! - Graceful shutdown.

use std::time::Duration as StdDuration;

use tracing::{error, info, warn};

use jobkeeper::{
  InstanceStatus, JobDefinition, JobKeeper, JobRegistry, RunError, ScheduleError, ScheduleOptions,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  // --- Setup Tracing ---
  let filter = tracing_subscriber::EnvFilter::try_new("warn,jobkeeper=info")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  // --- Register Jobs ---
  let mut registry = JobRegistry::new();
  registry.register(
    "send-invoice",
    JobDefinition::single(|data, info| async move {
      let Some(customer) = data["customer"].as_str().map(str::to_string) else {
        return Err("payload without customer".into());
      };
      info!(
        "*** Sending invoice to {} (attempt {}) ***",
        customer,
        info.times_executed() + 1
      );
      tokio::time::sleep(StdDuration::from_millis(50)).await;
      Ok::<_, RunError>(serde_json::json!({ "sent_to": customer }))
    })
    .persist_result(true)
    .max_retries(2),
  )?;

  // --- Build Engine ---
  let keeper = JobKeeper::builder()
    .registry(registry)
    .max_workers(2)
    .poll_interval(StdDuration::from_millis(200))
    .build()?;
  info!("Engine built, holder id {}.", keeper.holder_id());

  let mut failures = keeper.subscribe_failures();
  tokio::spawn(async move {
    while let Ok(failure) = failures.recv().await {
      error!(
        "Instance {} of '{}' failed for good after {} attempts: {}",
        failure.instance_id, failure.job_name, failure.fail_count, failure.reason
      );
    }
  });

  // --- Schedule ---
  let first = keeper
    .schedule(
      "send-invoice",
      serde_json::json!({ "customer": "ada" }),
      ScheduleOptions::new().run_at("in 2 seconds").unique("invoice:ada:2024-06"),
    )
    .await?;
  info!("Scheduled: {:?}", first);

  match keeper
    .schedule(
      "send-invoice",
      serde_json::json!({ "customer": "ada" }),
      ScheduleOptions::new().unique("invoice:ada:2024-06"),
    )
    .await
  {
    Err(ScheduleError::DuplicateSchedule { key }) => info!("Second invoice for '{}' rejected as expected.", key),
    other => warn!("Unexpected result for duplicate schedule: {:?}", other),
  }

  // This payload makes the run function fail until retries are exhausted.
  keeper
    .schedule("send-invoice", serde_json::json!({}), ScheduleOptions::new())
    .await?;

  // --- Let it Run ---
  info!("Waiting for jobs to run (approx 4 seconds)...");
  tokio::time::sleep(StdDuration::from_secs(4)).await;

  for instance in keeper.list_instances(Some("send-invoice")).await? {
    match instance.status {
      InstanceStatus::Completed => info!("{} completed with {:?}", instance.id, instance.result),
      status => info!("{} is {:?} ({:?})", instance.id, status, instance.fail_reason),
    }
  }
  info!("Final Metrics: {:#?}", keeper.get_metrics_snapshot());

  // --- Shutdown ---
  info!("Requesting graceful shutdown...");
  keeper.shutdown_graceful(Some(StdDuration::from_secs(10))).await?;
  info!("Scheduler shut down successfully.");
  Ok(())
}
