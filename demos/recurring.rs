//! demos/recurring.rs
//!
//! Demonstrates recurrent jobs:
//! - An interval job with a single self-rescheduling instance.
//! - A job driven by a custom `get_next_run` function.
//! - Reading the job context from inside a run function.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::info;

use jobkeeper::{run_fn, JobDefinition, JobKeeper, JobKind, JobRegistry, RunEvery, ScheduleOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  let filter = tracing_subscriber::EnvFilter::try_new("warn,jobkeeper=info,recurring=info")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  let heartbeats = Arc::new(AtomicUsize::new(0));

  let beats_in_job = heartbeats.clone();
  let mut registry = JobRegistry::new();
  registry.register(
    "heartbeat",
    JobDefinition::from_boxed(
      JobKind::Recurrent,
      run_fn! {
        { let beats = beats_in_job.clone(); }
        |_data, info| {
          let beat = beats.fetch_add(1, Ordering::Relaxed) + 1;
          #[cfg(feature = "job_context")]
          if let Some(ctx) = jobkeeper::try_get_current_job_context() {
            info!("Heartbeat {} under lease {}", beat, ctx.lease_token);
          }
          info!("*** {} #{} (was due {}) ***", info.job_name(), beat, info.scheduled_for());
          Ok(serde_json::Value::Null)
        }
      },
    )
    // "1500" would be read as milliseconds too.
    .run_every(RunEvery::from_expression("1 second and 500ms")),
  )?;

  registry.register(
    "jittery",
    JobDefinition::recurrent(|_data, _info| async move {
      info!("*** Jittery job ran ***");
      Ok(serde_json::Value::Null)
    })
    .get_next_run(|| {
      let now = Utc::now();
      let jitter = i64::from(now.timestamp_subsec_millis() % 600);
      now + ChronoDuration::milliseconds(700 + jitter)
    }),
  )?;

  let keeper = JobKeeper::builder()
    .registry(registry)
    .max_workers(2)
    .poll_interval(StdDuration::from_millis(100))
    .build()?;

  // Scheduling a recurrent job returns its one live instance.
  let outcome = keeper
    .schedule("heartbeat", serde_json::Value::Null, ScheduleOptions::new())
    .await?;
  info!("Heartbeat instance: {:?}", outcome);

  tokio::time::sleep(StdDuration::from_secs(6)).await;

  for instance in keeper.list_instances(None).await? {
    info!(
      "{} next runs at {} (failures so far: {})",
      instance.job_name, instance.next_run_at, instance.fail_count
    );
  }
  info!("Heartbeats: {}", heartbeats.load(Ordering::Relaxed));
  info!("Final Metrics: {:#?}", keeper.get_metrics_snapshot());

  keeper.shutdown_graceful(Some(StdDuration::from_secs(5))).await?;
  Ok(())
}
