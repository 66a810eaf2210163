//! demos/cron_schedule.rs
//!
//! Demonstrates a recurrent job driven by a CRON expression.
//! Requires the `cron_schedule` feature (enabled by default).
//!
//! Expressions use the `cron` crate's format, with a leading seconds field:
//! `sec min hour day-of-month month day-of-week [year]`, evaluated in UTC.

use std::time::Duration as StdDuration;

use tracing::info;

use jobkeeper::{JobDefinition, JobKeeper, JobRegistry, Priority, RunEvery};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  let filter = tracing_subscriber::EnvFilter::try_new("warn,jobkeeper=info,cron_schedule=info")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  let mut registry = JobRegistry::new();
  registry.register(
    "every-five-seconds",
    JobDefinition::recurrent(|_data, info| async move {
      info!("*** Cron job fired, scheduled for {} ***", info.scheduled_for());
      Ok(serde_json::Value::Null)
    })
    .run_every(RunEvery::from_expression("*/5 * * * * *"))
    .priority(Priority::High)
    .display_name("Five second ticker"),
  )?;

  // Rejected at registration: not a duration phrase and not valid CRON.
  let rejected = registry.register(
    "broken",
    JobDefinition::recurrent(|_data, _info| async move { Ok(serde_json::Value::Null) })
      .run_every(RunEvery::from_expression("every full moon")),
  );
  info!("Registering a bad expression: {:?}", rejected.map(|_| ()));

  let keeper = JobKeeper::builder()
    .registry(registry)
    .max_workers(1)
    .build()?;

  info!("Running for ~12 seconds...");
  tokio::time::sleep(StdDuration::from_secs(12)).await;

  info!("Final Metrics: {:#?}", keeper.get_metrics_snapshot());
  keeper.shutdown_graceful(Some(StdDuration::from_secs(5))).await?;
  Ok(())
}
