//! demos/two_dispatchers.rs
//!
//! Two engines ("processes") sharing one store:
//! - Instances scheduled through either engine run exactly once.
//! - `lock_limit` caps simultaneous runs of a job across both engines.
//! - The recurrent job is seeded once, whichever engine gets there first.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use tracing::info;

use jobkeeper::{
  InMemoryStore, JobDefinition, JobKeeper, JobRegistry, JobStore, ScheduleOptions,
};

fn registry() -> Result<JobRegistry, jobkeeper::RegisterError> {
  let mut registry = JobRegistry::new();
  registry.register(
    "resize-image",
    JobDefinition::single(|data, info| async move {
      info!(
        "*** {} resizing {} ***",
        info.lease().holder_id,
        data["image"].as_str().unwrap_or("?")
      );
      tokio::time::sleep(StdDuration::from_millis(300)).await;
      Ok(serde_json::Value::Null)
    })
    .lock_limit(2)
    .lock_lifetime(StdDuration::from_secs(5)),
  )?;
  registry.register(
    "cleanup",
    JobDefinition::recurrent(|_data, info| async move {
      info!("*** Cleanup on {} ***", info.lease().holder_id);
      Ok(serde_json::Value::Null)
    })
    .run_every(StdDuration::from_secs(2)),
  )?;
  Ok(registry)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  let filter = tracing_subscriber::EnvFilter::try_new("warn,two_dispatchers=info,jobkeeper=info")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  let store: Arc<dyn JobStore> = Arc::new(InMemoryStore::new());

  let east = JobKeeper::builder()
    .registry(registry()?)
    .store(store.clone())
    .max_workers(3)
    .poll_interval(StdDuration::from_millis(100))
    .holder_id("east")
    .build()?;
  let west = JobKeeper::builder()
    .registry(registry()?)
    .store(store.clone())
    .max_workers(3)
    .poll_interval(StdDuration::from_millis(100))
    .holder_id("west")
    .build()?;

  for i in 0..10 {
    let keeper = if i % 2 == 0 { &east } else { &west };
    keeper
      .schedule(
        "resize-image",
        serde_json::json!({ "image": format!("photo-{:02}.png", i) }),
        ScheduleOptions::new(),
      )
      .await?;
  }

  tokio::time::sleep(StdDuration::from_secs(5)).await;

  let east_metrics = east.get_metrics_snapshot();
  let west_metrics = west.get_metrics_snapshot();
  info!(
    "east ran {}, west ran {}, lock-limit denials {}",
    east_metrics.jobs_succeeded,
    west_metrics.jobs_succeeded,
    east_metrics.leases_denied + west_metrics.leases_denied
  );
  info!("Instances in store: {}", east.list_instances(None).await?.len());

  east.shutdown_graceful(Some(StdDuration::from_secs(5))).await?;
  west.shutdown_graceful(Some(StdDuration::from_secs(5))).await?;
  Ok(())
}
