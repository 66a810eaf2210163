//! tests/concurrency.rs
//! Per-job concurrency, the engine-wide worker limit and store-wide lock limits

mod common;

use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc,
};
use std::time::Duration as StdDuration;

use crate::common::{
  build_keeper, build_keeper_on, run_concurrency_tracker, setup_tracing, wait_until,
};

use jobkeeper::{InMemoryStore, InstanceStatus, JobDefinition, JobKind, JobRegistry, ScheduleOptions};

struct Tracker {
  active: Arc<AtomicUsize>,
  max_observed: Arc<AtomicUsize>,
  finished: Arc<AtomicUsize>,
}

impl Tracker {
  fn new() -> Self {
    Self {
      active: Arc::new(AtomicUsize::new(0)),
      max_observed: Arc::new(AtomicUsize::new(0)),
      finished: Arc::new(AtomicUsize::new(0)),
    }
  }

  fn definition(&self, delay: StdDuration) -> JobDefinition {
    let finished = self.finished.clone();
    let inner = run_concurrency_tracker(self.active.clone(), self.max_observed.clone(), delay);
    JobDefinition::single(move |data, info| {
      let fut = inner(data, info);
      let finished = finished.clone();
      async move {
        let result = fut.await;
        finished.fetch_add(1, Ordering::SeqCst);
        result
      }
    })
  }
}

#[tokio::test]
async fn test_concurrency_limit_per_job() {
  setup_tracing();
  let tracker = Tracker::new();
  let mut registry = JobRegistry::new();
  registry
    .register("limited", tracker.definition(StdDuration::from_millis(600)).concurrency(2))
    .unwrap();
  let keeper = build_keeper(registry, 5).unwrap();

  for _ in 0..5 {
    keeper
      .schedule("limited", serde_json::Value::Null, ScheduleOptions::new())
      .await
      .unwrap();
  }

  // While the first two run, the other three are left alone, not leased.
  assert!(wait_until(StdDuration::from_secs(2), || async { tracker.active.load(Ordering::SeqCst) == 2 }).await);
  let instances = keeper.list_instances(Some("limited")).await.unwrap();
  let leased = instances.iter().filter(|instance| instance.lease.is_some()).count();
  let unleased = instances.iter().filter(|instance| instance.lease.is_none()).count();
  assert_eq!((leased, unleased), (2, 3), "Only `concurrency` instances may be leased");

  assert!(wait_until(StdDuration::from_secs(8), || async { tracker.finished.load(Ordering::SeqCst) == 5 }).await);
  assert_eq!(tracker.max_observed.load(Ordering::SeqCst), 2, "Exactly 2 runs should overlap");

  keeper.shutdown_graceful(None).await.unwrap();
}

#[tokio::test]
async fn test_max_workers_caps_all_jobs() {
  setup_tracing();
  let tracker = Tracker::new();
  let mut registry = JobRegistry::new();
  // Same counters behind two names: the worker pool is the only shared limit.
  registry
    .register("left", tracker.definition(StdDuration::from_millis(150)).concurrency(10))
    .unwrap();
  registry
    .register("right", tracker.definition(StdDuration::from_millis(150)).concurrency(10))
    .unwrap();
  let keeper = build_keeper(registry, 2).unwrap();

  for i in 0..6 {
    let name = if i % 2 == 0 { "left" } else { "right" };
    keeper
      .schedule(name, serde_json::Value::Null, ScheduleOptions::new())
      .await
      .unwrap();
  }

  assert!(wait_until(StdDuration::from_secs(5), || async { tracker.finished.load(Ordering::SeqCst) == 6 }).await);
  assert!(tracker.max_observed.load(Ordering::SeqCst) <= 2);
  assert!(keeper.get_metrics_snapshot().workers_active_current <= 2);

  keeper.shutdown_graceful(None).await.unwrap();
}

#[tokio::test]
async fn test_lock_limit_holds_across_engines() {
  setup_tracing();
  let tracker = Tracker::new();
  let store = Arc::new(InMemoryStore::new());

  let registry_for = |tracker: &Tracker| {
    let mut registry = JobRegistry::new();
    registry
      .register(
        "exclusive",
        tracker.definition(StdDuration::from_millis(100)).lock_limit(1),
      )
      .unwrap();
    registry
  };
  let first = build_keeper_on(registry_for(&tracker), store.clone(), 4, "engine-1").unwrap();
  let second = build_keeper_on(registry_for(&tracker), store.clone(), 4, "engine-2").unwrap();

  let mut ids = Vec::new();
  for _ in 0..4 {
    let outcome = first
      .schedule("exclusive", serde_json::Value::Null, ScheduleOptions::new())
      .await
      .unwrap();
    ids.push(outcome.instance_id().unwrap());
  }

  assert!(wait_until(StdDuration::from_secs(6), || async { tracker.finished.load(Ordering::SeqCst) == 4 }).await);
  assert_eq!(tracker.max_observed.load(Ordering::SeqCst), 1, "lock_limit 1 means strictly one at a time");

  for id in ids {
    let instance = second.get_instance(id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
  }

  first.shutdown_graceful(None).await.unwrap();
  second.shutdown_graceful(None).await.unwrap();
}

#[tokio::test]
async fn test_boxed_definition_respects_concurrency_one() {
  setup_tracing();
  let active = Arc::new(AtomicUsize::new(0));
  let max_observed = Arc::new(AtomicUsize::new(0));
  let mut registry = JobRegistry::new();
  registry
    .register(
      "serial",
      JobDefinition::from_boxed(
        JobKind::Single,
        run_concurrency_tracker(active.clone(), max_observed.clone(), StdDuration::from_millis(50)),
      )
      .concurrency(1),
    )
    .unwrap();
  let keeper = build_keeper(registry, 4).unwrap();

  let mut ids = Vec::new();
  for _ in 0..4 {
    ids.push(
      keeper
        .schedule("serial", serde_json::Value::Null, ScheduleOptions::new())
        .await
        .unwrap()
        .instance_id()
        .unwrap(),
    );
  }

  assert!(
    wait_until(StdDuration::from_secs(5), || async {
      keeper
        .list_instances(Some("serial"))
        .await
        .map(|all| all.iter().all(|i| i.status == InstanceStatus::Completed))
        .unwrap_or(false)
    })
    .await
  );
  assert_eq!(max_observed.load(Ordering::SeqCst), 1);
  assert_eq!(keeper.get_metrics_snapshot().jobs_succeeded, 4);

  keeper.shutdown_graceful(None).await.unwrap();
}
