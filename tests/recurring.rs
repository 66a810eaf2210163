//! tests/recurring.rs
//! Recurrent jobs: seeding, spacing, custom next-run functions and failure handling

mod common;

use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc,
};
use std::time::{Duration as StdDuration, Instant};

use crate::common::{
  build_keeper, build_keeper_on, count_in_store, run_counter_result, setup_tracing, wait_until,
};
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;

use jobkeeper::{
  run_fn, InMemoryStore, InstanceStatus, JobDefinition, JobInstance, JobKind, JobRegistry, JobStore,
  RunEvery, ScheduleError, ScheduleOptions, ScheduleOutcome, UniquenessRecord,
};

#[tokio::test]
async fn test_interval_job_runs_repeatedly_with_spacing() {
  setup_tracing();
  let starts = Arc::new(Mutex::new(Vec::<Instant>::new()));
  let starts_in_job = starts.clone();
  let mut registry = JobRegistry::new();
  registry
    .register(
      "tick",
      JobDefinition::from_boxed(
        JobKind::Recurrent,
        run_fn! {
          { let starts = starts_in_job.clone(); }
          |_data, _info| {
            starts.lock().push(Instant::now());
            Ok(serde_json::Value::Null)
          }
        },
      )
      .run_every(StdDuration::from_millis(200)),
    )
    .unwrap();
  let keeper = build_keeper(registry, 2).unwrap();

  // No schedule call needed: the dispatcher seeds recurrent jobs.
  assert!(wait_until(StdDuration::from_secs(3), || async { starts.lock().len() >= 4 }).await);

  let recorded = starts.lock().clone();
  for pair in recorded.windows(2) {
    let gap = pair[1].duration_since(pair[0]);
    assert!(gap >= StdDuration::from_millis(180), "Runs too close together: {:?}", gap);
  }

  assert_eq!(count_in_store(&keeper.store(), "tick").await, 1, "One live instance per recurrent job");
  let instances = keeper.list_instances(Some("tick")).await.unwrap();
  let instance = &instances[0];
  assert_eq!(instance.status, InstanceStatus::Pending);
  assert_eq!(instance.uniqueness_key.as_deref(), Some("recurrent:tick"));

  keeper.shutdown_graceful(Some(StdDuration::from_secs(2))).await.unwrap();
}

#[tokio::test]
async fn test_schedule_of_recurrent_job_returns_live_instance() {
  setup_tracing();
  let counter = Arc::new(AtomicUsize::new(0));
  let mut registry = JobRegistry::new();
  registry
    .register(
      "hourly",
      JobDefinition::from_boxed(
        JobKind::Recurrent,
        run_counter_result(counter.clone(), StdDuration::ZERO, true),
      )
      .run_every(StdDuration::from_secs(3600)),
    )
    .unwrap();
  let keeper = build_keeper(registry, 0).unwrap();

  let first = keeper
    .schedule("hourly", serde_json::json!({ "ignored": true }), ScheduleOptions::new())
    .await
    .unwrap();
  let second = keeper
    .schedule("hourly", serde_json::Value::Null, ScheduleOptions::new().unique("ignored"))
    .await
    .unwrap();

  let (a, b) = match (&first, &second) {
    (ScheduleOutcome::Recurring(a), ScheduleOutcome::Recurring(b)) => (a, b),
    other => panic!("expected Recurring outcomes, got {:?}", other),
  };
  assert_eq!(a.instance_id, b.instance_id);
  assert_eq!(count_in_store(&keeper.store(), "hourly").await, 1);

  // Options are ignored for recurrent jobs, so no marker for "ignored".
  assert!(keeper.store().find_uniqueness("ignored").await.unwrap().is_none());

  keeper.shutdown_graceful(None).await.unwrap();
}

#[tokio::test]
async fn test_failing_recurrent_job_keeps_recurring() {
  setup_tracing();
  let counter = Arc::new(AtomicUsize::new(0));
  let mut registry = JobRegistry::new();
  registry
    .register(
      "always-broken",
      JobDefinition::from_boxed(
        JobKind::Recurrent,
        run_counter_result(counter.clone(), StdDuration::ZERO, false),
      )
      .run_every(StdDuration::from_millis(100)),
    )
    .unwrap();
  let keeper = build_keeper(registry, 1).unwrap();

  assert!(wait_until(StdDuration::from_secs(3), || async { counter.load(Ordering::SeqCst) >= 3 }).await);

  let instance = keeper
    .list_instances(Some("always-broken"))
    .await
    .unwrap()
    .into_iter()
    .next()
    .unwrap();
  assert_eq!(instance.status, InstanceStatus::Pending, "Recurrent jobs never become Failed");
  assert!(instance.fail_count >= 2);
  assert!(instance.fail_reason.is_some());

  let metrics = keeper.get_metrics_snapshot();
  assert_eq!(metrics.jobs_permanently_failed, 0);
  assert_eq!(metrics.jobs_retried, 0);

  keeper.shutdown_graceful(None).await.unwrap();
}

#[tokio::test]
async fn test_get_next_run_drives_recurrence() {
  setup_tracing();
  let counter = Arc::new(AtomicUsize::new(0));
  let mut registry = JobRegistry::new();
  registry
    .register(
      "custom",
      JobDefinition::from_boxed(
        JobKind::Recurrent,
        run_counter_result(counter.clone(), StdDuration::ZERO, true),
      )
      .get_next_run(|| Utc::now() + ChronoDuration::milliseconds(150))
      // Ignored in favour of get_next_run.
      .run_every(StdDuration::from_secs(3600)),
    )
    .unwrap();
  let keeper = build_keeper(registry, 1).unwrap();

  assert!(wait_until(StdDuration::from_secs(3), || async { counter.load(Ordering::SeqCst) >= 3 }).await);
  keeper.shutdown_graceful(None).await.unwrap();
}

#[tokio::test]
async fn test_recurrent_success_resets_fail_count() {
  setup_tracing();
  let attempts = Arc::new(AtomicUsize::new(0));
  let attempts_in_job = attempts.clone();
  let mut registry = JobRegistry::new();
  registry
    .register(
      "recovering",
      JobDefinition::from_boxed(
        JobKind::Recurrent,
        run_fn! {
          { let attempts = attempts_in_job.clone(); }
          |_data, _info| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt == 1 {
              Err("warming up".into())
            } else {
              Ok(serde_json::Value::Null)
            }
          }
        },
      )
      .run_every(StdDuration::from_millis(100)),
    )
    .unwrap();
  let keeper = build_keeper(registry, 1).unwrap();

  assert!(wait_until(StdDuration::from_secs(3), || async { attempts.load(Ordering::SeqCst) >= 3 }).await);
  assert!(
    wait_until(StdDuration::from_secs(1), || async {
      keeper
        .list_instances(Some("recovering"))
        .await
        .map(|instances| instances.iter().all(|i| i.fail_count == 0 && i.fail_reason.is_none()))
        .unwrap_or(false)
    })
    .await
  );

  keeper.shutdown_graceful(None).await.unwrap();
}

#[cfg(feature = "cron_schedule")]
#[tokio::test]
async fn test_cron_job_runs_each_second() {
  setup_tracing();
  let counter = Arc::new(AtomicUsize::new(0));
  let mut registry = JobRegistry::new();
  registry
    .register(
      "every-second",
      JobDefinition::from_boxed(
        JobKind::Recurrent,
        run_counter_result(counter.clone(), StdDuration::ZERO, true),
      )
      .run_every(RunEvery::from_expression("* * * * * *")),
    )
    .unwrap();
  let keeper = build_keeper(registry, 1).unwrap();

  assert!(wait_until(StdDuration::from_secs(4), || async { counter.load(Ordering::SeqCst) >= 2 }).await);
  let instances = keeper.list_instances(Some("every-second")).await.unwrap();
  let instance = &instances[0];
  assert_eq!(instance.next_run_at.timestamp_subsec_nanos(), 0, "Cron occurrences fall on whole seconds");

  keeper.shutdown_graceful(None).await.unwrap();
}

#[test]
fn test_invalid_recurrent_definitions_are_rejected() {
  let mut registry = JobRegistry::new();
  let no_rule = registry.register(
    "no-rule",
    JobDefinition::recurrent(|_, _| async { Ok(serde_json::Value::Null) }),
  );
  assert!(no_rule.is_err());

  let zero = registry.register(
    "zero",
    JobDefinition::recurrent(|_, _| async { Ok(serde_json::Value::Null) })
      .run_every(StdDuration::ZERO),
  );
  assert!(zero.is_err());
  assert!(registry.is_empty());
}

fn ticking_registry(counter: Arc<AtomicUsize>) -> JobRegistry {
  let mut registry = JobRegistry::new();
  registry
    .register(
      "tick",
      JobDefinition::from_boxed(
        JobKind::Recurrent,
        run_counter_result(counter, StdDuration::ZERO, true),
      )
      .run_every(StdDuration::from_millis(100)),
    )
    .unwrap();
  registry
}

#[tokio::test]
async fn test_orphaned_recurrent_marker_is_taken_over() {
  setup_tracing();
  let store = Arc::new(InMemoryStore::new());
  // Left by a process that died between claiming the key and inserting.
  store
    .insert_uniqueness(UniquenessRecord {
      key: "recurrent:tick".to_string(),
      instance_id: None,
      created_at: Utc::now() - ChronoDuration::minutes(30),
    })
    .await
    .unwrap();

  let counter = Arc::new(AtomicUsize::new(0));
  let keeper = build_keeper_on(ticking_registry(counter.clone()), store.clone(), 1, "survivor").unwrap();

  assert!(
    wait_until(StdDuration::from_secs(3), || async { counter.load(Ordering::SeqCst) >= 1 }).await,
    "The recurrent job should run after its orphaned marker is taken over"
  );

  let instances = keeper.list_instances(Some("tick")).await.unwrap();
  assert_eq!(instances.len(), 1);
  let marker = store.find_uniqueness("recurrent:tick").await.unwrap().unwrap();
  assert_eq!(marker.instance_id, Some(instances[0].id));

  keeper.shutdown_graceful(Some(StdDuration::from_secs(2))).await.unwrap();
}

#[tokio::test]
async fn test_fresh_unbound_marker_is_left_to_its_claimer() {
  setup_tracing();
  let store = Arc::new(InMemoryStore::new());
  let claimed = UniquenessRecord {
    key: "recurrent:tick".to_string(),
    instance_id: None,
    created_at: Utc::now(),
  };
  store.insert_uniqueness(claimed.clone()).await.unwrap();

  let counter = Arc::new(AtomicUsize::new(0));
  let keeper = build_keeper_on(ticking_registry(counter.clone()), store.clone(), 0, "patient").unwrap();

  let outcome = keeper
    .schedule("tick", serde_json::Value::Null, ScheduleOptions::new())
    .await;
  assert!(matches!(outcome, Err(ScheduleError::Store(_))), "got {:?}", outcome);
  assert_eq!(store.find_uniqueness("recurrent:tick").await.unwrap(), Some(claimed));
  assert_eq!(count_in_store(&keeper.store(), "tick").await, 0);

  keeper.shutdown_graceful(None).await.unwrap();
}

#[tokio::test]
async fn test_marker_bound_to_another_job_is_reclaimed() {
  setup_tracing();
  let store = Arc::new(InMemoryStore::new());
  let now = Utc::now();
  let foreign = JobInstance {
    id: uuid::Uuid::new_v4(),
    job_name: "report".to_string(),
    data: serde_json::Value::Null,
    next_run_at: now + ChronoDuration::hours(1),
    locked_at: None,
    lease: None,
    last_run_at: None,
    last_finished_at: None,
    fail_count: 0,
    fail_reason: None,
    priority: 0,
    uniqueness_key: Some("recurrent:tick".to_string()),
    result: None,
    status: InstanceStatus::Pending,
    created_at: now,
  };
  store.insert_instance(foreign.clone()).await.unwrap();
  store
    .insert_uniqueness(UniquenessRecord {
      key: "recurrent:tick".to_string(),
      instance_id: Some(foreign.id),
      created_at: now,
    })
    .await
    .unwrap();

  let counter = Arc::new(AtomicUsize::new(0));
  let keeper = build_keeper_on(ticking_registry(counter.clone()), store.clone(), 0, "owner").unwrap();

  let outcome = keeper
    .schedule("tick", serde_json::Value::Null, ScheduleOptions::new())
    .await
    .unwrap();
  let tick_id = outcome.instance_id().unwrap();
  assert_ne!(tick_id, foreign.id);
  assert_eq!(keeper.get_instance(tick_id).await.unwrap().job_name, "tick");
  assert_eq!(count_in_store(&keeper.store(), "tick").await, 1);
  assert_eq!(keeper.get_instance(foreign.id).await.unwrap(), foreign);

  keeper.shutdown_graceful(None).await.unwrap();
}
