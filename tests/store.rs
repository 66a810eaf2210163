//! tests/store.rs
//! The in-memory store: filters, dispatch ordering and conditional updates

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::TryStreamExt;
use uuid::Uuid;

use jobkeeper::{
  InMemoryStore, InstanceFilter, InstanceSort, InstanceStatus, InstanceUpdate, JobInstance,
  JobStore, LeaseFilter, StoreError, UniquenessRecord,
};

fn instance(job_name: &str, priority: i32, next_run_at: DateTime<Utc>) -> JobInstance {
  JobInstance {
    id: Uuid::new_v4(),
    job_name: job_name.to_string(),
    data: serde_json::Value::Null,
    next_run_at,
    locked_at: None,
    lease: None,
    last_run_at: None,
    last_finished_at: None,
    fail_count: 0,
    fail_reason: None,
    priority,
    uniqueness_key: None,
    result: None,
    status: InstanceStatus::Pending,
    created_at: Utc::now(),
  }
}

async fn ids_in_order(store: &InMemoryStore, filter: InstanceFilter, sort: InstanceSort) -> Vec<Uuid> {
  store
    .find_instances(filter, sort, None)
    .map_ok(|instance| instance.id)
    .try_collect()
    .await
    .unwrap()
}

#[tokio::test]
async fn test_dispatch_order_is_priority_then_due() {
  let store = InMemoryStore::new();
  let now = Utc::now();
  let early_low = instance("a", 0, now - ChronoDuration::seconds(30));
  let late_high = instance("a", 10, now - ChronoDuration::seconds(1));
  let early_high = instance("a", 10, now - ChronoDuration::seconds(20));
  let future = instance("a", 100, now + ChronoDuration::hours(1));
  for i in [&early_low, &late_high, &early_high, &future] {
    store.insert_instance(i.clone()).await.unwrap();
  }

  let due = InstanceFilter::new()
    .status(InstanceStatus::Pending)
    .due_before(now)
    .lease(LeaseFilter::Free { now });
  let order = ids_in_order(&store, due, InstanceSort::PriorityThenDue).await;
  assert_eq!(order, vec![early_high.id, late_high.id, early_low.id]);

  let by_time = ids_in_order(&store, InstanceFilter::new(), InstanceSort::NextRunAt).await;
  assert_eq!(by_time, vec![early_low.id, early_high.id, late_high.id, future.id]);
}

#[tokio::test]
async fn test_updates_re_rank_instances() {
  let store = InMemoryStore::new();
  let now = Utc::now();
  let first = instance("a", 5, now - ChronoDuration::seconds(10));
  let second = instance("a", 5, now - ChronoDuration::seconds(5));
  store.insert_instance(first.clone()).await.unwrap();
  store.insert_instance(second.clone()).await.unwrap();

  // Pushing the first instance into the future moves it behind the second.
  store
    .compare_and_update(
      first.id,
      InstanceFilter::new(),
      InstanceUpdate::new().next_run_at(now + ChronoDuration::seconds(10)),
    )
    .await
    .unwrap()
    .unwrap();

  let order = ids_in_order(&store, InstanceFilter::new(), InstanceSort::PriorityThenDue).await;
  assert_eq!(order, vec![second.id, first.id]);
  let limited: Vec<JobInstance> = store
    .find_instances(InstanceFilter::new(), InstanceSort::PriorityThenDue, Some(1))
    .try_collect()
    .await
    .unwrap();
  assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn test_compare_and_update_respects_condition() -> anyhow::Result<()> {
  let store = InMemoryStore::new();
  let record = instance("a", 0, Utc::now());
  store.insert_instance(record.clone()).await?;

  let rejected = store
    .compare_and_update(
      record.id,
      InstanceFilter::new().status(InstanceStatus::Completed),
      InstanceUpdate::new().fail_count(9),
    )
    .await?;
  assert!(rejected.is_none());

  let applied = store
    .compare_and_update(
      record.id,
      InstanceFilter::new().status(InstanceStatus::Pending).job_name("a"),
      InstanceUpdate::new()
        .status(InstanceStatus::Completed)
        .result(Some(serde_json::json!({ "ok": true }))),
    )
    .await?
    .expect("condition holds");
  assert_eq!(applied.status, InstanceStatus::Completed);
  assert_eq!(applied.fail_count, 0);

  let missing = store
    .compare_and_update(Uuid::new_v4(), InstanceFilter::new(), InstanceUpdate::new())
    .await?;
  assert!(missing.is_none());

  let stored = store
    .get_instance(record.id)
    .await?
    .ok_or_else(|| anyhow::anyhow!("instance vanished"))?;
  assert_eq!(stored.result, Some(serde_json::json!({ "ok": true })));
  assert_eq!(
    store
      .count_instances(InstanceFilter::new().status(InstanceStatus::Completed))
      .await?,
    1
  );
  Ok(())
}

#[tokio::test]
async fn test_duplicate_ids_are_rejected() {
  let store = InMemoryStore::new();
  let record = instance("a", 0, Utc::now());
  store.insert_instance(record.clone()).await.unwrap();
  let again = store.insert_instance(record.clone()).await;
  assert!(matches!(again, Err(StoreError::DuplicateId(id)) if id == record.id));
}

#[tokio::test]
async fn test_uniqueness_markers() -> anyhow::Result<()> {
  let store = InMemoryStore::new();
  let marker = UniquenessRecord {
    key: "k".to_string(),
    instance_id: None,
    created_at: Utc::now(),
  };
  assert!(store.insert_uniqueness(marker.clone()).await?);
  assert!(!store.insert_uniqueness(marker).await?);

  let bound_to = Uuid::new_v4();
  assert!(store.bind_uniqueness("k", bound_to).await?);
  assert!(!store.bind_uniqueness("other", bound_to).await?);
  assert_eq!(
    store.find_uniqueness("k").await?.and_then(|record| record.instance_id),
    Some(bound_to)
  );

  assert!(store.remove_uniqueness("k").await?);
  assert!(store.find_uniqueness("k").await?.is_none());
  Ok(())
}
