use std::cmp::Reverse;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use priority_queue::PriorityQueue;
use tracing::trace;

use super::{InstanceFilter, InstanceSort, InstanceUpdate, JobStore};
use crate::error::StoreError;
use crate::job::{InstanceId, InstanceStatus, JobInstance, UniquenessRecord};

/// Dispatch rank: higher priority first, then earliest `next_run_at`.
type DispatchRank = (i32, Reverse<DateTime<Utc>>);

#[derive(Default)]
struct Collections {
  instances: HashMap<InstanceId, JobInstance>,
  /// Pending instances only, ranked for dispatch. Terminal ones leave the index.
  dispatch_order: PriorityQueue<InstanceId, DispatchRank>,
  uniqueness: HashMap<String, UniquenessRecord>,
}

fn rank_of(instance: &JobInstance) -> DispatchRank {
  (instance.priority, Reverse(instance.next_run_at))
}

impl Collections {
  /// Keeps `dispatch_order` in step with the instance's status and rank.
  fn reindex(&mut self, instance: &JobInstance) {
    if instance.status == InstanceStatus::Pending {
      self.dispatch_order.push(instance.id, rank_of(instance));
    } else {
      self.dispatch_order.remove(&instance.id);
    }
  }

  /// Instances a filter can match. Filters on `Pending` only walk the index.
  fn candidates<'a>(&'a self, filter: &'a InstanceFilter) -> Box<dyn Iterator<Item = &'a JobInstance> + 'a> {
    if let Some(id) = filter.id {
      return Box::new(self.instances.get(&id).into_iter());
    }
    if filter.status == Some(InstanceStatus::Pending) {
      Box::new(
        self
          .dispatch_order
          .iter()
          .filter_map(|(id, _)| self.instances.get(id)),
      )
    } else {
      Box::new(self.instances.values())
    }
  }
}

/// The `limit` smallest entries by `key`, in order. Only that prefix is sorted.
fn top_by_key<K: Ord>(
  mut items: Vec<&JobInstance>,
  limit: usize,
  key: impl Fn(&JobInstance) -> K,
) -> Vec<JobInstance> {
  if limit == 0 {
    return Vec::new();
  }
  if items.len() > limit {
    items.select_nth_unstable_by_key(limit - 1, |instance| key(*instance));
    items.truncate(limit);
  }
  items.sort_unstable_by_key(|instance| key(*instance));
  items.into_iter().cloned().collect()
}

/// Process-local [`JobStore`]. Share one `Arc<InMemoryStore>` between several
/// engines to simulate multiple processes against a single backend.
#[derive(Default)]
pub struct InMemoryStore {
  inner: Mutex<Collections>,
}

impl std::fmt::Debug for InMemoryStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let collections = self.inner.lock();
    f.debug_struct("InMemoryStore")
      .field("instances", &collections.instances.len())
      .field("uniqueness_markers", &collections.uniqueness.len())
      .finish()
  }
}

impl InMemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn collect_matching(
    &self,
    filter: &InstanceFilter,
    sort: InstanceSort,
    limit: Option<usize>,
  ) -> Vec<JobInstance> {
    let collections = self.inner.lock();
    let limit = limit.unwrap_or(usize::MAX);

    let matching = collections
      .candidates(filter)
      .filter(|instance| filter.matches(instance));

    match sort {
      InstanceSort::PriorityThenDue => {
        top_by_key(matching.collect(), limit, |instance| Reverse(rank_of(instance)))
      }
      InstanceSort::NextRunAt => top_by_key(matching.collect(), limit, |instance| instance.next_run_at),
      InstanceSort::Unordered => matching.take(limit).cloned().collect(),
    }
  }
}

#[async_trait]
impl JobStore for InMemoryStore {
  async fn insert_instance(&self, instance: JobInstance) -> Result<(), StoreError> {
    let mut collections = self.inner.lock();
    if collections.instances.contains_key(&instance.id) {
      return Err(StoreError::DuplicateId(instance.id));
    }
    collections.reindex(&instance);
    collections.instances.insert(instance.id, instance);
    Ok(())
  }

  fn find_instances(
    &self,
    filter: InstanceFilter,
    sort: InstanceSort,
    limit: Option<usize>,
  ) -> BoxStream<'_, Result<JobInstance, StoreError>> {
    let matching = self.collect_matching(&filter, sort, limit);
    stream::iter(matching.into_iter().map(Ok)).boxed()
  }

  async fn count_instances(&self, filter: InstanceFilter) -> Result<usize, StoreError> {
    let collections = self.inner.lock();
    Ok(
      collections
        .candidates(&filter)
        .filter(|instance| filter.matches(instance))
        .count(),
    )
  }

  async fn compare_and_update(
    &self,
    id: InstanceId,
    condition: InstanceFilter,
    update: InstanceUpdate,
  ) -> Result<Option<JobInstance>, StoreError> {
    let mut collections = self.inner.lock();
    let Some(instance) = collections.instances.get_mut(&id) else {
      return Ok(None);
    };
    if !condition.matches(instance) {
      trace!(instance_id = %id, "Conditional update rejected.");
      return Ok(None);
    }
    update.apply(instance);
    let updated = instance.clone();
    collections.reindex(&updated);
    Ok(Some(updated))
  }

  async fn insert_uniqueness(&self, record: UniquenessRecord) -> Result<bool, StoreError> {
    let mut collections = self.inner.lock();
    if collections.uniqueness.contains_key(&record.key) {
      return Ok(false);
    }
    collections.uniqueness.insert(record.key.clone(), record);
    Ok(true)
  }

  async fn find_uniqueness(&self, key: &str) -> Result<Option<UniquenessRecord>, StoreError> {
    Ok(self.inner.lock().uniqueness.get(key).cloned())
  }

  async fn replace_uniqueness(
    &self,
    current: &UniquenessRecord,
    replacement: UniquenessRecord,
  ) -> Result<bool, StoreError> {
    if replacement.key != current.key {
      return Ok(false);
    }
    let mut collections = self.inner.lock();
    match collections.uniqueness.get_mut(&current.key) {
      Some(record) if record == current => {
        *record = replacement;
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  async fn bind_uniqueness(&self, key: &str, instance_id: InstanceId) -> Result<bool, StoreError> {
    let mut collections = self.inner.lock();
    match collections.uniqueness.get_mut(key) {
      Some(record) => {
        record.instance_id = Some(instance_id);
        Ok(true)
      }
      None => Ok(false),
    }
  }

  async fn remove_uniqueness(&self, key: &str) -> Result<bool, StoreError> {
    Ok(self.inner.lock().uniqueness.remove(key).is_some())
  }
}
