//! Persistence boundary for instances and uniqueness markers.
//!
//! Every mutation the engine makes after insertion goes through
//! [`JobStore::compare_and_update`]: the update is applied only if the stored
//! instance still matches the condition filter, atomically with respect to other
//! callers of the same store. Leasing, renewal and completion are all built on it.

mod memory;

pub use memory::InMemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::{InstanceId, InstanceStatus, JobData, JobInstance, Lease, UniquenessRecord};

/// Lease state a filter requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeaseFilter {
  #[default]
  Any,
  /// No lease, or a lease that expired at or before `now`.
  Free { now: DateTime<Utc> },
  /// A lease still valid at `now`.
  Held { now: DateTime<Utc> },
  /// A lease carrying exactly this token, expired or not.
  HeldBy { token: Uuid },
}

impl LeaseFilter {
  pub fn matches(&self, lease: Option<&Lease>) -> bool {
    match (self, lease) {
      (LeaseFilter::Any, _) => true,
      (LeaseFilter::Free { .. }, None) => true,
      (LeaseFilter::Free { now }, Some(lease)) => lease.is_expired(*now),
      (LeaseFilter::Held { .. }, None) => false,
      (LeaseFilter::Held { now }, Some(lease)) => !lease.is_expired(*now),
      (LeaseFilter::HeldBy { .. }, None) => false,
      (LeaseFilter::HeldBy { token }, Some(lease)) => lease.token == *token,
    }
  }
}

/// Conjunction of predicates over an instance. Unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
  pub id: Option<InstanceId>,
  pub job_name: Option<String>,
  pub status: Option<InstanceStatus>,
  /// `next_run_at <= due_before`.
  pub due_before: Option<DateTime<Utc>>,
  pub lease: LeaseFilter,
  pub uniqueness_key: Option<String>,
}

impl InstanceFilter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn id(mut self, id: InstanceId) -> Self {
    self.id = Some(id);
    self
  }

  pub fn job_name(mut self, job_name: impl Into<String>) -> Self {
    self.job_name = Some(job_name.into());
    self
  }

  pub fn status(mut self, status: InstanceStatus) -> Self {
    self.status = Some(status);
    self
  }

  pub fn due_before(mut self, at: DateTime<Utc>) -> Self {
    self.due_before = Some(at);
    self
  }

  pub fn lease(mut self, lease: LeaseFilter) -> Self {
    self.lease = lease;
    self
  }

  pub fn uniqueness_key(mut self, key: impl Into<String>) -> Self {
    self.uniqueness_key = Some(key.into());
    self
  }

  pub fn matches(&self, instance: &JobInstance) -> bool {
    self.id.map_or(true, |id| instance.id == id)
      && self
        .job_name
        .as_deref()
        .map_or(true, |name| instance.job_name == name)
      && self.status.map_or(true, |status| instance.status == status)
      && self
        .due_before
        .map_or(true, |at| instance.next_run_at <= at)
      && self.lease.matches(instance.lease.as_ref())
      && self
        .uniqueness_key
        .as_deref()
        .map_or(true, |key| instance.uniqueness_key.as_deref() == Some(key))
  }
}

/// Ordering for [`JobStore::find_instances`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstanceSort {
  /// Priority descending, then `next_run_at` ascending. Dispatch order.
  #[default]
  PriorityThenDue,
  NextRunAt,
  Unordered,
}

/// Partial update applied by [`JobStore::compare_and_update`]. `None` leaves a
/// field untouched; nested `Option`s allow clearing.
#[derive(Debug, Clone, Default)]
pub struct InstanceUpdate {
  pub lease: Option<Option<Lease>>,
  pub next_run_at: Option<DateTime<Utc>>,
  pub last_run_at: Option<DateTime<Utc>>,
  pub last_finished_at: Option<DateTime<Utc>>,
  pub fail_count: Option<u32>,
  pub fail_reason: Option<Option<String>>,
  pub status: Option<InstanceStatus>,
  pub result: Option<Option<JobData>>,
}

impl InstanceUpdate {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn lease(mut self, lease: Option<Lease>) -> Self {
    self.lease = Some(lease);
    self
  }

  pub fn next_run_at(mut self, at: DateTime<Utc>) -> Self {
    self.next_run_at = Some(at);
    self
  }

  pub fn last_run_at(mut self, at: DateTime<Utc>) -> Self {
    self.last_run_at = Some(at);
    self
  }

  pub fn last_finished_at(mut self, at: DateTime<Utc>) -> Self {
    self.last_finished_at = Some(at);
    self
  }

  pub fn fail_count(mut self, fail_count: u32) -> Self {
    self.fail_count = Some(fail_count);
    self
  }

  pub fn fail_reason(mut self, reason: Option<String>) -> Self {
    self.fail_reason = Some(reason);
    self
  }

  pub fn status(mut self, status: InstanceStatus) -> Self {
    self.status = Some(status);
    self
  }

  pub fn result(mut self, result: Option<JobData>) -> Self {
    self.result = Some(result);
    self
  }

  pub fn apply(self, instance: &mut JobInstance) {
    if let Some(lease) = self.lease {
      instance.locked_at = lease.as_ref().map(|lease| lease.acquired_at);
      instance.lease = lease;
    }
    if let Some(at) = self.next_run_at {
      instance.next_run_at = at;
    }
    if let Some(at) = self.last_run_at {
      instance.last_run_at = Some(at);
    }
    if let Some(at) = self.last_finished_at {
      instance.last_finished_at = Some(at);
    }
    if let Some(fail_count) = self.fail_count {
      instance.fail_count = fail_count;
    }
    if let Some(reason) = self.fail_reason {
      instance.fail_reason = reason;
    }
    if let Some(status) = self.status {
      instance.status = status;
    }
    if let Some(result) = self.result {
      instance.result = result;
    }
  }
}

/// Storage adapter for instances and uniqueness markers.
///
/// Implementations must make `compare_and_update` and `insert_uniqueness`
/// atomic with respect to every process sharing the store.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
  /// Persists a new instance.
  ///
  /// # Errors
  /// [`StoreError::DuplicateId`] if an instance with the same ID exists.
  async fn insert_instance(&self, instance: JobInstance) -> Result<(), StoreError>;

  /// Streams instances matching `filter` in `sort` order, at most `limit` of them.
  fn find_instances(
    &self,
    filter: InstanceFilter,
    sort: InstanceSort,
    limit: Option<usize>,
  ) -> BoxStream<'_, Result<JobInstance, StoreError>>;

  async fn count_instances(&self, filter: InstanceFilter) -> Result<usize, StoreError>;

  /// Applies `update` to instance `id` if it currently matches `condition`.
  /// Returns the updated instance, or `None` when the condition did not hold
  /// (or the instance does not exist).
  async fn compare_and_update(
    &self,
    id: InstanceId,
    condition: InstanceFilter,
    update: InstanceUpdate,
  ) -> Result<Option<JobInstance>, StoreError>;

  async fn get_instance(&self, id: InstanceId) -> Result<Option<JobInstance>, StoreError> {
    let mut found = self.find_instances(InstanceFilter::new().id(id), InstanceSort::Unordered, Some(1));
    found.try_next().await
  }

  /// Inserts a uniqueness marker. Returns `false` if the key is already claimed.
  async fn insert_uniqueness(&self, record: UniquenessRecord) -> Result<bool, StoreError>;

  async fn find_uniqueness(&self, key: &str) -> Result<Option<UniquenessRecord>, StoreError>;

  /// Swaps the marker for `replacement` only if the stored marker still equals
  /// `current`. Returns `false` when it changed (or vanished) in between.
  async fn replace_uniqueness(
    &self,
    current: &UniquenessRecord,
    replacement: UniquenessRecord,
  ) -> Result<bool, StoreError>;

  /// Binds a claimed key to the instance it guards.
  async fn bind_uniqueness(&self, key: &str, instance_id: InstanceId) -> Result<bool, StoreError>;

  /// Removes a marker. Returns `true` if one was removed.
  async fn remove_uniqueness(&self, key: &str) -> Result<bool, StoreError>;
}
