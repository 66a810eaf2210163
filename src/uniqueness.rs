use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::job::{InstanceId, UniquenessRecord};
use crate::store::JobStore;

/// Key prefix reserving the single live instance of a recurrent job.
pub(crate) const RECURRENT_KEY_PREFIX: &str = "recurrent:";

pub(crate) fn recurrent_key(job_name: &str) -> String {
  format!("{}{}", RECURRENT_KEY_PREFIX, job_name)
}

/// Keys in the recurrent namespace are managed by the engine only.
pub(crate) fn is_reserved_key(key: &str) -> bool {
  key.starts_with(RECURRENT_KEY_PREFIX)
}

/// Claims uniqueness keys so that at most one instance is ever scheduled per key.
///
/// Markers are never removed automatically; call [`release`](Self::release)
/// to allow a key to be scheduled again.
#[derive(Clone)]
pub struct UniquenessGuard {
  store: Arc<dyn JobStore>,
}

impl UniquenessGuard {
  pub fn new(store: Arc<dyn JobStore>) -> Self {
    Self { store }
  }

  /// Atomically claims `key`. Returns `false` if it is already claimed.
  pub async fn claim(&self, key: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
    let claimed = self
      .store
      .insert_uniqueness(UniquenessRecord {
        key: key.to_string(),
        instance_id: None,
        created_at: now,
      })
      .await?;
    debug!(key, claimed, "Uniqueness claim attempted.");
    Ok(claimed)
  }

  /// Re-claims `key` from a marker left behind by a caller that never finished
  /// scheduling. Fails if anyone touched the marker since `stale` was read.
  pub async fn take_over(&self, stale: &UniquenessRecord, now: DateTime<Utc>) -> Result<bool, StoreError> {
    let replacement = UniquenessRecord {
      key: stale.key.clone(),
      instance_id: None,
      created_at: now,
    };
    let taken = self.store.replace_uniqueness(stale, replacement).await?;
    debug!(key = %stale.key, taken, "Uniqueness takeover attempted.");
    Ok(taken)
  }

  /// Records which instance a claimed key guards.
  pub async fn bind(&self, key: &str, instance_id: InstanceId) -> Result<(), StoreError> {
    if !self.store.bind_uniqueness(key, instance_id).await? {
      warn!(key, %instance_id, "Uniqueness marker vanished before it could be bound.");
    }
    Ok(())
  }

  pub async fn release(&self, key: &str) -> Result<bool, StoreError> {
    self.store.remove_uniqueness(key).await
  }

  pub async fn lookup(&self, key: &str) -> Result<Option<UniquenessRecord>, StoreError> {
    self.store.find_uniqueness(key).await
  }
}
