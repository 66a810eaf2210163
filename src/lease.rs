//! Time-bounded exclusive claims on instances.
//!
//! A lease is granted by a single conditional update: the instance must still be
//! pending and either unleased or carrying an expired lease. Renewal and release
//! are conditioned on the lease token, so a holder whose lease was reclaimed
//! can never overwrite the new holder's state.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};

use crate::error::LeaseError;
use crate::job::{InstanceId, InstanceStatus, JobInstance, Lease};
use crate::metrics::SchedulerMetrics;
use crate::store::{InstanceFilter, InstanceUpdate, JobStore, LeaseFilter};

/// Per-job lease parameters, taken from the job definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
  /// Max simultaneously held leases for the job across every holder.
  pub lock_limit: Option<usize>,
  pub lock_lifetime: StdDuration,
}

/// Grants, renews and releases leases on behalf of one holder (process).
#[derive(Clone)]
pub struct LeaseManager {
  store: Arc<dyn JobStore>,
  holder_id: String,
  metrics: SchedulerMetrics,
}

impl LeaseManager {
  pub fn new(store: Arc<dyn JobStore>, holder_id: impl Into<String>, metrics: SchedulerMetrics) -> Self {
    Self {
      store,
      holder_id: holder_id.into(),
      metrics,
    }
  }

  pub fn holder_id(&self) -> &str {
    &self.holder_id
  }

  /// Attempts to lease `instance` at `now`.
  ///
  /// With a lock limit the live leases of the job are counted before the grant
  /// and again after it. A grant that finds the job over its limit is handed
  /// back, so two holders racing for the last slot may both back off, but the
  /// limit is never exceeded.
  ///
  /// # Errors
  ///
  /// - [`LeaseError::LockLimitReached`] if the job already holds `lock_limit` leases.
  /// - [`LeaseError::Contended`] if someone else holds a live lease or the instance
  ///   is no longer pending.
  /// - [`LeaseError::Store`] on backend failure.
  pub async fn try_acquire(
    &self,
    instance: &JobInstance,
    policy: LeasePolicy,
    now: DateTime<Utc>,
  ) -> Result<Lease, LeaseError> {
    if let Some(limit) = policy.lock_limit {
      let held = self.count_held(&instance.job_name, now).await?;
      if held >= limit {
        trace!(job_name = %instance.job_name, held, limit, "Lock limit reached.");
        return Err(self.limit_reached(&instance.job_name, limit));
      }
    }

    let lease = Lease::grant(&self.holder_id, now, policy.lock_lifetime);
    let condition = InstanceFilter::new()
      .status(InstanceStatus::Pending)
      .lease(LeaseFilter::Free { now });
    let granted = self
      .store
      .compare_and_update(
        instance.id,
        condition,
        InstanceUpdate::new().lease(Some(lease.clone())),
      )
      .await?;

    if granted.is_none() {
      debug!(instance_id = %instance.id, job_name = %instance.job_name, "Lease contended.");
      SchedulerMetrics::incr(&self.metrics.leases_denied);
      return Err(LeaseError::Contended(instance.id));
    }

    if let Some(limit) = policy.lock_limit {
      let held = self.count_held(&instance.job_name, now).await?;
      if held > limit {
        debug!(instance_id = %instance.id, held, limit, "Lock limit overrun after grant, backing off.");
        self
          .store
          .compare_and_update(
            instance.id,
            InstanceFilter::new().lease(LeaseFilter::HeldBy { token: lease.token }),
            InstanceUpdate::new().lease(None),
          )
          .await?;
        return Err(self.limit_reached(&instance.job_name, limit));
      }
    }

    if let Some(previous) = &instance.lease {
      info!(
        instance_id = %instance.id,
        job_name = %instance.job_name,
        previous_holder = %previous.holder_id,
        expired_at = %previous.expires_at,
        "Reclaimed expired lease."
      );
      SchedulerMetrics::incr(&self.metrics.leases_reclaimed);
    }
    SchedulerMetrics::incr(&self.metrics.leases_granted);
    trace!(instance_id = %instance.id, token = %lease.token, expires_at = %lease.expires_at, "Lease granted.");
    Ok(lease)
  }

  async fn count_held(&self, job_name: &str, now: DateTime<Utc>) -> Result<usize, LeaseError> {
    let held = self
      .store
      .count_instances(
        InstanceFilter::new()
          .job_name(job_name)
          .status(InstanceStatus::Pending)
          .lease(LeaseFilter::Held { now }),
      )
      .await?;
    Ok(held)
  }

  fn limit_reached(&self, job_name: &str, limit: usize) -> LeaseError {
    SchedulerMetrics::incr(&self.metrics.leases_denied);
    LeaseError::LockLimitReached {
      job_name: job_name.to_string(),
      limit,
    }
  }

  /// Extends a lease this holder owns to `now + lifetime`.
  ///
  /// # Errors
  /// [`LeaseError::LeaseLost`] if the token no longer matches.
  pub async fn renew(
    &self,
    id: InstanceId,
    lease: &Lease,
    lifetime: StdDuration,
    now: DateTime<Utc>,
  ) -> Result<Lease, LeaseError> {
    let renewed = lease.extended(now, lifetime);
    let updated = self
      .store
      .compare_and_update(
        id,
        InstanceFilter::new().lease(LeaseFilter::HeldBy { token: lease.token }),
        InstanceUpdate::new().lease(Some(renewed.clone())),
      )
      .await?;
    match updated {
      Some(_) => {
        trace!(instance_id = %id, expires_at = %renewed.expires_at, "Lease renewed.");
        Ok(renewed)
      }
      None => {
        warn!(instance_id = %id, token = %lease.token, "Lease lost before renewal.");
        SchedulerMetrics::incr(&self.metrics.leases_lost);
        Err(LeaseError::LeaseLost(id))
      }
    }
  }

  /// Applies `update` only while `lease` is still the one on the instance.
  ///
  /// # Errors
  /// [`LeaseError::LeaseLost`] if the token no longer matches; the update is dropped.
  pub async fn update_held(
    &self,
    id: InstanceId,
    lease: &Lease,
    update: InstanceUpdate,
  ) -> Result<JobInstance, LeaseError> {
    let updated = self
      .store
      .compare_and_update(
        id,
        InstanceFilter::new().lease(LeaseFilter::HeldBy { token: lease.token }),
        update,
      )
      .await?;
    updated.ok_or_else(|| {
      SchedulerMetrics::incr(&self.metrics.leases_lost);
      LeaseError::LeaseLost(id)
    })
  }

  /// Applies `update` together with clearing the lease, if the lease is still ours.
  ///
  /// # Errors
  /// [`LeaseError::LeaseLost`] if the token no longer matches; the update is dropped.
  pub async fn release_with(
    &self,
    id: InstanceId,
    lease: &Lease,
    update: InstanceUpdate,
  ) -> Result<JobInstance, LeaseError> {
    self.update_held(id, lease, update.lease(None)).await
  }

  /// Releases a lease without touching anything else.
  pub async fn release(&self, id: InstanceId, lease: &Lease) -> Result<(), LeaseError> {
    self.release_with(id, lease, InstanceUpdate::new()).await.map(|_| ())
  }
}
