use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::job::{run_at, InstanceStatus, JobDefinition, JobInstance};
use crate::metrics::SchedulerMetrics;
use crate::store::InstanceUpdate;

/// Delay before a failed single job becomes due again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RetryBackoff {
  /// Due again right away.
  #[default]
  Immediate,
  Fixed(StdDuration),
  /// `base * factor^(attempt - 1)`, capped at `max_delay`.
  Exponential {
    base: StdDuration,
    factor: u32,
    max_delay: StdDuration,
  },
}

impl RetryBackoff {
  /// Delay before retry number `attempt` (1-based).
  pub fn delay_for(&self, attempt: u32) -> StdDuration {
    match *self {
      RetryBackoff::Immediate => StdDuration::ZERO,
      RetryBackoff::Fixed(delay) => delay,
      RetryBackoff::Exponential {
        base,
        factor,
        max_delay,
      } => {
        let exponent = attempt.saturating_sub(1);
        let multiplier = factor.checked_pow(exponent).unwrap_or(u32::MAX);
        base.checked_mul(multiplier).unwrap_or(max_delay).min(max_delay)
      }
    }
  }
}

/// What happens to an instance after a failed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
  /// Single job with retries left.
  Retry {
    fail_count: u32,
    next_run_at: DateTime<Utc>,
  },
  /// Single job out of retries; the instance becomes `Failed`.
  Exhausted { fail_count: u32 },
  /// Recurrent job: failure recorded, next regular occurrence scheduled.
  /// `None` when the rule has no further occurrence.
  Recur {
    fail_count: u32,
    next_run_at: Option<DateTime<Utc>>,
  },
}

impl RetryDecision {
  pub fn fail_count(&self) -> u32 {
    match self {
      RetryDecision::Retry { fail_count, .. }
      | RetryDecision::Exhausted { fail_count }
      | RetryDecision::Recur { fail_count, .. } => *fail_count,
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      RetryDecision::Exhausted { .. } | RetryDecision::Recur { next_run_at: None, .. }
    )
  }

  /// The store update recording this decision (the lease is cleared by the caller).
  pub(crate) fn to_update(&self, reason: &str, now: DateTime<Utc>) -> InstanceUpdate {
    let update = InstanceUpdate::new()
      .fail_count(self.fail_count())
      .fail_reason(Some(reason.to_string()))
      .last_finished_at(now);
    match *self {
      RetryDecision::Retry { next_run_at, .. } => update.next_run_at(next_run_at),
      RetryDecision::Exhausted { .. } => update.status(InstanceStatus::Failed),
      RetryDecision::Recur {
        next_run_at: Some(next_run_at),
        ..
      } => update.next_run_at(next_run_at),
      RetryDecision::Recur { next_run_at: None, .. } => update.status(InstanceStatus::Completed),
    }
  }
}

/// Decides between another attempt and terminal failure.
#[derive(Debug, Clone)]
pub struct RetryManager {
  metrics: SchedulerMetrics,
}

impl RetryManager {
  pub fn new(metrics: SchedulerMetrics) -> Self {
    Self { metrics }
  }

  pub fn decide(
    &self,
    definition: &JobDefinition,
    instance: &JobInstance,
    now: DateTime<Utc>,
  ) -> RetryDecision {
    let fail_count = instance.fail_count.saturating_add(1);

    if definition.is_recurrent() {
      let next_run_at = definition.next_recurrence(now);
      debug!(
        instance_id = %instance.id,
        job_name = %instance.job_name,
        fail_count,
        next_run_at = ?next_run_at,
        "Recurrent run failed, moving on to the next occurrence."
      );
      return RetryDecision::Recur {
        fail_count,
        next_run_at,
      };
    }

    if fail_count <= definition.max_retries {
      let delay = definition.retry_backoff.delay_for(fail_count);
      let next_run_at = run_at::add_std(now, delay);
      SchedulerMetrics::incr(&self.metrics.jobs_retried);
      debug!(
        instance_id = %instance.id,
        job_name = %instance.job_name,
        attempt = fail_count,
        max_retries = definition.max_retries,
        ?delay,
        "Scheduling retry."
      );
      RetryDecision::Retry {
        fail_count,
        next_run_at,
      }
    } else {
      SchedulerMetrics::incr(&self.metrics.jobs_permanently_failed);
      warn!(
        instance_id = %instance.id,
        job_name = %instance.job_name,
        fail_count,
        "Job failed permanently after exhausting retries."
      );
      RetryDecision::Exhausted { fail_count }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn exponential_backoff_is_capped() {
    let backoff = RetryBackoff::Exponential {
      base: StdDuration::from_secs(1),
      factor: 2,
      max_delay: StdDuration::from_secs(10),
    };
    assert_eq!(backoff.delay_for(1), StdDuration::from_secs(1));
    assert_eq!(backoff.delay_for(2), StdDuration::from_secs(2));
    assert_eq!(backoff.delay_for(4), StdDuration::from_secs(8));
    assert_eq!(backoff.delay_for(5), StdDuration::from_secs(10));
    assert_eq!(backoff.delay_for(60), StdDuration::from_secs(10));
  }

  #[test]
  fn immediate_and_fixed() {
    assert_eq!(RetryBackoff::Immediate.delay_for(3), StdDuration::ZERO);
    let fixed = RetryBackoff::Fixed(StdDuration::from_millis(250));
    assert_eq!(fixed.delay_for(1), fixed.delay_for(9));
  }
}
