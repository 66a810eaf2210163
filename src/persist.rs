use tracing::trace;

use crate::job::{JobData, JobDefinition, JobInstance};
use crate::metrics::SchedulerMetrics;
use crate::store::InstanceUpdate;

/// Folds a run function's return value into the completion update.
#[derive(Debug, Clone)]
pub struct ResultPersister {
  metrics: SchedulerMetrics,
}

impl ResultPersister {
  pub fn new(metrics: SchedulerMetrics) -> Self {
    Self { metrics }
  }

  /// Adds `result` to `update` when the definition persists results.
  /// Returns whether it did.
  pub fn attach(
    &self,
    definition: &JobDefinition,
    update: &mut InstanceUpdate,
    result: JobData,
  ) -> bool {
    if !definition.persist_result {
      return false;
    }
    update.result = Some(Some(result));
    true
  }

  /// Called once the completion update carrying a result has been committed.
  pub fn committed(&self, instance: &JobInstance) {
    trace!(instance_id = %instance.id, job_name = %instance.job_name, "Result persisted.");
    SchedulerMetrics::incr(&self.metrics.results_persisted);
  }
}
