use uuid::Uuid;

use super::InstanceId;

/// Contextual information available to a running job instance via task-locals.
/// Accessible within a run function using `try_get_current_job_context()`
/// or the `job_context!()` macro when the `job_context` feature is enabled.
#[derive(Clone, Debug)]
pub struct JobContext {
  /// The ID of the instance being executed.
  pub instance_id: InstanceId,
  /// Registered name of the job.
  pub job_name: String,
  /// Earlier failed attempts of this run.
  pub times_executed: u32,
  /// Token of the lease this execution runs under.
  pub lease_token: Uuid,
}

tokio::task_local! {
    /// Provides access to the current `JobContext` within a job's execution scope.
    /// Set by the JobKeeper worker if the `job_context` feature is enabled.
    pub static CURRENT_JOB_CONTEXT: JobContext;
}

/// Attempts to retrieve the current `JobContext` for the executing job.
///
/// Returns `Some(JobContext)` if the job is running within the context set by
/// a JobKeeper worker, `None` otherwise.
pub fn try_get_current_job_context() -> Option<JobContext> {
  CURRENT_JOB_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Retrieves the current `JobContext`, panicking if called outside a
/// JobKeeper-managed job task.
///
/// Use `try_get_current_job_context()` for optional access.
///
/// # Panics
/// Panics if the `CURRENT_JOB_CONTEXT` task local has not been set.
#[macro_export]
macro_rules! job_context {
  () => {
    $crate::job::context::CURRENT_JOB_CONTEXT.with(|ctx| ctx.clone())
  };
}
