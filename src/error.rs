use crate::job::InstanceId;

use thiserror::Error;

/// Errors that can occur during the scheduler building phase using `SchedulerBuilder`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("Maximum worker count (`max_workers`) must be specified")]
  MissingMaxWorkers,
  #[error("Poll interval must be greater than zero")]
  ZeroPollInterval,
  #[error("Poll batch size must be greater than zero")]
  ZeroBatchSize,
}

/// Errors returned by `JobRegistry::register`.
///
/// Registration happens once at startup, so these are usually fatal to the process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
  #[error("A job named '{0}' is already registered.")]
  DuplicateName(String),
  #[error("Invalid definition for job '{name}': {reason}")]
  InvalidDefinition { name: String, reason: String },
}

/// Lookup or schedule of a job name that was never registered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No job named '{0}' is registered.")]
pub struct UnknownJobError(pub String);

/// Errors surfaced synchronously to callers of `JobKeeper::schedule`.
#[derive(Error, Debug)]
pub enum ScheduleError {
  #[error(transparent)]
  UnknownJob(#[from] UnknownJobError),
  #[error("A job with uniqueness key '{key}' has already been scheduled.")]
  DuplicateSchedule { key: String },
  #[error("Could not interpret run time '{0}'.")]
  InvalidRunAt(String),
  #[error("Uniqueness key '{0}' is reserved for recurrent jobs.")]
  InvalidUniquenessKey(String),
  #[error("Failed to serialize job data: {0}")]
  Serialization(#[from] serde_json::Error),
  #[error(transparent)]
  Store(#[from] StoreError),
}

/// Errors raised by a `JobStore` adapter.
#[derive(Error, Debug)]
pub enum StoreError {
  #[error("An instance with ID {0} already exists.")]
  DuplicateId(InstanceId),
  #[error("Store backend error: {0}")]
  Backend(String),
  #[error("Store serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

/// Lease acquisition/renewal failures.
///
/// Everything except `Store` is an ordinary "not this time" answer: the dispatcher
/// skips the candidate and reconsiders it on a later tick.
#[derive(Error, Debug)]
pub enum LeaseError {
  #[error("Lock limit of {limit} reached for job '{job_name}'.")]
  LockLimitReached { job_name: String, limit: usize },
  #[error("Instance {0} is already leased or no longer pending.")]
  Contended(InstanceId),
  #[error("Lease on instance {0} was lost (expired and reclaimed, or the instance changed).")]
  LeaseLost(InstanceId),
  #[error(transparent)]
  Store(#[from] StoreError),
}

impl LeaseError {
  /// True when the lease was simply not granted (as opposed to a store failure).
  pub fn is_denied(&self) -> bool {
    matches!(
      self,
      LeaseError::LockLimitReached { .. } | LeaseError::Contended(_)
    )
  }
}

// --- Query Errors ---

/// Errors related to querying engine state (`get_instance`, `list_instances`).
#[derive(Error, Debug)]
pub enum QueryError {
  #[error("Instance {0} not found.")]
  InstanceNotFound(InstanceId),
  #[error("Uniqueness key '{0}' belongs to a recurrent job and cannot be released.")]
  ReservedKey(String),
  #[error(transparent)]
  Store(#[from] StoreError),
}

// --- Shutdown Errors ---

/// Errors related to the shutdown process (`shutdown_graceful`, `shutdown_force`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Failed to send shutdown signal (already shut down or watch channel error).")]
  SignalFailed,
  #[error("Timed out waiting for engine tasks (Dispatcher, Workers) to complete shutdown.")]
  Timeout,
  #[error("A worker or dispatcher task panicked during the shutdown process.")]
  TaskPanic,
}
