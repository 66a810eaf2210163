use std::sync::Arc;

use crate::job::{InstanceId, JobDefinition, JobInstance, Lease};

/// Represents the requested shutdown mode. Sent via a `watch` channel.
/// `None` indicates the engine is running normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Stop leasing new instances and wait for in-flight runs to finish.
  Graceful,
  /// Abort in-flight runs and exit. Their leases are left to expire.
  Force,
}

/// A leased instance handed from the Dispatcher to a Worker.
#[derive(Debug)]
pub(crate) struct Dispatch {
  pub instance: JobInstance,
  pub lease: Lease,
  pub definition: Arc<JobDefinition>,
}

/// How an execution attempt ended, as seen by the Worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecutionOutcome {
  Succeeded,
  Failed,
  Panicked,
  /// The lease was gone before start or at completion; nothing was written.
  LeaseLost,
  /// Aborted by a forced shutdown.
  Aborted,
}

/// Message sent from a Worker back to the Dispatcher once it is done with a
/// dispatch, freeing the concurrency slot it occupied.
#[derive(Debug)]
pub(crate) struct WorkerOutcome {
  pub instance_id: InstanceId,
  pub job_name: String,
  pub outcome: ExecutionOutcome,
}

/// Broadcast when an instance reaches `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalFailure {
  pub instance_id: InstanceId,
  pub job_name: String,
  pub fail_count: u32,
  pub reason: String,
}
