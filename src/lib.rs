//! JobKeeper: A Lease-Based Job Scheduling Engine
//!
//! Register named job definitions, schedule instances of them with a JSON
//! payload, and let a pool of workers execute due instances. All state lives in
//! a pluggable [`JobStore`]; several engines may share one store and every
//! instance is still executed by at most one of them at a time.
//!
//! # Features
//!
//! - Two kinds of jobs:
//!   - **Recurrent**: a single self-rescheduling instance per job, driven by a
//!     fixed interval, a CRON expression (requires the `cron_schedule` feature)
//!     or a custom `get_next_run` function.
//!   - **Single**: one instance per `schedule` call.
//! - Time-bounded leases with renewal while a run is in flight, and reclaim of
//!   expired leases left behind by crashed holders.
//! - Per-job `concurrency` (per engine) and `lock_limit` (across all engines).
//! - Priority ordering of due instances.
//! - Retries with optional fixed or exponential backoff for single jobs.
//! - Uniqueness keys that deduplicate `schedule` calls.
//! - Optional persistence of a run function's return value.
//! - Human-readable run times (`"in 5 minutes"`, `"2 hours ago"`, RFC 3339).
//! - Terminal failure notifications via a broadcast channel.
//! - Built-in metrics collection (queryable snapshot using `MetricsSnapshot`).
//! - Graceful and forced shutdown procedures (with optional timeout).
//! - Optional task-local job context (`JobContext`) for run functions (requires `job_context` feature).
//!
//! # Usage
//!
//! ```no_run
//! use jobkeeper::{JobDefinition, JobKeeper, JobRegistry, ScheduleOptions};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut registry = JobRegistry::new();
//!
//!     registry.register(
//!         "send-welcome",
//!         JobDefinition::single(|data, info| async move {
//!             println!("[{}] welcoming {}", info.job_name(), data["user"]);
//!             Ok(serde_json::json!({ "sent": true }))
//!         })
//!         .persist_result(true)
//!         .max_retries(3),
//!     )?;
//!
//!     registry.register(
//!         "heartbeat",
//!         JobDefinition::recurrent(|_data, _info| async move {
//!             println!("still alive");
//!             Ok(serde_json::Value::Null)
//!         })
//!         .run_every(Duration::from_secs(30)),
//!     )?;
//!
//!     let keeper = JobKeeper::builder()
//!         .registry(registry)
//!         .max_workers(4)
//!         .build()?;
//!
//!     let outcome = keeper
//!         .schedule(
//!             "send-welcome",
//!             serde_json::json!({ "user": "ada" }),
//!             ScheduleOptions::new().run_at("in 2 seconds").unique("welcome:ada"),
//!         )
//!         .await?;
//!     println!("scheduled: {:?}", outcome);
//!
//!     tokio::time::sleep(Duration::from_secs(5)).await;
//!     println!("metrics: {:#?}", keeper.get_metrics_snapshot());
//!
//!     keeper.shutdown_graceful(Some(Duration::from_secs(10))).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! Use the [`SchedulerBuilder`] to configure the engine:
//! - `registry`: the job definitions this engine can execute.
//! - `store`: the shared backend (defaults to a fresh [`InMemoryStore`]).
//! - `max_workers`: the global execution limit of this engine (required).
//! - `poll_interval`, `batch_size`: how often and how many due instances are considered.
//! - `holder_id`: the identity written on leases.
//! - `outcome_buffer_size`, `failure_buffer_size`: internal channel capacities.
//!
//! # Instance Lifecycle
//!
//! `Pending` instances become due at `next_run_at`. The dispatcher leases due
//! instances in priority order and hands them to workers. A successful single
//! instance becomes `Completed`; a recurrent one moves to its next occurrence.
//! A failed single instance is retried up to `max_retries` times and then marks
//! `Failed`. Every completion write is conditional on the lease token, so a run
//! whose lease expired and was reclaimed cannot clobber the new holder.

// Declare modules within the crate
pub mod command;
mod dispatcher;
pub mod error;
pub mod job;
pub mod lease;
mod macros;
pub mod metrics;
pub mod persist;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod uniqueness;
mod worker;

// --- Public Re-exports ---

// Core engine components
pub use registry::JobRegistry;
pub use scheduler::{JobKeeper, ScheduleOptions, ScheduleOutcome, SchedulerBuilder, Uniqueness};

// Error types
pub use error::{
  BuildError, LeaseError, QueryError, RegisterError, ScheduleError, ShutdownError, StoreError,
  UnknownJobError,
};

// Job related types
pub use job::{
  BoxedRunFn, InstanceId, InstanceStatus, JobData, JobDefinition, JobHandle, JobInfo, JobInstance,
  JobKind, Lease, Priority, RunAt, RunError, RunEvery, RunResult, UniquenessRecord,
};
// Conditionally export context items
#[cfg(feature = "job_context")]
pub use job::context::{try_get_current_job_context, JobContext};

// Store, lease and retry building blocks
pub use command::{ShutdownMode, TerminalFailure};
pub use lease::{LeaseManager, LeasePolicy};
pub use retry::{RetryBackoff, RetryDecision, RetryManager};
pub use store::{InMemoryStore, InstanceFilter, InstanceSort, InstanceUpdate, JobStore, LeaseFilter};
pub use uniqueness::UniquenessGuard;

// Metrics related types
pub use metrics::MetricsSnapshot;
