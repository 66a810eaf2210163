#[cfg(feature = "job_context")]
pub mod context;
pub mod run_at;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
#[cfg(feature = "cron_schedule")]
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::lease::LeasePolicy;
use crate::retry::RetryBackoff;

pub use run_at::{parse_duration_phrase, RunAt};

// --- Public Type Aliases ---

/// Type alias for the unique identifier of a persisted job instance.
/// Uses UUID v4.
pub type InstanceId = Uuid;

/// Type alias for the simple numeric ID assigned to worker tasks for logging.
pub(crate) type WorkerId = usize;

/// Arbitrary JSON payload carried by an instance and handed to its run function.
pub type JobData = serde_json::Value;

/// Error type a run function may fail with.
pub type RunError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// What a run function resolves to. `Ok` carries the (optional) result to persist.
pub type RunResult = Result<JobData, RunError>;

/// The function type that job instances execute.
///
/// The function must be asynchronous, `Send + Sync + 'static`, and return a `Future`
/// that resolves to [`RunResult`].
/// - `Ok(value)` marks the execution successful; `value` is persisted when the
///   definition enables result persistence.
/// - `Err(_)` marks it failed, which may trigger a retry.
/// Panics within the function are caught by the worker and treated as failures.
pub type BoxedRunFn = Box<
  dyn Fn(JobData, JobInfo) -> Pin<Box<dyn Future<Output = RunResult> + Send + 'static>>
    + Send
    + Sync
    + 'static,
>;

/// Computes the next run time of a job directly. Takes precedence over `run_every`.
pub type NextRunFn = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync + 'static>;

pub(crate) const DEFAULT_CONCURRENCY: usize = 5;
pub(crate) const DEFAULT_LOCK_LIFETIME: StdDuration = StdDuration::from_secs(10 * 60);

// --- Definition Building Blocks ---

/// Whether a job keeps a single self-rescheduling instance or is scheduled on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
  /// Exactly one live instance, rescheduled after each run.
  Recurrent,
  /// One instance per `schedule` call, retired once it finishes.
  Single,
}

/// Dispatch priority. Higher values are leased first among due instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
  Lowest,
  Low,
  #[default]
  Normal,
  High,
  Highest,
  Custom(i32),
}

impl Priority {
  /// Numeric value stored on instances.
  pub fn value(self) -> i32 {
    match self {
      Priority::Lowest => -20,
      Priority::Low => -10,
      Priority::Normal => 0,
      Priority::High => 10,
      Priority::Highest => 20,
      Priority::Custom(value) => value,
    }
  }
}

impl From<i32> for Priority {
  fn from(value: i32) -> Self {
    Priority::Custom(value)
  }
}

impl FromStr for Priority {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "lowest" => Ok(Priority::Lowest),
      "low" => Ok(Priority::Low),
      "normal" => Ok(Priority::Normal),
      "high" => Ok(Priority::High),
      "highest" => Ok(Priority::Highest),
      other => other
        .parse::<i32>()
        .map(Priority::Custom)
        .map_err(|_| format!("unknown priority '{}'", s)),
    }
  }
}

/// Recurrence rule for recurrent jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunEvery {
  /// Run again a fixed interval after the previous run finished.
  Interval(StdDuration),
  /// Run on a CRON expression (UTC). Needs the `cron_schedule` feature to be
  /// usable; without it registration rejects the definition.
  Cron(String),
}

impl From<StdDuration> for RunEvery {
  fn from(interval: StdDuration) -> Self {
    RunEvery::Interval(interval)
  }
}

/// Bare numbers are milliseconds.
impl From<u64> for RunEvery {
  fn from(millis: u64) -> Self {
    RunEvery::Interval(StdDuration::from_millis(millis))
  }
}

impl RunEvery {
  /// Interprets a textual rule. Duration phrases (`"5 minutes"`, `"1500"`) become
  /// intervals, anything else is taken as a CRON expression and checked when the
  /// definition is registered.
  pub fn from_expression(expression: &str) -> Self {
    match parse_duration_phrase(expression) {
      Some(interval) => RunEvery::Interval(interval),
      None => RunEvery::Cron(expression.trim().to_string()),
    }
  }

  pub(crate) fn validate(&self) -> Result<(), String> {
    match self {
      RunEvery::Interval(interval) if interval.is_zero() => {
        Err("run_every interval must be greater than zero".to_string())
      }
      RunEvery::Interval(_) => Ok(()),
      #[cfg(feature = "cron_schedule")]
      RunEvery::Cron(expression) => CronSchedule::from_str(expression)
        .map(|_| ())
        .map_err(|e| format!("invalid cron expression '{}': {}", expression, e)),
      #[cfg(not(feature = "cron_schedule"))]
      RunEvery::Cron(expression) => Err(format!(
        "cron expression '{}' requires the `cron_schedule` feature",
        expression
      )),
    }
  }

  /// Next occurrence strictly after `reference_time`.
  pub(crate) fn calculate_next_run(&self, reference_time: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match self {
      RunEvery::Interval(interval) => Some(run_at::add_std(reference_time, *interval)),
      #[cfg(feature = "cron_schedule")]
      RunEvery::Cron(expression) => match CronSchedule::from_str(expression) {
        Ok(cron_schedule) => cron_schedule.after(&reference_time).next(),
        Err(e) => {
          warn!("Failed to parse cron expression '{}': {}", expression, e);
          None
        }
      },
      #[cfg(not(feature = "cron_schedule"))]
      RunEvery::Cron(_) => None,
    }
  }

  /// First run of a freshly seeded recurrent instance: intervals start now,
  /// cron rules wait for their next occurrence.
  pub(crate) fn first_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match self {
      RunEvery::Interval(_) => Some(now),
      RunEvery::Cron(_) => self.calculate_next_run(now),
    }
  }
}

// --- Job Definition ---

/// Registered configuration for a named job.
///
/// Built with [`JobDefinition::single`] or [`JobDefinition::recurrent`] and the
/// chained setters below, then handed to [`JobRegistry::register`](crate::JobRegistry::register)
/// which assigns the name and validates it.
#[derive(Clone)]
pub struct JobDefinition {
  pub(crate) name: String,
  pub(crate) kind: JobKind,
  pub(crate) run_fn: Arc<BoxedRunFn>,
  pub(crate) get_next_run: Option<NextRunFn>,
  pub(crate) run_every: Option<RunEvery>,
  pub(crate) persist_result: bool,
  pub(crate) max_retries: u32,
  pub(crate) retry_backoff: RetryBackoff,
  pub(crate) concurrency: usize,
  pub(crate) lock_limit: Option<usize>,
  pub(crate) lock_lifetime: StdDuration,
  pub(crate) priority: Priority,
  pub(crate) display_name: Option<String>,
}

// Manual implementation of Debug since the run function is opaque.
impl fmt::Debug for JobDefinition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobDefinition")
      .field("name", &self.name)
      .field("kind", &self.kind)
      .field("run_every", &self.run_every)
      .field("has_get_next_run", &self.get_next_run.is_some())
      .field("persist_result", &self.persist_result)
      .field("max_retries", &self.max_retries)
      .field("retry_backoff", &self.retry_backoff)
      .field("concurrency", &self.concurrency)
      .field("lock_limit", &self.lock_limit)
      .field("lock_lifetime", &self.lock_lifetime)
      .field("priority", &self.priority)
      .field("display_name", &self.display_name)
      .finish()
  }
}

impl JobDefinition {
  /// A job scheduled on demand; each `schedule` call creates one instance.
  pub fn single<F, Fut>(run: F) -> Self
  where
    F: Fn(JobData, JobInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RunResult> + Send + 'static,
  {
    Self::new(JobKind::Single, run)
  }

  /// A job with one self-rescheduling instance. Needs [`run_every`](Self::run_every)
  /// or [`get_next_run`](Self::get_next_run).
  pub fn recurrent<F, Fut>(run: F) -> Self
  where
    F: Fn(JobData, JobInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RunResult> + Send + 'static,
  {
    Self::new(JobKind::Recurrent, run)
  }

  /// Same as [`single`](Self::single) for an already boxed function (see [`run_fn!`](crate::run_fn)).
  pub fn from_boxed(kind: JobKind, run_fn: BoxedRunFn) -> Self {
    Self {
      name: String::new(),
      kind,
      run_fn: Arc::new(run_fn),
      get_next_run: None,
      run_every: None,
      persist_result: false,
      max_retries: 0,
      retry_backoff: RetryBackoff::default(),
      concurrency: DEFAULT_CONCURRENCY,
      lock_limit: None,
      lock_lifetime: DEFAULT_LOCK_LIFETIME,
      priority: Priority::Normal,
      display_name: None,
    }
  }

  fn new<F, Fut>(kind: JobKind, run: F) -> Self
  where
    F: Fn(JobData, JobInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RunResult> + Send + 'static,
  {
    let boxed: BoxedRunFn = Box::new(move |data, info| Box::pin(run(data, info)));
    Self::from_boxed(kind, boxed)
  }

  pub fn run_every(mut self, every: impl Into<RunEvery>) -> Self {
    self.run_every = Some(every.into());
    self
  }

  pub fn get_next_run<G>(mut self, next_run: G) -> Self
  where
    G: Fn() -> DateTime<Utc> + Send + Sync + 'static,
  {
    self.get_next_run = Some(Arc::new(next_run));
    self
  }

  /// Persist the run function's `Ok` value on the instance after success.
  pub fn persist_result(mut self, persist: bool) -> Self {
    self.persist_result = persist;
    self
  }

  /// Alias of [`persist_result`](Self::persist_result).
  pub fn should_save_result(self, save: bool) -> Self {
    self.persist_result(save)
  }

  /// Retries allowed after the first failed attempt of a single job.
  pub fn max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries;
    self
  }

  pub fn retry_backoff(mut self, backoff: RetryBackoff) -> Self {
    self.retry_backoff = backoff;
    self
  }

  /// Max simultaneous executions of this job within one process.
  pub fn concurrency(mut self, concurrency: usize) -> Self {
    self.concurrency = concurrency;
    self
  }

  /// Max simultaneously held leases for this job across all processes.
  pub fn lock_limit(mut self, lock_limit: usize) -> Self {
    self.lock_limit = Some(lock_limit);
    self
  }

  pub fn lock_lifetime(mut self, lock_lifetime: StdDuration) -> Self {
    self.lock_lifetime = lock_lifetime;
    self
  }

  pub fn priority(mut self, priority: impl Into<Priority>) -> Self {
    self.priority = priority.into();
    self
  }

  pub fn display_name(mut self, display_name: impl Into<String>) -> Self {
    self.display_name = Some(display_name.into());
    self
  }

  // --- Accessors ---

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn kind(&self) -> JobKind {
    self.kind
  }

  pub fn is_recurrent(&self) -> bool {
    self.kind == JobKind::Recurrent
  }

  pub fn concurrency_limit(&self) -> usize {
    self.concurrency
  }

  pub fn lock_limit_value(&self) -> Option<usize> {
    self.lock_limit
  }

  pub fn lock_lifetime_value(&self) -> StdDuration {
    self.lock_lifetime
  }

  pub fn max_retries_value(&self) -> u32 {
    self.max_retries
  }

  pub fn priority_value(&self) -> Priority {
    self.priority
  }

  pub(crate) fn lease_policy(&self) -> LeasePolicy {
    LeasePolicy {
      lock_limit: self.lock_limit,
      lock_lifetime: self.lock_lifetime,
    }
  }

  /// Next recurrence after `reference_time`. `get_next_run` wins over `run_every`.
  pub(crate) fn next_recurrence(&self, reference_time: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(next_run) = &self.get_next_run {
      return Some(next_run());
    }
    self
      .run_every
      .as_ref()
      .and_then(|every| every.calculate_next_run(reference_time))
  }

  /// Run time for a newly seeded recurrent instance.
  pub(crate) fn first_recurrence(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(next_run) = &self.get_next_run {
      return Some(next_run());
    }
    self.run_every.as_ref().and_then(|every| every.first_run(now))
  }
}

// --- Persisted State ---

/// Lifecycle of a persisted instance. Terminal instances are kept for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
  Pending,
  Completed,
  Failed,
}

impl InstanceStatus {
  pub fn is_terminal(self) -> bool {
    !matches!(self, InstanceStatus::Pending)
  }
}

/// A time-bounded exclusive claim on an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
  /// Identifies the process holding the lease.
  pub holder_id: String,
  /// Fresh per grant; renewals and completion are conditioned on it.
  pub token: Uuid,
  pub acquired_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

impl Lease {
  pub(crate) fn grant(holder_id: &str, now: DateTime<Utc>, lifetime: StdDuration) -> Self {
    Self {
      holder_id: holder_id.to_string(),
      token: Uuid::new_v4(),
      acquired_at: now,
      expires_at: run_at::add_std(now, lifetime),
    }
  }

  pub(crate) fn extended(&self, now: DateTime<Utc>, lifetime: StdDuration) -> Self {
    Self {
      expires_at: run_at::add_std(now, lifetime),
      ..self.clone()
    }
  }

  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.expires_at <= now
  }
}

/// Persisted record for one schedulable execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInstance {
  pub id: InstanceId,
  pub job_name: String,
  pub data: JobData,
  pub next_run_at: DateTime<Utc>,
  /// When the current lease was acquired. Written together with `lease` and
  /// cleared with it; renewals keep the original time.
  #[serde(default)]
  pub locked_at: Option<DateTime<Utc>>,
  pub lease: Option<Lease>,
  pub last_run_at: Option<DateTime<Utc>>,
  pub last_finished_at: Option<DateTime<Utc>>,
  /// Failed attempts of the current run. Exposed to run functions as `times_executed`.
  pub fail_count: u32,
  pub fail_reason: Option<String>,
  pub priority: i32,
  pub uniqueness_key: Option<String>,
  pub result: Option<JobData>,
  pub status: InstanceStatus,
  pub created_at: DateTime<Utc>,
}

impl JobInstance {
  pub(crate) fn new(
    job_name: &str,
    data: JobData,
    next_run_at: DateTime<Utc>,
    priority: Priority,
    uniqueness_key: Option<String>,
    now: DateTime<Utc>,
  ) -> Self {
    Self {
      id: Uuid::new_v4(),
      job_name: job_name.to_string(),
      data,
      next_run_at,
      locked_at: None,
      lease: None,
      last_run_at: None,
      last_finished_at: None,
      fail_count: 0,
      fail_reason: None,
      priority: priority.value(),
      uniqueness_key,
      result: None,
      status: InstanceStatus::Pending,
      created_at: now,
    }
  }

  /// Holds an unexpired lease at `now`.
  pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
    self.lease.as_ref().is_some_and(|lease| !lease.is_expired(now))
  }

  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.status == InstanceStatus::Pending && self.next_run_at <= now
  }
}

/// Marker that claims a uniqueness key for an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniquenessRecord {
  pub key: String,
  /// Set once the guarded instance is persisted.
  pub instance_id: Option<InstanceId>,
  pub created_at: DateTime<Utc>,
}

// --- Views handed to callers ---

/// Read-only view of the executing instance, passed to run functions.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
  instance_id: InstanceId,
  job_name: String,
  display_name: Option<String>,
  times_executed: u32,
  scheduled_for: DateTime<Utc>,
  priority: i32,
  uniqueness_key: Option<String>,
  lease: Lease,
}

impl JobInfo {
  pub(crate) fn compose(instance: &JobInstance, lease: &Lease, definition: &JobDefinition) -> Self {
    Self {
      instance_id: instance.id,
      job_name: instance.job_name.clone(),
      display_name: definition.display_name.clone(),
      times_executed: instance.fail_count,
      scheduled_for: instance.next_run_at,
      priority: instance.priority,
      uniqueness_key: instance.uniqueness_key.clone(),
      lease: lease.clone(),
    }
  }

  pub fn instance_id(&self) -> InstanceId {
    self.instance_id
  }

  pub fn job_name(&self) -> &str {
    &self.job_name
  }

  pub fn display_name(&self) -> Option<&str> {
    self.display_name.as_deref()
  }

  /// Number of earlier failed attempts of this run (0 on the first attempt).
  pub fn times_executed(&self) -> u32 {
    self.times_executed
  }

  pub fn scheduled_for(&self) -> DateTime<Utc> {
    self.scheduled_for
  }

  pub fn priority(&self) -> i32 {
    self.priority
  }

  pub fn uniqueness_key(&self) -> Option<&str> {
    self.uniqueness_key.as_deref()
  }

  pub fn lease(&self) -> &Lease {
    &self.lease
  }
}

/// Returned by a successful `schedule` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
  pub instance_id: InstanceId,
  pub job_name: String,
  pub next_run_at: DateTime<Utc>,
}

impl From<&JobInstance> for JobHandle {
  fn from(instance: &JobInstance) -> Self {
    Self {
      instance_id: instance.id,
      job_name: instance.job_name.clone(),
      next_run_at: instance.next_run_at,
    }
  }
}
