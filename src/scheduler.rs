use crate::command::{ShutdownMode, TerminalFailure, WorkerOutcome};
use crate::dispatcher::{Dispatcher, DispatcherState};
use crate::error::{BuildError, QueryError, ScheduleError, ShutdownError, StoreError};
use crate::job::{
  run_at, InstanceId, JobData, JobDefinition, JobHandle, JobInstance, Priority, RunAt,
  UniquenessRecord,
};
use crate::lease::LeaseManager;
use crate::metrics::{MetricsSnapshot, SchedulerMetrics};
use crate::persist::ResultPersister;
use crate::registry::JobRegistry;
use crate::retry::RetryManager;
use crate::store::{InMemoryStore, InstanceFilter, InstanceSort, JobStore};
use crate::uniqueness::{is_reserved_key, recurrent_key, UniquenessGuard};
use crate::worker::Worker;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use futures::TryStreamExt;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_OUTCOME_BUFFER: usize = 128;
const DEFAULT_FAILURE_BUFFER: usize = 64;
/// Attempts made to find a recurrent instance whose key another caller just claimed.
const RECURRENT_LOOKUP_ATTEMPTS: usize = 5;
const RECURRENT_LOOKUP_BACKOFF: Duration = Duration::from_millis(20);

// --- Schedule Request Types ---

/// Uniqueness constraint for a `schedule` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uniqueness {
  pub key: String,
  /// Return [`ScheduleOutcome::Skipped`] instead of an error on conflict.
  pub ignore_error: bool,
}

/// Per-call options for [`JobKeeper::schedule`].
///
/// The first run time is taken from `run_at`, then `wait_to_run`, then the
/// definition's `get_next_run`, and otherwise is "now".
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
  pub run_at: Option<RunAt>,
  pub wait_to_run: Option<Duration>,
  pub uniqueness: Option<Uniqueness>,
  /// Overrides the definition's priority for this instance.
  pub priority: Option<Priority>,
}

impl ScheduleOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn run_at(mut self, run_at: impl Into<RunAt>) -> Self {
    self.run_at = Some(run_at.into());
    self
  }

  pub fn wait_to_run(mut self, delay: Duration) -> Self {
    self.wait_to_run = Some(delay);
    self
  }

  /// Rejects the call with [`ScheduleError::DuplicateSchedule`] if `key` was used before.
  pub fn unique(mut self, key: impl Into<String>) -> Self {
    self.uniqueness = Some(Uniqueness {
      key: key.into(),
      ignore_error: false,
    });
    self
  }

  /// Like [`unique`](Self::unique) but a conflict yields [`ScheduleOutcome::Skipped`].
  pub fn unique_or_skip(mut self, key: impl Into<String>) -> Self {
    self.uniqueness = Some(Uniqueness {
      key: key.into(),
      ignore_error: true,
    });
    self
  }

  pub fn priority(mut self, priority: impl Into<Priority>) -> Self {
    self.priority = Some(priority.into());
    self
  }
}

/// Result of a successful `schedule` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
  /// A new single-job instance was persisted.
  Scheduled(JobHandle),
  /// The named job is recurrent; this is its single live instance.
  Recurring(JobHandle),
  /// The uniqueness key was taken and the caller asked to ignore that.
  Skipped { key: String },
}

impl ScheduleOutcome {
  pub fn handle(&self) -> Option<&JobHandle> {
    match self {
      ScheduleOutcome::Scheduled(handle) | ScheduleOutcome::Recurring(handle) => Some(handle),
      ScheduleOutcome::Skipped { .. } => None,
    }
  }

  pub fn instance_id(&self) -> Option<InstanceId> {
    self.handle().map(|handle| handle.instance_id)
  }

  pub fn is_skipped(&self) -> bool {
    matches!(self, ScheduleOutcome::Skipped { .. })
  }
}

// --- Scheduler (instance creation) ---

/// Turns `schedule` requests into persisted instances and seeds recurrent ones.
pub(crate) struct Scheduler {
  store: Arc<dyn JobStore>,
  registry: Arc<JobRegistry>,
  uniqueness: UniquenessGuard,
  metrics: SchedulerMetrics,
  wake: Arc<Notify>,
}

impl Scheduler {
  pub fn new(
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    metrics: SchedulerMetrics,
    wake: Arc<Notify>,
  ) -> Self {
    Self {
      uniqueness: UniquenessGuard::new(store.clone()),
      store,
      registry,
      metrics,
      wake,
    }
  }

  pub async fn schedule(
    &self,
    name: &str,
    data: JobData,
    options: ScheduleOptions,
  ) -> Result<ScheduleOutcome, ScheduleError> {
    let definition = self.registry.lookup(name)?;

    if definition.is_recurrent() {
      debug!(job_name = %name, "Schedule of recurrent job, ensuring its live instance.");
      let instance = self.ensure_recurring(&definition).await?;
      return Ok(ScheduleOutcome::Recurring(JobHandle::from(&instance)));
    }

    let now = Utc::now();
    let next_run_at = resolve_next_run(&definition, &options, now)?;
    let priority = options.priority.unwrap_or(definition.priority);

    let uniqueness_key = match &options.uniqueness {
      Some(uniqueness) => {
        if is_reserved_key(&uniqueness.key) {
          return Err(ScheduleError::InvalidUniquenessKey(uniqueness.key.clone()));
        }
        if !self.uniqueness.claim(&uniqueness.key, now).await? {
          SchedulerMetrics::incr(&self.metrics.schedules_deduplicated);
          if uniqueness.ignore_error {
            info!(job_name = %name, key = %uniqueness.key, "Uniqueness key already used, skipping.");
            return Ok(ScheduleOutcome::Skipped {
              key: uniqueness.key.clone(),
            });
          }
          return Err(ScheduleError::DuplicateSchedule {
            key: uniqueness.key.clone(),
          });
        }
        Some(uniqueness.key.clone())
      }
      None => None,
    };

    let instance = JobInstance::new(name, data, next_run_at, priority, uniqueness_key, now);
    let instance = self.insert_guarded(instance).await?;

    info!(
      instance_id = %instance.id,
      job_name = %name,
      next_run = %instance.next_run_at,
      priority = instance.priority,
      "Scheduled job instance."
    );
    if instance.next_run_at <= Utc::now() {
      self.wake.notify_one();
    }
    Ok(ScheduleOutcome::Scheduled(JobHandle::from(&instance)))
  }

  /// Makes sure the single live instance of a recurrent job exists and returns it.
  ///
  /// The `recurrent:<name>` marker decides who seeds. A marker left without an
  /// instance (its claimer died between claim and insert) is taken over, see
  /// [`is_orphaned`].
  pub async fn ensure_recurring(
    &self,
    definition: &JobDefinition,
  ) -> Result<JobInstance, ScheduleError> {
    let key = recurrent_key(definition.name());

    if self.uniqueness.claim(&key, Utc::now()).await? {
      return self.seed_recurring(definition, key).await;
    }

    // Someone else owns the key; it may still be inserting.
    for attempt in 0..RECURRENT_LOOKUP_ATTEMPTS {
      let Some(record) = self.uniqueness.lookup(&key).await? else {
        if self.uniqueness.claim(&key, Utc::now()).await? {
          return self.seed_recurring(definition, key).await;
        }
        continue;
      };
      if let Some(instance) = self.find_recurring(definition, &record).await? {
        return Ok(instance);
      }

      let now = Utc::now();
      if is_orphaned(&record, definition, now) && self.uniqueness.take_over(&record, now).await? {
        warn!(
          %key,
          claimed_at = %record.created_at,
          "Recurrent marker has no instance, taking it over."
        );
        return self.seed_recurring(definition, key).await;
      }
      debug!(%key, attempt, "Recurrent instance not visible yet, waiting.");
      tokio::time::sleep(RECURRENT_LOOKUP_BACKOFF).await;
    }
    Err(ScheduleError::Store(StoreError::Backend(format!(
      "uniqueness key '{}' is claimed but no instance was found",
      key
    ))))
  }

  /// Inserts the recurrent instance under a marker this caller holds.
  async fn seed_recurring(
    &self,
    definition: &JobDefinition,
    key: String,
  ) -> Result<JobInstance, ScheduleError> {
    let now = Utc::now();
    let Some(next_run_at) = definition.first_recurrence(now) else {
      self.release_quietly(&key).await;
      return Err(ScheduleError::InvalidRunAt(format!(
        "recurrent job '{}' has no upcoming occurrence",
        definition.name()
      )));
    };
    let instance = JobInstance::new(
      definition.name(),
      JobData::Null,
      next_run_at,
      definition.priority,
      Some(key),
      now,
    );
    let instance = self.insert_guarded(instance).await?;
    info!(
      instance_id = %instance.id,
      job_name = %definition.name(),
      next_run = %instance.next_run_at,
      "Seeded recurrent job instance."
    );
    if instance.next_run_at <= Utc::now() {
      self.wake.notify_one();
    }
    Ok(instance)
  }

  /// The instance guarded by `record`, if it belongs to this job.
  async fn find_recurring(
    &self,
    definition: &JobDefinition,
    record: &UniquenessRecord,
  ) -> Result<Option<JobInstance>, StoreError> {
    if let Some(instance_id) = record.instance_id {
      if let Some(instance) = self.store.get_instance(instance_id).await? {
        if instance.job_name == definition.name() {
          return Ok(Some(instance));
        }
        warn!(
          key = %record.key,
          %instance_id,
          owner = %instance.job_name,
          "Recurrent marker is bound to another job's instance."
        );
      }
    }
    let mut found = self.store.find_instances(
      InstanceFilter::new()
        .uniqueness_key(record.key.as_str())
        .job_name(definition.name()),
      InstanceSort::Unordered,
      Some(1),
    );
    found.try_next().await
  }

  /// Inserts an instance whose uniqueness key (if any) was just claimed,
  /// rolling the claim back if the insert fails.
  async fn insert_guarded(&self, instance: JobInstance) -> Result<JobInstance, ScheduleError> {
    let key = instance.uniqueness_key.clone();
    if let Err(e) = self.store.insert_instance(instance.clone()).await {
      if let Some(key) = &key {
        self.release_quietly(key).await;
      }
      return Err(e.into());
    }
    if let Some(key) = &key {
      if let Err(e) = self.uniqueness.bind(key, instance.id).await {
        warn!(%key, instance_id = %instance.id, error = %e, "Failed to bind uniqueness marker.");
      }
    }
    SchedulerMetrics::incr(&self.metrics.instances_scheduled);
    Ok(instance)
  }

  async fn release_quietly(&self, key: &str) {
    if let Err(e) = self.uniqueness.release(key).await {
      warn!(%key, error = %e, "Failed to roll back uniqueness claim.");
    }
  }

  pub async fn release_uniqueness(&self, key: &str) -> Result<bool, QueryError> {
    if is_reserved_key(key) {
      return Err(QueryError::ReservedKey(key.to_string()));
    }
    Ok(self.uniqueness.release(key).await?)
  }
}

/// A marker bound to an instance that is gone (or not this job's) is dead at
/// once; an unbound one only after the claimer had `lock_lifetime` to insert.
fn is_orphaned(record: &UniquenessRecord, definition: &JobDefinition, now: DateTime<Utc>) -> bool {
  match record.instance_id {
    Some(_) => true,
    None => run_at::add_std(record.created_at, definition.lock_lifetime) <= now,
  }
}

fn resolve_next_run(
  definition: &JobDefinition,
  options: &ScheduleOptions,
  now: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
  if let Some(run_at) = &options.run_at {
    return run_at.resolve(now);
  }
  if let Some(delay) = options.wait_to_run {
    return Ok(run_at::add_std(now, delay));
  }
  if let Some(next_run) = &definition.get_next_run {
    return Ok(next_run());
  }
  Ok(now)
}

// --- Builder ---

/// Builder for configuring and starting a [`JobKeeper`] engine.
///
/// # Example
///
/// ```no_run
/// use jobkeeper::{JobDefinition, JobKeeper, JobRegistry};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mut registry = JobRegistry::new();
/// registry.register(
///     "greet",
///     JobDefinition::single(|data, _info| async move {
///         println!("hello {}", data);
///         Ok(serde_json::Value::Null)
///     }),
/// )?;
///
/// let keeper = JobKeeper::builder()
///     .registry(registry)
///     .max_workers(4)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct SchedulerBuilder {
  registry: JobRegistry,
  store: Option<Arc<dyn JobStore>>,
  max_workers: Option<usize>,
  poll_interval: Duration,
  batch_size: usize,
  holder_id: Option<String>,
  outcome_buffer_size: usize,
  failure_buffer_size: usize,
}

impl fmt::Debug for SchedulerBuilder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SchedulerBuilder")
      .field("registry", &self.registry)
      .field("custom_store", &self.store.is_some())
      .field("max_workers", &self.max_workers)
      .field("poll_interval", &self.poll_interval)
      .field("batch_size", &self.batch_size)
      .field("holder_id", &self.holder_id)
      .field("outcome_buffer_size", &self.outcome_buffer_size)
      .field("failure_buffer_size", &self.failure_buffer_size)
      .finish()
  }
}

impl Default for SchedulerBuilder {
  fn default() -> Self {
    Self {
      registry: JobRegistry::new(),
      store: None,
      max_workers: None,
      poll_interval: DEFAULT_POLL_INTERVAL,
      batch_size: DEFAULT_BATCH_SIZE,
      holder_id: None,
      outcome_buffer_size: DEFAULT_OUTCOME_BUFFER,
      failure_buffer_size: DEFAULT_FAILURE_BUFFER,
    }
  }
}

impl SchedulerBuilder {
  /// Creates a new builder with default settings.
  /// - `max_workers`: Not set (required).
  /// - `store`: a fresh [`InMemoryStore`].
  /// - `poll_interval`: 1 second.
  pub fn new() -> Self {
    Self::default()
  }

  /// Job definitions this engine can execute.
  pub fn registry(mut self, registry: JobRegistry) -> Self {
    self.registry = registry;
    self
  }

  /// Backend shared with any other engines cooperating on the same jobs.
  pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
    self.store = Some(store);
    self
  }

  /// Sets the maximum number of jobs that can run concurrently (required).
  /// Must be greater than 0 for jobs to execute.
  pub fn max_workers(mut self, count: usize) -> Self {
    self.max_workers = Some(count);
    self
  }

  pub fn poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = interval;
    self
  }

  /// Max due instances considered per poll.
  pub fn batch_size(mut self, size: usize) -> Self {
    self.batch_size = size;
    self
  }

  /// Identity recorded on leases. Defaults to a random UUID.
  pub fn holder_id(mut self, holder_id: impl Into<String>) -> Self {
    self.holder_id = Some(holder_id.into());
    self
  }

  /// Sets the size of the worker → dispatcher completion channel.
  pub fn outcome_buffer_size(mut self, size: usize) -> Self {
    self.outcome_buffer_size = size.max(1);
    self
  }

  /// Sets how many terminal failure notifications a slow subscriber may lag behind.
  pub fn failure_buffer_size(mut self, size: usize) -> Self {
    self.failure_buffer_size = size.max(1);
    self
  }

  /// Builds and starts the engine: spawns the Dispatcher task and the Worker pool.
  ///
  /// Must be called from within a Tokio runtime.
  ///
  /// # Errors
  ///
  /// - [`BuildError::MissingMaxWorkers`] if `max_workers` was not set.
  /// - [`BuildError::ZeroPollInterval`] / [`BuildError::ZeroBatchSize`] for zero values.
  pub fn build(self) -> Result<JobKeeper, BuildError> {
    let max_workers = self.max_workers.ok_or(BuildError::MissingMaxWorkers)?;
    if max_workers == 0 {
      warn!("Engine built with 0 workers. No jobs will execute.");
    }
    if self.poll_interval.is_zero() {
      return Err(BuildError::ZeroPollInterval);
    }
    if self.batch_size == 0 {
      return Err(BuildError::ZeroBatchSize);
    }

    // --- Initialize Shared State & Channels ---
    let metrics = SchedulerMetrics::new();
    let store: Arc<dyn JobStore> = self
      .store
      .unwrap_or_else(|| Arc::new(InMemoryStore::new()));
    let registry = Arc::new(self.registry);
    let holder_id = self
      .holder_id
      .unwrap_or_else(|| Uuid::new_v4().to_string());
    let wake = Arc::new(Notify::new());

    let scheduler = Arc::new(Scheduler::new(
      store.clone(),
      registry.clone(),
      metrics.clone(),
      wake.clone(),
    ));
    let lease_manager = LeaseManager::new(store.clone(), holder_id.clone(), metrics.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel::<Option<ShutdownMode>>(None);
    let (job_dispatch_tx, job_dispatch_rx) = async_channel::bounded(max_workers.max(1));
    let (worker_outcome_tx, worker_outcome_rx) =
      mpsc::channel::<WorkerOutcome>(self.outcome_buffer_size);
    let (failure_tx, _) = broadcast::channel::<TerminalFailure>(self.failure_buffer_size);

    // --- Spawn Dispatcher ---
    let dispatcher_state = DispatcherState {
      store: store.clone(),
      registry: registry.clone(),
      scheduler: scheduler.clone(),
      lease_manager: lease_manager.clone(),
      shutdown_rx: shutdown_rx.clone(),
      worker_outcome_rx,
      job_dispatch_tx,
      wake,
      max_workers,
      poll_interval: self.poll_interval,
      batch_size: self.batch_size,
    };

    let dispatcher_handle = Handle::current().spawn(async move {
      let mut dispatcher = Dispatcher::new(dispatcher_state);
      dispatcher.run().await;
      info!("Dispatcher task finished.");
    });

    // --- Spawn Workers ---
    let mut worker_handles = Vec::with_capacity(max_workers);
    for worker_id in 0..max_workers {
      let mut worker = Worker::new(
        worker_id,
        lease_manager.clone(),
        RetryManager::new(metrics.clone()),
        ResultPersister::new(metrics.clone()),
        metrics.clone(),
        shutdown_rx.clone(),
        worker_outcome_tx.clone(),
        job_dispatch_rx.clone(),
        failure_tx.clone(),
      );
      worker_handles.push(Handle::current().spawn(async move {
        worker.run().await;
      }));
    }
    // Workers hold the clones
    drop(worker_outcome_tx);

    info!(%holder_id, max_workers, jobs = registry.len(), "JobKeeper started.");

    Ok(JobKeeper {
      scheduler,
      store,
      registry,
      metrics,
      holder_id,
      shutdown_tx,
      failure_tx,
      dispatcher_handle: Arc::new(Mutex::new(Some(dispatcher_handle))),
      worker_handles: Arc::new(Mutex::new(worker_handles)),
    })
  }
}

// --- Engine Handle ---

/// Handle to a running engine: schedules instances, answers queries and
/// controls shutdown.
///
/// Several handles built over the same store behave like separate processes
/// cooperating on one backend: each instance is executed by exactly one of them
/// at a time.
///
/// Use [`JobKeeper::builder()`] to create and configure an instance.
pub struct JobKeeper {
  scheduler: Arc<Scheduler>,
  store: Arc<dyn JobStore>,
  registry: Arc<JobRegistry>,
  metrics: SchedulerMetrics,
  holder_id: String,
  shutdown_tx: watch::Sender<Option<ShutdownMode>>,
  failure_tx: broadcast::Sender<TerminalFailure>,
  // Task handles for shutdown
  dispatcher_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
  worker_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl fmt::Debug for JobKeeper {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobKeeper")
      .field("holder_id", &self.holder_id)
      .field("registry", &self.registry)
      .finish_non_exhaustive()
  }
}

impl JobKeeper {
  /// Returns a builder to configure and create a `JobKeeper` instance.
  pub fn builder() -> SchedulerBuilder {
    SchedulerBuilder::new()
  }

  /// Schedules an instance of the job registered as `name`.
  ///
  /// For recurrent jobs the payload and options are ignored and the job's single
  /// live instance is returned as [`ScheduleOutcome::Recurring`].
  ///
  /// # Errors
  ///
  /// - [`ScheduleError::UnknownJob`] if `name` is not registered.
  /// - [`ScheduleError::DuplicateSchedule`] if the uniqueness key is taken.
  /// - [`ScheduleError::InvalidRunAt`] for an unparseable `run_at` phrase.
  /// - [`ScheduleError::Store`] on backend failure.
  pub async fn schedule(
    &self,
    name: &str,
    data: JobData,
    options: ScheduleOptions,
  ) -> Result<ScheduleOutcome, ScheduleError> {
    self.scheduler.schedule(name, data, options).await
  }

  /// Same as [`schedule`](Self::schedule) for any serializable payload.
  pub async fn schedule_serialized<T: Serialize>(
    &self,
    name: &str,
    data: &T,
    options: ScheduleOptions,
  ) -> Result<ScheduleOutcome, ScheduleError> {
    let data = serde_json::to_value(data)?;
    self.schedule(name, data, options).await
  }

  /// # Errors
  /// [`QueryError::InstanceNotFound`] if no instance has this ID.
  pub async fn get_instance(&self, instance_id: InstanceId) -> Result<JobInstance, QueryError> {
    self
      .store
      .get_instance(instance_id)
      .await?
      .ok_or(QueryError::InstanceNotFound(instance_id))
  }

  /// Instances in `next_run_at` order, optionally only those of one job.
  pub async fn list_instances(&self, job_name: Option<&str>) -> Result<Vec<JobInstance>, QueryError> {
    let filter = match job_name {
      Some(name) => InstanceFilter::new().job_name(name),
      None => InstanceFilter::new(),
    };
    let instances: Vec<JobInstance> = self
      .store
      .find_instances(filter, InstanceSort::NextRunAt, None)
      .try_collect()
      .await?;
    Ok(instances)
  }

  /// Frees a uniqueness key so it can be scheduled again. Returns `true` if a
  /// marker was removed.
  ///
  /// # Errors
  /// [`QueryError::ReservedKey`] for keys guarding recurrent jobs (`recurrent:<name>`).
  pub async fn release_uniqueness(&self, key: &str) -> Result<bool, QueryError> {
    self.scheduler.release_uniqueness(key).await
  }

  /// Receives a [`TerminalFailure`] each time one of this engine's workers marks
  /// an instance `Failed`.
  pub fn subscribe_failures(&self) -> broadcast::Receiver<TerminalFailure> {
    self.failure_tx.subscribe()
  }

  /// Retrieves a snapshot of the engine's metrics.
  pub fn get_metrics_snapshot(&self) -> MetricsSnapshot {
    self.metrics.snapshot()
  }

  pub fn holder_id(&self) -> &str {
    &self.holder_id
  }

  pub fn registry(&self) -> &JobRegistry {
    &self.registry
  }

  pub fn store(&self) -> Arc<dyn JobStore> {
    self.store.clone()
  }

  /// Stops leasing new instances, waits for in-flight runs to finish, then
  /// terminates the Dispatcher and Worker tasks.
  ///
  /// # Errors
  ///
  /// - [`ShutdownError::SignalFailed`]: Failed to send the shutdown signal.
  /// - [`ShutdownError::Timeout`]: Waiting for tasks exceeded the timeout.
  /// - [`ShutdownError::TaskPanic`]: A worker or dispatcher task panicked.
  pub async fn shutdown_graceful(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    info!("Initiating graceful shutdown...");
    self
      .shutdown_tx
      .send(Some(ShutdownMode::Graceful))
      .map_err(|_| ShutdownError::SignalFailed)?;
    self.await_shutdown(timeout).await
  }

  /// Aborts in-flight runs and terminates all tasks. Leases held by aborted
  /// runs are not released; they expire after their lock lifetime.
  ///
  /// # Errors
  ///
  /// Same as [`shutdown_graceful`](Self::shutdown_graceful).
  pub async fn shutdown_force(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    info!("Initiating forced shutdown...");
    self
      .shutdown_tx
      .send(Some(ShutdownMode::Force))
      .map_err(|_| ShutdownError::SignalFailed)?;
    self.await_shutdown(timeout).await
  }

  /// Helper to wait for task handles during shutdown.
  async fn await_shutdown(&self, timeout_duration: Option<Duration>) -> Result<(), ShutdownError> {
    let dispatcher_handle = self.dispatcher_handle.lock().await.take();
    let worker_handles = {
      let mut guard = self.worker_handles.lock().await;
      std::mem::take(&mut *guard)
    };

    let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(1 + worker_handles.len());
    match dispatcher_handle {
      Some(handle) => tasks.push(handle),
      None => warn!("Dispatcher handle missing during shutdown wait."),
    }
    tasks.extend(worker_handles);

    if tasks.is_empty() {
      warn!("No tasks found to await during shutdown.");
      return Ok(());
    }

    let join_all_fut = try_join_all(tasks);

    let result = match timeout_duration {
      Some(timeout) => match tokio::time::timeout(timeout, join_all_fut).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(join_err)) => {
          error!("A task panicked during shutdown: {:?}", join_err);
          Err(ShutdownError::TaskPanic)
        }
        Err(_) => {
          error!("Shutdown timed out after {:?}", timeout);
          Err(ShutdownError::Timeout)
        }
      },
      None => match join_all_fut.await {
        Ok(_) => Ok(()),
        Err(join_err) => {
          error!("A task panicked during shutdown (no timeout): {:?}", join_err);
          Err(ShutdownError::TaskPanic)
        }
      },
    };

    if result.is_ok() {
      info!("All tasks joined successfully.");
    }
    result
  }
}
