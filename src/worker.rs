use crate::command::{Dispatch, ExecutionOutcome, ShutdownMode, TerminalFailure, WorkerOutcome};
use crate::error::LeaseError;
use crate::job::{InstanceStatus, JobDefinition, JobInfo, JobInstance, Lease, RunResult, WorkerId};
use crate::lease::LeaseManager;
use crate::metrics::SchedulerMetrics;
use crate::persist::ResultPersister;
use crate::retry::{RetryDecision, RetryManager};
use crate::store::InstanceUpdate;

#[cfg(feature = "job_context")]
use crate::job::context::{JobContext, CURRENT_JOB_CONTEXT};

use std::any::Any;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinError;
use tracing::{debug, error, info, trace, warn, Instrument};

/// Shortest renewal period, for very short lock lifetimes.
const MIN_RENEW_PERIOD: Duration = Duration::from_millis(10);

/// Represents a worker task responsible for executing leased instances.
///
/// Workers wait for dispatches from the Dispatcher via a shared channel, run the
/// job's function while renewing its lease, handle panics, write the completion
/// state under the lease token, and report back to the Dispatcher.
pub(crate) struct Worker {
  id: WorkerId,
  lease_manager: LeaseManager,
  retry_manager: RetryManager,
  persister: ResultPersister,
  metrics: SchedulerMetrics,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  // Channel to report finished dispatches back to the Dispatcher
  worker_outcome_tx: mpsc::Sender<WorkerOutcome>,
  // Shared channel to receive dispatches
  job_dispatch_rx: async_channel::Receiver<Dispatch>,
  failure_tx: broadcast::Sender<TerminalFailure>,
}

/// What the run itself produced, before bookkeeping.
enum RunEnd {
  Finished(Result<RunResult, JoinError>),
  Aborted,
}

impl Worker {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    id: WorkerId,
    lease_manager: LeaseManager,
    retry_manager: RetryManager,
    persister: ResultPersister,
    metrics: SchedulerMetrics,
    shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
    worker_outcome_tx: mpsc::Sender<WorkerOutcome>,
    job_dispatch_rx: async_channel::Receiver<Dispatch>,
    failure_tx: broadcast::Sender<TerminalFailure>,
  ) -> Self {
    Self {
      id,
      lease_manager,
      retry_manager,
      persister,
      metrics,
      shutdown_rx,
      worker_outcome_tx,
      job_dispatch_rx,
      failure_tx,
    }
  }

  /// Runs the main loop for the worker task.
  ///
  /// A graceful shutdown lets the worker drain the dispatch channel until the
  /// Dispatcher closes it; a forced shutdown makes it exit at once.
  pub async fn run(&mut self) {
    info!(worker_id = self.id, "Worker started. Waiting for jobs...");

    loop {
      if self.is_forced_shutdown() {
        break;
      }

      tokio::select! {
          biased;

          Ok(()) = self.shutdown_rx.changed() => {
              if self.is_forced_shutdown() {
                  info!(worker_id = self.id, "Worker received forced shutdown signal.");
                  break;
              }
              trace!(worker_id = self.id, "Graceful shutdown signalled, draining dispatches.");
          }

          result = self.job_dispatch_rx.recv() => {
              match result {
                Ok(dispatch) => {
                  let instance_id = dispatch.instance.id;
                  let job_name = dispatch.instance.job_name.clone();
                  debug!(worker_id = self.id, %instance_id, %job_name, "Received dispatch.");

                  let job_span = tracing::span!(
                      tracing::Level::INFO,
                      "job_exec",
                      worker_id = self.id,
                      %instance_id,
                      job_name = job_name.as_str()
                  );

                  let outcome = self.execute_and_handle(dispatch).instrument(job_span).await;

                  let message = WorkerOutcome { instance_id, job_name, outcome };
                  if self.worker_outcome_tx.send(message).await.is_err() {
                      warn!(worker_id = self.id, %instance_id, "Failed to send outcome to dispatcher (engine likely shut down).");
                  }
                }
                Err(_) => {
                  info!(worker_id = self.id, "Dispatch channel closed. Worker exiting.");
                  break;
                }
              }
          }
      }
    }

    info!(worker_id = self.id, "Worker task shutting down.");
  }

  fn is_forced_shutdown(&self) -> bool {
    *self.shutdown_rx.borrow() == Some(ShutdownMode::Force)
  }

  async fn execute_and_handle(&mut self, dispatch: Dispatch) -> ExecutionOutcome {
    let Dispatch {
      instance,
      lease,
      definition,
    } = dispatch;

    // Mark running under our lease; bail out quietly if it is already gone.
    let started = match self
      .lease_manager
      .update_held(instance.id, &lease, InstanceUpdate::new().last_run_at(Utc::now()))
      .await
    {
      Ok(started) => started,
      Err(LeaseError::LeaseLost(_)) => {
        debug!("Lease lost before execution started, skipping.");
        return ExecutionOutcome::LeaseLost;
      }
      Err(e) => {
        error!(error = %e, "Failed to mark instance as running, skipping.");
        return ExecutionOutcome::LeaseLost;
      }
    };

    let active = self.metrics.workers_active_current.fetch_add(1, AtomicOrdering::Relaxed) + 1;
    trace!(active_workers = active, "Incremented active worker count.");

    info!(times_executed = started.fail_count, "Starting job execution.");
    let start_instant = Instant::now();
    let run_end = self.execute_job_logic(&started, &lease, &definition).await;
    let duration = start_instant.elapsed();
    self.metrics.job_execution_duration.record(duration);

    let outcome = match run_end {
      RunEnd::Aborted => ExecutionOutcome::Aborted,
      RunEnd::Finished(result) => self.handle_job_result(&started, &lease, &definition, result).await,
    };

    self.metrics.workers_active_current.fetch_sub(1, AtomicOrdering::Relaxed);
    info!(
      duration_ms = duration.as_millis(),
      outcome = ?outcome,
      "Finished job execution."
    );
    outcome
  }

  /// Runs the job function in its own task, renewing the lease until it ends.
  async fn execute_job_logic(
    &mut self,
    instance: &JobInstance,
    lease: &Lease,
    definition: &Arc<JobDefinition>,
  ) -> RunEnd {
    let info = JobInfo::compose(instance, lease, definition);
    let future_to_run = (definition.run_fn)(instance.data.clone(), info);

    #[cfg(feature = "job_context")]
    let mut task = {
      let context = JobContext {
        instance_id: instance.id,
        job_name: instance.job_name.clone(),
        times_executed: instance.fail_count,
        lease_token: lease.token,
      };
      tokio::spawn(CURRENT_JOB_CONTEXT.scope(context, future_to_run))
    };
    #[cfg(not(feature = "job_context"))]
    let mut task = tokio::spawn(future_to_run);

    let renew_period = (definition.lock_lifetime / 2).max(MIN_RENEW_PERIOD);
    let mut renew_timer =
      tokio::time::interval_at(tokio::time::Instant::now() + renew_period, renew_period);
    let mut current_lease = lease.clone();
    let mut lease_lost = false;

    loop {
      tokio::select! {
          biased;

          Ok(()) = self.shutdown_rx.changed() => {
              if self.is_forced_shutdown() {
                  warn!("Forced shutdown, aborting running job. Its lease will expire.");
                  task.abort();
                  return RunEnd::Aborted;
              }
          }

          joined = &mut task => {
              return RunEnd::Finished(joined);
          }

          _ = renew_timer.tick(), if !lease_lost => {
              match self
                .lease_manager
                .renew(instance.id, &current_lease, definition.lock_lifetime, Utc::now())
                .await
              {
                Ok(renewed) => current_lease = renewed,
                Err(LeaseError::LeaseLost(_)) => {
                  warn!("Lease lost while running; the outcome of this run will be discarded.");
                  lease_lost = true;
                }
                Err(e) => warn!(error = %e, "Lease renewal failed, will retry."),
              }
          }
      }
    }
  }

  /// Writes the completion state under the lease token and emits notifications.
  async fn handle_job_result(
    &self,
    instance: &JobInstance,
    lease: &Lease,
    definition: &JobDefinition,
    result: Result<RunResult, JoinError>,
  ) -> ExecutionOutcome {
    let now = Utc::now();

    let (update, outcome, decision, persisted) = match result {
      Ok(Ok(value)) => {
        SchedulerMetrics::incr(&self.metrics.jobs_succeeded);
        let mut update = InstanceUpdate::new().last_finished_at(now);
        if definition.is_recurrent() {
          update = match definition.next_recurrence(now) {
            Some(next_run_at) => {
              debug!(next_run = %next_run_at, "Job succeeded, scheduling next run.");
              update.next_run_at(next_run_at).fail_count(0).fail_reason(None)
            }
            None => {
              info!("Job succeeded and has no further scheduled runs.");
              update.status(InstanceStatus::Completed)
            }
          };
        } else {
          update = update.status(InstanceStatus::Completed);
        }
        let persisted = self.persister.attach(definition, &mut update, value);
        (update, ExecutionOutcome::Succeeded, None, persisted)
      }
      Ok(Err(run_error)) => {
        SchedulerMetrics::incr(&self.metrics.jobs_failed);
        let reason = run_error.to_string();
        warn!(error = %reason, "Job returned an error.");
        let decision = self.retry_manager.decide(definition, instance, now);
        let update = decision.to_update(&reason, now);
        (update, ExecutionOutcome::Failed, Some((decision, reason)), false)
      }
      Err(join_error) => {
        let (reason, outcome) = if join_error.is_panic() {
          SchedulerMetrics::incr(&self.metrics.jobs_panicked);
          let reason = format!("panicked: {}", panic_message(join_error.into_panic()));
          error!(error = %reason, "Job function panicked!");
          (reason, ExecutionOutcome::Panicked)
        } else {
          SchedulerMetrics::incr(&self.metrics.jobs_failed);
          warn!("Job task was cancelled during execution.");
          ("cancelled".to_string(), ExecutionOutcome::Failed)
        };
        let decision = self.retry_manager.decide(definition, instance, now);
        let update = decision.to_update(&reason, now);
        (update, outcome, Some((decision, reason)), false)
      }
    };

    match self.lease_manager.release_with(instance.id, lease, update).await {
      Ok(updated) => {
        if persisted {
          self.persister.committed(&updated);
        }
        if let Some((RetryDecision::Exhausted { fail_count }, reason)) = decision {
          let notice = TerminalFailure {
            instance_id: updated.id,
            job_name: updated.job_name.clone(),
            fail_count,
            reason,
          };
          if self.failure_tx.send(notice).is_err() {
            trace!("No subscribers for terminal failure notification.");
          }
        }
        outcome
      }
      Err(LeaseError::LeaseLost(_)) => {
        warn!(outcome = ?outcome, "Lease lost before completion; discarding outcome.");
        ExecutionOutcome::LeaseLost
      }
      Err(e) => {
        error!(error = %e, "Failed to record completion; the lease will expire and the run repeat.");
        outcome
      }
    }
  }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    message.to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "unknown panic payload".to_string()
  }
}
