use crate::command::{Dispatch, ShutdownMode, WorkerOutcome};
use crate::error::LeaseError;
use crate::job::{InstanceStatus, JobInstance};
use crate::lease::LeaseManager;
use crate::registry::JobRegistry;
use crate::scheduler::Scheduler;
use crate::store::{InstanceFilter, InstanceSort, JobStore, LeaseFilter};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::TryStreamExt;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

/// Wiring handed to the Dispatcher task by the builder.
pub(crate) struct DispatcherState {
  pub store: Arc<dyn JobStore>,
  pub registry: Arc<JobRegistry>,
  pub scheduler: Arc<Scheduler>,
  pub lease_manager: LeaseManager,
  pub shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  pub worker_outcome_rx: mpsc::Receiver<WorkerOutcome>,
  pub job_dispatch_tx: async_channel::Sender<Dispatch>,
  pub wake: Arc<Notify>,
  pub max_workers: usize,
  pub poll_interval: Duration,
  pub batch_size: usize,
}

/// The polling task that turns due instances into leased dispatches.
///
/// Concurrency is tracked here per job name for this process only; lock limits
/// are enforced store-wide by the lease manager.
pub(crate) struct Dispatcher {
  state: DispatcherState,
  /// Dispatched-but-unfinished runs per job name.
  running: HashMap<String, usize>,
  in_flight: usize,
  recurrent_seeded: bool,
  shutting_down: Option<ShutdownMode>,
}

impl Dispatcher {
  pub fn new(state: DispatcherState) -> Self {
    Self {
      state,
      running: HashMap::new(),
      in_flight: 0,
      recurrent_seeded: false,
      shutting_down: None,
    }
  }

  /// Runs the main event loop for the Dispatcher.
  pub async fn run(&mut self) {
    info!(
      holder_id = self.state.lease_manager.holder_id(),
      max_workers = self.state.max_workers,
      poll_interval_ms = self.state.poll_interval.as_millis(),
      "Dispatcher started."
    );

    let mut ticker = tokio::time::interval(self.state.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
          biased;

          // --- Shutdown Check ---
          Ok(()) = self.state.shutdown_rx.changed() => {
              let mode = *self.state.shutdown_rx.borrow();
              if mode.is_some() && mode != self.shutting_down {
                  self.shutting_down = mode;
                  info!(?mode, in_flight = self.in_flight, "Dispatcher received shutdown signal.");
                  if mode == Some(ShutdownMode::Force) {
                      break;
                  }
              }
          }

          // --- Worker Outcome Processing ---
          Some(outcome) = self.state.worker_outcome_rx.recv() => {
              trace!(?outcome, "Received worker outcome.");
              self.handle_worker_outcome(outcome);
              if self.shutting_down.is_none() {
                  self.poll_once().await;
              }
          }

          // --- Early wakeup from schedule() ---
          _ = self.state.wake.notified(), if self.shutting_down.is_none() => {
              trace!("Woken early by a due schedule.");
              self.poll_once().await;
          }

          // --- Poll Tick ---
          _ = ticker.tick(), if self.shutting_down.is_none() => {
              self.poll_once().await;
          }

          else => {
              warn!("All dispatcher event sources closed. Exiting.");
              break;
          }
      }

      if self.shutting_down == Some(ShutdownMode::Graceful) {
        if self.in_flight == 0 {
          info!("Graceful shutdown: no runs in flight. Dispatcher exiting.");
          break;
        }
        trace!(in_flight = self.in_flight, "Graceful shutdown: waiting for in-flight runs.");
      }
    }

    info!("Dispatcher task shutting down.");
    // Signals any waiting workers that no more dispatches are coming.
    self.state.job_dispatch_tx.close();
  }

  fn handle_worker_outcome(&mut self, outcome: WorkerOutcome) {
    self.in_flight = self.in_flight.saturating_sub(1);
    if let Some(count) = self.running.get_mut(&outcome.job_name) {
      *count = count.saturating_sub(1);
      if *count == 0 {
        self.running.remove(&outcome.job_name);
      }
    }
    debug!(
      instance_id = %outcome.instance_id,
      job_name = %outcome.job_name,
      outcome = ?outcome.outcome,
      in_flight = self.in_flight,
      "Dispatch slot freed."
    );
  }

  /// Seeds recurrent instances once, then leases and dispatches due candidates.
  /// Store failures abandon the tick; the next tick starts over.
  async fn poll_once(&mut self) {
    if !self.recurrent_seeded {
      self.seed_recurrent().await;
    }
    if self.in_flight >= self.state.max_workers {
      trace!(in_flight = self.in_flight, "Worker pool full, skipping poll.");
      return;
    }

    let now = Utc::now();
    let filter = InstanceFilter::new()
      .status(InstanceStatus::Pending)
      .due_before(now)
      .lease(LeaseFilter::Free { now });
    let candidates: Vec<JobInstance> = match self
      .state
      .store
      .find_instances(filter, InstanceSort::PriorityThenDue, Some(self.state.batch_size))
      .try_collect()
      .await
    {
      Ok(candidates) => candidates,
      Err(e) => {
        error!(error = %e, "Failed to query due instances, abandoning tick.");
        return;
      }
    };
    trace!(candidates = candidates.len(), "Polled due instances.");

    for instance in candidates {
      if self.in_flight >= self.state.max_workers {
        break;
      }

      let definition = match self.state.registry.lookup(&instance.job_name) {
        Ok(definition) => definition,
        Err(_) => {
          trace!(instance_id = %instance.id, job_name = %instance.job_name, "No local definition, skipping.");
          continue;
        }
      };

      let running = self.running.get(&instance.job_name).copied().unwrap_or(0);
      if running >= definition.concurrency {
        trace!(job_name = %instance.job_name, running, "Concurrency limit reached, skipping.");
        continue;
      }

      let lease = match self
        .state
        .lease_manager
        .try_acquire(&instance, definition.lease_policy(), now)
        .await
      {
        Ok(lease) => lease,
        Err(e) if e.is_denied() => {
          trace!(instance_id = %instance.id, reason = %e, "Lease not granted.");
          continue;
        }
        Err(e) => {
          error!(instance_id = %instance.id, error = %e, "Lease request failed, abandoning tick.");
          return;
        }
      };

      let instance_id = instance.id;
      let job_name = instance.job_name.clone();
      *self.running.entry(job_name.clone()).or_insert(0) += 1;
      self.in_flight += 1;

      let dispatch = Dispatch {
        instance,
        lease: lease.clone(),
        definition,
      };
      if self.state.job_dispatch_tx.send(dispatch).await.is_err() {
        error!(%instance_id, "Dispatch channel closed; releasing lease.");
        self.handle_worker_outcome(WorkerOutcome {
          instance_id,
          job_name,
          outcome: crate::command::ExecutionOutcome::Aborted,
        });
        if let Err(e) = self.state.lease_manager.release(instance_id, &lease).await {
          match e {
            LeaseError::LeaseLost(_) => {}
            other => warn!(%instance_id, error = %other, "Failed to release undispatched lease."),
          }
        }
        return;
      }
      debug!(%instance_id, %job_name, token = %lease.token, "Dispatched instance.");
    }
  }

  async fn seed_recurrent(&mut self) {
    let mut all_ok = true;
    for definition in self.state.registry.recurrent() {
      if let Err(e) = self.state.scheduler.ensure_recurring(definition).await {
        error!(job_name = %definition.name(), error = %e, "Failed to seed recurrent instance.");
        all_ok = false;
      }
    }
    self.recurrent_seeded = all_ok;
  }
}
