use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// --- Simple Histogram Implementation ---

/// A basic concurrent histogram storing count and sum.
///
/// Suitable for simple latency tracking without percentile information.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl SimpleHistogram {
  /// Records a duration observation in the histogram.
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  /// Gets the total number of observations recorded.
  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  /// Gets the total sum of durations recorded (in microseconds).
  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

// --- Main Metrics Struct (Internal State) ---

/// Engine counters shared by the scheduler, dispatcher, lease manager and workers.
///
/// Cloning only clones the `Arc`s; every clone observes the same values.
/// Counts are per process even when several engines share one store.
#[derive(Debug, Clone, Default)]
pub struct SchedulerMetrics {
  // --- Counters ---
  /// Instances inserted by `schedule` (including seeded recurrent instances).
  pub instances_scheduled: Arc<AtomicUsize>,
  /// `schedule` calls that hit an existing uniqueness key.
  pub schedules_deduplicated: Arc<AtomicUsize>,
  pub leases_granted: Arc<AtomicUsize>,
  /// Lease requests turned down by lock limit or contention.
  pub leases_denied: Arc<AtomicUsize>,
  /// Leases granted over an expired lease held by someone else.
  pub leases_reclaimed: Arc<AtomicUsize>,
  /// Renewals or completions that found the lease gone.
  pub leases_lost: Arc<AtomicUsize>,
  pub jobs_succeeded: Arc<AtomicUsize>,
  /// Executions that returned an error (panics counted separately).
  pub jobs_failed: Arc<AtomicUsize>,
  pub jobs_panicked: Arc<AtomicUsize>,
  pub jobs_retried: Arc<AtomicUsize>,
  pub jobs_permanently_failed: Arc<AtomicUsize>,
  pub results_persisted: Arc<AtomicUsize>,

  // --- Gauges ---
  /// Current number of workers actively executing a job.
  pub workers_active_current: Arc<AtomicUsize>,

  // --- Histograms ---
  /// Execution duration of run functions.
  pub job_execution_duration: Arc<SimpleHistogram>,
}

impl SchedulerMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn incr(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  /// Creates a point-in-time snapshot of the current metric values.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;

    MetricsSnapshot {
      instances_scheduled: self.instances_scheduled.load(order),
      schedules_deduplicated: self.schedules_deduplicated.load(order),
      leases_granted: self.leases_granted.load(order),
      leases_denied: self.leases_denied.load(order),
      leases_reclaimed: self.leases_reclaimed.load(order),
      leases_lost: self.leases_lost.load(order),
      jobs_succeeded: self.jobs_succeeded.load(order),
      jobs_failed: self.jobs_failed.load(order),
      jobs_panicked: self.jobs_panicked.load(order),
      jobs_retried: self.jobs_retried.load(order),
      jobs_permanently_failed: self.jobs_permanently_failed.load(order),
      results_persisted: self.results_persisted.load(order),
      workers_active_current: self.workers_active_current.load(order),
      job_execution_duration_count: self.job_execution_duration.get_count(),
      job_execution_duration_sum_micros: self.job_execution_duration.get_sum_micros(),
    }
  }
}

// --- Metrics Snapshot Struct (Public Data) ---

/// A snapshot of the engine's metrics at a specific point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
  // Counters
  pub instances_scheduled: usize,
  pub schedules_deduplicated: usize,
  pub leases_granted: usize,
  pub leases_denied: usize,
  pub leases_reclaimed: usize,
  pub leases_lost: usize,
  pub jobs_succeeded: usize,
  pub jobs_failed: usize,
  pub jobs_panicked: usize,
  pub jobs_retried: usize,
  pub jobs_permanently_failed: usize,
  pub results_persisted: usize,
  // Gauges
  pub workers_active_current: usize,
  // Histogram Data
  pub job_execution_duration_count: usize,
  pub job_execution_duration_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Mean job execution duration in microseconds, `None` if nothing ran yet.
  pub fn mean_execution_duration_micros(&self) -> Option<f64> {
    if self.job_execution_duration_count == 0 {
      None
    } else {
      Some(self.job_execution_duration_sum_micros as f64 / self.job_execution_duration_count as f64)
    }
  }

  pub fn mean_execution_duration(&self) -> Option<Duration> {
    self
      .mean_execution_duration_micros()
      .map(|micros| Duration::from_micros(micros as u64))
  }

  /// Executions that ended in any way (success, error or panic).
  pub fn executions_finished(&self) -> usize {
    self.jobs_succeeded + self.jobs_failed + self.jobs_panicked
  }
}
