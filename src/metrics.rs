use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// --- Simple Histogram Implementation ---

/// A basic concurrent histogram storing count and sum.
///
/// Suitable for mean latency tracking without percentile information.
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

/// Atomic counters shared by the dispatch loop and the executor.
///
/// Cloning only clones the `Arc`s.
#[derive(Debug, Clone, Default)]
pub struct SchedulerMetrics {
  // --- Counters ---
  pub jobs_added: Arc<AtomicUsize>,
  pub jobs_removed: Arc<AtomicUsize>,
  pub jobs_updated: Arc<AtomicUsize>,
  /// Jobs that left the scheduler on their own: exhausted schedule or `max_runs` reached.
  pub jobs_retired: Arc<AtomicUsize>,
  /// Triggers handed to the executor (scheduled and manual).
  pub runs_dispatched: Arc<AtomicUsize>,
  pub runs_started: Arc<AtomicUsize>,
  pub runs_succeeded: Arc<AtomicUsize>,
  /// Runs whose task returned `Err`.
  pub runs_failed: Arc<AtomicUsize>,
  pub runs_panicked: Arc<AtomicUsize>,
  /// Runs still executing when shutdown timed out.
  pub runs_abandoned: Arc<AtomicUsize>,
  /// Triggers skipped by singleton policy (busy or already queued).
  pub runs_skipped_singleton: Arc<AtomicUsize>,
  /// Triggers skipped because the lock was unavailable or this instance is not leader.
  pub runs_skipped_lock: Arc<AtomicUsize>,
  pub runs_dropped_backpressure: Arc<AtomicUsize>,

  // --- Gauges ---
  pub jobs_scheduled_current: Arc<AtomicUsize>,
  pub runs_in_flight_current: Arc<AtomicUsize>,
  /// Triggers waiting in the admission queue for a concurrency permit.
  pub runs_waiting_current: Arc<AtomicUsize>,

  // --- Histograms ---
  pub run_duration: Arc<SimpleHistogram>,
  /// Delay between a run's due instant and its dispatch.
  pub dispatch_lag: Arc<SimpleHistogram>,
}

impl SchedulerMetrics {
  /// Creates a new `SchedulerMetrics` instance with all counters at zero.
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn incr(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn decr(gauge: &AtomicUsize) {
    let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
      Some(v.saturating_sub(1))
    });
  }

  /// Creates a point-in-time snapshot of the current metric values.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;

    MetricsSnapshot {
      jobs_added: self.jobs_added.load(order),
      jobs_removed: self.jobs_removed.load(order),
      jobs_updated: self.jobs_updated.load(order),
      jobs_retired: self.jobs_retired.load(order),
      runs_dispatched: self.runs_dispatched.load(order),
      runs_started: self.runs_started.load(order),
      runs_succeeded: self.runs_succeeded.load(order),
      runs_failed: self.runs_failed.load(order),
      runs_panicked: self.runs_panicked.load(order),
      runs_abandoned: self.runs_abandoned.load(order),
      runs_skipped_singleton: self.runs_skipped_singleton.load(order),
      runs_skipped_lock: self.runs_skipped_lock.load(order),
      runs_dropped_backpressure: self.runs_dropped_backpressure.load(order),
      jobs_scheduled_current: self.jobs_scheduled_current.load(order),
      runs_in_flight_current: self.runs_in_flight_current.load(order),
      runs_waiting_current: self.runs_waiting_current.load(order),
      run_duration_count: self.run_duration.get_count(),
      run_duration_sum_micros: self.run_duration.get_sum_micros(),
      dispatch_lag_count: self.dispatch_lag.get_count(),
      dispatch_lag_sum_micros: self.dispatch_lag.get_sum_micros(),
    }
  }
}

// --- Metrics Snapshot Struct (Public Data) ---

/// A snapshot of the scheduler's metrics at a specific point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetricsSnapshot {
  // Counters
  pub jobs_added: usize,
  pub jobs_removed: usize,
  pub jobs_updated: usize,
  pub jobs_retired: usize,
  pub runs_dispatched: usize,
  pub runs_started: usize,
  pub runs_succeeded: usize,
  pub runs_failed: usize,
  pub runs_panicked: usize,
  pub runs_abandoned: usize,
  pub runs_skipped_singleton: usize,
  pub runs_skipped_lock: usize,
  pub runs_dropped_backpressure: usize,
  // Gauges
  pub jobs_scheduled_current: usize,
  pub runs_in_flight_current: usize,
  pub runs_waiting_current: usize,
  // Histogram Data
  pub run_duration_count: usize,
  pub run_duration_sum_micros: usize,
  pub dispatch_lag_count: usize,
  pub dispatch_lag_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Mean run duration in microseconds, or `None` if no run completed.
  pub fn mean_run_duration_micros(&self) -> Option<f64> {
    if self.run_duration_count == 0 {
      None
    } else {
      Some(self.run_duration_sum_micros as f64 / self.run_duration_count as f64)
    }
  }

  pub fn mean_run_duration(&self) -> Option<Duration> {
    self
      .mean_run_duration_micros()
      .map(|micros| Duration::from_micros(micros as u64))
  }

  /// Mean delay between due instant and dispatch, or `None` if nothing was dispatched.
  pub fn mean_dispatch_lag(&self) -> Option<Duration> {
    if self.dispatch_lag_count == 0 {
      None
    } else {
      Some(Duration::from_micros(
        (self.dispatch_lag_sum_micros / self.dispatch_lag_count) as u64,
      ))
    }
  }
}
