//! Run lifecycle notifications.
//!
//! The executor calls the configured [`Monitor`] synchronously from the run's
//! own task. A panicking hook is caught and logged; it never aborts the run.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::RunError;
use crate::job::{JobId, RunId};

/// Why a dispatch became a run or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Trigger {
  /// The job's schedule came due.
  Scheduled,
  /// Requested through `run_now`.
  Manual,
}

/// Why a dispatched trigger did not execute.
///
/// All of these are expected operating conditions, reported for
/// observability only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SkipReason {
  /// Singleton job in skip mode with a run already in flight.
  SingletonBusy,
  /// Singleton job in queue mode that already has a rerun queued.
  AlreadyQueued,
  /// The distributed lock is held by another instance, or the backend failed
  /// or timed out.
  LockUnavailable,
  /// The elector reports another instance as leader.
  NotLeader,
  /// The admission queue in front of the concurrency cap was full.
  BackpressureDropped,
  /// The job was removed while this trigger waited.
  JobRemoved,
  /// The scheduler began shutting down before the run started.
  ShuttingDown,
}

impl SkipReason {
  pub fn as_str(&self) -> &'static str {
    match self {
      SkipReason::SingletonBusy => "singleton_busy",
      SkipReason::AlreadyQueued => "already_queued",
      SkipReason::LockUnavailable => "lock_unavailable",
      SkipReason::NotLeader => "not_leader",
      SkipReason::BackpressureDropped => "backpressure_dropped",
      SkipReason::JobRemoved => "job_removed",
      SkipReason::ShuttingDown => "shutting_down",
    }
  }
}

impl fmt::Display for SkipReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Identifies one dispatch of a job in monitor callbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
  pub job_id: JobId,
  pub job_name: String,
  pub run_id: RunId,
  /// The due instant the dispatch was made for.
  pub scheduled_for: DateTime<Utc>,
  /// When the event was raised, by the scheduler's clock.
  pub timestamp: DateTime<Utc>,
  pub trigger: Trigger,
}

/// Hook notified about every dispatch outcome. All methods default to no-ops.
pub trait Monitor: Send + Sync + 'static {
  fn on_job_start(&self, _event: &JobEvent) {}

  fn on_job_success(&self, _event: &JobEvent, _duration: Duration) {}

  fn on_job_failure(&self, _event: &JobEvent, _error: &RunError, _duration: Duration) {}

  fn on_job_skipped(&self, _event: &JobEvent, _reason: SkipReason) {}
}

impl<M: Monitor + ?Sized> Monitor for Arc<M> {
  fn on_job_start(&self, event: &JobEvent) {
    (**self).on_job_start(event)
  }

  fn on_job_success(&self, event: &JobEvent, duration: Duration) {
    (**self).on_job_success(event, duration)
  }

  fn on_job_failure(&self, event: &JobEvent, error: &RunError, duration: Duration) {
    (**self).on_job_failure(event, error, duration)
  }

  fn on_job_skipped(&self, event: &JobEvent, reason: SkipReason) {
    (**self).on_job_skipped(event, reason)
  }
}

/// The default monitor. Ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMonitor;

impl Monitor for NoopMonitor {}

/// Invokes one monitor callback, containing any panic it raises.
pub(crate) fn notify(monitor: &dyn Monitor, hook: &'static str, call: impl FnOnce(&dyn Monitor)) {
  if panic::catch_unwind(AssertUnwindSafe(|| call(monitor))).is_err() {
    warn!(hook, "Monitor hook panicked; ignoring.");
  }
}
