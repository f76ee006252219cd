use crate::job::JobId;

use thiserror::Error;

/// Errors that can occur while building a scheduler with `SchedulerBuilder`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("Maximum concurrent jobs (`max_concurrent_jobs`) must be greater than zero")]
  ZeroConcurrency,
  #[error("No Tokio runtime is available to spawn the scheduler on")]
  NoRuntime,
}

// --- Scheduler API Errors ---

/// Errors returned synchronously by the mutating scheduler API
/// (`add_job`, `remove_job_strict`, `update_job`, `run_now`, `start`, `stop`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
  /// The job definition is malformed and was rejected before registration.
  #[error("Invalid schedule: {0}")]
  InvalidSchedule(String),
  /// An explicit job identifier collides with a job that is already registered.
  #[error("A job with identifier {0} is already registered")]
  DuplicateIdentifier(JobId),
  #[error("Job {0} not found")]
  NotFound(JobId),
  /// The scheduler is shutting down or has terminated.
  #[error("Scheduler is closed")]
  SchedulerClosed,
  #[error("Scheduler did not respond (dispatch loop exited unexpectedly)")]
  ResponseFailed,
}

// --- Shutdown Errors ---

/// Errors related to [`ShiftKeeper::shutdown`](crate::ShiftKeeper::shutdown).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Shutdown already in progress or completed")]
  AlreadyShuttingDown,
  /// Some executions did not finish in time. Their lock handles were released
  /// and their tasks aborted at the next await point.
  #[error("Timed out waiting for in-flight runs; {abandoned} run(s) abandoned")]
  Timeout { abandoned: usize },
  #[error("The dispatch loop panicked during shutdown")]
  TaskPanic,
}

// --- Per-run Errors ---

/// The error outcome of a single job run.
///
/// Run errors never reach the dispatch loop. They are passed to the
/// [`Monitor`](crate::monitor::Monitor) and recorded as the job's last error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RunError {
  /// The task returned `Err`.
  #[error("Task failed: {0}")]
  TaskError(String),
  /// The task panicked. Holds the panic message when it was a string.
  #[error("Task panicked: {0}")]
  TaskPanic(String),
  /// The run was still executing when shutdown timed out.
  #[error("Run abandoned during shutdown")]
  Abandoned,
}

// --- Locker Errors ---

/// Failure reported by a [`Locker`](crate::locker::Locker) or
/// [`Elector`](crate::locker::Elector) backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
  #[error("Lock backend error: {0}")]
  Backend(String),
}
