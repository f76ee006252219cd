use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::{JobId, RunId};
use crate::monitor::Trigger;

/// Information about the run currently executing, available to the task via
/// a task-local.
///
/// Read it with [`try_get_current_job_context`] or the `job_context!()` macro.
#[derive(Clone, Debug)]
pub struct JobContext {
  pub job_id: JobId,
  /// Unique per execution attempt.
  pub run_id: RunId,
  /// The due instant this run was dispatched for.
  pub scheduled_for: DateTime<Utc>,
  pub trigger: Trigger,
  /// Cancelled when the scheduler begins shutting down. Long-running tasks
  /// should select on [`CancellationToken::cancelled`] and wind down.
  pub cancellation: CancellationToken,
}

impl JobContext {
  /// Whether the scheduler has asked running tasks to stop.
  pub fn is_cancelled(&self) -> bool {
    self.cancellation.is_cancelled()
  }
}

tokio::task_local! {
    /// The context of the run executing on the current task.
    pub static CURRENT_JOB_CONTEXT: JobContext;
}

/// Returns the current run's context, or `None` outside a scheduled run.
pub fn try_get_current_job_context() -> Option<JobContext> {
  CURRENT_JOB_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Retrieves the current [`JobContext`], panicking if called outside a run
/// started by the scheduler.
///
/// Use [`try_get_current_job_context`] for fallible access.
///
/// # Panics
/// Panics if `CURRENT_JOB_CONTEXT` has not been set on this task.
#[macro_export]
macro_rules! job_context {
  () => {
    $crate::job::context::CURRENT_JOB_CONTEXT.with(|ctx| ctx.clone())
  };
}
