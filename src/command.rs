use crate::error::{RunError, SchedulerError};
use crate::job::{BoxedExecFn, JobId, JobRequest, RunId, TaskResult};
use crate::monitor::{SkipReason, Trigger};

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

/// Replacement definition for an existing job, applied with
/// [`ShiftKeeper::update_job`](crate::ShiftKeeper::update_job).
///
/// The schedule kind must stay the same; its parameters, the policy fields,
/// name and tags are replaced wholesale. The task is kept unless a new one is
/// supplied. Run counters survive unless `reset_counters` is set.
#[derive(Clone)]
pub struct JobUpdate {
  pub request: JobRequest,
  pub exec_fn: Option<Arc<BoxedExecFn>>,
  pub reset_counters: bool,
}

impl JobUpdate {
  pub fn new(request: JobRequest) -> Self {
    Self {
      request,
      exec_fn: None,
      reset_counters: false,
    }
  }

  /// Replaces the job's task as well.
  pub fn with_task<F>(mut self, exec_fn: F) -> Self
  where
    F: Fn() -> Pin<Box<dyn Future<Output = TaskResult> + Send + 'static>> + Send + Sync + 'static,
  {
    self.exec_fn = Some(Arc::new(Box::new(exec_fn) as BoxedExecFn));
    self
  }

  /// Zeroes the run count and clears last run and last error.
  pub fn reset_counters(mut self) -> Self {
    self.reset_counters = true;
    self
  }
}

impl fmt::Debug for JobUpdate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobUpdate")
      .field("request", &self.request)
      .field("exec_fn", &self.exec_fn.as_ref().map(|_| "<Fn>"))
      .field("reset_counters", &self.reset_counters)
      .finish()
  }
}

/// Commands sent from the `ShiftKeeper` handle to the dispatch loop.
///
/// Each command carries a `oneshot::Sender` the loop answers on. Commands are
/// applied strictly in the order they are received.
pub(crate) enum SchedulerCommand {
  AddJob {
    request: JobRequest,
    exec_fn: Arc<BoxedExecFn>,
    responder: oneshot::Sender<Result<JobId, SchedulerError>>,
  },
  /// `Ok(false)` for an unknown job unless `strict` is set.
  RemoveJob {
    job_id: JobId,
    strict: bool,
    responder: oneshot::Sender<Result<bool, SchedulerError>>,
  },
  RemoveByTag {
    tag: String,
    responder: oneshot::Sender<usize>,
  },
  UpdateJob {
    job_id: JobId,
    update: JobUpdate,
    responder: oneshot::Sender<Result<(), SchedulerError>>,
  },
  RunNow {
    job_id: JobId,
    responder: oneshot::Sender<Result<(), SchedulerError>>,
  },
  /// Resume (`true`) or pause (`false`) dispatching due jobs.
  SetRunning {
    running: bool,
    responder: oneshot::Sender<()>,
  },
  /// Stop dispatching and exit the loop after replying.
  Shutdown { responder: oneshot::Sender<()> },
}

impl fmt::Debug for SchedulerCommand {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SchedulerCommand::AddJob { request, .. } => f
        .debug_struct("AddJob")
        .field("request", request)
        .field("exec_fn", &format_args!("<Fn>"))
        .finish(),
      SchedulerCommand::RemoveJob { job_id, strict, .. } => f
        .debug_struct("RemoveJob")
        .field("job_id", job_id)
        .field("strict", strict)
        .finish(),
      SchedulerCommand::RemoveByTag { tag, .. } => {
        f.debug_struct("RemoveByTag").field("tag", tag).finish()
      }
      SchedulerCommand::UpdateJob { job_id, update, .. } => f
        .debug_struct("UpdateJob")
        .field("job_id", job_id)
        .field("update", update)
        .finish(),
      SchedulerCommand::RunNow { job_id, .. } => {
        f.debug_struct("RunNow").field("job_id", job_id).finish()
      }
      SchedulerCommand::SetRunning { running, .. } => {
        f.debug_struct("SetRunning").field("running", running).finish()
      }
      SchedulerCommand::Shutdown { .. } => f.write_str("Shutdown"),
    }
  }
}

/// Message sent from the executor back to the dispatch loop once a dispatch
/// has been fully handled. Exactly one report is sent per dispatch.
#[derive(Debug)]
pub(crate) struct RunReport {
  pub job_id: JobId,
  pub run_id: RunId,
  pub trigger: Trigger,
  pub outcome: RunOutcome,
}

#[derive(Debug)]
pub(crate) enum RunOutcome {
  /// The task executed.
  Ran {
    started_at: DateTime<Utc>,
    duration: Duration,
    result: Result<(), RunError>,
  },
  /// The trigger was dropped before the task started.
  Skipped(SkipReason),
}
