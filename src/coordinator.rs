use crate::clock::Clock;
use crate::command::{JobUpdate, RunOutcome, RunReport, SchedulerCommand};
use crate::error::{RunError, SchedulerError};
use crate::executor::Executor;
use crate::job::{
  BoxedExecFn, JobDefinition, JobDetails, JobId, JobRequest, JobRuntime, JobTable, PublishedJob,
};
use crate::metrics::SchedulerMetrics;
use crate::monitor::{SkipReason, Trigger};
use crate::scheduler::SchedulerState;

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::future::BoxFuture;
use priority_queue::PriorityQueue;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Time index of pending due instants; the earliest instant has the highest
/// priority.
type DueIndex = PriorityQueue<JobId, Reverse<DateTime<Utc>>>;

/// Dispatch-loop bookkeeping for one registered job.
#[derive(Debug)]
struct JobEntry {
  runtime: Arc<JobRuntime>,
  created_at: DateTime<Utc>,
  next_due: Option<DateTime<Utc>>,
  runs_completed: u64,
  /// Dispatches handed to the executor whose report has not arrived yet.
  pending: u64,
  last_run: Option<DateTime<Utc>>,
  last_error: Option<RunError>,
  last_duration: Option<Duration>,
  skips: u64,
  last_skip: Option<SkipReason>,
}

impl JobEntry {
  fn new(runtime: Arc<JobRuntime>, created_at: DateTime<Utc>, next_due: DateTime<Utc>) -> Self {
    Self {
      runtime,
      created_at,
      next_due: Some(next_due),
      runs_completed: 0,
      pending: 0,
      last_run: None,
      last_error: None,
      last_duration: None,
      skips: 0,
      last_skip: None,
    }
  }

  /// Whether another dispatch fits in the run limit, counting dispatches
  /// still in flight.
  fn has_budget(&self, max_runs: Option<u64>) -> bool {
    max_runs.map_or(true, |max| self.runs_completed + self.pending < max)
  }

  fn reached_limit(&self, max_runs: Option<u64>) -> bool {
    max_runs.is_some_and(|max| self.runs_completed >= max)
  }
}

/// Whether the loop keeps going after a command.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
  Continue,
  Exit,
}

/// The dispatch loop. Sole owner of the job set and its time index.
///
/// Applies commands in arrival order, wakes at the earliest due instant to
/// hand due jobs to the [`Executor`], and folds run reports back into the
/// per-job counters. After every change it republishes the affected rows of
/// the shared [`JobTable`] that backs `ShiftKeeper::jobs`.
pub(crate) struct Coordinator {
  cmd_rx: mpsc::Receiver<SchedulerCommand>,
  report_rx: mpsc::UnboundedReceiver<RunReport>,
  jobs: HashMap<JobId, JobEntry>,
  index: DueIndex,
  table: JobTable,
  executor: Executor,
  clock: Arc<dyn Clock>,
  timezone: Tz,
  metrics: SchedulerMetrics,
  state: Arc<watch::Sender<SchedulerState>>,
  /// Due jobs are only dispatched while running.
  running: bool,
}

impl Coordinator {
  pub fn new(
    cmd_rx: mpsc::Receiver<SchedulerCommand>,
    report_rx: mpsc::UnboundedReceiver<RunReport>,
    table: JobTable,
    executor: Executor,
    clock: Arc<dyn Clock>,
    timezone: Tz,
    metrics: SchedulerMetrics,
    state: Arc<watch::Sender<SchedulerState>>,
  ) -> Self {
    Self {
      cmd_rx,
      report_rx,
      jobs: HashMap::new(),
      index: PriorityQueue::new(),
      table,
      executor,
      clock,
      timezone,
      metrics,
      state,
      running: false,
    }
  }

  /// Runs the loop until a shutdown command arrives or every handle is dropped.
  pub async fn run(mut self) {
    info!("Dispatch loop started.");

    loop {
      self
        .metrics
        .jobs_scheduled_current
        .store(self.jobs.len(), AtomicOrdering::Relaxed);

      let wake: BoxFuture<'static, ()> = match self.next_wakeup() {
        Some(due) => {
          trace!(%due, "Sleeping until next due job.");
          self.clock.sleep_until(due)
        }
        None => Box::pin(futures::future::pending()),
      };

      tokio::select! {
        biased;

        maybe_cmd = self.cmd_rx.recv() => match maybe_cmd {
          Some(cmd) => {
            trace!(?cmd, "Received command.");
            if self.handle_command(cmd) == Flow::Exit {
              break;
            }
          }
          None => {
            info!("All scheduler handles dropped; stopping dispatch loop.");
            break;
          }
        },

        Some(report) = self.report_rx.recv() => self.handle_report(report),

        _ = wake => self.dispatch_due(),
      }
    }

    info!("Dispatch loop stopped.");
  }

  fn next_wakeup(&self) -> Option<DateTime<Utc>> {
    if !self.running {
      return None;
    }
    self.index.peek().map(|(_, Reverse(due))| *due)
  }

  // --- Commands ---

  fn handle_command(&mut self, cmd: SchedulerCommand) -> Flow {
    match cmd {
      SchedulerCommand::AddJob {
        request,
        exec_fn,
        responder,
      } => {
        let _ = responder.send(self.add_job(request, exec_fn));
      }
      SchedulerCommand::RemoveJob {
        job_id,
        strict,
        responder,
      } => {
        let removed = self.remove_job(job_id);
        let response = if !removed && strict {
          Err(SchedulerError::NotFound(job_id))
        } else {
          Ok(removed)
        };
        let _ = responder.send(response);
      }
      SchedulerCommand::RemoveByTag { tag, responder } => {
        let _ = responder.send(self.remove_by_tag(&tag));
      }
      SchedulerCommand::UpdateJob {
        job_id,
        update,
        responder,
      } => {
        let _ = responder.send(self.update_job(job_id, update));
      }
      SchedulerCommand::RunNow { job_id, responder } => {
        let _ = responder.send(self.run_now(job_id));
      }
      SchedulerCommand::SetRunning { running, responder } => {
        if self.running != running {
          info!(running, "Dispatching {}.", if running { "resumed" } else { "paused" });
        }
        self.running = running;
        let target = if running {
          SchedulerState::Running
        } else {
          SchedulerState::Stopped
        };
        // Shutdown owns the state once it has begun.
        self.state.send_if_modified(|state| {
          if state.is_closed() || *state == target {
            false
          } else {
            *state = target;
            true
          }
        });
        let _ = responder.send(());
      }
      SchedulerCommand::Shutdown { responder } => {
        info!(jobs = self.jobs.len(), "Shutdown requested.");
        self.running = false;
        let _ = responder.send(());
        return Flow::Exit;
      }
    }
    Flow::Continue
  }

  fn add_job(
    &mut self,
    mut request: JobRequest,
    exec_fn: Arc<BoxedExecFn>,
  ) -> Result<JobId, SchedulerError> {
    let job_id = request.id().unwrap_or_else(Uuid::new_v4);
    if self.jobs.contains_key(&job_id) {
      warn!(%job_id, "Rejected job with duplicate identifier.");
      return Err(SchedulerError::DuplicateIdentifier(job_id));
    }

    let now = self.clock.now();
    let next_due = request.initial_due(now, self.timezone).ok_or_else(|| {
      SchedulerError::InvalidSchedule("schedule has no upcoming occurrence".to_string())
    })?;

    request.id = Some(job_id);
    info!(
      %job_id,
      job_name = %request.name,
      schedule = request.schedule.kind_name(),
      %next_due,
      "Job registered."
    );
    let runtime = Arc::new(JobRuntime::new(job_id, JobDefinition { request, exec_fn }));
    self.jobs.insert(job_id, JobEntry::new(runtime, now, next_due));
    self.index.push(job_id, Reverse(next_due));
    SchedulerMetrics::incr(&self.metrics.jobs_added);
    self.publish(job_id);
    Ok(job_id)
  }

  /// Removes a job from the set, the index and the table. In-flight runs
  /// finish; triggers still waiting for admission skip.
  fn remove_job(&mut self, job_id: JobId) -> bool {
    let Some(entry) = self.jobs.remove(&job_id) else {
      debug!(%job_id, "Remove requested for unknown job.");
      return false;
    };
    entry.runtime.removed.store(true, AtomicOrdering::SeqCst);
    self.index.remove(&job_id);
    self.table.write().remove(&job_id);
    SchedulerMetrics::incr(&self.metrics.jobs_removed);
    info!(%job_id, in_flight = entry.runtime.in_flight(), "Job removed.");
    true
  }

  fn remove_by_tag(&mut self, tag: &str) -> usize {
    let tagged: Vec<JobId> = self
      .jobs
      .iter()
      .filter(|(_, entry)| entry.runtime.definition().request.tags.contains(tag))
      .map(|(job_id, _)| *job_id)
      .collect();
    let removed = tagged.into_iter().filter(|job_id| self.remove_job(*job_id)).count();
    debug!(tag, removed, "Removed jobs by tag.");
    removed
  }

  fn update_job(&mut self, job_id: JobId, update: JobUpdate) -> Result<(), SchedulerError> {
    let now = self.clock.now();
    let timezone = self.timezone;
    let Some(entry) = self.jobs.get_mut(&job_id) else {
      return Err(SchedulerError::NotFound(job_id));
    };

    let current = entry.runtime.definition();
    let JobUpdate {
      mut request,
      exec_fn,
      reset_counters,
    } = update;

    if !current.request.schedule.same_kind(&request.schedule) {
      return Err(SchedulerError::InvalidSchedule(format!(
        "schedule kind cannot change from {} to {}; remove and re-add the job",
        current.request.schedule.kind_name(),
        request.schedule.kind_name()
      )));
    }

    let reschedule = request.schedule != current.request.schedule || request.start.is_some();
    let next_due = if reschedule {
      request.initial_due(now, timezone)
    } else {
      entry.next_due
    }
    .ok_or_else(|| {
      SchedulerError::InvalidSchedule("schedule has no upcoming occurrence".to_string())
    })?;

    request.id = Some(job_id);
    let max_runs = request.max_runs;
    let exec_fn = exec_fn.unwrap_or_else(|| current.exec_fn.clone());
    entry
      .runtime
      .replace_definition(JobDefinition { request, exec_fn });

    if reset_counters {
      entry.runs_completed = 0;
      entry.last_run = None;
      entry.last_error = None;
      entry.last_duration = None;
      entry.skips = 0;
      entry.last_skip = None;
    }
    entry.next_due = Some(next_due);
    self.index.push(job_id, Reverse(next_due));
    SchedulerMetrics::incr(&self.metrics.jobs_updated);
    info!(%job_id, %next_due, reschedule, reset_counters, "Job updated.");

    if entry.reached_limit(max_runs) {
      self.retire(job_id);
    } else {
      self.publish(job_id);
    }
    Ok(())
  }

  fn run_now(&mut self, job_id: JobId) -> Result<(), SchedulerError> {
    let Some(entry) = self.jobs.get_mut(&job_id) else {
      return Err(SchedulerError::NotFound(job_id));
    };
    let max_runs = entry.runtime.definition().request.max_runs;
    if !entry.has_budget(max_runs) {
      debug!(%job_id, "Run limit already committed; ignoring manual trigger.");
      return Ok(());
    }
    entry.pending += 1;
    debug!(%job_id, "Dispatching manual run.");
    self
      .executor
      .dispatch(entry.runtime.clone(), self.clock.now(), Trigger::Manual);
    Ok(())
  }

  // --- Dispatch ---

  /// Pops every job due at or before now, reinserts it with its next due
  /// instant and hands it to the executor.
  fn dispatch_due(&mut self) {
    let now = self.clock.now();
    while let Some((&job_id, &Reverse(due))) = self.index.peek() {
      if due > now {
        break;
      }
      self.index.pop();
      let lag = (now - due).to_std().unwrap_or(Duration::ZERO);
      self.metrics.dispatch_lag.record(lag);
      self.dispatch_entry(job_id, due, now);
    }
  }

  fn dispatch_entry(&mut self, job_id: JobId, due: DateTime<Utc>, now: DateTime<Utc>) {
    let Some(entry) = self.jobs.get_mut(&job_id) else {
      warn!(%job_id, "Indexed job missing from job set; dropping index entry.");
      return;
    };
    let definition = entry.runtime.definition();
    let next = definition.request.schedule.next_due(due, now, self.timezone);

    if entry.has_budget(definition.request.max_runs) {
      entry.pending += 1;
      trace!(%job_id, %due, "Dispatching due job.");
      self
        .executor
        .dispatch(entry.runtime.clone(), due, Trigger::Scheduled);
    } else {
      trace!(%job_id, "Run limit committed to pending runs; not dispatching.");
    }

    match next {
      Some(next_due) => {
        entry.next_due = Some(next_due);
        self.index.push(job_id, Reverse(next_due));
        self.publish(job_id);
      }
      None => {
        debug!(%job_id, "Schedule exhausted.");
        self.retire(job_id);
      }
    }
  }

  // --- Reports ---

  fn handle_report(&mut self, report: RunReport) {
    let job_id = report.job_id;
    let Some(entry) = self.jobs.get_mut(&job_id) else {
      trace!(%job_id, run_id = %report.run_id, "Report for a job no longer registered.");
      return;
    };
    entry.pending = entry.pending.saturating_sub(1);

    match report.outcome {
      RunOutcome::Ran {
        started_at,
        duration,
        result,
      } => {
        trace!(
          %job_id,
          run_id = %report.run_id,
          trigger = ?report.trigger,
          ?duration,
          ok = result.is_ok(),
          "Run reported."
        );
        entry.runs_completed += 1;
        entry.last_run = Some(started_at);
        entry.last_duration = Some(duration);
        entry.last_error = result.err();

        let max_runs = entry.runtime.definition().request.max_runs;
        if entry.reached_limit(max_runs) {
          info!(%job_id, runs = entry.runs_completed, "Run limit reached.");
          entry.runtime.removed.store(true, AtomicOrdering::SeqCst);
          self.retire(job_id);
          return;
        }
      }
      RunOutcome::Skipped(reason) => {
        debug!(
          %job_id,
          run_id = %report.run_id,
          trigger = ?report.trigger,
          ?reason,
          "Dispatch skipped."
        );
        entry.skips += 1;
        entry.last_skip = Some(reason);
      }
    }
    self.publish(job_id);
  }

  // --- Table ---

  /// Drops a job that will not run again on its own.
  fn retire(&mut self, job_id: JobId) {
    if self.jobs.remove(&job_id).is_none() {
      return;
    }
    self.index.remove(&job_id);
    self.table.write().remove(&job_id);
    SchedulerMetrics::incr(&self.metrics.jobs_retired);
    info!(%job_id, "Job retired.");
  }

  fn publish(&self, job_id: JobId) {
    let Some(entry) = self.jobs.get(&job_id) else {
      return;
    };
    let definition = entry.runtime.definition();
    let request = &definition.request;
    let details = JobDetails {
      id: job_id,
      name: request.name.clone(),
      tags: request.tags.clone(),
      schedule: request.schedule.clone(),
      concurrency: request.concurrency,
      max_runs: request.max_runs,
      distributed: request.distributed,
      next_run: entry.next_due,
      last_run: entry.last_run,
      last_error: entry.last_error.clone(),
      last_duration: entry.last_duration,
      run_count: entry.runs_completed,
      skip_count: entry.skips,
      last_skip: entry.last_skip,
      in_flight: entry.runtime.in_flight(),
      created_at: entry.created_at,
    };
    self.table.write().insert(
      job_id,
      PublishedJob {
        details,
        runtime: entry.runtime.clone(),
      },
    );
  }
}
