use crate::clock::Clock;
use crate::command::{RunOutcome, RunReport};
use crate::error::{RunError, ShutdownError};
use crate::job::context::{JobContext, CURRENT_JOB_CONTEXT};
use crate::job::{BoxedExecFn, ConcurrencyMode, JobDefinition, JobRuntime, RunId, SingletonMode};
use crate::locker::{Elector, LockHandle, Locker};
use crate::metrics::SchedulerMetrics;
use crate::monitor::{self, JobEvent, Monitor, SkipReason, Trigger};

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn, Instrument};
use uuid::Uuid;

/// How long aborted runs get to release their locks and report after a
/// shutdown timeout.
const ABANDON_GRACE: Duration = Duration::from_millis(250);

/// Settings the executor is built with.
pub(crate) struct ExecutorConfig {
  pub max_concurrent_jobs: usize,
  pub queue_capacity: usize,
  pub lock_timeout: Duration,
  pub locker: Option<Arc<dyn Locker>>,
  pub elector: Option<Arc<dyn Elector>>,
  pub monitor: Arc<dyn Monitor>,
  pub clock: Arc<dyn Clock>,
}

/// Turns dispatched jobs into supervised runs.
///
/// `dispatch` never blocks: every trigger becomes its own tracked task that
/// goes through singleton policy, the global concurrency cap, leader election
/// and the distributed lock before the task itself is executed. The outcome
/// goes to the monitor and, as a [`RunReport`], back to the dispatch loop.
#[derive(Clone)]
pub(crate) struct Executor {
  inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
  permits: Arc<Semaphore>,
  queue_capacity: usize,
  waiting: AtomicUsize,
  lock_timeout: Duration,
  locker: Option<Arc<dyn Locker>>,
  elector: Option<Arc<dyn Elector>>,
  monitor: Arc<dyn Monitor>,
  clock: Arc<dyn Clock>,
  metrics: SchedulerMetrics,
  report_tx: mpsc::UnboundedSender<RunReport>,
  tracker: TaskTracker,
  cancel: CancellationToken,
  /// Task futures currently executing, so shutdown can abort them.
  running: Mutex<HashMap<RunId, AbortHandle>>,
}

impl Executor {
  pub fn new(
    config: ExecutorConfig,
    metrics: SchedulerMetrics,
    report_tx: mpsc::UnboundedSender<RunReport>,
  ) -> Self {
    Self {
      inner: Arc::new(ExecutorInner {
        permits: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
        queue_capacity: config.queue_capacity,
        waiting: AtomicUsize::new(0),
        lock_timeout: config.lock_timeout,
        locker: config.locker,
        elector: config.elector,
        monitor: config.monitor,
        clock: config.clock,
        metrics,
        report_tx,
        tracker: TaskTracker::new(),
        cancel: CancellationToken::new(),
        running: Mutex::new(HashMap::new()),
      }),
    }
  }

  /// Number of triggers waiting for a concurrency permit.
  pub fn waiting(&self) -> usize {
    self.inner.waiting.load(AtomicOrdering::SeqCst)
  }

  /// Hands one trigger of `job` to a supervised task and returns immediately.
  pub fn dispatch(&self, job: Arc<JobRuntime>, scheduled_for: DateTime<Utc>, trigger: Trigger) {
    SchedulerMetrics::incr(&self.inner.metrics.runs_dispatched);
    let definition = job.definition();
    let run_id = Uuid::new_v4();
    let span = tracing::info_span!(
      "job_run",
      job_id = %job.id,
      %run_id,
      job_name = definition.request.name.as_str(),
      ?trigger
    );
    let inner = self.inner.clone();
    self.inner.tracker.spawn(
      async move {
        inner
          .supervise(job, definition, run_id, scheduled_for, trigger)
          .await
      }
      .instrument(span),
    );
  }

  /// Signals cancellation to all runs and waits for them to finish.
  ///
  /// With a timeout, runs still executing when it elapses are aborted at
  /// their next await point and reported as abandoned. A task that never
  /// yields cannot be preempted.
  pub async fn shutdown(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    let inner = &self.inner;
    inner.cancel.cancel();
    inner.tracker.close();

    let Some(limit) = timeout else {
      inner.tracker.wait().await;
      info!("All runs finished.");
      return Ok(());
    };

    if tokio::time::timeout(limit, inner.tracker.wait()).await.is_ok() {
      info!("All runs finished.");
      return Ok(());
    }

    let abandoned = inner.tracker.len();
    let handles: Vec<(RunId, AbortHandle)> = inner.running.lock().drain().collect();
    for (run_id, handle) in handles {
      warn!(%run_id, "Abandoning run still executing at shutdown timeout.");
      handle.abort();
    }
    inner
      .metrics
      .runs_abandoned
      .fetch_add(abandoned, AtomicOrdering::Relaxed);
    error!(?limit, abandoned, "Shutdown timed out with runs in flight.");

    // Aborted runs still release their locks and report on the way out.
    let _ = tokio::time::timeout(ABANDON_GRACE, inner.tracker.wait()).await;
    Err(ShutdownError::Timeout { abandoned })
  }
}

impl ExecutorInner {
  async fn supervise(
    self: Arc<Self>,
    job: Arc<JobRuntime>,
    definition: Arc<JobDefinition>,
    run_id: RunId,
    scheduled_for: DateTime<Utc>,
    trigger: Trigger,
  ) {
    let event = JobEvent {
      job_id: job.id,
      job_name: definition.request.name.clone(),
      run_id,
      scheduled_for,
      timestamp: self.clock.now(),
      trigger,
    };

    let outcome = self.admit_and_run(&job, &definition, &event).await;

    let report = RunReport {
      job_id: job.id,
      run_id,
      trigger,
      outcome,
    };
    if self.report_tx.send(report).is_err() {
      trace!("Dispatch loop gone; dropping run report.");
    }
  }

  async fn admit_and_run(
    &self,
    job: &Arc<JobRuntime>,
    definition: &Arc<JobDefinition>,
    event: &JobEvent,
  ) -> RunOutcome {
    if self.cancel.is_cancelled() {
      return self.skip(event, SkipReason::ShuttingDown);
    }

    // Held until the run ends, so it spans admission and execution.
    let _singleton_guard = match definition.request.concurrency {
      ConcurrencyMode::Unlimited => None,
      ConcurrencyMode::Singleton(mode) => match self.enter_singleton(job, mode).await {
        Ok(guard) => Some(guard),
        Err(reason) => return self.skip(event, reason),
      },
    };

    let _permit = match self.admit().await {
      Ok(permit) => permit,
      Err(reason) => return self.skip(event, reason),
    };

    if job.is_removed() {
      return self.skip(event, SkipReason::JobRemoved);
    }
    if self.cancel.is_cancelled() {
      return self.skip(event, SkipReason::ShuttingDown);
    }

    let lock = if definition.request.distributed {
      match self.claim(job).await {
        Ok(lock) => lock,
        Err(reason) => return self.skip(event, reason),
      }
    } else {
      None
    };

    self.execute(job, definition, event, lock).await
  }

  /// Applies singleton policy. Returns the gate guard to hold for the run.
  async fn enter_singleton(
    &self,
    job: &Arc<JobRuntime>,
    mode: SingletonMode,
  ) -> Result<OwnedMutexGuard<()>, SkipReason> {
    if let Ok(guard) = job.singleton_gate.clone().try_lock_owned() {
      return Ok(guard);
    }
    match mode {
      SingletonMode::Skip => Err(SkipReason::SingletonBusy),
      SingletonMode::Queue => {
        if job.rerun_queued.swap(true, AtomicOrdering::SeqCst) {
          return Err(SkipReason::AlreadyQueued);
        }
        debug!("Run in flight; queued one rerun.");
        let acquired = tokio::select! {
          guard = job.singleton_gate.clone().lock_owned() => Some(guard),
          _ = self.cancel.cancelled() => None,
        };
        job.rerun_queued.store(false, AtomicOrdering::SeqCst);
        acquired.ok_or(SkipReason::ShuttingDown)
      }
    }
  }

  /// Takes a concurrency permit, waiting in the bounded admission queue when
  /// none is free.
  async fn admit(&self) -> Result<OwnedSemaphorePermit, SkipReason> {
    match self.permits.clone().try_acquire_owned() {
      Ok(permit) => return Ok(permit),
      Err(TryAcquireError::Closed) => return Err(SkipReason::ShuttingDown),
      Err(TryAcquireError::NoPermits) => {}
    }

    let capacity = self.queue_capacity;
    if self
      .waiting
      .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |w| {
        (w < capacity).then_some(w + 1)
      })
      .is_err()
    {
      warn!(capacity, "Admission queue full; dropping trigger.");
      return Err(SkipReason::BackpressureDropped);
    }
    SchedulerMetrics::incr(&self.metrics.runs_waiting_current);
    trace!("All permits taken; waiting for admission.");

    let acquired = tokio::select! {
      permit = self.permits.clone().acquire_owned() => permit.ok(),
      _ = self.cancel.cancelled() => None,
    };

    self.waiting.fetch_sub(1, AtomicOrdering::SeqCst);
    SchedulerMetrics::decr(&self.metrics.runs_waiting_current);
    acquired.ok_or(SkipReason::ShuttingDown)
  }

  /// Checks leadership and takes the job's distributed lock, when configured.
  async fn claim(&self, job: &Arc<JobRuntime>) -> Result<Option<HeldLock>, SkipReason> {
    if let Some(elector) = &self.elector {
      match tokio::time::timeout(self.lock_timeout, elector.is_leader()).await {
        Ok(Ok(true)) => {}
        Ok(Ok(false)) => {
          debug!("Not the leader; skipping run.");
          return Err(SkipReason::NotLeader);
        }
        Ok(Err(e)) => {
          warn!(error = %e, "Leader check failed; skipping run.");
          return Err(SkipReason::NotLeader);
        }
        Err(_) => {
          warn!(timeout = ?self.lock_timeout, "Leader check timed out; skipping run.");
          return Err(SkipReason::NotLeader);
        }
      }
    }

    let Some(locker) = &self.locker else {
      return Ok(None);
    };
    let resource = job.id.to_string();
    match tokio::time::timeout(self.lock_timeout, locker.try_lock(&resource)).await {
      Ok(Ok(Some(handle))) => {
        trace!(%resource, "Acquired distributed lock.");
        Ok(Some(HeldLock::new(handle)))
      }
      Ok(Ok(None)) => {
        debug!(%resource, "Lock held by another instance; skipping run.");
        Err(SkipReason::LockUnavailable)
      }
      Ok(Err(e)) => {
        warn!(%resource, error = %e, "Lock backend error; skipping run.");
        Err(SkipReason::LockUnavailable)
      }
      Err(_) => {
        warn!(%resource, timeout = ?self.lock_timeout, "Lock attempt timed out; skipping run.");
        Err(SkipReason::LockUnavailable)
      }
    }
  }

  async fn execute(
    &self,
    job: &Arc<JobRuntime>,
    definition: &Arc<JobDefinition>,
    event: &JobEvent,
    lock: Option<HeldLock>,
  ) -> RunOutcome {
    job.in_flight.fetch_add(1, AtomicOrdering::SeqCst);
    SchedulerMetrics::incr(&self.metrics.runs_in_flight_current);
    SchedulerMetrics::incr(&self.metrics.runs_started);

    let started_at = self.clock.now();
    let started = Instant::now();
    let start_event = self.stamped(event);
    monitor::notify(self.monitor.as_ref(), "on_job_start", |m| {
      m.on_job_start(&start_event)
    });
    info!("Starting job run.");

    let context = JobContext {
      job_id: job.id,
      run_id: event.run_id,
      scheduled_for: event.scheduled_for,
      trigger: event.trigger,
      cancellation: self.cancel.child_token(),
    };
    let result = self
      .run_task(event.run_id, &definition.exec_fn, context)
      .await;
    let duration = started.elapsed();

    if let Some(lock) = lock {
      lock.release().await;
    }
    job.in_flight.fetch_sub(1, AtomicOrdering::SeqCst);
    SchedulerMetrics::decr(&self.metrics.runs_in_flight_current);
    self.metrics.run_duration.record(duration);

    let end_event = self.stamped(event);
    match &result {
      Ok(()) => {
        SchedulerMetrics::incr(&self.metrics.runs_succeeded);
        info!(duration_ms = duration.as_millis() as u64, "Job run succeeded.");
        monitor::notify(self.monitor.as_ref(), "on_job_success", |m| {
          m.on_job_success(&end_event, duration)
        });
      }
      Err(run_error) => {
        match run_error {
          RunError::TaskPanic(message) => {
            SchedulerMetrics::incr(&self.metrics.runs_panicked);
            error!(panic = %message, "Job run panicked.");
          }
          RunError::TaskError(message) => {
            SchedulerMetrics::incr(&self.metrics.runs_failed);
            warn!(error = %message, duration_ms = duration.as_millis() as u64, "Job run failed.");
          }
          RunError::Abandoned => {
            warn!("Job run abandoned.");
          }
        }
        monitor::notify(self.monitor.as_ref(), "on_job_failure", |m| {
          m.on_job_failure(&end_event, run_error, duration)
        });
      }
    }

    RunOutcome::Ran {
      started_at,
      duration,
      result,
    }
  }

  /// Runs the task under the job context, converting panics and aborts into
  /// run errors.
  async fn run_task(
    &self,
    run_id: RunId,
    exec_fn: &Arc<BoxedExecFn>,
    context: JobContext,
  ) -> Result<(), RunError> {
    let created = CURRENT_JOB_CONTEXT.sync_scope(context.clone(), || {
      panic::catch_unwind(AssertUnwindSafe(|| (**exec_fn)()))
    });
    let future = match created {
      Ok(future) => future,
      Err(payload) => return Err(RunError::TaskPanic(panic_message(payload.as_ref()))),
    };

    let task = tokio::spawn(CURRENT_JOB_CONTEXT.scope(context, future).in_current_span());
    self.running.lock().insert(run_id, task.abort_handle());
    let joined = task.await;
    self.running.lock().remove(&run_id);

    match joined {
      Ok(Ok(())) => Ok(()),
      Ok(Err(task_error)) => Err(RunError::TaskError(task_error.to_string())),
      Err(join_error) if join_error.is_panic() => Err(RunError::TaskPanic(panic_message(
        join_error.into_panic().as_ref(),
      ))),
      Err(_) => Err(RunError::Abandoned),
    }
  }

  fn skip(&self, event: &JobEvent, reason: SkipReason) -> RunOutcome {
    match reason {
      SkipReason::SingletonBusy | SkipReason::AlreadyQueued => {
        SchedulerMetrics::incr(&self.metrics.runs_skipped_singleton)
      }
      SkipReason::LockUnavailable | SkipReason::NotLeader => {
        SchedulerMetrics::incr(&self.metrics.runs_skipped_lock)
      }
      SkipReason::BackpressureDropped => {
        SchedulerMetrics::incr(&self.metrics.runs_dropped_backpressure)
      }
      SkipReason::JobRemoved | SkipReason::ShuttingDown => {}
    }
    debug!(%reason, "Run skipped.");
    let skip_event = self.stamped(event);
    monitor::notify(self.monitor.as_ref(), "on_job_skipped", |m| {
      m.on_job_skipped(&skip_event, reason)
    });
    RunOutcome::Skipped(reason)
  }

  fn stamped(&self, event: &JobEvent) -> JobEvent {
    JobEvent {
      timestamp: self.clock.now(),
      ..event.clone()
    }
  }
}

/// A lock handle held for one run.
///
/// Released explicitly once the run ends. If the owning task is dropped
/// first, `Drop` schedules the release on the runtime instead.
struct HeldLock {
  handle: Option<Box<dyn LockHandle>>,
}

impl HeldLock {
  fn new(handle: Box<dyn LockHandle>) -> Self {
    Self {
      handle: Some(handle),
    }
  }

  async fn release(mut self) {
    if let Some(handle) = self.handle.take() {
      if let Err(e) = handle.unlock().await {
        warn!(error = %e, "Failed to release distributed lock; relying on lease expiry.");
      }
    }
  }
}

impl Drop for HeldLock {
  fn drop(&mut self) {
    let Some(handle) = self.handle.take() else {
      return;
    };
    match tokio::runtime::Handle::try_current() {
      Ok(runtime) => {
        runtime.spawn(async move {
          if let Err(e) = handle.unlock().await {
            warn!(error = %e, "Failed to release distributed lock on drop.");
          }
        });
      }
      Err(_) => warn!("No runtime to release distributed lock; relying on lease expiry."),
    }
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
