use crate::clock::{Clock, SystemClock};
use crate::command::{JobUpdate, SchedulerCommand};
use crate::coordinator::Coordinator;
use crate::error::{BuildError, SchedulerError, ShutdownError};
use crate::executor::{Executor, ExecutorConfig};
use crate::job::{BoxedExecFn, JobDetails, JobId, JobRequest, JobSnapshot, JobTable, TaskResult};
use crate::locker::{Elector, Locker};
use crate::metrics::{MetricsSnapshot, SchedulerMetrics};
use crate::monitor::{Monitor, NoopMonitor};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

const DEFAULT_MAX_CONCURRENT_JOBS: usize = 16;
const DEFAULT_QUEUE_CAPACITY: usize = 128;
const DEFAULT_COMMAND_BUFFER_SIZE: usize = 128;
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a [`ShiftKeeper`] instance.
///
/// `Created -> Running <-> Stopped`, and from any of those
/// `-> ShuttingDown -> Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SchedulerState {
  /// Built; jobs can be registered but nothing is dispatched yet.
  Created,
  Running,
  /// Dispatching paused by [`ShiftKeeper::stop`]. Runs already in flight continue.
  Stopped,
  ShuttingDown,
  Terminated,
}

impl SchedulerState {
  pub(crate) fn is_closed(&self) -> bool {
    matches!(self, SchedulerState::ShuttingDown | SchedulerState::Terminated)
  }
}

/// Builder for configuring and creating a [`ShiftKeeper`] scheduler.
///
/// # Example
///
/// ```no_run
/// use shiftkeeper::{InMemoryLocker, ShiftKeeper};
/// use std::time::Duration;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let scheduler = ShiftKeeper::builder()
///     .max_concurrent_jobs(4)
///     .queue_capacity(32)
///     .timezone(chrono_tz::Europe::Berlin)
///     .locker(InMemoryLocker::new())
///     .lock_timeout(Duration::from_millis(500))
///     .build()?;
/// scheduler.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct SchedulerBuilder {
  max_concurrent_jobs: usize,
  queue_capacity: usize,
  command_buffer_size: usize,
  timezone: Tz,
  clock: Arc<dyn Clock>,
  locker: Option<Arc<dyn Locker>>,
  elector: Option<Arc<dyn Elector>>,
  lock_timeout: Duration,
  monitor: Arc<dyn Monitor>,
}

impl Default for SchedulerBuilder {
  fn default() -> Self {
    Self {
      max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
      queue_capacity: DEFAULT_QUEUE_CAPACITY,
      command_buffer_size: DEFAULT_COMMAND_BUFFER_SIZE,
      timezone: Tz::UTC,
      clock: Arc::new(SystemClock),
      locker: None,
      elector: None,
      lock_timeout: DEFAULT_LOCK_TIMEOUT,
      monitor: Arc::new(NoopMonitor),
    }
  }
}

impl fmt::Debug for SchedulerBuilder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SchedulerBuilder")
      .field("max_concurrent_jobs", &self.max_concurrent_jobs)
      .field("queue_capacity", &self.queue_capacity)
      .field("command_buffer_size", &self.command_buffer_size)
      .field("timezone", &self.timezone)
      .field("clock", &self.clock)
      .field("locker", &self.locker.as_ref().map(|_| "<Locker>"))
      .field("elector", &self.elector.as_ref().map(|_| "<Elector>"))
      .field("lock_timeout", &self.lock_timeout)
      .finish_non_exhaustive()
  }
}

impl SchedulerBuilder {
  /// Creates a builder with default settings:
  /// - `max_concurrent_jobs`: 16.
  /// - `queue_capacity`: 128.
  /// - `command_buffer_size`: 128.
  /// - `timezone`: UTC.
  /// - `clock`: [`SystemClock`].
  /// - No locker or elector; `lock_timeout`: 1 second.
  /// - `monitor`: [`NoopMonitor`].
  pub fn new() -> Self {
    Self::default()
  }

  /// Maximum number of runs executing at once across all jobs. Must be
  /// greater than 0.
  pub fn max_concurrent_jobs(mut self, count: usize) -> Self {
    self.max_concurrent_jobs = count;
    self
  }

  /// How many triggers may wait for a free concurrency slot. Triggers
  /// arriving when the queue is full are dropped and reported as skipped.
  pub fn queue_capacity(mut self, capacity: usize) -> Self {
    self.queue_capacity = capacity;
    self
  }

  /// Size of the buffer between scheduler handles and the dispatch loop.
  pub fn command_buffer_size(mut self, size: usize) -> Self {
    self.command_buffer_size = size.max(1);
    self
  }

  /// Timezone calendar and cron schedules are evaluated in, unless a cron
  /// job names its own.
  pub fn timezone(mut self, timezone: Tz) -> Self {
    self.timezone = timezone;
    self
  }

  /// Replaces the time source. Tests typically pass a
  /// [`ManualClock`](crate::clock::ManualClock).
  pub fn clock<C: Clock>(mut self, clock: C) -> Self {
    self.clock = Arc::new(clock);
    self
  }

  /// Distributed lock backend consulted before every run of a distributed job.
  pub fn locker<L: Locker>(mut self, locker: L) -> Self {
    self.locker = Some(Arc::new(locker));
    self
  }

  /// Leader election; only the leader runs distributed jobs.
  pub fn elector<E: Elector>(mut self, elector: E) -> Self {
    self.elector = Some(Arc::new(elector));
    self
  }

  /// Upper bound on a single lock or leadership check.
  pub fn lock_timeout(mut self, timeout: Duration) -> Self {
    self.lock_timeout = timeout;
    self
  }

  /// Receives start, success, failure and skip notifications for every run.
  pub fn monitor<M: Monitor>(mut self, monitor: M) -> Self {
    self.monitor = Arc::new(monitor);
    self
  }

  /// Builds the scheduler and spawns its dispatch loop on the current Tokio
  /// runtime. The scheduler starts in [`SchedulerState::Created`]; call
  /// [`ShiftKeeper::start`] to begin dispatching.
  ///
  /// # Errors
  ///
  /// - [`BuildError::ZeroConcurrency`] if `max_concurrent_jobs` is 0.
  /// - [`BuildError::NoRuntime`] when called outside a Tokio runtime.
  pub fn build(self) -> Result<ShiftKeeper, BuildError> {
    if self.max_concurrent_jobs == 0 {
      return Err(BuildError::ZeroConcurrency);
    }
    let runtime = Handle::try_current().map_err(|_| BuildError::NoRuntime)?;

    let metrics = SchedulerMetrics::new();
    let table: JobTable = Arc::new(RwLock::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<SchedulerCommand>(self.command_buffer_size);
    let (report_tx, report_rx) = mpsc::unbounded_channel();

    let executor = Executor::new(
      ExecutorConfig {
        max_concurrent_jobs: self.max_concurrent_jobs,
        queue_capacity: self.queue_capacity,
        lock_timeout: self.lock_timeout,
        locker: self.locker.clone(),
        elector: self.elector,
        monitor: self.monitor,
        clock: self.clock.clone(),
      },
      metrics.clone(),
      report_tx,
    );

    let (state, _) = watch::channel(SchedulerState::Created);
    let state = Arc::new(state);
    let coordinator = Coordinator::new(
      cmd_rx,
      report_rx,
      table.clone(),
      executor.clone(),
      self.clock,
      self.timezone,
      metrics.clone(),
      state.clone(),
    );
    let coordinator_handle = runtime.spawn(
      coordinator
        .run()
        .instrument(tracing::info_span!("shiftkeeper_dispatch")),
    );

    info!(
      max_concurrent_jobs = self.max_concurrent_jobs,
      queue_capacity = self.queue_capacity,
      timezone = %self.timezone,
      "Scheduler built."
    );

    Ok(ShiftKeeper {
      inner: Arc::new(SchedulerInner {
        cmd_tx,
        state,
        table,
        metrics,
        executor,
        locker: self.locker,
        timezone: self.timezone,
        coordinator_handle: Mutex::new(Some(coordinator_handle)),
      }),
    })
  }
}

struct SchedulerInner {
  cmd_tx: mpsc::Sender<SchedulerCommand>,
  /// Shared with the dispatch loop, which applies start and stop transitions
  /// in command order.
  state: Arc<watch::Sender<SchedulerState>>,
  table: JobTable,
  metrics: SchedulerMetrics,
  executor: Executor,
  locker: Option<Arc<dyn Locker>>,
  timezone: Tz,
  coordinator_handle: Mutex<Option<JoinHandle<()>>>,
}

/// The ShiftKeeper job scheduler.
///
/// A cheap, cloneable handle to a dispatch loop that owns every registered
/// job. Mutations are sent to the loop and applied in order; reads such as
/// [`jobs`](Self::jobs) are served from a table the loop publishes and never
/// wait on it.
///
/// Use [`ShiftKeeper::builder()`] to create and configure an instance.
#[derive(Clone)]
pub struct ShiftKeeper {
  inner: Arc<SchedulerInner>,
}

impl fmt::Debug for ShiftKeeper {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ShiftKeeper")
      .field("state", &self.state())
      .field("jobs", &self.inner.table.read().len())
      .field("timezone", &self.inner.timezone)
      .finish_non_exhaustive()
  }
}

impl ShiftKeeper {
  /// Returns a builder to configure and create a `ShiftKeeper` instance.
  pub fn builder() -> SchedulerBuilder {
    SchedulerBuilder::new()
  }

  // --- Job management ---

  /// Registers a job and returns its identifier.
  ///
  /// The definition is validated before it is sent to the dispatch loop.
  ///
  /// # Errors
  ///
  /// - [`SchedulerError::InvalidSchedule`]: The definition is malformed.
  /// - [`SchedulerError::DuplicateIdentifier`]: The explicit identifier is taken.
  /// - [`SchedulerError::SchedulerClosed`]: The scheduler is shutting down.
  pub async fn add_job<F>(&self, request: JobRequest, task: F) -> Result<JobId, SchedulerError>
  where
    F: Fn() -> Pin<Box<dyn Future<Output = TaskResult> + Send + 'static>> + Send + Sync + 'static,
  {
    self.ensure_open()?;
    request.validate()?;
    let exec_fn = Arc::new(Box::new(task) as BoxedExecFn);
    self
      .request(|responder| SchedulerCommand::AddJob {
        request,
        exec_fn,
        responder,
      })
      .await?
  }

  /// Removes a job. Returns `Ok(false)` if no such job was registered.
  ///
  /// A run already executing finishes; triggers still waiting for admission
  /// are skipped and nothing is rescheduled.
  pub async fn remove_job(&self, job_id: JobId) -> Result<bool, SchedulerError> {
    self
      .request(|responder| SchedulerCommand::RemoveJob {
        job_id,
        strict: false,
        responder,
      })
      .await?
  }

  /// Like [`remove_job`](Self::remove_job), but an unknown identifier is an
  /// error.
  ///
  /// # Errors
  ///
  /// - [`SchedulerError::NotFound`]: No job with this identifier is registered.
  pub async fn remove_job_strict(&self, job_id: JobId) -> Result<(), SchedulerError> {
    self
      .request(|responder| SchedulerCommand::RemoveJob {
        job_id,
        strict: true,
        responder,
      })
      .await?
      .map(|_| ())
  }

  /// Removes every job carrying `tag` and returns how many were removed.
  pub async fn remove_jobs_by_tag(&self, tag: &str) -> Result<usize, SchedulerError> {
    let tag = tag.to_string();
    self
      .request(|responder| SchedulerCommand::RemoveByTag { tag, responder })
      .await
  }

  /// Atomically replaces a job's definition.
  ///
  /// The schedule kind must stay the same. If the schedule parameters change,
  /// or the update carries a start override, the next due instant is
  /// recomputed; otherwise the pending one is kept. Run counters survive
  /// unless the update asks for a reset.
  ///
  /// # Errors
  ///
  /// - [`SchedulerError::NotFound`]: No job with this identifier is registered.
  /// - [`SchedulerError::InvalidSchedule`]: The new definition is malformed or
  ///   changes the schedule kind.
  pub async fn update_job(&self, job_id: JobId, update: JobUpdate) -> Result<(), SchedulerError> {
    self.ensure_open()?;
    update.request.validate()?;
    self
      .request(|responder| SchedulerCommand::UpdateJob {
        job_id,
        update,
        responder,
      })
      .await?
  }

  /// Dispatches a run right away, leaving the job's next due instant alone.
  ///
  /// The run goes through the same singleton, concurrency and lock checks as
  /// a scheduled one, and counts toward `max_runs`. Works while stopped.
  pub async fn run_now(&self, job_id: JobId) -> Result<(), SchedulerError> {
    self
      .request(|responder| SchedulerCommand::RunNow { job_id, responder })
      .await?
  }

  // --- Lifecycle ---

  /// Begins (or resumes) dispatching due jobs.
  pub async fn start(&self) -> Result<(), SchedulerError> {
    self.set_running(true).await
  }

  /// Pauses dispatching. Runs in flight continue, and jobs can still be
  /// added, updated and triggered manually.
  pub async fn stop(&self) -> Result<(), SchedulerError> {
    self.set_running(false).await
  }

  /// Stops the scheduler for good.
  ///
  /// The dispatch loop exits, every run observes cancellation through its
  /// [`JobContext`](crate::job::context::JobContext), and this waits for runs
  /// in flight. With a timeout, runs still executing when it elapses are
  /// aborted at their next await point and their locks released. Finally the
  /// locker is closed.
  ///
  /// # Errors
  ///
  /// - [`ShutdownError::AlreadyShuttingDown`]: Called a second time.
  /// - [`ShutdownError::Timeout`]: Some runs had to be abandoned.
  /// - [`ShutdownError::TaskPanic`]: The dispatch loop panicked.
  pub async fn shutdown(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    let mut already_closed = false;
    self.inner.state.send_modify(|state| {
      if state.is_closed() {
        already_closed = true;
      } else {
        *state = SchedulerState::ShuttingDown;
      }
    });
    if already_closed {
      return Err(ShutdownError::AlreadyShuttingDown);
    }
    info!(?timeout, "Initiating shutdown...");

    let (responder, response_rx) = oneshot::channel();
    if self
      .inner
      .cmd_tx
      .send(SchedulerCommand::Shutdown { responder })
      .await
      .is_ok()
    {
      let _ = response_rx.await;
    } else {
      warn!("Dispatch loop already gone at shutdown.");
    }

    let loop_result = match self.inner.coordinator_handle.lock().await.take() {
      Some(handle) => match handle.await {
        Ok(()) => Ok(()),
        Err(e) if e.is_panic() => {
          error!("Dispatch loop panicked: {:?}", e);
          Err(ShutdownError::TaskPanic)
        }
        Err(_) => Ok(()),
      },
      None => Ok(()),
    };

    let executor_result = self.inner.executor.shutdown(timeout).await;

    if let Some(locker) = &self.inner.locker {
      locker.close().await;
    }
    self.inner.state.send_replace(SchedulerState::Terminated);
    info!("Scheduler terminated.");

    loop_result.and(executor_result)
  }

  // --- Queries ---

  /// A point-in-time copy of every registered job, oldest first.
  pub fn jobs(&self) -> JobSnapshot {
    let mut jobs: Vec<JobDetails> = self
      .inner
      .table
      .read()
      .values()
      .map(|published| published.read())
      .collect();
    jobs.sort_by_key(|job| (job.created_at, job.id));
    JobSnapshot::new(jobs)
  }

  /// Details of one job, or `None` if it is not (or no longer) registered.
  pub fn job(&self, job_id: JobId) -> Option<JobDetails> {
    self
      .inner
      .table
      .read()
      .get(&job_id)
      .map(|published| published.read())
  }

  /// Up to `count` upcoming due instants of a job, starting with its pending
  /// one. Empty for unknown jobs.
  pub fn next_runs(&self, job_id: JobId, count: usize) -> Vec<DateTime<Utc>> {
    self
      .job(job_id)
      .and_then(|details| {
        details
          .next_run
          .map(|from| details.schedule.preview(from, count, self.inner.timezone))
      })
      .unwrap_or_default()
  }

  pub fn state(&self) -> SchedulerState {
    *self.inner.state.borrow()
  }

  /// Receiver that observes every lifecycle transition.
  pub fn subscribe_state(&self) -> watch::Receiver<SchedulerState> {
    self.inner.state.subscribe()
  }

  pub fn metrics_snapshot(&self) -> MetricsSnapshot {
    self.inner.metrics.snapshot()
  }

  /// Triggers currently waiting for a free concurrency slot.
  pub fn jobs_waiting_in_queue(&self) -> usize {
    self.inner.executor.waiting()
  }

  pub fn timezone(&self) -> Tz {
    self.inner.timezone
  }

  // --- Internals ---

  async fn set_running(&self, running: bool) -> Result<(), SchedulerError> {
    self
      .request(|responder| SchedulerCommand::SetRunning { running, responder })
      .await
  }

  fn ensure_open(&self) -> Result<(), SchedulerError> {
    if self.state().is_closed() {
      return Err(SchedulerError::SchedulerClosed);
    }
    Ok(())
  }

  /// Sends a command built around a fresh responder and waits for the answer.
  async fn request<T>(
    &self,
    build: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand,
  ) -> Result<T, SchedulerError> {
    self.ensure_open()?;
    let (responder, response_rx) = oneshot::channel();
    self
      .inner
      .cmd_tx
      .send(build(responder))
      .await
      .map_err(|_| SchedulerError::SchedulerClosed)?;
    response_rx.await.map_err(|_| SchedulerError::ResponseFailed)
  }
}
