pub mod context;
pub mod schedule;

use std::collections::{BTreeSet, HashMap};
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, NaiveTime, Utc, Weekday};
#[cfg(feature = "cron_schedule")]
use chrono_tz::Tz;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{RunError, SchedulerError};
use crate::monitor::SkipReason;

pub use schedule::Schedule;

// --- Public Type Aliases ---

/// Unique identifier of a registered job. Generated (UUID v4) unless the
/// request supplies one via [`JobRequest::with_id`].
pub type JobId = Uuid;

/// Unique identifier of a single execution attempt of a job.
pub type RunId = Uuid;

/// Error type a task may return.
pub type TaskError = Box<dyn StdError + Send + Sync + 'static>;

/// What a task resolves to. `Err` is recorded as [`RunError::TaskError`].
pub type TaskResult = Result<(), TaskError>;

/// The unit of work a job executes.
///
/// Called once per run; the returned future is driven on its own Tokio task.
/// Panics, either while creating the future or while polling it, are caught
/// and recorded as [`RunError::TaskPanic`].
pub type BoxedExecFn =
  Box<dyn Fn() -> Pin<Box<dyn Future<Output = TaskResult> + Send + 'static>> + Send + Sync + 'static>;

// --- Execution Policy ---

/// How overlapping runs of the same job are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConcurrencyMode {
  /// Any number of runs of the job may execute at once.
  #[default]
  Unlimited,
  /// At most one run of the job executes at a time.
  Singleton(SingletonMode),
}

/// What a singleton job does with a trigger that arrives while a run is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SingletonMode {
  /// Drop the trigger.
  Skip,
  /// Run once the in-flight run finishes. Further triggers arriving while one
  /// rerun is already queued are coalesced into it.
  Queue,
}

/// Override for when the first run of a job happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub(crate) enum StartAt {
  Immediately,
  At(DateTime<Utc>),
}

// --- Job Request ---

/// Declarative definition of a job: schedule, execution policy and metadata.
///
/// Build one with a constructor such as [`JobRequest::from_interval`] and
/// refine it with the `with_*` setters before passing it to
/// [`ShiftKeeper::add_job`](crate::ShiftKeeper::add_job).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JobRequest {
  /// A descriptive name, used in logs, spans and monitor events.
  pub name: String,
  pub schedule: Schedule,
  pub concurrency: ConcurrencyMode,
  /// Retire the job after this many executions. Skipped triggers do not count.
  pub max_runs: Option<u64>,
  /// Free-form labels used for bulk removal.
  pub tags: BTreeSet<String>,
  /// Whether runs go through the scheduler's locker and elector, when configured.
  pub distributed: bool,
  pub(crate) id: Option<JobId>,
  pub(crate) start: Option<StartAt>,
}

impl JobRequest {
  /// Creates a request with default policy: unlimited concurrency, no run
  /// limit, no tags, distributed locking enabled.
  pub fn new(name: &str, schedule: Schedule) -> Self {
    Self {
      name: name.to_string(),
      schedule,
      concurrency: ConcurrencyMode::Unlimited,
      max_runs: None,
      tags: BTreeSet::new(),
      distributed: true,
      id: None,
      start: None,
    }
  }

  /// Runs exactly once at `run_at`, or immediately if `run_at` has passed.
  pub fn from_once(name: &str, run_at: DateTime<Utc>) -> Self {
    Self::new(name, Schedule::Once(run_at))
  }

  /// Runs every `interval`, first one interval after registration.
  pub fn from_interval(name: &str, interval: StdDuration) -> Self {
    Self::new(name, Schedule::FixedInterval(interval))
  }

  /// Runs repeatedly, waiting a random duration in `[min, max)` between runs.
  pub fn from_random_interval(name: &str, min: StdDuration, max: StdDuration) -> Self {
    Self::new(name, Schedule::RandomInterval { min, max })
  }

  /// Runs according to a cron expression in the scheduler's timezone.
  #[cfg(feature = "cron_schedule")]
  pub fn from_cron(name: &str, expression: &str) -> Self {
    Self::new(
      name,
      Schedule::Cron {
        expression: expression.to_string(),
        timezone: None,
      },
    )
  }

  /// Runs according to a cron expression evaluated in `timezone`.
  #[cfg(feature = "cron_schedule")]
  pub fn from_cron_in(name: &str, expression: &str, timezone: Tz) -> Self {
    Self::new(
      name,
      Schedule::Cron {
        expression: expression.to_string(),
        timezone: Some(timezone),
      },
    )
  }

  /// Runs every day at each of `times`.
  pub fn daily(name: &str, times: Vec<NaiveTime>) -> Self {
    Self::new(name, Schedule::Daily { times })
  }

  /// Runs on each of `days` at each of `times`.
  pub fn weekly(name: &str, days: Vec<Weekday>, times: Vec<NaiveTime>) -> Self {
    Self::new(name, Schedule::Weekly { days, times })
  }

  /// Runs on each of `days` of the month at each of `times`. Negative days
  /// count from the end of the month.
  pub fn monthly(name: &str, days: Vec<i32>, times: Vec<NaiveTime>) -> Self {
    Self::new(name, Schedule::Monthly { days, times })
  }

  /// Registers the job under an explicit identifier instead of a generated one.
  ///
  /// Instances sharing a locker must register a shared job under the same
  /// identifier, since the identifier is the lock resource.
  pub fn with_id(&mut self, id: JobId) -> &mut Self {
    self.id = Some(id);
    self
  }

  /// Overrides the first due instant. Later runs follow the schedule.
  pub fn with_initial_run_time(&mut self, run_at: DateTime<Utc>) -> &mut Self {
    self.start = Some(StartAt::At(run_at));
    self
  }

  /// Makes the first run due as soon as the job is registered.
  pub fn start_immediately(&mut self) -> &mut Self {
    self.start = Some(StartAt::Immediately);
    self
  }

  pub fn with_tag(&mut self, tag: &str) -> &mut Self {
    self.tags.insert(tag.to_string());
    self
  }

  /// Prevents overlapping runs, handling extra triggers per `mode`.
  pub fn singleton(&mut self, mode: SingletonMode) -> &mut Self {
    self.concurrency = ConcurrencyMode::Singleton(mode);
    self
  }

  pub fn with_max_runs(&mut self, max_runs: u64) -> &mut Self {
    self.max_runs = Some(max_runs);
    self
  }

  /// Runs this job locally even when the scheduler has a locker or elector.
  pub fn without_distributed_lock(&mut self) -> &mut Self {
    self.distributed = false;
    self
  }

  /// The explicit identifier, if one was set.
  pub fn id(&self) -> Option<JobId> {
    self.id
  }

  /// Rejects malformed definitions.
  pub fn validate(&self) -> Result<(), SchedulerError> {
    self.schedule.validate()?;
    if self.max_runs == Some(0) {
      return Err(SchedulerError::InvalidSchedule(
        "max_runs must be greater than zero".to_string(),
      ));
    }
    Ok(())
  }

  /// First due instant, honoring a start override.
  pub(crate) fn initial_due(
    &self,
    now: DateTime<Utc>,
    tz: chrono_tz::Tz,
  ) -> Option<DateTime<Utc>> {
    match self.start {
      Some(StartAt::Immediately) => Some(now),
      Some(StartAt::At(at)) => Some(at.max(now)),
      None => self.schedule.first_due(now, tz),
    }
  }
}

// --- Internal Job State ---

/// The immutable part of a job: its request plus the task. Replaced
/// wholesale on update.
pub(crate) struct JobDefinition {
  pub request: JobRequest,
  pub exec_fn: Arc<BoxedExecFn>,
}

impl fmt::Debug for JobDefinition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobDefinition")
      .field("request", &self.request)
      .field("exec_fn", &format_args!("Arc<BoxedExecFn>"))
      .finish()
  }
}

/// State shared between the dispatch loop and the executor for one job.
///
/// The dispatch loop is the only writer of the definition; the executor reads
/// it at the start of each run and owns the in-flight bookkeeping.
#[derive(Debug)]
pub(crate) struct JobRuntime {
  pub id: JobId,
  definition: RwLock<Arc<JobDefinition>>,
  pub in_flight: AtomicUsize,
  /// Held for the whole run of a singleton job.
  pub singleton_gate: Arc<tokio::sync::Mutex<()>>,
  /// Set while one queued rerun waits on `singleton_gate`.
  pub rerun_queued: AtomicBool,
  /// Set once the job has been removed; queued runs observe it and skip.
  pub removed: AtomicBool,
}

impl JobRuntime {
  pub fn new(id: JobId, definition: JobDefinition) -> Self {
    Self {
      id,
      definition: RwLock::new(Arc::new(definition)),
      in_flight: AtomicUsize::new(0),
      singleton_gate: Arc::new(tokio::sync::Mutex::new(())),
      rerun_queued: AtomicBool::new(false),
      removed: AtomicBool::new(false),
    }
  }

  pub fn definition(&self) -> Arc<JobDefinition> {
    self.definition.read().clone()
  }

  pub fn replace_definition(&self, definition: JobDefinition) {
    *self.definition.write() = Arc::new(definition);
  }

  pub fn is_removed(&self) -> bool {
    self.removed.load(Ordering::SeqCst)
  }

  pub fn in_flight(&self) -> usize {
    self.in_flight.load(Ordering::SeqCst)
  }
}

/// The read-only job table the dispatch loop publishes for `jobs()`.
pub(crate) type JobTable = Arc<RwLock<HashMap<JobId, PublishedJob>>>;

/// One row of the published table. `details.in_flight` is refreshed from the
/// runtime when read.
#[derive(Debug, Clone)]
pub(crate) struct PublishedJob {
  pub details: JobDetails,
  pub runtime: Arc<JobRuntime>,
}

impl PublishedJob {
  pub fn read(&self) -> JobDetails {
    let mut details = self.details.clone();
    details.in_flight = self.runtime.in_flight();
    details
  }
}

// --- Public Snapshot Structs ---

/// Read-only copy of a job's definition and runtime state.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JobDetails {
  pub id: JobId,
  pub name: String,
  pub tags: BTreeSet<String>,
  pub schedule: Schedule,
  pub concurrency: ConcurrencyMode,
  pub max_runs: Option<u64>,
  pub distributed: bool,
  /// The pending due instant in the time index.
  pub next_run: Option<DateTime<Utc>>,
  /// When the most recent completed run started.
  pub last_run: Option<DateTime<Utc>>,
  /// The error of the most recent completed run, cleared by a success.
  pub last_error: Option<RunError>,
  /// Wall time of the most recent completed run.
  pub last_duration: Option<StdDuration>,
  /// Completed executions (successful or not) since registration or the last
  /// counter reset.
  pub run_count: u64,
  /// Dispatches that ended without running the task.
  pub skip_count: u64,
  pub last_skip: Option<SkipReason>,
  /// Runs of this job executing right now.
  pub in_flight: usize,
  pub created_at: DateTime<Utc>,
}

/// A finite, restartable snapshot of the scheduler's jobs.
///
/// Holds its own copy of the metadata; iterate it as many times as needed.
#[derive(Debug, Clone, Default)]
pub struct JobSnapshot {
  jobs: Arc<[JobDetails]>,
}

impl JobSnapshot {
  pub(crate) fn new(jobs: Vec<JobDetails>) -> Self {
    Self { jobs: jobs.into() }
  }

  pub fn iter(&self) -> std::slice::Iter<'_, JobDetails> {
    self.jobs.iter()
  }

  pub fn len(&self) -> usize {
    self.jobs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.jobs.is_empty()
  }

  /// Looks up a job in the snapshot by identifier.
  pub fn get(&self, id: JobId) -> Option<&JobDetails> {
    self.jobs.iter().find(|job| job.id == id)
  }
}

impl<'a> IntoIterator for &'a JobSnapshot {
  type Item = &'a JobDetails;
  type IntoIter = std::slice::Iter<'a, JobDetails>;

  fn into_iter(self) -> Self::IntoIter {
    self.jobs.iter()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn setters_chain_and_validate() {
    let mut request = JobRequest::from_interval("report", StdDuration::from_secs(30));
    request
      .with_tag("reports")
      .singleton(SingletonMode::Skip)
      .with_max_runs(3)
      .without_distributed_lock();

    assert!(request.validate().is_ok());
    assert_eq!(request.concurrency, ConcurrencyMode::Singleton(SingletonMode::Skip));
    assert!(request.tags.contains("reports"));
    assert!(!request.distributed);
  }

  #[test]
  fn zero_max_runs_is_rejected() {
    let mut request = JobRequest::from_interval("x", StdDuration::from_secs(1));
    request.with_max_runs(0);
    assert!(matches!(
      request.validate(),
      Err(SchedulerError::InvalidSchedule(_))
    ));
  }

  #[test]
  fn start_override_replaces_first_due_only() {
    let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let mut request = JobRequest::from_interval("x", StdDuration::from_secs(60));
    assert_eq!(
      request.initial_due(now, chrono_tz::Tz::UTC),
      Some(now + chrono::Duration::seconds(60))
    );
    request.start_immediately();
    assert_eq!(request.initial_due(now, chrono_tz::Tz::UTC), Some(now));
  }
}
