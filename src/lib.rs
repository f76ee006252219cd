//! ShiftKeeper: An In-Process Job Scheduler for Tokio
//!
//! Runs async tasks on fixed or randomized intervals, cron expressions,
//! calendar times or once at an instant, with per-job overlap control, a
//! global concurrency cap and optional cross-instance locking.
//!
//! # Features
//!
//! - Schedule jobs using:
//!   - One-time execution at a specific `DateTime<Utc>`.
//!   - Fixed intervals, or intervals sampled from a `[min, max)` range.
//!   - Cron expressions with 5, 6 or 7 fields, in any `chrono_tz` timezone
//!     (requires the `cron_schedule` feature, on by default). Classic 5-field
//!     expressions count weekdays from `0` = Sunday.
//!   - Daily, weekly and monthly local times of day.
//! - Missed ticks are never replayed: a late job fires once and resumes its
//!   cadence from now.
//! - Singleton jobs that either skip or queue one rerun while a run is in flight.
//! - A global concurrency cap with a bounded admission queue in front of it.
//! - Pluggable [`Locker`] and [`Elector`] backends so a fleet of instances runs
//!   each distributed job on one node at a time. [`InMemoryLocker`] provides
//!   lease semantics in-process.
//! - Panic isolation around every task, and a [`Monitor`] hook for start,
//!   success, failure and skip events.
//! - Tag-based bulk removal, atomic updates, manual runs and run limits.
//! - Task-local [`JobContext`] with a cancellation token observed at shutdown.
//! - Injectable [`Clock`] for deterministic tests.
//! - Optional Serde support for public types (requires the `serde` feature).
//!
//! # Usage
//!
//! ```no_run
//! use shiftkeeper::{job_fn, JobRequest, ShiftKeeper, SingletonMode};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // tracing_subscriber::fmt().with_env_filter("warn,shiftkeeper=info").init();
//!
//!     let scheduler = ShiftKeeper::builder()
//!         .max_concurrent_jobs(4)
//!         .timezone(chrono_tz::Europe::London)
//!         .build()?;
//!
//!     let counter = Arc::new(AtomicUsize::new(0));
//!
//!     // Every 30 seconds, never overlapping with itself.
//!     let mut heartbeat = JobRequest::from_interval("heartbeat", Duration::from_secs(30));
//!     heartbeat.singleton(SingletonMode::Skip).with_tag("health");
//!     let heartbeat_id = scheduler
//!         .add_job(
//!             heartbeat,
//!             job_fn! {
//!                 { let counter = counter.clone(); }
//!                 {
//!                     counter.fetch_add(1, Ordering::SeqCst);
//!                     Ok(())
//!                 }
//!             },
//!         )
//!         .await?;
//!
//!     // Weekdays at 06:00 London time, at second 0.
//!     #[cfg(feature = "cron_schedule")]
//!     scheduler
//!         .add_job(
//!             JobRequest::from_cron("nightly-report", "0 6 * * Mon-Fri"),
//!             job_fn! {{
//!                 tracing::info!("building report");
//!                 Ok(())
//!             }},
//!         )
//!         .await?;
//!
//!     scheduler.start().await?;
//!     tokio::time::sleep(Duration::from_secs(65)).await;
//!
//!     println!("upcoming: {:?}", scheduler.next_runs(heartbeat_id, 3));
//!     println!("metrics: {:#?}", scheduler.metrics_snapshot());
//!
//!     scheduler.shutdown(Some(Duration::from_secs(10))).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! Use the [`SchedulerBuilder`] to configure the scheduler:
//! - `max_concurrent_jobs`: Concurrency cap across all jobs.
//! - `queue_capacity`: Triggers allowed to wait for a free slot before new ones are dropped.
//! - `timezone`: Zone for calendar and cron schedules.
//! - `locker`, `elector`, `lock_timeout`: Cross-instance exclusivity.
//! - `monitor`: Run lifecycle hook.
//! - `clock`: Time source.
//!
//! # Job Lifecycle & State
//!
//! - Jobs are defined by [`JobRequest`] with one [`Schedule`] kind.
//! - The dispatch loop owns all jobs; it wakes at the earliest due instant and
//!   hands each due job to the executor without waiting for it.
//! - Every dispatch ends as exactly one run or one skip ([`SkipReason`]).
//! - One-time jobs, exhausted calendar jobs and jobs that reached `max_runs`
//!   are retired and no longer listed by [`ShiftKeeper::jobs`].
//!
//! # Accessing Job Context
//!
//! Inside a task, [`try_get_current_job_context`] returns the current run's
//! [`JobContext`]; the `job_context!()` macro does the same but panics outside
//! a run.
//!
//! ```no_run
//! use shiftkeeper::{job_fn, try_get_current_job_context};
//!
//! let task = job_fn! {{
//!     if let Some(ctx) = try_get_current_job_context() {
//!         tracing::info!(job_id = %ctx.job_id, run_id = %ctx.run_id, "running");
//!         if ctx.is_cancelled() {
//!             return Ok(());
//!         }
//!     }
//!     Ok(())
//! }};
//! ```
//!
//! # Observability
//!
//! - [`ShiftKeeper::metrics_snapshot`] returns a [`MetricsSnapshot`].
//! - [`ShiftKeeper::jobs`] and [`ShiftKeeper::job`] return [`JobDetails`].
//! - Every run executes inside a `job_run` `tracing` span.

pub mod clock;
pub mod command;
mod coordinator;
pub mod error;
mod executor;
pub mod job;
pub mod locker;
mod macros;
pub mod metrics;
pub mod monitor;
pub mod scheduler;

// --- Public Re-exports ---

// Core scheduler components
pub use scheduler::{SchedulerBuilder, SchedulerState, ShiftKeeper};

// Error types
pub use error::{BuildError, LockError, RunError, SchedulerError, ShutdownError};

// Job related types
pub use command::JobUpdate;
pub use job::{
  BoxedExecFn, ConcurrencyMode, JobDetails, JobId, JobRequest, JobSnapshot, RunId, Schedule,
  SingletonMode, TaskError, TaskResult,
};
pub use job::context::{try_get_current_job_context, JobContext};

// Extension points
pub use clock::{Clock, ManualClock, SystemClock};
pub use locker::{Elector, InMemoryLocker, LockHandle, Locker};
pub use monitor::{JobEvent, Monitor, NoopMonitor, SkipReason, Trigger};

// Metrics related types
pub use metrics::{MetricsSnapshot, SchedulerMetrics};
