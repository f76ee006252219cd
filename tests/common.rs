//! tests/common.rs
//! Shared helper functions for integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use parking_lot::Mutex;
use shiftkeeper::{
  error::{BuildError, LockError, RunError},
  job::{BoxedExecFn, TaskError, TaskResult},
  locker::{Elector, LockHandle, Locker},
  monitor::{JobEvent, Monitor, SkipReason},
  ShiftKeeper,
};
use tracing_subscriber::fmt::TestWriter;

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_writer(TestWriter::new())
    .with_test_writer()
    .try_init();
}

// Builds a scheduler with the given concurrency cap, not yet started.
pub fn build_scheduler(max_concurrent_jobs: usize) -> Result<ShiftKeeper, BuildError> {
  ShiftKeeper::builder()
    .max_concurrent_jobs(max_concurrent_jobs)
    .build()
}

// Builds and starts a scheduler.
pub async fn started_scheduler(max_concurrent_jobs: usize) -> ShiftKeeper {
  let scheduler = build_scheduler(max_concurrent_jobs).expect("build scheduler");
  scheduler.start().await.expect("start scheduler");
  scheduler
}

// Polls `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: StdDuration, condition: impl Fn() -> bool) -> bool {
  let deadline = tokio::time::Instant::now() + timeout;
  loop {
    if condition() {
      return true;
    }
    if tokio::time::Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(StdDuration::from_millis(10)).await;
  }
}

// Creates a job function that increments a counter, optionally delays, and
// then succeeds or fails.
pub fn job_exec_counter_result(
  counter: Arc<AtomicUsize>,
  delay: StdDuration,
  succeeds: bool,
) -> BoxedExecFn {
  Box::new(move || {
    let ctr = counter.clone();
    Box::pin(async move {
      let count = ctr.fetch_add(1, Ordering::SeqCst) + 1;
      tracing::debug!(count, succeeds, "Counter job executing");
      if delay > StdDuration::ZERO {
        tokio::time::sleep(delay).await;
      }
      let result: TaskResult = if succeeds {
        Ok(())
      } else {
        Err("counter job asked to fail".into())
      };
      result
    })
  })
}

pub fn job_exec_counter(counter: Arc<AtomicUsize>, delay: StdDuration) -> BoxedExecFn {
  job_exec_counter_result(counter, delay, true)
}

// Creates a job function that sets a flag once it has finished its delay.
pub fn job_exec_flag(flag: Arc<AtomicBool>, delay: StdDuration) -> BoxedExecFn {
  Box::new(move || {
    let flg = flag.clone();
    Box::pin(async move {
      tracing::debug!("Flag job executing");
      if delay > StdDuration::ZERO {
        tokio::time::sleep(delay).await;
      }
      flg.store(true, Ordering::SeqCst);
      Ok::<(), TaskError>(())
    })
  })
}

// Creates a job function whose future panics.
pub fn job_exec_panic() -> BoxedExecFn {
  Box::new(move || {
    Box::pin(async move {
      tracing::debug!("Panic job executing...");
      tokio::task::yield_now().await;
      let forced = true;
      if forced {
        panic!("Job forced panic!");
      }
      Ok::<(), TaskError>(())
    })
  })
}

// Increments `active` on start and decrements it on end, recording the
// highest value observed in `max_observed`.
pub fn job_exec_concurrency_tracker(
  active_counter: Arc<AtomicUsize>,
  max_observed_active: Arc<AtomicUsize>,
  delay: StdDuration,
) -> BoxedExecFn {
  Box::new(move || {
    let active = active_counter.clone();
    let max_obs = max_observed_active.clone();
    Box::pin(async move {
      let current_active = active.fetch_add(1, Ordering::SeqCst) + 1;
      tracing::debug!(current_active, "Concurrency job START");
      max_obs.fetch_max(current_active, Ordering::SeqCst);

      if delay > StdDuration::ZERO {
        tokio::time::sleep(delay).await;
      }

      active.fetch_sub(1, Ordering::SeqCst);
      Ok::<(), TaskError>(())
    })
  })
}

// --- Monitor ---

#[derive(Debug, Clone)]
pub enum Recorded {
  Started(JobEvent),
  Succeeded(JobEvent, StdDuration),
  Failed(JobEvent, RunError),
  Skipped(JobEvent, SkipReason),
}

// Monitor that records every callback in order.
#[derive(Debug, Default)]
pub struct RecordingMonitor {
  events: Mutex<Vec<Recorded>>,
}

impl RecordingMonitor {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn events(&self) -> Vec<Recorded> {
    self.events.lock().clone()
  }

  pub fn starts(&self) -> usize {
    self
      .events
      .lock()
      .iter()
      .filter(|e| matches!(e, Recorded::Started(_)))
      .count()
  }

  pub fn successes(&self) -> usize {
    self
      .events
      .lock()
      .iter()
      .filter(|e| matches!(e, Recorded::Succeeded(..)))
      .count()
  }

  pub fn failures(&self) -> Vec<RunError> {
    self
      .events
      .lock()
      .iter()
      .filter_map(|e| match e {
        Recorded::Failed(_, error) => Some(error.clone()),
        _ => None,
      })
      .collect()
  }

  pub fn skips(&self) -> Vec<SkipReason> {
    self
      .events
      .lock()
      .iter()
      .filter_map(|e| match e {
        Recorded::Skipped(_, reason) => Some(*reason),
        _ => None,
      })
      .collect()
  }
}

impl Monitor for RecordingMonitor {
  fn on_job_start(&self, event: &JobEvent) {
    self.events.lock().push(Recorded::Started(event.clone()));
  }

  fn on_job_success(&self, event: &JobEvent, duration: StdDuration) {
    self
      .events
      .lock()
      .push(Recorded::Succeeded(event.clone(), duration));
  }

  fn on_job_failure(&self, event: &JobEvent, error: &RunError, _duration: StdDuration) {
    self
      .events
      .lock()
      .push(Recorded::Failed(event.clone(), error.clone()));
  }

  fn on_job_skipped(&self, event: &JobEvent, reason: SkipReason) {
    self
      .events
      .lock()
      .push(Recorded::Skipped(event.clone(), reason));
  }
}

// --- Lockers and electors ---

// A locker whose every resource is held by someone else. Clones share the
// attempt counter.
#[derive(Debug, Clone, Default)]
pub struct DenyAllLocker {
  pub attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl Locker for DenyAllLocker {
  async fn try_lock(&self, _resource: &str) -> Result<Option<Box<dyn LockHandle>>, LockError> {
    self.attempts.fetch_add(1, Ordering::SeqCst);
    Ok(None)
  }
}

// A locker whose backend always fails.
#[derive(Debug, Default)]
pub struct BrokenLocker;

#[async_trait]
impl Locker for BrokenLocker {
  async fn try_lock(&self, _resource: &str) -> Result<Option<Box<dyn LockHandle>>, LockError> {
    Err(LockError::Backend("connection refused".to_string()))
  }
}

// A locker that never answers within any reasonable lock timeout.
#[derive(Debug, Default)]
pub struct StalledLocker;

#[async_trait]
impl Locker for StalledLocker {
  async fn try_lock(&self, _resource: &str) -> Result<Option<Box<dyn LockHandle>>, LockError> {
    tokio::time::sleep(StdDuration::from_secs(3600)).await;
    Ok(None)
  }
}

// Elector with a fixed answer.
#[derive(Debug)]
pub struct StaticElector(pub bool);

#[async_trait]
impl Elector for StaticElector {
  async fn is_leader(&self) -> Result<bool, LockError> {
    Ok(self.0)
  }
}
