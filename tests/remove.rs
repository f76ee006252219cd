//! tests/remove.rs
//! Removing jobs by identifier and by tag.

mod common;

use std::sync::{
  atomic::{AtomicBool, AtomicUsize, Ordering},
  Arc,
};
use std::time::Duration as StdDuration;

use crate::common::{
  job_exec_counter, job_exec_flag, setup_tracing, started_scheduler, wait_until, RecordingMonitor,
};
use shiftkeeper::{JobRequest, SchedulerError, ShiftKeeper, SingletonMode, SkipReason};
use uuid::Uuid;

#[tokio::test]
async fn test_remove_lets_running_execution_finish() {
  setup_tracing();
  let scheduler = started_scheduler(2).await;
  let finished = Arc::new(AtomicBool::new(false));

  let mut req = JobRequest::from_interval("Long Runner", StdDuration::from_millis(200));
  req.start_immediately();
  let job_id = scheduler
    .add_job(req, job_exec_flag(finished.clone(), StdDuration::from_millis(400)))
    .await
    .unwrap();

  assert!(
    wait_until(StdDuration::from_secs(1), || {
      scheduler.job(job_id).is_some_and(|d| d.in_flight == 1)
    })
    .await
  );
  assert_eq!(scheduler.remove_job(job_id).await, Ok(true));
  assert!(scheduler.job(job_id).is_none());
  assert!(scheduler.jobs().is_empty());

  assert!(
    wait_until(StdDuration::from_secs(1), || finished.load(Ordering::SeqCst)).await,
    "The in-flight run must complete"
  );
  let dispatched = scheduler.metrics_snapshot().runs_dispatched;

  tokio::time::sleep(StdDuration::from_millis(500)).await;
  let metrics = scheduler.metrics_snapshot();
  assert_eq!(metrics.runs_dispatched, dispatched, "Nothing is scheduled after removal");
  assert_eq!(metrics.jobs_removed, 1);
  assert_eq!(metrics.runs_in_flight_current, 0);

  scheduler.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_remove_unknown_job() {
  setup_tracing();
  let scheduler = started_scheduler(1).await;
  let unknown = Uuid::new_v4();

  assert_eq!(scheduler.remove_job(unknown).await, Ok(false));
  assert_eq!(
    scheduler.remove_job_strict(unknown).await,
    Err(SchedulerError::NotFound(unknown))
  );

  let job_id = scheduler
    .add_job(
      JobRequest::from_interval("Strict", StdDuration::from_secs(3600)),
      job_exec_counter(Arc::new(AtomicUsize::new(0)), StdDuration::ZERO),
    )
    .await
    .unwrap();
  assert_eq!(scheduler.remove_job_strict(job_id).await, Ok(()));
  assert_eq!(scheduler.remove_job(job_id).await, Ok(false));
  assert_eq!(
    scheduler.run_now(job_id).await,
    Err(SchedulerError::NotFound(job_id))
  );

  scheduler.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_remove_jobs_by_tag() {
  setup_tracing();
  let scheduler = started_scheduler(1).await;
  let counter = Arc::new(AtomicUsize::new(0));

  let mut kept = Vec::new();
  for (name, tags) in [
    ("Nightly Report", vec!["reports", "nightly"]),
    ("Weekly Report", vec!["reports"]),
    ("Cache Warmup", vec!["nightly"]),
    ("Untagged", vec![]),
  ] {
    let mut req = JobRequest::from_interval(name, StdDuration::from_secs(3600));
    for tag in tags {
      req.with_tag(tag);
    }
    let job_id = scheduler
      .add_job(req, job_exec_counter(counter.clone(), StdDuration::ZERO))
      .await
      .unwrap();
    if name == "Cache Warmup" || name == "Untagged" {
      kept.push(job_id);
    }
  }

  assert_eq!(scheduler.remove_jobs_by_tag("reports").await, Ok(2));
  assert_eq!(scheduler.remove_jobs_by_tag("reports").await, Ok(0));
  assert_eq!(scheduler.remove_jobs_by_tag("no-such-tag").await, Ok(0));

  let remaining: Vec<_> = scheduler.jobs().iter().map(|j| j.id).collect();
  assert_eq!(remaining, kept);
  assert_eq!(scheduler.metrics_snapshot().jobs_removed, 2);

  scheduler.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_queued_rerun_of_removed_job_is_skipped() {
  setup_tracing();
  let monitor = RecordingMonitor::new();
  let scheduler = ShiftKeeper::builder()
    .monitor(monitor.clone())
    .build()
    .unwrap();
  scheduler.start().await.unwrap();
  let counter = Arc::new(AtomicUsize::new(0));

  let mut req = JobRequest::from_interval("Queued", StdDuration::from_secs(3600));
  req.singleton(SingletonMode::Queue);
  let job_id = scheduler
    .add_job(req, job_exec_counter(counter.clone(), StdDuration::from_millis(300)))
    .await
    .unwrap();

  scheduler.run_now(job_id).await.unwrap();
  assert!(wait_until(StdDuration::from_secs(1), || counter.load(Ordering::SeqCst) == 1).await);
  scheduler.run_now(job_id).await.unwrap();
  tokio::time::sleep(StdDuration::from_millis(50)).await;
  assert!(scheduler.remove_job(job_id).await.unwrap());

  tokio::time::sleep(StdDuration::from_millis(500)).await;
  assert_eq!(counter.load(Ordering::SeqCst), 1, "The rerun must not execute");
  assert_eq!(monitor.skips(), vec![SkipReason::JobRemoved]);
  assert_eq!(monitor.successes(), 1);

  scheduler.shutdown(None).await.unwrap();
}
