//! tests/monitor.rs
//! Monitor callbacks for started, finished and skipped runs.

mod common;

use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc,
};
use std::time::Duration as StdDuration;

use crate::common::{job_exec_counter, job_exec_counter_result, setup_tracing, wait_until, Recorded, RecordingMonitor};
use shiftkeeper::{JobRequest, RunError, ShiftKeeper, Trigger};

async fn monitored(monitor: Arc<RecordingMonitor>) -> ShiftKeeper {
  let scheduler = ShiftKeeper::builder()
    .max_concurrent_jobs(2)
    .monitor(monitor)
    .build()
    .unwrap();
  scheduler.start().await.unwrap();
  scheduler
}

#[tokio::test]
async fn test_start_and_success_share_the_run() {
  setup_tracing();
  let monitor = RecordingMonitor::new();
  let scheduler = monitored(monitor.clone()).await;
  let counter = Arc::new(AtomicUsize::new(0));

  let mut req = JobRequest::from_interval("Observed", StdDuration::from_millis(150));
  req.start_immediately();
  let job_id = scheduler
    .add_job(req, job_exec_counter(counter.clone(), StdDuration::from_millis(20)))
    .await
    .unwrap();

  assert!(wait_until(StdDuration::from_secs(2), || monitor.successes() >= 2).await);
  // The loop records how long the latest run took.
  assert!(
    wait_until(StdDuration::from_secs(1), || {
      scheduler
        .job(job_id)
        .and_then(|d| d.last_duration)
        .is_some_and(|d| d >= StdDuration::from_millis(20))
    })
    .await
  );
  assert_eq!(scheduler.job(job_id).unwrap().skip_count, 0);
  scheduler.shutdown(None).await.unwrap();

  let events = monitor.events();
  let starts: Vec<_> = events
    .iter()
    .filter_map(|e| match e {
      Recorded::Started(event) => Some(event.clone()),
      _ => None,
    })
    .collect();
  let successes: Vec<_> = events
    .iter()
    .filter_map(|e| match e {
      Recorded::Succeeded(event, duration) => Some((event.clone(), *duration)),
      _ => None,
    })
    .collect();

  assert_eq!(starts.len(), successes.len());
  assert_eq!(starts.len(), counter.load(Ordering::SeqCst));
  assert_eq!(starts[0].trigger, Trigger::Scheduled);
  for (start, (success, duration)) in starts.iter().zip(&successes) {
    assert_eq!(start.run_id, success.run_id);
    assert_eq!(start.job_id, job_id);
    assert_eq!(success.job_name, "Observed");
    assert_eq!(start.scheduled_for, success.scheduled_for);
    assert!(success.timestamp >= start.timestamp);
    assert!(*duration >= StdDuration::from_millis(20));
  }
  assert_ne!(starts[0].run_id, starts[1].run_id);

  // Every start precedes its outcome.
  let first_success = events
    .iter()
    .position(|e| matches!(e, Recorded::Succeeded(..)))
    .unwrap();
  let first_start = events
    .iter()
    .position(|e| matches!(e, Recorded::Started(_)))
    .unwrap();
  assert!(first_start < first_success);
}

#[tokio::test]
async fn test_failures_are_reported_with_the_error() {
  setup_tracing();
  let monitor = RecordingMonitor::new();
  let scheduler = monitored(monitor.clone()).await;
  let counter = Arc::new(AtomicUsize::new(0));

  let job_id = scheduler
    .add_job(
      JobRequest::from_interval("Flaky", StdDuration::from_secs(3600)),
      job_exec_counter_result(counter.clone(), StdDuration::ZERO, false),
    )
    .await
    .unwrap();
  scheduler.run_now(job_id).await.unwrap();

  assert!(wait_until(StdDuration::from_secs(1), || !monitor.failures().is_empty()).await);
  assert_eq!(
    monitor.failures(),
    vec![RunError::TaskError("counter job asked to fail".to_string())]
  );
  assert_eq!(monitor.successes(), 0);

  let failed_event = monitor
    .events()
    .into_iter()
    .find_map(|e| match e {
      Recorded::Failed(event, _) => Some(event),
      _ => None,
    })
    .unwrap();
  assert_eq!(failed_event.job_id, job_id);
  assert_eq!(failed_event.trigger, Trigger::Manual);

  scheduler.shutdown(None).await.unwrap();
}
