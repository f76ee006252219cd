//! tests/manual_clock.rs
//! Dispatch timing driven by an injected clock.

mod common;

use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc,
};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

use crate::common::{job_exec_counter, setup_tracing, wait_until};
use shiftkeeper::{JobRequest, ManualClock, SchedulerState, ShiftKeeper};

fn start_instant() -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

async fn manual_setup() -> (ShiftKeeper, ManualClock) {
  let clock = ManualClock::new(start_instant());
  let scheduler = ShiftKeeper::builder()
    .max_concurrent_jobs(2)
    .clock(clock.clone())
    .build()
    .unwrap();
  scheduler.start().await.unwrap();
  (scheduler, clock)
}

#[tokio::test]
async fn test_interval_runs_when_clock_advances() {
  setup_tracing();
  let (scheduler, clock) = manual_setup().await;
  let counter = Arc::new(AtomicUsize::new(0));
  let start = start_instant();

  let job_id = scheduler
    .add_job(
      JobRequest::from_interval("Minutely", StdDuration::from_secs(60)),
      job_exec_counter(counter.clone(), StdDuration::ZERO),
    )
    .await
    .unwrap();
  assert_eq!(
    scheduler.job(job_id).unwrap().next_run,
    Some(start + ChronoDuration::seconds(60))
  );

  tokio::time::sleep(StdDuration::from_millis(50)).await;
  assert_eq!(counter.load(Ordering::SeqCst), 0, "Nothing is due yet");

  clock.advance(StdDuration::from_secs(59));
  tokio::time::sleep(StdDuration::from_millis(50)).await;
  assert_eq!(counter.load(Ordering::SeqCst), 0, "Still one second early");

  clock.advance(StdDuration::from_secs(1));
  assert!(
    wait_until(StdDuration::from_secs(1), || {
      scheduler.job(job_id).is_some_and(|d| d.run_count == 1)
    })
    .await
  );
  let details = scheduler.job(job_id).unwrap();
  assert_eq!(details.next_run, Some(start + ChronoDuration::seconds(120)));
  assert_eq!(details.last_run, Some(start + ChronoDuration::seconds(60)));

  let metrics = scheduler.metrics_snapshot();
  assert_eq!(metrics.runs_dispatched, 1);
  assert_eq!(metrics.mean_dispatch_lag(), Some(StdDuration::ZERO));

  scheduler.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_missed_ticks_fire_once_and_resume_from_now() {
  setup_tracing();
  let (scheduler, clock) = manual_setup().await;
  let counter = Arc::new(AtomicUsize::new(0));
  let start = start_instant();

  let job_id = scheduler
    .add_job(
      JobRequest::from_interval("Minutely", StdDuration::from_secs(60)),
      job_exec_counter(counter.clone(), StdDuration::ZERO),
    )
    .await
    .unwrap();

  // Ten intervals pass at once.
  clock.advance(StdDuration::from_secs(600));
  assert!(
    wait_until(StdDuration::from_secs(1), || {
      scheduler.job(job_id).is_some_and(|d| d.run_count == 1)
    })
    .await
  );
  tokio::time::sleep(StdDuration::from_millis(100)).await;

  assert_eq!(counter.load(Ordering::SeqCst), 1, "Missed ticks are not replayed");
  assert_eq!(
    scheduler.job(job_id).unwrap().next_run,
    Some(start + ChronoDuration::seconds(660))
  );

  scheduler.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_stopped_scheduler_holds_due_jobs() {
  setup_tracing();
  let (scheduler, clock) = manual_setup().await;
  let counter = Arc::new(AtomicUsize::new(0));

  scheduler
    .add_job(
      JobRequest::from_interval("Paused", StdDuration::from_secs(60)),
      job_exec_counter(counter.clone(), StdDuration::ZERO),
    )
    .await
    .unwrap();

  scheduler.stop().await.unwrap();
  clock.advance(StdDuration::from_secs(300));
  tokio::time::sleep(StdDuration::from_millis(100)).await;
  assert_eq!(counter.load(Ordering::SeqCst), 0, "Stopped scheduler must not dispatch");

  scheduler.start().await.unwrap();
  assert!(wait_until(StdDuration::from_secs(1), || counter.load(Ordering::SeqCst) == 1).await);
  tokio::time::sleep(StdDuration::from_millis(100)).await;
  assert_eq!(counter.load(Ordering::SeqCst), 1);

  scheduler.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_one_time_job_retires_after_dispatch() {
  setup_tracing();
  let (scheduler, clock) = manual_setup().await;
  let counter = Arc::new(AtomicUsize::new(0));
  let start = start_instant();

  let job_id = scheduler
    .add_job(
      JobRequest::from_once("Once", start + ChronoDuration::seconds(30)),
      job_exec_counter(counter.clone(), StdDuration::ZERO),
    )
    .await
    .unwrap();

  clock.advance(StdDuration::from_secs(29));
  tokio::time::sleep(StdDuration::from_millis(50)).await;
  assert_eq!(counter.load(Ordering::SeqCst), 0);
  assert!(scheduler.job(job_id).is_some());

  clock.advance(StdDuration::from_secs(1));
  assert!(wait_until(StdDuration::from_secs(1), || counter.load(Ordering::SeqCst) == 1).await);
  assert!(scheduler.job(job_id).is_none());
  assert!(scheduler.next_runs(job_id, 5).is_empty());

  clock.advance(StdDuration::from_secs(3600));
  tokio::time::sleep(StdDuration::from_millis(50)).await;
  assert_eq!(counter.load(Ordering::SeqCst), 1);

  scheduler.shutdown(None).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_start_and_stop_leave_state_matching_the_loop() {
  setup_tracing();
  let (scheduler, clock) = manual_setup().await;
  let counter = Arc::new(AtomicUsize::new(0));

  scheduler
    .add_job(
      JobRequest::from_interval("Minutely", StdDuration::from_secs(60)),
      job_exec_counter(counter.clone(), StdDuration::ZERO),
    )
    .await
    .unwrap();

  for _ in 0..25 {
    let starter = scheduler.clone();
    let stopper = scheduler.clone();
    let (started, stopped) = tokio::join!(
      tokio::spawn(async move { starter.start().await }),
      tokio::spawn(async move { stopper.stop().await }),
    );
    started.unwrap().unwrap();
    stopped.unwrap().unwrap();

    let state = scheduler.state();
    let before = counter.load(Ordering::SeqCst);
    clock.advance(StdDuration::from_secs(60));

    match state {
      SchedulerState::Running => {
        assert!(
          wait_until(StdDuration::from_secs(1), || counter.load(Ordering::SeqCst) > before).await,
          "State says running but the due job was not dispatched"
        );
      }
      SchedulerState::Stopped => {
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert_eq!(
          counter.load(Ordering::SeqCst),
          before,
          "State says stopped but the due job was dispatched"
        );
        // Release the held run so the next round starts from a clean slate.
        scheduler.start().await.unwrap();
        assert!(
          wait_until(StdDuration::from_secs(1), || counter.load(Ordering::SeqCst) > before).await
        );
      }
      other => panic!("Unexpected state {:?}", other),
    }
  }

  scheduler.shutdown(None).await.unwrap();
}
