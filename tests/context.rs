//! Tests for the per-run `JobContext` task-local.

mod common;

use crate::common::{setup_tracing, started_scheduler, wait_until};

use std::sync::Arc;
use std::time::Duration as StdDuration;

use parking_lot::Mutex;
use shiftkeeper::{job_context, job_fn, try_get_current_job_context, JobContext, JobRequest, Trigger};

#[tokio::test]
async fn test_job_context_access() {
  setup_tracing();
  let scheduler = started_scheduler(1).await;

  // Context captured from the first run, plus whether both accessors agreed.
  let captured = Arc::new(Mutex::new(None::<(JobContext, bool)>));

  let task_capture = captured.clone();
  let mut req = JobRequest::from_interval("Context Job", StdDuration::from_secs(3600));
  req.start_immediately();
  let job_id = scheduler
    .add_job(
      req,
      job_fn! {
        { let capture = task_capture.clone(); }
        {
          tracing::info!("Context test job executing...");
          let via_helper = try_get_current_job_context();
          // Panics if the context is not set.
          let via_macro = job_context!();
          let agree = via_helper
            .as_ref()
            .is_some_and(|ctx| ctx.run_id == via_macro.run_id && ctx.job_id == via_macro.job_id);
          capture.lock().get_or_insert((via_macro, agree));
          Ok(())
        }
      },
    )
    .await
    .unwrap();

  assert!(wait_until(StdDuration::from_secs(1), || captured.lock().is_some()).await);
  let (ctx, agree) = captured.lock().clone().unwrap();

  assert!(agree, "Helper and macro must see the same context");
  assert_eq!(ctx.job_id, job_id);
  assert!(!ctx.run_id.is_nil());
  assert_eq!(ctx.trigger, Trigger::Scheduled);
  assert!(!ctx.is_cancelled());

  scheduler.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_each_run_gets_a_fresh_run_id() {
  setup_tracing();
  let scheduler = started_scheduler(2).await;
  let seen = Arc::new(Mutex::new(Vec::<JobContext>::new()));
  let task_seen = seen.clone();

  let job_id = scheduler
    .add_job(
      JobRequest::from_interval("Manual Context", StdDuration::from_secs(3600)),
      job_fn! {
        { let seen = task_seen.clone(); }
        {
          if let Some(ctx) = try_get_current_job_context() {
            seen.lock().push(ctx);
          }
          Ok(())
        }
      },
    )
    .await
    .unwrap();

  scheduler.run_now(job_id).await.unwrap();
  scheduler.run_now(job_id).await.unwrap();
  assert!(wait_until(StdDuration::from_secs(1), || seen.lock().len() == 2).await);

  let runs = seen.lock().clone();
  assert!(runs.iter().all(|ctx| ctx.job_id == job_id));
  assert!(runs.iter().all(|ctx| ctx.trigger == Trigger::Manual));
  assert_ne!(runs[0].run_id, runs[1].run_id);

  scheduler.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_context_absent_outside_runs() {
  setup_tracing();
  assert!(try_get_current_job_context().is_none());

  let handle = tokio::spawn(async { try_get_current_job_context().is_none() });
  assert!(handle.await.unwrap());
}

#[tokio::test]
async fn test_context_set_during_sync_setup() {
  setup_tracing();
  let scheduler = started_scheduler(1).await;
  let setup_saw_context = Arc::new(Mutex::new(None::<bool>));
  let setup_flag = setup_saw_context.clone();

  let mut req = JobRequest::from_interval("Setup Context", StdDuration::from_secs(3600));
  req.start_immediately();
  scheduler
    .add_job(
      req,
      job_fn! {
        {
          let seen = try_get_current_job_context().is_some();
          let _ = setup_flag.lock().get_or_insert(seen);
        }
        { Ok(()) }
      },
    )
    .await
    .unwrap();

  assert!(wait_until(StdDuration::from_secs(1), || setup_saw_context.lock().is_some()).await);
  assert_eq!(*setup_saw_context.lock(), Some(true));

  scheduler.shutdown(None).await.unwrap();
}
