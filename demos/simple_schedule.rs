//! demos/simple_schedule.rs
//!
//! Demonstrates basic usage of ShiftKeeper:
//! - Building and starting the scheduler.
//! - An interval job, a daily job and a one-time job.
//! - Inspecting the job table and metrics.
//! - Graceful shutdown.

use chrono::{Duration as ChronoDuration, NaiveTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use shiftkeeper::{job_fn, JobRequest, ShiftKeeper};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let filter = tracing_subscriber::EnvFilter::try_new("warn,shiftkeeper=info,simple_schedule=info")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  let scheduler = ShiftKeeper::builder().max_concurrent_jobs(2).build()?;
  scheduler.start().await?;

  let ticks = Arc::new(AtomicUsize::new(0));
  let task_ticks = ticks.clone();
  let mut heartbeat = JobRequest::from_interval("Heartbeat", StdDuration::from_secs(1));
  heartbeat.start_immediately().with_tag("demo");
  scheduler
    .add_job(
      heartbeat,
      job_fn! {
        { let ticks = task_ticks.clone(); }
        {
          let count = ticks.fetch_add(1, Ordering::Relaxed) + 1;
          info!(count, "Heartbeat");
          Ok(())
        }
      },
    )
    .await?;

  let report_times = vec![
    NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
    NaiveTime::from_hms_opt(17, 30, 0).unwrap_or_default(),
  ];
  let report_id = scheduler
    .add_job(
      JobRequest::daily("Twice Daily Report", report_times),
      job_fn! {{
        info!("Generating report...");
        Ok(())
      }},
    )
    .await?;
  info!(upcoming = ?scheduler.next_runs(report_id, 3), "Report schedule");

  scheduler
    .add_job(
      JobRequest::from_once("Reminder", Utc::now() + ChronoDuration::seconds(2)),
      job_fn! {{
        info!("One-time reminder fired.");
        Ok(())
      }},
    )
    .await?;

  tokio::time::sleep(StdDuration::from_millis(3500)).await;

  for job in &scheduler.jobs() {
    info!(name = %job.name, runs = job.run_count, next = ?job.next_run, "Job");
  }
  info!("Metrics: {:#?}", scheduler.metrics_snapshot());

  scheduler.shutdown(Some(StdDuration::from_secs(5))).await?;
  info!(ticks = ticks.load(Ordering::Relaxed), "Scheduler shut down.");
  Ok(())
}
