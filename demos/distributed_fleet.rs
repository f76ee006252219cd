//! demos/distributed_fleet.rs
//!
//! Two scheduler instances share one locker, simulating a fleet. A job
//! registered on both under the same identifier runs on only one instance
//! per trigger; the other reports a skip to its monitor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use shiftkeeper::{
  job_context, job_fn, InMemoryLocker, JobEvent, JobRequest, Monitor, ShiftKeeper, SingletonMode,
  SkipReason,
};
use tracing::{info, warn};
use uuid::Uuid;

struct LoggingMonitor {
  node: &'static str,
}

impl Monitor for LoggingMonitor {
  fn on_job_skipped(&self, event: &JobEvent, reason: SkipReason) {
    warn!(node = self.node, job = %event.job_name, %reason, "Run skipped");
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let filter = tracing_subscriber::EnvFilter::try_new("warn,shiftkeeper=info,distributed_fleet=info")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  let locker = InMemoryLocker::new();
  let shared_id = Uuid::new_v4();
  let executions = Arc::new(AtomicUsize::new(0));

  let mut nodes = Vec::new();
  for node in ["node-a", "node-b"] {
    let scheduler = ShiftKeeper::builder()
      .locker(locker.clone())
      .monitor(LoggingMonitor { node })
      .lock_timeout(StdDuration::from_millis(200))
      .build()?;
    scheduler.start().await?;

    let mut req = JobRequest::from_interval("Nightly Cleanup", StdDuration::from_secs(1));
    req
      .with_id(shared_id)
      .start_immediately()
      .singleton(SingletonMode::Skip);
    let task_executions = executions.clone();
    scheduler
      .add_job(
        req,
        job_fn! {
          { let executions = task_executions.clone(); }
          {
            let ctx = job_context!();
            executions.fetch_add(1, Ordering::Relaxed);
            info!(node, run_id = %ctx.run_id, "Cleaning up...");
            tokio::time::sleep(StdDuration::from_millis(300)).await;
            Ok(())
          }
        },
      )
      .await?;
    nodes.push(scheduler);
  }

  tokio::time::sleep(StdDuration::from_millis(3500)).await;

  for (name, scheduler) in ["node-a", "node-b"].iter().zip(&nodes) {
    let metrics = scheduler.metrics_snapshot();
    info!(
      node = name,
      succeeded = metrics.runs_succeeded,
      skipped = metrics.runs_skipped_lock,
      "Node summary"
    );
    scheduler.shutdown(Some(StdDuration::from_secs(2))).await?;
  }
  info!(total = executions.load(Ordering::Relaxed), "Fleet executions");
  Ok(())
}
