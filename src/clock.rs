//! Time sources used by the dispatch loop and schedule computation.
//!
//! The scheduler never calls `Utc::now()` directly. Everything that needs the
//! current instant, or needs to wait for a future instant, goes through a
//! [`Clock`]. Production code uses [`SystemClock`]; tests can inject a
//! [`ManualClock`] and move time forward explicitly.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// An abstract source of "now" plus the ability to wait until an instant.
pub trait Clock: Send + Sync + fmt::Debug + 'static {
  /// The current instant according to this clock.
  fn now(&self) -> DateTime<Utc>;

  /// Returns a future that resolves once `now() >= deadline`.
  ///
  /// Resolves immediately if the deadline has already passed.
  fn sleep_until(&self, deadline: DateTime<Utc>) -> BoxFuture<'static, ()>;
}

// --- Wall clock ---

/// Wall-clock time backed by `chrono::Utc` and Tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }

  fn sleep_until(&self, deadline: DateTime<Utc>) -> BoxFuture<'static, ()> {
    let delay = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Box::pin(tokio::time::sleep(delay))
  }
}

// --- Manual clock ---

struct ManualClockInner {
  now: Mutex<DateTime<Utc>>,
  changed: Notify,
}

/// A deterministic clock that only moves when told to.
///
/// Cloning shares the same underlying time, so a test can keep one clone and
/// hand another to the scheduler builder. Pending [`Clock::sleep_until`]
/// futures wake as soon as the clock is advanced or set past their deadline.
#[derive(Clone)]
pub struct ManualClock {
  inner: Arc<ManualClockInner>,
}

impl ManualClock {
  /// Creates a clock frozen at `start`.
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      inner: Arc::new(ManualClockInner {
        now: Mutex::new(start),
        changed: Notify::new(),
      }),
    }
  }

  /// Moves the clock forward by `by`.
  pub fn advance(&self, by: Duration) {
    let step = ChronoDuration::from_std(by).unwrap_or(ChronoDuration::MAX);
    {
      let mut now = self.inner.now.lock();
      *now = now.checked_add_signed(step).unwrap_or(*now);
    }
    self.inner.changed.notify_waiters();
  }

  /// Jumps the clock to `instant`. Moving backwards is allowed.
  pub fn set(&self, instant: DateTime<Utc>) {
    *self.inner.now.lock() = instant;
    self.inner.changed.notify_waiters();
  }
}

impl fmt::Debug for ManualClock {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ManualClock")
      .field("now", &*self.inner.now.lock())
      .finish()
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.inner.now.lock()
  }

  fn sleep_until(&self, deadline: DateTime<Utc>) -> BoxFuture<'static, ()> {
    let inner = self.inner.clone();
    Box::pin(async move {
      loop {
        let notified = inner.changed.notified();
        tokio::pin!(notified);
        // Register before checking so an advance between the check and the
        // await is not missed.
        notified.as_mut().enable();
        if *inner.now.lock() >= deadline {
          return;
        }
        notified.await;
      }
    })
  }
}
