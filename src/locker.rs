//! Cross-instance exclusivity for job runs.
//!
//! A [`Locker`] hands out at most one [`LockHandle`] per resource across all
//! cooperating scheduler instances. The executor asks for a lock named after
//! the job identifier before every run of a distributed job and releases it
//! when the run ends, whatever the outcome. An [`Elector`] is a coarser gate:
//! only the current leader runs distributed jobs at all.
//!
//! Backends are expected to use leases, so a claim held by a crashed process
//! expires on its own instead of wedging the other instances.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::LockError;

/// Default lease length of [`InMemoryLocker`].
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(300);

/// A held exclusivity claim, valid for one run.
#[async_trait]
pub trait LockHandle: Send + Sync {
  /// Releases the claim. Must be idempotent: calling it again, or after the
  /// lease expired, succeeds without effect.
  async fn unlock(&self) -> Result<(), LockError>;
}

/// Mutual exclusion on named resources across processes.
#[async_trait]
pub trait Locker: Send + Sync + 'static {
  /// Attempts to claim `resource` without waiting for a current holder.
  ///
  /// `Ok(None)` means another holder owns it; that is a normal outcome, not
  /// an error.
  async fn try_lock(&self, resource: &str) -> Result<Option<Box<dyn LockHandle>>, LockError>;

  /// Releases backend resources. Called once when the scheduler shuts down.
  async fn close(&self) {}
}

/// Leader election across processes.
#[async_trait]
pub trait Elector: Send + Sync + 'static {
  /// Whether this instance is currently the leader.
  async fn is_leader(&self) -> Result<bool, LockError>;
}

// --- In-memory lease locker ---

#[derive(Debug)]
struct Lease {
  token: Uuid,
  expires_at: Instant,
}

type LeaseMap = Arc<Mutex<HashMap<String, Lease>>>;

/// A process-local [`Locker`] with lease expiry.
///
/// Clones share the same lease table, so several schedulers in one process
/// (or a test simulating a fleet) can coordinate through it.
#[derive(Clone)]
pub struct InMemoryLocker {
  leases: LeaseMap,
  ttl: Duration,
}

impl InMemoryLocker {
  pub fn new() -> Self {
    Self::with_lease_ttl(DEFAULT_LEASE_TTL)
  }

  /// Creates a locker whose claims expire after `ttl` unless released first.
  pub fn with_lease_ttl(ttl: Duration) -> Self {
    Self {
      leases: Arc::new(Mutex::new(HashMap::new())),
      ttl,
    }
  }

  /// Whether `resource` is currently held by an unexpired lease.
  pub fn is_locked(&self, resource: &str) -> bool {
    self
      .leases
      .lock()
      .get(resource)
      .is_some_and(|lease| lease.expires_at > Instant::now())
  }
}

impl Default for InMemoryLocker {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for InMemoryLocker {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InMemoryLocker")
      .field("held", &self.leases.lock().len())
      .field("ttl", &self.ttl)
      .finish()
  }
}

#[async_trait]
impl Locker for InMemoryLocker {
  async fn try_lock(&self, resource: &str) -> Result<Option<Box<dyn LockHandle>>, LockError> {
    let now = Instant::now();
    let mut leases = self.leases.lock();
    if let Some(existing) = leases.get(resource) {
      if existing.expires_at > now {
        trace!(resource, "Lease held elsewhere.");
        return Ok(None);
      }
      debug!(resource, "Previous lease expired, taking over.");
    }
    let token = Uuid::new_v4();
    leases.insert(
      resource.to_string(),
      Lease {
        token,
        expires_at: now + self.ttl,
      },
    );
    Ok(Some(Box::new(InMemoryLockHandle {
      leases: self.leases.clone(),
      resource: resource.to_string(),
      token,
      released: AtomicBool::new(false),
    })))
  }

  async fn close(&self) {
    self.leases.lock().clear();
  }
}

struct InMemoryLockHandle {
  leases: LeaseMap,
  resource: String,
  token: Uuid,
  released: AtomicBool,
}

#[async_trait]
impl LockHandle for InMemoryLockHandle {
  async fn unlock(&self) -> Result<(), LockError> {
    if self.released.swap(true, Ordering::SeqCst) {
      return Ok(());
    }
    let mut leases = self.leases.lock();
    // Only drop the lease if it is still ours; it may have expired and been
    // taken over.
    if leases.get(&self.resource).is_some_and(|lease| lease.token == self.token) {
      leases.remove(&self.resource);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn second_claim_is_denied_until_unlock() {
    let locker = InMemoryLocker::new();
    let first = locker.try_lock("job-a").await.unwrap().expect("first claim");
    assert!(locker.try_lock("job-a").await.unwrap().is_none());
    assert!(locker.try_lock("job-b").await.unwrap().is_some());

    first.unlock().await.unwrap();
    first.unlock().await.unwrap();
    assert!(!locker.is_locked("job-a"));
    assert!(locker.try_lock("job-a").await.unwrap().is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn expired_lease_can_be_taken_over() {
    let locker = InMemoryLocker::with_lease_ttl(Duration::from_secs(5));
    let stale = locker.try_lock("job").await.unwrap().expect("claim");

    tokio::time::advance(Duration::from_secs(6)).await;
    let fresh = locker.try_lock("job").await.unwrap().expect("takeover");

    // The stale holder's unlock must not release the new lease.
    stale.unlock().await.unwrap();
    assert!(locker.is_locked("job"));
    fresh.unlock().await.unwrap();
    assert!(!locker.is_locked("job"));
  }

  #[tokio::test]
  async fn clones_share_leases() {
    let locker = InMemoryLocker::new();
    let peer = locker.clone();
    let _held = locker.try_lock("shared").await.unwrap().expect("claim");
    assert!(peer.try_lock("shared").await.unwrap().is_none());
  }
}
