//! Lease-based mutual exclusion over the distributed store.
//!
//! Acquisition is `SET key token NX PX lease`, retried with capped backoff
//! until the wait window closes. Release deletes the key only if it still
//! holds this lock's token, so a lease that expired and was taken over by
//! another holder is never released by mistake.
//!
//! Both users of the lock (load de-duplication and stats merging) treat a
//! failed acquisition as "proceed without it".

use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::store::DistributedStore;

const LOCK_SUFFIX: &str = "_lock";
const INITIAL_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// A single lock attempt on one resource.
pub struct DistributedLock {
    store: Arc<dyn DistributedStore>,
    key: String,
    token: String,
    lease: Duration,
    wait: Duration,
    held: bool,
}

impl DistributedLock {
    /// Create a lock for `resource`; the store key is `{resource}_lock`.
    pub fn new(
        store: Arc<dyn DistributedStore>,
        resource: &str,
        lease: Duration,
        wait: Duration,
    ) -> Self {
        Self {
            store,
            key: format!("{resource}{LOCK_SUFFIX}"),
            token: Uuid::new_v4().to_string(),
            lease,
            wait,
            held: false,
        }
    }

    /// Store key used for this lock.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Try to take the lock, waiting at most the configured wait window.
    ///
    /// Store errors are logged and reported as "not acquired".
    pub async fn try_acquire(&mut self) -> bool {
        if self.held {
            return true;
        }

        let deadline = Instant::now() + self.wait;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match self
                .store
                .set_nx(&self.key, self.token.as_bytes(), self.lease)
                .await
            {
                Ok(true) => {
                    tracing::trace!(key = %self.key, "lock acquired");
                    self.held = true;
                    return true;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(key = %self.key, error = %e, "lock acquisition failed");
                    return false;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(key = %self.key, wait_ms = self.wait.as_millis() as u64, "lock wait timed out");
                return false;
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Release the lock if this instance still owns it.
    pub async fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;

        match self
            .store
            .delete_if_equals(&self.key, self.token.as_bytes())
            .await
        {
            Ok(true) => tracing::trace!(key = %self.key, "lock released"),
            Ok(false) => {
                tracing::debug!(key = %self.key, "lock lease expired before release")
            }
            Err(e) => tracing::warn!(key = %self.key, error = %e, "lock release failed"),
        }
    }
}
