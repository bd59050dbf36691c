//! Per-channel mutual exclusion for commits.
//!
//! A commit is a multi-step read-modify-write over the revision log (read
//! head, checkout, append). [`CommitSerializer`] hands out one FIFO async
//! lock per channel so those steps never interleave for the same channel
//! while unrelated channels proceed independently. The lock is released
//! when the [`CommitGuard`] drops, on every exit path.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Scoped ownership of a channel's commit lock.
pub struct CommitGuard {
    channel: String,
    _guard: OwnedMutexGuard<()>,
}

impl CommitGuard {
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl Drop for CommitGuard {
    fn drop(&mut self) {
        log::trace!("commit lock released: {}", self.channel);
    }
}

/// Map from channel to its commit lock.
#[derive(Debug, Default)]
pub struct CommitSerializer {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl CommitSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, channel: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for the channel's lock. Waiters are served in arrival order.
    pub async fn acquire(&self, channel: &str) -> CommitGuard {
        let lock = self.lock_for(channel);
        let guard = lock.lock_owned().await;
        log::trace!("commit lock acquired: {}", channel);
        CommitGuard {
            channel: channel.to_string(),
            _guard: guard,
        }
    }

    /// Run `task` while holding the channel's lock.
    pub async fn run<F, Fut, T>(&self, channel: &str, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire(channel).await;
        task().await
    }

    /// Forget locks that nobody holds or waits on.
    pub fn prune(&self) {
        let mut locks = self.locks.lock().unwrap();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Number of channels with a lock entry.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
