//! Rate limit counter storage.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::entry::RateLimitEntry;

/// Outcome of consuming one request against a store entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consumption {
    /// Whether the request fit under the ceiling
    pub allowed: bool,
    /// The entry as it stands after this request
    pub entry: RateLimitEntry,
}

/// Trait for rate limit counter storage.
///
/// Implementations must apply lookup-or-create, the ceiling check and the
/// increment as one atomic step per key. A networked backend would map
/// `try_consume` onto an atomic increment-with-expiry.
pub trait RateLimitStore: Send + Sync {
    /// Count one request for `key`, starting a new window when the current
    /// one is absent or expired. The count is only incremented when it is
    /// below `ceiling`.
    fn try_consume(
        &self,
        key: &str,
        window: Duration,
        ceiling: u64,
        now: DateTime<Utc>,
    ) -> Consumption;

    /// Remove every entry whose window has ended. Returns how many were removed.
    fn sweep(&self, now: DateTime<Utc>) -> usize;

    /// Number of stored entries, expired or not.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory store for a single process.
///
/// State is lost on restart and is not shared between instances.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, RateLimitEntry>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the live entry for `key`, replacing it with a fresh window if it
    /// is missing or expired.
    ///
    /// The returned guard holds the key's shard lock; drop it before touching
    /// the store again from the same thread.
    pub fn get_or_create(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> RefMut<'_, String, RateLimitEntry> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(key = %key, "Creating new rate limit entry");
                RateLimitEntry::new(key, now, window)
            });

        if entry.is_expired(now) {
            trace!(key = %key, count = entry.count, "Window expired, starting a new one");
            *entry = RateLimitEntry::new(key, now, window);
        }

        entry
    }

    /// Snapshot of the entry for `key`, if one is stored.
    pub fn get(&self, key: &str) -> Option<RateLimitEntry> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Remove all entries.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl RateLimitStore for MemoryStore {
    fn try_consume(
        &self,
        key: &str,
        window: Duration,
        ceiling: u64,
        now: DateTime<Utc>,
    ) -> Consumption {
        let mut entry = self.get_or_create(key, window, now);

        let allowed = entry.count < ceiling;
        if allowed {
            entry.count += 1;
        }

        Consumption {
            allowed,
            entry: entry.clone(),
        }
    }

    fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Spawn a task that sweeps `store` every `interval`.
///
/// The first sweep runs one interval after spawning. Abort the returned
/// handle to stop it.
pub fn spawn_sweeper<S>(store: Arc<S>, interval: std::time::Duration) -> JoinHandle<()>
where
    S: RateLimitStore + ?Sized + 'static,
{
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);

        loop {
            ticker.tick().await;
            let removed = store.sweep(Utc::now());
            debug!(
                removed = removed,
                remaining = store.len(),
                "Swept expired rate limit entries"
            );
        }
    })
}
