//! TTL-bounded key-value storage.
//!
//! Records written through [`KeyValueStore::put`] disappear once their TTL
//! elapses. A `get` after expiry returns `None`, which callers treat as a
//! normal outcome rather than an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};

/// Trait for TTL-bounded record storage.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Store `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Fetch the live value for `key`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` only if `key` holds no live value.
    ///
    /// Returns `true` when this call claimed the key. The check and the
    /// write are a single atomic step.
    async fn put_if_absent(&self, key: &str, value: String, ttl: Duration) -> Result<bool>;

    /// Delete `key`, returning whether a live value was removed.
    async fn remove(&self, key: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Writes between opportunistic sweeps of expired entries.
const SWEEP_EVERY: u64 = 256;

/// In-memory [`KeyValueStore`] with lazy expiry.
///
/// Expired entries are ignored on read. They are dropped by
/// [`purge_expired`](Self::purge_expired), when overwritten, and by a periodic
/// sweep during writes.
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    entries: RwLock<HashMap<String, Entry>>,
    writes: AtomicU64,
}

impl InMemoryKeyValueStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry, returning how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        sweep(&mut entries, Instant::now())
    }

    /// Count a write and sweep if one is due. Caller holds the write lock.
    fn after_write(&self, entries: &mut HashMap<String, Entry>, now: Instant) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_EVERY == 0 {
            sweep(entries, now);
        }
    }

    /// Number of entries held, including expired ones not yet purged.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the store holds no entries at all.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn sweep(entries: &mut HashMap<String, Entry>, now: Instant) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| entry.is_live(now));
    let purged = before - entries.len();
    if purged > 0 {
        debug!(purged, remaining = entries.len(), "Purged expired entries");
    }
    purged
}

fn check_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(Error::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        check_key(key)?;
        let now = Instant::now();
        let entry = Entry {
            value,
            expires_at: now + ttl,
        };
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), entry);
        self.after_write(&mut entries, now);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        check_key(key)?;
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn put_if_absent(&self, key: &str, value: String, ttl: Duration) -> Result<bool> {
        check_key(key)?;
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
        self.after_write(&mut entries, now);
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        check_key(key)?;
        let now = Instant::now();
        let removed = self.entries.write().await.remove(key);
        Ok(removed.is_some_and(|entry| entry.is_live(now)))
    }
}
