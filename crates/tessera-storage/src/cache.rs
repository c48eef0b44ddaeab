//! Key-value cache collaborator.
//!
//! The cache stores short-lived values with an expiry. The storage layer
//! only uses it to stamp pagination nonces: a nonce is stored when a page
//! is served and spent (deleted) when its follow-up token is presented.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache as MokaCache;
use moka::Expiry;
use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// Key-value cache backend.
#[async_trait]
pub trait Cache: Send + Sync + 'static {
    async fn ping(&self) -> StorageResult<()>;

    /// Reads a key. Fails with `NotFound` if missing or expired.
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Stores a value that expires after `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StorageResult<()>;

    /// Deletes a key. Fails with `NotFound` if missing or expired.
    async fn del(&self, key: &str) -> StorageResult<()>;

    /// Deletes every key.
    async fn flush(&self) -> StorageResult<()>;

    async fn close(&self) -> StorageResult<()>;
}

/// Spends a pagination nonce. An unknown or already spent nonce is an
/// invalid token.
pub async fn spend_nonce(cache: &dyn Cache, nonce: &str) -> StorageResult<()> {
    match cache.del(nonce).await {
        Err(StorageError::NotFound { .. }) => Err(StorageError::InvalidToken),
        other => other,
    }
}

/// Configuration for [`MemoryCache`].
#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    /// Maximum number of entries kept.
    pub max_capacity: u64,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 100_000,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    /// `None` when the expiry lies beyond what `Instant` can represent.
    deadline: Option<Instant>,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.deadline.map_or(true, |deadline| deadline > Instant::now())
    }
}

/// Expires every entry at its own deadline.
struct Deadline;

impl Expiry<String, Entry> for Deadline {
    fn expire_after_create(&self, _key: &String, value: &Entry, created_at: Instant) -> Option<Duration> {
        value
            .deadline
            .map(|deadline| deadline.saturating_duration_since(created_at))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value
            .deadline
            .map(|deadline| deadline.saturating_duration_since(updated_at))
    }
}

/// In-memory [`Cache`] backed by Moka.
pub struct MemoryCache {
    entries: MokaCache<String, Entry>,
}

impl MemoryCache {
    pub fn new(config: MemoryCacheConfig) -> Self {
        let entries = MokaCache::builder()
            .max_capacity(config.max_capacity)
            .expire_after(Deadline)
            .build();
        Self { entries }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(MemoryCacheConfig::default())
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entry_count", &self.entries.entry_count())
            .finish()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn ping(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        match self.entries.get(key).await {
            Some(entry) if entry.is_live() => {
                metrics::counter!("tessera_cache_hits_total").increment(1);
                Ok(entry.value)
            }
            _ => {
                metrics::counter!("tessera_cache_misses_total").increment(1);
                Err(StorageError::not_found(key))
            }
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        let entry = Entry {
            value,
            deadline: Instant::now().checked_add(ttl),
        };
        self.entries.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn del(&self, key: &str) -> StorageResult<()> {
        match self.entries.remove(key).await {
            Some(entry) if entry.is_live() => Ok(()),
            _ => Err(StorageError::not_found(key)),
        }
    }

    async fn flush(&self) -> StorageResult<()> {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks().await;
        debug!("memory cache flushed");
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}
