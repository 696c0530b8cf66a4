//! In-memory cache backend.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use super::{CacheEntry, CacheResult, CacheStore};

/// DashMap-backed cache. The map's entry operations give the atomic
/// upsert the contract requires without any application-level locking.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: DashMap<(String, String), CacheEntry>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn lookup(
        &self,
        provider: &str,
        idempotency_key: &str,
    ) -> CacheResult<Option<CacheEntry>> {
        let key = (provider.to_string(), idempotency_key.to_string());
        let now = Utc::now();

        if let Some(mut entry) = self.entries.get_mut(&key) {
            if entry.is_expired_at(now) {
                drop(entry);
                self.entries.remove(&key);
                return Ok(None);
            }
            entry.last_seen = now;
            return Ok(Some(entry.clone()));
        }
        Ok(None)
    }

    async fn put(&self, entry: CacheEntry) -> CacheResult<()> {
        let key = (entry.provider.clone(), entry.idempotency_key.clone());
        self.entries.insert(key, entry);
        Ok(())
    }

    async fn purge_expired(&self) -> CacheResult<usize> {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
        Ok(before - self.entries.len())
    }
}
