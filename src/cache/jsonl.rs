//! JSONL-backed cache store.
//!
//! Every upsert appends one serialized entry; replay on open keeps the
//! last row per `(provider, idempotency_key)`, so the append log carries
//! upsert semantics across restarts. `last_seen` touches are memory-only
//! (appending a row per read would grow the log with read traffic).

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;

use super::{CacheEntry, CacheResult, CacheStore};

pub struct JsonlCacheStore {
    path: PathBuf,
    entries: DashMap<(String, String), CacheEntry>,
    writer: Mutex<File>,
}

impl JsonlCacheStore {
    /// Open or create the store at `path`, replaying any existing log.
    pub fn open(path: impl AsRef<Path>) -> CacheResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let entries = DashMap::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<CacheEntry>(&line) {
                    Ok(entry) => {
                        let key = (entry.provider.clone(), entry.idempotency_key.clone());
                        entries.insert(key, entry);
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping corrupt cache row");
                    }
                }
            }
        }

        let writer = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::debug!(path = %path.display(), entries = entries.len(), "cache store opened");

        Ok(Self {
            path,
            entries,
            writer: Mutex::new(writer),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rewrite the log to contain only the live entries.
    async fn compact(&self) -> CacheResult<()> {
        let mut writer = self.writer.lock().await;
        let mut file = File::create(&self.path)?;
        for entry in self.entries.iter() {
            let line = serde_json::to_string(entry.value())?;
            writeln!(file, "{line}")?;
        }
        file.flush()?;
        *writer = OpenOptions::new().append(true).open(&self.path)?;
        Ok(())
    }
}

#[async_trait]
impl CacheStore for JsonlCacheStore {
    fn name(&self) -> &str {
        "jsonl"
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
        let line = serde_json::to_string(&entry)?;
        // Append under the writer lock, then publish to the index. A
        // reader can only observe an entry that is already durable.
        {
            let mut writer = self.writer.lock().await;
            writeln!(writer, "{line}")?;
            writer.flush()?;
        }
        let key = (entry.provider.clone(), entry.idempotency_key.clone());
        self.entries.insert(key, entry);
        Ok(())
    }

    async fn purge_expired(&self) -> CacheResult<usize> {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
        let removed = before - self.entries.len();
        if removed > 0 {
            self.compact().await?;
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for JsonlCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlCacheStore")
            .field("path", &self.path)
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::provider::ParsedContacts;

    fn entry(key: &str, hash: &str) -> CacheEntry {
        CacheEntry::new(
            "skiptrace",
            key,
            hash,
            serde_json::json!({"phones": ["+15550001111"]}),
            ParsedContacts {
                phones: vec!["+15550001111".into()],
                emails: vec![],
            },
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.jsonl");

        {
            let store = JsonlCacheStore::open(&path).unwrap();
            store.put(entry("k1", "h1")).await.unwrap();
            store.put(entry("k2", "h2")).await.unwrap();
        }

        let store = JsonlCacheStore::open(&path).unwrap();
        assert_eq!(store.len(), 2);
        let hit = store.lookup("skiptrace", "k1").await.unwrap().unwrap();
        assert_eq!(hit.payload_hash, "h1");
    }

    #[tokio::test]
    async fn test_replay_keeps_last_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.jsonl");

        {
            let store = JsonlCacheStore::open(&path).unwrap();
            store.put(entry("k1", "h1")).await.unwrap();
            store.put(entry("k1", "h2")).await.unwrap();
        }

        let store = JsonlCacheStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        let hit = store.lookup("skiptrace", "k1").await.unwrap().unwrap();
        assert_eq!(hit.payload_hash, "h2");
    }

    #[tokio::test]
    async fn test_purge_compacts_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.jsonl");

        let store = JsonlCacheStore::open(&path).unwrap();
        store.put(entry("live", "h1")).await.unwrap();
        let mut stale = entry("stale", "h2");
        stale.expires_at = Utc::now() - chrono::Duration::seconds(1);
        store.put(stale).await.unwrap();

        assert_eq!(store.purge_expired().await.unwrap(), 1);

        let reopened = JsonlCacheStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert!(
            reopened
                .lookup("skiptrace", "stale")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_corrupt_rows_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.jsonl");

        {
            let store = JsonlCacheStore::open(&path).unwrap();
            store.put(entry("k1", "h1")).await.unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(file, "not json").unwrap();
        }

        let store = JsonlCacheStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
    }
}
