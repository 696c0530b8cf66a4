//! Keyed, TTL-bounded store of previously fetched provider answers.
//!
//! The upsert on `(provider, idempotency_key)` is the single most
//! important correctness property in the engine: it is what keeps two
//! concurrent misses for the same identity from racing into duplicate
//! billable calls. Every backend implements `put` as one atomic
//! insert-or-update.

pub mod memory;

#[cfg(feature = "jsonl")]
pub mod jsonl;

pub use memory::MemoryCacheStore;

#[cfg(feature = "jsonl")]
pub use jsonl::JsonlCacheStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::ParsedContacts;

/// Default cache validity window: 7 days from write time.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// One previously fetched, still-valid provider answer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheEntry {
    pub provider: String,
    pub idempotency_key: String,
    /// Hash of the exact request body, for integrity checking.
    pub payload_hash: String,
    /// Opaque serialized provider response.
    pub response_body: serde_json::Value,
    /// Contacts parsed once at write time.
    pub parsed_contacts: ParsedContacts,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Updated on every hit, for observability.
    pub last_seen: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(
        provider: impl Into<String>,
        idempotency_key: impl Into<String>,
        payload_hash: impl Into<String>,
        response_body: serde_json::Value,
        parsed_contacts: ParsedContacts,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            provider: provider.into(),
            idempotency_key: idempotency_key.into(),
            payload_hash: payload_hash.into(),
            response_body,
            parsed_contacts,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::days(7)),
            created_at: now,
            last_seen: now,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache storage error: {message}")]
    Storage { message: String },

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Cache store contract.
///
/// `lookup` treats rows with `expires_at` in the past as misses (lazy
/// expiry, no background sweep needed) and touches `last_seen` on a hit.
#[async_trait]
pub trait CacheStore: Send + Sync {
    fn name(&self) -> &str;

    async fn lookup(&self, provider: &str, idempotency_key: &str)
    -> CacheResult<Option<CacheEntry>>;

    /// Atomic insert-or-update keyed on `(provider, idempotency_key)`,
    /// overwriting an expired or existing entry.
    async fn put(&self, entry: CacheEntry) -> CacheResult<()>;

    /// Administrative sweep of expired rows. Returns the number removed.
    async fn purge_expired(&self) -> CacheResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_expiry() {
        let entry = CacheEntry::new(
            "skiptrace",
            "key",
            "hash",
            serde_json::json!({}),
            ParsedContacts::default(),
            Duration::from_secs(60),
        );
        assert!(!entry.is_expired_at(Utc::now()));
        assert!(entry.is_expired_at(Utc::now() + chrono::Duration::seconds(61)));
    }
}
