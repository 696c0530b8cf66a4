//! Append-only audit log of every attempted external call.
//!
//! The ledger is the source of truth for spend: the budget guardrail
//! derives the daily total by querying it, never from an in-process
//! counter, so cost accounting survives restarts. Rows are never updated
//! or deleted.
//!
//! Two kinds of rows share the table: billable calls (nonzero
//! `cost_cents`) and zero-cost observability rows (cache hits, failed
//! attempts). Cost queries only ever sum `cost_cents`, so the activity
//! log never pollutes the cost ledger.

pub mod memory;

#[cfg(feature = "jsonl")]
pub mod jsonl;

pub use memory::MemoryLedger;

#[cfg(feature = "jsonl")]
pub use jsonl::JsonlLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::run::RunId;

/// Endpoint marker for zero-cost cache-hit rows.
pub const CACHE_HIT_ENDPOINT: &str = "cache";

/// One row per attempted external call, billable or not.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderCallRecord {
    pub id: Uuid,
    pub provider: String,
    pub endpoint: String,
    /// Business entity the call was made for.
    pub subject_id: String,
    pub idempotency_key: String,
    /// Batch this call belongs to, if any.
    pub run_id: Option<RunId>,
    pub cost_cents: u32,
    pub status_code: Option<u16>,
    pub response_time_ms: u64,
    pub request_body: serde_json::Value,
    pub response_body: Option<serde_json::Value>,
    pub payload_hash: String,
    pub error_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ProviderCallRecord {
    fn base(
        provider: &str,
        endpoint: &str,
        subject_id: &str,
        idempotency_key: &str,
        run_id: Option<RunId>,
        request_body: serde_json::Value,
        payload_hash: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider: provider.to_string(),
            endpoint: endpoint.to_string(),
            subject_id: subject_id.to_string(),
            idempotency_key: idempotency_key.to_string(),
            run_id,
            cost_cents: 0,
            status_code: None,
            response_time_ms: 0,
            request_body,
            response_body: None,
            payload_hash: payload_hash.to_string(),
            error_text: None,
            created_at: Utc::now(),
        }
    }

    /// A successful provider-backed call that was billed.
    #[allow(clippy::too_many_arguments)]
    pub fn billable(
        provider: &str,
        endpoint: &str,
        subject_id: &str,
        idempotency_key: &str,
        run_id: Option<RunId>,
        request_body: serde_json::Value,
        payload_hash: &str,
        cost_cents: u32,
        status_code: u16,
        response_time_ms: u64,
        response_body: serde_json::Value,
    ) -> Self {
        Self {
            cost_cents,
            status_code: Some(status_code),
            response_time_ms,
            response_body: Some(response_body),
            ..Self::base(
                provider,
                endpoint,
                subject_id,
                idempotency_key,
                run_id,
                request_body,
                payload_hash,
            )
        }
    }

    /// A provider call that failed. Zero cost: only successful
    /// provider-backed calls count as billable.
    #[allow(clippy::too_many_arguments)]
    pub fn failed(
        provider: &str,
        endpoint: &str,
        subject_id: &str,
        idempotency_key: &str,
        run_id: Option<RunId>,
        request_body: serde_json::Value,
        payload_hash: &str,
        status_code: Option<u16>,
        response_time_ms: u64,
        error_text: &str,
    ) -> Self {
        Self {
            status_code,
            response_time_ms,
            error_text: Some(error_text.to_string()),
            ..Self::base(
                provider,
                endpoint,
                subject_id,
                idempotency_key,
                run_id,
                request_body,
                payload_hash,
            )
        }
    }

    /// A zero-cost observability row for a resolution served from cache.
    pub fn cache_hit(
        provider: &str,
        subject_id: &str,
        idempotency_key: &str,
        run_id: Option<RunId>,
        payload_hash: &str,
    ) -> Self {
        Self::base(
            provider,
            CACHE_HIT_ENDPOINT,
            subject_id,
            idempotency_key,
            run_id,
            serde_json::Value::Null,
            payload_hash,
        )
    }

    pub fn is_billable(&self) -> bool {
        self.cost_cents > 0
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger storage error: {message}")]
    Storage { message: String },

    #[error("ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("ledger io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Append-only call ledger contract. No update or delete operations.
#[async_trait]
pub trait CallLedger: Send + Sync {
    fn name(&self) -> &str;

    async fn record(&self, record: ProviderCallRecord) -> LedgerResult<()>;

    /// Total recorded cost for a provider in `[since, until)`.
    async fn sum_cost_cents(
        &self,
        provider: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> LedgerResult<u64>;

    /// Number of recorded attempts for a subject in `[since, until)`.
    async fn count_calls(
        &self,
        subject_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> LedgerResult<usize>;

    /// Number of billable rows for a provider in `[since, until)`.
    async fn billable_count(
        &self,
        provider: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> LedgerResult<usize>;

    /// Everything that happened for one subject, oldest first. Forensic
    /// reconstruction, not a hot path.
    async fn calls_for_subject(&self, subject_id: &str)
    -> LedgerResult<Vec<ProviderCallRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_rows_are_not_billable() {
        let record = ProviderCallRecord::failed(
            "skiptrace",
            "https://api.example.com/v1/lookup",
            "lead-1",
            "key",
            None,
            serde_json::json!({}),
            "hash",
            Some(503),
            120,
            "transient: unavailable",
        );
        assert!(!record.is_billable());
        assert_eq!(record.error_text.as_deref(), Some("transient: unavailable"));
    }

    #[test]
    fn test_cache_hit_rows_are_marked() {
        let record = ProviderCallRecord::cache_hit("skiptrace", "lead-1", "key", None, "hash");
        assert!(!record.is_billable());
        assert_eq!(record.endpoint, CACHE_HIT_ENDPOINT);
        assert_eq!(record.cost_cents, 0);
    }
}
