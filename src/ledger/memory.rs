//! In-memory ledger backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{CallLedger, LedgerResult, ProviderCallRecord};

/// Append-only vector behind a lock. Inserts are single atomic
/// operations; queries scan, which is fine at audit-log volumes.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    records: RwLock<Vec<ProviderCallRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl CallLedger for MemoryLedger {
    fn name(&self) -> &str {
        "memory"
    }

    async fn record(&self, record: ProviderCallRecord) -> LedgerResult<()> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn sum_cost_cents(
        &self,
        provider: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> LedgerResult<u64> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| r.provider == provider && r.created_at >= since && r.created_at < until)
            .map(|r| u64::from(r.cost_cents))
            .sum())
    }

    async fn count_calls(
        &self,
        subject_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> LedgerResult<usize> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| r.subject_id == subject_id && r.created_at >= since && r.created_at < until)
            .count())
    }

    async fn billable_count(
        &self,
        provider: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> LedgerResult<usize> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| {
                r.provider == provider
                    && r.is_billable()
                    && r.created_at >= since
                    && r.created_at < until
            })
            .count())
    }

    async fn calls_for_subject(
        &self,
        subject_id: &str,
    ) -> LedgerResult<Vec<ProviderCallRecord>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| r.subject_id == subject_id)
            .cloned()
            .collect())
    }
}
