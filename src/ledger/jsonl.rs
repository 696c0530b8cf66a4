//! JSONL-backed ledger.
//!
//! A natural fit: the ledger is append-only by contract, and the file is
//! append-only by construction. Replay on open rebuilds the query index.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use super::{CallLedger, LedgerResult, ProviderCallRecord};

pub struct JsonlLedger {
    path: PathBuf,
    records: RwLock<Vec<ProviderCallRecord>>,
    writer: Mutex<File>,
}

impl JsonlLedger {
    /// Open or create the ledger at `path`, replaying any existing log.
    pub fn open(path: impl AsRef<Path>) -> LedgerResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut records = Vec::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ProviderCallRecord>(&line) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping corrupt ledger row");
                    }
                }
            }
        }

        let writer = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::debug!(path = %path.display(), records = records.len(), "ledger opened");

        Ok(Self {
            path,
            records: RwLock::new(records),
            writer: Mutex::new(writer),
        })
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl CallLedger for JsonlLedger {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn record(&self, record: ProviderCallRecord) -> LedgerResult<()> {
        let line = serde_json::to_string(&record)?;
        {
            let mut writer = self.writer.lock().await;
            writeln!(writer, "{line}")?;
            writer.flush()?;
        }
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

impl std::fmt::Debug for JsonlLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlLedger").field("path", &self.path).finish()
    }
}
