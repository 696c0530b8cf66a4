//! PostgreSQL persistence backend.
//!
//! One store implements all three persistence boundaries against the
//! relational layout (`provider_calls`, `cache_entries`, `runs`,
//! `run_items`). Enable with the `postgres` feature flag.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers on
//! different processes never receive the same item.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::cache::{CacheEntry, CacheError, CacheResult, CacheStore};
use crate::ledger::{CallLedger, LedgerError, LedgerResult, ProviderCallRecord};
use crate::provider::ParsedContacts;
use crate::run::{
    Run, RunError, RunId, RunItem, RunItemId, RunItemStatus, RunResult, RunStore,
};

/// Relational backend for cache, ledger, and run state.
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::with_pool(Arc::new(pool)))
    }

    pub fn with_pool(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Create the tables if they do not exist.
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS provider_calls (
                id UUID PRIMARY KEY,
                provider VARCHAR(64) NOT NULL,
                endpoint TEXT NOT NULL,
                subject_id VARCHAR(255) NOT NULL,
                status_code INT,
                cost_cents INT NOT NULL DEFAULT 0,
                response_ms BIGINT NOT NULL DEFAULT 0,
                idempotency_key VARCHAR(64) NOT NULL,
                run_id UUID,
                request_json JSONB NOT NULL,
                response_json JSONB,
                payload_hash VARCHAR(64) NOT NULL,
                error_text TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE INDEX IF NOT EXISTS idx_provider_calls_subject ON provider_calls (subject_id);
            CREATE INDEX IF NOT EXISTS idx_provider_calls_window ON provider_calls (provider, created_at);

            CREATE TABLE IF NOT EXISTS cache_entries (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                provider VARCHAR(64) NOT NULL,
                idempotency_key VARCHAR(64) NOT NULL,
                payload_hash VARCHAR(64) NOT NULL,
                response_json JSONB NOT NULL,
                parsed_contacts_json JSONB NOT NULL,
                ttl_expires_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                last_seen TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (provider, idempotency_key)
            );

            CREATE TABLE IF NOT EXISTS runs (
                run_id UUID PRIMARY KEY,
                source_label TEXT NOT NULL,
                total INT NOT NULL,
                queued INT NOT NULL,
                in_flight INT NOT NULL,
                done INT NOT NULL,
                failed INT NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                finished_at TIMESTAMPTZ,
                soft_paused BOOLEAN NOT NULL DEFAULT FALSE,
                reason TEXT
            );

            CREATE TABLE IF NOT EXISTS run_items (
                id UUID PRIMARY KEY,
                run_id UUID NOT NULL REFERENCES runs (run_id),
                subject_id VARCHAR(255) NOT NULL,
                status VARCHAR(16) NOT NULL
                    CHECK (status IN ('queued', 'in_flight', 'done', 'failed')),
                attempt INT NOT NULL DEFAULT 0,
                idempotency_key VARCHAR(64) NOT NULL,
                normalized_address TEXT NOT NULL,
                normalized_person TEXT NOT NULL,
                last_error TEXT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE INDEX IF NOT EXISTS idx_run_items_run ON run_items (run_id);
            "#,
        )
        .execute(&*self.pool)
        .await?;
        Ok(())
    }
}

fn run_from_row(row: &PgRow) -> Run {
    Run {
        id: RunId::from(row.get::<Uuid, _>("run_id")),
        source_label: row.get("source_label"),
        total: row.get::<i32, _>("total") as u32,
        queued: row.get::<i32, _>("queued") as u32,
        in_flight: row.get::<i32, _>("in_flight") as u32,
        done: row.get::<i32, _>("done") as u32,
        failed: row.get::<i32, _>("failed") as u32,
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        soft_paused: row.get("soft_paused"),
        reason: row.get("reason"),
    }
}

fn item_from_row(row: &PgRow) -> RunResult<RunItem> {
    let status: String = row.get("status");
    let status = match status.as_str() {
        "queued" => RunItemStatus::Queued,
        "in_flight" => RunItemStatus::InFlight,
        "done" => RunItemStatus::Done,
        "failed" => RunItemStatus::Failed,
        other => {
            return Err(RunError::Storage {
                message: format!("unknown item status: {other}"),
            });
        }
    };
    Ok(RunItem {
        id: RunItemId::from(row.get::<Uuid, _>("id")),
        run_id: RunId::from(row.get::<Uuid, _>("run_id")),
        subject_id: row.get("subject_id"),
        status,
        attempt: row.get::<i32, _>("attempt") as u32,
        idempotency_key: row.get("idempotency_key"),
        normalized_address: row.get("normalized_address"),
        normalized_person: row.get("normalized_person"),
        last_error: row.get("last_error"),
        updated_at: row.get("updated_at"),
    })
}

const ITEM_COLUMNS: &str = "id, run_id, subject_id, status, attempt, idempotency_key, \
     normalized_address, normalized_person, last_error, updated_at";

#[async_trait]
impl CacheStore for PostgresStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn lookup(
        &self,
        provider: &str,
        idempotency_key: &str,
    ) -> CacheResult<Option<CacheEntry>> {
        let row = sqlx::query(
            r#"
            UPDATE cache_entries SET last_seen = NOW()
            WHERE provider = $1 AND idempotency_key = $2 AND ttl_expires_at > NOW()
            RETURNING provider, idempotency_key, payload_hash, response_json,
                      parsed_contacts_json, ttl_expires_at, created_at, last_seen
            "#,
        )
        .bind(provider)
        .bind(idempotency_key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| CacheError::Storage {
            message: e.to_string(),
        })?;

        match row {
            Some(row) => {
                let contacts: serde_json::Value = row.get("parsed_contacts_json");
                let parsed_contacts: ParsedContacts = serde_json::from_value(contacts)?;
                Ok(Some(CacheEntry {
                    provider: row.get("provider"),
                    idempotency_key: row.get("idempotency_key"),
                    payload_hash: row.get("payload_hash"),
                    response_body: row.get("response_json"),
                    parsed_contacts,
                    expires_at: row.get("ttl_expires_at"),
                    created_at: row.get("created_at"),
                    last_seen: row.get("last_seen"),
                }))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, entry: CacheEntry) -> CacheResult<()> {
        let contacts = serde_json::to_value(&entry.parsed_contacts)?;
        sqlx::query(
            r#"
            INSERT INTO cache_entries
                (provider, idempotency_key, payload_hash, response_json,
                 parsed_contacts_json, ttl_expires_at, created_at, last_seen)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (provider, idempotency_key) DO UPDATE SET
                payload_hash = $3,
                response_json = $4,
                parsed_contacts_json = $5,
                ttl_expires_at = $6,
                created_at = $7,
                last_seen = $8
            "#,
        )
        .bind(&entry.provider)
        .bind(&entry.idempotency_key)
        .bind(&entry.payload_hash)
        .bind(&entry.response_body)
        .bind(&contacts)
        .bind(entry.expires_at)
        .bind(entry.created_at)
        .bind(entry.last_seen)
        .execute(&*self.pool)
        .await
        .map_err(|e| CacheError::Storage {
            message: e.to_string(),
        })?;
        Ok(())
    }

    async fn purge_expired(&self) -> CacheResult<usize> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE ttl_expires_at <= NOW()")
            .execute(&*self.pool)
            .await
            .map_err(|e| CacheError::Storage {
                message: e.to_string(),
            })?;
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl CallLedger for PostgresStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn record(&self, record: ProviderCallRecord) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO provider_calls
                (id, provider, endpoint, subject_id, status_code, cost_cents, response_ms,
                 idempotency_key, run_id, request_json, response_json, payload_hash,
                 error_text, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(record.id)
        .bind(&record.provider)
        .bind(&record.endpoint)
        .bind(&record.subject_id)
        .bind(record.status_code.map(|s| s as i32))
        .bind(record.cost_cents as i32)
        .bind(record.response_time_ms as i64)
        .bind(&record.idempotency_key)
        .bind(record.run_id.map(|r| *r.as_uuid()))
        .bind(&record.request_body)
        .bind(&record.response_body)
        .bind(&record.payload_hash)
        .bind(&record.error_text)
        .bind(record.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| LedgerError::Storage {
            message: e.to_string(),
        })?;
        Ok(())
    }

    async fn sum_cost_cents(
        &self,
        provider: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> LedgerResult<u64> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(cost_cents), 0) AS total FROM provider_calls
            WHERE provider = $1 AND created_at >= $2 AND created_at < $3
            "#,
        )
        .bind(provider)
        .bind(since)
        .bind(until)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| LedgerError::Storage {
            message: e.to_string(),
        })?;
        Ok(row.get::<i64, _>("total") as u64)
    }

    async fn count_calls(
        &self,
        subject_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> LedgerResult<usize> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS calls FROM provider_calls
            WHERE subject_id = $1 AND created_at >= $2 AND created_at < $3
            "#,
        )
        .bind(subject_id)
        .bind(since)
        .bind(until)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| LedgerError::Storage {
            message: e.to_string(),
        })?;
        Ok(row.get::<i64, _>("calls") as usize)
    }

    async fn billable_count(
        &self,
        provider: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> LedgerResult<usize> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS calls FROM provider_calls
            WHERE provider = $1 AND cost_cents > 0 AND created_at >= $2 AND created_at < $3
            "#,
        )
        .bind(provider)
        .bind(since)
        .bind(until)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| LedgerError::Storage {
            message: e.to_string(),
        })?;
        Ok(row.get::<i64, _>("calls") as usize)
    }

    async fn calls_for_subject(
        &self,
        subject_id: &str,
    ) -> LedgerResult<Vec<ProviderCallRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, provider, endpoint, subject_id, status_code, cost_cents, response_ms,
                   idempotency_key, run_id, request_json, response_json, payload_hash,
                   error_text, created_at
            FROM provider_calls WHERE subject_id = $1 ORDER BY created_at
            "#,
        )
        .bind(subject_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| LedgerError::Storage {
            message: e.to_string(),
        })?;

        Ok(rows
            .iter()
            .map(|row| ProviderCallRecord {
                id: row.get("id"),
                provider: row.get("provider"),
                endpoint: row.get("endpoint"),
                subject_id: row.get("subject_id"),
                idempotency_key: row.get("idempotency_key"),
                run_id: row
                    .get::<Option<Uuid>, _>("run_id")
                    .map(RunId::from),
                cost_cents: row.get::<i32, _>("cost_cents") as u32,
                status_code: row.get::<Option<i32>, _>("status_code").map(|s| s as u16),
                response_time_ms: row.get::<i64, _>("response_ms") as u64,
                request_body: row.get("request_json"),
                response_body: row.get("response_json"),
                payload_hash: row.get("payload_hash"),
                error_text: row.get("error_text"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

impl PostgresStore {
    async fn finish_item_tx(
        &self,
        item_id: RunItemId,
        to: RunItemStatus,
        error: Option<&str>,
    ) -> RunResult<Run> {
        let mut tx = self.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE run_items
            SET status = $2, last_error = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'in_flight'
            RETURNING run_id
            "#,
        )
        .bind(*item_id.as_uuid())
        .bind(to.as_str())
        .bind(error)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err)?;

        let Some(row) = updated else {
            return Err(RunError::InvalidTransition {
                id: item_id,
                from: self.item_status(item_id).await?,
                to,
            });
        };
        let run_id: Uuid = row.get("run_id");

        let counter = match to {
            RunItemStatus::Done => "done",
            RunItemStatus::Failed => "failed",
            _ => unreachable!("finish targets terminal states"),
        };
        let run_row = sqlx::query(&format!(
            r#"
            UPDATE runs
            SET in_flight = in_flight - 1,
                {counter} = {counter} + 1,
                finished_at = CASE
                    WHEN finished_at IS NULL AND done + failed + 1 = total THEN NOW()
                    ELSE finished_at
                END
            WHERE run_id = $1
            RETURNING *
            "#
        ))
        .bind(run_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        Ok(run_from_row(&run_row))
    }

    async fn begin(&self) -> RunResult<Transaction<'_, Postgres>> {
        self.pool.begin().await.map_err(storage_err)
    }

    async fn item_status(&self, item_id: RunItemId) -> RunResult<RunItemStatus> {
        match RunStore::get_item(self, item_id).await? {
            Some(item) => Ok(item.status),
            None => Err(RunError::ItemNotFound { id: item_id }),
        }
    }
}

fn storage_err(e: sqlx::Error) -> RunError {
    RunError::Storage {
        message: e.to_string(),
    }
}

#[async_trait]
impl RunStore for PostgresStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn insert_run(&self, run: Run, items: Vec<RunItem>) -> RunResult<()> {
        let mut tx = self.begin().await?;

        let finished_at = if run.is_terminal() && run.finished_at.is_none() {
            Some(Utc::now())
        } else {
            run.finished_at
        };
        sqlx::query(
            r#"
            INSERT INTO runs (run_id, source_label, total, queued, in_flight, done, failed,
                              started_at, finished_at, soft_paused, reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(*run.id.as_uuid())
        .bind(&run.source_label)
        .bind(run.total as i32)
        .bind(run.queued as i32)
        .bind(run.in_flight as i32)
        .bind(run.done as i32)
        .bind(run.failed as i32)
        .bind(run.started_at)
        .bind(finished_at)
        .bind(run.soft_paused)
        .bind(&run.reason)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        for item in &items {
            sqlx::query(
                r#"
                INSERT INTO run_items (id, run_id, subject_id, status, attempt, idempotency_key,
                                       normalized_address, normalized_person, last_error, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(*item.id.as_uuid())
            .bind(*item.run_id.as_uuid())
            .bind(&item.subject_id)
            .bind(item.status.as_str())
            .bind(item.attempt as i32)
            .bind(&item.idempotency_key)
            .bind(&item.normalized_address)
            .bind(&item.normalized_person)
            .bind(&item.last_error)
            .bind(item.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)
    }

    async fn get_run(&self, id: RunId) -> RunResult<Option<Run>> {
        let row = sqlx::query("SELECT * FROM runs WHERE run_id = $1")
            .bind(*id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.as_ref().map(run_from_row))
    }

    async fn find_run_by_label(&self, label: &str) -> RunResult<Option<Run>> {
        let row = sqlx::query("SELECT * FROM runs WHERE source_label = $1 LIMIT 1")
            .bind(label)
            .fetch_optional(&*self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.as_ref().map(run_from_row))
    }

    async fn items(&self, run_id: RunId) -> RunResult<Vec<RunItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM run_items WHERE run_id = $1 ORDER BY id"
        ))
        .bind(*run_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(item_from_row).collect()
    }

    async fn get_item(&self, id: RunItemId) -> RunResult<Option<RunItem>> {
        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM run_items WHERE id = $1"
        ))
        .bind(*id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(storage_err)?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn set_paused(
        &self,
        id: RunId,
        paused: bool,
        reason: Option<String>,
    ) -> RunResult<Run> {
        let row = sqlx::query(
            "UPDATE runs SET soft_paused = $2, reason = $3 WHERE run_id = $1 RETURNING *",
        )
        .bind(*id.as_uuid())
        .bind(paused)
        .bind(&reason)
        .fetch_optional(&*self.pool)
        .await
        .map_err(storage_err)?;
        match row {
            Some(row) => Ok(run_from_row(&row)),
            None => Err(RunError::RunNotFound { id }),
        }
    }

    async fn claim_next(&self, run_id: RunId) -> RunResult<Option<RunItem>> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE run_items
            SET status = 'in_flight', attempt = attempt + 1, updated_at = NOW()
            WHERE id = (
                SELECT ri.id FROM run_items ri
                JOIN runs r ON r.run_id = ri.run_id
                WHERE ri.run_id = $1 AND ri.status = 'queued' AND r.soft_paused = FALSE
                ORDER BY ri.id
                LIMIT 1
                FOR UPDATE OF ri SKIP LOCKED
            )
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(*run_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err)?;

        let Some(row) = row else {
            tx.commit().await.map_err(storage_err)?;
            return Ok(None);
        };
        let item = item_from_row(&row)?;

        sqlx::query(
            "UPDATE runs SET queued = queued - 1, in_flight = in_flight + 1 WHERE run_id = $1",
        )
        .bind(*run_id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        Ok(Some(item))
    }

    async fn bump_attempt(&self, id: RunItemId) -> RunResult<u32> {
        let row = sqlx::query(
            "UPDATE run_items SET attempt = attempt + 1, updated_at = NOW() WHERE id = $1 RETURNING attempt",
        )
        .bind(*id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(storage_err)?;
        match row {
            Some(row) => Ok(row.get::<i32, _>("attempt") as u32),
            None => Err(RunError::ItemNotFound { id }),
        }
    }

    async fn mark_done(&self, id: RunItemId) -> RunResult<Run> {
        self.finish_item_tx(id, RunItemStatus::Done, None).await
    }

    async fn mark_failed(&self, id: RunItemId, error: &str) -> RunResult<Run> {
        self.finish_item_tx(id, RunItemStatus::Failed, Some(error))
            .await
    }

    async fn requeue(&self, id: RunItemId) -> RunResult<Run> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(
            r#"
            UPDATE run_items SET status = 'queued', updated_at = NOW()
            WHERE id = $1 AND status = 'in_flight'
            RETURNING run_id
            "#,
        )
        .bind(*id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err)?;

        let Some(row) = row else {
            return Err(RunError::InvalidTransition {
                id,
                from: self.item_status(id).await?,
                to: RunItemStatus::Queued,
            });
        };
        let run_id: Uuid = row.get("run_id");

        let run_row = sqlx::query(
            r#"
            UPDATE runs SET in_flight = in_flight - 1, queued = queued + 1
            WHERE run_id = $1 RETURNING *
            "#,
        )
        .bind(run_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        Ok(run_from_row(&run_row))
    }

    async fn retry_failed_item(&self, id: RunItemId) -> RunResult<RunItem> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE run_items SET status = 'queued', updated_at = NOW()
            WHERE id = $1 AND status = 'failed'
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(*id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err)?;

        let Some(row) = row else {
            return Err(RunError::InvalidTransition {
                id,
                from: self.item_status(id).await?,
                to: RunItemStatus::Queued,
            });
        };
        let item = item_from_row(&row)?;

        sqlx::query("UPDATE runs SET failed = failed - 1, queued = queued + 1 WHERE run_id = $1")
            .bind(*item.run_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        Ok(item)
    }

    async fn retry_all_failed(&self, run_id: RunId) -> RunResult<usize> {
        let mut tx = self.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE run_items SET status = 'queued', updated_at = NOW()
            WHERE run_id = $1 AND status = 'failed'
            "#,
        )
        .bind(*run_id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;
        let moved = result.rows_affected() as usize;

        if moved > 0 {
            sqlx::query(
                "UPDATE runs SET queued = queued + $2, failed = failed - $2 WHERE run_id = $1",
            )
            .bind(*run_id.as_uuid())
            .bind(moved as i32)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)?;
        Ok(moved)
    }
}
