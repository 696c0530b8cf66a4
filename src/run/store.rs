//! Run state persistence contract and the in-memory backend.

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::table::RunTable;
use super::{Run, RunId, RunItem, RunItemId, RunResult};

/// Persistence boundary for runs and their items.
///
/// Claim and transition operations are atomic per call: a conditional
/// update under a single writer (memory, JSONL) or a conditional SQL
/// update (relational backends). Workers never need application-level
/// locks on top of this.
#[async_trait]
pub trait RunStore: Send + Sync {
    fn name(&self) -> &str;

    async fn insert_run(&self, run: Run, items: Vec<RunItem>) -> RunResult<()>;

    async fn get_run(&self, id: RunId) -> RunResult<Option<Run>>;

    async fn find_run_by_label(&self, label: &str) -> RunResult<Option<Run>>;

    async fn items(&self, run_id: RunId) -> RunResult<Vec<RunItem>>;

    async fn get_item(&self, id: RunItemId) -> RunResult<Option<RunItem>>;

    async fn set_paused(&self, id: RunId, paused: bool, reason: Option<String>)
    -> RunResult<Run>;

    /// Claim one queued item and mark it in-flight, counting the
    /// attempt. `None` when the run is paused, terminal, or drained.
    async fn claim_next(&self, run_id: RunId) -> RunResult<Option<RunItem>>;

    /// Count one more attempt on an in-flight item (in-claim retry).
    async fn bump_attempt(&self, id: RunItemId) -> RunResult<u32>;

    async fn mark_done(&self, id: RunItemId) -> RunResult<Run>;

    async fn mark_failed(&self, id: RunItemId, error: &str) -> RunResult<Run>;

    /// `in_flight → queued` without touching the attempt counter.
    async fn requeue(&self, id: RunItemId) -> RunResult<Run>;

    /// Administrative `failed → queued`, attempt preserved.
    async fn retry_failed_item(&self, id: RunItemId) -> RunResult<RunItem>;

    /// Retry every failed item of a run. Returns how many moved.
    async fn retry_all_failed(&self, run_id: RunId) -> RunResult<usize>;
}

/// In-memory run store: one [`RunTable`] behind a writer lock.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    table: RwLock<RunTable>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert_run(&self, run: Run, items: Vec<RunItem>) -> RunResult<()> {
        self.table.write().await.insert_run(run, items)
    }

    async fn get_run(&self, id: RunId) -> RunResult<Option<Run>> {
        Ok(self.table.read().await.get_run(id))
    }

    async fn find_run_by_label(&self, label: &str) -> RunResult<Option<Run>> {
        Ok(self.table.read().await.find_by_label(label))
    }

    async fn items(&self, run_id: RunId) -> RunResult<Vec<RunItem>> {
        self.table.read().await.items_of(run_id)
    }

    async fn get_item(&self, id: RunItemId) -> RunResult<Option<RunItem>> {
        Ok(self.table.read().await.get_item(id))
    }

    async fn set_paused(
        &self,
        id: RunId,
        paused: bool,
        reason: Option<String>,
    ) -> RunResult<Run> {
        self.table.write().await.set_paused(id, paused, reason)
    }

    async fn claim_next(&self, run_id: RunId) -> RunResult<Option<RunItem>> {
        self.table.write().await.claim_next(run_id)
    }

    async fn bump_attempt(&self, id: RunItemId) -> RunResult<u32> {
        self.table.write().await.bump_attempt(id)
    }

    async fn mark_done(&self, id: RunItemId) -> RunResult<Run> {
        self.table.write().await.mark_done(id)
    }

    async fn mark_failed(&self, id: RunItemId, error: &str) -> RunResult<Run> {
        self.table.write().await.mark_failed(id, error)
    }

    async fn requeue(&self, id: RunItemId) -> RunResult<Run> {
        self.table.write().await.requeue(id)
    }

    async fn retry_failed_item(&self, id: RunItemId) -> RunResult<RunItem> {
        self.table.write().await.retry_failed_item(id)
    }

    async fn retry_all_failed(&self, run_id: RunId) -> RunResult<usize> {
        let mut table = self.table.write().await;
        let failed = table.failed_items_of(run_id)?;
        let count = failed.len();
        for item_id in failed {
            table.retry_failed_item(item_id)?;
        }
        Ok(count)
    }
}
