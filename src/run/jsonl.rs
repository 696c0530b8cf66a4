//! JSONL-backed run store: an event log replayed on open.
//!
//! Every state change appends one event; opening the file replays them
//! into a [`RunTable`]. Items that were in flight when the process died
//! are requeued on open (nothing is actually running anymore) - the cache
//! layer is what guarantees the rerun does not bill twice.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::table::RunTable;
use super::{Run, RunId, RunItem, RunItemId, RunItemStatus, RunResult, RunStore};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum RunLogEntry {
    RunCreated {
        run: Run,
        items: Vec<RunItem>,
    },
    PauseChanged {
        run_id: RunId,
        paused: bool,
        reason: Option<String>,
    },
    ItemClaimed {
        item_id: RunItemId,
    },
    AttemptBumped {
        item_id: RunItemId,
    },
    ItemDone {
        item_id: RunItemId,
    },
    ItemFailed {
        item_id: RunItemId,
        error: String,
    },
    ItemRequeued {
        item_id: RunItemId,
    },
    ItemRetried {
        item_id: RunItemId,
    },
}

struct Inner {
    table: RunTable,
    writer: File,
}

impl Inner {
    fn append(&mut self, entry: &RunLogEntry) -> RunResult<()> {
        let line = serde_json::to_string(entry)?;
        writeln!(self.writer, "{line}")?;
        self.writer.flush()?;
        Ok(())
    }
}

pub struct JsonlRunStore {
    path: PathBuf,
    inner: RwLock<Inner>,
}

impl JsonlRunStore {
    /// Open or create the store at `path`, replaying the event log and
    /// requeueing work that was interrupted mid-flight.
    pub fn open(path: impl AsRef<Path>) -> RunResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut table = RunTable::new();
        let mut interrupted = Vec::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RunLogEntry>(&line) {
                    Ok(entry) => {
                        if let Err(e) = apply(&mut table, entry) {
                            tracing::warn!(path = %path.display(), error = %e, "skipping unreplayable run event");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping corrupt run event");
                    }
                }
            }
            interrupted = in_flight_items(&table);
        }

        let writer = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut inner = Inner { table, writer };

        for item_id in interrupted {
            tracing::info!(item = %item_id, "requeueing item interrupted by restart");
            inner.table.requeue(item_id)?;
            inner.append(&RunLogEntry::ItemRequeued { item_id })?;
        }

        Ok(Self {
            path,
            inner: RwLock::new(inner),
        })
    }
}

fn apply(table: &mut RunTable, entry: RunLogEntry) -> RunResult<()> {
    match entry {
        RunLogEntry::RunCreated { run, items } => table.insert_run(run, items),
        RunLogEntry::PauseChanged {
            run_id,
            paused,
            reason,
        } => table.set_paused(run_id, paused, reason).map(|_| ()),
        RunLogEntry::ItemClaimed { item_id } => table.claim_item(item_id).map(|_| ()),
        RunLogEntry::AttemptBumped { item_id } => table.bump_attempt(item_id).map(|_| ()),
        RunLogEntry::ItemDone { item_id } => table.mark_done(item_id).map(|_| ()),
        RunLogEntry::ItemFailed { item_id, error } => {
            table.mark_failed(item_id, &error).map(|_| ())
        }
        RunLogEntry::ItemRequeued { item_id } => table.requeue(item_id).map(|_| ()),
        RunLogEntry::ItemRetried { item_id } => table.retry_failed_item(item_id).map(|_| ()),
    }
}

fn in_flight_items(table: &RunTable) -> Vec<RunItemId> {
    table
        .all_items()
        .into_iter()
        .filter(|i| i.status == RunItemStatus::InFlight)
        .map(|i| i.id)
        .collect()
}

#[async_trait]
impl RunStore for JsonlRunStore {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn insert_run(&self, run: Run, items: Vec<RunItem>) -> RunResult<()> {
        let mut inner = self.inner.write().await;
        inner.table.insert_run(run.clone(), items.clone())?;
        inner.append(&RunLogEntry::RunCreated { run, items })
    }

    async fn get_run(&self, id: RunId) -> RunResult<Option<Run>> {
        Ok(self.inner.read().await.table.get_run(id))
    }

    async fn find_run_by_label(&self, label: &str) -> RunResult<Option<Run>> {
        Ok(self.inner.read().await.table.find_by_label(label))
    }

    async fn items(&self, run_id: RunId) -> RunResult<Vec<RunItem>> {
        self.inner.read().await.table.items_of(run_id)
    }

    async fn get_item(&self, id: RunItemId) -> RunResult<Option<RunItem>> {
        Ok(self.inner.read().await.table.get_item(id))
    }

    async fn set_paused(
        &self,
        id: RunId,
        paused: bool,
        reason: Option<String>,
    ) -> RunResult<Run> {
        let mut inner = self.inner.write().await;
        let run = inner.table.set_paused(id, paused, reason.clone())?;
        inner.append(&RunLogEntry::PauseChanged {
            run_id: id,
            paused,
            reason,
        })?;
        Ok(run)
    }

    async fn claim_next(&self, run_id: RunId) -> RunResult<Option<RunItem>> {
        let mut inner = self.inner.write().await;
        match inner.table.claim_next(run_id)? {
            Some(item) => {
                inner.append(&RunLogEntry::ItemClaimed { item_id: item.id })?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    async fn bump_attempt(&self, id: RunItemId) -> RunResult<u32> {
        let mut inner = self.inner.write().await;
        let attempt = inner.table.bump_attempt(id)?;
        inner.append(&RunLogEntry::AttemptBumped { item_id: id })?;
        Ok(attempt)
    }

    async fn mark_done(&self, id: RunItemId) -> RunResult<Run> {
        let mut inner = self.inner.write().await;
        let run = inner.table.mark_done(id)?;
        inner.append(&RunLogEntry::ItemDone { item_id: id })?;
        Ok(run)
    }

    async fn mark_failed(&self, id: RunItemId, error: &str) -> RunResult<Run> {
        let mut inner = self.inner.write().await;
        let run = inner.table.mark_failed(id, error)?;
        inner.append(&RunLogEntry::ItemFailed {
            item_id: id,
            error: error.to_string(),
        })?;
        Ok(run)
    }

    async fn requeue(&self, id: RunItemId) -> RunResult<Run> {
        let mut inner = self.inner.write().await;
        let run = inner.table.requeue(id)?;
        inner.append(&RunLogEntry::ItemRequeued { item_id: id })?;
        Ok(run)
    }

    async fn retry_failed_item(&self, id: RunItemId) -> RunResult<RunItem> {
        let mut inner = self.inner.write().await;
        let item = inner.table.retry_failed_item(id)?;
        inner.append(&RunLogEntry::ItemRetried { item_id: id })?;
        Ok(item)
    }

    async fn retry_all_failed(&self, run_id: RunId) -> RunResult<usize> {
        let mut inner = self.inner.write().await;
        let failed = inner.table.failed_items_of(run_id)?;
        let count = failed.len();
        for item_id in failed {
            inner.table.retry_failed_item(item_id)?;
            inner.append(&RunLogEntry::ItemRetried { item_id })?;
        }
        Ok(count)
    }
}

impl std::fmt::Debug for JsonlRunStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlRunStore").field("path", &self.path).finish()
    }
}
