//! Batch lifecycle: runs, run items, and the coordinator that owns them.
//!
//! A run is a named batch of enrichment work. Items move through exactly
//! four states (`queued → in_flight → done|failed`), counters on the run
//! always sum to `total`, and the coordinator is the only component that
//! mutates either.

pub mod coordinator;
pub mod store;

#[cfg(feature = "jsonl")]
pub mod jsonl;

mod table;

pub use coordinator::{RunCoordinator, RunReport, SubjectRequest, Submission};
pub use store::{MemoryRunStore, RunStore};

#[cfg(feature = "jsonl")]
pub use jsonl::JsonlRunStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identifier of a batch of work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RunId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of one unit of work inside a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunItemId(Uuid);

impl RunItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RunItemId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for RunItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Item lifecycle. Exactly these four states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunItemStatus {
    Queued,
    InFlight,
    Done,
    Failed,
}

impl RunItemStatus {
    /// Terminal states are never re-entered by normal processing; only
    /// an explicit administrative retry moves `failed` back to `queued`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunItemStatus::Done | RunItemStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunItemStatus::Queued => "queued",
            RunItemStatus::InFlight => "in_flight",
            RunItemStatus::Done => "done",
            RunItemStatus::Failed => "failed",
        }
    }
}

/// A named batch of work with aggregate progress counters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    /// Human description of where the batch came from.
    pub source_label: String,
    pub total: u32,
    pub queued: u32,
    pub in_flight: u32,
    pub done: u32,
    pub failed: u32,
    pub started_at: DateTime<Utc>,
    /// Set exactly once, when `done + failed == total`.
    pub finished_at: Option<DateTime<Utc>>,
    /// While paused, in-flight work may finish but nothing new is claimed.
    pub soft_paused: bool,
    /// Why the run is paused or what finished it abnormally.
    pub reason: Option<String>,
}

impl Run {
    pub fn is_terminal(&self) -> bool {
        self.done + self.failed == self.total
    }

    /// Counter invariant checked by tests at every observable point.
    pub fn counters_consistent(&self) -> bool {
        self.queued + self.in_flight + self.done + self.failed == self.total
    }
}

/// One unit of work inside a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunItem {
    pub id: RunItemId,
    pub run_id: RunId,
    pub subject_id: String,
    pub status: RunItemStatus,
    /// Execution attempts made so far; preserved across administrative
    /// retries so total effort stays visible.
    pub attempt: u32,
    pub idempotency_key: String,
    pub normalized_address: String,
    pub normalized_person: String,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("run not found: {id}")]
    RunNotFound { id: RunId },

    #[error("run item not found: {id}")]
    ItemNotFound { id: RunItemId },

    #[error("invalid transition for item {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: RunItemId,
        from: RunItemStatus,
        to: RunItemStatus,
    },

    #[error("run storage error: {message}")]
    Storage { message: String },

    #[error("run serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("run io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RunResult<T> = std::result::Result<T, RunError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminality() {
        assert!(!RunItemStatus::Queued.is_terminal());
        assert!(!RunItemStatus::InFlight.is_terminal());
        assert!(RunItemStatus::Done.is_terminal());
        assert!(RunItemStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_serde_is_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunItemStatus::InFlight).unwrap(),
            "\"in_flight\""
        );
    }
}
