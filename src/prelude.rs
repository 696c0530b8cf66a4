//! Prelude module for convenient imports.
//!
//! ```rust
//! use skiptrace_engine::prelude::*;
//! ```

// Engine facade
pub use crate::Engine;
pub use crate::EngineBuilder;
pub use crate::EngineConfig;
pub use crate::Error;
pub use crate::Result;

// Runs
pub use crate::run::{
    Run, RunCoordinator, RunId, RunItem, RunItemId, RunItemStatus, RunReport, RunStore,
    SubjectRequest, Submission,
};

// Lookup
pub use crate::lookup::{LookupOrchestrator, Resolution};

// Provider boundary
pub use crate::provider::{ContactProvider, LookupRequest, ParsedContacts, ProviderResponse};

// Stores
pub use crate::cache::{CacheEntry, CacheStore};
pub use crate::ledger::{CallLedger, ProviderCallRecord};

// Governance
pub use crate::budget::{BudgetDecision, BudgetGuardrail, SlidingWindowLimiter};

// Metrics
pub use crate::metrics::MetricsSnapshot;
