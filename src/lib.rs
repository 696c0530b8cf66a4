//! # skiptrace-engine
//!
//! Batch skip-trace orchestration: turns contact-enrichment requests
//! (property/owner records needing phone and email lookup) into a
//! bounded, resumable, cost-controlled set of calls to a metered
//! external data provider, with at-most-one billable call per unique
//! request inside the cache validity window.
//!
//! The engine holds four guarantees at once:
//!
//! - **Idempotency** - repeated requests for the same identity never
//!   re-bill the provider while a cache entry is live.
//! - **Resumability** - runs survive process restarts and support
//!   operator pause/resume without losing progress or double-processing.
//! - **Cost governance** - a daily spend ceiling and a rate limiter
//!   throttle or reject work before it becomes billable.
//! - **Auditability** - every provider interaction is reconstructible
//!   from the append-only call ledger.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use skiptrace_engine::{Engine, EngineConfig, SubjectRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), skiptrace_engine::Error> {
//!     let config = EngineConfig::from_env()?;
//!     let engine = Engine::builder(config).build()?;
//!
//!     let submission = engine
//!         .submit_run(
//!             "county-export-2026-08",
//!             vec![SubjectRequest {
//!                 subject_id: "lead-1".into(),
//!                 address: "123 Main Street".into(),
//!                 person: "John Doe".into(),
//!             }],
//!         )
//!         .await?;
//!
//!     let run = engine.process_run(submission.run().id).await?;
//!     println!("done={} failed={}", run.done, run.failed);
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod budget;
pub mod cache;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod lookup;
pub mod metrics;
pub mod normalize;
pub mod prelude;
pub mod provider;
pub mod run;

#[cfg(feature = "postgres")]
pub mod postgres;

// Re-exports for convenience
pub use budget::{BudgetDecision, BudgetGuardrail, RejectReason, SlidingWindowLimiter};
pub use cache::{CacheEntry, CacheError, CacheStore, DEFAULT_CACHE_TTL, MemoryCacheStore};
pub use config::{ConfigError, EngineConfig};
pub use engine::{Engine, EngineBuilder};
pub use ledger::{CallLedger, LedgerError, MemoryLedger, ProviderCallRecord};
pub use lookup::{LookupOrchestrator, Resolution};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use normalize::NormalizeError;
pub use provider::{
    ContactProvider, ExponentialBackoff, HttpContactProvider, HttpProviderConfig, LookupRequest,
    ParsedContacts, ProviderError, ProviderResponse, RetryPolicy,
};
pub use run::{
    MemoryRunStore, Run, RunCoordinator, RunError, RunId, RunItem, RunItemId, RunItemStatus,
    RunReport, RunStore, SubjectRequest, Submission,
};

#[cfg(feature = "jsonl")]
pub use cache::JsonlCacheStore;
#[cfg(feature = "jsonl")]
pub use ledger::JsonlLedger;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
#[cfg(feature = "jsonl")]
pub use run::JsonlRunStore;

/// Error type for engine operations.
///
/// Per-item errors never abort a run; they surface here from single
/// resolutions and carry enough structure (`category`, `is_retryable`)
/// for bulk triage.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Subject input unusable; no provider call was made, no cost.
    #[error("validation failed: {0}")]
    Validation(#[from] normalize::NormalizeError),

    /// Guardrail rejection, distinct from provider failure so callers
    /// can tell throttling from error. The work stays retryable once
    /// the budget resets.
    #[error("budget exceeded: {reason}")]
    BudgetExceeded { reason: budget::RejectReason },

    /// Provider boundary failure (transient or not; see
    /// [`ProviderError::is_retryable`]).
    #[error(transparent)]
    Provider(#[from] provider::ProviderError),

    #[error(transparent)]
    Cache(#[from] cache::CacheError),

    #[error(transparent)]
    Ledger(#[from] ledger::LedgerError),

    #[error(transparent)]
    Run(#[from] run::RunError),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable snake_case category, used as the `last_error` prefix and
    /// for grouping failures in run reports.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::BudgetExceeded { .. } => "budget",
            Error::Provider(e) => match e {
                provider::ProviderError::Auth { .. }
                | provider::ProviderError::DemoMode { .. } => "auth_configuration",
                provider::ProviderError::NoMatch => "not_found",
                e if e.is_retryable() => "transient",
                _ => "provider",
            },
            Error::Cache(_) | Error::Ledger(_) | Error::Run(_) => "storage",
            Error::Config(_) => "config",
        }
    }

    /// Whether the orchestration layer may retry this with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Provider(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Provider-suggested retry delay, if any.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            Error::Provider(e) => e.retry_after(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let e = Error::Provider(provider::ProviderError::Auth {
            message: "bad key".into(),
        });
        assert_eq!(e.category(), "auth_configuration");
        assert!(!e.is_retryable());

        let e = Error::Provider(provider::ProviderError::Api {
            status: 503,
            message: "unavailable".into(),
        });
        assert_eq!(e.category(), "transient");
        assert!(e.is_retryable());

        let e = Error::Provider(provider::ProviderError::NoMatch);
        assert_eq!(e.category(), "not_found");
        assert!(!e.is_retryable());

        let e = Error::BudgetExceeded {
            reason: budget::RejectReason::DailyCapExceeded,
        };
        assert_eq!(e.category(), "budget");
        assert!(!e.is_retryable());
        assert_eq!(e.to_string(), "budget exceeded: daily_cap_exceeded");
    }
}
