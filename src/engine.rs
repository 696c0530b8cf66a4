//! Engine facade: wires config, stores, guardrail, orchestrator, and
//! coordinator into one handle.
//!
//! The builder accepts injected stores and providers so tests (and
//! embedders with their own persistence) can swap any boundary; the
//! defaults follow the active persistence feature.

use std::sync::Arc;

use crate::budget::{BudgetGuardrail, SlidingWindowLimiter};
use crate::cache::CacheStore;
use crate::config::EngineConfig;
use crate::ledger::{CallLedger, ProviderCallRecord};
use crate::lookup::{LookupOrchestrator, Resolution};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::provider::{ContactProvider, HttpContactProvider, HttpProviderConfig, RetryPolicy};
use crate::run::{
    Run, RunCoordinator, RunId, RunItem, RunItemId, RunReport, RunStore, SubjectRequest,
    Submission,
};
use crate::Result;

#[cfg(not(feature = "jsonl"))]
use crate::cache::MemoryCacheStore;
#[cfg(feature = "jsonl")]
use crate::cache::JsonlCacheStore;
#[cfg(not(feature = "jsonl"))]
use crate::ledger::MemoryLedger;
#[cfg(feature = "jsonl")]
use crate::ledger::JsonlLedger;
#[cfg(not(feature = "jsonl"))]
use crate::run::MemoryRunStore;
#[cfg(feature = "jsonl")]
use crate::run::JsonlRunStore;

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    provider: Option<Arc<dyn ContactProvider>>,
    cache: Option<Arc<dyn CacheStore>>,
    ledger: Option<Arc<dyn CallLedger>>,
    run_store: Option<Arc<dyn RunStore>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            provider: None,
            cache: None,
            ledger: None,
            run_store: None,
        }
    }

    /// Replace the HTTP provider (tests, non-HTTP sources).
    pub fn provider(mut self, provider: Arc<dyn ContactProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn cache_store(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn CallLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn run_store(mut self, run_store: Arc<dyn RunStore>) -> Self {
        self.run_store = Some(run_store);
        self
    }

    pub fn build(self) -> Result<Engine> {
        let config = self.config;

        let provider: Arc<dyn ContactProvider> = match self.provider {
            Some(provider) => provider,
            None => {
                let http = HttpProviderConfig::new(&config.base_url, config.api_key.clone())
                    .with_provider_name(&config.provider_name)
                    .with_lookup_path(&config.lookup_path)
                    .with_timeout(config.request_timeout);
                Arc::new(HttpContactProvider::new(http)?)
            }
        };

        let cache = match self.cache {
            Some(cache) => cache,
            None => default_cache(&config)?,
        };
        let ledger = match self.ledger {
            Some(ledger) => ledger,
            None => default_ledger(&config)?,
        };
        let run_store = match self.run_store {
            Some(run_store) => run_store,
            None => default_run_store(&config)?,
        };

        let metrics = Arc::new(EngineMetrics::new());
        let guardrail = Arc::new(BudgetGuardrail::new(
            Arc::clone(&ledger),
            provider.name(),
            config.daily_cap_cents,
            SlidingWindowLimiter::per_second(config.rate_limit_per_sec),
        ));
        let orchestrator = Arc::new(
            LookupOrchestrator::new(
                Arc::clone(&provider),
                Arc::clone(&cache),
                Arc::clone(&ledger),
                guardrail,
                Arc::clone(&metrics),
            )
            .with_cost_per_call(config.cost_per_call_cents)
            .with_cache_ttl(config.cache_ttl)
            .with_record_cache_hits(config.record_cache_hits)
            .with_retry_policy(RetryPolicy::new(config.max_attempts)),
        );
        let coordinator = RunCoordinator::new(
            Arc::clone(&run_store),
            provider.name(),
            Arc::clone(&metrics),
        );

        tracing::info!(
            provider = provider.name(),
            cache = cache.name(),
            ledger = ledger.name(),
            run_store = run_store.name(),
            daily_cap_cents = config.daily_cap_cents,
            workers = config.max_concurrency,
            "engine assembled"
        );

        Ok(Engine {
            config,
            orchestrator,
            coordinator,
            ledger,
            cache,
            metrics,
        })
    }
}

#[cfg(feature = "jsonl")]
fn default_cache(config: &EngineConfig) -> Result<Arc<dyn CacheStore>> {
    Ok(Arc::new(JsonlCacheStore::open(
        config.data_dir.join("cache.jsonl"),
    )?))
}

#[cfg(not(feature = "jsonl"))]
fn default_cache(_config: &EngineConfig) -> Result<Arc<dyn CacheStore>> {
    Ok(Arc::new(MemoryCacheStore::new()))
}

#[cfg(feature = "jsonl")]
fn default_ledger(config: &EngineConfig) -> Result<Arc<dyn CallLedger>> {
    Ok(Arc::new(JsonlLedger::open(
        config.data_dir.join("provider_calls.jsonl"),
    )?))
}

#[cfg(not(feature = "jsonl"))]
fn default_ledger(_config: &EngineConfig) -> Result<Arc<dyn CallLedger>> {
    Ok(Arc::new(MemoryLedger::new()))
}

#[cfg(feature = "jsonl")]
fn default_run_store(config: &EngineConfig) -> Result<Arc<dyn RunStore>> {
    Ok(Arc::new(JsonlRunStore::open(
        config.data_dir.join("runs.jsonl"),
    )?))
}

#[cfg(not(feature = "jsonl"))]
fn default_run_store(_config: &EngineConfig) -> Result<Arc<dyn RunStore>> {
    Ok(Arc::new(MemoryRunStore::new()))
}

/// One assembled skip-trace engine.
pub struct Engine {
    config: EngineConfig,
    orchestrator: Arc<LookupOrchestrator>,
    coordinator: RunCoordinator,
    ledger: Arc<dyn CallLedger>,
    cache: Arc<dyn CacheStore>,
    metrics: Arc<EngineMetrics>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Find-or-create a run for a batch of subjects.
    pub async fn submit_run(
        &self,
        source_label: impl Into<String>,
        subjects: Vec<SubjectRequest>,
    ) -> Result<Submission> {
        Ok(self.coordinator.submit(source_label, subjects).await?)
    }

    /// Drain a run with the configured worker pool. Returns the run
    /// snapshot when nothing more can be claimed (terminal or paused).
    pub async fn process_run(&self, run_id: RunId) -> Result<Run> {
        self.coordinator
            .drive(run_id, Arc::clone(&self.orchestrator), self.config.max_concurrency)
            .await
    }

    pub async fn pause_run(&self, run_id: RunId) -> Result<Run> {
        Ok(self.coordinator.pause(run_id).await?)
    }

    pub async fn resume_run(&self, run_id: RunId) -> Result<Run> {
        Ok(self.coordinator.resume(run_id).await?)
    }

    pub async fn run_status(&self, run_id: RunId) -> Result<Run> {
        Ok(self.coordinator.status(run_id).await?)
    }

    pub async fn run_items(&self, run_id: RunId) -> Result<Vec<RunItem>> {
        Ok(self.coordinator.items(run_id).await?)
    }

    pub async fn run_report(&self, run_id: RunId) -> Result<RunReport> {
        Ok(self.coordinator.report(run_id).await?)
    }

    pub async fn retry_failed_item(&self, item_id: RunItemId) -> Result<RunItem> {
        Ok(self.coordinator.retry_failed_item(item_id).await?)
    }

    pub async fn retry_all_failed(&self, run_id: RunId) -> Result<usize> {
        Ok(self.coordinator.retry_all_failed(run_id).await?)
    }

    /// Single diagnostic lookup outside any run. `force` bypasses the
    /// cache read but stays subject to the guardrail.
    pub async fn resolve_one(
        &self,
        subject_id: &str,
        raw_address: &str,
        raw_person: &str,
        force: bool,
    ) -> Result<Resolution> {
        self.orchestrator
            .resolve(subject_id, raw_address, raw_person, None, force)
            .await
    }

    /// Everything the ledger recorded for one subject, for forensic
    /// review.
    pub async fn subject_history(&self, subject_id: &str) -> Result<Vec<ProviderCallRecord>> {
        Ok(self.ledger.calls_for_subject(subject_id).await?)
    }

    /// Administrative sweep of expired cache rows.
    pub async fn purge_expired_cache(&self) -> Result<usize> {
        Ok(self.cache.purge_expired().await?)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
