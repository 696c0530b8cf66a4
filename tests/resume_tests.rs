//! Restart behavior with the file-backed stores (default `jsonl`
//! feature): progress, spend, and cache entries all survive the process.

#![cfg(feature = "jsonl")]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use skiptrace_engine::{
    ContactProvider, Engine, EngineConfig, LookupRequest, ParsedContacts, ProviderError,
    ProviderResponse, SubjectRequest,
};

struct CountingProvider {
    calls: AtomicU32,
}

impl CountingProvider {
    fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContactProvider for CountingProvider {
    fn name(&self) -> &str {
        "skiptrace"
    }

    fn endpoint(&self) -> &str {
        "counting://lookup"
    }

    async fn lookup(&self, request: &LookupRequest) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ProviderResponse {
            status: 200,
            body: serde_json::json!({
                "match": true,
                "phones": [format!("+1555{:07}", request.subject_id.len())],
                "emails": [],
            }),
            contacts: ParsedContacts {
                phones: vec![format!("+1555{:07}", request.subject_id.len())],
                emails: vec![],
            },
        })
    }
}

fn engine_at(
    data_dir: &Path,
    provider: Arc<CountingProvider>,
    daily_cap_cents: u64,
) -> Engine {
    let mut config = EngineConfig::new("https://unused.example.com", "test-key".into());
    config.data_dir = data_dir.to_path_buf();
    config.daily_cap_cents = daily_cap_cents;
    config.cost_per_call_cents = 25;
    config.rate_limit_per_sec = 0;
    config.max_concurrency = 1;

    Engine::builder(config)
        .provider(provider as Arc<dyn ContactProvider>)
        .build()
        .unwrap()
}

fn subjects(n: usize) -> Vec<SubjectRequest> {
    (0..n)
        .map(|i| SubjectRequest {
            subject_id: format!("lead-{i}"),
            address: format!("{} Walnut Street", 200 + i),
            person: format!("Holder Number{i}"),
        })
        .collect()
}

#[tokio::test]
async fn test_budget_paused_run_resumes_after_restart_without_rebilling() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(CountingProvider::new());

    // First process: the cap affords 5 of 20 items, then the run pauses.
    let run_id = {
        let engine = engine_at(dir.path(), Arc::clone(&provider), 125);
        let run = engine
            .submit_run("restart-batch", subjects(20))
            .await
            .unwrap()
            .run()
            .clone();
        let paused = engine.process_run(run.id).await.unwrap();
        assert!(paused.soft_paused);
        assert_eq!((paused.done, paused.queued), (5, 15));
        run.id
    };

    // Restart with a raised cap over the same data directory.
    let engine = engine_at(dir.path(), Arc::clone(&provider), 1_000_000);

    // The run and its progress came back from disk.
    let restored = engine.run_status(run_id).await.unwrap();
    assert_eq!((restored.done, restored.queued), (5, 15));
    assert!(restored.soft_paused);
    assert!(restored.counters_consistent());

    // Submitting the same label again finds the existing run.
    let submission = engine
        .submit_run("restart-batch", subjects(20))
        .await
        .unwrap();
    assert!(!submission.is_created());
    assert_eq!(submission.run().id, run_id);

    engine.resume_run(run_id).await.unwrap();
    let finished = engine.process_run(run_id).await.unwrap();

    assert_eq!((finished.done, finished.failed), (20, 0));
    assert!(finished.counters_consistent());
    assert_eq!(provider.calls(), 20, "finished items were not reprocessed");
}

#[tokio::test]
async fn test_cache_suppresses_billing_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(CountingProvider::new());

    {
        let engine = engine_at(dir.path(), Arc::clone(&provider), 1_000_000);
        let first = engine
            .resolve_one("lead-1", "88 Spruce Way", "Terry Owner", false)
            .await
            .unwrap();
        assert!(!first.cached);
    }

    let engine = engine_at(dir.path(), Arc::clone(&provider), 1_000_000);
    let again = engine
        .resolve_one("lead-1", "88 Spruce Way", "Terry Owner", false)
        .await
        .unwrap();

    assert!(again.cached, "cache entry survived the restart");
    assert_eq!(provider.calls(), 1);

    // Both resolutions visible in the replayed ledger, one billable.
    let history = engine.subject_history("lead-1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history.iter().filter(|r| r.is_billable()).count(), 1);
}

#[tokio::test]
async fn test_daily_spend_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(CountingProvider::new());

    // Spend the whole cap (two 25-cent calls against a 50-cent cap).
    {
        let engine = engine_at(dir.path(), Arc::clone(&provider), 50);
        for i in 0..2 {
            engine
                .resolve_one(
                    &format!("spend-{i}"),
                    &format!("{} Fir Court", 300 + i),
                    "Casey Owner",
                    false,
                )
                .await
                .unwrap();
        }
    }

    // A fresh process must still see the spend and reject new work.
    let engine = engine_at(dir.path(), Arc::clone(&provider), 50);
    let err = engine
        .resolve_one("spend-2", "302 Fir Court", "Casey Owner", false)
        .await
        .unwrap_err();
    assert_eq!(err.category(), "budget");
    assert_eq!(provider.calls(), 2);
}
