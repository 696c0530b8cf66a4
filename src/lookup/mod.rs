//! Per-item lookup orchestration.
//!
//! `resolve` is the glue path of the whole engine: normalize the inputs,
//! derive the idempotency key, try the cache, pass the guardrail, call
//! the provider, write the ledger row, then the cache entry. The
//! ordering matters - the ledger insert lands immediately after the
//! provider call (bounding the budget race window), and the cache write
//! happens only after a successful parse, so fabricated or failed
//! responses never become cached "facts".

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::budget::{BudgetDecision, BudgetGuardrail};
use crate::cache::{CacheEntry, CacheStore, DEFAULT_CACHE_TTL};
use crate::ledger::{CallLedger, ProviderCallRecord};
use crate::metrics::EngineMetrics;
use crate::normalize::{idempotency_key, normalize_address, normalize_person, payload_hash};
use crate::provider::{ContactProvider, LookupRequest, ProviderError, RetryPolicy};
use crate::run::{RunId, RunItem};
use crate::{Error, Result};

/// Outcome of one resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub phones: Vec<String>,
    pub emails: Vec<String>,
    /// Whether the answer came from the cache (no billable call made).
    pub cached: bool,
}

/// The per-item execution unit composing cache, guardrail, provider, and
/// ledger.
pub struct LookupOrchestrator {
    provider: Arc<dyn ContactProvider>,
    cache: Arc<dyn CacheStore>,
    ledger: Arc<dyn CallLedger>,
    guardrail: Arc<BudgetGuardrail>,
    metrics: Arc<EngineMetrics>,
    cost_per_call_cents: u32,
    cache_ttl: Duration,
    record_cache_hits: bool,
    retry: RetryPolicy,
}

impl LookupOrchestrator {
    pub fn new(
        provider: Arc<dyn ContactProvider>,
        cache: Arc<dyn CacheStore>,
        ledger: Arc<dyn CallLedger>,
        guardrail: Arc<BudgetGuardrail>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            provider,
            cache,
            ledger,
            guardrail,
            metrics,
            cost_per_call_cents: 0,
            cache_ttl: DEFAULT_CACHE_TTL,
            record_cache_hits: true,
            retry: RetryPolicy::default(),
        }
    }

    /// Known per-call provider price, consulted by the guardrail.
    pub fn with_cost_per_call(mut self, cents: u32) -> Self {
        self.cost_per_call_cents = cents;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Whether cache hits leave zero-cost observability rows.
    pub fn with_record_cache_hits(mut self, record: bool) -> Self {
        self.record_cache_hits = record;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn cost_per_call_cents(&self) -> u32 {
        self.cost_per_call_cents
    }

    /// Resolve raw inputs for one subject.
    ///
    /// `force` bypasses the cache read for a diagnostic fresh lookup; it
    /// does not bypass the guardrail, and the fresh answer still
    /// overwrites the cache.
    #[tracing::instrument(skip(self, raw_address, raw_person), fields(provider = %self.provider.name()))]
    pub async fn resolve(
        &self,
        subject_id: &str,
        raw_address: &str,
        raw_person: &str,
        run_id: Option<RunId>,
        force: bool,
    ) -> Result<Resolution> {
        let address = normalize_address(raw_address)?;
        let person = normalize_person(raw_person)?;
        self.resolve_normalized(subject_id, &address, &person, run_id, force)
            .await
    }

    /// Resolve a claimed run item (inputs already normalized at
    /// enumeration time).
    pub async fn resolve_item(&self, item: &RunItem) -> Result<Resolution> {
        self.resolve_normalized(
            &item.subject_id,
            &item.normalized_address,
            &item.normalized_person,
            Some(item.run_id),
            false,
        )
        .await
    }

    async fn resolve_normalized(
        &self,
        subject_id: &str,
        address: &str,
        person: &str,
        run_id: Option<RunId>,
        force: bool,
    ) -> Result<Resolution> {
        let provider = self.provider.name().to_string();
        let key = idempotency_key(&provider, address, person);
        let request = LookupRequest {
            subject_id: subject_id.to_string(),
            address: address.to_string(),
            person: person.to_string(),
        };
        let request_hash = payload_hash(&request.body());

        if !force
            && let Some(entry) = self.cache.lookup(&provider, &key).await?
        {
            if entry.payload_hash == request_hash {
                self.metrics.cache_hits.inc();
                if self.record_cache_hits {
                    self.ledger
                        .record(ProviderCallRecord::cache_hit(
                            &provider,
                            subject_id,
                            &key,
                            run_id,
                            &request_hash,
                        ))
                        .await?;
                }
                tracing::debug!(subject = subject_id, key = %key, "resolved from cache");
                return Ok(Resolution {
                    phones: entry.parsed_contacts.phones,
                    emails: entry.parsed_contacts.emails,
                    cached: true,
                });
            }
            // Same key, different request body. Favor correctness over
            // suppressing a cost: fall through to a fresh call that
            // overwrites the entry.
            tracing::warn!(
                subject = subject_id,
                key = %key,
                stored = %entry.payload_hash,
                expected = %request_hash,
                "cache payload hash mismatch, treating as miss"
            );
        }
        self.metrics.cache_misses.inc();

        let waited = self.guardrail.throttle().await;
        if waited > Duration::ZERO {
            self.metrics.throttle_waits.inc();
            tracing::debug!(subject = subject_id, waited_ms = waited.as_millis() as u64, "throttled");
        }

        match self
            .guardrail
            .check_and_reserve(self.cost_per_call_cents)
            .await?
        {
            BudgetDecision::Allow => {}
            BudgetDecision::Reject { reason } => {
                self.metrics.budget_rejections.inc();
                return Err(Error::BudgetExceeded { reason });
            }
        }

        let started = Instant::now();
        let outcome = self.provider.lookup(&request).await;
        let response_time_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(response) => {
                self.ledger
                    .record(ProviderCallRecord::billable(
                        &provider,
                        self.provider.endpoint(),
                        subject_id,
                        &key,
                        run_id,
                        request.body(),
                        &request_hash,
                        self.cost_per_call_cents,
                        response.status,
                        response_time_ms,
                        response.body.clone(),
                    ))
                    .await?;
                self.metrics.billable_calls.inc();

                let contacts = response.contacts.clone();
                self.cache
                    .put(CacheEntry::new(
                        &provider,
                        &key,
                        &request_hash,
                        response.body,
                        response.contacts,
                        self.cache_ttl,
                    ))
                    .await?;

                tracing::info!(
                    subject = subject_id,
                    phones = contacts.phones.len(),
                    emails = contacts.emails.len(),
                    response_time_ms,
                    "provider lookup succeeded"
                );
                Ok(Resolution {
                    phones: contacts.phones,
                    emails: contacts.emails,
                    cached: false,
                })
            }
            Err(e) => {
                self.metrics.provider_failures.inc();
                self.ledger
                    .record(ProviderCallRecord::failed(
                        &provider,
                        self.provider.endpoint(),
                        subject_id,
                        &key,
                        run_id,
                        request.body(),
                        &request_hash,
                        status_hint(&e),
                        response_time_ms,
                        &e.to_string(),
                    ))
                    .await?;
                Err(Error::Provider(e))
            }
        }
    }
}

fn status_hint(e: &ProviderError) -> Option<u16> {
    match e {
        ProviderError::Api { status, .. } => Some(*status),
        ProviderError::RateLimited { .. } => Some(429),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::budget::SlidingWindowLimiter;
    use crate::cache::MemoryCacheStore;
    use crate::ledger::MemoryLedger;
    use crate::provider::{ParsedContacts, ProviderResponse};

    struct FakeProvider {
        calls: std::sync::atomic::AtomicU32,
    }

    impl FakeProvider {
        fn new() -> Self {
            Self {
                calls: std::sync::atomic::AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ContactProvider for FakeProvider {
        fn name(&self) -> &str {
            "skiptrace"
        }

        fn endpoint(&self) -> &str {
            "fake://lookup"
        }

        async fn lookup(
            &self,
            _request: &LookupRequest,
        ) -> std::result::Result<ProviderResponse, ProviderError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(ProviderResponse {
                status: 200,
                body: serde_json::json!({"phones": ["+15550001111"], "emails": ["a@b.com"]}),
                contacts: ParsedContacts {
                    phones: vec!["+15550001111".into()],
                    emails: vec!["a@b.com".into()],
                },
            })
        }
    }

    struct Fixture {
        provider: Arc<FakeProvider>,
        cache: Arc<MemoryCacheStore>,
        ledger: Arc<MemoryLedger>,
        orchestrator: LookupOrchestrator,
    }

    fn fixture(daily_cap_cents: u64) -> Fixture {
        let provider = Arc::new(FakeProvider::new());
        let cache = Arc::new(MemoryCacheStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let guardrail = Arc::new(BudgetGuardrail::new(
            ledger.clone() as Arc<dyn CallLedger>,
            "skiptrace",
            daily_cap_cents,
            SlidingWindowLimiter::unlimited(),
        ));
        let orchestrator = LookupOrchestrator::new(
            provider.clone(),
            cache.clone(),
            ledger.clone(),
            guardrail,
            Arc::new(EngineMetrics::new()),
        )
        .with_cost_per_call(25);
        Fixture {
            provider,
            cache,
            ledger,
            orchestrator,
        }
    }

    fn day() -> (chrono::DateTime<Utc>, chrono::DateTime<Utc>) {
        crate::budget::utc_day_window(Utc::now())
    }

    #[tokio::test]
    async fn test_second_resolve_is_a_cache_hit_with_zero_new_billable_rows() {
        let f = fixture(1000);

        let first = f
            .orchestrator
            .resolve("lead-1", "123 Main Street", "John Doe", None, false)
            .await
            .unwrap();
        assert!(!first.cached);

        let (since, until) = day();
        let billable_after_first = f.ledger.billable_count("skiptrace", since, until).await.unwrap();
        assert_eq!(billable_after_first, 1);

        let second = f
            .orchestrator
            .resolve("lead-1", "123 MAIN ST", "JOHN DOE", None, false)
            .await
            .unwrap();
        assert!(second.cached);
        assert_eq!(second.phones, first.phones);

        // Zero new billable rows; one zero-cost hit row for observability.
        assert_eq!(
            f.ledger.billable_count("skiptrace", since, until).await.unwrap(),
            1
        );
        assert_eq!(f.provider.calls(), 1);
        assert_eq!(f.ledger.calls_for_subject("lead-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_budget_rejection_is_distinct_and_unbilled() {
        let f = fixture(20); // cap below one 25-cent call

        let err = f
            .orchestrator
            .resolve("lead-1", "123 Main St", "John Doe", None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BudgetExceeded { .. }));
        assert_eq!(f.provider.calls(), 0);

        let (since, until) = day();
        assert_eq!(
            f.ledger.sum_cost_cents("skiptrace", since, until).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_force_bypasses_cache_but_still_writes_it() {
        let f = fixture(1000);

        f.orchestrator
            .resolve("lead-1", "123 Main St", "John Doe", None, false)
            .await
            .unwrap();
        let forced = f
            .orchestrator
            .resolve("lead-1", "123 Main St", "John Doe", None, true)
            .await
            .unwrap();
        assert!(!forced.cached);
        assert_eq!(f.provider.calls(), 2);
        assert_eq!(f.cache.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_triggers_fresh_call_and_overwrite() {
        let f = fixture(1000);

        f.orchestrator
            .resolve("lead-1", "123 Main St", "John Doe", None, false)
            .await
            .unwrap();

        // Age the entry past its TTL.
        let key = idempotency_key("skiptrace", "123 MAIN ST", "JOHN DOE");
        let mut entry = f.cache.lookup("skiptrace", &key).await.unwrap().unwrap();
        entry.expires_at = Utc::now() - chrono::Duration::seconds(1);
        f.cache.put(entry).await.unwrap();

        let again = f
            .orchestrator
            .resolve("lead-1", "123 Main St", "John Doe", None, false)
            .await
            .unwrap();
        assert!(!again.cached);
        assert_eq!(f.provider.calls(), 2);

        let refreshed = f.cache.lookup("skiptrace", &key).await.unwrap().unwrap();
        assert!(refreshed.expires_at > Utc::now());
    }

    #[tokio::test]
    async fn test_payload_hash_mismatch_forces_fresh_call() {
        let f = fixture(1000);

        f.orchestrator
            .resolve("lead-1", "123 Main St", "John Doe", None, false)
            .await
            .unwrap();

        let key = idempotency_key("skiptrace", "123 MAIN ST", "JOHN DOE");
        let mut entry = f.cache.lookup("skiptrace", &key).await.unwrap().unwrap();
        entry.payload_hash = "tampered".into();
        f.cache.put(entry).await.unwrap();

        let again = f
            .orchestrator
            .resolve("lead-1", "123 Main St", "John Doe", None, false)
            .await
            .unwrap();
        assert!(!again.cached, "integrity mismatch must behave as a miss");
        assert_eq!(f.provider.calls(), 2);

        let repaired = f.cache.lookup("skiptrace", &key).await.unwrap().unwrap();
        assert_ne!(repaired.payload_hash, "tampered");
    }

    #[tokio::test]
    async fn test_validation_failure_makes_no_call_and_no_cost() {
        let f = fixture(1000);

        let err = f
            .orchestrator
            .resolve("lead-1", "no digits here", "John Doe", None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(f.provider.calls(), 0);
        assert!(f.ledger.is_empty().await);
    }
}
