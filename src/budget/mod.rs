//! Cost governance in front of every billable call.
//!
//! The guardrail answers one question before the orchestrator is allowed
//! to spend money: would this call push today's recorded spend past the
//! daily cap? Spend is derived from the ledger on every check (UTC day
//! window), never from an in-memory counter, so the answer is correct
//! after a restart.
//!
//! The check-then-act sequence is racy under concurrency by design: two
//! workers can both pass the check before either records cost. The
//! ledger insert immediately after the provider call keeps that overshoot
//! bounded to the worker count, which is the accepted trade-off for not
//! serializing every call through a global lock.

mod rate;

pub use rate::SlidingWindowLimiter;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::ledger::{CallLedger, LedgerResult};

/// Outcome of a pre-call budget check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BudgetDecision {
    Allow,
    Reject { reason: RejectReason },
}

impl BudgetDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, BudgetDecision::Allow)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    DailyCapExceeded,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::DailyCapExceeded => write!(f, "daily_cap_exceeded"),
        }
    }
}

/// The current UTC day as a half-open window.
pub fn utc_day_window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time")
        .and_utc();
    (start, start + chrono::Duration::days(1))
}

/// Daily-spend ceiling plus a sliding-window rate limiter.
pub struct BudgetGuardrail {
    ledger: Arc<dyn CallLedger>,
    provider: String,
    daily_cap_cents: u64,
    limiter: SlidingWindowLimiter,
}

impl BudgetGuardrail {
    pub fn new(
        ledger: Arc<dyn CallLedger>,
        provider: impl Into<String>,
        daily_cap_cents: u64,
        limiter: SlidingWindowLimiter,
    ) -> Self {
        Self {
            ledger,
            provider: provider.into(),
            daily_cap_cents,
            limiter,
        }
    }

    /// Decide whether a call with the given estimated cost may proceed.
    pub async fn check_and_reserve(
        &self,
        estimated_cost_cents: u32,
    ) -> LedgerResult<BudgetDecision> {
        let spent = self.spent_today().await?;
        if spent + u64::from(estimated_cost_cents) > self.daily_cap_cents {
            tracing::warn!(
                provider = %self.provider,
                spent_cents = spent,
                cap_cents = self.daily_cap_cents,
                estimated_cents = estimated_cost_cents,
                "daily budget cap reached, rejecting call"
            );
            return Ok(BudgetDecision::Reject {
                reason: RejectReason::DailyCapExceeded,
            });
        }
        Ok(BudgetDecision::Allow)
    }

    /// Wait for a rate-limiter slot. Returns how long the caller was
    /// throttled; excess burst load queues here instead of failing.
    pub async fn throttle(&self) -> std::time::Duration {
        self.limiter.acquire().await
    }

    /// Recorded spend for the current UTC day.
    pub async fn spent_today(&self) -> LedgerResult<u64> {
        let (since, until) = utc_day_window(Utc::now());
        self.ledger
            .sum_cost_cents(&self.provider, since, until)
            .await
    }

    pub fn daily_cap_cents(&self) -> u64 {
        self.daily_cap_cents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{MemoryLedger, ProviderCallRecord};

    fn billable(cost: u32) -> ProviderCallRecord {
        ProviderCallRecord::billable(
            "skiptrace",
            "https://api.example.com/v1/lookup",
            "lead-1",
            "key",
            None,
            serde_json::json!({}),
            "hash",
            cost,
            200,
            50,
            serde_json::json!({"match": true}),
        )
    }

    fn guardrail(ledger: Arc<MemoryLedger>, cap: u64) -> BudgetGuardrail {
        BudgetGuardrail::new(ledger, "skiptrace", cap, SlidingWindowLimiter::unlimited())
    }

    #[test]
    fn test_day_window_bounds() {
        let now = Utc::now();
        let (since, until) = utc_day_window(now);
        assert!(since <= now && now < until);
        assert_eq!(until - since, chrono::Duration::days(1));
    }

    #[tokio::test]
    async fn test_allows_under_cap() {
        let ledger = Arc::new(MemoryLedger::new());
        let guardrail = guardrail(Arc::clone(&ledger), 100);

        assert!(guardrail.check_and_reserve(25).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_rejects_when_estimate_would_exceed_cap() {
        let ledger = Arc::new(MemoryLedger::new());
        for _ in 0..3 {
            ledger.record(billable(25)).await.unwrap();
        }
        let guardrail = guardrail(Arc::clone(&ledger), 100);

        // 75 spent; one more 25-cent call lands exactly on the cap.
        assert!(guardrail.check_and_reserve(25).await.unwrap().is_allowed());

        ledger.record(billable(25)).await.unwrap();
        let decision = guardrail.check_and_reserve(25).await.unwrap();
        assert_eq!(
            decision,
            BudgetDecision::Reject {
                reason: RejectReason::DailyCapExceeded
            }
        );
    }

    #[tokio::test]
    async fn test_spend_is_derived_not_counted() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.record(billable(40)).await.unwrap();

        // A second guardrail over the same ledger sees the same spend:
        // there is no per-instance counter to drift.
        let a = guardrail(Arc::clone(&ledger), 100);
        let b = guardrail(Arc::clone(&ledger), 100);
        assert_eq!(a.spent_today().await.unwrap(), 40);
        assert_eq!(b.spent_today().await.unwrap(), 40);
    }

    #[tokio::test]
    async fn test_zero_cost_rows_do_not_consume_budget() {
        let ledger = Arc::new(MemoryLedger::new());
        for _ in 0..10 {
            ledger
                .record(ProviderCallRecord::cache_hit(
                    "skiptrace", "lead-1", "key", None, "hash",
                ))
                .await
                .unwrap();
        }
        let guardrail = guardrail(Arc::clone(&ledger), 10);
        assert!(guardrail.check_and_reserve(10).await.unwrap().is_allowed());
    }
}
