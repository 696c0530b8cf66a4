//! Run lifecycle ownership: submission, pause/resume, retries, and the
//! worker pool that drains a run through the lookup orchestrator.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinSet;

use crate::lookup::LookupOrchestrator;
use crate::metrics::EngineMetrics;
use crate::normalize::{idempotency_key, normalize_address, normalize_person};
use crate::{Error, Result};

use super::{Run, RunError, RunId, RunItem, RunItemId, RunItemStatus, RunResult, RunStore};

/// Raw inputs for one unit of work, as received from the record store.
#[derive(Clone, Debug)]
pub struct SubjectRequest {
    pub subject_id: String,
    pub address: String,
    pub person: String,
}

/// Tagged result of an idempotent submission: callers can tell whether
/// the batch already existed without decoding an error status.
#[derive(Clone, Debug)]
pub enum Submission {
    Created(Run),
    Existing(Run),
}

impl Submission {
    pub fn run(&self) -> &Run {
        match self {
            Submission::Created(run) | Submission::Existing(run) => run,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Submission::Created(_))
    }
}

/// Failure triage for a run: failed items grouped by error category.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub run: Run,
    pub failures_by_category: BTreeMap<String, Vec<RunItemId>>,
}

/// Owns all Run and RunItem mutation.
pub struct RunCoordinator {
    store: Arc<dyn RunStore>,
    provider_name: String,
    metrics: Arc<EngineMetrics>,
}

impl RunCoordinator {
    pub fn new(
        store: Arc<dyn RunStore>,
        provider_name: impl Into<String>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            store,
            provider_name: provider_name.into(),
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Find-or-create a run for `source_label`.
    ///
    /// Enumeration normalizes every subject up front; items with
    /// unusable input are created already failed (no provider call, no
    /// cost) so the batch total still accounts for them.
    pub async fn submit(
        &self,
        source_label: impl Into<String>,
        subjects: Vec<SubjectRequest>,
    ) -> RunResult<Submission> {
        let source_label = source_label.into();
        if let Some(existing) = self.store.find_run_by_label(&source_label).await? {
            tracing::info!(run = %existing.id, label = %source_label, "run already exists");
            return Ok(Submission::Existing(existing));
        }

        let run_id = RunId::new();
        let mut items = Vec::with_capacity(subjects.len());
        let mut queued = 0u32;
        let mut failed = 0u32;

        for subject in subjects {
            let normalized = normalize_address(&subject.address).and_then(|address| {
                normalize_person(&subject.person).map(|person| (address, person))
            });
            let item = match normalized {
                Ok((address, person)) => {
                    queued += 1;
                    RunItem {
                        id: RunItemId::new(),
                        run_id,
                        subject_id: subject.subject_id,
                        status: RunItemStatus::Queued,
                        attempt: 0,
                        idempotency_key: idempotency_key(&self.provider_name, &address, &person),
                        normalized_address: address,
                        normalized_person: person,
                        last_error: None,
                        updated_at: Utc::now(),
                    }
                }
                Err(e) => {
                    failed += 1;
                    RunItem {
                        id: RunItemId::new(),
                        run_id,
                        subject_id: subject.subject_id,
                        status: RunItemStatus::Failed,
                        attempt: 0,
                        idempotency_key: String::new(),
                        normalized_address: String::new(),
                        normalized_person: String::new(),
                        last_error: Some(format!("validation: {e}")),
                        updated_at: Utc::now(),
                    }
                }
            };
            items.push(item);
        }

        let run = Run {
            id: run_id,
            source_label: source_label.clone(),
            total: queued + failed,
            queued,
            in_flight: 0,
            done: 0,
            failed,
            started_at: Utc::now(),
            finished_at: None,
            soft_paused: false,
            reason: None,
        };
        self.store.insert_run(run.clone(), items).await?;
        tracing::info!(
            run = %run_id,
            label = %source_label,
            total = run.total,
            invalid = failed,
            "run created"
        );
        Ok(Submission::Created(run))
    }

    /// Stop claiming new items. Idempotent; in-flight work finishes
    /// naturally so an already-billed call is never wasted.
    pub async fn pause(&self, run_id: RunId) -> RunResult<Run> {
        let run = self
            .store
            .set_paused(run_id, true, Some("operator_paused".to_string()))
            .await?;
        tracing::info!(run = %run_id, "run paused");
        Ok(run)
    }

    /// Clear the pause flag so queued items resume being claimed.
    pub async fn resume(&self, run_id: RunId) -> RunResult<Run> {
        let run = self.store.set_paused(run_id, false, None).await?;
        tracing::info!(run = %run_id, "run resumed");
        Ok(run)
    }

    pub async fn status(&self, run_id: RunId) -> RunResult<Run> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or(RunError::RunNotFound { id: run_id })
    }

    pub async fn items(&self, run_id: RunId) -> RunResult<Vec<RunItem>> {
        self.store.items(run_id).await
    }

    /// Group failed items by the stable category prefix of `last_error`.
    pub async fn report(&self, run_id: RunId) -> RunResult<RunReport> {
        let run = self.status(run_id).await?;
        let mut failures_by_category: BTreeMap<String, Vec<RunItemId>> = BTreeMap::new();
        for item in self.store.items(run_id).await? {
            if item.status != RunItemStatus::Failed {
                continue;
            }
            let category = item
                .last_error
                .as_deref()
                .and_then(|e| e.split(':').next())
                .unwrap_or("unknown")
                .to_string();
            failures_by_category.entry(category).or_default().push(item.id);
        }
        Ok(RunReport {
            run,
            failures_by_category,
        })
    }

    /// Administrative retry of one failed item (attempt count preserved).
    pub async fn retry_failed_item(&self, item_id: RunItemId) -> RunResult<RunItem> {
        self.store.retry_failed_item(item_id).await
    }

    /// Administrative retry of every failed item in a run.
    pub async fn retry_all_failed(&self, run_id: RunId) -> RunResult<usize> {
        self.store.retry_all_failed(run_id).await
    }

    /// Drain a run with a bounded worker pool.
    ///
    /// Returns when no more work can be claimed: the run is terminal,
    /// paused (by an operator or a budget stop), or out of queued items.
    pub async fn drive(
        &self,
        run_id: RunId,
        orchestrator: Arc<LookupOrchestrator>,
        workers: usize,
    ) -> Result<Run> {
        let workers = workers.max(1);
        tracing::info!(run = %run_id, workers, "driving run");

        let mut pool: JoinSet<Result<()>> = JoinSet::new();
        for _ in 0..workers {
            let store = Arc::clone(&self.store);
            let orchestrator = Arc::clone(&orchestrator);
            let metrics = Arc::clone(&self.metrics);
            pool.spawn(async move { worker_loop(store, orchestrator, metrics, run_id).await });
        }
        while let Some(joined) = pool.join_next().await {
            joined.map_err(|e| {
                Error::Run(RunError::Storage {
                    message: format!("worker panicked: {e}"),
                })
            })??;
        }

        let run = self.status(run_id).await?;
        tracing::info!(
            run = %run_id,
            done = run.done,
            failed = run.failed,
            queued = run.queued,
            paused = run.soft_paused,
            "drive finished"
        );
        Ok(run)
    }
}

async fn worker_loop(
    store: Arc<dyn RunStore>,
    orchestrator: Arc<LookupOrchestrator>,
    metrics: Arc<EngineMetrics>,
    run_id: RunId,
) -> Result<()> {
    loop {
        let Some(item) = store.claim_next(run_id).await? else {
            return Ok(());
        };
        process_item(&store, &orchestrator, &metrics, run_id, item).await?;
    }
}

/// Execute one claimed item to a terminal state (or back to the queue).
///
/// Attempts on a single item are strictly sequential; retries happen
/// here, inside the claim, never as concurrent re-claims.
async fn process_item(
    store: &Arc<dyn RunStore>,
    orchestrator: &Arc<LookupOrchestrator>,
    metrics: &Arc<EngineMetrics>,
    run_id: RunId,
    item: RunItem,
) -> Result<()> {
    let policy = orchestrator.retry_policy().clone();
    let mut attempt = item.attempt;

    loop {
        match orchestrator.resolve_item(&item).await {
            Ok(resolution) => {
                store.mark_done(item.id).await?;
                metrics.items_done.inc();
                tracing::debug!(
                    run = %run_id,
                    item = %item.id,
                    cached = resolution.cached,
                    "item done"
                );
                return Ok(());
            }
            Err(Error::BudgetExceeded { reason }) => {
                // Not a failure: the item stays queued for a later day
                // (or a raised cap), and the run stops claiming.
                store.requeue(item.id).await?;
                store
                    .set_paused(run_id, true, Some(reason.to_string()))
                    .await?;
                tracing::warn!(run = %run_id, item = %item.id, %reason, "run paused by budget stop");
                return Ok(());
            }
            Err(e) if e.is_retryable() && policy.allows_retry(attempt) => {
                let delay = policy.delay_after(attempt, e.retry_after());
                tracing::warn!(
                    run = %run_id,
                    item = %item.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt = store.bump_attempt(item.id).await?;
            }
            Err(e) => {
                store
                    .mark_failed(item.id, &format!("{}: {}", e.category(), e))
                    .await?;
                metrics.items_failed.inc();
                tracing::warn!(run = %run_id, item = %item.id, error = %e, "item failed");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::MemoryRunStore;

    fn coordinator() -> RunCoordinator {
        RunCoordinator::new(
            Arc::new(MemoryRunStore::new()),
            "skiptrace",
            Arc::new(EngineMetrics::new()),
        )
    }

    fn subject(i: usize) -> SubjectRequest {
        SubjectRequest {
            subject_id: format!("lead-{i}"),
            address: format!("{i} Main Street"),
            person: "John Doe".to_string(),
        }
    }

    #[tokio::test]
    async fn test_submit_is_find_or_create() {
        let coordinator = coordinator();

        let first = coordinator
            .submit("batch-2026-08", (0..3).map(subject).collect())
            .await
            .unwrap();
        assert!(first.is_created());
        assert_eq!(first.run().total, 3);

        let second = coordinator
            .submit("batch-2026-08", (0..3).map(subject).collect())
            .await
            .unwrap();
        assert!(!second.is_created());
        assert_eq!(second.run().id, first.run().id);
    }

    #[tokio::test]
    async fn test_invalid_subjects_fail_at_enumeration() {
        let coordinator = coordinator();

        let mut subjects: Vec<SubjectRequest> = (0..2).map(subject).collect();
        subjects.push(SubjectRequest {
            subject_id: "lead-bad".to_string(),
            address: "no digits".to_string(),
            person: "John Doe".to_string(),
        });

        let run = coordinator
            .submit("batch", subjects)
            .await
            .unwrap()
            .run()
            .clone();
        assert_eq!((run.total, run.queued, run.failed), (3, 2, 1));
        assert!(run.counters_consistent());

        let report = coordinator.report(run.id).await.unwrap();
        assert_eq!(report.failures_by_category["validation"].len(), 1);
    }

    #[tokio::test]
    async fn test_all_invalid_batch_is_terminal_immediately() {
        let coordinator = coordinator();
        let run = coordinator
            .submit(
                "batch",
                vec![SubjectRequest {
                    subject_id: "lead-bad".to_string(),
                    address: "   ".to_string(),
                    person: "J".to_string(),
                }],
            )
            .await
            .unwrap()
            .run()
            .clone();

        let run = coordinator.status(run.id).await.unwrap();
        assert!(run.is_terminal());
        assert!(run.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_pause_is_idempotent() {
        let coordinator = coordinator();
        let run = coordinator
            .submit("batch", (0..2).map(subject).collect())
            .await
            .unwrap()
            .run()
            .clone();

        coordinator.pause(run.id).await.unwrap();
        let paused = coordinator.pause(run.id).await.unwrap();
        assert!(paused.soft_paused);

        let resumed = coordinator.resume(run.id).await.unwrap();
        assert!(!resumed.soft_paused);
        assert!(resumed.reason.is_none());
    }
}
