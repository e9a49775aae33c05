//! Batch confirm/reject with bounded concurrency and partial-failure counts.

use crate::matching::lifecycle::MatchLifecycleManager;
use crate::services::retry::RetryPolicy;
use crate::services::store::MatchStore;
use futures::stream::{self, StreamExt};
use service_core::error::AppError;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub skipped: usize,
}

pub struct BatchOperationCoordinator {
    store: Arc<dyn MatchStore>,
    lifecycle: Arc<MatchLifecycleManager>,
    concurrency: usize,
    retry: RetryPolicy,
}

impl BatchOperationCoordinator {
    pub fn new(
        store: Arc<dyn MatchStore>,
        lifecycle: Arc<MatchLifecycleManager>,
        concurrency: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            lifecycle,
            concurrency: concurrency.max(1),
            retry,
        }
    }

    /// Confirm by explicit ids, or every Proposed match at or above `min_confidence`.
    ///
    /// Non-empty `ids` take precedence and `min_confidence` is then ignored.
    #[instrument(skip(self, ids))]
    pub async fn batch_approve(
        &self,
        ids: Option<Vec<Uuid>>,
        min_confidence: Option<i32>,
    ) -> Result<BatchOutcome, AppError> {
        let targets = match (ids.filter(|ids| !ids.is_empty()), min_confidence) {
            (Some(ids), _) => dedup(ids),
            (None, Some(min)) => {
                if !(0..=100).contains(&min) {
                    return Err(AppError::invalid_field(
                        "minConfidence",
                        "range",
                        "minConfidence must be between 0 and 100",
                    ));
                }
                self.retry
                    .run("list_proposed_ids", || self.store.list_proposed_ids(min))
                    .await?
            }
            (None, None) => {
                return Err(AppError::invalid_field(
                    "ids",
                    "selector_required",
                    "Either ids or minConfidence must be provided",
                ));
            }
        };

        let outcome = self
            .apply(targets, |id| async move {
                self.lifecycle.confirm(id, None, None).await.map(|_| ())
            })
            .await;
        info!(
            approved = outcome.succeeded,
            skipped = outcome.skipped,
            "Batch approve finished"
        );
        Ok(outcome)
    }

    /// Reject every listed match. No alias learning.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn batch_reject(&self, ids: Vec<Uuid>) -> Result<BatchOutcome, AppError> {
        if ids.is_empty() {
            return Err(AppError::invalid_field(
                "ids",
                "required",
                "ids must contain at least one match id",
            ));
        }

        let outcome = self
            .apply(dedup(ids), |id| async move {
                self.lifecycle.reject(id, None).await.map(|_| ())
            })
            .await;
        info!(
            rejected = outcome.succeeded,
            skipped = outcome.skipped,
            "Batch reject finished"
        );
        Ok(outcome)
    }

    async fn apply<F, Fut>(&self, ids: Vec<Uuid>, op: F) -> BatchOutcome
    where
        F: Fn(Uuid) -> Fut,
        Fut: std::future::Future<Output = Result<(), AppError>>,
    {
        let results: Vec<(Uuid, Result<(), AppError>)> = stream::iter(ids)
            .map(|id| {
                let fut = op(id);
                async move { (id, fut.await) }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        results
            .into_iter()
            .fold(BatchOutcome::default(), |mut acc, (id, result)| {
                match result {
                    Ok(()) => acc.succeeded += 1,
                    Err(e) => {
                        debug!(match_id = %id, error = %e, "Skipping match in batch");
                        acc.skipped += 1;
                    }
                }
                acc
            })
    }
}

fn dedup(ids: Vec<Uuid>) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}
