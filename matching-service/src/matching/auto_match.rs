//! Auto-match sweep: rank unmatched receipts in parallel, propose serially.

use crate::matching::lifecycle::MatchLifecycleManager;
use crate::matching::ranker::{detect_ambiguity, CandidateRanker, RankedCandidate, Ranking};
use crate::matching::scorer::Candidate;
use crate::models::{Match, MatchTarget, Receipt};
use crate::services::metrics::{record_auto_match_duration, record_error, record_proposal};
use crate::services::retry::RetryPolicy;
use crate::services::store::MatchStore;
use futures::stream::{self, StreamExt};
use service_core::error::AppError;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Proposal {
    pub proposed: Match,
    pub ambiguous: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AutoMatchReport {
    pub proposed_count: usize,
    pub transaction_match_count: usize,
    pub group_match_count: usize,
    pub processed_count: usize,
    pub ambiguous_count: usize,
    pub duration_ms: u64,
    pub cancelled: bool,
    pub proposals: Vec<Proposal>,
}

pub struct AutoMatchCoordinator {
    store: Arc<dyn MatchStore>,
    ranker: CandidateRanker,
    lifecycle: Arc<MatchLifecycleManager>,
    concurrency: usize,
    retry: RetryPolicy,
}

impl AutoMatchCoordinator {
    pub fn new(
        store: Arc<dyn MatchStore>,
        ranker: CandidateRanker,
        lifecycle: Arc<MatchLifecycleManager>,
        concurrency: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            ranker,
            lifecycle,
            concurrency: concurrency.max(1),
            retry,
        }
    }

    pub fn ranker(&self) -> &CandidateRanker {
        &self.ranker
    }

    /// Rank every eligible candidate for one receipt.
    pub async fn rank_receipt(&self, receipt: &Receipt) -> Result<Ranking, AppError> {
        let (candidates, aliases) = self.load_candidates().await?;
        Ok(self.ranker.rank(receipt, &candidates, &aliases))
    }

    async fn load_candidates(
        &self,
    ) -> Result<(Vec<Candidate>, Vec<crate::models::VendorAlias>), AppError> {
        let transactions = self
            .retry
            .run("list_candidate_transactions", || {
                self.store.list_candidate_transactions()
            })
            .await?;
        let groups = self
            .retry
            .run("list_candidate_groups", || self.store.list_candidate_groups())
            .await?;
        let aliases = self
            .retry
            .run("list_vendor_aliases", || self.store.list_vendor_aliases())
            .await?;

        let candidates = transactions
            .into_iter()
            .map(Candidate::Transaction)
            .chain(groups.into_iter().map(Candidate::Group))
            .collect();
        Ok((candidates, aliases))
    }

    async fn target_receipts(&self, receipt_ids: Option<Vec<Uuid>>) -> Result<Vec<Receipt>, AppError> {
        let mut receipts = match receipt_ids {
            Some(ids) => {
                let mut seen = HashSet::new();
                let ids: Vec<Uuid> = ids.into_iter().filter(|id| seen.insert(*id)).collect();
                let found = self
                    .retry
                    .run("get_receipts", || self.store.get_receipts(&ids))
                    .await?;
                for id in ids.iter().filter(|id| !found.iter().any(|r| r.id == **id)) {
                    warn!(receipt_id = %id, "Skipping unknown receipt in auto-match request");
                }
                found
            }
            None => {
                self.retry
                    .run("list_unmatched_receipts", || {
                        self.store.list_unmatched_receipts()
                    })
                    .await?
            }
        };
        receipts.sort_by_key(|r| (r.created_utc, r.id));
        Ok(receipts)
    }

    /// Sweep `receipt_ids` (or every unmatched receipt) and create proposals.
    ///
    /// Candidates are loaded once. A candidate claimed earlier in the sweep is
    /// skipped for later receipts, which fall back to their next best. Conflicts
    /// from concurrent writers are skipped; cancellation is honoured between receipts.
    #[instrument(skip(self, receipt_ids, cancel), fields(explicit = receipt_ids.is_some()))]
    pub async fn run_auto_match(
        &self,
        receipt_ids: Option<Vec<Uuid>>,
        cancel: CancellationToken,
    ) -> Result<AutoMatchReport, AppError> {
        let start = Instant::now();
        let receipts = self.target_receipts(receipt_ids).await?;
        let (candidates, aliases) = self.load_candidates().await?;
        let candidates = Arc::new(candidates);
        let aliases = Arc::new(aliases);

        info!(
            receipts = receipts.len(),
            candidates = candidates.len(),
            "Auto-match sweep started"
        );

        let policy = self.ranker.scorer().policy().clone();
        let ranker = self.ranker.clone();

        let mut rankings = stream::iter(receipts)
            .map(|receipt| {
                let ranker = ranker.clone();
                let candidates = candidates.clone();
                let aliases = aliases.clone();
                async move {
                    tokio::task::spawn_blocking(move || {
                        let ranking = ranker.rank(&receipt, &candidates, &aliases);
                        (receipt, ranking)
                    })
                    .await
                    .map_err(|e| AppError::InternalError(anyhow::anyhow!("Ranking task failed: {}", e)))
                }
            })
            .buffered(self.concurrency);

        let mut report = AutoMatchReport::default();
        let mut claimed: HashSet<MatchTarget> = HashSet::new();

        while let Some(ranked) = rankings.next().await {
            if cancel.is_cancelled() {
                report.cancelled = true;
                info!(processed = report.processed_count, "Auto-match sweep cancelled");
                break;
            }

            let (receipt, ranking) = ranked?;
            report.processed_count += 1;

            let available: Vec<RankedCandidate> = ranking
                .candidates
                .into_iter()
                .filter(|c| !claimed.contains(&c.candidate.target()))
                .collect();
            let Some(best) = available
                .first()
                .filter(|c| c.confidence() >= policy.auto_propose_threshold)
            else {
                continue;
            };
            let ambiguous = detect_ambiguity(
                &available,
                policy.auto_propose_threshold,
                policy.ambiguity_epsilon,
            );

            let target = best.candidate.target();
            match self
                .lifecycle
                .propose(receipt.id, target, best.scores, best.reason())
                .await
            {
                Ok(proposed) => {
                    claimed.insert(target);
                    report.proposed_count += 1;
                    if ambiguous {
                        report.ambiguous_count += 1;
                    }
                    match target {
                        MatchTarget::Transaction(_) => report.transaction_match_count += 1,
                        MatchTarget::Group(_) => report.group_match_count += 1,
                    }
                    record_proposal(target.kind());
                    report.proposals.push(Proposal {
                        proposed,
                        ambiguous,
                    });
                }
                Err(AppError::Conflict(e)) => {
                    debug!(receipt_id = %receipt.id, error = %e, "Skipping receipt: already matched");
                }
                Err(AppError::NotFound(e)) => {
                    warn!(receipt_id = %receipt.id, error = %e, "Skipping receipt: record vanished mid-sweep");
                }
                Err(e) => {
                    record_error("auto_match");
                    return Err(e);
                }
            }
        }

        let elapsed = start.elapsed();
        report.duration_ms = elapsed.as_millis() as u64;
        record_auto_match_duration(elapsed.as_secs_f64());

        info!(
            proposed = report.proposed_count,
            processed = report.processed_count,
            ambiguous = report.ambiguous_count,
            duration_ms = report.duration_ms,
            cancelled = report.cancelled,
            "Auto-match sweep finished"
        );

        Ok(report)
    }
}
