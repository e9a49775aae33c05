//! Match lifecycle: propose, confirm, reject, manual match, unmatch and override edits.

use crate::matching::normalize::normalize_vendor;
use crate::matching::scorer::{Candidate, CandidateScorer};
use crate::models::{
    Match, MatchStatus, MatchTarget, NewMatch, NewVendorAlias, Receipt, ScoreBreakdown,
    VendorAlias, VendorOverrides,
};
use crate::services::metrics::{record_error, record_match_operation};
use crate::services::retry::RetryPolicy;
use crate::services::store::{
    group_not_found, match_not_found, receipt_not_found, transaction_not_found, MatchStore,
};
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// A confirmed match plus the alias learned from it.
#[derive(Debug, Clone)]
pub struct ConfirmOutcome {
    pub confirmed: Match,
    pub alias: Option<VendorAlias>,
    pub alias_created: bool,
}

#[derive(Debug, Clone)]
pub struct UnmatchOutcome {
    pub removed: Match,
    pub warnings: Vec<String>,
}

fn outcome_label<T>(result: &Result<T, AppError>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(e) => e.code(),
    }
}

pub struct MatchLifecycleManager {
    store: Arc<dyn MatchStore>,
    scorer: CandidateScorer,
    retry: RetryPolicy,
}

impl MatchLifecycleManager {
    pub fn new(store: Arc<dyn MatchStore>, scorer: CandidateScorer, retry: RetryPolicy) -> Self {
        Self {
            store,
            scorer,
            retry,
        }
    }

    pub async fn get(&self, match_id: Uuid) -> Result<Match, AppError> {
        self.retry
            .run("get_match", || self.store.get_match(match_id))
            .await?
            .ok_or_else(|| match_not_found(match_id))
    }

    /// Create a Proposed match. `Conflict` when either side is already active.
    #[instrument(skip(self, scores, reason), fields(receipt_id = %receipt_id, target = %target))]
    pub async fn propose(
        &self,
        receipt_id: Uuid,
        target: MatchTarget,
        scores: ScoreBreakdown,
        reason: String,
    ) -> Result<Match, AppError> {
        let new = NewMatch {
            receipt_id,
            target,
            scores,
            match_reason: reason,
            is_manual: false,
            overrides: VendorOverrides::default(),
        };
        let result = self
            .retry
            .run("insert_match", || self.store.insert_match(new.clone()))
            .await;
        record_match_operation("propose", outcome_label(&result));
        result
    }

    /// Proposed -> Confirmed, then learn a vendor alias from the pairing.
    #[instrument(skip(self, overrides), fields(match_id = %match_id))]
    pub async fn confirm(
        &self,
        match_id: Uuid,
        overrides: Option<VendorOverrides>,
        expected_version: Option<i32>,
    ) -> Result<ConfirmOutcome, AppError> {
        let result = self
            .retry
            .run("resolve_match", || {
                self.store.resolve_match(
                    match_id,
                    MatchStatus::Confirmed,
                    overrides.clone(),
                    expected_version,
                )
            })
            .await;
        record_match_operation("confirm", outcome_label(&result));
        let confirmed = result?;

        let (alias, alias_created) = self.learn_alias(&confirmed).await;
        info!(match_id = %confirmed.id, alias_created, "Match confirmed");

        Ok(ConfirmOutcome {
            confirmed,
            alias,
            alias_created,
        })
    }

    /// Proposed -> Rejected. Both sides become eligible again.
    #[instrument(skip(self), fields(match_id = %match_id))]
    pub async fn reject(
        &self,
        match_id: Uuid,
        expected_version: Option<i32>,
    ) -> Result<Match, AppError> {
        let result = self
            .retry
            .run("resolve_match", || {
                self.store
                    .resolve_match(match_id, MatchStatus::Rejected, None, expected_version)
            })
            .await;
        record_match_operation("reject", outcome_label(&result));
        result
    }

    /// Link a receipt directly, Confirmed at once, with advisory scores.
    #[instrument(skip(self, overrides), fields(receipt_id = %receipt_id, target = %target))]
    pub async fn manual_match(
        &self,
        receipt_id: Uuid,
        target: MatchTarget,
        overrides: VendorOverrides,
    ) -> Result<ConfirmOutcome, AppError> {
        let receipt = self.load_receipt(receipt_id).await?;
        let candidate = self.load_candidate(target).await?;
        let aliases = self
            .retry
            .run("list_vendor_aliases", || self.store.list_vendor_aliases())
            .await?;
        let scores = self.scorer.score(&receipt, &candidate, &aliases);

        let new = NewMatch {
            receipt_id,
            target,
            scores,
            match_reason: format!("manual match (advisory score {})", scores.total()),
            is_manual: true,
            overrides,
        };
        let result = self
            .retry
            .run("insert_match", || self.store.insert_match(new.clone()))
            .await;
        record_match_operation("manual_match", outcome_label(&result));
        let confirmed = result?;

        let (alias, alias_created) = self.learn_alias(&confirmed).await;
        info!(match_id = %confirmed.id, score = scores.total(), "Manual match created");

        Ok(ConfirmOutcome {
            confirmed,
            alias,
            alias_created,
        })
    }

    /// Remove a Confirmed match. Warns when a group loses its receipt evidence.
    #[instrument(skip(self), fields(match_id = %match_id))]
    pub async fn unmatch(&self, match_id: Uuid) -> Result<UnmatchOutcome, AppError> {
        let result = self
            .retry
            .run("delete_match", || self.store.delete_match(match_id))
            .await;
        record_match_operation("unmatch", outcome_label(&result));
        let removed = result?;

        let mut warnings = Vec::new();
        if let MatchTarget::Group(group_id) = removed.target {
            // The match is already gone; group bookkeeping must not fail the unmatch.
            match self.release_group_evidence(group_id).await {
                Ok(Some(warning)) => warnings.push(warning),
                Ok(None) => {}
                Err(e) => {
                    record_error("unmatch_group_followup");
                    warn!(
                        match_id = %match_id,
                        group_id = %group_id,
                        error = %e,
                        "Group follow-up after unmatch failed"
                    );
                }
            }
        }

        info!(match_id = %match_id, warnings = warnings.len(), "Match unmatched");
        Ok(UnmatchOutcome { removed, warnings })
    }

    /// Clear a released group's mismatch warning and describe what it lost.
    async fn release_group_evidence(&self, group_id: Uuid) -> Result<Option<String>, AppError> {
        let Some(group) = self
            .retry
            .run("get_group", || self.store.get_group(group_id))
            .await?
        else {
            return Ok(None);
        };

        if group.match_warning.is_some() {
            self.retry
                .run("set_group_warning", || {
                    self.store.set_group_warning(group_id, None)
                })
                .await?;
        }

        Ok(Some(format!(
            "Transaction group '{}' (combined amount {}) no longer has receipt evidence for its amount reconciliation",
            group.name, group.combined_amount
        )))
    }

    /// Hand-edit vendor metadata on an active match, guarded by its version.
    #[instrument(skip(self, overrides), fields(match_id = %match_id))]
    pub async fn update_overrides(
        &self,
        match_id: Uuid,
        expected_version: i32,
        overrides: VendorOverrides,
    ) -> Result<Match, AppError> {
        let result = self
            .retry
            .run("update_match_overrides", || {
                self.store
                    .update_match_overrides(match_id, expected_version, overrides.clone())
            })
            .await;
        record_match_operation("update_overrides", outcome_label(&result));
        result
    }

    pub(crate) async fn load_receipt(&self, receipt_id: Uuid) -> Result<Receipt, AppError> {
        self.retry
            .run("get_receipt", || self.store.get_receipt(receipt_id))
            .await?
            .ok_or_else(|| receipt_not_found(receipt_id))
    }

    pub(crate) async fn load_candidate(&self, target: MatchTarget) -> Result<Candidate, AppError> {
        match target {
            MatchTarget::Transaction(id) => self
                .retry
                .run("get_transaction", || self.store.get_transaction(id))
                .await?
                .map(Candidate::Transaction)
                .ok_or_else(|| transaction_not_found(id)),
            MatchTarget::Group(id) => self
                .retry
                .run("get_group", || self.store.get_group(id))
                .await?
                .map(Candidate::Group)
                .ok_or_else(|| group_not_found(id)),
        }
    }

    /// Upsert the alias keyed by the candidate's normalised text. Failures are
    /// logged and do not undo the confirmation.
    async fn learn_alias(&self, confirmed: &Match) -> (Option<VendorAlias>, bool) {
        let learned = async {
            let receipt = self.load_receipt(confirmed.receipt_id).await?;
            let candidate = self.load_candidate(confirmed.target).await?;

            let pattern = normalize_vendor(candidate.vendor_text());
            if pattern.is_empty() {
                return Ok(None);
            }
            let canonical_name = confirmed
                .overrides
                .vendor_display_name
                .clone()
                .or_else(|| receipt.vendor.clone())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| candidate.vendor_text().trim().to_string());

            let alias = NewVendorAlias {
                canonical_name,
                match_pattern: pattern,
                default_gl_code: confirmed.overrides.default_gl_code.clone(),
                default_department: confirmed.overrides.default_department.clone(),
            };
            let upserted = self
                .retry
                .run("upsert_vendor_alias", || {
                    self.store.upsert_vendor_alias(alias.clone())
                })
                .await?;
            Ok::<_, AppError>(Some(upserted))
        };

        match learned.await {
            Ok(Some((alias, created))) => (Some(alias), created),
            Ok(None) => (None, false),
            Err(e) => {
                record_error("alias_upsert");
                warn!(match_id = %confirmed.id, error = %e, "Vendor alias learning failed");
                (None, false)
            }
        }
    }
}
