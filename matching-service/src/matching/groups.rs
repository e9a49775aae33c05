//! Transaction-group glue: membership edits re-validate any active match.

use crate::config::ScoringPolicy;
use crate::models::{Match, MatchTarget, TransactionGroup};
use crate::services::retry::RetryPolicy;
use crate::services::store::{group_not_found, receipt_not_found, MatchStore};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// A group with its active match and current warning.
#[derive(Debug, Clone)]
pub struct GroupView {
    pub group: TransactionGroup,
    pub active_match: Option<Match>,
}

impl GroupView {
    pub fn warning(&self) -> Option<&str> {
        self.group.match_warning.as_deref()
    }
}

#[derive(Debug, Clone)]
pub struct GroupDeletion {
    pub group: TransactionGroup,
    pub released_match: Option<Match>,
    pub warnings: Vec<String>,
}

pub struct GroupCoordinator {
    store: Arc<dyn MatchStore>,
    policy: ScoringPolicy,
    retry: RetryPolicy,
}

impl GroupCoordinator {
    pub fn new(store: Arc<dyn MatchStore>, policy: ScoringPolicy, retry: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            retry,
        }
    }

    #[instrument(skip(self, transaction_ids, name), fields(members = transaction_ids.len()))]
    pub async fn create_group(
        &self,
        transaction_ids: Vec<Uuid>,
        name: Option<String>,
        display_date: Option<NaiveDate>,
    ) -> Result<GroupView, AppError> {
        let mut seen = HashSet::new();
        let ids: Vec<Uuid> = transaction_ids
            .into_iter()
            .filter(|id| seen.insert(*id))
            .collect();
        if ids.len() < 2 {
            return Err(AppError::invalid_field(
                "transactionIds",
                "min_members",
                "A group needs at least two distinct transactions",
            ));
        }
        let name = name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());

        let group = self.store.create_group(&ids, name, display_date).await?;
        info!(group_id = %group.id, combined_amount = %group.combined_amount, "Transaction group created");
        Ok(GroupView {
            group,
            active_match: None,
        })
    }

    pub async fn get_group(&self, group_id: Uuid) -> Result<GroupView, AppError> {
        let group = self
            .retry
            .run("get_group", || self.store.get_group(group_id))
            .await?
            .ok_or_else(|| group_not_found(group_id))?;
        let active_match = self
            .retry
            .run("find_active_match_for_target", || {
                self.store
                    .find_active_match_for_target(MatchTarget::Group(group_id))
            })
            .await?;
        Ok(GroupView {
            group,
            active_match,
        })
    }

    #[instrument(skip(self), fields(group_id = %group_id, transaction_id = %transaction_id))]
    pub async fn add_transaction(
        &self,
        group_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<GroupView, AppError> {
        let group = self.store.add_group_member(group_id, transaction_id).await?;
        self.revalidate(group).await
    }

    #[instrument(skip(self), fields(group_id = %group_id, transaction_id = %transaction_id))]
    pub async fn remove_transaction(
        &self,
        group_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<GroupView, AppError> {
        let group = self
            .store
            .remove_group_member(group_id, transaction_id)
            .await?;
        self.revalidate(group).await
    }

    /// Ungroup. Any active match is released and reported.
    #[instrument(skip(self), fields(group_id = %group_id))]
    pub async fn delete_group(&self, group_id: Uuid) -> Result<GroupDeletion, AppError> {
        let release = self.store.delete_group(group_id).await?;

        let mut warnings = Vec::new();
        if let Some(released) = &release.released_match {
            warnings.push(format!(
                "Match {} ({}) on group '{}' was released; receipt {} is unmatched again",
                released.id,
                released.status(),
                release.group.name,
                released.receipt_id
            ));
            warn!(match_id = %released.id, receipt_id = %released.receipt_id, "Group deletion released an active match");
        }

        info!(members = release.group.member_transaction_ids.len(), "Transaction group deleted");
        Ok(GroupDeletion {
            group: release.group,
            released_match: release.released_match,
            warnings,
        })
    }

    /// Compare the receipt amount of an active match with the group's new
    /// combined amount and persist or clear the warning.
    async fn revalidate(&self, mut group: TransactionGroup) -> Result<GroupView, AppError> {
        let active_match = self
            .retry
            .run("find_active_match_for_target", || {
                self.store
                    .find_active_match_for_target(MatchTarget::Group(group.id))
            })
            .await?;

        let warning = match &active_match {
            Some(m) => {
                let receipt = self
                    .retry
                    .run("get_receipt", || self.store.get_receipt(m.receipt_id))
                    .await?
                    .ok_or_else(|| receipt_not_found(m.receipt_id))?;
                amount_mismatch_warning(
                    receipt.amount,
                    group.combined_amount,
                    self.policy.amount_exact_tolerance,
                )
            }
            None => None,
        };

        if warning != group.match_warning {
            self.store.set_group_warning(group.id, warning.clone()).await?;
            if let Some(w) = &warning {
                warn!(group_id = %group.id, warning = %w, "Matched group amount no longer reconciles");
            }
            group.match_warning = warning;
        }

        Ok(GroupView {
            group,
            active_match,
        })
    }
}

/// `None` when the amounts agree within `tolerance` (compared by absolute value).
pub fn amount_mismatch_warning(
    receipt_amount: Option<Decimal>,
    combined_amount: Decimal,
    tolerance: Decimal,
) -> Option<String> {
    match receipt_amount {
        Some(amount) if (amount.abs() - combined_amount.abs()).abs() <= tolerance => None,
        Some(amount) => Some(format!(
            "Group combined amount {} no longer matches the matched receipt amount {}",
            combined_amount.round_dp(2),
            amount.round_dp(2)
        )),
        None => Some(format!(
            "Matched receipt has no amount to reconcile against group combined amount {}",
            combined_amount.round_dp(2)
        )),
    }
}
