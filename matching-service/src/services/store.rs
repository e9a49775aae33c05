//! Storage seam for the matching engine.
//!
//! Every mutating method is one atomic unit: the "is either side already
//! actively matched?" check and the write happen together, so concurrent
//! callers produce exactly one winner and the loser sees `Conflict`.

use crate::models::{
    Match, MatchStats, MatchStatus, MatchTarget, NewMatch, NewVendorAlias, Receipt, Transaction,
    TransactionGroup, VendorAlias, VendorOverrides,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use service_core::error::AppError;
use uuid::Uuid;

/// Result of deleting a group.
#[derive(Debug, Clone)]
pub struct GroupRelease {
    pub group: TransactionGroup,
    pub released_match: Option<Match>,
}

#[async_trait]
pub trait MatchStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    // ------------------------------------------------------------------
    // Candidate source
    // ------------------------------------------------------------------

    async fn insert_receipt(&self, receipt: Receipt) -> Result<Receipt, AppError>;
    async fn insert_transaction(&self, transaction: Transaction) -> Result<Transaction, AppError>;

    async fn get_receipt(&self, receipt_id: Uuid) -> Result<Option<Receipt>, AppError>;
    /// Known receipts among `receipt_ids`, in the order given.
    async fn get_receipts(&self, receipt_ids: &[Uuid]) -> Result<Vec<Receipt>, AppError>;
    /// Receipts without an active match, ordered by creation time then id.
    async fn list_unmatched_receipts(&self) -> Result<Vec<Receipt>, AppError>;

    async fn get_transaction(&self, transaction_id: Uuid) -> Result<Option<Transaction>, AppError>;
    /// Ungrouped transactions without an active match.
    async fn list_candidate_transactions(&self) -> Result<Vec<Transaction>, AppError>;

    async fn get_group(&self, group_id: Uuid) -> Result<Option<TransactionGroup>, AppError>;
    /// Groups without an active match.
    async fn list_candidate_groups(&self) -> Result<Vec<TransactionGroup>, AppError>;

    // ------------------------------------------------------------------
    // Matches
    // ------------------------------------------------------------------

    async fn get_match(&self, match_id: Uuid) -> Result<Option<Match>, AppError>;
    async fn find_active_match_for_target(
        &self,
        target: MatchTarget,
    ) -> Result<Option<Match>, AppError>;
    /// One page of matches in `status`, newest first, with the total count.
    async fn list_matches(
        &self,
        status: MatchStatus,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<Match>, i64), AppError>;
    /// Ids of Proposed matches with confidence at or above `min_confidence`.
    async fn list_proposed_ids(&self, min_confidence: i32) -> Result<Vec<Uuid>, AppError>;
    async fn match_stats(&self) -> Result<MatchStats, AppError>;

    /// Insert a match after checking neither side is active. Writes the
    /// match id back onto the receipt.
    async fn insert_match(&self, new: NewMatch) -> Result<Match, AppError>;

    /// Move a Proposed match to `next`, optionally merging overrides, and
    /// release the receipt when rejected.
    async fn resolve_match(
        &self,
        match_id: Uuid,
        next: MatchStatus,
        overrides: Option<VendorOverrides>,
        expected_version: Option<i32>,
    ) -> Result<Match, AppError>;

    async fn update_match_overrides(
        &self,
        match_id: Uuid,
        expected_version: i32,
        overrides: VendorOverrides,
    ) -> Result<Match, AppError>;

    /// Remove a Confirmed match and release the receipt. Returns the removed record.
    async fn delete_match(&self, match_id: Uuid) -> Result<Match, AppError>;

    // ------------------------------------------------------------------
    // Vendor aliases
    // ------------------------------------------------------------------

    async fn list_vendor_aliases(&self) -> Result<Vec<VendorAlias>, AppError>;
    /// Create the alias or bump its usage count. `true` when created.
    async fn upsert_vendor_alias(
        &self,
        alias: NewVendorAlias,
    ) -> Result<(VendorAlias, bool), AppError>;

    // ------------------------------------------------------------------
    // Transaction groups
    // ------------------------------------------------------------------

    async fn create_group(
        &self,
        transaction_ids: &[Uuid],
        name: Option<String>,
        display_date_override: Option<NaiveDate>,
    ) -> Result<TransactionGroup, AppError>;
    async fn add_group_member(
        &self,
        group_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<TransactionGroup, AppError>;
    async fn remove_group_member(
        &self,
        group_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<TransactionGroup, AppError>;
    async fn set_group_warning(
        &self,
        group_id: Uuid,
        warning: Option<String>,
    ) -> Result<(), AppError>;
    /// Ungroup: release any active match, detach members, drop the group.
    async fn delete_group(&self, group_id: Uuid) -> Result<GroupRelease, AppError>;
}

pub(crate) fn match_not_found(match_id: Uuid) -> AppError {
    AppError::NotFound(anyhow::anyhow!("Match {} not found", match_id))
}

pub(crate) fn group_not_found(group_id: Uuid) -> AppError {
    AppError::NotFound(anyhow::anyhow!("Transaction group {} not found", group_id))
}

pub(crate) fn transaction_not_found(transaction_id: Uuid) -> AppError {
    AppError::NotFound(anyhow::anyhow!("Transaction {} not found", transaction_id))
}

pub(crate) fn receipt_not_found(receipt_id: Uuid) -> AppError {
    AppError::NotFound(anyhow::anyhow!("Receipt {} not found", receipt_id))
}
