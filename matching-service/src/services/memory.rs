//! In-memory `MatchStore` behind a single writer lock.

use crate::models::{
    derive_group_name, Match, MatchStats, MatchStatus, MatchTarget, NewMatch, NewVendorAlias,
    Receipt, Transaction, TransactionGroup, VendorAlias, VendorOverrides,
};
use crate::services::store::{
    group_not_found, match_not_found, receipt_not_found, transaction_not_found, GroupRelease,
    MatchStore,
};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct State {
    receipts: HashMap<Uuid, Receipt>,
    transactions: HashMap<Uuid, Transaction>,
    groups: HashMap<Uuid, TransactionGroup>,
    matches: HashMap<Uuid, Match>,
    aliases: HashMap<String, VendorAlias>,
}

impl State {
    fn active_for_receipt(&self, receipt_id: Uuid) -> Option<&Match> {
        self.matches
            .values()
            .find(|m| m.receipt_id == receipt_id && m.is_active())
    }

    fn active_for_target(&self, target: MatchTarget) -> Option<&Match> {
        self.matches
            .values()
            .find(|m| m.target == target && m.is_active())
    }

    fn members(&self, group_id: Uuid) -> Vec<Transaction> {
        let mut members: Vec<Transaction> = self
            .transactions
            .values()
            .filter(|t| t.group_id == Some(group_id))
            .cloned()
            .collect();
        members.sort_by_key(|t| t.id);
        members
    }

    fn release_receipt(&mut self, receipt_id: Uuid, match_id: Uuid) {
        if let Some(r) = self.receipts.get_mut(&receipt_id) {
            if r.match_id == Some(match_id) {
                r.match_id = None;
            }
        }
    }

    /// Conflict unless the transaction is free to join a group.
    fn ensure_groupable(&self, transaction_id: Uuid) -> Result<(), AppError> {
        let tx = self
            .transactions
            .get(&transaction_id)
            .ok_or_else(|| transaction_not_found(transaction_id))?;
        if let Some(group_id) = tx.group_id {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Transaction {} already belongs to group {}",
                transaction_id,
                group_id
            )));
        }
        if let Some(m) = self.active_for_target(MatchTarget::Transaction(transaction_id)) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Transaction {} has active match {}",
                transaction_id,
                m.id
            )));
        }
        Ok(())
    }
}

/// Store used by tests and the `memory` backend.
pub struct InMemoryMatchStore {
    state: Mutex<State>,
}

impl Default for InMemoryMatchStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMatchStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, AppError> {
        self.state
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("In-memory store mutex poisoned: {}", e)))
    }
}

#[async_trait]
impl MatchStore for InMemoryMatchStore {
    async fn health_check(&self) -> Result<(), AppError> {
        self.state().map(|_| ())
    }

    async fn insert_receipt(&self, receipt: Receipt) -> Result<Receipt, AppError> {
        let mut state = self.state()?;
        if state.receipts.contains_key(&receipt.id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Receipt {} already exists",
                receipt.id
            )));
        }
        state.receipts.insert(receipt.id, receipt.clone());
        Ok(receipt)
    }

    async fn insert_transaction(&self, transaction: Transaction) -> Result<Transaction, AppError> {
        let mut state = self.state()?;
        if state.transactions.contains_key(&transaction.id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Transaction {} already exists",
                transaction.id
            )));
        }
        state.transactions.insert(transaction.id, transaction.clone());
        Ok(transaction)
    }

    async fn get_receipt(&self, receipt_id: Uuid) -> Result<Option<Receipt>, AppError> {
        Ok(self.state()?.receipts.get(&receipt_id).cloned())
    }

    async fn get_receipts(&self, receipt_ids: &[Uuid]) -> Result<Vec<Receipt>, AppError> {
        let state = self.state()?;
        Ok(receipt_ids
            .iter()
            .filter_map(|id| state.receipts.get(id).cloned())
            .collect())
    }

    async fn list_unmatched_receipts(&self) -> Result<Vec<Receipt>, AppError> {
        let state = self.state()?;
        let mut receipts: Vec<Receipt> = state
            .receipts
            .values()
            .filter(|r| state.active_for_receipt(r.id).is_none())
            .cloned()
            .collect();
        receipts.sort_by_key(|r| (r.created_utc, r.id));
        Ok(receipts)
    }

    async fn get_transaction(&self, transaction_id: Uuid) -> Result<Option<Transaction>, AppError> {
        Ok(self.state()?.transactions.get(&transaction_id).cloned())
    }

    async fn list_candidate_transactions(&self) -> Result<Vec<Transaction>, AppError> {
        let state = self.state()?;
        let mut txs: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|t| t.group_id.is_none())
            .filter(|t| state.active_for_target(MatchTarget::Transaction(t.id)).is_none())
            .cloned()
            .collect();
        txs.sort_by_key(|t| t.id);
        Ok(txs)
    }

    async fn get_group(&self, group_id: Uuid) -> Result<Option<TransactionGroup>, AppError> {
        Ok(self.state()?.groups.get(&group_id).cloned())
    }

    async fn list_candidate_groups(&self) -> Result<Vec<TransactionGroup>, AppError> {
        let state = self.state()?;
        let mut groups: Vec<TransactionGroup> = state
            .groups
            .values()
            .filter(|g| state.active_for_target(MatchTarget::Group(g.id)).is_none())
            .cloned()
            .collect();
        groups.sort_by_key(|g| g.id);
        Ok(groups)
    }

    async fn get_match(&self, match_id: Uuid) -> Result<Option<Match>, AppError> {
        Ok(self.state()?.matches.get(&match_id).cloned())
    }

    async fn find_active_match_for_target(
        &self,
        target: MatchTarget,
    ) -> Result<Option<Match>, AppError> {
        Ok(self.state()?.active_for_target(target).cloned())
    }

    async fn list_matches(
        &self,
        status: MatchStatus,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<Match>, i64), AppError> {
        let state = self.state()?;
        let mut matches: Vec<Match> = state
            .matches
            .values()
            .filter(|m| m.status() == status)
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_utc.cmp(&a.created_utc).then(a.id.cmp(&b.id)));

        let total = matches.len() as i64;
        let offset = (page.saturating_sub(1) as usize).saturating_mul(page_size as usize);
        let items = matches
            .into_iter()
            .skip(offset)
            .take(page_size as usize)
            .collect();
        Ok((items, total))
    }

    async fn list_proposed_ids(&self, min_confidence: i32) -> Result<Vec<Uuid>, AppError> {
        let state = self.state()?;
        let mut proposed: Vec<&Match> = state
            .matches
            .values()
            .filter(|m| m.status() == MatchStatus::Proposed && m.confidence_score() >= min_confidence)
            .collect();
        proposed.sort_by(|a, b| {
            b.confidence_score()
                .cmp(&a.confidence_score())
                .then(a.id.cmp(&b.id))
        });
        Ok(proposed.into_iter().map(|m| m.id).collect())
    }

    async fn match_stats(&self) -> Result<MatchStats, AppError> {
        let state = self.state()?;
        let mut stats = MatchStats::default();
        let mut active_total = 0i64;
        let mut active_count = 0i64;
        for m in state.matches.values() {
            match m.status() {
                MatchStatus::Proposed => stats.proposed += 1,
                MatchStatus::Confirmed => stats.confirmed += 1,
                MatchStatus::Rejected => stats.rejected += 1,
            }
            if m.is_active() {
                active_total += m.confidence_score() as i64;
                active_count += 1;
            }
        }
        stats.average_confidence =
            (active_count > 0).then(|| active_total as f64 / active_count as f64);
        stats.unmatched_receipts = state
            .receipts
            .values()
            .filter(|r| state.active_for_receipt(r.id).is_none())
            .count() as i64;
        stats.unmatched_transactions = state
            .transactions
            .values()
            .filter(|t| t.group_id.is_none())
            .filter(|t| state.active_for_target(MatchTarget::Transaction(t.id)).is_none())
            .count() as i64;
        Ok(stats)
    }

    async fn insert_match(&self, new: NewMatch) -> Result<Match, AppError> {
        let mut state = self.state()?;

        if !state.receipts.contains_key(&new.receipt_id) {
            return Err(receipt_not_found(new.receipt_id));
        }
        match new.target {
            MatchTarget::Transaction(id) => {
                let tx = state
                    .transactions
                    .get(&id)
                    .ok_or_else(|| transaction_not_found(id))?;
                if let Some(group_id) = tx.group_id {
                    return Err(AppError::Conflict(anyhow::anyhow!(
                        "Transaction {} belongs to group {}; match the group instead",
                        id,
                        group_id
                    )));
                }
            }
            MatchTarget::Group(id) => {
                if !state.groups.contains_key(&id) {
                    return Err(group_not_found(id));
                }
            }
        }
        if let Some(existing) = state.active_for_receipt(new.receipt_id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Receipt {} already has active match {}",
                new.receipt_id,
                existing.id
            )));
        }
        if let Some(existing) = state.active_for_target(new.target) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "{} already has active match {}",
                new.target,
                existing.id
            )));
        }

        let m = Match::create(new, Utc::now());
        if let Some(r) = state.receipts.get_mut(&m.receipt_id) {
            r.match_id = Some(m.id);
        }
        state.matches.insert(m.id, m.clone());
        Ok(m)
    }

    async fn resolve_match(
        &self,
        match_id: Uuid,
        next: MatchStatus,
        overrides: Option<VendorOverrides>,
        expected_version: Option<i32>,
    ) -> Result<Match, AppError> {
        let mut state = self.state()?;
        let mut m = state
            .matches
            .get(&match_id)
            .cloned()
            .ok_or_else(|| match_not_found(match_id))?;

        m.check_version(expected_version)?;
        m.transition(next, Utc::now())?;
        if let Some(o) = overrides {
            m.overrides = m.overrides.merged_with(&o);
        }

        if next == MatchStatus::Rejected {
            state.release_receipt(m.receipt_id, m.id);
        }
        state.matches.insert(m.id, m.clone());
        Ok(m)
    }

    async fn update_match_overrides(
        &self,
        match_id: Uuid,
        expected_version: i32,
        overrides: VendorOverrides,
    ) -> Result<Match, AppError> {
        let mut state = self.state()?;
        let m = state
            .matches
            .get_mut(&match_id)
            .ok_or_else(|| match_not_found(match_id))?;
        if !m.is_active() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Match {} is {} and can no longer be edited",
                match_id,
                m.status()
            )));
        }
        m.check_version(Some(expected_version))?;
        m.apply_overrides(&overrides);
        Ok(m.clone())
    }

    async fn delete_match(&self, match_id: Uuid) -> Result<Match, AppError> {
        let mut state = self.state()?;
        let m = state
            .matches
            .get(&match_id)
            .cloned()
            .ok_or_else(|| match_not_found(match_id))?;
        if m.status() != MatchStatus::Confirmed {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Only confirmed matches can be unmatched; match {} is {}",
                match_id,
                m.status()
            )));
        }
        state.matches.remove(&match_id);
        state.release_receipt(m.receipt_id, m.id);
        Ok(m)
    }

    async fn list_vendor_aliases(&self) -> Result<Vec<VendorAlias>, AppError> {
        let state = self.state()?;
        let mut aliases: Vec<VendorAlias> = state.aliases.values().cloned().collect();
        aliases.sort_by(|a, b| a.match_pattern.cmp(&b.match_pattern));
        Ok(aliases)
    }

    async fn upsert_vendor_alias(
        &self,
        alias: NewVendorAlias,
    ) -> Result<(VendorAlias, bool), AppError> {
        let mut state = self.state()?;
        let now = Utc::now();
        if let Some(existing) = state.aliases.get_mut(&alias.match_pattern) {
            existing.usage_count += 1;
            existing.canonical_name = alias.canonical_name;
            if alias.default_gl_code.is_some() {
                existing.default_gl_code = alias.default_gl_code;
            }
            if alias.default_department.is_some() {
                existing.default_department = alias.default_department;
            }
            existing.updated_utc = now;
            return Ok((existing.clone(), false));
        }

        let created = VendorAlias {
            id: Uuid::new_v4(),
            canonical_name: alias.canonical_name,
            match_pattern: alias.match_pattern.clone(),
            default_gl_code: alias.default_gl_code,
            default_department: alias.default_department,
            usage_count: 1,
            created_utc: now,
            updated_utc: now,
        };
        state.aliases.insert(alias.match_pattern, created.clone());
        Ok((created, true))
    }

    async fn create_group(
        &self,
        transaction_ids: &[Uuid],
        name: Option<String>,
        display_date_override: Option<NaiveDate>,
    ) -> Result<TransactionGroup, AppError> {
        let mut state = self.state()?;
        for id in transaction_ids {
            state.ensure_groupable(*id)?;
        }

        let group_id = Uuid::new_v4();
        let mut members = Vec::with_capacity(transaction_ids.len());
        for id in transaction_ids {
            if let Some(t) = state.transactions.get_mut(id) {
                t.group_id = Some(group_id);
                members.push(t.clone());
            }
        }

        let mut group = TransactionGroup {
            id: group_id,
            name: name.unwrap_or_else(|| derive_group_name(&members)),
            combined_amount: Default::default(),
            display_date: members
                .iter()
                .map(|t| t.transaction_date)
                .max()
                .unwrap_or_else(|| Utc::now().date_naive()),
            display_date_override,
            member_transaction_ids: vec![],
            match_warning: None,
            created_utc: Utc::now(),
        };
        group.recompute(&members);
        state.groups.insert(group_id, group.clone());
        Ok(group)
    }

    async fn add_group_member(
        &self,
        group_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<TransactionGroup, AppError> {
        let mut state = self.state()?;
        if !state.groups.contains_key(&group_id) {
            return Err(group_not_found(group_id));
        }
        state.ensure_groupable(transaction_id)?;

        if let Some(t) = state.transactions.get_mut(&transaction_id) {
            t.group_id = Some(group_id);
        }
        let members = state.members(group_id);
        let group = state
            .groups
            .get_mut(&group_id)
            .ok_or_else(|| group_not_found(group_id))?;
        group.recompute(&members);
        Ok(group.clone())
    }

    async fn remove_group_member(
        &self,
        group_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<TransactionGroup, AppError> {
        let mut state = self.state()?;
        if !state.groups.contains_key(&group_id) {
            return Err(group_not_found(group_id));
        }
        let members = state.members(group_id);
        if !members.iter().any(|t| t.id == transaction_id) {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Transaction {} is not a member of group {}",
                transaction_id,
                group_id
            )));
        }
        if members.len() <= 2 {
            return Err(AppError::invalid_field(
                "transactionId",
                "min_members",
                "A group needs at least two transactions; delete the group instead",
            ));
        }

        if let Some(t) = state.transactions.get_mut(&transaction_id) {
            t.group_id = None;
        }
        let members = state.members(group_id);
        let group = state
            .groups
            .get_mut(&group_id)
            .ok_or_else(|| group_not_found(group_id))?;
        group.recompute(&members);
        Ok(group.clone())
    }

    async fn set_group_warning(
        &self,
        group_id: Uuid,
        warning: Option<String>,
    ) -> Result<(), AppError> {
        let mut state = self.state()?;
        let group = state
            .groups
            .get_mut(&group_id)
            .ok_or_else(|| group_not_found(group_id))?;
        group.match_warning = warning;
        Ok(())
    }

    async fn delete_group(&self, group_id: Uuid) -> Result<GroupRelease, AppError> {
        let mut state = self.state()?;
        let group = state
            .groups
            .remove(&group_id)
            .ok_or_else(|| group_not_found(group_id))?;

        let target = MatchTarget::Group(group_id);
        let released_match = state.active_for_target(target).cloned();
        if let Some(m) = &released_match {
            state.release_receipt(m.receipt_id, m.id);
        }
        state.matches.retain(|_, m| m.target != target);

        for t in state.transactions.values_mut() {
            if t.group_id == Some(group_id) {
                t.group_id = None;
            }
        }

        Ok(GroupRelease {
            group,
            released_match,
        })
    }
}
