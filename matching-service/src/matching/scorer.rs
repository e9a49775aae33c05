//! Candidate scoring: amount, date and vendor components for one receipt/candidate pair.

use crate::config::ScoringPolicy;
use crate::matching::normalize::NormalizedVendor;
use crate::models::{MatchTarget, Receipt, ScoreBreakdown, Transaction, TransactionGroup, VendorAlias};
use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Vendor score when one side's tokens are contained in the other.
const VENDOR_CONTAINMENT: i32 = 20;
/// Ceiling for fuzzy token overlap credit.
const VENDOR_FUZZY_MAX: f64 = 18.0;

/// A transaction or group, viewed uniformly for scoring.
#[derive(Debug, Clone)]
pub enum Candidate {
    Transaction(Transaction),
    Group(TransactionGroup),
}

impl Candidate {
    pub fn target(&self) -> MatchTarget {
        match self {
            Self::Transaction(t) => MatchTarget::Transaction(t.id),
            Self::Group(g) => MatchTarget::Group(g.id),
        }
    }

    pub fn id(&self) -> Uuid {
        self.target().id()
    }

    /// Transaction date for a transaction (not the post date); display date for a group.
    pub fn date(&self) -> NaiveDate {
        match self {
            Self::Transaction(t) => t.transaction_date,
            Self::Group(g) => g.display_date,
        }
    }

    pub fn amount(&self) -> Decimal {
        match self {
            Self::Transaction(t) => t.amount,
            Self::Group(g) => g.combined_amount,
        }
    }

    pub fn vendor_text(&self) -> &str {
        match self {
            Self::Transaction(t) => &t.description,
            Self::Group(g) => &g.name,
        }
    }
}

/// Absolute day distance between the receipt and candidate, if the receipt has a date.
pub fn date_delta(receipt: &Receipt, candidate: &Candidate) -> Option<i64> {
    receipt
        .receipt_date
        .map(|d| (candidate.date() - d).num_days().abs())
}

/// Absolute amount distance, comparing magnitudes since card debits may be negative.
pub fn amount_delta(receipt: &Receipt, candidate: &Candidate) -> Option<Decimal> {
    receipt
        .amount
        .map(|a| (a.abs() - candidate.amount().abs()).abs())
}

/// Pure, deterministic scorer configured by a [`ScoringPolicy`].
#[derive(Debug, Clone)]
pub struct CandidateScorer {
    policy: ScoringPolicy,
}

impl CandidateScorer {
    pub fn new(policy: ScoringPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    pub fn score(
        &self,
        receipt: &Receipt,
        candidate: &Candidate,
        aliases: &[VendorAlias],
    ) -> ScoreBreakdown {
        ScoreBreakdown::new(
            self.amount_score(receipt, candidate),
            self.date_score(receipt, candidate),
            self.vendor_score(receipt, candidate, aliases),
        )
    }

    fn amount_score(&self, receipt: &Receipt, candidate: &Candidate) -> i32 {
        let (Some(receipt_amount), Some(diff)) = (receipt.amount, amount_delta(receipt, candidate))
        else {
            return 0;
        };
        self.amount_score_for(receipt_amount, diff)
    }

    /// 40 within the exact tolerance, 0 at or beyond the band, linear in between.
    pub fn amount_score_for(&self, receipt_amount: Decimal, diff: Decimal) -> i32 {
        let tolerance = self.policy.amount_exact_tolerance;
        let band = self
            .policy
            .amount_absolute_band
            .max(self.policy.amount_relative_band * receipt_amount.abs());

        if diff <= tolerance {
            return ScoreBreakdown::MAX_AMOUNT;
        }
        if diff >= band {
            return 0;
        }

        let ratio = (band - diff) / (band - tolerance);
        (Decimal::from(ScoreBreakdown::MAX_AMOUNT) * ratio)
            .round()
            .to_i32()
            .unwrap_or(0)
    }

    fn date_score(&self, receipt: &Receipt, candidate: &Candidate) -> i32 {
        let Some(days) = date_delta(receipt, candidate) else {
            return 0;
        };
        let window = self.policy.max_day_window;
        if days >= window {
            return 0;
        }
        let ratio = (window - days) as f64 / window as f64;
        (ScoreBreakdown::MAX_DATE as f64 * ratio).round() as i32
    }

    fn vendor_score(&self, receipt: &Receipt, candidate: &Candidate, aliases: &[VendorAlias]) -> i32 {
        let Some(raw_vendor) = receipt.vendor.as_deref() else {
            return 0;
        };
        let vendor = NormalizedVendor::new(raw_vendor);
        let text = NormalizedVendor::new(candidate.vendor_text());
        if vendor.is_empty() || text.is_empty() {
            return 0;
        }

        if vendor == text || vendor.compact() == text.compact() || alias_hit(&vendor, &text, aliases)
        {
            return ScoreBreakdown::MAX_VENDOR;
        }
        if vendor.is_contained_in(&text) || text.is_contained_in(&vendor) {
            return VENDOR_CONTAINMENT;
        }

        (VENDOR_FUZZY_MAX * vendor.dice(&text)).round() as i32
    }
}

/// A learned alias links this candidate text to this receipt vendor.
fn alias_hit(vendor: &NormalizedVendor, text: &NormalizedVendor, aliases: &[VendorAlias]) -> bool {
    let key = text.text();
    aliases
        .iter()
        .filter(|a| a.match_pattern == key)
        .any(|a| {
            let canonical = NormalizedVendor::new(&a.canonical_name);
            canonical == *vendor
                || canonical.compact() == vendor.compact()
                || canonical.is_contained_in(vendor)
        })
}
