//! Domain models for matching-service.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sqlx::FromRow;
use uuid::Uuid;

// ============================================================================
// Receipt / Transaction / Group
// ============================================================================

/// An uploaded receipt with fields already extracted upstream.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Receipt {
    pub id: Uuid,
    pub vendor: Option<String>,
    pub receipt_date: Option<NaiveDate>,
    pub amount: Option<Decimal>,
    pub currency: String,
    pub match_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
}

impl Receipt {
    pub fn new(
        vendor: Option<&str>,
        receipt_date: Option<NaiveDate>,
        amount: Option<Decimal>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            vendor: vendor.map(str::to_string),
            receipt_date,
            amount,
            currency: "USD".to_string(),
            match_id: None,
            created_utc: Utc::now(),
        }
    }
}

/// A single imported statement line.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Transaction {
    pub id: Uuid,
    pub transaction_date: NaiveDate,
    pub post_date: Option<NaiveDate>,
    pub amount: Decimal,
    pub description: String,
    pub group_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
}

impl Transaction {
    pub fn new(transaction_date: NaiveDate, amount: Decimal, description: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_date,
            post_date: None,
            amount,
            description: description.to_string(),
            group_id: None,
            created_utc: Utc::now(),
        }
    }
}

/// Two or more transactions matched as one unit.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct TransactionGroup {
    pub id: Uuid,
    pub name: String,
    pub combined_amount: Decimal,
    pub display_date: NaiveDate,
    pub display_date_override: Option<NaiveDate>,
    pub member_transaction_ids: Vec<Uuid>,
    pub match_warning: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl TransactionGroup {
    /// Recompute the derived amount and date from the current members.
    pub fn recompute(&mut self, members: &[Transaction]) {
        self.combined_amount = members.iter().map(|t| t.amount).sum();
        self.display_date = self.display_date_override.unwrap_or_else(|| {
            members
                .iter()
                .map(|t| t.transaction_date)
                .max()
                .unwrap_or(self.display_date)
        });
        let mut ids: Vec<Uuid> = members.iter().map(|t| t.id).collect();
        ids.sort();
        self.member_transaction_ids = ids;
    }
}

/// Default group name: the description of the earliest member.
pub fn derive_group_name(members: &[Transaction]) -> String {
    members
        .iter()
        .min_by_key(|t| (t.transaction_date, t.id))
        .map(|t| t.description.trim().to_string())
        .unwrap_or_default()
}

// ============================================================================
// Match
// ============================================================================

/// What a match points at. Exactly one side, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MatchTarget {
    Transaction(Uuid),
    Group(Uuid),
}

impl MatchTarget {
    /// Build from a pair of optional ids, rejecting both-set and neither-set.
    pub fn from_parts(
        transaction_id: Option<Uuid>,
        transaction_group_id: Option<Uuid>,
    ) -> Result<Self, AppError> {
        match (transaction_id, transaction_group_id) {
            (Some(id), None) => Ok(Self::Transaction(id)),
            (None, Some(id)) => Ok(Self::Group(id)),
            (Some(_), Some(_)) => Err(AppError::invalid_field(
                "transactionId",
                "exactly_one_target",
                "Provide either transactionId or transactionGroupId, not both",
            )),
            (None, None) => Err(AppError::invalid_field(
                "transactionId",
                "exactly_one_target",
                "One of transactionId or transactionGroupId is required",
            )),
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::Transaction(id) | Self::Group(id) => *id,
        }
    }

    pub fn transaction_id(&self) -> Option<Uuid> {
        match self {
            Self::Transaction(id) => Some(*id),
            Self::Group(_) => None,
        }
    }

    pub fn group_id(&self) -> Option<Uuid> {
        match self {
            Self::Group(id) => Some(*id),
            Self::Transaction(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transaction(_) => "transaction",
            Self::Group(_) => "group",
        }
    }
}

impl std::fmt::Display for MatchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// Match lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Proposed,
    Confirmed,
    Rejected,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "proposed" => Some(Self::Proposed),
            "confirmed" => Some(Self::Confirmed),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    /// Proposed and Confirmed block further matches on both sides.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Proposed | Self::Confirmed)
    }

    pub fn can_transition_to(&self, next: MatchStatus) -> bool {
        matches!(
            (self, next),
            (Self::Proposed, Self::Confirmed) | (Self::Proposed, Self::Rejected)
        )
    }
}

impl std::fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-component confidence. The total is always the sum of the parts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub amount_score: i32,
    pub date_score: i32,
    pub vendor_score: i32,
}

impl ScoreBreakdown {
    pub const MAX_AMOUNT: i32 = 40;
    pub const MAX_DATE: i32 = 35;
    pub const MAX_VENDOR: i32 = 25;

    /// Clamp every component into its range.
    pub fn new(amount_score: i32, date_score: i32, vendor_score: i32) -> Self {
        Self {
            amount_score: amount_score.clamp(0, Self::MAX_AMOUNT),
            date_score: date_score.clamp(0, Self::MAX_DATE),
            vendor_score: vendor_score.clamp(0, Self::MAX_VENDOR),
        }
    }

    pub fn total(&self) -> i32 {
        self.amount_score + self.date_score + self.vendor_score
    }
}

/// User-supplied vendor metadata carried on a match and fed into alias learning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VendorOverrides {
    pub vendor_display_name: Option<String>,
    pub default_gl_code: Option<String>,
    pub default_department: Option<String>,
}

impl VendorOverrides {
    pub fn is_empty(&self) -> bool {
        self.vendor_display_name.is_none()
            && self.default_gl_code.is_none()
            && self.default_department.is_none()
    }

    /// Fields set on `other` win; unset fields keep their current value.
    pub fn merged_with(&self, other: &VendorOverrides) -> VendorOverrides {
        VendorOverrides {
            vendor_display_name: other
                .vendor_display_name
                .clone()
                .or_else(|| self.vendor_display_name.clone()),
            default_gl_code: other
                .default_gl_code
                .clone()
                .or_else(|| self.default_gl_code.clone()),
            default_department: other
                .default_department
                .clone()
                .or_else(|| self.default_department.clone()),
        }
    }
}

/// Input for creating a match record.
#[derive(Debug, Clone)]
pub struct NewMatch {
    pub receipt_id: Uuid,
    pub target: MatchTarget,
    pub scores: ScoreBreakdown,
    pub match_reason: String,
    pub is_manual: bool,
    pub overrides: VendorOverrides,
}

impl NewMatch {
    /// Auto-match proposals start Proposed; manual matches are Confirmed at once.
    pub fn initial_status(&self) -> MatchStatus {
        if self.is_manual {
            MatchStatus::Confirmed
        } else {
            MatchStatus::Proposed
        }
    }
}

/// A receipt linked to a transaction or group.
///
/// `status` is private: it only moves through [`Match::transition`].
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub id: Uuid,
    pub receipt_id: Uuid,
    pub target: MatchTarget,
    status: MatchStatus,
    pub scores: ScoreBreakdown,
    pub match_reason: String,
    pub is_manual: bool,
    pub overrides: VendorOverrides,
    pub version: i32,
    pub created_utc: DateTime<Utc>,
    pub resolved_utc: Option<DateTime<Utc>>,
}

impl Match {
    pub fn create(new: NewMatch, now: DateTime<Utc>) -> Self {
        let status = new.initial_status();
        Self {
            id: Uuid::new_v4(),
            receipt_id: new.receipt_id,
            target: new.target,
            status,
            scores: new.scores,
            match_reason: new.match_reason,
            is_manual: new.is_manual,
            overrides: new.overrides,
            version: 1,
            created_utc: now,
            resolved_utc: (status == MatchStatus::Confirmed).then_some(now),
        }
    }

    pub fn status(&self) -> MatchStatus {
        self.status
    }

    pub fn confidence_score(&self) -> i32 {
        self.scores.total()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Move to `next`, bumping the version. Terminal states refuse every move.
    pub fn transition(&mut self, next: MatchStatus, now: DateTime<Utc>) -> Result<(), AppError> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Match {} is {} and cannot become {}",
                self.id,
                self.status,
                next
            )));
        }
        self.status = next;
        self.resolved_utc = Some(now);
        self.version += 1;
        Ok(())
    }

    /// Fail with `Conflict` when the caller's version token is stale.
    pub fn check_version(&self, expected: Option<i32>) -> Result<(), AppError> {
        match expected {
            Some(v) if v != self.version => Err(AppError::Conflict(anyhow::anyhow!(
                "Match {} was modified (expected version {}, found {})",
                self.id,
                v,
                self.version
            ))),
            _ => Ok(()),
        }
    }

    pub fn apply_overrides(&mut self, overrides: &VendorOverrides) {
        self.overrides = self.overrides.merged_with(overrides);
        self.version += 1;
    }
}

/// Row shape of the `matches` table.
#[derive(Debug, Clone, FromRow)]
pub struct MatchRow {
    pub id: Uuid,
    pub receipt_id: Uuid,
    pub transaction_id: Option<Uuid>,
    pub transaction_group_id: Option<Uuid>,
    pub status: MatchStatus,
    pub amount_score: i32,
    pub date_score: i32,
    pub vendor_score: i32,
    pub match_reason: String,
    pub is_manual: bool,
    pub vendor_display_name: Option<String>,
    pub default_gl_code: Option<String>,
    pub default_department: Option<String>,
    pub version: i32,
    pub created_utc: DateTime<Utc>,
    pub resolved_utc: Option<DateTime<Utc>>,
}

impl TryFrom<MatchRow> for Match {
    type Error = AppError;

    fn try_from(row: MatchRow) -> Result<Self, Self::Error> {
        let target = MatchTarget::from_parts(row.transaction_id, row.transaction_group_id)
            .map_err(|_| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "Match {} does not reference exactly one target",
                    row.id
                ))
            })?;

        Ok(Self {
            id: row.id,
            receipt_id: row.receipt_id,
            target,
            status: row.status,
            scores: ScoreBreakdown::new(row.amount_score, row.date_score, row.vendor_score),
            match_reason: row.match_reason,
            is_manual: row.is_manual,
            overrides: VendorOverrides {
                vendor_display_name: row.vendor_display_name,
                default_gl_code: row.default_gl_code,
                default_department: row.default_department,
            },
            version: row.version,
            created_utc: row.created_utc,
            resolved_utc: row.resolved_utc,
        })
    }
}

// ============================================================================
// Vendor Alias
// ============================================================================

/// Learned mapping from statement text to a canonical vendor.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct VendorAlias {
    pub id: Uuid,
    pub canonical_name: String,
    pub match_pattern: String,
    pub default_gl_code: Option<String>,
    pub default_department: Option<String>,
    pub usage_count: i32,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewVendorAlias {
    pub canonical_name: String,
    pub match_pattern: String,
    pub default_gl_code: Option<String>,
    pub default_department: Option<String>,
}

// ============================================================================
// Aggregates
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchStats {
    pub proposed: i64,
    pub confirmed: i64,
    pub rejected: i64,
    pub unmatched_receipts: i64,
    pub unmatched_transactions: i64,
    pub average_confidence: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposed() -> Match {
        Match::create(
            NewMatch {
                receipt_id: Uuid::new_v4(),
                target: MatchTarget::Transaction(Uuid::new_v4()),
                scores: ScoreBreakdown::new(40, 30, 20),
                match_reason: "test".to_string(),
                is_manual: false,
                overrides: VendorOverrides::default(),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_target_requires_exactly_one_side() {
        let id = Uuid::new_v4();
        assert_eq!(
            MatchTarget::from_parts(Some(id), None).unwrap(),
            MatchTarget::Transaction(id)
        );
        assert_eq!(
            MatchTarget::from_parts(None, Some(id)).unwrap(),
            MatchTarget::Group(id)
        );
        assert!(matches!(
            MatchTarget::from_parts(Some(id), Some(id)),
            Err(AppError::ValidationError(_))
        ));
        assert!(matches!(
            MatchTarget::from_parts(None, None),
            Err(AppError::ValidationError(_))
        ));
    }

    #[test]
    fn test_status_transitions() {
        use MatchStatus::*;
        assert!(Proposed.can_transition_to(Confirmed));
        assert!(Proposed.can_transition_to(Rejected));
        assert!(!Confirmed.can_transition_to(Rejected));
        assert!(!Rejected.can_transition_to(Confirmed));
        assert!(!Proposed.can_transition_to(Proposed));
        assert!(Proposed.is_active() && Confirmed.is_active() && !Rejected.is_active());
    }

    #[test]
    fn test_transition_bumps_version_and_resolves() {
        let mut m = proposed();
        assert_eq!(m.version, 1);
        assert!(m.resolved_utc.is_none());

        m.transition(MatchStatus::Confirmed, Utc::now()).unwrap();
        assert_eq!(m.status(), MatchStatus::Confirmed);
        assert_eq!(m.version, 2);
        assert!(m.resolved_utc.is_some());

        let err = m.transition(MatchStatus::Rejected, Utc::now()).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(m.status(), MatchStatus::Confirmed);
    }

    #[test]
    fn test_manual_match_starts_confirmed() {
        let m = Match::create(
            NewMatch {
                receipt_id: Uuid::new_v4(),
                target: MatchTarget::Group(Uuid::new_v4()),
                scores: ScoreBreakdown::default(),
                match_reason: "manual".to_string(),
                is_manual: true,
                overrides: VendorOverrides::default(),
            },
            Utc::now(),
        );
        assert_eq!(m.status(), MatchStatus::Confirmed);
        assert!(m.resolved_utc.is_some());
    }

    #[test]
    fn test_check_version() {
        let m = proposed();
        assert!(m.check_version(None).is_ok());
        assert!(m.check_version(Some(1)).is_ok());
        assert!(matches!(m.check_version(Some(7)), Err(AppError::Conflict(_))));
    }

    #[test]
    fn test_score_breakdown_clamps() {
        let s = ScoreBreakdown::new(55, -3, 30);
        assert_eq!(s.amount_score, 40);
        assert_eq!(s.date_score, 0);
        assert_eq!(s.vendor_score, 25);
        assert_eq!(s.total(), 65);
    }

    #[test]
    fn test_overrides_merge_keeps_unset_fields() {
        let current = VendorOverrides {
            vendor_display_name: Some("Starbucks".to_string()),
            default_gl_code: Some("6100".to_string()),
            default_department: None,
        };
        let patch = VendorOverrides {
            default_department: Some("Sales".to_string()),
            ..Default::default()
        };
        let merged = current.merged_with(&patch);
        assert_eq!(merged.vendor_display_name.as_deref(), Some("Starbucks"));
        assert_eq!(merged.default_gl_code.as_deref(), Some("6100"));
        assert_eq!(merged.default_department.as_deref(), Some("Sales"));
    }

    #[test]
    fn test_group_recompute() {
        let d1 = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let a = Transaction::new(d1, Decimal::new(1000, 2), "HOTEL ROOM");
        let b = Transaction::new(d2, Decimal::new(2550, 2), "HOTEL TAX");
        let mut group = TransactionGroup {
            id: Uuid::new_v4(),
            name: derive_group_name(&[a.clone(), b.clone()]),
            combined_amount: Decimal::ZERO,
            display_date: d1,
            display_date_override: None,
            member_transaction_ids: vec![],
            match_warning: None,
            created_utc: Utc::now(),
        };
        group.recompute(&[a.clone(), b.clone()]);
        assert_eq!(group.name, "HOTEL ROOM");
        assert_eq!(group.combined_amount, Decimal::new(3550, 2));
        assert_eq!(group.display_date, d2);
        assert_eq!(group.member_transaction_ids.len(), 2);

        group.display_date_override = Some(d1);
        group.recompute(&[a, b]);
        assert_eq!(group.display_date, d1);
    }
}
