use crate::matching::{AutoMatchReport, Proposal, RankedCandidate};
use crate::models::{Match, MatchStats, MatchStatus, VendorOverrides};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;
pub const DEFAULT_CANDIDATE_LIMIT: usize = 10;
pub const MAX_CANDIDATE_LIMIT: usize = 50;

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AutoMatchRequest {
    #[validate(length(max = 10000, message = "At most 10000 receipt ids per sweep"))]
    pub receipt_ids: Option<Vec<Uuid>>,
}

/// Vendor metadata a user may attach when confirming or matching by hand.
#[derive(Debug, Default, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct OverrideFields {
    #[validate(length(min = 1, max = 200))]
    pub vendor_display_name: Option<String>,
    #[serde(alias = "defaultGLCode")]
    #[validate(length(min = 1, max = 50))]
    pub default_gl_code: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub default_department: Option<String>,
}

impl From<OverrideFields> for VendorOverrides {
    fn from(fields: OverrideFields) -> Self {
        Self {
            vendor_display_name: fields.vendor_display_name,
            default_gl_code: fields.default_gl_code,
            default_department: fields.default_department,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ManualMatchRequest {
    pub receipt_id: Uuid,
    pub transaction_id: Option<Uuid>,
    pub transaction_group_id: Option<Uuid>,
    #[serde(flatten)]
    #[validate(nested)]
    pub overrides: OverrideFields,
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    #[serde(flatten)]
    #[validate(nested)]
    pub overrides: OverrideFields,
    pub expected_version: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectRequest {
    pub expected_version: Option<i32>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMatchRequest {
    #[serde(flatten)]
    #[validate(nested)]
    pub overrides: OverrideFields,
    pub expected_version: i32,
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BatchApproveRequest {
    pub ids: Option<Vec<Uuid>>,
    #[validate(range(min = 0, max = 100, message = "minConfidence must be between 0 and 100"))]
    pub min_confidence: Option<i32>,
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BatchRejectRequest {
    #[validate(length(min = 1, message = "ids must contain at least one match id"))]
    pub ids: Vec<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CandidateParams {
    pub limit: Option<usize>,
}

impl CandidateParams {
    pub fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_CANDIDATE_LIMIT)
            .clamp(1, MAX_CANDIDATE_LIMIT)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalListParams {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub status: Option<String>,
}

impl ProposalListParams {
    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResponse {
    pub id: Uuid,
    pub receipt_id: Uuid,
    pub transaction_id: Option<Uuid>,
    pub transaction_group_id: Option<Uuid>,
    pub target_type: String,
    pub status: MatchStatus,
    pub confidence_score: i32,
    pub amount_score: i32,
    pub date_score: i32,
    pub vendor_score: i32,
    pub match_reason: String,
    pub is_manual: bool,
    pub vendor_display_name: Option<String>,
    pub default_gl_code: Option<String>,
    pub default_department: Option<String>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl From<Match> for MatchResponse {
    fn from(m: Match) -> Self {
        Self {
            id: m.id,
            receipt_id: m.receipt_id,
            transaction_id: m.target.transaction_id(),
            transaction_group_id: m.target.group_id(),
            target_type: m.target.kind().to_string(),
            status: m.status(),
            confidence_score: m.confidence_score(),
            amount_score: m.scores.amount_score,
            date_score: m.scores.date_score,
            vendor_score: m.scores.vendor_score,
            match_reason: m.match_reason,
            is_manual: m.is_manual,
            vendor_display_name: m.overrides.vendor_display_name,
            default_gl_code: m.overrides.default_gl_code,
            default_department: m.overrides.default_department,
            version: m.version,
            created_at: m.created_utc,
            resolved_at: m.resolved_utc,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalResponse {
    #[serde(flatten)]
    pub r#match: MatchResponse,
    pub ambiguous: bool,
}

impl From<Proposal> for ProposalResponse {
    fn from(p: Proposal) -> Self {
        Self {
            r#match: p.proposed.into(),
            ambiguous: p.ambiguous,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoMatchResponse {
    pub proposed_count: usize,
    pub transaction_match_count: usize,
    pub group_match_count: usize,
    pub processed_count: usize,
    pub ambiguous_count: usize,
    pub duration_ms: u64,
    pub cancelled: bool,
    pub proposals: Vec<ProposalResponse>,
}

impl From<AutoMatchReport> for AutoMatchResponse {
    fn from(r: AutoMatchReport) -> Self {
        Self {
            proposed_count: r.proposed_count,
            transaction_match_count: r.transaction_match_count,
            group_match_count: r.group_match_count,
            processed_count: r.processed_count,
            ambiguous_count: r.ambiguous_count,
            duration_ms: r.duration_ms,
            cancelled: r.cancelled,
            proposals: r.proposals.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorAliasSummary {
    pub canonical_name: String,
    pub match_pattern: String,
    pub usage_count: i32,
    pub created: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmResponse {
    #[serde(flatten)]
    pub r#match: MatchResponse,
    pub vendor_alias: Option<VendorAliasSummary>,
}

impl From<crate::matching::ConfirmOutcome> for ConfirmResponse {
    fn from(outcome: crate::matching::ConfirmOutcome) -> Self {
        let created = outcome.alias_created;
        Self {
            r#match: outcome.confirmed.into(),
            vendor_alias: outcome.alias.map(|a| VendorAliasSummary {
                canonical_name: a.canonical_name,
                match_pattern: a.match_pattern,
                usage_count: a.usage_count,
                created,
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmatchResponse {
    pub match_id: Uuid,
    pub receipt_id: Uuid,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateResponse {
    pub candidate_id: Uuid,
    pub target_type: String,
    pub date: NaiveDate,
    pub amount: Decimal,
    pub description: String,
    pub confidence_score: i32,
    pub amount_score: i32,
    pub date_score: i32,
    pub vendor_score: i32,
    pub date_delta_days: Option<i64>,
    pub amount_delta: Option<Decimal>,
    pub reason: String,
}

impl From<RankedCandidate> for CandidateResponse {
    fn from(c: RankedCandidate) -> Self {
        let target = c.candidate.target();
        Self {
            candidate_id: target.id(),
            target_type: target.kind().to_string(),
            date: c.candidate.date(),
            amount: c.candidate.amount(),
            description: c.candidate.vendor_text().to_string(),
            confidence_score: c.confidence(),
            amount_score: c.scores.amount_score,
            date_score: c.scores.date_score,
            vendor_score: c.scores.vendor_score,
            date_delta_days: c.date_delta_days,
            amount_delta: c.amount_delta,
            reason: c.reason(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateListResponse {
    pub receipt_id: Uuid,
    pub ambiguous: bool,
    pub candidates: Vec<CandidateResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchListResponse {
    pub items: Vec<MatchResponse>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchApproveResponse {
    pub approved: usize,
    pub skipped: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRejectResponse {
    pub rejected: usize,
    pub skipped: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchStatsResponse {
    pub proposed: i64,
    pub confirmed: i64,
    pub rejected: i64,
    pub unmatched_receipts: i64,
    pub unmatched_transactions: i64,
    pub average_confidence: Option<f64>,
}

impl From<MatchStats> for MatchStatsResponse {
    fn from(s: MatchStats) -> Self {
        Self {
            proposed: s.proposed,
            confirmed: s.confirmed,
            rejected: s.rejected,
            unmatched_receipts: s.unmatched_receipts,
            unmatched_transactions: s.unmatched_transactions,
            average_confidence: s.average_confidence,
        }
    }
}

pub fn total_pages(total: i64, page_size: u32) -> u32 {
    if total <= 0 {
        return 0;
    }
    ((total as u64).div_ceil(page_size as u64)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paging_defaults_and_clamps() {
        let params = ProposalListParams::default();
        assert_eq!(params.page(), 1);
        assert_eq!(params.page_size(), 20);

        let params = ProposalListParams {
            page: Some(0),
            page_size: Some(1000),
            status: None,
        };
        assert_eq!(params.page(), 1);
        assert_eq!(params.page_size(), 100);

        assert_eq!(CandidateParams { limit: Some(500) }.limit(), 50);
        assert_eq!(CandidateParams { limit: Some(0) }.limit(), 1);
        assert_eq!(CandidateParams::default().limit(), 10);
    }

    #[test]
    fn test_total_pages() {
        assert_eq!(total_pages(0, 20), 0);
        assert_eq!(total_pages(20, 20), 1);
        assert_eq!(total_pages(21, 20), 2);
    }

    #[test]
    fn test_manual_request_accepts_both_gl_spellings() {
        let a: ManualMatchRequest = serde_json::from_str(
            r#"{"receiptId":"00000000-0000-0000-0000-000000000001","defaultGLCode":"6100"}"#,
        )
        .unwrap();
        let b: ManualMatchRequest = serde_json::from_str(
            r#"{"receiptId":"00000000-0000-0000-0000-000000000001","defaultGlCode":"6100"}"#,
        )
        .unwrap();
        assert_eq!(a.overrides.default_gl_code.as_deref(), Some("6100"));
        assert_eq!(b.overrides.default_gl_code.as_deref(), Some("6100"));
    }

    #[test]
    fn test_override_lengths_are_validated() {
        let fields = OverrideFields {
            vendor_display_name: Some(String::new()),
            ..Default::default()
        };
        assert!(fields.validate().is_err());
    }
}
