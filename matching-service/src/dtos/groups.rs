use crate::dtos::matching::MatchResponse;
use crate::matching::{GroupDeletion, GroupView};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRequest {
    #[validate(length(min = 2, message = "A group needs at least two transactions"))]
    pub transaction_ids: Vec<Uuid>,
    #[validate(length(max = 200))]
    pub name: Option<String>,
    pub display_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddTransactionRequest {
    pub transaction_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupResponse {
    pub id: Uuid,
    pub name: String,
    pub combined_amount: Decimal,
    pub display_date: NaiveDate,
    pub display_date_override: Option<NaiveDate>,
    pub member_transaction_ids: Vec<Uuid>,
    pub match_warning: Option<String>,
    pub active_match: Option<MatchResponse>,
    pub created_at: DateTime<Utc>,
}

impl From<GroupView> for GroupResponse {
    fn from(view: GroupView) -> Self {
        let g = view.group;
        Self {
            id: g.id,
            name: g.name,
            combined_amount: g.combined_amount,
            display_date: g.display_date,
            display_date_override: g.display_date_override,
            member_transaction_ids: g.member_transaction_ids,
            match_warning: g.match_warning,
            active_match: view.active_match.map(Into::into),
            created_at: g.created_utc,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteGroupResponse {
    pub group_id: Uuid,
    pub released_match: Option<MatchResponse>,
    pub member_transaction_ids: Vec<Uuid>,
    pub warnings: Vec<String>,
}

impl From<GroupDeletion> for DeleteGroupResponse {
    fn from(d: GroupDeletion) -> Self {
        Self {
            group_id: d.group.id,
            released_match: d.released_match.map(Into::into),
            member_transaction_ids: d.group.member_transaction_ids,
            warnings: d.warnings,
        }
    }
}
