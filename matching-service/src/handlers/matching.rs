//! `/matching` endpoints.

use crate::dtos::matching::total_pages;
use crate::dtos::{
    AutoMatchRequest, AutoMatchResponse, BatchApproveRequest, BatchApproveResponse,
    BatchRejectRequest, BatchRejectResponse, CandidateListResponse, CandidateParams,
    ConfirmRequest, ConfirmResponse, ManualMatchRequest, MatchListResponse, MatchResponse,
    MatchStatsResponse, ProposalListParams, RejectRequest, UnmatchResponse, UpdateMatchRequest,
};
use crate::handlers::extract::OptionalJson;
use crate::models::{MatchStatus, MatchTarget, VendorOverrides};
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

#[tracing::instrument(skip(state, request))]
pub async fn run_auto_match(
    State(state): State<AppState>,
    OptionalJson(request): OptionalJson<AutoMatchRequest>,
) -> Result<Json<AutoMatchResponse>, AppError> {
    request.validate()?;

    let report = state
        .auto_match
        .run_auto_match(request.receipt_ids, state.shutdown.child_token())
        .await?;
    Ok(Json(report.into()))
}

#[tracing::instrument(skip(state, request), fields(receipt_id = %request.receipt_id))]
pub async fn manual_match(
    State(state): State<AppState>,
    Json(request): Json<ManualMatchRequest>,
) -> Result<impl IntoResponse, AppError> {
    request.validate()?;
    let target = MatchTarget::from_parts(request.transaction_id, request.transaction_group_id)?;

    let outcome = state
        .lifecycle
        .manual_match(request.receipt_id, target, request.overrides.into())
        .await?;
    Ok((StatusCode::CREATED, Json(ConfirmResponse::from(outcome))))
}

pub async fn list_candidates(
    State(state): State<AppState>,
    Path(receipt_id): Path<Uuid>,
    Query(params): Query<CandidateParams>,
) -> Result<Json<CandidateListResponse>, AppError> {
    let receipt = state.lifecycle.load_receipt(receipt_id).await?;
    let ranking = state.auto_match.rank_receipt(&receipt).await?;

    Ok(Json(CandidateListResponse {
        receipt_id,
        ambiguous: ranking.ambiguous,
        candidates: ranking
            .candidates
            .into_iter()
            .take(params.limit())
            .map(Into::into)
            .collect(),
    }))
}

pub async fn list_proposals(
    State(state): State<AppState>,
    Query(params): Query<ProposalListParams>,
) -> Result<Json<MatchListResponse>, AppError> {
    let status = match params.status.as_deref() {
        None | Some("") => MatchStatus::Proposed,
        Some(s) => MatchStatus::parse(s).ok_or_else(|| {
            AppError::invalid_field(
                "status",
                "unknown_status",
                format!("Unknown match status '{}'", s),
            )
        })?,
    };
    let page = params.page();
    let page_size = params.page_size();

    let (items, total) = state.store.list_matches(status, page, page_size).await?;

    Ok(Json(MatchListResponse {
        items: items.into_iter().map(Into::into).collect(),
        total,
        page,
        page_size,
        total_pages: total_pages(total, page_size),
    }))
}

pub async fn get_match(
    State(state): State<AppState>,
    Path(match_id): Path<Uuid>,
) -> Result<Json<MatchResponse>, AppError> {
    let m = state.lifecycle.get(match_id).await?;
    Ok(Json(m.into()))
}

#[tracing::instrument(skip(state, request))]
pub async fn confirm_match(
    State(state): State<AppState>,
    Path(match_id): Path<Uuid>,
    OptionalJson(request): OptionalJson<ConfirmRequest>,
) -> Result<Json<ConfirmResponse>, AppError> {
    request.validate()?;

    let overrides: VendorOverrides = request.overrides.into();
    let overrides = (!overrides.is_empty()).then_some(overrides);

    let outcome = state
        .lifecycle
        .confirm(match_id, overrides, request.expected_version)
        .await?;
    Ok(Json(outcome.into()))
}

#[tracing::instrument(skip(state, request))]
pub async fn reject_match(
    State(state): State<AppState>,
    Path(match_id): Path<Uuid>,
    OptionalJson(request): OptionalJson<RejectRequest>,
) -> Result<Json<MatchResponse>, AppError> {
    let rejected = state
        .lifecycle
        .reject(match_id, request.expected_version)
        .await?;
    Ok(Json(rejected.into()))
}

#[tracing::instrument(skip(state, request))]
pub async fn update_match(
    State(state): State<AppState>,
    Path(match_id): Path<Uuid>,
    Json(request): Json<UpdateMatchRequest>,
) -> Result<Json<MatchResponse>, AppError> {
    request.validate()?;
    let overrides: VendorOverrides = request.overrides.into();
    if overrides.is_empty() {
        return Err(AppError::invalid_field(
            "vendorDisplayName",
            "required",
            "At least one of vendorDisplayName, defaultGlCode or defaultDepartment is required",
        ));
    }

    let updated = state
        .lifecycle
        .update_overrides(match_id, request.expected_version, overrides)
        .await?;
    Ok(Json(updated.into()))
}

#[tracing::instrument(skip(state))]
pub async fn unmatch(
    State(state): State<AppState>,
    Path(match_id): Path<Uuid>,
) -> Result<Json<UnmatchResponse>, AppError> {
    let outcome = state.lifecycle.unmatch(match_id).await?;
    Ok(Json(UnmatchResponse {
        match_id: outcome.removed.id,
        receipt_id: outcome.removed.receipt_id,
        warnings: outcome.warnings,
    }))
}

#[tracing::instrument(skip(state, request))]
pub async fn batch_approve(
    State(state): State<AppState>,
    Json(request): Json<BatchApproveRequest>,
) -> Result<Json<BatchApproveResponse>, AppError> {
    request.validate()?;
    let outcome = state
        .batch
        .batch_approve(request.ids, request.min_confidence)
        .await?;
    Ok(Json(BatchApproveResponse {
        approved: outcome.succeeded,
        skipped: outcome.skipped,
    }))
}

#[tracing::instrument(skip(state, request))]
pub async fn batch_reject(
    State(state): State<AppState>,
    Json(request): Json<BatchRejectRequest>,
) -> Result<Json<BatchRejectResponse>, AppError> {
    request.validate()?;
    let outcome = state.batch.batch_reject(request.ids).await?;
    Ok(Json(BatchRejectResponse {
        rejected: outcome.succeeded,
        skipped: outcome.skipped,
    }))
}

pub async fn stats(State(state): State<AppState>) -> Result<Json<MatchStatsResponse>, AppError> {
    let stats = state.store.match_stats().await?;
    Ok(Json(stats.into()))
}
