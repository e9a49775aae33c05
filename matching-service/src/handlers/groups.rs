//! `/transaction-groups` endpoints.

use crate::dtos::{AddTransactionRequest, CreateGroupRequest, DeleteGroupResponse, GroupResponse};
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

#[tracing::instrument(skip(state, request))]
pub async fn create_group(
    State(state): State<AppState>,
    Json(request): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse, AppError> {
    request.validate()?;
    let view = state
        .groups
        .create_group(request.transaction_ids, request.name, request.display_date)
        .await?;
    Ok((StatusCode::CREATED, Json(GroupResponse::from(view))))
}

pub async fn get_group(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
) -> Result<Json<GroupResponse>, AppError> {
    let view = state.groups.get_group(group_id).await?;
    Ok(Json(view.into()))
}

#[tracing::instrument(skip(state))]
pub async fn delete_group(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
) -> Result<Json<DeleteGroupResponse>, AppError> {
    let deletion = state.groups.delete_group(group_id).await?;
    Ok(Json(deletion.into()))
}

#[tracing::instrument(skip(state, request))]
pub async fn add_transaction(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Json(request): Json<AddTransactionRequest>,
) -> Result<Json<GroupResponse>, AppError> {
    let view = state
        .groups
        .add_transaction(group_id, request.transaction_id)
        .await?;
    Ok(Json(view.into()))
}

#[tracing::instrument(skip(state))]
pub async fn remove_transaction(
    State(state): State<AppState>,
    Path((group_id, transaction_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<GroupResponse>, AppError> {
    let view = state
        .groups
        .remove_transaction(group_id, transaction_id)
        .await?;
    Ok(Json(view.into()))
}
