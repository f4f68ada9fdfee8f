//! API route handlers.
//!
//! All endpoints return JSON. The desk is shared via `Arc<TransferDesk>`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

use crate::engine::{CommitOutcome, CreditDecision, TransferDesk, WagerSubmission};
use crate::exposure::ExposureCalculator;
use crate::storage::LedgerStore;
use crate::types::{
    BatchSummary, CapSpec, DealerCredit, ExcessItem, LedgerError, Round, RoundId, TransferRecord,
    TransferRequest, UndoSummary, WagerRecord,
};

pub type AppState = Arc<TransferDesk<dyn LedgerStore>>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Engine error rendered as an HTTP response.
pub struct ApiError(pub LedgerError);

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        Self(e)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub error: String,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            LedgerError::InvalidTransferRequest(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_transfer_request"),
            LedgerError::InvalidWager(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_wager"),
            LedgerError::RoundNotFound(_) => (StatusCode::NOT_FOUND, "round_not_found"),
            LedgerError::InsufficientUpstreamCredit { .. } => (StatusCode::CONFLICT, "insufficient_upstream_credit"),
            LedgerError::MirrorUnavailable { .. } => (StatusCode::CONFLICT, "mirror_unavailable"),
            LedgerError::UpstreamLookupTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "upstream_lookup_timeout"),
            LedgerError::Storage(_) | LedgerError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        let body = ErrorBody {
            code: code.to_string(),
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExcessResponse {
    pub round_id: RoundId,
    pub total_excess: Decimal,
    pub items: Vec<ExcessItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferBatchRequest {
    pub items: Vec<TransferRequest>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransferQuery {
    pub batch_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreditCheckQuery {
    pub amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditUpdate {
    pub balance: Decimal,
    #[serde(default)]
    pub is_blocked: bool,
    #[serde(default)]
    pub warning_threshold: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletedResponse {
    pub deleted: bool,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// GET /api/rounds/:round_id
pub async fn get_round(State(desk): State<AppState>, Path(round_id): Path<String>) -> ApiResult<Json<Round>> {
    Ok(Json(desk.round(&round_id).await?))
}

/// PUT /api/rounds/:round_id
pub async fn put_round(
    State(desk): State<AppState>,
    Path(round_id): Path<String>,
    Json(mut round): Json<Round>,
) -> ApiResult<Json<Round>> {
    round.id = round_id;
    desk.save_round(&round).await?;
    Ok(Json(round))
}

/// GET /api/rounds/:round_id/excess
pub async fn get_excess(State(desk): State<AppState>, Path(round_id): Path<String>) -> ApiResult<Json<ExcessResponse>> {
    let items = desk.excess(&round_id).await?;
    Ok(Json(ExcessResponse {
        total_excess: ExposureCalculator::total_excess(&items),
        round_id,
        items,
    }))
}

/// GET /api/rounds/:round_id/transfers?batch_id=
pub async fn get_transfers(
    State(desk): State<AppState>,
    Path(round_id): Path<String>,
    Query(query): Query<TransferQuery>,
) -> ApiResult<Json<Vec<TransferRecord>>> {
    Ok(Json(desk.transfers(&round_id, query.batch_id.as_deref()).await?))
}

/// POST /api/rounds/:round_id/transfers
pub async fn post_transfers(
    State(desk): State<AppState>,
    Path(round_id): Path<String>,
    Json(body): Json<TransferBatchRequest>,
) -> ApiResult<(StatusCode, Json<CommitOutcome>)> {
    let outcome = desk.transfer_out(&round_id, body.items).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// GET /api/rounds/:round_id/batches
pub async fn get_batches(
    State(desk): State<AppState>,
    Path(round_id): Path<String>,
) -> ApiResult<Json<Vec<BatchSummary>>> {
    Ok(Json(desk.batches(&round_id).await?))
}

/// DELETE /api/batches/:batch_id
pub async fn delete_batch(
    State(desk): State<AppState>,
    Path(batch_id): Path<String>,
) -> ApiResult<Json<UndoSummary>> {
    Ok(Json(desk.undo(&batch_id).await?))
}

/// GET /api/rounds/:round_id/wagers
pub async fn get_wagers(
    State(desk): State<AppState>,
    Path(round_id): Path<String>,
) -> ApiResult<Json<Vec<WagerRecord>>> {
    Ok(Json(desk.wagers(&round_id).await?))
}

/// POST /api/rounds/:round_id/wagers
pub async fn post_wager(
    State(desk): State<AppState>,
    Path(round_id): Path<String>,
    Json(body): Json<WagerSubmission>,
) -> ApiResult<(StatusCode, Json<WagerRecord>)> {
    let wager = desk.submit_wager(&round_id, body).await?;
    Ok((StatusCode::CREATED, Json(wager)))
}

/// DELETE /api/wagers/:wager_id
pub async fn delete_wager(
    State(desk): State<AppState>,
    Path(wager_id): Path<String>,
) -> ApiResult<Json<DeletedResponse>> {
    let deleted = desk.delete_wager(&wager_id).await?;
    Ok(Json(DeletedResponse { deleted }))
}

/// GET /api/rounds/:round_id/caps
pub async fn get_caps(State(desk): State<AppState>, Path(round_id): Path<String>) -> ApiResult<Json<CapSpec>> {
    Ok(Json(desk.caps(&round_id).await?))
}

/// PUT /api/rounds/:round_id/caps
pub async fn put_caps(
    State(desk): State<AppState>,
    Path(round_id): Path<String>,
    Json(caps): Json<CapSpec>,
) -> ApiResult<Json<CapSpec>> {
    desk.save_caps(&round_id, &caps).await?;
    Ok(Json(caps))
}

/// GET /api/dealers/:dealer_id/credit
pub async fn get_credit(State(desk): State<AppState>, Path(dealer_id): Path<String>) -> Response {
    match desk.credit(&dealer_id).await {
        Ok(Some(credit)) => Json(credit).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

/// PUT /api/dealers/:dealer_id/credit
pub async fn put_credit(
    State(desk): State<AppState>,
    Path(dealer_id): Path<String>,
    Json(update): Json<CreditUpdate>,
) -> ApiResult<Json<Option<DealerCredit>>> {
    let credit = DealerCredit {
        dealer_id,
        balance: update.balance,
        pending_deduction: Decimal::ZERO,
        is_blocked: update.is_blocked,
        warning_threshold: update.warning_threshold,
    };
    Ok(Json(desk.save_credit(&credit).await?))
}

/// POST /api/dealers/:dealer_id/credit/recompute
pub async fn post_recompute(
    State(desk): State<AppState>,
    Path(dealer_id): Path<String>,
) -> ApiResult<Json<Option<DealerCredit>>> {
    Ok(Json(desk.recompute(&dealer_id).await?))
}

/// GET /api/dealers/:dealer_id/credit/check?amount=
pub async fn get_credit_check(
    State(desk): State<AppState>,
    Path(dealer_id): Path<String>,
    Query(query): Query<CreditCheckQuery>,
) -> ApiResult<Json<CreditDecision>> {
    Ok(Json(desk.check_credit(&dealer_id, query.amount).await?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
