//! Request Handlers

use super::{
    errors::ApiError,
    middleware::RequestId,
    models::*,
};
use crate::coordinator::{CategoryStats, GameRequest, GameTicket, SettlementCoordinator};
use crate::metrics::WagerMetrics;
use crate::treasury::TreasuryLedger;
use crate::types::{parse_hash32, Address, Fulfillment, RequestState, TxRef};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap},
    response::IntoResponse,
    Extension, Json,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
pub struct AppState {
    pub coordinator: Arc<SettlementCoordinator>,
    pub ledger: Arc<TreasuryLedger>,
    pub metrics: Arc<WagerMetrics>,
    /// Key for `x-fulfillment-signature`; callbacks are refused when `None`.
    pub callback_secret: Option<Vec<u8>>,
    pub version: String,
}

/// Header carrying the hex HMAC-SHA256 of the raw callback body.
pub const FULFILLMENT_SIGNATURE_HEADER: &str = "x-fulfillment-signature";

/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "Running".to_string(),
        version: state.version.clone(),
    })
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

fn non_empty(request_id: &RequestId, field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::bad_request(request_id.0.clone(), format!("{} is required", field)));
    }
    Ok(())
}

/// POST /api/games
pub async fn start_game_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartGameBody>,
) -> Result<Json<GameTicket>, ApiError> {
    non_empty(&request_id, "account", &body.account)?;
    non_empty(&request_id, "gameCategory", &body.game_category)?;
    non_empty(&request_id, "gameVariant", &body.game_variant)?;

    let ticket = state
        .coordinator
        .start_game(GameRequest {
            account: Address::new(&body.account),
            category: body.game_category,
            variant: body.game_variant,
            stake: body.stake,
        })
        .await
        .map_err(|e| ApiError::from_wager(request_id.0.clone(), e))?;
    Ok(Json(ticket))
}

/// GET /api/requests/:id
pub async fn request_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RequestResponse>, ApiError> {
    let id: crate::types::RequestId = id
        .parse()
        .map_err(|e| ApiError::bad_request(request_id.0.clone(), format!("invalid request id: {}", e)))?;
    let request = state
        .coordinator
        .request(&id)
        .map_err(|e| ApiError::from_wager(request_id.0.clone(), e))?;
    let result = if request.state == RequestState::Fulfilled {
        Some(
            state
                .coordinator
                .result_for(&request)
                .map_err(|e| ApiError::from_wager(request_id.0.clone(), e))?,
        )
    } else {
        None
    };
    Ok(Json(RequestResponse { request, result }))
}

fn verify_callback(
    request_id: &RequestId,
    secret: Option<&[u8]>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), ApiError> {
    let refuse = |reason: &str| {
        warn!(request_id = %request_id.0, reason, "Fulfillment callback refused");
        ApiError::unauthorized(request_id.0.clone(), "fulfillment callback is not signed by the provider".to_string())
    };
    let secret = secret.ok_or_else(|| refuse("no callback secret configured"))?;
    let signature = headers
        .get(FULFILLMENT_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| refuse("missing signature"))?;
    let signature = hex::decode(signature.strip_prefix("0x").unwrap_or(signature))
        .map_err(|_| refuse("signature is not hex"))?;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|_| refuse("unusable callback secret"))?;
    mac.update(body);
    mac.verify_slice(&signature).map_err(|_| refuse("signature mismatch"))
}

/// POST /api/provider/fulfill
///
/// The body must be signed with the provider callback secret.
pub async fn fulfill_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    raw: Bytes,
) -> Result<Json<FulfillResponse>, ApiError> {
    verify_callback(&request_id, state.callback_secret.as_deref(), &headers, &raw)?;
    let body: FulfillBody = serde_json::from_slice(&raw)
        .map_err(|e| ApiError::bad_request(request_id.0.clone(), format!("invalid fulfillment body: {}", e)))?;
    let revealed_seed = parse_hash32(&body.revealed_seed)
        .map_err(|e| ApiError::bad_request(request_id.0.clone(), format!("revealedSeed: {}", e)))?;
    let provider_random = parse_hash32(&body.provider_random)
        .map_err(|e| ApiError::bad_request(request_id.0.clone(), format!("providerRandom: {}", e)))?;
    let fulfillment = Fulfillment {
        sequence_number: body.sequence_number,
        revealed_seed,
        provider_random,
        tx_ref: body.tx_ref.map(TxRef),
    };

    let settled = state
        .coordinator
        .handle_fulfillment(&fulfillment)
        .await
        .map_err(|e| ApiError::from_wager(request_id.0.clone(), e))?;
    let response = match settled {
        Some(result) => FulfillResponse {
            status: "settled".to_string(),
            result: serde_json::to_value(&result).ok(),
        },
        None => FulfillResponse {
            status: "parked".to_string(),
            result: None,
        },
    };
    Ok(Json(response))
}

/// POST /api/treasury/deposit
pub async fn deposit_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<DepositBody>,
) -> Result<Json<EntryView>, ApiError> {
    non_empty(&request_id, "account", &body.account)?;
    non_empty(&request_id, "txRef", &body.tx_ref)?;
    let account = Address::new(&body.account);
    let entry = state
        .ledger
        .record_deposit(&account, body.amount, TxRef(body.tx_ref))
        .map_err(|e| ApiError::from_wager(request_id.0.clone(), e))?;
    // The receipt may already be final; otherwise the confirmation loop settles it.
    let entry = match state.ledger.confirm(&entry.id).await {
        Ok(confirmed) => confirmed,
        Err(e) => {
            warn!(request_id = %request_id.0, entry_id = %entry.id, error = %e, "Deposit left pending");
            entry
        }
    };
    info!(request_id = %request_id.0, entry_id = %entry.id, status = entry.status.label(), "Deposit accepted");
    Ok(Json(EntryView::from(&entry)))
}

/// POST /api/treasury/withdraw
pub async fn withdraw_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<WithdrawBody>,
) -> Result<Json<EntryView>, ApiError> {
    non_empty(&request_id, "account", &body.account)?;
    let account = Address::new(&body.account);
    let entry = state
        .ledger
        .withdraw(&account, body.amount)
        .await
        .map_err(|e| ApiError::from_wager(request_id.0.clone(), e))?;
    Ok(Json(EntryView::from(&entry)))
}

/// GET /api/treasury/:account
pub async fn account_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(account): Path<String>,
) -> Result<Json<AccountResponse>, ApiError> {
    let account = Address::new(&account);
    let wrap = |e| ApiError::from_wager(request_id.0.clone(), e);
    let balance = state.ledger.reconcile(&account).map_err(wrap)?;
    let available = state.ledger.available_balance(&account).map_err(wrap)?;
    let entries = state.ledger.reconciliation_view(&account).await.map_err(wrap)?;
    Ok(Json(AccountResponse {
        account: account.to_string(),
        balance,
        available,
        entries: entries.iter().map(EntryView::from).collect(),
    }))
}

/// GET /api/treasury/health
pub async fn treasury_health_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<TreasuryHealthResponse>, ApiError> {
    let health = state
        .ledger
        .treasury_health()
        .await
        .map_err(|e| ApiError::from_wager(request_id.0.clone(), e))?;
    Ok(Json(TreasuryHealthResponse {
        treasury: health.treasury.to_string(),
        on_chain_balance: health.on_chain_balance,
        ledger_liabilities: health.ledger_liabilities,
        pending_withdrawals: health.pending_withdrawals,
        solvent: health.solvent,
        adjustments: health.adjustments.iter().map(EntryView::from).collect(),
        unresolved_withdrawals: health.unresolved_withdrawals.iter().map(EntryView::from).collect(),
    }))
}

/// GET /api/stats/categories
pub async fn category_stats_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<CategoryStats>>, ApiError> {
    state
        .coordinator
        .category_stats()
        .map(Json)
        .map_err(|e| ApiError::from_wager(request_id.0.clone(), e))
}
