//! Route Definitions

use super::handlers::*;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Build the API router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        // Games
        .route("/api/games", post(start_game_handler))
        .route("/api/requests/:id", get(request_handler))
        .route("/api/stats/categories", get(category_stats_handler))
        // Provider callback
        .route("/api/provider/fulfill", post(fulfill_handler))
        // Treasury; static segments win over `:account`
        .route("/api/treasury/deposit", post(deposit_handler))
        .route("/api/treasury/withdraw", post(withdraw_handler))
        .route("/api/treasury/health", get(treasury_health_handler))
        .route("/api/treasury/:account", get(account_handler))
        .with_state(state)
}
