//! Route table

use super::{
    handlers::{
        active_round_handler, health_handler, history_handler, place_bet_handler, round_handler,
        AppState,
    },
    websocket::websocket_handler,
};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/games/:kind/active", get(active_round_handler))
        .route("/games/:kind/history", get(history_handler))
        .route("/games/:kind/rounds/:id", get(round_handler))
        .route("/games/:kind/rounds/:id/bets", post(place_bet_handler))
        .route("/ws", get(websocket_handler))
        .with_state(state)
}
