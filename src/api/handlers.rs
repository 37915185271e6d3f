//! Request Handlers
//!
//! Read-mostly views over the round engine plus bet intake.

use super::{errors::ApiError, middleware::RequestId};
use crate::engine::RoundEngine;
use crate::games::types::{Bet, GameKind, Participant, Prediction};
use crate::round::{RoundPhase, RoundView};
use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Shared application state
pub struct AppState {
    pub engine: Arc<RoundEngine>,
    pub version: String,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(engine: Arc<RoundEngine>) -> Self {
        Self {
            engine,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub server_time: DateTime<Utc>,
    pub games: Vec<GameStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GameStatus {
    pub kind: GameKind,
    pub active_round_id: Option<u64>,
    pub phase: Option<RoundPhase>,
}

/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let games = state
        .engine
        .settings()
        .enabled_games()
        .into_iter()
        .map(|kind| {
            let active = state.engine.active_round(kind);
            GameStatus {
                kind,
                active_round_id: active.as_ref().map(|v| v.round_id),
                phase: active.map(|v| v.phase),
            }
        })
        .collect();

    Json(HealthResponse {
        status: "Running".to_string(),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        server_time: Utc::now(),
        games,
    })
}

fn parse_kind(request_id: &RequestId, raw: &str) -> Result<GameKind, ApiError> {
    raw.parse::<GameKind>()
        .map_err(|e| ApiError::bad_request(request_id.0.clone(), e.to_string()))
}

/// GET /games/:kind/active
pub async fn active_round_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
) -> Result<Json<RoundView>, ApiError> {
    let kind = parse_kind(&request_id, &kind)?;
    state
        .engine
        .active_round(kind)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(request_id.0, format!("No active {} round", kind)))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

const MAX_HISTORY_LIMIT: usize = 100;

/// GET /games/:kind/history?limit={n}
pub async fn history_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<RoundView>>, ApiError> {
    let kind = parse_kind(&request_id, &kind)?;
    let limit = query.limit.min(MAX_HISTORY_LIMIT);
    Ok(Json(state.engine.history(kind, limit)))
}

/// GET /games/:kind/rounds/:id
pub async fn round_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path((kind, round_id)): Path<(String, u64)>,
) -> Result<Json<RoundView>, ApiError> {
    let kind = parse_kind(&request_id, &kind)?;
    state.engine.round(kind, round_id).map(Json).ok_or_else(|| {
        ApiError::not_found(request_id.0, format!("Round {}#{} not found", kind, round_id))
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PlaceBetRequest {
    pub participant: String,
    pub amount: u64,
    #[serde(default)]
    pub prediction: Option<Prediction>,
}

/// POST /games/:kind/rounds/:id/bets
pub async fn place_bet_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path((kind, round_id)): Path<(String, u64)>,
    Json(request): Json<PlaceBetRequest>,
) -> Result<Json<Bet>, ApiError> {
    let kind = parse_kind(&request_id, &kind)?;
    if request.participant.trim().is_empty() {
        return Err(ApiError::bad_request(
            request_id.0,
            "participant must not be empty".to_string(),
        ));
    }

    state
        .engine
        .place_bet(
            kind,
            round_id,
            Participant::new(request.participant),
            request.amount,
            request.prediction,
        )
        .await
        .map(Json)
        .map_err(|e| ApiError::from_engine(request_id.0, e))
}
