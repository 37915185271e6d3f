//! API Server

use super::{
    handlers::AppState,
    middleware::{create_cors_layer, request_id_middleware},
    routes::create_router,
};
use crate::config::ApiConfig;
use crate::engine::RoundEngine;
use std::future::Future;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

pub struct ApiServer {
    config: ApiConfig,
    engine: Arc<RoundEngine>,
}

impl ApiServer {
    pub fn new(config: ApiConfig, engine: Arc<RoundEngine>) -> Self {
        Self { config, engine }
    }

    /// Serves until `shutdown` resolves
    pub async fn run(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let app = self.create_app();
        let addr = self.socket_addr()?;

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("API listening on http://{}", listener.local_addr()?);
        self.log_server_info();

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("API server stopped");
        Ok(())
    }

    /// Router with the full middleware stack
    pub fn create_app(&self) -> axum::Router {
        let state = Arc::new(AppState::new(self.engine.clone()));

        create_router(state)
            // Request ID middleware (first for tracing)
            .layer(axum::middleware::from_fn(request_id_middleware))
            // CORS before timeout to handle preflight
            .layer(create_cors_layer(self.config.cors_origins.clone()))
            .layer(TimeoutLayer::new(Duration::from_secs(self.config.request_timeout_secs)))
            .layer(TraceLayer::new_for_http())
    }

    fn socket_addr(&self) -> Result<SocketAddr, Box<dyn std::error::Error + Send + Sync>> {
        Ok(SocketAddr::from((
            self.config.host.parse::<std::net::IpAddr>()?,
            self.config.port,
        )))
    }

    fn log_server_info(&self) {
        info!("   CORS: {:?}", self.config.cors_origins);
        info!("   Request timeout: {}s", self.config.request_timeout_secs);
        info!("   Games: {:?}", self.engine.settings().enabled_games());
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received terminate signal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::EngineSettings;
    use crate::games::types::GameKind;
    use crate::games::vrf_engine::HashChainSeedSource;
    use crate::ledger::{InMemoryLedger, LedgerAdapter, RetryPolicy};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn app() -> (axum::Router, Arc<RoundEngine>) {
        let adapter = LedgerAdapter::new(
            Arc::new(InMemoryLedger::default()),
            "api-test",
            RetryPolicy::default(),
        );
        let engine = Arc::new(RoundEngine::new(
            Arc::new(adapter),
            Arc::new(HashChainSeedSource::from_passphrase("api")),
            Arc::new(ManualClock::new(0)),
            EngineSettings::default(),
        ));
        let server = ApiServer::new(ApiConfig::default(), engine.clone());
        (server.create_app(), engine)
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_games() {
        let (app, engine) = app();
        engine.open_next_round(GameKind::BinaryFlip).await.unwrap();

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));

        let body = json_body(response).await;
        assert_eq!(body["status"], "Running");
        let games = body["games"].as_array().unwrap();
        assert_eq!(games.len(), 3);
        assert!(games
            .iter()
            .any(|g| g["kind"] == "flip" && g["active_round_id"] == 1 && g["phase"] == "open"));
    }

    #[tokio::test]
    async fn test_active_round_and_bet_flow() {
        let (app, engine) = app();
        let round = engine.open_next_round(GameKind::WeightedPool).await.unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/games/jackpot/active")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["round_id"], round.round_id);
        assert_eq!(body["phase"], "open");

        let bet = serde_json::json!({ "participant": "alice", "amount": 500_000_000u64 });
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/games/pool/rounds/{}/bets", round.round_id))
                    .header("content-type", "application/json")
                    .body(Body::from(bet.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["participant"], "alice");
        assert_eq!(body["sequence"], 0);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/games/pool/rounds/{}", round.round_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["total_stake"], 500_000_000u64);
    }

    #[tokio::test]
    async fn test_error_responses() {
        let (app, engine) = app();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/games/roulette/active")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/games/crash/rounds/42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "NOT_FOUND");

        let round = engine.open_next_round(GameKind::BinaryFlip).await.unwrap();
        let zero = serde_json::json!({
            "participant": "bob",
            "amount": 0,
            "prediction": { "type": "side", "side": "heads" }
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/games/flip/rounds/{}/bets", round.round_id))
                    .header("content-type", "application/json")
                    .body(Body::from(zero.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_history_lists_finished_rounds() {
        let (app, engine) = app();
        let round = engine.open_next_round(GameKind::WeightedPool).await.unwrap();
        engine.request_lock(GameKind::WeightedPool, round.round_id).await.unwrap();
        engine.settle(GameKind::WeightedPool, round.round_id).await.unwrap();
        engine.retire_finished(GameKind::WeightedPool);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/games/pool/history?limit=5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = json_body(response).await;
        let rounds = body.as_array().unwrap();
        assert_eq!(rounds.len(), 1);
        assert_eq!(rounds[0]["phase"], "settled");
    }
}
