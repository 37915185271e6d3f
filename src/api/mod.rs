//! HTTP and WebSocket read API over the round engine
//!
//! - `GET  /health`
//! - `GET  /games/:kind/active`
//! - `GET  /games/:kind/history?limit=`
//! - `GET  /games/:kind/rounds/:id`
//! - `POST /games/:kind/rounds/:id/bets`
//! - `GET  /ws` (event stream)

pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod websocket;

pub use handlers::AppState;
pub use server::ApiServer;
