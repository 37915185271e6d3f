//! WebSocket stream of round lifecycle events
//!
//! Clients connect to `/ws`, optionally narrowing the stream with
//! `?game=crash` and `?events=bet_accepted,round_settled`. Every frame is a
//! JSON [`RoundEvent`] or one of the [`WsControl`] frames.

use super::handlers::AppState;
use crate::events::RoundEvent;
use crate::games::types::GameKind;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Frames that are not round events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsControl {
    Connected { client_id: String, games: Vec<GameKind> },
    Heartbeat { timestamp: i64 },
    /// The client fell behind and `missed` events were dropped
    Lagged { missed: u64 },
    Error { message: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub game: Option<String>,
    /// Comma-separated event names
    #[serde(default)]
    pub events: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WsFilter {
    pub game: Option<GameKind>,
    pub events: Option<HashSet<String>>,
}

impl WsFilter {
    pub fn from_query(query: &WsQuery) -> Result<Self, String> {
        let game = query.game.as_deref().map(str::parse::<GameKind>).transpose()?;
        let events = query.events.as_ref().map(|list| {
            list.split(',')
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect::<HashSet<_>>()
        });
        Ok(Self { game, events })
    }

    pub fn allows(&self, event: &RoundEvent) -> bool {
        if self.game.is_some_and(|game| game != event.kind) {
            return false;
        }
        match &self.events {
            Some(names) => names.contains(event.name()),
            None => true,
        }
    }
}

/// GET /ws
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let filter = WsFilter::from_query(&query);
    ws.on_upgrade(move |socket| handle_connection(socket, state, filter))
}

fn encode<T: Serialize>(frame: &T) -> Option<Message> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(Message::Text(text)),
        Err(e) => {
            warn!("Failed to serialize websocket frame: {}", e);
            None
        }
    }
}

fn generate_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("ws_{}", COUNTER.fetch_add(1, Ordering::SeqCst))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, filter: Result<WsFilter, String>) {
    let client_id = generate_client_id();
    let (mut sender, mut receiver) = socket.split();

    let filter = match filter {
        Ok(filter) => filter,
        Err(message) => {
            if let Some(frame) = encode(&WsControl::Error { message }) {
                let _ = sender.send(frame).await;
            }
            let _ = sender.close().await;
            return;
        }
    };

    // Subscribe before greeting so nothing published in between is lost
    let mut events = state.engine.events().subscribe();
    info!(client = %client_id, game = ?filter.game, "websocket client connected");

    let welcome = WsControl::Connected {
        client_id: client_id.clone(),
        games: state.engine.settings().enabled_games(),
    };
    if let Some(frame) = encode(&welcome) {
        if sender.send(frame).await.is_err() {
            return;
        }
    }

    let receive_client = client_id.clone();
    let mut receive_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(Message::Text(text)) => {
                    debug!(client = %receive_client, %text, "ignoring client message");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(client = %receive_client, "websocket error: {}", e);
                    break;
                }
            }
        }
    });

    let send_client = client_id.clone();
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;

        loop {
            let frame = tokio::select! {
                received = events.recv() => match received {
                    Ok(event) if filter.allows(&event) => encode(&event),
                    Ok(_) => None,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(client = %send_client, missed, "websocket client lagging");
                        encode(&WsControl::Lagged { missed })
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = heartbeat.tick() => encode(&WsControl::Heartbeat {
                    timestamp: Utc::now().timestamp_millis(),
                }),
            };

            if let Some(frame) = frame {
                if sender.send(frame).await.is_err() {
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut receive_task => send_task.abort(),
        _ = &mut send_task => receive_task.abort(),
    }
    info!(client = %client_id, "websocket client disconnected");
}
