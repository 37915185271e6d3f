//! Round lifecycle events
//!
//! Every phase change and accepted bet is published on a broadcast channel.
//! Subscribers that fall behind lose the oldest events; the round snapshots in
//! the registry remain the source of truth.

use crate::games::types::{Bet, GameKind, Multiplier, Outcome, PayoutPlan, SeedCommitment};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoundEvent {
    pub kind: GameKind,
    pub round_id: u64,
    pub timestamp: u64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    RoundOpened {
        lock_at: u64,
        commitment: SeedCommitment,
    },
    BetAccepted {
        bet: Bet,
        total_stake: u64,
    },
    /// Emitted on scheduler ticks while a round is open
    Countdown {
        remaining_ms: u64,
    },
    RoundLocked {
        bet_count: usize,
        total_stake: u64,
    },
    RoundResolved {
        outcome: Outcome,
    },
    /// Crash rounds: the curve's current value, on scheduler ticks until the crash point
    FlightTick {
        multiplier: Multiplier,
        elapsed_ms: u64,
    },
    SettlementDelayed {
        attempts: u32,
        reason: String,
    },
    RoundSettled {
        payouts: PayoutPlan,
    },
    RoundAborted {
        reason: String,
        refunds: PayoutPlan,
    },
}

impl RoundEvent {
    /// Short name used in logs and subscription filters
    pub fn name(&self) -> &'static str {
        match &self.payload {
            EventPayload::RoundOpened { .. } => "round_opened",
            EventPayload::BetAccepted { .. } => "bet_accepted",
            EventPayload::Countdown { .. } => "countdown",
            EventPayload::RoundLocked { .. } => "round_locked",
            EventPayload::RoundResolved { .. } => "round_resolved",
            EventPayload::FlightTick { .. } => "flight_tick",
            EventPayload::SettlementDelayed { .. } => "settlement_delayed",
            EventPayload::RoundSettled { .. } => "round_settled",
            EventPayload::RoundAborted { .. } => "round_aborted",
        }
    }
}

/// Broadcast fan-out for [`RoundEvent`]s
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RoundEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, kind: GameKind, round_id: u64, timestamp: u64, payload: EventPayload) {
        let event = RoundEvent {
            kind,
            round_id,
            timestamp,
            payload,
        };
        if let Err(e) = self.tx.send(event) {
            debug!("No subscribers for {} event: {}", e.0.name(), kind);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoundEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
