//! External ledger interface
//!
//! The ledger holds one config account per game kind and one game-ground
//! account per round. The engine talks to it only through [`LedgerAdapter`],
//! which adds address derivation, retries and reconciliation on top of a raw
//! [`Ledger`] implementation.

pub mod adapter;
pub mod memory;

pub use adapter::{LedgerAdapter, Reconciliation, RetryPolicy, SettlementOutcome};
pub use memory::InMemoryLedger;

use crate::errors::LedgerResult;
use crate::games::types::{GameKind, Outcome, Participant, PayoutPlan, SeedReveal};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

const ROUND_SEED: &[u8] = b"BONDING_CURVE";
const CONFIG_SEED: &[u8] = b"config";

/// Deterministic ledger account reference (hex SHA-256 of the derivation seeds)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct RoundAddress(String);

impl RoundAddress {
    /// Game-ground account of a round
    pub fn derive(program_id: &str, kind: GameKind, round_id: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(program_id.as_bytes());
        hasher.update(ROUND_SEED);
        hasher.update(kind.tag().as_bytes());
        hasher.update(round_id.to_le_bytes());
        RoundAddress(hex::encode(hasher.finalize()))
    }

    /// Config account of a game kind
    pub fn config(program_id: &str, kind: GameKind) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(program_id.as_bytes());
        hasher.update(CONFIG_SEED);
        hasher.update(kind.tag().as_bytes());
        RoundAddress(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoundAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-game configuration account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigAccount {
    pub authority: String,
    pub team_wallet: String,
    pub platform_fee_bps: u64,
    pub min_deposit: u64,
    pub max_participants: u32,
    /// Id of the most recently created round (0 before the first)
    pub round_counter: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DepositEntry {
    pub participant: Participant,
    pub amount: u64,
}

/// Per-round account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GameGroundAccount {
    pub address: RoundAddress,
    pub kind: GameKind,
    pub round_id: u64,
    pub round_time_secs: u64,
    pub min_deposit: u64,
    pub total_deposit: u64,
    pub user_count: u32,
    pub is_completed: bool,
    pub deposits: Vec<DepositEntry>,
    pub start_date: u64,
    pub end_date: u64,
    pub winner: Option<Participant>,
    pub settlement: Option<SettlementRecord>,
    pub refunded: bool,
}

/// What the ledger stores once a round is paid out
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettlementRecord {
    pub kind: GameKind,
    pub round_id: u64,
    pub outcome: Outcome,
    pub reveal: SeedReveal,
    pub plan: PayoutPlan,
    pub settled_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateRoundRequest {
    pub address: RoundAddress,
    pub kind: GameKind,
    pub round_id: u64,
    pub start_date: u64,
    pub end_date: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DepositRequest {
    pub address: RoundAddress,
    pub kind: GameKind,
    pub round_id: u64,
    pub participant: Participant,
    pub amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefundRequest {
    pub address: RoundAddress,
    pub kind: GameKind,
    pub round_id: u64,
    pub refunds: PayoutPlan,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DepositReceipt {
    pub tx_id: String,
    pub total_deposit: u64,
    pub user_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettlementReceipt {
    pub tx_id: String,
    pub round_id: u64,
    pub submitted_at: u64,
}

/// Raw ledger operations
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn read_config(&self, kind: GameKind) -> LedgerResult<ConfigAccount>;

    /// Creates the round account. Repeating the call for an existing round
    /// returns the stored account.
    async fn create_round(&self, request: CreateRoundRequest) -> LedgerResult<GameGroundAccount>;

    async fn deposit(&self, request: DepositRequest) -> LedgerResult<DepositReceipt>;

    /// Records the settlement. A round that is already settled is refused
    /// with `Rejection::AlreadySettled` carrying the stored record.
    async fn settle(&self, record: SettlementRecord) -> LedgerResult<SettlementReceipt>;

    async fn refund(&self, request: RefundRequest) -> LedgerResult<SettlementReceipt>;

    async fn read_round(&self, kind: GameKind, round_id: u64) -> LedgerResult<GameGroundAccount>;
}
