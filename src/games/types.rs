use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported game types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum GameKind {
    /// Rising multiplier that crashes at a seed-derived point
    #[serde(rename = "crash")]
    RisingMultiplier,
    /// Heads or tails
    #[serde(rename = "flip")]
    BinaryFlip,
    /// Jackpot pool; win chance proportional to stake
    #[serde(rename = "pool")]
    WeightedPool,
}

impl GameKind {
    pub const ALL: [GameKind; 3] = [
        GameKind::RisingMultiplier,
        GameKind::BinaryFlip,
        GameKind::WeightedPool,
    ];

    /// Stable tag used in account derivation and seed input messages
    pub fn tag(&self) -> &'static str {
        match self {
            GameKind::RisingMultiplier => "crash",
            GameKind::BinaryFlip => "flip",
            GameKind::WeightedPool => "pool",
        }
    }

    /// Upper bound on `(payouts + fee) / total_stake` for this game
    pub fn payout_ratio(&self, max_cashout: Multiplier) -> Multiplier {
        match self {
            GameKind::RisingMultiplier => max_cashout,
            GameKind::BinaryFlip => Multiplier::from_hundredths(200),
            GameKind::WeightedPool => Multiplier::ONE,
        }
    }
}

impl fmt::Display for GameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl FromStr for GameKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "crash" | "rising-multiplier" | "risingmultiplier" => Ok(GameKind::RisingMultiplier),
            "flip" | "coinflip" | "binary-flip" | "binaryflip" => Ok(GameKind::BinaryFlip),
            "pool" | "jackpot" | "weighted-pool" | "weightedpool" => Ok(GameKind::WeightedPool),
            other => Err(format!("unknown game kind '{}'", other)),
        }
    }
}

/// Coin flip side
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CoinSide {
    Heads,
    Tails,
}

impl fmt::Display for CoinSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoinSide::Heads => write!(f, "heads"),
            CoinSide::Tails => write!(f, "tails"),
        }
    }
}

/// Fixed-point multiplier in hundredths (`250` = 2.50x)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct Multiplier(u64);

impl Multiplier {
    pub const ONE: Multiplier = Multiplier(100);
    /// Lowest cash-out target a bet may request
    pub const MIN_TARGET: Multiplier = Multiplier(101);

    pub const fn from_hundredths(hundredths: u64) -> Self {
        Multiplier(hundredths)
    }

    /// Floors to two decimals; non-finite or sub-1.00 values clamp to 1.00x
    pub fn from_f64(value: f64) -> Self {
        if !value.is_finite() || value < 1.0 {
            return Multiplier::ONE;
        }
        Multiplier((value * 100.0).floor() as u64)
    }

    pub fn hundredths(&self) -> u64 {
        self.0
    }

    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// `amount × self`, floored to a whole base unit and saturated at `u64::MAX`
    pub fn apply(&self, amount: u64) -> u64 {
        let product = amount as u128 * self.0 as u128 / 100;
        u64::try_from(product).unwrap_or(u64::MAX)
    }
}

impl fmt::Display for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}x", self.0 / 100, self.0 % 100)
    }
}

/// Opaque player identity (wallet address or session key)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Participant(String);

impl Participant {
    pub fn new(id: impl Into<String>) -> Self {
        Participant(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Participant {
    fn from(id: &str) -> Self {
        Participant(id.to_string())
    }
}

impl From<String> for Participant {
    fn from(id: String) -> Self {
        Participant(id)
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Game-specific choice attached to a bet
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Prediction {
    /// Cash out automatically once the multiplier reaches `target`
    AutoCashout { target: Multiplier },
    /// Chosen coin side
    Side { side: CoinSide },
}

/// One player's stake in a round
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bet {
    /// Position in the round's bet order
    pub sequence: u32,
    pub participant: Participant,
    pub amount: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prediction: Option<Prediction>,
    pub placed_at: u64,
}

/// Resolved result of a round
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "game", rename_all = "lowercase")]
pub enum Outcome {
    Crash { crash_point: Multiplier },
    Flip { side: CoinSide },
    Pool {
        /// Index into the bet order; `None` only for an empty pool
        winner_index: Option<usize>,
        /// Uniform draw in `[0, total_stake)` the scan was run against
        draw: u64,
    },
}

/// Amount owed to one participant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payout {
    pub participant: Participant,
    /// Sum of the participant's bets in the round
    pub stake: u64,
    pub amount: u64,
}

/// Complete payout computation for a round
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PayoutPlan {
    /// One entry per distinct participant in first-bet order; losers carry zero
    pub payouts: Vec<Payout>,
    pub platform_fee: u64,
    pub total_stake: u64,
}

impl PayoutPlan {
    /// Sum of all payouts, saturated at `u64::MAX`
    pub fn total_paid(&self) -> u64 {
        self.payouts
            .iter()
            .fold(0u64, |total, p| total.saturating_add(p.amount))
    }

    pub fn amount_for(&self, participant: &Participant) -> Option<u64> {
        self.payouts
            .iter()
            .find(|p| &p.participant == participant)
            .map(|p| p.amount)
    }

    /// `Σ payouts + platform_fee ≤ total_stake × ratio`
    pub fn within_bounds(&self, ratio: Multiplier) -> bool {
        let paid: u128 = self.payouts.iter().map(|p| p.amount as u128).sum();
        let spent = paid + self.platform_fee as u128;
        spent * 100 <= self.total_stake as u128 * ratio.hundredths() as u128
    }
}

/// Seed commitment published when a round opens.
///
/// `digest` is the hex SHA-256 of the 32-byte seed. When `public_key` is set the
/// seed must also be the SHA-256 of a schnorrkel signature over `input_message`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeedCommitment {
    pub kind: GameKind,
    pub round_id: u64,
    pub input_message: String,
    pub digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

/// Seed disclosed at resolution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeedReveal {
    /// Hex-encoded 32-byte seed
    pub seed: String,
    /// Hex-encoded schnorrkel signature (64 bytes)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<String>,
}
