//! Error taxonomy for the round lifecycle engine
//!
//! Every failure surfaces as an [`EngineError`]. Observers that only care about
//! how to react (retry, report, abort) use [`EngineError::category`].

use crate::games::types::{GameKind, Multiplier};
use crate::ledger::SettlementRecord;
use crate::round::RoundPhase;
use thiserror::Error;

/// Root error type for all engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bet refused by round validation
    #[error("Bet rejected: {0}")]
    BetRejected(#[from] BetRejection),

    /// Seed could not be revealed or verified
    #[error("Seed error: {0}")]
    Seed(#[from] SeedError),

    /// Ledger request failed
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Command issued in the wrong phase
    #[error("Round {kind}#{round_id} is {actual}, expected {expected}")]
    Phase {
        kind: GameKind,
        round_id: u64,
        expected: RoundPhase,
        actual: RoundPhase,
    },

    #[error("Round {kind}#{round_id} not found")]
    RoundNotFound { kind: GameKind, round_id: u64 },

    #[error("A {kind} round is already active (#{round_id})")]
    RoundAlreadyActive { kind: GameKind, round_id: u64 },

    #[error("Seed commitment does not match round {kind}#{round_id}: {reason}")]
    CommitmentMismatch {
        kind: GameKind,
        round_id: u64,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Round actor is gone (runtime shutting down)
    #[error("Round {kind}#{round_id} is no longer reachable")]
    ActorUnavailable { kind: GameKind, round_id: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Reasons a bet is refused. Never retried by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BetRejection {
    #[error("round is no longer accepting bets")]
    TooLate,

    #[error("bet amount must be greater than zero")]
    ZeroAmount,

    #[error("amount {amount} is below the minimum deposit {minimum}")]
    BelowMinimum { amount: u64, minimum: u64 },

    #[error("round already has the maximum of {max} participants")]
    RoundFull { max: u32 },

    #[error("invalid prediction: {0}")]
    InvalidPrediction(String),

    #[error("bet of {amount} would overflow the round stake of {total_stake}")]
    StakeOverflow { amount: u64, total_stake: u64 },
}

/// Seed reveal/verification failures. Fatal to the round.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SeedError {
    #[error("invalid seed: {0}")]
    InvalidSeed(String),

    #[error("no reveal available for commitment {0}")]
    RevealUnavailable(String),
}

/// Ledger failures as seen through the adapter
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Network or availability problem; safe to retry
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// The ledger refused the request; retrying will not help
    #[error("ledger rejected request: {0}")]
    Rejected(Rejection),

    #[error("ledger account {0} not found")]
    NotFound(String),
}

/// Why the ledger refused a request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// Another writer already settled the round; carries the ledger's record
    #[error("round already settled")]
    AlreadySettled(Box<SettlementRecord>),

    #[error("round is closed for deposits")]
    RoundClosed,

    #[error("deposit below minimum {minimum}")]
    BelowMinimum { minimum: u64 },

    #[error("round is full ({max} participants)")]
    RoundFull { max: u32 },

    #[error("round id {requested} out of sequence (next is {expected})")]
    OutOfSequence { requested: u64, expected: u64 },

    #[error("{0}")]
    Invalid(String),
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),
}

/// Coarse error classes reported to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    ValidationError,
    TimingError,
    SeedError,
    LedgerTransient,
    LedgerConflict,
    Other,
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::BetRejected(BetRejection::TooLate) => ErrorCategory::TimingError,
            EngineError::BetRejected(_) => ErrorCategory::ValidationError,
            EngineError::Seed(_) => ErrorCategory::SeedError,
            EngineError::Ledger(LedgerError::Unavailable(_)) => ErrorCategory::LedgerTransient,
            EngineError::Ledger(LedgerError::Rejected(Rejection::AlreadySettled(_))) => {
                ErrorCategory::LedgerConflict
            }
            _ => ErrorCategory::Other,
        }
    }

    /// Whether the caller may retry the same command later
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::LedgerTransient)
    }
}

impl BetRejection {
    /// Cash-out targets must be above 1.00x and within the configured cap
    pub fn invalid_target(target: Multiplier, max: Multiplier) -> Self {
        BetRejection::InvalidPrediction(format!(
            "auto cash-out target {} must be between 1.01x and {}",
            target, max
        ))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Configuration(ConfigurationError::LoadFailed(e.to_string()))
    }
}

// Convenience type alias for Results
pub type EngineResult<T> = Result<T, EngineError>;
pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = EngineError::from(BetRejection::BelowMinimum {
            amount: 5,
            minimum: 10,
        });

        assert!(error.to_string().contains("Bet rejected"));
        assert!(error.to_string().contains("below the minimum"));
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            EngineError::from(BetRejection::TooLate).category(),
            ErrorCategory::TimingError
        );
        assert_eq!(
            EngineError::from(BetRejection::RoundFull { max: 2 }).category(),
            ErrorCategory::ValidationError
        );
        assert_eq!(
            EngineError::from(SeedError::InvalidSeed("x".into())).category(),
            ErrorCategory::SeedError
        );

        let transient = EngineError::from(LedgerError::Unavailable("timeout".into()));
        assert_eq!(transient.category(), ErrorCategory::LedgerTransient);
        assert!(transient.is_retryable());
    }

    #[test]
    fn test_rejection_is_not_retryable() {
        let error = EngineError::from(LedgerError::Rejected(Rejection::RoundClosed));
        assert!(!error.is_retryable());
        assert_eq!(error.category(), ErrorCategory::Other);
    }
}
