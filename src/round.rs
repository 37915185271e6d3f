//! Round state machine
//!
//! A [`Round`] is plain data plus the transition rules. It is owned by exactly
//! one actor task (see `engine.rs`), which is what makes every mutation below
//! single-writer. Readers get a [`RoundView`] snapshot instead.

use crate::errors::{BetRejection, EngineError, EngineResult};
use crate::games::outcome::{flight_duration_ms, flight_multiplier, CrashParams};
use crate::games::payout::{refund_plan, FeeSchedule};
use crate::games::types::{
    Bet, GameKind, Multiplier, Outcome, Participant, PayoutPlan, Prediction, SeedCommitment,
    SeedReveal,
};
use crate::ledger::{RoundAddress, SettlementRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RoundPhase {
    Open,
    Locked,
    Resolving,
    Settled,
    Aborted,
}

impl RoundPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoundPhase::Settled | RoundPhase::Aborted)
    }
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoundPhase::Open => "open",
            RoundPhase::Locked => "locked",
            RoundPhase::Resolving => "resolving",
            RoundPhase::Settled => "settled",
            RoundPhase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Limits and fees a round is opened with
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoundRules {
    pub min_deposit: u64,
    pub max_participants: u32,
    pub fees: FeeSchedule,
    pub crash: CrashParams,
}

impl Default for RoundRules {
    fn default() -> Self {
        Self {
            min_deposit: 100_000_000,
            max_participants: 100,
            fees: FeeSchedule::default(),
            crash: CrashParams::default(),
        }
    }
}

/// Position of a crash round on its flight curve
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Flight {
    pub multiplier: Multiplier,
    pub elapsed_ms: u64,
    pub remaining_ms: u64,
}

/// Read-only snapshot published to readers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoundView {
    pub kind: GameKind,
    pub round_id: u64,
    pub phase: RoundPhase,
    pub opened_at: u64,
    pub lock_at: u64,
    pub resolved_at: Option<u64>,
    pub settled_at: Option<u64>,
    pub commitment: SeedCommitment,
    pub reveal: Option<SeedReveal>,
    pub bets: Vec<Bet>,
    pub participant_count: usize,
    pub total_stake: u64,
    pub outcome: Option<Outcome>,
    /// Present only once the round is settled
    pub payouts: Option<PayoutPlan>,
    pub refunds: Option<PayoutPlan>,
    /// Aborted and still waiting for the ledger to confirm refunds
    pub refund_pending: bool,
    /// Set when the ledger refused the refunds outright
    pub refund_error: Option<String>,
    pub abort_reason: Option<String>,
    /// Crash rounds only: when the flight reaches the crash point
    pub flight_ends_at: Option<u64>,
    pub ledger_address: RoundAddress,
}

impl RoundView {
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Terminal with nothing left to submit to the ledger
    pub fn is_finished(&self) -> bool {
        self.phase.is_terminal() && !self.refund_pending
    }
}

fn stake_sum(bets: &[Bet]) -> u64 {
    bets.iter().fold(0u64, |sum, b| sum.saturating_add(b.amount))
}

#[derive(Debug, Clone)]
pub struct Round {
    kind: GameKind,
    round_id: u64,
    phase: RoundPhase,
    opened_at: u64,
    lock_at: u64,
    resolved_at: Option<u64>,
    settled_at: Option<u64>,
    commitment: SeedCommitment,
    reveal: Option<SeedReveal>,
    bets: Vec<Bet>,
    total_stake: u64,
    outcome: Option<Outcome>,
    payouts: Option<PayoutPlan>,
    refunds: Option<PayoutPlan>,
    refunds_confirmed: bool,
    refund_error: Option<String>,
    abort_reason: Option<String>,
    ledger_address: RoundAddress,
    rules: RoundRules,
}

impl Round {
    pub fn new(
        kind: GameKind,
        round_id: u64,
        opened_at: u64,
        lock_at: u64,
        commitment: SeedCommitment,
        ledger_address: RoundAddress,
        rules: RoundRules,
    ) -> EngineResult<Self> {
        if commitment.kind != kind || commitment.round_id != round_id {
            return Err(EngineError::CommitmentMismatch {
                kind,
                round_id,
                reason: format!(
                    "commitment belongs to {}#{}",
                    commitment.kind, commitment.round_id
                ),
            });
        }

        Ok(Self {
            kind,
            round_id,
            phase: RoundPhase::Open,
            opened_at,
            lock_at,
            resolved_at: None,
            settled_at: None,
            commitment,
            reveal: None,
            bets: Vec::new(),
            total_stake: 0,
            outcome: None,
            payouts: None,
            refunds: None,
            refunds_confirmed: false,
            refund_error: None,
            abort_reason: None,
            ledger_address,
            rules,
        })
    }

    pub fn kind(&self) -> GameKind {
        self.kind
    }

    pub fn round_id(&self) -> u64 {
        self.round_id
    }

    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    pub fn lock_at(&self) -> u64 {
        self.lock_at
    }

    pub fn commitment(&self) -> &SeedCommitment {
        &self.commitment
    }

    pub fn bets(&self) -> &[Bet] {
        &self.bets
    }

    pub fn total_stake(&self) -> u64 {
        self.total_stake
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    pub fn payouts(&self) -> Option<&PayoutPlan> {
        self.payouts.as_ref()
    }

    pub fn refunds(&self) -> Option<&PayoutPlan> {
        self.refunds.as_ref()
    }

    pub fn rules(&self) -> &RoundRules {
        &self.rules
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    /// Aborted rounds whose refunds the ledger has not confirmed yet
    pub fn refund_pending(&self) -> bool {
        self.phase == RoundPhase::Aborted && !self.refunds_confirmed
    }

    /// Settled, or aborted with refunds confirmed
    pub fn is_finished(&self) -> bool {
        match self.phase {
            RoundPhase::Settled => true,
            RoundPhase::Aborted => self.refunds_confirmed,
            RoundPhase::Open | RoundPhase::Locked | RoundPhase::Resolving => false,
        }
    }

    fn phase_error(&self, expected: RoundPhase) -> EngineError {
        EngineError::Phase {
            kind: self.kind,
            round_id: self.round_id,
            expected,
            actual: self.phase,
        }
    }

    fn validate_prediction(&self, prediction: Option<&Prediction>) -> Result<(), BetRejection> {
        match (self.kind, prediction) {
            (GameKind::RisingMultiplier, Some(Prediction::AutoCashout { target })) => {
                let max = self.rules.fees.max_cashout;
                if *target < Multiplier::MIN_TARGET || *target > max {
                    return Err(BetRejection::invalid_target(*target, max));
                }
                Ok(())
            }
            (GameKind::RisingMultiplier, _) => Err(BetRejection::InvalidPrediction(
                "crash bets need an auto cash-out target".to_string(),
            )),
            (GameKind::BinaryFlip, Some(Prediction::Side { .. })) => Ok(()),
            (GameKind::BinaryFlip, _) => Err(BetRejection::InvalidPrediction(
                "flip bets need a side".to_string(),
            )),
            (GameKind::WeightedPool, None) => Ok(()),
            (GameKind::WeightedPool, Some(_)) => Err(BetRejection::InvalidPrediction(
                "pool bets take no prediction".to_string(),
            )),
        }
    }

    fn distinct_participants(&self) -> usize {
        self.bets
            .iter()
            .map(|b| &b.participant)
            .collect::<HashSet<_>>()
            .len()
    }

    /// Checks a bet without changing the round
    pub fn validate_bet(
        &self,
        participant: &Participant,
        amount: u64,
        prediction: Option<&Prediction>,
        now: u64,
    ) -> Result<(), BetRejection> {
        if self.phase != RoundPhase::Open || now >= self.lock_at {
            return Err(BetRejection::TooLate);
        }
        if amount == 0 {
            return Err(BetRejection::ZeroAmount);
        }
        if amount < self.rules.min_deposit {
            return Err(BetRejection::BelowMinimum {
                amount,
                minimum: self.rules.min_deposit,
            });
        }
        self.validate_prediction(prediction)?;
        if self.total_stake.checked_add(amount).is_none() {
            return Err(BetRejection::StakeOverflow {
                amount,
                total_stake: self.total_stake,
            });
        }

        let returning = self.bets.iter().any(|b| &b.participant == participant);
        if !returning && self.distinct_participants() >= self.rules.max_participants as usize {
            return Err(BetRejection::RoundFull {
                max: self.rules.max_participants,
            });
        }
        Ok(())
    }

    /// Appends an accepted bet; the ledger deposit must already be confirmed
    pub fn append_bet(
        &mut self,
        participant: Participant,
        amount: u64,
        prediction: Option<Prediction>,
        now: u64,
    ) -> Result<Bet, BetRejection> {
        self.validate_bet(&participant, amount, prediction.as_ref(), now)?;

        let bet = Bet {
            sequence: self.bets.len() as u32,
            participant,
            amount,
            prediction,
            placed_at: now,
        };
        self.bets.push(bet.clone());
        self.total_stake = self.total_stake.saturating_add(amount);
        Ok(bet)
    }

    /// When a resolved crash round's flight reaches its crash point
    pub fn flight_ends_at(&self) -> Option<u64> {
        match (self.outcome, self.resolved_at) {
            (Some(Outcome::Crash { crash_point }), Some(resolved_at)) => Some(
                resolved_at
                    .saturating_add(flight_duration_ms(crash_point, self.rules.crash.growth_per_sec())),
            ),
            _ => None,
        }
    }

    /// Flight position at `now`, while a resolving crash round is still climbing
    pub fn flight_at(&self, now: u64) -> Option<Flight> {
        if self.phase != RoundPhase::Resolving {
            return None;
        }
        let (Some(Outcome::Crash { crash_point }), Some(resolved_at)) = (self.outcome, self.resolved_at)
        else {
            return None;
        };
        let ends_at = self.flight_ends_at()?;
        if now >= ends_at {
            return None;
        }
        let elapsed_ms = now.saturating_sub(resolved_at);
        Some(Flight {
            multiplier: flight_multiplier(elapsed_ms, self.rules.crash.growth_per_sec()).min(crash_point),
            elapsed_ms,
            remaining_ms: ends_at - now,
        })
    }

    /// Open → Locked. Returns `false` when the round was already past Open.
    pub fn lock(&mut self) -> EngineResult<bool> {
        match self.phase {
            RoundPhase::Open => {
                self.phase = RoundPhase::Locked;
                Ok(true)
            }
            RoundPhase::Locked | RoundPhase::Resolving | RoundPhase::Settled => Ok(false),
            RoundPhase::Aborted => Err(self.phase_error(RoundPhase::Open)),
        }
    }

    /// Replaces the bet list with the ledger-reconciled one while Locked
    pub fn replace_bets(&mut self, bets: Vec<Bet>) -> EngineResult<()> {
        if self.phase != RoundPhase::Locked {
            return Err(self.phase_error(RoundPhase::Locked));
        }
        self.total_stake = stake_sum(&bets);
        self.bets = bets;
        Ok(())
    }

    /// Locked → Resolving, assigning the outcome and payout plan exactly once
    pub fn begin_resolving(
        &mut self,
        outcome: Outcome,
        reveal: SeedReveal,
        plan: PayoutPlan,
        now: u64,
    ) -> EngineResult<()> {
        if self.phase != RoundPhase::Locked {
            return Err(self.phase_error(RoundPhase::Locked));
        }
        if self.outcome.is_some() {
            return Err(EngineError::Internal(format!(
                "outcome of {}#{} assigned twice",
                self.kind, self.round_id
            )));
        }
        self.outcome = Some(outcome);
        self.reveal = Some(reveal);
        self.payouts = Some(plan);
        self.resolved_at = Some(now);
        self.phase = RoundPhase::Resolving;
        Ok(())
    }

    /// Record sent to the ledger for this round
    pub fn settlement_record(&self, now: u64) -> EngineResult<SettlementRecord> {
        match (&self.outcome, &self.reveal, &self.payouts) {
            (Some(outcome), Some(reveal), Some(plan)) => Ok(SettlementRecord {
                kind: self.kind,
                round_id: self.round_id,
                outcome: *outcome,
                reveal: reveal.clone(),
                plan: plan.clone(),
                settled_at: now,
            }),
            _ => Err(self.phase_error(RoundPhase::Resolving)),
        }
    }

    /// Resolving → Settled
    pub fn mark_settled(&mut self, now: u64) -> EngineResult<()> {
        if self.phase != RoundPhase::Resolving {
            return Err(self.phase_error(RoundPhase::Resolving));
        }
        self.phase = RoundPhase::Settled;
        self.settled_at = Some(now);
        Ok(())
    }

    /// Takes the ledger's settlement as the truth for this round
    pub fn adopt_ledger_settlement(&mut self, record: SettlementRecord, now: u64) -> EngineResult<()> {
        match self.phase {
            RoundPhase::Locked | RoundPhase::Resolving => {
                self.outcome = Some(record.outcome);
                self.reveal = Some(record.reveal);
                self.total_stake = record.plan.total_stake;
                self.payouts = Some(record.plan);
                self.resolved_at.get_or_insert(now);
                self.settled_at = Some(record.settled_at);
                self.phase = RoundPhase::Settled;
                Ok(())
            }
            RoundPhase::Open | RoundPhase::Settled | RoundPhase::Aborted => {
                Err(self.phase_error(RoundPhase::Resolving))
            }
        }
    }

    /// Open → Aborted with a full refund plan
    pub fn abort(&mut self, reason: impl Into<String>) -> EngineResult<PayoutPlan> {
        if self.phase != RoundPhase::Open {
            return Err(self.phase_error(RoundPhase::Open));
        }
        Ok(self.enter_aborted(reason.into()))
    }

    /// Locked or Resolving → Aborted when the round cannot be settled.
    ///
    /// `ledger_bets` replaces the local bet list so the refunds cover every
    /// deposit the ledger holds.
    pub fn abort_unsettled(
        &mut self,
        reason: impl Into<String>,
        ledger_bets: Option<Vec<Bet>>,
    ) -> EngineResult<PayoutPlan> {
        match self.phase {
            RoundPhase::Locked | RoundPhase::Resolving => {}
            RoundPhase::Open | RoundPhase::Settled | RoundPhase::Aborted => {
                return Err(self.phase_error(RoundPhase::Locked))
            }
        }
        if let Some(bets) = ledger_bets {
            self.total_stake = stake_sum(&bets);
            self.bets = bets;
        }
        Ok(self.enter_aborted(reason.into()))
    }

    fn enter_aborted(&mut self, reason: String) -> PayoutPlan {
        let refunds = refund_plan(&self.bets);
        self.refunds = Some(refunds.clone());
        self.payouts = None;
        self.abort_reason = Some(reason);
        self.refunds_confirmed = self.bets.is_empty();
        self.phase = RoundPhase::Aborted;
        refunds
    }

    pub fn confirm_refunds(&mut self) {
        if self.phase == RoundPhase::Aborted {
            self.refunds_confirmed = true;
        }
    }

    /// The ledger will never accept these refunds; stop submitting them
    pub fn refunds_refused(&mut self, reason: String) {
        if self.phase == RoundPhase::Aborted {
            self.refund_error = Some(reason);
            self.refunds_confirmed = true;
        }
    }

    pub fn view(&self) -> RoundView {
        RoundView {
            kind: self.kind,
            round_id: self.round_id,
            phase: self.phase,
            opened_at: self.opened_at,
            lock_at: self.lock_at,
            resolved_at: self.resolved_at,
            settled_at: self.settled_at,
            commitment: self.commitment.clone(),
            reveal: self.reveal.clone(),
            bets: self.bets.clone(),
            participant_count: self.distinct_participants(),
            total_stake: self.total_stake,
            outcome: self.outcome,
            payouts: match self.phase {
                RoundPhase::Settled => self.payouts.clone(),
                _ => None,
            },
            refunds: self.refunds.clone(),
            refund_pending: self.refund_pending(),
            refund_error: self.refund_error.clone(),
            abort_reason: self.abort_reason.clone(),
            flight_ends_at: self.flight_ends_at(),
            ledger_address: self.ledger_address.clone(),
        }
    }
}
