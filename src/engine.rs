//! Round engine
//!
//! Each round runs in its own task ([`RoundActor`]) that owns the [`Round`]
//! and processes commands strictly in arrival order. Callers talk to it through
//! a [`RoundHandle`]: commands go over an mpsc channel and answers come back on
//! a oneshot. Readers never reach the actor; they read the `watch` snapshot.

use crate::clock::Clock;
use crate::errors::{BetRejection, EngineError, EngineResult, LedgerError, Rejection};
use crate::events::{EventBus, EventPayload};
use crate::games::outcome;
use crate::games::payout::compute_payouts;
use crate::games::types::{Bet, GameKind, Participant, PayoutPlan, Prediction, SeedCommitment};
use crate::games::vrf_engine::{input_message, SeedSource};
use crate::ledger::{LedgerAdapter, SettlementOutcome};
use crate::registry::RoundRegistry;
use crate::round::{Flight, Round, RoundPhase, RoundRules, RoundView};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

const COMMAND_QUEUE_DEPTH: usize = 256;

/// Per-game settings applied when the engine opens rounds on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameSettings {
    pub enabled: bool,
    /// Time between opening a round and locking it
    pub round_duration_ms: u64,
    pub rules: RoundRules,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub games: HashMap<GameKind, GameSettings>,
    pub history_limit: usize,
    pub event_capacity: usize,
}

impl EngineSettings {
    pub fn game(&self, kind: GameKind) -> Option<&GameSettings> {
        self.games.get(&kind)
    }

    pub fn enabled_games(&self) -> Vec<GameKind> {
        GameKind::ALL
            .into_iter()
            .filter(|kind| self.game(*kind).map(|g| g.enabled).unwrap_or(false))
            .collect()
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        let durations = [
            (GameKind::RisingMultiplier, 15_000),
            (GameKind::BinaryFlip, 10_000),
            (GameKind::WeightedPool, 60_000),
        ];
        Self {
            games: durations
                .into_iter()
                .map(|(kind, round_duration_ms)| {
                    (
                        kind,
                        GameSettings {
                            enabled: true,
                            round_duration_ms,
                            rules: RoundRules::default(),
                        },
                    )
                })
                .collect(),
            history_limit: 100,
            event_capacity: 1024,
        }
    }
}

/// Result of a settle command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SettleStatus {
    Settled { payouts: PayoutPlan },
    /// The ledger stayed unavailable; the round is unchanged and can be retried
    Delayed { attempts: u32, reason: String },
    Refunded { refunds: PayoutPlan },
    /// Crash round still climbing; settlement waits for the crash point
    InFlight { flight: Flight },
}

pub(crate) enum RoundCommand {
    PlaceBet {
        participant: Participant,
        amount: u64,
        prediction: Option<Prediction>,
        reply: oneshot::Sender<EngineResult<Bet>>,
    },
    Lock {
        reply: oneshot::Sender<EngineResult<RoundView>>,
    },
    Resolve {
        reply: oneshot::Sender<EngineResult<RoundView>>,
    },
    Settle {
        reply: oneshot::Sender<EngineResult<SettleStatus>>,
    },
    Abort {
        reason: String,
        reply: oneshot::Sender<EngineResult<PayoutPlan>>,
    },
}

/// Cheap, cloneable reference to a running round
#[derive(Clone)]
pub struct RoundHandle {
    kind: GameKind,
    round_id: u64,
    commands: mpsc::Sender<RoundCommand>,
    view: watch::Receiver<RoundView>,
}

impl RoundHandle {
    pub fn kind(&self) -> GameKind {
        self.kind
    }

    pub fn round_id(&self) -> u64 {
        self.round_id
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> RoundView {
        self.view.borrow().clone()
    }

    /// Receiver that is notified on every snapshot change
    pub fn watch(&self) -> watch::Receiver<RoundView> {
        self.view.clone()
    }

    fn unavailable(&self) -> EngineError {
        EngineError::ActorUnavailable {
            kind: self.kind,
            round_id: self.round_id,
        }
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<EngineResult<T>>) -> RoundCommand,
    ) -> EngineResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| self.unavailable())?;
        rx.await.map_err(|_| self.unavailable())?
    }

    pub async fn place_bet(
        &self,
        participant: Participant,
        amount: u64,
        prediction: Option<Prediction>,
    ) -> EngineResult<Bet> {
        self.call(|reply| RoundCommand::PlaceBet {
            participant,
            amount,
            prediction,
            reply,
        })
        .await
    }

    pub async fn lock(&self) -> EngineResult<RoundView> {
        self.call(|reply| RoundCommand::Lock { reply }).await
    }

    pub async fn resolve(&self) -> EngineResult<RoundView> {
        self.call(|reply| RoundCommand::Resolve { reply }).await
    }

    pub async fn settle(&self) -> EngineResult<SettleStatus> {
        self.call(|reply| RoundCommand::Settle { reply }).await
    }

    pub async fn abort(&self, reason: String) -> EngineResult<PayoutPlan> {
        self.call(|reply| RoundCommand::Abort { reason, reply }).await
    }
}

/// Shared collaborators of every round actor
#[derive(Clone)]
struct ActorContext {
    ledger: Arc<LedgerAdapter>,
    seeds: Arc<dyn SeedSource>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

/// Single writer of one round
struct RoundActor {
    round: Round,
    ctx: ActorContext,
    view: watch::Sender<RoundView>,
}

impl RoundActor {
    async fn run(mut self, mut commands: mpsc::Receiver<RoundCommand>) {
        let (kind, round_id) = (self.round.kind(), self.round.round_id());
        debug!(%kind, round_id, "round actor started");

        // The snapshot is refreshed before replying so callers read their own writes
        while let Some(command) = commands.recv().await {
            match command {
                RoundCommand::PlaceBet {
                    participant,
                    amount,
                    prediction,
                    reply,
                } => {
                    let result = self.place_bet(participant, amount, prediction).await;
                    self.refresh_view();
                    let _ = reply.send(result);
                }
                RoundCommand::Lock { reply } => {
                    let result = self.lock_and_resolve().await;
                    self.refresh_view();
                    let _ = reply.send(result);
                }
                RoundCommand::Resolve { reply } => {
                    let result = self.resolve().await.map(|_| self.round.view());
                    self.refresh_view();
                    let _ = reply.send(result);
                }
                RoundCommand::Settle { reply } => {
                    let result = self.settle().await;
                    self.refresh_view();
                    let _ = reply.send(result);
                }
                RoundCommand::Abort { reason, reply } => {
                    let result = self.abort(reason).await;
                    self.refresh_view();
                    let _ = reply.send(result);
                }
            }
        }

        debug!(%kind, round_id, "round actor stopped");
    }

    fn now(&self) -> u64 {
        self.ctx.clock.now_millis()
    }

    fn refresh_view(&self) {
        self.view.send_replace(self.round.view());
    }

    fn publish(&self, payload: EventPayload) {
        self.ctx
            .events
            .publish(self.round.kind(), self.round.round_id(), self.now(), payload);
    }

    async fn place_bet(
        &mut self,
        participant: Participant,
        amount: u64,
        prediction: Option<Prediction>,
    ) -> EngineResult<Bet> {
        let now = self.now();
        self.round
            .validate_bet(&participant, amount, prediction.as_ref(), now)?;

        let (kind, round_id) = (self.round.kind(), self.round.round_id());
        self.ctx
            .ledger
            .deposit(kind, round_id, &participant, amount)
            .await
            .map_err(|e| match e {
                LedgerError::Rejected(Rejection::RoundClosed) => BetRejection::TooLate.into(),
                LedgerError::Rejected(Rejection::BelowMinimum { minimum }) => {
                    BetRejection::BelowMinimum { amount, minimum }.into()
                }
                LedgerError::Rejected(Rejection::RoundFull { max }) => {
                    BetRejection::RoundFull { max }.into()
                }
                other => EngineError::Ledger(other),
            })?;

        let bet = self.round.append_bet(participant, amount, prediction, now)?;
        debug!(%kind, round_id, participant = %bet.participant, amount, "bet accepted");
        self.publish(EventPayload::BetAccepted {
            bet: bet.clone(),
            total_stake: self.round.total_stake(),
        });
        Ok(bet)
    }

    async fn lock_and_resolve(&mut self) -> EngineResult<RoundView> {
        if self.round.lock()? {
            info!(
                kind = %self.round.kind(),
                round_id = self.round.round_id(),
                bets = self.round.bets().len(),
                total_stake = self.round.total_stake(),
                "round locked"
            );
            self.publish(EventPayload::RoundLocked {
                bet_count: self.round.bets().len(),
                total_stake: self.round.total_stake(),
            });
        }
        self.resolve().await?;
        Ok(self.round.view())
    }

    async fn resolve(&mut self) -> EngineResult<()> {
        match self.round.phase() {
            RoundPhase::Locked => {
                let resolved = self.resolve_locked().await;
                self.submit_refunds().await;
                resolved
            }
            RoundPhase::Resolving | RoundPhase::Settled => Ok(()),
            RoundPhase::Open | RoundPhase::Aborted => Err(EngineError::Phase {
                kind: self.round.kind(),
                round_id: self.round.round_id(),
                expected: RoundPhase::Locked,
                actual: self.round.phase(),
            }),
        }
    }

    async fn resolve_locked(&mut self) -> EngineResult<()> {
        let (kind, round_id) = (self.round.kind(), self.round.round_id());

        let reconciliation = self
            .ctx
            .ledger
            .reconcile(kind, round_id, self.round.bets())
            .await?;
        if reconciliation.orphaned > 0 {
            // Deposits without a prediction cannot be settled, only refunded
            let reason = format!(
                "{} ledger deposits have no matching bet",
                reconciliation.orphaned
            );
            warn!(%kind, round_id, %reason, "aborting round");
            self.enter_unsettled_abort(reason, Some(reconciliation.ledger_bets))?;
            return Ok(());
        }
        if reconciliation.diverged() {
            self.round.replace_bets(reconciliation.bets)?;
        }

        let rules = *self.round.rules();
        let revealed = self
            .ctx
            .seeds
            .reveal(self.round.commitment())
            .and_then(|reveal| {
                outcome::resolve(self.round.commitment(), &reveal, &rules.crash, self.round.bets())
                    .map(|outcome| (reveal, outcome))
            });

        let (reveal, outcome) = match revealed {
            Ok(pair) => pair,
            Err(seed_error) => {
                error!(%kind, round_id, error = %seed_error, "seed failed verification, aborting round");
                self.enter_unsettled_abort(seed_error.to_string(), None)?;
                return Err(seed_error.into());
            }
        };

        let plan = compute_payouts(kind, &outcome, self.round.bets(), &rules.fees);
        if !plan.within_bounds(kind.payout_ratio(rules.fees.max_cashout)) {
            return Err(EngineError::Internal(format!(
                "payout plan of {}#{} exceeds the {} payout ratio",
                kind, round_id, kind
            )));
        }

        self.round.begin_resolving(outcome, reveal, plan, self.now())?;
        info!(%kind, round_id, ?outcome, "round resolved");
        self.publish(EventPayload::RoundResolved { outcome });
        Ok(())
    }

    async fn settle(&mut self) -> EngineResult<SettleStatus> {
        match self.round.phase() {
            RoundPhase::Settled => {
                // Cached; the ledger is not contacted again
                let payouts = self
                    .round
                    .payouts()
                    .cloned()
                    .ok_or_else(|| EngineError::Internal("settled round without payouts".into()))?;
                Ok(SettleStatus::Settled { payouts })
            }
            RoundPhase::Aborted => Ok(self.settle_aborted().await),
            RoundPhase::Locked => {
                let resolved = self.resolve_locked().await;
                if self.round.phase() == RoundPhase::Aborted {
                    let status = self.settle_aborted().await;
                    return resolved.map(|_| status);
                }
                resolved?;
                self.settle_resolving().await
            }
            RoundPhase::Resolving => self.settle_resolving().await,
            RoundPhase::Open => Err(EngineError::Phase {
                kind: self.round.kind(),
                round_id: self.round.round_id(),
                expected: RoundPhase::Resolving,
                actual: RoundPhase::Open,
            }),
        }
    }

    async fn settle_aborted(&mut self) -> SettleStatus {
        if let Some(status) = self.submit_refunds().await {
            return status;
        }
        SettleStatus::Refunded {
            refunds: self.round.refunds().cloned().unwrap_or_else(|| PayoutPlan {
                payouts: Vec::new(),
                platform_fee: 0,
                total_stake: 0,
            }),
        }
    }

    /// Settles once a crash round's flight has reached its crash point
    async fn settle_resolving(&mut self) -> EngineResult<SettleStatus> {
        if let Some(flight) = self.round.flight_at(self.now()) {
            return Ok(SettleStatus::InFlight { flight });
        }
        self.submit_settlement().await
    }

    /// Locked or Resolving → Aborted, announcing the refunds
    fn enter_unsettled_abort(
        &mut self,
        reason: String,
        ledger_bets: Option<Vec<Bet>>,
    ) -> EngineResult<()> {
        let refunds = self.round.abort_unsettled(reason.clone(), ledger_bets)?;
        self.publish(EventPayload::RoundAborted { reason, refunds });
        Ok(())
    }

    async fn submit_settlement(&mut self) -> EngineResult<SettleStatus> {
        let (kind, round_id) = (self.round.kind(), self.round.round_id());
        let record = self.round.settlement_record(self.now())?;

        let submitted = match self.ctx.ledger.submit_settlement(record.clone()).await {
            Ok(submitted) => submitted,
            Err(LedgerError::Rejected(rejection)) => {
                let reason = format!("ledger refused settlement: {}", rejection);
                error!(%kind, round_id, %reason, "aborting round");
                let ledger_bets = match self.ctx.ledger.reconcile(kind, round_id, self.round.bets()).await {
                    Ok(reconciliation) => Some(reconciliation.ledger_bets),
                    Err(e) => {
                        warn!(%kind, round_id, error = %e, "could not read deposits, refunding local bets");
                        None
                    }
                };
                self.enter_unsettled_abort(reason, ledger_bets)?;
                return Ok(self.settle_aborted().await);
            }
            Err(e) => return Err(e.into()),
        };

        match submitted {
            SettlementOutcome::Confirmed(_) => {
                self.round.mark_settled(self.now())?;
                info!(%kind, round_id, paid = record.plan.total_paid(), fee = record.plan.platform_fee, "round settled");
                self.publish(EventPayload::RoundSettled {
                    payouts: record.plan.clone(),
                });
                Ok(SettleStatus::Settled { payouts: record.plan })
            }
            SettlementOutcome::AlreadySettled(theirs) => {
                if theirs.plan != record.plan || theirs.outcome != record.outcome {
                    warn!(%kind, round_id, "ledger settlement differs from local computation");
                }
                let payouts = theirs.plan.clone();
                self.round.adopt_ledger_settlement(theirs, self.now())?;
                self.publish(EventPayload::RoundSettled {
                    payouts: payouts.clone(),
                });
                Ok(SettleStatus::Settled { payouts })
            }
            SettlementOutcome::Delayed { attempts, reason } => {
                self.publish(EventPayload::SettlementDelayed {
                    attempts,
                    reason: reason.clone(),
                });
                Ok(SettleStatus::Delayed { attempts, reason })
            }
        }
    }

    async fn abort(&mut self, reason: String) -> EngineResult<PayoutPlan> {
        let refunds = self.round.abort(reason.clone())?;
        info!(
            kind = %self.round.kind(),
            round_id = self.round.round_id(),
            %reason,
            bets = self.round.bets().len(),
            "round aborted"
        );
        self.publish(EventPayload::RoundAborted {
            reason,
            refunds: refunds.clone(),
        });
        self.submit_refunds().await;
        Ok(refunds)
    }

    /// Sends pending refunds. Returns a status only when they were not confirmed.
    async fn submit_refunds(&mut self) -> Option<SettleStatus> {
        if !self.round.refund_pending() {
            return None;
        }
        let (kind, round_id) = (self.round.kind(), self.round.round_id());
        let refunds = self.round.refunds().cloned()?;
        let reason = self.round.abort_reason().unwrap_or("aborted").to_string();

        match self.ctx.ledger.refund(kind, round_id, &refunds, &reason).await {
            Ok(SettlementOutcome::Confirmed(_)) => {
                info!(%kind, round_id, "refunds confirmed");
                self.round.confirm_refunds();
                None
            }
            Ok(SettlementOutcome::AlreadySettled(_)) => {
                error!(%kind, round_id, "ledger settled a round that was aborted locally");
                self.round.confirm_refunds();
                None
            }
            Ok(SettlementOutcome::Delayed { attempts, reason }) => {
                self.publish(EventPayload::SettlementDelayed {
                    attempts,
                    reason: reason.clone(),
                });
                Some(SettleStatus::Delayed { attempts, reason })
            }
            Err(e) => {
                // Only unavailability is retried; anything else will not change
                error!(%kind, round_id, error = %e, "ledger refused refunds, manual reconciliation needed");
                self.round.refunds_refused(e.to_string());
                None
            }
        }
    }
}

/// Command facade over all rounds
pub struct RoundEngine {
    ctx: ActorContext,
    registry: Arc<RoundRegistry>,
    settings: EngineSettings,
    open_lock: Mutex<()>,
}

impl RoundEngine {
    pub fn new(
        ledger: Arc<LedgerAdapter>,
        seeds: Arc<dyn SeedSource>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        let events = EventBus::new(settings.event_capacity);
        Self {
            ctx: ActorContext {
                ledger,
                seeds,
                clock,
                events,
            },
            registry: Arc::new(RoundRegistry::new(settings.history_limit)),
            settings,
            open_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<RoundRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.ctx.events
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.ctx.clock
    }

    pub fn seeds(&self) -> &Arc<dyn SeedSource> {
        &self.ctx.seeds
    }

    fn game(&self, kind: GameKind) -> EngineResult<&GameSettings> {
        self.settings
            .game(kind)
            .filter(|g| g.enabled)
            .ok_or_else(|| EngineError::Internal(format!("{} is not enabled", kind)))
    }

    /// Opens a round with a caller-supplied commitment
    pub async fn open_round(
        &self,
        kind: GameKind,
        lock_at: u64,
        commitment: SeedCommitment,
    ) -> EngineResult<RoundView> {
        let _guard = self.open_lock.lock().await;
        self.open_locked(kind, lock_at, commitment).await
    }

    /// Opens the next round of `kind` with the configured duration
    pub async fn open_next_round(&self, kind: GameKind) -> EngineResult<RoundView> {
        let _guard = self.open_lock.lock().await;
        let settings = self.game(kind)?;

        self.retire_finished(kind);
        if let Some(active) = self.registry.active_round(kind) {
            return Err(EngineError::RoundAlreadyActive {
                kind,
                round_id: active.round_id,
            });
        }

        let round_id = self.ctx.ledger.next_round_id(kind).await?;
        let lock_at = self.ctx.clock.now_millis() + settings.round_duration_ms;
        let commitment = self.ctx.seeds.commit(kind, round_id, lock_at)?;
        let opened = self.open_locked(kind, lock_at, commitment).await;
        if let Err(e) = &opened {
            // The next attempt commits afresh with a new lock time
            warn!(%kind, round_id, error = %e, "round did not open, discarding its commitment");
            self.ctx.seeds.release(kind, round_id);
        }
        opened
    }

    async fn open_locked(
        &self,
        kind: GameKind,
        lock_at: u64,
        commitment: SeedCommitment,
    ) -> EngineResult<RoundView> {
        let settings = *self.game(kind)?;
        let round_id = commitment.round_id;

        self.retire_finished(kind);
        if let Some(active) = self.registry.active_round(kind) {
            return Err(EngineError::RoundAlreadyActive {
                kind,
                round_id: active.round_id,
            });
        }
        if commitment.input_message != input_message(kind, round_id, lock_at) {
            return Err(EngineError::CommitmentMismatch {
                kind,
                round_id,
                reason: format!("commitment was made for '{}'", commitment.input_message),
            });
        }

        let now = self.ctx.clock.now_millis();
        let round = Round::new(
            kind,
            round_id,
            now,
            lock_at,
            commitment.clone(),
            self.ctx.ledger.address(kind, round_id),
            settings.rules,
        )?;
        self.ctx
            .ledger
            .create_round(kind, round_id, now, lock_at)
            .await?;

        let (view_tx, view_rx) = watch::channel(round.view());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let handle = RoundHandle {
            kind,
            round_id,
            commands: command_tx,
            view: view_rx,
        };
        self.registry.activate(handle.clone())?;

        let actor = RoundActor {
            round,
            ctx: self.ctx.clone(),
            view: view_tx,
        };
        tokio::spawn(actor.run(command_rx));

        info!(%kind, round_id, lock_at, digest = %commitment.digest, "round opened");
        self.ctx.events.publish(
            kind,
            round_id,
            now,
            EventPayload::RoundOpened {
                lock_at,
                commitment,
            },
        );
        Ok(handle.snapshot())
    }

    fn handle(&self, kind: GameKind, round_id: u64) -> EngineResult<RoundHandle> {
        self.registry
            .handle(kind, round_id)
            .ok_or(EngineError::RoundNotFound { kind, round_id })
    }

    pub async fn place_bet(
        &self,
        kind: GameKind,
        round_id: u64,
        participant: Participant,
        amount: u64,
        prediction: Option<Prediction>,
    ) -> EngineResult<Bet> {
        match self.registry.handle(kind, round_id) {
            Some(handle) => handle.place_bet(participant, amount, prediction).await,
            // Retired rounds are past their lock
            None if self.registry.find(kind, round_id).is_some() => {
                Err(BetRejection::TooLate.into())
            }
            None => Err(EngineError::RoundNotFound { kind, round_id }),
        }
    }

    /// Locks the round (idempotent) and resolves it
    pub async fn request_lock(&self, kind: GameKind, round_id: u64) -> EngineResult<RoundView> {
        self.handle(kind, round_id)?.lock().await
    }

    pub async fn request_resolve(&self, kind: GameKind, round_id: u64) -> EngineResult<RoundView> {
        self.handle(kind, round_id)?.resolve().await
    }

    pub async fn settle(&self, kind: GameKind, round_id: u64) -> EngineResult<SettleStatus> {
        self.handle(kind, round_id)?.settle().await
    }

    pub async fn abort(
        &self,
        kind: GameKind,
        round_id: u64,
        reason: impl Into<String>,
    ) -> EngineResult<PayoutPlan> {
        self.handle(kind, round_id)?.abort(reason.into()).await
    }

    /// Moves a finished active round to history and releases its seed
    pub fn retire_finished(&self, kind: GameKind) -> Option<RoundView> {
        let view = self.registry.retire_finished(kind)?;
        self.ctx.seeds.release(kind, view.round_id);
        Some(view)
    }

    pub fn active_round(&self, kind: GameKind) -> Option<RoundView> {
        self.registry.active_round(kind)
    }

    pub fn round(&self, kind: GameKind, round_id: u64) -> Option<RoundView> {
        self.registry.find(kind, round_id)
    }

    pub fn history(&self, kind: GameKind, limit: usize) -> Vec<RoundView> {
        self.registry.history(kind, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::errors::ErrorCategory;
    use crate::games::types::{CoinSide, Multiplier, Outcome};
    use crate::games::vrf_engine::HashChainSeedSource;
    use crate::ledger::{InMemoryLedger, Ledger, RetryPolicy};

    const MIN: u64 = 100_000_000;

    struct Fixture {
        engine: RoundEngine,
        ledger: Arc<InMemoryLedger>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        fixture_with(EngineSettings::default())
    }

    fn fixture_with(settings: EngineSettings) -> Fixture {
        let ledger = Arc::new(InMemoryLedger::default());
        let clock = Arc::new(ManualClock::new(1_000));
        let adapter = LedgerAdapter::new(
            ledger.clone(),
            "engine-test",
            RetryPolicy {
                max_attempts: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
            },
        );
        let engine = RoundEngine::new(
            Arc::new(adapter),
            Arc::new(HashChainSeedSource::from_passphrase("engine")),
            clock.clone(),
            settings,
        );
        Fixture {
            engine,
            ledger,
            clock,
        }
    }

    #[tokio::test]
    async fn test_one_active_round_per_kind() {
        let f = fixture();
        let first = f.engine.open_next_round(GameKind::BinaryFlip).await.unwrap();
        assert_eq!(first.round_id, 1);
        assert_eq!(first.phase, RoundPhase::Open);

        let second = f.engine.open_next_round(GameKind::BinaryFlip).await;
        assert!(matches!(second, Err(EngineError::RoundAlreadyActive { round_id: 1, .. })));

        // Other kinds are independent
        assert!(f.engine.open_next_round(GameKind::WeightedPool).await.is_ok());
    }

    #[tokio::test]
    async fn test_flip_round_end_to_end() {
        let f = fixture();
        let round = f.engine.open_next_round(GameKind::BinaryFlip).await.unwrap();
        let heads = Some(Prediction::Side { side: CoinSide::Heads });
        let tails = Some(Prediction::Side { side: CoinSide::Tails });

        f.engine
            .place_bet(GameKind::BinaryFlip, round.round_id, "h".into(), MIN, heads)
            .await
            .unwrap();
        f.engine
            .place_bet(GameKind::BinaryFlip, round.round_id, "t".into(), MIN, tails)
            .await
            .unwrap();

        let resolved = f.engine.request_lock(GameKind::BinaryFlip, round.round_id).await.unwrap();
        assert_eq!(resolved.phase, RoundPhase::Resolving);
        assert!(resolved.payouts.is_none());

        let status = f.engine.settle(GameKind::BinaryFlip, round.round_id).await.unwrap();
        let SettleStatus::Settled { payouts } = status else {
            panic!("expected settled, got {:?}", status);
        };
        assert_eq!(payouts.total_paid(), 198_000_000);
        assert_eq!(payouts.platform_fee, 2_000_000);
    }

    #[tokio::test]
    async fn test_settle_is_idempotent() {
        let f = fixture();
        let round = f.engine.open_next_round(GameKind::WeightedPool).await.unwrap();
        f.engine
            .place_bet(GameKind::WeightedPool, round.round_id, "a".into(), MIN, None)
            .await
            .unwrap();
        f.engine.request_lock(GameKind::WeightedPool, round.round_id).await.unwrap();

        let first = f.engine.settle(GameKind::WeightedPool, round.round_id).await.unwrap();
        let second = f.engine.settle(GameKind::WeightedPool, round.round_id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.ledger.settle_attempts(), 1);
    }

    #[tokio::test]
    async fn test_late_bet_is_timing_error() {
        let f = fixture();
        let round = f.engine.open_next_round(GameKind::WeightedPool).await.unwrap();
        f.clock.set(round.lock_at);

        let err = f
            .engine
            .place_bet(GameKind::WeightedPool, round.round_id, "late".into(), MIN, None)
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::TimingError);
    }

    #[tokio::test]
    async fn test_failed_deposit_leaves_round_untouched() {
        let f = fixture();
        let round = f.engine.open_next_round(GameKind::WeightedPool).await.unwrap();
        f.ledger.fail_next(1);

        let err = f
            .engine
            .place_bet(GameKind::WeightedPool, round.round_id, "a".into(), MIN, None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        let view = f.engine.round(GameKind::WeightedPool, round.round_id).unwrap();
        assert!(view.bets.is_empty());
        assert_eq!(view.total_stake, 0);
    }

    #[tokio::test]
    async fn test_open_round_rejects_mismatched_commitment() {
        let f = fixture();
        let lock_at = 5_000;
        let commitment = HashChainSeedSource::from_passphrase("other")
            .commit(GameKind::RisingMultiplier, 1, lock_at + 1)
            .unwrap();
        let result = f
            .engine
            .open_round(GameKind::RisingMultiplier, lock_at, commitment)
            .await;
        assert!(matches!(result, Err(EngineError::CommitmentMismatch { .. })));
        assert!(f.engine.active_round(GameKind::RisingMultiplier).is_none());
    }

    #[tokio::test]
    async fn test_crash_bet_needs_valid_target() {
        let f = fixture();
        let round = f.engine.open_next_round(GameKind::RisingMultiplier).await.unwrap();
        let err = f
            .engine
            .place_bet(
                GameKind::RisingMultiplier,
                round.round_id,
                "a".into(),
                MIN,
                Some(Prediction::AutoCashout { target: Multiplier::ONE }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::ValidationError);
    }

    #[tokio::test]
    async fn test_crash_round_settles_after_flight() {
        let mut settings = EngineSettings::default();
        if let Some(crash) = settings.games.get_mut(&GameKind::RisingMultiplier) {
            // No instant crashes, so there is always a flight
            crash.rules.crash.house_edge_bps = 0;
        }
        let f = fixture_with(settings);
        let kind = GameKind::RisingMultiplier;
        let round = f.engine.open_next_round(kind).await.unwrap();
        let target = Some(Prediction::AutoCashout { target: Multiplier::MIN_TARGET });
        f.engine
            .place_bet(kind, round.round_id, "a".into(), MIN, target)
            .await
            .unwrap();

        f.clock.set(round.lock_at);
        let resolved = f.engine.request_lock(kind, round.round_id).await.unwrap();
        let Some(Outcome::Crash { crash_point }) = resolved.outcome else {
            panic!("expected a crash outcome, got {:?}", resolved.outcome);
        };
        let ends_at = resolved.flight_ends_at.unwrap();
        assert!(ends_at > round.lock_at);

        let status = f.engine.settle(kind, round.round_id).await.unwrap();
        let SettleStatus::InFlight { flight } = status else {
            panic!("expected the flight to be under way, got {:?}", status);
        };
        assert_eq!(flight.elapsed_ms, 0);
        assert_eq!(flight.remaining_ms, ends_at - round.lock_at);
        assert_eq!(f.ledger.settle_attempts(), 0);

        f.clock.set(ends_at - 1);
        let status = f.engine.settle(kind, round.round_id).await.unwrap();
        assert!(matches!(status, SettleStatus::InFlight { flight } if flight.multiplier <= crash_point));

        f.clock.set(ends_at);
        let status = f.engine.settle(kind, round.round_id).await.unwrap();
        let SettleStatus::Settled { payouts } = status else {
            panic!("expected settled after the crash point, got {:?}", status);
        };
        let expected = if Multiplier::MIN_TARGET < crash_point { 101_000_000 } else { 0 };
        assert_eq!(payouts.amount_for(&"a".into()), Some(expected));
        assert_eq!(f.ledger.settle_attempts(), 1);
    }

    #[tokio::test]
    async fn test_stake_overflow_keeps_round_alive() {
        let f = fixture();
        let kind = GameKind::WeightedPool;
        let round = f.engine.open_next_round(kind).await.unwrap();
        let half = u64::MAX / 2 + 1;

        f.engine.place_bet(kind, round.round_id, "a".into(), half, None).await.unwrap();
        let err = f
            .engine
            .place_bet(kind, round.round_id, "b".into(), half, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BetRejected(BetRejection::StakeOverflow { .. })));
        assert_eq!(err.category(), ErrorCategory::ValidationError);

        f.engine.place_bet(kind, round.round_id, "c".into(), MIN, None).await.unwrap();
        let view = f.engine.round(kind, round.round_id).unwrap();
        assert_eq!(view.bets.len(), 2);
        assert_eq!(view.total_stake, half + MIN);

        let resolved = f.engine.request_lock(kind, round.round_id).await.unwrap();
        assert_eq!(resolved.phase, RoundPhase::Resolving);
        let status = f.engine.settle(kind, round.round_id).await.unwrap();
        assert!(matches!(status, SettleStatus::Settled { .. }));
    }

    #[tokio::test]
    async fn test_orphaned_deposit_aborts_and_refunds_ledger_stakes() {
        let f = fixture();
        let kind = GameKind::BinaryFlip;
        let round = f.engine.open_next_round(kind).await.unwrap();
        let heads = Some(Prediction::Side { side: CoinSide::Heads });
        f.engine
            .place_bet(kind, round.round_id, "a".into(), MIN, heads)
            .await
            .unwrap();
        // Deposited on the ledger without going through the engine
        f.ledger
            .deposit(crate::ledger::DepositRequest {
                address: round.ledger_address.clone(),
                kind,
                round_id: round.round_id,
                participant: "b".into(),
                amount: 2 * MIN,
            })
            .await
            .unwrap();

        let view = f.engine.request_lock(kind, round.round_id).await.unwrap();
        assert_eq!(view.phase, RoundPhase::Aborted);
        assert!(!view.refund_pending);
        let refunds = view.refunds.unwrap();
        assert_eq!(refunds.amount_for(&"a".into()), Some(MIN));
        assert_eq!(refunds.amount_for(&"b".into()), Some(2 * MIN));
        assert_eq!(f.ledger.settle_attempts(), 0);
        assert!(f.ledger.read_round(kind, round.round_id).await.unwrap().refunded);

        let next = f.engine.open_next_round(kind).await.unwrap();
        assert_eq!(next.round_id, round.round_id + 1);
    }

    #[tokio::test]
    async fn test_refused_settlement_ends_round() {
        let f = fixture();
        let kind = GameKind::BinaryFlip;
        let round = f.engine.open_next_round(kind).await.unwrap();
        let tails = Some(Prediction::Side { side: CoinSide::Tails });
        f.engine
            .place_bet(kind, round.round_id, "a".into(), MIN, tails)
            .await
            .unwrap();
        f.engine.request_lock(kind, round.round_id).await.unwrap();

        // A deposit that lands after resolution makes the ledger refuse the plan
        f.ledger
            .deposit(crate::ledger::DepositRequest {
                address: round.ledger_address.clone(),
                kind,
                round_id: round.round_id,
                participant: "late".into(),
                amount: MIN,
            })
            .await
            .unwrap();

        let status = f.engine.settle(kind, round.round_id).await.unwrap();
        let SettleStatus::Refunded { refunds } = status else {
            panic!("expected refunds, got {:?}", status);
        };
        assert_eq!(refunds.amount_for(&"a".into()), Some(MIN));
        assert_eq!(refunds.amount_for(&"late".into()), Some(MIN));

        let view = f.engine.round(kind, round.round_id).unwrap();
        assert_eq!(view.phase, RoundPhase::Aborted);
        assert!(view.is_finished());
        assert!(view.payouts.is_none());
        assert!(f.engine.retire_finished(kind).is_some());
    }
}
