use super::{
    ConfigAccount, CreateRoundRequest, DepositReceipt, DepositRequest, GameGroundAccount, Ledger,
    RefundRequest, RoundAddress, SettlementReceipt, SettlementRecord,
};
use crate::errors::{LedgerError, LedgerResult, Rejection};
use crate::games::types::{Bet, GameKind, Participant, PayoutPlan};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bounded exponential backoff for retryable ledger calls
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

/// Result of submitting a settlement or refund
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    Confirmed(SettlementReceipt),
    /// Someone else settled first; the ledger's record wins
    AlreadySettled(SettlementRecord),
    /// Retries ran out; try again on a later tick
    Delayed { attempts: u32, reason: String },
}

/// Bet list after matching the local snapshot against ledger deposits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub bets: Vec<Bet>,
    /// Local bets with no matching ledger deposit
    pub dropped: usize,
    /// Ledger deposits with no local bet that were added
    pub adopted: usize,
    /// Ledger deposits with no local bet that could not be added
    pub orphaned: usize,
    /// Every ledger deposit as a bet, with the local prediction where one matched
    pub ledger_bets: Vec<Bet>,
}

impl Reconciliation {
    pub fn diverged(&self) -> bool {
        self.dropped + self.adopted + self.orphaned > 0
    }
}

/// Ledger access with address derivation, retries and reconciliation
pub struct LedgerAdapter {
    ledger: Arc<dyn Ledger>,
    program_id: String,
    retry: RetryPolicy,
}

impl LedgerAdapter {
    pub fn new(ledger: Arc<dyn Ledger>, program_id: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            ledger,
            program_id: program_id.into(),
            retry,
        }
    }

    pub fn address(&self, kind: GameKind, round_id: u64) -> RoundAddress {
        RoundAddress::derive(&self.program_id, kind, round_id)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Runs `call` until it succeeds, fails terminally, or attempts run out
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, (u32, LedgerError)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LedgerResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(LedgerError::Unavailable(reason)) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "ledger unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err((attempt, e)),
            }
        }
    }

    pub async fn read_config(&self, kind: GameKind) -> LedgerResult<ConfigAccount> {
        self.with_retry("read_config", || self.ledger.read_config(kind))
            .await
            .map_err(|(_, e)| e)
    }

    /// Id the next round of `kind` must use
    pub async fn next_round_id(&self, kind: GameKind) -> LedgerResult<u64> {
        Ok(self.read_config(kind).await?.round_counter + 1)
    }

    pub async fn create_round(
        &self,
        kind: GameKind,
        round_id: u64,
        start_date: u64,
        end_date: u64,
    ) -> LedgerResult<GameGroundAccount> {
        let request = CreateRoundRequest {
            address: self.address(kind, round_id),
            kind,
            round_id,
            start_date,
            end_date,
        };
        self.with_retry("create_round", || self.ledger.create_round(request.clone()))
            .await
            .map_err(|(_, e)| e)
    }

    /// Deposits are not retried: a lost response could double-charge
    pub async fn deposit(
        &self,
        kind: GameKind,
        round_id: u64,
        participant: &Participant,
        amount: u64,
    ) -> LedgerResult<DepositReceipt> {
        self.ledger
            .deposit(DepositRequest {
                address: self.address(kind, round_id),
                kind,
                round_id,
                participant: participant.clone(),
                amount,
            })
            .await
    }

    pub async fn read_round(&self, kind: GameKind, round_id: u64) -> LedgerResult<GameGroundAccount> {
        self.with_retry("read_round", || self.ledger.read_round(kind, round_id))
            .await
            .map_err(|(_, e)| e)
    }

    pub async fn submit_settlement(&self, record: SettlementRecord) -> LedgerResult<SettlementOutcome> {
        let (kind, round_id) = (record.kind, record.round_id);
        let result = self
            .with_retry("settle", || self.ledger.settle(record.clone()))
            .await;
        self.classify(kind, round_id, result)
    }

    pub async fn refund(
        &self,
        kind: GameKind,
        round_id: u64,
        refunds: &PayoutPlan,
        reason: &str,
    ) -> LedgerResult<SettlementOutcome> {
        let request = RefundRequest {
            address: self.address(kind, round_id),
            kind,
            round_id,
            refunds: refunds.clone(),
            reason: reason.to_string(),
        };
        let result = self
            .with_retry("refund", || self.ledger.refund(request.clone()))
            .await;
        self.classify(kind, round_id, result)
    }

    fn classify(
        &self,
        kind: GameKind,
        round_id: u64,
        result: Result<SettlementReceipt, (u32, LedgerError)>,
    ) -> LedgerResult<SettlementOutcome> {
        match result {
            Ok(receipt) => {
                info!(%kind, round_id, tx_id = %receipt.tx_id, "ledger confirmed round");
                Ok(SettlementOutcome::Confirmed(receipt))
            }
            Err((_, LedgerError::Rejected(Rejection::AlreadySettled(record)))) => {
                warn!(%kind, round_id, "round already settled on ledger, adopting ledger record");
                Ok(SettlementOutcome::AlreadySettled(*record))
            }
            Err((attempts, LedgerError::Unavailable(reason))) => {
                warn!(%kind, round_id, attempts, %reason, "settlement delayed");
                Ok(SettlementOutcome::Delayed { attempts, reason })
            }
            Err((_, e)) => Err(e),
        }
    }

    /// Matches the local bet snapshot against the ledger deposit list.
    ///
    /// The ledger is authoritative: local bets without a deposit are dropped.
    /// Deposits without a local bet are adopted for the pool game only, since
    /// the other games need a prediction the ledger does not store. Those
    /// still appear in `ledger_bets` so they can be refunded.
    pub async fn reconcile(
        &self,
        kind: GameKind,
        round_id: u64,
        local: &[Bet],
    ) -> LedgerResult<Reconciliation> {
        let account = self.read_round(kind, round_id).await?;
        let reconciliation = match_deposits(kind, &account, local);

        if reconciliation.diverged() {
            warn!(
                %kind,
                round_id,
                dropped = reconciliation.dropped,
                adopted = reconciliation.adopted,
                orphaned = reconciliation.orphaned,
                "local bets diverged from ledger deposits"
            );
        } else {
            debug!(%kind, round_id, bets = local.len(), "bets reconciled with ledger");
        }
        Ok(reconciliation)
    }
}

fn match_deposits(kind: GameKind, account: &GameGroundAccount, local: &[Bet]) -> Reconciliation {
    let mut used = vec![false; local.len()];
    let mut bets = Vec::with_capacity(account.deposits.len());
    let mut ledger_bets = Vec::with_capacity(account.deposits.len());
    let mut adopted = 0;
    let mut orphaned = 0;
    let fallback_time = local.last().map(|b| b.placed_at).unwrap_or(account.start_date);

    for deposit in &account.deposits {
        let matched = local.iter().enumerate().find(|(i, bet)| {
            !used[*i] && bet.participant == deposit.participant && bet.amount == deposit.amount
        });
        let unmatched = || Bet {
            sequence: 0,
            participant: deposit.participant.clone(),
            amount: deposit.amount,
            prediction: None,
            placed_at: fallback_time,
        };
        match matched {
            Some((index, bet)) => {
                used[index] = true;
                bets.push(bet.clone());
                ledger_bets.push(bet.clone());
            }
            None if kind == GameKind::WeightedPool => {
                adopted += 1;
                bets.push(unmatched());
                ledger_bets.push(unmatched());
            }
            None => {
                orphaned += 1;
                ledger_bets.push(unmatched());
            }
        }
    }

    for list in [&mut bets, &mut ledger_bets] {
        for (sequence, bet) in list.iter_mut().enumerate() {
            bet.sequence = sequence as u32;
        }
    }

    Reconciliation {
        bets,
        dropped: used.iter().filter(|u| !**u).count(),
        adopted,
        orphaned,
        ledger_bets,
    }
}
