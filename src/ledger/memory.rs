use super::{
    ConfigAccount, CreateRoundRequest, DepositEntry, DepositReceipt, DepositRequest,
    GameGroundAccount, Ledger, RefundRequest, SettlementReceipt, SettlementRecord,
};
use crate::errors::{LedgerError, LedgerResult, Rejection};
use crate::games::types::GameKind;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

#[derive(Default)]
struct LedgerState {
    configs: HashMap<GameKind, ConfigAccount>,
    rounds: HashMap<(GameKind, u64), GameGroundAccount>,
}

/// In-process ledger used by the CLI and the tests.
///
/// Supports fault injection: [`InMemoryLedger::fail_next`] makes the next calls
/// fail with `Unavailable`, and [`InMemoryLedger::settle_externally`] plays the
/// part of another writer settling a round first.
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    failures_pending: AtomicU32,
    settle_attempts: AtomicU64,
    refund_attempts: AtomicU64,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl InMemoryLedger {
    /// Ledger with the same config account for every game kind
    pub fn new(config: ConfigAccount) -> Self {
        let configs = GameKind::ALL
            .iter()
            .map(|kind| (*kind, config.clone()))
            .collect();
        Self {
            state: Mutex::new(LedgerState {
                configs,
                rounds: HashMap::new(),
            }),
            failures_pending: AtomicU32::new(0),
            settle_attempts: AtomicU64::new(0),
            refund_attempts: AtomicU64::new(0),
        }
    }

    /// Overrides the config account of one game kind
    pub async fn set_config(&self, kind: GameKind, config: ConfigAccount) {
        self.state.lock().await.configs.insert(kind, config);
    }

    /// Fails the next `count` calls with `LedgerError::Unavailable`
    pub fn fail_next(&self, count: u32) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Number of `settle` calls received, including failed ones
    pub fn settle_attempts(&self) -> u64 {
        self.settle_attempts.load(Ordering::SeqCst)
    }

    pub fn refund_attempts(&self) -> u64 {
        self.refund_attempts.load(Ordering::SeqCst)
    }

    /// Stores a settlement as if another writer had submitted it
    pub async fn settle_externally(&self, record: SettlementRecord) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        let account = state
            .rounds
            .get_mut(&(record.kind, record.round_id))
            .ok_or_else(|| LedgerError::NotFound(format!("{}#{}", record.kind, record.round_id)))?;
        apply_settlement(account, record);
        Ok(())
    }

    fn injected_failure(&self) -> LedgerResult<()> {
        let remaining = self.failures_pending.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .failures_pending
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(LedgerError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new(ConfigAccount {
            authority: "authority".to_string(),
            team_wallet: "team".to_string(),
            platform_fee_bps: 100,
            min_deposit: 100_000_000,
            max_participants: 100,
            round_counter: 0,
        })
    }
}

fn apply_settlement(account: &mut GameGroundAccount, record: SettlementRecord) {
    account.is_completed = true;
    account.winner = match account.kind {
        GameKind::WeightedPool => record
            .plan
            .payouts
            .iter()
            .find(|p| p.amount > 0)
            .map(|p| p.participant.clone()),
        _ => None,
    };
    account.settlement = Some(record);
}

fn round_mut<'a>(
    state: &'a mut LedgerState,
    kind: GameKind,
    round_id: u64,
) -> LedgerResult<&'a mut GameGroundAccount> {
    state
        .rounds
        .get_mut(&(kind, round_id))
        .ok_or_else(|| LedgerError::NotFound(format!("{}#{}", kind, round_id)))
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn read_config(&self, kind: GameKind) -> LedgerResult<ConfigAccount> {
        self.injected_failure()?;
        let state = self.state.lock().await;
        state
            .configs
            .get(&kind)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("config for {}", kind)))
    }

    async fn create_round(&self, request: CreateRoundRequest) -> LedgerResult<GameGroundAccount> {
        self.injected_failure()?;
        let mut state = self.state.lock().await;

        if let Some(existing) = state.rounds.get(&(request.kind, request.round_id)) {
            return Ok(existing.clone());
        }

        let config = state
            .configs
            .get_mut(&request.kind)
            .ok_or_else(|| LedgerError::NotFound(format!("config for {}", request.kind)))?;
        let expected = config.round_counter + 1;
        if request.round_id != expected {
            return Err(LedgerError::Rejected(Rejection::OutOfSequence {
                requested: request.round_id,
                expected,
            }));
        }
        config.round_counter = request.round_id;

        let account = GameGroundAccount {
            address: request.address,
            kind: request.kind,
            round_id: request.round_id,
            round_time_secs: request.end_date.saturating_sub(request.start_date) / 1_000,
            min_deposit: config.min_deposit,
            total_deposit: 0,
            user_count: 0,
            is_completed: false,
            deposits: Vec::new(),
            start_date: request.start_date,
            end_date: request.end_date,
            winner: None,
            settlement: None,
            refunded: false,
        };
        state
            .rounds
            .insert((request.kind, request.round_id), account.clone());
        Ok(account)
    }

    async fn deposit(&self, request: DepositRequest) -> LedgerResult<DepositReceipt> {
        self.injected_failure()?;
        let mut state = self.state.lock().await;
        let max_participants = state
            .configs
            .get(&request.kind)
            .map(|c| c.max_participants)
            .unwrap_or(u32::MAX);
        let account = round_mut(&mut state, request.kind, request.round_id)?;

        if account.is_completed {
            return Err(LedgerError::Rejected(Rejection::RoundClosed));
        }
        if request.amount < account.min_deposit {
            return Err(LedgerError::Rejected(Rejection::BelowMinimum {
                minimum: account.min_deposit,
            }));
        }
        let returning = account
            .deposits
            .iter()
            .any(|d| d.participant == request.participant);
        if !returning && account.user_count >= max_participants {
            return Err(LedgerError::Rejected(Rejection::RoundFull {
                max: max_participants,
            }));
        }

        let total_deposit = account
            .total_deposit
            .checked_add(request.amount)
            .ok_or_else(|| {
                LedgerError::Rejected(Rejection::Invalid(format!(
                    "deposit of {} would overflow the round total {}",
                    request.amount, account.total_deposit
                )))
            })?;

        account.deposits.push(DepositEntry {
            participant: request.participant,
            amount: request.amount,
        });
        account.total_deposit = total_deposit;
        if !returning {
            account.user_count += 1;
        }

        Ok(DepositReceipt {
            tx_id: uuid::Uuid::new_v4().to_string(),
            total_deposit: account.total_deposit,
            user_count: account.user_count,
        })
    }

    async fn settle(&self, record: SettlementRecord) -> LedgerResult<SettlementReceipt> {
        self.settle_attempts.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;
        let mut state = self.state.lock().await;
        let account = round_mut(&mut state, record.kind, record.round_id)?;

        if let Some(existing) = &account.settlement {
            return Err(LedgerError::Rejected(Rejection::AlreadySettled(Box::new(
                existing.clone(),
            ))));
        }
        if account.refunded {
            return Err(LedgerError::Rejected(Rejection::RoundClosed));
        }
        if record.plan.total_stake != account.total_deposit {
            return Err(LedgerError::Rejected(Rejection::Invalid(format!(
                "settlement stake {} does not match deposits {}",
                record.plan.total_stake, account.total_deposit
            ))));
        }

        let round_id = record.round_id;
        apply_settlement(account, record);
        Ok(SettlementReceipt {
            tx_id: uuid::Uuid::new_v4().to_string(),
            round_id,
            submitted_at: now_millis(),
        })
    }

    async fn refund(&self, request: RefundRequest) -> LedgerResult<SettlementReceipt> {
        self.refund_attempts.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;
        let mut state = self.state.lock().await;
        let account = round_mut(&mut state, request.kind, request.round_id)?;

        if let Some(existing) = &account.settlement {
            return Err(LedgerError::Rejected(Rejection::AlreadySettled(Box::new(
                existing.clone(),
            ))));
        }
        account.is_completed = true;
        account.refunded = true;

        Ok(SettlementReceipt {
            tx_id: uuid::Uuid::new_v4().to_string(),
            round_id: request.round_id,
            submitted_at: now_millis(),
        })
    }

    async fn read_round(&self, kind: GameKind, round_id: u64) -> LedgerResult<GameGroundAccount> {
        self.injected_failure()?;
        let state = self.state.lock().await;
        state
            .rounds
            .get(&(kind, round_id))
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("{}#{}", kind, round_id)))
    }
}
