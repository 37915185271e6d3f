//! End-to-end round lifecycle tests against the in-memory ledger

use async_trait::async_trait;
use roundhouse::errors::{ErrorCategory, LedgerError, LedgerResult, SeedError};
use roundhouse::games::{
    compute_payouts, resolve, verify_reveal, Bet, CoinSide, CrashParams, FeeSchedule, GameKind,
    HashChainSeedSource, Outcome, Participant, Prediction, SeedCommitment, SeedReveal, SeedSource,
    VrfSeedSource,
};
use roundhouse::ledger::{
    ConfigAccount, CreateRoundRequest, DepositReceipt, DepositRequest, GameGroundAccount,
    InMemoryLedger, Ledger, LedgerAdapter, RefundRequest, RetryPolicy, SettlementReceipt,
    SettlementRecord,
};
use roundhouse::{
    EngineError, EngineSettings, ManualClock, RoundEngine, RoundEvent, RoundPhase, Scheduler,
    SettleStatus,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const START: u64 = 1_000;
const POOL_DURATION_MS: u64 = 60_000;
const ALICE_STAKE: u64 = 100_000_000;
const BOB_STAKE: u64 = 300_000_000;

struct Harness {
    engine: Arc<RoundEngine>,
    ledger: Arc<InMemoryLedger>,
    clock: Arc<ManualClock>,
}

fn harness(seeds: Arc<dyn SeedSource>, max_attempts: u32) -> Harness {
    let ledger = Arc::new(InMemoryLedger::default());
    let clock = Arc::new(ManualClock::new(START));
    let adapter = LedgerAdapter::new(
        ledger.clone(),
        "lifecycle",
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
        },
    );
    let engine = RoundEngine::new(
        Arc::new(adapter),
        seeds,
        clock.clone(),
        EngineSettings::default(),
    );
    Harness {
        engine: Arc::new(engine),
        ledger,
        clock,
    }
}

fn pool_bets() -> Vec<Bet> {
    vec![
        Bet {
            sequence: 0,
            participant: Participant::from("alice"),
            amount: ALICE_STAKE,
            prediction: None,
            placed_at: START,
        },
        Bet {
            sequence: 1,
            participant: Participant::from("bob"),
            amount: BOB_STAKE,
            prediction: None,
            placed_at: START,
        },
    ]
}

/// Deterministic seed source under which the first pool round is won by alice
fn seeds_where_alice_wins() -> HashChainSeedSource {
    let lock_at = START + POOL_DURATION_MS;
    (0..1_000)
        .map(|i| HashChainSeedSource::from_passphrase(&format!("pool-{}", i)))
        .find(|source| {
            let commitment = source.commit(GameKind::WeightedPool, 1, lock_at).unwrap();
            let reveal = source.reveal(&commitment).unwrap();
            matches!(
                resolve(&commitment, &reveal, &CrashParams::default(), &pool_bets()),
                Ok(Outcome::Pool { winner_index: Some(0), .. })
            )
        })
        .expect("a passphrase where the smaller stake wins")
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<RoundEvent>) -> Vec<&'static str> {
    let mut names = Vec::new();
    while let Ok(event) = rx.try_recv() {
        names.push(event.name());
    }
    names
}

#[tokio::test]
async fn test_weighted_pool_round_end_to_end() {
    let h = harness(Arc::new(seeds_where_alice_wins()), 3);
    let mut events = h.engine.events().subscribe();
    let kind = GameKind::WeightedPool;

    let round = h.engine.open_next_round(kind).await.unwrap();
    assert_eq!(round.round_id, 1);
    assert_eq!(round.lock_at, START + POOL_DURATION_MS);

    h.engine
        .place_bet(kind, 1, "alice".into(), ALICE_STAKE, None)
        .await
        .unwrap();
    h.engine
        .place_bet(kind, 1, "bob".into(), BOB_STAKE, None)
        .await
        .unwrap();

    h.clock.set(round.lock_at);
    let late = h
        .engine
        .place_bet(kind, 1, "carol".into(), ALICE_STAKE, None)
        .await
        .unwrap_err();
    assert_eq!(late.category(), ErrorCategory::TimingError);

    let resolved = h.engine.request_lock(kind, 1).await.unwrap();
    assert_eq!(resolved.phase, RoundPhase::Resolving);
    assert_eq!(resolved.bets.len(), 2);
    assert_eq!(resolved.total_stake, ALICE_STAKE + BOB_STAKE);
    assert!(resolved.payouts.is_none());

    let status = h.engine.settle(kind, 1).await.unwrap();
    let SettleStatus::Settled { payouts } = status else {
        panic!("expected a settled round, got {:?}", status);
    };
    assert_eq!(payouts.amount_for(&"alice".into()), Some(396_000_000));
    assert_eq!(payouts.amount_for(&"bob".into()), Some(0));
    assert_eq!(payouts.platform_fee, 4_000_000);
    assert_eq!(payouts.total_paid() + payouts.platform_fee, payouts.total_stake);

    // Anyone can audit the settled round from its public data
    let settled = h.engine.round(kind, 1).unwrap();
    let reveal = settled.reveal.clone().unwrap();
    verify_reveal(&settled.commitment, &reveal).unwrap();
    let outcome = resolve(&settled.commitment, &reveal, &CrashParams::default(), &settled.bets).unwrap();
    assert_eq!(Some(outcome), settled.outcome);
    assert_eq!(
        compute_payouts(kind, &outcome, &settled.bets, &FeeSchedule::default()),
        payouts
    );

    let account = h.ledger.read_round(kind, 1).await.unwrap();
    assert!(account.is_completed);
    assert_eq!(account.total_deposit, ALICE_STAKE + BOB_STAKE);
    assert_eq!(account.winner, Some(Participant::from("alice")));

    assert_eq!(
        drain(&mut events),
        vec![
            "round_opened",
            "bet_accepted",
            "bet_accepted",
            "round_locked",
            "round_resolved",
            "round_settled"
        ]
    );
}

#[tokio::test]
async fn test_settlement_submitted_once() {
    let h = harness(Arc::new(HashChainSeedSource::from_passphrase("once")), 3);
    let kind = GameKind::WeightedPool;
    let round = h.engine.open_next_round(kind).await.unwrap();
    h.engine
        .place_bet(kind, round.round_id, "alice".into(), ALICE_STAKE, None)
        .await
        .unwrap();
    h.engine.request_lock(kind, round.round_id).await.unwrap();

    let (first, second) = tokio::join!(
        h.engine.settle(kind, round.round_id),
        h.engine.settle(kind, round.round_id)
    );
    assert_eq!(first.unwrap(), second.unwrap());
    assert_eq!(h.ledger.settle_attempts(), 1);
}

#[tokio::test]
async fn test_settlement_retries_then_succeeds() {
    let h = harness(Arc::new(HashChainSeedSource::from_passphrase("retry")), 3);
    let kind = GameKind::BinaryFlip;
    let round = h.engine.open_next_round(kind).await.unwrap();
    h.engine.request_lock(kind, round.round_id).await.unwrap();

    h.ledger.fail_next(2);
    let status = h.engine.settle(kind, round.round_id).await.unwrap();
    assert!(matches!(status, SettleStatus::Settled { .. }));
    assert_eq!(h.ledger.settle_attempts(), 3);
}

#[tokio::test]
async fn test_exhausted_retries_leave_round_resolving() {
    let h = harness(Arc::new(HashChainSeedSource::from_passphrase("exhaust")), 2);
    let kind = GameKind::BinaryFlip;
    let round = h.engine.open_next_round(kind).await.unwrap();
    h.engine.request_lock(kind, round.round_id).await.unwrap();

    h.ledger.fail_next(2);
    let status = h.engine.settle(kind, round.round_id).await.unwrap();
    assert!(matches!(status, SettleStatus::Delayed { attempts: 2, .. }));
    assert_eq!(
        h.engine.round(kind, round.round_id).unwrap().phase,
        RoundPhase::Resolving
    );

    // The next attempt goes through
    let status = h.engine.settle(kind, round.round_id).await.unwrap();
    assert!(matches!(status, SettleStatus::Settled { .. }));
}

#[tokio::test]
async fn test_adopts_settlement_made_by_another_writer() {
    let h = harness(Arc::new(HashChainSeedSource::from_passphrase("adopt")), 3);
    let kind = GameKind::WeightedPool;
    let round = h.engine.open_next_round(kind).await.unwrap();
    h.engine
        .place_bet(kind, round.round_id, "alice".into(), ALICE_STAKE, None)
        .await
        .unwrap();
    let resolved = h.engine.request_lock(kind, round.round_id).await.unwrap();

    let outcome = resolved.outcome.unwrap();
    let mut plan = compute_payouts(kind, &outcome, &resolved.bets, &FeeSchedule::default());
    // The other writer charged a different fee
    plan.payouts[0].amount -= 1_000_000;
    plan.platform_fee += 1_000_000;
    let theirs = SettlementRecord {
        kind,
        round_id: round.round_id,
        outcome,
        reveal: resolved.reveal.clone().unwrap(),
        plan: plan.clone(),
        settled_at: START,
    };
    h.ledger.settle_externally(theirs).await.unwrap();

    let status = h.engine.settle(kind, round.round_id).await.unwrap();
    assert_eq!(status, SettleStatus::Settled { payouts: plan.clone() });
    let view = h.engine.round(kind, round.round_id).unwrap();
    assert_eq!(view.phase, RoundPhase::Settled);
    assert_eq!(view.payouts, Some(plan));
}

#[tokio::test]
async fn test_abort_refunds_every_stake() {
    let h = harness(Arc::new(HashChainSeedSource::from_passphrase("abort")), 3);
    let kind = GameKind::WeightedPool;
    let round = h.engine.open_next_round(kind).await.unwrap();
    for bet in pool_bets() {
        h.engine
            .place_bet(kind, round.round_id, bet.participant, bet.amount, None)
            .await
            .unwrap();
    }

    let refunds = h
        .engine
        .abort(kind, round.round_id, "maintenance")
        .await
        .unwrap();
    assert_eq!(refunds.amount_for(&"alice".into()), Some(ALICE_STAKE));
    assert_eq!(refunds.amount_for(&"bob".into()), Some(BOB_STAKE));
    assert_eq!(refunds.platform_fee, 0);
    assert_eq!(h.ledger.refund_attempts(), 1);

    let view = h.engine.round(kind, round.round_id).unwrap();
    assert_eq!(view.phase, RoundPhase::Aborted);
    assert!(!view.refund_pending);
    assert!(h.ledger.read_round(kind, round.round_id).await.unwrap().refunded);

    // Aborted rounds are terminal
    let err = h.engine.request_lock(kind, round.round_id).await.unwrap_err();
    assert!(matches!(err, EngineError::Phase { .. }));

    let next = h.engine.open_next_round(kind).await.unwrap();
    assert_eq!(next.round_id, round.round_id + 1);
    assert_eq!(h.engine.history(kind, 10)[0].phase, RoundPhase::Aborted);
}

/// Hands out honest commitments but reveals the wrong seed
struct TamperingSeeds {
    inner: HashChainSeedSource,
}

impl SeedSource for TamperingSeeds {
    fn commit(
        &self,
        kind: GameKind,
        round_id: u64,
        lock_at: u64,
    ) -> Result<SeedCommitment, SeedError> {
        self.inner.commit(kind, round_id, lock_at)
    }

    fn reveal(&self, commitment: &SeedCommitment) -> Result<SeedReveal, SeedError> {
        let mut reveal = self.inner.reveal(commitment)?;
        reveal.seed = hex::encode([0xAB; 32]);
        Ok(reveal)
    }
}

#[tokio::test]
async fn test_tampered_seed_aborts_with_refunds() {
    let seeds = TamperingSeeds {
        inner: HashChainSeedSource::from_passphrase("tamper"),
    };
    let h = harness(Arc::new(seeds), 3);
    let kind = GameKind::WeightedPool;
    let round = h.engine.open_next_round(kind).await.unwrap();
    h.engine
        .place_bet(kind, round.round_id, "alice".into(), ALICE_STAKE, None)
        .await
        .unwrap();

    let err = h.engine.request_lock(kind, round.round_id).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::SeedError);

    let view = h.engine.round(kind, round.round_id).unwrap();
    assert_eq!(view.phase, RoundPhase::Aborted);
    assert!(view.outcome.is_none());
    assert_eq!(
        view.refunds.unwrap().amount_for(&"alice".into()),
        Some(ALICE_STAKE)
    );
    assert_eq!(h.ledger.settle_attempts(), 0);
}

#[tokio::test]
async fn test_scheduler_runs_rounds_back_to_back() {
    let h = harness(Arc::new(HashChainSeedSource::from_passphrase("sched")), 3);
    let scheduler = Scheduler::new(h.engine.clone(), Duration::from_millis(10));

    scheduler.tick().await;
    for kind in GameKind::ALL {
        let active = h.engine.active_round(kind).unwrap();
        assert_eq!(active.round_id, 1);
    }

    // Past every game's lock time
    h.clock.advance(POOL_DURATION_MS);
    let report = scheduler.tick().await;
    assert_eq!(report.locked, 3);
    assert_eq!(report.settled + report.in_flight, 3);
    assert_eq!(report.opened, report.settled);

    // A crash round keeps flying until its crash point
    let crash = GameKind::RisingMultiplier;
    if let Some(flying) = h.engine.active_round(crash).filter(|v| v.round_id == 1) {
        assert_eq!(flying.phase, RoundPhase::Resolving);
        let ends_at = flying.flight_ends_at.unwrap();
        let mut events = h.engine.events().subscribe();

        h.clock.set(ends_at - 1);
        let report = scheduler.tick().await;
        assert_eq!(report.in_flight, 1);
        assert!(drain(&mut events).contains(&"flight_tick"));

        h.clock.set(ends_at);
        let report = scheduler.tick().await;
        assert_eq!(report.settled, 1);
        assert_eq!(report.opened, 1);
    }

    for kind in GameKind::ALL {
        assert_eq!(h.engine.active_round(kind).unwrap().round_id, 2);
        let history = h.engine.history(kind, 5);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].phase, RoundPhase::Settled);
    }
}

/// Ledger whose round creation is unavailable for the first few calls
struct FlakyRoundCreation {
    inner: InMemoryLedger,
    create_failures: AtomicU32,
}

#[async_trait]
impl Ledger for FlakyRoundCreation {
    async fn read_config(&self, kind: GameKind) -> LedgerResult<ConfigAccount> {
        self.inner.read_config(kind).await
    }

    async fn create_round(&self, request: CreateRoundRequest) -> LedgerResult<GameGroundAccount> {
        let failing = self
            .create_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LedgerError::Unavailable("create_round unavailable".to_string()));
        }
        self.inner.create_round(request).await
    }

    async fn deposit(&self, request: DepositRequest) -> LedgerResult<DepositReceipt> {
        self.inner.deposit(request).await
    }

    async fn settle(&self, record: SettlementRecord) -> LedgerResult<SettlementReceipt> {
        self.inner.settle(record).await
    }

    async fn refund(&self, request: RefundRequest) -> LedgerResult<SettlementReceipt> {
        self.inner.refund(request).await
    }

    async fn read_round(&self, kind: GameKind, round_id: u64) -> LedgerResult<GameGroundAccount> {
        self.inner.read_round(kind, round_id).await
    }
}

#[tokio::test]
async fn test_failed_open_is_retried_with_vrf_seeds() {
    let ledger = Arc::new(FlakyRoundCreation {
        inner: InMemoryLedger::default(),
        create_failures: AtomicU32::new(2),
    });
    let clock = Arc::new(ManualClock::new(START));
    let adapter = LedgerAdapter::new(
        ledger.clone(),
        "lifecycle",
        RetryPolicy {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
        },
    );
    let engine = RoundEngine::new(
        Arc::new(adapter),
        Arc::new(VrfSeedSource::new_random()),
        clock.clone(),
        EngineSettings::default(),
    );
    let kind = GameKind::BinaryFlip;

    let err = engine.open_next_round(kind).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::LedgerTransient);
    assert!(engine.active_round(kind).is_none());

    // A later attempt commits to the same round id with a new lock time
    clock.advance(250);
    let round = engine.open_next_round(kind).await.unwrap();
    assert_eq!(round.round_id, 1);
    assert_eq!(round.lock_at, START + 250 + 10_000);

    clock.set(round.lock_at);
    let resolved = engine.request_lock(kind, round.round_id).await.unwrap();
    assert_eq!(resolved.phase, RoundPhase::Resolving);
    verify_reveal(&resolved.commitment, resolved.reveal.as_ref().unwrap()).unwrap();
}

#[tokio::test]
async fn test_unmatched_ledger_deposit_does_not_stall_the_game() {
    let h = harness(Arc::new(HashChainSeedSource::from_passphrase("orphan")), 3);
    let scheduler = Scheduler::new(h.engine.clone(), Duration::from_millis(10));
    let kind = GameKind::BinaryFlip;

    scheduler.tick().await;
    let round = h.engine.active_round(kind).unwrap();
    h.engine
        .place_bet(
            kind,
            round.round_id,
            "alice".into(),
            ALICE_STAKE,
            Some(Prediction::Side { side: CoinSide::Heads }),
        )
        .await
        .unwrap();
    // Bob paid the ledger directly; the engine never saw his side
    h.ledger
        .deposit(DepositRequest {
            address: round.ledger_address.clone(),
            kind,
            round_id: round.round_id,
            participant: "bob".into(),
            amount: BOB_STAKE,
        })
        .await
        .unwrap();

    h.clock.set(round.lock_at);
    for _ in 0..4 {
        let report = scheduler.tick().await;
        assert_eq!(report.failed, 0);
    }

    let ended = h.engine.round(kind, round.round_id).unwrap();
    assert_eq!(ended.phase, RoundPhase::Aborted);
    assert!(!ended.refund_pending);
    let refunds = ended.refunds.unwrap();
    assert_eq!(refunds.amount_for(&"alice".into()), Some(ALICE_STAKE));
    assert_eq!(refunds.amount_for(&"bob".into()), Some(BOB_STAKE));
    assert!(h.ledger.read_round(kind, round.round_id).await.unwrap().refunded);

    let next = h.engine.active_round(kind).unwrap();
    assert!(next.round_id > round.round_id);
}
