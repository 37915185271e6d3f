//! Offline replay of rounds from seeds
//!
//! [`simulate`] plays many rounds of one game against the deterministic seed
//! source with generated bets and reports the resulting statistics.
//! [`audit`] re-derives a published round from its commitment and reveal.

use crate::errors::SeedError;
use crate::games::outcome::{self, flight_duration_ms};
use crate::games::payout::compute_payouts;
use crate::games::types::{
    Bet, CoinSide, GameKind, Multiplier, Outcome, Participant, PayoutPlan, Prediction,
    SeedCommitment, SeedReveal,
};
use crate::games::vrf_engine::{HashChainSeedSource, SeedSource};
use crate::round::RoundRules;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub kind: GameKind,
    pub rounds: u64,
    /// Passphrase for both the seed source and the bet generator
    pub seed: String,
    pub participants: usize,
    pub rules: RoundRules,
    pub round_duration_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            kind: GameKind::RisingMultiplier,
            rounds: 1_000,
            seed: "simulation".to_string(),
            participants: 4,
            rules: RoundRules::default(),
            round_duration_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationReport {
    pub kind: Option<GameKind>,
    pub rounds: u64,
    pub total_staked: u128,
    pub total_paid: u128,
    pub platform_fees: u128,
    /// Crash rounds that ended at 1.00x
    pub instant_crashes: u64,
    pub median_crash: Option<Multiplier>,
    pub mean_flight_ms: f64,
    pub heads: u64,
    pub tails: u64,
    /// Pool rounds won by the first participant
    pub first_participant_wins: u64,
    /// Sum over pool rounds of the first participant's stake share
    pub first_participant_expected: f64,
}

impl SimulationReport {
    /// Paid out per unit staked
    pub fn return_to_player(&self) -> f64 {
        if self.total_staked == 0 {
            return 0.0;
        }
        self.total_paid as f64 / self.total_staked as f64
    }

    pub fn instant_crash_rate(&self) -> f64 {
        if self.rounds == 0 {
            return 0.0;
        }
        self.instant_crashes as f64 / self.rounds as f64
    }

    pub fn print(&self) {
        let kind = self.kind.map(|k| k.to_string()).unwrap_or_default();
        println!("📊 Simulation results ({} rounds of {})", self.rounds, kind);
        println!("  • Total staked: {}", self.total_staked);
        println!("  • Total paid: {}", self.total_paid);
        println!("  • Platform fees: {}", self.platform_fees);
        println!("  • Return to player: {:.4}", self.return_to_player());

        match self.kind {
            Some(GameKind::RisingMultiplier) => {
                println!("  • Instant crashes: {} ({:.4})", self.instant_crashes, self.instant_crash_rate());
                if let Some(median) = self.median_crash {
                    println!("  • Median crash point: {}", median);
                }
                println!("  • Mean flight: {:.0}ms", self.mean_flight_ms);
            }
            Some(GameKind::BinaryFlip) => {
                println!("  • Heads / tails: {} / {}", self.heads, self.tails);
            }
            Some(GameKind::WeightedPool) => {
                println!(
                    "  • First participant won {} rounds (stake-weighted expectation {:.1})",
                    self.first_participant_wins, self.first_participant_expected
                );
            }
            None => {}
        }
    }
}

fn generator(seed: &str) -> StdRng {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(b"/bets");
    StdRng::from_seed(hasher.finalize().into())
}

fn generate_bets(rng: &mut StdRng, config: &SimulationConfig, placed_at: u64) -> Vec<Bet> {
    let minimum = config.rules.min_deposit.max(1);
    (0..config.participants)
        .map(|i| {
            let prediction = match config.kind {
                GameKind::RisingMultiplier => Some(Prediction::AutoCashout {
                    target: Multiplier::from_hundredths(rng.gen_range(101..=1_000)),
                }),
                GameKind::BinaryFlip => Some(Prediction::Side {
                    side: if rng.gen_bool(0.5) { CoinSide::Heads } else { CoinSide::Tails },
                }),
                GameKind::WeightedPool => None,
            };
            Bet {
                sequence: i as u32,
                participant: Participant::new(format!("player-{}", i)),
                amount: minimum * rng.gen_range(1..=10),
                prediction,
                placed_at,
            }
        })
        .collect()
}

/// Plays `config.rounds` rounds through commit, reveal and resolve
pub fn simulate(config: &SimulationConfig) -> Result<SimulationReport, SeedError> {
    let source = HashChainSeedSource::from_passphrase(&config.seed);
    let mut rng = generator(&config.seed);
    let mut report = SimulationReport {
        kind: Some(config.kind),
        rounds: config.rounds,
        ..SimulationReport::default()
    };
    let mut crash_points = Vec::new();
    let mut flight_total: u128 = 0;

    for round_id in 1..=config.rounds {
        let lock_at = round_id * config.round_duration_ms;
        let bets = generate_bets(&mut rng, config, lock_at - 1);
        let commitment = source.commit(config.kind, round_id, lock_at)?;
        let reveal = source.reveal(&commitment)?;
        let outcome = outcome::resolve(&commitment, &reveal, &config.rules.crash, &bets)?;
        let plan = compute_payouts(config.kind, &outcome, &bets, &config.rules.fees);

        report.total_staked += plan.total_stake as u128;
        report.total_paid += plan.total_paid() as u128;
        report.platform_fees += plan.platform_fee as u128;

        match outcome {
            Outcome::Crash { crash_point } => {
                if crash_point == Multiplier::ONE {
                    report.instant_crashes += 1;
                }
                flight_total += flight_duration_ms(crash_point, config.rules.crash.growth_per_sec()) as u128;
                crash_points.push(crash_point);
            }
            Outcome::Flip { side: CoinSide::Heads } => report.heads += 1,
            Outcome::Flip { side: CoinSide::Tails } => report.tails += 1,
            Outcome::Pool { winner_index, .. } => {
                if let Some(first) = bets.first().filter(|_| plan.total_stake > 0) {
                    report.first_participant_expected +=
                        first.amount as f64 / plan.total_stake as f64;
                }
                if winner_index == Some(0) {
                    report.first_participant_wins += 1;
                }
            }
        }
    }

    if !crash_points.is_empty() {
        crash_points.sort();
        report.median_crash = Some(crash_points[crash_points.len() / 2]);
        report.mean_flight_ms = flight_total as f64 / crash_points.len() as f64;
    }
    Ok(report)
}

/// Outcome of an audited round, with payouts when bets were supplied
#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub kind: GameKind,
    pub round_id: u64,
    pub seed: String,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payouts: Option<PayoutPlan>,
}

/// Verifies `reveal` against `commitment` and re-derives the round
pub fn audit(
    commitment: &SeedCommitment,
    reveal: &SeedReveal,
    bets: &[Bet],
    rules: &RoundRules,
) -> Result<AuditReport, SeedError> {
    let outcome = outcome::resolve(commitment, reveal, &rules.crash, bets)?;
    let payouts = (!bets.is_empty())
        .then(|| compute_payouts(commitment.kind, &outcome, bets, &rules.fees));

    Ok(AuditReport {
        kind: commitment.kind,
        round_id: commitment.round_id,
        seed: reveal.seed.clone(),
        outcome,
        payouts,
    })
}

/// Parses `name=amount`, optionally followed by `@heads`, `@tails` or a
/// cash-out target such as `@2.5`, into a bet at position `sequence`
pub fn parse_bet(sequence: u32, raw: &str) -> Result<Bet, String> {
    let (name, rest) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=amount, got '{}'", raw))?;
    let (amount, prediction) = match rest.split_once('@') {
        Some((amount, prediction)) => (amount, Some(prediction)),
        None => (rest, None),
    };

    let amount = amount
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("invalid amount '{}': {}", amount, e))?;
    let prediction = match prediction.map(|p| p.trim().to_ascii_lowercase()) {
        None => None,
        Some(p) if p == "heads" => Some(Prediction::Side { side: CoinSide::Heads }),
        Some(p) if p == "tails" => Some(Prediction::Side { side: CoinSide::Tails }),
        Some(p) => {
            let target = p
                .trim_end_matches('x')
                .parse::<f64>()
                .map_err(|_| format!("invalid prediction '{}'", p))?;
            Some(Prediction::AutoCashout {
                target: Multiplier::from_f64(target),
            })
        }
    };

    Ok(Bet {
        sequence,
        participant: Participant::new(name.trim()),
        amount,
        prediction,
        placed_at: 0,
    })
}
