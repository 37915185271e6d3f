//! Outcome generation
//!
//! Everything here is a pure function of the revealed seed and the bet
//! snapshot. Each game draws from its own domain-separated hash of the seed.

use crate::errors::SeedError;
use crate::games::types::{Bet, CoinSide, GameKind, Multiplier, Outcome, SeedCommitment, SeedReveal};
use crate::games::vrf_engine::verify_reveal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const CRASH_EDGE_DOMAIN: &[u8] = b"roundhouse/crash/edge";
const CRASH_POINT_DOMAIN: &[u8] = b"roundhouse/crash/point";
const FLIP_DOMAIN: &[u8] = b"roundhouse/flip";
const POOL_DOMAIN: &[u8] = b"roundhouse/pool";

/// Rising-multiplier parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrashParams {
    /// Probability of an instant 1.00x crash, in basis points
    pub house_edge_bps: u64,
    pub max_crash: Multiplier,
    /// Growth `k` of the flight curve in thousandths per second (120 = 0.12/s)
    pub growth_milli: u64,
}

impl CrashParams {
    pub fn growth_per_sec(&self) -> f64 {
        self.growth_milli as f64 / 1_000.0
    }
}

impl Default for CrashParams {
    fn default() -> Self {
        Self {
            house_edge_bps: 100,
            max_crash: Multiplier::from_hundredths(100_000_000),
            growth_milli: 120,
        }
    }
}

fn domain_hash(seed: &[u8; 32], domain: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(domain);
    hasher.finalize().into()
}

/// First eight bytes (big-endian) of `SHA-256(seed ‖ domain)`
pub fn uniform_u64(seed: &[u8; 32], domain: &[u8]) -> u64 {
    let digest = domain_hash(seed, domain);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// Crash point for a seed. Non-forced crashes are at least 1.01x, so 1.00x
/// happens exactly as often as the house edge dictates.
pub fn crash_point(seed: &[u8; 32], params: &CrashParams) -> Multiplier {
    let edge_draw = uniform_u64(seed, CRASH_EDGE_DOMAIN) % 10_000;
    if edge_draw < params.house_edge_bps {
        return Multiplier::ONE;
    }

    // r in (0, 1] with 53 bits of precision
    let x = uniform_u64(seed, CRASH_POINT_DOMAIN);
    let r = ((x >> 11) + 1) as f64 / (1u64 << 53) as f64;
    let hundredths = (100.0 / r).floor() as u64;

    Multiplier::from_hundredths(
        hundredths
            .max(Multiplier::MIN_TARGET.hundredths())
            .min(params.max_crash.hundredths()),
    )
}

/// Displayed multiplier `elapsed_ms` into a flight, `e^(k·t)` floored to hundredths
pub fn flight_multiplier(elapsed_ms: u64, growth_per_sec: f64) -> Multiplier {
    let seconds = elapsed_ms as f64 / 1_000.0;
    Multiplier::from_f64((growth_per_sec * seconds).exp())
}

/// Milliseconds until a flight reaches `point`
pub fn flight_duration_ms(point: Multiplier, growth_per_sec: f64) -> u64 {
    if growth_per_sec <= 0.0 || point <= Multiplier::ONE {
        return 0;
    }
    (point.as_f64().ln() / growth_per_sec * 1_000.0).ceil() as u64
}

/// Even first byte is heads
pub fn flip_side(seed: &[u8; 32]) -> CoinSide {
    let digest = domain_hash(seed, FLIP_DOMAIN);
    if digest[0] % 2 == 0 {
        CoinSide::Heads
    } else {
        CoinSide::Tails
    }
}

/// Uniform draw in `[0, total)`; zero when `total` is zero
pub fn pool_draw(seed: &[u8; 32], total: u64) -> u64 {
    let x = uniform_u64(seed, POOL_DOMAIN);
    ((x as u128 * total as u128) >> 64) as u64
}

/// Index of the bet whose cumulative stake first exceeds `draw`
pub fn pick_weighted(bets: &[Bet], draw: u64) -> Option<usize> {
    let mut running: u128 = 0;
    for (index, bet) in bets.iter().enumerate() {
        running += bet.amount as u128;
        if running > draw as u128 {
            return Some(index);
        }
    }
    None
}

/// Outcome for an already verified seed
pub fn outcome_from_seed(
    seed: &[u8; 32],
    kind: GameKind,
    params: &CrashParams,
    bets: &[Bet],
) -> Outcome {
    match kind {
        GameKind::RisingMultiplier => Outcome::Crash {
            crash_point: crash_point(seed, params),
        },
        GameKind::BinaryFlip => Outcome::Flip {
            side: flip_side(seed),
        },
        GameKind::WeightedPool => {
            let total = bets.iter().fold(0u64, |sum, b| sum.saturating_add(b.amount));
            let draw = pool_draw(seed, total);
            Outcome::Pool {
                winner_index: pick_weighted(bets, draw),
                draw,
            }
        }
    }
}

/// Verifies the reveal against the commitment, then derives the outcome
pub fn resolve(
    commitment: &SeedCommitment,
    reveal: &SeedReveal,
    params: &CrashParams,
    bets: &[Bet],
) -> Result<Outcome, SeedError> {
    let seed = verify_reveal(commitment, reveal)?;
    Ok(outcome_from_seed(&seed, commitment.kind, params, bets))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::games::types::Participant;
    use crate::games::vrf_engine::{HashChainSeedSource, SeedSource};

    fn seed(i: u64) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(i.to_le_bytes());
        hasher.finalize().into()
    }

    fn bet(sequence: u32, who: &str, amount: u64) -> Bet {
        Bet {
            sequence,
            participant: Participant::from(who),
            amount,
            prediction: None,
            placed_at: 0,
        }
    }

    #[test]
    fn test_outcome_is_deterministic() {
        let params = CrashParams::default();
        let bets = vec![bet(0, "a", 10), bet(1, "b", 30)];
        for i in 0..128 {
            let s = seed(i);
            for kind in GameKind::ALL {
                assert_eq!(
                    outcome_from_seed(&s, kind, &params, &bets),
                    outcome_from_seed(&s, kind, &params, &bets)
                );
            }
        }
    }

    #[test]
    fn test_weighted_pool_fairness() {
        let bets = vec![bet(0, "small", 100_000_000), bet(1, "large", 300_000_000)];
        let params = CrashParams::default();
        let rounds = 4_000;

        let small_wins = (0..rounds)
            .filter(|i| {
                matches!(
                    outcome_from_seed(&seed(*i), GameKind::WeightedPool, &params, &bets),
                    Outcome::Pool { winner_index: Some(0), .. }
                )
            })
            .count();

        let ratio = small_wins as f64 / rounds as f64;
        assert!((ratio - 0.25).abs() < 0.03, "small stake won {:.3}", ratio);
    }

    #[test]
    fn test_crash_house_edge_frequency() {
        let params = CrashParams::default();
        let trials = 20_000;
        let instant = (0..trials)
            .filter(|i| crash_point(&seed(*i), &params) == Multiplier::ONE)
            .count();

        let frequency = instant as f64 / trials as f64;
        assert!((frequency - 0.01).abs() < 0.004, "instant crash rate {:.4}", frequency);
    }

    #[test]
    fn test_crash_point_bounds() {
        let params = CrashParams {
            house_edge_bps: 0,
            max_crash: Multiplier::from_hundredths(500),
            ..CrashParams::default()
        };
        for i in 0..500 {
            let point = crash_point(&seed(i), &params);
            assert!(point >= Multiplier::MIN_TARGET);
            assert!(point <= params.max_crash);
        }
    }

    #[test]
    fn test_flight_curve() {
        assert_eq!(flight_multiplier(0, 0.12), Multiplier::ONE);

        let two = Multiplier::from_hundredths(200);
        let duration = flight_duration_ms(two, 0.12);
        assert!((5_770..5_790).contains(&duration), "duration {}", duration);
        assert!(flight_multiplier(duration, 0.12) >= two);
        assert_eq!(flight_duration_ms(Multiplier::ONE, 0.12), 0);
    }

    #[test]
    fn test_flip_is_roughly_balanced() {
        let heads = (0..2_000)
            .filter(|i| flip_side(&seed(*i)) == CoinSide::Heads)
            .count();
        assert!((900..1_100).contains(&heads), "heads {}", heads);
    }

    #[test]
    fn test_pick_weighted_boundaries() {
        let bets = vec![bet(0, "a", 10), bet(1, "b", 0), bet(2, "c", 30)];
        assert_eq!(pick_weighted(&bets, 0), Some(0));
        assert_eq!(pick_weighted(&bets, 9), Some(0));
        assert_eq!(pick_weighted(&bets, 10), Some(2));
        assert_eq!(pick_weighted(&bets, 39), Some(2));
        assert_eq!(pick_weighted(&bets, 40), None);
        assert_eq!(pick_weighted(&[], 0), None);
    }

    #[test]
    fn test_empty_pool_has_no_winner() {
        let outcome = outcome_from_seed(&seed(1), GameKind::WeightedPool, &CrashParams::default(), &[]);
        assert_eq!(outcome, Outcome::Pool { winner_index: None, draw: 0 });
    }

    #[test]
    fn test_resolve_rejects_tampered_reveal() {
        let source = HashChainSeedSource::from_passphrase("outcome");
        let commitment = source.commit(GameKind::BinaryFlip, 1, 10).unwrap();
        let mut reveal = source.reveal(&commitment).unwrap();
        assert!(resolve(&commitment, &reveal, &CrashParams::default(), &[]).is_ok());

        reveal.seed = hex::encode([0u8; 32]);
        assert!(matches!(
            resolve(&commitment, &reveal, &CrashParams::default(), &[]),
            Err(SeedError::InvalidSeed(_))
        ));
    }
}
