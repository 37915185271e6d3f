use crate::games::types::{Bet, GameKind, Multiplier, Outcome, Participant, Payout, PayoutPlan, Prediction};
use serde::{Deserialize, Serialize};

const BPS_DENOMINATOR: u128 = 10_000;

/// Fee settings applied when computing payouts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeeSchedule {
    pub platform_fee_bps: u64,
    /// Highest multiplier a rising-multiplier bet can be paid at
    pub max_cashout: Multiplier,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            platform_fee_bps: 100,
            max_cashout: Multiplier::from_hundredths(100_000_000),
        }
    }
}

/// Splits a gross amount into `(net, fee)`; the net is floored so `net + fee == gross`
fn split_fee(gross: u128, fee_bps: u64) -> (u128, u128) {
    let net = gross * (BPS_DENOMINATOR - fee_bps.min(10_000) as u128) / BPS_DENOMINATOR;
    (net, gross - net)
}

fn saturate(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

struct Tally {
    participant: Participant,
    stake: u128,
    amount: u128,
}

fn tally_mut<'a>(tallies: &'a mut Vec<Tally>, participant: &Participant) -> &'a mut Tally {
    let index = match tallies.iter().position(|t| &t.participant == participant) {
        Some(index) => index,
        None => {
            tallies.push(Tally {
                participant: participant.clone(),
                stake: 0,
                amount: 0,
            });
            tallies.len() - 1
        }
    };
    &mut tallies[index]
}

/// Computes the payout plan for a resolved round.
///
/// One entry per distinct participant in first-bet order. Losers appear with
/// an amount of zero.
pub fn compute_payouts(
    kind: GameKind,
    outcome: &Outcome,
    bets: &[Bet],
    fees: &FeeSchedule,
) -> PayoutPlan {
    let mut tallies: Vec<Tally> = Vec::new();
    let mut platform_fee: u128 = 0;
    let total_stake: u128 = bets.iter().map(|b| b.amount as u128).sum();

    for bet in bets {
        tally_mut(&mut tallies, &bet.participant).stake += bet.amount as u128;
    }

    match (kind, outcome) {
        (GameKind::RisingMultiplier, Outcome::Crash { crash_point }) => {
            for bet in bets {
                if let Some(Prediction::AutoCashout { target }) = bet.prediction {
                    let target = target.min(fees.max_cashout);
                    if target < *crash_point {
                        tally_mut(&mut tallies, &bet.participant).amount +=
                            target.apply(bet.amount) as u128;
                    }
                }
            }
        }
        (GameKind::BinaryFlip, Outcome::Flip { side }) => {
            for bet in bets {
                if bet.prediction == Some(Prediction::Side { side: *side }) {
                    let (net, fee) = split_fee(bet.amount as u128 * 2, fees.platform_fee_bps);
                    tally_mut(&mut tallies, &bet.participant).amount += net;
                    platform_fee += fee;
                }
            }
        }
        (GameKind::WeightedPool, Outcome::Pool { winner_index, .. }) => {
            if let Some(winner) = winner_index.and_then(|i| bets.get(i)) {
                let (net, fee) = split_fee(total_stake, fees.platform_fee_bps);
                tally_mut(&mut tallies, &winner.participant).amount += net;
                platform_fee += fee;
            }
        }
        (kind, outcome) => {
            tracing::error!(%kind, ?outcome, "outcome does not match game kind; nobody is paid");
        }
    }

    PayoutPlan {
        payouts: tallies
            .into_iter()
            .map(|t| Payout {
                participant: t.participant,
                stake: saturate(t.stake),
                amount: saturate(t.amount),
            })
            .collect(),
        platform_fee: saturate(platform_fee),
        total_stake: saturate(total_stake),
    }
}

/// Full stake back to every participant, aggregated in first-bet order
pub fn refund_plan(bets: &[Bet]) -> PayoutPlan {
    let mut tallies: Vec<Tally> = Vec::new();
    for bet in bets {
        let tally = tally_mut(&mut tallies, &bet.participant);
        tally.stake += bet.amount as u128;
        tally.amount += bet.amount as u128;
    }
    PayoutPlan {
        total_stake: saturate(tallies.iter().map(|t| t.stake).sum::<u128>()),
        payouts: tallies
            .into_iter()
            .map(|t| Payout {
                participant: t.participant,
                stake: saturate(t.stake),
                amount: saturate(t.amount),
            })
            .collect(),
        platform_fee: 0,
    }
}
