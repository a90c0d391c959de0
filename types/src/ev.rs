//! Expected value of a bet allocation.
//!
//! Every square is equally likely to be drawn. When the drawn square is one of
//! ours, we get our stake back plus our share of the losing pool after the
//! rake, plus our share of the ORE reward valued at the supplied price. All
//! amounts are in lamports.

use crate::{Deployed, LAMPORTS_PER_SOL, SQUARES};

/// The constants that define the game's payout.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PayoutRule {
    /// Share of the losing pool paid to the winning square (after rake).
    pub distributable: f64,
    /// Share of the ORE reward kept after refining.
    pub refining: f64,
    /// The motherlode contributes `motherlode / motherlode_divisor` ORE per round.
    pub motherlode_divisor: f64,
}

impl PayoutRule {
    pub const PROTOCOL: PayoutRule = PayoutRule {
        distributable: 0.89,
        refining: 0.9,
        motherlode_divisor: 625.0,
    };

    /// ORE paid to the winning square, after refining.
    pub fn ore_reward(&self, motherlode: f64) -> f64 {
        (1.0 + motherlode / self.motherlode_divisor) * self.refining
    }
}

/// Net EV (lamports) of staking `bet_lamports` on each of `indices` under the protocol payout.
///
/// `ore_price` is the value of one ORE in SOL. Indices must be distinct and below 25.
pub fn compute_ev(
    deployed: &Deployed,
    indices: &[usize],
    bet_lamports: u64,
    motherlode: f64,
    ore_price: f64,
) -> f64 {
    compute_ev_with(
        &PayoutRule::PROTOCOL,
        deployed,
        indices,
        bet_lamports,
        motherlode,
        ore_price,
    )
}

/// [compute_ev] against an arbitrary payout rule.
pub fn compute_ev_with(
    rule: &PayoutRule,
    deployed: &Deployed,
    indices: &[usize],
    bet_lamports: u64,
    motherlode: f64,
    ore_price: f64,
) -> f64 {
    let mut ours = [false; SQUARES];
    for &square in indices {
        ours[square] = true;
    }

    let stake = bet_lamports as f64;
    let ore_value = rule.ore_reward(motherlode) * ore_price * LAMPORTS_PER_SOL as f64;

    // Stake on the board once our bet has landed.
    let staked = |square: usize| deployed[square] as f64 + if ours[square] { stake } else { 0.0 };
    let pool: f64 = (0..SQUARES).map(staked).sum();

    let mut expected = 0.0;
    for winner in (0..SQUARES).filter(|&square| ours[square]) {
        let on_winner = staked(winner);
        let losing_pool = pool - on_winner;
        let share = stake / on_winner;
        let payout = stake + share * losing_pool * rule.distributable + share * ore_value;
        expected += payout / SQUARES as f64;
    }

    let committed = ours.iter().filter(|&&bet| bet).count() as f64 * stake;
    expected - committed
}

/// EV as a percentage of the stake committed (0 when nothing is staked).
pub fn ev_percent(ev: f64, total_bet: u64) -> f64 {
    if total_bet == 0 {
        return 0.0;
    }
    ev / total_bet as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOL: u64 = LAMPORTS_PER_SOL;

    fn board() -> Deployed {
        let mut deployed = [0u64; SQUARES];
        for (square, stake) in deployed.iter_mut().enumerate() {
            *stake = (square as u64 % 7 + 1) * SOL / 10;
        }
        deployed
    }

    /// Reference implementation: walks every branch explicitly.
    fn brute_force(rule: &PayoutRule, deployed: &Deployed, indices: &[usize], stake: f64) -> f64 {
        let mut total = 0.0;
        for winner in 0..SQUARES {
            if !indices.contains(&winner) {
                continue;
            }
            let mut losing = 0.0;
            for square in 0..SQUARES {
                if square != winner {
                    let mine = if indices.contains(&square) { stake } else { 0.0 };
                    losing += deployed[square] as f64 + mine;
                }
            }
            let share = stake / (deployed[winner] as f64 + stake);
            total += (stake + share * losing * rule.distributable) / SQUARES as f64;
        }
        total - stake * indices.len() as f64
    }

    #[test]
    fn equal_stakes_single_square() {
        let deployed = [1u64; SQUARES];
        let ev = compute_ev(&deployed, &[0], 1, 0.0, 0.0);
        let expected = brute_force(&PayoutRule::PROTOCOL, &deployed, &[0], 1.0);
        assert!((ev - expected).abs() < 1e-12);
        // stake 1 against 1: half of 24 losing units after rake
        assert!((ev - ((1.0 + 0.89 * 24.0 * 0.5) / 25.0 - 1.0)).abs() < 1e-12);
    }

    #[test]
    fn matches_branch_sum() {
        let deployed = board();
        for indices in [vec![3], vec![0, 5, 9], (0..25).collect::<Vec<_>>()] {
            let ev = compute_ev(&deployed, &indices, SOL / 100, 0.0, 0.0);
            let expected = brute_force(&PayoutRule::PROTOCOL, &deployed, &indices, (SOL / 100) as f64);
            assert!((ev - expected).abs() < 1e-3, "{indices:?}: {ev} vs {expected}");
        }
    }

    #[test]
    fn empty_allocation_is_worth_nothing() {
        assert_eq!(compute_ev(&board(), &[], SOL, 10.0, 1.0), 0.0);
        assert_eq!(ev_percent(5.0, 0), 0.0);
    }

    #[test]
    fn non_increasing_in_rake() {
        let deployed = board();
        let mut previous = f64::INFINITY;
        for distributable in [1.0, 0.95, 0.89, 0.7, 0.5] {
            let rule = PayoutRule {
                distributable,
                ..PayoutRule::PROTOCOL
            };
            for square in 0..SQUARES {
                let raked = compute_ev_with(&rule, &deployed, &[square], SOL / 50, 2.0, 0.3);
                let generous = compute_ev_with(
                    &PayoutRule {
                        distributable: distributable + 0.01,
                        ..PayoutRule::PROTOCOL
                    },
                    &deployed,
                    &[square],
                    SOL / 50,
                    2.0,
                    0.3,
                );
                assert!(raked <= generous);
            }
            let ev = compute_ev_with(&rule, &deployed, &[4], SOL / 50, 2.0, 0.3);
            assert!(ev <= previous);
            previous = ev;
        }
    }

    #[test]
    fn increasing_in_motherlode() {
        let deployed = board();
        for square in 0..SQUARES {
            let mut previous = f64::NEG_INFINITY;
            for motherlode in [0.0, 10.0, 100.0, 625.0, 5_000.0] {
                let ev = compute_ev(&deployed, &[square], SOL / 20, motherlode, 0.4);
                assert!(ev > previous);
                previous = ev;
            }
        }
    }

    #[test]
    fn ore_reward_scales_with_price() {
        let deployed = [0u64; SQUARES];
        // Sole bettor on an empty board: stake back on a hit plus the full ORE reward.
        let ev = compute_ev(&deployed, &[0], SOL, 0.0, 1.0);
        let expected = (SOL as f64 + 0.9 * SOL as f64) / 25.0 - SOL as f64;
        assert!((ev - expected).abs() < 1e-3);
    }

    #[test]
    fn percent_of_stake() {
        assert_eq!(ev_percent(50.0, 1_000), 5.0);
        assert_eq!(ev_percent(-250.0, 1_000), -25.0);
    }
}
