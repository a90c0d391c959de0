//! Choosing which squares to bet on.

use crate::{compute_ev, ev::ev_percent, Deployed, SQUARES};

/// EV floor (as a fraction of the maximum) that variance reduction may give up to.
const VARIANCE_FLOOR: f64 = 0.9;

/// A candidate (or chosen) bet.
#[derive(Clone, Debug, PartialEq)]
pub struct AllocationStrategy {
    pub indices: Vec<usize>,
    pub bet_per_square: u64,
    /// Net EV in lamports.
    pub ev: f64,
    pub total_bet: u64,
    /// Squares added beyond the EV-maximizing set, empty when none.
    pub variance_reduction_squares: Vec<usize>,
}

impl AllocationStrategy {
    pub fn evaluate(
        deployed: &Deployed,
        indices: Vec<usize>,
        bet_per_square: u64,
        motherlode: f64,
        ore_price: f64,
    ) -> Self {
        let ev = compute_ev(deployed, &indices, bet_per_square, motherlode, ore_price);
        let total_bet = bet_per_square * indices.len() as u64;
        Self {
            indices,
            bet_per_square,
            ev,
            total_bet,
            variance_reduction_squares: Vec::new(),
        }
    }

    pub fn ev_percent(&self) -> f64 {
        ev_percent(self.ev, self.total_bet)
    }
}

/// Square indices ordered by ascending stake. Ties keep index order.
fn by_stake(deployed: &Deployed) -> Vec<usize> {
    let mut order: Vec<usize> = (0..SQUARES).collect();
    order.sort_by_key(|&square| deployed[square]);
    order
}

/// The `count` lowest-stake squares after skipping the `skip` lowest.
pub fn lowest_squares(deployed: &Deployed, count: usize, skip: usize) -> Vec<usize> {
    by_stake(deployed)
        .into_iter()
        .skip(skip)
        .take(count)
        .collect()
}

/// Find the number of lowest-stake squares (after skipping `skip`) that maximizes EV.
///
/// Counts are tried from 1 up to `min(25 - skip, max_squares)` and the first
/// count with the strictly greatest EV wins. With `variance_reduction` and a
/// positive maximum, the set keeps growing one square at a time while EV stays
/// at or above 90% of that maximum.
pub fn search(
    deployed: &Deployed,
    bet_per_square: u64,
    skip: usize,
    max_squares: usize,
    motherlode: f64,
    ore_price: f64,
    variance_reduction: bool,
) -> Option<AllocationStrategy> {
    let available = SQUARES.saturating_sub(skip).min(max_squares);
    if available == 0 {
        return None;
    }

    let order = by_stake(deployed);
    let candidate = |count: usize| {
        AllocationStrategy::evaluate(
            deployed,
            order[skip..skip + count].to_vec(),
            bet_per_square,
            motherlode,
            ore_price,
        )
    };

    let mut best = candidate(1);
    for count in 2..=available {
        let next = candidate(count);
        if next.ev > best.ev {
            best = next;
        }
    }

    if !variance_reduction || best.ev <= 0.0 {
        return Some(best);
    }

    let core = best.indices.len();
    let floor = best.ev * VARIANCE_FLOOR;
    let mut chosen = best.clone();
    for count in core + 1..=available {
        let next = candidate(count);
        if next.ev < floor {
            break;
        }
        chosen = next;
    }
    chosen.variance_reduction_squares = chosen.indices[core..].to_vec();
    Some(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LAMPORTS_PER_SOL;

    const SOL: u64 = LAMPORTS_PER_SOL;

    /// Square 0 is empty and the rest are crowded, so only square 0 pays.
    fn lopsided() -> Deployed {
        let mut deployed = [0u64; SQUARES];
        for (square, stake) in deployed.iter_mut().enumerate().skip(1) {
            *stake = 1_000 + square as u64;
        }
        deployed
    }

    fn mixed() -> Deployed {
        let mut deployed = [0u64; SQUARES];
        for (square, stake) in deployed.iter_mut().enumerate() {
            *stake = ((square as u64 * 7919) % 23 + 1) * SOL / 20;
        }
        deployed
    }

    #[test]
    fn increasing_board_picks_single_cheapest() {
        let deployed = lopsided();
        let single = compute_ev(&deployed, &[0], 1, 0.0, 0.0);
        assert!(single > 0.0);
        assert!(compute_ev(&deployed, &[0, 1], 1, 0.0, 0.0) < single);

        let best = search(&deployed, 1, 0, 25, 0.0, 0.0, false).unwrap();
        assert_eq!(best.indices, vec![0]);
        assert_eq!(best.total_bet, 1);
        assert_eq!(best.ev, single);
        assert!(best.variance_reduction_squares.is_empty());
    }

    #[test]
    fn keeps_argmax_over_counts() {
        let deployed = mixed();
        let best = search(&deployed, SOL / 100, 2, 25, 50.0, 0.2, false).unwrap();
        let order = by_stake(&deployed);
        for count in 1..=23 {
            let ev = compute_ev(&deployed, &order[2..2 + count], SOL / 100, 50.0, 0.2);
            assert!(ev <= best.ev);
        }
        assert_eq!(&best.indices[..], &order[2..2 + best.indices.len()]);
    }

    #[test]
    fn total_bet_is_bounded() {
        let deployed = mixed();
        for skip in 0..SQUARES {
            for max_squares in [1, 5, 25] {
                let strategy =
                    search(&deployed, SOL / 10, skip, max_squares, 0.0, 0.5, true).unwrap();
                assert!(strategy.total_bet <= SOL / 10 * (SQUARES - skip) as u64);
                assert!(strategy.indices.len() <= max_squares);
            }
        }
    }

    #[test]
    fn nothing_to_search() {
        let deployed = mixed();
        assert!(search(&deployed, SOL, 25, 25, 0.0, 0.0, false).is_none());
        assert!(search(&deployed, SOL, 30, 25, 0.0, 0.0, false).is_none());
        assert!(search(&deployed, SOL, 0, 0, 0.0, 0.0, false).is_none());
    }

    #[test]
    fn variance_reduction_stays_within_floor() {
        let deployed = lopsided();
        let core = search(&deployed, 1, 0, 25, 0.0, 0.0, false).unwrap();
        let wide = search(&deployed, 1, 0, 25, 0.0, 0.0, true).unwrap();

        assert!(wide.indices.len() > core.indices.len());
        assert!(wide.ev >= core.ev * 0.9);
        assert_eq!(&wide.indices[..core.indices.len()], &core.indices[..]);
        assert_eq!(
            wide.variance_reduction_squares,
            wide.indices[core.indices.len()..].to_vec()
        );

        // Growing past the returned set would fall below the floor (or run out of squares).
        let order = by_stake(&deployed);
        let count = wide.indices.len();
        if count < SQUARES {
            let next = compute_ev(&deployed, &order[..count + 1], 1, 0.0, 0.0);
            assert!(next < core.ev * 0.9);
        }
    }

    #[test]
    fn variance_reduction_needs_positive_ev() {
        // A single huge bet on a light board loses money at every count.
        let deployed = [1u64; SQUARES];
        let wide = search(&deployed, SOL, 0, 25, 0.0, 0.0, true).unwrap();
        assert!(wide.ev < 0.0);
        assert!(wide.variance_reduction_squares.is_empty());
    }

    #[test]
    fn lowest_squares_skips() {
        let mut deployed = [100u64; SQUARES];
        deployed[7] = 1;
        deployed[3] = 2;
        deployed[20] = 3;
        assert_eq!(lowest_squares(&deployed, 2, 0), vec![7, 3]);
        assert_eq!(lowest_squares(&deployed, 2, 1), vec![3, 20]);
        // ties fall back to index order
        assert_eq!(lowest_squares(&deployed, 2, 3), vec![0, 1]);
        assert_eq!(lowest_squares(&deployed, 5, 24).len(), 1);
    }

    #[test]
    fn evaluate_totals_stake() {
        let strategy = AllocationStrategy::evaluate(&[0; SQUARES], vec![0, 3, 24], 5, 0.0, 0.0);
        assert_eq!(strategy.total_bet, 15);
        assert_eq!(strategy.ev, compute_ev(&[0; SQUARES], &[0, 3, 24], 5, 0.0, 0.0));
    }
}
