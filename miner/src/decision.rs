//! Whether, where and how much to bet once a round is close to ending.

use orebot_types::{lowest_squares, search, AllocationStrategy, Deployed, SQUARES};
use serde::{Deserialize, Serialize};

/// Slots before the primary window in which a bet may be placed early.
pub const EARLY_WINDOW_SLOTS: u64 = 8;

/// How candidate squares are chosen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Search for the EV-maximizing number of lowest-stake squares.
    #[default]
    Optimal,
    /// Always the `lowest_squares_count` lowest-stake squares.
    LowestSquares,
}

/// Betting parameters (amounts in lamports).
#[derive(Clone, Debug, PartialEq)]
pub struct Policy {
    pub bet_amount: u64,
    pub secondary_bet_amount: Option<u64>,
    /// Minimum EV percentage for a bet.
    pub ev_threshold: f64,
    /// Minimum EV percentage for a bet in the early window.
    pub early_ev_threshold: f64,
    pub slots_threshold: u64,
    pub strategy: Strategy,
    pub skip: usize,
    pub max_squares: usize,
    pub lowest_squares_count: usize,
    pub variance_reduction: bool,
}

/// Where a round is relative to the betting windows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Window {
    /// Too early to consider betting.
    Idle,
    /// Just before the primary window: bet only if it already clears the early threshold.
    Early,
    /// Bet or skip now.
    Primary,
    /// The round is over or we have already acted in it.
    Closed,
}

pub fn window(slots_remaining: i64, slots_threshold: u64, acted: bool) -> Window {
    if slots_remaining <= 0 || acted {
        return Window::Closed;
    }
    let slots = slots_remaining as u64;
    if slots <= slots_threshold {
        Window::Primary
    } else if slots <= slots_threshold + EARLY_WINDOW_SLOTS {
        Window::Early
    } else {
        Window::Idle
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    Bet(AllocationStrategy),
    /// Nothing cleared the threshold; carries the primary candidate if there was one.
    Skip(Option<AllocationStrategy>),
}

/// Whether a candidate is worth sending.
pub fn passes(candidate: &AllocationStrategy, threshold: f64) -> bool {
    candidate.ev > 0.0 && candidate.ev_percent() >= threshold
}

impl Policy {
    /// Build the candidate bet for `amount` lamports per square.
    pub fn candidate(
        &self,
        deployed: &Deployed,
        amount: u64,
        slots_remaining: i64,
        motherlode: f64,
        ore_price: f64,
    ) -> Option<AllocationStrategy> {
        match self.strategy {
            Strategy::Optimal => {
                // Never more squares than slots left to land the transaction in.
                let slots = usize::try_from(slots_remaining.max(0)).unwrap_or(SQUARES);
                let max_squares = self.max_squares.min(slots).min(SQUARES);
                search(
                    deployed,
                    amount,
                    self.skip,
                    max_squares,
                    motherlode,
                    ore_price,
                    self.variance_reduction,
                )
            }
            Strategy::LowestSquares => {
                let indices = lowest_squares(deployed, self.lowest_squares_count, self.skip);
                (!indices.is_empty()).then(|| {
                    AllocationStrategy::evaluate(deployed, indices, amount, motherlode, ore_price)
                })
            }
        }
    }

    /// Try the primary amount, then the secondary one, and skip if neither passes.
    pub fn decide(
        &self,
        deployed: &Deployed,
        slots_remaining: i64,
        motherlode: f64,
        ore_price: f64,
        threshold: f64,
    ) -> Decision {
        let primary = self.candidate(
            deployed,
            self.bet_amount,
            slots_remaining,
            motherlode,
            ore_price,
        );
        if let Some(candidate) = primary.as_ref().filter(|c| passes(c, threshold)) {
            return Decision::Bet(candidate.clone());
        }

        let secondary = self.secondary_bet_amount.and_then(|amount| {
            self.candidate(deployed, amount, slots_remaining, motherlode, ore_price)
        });
        match secondary {
            Some(candidate) if passes(&candidate, threshold) => Decision::Bet(candidate),
            _ => Decision::Skip(primary),
        }
    }
}
