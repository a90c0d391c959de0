pub mod account;
pub mod address;
pub mod ev;
pub mod ledger;
pub mod search;

pub use account::{AccountKind, Board, Miner, Round, RoundState, Treasury};
pub use address::Addresses;
pub use ev::{compute_ev, compute_ev_with, ev_percent, PayoutRule};
pub use ledger::{BetEdit, BetRecord, BetResult, Confirmation, Ledger, LedgerError, Stats};
pub use search::{lowest_squares, search, AllocationStrategy};
use thiserror::Error;

/// Number of squares on the board.
pub const SQUARES: usize = 25;

/// Lamports in one SOL.
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Stake deployed on each square of a board, in lamports.
pub type Deployed = [u64; SQUARES];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("malformed {kind} account: {len} bytes (need at least {min})")]
    MalformedAccount {
        kind: AccountKind,
        len: usize,
        min: usize,
    },
    #[error("no program address found for {0} seeds")]
    NoProgramAddress(&'static str),
}

/// Convert a SOL amount (as configured) to lamports, flooring fractional lamports.
pub fn sol_to_lamports(sol: f64) -> u64 {
    (sol * LAMPORTS_PER_SOL as f64).floor() as u64
}

/// Convert lamports into SOL for display.
pub fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sol_conversion_floors() {
        assert_eq!(sol_to_lamports(0.01), 10_000_000);
        assert_eq!(sol_to_lamports(1.0000000009), LAMPORTS_PER_SOL);
        assert_eq!(lamports_to_sol(2_500_000_000), 2.5);
    }
}
