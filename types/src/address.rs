//! Program-derived addresses used by the bot.

use crate::Error;
use solana_sdk::pubkey::Pubkey;

const BOARD: &[u8] = b"board";
const ROUND: &[u8] = b"round";
const MINER: &[u8] = b"miner";
const AUTOMATION: &[u8] = b"automation";
const TREASURY: &[u8] = b"treasury";

fn derive(label: &'static str, seeds: &[&[u8]], program_id: &Pubkey) -> Result<Pubkey, Error> {
    Pubkey::try_find_program_address(seeds, program_id)
        .map(|(address, _bump)| address)
        .ok_or(Error::NoProgramAddress(label))
}

/// Addresses that stay fixed for an authority, derived once at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Addresses {
    pub program_id: Pubkey,
    pub authority: Pubkey,
    pub board: Pubkey,
    pub treasury: Pubkey,
    pub miner: Pubkey,
    pub automation: Pubkey,
}

impl Addresses {
    pub fn new(program_id: Pubkey, authority: Pubkey) -> Result<Self, Error> {
        Ok(Self {
            program_id,
            authority,
            board: derive("board", &[BOARD], &program_id)?,
            treasury: derive("treasury", &[TREASURY], &program_id)?,
            miner: derive("miner", &[MINER, authority.as_ref()], &program_id)?,
            automation: derive("automation", &[AUTOMATION, authority.as_ref()], &program_id)?,
        })
    }

    /// Round accounts are keyed by the little-endian round id.
    pub fn round(&self, round_id: u64) -> Result<Pubkey, Error> {
        derive("round", &[ROUND, &round_id.to_le_bytes()], &self.program_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let program_id = Pubkey::new_unique();
        let authority = Pubkey::new_unique();
        let first = Addresses::new(program_id, authority).unwrap();
        let second = Addresses::new(program_id, authority).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.round(7).unwrap(), second.round(7).unwrap());
    }

    #[test]
    fn seeds_separate_accounts() {
        let program_id = Pubkey::new_unique();
        let addresses = Addresses::new(program_id, Pubkey::new_unique()).unwrap();
        let other = Addresses::new(program_id, Pubkey::new_unique()).unwrap();

        assert_eq!(addresses.board, other.board);
        assert_eq!(addresses.treasury, other.treasury);
        assert_ne!(addresses.miner, other.miner);
        assert_ne!(addresses.miner, addresses.automation);
        assert_ne!(addresses.round(1).unwrap(), addresses.round(2).unwrap());
    }

    #[test]
    fn matches_find_program_address() {
        let program_id = Pubkey::new_unique();
        let authority = Pubkey::new_unique();
        let addresses = Addresses::new(program_id, authority).unwrap();
        let (miner, _) =
            Pubkey::find_program_address(&[b"miner", authority.as_ref()], &program_id);
        let (round, _) =
            Pubkey::find_program_address(&[b"round", &42u64.to_le_bytes()], &program_id);
        assert_eq!(addresses.miner, miner);
        assert_eq!(addresses.round(42).unwrap(), round);
    }
}
