//! Program instructions.
//!
//! Deploy data is `[discriminator] ++ amount (u64 LE) ++ square mask (u32 LE)`.
//! Claim and checkpoint carry only their discriminator.

use bytes::BufMut;
use orebot_types::{Addresses, Error, SQUARES};
use serde::{Deserialize, Serialize};
use solana_sdk::{
    instruction::{AccountMeta, Instruction},
    system_program,
};

/// Length of deploy instruction data.
pub const DEPLOY_DATA_LEN: usize = 13;

/// Opcodes of the program's instructions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Discriminators {
    pub deploy: u8,
    pub claim_sol: u8,
    pub checkpoint: u8,
}

impl Default for Discriminators {
    fn default() -> Self {
        Self {
            deploy: 6,
            claim_sol: 3,
            checkpoint: 2,
        }
    }
}

/// Bitmask with bit `i` set for every square `i` (squares past 24 are ignored).
pub fn square_mask(squares: &[usize]) -> u32 {
    squares
        .iter()
        .filter(|&&square| square < SQUARES)
        .fold(0u32, |mask, &square| mask | (1 << square))
}

/// Builds instructions for one authority.
#[derive(Clone, Copy, Debug)]
pub struct Instructions {
    addresses: Addresses,
    discriminators: Discriminators,
}

impl Instructions {
    pub fn new(addresses: Addresses, discriminators: Discriminators) -> Self {
        Self {
            addresses,
            discriminators,
        }
    }

    pub fn addresses(&self) -> &Addresses {
        &self.addresses
    }

    /// Stake `amount` lamports on each of `squares` in `round_id`.
    pub fn deploy(&self, round_id: u64, amount: u64, squares: &[usize]) -> Result<Instruction, Error> {
        let addresses = &self.addresses;
        let round = addresses.round(round_id)?;

        let mut data = Vec::with_capacity(DEPLOY_DATA_LEN);
        data.put_u8(self.discriminators.deploy);
        data.put_u64_le(amount);
        data.put_u32_le(square_mask(squares));

        Ok(Instruction {
            program_id: addresses.program_id,
            accounts: vec![
                AccountMeta::new(addresses.authority, true),
                AccountMeta::new(addresses.authority, false),
                AccountMeta::new(addresses.automation, false),
                AccountMeta::new(addresses.board, false),
                AccountMeta::new(addresses.miner, false),
                AccountMeta::new(round, false),
                AccountMeta::new_readonly(system_program::id(), false),
            ],
            data,
        })
    }

    pub fn claim_sol(&self) -> Instruction {
        let addresses = &self.addresses;
        Instruction {
            program_id: addresses.program_id,
            accounts: vec![
                AccountMeta::new(addresses.authority, true),
                AccountMeta::new(addresses.miner, false),
                AccountMeta::new_readonly(system_program::id(), false),
            ],
            data: vec![self.discriminators.claim_sol],
        }
    }

    /// Settle the miner's rewards for `round_id`.
    pub fn checkpoint(&self, round_id: u64) -> Result<Instruction, Error> {
        let addresses = &self.addresses;
        Ok(Instruction {
            program_id: addresses.program_id,
            accounts: vec![
                AccountMeta::new(addresses.authority, true),
                AccountMeta::new(addresses.board, false),
                AccountMeta::new(addresses.miner, false),
                AccountMeta::new(addresses.round(round_id)?, false),
                AccountMeta::new(addresses.treasury, false),
                AccountMeta::new_readonly(system_program::id(), false),
            ],
            data: vec![self.discriminators.checkpoint],
        })
    }
}
