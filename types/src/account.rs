//! Fixed-offset decoders for the program's on-chain accounts.
//!
//! Offsets are an external contract with the program. Decoders only check that
//! the buffer is long enough for the fields they read and never guess at
//! layout versions.

use crate::{Deployed, Error, SQUARES};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Treasury `motherlode` is stored with 11 decimals.
const MOTHERLODE_SCALE: f64 = 100_000_000_000.0;

const BOARD_ROUND_ID: usize = 8;
const BOARD_START_SLOT: usize = 16;
const BOARD_END_SLOT: usize = 24;

const ROUND_DEPLOYED: usize = 16;

const MINER_CHECKPOINT_ID: usize = 448;
const MINER_REWARDS_SOL: usize = 488;
const MINER_REWARDS_ORE: usize = 496;
const MINER_REFINED_ORE: usize = 504;
const MINER_ROUND_ID: usize = 512;
const MINER_LIFETIME_REWARDS_SOL: usize = 520;

const TREASURY_MOTHERLODE: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccountKind {
    Board,
    Round,
    Miner,
    Treasury,
}

impl AccountKind {
    /// Smallest buffer that holds every field read for this kind.
    pub const fn min_len(self) -> usize {
        match self {
            AccountKind::Board => BOARD_END_SLOT + 8,
            AccountKind::Round => ROUND_DEPLOYED + SQUARES * 8,
            AccountKind::Miner => MINER_LIFETIME_REWARDS_SOL + 8,
            AccountKind::Treasury => TREASURY_MOTHERLODE + 8,
        }
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccountKind::Board => "board",
            AccountKind::Round => "round",
            AccountKind::Miner => "miner",
            AccountKind::Treasury => "treasury",
        };
        f.write_str(name)
    }
}

fn ensure_len(kind: AccountKind, data: &[u8]) -> Result<(), Error> {
    let min = kind.min_len();
    if data.len() < min {
        return Err(Error::MalformedAccount {
            kind,
            len: data.len(),
            min,
        });
    }
    Ok(())
}

/// Caller must have checked the length with [ensure_len].
fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Board {
    pub round_id: u64,
    pub start_slot: u64,
    pub end_slot: u64,
}

impl Board {
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        ensure_len(AccountKind::Board, data)?;
        Ok(Self {
            round_id: read_u64(data, BOARD_ROUND_ID),
            start_slot: read_u64(data, BOARD_START_SLOT),
            end_slot: read_u64(data, BOARD_END_SLOT),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Round {
    pub deployed: Deployed,
}

impl Round {
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        ensure_len(AccountKind::Round, data)?;
        let mut deployed = [0u64; SQUARES];
        for (square, stake) in deployed.iter_mut().enumerate() {
            *stake = read_u64(data, ROUND_DEPLOYED + square * 8);
        }
        Ok(Self { deployed })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Miner {
    pub checkpoint_id: u64,
    pub rewards_sol: u64,
    pub rewards_ore: u64,
    pub refined_ore: u64,
    pub round_id: u64,
    pub lifetime_rewards_sol: u64,
}

impl Miner {
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        ensure_len(AccountKind::Miner, data)?;
        Ok(Self {
            checkpoint_id: read_u64(data, MINER_CHECKPOINT_ID),
            rewards_sol: read_u64(data, MINER_REWARDS_SOL),
            rewards_ore: read_u64(data, MINER_REWARDS_ORE),
            refined_ore: read_u64(data, MINER_REFINED_ORE),
            round_id: read_u64(data, MINER_ROUND_ID),
            lifetime_rewards_sol: read_u64(data, MINER_LIFETIME_REWARDS_SOL),
        })
    }

    /// Whether rewards for the last round this miner deployed to are still unsettled.
    pub fn needs_checkpoint(&self) -> bool {
        self.round_id > 0 && self.checkpoint_id != self.round_id
    }

    /// Unclaimed ORE (rewards plus refined), in whole tokens.
    pub fn unclaimed_ore(&self) -> f64 {
        self.rewards_ore.saturating_add(self.refined_ore) as f64 / MOTHERLODE_SCALE
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Treasury {
    pub motherlode: f64,
}

impl Treasury {
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        ensure_len(AccountKind::Treasury, data)?;
        Ok(Self {
            motherlode: read_u64(data, TREASURY_MOTHERLODE) as f64 / MOTHERLODE_SCALE,
        })
    }
}

/// Snapshot of one round, rebuilt on every observation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoundState {
    pub round_id: u64,
    pub start_slot: u64,
    pub end_slot: u64,
    pub deployed: Deployed,
    /// Context slot of the round-account read.
    pub observed_slot: u64,
}

impl RoundState {
    pub fn new(board: Board, round: Round, observed_slot: u64) -> Self {
        Self {
            round_id: board.round_id,
            start_slot: board.start_slot,
            end_slot: board.end_slot,
            deployed: round.deployed,
            observed_slot,
        }
    }

    /// Slots until the round's end slot (negative once it has passed).
    pub fn slots_remaining(&self, current_slot: u64) -> i64 {
        self.end_slot as i64 - current_slot as i64
    }
}
