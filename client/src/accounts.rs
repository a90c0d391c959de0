//! Typed account reads on top of [Chain].

use crate::{Chain, Error, Result};
use orebot_types::{Addresses, Board, Miner, Round, RoundState, Treasury};
use solana_sdk::{commitment_config::CommitmentConfig, pubkey::Pubkey};

async fn fetch<C: Chain>(
    chain: &C,
    address: &Pubkey,
    commitment: CommitmentConfig,
) -> Result<(Vec<u8>, u64)> {
    chain
        .get_account(address, commitment)
        .await?
        .ok_or(Error::NotFound(*address))
}

pub async fn board<C: Chain>(chain: &C, addresses: &Addresses) -> Result<Board> {
    let (data, _) = fetch(chain, &addresses.board, CommitmentConfig::confirmed()).await?;
    Ok(Board::decode(&data)?)
}

/// Round account read at `processed` so the board is as fresh as possible.
///
/// Returns the decoded round with the context slot it was read at.
pub async fn round<C: Chain>(
    chain: &C,
    addresses: &Addresses,
    round_id: u64,
) -> Result<(Round, u64)> {
    let address = addresses.round(round_id)?;
    let (data, slot) = fetch(chain, &address, CommitmentConfig::processed()).await?;
    Ok((Round::decode(&data)?, slot))
}

/// Read the board and its current round together.
pub async fn round_state<C: Chain>(chain: &C, addresses: &Addresses) -> Result<RoundState> {
    let board = board(chain, addresses).await?;
    let (round, observed_slot) = round(chain, addresses, board.round_id).await?;
    Ok(RoundState::new(board, round, observed_slot))
}

pub async fn miner<C: Chain>(chain: &C, addresses: &Addresses) -> Result<Miner> {
    let (data, _) = fetch(chain, &addresses.miner, CommitmentConfig::confirmed()).await?;
    Ok(Miner::decode(&data)?)
}

pub async fn treasury<C: Chain>(chain: &C, addresses: &Addresses) -> Result<Treasury> {
    let (data, _) = fetch(chain, &addresses.treasury, CommitmentConfig::confirmed()).await?;
    Ok(Treasury::decode(&data)?)
}
