//! In-memory [Chain] for tests.

use crate::{Chain, Error, Result};
use orebot_types::{Addresses, Deployed, Miner, SQUARES};
use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_sdk::{
    commitment_config::CommitmentConfig, hash::Hash, pubkey::Pubkey, signature::Signature,
    transaction::Transaction,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

/// How sent transactions resolve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Landing {
    /// Confirmed in the given slot.
    At(u64),
    /// Confirmed in whatever slot the chain is at when confirmation is requested.
    CurrentSlot,
    /// Landed in the given slot, but the program returned an error.
    Failed(u64),
    /// Confirmation times out and the landing slot is unknown.
    Never,
}

#[derive(Default)]
struct State {
    accounts: HashMap<Pubkey, Vec<u8>>,
    slot: u64,
    balance: u64,
    sent: Vec<Transaction>,
    landed: HashMap<Signature, (u64, bool)>,
    landing: Option<Landing>,
    failing_reads: usize,
    failing_sends: usize,
    blockhash_requests: usize,
    resets: usize,
}

/// Chain state under test control. Clones share state.
#[derive(Clone)]
pub struct MockChain {
    program_id: Pubkey,
    authority: Pubkey,
    state: Arc<Mutex<State>>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

fn put_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn injected() -> Error {
    Error::Rpc(ClientError::from(ClientErrorKind::Custom(
        "injected failure".to_string(),
    )))
}

impl MockChain {
    pub fn new() -> Self {
        Self::with_authority(Pubkey::new_unique())
    }

    pub fn with_authority(authority: Pubkey) -> Self {
        Self {
            program_id: Pubkey::new_unique(),
            authority,
            state: Arc::new(Mutex::new(State {
                landing: Some(Landing::CurrentSlot),
                ..Default::default()
            })),
        }
    }

    pub fn program_id(&self) -> Pubkey {
        self.program_id
    }

    pub fn addresses(&self) -> Addresses {
        Addresses::new(self.program_id, self.authority).expect("addresses derive")
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_account(&self, address: Pubkey, data: Vec<u8>) {
        self.with(|state| state.accounts.insert(address, data));
    }

    pub fn remove_account(&self, address: &Pubkey) {
        self.with(|state| state.accounts.remove(address));
    }

    pub fn set_board(&self, round_id: u64, start_slot: u64, end_slot: u64) {
        let mut data = vec![0u8; 32];
        put_u64(&mut data, 8, round_id);
        put_u64(&mut data, 16, start_slot);
        put_u64(&mut data, 24, end_slot);
        self.set_account(self.addresses().board, data);
    }

    pub fn set_round(&self, round_id: u64, deployed: Deployed) {
        let mut data = vec![0u8; 16 + SQUARES * 8];
        for (square, stake) in deployed.iter().enumerate() {
            put_u64(&mut data, 16 + square * 8, *stake);
        }
        let address = self.addresses().round(round_id).expect("round address");
        self.set_account(address, data);
    }

    pub fn set_miner(&self, miner: Miner) {
        let mut data = vec![0u8; 528];
        put_u64(&mut data, 448, miner.checkpoint_id);
        put_u64(&mut data, 488, miner.rewards_sol);
        put_u64(&mut data, 496, miner.rewards_ore);
        put_u64(&mut data, 504, miner.refined_ore);
        put_u64(&mut data, 512, miner.round_id);
        put_u64(&mut data, 520, miner.lifetime_rewards_sol);
        self.set_account(self.addresses().miner, data);
    }

    /// Motherlode in whole ORE.
    pub fn set_treasury(&self, motherlode: f64) {
        let mut data = vec![0u8; 24];
        put_u64(&mut data, 16, (motherlode * 1e11) as u64);
        self.set_account(self.addresses().treasury, data);
    }

    pub fn set_slot(&self, slot: u64) {
        self.with(|state| state.slot = slot);
    }

    pub fn set_balance(&self, balance: u64) {
        self.with(|state| state.balance = balance);
    }

    pub fn set_landing(&self, landing: Landing) {
        self.with(|state| state.landing = Some(landing));
    }

    /// Fail the next `count` account and slot reads.
    pub fn fail_reads(&self, count: usize) {
        self.with(|state| state.failing_reads = count);
    }

    /// Fail the next `count` submissions.
    pub fn fail_sends(&self, count: usize) {
        self.with(|state| state.failing_sends = count);
    }

    /// Every transaction accepted so far, oldest first.
    pub fn sent(&self) -> Vec<Transaction> {
        self.with(|state| state.sent.clone())
    }

    pub fn blockhash_requests(&self) -> usize {
        self.with(|state| state.blockhash_requests)
    }

    pub fn resets(&self) -> usize {
        self.with(|state| state.resets)
    }

    fn read(&self) -> Result<()> {
        self.with(|state| {
            if state.failing_reads > 0 {
                state.failing_reads -= 1;
                return Err(injected());
            }
            Ok(())
        })
    }

    /// Landing slot and failure flag for a signature, resolving it on first request.
    fn resolve(&self, signature: &Signature) -> Option<(u64, bool)> {
        self.with(|state| {
            if let Some(landed) = state.landed.get(signature) {
                return Some(*landed);
            }
            let landed = match state.landing? {
                Landing::At(slot) => (slot, false),
                Landing::CurrentSlot => (state.slot, false),
                Landing::Failed(slot) => (slot, true),
                Landing::Never => return None,
            };
            state.landed.insert(*signature, landed);
            Some(landed)
        })
    }
}

impl Chain for MockChain {
    async fn get_account(
        &self,
        address: &Pubkey,
        _commitment: CommitmentConfig,
    ) -> Result<Option<(Vec<u8>, u64)>> {
        self.read()?;
        Ok(self.with(|state| {
            state
                .accounts
                .get(address)
                .map(|data| (data.clone(), state.slot))
        }))
    }

    async fn get_slot(&self) -> Result<u64> {
        self.read()?;
        Ok(self.with(|state| state.slot))
    }

    async fn get_balance(&self, _address: &Pubkey) -> Result<u64> {
        self.read()?;
        Ok(self.with(|state| state.balance))
    }

    async fn get_latest_blockhash(&self) -> Result<Hash> {
        self.with(|state| state.blockhash_requests += 1);
        Ok(Hash::new_unique())
    }

    async fn send_transaction(
        &self,
        transaction: &Transaction,
        _skip_preflight: bool,
    ) -> Result<Signature> {
        self.with(|state| {
            if state.failing_sends > 0 {
                state.failing_sends -= 1;
                return Err(Error::TransactionRejected("injected failure".to_string()));
            }
            state.sent.push(transaction.clone());
            Ok(Signature::new_unique())
        })
    }

    async fn confirm_transaction(&self, signature: &Signature) -> Result<()> {
        match self.resolve(signature) {
            Some((_, false)) => Ok(()),
            Some((_, true)) => Err(Error::TransactionRejected(
                "custom program error: 0x1".to_string(),
            )),
            None => Err(Error::ConfirmationTimeout(*signature)),
        }
    }

    async fn get_transaction_slot(&self, signature: &Signature) -> Result<Option<u64>> {
        Ok(self.resolve(signature).map(|(slot, _)| slot))
    }

    fn reset(&self) {
        self.with(|state| state.resets += 1);
    }
}
