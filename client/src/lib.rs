pub mod accounts;
pub mod blockhash;
pub mod instruction;
#[cfg(any(test, feature = "mocks"))]
pub mod mocks;
pub mod rpc;
pub mod transaction;

pub use blockhash::BlockhashCache;
pub use instruction::{Discriminators, Instructions};
pub use rpc::RpcChain;
pub use transaction::TransactionBuilder;

use solana_client::client_error::ClientError;
use solana_sdk::{
    commitment_config::CommitmentConfig, hash::Hash, pubkey::Pubkey, signature::Signature,
    transaction::Transaction,
};
use std::future::Future;
use thiserror::Error;

/// Error type for chain operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("rpc error: {0}")]
    Rpc(#[from] ClientError),
    #[error("account not found: {0}")]
    NotFound(Pubkey),
    #[error(transparent)]
    MalformedAccount(#[from] orebot_types::Error),
    #[error("transaction rejected: {0}")]
    TransactionRejected(String),
    #[error("confirmation timed out: {0}")]
    ConfirmationTimeout(Signature),
}

/// Result type for chain operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Trait for reading from and submitting to the chain.
pub trait Chain: Clone + Send + Sync + 'static {
    /// Fetch the raw account data with the context slot of the read, or `None` if absent.
    fn get_account(
        &self,
        address: &Pubkey,
        commitment: CommitmentConfig,
    ) -> impl Future<Output = Result<Option<(Vec<u8>, u64)>>> + Send;

    fn get_slot(&self) -> impl Future<Output = Result<u64>> + Send;

    /// Balance in lamports.
    fn get_balance(&self, address: &Pubkey) -> impl Future<Output = Result<u64>> + Send;

    fn get_latest_blockhash(&self) -> impl Future<Output = Result<Hash>> + Send;

    /// Submit a signed transaction without waiting for it to land.
    fn send_transaction(
        &self,
        transaction: &Transaction,
        skip_preflight: bool,
    ) -> impl Future<Output = Result<Signature>> + Send;

    /// Wait (bounded) until the transaction is confirmed.
    ///
    /// Fails with [Error::ConfirmationTimeout] if it is not seen in time and
    /// [Error::TransactionRejected] if it landed with an error.
    fn confirm_transaction(
        &self,
        signature: &Signature,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Slot a transaction landed in, if known.
    fn get_transaction_slot(
        &self,
        signature: &Signature,
    ) -> impl Future<Output = Result<Option<u64>>> + Send;

    /// Discard the underlying connection and open a new one.
    fn reset(&self);
}
