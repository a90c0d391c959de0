//! [Chain] over Solana JSON-RPC.

use crate::{Chain, Error, Result};
use solana_client::{nonblocking::rpc_client::RpcClient, rpc_config::RpcSendTransactionConfig};
use solana_sdk::{
    commitment_config::CommitmentConfig, hash::Hash, pubkey::Pubkey, signature::Signature,
    transaction::Transaction,
};
use solana_transaction_status::TransactionStatus;
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// How long [RpcChain::confirm_transaction] waits for a signature.
pub const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Delay between signature status polls.
const CONFIRMATION_POLL: Duration = Duration::from_millis(500);

/// JSON-RPC connection that can be recreated in place.
#[derive(Clone)]
pub struct RpcChain {
    url: String,
    commitment: CommitmentConfig,
    client: Arc<Mutex<Arc<RpcClient>>>,
}

impl RpcChain {
    pub fn new(url: &str) -> Self {
        let commitment = CommitmentConfig::confirmed();
        let client = RpcClient::new_with_commitment(url.to_string(), commitment);
        Self {
            url: url.to_string(),
            commitment,
            client: Arc::new(Mutex::new(Arc::new(client))),
        }
    }

    fn client(&self) -> Arc<RpcClient> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Interpret a signature status: `None` while the transaction is not yet confirmed.
fn settled(status: &TransactionStatus) -> Option<Result<()>> {
    if !status.satisfies_commitment(CommitmentConfig::confirmed()) {
        return None;
    }
    Some(match &status.err {
        Some(err) => Err(Error::TransactionRejected(err.to_string())),
        None => Ok(()),
    })
}

impl Chain for RpcChain {
    async fn get_account(
        &self,
        address: &Pubkey,
        commitment: CommitmentConfig,
    ) -> Result<Option<(Vec<u8>, u64)>> {
        let response = self
            .client()
            .get_account_with_commitment(address, commitment)
            .await?;
        let slot = response.context.slot;
        Ok(response.value.map(|account| (account.data, slot)))
    }

    async fn get_slot(&self) -> Result<u64> {
        Ok(self
            .client()
            .get_slot_with_commitment(CommitmentConfig::processed())
            .await?)
    }

    async fn get_balance(&self, address: &Pubkey) -> Result<u64> {
        Ok(self.client().get_balance(address).await?)
    }

    async fn get_latest_blockhash(&self) -> Result<Hash> {
        Ok(self.client().get_latest_blockhash().await?)
    }

    async fn send_transaction(
        &self,
        transaction: &Transaction,
        skip_preflight: bool,
    ) -> Result<Signature> {
        let config = RpcSendTransactionConfig {
            skip_preflight,
            // Deploys are not worth rebroadcasting once the round is over.
            max_retries: Some(0),
            preflight_commitment: Some(self.commitment.commitment),
            ..Default::default()
        };
        let signature = self
            .client()
            .send_transaction_with_config(transaction, config)
            .await?;
        debug!(%signature, skip_preflight, "sent transaction");
        Ok(signature)
    }

    async fn confirm_transaction(&self, signature: &Signature) -> Result<()> {
        let client = self.client();
        let deadline = Instant::now() + CONFIRMATION_TIMEOUT;
        while Instant::now() < deadline {
            let statuses = client.get_signature_statuses(&[*signature]).await?;
            if let Some(outcome) = statuses.value.first().and_then(Option::as_ref).and_then(settled)
            {
                return outcome;
            }
            sleep(CONFIRMATION_POLL).await;
        }
        Err(Error::ConfirmationTimeout(*signature))
    }

    async fn get_transaction_slot(&self, signature: &Signature) -> Result<Option<u64>> {
        let statuses = self
            .client()
            .get_signature_statuses_with_history(&[*signature])
            .await?;
        Ok(statuses
            .value
            .into_iter()
            .next()
            .flatten()
            .map(|status| status.slot))
    }

    fn reset(&self) {
        let client = RpcClient::new_with_commitment(self.url.clone(), self.commitment);
        *self.client.lock().unwrap_or_else(PoisonError::into_inner) = Arc::new(client);
        info!("recreated rpc connection");
    }
}
