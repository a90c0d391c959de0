//! Background tasks that outlive a tick.
//!
//! Tasks never touch the ledger or stats. They report a [Completion] over the
//! engine's channel and the engine applies it at the start of its next tick.

use crate::backoff::{jittered_backoff, next_backoff, INITIAL_BACKOFF};
use commonware_runtime::{Clock, Metrics, Spawner};
use futures::channel::mpsc;
use orebot_client::{Chain, Error as ChainError, TransactionBuilder};
use rand::RngCore;
use solana_sdk::{hash::Hash, signature::Signature, transaction::Transaction};
use tracing::{info, warn};

/// Attempts made to land a claim or checkpoint.
pub const MAX_ATTEMPTS: usize = 3;

#[derive(Clone, Debug, PartialEq)]
pub enum Completion {
    /// A deploy's confirmation settled; `landed_slot` is `None` when unknown.
    Deploy {
        round_id: u64,
        signature: Signature,
        landed_slot: Option<u64>,
    },
    Checkpoint { round_id: u64, succeeded: bool },
    Claim { lamports: u64, succeeded: bool },
    Price(f64),
}

fn report(completions: &mpsc::UnboundedSender<Completion>, completion: Completion) {
    if completions.unbounded_send(completion).is_err() {
        warn!("engine stopped before completion was reported");
    }
}

async fn landing_slot<C: Chain>(chain: &C, round_id: u64, signature: &Signature) -> Option<u64> {
    chain
        .get_transaction_slot(signature)
        .await
        .unwrap_or_else(|err| {
            warn!(round_id, %signature, ?err, "failed to fetch landing slot");
            None
        })
}

/// Wait for a sent deploy and report where it landed.
///
/// A deploy that landed with a program error still reports its slot, so a
/// late arrival is told apart from one that landed in time.
pub fn watch_deploy<E: Spawner + Metrics, C: Chain>(
    context: &E,
    chain: C,
    round_id: u64,
    signature: Signature,
    completions: mpsc::UnboundedSender<Completion>,
) {
    context.with_label("confirm").spawn(move |_| async move {
        let landed_slot = match chain.confirm_transaction(&signature).await {
            Ok(()) => landing_slot(&chain, round_id, &signature).await,
            Err(ChainError::TransactionRejected(reason)) => {
                warn!(round_id, %signature, %reason, "deploy landed with an error");
                landing_slot(&chain, round_id, &signature).await
            }
            Err(err) => {
                warn!(round_id, %signature, ?err, "deploy confirmation failed");
                None
            }
        };
        report(
            &completions,
            Completion::Deploy {
                round_id,
                signature,
                landed_slot,
            },
        );
    });
}

/// Send and confirm, rebuilding on a fresh blockhash between attempts.
async fn submit<E, C, F>(
    context: &mut E,
    chain: &C,
    label: &'static str,
    blockhash: Hash,
    build: F,
) -> orebot_client::Result<Signature>
where
    E: Clock + RngCore,
    C: Chain,
    F: Fn(Hash) -> Result<Transaction, orebot_types::Error>,
{
    let mut backoff = INITIAL_BACKOFF;
    let mut blockhash = Some(blockhash);
    let mut attempt = 1;
    loop {
        let result: orebot_client::Result<Signature> = async {
            let blockhash = match blockhash.take() {
                Some(blockhash) => blockhash,
                None => chain.get_latest_blockhash().await?,
            };
            let transaction = build(blockhash)?;
            let signature = chain.send_transaction(&transaction, false).await?;
            chain.confirm_transaction(&signature).await?;
            Ok(signature)
        }
        .await;
        match result {
            Ok(signature) => return Ok(signature),
            Err(err) if attempt >= MAX_ATTEMPTS => return Err(err),
            Err(err) => {
                warn!(label, attempt, ?err, "submission failed; retrying");
                let delay = jittered_backoff(context, backoff);
                context.sleep(delay).await;
                backoff = next_backoff(backoff);
                attempt += 1;
            }
        }
    }
}

/// Settle the miner's rewards for `round_id`.
pub fn spawn_checkpoint<E, C>(
    context: &E,
    chain: C,
    builder: TransactionBuilder,
    round_id: u64,
    blockhash: Hash,
    completions: mpsc::UnboundedSender<Completion>,
) where
    E: Clock + Spawner + Metrics + RngCore,
    C: Chain,
{
    context.with_label("checkpoint").spawn(move |mut context| async move {
        let result = submit(&mut context, &chain, "checkpoint", blockhash, |blockhash| {
            builder.checkpoint(round_id, blockhash)
        })
        .await;
        let succeeded = match result {
            Ok(signature) => {
                info!(round_id, %signature, "checkpointed");
                true
            }
            Err(err) => {
                warn!(round_id, ?err, "checkpoint failed");
                false
            }
        };
        report(
            &completions,
            Completion::Checkpoint {
                round_id,
                succeeded,
            },
        );
    });
}

/// Claim `lamports` of SOL rewards.
pub fn spawn_claim<E, C>(
    context: &E,
    chain: C,
    builder: TransactionBuilder,
    lamports: u64,
    blockhash: Hash,
    completions: mpsc::UnboundedSender<Completion>,
) where
    E: Clock + Spawner + Metrics + RngCore,
    C: Chain,
{
    context.with_label("claim").spawn(move |mut context| async move {
        let result = submit(&mut context, &chain, "claim", blockhash, |blockhash| {
            Ok(builder.claim_sol(blockhash))
        })
        .await;
        let succeeded = match result {
            Ok(signature) => {
                info!(lamports, %signature, "claimed sol");
                true
            }
            Err(err) => {
                warn!(lamports, ?err, "claim failed");
                false
            }
        };
        report(&completions, Completion::Claim { lamports, succeeded });
    });
}
