use crate::Instructions;
use orebot_types::Error;
use solana_sdk::{
    compute_budget::ComputeBudgetInstruction,
    hash::Hash,
    instruction::Instruction,
    signature::{Keypair, Signer},
    transaction::Transaction,
};
use std::sync::Arc;

/// Compute units requested for a deploy.
pub const DEFAULT_COMPUTE_UNIT_LIMIT: u32 = 300_000;

/// Assembles and signs transactions with the bot's keypair as fee payer.
#[derive(Clone)]
pub struct TransactionBuilder {
    signer: Arc<Keypair>,
    instructions: Instructions,
    compute_unit_limit: u32,
}

impl TransactionBuilder {
    pub fn new(signer: Arc<Keypair>, instructions: Instructions, compute_unit_limit: u32) -> Self {
        Self {
            signer,
            instructions,
            compute_unit_limit,
        }
    }

    pub fn instructions(&self) -> &Instructions {
        &self.instructions
    }

    fn sign(&self, instructions: &[Instruction], blockhash: Hash) -> Transaction {
        Transaction::new_signed_with_payer(
            instructions,
            Some(&self.signer.pubkey()),
            &[self.signer.as_ref()],
            blockhash,
        )
    }

    /// Deploy prefixed with a compute-unit limit (it touches many accounts).
    pub fn deploy(
        &self,
        round_id: u64,
        amount: u64,
        squares: &[usize],
        blockhash: Hash,
    ) -> Result<Transaction, Error> {
        let budget = ComputeBudgetInstruction::set_compute_unit_limit(self.compute_unit_limit);
        let deploy = self.instructions.deploy(round_id, amount, squares)?;
        Ok(self.sign(&[budget, deploy], blockhash))
    }

    pub fn claim_sol(&self, blockhash: Hash) -> Transaction {
        self.sign(&[self.instructions.claim_sol()], blockhash)
    }

    pub fn checkpoint(&self, round_id: u64, blockhash: Hash) -> Result<Transaction, Error> {
        let checkpoint = self.instructions.checkpoint(round_id)?;
        Ok(self.sign(&[checkpoint], blockhash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Discriminators;
    use orebot_types::Addresses;
    use solana_sdk::{compute_budget, pubkey::Pubkey};

    fn builder() -> TransactionBuilder {
        let signer = Arc::new(Keypair::new());
        let addresses = Addresses::new(Pubkey::new_unique(), signer.pubkey()).unwrap();
        TransactionBuilder::new(
            signer,
            Instructions::new(addresses, Discriminators::default()),
            DEFAULT_COMPUTE_UNIT_LIMIT,
        )
    }

    #[test]
    fn deploy_is_signed_by_payer() {
        let builder = builder();
        let blockhash = Hash::new_unique();
        let tx = builder.deploy(3, 1_000, &[1, 2], blockhash).unwrap();

        assert_eq!(tx.message.recent_blockhash, blockhash);
        assert_eq!(tx.message.account_keys[0], builder.signer.pubkey());
        assert_eq!(tx.message.instructions.len(), 2);
        let budget_program = tx.message.instructions[0].program_id(&tx.message.account_keys);
        assert_eq!(*budget_program, compute_budget::id());
        assert!(tx.verify().is_ok());
    }

    #[test]
    fn claim_and_checkpoint_have_no_budget() {
        let builder = builder();
        let claim = builder.claim_sol(Hash::new_unique());
        assert_eq!(claim.message.instructions.len(), 1);
        assert_eq!(claim.message.instructions[0].data, vec![3]);

        let checkpoint = builder.checkpoint(8, Hash::new_unique()).unwrap();
        assert_eq!(checkpoint.message.instructions[0].data, vec![2]);
        assert!(checkpoint.verify().is_ok());
    }
}
