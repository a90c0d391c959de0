use crate::{Chain, Result};
use solana_sdk::hash::Hash;
use tracing::debug;

/// A blockhash is reused for at most this many slots after it was fetched.
pub const BLOCKHASH_VALIDITY_SLOTS: u64 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Cached {
    blockhash: Hash,
    fetched_at_slot: u64,
}

/// Recent blockhash, refetched only once it is stale.
#[derive(Clone, Debug, Default)]
pub struct BlockhashCache {
    cached: Option<Cached>,
}

impl BlockhashCache {
    /// The cached blockhash if it is still valid at `current_slot`.
    pub fn get(&self, current_slot: u64) -> Option<Hash> {
        self.cached
            .filter(|cached| {
                current_slot.saturating_sub(cached.fetched_at_slot) < BLOCKHASH_VALIDITY_SLOTS
            })
            .map(|cached| cached.blockhash)
    }

    pub fn store(&mut self, blockhash: Hash, fetched_at_slot: u64) {
        self.cached = Some(Cached {
            blockhash,
            fetched_at_slot,
        });
    }

    pub fn clear(&mut self) {
        self.cached = None;
    }

    /// A valid blockhash for `current_slot`, fetching a new one if needed.
    pub async fn fresh<C: Chain>(&mut self, chain: &C, current_slot: u64) -> Result<Hash> {
        if let Some(blockhash) = self.get(current_slot) {
            return Ok(blockhash);
        }
        let blockhash = chain.get_latest_blockhash().await?;
        debug!(%blockhash, current_slot, "fetched blockhash");
        self.store(blockhash, current_slot);
        Ok(blockhash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockChain;

    #[test]
    fn expires_after_validity_window() {
        let mut cache = BlockhashCache::default();
        assert!(cache.get(0).is_none());

        let blockhash = Hash::new_unique();
        cache.store(blockhash, 1_000);
        assert_eq!(cache.get(1_000), Some(blockhash));
        assert_eq!(cache.get(1_099), Some(blockhash));
        assert_eq!(cache.get(1_100), None);

        cache.clear();
        assert!(cache.get(1_000).is_none());
    }

    #[tokio::test]
    async fn fetches_only_when_stale() {
        let chain = MockChain::new();
        let mut cache = BlockhashCache::default();

        let first = cache.fresh(&chain, 500).await.unwrap();
        let again = cache.fresh(&chain, 550).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(chain.blockhash_requests(), 1);

        let refreshed = cache.fresh(&chain, 600).await.unwrap();
        assert_ne!(first, refreshed);
        assert_eq!(chain.blockhash_requests(), 2);
    }
}
