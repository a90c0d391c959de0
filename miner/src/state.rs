//! Mutable state carried between ticks of the engine.

use std::{
    collections::HashSet,
    time::{Duration, SystemTime},
};

/// How long a motherlode read is reused.
pub const TREASURY_TTL: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Observing,
    Evaluating,
    Betting,
    Skipping,
}

/// Work that blocks new bets and checkpoints until it completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Bet { round_id: u64 },
    Checkpoint { round_id: u64 },
}

#[derive(Clone, Copy, Debug)]
struct CachedTreasury {
    motherlode: f64,
    round_id: u64,
    fetched_at: SystemTime,
}

/// Motherlode cached per round.
#[derive(Clone, Debug, Default)]
pub struct TreasuryCache {
    cached: Option<CachedTreasury>,
}

impl TreasuryCache {
    /// Cached motherlode if it is non-zero, for `round_id` and younger than [TREASURY_TTL].
    pub fn get(&self, round_id: u64, now: SystemTime) -> Option<f64> {
        let cached = self.cached?;
        let age = now.duration_since(cached.fetched_at).unwrap_or_default();
        (cached.round_id == round_id && cached.motherlode > 0.0 && age < TREASURY_TTL)
            .then_some(cached.motherlode)
    }

    pub fn store(&mut self, round_id: u64, motherlode: f64, now: SystemTime) {
        self.cached = Some(CachedTreasury {
            motherlode,
            round_id,
            fetched_at: now,
        });
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }
}

/// Everything the engine remembers between ticks, apart from the persisted
/// stats and ledger.
#[derive(Debug)]
pub struct EngineState {
    pub phase: Phase,
    pub current_round: Option<u64>,
    pub action_in_flight: Option<Action>,
    pub claim_in_flight: bool,
    pub treasury: TreasuryCache,
    /// Rounds whose records have been reconciled since startup.
    pub processed: HashSet<u64>,
    /// Last seen `lifetime_rewards_sol`, set on the first miner read.
    pub lifetime_baseline: Option<u64>,
    pub ore_price: f64,
    pub last_connection_reset: SystemTime,
}

impl EngineState {
    pub fn new(ore_price: f64, now: SystemTime) -> Self {
        Self {
            phase: Phase::Observing,
            current_round: None,
            action_in_flight: None,
            claim_in_flight: false,
            treasury: TreasuryCache::default(),
            processed: HashSet::new(),
            lifetime_baseline: None,
            ore_price,
            last_connection_reset: now,
        }
    }

    /// Track the board's round. Returns `true` when it changed.
    pub fn observe_round(&mut self, round_id: u64) -> bool {
        if self.current_round == Some(round_id) {
            return false;
        }
        self.current_round = Some(round_id);
        self.phase = Phase::Observing;
        self.treasury.invalidate();
        true
    }
}
