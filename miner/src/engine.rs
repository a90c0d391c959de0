use crate::{
    confirm::{self, Completion},
    decision::{self, Decision, Policy, Window},
    poller::{poll_interval, ErrorTracker, CONNECTION_REFRESH_INTERVAL},
    price::PriceFeed,
    reconciler,
    state::{Action, EngineState, Phase},
    store::Store,
    Error,
};
use commonware_runtime::{Clock, Metrics, Spawner};
use futures::{channel::mpsc, FutureExt, StreamExt};
use orebot_client::{accounts, BlockhashCache, Chain, Error as ChainError, TransactionBuilder};
use orebot_types::{
    lamports_to_sol, Addresses, AllocationStrategy, BetRecord, BetResult, Confirmation, Ledger,
    Miner, RoundState, Stats,
};
use prometheus_client::metrics::counter::Counter;
use rand::RngCore;
use solana_sdk::signature::Signature;
use std::{ops::RangeInclusive, str::FromStr, sync::atomic::AtomicU64, time::Duration};
use tracing::{debug, error, info, warn};

/// Slots remaining in which the blockhash is refreshed ahead of betting.
const PREFETCH_WINDOW: RangeInclusive<i64> = 16..=25;

/// Slots remaining in which a pending checkpoint is sent.
const CHECKPOINT_WINDOW: RangeInclusive<i64> = 21..=140;

/// Configuration for the betting engine
pub struct EngineConfig {
    pub policy: Policy,
    /// Initial ORE price in SOL.
    pub ore_price: f64,
    pub price_feed: Option<PriceFeed>,
}

#[derive(Default)]
struct Counters {
    bets_sent: Counter<u64, AtomicU64>,
    bets_skipped: Counter<u64, AtomicU64>,
    bets_missed: Counter<u64, AtomicU64>,
    wins: Counter<u64, AtomicU64>,
    losses: Counter<u64, AtomicU64>,
    connection_resets: Counter<u64, AtomicU64>,
    claims: Counter<u64, AtomicU64>,
}

impl Counters {
    fn register(context: &impl Metrics) -> Self {
        let counters = Self::default();
        context.register("bets_sent", "Number of deploys sent", counters.bets_sent.clone());
        context.register(
            "bets_skipped",
            "Number of rounds skipped for low EV",
            counters.bets_skipped.clone(),
        );
        context.register(
            "bets_missed",
            "Number of deploys that landed after the round ended",
            counters.bets_missed.clone(),
        );
        context.register("wins", "Number of rounds won", counters.wins.clone());
        context.register("losses", "Number of rounds lost", counters.losses.clone());
        context.register(
            "connection_resets",
            "Number of times the RPC connection was recreated",
            counters.connection_resets.clone(),
        );
        context.register("claims", "Number of successful SOL claims", counters.claims.clone());
        counters
    }
}

/// Watches the board and bets near the end of each round.
pub struct Engine<E, C, S>
where
    E: Clock + Spawner + Metrics + RngCore,
    C: Chain,
    S: Store,
{
    context: E,
    config: EngineConfig,
    chain: C,
    builder: TransactionBuilder,
    addresses: Addresses,
    store: S,

    ledger: Ledger,
    stats: Stats,
    state: EngineState,
    blockhash: BlockhashCache,
    errors: ErrorTracker,

    pub(crate) completions: mpsc::UnboundedSender<Completion>,
    receiver: mpsc::UnboundedReceiver<Completion>,
    counters: Counters,
}

impl<E, C, S> Engine<E, C, S>
where
    E: Clock + Spawner + Metrics + RngCore,
    C: Chain,
    S: Store,
{
    pub fn new(
        context: E,
        config: EngineConfig,
        chain: C,
        builder: TransactionBuilder,
        store: S,
    ) -> Result<Self, Error> {
        let stats = store.load_stats()?;
        let ledger = store.load_ledger()?;
        info!(
            records = ledger.len(),
            rounds_played = stats.rounds_played,
            last_bet_round = stats.last_bet_round,
            "loaded history"
        );

        let counters = Counters::register(&context);
        let state = EngineState::new(config.ore_price, context.current());
        let addresses = *builder.instructions().addresses();
        let (completions, receiver) = mpsc::unbounded();
        let mut engine = Self {
            context,
            config,
            chain,
            builder,
            addresses,
            store,
            ledger,
            stats,
            state,
            blockhash: BlockhashCache::default(),
            errors: ErrorTracker::default(),
            completions,
            receiver,
            counters,
        };
        engine.resume_confirmations();
        Ok(engine)
    }

    /// Watch again every deploy that was sent but not settled before the last stop.
    fn resume_confirmations(&mut self) {
        let awaiting: Vec<(u64, Option<String>)> = self
            .ledger
            .iter()
            .filter(|record| {
                record.result == BetResult::Pending
                    && record.confirmation == Confirmation::Awaiting
            })
            .map(|record| (record.round_id, record.signature.clone()))
            .collect();

        let mut changed = false;
        for (round_id, signature) in awaiting {
            match signature.as_deref().map(Signature::from_str) {
                Some(Ok(signature)) => {
                    info!(round_id, %signature, "resuming deploy confirmation");
                    confirm::watch_deploy(
                        &self.context,
                        self.chain.clone(),
                        round_id,
                        signature,
                        self.completions.clone(),
                    );
                }
                _ => {
                    warn!(round_id, ?signature, "deploy signature missing or invalid");
                    if let Some(record) = self.ledger.pending_mut(round_id) {
                        record.confirmation = Confirmation::Unknown;
                        changed = true;
                    }
                }
            }
        }
        if changed {
            self.persist();
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    fn persist(&self) {
        if let Err(err) = self.store.save_stats(&self.stats) {
            error!(?err, "failed to save stats");
        }
        if let Err(err) = self.store.save_ledger(&self.ledger) {
            error!(?err, "failed to save history");
        }
    }

    fn reset_connection(&mut self) {
        self.chain.reset();
        self.blockhash.clear();
        self.state.last_connection_reset = self.context.current();
        self.counters.connection_resets.inc();
    }

    /// Run one tick and report how long to sleep before the next.
    pub async fn step(&mut self) -> Duration {
        let since_reset = self
            .context
            .current()
            .duration_since(self.state.last_connection_reset)
            .unwrap_or_default();
        if since_reset >= CONNECTION_REFRESH_INTERVAL {
            debug!("refreshing connection");
            self.reset_connection();
        }

        match self.tick().await {
            Ok(slots_remaining) => {
                self.errors.success();
                poll_interval(slots_remaining)
            }
            Err(err) => {
                warn!(?err, consecutive = self.errors.consecutive() + 1, "tick failed");
                if let Err(degraded) = self.errors.failure() {
                    warn!(%degraded, "resetting connection");
                    self.reset_connection();
                }
                poll_interval(None)
            }
        }
    }

    pub async fn run(mut self) {
        if let Some(feed) = self.config.price_feed.take() {
            feed.spawn(self.context.with_label("price"), self.completions.clone());
        }
        loop {
            let interval = self.step().await;
            self.context.sleep(interval).await;
        }
    }

    /// Apply everything background tasks reported since the last tick.
    fn drain_completions(&mut self) {
        let mut changed = false;
        while let Some(Some(completion)) = self.receiver.next().now_or_never() {
            changed |= self.apply(completion);
        }
        if changed {
            self.persist();
        }
    }

    /// Returns whether persisted state changed.
    fn apply(&mut self, completion: Completion) -> bool {
        match completion {
            Completion::Deploy {
                round_id,
                signature,
                landed_slot,
            } => self.settle_deploy(round_id, signature, landed_slot),
            Completion::Checkpoint {
                round_id,
                succeeded,
            } => {
                debug!(round_id, succeeded, "checkpoint finished");
                if self.state.action_in_flight == Some(Action::Checkpoint { round_id }) {
                    self.state.action_in_flight = None;
                }
                false
            }
            Completion::Claim {
                lamports,
                succeeded,
            } => {
                self.state.claim_in_flight = false;
                if !succeeded {
                    return false;
                }
                self.stats.sol_claimed += lamports;
                self.counters.claims.inc();
                true
            }
            Completion::Price(price) => {
                self.state.ore_price = price;
                false
            }
        }
    }

    fn settle_deploy(&mut self, round_id: u64, signature: Signature, landed_slot: Option<u64>) -> bool {
        let Some(record) = self.ledger.pending_mut(round_id) else {
            debug!(round_id, "no pending record for confirmation");
            return false;
        };
        let Some(slot) = landed_slot else {
            warn!(round_id, %signature, "deploy landing unknown");
            record.confirmation = Confirmation::Unknown;
            return true;
        };

        let slots_before_end = record.end_slot as i64 - slot as i64;
        record.confirmation = Confirmation::Landed {
            slot,
            slots_before_end,
        };
        if slots_before_end > 0 {
            info!(round_id, slot, slots_before_end, "deploy landed");
            return true;
        }

        // Stake landed after the round ended: it never counted as played.
        let slots_late = slots_before_end.unsigned_abs();
        record.result = BetResult::Missed { slots_late };
        self.stats.rounds_played = self.stats.rounds_played.saturating_sub(1);
        self.counters.bets_missed.inc();
        let missed = Error::DeadlineMissed {
            round_id,
            slots_late,
        };
        warn!(%signature, "{missed}");
        true
    }

    async fn motherlode(&mut self, round_id: u64) -> Result<f64, Error> {
        let now = self.context.current();
        if let Some(motherlode) = self.state.treasury.get(round_id, now) {
            return Ok(motherlode);
        }
        let treasury = accounts::treasury(&self.chain, &self.addresses).await?;
        self.state.treasury.store(round_id, treasury.motherlode, now);
        Ok(treasury.motherlode)
    }

    async fn miner(&self) -> Result<Option<Miner>, Error> {
        match accounts::miner(&self.chain, &self.addresses).await {
            Ok(miner) => Ok(Some(miner)),
            Err(ChainError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Observe the round, reconcile, and act if the round calls for it.
    ///
    /// Returns the slots remaining in the round, or `None` if the tick was
    /// deferred because an action is still in flight.
    pub async fn tick(&mut self) -> Result<Option<i64>, Error> {
        self.drain_completions();
        if let Some(action) = self.state.action_in_flight {
            debug!(?action, "action in flight");
            return Ok(None);
        }

        // Observe
        let round = accounts::round_state(&self.chain, &self.addresses).await?;
        let slot = self.chain.get_slot().await?;
        let new_round = self.state.observe_round(round.round_id);
        let slots_remaining = round.slots_remaining(slot);
        let motherlode = self.motherlode(round.round_id).await?;
        let miner = self.miner().await?;
        if let (None, Some(miner)) = (self.state.lifetime_baseline, &miner) {
            self.state.lifetime_baseline = Some(miner.lifetime_rewards_sol);
        }
        if new_round {
            self.report_round(&round, motherlode, miner.as_ref()).await;
        }

        // Reconcile closed rounds
        let outcome = reconciler::reconcile(
            &self.chain,
            &self.addresses,
            &mut self.ledger,
            &mut self.stats,
            &mut self.state,
            miner.as_ref(),
            round.round_id,
        )
        .await;
        self.counters.wins.inc_by(outcome.wins as u64);
        self.counters.losses.inc_by(outcome.losses as u64);
        if outcome.changed {
            self.persist();
        }
        if let Some(lamports) = outcome.claim {
            self.claim(lamports, slot).await?;
        }

        if PREFETCH_WINDOW.contains(&slots_remaining) {
            self.blockhash.fresh(&self.chain, slot).await?;
        }

        if let Some(miner) = miner.as_ref().filter(|miner| miner.needs_checkpoint()) {
            if CHECKPOINT_WINDOW.contains(&slots_remaining) {
                self.checkpoint(miner.round_id, slot).await?;
                return Ok(Some(slots_remaining));
            }
        }

        // Decide
        let policy = &self.config.policy;
        let acted = self.stats.last_bet_round == round.round_id;
        let window = decision::window(slots_remaining, policy.slots_threshold, acted);
        let threshold = match window {
            Window::Idle | Window::Closed => return Ok(Some(slots_remaining)),
            Window::Early => policy.early_ev_threshold,
            Window::Primary => policy.ev_threshold,
        };
        self.state.phase = Phase::Evaluating;
        let decision = policy.decide(
            &round.deployed,
            slots_remaining,
            motherlode,
            self.state.ore_price,
            threshold,
        );
        match (decision, window) {
            (Decision::Bet(strategy), _) => self.bet(&round, strategy, motherlode, slot).await?,
            (Decision::Skip(candidate), Window::Primary) => self.skip(&round, candidate, motherlode),
            (Decision::Skip(_), _) => {
                debug!(round_id = round.round_id, slots_remaining, "early check did not pass");
                self.state.phase = Phase::Observing;
            }
        }
        Ok(Some(slots_remaining))
    }

    async fn report_round(&self, round: &RoundState, motherlode: f64, miner: Option<&Miner>) {
        let balance = match self.chain.get_balance(&self.addresses.authority).await {
            Ok(lamports) => Some(lamports_to_sol(lamports)),
            Err(err) => {
                warn!(?err, "failed to read wallet balance");
                None
            }
        };
        info!(
            round_id = round.round_id,
            end_slot = round.end_slot,
            motherlode,
            balance,
            unclaimed_ore = miner.map(Miner::unclaimed_ore),
            rounds_played = self.stats.rounds_played,
            rounds_won = self.stats.rounds_won,
            rounds_skipped = self.stats.rounds_skipped,
            sol_claimed = lamports_to_sol(self.stats.sol_claimed),
            "new round"
        );
    }

    async fn checkpoint(&mut self, round_id: u64, slot: u64) -> Result<(), Error> {
        let blockhash = self.blockhash.fresh(&self.chain, slot).await?;
        info!(round_id, "checkpointing");
        self.state.action_in_flight = Some(Action::Checkpoint { round_id });
        confirm::spawn_checkpoint(
            &self.context,
            self.chain.clone(),
            self.builder.clone(),
            round_id,
            blockhash,
            self.completions.clone(),
        );
        Ok(())
    }

    async fn claim(&mut self, lamports: u64, slot: u64) -> Result<(), Error> {
        if self.state.claim_in_flight {
            return Ok(());
        }
        let blockhash = self.blockhash.fresh(&self.chain, slot).await?;
        info!(lamports, "claiming sol");
        self.state.claim_in_flight = true;
        confirm::spawn_claim(
            &self.context,
            self.chain.clone(),
            self.builder.clone(),
            lamports,
            blockhash,
            self.completions.clone(),
        );
        Ok(())
    }

    async fn send_deploy(
        &mut self,
        round: &RoundState,
        strategy: &AllocationStrategy,
        slot: u64,
    ) -> Result<Signature, Error> {
        let blockhash = self.blockhash.fresh(&self.chain, slot).await?;
        let transaction = self
            .builder
            .deploy(
                round.round_id,
                strategy.bet_per_square,
                &strategy.indices,
                blockhash,
            )
            .map_err(ChainError::from)?;
        Ok(self.chain.send_transaction(&transaction, true).await?)
    }

    async fn bet(
        &mut self,
        round: &RoundState,
        strategy: AllocationStrategy,
        motherlode: f64,
        slot: u64,
    ) -> Result<(), Error> {
        let round_id = round.round_id;
        self.state.phase = Phase::Betting;
        self.state.action_in_flight = Some(Action::Bet { round_id });
        let sent = self.send_deploy(round, &strategy, slot).await;
        self.state.action_in_flight = None;
        self.state.phase = Phase::Observing;
        let signature = sent?;

        info!(
            round_id,
            squares = ?strategy.indices,
            bet_per_square = strategy.bet_per_square,
            ev = strategy.ev,
            ev_percent = strategy.ev_percent(),
            slots_remaining = round.slots_remaining(slot),
            %signature,
            "bet sent"
        );
        let record = BetRecord {
            round_id,
            bet_amount: strategy.bet_per_square,
            result: BetResult::Pending,
            ev_at_bet_time: strategy.ev,
            final_ev: None,
            won: false,
            board_state_at_bet: round.deployed,
            bet_squares: strategy.indices,
            final_board_state: None,
            motherlode_at_bet_time: motherlode,
            variance_reduction_squares: strategy.variance_reduction_squares,
            skip: self.config.policy.skip,
            end_slot: round.end_slot,
            board_state_slot: round.observed_slot,
            confirmation: Confirmation::Awaiting,
            signature: Some(signature.to_string()),
        };
        if let Err(err) = self.ledger.push(record) {
            warn!(round_id, ?err, "bet not recorded");
        }
        self.stats.rounds_played += 1;
        self.stats.last_bet_round = round_id;
        self.counters.bets_sent.inc();
        self.persist();

        confirm::watch_deploy(
            &self.context,
            self.chain.clone(),
            round_id,
            signature,
            self.completions.clone(),
        );
        Ok(())
    }

    fn skip(&mut self, round: &RoundState, candidate: Option<AllocationStrategy>, motherlode: f64) {
        let round_id = round.round_id;
        self.state.phase = Phase::Skipping;
        let policy = &self.config.policy;
        let (bet_squares, ev, variance_reduction_squares) = match candidate {
            Some(candidate) => (
                candidate.indices,
                candidate.ev,
                candidate.variance_reduction_squares,
            ),
            None => (Vec::new(), 0.0, Vec::new()),
        };
        info!(round_id, ev, squares = ?bet_squares, "skipping round");
        let record = BetRecord {
            round_id,
            bet_amount: policy.bet_amount,
            result: BetResult::Skipped,
            ev_at_bet_time: ev,
            final_ev: None,
            won: false,
            board_state_at_bet: round.deployed,
            bet_squares,
            final_board_state: None,
            motherlode_at_bet_time: motherlode,
            variance_reduction_squares,
            skip: policy.skip,
            end_slot: round.end_slot,
            board_state_slot: round.observed_slot,
            confirmation: Confirmation::Unsent,
            signature: None,
        };
        if let Err(err) = self.ledger.push(record) {
            warn!(round_id, ?err, "skip not recorded");
        }
        self.stats.rounds_skipped += 1;
        self.stats.last_bet_round = round_id;
        self.counters.bets_skipped.inc();
        self.state.phase = Phase::Observing;
        self.persist();
    }
}
