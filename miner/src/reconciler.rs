//! Resolving records of rounds that have closed.
//!
//! A pending bet becomes a win or a loss once its confirmation has settled and
//! the miner account reflects the round. Skipped and missed rounds only get
//! the counterfactual EV of what was considered. Every round is looked at
//! once per process: a resolved round id goes into the processed set and is
//! never examined again.

use crate::state::EngineState;
use orebot_client::{accounts, Chain, Error as ChainError};
use orebot_types::{
    compute_ev, Addresses, BetRecord, BetResult, Confirmation, Deployed, Ledger, Miner, Stats,
};
use tracing::{debug, info, warn};

/// What a reconciliation pass changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    pub wins: usize,
    pub losses: usize,
    /// Lamports of unclaimed rewards that should be claimed now.
    pub claim: Option<u64>,
    /// Whether the ledger or stats changed and need saving.
    pub changed: bool,
}

fn needs_reconcile(record: &BetRecord) -> bool {
    match record.result {
        BetResult::Pending => true,
        BetResult::Skipped | BetResult::Missed { .. } => record.final_board_state.is_none(),
        BetResult::Win | BetResult::Loss => false,
    }
}

/// Final board with our own stake taken back out of the squares we bet.
///
/// Falls back to the board seen at bet time when the two agree to within a
/// lamport per square (nobody else moved after us).
pub fn board_without_stake(record: &BetRecord, final_board: &Deployed) -> Deployed {
    let mut board = *final_board;
    for &square in &record.bet_squares {
        board[square] = board[square].saturating_sub(record.bet_amount);
    }
    let unchanged = board
        .iter()
        .zip(record.board_state_at_bet.iter())
        .all(|(now, then)| now.abs_diff(*then) <= 1);
    if unchanged {
        record.board_state_at_bet
    } else {
        board
    }
}

async fn final_board<C: Chain>(
    chain: &C,
    addresses: &Addresses,
    round_id: u64,
) -> Result<Option<Deployed>, ChainError> {
    match accounts::round(chain, addresses, round_id).await {
        Ok((round, _)) => Ok(Some(round.deployed)),
        Err(ChainError::NotFound(_)) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Resolve every closed round that still needs it, oldest first.
///
/// `miner` is the miner account as read this tick (`None` if it does not
/// exist). A read failure stops the pass; whatever is left is retried on the
/// next tick.
pub async fn reconcile<C: Chain>(
    chain: &C,
    addresses: &Addresses,
    ledger: &mut Ledger,
    stats: &mut Stats,
    state: &mut EngineState,
    miner: Option<&Miner>,
    current_round: u64,
) -> Outcome {
    let mut outcome = Outcome::default();
    let due: Vec<u64> = ledger
        .iter()
        .filter(|record| record.round_id < current_round)
        .filter(|record| !state.processed.contains(&record.round_id))
        .filter(|record| needs_reconcile(record))
        .map(|record| record.round_id)
        .collect();

    for round_id in due.into_iter().rev() {
        let Some(record) = ledger.get(round_id) else {
            continue;
        };
        let result = if record.result == BetResult::Pending {
            resolve_bet(chain, addresses, ledger, stats, state, miner, round_id, &mut outcome).await
        } else {
            resolve_counterfactual(chain, addresses, ledger, state, round_id, &mut outcome).await
        };
        if let Err(err) = result {
            warn!(round_id, ?err, "reconciliation deferred");
            break;
        }
    }

    // Rewards left over from earlier rounds (or a failed claim).
    let outstanding = ledger
        .iter()
        .any(|record| record.result == BetResult::Pending);
    if !outstanding && outcome.claim.is_none() {
        if let Some(miner) = miner.filter(|miner| miner.rewards_sol > 0) {
            outcome.claim = Some(miner.rewards_sol);
        }
    }
    outcome
}

#[allow(clippy::too_many_arguments)]
async fn resolve_bet<C: Chain>(
    chain: &C,
    addresses: &Addresses,
    ledger: &mut Ledger,
    stats: &mut Stats,
    state: &mut EngineState,
    miner: Option<&Miner>,
    round_id: u64,
    outcome: &mut Outcome,
) -> Result<(), ChainError> {
    let Some(record) = ledger.pending(round_id) else {
        return Ok(());
    };
    if record.confirmation == Confirmation::Awaiting {
        debug!(round_id, "waiting for deploy confirmation");
        return Ok(());
    }
    let Some(miner) = miner else {
        debug!(round_id, "no miner account yet");
        return Ok(());
    };
    if miner.round_id == round_id && miner.checkpoint_id != round_id {
        debug!(round_id, "waiting for checkpoint");
        return Ok(());
    }

    let board = final_board(chain, addresses, round_id).await?;
    let ore_price = state.ore_price;
    let baseline = state.lifetime_baseline.unwrap_or(miner.lifetime_rewards_sol);
    let lifetime_grew = miner.lifetime_rewards_sol > baseline;
    let won = miner.rewards_sol > 0 || lifetime_grew;
    if lifetime_grew || state.lifetime_baseline.is_none() {
        state.lifetime_baseline = Some(miner.lifetime_rewards_sol);
    }

    let Some(record) = ledger.pending_mut(round_id) else {
        return Ok(());
    };
    if let Some(board) = board {
        let ev_board = board_without_stake(record, &board);
        record.final_ev = Some(compute_ev(
            &ev_board,
            &record.bet_squares,
            record.bet_amount,
            record.motherlode_at_bet_time,
            ore_price,
        ));
        record.final_board_state = Some(board);
    }
    record.won = won;
    if won {
        record.result = BetResult::Win;
        stats.total_wins += 1;
        stats.rounds_won += 1;
        outcome.wins += 1;
        if miner.rewards_sol > 0 {
            outcome.claim = Some(miner.rewards_sol);
        }
        info!(round_id, rewards = miner.rewards_sol, "round won");
    } else {
        record.result = BetResult::Loss;
        outcome.losses += 1;
        info!(round_id, "round lost");
    }
    state.processed.insert(round_id);
    outcome.changed = true;
    Ok(())
}

async fn resolve_counterfactual<C: Chain>(
    chain: &C,
    addresses: &Addresses,
    ledger: &mut Ledger,
    state: &mut EngineState,
    round_id: u64,
    outcome: &mut Outcome,
) -> Result<(), ChainError> {
    let board = final_board(chain, addresses, round_id).await?;
    state.processed.insert(round_id);
    let (Some(board), Some(record)) = (board, ledger.get_mut(round_id)) else {
        return Ok(());
    };
    let final_ev = compute_ev(
        &board,
        &record.bet_squares,
        record.bet_amount,
        record.motherlode_at_bet_time,
        state.ore_price,
    );
    debug!(round_id, result = %record.result, final_ev, "recorded counterfactual");
    record.final_ev = Some(final_ev);
    record.final_board_state = Some(board);
    outcome.changed = true;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_runtime::{deterministic, Runner};
    use orebot_client::mocks::MockChain;
    use std::time::SystemTime;

    const BET: u64 = 10_000_000;

    fn record(round_id: u64, result: BetResult) -> BetRecord {
        BetRecord {
            round_id,
            bet_amount: BET,
            result,
            ev_at_bet_time: 1_000.0,
            final_ev: None,
            won: false,
            board_state_at_bet: [5 * BET; 25],
            bet_squares: vec![3, 4],
            final_board_state: None,
            motherlode_at_bet_time: 20.0,
            variance_reduction_squares: vec![],
            skip: 0,
            end_slot: 1_000,
            board_state_slot: 990,
            confirmation: Confirmation::Landed {
                slot: 995,
                slots_before_end: 5,
            },
            signature: None,
        }
    }

    fn final_board_with_stake() -> Deployed {
        let mut board = [5 * BET; 25];
        board[3] += BET;
        board[4] += BET;
        board
    }

    fn miner(round_id: u64, checkpoint_id: u64, rewards_sol: u64, lifetime: u64) -> Miner {
        Miner {
            checkpoint_id,
            rewards_sol,
            round_id,
            lifetime_rewards_sol: lifetime,
            ..Default::default()
        }
    }

    #[test]
    fn stake_removal_prefers_board_at_bet() {
        let record = record(1, BetResult::Pending);
        assert_eq!(
            board_without_stake(&record, &final_board_with_stake()),
            record.board_state_at_bet
        );

        let mut moved = final_board_with_stake();
        moved[10] += 7;
        let board = board_without_stake(&record, &moved);
        assert_eq!(board[10], 5 * BET + 7);
        assert_eq!(board[3], 5 * BET);
    }

    #[test]
    fn win_is_recorded_once() {
        deterministic::Runner::default().start(|_| async move {
            let chain = MockChain::new();
            let addresses = chain.addresses();
            chain.set_round(4, final_board_with_stake());

            let mut ledger = Ledger::default();
            ledger.push(record(4, BetResult::Pending)).unwrap();
            let mut stats = Stats::default();
            let mut state = EngineState::new(0.1, SystemTime::UNIX_EPOCH);
            state.lifetime_baseline = Some(100);
            let miner = miner(4, 4, 0, 150);

            let outcome = reconcile(
                &chain, &addresses, &mut ledger, &mut stats, &mut state, Some(&miner), 5,
            )
            .await;
            assert_eq!(outcome.wins, 1);
            assert!(outcome.changed);
            // Nothing unclaimed, so nothing to claim.
            assert_eq!(outcome.claim, None);
            assert_eq!(state.lifetime_baseline, Some(150));

            let resolved = ledger.get(4).unwrap().clone();
            assert_eq!(resolved.result, BetResult::Win);
            assert!(resolved.won);
            assert_eq!(resolved.final_board_state, Some(final_board_with_stake()));
            let expected = compute_ev(&resolved.board_state_at_bet, &[3, 4], BET, 20.0, 0.1);
            assert_eq!(resolved.final_ev, Some(expected));

            let again = reconcile(
                &chain, &addresses, &mut ledger, &mut stats, &mut state, Some(&miner), 5,
            )
            .await;
            assert_eq!(again, Outcome::default());
            assert_eq!(ledger.get(4).unwrap(), &resolved);
            assert_eq!(stats.total_wins, 1);
            assert_eq!(stats.rounds_won, 1);
        });
    }

    #[test]
    fn unclaimed_rewards_trigger_claim() {
        deterministic::Runner::default().start(|_| async move {
            let chain = MockChain::new();
            let addresses = chain.addresses();
            chain.set_round(4, final_board_with_stake());

            let mut ledger = Ledger::default();
            ledger.push(record(4, BetResult::Pending)).unwrap();
            let mut stats = Stats::default();
            let mut state = EngineState::new(0.0, SystemTime::UNIX_EPOCH);
            let miner = miner(4, 4, 2_500, 0);

            let outcome = reconcile(
                &chain, &addresses, &mut ledger, &mut stats, &mut state, Some(&miner), 5,
            )
            .await;
            assert_eq!(outcome.wins, 1);
            assert_eq!(outcome.claim, Some(2_500));
        });
    }

    #[test]
    fn loss_when_nothing_changed() {
        deterministic::Runner::default().start(|_| async move {
            let chain = MockChain::new();
            let addresses = chain.addresses();
            chain.set_round(4, final_board_with_stake());

            let mut ledger = Ledger::default();
            ledger.push(record(4, BetResult::Pending)).unwrap();
            let mut stats = Stats::default();
            let mut state = EngineState::new(0.0, SystemTime::UNIX_EPOCH);
            state.lifetime_baseline = Some(150);

            let outcome = reconcile(
                &chain,
                &addresses,
                &mut ledger,
                &mut stats,
                &mut state,
                Some(&miner(4, 4, 0, 150)),
                5,
            )
            .await;
            assert_eq!(outcome.losses, 1);
            assert_eq!(ledger.get(4).unwrap().result, BetResult::Loss);
            assert_eq!(stats, Stats::default());
        });
    }

    #[test]
    fn defers_until_settled_and_checkpointed() {
        deterministic::Runner::default().start(|_| async move {
            let chain = MockChain::new();
            let addresses = chain.addresses();
            chain.set_round(4, final_board_with_stake());

            let mut awaiting = record(4, BetResult::Pending);
            awaiting.confirmation = Confirmation::Awaiting;
            let mut ledger = Ledger::default();
            ledger.push(awaiting).unwrap();
            let mut stats = Stats::default();
            let mut state = EngineState::new(0.0, SystemTime::UNIX_EPOCH);
            let checkpointed = miner(4, 4, 0, 0);

            // Still waiting on the confirmation watcher.
            let outcome = reconcile(
                &chain, &addresses, &mut ledger, &mut stats, &mut state, Some(&checkpointed), 5,
            )
            .await;
            assert!(!outcome.changed);

            ledger.get_mut(4).unwrap().confirmation = Confirmation::Unknown;
            // Miner still shows round 4 un-checkpointed.
            let outcome = reconcile(
                &chain,
                &addresses,
                &mut ledger,
                &mut stats,
                &mut state,
                Some(&miner(4, 3, 0, 0)),
                5,
            )
            .await;
            assert!(!outcome.changed);
            assert_eq!(ledger.get(4).unwrap().result, BetResult::Pending);

            // The current round is never reconciled.
            let outcome = reconcile(
                &chain, &addresses, &mut ledger, &mut stats, &mut state, Some(&checkpointed), 4,
            )
            .await;
            assert!(!outcome.changed);

            let outcome = reconcile(
                &chain, &addresses, &mut ledger, &mut stats, &mut state, Some(&checkpointed), 5,
            )
            .await;
            assert_eq!(outcome.losses, 1);
        });
    }

    #[test]
    fn skipped_round_gets_counterfactual() {
        deterministic::Runner::default().start(|_| async move {
            let chain = MockChain::new();
            let addresses = chain.addresses();
            let board = [7 * BET; 25];
            chain.set_round(8, board);

            let mut ledger = Ledger::default();
            ledger.push(record(8, BetResult::Skipped)).unwrap();
            let mut stats = Stats {
                rounds_skipped: 1,
                ..Default::default()
            };
            let mut state = EngineState::new(0.0, SystemTime::UNIX_EPOCH);

            let outcome = reconcile(
                &chain, &addresses, &mut ledger, &mut stats, &mut state, None, 9,
            )
            .await;
            assert!(outcome.changed);
            assert_eq!(outcome.wins + outcome.losses, 0);

            let skipped = ledger.get(8).unwrap();
            assert_eq!(skipped.result, BetResult::Skipped);
            assert_eq!(skipped.final_board_state, Some(board));
            assert_eq!(
                skipped.final_ev,
                Some(compute_ev(&board, &[3, 4], BET, 20.0, 0.0))
            );
            assert_eq!(stats.rounds_skipped, 1);
        });
    }

    #[test]
    fn read_failure_defers() {
        deterministic::Runner::default().start(|_| async move {
            let chain = MockChain::new();
            let addresses = chain.addresses();
            chain.set_round(8, [BET; 25]);
            chain.fail_reads(1);

            let mut ledger = Ledger::default();
            ledger
                .push(record(8, BetResult::Missed { slots_late: 2 }))
                .unwrap();
            let mut stats = Stats::default();
            let mut state = EngineState::new(0.0, SystemTime::UNIX_EPOCH);

            let outcome = reconcile(
                &chain, &addresses, &mut ledger, &mut stats, &mut state, None, 9,
            )
            .await;
            assert!(!outcome.changed);
            assert!(!state.processed.contains(&8));

            let outcome = reconcile(
                &chain, &addresses, &mut ledger, &mut stats, &mut state, None, 9,
            )
            .await;
            assert!(outcome.changed);
            assert_eq!(ledger.get(8).unwrap().final_board_state, Some([BET; 25]));
        });
    }

    #[test]
    fn sweep_claims_leftover_rewards() {
        deterministic::Runner::default().start(|_| async move {
            let chain = MockChain::new();
            let addresses = chain.addresses();
            let mut ledger = Ledger::default();
            let mut stats = Stats::default();
            let mut state = EngineState::new(0.0, SystemTime::UNIX_EPOCH);

            let outcome = reconcile(
                &chain,
                &addresses,
                &mut ledger,
                &mut stats,
                &mut state,
                Some(&miner(2, 2, 900, 900)),
                3,
            )
            .await;
            assert_eq!(outcome.claim, Some(900));

            // Not while a bet is outstanding.
            ledger.push(record(3, BetResult::Pending)).unwrap();
            let outcome = reconcile(
                &chain,
                &addresses,
                &mut ledger,
                &mut stats,
                &mut state,
                Some(&miner(2, 2, 900, 900)),
                3,
            )
            .await;
            assert_eq!(outcome.claim, None);
        });
    }
}
