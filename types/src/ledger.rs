//! Bet history and aggregate counters.

use crate::{ev::ev_percent, Deployed, SQUARES};
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, fmt, str::FromStr};
use thiserror::Error;
use tracing::warn;

/// Maximum number of records kept (oldest are evicted first).
pub const LEDGER_CAPACITY: usize = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BetResult {
    Pending,
    Win,
    Loss,
    Skipped,
    Missed { slots_late: u64 },
}

impl BetResult {
    pub fn is_missed(&self) -> bool {
        matches!(self, BetResult::Missed { .. })
    }
}

impl fmt::Display for BetResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BetResult::Pending => f.write_str("Pending"),
            BetResult::Win => f.write_str("Win"),
            BetResult::Loss => f.write_str("Loss"),
            BetResult::Skipped => f.write_str("Skipped"),
            BetResult::Missed { slots_late } => write!(f, "Missed ({slots_late})"),
        }
    }
}

impl FromStr for BetResult {
    type Err = LedgerError;

    /// Accepts `pending`, `win`, `loss`, `skipped` and `missed:<slots>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "pending" => Ok(BetResult::Pending),
            "win" => Ok(BetResult::Win),
            "loss" => Ok(BetResult::Loss),
            "skipped" => Ok(BetResult::Skipped),
            other => other
                .strip_prefix("missed:")
                .and_then(|slots| slots.parse().ok())
                .map(|slots_late| BetResult::Missed { slots_late })
                .ok_or_else(|| LedgerError::UnknownResult(s.to_string())),
        }
    }
}

/// What is known about whether a sent deploy landed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Confirmation {
    /// No transaction was sent (the round was skipped).
    Unsent,
    Awaiting,
    Landed { slot: u64, slots_before_end: i64 },
    /// Confirmation timed out or failed; the transaction may still have landed.
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BetRecord {
    pub round_id: u64,
    /// Lamports per square.
    pub bet_amount: u64,
    pub result: BetResult,
    pub ev_at_bet_time: f64,
    pub final_ev: Option<f64>,
    pub won: bool,
    pub board_state_at_bet: Deployed,
    pub bet_squares: Vec<usize>,
    pub final_board_state: Option<Deployed>,
    pub motherlode_at_bet_time: f64,
    pub variance_reduction_squares: Vec<usize>,
    pub skip: usize,
    pub end_slot: u64,
    pub board_state_slot: u64,
    pub confirmation: Confirmation,
    pub signature: Option<String>,
}

impl BetRecord {
    pub fn total_bet(&self) -> u64 {
        self.bet_amount * self.bet_squares.len() as u64
    }

    pub fn ev_percent(&self) -> f64 {
        ev_percent(self.ev_at_bet_time, self.total_bet())
    }

    /// Whether stake actually went on-chain in time (not skipped, not missed).
    pub fn is_real_bet(&self) -> bool {
        !self.bet_squares.is_empty()
            && self.result != BetResult::Skipped
            && !self.result.is_missed()
    }

    fn validate(&self) -> Result<(), LedgerError> {
        let mut seen = [false; SQUARES];
        for &square in &self.bet_squares {
            if square >= SQUARES {
                return Err(LedgerError::InvalidSquare(square));
            }
            if seen[square] {
                return Err(LedgerError::DuplicateSquare(square));
            }
            seen[square] = true;
        }
        for &square in &self.variance_reduction_squares {
            if square >= SQUARES || !seen[square] {
                return Err(LedgerError::VarianceNotInBet(square));
            }
        }
        if self.skip >= SQUARES {
            return Err(LedgerError::InvalidSkip(self.skip));
        }
        if self.won != (self.result == BetResult::Win) {
            return Err(LedgerError::ResultMismatch {
                result: self.result,
                won: self.won,
            });
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("round {0} already has a pending bet")]
    DuplicatePending(u64),
    #[error("round {0} already has a record")]
    DuplicateRound(u64),
    #[error("no record for round {0}")]
    UnknownRound(u64),
    #[error("square {0} is out of range")]
    InvalidSquare(usize),
    #[error("square {0} listed twice")]
    DuplicateSquare(usize),
    #[error("variance reduction square {0} is not a bet square")]
    VarianceNotInBet(usize),
    #[error("skip {0} leaves no squares")]
    InvalidSkip(usize),
    #[error("board has {0} squares (need 25)")]
    BoardLength(usize),
    #[error("result {result} is inconsistent with won={won}")]
    ResultMismatch { result: BetResult, won: bool },
    #[error("unknown result: {0}")]
    UnknownResult(String),
    #[error("record for round {round_id}: {source}")]
    InvalidRecord {
        round_id: u64,
        #[source]
        source: Box<LedgerError>,
    },
}

/// Administrative override of a record. Unset fields are left unchanged.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BetEdit {
    pub round_id: Option<u64>,
    pub bet_amount: Option<u64>,
    pub result: Option<BetResult>,
    pub won: Option<bool>,
    pub ev_at_bet_time: Option<f64>,
    /// `Some(None)` clears the final EV.
    pub final_ev: Option<Option<f64>>,
    pub motherlode_at_bet_time: Option<f64>,
    pub skip: Option<usize>,
    pub end_slot: Option<u64>,
    pub bet_squares: Option<Vec<usize>>,
    pub variance_reduction_squares: Option<Vec<usize>>,
    pub board_state_at_bet: Option<Vec<u64>>,
    /// `Some(None)` clears the final board.
    pub final_board_state: Option<Option<Vec<u64>>>,
}

fn to_board(values: Vec<u64>) -> Result<Deployed, LedgerError> {
    let len = values.len();
    values.try_into().map_err(|_| LedgerError::BoardLength(len))
}

impl BetEdit {
    fn apply(self, record: &mut BetRecord) -> Result<(), LedgerError> {
        if let Some(round_id) = self.round_id {
            record.round_id = round_id;
        }
        if let Some(bet_amount) = self.bet_amount {
            record.bet_amount = bet_amount;
        }
        if let Some(result) = self.result {
            record.result = result;
            // Keep `won` in step unless it is set explicitly.
            record.won = result == BetResult::Win;
        }
        if let Some(won) = self.won {
            record.won = won;
        }
        if let Some(ev) = self.ev_at_bet_time {
            record.ev_at_bet_time = ev;
        }
        if let Some(final_ev) = self.final_ev {
            record.final_ev = final_ev;
        }
        if let Some(motherlode) = self.motherlode_at_bet_time {
            record.motherlode_at_bet_time = motherlode;
        }
        if let Some(skip) = self.skip {
            record.skip = skip;
        }
        if let Some(end_slot) = self.end_slot {
            record.end_slot = end_slot;
        }
        if let Some(squares) = self.bet_squares {
            record.bet_squares = squares;
        }
        if let Some(squares) = self.variance_reduction_squares {
            record.variance_reduction_squares = squares;
        }
        if let Some(board) = self.board_state_at_bet {
            record.board_state_at_bet = to_board(board)?;
        }
        if let Some(board) = self.final_board_state {
            record.final_board_state = board.map(to_board).transpose()?;
        }
        record.validate()
    }
}

/// Aggregate counters, persisted after every change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stats {
    pub rounds_played: u64,
    pub rounds_won: u64,
    pub rounds_skipped: u64,
    pub total_wins: u64,
    /// Lamports claimed over the bot's lifetime.
    pub sol_claimed: u64,
    /// Last round a bet or skip was recorded for (0 when none).
    pub last_bet_round: u64,
}

/// Newest-first list of bet records.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ledger {
    records: VecDeque<BetRecord>,
}

impl Ledger {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BetRecord> {
        self.records.iter()
    }

    /// Check every record, as when history is read back from disk.
    pub fn validate(&self) -> Result<(), LedgerError> {
        self.records.iter().try_for_each(|record| {
            record
                .validate()
                .map_err(|source| LedgerError::InvalidRecord {
                    round_id: record.round_id,
                    source: Box::new(source),
                })
        })
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Record a new bet or skip. A round can hold at most one pending record.
    pub fn push(&mut self, record: BetRecord) -> Result<(), LedgerError> {
        if record.result == BetResult::Pending && self.pending(record.round_id).is_some() {
            return Err(LedgerError::DuplicatePending(record.round_id));
        }
        self.records.push_front(record);
        self.records.truncate(LEDGER_CAPACITY);
        Ok(())
    }

    /// Newest record for a round.
    pub fn get(&self, round_id: u64) -> Option<&BetRecord> {
        self.records.iter().find(|record| record.round_id == round_id)
    }

    pub fn get_mut(&mut self, round_id: u64) -> Option<&mut BetRecord> {
        self.records
            .iter_mut()
            .find(|record| record.round_id == round_id)
    }

    pub fn pending(&self, round_id: u64) -> Option<&BetRecord> {
        self.records
            .iter()
            .find(|record| record.round_id == round_id && record.result == BetResult::Pending)
    }

    pub fn pending_mut(&mut self, round_id: u64) -> Option<&mut BetRecord> {
        self.records
            .iter_mut()
            .find(|record| record.round_id == round_id && record.result == BetResult::Pending)
    }

    /// Win rate (percent) over records that were real bets.
    pub fn actual_win_rate(&self) -> Option<f64> {
        let (bets, wins) = self
            .records
            .iter()
            .filter(|record| record.is_real_bet())
            .fold((0usize, 0usize), |(bets, wins), record| {
                (bets + 1, wins + usize::from(record.won))
            });
        (bets > 0).then(|| wins as f64 / bets as f64 * 100.0)
    }

    /// Mean chance (percent) of covering the drawn square, over real bets.
    pub fn expected_win_rate(&self) -> Option<f64> {
        let rates: Vec<f64> = self
            .records
            .iter()
            .filter(|record| record.is_real_bet())
            .map(|record| {
                record.bet_squares.len() as f64 / (SQUARES - record.skip) as f64 * 100.0
            })
            .collect();
        (!rates.is_empty()).then(|| rates.iter().sum::<f64>() / rates.len() as f64)
    }

    /// Override a record by hand. The edit is validated as a whole and applied
    /// only if the resulting record is consistent.
    pub fn apply_edit(&mut self, round_id: u64, edit: BetEdit) -> Result<(), LedgerError> {
        if let Some(target) = edit.round_id.filter(|&target| target != round_id) {
            if self.get(target).is_some() {
                return Err(LedgerError::DuplicateRound(target));
            }
        }
        let record = self
            .get_mut(round_id)
            .ok_or(LedgerError::UnknownRound(round_id))?;
        let mut edited = record.clone();
        edit.apply(&mut edited)?;
        warn!(
            round_id,
            from = %record.result,
            to = %edited.result,
            "bet record edited by hand"
        );
        *record = edited;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(round_id: u64, result: BetResult) -> BetRecord {
        BetRecord {
            round_id,
            bet_amount: 10_000_000,
            result,
            ev_at_bet_time: 500_000.0,
            final_ev: None,
            won: result == BetResult::Win,
            board_state_at_bet: [1_000; SQUARES],
            bet_squares: vec![0, 1],
            final_board_state: None,
            motherlode_at_bet_time: 12.5,
            variance_reduction_squares: vec![],
            skip: 0,
            end_slot: 5_000,
            board_state_slot: 4_990,
            confirmation: Confirmation::Awaiting,
            signature: None,
        }
    }

    #[test]
    fn newest_first_and_capped() {
        let mut ledger = Ledger::default();
        for round_id in 1..=(LEDGER_CAPACITY as u64 + 5) {
            ledger.push(record(round_id, BetResult::Loss)).unwrap();
        }
        assert_eq!(ledger.len(), LEDGER_CAPACITY);
        assert_eq!(ledger.iter().next().unwrap().round_id, LEDGER_CAPACITY as u64 + 5);
        assert!(ledger.get(5).is_none());
        assert!(ledger.get(6).is_some());
    }

    #[test]
    fn validate_reports_offending_round() {
        let mut ledger = Ledger::default();
        ledger.push(record(1, BetResult::Loss)).unwrap();
        assert_eq!(ledger.validate(), Ok(()));

        ledger.push(record(2, BetResult::Loss)).unwrap();
        ledger.get_mut(2).unwrap().skip = SQUARES;
        assert_eq!(
            ledger.validate(),
            Err(LedgerError::InvalidRecord {
                round_id: 2,
                source: Box::new(LedgerError::InvalidSkip(SQUARES)),
            })
        );

        ledger.get_mut(2).unwrap().skip = 0;
        ledger.get_mut(2).unwrap().bet_squares = vec![3, 30];
        assert!(matches!(
            ledger.validate(),
            Err(LedgerError::InvalidRecord { round_id: 2, .. })
        ));
    }

    #[test]
    fn single_pending_per_round() {
        let mut ledger = Ledger::default();
        ledger.push(record(3, BetResult::Pending)).unwrap();
        assert_eq!(
            ledger.push(record(3, BetResult::Pending)),
            Err(LedgerError::DuplicatePending(3))
        );
        ledger.push(record(4, BetResult::Pending)).unwrap();
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn win_rate_ignores_skips_and_misses() {
        let mut ledger = Ledger::default();
        assert_eq!(ledger.actual_win_rate(), None);
        ledger.push(record(1, BetResult::Win)).unwrap();
        ledger.push(record(2, BetResult::Loss)).unwrap();
        ledger.push(record(3, BetResult::Skipped)).unwrap();
        ledger.push(record(4, BetResult::Missed { slots_late: 2 })).unwrap();
        assert_eq!(ledger.actual_win_rate(), Some(50.0));
        // two of 25 squares covered on each real bet
        assert_eq!(ledger.expected_win_rate(), Some(8.0));
    }

    #[test]
    fn result_parsing() {
        assert_eq!("Win".parse::<BetResult>().unwrap(), BetResult::Win);
        assert_eq!(
            "missed:3".parse::<BetResult>().unwrap(),
            BetResult::Missed { slots_late: 3 }
        );
        assert!("lost".parse::<BetResult>().is_err());
        assert_eq!(BetResult::Missed { slots_late: 3 }.to_string(), "Missed (3)");
    }

    #[test]
    fn edits_are_validated() {
        let mut ledger = Ledger::default();
        ledger.push(record(1, BetResult::Loss)).unwrap();
        ledger.push(record(2, BetResult::Loss)).unwrap();

        let edit = BetEdit {
            result: Some(BetResult::Win),
            final_ev: Some(Some(42.0)),
            ..Default::default()
        };
        ledger.apply_edit(1, edit).unwrap();
        let edited = ledger.get(1).unwrap();
        assert!(edited.won);
        assert_eq!(edited.final_ev, Some(42.0));

        let bad_squares = BetEdit {
            bet_squares: Some(vec![3, 3]),
            ..Default::default()
        };
        assert_eq!(
            ledger.apply_edit(2, bad_squares),
            Err(LedgerError::DuplicateSquare(3))
        );
        let stray_variance = BetEdit {
            variance_reduction_squares: Some(vec![9]),
            ..Default::default()
        };
        assert_eq!(
            ledger.apply_edit(2, stray_variance),
            Err(LedgerError::VarianceNotInBet(9))
        );
        let inconsistent = BetEdit {
            won: Some(true),
            ..Default::default()
        };
        assert!(matches!(
            ledger.apply_edit(2, inconsistent),
            Err(LedgerError::ResultMismatch { .. })
        ));
        let short_board = BetEdit {
            board_state_at_bet: Some(vec![1, 2, 3]),
            ..Default::default()
        };
        assert_eq!(
            ledger.apply_edit(2, short_board),
            Err(LedgerError::BoardLength(3))
        );
        assert_eq!(
            ledger.apply_edit(2, BetEdit {
                round_id: Some(1),
                ..Default::default()
            }),
            Err(LedgerError::DuplicateRound(1))
        );
        assert_eq!(
            ledger.apply_edit(9, BetEdit::default()),
            Err(LedgerError::UnknownRound(9))
        );

        // Failed edits leave the record untouched.
        assert_eq!(ledger.get(2).unwrap(), &record(2, BetResult::Loss));
    }

    #[test]
    fn serde_round_trip_preserves_order() {
        let mut ledger = Ledger::default();
        ledger.push(record(1, BetResult::Skipped)).unwrap();
        let mut pending = record(2, BetResult::Pending);
        pending.confirmation = Confirmation::Landed {
            slot: 4_995,
            slots_before_end: 5,
        };
        ledger.push(pending).unwrap();

        let json = serde_json::to_string(&ledger).unwrap();
        let decoded: Ledger = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, ledger);
        assert_eq!(decoded.iter().next().unwrap().round_id, 2);
    }
}
