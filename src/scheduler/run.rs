use super::ScrapeError;
use crate::extract::BoardRow;
use crate::model::{Board, Category, Item};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::info;

enum BoardSlot {
    Listed(Board),
    Detailed(Board, Vec<Item>),
}

#[derive(Default)]
struct RunState {
    boards: BTreeMap<String, BoardSlot>,
    failed: BTreeSet<String>,
    done: usize,
    total: usize,
}

/// Shared state of one category scrape, handed to every worker.
///
/// All mutations happen under one lock and no network call is made while it
/// is held.
pub struct ScrapeRun {
    category: Category,
    started: Instant,
    state: Mutex<RunState>,
}

/// What a finished scrape hands to persistence.
#[derive(Debug, Clone)]
pub struct ScrapeOutcome {
    pub category: Category,
    pub boards: Vec<Board>,
    pub items: Vec<Item>,
    pub failed: Vec<String>,
    pub elapsed: Duration,
}

impl ScrapeRun {
    pub fn new(category: Category) -> Self {
        Self {
            category,
            started: Instant::now(),
            state: Mutex::new(RunState::default()),
        }
    }

    pub fn category(&self) -> Category {
        self.category
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds newly listed boards and returns how many were new. A board that
    /// already carries its items must never be listed again.
    pub fn merge_listing(&self, rows: Vec<BoardRow>) -> Result<usize, ScrapeError> {
        let mut state = self.state();
        let mut added = 0;
        for row in rows {
            let detailed = state
                .boards
                .get(&row.name)
                .map(|slot| matches!(slot, BoardSlot::Detailed(..)));
            match detailed {
                None => {
                    let board = Board {
                        name: row.name.clone(),
                        source_url: row.url,
                        driving_event: row.driving_event,
                        declared_count: row.declared_count,
                        listed_on: row.listed_on,
                    };
                    state.boards.insert(row.name, BoardSlot::Listed(board));
                    added += 1;
                }
                Some(false) => {}
                Some(true) => return Err(ScrapeError::Inconsistent { board: row.name }),
            }
        }
        Ok(added)
    }

    pub fn board_names(&self) -> Vec<String> {
        self.state().boards.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.state().boards.is_empty()
    }

    pub fn listed(&self, name: &str) -> Option<Board> {
        match self.state().boards.get(name) {
            Some(BoardSlot::Listed(board)) => Some(board.clone()),
            _ => None,
        }
    }

    /// Starts the detail phase progress counter.
    pub fn begin_details(&self) -> usize {
        let mut state = self.state();
        state.total = state.boards.len();
        state.done = 0;
        state.total
    }

    pub fn mark_failed(&self, name: &str) {
        self.state().failed.insert(name.to_string());
    }

    pub fn record_detail(&self, name: &str, items: Vec<Item>) -> Result<(), ScrapeError> {
        let mut state = self.state();
        let board = match state.boards.remove(name) {
            Some(BoardSlot::Listed(board)) => board,
            Some(slot @ BoardSlot::Detailed(..)) => {
                state.boards.insert(name.to_string(), slot);
                return Err(ScrapeError::Inconsistent { board: name.to_string() });
            }
            None => return Err(ScrapeError::Inconsistent { board: name.to_string() }),
        };
        state.boards.insert(name.to_string(), BoardSlot::Detailed(board, items));
        state.failed.remove(name);
        Ok(())
    }

    /// Counts a board as finished, whether it succeeded or was abandoned, and
    /// reports live progress.
    pub fn finish_board(&self, name: &str) {
        let mut state = self.state();
        state.done += 1;
        let failed: Vec<&String> = state.failed.iter().collect();
        info!(
            category = %self.category,
            board = %name,
            done = state.done,
            total = state.total,
            failed = ?failed,
            "board finished"
        );
    }

    pub fn failed(&self) -> Vec<String> {
        self.state().failed.iter().cloned().collect()
    }

    /// Drains the run into boards with their items, de-duplicated by
    /// `(board, code)`. Boards that never completed their detail fetch are
    /// left out.
    pub fn take_outcome(&self) -> ScrapeOutcome {
        let elapsed = self.started.elapsed();
        let state = std::mem::take(&mut *self.state());
        let mut boards = Vec::new();
        let mut items = Vec::new();
        for slot in state.boards.into_values() {
            if let BoardSlot::Detailed(board, board_items) = slot {
                let mut seen = HashSet::new();
                items.extend(board_items.into_iter().filter(|item| seen.insert(item.code.clone())));
                boards.push(board);
            }
        }
        ScrapeOutcome {
            category: self.category,
            boards,
            items,
            failed: state.failed.into_iter().collect(),
            elapsed,
        }
    }
}
