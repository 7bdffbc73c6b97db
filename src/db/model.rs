//! View models returned by the batch store repositories.

use crate::model::ChangeKind;

/// Outcome of the per-batch integrity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    pub batch_id: i64,
    pub boards: i64,
    pub items: i64,
    /// Persisted boards without a single persisted item.
    pub empty_boards: Vec<String>,
}

impl IntegrityReport {
    pub fn is_valid(&self) -> bool {
        self.empty_boards.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardChange {
    pub kind: ChangeKind,
    pub board_name: String,
    pub source_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemChange {
    pub kind: ChangeKind,
    pub board_name: String,
    pub item_code: String,
    pub item_name: Option<String>,
}
