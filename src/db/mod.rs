//! Batch store: SQLite persistence of batches, snapshots and change summaries.
//!
//! - `model`: view models returned by repositories.
//! - `repo`: SQL functions over the migrated schema.
//!
//! Callers import from `board_harvest::db`; the repository API is re-exported.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{BoardChange, IntegrityReport, ItemChange};
