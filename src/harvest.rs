//! One category run from batch creation to change summary.

use crate::db::{self, Pool};
use crate::model::{Category, ChangeSummary};
use crate::scheduler::{ScrapeError, Scheduler};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("interrupted")]
    Interrupted { batch_id: Option<i64> },
    #[error(transparent)]
    Scrape(ScrapeError),
    #[error("batch {batch_id} failed integrity check: boards without items {empty_boards:?}")]
    Integrity { batch_id: i64, empty_boards: Vec<String> },
    #[error("store error: {0:#}")]
    Store(anyhow::Error),
}

impl HarvestError {
    pub fn exit_code(&self) -> u8 {
        match self {
            HarvestError::Interrupted { .. } => 130,
            HarvestError::Scrape(ScrapeError::Cancelled) => 130,
            HarvestError::Scrape(ScrapeError::Session(_)) => 2,
            HarvestError::Scrape(ScrapeError::Inconsistent { .. }) => 3,
            HarvestError::Scrape(ScrapeError::NothingDiscovered(_)) => 4,
            HarvestError::Integrity { .. } | HarvestError::Store(_) => 4,
        }
    }

    /// Errors after which no further category should be attempted.
    pub fn is_fatal(&self) -> bool {
        self.exit_code() != 4
    }
}

#[derive(Debug, Clone)]
pub struct HarvestReport {
    pub category: Category,
    pub batch_id: i64,
    pub boards: usize,
    pub items: usize,
    pub failed_boards: Vec<String>,
    pub summary: Option<ChangeSummary>,
}

pub struct Harvester {
    pool: Pool,
    scheduler: Scheduler,
    cancel: CancellationToken,
}

impl Harvester {
    pub fn new(pool: Pool, scheduler: Scheduler, cancel: CancellationToken) -> Self {
        Self { pool, scheduler, cancel }
    }

    async fn discard(&self, batch_id: i64) {
        match db::delete_batch_data(&self.pool, batch_id).await {
            Ok(()) => info!(batch_id, "discarded batch data"),
            Err(err) => error!(?err, batch_id, "failed to discard batch data"),
        }
    }

    async fn fail(&self, batch_id: i64, message: &str) {
        if let Err(err) = db::mark_batch_failed(&self.pool, batch_id, message).await {
            error!(?err, batch_id, "failed to mark batch failed");
        }
    }

    #[instrument(skip(self), fields(run_id = %Uuid::new_v4()))]
    pub async fn harvest(&self, category: Category) -> Result<HarvestReport, HarvestError> {
        let batch_id = db::create_batch(&self.pool, category)
            .await
            .map_err(HarvestError::Store)?;
        info!(batch_id, "batch started");

        let outcome = match self.scheduler.run(category, &self.cancel).await {
            Ok(outcome) => outcome,
            Err(ScrapeError::Cancelled) => {
                warn!(batch_id, "scrape interrupted");
                self.discard(batch_id).await;
                return Err(HarvestError::Interrupted { batch_id: Some(batch_id) });
            }
            Err(err) => {
                error!(%err, batch_id, "scrape failed");
                self.fail(batch_id, &err.to_string()).await;
                return Err(HarvestError::Scrape(err));
            }
        };

        // dropping the commit future rolls its transaction back
        let committed = tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = db::commit_snapshot(
                &self.pool,
                batch_id,
                category,
                &outcome.boards,
                &outcome.items,
                outcome.elapsed,
            ) => Some(result),
        };
        let report = match committed {
            None => {
                warn!(batch_id, "interrupted while persisting");
                self.discard(batch_id).await;
                return Err(HarvestError::Interrupted { batch_id: Some(batch_id) });
            }
            Some(Err(err)) => {
                error!(?err, batch_id, "failed to persist snapshot");
                self.fail(batch_id, &format!("{err:#}")).await;
                return Err(HarvestError::Store(err));
            }
            Some(Ok(report)) => report,
        };
        if !report.is_valid() {
            error!(
                batch_id,
                empty_boards = ?report.empty_boards,
                "boards without items; discarding batch"
            );
            self.discard(batch_id).await;
            return Err(HarvestError::Integrity { batch_id, empty_boards: report.empty_boards });
        }

        let summary = match db::generate_change_summary(&self.pool, batch_id).await {
            Ok(summary) => Some(summary),
            Err(err) => {
                warn!(?err, batch_id, "change summary failed; snapshot kept");
                None
            }
        };

        match &summary {
            Some(s) => info!(
                %category,
                batch_id,
                prev_batch_id = ?s.prev_batch_id,
                boards = report.boards,
                items = report.items,
                boards_added = s.boards_added,
                boards_removed = s.boards_removed,
                items_added = s.items_added,
                items_removed = s.items_removed,
                change_rate = %format_args!("{:.2}%", s.change_rate),
                "harvest complete"
            ),
            None => info!(%category, batch_id, boards = report.boards, items = report.items, "harvest complete"),
        }

        Ok(HarvestReport {
            category,
            batch_id,
            boards: outcome.boards.len(),
            items: outcome.items.len(),
            failed_boards: outcome.failed,
            summary,
        })
    }
}
