//! Two-phase fetch pipeline for one category: listing discovery, then board
//! details, both on a bounded worker pool.

pub mod backoff;
pub mod pool;
pub mod run;

pub use run::{ScrapeOutcome, ScrapeRun};

use crate::config::Config;
use crate::extract;
use crate::model::{Category, Item};
use crate::session::{RequestError, SessionError};
use crate::transport::HttpResponse;
use async_trait::async_trait;
use backoff::{jittered, jittered_sleep, sleep_or_cancel};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on a page count read from a page footer.
pub const MAX_PAGES: u32 = 500;

fn clamp_pages(parsed: Option<u32>) -> u32 {
    parsed.unwrap_or(1).clamp(1, MAX_PAGES)
}

/// Where pages come from, and how to repair the session when a page redirects.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<HttpResponse, RequestError>;
    async fn revalidate(&self) -> Result<(), SessionError>;
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("scrape cancelled")]
    Cancelled,
    #[error("board {board:?} found in an unexpected state")]
    Inconsistent { board: String },
    #[error(transparent)]
    Session(SessionError),
    #[error("no boards discovered for {0}")]
    NothingDiscovered(Category),
}

impl From<SessionError> for ScrapeError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Cancelled => ScrapeError::Cancelled,
            other => ScrapeError::Session(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScrapeSettings {
    pub base_url: String,
    pub interval: Duration,
    pub workers: usize,
    pub connection_limit: usize,
    pub max_page_retries: u32,
    pub max_board_retries: u32,
    pub max_item_page_retries: u32,
    pub join_grace: Duration,
}

impl ScrapeSettings {
    pub fn from_config(cfg: &Config) -> Self {
        let s = &cfg.scraper;
        Self {
            base_url: cfg.site.base_url.clone(),
            interval: Duration::from_secs_f64(s.interval_seconds),
            workers: s.thread_count,
            connection_limit: cfg.connection_limit(),
            max_page_retries: s.max_page_retries,
            max_board_retries: s.max_board_retries,
            max_item_page_retries: s.max_item_page_retries,
            join_grace: Duration::from_millis(s.join_grace_ms),
        }
    }
}

enum BoardFailure {
    Retry(String),
    Fatal(ScrapeError),
}

impl From<ScrapeError> for BoardFailure {
    fn from(err: ScrapeError) -> Self {
        BoardFailure::Fatal(err)
    }
}

impl From<SessionError> for BoardFailure {
    fn from(err: SessionError) -> Self {
        BoardFailure::Fatal(err.into())
    }
}

#[derive(Clone)]
pub struct Scheduler {
    source: Arc<dyn PageSource>,
    settings: Arc<ScrapeSettings>,
    connections: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(source: Arc<dyn PageSource>, settings: ScrapeSettings) -> Self {
        let connections = Arc::new(Semaphore::new(settings.connection_limit.max(1)));
        Self {
            source,
            settings: Arc::new(settings),
            connections,
        }
    }

    /// Scrapes every board of `category`. Raising `cancel` stops both phases
    /// at their next suspension point and yields [`ScrapeError::Cancelled`].
    pub async fn run(&self, category: Category, cancel: &CancellationToken) -> Result<ScrapeOutcome, ScrapeError> {
        let run_token = cancel.child_token();
        let ctx = Arc::new(ScrapeRun::new(category));

        let pages = match self.fetch_listing(category, 1, &run_token).await? {
            Some(body) => {
                ctx.merge_listing(extract::board_rows(&body))?;
                clamp_pages(extract::page_count(&body))
            }
            None => 1,
        };
        info!(%category, pages, "discovering boards");

        let this = self.clone();
        let discovery_ctx = ctx.clone();
        let token = run_token.clone();
        pool::run_pool(
            (2..=pages).collect(),
            self.settings.workers,
            self.settings.join_grace,
            &run_token,
            move |page: u32| {
                let this = this.clone();
                let ctx = discovery_ctx.clone();
                let token = token.clone();
                async move {
                    if let Some(body) = this.fetch_listing(category, page, &token).await? {
                        let added = ctx.merge_listing(extract::board_rows(&body))?;
                        debug!(%category, page, added, "listing page merged");
                    }
                    Ok::<(), ScrapeError>(())
                }
            },
        )
        .await?;
        if run_token.is_cancelled() {
            return Err(ScrapeError::Cancelled);
        }
        if ctx.is_empty() {
            return Err(ScrapeError::NothingDiscovered(category));
        }

        let total = ctx.begin_details();
        info!(%category, boards = total, "fetching board details");
        let this = self.clone();
        let detail_ctx = ctx.clone();
        let token = run_token.clone();
        pool::run_pool(
            ctx.board_names(),
            self.settings.workers,
            self.settings.join_grace,
            &run_token,
            move |name: String| {
                let this = this.clone();
                let ctx = detail_ctx.clone();
                let token = token.clone();
                async move { this.detail_board(&ctx, &name, &token).await }
            },
        )
        .await?;
        if run_token.is_cancelled() {
            return Err(ScrapeError::Cancelled);
        }

        let outcome = ctx.take_outcome();
        info!(
            %category,
            boards = outcome.boards.len(),
            items = outcome.items.len(),
            failed = outcome.failed.len(),
            elapsed_secs = outcome.elapsed.as_secs_f64(),
            "scrape finished"
        );
        Ok(outcome)
    }

    /// Fetches one listing page until it yields board rows. `None` means the
    /// page was abandoned after the retry ceiling.
    async fn fetch_listing(
        &self,
        category: Category,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ScrapeError> {
        let url = category.listing_url(&self.settings.base_url, page);
        let max = self.settings.max_page_retries;
        for attempt in 1..=max {
            if !jittered_sleep(self.settings.interval, cancel).await {
                return Err(ScrapeError::Cancelled);
            }
            match self.source.fetch(&url).await {
                Ok(resp) if resp.is_redirect() => {
                    warn!(page, attempt, max, "listing redirected; revalidating session");
                    self.source.revalidate().await?;
                }
                Ok(resp) if resp.status == 200 => {
                    let body = resp.text();
                    if !extract::board_rows(&body).is_empty() {
                        return Ok(Some(body));
                    }
                    warn!(page, attempt, max, "listing page has no rows; retrying");
                }
                Ok(resp) => warn!(page, status = resp.status, attempt, max, "listing page rejected; retrying"),
                Err(err) => warn!(%err, page, attempt, max, "listing fetch failed; retrying"),
            }
        }
        warn!(%category, page, max, "listing page abandoned");
        Ok(None)
    }

    async fn detail_board(&self, ctx: &ScrapeRun, name: &str, cancel: &CancellationToken) -> Result<(), ScrapeError> {
        let Some(board) = ctx.listed(name) else {
            return Ok(());
        };
        let Some(code) = extract::board_code(&board.source_url) else {
            warn!(board = %name, url = %board.source_url, "board link has no code; skipping");
            ctx.mark_failed(name);
            ctx.finish_board(name);
            return Ok(());
        };

        let max = self.settings.max_board_retries;
        for attempt in 1..=max {
            let permit = tokio::select! {
                _ = cancel.cancelled() => return Err(ScrapeError::Cancelled),
                permit = self.connections.clone().acquire_owned() => permit.map_err(|_| ScrapeError::Cancelled)?,
            };
            let result = self.fetch_board_items(ctx.category(), name, code, cancel).await;
            drop(permit);

            match result {
                Ok(items) => {
                    ctx.record_detail(name, items)?;
                    ctx.finish_board(name);
                    return Ok(());
                }
                Err(BoardFailure::Fatal(err)) => return Err(err),
                Err(BoardFailure::Retry(reason)) => {
                    ctx.mark_failed(name);
                    warn!(board = %name, attempt, max, %reason, "board fetch failed; retrying");
                    if !sleep_or_cancel(jittered(self.settings.interval * 2), cancel).await {
                        return Err(ScrapeError::Cancelled);
                    }
                }
            }
        }
        warn!(board = %name, max, "board abandoned");
        ctx.mark_failed(name);
        ctx.finish_board(name);
        Ok(())
    }

    /// Pages through one board in order. Page 1 tells how many pages exist,
    /// so losing it fails the whole board.
    async fn fetch_board_items(
        &self,
        category: Category,
        name: &str,
        code: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Item>, BoardFailure> {
        let mut items = Vec::new();
        let mut pages = 1;
        let mut page = 1;
        while page <= pages {
            if !jittered_sleep(self.settings.interval, cancel).await {
                return Err(ScrapeError::Cancelled.into());
            }
            let url = category.detail_url(&self.settings.base_url, code, page);
            match self.fetch_item_page(&url, name, page, cancel).await? {
                Some(body) => {
                    if page == 1 {
                        pages = clamp_pages(extract::page_count(&body));
                    }
                    items.extend(extract::item_rows(&body).into_iter().map(|row| Item {
                        board_name: name.to_string(),
                        code: row.code,
                        name: row.name,
                        sequence: row.sequence,
                    }));
                }
                None if page == 1 => return Err(BoardFailure::Retry("first item page skipped".into())),
                None => {}
            }
            page += 1;
        }
        Ok(items)
    }

    /// One item page body. Redirects revalidate the session, while 401/403 and
    /// pages without item rows back off. All of them retry the same page;
    /// `None` means the page was skipped.
    async fn fetch_item_page(
        &self,
        url: &str,
        board: &str,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, BoardFailure> {
        let max = self.settings.max_item_page_retries;
        for attempt in 1..=max {
            let resp = self
                .source
                .fetch(url)
                .await
                .map_err(|err| BoardFailure::Retry(err.to_string()))?;
            let status = resp.status;
            match status {
                200 => {
                    let body = resp.text();
                    if !extract::item_rows(&body).is_empty() {
                        return Ok(Some(body));
                    }
                    warn!(board, page, attempt, max, "item page has no rows; retrying");
                    if !jittered_sleep(self.settings.interval, cancel).await {
                        return Err(ScrapeError::Cancelled.into());
                    }
                }
                401 | 403 => {
                    warn!(board, page, status, attempt, max, "item page denied; backing off");
                    if !jittered_sleep(self.settings.interval, cancel).await {
                        return Err(ScrapeError::Cancelled.into());
                    }
                }
                status if resp.is_redirect() => {
                    warn!(board, page, status, attempt, max, "item page redirected; revalidating session");
                    self.source.revalidate().await?;
                }
                status => return Err(BoardFailure::Retry(format!("page {page} returned status {status}"))),
            }
        }
        warn!(board, page, max, "item page skipped");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_follow_config() {
        let mut cfg = Config::default();
        cfg.scraper.thread_count = 128;
        cfg.scraper.interval_seconds = 0.25;
        let settings = ScrapeSettings::from_config(&cfg);
        assert_eq!(settings.workers, 128);
        assert_eq!(settings.connection_limit, 64);
        assert_eq!(settings.interval, Duration::from_millis(250));
        assert_eq!(settings.max_page_retries, 20);
        assert_eq!(settings.max_board_retries, 10);
    }

    #[test]
    fn page_counts_are_bounded() {
        assert_eq!(clamp_pages(None), 1);
        assert_eq!(clamp_pages(Some(0)), 1);
        assert_eq!(clamp_pages(Some(7)), 7);
        assert_eq!(clamp_pages(Some(4_000_000_000)), MAX_PAGES);
    }

    #[test]
    fn session_cancellation_is_not_a_session_failure() {
        assert!(matches!(ScrapeError::from(SessionError::Cancelled), ScrapeError::Cancelled));
        assert!(matches!(
            ScrapeError::from(SessionError::LoginExhausted { attempts: 6 }),
            ScrapeError::Session(_)
        ));
    }
}
