use super::model::{BoardChange, IntegrityReport, ItemChange};
use crate::diff::{SnapshotDiff, SnapshotKeys};
use crate::model::{BatchRecord, BatchStatus, Board, Category, ChangeKind, ChangeSummary, Item};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, Utc};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{instrument, warn};

pub type Pool = SqlitePool;

/// Error text written onto batches reclaimed by [`reclaim_stale`].
pub const STALE_BATCH_MESSAGE: &str = "process interrupted; batch reclaimed as stale";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {}", normalized))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. Leaves in-memory URLs
/// untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{}", expanded_path);
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn create_batch(pool: &Pool, category: Category) -> Result<i64> {
    let id: i64 = sqlx::query(
        "INSERT INTO scrape_batches (category, status, started_at) VALUES (?, ?, ?) RETURNING batch_id",
    )
    .bind(category.as_str())
    .bind(BatchStatus::Running.as_str())
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to create batch")?
    .get("batch_id");
    Ok(id)
}

fn batch_from_row(row: &SqliteRow) -> Result<BatchRecord> {
    let id: i64 = row.get("batch_id");
    let category_str: String = row.get("category");
    let status_str: String = row.get("status");
    Ok(BatchRecord {
        id,
        category: Category::parse(&category_str)
            .ok_or_else(|| anyhow!("batch {} has unknown category {}", id, category_str))?,
        status: BatchStatus::parse_status(&status_str)
            .ok_or_else(|| anyhow!("batch {} has unknown status {}", id, status_str))?,
        total_boards: row.get("total_boards"),
        total_items: row.get("total_items"),
        elapsed_seconds: row.try_get("elapsed_seconds").ok().flatten(),
        error_message: row.try_get("error_message").ok().flatten(),
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at").ok().flatten(),
    })
}

pub async fn fetch_batch(pool: &Pool, batch_id: i64) -> Result<Option<BatchRecord>> {
    let row = sqlx::query("SELECT * FROM scrape_batches WHERE batch_id = ?")
        .bind(batch_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(batch_from_row).transpose()
}

async fn insert_boards(
    tx: &mut Transaction<'_, Sqlite>,
    batch_id: i64,
    category: Category,
    boards: &[Board],
    scrape_date: &str,
) -> Result<u64> {
    let mut inserted = 0;
    for board in boards {
        let res = sqlx::query(
            "INSERT OR IGNORE INTO board_snapshots \
             (batch_id, category, board_name, source_url, driving_event, declared_count, listed_on, scrape_date) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(batch_id)
        .bind(category.as_str())
        .bind(&board.name)
        .bind(&board.source_url)
        .bind(board.driving_event.as_deref())
        .bind(board.declared_count)
        .bind(board.listed_on.as_deref())
        .bind(scrape_date)
        .execute(&mut **tx)
        .await?;
        inserted += res.rows_affected();
    }
    Ok(inserted)
}

async fn insert_items(
    tx: &mut Transaction<'_, Sqlite>,
    batch_id: i64,
    items: &[Item],
    scrape_date: &str,
) -> Result<u64> {
    let mut inserted = 0;
    for item in items {
        // (batch, board, code) is unique; repeats are dropped by the constraint.
        let res = sqlx::query(
            "INSERT OR IGNORE INTO item_snapshots \
             (batch_id, board_name, item_code, item_name, sequence_num, scrape_date) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(batch_id)
        .bind(&item.board_name)
        .bind(&item.code)
        .bind(&item.name)
        .bind(item.sequence)
        .bind(scrape_date)
        .execute(&mut **tx)
        .await?;
        inserted += res.rows_affected();
    }
    Ok(inserted)
}

async fn integrity_report(conn: &mut SqliteConnection, batch_id: i64) -> Result<IntegrityReport> {
    let boards: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM board_snapshots WHERE batch_id = ?")
        .bind(batch_id)
        .fetch_one(&mut *conn)
        .await?;
    let items: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM item_snapshots WHERE batch_id = ?")
        .bind(batch_id)
        .fetch_one(&mut *conn)
        .await?;
    let empty_boards: Vec<String> = sqlx::query_scalar(
        "SELECT b.board_name FROM board_snapshots b \
         WHERE b.batch_id = ? AND NOT EXISTS ( \
             SELECT 1 FROM item_snapshots i WHERE i.batch_id = b.batch_id AND i.board_name = b.board_name) \
         ORDER BY b.board_name",
    )
    .bind(batch_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(IntegrityReport {
        batch_id,
        boards,
        items,
        empty_boards,
    })
}

/// Every persisted board of the batch must own at least one persisted item.
#[instrument(skip_all)]
pub async fn validate_integrity(pool: &Pool, batch_id: i64) -> Result<IntegrityReport> {
    let mut conn = pool.acquire().await?;
    integrity_report(&mut conn, batch_id).await
}

/// Inserts boards, items and per-board statistics, checks integrity and marks
/// the batch `success`, all in one transaction. When the integrity check
/// fails the transaction is rolled back and the failing report is returned;
/// nothing of the snapshot is left behind.
#[instrument(skip_all, fields(batch_id = batch_id, boards = boards.len(), items = items.len()))]
pub async fn commit_snapshot(
    pool: &Pool,
    batch_id: i64,
    category: Category,
    boards: &[Board],
    items: &[Item],
    elapsed: Duration,
) -> Result<IntegrityReport> {
    let scrape_date = Local::now().date_naive().to_string();
    let mut tx = pool.begin().await?;

    insert_boards(&mut tx, batch_id, category, boards, &scrape_date)
        .await
        .context("failed to insert boards")?;
    insert_items(&mut tx, batch_id, items, &scrape_date)
        .await
        .context("failed to insert items")?;

    sqlx::query(
        "INSERT INTO board_statistics (batch_id, category, board_name, item_count, scrape_date) \
         SELECT b.batch_id, b.category, b.board_name, COUNT(DISTINCT i.item_code), b.scrape_date \
         FROM board_snapshots b \
         LEFT JOIN item_snapshots i ON i.batch_id = b.batch_id AND i.board_name = b.board_name \
         WHERE b.batch_id = ? \
         GROUP BY b.board_name",
    )
    .bind(batch_id)
    .execute(&mut *tx)
    .await
    .context("failed to insert board statistics")?;

    let report = integrity_report(&mut tx, batch_id).await?;
    if !report.is_valid() {
        tx.rollback().await?;
        return Ok(report);
    }

    let updated = sqlx::query(
        "UPDATE scrape_batches SET status = ?, total_boards = ?, total_items = ?, \
         elapsed_seconds = ?, completed_at = ?, error_message = NULL \
         WHERE batch_id = ? AND status = ?",
    )
    .bind(BatchStatus::Success.as_str())
    .bind(report.boards)
    .bind(report.items)
    .bind(elapsed.as_secs_f64())
    .bind(Utc::now())
    .bind(batch_id)
    .bind(BatchStatus::Running.as_str())
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if updated != 1 {
        return Err(anyhow!("batch {} is not running", batch_id));
    }

    tx.commit().await?;
    Ok(report)
}

#[instrument(skip_all)]
pub async fn mark_batch_failed(pool: &Pool, batch_id: i64, message: &str) -> Result<()> {
    sqlx::query(
        "UPDATE scrape_batches SET status = ?, error_message = ?, completed_at = ? \
         WHERE batch_id = ? AND status = ?",
    )
    .bind(BatchStatus::Failed.as_str())
    .bind(message)
    .bind(Utc::now())
    .bind(batch_id)
    .bind(BatchStatus::Running.as_str())
    .execute(pool)
    .await
    .context("failed to mark batch failed")?;
    Ok(())
}

/// Removes a batch together with everything it owns.
#[instrument(skip_all)]
pub async fn delete_batch_data(pool: &Pool, batch_id: i64) -> Result<()> {
    let mut tx = pool.begin().await?;
    for sql in [
        "DELETE FROM board_changes WHERE summary_id IN (SELECT id FROM change_summary WHERE batch_id = ?)",
        "DELETE FROM item_changes WHERE summary_id IN (SELECT id FROM change_summary WHERE batch_id = ?)",
        "DELETE FROM change_summary WHERE batch_id = ?",
        "DELETE FROM board_statistics WHERE batch_id = ?",
        "DELETE FROM item_snapshots WHERE batch_id = ?",
        "DELETE FROM board_snapshots WHERE batch_id = ?",
        "DELETE FROM scrape_batches WHERE batch_id = ?",
    ] {
        sqlx::query(sql).bind(batch_id).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Marks batches stuck in `running` for longer than `timeout` as failed.
/// Returns the number of batches reclaimed.
#[instrument(skip_all)]
pub async fn reclaim_stale(pool: &Pool, timeout: Duration) -> Result<u64> {
    // a timeout reaching past the earliest representable instant reclaims nothing
    let Some(cutoff) = chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|timeout| Utc::now().checked_sub_signed(timeout))
    else {
        return Ok(0);
    };
    let running = sqlx::query("SELECT batch_id, started_at FROM scrape_batches WHERE status = ?")
        .bind(BatchStatus::Running.as_str())
        .fetch_all(pool)
        .await?;

    let mut reclaimed = 0;
    for row in running {
        let id: i64 = row.get("batch_id");
        let started_at: DateTime<Utc> = row.try_get("started_at")?;
        if started_at >= cutoff {
            continue;
        }
        mark_batch_failed(pool, id, STALE_BATCH_MESSAGE).await?;
        warn!(batch_id = id, %started_at, "reclaimed stale batch");
        reclaimed += 1;
    }
    Ok(reclaimed)
}

async fn previous_successful_batch_conn(
    conn: &mut SqliteConnection,
    category: Category,
    before_id: i64,
) -> Result<Option<i64>> {
    let id = sqlx::query_scalar::<_, i64>(
        "SELECT batch_id FROM scrape_batches \
         WHERE category = ? AND status = ? AND batch_id < ? \
         ORDER BY batch_id DESC LIMIT 1",
    )
    .bind(category.as_str())
    .bind(BatchStatus::Success.as_str())
    .bind(before_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(id)
}

/// Most recent successful batch of `category` with an id below `before_id`.
pub async fn previous_successful_batch(
    pool: &Pool,
    category: Category,
    before_id: i64,
) -> Result<Option<i64>> {
    let mut conn = pool.acquire().await?;
    previous_successful_batch_conn(&mut conn, category, before_id).await
}

/// Keys of a snapshot plus the display fields needed for change rows.
struct SnapshotIndex {
    keys: SnapshotKeys,
    board_urls: HashMap<String, String>,
    item_names: HashMap<(String, String), String>,
}

async fn load_snapshot(conn: &mut SqliteConnection, batch_id: i64) -> Result<SnapshotIndex> {
    let boards = sqlx::query("SELECT board_name, source_url FROM board_snapshots WHERE batch_id = ?")
        .bind(batch_id)
        .fetch_all(&mut *conn)
        .await?;
    let items = sqlx::query(
        "SELECT board_name, item_code, item_name FROM item_snapshots WHERE batch_id = ?",
    )
    .bind(batch_id)
    .fetch_all(&mut *conn)
    .await?;

    let board_urls: HashMap<String, String> = boards
        .iter()
        .map(|r| (r.get::<String, _>("board_name"), r.get::<String, _>("source_url")))
        .collect();
    let item_names: HashMap<(String, String), String> = items
        .iter()
        .map(|r| {
            (
                (r.get::<String, _>("board_name"), r.get::<String, _>("item_code")),
                r.get::<String, _>("item_name"),
            )
        })
        .collect();
    Ok(SnapshotIndex {
        keys: SnapshotKeys::new(board_urls.keys().cloned(), item_names.keys().cloned()),
        board_urls,
        item_names,
    })
}

pub async fn snapshot_keys(pool: &Pool, batch_id: i64) -> Result<SnapshotKeys> {
    let mut conn = pool.acquire().await?;
    Ok(load_snapshot(&mut conn, batch_id).await?.keys)
}

/// Diffs `batch_id` against the preceding successful batch of its category
/// and stores the summary plus itemized rows in a transaction of its own.
/// Re-running replaces the previous summary of the batch.
#[instrument(skip_all, fields(batch_id = batch_id))]
pub async fn generate_change_summary(pool: &Pool, batch_id: i64) -> Result<ChangeSummary> {
    let batch = fetch_batch(pool, batch_id)
        .await?
        .ok_or_else(|| anyhow!("batch {} not found", batch_id))?;

    let mut tx = pool.begin().await?;
    let prev_batch_id = previous_successful_batch_conn(&mut tx, batch.category, batch_id).await?;
    let current = load_snapshot(&mut tx, batch_id).await?;
    let prior = match prev_batch_id {
        Some(id) => Some(load_snapshot(&mut tx, id).await?),
        None => None,
    };
    let diff = SnapshotDiff::between(&current.keys, prior.as_ref().map(|p| &p.keys));
    if let Some(prior) = &prior {
        if prior.keys.size() == 0 {
            warn!(batch_id, ?prev_batch_id, "previous batch holds no boards or items; change rate is 0");
        }
    }

    sqlx::query("DELETE FROM board_changes WHERE summary_id IN (SELECT id FROM change_summary WHERE batch_id = ?)")
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM item_changes WHERE summary_id IN (SELECT id FROM change_summary WHERE batch_id = ?)")
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM change_summary WHERE batch_id = ?")
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;

    let created_at = Utc::now();
    let summary_id: i64 = sqlx::query(
        "INSERT INTO change_summary \
         (batch_id, category, prev_batch_id, boards_added, boards_removed, items_added, items_removed, change_rate, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(batch_id)
    .bind(batch.category.as_str())
    .bind(prev_batch_id)
    .bind(diff.added_boards.len() as i64)
    .bind(diff.removed_boards.len() as i64)
    .bind(diff.added_items.len() as i64)
    .bind(diff.removed_items.len() as i64)
    .bind(diff.change_rate)
    .bind(created_at)
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert change summary")?
    .get("id");

    if let (true, Some(prior)) = (diff.has_details(), &prior) {
        let boards = diff
            .added_boards
            .iter()
            .map(|b| (ChangeKind::Added, b, current.board_urls.get(b)))
            .chain(
                diff.removed_boards
                    .iter()
                    .map(|b| (ChangeKind::Removed, b, prior.board_urls.get(b))),
            );
        for (kind, name, url) in boards {
            sqlx::query(
                "INSERT INTO board_changes (summary_id, change_type, board_name, category, source_url) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(summary_id)
            .bind(kind.as_str())
            .bind(name)
            .bind(batch.category.as_str())
            .bind(url.map(String::as_str))
            .execute(&mut *tx)
            .await?;
        }

        let items = diff
            .added_items
            .iter()
            .map(|k| (ChangeKind::Added, k, current.item_names.get(k)))
            .chain(
                diff.removed_items
                    .iter()
                    .map(|k| (ChangeKind::Removed, k, prior.item_names.get(k))),
            );
        for (kind, (board, code), name) in items {
            sqlx::query(
                "INSERT INTO item_changes (summary_id, change_type, board_name, item_code, item_name) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(summary_id)
            .bind(kind.as_str())
            .bind(board)
            .bind(code)
            .bind(name.map(String::as_str))
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;

    Ok(ChangeSummary {
        id: summary_id,
        batch_id,
        category: batch.category,
        prev_batch_id,
        boards_added: diff.added_boards.len() as i64,
        boards_removed: diff.removed_boards.len() as i64,
        items_added: diff.added_items.len() as i64,
        items_removed: diff.removed_items.len() as i64,
        change_rate: diff.change_rate,
        created_at,
    })
}

pub async fn change_summary_for(pool: &Pool, batch_id: i64) -> Result<Option<ChangeSummary>> {
    let row = sqlx::query("SELECT * FROM change_summary WHERE batch_id = ?")
        .bind(batch_id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let category_str: String = row.get("category");
    Ok(Some(ChangeSummary {
        id: row.get("id"),
        batch_id,
        category: Category::parse(&category_str)
            .ok_or_else(|| anyhow!("summary for batch {} has unknown category {}", batch_id, category_str))?,
        prev_batch_id: row.try_get("prev_batch_id").ok().flatten(),
        boards_added: row.get("boards_added"),
        boards_removed: row.get("boards_removed"),
        items_added: row.get("items_added"),
        items_removed: row.get("items_removed"),
        change_rate: row.get("change_rate"),
        created_at: row.try_get("created_at")?,
    }))
}

fn change_kind(row: &SqliteRow) -> Result<ChangeKind> {
    let s: String = row.get("change_type");
    ChangeKind::parse_kind(&s).ok_or_else(|| anyhow!("unknown change type {}", s))
}

pub async fn board_changes_for(pool: &Pool, summary_id: i64) -> Result<Vec<BoardChange>> {
    let rows = sqlx::query(
        "SELECT change_type, board_name, source_url FROM board_changes WHERE summary_id = ? ORDER BY id",
    )
    .bind(summary_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|r| {
            Ok(BoardChange {
                kind: change_kind(r)?,
                board_name: r.get("board_name"),
                source_url: r.try_get("source_url").ok().flatten(),
            })
        })
        .collect()
}

pub async fn item_changes_for(pool: &Pool, summary_id: i64) -> Result<Vec<ItemChange>> {
    let rows = sqlx::query(
        "SELECT change_type, board_name, item_code, item_name FROM item_changes WHERE summary_id = ? ORDER BY id",
    )
    .bind(summary_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|r| {
            Ok(ItemChange {
                kind: change_kind(r)?,
                board_name: r.get("board_name"),
                item_code: r.get("item_code"),
                item_name: r.try_get("item_name").ok().flatten(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn board(name: &str) -> Board {
        Board {
            name: name.into(),
            source_url: format!("http://q.10jqka.com.cn/gn/detail/code/{name}/"),
            driving_event: None,
            declared_count: Some(1),
            listed_on: None,
        }
    }

    fn item(board: &str, code: &str) -> Item {
        Item {
            board_name: board.into(),
            code: code.into(),
            name: format!("name-{code}"),
            sequence: Some(1),
        }
    }

    #[test]
    fn prepare_url_adds_create_mode() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        let td = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/nested/db.sqlite", td.path().display());
        let prepared = prepare_sqlite_url(&url);
        assert!(prepared.ends_with("?mode=rwc"));
        assert!(td.path().join("nested").exists());
    }

    #[tokio::test]
    async fn create_batch_starts_running() {
        let pool = setup_pool().await;
        let id = create_batch(&pool, Category::Concept).await.unwrap();
        let batch = fetch_batch(&pool, id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Running);
        assert_eq!(batch.category, Category::Concept);
        assert!(batch.completed_at.is_none());
    }

    #[tokio::test]
    async fn commit_snapshot_dedups_items_and_records_statistics() {
        let pool = setup_pool().await;
        let id = create_batch(&pool, Category::Industry).await.unwrap();
        let items = vec![item("A", "1"), item("A", "1"), item("A", "2"), item("B", "1")];
        let report = commit_snapshot(&pool, id, Category::Industry, &[board("A"), board("B")], &items, Duration::from_secs(3))
            .await
            .unwrap();
        assert!(report.is_valid());
        assert_eq!(report.items, 3);

        let batch = fetch_batch(&pool, id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Success);
        assert_eq!(batch.total_boards, 2);
        assert_eq!(batch.total_items, 3);
        assert_eq!(batch.elapsed_seconds, Some(3.0));

        let stat: i64 = sqlx::query_scalar("SELECT item_count FROM board_statistics WHERE batch_id = ? AND board_name = 'A'")
            .bind(id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(stat, 2);
    }

    #[tokio::test]
    async fn commit_snapshot_rolls_back_on_empty_board() {
        let pool = setup_pool().await;
        let id = create_batch(&pool, Category::Region).await.unwrap();
        let report = commit_snapshot(&pool, id, Category::Region, &[board("A"), board("B")], &[item("A", "1")], Duration::ZERO)
            .await
            .unwrap();
        assert!(!report.is_valid());
        assert_eq!(report.empty_boards, vec!["B".to_string()]);

        let boards: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM board_snapshots WHERE batch_id = ?")
            .bind(id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(boards, 0);
        let batch = fetch_batch(&pool, id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Running);
    }

    #[tokio::test]
    async fn reclaim_stale_only_touches_old_running_batches() {
        let pool = setup_pool().await;
        let old = create_batch(&pool, Category::Concept).await.unwrap();
        let fresh = create_batch(&pool, Category::Concept).await.unwrap();
        sqlx::query("UPDATE scrape_batches SET started_at = ? WHERE batch_id = ?")
            .bind(Utc::now() - chrono::Duration::hours(3))
            .bind(old)
            .execute(&pool)
            .await
            .unwrap();

        let n = reclaim_stale(&pool, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(n, 1);
        let old = fetch_batch(&pool, old).await.unwrap().unwrap();
        assert_eq!(old.status, BatchStatus::Failed);
        assert_eq!(old.error_message.as_deref(), Some(STALE_BATCH_MESSAGE));
        let fresh = fetch_batch(&pool, fresh).await.unwrap().unwrap();
        assert_eq!(fresh.status, BatchStatus::Running);
    }

    #[tokio::test]
    async fn reclaim_stale_with_huge_timeout_reclaims_nothing() {
        let pool = setup_pool().await;
        create_batch(&pool, Category::Region).await.unwrap();
        let n = reclaim_stale(&pool, Duration::from_secs(u64::MAX)).await.unwrap();
        assert_eq!(n, 0);
        let n = reclaim_stale(&pool, Duration::from_secs(i64::MAX as u64 / 1000)).await.unwrap();
        assert_eq!(n, 0);
    }
}
