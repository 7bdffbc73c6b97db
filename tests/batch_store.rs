use board_harvest::db::{self, Pool};
use board_harvest::model::{BatchStatus, Board, Category, ChangeKind, Item};
use std::time::Duration;

async fn setup_pool() -> Pool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn board(name: &str) -> Board {
    Board {
        name: name.into(),
        source_url: format!("http://q.10jqka.com.cn/gn/detail/code/{}/", 300000 + name.len()),
        driving_event: Some("policy".into()),
        declared_count: Some(2),
        listed_on: Some("2024-03-01".into()),
    }
}

fn item(board: &str, code: &str) -> Item {
    Item {
        board_name: board.into(),
        code: code.into(),
        name: format!("{board}-{code}"),
        sequence: Some(1),
    }
}

/// Creates a batch and commits the given `(board, codes)` snapshot.
async fn snapshot(pool: &Pool, category: Category, layout: &[(&str, &[&str])]) -> i64 {
    let id = db::create_batch(pool, category).await.unwrap();
    let boards: Vec<Board> = layout.iter().map(|(b, _)| board(b)).collect();
    let items: Vec<Item> = layout
        .iter()
        .flat_map(|(b, codes)| codes.iter().map(move |c| item(b, c)))
        .collect();
    let report = db::commit_snapshot(pool, id, category, &boards, &items, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(report.is_valid(), "{report:?}");
    id
}

#[tokio::test]
async fn diff_between_consecutive_concept_batches() {
    let pool = setup_pool().await;
    let a = snapshot(&pool, Category::Concept, &[("X", &["c1", "c2"]), ("Y", &["c3"])]).await;
    let first = db::generate_change_summary(&pool, a).await.unwrap();
    assert_eq!(first.prev_batch_id, None);
    assert_eq!(first.boards_added, 2);
    assert_eq!(first.items_added, 3);
    assert_eq!(first.change_rate, 0.0);
    assert!(db::board_changes_for(&pool, first.id).await.unwrap().is_empty());

    let b = snapshot(&pool, Category::Concept, &[("X", &["c1", "c3"]), ("Z", &["c4"])]).await;
    let summary = db::generate_change_summary(&pool, b).await.unwrap();
    assert_eq!(summary.prev_batch_id, Some(a));
    assert_eq!(summary.boards_added, 1);
    assert_eq!(summary.boards_removed, 1);
    assert_eq!(summary.items_added, 2);
    assert_eq!(summary.items_removed, 2);
    // 6 changes over 2 boards + 3 items
    assert!((summary.change_rate - 120.0).abs() < 1e-9);

    let boards = db::board_changes_for(&pool, summary.id).await.unwrap();
    assert_eq!(boards.len(), 2);
    assert!(boards.iter().any(|c| c.kind == ChangeKind::Added && c.board_name == "Z"));
    assert!(boards.iter().any(|c| c.kind == ChangeKind::Removed && c.board_name == "Y" && c.source_url.is_some()));

    let items = db::item_changes_for(&pool, summary.id).await.unwrap();
    let mut keys: Vec<(ChangeKind, String, String)> =
        items.into_iter().map(|c| (c.kind, c.board_name, c.item_code)).collect();
    keys.sort();
    assert_eq!(
        keys,
        vec![
            (ChangeKind::Added, "X".into(), "c3".into()),
            (ChangeKind::Added, "Z".into(), "c4".into()),
            (ChangeKind::Removed, "X".into(), "c2".into()),
            (ChangeKind::Removed, "Y".into(), "c3".into()),
        ]
    );

    // regenerating yields the same figures and replaces the old summary
    let again = db::generate_change_summary(&pool, b).await.unwrap();
    assert_eq!(again.boards_added, summary.boards_added);
    assert_eq!(again.items_removed, summary.items_removed);
    assert_eq!(again.change_rate, summary.change_rate);
    let stored = db::change_summary_for(&pool, b).await.unwrap().unwrap();
    assert_eq!(stored.id, again.id);
    assert_eq!(db::board_changes_for(&pool, again.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn prior_batch_must_be_successful_and_same_category() {
    let pool = setup_pool().await;
    let concept = snapshot(&pool, Category::Concept, &[("X", &["c1"])]).await;
    let _industry = snapshot(&pool, Category::Industry, &[("I", &["i1"])]).await;
    let failed = db::create_batch(&pool, Category::Concept).await.unwrap();
    db::mark_batch_failed(&pool, failed, "boom").await.unwrap();
    let current = snapshot(&pool, Category::Concept, &[("X", &["c1"])]).await;

    assert_eq!(
        db::previous_successful_batch(&pool, Category::Concept, current).await.unwrap(),
        Some(concept)
    );
    assert_eq!(db::previous_successful_batch(&pool, Category::Region, current).await.unwrap(), None);

    let summary = db::generate_change_summary(&pool, current).await.unwrap();
    assert_eq!(summary.prev_batch_id, Some(concept));
    assert_eq!(summary.boards_added + summary.boards_removed, 0);
    assert_eq!(summary.change_rate, 0.0);
}

#[tokio::test]
async fn integrity_fails_iff_some_board_has_no_items() {
    let pool = setup_pool().await;
    let cases: Vec<(Vec<&str>, Vec<(&str, &str)>, bool)> = vec![
        (vec!["A"], vec![("A", "1")], true),
        (vec!["A", "B"], vec![("A", "1"), ("B", "2")], true),
        (vec!["A", "B"], vec![("A", "1"), ("A", "2")], false),
        (vec!["A"], vec![], false),
        (vec![], vec![], true),
    ];
    for (boards, items, valid) in cases {
        let id = db::create_batch(&pool, Category::Industry).await.unwrap();
        let boards: Vec<Board> = boards.into_iter().map(board).collect();
        let items: Vec<Item> = items.into_iter().map(|(b, c)| item(b, c)).collect();
        let report = db::commit_snapshot(&pool, id, Category::Industry, &boards, &items, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(report.is_valid(), valid, "{report:?}");

        let status = db::fetch_batch(&pool, id).await.unwrap().unwrap().status;
        let expected = if valid { BatchStatus::Success } else { BatchStatus::Running };
        assert_eq!(status, expected);
        assert_eq!(db::validate_integrity(&pool, id).await.unwrap().is_valid(), true);
    }
}

#[tokio::test]
async fn delete_batch_data_removes_everything_it_owns() {
    let pool = setup_pool().await;
    let a = snapshot(&pool, Category::Region, &[("R", &["r1"])]).await;
    let b = snapshot(&pool, Category::Region, &[("S", &["s1", "s2"])]).await;
    let summary = db::generate_change_summary(&pool, b).await.unwrap();
    assert!(summary.boards_added > 0);

    db::delete_batch_data(&pool, b).await.unwrap();

    assert!(db::fetch_batch(&pool, b).await.unwrap().is_none());
    assert!(db::change_summary_for(&pool, b).await.unwrap().is_none());
    for table in ["board_snapshots", "item_snapshots", "board_statistics", "change_summary"] {
        let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table} WHERE batch_id = ?"))
            .bind(b)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(n, 0, "{table}");
    }
    let orphans: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM board_changes")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(orphans, 0);

    // the other batch is untouched
    let keys = db::snapshot_keys(&pool, a).await.unwrap();
    assert!(keys.boards.contains("R"));
    assert_eq!(keys.items.len(), 1);
}

#[tokio::test]
async fn stale_running_batches_are_reclaimed() {
    let pool = setup_pool().await;
    let done = snapshot(&pool, Category::Concept, &[("X", &["c1"])]).await;
    let stuck = db::create_batch(&pool, Category::Concept).await.unwrap();

    assert_eq!(db::reclaim_stale(&pool, Duration::from_secs(3600)).await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(db::reclaim_stale(&pool, Duration::ZERO).await.unwrap(), 1);

    let batch = db::fetch_batch(&pool, stuck).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.error_message.as_deref(), Some(db::STALE_BATCH_MESSAGE));
    assert_eq!(db::fetch_batch(&pool, done).await.unwrap().unwrap().status, BatchStatus::Success);
}
