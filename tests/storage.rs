//! SQL driver and transaction tests against SQLite.

mod common;

use common::{open_store, sqlite_datastore};
use statebase::core::error::StatebaseError;
use statebase::kv::Backend;
use statebase::storage::{
    DialectKind, Generic, KeyFilter, ListQuery, NewRow, RowFlags, TxOptions, COMPACT_REV_KEY,
};
use tempfile::TempDir;

fn creation<'a>(name: &'a str, prev_revision: i64, value: &'a [u8]) -> NewRow<'a> {
    NewRow {
        name,
        flags: RowFlags::CREATED,
        create_revision: 0,
        prev_revision,
        lease: 0,
        value,
        old_value: &[],
    }
}

// ============================================================================
// Startup
// ============================================================================

#[tokio::test]
async fn open_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let config = sqlite_datastore(dir.path());

    let first = Generic::open(&config).await.unwrap();
    assert_eq!(first.kind(), DialectKind::Sqlite);
    {
        let mut tx = first.begin_tx(TxOptions::default()).await.unwrap();
        tx.insert(&creation("foo", 0, b"bar")).await.unwrap();
        tx.commit().await.unwrap();
    }
    first.close().await;

    let second = Generic::open(&config).await.unwrap();
    second.migrate().await.unwrap();
    let mut tx = second.begin_tx(TxOptions::read_only()).await.unwrap();
    assert_eq!(tx.current_revision().await.unwrap(), 1);
    tx.commit().await.unwrap();
}

// ============================================================================
// Transaction
// ============================================================================

#[tokio::test]
async fn empty_store_reports_zero_revisions() {
    let store = open_store().await;
    let mut tx = store
        .engine
        .driver()
        .begin_tx(TxOptions::read_only())
        .await
        .unwrap();
    assert_eq!(tx.current_revision().await.unwrap(), 0);
    assert_eq!(tx.get_compact_revision().await.unwrap(), 0);
    assert!(tx.get_revision(1).await.unwrap().is_none());
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn duplicate_predecessor_is_key_exists() {
    let store = open_store().await;
    let driver = store.engine.driver();

    let mut tx = driver.begin_tx(TxOptions::default()).await.unwrap();
    let id = tx.insert(&creation("foo", 0, b"a")).await.unwrap();
    assert_eq!(id, 1);
    let err = tx.insert(&creation("foo", 0, b"b")).await.unwrap_err();
    assert!(matches!(err, StatebaseError::KeyExists));
    tx.must_rollback().await;

    let mut tx = driver.begin_tx(TxOptions::read_only()).await.unwrap();
    assert!(tx.get_revision(1).await.unwrap().is_none());
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn rollback_discards_inserts() {
    let store = open_store().await;
    let driver = store.engine.driver();

    let mut tx = driver.begin_tx(TxOptions::default()).await.unwrap();
    tx.insert(&creation("foo", 0, b"a")).await.unwrap();
    tx.rollback().await.unwrap();

    let mut tx = driver.begin_tx(TxOptions::default()).await.unwrap();
    let row = tx.insert(&creation("foo", 0, b"b")).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = driver.begin_tx(TxOptions::read_only()).await.unwrap();
    let stored = tx.get_revision(row).await.unwrap().unwrap();
    assert_eq!(stored.value, b"b");
    assert_eq!(stored.name, "foo");
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn watermark_row_is_inserted_then_updated() {
    let store = open_store().await;
    let driver = store.engine.driver();

    let mut tx = driver.begin_tx(TxOptions::default()).await.unwrap();
    tx.insert(&creation("foo", 0, b"a")).await.unwrap();
    tx.set_compact_revision(1).await.unwrap();
    assert_eq!(tx.get_compact_revision().await.unwrap(), 1);
    assert_eq!(tx.current_revision().await.unwrap(), 2);

    tx.set_compact_revision(2).await.unwrap();
    assert_eq!(tx.get_compact_revision().await.unwrap(), 2);
    assert_eq!(tx.current_revision().await.unwrap(), 2);

    let watermark = tx.get_revision(2).await.unwrap().unwrap();
    assert_eq!(watermark.name, COMPACT_REV_KEY);
    assert_eq!(watermark.prev_revision, 2);
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn duplicate_watermark_rows_collapse_on_compaction() {
    let store = open_store().await;
    let kv = &store.engine;
    let driver = kv.driver();

    let rev = kv.create("a", b"1", 0).await.unwrap();
    let rev = kv.update("a", b"2", rev, 0).await.unwrap().revision;
    kv.update("a", b"3", rev, 0).await.unwrap();
    kv.create("b", b"1", 0).await.unwrap();

    // Two first compactions that committed concurrently each leave a row.
    let mut tx = driver.begin_tx(TxOptions::default()).await.unwrap();
    for prev_revision in [1, 2] {
        tx.insert(&creation(COMPACT_REV_KEY, prev_revision, b""))
            .await
            .unwrap();
    }
    tx.commit().await.unwrap();
    assert_eq!(kv.compact_revision().await.unwrap(), 2);

    let compacted = kv.compact(4).await.unwrap();
    assert_eq!(compacted.compact_revision, 4);
    assert_eq!(compacted.deleted_rows, 2);

    let mut tx = driver.begin_tx(TxOptions::read_only()).await.unwrap();
    assert!(tx.get_revision(5).await.unwrap().is_none());
    assert_eq!(tx.get_revision(6).await.unwrap().unwrap().prev_revision, 4);
    tx.commit().await.unwrap();

    assert_eq!(kv.compact(6).await.unwrap().compact_revision, 6);
    assert_eq!(kv.compact_revision().await.unwrap(), 6);
}

#[tokio::test]
async fn delete_revision_removes_one_row() {
    let store = open_store().await;
    let driver = store.engine.driver();

    let mut tx = driver.begin_tx(TxOptions::default()).await.unwrap();
    tx.insert(&creation("a", 0, b"1")).await.unwrap();
    tx.insert(&creation("b", 0, b"2")).await.unwrap();
    tx.delete_revision(1).await.unwrap();
    assert!(tx.get_revision(1).await.unwrap().is_none());
    assert!(tx.get_revision(2).await.unwrap().is_some());
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn exact_list_returns_latest_row_with_revisions() {
    let store = open_store().await;
    let driver = store.engine.driver();

    let mut tx = driver.begin_tx(TxOptions::default()).await.unwrap();
    tx.insert(&creation("foo", 0, b"a")).await.unwrap();
    tx.insert(&NewRow {
        name: "foo",
        flags: RowFlags::empty(),
        create_revision: 1,
        prev_revision: 1,
        lease: 0,
        value: b"b",
        old_value: b"a",
    })
    .await
    .unwrap();

    let set = tx
        .list(&ListQuery {
            filter: KeyFilter::Exact("foo"),
            revision: 0,
            include_deleted: true,
            limit: 1,
        })
        .await
        .unwrap();
    assert_eq!(set.current_revision, Some(2));
    assert_eq!(set.compact_revision, Some(0));
    assert_eq!(set.rows.len(), 1);
    let row = &set.rows[0];
    assert_eq!(row.id, 2);
    assert_eq!(row.value, b"b");
    assert_eq!(row.old_value, b"a");
    assert_eq!(row.effective_create_revision(), 1);
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn size_is_positive() {
    let store = open_store().await;
    assert!(store.engine.driver().size().await.unwrap() > 0);
}
