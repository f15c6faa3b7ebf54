mod common;

use common::{insert_doc, open_store, test_config};
use docyard_db::{DocumentDb, DocumentQuery, NativeFilter};
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;

async fn archive_n(db: &DocumentDb, kind: &str, start: i64, n: i64) {
    for i in start..start + n {
        let mut doc = insert_doc(db, &[("kind", json!(kind)), ("n", json!(i))]).await;
        assert!(db.mark_processed(&mut doc, "index").await);
    }
}

#[tokio::test]
async fn test_follower_reads_archive_in_order() {
    let dir = TempDir::new().unwrap();
    let db = open_store(&dir).await;
    archive_n(&db, "any", 0, 3).await;

    let mut follower = db.follow_archive(None).unwrap();
    let mut seen = Vec::new();
    for _ in 0..3 {
        let doc = follower.next().await.unwrap().unwrap();
        seen.push(doc.content_field("n").cloned().unwrap());
    }
    assert_eq!(seen, vec![json!(0), json!(1), json!(2)]);
    assert!(follower.try_next().await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_follower_waits_for_new_records() {
    let dir = TempDir::new().unwrap();
    let db = open_store(&dir).await;
    let mut follower = db.follow_archive(None).unwrap();

    let writer = db.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        archive_n(&writer, "late", 7, 1).await;
    });

    let doc = tokio::time::timeout(Duration::from_secs(5), follower.next())
        .await
        .expect("follower should see the late record")
        .unwrap()
        .unwrap();
    assert_eq!(doc.content_field("n"), Some(&json!(7)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_ends_waiting_follower() {
    let dir = TempDir::new().unwrap();
    let db = open_store(&dir).await;
    let mut follower = db.follow_archive(None).unwrap();
    let cancel = follower.cancel_handle();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let next = tokio::time::timeout(Duration::from_secs(5), follower.next())
        .await
        .expect("cancel should wake the follower")
        .unwrap();
    assert!(next.is_none());
    assert!(follower.cancel_handle().is_cancelled());
}

#[tokio::test]
async fn test_follower_applies_filter() {
    let dir = TempDir::new().unwrap();
    let db = open_store(&dir).await;
    archive_n(&db, "skip", 0, 2).await;
    archive_n(&db, "keep", 2, 2).await;

    let query = DocumentQuery::new().require_content_field_equals("kind", "keep");
    let mut follower = db.follow_archive(Some(&query as &dyn NativeFilter)).unwrap();

    let first = follower.next().await.unwrap().unwrap();
    let second = follower.next().await.unwrap().unwrap();
    assert_eq!(first.content_field("n"), Some(&json!(2)));
    assert_eq!(second.content_field("n"), Some(&json!(3)));
    assert!(follower.try_next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_follower_restarts_from_position() {
    let dir = TempDir::new().unwrap();
    let db = open_store(&dir).await;
    archive_n(&db, "any", 0, 4).await;

    let mut follower = db.follow_archive(None).unwrap();
    follower.next().await.unwrap().unwrap();
    follower.next().await.unwrap().unwrap();
    let position = follower.position();
    drop(follower);

    let mut resumed = db.follow_archive_from(None, position).unwrap();
    let doc = resumed.next().await.unwrap().unwrap();
    assert_eq!(doc.content_field("n"), Some(&json!(2)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_wakes_follower_without_waiting_for_poll() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.archive.follow_poll_interval_ms = 60_000;
    let db = DocumentDb::open(config).await.unwrap();
    let mut follower = db.follow_archive(None).unwrap();
    let cancel = follower.cancel_handle();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let next = tokio::time::timeout(Duration::from_secs(2), follower.next())
        .await
        .expect("cancel must not wait out the poll interval")
        .unwrap();
    assert!(next.is_none());

    // Already cancelled: returns at once
    let again = tokio::time::timeout(Duration::from_millis(500), follower.next())
        .await
        .unwrap()
        .unwrap();
    assert!(again.is_none());
}
