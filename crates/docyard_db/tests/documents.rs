mod common;

use common::{insert_doc, open_store};
use docyard_db::{DbError, DocumentDb, DocumentQuery, TOUCHED_METADATA_TAG};
use serde_json::json;
use tempfile::TempDir;

#[tokio::test]
async fn test_insert_round_trip_drops_null_fields() {
    let dir = TempDir::new().unwrap();
    let db = open_store(&dir).await;

    let mut doc = docyard_db::Document::new();
    doc.put_content_field("title", "Quarterly report");
    doc.put_content_field("pages", 12);
    doc.remove_content_field("draft");
    assert!(db.insert(&mut doc).await);
    let id = doc.id().expect("insert assigns an id");
    assert!(doc.touched_contents().is_empty());

    let stored = db.get_by_id(id, false).await.unwrap().unwrap();
    assert_eq!(stored.id(), Some(id));
    assert_eq!(stored.content_field("title"), Some(&json!("Quarterly report")));
    assert_eq!(stored.content_field("pages"), Some(&json!(12)));
    assert!(!stored.contents().contains_key("draft"));
    assert!(stored.errors().is_empty());
}

#[tokio::test]
async fn test_insert_refuses_document_with_id() {
    let dir = TempDir::new().unwrap();
    let db = open_store(&dir).await;

    let mut doc = insert_doc(&db, &[("title", json!("once"))]).await;
    assert!(!db.insert(&mut doc).await);
    assert_eq!(db.active_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_missing_document_is_none() {
    let dir = TempDir::new().unwrap();
    let db = open_store(&dir).await;

    let id = docyard_db::DocumentId::from_parts(1, 2, 3);
    assert!(db.get_by_id(id, false).await.unwrap().is_none());
    assert!(db.get_by_id(id, true).await.unwrap().is_none());
    assert!(!db.delete(id).await.unwrap());
    assert!(!db.mark_touched(id, "parse").await.unwrap());
}

#[tokio::test]
async fn test_partial_updates_do_not_clobber_each_other() {
    let dir = TempDir::new().unwrap();
    let db = open_store(&dir).await;

    let doc = insert_doc(&db, &[("title", json!("base"))]).await;
    let id = doc.id().unwrap();

    let mut first = db.get_by_id(id, false).await.unwrap().unwrap();
    let mut second = db.get_by_id(id, false).await.unwrap().unwrap();
    first.put_content_field("language", "en");
    second.put_content_field("summary", "short");
    second.put_metadata_field("source", json!({"feed": "rss"}));

    assert!(db.update(&mut first).await);
    assert!(db.update(&mut second).await);

    let stored = db.get_by_id(id, false).await.unwrap().unwrap();
    assert_eq!(stored.content_field("title"), Some(&json!("base")));
    assert_eq!(stored.content_field("language"), Some(&json!("en")));
    assert_eq!(stored.content_field("summary"), Some(&json!("short")));
    assert_eq!(stored.metadata_field("source"), Some(&json!({"feed": "rss"})));
}

#[tokio::test]
async fn test_update_removes_null_fields_and_sets_action() {
    let dir = TempDir::new().unwrap();
    let db = open_store(&dir).await;

    let doc = insert_doc(&db, &[("title", json!("t")), ("scratch", json!([1, 2]))]).await;
    let id = doc.id().unwrap();

    let mut copy = db.get_by_id(id, false).await.unwrap().unwrap();
    copy.remove_content_field("scratch");
    copy.set_action("reindex");
    assert!(db.update(&mut copy).await);
    assert!(!copy.is_action_touched());

    let stored = db.get_by_id(id, false).await.unwrap().unwrap();
    assert!(!stored.contents().contains_key("scratch"));
    assert_eq!(stored.content_field("title"), Some(&json!("t")));
    assert_eq!(stored.action(), Some("reindex"));
}

#[tokio::test]
async fn test_update_without_active_document_fails() {
    let dir = TempDir::new().unwrap();
    let db = open_store(&dir).await;

    let mut fresh = docyard_db::Document::new();
    fresh.put_content_field("title", "no id");
    assert!(!db.update(&mut fresh).await);

    let doc = insert_doc(&db, &[("title", json!("gone soon"))]).await;
    let id = doc.id().unwrap();
    let mut copy = db.get_by_id(id, false).await.unwrap().unwrap();
    assert!(db.delete(id).await.unwrap());
    copy.put_content_field("title", "too late");
    assert!(!db.update(&mut copy).await);
    assert!(db.get_by_id(id, false).await.unwrap().is_none());
}

#[tokio::test]
async fn test_queries_filter_and_page() {
    let dir = TempDir::new().unwrap();
    let db = open_store(&dir).await;

    for i in 0..5 {
        let kind = if i % 2 == 0 { "even" } else { "odd" };
        insert_doc(&db, &[("kind", json!(kind)), ("n", json!(i))]).await;
    }

    let even = DocumentQuery::new().require_content_field_equals("kind", "even");
    assert_eq!(db.count_documents(&even).await.unwrap(), 3);

    let odd = DocumentQuery::new().require_content_field_not_equals("kind", "even");
    let found = db.get_documents(&odd, 10).await.unwrap();
    assert_eq!(found.len(), 2);

    let page = db
        .get_documents_skip(&DocumentQuery::new(), 2, 1)
        .await
        .unwrap();
    let ns: Vec<_> = page.iter().map(|d| d.content_field("n").cloned()).collect();
    assert_eq!(ns, vec![Some(json!(1)), Some(json!(2))]);

    let descending = DocumentQuery::new().order_by_content_field("n", false);
    let top = db.get_document(&descending).await.unwrap().unwrap();
    assert_eq!(top.content_field("n"), Some(&json!(4)));

    let missing = DocumentQuery::new().require_content_field_exists("absent");
    assert!(db.get_document(&missing).await.unwrap().is_none());
}

#[tokio::test]
async fn test_query_rejects_quoted_field_names() {
    let dir = TempDir::new().unwrap();
    let db = open_store(&dir).await;

    let query = DocumentQuery::new().require_content_field_exists("bad\"name");
    let err = db.count_documents(&query).await.unwrap_err();
    assert!(matches!(err, DbError::InvalidInput(_)));
}

#[tokio::test]
async fn test_touched_stamp_and_metadata_queries() {
    let dir = TempDir::new().unwrap();
    let db = open_store(&dir).await;

    let doc = insert_doc(&db, &[("title", json!("t"))]).await;
    let id = doc.id().unwrap();
    assert!(db.mark_touched(id, "enrich").await.unwrap());

    let stored = db.get_by_id(id, false).await.unwrap().unwrap();
    assert!(stored.touched_at("enrich").is_some());
    assert!(stored.metadata_field(TOUCHED_METADATA_TAG).is_some());

    let touched = DocumentQuery::new().require_touched_by_stage("enrich");
    assert_eq!(db.count_documents(&touched).await.unwrap(), 1);
    let untouched = DocumentQuery::new().require_touched_by_stage("other");
    assert_eq!(db.count_documents(&untouched).await.unwrap(), 0);
}

#[tokio::test]
async fn test_delete_all_clears_documents_and_files() {
    let dir = TempDir::new().unwrap();
    let db = open_store(&dir).await;

    let doc = insert_doc(&db, &[("title", json!("t"))]).await;
    let file = docyard_db::DocumentFile::new("raw.txt", b"raw".to_vec()).for_document(doc.id().unwrap());
    db.write_file(&file).await.unwrap();
    insert_doc(&db, &[("title", json!("u"))]).await;

    db.delete_all().await.unwrap();
    assert_eq!(db.active_count().await.unwrap(), 0);
    assert!(db.get_file_names(doc.id().unwrap()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stored_id_decodes_from_both_forms() {
    let dir = TempDir::new().unwrap();
    let db = open_store(&dir).await;

    let doc = insert_doc(&db, &[("title", json!("t"))]).await;
    let id = doc.id().unwrap();
    let structured = id.to_json_value();
    let text = serde_json::Value::String(structured.to_string());

    assert_eq!(DocumentDb::to_document_id(&structured), Some(id));
    assert_eq!(DocumentDb::to_document_id(&text), Some(id));
    assert_eq!(DocumentDb::to_document_id_from_json(&structured.to_string()), Some(id));
    assert_eq!(DocumentDb::to_document_id(&json!(true)), None);
}

#[tokio::test]
async fn test_reopen_keeps_documents() {
    let dir = TempDir::new().unwrap();
    let db = open_store(&dir).await;
    let doc = insert_doc(&db, &[("title", json!("persisted"))]).await;
    db.close().await;

    let db = open_store(&dir).await;
    let stored = db.get_by_id(doc.id().unwrap(), false).await.unwrap().unwrap();
    assert_eq!(stored.content_field("title"), Some(&json!("persisted")));
}
