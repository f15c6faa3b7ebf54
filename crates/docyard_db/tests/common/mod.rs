#![allow(dead_code)]

use docyard_db::{Document, DocumentDb, StatusCounters, StoreConfig};
use std::sync::Arc;
use tempfile::TempDir;

pub fn test_config(dir: &TempDir) -> StoreConfig {
    docyard_logging::init_test_logging();
    let mut config = StoreConfig::for_path(dir.path().join("docyard.sqlite3"));
    config.archive.follow_poll_interval_ms = 20;
    config
}

pub async fn open_store(dir: &TempDir) -> DocumentDb {
    DocumentDb::open(test_config(dir)).await.unwrap()
}

pub async fn open_counted(config: StoreConfig) -> (DocumentDb, Arc<StatusCounters>) {
    let counters = Arc::new(StatusCounters::new());
    let db = DocumentDb::open_with_status(config, counters.clone())
        .await
        .unwrap();
    (db, counters)
}

pub async fn insert_doc(db: &DocumentDb, fields: &[(&str, serde_json::Value)]) -> Document {
    let mut doc = Document::new();
    for (name, value) in fields {
        doc.put_content_field(*name, value.clone());
    }
    assert!(db.insert(&mut doc).await);
    doc
}
