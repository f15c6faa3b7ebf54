//! Table creation for the active store and attachments.
//!
//! The archive tables are created separately by
//! [`DocumentDb::ensure_bounded_collection`](crate::DocumentDb::ensure_bounded_collection)
//! because their creation must tolerate concurrent openers.

use crate::error::{DbError, Result};
use crate::types::{Document, DocumentError};
use crate::DocumentDb;
use docyard_ids::DocumentId;
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

/// Columns shared by `documents` and `archived_documents`, in decode order.
pub(crate) const DOCUMENT_COLUMNS: &str = "id, contents, metadata, action, errors";

impl DocumentDb {
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS documents (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                contents TEXT NOT NULL DEFAULT '{}',
                metadata TEXT NOT NULL DEFAULT '{}',
                action TEXT,
                errors TEXT NOT NULL DEFAULT '[]'
            )"#,
        )
        .execute(&self.pool)
        .await?;

        // One live blob per (document, filename)
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS document_files (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id TEXT NOT NULL,
                filename TEXT NOT NULL,
                stage TEXT,
                upload_date TEXT NOT NULL,
                mimetype TEXT,
                encoding TEXT,
                data BLOB NOT NULL,
                UNIQUE (document_id, filename)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        debug!("Document store schema verified");
        Ok(())
    }

    pub(crate) fn row_to_document(&self, row: &SqliteRow) -> Result<Document> {
        let raw_id: String = row.try_get("id")?;
        let id = DocumentId::parse(&raw_id)
            .map_err(|e| DbError::invalid_input(format!("Stored document id: {}", e)))?;
        let contents: Map<String, Value> = serde_json::from_str(row.try_get::<&str, _>("contents")?)?;
        let metadata: Map<String, Value> = serde_json::from_str(row.try_get::<&str, _>("metadata")?)?;
        let action: Option<String> = row.try_get("action")?;
        let errors: Vec<DocumentError> = serde_json::from_str(row.try_get::<&str, _>("errors")?)?;

        Ok(Document::from_stored(id, contents, metadata, action, errors))
    }
}

/// JSON text of the stored columns of `doc`, null content fields dropped.
pub(crate) struct EncodedDocument {
    pub contents: String,
    pub metadata: String,
    pub errors: String,
}

impl EncodedDocument {
    pub(crate) fn encode(doc: &Document) -> Result<Self> {
        let contents: Map<String, Value> = doc
            .contents()
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Self {
            contents: serde_json::to_string(&contents)?,
            metadata: serde_json::to_string(doc.metadata())?,
            errors: serde_json::to_string(doc.errors())?,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.contents.len() + self.metadata.len() + self.errors.len()
    }
}
