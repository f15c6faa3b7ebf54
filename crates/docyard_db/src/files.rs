//! Attachment storage keyed by (document id, filename).

use crate::error::{DbError, Result};
use crate::types::DocumentFile;
use crate::DocumentDb;
use chrono::{DateTime, Utc};
use docyard_ids::DocumentId;
use sqlx::Row;
use std::io;
use tokio::time::Instant;
use tracing::{debug, warn};

impl DocumentDb {
    /// Store an attachment, replacing any earlier blob with the same name.
    ///
    /// Returns only once the blob can be read back, or fails with an
    /// [`io::ErrorKind::TimedOut`] error when that takes longer than the
    /// configured visibility budget.
    pub async fn write_file(&self, file: &DocumentFile) -> Result<()> {
        let id = file
            .document_id
            .ok_or_else(|| DbError::invalid_input("Attachment has no document id"))?;
        if file.file_name.is_empty() {
            return Err(DbError::invalid_input("Attachment has an empty file name"));
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM document_files WHERE document_id = ? AND filename = ?")
            .bind(id.to_hex())
            .bind(&file.file_name)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO document_files (document_id, filename, stage, upload_date, mimetype, encoding, data)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_hex())
        .bind(&file.file_name)
        .bind(file.stage.as_deref())
        .bind(Utc::now())
        .bind(file.mimetype.as_deref())
        .bind(file.encoding.as_deref())
        .bind(file.data.as_slice())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.await_file_visible(id, &file.file_name).await?;
        debug!(doc_id = %id, file_name = %file.file_name, bytes = file.data.len(), "Wrote attachment");
        Ok(())
    }

    /// Poll until the attachment is readable through the pool.
    async fn await_file_visible(&self, id: DocumentId, file_name: &str) -> Result<()> {
        let settings = &self.config.files;
        let deadline = Instant::now() + settings.visibility_budget();
        loop {
            if self.file_exists(id, file_name).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(doc_id = %id, file_name, "Attachment not readable within budget");
                return Err(DbError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("Failed to save the file {} for {}", file_name, id),
                )));
            }
            tokio::time::sleep(settings.visibility_poll_interval()).await;
        }
    }

    async fn file_exists(&self, id: DocumentId, file_name: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM document_files WHERE document_id = ? AND filename = ?")
            .bind(id.to_hex())
            .bind(file_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Read an attachment.
    pub async fn get_file(&self, id: DocumentId, file_name: &str) -> Result<Option<DocumentFile>> {
        let row = sqlx::query(
            r#"
            SELECT filename, stage, upload_date, mimetype, encoding, data
            FROM document_files WHERE document_id = ? AND filename = ?
            "#,
        )
        .bind(id.to_hex())
        .bind(file_name)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(DocumentFile {
            document_id: Some(id),
            file_name: row.try_get("filename")?,
            data: row.try_get("data")?,
            stage: row.try_get("stage")?,
            upload_date: Some(row.try_get::<DateTime<Utc>, _>("upload_date")?),
            mimetype: row.try_get("mimetype")?,
            encoding: row.try_get("encoding")?,
        }))
    }

    /// Names of all attachments of a document, oldest first.
    pub async fn get_file_names(&self, id: DocumentId) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT filename FROM document_files WHERE document_id = ? ORDER BY seq")
            .bind(id.to_hex())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("filename").map_err(DbError::from))
            .collect()
    }

    /// Delete one attachment. True only if exactly one blob was removed.
    pub async fn delete_file(&self, id: DocumentId, file_name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM document_files WHERE document_id = ? AND filename = ?")
            .bind(id.to_hex())
            .bind(file_name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Delete every attachment of a document, returning how many went.
    pub async fn delete_all_files(&self, id: DocumentId) -> Result<usize> {
        let mut deleted = 0;
        for file_name in self.get_file_names(id).await? {
            if self.delete_file(id, &file_name).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}
