//! Completion and the bounded archive of finished documents.
//!
//! `archived_documents` keeps a running byte size per record. Every insert
//! evicts the oldest records, in the same transaction, until both the total
//! size and the record count are within the capacity stored in
//! `archive_capacity`.

use crate::documents::to_sql_count;
use crate::error::{DbError, Result};
use crate::schema::{EncodedDocument, DOCUMENT_COLUMNS};
use crate::types::{CompletionKind, Document, REMOVED_CONTENT_PLACEHOLDER};
use crate::DocumentDb;
use docyard_ids::DocumentId;
use sqlx::Row;
use tracing::{debug, error, info, warn};

/// Attempts made to archive one document before giving up on it.
pub const MAX_ARCHIVE_ATTEMPTS: usize = 10;

impl DocumentDb {
    // ========================================================================
    // Bounded collection
    // ========================================================================

    /// Create the archive with the given capacity unless it already exists.
    ///
    /// Never fails: losing a creation race to another process is expected,
    /// anything else is logged.
    pub async fn ensure_bounded_collection(&self, max_bytes: u64, max_records: u64) {
        match self.archive_exists().await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                error!(error = %e, "Could not inspect archive table");
                return;
            }
        }

        match self.create_archive(max_bytes, max_records).await {
            Ok(()) => info!(max_bytes, max_records, "Created archive"),
            Err(e) => match self.archive_exists().await {
                Ok(true) => debug!(error = %e, "Raced to create archive table and lost"),
                _ => error!(error = %e, "Failed to create archive table"),
            },
        }
    }

    async fn archive_exists(&self) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'archived_documents'",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn create_archive(&self, max_bytes: u64, max_records: u64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"CREATE TABLE archived_documents (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                contents TEXT NOT NULL DEFAULT '{}',
                metadata TEXT NOT NULL DEFAULT '{}',
                action TEXT,
                errors TEXT NOT NULL DEFAULT '[]',
                size_bytes INTEGER NOT NULL,
                archived_at TEXT NOT NULL
            )"#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS archived_documents_id ON archived_documents (id)")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS archive_capacity (
                singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
                max_bytes INTEGER NOT NULL,
                max_records INTEGER NOT NULL
            )"#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("INSERT OR REPLACE INTO archive_capacity (singleton, max_bytes, max_records) VALUES (1, ?, ?)")
            .bind(i64::try_from(max_bytes).unwrap_or(i64::MAX))
            .bind(i64::try_from(max_records).unwrap_or(i64::MAX))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Newest archived copy of a document.
    pub async fn get_archived_by_id(&self, id: DocumentId) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM archived_documents WHERE id = ? ORDER BY seq DESC LIMIT 1",
            DOCUMENT_COLUMNS
        ))
        .bind(id.to_hex())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| self.row_to_document(&row)).transpose()
    }

    pub async fn archived_count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) FROM archived_documents")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>(0)?.max(0) as u64)
    }

    // ========================================================================
    // Completion
    // ========================================================================

    pub async fn mark_processed(&self, doc: &mut Document, stage: &str) -> bool {
        self.mark_done(doc, stage, CompletionKind::Processed).await
    }

    pub async fn mark_discarded(&self, doc: &mut Document, stage: &str) -> bool {
        self.mark_done(doc, stage, CompletionKind::Discarded).await
    }

    pub async fn mark_failed(&self, doc: &mut Document, stage: &str) -> bool {
        self.mark_done(doc, stage, CompletionKind::Failed).await
    }

    /// Move a document from the active store into the archive.
    ///
    /// The stored record is removed first, so exactly one caller completes a
    /// given document. The in-memory copy is merged over the removed record,
    /// stamped with `kind`, and archived; its attachments are deleted. The
    /// status counter for `kind` is incremented once whatever the outcome.
    ///
    /// On success `doc` holds what was archived, including any content
    /// replaced to make the record fit.
    pub async fn mark_done(&self, doc: &mut Document, stage: &str, kind: CompletionKind) -> bool {
        let archived = self.complete(doc, stage, kind).await;
        match kind {
            CompletionKind::Processed => self.status.add_processed(1),
            CompletionKind::Discarded => self.status.add_discarded(1),
            CompletionKind::Failed => self.status.add_failed(1),
        }
        archived
    }

    async fn complete(&self, doc: &mut Document, stage: &str, kind: CompletionKind) -> bool {
        let Some(id) = doc.id() else {
            error!(stage, kind = %kind, "Unable to complete document without an id");
            return false;
        };

        let snapshot = match self.remove_active(id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                warn!(doc_id = %id, stage, kind = %kind, "Document is no longer active");
                return false;
            }
            Err(e) => {
                error!(doc_id = %id, stage, error = %e, "Failed to remove document for archival");
                return false;
            }
        };

        doc.merge_over(snapshot);
        doc.strip_null_contents();
        doc.stamp_completion(kind, stage);

        match self.delete_all_files(id).await {
            Ok(0) => {}
            Ok(files) => debug!(doc_id = %id, files, "Deleted attachments of completed document"),
            Err(e) => warn!(doc_id = %id, error = %e, "Failed to delete attachments of completed document"),
        }

        let archived = self.archive_with_degrade(id, doc, stage).await;
        if archived {
            doc.mark_clean();
            debug!(doc_id = %id, stage, kind = %kind, "Archived document");
        }
        archived
    }

    async fn remove_active(&self, id: DocumentId) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "DELETE FROM documents WHERE id = ? RETURNING {}",
            DOCUMENT_COLUMNS
        ))
        .bind(id.to_hex())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| self.row_to_document(&row)).transpose()
    }

    /// Insert into the archive, dropping the largest content field after each
    /// internal failure.
    async fn archive_with_degrade(&self, id: DocumentId, doc: &mut Document, stage: &str) -> bool {
        for attempt in 1..=MAX_ARCHIVE_ATTEMPTS {
            let e = match self.insert_archived(id, doc).await {
                Ok(()) => return true,
                Err(e) if e.is_internal() => e,
                Err(e) => {
                    error!(
                        doc_id = %id,
                        stage,
                        attempt,
                        error = %e,
                        archive_data_loss = true,
                        "Archive rejected document"
                    );
                    return false;
                }
            };

            match doc.largest_content_field().map(str::to_string) {
                Some(field) => {
                    warn!(doc_id = %id, stage, attempt, field = %field, error = %e, "Archive insert failed; removing content field");
                    doc.put_content_field(field, REMOVED_CONTENT_PLACEHOLDER);
                }
                None => warn!(doc_id = %id, stage, attempt, error = %e, "Archive insert failed"),
            }
            doc.add_error(stage, e.to_string());
        }

        error!(
            doc_id = %id,
            stage,
            attempts = MAX_ARCHIVE_ATTEMPTS,
            archive_data_loss = true,
            "Giving up on archiving document"
        );
        false
    }

    async fn insert_archived(&self, id: DocumentId, doc: &Document) -> Result<()> {
        let encoded = EncodedDocument::encode(doc)?;
        let hex = id.to_hex();
        let size = hex.len() + encoded.len() + doc.action().map_or(0, str::len);
        let limit = self.config.archive.max_record_bytes;
        if size > limit {
            return Err(DbError::RecordTooLarge { size, limit });
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO archived_documents (id, contents, metadata, action, errors, size_bytes, archived_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&hex)
        .bind(&encoded.contents)
        .bind(&encoded.metadata)
        .bind(doc.action())
        .bind(&encoded.errors)
        .bind(to_sql_count(size))
        .bind(chrono::Utc::now())
        .execute(&mut *tx)
        .await?;

        let capacity = sqlx::query("SELECT max_bytes, max_records FROM archive_capacity WHERE singleton = 1")
            .fetch_one(&mut *tx)
            .await?;
        let max_bytes: i64 = capacity.try_get("max_bytes")?;
        let max_records: i64 = capacity.try_get("max_records")?;
        if to_sql_count(size) > max_bytes {
            // Dropping the transaction rolls the insert back
            return Err(DbError::RecordTooLarge {
                size,
                limit: usize::try_from(max_bytes).unwrap_or(0),
            });
        }

        let evicted = sqlx::query(
            r#"
            DELETE FROM archived_documents WHERE seq IN (
                SELECT seq FROM (
                    SELECT seq,
                           SUM(size_bytes) OVER (ORDER BY seq DESC) AS retained_bytes,
                           ROW_NUMBER() OVER (ORDER BY seq DESC) AS retained_records
                    FROM archived_documents
                )
                WHERE retained_bytes > ? OR retained_records > ?
            )
            "#,
        )
        .bind(max_bytes)
        .bind(max_records)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        if evicted > 0 {
            debug!(evicted, "Evicted oldest archive records");
        }
        Ok(())
    }
}
