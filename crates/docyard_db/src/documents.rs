//! Active document operations: reads, claiming, stamping and writes.

use crate::error::Result;
use crate::query::{
    bind_values, content_path, fetched_tag_expression, json_path, metadata_path, FilterValue,
    NativeFilter, SqlFilter,
};
use crate::schema::{EncodedDocument, DOCUMENT_COLUMNS};
use crate::types::*;
use crate::DocumentDb;
use docyard_ids::DocumentId;
use sqlx::Row;
use std::time::Instant;
use tracing::{debug, error, info, warn};

impl DocumentDb {
    // ========================================================================
    // Reads
    // ========================================================================

    /// Look up a document by id, optionally falling back to the archive.
    pub async fn get_by_id(
        &self,
        id: DocumentId,
        include_archived: bool,
    ) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(id.to_hex())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.row_to_document(&row)?)),
            None if include_archived => self.get_archived_by_id(id).await,
            None => Ok(None),
        }
    }

    /// First active document matching `query`.
    pub async fn get_document<Q: NativeFilter + ?Sized>(
        &self,
        query: &Q,
    ) -> Result<Option<Document>> {
        Ok(self.get_documents_skip(query, 1, 0).await?.into_iter().next())
    }

    pub async fn get_documents<Q: NativeFilter + ?Sized>(
        &self,
        query: &Q,
        limit: usize,
    ) -> Result<Vec<Document>> {
        self.get_documents_skip(query, limit, 0).await
    }

    /// Up to `limit` active documents matching `query`, after skipping `skip`.
    pub async fn get_documents_skip<Q: NativeFilter + ?Sized>(
        &self,
        query: &Q,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<Document>> {
        let filter = query.to_native_filter()?;
        let sql = format!(
            "SELECT {} FROM documents WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
            DOCUMENT_COLUMNS,
            filter.clause(),
            filter.order_by()
        );
        let rows = filter
            .bind_to(sqlx::query(&sql))
            .bind(to_sql_count(limit))
            .bind(to_sql_count(skip))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(|row| self.row_to_document(row)).collect()
    }

    pub async fn count_documents<Q: NativeFilter + ?Sized>(&self, query: &Q) -> Result<u64> {
        let filter = query.to_native_filter()?;
        let sql = format!("SELECT COUNT(*) FROM documents WHERE {}", filter.clause());
        let row = filter
            .bind_to(sqlx::query(&sql))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>(0)?.max(0) as u64)
    }

    pub async fn active_count(&self) -> Result<u64> {
        self.count_documents(&SqlFilter::match_all()).await
    }

    // ========================================================================
    // Claiming
    // ========================================================================

    /// Atomically claim one document matching `query` for `tags`.
    ///
    /// Pending and committing documents, and documents any of `tags` already
    /// fetched, never match. The fetched stamp of every tag is written in the
    /// same statement that selects the document, so concurrent callers with
    /// the same tags never receive the same document.
    pub async fn claim_and_tag<Q: NativeFilter + ?Sized>(
        &self,
        query: &Q,
        tags: &[&str],
    ) -> Result<Option<Document>> {
        for tag in tags {
            self.ensure_tag_index(tag).await?;
        }

        let mut filter = query
            .to_native_filter()?
            .and(SqlFilter::new(
                format!(
                    "json_type(metadata, '{}') IS NULL",
                    metadata_path(PENDING_METADATA_FLAG)?
                ),
                Vec::new(),
            ))
            // Not-equals so documents that never had the flag still match
            .and(SqlFilter::new(
                format!(
                    "json_extract(metadata, '{}') IS NOT ?",
                    metadata_path(COMMITTING_METADATA_FLAG)?
                ),
                vec![FilterValue::Bool(true)],
            ));
        for tag in tags {
            filter = filter.and(SqlFilter::new(
                format!("{} IS NULL", fetched_tag_expression(tag)?),
                Vec::new(),
            ));
        }

        let now = timestamp_now();
        let mut stamp_expr = String::from("metadata");
        let mut stamp_binds = Vec::with_capacity(tags.len());
        for tag in tags {
            stamp_expr = format!(
                "json_set({}, '{}', ?)",
                stamp_expr,
                json_path(&[FETCHED_METADATA_TAG, *tag])?
            );
            stamp_binds.push(FilterValue::Text(now.clone()));
        }

        let sql = format!(
            r#"
            UPDATE documents SET metadata = {}
            WHERE seq = (
                SELECT seq FROM documents WHERE {} ORDER BY {} LIMIT 1
            )
            RETURNING {}
            "#,
            stamp_expr,
            filter.clause(),
            filter.order_by(),
            DOCUMENT_COLUMNS
        );
        let query = bind_values(sqlx::query(&sql), &stamp_binds);
        let row = filter.bind_to(query).fetch_optional(&self.pool).await?;

        match row {
            Some(row) => {
                let doc = self.row_to_document(&row)?;
                if let Some(id) = doc.id() {
                    debug!(doc_id = %id, tags = ?tags, "Claimed document");
                }
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    /// Claim up to `n` documents, stopping at the first miss.
    pub async fn claim_and_tag_batch<Q: NativeFilter + ?Sized>(
        &self,
        query: &Q,
        n: usize,
        tags: &[&str],
    ) -> Result<Vec<Document>> {
        let mut claimed = Vec::new();
        for _ in 0..n {
            match self.claim_and_tag(query, tags).await? {
                Some(doc) => claimed.push(doc),
                None => break,
            }
        }
        Ok(claimed)
    }

    /// Whether this handle has already ensured the claim index for `tag`.
    pub fn is_tag_indexed(&self, tag: &str) -> bool {
        self.indexed_tags
            .lock()
            .map(|tags| tags.contains(tag))
            .unwrap_or(false)
    }

    async fn ensure_tag_index(&self, tag: &str) -> Result<()> {
        if self.is_tag_indexed(tag) {
            return Ok(());
        }

        let start = Instant::now();
        let expression = fetched_tag_expression(tag)?;
        let index_name: String = tag.bytes().map(|b| format!("{:02x}", b)).collect();
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS documents_fetched_{} ON documents ({})",
            index_name, expression
        ))
        .execute(&self.pool)
        .await?;
        info!(
            tag,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Ensured claim index"
        );

        if let Ok(mut tags) = self.indexed_tags.lock() {
            tags.insert(tag.to_string());
        }
        Ok(())
    }

    // ========================================================================
    // Stamps
    // ========================================================================

    /// Record that `tag` made progress on the document. `Ok(false)` if it is
    /// not active.
    pub async fn mark_touched(&self, id: DocumentId, tag: &str) -> Result<bool> {
        let sql = format!(
            "UPDATE documents SET metadata = json_set(metadata, '{}', ?) WHERE id = ?",
            json_path(&[TOUCHED_METADATA_TAG, tag])?
        );
        let result = sqlx::query(&sql)
            .bind(timestamp_now())
            .bind(id.to_hex())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Flag the document as pending on `stage`, hiding it from claims.
    pub async fn mark_pending(&self, id: DocumentId, stage: &str) -> Result<bool> {
        let sql = format!(
            "UPDATE documents SET metadata = json_set(metadata, '{}', json(?)) WHERE id = ?",
            metadata_path(PENDING_METADATA_FLAG)?
        );
        let result = sqlx::query(&sql)
            .bind(stamp_value(stage).to_string())
            .bind(id.to_hex())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Persist the fields this copy changed.
    ///
    /// Touched content and metadata fields are set, null content fields are
    /// removed, and the action is written if it was changed. Returns true
    /// only if exactly one stored document was updated.
    pub async fn update(&self, doc: &mut Document) -> bool {
        let Some(id) = doc.id() else {
            error!("Unable to update document without an id");
            return false;
        };

        match self.apply_update(id, doc).await {
            Ok(true) => {
                doc.mark_clean();
                true
            }
            Ok(false) => {
                warn!(doc_id = %id, "Update matched no active document");
                false
            }
            Err(e) => {
                error!(doc_id = %id, error = %e, "Update failed");
                false
            }
        }
    }

    async fn apply_update(&self, id: DocumentId, doc: &Document) -> Result<bool> {
        let mut binds = Vec::new();

        let mut contents_expr = String::from("contents");
        for name in doc.touched_contents() {
            if let Some(value) = doc.content_field(name) {
                contents_expr = format!(
                    "json_set({}, '{}', json(?))",
                    contents_expr,
                    content_path(name)?
                );
                binds.push(FilterValue::Text(value.to_string()));
            }
        }
        let removed = doc.null_content_fields();
        if !removed.is_empty() {
            let paths = removed
                .iter()
                .map(|name| content_path(name).map(|p| format!("'{}'", p)))
                .collect::<Result<Vec<_>>>()?;
            contents_expr = format!("json_remove({}, {})", contents_expr, paths.join(", "));
        }

        let mut metadata_expr = String::from("metadata");
        for name in doc.touched_metadata() {
            let value = doc
                .metadata_field(name)
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            metadata_expr = format!(
                "json_set({}, '{}', json(?))",
                metadata_expr,
                json_path(&[name])?
            );
            binds.push(FilterValue::Text(value.to_string()));
        }

        let mut sql = format!(
            "UPDATE documents SET contents = {}, metadata = {}",
            contents_expr, metadata_expr
        );
        if doc.is_action_touched() {
            sql.push_str(", action = ?");
            binds.push(match doc.action() {
                Some(action) => FilterValue::Text(action.to_string()),
                None => FilterValue::Null,
            });
        }
        sql.push_str(" WHERE id = ?");
        binds.push(FilterValue::Text(id.to_hex()));

        let result = bind_values(sqlx::query(&sql), &binds)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Insert a new document; the store assigns its id.
    ///
    /// Documents that already carry an id are refused. Null content fields
    /// are dropped before writing.
    pub async fn insert(&self, doc: &mut Document) -> bool {
        if let Some(id) = doc.id() {
            error!(doc_id = %id, "Refusing to insert a document that already has an id");
            return false;
        }

        doc.strip_null_contents();
        let id = self.ids.next_id();
        match self.insert_record(id, doc).await {
            Ok(()) => {
                doc.set_id(id);
                doc.mark_clean();
                debug!(doc_id = %id, "Inserted document");
                true
            }
            Err(e) => {
                error!(doc_id = %id, error = %e, "Insert failed");
                false
            }
        }
    }

    async fn insert_record(&self, id: DocumentId, doc: &Document) -> Result<()> {
        let encoded = EncodedDocument::encode(doc)?;
        sqlx::query(
            r#"
            INSERT INTO documents (id, contents, metadata, action, errors)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_hex())
        .bind(&encoded.contents)
        .bind(&encoded.metadata)
        .bind(doc.action())
        .bind(&encoded.errors)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert a document together with its attachments.
    ///
    /// The document stays unclaimable (`committing`) until every attachment
    /// is written. If an attachment fails, the document and the attachments
    /// already written are deleted and false is returned.
    pub async fn insert_with_attachments(
        &self,
        doc: &mut Document,
        attachments: Vec<DocumentFile>,
    ) -> bool {
        if attachments.is_empty() {
            return self.insert(doc).await;
        }

        doc.put_metadata_field(COMMITTING_METADATA_FLAG, true);
        if !self.insert(doc).await {
            return false;
        }
        let Some(id) = doc.id() else {
            return false;
        };

        let mut written: Vec<String> = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            let attachment = attachment.for_document(id);
            if let Err(e) = self.write_file(&attachment).await {
                error!(
                    doc_id = %id,
                    file_name = %attachment.file_name,
                    error = %e,
                    "Exception while writing attachment; removing document"
                );
                self.discard_partial_insert(id, &written).await;
                return false;
            }
            written.push(attachment.file_name);
        }

        doc.put_metadata_field(COMMITTING_METADATA_FLAG, false);
        self.update(doc).await
    }

    async fn discard_partial_insert(&self, id: DocumentId, written: &[String]) {
        for file_name in written {
            if let Err(e) = self.delete_file(id, file_name).await {
                error!(doc_id = %id, file_name = %file_name, error = %e, "Failed to remove attachment of aborted insert");
            }
        }
        if let Err(e) = self.delete(id).await {
            error!(doc_id = %id, error = %e, "Failed to remove aborted insert");
        }
    }

    /// Remove the document record. Attachments are left in place.
    pub async fn delete(&self, id: DocumentId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id.to_hex())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Remove every active document and every attachment.
    pub async fn delete_all(&self) -> Result<()> {
        let documents = sqlx::query("DELETE FROM documents")
            .execute(&self.pool)
            .await?
            .rows_affected();
        let files = sqlx::query("DELETE FROM document_files")
            .execute(&self.pool)
            .await?
            .rows_affected();
        info!(documents, files, "Cleared active documents and attachments");
        Ok(())
    }
}

pub(crate) fn to_sql_count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
