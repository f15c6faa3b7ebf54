//! Live-follow over the archive.
//!
//! A follower remembers the archive sequence number of the last record it
//! returned. Records are fetched in batches in archive order; when none are
//! left the follower sleeps for the configured poll interval and asks again.

use crate::documents::to_sql_count;
use crate::error::Result;
use crate::query::{NativeFilter, SqlFilter};
use crate::schema::DOCUMENT_COLUMNS;
use crate::types::Document;
use crate::DocumentDb;
use sqlx::Row;
use std::collections::VecDeque;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

const FOLLOW_BATCH_SIZE: usize = 64;

/// Stops an [`ArchiveFollower`], including one currently waiting.
#[derive(Clone, Default)]
pub struct FollowCancel {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl FollowCancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for FollowCancel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FollowCancel")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Unbounded stream of archived documents, oldest first.
pub struct ArchiveFollower {
    db: DocumentDb,
    filter: SqlFilter,
    position: i64,
    buffer: VecDeque<(i64, Document)>,
    poll_interval: Duration,
    cancel: FollowCancel,
}

impl ArchiveFollower {
    /// Next archived document, waiting for one to arrive.
    ///
    /// `Ok(None)` only once the follower was cancelled.
    pub async fn next(&mut self) -> Result<Option<Document>> {
        let notify = Arc::clone(&self.cancel.notify);
        loop {
            // Registered before the flag is read so a cancel in between still wakes us
            let mut notified = pin!(notify.notified());
            notified.as_mut().enable();
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(doc) = self.try_next().await? {
                return Ok(Some(doc));
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = notified => {}
            }
        }
    }

    /// Next archived document if one is available now.
    pub async fn try_next(&mut self) -> Result<Option<Document>> {
        if self.buffer.is_empty() {
            self.fetch_batch().await?;
        }
        Ok(self.buffer.pop_front().map(|(seq, doc)| {
            self.position = seq;
            doc
        }))
    }

    /// Archive position of the last document returned. Pass it to
    /// [`DocumentDb::follow_archive_from`] to resume after it.
    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn cancel_handle(&self) -> FollowCancel {
        self.cancel.clone()
    }

    async fn fetch_batch(&mut self) -> Result<()> {
        let after = self.buffer.back().map_or(self.position, |(seq, _)| *seq);
        let sql = format!(
            "SELECT seq, {} FROM archived_documents WHERE seq > ? AND ({}) ORDER BY seq LIMIT ?",
            DOCUMENT_COLUMNS,
            self.filter.clause()
        );
        let query = sqlx::query(&sql).bind(after);
        let rows = self
            .filter
            .bind_to(query)
            .bind(to_sql_count(FOLLOW_BATCH_SIZE))
            .fetch_all(self.db.pool())
            .await?;

        for row in &rows {
            let seq: i64 = row.try_get("seq")?;
            self.buffer.push_back((seq, self.db.row_to_document(row)?));
        }
        if !rows.is_empty() {
            debug!(after, fetched = rows.len(), "Fetched archive records");
        }
        Ok(())
    }
}

impl DocumentDb {
    /// Follow the archive from its oldest retained record.
    pub fn follow_archive(&self, query: Option<&dyn NativeFilter>) -> Result<ArchiveFollower> {
        self.follow_archive_from(query, 0)
    }

    /// Follow the archive from just after `position`.
    pub fn follow_archive_from(
        &self,
        query: Option<&dyn NativeFilter>,
        position: i64,
    ) -> Result<ArchiveFollower> {
        let filter = match query {
            Some(query) => query.to_native_filter()?,
            None => SqlFilter::match_all(),
        };
        Ok(ArchiveFollower {
            db: self.clone(),
            filter,
            position,
            buffer: VecDeque::new(),
            poll_interval: self.config.archive.follow_poll_interval(),
            cancel: FollowCancel::new(),
        })
    }
}
