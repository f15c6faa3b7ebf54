//! Document store for docyard pipelines.
//!
//! Workers share one SQLite database. Active documents live in `documents`,
//! attachments in `document_files`, and completed documents move into the
//! bounded `archived_documents` table. Every operation that coordinates
//! workers (claiming, stamping, removal for archival) is a single SQL
//! statement, so the database's write lock is the only mutual exclusion.
//!
//! # Usage
//!
//! ```rust,ignore
//! use docyard_db::{DocumentDb, DocumentQuery, StoreConfig};
//!
//! let db = DocumentDb::open(StoreConfig::for_path("/var/lib/docyard/pipeline.sqlite3")).await?;
//!
//! if let Some(mut doc) = db.claim_and_tag(&DocumentQuery::new(), &["parse"]).await? {
//!     doc.put_content_field("title", "Parsed title");
//!     db.update(&mut doc).await;
//!     db.mark_processed(&mut doc, "parse").await;
//! }
//! ```

mod archive;
mod config;
mod documents;
mod error;
mod files;
mod follow;
mod ids;
mod query;
mod schema;
mod status;
mod types;

pub use archive::MAX_ARCHIVE_ATTEMPTS;
pub use config::{ArchiveConfig, FileConfig, StoreConfig};
pub use docyard_ids::{DocumentId, IdParseError};
pub use error::{DbError, Result};
pub use follow::{ArchiveFollower, FollowCancel};
pub use ids::{to_document_id, to_document_id_from_json};
pub use query::{DocumentQuery, FilterValue, NativeFilter, SqlFilter};
pub use status::{StatusCounters, StatusSnapshot, StatusUpdater};
pub use types::*;

use docyard_ids::IdGenerator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Handle on the shared document store.
///
/// Cheap to clone; clones share the connection pool, the id generator and
/// the set of claim tags already indexed.
#[derive(Clone)]
pub struct DocumentDb {
    pool: SqlitePool,
    config: Arc<StoreConfig>,
    ids: Arc<IdGenerator>,
    indexed_tags: Arc<Mutex<HashSet<String>>>,
    status: Arc<dyn StatusUpdater>,
}

impl DocumentDb {
    /// Open or create the store described by `config`, counting completions
    /// in a fresh [`StatusCounters`].
    pub async fn open(config: StoreConfig) -> Result<Self> {
        Self::open_with_status(config, Arc::new(StatusCounters::new())).await
    }

    /// Open or create the store, reporting completions to `status`.
    ///
    /// Creates missing tables and the bounded archive.
    pub async fn open_with_status(
        config: StoreConfig,
        status: Arc<dyn StatusUpdater>,
    ) -> Result<Self> {
        let path = config.database_path.clone();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout());

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        let db = Self {
            pool,
            config: Arc::new(config),
            ids: Arc::new(IdGenerator::new()),
            indexed_tags: Arc::new(Mutex::new(HashSet::new())),
            status,
        };

        db.ensure_schema().await?;
        db.prepare().await;

        info!(path = %path.display(), "Document store opened");

        Ok(db)
    }

    /// Create the bounded archive with the configured capacity if it does not
    /// exist yet.
    pub async fn prepare(&self) {
        let archive = &self.config.archive;
        self.ensure_bounded_collection(archive.max_bytes(), archive.max_documents)
            .await;
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Escape hatch for maintenance queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the connection pool.
    pub async fn close(self) {
        self.pool.close().await;
    }
}
