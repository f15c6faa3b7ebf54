//! Error types for the document store.

use thiserror::Error;

/// Store operation result type.
pub type Result<T> = std::result::Result<T, DbError>;

/// SQLite primary result code for "string or blob too big".
const SQLITE_TOOBIG: &str = "18";

/// Store errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// SQLx error (connection, query, constraint, ...)
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// IO error, including attachment visibility timeouts
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding of a stored record failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Caller supplied something the store cannot address
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Record exceeds the archive's per-record limit
    #[error("Record of {size} bytes exceeds limit of {limit} bytes")]
    RecordTooLarge { size: usize, limit: usize },

    /// Configuration could not be read or written
    #[error("Config error: {0}")]
    Config(String),
}

impl DbError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether the store failed internally on the record itself (size or
    /// encoding), as opposed to rejecting it logically or being unreachable.
    ///
    /// Only internal failures are worth retrying with a smaller record.
    pub fn is_internal(&self) -> bool {
        match self {
            Self::RecordTooLarge { .. } | Self::Serialization(_) => true,
            Self::Sqlx(sqlx::Error::Database(db)) => {
                db.code().as_deref() == Some(SQLITE_TOOBIG)
            }
            _ => false,
        }
    }
}
