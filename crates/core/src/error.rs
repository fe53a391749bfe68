use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors produced by the note engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The record on the medium was written or removed by someone else since
    /// this process last observed it. The caller must reload before retrying.
    /// `stored` is `None` when the record no longer exists.
    #[error("note {note_id} was modified externally (stored {stored:?}, observed {observed:?})")]
    Conflict {
        note_id: String,
        stored: Option<DateTime<Utc>>,
        observed: Option<DateTime<Utc>>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid note id: {0:?}")]
    InvalidId(String),

    #[error("remote backend error: {0}")]
    Remote(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("watcher error: {0}")]
    Watcher(#[from] notify::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to move to trash: {0}")]
    Trash(String),
}

impl Error {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
