use forkchat_core::ids::{NodeId, SessionId};
use forkchat_core::HistoryError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("version conflict on session {session_id}: expected {expected}, found {actual}")]
    Conflict {
        session_id: SessionId,
        expected: i64,
        actual: i64,
    },

    #[error("cannot delete root node {0}")]
    RootDeletion(NodeId),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("corrupt history: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<StoreError> for HistoryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => HistoryError::NotFound(what),
            StoreError::Conflict {
                session_id,
                expected,
                actual,
            } => HistoryError::ConcurrentModification {
                session_id,
                detail: format!("expected version {expected}, found {actual}"),
            },
            StoreError::RootDeletion(id) => HistoryError::RootDeletion(id),
            StoreError::InvalidOperation(msg) => HistoryError::InvalidOperation(msg),
            other => HistoryError::Storage(other.to_string()),
        }
    }
}
