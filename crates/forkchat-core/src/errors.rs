use crate::ids::{NodeId, SessionId};
use crate::messages::Role;

/// Error taxonomy surfaced by every history operation. A transport layer
/// maps [`HistoryError::error_kind`] to its own response codes.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum HistoryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("node {node_id} has role {found}, expected {expected}")]
    InvalidRole {
        node_id: NodeId,
        expected: Role,
        found: Role,
    },

    #[error("cannot delete root node {0}")]
    RootDeletion(NodeId),

    #[error("concurrent modification of session {session_id}: {detail}")]
    ConcurrentModification {
        session_id: SessionId,
        detail: String,
    },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl HistoryError {
    pub fn session_not_found(id: &SessionId) -> Self {
        Self::NotFound(format!("session {id}"))
    }

    pub fn node_not_found(id: &NodeId) -> Self {
        Self::NotFound(format!("node {id}"))
    }

    /// Only head races are worth retrying; everything else fails the same
    /// way on a second attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }

    /// Short classification string for logging and transport mapping.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidRole { .. } => "invalid_role",
            Self::RootDeletion(_) => "root_deletion",
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::InvalidOperation(_) => "invalid_operation",
            Self::Storage(_) => "storage",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_concurrent_modification_is_retryable() {
        let cm = HistoryError::ConcurrentModification {
            session_id: SessionId::from_raw("sess_1"),
            detail: "head moved".into(),
        };
        assert!(cm.is_retryable());
        assert!(!HistoryError::NotFound("x".into()).is_retryable());
        assert!(!HistoryError::RootDeletion(NodeId::from_raw("msg_1")).is_retryable());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(HistoryError::InvalidOperation("x".into()).error_kind(), "invalid_operation");
        assert_eq!(
            HistoryError::InvalidRole {
                node_id: NodeId::from_raw("msg_1"),
                expected: Role::User,
                found: Role::Assistant,
            }
            .error_kind(),
            "invalid_role"
        );
        assert_eq!(HistoryError::Storage("disk".into()).error_kind(), "storage");
    }

    #[test]
    fn invalid_role_message_names_both_roles() {
        let err = HistoryError::InvalidRole {
            node_id: NodeId::from_raw("msg_7"),
            expected: Role::Assistant,
            found: Role::User,
        };
        let text = err.to_string();
        assert!(text.contains("msg_7"));
        assert!(text.contains("user"));
        assert!(text.contains("assistant"));
    }
}
