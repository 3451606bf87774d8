use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{NodeId, SessionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Lifecycle of a node's content. Only `Pending` content may change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Committed,
    Pending,
    Failed,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::Pending => "pending",
            Self::Failed => "failed",
        }
    }

    /// Whether children may be attached under a node in this state.
    pub fn accepts_children(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "committed" => Ok(Self::Committed),
            "pending" => Ok(Self::Pending),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown node status: {other}")),
        }
    }
}

/// A single message in a session's history tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageNode {
    pub id: NodeId,
    pub session_id: SessionId,
    pub role: Role,
    pub content: String,
    pub status: NodeStatus,
    /// `None` only for the session root.
    pub parent_id: Option<NodeId>,
    /// Per-session insertion counter; tie-break for sibling order.
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
}

impl MessageNode {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_pending(&self) -> bool {
        self.status == NodeStatus::Pending
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub root_id: NodeId,
    pub head_id: NodeId,
    /// Optimistic-lock counter, bumped by every head commit.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A node to be inserted as part of an atomic commit. The id is chosen by
/// the caller so later entries in the same batch can reference it.
#[derive(Clone, Debug, PartialEq)]
pub struct NewNode {
    pub id: NodeId,
    pub parent_id: NodeId,
    pub role: Role,
    pub content: String,
    pub status: NodeStatus,
}

impl NewNode {
    pub fn committed(parent_id: &NodeId, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(),
            parent_id: parent_id.clone(),
            role,
            content: content.into(),
            status: NodeStatus::Committed,
        }
    }

    pub fn pending_reply(parent_id: &NodeId) -> Self {
        Self {
            id: NodeId::new(),
            parent_id: parent_id.clone(),
            role: Role::Assistant,
            content: String::new(),
            status: NodeStatus::Pending,
        }
    }
}
