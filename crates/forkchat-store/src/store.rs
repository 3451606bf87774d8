use std::collections::{HashMap, HashSet};

use forkchat_core::ids::{NodeId, SessionId};
use forkchat_core::messages::{MessageNode, NewNode, NodeStatus, Role, Session};
use forkchat_core::SessionSnapshot;

use crate::error::StoreError;

/// One atomic head transition: insert `inserts` in order, prune the
/// subtree rooted at `prune`, then point the session at `head`.
#[derive(Clone, Debug, PartialEq)]
pub struct Commit {
    pub inserts: Vec<NewNode>,
    pub prune: Option<NodeId>,
    pub head: NodeId,
}

impl Commit {
    pub fn move_head(head: &NodeId) -> Self {
        Self {
            inserts: Vec::new(),
            prune: None,
            head: head.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CommitOutcome {
    pub session: Session,
    pub inserted: Vec<MessageNode>,
    pub pruned: Vec<NodeId>,
}

/// Persistence contract for the history tree.
///
/// Implementations must apply `commit` all-or-nothing and must compare
/// `expected_version` against the stored session version inside the same
/// critical section that performs the write.
pub trait MessageStore: Send + Sync {
    /// Create a session together with its system root node.
    fn create_session(&self, system_prompt: &str) -> Result<(Session, MessageNode), StoreError>;

    fn get_session(&self, id: &SessionId) -> Result<Session, StoreError>;

    /// Sessions ordered newest first.
    fn list_sessions(&self, limit: u32, offset: u32) -> Result<Vec<Session>, StoreError>;

    /// Insert a single node without moving the head. A `None` parent is only
    /// accepted for a session that has no root yet, which never holds for
    /// sessions made by `create_session`.
    fn create_node(
        &self,
        session_id: &SessionId,
        role: Role,
        content: &str,
        parent_id: Option<&NodeId>,
        status: NodeStatus,
    ) -> Result<MessageNode, StoreError>;

    fn get_node(&self, id: &NodeId) -> Result<MessageNode, StoreError>;

    /// Child ids in display order: created_at ascending, then insertion.
    fn list_children(&self, parent_id: &NodeId) -> Result<Vec<NodeId>, StoreError>;

    /// Remove `id` and every descendant, returning the removed ids.
    fn delete_subtree(&self, id: &NodeId) -> Result<Vec<NodeId>, StoreError>;

    /// Resolve a pending node. Committed nodes are immutable.
    fn update_node_content(
        &self,
        id: &NodeId,
        content: &str,
        status: NodeStatus,
    ) -> Result<MessageNode, StoreError>;

    /// Consistent read of the session row and all of its nodes.
    fn snapshot(&self, session_id: &SessionId) -> Result<SessionSnapshot, StoreError>;

    fn commit(
        &self,
        session_id: &SessionId,
        expected_version: i64,
        commit: &Commit,
    ) -> Result<CommitOutcome, StoreError>;

    /// Case-insensitive substring search over node content.
    fn search_nodes(
        &self,
        session_id: &SessionId,
        query: &str,
        limit: u32,
    ) -> Result<Vec<MessageNode>, StoreError>;
}

/// Point lookups a backend provides so commit validation is shared.
pub(crate) trait NodeLookup {
    /// Status of `id` if it exists in `session_id`.
    fn status_in(&self, session_id: &SessionId, id: &NodeId) -> Result<Option<NodeStatus>, StoreError>;

    /// `id` followed by all of its descendants.
    fn subtree(&self, id: &NodeId) -> Result<Vec<NodeId>, StoreError>;
}

/// Unicode case folding shared by both backends' search. SQLite's own
/// `LIKE` only folds ASCII.
pub(crate) fn matches_query(content: &str, folded_query: &str) -> bool {
    content.to_lowercase().contains(folded_query)
}

pub(crate) fn build_snapshot(session: Session, nodes: Vec<MessageNode>) -> Result<SessionSnapshot, StoreError> {
    SessionSnapshot::new(session, nodes).map_err(|e| StoreError::Corrupt(e.to_string()))
}

/// Validate a commit against current state and return the ids it prunes.
/// Nothing is written here; callers apply the result under the same lock.
pub(crate) fn plan_commit(
    lookup: &impl NodeLookup,
    session: &Session,
    expected_version: i64,
    commit: &Commit,
) -> Result<Vec<NodeId>, StoreError> {
    if session.version != expected_version {
        return Err(StoreError::Conflict {
            session_id: session.id.clone(),
            expected: expected_version,
            actual: session.version,
        });
    }

    let mut batch: HashMap<&NodeId, NodeStatus> = HashMap::new();
    for node in &commit.inserts {
        if batch.contains_key(&node.id) || lookup.status_in(&session.id, &node.id)?.is_some() {
            return Err(StoreError::InvalidOperation(format!("node {} already exists", node.id)));
        }
        let parent_status = match batch.get(&node.parent_id) {
            Some(status) => *status,
            None => lookup
                .status_in(&session.id, &node.parent_id)?
                .ok_or_else(|| StoreError::NotFound(format!("parent {}", node.parent_id)))?,
        };
        if !parent_status.accepts_children() {
            return Err(StoreError::InvalidOperation(format!(
                "parent {} is still pending",
                node.parent_id
            )));
        }
        batch.insert(&node.id, node.status);
    }

    let pruned = match &commit.prune {
        None => Vec::new(),
        Some(id) if *id == session.root_id => return Err(StoreError::RootDeletion(id.clone())),
        Some(id) => {
            if lookup.status_in(&session.id, id)?.is_none() {
                return Err(StoreError::NotFound(format!("node {id}")));
            }
            lookup.subtree(id)?
        }
    };

    if !pruned.is_empty() {
        let doomed: HashSet<&NodeId> = pruned.iter().collect();
        if doomed.contains(&commit.head) {
            return Err(StoreError::InvalidOperation(format!(
                "head {} lies inside pruned subtree",
                commit.head
            )));
        }
        if let Some(node) = commit.inserts.iter().find(|n| doomed.contains(&n.parent_id)) {
            return Err(StoreError::InvalidOperation(format!(
                "insert {} targets pruned parent {}",
                node.id, node.parent_id
            )));
        }
    }

    if !batch.contains_key(&commit.head) && lookup.status_in(&session.id, &commit.head)?.is_none() {
        return Err(StoreError::NotFound(format!("head target {}", commit.head)));
    }

    Ok(pruned)
}

/// Shared checks for a single-node status transition.
pub(crate) fn check_transition(node: &MessageNode, status: NodeStatus) -> Result<(), StoreError> {
    if node.status == NodeStatus::Committed {
        return Err(StoreError::InvalidOperation(format!(
            "node {} is committed and immutable",
            node.id
        )));
    }
    if status == NodeStatus::Pending {
        return Err(StoreError::InvalidOperation(format!(
            "node {} can only move to committed or failed",
            node.id
        )));
    }
    Ok(())
}
