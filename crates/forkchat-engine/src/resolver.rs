//! Read-only navigation over a [`SessionSnapshot`].

use serde::Serialize;

use forkchat_core::generator::ChatTurn;
use forkchat_core::{HistoryError, MessageNode, NodeId, NodeStatus, Role, SessionSnapshot};

/// Snapshot indices from the root down to `idx`.
///
/// Fails with `Storage` if the parent chain loops; a well-formed tree
/// reaches the root in at most `len()` steps.
pub(crate) fn lineage_indices(snapshot: &SessionSnapshot, idx: usize) -> Result<Vec<usize>, HistoryError> {
    let mut seen = vec![false; snapshot.len()];
    let mut path = Vec::new();
    let mut cursor = Some(idx);
    while let Some(i) = cursor {
        if std::mem::replace(&mut seen[i], true) {
            return Err(HistoryError::Storage(format!(
                "parent cycle at node {} in session {}",
                snapshot.at(i).id,
                snapshot.session().id
            )));
        }
        path.push(i);
        cursor = snapshot.parent_index(i);
    }
    path.reverse();
    Ok(path)
}

pub(crate) fn active_path_indices(snapshot: &SessionSnapshot) -> Result<Vec<usize>, HistoryError> {
    let head = snapshot.head()?;
    let idx = snapshot
        .index_of(&head.id)
        .ok_or_else(|| HistoryError::node_not_found(&head.id))?;
    lineage_indices(snapshot, idx)
}

/// Root to head inclusive. A stale head is `NotFound`.
pub fn resolve_active_path(snapshot: &SessionSnapshot) -> Result<Vec<MessageNode>, HistoryError> {
    Ok(active_path_indices(snapshot)?
        .into_iter()
        .map(|i| snapshot.at(i).clone())
        .collect())
}

/// Root to `node_id` inclusive, for any node in the session.
pub fn ancestors(snapshot: &SessionSnapshot, node_id: &NodeId) -> Result<Vec<MessageNode>, HistoryError> {
    let idx = snapshot
        .index_of(node_id)
        .ok_or_else(|| HistoryError::node_not_found(node_id))?;
    Ok(lineage_indices(snapshot, idx)?
        .into_iter()
        .map(|i| snapshot.at(i).clone())
        .collect())
}

/// True when `ancestor` lies on the path from the root to `node`. Unknown
/// ids are never ancestors.
pub fn is_ancestor_or_self(snapshot: &SessionSnapshot, ancestor: &NodeId, node: &NodeId) -> bool {
    let (Some(target), Some(start)) = (snapshot.index_of(ancestor), snapshot.index_of(node)) else {
        return false;
    };
    let mut cursor = Some(start);
    let mut steps = 0;
    while let Some(i) = cursor {
        if i == target {
            return true;
        }
        steps += 1;
        if steps > snapshot.len() {
            return false;
        }
        cursor = snapshot.parent_index(i);
    }
    false
}

/// Follow the most recently created child until a leaf is reached.
pub fn latest_leaf(snapshot: &SessionSnapshot, node_id: &NodeId) -> Result<NodeId, HistoryError> {
    let mut idx = snapshot
        .index_of(node_id)
        .ok_or_else(|| HistoryError::node_not_found(node_id))?;
    for _ in 0..snapshot.len() {
        match snapshot.child_indices(idx).last() {
            Some(&child) => idx = child,
            None => return Ok(snapshot.at(idx).id.clone()),
        }
    }
    Err(HistoryError::Storage(format!(
        "no leaf below {node_id} in session {}",
        snapshot.session().id
    )))
}

/// Position of a node among its parent's children, as shown by a
/// "2 / 3" branch switcher.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SiblingInfo {
    pub ids: Vec<NodeId>,
    pub index: usize,
}

impl SiblingInfo {
    pub fn count(&self) -> usize {
        self.ids.len()
    }
}

pub fn siblings(snapshot: &SessionSnapshot, node_id: &NodeId) -> Result<SiblingInfo, HistoryError> {
    let idx = snapshot
        .index_of(node_id)
        .ok_or_else(|| HistoryError::node_not_found(node_id))?;
    let Some(parent) = snapshot.parent_index(idx) else {
        return Ok(SiblingInfo {
            ids: vec![node_id.clone()],
            index: 0,
        });
    };
    let ids: Vec<NodeId> = snapshot
        .child_indices(parent)
        .iter()
        .map(|&c| snapshot.at(c).id.clone())
        .collect();
    let index = ids
        .iter()
        .position(|id| id == node_id)
        .ok_or_else(|| HistoryError::Storage(format!("{node_id} missing from its parent's children")))?;
    Ok(SiblingInfo { ids, index })
}

/// The turns a reply generator sees: committed nodes only, minus an empty
/// system prompt.
pub fn conversation_context(path: &[MessageNode]) -> Vec<ChatTurn> {
    path.iter()
        .filter(|n| n.status == NodeStatus::Committed)
        .filter(|n| !(n.role == Role::System && n.content.is_empty()))
        .map(|n| ChatTurn::new(n.role, n.content.clone()))
        .collect()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::{Duration, TimeZone, Utc};

    use forkchat_core::{MessageNode, NodeId, NodeStatus, Role, Session, SessionId, SessionSnapshot};

    /// Builds snapshots by hand: `add` returns the new node's id and every
    /// node gets a strictly later timestamp than the one before.
    pub(crate) struct TreeFixture {
        pub session: Session,
        pub nodes: Vec<MessageNode>,
    }

    impl TreeFixture {
        pub(crate) fn new(system_prompt: &str) -> Self {
            let session_id = SessionId::new();
            let root_id = NodeId::new();
            let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
            let root = MessageNode {
                id: root_id.clone(),
                session_id: session_id.clone(),
                role: Role::System,
                content: system_prompt.to_string(),
                status: NodeStatus::Committed,
                parent_id: None,
                sequence: 0,
                created_at: t0,
            };
            Self {
                session: Session {
                    id: session_id,
                    root_id: root_id.clone(),
                    head_id: root_id,
                    version: 0,
                    created_at: t0,
                    updated_at: t0,
                },
                nodes: vec![root],
            }
        }

        pub(crate) fn root(&self) -> NodeId {
            self.session.root_id.clone()
        }

        pub(crate) fn add(&mut self, parent: &NodeId, role: Role, content: &str, status: NodeStatus) -> NodeId {
            let sequence = self.nodes.len() as i64;
            let node = MessageNode {
                id: NodeId::new(),
                session_id: self.session.id.clone(),
                role,
                content: content.to_string(),
                status,
                parent_id: Some(parent.clone()),
                sequence,
                created_at: self.session.created_at + Duration::seconds(sequence),
            };
            let id = node.id.clone();
            self.nodes.push(node);
            id
        }

        pub(crate) fn user(&mut self, parent: &NodeId, content: &str) -> NodeId {
            self.add(parent, Role::User, content, NodeStatus::Committed)
        }

        pub(crate) fn assistant(&mut self, parent: &NodeId, content: &str) -> NodeId {
            self.add(parent, Role::Assistant, content, NodeStatus::Committed)
        }

        pub(crate) fn snapshot(&self, head: &NodeId) -> SessionSnapshot {
            let mut session = self.session.clone();
            session.head_id = head.clone();
            SessionSnapshot::new(session, self.nodes.clone()).unwrap()
        }
    }
}
