use std::collections::HashMap;

use crate::errors::HistoryError;
use crate::ids::NodeId;
use crate::messages::{MessageNode, Session};

/// Immutable, index-addressed view of one session's history.
///
/// Nodes live in a flat `Vec` ordered by insertion sequence; parent and
/// child links are stored as indices into that `Vec`, so walking the tree
/// never follows owned pointers.
#[derive(Clone, Debug)]
pub struct SessionSnapshot {
    session: Session,
    nodes: Vec<MessageNode>,
    index: HashMap<NodeId, usize>,
    parents: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
    root: usize,
}

impl SessionSnapshot {
    /// Build the arena, verifying that the rows form a single rooted tree
    /// inside this session. The head is not checked here so that a stale
    /// head surfaces as `NotFound` from path resolution.
    pub fn new(session: Session, mut nodes: Vec<MessageNode>) -> Result<Self, HistoryError> {
        nodes.sort_by_key(|n| n.sequence);

        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if node.session_id != session.id {
                return Err(HistoryError::Storage(format!(
                    "node {} belongs to session {}, not {}",
                    node.id, node.session_id, session.id
                )));
            }
            index.insert(node.id.clone(), i);
        }

        let root = *index
            .get(&session.root_id)
            .ok_or_else(|| HistoryError::Storage(format!("root {} missing", session.root_id)))?;

        let mut parents = Vec::with_capacity(nodes.len());
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            match (&node.parent_id, i == root) {
                (None, true) => parents.push(None),
                (None, false) => {
                    return Err(HistoryError::Storage(format!(
                        "second root {} in session {}",
                        node.id, session.id
                    )))
                }
                (Some(_), true) => {
                    return Err(HistoryError::Storage(format!("root {} has a parent", node.id)))
                }
                (Some(parent_id), false) => {
                    let p = *index.get(parent_id).ok_or_else(|| {
                        HistoryError::Storage(format!(
                            "node {} references missing parent {parent_id}",
                            node.id
                        ))
                    })?;
                    parents.push(Some(p));
                    children[p].push(i);
                }
            }
        }

        for list in &mut children {
            list.sort_by(|&a, &b| {
                (nodes[a].created_at, nodes[a].sequence).cmp(&(nodes[b].created_at, nodes[b].sequence))
            });
        }

        Ok(Self {
            session,
            nodes,
            index,
            parents,
            children,
            root,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false for a snapshot built from a valid session.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[MessageNode] {
        &self.nodes
    }

    pub fn root(&self) -> &MessageNode {
        &self.nodes[self.root]
    }

    pub fn root_index(&self) -> usize {
        self.root
    }

    pub fn index_of(&self, id: &NodeId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn node(&self, id: &NodeId) -> Option<&MessageNode> {
        self.index_of(id).map(|i| &self.nodes[i])
    }

    /// Look up a node, failing with `NotFound` when it is not part of this
    /// session.
    pub fn require(&self, id: &NodeId) -> Result<&MessageNode, HistoryError> {
        self.node(id).ok_or_else(|| HistoryError::node_not_found(id))
    }

    pub fn head(&self) -> Result<&MessageNode, HistoryError> {
        self.node(&self.session.head_id).ok_or_else(|| {
            HistoryError::NotFound(format!(
                "head {} of session {}",
                self.session.head_id, self.session.id
            ))
        })
    }

    pub fn at(&self, idx: usize) -> &MessageNode {
        &self.nodes[idx]
    }

    pub fn parent_index(&self, idx: usize) -> Option<usize> {
        self.parents[idx]
    }

    /// Children of the node at `idx`, in display order.
    pub fn child_indices(&self, idx: usize) -> &[usize] {
        &self.children[idx]
    }

    pub fn children(&self, id: &NodeId) -> Vec<&MessageNode> {
        match self.index_of(id) {
            Some(i) => self.children[i].iter().map(|&c| &self.nodes[c]).collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SessionId;
    use crate::messages::{NodeStatus, Role};
    use chrono::{Duration, Utc};

    fn node(session: &SessionId, id: &str, parent: Option<&str>, seq: i64) -> MessageNode {
        MessageNode {
            id: NodeId::from_raw(id),
            session_id: session.clone(),
            role: if parent.is_none() { Role::System } else { Role::User },
            content: id.to_string(),
            status: NodeStatus::Committed,
            parent_id: parent.map(NodeId::from_raw),
            sequence: seq,
            created_at: Utc::now(),
        }
    }

    fn session(id: &SessionId, head: &str) -> Session {
        Session {
            id: id.clone(),
            root_id: NodeId::from_raw("root"),
            head_id: NodeId::from_raw(head),
            version: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn builds_parent_and_child_indices() {
        let sid = SessionId::new();
        let snap = SessionSnapshot::new(
            session(&sid, "b"),
            vec![
                node(&sid, "b", Some("root"), 2),
                node(&sid, "root", None, 0),
                node(&sid, "a", Some("root"), 1),
            ],
        )
        .unwrap();

        assert_eq!(snap.len(), 3);
        assert_eq!(snap.root().id.as_str(), "root");
        let kids: Vec<&str> = snap
            .children(&NodeId::from_raw("root"))
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(kids, vec!["a", "b"]);
        let b = snap.index_of(&NodeId::from_raw("b")).unwrap();
        assert_eq!(snap.parent_index(b), Some(snap.root_index()));
        assert_eq!(snap.head().unwrap().id.as_str(), "b");
    }

    #[test]
    fn sibling_order_follows_created_at_then_sequence() {
        let sid = SessionId::new();
        let mut later = node(&sid, "later", Some("root"), 1);
        later.created_at = Utc::now() + Duration::seconds(5);
        let snap = SessionSnapshot::new(
            session(&sid, "root"),
            vec![node(&sid, "root", None, 0), later, node(&sid, "earlier", Some("root"), 2)],
        )
        .unwrap();
        let kids: Vec<&str> = snap
            .children(&NodeId::from_raw("root"))
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(kids, vec!["earlier", "later"]);
    }

    #[test]
    fn rejects_missing_parent() {
        let sid = SessionId::new();
        let err = SessionSnapshot::new(
            session(&sid, "root"),
            vec![node(&sid, "root", None, 0), node(&sid, "orphan", Some("ghost"), 1)],
        )
        .unwrap_err();
        assert!(matches!(err, HistoryError::Storage(_)));
    }

    #[test]
    fn rejects_foreign_node() {
        let sid = SessionId::new();
        let other = SessionId::new();
        let err = SessionSnapshot::new(
            session(&sid, "root"),
            vec![node(&sid, "root", None, 0), node(&other, "x", Some("root"), 1)],
        )
        .unwrap_err();
        assert!(matches!(err, HistoryError::Storage(_)));
    }

    #[test]
    fn stale_head_reported_as_not_found() {
        let sid = SessionId::new();
        let snap = SessionSnapshot::new(session(&sid, "gone"), vec![node(&sid, "root", None, 0)]).unwrap();
        assert!(matches!(snap.head(), Err(HistoryError::NotFound(_))));
        assert!(matches!(
            snap.require(&NodeId::from_raw("gone")),
            Err(HistoryError::NotFound(_))
        ));
    }
}
