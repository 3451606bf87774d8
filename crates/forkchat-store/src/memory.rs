use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, instrument};

use forkchat_core::ids::{NodeId, SessionId};
use forkchat_core::messages::{MessageNode, NodeStatus, Role, Session};
use forkchat_core::SessionSnapshot;

use crate::error::StoreError;
use crate::store::{self, Commit, CommitOutcome, MessageStore, NodeLookup};

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<SessionId, Session>,
    nodes: HashMap<NodeId, MessageNode>,
    /// Child ids per parent, in insertion order.
    children: HashMap<NodeId, Vec<NodeId>>,
    next_sequence: HashMap<SessionId, i64>,
}

impl MemoryState {
    fn session(&self, id: &SessionId) -> Result<&Session, StoreError> {
        self.sessions
            .get(id)
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }

    fn node(&self, id: &NodeId) -> Result<&MessageNode, StoreError> {
        self.nodes
            .get(id)
            .ok_or_else(|| StoreError::NotFound(format!("node {id}")))
    }

    fn take_sequence(&mut self, session_id: &SessionId) -> i64 {
        let next = self.next_sequence.entry(session_id.clone()).or_insert(0);
        let seq = *next;
        *next += 1;
        seq
    }

    fn insert(&mut self, node: MessageNode) {
        if let Some(parent) = &node.parent_id {
            self.children.entry(parent.clone()).or_default().push(node.id.clone());
        }
        self.nodes.insert(node.id.clone(), node);
    }

    fn remove_subtree(&mut self, ids: &[NodeId]) {
        let Some(first) = ids.first() else { return };
        if let Some(parent) = self.nodes.get(first).and_then(|n| n.parent_id.clone()) {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|c| c != first);
            }
        }
        for id in ids {
            self.nodes.remove(id);
            self.children.remove(id);
        }
    }

    fn ordered_children(&self, parent_id: &NodeId) -> Vec<NodeId> {
        let mut kids: Vec<&MessageNode> = self
            .children
            .get(parent_id)
            .map(|ids| ids.iter().filter_map(|id| self.nodes.get(id)).collect())
            .unwrap_or_default();
        kids.sort_by_key(|n| (n.created_at, n.sequence));
        kids.into_iter().map(|n| n.id.clone()).collect()
    }
}

impl NodeLookup for MemoryState {
    fn status_in(&self, session_id: &SessionId, id: &NodeId) -> Result<Option<NodeStatus>, StoreError> {
        Ok(self
            .nodes
            .get(id)
            .filter(|n| n.session_id == *session_id)
            .map(|n| n.status))
    }

    fn subtree(&self, id: &NodeId) -> Result<Vec<NodeId>, StoreError> {
        let mut out = vec![id.clone()];
        let mut cursor = 0;
        while cursor < out.len() {
            if let Some(kids) = self.children.get(&out[cursor]) {
                out.extend(kids.iter().cloned());
            }
            cursor += 1;
        }
        Ok(out)
    }
}

/// In-process `MessageStore`. A single `RwLock` guards all state, so each
/// commit is validated and applied as one exclusive step while snapshots
/// read under the shared lock.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for MemoryStore {
    #[instrument(skip(self, system_prompt))]
    fn create_session(&self, system_prompt: &str) -> Result<(Session, MessageNode), StoreError> {
        let mut state = self.state.write();
        let now = Utc::now();
        let session_id = SessionId::new();
        let root_id = NodeId::new();
        let sequence = state.take_sequence(&session_id);

        let root = MessageNode {
            id: root_id.clone(),
            session_id: session_id.clone(),
            role: Role::System,
            content: system_prompt.to_string(),
            status: NodeStatus::Committed,
            parent_id: None,
            sequence,
            created_at: now,
        };
        let session = Session {
            id: session_id.clone(),
            root_id: root_id.clone(),
            head_id: root_id,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        state.sessions.insert(session_id, session.clone());
        state.insert(root.clone());
        Ok((session, root))
    }

    fn get_session(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.state.read().session(id).cloned()
    }

    fn list_sessions(&self, limit: u32, offset: u32) -> Result<Vec<Session>, StoreError> {
        let state = self.state.read();
        let mut sessions: Vec<Session> = state.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| (b.created_at, &b.id).cmp(&(a.created_at, &a.id)));
        Ok(sessions
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    #[instrument(skip(self, content), fields(session_id = %session_id, role = %role, status = %status))]
    fn create_node(
        &self,
        session_id: &SessionId,
        role: Role,
        content: &str,
        parent_id: Option<&NodeId>,
        status: NodeStatus,
    ) -> Result<MessageNode, StoreError> {
        let mut state = self.state.write();
        state.session(session_id)?;
        let parent_id = parent_id.ok_or_else(|| {
            StoreError::InvalidOperation(format!("session {session_id} already has a root"))
        })?;
        match state.status_in(session_id, parent_id)? {
            None => return Err(StoreError::NotFound(format!("parent {parent_id}"))),
            Some(s) if !s.accepts_children() => {
                return Err(StoreError::InvalidOperation(format!(
                    "parent {parent_id} is still pending"
                )))
            }
            Some(_) => {}
        }

        let node = MessageNode {
            id: NodeId::new(),
            session_id: session_id.clone(),
            role,
            content: content.to_string(),
            status,
            parent_id: Some(parent_id.clone()),
            sequence: state.take_sequence(session_id),
            created_at: Utc::now(),
        };
        state.insert(node.clone());
        Ok(node)
    }

    fn get_node(&self, id: &NodeId) -> Result<MessageNode, StoreError> {
        self.state.read().node(id).cloned()
    }

    fn list_children(&self, parent_id: &NodeId) -> Result<Vec<NodeId>, StoreError> {
        let state = self.state.read();
        state.node(parent_id)?;
        Ok(state.ordered_children(parent_id))
    }

    #[instrument(skip(self), fields(node_id = %id))]
    fn delete_subtree(&self, id: &NodeId) -> Result<Vec<NodeId>, StoreError> {
        let mut state = self.state.write();
        let session = state.session(&state.node(id)?.session_id)?.clone();
        if session.root_id == *id {
            return Err(StoreError::RootDeletion(id.clone()));
        }
        let removed = state.subtree(id)?;
        if removed.contains(&session.head_id) {
            return Err(StoreError::InvalidOperation(format!(
                "head {} lies inside subtree {id}",
                session.head_id
            )));
        }
        state.remove_subtree(&removed);
        debug!(removed = removed.len(), "subtree deleted");
        Ok(removed)
    }

    #[instrument(skip(self, content), fields(node_id = %id, status = %status))]
    fn update_node_content(
        &self,
        id: &NodeId,
        content: &str,
        status: NodeStatus,
    ) -> Result<MessageNode, StoreError> {
        let mut state = self.state.write();
        store::check_transition(state.node(id)?, status)?;
        let node = state
            .nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("node {id}")))?;
        node.content = content.to_string();
        node.status = status;
        Ok(node.clone())
    }

    fn snapshot(&self, session_id: &SessionId) -> Result<SessionSnapshot, StoreError> {
        let (session, nodes) = {
            let state = self.state.read();
            let session = state.session(session_id)?.clone();
            let nodes: Vec<MessageNode> = state
                .nodes
                .values()
                .filter(|n| n.session_id == *session_id)
                .cloned()
                .collect();
            (session, nodes)
        };
        store::build_snapshot(session, nodes)
    }

    #[instrument(skip(self, commit), fields(session_id = %session_id, head = %commit.head))]
    fn commit(
        &self,
        session_id: &SessionId,
        expected_version: i64,
        commit: &Commit,
    ) -> Result<CommitOutcome, StoreError> {
        let mut state = self.state.write();
        let session = state.session(session_id)?.clone();
        let pruned = store::plan_commit(&*state, &session, expected_version, commit)?;

        let now = Utc::now();
        let mut inserted = Vec::with_capacity(commit.inserts.len());
        for new in &commit.inserts {
            let node = MessageNode {
                id: new.id.clone(),
                session_id: session_id.clone(),
                role: new.role,
                content: new.content.clone(),
                status: new.status,
                parent_id: Some(new.parent_id.clone()),
                sequence: state.take_sequence(session_id),
                created_at: now,
            };
            state.insert(node.clone());
            inserted.push(node);
        }
        state.remove_subtree(&pruned);

        let entry = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
        entry.head_id = commit.head.clone();
        entry.version += 1;
        entry.updated_at = now;

        Ok(CommitOutcome {
            session: entry.clone(),
            inserted,
            pruned,
        })
    }

    fn search_nodes(
        &self,
        session_id: &SessionId,
        query: &str,
        limit: u32,
    ) -> Result<Vec<MessageNode>, StoreError> {
        let state = self.state.read();
        state.session(session_id)?;
        let needle = query.to_lowercase();
        let mut hits: Vec<MessageNode> = state
            .nodes
            .values()
            .filter(|n| n.session_id == *session_id && store::matches_query(&n.content, &needle))
            .cloned()
            .collect();
        hits.sort_by_key(|n| n.sequence);
        hits.truncate(limit as usize);
        Ok(hits)
    }
}
