use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use forkchat_core::generator::ChatTurn;
use forkchat_core::{
    HistoryError, MessageNode, NewNode, NodeId, NodeStatus, Role, Session, SessionId, SessionSnapshot,
};
use forkchat_store::{Commit, CommitOutcome, MessageStore, StoreError};

use crate::locks::SessionLocks;
use crate::resolver::{self, SiblingInfo};
use crate::tree::{self, BranchNode, DEFAULT_PREVIEW_CHARS};

/// Result of [`HistoryEngine::delete_branch`].
#[derive(Clone, Debug, PartialEq)]
pub struct DeletedBranch {
    pub removed: Vec<NodeId>,
    pub head_id: NodeId,
}

/// Entry point for every history operation.
///
/// Each head-moving mutation runs under the session's write lock: read a
/// snapshot, validate, then hand one [`Commit`] to the store together with
/// the snapshot's version. The store repeats validation and rejects the
/// commit if another writer got there first.
pub struct HistoryEngine {
    store: Arc<dyn MessageStore>,
    locks: SessionLocks,
    preview_chars: usize,
}

impl HistoryEngine {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            locks: SessionLocks::default(),
            preview_chars: DEFAULT_PREVIEW_CHARS,
        }
    }

    pub fn with_preview_chars(mut self, preview_chars: usize) -> Self {
        self.preview_chars = preview_chars;
        self
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    // ── Sessions ────────────────────────────────────────────────────

    #[instrument(skip(self, system_prompt))]
    pub fn create_session(&self, system_prompt: &str) -> Result<Session, HistoryError> {
        let (session, _root) = self.store.create_session(system_prompt)?;
        info!(session_id = %session.id, "session created");
        Ok(session)
    }

    pub fn get_session(&self, session_id: &SessionId) -> Result<Session, HistoryError> {
        Ok(self.store.get_session(session_id)?)
    }

    pub fn list_sessions(&self, limit: u32, offset: u32) -> Result<Vec<Session>, HistoryError> {
        Ok(self.store.list_sessions(limit, offset)?)
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub fn snapshot(&self, session_id: &SessionId) -> Result<SessionSnapshot, HistoryError> {
        Ok(self.store.snapshot(session_id)?)
    }

    pub fn get_node(&self, session_id: &SessionId, node_id: &NodeId) -> Result<MessageNode, HistoryError> {
        let node = self.store.get_node(node_id)?;
        if node.session_id != *session_id {
            return Err(HistoryError::node_not_found(node_id));
        }
        Ok(node)
    }

    pub fn resolve_active_path(&self, session_id: &SessionId) -> Result<Vec<MessageNode>, HistoryError> {
        resolver::resolve_active_path(&self.snapshot(session_id)?)
    }

    pub fn build_tree(&self, session_id: &SessionId) -> Result<BranchNode, HistoryError> {
        tree::build_tree(&self.snapshot(session_id)?, self.preview_chars)
    }

    pub fn has_branching(&self, session_id: &SessionId) -> Result<bool, HistoryError> {
        Ok(tree::has_branching(&self.snapshot(session_id)?))
    }

    pub fn siblings(&self, session_id: &SessionId, node_id: &NodeId) -> Result<SiblingInfo, HistoryError> {
        resolver::siblings(&self.snapshot(session_id)?, node_id)
    }

    pub fn search(&self, session_id: &SessionId, query: &str, limit: u32) -> Result<Vec<MessageNode>, HistoryError> {
        Ok(self.store.search_nodes(session_id, query, limit)?)
    }

    /// Turns handed to the generator for the pending node `node_id`: the
    /// committed path ending at its parent.
    pub fn reply_context(&self, session_id: &SessionId, node_id: &NodeId) -> Result<Vec<ChatTurn>, HistoryError> {
        let snapshot = self.snapshot(session_id)?;
        let node = snapshot.require(node_id)?;
        if node.status != NodeStatus::Pending {
            return Err(HistoryError::InvalidOperation(format!(
                "node {node_id} is {}, not pending",
                node.status
            )));
        }
        let parent = node
            .parent_id
            .as_ref()
            .ok_or_else(|| HistoryError::InvalidOperation(format!("node {node_id} has no parent")))?;
        Ok(resolver::conversation_context(&resolver::ancestors(&snapshot, parent)?))
    }

    // ── Head-moving mutations ───────────────────────────────────────

    /// Append a committed user turn under the head plus a pending reply
    /// under it. Returns the pending reply's id.
    #[instrument(skip(self, content, expected_head), fields(session_id = %session_id))]
    pub fn send_message(
        &self,
        session_id: &SessionId,
        content: &str,
        expected_head: Option<&NodeId>,
    ) -> Result<NodeId, HistoryError> {
        let lock = self.locks.get(session_id);
        let _guard = lock.lock();
        let snapshot = self.locked_snapshot(session_id, &lock)?;
        check_expected_head(&snapshot, expected_head)?;

        let head = snapshot.head()?;
        if head.status == NodeStatus::Pending {
            return Err(HistoryError::InvalidOperation(format!(
                "head {} is still pending",
                head.id
            )));
        }
        ensure_lineage_idle(&snapshot, &head.id)?;

        let user = NewNode::committed(&head.id, Role::User, content);
        let reply = NewNode::pending_reply(&user.id);
        let reply_id = reply.id.clone();
        self.apply(
            &snapshot,
            Commit {
                inserts: vec![user, reply],
                prune: None,
                head: reply_id.clone(),
            },
        )?;
        debug!(node_id = %reply_id, "message sent");
        Ok(reply_id)
    }

    /// Fork a user turn: the new text becomes a committed sibling of
    /// `message_id` and the head. The original is left untouched.
    #[instrument(skip(self, new_content, expected_head), fields(session_id = %session_id, node_id = %message_id))]
    pub fn edit_message(
        &self,
        session_id: &SessionId,
        message_id: &NodeId,
        new_content: &str,
        expected_head: Option<&NodeId>,
    ) -> Result<NodeId, HistoryError> {
        let lock = self.locks.get(session_id);
        let _guard = lock.lock();
        let snapshot = self.locked_snapshot(session_id, &lock)?;
        check_expected_head(&snapshot, expected_head)?;

        let target = snapshot.require(message_id)?;
        require_role(target, Role::User)?;
        let parent = parent_of(target)?;

        let edited = NewNode::committed(parent, Role::User, new_content);
        let edited_id = edited.id.clone();
        self.apply(
            &snapshot,
            Commit {
                inserts: vec![edited],
                prune: None,
                head: edited_id.clone(),
            },
        )?;
        debug!(new_id = %edited_id, "message edited");
        Ok(edited_id)
    }

    /// Start a fresh pending reply beside `message_id`.
    #[instrument(skip(self, expected_head), fields(session_id = %session_id, node_id = %message_id))]
    pub fn regenerate_reply(
        &self,
        session_id: &SessionId,
        message_id: &NodeId,
        expected_head: Option<&NodeId>,
    ) -> Result<NodeId, HistoryError> {
        let lock = self.locks.get(session_id);
        let _guard = lock.lock();
        let snapshot = self.locked_snapshot(session_id, &lock)?;
        check_expected_head(&snapshot, expected_head)?;

        let target = snapshot.require(message_id)?;
        require_role(target, Role::Assistant)?;
        if target.status == NodeStatus::Pending {
            return Err(HistoryError::InvalidOperation(format!(
                "reply {message_id} is still being generated"
            )));
        }
        let parent = parent_of(target)?;
        ensure_lineage_idle(&snapshot, parent)?;

        let reply = NewNode::pending_reply(parent);
        let reply_id = reply.id.clone();
        self.apply(
            &snapshot,
            Commit {
                inserts: vec![reply],
                prune: None,
                head: reply_id.clone(),
            },
        )?;
        debug!(new_id = %reply_id, "reply regenerated");
        Ok(reply_id)
    }

    /// Pending assistant reply under the head, which must be a user turn.
    #[instrument(skip(self, expected_head), fields(session_id = %session_id))]
    pub fn create_pending_reply(
        &self,
        session_id: &SessionId,
        expected_head: Option<&NodeId>,
    ) -> Result<NodeId, HistoryError> {
        let lock = self.locks.get(session_id);
        let _guard = lock.lock();
        let snapshot = self.locked_snapshot(session_id, &lock)?;
        check_expected_head(&snapshot, expected_head)?;

        let head = snapshot.head()?;
        require_role(head, Role::User)?;
        if head.status != NodeStatus::Committed {
            return Err(HistoryError::InvalidOperation(format!(
                "head {} is {}, not committed",
                head.id, head.status
            )));
        }
        ensure_lineage_idle(&snapshot, &head.id)?;

        let reply = NewNode::pending_reply(&head.id);
        let reply_id = reply.id.clone();
        self.apply(
            &snapshot,
            Commit {
                inserts: vec![reply],
                prune: None,
                head: reply_id.clone(),
            },
        )?;
        debug!(node_id = %reply_id, "pending reply created");
        Ok(reply_id)
    }

    /// Point the head at any node of the session. Nothing is deleted.
    #[instrument(skip(self, expected_head), fields(session_id = %session_id, node_id = %node_id))]
    pub fn switch_branch(
        &self,
        session_id: &SessionId,
        node_id: &NodeId,
        expected_head: Option<&NodeId>,
    ) -> Result<Session, HistoryError> {
        let lock = self.locks.get(session_id);
        let _guard = lock.lock();
        let snapshot = self.locked_snapshot(session_id, &lock)?;
        check_expected_head(&snapshot, expected_head)?;
        snapshot.require(node_id)?;
        self.set_head(&snapshot, node_id)
    }

    /// Like [`switch_branch`](Self::switch_branch), landing on the most
    /// recent leaf below `node_id`.
    #[instrument(skip(self, expected_head), fields(session_id = %session_id, node_id = %node_id))]
    pub fn switch_branch_to_leaf(
        &self,
        session_id: &SessionId,
        node_id: &NodeId,
        expected_head: Option<&NodeId>,
    ) -> Result<Session, HistoryError> {
        let lock = self.locks.get(session_id);
        let _guard = lock.lock();
        let snapshot = self.locked_snapshot(session_id, &lock)?;
        check_expected_head(&snapshot, expected_head)?;
        let leaf = resolver::latest_leaf(&snapshot, node_id)?;
        self.set_head(&snapshot, &leaf)
    }

    /// Remove `node_id` and its descendants. When the head sits inside the
    /// doomed subtree it moves to `node_id`'s parent in the same commit.
    #[instrument(skip(self, expected_head), fields(session_id = %session_id, node_id = %node_id))]
    pub fn delete_branch(
        &self,
        session_id: &SessionId,
        node_id: &NodeId,
        expected_head: Option<&NodeId>,
    ) -> Result<DeletedBranch, HistoryError> {
        let lock = self.locks.get(session_id);
        let _guard = lock.lock();
        let snapshot = self.locked_snapshot(session_id, &lock)?;
        check_expected_head(&snapshot, expected_head)?;

        let target = snapshot.require(node_id)?;
        if target.is_root() {
            return Err(HistoryError::RootDeletion(node_id.clone()));
        }
        let head_id = &snapshot.session().head_id;
        let new_head = if resolver::is_ancestor_or_self(&snapshot, node_id, head_id) {
            parent_of(target)?.clone()
        } else {
            head_id.clone()
        };

        let outcome = self.apply(
            &snapshot,
            Commit {
                inserts: Vec::new(),
                prune: Some(node_id.clone()),
                head: new_head,
            },
        )?;
        info!(removed = outcome.pruned.len(), head = %outcome.session.head_id, "branch deleted");
        Ok(DeletedBranch {
            removed: outcome.pruned,
            head_id: outcome.session.head_id,
        })
    }

    // ── Reply resolution ────────────────────────────────────────────

    #[instrument(skip(self, content), fields(session_id = %session_id, node_id = %node_id))]
    pub fn complete_reply(
        &self,
        session_id: &SessionId,
        node_id: &NodeId,
        content: &str,
    ) -> Result<MessageNode, HistoryError> {
        self.resolve_reply(session_id, node_id, content, NodeStatus::Committed)
    }

    #[instrument(skip(self, error_text), fields(session_id = %session_id, node_id = %node_id))]
    pub fn fail_reply(
        &self,
        session_id: &SessionId,
        node_id: &NodeId,
        error_text: &str,
    ) -> Result<MessageNode, HistoryError> {
        self.resolve_reply(session_id, node_id, error_text, NodeStatus::Failed)
    }

    fn resolve_reply(
        &self,
        session_id: &SessionId,
        node_id: &NodeId,
        content: &str,
        status: NodeStatus,
    ) -> Result<MessageNode, HistoryError> {
        // Sessions are never removed, so checking first keeps unknown ids
        // out of the lock table.
        self.store.get_session(session_id)?;
        let lock = self.locks.get(session_id);
        let _guard = lock.lock();
        let node = self.get_node(session_id, node_id)?;
        require_role(&node, Role::Assistant)?;
        let updated = self.store.update_node_content(node_id, content, status)?;
        debug!(status = %updated.status, len = updated.content.len(), "reply resolved");
        Ok(updated)
    }

    // ── Internals ───────────────────────────────────────────────────

    fn locked_snapshot(
        &self,
        session_id: &SessionId,
        lock: &Arc<parking_lot::Mutex<()>>,
    ) -> Result<SessionSnapshot, HistoryError> {
        match self.store.snapshot(session_id) {
            Ok(snapshot) => Ok(snapshot),
            Err(err @ StoreError::NotFound(_)) => {
                self.locks.discard(session_id, lock);
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn set_head(&self, snapshot: &SessionSnapshot, target: &NodeId) -> Result<Session, HistoryError> {
        if snapshot.session().head_id == *target {
            return Ok(snapshot.session().clone());
        }
        let outcome = self.apply(snapshot, Commit::move_head(target))?;
        debug!(head = %target, "head moved");
        Ok(outcome.session)
    }

    fn apply(&self, snapshot: &SessionSnapshot, commit: Commit) -> Result<CommitOutcome, HistoryError> {
        let session = snapshot.session();
        match self.store.commit(&session.id, session.version, &commit) {
            Ok(outcome) => Ok(outcome),
            Err(err @ StoreError::Conflict { .. }) => {
                warn!(session_id = %session.id, error = %err, "commit rejected, session changed underneath");
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn check_expected_head(snapshot: &SessionSnapshot, expected_head: Option<&NodeId>) -> Result<(), HistoryError> {
    let session = snapshot.session();
    match expected_head {
        Some(expected) if *expected != session.head_id => {
            warn!(session_id = %session.id, expected = %expected, actual = %session.head_id, "stale head");
            Err(HistoryError::ConcurrentModification {
                session_id: session.id.clone(),
                detail: format!("expected head {expected}, found {}", session.head_id),
            })
        }
        _ => Ok(()),
    }
}

/// A parent whose most recent child is still pending cannot be extended.
fn ensure_lineage_idle(snapshot: &SessionSnapshot, parent: &NodeId) -> Result<(), HistoryError> {
    let Some(idx) = snapshot.index_of(parent) else {
        return Err(HistoryError::node_not_found(parent));
    };
    match snapshot.child_indices(idx).last().map(|&child| snapshot.at(child)) {
        Some(latest) if latest.status == NodeStatus::Pending => Err(HistoryError::InvalidOperation(format!(
            "reply {} under {parent} is still pending",
            latest.id
        ))),
        _ => Ok(()),
    }
}

fn require_role(node: &MessageNode, expected: Role) -> Result<(), HistoryError> {
    if node.role != expected {
        return Err(HistoryError::InvalidRole {
            node_id: node.id.clone(),
            expected,
            found: node.role,
        });
    }
    Ok(())
}

fn parent_of(node: &MessageNode) -> Result<&NodeId, HistoryError> {
    node.parent_id
        .as_ref()
        .ok_or_else(|| HistoryError::InvalidOperation(format!("node {} has no parent", node.id)))
}
