use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, instrument};

use forkchat_core::ids::{NodeId, SessionId};
use forkchat_core::messages::{MessageNode, NewNode, NodeStatus, Role, Session};
use forkchat_core::SessionSnapshot;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::store::{self, Commit, CommitOutcome, MessageStore, NodeLookup};

const NODE_COLUMNS: &str = "id, session_id, parent_id, role, content, status, sequence, created_at";
const SESSION_COLUMNS: &str = "id, root_id, head_id, version, created_at, updated_at";

const SUBTREE_CTE: &str = "WITH RECURSIVE subtree(id) AS (
        SELECT ?1
        UNION ALL
        SELECT n.id FROM nodes n JOIN subtree s ON n.parent_id = s.id
    )";

/// `MessageStore` backed by SQLite. Every write runs in one transaction
/// behind the connection mutex, so readers never see half a commit.
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Database::in_memory()?))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

struct ConnLookup<'a> {
    conn: &'a Connection,
}

impl NodeLookup for ConnLookup<'_> {
    fn status_in(&self, session_id: &SessionId, id: &NodeId) -> Result<Option<NodeStatus>, StoreError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM nodes WHERE id = ?1 AND session_id = ?2",
                [id.as_str(), session_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| row_helpers::parse_enum(&s, "nodes", "status"))
            .transpose()
    }

    fn subtree(&self, id: &NodeId) -> Result<Vec<NodeId>, StoreError> {
        let sql = format!("{SUBTREE_CTE} SELECT id FROM subtree");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([id.as_str()])?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            ids.push(NodeId::from_raw(row_helpers::get::<String>(row, 0, "nodes", "id")?));
        }
        Ok(ids)
    }
}

impl MessageStore for SqliteStore {
    #[instrument(skip(self, system_prompt))]
    fn create_session(&self, system_prompt: &str) -> Result<(Session, MessageNode), StoreError> {
        let session_id = SessionId::new();
        let root_id = NodeId::new();
        let now = Utc::now();
        let stamp = row_helpers::format_timestamp(&now);

        let root = self.db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO sessions (id, root_id, head_id, version, next_sequence, created_at, updated_at)
                 VALUES (?1, ?2, ?2, 0, 1, ?3, ?3)",
                rusqlite::params![session_id.as_str(), root_id.as_str(), stamp],
            )?;
            insert_node(
                tx,
                &session_id,
                &root_id,
                None,
                Role::System,
                system_prompt,
                NodeStatus::Committed,
                0,
                &now,
            )
        })?;

        info!(session_id = %session_id, root_id = %root_id, "session created");

        let session = Session {
            id: session_id,
            root_id: root_id.clone(),
            head_id: root_id,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        Ok((session, root))
    }

    #[instrument(skip(self), fields(session_id = %id))]
    fn get_session(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.db.with_conn(|conn| load_session(conn, id))
    }

    #[instrument(skip(self))]
    fn list_sessions(&self, limit: u32, offset: u32) -> Result<Vec<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params![limit, offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
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
        self.db.with_tx(|tx| {
            load_session(tx, session_id)?;
            let parent_id = parent_id.ok_or_else(|| {
                StoreError::InvalidOperation(format!("session {session_id} already has a root"))
            })?;
            let lookup = ConnLookup { conn: tx };
            match lookup.status_in(session_id, parent_id)? {
                None => return Err(StoreError::NotFound(format!("parent {parent_id}"))),
                Some(s) if !s.accepts_children() => {
                    return Err(StoreError::InvalidOperation(format!(
                        "parent {parent_id} is still pending"
                    )))
                }
                Some(_) => {}
            }
            let sequence = take_sequences(tx, session_id, 1)?;
            insert_node(
                tx,
                session_id,
                &NodeId::new(),
                Some(parent_id),
                role,
                content,
                status,
                sequence,
                &Utc::now(),
            )
        })
    }

    #[instrument(skip(self), fields(node_id = %id))]
    fn get_node(&self, id: &NodeId) -> Result<MessageNode, StoreError> {
        self.db.with_conn(|conn| load_node(conn, id))
    }

    #[instrument(skip(self), fields(parent_id = %parent_id))]
    fn list_children(&self, parent_id: &NodeId) -> Result<Vec<NodeId>, StoreError> {
        self.db.with_conn(|conn| {
            load_node(conn, parent_id)?;
            let mut stmt = conn.prepare(
                "SELECT id FROM nodes WHERE parent_id = ?1 ORDER BY created_at ASC, sequence ASC",
            )?;
            let mut rows = stmt.query([parent_id.as_str()])?;
            let mut ids = Vec::new();
            while let Some(row) = rows.next()? {
                ids.push(NodeId::from_raw(row_helpers::get::<String>(row, 0, "nodes", "id")?));
            }
            Ok(ids)
        })
    }

    #[instrument(skip(self), fields(node_id = %id))]
    fn delete_subtree(&self, id: &NodeId) -> Result<Vec<NodeId>, StoreError> {
        self.db.with_tx(|tx| {
            let node = load_node(tx, id)?;
            let session = load_session(tx, &node.session_id)?;
            if session.root_id == *id {
                return Err(StoreError::RootDeletion(id.clone()));
            }
            let removed = ConnLookup { conn: tx }.subtree(id)?;
            if removed.contains(&session.head_id) {
                return Err(StoreError::InvalidOperation(format!(
                    "head {} lies inside subtree {id}",
                    session.head_id
                )));
            }
            delete_ids(tx, id)?;
            debug!(removed = removed.len(), "subtree deleted");
            Ok(removed)
        })
    }

    #[instrument(skip(self, content), fields(node_id = %id, status = %status))]
    fn update_node_content(
        &self,
        id: &NodeId,
        content: &str,
        status: NodeStatus,
    ) -> Result<MessageNode, StoreError> {
        self.db.with_tx(|tx| {
            let mut node = load_node(tx, id)?;
            store::check_transition(&node, status)?;
            tx.execute(
                "UPDATE nodes SET content = ?1, status = ?2 WHERE id = ?3",
                rusqlite::params![content, status.as_str(), id.as_str()],
            )?;
            node.content = content.to_string();
            node.status = status;
            Ok(node)
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    fn snapshot(&self, session_id: &SessionId) -> Result<SessionSnapshot, StoreError> {
        let (session, nodes) = self.db.with_tx(|conn| {
            let session = load_session(conn, session_id)?;
            let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE session_id = ?1 ORDER BY sequence ASC");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut nodes = Vec::new();
            while let Some(row) = rows.next()? {
                nodes.push(row_to_node(row)?);
            }
            Ok((session, nodes))
        })?;
        store::build_snapshot(session, nodes)
    }

    #[instrument(skip(self, commit), fields(session_id = %session_id, expected_version, head = %commit.head))]
    fn commit(
        &self,
        session_id: &SessionId,
        expected_version: i64,
        commit: &Commit,
    ) -> Result<CommitOutcome, StoreError> {
        self.db.with_tx(|tx| {
            let mut session = load_session(tx, session_id)?;
            let pruned = store::plan_commit(&ConnLookup { conn: tx }, &session, expected_version, commit)?;

            let now = Utc::now();
            let mut sequence = take_sequences(tx, session_id, commit.inserts.len() as i64)?;
            let mut inserted = Vec::with_capacity(commit.inserts.len());
            for NewNode {
                id,
                parent_id,
                role,
                content,
                status,
            } in &commit.inserts
            {
                inserted.push(insert_node(
                    tx,
                    session_id,
                    id,
                    Some(parent_id),
                    *role,
                    content,
                    *status,
                    sequence,
                    &now,
                )?);
                sequence += 1;
            }

            if let Some(prune) = &commit.prune {
                delete_ids(tx, prune)?;
            }

            session.head_id = commit.head.clone();
            session.version += 1;
            session.updated_at = now;
            tx.execute(
                "UPDATE sessions SET head_id = ?1, version = ?2, updated_at = ?3 WHERE id = ?4",
                rusqlite::params![
                    session.head_id.as_str(),
                    session.version,
                    row_helpers::format_timestamp(&now),
                    session_id.as_str(),
                ],
            )?;

            Ok(CommitOutcome {
                session,
                inserted,
                pruned,
            })
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    fn search_nodes(
        &self,
        session_id: &SessionId,
        query: &str,
        limit: u32,
    ) -> Result<Vec<MessageNode>, StoreError> {
        self.db.with_conn(|conn| {
            load_session(conn, session_id)?;
            let needle = query.to_lowercase();
            let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE session_id = ?1 ORDER BY sequence ASC");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while results.len() < limit as usize {
                let Some(row) = rows.next()? else { break };
                let content: String = row_helpers::get(row, 4, "nodes", "content")?;
                if store::matches_query(&content, &needle) {
                    results.push(row_to_node(row)?);
                }
            }
            Ok(results)
        })
    }
}

fn load_session(conn: &Connection, id: &SessionId) -> Result<Session, StoreError> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_session(row),
        None => Err(StoreError::NotFound(format!("session {id}"))),
    }
}

fn load_node(conn: &Connection, id: &NodeId) -> Result<MessageNode, StoreError> {
    let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_node(row),
        None => Err(StoreError::NotFound(format!("node {id}"))),
    }
}

/// Reserve `count` sequence numbers. The counter lives on the session row,
/// so numbers freed by a prune are never handed out again.
fn take_sequences(conn: &Connection, session_id: &SessionId, count: i64) -> Result<i64, StoreError> {
    let first: i64 = conn
        .query_row(
            "SELECT next_sequence FROM sessions WHERE id = ?1",
            [session_id.as_str()],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
    conn.execute(
        "UPDATE sessions SET next_sequence = ?1 WHERE id = ?2",
        rusqlite::params![first + count, session_id.as_str()],
    )?;
    Ok(first)
}

fn delete_ids(conn: &Connection, root: &NodeId) -> Result<usize, StoreError> {
    let sql = format!("DELETE FROM nodes WHERE id IN ({SUBTREE_CTE} SELECT id FROM subtree)");
    Ok(conn.execute(&sql, [root.as_str()])?)
}

#[allow(clippy::too_many_arguments)]
fn insert_node(
    conn: &Connection,
    session_id: &SessionId,
    id: &NodeId,
    parent_id: Option<&NodeId>,
    role: Role,
    content: &str,
    status: NodeStatus,
    sequence: i64,
    created_at: &chrono::DateTime<Utc>,
) -> Result<MessageNode, StoreError> {
    conn.execute(
        "INSERT INTO nodes (id, session_id, parent_id, role, content, status, sequence, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            id.as_str(),
            session_id.as_str(),
            parent_id.map(NodeId::as_str),
            role.as_str(),
            content,
            status.as_str(),
            sequence,
            row_helpers::format_timestamp(created_at),
        ],
    )?;

    Ok(MessageNode {
        id: id.clone(),
        session_id: session_id.clone(),
        role,
        content: content.to_string(),
        status,
        parent_id: parent_id.cloned(),
        sequence,
        created_at: *created_at,
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session, StoreError> {
    let created: String = row_helpers::get(row, 4, "sessions", "created_at")?;
    let updated: String = row_helpers::get(row, 5, "sessions", "updated_at")?;
    Ok(Session {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        root_id: NodeId::from_raw(row_helpers::get::<String>(row, 1, "sessions", "root_id")?),
        head_id: NodeId::from_raw(row_helpers::get::<String>(row, 2, "sessions", "head_id")?),
        version: row_helpers::get(row, 3, "sessions", "version")?,
        created_at: row_helpers::parse_timestamp(&created, "sessions", "created_at")?,
        updated_at: row_helpers::parse_timestamp(&updated, "sessions", "updated_at")?,
    })
}

fn row_to_node(row: &rusqlite::Row<'_>) -> Result<MessageNode, StoreError> {
    let role: String = row_helpers::get(row, 3, "nodes", "role")?;
    let status: String = row_helpers::get(row, 5, "nodes", "status")?;
    let created: String = row_helpers::get(row, 7, "nodes", "created_at")?;
    Ok(MessageNode {
        id: NodeId::from_raw(row_helpers::get::<String>(row, 0, "nodes", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "nodes", "session_id")?),
        parent_id: row_helpers::get_opt::<String>(row, 2, "nodes", "parent_id")?.map(NodeId::from_raw),
        role: row_helpers::parse_enum(&role, "nodes", "role")?,
        content: row_helpers::get(row, 4, "nodes", "content")?,
        status: row_helpers::parse_enum(&status, "nodes", "status")?,
        sequence: row_helpers::get(row, 6, "nodes", "sequence")?,
        created_at: row_helpers::parse_timestamp(&created, "nodes", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (SqliteStore, Session) {
        let store = SqliteStore::in_memory().unwrap();
        let (session, _) = store.create_session("be brief").unwrap();
        (store, session)
    }

    #[test]
    fn create_session_inserts_root() {
        let (store, session) = setup();
        assert!(session.id.as_str().starts_with("sess_"));
        assert_eq!(session.head_id, session.root_id);

        let root = store.get_node(&session.root_id).unwrap();
        assert_eq!(root.role, Role::System);
        assert_eq!(root.content, "be brief");
        assert!(root.parent_id.is_none());
        assert_eq!(root.sequence, 0);
    }

    #[test]
    fn commit_applies_inserts_and_bumps_version() {
        let (store, session) = setup();
        let user = NewNode::committed(&session.root_id, Role::User, "hi");
        let reply = NewNode::pending_reply(&user.id);
        let commit = Commit {
            head: reply.id.clone(),
            inserts: vec![user.clone(), reply.clone()],
            prune: None,
        };

        let outcome = store.commit(&session.id, 0, &commit).unwrap();
        assert_eq!(outcome.session.version, 1);
        assert_eq!(outcome.session.head_id, reply.id);
        assert_eq!(outcome.inserted[0].sequence, 1);
        assert_eq!(outcome.inserted[1].sequence, 2);

        let stored = store.get_session(&session.id).unwrap();
        assert_eq!(stored.head_id, reply.id);
        assert_eq!(stored.version, 1);
    }

    #[test]
    fn stale_version_is_conflict_and_writes_nothing() {
        let (store, session) = setup();
        store
            .commit(&session.id, 0, &Commit::move_head(&session.root_id))
            .unwrap();

        let user = NewNode::committed(&session.root_id, Role::User, "late");
        let commit = Commit {
            head: user.id.clone(),
            inserts: vec![user.clone()],
            prune: None,
        };
        let err = store.commit(&session.id, 0, &commit).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 0, actual: 1, .. }));
        assert!(matches!(store.get_node(&user.id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn failed_validation_rolls_back_partial_batch() {
        let (store, session) = setup();
        let ok = NewNode::committed(&session.root_id, Role::User, "ok");
        let orphan = NewNode::committed(&NodeId::new(), Role::User, "orphan");
        let commit = Commit {
            head: ok.id.clone(),
            inserts: vec![ok.clone(), orphan],
            prune: None,
        };
        assert!(matches!(
            store.commit(&session.id, 0, &commit),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(store.get_node(&ok.id), Err(StoreError::NotFound(_))));
        assert_eq!(store.get_session(&session.id).unwrap().version, 0);
    }

    #[test]
    fn deleting_subtree_cascades_through_descendants() {
        let (store, session) = setup();
        let a = store
            .create_node(&session.id, Role::User, "a", Some(&session.root_id), NodeStatus::Committed)
            .unwrap();
        let b = store
            .create_node(&session.id, Role::Assistant, "b", Some(&a.id), NodeStatus::Committed)
            .unwrap();
        let c = store
            .create_node(&session.id, Role::User, "c", Some(&b.id), NodeStatus::Committed)
            .unwrap();

        let removed = store.delete_subtree(&a.id).unwrap();
        assert_eq!(removed.len(), 3);
        for id in [&a.id, &b.id, &c.id] {
            assert!(matches!(store.get_node(id), Err(StoreError::NotFound(_))));
        }
        assert!(store.list_children(&session.root_id).unwrap().is_empty());
    }

    #[test]
    fn search_treats_wildcards_literally() {
        let (store, session) = setup();
        store
            .create_node(&session.id, Role::User, "50% off", Some(&session.root_id), NodeStatus::Committed)
            .unwrap();
        store
            .create_node(&session.id, Role::User, "500 items", Some(&session.root_id), NodeStatus::Committed)
            .unwrap();

        let hits = store.search_nodes(&session.id, "0%", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "50% off");

        let hits = store.search_nodes(&session.id, "ITEMS", 10).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn corrupt_role_surfaces_as_corrupt_row() {
        let (store, session) = setup();
        store
            .database()
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE nodes SET role = 'robot' WHERE id = ?1",
                    [session.root_id.as_str()],
                )?;
                Ok(())
            })
            .unwrap();
        assert!(matches!(
            store.get_node(&session.root_id),
            Err(StoreError::CorruptRow { table: "nodes", column: "role", .. })
        ));
    }

    #[test]
    fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        let session_id = {
            let store = SqliteStore::new(Database::open(&path).unwrap());
            let (session, _) = store.create_session("").unwrap();
            store
                .create_node(&session.id, Role::User, "persisted", Some(&session.root_id), NodeStatus::Committed)
                .unwrap();
            session.id
        };

        let store = SqliteStore::new(Database::open(&path).unwrap());
        let snapshot = store.snapshot(&session_id).unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.nodes()[1].content, "persisted");
    }
}
