use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A warn+ log event persisted to the journal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub session_id: Option<String>,
    pub node_id: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct JournalQuery {
    pub level: Option<String>,
    pub session_id: Option<String>,
    pub node_id: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite table of warnings and errors, keyed by the session and node they
/// concern so a failed reply can be traced back after the fact.
pub struct WarnJournal {
    conn: Mutex<Connection>,
}

impl WarnJournal {
    pub fn open(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self::from_connection(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS journal (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 session_id TEXT,
                 node_id TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_journal_session ON journal(session_id);
             CREATE INDEX IF NOT EXISTS idx_journal_node ON journal(node_id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, entry: &Entry) {
        let conn = self.conn.lock();
        // A failing journal must never take the caller down with it.
        let _ = conn.execute(
            "INSERT INTO journal (timestamp, level, target, message, fields, session_id, node_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                entry.timestamp,
                entry.level,
                entry.target,
                entry.message,
                entry.fields,
                entry.session_id,
                entry.node_id,
            ],
        );
    }

    pub fn query(&self, q: &JournalQuery) -> Result<Vec<JournalRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, session_id, node_id FROM journal WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(level) = &q.level {
            params.push(Box::new(level.to_uppercase()));
            sql.push_str(&format!(" AND level = ?{}", params.len()));
        }
        if let Some(session_id) = &q.session_id {
            params.push(Box::new(session_id.clone()));
            sql.push_str(&format!(" AND session_id = ?{}", params.len()));
        }
        if let Some(node_id) = &q.node_id {
            params.push(Box::new(node_id.clone()));
            sql.push_str(&format!(" AND node_id = ?{}", params.len()));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(JournalRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                session_id: row.get(6)?,
                node_id: row.get(7)?,
            })
        })?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM journal", [], |row| row.get(0))
    }
}

struct Entry {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    session_id: Option<String>,
    node_id: Option<String>,
}

/// `tracing` layer that copies WARN and ERROR events into a [`WarnJournal`].
pub struct JournalLayer {
    journal: Arc<WarnJournal>,
}

impl JournalLayer {
    pub fn new(journal: Arc<WarnJournal>) -> Self {
        Self { journal }
    }
}

#[derive(Default)]
struct Ids {
    session_id: Option<String>,
    node_id: Option<String>,
}

#[derive(Default)]
struct EventVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    ids: Ids,
}

impl EventVisitor {
    fn put(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = Some(value),
            "session_id" => self.ids.session_id = Some(value),
            "node_id" => self.ids.node_id = Some(value),
            other => {
                self.fields
                    .insert(other.to_string(), serde_json::Value::String(value));
            }
        }
    }
}

impl Visit for EventVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field.name(), format!("{value:?}").trim_matches('"').to_string());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field.name(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

impl<S> Layer<S> for JournalLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = EventVisitor::default();
        attrs.record(&mut visitor);
        if visitor.ids.session_id.is_none() && visitor.ids.node_id.is_none() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(visitor.ids);
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);

        // Fall back to the innermost enclosing span that carried the ids.
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if visitor.ids.session_id.is_some() && visitor.ids.node_id.is_some() {
                    break;
                }
                let extensions = span.extensions();
                if let Some(ids) = extensions.get::<Ids>() {
                    if visitor.ids.session_id.is_none() {
                        visitor.ids.session_id.clone_from(&ids.session_id);
                    }
                    if visitor.ids.node_id.is_none() {
                        visitor.ids.node_id.clone_from(&ids.node_id);
                    }
                }
            }
        }

        let fields = if visitor.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&visitor.fields).ok()
        };

        self.journal.insert(&Entry {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            session_id: visitor.ids.session_id,
            node_id: visitor.ids.node_id,
        });
    }
}
