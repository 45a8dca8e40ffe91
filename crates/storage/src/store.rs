//! SQLite event store implementation.

use crate::{Event, EventKind, Result, SessionId};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use std::path::Path;

/// One row of the `sessions` listing.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: SessionId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub message_count: usize,
    /// Terminal state recorded by the last `session_end` event.
    pub final_state: Option<String>,
}

/// SQLite-backed event store. Append-only.
pub struct EventStore {
    conn: Connection,
}

impl EventStore {
    /// Open or create an event store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory event store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                kind TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_session
                ON events(session_id, timestamp);
            "#,
        )?;
        Ok(())
    }

    /// Append an event to the store.
    pub fn append(&self, event: &Event) -> Result<()> {
        self.conn.execute(
            "INSERT INTO events (id, session_id, timestamp, kind, data) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.id.to_string(),
                event.session_id.to_string(),
                event.timestamp.to_rfc3339(),
                event.kind.name(),
                serde_json::to_string(&event.kind)?,
            ],
        )?;
        Ok(())
    }

    /// Load all events for a session in append order.
    pub fn load_session(&self, session_id: SessionId) -> Result<Vec<Event>> {
        self.load_events(session_id, None)
    }

    /// Load a session's events, optionally only those of one kind.
    pub fn load_events(&self, session_id: SessionId, kind: Option<&str>) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, timestamp, data FROM events
             WHERE session_id = ?1 AND (?2 IS NULL OR kind = ?2)
             ORDER BY rowid",
        )?;

        let events = stmt
            .query_map(params![session_id.to_string(), kind], raw_event)?
            .filter_map(|r| r.ok())
            .filter_map(|(id, session_id, timestamp, data)| {
                Some(Event {
                    id: id.parse().ok()?,
                    session_id: session_id.parse().ok()?,
                    timestamp: timestamp.parse().ok()?,
                    kind: serde_json::from_str(&data).ok()?,
                })
            })
            .collect();

        Ok(events)
    }

    /// All sessions, most recently started first.
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id,
                    MIN(timestamp),
                    MAX(CASE WHEN kind = 'session_end' THEN timestamp END),
                    SUM(kind = 'message'),
                    (SELECT e.data FROM events e
                     WHERE e.session_id = events.session_id AND e.kind = 'session_end'
                     ORDER BY e.rowid DESC LIMIT 1)
             FROM events
             GROUP BY session_id
             ORDER BY MIN(timestamp) DESC",
        )?;

        let sessions = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(id, started, ended, messages, end_data)| {
                let final_state = end_data
                    .and_then(|data| serde_json::from_str::<EventKind>(&data).ok())
                    .and_then(|kind| match kind {
                        EventKind::SessionEnd { state } => Some(state),
                        _ => None,
                    });
                Some(SessionSummary {
                    id: id.parse().ok()?,
                    started_at: started.parse().ok()?,
                    ended_at: ended.and_then(|t| t.parse().ok()),
                    message_count: usize::try_from(messages).unwrap_or(0),
                    final_state,
                })
            })
            .collect();

        Ok(sessions)
    }
}

fn raw_event(row: &Row<'_>) -> rusqlite::Result<(String, String, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Role;
    use serde_json::json;

    fn tool_call(session: SessionId) -> Event {
        Event::new(
            session,
            EventKind::ToolCall {
                call_id: "call_1".into(),
                name: "add".into(),
                input: json!({"a": 3, "b": 4}),
                confidence: "structured".into(),
            },
        )
    }

    #[test]
    fn events_load_in_append_order() {
        let store = EventStore::in_memory().unwrap();
        let session = SessionId::new();
        store.append(&Event::new(session, EventKind::SessionStart)).unwrap();
        store.append(&Event::message(session, Role::User, "add 3 and 4")).unwrap();
        store.append(&tool_call(session)).unwrap();
        store
            .append(&Event::new(
                session,
                EventKind::ToolResult {
                    call_id: "call_1".into(),
                    name: "add".into(),
                    output: json!(7),
                    error: None,
                },
            ))
            .unwrap();

        let kinds: Vec<_> = store
            .load_session(session)
            .unwrap()
            .iter()
            .map(|e| e.kind.name())
            .collect();
        assert_eq!(kinds, ["session_start", "message", "tool_call", "tool_result"]);
    }

    #[test]
    fn load_events_filters_by_kind_and_session() {
        let store = EventStore::in_memory().unwrap();
        let ours = SessionId::new();
        let theirs = SessionId::new();
        store.append(&Event::message(ours, Role::User, "hi")).unwrap();
        store.append(&tool_call(ours)).unwrap();
        store.append(&tool_call(theirs)).unwrap();

        let calls = store.load_events(ours, Some("tool_call")).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].session_id, ours);
        assert!(matches!(calls[0].kind, EventKind::ToolCall { .. }));
    }

    #[test]
    fn list_sessions_reports_final_state() {
        let store = EventStore::in_memory().unwrap();
        let finished = SessionId::new();
        let open = SessionId::new();

        store.append(&Event::new(finished, EventKind::SessionStart)).unwrap();
        store.append(&Event::message(finished, Role::User, "hello")).unwrap();
        store.append(&Event::message(finished, Role::Assistant, "hi")).unwrap();
        store
            .append(&Event::new(
                finished,
                EventKind::SessionEnd {
                    state: "done".into(),
                },
            ))
            .unwrap();
        store.append(&Event::new(open, EventKind::SessionStart)).unwrap();

        let sessions = store.list_sessions().unwrap();
        assert_eq!(sessions.len(), 2);

        let summary = sessions.iter().find(|s| s.id == finished).unwrap();
        assert_eq!(summary.message_count, 2);
        assert!(summary.ended_at.is_some());
        assert_eq!(summary.final_state.as_deref(), Some("done"));

        let summary = sessions.iter().find(|s| s.id == open).unwrap();
        assert_eq!(summary.message_count, 0);
        assert!(summary.ended_at.is_none());
        assert!(summary.final_state.is_none());
    }
}
