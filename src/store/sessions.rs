//! Chat session persistence
//!
//! Sessions are replaceable documents: a POST of the full ordered message
//! list overwrites the previous state.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{Store, StoreError};

/// One chat message in a session transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `user`, `assistant`, `tool` or `system`.
    pub role: String,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A persisted chat session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub session_id: String,
    pub user_id: String,
    pub messages: Vec<ChatMessage>,
    pub updated_at: DateTime<Utc>,
}

/// Session index entry (no transcript).
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub user_id: String,
    pub message_count: usize,
    pub updated_at: DateTime<Utc>,
}

impl Store {
    pub fn get_session(&self, session_id: &str) -> Result<Option<ChatSession>, StoreError> {
        let conn = self.lock();
        let row: Option<(String, String, i64)> = conn
            .query_row(
                "SELECT user_id, messages, updated_at FROM chat_sessions WHERE session_id = ?1",
                [session_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match row {
            Some((user_id, messages, updated_at)) => Ok(Some(ChatSession {
                session_id: session_id.to_string(),
                user_id,
                messages: serde_json::from_str(&messages)?,
                updated_at: Utc
                    .timestamp_millis_opt(updated_at)
                    .single()
                    .unwrap_or_else(Utc::now),
            })),
            None => Ok(None),
        }
    }

    /// Replace (or create) a session with the full ordered message list.
    pub fn put_session(
        &self,
        session_id: &str,
        user_id: &str,
        messages: &[ChatMessage],
    ) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO chat_sessions (session_id, user_id, messages, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(session_id) DO UPDATE SET \
               user_id = excluded.user_id, \
               messages = excluded.messages, \
               updated_at = excluded.updated_at",
            params![
                session_id,
                user_id,
                serde_json::to_string(messages)?,
                Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }

    pub fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let changed = self
            .lock()
            .execute("DELETE FROM chat_sessions WHERE session_id = ?1", [session_id])?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Session index for one user, most recently updated first.
    pub fn list_sessions(&self, user_id: &str) -> Result<Vec<SessionSummary>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT session_id, user_id, messages, updated_at FROM chat_sessions \
             WHERE user_id = ?1 ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (session_id, user_id, messages, updated_at) = row?;
            let count = serde_json::from_str::<Vec<ChatMessage>>(&messages)
                .map(|m| m.len())
                .unwrap_or(0);
            out.push(SessionSummary {
                session_id,
                user_id,
                message_count: count,
                updated_at: Utc
                    .timestamp_millis_opt(updated_at)
                    .single()
                    .unwrap_or_else(Utc::now),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, text: &str) -> ChatMessage {
        ChatMessage {
            role: role.to_string(),
            content: serde_json::json!(text),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    #[test]
    fn put_replaces_full_transcript() {
        let store = Store::open_in_memory().unwrap();

        store
            .put_session("s1", "u1", &[msg("user", "hi")])
            .unwrap();
        store
            .put_session("s1", "u1", &[msg("user", "hi"), msg("assistant", "hello")])
            .unwrap();

        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[1].role, "assistant");
    }

    #[test]
    fn list_is_scoped_to_user() {
        let store = Store::open_in_memory().unwrap();
        store.put_session("s1", "u1", &[msg("user", "a")]).unwrap();
        store.put_session("s2", "u2", &[msg("user", "b")]).unwrap();

        let sessions = store.list_sessions("u1").unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, "s1");
        assert_eq!(sessions[0].message_count, 1);
    }

    #[test]
    fn delete_missing_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.delete_session("nope"),
            Err(StoreError::NotFound)
        ));
    }
}
