//! User records
//!
//! The session layer upstream is an opaque identity oracle; this table maps
//! its bearer tokens to a `user_id` and an admin flag.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::{Store, StoreError};

/// A known user.
#[derive(Debug, Clone, Serialize)]
pub struct UserRecord {
    pub user_id: String,
    pub admin: bool,
    pub created_at: DateTime<Utc>,
}

impl Store {
    /// Resolve a bearer token to a user, if known.
    pub fn user_by_token(&self, token: &str) -> Result<Option<UserRecord>, StoreError> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT user_id, admin, created_at FROM users WHERE token = ?1",
                [token],
                |row| {
                    Ok(UserRecord {
                        user_id: row.get(0)?,
                        admin: row.get::<_, i64>(1)? != 0,
                        created_at: Utc
                            .timestamp_millis_opt(row.get(2)?)
                            .single()
                            .unwrap_or_else(Utc::now),
                    })
                },
            )
            .optional()?)
    }

    /// Insert a user if absent; existing records keep their admin flag.
    pub fn ensure_user(&self, user_id: &str, token: &str, admin: bool) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO users (user_id, token, admin, created_at) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(user_id) DO UPDATE SET token = excluded.token",
            params![user_id, token, admin as i64, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    pub fn list_users(&self) -> Result<Vec<UserRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT user_id, admin, created_at FROM users ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(UserRecord {
                user_id: row.get(0)?,
                admin: row.get::<_, i64>(1)? != 0,
                created_at: Utc
                    .timestamp_millis_opt(row.get(2)?)
                    .single()
                    .unwrap_or_else(Utc::now),
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn delete_user(&self, user_id: &str) -> Result<(), StoreError> {
        let changed = self
            .lock()
            .execute("DELETE FROM users WHERE user_id = ?1", [user_id])?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_resolution() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_user("alice", "tok-a", true).unwrap();

        let user = store.user_by_token("tok-a").unwrap().unwrap();
        assert_eq!(user.user_id, "alice");
        assert!(user.admin);
        assert!(store.user_by_token("tok-x").unwrap().is_none());
    }

    #[test]
    fn ensure_is_idempotent_and_keeps_admin() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_user("alice", "tok-a", true).unwrap();
        store.ensure_user("alice", "tok-b", false).unwrap();

        let user = store.user_by_token("tok-b").unwrap().unwrap();
        assert!(user.admin);
        assert_eq!(store.list_users().unwrap().len(), 1);
    }

    #[test]
    fn delete_user_round_trip() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_user("bob", "tok", false).unwrap();
        store.delete_user("bob").unwrap();
        assert!(matches!(store.delete_user("bob"), Err(StoreError::NotFound)));
    }
}
