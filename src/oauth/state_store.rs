//! Storage for pending OAuth states.
//!
//! The callback may land on a different process than the one that issued the
//! state, so the manager only talks to a [`CorrelationStore`]. The SQLite
//! store shares the credential database and works across processes; the
//! memory store is for single-process deployments and tests.

use crate::db::{from_db_time, open_connection, to_db_time};
use crate::error::{Error, Result};
use crate::platform::Platform;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// A pending OAuth state (CSRF correlation token).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorrelationToken {
    /// Opaque random value round-tripped through the provider
    pub value: String,
    pub platform: Platform,
    /// User who started the connection
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Backing store for pending states, keyed by a digest of the state value.
pub trait CorrelationStore: Send + Sync {
    fn insert(&self, key: &str, token: &CorrelationToken) -> Result<()>;

    /// Removes and returns the entry. A second call for the same key returns `None`.
    fn take(&self, key: &str) -> Result<Option<CorrelationToken>>;

    /// Drops entries that expired before `now`, returning how many were removed.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    fn count(&self) -> Result<usize>;
}

fn poisoned() -> Error {
    Error::Internal("state store lock poisoned".to_string())
}

/// In-process state store
#[derive(Default)]
pub struct MemoryCorrelationStore {
    states: Mutex<HashMap<String, CorrelationToken>>,
}

impl MemoryCorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CorrelationStore for MemoryCorrelationStore {
    fn insert(&self, key: &str, token: &CorrelationToken) -> Result<()> {
        let mut states = self.states.lock().map_err(|_| poisoned())?;
        states.insert(key.to_string(), token.clone());
        Ok(())
    }

    fn take(&self, key: &str) -> Result<Option<CorrelationToken>> {
        let mut states = self.states.lock().map_err(|_| poisoned())?;
        Ok(states.remove(key))
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut states = self.states.lock().map_err(|_| poisoned())?;
        let before = states.len();
        states.retain(|_, token| token.expires_at >= now);
        Ok(before - states.len())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.states.lock().map_err(|_| poisoned())?.len())
    }
}

/// State store backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE oauth_states (
///     state_key TEXT PRIMARY KEY,   -- SHA-256 of the state value (hex)
///     state_value TEXT NOT NULL,
///     platform TEXT NOT NULL,
///     user_id TEXT NOT NULL,
///     created_at TEXT NOT NULL,
///     expires_at TEXT NOT NULL
/// );
/// ```
///
/// `take` is a single `DELETE ... RETURNING`, so two processes racing on the
/// same callback cannot both consume the state.
pub struct SqliteCorrelationStore {
    conn: Mutex<Connection>,
}

impl SqliteCorrelationStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_connection(db_path)?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS oauth_states (
                state_key TEXT PRIMARY KEY,
                state_value TEXT NOT NULL,
                platform TEXT NOT NULL,
                user_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_oauth_states_expires ON oauth_states(expires_at)",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl CorrelationStore for SqliteCorrelationStore {
    fn insert(&self, key: &str, token: &CorrelationToken) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        conn.execute(
            r#"
            INSERT INTO oauth_states (state_key, state_value, platform, user_id, created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                key,
                token.value,
                token.platform.id(),
                token.user_id,
                to_db_time(token.created_at),
                to_db_time(token.expires_at),
            ],
        )?;
        Ok(())
    }

    fn take(&self, key: &str) -> Result<Option<CorrelationToken>> {
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        let row = conn
            .query_row(
                r#"
                DELETE FROM oauth_states WHERE state_key = ?1
                RETURNING state_value, platform, user_id, created_at, expires_at
                "#,
                params![key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((value, platform, user_id, created_at, expires_at)) = row else {
            return Ok(None);
        };

        let platform: Platform = platform.parse()?;
        let created_at = from_db_time(&created_at)
            .map_err(|e| Error::Internal(format!("invalid state timestamp: {}", e)))?;
        let expires_at = from_db_time(&expires_at)
            .map_err(|e| Error::Internal(format!("invalid state timestamp: {}", e)))?;

        Ok(Some(CorrelationToken {
            value,
            platform,
            user_id,
            created_at,
            expires_at,
        }))
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        let removed = conn.execute(
            "DELETE FROM oauth_states WHERE expires_at < ?1",
            params![to_db_time(now)],
        )?;
        Ok(removed)
    }

    fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM oauth_states", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(value: &str, expires_in: Duration) -> CorrelationToken {
        let now = Utc::now();
        CorrelationToken {
            value: value.to_string(),
            platform: Platform::Instagram,
            user_id: "user1".to_string(),
            created_at: now,
            expires_at: now + expires_in,
        }
    }

    fn exercise_store(store: &dyn CorrelationStore) {
        let live = token("live", Duration::minutes(10));
        let stale = token("stale", Duration::minutes(-1));

        store.insert("k-live", &live).unwrap();
        store.insert("k-stale", &stale).unwrap();
        assert_eq!(store.count().unwrap(), 2);

        assert_eq!(store.purge_expired(Utc::now()).unwrap(), 1);
        assert_eq!(store.count().unwrap(), 1);

        let taken = store.take("k-live").unwrap().unwrap();
        assert_eq!(taken.value, "live");
        assert_eq!(taken.platform, Platform::Instagram);
        assert_eq!(taken.user_id, "user1");

        // Single use
        assert!(store.take("k-live").unwrap().is_none());
        assert!(store.take("never-issued").unwrap().is_none());
    }

    #[test]
    fn test_memory_store() {
        exercise_store(&MemoryCorrelationStore::new());
    }

    #[test]
    fn test_sqlite_store() {
        exercise_store(&SqliteCorrelationStore::open(":memory:").unwrap());
    }

    #[test]
    fn test_sqlite_store_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("states.db");

        let issuer = SqliteCorrelationStore::open(&path).unwrap();
        let verifier = SqliteCorrelationStore::open(&path).unwrap();

        issuer
            .insert("shared", &token("xyz", Duration::minutes(10)))
            .unwrap();

        let taken = verifier.take("shared").unwrap().unwrap();
        assert_eq!(taken.value, "xyz");
        assert!(issuer.take("shared").unwrap().is_none());
    }
}
