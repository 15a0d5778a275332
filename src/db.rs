//! SQLite-backed key/value store for durable registry state
//!
//! Every registry record lives under one string key; values are opaque to this
//! module. Each call runs in its own implicit transaction.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // WAL keeps readers off the writer's lock
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: key/value table
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: key/value store");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    /// Insert or replace the value stored under `key`
    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = datetime('now')",
            params![key, value],
        )
        .with_context(|| format!("Failed to store key {}", key))?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()
        .with_context(|| format!("Failed to read key {}", key))
    }

    /// Delete a key, returning whether it existed
    pub fn delete(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .with_context(|| format!("Failed to delete key {}", key))?;
        Ok(rows > 0)
    }

    /// All entries whose key starts with `prefix`, ordered by key
    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT key, value FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;

        let entries = stmt
            .query_map(params![prefix], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to scan keys")?;

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let db = Database::open_in_memory().unwrap();

        db.put("notebook:1", r#"{"id":"1"}"#).unwrap();
        assert_eq!(db.get("notebook:1").unwrap().as_deref(), Some(r#"{"id":"1"}"#));
        assert_eq!(db.get("notebook:2").unwrap(), None);
    }

    #[test]
    fn test_put_overwrites() {
        let db = Database::open_in_memory().unwrap();

        db.put("k", "a").unwrap();
        db.put("k", "b").unwrap();
        assert_eq!(db.get("k").unwrap().as_deref(), Some("b"));
        assert_eq!(db.scan_prefix("k").unwrap().len(), 1);
    }

    #[test]
    fn test_delete() {
        let db = Database::open_in_memory().unwrap();

        db.put("k", "v").unwrap();
        assert!(db.delete("k").unwrap());
        assert!(!db.delete("k").unwrap());
        assert_eq!(db.get("k").unwrap(), None);
    }

    #[test]
    fn test_scan_prefix_only_matches_prefix() {
        let db = Database::open_in_memory().unwrap();

        db.put("notebook:b", "2").unwrap();
        db.put("notebook:a", "1").unwrap();
        db.put("other:a", "x").unwrap();
        db.put("xnotebook:c", "y").unwrap();

        let entries = db.scan_prefix("notebook:").unwrap();
        assert_eq!(
            entries,
            vec![
                ("notebook:a".to_string(), "1".to_string()),
                ("notebook:b".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("hub.db");

        {
            let db = Database::open(&path).unwrap();
            db.put("notebook:1", "v").unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.get("notebook:1").unwrap().as_deref(), Some("v"));
    }
}
