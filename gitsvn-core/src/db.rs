//! Per-repository metadata database.
//!
//! One SQLite file (WAL mode) holds the revision index, the content
//! metadata cache and the lock table. The schema belongs to this crate;
//! callers treat the database directory as opaque.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

use crate::error::Result;

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join("meta.sqlite"))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS revisions (
                rev INTEGER PRIMARY KEY,
                commit_id BLOB NOT NULL UNIQUE,
                tree_id BLOB NOT NULL,
                author TEXT NOT NULL,
                message TEXT NOT NULL,
                date INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS changed_paths (
                rev INTEGER NOT NULL REFERENCES revisions(rev),
                path TEXT NOT NULL,
                action TEXT NOT NULL,
                copy_path TEXT,
                copy_rev INTEGER,
                PRIMARY KEY (rev, path)
            );
            CREATE INDEX IF NOT EXISTS changed_paths_by_path
                ON changed_paths(path, rev);
            CREATE TABLE IF NOT EXISTS content_meta (
                blob_id BLOB NOT NULL,
                chain TEXT NOT NULL,
                md5 BLOB NOT NULL,
                size INTEGER NOT NULL,
                PRIMARY KEY (blob_id, chain)
            );
            CREATE TABLE IF NOT EXISTS locks (
                path TEXT PRIMARY KEY,
                token TEXT NOT NULL UNIQUE,
                owner TEXT NOT NULL,
                comment TEXT,
                created_at INTEGER NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Runs `f` with the connection. Point lookups and small scans only;
    /// holders must not block on I/O outside SQLite.
    pub fn with<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        Ok(f(&conn)?)
    }

    /// Runs `f` inside an immediate (write-locking) transaction. This is
    /// also the per-repository advisory lock that serializes revision
    /// observation.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().expect("database mutex poisoned");
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.with(|conn| {
            conn.query_row(
                "SELECT value FROM meta WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.with(|conn| {
            conn.execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [key, value],
            )
            .map(|_| ())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.get_meta("uuid").unwrap(), None);
        db.set_meta("uuid", "abc").unwrap();
        assert_eq!(db.get_meta("uuid").unwrap(), Some("abc".to_string()));
        db.set_meta("uuid", "def").unwrap();
        assert_eq!(db.get_meta("uuid").unwrap(), Some("def".to_string()));
    }

    #[test]
    fn reopen_preserves_schema_and_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(dir.path()).unwrap();
            db.set_meta("k", "v").unwrap();
        }
        let db = Database::open(dir.path()).unwrap();
        assert_eq!(db.get_meta("k").unwrap(), Some("v".to_string()));
    }
}
