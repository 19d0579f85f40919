//! Advisory path locks.
//!
//! Locks live in the metadata database, not in git history. A lock pins a
//! path regardless of revision; commits touching a locked path must carry
//! its token.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{RepoError, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lock {
    pub path: String,
    pub token: String,
    pub owner: String,
    pub comment: Option<String>,
    /// Seconds since epoch.
    pub created_at: i64,
}

impl Lock {
    /// Creation date in the ISO-8601 form SVN puts on the wire.
    pub fn created_date(&self) -> String {
        Utc.timestamp_opt(self.created_at, 0)
            .single()
            .unwrap_or_default()
            .format("%Y-%m-%dT%H:%M:%S%.6fZ")
            .to_string()
    }
}

pub struct LockTable {
    db: Arc<Database>,
}

impl LockTable {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Takes a lock. `steal` breaks an existing lock held by anyone.
    pub fn lock(
        &self,
        path: &str,
        owner: &str,
        comment: Option<&str>,
        steal: bool,
    ) -> Result<Lock> {
        let token = format!("opaquelocktoken:{}", Uuid::new_v4());
        let created_at = Utc::now().timestamp();
        self.db.with_tx(|tx| {
            let existing: Option<String> = tx
                .query_row("SELECT owner FROM locks WHERE path = ?1", [path], |row| {
                    row.get(0)
                })
                .map(Some)
                .or_else(|err| match err {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            if existing.is_some() && !steal {
                // Surfaced below as LockDenied via the sentinel row count.
                return Ok(0usize);
            }
            tx.execute("DELETE FROM locks WHERE path = ?1", [path])?;
            tx.execute(
                "INSERT INTO locks (path, token, owner, comment, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![path, token, owner, comment, created_at],
            )
        })
        .and_then(|inserted| {
            if inserted == 0 {
                Err(RepoError::LockDenied(path.to_string()))
            } else {
                Ok(Lock {
                    path: path.to_string(),
                    token,
                    owner: owner.to_string(),
                    comment: comment.map(str::to_string),
                    created_at,
                })
            }
        })
    }

    /// Releases a lock. Without `break_lock` the token must match.
    pub fn unlock(&self, path: &str, token: Option<&str>, break_lock: bool) -> Result<()> {
        let existing = self.get(path)?.ok_or_else(|| RepoError::NoSuchLock(path.to_string()))?;
        if !break_lock && token != Some(existing.token.as_str()) {
            return Err(RepoError::LockDenied(path.to_string()));
        }
        self.db.with(|conn| {
            conn.execute("DELETE FROM locks WHERE path = ?1", [path]).map(|_| ())
        })
    }

    pub fn get(&self, path: &str) -> Result<Option<Lock>> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT path, token, owner, comment, created_at FROM locks WHERE path = ?1",
                [path],
                row_to_lock,
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }

    /// All locks at or below `path`.
    pub fn list(&self, path: &str) -> Result<Vec<Lock>> {
        let path = path.trim_end_matches('/');
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT path, token, owner, comment, created_at FROM locks
                 WHERE path = ?1 OR path LIKE ?1 || '/%' OR ?1 = ''
                 ORDER BY path",
            )?;
            let rows = stmt.query_map([path], row_to_lock)?;
            rows.collect()
        })
    }

    /// Verifies that `tokens` authorizes changing `path`. `tokens` maps
    /// path to lock token as supplied by the client.
    pub fn check_token(
        &self,
        path: &str,
        tokens: &std::collections::HashMap<String, String>,
    ) -> Result<()> {
        if let Some(lock) = self.get(path)? {
            let supplied = tokens.get(path).map(String::as_str);
            if supplied != Some(lock.token.as_str()) {
                return Err(RepoError::LockDenied(path.to_string()));
            }
        }
        Ok(())
    }

    /// Drops locks whose paths were committed with their tokens, unless the
    /// client asked to keep them.
    pub fn release_after_commit(
        &self,
        tokens: &std::collections::HashMap<String, String>,
        keep_locks: bool,
    ) -> Result<()> {
        if keep_locks {
            return Ok(());
        }
        for (path, token) in tokens {
            if let Some(lock) = self.get(path)? {
                if lock.token == *token {
                    self.db.with(|conn| {
                        conn.execute("DELETE FROM locks WHERE path = ?1", [path.as_str()])
                            .map(|_| ())
                    })?;
                }
            }
        }
        Ok(())
    }
}

fn row_to_lock(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lock> {
    Ok(Lock {
        path: row.get(0)?,
        token: row.get(1)?,
        owner: row.get(2)?,
        comment: row.get(3)?,
        created_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> LockTable {
        LockTable::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    #[test]
    fn lock_unlock_cycle() {
        let locks = table();
        let lock = locks.lock("/trunk/a.txt", "alice", Some("wip"), false).unwrap();
        assert!(lock.token.starts_with("opaquelocktoken:"));
        assert_eq!(locks.get("/trunk/a.txt").unwrap().unwrap().owner, "alice");

        // Wrong token is refused, right token releases.
        assert!(matches!(
            locks.unlock("/trunk/a.txt", Some("nope"), false),
            Err(RepoError::LockDenied(_))
        ));
        locks.unlock("/trunk/a.txt", Some(&lock.token), false).unwrap();
        assert!(locks.get("/trunk/a.txt").unwrap().is_none());
    }

    #[test]
    fn second_lock_denied_unless_stolen() {
        let locks = table();
        locks.lock("/a", "alice", None, false).unwrap();
        assert!(matches!(
            locks.lock("/a", "bob", None, false),
            Err(RepoError::LockDenied(_))
        ));
        let stolen = locks.lock("/a", "bob", None, true).unwrap();
        assert_eq!(locks.get("/a").unwrap().unwrap().token, stolen.token);
    }

    #[test]
    fn list_scans_subtree() {
        let locks = table();
        locks.lock("/trunk/a", "alice", None, false).unwrap();
        locks.lock("/trunk/sub/b", "alice", None, false).unwrap();
        locks.lock("/branches/c", "bob", None, false).unwrap();

        let trunk = locks.list("/trunk").unwrap();
        assert_eq!(trunk.len(), 2);
        let all = locks.list("").unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn commit_token_check() {
        let locks = table();
        let lock = locks.lock("/a", "alice", None, false).unwrap();

        let mut tokens = std::collections::HashMap::new();
        assert!(matches!(
            locks.check_token("/a", &tokens),
            Err(RepoError::LockDenied(_))
        ));
        tokens.insert("/a".to_string(), lock.token.clone());
        locks.check_token("/a", &tokens).unwrap();
        locks.check_token("/unlocked", &tokens).unwrap();

        locks.release_after_commit(&tokens, false).unwrap();
        assert!(locks.get("/a").unwrap().is_none());
    }
}
