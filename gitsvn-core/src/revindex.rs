//! Revision index: the persistent bidirectional map between SVN revision
//! numbers and git commits.
//!
//! Revisions are assigned densely, in first-parent order, oldest first,
//! and are permanent once assigned. Observation of new commits happens in
//! one immediate transaction, which doubles as the per-repository lock:
//! concurrent observers agree on numbering, and a crash leaves the index
//! at the old or the new watermark, never in between.

use std::sync::Arc;

use gix_hash::ObjectId;
use rusqlite::params;
use tracing::{debug, info};

use crate::db::Database;
use crate::error::{RepoError, Result};
use crate::odb::{read_commit, ObjectStore};
use crate::paths;
use crate::treewalk::{self, DeltaKind};

/// Cached per-revision data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevisionRecord {
    pub rev: u64,
    pub commit_id: ObjectId,
    pub tree_id: ObjectId,
    pub author: String,
    pub message: String,
    /// Committer time, seconds since epoch.
    pub date: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeAction {
    Added,
    Deleted,
    Modified,
    Replaced,
}

impl ChangeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeAction::Added => "A",
            ChangeAction::Deleted => "D",
            ChangeAction::Modified => "M",
            ChangeAction::Replaced => "R",
        }
    }

    fn parse(s: &str) -> ChangeAction {
        match s {
            "A" => ChangeAction::Added,
            "D" => ChangeAction::Deleted,
            "R" => ChangeAction::Replaced,
            _ => ChangeAction::Modified,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangedPath {
    pub path: String,
    pub action: ChangeAction,
    pub copy_from: Option<(String, u64)>,
    pub is_dir: bool,
}

pub struct RevisionIndex {
    db: Arc<Database>,
}

impl RevisionIndex {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Newest assigned revision; 0 when only the empty root exists.
    pub fn latest(&self) -> Result<u64> {
        self.db.with(|conn| {
            conn.query_row("SELECT COALESCE(MAX(rev), 0) FROM revisions", [], |row| {
                row.get::<_, i64>(0)
            })
        })
        .map(|n| n as u64)
    }

    pub fn by_rev(&self, rev: u64) -> Result<RevisionRecord> {
        self.db
            .with(|conn| {
                conn.query_row(
                    "SELECT rev, commit_id, tree_id, author, message, date
                     FROM revisions WHERE rev = ?1",
                    [rev as i64],
                    row_to_record,
                )
                .map(Some)
                .or_else(no_rows_to_none)
            })?
            .ok_or(RepoError::RevisionNotFound(rev))
    }

    pub fn by_commit(&self, id: ObjectId) -> Result<Option<u64>> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT rev FROM revisions WHERE commit_id = ?1",
                [id.as_slice()],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| Some(n as u64))
            .or_else(no_rows_to_none)
        })
    }

    /// Latest revision whose commit date is at or before `ts`.
    pub fn rev_for_date(&self, ts: i64) -> Result<u64> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT COALESCE(MAX(rev), 0) FROM revisions WHERE date <= ?1",
                [ts],
                |row| row.get::<_, i64>(0),
            )
        })
        .map(|n| n as u64)
    }

    pub fn changed_paths(&self, rev: u64) -> Result<Vec<ChangedPath>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT path, action, copy_path, copy_rev FROM changed_paths
                 WHERE rev = ?1 ORDER BY path",
            )?;
            let rows = stmt.query_map([rev as i64], |row| {
                let action: String = row.get(1)?;
                let copy_path: Option<String> = row.get(2)?;
                let copy_rev: Option<i64> = row.get(3)?;
                Ok(ChangedPath {
                    path: row.get(0)?,
                    action: ChangeAction::parse(&action),
                    copy_from: copy_path.zip(copy_rev.map(|r| r as u64)),
                    is_dir: false,
                })
            })?;
            rows.collect()
        })
    }

    /// Revisions in `[lo, hi]` touching any of `paths` (or all revisions
    /// when `paths` includes the root), ascending.
    pub fn revs_touching(&self, targets: &[String], lo: u64, hi: u64) -> Result<Vec<u64>> {
        if targets.iter().any(|p| p == "/") || targets.is_empty() {
            return self.db.with(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT rev FROM revisions WHERE rev >= ?1 AND rev <= ?2 ORDER BY rev",
                )?;
                let rows = stmt
                    .query_map([lo.max(1) as i64, hi as i64], |row| row.get::<_, i64>(0))?;
                rows.map(|r| r.map(|n| n as u64)).collect()
            });
        }
        let mut revs: Vec<u64> = Vec::new();
        for target in targets {
            let hits: Vec<u64> = self.db.with(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT rev FROM changed_paths
                     WHERE rev >= ?1 AND rev <= ?2
                       AND (path = ?3 OR path LIKE ?3 || '/%' OR ?3 LIKE path || '/%')
                     ORDER BY rev",
                )?;
                let rows = stmt.query_map(
                    params![lo.max(1) as i64, hi as i64, target],
                    |row| row.get::<_, i64>(0),
                )?;
                rows.map(|r| r.map(|n| n as u64)).collect()
            })?;
            revs.extend(hits);
        }
        revs.sort_unstable();
        revs.dedup();
        Ok(revs)
    }

    /// Latest change at or below `path`, at or before `rev`, walking up to
    /// ancestors when the path itself was never recorded (it may have
    /// arrived through a parent directory copy).
    pub fn last_changed(&self, path: &str, rev: u64) -> Result<u64> {
        let mut probe = Some(path.to_string());
        while let Some(p) = probe {
            let found: Option<i64> = self.db.with(|conn| {
                conn.query_row(
                    "SELECT MAX(rev) FROM changed_paths
                     WHERE rev <= ?1 AND (path = ?2 OR path LIKE ?2 || '/%')",
                    params![rev as i64, p],
                    |row| row.get(0),
                )
            })?;
            if let Some(found) = found {
                return Ok(found as u64);
            }
            probe = paths::parent(&p).map(str::to_string);
        }
        Ok(rev.min(1))
    }

    /// The `(revision, path)` history of `path` starting at `rev`, newest
    /// first, following copies across renames.
    pub fn history(&self, path: &str, rev: u64) -> Result<Vec<(u64, String)>> {
        let mut out = Vec::new();
        let mut cur_path = path.to_string();
        let mut cur_rev = rev;
        loop {
            let hit: Option<(i64, String, Option<String>, Option<i64>)> =
                self.db.with(|conn| {
                    conn.query_row(
                        "SELECT rev, action, copy_path, copy_rev FROM changed_paths
                         WHERE rev <= ?1 AND path = ?2
                         ORDER BY rev DESC LIMIT 1",
                        params![cur_rev as i64, cur_path],
                        |row| {
                            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                        },
                    )
                    .map(Some)
                    .or_else(no_rows_to_none)
                })?;
            let Some((found_rev, action, copy_path, copy_rev)) = hit else {
                // Never directly recorded; the nearest ancestor brought it in.
                break;
            };
            if action == "D" {
                // Deleted at or before the peg; nothing beyond this point.
                break;
            }
            out.push((found_rev as u64, cur_path.clone()));
            if action == "A" || action == "R" {
                match copy_path.zip(copy_rev) {
                    Some((from_path, from_rev)) => {
                        cur_path = from_path;
                        cur_rev = from_rev as u64;
                    }
                    None => break,
                }
            } else {
                if found_rev == 0 {
                    break;
                }
                cur_rev = (found_rev - 1) as u64;
            }
        }
        Ok(out)
    }

    /// Rewrites the stored log message for `rev` (`svn:log` revprop).
    pub fn set_log_message(&self, rev: u64, message: &str) -> Result<()> {
        let updated = self.db.with(|conn| {
            conn.execute(
                "UPDATE revisions SET message = ?1 WHERE rev = ?2",
                params![message, rev as i64],
            )
        })?;
        if updated == 0 {
            return Err(RepoError::RevisionNotFound(rev));
        }
        Ok(())
    }

    /// Walks the tracked ref's first-parent history and assigns revision
    /// numbers to previously unseen commits. Returns the new latest
    /// revision.
    pub async fn observe(&self, store: &dyn ObjectStore, ref_name: &str) -> Result<u64> {
        let Some(head) = store.ref_id(ref_name).await? else {
            return self.latest();
        };
        if self.by_commit(head)?.is_some() {
            return self.latest();
        }

        // Collect the unindexed suffix, newest first.
        let mut pending = Vec::new();
        let mut cursor = Some(head);
        while let Some(id) = cursor {
            if self.by_commit(id)?.is_some() {
                break;
            }
            let commit = read_commit(store, id).await?;
            cursor = commit.parents.first().copied();
            pending.push((id, commit));
        }
        pending.reverse();
        debug!(count = pending.len(), "indexing new commits");

        // Compute each revision's record and changed paths before taking
        // the write transaction.
        let mut staged = Vec::with_capacity(pending.len());
        for (id, commit) in pending {
            let parent_tree = match commit.parents.first() {
                Some(parent) => Some(read_commit(store, *parent).await?.tree),
                None => None,
            };
            let changes = compute_changed_paths(store, parent_tree, commit.tree).await?;
            let record = RevisionRecord {
                rev: 0, // assigned below
                commit_id: id,
                tree_id: commit.tree,
                author: commit.author.name.to_string(),
                message: commit.message.to_string(),
                date: commit.committer.time.seconds,
            };
            staged.push((record, changes));
        }

        let latest = self.db.with_tx(|tx| {
            let mut next: i64 = tx.query_row(
                "SELECT COALESCE(MAX(rev), 0) FROM revisions",
                [],
                |row| row.get(0),
            )?;
            for (record, changes) in &staged {
                // Another observer may have won the race for a prefix.
                let seen: Option<i64> = tx
                    .query_row(
                        "SELECT rev FROM revisions WHERE commit_id = ?1",
                        [record.commit_id.as_slice()],
                        |row| row.get(0),
                    )
                    .map(Some)
                    .or_else(no_rows_to_none)?;
                if seen.is_some() {
                    continue;
                }
                next += 1;
                tx.execute(
                    "INSERT INTO revisions (rev, commit_id, tree_id, author, message, date)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        next,
                        record.commit_id.as_slice(),
                        record.tree_id.as_slice(),
                        record.author,
                        record.message,
                        record.date
                    ],
                )?;
                for change in changes {
                    tx.execute(
                        "INSERT OR REPLACE INTO changed_paths
                         (rev, path, action, copy_path, copy_rev)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            next,
                            change.path,
                            change.action.as_str(),
                            change.copy_from.as_ref().map(|(p, _)| p.as_str()),
                            // Detected copies always come from the first
                            // parent, i.e. the previous revision.
                            change.copy_from.as_ref().map(|_| next - 1),
                        ],
                    )?;
                }
            }
            Ok(next)
        })?;
        info!(latest, "revision index updated");
        Ok(latest as u64)
    }
}

/// Full changed-path computation for one commit: raw tree delta, exact
/// blob-id copy detection, and the modifications implied by attribute
/// changes (a file whose filter chain or synthesized properties change
/// reads differently even though its blob did not move).
async fn compute_changed_paths(
    store: &dyn ObjectStore,
    parent_tree: Option<ObjectId>,
    tree: ObjectId,
) -> Result<Vec<ChangedPath>> {
    let deltas = treewalk::diff_trees(store, parent_tree, tree).await?;

    // Blob ids deleted from the parent, for copy detection.
    let mut deleted_blobs: std::collections::HashMap<ObjectId, String> =
        std::collections::HashMap::new();
    if let Some(parent_tree) = parent_tree {
        for delta in &deltas {
            if delta.kind == DeltaKind::Deleted && !delta.is_dir {
                if let Some(Some(node)) =
                    treewalk::resolve(store, parent_tree, &delta.path).await.ok()
                {
                    if let treewalk::NodeRef::File { blob, .. } = node {
                        deleted_blobs.insert(blob, delta.path.clone());
                    }
                }
            }
        }
    }

    let mut out: Vec<ChangedPath> = Vec::new();
    let mut attr_dirs: Vec<String> = Vec::new();
    for delta in &deltas {
        let action = match delta.kind {
            DeltaKind::Added => ChangeAction::Added,
            DeltaKind::Deleted => ChangeAction::Deleted,
            DeltaKind::Modified => ChangeAction::Modified,
            DeltaKind::Replaced => ChangeAction::Replaced,
        };
        let copy_from = match (delta.kind, delta.new_blob) {
            (DeltaKind::Added, Some(blob)) => deleted_blobs
                .get(&blob)
                .map(|path| (path.clone(), 0u64)),
            _ => None,
        };
        if paths::basename(&delta.path) == treewalk::ATTRIBUTES_FILE {
            attr_dirs.push(paths::parent(&delta.path).unwrap_or("/").to_string());
        }
        out.push(ChangedPath {
            path: delta.path.clone(),
            action,
            copy_from,
            is_dir: delta.is_dir,
        });
    }

    // Attribute changes ripple: any file under an affected directory whose
    // effective chain or properties differ between parent and commit is
    // modified, even with an identical blob.
    if let Some(parent_tree) = parent_tree {
        let changed: std::collections::HashSet<String> =
            out.iter().map(|c| c.path.clone()).collect();
        for dir in attr_dirs {
            let Some(Some(treewalk::NodeRef::Dir { tree: new_sub })) =
                treewalk::resolve(store, tree, &dir).await.ok()
            else {
                continue;
            };
            let mut files: Vec<String> = Vec::new();
            treewalk::walk_files(store, new_sub, &dir, &mut |path, _entry| {
                if !changed.contains(&path) && paths::basename(&path) != treewalk::ATTRIBUTES_FILE
                {
                    files.push(path);
                }
            })
            .await?;
            for path in files {
                // Only files that also exist in the parent can be implicitly
                // modified; new files are already reported.
                let old = treewalk::resolve(store, parent_tree, &path).await?;
                if !matches!(old, Some(treewalk::NodeRef::File { .. })) {
                    continue;
                }
                let dir_of = paths::parent(&path).unwrap_or("/");
                let old_stack = treewalk::load_prop_stack(store, parent_tree, dir_of).await?;
                let new_stack = treewalk::load_prop_stack(store, tree, dir_of).await?;
                let differs = old_stack.filter_chain_for(&path) != new_stack.filter_chain_for(&path)
                    || old_stack.file_props(&path) != new_stack.file_props(&path);
                if differs {
                    out.push(ChangedPath {
                        path,
                        action: ChangeAction::Modified,
                        copy_from: None,
                        is_dir: false,
                    });
                }
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out.dedup_by(|a, b| a.path == b.path);
    }

    Ok(out)
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RevisionRecord> {
    let commit_blob: Vec<u8> = row.get(1)?;
    let tree_blob: Vec<u8> = row.get(2)?;
    Ok(RevisionRecord {
        rev: row.get::<_, i64>(0)? as u64,
        commit_id: ObjectId::from_bytes_or_panic(&commit_blob),
        tree_id: ObjectId::from_bytes_or_panic(&tree_blob),
        author: row.get(3)?,
        message: row.get(4)?,
        date: row.get(5)?,
    })
}

fn no_rows_to_none<T>(err: rusqlite::Error) -> rusqlite::Result<Option<T>> {
    match err {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    }
}
