//! The Git-backed versioned filesystem.
//!
//! Read-only view of the repository addressed by `(revision, path)`.
//! Revision 0 is the empty root; every later revision maps to one commit
//! on the tracked ref. All derived data (filter chains, properties, MD5,
//! size) is a pure function of the tree at the addressed revision.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use gix_hash::ObjectId;
use md5::{Digest, Md5};
use rusqlite::params;
use tokio::sync::Mutex;
use tracing::debug;

use crate::db::Database;
use crate::error::{RepoError, Result};
use crate::filter::{FilterChain, FilterContext};
use crate::gitprops::{ignore_props, props, PropertyMap};
use crate::locks::LockTable;
use crate::odb::{mode, read_blob, ObjectStore};
use crate::paths;
use crate::revindex::{ChangedPath, RevisionIndex, RevisionRecord};
use crate::treewalk::{self, NodeRef};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    pub fn as_word(self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Dir => "dir",
        }
    }
}

/// A resolved `(revision, path)` node.
#[derive(Clone, Debug)]
pub struct Node {
    pub kind: NodeKind,
    pub rev: u64,
    pub path: String,
    /// Blob id for files, tree id for directories.
    pub oid: ObjectId,
    pub mode: u32,
    /// Post-filter size; 0 for directories.
    pub size: u64,
    /// MD5 of the post-filter content; empty for directories.
    pub md5: String,
    pub chain: FilterChain,
    pub created_rev: u64,
    pub created_date: i64,
    pub last_author: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Dirent {
    pub name: String,
    pub kind: NodeKind,
    pub size: u64,
    pub has_props: bool,
    pub created_rev: u64,
    pub created_date: i64,
    pub last_author: Option<String>,
}

#[derive(Clone, Debug)]
pub struct LogEntry {
    pub rev: u64,
    pub author: String,
    pub date: i64,
    pub message: String,
    pub changed: Vec<ChangedPath>,
}

#[derive(Clone, Debug)]
pub struct BlameLine {
    pub line_no: u64,
    pub rev: u64,
    pub author: String,
    pub text: Vec<u8>,
}

/// One revision of a file, for `get-file-revs`.
#[derive(Clone, Debug)]
pub struct FileRev {
    pub path: String,
    pub rev: u64,
    pub author: String,
    pub date: i64,
    pub message: String,
    pub props: PropertyMap,
    pub content: Bytes,
}

/// Formats an epoch timestamp the way SVN represents dates on the wire.
pub fn svn_date(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .unwrap_or_default()
        .format("%Y-%m-%dT%H:%M:%S%.6fZ")
        .to_string()
}

pub struct GitFs {
    store: Arc<dyn ObjectStore>,
    db: Arc<Database>,
    index: RevisionIndex,
    locks: LockTable,
    filter_ctx: FilterContext,
    ref_name: String,
    uuid: String,
    /// Serializes observation triggered by index misses.
    rescan: Mutex<()>,
}

impl GitFs {
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        db: Arc<Database>,
        ref_name: impl Into<String>,
        filter_ctx: FilterContext,
    ) -> Result<Arc<Self>> {
        let uuid = match db.get_meta("uuid")? {
            Some(uuid) => uuid,
            None => {
                let uuid = uuid::Uuid::new_v4().to_string();
                db.set_meta("uuid", &uuid)?;
                uuid
            }
        };
        let fs = Arc::new(Self {
            store,
            index: RevisionIndex::new(db.clone()),
            locks: LockTable::new(db.clone()),
            db,
            filter_ctx,
            ref_name: ref_name.into(),
            uuid,
            rescan: Mutex::new(()),
        });
        fs.observe().await?;
        Ok(fs)
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn ref_name(&self) -> &str {
        &self.ref_name
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn index(&self) -> &RevisionIndex {
        &self.index
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn filter_ctx(&self) -> &FilterContext {
        &self.filter_ctx
    }

    pub fn latest_rev(&self) -> Result<u64> {
        self.index.latest()
    }

    pub fn rev_for_date(&self, ts: i64) -> Result<u64> {
        self.index.rev_for_date(ts)
    }

    /// Indexes any commits that reached the tracked ref since the last
    /// observation.
    pub async fn observe(&self) -> Result<u64> {
        let _guard = self.rescan.lock().await;
        self.index.observe(self.store.as_ref(), &self.ref_name).await
    }

    /// Revision record, with one re-scan on a miss (the ref may have moved
    /// under us).
    pub async fn revision(&self, rev: u64) -> Result<RevisionRecord> {
        match self.index.by_rev(rev) {
            Ok(record) => Ok(record),
            Err(RepoError::RevisionNotFound(_)) => {
                debug!(rev, "revision miss, re-scanning ref");
                self.observe().await?;
                self.index.by_rev(rev)
            }
            Err(err) => Err(err),
        }
    }

    /// Root tree of `rev`; `None` for the empty revision 0.
    pub async fn root_tree(&self, rev: u64) -> Result<Option<ObjectId>> {
        if rev == 0 {
            return Ok(None);
        }
        Ok(Some(self.revision(rev).await?.tree_id))
    }

    pub async fn check_path(&self, rev: u64, path: &str) -> Result<Option<NodeKind>> {
        let path = paths::canonical(path);
        if path == "/" {
            // The root exists at every revision, including 0.
            return Ok(Some(NodeKind::Dir));
        }
        let Some(root) = self.root_tree(rev).await? else {
            return Ok(None);
        };
        Ok(treewalk::resolve(self.store.as_ref(), root, &path)
            .await?
            .map(|node| match node {
                NodeRef::Dir { .. } => NodeKind::Dir,
                NodeRef::File { .. } => NodeKind::File,
            }))
    }

    /// Full node resolution. `Ok(None)` when absent.
    pub async fn stat(&self, rev: u64, path: &str) -> Result<Option<Node>> {
        let path = paths::canonical(path);
        if rev == 0 {
            return Ok(if path == "/" {
                Some(self.empty_root())
            } else {
                None
            });
        }
        let record = self.revision(rev).await?;
        let node = if path == "/" {
            Some(NodeRef::Dir { tree: record.tree_id })
        } else {
            treewalk::resolve(self.store.as_ref(), record.tree_id, &path).await?
        };
        let Some(node) = node else { return Ok(None) };

        let created_rev = self.index.last_changed(&path, rev)?;
        let created = self.index.by_rev(created_rev).ok();
        let (created_date, last_author) = created
            .map(|r| (r.date, Some(r.author)))
            .unwrap_or((record.date, None));

        match node {
            NodeRef::Dir { tree } => Ok(Some(Node {
                kind: NodeKind::Dir,
                rev,
                path,
                oid: tree,
                mode: mode::DIR,
                size: 0,
                md5: String::new(),
                chain: FilterChain::identity(),
                created_rev,
                created_date,
                last_author,
            })),
            NodeRef::File { blob, mode: file_mode } => {
                let chain = self.chain_for(record.tree_id, &path).await?;
                let (md5, size) = self.content_meta(blob, &chain).await?;
                Ok(Some(Node {
                    kind: NodeKind::File,
                    rev,
                    path,
                    oid: blob,
                    mode: file_mode,
                    size,
                    md5,
                    chain,
                    created_rev,
                    created_date,
                    last_author,
                }))
            }
        }
    }

    /// Post-filter file content.
    pub async fn read(&self, rev: u64, path: &str) -> Result<Bytes> {
        let path = paths::canonical(path);
        let node = self
            .stat(rev, &path)
            .await?
            .ok_or_else(|| RepoError::PathNotFound { path: path.clone(), rev })?;
        if node.kind != NodeKind::File {
            return Err(RepoError::NodeKindMismatch { path, rev, expected: "file" });
        }
        self.read_node(&node).await
    }

    pub async fn read_node(&self, node: &Node) -> Result<Bytes> {
        let stored = read_blob(self.store.as_ref(), node.oid).await?;
        node.chain.decode(&self.filter_ctx, stored)
    }

    /// Directory listing, sorted lexicographically.
    pub async fn list(&self, rev: u64, path: &str) -> Result<Vec<Dirent>> {
        let path = paths::canonical(path);
        if rev == 0 && path == "/" {
            return Ok(Vec::new());
        }
        let record = self.revision(rev).await?;
        let node = if path == "/" {
            Some(NodeRef::Dir { tree: record.tree_id })
        } else {
            treewalk::resolve(self.store.as_ref(), record.tree_id, &path).await?
        };
        let tree = match node {
            Some(NodeRef::Dir { tree }) => tree,
            Some(NodeRef::File { .. }) => {
                return Err(RepoError::NodeKindMismatch { path, rev, expected: "directory" });
            }
            None => return Err(RepoError::PathNotFound { path, rev }),
        };

        let tree = crate::odb::read_tree(self.store.as_ref(), tree).await?;
        let stack = treewalk::load_prop_stack(self.store.as_ref(), record.tree_id, &path).await?;
        let mut out = Vec::with_capacity(tree.entries.len());
        for entry in &tree.entries {
            let child = paths::join(&path, &entry.name);
            let created_rev = self.index.last_changed(&child, rev)?;
            let created = self.index.by_rev(created_rev).ok();
            let (created_date, last_author) = created
                .map(|r| (r.date, Some(r.author)))
                .unwrap_or((record.date, None));
            if entry.is_dir() {
                out.push(Dirent {
                    name: entry.name.clone(),
                    kind: NodeKind::Dir,
                    size: 0,
                    has_props: false,
                    created_rev,
                    created_date,
                    last_author,
                });
            } else {
                let chain = stack.filter_chain_for(&child);
                let (_, size) = self.content_meta(entry.oid, &chain).await?;
                let has_props = !stack.file_props(&child).is_empty()
                    || entry.is_executable()
                    || entry.is_symlink();
                out.push(Dirent {
                    name: entry.name.clone(),
                    kind: NodeKind::File,
                    size,
                    has_props,
                    created_rev,
                    created_date,
                    last_author,
                });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Synthesized properties. Internal (`gitsvn:`) properties are only
    /// included when asked for; they never go on the wire.
    pub async fn properties(
        &self,
        rev: u64,
        path: &str,
        include_internal: bool,
    ) -> Result<PropertyMap> {
        let path = paths::canonical(path);
        if rev == 0 {
            return Ok(PropertyMap::new());
        }
        let record = self.revision(rev).await?;
        let node = if path == "/" {
            Some(NodeRef::Dir { tree: record.tree_id })
        } else {
            treewalk::resolve(self.store.as_ref(), record.tree_id, &path).await?
        };
        let Some(node) = node else {
            return Err(RepoError::PathNotFound { path, rev });
        };

        let mut map = match &node {
            NodeRef::File { mode: file_mode, .. } => {
                let dir = paths::parent(&path).unwrap_or("/");
                let stack =
                    treewalk::load_prop_stack(self.store.as_ref(), record.tree_id, dir).await?;
                let mut map = stack.file_props(&path);
                if *file_mode == mode::EXECUTABLE {
                    map.insert(props::EXECUTABLE.to_string(), b"*".to_vec());
                }
                if *file_mode == mode::SYMLINK {
                    map.insert(props::SPECIAL.to_string(), b"*".to_vec());
                }
                map
            }
            NodeRef::Dir { tree } => {
                let mut map = PropertyMap::new();
                let tree = crate::odb::read_tree(self.store.as_ref(), *tree).await?;
                if let Some(entry) = tree.get(treewalk::IGNORE_FILE) {
                    if !entry.is_dir() {
                        let content = read_blob(self.store.as_ref(), entry.oid).await?;
                        map.append(&mut ignore_props(&content));
                    }
                }
                if path == "/" {
                    let stack =
                        treewalk::load_prop_stack(self.store.as_ref(), record.tree_id, "/").await?;
                    if let Some(auto) = stack.auto_props() {
                        map.insert(props::AUTO_PROPS.to_string(), auto);
                    }
                }
                map
            }
        };
        if !include_internal {
            map.retain(|name, _| !props::is_internal(name));
        }
        Ok(map)
    }

    /// Revision properties (`svn:author`, `svn:date`, `svn:log`).
    pub async fn rev_props(&self, rev: u64) -> Result<PropertyMap> {
        let mut map = PropertyMap::new();
        if rev == 0 {
            map.insert("svn:date".to_string(), svn_date(0).into_bytes());
            return Ok(map);
        }
        let record = self.revision(rev).await?;
        map.insert("svn:author".to_string(), record.author.into_bytes());
        map.insert("svn:date".to_string(), svn_date(record.date).into_bytes());
        map.insert("svn:log".to_string(), record.message.into_bytes());
        Ok(map)
    }

    /// Log entries for `targets` between `start` and `end` (either order),
    /// bounded by `limit` when non-zero.
    pub async fn log(
        &self,
        targets: &[String],
        start: u64,
        end: u64,
        limit: u64,
        include_changed: bool,
    ) -> Result<Vec<LogEntry>> {
        let (lo, hi, reverse) = if start <= end {
            (start, end, false)
        } else {
            (end, start, true)
        };
        let targets: Vec<String> = targets.iter().map(|p| paths::canonical(p)).collect();
        let mut revs = self.index.revs_touching(&targets, lo.max(1), hi)?;
        if reverse {
            revs.reverse();
        }
        let mut out = Vec::new();
        for rev in revs {
            if limit != 0 && out.len() as u64 >= limit {
                break;
            }
            let record = self.index.by_rev(rev)?;
            let changed = if include_changed {
                self.index.changed_paths(rev)?
            } else {
                Vec::new()
            };
            out.push(LogEntry {
                rev,
                author: record.author,
                date: record.date,
                message: record.message,
                changed,
            });
        }
        Ok(out)
    }

    /// `(revision, path)` pairs for a node's history, newest first.
    pub async fn history(&self, path: &str, peg_rev: u64) -> Result<Vec<(u64, String)>> {
        let path = paths::canonical(path);
        self.index.history(&path, peg_rev)
    }

    /// Maps `path` at `peg_rev` onto each of `revs`.
    pub async fn locations(
        &self,
        path: &str,
        peg_rev: u64,
        revs: &[u64],
    ) -> Result<Vec<(u64, String)>> {
        let history = self.history(path, peg_rev).await?;
        let mut out = Vec::new();
        for &want in revs {
            // The node's path at `want` is the path of the last history
            // entry at or before it.
            let mut found = None;
            for (rev, hist_path) in &history {
                if *rev <= want {
                    found = Some((want, hist_path.clone()));
                    break;
                }
            }
            if let Some(entry) = found {
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Every revision of a file in `[start, end]`, oldest first, with its
    /// post-filter content.
    pub async fn file_revs(&self, path: &str, start: u64, end: u64) -> Result<Vec<FileRev>> {
        let path = paths::canonical(path);
        let node = self
            .stat(end, &path)
            .await?
            .ok_or_else(|| RepoError::PathNotFound { path: path.clone(), rev: end })?;
        if node.kind != NodeKind::File {
            return Err(RepoError::NodeKindMismatch { path, rev: end, expected: "file" });
        }
        let mut history = self.index.history(&path, end)?;
        history.retain(|(rev, _)| *rev >= start.max(1));
        history.reverse(); // oldest first
        let mut out = Vec::new();
        for (rev, hist_path) in history {
            let record = self.index.by_rev(rev)?;
            let content = self.read(rev, &hist_path).await?;
            let props = self.properties(rev, &hist_path, false).await?;
            out.push(FileRev {
                path: hist_path,
                rev,
                author: record.author,
                date: record.date,
                message: record.message,
                props,
                content,
            });
        }
        Ok(out)
    }

    /// Line-by-line attribution of a file at `rev`.
    pub async fn blame(&self, path: &str, rev: u64) -> Result<Vec<BlameLine>> {
        let revs = self.file_revs(path, 1, rev).await?;
        let mut lines: Vec<(u64, Vec<u8>)> = Vec::new();
        for file_rev in &revs {
            let new_lines = split_lines(&file_rev.content);
            lines = attribute_lines(&lines, &new_lines, file_rev.rev);
        }
        let authors: HashMap<u64, String> = revs
            .iter()
            .map(|fr| (fr.rev, fr.author.clone()))
            .collect();
        Ok(lines
            .into_iter()
            .enumerate()
            .map(|(idx, (rev, text))| BlameLine {
                line_no: idx as u64 + 1,
                rev,
                author: authors.get(&rev).cloned().unwrap_or_default(),
                text,
            })
            .collect())
    }

    /// Cached `(md5, size)` of a blob seen through a filter chain.
    async fn content_meta(&self, blob: ObjectId, chain: &FilterChain) -> Result<(String, u64)> {
        let key = chain.cache_key();
        let cached: Option<(Vec<u8>, i64)> = self.db.with(|conn| {
            conn.query_row(
                "SELECT md5, size FROM content_meta WHERE blob_id = ?1 AND chain = ?2",
                params![blob.as_slice(), key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?;
        if let Some((md5, size)) = cached {
            return Ok((hex::encode(md5), size as u64));
        }

        let stored = read_blob(self.store.as_ref(), blob).await?;
        let content = chain.decode(&self.filter_ctx, stored)?;
        let digest = Md5::digest(&content);
        let size = content.len() as u64;
        self.db.with(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO content_meta (blob_id, chain, md5, size)
                 VALUES (?1, ?2, ?3, ?4)",
                params![blob.as_slice(), key, digest.as_slice(), size as i64],
            )
        })?;
        Ok((hex::encode(digest), size))
    }

    /// The attribute layers governing `dir` at `rev`; empty at revision 0.
    pub async fn prop_stack(&self, rev: u64, dir: &str) -> Result<crate::gitprops::PropertyStack> {
        match self.root_tree(rev).await? {
            Some(root) => {
                treewalk::load_prop_stack(self.store.as_ref(), root, &paths::canonical(dir)).await
            }
            None => Ok(crate::gitprops::PropertyStack::default()),
        }
    }

    /// The filter chain a path has under a given root tree.
    pub async fn chain_for(&self, root_tree: ObjectId, path: &str) -> Result<FilterChain> {
        let dir = paths::parent(path).unwrap_or("/");
        let stack = treewalk::load_prop_stack(self.store.as_ref(), root_tree, dir).await?;
        Ok(stack.filter_chain_for(path))
    }

    fn empty_root(&self) -> Node {
        Node {
            kind: NodeKind::Dir,
            rev: 0,
            path: "/".to_string(),
            oid: ObjectId::null(gix_hash::Kind::Sha1),
            mode: mode::DIR,
            size: 0,
            md5: String::new(),
            chain: FilterChain::identity(),
            created_rev: 0,
            created_date: 0,
            last_author: None,
        }
    }
}

fn split_lines(content: &[u8]) -> Vec<Vec<u8>> {
    if content.is_empty() {
        return Vec::new();
    }
    content
        .split_inclusive(|&b| b == b'\n')
        .map(|line| line.to_vec())
        .collect()
}

/// Re-attributes `old` lines onto `new` content: lines kept by the longest
/// common subsequence keep their revision, everything else belongs to
/// `new_rev`.
fn attribute_lines(old: &[(u64, Vec<u8>)], new: &[Vec<u8>], new_rev: u64) -> Vec<(u64, Vec<u8>)> {
    const MAX_LCS_LINES: usize = 10_000;
    if old.is_empty() || old.len() > MAX_LCS_LINES || new.len() > MAX_LCS_LINES {
        return new.iter().map(|line| (new_rev, line.clone())).collect();
    }

    // Standard LCS table over line contents.
    let n = old.len();
    let m = new.len();
    let mut table = vec![0u32; (n + 1) * (m + 1)];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i * (m + 1) + j] = if old[i].1 == new[j] {
                table[(i + 1) * (m + 1) + j + 1] + 1
            } else {
                table[(i + 1) * (m + 1) + j].max(table[i * (m + 1) + j + 1])
            };
        }
    }

    let mut out = Vec::with_capacity(m);
    let (mut i, mut j) = (0usize, 0usize);
    while i < n && j < m {
        if old[i].1 == new[j] {
            out.push((old[i].0, new[j].clone()));
            i += 1;
            j += 1;
        } else if table[(i + 1) * (m + 1) + j] >= table[i * (m + 1) + j + 1] {
            i += 1;
        } else {
            out.push((new_rev, new[j].clone()));
            j += 1;
        }
    }
    while j < m {
        out.push((new_rev, new[j].clone()));
        j += 1;
    }
    out
}
