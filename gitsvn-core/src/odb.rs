//! Git object database access.
//!
//! Two backends behind one trait: a loose-object store over a repository
//! directory on disk, and an in-memory store for tests. Writes are
//! append-only and idempotent; the ref is only ever moved through
//! compare-and-swap.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use gix_hash::ObjectId;
use gix_object::Kind;
use tokio::sync::RwLock;

use crate::error::{RepoError, Result};

/// Outcome of a compare-and-swap ref update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CasOutcome {
    Updated,
    /// The ref did not hold the expected id; carries what it held instead.
    Conflict { actual: Option<ObjectId> },
}

/// Content-addressed object read/write plus ref access.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Reads a raw object. `ObjectNotFound` if absent.
    async fn read(&self, id: ObjectId) -> Result<(Kind, Bytes)>;

    /// Writes a raw object, returning its id. Writing an existing object
    /// is a no-op.
    async fn write(&self, kind: Kind, data: &[u8]) -> Result<ObjectId>;

    async fn exists(&self, id: ObjectId) -> Result<bool>;

    /// Resolves a ref name (e.g. `refs/heads/master`) to an object id.
    async fn ref_id(&self, name: &str) -> Result<Option<ObjectId>>;

    /// Atomically moves `name` from `expected` to `new`.
    async fn update_ref(
        &self,
        name: &str,
        expected: Option<ObjectId>,
        new: ObjectId,
    ) -> Result<CasOutcome>;
}

fn kind_name(kind: Kind) -> &'static str {
    match kind {
        Kind::Blob => "blob",
        Kind::Tree => "tree",
        Kind::Commit => "commit",
        Kind::Tag => "tag",
    }
}

/// Reads and decodes a commit object.
pub async fn read_commit(store: &dyn ObjectStore, id: ObjectId) -> Result<gix_object::Commit> {
    let (kind, data) = store.read(id).await?;
    if kind != Kind::Commit {
        return Err(RepoError::ObjectKindMismatch {
            id,
            actual: kind_name(kind),
            expected: "commit",
        });
    }
    let object = gix_object::ObjectRef::from_bytes(kind, &data)
        .map_err(|err| RepoError::Corrupt(format!("commit {id}: {err}")))?
        .into_owned();
    gix_object::Commit::try_from(object)
        .map_err(|_| RepoError::Corrupt(format!("commit {id}: wrong payload")))
}

pub async fn read_blob(store: &dyn ObjectStore, id: ObjectId) -> Result<Bytes> {
    let (kind, data) = store.read(id).await?;
    if kind != Kind::Blob {
        return Err(RepoError::ObjectKindMismatch {
            id,
            actual: kind_name(kind),
            expected: "blob",
        });
    }
    Ok(data)
}

pub async fn read_tree(store: &dyn ObjectStore, id: ObjectId) -> Result<Tree> {
    let (kind, data) = store.read(id).await?;
    if kind != Kind::Tree {
        return Err(RepoError::ObjectKindMismatch {
            id,
            actual: kind_name(kind),
            expected: "tree",
        });
    }
    Tree::decode(id, &data)
}

/// Serializes and writes a commit object.
pub async fn write_commit(
    store: &dyn ObjectStore,
    commit: &gix_object::Commit,
) -> Result<ObjectId> {
    use gix_object::WriteTo;
    let mut buf = Vec::new();
    commit
        .write_to(&mut buf)
        .map_err(|err| RepoError::Corrupt(format!("commit encode: {err}")))?;
    store.write(Kind::Commit, &buf).await
}

pub mod mode {
    pub const DIR: u32 = 0o040000;
    pub const FILE: u32 = 0o100644;
    pub const EXECUTABLE: u32 = 0o100755;
    pub const SYMLINK: u32 = 0o120000;
    pub const GITLINK: u32 = 0o160000;
}

/// One tree entry. Entry names must be valid UTF-8; SVN paths are strings
/// and a repository with non-UTF-8 names cannot be served.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: u32,
    pub name: String,
    pub oid: ObjectId,
}

impl TreeEntry {
    pub fn is_dir(&self) -> bool {
        self.mode == mode::DIR
    }

    pub fn is_executable(&self) -> bool {
        self.mode == mode::EXECUTABLE
    }

    pub fn is_symlink(&self) -> bool {
        self.mode == mode::SYMLINK
    }
}

/// A decoded tree object.
#[derive(Clone, Debug, Default)]
pub struct Tree {
    pub entries: Vec<TreeEntry>,
}

impl Tree {
    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Decodes the canonical git tree format:
    /// repeated `"<octal mode> <name>\0" + 20 raw hash bytes`.
    pub fn decode(id: ObjectId, data: &[u8]) -> Result<Tree> {
        let corrupt = |msg: &str| RepoError::Corrupt(format!("tree {id}: {msg}"));
        let mut entries = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let space = rest
                .iter()
                .position(|&b| b == b' ')
                .ok_or_else(|| corrupt("missing mode terminator"))?;
            let mode_str =
                std::str::from_utf8(&rest[..space]).map_err(|_| corrupt("non-ascii mode"))?;
            let mode =
                u32::from_str_radix(mode_str, 8).map_err(|_| corrupt("invalid entry mode"))?;
            rest = &rest[space + 1..];

            let nul = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| corrupt("missing name terminator"))?;
            let name = std::str::from_utf8(&rest[..nul])
                .map_err(|_| corrupt("non-utf8 entry name"))?
                .to_string();
            rest = &rest[nul + 1..];

            if rest.len() < 20 {
                return Err(corrupt("truncated entry hash"));
            }
            let oid = ObjectId::from_bytes_or_panic(&rest[..20]);
            rest = &rest[20..];
            entries.push(TreeEntry { mode, name, oid });
        }
        Ok(Tree { entries })
    }

    /// Encodes in git's entry order (directories sort as `name/`).
    pub fn encode(&self) -> Vec<u8> {
        let mut sorted: Vec<&TreeEntry> = self.entries.iter().collect();
        sorted.sort_by(|a, b| git_entry_order(a).cmp(&git_entry_order(b)));
        let mut out = Vec::new();
        for entry in sorted {
            out.extend_from_slice(format!("{:o}", entry.mode).as_bytes());
            out.push(b' ');
            out.extend_from_slice(entry.name.as_bytes());
            out.push(0);
            out.extend_from_slice(entry.oid.as_slice());
        }
        out
    }
}

fn git_entry_order(entry: &TreeEntry) -> Vec<u8> {
    let mut key = entry.name.as_bytes().to_vec();
    if entry.is_dir() {
        key.push(b'/');
    }
    key
}

pub async fn write_tree(store: &dyn ObjectStore, tree: &Tree) -> Result<ObjectId> {
    store.write(Kind::Tree, &tree.encode()).await
}

/// Loose-object store over a git repository directory.
///
/// Accepts a bare repository or a worktree with a `.git` subdirectory.
/// Served repositories must keep their objects loose (no `git gc`); the
/// server writes loose objects only and never repacks.
pub struct LooseStore {
    git_dir: PathBuf,
}

impl LooseStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let dotgit = path.join(".git");
        let git_dir = if dotgit.is_dir() { dotgit } else { path.to_path_buf() };
        if !git_dir.join("objects").is_dir() {
            return Err(RepoError::Corrupt(format!(
                "{} is not a git repository (no objects directory)",
                path.display()
            )));
        }
        Ok(Self { git_dir })
    }

    /// Creates a fresh bare repository layout.
    pub fn init(path: impl AsRef<Path>) -> Result<Self> {
        let git_dir = path.as_ref().to_path_buf();
        std::fs::create_dir_all(git_dir.join("objects"))?;
        std::fs::create_dir_all(git_dir.join("refs/heads"))?;
        let head = git_dir.join("HEAD");
        if !head.exists() {
            std::fs::write(&head, b"ref: refs/heads/master\n")?;
        }
        Ok(Self { git_dir })
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    fn object_path(&self, id: ObjectId) -> PathBuf {
        let hex = id.to_string();
        self.git_dir
            .join("objects")
            .join(&hex[..2])
            .join(&hex[2..])
    }

    fn read_loose(&self, id: ObjectId) -> Result<(Kind, Bytes)> {
        let path = self.object_path(id);
        let compressed = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(RepoError::ObjectNotFound(id));
            }
            Err(err) => return Err(err.into()),
        };
        let mut raw = Vec::new();
        ZlibDecoder::new(compressed.as_slice())
            .read_to_end(&mut raw)
            .map_err(|err| RepoError::Corrupt(format!("object {id}: {err}")))?;

        let nul = raw
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| RepoError::Corrupt(format!("object {id}: missing header")))?;
        let header = std::str::from_utf8(&raw[..nul])
            .map_err(|_| RepoError::Corrupt(format!("object {id}: bad header")))?;
        let (kind_str, size_str) = header
            .split_once(' ')
            .ok_or_else(|| RepoError::Corrupt(format!("object {id}: bad header")))?;
        let kind = Kind::from_bytes(kind_str.as_bytes())
            .map_err(|_| RepoError::Corrupt(format!("object {id}: unknown kind {kind_str}")))?;
        let size: usize = size_str
            .parse()
            .map_err(|_| RepoError::Corrupt(format!("object {id}: bad size")))?;
        let payload = &raw[nul + 1..];
        if payload.len() != size {
            return Err(RepoError::Corrupt(format!(
                "object {id}: size mismatch ({} != {size})",
                payload.len()
            )));
        }
        Ok((kind, Bytes::copy_from_slice(payload)))
    }

    fn write_loose(&self, kind: Kind, data: &[u8]) -> Result<ObjectId> {
        let id = gix_object::compute_hash(gix_hash::Kind::Sha1, kind, data);
        let path = self.object_path(id);
        if path.exists() {
            return Ok(id);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut payload = Vec::with_capacity(data.len() + 32);
        payload.extend_from_slice(kind_name(kind).as_bytes());
        payload.push(b' ');
        payload.extend_from_slice(data.len().to_string().as_bytes());
        payload.push(0);
        payload.extend_from_slice(data);

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload)?;
        let compressed = encoder.finish()?;

        // Write-then-rename so a crashed write never leaves a torn object.
        let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
        std::fs::write(&tmp, compressed)?;
        std::fs::rename(&tmp, &path)?;
        Ok(id)
    }

    fn ref_path(&self, name: &str) -> PathBuf {
        self.git_dir.join(name)
    }

    fn read_ref(&self, name: &str) -> Result<Option<ObjectId>> {
        let direct = self.ref_path(name);
        match std::fs::read_to_string(&direct) {
            Ok(content) => {
                let content = content.trim();
                if let Some(target) = content.strip_prefix("ref: ") {
                    return self.read_ref(target.trim());
                }
                let id = ObjectId::from_hex(content.as_bytes())
                    .map_err(|_| RepoError::Corrupt(format!("ref {name}: bad hash")))?;
                return Ok(Some(id));
            }
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => return Err(err.into()),
            Err(_) => {}
        }
        // Fall back to packed-refs.
        let packed = match std::fs::read_to_string(self.git_dir.join("packed-refs")) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        for line in packed.lines() {
            if line.starts_with('#') || line.starts_with('^') {
                continue;
            }
            if let Some((hash, refname)) = line.split_once(' ') {
                if refname.trim() == name {
                    let id = ObjectId::from_hex(hash.trim().as_bytes())
                        .map_err(|_| RepoError::Corrupt(format!("packed ref {name}: bad hash")))?;
                    return Ok(Some(id));
                }
            }
        }
        Ok(None)
    }

    fn cas_ref(
        &self,
        name: &str,
        expected: Option<ObjectId>,
        new: ObjectId,
    ) -> Result<CasOutcome> {
        let path = self.ref_path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock_path = path.with_extension("lock");
        let mut lock = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                // Another writer holds the ref; report as a CAS miss so the
                // caller re-reads and retries.
                return Ok(CasOutcome::Conflict {
                    actual: self.read_ref(name)?,
                });
            }
            Err(err) => return Err(err.into()),
        };

        let outcome = (|| -> Result<CasOutcome> {
            let actual = self.read_ref(name)?;
            if actual != expected {
                return Ok(CasOutcome::Conflict { actual });
            }
            lock.write_all(new.to_string().as_bytes())?;
            lock.write_all(b"\n")?;
            lock.sync_all()?;
            std::fs::rename(&lock_path, &path)?;
            Ok(CasOutcome::Updated)
        })();
        if !matches!(outcome, Ok(CasOutcome::Updated)) {
            let _ = std::fs::remove_file(&lock_path);
        }
        outcome
    }
}

#[async_trait]
impl ObjectStore for LooseStore {
    async fn read(&self, id: ObjectId) -> Result<(Kind, Bytes)> {
        self.read_loose(id)
    }

    async fn write(&self, kind: Kind, data: &[u8]) -> Result<ObjectId> {
        self.write_loose(kind, data)
    }

    async fn exists(&self, id: ObjectId) -> Result<bool> {
        Ok(self.object_path(id).exists())
    }

    async fn ref_id(&self, name: &str) -> Result<Option<ObjectId>> {
        self.read_ref(name)
    }

    async fn update_ref(
        &self,
        name: &str,
        expected: Option<ObjectId>,
        new: ObjectId,
    ) -> Result<CasOutcome> {
        self.cas_ref(name, expected, new)
    }
}

/// In-memory store for tests and ephemeral repositories.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<ObjectId, (Kind, Bytes)>>,
    refs: RwLock<HashMap<String, ObjectId>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn read(&self, id: ObjectId) -> Result<(Kind, Bytes)> {
        self.objects
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(RepoError::ObjectNotFound(id))
    }

    async fn write(&self, kind: Kind, data: &[u8]) -> Result<ObjectId> {
        let id = gix_object::compute_hash(gix_hash::Kind::Sha1, kind, data);
        self.objects
            .write()
            .await
            .entry(id)
            .or_insert_with(|| (kind, Bytes::copy_from_slice(data)));
        Ok(id)
    }

    async fn exists(&self, id: ObjectId) -> Result<bool> {
        Ok(self.objects.read().await.contains_key(&id))
    }

    async fn ref_id(&self, name: &str) -> Result<Option<ObjectId>> {
        Ok(self.refs.read().await.get(name).copied())
    }

    async fn update_ref(
        &self,
        name: &str,
        expected: Option<ObjectId>,
        new: ObjectId,
    ) -> Result<CasOutcome> {
        let mut refs = self.refs.write().await;
        let actual = refs.get(name).copied();
        if actual != expected {
            return Ok(CasOutcome::Conflict { actual });
        }
        refs.insert(name.to_string(), new);
        Ok(CasOutcome::Updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(byte: u8) -> ObjectId {
        ObjectId::from_bytes_or_panic(&[byte; 20])
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        let id = store.write(Kind::Blob, b"hello").await.unwrap();
        let (kind, data) = store.read(id).await.unwrap();
        assert_eq!(kind, Kind::Blob);
        assert_eq!(&data[..], b"hello");
    }

    #[tokio::test]
    async fn loose_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LooseStore::init(dir.path()).unwrap();
        let id = store.write(Kind::Blob, b"loose bytes").await.unwrap();
        let (kind, data) = store.read(id).await.unwrap();
        assert_eq!(kind, Kind::Blob);
        assert_eq!(&data[..], b"loose bytes");
        assert!(store.exists(id).await.unwrap());
        assert!(!store.exists(oid(9)).await.unwrap());
    }

    #[tokio::test]
    async fn loose_store_blob_hash_matches_git() {
        // `echo -n 'what is up, doc?' | git hash-object --stdin`
        let dir = tempfile::tempdir().unwrap();
        let store = LooseStore::init(dir.path()).unwrap();
        let id = store.write(Kind::Blob, b"what is up, doc?").await.unwrap();
        assert_eq!(id.to_string(), "bd9dbf5aae1a3862dd1526723246b20206e5fc37");
    }

    #[tokio::test]
    async fn ref_cas_detects_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = LooseStore::init(dir.path()).unwrap();
        let a = oid(1);
        let b = oid(2);

        assert_eq!(
            store.update_ref("refs/heads/master", None, a).await.unwrap(),
            CasOutcome::Updated
        );
        assert_eq!(store.ref_id("refs/heads/master").await.unwrap(), Some(a));

        // Wrong expectation loses.
        let out = store.update_ref("refs/heads/master", None, b).await.unwrap();
        assert_eq!(out, CasOutcome::Conflict { actual: Some(a) });

        assert_eq!(
            store.update_ref("refs/heads/master", Some(a), b).await.unwrap(),
            CasOutcome::Updated
        );
    }

    #[tokio::test]
    async fn head_symref_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let store = LooseStore::init(dir.path()).unwrap();
        let a = oid(7);
        store.update_ref("refs/heads/master", None, a).await.unwrap();
        assert_eq!(store.ref_id("HEAD").await.unwrap(), Some(a));
    }

    #[test]
    fn tree_codec_roundtrip_and_order() {
        let tree = Tree {
            entries: vec![
                TreeEntry { mode: mode::FILE, name: "b.txt".into(), oid: oid(1) },
                TreeEntry { mode: mode::DIR, name: "b".into(), oid: oid(2) },
                TreeEntry { mode: mode::EXECUTABLE, name: "a".into(), oid: oid(3) },
            ],
        };
        let encoded = tree.encode();
        let decoded = Tree::decode(oid(0), &encoded).unwrap();
        // Decoded order is the canonical one: "a", "b.txt", "b/" sorts after
        // "b.txt" because directories compare with a trailing slash.
        let names: Vec<&str> = decoded.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b.txt", "b"]);
        assert!(decoded.get("b").unwrap().is_dir());
        assert!(decoded.get("a").unwrap().is_executable());
    }
}
