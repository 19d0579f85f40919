//! Editor-driven commit builder.
//!
//! An [`EditorSession`] accepts the SVN editor operation stream, stages the
//! change set in memory, then materializes git trees, writes one commit and
//! advances the tracked ref with compare-and-swap. Nothing is visible to
//! readers until the ref moves; on any failure the staged state is dropped
//! whole (orphaned blobs are reclaimed by git gc).
//!
//! Filters are resolved in a second pass: staged contents are encoded only
//! after the final `.gitattributes` state of the commit is known, so adding
//! a file before or after its attributes produces the same result.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use gix_hash::ObjectId;
use md5::{Digest, Md5};
use tracing::{debug, info, warn};

use gitsvn_protocol::DeltaApplier;

use crate::error::{RepoError, Result};
use crate::filter::FilterChain;
use crate::gitprops::{props, AttrRules, PropertyStack};
use crate::odb::{mode, read_blob, read_tree, write_commit, write_tree, CasOutcome, Tree, TreeEntry};
use crate::paths;
use crate::treewalk::{self, NodeRef, ATTRIBUTES_FILE};
use crate::vfs::GitFs;

const DEFAULT_CAS_RETRIES: u32 = 3;

#[derive(Clone, Debug)]
pub struct CommitOptions {
    pub base_rev: u64,
    pub message: String,
    pub author: String,
    /// Path to lock token, as supplied by the client.
    pub lock_tokens: HashMap<String, String>,
    pub keep_locks: bool,
}

#[derive(Clone, Debug)]
pub struct CommitResult {
    pub rev: u64,
    pub date: i64,
    pub author: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    Open,
    Closed,
    Aborted,
}

/// Client-visible content of a staged file.
#[derive(Clone, Debug)]
enum StagedContent {
    /// A stored blob plus the chain that decodes it (unchanged or copied
    /// content).
    Stored { blob: ObjectId, chain: FilterChain },
    /// Fresh post-filter bytes from a text delta.
    Raw(Vec<u8>),
}

#[derive(Clone, Debug)]
struct StagedFile {
    content: StagedContent,
    executable: bool,
    props: BTreeMap<String, Option<Vec<u8>>>,
}

/// Where a staged directory's unstaged children come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DirBase {
    /// Freshly added (or copied with every child staged explicitly).
    New,
    /// An existing directory; children resolve through the base tree.
    Inherit,
}

#[derive(Clone, Debug)]
enum StagedEntry {
    Deleted,
    Dir {
        base: DirBase,
        props: BTreeMap<String, Option<Vec<u8>>>,
    },
    File(StagedFile),
}

struct OpenFileFrame {
    path: String,
    file: StagedFile,
    applier: Option<DeltaApplier>,
}

pub struct EditorSession {
    fs: Arc<GitFs>,
    options: CommitOptions,
    base_tree: Option<ObjectId>,
    base_commit: Option<ObjectId>,
    /// Canonical path -> staged change; untouched paths are absent.
    staged: BTreeMap<String, StagedEntry>,
    dir_stack: Vec<String>,
    open_file: Option<OpenFileFrame>,
    state: SessionState,
}

impl EditorSession {
    pub async fn begin(fs: Arc<GitFs>, options: CommitOptions) -> Result<EditorSession> {
        let (base_commit, base_tree) = if options.base_rev == 0 {
            (None, None)
        } else {
            let record = fs.revision(options.base_rev).await?;
            (Some(record.commit_id), Some(record.tree_id))
        };
        Ok(EditorSession {
            fs,
            options,
            base_tree,
            base_commit,
            staged: BTreeMap::new(),
            dir_stack: Vec::new(),
            open_file: None,
            state: SessionState::Open,
        })
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    fn check_open(&self, op: &str) -> Result<()> {
        match self.state {
            SessionState::Open => Ok(()),
            _ => Err(RepoError::IllegalEditorState(format!(
                "{op} after close or abort"
            ))),
        }
    }

    fn check_no_open_file(&self, op: &str) -> Result<()> {
        if self.open_file.is_some() {
            return Err(RepoError::IllegalEditorState(format!(
                "{op} while a file is open"
            )));
        }
        Ok(())
    }

    pub fn open_root(&mut self) -> Result<()> {
        self.check_open("open-root")?;
        if !self.dir_stack.is_empty() {
            return Err(RepoError::IllegalEditorState("root opened twice".into()));
        }
        self.dir_stack.push("/".to_string());
        Ok(())
    }

    fn check_root_open(&self, op: &str) -> Result<()> {
        if self.dir_stack.is_empty() {
            return Err(RepoError::IllegalEditorState(format!(
                "{op} before open-root"
            )));
        }
        Ok(())
    }

    /// `rev` is the revision the client believes it is changing; a later
    /// change to the same path makes the edit out of date.
    async fn check_up_to_date(&self, path: &str, rev: Option<u64>) -> Result<()> {
        let Some(rev) = rev else { return Ok(()) };
        if rev >= self.options.base_rev {
            return Ok(());
        }
        let last = self.fs.index().last_changed(path, self.options.base_rev)?;
        if last > rev {
            return Err(RepoError::OutOfDate {
                paths: vec![path.to_string()],
            });
        }
        Ok(())
    }

    /// Resolves a path against the staged overlay, falling back to the
    /// base tree. The nearest staged ancestor decides.
    async fn resolve_staged(&self, path: &str) -> Result<Option<NodeRef>> {
        let placeholder = ObjectId::null(gix_hash::Kind::Sha1);
        let mut probe = path.to_string();
        loop {
            if let Some(entry) = self.staged.get(&probe) {
                match entry {
                    StagedEntry::Deleted => return Ok(None),
                    StagedEntry::File(_) if probe == path => {
                        // Mode/oid are not final yet; a placeholder ref is
                        // enough for existence checks.
                        return Ok(Some(NodeRef::File {
                            blob: placeholder,
                            mode: mode::FILE,
                        }));
                    }
                    StagedEntry::File(_) => return Ok(None),
                    StagedEntry::Dir { base, .. } => {
                        if probe == path {
                            return Ok(Some(NodeRef::Dir { tree: placeholder }));
                        }
                        match base {
                            // Nothing exists under a fresh directory unless
                            // staged, and deeper staged paths were already
                            // probed.
                            DirBase::New => return Ok(None),
                            DirBase::Inherit => break,
                        }
                    }
                }
            }
            match paths::parent(&probe) {
                Some(parent) => probe = parent.to_string(),
                None => break,
            }
        }
        match self.base_tree {
            Some(root) => treewalk::resolve(self.fs.store().as_ref(), root, path).await,
            None => Ok(None),
        }
    }

    pub async fn delete_entry(&mut self, path: &str, rev: Option<u64>) -> Result<()> {
        self.check_open("delete-entry")?;
        self.check_root_open("delete-entry")?;
        self.check_no_open_file("delete-entry")?;
        let path = paths::canonical(path);
        if self.resolve_staged(&path).await?.is_none() {
            return Err(RepoError::PathNotFound {
                path,
                rev: self.options.base_rev,
            });
        }
        self.check_up_to_date(&path, rev).await?;
        self.drop_staged_below(&path);
        self.staged.insert(path, StagedEntry::Deleted);
        Ok(())
    }

    pub async fn add_dir(&mut self, path: &str, copy: Option<(String, u64)>) -> Result<()> {
        self.check_open("add-dir")?;
        self.check_root_open("add-dir")?;
        self.check_no_open_file("add-dir")?;
        let path = paths::canonical(path);
        if self.resolve_staged(&path).await?.is_some() {
            return Err(RepoError::AlreadyExists(path));
        }
        match copy {
            None => {
                self.staged.insert(
                    path.clone(),
                    StagedEntry::Dir {
                        base: DirBase::New,
                        props: BTreeMap::new(),
                    },
                );
            }
            Some((from_path, from_rev)) => {
                self.stage_copied_dir(&path, &from_path, from_rev).await?;
            }
        }
        self.dir_stack.push(path);
        Ok(())
    }

    /// Copies stage every file of the source subtree explicitly, carrying
    /// the source filter chain so content survives a chain change at the
    /// destination.
    async fn stage_copied_dir(&mut self, path: &str, from_path: &str, from_rev: u64) -> Result<()> {
        let from_path = paths::canonical(from_path);
        let record = self.fs.revision(from_rev).await?;
        let source = treewalk::resolve(self.fs.store().as_ref(), record.tree_id, &from_path)
            .await?
            .ok_or_else(|| RepoError::PathNotFound {
                path: from_path.clone(),
                rev: from_rev,
            })?;
        let NodeRef::Dir { tree } = source else {
            return Err(RepoError::NodeKindMismatch {
                path: from_path,
                rev: from_rev,
                expected: "directory",
            });
        };
        self.staged.insert(
            path.to_string(),
            StagedEntry::Dir {
                base: DirBase::New,
                props: BTreeMap::new(),
            },
        );

        let mut pending: Vec<(String, String, ObjectId)> =
            vec![(path.to_string(), from_path.clone(), tree)];
        while let Some((dest_dir, src_dir, tree_id)) = pending.pop() {
            let tree = read_tree(self.fs.store().as_ref(), tree_id).await?;
            for entry in &tree.entries {
                let dest = paths::join(&dest_dir, &entry.name);
                let src = paths::join(&src_dir, &entry.name);
                if entry.is_dir() {
                    self.staged.insert(
                        dest.clone(),
                        StagedEntry::Dir {
                            base: DirBase::New,
                            props: BTreeMap::new(),
                        },
                    );
                    pending.push((dest, src, entry.oid));
                } else {
                    let chain = self.fs.chain_for(record.tree_id, &src).await?;
                    self.staged.insert(
                        dest,
                        StagedEntry::File(StagedFile {
                            content: StagedContent::Stored {
                                blob: entry.oid,
                                chain,
                            },
                            executable: entry.is_executable(),
                            props: BTreeMap::new(),
                        }),
                    );
                }
            }
        }
        Ok(())
    }

    pub async fn open_dir(&mut self, path: &str, rev: Option<u64>) -> Result<()> {
        self.check_open("open-dir")?;
        self.check_root_open("open-dir")?;
        self.check_no_open_file("open-dir")?;
        let path = paths::canonical(path);
        match self.resolve_staged(&path).await? {
            Some(NodeRef::Dir { .. }) => {}
            Some(NodeRef::File { .. }) => {
                return Err(RepoError::NodeKindMismatch {
                    path,
                    rev: self.options.base_rev,
                    expected: "directory",
                });
            }
            None => {
                return Err(RepoError::PathNotFound {
                    path,
                    rev: self.options.base_rev,
                });
            }
        }
        self.check_up_to_date(&path, rev).await?;
        self.dir_stack.push(path);
        Ok(())
    }

    pub fn change_dir_prop(&mut self, name: &str, value: Option<Vec<u8>>) -> Result<()> {
        self.check_open("change-dir-prop")?;
        let Some(dir) = self.dir_stack.last().cloned() else {
            return Err(RepoError::IllegalEditorState(
                "change-dir-prop without an open directory".into(),
            ));
        };
        let entry = self.staged.entry(dir).or_insert_with(|| StagedEntry::Dir {
            base: DirBase::Inherit,
            props: BTreeMap::new(),
        });
        if let StagedEntry::Dir { props, .. } = entry {
            props.insert(name.to_string(), value);
        }
        Ok(())
    }

    pub fn close_dir(&mut self) -> Result<()> {
        self.check_open("close-dir")?;
        self.check_no_open_file("close-dir")?;
        if self.dir_stack.pop().is_none() {
            return Err(RepoError::IllegalEditorState(
                "close-dir without an open directory".into(),
            ));
        }
        Ok(())
    }

    pub async fn add_file(&mut self, path: &str, copy: Option<(String, u64)>) -> Result<()> {
        self.check_open("add-file")?;
        self.check_root_open("add-file")?;
        self.check_no_open_file("add-file")?;
        let path = paths::canonical(path);
        if self.resolve_staged(&path).await?.is_some() {
            return Err(RepoError::AlreadyExists(path));
        }
        let file = match copy {
            None => StagedFile {
                content: StagedContent::Raw(Vec::new()),
                executable: false,
                props: BTreeMap::new(),
            },
            Some((from_path, from_rev)) => {
                let from_path = paths::canonical(&from_path);
                let node = self
                    .fs
                    .stat(from_rev, &from_path)
                    .await?
                    .ok_or_else(|| RepoError::PathNotFound {
                        path: from_path.clone(),
                        rev: from_rev,
                    })?;
                if node.kind != crate::vfs::NodeKind::File {
                    return Err(RepoError::NodeKindMismatch {
                        path: from_path,
                        rev: from_rev,
                        expected: "file",
                    });
                }
                StagedFile {
                    content: StagedContent::Stored {
                        blob: node.oid,
                        chain: node.chain,
                    },
                    executable: node.mode == mode::EXECUTABLE,
                    props: BTreeMap::new(),
                }
            }
        };
        self.open_file = Some(OpenFileFrame {
            path,
            file,
            applier: None,
        });
        Ok(())
    }

    pub async fn open_file(&mut self, path: &str, rev: Option<u64>) -> Result<()> {
        self.check_open("open-file")?;
        self.check_root_open("open-file")?;
        self.check_no_open_file("open-file")?;
        let path = paths::canonical(path);
        self.check_up_to_date(&path, rev).await?;

        // Start from the staged version when this edit already touched the
        // path, otherwise from the base revision.
        let file = if let Some(StagedEntry::File(file)) = self.staged.get(&path) {
            file.clone()
        } else {
            match self.resolve_staged(&path).await? {
                Some(NodeRef::File { blob, mode: m }) => {
                    let chain = match self.base_tree {
                        Some(root) => self.fs.chain_for(root, &path).await?,
                        None => FilterChain::identity(),
                    };
                    StagedFile {
                        content: StagedContent::Stored { blob, chain },
                        executable: m == mode::EXECUTABLE,
                        props: BTreeMap::new(),
                    }
                }
                Some(NodeRef::Dir { .. }) => {
                    return Err(RepoError::NodeKindMismatch {
                        path,
                        rev: self.options.base_rev,
                        expected: "file",
                    });
                }
                None => {
                    return Err(RepoError::PathNotFound {
                        path,
                        rev: self.options.base_rev,
                    });
                }
            }
        };
        self.open_file = Some(OpenFileFrame {
            path,
            file,
            applier: None,
        });
        Ok(())
    }

    pub fn change_file_prop(&mut self, name: &str, value: Option<Vec<u8>>) -> Result<()> {
        self.check_open("change-file-prop")?;
        let frame = self.open_file.as_mut().ok_or_else(|| {
            RepoError::IllegalEditorState("change-file-prop without an open file".into())
        })?;
        if name == props::EXECUTABLE {
            frame.file.executable = value.is_some();
        }
        frame.file.props.insert(name.to_string(), value);
        Ok(())
    }

    pub async fn apply_textdelta(&mut self, base_checksum: Option<String>) -> Result<()> {
        self.check_open("apply-textdelta")?;
        let frame = self.open_file.as_mut().ok_or_else(|| {
            RepoError::IllegalEditorState("apply-textdelta without an open file".into())
        })?;
        if frame.applier.is_some() {
            return Err(RepoError::IllegalEditorState(
                "apply-textdelta issued twice".into(),
            ));
        }
        let base: Vec<u8> = match &frame.file.content {
            StagedContent::Raw(bytes) => bytes.clone(),
            StagedContent::Stored { blob, chain } => {
                let stored = read_blob(self.fs.store().as_ref(), *blob).await?;
                chain.decode(self.fs.filter_ctx(), stored)?.to_vec()
            }
        };
        if let Some(expected) = base_checksum {
            let actual = hex::encode(Md5::digest(&base));
            if actual != expected.to_lowercase() {
                return Err(RepoError::ChecksumMismatch {
                    path: frame.path.clone(),
                    expected,
                    actual,
                });
            }
        }
        frame.applier = Some(DeltaApplier::new(base));
        Ok(())
    }

    pub fn textdelta_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.check_open("textdelta-chunk")?;
        let frame = self.open_file.as_mut().ok_or_else(|| {
            RepoError::IllegalEditorState("textdelta-chunk without an open file".into())
        })?;
        let applier = frame.applier.as_mut().ok_or_else(|| {
            RepoError::IllegalEditorState("textdelta-chunk without apply-textdelta".into())
        })?;
        applier
            .push(chunk)
            .map_err(|err| RepoError::Filter(err.to_string()))
    }

    pub fn textdelta_end(&mut self) -> Result<()> {
        self.check_open("textdelta-end")?;
        let frame = self.open_file.as_mut().ok_or_else(|| {
            RepoError::IllegalEditorState("textdelta-end without an open file".into())
        })?;
        let applier = frame.applier.take().ok_or_else(|| {
            RepoError::IllegalEditorState("textdelta-end without apply-textdelta".into())
        })?;
        let content = applier
            .finish()
            .map_err(|err| RepoError::Filter(err.to_string()))?;
        frame.file.content = StagedContent::Raw(content);
        Ok(())
    }

    pub fn close_file(&mut self, checksum: Option<String>) -> Result<()> {
        self.check_open("close-file")?;
        let frame = self.open_file.take().ok_or_else(|| {
            RepoError::IllegalEditorState("close-file without an open file".into())
        })?;
        if frame.applier.is_some() {
            return Err(RepoError::IllegalEditorState(
                "close-file inside an unfinished text delta".into(),
            ));
        }
        if let (Some(expected), StagedContent::Raw(bytes)) = (&checksum, &frame.file.content) {
            let actual = hex::encode(Md5::digest(bytes));
            if actual != expected.to_lowercase() {
                return Err(RepoError::ChecksumMismatch {
                    path: frame.path,
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        self.staged.insert(frame.path, StagedEntry::File(frame.file));
        Ok(())
    }

    pub fn abort(&mut self) {
        if self.state == SessionState::Open {
            debug!("editor aborted");
            self.state = SessionState::Aborted;
            self.staged.clear();
            self.open_file = None;
            self.dir_stack.clear();
        }
    }

    /// Finishes the drive: materializes the tree, writes the commit and
    /// moves the ref, rebasing onto a moved head up to a bounded number of
    /// times.
    pub async fn close_edit(&mut self) -> Result<CommitResult> {
        self.check_open("close-edit")?;
        self.check_no_open_file("close-edit")?;
        if self.staged.is_empty() {
            self.state = SessionState::Aborted;
            return Err(RepoError::IllegalEditorState("empty commit".into()));
        }

        let result = self.commit_with_retries().await;
        match result {
            Ok(result) => {
                self.state = SessionState::Closed;
                Ok(result)
            }
            Err(err) => {
                self.abort();
                Err(err)
            }
        }
    }

    async fn commit_with_retries(&mut self) -> Result<CommitResult> {
        let touched: Vec<String> = self.staged.keys().cloned().collect();
        for path in &touched {
            self.fs.locks().check_token(path, &self.options.lock_tokens)?;
        }

        let mut expected = self.base_commit;
        let mut base_tree = self.base_tree;
        for attempt in 0..=DEFAULT_CAS_RETRIES {
            let tree_id = Materializer::new(self).run(base_tree).await?;
            let now = Utc::now().timestamp();
            let signature = gix_actor::Signature {
                name: self.options.author.clone().into(),
                email: format!("{}@{}", self.options.author, self.fs.uuid()).into(),
                time: gix_date::Time {
                    seconds: now,
                    offset: 0,
                    sign: gix_date::time::Sign::Plus,
                },
            };
            let commit = gix_object::Commit {
                tree: tree_id,
                parents: expected.into_iter().collect::<Vec<_>>().into(),
                author: signature.clone(),
                committer: signature,
                encoding: None,
                message: self.options.message.clone().into(),
                extra_headers: Vec::new(),
            };
            let commit_id = write_commit(self.fs.store().as_ref(), &commit).await?;

            match self
                .fs
                .store()
                .update_ref(self.fs.ref_name(), expected, commit_id)
                .await?
            {
                CasOutcome::Updated => {
                    self.fs.observe().await?;
                    let rev = self
                        .fs
                        .index()
                        .by_commit(commit_id)?
                        .ok_or_else(|| RepoError::Corrupt("commit not indexed".into()))?;
                    self.fs
                        .locks()
                        .release_after_commit(&self.options.lock_tokens, self.options.keep_locks)?;
                    info!(rev, author = %self.options.author, "commit accepted");
                    return Ok(CommitResult {
                        rev,
                        date: now,
                        author: self.options.author.clone(),
                    });
                }
                CasOutcome::Conflict { actual } => {
                    debug!(attempt, "ref moved during commit, rebasing");
                    let Some(head) = actual else {
                        return Err(RepoError::OutOfDate { paths: touched });
                    };
                    let head_tree =
                        crate::odb::read_commit(self.fs.store().as_ref(), head).await?.tree;
                    let conflicts = self.rebase_conflicts(head_tree).await?;
                    if !conflicts.is_empty() {
                        return Err(RepoError::OutOfDate { paths: conflicts });
                    }
                    expected = Some(head);
                    base_tree = Some(head_tree);
                }
            }
        }
        Err(RepoError::OutOfDate { paths: touched })
    }

    /// Paths that changed between our base and the new head; a non-empty
    /// result aborts the rebase.
    async fn rebase_conflicts(&self, head_tree: ObjectId) -> Result<Vec<String>> {
        let mut conflicts = Vec::new();
        for path in self.staged.keys() {
            let ours = match self.base_tree {
                Some(root) => treewalk::resolve(self.fs.store().as_ref(), root, path).await?,
                None => None,
            };
            let theirs = treewalk::resolve(self.fs.store().as_ref(), head_tree, path).await?;
            if ours != theirs {
                conflicts.push(path.clone());
            }
        }
        Ok(conflicts)
    }

    fn drop_staged_below(&mut self, path: &str) {
        let below: Vec<String> = self
            .staged
            .keys()
            .filter(|k| paths::is_within(k, path))
            .cloned()
            .collect();
        for key in below {
            self.staged.remove(&key);
        }
    }
}

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One materialization attempt against a specific base tree.
struct Materializer<'a> {
    fs: &'a Arc<GitFs>,
    staged: &'a BTreeMap<String, StagedEntry>,
    base_root: Option<ObjectId>,
    attr_memo: HashMap<String, AttrRules>,
}

impl<'a> Materializer<'a> {
    fn new(session: &'a EditorSession) -> Materializer<'a> {
        Materializer {
            fs: &session.fs,
            staged: &session.staged,
            base_root: None,
            attr_memo: HashMap::new(),
        }
    }

    async fn run(mut self, base_root: Option<ObjectId>) -> Result<ObjectId> {
        self.base_root = base_root;
        let root_props = match self.staged.get("/") {
            Some(StagedEntry::Dir { props, .. }) => Some(props.clone()),
            _ => None,
        };
        if let Some(props) = root_props {
            self.check_dir_props("/", &props).await?;
        }
        let root = self
            .build_dir("/".to_string(), base_root)
            .await?
            .unwrap_or_default();
        write_tree(self.fs.store().as_ref(), &root).await
    }

    /// Children of `dir` that the staged set touches. `Some` entries are
    /// staged directly at that name; `None` marks a directory that only
    /// has staged descendants and must be rebuilt from its base tree.
    fn staged_children(&self, dir: &str) -> BTreeMap<String, Option<&'a StagedEntry>> {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{dir}/")
        };
        let mut out: BTreeMap<String, Option<&'a StagedEntry>> = BTreeMap::new();
        for (path, entry) in self.staged.iter() {
            let Some(rest) = path.strip_prefix(&prefix) else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            match rest.split_once('/') {
                None => {
                    out.insert(rest.to_string(), Some(entry));
                }
                Some((first, _)) => {
                    out.entry(first.to_string()).or_insert(None);
                }
            }
        }
        out
    }

    fn build_dir(
        &mut self,
        dir: String,
        base: Option<ObjectId>,
    ) -> BoxFut<'_, Result<Option<Tree>>> {
        Box::pin(async move {
            let base_tree = match base {
                Some(id) => read_tree(self.fs.store().as_ref(), id).await?,
                None => Tree::default(),
            };
            let staged_here = self.staged_children(&dir);

            let mut out = Tree::default();
            for entry in &base_tree.entries {
                if staged_here.contains_key(&entry.name) {
                    continue;
                }
                // Untouched children carry over as stored; a filter change
                // reinterprets their bytes rather than rewriting them.
                out.entries.push(entry.clone());
            }

            for (name, staged) in staged_here {
                let path = paths::join(&dir, &name);
                match staged {
                    Some(StagedEntry::Deleted) => {}
                    Some(StagedEntry::File(file)) => {
                        let entry = self.build_file(&path, &name, file).await?;
                        out.entries.push(entry);
                    }
                    Some(StagedEntry::Dir { base, props }) => {
                        self.check_dir_props(&path, props).await?;
                        let base_child = match base {
                            DirBase::New => None,
                            DirBase::Inherit => base_tree
                                .get(&name)
                                .filter(|e| e.is_dir())
                                .map(|e| e.oid),
                        };
                        self.push_subtree(&mut out, name, path, base_child).await?;
                    }
                    None => {
                        // Only descendants are staged; rebuild this level
                        // from its base tree.
                        let base_child = base_tree
                            .get(&name)
                            .filter(|e| e.is_dir())
                            .map(|e| e.oid);
                        self.push_subtree(&mut out, name, path, base_child).await?;
                    }
                }
            }
            Ok(Some(out))
        })
    }

    /// Builds a child subtree and appends it unless it came out empty
    /// (git cannot represent empty directories; they vanish silently, the
    /// root excepted).
    async fn push_subtree(
        &mut self,
        out: &mut Tree,
        name: String,
        path: String,
        base: Option<ObjectId>,
    ) -> Result<()> {
        if let Some(subtree) = self.build_dir(path, base).await? {
            if !subtree.entries.is_empty() {
                let oid = write_tree(self.fs.store().as_ref(), &subtree).await?;
                out.entries.push(TreeEntry {
                    mode: mode::DIR,
                    name,
                    oid,
                });
            }
        }
        Ok(())
    }

    async fn build_file(&mut self, path: &str, name: &str, file: &StagedFile) -> Result<TreeEntry> {
        let dest_chain = self.final_chain(path).await?;
        self.check_file_props(path, file).await?;

        let blob = match &file.content {
            StagedContent::Raw(raw) => {
                let stored = dest_chain
                    .encode(self.fs.filter_ctx(), Bytes::from(raw.clone()))?;
                self.fs
                    .store()
                    .write(gix_object::Kind::Blob, &stored)
                    .await?
            }
            StagedContent::Stored { blob, chain } => {
                if *chain == dest_chain {
                    *blob
                } else {
                    // The chain changed relative to the content's origin;
                    // transcode so the client-visible bytes are preserved.
                    let stored = read_blob(self.fs.store().as_ref(), *blob).await?;
                    let raw = chain.decode(self.fs.filter_ctx(), stored)?;
                    let re_encoded = dest_chain.encode(self.fs.filter_ctx(), raw)?;
                    self.fs
                        .store()
                        .write(gix_object::Kind::Blob, &re_encoded)
                        .await?
                }
            }
        };
        Ok(TreeEntry {
            mode: if file.executable {
                mode::EXECUTABLE
            } else {
                mode::FILE
            },
            name: name.to_string(),
            oid: blob,
        })
    }

    /// Explicit property changes must agree with what the final
    /// `.gitattributes` state synthesizes; anything else would be lost on
    /// the next read.
    async fn check_file_props(&mut self, path: &str, file: &StagedFile) -> Result<()> {
        if file.props.is_empty() {
            return Ok(());
        }
        let stack = self.final_stack(path).await?;
        let synthesized = stack.file_props(path);
        for (name, value) in &file.props {
            match name.as_str() {
                props::EXECUTABLE | props::SPECIAL => continue,
                props::MERGE_INFO => {
                    warn!(path, "dropping svn:mergeinfo (no git representation)");
                    continue;
                }
                props::EOL_STYLE | props::MIME_TYPE | props::NEEDS_LOCK => {
                    let expect = synthesized.get(name);
                    let matches = match value {
                        Some(v) => expect == Some(v),
                        None => expect.is_none(),
                    };
                    if !matches {
                        return Err(RepoError::PropertyConflict {
                            path: path.to_string(),
                            name: name.clone(),
                        });
                    }
                }
                other if props::is_internal(other) => {
                    return Err(RepoError::PropertyConflict {
                        path: path.to_string(),
                        name: name.clone(),
                    });
                }
                _ => {
                    return Err(RepoError::PropertyConflict {
                        path: path.to_string(),
                        name: name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn check_dir_props(
        &mut self,
        path: &str,
        changed: &BTreeMap<String, Option<Vec<u8>>>,
    ) -> Result<()> {
        for name in changed.keys() {
            match name.as_str() {
                props::MERGE_INFO => {
                    warn!(path, "dropping svn:mergeinfo (no git representation)");
                }
                props::IGNORE | props::INHERITABLE_IGNORES | props::AUTO_PROPS => {
                    // Accepted only when the matching dotfile in this very
                    // commit produces the same value; checked cheaply by
                    // requiring the dotfile to be part of the change set.
                    let ignore_file = paths::join(path, treewalk::IGNORE_FILE);
                    let attr_file = paths::join(path, ATTRIBUTES_FILE);
                    if !self.staged.contains_key(&ignore_file)
                        && !self.staged.contains_key(&attr_file)
                    {
                        return Err(RepoError::PropertyConflict {
                            path: path.to_string(),
                            name: name.clone(),
                        });
                    }
                }
                _ => {
                    return Err(RepoError::PropertyConflict {
                        path: path.to_string(),
                        name: name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn final_chain(&mut self, path: &str) -> Result<FilterChain> {
        let stack = self.final_stack(path).await?;
        Ok(stack.filter_chain_for(path))
    }

    /// Attribute stack for a path as it will exist in the commit under
    /// construction (staged attribute files win over base ones).
    async fn final_stack(&mut self, path: &str) -> Result<PropertyStack> {
        let mut stack = PropertyStack::default();
        let dir_of = paths::parent(path).unwrap_or("/").to_string();
        let mut dirs = vec!["/".to_string()];
        {
            let mut acc = String::new();
            for segment in paths::segments(&dir_of) {
                acc.push('/');
                acc.push_str(segment);
                dirs.push(acc.clone());
            }
        }
        for dir in dirs {
            let rules = self.final_attr_rules(&dir).await?;
            if !rules.is_empty() {
                stack.push(dir, rules);
            }
        }
        Ok(stack)
    }

    async fn final_attr_rules(&mut self, dir: &str) -> Result<AttrRules> {
        if let Some(rules) = self.attr_memo.get(dir) {
            return Ok(rules.clone());
        }
        let attr_path = paths::join(dir, ATTRIBUTES_FILE);
        let content: Option<Vec<u8>> = match self.staged.get(&attr_path) {
            Some(StagedEntry::Deleted) | Some(StagedEntry::Dir { .. }) => None,
            Some(StagedEntry::File(file)) => match &file.content {
                StagedContent::Raw(raw) => Some(raw.clone()),
                StagedContent::Stored { blob, chain } => {
                    let stored = read_blob(self.fs.store().as_ref(), *blob).await?;
                    Some(chain.decode(self.fs.filter_ctx(), stored)?.to_vec())
                }
            },
            None => match self.base_root {
                Some(root) => {
                    match treewalk::resolve(self.fs.store().as_ref(), root, &attr_path).await? {
                        Some(NodeRef::File { blob, .. }) => {
                            Some(read_blob(self.fs.store().as_ref(), blob).await?.to_vec())
                        }
                        _ => None,
                    }
                }
                None => None,
            },
        };
        let rules = content
            .map(|bytes| AttrRules::parse(&bytes))
            .unwrap_or_default();
        self.attr_memo.insert(dir.to_string(), rules.clone());
        Ok(rules)
    }
}
