//! The reporter/editor driver behind `update`, `switch`, `status`, `diff`
//! and `replay`.
//!
//! The client first declares its mixed-revision state (`set-path`,
//! `delete-path`, `finish-report`); the driver then walks the reported
//! base against the target revision and emits the minimal editor drive,
//! depth-first, parents before children.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use gitsvn_core::{paths, GitFs, Node, NodeKind, Operation, PropertyMap, RepoError};
use gitsvn_protocol::{codes, Item, SvndiffEncoder, SvndiffVersion, WireError};

use crate::commands::{arg_str, arg_u64, opt_rev};
use crate::session::{HandlerResult, ServerError, Session};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Depth {
    Empty,
    Files,
    Immediates,
    Infinity,
}

impl Depth {
    fn from_word(word: Option<&str>) -> Depth {
        match word {
            Some("empty") => Depth::Empty,
            Some("files") => Depth::Files,
            Some("immediates") => Depth::Immediates,
            _ => Depth::Infinity,
        }
    }

    /// Depth used inside a child directory.
    fn descend(self) -> Depth {
        match self {
            Depth::Infinity => Depth::Infinity,
            _ => Depth::Empty,
        }
    }

    fn includes_files(self) -> bool {
        !matches!(self, Depth::Empty)
    }

    fn includes_dirs(self) -> bool {
        matches!(self, Depth::Immediates | Depth::Infinity)
    }
}

#[derive(Clone, Debug)]
struct ReportedEntry {
    rev: u64,
    start_empty: bool,
}

/// The client-declared base state, keyed by path relative to the anchor.
#[derive(Clone, Debug, Default)]
pub(crate) struct ReportState {
    entries: BTreeMap<String, ReportedEntry>,
    deleted: Vec<String>,
    aborted: bool,
}

impl ReportState {
    /// Deepest reported entry covering `rel`; `start_empty` only applies
    /// at the entry's own path.
    fn lookup(&self, rel: &str) -> Option<(u64, bool)> {
        let mut probe = rel.to_string();
        loop {
            if let Some(entry) = self.entries.get(&probe) {
                return Some((entry.rev, entry.start_empty && probe == rel));
            }
            if probe.is_empty() {
                return None;
            }
            probe = match probe.rfind('/') {
                Some(idx) => probe[..idx].to_string(),
                None => String::new(),
            };
        }
    }

    /// True when `rel` sits inside a directory the client reported as
    /// start-empty: the client holds nothing below that directory.
    fn covered_empty(&self, rel: &str) -> bool {
        let mut probe = rel.to_string();
        let mut at_self = true;
        loop {
            if let Some(entry) = self.entries.get(&probe) {
                return !at_self && entry.start_empty;
            }
            if probe.is_empty() {
                return false;
            }
            probe = match probe.rfind('/') {
                Some(idx) => probe[..idx].to_string(),
                None => String::new(),
            };
            at_self = false;
        }
    }

    /// True when the client reported `rel` itself with start-empty.
    fn starts_empty(&self, rel: &str) -> bool {
        self.lookup(rel).is_some_and(|(_, se)| se)
    }

    fn is_deleted(&self, rel: &str) -> bool {
        self.deleted.iter().any(|d| d == rel)
    }

    fn has_overrides_below(&self, rel: &str) -> bool {
        let prefix = if rel.is_empty() {
            String::new()
        } else {
            format!("{rel}/")
        };
        self.entries
            .keys()
            .any(|k| !k.is_empty() && k != rel && k.starts_with(&prefix))
            || self
                .deleted
                .iter()
                .any(|d| d.starts_with(&prefix) && d != rel)
    }
}

struct DriveCtx {
    fs: Arc<GitFs>,
    report: ReportState,
    target_rev: u64,
    /// The session directory the report is anchored at (base side).
    anchor: String,
    /// Target-side replacement for the drive root; `None` means the target
    /// lives at the same paths as the base (update/status).
    switch_root: Option<String>,
    /// Restrict the drive to this single child of the anchor (the update
    /// "target" argument), when non-empty.
    restrict: Option<String>,
    depth: Depth,
    send_text: bool,
    entry_props: bool,
}

impl DriveCtx {
    fn base_path(&self, rel: &str) -> String {
        paths::join(&self.anchor, rel)
    }

    fn target_path(&self, rel: &str) -> String {
        match &self.switch_root {
            // For switch/diff the switch URL names the restricted child (or
            // the root when there is no restriction).
            Some(root) => match &self.restrict {
                Some(restrict) => {
                    if rel == restrict {
                        root.clone()
                    } else if let Some(rest) =
                        rel.strip_prefix(&format!("{restrict}/"))
                    {
                        paths::join(root, rest)
                    } else {
                        self.base_path(rel)
                    }
                }
                None => paths::join(root, rel),
            },
            None => self.base_path(rel),
        }
    }

    /// A subtree can be skipped only when its tree object AND its inherited
    /// attribute context are unchanged; an attribute edit higher up changes
    /// how identical blobs read.
    async fn subtree_unchanged(&self, base: &Node, target: &Node, rel: &str) -> bool {
        if base.oid != target.oid
            || self.report.has_overrides_below(rel)
            || self.report.starts_empty(rel)
        {
            return false;
        }
        if base.rev == self.target_rev && self.switch_root.is_none() {
            return true;
        }
        let base_stack = self.fs.prop_stack(base.rev, &self.base_path(rel)).await;
        let target_stack = self.fs.prop_stack(self.target_rev, &self.target_path(rel)).await;
        matches!((base_stack, target_stack), (Ok(a), Ok(b)) if a == b)
    }

    /// Base node for `rel`, honoring reported revisions, deletions and
    /// start-empty coverage. A node reported start-empty itself still
    /// exists (as an empty shell); its descendants do not.
    async fn base_node(&self, rel: &str) -> Result<Option<Node>, ServerError> {
        if self.report.is_deleted(rel) || self.report.covered_empty(rel) {
            return Ok(None);
        }
        let Some((rev, _)) = self.report.lookup(rel) else {
            return Ok(None);
        };
        Ok(self.fs.stat(rev, &self.base_path(rel)).await?)
    }
}

fn child_rel(rel: &str, name: &str) -> String {
    if rel.is_empty() {
        name.to_string()
    } else {
        format!("{rel}/{name}")
    }
}

fn prop_changes(
    base: Option<&PropertyMap>,
    target: &PropertyMap,
) -> Vec<(String, Option<Vec<u8>>)> {
    let mut out = Vec::new();
    for (name, value) in target {
        if base.and_then(|b| b.get(name)) != Some(value) {
            out.push((name.clone(), Some(value.clone())));
        }
    }
    if let Some(base) = base {
        for name in base.keys() {
            if !target.contains_key(name) {
                out.push((name.clone(), None));
            }
        }
    }
    out
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Emits one editor command.
    async fn ed(&mut self, cmd: &str, params: Vec<Item>) -> Result<(), ServerError> {
        self.writer
            .send(&Item::List(vec![Item::word(cmd), Item::List(params)]))
            .await?;
        Ok(())
    }

    /// Reads report commands until `finish-report` or `abort-report`.
    async fn read_report(&mut self) -> Result<ReportState, ServerError> {
        let mut state = ReportState::default();
        loop {
            let frame = self.read_item().await?;
            let parts = frame.expect_list("report command")?;
            let Some(cmd) = parts.first().and_then(|i| i.as_word()) else {
                return Err(WireError::malformed("report command missing word").into());
            };
            let params: &[Item] = parts.get(1).and_then(|i| i.as_list()).unwrap_or_default();
            match cmd {
                "set-path" | "link-path" => {
                    // link-path carries a URL at index 1, shifting the rest.
                    let offset = usize::from(cmd == "link-path");
                    let path = params
                        .first()
                        .and_then(|i| i.as_str())
                        .ok_or_else(|| WireError::malformed("set-path missing path"))?
                        .trim_matches('/')
                        .to_string();
                    let rev = params
                        .get(1 + offset)
                        .and_then(|i| i.as_u64())
                        .ok_or_else(|| WireError::malformed("set-path missing rev"))?;
                    let start_empty = params
                        .get(2 + offset)
                        .and_then(|i| i.as_bool())
                        .unwrap_or(false);
                    state
                        .entries
                        .insert(path, ReportedEntry { rev, start_empty });
                }
                "delete-path" => {
                    let path = params
                        .first()
                        .and_then(|i| i.as_str())
                        .ok_or_else(|| WireError::malformed("delete-path missing path"))?
                        .trim_matches('/')
                        .to_string();
                    state.deleted.push(path);
                }
                "finish-report" => return Ok(state),
                "abort-report" => {
                    state.aborted = true;
                    return Ok(state);
                }
                other => {
                    return Err(WireError::malformed(format!(
                        "unknown report command '{other}'"
                    ))
                    .into());
                }
            }
        }
    }

    pub(crate) async fn cmd_update(&mut self, params: &[Item]) -> HandlerResult {
        let rev = opt_rev(params, 0);
        let target = arg_str(params, 1, "update target")?;
        let depth = Depth::from_word(params.get(3).and_then(|i| i.as_word()));
        self.check_access(Operation::Read, &self.base_path.clone())?;
        let target_rev = self.effective_rev(rev).await?;
        self.run_report_drive(target, None, target_rev, depth, true, true)
            .await
    }

    pub(crate) async fn cmd_switch(&mut self, params: &[Item]) -> HandlerResult {
        let rev = opt_rev(params, 0);
        let target = arg_str(params, 1, "switch target")?;
        let url = arg_str(params, 3, "switch url")?;
        let depth = Depth::from_word(params.get(4).and_then(|i| i.as_word()));
        let switch_path = self.same_repo_url_path(&url)?;
        self.check_access(Operation::Read, &self.base_path.clone())?;
        self.check_access(Operation::Read, &switch_path)?;
        let target_rev = self.effective_rev(rev).await?;
        self.run_report_drive(target, Some(switch_path), target_rev, depth, true, true)
            .await
    }

    pub(crate) async fn cmd_status(&mut self, params: &[Item]) -> HandlerResult {
        let target = arg_str(params, 0, "status target")?;
        let rev = opt_rev(params, 2);
        let depth = Depth::from_word(params.get(3).and_then(|i| i.as_word()));
        self.check_access(Operation::Read, &self.base_path.clone())?;
        let target_rev = self.effective_rev(rev).await?;
        self.run_report_drive(target, None, target_rev, depth, false, false)
            .await
    }

    pub(crate) async fn cmd_diff(&mut self, params: &[Item]) -> HandlerResult {
        let rev = opt_rev(params, 0);
        let target = arg_str(params, 1, "diff target")?;
        let url = arg_str(params, 4, "diff url")?;
        let send_text = params.get(5).and_then(|i| i.as_bool()).unwrap_or(true);
        let depth = Depth::from_word(params.get(6).and_then(|i| i.as_word()));
        let diff_path = self.same_repo_url_path(&url)?;
        self.check_access(Operation::Read, &self.base_path.clone())?;
        self.check_access(Operation::Read, &diff_path)?;
        let target_rev = self.effective_rev(rev).await?;
        self.run_report_drive(target, Some(diff_path), target_rev, depth, send_text, false)
            .await
    }

    /// Resolves a URL argument that must stay within the open repository.
    fn same_repo_url_path(&self, url: &str) -> Result<String, ServerError> {
        let Some((repo_name, path, _)) = crate::session::parse_session_url(url) else {
            return Err(ServerError::Command(
                codes::SVN_ERR_RA_SVN_REPOS_NOT_FOUND,
                format!("malformed URL '{url}'"),
            ));
        };
        if repo_name != self.repo()?.name {
            return Err(ServerError::Command(
                codes::SVN_ERR_RA_SVN_REPOS_NOT_FOUND,
                "URL crosses repositories".to_string(),
            ));
        }
        Ok(path)
    }

    async fn run_report_drive(
        &mut self,
        target: String,
        switch_root: Option<String>,
        target_rev: u64,
        depth: Depth,
        send_text: bool,
        entry_props: bool,
    ) -> HandlerResult {
        self.send_empty_auth().await?;
        let report = self.read_report().await?;
        self.send_empty_auth().await?;
        if report.aborted {
            self.writer.send_success(Vec::new()).await?;
            return Ok(());
        }

        let restrict = {
            let target = target.trim_matches('/');
            (!target.is_empty()).then(|| target.to_string())
        };
        let ctx = DriveCtx {
            fs: self.repo()?.fs.clone(),
            report,
            target_rev,
            anchor: self.base_path.clone(),
            switch_root,
            restrict,
            depth,
            send_text,
            entry_props,
        };
        let timeout = self.editor_timeout;
        match tokio::time::timeout(timeout, self.drive(&ctx)).await {
            Ok(result) => result?,
            Err(_) => return Err(ServerError::Fatal("editor drive timed out".to_string())),
        }

        // The client acknowledges close-edit before the final response.
        let _ack = self.read_item().await?;
        self.writer.send_success(Vec::new()).await?;
        Ok(())
    }

    async fn drive(&mut self, ctx: &DriveCtx) -> HandlerResult {
        self.ed("target-rev", vec![Item::Number(ctx.target_rev)])
            .await?;
        let base_rev = ctx.report.lookup("").map(|(rev, _)| rev);
        let root_token = "d:".to_string();
        self.ed(
            "open-root",
            vec![
                Item::optional(base_rev.map(Item::Number)),
                Item::str(&root_token),
            ],
        )
        .await?;

        match &ctx.restrict {
            Some(restrict) => {
                // The drive only touches one entry of the anchor.
                self.drive_entry(ctx, restrict.clone(), &root_token).await?;
            }
            None => {
                let base = ctx.base_node("").await?;
                let target = ctx
                    .fs
                    .stat(ctx.target_rev, &ctx.target_path(""))
                    .await?
                    .ok_or_else(|| {
                        ServerError::from(RepoError::PathNotFound {
                            path: ctx.target_path(""),
                            rev: ctx.target_rev,
                        })
                    })?;
                let base = base.filter(|b| b.kind == NodeKind::Dir);
                self.drive_dir_props(ctx, "", base.as_ref(), &target, &root_token)
                    .await?;
                self.drive_dir(ctx, String::new(), base, root_token.clone(), ctx.depth)
                    .await?;
            }
        }
        self.ed("close-dir", vec![Item::str(&root_token)]).await?;
        self.ed("close-edit", Vec::new()).await?;
        Ok(())
    }

    /// Drives one named entry of an open directory: the add/open/delete
    /// decision shared by the restricted drive and the recursive walk.
    async fn drive_entry(&mut self, ctx: &DriveCtx, rel: String, dir_token: &str) -> HandlerResult {
        let base = ctx.base_node(&rel).await?;
        let target = ctx.fs.stat(ctx.target_rev, &ctx.target_path(&rel)).await?;

        match (base, target) {
            (None, None) => Ok(()),
            (Some(_), None) => {
                self.ed(
                    "delete-entry",
                    vec![
                        Item::str(&rel),
                        Item::Number(ctx.target_rev),
                        Item::str(dir_token),
                    ],
                )
                .await
            }
            (base, Some(target_node)) => {
                let kind_changed = base
                    .as_ref()
                    .is_some_and(|b| b.kind != target_node.kind);
                if kind_changed {
                    self.ed(
                        "delete-entry",
                        vec![
                            Item::str(&rel),
                            Item::Number(ctx.target_rev),
                            Item::str(dir_token),
                        ],
                    )
                    .await?;
                }
                let base = base.filter(|b| b.kind == target_node.kind);
                match target_node.kind {
                    NodeKind::File => {
                        self.drive_file(ctx, &rel, base, &target_node, dir_token)
                            .await
                    }
                    NodeKind::Dir => {
                        if let Some(base_node) = &base {
                            if ctx.subtree_unchanged(base_node, &target_node, &rel).await {
                                return Ok(());
                            }
                        }
                        let child_token = format!("d:{rel}");
                        let add = base.is_none();
                        self.open_and_fill_dir(
                            ctx,
                            &rel,
                            base,
                            &target_node,
                            dir_token,
                            &child_token,
                            ctx.depth.descend(),
                            add,
                        )
                        .await
                    }
                }
            }
        }
    }

    fn drive_dir<'a>(
        &'a mut self,
        ctx: &'a DriveCtx,
        rel: String,
        base: Option<Node>,
        dir_token: String,
        depth: Depth,
    ) -> Pin<Box<dyn Future<Output = HandlerResult> + Send + 'a>> {
        Box::pin(async move {
            if depth == Depth::Empty {
                return Ok(());
            }
            // A start-empty directory exists but holds nothing the client
            // can reuse.
            let own_empty = ctx.report.starts_empty(&rel);
            let base_list = match &base {
                Some(node) if !own_empty => ctx
                    .fs
                    .list(node.rev, &ctx.base_path(&rel))
                    .await
                    .unwrap_or_default(),
                _ => Vec::new(),
            };
            let target_list = ctx.fs.list(ctx.target_rev, &ctx.target_path(&rel)).await?;

            let base_names: BTreeMap<&str, &gitsvn_core::Dirent> =
                base_list.iter().map(|e| (e.name.as_str(), e)).collect();
            let target_names: BTreeMap<&str, &gitsvn_core::Dirent> =
                target_list.iter().map(|e| (e.name.as_str(), e)).collect();

            // Deletions first, then adds and changes in name order.
            for (name, base_entry) in &base_names {
                if base_entry.kind == NodeKind::Dir && !depth.includes_dirs() {
                    continue;
                }
                let crel = child_rel(&rel, name);
                if ctx.report.is_deleted(&crel) {
                    continue;
                }
                if !target_names.contains_key(*name) {
                    self.ed(
                        "delete-entry",
                        vec![
                            Item::str(&crel),
                            Item::Number(ctx.target_rev),
                            Item::str(&dir_token),
                        ],
                    )
                    .await?;
                }
            }

            for (name, target_entry) in &target_names {
                let included = match target_entry.kind {
                    NodeKind::File => depth.includes_files(),
                    NodeKind::Dir => depth.includes_dirs(),
                };
                if !included {
                    continue;
                }
                let crel = child_rel(&rel, name);
                match target_entry.kind {
                    NodeKind::Dir => {
                        let child_token = format!("d:{crel}");
                        let target_node = ctx
                            .fs
                            .stat(ctx.target_rev, &ctx.target_path(&crel))
                            .await?
                            .ok_or_else(|| {
                                ServerError::Fatal("listed directory vanished".to_string())
                            })?;
                        let base_node = match base_names.get(*name) {
                            Some(entry) if entry.kind == NodeKind::Dir => {
                                ctx.base_node(&crel).await?
                            }
                            // Kind change: the delete-entry already went out
                            // in the pass above via target_names mismatch.
                            _ => None,
                        };
                        if let Some(base_node) = &base_node {
                            if ctx.subtree_unchanged(base_node, &target_node, &crel).await {
                                continue;
                            }
                        }
                        let add = base_node.is_none();
                        if add && base_names.get(*name).is_some_and(|e| e.kind == NodeKind::File) {
                            self.ed(
                                "delete-entry",
                                vec![
                                    Item::str(&crel),
                                    Item::Number(ctx.target_rev),
                                    Item::str(&dir_token),
                                ],
                            )
                            .await?;
                        }
                        self.open_and_fill_dir(
                            ctx,
                            &crel,
                            base_node,
                            &target_node,
                            &dir_token,
                            &child_token,
                            depth.descend(),
                            add,
                        )
                        .await?;
                    }
                    NodeKind::File => {
                        let target_node = ctx
                            .fs
                            .stat(ctx.target_rev, &ctx.target_path(&crel))
                            .await?
                            .ok_or_else(|| {
                                ServerError::Fatal("listed file vanished".to_string())
                            })?;
                        let base_node = match base_names.get(*name) {
                            Some(entry) if entry.kind == NodeKind::File => {
                                ctx.base_node(&crel).await?
                            }
                            Some(_) => {
                                self.ed(
                                    "delete-entry",
                                    vec![
                                        Item::str(&crel),
                                        Item::Number(ctx.target_rev),
                                        Item::str(&dir_token),
                                    ],
                                )
                                .await?;
                                None
                            }
                            None => None,
                        };
                        self.drive_file(ctx, &crel, base_node, &target_node, &dir_token)
                            .await?;
                    }
                }
            }
            Ok(())
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn open_and_fill_dir(
        &mut self,
        ctx: &DriveCtx,
        rel: &str,
        base: Option<Node>,
        target: &Node,
        parent_token: &str,
        child_token: &str,
        depth: Depth,
        add: bool,
    ) -> HandlerResult {
        if add {
            self.ed(
                "add-dir",
                vec![
                    Item::str(rel),
                    Item::str(parent_token),
                    Item::str(child_token),
                    Item::List(Vec::new()),
                ],
            )
            .await?;
        } else {
            let base_rev = base.as_ref().map(|b| b.rev).unwrap_or(ctx.target_rev);
            self.ed(
                "open-dir",
                vec![
                    Item::str(rel),
                    Item::str(parent_token),
                    Item::str(child_token),
                    Item::optional(Some(Item::Number(base_rev))),
                ],
            )
            .await?;
        }
        self.drive_dir_props(ctx, rel, base.as_ref(), target, child_token)
            .await?;
        self.drive_dir(ctx, rel.to_string(), base, child_token.to_string(), depth)
            .await?;
        self.ed("close-dir", vec![Item::str(child_token)]).await?;
        Ok(())
    }

    async fn drive_dir_props(
        &mut self,
        ctx: &DriveCtx,
        rel: &str,
        base: Option<&Node>,
        target: &Node,
        token: &str,
    ) -> HandlerResult {
        let target_props = ctx
            .fs
            .properties(ctx.target_rev, &ctx.target_path(rel), false)
            .await?;
        let base = if ctx.report.starts_empty(rel) { None } else { base };
        let base_props = match base {
            Some(node) => Some(ctx.fs.properties(node.rev, &node.path, false).await?),
            None => None,
        };
        for (name, value) in prop_changes(base_props.as_ref(), &target_props) {
            self.ed(
                "change-dir-prop",
                vec![
                    Item::str(token),
                    Item::str(&name),
                    Item::optional(value.map(Item::bytes)),
                ],
            )
            .await?;
        }
        if ctx.entry_props && base.is_none() {
            for (name, value) in self.entry_props(
                target.created_rev,
                target.created_date,
                target.last_author.as_deref(),
            ) {
                self.ed(
                    "change-dir-prop",
                    vec![
                        Item::str(token),
                        Item::str(&name),
                        Item::optional(Some(Item::bytes(value))),
                    ],
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn drive_file(
        &mut self,
        ctx: &DriveCtx,
        rel: &str,
        base: Option<Node>,
        target: &Node,
        dir_token: &str,
    ) -> HandlerResult {
        let target_props = ctx
            .fs
            .properties(ctx.target_rev, &ctx.target_path(rel), false)
            .await?;
        let own_empty = ctx.report.starts_empty(rel);
        let (base_props, content_equal) = match &base {
            Some(node) if !own_empty => {
                let props = ctx.fs.properties(node.rev, &node.path, false).await?;
                let equal = node.md5 == target.md5 && node.size == target.size;
                (Some(props), equal)
            }
            _ => (None, false),
        };
        let props_equal = base_props.as_ref() == Some(&target_props);
        if content_equal && props_equal {
            return Ok(());
        }

        let file_token = format!("f:{rel}");
        if let Some(base_node) = &base {
            self.ed(
                "open-file",
                vec![
                    Item::str(rel),
                    Item::str(dir_token),
                    Item::str(&file_token),
                    Item::optional(Some(Item::Number(base_node.rev))),
                ],
            )
            .await?;
        } else {
            self.ed(
                "add-file",
                vec![
                    Item::str(rel),
                    Item::str(dir_token),
                    Item::str(&file_token),
                    Item::List(Vec::new()),
                ],
            )
            .await?;
        }

        for (name, value) in prop_changes(base_props.as_ref(), &target_props) {
            self.ed(
                "change-file-prop",
                vec![
                    Item::str(&file_token),
                    Item::str(&name),
                    Item::optional(value.map(Item::bytes)),
                ],
            )
            .await?;
        }
        if ctx.entry_props {
            for (name, value) in self.entry_props(
                target.created_rev,
                target.created_date,
                target.last_author.as_deref(),
            ) {
                self.ed(
                    "change-file-prop",
                    vec![
                        Item::str(&file_token),
                        Item::str(&name),
                        Item::optional(Some(Item::bytes(value))),
                    ],
                )
                .await?;
            }
        }

        if !content_equal && ctx.send_text {
            let content = ctx.fs.read_node(target).await?;
            self.ed(
                "apply-textdelta",
                vec![
                    Item::str(&file_token),
                    Item::optional(
                        base.as_ref()
                            .filter(|_| !own_empty)
                            .map(|b| Item::str(&b.md5)),
                    ),
                ],
            )
            .await?;
            // Full-text windows; svndiff1 keeps large transfers reasonable.
            let encoder = SvndiffEncoder::new(SvndiffVersion::V1);
            let chunks = encoder
                .encode(&content)
                .map_err(|err| ServerError::Fatal(err.to_string()))?;
            for chunk in chunks {
                self.ed(
                    "textdelta-chunk",
                    vec![Item::str(&file_token), Item::bytes(chunk)],
                )
                .await?;
            }
            self.ed("textdelta-end", vec![Item::str(&file_token)])
                .await?;
        }
        self.ed(
            "close-file",
            vec![
                Item::str(&file_token),
                Item::optional(Some(Item::str(&target.md5))),
            ],
        )
        .await?;
        Ok(())
    }

    pub(crate) async fn cmd_replay(&mut self, params: &[Item]) -> HandlerResult {
        let rev = arg_u64(params, 0, "replay rev")?;
        self.check_access(Operation::Read, &self.base_path.clone())?;
        self.send_empty_auth().await?;
        self.replay_one(rev).await?;
        self.writer.send_success(Vec::new()).await?;
        Ok(())
    }

    pub(crate) async fn cmd_replay_range(&mut self, params: &[Item]) -> HandlerResult {
        let start = arg_u64(params, 0, "replay-range start")?;
        let end = arg_u64(params, 1, "replay-range end")?;
        self.check_access(Operation::Read, &self.base_path.clone())?;
        if end < start {
            return Err(WireError::malformed("replay-range end before start").into());
        }
        self.send_empty_auth().await?;
        for rev in start..=end {
            let props = self.repo()?.fs.rev_props(rev).await?;
            self.writer
                .send(&Item::List(vec![
                    Item::word("revprops"),
                    crate::commands::proplist(&props),
                ]))
                .await?;
            self.replay_one(rev).await?;
        }
        self.writer.send_success(Vec::new()).await?;
        Ok(())
    }

    /// Replays one revision as an editor drive against its predecessor,
    /// terminated by `finish-replay`.
    async fn replay_one(&mut self, rev: u64) -> HandlerResult {
        if rev == 0 {
            return Err(RepoError::RevisionNotFound(0).into());
        }
        debug!(rev, "replaying revision");
        let ctx = DriveCtx {
            fs: self.repo()?.fs.clone(),
            report: ReportState {
                entries: BTreeMap::from([(
                    String::new(),
                    ReportedEntry {
                        rev: rev - 1,
                        start_empty: rev == 1,
                    },
                )]),
                deleted: Vec::new(),
                aborted: false,
            },
            target_rev: rev,
            anchor: "/".to_string(),
            switch_root: None,
            restrict: None,
            depth: Depth::Infinity,
            send_text: true,
            entry_props: false,
        };
        self.ed("target-rev", vec![Item::Number(rev)]).await?;
        let root_token = "d:".to_string();
        self.ed(
            "open-root",
            vec![
                Item::optional(Some(Item::Number(rev - 1))),
                Item::str(&root_token),
            ],
        )
        .await?;
        let base = ctx.base_node("").await?;
        if let Some(target) = ctx.fs.stat(rev, "/").await? {
            self.drive_dir_props(&ctx, "", base.as_ref(), &target, &root_token)
                .await?;
            self.drive_dir(
                &ctx,
                String::new(),
                base,
                root_token.clone(),
                Depth::Infinity,
            )
            .await?;
        }
        self.ed("close-dir", vec![Item::str(&root_token)]).await?;
        self.ed("finish-replay", Vec::new()).await?;
        Ok(())
    }
}
