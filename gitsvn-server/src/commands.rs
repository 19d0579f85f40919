//! Read-path command handlers.
//!
//! Each handler parses its argument tuple, runs the access check, and
//! computes everything fallible before the first byte of the response is
//! written, so errors can always be framed as a clean failure response.

use tokio::io::{AsyncRead, AsyncWrite};

use gitsvn_core::{paths, props, svn_date, Lock, NodeKind, Operation, PropertyMap, RepoError};
use gitsvn_protocol::{codes, Item, WireError};

use crate::session::{HandlerResult, ServerError, Session};

const CONTENT_CHUNK: usize = 64 * 1024;

pub(crate) fn arg<'a>(params: &'a [Item], idx: usize, ctx: &str) -> Result<&'a Item, ServerError> {
    params
        .get(idx)
        .ok_or_else(|| WireError::malformed(format!("{ctx}: missing argument {idx}")).into())
}

pub(crate) fn arg_str(params: &[Item], idx: usize, ctx: &str) -> Result<String, ServerError> {
    Ok(arg(params, idx, ctx)?.expect_str(ctx)?.to_string())
}

pub(crate) fn arg_u64(params: &[Item], idx: usize, ctx: &str) -> Result<u64, ServerError> {
    Ok(arg(params, idx, ctx)?.expect_u64(ctx)?)
}

pub(crate) fn arg_bool(params: &[Item], idx: usize, ctx: &str) -> Result<bool, ServerError> {
    arg(params, idx, ctx)?
        .as_bool()
        .ok_or_else(|| WireError::malformed(format!("{ctx}: expected boolean")).into())
}

/// `( ?number )` optional tuple.
pub(crate) fn opt_rev(params: &[Item], idx: usize) -> Option<u64> {
    params
        .get(idx)
        .and_then(|i| i.as_list())
        .and_then(|t| t.first())
        .and_then(|i| i.as_u64())
}

/// `( ?string )` optional tuple.
pub(crate) fn opt_str(params: &[Item], idx: usize) -> Option<String> {
    params
        .get(idx)
        .and_then(|i| i.as_list())
        .and_then(|t| t.first())
        .and_then(|i| i.as_str().map(str::to_string))
}

pub(crate) fn proplist(map: &PropertyMap) -> Item {
    Item::List(
        map.iter()
            .map(|(name, value)| {
                Item::List(vec![Item::str(name), Item::bytes(value.clone())])
            })
            .collect(),
    )
}

fn lockdesc(lock: &Lock) -> Item {
    Item::List(vec![
        Item::str(&lock.path),
        Item::str(&lock.token),
        Item::str(&lock.owner),
        Item::optional(lock.comment.as_ref().map(Item::str)),
        Item::str(lock.created_date()),
        Item::List(Vec::new()),
    ])
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Resolves a command-relative path against the session directory.
    pub(crate) fn fs_path(&self, rel: &str) -> String {
        paths::canonical(&paths::join(&self.base_path, rel.trim_start_matches('/')))
    }

    /// Revision argument defaulting to the head revision.
    pub(crate) async fn effective_rev(&self, rev: Option<u64>) -> Result<u64, ServerError> {
        let repo = self.repo()?;
        match rev {
            Some(rev) => Ok(rev),
            None => {
                repo.fs.observe().await?;
                Ok(repo.fs.latest_rev()?)
            }
        }
    }

    /// Entry props clients use to stamp working-copy metadata.
    pub(crate) fn entry_props(
        &self,
        created_rev: u64,
        created_date: i64,
        last_author: Option<&str>,
    ) -> Vec<(String, Vec<u8>)> {
        let repo = match self.repo() {
            Ok(repo) => repo,
            Err(_) => return Vec::new(),
        };
        let mut out = vec![
            (
                props::ENTRY_COMMITTED_REV.to_string(),
                created_rev.to_string().into_bytes(),
            ),
            (
                props::ENTRY_COMMITTED_DATE.to_string(),
                svn_date(created_date).into_bytes(),
            ),
            (
                props::ENTRY_UUID.to_string(),
                repo.fs.uuid().as_bytes().to_vec(),
            ),
        ];
        if let Some(author) = last_author {
            out.push((
                props::ENTRY_LAST_AUTHOR.to_string(),
                author.as_bytes().to_vec(),
            ));
        }
        out
    }

    pub(crate) async fn cmd_reparent(&mut self, params: &[Item]) -> HandlerResult {
        let url = arg_str(params, 0, "reparent url")?;
        let repo_name = self.repo()?.name.clone();
        let Some((name, base_path, root_url)) = crate::session::parse_session_url(&url) else {
            return Err(ServerError::Command(
                codes::SVN_ERR_RA_SVN_REPOS_NOT_FOUND,
                format!("malformed URL '{url}'"),
            ));
        };
        if name != repo_name {
            return Err(ServerError::Command(
                codes::SVN_ERR_RA_SVN_REPOS_NOT_FOUND,
                "reparent crosses repositories".to_string(),
            ));
        }
        self.base_path = base_path;
        self.root_url = root_url;
        self.send_empty_auth().await?;
        self.writer.send_success(Vec::new()).await?;
        Ok(())
    }

    pub(crate) async fn cmd_get_latest_rev(&mut self, _params: &[Item]) -> HandlerResult {
        self.check_access(Operation::Read, &self.base_path.clone())?;
        let repo = self.repo()?.clone();
        repo.fs.observe().await?;
        let rev = repo.fs.latest_rev()?;
        self.send_empty_auth().await?;
        self.writer.send_success(vec![Item::Number(rev)]).await?;
        Ok(())
    }

    pub(crate) async fn cmd_get_dated_rev(&mut self, params: &[Item]) -> HandlerResult {
        self.check_access(Operation::Read, &self.base_path.clone())?;
        let date = arg_str(params, 0, "get-dated-rev date")?;
        let ts = chrono::DateTime::parse_from_rfc3339(&date)
            .map(|dt| dt.timestamp())
            .map_err(|_| {
                ServerError::Command(
                    codes::SVN_ERR_BAD_PROPERTY_VALUE,
                    format!("unparsable date '{date}'"),
                )
            })?;
        let repo = self.repo()?.clone();
        repo.fs.observe().await?;
        let rev = repo.fs.rev_for_date(ts)?;
        self.send_empty_auth().await?;
        self.writer.send_success(vec![Item::Number(rev)]).await?;
        Ok(())
    }

    pub(crate) async fn cmd_rev_proplist(&mut self, params: &[Item]) -> HandlerResult {
        self.check_access(Operation::Read, "/")?;
        let rev = arg_u64(params, 0, "rev-proplist rev")?;
        let map = self.repo()?.clone().fs.rev_props(rev).await?;
        self.send_empty_auth().await?;
        self.writer.send_success(vec![proplist(&map)]).await?;
        Ok(())
    }

    pub(crate) async fn cmd_rev_prop(&mut self, params: &[Item]) -> HandlerResult {
        self.check_access(Operation::Read, "/")?;
        let rev = arg_u64(params, 0, "rev-prop rev")?;
        let name = arg_str(params, 1, "rev-prop name")?;
        let map = self.repo()?.clone().fs.rev_props(rev).await?;
        let value = map.get(&name).cloned();
        self.send_empty_auth().await?;
        self.writer
            .send_success(vec![Item::optional(value.map(Item::bytes))])
            .await?;
        Ok(())
    }

    /// Only `svn:log` can change; git history itself is immutable here.
    pub(crate) async fn cmd_change_rev_prop(&mut self, params: &[Item]) -> HandlerResult {
        self.check_access(Operation::Write, "/")?;
        let rev = arg_u64(params, 0, "change-rev-prop rev")?;
        let name = arg_str(params, 1, "change-rev-prop name")?;
        let value = params
            .get(2)
            .and_then(|i| i.as_list())
            .and_then(|t| t.first())
            .and_then(|i| i.as_bytes().map(<[u8]>::to_vec));
        if name != "svn:log" {
            return Err(ServerError::Command(
                codes::SVN_ERR_RA_NOT_AUTHORIZED,
                format!("revision property '{name}' cannot be changed"),
            ));
        }
        let Some(value) = value else {
            return Err(ServerError::Command(
                codes::SVN_ERR_BAD_PROPERTY_VALUE,
                "svn:log cannot be deleted".to_string(),
            ));
        };
        let message = String::from_utf8_lossy(&value).to_string();
        self.repo()?.fs.index().set_log_message(rev, &message)?;
        self.send_empty_auth().await?;
        self.writer.send_success(Vec::new()).await?;
        Ok(())
    }

    pub(crate) async fn cmd_check_path(&mut self, params: &[Item]) -> HandlerResult {
        let path = self.fs_path(&arg_str(params, 0, "check-path path")?);
        self.check_access(Operation::Read, &path)?;
        let rev = self.effective_rev(opt_rev(params, 1)).await?;
        let kind = self.repo()?.clone().fs.check_path(rev, &path).await?;
        let word = match kind {
            None => "none",
            Some(NodeKind::File) => "file",
            Some(NodeKind::Dir) => "dir",
        };
        self.send_empty_auth().await?;
        self.writer.send_success(vec![Item::word(word)]).await?;
        Ok(())
    }

    pub(crate) async fn cmd_stat(&mut self, params: &[Item]) -> HandlerResult {
        let path = self.fs_path(&arg_str(params, 0, "stat path")?);
        self.check_access(Operation::Read, &path)?;
        let rev = self.effective_rev(opt_rev(params, 1)).await?;
        let repo = self.repo()?.clone();
        let entry = match repo.fs.stat(rev, &path).await? {
            Some(node) => {
                let has_props = !repo.fs.properties(rev, &path, false).await?.is_empty();
                Some(Item::List(vec![
                    Item::word(node.kind.as_word()),
                    Item::Number(node.size),
                    Item::bool(has_props),
                    Item::Number(node.created_rev),
                    Item::optional(Some(Item::str(svn_date(node.created_date)))),
                    Item::optional(node.last_author.as_deref().map(Item::str)),
                ]))
            }
            None => None,
        };
        self.send_empty_auth().await?;
        self.writer
            .send_success(vec![Item::optional(entry)])
            .await?;
        Ok(())
    }

    pub(crate) async fn cmd_get_file(&mut self, params: &[Item]) -> HandlerResult {
        let path = self.fs_path(&arg_str(params, 0, "get-file path")?);
        self.check_access(Operation::Read, &path)?;
        let rev = self.effective_rev(opt_rev(params, 1)).await?;
        let want_props = arg_bool(params, 2, "get-file want-props")?;
        let want_contents = arg_bool(params, 3, "get-file want-contents")?;

        let repo = self.repo()?.clone();
        let node = repo
            .fs
            .stat(rev, &path)
            .await?
            .ok_or_else(|| RepoError::PathNotFound { path: path.clone(), rev })?;
        if node.kind != NodeKind::File {
            return Err(RepoError::NodeKindMismatch {
                path,
                rev,
                expected: "file",
            }
            .into());
        }
        let mut prop_map = PropertyMap::new();
        if want_props {
            prop_map = repo.fs.properties(rev, &path, false).await?;
            for (name, value) in
                self.entry_props(node.created_rev, node.created_date, node.last_author.as_deref())
            {
                prop_map.insert(name, value);
            }
        }
        let content = if want_contents {
            Some(repo.fs.read_node(&node).await?)
        } else {
            None
        };

        self.send_empty_auth().await?;
        self.writer
            .send_success(vec![
                Item::optional(Some(Item::str(&node.md5))),
                Item::Number(rev),
                proplist(&prop_map),
            ])
            .await?;
        if let Some(content) = content {
            for chunk in content.chunks(CONTENT_CHUNK) {
                self.writer.string(chunk);
                self.writer.flush().await?;
            }
            self.writer.string(b"");
            self.writer.flush().await?;
            self.writer.send_success(Vec::new()).await?;
        }
        Ok(())
    }

    pub(crate) async fn cmd_get_dir(&mut self, params: &[Item]) -> HandlerResult {
        let path = self.fs_path(&arg_str(params, 0, "get-dir path")?);
        self.check_access(Operation::Read, &path)?;
        let rev = self.effective_rev(opt_rev(params, 1)).await?;
        let want_props = arg_bool(params, 2, "get-dir want-props")?;
        let want_contents = arg_bool(params, 3, "get-dir want-contents")?;

        let repo = self.repo()?.clone();
        let mut prop_map = PropertyMap::new();
        if want_props {
            prop_map = repo.fs.properties(rev, &path, false).await?;
        }
        let mut entry_items = Vec::new();
        if want_contents {
            for entry in repo.fs.list(rev, &path).await? {
                entry_items.push(Item::List(vec![
                    Item::str(&entry.name),
                    Item::word(entry.kind.as_word()),
                    Item::Number(entry.size),
                    Item::bool(entry.has_props),
                    Item::Number(entry.created_rev),
                    Item::optional(Some(Item::str(svn_date(entry.created_date)))),
                    Item::optional(entry.last_author.as_deref().map(Item::str)),
                ]));
            }
        }
        self.send_empty_auth().await?;
        self.writer
            .send_success(vec![
                Item::Number(rev),
                proplist(&prop_map),
                Item::List(entry_items),
            ])
            .await?;
        Ok(())
    }

    pub(crate) async fn cmd_get_iprops(&mut self, params: &[Item]) -> HandlerResult {
        let path = self.fs_path(&arg_str(params, 0, "get-iprops path")?);
        self.check_access(Operation::Read, &path)?;
        let rev = self.effective_rev(opt_rev(params, 1)).await?;
        let repo = self.repo()?.clone();

        let mut items = Vec::new();
        let mut ancestors = Vec::new();
        let mut probe = paths::parent(&path);
        while let Some(dir) = probe {
            ancestors.push(dir.to_string());
            probe = paths::parent(dir);
        }
        ancestors.reverse();
        for dir in ancestors {
            let Ok(map) = repo.fs.properties(rev, &dir, false).await else {
                continue;
            };
            let inheritable: PropertyMap = map
                .into_iter()
                .filter(|(name, _)| {
                    name == props::INHERITABLE_IGNORES || name == props::AUTO_PROPS
                })
                .collect();
            if !inheritable.is_empty() {
                items.push(Item::List(vec![
                    Item::str(dir.trim_start_matches('/')),
                    proplist(&inheritable),
                ]));
            }
        }
        self.send_empty_auth().await?;
        self.writer.send_success(vec![Item::List(items)]).await?;
        Ok(())
    }

    pub(crate) async fn cmd_log(&mut self, params: &[Item]) -> HandlerResult {
        let targets: Vec<String> = arg(params, 0, "log targets")?
            .expect_list("log targets")?
            .iter()
            .filter_map(|i| i.as_str())
            .map(|p| self.fs_path(p))
            .collect();
        for target in &targets {
            self.check_access(Operation::Read, target)?;
        }
        if targets.is_empty() {
            self.check_access(Operation::Read, &self.base_path.clone())?;
        }
        let head = self.effective_rev(None).await?;
        let start = opt_rev(params, 1).unwrap_or(head);
        let end = opt_rev(params, 2).unwrap_or(0);
        let include_changed = arg_bool(params, 3, "log changed-paths")?;
        let limit = params.get(5).and_then(|i| i.as_u64()).unwrap_or(0);

        let repo = self.repo()?.clone();
        let targets = if targets.is_empty() {
            vec![self.base_path.clone()]
        } else {
            targets
        };
        let entries = repo
            .fs
            .log(&targets, start, end, limit, include_changed)
            .await?;

        self.send_empty_auth().await?;
        for entry in entries {
            let changes: Vec<Item> = entry
                .changed
                .iter()
                .map(|change| {
                    let copy_tuple = match &change.copy_from {
                        Some((from_path, from_rev)) => Item::List(vec![
                            Item::str(from_path),
                            Item::Number(*from_rev),
                        ]),
                        None => Item::List(Vec::new()),
                    };
                    Item::List(vec![
                        Item::str(&change.path),
                        Item::word(change.action.as_str()),
                        copy_tuple,
                    ])
                })
                .collect();
            let item = Item::List(vec![
                Item::List(changes),
                Item::Number(entry.rev),
                Item::optional(Some(Item::str(&entry.author))),
                Item::optional(Some(Item::str(svn_date(entry.date)))),
                Item::optional(Some(Item::bytes(entry.message.clone().into_bytes()))),
            ]);
            self.writer.send(&item).await?;
        }
        self.writer.word("done");
        self.writer.flush().await?;
        self.writer.send_success(Vec::new()).await?;
        Ok(())
    }

    pub(crate) async fn cmd_get_locations(&mut self, params: &[Item]) -> HandlerResult {
        let path = self.fs_path(&arg_str(params, 0, "get-locations path")?);
        self.check_access(Operation::Read, &path)?;
        let peg = opt_rev(params, 1).unwrap_or(self.effective_rev(None).await?);
        let revs: Vec<u64> = arg(params, 2, "get-locations revs")?
            .expect_list("get-locations revs")?
            .iter()
            .filter_map(|i| i.as_u64())
            .collect();
        let repo = self.repo()?.clone();
        let locations = repo.fs.locations(&path, peg, &revs).await?;

        self.send_empty_auth().await?;
        for (rev, loc_path) in locations {
            self.writer
                .send(&Item::List(vec![Item::Number(rev), Item::str(&loc_path)]))
                .await?;
        }
        self.writer.word("done");
        self.writer.flush().await?;
        self.writer.send_success(Vec::new()).await?;
        Ok(())
    }

    pub(crate) async fn cmd_get_location_segments(&mut self, params: &[Item]) -> HandlerResult {
        let path = self.fs_path(&arg_str(params, 0, "get-location-segments path")?);
        self.check_access(Operation::Read, &path)?;
        let head = self.effective_rev(None).await?;
        let peg = opt_rev(params, 1).unwrap_or(head);
        let start = opt_rev(params, 2).unwrap_or(peg);
        let end = opt_rev(params, 3).unwrap_or(0);

        let repo = self.repo()?.clone();
        let history = repo.fs.history(&path, peg).await?;

        self.send_empty_auth().await?;
        // History is newest-first; each entry covers from its revision up
        // to just before the next newer entry.
        let mut upper = start.min(peg);
        for (rev, hist_path) in history {
            if upper < end {
                break;
            }
            let lower = rev.max(end);
            if lower <= upper {
                self.writer
                    .send(&Item::List(vec![
                        Item::Number(lower),
                        Item::Number(upper),
                        Item::optional(Some(Item::str(hist_path.trim_start_matches('/')))),
                    ]))
                    .await?;
            }
            if rev == 0 {
                break;
            }
            upper = rev - 1;
        }
        self.writer.word("done");
        self.writer.flush().await?;
        self.writer.send_success(Vec::new()).await?;
        Ok(())
    }

    pub(crate) async fn cmd_get_file_revs(&mut self, params: &[Item]) -> HandlerResult {
        let path = self.fs_path(&arg_str(params, 0, "get-file-revs path")?);
        self.check_access(Operation::Read, &path)?;
        let head = self.effective_rev(None).await?;
        let start = opt_rev(params, 1).unwrap_or(1);
        let end = opt_rev(params, 2).unwrap_or(head);

        let repo = self.repo()?.clone();
        let file_revs = repo.fs.file_revs(&path, start, end).await?;

        self.send_empty_auth().await?;
        let mut previous_props = PropertyMap::new();
        for file_rev in file_revs {
            let mut rev_props = PropertyMap::new();
            rev_props.insert("svn:author".to_string(), file_rev.author.into_bytes());
            rev_props.insert(
                "svn:date".to_string(),
                svn_date(file_rev.date).into_bytes(),
            );
            rev_props.insert("svn:log".to_string(), file_rev.message.into_bytes());

            let mut prop_delta = Vec::new();
            for (name, value) in &file_rev.props {
                if previous_props.get(name) != Some(value) {
                    prop_delta.push(Item::List(vec![
                        Item::str(name),
                        Item::optional(Some(Item::bytes(value.clone()))),
                    ]));
                }
            }
            for name in previous_props.keys() {
                if !file_rev.props.contains_key(name) {
                    prop_delta.push(Item::List(vec![
                        Item::str(name),
                        Item::optional(None),
                    ]));
                }
            }
            previous_props = file_rev.props.clone();

            self.writer
                .send(&Item::List(vec![
                    Item::str(&file_rev.path),
                    Item::Number(file_rev.rev),
                    proplist(&rev_props),
                    Item::List(prop_delta),
                    Item::bool(false),
                ]))
                .await?;

            // Content as a self-contained svndiff stream.
            let encoder =
                gitsvn_protocol::SvndiffEncoder::new(gitsvn_protocol::SvndiffVersion::V0);
            for chunk in encoder
                .encode(&file_rev.content)
                .map_err(|err| ServerError::Command(codes::SVN_ERR_BASE, err.to_string()))?
            {
                self.writer.string(&chunk);
            }
            self.writer.string(b"");
            self.writer.flush().await?;
        }
        self.writer.word("done");
        self.writer.flush().await?;
        self.writer.send_success(Vec::new()).await?;
        Ok(())
    }

    /// Mergeinfo is reported only to the extent it is stored; nothing is
    /// synthesized from git merge topology, so the catalog is empty.
    pub(crate) async fn cmd_get_mergeinfo(&mut self, _params: &[Item]) -> HandlerResult {
        self.check_access(Operation::Read, &self.base_path.clone())?;
        self.send_empty_auth().await?;
        self.writer
            .send_success(vec![Item::List(Vec::new())])
            .await?;
        Ok(())
    }

    pub(crate) async fn cmd_lock(&mut self, params: &[Item]) -> HandlerResult {
        let path = self.fs_path(&arg_str(params, 0, "lock path")?);
        let comment = opt_str(params, 1);
        let steal = arg_bool(params, 2, "lock steal")?;
        let current_rev = opt_rev(params, 3);
        self.check_access(
            if steal { Operation::Admin } else { Operation::Write },
            &path,
        )?;
        let owner = self
            .user
            .clone()
            .ok_or_else(|| ServerError::not_authorized())?;

        let repo = self.repo()?.clone();
        if let Some(rev) = current_rev {
            let last = repo.fs.index().last_changed(&path, repo.fs.latest_rev()?)?;
            if last > rev {
                return Err(RepoError::OutOfDate { paths: vec![path] }.into());
            }
        }
        let lock = repo.fs.locks().lock(&path, &owner, comment.as_deref(), steal)?;
        self.send_empty_auth().await?;
        self.writer.send_success(vec![lockdesc(&lock)]).await?;
        Ok(())
    }

    pub(crate) async fn cmd_unlock(&mut self, params: &[Item]) -> HandlerResult {
        let path = self.fs_path(&arg_str(params, 0, "unlock path")?);
        let token = opt_str(params, 1);
        let break_lock = arg_bool(params, 2, "unlock break-lock")?;
        self.check_access(
            if break_lock { Operation::Admin } else { Operation::Write },
            &path,
        )?;
        self.repo()?.fs.locks().unlock(&path, token.as_deref(), break_lock)?;
        self.send_empty_auth().await?;
        self.writer.send_success(Vec::new()).await?;
        Ok(())
    }

    pub(crate) async fn cmd_lock_many(&mut self, params: &[Item]) -> HandlerResult {
        let comment = opt_str(params, 0);
        let steal = arg_bool(params, 1, "lock-many steal")?;
        let targets = arg(params, 2, "lock-many targets")?
            .expect_list("lock-many targets")?
            .to_vec();
        let owner = self
            .user
            .clone()
            .ok_or_else(|| ServerError::not_authorized())?;
        let repo = self.repo()?.clone();

        self.send_empty_auth().await?;
        for target in targets {
            let Some(tuple) = target.as_list() else { continue };
            let Some(rel) = tuple.first().and_then(|i| i.as_str()) else {
                continue;
            };
            let path = self.fs_path(rel);
            let allowed = repo.authz.check(
                self.authz_user(),
                if steal { Operation::Admin } else { Operation::Write },
                &path,
            );
            let outcome = if allowed {
                repo.fs.locks().lock(&path, &owner, comment.as_deref(), steal)
            } else {
                Err(RepoError::LockDenied(path.clone()))
            };
            match outcome {
                Ok(lock) => {
                    self.writer
                        .send(&Item::List(vec![
                            Item::word("success"),
                            Item::List(vec![lockdesc(&lock)]),
                        ]))
                        .await?;
                }
                Err(err) => {
                    self.writer
                        .send(&Item::List(vec![
                            Item::word("failure"),
                            Item::List(vec![Item::List(vec![
                                Item::Number(err.svn_code()),
                                Item::str(err.to_string()),
                                Item::str(""),
                                Item::Number(0),
                            ])]),
                        ]))
                        .await?;
                }
            }
        }
        self.writer.word("done");
        self.writer.flush().await?;
        self.writer.send_success(Vec::new()).await?;
        Ok(())
    }

    pub(crate) async fn cmd_unlock_many(&mut self, params: &[Item]) -> HandlerResult {
        let break_lock = arg_bool(params, 0, "unlock-many break-lock")?;
        let targets = arg(params, 1, "unlock-many targets")?
            .expect_list("unlock-many targets")?
            .to_vec();
        let repo = self.repo()?.clone();

        self.send_empty_auth().await?;
        for target in targets {
            let Some(tuple) = target.as_list() else { continue };
            let Some(rel) = tuple.first().and_then(|i| i.as_str()) else {
                continue;
            };
            let path = self.fs_path(rel);
            let token = tuple
                .get(1)
                .and_then(|i| i.as_list())
                .and_then(|t| t.first())
                .and_then(|i| i.as_str().map(str::to_string));
            let allowed = repo.authz.check(
                self.authz_user(),
                if break_lock { Operation::Admin } else { Operation::Write },
                &path,
            );
            let outcome = if allowed {
                repo.fs.locks().unlock(&path, token.as_deref(), break_lock)
            } else {
                Err(RepoError::LockDenied(path.clone()))
            };
            match outcome {
                Ok(()) => {
                    self.writer
                        .send(&Item::List(vec![
                            Item::word("success"),
                            Item::List(vec![Item::str(&path)]),
                        ]))
                        .await?;
                }
                Err(err) => {
                    self.writer
                        .send(&Item::List(vec![
                            Item::word("failure"),
                            Item::List(vec![Item::List(vec![
                                Item::Number(err.svn_code()),
                                Item::str(err.to_string()),
                                Item::str(""),
                                Item::Number(0),
                            ])]),
                        ]))
                        .await?;
                }
            }
        }
        self.writer.word("done");
        self.writer.flush().await?;
        self.writer.send_success(Vec::new()).await?;
        Ok(())
    }

    pub(crate) async fn cmd_get_lock(&mut self, params: &[Item]) -> HandlerResult {
        let path = self.fs_path(&arg_str(params, 0, "get-lock path")?);
        self.check_access(Operation::Read, &path)?;
        let lock = self.repo()?.fs.locks().get(&path)?;
        self.send_empty_auth().await?;
        self.writer
            .send_success(vec![Item::optional(lock.as_ref().map(lockdesc))])
            .await?;
        Ok(())
    }

    pub(crate) async fn cmd_get_locks(&mut self, params: &[Item]) -> HandlerResult {
        let path = self.fs_path(&arg_str(params, 0, "get-locks path")?);
        self.check_access(Operation::Read, &path)?;
        let locks = self.repo()?.fs.locks().list(&path)?;
        let items: Vec<Item> = locks.iter().map(lockdesc).collect();
        self.send_empty_auth().await?;
        self.writer.send_success(vec![Item::List(items)]).await?;
        Ok(())
    }
}
