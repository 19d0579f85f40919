//! Server side of the commit editor drive.
//!
//! After the `commit` command is accepted the client streams editor
//! operations; this module maps wire tokens onto paths and feeds the core
//! [`EditorSession`]. Any failure rolls the whole edit back and is framed
//! to the client, which then aborts the drive.

use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use gitsvn_core::{paths, svn_date, CommitOptions, EditorSession, Operation};
use gitsvn_protocol::{Item, WireError};

use crate::session::{HandlerResult, ServerError, Session};

/// Wire tokens to repository paths for the in-flight edit.
#[derive(Default)]
struct TokenMap {
    dirs: HashMap<String, String>,
    files: HashMap<String, String>,
}

impl TokenMap {
    fn dir(&self, token: &str) -> Result<&str, ServerError> {
        self.dirs
            .get(token)
            .map(String::as_str)
            .ok_or_else(|| WireError::malformed(format!("unknown dir token '{token}'")).into())
    }

    fn file(&self, token: &str) -> Result<&str, ServerError> {
        self.files
            .get(token)
            .map(String::as_str)
            .ok_or_else(|| WireError::malformed(format!("unknown file token '{token}'")).into())
    }
}

fn opt_tuple_u64(item: Option<&Item>) -> Option<u64> {
    let item = item?;
    item.as_u64().or_else(|| {
        item.as_list()
            .and_then(|t| t.first())
            .and_then(|i| i.as_u64())
    })
}

fn opt_tuple_str(item: Option<&Item>) -> Option<String> {
    let item = item?;
    item.as_str().map(str::to_string).or_else(|| {
        item.as_list()
            .and_then(|t| t.first())
            .and_then(|i| i.as_str().map(str::to_string))
    })
}

fn opt_tuple_bytes(item: Option<&Item>) -> Option<Vec<u8>> {
    let item = item?;
    item.as_bytes().map(<[u8]>::to_vec).or_else(|| {
        item.as_list()
            .and_then(|t| t.first())
            .and_then(|i| i.as_bytes().map(<[u8]>::to_vec))
    })
}

/// `( ?copy-path copy-rev )`
fn opt_copy_from(item: Option<&Item>) -> Option<(String, u64)> {
    let tuple = item?.as_list()?;
    let path = tuple.first()?.as_str()?.to_string();
    let rev = tuple.get(1)?.as_u64()?;
    Some((path, rev))
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub(crate) async fn cmd_commit(&mut self, params: &[Item]) -> HandlerResult {
        let message = crate::commands::arg_str(params, 0, "commit log message")?;
        self.check_access(Operation::Write, &self.base_path.clone())?;
        let author = self
            .user
            .clone()
            .ok_or_else(ServerError::not_authorized)?;

        let mut lock_tokens = HashMap::new();
        if let Some(tuples) = params.get(1).and_then(|i| i.as_list()) {
            for tuple in tuples {
                let Some(pair) = tuple.as_list() else { continue };
                if let (Some(path), Some(token)) = (
                    pair.first().and_then(|i| i.as_str()),
                    pair.get(1).and_then(|i| i.as_str()),
                ) {
                    lock_tokens.insert(self.fs_path(path), token.to_string());
                }
            }
        }
        let keep_locks = params.get(2).and_then(|i| i.as_bool()).unwrap_or(false);

        let repo = self.repo()?.clone();
        repo.fs.observe().await?;
        let base_rev = repo.fs.latest_rev()?;
        let options = CommitOptions {
            base_rev,
            message,
            author,
            lock_tokens,
            keep_locks,
        };
        let mut editor = EditorSession::begin(repo.fs.clone(), options).await?;

        self.send_empty_auth().await?;
        self.writer.send_success(Vec::new()).await?;

        let timeout = self.editor_timeout;
        let drive = tokio::time::timeout(timeout, self.consume_edit(&mut editor)).await;
        match drive {
            Ok(result) => result,
            Err(_) => {
                editor.abort();
                Err(ServerError::Fatal("editor session timed out".to_string()))
            }
        }
    }

    /// Consumes editor commands until the edit closes or aborts.
    async fn consume_edit(&mut self, editor: &mut EditorSession) -> HandlerResult {
        let mut tokens = TokenMap::default();
        loop {
            let frame = self.read_item().await?;
            let parts = frame.expect_list("editor command")?;
            let Some(cmd) = parts.first().and_then(|i| i.as_word()) else {
                return Err(WireError::malformed("editor command missing word").into());
            };
            let cmd = cmd.to_string();
            let params: Vec<Item> = parts
                .get(1)
                .and_then(|i| i.as_list())
                .map(<[Item]>::to_vec)
                .unwrap_or_default();

            match self.apply_edit_op(editor, &mut tokens, &cmd, &params).await {
                Ok(EditStep::Continue) => {}
                Ok(EditStep::Closed) => return Ok(()),
                Err(err) => {
                    editor.abort();
                    let (code, msg) = match &err {
                        ServerError::Repo(repo_err) => {
                            (repo_err.svn_code(), repo_err.to_string())
                        }
                        ServerError::Command(code, msg) => (*code, msg.clone()),
                        other => return Err(ServerError::Fatal(other.to_string())),
                    };
                    warn!(command = %cmd, error = %msg, "commit edit failed");
                    self.writer.send_failure(code, &msg).await?;
                    return self.drain_edit().await;
                }
            }
        }
    }

    /// After a framed failure the client winds the drive down; swallow
    /// operations until it aborts (or closes) the edit.
    async fn drain_edit(&mut self) -> HandlerResult {
        loop {
            let frame = self.read_item().await?;
            let cmd = frame
                .as_list()
                .and_then(|parts| parts.first())
                .and_then(|i| i.as_word())
                .unwrap_or("");
            match cmd {
                "abort-edit" => {
                    self.writer.send_success(Vec::new()).await?;
                    return Ok(());
                }
                "close-edit" => {
                    self.writer
                        .send_failure(
                            gitsvn_protocol::codes::SVN_ERR_RA_SVN_EDIT_ABORTED,
                            "edit already failed",
                        )
                        .await?;
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    async fn apply_edit_op(
        &mut self,
        editor: &mut EditorSession,
        tokens: &mut TokenMap,
        cmd: &str,
        params: &[Item],
    ) -> Result<EditStep, ServerError> {
        match cmd {
            "open-root" => {
                let token = params
                    .get(1)
                    .and_then(|i| i.as_str())
                    .ok_or_else(|| WireError::malformed("open-root missing token"))?;
                editor.open_root()?;
                tokens.dirs.insert(token.to_string(), self.base_path.clone());
                Ok(EditStep::Continue)
            }
            "delete-entry" => {
                let rel = params
                    .first()
                    .and_then(|i| i.as_str())
                    .ok_or_else(|| WireError::malformed("delete-entry missing path"))?;
                let rev = opt_tuple_u64(params.get(1));
                let path = self.fs_path(rel);
                editor.delete_entry(&path, rev).await?;
                Ok(EditStep::Continue)
            }
            "add-dir" => {
                let (rel, child_token) = path_and_child_token(params, "add-dir")?;
                let copy = self.resolve_copy_source(opt_copy_from(params.get(3)))?;
                let path = self.fs_path(&rel);
                editor.add_dir(&path, copy).await?;
                tokens.dirs.insert(child_token, path);
                Ok(EditStep::Continue)
            }
            "open-dir" => {
                let (rel, child_token) = path_and_child_token(params, "open-dir")?;
                let rev = opt_tuple_u64(params.get(3));
                let path = self.fs_path(&rel);
                editor.open_dir(&path, rev).await?;
                tokens.dirs.insert(child_token, path);
                Ok(EditStep::Continue)
            }
            "change-dir-prop" => {
                let token = params
                    .first()
                    .and_then(|i| i.as_str())
                    .ok_or_else(|| WireError::malformed("change-dir-prop missing token"))?;
                let name = params
                    .get(1)
                    .and_then(|i| i.as_str())
                    .ok_or_else(|| WireError::malformed("change-dir-prop missing name"))?;
                tokens.dir(token)?;
                editor.change_dir_prop(name, opt_tuple_bytes(params.get(2)))?;
                Ok(EditStep::Continue)
            }
            "close-dir" => {
                let token = params
                    .first()
                    .and_then(|i| i.as_str())
                    .ok_or_else(|| WireError::malformed("close-dir missing token"))?;
                tokens.dir(token)?;
                editor.close_dir()?;
                Ok(EditStep::Continue)
            }
            "add-file" => {
                let (rel, file_token) = path_and_child_token(params, "add-file")?;
                let copy = self.resolve_copy_source(opt_copy_from(params.get(3)))?;
                let path = self.fs_path(&rel);
                editor.add_file(&path, copy).await?;
                tokens.files.insert(file_token, path);
                Ok(EditStep::Continue)
            }
            "open-file" => {
                let (rel, file_token) = path_and_child_token(params, "open-file")?;
                let rev = opt_tuple_u64(params.get(3));
                let path = self.fs_path(&rel);
                editor.open_file(&path, rev).await?;
                tokens.files.insert(file_token, path);
                Ok(EditStep::Continue)
            }
            "apply-textdelta" => {
                let token = params
                    .first()
                    .and_then(|i| i.as_str())
                    .ok_or_else(|| WireError::malformed("apply-textdelta missing token"))?;
                tokens.file(token)?;
                editor.apply_textdelta(opt_tuple_str(params.get(1))).await?;
                Ok(EditStep::Continue)
            }
            "textdelta-chunk" => {
                let chunk = params
                    .get(1)
                    .and_then(|i| i.as_bytes())
                    .ok_or_else(|| WireError::malformed("textdelta-chunk missing chunk"))?;
                editor.textdelta_chunk(chunk)?;
                Ok(EditStep::Continue)
            }
            "textdelta-end" => {
                editor.textdelta_end()?;
                Ok(EditStep::Continue)
            }
            "change-file-prop" => {
                let token = params
                    .first()
                    .and_then(|i| i.as_str())
                    .ok_or_else(|| WireError::malformed("change-file-prop missing token"))?;
                let name = params
                    .get(1)
                    .and_then(|i| i.as_str())
                    .ok_or_else(|| WireError::malformed("change-file-prop missing name"))?;
                tokens.file(token)?;
                editor.change_file_prop(name, opt_tuple_bytes(params.get(2)))?;
                Ok(EditStep::Continue)
            }
            "close-file" => {
                let token = params
                    .first()
                    .and_then(|i| i.as_str())
                    .ok_or_else(|| WireError::malformed("close-file missing token"))?;
                tokens.file(token)?;
                editor.close_file(opt_tuple_str(params.get(1)))?;
                Ok(EditStep::Continue)
            }
            "close-edit" => {
                let result = editor.close_edit().await?;
                debug!(rev = result.rev, "commit finished");
                self.writer.send_success(Vec::new()).await?;
                self.send_empty_auth().await?;
                self.writer
                    .send(&Item::List(vec![
                        Item::Number(result.rev),
                        Item::optional(Some(Item::str(svn_date(result.date)))),
                        Item::optional(Some(Item::str(&result.author))),
                        Item::optional(None),
                    ]))
                    .await?;
                Ok(EditStep::Closed)
            }
            "abort-edit" => {
                editor.abort();
                self.writer.send_success(Vec::new()).await?;
                Ok(EditStep::Closed)
            }
            other => Err(WireError::malformed(format!(
                "unexpected editor command '{other}'"
            ))
            .into()),
        }
    }

    /// Copy sources arrive as URLs from working-copy clients; map them back
    /// into this repository.
    fn resolve_copy_source(
        &self,
        copy: Option<(String, u64)>,
    ) -> Result<Option<(String, u64)>, ServerError> {
        let Some((source, rev)) = copy else {
            return Ok(None);
        };
        let path = if source.starts_with("svn://") {
            let Some((repo_name, path, _)) = crate::session::parse_session_url(&source) else {
                return Err(WireError::malformed(format!(
                    "malformed copy source '{source}'"
                ))
                .into());
            };
            if repo_name != self.repo()?.name {
                return Err(ServerError::Command(
                    gitsvn_protocol::codes::SVN_ERR_RA_SVN_REPOS_NOT_FOUND,
                    "copy source crosses repositories".to_string(),
                ));
            }
            path
        } else {
            paths::canonical(&source)
        };
        Ok(Some((path, rev)))
    }
}

enum EditStep {
    Continue,
    Closed,
}

fn path_and_child_token(params: &[Item], ctx: &str) -> Result<(String, String), ServerError> {
    let path = params
        .first()
        .and_then(|i| i.as_str())
        .ok_or_else(|| WireError::malformed(format!("{ctx} missing path")))?;
    let token = params
        .get(2)
        .and_then(|i| i.as_str())
        .ok_or_else(|| WireError::malformed(format!("{ctx} missing token")))?;
    Ok((path.to_string(), token.to_string()))
}
