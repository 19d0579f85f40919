//! One `svn://` connection.
//!
//! Lifecycle: greeting and version/capability negotiation, mechanism
//! authentication, repository open, then the command loop. The engine owns
//! the wire reader/writer; command handlers live in `commands`, the
//! update/report driver in `report` and the commit editor in `editor`.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use gitsvn_core::{Operation, RepoError};
use gitsvn_protocol::{codes, Item, ItemReader, ItemWriter, WireError};

use crate::registry::{RepoHandle, RepositoryRegistry};

/// Capabilities this server advertises in the greeting.
pub const SERVER_CAPABILITIES: &[&str] = &[
    "edit-pipeline",
    "svndiff1",
    "absent-entries",
    "commit-revprops",
    "depth",
    "log-revprops",
    "atomic-revprops",
    "partial-replay",
    "inherited-props",
    "mergeinfo",
];

const MAX_AUTH_ATTEMPTS: u32 = 3;

/// Errors surfaced by command handlers.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Wire(#[from] WireError),

    /// Framed to the client with the given code; session continues.
    #[error("{1}")]
    Command(u64, String),

    /// Connection must close.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ServerError {
    pub fn not_authorized() -> Self {
        ServerError::Command(
            codes::SVN_ERR_RA_NOT_AUTHORIZED,
            "authorization failed".to_string(),
        )
    }

    fn framed_code(&self) -> Option<(u64, String)> {
        match self {
            ServerError::Repo(err) if err.is_recoverable() => {
                Some((err.svn_code(), err.to_string()))
            }
            ServerError::Command(code, msg) => Some((*code, msg.clone())),
            _ => None,
        }
    }
}

pub type HandlerResult = std::result::Result<(), ServerError>;

pub struct Session<R, W> {
    pub(crate) reader: ItemReader<R>,
    pub(crate) writer: ItemWriter<W>,
    pub(crate) registry: Arc<RepositoryRegistry>,
    pub(crate) repo: Option<Arc<RepoHandle>>,
    pub(crate) user: Option<String>,
    /// Directory within the repository the session URL points at.
    pub(crate) base_path: String,
    pub(crate) root_url: String,
    idle_timeout: Duration,
    pub(crate) editor_timeout: Duration,
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(registry: Arc<RepositoryRegistry>, read: R, write: W) -> Self {
        let idle_timeout = Duration::from_secs(registry.idle_timeout_secs);
        let editor_timeout = Duration::from_secs(registry.editor_timeout_secs);
        Session {
            reader: ItemReader::new(read),
            writer: ItemWriter::new(write),
            registry,
            repo: None,
            user: None,
            base_path: "/".to_string(),
            root_url: String::new(),
            idle_timeout,
            editor_timeout,
        }
    }

    pub(crate) fn repo(&self) -> Result<&Arc<RepoHandle>, ServerError> {
        self.repo
            .as_ref()
            .ok_or_else(|| ServerError::Fatal("no repository open".to_string()))
    }

    /// The user identity the ACL sees; anonymous sessions have none.
    pub(crate) fn authz_user(&self) -> Option<&str> {
        match self.user.as_deref() {
            Some("anonymous") | None => None,
            Some(user) => Some(user),
        }
    }

    pub(crate) fn check_access(&self, op: Operation, path: &str) -> HandlerResult {
        let repo = self.repo()?;
        if repo.authz.check(self.authz_user(), op, path) {
            Ok(())
        } else {
            Err(ServerError::not_authorized())
        }
    }

    /// Reads one item, bounded by the idle timeout.
    pub(crate) async fn read_item(&mut self) -> Result<Item, ServerError> {
        match tokio::time::timeout(self.idle_timeout, self.reader.read_item()).await {
            Ok(item) => Ok(item?),
            Err(_) => Err(ServerError::Fatal("idle timeout".to_string())),
        }
    }

    /// The empty re-auth request sent before every command response.
    pub(crate) async fn send_empty_auth(&mut self) -> Result<(), ServerError> {
        let realm = self.registry.realm.clone();
        self.writer
            .send_success(vec![Item::List(Vec::new()), Item::str(realm)])
            .await?;
        Ok(())
    }

    /// Runs the whole connection to completion.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.greet().await?;
        if !self.open_repository().await? {
            return Ok(());
        }
        self.command_loop().await
    }

    async fn greet(&mut self) -> Result<(), ServerError> {
        let caps: Vec<Item> = SERVER_CAPABILITIES.iter().map(|c| Item::word(*c)).collect();
        self.writer
            .send_success(vec![
                Item::Number(2),
                Item::Number(2),
                Item::List(Vec::new()),
                Item::List(caps),
            ])
            .await?;
        Ok(())
    }

    /// Client greeting response, auth exchange and repos-info. Returns
    /// false when the connection cannot proceed (bad version, unknown
    /// repository, auth failure).
    async fn open_repository(&mut self) -> Result<bool, ServerError> {
        let response = self.read_item().await?;
        let parts = response.expect_list("client greeting")?;
        if parts.len() < 3 {
            return Err(WireError::malformed("client greeting too short").into());
        }
        let version = parts[0].expect_u64("protocol version")?;
        if version != 2 {
            self.writer
                .send_failure(
                    codes::SVN_ERR_RA_SVN_BAD_VERSION,
                    &format!("unsupported protocol version {version}"),
                )
                .await?;
            return Ok(false);
        }
        let client_caps: Vec<String> = parts[1]
            .as_list()
            .map(|caps| {
                caps.iter()
                    .filter_map(|c| c.as_word().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let url = parts[2].expect_str("session url")?.to_string();
        debug!(%url, caps = ?client_caps, "client greeting");

        let Some((repo_name, base_path, root_url)) = parse_session_url(&url) else {
            self.writer
                .send_failure(codes::SVN_ERR_RA_SVN_REPOS_NOT_FOUND, "malformed URL")
                .await?;
            return Ok(false);
        };
        let Some(repo) = self.registry.get(&repo_name) else {
            self.writer
                .send_failure(
                    codes::SVN_ERR_RA_SVN_REPOS_NOT_FOUND,
                    &format!("no repository found in '{url}'"),
                )
                .await?;
            return Ok(false);
        };
        self.repo = Some(repo);
        self.base_path = base_path;
        self.root_url = root_url;

        if !self.authenticate().await? {
            return Ok(false);
        }

        // Newly observed commits (pushed via git) become visible at open.
        let repo = self.repo()?.clone();
        repo.fs.observe().await?;

        let uuid = repo.fs.uuid().to_string();
        let root_url = self.root_url.clone();
        let caps: Vec<Item> = SERVER_CAPABILITIES.iter().map(|c| Item::word(*c)).collect();
        self.writer
            .send_success(vec![Item::str(uuid), Item::str(root_url), Item::List(caps)])
            .await?;
        info!(user = ?self.user, repo = %repo.name, "session open");
        Ok(true)
    }

    async fn authenticate(&mut self) -> Result<bool, ServerError> {
        let repo = self.repo()?.clone();
        let mechs = repo.auth.mechanisms(repo.anonymous_read);
        let realm = self.registry.realm.clone();

        // The mechanism list goes out once; a rejected attempt is answered
        // with a failure item and the client simply sends its next choice.
        let mech_items: Vec<Item> = mechs.iter().map(|m| Item::word(*m)).collect();
        self.writer
            .send_success(vec![Item::List(mech_items), Item::str(&realm)])
            .await?;

        for attempt in 0..MAX_AUTH_ATTEMPTS {
            let choice = self.read_item().await?;
            let parts = choice.expect_list("auth mechanism choice")?;
            if parts.is_empty() {
                return Err(WireError::malformed("empty auth choice").into());
            }
            let mech = parts[0].expect_word("auth mechanism")?.to_string();
            let initial: Option<Vec<u8>> = parts
                .get(1)
                .and_then(|i| i.as_list())
                .and_then(|t| t.first())
                .and_then(|i| i.as_bytes().map(<[u8]>::to_vec));

            let Some(mut auth_attempt) = repo.auth.start(&mech, repo.anonymous_read).await else {
                self.writer
                    .send(&Item::List(vec![
                        Item::word("failure"),
                        Item::List(vec![Item::str(format!("mechanism {mech} not offered"))]),
                    ]))
                    .await?;
                continue;
            };

            let mut response = initial.unwrap_or_default();
            let accepted = loop {
                match auth_attempt.step(&response) {
                    gitsvn_core::AuthOutcome::Challenge(challenge) => {
                        self.writer
                            .send(&Item::List(vec![
                                Item::word("step"),
                                Item::List(vec![Item::bytes(challenge)]),
                            ]))
                            .await?;
                        let reply = self.read_item().await?;
                        response = reply
                            .as_bytes()
                            .map(<[u8]>::to_vec)
                            .ok_or_else(|| WireError::malformed("auth reply not a string"))?;
                    }
                    gitsvn_core::AuthOutcome::Authenticated(user) => {
                        self.writer
                            .send(&Item::List(vec![
                                Item::word("success"),
                                Item::List(Vec::new()),
                            ]))
                            .await?;
                        self.user = Some(user);
                        break true;
                    }
                    gitsvn_core::AuthOutcome::Rejected(reason) => {
                        warn!(mech = %mech, attempt, "authentication rejected");
                        self.writer
                            .send(&Item::List(vec![
                                Item::word("failure"),
                                Item::List(vec![Item::str(&reason)]),
                            ]))
                            .await?;
                        break false;
                    }
                }
            };
            if accepted {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn command_loop(&mut self) -> anyhow::Result<()> {
        loop {
            let frame = match self.read_item().await {
                Ok(frame) => frame,
                Err(ServerError::Wire(WireError::UnexpectedEof)) => {
                    debug!("client disconnected");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };
            let parts = match frame.as_list() {
                Some(parts) if !parts.is_empty() => parts,
                _ => {
                    self.writer
                        .send_failure(codes::SVN_ERR_RA_SVN_MALFORMED_DATA, "malformed command")
                        .await?;
                    return Ok(());
                }
            };
            let command = match parts[0].as_word() {
                Some(word) => word.to_string(),
                None => {
                    self.writer
                        .send_failure(codes::SVN_ERR_RA_SVN_MALFORMED_DATA, "malformed command")
                        .await?;
                    return Ok(());
                }
            };
            let params: Vec<Item> = parts
                .get(1)
                .and_then(|i| i.as_list())
                .map(<[Item]>::to_vec)
                .unwrap_or_default();
            debug!(command = %command, "dispatch");

            match self.dispatch(&command, &params).await {
                Ok(()) => {}
                Err(err) => match err.framed_code() {
                    Some((code, msg)) => {
                        self.writer.send_failure(code, &msg).await?;
                    }
                    None => {
                        warn!(command = %command, error = %err, "fatal command error");
                        let _ = self
                            .writer
                            .send_failure(codes::SVN_ERR_BASE, "internal error")
                            .await;
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn dispatch(&mut self, command: &str, params: &[Item]) -> HandlerResult {
        match command {
            "reparent" => self.cmd_reparent(params).await,
            "get-latest-rev" => self.cmd_get_latest_rev(params).await,
            "get-dated-rev" => self.cmd_get_dated_rev(params).await,
            "rev-proplist" => self.cmd_rev_proplist(params).await,
            "rev-prop" => self.cmd_rev_prop(params).await,
            "change-rev-prop" => self.cmd_change_rev_prop(params).await,
            "get-file" => self.cmd_get_file(params).await,
            "get-dir" => self.cmd_get_dir(params).await,
            "check-path" => self.cmd_check_path(params).await,
            "stat" => self.cmd_stat(params).await,
            "get-iprops" => self.cmd_get_iprops(params).await,
            "log" => self.cmd_log(params).await,
            "get-locations" => self.cmd_get_locations(params).await,
            "get-location-segments" => self.cmd_get_location_segments(params).await,
            "get-file-revs" => self.cmd_get_file_revs(params).await,
            "get-mergeinfo" => self.cmd_get_mergeinfo(params).await,
            "lock" => self.cmd_lock(params).await,
            "unlock" => self.cmd_unlock(params).await,
            "lock-many" => self.cmd_lock_many(params).await,
            "unlock-many" => self.cmd_unlock_many(params).await,
            "get-lock" => self.cmd_get_lock(params).await,
            "get-locks" => self.cmd_get_locks(params).await,
            "update" => self.cmd_update(params).await,
            "switch" => self.cmd_switch(params).await,
            "status" => self.cmd_status(params).await,
            "diff" => self.cmd_diff(params).await,
            "replay" => self.cmd_replay(params).await,
            "replay-range" => self.cmd_replay_range(params).await,
            "commit" => self.cmd_commit(params).await,
            other => {
                self.writer
                    .send_failure(
                        codes::SVN_ERR_RA_SVN_UNKNOWN_CMD,
                        &format!("unknown command '{other}'"),
                    )
                    .await?;
                Ok(())
            }
        }
    }
}

/// Splits `svn://host[:port]/repo[/dir...]` into the repository name, the
/// directory within it, and the repository root URL.
pub(crate) fn parse_session_url(url: &str) -> Option<(String, String, String)> {
    let rest = url.strip_prefix("svn://")?;
    let (host, path) = match rest.split_once('/') {
        Some((host, path)) => (host, path),
        None => (rest, ""),
    };
    if host.is_empty() {
        return None;
    }
    let path = path.trim_matches('/');
    if path.is_empty() {
        return None;
    }
    let (repo, dir) = match path.split_once('/') {
        Some((repo, dir)) => (repo, format!("/{dir}")),
        None => (path, "/".to_string()),
    };
    Some((
        repo.to_string(),
        gitsvn_core::paths::canonical(&dir),
        format!("svn://{host}/{repo}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_session_urls() {
        assert_eq!(
            parse_session_url("svn://example.com/proj"),
            Some((
                "proj".to_string(),
                "/".to_string(),
                "svn://example.com/proj".to_string()
            ))
        );
        assert_eq!(
            parse_session_url("svn://example.com:3690/proj/trunk/src"),
            Some((
                "proj".to_string(),
                "/trunk/src".to_string(),
                "svn://example.com:3690/proj".to_string()
            ))
        );
        assert_eq!(parse_session_url("svn://example.com/"), None);
        assert_eq!(parse_session_url("http://example.com/x"), None);
    }
}
