//! Server configuration.
//!
//! One TOML file configures the listener and any number of repositories.
//! Each repository maps a URL name to a git directory plus a metadata
//! database directory, with optional auth/authz files.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

fn default_listen() -> String {
    "0.0.0.0:3690".to_string()
}

fn default_realm() -> String {
    "gitsvn".to_string()
}

fn default_ref() -> String {
    "refs/heads/master".to_string()
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_editor_timeout() -> u64 {
    600
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    /// Listen address, e.g. `0.0.0.0:3690`.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Authentication realm announced to clients.
    #[serde(default = "default_realm")]
    pub realm: String,

    /// Seconds a connection may sit idle between commands.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Seconds one commit editor drive may take in total.
    #[serde(default = "default_editor_timeout")]
    pub editor_timeout_secs: u64,

    #[serde(default, rename = "repository")]
    pub repositories: Vec<RepositoryConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RepositoryConfig {
    /// URL name: `svn://host/<name>`.
    pub name: String,

    /// Git repository directory (bare, or a worktree with `.git`).
    pub git_dir: PathBuf,

    /// Metadata database directory (revision index, caches, locks).
    pub db_dir: PathBuf,

    /// The tracked branch ref.
    #[serde(default = "default_ref")]
    pub tracked_ref: String,

    /// Offer `ANONYMOUS` read access.
    #[serde(default)]
    pub anonymous_read: bool,

    /// `user:password` file enabling PLAIN and CRAM-MD5.
    #[serde(default)]
    pub password_file: Option<PathBuf>,

    /// SVN-style authz file; everyone gets read/write when absent.
    #[serde(default)]
    pub authz_file: Option<PathBuf>,

    /// Directory with git-lfs payloads for the `lfs` filter.
    #[serde(default)]
    pub lfs_dir: Option<PathBuf>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Config> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        if config.repositories.is_empty() {
            anyhow::bail!("configuration defines no repositories");
        }
        Ok(config)
    }

    /// Sample configuration written by `init-config`.
    pub fn sample() -> Config {
        Config {
            listen: default_listen(),
            realm: default_realm(),
            idle_timeout_secs: default_idle_timeout(),
            editor_timeout_secs: default_editor_timeout(),
            repositories: vec![RepositoryConfig {
                name: "example".to_string(),
                git_dir: PathBuf::from("/srv/git/example.git"),
                db_dir: PathBuf::from("/srv/gitsvn/example"),
                tracked_ref: default_ref(),
                anonymous_read: true,
                password_file: Some(PathBuf::from("/srv/gitsvn/example.passwd")),
                authz_file: None,
                lfs_dir: None,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let config: Config = toml::from_str(
            r#"
            [[repository]]
            name = "proj"
            git_dir = "/srv/git/proj.git"
            db_dir = "/var/lib/gitsvn/proj"
            "#,
        )
        .unwrap();
        assert_eq!(config.listen, "0.0.0.0:3690");
        assert_eq!(config.repositories.len(), 1);
        let repo = &config.repositories[0];
        assert_eq!(repo.name, "proj");
        assert_eq!(repo.tracked_ref, "refs/heads/master");
        assert!(!repo.anonymous_read);
    }

    #[test]
    fn sample_roundtrips_through_toml() {
        let sample = Config::sample();
        let text = toml::to_string_pretty(&sample).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.repositories[0].name, "example");
    }
}
