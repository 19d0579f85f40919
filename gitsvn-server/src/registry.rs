//! Repository registry: URL name to open repository handle.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use gitsvn_core::{
    AllowAll, AnonymousProvider, AuthProvider, AuthzProvider, Database, FilterContext, GitFs,
    LooseStore, PasswordFileProvider, SvnAuthz,
};

use crate::config::{Config, RepositoryConfig};

pub struct RepoHandle {
    pub name: String,
    pub fs: Arc<GitFs>,
    pub auth: Arc<dyn AuthProvider>,
    pub authz: Arc<dyn AuthzProvider>,
    pub anonymous_read: bool,
}

pub struct RepositoryRegistry {
    repos: HashMap<String, Arc<RepoHandle>>,
    pub realm: String,
    pub idle_timeout_secs: u64,
    pub editor_timeout_secs: u64,
}

impl RepositoryRegistry {
    pub async fn open(config: &Config) -> anyhow::Result<Arc<RepositoryRegistry>> {
        let mut repos = HashMap::new();
        for repo_config in &config.repositories {
            let handle = Self::open_repo(repo_config, &config.realm)
                .await
                .with_context(|| format!("repository '{}'", repo_config.name))?;
            repos.insert(repo_config.name.clone(), Arc::new(handle));
        }
        Ok(Arc::new(RepositoryRegistry {
            repos,
            realm: config.realm.clone(),
            idle_timeout_secs: config.idle_timeout_secs,
            editor_timeout_secs: config.editor_timeout_secs,
        }))
    }

    async fn open_repo(config: &RepositoryConfig, realm: &str) -> anyhow::Result<RepoHandle> {
        let store = Arc::new(LooseStore::open(&config.git_dir)?);
        let db = Arc::new(Database::open(&config.db_dir)?);
        let filter_ctx = FilterContext {
            lfs_dir: config.lfs_dir.clone(),
        };
        let fs = GitFs::open(store, db, config.tracked_ref.clone(), filter_ctx).await?;

        let auth: Arc<dyn AuthProvider> = match &config.password_file {
            Some(path) => Arc::new(
                PasswordFileProvider::from_file(path, realm).map_err(anyhow::Error::msg)?,
            ),
            None => Arc::new(AnonymousProvider),
        };
        let authz: Arc<dyn AuthzProvider> = match &config.authz_file {
            Some(path) => Arc::new(SvnAuthz::from_file(path).map_err(anyhow::Error::msg)?),
            None => Arc::new(AllowAll),
        };
        // A repository without a password file is only reachable anonymously.
        let anonymous_read = config.anonymous_read || config.password_file.is_none();

        info!(
            name = %config.name,
            git_dir = %config.git_dir.display(),
            latest = fs.latest_rev()?,
            "repository opened"
        );
        Ok(RepoHandle {
            name: config.name.clone(),
            fs,
            auth,
            authz,
            anonymous_read,
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<RepoHandle>> {
        self.repos.get(name).cloned()
    }

    /// Registry over one pre-built handle; used by embedders and tests.
    pub fn single(handle: RepoHandle, realm: &str) -> Arc<RepositoryRegistry> {
        let mut repos = HashMap::new();
        repos.insert(handle.name.clone(), Arc::new(handle));
        Arc::new(RepositoryRegistry {
            repos,
            realm: realm.to_string(),
            idle_timeout_secs: 60,
            editor_timeout_secs: 600,
        })
    }
}
