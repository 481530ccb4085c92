//! Remote config store
//!
//! Create, read and update `.conf` files in a single directory on a remote
//! host, reached through the connection pool. The remote filesystem has no
//! compare-and-swap, so writes to one file are serialized with a per-filename
//! lock and updates only go through if the caller saw the current content.
//!
//! Rejections (bad name, file exists, stale content, restart busy) are
//! ordinary [`Outcome`] values; only connection and I/O failures are errors.

mod file_lock;
mod name;

pub use file_lock::FileLockTable;
pub use name::{is_valid_config_name, CONFIG_SUFFIX};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::{DEFAULT_RESTART_COMMAND, DEFAULT_RESTART_EXPECT};
use crate::ssh::{
    ConnectionPool, Connector, Credentials, Endpoint, PoolError, PooledSession, RemoteSession,
    TransportError,
};

/// Where the configs live and how to reach them
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub endpoint: Endpoint,
    pub credentials: Credentials,
    pub config_dir: String,
    pub restart_command: String,
    pub restart_expect: String,
}

impl StoreConfig {
    pub fn new(endpoint: Endpoint, credentials: Credentials, config_dir: impl Into<String>) -> Self {
        Self {
            endpoint,
            credentials,
            config_dir: config_dir.into(),
            restart_command: DEFAULT_RESTART_COMMAND.to_string(),
            restart_expect: DEFAULT_RESTART_EXPECT.to_string(),
        }
    }
}

/// Listing entry for one config file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    pub name: String,
    pub size: u64,
    pub mod_time: Option<SystemTime>,
}

/// Why a request was turned down without anything going wrong
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("invalid config name {0:?}")]
    InvalidName(String),

    #[error("config file {0} already exists")]
    AlreadyExists(String),

    #[error("config {0} has been modified, re-read it and try again")]
    Conflict(String),

    #[error("a restart is already running, please try later")]
    Busy,

    #[error("restart failed: {0}")]
    RestartFailed(String),
}

/// Result of a store operation that completed without a system error
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Done(T),
    Rejected(Rejection),
}

impl<T> Outcome<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Done(_) => None,
            Self::Rejected(rejection) => Some(rejection),
        }
    }

    pub fn into_result(self) -> std::result::Result<T, Rejection> {
        match self {
            Self::Done(value) => Ok(value),
            Self::Rejected(rejection) => Err(rejection),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to run `{command}`: {source}")]
    Exec {
        command: String,
        #[source]
        source: TransportError,
    },
}

type Result<T> = std::result::Result<T, StoreError>;

pub struct ConfigStore<C: Connector> {
    pool: Arc<ConnectionPool<C>>,
    file_locks: Arc<FileLockTable>,
    restart_lock: Mutex<()>,
    config: StoreConfig,
}

impl<C: Connector> ConfigStore<C> {
    pub fn new(pool: Arc<ConnectionPool<C>>, config: StoreConfig) -> Self {
        Self::with_file_locks(pool, Arc::new(FileLockTable::new()), config)
    }

    pub fn with_file_locks(
        pool: Arc<ConnectionPool<C>>,
        file_locks: Arc<FileLockTable>,
        config: StoreConfig,
    ) -> Self {
        Self {
            pool,
            file_locks,
            restart_lock: Mutex::new(()),
            config,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<C>> {
        &self.pool
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    async fn session(&self) -> Result<PooledSession<C::Session>> {
        Ok(self
            .pool
            .acquire(&self.config.endpoint, &self.config.credentials)
            .await?)
    }

    fn path(&self, name: &str) -> String {
        format!("{}/{name}", self.config.config_dir.trim_end_matches('/'))
    }

    /// Hidden sibling of `name`; never ends in `.conf` so listings skip it
    fn scratch_path(&self, name: &str, ext: &str) -> String {
        self.path(&format!(".{name}.{}.{ext}", Uuid::new_v4().simple()))
    }

    /// List every `.conf` file in the config directory, sorted by name
    pub async fn list_all(&self) -> Result<Vec<ConfigFile>> {
        let session = self.session().await?;
        let dir = &self.config.config_dir;

        let entries = match session.list_dir(dir).await {
            Ok(entries) => entries,
            Err(source) => return Err(io_failure(session, dir, source).await),
        };
        drop(session);

        let mut files: Vec<ConfigFile> = entries
            .into_iter()
            .filter(|entry| !entry.is_dir && entry.name.ends_with(CONFIG_SUFFIX))
            .map(|entry| ConfigFile {
                name: entry.name,
                size: entry.size,
                mod_time: entry.modified,
            })
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Read several configs at once. Any invalid name rejects the whole
    /// request; the first I/O failure aborts it with no partial result.
    pub async fn read(&self, names: &[String]) -> Result<Outcome<BTreeMap<String, Bytes>>> {
        if let Some(invalid) = names.iter().find(|name| !is_valid_config_name(name)) {
            tracing::warn!("Invalid config name: {invalid:?}");
            return Ok(Outcome::Rejected(Rejection::InvalidName(invalid.clone())));
        }

        let session = self.session().await?;
        let mut contents = BTreeMap::new();
        for name in names {
            let path = self.path(name);
            match session.read_file(&path).await {
                Ok(content) => {
                    contents.insert(name.clone(), content);
                }
                Err(source) => return Err(io_failure(session, &path, source).await),
            }
        }

        Ok(Outcome::Done(contents))
    }

    /// Create a new config. Never overwrites an existing file.
    pub async fn create(&self, name: &str, content: &[u8]) -> Result<Outcome<()>> {
        if !is_valid_config_name(name) {
            tracing::warn!("Invalid config name: {name:?}");
            return Ok(Outcome::Rejected(Rejection::InvalidName(name.to_string())));
        }

        let _file_lock = self.file_locks.lock(name).await;
        let session = self.session().await?;
        let path = self.path(name);

        match session.exists(&path).await {
            Ok(false) => {}
            Ok(true) => {
                tracing::debug!("Config {path} already exists");
                return Ok(Outcome::Rejected(Rejection::AlreadyExists(name.to_string())));
            }
            Err(source) => return Err(io_failure(session, &path, source).await),
        }

        let tmp = self.scratch_path(name, "tmp");
        if let Err(source) = session.write_file(&tmp, content).await {
            remove_quietly(&*session, &tmp).await;
            return Err(io_failure(session, &tmp, source).await);
        }
        if let Err(source) = session.rename(&tmp, &path).await {
            remove_quietly(&*session, &tmp).await;
            return Err(io_failure(session, &path, source).await);
        }

        tracing::info!("Created config {path} ({} bytes)", content.len());
        Ok(Outcome::Done(()))
    }

    /// Replace a config, but only if its live content still equals `current`.
    ///
    /// Read, compare and write all happen under the file's lock; that lock
    /// is what makes the comparison meaningful.
    pub async fn update(&self, name: &str, current: &[u8], expected: &[u8]) -> Result<Outcome<()>> {
        if !is_valid_config_name(name) {
            tracing::warn!("Invalid config name: {name:?}");
            return Ok(Outcome::Rejected(Rejection::InvalidName(name.to_string())));
        }

        let _file_lock = self.file_locks.lock(name).await;
        let session = self.session().await?;
        let path = self.path(name);

        let live = match session.read_file(&path).await {
            Ok(live) => live,
            Err(source) => return Err(io_failure(session, &path, source).await),
        };
        if live[..] != *current {
            tracing::debug!("Config {path} changed since the caller read it");
            return Ok(Outcome::Rejected(Rejection::Conflict(name.to_string())));
        }

        // Stage the new content, move the old file aside, then swap in.
        // The target is never visible half-written.
        let tmp = self.scratch_path(name, "tmp");
        if let Err(source) = session.write_file(&tmp, expected).await {
            remove_quietly(&*session, &tmp).await;
            return Err(io_failure(session, &tmp, source).await);
        }

        let backup = self.scratch_path(name, "bak");
        if let Err(source) = session.rename(&path, &backup).await {
            remove_quietly(&*session, &tmp).await;
            return Err(io_failure(session, &path, source).await);
        }

        if let Err(source) = session.rename(&tmp, &path).await {
            if let Err(e) = session.rename(&backup, &path).await {
                tracing::error!("Failed to restore {path} from {backup}: {e}");
            }
            remove_quietly(&*session, &tmp).await;
            return Err(io_failure(session, &path, source).await);
        }

        if let Err(e) = session.remove_file(&backup).await {
            tracing::warn!("Failed to remove backup {backup}: {e}");
        }

        tracing::info!("Updated config {path} ({} bytes)", expected.len());
        Ok(Outcome::Done(()))
    }

    /// Run the configured restart command on the remote host.
    /// Only one restart runs at a time; others are turned away, not queued.
    pub async fn restart(&self) -> Result<Outcome<String>> {
        let Ok(_restart) = self.restart_lock.try_lock() else {
            tracing::warn!("Restart is already running");
            return Ok(Outcome::Rejected(Rejection::Busy));
        };

        let session = self.session().await?;
        let command = &self.config.restart_command;
        let result = match session.exec(command).await {
            Ok(result) => result,
            Err(source) => {
                tracing::error!("Restart command `{command}` failed: {source}");
                session.recycle_after_error().await;
                return Err(StoreError::Exec {
                    command: command.clone(),
                    source,
                });
            }
        };
        drop(session);

        tracing::debug!("Restart command output: {}", result.output);
        if !result.output.contains(&self.config.restart_expect) {
            tracing::warn!(
                "Restart output does not contain {:?} (exit code {:?})",
                self.config.restart_expect,
                result.exit_code
            );
            return Ok(Outcome::Rejected(Rejection::RestartFailed(
                result.output.trim().to_string(),
            )));
        }

        Ok(Outcome::Done(result.output))
    }
}

async fn io_failure<S: RemoteSession>(
    session: PooledSession<S>,
    path: &str,
    source: TransportError,
) -> StoreError {
    tracing::error!("I/O error on {path}: {source}");
    session.recycle_after_error().await;
    StoreError::Io {
        path: path.to_string(),
        source,
    }
}

async fn remove_quietly<S: RemoteSession>(session: &S, path: &str) {
    if let Err(e) = session.remove_file(path).await {
        tracing::debug!("Could not remove {path}: {e}");
    }
}
