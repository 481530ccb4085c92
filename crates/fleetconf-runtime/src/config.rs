//! Configuration for the pool and the config store
//!
//! The runtime is configured from a TOML file. Every duration is expressed in
//! whole seconds. Only `endpoint` and `config_dir` are required; everything
//! else has a default matching long-standing behavior.
//!
//! ```toml
//! endpoint = "admin@10.0.0.2:22"
//! private_key_path = "~/.ssh/id_ed25519"
//! config_dir = "/srv/gateway/conf.d"
//!
//! [pool]
//! acquire_timeout_secs = 5
//! idle_timeout_secs = 600
//! keepalive_interval_secs = 30
//!
//! [host_key]
//! policy = "pinned"
//! fingerprints = ["SHA256:..."]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::ssh::{Credentials, Endpoint, HostKeyPolicy};
use crate::store::StoreConfig;

pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

pub const DEFAULT_RESTART_COMMAND: &str = "/usr/local/bin/docker restart gateway";
pub const DEFAULT_RESTART_EXPECT: &str = "gateway";

const ENDPOINT_ENV: &str = "FLEETCONF_ENDPOINT";
const CONFIG_DIR_ENV: &str = "FLEETCONF_CONFIG_DIR";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to expand path {0}")]
    Expand(String),

    #[error("no private key configured; set `private_key` or `private_key_path`")]
    MissingPrivateKey,

    #[error("endpoint {0} has no user; set `user` or use user@host")]
    MissingUser(String),

    #[error("invalid pool setting: {0}")]
    InvalidPool(&'static str),
}

/// Tunables for the connection pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct PoolConfig {
    /// How long `acquire` waits for an endpoint's admission lock
    #[builder(default = DEFAULT_ACQUIRE_TIMEOUT)]
    #[serde(rename = "acquire_timeout_secs", with = "duration_secs")]
    pub acquire_timeout: Duration,

    /// Sessions unused for this long are evicted by the keep-alive task
    #[builder(default = DEFAULT_IDLE_TIMEOUT)]
    #[serde(rename = "idle_timeout_secs", with = "duration_secs")]
    pub idle_timeout: Duration,

    #[builder(default = DEFAULT_KEEPALIVE_INTERVAL)]
    #[serde(rename = "keepalive_interval_secs", with = "duration_secs")]
    pub keepalive_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig::builder().build()
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keepalive_interval.is_zero() {
            return Err(ConfigError::InvalidPool(
                "keepalive_interval_secs must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Remote restart action run after configs change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub command: String,
    /// The command output must contain this for the restart to count as successful
    pub expect: String,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_RESTART_COMMAND.to_string(),
            expect: DEFAULT_RESTART_EXPECT.to_string(),
        }
    }
}

/// The on-disk configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct FleetConfig {
    /// `user@host[:port]`
    pub endpoint: String,
    #[serde(default)]
    pub user: Option<String>,
    /// Inline private key material; takes precedence over `private_key_path`
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Remote directory holding the `.conf` files
    pub config_dir: String,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub host_key: HostKeyPolicy,
    #[serde(default)]
    pub restart: RestartConfig,
}

impl FleetConfig {
    /// `$XDG_CONFIG_HOME/fleetconf/config.toml` (or the platform equivalent)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("fleetconf").join("config.toml"))
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.pool.validate()?;
        Ok(config)
    }

    /// Load a config file, then apply environment overrides
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let mut config = Self::from_toml(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = lookup(ENDPOINT_ENV) {
            self.endpoint = endpoint;
        }
        if let Some(config_dir) = lookup(CONFIG_DIR_ENV) {
            self.config_dir = config_dir;
        }
    }

    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        match (self.endpoint.contains('@'), self.user.as_deref()) {
            (true, user) => Ok(Endpoint::parse(&self.endpoint, user.unwrap_or_default())),
            (false, Some(user)) => Ok(Endpoint::parse(&self.endpoint, user)),
            (false, None) => Err(ConfigError::MissingUser(self.endpoint.clone())),
        }
    }

    pub async fn credentials(&self) -> Result<Credentials, ConfigError> {
        let private_key = match (&self.private_key, &self.private_key_path) {
            (Some(inline), _) => inline.clone(),
            (None, Some(path)) => {
                let path = shellexpand::full(path)
                    .map_err(|e| ConfigError::Expand(e.to_string()))?
                    .into_owned();
                tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|source| ConfigError::Io {
                        path: PathBuf::from(path),
                        source,
                    })?
            }
            (None, None) => return Err(ConfigError::MissingPrivateKey),
        };

        let credentials = Credentials::new(private_key);
        Ok(match &self.passphrase {
            Some(passphrase) => credentials.with_passphrase(passphrase.clone()),
            None => credentials,
        })
    }

    /// Resolve everything the config store needs, reading key material if necessary
    pub async fn store_config(&self) -> Result<StoreConfig, ConfigError> {
        Ok(StoreConfig {
            endpoint: self.endpoint()?,
            credentials: self.credentials().await?,
            config_dir: self.config_dir.clone(),
            restart_command: self.restart.command.clone(),
            restart_expect: self.restart.expect.clone(),
        })
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
