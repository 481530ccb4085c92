// The seam between the pool and whatever actually speaks to the remote host.
// The russh implementation lives in `session.rs`; tests plug in an in-memory fake.

use std::fmt;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;

/// Errors raised by the transport or file-transfer channel
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("sftp error: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),

    #[error("invalid private key: {0}")]
    Key(#[from] russh::keys::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("public key authentication rejected for {0}")]
    AuthRejected(String),

    #[error("connection to {0} timed out")]
    Timeout(String),

    #[error("session is closed")]
    Closed,
}

/// Identity of one remote host + user pair; the pool key is `user@address`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port,
        }
    }

    /// Parse `user@host[:port]`. A missing user falls back to `default_user`.
    pub fn parse(input: &str, default_user: &str) -> Self {
        let (user, host_part) = match input.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (user.to_string(), rest),
            Some((_, rest)) => (default_user.to_string(), rest),
            None => (default_user.to_string(), input),
        };

        let (host, port) = match host_part.rfind(':') {
            Some(colon_pos) => match host_part[colon_pos + 1..].parse::<u16>() {
                Ok(port) => (host_part[..colon_pos].to_string(), port),
                // Not a port, keep the whole thing as the host
                Err(_) => (host_part.to_string(), 22),
            },
            None => (host_part.to_string(), 22),
        };

        Self { user, host, port }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The key this endpoint is pooled under
    pub fn key(&self) -> String {
        format!("{}@{}", self.user, self.address())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Private key material used for public key authentication
#[derive(Clone)]
pub struct Credentials {
    pub private_key: String,
    pub passphrase: Option<String>,
}

impl Credentials {
    pub fn new(private_key: impl Into<String>) -> Self {
        Self {
            private_key: private_key.into(),
            passphrase: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }
}

// Never print key material
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("private_key", &"<redacted>")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A single entry of a remote directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Combined output of a remote command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub output: String,
    /// `None` when the channel closed without reporting an exit status
    pub exit_code: Option<i32>,
}

/// Opens authenticated sessions to an endpoint
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Session: RemoteSession;

    /// Connect, authenticate and open the file-transfer channel.
    /// Failure at any step is returned as-is and never retried here.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<Self::Session, TransportError>;
}

/// One authenticated connection plus its file-transfer channel.
///
/// Implementations are not required to tolerate concurrent calls; the pool
/// guarantees a single user at a time.
#[async_trait]
pub trait RemoteSession: Send + Sync + 'static {
    /// Cheap round-trip used as a liveness probe
    async fn working_dir(&self) -> Result<String, TransportError>;

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, TransportError>;

    /// `Ok(false)` only when the path does not exist; other failures are errors
    async fn exists(&self, path: &str) -> Result<bool, TransportError>;

    async fn read_file(&self, path: &str) -> Result<Bytes, TransportError>;

    /// Create the file, or truncate it if it exists, and write `data`
    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), TransportError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError>;

    async fn remove_file(&self, path: &str) -> Result<(), TransportError>;

    /// Run a command and capture stdout and stderr together
    async fn exec(&self, command: &str) -> Result<CommandOutput, TransportError>;

    /// Close both channels. Closing twice is a no-op.
    async fn close(&self) -> Result<(), TransportError>;
}
