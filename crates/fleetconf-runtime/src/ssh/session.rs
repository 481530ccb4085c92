// Handle making SSH connections. Do not manage or pool them, just handle the actual plumbing.
// This is essentially a wrapper around the russh and russh-sftp crates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::Handle;
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

use super::transport::{
    CommandOutput, Connector, Credentials, DirEntry, Endpoint, RemoteSession, TransportError,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How the client decides whether to trust the key a server presents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Accept any host key. Vulnerable to man-in-the-middle, kept for
    /// compatibility with hosts that were never pinned.
    #[default]
    AcceptAny,
    /// Only accept keys whose SHA-256 fingerprint (`SHA256:...`) is listed
    Pinned { fingerprints: Vec<String> },
}

impl HostKeyPolicy {
    pub fn accepts(&self, fingerprint: &str) -> bool {
        match self {
            Self::AcceptAny => true,
            Self::Pinned { fingerprints } => fingerprints.iter().any(|f| f == fingerprint),
        }
    }
}

/// SSH client handler for russh
pub struct Client {
    endpoint: String,
    policy: HostKeyPolicy,
}

impl russh::client::Handler for Client {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key
            .fingerprint(russh::keys::HashAlg::Sha256)
            .to_string();

        match &self.policy {
            HostKeyPolicy::AcceptAny => {
                tracing::warn!(
                    "Accepting unverified host key {fingerprint} for {}",
                    self.endpoint
                );
                Ok(true)
            }
            policy if policy.accepts(&fingerprint) => {
                tracing::debug!("Host key {fingerprint} for {} is pinned", self.endpoint);
                Ok(true)
            }
            _ => {
                tracing::error!(
                    "Rejecting host key {fingerprint} for {}: not in pinned set",
                    self.endpoint
                );
                Ok(false)
            }
        }
    }
}

/// Opens [`SshSession`]s with russh
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    host_key_policy: HostKeyPolicy,
}

impl SshConnector {
    pub fn new(host_key_policy: HostKeyPolicy) -> Self {
        Self { host_key_policy }
    }
}

#[async_trait]
impl Connector for SshConnector {
    type Session = SshSession;

    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<SshSession, TransportError> {
        SshSession::open(endpoint, credentials, self.host_key_policy.clone()).await
    }
}

/// An ssh session with an sftp channel on top of it
pub struct SshSession {
    session: Handle<Client>,
    sftp: SftpSession,
    endpoint: String,
    closed: AtomicBool,
}

impl SshSession {
    /// Connect, authenticate with the private key, then open the sftp subsystem
    pub async fn open(
        endpoint: &Endpoint,
        credentials: &Credentials,
        host_key_policy: HostKeyPolicy,
    ) -> Result<Self, TransportError> {
        let key = endpoint.key();
        let config = russh::client::Config::default();
        let handler = Client {
            endpoint: key.clone(),
            policy: host_key_policy,
        };

        tracing::debug!("Connecting directly to: {}", endpoint.address());
        let mut session = timeout(
            CONNECT_TIMEOUT,
            russh::client::connect(Arc::new(config), endpoint.address(), handler),
        )
        .await
        .map_err(|_| TransportError::Timeout(key.clone()))??;

        Self::key_auth(&mut session, &endpoint.user, credentials).await?;

        let sftp = match Self::open_sftp(&session).await {
            Ok(sftp) => sftp,
            Err(e) => {
                // Don't leave the ssh connection dangling if sftp never came up
                let _ = session
                    .disconnect(Disconnect::ByApplication, "", "English")
                    .await;
                return Err(e);
            }
        };

        tracing::info!("Opened ssh session for {key}");

        Ok(Self {
            session,
            sftp,
            endpoint: key,
            closed: AtomicBool::new(false),
        })
    }

    /// Public key authentication with in-memory key material
    async fn key_auth(
        session: &mut Handle<Client>,
        username: &str,
        credentials: &Credentials,
    ) -> Result<(), TransportError> {
        let key_pair = russh::keys::decode_secret_key(
            &credentials.private_key,
            credentials.passphrase.as_deref(),
        )?;

        // Query the server for the best RSA hash algorithm it supports
        let best_hash = session.best_supported_rsa_hash().await?.flatten();
        let key_with_alg = russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), best_hash);

        match session.authenticate_publickey(username, key_with_alg).await? {
            russh::client::AuthResult::Success => {
                tracing::debug!("Authentication successful for {username}");
                Ok(())
            }
            russh::client::AuthResult::Failure {
                remaining_methods,
                partial_success,
            } => {
                tracing::warn!(
                    "Server rejected key for {username} (remaining methods: {:?}, partial: {})",
                    remaining_methods,
                    partial_success
                );
                Err(TransportError::AuthRejected(username.to_string()))
            }
        }
    }

    async fn open_sftp(session: &Handle<Client>) -> Result<SftpSession, TransportError> {
        let channel = session.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        Ok(SftpSession::new(channel.into_stream()).await?)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn working_dir(&self) -> Result<String, TransportError> {
        self.ensure_open()?;
        Ok(self.sftp.canonicalize(".").await?)
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, TransportError> {
        self.ensure_open()?;
        let entries = self.sftp.read_dir(path).await?;

        Ok(entries
            .map(|entry| {
                let metadata = entry.metadata();
                DirEntry {
                    name: entry.file_name(),
                    is_dir: entry.file_type().is_dir(),
                    size: metadata.size.unwrap_or(0),
                    modified: metadata
                        .mtime
                        .map(|secs| UNIX_EPOCH + Duration::from_secs(u64::from(secs))),
                }
            })
            .collect())
    }

    async fn exists(&self, path: &str) -> Result<bool, TransportError> {
        self.ensure_open()?;
        Ok(self.sftp.try_exists(path).await?)
    }

    async fn read_file(&self, path: &str) -> Result<Bytes, TransportError> {
        self.ensure_open()?;
        Ok(Bytes::from(self.sftp.read(path).await?))
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut file = self.sftp.create(path).await?;
        file.write_all(data).await?;
        // Flushes pending writes and closes the remote handle
        file.shutdown().await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        Ok(self.sftp.rename(from, to).await?)
    }

    async fn remove_file(&self, path: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        Ok(self.sftp.remove_file(path).await?)
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput, TransportError> {
        self.ensure_open()?;
        let mut channel = self.session.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut output = String::new();
        let mut exit_code: Option<i32> = None;
        let mut got_eof = false;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } | ChannelMsg::ExtendedData { data, ext: 1 } => {
                    output.push_str(&String::from_utf8_lossy(&data));
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    exit_code = Some(exit_status as i32);
                    if got_eof {
                        break;
                    }
                }
                ChannelMsg::Eof => {
                    got_eof = true;
                    if exit_code.is_some() {
                        break;
                    }
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        let _ = channel.close().await;

        Ok(CommandOutput {
            output,
            exit_code,
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        tracing::debug!("Closing ssh session for {}", self.endpoint);
        if let Err(e) = self.sftp.close().await {
            tracing::debug!("sftp close for {} failed: {e}", self.endpoint);
        }
        self.session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await?;
        Ok(())
    }
}
