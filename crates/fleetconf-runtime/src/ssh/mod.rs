//! SSH connection pooling
//!
//! This module keeps one authenticated session per remote endpoint and hands
//! out exclusive access to it.
//!
//! Features:
//! - Per-endpoint admission lock shared by callers and the keep-alive task
//! - Transparent replacement of sessions that fail a liveness probe
//! - Background keep-alive with idle eviction
//! - Public key authentication and an sftp channel per session

mod pool;
mod session;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use pool::{ConnectionPool, PoolError, PooledSession};
pub use session::{HostKeyPolicy, SshConnector, SshSession};
pub use transport::{
    CommandOutput, Connector, Credentials, DirEntry, Endpoint, RemoteSession, TransportError,
};
