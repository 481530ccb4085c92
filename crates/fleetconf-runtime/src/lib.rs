//! Runtime library for fleetconf
//!
//! This crate lets a control plane manage `.conf` files on remote hosts that
//! are only reachable over SSH. It includes:
//!
//! - A keyed pool of authenticated SSH sessions with liveness probing,
//!   idle eviction and background keep-alive
//! - A config store with per-file locking and optimistic-concurrency updates
//! - Configuration loading for both
//!
//! # Example
//!
//! ```ignore
//! let config = FleetConfig::load("config.toml").await?;
//! let pool = Arc::new(ConnectionPool::new(
//!     SshConnector::new(config.host_key.clone()),
//!     config.pool.clone(),
//! ));
//! let store = ConfigStore::new(pool, config.store_config().await?);
//!
//! for file in store.list_all().await? {
//!     println!("{}", file.name);
//! }
//! ```

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the tracing subscriber for standalone logging to the terminal.
///
/// This sets up tracing to output directly to stderr with the log level
/// controlled by the `RUST_LOG` environment variable.
///
/// # Examples
///
/// ```ignore
/// // Set RUST_LOG=fleetconf_runtime=debug to watch the pool at work
/// fleetconf_runtime::init_tracing();
/// ```
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

pub mod config;
pub mod ssh;
pub mod store;

pub use config::{FleetConfig, PoolConfig};
pub use ssh::{ConnectionPool, SshConnector};
pub use store::{ConfigStore, Outcome, Rejection, StoreError};
