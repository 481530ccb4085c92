// A pool of ssh sessions, one per `user@host:port`.
//
// Each endpoint owns a slot guarded by a tokio mutex, which doubles as the
// endpoint's admission lock: whoever holds it is the only user of that
// endpoint's channels, be it a caller or the keep-alive task. Slots are
// created lazily and never removed; only the session inside comes and goes.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

use super::transport::{Connector, Credentials, Endpoint, RemoteSession, TransportError};
use crate::config::{PoolConfig, DEFAULT_KEEPALIVE_INTERVAL};

#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("timed out after {timeout:?} waiting for {key}")]
    LockTimeout { key: String, timeout: Duration },

    #[error("failed to connect to {key}: {source}")]
    Connect {
        key: String,
        #[source]
        source: TransportError,
    },
}

type Slot<S> = Arc<Mutex<Option<Live<S>>>>;

/// A cached session and the bookkeeping around it
struct Live<S> {
    session: Arc<S>,
    last_used: Instant,
    generation: u64,
    keepalive: Option<JoinHandle<()>>,
}

impl<S: RemoteSession> Live<S> {
    /// Close the session. `stop_keepalive` is false only when the keep-alive
    /// task is the one tearing down, since it cannot abort itself mid-close.
    async fn teardown(mut self, key: &str, stop_keepalive: bool) {
        if let Some(handle) = self.keepalive.take() {
            if stop_keepalive {
                handle.abort();
            }
        }
        if let Err(e) = self.session.close().await {
            tracing::debug!("Error closing session for {key}: {e}");
        }
    }
}

/// Exclusive use of one endpoint's session.
///
/// The endpoint's admission lock is held until this is dropped, so keep it
/// only for the duration of one logical operation.
pub struct PooledSession<S: RemoteSession> {
    key: String,
    session: Arc<S>,
    guard: OwnedMutexGuard<Option<Live<S>>>,
}

impl<S: RemoteSession> PooledSession<S> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Tear the session down instead of returning it to the pool
    pub async fn discard(mut self) {
        if let Some(live) = self.guard.take() {
            tracing::debug!("Discarding SSH connection for {}", self.key);
            live.teardown(&self.key, true).await;
        }
    }

    /// Called after an operation failed: keep the session if it still
    /// answers a probe, otherwise evict it so the next caller reconnects.
    pub async fn recycle_after_error(self) {
        if self.session.working_dir().await.is_err() {
            tracing::debug!("Removing dead SSH connection after failure: {}", self.key);
            self.discard().await;
        }
    }
}

impl<S: RemoteSession> Deref for PooledSession<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.session
    }
}

/// Keyed pool of authenticated sessions
pub struct ConnectionPool<C: Connector> {
    connector: C,
    config: PoolConfig,
    slots: DashMap<String, Slot<C::Session>>,
    generation: AtomicU64,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, mut config: PoolConfig) -> Self {
        // A zero period would make the keep-alive ticker panic
        if config.keepalive_interval.is_zero() {
            tracing::warn!(
                "Keepalive interval of zero is not usable, falling back to {:?}",
                DEFAULT_KEEPALIVE_INTERVAL
            );
            config.keepalive_interval = DEFAULT_KEEPALIVE_INTERVAL;
        }

        Self {
            connector,
            config,
            slots: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn slot(&self, key: &str) -> Slot<C::Session> {
        self.slots.entry(key.to_string()).or_default().clone()
    }

    /// Get a healthy session for `endpoint`, waiting at most the configured
    /// acquire timeout for the endpoint to become free.
    pub async fn acquire(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<PooledSession<C::Session>, PoolError> {
        self.acquire_with_timeout(endpoint, credentials, self.config.acquire_timeout)
            .await
    }

    pub async fn acquire_with_timeout(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        acquire_timeout: Duration,
    ) -> Result<PooledSession<C::Session>, PoolError> {
        let key = endpoint.key();
        let slot = self.slot(&key);

        let mut guard = match timeout(acquire_timeout, slot.clone().lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                tracing::warn!("Timed out acquiring lock for {key}");
                return Err(PoolError::LockTimeout {
                    key,
                    timeout: acquire_timeout,
                });
            }
        };

        let probe = match guard.as_ref() {
            Some(live) => Some(live.session.working_dir().await),
            None => None,
        };

        match probe {
            Some(Ok(_)) => {
                if let Some(live) = guard.as_mut() {
                    tracing::trace!("Reusing SSH connection for {key}");
                    live.last_used = Instant::now();
                    let session = live.session.clone();
                    return Ok(PooledSession {
                        key,
                        session,
                        guard,
                    });
                }
            }
            Some(Err(e)) => {
                tracing::warn!("Connection for {key} is dead: {e}");
                if let Some(dead) = guard.take() {
                    dead.teardown(&key, true).await;
                }
            }
            None => {}
        }

        tracing::debug!("Creating new SSH connection for {key}");
        let session = match self.connector.connect(endpoint, credentials).await {
            Ok(session) => Arc::new(session),
            Err(source) => {
                tracing::error!("Failed to connect to {key}: {source}");
                return Err(PoolError::Connect { key, source });
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let keepalive = tokio::spawn(keepalive(
            key.clone(),
            slot,
            generation,
            self.config.keepalive_interval,
            self.config.idle_timeout,
        ));

        *guard = Some(Live {
            session: session.clone(),
            last_used: Instant::now(),
            generation,
            keepalive: Some(keepalive),
        });

        Ok(PooledSession {
            key,
            session,
            guard,
        })
    }

    /// Tear down the session for `endpoint`, if any. Safe to call repeatedly.
    pub async fn close(&self, endpoint: &Endpoint) {
        let key = endpoint.key();
        let Some(slot) = self.slots.get(&key).map(|slot| slot.value().clone()) else {
            return;
        };

        let mut guard = slot.lock().await;
        if let Some(live) = guard.take() {
            tracing::debug!("Closing SSH connection for {key}");
            live.teardown(&key, true).await;
        }
    }

    /// Keys that currently have a live session
    pub async fn connections(&self) -> Vec<String> {
        let slots: Vec<(String, Slot<C::Session>)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut keys = Vec::new();
        for (key, slot) in slots {
            if slot.lock().await.is_some() {
                keys.push(key);
            }
        }
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.connections().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close every session in the pool
    pub async fn shutdown(&self) {
        let slots: Vec<(String, Slot<C::Session>)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (key, slot) in slots {
            if let Some(live) = slot.lock().await.take() {
                live.teardown(&key, true).await;
            }
        }
        tracing::debug!("SSH pool shut down");
    }
}

/// Background task for one session. Skips a tick whenever the endpoint is in
/// use, and exits once it has evicted its session or the session was replaced.
async fn keepalive<S: RemoteSession>(
    key: String,
    slot: Slot<S>,
    generation: u64,
    period: Duration,
    idle_timeout: Duration,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let Ok(mut guard) = slot.try_lock() else {
            tracing::trace!("{key} is busy, skipping keepalive");
            continue;
        };

        let Some(live) = guard.as_ref() else {
            return;
        };
        if live.generation != generation {
            return;
        }

        let eviction = if live.last_used.elapsed() >= idle_timeout {
            tracing::info!("SSH connection for {key} idle timeout");
            true
        } else if let Err(e) = live.session.working_dir().await {
            tracing::warn!("Keepalive failed for {key}: {e}");
            true
        } else {
            false
        };

        if eviction {
            if let Some(live) = guard.take() {
                live.teardown(&key, false).await;
            }
            return;
        }
    }
}
