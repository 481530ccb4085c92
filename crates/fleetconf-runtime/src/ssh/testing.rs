// In-memory transport used by the pool and store tests.
//
// Every session checks that it is never entered by two callers at once and
// records a violation if it is, so tests can assert exclusive use.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::transport::{
    CommandOutput, Connector, Credentials, DirEntry, Endpoint, RemoteSession, TransportError,
};

/// The shared "remote host": its filesystem plus counters the tests inspect
#[derive(Default)]
pub(crate) struct FakeRemote {
    files: Mutex<BTreeMap<String, Bytes>>,
    dirs: Mutex<BTreeSet<String>>,
    exec_output: Mutex<String>,
    fail_writes: Mutex<Option<String>>,
    op_delay: Mutex<Duration>,

    pub connects: AtomicUsize,
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
    pub probes: AtomicUsize,
    pub violations: AtomicUsize,
    pub fail_connect: AtomicBool,
    killed_below: AtomicUsize,
    kill_after: Mutex<Option<usize>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put_file(&self, path: &str, content: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), Bytes::copy_from_slice(content));
    }

    pub fn file(&self, path: &str) -> Option<Bytes> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.lock().unwrap().keys().cloned().collect()
    }

    pub fn add_dir(&self, path: &str) {
        self.dirs.lock().unwrap().insert(path.to_string());
    }

    pub fn set_exec_output(&self, output: &str) {
        *self.exec_output.lock().unwrap() = output.to_string();
    }

    /// Make writes to any path containing `pattern` fail
    pub fn fail_writes_matching(&self, pattern: &str) {
        *self.fail_writes.lock().unwrap() = Some(pattern.to_string());
    }

    /// Delay every session operation, widening race windows
    pub fn set_op_delay(&self, delay: Duration) {
        *self.op_delay.lock().unwrap() = delay;
    }

    /// Silently kill every session opened so far
    pub fn kill_sessions(&self) {
        self.killed_below
            .store(self.connects.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    /// Let `ops` more session operations through, then kill every session
    /// opened so far; the operation that trips this already fails
    pub fn kill_after(&self, ops: usize) {
        *self.kill_after.lock().unwrap() = Some(ops);
    }

    fn count_down_to_kill(&self) {
        let mut pending = self.kill_after.lock().unwrap();
        match pending.as_mut() {
            Some(0) => {
                *pending = None;
                self.kill_sessions();
            }
            Some(ops) => *ops -= 1,
            None => {}
        }
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub(crate) struct FakeConnector {
    pub remote: Arc<FakeRemote>,
}

impl FakeConnector {
    pub fn new(remote: Arc<FakeRemote>) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Session = FakeSession;

    async fn connect(
        &self,
        endpoint: &Endpoint,
        _credentials: &Credentials,
    ) -> Result<FakeSession, TransportError> {
        if self.remote.fail_connect.load(Ordering::SeqCst) {
            return Err(remote_error(
                ErrorKind::ConnectionRefused,
                format!("connection refused: {}", endpoint.address()),
            ));
        }

        let id = self.remote.connects.fetch_add(1, Ordering::SeqCst);
        let live = self.remote.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.remote.max_live.fetch_max(live, Ordering::SeqCst);

        Ok(FakeSession {
            id,
            remote: self.remote.clone(),
            busy: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }
}

pub(crate) struct FakeSession {
    pub id: usize,
    remote: Arc<FakeRemote>,
    busy: AtomicBool,
    closed: AtomicBool,
}

struct InUse<'a>(&'a AtomicBool);

impl Drop for InUse<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl FakeSession {
    async fn enter(&self) -> Result<InUse<'_>, TransportError> {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.remote.violations.fetch_add(1, Ordering::SeqCst);
        }
        let guard = InUse(&self.busy);

        let delay = *self.remote.op_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.remote.count_down_to_kill();
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.id < self.remote.killed_below.load(Ordering::SeqCst) {
            return Err(remote_error(
                ErrorKind::ConnectionReset,
                "connection reset by peer".to_string(),
            ));
        }
        Ok(guard)
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn working_dir(&self) -> Result<String, TransportError> {
        self.remote.probes.fetch_add(1, Ordering::SeqCst);
        let _in_use = self.enter().await?;
        Ok("/home/test".to_string())
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, TransportError> {
        let _in_use = self.enter().await?;
        let prefix = format!("{}/", path.trim_end_matches('/'));

        let files = self.remote.files.lock().unwrap();
        let mut entries: Vec<DirEntry> = files
            .iter()
            .filter_map(|(p, content)| {
                let name = p.strip_prefix(&prefix)?;
                (!name.contains('/')).then(|| DirEntry {
                    name: name.to_string(),
                    is_dir: false,
                    size: content.len() as u64,
                    modified: None,
                })
            })
            .collect();

        let dirs = self.remote.dirs.lock().unwrap();
        entries.extend(dirs.iter().filter_map(|d| {
            let name = d.strip_prefix(&prefix)?;
            (!name.contains('/')).then(|| DirEntry {
                name: name.to_string(),
                is_dir: true,
                size: 0,
                modified: None,
            })
        }));
        Ok(entries)
    }

    async fn exists(&self, path: &str) -> Result<bool, TransportError> {
        let _in_use = self.enter().await?;
        Ok(self.remote.files.lock().unwrap().contains_key(path))
    }

    async fn read_file(&self, path: &str) -> Result<Bytes, TransportError> {
        let _in_use = self.enter().await?;
        self.remote
            .file(path)
            .ok_or_else(|| remote_error(ErrorKind::NotFound, format!("no such file: {path}")))
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), TransportError> {
        let _in_use = self.enter().await?;
        if let Some(pattern) = self.remote.fail_writes.lock().unwrap().as_deref() {
            if path.contains(pattern) {
                return Err(remote_error(
                    ErrorKind::PermissionDenied,
                    format!("write failed: {path}"),
                ));
            }
        }
        self.remote.put_file(path, data);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError> {
        let _in_use = self.enter().await?;
        let mut files = self.remote.files.lock().unwrap();
        // Plain sftp rename refuses to overwrite
        if files.contains_key(to) {
            return Err(remote_error(
                ErrorKind::AlreadyExists,
                format!("file exists: {to}"),
            ));
        }
        let content = files
            .remove(from)
            .ok_or_else(|| remote_error(ErrorKind::NotFound, format!("no such file: {from}")))?;
        files.insert(to.to_string(), content);
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), TransportError> {
        let _in_use = self.enter().await?;
        self.remote
            .files
            .lock()
            .unwrap()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| remote_error(ErrorKind::NotFound, format!("no such file: {path}")))
    }

    async fn exec(&self, _command: &str) -> Result<CommandOutput, TransportError> {
        let _in_use = self.enter().await?;
        Ok(CommandOutput {
            output: self.remote.exec_output.lock().unwrap().clone(),
            exit_code: Some(0),
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.remote.live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn remote_error(kind: ErrorKind, message: String) -> TransportError {
    TransportError::Io(io::Error::new(kind, message))
}
