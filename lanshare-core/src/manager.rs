//! Transfer manager: owns every session and its scheduler task, and enforces the
//! global cap on concurrently admitted sessions.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::chunk::ChunkPlan;
use crate::config::EngineConfig;
use crate::connection::Connection;
use crate::discovery::{Discovery, PeerState};
use crate::error::{EngineError, Result};
use crate::protocol::{ChecksumAlgo, Hello, Message, ReasonCode};
use crate::resume::{self, ResumeRecord};
use crate::scheduler::{self, SchedulerTuning};
use crate::session::{
    Direction, SessionId, SessionInfo, SessionShared, SessionStatus, TransferEvent,
    TransferSession,
};
use crate::wire::ProtocolError;

const EVENT_CAPACITY: usize = 1024;
/// Name used when an incoming file name has no usable component.
const FALLBACK_NAME: &str = "unnamed";
const MAX_RENAMES: u32 = 1000;

/// Metadata of an incoming file, as announced in the sender's `Hello`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub session_id: SessionId,
    pub name: String,
    pub total_bytes: u64,
    pub chunk_size: u32,
    pub checksum_algo: ChecksumAlgo,
}

impl From<&Hello> for FileMeta {
    fn from(h: &Hello) -> Self {
        Self {
            session_id: SessionId::from_bytes(h.session_id),
            name: h.name.clone(),
            total_bytes: h.file_size,
            chunk_size: h.chunk_size,
            checksum_algo: h.checksum_algo,
        }
    }
}

/// What a session moves: a local file to send, or a destination for an incoming one.
#[derive(Debug, Clone)]
pub enum FileDescriptor {
    Source(PathBuf),
    Destination { path: PathBuf, meta: FileMeta },
}

/// Per-session overrides of the engine defaults.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Chunk size in bytes; defaults to `chunk_size_mb`.
    pub chunk_size: Option<u32>,
    pub workers: Option<usize>,
    pub checksum_algo: ChecksumAlgo,
}

struct ManagerInner {
    config: EngineConfig,
    discovery: Discovery,
    /// Our identity as announced to receivers.
    local_id: String,
    sessions: RwLock<HashMap<SessionId, Arc<SessionShared>>>,
    workers: Mutex<HashMap<SessionId, JoinHandle<()>>>,
    /// Per-session run tuning, fixed at creation.
    tuning: Mutex<HashMap<SessionId, SchedulerTuning>>,
    slots: Arc<Semaphore>,
    events: broadcast::Sender<TransferEvent>,
}

#[derive(Clone)]
pub struct TransferManager {
    inner: Arc<ManagerInner>,
}

/// Control handle for one session.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
    inner: Arc<ManagerInner>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    pub async fn info(&self) -> SessionInfo {
        self.shared.info().await
    }

    /// Stop dispatching new chunks; chunks in flight finish.
    pub async fn pause(&self) -> Result<()> {
        self.shared.pause().await
    }

    pub async fn resume(&self) -> Result<()> {
        self.shared.resume().await
    }

    /// Cancel and wait for the scheduler task to stop.
    ///
    /// A receive session also loses its partial file and resume record, including when
    /// it was detached and no task was left to clean up.
    pub async fn cancel(&self) -> Result<()> {
        self.shared.cancel().await?;
        let worker = self.inner.workers.lock().await.remove(&self.shared.id);
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        if self.shared.direction == Direction::Receive {
            let dest = self.shared.read(|s| s.file_path.clone()).await;
            scheduler::discard_partial(&dest).await;
        }
        Ok(())
    }

    /// Wait until the session reaches a terminal status.
    pub async fn wait(&self) -> SessionStatus {
        let mut status = self.shared.watch_status();
        let reached = status.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        reached.unwrap_or_else(|_| self.shared.status())
    }
}

impl TransferManager {
    pub fn new(
        config: EngineConfig,
        discovery: Discovery,
        local_id: impl Into<String>,
    ) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(ManagerInner {
                slots: Arc::new(Semaphore::new(config.max_concurrent_sessions)),
                config,
                discovery,
                local_id: local_id.into(),
                sessions: RwLock::new(HashMap::new()),
                workers: Mutex::new(HashMap::new()),
                tuning: Mutex::new(HashMap::new()),
                events,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Events for every session. Per-session order is preserved; slow receivers lag.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    pub fn available_slots(&self) -> usize {
        self.inner.slots.available_permits()
    }

    /// Register a session with a known, online peer.
    ///
    /// Waits up to `admission_window` for a concurrency slot; the slot is held until the
    /// session ends.
    pub async fn create_session(
        &self,
        direction: Direction,
        peer_id: &str,
        descriptor: FileDescriptor,
        options: SessionOptions,
    ) -> Result<SessionHandle> {
        let peer = self
            .inner
            .discovery
            .get(peer_id)
            .await
            .filter(|p| p.state == PeerState::Online)
            .ok_or_else(|| EngineError::PeerUnavailable(peer_id.to_string()))?;

        let config = &self.inner.config;
        let (id, file_path, file_name, plan, algo) = match (direction, descriptor) {
            (Direction::Send, FileDescriptor::Source(path)) => {
                let meta = tokio::fs::metadata(&path).await?;
                if !meta.is_file() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("{} is not a regular file", path.display()),
                    )
                    .into());
                }
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| FALLBACK_NAME.to_string());
                let chunk_size = options.chunk_size.unwrap_or(config.chunk_size_bytes());
                (
                    SessionId::new(),
                    path,
                    name,
                    ChunkPlan::for_transfer(meta.len(), chunk_size)?,
                    options.checksum_algo,
                )
            }
            (Direction::Receive, FileDescriptor::Destination { path, meta }) => {
                if let Some(existing) = self.inner.sessions.read().await.get(&meta.session_id) {
                    return Err(EngineError::InvalidTransition {
                        from: existing.status(),
                        action: "create",
                    });
                }
                (
                    meta.session_id,
                    path,
                    meta.name,
                    ChunkPlan::for_transfer(meta.total_bytes, meta.chunk_size)?,
                    meta.checksum_algo,
                )
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "file descriptor does not match the transfer direction",
                )
                .into())
            }
        };

        let permit = tokio::time::timeout(
            config.admission_window(),
            self.inner.slots.clone().acquire_owned(),
        )
        .await
        .ok()
        .and_then(|p| p.ok())
        .ok_or(EngineError::CapacityExceeded)?;

        let session = TransferSession::new(
            id,
            direction,
            peer.id.clone(),
            Some(peer.address),
            file_path,
            file_name,
            plan,
            algo,
            Some(permit),
        );
        let shared = SessionShared::new(session, self.inner.events.clone());
        let mut tuning = SchedulerTuning::from(config);
        if let Some(workers) = options.workers {
            tuning.workers = workers.clamp(1, crate::config::WORKERS_RANGE.1);
        }
        self.inner.tuning.lock().await.insert(id, tuning);
        self.inner.sessions.write().await.insert(id, shared.clone());
        info!(session = %id, ?direction, peer = %peer.id, bytes = plan.total_bytes(), "session created");
        Ok(self.handle(shared))
    }

    /// Attach a connection to a pending send session and start sending.
    pub async fn start_send<S>(&self, id: SessionId, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let shared = self.lookup(id, Direction::Send).await?;
        shared.start().await?;
        self.spawn_sender(shared, Connection::new(stream)).await;
        Ok(())
    }

    /// Attach a connection to a pending receive session. The stream starts with the sender's `Hello`.
    pub async fn start_receive<S>(&self, id: SessionId, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let shared = self.lookup(id, Direction::Receive).await?;
        let mut conn = Connection::new(stream);
        let hello = self.read_hello(&mut conn).await?;
        if let Err(e) = check_hello(&shared, &hello).await {
            reject(conn, e.reason_code()).await;
            return Err(e);
        }
        if let Err(e) = shared.start().await {
            reject(conn, ReasonCode::Busy).await;
            return Err(e);
        }
        self.spawn_receiver(shared, conn).await;
        Ok(())
    }

    /// Continue a paused, detached session over a new connection from its bitmap.
    pub async fn reattach<S>(&self, id: SessionId, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let shared = self.get_shared(id).await?;
        let mut conn = Connection::new(stream);
        if shared.direction == Direction::Receive {
            let hello = self.read_hello(&mut conn).await?;
            if let Err(e) = check_hello(&shared, &hello).await {
                reject(conn, e.reason_code()).await;
                return Err(e);
            }
        }
        shared.reattach().await?;
        info!(session = %id, "session reattached");
        match shared.direction {
            Direction::Send => self.spawn_sender(shared, conn).await,
            Direction::Receive => self.spawn_receiver(shared, conn).await,
        }
        Ok(())
    }

    /// Serve an inbound connection: read the `Hello`, then either continue the matching
    /// paused receive session or admit a new one writing into `save_dir`.
    ///
    /// Refusals are answered with `Abort` before the error is returned.
    pub async fn accept_incoming<S>(&self, stream: S, save_dir: &Path) -> Result<SessionHandle>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut conn = Connection::new(stream);
        let hello = self.read_hello(&mut conn).await?;
        let meta = FileMeta::from(&hello);

        let known = self.inner.sessions.read().await.get(&meta.session_id).cloned();
        if let Some(shared) = known {
            let resumed = match check_hello(&shared, &hello).await {
                Ok(()) if shared.direction == Direction::Receive => shared.reattach().await,
                Ok(()) => Err(EngineError::Protocol(ProtocolError::InvalidField(
                    "session id already in use",
                ))),
                Err(e) => Err(e),
            };
            if let Err(e) = resumed {
                warn!(session = %meta.session_id, error = %e, "refusing incoming connection");
                reject(conn, e.reason_code()).await;
                return Err(e);
            }
            info!(session = %meta.session_id, "incoming connection resumes session");
            self.spawn_receiver(shared.clone(), conn).await;
            return Ok(self.handle(shared));
        }

        if let Err(e) = tokio::fs::create_dir_all(save_dir).await {
            reject(conn, ReasonCode::Io).await;
            return Err(e.into());
        }
        let dest = destination_for(save_dir, &meta).await;
        let descriptor = FileDescriptor::Destination { path: dest, meta };
        let created = self
            .create_session(
                Direction::Receive,
                &hello.sender,
                descriptor,
                SessionOptions::default(),
            )
            .await;
        let handle = match created {
            Ok(handle) => handle,
            Err(e) => {
                warn!(peer = %hello.sender, error = %e, "refusing incoming transfer");
                reject(conn, e.reason_code()).await;
                return Err(e);
            }
        };
        if let Err(e) = handle.shared.start().await {
            reject(conn, ReasonCode::Cancelled).await;
            return Err(e);
        }
        self.spawn_receiver(handle.shared.clone(), conn).await;
        Ok(handle)
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<_> = self.inner.sessions.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(sessions.len());
        for shared in sessions {
            infos.push(shared.info().await);
        }
        infos
    }

    pub async fn get_session(&self, id: SessionId) -> Result<SessionInfo> {
        Ok(self.get_shared(id).await?.info().await)
    }

    pub async fn session(&self, id: SessionId) -> Result<SessionHandle> {
        Ok(self.handle(self.get_shared(id).await?))
    }

    /// Forget finished sessions. Returns how many were dropped.
    pub async fn remove_finished(&self) -> usize {
        let mut sessions = self.inner.sessions.write().await;
        let done: Vec<SessionId> = sessions
            .iter()
            .filter(|(_, s)| s.status().is_terminal())
            .map(|(id, _)| *id)
            .collect();
        let mut workers = self.inner.workers.lock().await;
        let mut tuning = self.inner.tuning.lock().await;
        for id in &done {
            sessions.remove(id);
            workers.remove(id);
            tuning.remove(id);
        }
        done.len()
    }

    fn handle(&self, shared: Arc<SessionShared>) -> SessionHandle {
        SessionHandle {
            shared,
            inner: self.inner.clone(),
        }
    }

    async fn get_shared(&self, id: SessionId) -> Result<Arc<SessionShared>> {
        self.inner
            .sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(EngineError::SessionNotFound(id))
    }

    async fn lookup(&self, id: SessionId, direction: Direction) -> Result<Arc<SessionShared>> {
        let shared = self.get_shared(id).await?;
        if shared.direction != direction {
            return Err(EngineError::WrongDirection(id));
        }
        Ok(shared)
    }

    async fn tuning_for(&self, id: SessionId) -> SchedulerTuning {
        self.inner
            .tuning
            .lock()
            .await
            .get(&id)
            .copied()
            .unwrap_or_else(|| SchedulerTuning::from(&self.inner.config))
    }

    async fn read_hello<S>(&self, conn: &mut Connection<S>) -> Result<Hello>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let first = tokio::time::timeout(self.inner.config.ack_timeout(), conn.reader.next()).await;
        match first {
            Ok(Ok(Some(Message::Hello(hello)))) => Ok(hello),
            Ok(Ok(None)) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before hello",
            )
            .into()),
            Ok(Ok(Some(_))) => {
                Err(ProtocolError::InvalidField("expected hello as the first message").into())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "no hello from peer").into()),
        }
    }

    async fn spawn_sender<S>(&self, shared: Arc<SessionShared>, conn: Connection<S>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let tuning = self.tuning_for(shared.id).await;
        let hello = shared.read(|s| s.hello(&self.inner.local_id)).await;
        let id = shared.id;
        self.track(id, scheduler::run_sender(shared, conn, hello, tuning))
            .await;
    }

    async fn spawn_receiver<S>(&self, shared: Arc<SessionShared>, conn: Connection<S>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let tuning = self.tuning_for(shared.id).await;
        let id = shared.id;
        self.track(id, scheduler::run_receiver(shared, conn, tuning))
            .await;
    }

    async fn track(&self, id: SessionId, run: impl Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(run);
        self.inner.workers.lock().await.insert(id, handle);
    }
}

/// The `Hello` must describe the same transfer as the session it is matched to.
async fn check_hello(shared: &SessionShared, hello: &Hello) -> Result<()> {
    let matches = shared
        .read(|s| {
            s.id.as_bytes() == hello.session_id
                && s.plan.total_bytes() == hello.file_size
                && s.plan.chunk_size() == hello.chunk_size
        })
        .await;
    if matches {
        Ok(())
    } else {
        Err(ProtocolError::InvalidField("hello does not match the session").into())
    }
}

async fn reject<S>(conn: Connection<S>, reason: ReasonCode)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let Connection { sender, writer, .. } = conn;
    let _ = sender.send(&Message::Abort { reason }).await;
    drop(sender);
    let _ = writer
        .finish_within(std::time::Duration::from_secs(1))
        .await;
}

/// Keep only the final path component of a peer-supplied name.
fn sanitize_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| FALLBACK_NAME.to_string())
}

fn numbered(name: &str, n: u32) -> String {
    let path = Path::new(name);
    match (path.file_stem(), path.extension()) {
        (Some(stem), Some(ext)) => format!(
            "{} ({n}).{}",
            stem.to_string_lossy(),
            ext.to_string_lossy()
        ),
        _ => format!("{name} ({n})"),
    }
}

/// Pick where an incoming file goes: the partial file of the same session if one exists,
/// otherwise the first name that is free.
async fn destination_for(dir: &Path, meta: &FileMeta) -> PathBuf {
    let name = sanitize_name(&meta.name);
    let base = dir.join(&name);
    for n in 0..MAX_RENAMES {
        let candidate = if n == 0 {
            base.clone()
        } else {
            dir.join(numbered(&name, n))
        };
        if let Ok(Some(record)) = ResumeRecord::load(&resume::sidecar_path(&candidate)).await {
            if record.matches(meta.session_id.as_bytes(), meta.total_bytes, meta.chunk_size) {
                return candidate;
            }
        }
        let taken = tokio::fs::try_exists(&candidate).await.unwrap_or(true)
            || tokio::fs::try_exists(resume::part_path(&candidate))
                .await
                .unwrap_or(true);
        if !taken {
            return candidate;
        }
    }
    base
}
