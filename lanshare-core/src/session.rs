//! Transfer session: one file, one direction, one peer. Owns chunk bookkeeping and status.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, watch, Mutex, OwnedSemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bitmap::ChunkBitmap;
use crate::chunk::ChunkPlan;
use crate::error::{EngineError, Result};
use crate::protocol::{ChecksumAlgo, Hello, ReasonCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        SessionId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SessionStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Why a session stopped, renderable without engine internals.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FailureReason {
    pub code: ReasonCode,
    pub message: String,
}

impl FailureReason {
    pub fn new(code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<&EngineError> for FailureReason {
    fn from(e: &EngineError) -> Self {
        FailureReason::new(e.reason_code(), e.to_string())
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code.describe(), self.message)
    }
}

/// Lifecycle and progress events published to transfer subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    SessionCreated {
        id: SessionId,
        direction: Direction,
        peer_id: String,
        file_name: String,
        total_bytes: u64,
    },
    StatusChanged {
        id: SessionId,
        status: SessionStatus,
        reason: Option<FailureReason>,
    },
    Progress {
        id: SessionId,
        bytes_transferred: u64,
        total_bytes: u64,
        chunks_done: u32,
        chunk_count: u32,
        bytes_per_sec: u64,
    },
}

impl TransferEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            TransferEvent::SessionCreated { id, .. }
            | TransferEvent::StatusChanged { id, .. }
            | TransferEvent::Progress { id, .. } => *id,
        }
    }
}

/// Read-only copy of a session for listings and status screens.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub direction: Direction,
    pub peer_id: String,
    pub peer_addr: Option<SocketAddr>,
    pub file_path: PathBuf,
    pub file_name: String,
    pub total_bytes: u64,
    pub chunk_size: u32,
    pub chunk_count: u32,
    pub chunks_done: u32,
    pub bytes_transferred: u64,
    pub status: SessionStatus,
    pub last_error: Option<FailureReason>,
    pub attached: bool,
    pub bytes_per_sec: u64,
}

impl SessionInfo {
    pub fn progress_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return if self.status == SessionStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        self.bytes_transferred as f64 * 100.0 / self.total_bytes as f64
    }
}

/// Session data and the status state machine. Guarded by `SessionShared`.
pub(crate) struct TransferSession {
    pub(crate) id: SessionId,
    pub(crate) direction: Direction,
    pub(crate) peer_id: String,
    /// Address cached at creation; used even if the registry later evicts the peer.
    pub(crate) peer_addr: Option<SocketAddr>,
    pub(crate) file_path: PathBuf,
    pub(crate) file_name: String,
    pub(crate) plan: ChunkPlan,
    pub(crate) checksum_algo: ChecksumAlgo,
    bitmap: ChunkBitmap,
    status: SessionStatus,
    last_error: Option<FailureReason>,
    attached: bool,
    /// Concurrency slot; dropped on the terminal transition.
    permit: Option<OwnedSemaphorePermit>,
    run_started: Option<Instant>,
    run_start_bytes: u64,
}

impl TransferSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: SessionId,
        direction: Direction,
        peer_id: String,
        peer_addr: Option<SocketAddr>,
        file_path: PathBuf,
        file_name: String,
        plan: ChunkPlan,
        checksum_algo: ChecksumAlgo,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            id,
            direction,
            peer_id,
            peer_addr,
            file_path,
            file_name,
            bitmap: ChunkBitmap::new(plan.chunk_count()),
            plan,
            checksum_algo,
            status: SessionStatus::Pending,
            last_error: None,
            attached: false,
            permit,
            run_started: None,
            run_start_bytes: 0,
        }
    }

    pub(crate) fn status(&self) -> SessionStatus {
        self.status
    }

    pub(crate) fn last_error(&self) -> Option<&FailureReason> {
        self.last_error.as_ref()
    }

    pub(crate) fn bitmap(&self) -> &ChunkBitmap {
        &self.bitmap
    }

    /// Sum of the lengths of all chunks set in the bitmap.
    pub(crate) fn bytes_transferred(&self) -> u64 {
        let count = u64::from(self.bitmap.count());
        if count == 0 {
            return 0;
        }
        let chunk_size = u64::from(self.plan.chunk_size());
        let last = self.plan.chunk_count().saturating_sub(1);
        let mut bytes = count * chunk_size;
        if self.bitmap.contains(last) {
            bytes -= chunk_size - u64::from(self.plan.chunk_len(last));
        }
        bytes
    }

    fn deny(&self, action: &'static str) -> EngineError {
        EngineError::InvalidTransition {
            from: self.status,
            action,
        }
    }

    fn begin_run(&mut self) {
        self.status = SessionStatus::Active;
        self.attached = true;
        self.run_started = Some(Instant::now());
        self.run_start_bytes = self.bytes_transferred();
    }

    pub(crate) fn start(&mut self) -> Result<()> {
        if self.status != SessionStatus::Pending {
            return Err(self.deny("start"));
        }
        self.begin_run();
        Ok(())
    }

    pub(crate) fn pause(&mut self) -> Result<()> {
        if self.status != SessionStatus::Active {
            return Err(self.deny("pause"));
        }
        self.status = SessionStatus::Paused;
        Ok(())
    }

    pub(crate) fn resume(&mut self) -> Result<()> {
        if self.status != SessionStatus::Paused {
            return Err(self.deny("resume"));
        }
        if !self.attached {
            return Err(EngineError::NotAttached(self.id));
        }
        self.status = SessionStatus::Active;
        Ok(())
    }

    /// Paused and detached → active on a new connection.
    pub(crate) fn reattach(&mut self) -> Result<()> {
        if self.status != SessionStatus::Paused || self.attached {
            return Err(self.deny("reattach"));
        }
        self.begin_run();
        Ok(())
    }

    /// Connection lost: an active session pauses and waits for `reattach`.
    pub(crate) fn detach(&mut self) {
        self.attached = false;
        if self.status == SessionStatus::Active {
            self.status = SessionStatus::Paused;
        }
    }

    pub(crate) fn cancel(&mut self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.deny("cancel"));
        }
        self.finish(SessionStatus::Cancelled, None);
        Ok(())
    }

    pub(crate) fn complete(&mut self) -> Result<()> {
        if self.status != SessionStatus::Active || !self.bitmap.is_complete() {
            return Err(self.deny("complete"));
        }
        self.finish(SessionStatus::Completed, None);
        Ok(())
    }

    pub(crate) fn fail(&mut self, reason: FailureReason) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.deny("fail"));
        }
        self.finish(SessionStatus::Failed, Some(reason));
        Ok(())
    }

    fn finish(&mut self, status: SessionStatus, reason: Option<FailureReason>) {
        self.status = status;
        self.last_error = reason;
        self.attached = false;
        self.permit.take();
    }

    /// Mark a chunk done. Returns true if it was newly set. Ignored once terminal.
    pub(crate) fn mark_chunk(&mut self, index: u32) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.bitmap.set(index)
    }

    /// Adopt a bitmap recovered from a resume record.
    pub(crate) fn seed_bitmap(&mut self, bitmap: ChunkBitmap) -> bool {
        if bitmap.len() != self.plan.chunk_count() {
            return false;
        }
        self.bitmap = bitmap;
        true
    }

    fn bytes_per_sec(&self) -> u64 {
        match (self.status, self.run_started) {
            (SessionStatus::Active, Some(started)) => {
                let secs = started.elapsed().as_secs_f64();
                if secs <= 0.0 {
                    return 0;
                }
                let moved = self.bytes_transferred().saturating_sub(self.run_start_bytes);
                (moved as f64 / secs) as u64
            }
            _ => 0,
        }
    }

    pub(crate) fn hello(&self, sender: &str) -> Hello {
        Hello {
            name: self.file_name.clone(),
            file_size: self.plan.total_bytes(),
            chunk_size: self.plan.chunk_size(),
            checksum_algo: self.checksum_algo,
            session_id: self.id.as_bytes(),
            sender: sender.to_string(),
        }
    }

    pub(crate) fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            direction: self.direction,
            peer_id: self.peer_id.clone(),
            peer_addr: self.peer_addr,
            file_path: self.file_path.clone(),
            file_name: self.file_name.clone(),
            total_bytes: self.plan.total_bytes(),
            chunk_size: self.plan.chunk_size(),
            chunk_count: self.plan.chunk_count(),
            chunks_done: self.bitmap.count(),
            bytes_transferred: self.bytes_transferred(),
            status: self.status,
            last_error: self.last_error.clone(),
            attached: self.attached,
            bytes_per_sec: self.bytes_per_sec(),
        }
    }

    fn progress_event(&self) -> TransferEvent {
        TransferEvent::Progress {
            id: self.id,
            bytes_transferred: self.bytes_transferred(),
            total_bytes: self.plan.total_bytes(),
            chunks_done: self.bitmap.count(),
            chunk_count: self.plan.chunk_count(),
            bytes_per_sec: self.bytes_per_sec(),
        }
    }
}

/// Session state shared between the manager, handles and scheduler workers.
///
/// Every mutation goes through the state lock and publishes its event while holding it,
/// so subscribers see a session's events in the order they happened.
pub(crate) struct SessionShared {
    pub(crate) id: SessionId,
    pub(crate) direction: Direction,
    state: Mutex<TransferSession>,
    status_tx: watch::Sender<SessionStatus>,
    cancel: CancellationToken,
    events: broadcast::Sender<TransferEvent>,
}

impl SessionShared {
    pub(crate) fn new(session: TransferSession, events: broadcast::Sender<TransferEvent>) -> Arc<Self> {
        let _ = events.send(TransferEvent::SessionCreated {
            id: session.id,
            direction: session.direction,
            peer_id: session.peer_id.clone(),
            file_name: session.file_name.clone(),
            total_bytes: session.plan.total_bytes(),
        });
        let (status_tx, _) = watch::channel(session.status());
        Arc::new(Self {
            id: session.id,
            direction: session.direction,
            state: Mutex::new(session),
            status_tx,
            cancel: CancellationToken::new(),
            events,
        })
    }

    /// Tripped when the session reaches a terminal state.
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    pub(crate) fn status(&self) -> SessionStatus {
        *self.status_tx.borrow()
    }

    pub(crate) async fn info(&self) -> SessionInfo {
        self.state.lock().await.info()
    }

    pub(crate) async fn read<R>(&self, f: impl FnOnce(&TransferSession) -> R) -> R {
        f(&*self.state.lock().await)
    }

    async fn transition(
        &self,
        f: impl FnOnce(&mut TransferSession) -> Result<()>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let before = state.status();
        f(&mut state)?;
        if state.status() != before {
            self.publish_status(&state);
        }
        Ok(())
    }

    fn publish_status(&self, state: &TransferSession) {
        let status = state.status();
        info!(session = %self.id, %status, "session status changed");
        self.status_tx.send_replace(status);
        let _ = self.events.send(TransferEvent::StatusChanged {
            id: self.id,
            status,
            reason: state.last_error().cloned(),
        });
        if status.is_terminal() {
            self.cancel.cancel();
        }
    }

    pub(crate) async fn start(&self) -> Result<()> {
        self.transition(|s| s.start()).await
    }

    pub(crate) async fn pause(&self) -> Result<()> {
        self.transition(|s| s.pause()).await
    }

    pub(crate) async fn resume(&self) -> Result<()> {
        self.transition(|s| s.resume()).await
    }

    pub(crate) async fn reattach(&self) -> Result<()> {
        self.transition(|s| s.reattach()).await
    }

    pub(crate) async fn detach(&self) {
        let _ = self
            .transition(|s| {
                s.detach();
                Ok(())
            })
            .await;
    }

    pub(crate) async fn cancel(&self) -> Result<()> {
        self.transition(|s| s.cancel()).await
    }

    pub(crate) async fn complete(&self) -> Result<()> {
        self.transition(|s| s.complete()).await
    }

    pub(crate) async fn fail(&self, reason: FailureReason) -> Result<()> {
        self.transition(|s| s.fail(reason)).await
    }

    pub(crate) async fn seed_bitmap(&self, bitmap: ChunkBitmap) -> bool {
        let mut state = self.state.lock().await;
        let seeded = state.seed_bitmap(bitmap);
        if seeded {
            let _ = self.events.send(state.progress_event());
        }
        seeded
    }

    /// Single synchronized mutation point for chunk completion. Returns true if newly set.
    pub(crate) async fn record_chunk(&self, index: u32) -> bool {
        let mut state = self.state.lock().await;
        if !state.mark_chunk(index) {
            return false;
        }
        debug!(session = %self.id, index, done = state.bitmap().count(), "chunk recorded");
        let _ = self.events.send(state.progress_event());
        true
    }

    pub(crate) async fn missing_chunks(&self) -> Vec<u32> {
        self.state.lock().await.bitmap().missing()
    }

    pub(crate) async fn is_complete(&self) -> bool {
        self.state.lock().await.bitmap().is_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Semaphore;

    fn session(total: u64, chunk: u32) -> TransferSession {
        TransferSession::new(
            SessionId::new(),
            Direction::Send,
            "peer".into(),
            None,
            PathBuf::from("/tmp/f"),
            "f".into(),
            ChunkPlan::new(total, chunk).unwrap(),
            ChecksumAlgo::Sha256,
            None,
        )
    }

    #[test]
    fn happy_path_transitions() {
        let mut s = session(100, 30);
        s.start().unwrap();
        s.pause().unwrap();
        s.resume().unwrap();
        for i in 0..4 {
            assert!(s.mark_chunk(i));
        }
        s.complete().unwrap();
        assert_eq!(s.status(), SessionStatus::Completed);
        assert_eq!(s.bytes_transferred(), 100);
    }

    #[test]
    fn bytes_follow_bitmap_with_short_last_chunk() {
        let mut s = session(100, 30);
        s.start().unwrap();
        s.mark_chunk(3);
        assert_eq!(s.bytes_transferred(), 10);
        s.mark_chunk(0);
        assert_eq!(s.bytes_transferred(), 40);
        assert!(!s.mark_chunk(0));
        assert_eq!(s.bytes_transferred(), 40);
    }

    #[test]
    fn terminal_transitions_are_rejected() {
        let mut s = session(10, 10);
        s.start().unwrap();
        s.cancel().unwrap();
        for result in [s.pause(), s.resume(), s.cancel(), s.start()] {
            assert!(matches!(
                result,
                Err(EngineError::InvalidTransition {
                    from: SessionStatus::Cancelled,
                    ..
                })
            ));
        }
        assert!(!s.mark_chunk(0));
    }

    #[test]
    fn complete_requires_full_bitmap() {
        let mut s = session(100, 30);
        s.start().unwrap();
        s.mark_chunk(0);
        assert!(s.complete().is_err());
        assert_eq!(s.status(), SessionStatus::Active);
    }

    #[test]
    fn detached_session_needs_reattach() {
        let mut s = session(100, 30);
        s.start().unwrap();
        s.detach();
        assert_eq!(s.status(), SessionStatus::Paused);
        assert!(matches!(s.resume(), Err(EngineError::NotAttached(_))));
        s.reattach().unwrap();
        assert_eq!(s.status(), SessionStatus::Active);
        assert!(s.reattach().is_err());
    }

    #[test]
    fn permit_released_on_terminal_state_only() {
        let slots = std::sync::Arc::new(Semaphore::new(1));
        let permit = slots.clone().try_acquire_owned().unwrap();
        let mut s = session(10, 10);
        s.permit = Some(permit);
        s.start().unwrap();
        s.pause().unwrap();
        assert_eq!(slots.available_permits(), 0);
        s.fail(FailureReason::new(ReasonCode::Io, "disk full")).unwrap();
        assert_eq!(slots.available_permits(), 1);
        assert!(s.cancel().is_err());
        assert_eq!(slots.available_permits(), 1);
        assert_eq!(s.last_error().unwrap().code, ReasonCode::Io);
    }

    #[tokio::test]
    async fn shared_state_publishes_ordered_events() {
        let (tx, mut rx) = broadcast::channel(16);
        let shared = SessionShared::new(session(60, 30), tx);
        shared.start().await.unwrap();
        assert!(shared.record_chunk(1).await);
        assert!(!shared.record_chunk(1).await);
        shared.record_chunk(0).await;
        shared.complete().await.unwrap();
        assert!(shared.token().is_cancelled());

        let mut kinds = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            kinds.push(match ev {
                TransferEvent::SessionCreated { .. } => "created".to_string(),
                TransferEvent::StatusChanged { status, .. } => status.to_string(),
                TransferEvent::Progress { chunks_done, .. } => format!("progress{chunks_done}"),
            });
        }
        assert_eq!(
            kinds,
            vec!["created", "active", "progress1", "progress2", "completed"]
        );
    }
}
