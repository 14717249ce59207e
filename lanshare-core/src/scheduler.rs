//! Chunk scheduler: drives one session over one connection.
//!
//! Sending side: a bounded pool of workers pulls missing chunk indices from a shared queue,
//! sends each chunk and waits for its ack, retrying with exponential backoff. A single
//! reader task routes acks back to the waiting worker.
//!
//! Receiving side: verified chunks are written at their offset into `<dest>.part`; the
//! bitmap is checkpointed to a resume sidecar so an interrupted transfer can continue.

use std::collections::{HashMap, VecDeque};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunk::{Chunk, ChunkPlan};
use crate::config::EngineConfig;
use crate::connection::{Connection, FrameReader, FrameSender, WriterHandle};
use crate::error::EngineError;
use crate::protocol::{ChecksumAlgo, ChunkData, Hello, Message, ReasonCode};
use crate::resume::{self, ResumeRecord};
use crate::session::{FailureReason, SessionShared, SessionStatus};
use crate::wire::ProtocolError;

/// Receiver checkpoints its bitmap after this many newly written chunks.
pub const PERSIST_EVERY: u32 = 16;

/// Per-run knobs, taken from `EngineConfig` and session options.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerTuning {
    pub workers: usize,
    pub ack_timeout: Duration,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl From<&EngineConfig> for SchedulerTuning {
    fn from(c: &EngineConfig) -> Self {
        Self {
            workers: c.workers_per_session,
            ack_timeout: c.ack_timeout(),
            max_attempts: c.max_chunk_attempts,
            retry_backoff: c.retry_backoff(),
        }
    }
}

impl SchedulerTuning {
    /// Delay after failed attempt `attempt` (1-based): `retry_backoff * 2^(attempt-1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Wait until the session is active. False once it is terminal or `stop` fires.
async fn wait_active(
    status: &mut watch::Receiver<SessionStatus>,
    stop: &CancellationToken,
) -> bool {
    loop {
        let current = *status.borrow_and_update();
        if current == SessionStatus::Active {
            return true;
        }
        if current.is_terminal() {
            return false;
        }
        tokio::select! {
            _ = stop.cancelled() => return false,
            changed = status.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

/// Why a connection's read side stopped.
#[derive(Debug)]
enum StreamEnd {
    /// Stopped locally.
    Stopped,
    /// Peer closed or the socket broke.
    Closed,
    PeerAborted(ReasonCode),
    Failed(EngineError),
}

fn unexpected(msg: &Message) -> EngineError {
    warn!(kind = msg.type_byte(), "unexpected message for this side of the transfer");
    EngineError::Protocol(ProtocolError::InvalidField("unexpected message type"))
}

/// Best effort: queue `msg` and flush the writer. Used on the way out of a run.
async fn close_with(sender: FrameSender, writer: WriterHandle, msg: Option<Message>, limit: Duration) {
    if let Some(msg) = msg {
        if let Err(e) = sender.send(&msg).await {
            debug!(error = %e, "could not send closing frame");
        }
    }
    drop(sender);
    if let Err(e) = writer.finish_within(limit).await {
        debug!(error = %e, "connection writer did not close cleanly");
    }
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

type AckResult = std::result::Result<(), ReasonCode>;
type AckTable = Arc<Mutex<HashMap<u32, oneshot::Sender<AckResult>>>>;

struct SendContext {
    shared: Arc<SessionShared>,
    sender: FrameSender,
    acks: AckTable,
    queue: Mutex<VecDeque<u32>>,
    /// Child of the session token; also tripped when this connection goes away.
    attachment: CancellationToken,
    tuning: SchedulerTuning,
    file_path: PathBuf,
    plan: ChunkPlan,
    algo: ChecksumAlgo,
}

/// Read acks off the connection and hand each to the worker waiting for it.
async fn route_acks<R>(
    mut reader: FrameReader<R>,
    acks: AckTable,
    attachment: CancellationToken,
) -> StreamEnd
where
    R: AsyncRead + Unpin,
{
    let end = loop {
        let next = tokio::select! {
            _ = attachment.cancelled() => break StreamEnd::Stopped,
            next = reader.next() => next,
        };
        match next {
            Ok(Some(Message::ChunkAck { index, ok, reason })) => {
                let waiter = acks.lock().await.remove(&index);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(if ok { Ok(()) } else { Err(reason) });
                    }
                    None => debug!(index, "ack for a chunk nobody is waiting on"),
                }
            }
            Ok(Some(Message::Abort { reason })) => break StreamEnd::PeerAborted(reason),
            Ok(Some(other)) => break StreamEnd::Failed(unexpected(&other)),
            Ok(None) | Err(EngineError::Io(_)) => break StreamEnd::Closed,
            Err(EngineError::Protocol(e)) if !e.is_fatal() => {
                // the lost ack times out and is retried
                warn!(error = %e, "dropping malformed frame from receiver");
            }
            Err(e) => break StreamEnd::Failed(e),
        }
    };
    attachment.cancel();
    end
}

impl SendContext {
    async fn run_worker(self: Arc<Self>) -> std::result::Result<(), FailureReason> {
        let mut file = File::open(&self.file_path)
            .await
            .map_err(|e| FailureReason::from(&EngineError::Io(e)))?;
        let mut status = self.shared.watch_status();
        loop {
            if !wait_active(&mut status, &self.attachment).await {
                return Ok(());
            }
            let Some(index) = self.queue.lock().await.pop_front() else {
                return Ok(());
            };
            let chunk = Chunk::read(&mut file, self.shared.id, &self.plan, index, self.algo)
                .await
                .map_err(|e| FailureReason::from(&EngineError::Io(e)))?;
            if !self.deliver(chunk).await? {
                return Ok(());
            }
        }
    }

    /// Send one chunk until acked. `Ok(false)` means the run stopped underneath us.
    async fn deliver(&self, chunk: Chunk) -> std::result::Result<bool, FailureReason> {
        let index = chunk.index;
        let msg = chunk.into_message();
        let mut last = ReasonCode::Timeout;
        for attempt in 1..=self.tuning.max_attempts {
            let (tx, rx) = oneshot::channel();
            self.acks.lock().await.insert(index, tx);
            debug!(session = %self.shared.id, index, attempt, "sending chunk");
            let sent = tokio::select! {
                _ = self.attachment.cancelled() => return Ok(false),
                sent = self.sender.send(&msg) => sent,
            };
            match sent {
                Ok(()) => {}
                Err(EngineError::Io(_)) => {
                    self.attachment.cancel();
                    return Ok(false);
                }
                Err(e) => {
                    self.acks.lock().await.remove(&index);
                    warn!(session = %self.shared.id, index, error = %e, "chunk cannot be sent");
                    return Err(FailureReason::from(&e));
                }
            }
            let outcome = tokio::select! {
                _ = self.attachment.cancelled() => return Ok(false),
                outcome = tokio::time::timeout(self.tuning.ack_timeout, rx) => outcome,
            };
            match outcome {
                Ok(Ok(Ok(()))) => {
                    self.shared.record_chunk(index).await;
                    return Ok(true);
                }
                Ok(Ok(Err(reason))) => {
                    warn!(session = %self.shared.id, index, attempt, %reason, "chunk rejected");
                    last = reason;
                }
                // router gone: connection ended
                Ok(Err(_)) => return Ok(false),
                Err(_) => {
                    self.acks.lock().await.remove(&index);
                    warn!(session = %self.shared.id, index, attempt, "chunk ack timed out");
                    last = ReasonCode::Timeout;
                }
            }
            if attempt < self.tuning.max_attempts {
                tokio::select! {
                    _ = self.attachment.cancelled() => return Ok(false),
                    _ = tokio::time::sleep(self.tuning.backoff(attempt)) => {}
                }
            }
        }
        Err(FailureReason::new(
            last,
            format!(
                "chunk {index} failed after {} attempts: {}",
                self.tuning.max_attempts,
                last.describe()
            ),
        ))
    }
}

/// Drive an attached send session until it completes, stops or loses its connection.
///
/// The session must already be `Active`. Only missing chunks are scheduled.
pub(crate) async fn run_sender<S>(
    shared: Arc<SessionShared>,
    conn: Connection<S>,
    hello: Hello,
    tuning: SchedulerTuning,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let Connection {
        reader,
        sender,
        writer,
    } = conn;
    let attachment = shared.token().child_token();
    let (file_path, plan, algo) = shared
        .read(|s| (s.file_path.clone(), s.plan, s.checksum_algo))
        .await;
    let missing = shared.missing_chunks().await;
    info!(
        session = %shared.id,
        chunks = plan.chunk_count(),
        missing = missing.len(),
        workers = tuning.workers,
        "send run started"
    );

    match sender.send(&Message::Hello(hello)).await {
        Ok(()) => {}
        Err(EngineError::Io(_)) => {
            shared.detach().await;
            return;
        }
        Err(e) => {
            warn!(session = %shared.id, error = %e, "hello cannot be sent");
            let _ = shared.fail(FailureReason::from(&e)).await;
            close_with(sender, writer, None, tuning.ack_timeout).await;
            return;
        }
    }

    let acks: AckTable = Arc::new(Mutex::new(HashMap::new()));
    let router = tokio::spawn(route_acks(reader, acks.clone(), attachment.clone()));
    let ctx = Arc::new(SendContext {
        shared: shared.clone(),
        sender: sender.clone(),
        acks,
        queue: Mutex::new(missing.into_iter().collect()),
        attachment: attachment.clone(),
        tuning,
        file_path,
        plan,
        algo,
    });

    let mut workers = JoinSet::new();
    for _ in 0..tuning.workers.max(1) {
        workers.spawn(ctx.clone().run_worker());
    }
    while let Some(joined) = workers.join_next().await {
        let failure = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(reason)) => reason,
            Err(e) => FailureReason::new(ReasonCode::Unknown, format!("worker stopped: {e}")),
        };
        // first failure wins; the terminal transition stops the siblings
        if shared.fail(failure).await.is_ok() {
            warn!(session = %shared.id, "send run failed");
        }
    }
    drop(ctx);

    let ended_early = attachment.is_cancelled();
    attachment.cancel();
    let end = router.await.unwrap_or(StreamEnd::Stopped);
    finish_sender(&shared, sender, writer, ended_early, end, tuning).await;
}

async fn finish_sender(
    shared: &SessionShared,
    sender: FrameSender,
    writer: WriterHandle,
    ended_early: bool,
    end: StreamEnd,
    tuning: SchedulerTuning,
) {
    let limit = tuning.ack_timeout;
    match shared.status() {
        SessionStatus::Cancelled => {
            let abort = Message::Abort {
                reason: ReasonCode::Cancelled,
            };
            close_with(sender, writer, Some(abort), limit).await;
        }
        SessionStatus::Failed => {
            let reason = shared
                .read(|s| s.last_error().map(|r| r.code))
                .await
                .unwrap_or(ReasonCode::Unknown);
            close_with(sender, writer, Some(Message::Abort { reason }), limit).await;
        }
        _ if ended_early => {
            match end {
                StreamEnd::PeerAborted(ReasonCode::Cancelled) => {
                    info!(session = %shared.id, "receiver cancelled the transfer");
                    let _ = shared.cancel().await;
                }
                StreamEnd::PeerAborted(code) => {
                    let _ = shared
                        .fail(FailureReason::from(&EngineError::PeerAborted(code)))
                        .await;
                }
                StreamEnd::Failed(e) => {
                    let reason = e.reason_code();
                    let _ = shared.fail(FailureReason::from(&e)).await;
                    close_with(sender, writer, Some(Message::Abort { reason }), limit).await;
                    return;
                }
                StreamEnd::Closed | StreamEnd::Stopped => {
                    info!(session = %shared.id, "connection lost, session detached");
                    shared.detach().await;
                }
            }
            close_with(sender, writer, None, limit).await;
        }
        _ if shared.is_complete().await => {
            let mut status = shared.watch_status();
            if !wait_active(&mut status, shared.token()).await {
                let abort = Message::Abort {
                    reason: ReasonCode::Cancelled,
                };
                close_with(sender, writer, Some(abort), limit).await;
                return;
            }
            let sent = sender.send(&Message::Complete).await;
            drop(sender);
            match (sent, writer.finish_within(limit).await) {
                (Ok(()), Ok(())) => {
                    if let Err(e) = shared.complete().await {
                        warn!(session = %shared.id, error = %e, "could not complete session");
                    }
                }
                _ => shared.detach().await,
            }
        }
        _ => {
            shared.detach().await;
            close_with(sender, writer, None, limit).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

enum ReceiveEnd {
    Complete,
    Stream(StreamEnd),
}

struct PartFile {
    dest: PathBuf,
    part: PathBuf,
    file: File,
}

impl PartFile {
    async fn open(dest: &Path, total_bytes: u64) -> io::Result<Self> {
        let part = resume::part_path(dest);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&part)
            .await?;
        file.set_len(total_bytes).await?;
        Ok(Self {
            dest: dest.to_path_buf(),
            part,
            file,
        })
    }

    async fn write_at(&mut self, offset: u64, payload: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(payload).await?;
        self.file.flush().await
    }

    /// Sync and move the finished file into place.
    async fn commit(mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);
        tokio::fs::rename(&self.part, &self.dest).await?;
        ResumeRecord::remove(&resume::sidecar_path(&self.dest)).await
    }
}

/// Remove `<dest>.part` and its sidecar.
pub(crate) async fn discard_partial(dest: &Path) {
    match tokio::fs::remove_file(resume::part_path(dest)).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            warn!(path = %dest.display(), error = %e, "could not remove partial file")
        }
        _ => {}
    }
    if let Err(e) = ResumeRecord::remove(&resume::sidecar_path(dest)).await {
        warn!(path = %dest.display(), error = %e, "could not remove resume record");
    }
}

async fn persist_bitmap(shared: &SessionShared, dest: &Path) {
    let record = shared
        .read(|s| ResumeRecord {
            session_id: s.id.as_bytes(),
            total_bytes: s.plan.total_bytes(),
            chunk_size: s.plan.chunk_size(),
            bitmap: s.bitmap().clone(),
        })
        .await;
    if let Err(e) = record.save(&resume::sidecar_path(dest)).await {
        warn!(session = %shared.id, error = %e, "could not save resume record");
    }
}

/// Adopt a matching sidecar left by an earlier, interrupted run.
async fn restore_bitmap(shared: &SessionShared, dest: &Path) {
    let (fresh, id, plan) = shared
        .read(|s| (s.bitmap().count() == 0, s.id, s.plan))
        .await;
    if !fresh {
        return;
    }
    match ResumeRecord::load(&resume::sidecar_path(dest)).await {
        Ok(Some(record)) if record.matches(id.as_bytes(), plan.total_bytes(), plan.chunk_size()) => {
            let done = record.bitmap.count();
            if shared.seed_bitmap(record.bitmap).await {
                info!(session = %id, chunks = done, "resuming from saved progress");
            }
        }
        Ok(_) => {}
        Err(e) => warn!(session = %id, error = %e, "ignoring unreadable resume record"),
    }
}

/// Outcome of handling one `ChunkData`.
enum Verdict {
    Ack(Message),
    Fail(EngineError),
}

async fn accept_chunk(
    shared: &SessionShared,
    part: &mut PartFile,
    plan: &ChunkPlan,
    algo: ChecksumAlgo,
    chunk: ChunkData,
    written: &mut u32,
) -> Verdict {
    let index = chunk.index;
    let expected = plan.range(index);
    if expected != Some((chunk.offset, chunk.payload.len() as u32)) {
        warn!(session = %shared.id, index, offset = chunk.offset, "chunk does not match the transfer layout");
        return Verdict::Ack(Message::nack(index, ReasonCode::InvalidChunk));
    }
    if chunk.checksum.len() != algo.digest_len() {
        warn!(session = %shared.id, index, len = chunk.checksum.len(), ?algo, "chunk digest is not the negotiated algorithm");
        return Verdict::Ack(Message::nack(index, ReasonCode::InvalidChunk));
    }
    if shared.read(|s| s.bitmap().contains(index)).await {
        debug!(session = %shared.id, index, "duplicate chunk");
        return Verdict::Ack(Message::ack(index));
    }
    if let Err(e) = part.write_at(chunk.offset, &chunk.payload).await {
        return Verdict::Fail(e.into());
    }
    if shared.record_chunk(index).await {
        *written += 1;
        if *written % PERSIST_EVERY == 0 {
            persist_bitmap(shared, &part.dest).await;
        }
    }
    Verdict::Ack(Message::ack(index))
}

/// Drive an attached receive session. The peer's `Hello` has already been consumed.
pub(crate) async fn run_receiver<S>(
    shared: Arc<SessionShared>,
    conn: Connection<S>,
    tuning: SchedulerTuning,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let Connection {
        mut reader,
        sender,
        writer,
    } = conn;
    let limit = tuning.ack_timeout;
    let (dest, plan, algo) = shared
        .read(|s| (s.file_path.clone(), s.plan, s.checksum_algo))
        .await;
    info!(session = %shared.id, dest = %dest.display(), chunks = plan.chunk_count(), "receive run started");

    let mut part = match PartFile::open(&dest, plan.total_bytes()).await {
        Ok(p) => p,
        Err(e) => {
            let e = EngineError::Io(e);
            let _ = shared.fail(FailureReason::from(&e)).await;
            let abort = Message::Abort {
                reason: e.reason_code(),
            };
            close_with(sender, writer, Some(abort), limit).await;
            discard_partial(&dest).await;
            return;
        }
    };
    restore_bitmap(&shared, &dest).await;

    let token = shared.token().clone();
    let mut status = shared.watch_status();
    let mut written = 0u32;
    let end = loop {
        if !wait_active(&mut status, &token).await {
            break ReceiveEnd::Stream(StreamEnd::Stopped);
        }
        let next = tokio::select! {
            _ = token.cancelled() => break ReceiveEnd::Stream(StreamEnd::Stopped),
            next = reader.next() => next,
        };
        let reply = match next {
            Ok(Some(Message::ChunkData(chunk))) => {
                match accept_chunk(&shared, &mut part, &plan, algo, chunk, &mut written).await {
                    Verdict::Ack(reply) => reply,
                    Verdict::Fail(e) => break ReceiveEnd::Stream(StreamEnd::Failed(e)),
                }
            }
            Ok(Some(Message::Complete)) => break ReceiveEnd::Complete,
            Ok(Some(Message::Abort { reason })) => {
                break ReceiveEnd::Stream(StreamEnd::PeerAborted(reason))
            }
            Ok(Some(other)) => break ReceiveEnd::Stream(StreamEnd::Failed(unexpected(&other))),
            Ok(None) | Err(EngineError::Io(_)) => break ReceiveEnd::Stream(StreamEnd::Closed),
            Err(EngineError::Protocol(ProtocolError::ChecksumMismatch { index })) => {
                warn!(session = %shared.id, index, "chunk failed verification, not written");
                Message::nack(index, ReasonCode::ChecksumMismatch)
            }
            Err(e) => {
                warn!(session = %shared.id, error = %e, "protocol error from sender");
                break ReceiveEnd::Stream(StreamEnd::Failed(e));
            }
        };
        if sender.send(&reply).await.is_err() {
            break ReceiveEnd::Stream(StreamEnd::Closed);
        }
    };

    match end {
        ReceiveEnd::Complete => {
            let missing = shared.missing_chunks().await.len();
            if missing > 0 {
                let e = EngineError::Protocol(ProtocolError::InvalidField(
                    "transfer completed with chunks missing",
                ));
                warn!(session = %shared.id, missing, "sender completed early");
                let _ = shared.fail(FailureReason::from(&e)).await;
                let abort = Message::Abort {
                    reason: ReasonCode::Protocol,
                };
                close_with(sender, writer, Some(abort), limit).await;
                discard_partial(&dest).await;
                return;
            }
            match part.commit().await {
                Ok(()) => {
                    if let Err(e) = shared.complete().await {
                        warn!(session = %shared.id, error = %e, "could not complete session");
                    }
                }
                Err(e) => {
                    let _ = shared.fail(FailureReason::from(&EngineError::Io(e))).await;
                    discard_partial(&dest).await;
                }
            }
            close_with(sender, writer, None, limit).await;
        }
        ReceiveEnd::Stream(StreamEnd::Closed) => {
            drop(part);
            persist_bitmap(&shared, &dest).await;
            info!(session = %shared.id, "connection lost, session detached");
            shared.detach().await;
            close_with(sender, writer, None, limit).await;
        }
        ReceiveEnd::Stream(StreamEnd::PeerAborted(code)) => {
            drop(part);
            if code == ReasonCode::Cancelled {
                info!(session = %shared.id, "sender cancelled the transfer");
                let _ = shared.cancel().await;
            } else {
                let _ = shared
                    .fail(FailureReason::from(&EngineError::PeerAborted(code)))
                    .await;
            }
            discard_partial(&dest).await;
            close_with(sender, writer, None, limit).await;
        }
        ReceiveEnd::Stream(StreamEnd::Failed(e)) => {
            drop(part);
            let reason = e.reason_code();
            let _ = shared.fail(FailureReason::from(&e)).await;
            close_with(sender, writer, Some(Message::Abort { reason }), limit).await;
            discard_partial(&dest).await;
        }
        ReceiveEnd::Stream(StreamEnd::Stopped) => {
            drop(part);
            let reason = match shared.status() {
                SessionStatus::Failed => shared
                    .read(|s| s.last_error().map(|r| r.code))
                    .await
                    .unwrap_or(ReasonCode::Unknown),
                _ => ReasonCode::Cancelled,
            };
            close_with(sender, writer, Some(Message::Abort { reason }), limit).await;
            if shared.status().is_terminal() {
                discard_partial(&dest).await;
            } else {
                persist_bitmap(&shared, &dest).await;
                shared.detach().await;
            }
        }
    }
}
