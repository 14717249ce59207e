//! Framed connection over any byte stream: a reader that yields messages and a
//! writer task fed by a channel, so several workers can send without sharing the socket.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::Result;
use crate::protocol::Message;
use crate::wire::{encode_frame, FrameDecoder};

/// Frames queued for the writer before senders wait.
const WRITE_QUEUE: usize = 32;
const READ_BUF: usize = 64 * 1024;

/// Reads framed messages from a stream.
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    buf: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            buf: vec![0u8; READ_BUF].into_boxed_slice(),
        }
    }

    /// Next message, or `Ok(None)` on a clean end of stream.
    ///
    /// A recoverable protocol error consumes only the bad frame; the reader stays usable.
    pub async fn next(&mut self) -> Result<Option<Message>> {
        loop {
            if let Some(msg) = self.decoder.next_message()? {
                return Ok(Some(msg));
            }
            let n = self.inner.read(&mut self.buf).await?;
            if n == 0 {
                if self.decoder.buffered() > 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-frame",
                    )
                    .into());
                }
                return Ok(None);
            }
            self.decoder.extend(&self.buf[..n]);
        }
    }
}

/// Cloneable handle that queues messages for the connection's writer task.
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Vec<u8>>,
}

impl FrameSender {
    /// `Encode` if the message cannot be framed; `Io` once the writer is gone.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        let frame = encode_frame(msg)?;
        self.tx
            .send(frame)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection writer closed"))?;
        Ok(())
    }
}

/// Writer task handle.
pub struct WriterHandle(JoinHandle<io::Result<()>>);

impl WriterHandle {
    /// Wait for every queued frame to be flushed and the stream shut down.
    ///
    /// The writer only drains once all `FrameSender` clones are dropped; past `limit`
    /// the task is aborted and `TimedOut` returned.
    pub async fn finish_within(mut self, limit: Duration) -> io::Result<()> {
        match tokio::time::timeout(limit, &mut self.0).await {
            Ok(joined) => joined.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?,
            Err(_) => {
                self.0.abort();
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connection writer did not drain",
                ))
            }
        }
    }
}

/// Spawn the writer task. Frames are written in the order they were queued.
pub fn spawn_writer<W>(mut writer: W) -> (FrameSender, WriterHandle)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE);
    let handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            writer.write_all(&frame).await?;
            writer.flush().await?;
        }
        debug!("connection writer drained");
        writer.shutdown().await
    });
    (FrameSender { tx }, WriterHandle(handle))
}

/// A stream split into a frame reader and a queued writer.
pub struct Connection<S> {
    pub reader: FrameReader<ReadHalf<S>>,
    pub sender: FrameSender,
    pub writer: WriterHandle,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (sender, writer) = spawn_writer(write_half);
        Self {
            reader: FrameReader::new(read_half),
            sender,
            writer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::protocol::ReasonCode;
    use crate::wire::ProtocolError;

    #[tokio::test]
    async fn messages_cross_a_duplex_pipe_in_order() {
        let (a, b) = tokio::io::duplex(1024);
        let conn_a = Connection::new(a);
        let mut conn_b = Connection::new(b);

        for i in 0..5 {
            conn_a.sender.send(&Message::ack(i)).await.unwrap();
        }
        conn_a.sender.send(&Message::Complete).await.unwrap();
        drop(conn_a.sender);
        conn_a
            .writer
            .finish_within(Duration::from_secs(5))
            .await
            .unwrap();

        for i in 0..5 {
            assert_eq!(conn_b.reader.next().await.unwrap(), Some(Message::ack(i)));
        }
        assert_eq!(conn_b.reader.next().await.unwrap(), Some(Message::Complete));
        assert_eq!(conn_b.reader.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn bad_frame_is_reported_and_stream_continues() {
        let (mut raw, b) = tokio::io::duplex(1024);
        let mut conn = Connection::new(b);
        // unknown type 0x7f with a 1-byte payload, then a valid abort
        raw.write_all(&[0x7f, 0, 0, 0, 1, 0xee]).await.unwrap();
        raw.write_all(&encode_frame(&Message::Abort { reason: ReasonCode::Busy }).unwrap())
            .await
            .unwrap();
        drop(raw);

        assert!(matches!(
            conn.reader.next().await,
            Err(EngineError::Protocol(ProtocolError::UnknownMessageType(0x7f)))
        ));
        assert_eq!(
            conn.reader.next().await.unwrap(),
            Some(Message::Abort { reason: ReasonCode::Busy })
        );
        assert_eq!(conn.reader.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn unencodable_message_is_not_a_closed_connection() {
        let (a, _b) = tokio::io::duplex(1024);
        let conn = Connection::new(a);
        let bad = Message::ChunkData(crate::protocol::ChunkData {
            index: 0,
            offset: 0,
            checksum: vec![0; 7],
            payload: vec![1, 2, 3],
        });
        assert!(matches!(
            conn.sender.send(&bad).await,
            Err(EngineError::Encode(_))
        ));
        // the writer is untouched and still takes frames
        conn.sender.send(&Message::Complete).await.unwrap();
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_error() {
        let (mut raw, b) = tokio::io::duplex(64);
        let mut conn = Connection::new(b);
        raw.write_all(&[0x03, 0, 0, 0, 6, 0]).await.unwrap();
        drop(raw);
        assert!(matches!(conn.reader.next().await, Err(EngineError::Io(_))));
    }
}
