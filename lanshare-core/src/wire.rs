//! Framing: 1 byte type + 4 bytes BE length + payload. All integers big-endian.

use crate::integrity;
use crate::protocol::{
    ChecksumAlgo, ChunkData, Hello, Message, ReasonCode, TYPE_ABORT, TYPE_CHUNK_ACK,
    TYPE_CHUNK_DATA, TYPE_COMPLETE, TYPE_HELLO,
};

pub const HEADER_SIZE: usize = 5;
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024; // 64 MiB

/// Fixed part of a ChunkData payload: index + offset + length.
const CHUNK_FIXED: usize = 4 + 8 + 4;

/// Structural error in a received frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed length in {0} frame")]
    MalformedLength(&'static str),
    #[error("checksum mismatch for chunk {index}")]
    ChecksumMismatch { index: u32 },
    #[error("unknown message type 0x{0:02x}")]
    UnknownMessageType(u8),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("invalid field: {0}")]
    InvalidField(&'static str),
}

impl ProtocolError {
    /// Fatal errors leave the stream unsynchronised; the connection must be dropped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::FrameTooLarge(_))
    }
}

/// Error encoding a message into a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large")]
    TooLarge,
    #[error("{0} does not fit its length prefix")]
    FieldTooLong(&'static str),
    #[error("checksum of {0} bytes is not a supported digest")]
    BadChecksum(usize),
}

/// Error decoding a frame (need more bytes, or a protocol error).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Encode a message into a single frame.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let mut payload = Vec::new();
    match msg {
        Message::Hello(h) => {
            put_str16(&mut payload, &h.name, "name")?;
            payload.extend_from_slice(&h.file_size.to_be_bytes());
            payload.extend_from_slice(&h.chunk_size.to_be_bytes());
            payload.push(h.checksum_algo.as_u8());
            payload.extend_from_slice(&h.session_id);
            put_str16(&mut payload, &h.sender, "sender")?;
        }
        Message::ChunkData(c) => {
            if ChecksumAlgo::from_digest_len(c.checksum.len()).is_none() {
                return Err(FrameEncodeError::BadChecksum(c.checksum.len()));
            }
            let length =
                u32::try_from(c.payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
            payload.reserve(CHUNK_FIXED + c.checksum.len() + c.payload.len());
            payload.extend_from_slice(&c.index.to_be_bytes());
            payload.extend_from_slice(&c.offset.to_be_bytes());
            payload.extend_from_slice(&length.to_be_bytes());
            payload.extend_from_slice(&c.checksum);
            payload.extend_from_slice(&c.payload);
        }
        Message::ChunkAck { index, ok, reason } => {
            payload.extend_from_slice(&index.to_be_bytes());
            payload.push(u8::from(*ok));
            payload.push(reason.as_u8());
        }
        Message::Complete => {}
        Message::Abort { reason } => payload.push(reason.as_u8()),
    }
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.push(msg.type_byte());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

fn put_str16(out: &mut Vec<u8>, s: &str, field: &'static str) -> Result<(), FrameEncodeError> {
    let len = u16::try_from(s.len()).map_err(|_| FrameEncodeError::FieldTooLong(field))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if the frame is incomplete.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let len = match frame_len(bytes)? {
        Some(len) => len,
        None => return Err(FrameDecodeError::NeedMore),
    };
    if bytes.len() < HEADER_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg = decode_payload(bytes[0], &bytes[HEADER_SIZE..HEADER_SIZE + len])?;
    Ok((msg, HEADER_SIZE + len))
}

/// Payload length from the header, if the header is complete.
fn frame_len(bytes: &[u8]) -> Result<Option<usize>, ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Ok(None);
    }
    let len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    Ok(Some(len))
}

fn decode_payload(kind: u8, payload: &[u8]) -> Result<Message, ProtocolError> {
    match kind {
        TYPE_HELLO => {
            let mut r = Reader::new(payload, "hello");
            let name = r.str16("name")?;
            let file_size = r.u64()?;
            let chunk_size = r.u32()?;
            if chunk_size == 0 {
                return Err(ProtocolError::InvalidField("chunk_size"));
            }
            let checksum_algo = ChecksumAlgo::from_u8(r.u8()?)
                .ok_or(ProtocolError::InvalidField("checksum_algo"))?;
            let mut session_id = [0u8; 16];
            session_id.copy_from_slice(r.take(16)?);
            let sender = r.str16("sender")?;
            r.finish()?;
            Ok(Message::Hello(Hello {
                name,
                file_size,
                chunk_size,
                checksum_algo,
                session_id,
                sender,
            }))
        }
        TYPE_CHUNK_DATA => {
            let mut r = Reader::new(payload, "chunk data");
            let index = r.u32()?;
            let offset = r.u64()?;
            let length = r.u32()? as usize;
            let rest = payload.len() - CHUNK_FIXED;
            if rest < length {
                return Err(ProtocolError::MalformedLength("chunk data"));
            }
            let checksum_len = rest - length;
            if ChecksumAlgo::from_digest_len(checksum_len).is_none() {
                return Err(ProtocolError::InvalidField("checksum"));
            }
            let checksum = r.take(checksum_len)?.to_vec();
            let data = r.take(length)?;
            r.finish()?;
            if !integrity::verify_chunk(data, &checksum) {
                return Err(ProtocolError::ChecksumMismatch { index });
            }
            Ok(Message::ChunkData(ChunkData {
                index,
                offset,
                checksum,
                payload: data.to_vec(),
            }))
        }
        TYPE_CHUNK_ACK => {
            let mut r = Reader::new(payload, "chunk ack");
            let index = r.u32()?;
            let ok = match r.u8()? {
                0 => false,
                1 => true,
                _ => return Err(ProtocolError::InvalidField("ok")),
            };
            let reason = ReasonCode::from_u8(r.u8()?);
            r.finish()?;
            Ok(Message::ChunkAck { index, ok, reason })
        }
        TYPE_COMPLETE => {
            Reader::new(payload, "complete").finish()?;
            Ok(Message::Complete)
        }
        TYPE_ABORT => {
            let mut r = Reader::new(payload, "abort");
            let reason = ReasonCode::from_u8(r.u8()?);
            r.finish()?;
            Ok(Message::Abort { reason })
        }
        other => Err(ProtocolError::UnknownMessageType(other)),
    }
}

/// Bounds-checked cursor over a frame payload.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    frame: &'static str,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], frame: &'static str) -> Self {
        Self { buf, pos: 0, frame }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() - self.pos < n {
            return Err(ProtocolError::MalformedLength(self.frame));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(b))
    }

    fn str16(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidField(field))
    }

    /// Trailing bytes mean the declared length disagrees with the content.
    fn finish(&self) -> Result<(), ProtocolError> {
        if self.pos != self.buf.len() {
            return Err(ProtocolError::MalformedLength(self.frame));
        }
        Ok(())
    }
}

/// Streaming decoder for a byte stream that may deliver partial frames.
///
/// A non-fatal protocol error consumes exactly the offending frame, so the caller can
/// answer it (e.g. nack a corrupted chunk) and keep reading.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete message, `Ok(None)` if more bytes are needed.
    pub fn next_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        match decode_frame(&self.buf) {
            Ok((msg, n)) => {
                self.buf.drain(..n);
                Ok(Some(msg))
            }
            Err(FrameDecodeError::NeedMore) => Ok(None),
            Err(FrameDecodeError::Protocol(e)) => {
                if e.is_fatal() {
                    self.buf.clear();
                } else if let Ok(Some(len)) = frame_len(&self.buf) {
                    self.buf.drain(..HEADER_SIZE + len);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::hash_chunk;

    fn sample_hello() -> Message {
        Message::Hello(Hello {
            name: "holiday.mp4".into(),
            file_size: 3_670_016,
            chunk_size: 1024 * 1024,
            checksum_algo: ChecksumAlgo::Sha256,
            session_id: [7u8; 16],
            sender: "laptop-b".into(),
        })
    }

    fn sample_chunk(algo: ChecksumAlgo) -> Message {
        let payload = vec![0xAB; 100];
        Message::ChunkData(ChunkData {
            index: 2,
            offset: 200,
            checksum: hash_chunk(algo, &payload),
            payload,
        })
    }

    #[test]
    fn hello_layout_is_type_then_be_length() {
        let frame = encode_frame(&sample_hello()).unwrap();
        assert_eq!(frame[0], TYPE_HELLO);
        let len = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
        assert_eq!(len, frame.len() - HEADER_SIZE);
        // nameLen prefix
        assert_eq!(&frame[5..7], &(11u16).to_be_bytes());
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, sample_hello());
    }

    #[test]
    fn chunk_data_with_either_digest() {
        for algo in [ChecksumAlgo::Sha256, ChecksumAlgo::Sha256Trunc128] {
            let msg = sample_chunk(algo);
            let frame = encode_frame(&msg).unwrap();
            assert_eq!(frame.len(), HEADER_SIZE + CHUNK_FIXED + algo.digest_len() + 100);
            let (decoded, _) = decode_frame(&frame).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn corrupted_payload_is_checksum_mismatch() {
        let mut frame = encode_frame(&sample_chunk(ChecksumAlgo::Sha256)).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameDecodeError::Protocol(ProtocolError::ChecksumMismatch { index: 2 }))
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let frame = [0x09, 0, 0, 0, 0];
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameDecodeError::Protocol(ProtocolError::UnknownMessageType(0x09)))
        ));
    }

    #[test]
    fn trailing_bytes_are_malformed_length() {
        let mut frame = encode_frame(&Message::Abort {
            reason: ReasonCode::Busy,
        })
        .unwrap();
        frame.push(0);
        frame[4] = 2;
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameDecodeError::Protocol(ProtocolError::MalformedLength(_)))
        ));
    }

    #[test]
    fn chunk_length_larger_than_frame_is_malformed() {
        let mut frame = encode_frame(&sample_chunk(ChecksumAlgo::Sha256)).unwrap();
        // length field lives after type(1) + len(4) + index(4) + offset(8)
        frame[17..21].copy_from_slice(&10_000u32.to_be_bytes());
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameDecodeError::Protocol(ProtocolError::MalformedLength(_)))
        ));
    }

    #[test]
    fn ack_with_bad_bool_is_invalid() {
        let frame = [TYPE_CHUNK_ACK, 0, 0, 0, 6, 0, 0, 0, 1, 7, 0];
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameDecodeError::Protocol(ProtocolError::InvalidField("ok")))
        ));
    }

    #[test]
    fn oversized_length_is_fatal() {
        let frame = [TYPE_CHUNK_DATA, 0xFF, 0xFF, 0xFF, 0xFF];
        match decode_frame(&frame) {
            Err(FrameDecodeError::Protocol(e)) => assert!(e.is_fatal()),
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_hello()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn streaming_decoder_handles_split_frames() {
        let mut bytes = encode_frame(&sample_hello()).unwrap();
        bytes.extend(encode_frame(&Message::ack(3)).unwrap());
        bytes.extend(encode_frame(&Message::Complete).unwrap());

        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        for piece in bytes.chunks(3) {
            decoder.extend(piece);
            while let Some(msg) = decoder.next_message().unwrap() {
                out.push(msg);
            }
        }
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], sample_hello());
        assert_eq!(out[1], Message::ack(3));
        assert_eq!(out[2], Message::Complete);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn streaming_decoder_skips_only_the_bad_frame() {
        let mut bad = encode_frame(&sample_chunk(ChecksumAlgo::Sha256)).unwrap();
        let last = bad.len() - 1;
        bad[last] ^= 0x01;
        let mut decoder = FrameDecoder::new();
        decoder.extend(&bad);
        decoder.extend(&encode_frame(&Message::Complete).unwrap());

        assert_eq!(
            decoder.next_message(),
            Err(ProtocolError::ChecksumMismatch { index: 2 })
        );
        assert_eq!(decoder.next_message(), Ok(Some(Message::Complete)));
        assert_eq!(decoder.next_message(), Ok(None));
    }

    #[test]
    fn encode_rejects_unsupported_checksum() {
        let msg = Message::ChunkData(ChunkData {
            index: 0,
            offset: 0,
            checksum: vec![0; 20],
            payload: vec![1, 2, 3],
        });
        assert!(matches!(
            encode_frame(&msg),
            Err(FrameEncodeError::BadChecksum(20))
        ));
    }
}
