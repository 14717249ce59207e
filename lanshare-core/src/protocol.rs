//! LanShare wire protocol: message types, checksum algorithms and reason codes.

use std::fmt;

/// Current protocol version. Carried in discovery beacons.
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame type bytes (first byte of every frame).
pub const TYPE_HELLO: u8 = 0x01;
pub const TYPE_CHUNK_DATA: u8 = 0x02;
pub const TYPE_CHUNK_ACK: u8 = 0x03;
pub const TYPE_COMPLETE: u8 = 0x04;
pub const TYPE_ABORT: u8 = 0x05;

/// Checksum algorithm negotiated in `Hello`. The digest length identifies it on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub enum ChecksumAlgo {
    /// Full SHA-256 digest (32 bytes).
    #[default]
    Sha256,
    /// SHA-256 truncated to its first 16 bytes.
    Sha256Trunc128,
}

impl ChecksumAlgo {
    pub fn as_u8(self) -> u8 {
        match self {
            ChecksumAlgo::Sha256 => 1,
            ChecksumAlgo::Sha256Trunc128 => 2,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ChecksumAlgo::Sha256),
            2 => Some(ChecksumAlgo::Sha256Trunc128),
            _ => None,
        }
    }

    /// Digest length in bytes.
    pub fn digest_len(self) -> usize {
        match self {
            ChecksumAlgo::Sha256 => 32,
            ChecksumAlgo::Sha256Trunc128 => 16,
        }
    }

    /// Algorithm implied by a digest length, if any.
    pub fn from_digest_len(len: usize) -> Option<Self> {
        match len {
            32 => Some(ChecksumAlgo::Sha256),
            16 => Some(ChecksumAlgo::Sha256Trunc128),
            _ => None,
        }
    }
}

/// One-byte reason code carried by `ChunkAck` and `Abort`, and attached to failed sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ReasonCode {
    None,
    ChecksumMismatch,
    Io,
    Protocol,
    Cancelled,
    Timeout,
    Busy,
    PeerUnavailable,
    InvalidChunk,
    Unknown,
}

impl ReasonCode {
    pub fn as_u8(self) -> u8 {
        match self {
            ReasonCode::None => 0,
            ReasonCode::ChecksumMismatch => 1,
            ReasonCode::Io => 2,
            ReasonCode::Protocol => 3,
            ReasonCode::Cancelled => 4,
            ReasonCode::Timeout => 5,
            ReasonCode::Busy => 6,
            ReasonCode::PeerUnavailable => 7,
            ReasonCode::InvalidChunk => 8,
            ReasonCode::Unknown => 255,
        }
    }

    /// Lenient: codes from a newer peer map to `Unknown` instead of failing the frame.
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => ReasonCode::None,
            1 => ReasonCode::ChecksumMismatch,
            2 => ReasonCode::Io,
            3 => ReasonCode::Protocol,
            4 => ReasonCode::Cancelled,
            5 => ReasonCode::Timeout,
            6 => ReasonCode::Busy,
            7 => ReasonCode::PeerUnavailable,
            8 => ReasonCode::InvalidChunk,
            _ => ReasonCode::Unknown,
        }
    }

    /// Human-readable description for status screens.
    pub fn describe(self) -> &'static str {
        match self {
            ReasonCode::None => "no error",
            ReasonCode::ChecksumMismatch => "data was corrupted in transit",
            ReasonCode::Io => "could not read or write the file",
            ReasonCode::Protocol => "the other device sent invalid data",
            ReasonCode::Cancelled => "the transfer was cancelled",
            ReasonCode::Timeout => "the other device stopped responding",
            ReasonCode::Busy => "the other device is busy, try again later",
            ReasonCode::PeerUnavailable => "the device is not available",
            ReasonCode::InvalidChunk => "a chunk did not match the file layout",
            ReasonCode::Unknown => "unknown error",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Transfer handshake: sender identity and file metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub name: String,
    pub file_size: u64,
    pub chunk_size: u32,
    pub checksum_algo: ChecksumAlgo,
    /// Sender-assigned session id; reused when a transfer is resumed on a new connection.
    pub session_id: [u8; 16],
    /// Sender's discovery identity (peer id in the receiver's registry).
    pub sender: String,
}

/// One chunk on the wire. `length` on the wire is `payload.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkData {
    pub index: u32,
    pub offset: u64,
    pub checksum: Vec<u8>,
    pub payload: Vec<u8>,
}

/// All wire message types. Framing: see the `wire` module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello(Hello),
    ChunkData(ChunkData),
    ChunkAck {
        index: u32,
        ok: bool,
        reason: ReasonCode,
    },
    Complete,
    Abort {
        reason: ReasonCode,
    },
}

impl Message {
    pub fn type_byte(&self) -> u8 {
        match self {
            Message::Hello(_) => TYPE_HELLO,
            Message::ChunkData(_) => TYPE_CHUNK_DATA,
            Message::ChunkAck { .. } => TYPE_CHUNK_ACK,
            Message::Complete => TYPE_COMPLETE,
            Message::Abort { .. } => TYPE_ABORT,
        }
    }

    pub fn ack(index: u32) -> Self {
        Message::ChunkAck {
            index,
            ok: true,
            reason: ReasonCode::None,
        }
    }

    pub fn nack(index: u32, reason: ReasonCode) -> Self {
        Message::ChunkAck {
            index,
            ok: false,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_roundtrip_and_unknown_is_lenient() {
        for code in [
            ReasonCode::None,
            ReasonCode::ChecksumMismatch,
            ReasonCode::Io,
            ReasonCode::Protocol,
            ReasonCode::Cancelled,
            ReasonCode::Timeout,
            ReasonCode::Busy,
            ReasonCode::PeerUnavailable,
            ReasonCode::InvalidChunk,
        ] {
            assert_eq!(ReasonCode::from_u8(code.as_u8()), code);
        }
        assert_eq!(ReasonCode::from_u8(42), ReasonCode::Unknown);
    }

    #[test]
    fn checksum_algo_by_digest_len() {
        assert_eq!(ChecksumAlgo::from_digest_len(32), Some(ChecksumAlgo::Sha256));
        assert_eq!(
            ChecksumAlgo::from_digest_len(16),
            Some(ChecksumAlgo::Sha256Trunc128)
        );
        assert_eq!(ChecksumAlgo::from_digest_len(20), None);
        assert_eq!(ChecksumAlgo::from_u8(9), None);
    }
}
