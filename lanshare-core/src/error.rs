//! Engine-level errors returned across the API boundary.

use crate::chunk::LayoutError;
use crate::config::ConfigError;
use crate::protocol::ReasonCode;
use crate::session::{SessionId, SessionStatus};
use crate::wire::{FrameEncodeError, ProtocolError};

/// Malformed advertisement. Dropped and logged by the registry.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("advertisement {0:?} has no address")]
    MissingAddress(String),
    #[error("advertisement has no identity")]
    MissingIdentity,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("peer {0} is unknown or offline")]
    PeerUnavailable(String),
    #[error("no transfer slot available")]
    CapacityExceeded,
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("cannot {action} a session that is {from}")]
    InvalidTransition {
        from: SessionStatus,
        action: &'static str,
    },
    #[error("session {0} has no connection attached")]
    NotAttached(SessionId),
    #[error("session {0} transfers in the other direction")]
    WrongDirection(SessionId),
    #[error("chunk {index} failed verification")]
    ChecksumMismatch { index: u32 },
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("invalid chunk layout: {0}")]
    Layout(#[from] LayoutError),
    #[error("cannot encode frame: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("peer aborted the transfer: {0}")]
    PeerAborted(ReasonCode),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Reason code to put on the wire or attach to a failed session.
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            EngineError::PeerUnavailable(_) => ReasonCode::PeerUnavailable,
            EngineError::CapacityExceeded => ReasonCode::Busy,
            EngineError::ChecksumMismatch { .. }
            | EngineError::Protocol(ProtocolError::ChecksumMismatch { .. }) => {
                ReasonCode::ChecksumMismatch
            }
            EngineError::Protocol(_) | EngineError::Layout(_) | EngineError::Encode(_) => {
                ReasonCode::Protocol
            }
            EngineError::PeerAborted(code) => *code,
            EngineError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => ReasonCode::Timeout,
            EngineError::Io(_) => ReasonCode::Io,
            EngineError::SessionNotFound(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::NotAttached(_)
            | EngineError::WrongDirection(_)
            | EngineError::Config(_) => ReasonCode::Unknown,
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
