//! LanShare engine: LAN peer discovery and chunked, resumable file transfer.
//! Transport independent: hosts feed advertisements into `Discovery` and hand connected
//! byte streams to the `TransferManager`.

pub mod bitmap;
pub mod chunk;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod integrity;
pub mod manager;
pub mod protocol;
pub mod resume;
pub mod scheduler;
pub mod session;
pub mod wire;

pub use config::{ConfigError, EngineConfig};
pub use discovery::{Advertisement, Discovery, Peer, PeerKind, PeerState, RegistryEvent};
pub use engine::Engine;
pub use error::{DiscoveryError, EngineError, Result};
pub use manager::{FileDescriptor, FileMeta, SessionHandle, SessionOptions, TransferManager};
pub use protocol::{ChecksumAlgo, Message, ReasonCode, PROTOCOL_VERSION};
pub use session::{
    Direction, FailureReason, SessionId, SessionInfo, SessionStatus, TransferEvent,
};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError, ProtocolError};
