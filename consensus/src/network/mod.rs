// Peer-level consensus networking
//
// This module tracks what each connected peer has reached:
// - handshake status exchange on connect
// - per-peer QC/lock/commit watermarks used to pick sync targets
// - per-peer known message hashes used to suppress duplicate gossip
//
// The socket and the wire encoding are owned by the host and reach a peer
// through `MsgReadWriter`.

use crate::types::NodeId;

pub mod peer;
pub mod peer_set;
pub mod transport;

pub use peer::{KnownHashes, Peer, PeerInfo, HANDSHAKE_TIMEOUT, MAX_KNOWN_MESSAGE_HASH};
pub use peer_set::PeerSet;
pub use transport::{MsgPipe, MsgReadWriter, PeerMessage};

/// Consensus protocol version announced in the handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Network error types
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Failed to send message: {0}")]
    SendError(String),
    #[error("Failed to receive message: {0}")]
    ReceiveError(String),
    #[error("Handshake timed out")]
    ConnectionTimeout,
    #[error("Protocol version mismatch: local {local}, remote {remote}")]
    ProtocolVersionMismatch { local: u32, remote: u32 },
    #[error("Unexpected {0} message")]
    UnexpectedMessage(&'static str),
    #[error("Peer {0} is already registered")]
    AlreadyRegistered(NodeId),
    #[error("Peer {0} is not registered")]
    NotRegistered(NodeId),
    #[error("Peer set is closed")]
    Closed,
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;
