/// PBFT Consensus Core
///
/// This crate implements a pipelined, leader-based BFT protocol with:
/// - BLS aggregate signatures for quorum certificates
/// - Several blocks per view, each certified by its own QC
/// - QC / Lock / Commit watermarks with a three-chain commit rule, plus
///   direct commits from a quorum of pre-commit votes
/// - Timeout-driven view change carrying the highest certified block
/// - A write-ahead log for crash recovery
///
/// Transaction execution stays outside; the engine talks to it through
/// [`engine::Ledger`].

pub mod blocktree;
pub mod crypto;
pub mod engine;
pub mod network;
pub mod protocols;
pub mod state;
pub mod types;
pub mod viewchange;
pub mod wal;

#[cfg(test)]
pub(crate) mod testing;

pub use crypto::{BLSPublicKey, BLSSecretKey, BLSSignature, Hash, SigningContext};
pub use engine::{Config, ConsensusEngine, EngineError, Inbound, Ledger, Outbound};
pub use protocols::ConsensusMessage;
pub use types::{Block, NodeId, QuorumCert, ValidatorPool};
pub use wal::{new_wal, Wal};
