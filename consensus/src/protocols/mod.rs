/// Consensus protocol messages and write-ahead log records

pub mod messages;
pub mod wal;

pub use messages::{
    ConsensusMessage, MessageKind, PreCommit, PrepareBlock, PrepareVote, StatusData, ViewChange,
};
pub use wal::{
    ChainState, ConfirmedViewChange, SendPreCommit, SendPrepareBlock, SendPrepareVote,
    SendViewChange, State, WalMessage, WalRecordError,
};
