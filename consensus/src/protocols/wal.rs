/// Records persisted by the write-ahead log
///
/// `ChainState` is the node's durable high-water mark. `WalMessage` is the
/// closed set of journaled messages; each variant has a stable one-byte
/// tag so journals written by one build stay readable by the next.

use super::messages::{PreCommit, PrepareBlock, PrepareVote, ViewChange};
use crate::types::{Block, QuorumCert, ViewChangeQC};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const CONFIRMED_VIEW_CHANGE_MSG: u8 = 0x01;
pub const SEND_VIEW_CHANGE_MSG: u8 = 0x02;
pub const SEND_PREPARE_BLOCK_MSG: u8 = 0x03;
pub const SEND_PREPARE_VOTE_MSG: u8 = 0x04;
pub const SEND_PRE_COMMIT_MSG: u8 = 0x05;

#[derive(Error, Debug)]
pub enum WalRecordError {
    #[error("Unknown journal message tag {0:#04x}")]
    UnknownTag(u8),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// A block together with the QC certifying it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub block: Block,
    pub quorum_cert: QuorumCert,
}

impl State {
    pub fn new(block: Block, quorum_cert: QuorumCert) -> Self {
        Self { block, quorum_cert }
    }

    /// The QC certifies exactly this block
    pub fn valid_state(&self) -> bool {
        self.block.number == self.quorum_cert.block_number
            && self.block.hash() == self.quorum_cert.block_hash
    }

    pub fn equal_state(&self, other: &State) -> bool {
        self.quorum_cert.block_number == other.quorum_cert.block_number
            && self.quorum_cert.block_hash == other.quorum_cert.block_hash
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[number:{} hash:{} qc:{}@{}]",
            self.block.number,
            self.block.hash(),
            self.quorum_cert.block_number,
            self.quorum_cert.block_hash
        )
    }
}

/// Commit, lock and the certified blocks above the lock
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    pub commit: State,
    pub lock: State,
    pub qc: Vec<State>,
}

impl ChainState {
    pub fn valid_chain_state(&self) -> bool {
        !self.qc.is_empty() && self.commit.valid_state() && self.lock.valid_state()
    }
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[commit:{} lock:{}", self.commit, self.lock)?;
        if let Some(qc) = self.qc.first() {
            write!(f, " qc:{}", qc)?;
        }
        write!(f, "]")
    }
}

/// The view this node moved into, with the certificate that justified it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedViewChange {
    pub epoch: u64,
    pub view_number: u64,
    pub block: Block,
    pub qc: Option<QuorumCert>,
    pub view_change_qc: Option<ViewChangeQC>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendViewChange {
    pub view_change: ViewChange,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendPrepareBlock {
    pub prepare: PrepareBlock,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendPrepareVote {
    pub block: Block,
    pub vote: PrepareVote,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendPreCommit {
    pub block: Block,
    pub vote: PreCommit,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalMessage {
    ConfirmedViewChange(ConfirmedViewChange),
    SendViewChange(SendViewChange),
    SendPrepareBlock(SendPrepareBlock),
    SendPrepareVote(SendPrepareVote),
    SendPreCommit(SendPreCommit),
}

impl WalMessage {
    pub fn tag(&self) -> u8 {
        match self {
            WalMessage::ConfirmedViewChange(_) => CONFIRMED_VIEW_CHANGE_MSG,
            WalMessage::SendViewChange(_) => SEND_VIEW_CHANGE_MSG,
            WalMessage::SendPrepareBlock(_) => SEND_PREPARE_BLOCK_MSG,
            WalMessage::SendPrepareVote(_) => SEND_PREPARE_VOTE_MSG,
            WalMessage::SendPreCommit(_) => SEND_PRE_COMMIT_MSG,
        }
    }

    pub fn epoch(&self) -> u64 {
        match self {
            WalMessage::ConfirmedViewChange(m) => m.epoch,
            WalMessage::SendViewChange(m) => m.view_change.epoch,
            WalMessage::SendPrepareBlock(m) => m.prepare.epoch,
            WalMessage::SendPrepareVote(m) => m.vote.epoch,
            WalMessage::SendPreCommit(m) => m.vote.epoch,
        }
    }

    pub fn view_number(&self) -> u64 {
        match self {
            WalMessage::ConfirmedViewChange(m) => m.view_number,
            WalMessage::SendViewChange(m) => m.view_change.view_number,
            WalMessage::SendPrepareBlock(m) => m.prepare.view_number,
            WalMessage::SendPrepareVote(m) => m.vote.view_number,
            WalMessage::SendPreCommit(m) => m.vote.view_number,
        }
    }

    pub fn block_number(&self) -> u64 {
        match self {
            WalMessage::ConfirmedViewChange(m) => m.block.number,
            WalMessage::SendViewChange(m) => m.view_change.block_number,
            WalMessage::SendPrepareBlock(m) => m.prepare.block.number,
            WalMessage::SendPrepareVote(m) => m.vote.block_number,
            WalMessage::SendPreCommit(m) => m.vote.block_number,
        }
    }

    /// Payload without the tag
    pub fn encode_body(&self) -> Result<Vec<u8>, WalRecordError> {
        let body = match self {
            WalMessage::ConfirmedViewChange(m) => bincode::serialize(m)?,
            WalMessage::SendViewChange(m) => bincode::serialize(m)?,
            WalMessage::SendPrepareBlock(m) => bincode::serialize(m)?,
            WalMessage::SendPrepareVote(m) => bincode::serialize(m)?,
            WalMessage::SendPreCommit(m) => bincode::serialize(m)?,
        };
        Ok(body)
    }

    pub fn decode_body(tag: u8, body: &[u8]) -> Result<Self, WalRecordError> {
        let msg = match tag {
            CONFIRMED_VIEW_CHANGE_MSG => WalMessage::ConfirmedViewChange(bincode::deserialize(body)?),
            SEND_VIEW_CHANGE_MSG => WalMessage::SendViewChange(bincode::deserialize(body)?),
            SEND_PREPARE_BLOCK_MSG => WalMessage::SendPrepareBlock(bincode::deserialize(body)?),
            SEND_PREPARE_VOTE_MSG => WalMessage::SendPrepareVote(bincode::deserialize(body)?),
            SEND_PRE_COMMIT_MSG => WalMessage::SendPreCommit(bincode::deserialize(body)?),
            other => return Err(WalRecordError::UnknownTag(other)),
        };
        Ok(msg)
    }
}
