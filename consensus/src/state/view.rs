/// Per-view consensus state: the blocks proposed or certified in the view,
/// queued votes awaiting their block, and whether a block is executing

use crate::crypto::Hash;
use crate::protocols::{PreCommit, PrepareBlock, PrepareVote, ViewChange};
use crate::types::{Block, QuorumCert, ViewChangeQC};
use serde::Serialize;
use std::collections::BTreeMap;

/// A block slot of the current view, before or after it is certified
#[derive(Clone, Debug, Serialize)]
pub enum ViewBlock {
    Proposed(PrepareBlock),
    Certified { block: Block, qc: QuorumCert },
}

impl ViewBlock {
    pub fn block(&self) -> &Block {
        match self {
            ViewBlock::Proposed(pb) => &pb.block,
            ViewBlock::Certified { block, .. } => block,
        }
    }

    pub fn number(&self) -> u64 {
        self.block().number
    }

    pub fn hash(&self) -> Hash {
        self.block().hash()
    }

    pub fn prepare_block(&self) -> Option<&PrepareBlock> {
        match self {
            ViewBlock::Proposed(pb) => Some(pb),
            ViewBlock::Certified { .. } => None,
        }
    }
}

/// Prepare votes ordered by block index
#[derive(Clone, Debug, Default, Serialize)]
pub struct PrepareVoteQueue {
    votes: BTreeMap<u32, PrepareVote>,
}

impl PrepareVoteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, vote: PrepareVote) {
        self.votes.insert(vote.block_index, vote);
    }

    /// Vote with the lowest block index
    pub fn top(&self) -> Option<&PrepareVote> {
        self.votes.values().next()
    }

    pub fn pop(&mut self) -> Option<PrepareVote> {
        self.votes.pop_first().map(|(_, v)| v)
    }

    pub fn had(&self, block_index: u32) -> bool {
        self.votes.contains_key(&block_index)
    }

    pub fn remove(&mut self, block_index: u32) -> Option<PrepareVote> {
        self.votes.remove(&block_index)
    }

    pub fn peek(&self) -> Vec<&PrepareVote> {
        self.votes.values().collect()
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }
}

/// Execution of the block at `block_index`; `in_flight` while it runs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Executing {
    pub block_index: u32,
    pub in_flight: bool,
}

/// Everything seen and sent during one `(epoch, view)`
#[derive(Clone, Debug, Default, Serialize)]
pub struct View {
    pub(crate) epoch: u64,
    pub(crate) view_number: u64,
    /// Height of the highest QC block when the view started
    pub(crate) block_number: u64,
    pub(crate) executing: Executing,
    pub(crate) view_blocks: BTreeMap<u32, ViewBlock>,
    pub(crate) view_qcs: BTreeMap<u32, QuorumCert>,
    /// block index -> validator index -> vote
    pub(crate) view_votes: BTreeMap<u32, BTreeMap<u32, PrepareVote>>,
    /// block number -> validator index -> pre-commit
    pub(crate) pre_commits: BTreeMap<u64, BTreeMap<u32, PreCommit>>,
    pub(crate) view_changes: BTreeMap<u32, ViewChange>,
    pub(crate) last_view_change_qc: Option<ViewChangeQC>,
    pub(crate) had_send_prepare_vote: PrepareVoteQueue,
    pub(crate) pending_prepare_vote: PrepareVoteQueue,
}

impl View {
    pub fn new(epoch: u64, view_number: u64, block_number: u64) -> Self {
        Self {
            epoch,
            view_number,
            block_number,
            ..Default::default()
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn view_number(&self) -> u64 {
        self.view_number
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
