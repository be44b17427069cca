/// Consensus Engine - wires every consensus component into one event loop
///
/// The engine owns:
/// - ViewState (per-view votes, proposals and the QC/Lock/Commit watermarks)
/// - BlockTree (certified, uncommitted blocks)
/// - the WAL (chain-state high-water mark and message journal)
/// - the view-change tracker
///
/// All of them are mutated only from `handle_message`, `on_view_timeout`
/// and `maybe_propose`, which the run loop calls one at a time. Peers talk
/// to the engine through the inbound queue; everything the engine sends
/// leaves through the outbound channel.
///
/// Commit rule: a QC for block B makes B the highest QC block, its parent
/// the lock and the lock's parent the commit. A quorum of `PreCommit`
/// votes on a locked block commits it directly.

pub mod config;
pub mod ledger;
pub mod router;

#[cfg(test)]
mod integration_tests;

pub use config::{init_logging, Config, ConfigError};
pub use ledger::{Ledger, MemoryLedger};
pub use router::{dispatch_outbound, pump_inbound};

use crate::blocktree::{BlockTree, BlockTreeError};
use crate::crypto::{Hash, Signature, SigningContext};
use crate::protocols::{
    ChainState, ConfirmedViewChange, ConsensusMessage, PreCommit, PrepareBlock, PrepareVote,
    SendPreCommit, SendPrepareBlock, SendPrepareVote, SendViewChange, State, ViewChange,
    WalMessage,
};
use crate::state::{StateError, ViewState};
use crate::types::{
    aggregate, Block, NodeId, QuorumCert, QuorumError, ValidatorError, ValidatorPool,
    ViewChangeQC,
};
use crate::viewchange::{
    gen_view_change_qc, verify_view_change, verify_view_change_qc, ViewChangeError,
    ViewChangeReason, ViewChangeTracker,
};
use crate::wal::{ViewChangeMessage, Wal, WalError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Consensus engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Not leader for view {0}")]
    NotLeader(u64),

    #[error("Message for epoch {got_epoch} view {got_view}, current epoch {epoch} view {view}")]
    WrongView {
        epoch: u64,
        view: u64,
        got_epoch: u64,
        got_view: u64,
    },

    #[error("View {0} is being abandoned")]
    ViewChanging(u64),

    #[error("Sender claims validator index {claimed}, actual {actual}")]
    SenderMismatch { claimed: u32, actual: u32 },

    #[error("Leader equivocated at block index {0}")]
    Equivocation(u32),

    #[error("Validator {0} voted twice at block index {1}")]
    DoubleVote(u32, u32),

    #[error("Expected block index {expected}, got {got}")]
    OutOfOrder { expected: u32, got: u32 },

    #[error("View already holds {0} blocks")]
    ViewFull(u32),

    #[error("Previous block of the view has no QC yet")]
    NotReady,

    #[error("Parent {hash} at height {number} unknown")]
    MissingParent { hash: Hash, number: u64 },

    #[error("Block {0} does not extend the locked block")]
    NotExtendingLock(u64),

    #[error("Block {number} below the view change recovery block {max}")]
    BelowMaxBlock { number: u64, max: u64 },

    #[error("State root mismatch for block {0}")]
    StateRootMismatch(u64),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Block tree error: {0}")]
    BlockTree(#[from] BlockTreeError),

    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    #[error("View change error: {0}")]
    ViewChange(#[from] ViewChangeError),

    #[error("Quorum error: {0}")]
    Quorum(#[from] QuorumError),

    #[error("Validator error: {0}")]
    Validator(#[from] ValidatorError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] anyhow::Error),
}

impl EngineError {
    /// Bad input from a peer, as opposed to a local failure
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            EngineError::SenderMismatch { .. }
                | EngineError::Equivocation(_)
                | EngineError::DoubleVote(..)
                | EngineError::NotExtendingLock(_)
                | EngineError::BelowMaxBlock { .. }
                | EngineError::StateRootMismatch(_)
                | EngineError::InvalidBlock(_)
                | EngineError::ViewChange(_)
                | EngineError::Quorum(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// A message handed to the engine by a peer connection
#[derive(Clone, Debug)]
pub struct Inbound {
    pub from: NodeId,
    pub msg: ConsensusMessage,
}

/// Something the engine wants sent
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Broadcast(ConsensusMessage),
    SendTo(NodeId, ConsensusMessage),
    /// Fetch certified blocks above `block_number` from a peer that has them
    Sync { block_hash: Hash, block_number: u64 },
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Main consensus engine
pub struct ConsensusEngine {
    config: Config,
    signer: Arc<SigningContext>,
    pool: Arc<dyn ValidatorPool>,
    ledger: Arc<dyn Ledger>,
    wal: Box<dyn Wal>,
    state: ViewState,
    tree: BlockTree,
    tracker: ViewChangeTracker,
    /// Height of the QC block that opened the current epoch
    epoch_start: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl ConsensusEngine {
    /// Build an engine rooted at the ledger's current block. Call `start`
    /// (or `run`) to recover from the WAL before feeding messages.
    pub fn new(
        config: Config,
        signer: Arc<SigningContext>,
        pool: Arc<dyn ValidatorPool>,
        ledger: Arc<dyn Ledger>,
        wal: Box<dyn Wal>,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        let root = ledger.current_block();
        let root_qc = QuorumCert {
            block_hash: root.hash(),
            block_number: root.number,
            ..Default::default()
        };
        let mut state = ViewState::new(root.clone(), config.timeout_policy());
        state.reset_view(config.epoch, 0, root.number);
        Self {
            epoch_start: root.number,
            tree: BlockTree::new(root, root_qc),
            state,
            tracker: ViewChangeTracker::new(0),
            config,
            signer,
            pool,
            ledger,
            wal,
            outbound,
        }
    }

    /// Recover from the WAL and arm the first view deadline
    pub fn start(&mut self) -> Result<()> {
        self.recover()?;
        let period = self.state.set_view_timer(self.tracker.consecutive_failures());
        info!(
            "Consensus started at epoch {} view {} {} (timeout {:?})",
            self.state.epoch(),
            self.state.view_number(),
            self.state.highest_block_string(),
            period
        );
        Ok(())
    }

    pub fn state(&self) -> &ViewState {
        &self.state
    }

    pub fn block_tree(&self) -> &BlockTree {
        &self.tree
    }

    pub fn tracker(&self) -> &ViewChangeTracker {
        &self.tracker
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn node_id(&self) -> &NodeId {
        self.signer.node_id()
    }

    /// Our index in the current validator set; `None` for observers
    pub fn validator_index(&self) -> Option<u32> {
        self.pool
            .index_by_node_id(self.state.epoch(), self.signer.node_id())
            .ok()
    }

    fn validator_count(&self) -> usize {
        self.pool.len(self.state.block_number())
    }

    fn threshold(&self) -> usize {
        self.config.quorum.threshold(self.validator_count())
    }

    pub fn leader_index(&self, view_number: u64) -> u32 {
        let n = self.validator_count().max(1) as u64;
        (view_number % n) as u32
    }

    pub fn is_leader(&self) -> bool {
        self.validator_index() == Some(self.leader_index(self.state.view_number()))
    }

    fn broadcast(&self, msg: ConsensusMessage) {
        if self.outbound.send(Outbound::Broadcast(msg)).is_err() {
            debug!("Outbound channel closed, dropping broadcast");
        }
    }

    fn send_to(&self, to: NodeId, msg: ConsensusMessage) {
        if self.outbound.send(Outbound::SendTo(to, msg)).is_err() {
            debug!("Outbound channel closed, dropping message to {}", to);
        }
    }

    fn request_sync(&self) {
        let block = self.state.highest_qc_block();
        let req = Outbound::Sync {
            block_hash: block.hash(),
            block_number: block.number,
        };
        if self.outbound.send(req).is_err() {
            debug!("Outbound channel closed, dropping sync request");
        }
    }

    fn check_view(&self, epoch: u64, view_number: u64) -> Result<()> {
        if epoch != self.state.epoch() || view_number != self.state.view_number() {
            return Err(EngineError::WrongView {
                epoch: self.state.epoch(),
                view: self.state.view_number(),
                got_epoch: epoch,
                got_view: view_number,
            });
        }
        Ok(())
    }

    /// Resolve `from` and make sure it owns the index it signs with
    fn check_sender(&self, epoch: u64, from: &NodeId, claimed: u32) -> Result<()> {
        let actual = self.pool.index_by_node_id(epoch, from)?;
        if actual != claimed {
            return Err(EngineError::SenderMismatch { claimed, actual });
        }
        Ok(())
    }

    fn verify_signed(&self, epoch: u64, index: u32, payload: &[u8], sig: &Signature) -> Result<()> {
        let key = self.pool.public_key(epoch, index)?;
        let sig = sig.decode().map_err(QuorumError::from)?;
        sig.verify_aggregate(payload, &[&key])
            .map_err(QuorumError::from)?;
        Ok(())
    }

    fn check_qc(&self, qc: &QuorumCert) -> Result<()> {
        qc.check_quorum(self.pool.as_ref(), self.config.quorum)?;
        qc.verify(self.pool.as_ref())?;
        Ok(())
    }

    fn block_qc(&self, block: &Block) -> Option<QuorumCert> {
        self.tree
            .find_block_and_qc(&block.hash(), block.number)
            .map(|(_, qc)| qc.clone())
    }

    /// Dispatch one peer message
    pub fn handle_message(&mut self, from: NodeId, msg: ConsensusMessage) -> Result<()> {
        match msg {
            ConsensusMessage::PrepareBlock(pb) => self.on_prepare_block(&from, pb),
            ConsensusMessage::PrepareVote(vote) => self.on_prepare_vote(&from, vote),
            ConsensusMessage::PreCommit(pc) => self.on_pre_commit(&from, pc),
            ConsensusMessage::ViewChange(vc) => self.on_view_change(&from, vc),
            ConsensusMessage::BlockQuorumCert(qc) => self.on_block_quorum_cert(qc),
            ConsensusMessage::GetQCBlockList {
                block_hash,
                block_number,
            } => {
                self.on_get_qc_block_list(from, &block_hash, block_number);
                Ok(())
            }
            ConsensusMessage::QCBlockList { blocks, qcs } => self.on_qc_block_list(blocks, qcs),
        }
    }

    // Proposals

    /// Propose the next block of the current view with `payload`
    pub fn propose(&mut self, payload: Vec<Vec<u8>>) -> Result<PrepareBlock> {
        let view = self.state.view_number();
        let proposer = self.validator_index().ok_or(EngineError::NotLeader(view))?;
        if proposer != self.leader_index(view) {
            return Err(EngineError::NotLeader(view));
        }
        if self.tracker.is_changing() {
            return Err(EngineError::ViewChanging(view));
        }

        let block_index = self.state.next_view_block_index();
        if block_index >= self.config.blocks_per_view {
            return Err(EngineError::ViewFull(block_index));
        }
        if block_index > 0 && self.state.view_qc_by_index(block_index - 1).is_none() {
            return Err(EngineError::NotReady);
        }
        if block_index == 0 {
            if let Some(max) = self.state.last_view_change_qc().map(|qc| qc.max_block()) {
                if self.state.highest_qc_block().number < max.block_number {
                    self.request_sync();
                    return Err(EngineError::NotReady);
                }
            }
        }

        let parent = self.state.highest_qc_block().clone();
        let mut block = Block::new(parent.number + 1, parent.hash(), now_millis(), payload);
        block.state_root = self.ledger.execute(&block)?;

        let prepare_qc = if block_index == 0 {
            self.block_qc(&parent).filter(|qc| !qc.signature.is_empty())
        } else {
            None
        };
        let view_change_qc = if block_index == 0 {
            self.state.last_view_change_qc().cloned()
        } else {
            None
        };

        let mut pb = PrepareBlock {
            epoch: self.state.epoch(),
            view_number: view,
            block,
            block_index,
            proposal_index: proposer,
            prepare_qc,
            view_change_qc,
            signature: Signature::default(),
        };
        pb.signature = self.signer.sign(&pb.signing_bytes());

        self.wal
            .write(&WalMessage::SendPrepareBlock(SendPrepareBlock {
                prepare: pb.clone(),
            }))?;
        info!(
            "Propose block {} ({}) index {} in view {}",
            pb.block.number,
            pb.block.hash(),
            block_index,
            view
        );
        self.broadcast(ConsensusMessage::PrepareBlock(pb.clone()));

        let me = *self.signer.node_id();
        self.on_prepare_block(&me, pb.clone())?;
        Ok(pb)
    }

    /// Propose when this node leads the view and the previous block of
    /// the view is certified. Returns the proposal, if any.
    pub fn maybe_propose(&mut self) -> Option<PrepareBlock> {
        if !self.is_leader() || self.tracker.is_changing() {
            return None;
        }
        let next = self.state.next_view_block_index();
        if next >= self.config.blocks_per_view {
            return None;
        }
        if next > 0 && self.state.view_qc_by_index(next - 1).is_none() {
            return None;
        }
        let payload = self.ledger.build_payload(self.state.highest_qc_block());
        match self.propose(payload) {
            Ok(pb) => Some(pb),
            Err(EngineError::NotReady) => None,
            Err(e) => {
                warn!("Failed to propose: {}", e);
                None
            }
        }
    }

    fn on_prepare_block(&mut self, from: &NodeId, pb: PrepareBlock) -> Result<()> {
        if pb.epoch == self.state.epoch() && pb.view_number > self.state.view_number() {
            self.catch_up(&pb)?;
        }
        self.check_view(pb.epoch, pb.view_number)?;
        let view = pb.view_number;
        if self.tracker.is_changing() {
            return Err(EngineError::ViewChanging(view));
        }

        let leader = self.leader_index(view);
        if pb.proposal_index != leader {
            return Err(EngineError::NotLeader(view));
        }
        self.check_sender(pb.epoch, from, pb.proposal_index)?;
        self.verify_signed(pb.epoch, pb.proposal_index, &pb.signing_bytes(), &pb.signature)?;

        let hash = pb.block.hash();
        if let Some(existing) = self.state.view_block_by_index(pb.block_index) {
            if existing.hash() == hash {
                return Ok(());
            }
            warn!(
                "Leader {} proposed two blocks at index {} of view {}",
                leader, pb.block_index, view
            );
            self.start_view_change(ViewChangeReason::Equivocation)?;
            return Err(EngineError::Equivocation(pb.block_index));
        }

        let expected = self.state.next_view_block_index();
        if pb.block_index != expected {
            return Err(EngineError::OutOfOrder {
                expected,
                got: pb.block_index,
            });
        }
        if pb.block_index >= self.config.blocks_per_view {
            return Err(EngineError::ViewFull(pb.block_index));
        }

        let parent = if pb.block_index == 0 {
            self.first_block_parent(&pb)?
        } else {
            self.state
                .view_block_by_index(pb.block_index - 1)
                .map(|vb| vb.block().clone())
                .ok_or(EngineError::MissingParent {
                    hash: pb.block.parent_hash,
                    number: pb.block.number.saturating_sub(1),
                })?
        };
        if !pb.block.extends_from(&parent) {
            return Err(EngineError::InvalidBlock(format!(
                "block {} does not extend {}",
                pb.block.number, parent.number
            )));
        }

        self.state.set_executing(pb.block_index, true);
        let executed = self.ledger.execute(&pb.block);
        self.state.set_executing(pb.block_index, false);
        if executed? != pb.block.state_root {
            return Err(EngineError::StateRootMismatch(pb.block.number));
        }

        debug!(
            "Accepted block {} ({}) index {} from leader {}",
            pb.block.number, hash, pb.block_index, leader
        );
        self.state.add_prepare_block(pb.clone());
        self.vote_for(&pb)?;
        self.try_form_qc(pb.block_index)
    }

    /// Parent of the first block in a view: must be certified, extend the
    /// lock, and reach the view change recovery block
    fn first_block_parent(&mut self, pb: &PrepareBlock) -> Result<Block> {
        let number = pb.block.number.saturating_sub(1);
        let parent_hash = pb.block.parent_hash;

        if let Some(vcqc) = &pb.view_change_qc {
            verify_view_change_qc(vcqc, self.pool.as_ref(), self.config.quorum)?;
            let max = vcqc.max_block();
            if number < max.block_number
                || (number == max.block_number && parent_hash != max.block_hash)
            {
                return Err(EngineError::BelowMaxBlock {
                    number,
                    max: max.block_number,
                });
            }
        }

        if let Some(qc) = &pb.prepare_qc {
            if qc.block_hash != parent_hash || qc.block_number != number {
                return Err(EngineError::InvalidBlock(
                    "prepare QC does not certify the parent".into(),
                ));
            }
            self.check_qc(qc)?;
        }

        let parent = match self.tree.find_block_and_qc(&parent_hash, number) {
            Some((block, _)) => block.clone(),
            None => {
                self.request_sync();
                return Err(EngineError::MissingParent {
                    hash: parent_hash,
                    number,
                });
            }
        };

        let lock_hash = self.state.highest_lock_block().hash();
        if !self.tree.is_descendant(&lock_hash, &parent_hash) {
            return Err(EngineError::NotExtendingLock(pb.block.number));
        }

        if let Some(qc) = &pb.prepare_qc {
            if parent.number > self.state.highest_qc_block().number {
                self.on_block_qc(parent.clone(), qc.clone())?;
            }
        }
        Ok(parent)
    }

    /// A proposal for a later view proves the view moved on without us
    fn catch_up(&mut self, pb: &PrepareBlock) -> Result<()> {
        let epoch = self.state.epoch();
        if let Some(vcqc) = &pb.view_change_qc {
            verify_view_change_qc(vcqc, self.pool.as_ref(), self.config.quorum)?;
            vcqc.equal_all(epoch, pb.view_number - 1)?;
            info!("Catching up to view {} by view change QC", pb.view_number);
            return self.enter_view(epoch, pb.view_number, Some(vcqc.clone()));
        }

        if let Some(qc) = &pb.prepare_qc {
            let closes_view = qc.epoch == epoch
                && qc.view_number == self.state.view_number()
                && qc.view_number + 1 == pb.view_number
                && qc.block_index + 1 >= self.config.blocks_per_view;
            if !closes_view {
                return Ok(());
            }
            self.check_qc(qc)?;
            let block = self
                .state
                .view_block_by_index(qc.block_index)
                .filter(|vb| vb.hash() == qc.block_hash)
                .map(|vb| vb.block().clone());
            match block {
                Some(block) => self.on_block_qc(block, qc.clone())?,
                None => self.request_sync(),
            }
        }
        Ok(())
    }

    // Votes

    fn vote_for(&mut self, pb: &PrepareBlock) -> Result<()> {
        let Some(index) = self.validator_index() else {
            return Ok(());
        };
        if self.state.had_send_prepare_vote().had(pb.block_index) {
            return Ok(());
        }

        let mut vote = PrepareVote {
            epoch: pb.epoch,
            view_number: pb.view_number,
            block_hash: pb.block.hash(),
            block_number: pb.block.number,
            block_index: pb.block_index,
            validator_index: index,
            parent_qc: pb.prepare_qc.clone(),
            signature: Signature::default(),
        };
        vote.signature = self.signer.sign(&vote.signing_bytes());

        self.wal.write(&WalMessage::SendPrepareVote(SendPrepareVote {
            block: pb.block.clone(),
            vote: vote.clone(),
        }))?;
        self.state.had_send_prepare_vote_mut().push(vote.clone());
        self.state.add_prepare_vote(index, vote.clone());
        self.broadcast(ConsensusMessage::PrepareVote(vote));
        Ok(())
    }

    fn on_prepare_vote(&mut self, from: &NodeId, vote: PrepareVote) -> Result<()> {
        self.check_view(vote.epoch, vote.view_number)?;
        self.check_sender(vote.epoch, from, vote.validator_index)?;
        self.verify_signed(
            vote.epoch,
            vote.validator_index,
            &vote.signing_bytes(),
            &vote.signature,
        )?;

        if let Some(existing) = self
            .state
            .find_prepare_vote(vote.block_index, vote.validator_index)
        {
            if existing.block_hash == vote.block_hash {
                return Ok(());
            }
            return Err(EngineError::DoubleVote(vote.validator_index, vote.block_index));
        }

        let index = vote.block_index;
        self.state.add_prepare_vote(vote.validator_index, vote);
        self.try_form_qc(index)
    }

    /// Aggregate the votes for the block at `block_index` once they reach
    /// the threshold
    fn try_form_qc(&mut self, block_index: u32) -> Result<()> {
        if self.state.view_qc_by_index(block_index).is_some() {
            return Ok(());
        }
        // QCs within a view form in index order
        if block_index > 0 && self.state.view_qc_by_index(block_index - 1).is_none() {
            return Ok(());
        }
        let Some(block) = self
            .state
            .view_block_by_index(block_index)
            .map(|vb| vb.block().clone())
        else {
            return Ok(());
        };

        let hash = block.hash();
        let votes: Vec<PrepareVote> = self
            .state
            .all_prepare_vote_by_index(block_index)
            .into_iter()
            .filter(|v| v.block_hash == hash)
            .cloned()
            .collect();
        let n = self.pool.len(block.number);
        if votes.len() < self.config.quorum.threshold(n) {
            return Ok(());
        }

        let Some(qc) = aggregate(&votes, n as u32) else {
            warn!("Failed to aggregate votes for block {}", block.number);
            return Ok(());
        };
        qc.check_quorum(self.pool.as_ref(), self.config.quorum)?;
        info!(
            "QC formed for block {} ({}) index {} with {} votes",
            block.number,
            hash,
            block_index,
            qc.len()
        );
        if self.is_leader() {
            self.broadcast(ConsensusMessage::BlockQuorumCert(qc.clone()));
        }
        self.on_block_qc(block, qc)
    }

    fn on_block_quorum_cert(&mut self, qc: QuorumCert) -> Result<()> {
        if qc.block_number <= self.tree.root().number || self.tree.find_by_hash(&qc.block_hash).is_some() {
            return Ok(());
        }
        self.check_qc(&qc)?;
        let block = if qc.epoch == self.state.epoch() && qc.view_number == self.state.view_number() {
            self.state
                .view_block_by_index(qc.block_index)
                .filter(|vb| vb.hash() == qc.block_hash)
                .map(|vb| vb.block().clone())
        } else {
            None
        };
        match block {
            Some(block) => self.on_block_qc(block, qc),
            None => {
                self.request_sync();
                Ok(())
            }
        }
    }

    /// Record a certified block and move the watermarks
    fn on_block_qc(&mut self, block: Block, qc: QuorumCert) -> Result<()> {
        if block.number <= self.tree.root().number {
            return Ok(());
        }
        let in_view = qc.epoch == self.state.epoch() && qc.view_number == self.state.view_number();
        if in_view {
            self.state.add_qc_block(block.clone(), qc.clone());
        }

        match self.tree.insert(block.clone(), qc.clone()) {
            Ok(()) => {}
            Err(BlockTreeError::DuplicateBlock(_)) => return Ok(()),
            Err(e @ BlockTreeError::OrphanBlock { .. }) => {
                self.request_sync();
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        }
        self.update_watermarks(&block)?;

        if in_view {
            if qc.block_index + 1 >= self.config.blocks_per_view {
                let (epoch, view) = self.next_epoch_view(block.number);
                self.enter_view(epoch, view, None)?;
            } else {
                self.try_form_qc(qc.block_index + 1)?;
            }
        }
        Ok(())
    }

    /// QC = `block`, Lock = its parent, Commit = the lock's parent. Fails
    /// without changing anything when the ordering would break.
    fn update_watermarks(&mut self, block: &Block) -> Result<()> {
        if block.number <= self.state.highest_qc_block().number {
            return Ok(());
        }
        let current_lock = self.state.highest_lock_block().clone();
        let current_commit = self.state.highest_commit_block().clone();
        let lock_hash = current_lock.hash();

        let lock = self
            .tree
            .find_by_hash(&block.parent_hash)
            .map(|n| n.block.clone())
            .filter(|l| {
                l.number > current_lock.number && self.tree.is_descendant(&lock_hash, &l.hash())
            });
        let (lock, commit) = match lock {
            Some(lock) => {
                let commit = self
                    .tree
                    .find_by_hash(&lock.parent_hash)
                    .map(|n| n.block.clone())
                    .filter(|c| c.number > current_commit.number)
                    .unwrap_or_else(|| current_commit.clone());
                (lock, commit)
            }
            None => (current_lock.clone(), current_commit.clone()),
        };

        let lock_advanced = lock.number > current_lock.number;
        let commit_advanced = commit.number > current_commit.number;
        self.state
            .set_watermarks(commit.clone(), lock.clone(), block.clone())?;
        debug!("Watermarks {}", self.state.highest_block_string());

        if commit_advanced {
            self.commit_to(&commit)?;
        } else {
            self.persist_chain_state()?;
        }
        if lock_advanced {
            self.send_pre_commit(&lock)?;
        }
        Ok(())
    }

    fn chain_state(&self) -> Result<ChainState> {
        let state_of = |block: &Block| -> Result<State> {
            let qc = self.block_qc(block).ok_or(EngineError::MissingParent {
                hash: block.hash(),
                number: block.number,
            })?;
            Ok(State::new(block.clone(), qc))
        };
        let lock = self.state.highest_lock_block();
        // every certified block between the lock and the highest QC
        let mut qc: Vec<State> = self
            .tree
            .branch(&self.state.highest_qc_block().hash())
            .into_iter()
            .filter(|n| n.number > lock.number)
            .map(|n| State::new(n.block.clone(), n.qc.clone()))
            .collect();
        if qc.is_empty() {
            qc.push(state_of(self.state.highest_qc_block())?);
        }
        Ok(ChainState {
            commit: state_of(self.state.highest_commit_block())?,
            lock: state_of(lock)?,
            qc,
        })
    }

    fn persist_chain_state(&self) -> Result<()> {
        let chain_state = self.chain_state()?;
        self.wal.update_chain_state(&chain_state)?;
        Ok(())
    }

    /// Finalize everything up to `commit`: WAL first, then the ledger,
    /// then drop abandoned forks from the tree
    fn commit_to(&mut self, commit: &Block) -> Result<()> {
        let hash = commit.hash();
        let path: Vec<(Block, QuorumCert)> = self
            .tree
            .branch(&hash)
            .into_iter()
            .map(|n| (n.block.clone(), n.qc.clone()))
            .collect();

        self.persist_chain_state()?;
        for (block, qc) in &path {
            self.ledger.commit(block, qc)?;
        }
        let ledger = Arc::clone(&self.ledger);
        let evicted = self
            .tree
            .prune(&hash, commit.number, |block| ledger.on_evicted(block))?;
        self.tracker.on_commit();
        info!(
            "Committed block {} ({}), {} blocks finalized, {} evicted",
            commit.number,
            hash,
            path.len(),
            evicted
        );
        Ok(())
    }

    // Pre-commit

    fn send_pre_commit(&mut self, lock: &Block) -> Result<()> {
        let Some(index) = self.validator_index() else {
            return Ok(());
        };
        let Some(qc) = self.block_qc(lock).filter(|qc| !qc.signature.is_empty()) else {
            return Ok(());
        };

        let mut pc = PreCommit {
            epoch: qc.epoch,
            view_number: qc.view_number,
            block_hash: qc.block_hash,
            block_number: qc.block_number,
            block_index: qc.block_index,
            validator_index: index,
            signature: Signature::default(),
        };
        pc.signature = self.signer.sign(&pc.signing_bytes());
        self.wal.write(&WalMessage::SendPreCommit(SendPreCommit {
            block: lock.clone(),
            vote: pc.clone(),
        }))?;
        self.state.add_pre_commit(index, pc.clone());
        self.broadcast(ConsensusMessage::PreCommit(pc));
        self.try_commit_by_pre_commit(lock.number)
    }

    fn on_pre_commit(&mut self, from: &NodeId, pc: PreCommit) -> Result<()> {
        if pc.block_number <= self.state.highest_commit_block().number {
            return Ok(());
        }
        self.check_sender(pc.epoch, from, pc.validator_index)?;
        self.verify_signed(pc.epoch, pc.validator_index, &pc.signing_bytes(), &pc.signature)?;

        let Some(qc) = self
            .tree
            .find_block_and_qc(&pc.block_hash, pc.block_number)
            .map(|(_, qc)| qc.clone())
        else {
            debug!("Pre-commit for unknown block {}", pc.block_number);
            self.state.add_pre_commit(pc.validator_index, pc);
            return Ok(());
        };
        if (qc.epoch, qc.view_number, qc.block_index) != (pc.epoch, pc.view_number, pc.block_index) {
            return Err(EngineError::InvalidBlock(
                "pre-commit does not match the block's QC".into(),
            ));
        }

        let number = pc.block_number;
        self.state.add_pre_commit(pc.validator_index, pc);
        self.try_commit_by_pre_commit(number)
    }

    /// A quorum of pre-commits on a block we have locked commits it
    fn try_commit_by_pre_commit(&mut self, number: u64) -> Result<()> {
        let lock = self.state.highest_lock_block().clone();
        if number <= self.state.highest_commit_block().number || number > lock.number {
            return Ok(());
        }

        let mut groups: HashMap<Hash, Vec<PreCommit>> = HashMap::new();
        for pc in self.state.all_pre_commit_by_number(number) {
            groups.entry(pc.block_hash).or_default().push(pc.clone());
        }
        let n = self.pool.len(number);
        let threshold = self.config.quorum.threshold(n);
        let Some((hash, votes)) = groups.into_iter().find(|(_, v)| v.len() >= threshold) else {
            return Ok(());
        };

        if !self.tree.is_descendant(&hash, &lock.hash()) {
            warn!("Pre-commit quorum for block {} off the locked branch", number);
            return Ok(());
        }
        let Some(block) = self.tree.find_by_hash(&hash).map(|n| n.block.clone()) else {
            return Ok(());
        };
        let Some(cert) = aggregate(&votes, n as u32) else {
            return Ok(());
        };
        cert.check_quorum(self.pool.as_ref(), self.config.quorum)?;

        info!("Pre-commit quorum reached for block {} ({})", number, hash);
        self.state.set_highest_commit_block(block.clone())?;
        self.commit_to(&block)
    }

    // View change

    /// The view deadline fired
    pub fn on_view_timeout(&mut self) -> Result<()> {
        if !self.state.is_deadline() {
            return Ok(());
        }
        warn!(
            "View {} of epoch {} timed out",
            self.state.view_number(),
            self.state.epoch()
        );
        self.start_view_change(ViewChangeReason::Timeout)
    }

    /// Abandon the current view and vote for the next one
    pub fn start_view_change(&mut self, reason: ViewChangeReason) -> Result<()> {
        let epoch = self.state.epoch();
        let view = self.state.view_number();
        let first = self.tracker.begin(view, reason);
        // retried with backoff until a certificate forms
        self.state
            .set_view_timer(self.tracker.consecutive_failures().saturating_add(1));

        let Some(index) = self.validator_index() else {
            return Ok(());
        };
        if !first {
            if let Some(vc) = self.state.view_change_by_index(index).cloned() {
                self.broadcast(ConsensusMessage::ViewChange(vc));
                return Ok(());
            }
        }

        let block = self.state.highest_qc_block().clone();
        let prepare_qc = self.block_qc(&block).filter(|qc| !qc.signature.is_empty());
        let mut vc = ViewChange {
            epoch,
            view_number: view,
            block_hash: block.hash(),
            block_number: block.number,
            validator_index: index,
            prepare_qc,
            signature: Signature::default(),
        };
        vc.signature = self.signer.sign(&vc.signing_bytes());

        self.wal.write(&WalMessage::SendViewChange(SendViewChange {
            view_change: vc.clone(),
        }))?;
        info!(
            "Send view change for view {} naming block {}",
            view, block.number
        );
        self.broadcast(ConsensusMessage::ViewChange(vc.clone()));
        self.accept_view_change(vc)
    }

    fn on_view_change(&mut self, from: &NodeId, vc: ViewChange) -> Result<()> {
        if vc.epoch == self.state.epoch() && vc.view_number < self.state.view_number() {
            return Ok(());
        }
        verify_view_change(
            &vc,
            from,
            self.state.epoch(),
            self.state.view_number(),
            self.state.highest_commit_block(),
            self.pool.as_ref(),
            self.config.quorum,
        )?;
        self.accept_view_change(vc)
    }

    fn accept_view_change(&mut self, vc: ViewChange) -> Result<()> {
        self.state.add_view_change(vc.validator_index, vc);

        let n = self.validator_count();
        let threshold = self.threshold();
        if self.state.view_change_len() < threshold {
            return Ok(());
        }
        let votes: Vec<ViewChange> = self.state.all_view_change().into_iter().cloned().collect();
        let Some(qc) = gen_view_change_qc(n as u32, &votes, threshold) else {
            return Ok(());
        };
        verify_view_change_qc(&qc, self.pool.as_ref(), self.config.quorum)?;

        let epoch = self.state.epoch();
        let next = self.state.view_number() + 1;
        self.enter_view(epoch, next, Some(qc))
    }

    /// Move into `(epoch, view)`. With a view change certificate the QC and
    /// lock may advance to its recovery block; the commit never moves here.
    fn enter_view(&mut self, epoch: u64, view: u64, qc: Option<ViewChangeQC>) -> Result<()> {
        if let Some(vcqc) = &qc {
            let max = vcqc.max_block();
            let lock_hash = self.state.highest_lock_block().hash();
            let known = self
                .tree
                .find_block_and_qc(&max.block_hash, max.block_number)
                .map(|(b, _)| b.clone())
                .filter(|b| self.tree.is_descendant(&lock_hash, &b.hash()));
            match known {
                Some(block) if block.number > self.state.highest_qc_block().number => {
                    self.state.set_highest_qc_block(block)?;
                }
                Some(_) => {}
                None if max.block_number > self.state.highest_qc_block().number => {
                    self.request_sync();
                }
                None => {}
            }
            self.wal.update_view_change_qc(
                self.state.epoch(),
                self.state.highest_qc_block().number,
                self.state.view_number(),
                vcqc,
            )?;
        }

        let block = self.state.highest_qc_block().clone();
        let block_qc = self.block_qc(&block);
        if epoch != self.state.epoch() {
            self.epoch_start = block.number;
        }
        self.state.reset_view(epoch, view, block.number);
        if let Some(vcqc) = qc.clone() {
            self.state.set_last_view_change_qc(vcqc);
        }

        self.wal
            .update_view_change(ViewChangeMessage::new(epoch, view, block.number))?;
        self.wal
            .write_sync(&WalMessage::ConfirmedViewChange(ConfirmedViewChange {
                epoch,
                view_number: view,
                block,
                qc: block_qc,
                view_change_qc: qc.clone(),
            }))?;

        match qc {
            Some(_) => self.tracker.complete(view),
            None => self.tracker.advance(view),
        }
        let period = self.state.set_view_timer(self.tracker.consecutive_failures());
        info!(
            "Entered epoch {} view {} {} (timeout {:?})",
            epoch,
            view,
            self.state.highest_block_string(),
            period
        );
        Ok(())
    }

    fn next_epoch_view(&self, qc_number: u64) -> (u64, u64) {
        if qc_number.saturating_sub(self.epoch_start) >= self.config.epoch_length {
            (self.state.epoch() + 1, 0)
        } else {
            (self.state.epoch(), self.state.view_number() + 1)
        }
    }

    // Sync

    fn on_get_qc_block_list(&self, from: NodeId, block_hash: &Hash, block_number: u64) {
        let top = self.state.highest_qc_block().hash();
        let mut blocks = Vec::new();
        let mut qcs = Vec::new();
        // the root is included so a peer behind our last commit can link up
        for node in std::iter::once(self.tree.root()).chain(self.tree.branch(&top)) {
            if node.number > block_number && !node.qc.signature.is_empty() {
                blocks.push(node.block.clone());
                qcs.push(node.qc.clone());
            }
        }
        if blocks.is_empty() {
            return;
        }
        debug!(
            "Serving {} QC blocks above {} ({}) to {}",
            blocks.len(),
            block_number,
            block_hash,
            from
        );
        self.send_to(from, ConsensusMessage::QCBlockList { blocks, qcs });
    }

    fn on_qc_block_list(&mut self, blocks: Vec<Block>, qcs: Vec<QuorumCert>) -> Result<()> {
        if blocks.len() != qcs.len() {
            return Err(EngineError::InvalidBlock("QC block list length mismatch".into()));
        }
        let mut pairs: Vec<(Block, QuorumCert)> = blocks.into_iter().zip(qcs).collect();
        pairs.sort_by_key(|(b, _)| b.number);

        for (block, qc) in pairs {
            if block.number <= self.tree.root().number
                || self.tree.find_by_hash(&block.hash()).is_some()
            {
                continue;
            }
            if qc.block_hash != block.hash() || qc.block_number != block.number {
                return Err(EngineError::InvalidBlock(format!(
                    "QC does not certify synced block {}",
                    block.number
                )));
            }
            self.check_qc(&qc)?;
            if self.ledger.execute(&block)? != block.state_root {
                return Err(EngineError::StateRootMismatch(block.number));
            }
            self.on_block_qc(block, qc)?;
        }
        Ok(())
    }

    // Recovery

    /// Rebuild the tree and watermarks from the persisted chain state, then
    /// replay what this node sent since its last confirmed view change
    pub fn recover(&mut self) -> Result<()> {
        let mut chain_state = None;
        self.wal.load_chain_state(&mut |cs| {
            chain_state = Some(cs.clone());
            Ok(())
        })?;
        if let Some(cs) = chain_state {
            self.restore_chain_state(cs)?;
        }

        let mut messages = Vec::new();
        self.wal.load(&mut |msg| {
            messages.push(msg);
            Ok(())
        })?;
        let replayed = messages.len();
        for msg in messages {
            self.replay(msg)?;
        }
        if replayed > 0 {
            info!(
                "Recovered epoch {} view {} after replaying {} messages",
                self.state.epoch(),
                self.state.view_number(),
                replayed
            );
        }
        Ok(())
    }

    fn restore_chain_state(&mut self, cs: ChainState) -> Result<()> {
        self.tree
            .reset_root(cs.commit.block.clone(), cs.commit.quorum_cert.clone());
        let mut certified = vec![cs.lock.clone()];
        certified.extend(cs.qc.iter().cloned());
        certified.sort_by_key(|s| s.block.number);
        for s in certified {
            if s.block.number <= cs.commit.block.number {
                continue;
            }
            if self.tree.find_by_hash(&s.block.hash()).is_some() {
                continue;
            }
            self.ledger.execute(&s.block)?;
            self.tree.insert(s.block, s.quorum_cert)?;
        }

        let qc_block = cs
            .qc
            .iter()
            .map(|s| &s.block)
            .max_by_key(|b| b.number)
            .cloned()
            .unwrap_or_else(|| cs.lock.block.clone());
        self.state
            .set_watermarks(cs.commit.block.clone(), cs.lock.block.clone(), qc_block)?;
        let view = self.state.view_number();
        self.state
            .reset_view(self.state.epoch(), view, self.state.highest_qc_block().number);
        info!("Restored chain state {}", cs);
        Ok(())
    }

    fn replay(&mut self, msg: WalMessage) -> Result<()> {
        let epoch = self.state.epoch();
        let view = self.state.view_number();
        match msg {
            WalMessage::ConfirmedViewChange(cvc) => {
                if cvc.epoch != epoch {
                    self.epoch_start = cvc.block.number;
                }
                self.state
                    .reset_view(cvc.epoch, cvc.view_number, cvc.block.number);
                if let Some(qc) = cvc.view_change_qc {
                    self.state.set_last_view_change_qc(qc);
                }
                self.tracker.advance(cvc.view_number);
            }
            WalMessage::SendViewChange(s) => {
                let vc = s.view_change;
                if vc.epoch == epoch && vc.view_number == view {
                    self.tracker.begin(view, ViewChangeReason::Timeout);
                    self.state.add_view_change(vc.validator_index, vc);
                }
            }
            WalMessage::SendPrepareBlock(s) => {
                let pb = s.prepare;
                if pb.epoch == epoch && pb.view_number == view {
                    match self.block_qc(&pb.block).filter(|qc| qc.view_number == view) {
                        Some(qc) => self.state.add_qc_block(pb.block, qc),
                        None => self.state.add_prepare_block(pb),
                    }
                }
            }
            WalMessage::SendPrepareVote(s) => {
                let vote = s.vote;
                if vote.epoch == epoch && vote.view_number == view {
                    self.state.had_send_prepare_vote_mut().push(vote.clone());
                    self.state.add_prepare_vote(vote.validator_index, vote);
                }
            }
            WalMessage::SendPreCommit(s) => {
                let pc = s.vote;
                if pc.block_number > self.state.highest_commit_block().number {
                    self.state.add_pre_commit(pc.validator_index, pc);
                }
            }
        }
        Ok(())
    }

    // Event loop

    /// Serve inbound messages and the view deadline until the inbound
    /// channel closes
    pub async fn run(&mut self, mut inbound: mpsc::Receiver<Inbound>) -> Result<()> {
        self.start()?;
        let mut propose = tokio::time::interval(Duration::from_millis(
            self.config.block_interval_ms.max(1),
        ));

        loop {
            let deadline = self.state.view_timeout();
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(Inbound { from, msg }) => {
                        let kind = msg.kind();
                        if let Err(e) = self.handle_message(from, msg) {
                            if e.is_protocol_violation() {
                                warn!("Rejected {:?} from {}: {}", kind, from, e);
                            } else {
                                debug!("Dropped {:?} from {}: {}", kind, from, e);
                            }
                        }
                    }
                    None => {
                        info!("Inbound channel closed, stopping consensus");
                        break;
                    }
                },
                _ = deadline => {
                    if let Err(e) = self.on_view_timeout() {
                        warn!("View change failed: {}", e);
                    }
                }
                _ = propose.tick() => {
                    self.maybe_propose();
                }
            }
        }

        self.state.cancel_view_timer();
        self.wal.close();
        Ok(())
    }
}
