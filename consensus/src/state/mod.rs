/// Per-view consensus state
///
/// `ViewState` is the single record of what this node has seen and sent
/// during the current view, plus the QC/Lock/Commit watermarks that
/// survive view changes. `reset_view` replaces the per-view data
/// wholesale; only the watermarks carry over.
///
/// Watermarks always satisfy `commit <= lock <= qc` by height. Setters
/// that would break the ordering fail without changing anything.

pub mod timer;
pub mod view;

pub use timer::{TimeoutPolicy, ViewTimer};
pub use view::{Executing, PrepareVoteQueue, View, ViewBlock};

use crate::protocols::{PreCommit, PrepareBlock, PrepareVote, ViewChange};
use crate::types::{Block, QuorumCert, ViewChangeQC};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Watermarks out of order: commit {commit}, lock {lock}, qc {qc}")]
    WatermarkOrder { commit: u64, lock: u64, qc: u64 },

    #[error("Commit would regress from {current} to {proposed}")]
    CommitRegression { current: u64, proposed: u64 },
}

pub type Result<T> = std::result::Result<T, StateError>;

#[derive(Debug)]
pub struct ViewState {
    view: View,
    highest_qc_block: Block,
    highest_lock_block: Block,
    highest_commit_block: Block,
    timer: ViewTimer,
    policy: TimeoutPolicy,
}

impl ViewState {
    /// Fresh state with every watermark at `root`
    pub fn new(root: Block, policy: TimeoutPolicy) -> Self {
        Self {
            view: View::new(0, 0, root.number),
            highest_qc_block: root.clone(),
            highest_lock_block: root.clone(),
            highest_commit_block: root,
            timer: ViewTimer::new(),
            policy,
        }
    }

    /// Discard the current view and start `(epoch, view_number)`
    pub fn reset_view(&mut self, epoch: u64, view_number: u64, block_number: u64) {
        self.timer.cancel();
        self.view = View::new(epoch, view_number, block_number);
        debug!(
            "Reset view: epoch {} view {} block {}",
            epoch, view_number, block_number
        );
    }

    pub fn epoch(&self) -> u64 {
        self.view.epoch
    }

    pub fn view_number(&self) -> u64 {
        self.view.view_number
    }

    pub fn block_number(&self) -> u64 {
        self.view.block_number
    }

    pub fn view(&self) -> &View {
        &self.view
    }

    // Execution

    pub fn set_executing(&mut self, block_index: u32, in_flight: bool) {
        self.view.executing = Executing {
            block_index,
            in_flight,
        };
    }

    pub fn executing(&self) -> Executing {
        self.view.executing
    }

    pub fn is_executing(&self) -> bool {
        self.view.executing.in_flight
    }

    // Blocks

    pub fn add_prepare_block(&mut self, pb: PrepareBlock) {
        self.view
            .view_blocks
            .insert(pb.block_index, ViewBlock::Proposed(pb));
    }

    pub fn add_qc_block(&mut self, block: Block, qc: QuorumCert) {
        let index = qc.block_index;
        self.view.view_qcs.insert(index, qc.clone());
        self.view
            .view_blocks
            .insert(index, ViewBlock::Certified { block, qc });
    }

    pub fn add_qc(&mut self, qc: QuorumCert) {
        self.view.view_qcs.insert(qc.block_index, qc);
    }

    pub fn view_block_by_index(&self, block_index: u32) -> Option<&ViewBlock> {
        self.view.view_blocks.get(&block_index)
    }

    pub fn prepare_block_by_index(&self, block_index: u32) -> Option<&PrepareBlock> {
        self.view_block_by_index(block_index)
            .and_then(|vb| vb.prepare_block())
    }

    pub fn view_qc_by_index(&self, block_index: u32) -> Option<&QuorumCert> {
        self.view.view_qcs.get(&block_index)
    }

    /// Block proposed at `number` in this view and its QC if formed.
    /// Unknown heights are `(None, None)`.
    pub fn view_block_and_qc(&self, number: u64) -> (Option<&Block>, Option<&QuorumCert>) {
        match self.view.view_blocks.iter().find(|(_, vb)| vb.number() == number) {
            Some((index, vb)) => (Some(vb.block()), self.view.view_qcs.get(index)),
            None => (None, None),
        }
    }

    pub fn view_block_size(&self) -> usize {
        self.view.view_blocks.len()
    }

    pub fn max_view_block_index(&self) -> Option<u32> {
        self.view.view_blocks.keys().next_back().copied()
    }

    pub fn next_view_block_index(&self) -> u32 {
        self.max_view_block_index().map_or(0, |i| i + 1)
    }

    /// Highest block index with a QC, `u32::MAX` when none
    pub fn max_qc_index(&self) -> u32 {
        self.view
            .view_qcs
            .keys()
            .next_back()
            .copied()
            .unwrap_or(u32::MAX)
    }

    // Prepare votes

    /// Record `vote` from `validator_index`; a later vote for the same
    /// block index replaces the earlier one
    pub fn add_prepare_vote(&mut self, validator_index: u32, vote: PrepareVote) {
        self.view
            .view_votes
            .entry(vote.block_index)
            .or_default()
            .insert(validator_index, vote);
    }

    pub fn find_prepare_vote(&self, block_index: u32, validator_index: u32) -> Option<&PrepareVote> {
        self.view
            .view_votes
            .get(&block_index)
            .and_then(|votes| votes.get(&validator_index))
    }

    pub fn all_prepare_vote_by_index(&self, block_index: u32) -> Vec<&PrepareVote> {
        self.view
            .view_votes
            .get(&block_index)
            .map(|votes| votes.values().collect())
            .unwrap_or_default()
    }

    pub fn prepare_vote_len_by_index(&self, block_index: u32) -> usize {
        self.view
            .view_votes
            .get(&block_index)
            .map_or(0, |votes| votes.len())
    }

    pub fn all_prepare_vote_by_number(&self, block_number: u64) -> Vec<&PrepareVote> {
        self.view
            .view_votes
            .values()
            .flat_map(|votes| votes.values())
            .filter(|v| v.block_number == block_number)
            .collect()
    }

    pub fn prepare_vote_len_by_number(&self, block_number: u64) -> usize {
        self.all_prepare_vote_by_number(block_number).len()
    }

    /// Total votes held this view
    pub fn view_vote_size(&self) -> usize {
        self.view.view_votes.values().map(|v| v.len()).sum()
    }

    /// Highest block index that has votes, `u32::MAX` when none
    pub fn max_view_vote_index(&self) -> u32 {
        self.view
            .view_votes
            .keys()
            .next_back()
            .copied()
            .unwrap_or(u32::MAX)
    }

    pub fn had_send_prepare_vote(&self) -> &PrepareVoteQueue {
        &self.view.had_send_prepare_vote
    }

    pub fn had_send_prepare_vote_mut(&mut self) -> &mut PrepareVoteQueue {
        &mut self.view.had_send_prepare_vote
    }

    pub fn pending_prepare_vote(&self) -> &PrepareVoteQueue {
        &self.view.pending_prepare_vote
    }

    pub fn pending_prepare_vote_mut(&mut self) -> &mut PrepareVoteQueue {
        &mut self.view.pending_prepare_vote
    }

    // Pre-commits

    pub fn add_pre_commit(&mut self, validator_index: u32, pc: PreCommit) {
        self.view
            .pre_commits
            .entry(pc.block_number)
            .or_default()
            .insert(validator_index, pc);
    }

    pub fn all_pre_commit_by_number(&self, block_number: u64) -> Vec<&PreCommit> {
        self.view
            .pre_commits
            .get(&block_number)
            .map(|pcs| pcs.values().collect())
            .unwrap_or_default()
    }

    pub fn pre_commit_len_by_number(&self, block_number: u64) -> usize {
        self.view
            .pre_commits
            .get(&block_number)
            .map_or(0, |pcs| pcs.len())
    }

    // View changes

    pub fn add_view_change(&mut self, validator_index: u32, vc: ViewChange) {
        self.view.view_changes.insert(validator_index, vc);
    }

    pub fn view_change_by_index(&self, validator_index: u32) -> Option<&ViewChange> {
        self.view.view_changes.get(&validator_index)
    }

    pub fn view_change_len(&self) -> usize {
        self.view.view_changes.len()
    }

    pub fn all_view_change(&self) -> Vec<&ViewChange> {
        self.view.view_changes.values().collect()
    }

    pub fn set_last_view_change_qc(&mut self, qc: ViewChangeQC) {
        self.view.last_view_change_qc = Some(qc);
    }

    pub fn last_view_change_qc(&self) -> Option<&ViewChangeQC> {
        self.view.last_view_change_qc.as_ref()
    }

    // Watermarks

    pub fn highest_qc_block(&self) -> &Block {
        &self.highest_qc_block
    }

    pub fn highest_lock_block(&self) -> &Block {
        &self.highest_lock_block
    }

    pub fn highest_commit_block(&self) -> &Block {
        &self.highest_commit_block
    }

    fn check_order(commit: &Block, lock: &Block, qc: &Block) -> Result<()> {
        if commit.number <= lock.number && lock.number <= qc.number {
            Ok(())
        } else {
            Err(StateError::WatermarkOrder {
                commit: commit.number,
                lock: lock.number,
                qc: qc.number,
            })
        }
    }

    pub fn set_highest_qc_block(&mut self, block: Block) -> Result<()> {
        Self::check_order(&self.highest_commit_block, &self.highest_lock_block, &block)?;
        self.highest_qc_block = block;
        Ok(())
    }

    pub fn set_highest_lock_block(&mut self, block: Block) -> Result<()> {
        Self::check_order(&self.highest_commit_block, &block, &self.highest_qc_block)?;
        self.highest_lock_block = block;
        Ok(())
    }

    pub fn set_highest_commit_block(&mut self, block: Block) -> Result<()> {
        if block.number < self.highest_commit_block.number {
            return Err(StateError::CommitRegression {
                current: self.highest_commit_block.number,
                proposed: block.number,
            });
        }
        Self::check_order(&block, &self.highest_lock_block, &self.highest_qc_block)?;
        self.highest_commit_block = block;
        Ok(())
    }

    /// Replace all three watermarks at once; fails atomically
    pub fn set_watermarks(&mut self, commit: Block, lock: Block, qc: Block) -> Result<()> {
        if commit.number < self.highest_commit_block.number {
            return Err(StateError::CommitRegression {
                current: self.highest_commit_block.number,
                proposed: commit.number,
            });
        }
        Self::check_order(&commit, &lock, &qc)?;
        self.highest_commit_block = commit;
        self.highest_lock_block = lock;
        self.highest_qc_block = qc;
        Ok(())
    }

    pub fn highest_block_string(&self) -> String {
        format!(
            "[qc:{}@{} lock:{}@{} commit:{}@{}]",
            self.highest_qc_block.number,
            self.highest_qc_block.hash(),
            self.highest_lock_block.number,
            self.highest_lock_block.hash(),
            self.highest_commit_block.number,
            self.highest_commit_block.hash()
        )
    }

    // Timer

    /// Arm the view deadline for a view reached after `consecutive_failures`
    /// view changes without a commit
    pub fn set_view_timer(&mut self, consecutive_failures: u32) -> Duration {
        let period = self.policy.period(consecutive_failures);
        self.timer.set(period);
        period
    }

    pub fn set_view_timer_period(&mut self, period: Duration) {
        self.timer.set(period);
    }

    pub fn view_timeout(&self) -> impl Future<Output = ()> + Send + 'static {
        self.timer.timeout()
    }

    pub fn is_deadline(&self) -> bool {
        self.timer.is_deadline()
    }

    pub fn cancel_view_timer(&mut self) {
        self.timer.cancel();
    }

    /// JSON snapshot of the view and watermarks for diagnostics
    pub fn to_json(&self) -> serde_json::Result<String> {
        #[derive(Serialize)]
        struct Snapshot<'a> {
            view: &'a View,
            highest_qc_block: u64,
            highest_lock_block: u64,
            highest_commit_block: u64,
        }
        serde_json::to_string(&Snapshot {
            view: &self.view,
            highest_qc_block: self.highest_qc_block.number,
            highest_lock_block: self.highest_lock_block.number,
            highest_commit_block: self.highest_commit_block.number,
        })
    }
}
