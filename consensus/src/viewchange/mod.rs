/// View-change protocol
///
/// When the leader of view N stalls or equivocates, every validator signs
/// a `ViewChange` naming its highest QC block. Votes are grouped by that
/// block and each group is aggregated into one `ViewChangeQuorumCert`;
/// together they form the `ViewChangeQC` that moves everyone to N+1.
/// The new leader must build on `ViewChangeQC::max_block()`.
///
/// A view-change vote is only admitted when the QC it carries verifies
/// and certifies exactly the block it names, so the block a vote reports
/// is always backed by a real quorum.

use crate::protocols::ViewChange;
use crate::types::{
    aggregate, Block, NodeId, QuorumError, QuorumFraction, ValidatorError, ValidatorPool,
    ViewChangeQC,
};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ViewChangeError {
    #[error("View change for epoch {got_epoch} view {got_view}, expected epoch {epoch} view {view}")]
    WrongView {
        epoch: u64,
        view: u64,
        got_epoch: u64,
        got_view: u64,
    },

    #[error("View change names block {0} without a QC for it")]
    MissingPrepareQC(u64),

    #[error("Carried QC certifies {qc_number} but vote names {block_number}")]
    PrepareQCMismatch { block_number: u64, qc_number: u64 },

    #[error("Sender {0} is not a validator")]
    UnknownSender(NodeId),

    #[error("Validator index {claimed} does not belong to sender (index {actual})")]
    IndexMismatch { claimed: u32, actual: u32 },

    #[error("Quorum check failed: {0}")]
    Quorum(#[from] QuorumError),

    #[error("Validator lookup failed: {0}")]
    Validator(#[from] ValidatorError),
}

pub type Result<T> = std::result::Result<T, ViewChangeError>;

/// Why a view is being abandoned
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewChangeReason {
    Timeout,
    Equivocation,
    LeaderFailure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewChangePhase {
    Normal { view: u64 },
    ViewChanging { view: u64, reason: ViewChangeReason },
}

/// Phase tracking plus the failure streak that drives timeout backoff
#[derive(Debug)]
pub struct ViewChangeTracker {
    phase: ViewChangePhase,
    consecutive_failures: u32,
}

impl ViewChangeTracker {
    pub fn new(view: u64) -> Self {
        Self {
            phase: ViewChangePhase::Normal { view },
            consecutive_failures: 0,
        }
    }

    pub fn phase(&self) -> ViewChangePhase {
        self.phase
    }

    pub fn is_changing(&self) -> bool {
        matches!(self.phase, ViewChangePhase::ViewChanging { .. })
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Enter `ViewChanging(view)`; false when already changing away from it
    pub fn begin(&mut self, view: u64, reason: ViewChangeReason) -> bool {
        match self.phase {
            ViewChangePhase::ViewChanging { view: v, .. } if v == view => false,
            _ => {
                info!("Abandoning view {}: {:?}", view, reason);
                self.phase = ViewChangePhase::ViewChanging { view, reason };
                true
            }
        }
    }

    /// A view-change certificate moved us into `new_view`
    pub fn complete(&mut self, new_view: u64) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.phase = ViewChangePhase::Normal { view: new_view };
    }

    /// Normal advance into `new_view` without a view change
    pub fn advance(&mut self, new_view: u64) {
        self.phase = ViewChangePhase::Normal { view: new_view };
    }

    /// Progress was made; drop the backoff
    pub fn on_commit(&mut self) {
        self.consecutive_failures = 0;
    }
}

/// Check a view-change vote before it is counted.
///
/// A vote without a QC is admitted only when it names genesis, our own
/// committed block, or a block below it. Such a vote reports no
/// `(block epoch, block view)` and never outranks a certified one.
pub fn verify_view_change(
    vc: &ViewChange,
    sender: &NodeId,
    epoch: u64,
    view_number: u64,
    committed: &Block,
    pool: &dyn ValidatorPool,
    fraction: QuorumFraction,
) -> Result<()> {
    if vc.epoch != epoch || vc.view_number != view_number {
        return Err(ViewChangeError::WrongView {
            epoch,
            view: view_number,
            got_epoch: vc.epoch,
            got_view: vc.view_number,
        });
    }

    let actual = pool
        .index_by_node_id(epoch, sender)
        .map_err(|_| ViewChangeError::UnknownSender(*sender))?;
    if actual != vc.validator_index {
        return Err(ViewChangeError::IndexMismatch {
            claimed: vc.validator_index,
            actual,
        });
    }

    let key = pool.public_key(epoch, vc.validator_index)?;
    let sig = vc.signature.decode().map_err(QuorumError::from)?;
    sig.verify_aggregate(&vc.signing_bytes(), &[&key])
        .map_err(QuorumError::from)?;

    match &vc.prepare_qc {
        Some(qc) => {
            if qc.block_number != vc.block_number || qc.block_hash != vc.block_hash {
                return Err(ViewChangeError::PrepareQCMismatch {
                    block_number: vc.block_number,
                    qc_number: qc.block_number,
                });
            }
            qc.check_quorum(pool, fraction)?;
            qc.verify(pool)?;
        }
        None if vc.block_number == 0 || vc.block_number < committed.number => {}
        None if vc.block_number == committed.number && vc.block_hash == committed.hash() => {}
        None => return Err(ViewChangeError::MissingPrepareQC(vc.block_number)),
    }
    Ok(())
}

/// Check a certificate received from another node
pub fn verify_view_change_qc(
    qc: &ViewChangeQC,
    pool: &dyn ValidatorPool,
    fraction: QuorumFraction,
) -> Result<()> {
    qc.verify(pool, fraction)?;
    Ok(())
}

/// Build a `ViewChangeQC` from collected votes.
///
/// Votes are grouped by the block they name and each group aggregated.
/// Groups with fewer than f+1 signers are dropped, smallest first and
/// among equal sizes lowest `(block epoch, block view, number)` first, as
/// long as the remaining signers still reach `threshold`; a minority can
/// then never contribute the recovery block unless its votes are needed
/// for the quorum itself. Returns `None` below threshold or when any
/// signature fails to decode.
pub fn gen_view_change_qc<'a, I>(
    validator_count: u32,
    votes: I,
    threshold: usize,
) -> Option<ViewChangeQC>
where
    I: IntoIterator<Item = &'a ViewChange>,
{
    let mut groups: HashMap<_, Vec<&ViewChange>> = HashMap::new();
    for vc in votes {
        groups.entry(vc.block_hash).or_default().push(vc);
    }

    let total: usize = groups.values().map(|g| g.len()).sum();
    if total < threshold {
        debug!("View change votes {} below threshold {}", total, threshold);
        return None;
    }

    let minority = (validator_count as usize).saturating_sub(threshold) + 1;
    let mut ordered: Vec<Vec<&ViewChange>> = groups.into_values().collect();
    let rank = |vc: &ViewChange| {
        let (epoch, view) = vc.block_epoch_view();
        (epoch, view, vc.block_number)
    };
    ordered.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| rank(a[0]).cmp(&rank(b[0]))));

    let mut remaining = total;
    let mut kept = Vec::with_capacity(ordered.len());
    for group in ordered {
        if group.len() < minority && remaining - group.len() >= threshold {
            warn!(
                "Dropping minority view change group for block {} ({} votes)",
                group[0].block_number,
                group.len()
            );
            remaining -= group.len();
            continue;
        }
        kept.push(group);
    }

    let mut qc = ViewChangeQC::default();
    for group in kept {
        qc.append(aggregate(group, validator_count)?);
    }
    // deterministic order for storage and comparison
    qc.qcs.sort_by(|a, b| {
        (a.block_number, a.block_epoch, a.block_view_number)
            .cmp(&(b.block_number, b.block_epoch, b.block_view_number))
            .then_with(|| a.block_hash.cmp(&b.block_hash))
    });
    Some(qc)
}
