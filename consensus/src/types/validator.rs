/// Validator set boundary
///
/// Consensus reads the validator set as an indexed list: it resolves a
/// node identity to its index, asks how many validators are active at a
/// height, and looks up BLS public keys by index. Membership changes and
/// rotation policy live outside this crate.

use crate::crypto::BLSPublicKey;
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Node identity on the p2p network
pub type NodeId = PeerId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidatorError {
    #[error("Node {0} is not a validator")]
    NotValidator(NodeId),

    #[error("No validator at index {0}")]
    IndexOutOfRange(u32),
}

pub type Result<T> = std::result::Result<T, ValidatorError>;

/// One entry of the validator set
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidateNode {
    pub index: u32,
    pub address: Multiaddr,
    pub node_id: NodeId,
    pub bls_pub_key: BLSPublicKey,
}

/// Read-only view of the validator set
pub trait ValidatorPool: Send + Sync {
    fn index_by_node_id(&self, epoch: u64, node_id: &NodeId) -> Result<u32>;

    /// Number of validators responsible for `block_number`
    fn len(&self, block_number: u64) -> usize;

    fn node_by_index(&self, epoch: u64, index: u32) -> Result<ValidateNode>;

    fn public_key(&self, epoch: u64, index: u32) -> Result<BLSPublicKey> {
        self.node_by_index(epoch, index).map(|node| node.bls_pub_key)
    }

    fn is_validator(&self, epoch: u64, node_id: &NodeId) -> bool {
        self.index_by_node_id(epoch, node_id).is_ok()
    }
}

/// Fraction of the validator set a quorum must exceed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumFraction {
    pub numerator: u32,
    pub denominator: u32,
}

impl Default for QuorumFraction {
    fn default() -> Self {
        Self {
            numerator: 2,
            denominator: 3,
        }
    }
}

impl QuorumFraction {
    /// Smallest vote count strictly above `n * fraction` (2f+1 for 2/3)
    pub fn threshold(&self, n: usize) -> usize {
        if self.denominator == 0 {
            return n;
        }
        (n * self.numerator as usize / self.denominator as usize + 1).min(n.max(1))
    }
}

/// Validator set that does not change across epochs
#[derive(Clone, Debug, Default)]
pub struct StaticValidatorPool {
    nodes: Vec<ValidateNode>,
}

impl StaticValidatorPool {
    /// Build the pool; indices are reassigned to match list order
    pub fn new(nodes: Vec<ValidateNode>) -> Self {
        let nodes = nodes
            .into_iter()
            .enumerate()
            .map(|(i, mut node)| {
                node.index = i as u32;
                node
            })
            .collect();
        Self { nodes }
    }

    pub fn nodes(&self) -> &[ValidateNode] {
        &self.nodes
    }
}

impl ValidatorPool for StaticValidatorPool {
    fn index_by_node_id(&self, _epoch: u64, node_id: &NodeId) -> Result<u32> {
        self.nodes
            .iter()
            .find(|node| &node.node_id == node_id)
            .map(|node| node.index)
            .ok_or(ValidatorError::NotValidator(*node_id))
    }

    fn len(&self, _block_number: u64) -> usize {
        self.nodes.len()
    }

    fn node_by_index(&self, _epoch: u64, index: u32) -> Result<ValidateNode> {
        self.nodes
            .get(index as usize)
            .cloned()
            .ok_or(ValidatorError::IndexOutOfRange(index))
    }
}

/// Fresh random node identity
pub fn random_node_id() -> NodeId {
    PeerId::random()
}
