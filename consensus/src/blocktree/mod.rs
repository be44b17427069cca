/// Speculative block tree
///
/// Holds every block that has a QC but is not yet committed, rooted at
/// the last committed block. Nodes live in an arena keyed by block hash;
/// parent and child links are hash lookups, never owning pointers.
/// Conflicting blocks at the same height coexist until a commit prunes
/// every branch that does not descend from the new root.

use crate::crypto::Hash;
use crate::types::{Block, QuorumCert};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockTreeError {
    #[error("Block {0} already in tree")]
    DuplicateBlock(Hash),

    #[error("Parent {parent} of block {hash} not in tree")]
    OrphanBlock { hash: Hash, parent: Hash },

    #[error("Block {hash} at height {number} does not extend its parent at {parent_number}")]
    InvalidHeight {
        hash: Hash,
        number: u64,
        parent_number: u64,
    },

    #[error("QC for {qc_hash}@{qc_number} does not certify block {hash}@{number}")]
    QcMismatch {
        hash: Hash,
        number: u64,
        qc_hash: Hash,
        qc_number: u64,
    },

    #[error("Block {0} at height {1} not in tree")]
    UnknownBlock(Hash, u64),
}

pub type Result<T> = std::result::Result<T, BlockTreeError>;

#[derive(Clone, Debug, Serialize)]
pub struct BlockNode {
    #[serde(skip)]
    pub block: Block,
    pub hash: Hash,
    pub number: u64,
    pub parent_hash: Hash,
    pub qc: QuorumCert,
    pub children: Vec<Hash>,
}

impl BlockNode {
    fn new(block: Block, qc: QuorumCert) -> Self {
        Self {
            hash: block.hash(),
            number: block.number,
            parent_hash: block.parent_hash,
            block,
            qc,
            children: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct BlockTree {
    root: Hash,
    nodes: HashMap<Hash, BlockNode>,
}

impl BlockTree {
    /// Tree holding only `root`, the last committed block
    pub fn new(root: Block, qc: QuorumCert) -> Self {
        let node = BlockNode::new(root, qc);
        let root = node.hash;
        let mut nodes = HashMap::new();
        nodes.insert(root, node);
        Self { root, nodes }
    }

    pub fn root(&self) -> &BlockNode {
        // The root hash always refers to a node in the arena
        &self.nodes[&self.root]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// JSON dump of the tree for diagnostics, nodes ordered by height
    pub fn to_json(&self) -> serde_json::Result<String> {
        #[derive(Serialize)]
        struct Snapshot<'a> {
            root: &'a Hash,
            nodes: Vec<&'a BlockNode>,
        }
        let mut nodes: Vec<&BlockNode> = self.nodes.values().collect();
        nodes.sort_by_key(|n| n.number);
        serde_json::to_string(&Snapshot {
            root: &self.root,
            nodes,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Link a certified block under its parent
    pub fn insert(&mut self, block: Block, qc: QuorumCert) -> Result<()> {
        let hash = block.hash();
        if self.nodes.contains_key(&hash) {
            return Err(BlockTreeError::DuplicateBlock(hash));
        }
        if qc.block_hash != hash || qc.block_number != block.number {
            return Err(BlockTreeError::QcMismatch {
                hash,
                number: block.number,
                qc_hash: qc.block_hash,
                qc_number: qc.block_number,
            });
        }
        let parent = self
            .nodes
            .get_mut(&block.parent_hash)
            .ok_or(BlockTreeError::OrphanBlock {
                hash,
                parent: block.parent_hash,
            })?;
        if parent.number + 1 != block.number {
            return Err(BlockTreeError::InvalidHeight {
                hash,
                number: block.number,
                parent_number: parent.number,
            });
        }
        parent.children.push(hash);

        debug!("Inserted block {} at height {}", hash, block.number);
        self.nodes.insert(hash, BlockNode::new(block, qc));
        Ok(())
    }

    pub fn find_by_hash(&self, hash: &Hash) -> Option<&BlockNode> {
        self.nodes.get(hash)
    }

    pub fn find_block_and_qc(&self, hash: &Hash, number: u64) -> Option<(&Block, &QuorumCert)> {
        self.nodes
            .get(hash)
            .filter(|node| node.number == number)
            .map(|node| (&node.block, &node.qc))
    }

    /// All blocks at `number`, one per fork
    pub fn find_by_number(&self, number: u64) -> Vec<&BlockNode> {
        self.nodes.values().filter(|n| n.number == number).collect()
    }

    /// Whether `descendant` is `ancestor` or lies below it
    pub fn is_descendant(&self, ancestor: &Hash, descendant: &Hash) -> bool {
        let mut current = self.nodes.get(descendant);
        while let Some(node) = current {
            if &node.hash == ancestor {
                return true;
            }
            if node.hash == self.root {
                return false;
            }
            current = self.nodes.get(&node.parent_hash);
        }
        false
    }

    /// Blocks from just below the root down to `hash`, oldest first
    pub fn branch(&self, hash: &Hash) -> Vec<&BlockNode> {
        let mut branch = Vec::new();
        let mut current = self.nodes.get(hash);
        while let Some(node) = current {
            if node.hash == self.root {
                break;
            }
            branch.push(node);
            current = self.nodes.get(&node.parent_hash);
        }
        branch.reverse();
        branch
    }

    fn descendants(&self, hash: &Hash) -> HashSet<Hash> {
        let mut keep = HashSet::new();
        let mut queue = VecDeque::from([*hash]);
        while let Some(h) = queue.pop_front() {
            if let Some(node) = self.nodes.get(&h) {
                keep.insert(h);
                queue.extend(node.children.iter().copied());
            }
        }
        keep
    }

    /// Advance the root to the committed block `(hash, number)`.
    ///
    /// Ancestors of the new root are dropped as committed. Every other
    /// node that does not descend from it belongs to an abandoned fork
    /// and is handed to `on_evicted` exactly once. Returns the number of
    /// evicted blocks.
    pub fn prune<F>(&mut self, hash: &Hash, number: u64, mut on_evicted: F) -> Result<usize>
    where
        F: FnMut(&Block),
    {
        match self.nodes.get(hash) {
            Some(node) if node.number == number => {}
            _ => return Err(BlockTreeError::UnknownBlock(*hash, number)),
        }

        let keep = self.descendants(hash);
        let committed: HashSet<Hash> = {
            let mut path = HashSet::new();
            let mut current = self.nodes.get(hash).map(|n| n.parent_hash);
            while let Some(h) = current {
                match self.nodes.get(&h) {
                    Some(node) => {
                        path.insert(h);
                        current = Some(node.parent_hash);
                    }
                    None => current = None,
                }
            }
            path
        };

        let removed: Vec<Hash> = self
            .nodes
            .keys()
            .filter(|h| !keep.contains(*h))
            .copied()
            .collect();
        let mut evicted = 0;
        for h in removed {
            if let Some(node) = self.nodes.remove(&h) {
                if !committed.contains(&h) {
                    on_evicted(&node.block);
                    evicted += 1;
                }
            }
        }
        self.root = *hash;

        if evicted > 0 {
            warn!("Pruned {} blocks from abandoned forks below height {}", evicted, number);
        }
        debug!("Block tree root advanced to {} at height {}", hash, number);
        Ok(evicted)
    }

    /// Hard reset to `block`. Known descendants of `block` survive, the
    /// rest of the tree is dropped.
    pub fn reset_root(&mut self, block: Block, qc: QuorumCert) {
        let hash = block.hash();
        if self.nodes.contains_key(&hash) {
            let keep = self.descendants(&hash);
            self.nodes.retain(|h, _| keep.contains(h));
            if let Some(node) = self.nodes.get_mut(&hash) {
                node.qc = qc;
            }
        } else {
            self.nodes.clear();
            self.nodes.insert(hash, BlockNode::new(block, qc));
        }
        self.root = hash;
        debug!("Block tree reset to root {}", hash);
    }

    /// Hard reset to a block whose QC is already held by the tree or
    /// implied by the caller; keeps the existing QC when present
    pub fn new_root(&mut self, block: Block) {
        let hash = block.hash();
        let qc = self
            .nodes
            .get(&hash)
            .map(|n| n.qc.clone())
            .unwrap_or_else(|| QuorumCert {
                block_hash: hash,
                block_number: block.number,
                ..Default::default()
            });
        self.reset_root(block, qc);
    }
}
