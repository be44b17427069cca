/// Block structure
///
/// Blocks are produced by the ledger and referenced by consensus through
/// `(hash, number, parent_hash)`. A block is immutable once created.

use crate::crypto::{DomainHasher, Hash, HashDomain};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub number: u64,
    pub parent_hash: Hash,
    pub timestamp: u64,
    pub state_root: Hash,
    pub payload: Vec<Vec<u8>>,
    pub extra: Vec<u8>,
}

impl Block {
    pub fn new(number: u64, parent_hash: Hash, timestamp: u64, payload: Vec<Vec<u8>>) -> Self {
        Self {
            number,
            parent_hash,
            timestamp,
            state_root: Hash::zero(),
            payload,
            extra: Vec::new(),
        }
    }

    pub fn genesis() -> Self {
        Self::new(0, Hash::zero(), 0, vec![])
    }

    /// Block hash over the header fields and a digest of the payload
    pub fn hash(&self) -> Hash {
        DomainHasher::new(HashDomain::Block)
            .update_u64(self.number)
            .update(self.parent_hash.as_bytes())
            .update_u64(self.timestamp)
            .update(self.state_root.as_bytes())
            .update(self.payload_root().as_bytes())
            .update(&self.extra)
            .finalize()
    }

    fn payload_root(&self) -> Hash {
        let mut hasher = DomainHasher::new(HashDomain::Payload);
        for item in &self.payload {
            hasher.update_item(item);
        }
        hasher.finalize()
    }

    pub fn extends_from(&self, parent: &Block) -> bool {
        self.parent_hash == parent.hash() && self.number == parent.number + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_hash_consistency() {
        let block = Block::new(1, Hash::new([1u8; 32]), 10, vec![vec![1, 2, 3]]);
        assert_eq!(block.hash(), block.hash());

        let mut other = block.clone();
        other.payload = vec![vec![1, 2], vec![3]];
        assert_ne!(block.hash(), other.hash());
    }

    #[test]
    fn test_block_extends_from() {
        let genesis = Block::genesis();
        let child = Block::new(1, genesis.hash(), 1, vec![]);
        assert!(child.extends_from(&genesis));

        let skipped = Block::new(2, genesis.hash(), 1, vec![]);
        assert!(!skipped.extends_from(&genesis));
    }
}
