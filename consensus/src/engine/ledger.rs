// Ledger boundary
//
// Consensus never executes transactions itself. It asks the ledger for a
// state root when a block arrives, hands over committed blocks, and
// reports blocks dropped with an abandoned fork.

use crate::crypto::{hash_data, DomainHasher, Hash, HashDomain};
use crate::types::{Block, QuorumCert};
use anyhow::{anyhow, bail};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::debug;

pub trait Ledger: Send + Sync {
    /// Execute `block` on top of its parent and return the resulting state
    /// root. `block.state_root` is ignored.
    fn execute(&self, block: &Block) -> anyhow::Result<Hash>;

    /// Persist a finalized block
    fn commit(&self, block: &Block, qc: &QuorumCert) -> anyhow::Result<()>;

    /// A speculative block was pruned with its fork
    fn on_evicted(&self, block: &Block);

    fn block_by_hash(&self, hash: &Hash) -> Option<Block>;

    fn block_by_number(&self, number: u64) -> Option<Block>;

    /// Highest committed block
    fn current_block(&self) -> Block;

    /// Payload for the next block a leader proposes on `parent`
    fn build_payload(&self, parent: &Block) -> Vec<Vec<u8>>;
}

#[derive(Default)]
struct Inner {
    roots: HashMap<Hash, Hash>,
    committed: BTreeMap<u64, (Block, QuorumCert)>,
    by_hash: HashMap<Hash, u64>,
    evicted: Vec<Hash>,
    pending: VecDeque<Vec<u8>>,
}

/// In-memory ledger; the state root folds each payload into the parent's
pub struct MemoryLedger {
    inner: RwLock<Inner>,
    max_payload: usize,
}

impl MemoryLedger {
    pub fn new(genesis: Block) -> Self {
        let mut inner = Inner::default();
        let hash = genesis.hash();
        inner.roots.insert(hash, genesis.state_root);
        inner.by_hash.insert(hash, genesis.number);
        let qc = QuorumCert {
            block_hash: hash,
            block_number: genesis.number,
            ..Default::default()
        };
        inner.committed.insert(genesis.number, (genesis, qc));
        Self {
            inner: RwLock::new(inner),
            max_payload: 256,
        }
    }

    /// Queue a transaction for the next proposal
    pub fn push_transaction(&self, tx: Vec<u8>) {
        self.inner.write().pending.push_back(tx);
    }

    pub fn committed_numbers(&self) -> Vec<u64> {
        self.inner.read().committed.keys().copied().collect()
    }

    pub fn evicted(&self) -> Vec<Hash> {
        self.inner.read().evicted.clone()
    }

    fn state_root(parent_root: &Hash, block: &Block) -> Hash {
        let mut hasher = DomainHasher::new(HashDomain::State);
        hasher.update(parent_root.as_bytes()).update_u64(block.number);
        for tx in &block.payload {
            hasher.update(hash_data(tx).as_bytes());
        }
        hasher.finalize()
    }
}

impl Ledger for MemoryLedger {
    fn execute(&self, block: &Block) -> anyhow::Result<Hash> {
        let mut inner = self.inner.write();
        let parent_root = *inner
            .roots
            .get(&block.parent_hash)
            .ok_or_else(|| anyhow!("parent {} of block {} not executed", block.parent_hash, block.number))?;
        let root = Self::state_root(&parent_root, block);
        inner.roots.insert(block.hash(), root);
        Ok(root)
    }

    fn commit(&self, block: &Block, qc: &QuorumCert) -> anyhow::Result<()> {
        let mut inner = self.inner.write();
        let hash = block.hash();
        if let Some((existing, _)) = inner.committed.get(&block.number) {
            if existing.hash() == hash {
                return Ok(());
            }
            bail!("conflicting commit at height {}", block.number);
        }
        let sent: std::collections::HashSet<_> = block.payload.iter().collect();
        inner.pending.retain(|tx| !sent.contains(tx));
        inner.by_hash.insert(hash, block.number);
        inner.committed.insert(block.number, (block.clone(), qc.clone()));
        debug!("Ledger committed block {} ({})", block.number, hash);
        Ok(())
    }

    fn on_evicted(&self, block: &Block) {
        let mut inner = self.inner.write();
        let hash = block.hash();
        inner.roots.remove(&hash);
        inner.evicted.push(hash);
    }

    fn block_by_hash(&self, hash: &Hash) -> Option<Block> {
        let inner = self.inner.read();
        let number = inner.by_hash.get(hash)?;
        inner.committed.get(number).map(|(b, _)| b.clone())
    }

    fn block_by_number(&self, number: u64) -> Option<Block> {
        self.inner.read().committed.get(&number).map(|(b, _)| b.clone())
    }

    fn current_block(&self) -> Block {
        let inner = self.inner.read();
        inner
            .committed
            .values()
            .next_back()
            .map(|(b, _)| b.clone())
            .unwrap_or_else(Block::genesis)
    }

    fn build_payload(&self, _parent: &Block) -> Vec<Vec<u8>> {
        let inner = self.inner.read();
        inner.pending.iter().take(self.max_payload).cloned().collect()
    }
}
