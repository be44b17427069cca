/// Hashing for block identity, gossip de-duplication and journal checksums
///
/// Consensus hashes are BLAKE3 in key-derivation mode, one context string
/// per `HashDomain`, so a block and a message over the same bytes never
/// share a hash. Opaque data (transactions, fixtures) goes through plain
/// `hash_data`. Journal records carry a truncated SHA-256 checksum.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

pub const HASH_SIZE: usize = 32;

/// Bytes of SHA-256 kept per journal record
pub const CHECKSUM_SIZE: usize = 4;

/// 32-byte digest
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    pub fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Parent of genesis and the placeholder for "no block"
    pub fn zero() -> Self {
        Self([0u8; HASH_SIZE])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_SIZE]
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// What a consensus hash identifies
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashDomain {
    /// Block header, the block's identity in the tree and in QCs
    Block,
    /// Digest of a block's transaction list
    Payload,
    /// Gossip identity of a consensus message
    Message,
    /// State root produced by executing a block
    State,
}

impl HashDomain {
    fn context(self) -> &'static str {
        match self {
            HashDomain::Block => "pbft-consensus 2024 block header",
            HashDomain::Payload => "pbft-consensus 2024 block payload",
            HashDomain::Message => "pbft-consensus 2024 consensus message",
            HashDomain::State => "pbft-consensus 2024 state root",
        }
    }
}

/// Incremental hasher bound to one domain
pub struct DomainHasher(blake3::Hasher);

impl DomainHasher {
    pub fn new(domain: HashDomain) -> Self {
        Self(blake3::Hasher::new_derive_key(domain.context()))
    }

    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(bytes);
        self
    }

    pub fn update_u64(&mut self, value: u64) -> &mut Self {
        self.update(&value.to_be_bytes())
    }

    /// Length-prefixed, so `["ab", "c"]` and `["a", "bc"]` differ
    pub fn update_item(&mut self, bytes: &[u8]) -> &mut Self {
        self.update_u64(bytes.len() as u64).update(bytes)
    }

    pub fn finalize(&self) -> Hash {
        Hash::new(*self.0.finalize().as_bytes())
    }
}

/// Plain BLAKE3 of opaque bytes
pub fn hash_data(data: &[u8]) -> Hash {
    Hash::new(*blake3::hash(data).as_bytes())
}

/// Leading bytes of SHA-256 over a journal record body
pub fn record_checksum(body: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let digest = Sha256::digest(body);
    let mut out = [0u8; CHECKSUM_SIZE];
    out.copy_from_slice(&digest[..CHECKSUM_SIZE]);
    out
}
