/// Cryptography module
///
/// Implements:
/// - BLS signatures with aggregation (constant-size quorum certificates)
/// - Domain-separated BLAKE3 hashing and journal checksums
/// - The signing context a node signs its consensus messages with

pub mod bls;
pub mod hash;
pub mod signer;

pub use bls::{BLSError, BLSKeyPair, BLSPublicKey, BLSSecretKey, BLSSignature, Signature};
pub use hash::{hash_data, record_checksum, DomainHasher, Hash, HashDomain};
pub use signer::SigningContext;
