/// Test data generators

use proptest::collection::vec;
use proptest::prelude::*;
use rand::Rng;

/// Generate random bytes
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}

/// Random 32-byte message, e.g. something to sign
pub fn random_message() -> Vec<u8> {
    random_bytes(32)
}

/// `count` random transactions of up to `max_len` bytes each
pub fn random_payload(count: usize, max_len: usize) -> Vec<Vec<u8>> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| random_bytes(rng.gen_range(1..=max_len.max(1))))
        .collect()
}

/// Block payloads with at most `max_txs` transactions of at most `max_len` bytes
pub fn payload_strategy(max_txs: usize, max_len: usize) -> impl Strategy<Value = Vec<Vec<u8>>> {
    vec(vec(any::<u8>(), 1..=max_len.max(1)), 0..=max_txs)
}

/// Distinct validator indices below `n`, e.g. the signers of a certificate
pub fn signer_strategy(n: u32) -> impl Strategy<Value = Vec<u32>> {
    proptest::sample::subsequence((0..n).collect::<Vec<_>>(), 0..=n as usize)
}
