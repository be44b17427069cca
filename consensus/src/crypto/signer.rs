/// Signing context owned by the node's startup sequence
///
/// The engine receives an `Arc<SigningContext>` at construction instead of
/// reaching for a process-wide key handle; dropping the last reference
/// drops the key.

use super::bls::{BLSPublicKey, BLSSecretKey, Signature};
use crate::types::NodeId;

pub struct SigningContext {
    node_id: NodeId,
    secret_key: BLSSecretKey,
    public_key: BLSPublicKey,
}

impl SigningContext {
    pub fn new(node_id: NodeId, secret_key: BLSSecretKey) -> Self {
        let public_key = secret_key.public_key();
        Self {
            node_id,
            secret_key,
            public_key,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn public_key(&self) -> &BLSPublicKey {
        &self.public_key
    }

    /// Sign canonical payload bytes
    pub fn sign(&self, payload: &[u8]) -> Signature {
        self.secret_key.sign(payload).into()
    }
}

impl std::fmt::Debug for SigningContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningContext")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::random_node_id;

    #[test]
    fn test_signature_verifies_with_context_key() {
        let ctx = SigningContext::new(random_node_id(), BLSSecretKey::generate());
        let sig = ctx.sign(b"prepare vote");
        let decoded = sig.decode().unwrap();
        assert!(decoded.verify(b"prepare vote", ctx.public_key()));
    }
}
