/// Shared fixtures for unit tests

use crate::crypto::{BLSSecretKey, SigningContext};
use crate::types::{random_node_id, StaticValidatorPool, ValidateNode};
use std::sync::Arc;

/// A validator set together with every member's signing context
pub struct TestValidators {
    pool: Arc<StaticValidatorPool>,
    signers: Vec<Arc<SigningContext>>,
}

impl TestValidators {
    pub fn new(n: usize) -> Self {
        let mut nodes = Vec::with_capacity(n);
        let mut signers = Vec::with_capacity(n);
        for i in 0..n {
            let ctx = Arc::new(SigningContext::new(random_node_id(), BLSSecretKey::generate()));
            nodes.push(ValidateNode {
                index: i as u32,
                address: format!("/ip4/127.0.0.1/tcp/{}", 16789 + i).parse().unwrap(),
                node_id: *ctx.node_id(),
                bls_pub_key: ctx.public_key().clone(),
            });
            signers.push(ctx);
        }
        Self {
            pool: Arc::new(StaticValidatorPool::new(nodes)),
            signers,
        }
    }

    pub fn pool(&self) -> &StaticValidatorPool {
        &self.pool
    }

    pub fn shared_pool(&self) -> Arc<StaticValidatorPool> {
        self.pool.clone()
    }

    pub fn signer(&self, index: u32) -> &Arc<SigningContext> {
        &self.signers[index as usize]
    }

    pub fn len(&self) -> usize {
        self.signers.len()
    }
}
