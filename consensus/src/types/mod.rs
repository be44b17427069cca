/// Core consensus data types
///
/// Blocks, validator bitmaps, quorum certificates and the validator-set
/// boundary shared by every other module.

pub mod bitmap;
pub mod block;
pub mod quorum;
pub mod validator;

pub use bitmap::ValidatorBitmap;
pub use block::Block;
pub use quorum::{
    aggregate, view_change_signing_bytes, vote_signing_bytes, CertKind, MaxBlock, QuorumCert,
    QuorumError, QuorumVote, ViewChangeQC, ViewChangeQuorumCert,
};
pub use validator::{
    random_node_id, NodeId, QuorumFraction, StaticValidatorPool, ValidateNode, ValidatorError,
    ValidatorPool,
};

pub use crate::crypto::Hash;
