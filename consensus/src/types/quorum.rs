/// Quorum certificates
///
/// A `QuorumCert` proves that a quorum of validators voted for one block
/// in one view. A `ViewChangeQC` proves that a quorum abandoned a view and
/// carries, per reported block, the highest QC its signers knew about.
///
/// Signature checks and quorum-size checks are separate steps: `verify`
/// only checks the aggregate signature against the signers in the bitmap,
/// `check_quorum` compares the signer count with the threshold.

use super::bitmap::ValidatorBitmap;
use super::validator::{QuorumFraction, ValidatorError, ValidatorPool};
use crate::crypto::{BLSError, BLSPublicKey, BLSSignature, Hash, Signature};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuorumError {
    #[error("Certificate has no signers")]
    NoSigners,

    #[error("Insufficient signers: have {have}, need {need}")]
    InsufficientSigners { have: usize, need: usize },

    #[error("Bitmap width {bitmap} does not match validator count {validators}")]
    BitmapSizeMismatch { bitmap: u32, validators: usize },

    #[error("Signer sets of view-change certificates overlap")]
    OverlappingSigners,

    #[error("View-change certificates disagree on epoch/view")]
    MixedViews,

    #[error("Validator lookup failed: {0}")]
    Validator(#[from] ValidatorError),

    #[error("Signature error: {0}")]
    Signature(#[from] BLSError),
}

pub type Result<T> = std::result::Result<T, QuorumError>;

/// A single signed vote that can be folded into a certificate
pub trait QuorumVote {
    type Cert;

    fn validator_index(&self) -> u32;

    fn signature(&self) -> &Signature;

    /// Certificate carrying this vote's payload with the given signers
    fn to_cert(&self, signature: Signature, validator_set: ValidatorBitmap) -> Self::Cert;
}

/// Aggregate votes that agree on their payload into one certificate.
///
/// Returns `None` for an empty vote set or when any signature fails to
/// decode; callers treat both as "not enough valid votes yet".
pub fn aggregate<'a, V, I>(votes: I, validator_count: u32) -> Option<V::Cert>
where
    V: QuorumVote + 'a,
    I: IntoIterator<Item = &'a V>,
{
    let mut bitmap = ValidatorBitmap::new(validator_count);
    let mut signatures = Vec::new();
    let mut payload: Option<&V> = None;

    for vote in votes {
        let sig = vote.signature().decode().ok()?;
        signatures.push(sig);
        bitmap.set(vote.validator_index(), true);
        payload.get_or_insert(vote);
    }

    let payload = payload?;
    let refs: Vec<&BLSSignature> = signatures.iter().collect();
    let combined = BLSSignature::aggregate(&refs).ok()?;
    Some(payload.to_cert(combined.into(), bitmap))
}

fn signer_keys(
    pool: &dyn ValidatorPool,
    epoch: u64,
    bitmap: &ValidatorBitmap,
) -> Result<Vec<BLSPublicKey>> {
    if bitmap.is_empty() {
        return Err(QuorumError::NoSigners);
    }
    bitmap
        .indices()
        .map(|i| pool.public_key(epoch, i).map_err(QuorumError::from))
        .collect()
}

fn verify_signature(
    pool: &dyn ValidatorPool,
    epoch: u64,
    bitmap: &ValidatorBitmap,
    signature: &Signature,
    message: &[u8],
) -> Result<()> {
    let keys = signer_keys(pool, epoch, bitmap)?;
    let refs: Vec<&BLSPublicKey> = keys.iter().collect();
    let sig = signature.decode()?;
    sig.verify_aggregate(message, &refs)?;
    Ok(())
}

fn check_signers(
    bitmap: &ValidatorBitmap,
    validators: usize,
    fraction: QuorumFraction,
) -> Result<()> {
    if bitmap.size() as usize != validators {
        return Err(QuorumError::BitmapSizeMismatch {
            bitmap: bitmap.size(),
            validators,
        });
    }
    let need = fraction.threshold(validators);
    let have = bitmap.popcount();
    if have < need {
        return Err(QuorumError::InsufficientSigners { have, need });
    }
    Ok(())
}

/// What a certificate attests to; pre-commit signatures are domain separated
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CertKind {
    #[default]
    Prepare,
    PreCommit,
}

const PRE_COMMIT_TAG: &[u8] = b"pre-commit";

/// Canonical bytes for `(epoch, view, hash, number, index)`
pub fn vote_signing_bytes(
    kind: CertKind,
    epoch: u64,
    view_number: u64,
    block_hash: &Hash,
    block_number: u64,
    block_index: u32,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(PRE_COMMIT_TAG.len() + 8 + 8 + 32 + 8 + 4);
    if kind == CertKind::PreCommit {
        data.extend_from_slice(PRE_COMMIT_TAG);
    }
    data.extend_from_slice(&epoch.to_be_bytes());
    data.extend_from_slice(&view_number.to_be_bytes());
    data.extend_from_slice(block_hash.as_bytes());
    data.extend_from_slice(&block_number.to_be_bytes());
    data.extend_from_slice(&block_index.to_be_bytes());
    data
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCert {
    pub kind: CertKind,
    pub epoch: u64,
    pub view_number: u64,
    pub block_hash: Hash,
    pub block_number: u64,
    pub block_index: u32,
    pub signature: Signature,
    pub validator_set: ValidatorBitmap,
}

impl QuorumCert {
    pub fn signing_bytes(&self) -> Vec<u8> {
        vote_signing_bytes(
            self.kind,
            self.epoch,
            self.view_number,
            &self.block_hash,
            self.block_number,
            self.block_index,
        )
    }

    /// Number of signers
    pub fn len(&self) -> usize {
        self.validator_set.popcount()
    }

    pub fn is_empty(&self) -> bool {
        self.validator_set.is_empty()
    }

    /// Whether this QC sorts after `(block_number, epoch, view_number)`
    pub fn higher_than(&self, block_number: u64, epoch: u64, view_number: u64) -> bool {
        (self.block_number, self.epoch, self.view_number) > (block_number, epoch, view_number)
    }

    pub fn cmp_height(&self, other: &QuorumCert) -> Ordering {
        (self.block_number, self.epoch, self.view_number).cmp(&(
            other.block_number,
            other.epoch,
            other.view_number,
        ))
    }

    /// Check the aggregate signature against the signers in the bitmap
    pub fn verify(&self, pool: &dyn ValidatorPool) -> Result<()> {
        verify_signature(
            pool,
            self.epoch,
            &self.validator_set,
            &self.signature,
            &self.signing_bytes(),
        )
    }

    /// Check the signer count against the quorum threshold at this height
    pub fn check_quorum(&self, pool: &dyn ValidatorPool, fraction: QuorumFraction) -> Result<()> {
        check_signers(&self.validator_set, pool.len(self.block_number), fraction)
    }
}

impl fmt::Debug for QuorumCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QC{{{:?} epoch:{} view:{} index:{} number:{} hash:{} signers:{:?}}}",
            self.kind,
            self.epoch,
            self.view_number,
            self.block_index,
            self.block_number,
            self.block_hash,
            self.validator_set
        )
    }
}

/// Canonical bytes of a view-change vote
pub fn view_change_signing_bytes(
    epoch: u64,
    view_number: u64,
    block_hash: &Hash,
    block_number: u64,
    block_epoch: u64,
    block_view_number: u64,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(8 * 5 + 32);
    data.extend_from_slice(&epoch.to_be_bytes());
    data.extend_from_slice(&view_number.to_be_bytes());
    data.extend_from_slice(block_hash.as_bytes());
    data.extend_from_slice(&block_number.to_be_bytes());
    data.extend_from_slice(&block_epoch.to_be_bytes());
    data.extend_from_slice(&block_view_number.to_be_bytes());
    data
}

/// Quorum attestation for one reported block during a view change
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChangeQuorumCert {
    pub epoch: u64,
    pub view_number: u64,
    pub block_hash: Hash,
    pub block_number: u64,
    pub block_epoch: u64,
    pub block_view_number: u64,
    pub signature: Signature,
    pub validator_set: ValidatorBitmap,
}

impl ViewChangeQuorumCert {
    pub fn signing_bytes(&self) -> Vec<u8> {
        view_change_signing_bytes(
            self.epoch,
            self.view_number,
            &self.block_hash,
            self.block_number,
            self.block_epoch,
            self.block_view_number,
        )
    }

    pub fn len(&self) -> usize {
        self.validator_set.popcount()
    }

    pub fn is_empty(&self) -> bool {
        self.validator_set.is_empty()
    }

    pub fn verify(&self, pool: &dyn ValidatorPool) -> Result<()> {
        verify_signature(
            pool,
            self.epoch,
            &self.validator_set,
            &self.signature,
            &self.signing_bytes(),
        )
    }

    fn block_key(&self) -> (u64, u64, u64) {
        (self.block_epoch, self.block_view_number, self.block_number)
    }
}

/// Identity of the block a view change recovers to
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MaxBlock {
    pub epoch: u64,
    pub view_number: u64,
    pub block_epoch: u64,
    pub block_view_number: u64,
    pub block_hash: Hash,
    pub block_number: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChangeQC {
    pub qcs: Vec<ViewChangeQuorumCert>,
}

impl ViewChangeQC {
    pub fn new(qcs: Vec<ViewChangeQuorumCert>) -> Self {
        Self { qcs }
    }

    pub fn append(&mut self, cert: ViewChangeQuorumCert) {
        self.qcs.push(cert);
    }

    /// Total signers across all certificates
    pub fn len(&self) -> usize {
        self.qcs.iter().map(|qc| qc.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.qcs.is_empty()
    }

    /// Highest reported block, ordered by `(block epoch, block view)` with
    /// the block number breaking ties inside a view. An empty set yields
    /// the zero block.
    pub fn max_block(&self) -> MaxBlock {
        self.qcs
            .iter()
            .max_by(|a, b| a.block_key().cmp(&b.block_key()))
            .map(|qc| MaxBlock {
                epoch: qc.epoch,
                view_number: qc.view_number,
                block_epoch: qc.block_epoch,
                block_view_number: qc.block_view_number,
                block_hash: qc.block_hash,
                block_number: qc.block_number,
            })
            .unwrap_or_default()
    }

    pub fn exist_view_change(&self, epoch: u64, view_number: u64, block_hash: &Hash) -> bool {
        self.qcs.iter().any(|qc| {
            qc.epoch == epoch && qc.view_number == view_number && &qc.block_hash == block_hash
        })
    }

    /// Every certificate belongs to `(epoch, view_number)`
    pub fn equal_all(&self, epoch: u64, view_number: u64) -> Result<()> {
        if self
            .qcs
            .iter()
            .all(|qc| qc.epoch == epoch && qc.view_number == view_number)
        {
            Ok(())
        } else {
            Err(QuorumError::MixedViews)
        }
    }

    /// Union of all signer sets
    pub fn validator_set(&self) -> ValidatorBitmap {
        self.qcs
            .iter()
            .fold(ValidatorBitmap::default(), |acc, qc| acc.union(&qc.validator_set))
    }

    /// Full validity check: consistent view, valid signatures, each
    /// validator counted once, and a quorum of distinct signers overall
    pub fn verify(&self, pool: &dyn ValidatorPool, fraction: QuorumFraction) -> Result<()> {
        let first = self.qcs.first().ok_or(QuorumError::NoSigners)?;
        self.equal_all(first.epoch, first.view_number)?;

        let mut seen = HashSet::new();
        for qc in &self.qcs {
            for index in qc.validator_set.indices() {
                if !seen.insert(index) {
                    return Err(QuorumError::OverlappingSigners);
                }
            }
            qc.verify(pool)?;
        }

        let validators = pool.len(self.max_block().block_number);
        for qc in &self.qcs {
            if qc.validator_set.size() as usize != validators {
                return Err(QuorumError::BitmapSizeMismatch {
                    bitmap: qc.validator_set.size(),
                    validators,
                });
            }
        }
        let need = fraction.threshold(validators);
        if seen.len() < need {
            return Err(QuorumError::InsufficientSigners {
                have: seen.len(),
                need,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_data;
    use crate::testing::TestValidators;

    struct TestVote {
        index: u32,
        hash: Hash,
        signature: Signature,
    }

    impl QuorumVote for TestVote {
        type Cert = QuorumCert;

        fn validator_index(&self) -> u32 {
            self.index
        }

        fn signature(&self) -> &Signature {
            &self.signature
        }

        fn to_cert(&self, signature: Signature, validator_set: ValidatorBitmap) -> QuorumCert {
            QuorumCert {
                kind: CertKind::Prepare,
                epoch: 1,
                view_number: 2,
                block_hash: self.hash,
                block_number: 5,
                block_index: 0,
                signature,
                validator_set,
            }
        }
    }

    fn votes(validators: &TestValidators, signers: &[u32], hash: Hash) -> Vec<TestVote> {
        let msg = vote_signing_bytes(CertKind::Prepare, 1, 2, &hash, 5, 0);
        signers
            .iter()
            .map(|&i| TestVote {
                index: i,
                hash,
                signature: validators.signer(i).sign(&msg),
            })
            .collect()
    }

    #[test]
    fn test_aggregate_then_verify() {
        let validators = TestValidators::new(4);
        let hash = hash_data(b"block 5");
        let qc = aggregate(&votes(&validators, &[0, 1, 3], hash), 4).unwrap();

        assert_eq!(qc.len(), 3);
        assert!(qc.validator_set.get(3));
        assert!(!qc.validator_set.get(2));
        assert_eq!(qc.verify(validators.pool()), Ok(()));
        assert_eq!(qc.check_quorum(validators.pool(), QuorumFraction::default()), Ok(()));
    }

    #[test]
    fn test_below_threshold_fails_size_check_only() {
        let validators = TestValidators::new(4);
        let hash = hash_data(b"block 5");
        let qc = aggregate(&votes(&validators, &[1, 2], hash), 4).unwrap();

        assert_eq!(qc.verify(validators.pool()), Ok(()));
        assert_eq!(
            qc.check_quorum(validators.pool(), QuorumFraction::default()),
            Err(QuorumError::InsufficientSigners { have: 2, need: 3 })
        );
    }

    #[test]
    fn test_cleared_bit_breaks_signature() {
        let validators = TestValidators::new(4);
        let mut qc = aggregate(&votes(&validators, &[0, 1, 2], hash_data(b"b")), 4).unwrap();
        qc.validator_set.set(2, false);
        assert!(matches!(
            qc.verify(validators.pool()),
            Err(QuorumError::Signature(BLSError::VerificationFailed))
        ));
        assert!(qc.check_quorum(validators.pool(), QuorumFraction::default()).is_err());
    }

    #[test]
    fn test_aggregate_empty_or_corrupt() {
        let validators = TestValidators::new(4);
        let none: Vec<TestVote> = vec![];
        assert!(aggregate(&none, 4).is_none());

        let mut bad = votes(&validators, &[0, 1, 2], hash_data(b"b"));
        bad[1].signature = Signature::from_bytes(vec![0u8; 10]);
        assert!(aggregate(&bad, 4).is_none());
    }

    #[test]
    fn test_pre_commit_domain_separated() {
        let validators = TestValidators::new(4);
        let mut qc = aggregate(&votes(&validators, &[0, 1, 2], hash_data(b"b")), 4).unwrap();
        qc.kind = CertKind::PreCommit;
        assert!(qc.verify(validators.pool()).is_err());
    }

    #[test]
    fn test_higher_quorum_cert() {
        let qc = QuorumCert {
            epoch: 1,
            view_number: 1,
            block_number: 2,
            validator_set: ValidatorBitmap::new(25),
            ..Default::default()
        };
        assert!(qc.higher_than(1, 1, 0));
        assert!(qc.higher_than(2, 1, 0));
        assert!(!qc.higher_than(2, 1, 1));
        assert!(!qc.higher_than(3, 0, 0));
    }

    fn cert(block_number: u64, block_epoch: u64, block_view: u64) -> ViewChangeQuorumCert {
        let mut validator_set = ValidatorBitmap::new(25);
        validator_set.set(0, true);
        ViewChangeQuorumCert {
            epoch: 2,
            view_number: 3,
            block_hash: hash_data(&[block_number as u8, block_epoch as u8, block_view as u8]),
            block_number,
            block_epoch,
            block_view_number: block_view,
            signature: Signature::from_bytes(vec![1u8; 96]),
            validator_set,
        }
    }

    #[test]
    fn test_view_change_qc_max_block() {
        let certs = vec![
            cert(9, 2, 1),
            cert(9, 2, 3),
            cert(10, 2, 1),
            cert(10, 2, 1),
            cert(10, 2, 2),
            cert(10, 1, 25),
        ];
        let qc = ViewChangeQC::new(certs.clone());
        let max = qc.max_block();
        assert_eq!(max.block_hash, certs[1].block_hash);
        assert_eq!(max.block_number, 9);
        assert_eq!((max.block_epoch, max.block_view_number), (2, 3));

        // Same view, the higher block wins
        let max = ViewChangeQC::new(vec![cert(9, 2, 2), cert(10, 2, 2)]).max_block();
        assert_eq!(max.block_number, 10);
        assert_eq!((max.epoch, max.view_number), (2, 3));

        assert_eq!(ViewChangeQC::default().max_block(), MaxBlock::default());
        assert_eq!(ViewChangeQC::default().max_block().epoch, 0);
    }

    #[test]
    fn test_view_change_qc_queries() {
        let mut qc = ViewChangeQC::default();
        let a = cert(9, 2, 2);
        let b = cert(9, 2, 3);
        qc.append(a.clone());
        qc.append(b.clone());
        assert!(qc.exist_view_change(2, 3, &b.block_hash));
        assert!(!qc.exist_view_change(2, 4, &b.block_hash));
        assert_eq!(qc.len(), 2);
        assert!(qc.equal_all(2, 3).is_ok());

        let mut other_view = cert(9, 2, 3);
        other_view.view_number = 4;
        qc.append(other_view);
        assert_eq!(qc.equal_all(2, 3), Err(QuorumError::MixedViews));
    }
}
