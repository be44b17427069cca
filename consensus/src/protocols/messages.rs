/// Consensus wire messages
///
/// Every signed message exposes canonical `signing_bytes()` (big-endian
/// fixed-width fields) and a `msg_hash()` used to de-duplicate gossip.

use crate::crypto::{DomainHasher, Hash, HashDomain, Signature};
use crate::types::{
    view_change_signing_bytes, vote_signing_bytes, Block, CertKind, QuorumCert, QuorumVote,
    ValidatorBitmap, ViewChangeQC, ViewChangeQuorumCert,
};
use serde::{Deserialize, Serialize};

/// Leader proposal for one block slot of a view
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareBlock {
    pub epoch: u64,
    pub view_number: u64,
    pub block: Block,
    pub block_index: u32,
    pub proposal_index: u32,
    /// QC of the parent when it was certified in an earlier view
    pub prepare_qc: Option<QuorumCert>,
    /// Justifies the first proposal after a view change
    pub view_change_qc: Option<ViewChangeQC>,
    pub signature: Signature,
}

impl PrepareBlock {
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(8 + 8 + 32 + 8 + 4 + 4);
        data.extend_from_slice(&self.epoch.to_be_bytes());
        data.extend_from_slice(&self.view_number.to_be_bytes());
        data.extend_from_slice(self.block.hash().as_bytes());
        data.extend_from_slice(&self.block.number.to_be_bytes());
        data.extend_from_slice(&self.block_index.to_be_bytes());
        data.extend_from_slice(&self.proposal_index.to_be_bytes());
        data
    }

    pub fn msg_hash(&self) -> Hash {
        tagged_hash(MessageKind::PrepareBlock, &self.signing_bytes(), self.proposal_index)
    }
}

/// A validator's vote for a proposed block
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareVote {
    pub epoch: u64,
    pub view_number: u64,
    pub block_hash: Hash,
    pub block_number: u64,
    pub block_index: u32,
    pub validator_index: u32,
    pub parent_qc: Option<QuorumCert>,
    pub signature: Signature,
}

impl PrepareVote {
    pub fn signing_bytes(&self) -> Vec<u8> {
        vote_signing_bytes(
            CertKind::Prepare,
            self.epoch,
            self.view_number,
            &self.block_hash,
            self.block_number,
            self.block_index,
        )
    }

    pub fn msg_hash(&self) -> Hash {
        tagged_hash(MessageKind::PrepareVote, &self.signing_bytes(), self.validator_index)
    }
}

impl QuorumVote for PrepareVote {
    type Cert = QuorumCert;

    fn validator_index(&self) -> u32 {
        self.validator_index
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn to_cert(&self, signature: Signature, validator_set: ValidatorBitmap) -> QuorumCert {
        QuorumCert {
            kind: CertKind::Prepare,
            epoch: self.epoch,
            view_number: self.view_number,
            block_hash: self.block_hash,
            block_number: self.block_number,
            block_index: self.block_index,
            signature,
            validator_set,
        }
    }
}

/// Vote that the locked block at `block_number` may be committed.
///
/// The identity fields repeat the locked block's own QC; the signature is
/// domain separated from prepare votes over the same fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreCommit {
    pub epoch: u64,
    pub view_number: u64,
    pub block_hash: Hash,
    pub block_number: u64,
    pub block_index: u32,
    pub validator_index: u32,
    pub signature: Signature,
}

impl PreCommit {
    pub fn signing_bytes(&self) -> Vec<u8> {
        vote_signing_bytes(
            CertKind::PreCommit,
            self.epoch,
            self.view_number,
            &self.block_hash,
            self.block_number,
            self.block_index,
        )
    }

    pub fn msg_hash(&self) -> Hash {
        tagged_hash(MessageKind::PreCommit, &self.signing_bytes(), self.validator_index)
    }
}

impl QuorumVote for PreCommit {
    type Cert = QuorumCert;

    fn validator_index(&self) -> u32 {
        self.validator_index
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn to_cert(&self, signature: Signature, validator_set: ValidatorBitmap) -> QuorumCert {
        QuorumCert {
            kind: CertKind::PreCommit,
            epoch: self.epoch,
            view_number: self.view_number,
            block_hash: self.block_hash,
            block_number: self.block_number,
            block_index: self.block_index,
            signature,
            validator_set,
        }
    }
}

/// Vote to abandon `(epoch, view_number)`, naming the sender's highest QC block
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChange {
    pub epoch: u64,
    pub view_number: u64,
    pub block_hash: Hash,
    pub block_number: u64,
    pub validator_index: u32,
    pub prepare_qc: Option<QuorumCert>,
    pub signature: Signature,
}

impl ViewChange {
    /// `(epoch, view)` of the QC backing the named block; zero without one
    pub fn block_epoch_view(&self) -> (u64, u64) {
        self.prepare_qc
            .as_ref()
            .map(|qc| (qc.epoch, qc.view_number))
            .unwrap_or((0, 0))
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        let (block_epoch, block_view) = self.block_epoch_view();
        view_change_signing_bytes(
            self.epoch,
            self.view_number,
            &self.block_hash,
            self.block_number,
            block_epoch,
            block_view,
        )
    }

    pub fn msg_hash(&self) -> Hash {
        tagged_hash(MessageKind::ViewChange, &self.signing_bytes(), self.validator_index)
    }
}

impl QuorumVote for ViewChange {
    type Cert = ViewChangeQuorumCert;

    fn validator_index(&self) -> u32 {
        self.validator_index
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn to_cert(&self, signature: Signature, validator_set: ValidatorBitmap) -> ViewChangeQuorumCert {
        let (block_epoch, block_view_number) = self.block_epoch_view();
        ViewChangeQuorumCert {
            epoch: self.epoch,
            view_number: self.view_number,
            block_hash: self.block_hash,
            block_number: self.block_number,
            block_epoch,
            block_view_number,
            signature,
            validator_set,
        }
    }
}

/// Handshake status exchanged when a peer connects
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusData {
    pub protocol_version: u32,
    pub qc_bn: u64,
    pub qc_block: Hash,
    pub lock_bn: u64,
    pub lock_block: Hash,
    pub cmt_bn: u64,
    pub cmt_block: Hash,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    PrepareBlock,
    PrepareVote,
    PreCommit,
    ViewChange,
    BlockQuorumCert,
    GetQCBlockList,
    QCBlockList,
}

fn tagged_hash(kind: MessageKind, body: &[u8], sender: u32) -> Hash {
    DomainHasher::new(HashDomain::Message)
        .update(&[kind as u8])
        .update_item(body)
        .update(&sender.to_be_bytes())
        .finalize()
}

/// Everything a consensus node sends to another
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    PrepareBlock(PrepareBlock),
    PrepareVote(PrepareVote),
    PreCommit(PreCommit),
    ViewChange(ViewChange),
    /// A freshly formed QC, broadcast so lagging validators need not
    /// collect the votes themselves
    BlockQuorumCert(QuorumCert),
    /// Request the certified blocks above `block_number`
    GetQCBlockList { block_hash: Hash, block_number: u64 },
    QCBlockList { blocks: Vec<Block>, qcs: Vec<QuorumCert> },
}

impl ConsensusMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ConsensusMessage::PrepareBlock(_) => MessageKind::PrepareBlock,
            ConsensusMessage::PrepareVote(_) => MessageKind::PrepareVote,
            ConsensusMessage::PreCommit(_) => MessageKind::PreCommit,
            ConsensusMessage::ViewChange(_) => MessageKind::ViewChange,
            ConsensusMessage::BlockQuorumCert(_) => MessageKind::BlockQuorumCert,
            ConsensusMessage::GetQCBlockList { .. } => MessageKind::GetQCBlockList,
            ConsensusMessage::QCBlockList { .. } => MessageKind::QCBlockList,
        }
    }

    pub fn msg_hash(&self) -> Hash {
        match self {
            ConsensusMessage::PrepareBlock(m) => m.msg_hash(),
            ConsensusMessage::PrepareVote(m) => m.msg_hash(),
            ConsensusMessage::PreCommit(m) => m.msg_hash(),
            ConsensusMessage::ViewChange(m) => m.msg_hash(),
            ConsensusMessage::BlockQuorumCert(qc) => {
                tagged_hash(self.kind(), &qc.signing_bytes(), qc.len() as u32)
            }
            ConsensusMessage::GetQCBlockList {
                block_hash,
                block_number,
            } => {
                let mut body = block_hash.as_bytes().to_vec();
                body.extend_from_slice(&block_number.to_be_bytes());
                tagged_hash(self.kind(), &body, 0)
            }
            ConsensusMessage::QCBlockList { blocks, .. } => {
                let mut body = Vec::with_capacity(blocks.len() * 32);
                for b in blocks {
                    body.extend_from_slice(b.hash().as_bytes());
                }
                tagged_hash(self.kind(), &body, 0)
            }
        }
    }

    /// Wire encoding
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_data;
    use crate::types::aggregate;

    fn vote(validator_index: u32) -> PrepareVote {
        PrepareVote {
            epoch: 1,
            view_number: 2,
            block_hash: hash_data(b"block"),
            block_number: 10,
            block_index: 1,
            validator_index,
            parent_qc: None,
            signature: Signature::default(),
        }
    }

    #[test]
    fn test_msg_hash_distinguishes_sender_and_kind() {
        let a = vote(0);
        let b = vote(1);
        assert_ne!(a.msg_hash(), b.msg_hash());
        assert_eq!(a.msg_hash(), vote(0).msg_hash());

        let pc = PreCommit {
            epoch: a.epoch,
            view_number: a.view_number,
            block_hash: a.block_hash,
            block_number: a.block_number,
            block_index: a.block_index,
            validator_index: 0,
            signature: Signature::default(),
        };
        assert_ne!(pc.signing_bytes(), a.signing_bytes());
        assert_ne!(pc.msg_hash(), a.msg_hash());
    }

    #[test]
    fn test_view_change_block_identity_from_qc() {
        let mut vc = ViewChange {
            epoch: 1,
            view_number: 4,
            block_hash: hash_data(b"b"),
            block_number: 3,
            validator_index: 0,
            prepare_qc: None,
            signature: Signature::default(),
        };
        assert_eq!(vc.block_epoch_view(), (0, 0));
        let without_qc = vc.signing_bytes();

        vc.prepare_qc = Some(QuorumCert {
            epoch: 1,
            view_number: 3,
            block_hash: vc.block_hash,
            block_number: 3,
            ..Default::default()
        });
        assert_eq!(vc.block_epoch_view(), (1, 3));
        assert_ne!(vc.signing_bytes(), without_qc);
    }

    #[test]
    fn test_prepare_votes_aggregate_into_qc() {
        let validators = crate::testing::TestValidators::new(4);
        let votes: Vec<PrepareVote> = (0..3)
            .map(|i| {
                let mut v = vote(i);
                v.signature = validators.signer(i).sign(&v.signing_bytes());
                v
            })
            .collect();
        let qc = aggregate(&votes, 4).unwrap();
        assert_eq!(qc.kind, CertKind::Prepare);
        assert_eq!(qc.block_index, 1);
        assert!(qc.verify(validators.pool()).is_ok());
    }

    #[test]
    fn test_message_wire_encoding() {
        let msg = ConsensusMessage::PrepareVote(vote(3));
        let bytes = msg.encode().unwrap();
        assert_eq!(ConsensusMessage::decode(&bytes).unwrap(), msg);
        assert!(ConsensusMessage::decode(&bytes[..bytes.len() / 2]).is_err());
    }
}
