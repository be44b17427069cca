// A connected consensus peer
//
// The watermarks are plain atomics: they are written by the connection's
// receive path and read by the engine when it picks sync targets.

use super::transport::{MsgReadWriter, PeerMessage};
use super::{NetworkError, NetworkResult};
use crate::crypto::Hash;
use crate::protocols::{ConsensusMessage, StatusData};
use crate::types::NodeId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Known message hashes remembered per peer
pub const MAX_KNOWN_MESSAGE_HASH: usize = 20_000;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed-capacity set that forgets its oldest entry when full
#[derive(Debug)]
pub struct KnownHashes {
    capacity: usize,
    order: VecDeque<Hash>,
    set: HashSet<Hash>,
}

impl KnownHashes {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            set: HashSet::new(),
        }
    }

    pub fn insert(&mut self, hash: Hash) {
        if !self.set.insert(hash) {
            return;
        }
        self.order.push_back(hash);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.set.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Snapshot of a peer for logs and admin queries
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub name: String,
    pub protocol_version: u32,
    pub qc_bn: u64,
    pub locked_bn: u64,
    pub commit_bn: u64,
}

pub struct Peer {
    id: NodeId,
    name: String,
    version: u32,
    qc_bn: AtomicU64,
    locked_bn: AtomicU64,
    commit_bn: AtomicU64,
    known_hashes: Mutex<KnownHashes>,
    rw: Arc<dyn MsgReadWriter>,
}

impl Peer {
    pub fn new(version: u32, id: NodeId, name: impl Into<String>, rw: Arc<dyn MsgReadWriter>) -> Self {
        Self {
            id,
            name: name.into(),
            version,
            qc_bn: AtomicU64::new(0),
            locked_bn: AtomicU64::new(0),
            commit_bn: AtomicU64::new(0),
            known_hashes: Mutex::new(KnownHashes::new(MAX_KNOWN_MESSAGE_HASH)),
            rw,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn qc_bn(&self) -> u64 {
        self.qc_bn.load(Ordering::Acquire)
    }

    pub fn set_qc_bn(&self, number: u64) {
        self.qc_bn.store(number, Ordering::Release);
    }

    pub fn locked_bn(&self) -> u64 {
        self.locked_bn.load(Ordering::Acquire)
    }

    pub fn set_locked_bn(&self, number: u64) {
        self.locked_bn.store(number, Ordering::Release);
    }

    pub fn commit_bn(&self) -> u64 {
        self.commit_bn.load(Ordering::Acquire)
    }

    pub fn set_commit_bn(&self, number: u64) {
        self.commit_bn.store(number, Ordering::Release);
    }

    pub fn mark_message_hash(&self, hash: Hash) {
        self.known_hashes.lock().insert(hash);
    }

    pub fn contains_message_hash(&self, hash: &Hash) -> bool {
        self.known_hashes.lock().contains(hash)
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id.to_string(),
            name: self.name.clone(),
            protocol_version: self.version,
            qc_bn: self.qc_bn(),
            locked_bn: self.locked_bn(),
            commit_bn: self.commit_bn(),
        }
    }

    /// Exchange status with the remote side and adopt its watermarks.
    ///
    /// Both sides send first and then read, so neither blocks the other.
    /// A different protocol version fails the handshake.
    pub async fn handshake(&self, status: &StatusData) -> NetworkResult<StatusData> {
        let exchange = async {
            let (sent, received) = tokio::join!(
                self.rw.write_msg(PeerMessage::Status(status.clone())),
                self.rw.read_msg()
            );
            sent?;
            match received? {
                PeerMessage::Status(remote) => Ok(remote),
                other => Err(NetworkError::UnexpectedMessage(other.name())),
            }
        };

        let remote = tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange)
            .await
            .map_err(|_| NetworkError::ConnectionTimeout)??;

        if remote.protocol_version != status.protocol_version {
            return Err(NetworkError::ProtocolVersionMismatch {
                local: status.protocol_version,
                remote: remote.protocol_version,
            });
        }

        self.set_qc_bn(remote.qc_bn);
        self.set_locked_bn(remote.lock_bn);
        self.set_commit_bn(remote.cmt_bn);
        debug!(
            "Handshake with {} done: qc={} lock={} commit={}",
            self.id, remote.qc_bn, remote.lock_bn, remote.cmt_bn
        );
        Ok(remote)
    }

    /// Send `msg` and remember that this peer has it
    pub async fn send(&self, msg: ConsensusMessage) -> NetworkResult<()> {
        self.mark_message_hash(msg.msg_hash());
        trace!("Send {:?} to {}", msg.kind(), self.id);
        self.rw.write_msg(PeerMessage::Consensus(msg)).await
    }

    /// Read the next consensus message, marking its hash as known
    pub async fn receive(&self) -> NetworkResult<ConsensusMessage> {
        match self.rw.read_msg().await? {
            PeerMessage::Consensus(msg) => {
                self.mark_message_hash(msg.msg_hash());
                Ok(msg)
            }
            other => Err(NetworkError::UnexpectedMessage(other.name())),
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("qc_bn", &self.qc_bn())
            .field("locked_bn", &self.locked_bn())
            .field("commit_bn", &self.commit_bn())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_data;
    use crate::network::transport::MsgPipe;
    use crate::types::random_node_id;

    fn hash_of(i: u64) -> Hash {
        hash_data(&i.to_be_bytes())
    }

    fn pipe_peers() -> (Peer, Peer) {
        let (a, b) = MsgPipe::pair(8);
        (
            Peer::new(1, random_node_id(), "me", Arc::new(a)),
            Peer::new(1, random_node_id(), "you", Arc::new(b)),
        )
    }

    fn status(version: u32, qc: u64, lock: u64, cmt: u64) -> StatusData {
        StatusData {
            protocol_version: version,
            qc_bn: qc,
            lock_bn: lock,
            cmt_bn: cmt,
            ..Default::default()
        }
    }

    #[test]
    fn test_known_hashes_evict_oldest() {
        let mut known = KnownHashes::new(3);
        for i in 0..5 {
            known.insert(hash_of(i));
        }
        assert_eq!(known.len(), 3);
        assert!(!known.contains(&hash_of(0)));
        assert!(!known.contains(&hash_of(1)));
        assert!(known.contains(&hash_of(4)));

        // re-inserting a known hash does not refresh its position
        known.insert(hash_of(2));
        known.insert(hash_of(5));
        assert!(!known.contains(&hash_of(2)));
    }

    #[test]
    fn test_peer_watermarks_and_info() {
        let (peer, _) = pipe_peers();
        for i in 0..(MAX_KNOWN_MESSAGE_HASH as u64 + 2) {
            peer.mark_message_hash(hash_of(i));
        }
        assert!(!peer.contains_message_hash(&hash_of(1)));
        assert!(peer.contains_message_hash(&hash_of(MAX_KNOWN_MESSAGE_HASH as u64 + 1)));

        peer.set_qc_bn(100);
        peer.set_locked_bn(200);
        peer.set_commit_bn(300);
        assert_eq!((peer.qc_bn(), peer.locked_bn(), peer.commit_bn()), (100, 200, 300));

        let json = serde_json::to_string(&peer.info()).unwrap();
        assert!(json.contains("\"qc_bn\":100"));
        assert!(json.contains("\"name\":\"me\""));
    }

    #[tokio::test]
    async fn test_handshake_adopts_remote_watermarks() {
        let (me, you) = pipe_peers();
        let mine = status(1, 1, 2, 3);
        let yours = status(1, 2, 3, 4);

        let (a, b) = tokio::join!(me.handshake(&mine), you.handshake(&yours));
        assert_eq!(a.unwrap(), yours);
        assert_eq!(b.unwrap(), mine);
        assert_eq!((me.qc_bn(), me.locked_bn(), me.commit_bn()), (2, 3, 4));
        assert_eq!((you.qc_bn(), you.locked_bn(), you.commit_bn()), (1, 2, 3));
    }

    #[tokio::test]
    async fn test_handshake_version_mismatch() {
        let (me, you) = pipe_peers();
        let (me_status, you_status) = (status(1, 1, 2, 3), status(2, 9, 8, 7));
        let (a, b) = tokio::join!(me.handshake(&me_status), you.handshake(&you_status));
        assert!(matches!(
            a,
            Err(NetworkError::ProtocolVersionMismatch { local: 1, remote: 2 })
        ));
        assert!(b.is_err());
        assert_eq!(me.qc_bn(), 0);
    }

    #[tokio::test]
    async fn test_send_marks_hash() {
        let (me, you) = pipe_peers();
        let msg = ConsensusMessage::GetQCBlockList {
            block_hash: hash_of(7),
            block_number: 7,
        };
        me.send(msg.clone()).await.unwrap();
        assert!(me.contains_message_hash(&msg.msg_hash()));

        let received = you.receive().await.unwrap();
        assert_eq!(received, msg);
        assert!(you.contains_message_hash(&msg.msg_hash()));
    }
}
