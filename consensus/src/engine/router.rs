// Glue between the engine channels and connected peers

use super::{Inbound, Outbound};
use crate::network::{NetworkError, Peer, PeerSet};
use crate::protocols::ConsensusMessage;
use crate::types::NodeId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

/// Messages buffered per peer before new ones are dropped for it
pub const PEER_SEND_QUEUE: usize = 256;

/// One bounded queue and writer task per peer, so a slow connection only
/// loses its own messages
struct PeerQueues {
    capacity: usize,
    queues: HashMap<NodeId, mpsc::Sender<ConsensusMessage>>,
}

impl PeerQueues {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queues: HashMap::new(),
        }
    }

    /// Queue `msg` for `peer`; false when it was dropped
    fn push(&mut self, peer: &Arc<Peer>, msg: ConsensusMessage) -> bool {
        let capacity = self.capacity;
        let queue = self
            .queues
            .entry(*peer.id())
            .or_insert_with(|| spawn_writer(Arc::clone(peer), capacity));
        match queue.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(msg)) => {
                warn!("Send queue of {} full, dropping {:?}", peer.id(), msg.kind());
                false
            }
            Err(TrySendError::Closed(msg)) => {
                // writer gave up on a broken connection; start over
                let queue = spawn_writer(Arc::clone(peer), capacity);
                let queued = queue.try_send(msg).is_ok();
                self.queues.insert(*peer.id(), queue);
                queued
            }
        }
    }

    /// Forget peers that left the set
    fn retain(&mut self, peers: &PeerSet) {
        self.queues.retain(|id, _| peers.get(id).is_ok());
    }
}

fn spawn_writer(peer: Arc<Peer>, capacity: usize) -> mpsc::Sender<ConsensusMessage> {
    let (tx, mut rx) = mpsc::channel::<ConsensusMessage>(capacity);
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = peer.send(msg).await {
                warn!("Failed to send to {}: {}", peer.id(), e);
                break;
            }
        }
    });
    tx
}

/// Deliver everything the engine emits until its sender is dropped.
///
/// Broadcasts skip peers that already know the message. A sync request
/// goes to one peer whose QC height is above the requested block.
pub async fn dispatch_outbound(peers: Arc<PeerSet>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    let mut queues = PeerQueues::new(PEER_SEND_QUEUE);
    while let Some(out) = rx.recv().await {
        queues.retain(&peers);
        match out {
            Outbound::Broadcast(msg) => {
                let hash = msg.msg_hash();
                for peer in peers.all_peers() {
                    if peer.contains_message_hash(&hash) {
                        trace!("Peer {} already has {:?}", peer.id(), msg.kind());
                        continue;
                    }
                    if queues.push(&peer, msg.clone()) {
                        peer.mark_message_hash(hash);
                    }
                }
            }
            Outbound::SendTo(id, msg) => match peers.get(&id) {
                Ok(peer) => {
                    queues.push(&peer, msg);
                }
                Err(e) => debug!("Dropping {:?}: {}", msg.kind(), e),
            },
            Outbound::Sync {
                block_hash,
                block_number,
            } => {
                let target = peers
                    .peers_with_qc_at_or_above(block_number + 1)
                    .into_iter()
                    .max_by_key(|p| p.qc_bn());
                match target {
                    Some(peer) => {
                        debug!("Sync above block {} from {}", block_number, peer.id());
                        let req = ConsensusMessage::GetQCBlockList {
                            block_hash,
                            block_number,
                        };
                        queues.push(&peer, req);
                    }
                    None => debug!("No peer ahead of block {}", block_number),
                }
            }
        }
    }
    debug!("Outbound channel closed");
}

/// Forward a peer's messages into the engine queue until either side
/// closes. Returns the error that ended the read loop, if any.
pub async fn pump_inbound(peer: Arc<Peer>, tx: mpsc::Sender<Inbound>) -> Option<NetworkError> {
    loop {
        let msg = match peer.receive().await {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Stop reading from {}: {}", peer.id(), e);
                return Some(e);
            }
        };
        if let ConsensusMessage::BlockQuorumCert(qc) = &msg {
            if qc.block_number > peer.qc_bn() {
                peer.set_qc_bn(qc.block_number);
            }
        }
        let inbound = Inbound {
            from: *peer.id(),
            msg,
        };
        if tx.send(inbound).await.is_err() {
            debug!("Engine queue closed, stop reading from {}", peer.id());
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Hash;
    use crate::network::MsgPipe;
    use crate::protocols::PrepareVote;
    use crate::types::random_node_id;
    use std::time::Duration;

    fn vote(index: u32) -> ConsensusMessage {
        ConsensusMessage::PrepareVote(PrepareVote {
            epoch: 1,
            view_number: 0,
            block_hash: Hash::zero(),
            block_number: 1,
            block_index: 0,
            validator_index: index,
            parent_qc: None,
            signature: Default::default(),
        })
    }

    /// Registered local end plus the remote end a test reads from
    fn connected(set: &PeerSet, name: &str) -> (Arc<Peer>, Arc<Peer>) {
        let (local, remote) = MsgPipe::pair(16);
        let local = Arc::new(Peer::new(1, random_node_id(), name, Arc::new(local)));
        let remote = Arc::new(Peer::new(1, random_node_id(), name, Arc::new(remote)));
        set.register(Arc::clone(&local)).unwrap();
        (local, remote)
    }

    #[tokio::test]
    async fn test_broadcast_skips_peers_that_know_the_message() {
        let set = Arc::new(PeerSet::new());
        let (a, a_remote) = connected(&set, "a");
        let (b, b_remote) = connected(&set, "b");
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch_outbound(Arc::clone(&set), rx));

        let msg = vote(1);
        b.mark_message_hash(msg.msg_hash());
        tx.send(Outbound::Broadcast(msg.clone())).unwrap();
        tx.send(Outbound::SendTo(*b.id(), vote(2))).unwrap();
        drop(tx);
        dispatcher.await.unwrap();

        assert_eq!(a_remote.receive().await.unwrap(), msg);
        assert!(a.contains_message_hash(&msg.msg_hash()));
        // b only sees the direct message
        assert_eq!(b_remote.receive().await.unwrap(), vote(2));
    }

    #[tokio::test]
    async fn test_stalled_peer_does_not_hold_up_others() {
        let set = Arc::new(PeerSet::new());
        // nobody reads the stalled end and its pipe holds a single message
        let (stalled_local, _stalled_remote) = MsgPipe::pair(1);
        let stalled = Arc::new(Peer::new(1, random_node_id(), "stalled", Arc::new(stalled_local)));
        set.register(Arc::clone(&stalled)).unwrap();
        let (_healthy, healthy_remote) = connected(&set, "healthy");

        let (tx, rx) = mpsc::unbounded_channel();
        for i in 0..20 {
            tx.send(Outbound::Broadcast(vote(i))).unwrap();
        }
        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), dispatch_outbound(Arc::clone(&set), rx))
            .await
            .unwrap();

        for i in 0..20 {
            let msg = tokio::time::timeout(Duration::from_secs(5), healthy_remote.receive())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(msg, vote(i));
        }
    }

    #[tokio::test]
    async fn test_full_peer_queue_drops_only_for_that_peer() {
        let set = PeerSet::new();
        let (slow, _slow_remote) = connected(&set, "slow");
        let (fast, _fast_remote) = connected(&set, "fast");
        let mut queues = PeerQueues::new(2);

        // writers have not run yet, so only the queue capacity is available
        let pushed: Vec<bool> = (0..4).map(|i| queues.push(&slow, vote(i))).collect();
        assert_eq!(pushed, vec![true, true, false, false]);
        assert!(queues.push(&fast, vote(0)));

        set.unregister(slow.id()).unwrap();
        queues.retain(&set);
        assert_eq!(queues.queues.len(), 1);
        assert!(queues.queues.contains_key(fast.id()));
    }

    #[tokio::test]
    async fn test_sync_goes_to_peer_ahead() {
        let set = Arc::new(PeerSet::new());
        let (behind, behind_remote) = connected(&set, "behind");
        let (ahead, ahead_remote) = connected(&set, "ahead");
        behind.set_qc_bn(5);
        ahead.set_qc_bn(20);

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Outbound::Sync {
            block_hash: Hash::zero(),
            block_number: 10,
        })
        .unwrap();
        drop(tx);
        dispatch_outbound(Arc::clone(&set), rx).await;

        let req = ahead_remote.receive().await.unwrap();
        assert!(matches!(
            req,
            ConsensusMessage::GetQCBlockList { block_number: 10, .. }
        ));
        let nothing =
            tokio::time::timeout(Duration::from_millis(20), behind_remote.receive()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_pump_forwards_until_queue_closes() {
        let (local, remote) = MsgPipe::pair(16);
        let peer = Arc::new(Peer::new(1, random_node_id(), "p", Arc::new(local)));
        let remote = Peer::new(1, random_node_id(), "r", Arc::new(remote));
        let (tx, mut rx) = mpsc::channel(4);
        let pump = tokio::spawn(pump_inbound(Arc::clone(&peer), tx));

        remote.send(vote(3)).await.unwrap();
        let inbound = rx.recv().await.unwrap();
        assert_eq!(inbound.from, *peer.id());
        assert_eq!(inbound.msg, vote(3));
        assert!(peer.contains_message_hash(&vote(3).msg_hash()));

        drop(rx);
        remote.send(vote(4)).await.unwrap();
        assert!(pump.await.unwrap().is_none());
    }
}
