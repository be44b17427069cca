// Registry of connected consensus peers
//
// Connection tasks register and unregister concurrently, so the set has
// its own lock and never calls back into the engine while holding it.

use super::peer::Peer;
use super::{NetworkError, NetworkResult};
use crate::types::NodeId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Default)]
struct Inner {
    peers: HashMap<NodeId, Arc<Peer>>,
    closed: bool,
}

#[derive(Default)]
pub struct PeerSet {
    inner: RwLock<Inner>,
    closed: Notify,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, peer: Arc<Peer>) -> NetworkResult<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(NetworkError::Closed);
        }
        if inner.peers.contains_key(peer.id()) {
            return Err(NetworkError::AlreadyRegistered(*peer.id()));
        }
        debug!("Registered peer {} ({})", peer.id(), peer.name());
        inner.peers.insert(*peer.id(), peer);
        Ok(())
    }

    pub fn unregister(&self, id: &NodeId) -> NetworkResult<()> {
        let mut inner = self.inner.write();
        match inner.peers.remove(id) {
            Some(_) => {
                debug!("Unregistered peer {}", id);
                Ok(())
            }
            None => Err(NetworkError::NotRegistered(*id)),
        }
    }

    pub fn get(&self, id: &NodeId) -> NetworkResult<Arc<Peer>> {
        self.inner
            .read()
            .peers
            .get(id)
            .cloned()
            .ok_or(NetworkError::NotRegistered(*id))
    }

    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().peers.is_empty()
    }

    /// Reject further registrations and stop the reporter
    pub fn close(&self) {
        self.inner.write().closed = true;
        self.closed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }

    fn filter<F>(&self, pred: F) -> Vec<Arc<Peer>>
    where
        F: Fn(&Peer) -> bool,
    {
        self.inner
            .read()
            .peers
            .values()
            .filter(|p| pred(p))
            .cloned()
            .collect()
    }

    pub fn all_peers(&self) -> Vec<Arc<Peer>> {
        self.filter(|_| true)
    }

    /// Peers whose id is among the current validators
    pub fn peers_with_consensus(&self, validators: &[NodeId]) -> Vec<Arc<Peer>> {
        self.filter(|p| validators.contains(p.id()))
    }

    /// Observers: peers outside the validator set
    pub fn peers_without_consensus(&self, validators: &[NodeId]) -> Vec<Arc<Peer>> {
        self.filter(|p| !validators.contains(p.id()))
    }

    pub fn peers_with_qc_at_or_above(&self, number: u64) -> Vec<Arc<Peer>> {
        self.filter(|p| p.qc_bn() >= number)
    }

    pub fn peers_with_lock_at_or_above(&self, number: u64) -> Vec<Arc<Peer>> {
        self.filter(|p| p.locked_bn() >= number)
    }

    pub fn peers_with_commit_at_or_above(&self, number: u64) -> Vec<Arc<Peer>> {
        self.filter(|p| p.commit_bn() >= number)
    }

    /// Log the peer table every `interval` until the set is closed
    pub fn spawn_reporter(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let set = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = set.closed.notified() => {}
                }
                if set.is_closed() {
                    break;
                }
                let peers = set.all_peers();
                let infos: Vec<_> = peers.iter().map(|p| p.info()).collect();
                match serde_json::to_string(&infos) {
                    Ok(json) => info!("Consensus peers ({}): {}", infos.len(), json),
                    Err(e) => debug!("Failed to encode peer table: {}", e),
                }
            }
            debug!("Peer reporter stopped");
        })
    }
}
