/// Multi-node engine tests
///
/// Every node runs a real `ConsensusEngine`; a synchronous in-memory
/// network delivers outbound messages in FIFO order until nothing is left.

#[cfg(test)]
mod tests {
    use crate::engine::{Config, ConsensusEngine, Ledger, MemoryLedger, Outbound};
    use crate::protocols::{ConsensusMessage, MessageKind, PrepareBlock};
    use crate::testing::TestValidators;
    use crate::types::{Block, NodeId, QuorumCert};
    use crate::viewchange::ViewChangeReason;
    use crate::wal::{new_wal, DEFAULT_JOURNAL_LIMIT_SIZE};
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    type DropRule = Box<dyn Fn(usize, &ConsensusMessage) -> bool>;

    struct TestNode {
        engine: ConsensusEngine,
        outbound: mpsc::UnboundedReceiver<Outbound>,
        ledger: Arc<MemoryLedger>,
    }

    struct TestNetwork {
        validators: TestValidators,
        ids: Vec<NodeId>,
        nodes: Vec<TestNode>,
        /// `(to, msg)` pairs the network loses
        drop_rule: Option<DropRule>,
        round: u8,
    }

    fn test_config() -> Config {
        Config {
            blocks_per_view: 10,
            ..Default::default()
        }
    }

    fn start_node(
        validators: &TestValidators,
        index: u32,
        ledger: Arc<MemoryLedger>,
        wal_dir: Option<&Path>,
    ) -> TestNode {
        let (tx, rx) = mpsc::unbounded_channel();
        let wal = new_wal(wal_dir, DEFAULT_JOURNAL_LIMIT_SIZE).unwrap();
        let mut engine = ConsensusEngine::new(
            test_config(),
            Arc::clone(validators.signer(index)),
            validators.shared_pool(),
            ledger.clone(),
            wal,
            tx,
        );
        engine.start().unwrap();
        TestNode {
            engine,
            outbound: rx,
            ledger,
        }
    }

    impl TestNetwork {
        fn new(n: usize) -> Self {
            Self::with_wal(n, None)
        }

        /// Node 0 keeps its WAL in `wal_dir`
        fn with_wal(n: usize, wal_dir: Option<&Path>) -> Self {
            Self::build(n, Block::genesis(), wal_dir)
        }

        /// Every ledger starts from `root` instead of genesis
        fn rooted_at(n: usize, root: Block) -> Self {
            Self::build(n, root, None)
        }

        fn build(n: usize, root: Block, wal_dir: Option<&Path>) -> Self {
            let validators = TestValidators::new(n);
            let ids = (0..n as u32)
                .map(|i| *validators.signer(i).node_id())
                .collect();
            let nodes = (0..n as u32)
                .map(|i| {
                    let ledger = Arc::new(MemoryLedger::new(root.clone()));
                    start_node(&validators, i, ledger, if i == 0 { wal_dir } else { None })
                })
                .collect();
            Self {
                validators,
                ids,
                nodes,
                drop_rule: None,
                round: 0,
            }
        }

        fn engine(&self, i: usize) -> &ConsensusEngine {
            &self.nodes[i].engine
        }

        fn index_of(&self, id: &NodeId) -> usize {
            self.ids.iter().position(|x| x == id).unwrap()
        }

        fn collect(&mut self, queue: &mut VecDeque<(usize, NodeId, ConsensusMessage)>) {
            for i in 0..self.nodes.len() {
                let from = self.ids[i];
                while let Ok(out) = self.nodes[i].outbound.try_recv() {
                    match out {
                        Outbound::Broadcast(msg) => {
                            for j in (0..self.nodes.len()).filter(|&j| j != i) {
                                queue.push_back((j, from, msg.clone()));
                            }
                        }
                        Outbound::SendTo(to, msg) => {
                            queue.push_back((self.index_of(&to), from, msg));
                        }
                        Outbound::Sync {
                            block_hash,
                            block_number,
                        } => {
                            let target = (0..self.nodes.len())
                                .filter(|&j| j != i)
                                .max_by_key(|&j| self.engine(j).state().highest_qc_block().number)
                                .filter(|&j| {
                                    self.engine(j).state().highest_qc_block().number > block_number
                                });
                            if let Some(j) = target {
                                let req = ConsensusMessage::GetQCBlockList {
                                    block_hash,
                                    block_number,
                                };
                                queue.push_back((j, from, req));
                            }
                        }
                    }
                }
            }
        }

        /// Deliver until every outbound queue is empty
        fn deliver(&mut self) -> usize {
            let mut queue = VecDeque::new();
            let mut delivered = 0;
            loop {
                self.collect(&mut queue);
                let Some((to, from, msg)) = queue.pop_front() else {
                    break;
                };
                if self.drop_rule.as_ref().map_or(false, |rule| rule(to, &msg)) {
                    continue;
                }
                let _ = self.nodes[to].engine.handle_message(from, msg);
                delivered += 1;
                assert!(delivered < 100_000, "network did not settle");
            }
            delivered
        }

        fn propose(&mut self, leader: usize) -> PrepareBlock {
            self.round += 1;
            let payload = vec![vec![self.round; 8]];
            let pb = self.nodes[leader].engine.propose(payload).unwrap();
            self.deliver();
            pb
        }

        fn time_out(&mut self, nodes: &[usize]) {
            for &i in nodes {
                let engine = &mut self.nodes[i].engine;
                engine.state.set_view_timer_period(Duration::ZERO);
                engine.on_view_timeout().unwrap();
            }
            self.deliver();
        }

        fn watermarks(&self, i: usize) -> (u64, u64, u64) {
            let state = self.engine(i).state();
            (
                state.highest_qc_block().number,
                state.highest_lock_block().number,
                state.highest_commit_block().number,
            )
        }
    }

    // ===== Commit rules =====

    #[tokio::test]
    async fn test_three_chain_commit_without_pre_commits() {
        let mut net = TestNetwork::new(4);
        net.drop_rule = Some(Box::new(|_, msg| msg.kind() == MessageKind::PreCommit));

        // node 2 also holds a certified sibling of block 1
        let genesis = Block::genesis();
        let sibling = Block::new(1, genesis.hash(), 7, vec![b"fork".to_vec()]);
        let sibling_qc = QuorumCert {
            block_hash: sibling.hash(),
            block_number: 1,
            ..Default::default()
        };
        net.nodes[2]
            .engine
            .tree
            .insert(sibling.clone(), sibling_qc)
            .unwrap();

        let b1 = net.propose(0);
        for i in 0..4 {
            assert_eq!(net.watermarks(i), (1, 0, 0));
        }
        net.propose(0);
        for i in 0..4 {
            assert_eq!(net.watermarks(i), (2, 1, 0));
        }
        net.propose(0);
        for i in 0..4 {
            assert_eq!(net.watermarks(i), (3, 2, 1));
            assert_eq!(net.nodes[i].ledger.committed_numbers(), vec![0, 1]);
            assert_eq!(net.engine(i).block_tree().root().hash, b1.block.hash());
            assert_eq!(net.engine(i).tracker().consecutive_failures(), 0);
        }

        assert_eq!(net.nodes[2].ledger.evicted(), vec![sibling.hash()]);
        assert!(net.engine(2).block_tree().find_by_hash(&sibling.hash()).is_none());
        assert!(net.nodes[1].ledger.evicted().is_empty());
    }

    #[tokio::test]
    async fn test_pre_commit_quorum_commits_lock() {
        let mut net = TestNetwork::new(4);

        let b1 = net.propose(0);
        net.propose(0);

        // a quorum of pre-commits on the lock commits it one QC early
        for i in 0..4 {
            assert_eq!(net.watermarks(i), (2, 1, 1));
            assert_eq!(net.nodes[i].ledger.committed_numbers(), vec![0, 1]);
            assert_eq!(
                net.nodes[i].ledger.block_by_number(1),
                Some(b1.block.clone())
            );
        }

        // the next QC does not move the commit twice
        net.propose(0);
        for i in 0..4 {
            assert_eq!(net.watermarks(i), (3, 2, 2));
            assert_eq!(net.nodes[i].ledger.committed_numbers(), vec![0, 1, 2]);
        }
    }

    #[tokio::test]
    async fn test_only_leader_proposes_and_blocks_stay_ordered() {
        let mut net = TestNetwork::new(4);
        assert!(net.engine(0).is_leader());
        assert!(net.nodes[1].engine.propose(vec![]).is_err());

        let pb = net.propose(0);
        assert_eq!(pb.block_index, 0);
        assert_eq!(pb.block.number, 1);
        assert!(pb.prepare_qc.is_none());

        let pb = net.propose(0);
        assert_eq!(pb.block_index, 1);
        assert_eq!(pb.block.parent_hash, net.engine(1).state().view_block_by_index(0).unwrap().hash());
        for i in 0..4 {
            assert!(net.engine(i).state().view_qc_by_index(1).is_some());
        }
    }

    #[tokio::test]
    async fn test_view_ends_after_blocks_per_view() {
        let mut net = TestNetwork::new(4);
        for _ in 0..10 {
            net.propose(0);
        }
        for i in 0..4 {
            assert_eq!(net.engine(i).state().view_number(), 1);
            assert_eq!(net.engine(i).state().highest_qc_block().number, 10);
            assert!(!net.engine(i).tracker().is_changing());
        }

        // the next leader builds on the last QC of view 0
        let pb = net.propose(1);
        assert_eq!(pb.view_number, 1);
        assert_eq!(pb.block.number, 11);
        assert_eq!(pb.prepare_qc.as_ref().map(|qc| qc.block_number), Some(10));
        for i in 0..4 {
            assert_eq!(net.engine(i).state().highest_qc_block().number, 11);
        }
    }

    // ===== View change =====

    #[tokio::test]
    async fn test_view_change_on_timeout() {
        let mut net = TestNetwork::new(4);
        net.propose(0);

        net.time_out(&[0, 1, 2, 3]);
        for i in 0..4 {
            let engine = net.engine(i);
            assert_eq!(engine.state().view_number(), 1);
            assert!(!engine.tracker().is_changing());
            assert_eq!(engine.tracker().consecutive_failures(), 1);
            let vcqc = engine.state().last_view_change_qc().unwrap();
            assert_eq!(vcqc.max_block().block_number, 1);
        }
        assert_eq!(net.engine(0).leader_index(1), 1);
        assert!(!net.engine(0).is_leader());

        let pb = net.propose(1);
        assert_eq!(pb.block.number, 2);
        assert!(pb.view_change_qc.is_some());
        for i in 0..4 {
            assert_eq!(net.watermarks(i), (2, 1, 1));
            assert_eq!(net.engine(i).tracker().consecutive_failures(), 0);
        }
    }

    #[tokio::test]
    async fn test_view_change_from_non_genesis_root() {
        let root = Block::new(5, Block::genesis().hash(), 1, vec![b"snapshot".to_vec()]);
        let mut net = TestNetwork::rooted_at(4, root.clone());
        assert!(net.engine(0).block_tree().root().qc.signature.is_empty());

        // nobody holds a QC for the root; the votes name it bare
        net.time_out(&[0, 1, 2, 3]);
        for i in 0..4 {
            let engine = net.engine(i);
            assert_eq!(engine.state().view_number(), 1);
            assert!(!engine.tracker().is_changing());
            let max = engine.state().last_view_change_qc().unwrap().max_block();
            assert_eq!((max.block_number, max.block_hash), (5, root.hash()));
        }

        let pb = net.propose(1);
        assert_eq!(pb.block.number, 6);
        assert!(pb.prepare_qc.is_none());
        assert!(pb.view_change_qc.is_some());
        for i in 0..4 {
            assert_eq!(net.watermarks(i), (6, 5, 5));
        }

        net.propose(1);
        for i in 0..4 {
            assert_eq!(net.watermarks(i), (7, 6, 6));
            assert_eq!(net.nodes[i].ledger.committed_numbers(), vec![5, 6]);
        }
    }

    #[tokio::test]
    async fn test_lagging_node_catches_up_by_view_change_qc() {
        let mut net = TestNetwork::new(4);
        net.drop_rule = Some(Box::new(|to, msg| {
            to == 3 && msg.kind() == MessageKind::ViewChange
        }));

        net.time_out(&[0, 1, 2]);
        assert_eq!(net.engine(3).state().view_number(), 0);
        for i in 0..3 {
            assert_eq!(net.engine(i).state().view_number(), 1);
        }

        net.drop_rule = None;
        net.propose(1);
        let lagging = net.engine(3);
        assert_eq!(lagging.state().view_number(), 1);
        assert!(lagging.state().last_view_change_qc().is_some());
        assert_eq!(lagging.state().highest_qc_block().number, 1);
    }

    #[tokio::test]
    async fn test_proposal_during_view_change_rejected() {
        let mut net = TestNetwork::new(4);
        let engine = &mut net.nodes[0].engine;
        engine.start_view_change(ViewChangeReason::LeaderFailure).unwrap();
        assert!(engine.tracker().is_changing());
        assert!(engine.propose(vec![]).is_err());

        // the timer was re-armed with backoff
        assert!(!engine.state().is_deadline());
    }

    // ===== Sync =====

    #[tokio::test]
    async fn test_isolated_node_syncs_certified_blocks() {
        let mut net = TestNetwork::new(4);
        net.drop_rule = Some(Box::new(|to, _| to == 3));
        net.propose(0);
        net.propose(0);
        assert_eq!(net.engine(3).state().highest_qc_block().number, 0);

        net.drop_rule = None;
        net.propose(0);
        assert_eq!(net.engine(3).state().highest_qc_block().number, 3);
        assert_eq!(net.engine(3).state().highest_lock_block().number, 2);
        assert_eq!(net.engine(3).block_tree().find_by_number(3).len(), 1);
    }

    // ===== Recovery =====

    #[tokio::test]
    async fn test_recover_from_wal() {
        let dir = tempfile::tempdir().unwrap();
        let mut net = TestNetwork::with_wal(4, Some(dir.path()));
        for _ in 0..3 {
            net.propose(0);
        }
        assert_eq!(net.watermarks(0), (3, 2, 2));

        let node = net.nodes.remove(0);
        let ledger = node.ledger.clone();
        drop(node);

        let mut recovered = start_node(&net.validators, 0, ledger, Some(dir.path()));
        let engine = &mut recovered.engine;
        let state = engine.state();
        assert_eq!(state.highest_qc_block().number, 3);
        assert_eq!(state.highest_lock_block().number, 2);
        assert_eq!(state.highest_commit_block().number, 2);
        assert_eq!(state.view_number(), 0);
        assert!(state.had_send_prepare_vote().had(2));
        assert!(state.view_qc_by_index(2).is_some());
        assert_eq!(engine.block_tree().root().number, 2);

        // picks up where it stopped
        let pb = engine.propose(vec![b"after restart".to_vec()]).unwrap();
        assert_eq!(pb.block_index, 3);
        assert_eq!(pb.block.number, 4);
        assert!(recovered.outbound.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_recover_after_view_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut net = TestNetwork::with_wal(4, Some(dir.path()));
        net.propose(0);
        net.time_out(&[0, 1, 2, 3]);
        assert_eq!(net.engine(0).state().view_number(), 1);

        let node = net.nodes.remove(0);
        let ledger = node.ledger.clone();
        drop(node);

        let recovered = start_node(&net.validators, 0, ledger, Some(dir.path()));
        let state = recovered.engine.state();
        assert_eq!(state.view_number(), 1);
        assert!(state.last_view_change_qc().is_some());
        assert_eq!(state.highest_qc_block().number, 1);
        // nothing from view 0 is replayed into view 1
        assert!(state.view_block_by_index(0).is_none());
        assert!(!state.had_send_prepare_vote().had(0));
    }
}
