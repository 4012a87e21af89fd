//! Fixtures for testing the broker's consensus core.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use linebus::error::ClientWriteError;
use linebus::message::Message;
use linebus::metrics::RaftMetrics;
use linebus::metrics::Wait;
use linebus::network::ForwardOutcome;
use linebus::network::RaftNetwork;
use linebus::raft::AppendEntriesRequest;
use linebus::raft::AppendEntriesResponse;
use linebus::raft::ClientWriteRequest;
use linebus::raft::ClientWriteResponse;
use linebus::raft::Raft;
use linebus::raft::Subscription;
use linebus::raft::VoteRequest;
use linebus::raft::VoteResponse;
use linebus::subscribers::spawn_fanout;
use linebus::subscribers::BrokerStats;
use linebus::subscribers::SubscriberRegistry;
use linebus::writer;
use linebus::Config;
use linebus::NodeId;
use linebus::State;
use linestore::DiskStore;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

/// A concrete Raft type used during testing.
pub type BrokerRaft = Raft<BrokerRouter, DiskStore>;

/// Everything the fixture holds for one in-process node.
pub struct TestNode {
    pub raft: BrokerRaft,
    pub store: Arc<DiskStore>,
    pub registry: Arc<SubscriberRegistry>,
}

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// A type which emulates a network transport and implements the
/// `RaftNetwork` trait, routing RPCs between in-process nodes.
pub struct BrokerRouter {
    /// The runtime config which all nodes are using.
    config: Arc<Config>,
    /// The table of all nodes currently known to this router instance.
    routing_table: RwLock<BTreeMap<NodeId, Arc<TestNode>>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: RwLock<HashSet<NodeId>>,
}

impl BrokerRouter {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            routing_table: Default::default(),
            isolated_nodes: Default::default(),
        }
    }

    /// Create and register a new broker node bearing the given ID, on a
    /// throwaway store.
    pub async fn new_broker_node(self: &Arc<Self>, id: NodeId) {
        let store = Arc::new(DiskStore::open_temporary().expect("open temporary store"));
        self.new_broker_node_with_sto(id, store).await
    }

    /// Register a node on the given store; used to emulate a restart by
    /// reusing a store for a fresh node.
    pub async fn new_broker_node_with_sto(self: &Arc<Self>, id: NodeId, store: Arc<DiskStore>) {
        let (write_handle, _writer_task) =
            writer::spawn(store.clone(), self.config.write_queue_depth, self.config.write_batch_max);
        let (applied_tx, applied_rx) = mpsc::unbounded_channel();
        let (registry, _detached_rx) = SubscriberRegistry::new(
            id,
            self.config.subscriber_queue_depth,
            self.config.subscriber_overflow_limit,
            Arc::new(BrokerStats::default()),
        );
        spawn_fanout(registry.clone(), applied_rx);

        let raft = Raft::new(id, self.config.clone(), self.clone(), store.clone(), write_handle, applied_tx);
        let node = Arc::new(TestNode { raft, store, registry });
        let mut rt = self.routing_table.write().await;
        rt.insert(id, node);
    }

    /// Remove the target node from the routing table & isolation,
    /// simulating a killed process.
    pub async fn remove_node(&self, id: NodeId) -> Option<Arc<TestNode>> {
        let opt_node = self.routing_table.write().await.remove(&id);
        self.isolated_nodes.write().await.remove(&id);
        opt_node
    }

    /// Feed every live node the full membership, as the scanner would.
    pub async fn seed_membership(&self) -> Result<()> {
        let rt = self.routing_table.read().await;
        let members: BTreeSet<NodeId> = rt.keys().copied().collect();
        for node in rt.values() {
            node.raft.update_peers(members.clone())?;
        }
        Ok(())
    }

    /// Feed every live node an explicit membership view.
    pub async fn set_membership(&self, members: BTreeSet<NodeId>) -> Result<()> {
        let rt = self.routing_table.read().await;
        for (id, node) in rt.iter() {
            if members.contains(id) {
                node.raft.update_peers(members.clone())?;
            }
        }
        Ok(())
    }

    /// Isolate the network of the specified node.
    pub async fn isolate_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.insert(id);
    }

    /// Restore the network of the specified node.
    pub async fn restore_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.remove(&id);
    }

    pub async fn node(&self, id: &NodeId) -> Result<Arc<TestNode>> {
        let rt = self.routing_table.read().await;
        rt.get(id).cloned().with_context(|| format!("node {} not found in routing table", id))
    }

    /// Get a payload of the latest metrics from each node in the cluster.
    pub async fn latest_metrics(&self) -> Vec<RaftMetrics> {
        let rt = self.routing_table.read().await;
        rt.values().map(|node| node.raft.metrics().borrow().clone()).collect()
    }

    /// Get the ID of the current, non-isolated leader.
    pub async fn leader(&self) -> Option<NodeId> {
        let isolated = self.isolated_nodes.read().await;
        self.latest_metrics().await.into_iter().find_map(|node| {
            if node.state == State::Leader && !isolated.contains(&node.id) {
                Some(node.id)
            } else {
                None
            }
        })
    }

    pub async fn wait(&self, node_id: &NodeId, timeout: Option<Duration>) -> Result<Wait> {
        let node = self.node(node_id).await?;
        Ok(node.raft.wait(timeout))
    }

    /// Wait for metrics until it satisfies some condition.
    pub async fn wait_for_metrics<T>(
        &self,
        node_id: &NodeId,
        func: T,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<RaftMetrics>
    where
        T: Fn(&RaftMetrics) -> bool + Send,
    {
        let wait = self.wait(node_id, timeout).await?;
        let rst = wait.metrics(func, msg).await?;
        Ok(rst)
    }

    /// Wait for specified nodes until they have applied upto `want_log`(inclusive) logs.
    pub async fn wait_for_log(
        &self,
        node_ids: &BTreeSet<u64>,
        want_log: u64,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for i in node_ids.iter() {
            self.wait(i, timeout).await?.log(want_log, msg).await?;
        }
        Ok(())
    }

    /// Wait for specified nodes until their state becomes `state`.
    pub async fn wait_for_state(
        &self,
        node_ids: &BTreeSet<u64>,
        want_state: State,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for i in node_ids.iter() {
            self.wait(i, timeout).await?.state(want_state, msg).await?;
        }
        Ok(())
    }

    /// Wait until some non-isolated node reports itself leader, returning
    /// its ID.
    pub async fn wait_for_any_leader(&self, timeout: Duration, msg: &str) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                return Ok(leader);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("timed out waiting for a leader: {}", msg));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Publish a message through the target node, failing the test on error.
    pub async fn client_publish(&self, target: NodeId, topic: &str, value: &str) -> ClientWriteResponse {
        match self.try_client_publish(target, topic, value).await {
            Ok(resp) => resp,
            Err(err) => panic!("publish through node {} failed: {:?}", target, err),
        }
    }

    /// Publish a message through the target node, returning the raw result.
    pub async fn try_client_publish(
        &self,
        target: NodeId,
        topic: &str,
        value: &str,
    ) -> std::result::Result<ClientWriteResponse, ClientWriteError> {
        let node = self.node(&target).await.expect("target node exists");
        node.raft.client_write(ClientWriteRequest::publish(test_message(topic, value))).await
    }

    /// Register a subscription through the target node.
    pub async fn client_subscribe(
        &self,
        target: NodeId,
        subscriber_id: &str,
        owner_node: NodeId,
        topic: &str,
    ) -> std::result::Result<ClientWriteResponse, ClientWriteError> {
        let node = self.node(&target).await.expect("target node exists");
        node.raft
            .client_write(ClientWriteRequest::subscribe(Subscription {
                subscriber_id: subscriber_id.to_string(),
                node_id: owner_node,
                topic: topic.to_string(),
            }))
            .await
    }

    /// Send multiple publishes to the target node, causing test failure on error.
    pub async fn client_publish_many(&self, target: NodeId, topic: &str, count: usize) {
        for idx in 0..count {
            self.client_publish(target, topic, &format!("payload-{}", idx)).await;
        }
    }

    /// Assert that the cluster has an elected leader and that every
    /// non-isolated node agrees on it, the term, and the log.
    pub async fn assert_stable_cluster(&self, expected_term: Option<u64>, expected_last_log: Option<u64>) {
        let isolated = self.isolated_nodes.read().await;
        let nodes = self.latest_metrics().await;

        let non_isolated: Vec<_> = nodes.iter().filter(|node| !isolated.contains(&node.id)).collect();
        let leader = non_isolated
            .iter()
            .find(|node| node.state == State::Leader)
            .expect("expected to find a cluster leader");
        let followers: Vec<_> = non_isolated.iter().filter(|node| node.state == State::Follower).collect();

        assert_eq!(
            followers.len() + 1,
            non_isolated.len(),
            "expected all nodes to be followers with one leader, got 1 leader and {} followers, expected {}",
            followers.len(),
            non_isolated.len() - 1,
        );
        let expected_term = expected_term.unwrap_or(leader.current_term);
        let expected_last_log = expected_last_log.unwrap_or(leader.last_log_index);
        for node in non_isolated.iter() {
            assert_eq!(
                node.current_leader,
                Some(leader.id),
                "node {} has leader {:?}, expected {}",
                node.id,
                node.current_leader,
                leader.id
            );
            assert_eq!(
                node.current_term, expected_term,
                "node {} has term {}, expected {}",
                node.id, node.current_term, expected_term
            );
            assert_eq!(
                node.last_applied, expected_last_log,
                "node {} has last_applied {}, expected {}",
                node.id, node.last_applied, expected_last_log
            );
            assert_eq!(
                node.last_log_index, expected_last_log,
                "node {} has last_log_index {}, expected {}",
                node.id, node.last_log_index, expected_last_log
            );
        }
    }
}

/// Build a routed JSON message for tests.
pub fn test_message(topic: &str, value: &str) -> Message {
    let body = format!(r#"{{"Id":1,"EventName":"test","Value":"{}","Topic":"{}"}}"#, value, topic);
    Message::parse_frame(&format!("FORMAT:JSON|{}", body)).expect("valid test frame")
}

#[async_trait]
impl RaftNetwork for BrokerRouter {
    /// Route an AppendEntries to the target node.
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.check_reachable(target, rpc.leader_id).await?;
        let node = self.node(&target).await?;
        node.raft.append_entries(rpc).await.map_err(|err| anyhow!(err))
    }

    /// Route a RequestVote to the target node.
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        self.check_reachable(target, rpc.candidate_id).await?;
        let node = self.node(&target).await?;
        node.raft.vote(rpc).await.map_err(|err| anyhow!(err))
    }

    /// Relay a client write to the target node.
    async fn send_forward(&self, target: NodeId, rpc: ClientWriteRequest) -> Result<ForwardOutcome> {
        if self.isolated_nodes.read().await.contains(&target) {
            return Err(anyhow!("target node {} is isolated", target));
        }
        let node = self.node(&target).await?;
        match node.raft.client_write(rpc).await {
            Ok(resp) => Ok(ForwardOutcome::Committed(resp)),
            Err(ClientWriteError::ForwardToLeader(leader)) => Ok(ForwardOutcome::NotLeader { leader }),
            Err(err) => Err(anyhow!(err)),
        }
    }
}

impl BrokerRouter {
    /// RPCs to or from an isolated node fail.
    async fn check_reachable(&self, target: NodeId, source: NodeId) -> Result<()> {
        let isolated = self.isolated_nodes.read().await;
        if isolated.contains(&target) {
            return Err(anyhow!("target node {} is isolated", target));
        }
        if isolated.contains(&source) {
            return Err(anyhow!("source node {} is isolated", source));
        }
        Ok(())
    }
}
