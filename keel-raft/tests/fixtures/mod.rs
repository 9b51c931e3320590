//! Fixtures for testing Raft.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use keel_raft::async_trait::async_trait;
use keel_raft::error::ClientWriteError;
use keel_raft::error::ResponseError;
use keel_raft::error::TransferError;
use keel_raft::metrics::Wait;
use keel_raft::raft::AppendEntriesRequest;
use keel_raft::raft::AppendEntriesResponse;
use keel_raft::raft::ClientWriteRequest;
use keel_raft::raft::InstallSnapshotRequest;
use keel_raft::raft::InstallSnapshotResponse;
use keel_raft::raft::TimeoutNowRequest;
use keel_raft::raft::TimeoutNowResponse;
use keel_raft::raft::VoteRequest;
use keel_raft::raft::VoteResponse;
use keel_raft::storage::RaftStorage;
use keel_raft::Config;
use keel_raft::LogId;
use keel_raft::Membership;
use keel_raft::NodeId;
use keel_raft::Raft;
use keel_raft::RaftMetrics;
use keel_raft::RaftNetwork;
use keel_raft::RaftStorageDebug;
use keel_raft::Role;
use keel_raft::Server;
use keel_raft::State;
use memstore::ClientRequest as MemClientRequest;
use memstore::ClientResponse as MemClientResponse;
use memstore::MemStore;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
#[allow(unused_imports)]
use pretty_assertions::assert_ne;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

/// A concrete Raft type used during testing.
pub type MemRaft = Raft<MemClientRequest, MemClientResponse, RaftRouter, MemStore>;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default()
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::FULL)
        .with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Build a membership config with the given voters and spares, using router addresses.
pub fn membership_of(voters: &BTreeSet<NodeId>, spares: &BTreeSet<NodeId>) -> Membership {
    let mut servers = Vec::new();
    for id in voters {
        servers.push(Server::new(*id, format!("node-{}", id), Role::Voter));
    }
    for id in spares {
        servers.push(Server::new(*id, format!("node-{}", id), Role::Spare));
    }
    Membership::new(servers)
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A type which emulates a network transport and implements the `RaftNetwork` trait.
pub struct RaftRouter {
    /// The Raft runtime config which all nodes are using.
    config: Arc<Config>,
    /// The table of all nodes currently known to this router instance.
    routing_table: RwLock<BTreeMap<NodeId, (MemRaft, Arc<MemStore>)>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: RwLock<HashSet<NodeId>>,
}

impl RaftRouter {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            routing_table: Default::default(),
            isolated_nodes: Default::default(),
        }
    }

    /// Create a cluster from scratch: every listed node's store is bootstrapped with the same
    /// membership config, then all nodes are started. An election follows among the voters.
    pub async fn new_cluster(
        self: &Arc<Self>,
        voters: BTreeSet<NodeId>,
        spares: BTreeSet<NodeId>,
    ) -> Result<()> {
        let membership = membership_of(&voters, &spares);
        for id in voters.iter().chain(spares.iter()) {
            let sto = Arc::new(MemStore::new(*id));
            sto.bootstrap(membership.clone()).await?;
            self.new_raft_node_with_sto(*id, sto).await;
        }
        Ok(())
    }

    /// Create and register a new Raft node bearing the given ID, with a pristine store.
    pub async fn new_raft_node(self: &Arc<Self>, id: NodeId) {
        let memstore = Arc::new(MemStore::new(id));
        self.new_raft_node_with_sto(id, memstore).await
    }

    pub async fn new_raft_node_with_sto(self: &Arc<Self>, id: NodeId, sto: Arc<MemStore>) {
        let node = Raft::new(id, self.config.clone(), self.clone(), sto.clone());
        let mut rt = self.routing_table.write().await;
        rt.insert(id, (node, sto));
    }

    /// Remove the target node from the routing table & isolation.
    pub async fn remove_node(&self, id: NodeId) -> Option<(MemRaft, Arc<MemStore>)> {
        let mut rt = self.routing_table.write().await;
        let opt_handles = rt.remove(&id);
        let mut isolated = self.isolated_nodes.write().await;
        isolated.remove(&id);

        opt_handles
    }

    /// Isolate the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn isolate_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.insert(id);
    }

    /// Restore the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn restore_node(&self, id: NodeId) {
        let mut nodes = self.isolated_nodes.write().await;
        nodes.remove(&id);
    }

    /// Get a payload of the latest metrics from each node in the cluster.
    pub async fn latest_metrics(&self) -> Vec<RaftMetrics> {
        let rt = self.routing_table.read().await;
        let mut metrics = vec![];
        for node in rt.values() {
            metrics.push(node.0.metrics().borrow().clone());
        }
        metrics
    }

    /// Get a handle to the storage backend for the target node.
    pub async fn get_storage_handle(&self, node_id: &NodeId) -> Result<Arc<MemStore>> {
        let rt = self.routing_table.read().await;
        let addr = rt.get(node_id).with_context(|| format!("could not find node {} in routing table", node_id))?;
        let sto = addr.clone().1;
        Ok(sto)
    }

    /// Get a handle to the Raft node bearing the given ID.
    pub async fn get_raft_handle(&self, node_id: &NodeId) -> Result<MemRaft> {
        let rt = self.routing_table.read().await;
        let node = rt.get(node_id).with_context(|| format!("could not find node {} in routing table", node_id))?;
        Ok(node.0.clone())
    }

    pub async fn wait(&self, node_id: &NodeId, timeout: Option<Duration>) -> Result<Wait> {
        let rt = self.routing_table.read().await;
        let node = rt.get(node_id).with_context(|| format!("node {} not found", node_id))?;

        Ok(node.0.wait(timeout))
    }

    /// Wait for metrics until it satisfies some condition.
    #[tracing::instrument(level = "info", skip(self, func))]
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

    /// Wait for the cluster to elect a leader, returning its ID.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_leader(&self, timeout: Duration, msg: &str) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                return Ok(leader);
            }
            if tokio::time::Instant::now() > deadline {
                return Err(anyhow!("timeout waiting for a cluster leader: {}", msg));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Wait for specified nodes until they applied upto `want_log`(inclusive) logs.
    #[tracing::instrument(level = "info", skip(self))]
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

    /// Wait for specified nodes until they applied at least upto `want` logs.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_applied(
        &self,
        node_ids: &BTreeSet<u64>,
        want: u64,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for i in node_ids.iter() {
            self.wait(i, timeout).await?.applied_at_least(want, msg).await?;
        }
        Ok(())
    }

    /// Wait for specified nodes until their state becomes `state`.
    #[tracing::instrument(level = "info", skip(self))]
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

    /// Wait for specified nodes until their snapshot becomes `want`.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_snapshot(
        &self,
        node_ids: &BTreeSet<u64>,
        want: LogId,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for i in node_ids.iter() {
            self.wait(i, timeout).await?.snapshot(want, msg).await?;
        }
        Ok(())
    }

    /// Get the ID of the current leader.
    pub async fn leader(&self) -> Option<NodeId> {
        let isolated = self.isolated_nodes.read().await;
        self.latest_metrics().await.into_iter().find_map(|node| {
            if node.current_leader == Some(node.id) && node.state == State::Leader {
                if isolated.contains(&node.id) {
                    None
                } else {
                    Some(node.id)
                }
            } else {
                None
            }
        })
    }

    /// Submit a barrier to the target node.
    pub async fn barrier(&self, target: NodeId) -> Result<u64, ResponseError> {
        let node = self.get_node(target).await;
        node.barrier().await
    }

    pub async fn add_server(&self, leader: NodeId, target: NodeId) -> Result<u64, ResponseError> {
        let node = self.get_node(leader).await;
        node.add_server(target, format!("node-{}", target)).await
    }

    pub async fn assign_role(&self, leader: NodeId, target: NodeId, role: Role) -> Result<u64, ResponseError> {
        let node = self.get_node(leader).await;
        node.assign_role(target, role).await
    }

    pub async fn remove_server(&self, leader: NodeId, target: NodeId) -> Result<u64, ResponseError> {
        let node = self.get_node(leader).await;
        node.remove_server(target).await
    }

    pub async fn transfer_leadership(&self, leader: NodeId, target: NodeId) -> Result<NodeId, TransferError> {
        let node = self.get_node(leader).await;
        node.transfer_leadership(target).await
    }

    async fn get_node(&self, id: NodeId) -> MemRaft {
        let rt = self.routing_table.read().await;
        rt.get(&id).unwrap_or_else(|| panic!("node with ID {} does not exist", id)).0.clone()
    }

    /// Request the current leader from the target node.
    pub async fn current_leader(&self, target: NodeId) -> Option<NodeId> {
        let node = self.get_node(target).await;
        node.current_leader().await
    }

    /// Send a client request to the target node, causing test failure on error.
    pub async fn client_request(&self, target: NodeId, client_id: &str, serial: u64) {
        let req = MemClientRequest {
            client: client_id.into(),
            serial,
            status: format!("request-{}", serial),
        };
        if let Err(err) = self.send_client_request(target, req).await {
            tracing::error!({error=%err}, "error from client request");
            panic!("{:?}", err)
        }
    }

    /// Send multiple client requests to the target node, one at a time, causing test failure on
    /// error.
    pub async fn client_request_many(&self, target: NodeId, client_id: &str, count: usize) {
        for idx in 0..count {
            self.client_request(target, client_id, idx as u64).await
        }
    }

    /// Send a batch of concurrent client requests to the target node; entries commit in batches
    /// as replication strides over them.
    pub async fn client_request_concurrent(&self, target: NodeId, client_id: &str, count: usize) {
        use futures::stream::FuturesUnordered;
        use futures::StreamExt;

        let mut pending = FuturesUnordered::new();
        for idx in 0..count {
            let node = self.get_node(target).await;
            let req = MemClientRequest {
                client: format!("{}-{}", client_id, idx),
                serial: idx as u64,
                status: format!("request-{}", idx),
            };
            pending.push(async move { node.client_write(ClientWriteRequest::new(req)).await });
        }
        while let Some(res) = pending.next().await {
            if let Err(err) = res {
                panic!("client request failed: {:?}", err)
            }
        }
    }

    /// Send a client request to the target node, returning the result.
    pub async fn try_client_request(
        &self,
        target: NodeId,
        client_id: &str,
        serial: u64,
    ) -> std::result::Result<MemClientResponse, ClientWriteError<MemClientRequest>> {
        let req = MemClientRequest {
            client: client_id.into(),
            serial,
            status: format!("request-{}", serial),
        };
        self.send_client_request(target, req).await
    }

    async fn send_client_request(
        &self,
        target: NodeId,
        req: MemClientRequest,
    ) -> std::result::Result<MemClientResponse, ClientWriteError<MemClientRequest>> {
        let node = self.get_node(target).await;
        node.client_write(ClientWriteRequest::new(req)).await.map(|res| res.data)
    }

    //////////////////////////////////////////////////////////////////////////////////////////////

    /// Assert that the cluster has an elected leader, and is in a stable state with all
    /// non-isolated nodes agreeing on leader, term and log.
    pub async fn assert_stable_cluster(&self, expected_term: Option<u64>, expected_last_log: Option<u64>) {
        let isolated = self.isolated_nodes.read().await;
        let nodes = self.latest_metrics().await;

        let non_isolated_nodes: Vec<_> = nodes.iter().filter(|node| !isolated.contains(&node.id)).collect();
        let leader = non_isolated_nodes
            .iter()
            .find(|node| node.state == State::Leader)
            .expect("expected to find a cluster leader");

        let expected_term = match expected_term {
            Some(term) => term,
            None => leader.current_term,
        };
        let expected_last_log = match expected_last_log {
            Some(idx) => idx,
            None => leader.last_log_index,
        };

        for node in non_isolated_nodes.iter() {
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
                node.last_log_index, expected_last_log,
                "node {} has last_log_index {}, expected {}",
                node.id, node.last_log_index, expected_last_log
            );
        }
    }
}

#[async_trait]
impl RaftNetwork<MemClientRequest> for RaftRouter {
    /// Send an AppendEntries RPC to the target Raft node (§5).
    async fn send_append_entries(
        &self,
        target: u64,
        rpc: AppendEntriesRequest<MemClientRequest>,
    ) -> Result<AppendEntriesResponse> {
        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let addr = rt.get(&target).ok_or_else(|| anyhow!("target node not found in routing table"))?;
        if isolated.contains(&target) || isolated.contains(&rpc.leader_id) {
            // A small delay keeps retry loops from spinning hot against a dead link.
            tokio::time::sleep(Duration::from_millis(10)).await;
            return Err(anyhow!("target node is isolated"));
        }
        let resp = addr.0.append_entries(rpc).await;
        Ok(resp?)
    }

    /// Send a RequestVote RPC to the target Raft node (§5).
    async fn send_vote(&self, target: u64, rpc: VoteRequest) -> Result<VoteResponse> {
        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let addr = rt.get(&target).ok_or_else(|| anyhow!("target node not found in routing table"))?;
        if isolated.contains(&target) || isolated.contains(&rpc.candidate_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            return Err(anyhow!("target node is isolated"));
        }
        Ok(addr.0.vote(rpc).await?)
    }

    /// Send an InstallSnapshot RPC to the target Raft node (§7).
    async fn send_install_snapshot(&self, target: u64, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse> {
        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let addr = rt.get(&target).ok_or_else(|| anyhow!("target node not found in routing table"))?;
        if isolated.contains(&target) || isolated.contains(&rpc.leader_id) {
            // A small delay keeps retry loops from spinning hot against a dead link.
            tokio::time::sleep(Duration::from_millis(10)).await;
            return Err(anyhow!("target node is isolated"));
        }
        Ok(addr.0.install_snapshot(rpc).await?)
    }

    /// Send a TimeoutNow RPC to the target Raft node.
    async fn send_timeout_now(&self, target: u64, rpc: TimeoutNowRequest) -> Result<TimeoutNowResponse> {
        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let addr = rt.get(&target).ok_or_else(|| anyhow!("target node not found in routing table"))?;
        if isolated.contains(&target) || isolated.contains(&rpc.leader_id) {
            // A small delay keeps retry loops from spinning hot against a dead link.
            tokio::time::sleep(Duration::from_millis(10)).await;
            return Err(anyhow!("target node is isolated"));
        }
        Ok(addr.0.timeout_now(rpc).await?)
    }
}

/// Assert that the state machines of the given nodes hold identical contents.
pub async fn assert_state_machines_eq(router: &Arc<RaftRouter>, node_ids: &BTreeSet<NodeId>) -> Result<()> {
    let mut prev: Option<(NodeId, memstore::MemStoreStateMachine)> = None;
    for id in node_ids {
        let sto = router.get_storage_handle(id).await?;
        let sm = sto.get_state_machine().await;
        if let Some((prev_id, prev_sm)) = &prev {
            assert_eq!(
                prev_sm.client_status, sm.client_status,
                "state machines of node {} and {} diverge",
                prev_id, id
            );
            assert_eq!(prev_sm.last_applied_log, sm.last_applied_log);
        }
        prev = Some((*id, sm));
    }
    Ok(())
}
