//! Node registry: the single authority over node status.
//!
//! Every mutation goes through one mutex so that `claim` is a true
//! compare-and-swap across concurrent dispatch attempts. Listing returns
//! cloned snapshots; selection and scoring happen outside the lock.

use crate::error::{MeshError, MeshResult};
use crate::protocol::session::SessionHandle;
use crate::types::{JobId, Node, NodeCapabilities, NodeId, NodeStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Capacity of the eviction broadcast channel
const EVICTION_CHANNEL_CAPACITY: usize = 256;

/// Emitted exactly once when a node moves to Inactive
#[derive(Debug, Clone, PartialEq)]
pub struct Eviction {
    pub node_id: NodeId,
    /// Job the node held at the time of eviction
    pub job_id: Option<JobId>,
    pub reason: String,
}

/// Result of a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatOutcome {
    pub status: NodeStatus,
    /// True when this heartbeat moved the node from Connecting to Active
    pub promoted: bool,
}

struct NodeEntry {
    node: Node,
    last_heartbeat: Instant,
    session: Option<SessionHandle>,
}

/// In-memory table of connected nodes
pub struct NodeRegistry {
    nodes: Mutex<HashMap<NodeId, NodeEntry>>,
    evictions: broadcast::Sender<Eviction>,
    epoch: Instant,
    /// Set once shutdown begins; checked and set under the node lock
    closed: AtomicBool,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        let (evictions, _) = broadcast::channel(EVICTION_CHANNEL_CAPACITY);
        Self {
            nodes: Mutex::new(HashMap::new()),
            evictions,
            epoch: Instant::now(),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NodeId, NodeEntry>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn millis_since_epoch(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.epoch).as_millis() as u64
    }

    /// Listen for evictions. Subscribe before acting on a node to not miss one.
    pub fn subscribe_evictions(&self) -> broadcast::Receiver<Eviction> {
        self.evictions.subscribe()
    }

    /// Register a node without a session. Overwrites any existing entry and
    /// resets it to Connecting.
    pub fn register(&self, node_id: NodeId, capabilities: NodeCapabilities) -> Node {
        let (node, previous) = {
            let mut nodes = self.lock();
            let now_ms = self.millis_since_epoch(Instant::now());
            Self::insert(&mut nodes, node_id, capabilities, None, now_ms)
        };
        self.displaced(&node, previous);
        node
    }

    /// Register a node owned by a live session. A previous session for the
    /// same node id is told to close. Fails once registrations are closed.
    pub fn register_session(
        &self,
        node_id: NodeId,
        capabilities: NodeCapabilities,
        session: SessionHandle,
    ) -> MeshResult<Node> {
        let (node, previous) = {
            let mut nodes = self.lock();
            if self.closed.load(Ordering::SeqCst) {
                return Err(MeshError::ShuttingDown);
            }
            let now_ms = self.millis_since_epoch(Instant::now());
            Self::insert(&mut nodes, node_id, capabilities, Some(session), now_ms)
        };
        self.displaced(&node, previous);
        Ok(node)
    }

    /// Refuse session registrations from now on. Nodes registered before
    /// this call are left to `deactivate_all`.
    pub fn close_registrations(&self) {
        let _nodes = self.lock();
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("node registrations closed");
        }
    }

    fn insert(
        nodes: &mut HashMap<NodeId, NodeEntry>,
        node_id: NodeId,
        capabilities: NodeCapabilities,
        session: Option<SessionHandle>,
        now_ms: u64,
    ) -> (Node, Option<NodeEntry>) {
        let node = Node {
            id: node_id.clone(),
            account_id: capabilities.account_id,
            models: capabilities.models,
            public_key: capabilities.public_key,
            attestation: capabilities.attestation,
            status: NodeStatus::Connecting,
            last_heartbeat_ms: now_ms,
            current_job: None,
            registered_at: chrono::Utc::now(),
        };
        let previous = nodes.insert(
            node_id,
            NodeEntry {
                node: node.clone(),
                last_heartbeat: Instant::now(),
                session,
            },
        );
        (node, previous)
    }

    /// Log a registration and retire the entry it replaced, if any.
    fn displaced(&self, node: &Node, previous: Option<NodeEntry>) {
        let node_id = &node.id;
        let Some(previous) = previous else {
            info!(node_id = %node_id, models = ?node.models, tee = node.is_tee(), "node registered");
            return;
        };
        info!(node_id = %node_id, "node re-registered, replacing previous entry");
        if let Some(old_job) = previous.node.current_job.clone() {
            // The displaced entry's job is lost along with its session.
            let _ = self.evictions.send(Eviction {
                node_id: node_id.clone(),
                job_id: Some(old_job),
                reason: "re-registered".to_string(),
            });
        }
        if let Some(old_session) = previous.session {
            old_session.close("superseded by a new registration");
        }
    }

    /// Record a heartbeat. Connecting nodes are promoted to Active; Inactive
    /// nodes stay Inactive.
    pub fn heartbeat(&self, node_id: &NodeId, ts: Instant) -> MeshResult<HeartbeatOutcome> {
        let ts_ms = self.millis_since_epoch(ts);
        let mut nodes = self.lock();
        let entry = nodes
            .get_mut(node_id)
            .ok_or_else(|| MeshError::NodeNotRegistered(node_id.clone()))?;

        let mut promoted = false;
        match entry.node.status {
            NodeStatus::Inactive => {
                debug!(node_id = %node_id, "ignoring heartbeat from inactive node");
                return Ok(HeartbeatOutcome {
                    status: NodeStatus::Inactive,
                    promoted: false,
                });
            }
            NodeStatus::Connecting => {
                entry.node.status = NodeStatus::Active;
                promoted = true;
            }
            NodeStatus::Active | NodeStatus::Busy => {}
        }
        if ts > entry.last_heartbeat {
            entry.last_heartbeat = ts;
            entry.node.last_heartbeat_ms = ts_ms;
        }
        Ok(HeartbeatOutcome {
            status: entry.node.status,
            promoted,
        })
    }

    /// Active, idle nodes advertising `model`, ordered by node id.
    pub fn list_eligible(&self, model: &str) -> Vec<Node> {
        let mut eligible: Vec<Node> = {
            let nodes = self.lock();
            nodes
                .values()
                .filter(|e| {
                    e.node.status == NodeStatus::Active
                        && e.node.current_job.is_none()
                        && e.node.serves(model)
                })
                .map(|e| e.node.clone())
                .collect()
        };
        eligible.sort_by(|a, b| a.id.cmp(&b.id));
        eligible
    }

    /// Atomically assign `job_id` to the node. Returns false if the node is
    /// not Active or already holds a job.
    pub fn claim(&self, node_id: &NodeId, job_id: &JobId) -> MeshResult<bool> {
        let mut nodes = self.lock();
        let entry = nodes
            .get_mut(node_id)
            .ok_or_else(|| MeshError::NodeNotRegistered(node_id.clone()))?;
        if entry.node.status != NodeStatus::Active || entry.node.current_job.is_some() {
            return Ok(false);
        }
        entry.node.status = NodeStatus::Busy;
        entry.node.current_job = Some(job_id.clone());
        debug!(node_id = %node_id, job_id = %job_id, "node claimed");
        Ok(true)
    }

    /// Clear the node's job and return it to Active. Inactive nodes only have
    /// their job cleared.
    pub fn release(&self, node_id: &NodeId) -> MeshResult<()> {
        let mut nodes = self.lock();
        let entry = nodes
            .get_mut(node_id)
            .ok_or_else(|| MeshError::NodeNotRegistered(node_id.clone()))?;
        entry.node.current_job = None;
        if entry.node.status == NodeStatus::Busy {
            entry.node.status = NodeStatus::Active;
        }
        Ok(())
    }

    /// Release only if the node still holds `job_id`.
    pub fn release_job(&self, node_id: &NodeId, job_id: &JobId) -> bool {
        let mut nodes = self.lock();
        match nodes.get_mut(node_id) {
            Some(entry) if entry.node.current_job.as_ref() == Some(job_id) => {
                entry.node.current_job = None;
                if entry.node.status == NodeStatus::Busy {
                    entry.node.status = NodeStatus::Active;
                }
                true
            }
            _ => false,
        }
    }

    /// Move the node to Inactive. Returns true only for the call that
    /// performed the transition; later calls are no-ops.
    pub fn deactivate(&self, node_id: &NodeId, reason: &str) -> MeshResult<bool> {
        let (eviction, session) = {
            let mut nodes = self.lock();
            let entry = nodes
                .get_mut(node_id)
                .ok_or_else(|| MeshError::NodeNotRegistered(node_id.clone()))?;
            match Self::transition_inactive(entry, reason) {
                Some(eviction) => (eviction, entry.session.clone()),
                None => return Ok(false),
            }
        };
        self.emit(eviction, session, reason);
        Ok(true)
    }

    /// Deactivate only if the entry still belongs to session `session_id`.
    pub fn deactivate_session(&self, node_id: &NodeId, session_id: u64, reason: &str) -> bool {
        let (eviction, session) = {
            let mut nodes = self.lock();
            let entry = match nodes.get_mut(node_id) {
                Some(entry) if Self::owned_by(entry, session_id) => entry,
                _ => return false,
            };
            match Self::transition_inactive(entry, reason) {
                Some(eviction) => (eviction, entry.session.clone()),
                None => return false,
            }
        };
        self.emit(eviction, session, reason);
        true
    }

    /// Deactivate every node that is not already Inactive.
    pub fn deactivate_all(&self, reason: &str) -> Vec<NodeId> {
        let evicted: Vec<(Eviction, Option<SessionHandle>)> = {
            let mut nodes = self.lock();
            nodes
                .values_mut()
                .filter_map(|entry| {
                    Self::transition_inactive(entry, reason)
                        .map(|eviction| (eviction, entry.session.clone()))
                })
                .collect()
        };
        let ids = evicted.iter().map(|(e, _)| e.node_id.clone()).collect();
        for (eviction, session) in evicted {
            self.emit(eviction, session, reason);
        }
        ids
    }

    fn owned_by(entry: &NodeEntry, session_id: u64) -> bool {
        entry
            .session
            .as_ref()
            .map(|s| s.session_id() == session_id)
            .unwrap_or(false)
    }

    fn transition_inactive(entry: &mut NodeEntry, reason: &str) -> Option<Eviction> {
        if entry.node.status == NodeStatus::Inactive {
            return None;
        }
        entry.node.status = NodeStatus::Inactive;
        let job_id = entry.node.current_job.take();
        Some(Eviction {
            node_id: entry.node.id.clone(),
            job_id,
            reason: reason.to_string(),
        })
    }

    fn emit(&self, eviction: Eviction, session: Option<SessionHandle>, reason: &str) {
        warn!(
            node_id = %eviction.node_id,
            job_id = ?eviction.job_id,
            reason,
            "node deactivated"
        );
        if let Some(session) = session {
            session.close(reason);
        }
        // No subscribers is fine.
        let _ = self.evictions.send(eviction);
    }

    /// Remove the entry if it still belongs to session `session_id`.
    pub fn remove_session(&self, node_id: &NodeId, session_id: u64) -> bool {
        let mut nodes = self.lock();
        let owned = nodes
            .get(node_id)
            .map(|entry| Self::owned_by(entry, session_id))
            .unwrap_or(false);
        if owned {
            nodes.remove(node_id);
            debug!(node_id = %node_id, "node removed from registry");
        }
        owned
    }

    /// Non-inactive nodes whose last heartbeat is older than `timeout` at `now`.
    pub fn stale_nodes(&self, now: Instant, timeout: Duration) -> Vec<NodeId> {
        let nodes = self.lock();
        let mut stale: Vec<NodeId> = nodes
            .values()
            .filter(|e| e.node.status != NodeStatus::Inactive)
            .filter(|e| now.saturating_duration_since(e.last_heartbeat) > timeout)
            .map(|e| e.node.id.clone())
            .collect();
        stale.sort();
        stale
    }

    pub fn get(&self, node_id: &NodeId) -> Option<Node> {
        self.lock().get(node_id).map(|e| e.node.clone())
    }

    /// Command handle of the session serving `node_id`.
    pub fn session(&self, node_id: &NodeId) -> Option<SessionHandle> {
        self.lock().get(node_id).and_then(|e| e.session.clone())
    }

    pub fn count_by_status(&self, status: NodeStatus) -> usize {
        self.lock().values().filter(|e| e.node.status == status).count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn caps(models: &[&str]) -> NodeCapabilities {
        NodeCapabilities::for_models("acct", models.iter().copied())
    }

    fn active(registry: &NodeRegistry, id: &str, models: &[&str]) -> NodeId {
        let node_id = NodeId::from(id);
        registry.register(node_id.clone(), caps(models));
        registry.heartbeat(&node_id, Instant::now()).unwrap();
        node_id
    }

    #[tokio::test]
    async fn register_starts_connecting_and_heartbeat_promotes() {
        let registry = NodeRegistry::new();
        let node = registry.register("a".into(), caps(&["llama3"]));
        assert_eq!(node.status, NodeStatus::Connecting);
        assert!(registry.list_eligible("llama3").is_empty());

        let outcome = registry.heartbeat(&"a".into(), Instant::now()).unwrap();
        assert!(outcome.promoted);
        assert_eq!(outcome.status, NodeStatus::Active);
        assert_eq!(registry.list_eligible("llama3").len(), 1);

        let again = registry.heartbeat(&"a".into(), Instant::now()).unwrap();
        assert!(!again.promoted);
    }

    #[tokio::test]
    async fn heartbeat_unknown_node_fails() {
        let registry = NodeRegistry::new();
        let err = registry.heartbeat(&"ghost".into(), Instant::now()).unwrap_err();
        assert_eq!(err, MeshError::NodeNotRegistered("ghost".into()));
    }

    #[tokio::test]
    async fn register_overwrites_and_resets() {
        let registry = NodeRegistry::new();
        let id = active(&registry, "a", &["llama3"]);
        assert!(registry.claim(&id, &"j1".into()).unwrap());

        let node = registry.register(id.clone(), caps(&["mistral"]));
        assert_eq!(node.status, NodeStatus::Connecting);
        assert_eq!(node.current_job, None);
        assert!(!registry.get(&id).unwrap().serves("llama3"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn list_eligible_filters_model_status_and_job() {
        let registry = NodeRegistry::new();
        let a = active(&registry, "a", &["llama3"]);
        active(&registry, "b", &["llama3", "mistral"]);
        active(&registry, "c", &["mistral"]);
        registry.register("d".into(), caps(&["llama3"]));

        let ids: Vec<String> = registry
            .list_eligible("llama3")
            .into_iter()
            .map(|n| n.id.0)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        registry.claim(&a, &"job".into()).unwrap();
        let ids: Vec<String> = registry
            .list_eligible("llama3")
            .into_iter()
            .map(|n| n.id.0)
            .collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let registry = NodeRegistry::new();
        let a = active(&registry, "a", &["llama3"]);
        assert!(registry.claim(&a, &"j1".into()).unwrap());
        assert!(!registry.claim(&a, &"j2".into()).unwrap());
        assert_eq!(registry.get(&a).unwrap().current_job, Some("j1".into()));
        assert!(registry.claim(&"ghost".into(), &"j3".into()).is_err());
    }

    #[tokio::test]
    async fn claim_rejects_connecting_and_inactive() {
        let registry = NodeRegistry::new();
        registry.register("a".into(), caps(&["llama3"]));
        assert!(!registry.claim(&"a".into(), &"j".into()).unwrap());

        let b = active(&registry, "b", &["llama3"]);
        registry.deactivate(&b, "test").unwrap();
        assert!(!registry.claim(&b, &"j".into()).unwrap());
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let registry = Arc::new(NodeRegistry::new());
        let id = active(&registry, "a", &["llama3"]);

        let mut handles = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                registry.claim(&id, &JobId(format!("job-{}", i))).unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn release_returns_node_to_active() {
        let registry = NodeRegistry::new();
        let a = active(&registry, "a", &["llama3"]);
        registry.claim(&a, &"j1".into()).unwrap();
        registry.release(&a).unwrap();
        let node = registry.get(&a).unwrap();
        assert_eq!(node.status, NodeStatus::Active);
        assert_eq!(node.current_job, None);
    }

    #[tokio::test]
    async fn release_job_ignores_other_jobs() {
        let registry = NodeRegistry::new();
        let a = active(&registry, "a", &["llama3"]);
        registry.claim(&a, &"j1".into()).unwrap();
        assert!(!registry.release_job(&a, &"j0".into()));
        assert_eq!(registry.get(&a).unwrap().status, NodeStatus::Busy);
        assert!(registry.release_job(&a, &"j1".into()));
    }

    #[tokio::test]
    async fn deactivate_is_idempotent_with_one_eviction() {
        let registry = NodeRegistry::new();
        let mut evictions = registry.subscribe_evictions();
        let a = active(&registry, "a", &["llama3"]);
        registry.claim(&a, &"j1".into()).unwrap();

        assert!(registry.deactivate(&a, "timeout").unwrap());
        assert!(!registry.deactivate(&a, "timeout").unwrap());

        let eviction = evictions.try_recv().unwrap();
        assert_eq!(eviction.node_id, a);
        assert_eq!(eviction.job_id, Some("j1".into()));
        assert!(evictions.try_recv().is_err());

        let node = registry.get(&a).unwrap();
        assert_eq!(node.status, NodeStatus::Inactive);
        assert_eq!(node.current_job, None);
    }

    #[tokio::test]
    async fn inactive_node_is_never_resurrected_by_heartbeat() {
        let registry = NodeRegistry::new();
        let a = active(&registry, "a", &["llama3"]);
        registry.deactivate(&a, "timeout").unwrap();

        let outcome = registry.heartbeat(&a, Instant::now()).unwrap();
        assert_eq!(outcome.status, NodeStatus::Inactive);
        assert!(registry.list_eligible("llama3").is_empty());

        // Only a fresh registration brings it back.
        registry.register(a.clone(), caps(&["llama3"]));
        registry.heartbeat(&a, Instant::now()).unwrap();
        assert_eq!(registry.list_eligible("llama3").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_nodes_uses_heartbeat_age() {
        let registry = NodeRegistry::new();
        let a = active(&registry, "a", &["llama3"]);
        let b = active(&registry, "b", &["llama3"]);

        tokio::time::advance(Duration::from_secs(20)).await;
        registry.heartbeat(&b, Instant::now()).unwrap();
        tokio::time::advance(Duration::from_secs(15)).await;

        let stale = registry.stale_nodes(Instant::now(), Duration::from_secs(30));
        assert_eq!(stale, vec![a.clone()]);

        registry.deactivate(&a, "timeout").unwrap();
        assert!(registry
            .stale_nodes(Instant::now(), Duration::from_secs(30))
            .is_empty());
    }

    #[tokio::test]
    async fn deactivate_all_reports_each_node_once() {
        let registry = NodeRegistry::new();
        let a = active(&registry, "a", &["llama3"]);
        active(&registry, "b", &["llama3"]);
        registry.deactivate(&a, "timeout").unwrap();

        let evicted = registry.deactivate_all("shutdown");
        assert_eq!(evicted, vec![NodeId::from("b")]);
        assert_eq!(registry.count_by_status(NodeStatus::Inactive), 2);
    }
}
