// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Work-stealing scheduler
//!
//! Two-level structure: each node owns a bounded local deque (the owner
//! consumes the front lock-free in FIFO order; peers take the back,
//! serialized on the owner side); a shared global queue is the
//! strict-FIFO backstop. Underutilized peers steal from the busiest
//! node's deque through a peer RPC bounded by a 2-second deadline.

pub mod global;
pub mod local;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::engine::TagWorkItem;
use crate::error::Result;
pub use global::GlobalQueue;
pub use local::LocalQueue;

/// Deadline on peer steal/submit RPCs
pub const STEAL_RPC_TIMEOUT: Duration = Duration::from_secs(2);

/// RPC surface a peer node exposes to the scheduler.
///
/// The mesh provides the production implementation; tests supply an
/// in-memory one.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Hand a work item to the peer's local deque
    async fn submit(&self, item: TagWorkItem) -> Result<()>;
    /// Take up to `max` items from the peer's deque tail
    async fn steal(&self, max: usize) -> Result<Vec<TagWorkItem>>;
    /// The peer's current local queue depth
    async fn queue_depth(&self) -> Result<usize>;
}

/// Scheduler view of a peer node
pub struct Peer {
    /// Node identifier
    pub node_id: String,
    /// Network address
    pub address: String,
    /// Declared local deque capacity
    pub capacity: usize,
    observed_depth: AtomicUsize,
    healthy: AtomicBool,
    client: Arc<dyn PeerClient>,
}

impl Peer {
    /// Create a peer descriptor
    pub fn new(
        node_id: impl Into<String>,
        address: impl Into<String>,
        capacity: usize,
        client: Arc<dyn PeerClient>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
            capacity,
            observed_depth: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            client,
        }
    }

    /// Last observed queue depth
    pub fn observed_depth(&self) -> usize {
        self.observed_depth.load(Ordering::Acquire)
    }

    /// Record an observed depth
    pub fn observe_depth(&self, depth: usize) {
        self.observed_depth.store(depth, Ordering::Release);
    }

    /// Health flag maintained by the mesh monitor
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Update the health flag
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }
}

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Local deque bound
    pub local_capacity: usize,
    /// Minimum observed depth on a peer before stealing from it
    pub steal_threshold: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            local_capacity: 1024,
            steal_threshold: 1,
        }
    }
}

/// Two-level work-stealing scheduler for one node
pub struct Scheduler {
    node_id: String,
    local: LocalQueue<TagWorkItem>,
    global: Arc<GlobalQueue<TagWorkItem>>,
    peers: parking_lot::RwLock<Vec<Arc<Peer>>>,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Create a scheduler with its own local deque and a shared global
    /// queue
    pub fn new(
        node_id: impl Into<String>,
        global: Arc<GlobalQueue<TagWorkItem>>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            local: LocalQueue::new(config.local_capacity),
            global,
            peers: parking_lot::RwLock::new(Vec::new()),
            config,
        }
    }

    /// This node's identifier
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Register a peer
    pub fn add_peer(&self, peer: Arc<Peer>) {
        self.peers.write().push(peer);
    }

    /// Drop a peer by node id
    pub fn remove_peer(&self, node_id: &str) {
        self.peers.write().retain(|p| p.node_id != node_id);
    }

    /// Local deque depth (served to peers over the depth RPC)
    pub fn local_depth(&self) -> usize {
        self.local.len()
    }

    /// Serve an incoming steal RPC: pop from this node's deque tail
    pub fn steal_from_local(&self, max: usize) -> Vec<TagWorkItem> {
        self.local.steal(max)
    }

    /// Accept a work item from a peer's submit RPC
    pub fn accept_remote(&self, item: TagWorkItem) -> Result<()> {
        self.local
            .push(item)
            .map_err(|_| crate::error::Error::transient("local queue is full"))
    }

    /// Submit a work item.
    ///
    /// Local deque first; when full, probe peers whose observed depth is
    /// under half their capacity; the global queue is the final backstop.
    /// A job is never dropped without an error.
    pub async fn submit(&self, item: TagWorkItem) -> Result<()> {
        match self.local.push(item) {
            Ok(()) => Ok(()),
            Err(rejected) => self.submit_overflow(rejected).await,
        }
    }

    async fn submit_overflow(&self, item: TagWorkItem) -> Result<()> {
        let peers: Vec<Arc<Peer>> = self.peers.read().clone();
        for peer in &peers {
            if !peer.is_healthy() {
                continue;
            }
            if peer.observed_depth() < peer.capacity / 2 {
                match tokio::time::timeout(STEAL_RPC_TIMEOUT, peer.client.submit(item.clone()))
                    .await
                {
                    Ok(Ok(())) => {
                        peer.observe_depth(peer.observed_depth() + 1);
                        debug!(peer = %peer.node_id, "offloaded work item to peer");
                        return Ok(());
                    }
                    Ok(Err(err)) => {
                        debug!(peer = %peer.node_id, %err, "peer submit failed");
                    }
                    Err(_) => {
                        warn!(peer = %peer.node_id, "peer submit timed out");
                    }
                }
            }
        }
        // Backstop: the global queue guarantees eventual service
        self.global.push(item);
        Ok(())
    }

    /// Owner consumption: local deque front, then one steal attempt, then
    /// the global queue.
    pub async fn next(&self) -> Option<TagWorkItem> {
        if let Some(item) = self.local.pop() {
            return Some(item);
        }

        if let Some(item) = self.try_steal().await {
            return Some(item);
        }

        self.global.pop()
    }

    /// One steal attempt per idle cycle: shuffle peers, target the largest
    /// observed backlog above the threshold.
    async fn try_steal(&self) -> Option<TagWorkItem> {
        let mut peers: Vec<Arc<Peer>> = self.peers.read().clone();
        // Randomized order avoids hot-spotting a single victim
        peers.shuffle(&mut rand::thread_rng());

        let victim = peers
            .into_iter()
            .filter(|p| p.is_healthy())
            .filter(|p| p.observed_depth() > self.config.steal_threshold)
            .max_by_key(|p| p.observed_depth())?;

        match tokio::time::timeout(STEAL_RPC_TIMEOUT, victim.client.steal(1)).await {
            Ok(Ok(mut items)) => {
                victim.observe_depth(victim.observed_depth().saturating_sub(items.len()));
                debug!(peer = %victim.node_id, stolen = items.len(), "steal attempt");
                items.pop()
            }
            Ok(Err(err)) => {
                debug!(peer = %victim.node_id, %err, "steal failed");
                None
            }
            Err(_) => {
                warn!(peer = %victim.node_id, "steal RPC timed out");
                None
            }
        }
    }

    /// Refresh observed depths from live peers (run periodically)
    pub async fn refresh_peer_depths(&self) {
        let peers: Vec<Arc<Peer>> = self.peers.read().clone();
        for peer in peers {
            match tokio::time::timeout(STEAL_RPC_TIMEOUT, peer.client.queue_depth()).await {
                Ok(Ok(depth)) => {
                    peer.observe_depth(depth);
                    peer.set_healthy(true);
                }
                Ok(Err(_)) | Err(_) => peer.set_healthy(false),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(job: &str, tag: &str) -> TagWorkItem {
        TagWorkItem::new(
            job,
            "ecr.example.com",
            "prod/app",
            tag,
            "gcr.example.com",
            "proj/app",
            tag,
        )
    }

    /// Peer client wired directly to another scheduler in memory
    struct DirectPeer {
        target: Arc<Scheduler>,
    }

    #[async_trait]
    impl PeerClient for DirectPeer {
        async fn submit(&self, item: TagWorkItem) -> Result<()> {
            self.target.accept_remote(item)
        }

        async fn steal(&self, max: usize) -> Result<Vec<TagWorkItem>> {
            Ok(self.target.steal_from_local(max))
        }

        async fn queue_depth(&self) -> Result<usize> {
            Ok(self.target.local_depth())
        }
    }

    fn scheduler(id: &str, capacity: usize) -> Arc<Scheduler> {
        Arc::new(Scheduler::new(
            id,
            Arc::new(GlobalQueue::new()),
            SchedulerConfig {
                local_capacity: capacity,
                steal_threshold: 1,
            },
        ))
    }

    #[tokio::test]
    async fn test_local_submit_and_consume() {
        let s = scheduler("n1", 16);
        s.submit(item("j1", "v1")).await.unwrap();
        s.submit(item("j1", "v2")).await.unwrap();

        assert_eq!(s.next().await.unwrap().source_tag, "v1");
        assert_eq!(s.next().await.unwrap().source_tag, "v2");
        assert!(s.next().await.is_none());
    }

    #[tokio::test]
    async fn test_overflow_goes_to_idle_peer() {
        let n1 = scheduler("n1", 1);
        let n2 = scheduler("n2", 16);
        n1.add_peer(Arc::new(Peer::new(
            "n2",
            "n2:7000",
            16,
            Arc::new(DirectPeer { target: n2.clone() }),
        )));

        n1.submit(item("j1", "v1")).await.unwrap();
        n1.submit(item("j1", "v2")).await.unwrap();

        assert_eq!(n1.local_depth(), 1);
        assert_eq!(n2.local_depth(), 1);
    }

    #[tokio::test]
    async fn test_overflow_falls_back_to_global() {
        let n1 = scheduler("n1", 1);
        n1.submit(item("j1", "v1")).await.unwrap();
        n1.submit(item("j1", "v2")).await.unwrap();

        assert_eq!(n1.local_depth(), 1);
        assert_eq!(n1.global.len(), 1);

        // Both are eventually served
        assert!(n1.next().await.is_some());
        assert!(n1.next().await.is_some());
        assert!(n1.next().await.is_none());
    }

    #[tokio::test]
    async fn test_steal_under_imbalance() {
        let busy = scheduler("n1", 256);
        let idle = scheduler("n2", 256);

        for i in 0..100 {
            busy.submit(item("j1", &format!("v{i}"))).await.unwrap();
        }

        let peer = Arc::new(Peer::new(
            "n1",
            "n1:7000",
            256,
            Arc::new(DirectPeer {
                target: busy.clone(),
            }),
        ));
        peer.observe_depth(busy.local_depth());
        idle.add_peer(peer);

        let stolen = idle.next().await;
        assert!(stolen.is_some(), "idle node should steal from the busy one");
        assert_eq!(stolen.unwrap().source_registry, "ecr.example.com");
        assert!(busy.local_depth() < 100);
    }

    #[tokio::test]
    async fn test_unhealthy_peer_not_probed() {
        let n1 = scheduler("n1", 1);
        let n2 = scheduler("n2", 16);
        let peer = Arc::new(Peer::new(
            "n2",
            "n2:7000",
            16,
            Arc::new(DirectPeer { target: n2.clone() }),
        ));
        peer.set_healthy(false);
        n1.add_peer(peer);

        n1.submit(item("j1", "v1")).await.unwrap();
        n1.submit(item("j1", "v2")).await.unwrap();

        // Unhealthy peer skipped; overflow lands on the global queue
        assert_eq!(n2.local_depth(), 0);
        assert_eq!(n1.global.len(), 1);
    }

    #[tokio::test]
    async fn test_no_silent_drop() {
        let s = scheduler("n1", 4);
        let submitted = 50usize;
        for i in 0..submitted {
            s.submit(item("j1", &format!("v{i}"))).await.unwrap();
        }

        let mut drained = 0;
        while s.next().await.is_some() {
            drained += 1;
        }
        assert_eq!(drained, submitted);
    }

    #[tokio::test]
    async fn test_depth_refresh_marks_peers() {
        let n1 = scheduler("n1", 16);
        let n2 = scheduler("n2", 16);
        n2.submit(item("j1", "v1")).await.unwrap();

        let peer = Arc::new(Peer::new(
            "n2",
            "n2:7000",
            16,
            Arc::new(DirectPeer { target: n2.clone() }),
        ));
        n1.add_peer(peer.clone());

        n1.refresh_peer_depths().await;
        assert_eq!(peer.observed_depth(), 1);
        assert!(peer.is_healthy());
    }
}
