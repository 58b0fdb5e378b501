// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Clustered service assembly: wires the coordinator, scheduler, cache,
//! mesh, engine, and HTTP API into one node.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::{self, ApiState, JobRegistry};
use crate::cache::{CacheConfig, DistributedCache};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::{EndpointConfig, ServiceConfig};
use crate::coordinator::{Command, RaftConfig, RaftNode, RaftPeer};
use crate::engine::{EngineConfig, ReplicationEngine, StaticRegistryProvider};
use crate::error::{Error, Result};
use crate::mesh::{
    Mesh, MeshCacheTransport, MeshHandler, MeshPeerClient, MeshRaftTransport,
};
use crate::registry::{HttpRegistryClient, RegistryCredentials};
use crate::resilience::{
    CheckConfig, HealthCheck, HealthChecker, ResilienceConfig, ResilienceManager,
};
use crate::ring::{HashRing, RingNode};
use crate::scheduler::{GlobalQueue, Peer, Scheduler, SchedulerConfig};

/// Checkpoint persistence through the replicated log
pub struct RaftCheckpointStore {
    raft: Arc<RaftNode>,
}

impl RaftCheckpointStore {
    /// Create a store over the coordinator
    pub fn new(raft: Arc<RaftNode>) -> Self {
        Self { raft }
    }
}

#[async_trait]
impl CheckpointStore for RaftCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.raft
            .apply(Command::UpdateCheckpoint {
                checkpoint: checkpoint.clone(),
            })
            .await
    }

    async fn load(&self, id: &str) -> Result<Checkpoint> {
        self.raft
            .get_checkpoint(id)
            .ok_or_else(|| Error::not_found(format!("checkpoint {id} not found")))
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        Ok(self.raft.list_checkpoints())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.raft
            .apply(Command::DeleteCheckpoint { id: id.to_string() })
            .await
    }
}

struct LeaderKnownCheck {
    raft: Arc<RaftNode>,
}

#[async_trait]
impl HealthCheck for LeaderKnownCheck {
    async fn check(&self) -> Result<()> {
        self.raft
            .leader()
            .map(|_| ())
            .ok_or_else(|| Error::transient("no raft leader known"))
    }
}

struct PeerQuorumCheck {
    mesh: Arc<Mesh>,
}

#[async_trait]
impl HealthCheck for PeerQuorumCheck {
    async fn check(&self) -> Result<()> {
        let peers = self.mesh.peers();
        if peers.is_empty() {
            return Ok(());
        }
        let healthy = peers.iter().filter(|p| p.is_healthy()).count();
        if healthy * 2 >= peers.len() {
            Ok(())
        } else {
            Err(Error::transient(format!(
                "only {healthy} of {} peers healthy",
                peers.len()
            )))
        }
    }
}

fn build_registry_client(endpoint: &str, config: &EndpointConfig) -> Result<HttpRegistryClient> {
    let credentials = RegistryCredentials {
        username: config.auth.username.clone(),
        password: config.auth.password.clone(),
        token: config.auth.token.clone(),
    }
    .with_env_fallback();
    HttpRegistryClient::new(endpoint, credentials, config.insecure)
}

/// One clustered freightliner node
pub struct ClusterService {
    config: ServiceConfig,
    mesh: Arc<Mesh>,
    raft: Arc<RaftNode>,
    scheduler: Arc<Scheduler>,
    cache: Arc<DistributedCache>,
    engine: Arc<ReplicationEngine>,
    health: Arc<HealthChecker>,
}

impl ClusterService {
    /// Assemble a node from its configuration
    pub fn new(config: ServiceConfig) -> Result<Self> {
        let node_id = config.node_id.clone();
        let mesh = Mesh::new(node_id.clone());

        // Coordinator over the mesh transport
        let raft_config = config.raft_config();
        let members: Vec<RaftPeer> = if config.peers.is_empty() {
            vec![RaftPeer {
                id: node_id.clone(),
                address: config.mesh_bind.clone(),
            }]
        } else {
            config
                .peers
                .iter()
                .map(|p| RaftPeer {
                    id: p.id.clone(),
                    address: p.address.clone(),
                })
                .collect()
        };
        let transport = Arc::new(MeshRaftTransport::new(
            mesh.clone(),
            raft_config.commit_timeout,
        ));
        let raft = RaftNode::new(
            node_id.clone(),
            &config.data_dir,
            members.clone(),
            transport,
            raft_config,
        )?;

        // Hash ring and cache over every member
        let ring = Arc::new(HashRing::new());
        for member in &members {
            ring.add_node(RingNode::new(member.id.clone(), member.address.clone()))?;
        }
        let cache = Arc::new(DistributedCache::new(
            node_id.clone(),
            ring,
            Arc::new(MeshCacheTransport::new(
                mesh.clone(),
                Duration::from_secs(5),
            )),
            CacheConfig {
                replication: config.cache_replication,
                ..CacheConfig::default()
            },
        ));

        // Scheduler with every other member as a steal peer
        let scheduler = Arc::new(Scheduler::new(
            node_id.clone(),
            Arc::new(GlobalQueue::new()),
            SchedulerConfig {
                local_capacity: config.queue_capacity,
                ..SchedulerConfig::default()
            },
        ));
        for member in members.iter().filter(|m| m.id != node_id) {
            scheduler.add_peer(Arc::new(Peer::new(
                member.id.clone(),
                member.address.clone(),
                config.queue_capacity,
                Arc::new(MeshPeerClient::new(
                    mesh.clone(),
                    member.id.clone(),
                    member.address.clone(),
                )),
            )));
        }

        // Registry clients from configuration
        let provider = StaticRegistryProvider::new();
        for (endpoint, registry_config) in &config.registries {
            provider.insert(Arc::new(build_registry_client(endpoint, registry_config)?));
        }

        let engine = Arc::new(ReplicationEngine::new(
            Arc::new(provider),
            Arc::new(RaftCheckpointStore::new(raft.clone())),
            scheduler.clone(),
            Arc::new(ResilienceManager::new(ResilienceConfig::default())),
            EngineConfig {
                workers: config.workers,
            },
        ));

        let health = Arc::new(HealthChecker::new());
        health.register(
            "coordinator",
            Arc::new(LeaderKnownCheck { raft: raft.clone() }),
            CheckConfig {
                critical: true,
                ..CheckConfig::default()
            },
        );
        health.register(
            "mesh-peers",
            Arc::new(PeerQuorumCheck { mesh: mesh.clone() }),
            CheckConfig::default(),
        );

        Ok(Self {
            config,
            mesh,
            raft,
            scheduler,
            cache,
            engine,
            health,
        })
    }

    /// The coordinator (exposed for tooling)
    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    /// Run until `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(node = %self.config.node_id, "starting clustered service");

        // Mesh server
        let listener = tokio::net::TcpListener::bind(&self.config.mesh_bind).await?;
        let handler = Arc::new(
            MeshHandler::new(self.config.node_id.clone())
                .with_raft(self.raft.clone())
                .with_scheduler(self.scheduler.clone())
                .with_cache(self.cache.clone()),
        );
        {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(err) = crate::mesh::serve(listener, handler, shutdown).await {
                    warn!(%err, "mesh server exited");
                }
            });
        }

        // Outbound connections to every peer
        for peer in self
            .config
            .peers
            .iter()
            .filter(|p| p.id != self.config.node_id)
        {
            self.mesh.connect_to_node(peer.id.clone(), peer.address.clone());
        }

        // Consensus and health loops
        self.raft.start();
        self.health.start(shutdown.clone());

        // Periodic peer depth refresh for the stealer
        {
            let scheduler = self.scheduler.clone();
            let token = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(5));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = token.cancelled() => return,
                    }
                    scheduler.refresh_peer_depths().await;
                }
            });
        }

        // HTTP API
        let api_state = Arc::new(ApiState {
            engine: self.engine.clone(),
            jobs: JobRegistry::Raft(self.raft.clone()),
            health: self.health.clone(),
            shutdown: shutdown.clone(),
        });
        let api_listener = tokio::net::TcpListener::bind(&self.config.api_bind).await?;
        info!(address = %self.config.api_bind, "api listening");
        let router = api::router(api_state);
        let api_shutdown = shutdown.clone();
        axum::serve(api_listener, router)
            .with_graceful_shutdown(async move { api_shutdown.cancelled().await })
            .await?;

        info!("shutting down");
        self.raft.stop();
        self.mesh.stop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_node_service_assembles() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig {
            node_id: "node-1".to_string(),
            mesh_bind: "127.0.0.1:0".to_string(),
            api_bind: "127.0.0.1:0".to_string(),
            data_dir: dir.path().to_string_lossy().to_string(),
            peers: Vec::new(),
            workers: 1,
            queue_capacity: 64,
            cache_replication: 1,
            heartbeat_ms: 50,
            election_ms: 150,
            registries: Default::default(),
        };

        let service = Arc::new(ClusterService::new(config).unwrap());
        let shutdown = CancellationToken::new();

        let runner = service.clone();
        let handle = tokio::spawn(runner.run(shutdown.clone()));

        // A single-node cluster elects itself
        service
            .raft()
            .wait_for_leader(Duration::from_secs(5))
            .await
            .unwrap();
        assert!(service.raft().is_leader());

        shutdown.cancel();
        let _ = handle.await;
    }
}
