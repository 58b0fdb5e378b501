// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Node mesh
//!
//! Directed fully-connected mesh of long-lived framed-RPC connections with
//! keepalive and per-peer health monitoring. Carries job submission,
//! stealing, cache replication, blob transfer, raft consensus, and health
//! checks.

pub mod client;
pub mod protocol;
pub mod server;
pub mod transport;

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use client::MeshClient;
pub use protocol::{Request, Response, HEALTH_CHECK_INTERVAL_SECS, KEEPALIVE_INTERVAL_SECS,
    KEEPALIVE_TIMEOUT_SECS, MAX_MESSAGE_BYTES};
pub use server::{serve, MeshHandler};
pub use transport::{MeshCacheTransport, MeshPeerClient, MeshRaftTransport};

use crate::error::{Error, Result};

/// Connection manager for all of this node's peers
pub struct Mesh {
    node_id: String,
    clients: DashMap<String, Arc<MeshClient>>,
    shutdown: CancellationToken,
}

impl Mesh {
    /// Create a mesh for this node
    pub fn new(node_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            node_id: node_id.into(),
            clients: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// This node's identifier
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Establish and track a connection to a peer, starting its keepalive
    /// and health monitoring loops
    pub fn connect_to_node(
        self: &Arc<Self>,
        id: impl Into<String>,
        address: impl Into<String>,
    ) -> Arc<MeshClient> {
        let id = id.into();
        if let Some(existing) = self.clients.get(&id) {
            return existing.clone();
        }
        let client = Arc::new(MeshClient::new(id.clone(), address));
        self.clients.insert(id.clone(), client.clone());

        // Keepalive: ping every 30 s, 10 s timeout
        {
            let client = client.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(KEEPALIVE_INTERVAL_SECS));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = shutdown.cancelled() => return,
                    }
                    let outcome = client
                        .call_with_timeout(
                            Request::Ping,
                            Duration::from_secs(KEEPALIVE_TIMEOUT_SECS),
                        )
                        .await;
                    if let Err(err) = outcome {
                        debug!(peer = %client.node_id(), %err, "keepalive failed");
                    }
                }
            });
        }

        // Health monitor: health-check RPC every 10 s
        {
            let client = client.clone();
            let node_id = self.node_id.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(HEALTH_CHECK_INTERVAL_SECS));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = shutdown.cancelled() => return,
                    }
                    let outcome = client
                        .call_with_timeout(
                            Request::HealthCheck {
                                node_id: node_id.clone(),
                            },
                            Duration::from_secs(KEEPALIVE_TIMEOUT_SECS),
                        )
                        .await;
                    match outcome {
                        Ok(Response::Health { healthy, .. }) => client.set_healthy(healthy),
                        Ok(_) | Err(_) => {
                            if client.is_healthy() {
                                warn!(peer = %client.node_id(), "peer marked unhealthy");
                            }
                            client.set_healthy(false);
                        }
                    }
                }
            });
        }

        client
    }

    /// A healthy client for a peer, or an error
    pub fn get_client(&self, id: &str) -> Result<Arc<MeshClient>> {
        let client = self
            .clients
            .get(id)
            .map(|c| c.clone())
            .ok_or_else(|| Error::not_found(format!("no connection to node {id}")))?;
        if !client.is_healthy() {
            return Err(Error::transient(format!("node {id} is unhealthy")));
        }
        Ok(client)
    }

    /// A client for a peer, connecting first if required
    pub fn client_or_connect(
        self: &Arc<Self>,
        id: &str,
        address: &str,
    ) -> Result<Arc<MeshClient>> {
        if let Some(client) = self.clients.get(id) {
            return Ok(client.clone());
        }
        Ok(self.connect_to_node(id, address))
    }

    /// All tracked peers
    pub fn peers(&self) -> Vec<Arc<MeshClient>> {
        self.clients.iter().map(|c| c.value().clone()).collect()
    }

    /// Run `request` concurrently on every healthy peer, gathering errors
    pub async fn broadcast_to_all(&self, request: Request) -> Vec<(String, Result<Response>)> {
        let mut tasks = Vec::new();
        for entry in self.clients.iter() {
            let client = entry.value().clone();
            if !client.is_healthy() {
                continue;
            }
            let request = request.clone();
            tasks.push(tokio::spawn(async move {
                let id = client.node_id().to_string();
                let result = client.call(request).await;
                (id, result)
            }));
        }

        let mut results = Vec::new();
        for task in tasks {
            match task.await {
                Ok(result) => results.push(result),
                Err(err) => warn!(%err, "broadcast task failed"),
            }
        }
        results
    }

    /// Stop keepalive and monitoring loops
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_broadcast_gathers_all_peers() {
        let mut addresses = Vec::new();
        let shutdown = CancellationToken::new();
        for i in 0..3 {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            addresses.push(listener.local_addr().unwrap().to_string());
            let handler = Arc::new(MeshHandler::new(format!("peer-{i}")));
            let token = shutdown.clone();
            tokio::spawn(async move {
                let _ = serve(listener, handler, token).await;
            });
        }

        let mesh = Mesh::new("origin");
        for (i, address) in addresses.iter().enumerate() {
            mesh.connect_to_node(format!("peer-{i}"), address.clone());
        }

        let results = mesh.broadcast_to_all(Request::Ping).await;
        assert_eq!(results.len(), 3);
        for (_, result) in results {
            assert!(matches!(result.unwrap(), Response::Pong));
        }
        mesh.stop();
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_get_client_unknown_peer() {
        let mesh = Mesh::new("origin");
        let err = mesh.get_client("ghost").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
