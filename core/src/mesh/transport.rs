// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Mesh-backed implementations of the scheduler, raft, and cache
//! transport seams.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

use super::protocol::{Request, Response};
use super::Mesh;
use crate::cache::{CacheTransport, StoreKind};
use crate::coordinator::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply,
    RaftPeer, RaftTransport, RequestVoteArgs, RequestVoteReply,
};
use crate::engine::TagWorkItem;
use crate::error::{Error, Result};
use crate::ring::RingNode;
use crate::scheduler::{PeerClient, STEAL_RPC_TIMEOUT};

fn unexpected(response: Response) -> Error {
    Error::internal(format!("unexpected mesh response {response:?}"))
}

/// Scheduler peer RPCs over the mesh
pub struct MeshPeerClient {
    mesh: Arc<Mesh>,
    peer_id: String,
    peer_address: String,
}

impl MeshPeerClient {
    /// Create a peer client addressed by node id
    pub fn new(mesh: Arc<Mesh>, peer_id: impl Into<String>, peer_address: impl Into<String>) -> Self {
        Self {
            mesh,
            peer_id: peer_id.into(),
            peer_address: peer_address.into(),
        }
    }
}

#[async_trait]
impl PeerClient for MeshPeerClient {
    async fn submit(&self, item: TagWorkItem) -> Result<()> {
        let client = self.mesh.client_or_connect(&self.peer_id, &self.peer_address)?;
        match client
            .call_with_timeout(Request::SubmitWork { item }, STEAL_RPC_TIMEOUT)
            .await?
        {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn steal(&self, max: usize) -> Result<Vec<TagWorkItem>> {
        let client = self.mesh.client_or_connect(&self.peer_id, &self.peer_address)?;
        match client
            .call_with_timeout(
                Request::StealWork {
                    node_id: self.mesh.node_id().to_string(),
                    max_jobs: max,
                },
                STEAL_RPC_TIMEOUT,
            )
            .await?
        {
            Response::StolenWork { items } => Ok(items),
            other => Err(unexpected(other)),
        }
    }

    async fn queue_depth(&self) -> Result<usize> {
        let client = self.mesh.client_or_connect(&self.peer_id, &self.peer_address)?;
        match client
            .call_with_timeout(Request::QueueDepth, STEAL_RPC_TIMEOUT)
            .await?
        {
            Response::Depth { depth } => Ok(depth),
            other => Err(unexpected(other)),
        }
    }
}

/// Raft RPCs over the mesh
pub struct MeshRaftTransport {
    mesh: Arc<Mesh>,
    rpc_timeout: Duration,
}

impl MeshRaftTransport {
    /// Create a transport; `rpc_timeout` bounds each call
    pub fn new(mesh: Arc<Mesh>, rpc_timeout: Duration) -> Self {
        Self { mesh, rpc_timeout }
    }
}

#[async_trait]
impl RaftTransport for MeshRaftTransport {
    async fn request_vote(
        &self,
        target: &RaftPeer,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply> {
        let client = self.mesh.client_or_connect(&target.id, &target.address)?;
        match client
            .call_with_timeout(Request::RaftRequestVote(args), self.rpc_timeout)
            .await?
        {
            Response::RaftVote(reply) => Ok(reply),
            other => Err(unexpected(other)),
        }
    }

    async fn append_entries(
        &self,
        target: &RaftPeer,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply> {
        let client = self.mesh.client_or_connect(&target.id, &target.address)?;
        match client
            .call_with_timeout(Request::RaftAppendEntries(args), self.rpc_timeout)
            .await?
        {
            Response::RaftAppend(reply) => Ok(reply),
            other => Err(unexpected(other)),
        }
    }

    async fn install_snapshot(
        &self,
        target: &RaftPeer,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotReply> {
        let client = self.mesh.client_or_connect(&target.id, &target.address)?;
        match client
            .call_with_timeout(Request::RaftInstallSnapshot(args), self.rpc_timeout)
            .await?
        {
            Response::RaftSnapshot(reply) => Ok(reply),
            other => Err(unexpected(other)),
        }
    }
}

/// Cache replication RPCs over the mesh
pub struct MeshCacheTransport {
    mesh: Arc<Mesh>,
    rpc_timeout: Duration,
}

impl MeshCacheTransport {
    /// Create a transport; `rpc_timeout` bounds each call
    pub fn new(mesh: Arc<Mesh>, rpc_timeout: Duration) -> Self {
        Self { mesh, rpc_timeout }
    }
}

#[async_trait]
impl CacheTransport for MeshCacheTransport {
    async fn get(&self, node: &RingNode, kind: StoreKind, key: &str) -> Result<Option<Bytes>> {
        let client = self.mesh.client_or_connect(&node.id, &node.address)?;
        match client
            .call_with_timeout(
                Request::CacheGet {
                    kind: kind.to_string(),
                    key: key.to_string(),
                },
                self.rpc_timeout,
            )
            .await?
        {
            Response::CacheValue { value } => Ok(value.map(Bytes::from)),
            other => Err(unexpected(other)),
        }
    }

    async fn put(
        &self,
        node: &RingNode,
        kind: StoreKind,
        key: &str,
        payload: Bytes,
        ttl: Duration,
    ) -> Result<()> {
        let client = self.mesh.client_or_connect(&node.id, &node.address)?;
        match client
            .call_with_timeout(
                Request::CacheSet {
                    kind: kind.to_string(),
                    key: key.to_string(),
                    value: payload.to_vec(),
                    ttl_secs: ttl.as_secs(),
                },
                self.rpc_timeout,
            )
            .await?
        {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn delete(&self, node: &RingNode, kind: StoreKind, key: &str) -> Result<()> {
        let client = self.mesh.client_or_connect(&node.id, &node.address)?;
        match client
            .call_with_timeout(
                Request::CacheDelete {
                    kind: kind.to_string(),
                    key: key.to_string(),
                },
                self.rpc_timeout,
            )
            .await?
        {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}
