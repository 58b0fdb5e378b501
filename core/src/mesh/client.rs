// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Long-lived client connection to one peer.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::debug;

use super::protocol::{codec, Request, Response};
use crate::error::{Error, Result};

type Connection = Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec>;

/// One peer connection; reconnects lazily on failure
#[derive(Debug)]
pub struct MeshClient {
    node_id: String,
    address: String,
    connection: Mutex<Option<Connection>>,
    healthy: AtomicBool,
}

impl MeshClient {
    /// Create a client for a peer; the connection is opened on first use
    pub fn new(node_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
            connection: Mutex::new(None),
            healthy: AtomicBool::new(true),
        }
    }

    /// Peer node id
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Peer address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Health flag maintained by the mesh monitor
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Update the health flag
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    /// Issue one request and await its response.
    ///
    /// Requests are serialized per connection; a transport failure drops
    /// the connection so the next call reconnects.
    pub async fn call(&self, request: Request) -> Result<Response> {
        let method = method_name(&request);
        let started = Instant::now();
        let result = self.call_inner(request).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        crate::metrics::rpc_request(method, outcome);
        crate::metrics::rpc_latency(method, started.elapsed().as_secs_f64());
        result
    }

    /// Issue a request bounded by `timeout`
    pub async fn call_with_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<Response> {
        tokio::time::timeout(timeout, self.call(request))
            .await
            .map_err(|_| Error::deadline_exceeded("peer RPC timed out"))?
    }

    async fn call_inner(&self, request: Request) -> Result<Response> {
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            debug!(peer = %self.node_id, address = %self.address, "connecting");
            let stream = TcpStream::connect(&self.address)
                .await
                .map_err(|err| Error::transient(format!("connect {}: {err}", self.address)))?;
            *guard = Some(Framed::new(stream, codec()));
        }
        let connection = guard.as_mut().unwrap();

        let payload = Bytes::from(serde_json::to_vec(&request)?);
        if let Err(err) = connection.send(payload).await {
            *guard = None;
            return Err(Error::transient(format!("send to {}: {err}", self.node_id)));
        }

        match connection.next().await {
            Some(Ok(frame)) => {
                let response: Response = serde_json::from_slice(&frame)?;
                response.into_result()
            }
            Some(Err(err)) => {
                *guard = None;
                Err(Error::transient(format!("read from {}: {err}", self.node_id)))
            }
            None => {
                *guard = None;
                Err(Error::transient(format!("{} closed connection", self.node_id)))
            }
        }
    }
}

fn method_name(request: &Request) -> &'static str {
    match request {
        Request::SubmitJob { .. } => "submit_job",
        Request::GetJobStatus { .. } => "get_job_status",
        Request::StealWork { .. } => "steal_work",
        Request::SubmitWork { .. } => "submit_work",
        Request::QueueDepth => "queue_depth",
        Request::CacheGet { .. } => "cache_get",
        Request::CacheSet { .. } => "cache_set",
        Request::CacheDelete { .. } => "cache_delete",
        Request::GetBlob { .. } => "get_blob",
        Request::PutBlob { .. } => "put_blob",
        Request::HealthCheck { .. } => "health_check",
        Request::RaftRequestVote(_) => "raft_request_vote",
        Request::RaftAppendEntries(_) => "raft_append_entries",
        Request::RaftInstallSnapshot(_) => "raft_install_snapshot",
        Request::Ping => "ping",
    }
}
