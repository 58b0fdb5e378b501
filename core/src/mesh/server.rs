// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Server side of the mesh: dispatches incoming frames to the node's
//! subsystems.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{codec, Request, Response};
use crate::cache::{DistributedCache, StoreKind};
use crate::coordinator::{Command, RaftNode};
use crate::engine::JobStatus;
use crate::error::{Error, Result};
use crate::scheduler::Scheduler;

/// Dispatches requests to whichever subsystems this node runs
pub struct MeshHandler {
    node_id: String,
    raft: Option<Arc<RaftNode>>,
    scheduler: Option<Arc<Scheduler>>,
    cache: Option<Arc<DistributedCache>>,
}

impl MeshHandler {
    /// Create a handler for this node
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            raft: None,
            scheduler: None,
            cache: None,
        }
    }

    /// Attach the coordinator
    pub fn with_raft(mut self, raft: Arc<RaftNode>) -> Self {
        self.raft = Some(raft);
        self
    }

    /// Attach the scheduler
    pub fn with_scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Attach the distributed cache
    pub fn with_cache(mut self, cache: Arc<DistributedCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Handle one request
    pub async fn handle(&self, request: Request) -> Response {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(err) => Response::from_error(&err),
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Response> {
        match request {
            Request::Ping => Ok(Response::Pong),
            Request::HealthCheck { node_id } => {
                debug!(from = %node_id, "health check");
                Ok(Response::Health {
                    node_id: self.node_id.clone(),
                    healthy: true,
                })
            }
            Request::SubmitJob { mut job } => {
                let raft = self
                    .raft
                    .as_ref()
                    .ok_or_else(|| Error::internal("coordinator not running"))?;
                job.set_status(JobStatus::Pending);
                let job_id = job.id.clone();
                raft.apply(Command::CreateJob { job }).await?;
                Ok(Response::JobSubmitted { job_id })
            }
            Request::GetJobStatus { job_id } => {
                let raft = self
                    .raft
                    .as_ref()
                    .ok_or_else(|| Error::internal("coordinator not running"))?;
                Ok(Response::JobStatus {
                    job: raft.get_job(&job_id),
                })
            }
            Request::StealWork { node_id, max_jobs } => {
                let scheduler = self
                    .scheduler
                    .as_ref()
                    .ok_or_else(|| Error::internal("scheduler not running"))?;
                let items = scheduler.steal_from_local(max_jobs);
                debug!(thief = %node_id, stolen = items.len(), "served steal");
                Ok(Response::StolenWork { items })
            }
            Request::SubmitWork { item } => {
                let scheduler = self
                    .scheduler
                    .as_ref()
                    .ok_or_else(|| Error::internal("scheduler not running"))?;
                scheduler.accept_remote(item)?;
                Ok(Response::Ok)
            }
            Request::QueueDepth => {
                let scheduler = self
                    .scheduler
                    .as_ref()
                    .ok_or_else(|| Error::internal("scheduler not running"))?;
                Ok(Response::Depth {
                    depth: scheduler.local_depth(),
                })
            }
            Request::CacheGet { kind, key } => {
                let cache = self
                    .cache
                    .as_ref()
                    .ok_or_else(|| Error::internal("cache not running"))?;
                let store = cache.local_store(parse_kind(&kind)?);
                Ok(Response::CacheValue {
                    value: store.get(&key).map(|b| b.to_vec()),
                })
            }
            Request::CacheSet {
                kind,
                key,
                value,
                ttl_secs,
            } => {
                let cache = self
                    .cache
                    .as_ref()
                    .ok_or_else(|| Error::internal("cache not running"))?;
                let store = cache.local_store(parse_kind(&kind)?);
                store.put_with_ttl(key, Bytes::from(value), Duration::from_secs(ttl_secs));
                Ok(Response::Ok)
            }
            Request::CacheDelete { kind, key } => {
                let cache = self
                    .cache
                    .as_ref()
                    .ok_or_else(|| Error::internal("cache not running"))?;
                cache.local_store(parse_kind(&kind)?).delete(&key);
                Ok(Response::Ok)
            }
            Request::GetBlob {
                repository: _,
                digest,
                offset,
                size,
            } => {
                let cache = self
                    .cache
                    .as_ref()
                    .ok_or_else(|| Error::internal("cache not running"))?;
                let key = crate::cache::blob_key(&digest);
                let found = cache
                    .local_store(StoreKind::Blobs)
                    .get(&key)
                    .ok_or_else(|| Error::not_found(format!("blob {digest} not cached")))?;
                let start = (offset as usize).min(found.len());
                let end = if size == 0 {
                    found.len()
                } else {
                    (start + size as usize).min(found.len())
                };
                Ok(Response::Blob {
                    data: found[start..end].to_vec(),
                    digest,
                })
            }
            Request::PutBlob {
                repository: _,
                digest,
                data,
            } => {
                let cache = self
                    .cache
                    .as_ref()
                    .ok_or_else(|| Error::internal("cache not running"))?;
                let key = crate::cache::blob_key(&digest);
                cache
                    .local_store(StoreKind::Blobs)
                    .put(key, Bytes::from(data));
                Ok(Response::Ok)
            }
            Request::RaftRequestVote(args) => {
                let raft = self
                    .raft
                    .as_ref()
                    .ok_or_else(|| Error::internal("coordinator not running"))?;
                Ok(Response::RaftVote(raft.handle_request_vote(args)))
            }
            Request::RaftAppendEntries(args) => {
                let raft = self
                    .raft
                    .as_ref()
                    .ok_or_else(|| Error::internal("coordinator not running"))?;
                Ok(Response::RaftAppend(raft.handle_append_entries(args)))
            }
            Request::RaftInstallSnapshot(args) => {
                let raft = self
                    .raft
                    .as_ref()
                    .ok_or_else(|| Error::internal("coordinator not running"))?;
                Ok(Response::RaftSnapshot(raft.handle_install_snapshot(args)))
            }
        }
    }
}

fn parse_kind(kind: &str) -> Result<StoreKind> {
    match kind {
        "manifests" => Ok(StoreKind::Manifests),
        "blobs" => Ok(StoreKind::Blobs),
        "tags" => Ok(StoreKind::Tags),
        other => Err(Error::invalid_input(format!("unknown cache store {other:?}"))),
    }
}

/// Accept loop serving mesh RPCs until shutdown
pub async fn serve(
    listener: TcpListener,
    handler: Arc<MeshHandler>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(address = %listener.local_addr()?, "mesh listening");
    loop {
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.cancelled() => return Ok(()),
        };
        debug!(%peer_addr, "mesh connection accepted");

        let handler = handler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut framed = Framed::new(stream, codec());
            loop {
                let frame = tokio::select! {
                    frame = framed.next() => frame,
                    _ = shutdown.cancelled() => return,
                };
                let Some(frame) = frame else { return };
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(%peer_addr, %err, "mesh frame error");
                        return;
                    }
                };

                let response = match serde_json::from_slice::<Request>(&frame) {
                    Ok(request) => handler.handle(request).await,
                    Err(err) => Response::Error {
                        kind: crate::error::ErrorKind::InvalidInput,
                        message: format!("malformed frame: {err}"),
                    },
                };

                let payload = match serde_json::to_vec(&response) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(%err, "response serialization failed");
                        return;
                    }
                };
                if framed.send(Bytes::from(payload)).await.is_err() {
                    return;
                }
            }
        });
    }
}
