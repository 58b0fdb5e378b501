// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Framed RPC protocol between nodes.
//!
//! Length-delimited JSON frames over TCP; one request in flight per
//! connection. Frames are capped at 100 MiB.

use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use crate::coordinator::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply,
    RequestVoteArgs, RequestVoteReply,
};
use crate::engine::{ReplicationJob, TagWorkItem};
use crate::error::ErrorKind;

/// Maximum frame size (100 MiB)
pub const MAX_MESSAGE_BYTES: usize = 100 * 1024 * 1024;

/// Keepalive ping cadence
pub const KEEPALIVE_INTERVAL_SECS: u64 = 30;

/// Keepalive timeout
pub const KEEPALIVE_TIMEOUT_SECS: u64 = 10;

/// Per-peer health check cadence
pub const HEALTH_CHECK_INTERVAL_SECS: u64 = 10;

/// Build the shared frame codec
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_MESSAGE_BYTES)
        .new_codec()
}

/// A request frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    /// Submit a replication job to the receiving node's coordinator
    SubmitJob { job: ReplicationJob },
    /// Fetch a job's current state
    GetJobStatus { job_id: String },
    /// Take up to `max_jobs` items from the receiver's local deque
    StealWork { node_id: String, max_jobs: usize },
    /// Offer a work item to the receiver's local deque
    SubmitWork { item: TagWorkItem },
    /// The receiver's local deque depth
    QueueDepth,
    /// Read from the receiver's cache store
    CacheGet { kind: String, key: String },
    /// Write to the receiver's cache store
    CacheSet {
        kind: String,
        key: String,
        value: Vec<u8>,
        ttl_secs: u64,
    },
    /// Delete from the receiver's cache store
    CacheDelete { kind: String, key: String },
    /// Read a blob range from the receiver
    GetBlob {
        repository: String,
        digest: String,
        offset: u64,
        size: u64,
    },
    /// Store a blob on the receiver
    PutBlob {
        repository: String,
        digest: String,
        data: Vec<u8>,
    },
    /// Liveness probe carrying the sender's identity
    HealthCheck { node_id: String },
    /// Raft vote request
    RaftRequestVote(RequestVoteArgs),
    /// Raft log replication / heartbeat
    RaftAppendEntries(AppendEntriesArgs),
    /// Raft snapshot transfer
    RaftInstallSnapshot(InstallSnapshotArgs),
    /// Transport keepalive
    Ping,
}

/// A response frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    /// Generic success
    Ok,
    /// Job accepted
    JobSubmitted { job_id: String },
    /// Job state, if known
    JobStatus { job: Option<ReplicationJob> },
    /// Items taken from the local deque
    StolenWork { items: Vec<TagWorkItem> },
    /// Local deque depth
    Depth { depth: usize },
    /// Cache read result
    CacheValue { value: Option<Vec<u8>> },
    /// Blob bytes and their digest
    Blob { data: Vec<u8>, digest: String },
    /// Health probe reply
    Health { node_id: String, healthy: bool },
    /// Raft vote reply
    RaftVote(RequestVoteReply),
    /// Raft append reply
    RaftAppend(AppendEntriesReply),
    /// Raft snapshot reply
    RaftSnapshot(InstallSnapshotReply),
    /// Keepalive reply
    Pong,
    /// The request failed; kind is preserved across the wire
    Error { kind: ErrorKind, message: String },
}

impl Response {
    /// Build an error response from a core error
    pub fn from_error(err: &crate::error::Error) -> Self {
        Self::Error {
            kind: err.kind(),
            message: err.message().to_string(),
        }
    }

    /// Convert an error response back into a core error
    pub fn into_result(self) -> crate::error::Result<Response> {
        match self {
            Response::Error { kind, message } => {
                Err(crate::error::Error::new(kind, message))
            }
            other => Ok(other),
        }
    }
}
