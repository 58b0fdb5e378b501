// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core types for replication jobs and work items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Job identifier
pub type JobId = String;

/// Node identifier
pub type NodeId = String;

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is awaiting planning or execution
    Pending,
    /// Job is currently executing
    Running,
    /// Job finished with every work item copied or skipped
    Completed,
    /// Job finished with recorded failures
    Failed,
    /// Job was cancelled
    Cancelled,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A registry-plus-repository reference, optionally a prefix covering a
/// whole tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    /// Registry endpoint (e.g. `gcr.io`, `123456789.dkr.ecr.us-east-1.amazonaws.com`)
    pub registry: String,
    /// Repository name or prefix
    pub repository: String,
}

impl RepoRef {
    /// Create a reference
    pub fn new(registry: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            registry: registry.into(),
            repository: repository.into(),
        }
    }

    /// Parse `registry/repo/path` into a reference
    pub fn parse(input: &str) -> crate::error::Result<Self> {
        match input.split_once('/') {
            Some((registry, repository)) if !registry.is_empty() && !repository.is_empty() => {
                Ok(Self::new(registry, repository))
            }
            _ => Err(crate::error::Error::invalid_input(format!(
                "expected <registry>/<repository>, got {input:?}"
            ))),
        }
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)
    }
}

/// How tags are selected for a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TagFilter {
    /// Every tag in the repository
    #[default]
    All,
    /// An explicit tag list
    Explicit(Vec<String>),
    /// Tags matching a regular expression
    Pattern(String),
    /// Tags satisfying a semver constraint
    Semver(String),
    /// The newest N tags by semver order (lexicographic fallback)
    LatestN(usize),
}

/// A replication job at repository or tree granularity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationJob {
    /// Unique identifier
    pub id: JobId,
    /// What kind of request produced the job (`replicate`,
    /// `replicate-tree`, `sync`)
    #[serde(default = "default_job_type")]
    pub job_type: String,
    /// Source registry + repository prefix
    pub source: RepoRef,
    /// Destination registry + repository prefix
    pub destination: RepoRef,
    /// Tag selection
    pub tag_filter: TagFilter,
    /// Copy even when the destination digest already matches
    pub force: bool,
    /// Plan without writing to the destination
    pub dry_run: bool,
    /// Scheduling priority (higher first)
    pub priority: i32,
    /// Node the coordinator assigned
    pub assigned_node: Option<NodeId>,
    /// Current status
    pub status: JobStatus,
    /// Attempts so far
    pub retry_count: u32,
    /// Submission time
    pub submitted_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

fn default_job_type() -> String {
    "replicate".to_string()
}

impl ReplicationJob {
    /// Create a pending job with a fresh identifier
    pub fn new(source: RepoRef, destination: RepoRef, tag_filter: TagFilter) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: default_job_type(),
            source,
            destination,
            tag_filter,
            force: false,
            dry_run: false,
            priority: 0,
            assigned_node: None,
            status: JobStatus::Pending,
            retry_count: 0,
            submitted_at: now,
            updated_at: now,
        }
    }

    /// Mark a status change, bumping the update time
    pub fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// The smallest schedulable piece of a job: one tag copy.
///
/// Completing the same work item twice leaves the destination in the same
/// state (idempotent under replay).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagWorkItem {
    /// Parent job
    pub job_id: JobId,
    /// Source registry endpoint
    pub source_registry: String,
    /// Source repository
    pub source_repository: String,
    /// Source tag
    pub source_tag: String,
    /// Destination registry endpoint
    pub dest_registry: String,
    /// Destination repository
    pub dest_repository: String,
    /// Destination tag
    pub dest_tag: String,
    /// Attempts so far
    pub retry_count: u32,
    /// Absolute deadline, if any
    pub deadline: Option<DateTime<Utc>>,
}

impl TagWorkItem {
    /// Create a work item copying `source_tag` to `dest_tag`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: impl Into<String>,
        source_registry: impl Into<String>,
        source_repository: impl Into<String>,
        source_tag: impl Into<String>,
        dest_registry: impl Into<String>,
        dest_repository: impl Into<String>,
        dest_tag: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            source_registry: source_registry.into(),
            source_repository: source_repository.into(),
            source_tag: source_tag.into(),
            dest_registry: dest_registry.into(),
            dest_repository: dest_repository.into(),
            dest_tag: dest_tag.into(),
            retry_count: 0,
            deadline: None,
        }
    }

    /// Stable identifier for checkpointing: `repository:tag`
    pub fn tag_key(&self) -> String {
        format!("{}:{}", self.source_repository, self.source_tag)
    }

    /// Bound the copy by an absolute deadline
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Aggregate result of one replication run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationResult {
    /// Tags copied to the destination
    pub tags_copied: u64,
    /// Tags skipped because the destination already matched
    pub tags_skipped: u64,
    /// Tags that failed after all retries
    pub errors: u64,
    /// Blob bytes streamed
    pub bytes_transferred: u64,
}

impl ReplicationResult {
    /// Fold another result into this one
    pub fn merge(&mut self, other: &ReplicationResult) {
        self.tags_copied += other.tags_copied;
        self.tags_skipped += other.tags_skipped;
        self.errors += other.errors;
        self.bytes_transferred += other.bytes_transferred;
    }
}

/// Strongly-typed options for tree replication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeReplicationOptions {
    /// Worker pool size (0 = auto)
    pub workers: usize,
    /// Repositories to exclude (by suffix under the source prefix)
    pub exclude_repositories: Vec<String>,
    /// Tags to exclude
    pub exclude_tags: Vec<String>,
    /// Tags to include (empty = all)
    pub include_tags: Vec<String>,
    /// Plan without writing to the destination
    pub dry_run: bool,
    /// Copy even when the destination digest already matches
    pub force: bool,
    /// Persist progress for resume
    pub enable_checkpoint: bool,
    /// Checkpoint directory override
    pub checkpoint_dir: Option<String>,
    /// Resume from this checkpoint
    pub resume_id: Option<String>,
    /// On resume, do not re-copy tags already completed
    pub skip_completed: bool,
    /// On resume, re-queue tags that previously failed
    pub retry_failed: bool,
}

impl Default for TreeReplicationOptions {
    fn default() -> Self {
        Self {
            workers: 0,
            exclude_repositories: Vec::new(),
            exclude_tags: Vec::new(),
            include_tags: Vec::new(),
            dry_run: false,
            force: false,
            enable_checkpoint: false,
            checkpoint_dir: None,
            resume_id: None,
            skip_completed: true,
            retry_failed: false,
        }
    }
}
