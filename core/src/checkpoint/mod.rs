// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Checkpoints
//!
//! Persisted progress records enabling resume. The wire format is a
//! portable JSON document; stores are pluggable (file-backed for the CLI,
//! Raft-backed for the clustered service).

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use store::{checkpoint_dir, CheckpointStore, FileCheckpointStore};

/// Per-repository progress within a tree checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoProgress {
    /// Repository name
    pub name: String,
    /// Repository status (pending, running, completed, failed)
    pub status: String,
    /// Tags copied so far
    pub tags_copied: u64,
    /// Tags skipped so far
    pub tags_skipped: u64,
    /// Failure count
    pub errors: u64,
}

/// Portable checkpoint document.
///
/// Invariant: every tag key in `completed` exists in the destination with
/// the same digest as the source had at the moment of copy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    /// Checkpoint identifier (equals the owning job's identifier)
    pub id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Source reference (`registry/repository`)
    pub source: String,
    /// Destination reference
    pub destination: String,
    /// Overall status
    pub status: String,
    /// Repositories discovered at planning time
    pub total_repositories: u64,
    /// Repositories fully completed
    pub completed_repositories: u64,
    /// Repositories with failures
    pub failed_repositories: u64,
    /// Aggregate tags copied
    pub total_tags_copied: u64,
    /// Aggregate tags skipped
    pub total_tags_skipped: u64,
    /// Aggregate failure count
    pub total_errors: u64,
    /// Aggregate blob bytes streamed
    pub total_bytes_transferred: u64,
    /// Per-repository progress
    pub repositories: Vec<RepoProgress>,
    /// The frozen plan: every tag key the job will process
    #[serde(default)]
    pub planned: Vec<String>,
    /// Tag keys confirmed in the destination, in completion order
    #[serde(default)]
    pub completed: Vec<String>,
    /// Tag key → last error message
    #[serde(default)]
    pub failed: BTreeMap<String, String>,
    /// Last update time
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Create an empty checkpoint for a job
    pub fn new(id: impl Into<String>, source: impl Into<String>, destination: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            created_at: now,
            source: source.into(),
            destination: destination.into(),
            status: "pending".to_string(),
            total_repositories: 0,
            completed_repositories: 0,
            failed_repositories: 0,
            total_tags_copied: 0,
            total_tags_skipped: 0,
            total_errors: 0,
            total_bytes_transferred: 0,
            repositories: Vec::new(),
            planned: Vec::new(),
            completed: Vec::new(),
            failed: BTreeMap::new(),
            updated_at: now,
        }
    }

    /// Freeze the planned tag set before any destination I/O
    pub fn set_plan(&mut self, planned: Vec<String>) {
        self.planned = planned;
        self.status = "running".to_string();
        self.updated_at = Utc::now();
    }

    /// Record a completed tag; idempotent under replay
    pub fn mark_completed(&mut self, tag_key: &str, skipped: bool, bytes: u64) {
        if !self.completed.iter().any(|t| t == tag_key) {
            self.completed.push(tag_key.to_string());
        }
        self.failed.remove(tag_key);
        if skipped {
            self.total_tags_skipped += 1;
        } else {
            self.total_tags_copied += 1;
        }
        self.total_bytes_transferred += bytes;
        self.updated_at = Utc::now();
    }

    /// Record a failed tag with its last error
    pub fn mark_failed(&mut self, tag_key: &str, error: impl Into<String>) {
        if self.failed.insert(tag_key.to_string(), error.into()).is_none() {
            self.total_errors += 1;
        }
        self.updated_at = Utc::now();
    }

    /// Tag keys still owed work, honoring resume flags
    pub fn remaining(&self, skip_completed: bool, retry_failed: bool) -> Vec<String> {
        self.planned
            .iter()
            .filter(|tag| {
                let done = self.completed.iter().any(|c| c == *tag);
                let failed = self.failed.contains_key(*tag);
                if done && skip_completed {
                    return false;
                }
                if failed && !retry_failed {
                    return false;
                }
                !done || !skip_completed
            })
            .cloned()
            .collect()
    }

    /// Whether every planned tag completed
    pub fn is_complete(&self) -> bool {
        !self.planned.is_empty()
            && self
                .planned
                .iter()
                .all(|tag| self.completed.iter().any(|c| c == tag))
    }

    /// Update per-repository progress, inserting the record on first sight
    pub fn record_repo(&mut self, name: &str, update: impl FnOnce(&mut RepoProgress)) {
        if let Some(repo) = self.repositories.iter_mut().find(|r| r.name == name) {
            update(repo);
        } else {
            let mut repo = RepoProgress {
                name: name.to_string(),
                status: "running".to_string(),
                tags_copied: 0,
                tags_skipped: 0,
                errors: 0,
            };
            update(&mut repo);
            self.repositories.push(repo);
        }
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint() -> Checkpoint {
        let mut cp = Checkpoint::new("job-1", "ecr/prod", "gcr.io/proj");
        cp.set_plan(vec![
            "prod/app:v1".to_string(),
            "prod/app:v2".to_string(),
            "prod/app:v3".to_string(),
        ]);
        cp
    }

    #[test]
    fn test_wire_round_trip() {
        let mut cp = checkpoint();
        cp.mark_completed("prod/app:v1", false, 1024);
        cp.mark_failed("prod/app:v2", "manifest fetch failed");

        let encoded = serde_json::to_string_pretty(&cp).unwrap();
        let decoded: Checkpoint = serde_json::from_str(&encoded).unwrap();
        assert_eq!(cp, decoded);
    }

    #[test]
    fn test_remaining_honors_resume_flags() {
        let mut cp = checkpoint();
        cp.mark_completed("prod/app:v1", false, 0);
        cp.mark_failed("prod/app:v2", "boom");

        // Default resume: skip completed, leave failed alone
        let remaining = cp.remaining(true, false);
        assert_eq!(remaining, vec!["prod/app:v3".to_string()]);

        // Retry failed as well
        let remaining = cp.remaining(true, true);
        assert_eq!(
            remaining,
            vec!["prod/app:v2".to_string(), "prod/app:v3".to_string()]
        );
    }

    #[test]
    fn test_completion_requires_full_plan() {
        let mut cp = checkpoint();
        assert!(!cp.is_complete());

        cp.mark_completed("prod/app:v1", false, 0);
        cp.mark_completed("prod/app:v2", true, 0);
        assert!(!cp.is_complete());

        cp.mark_completed("prod/app:v3", false, 0);
        assert!(cp.is_complete());
    }

    #[test]
    fn test_replaying_completion_is_idempotent() {
        let mut cp = checkpoint();
        cp.mark_completed("prod/app:v1", false, 10);
        cp.mark_completed("prod/app:v1", false, 10);

        assert_eq!(cp.completed.iter().filter(|t| *t == "prod/app:v1").count(), 1);
    }

    #[test]
    fn test_failure_then_success_clears_error() {
        let mut cp = checkpoint();
        cp.mark_failed("prod/app:v1", "first try");
        cp.mark_completed("prod/app:v1", false, 0);

        assert!(!cp.failed.contains_key("prod/app:v1"));
        assert_eq!(cp.total_errors, 1);
    }

    #[test]
    fn test_repo_progress_upsert() {
        let mut cp = checkpoint();
        cp.record_repo("prod/app", |r| r.tags_copied += 1);
        cp.record_repo("prod/app", |r| r.tags_copied += 1);

        assert_eq!(cp.repositories.len(), 1);
        assert_eq!(cp.repositories[0].tags_copied, 2);
    }
}
