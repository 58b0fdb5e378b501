// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Request and response bodies for the HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::ReplicationJob;

/// Body of `POST /api/v1/replicate`
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicateRequest {
    pub source_registry: String,
    pub source_repo: String,
    pub dest_registry: String,
    pub dest_repo: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub dry_run: bool,
}

/// Body of `POST /api/v1/replicate-tree`
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicateTreeRequest {
    pub source_registry: String,
    pub source_repo: String,
    pub dest_registry: String,
    pub dest_repo: String,
    #[serde(default)]
    pub exclude_repos: Vec<String>,
    #[serde(default)]
    pub exclude_tags: Vec<String>,
    #[serde(default)]
    pub include_tags: Vec<String>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub enable_checkpoint: bool,
    #[serde(default)]
    pub checkpoint_dir: Option<String>,
    #[serde(default)]
    pub resume_id: Option<String>,
}

/// `202 Accepted` body for job submissions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAccepted {
    pub job_id: String,
    pub status: String,
}

/// One row of `GET /api/v1/jobs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: String,
    pub job_type: String,
    pub source: String,
    pub destination: String,
    pub status: String,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&ReplicationJob> for JobSummary {
    fn from(job: &ReplicationJob) -> Self {
        Self {
            id: job.id.clone(),
            job_type: job.job_type.clone(),
            source: job.source.to_string(),
            destination: job.destination.to_string(),
            status: job.status.to_string(),
            submitted_at: job.submitted_at,
            updated_at: job.updated_at,
        }
    }
}

/// Query parameters of `GET /api/v1/jobs`
#[derive(Debug, Clone, Deserialize, Default)]
pub struct JobListQuery {
    #[serde(rename = "type", default)]
    pub job_type: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Error body with a stable kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
}
