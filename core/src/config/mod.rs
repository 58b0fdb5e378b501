// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Configuration: the sync YAML schema and the clustered-service config.
//!
//! Configuration is assembled once at the CLI boundary and threaded through
//! construction; nothing in the core reads global state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::Result;
use crate::registry::RegistryKind;

/// Credentials block for one registry endpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Basic-auth username
    #[serde(default)]
    pub username: Option<String>,
    /// Basic-auth password
    #[serde(default)]
    pub password: Option<String>,
    /// Bearer token
    #[serde(default)]
    pub token: Option<String>,
    /// Use credentials from the local docker config
    #[serde(default)]
    pub use_docker_config: bool,
    /// AWS profile for ECR token exchange
    #[serde(default)]
    pub aws_profile: Option<String>,
    /// Path to GCP credentials for GCR
    #[serde(default)]
    pub gcp_credentials: Option<String>,
}

/// One side of a sync: a registry endpoint and how to reach it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Registry host (e.g. `gcr.io`)
    pub registry: String,
    /// Registry flavor
    #[serde(rename = "type", default)]
    pub kind: RegistryKind,
    /// Credentials
    #[serde(default)]
    pub auth: AuthConfig,
    /// Use plain HTTP
    #[serde(default)]
    pub insecure: bool,
    /// AWS region (ECR)
    #[serde(default)]
    pub region: Option<String>,
    /// GCP project (GCR)
    #[serde(default)]
    pub project: Option<String>,
    /// AWS account id (ECR)
    #[serde(default)]
    pub account: Option<String>,
}

/// Per-image selection within a sync spec
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSyncConfig {
    /// Source repository
    pub repository: String,
    /// Explicit tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Regex over tags
    #[serde(default)]
    pub tag_regex: Option<String>,
    /// Copy every tag
    #[serde(default)]
    pub all_tags: bool,
    /// Cap on tags per repository
    #[serde(default)]
    pub limit: Option<usize>,
    /// Semver constraint over tags
    #[serde(default)]
    pub semver_constraint: Option<String>,
    /// Newest N tags
    #[serde(default)]
    pub latest_n: Option<usize>,
    /// Destination repository override
    #[serde(default)]
    pub destination_repository: Option<String>,
    /// Prefix applied to the destination repository
    #[serde(default)]
    pub destination_prefix: Option<String>,
}

impl ImageSyncConfig {
    /// Resolve the configured selection into a tag filter
    pub fn tag_filter(&self) -> crate::engine::TagFilter {
        use crate::engine::TagFilter;
        if !self.tags.is_empty() {
            TagFilter::Explicit(self.tags.clone())
        } else if let Some(regex) = &self.tag_regex {
            TagFilter::Pattern(regex.clone())
        } else if let Some(constraint) = &self.semver_constraint {
            TagFilter::Semver(constraint.clone())
        } else if let Some(n) = self.latest_n {
            TagFilter::LatestN(n)
        } else {
            TagFilter::All
        }
    }

    /// The destination repository for this image
    pub fn destination(&self) -> String {
        let base = self
            .destination_repository
            .clone()
            .unwrap_or_else(|| self.repository.clone());
        match &self.destination_prefix {
            Some(prefix) => format!("{prefix}{base}"),
            None => base,
        }
    }
}

/// The sync spec loaded from `--config`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Source endpoint
    pub source: EndpointConfig,
    /// Destination endpoint
    pub destination: EndpointConfig,
    /// Concurrent image copies
    #[serde(default = "default_parallel")]
    pub parallel: usize,
    /// Repositories listed per catalog page
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Retry attempts per registry call
    #[serde(default)]
    pub retry_attempts: Option<u32>,
    /// Initial retry backoff in seconds
    #[serde(default)]
    pub retry_backoff: Option<u64>,
    /// Transport hint only; no engine semantics
    #[serde(default)]
    pub enable_deduplication: bool,
    /// Transport hint only; no engine semantics
    #[serde(default)]
    pub enable_http3: bool,
    /// Images to sync
    #[serde(default)]
    pub images: Vec<ImageSyncConfig>,
}

fn default_parallel() -> usize {
    4
}

impl SyncConfig {
    /// Load and validate a sync spec from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.images.is_empty() {
            return Err(crate::error::Error::invalid_input(
                "sync config lists no images",
            ));
        }
        for image in &self.images {
            if image.repository.is_empty() {
                return Err(crate::error::Error::invalid_input(
                    "image entry missing repository",
                ));
            }
        }
        Ok(())
    }
}

/// Raft peer as configured
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Node identifier
    pub id: String,
    /// Mesh address (host:port)
    pub address: String,
}

/// Configuration for the clustered service (`serve`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// This node's identifier
    pub node_id: String,
    /// Mesh bind address
    #[serde(default = "default_mesh_bind")]
    pub mesh_bind: String,
    /// HTTP API bind address
    #[serde(default = "default_api_bind")]
    pub api_bind: String,
    /// Data directory for raft state
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// All cluster members, including this node
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    /// Worker pool size (0 = auto)
    #[serde(default)]
    pub workers: usize,
    /// Local deque capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Cache replication factor
    #[serde(default = "default_replication")]
    pub cache_replication: usize,
    /// Raft heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Raft election timeout in milliseconds
    #[serde(default = "default_election_ms")]
    pub election_ms: u64,
    /// Registry endpoints this node may talk to
    #[serde(default)]
    pub registries: HashMap<String, EndpointConfig>,
}

fn default_mesh_bind() -> String {
    "0.0.0.0:7946".to_string()
}

fn default_api_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_replication() -> usize {
    2
}

fn default_heartbeat_ms() -> u64 {
    1000
}

fn default_election_ms() -> u64 {
    3000
}

impl ServiceConfig {
    /// Load a service config from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// Raft timing derived from this config
    pub fn raft_config(&self) -> crate::coordinator::RaftConfig {
        crate::coordinator::RaftConfig {
            heartbeat_interval: std::time::Duration::from_millis(self.heartbeat_ms),
            election_timeout: std::time::Duration::from_millis(self.election_ms),
            ..crate::coordinator::RaftConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TagFilter;

    const SYNC_YAML: &str = r#"
source:
  registry: 123456789.dkr.ecr.us-east-1.amazonaws.com
  type: ecr
  region: us-east-1
  account: "123456789"
destination:
  registry: gcr.io
  type: gcr
  project: my-project
  auth:
    token: oauth-token
parallel: 8
retry_attempts: 5
enable_deduplication: true
images:
  - repository: prod/app
    tags: [v1.0, v1.1]
  - repository: prod/api
    tag_regex: "^v2\\."
    destination_prefix: "mirror/"
  - repository: prod/worker
    latest_n: 3
"#;

    #[test]
    fn test_sync_yaml_parses() {
        let config: SyncConfig = serde_yaml::from_str(SYNC_YAML).unwrap();
        assert_eq!(config.source.kind, RegistryKind::Ecr);
        assert_eq!(config.destination.kind, RegistryKind::Gcr);
        assert_eq!(config.parallel, 8);
        assert_eq!(config.retry_attempts, Some(5));
        assert!(config.enable_deduplication);
        assert!(!config.enable_http3);
        assert_eq!(config.images.len(), 3);
    }

    #[test]
    fn test_image_tag_filter_precedence() {
        let config: SyncConfig = serde_yaml::from_str(SYNC_YAML).unwrap();
        assert_eq!(
            config.images[0].tag_filter(),
            TagFilter::Explicit(vec!["v1.0".to_string(), "v1.1".to_string()])
        );
        assert_eq!(
            config.images[1].tag_filter(),
            TagFilter::Pattern("^v2\\.".to_string())
        );
        assert_eq!(config.images[2].tag_filter(), TagFilter::LatestN(3));
    }

    #[test]
    fn test_destination_mapping() {
        let config: SyncConfig = serde_yaml::from_str(SYNC_YAML).unwrap();
        assert_eq!(config.images[0].destination(), "prod/app");
        assert_eq!(config.images[1].destination(), "mirror/prod/api");
    }

    #[test]
    fn test_validation_rejects_empty_images() {
        let yaml = r#"
source:
  registry: a.example.com
destination:
  registry: b.example.com
images: []
"#;
        let config: SyncConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_service_config_defaults() {
        let yaml = "node_id: node-1\n";
        let config: ServiceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.mesh_bind, "0.0.0.0:7946");
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.cache_replication, 2);
        assert_eq!(
            config.raft_config().heartbeat_interval,
            std::time::Duration::from_secs(1)
        );
    }
}
