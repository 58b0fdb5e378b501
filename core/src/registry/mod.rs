// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Registry adapters
//!
//! Thin seam to OCI-compliant registries. The engine only speaks
//! [`RegistryClient`]; the HTTP implementation covers generic v2 endpoints
//! and the in-memory implementation backs tests and dry runs.

pub mod http;
pub mod memory;
pub mod types;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
pub use http::{HttpRegistryClient, RegistryCredentials};
pub use memory::MemoryRegistry;
pub use types::{
    digest_of, BlobDescriptor, Manifest, RegistryKind, DOCKER_MANIFEST_MEDIA_TYPE,
    MANIFEST_MEDIA_TYPE,
};

/// Client for one registry endpoint
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// The registry endpoint this client talks to
    fn endpoint(&self) -> &str;

    /// Repositories under `prefix` (empty prefix lists everything)
    async fn list_repositories(&self, prefix: &str) -> Result<Vec<String>>;

    /// Tags in a repository
    async fn list_tags(&self, repository: &str) -> Result<Vec<String>>;

    /// Fetch a manifest by tag or digest
    async fn get_manifest(&self, repository: &str, reference: &str) -> Result<Manifest>;

    /// Digest of the manifest a reference points at, without the body;
    /// `None` when the reference does not exist
    async fn manifest_digest(&self, repository: &str, reference: &str)
        -> Result<Option<String>>;

    /// Push a manifest under a reference, preserving its bytes and digest
    async fn put_manifest(&self, repository: &str, reference: &str, manifest: &Manifest)
        -> Result<()>;

    /// Whether a blob exists
    async fn blob_exists(&self, repository: &str, digest: &str) -> Result<bool>;

    /// Fetch a blob
    async fn get_blob(&self, repository: &str, digest: &str) -> Result<Bytes>;

    /// Push a blob under its digest
    async fn put_blob(&self, repository: &str, digest: &str, data: Bytes) -> Result<()>;
}
