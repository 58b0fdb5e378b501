// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! In-memory registry backing tests and dry-run planning.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::types::Manifest;
use super::RegistryClient;
use crate::error::{Error, Result};

/// A fully in-memory OCI registry
pub struct MemoryRegistry {
    endpoint: String,
    /// repository → (tag → manifest)
    manifests: DashMap<String, DashMap<String, Manifest>>,
    /// (repository, digest) → blob
    blobs: DashMap<(String, String), Bytes>,
    push_count: AtomicU64,
}

impl MemoryRegistry {
    /// Create an empty registry with the given endpoint name
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            manifests: DashMap::new(),
            blobs: DashMap::new(),
            push_count: AtomicU64::new(0),
        }
    }

    /// Seed a tag with a manifest (test setup)
    pub fn seed_manifest(&self, repository: &str, tag: &str, manifest: Manifest) {
        self.manifests
            .entry(repository.to_string())
            .or_default()
            .insert(tag.to_string(), manifest);
    }

    /// Seed a blob (test setup)
    pub fn seed_blob(&self, repository: &str, digest: &str, data: Bytes) {
        self.blobs
            .insert((repository.to_string(), digest.to_string()), data);
    }

    /// Manifest pushes observed (test assertion surface)
    pub fn push_count(&self) -> u64 {
        self.push_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RegistryClient for MemoryRegistry {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn list_repositories(&self, prefix: &str) -> Result<Vec<String>> {
        let mut repos: Vec<String> = self
            .manifests
            .iter()
            .map(|e| e.key().clone())
            .filter(|r| r.starts_with(prefix))
            .collect();
        repos.sort();
        Ok(repos)
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let repo = self
            .manifests
            .get(repository)
            .ok_or_else(|| Error::not_found(format!("repository {repository} not found")))?;
        let mut tags: Vec<String> = repo.iter().map(|e| e.key().clone()).collect();
        tags.sort();
        Ok(tags)
    }

    async fn get_manifest(&self, repository: &str, reference: &str) -> Result<Manifest> {
        let repo = self
            .manifests
            .get(repository)
            .ok_or_else(|| Error::not_found(format!("repository {repository} not found")))?;
        if let Some(found) = repo.get(reference) {
            return Ok(found.clone());
        }
        // Digest references resolve against any tag
        let result = repo
            .iter()
            .find(|e| e.value().digest == reference)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::not_found(format!("{repository}:{reference} not found")));
        result
    }

    async fn manifest_digest(&self, repository: &str, reference: &str)
        -> Result<Option<String>> {
        let Some(repo) = self.manifests.get(repository) else {
            return Ok(None);
        };
        Ok(repo.get(reference).map(|m| m.digest.clone()))
    }

    async fn put_manifest(&self, repository: &str, reference: &str, manifest: &Manifest)
        -> Result<()> {
        self.push_count.fetch_add(1, Ordering::Relaxed);
        self.manifests
            .entry(repository.to_string())
            .or_default()
            .insert(reference.to_string(), manifest.clone());
        Ok(())
    }

    async fn blob_exists(&self, repository: &str, digest: &str) -> Result<bool> {
        Ok(self
            .blobs
            .contains_key(&(repository.to_string(), digest.to_string())))
    }

    async fn get_blob(&self, repository: &str, digest: &str) -> Result<Bytes> {
        self.blobs
            .get(&(repository.to_string(), digest.to_string()))
            .map(|b| b.clone())
            .ok_or_else(|| Error::not_found(format!("blob {digest} not found")))
    }

    async fn put_blob(&self, repository: &str, digest: &str, data: Bytes) -> Result<()> {
        self.blobs
            .insert((repository.to_string(), digest.to_string()), data);
        Ok(())
    }
}
