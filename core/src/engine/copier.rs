// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-tag copy: manifest fetch, digest short-circuit, blob streaming,
//! manifest push.

use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::types::TagWorkItem;
use crate::error::{Error, Result};
use crate::registry::RegistryClient;
use crate::resilience::ResilienceManager;

/// Result of one tag copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOutcome {
    /// The destination already matched and `force` was off
    pub skipped: bool,
    /// Blob bytes streamed to the destination
    pub bytes: u64,
}

/// Copies single tags between registries through the resilience pipeline.
///
/// Every registry call is keyed by registry endpoint so a degraded registry
/// only opens its own circuit. Completing the same work item twice leaves
/// the destination unchanged.
pub struct TagCopier {
    resilience: Arc<ResilienceManager>,
}

impl TagCopier {
    /// Create a copier sharing the node's resilience manager
    pub fn new(resilience: Arc<ResilienceManager>) -> Self {
        Self { resilience }
    }

    /// Copy one tag; `force` pushes even when the destination digest
    /// already matches.
    ///
    /// A work item carrying a deadline is bounded by it: an expired
    /// deadline fails before any registry call, and an in-flight copy is
    /// cut off when it runs past the remaining time.
    pub async fn copy(
        &self,
        source: Arc<dyn RegistryClient>,
        dest: Arc<dyn RegistryClient>,
        item: &TagWorkItem,
        force: bool,
        token: &CancellationToken,
    ) -> Result<CopyOutcome> {
        let Some(deadline) = item.deadline else {
            return self.copy_unbounded(source, dest, item, force, token).await;
        };

        let remaining = (deadline - Utc::now()).to_std().map_err(|_| {
            Error::deadline_exceeded(format!(
                "work item {} deadline already passed",
                item.tag_key()
            ))
        })?;
        tokio::time::timeout(
            remaining,
            self.copy_unbounded(source, dest, item, force, token),
        )
        .await
        .map_err(|_| {
            Error::deadline_exceeded(format!(
                "work item {} exceeded its deadline",
                item.tag_key()
            ))
        })?
    }

    async fn copy_unbounded(
        &self,
        source: Arc<dyn RegistryClient>,
        dest: Arc<dyn RegistryClient>,
        item: &TagWorkItem,
        force: bool,
        token: &CancellationToken,
    ) -> Result<CopyOutcome> {
        let src_name = source.endpoint().to_string();
        let dest_name = dest.endpoint().to_string();

        // Source manifest
        let manifest = {
            let source = source.clone();
            let repo = item.source_repository.clone();
            let tag = item.source_tag.clone();
            self.resilience
                .execute(&src_name, token, move || {
                    let source = source.clone();
                    let repo = repo.clone();
                    let tag = tag.clone();
                    async move { source.get_manifest(&repo, &tag).await }
                })
                .await?
        };

        // Digest short-circuit
        if !force {
            let existing = {
                let dest = dest.clone();
                let repo = item.dest_repository.clone();
                let tag = item.dest_tag.clone();
                self.resilience
                    .execute(&dest_name, token, move || {
                        let dest = dest.clone();
                        let repo = repo.clone();
                        let tag = tag.clone();
                        async move { dest.manifest_digest(&repo, &tag).await }
                    })
                    .await?
            };
            if existing.as_deref() == Some(manifest.digest.as_str()) {
                debug!(
                    tag = %item.tag_key(),
                    digest = %manifest.digest,
                    "destination already matches, skipping"
                );
                crate::metrics::tags_skipped(&dest_name);
                return Ok(CopyOutcome {
                    skipped: true,
                    bytes: 0,
                });
            }
        }

        // Stream blobs the destination is missing
        let mut bytes_transferred = 0u64;
        for blob in manifest.referenced_blobs() {
            let exists = {
                let dest = dest.clone();
                let repo = item.dest_repository.clone();
                let digest = blob.digest.clone();
                self.resilience
                    .execute(&dest_name, token, move || {
                        let dest = dest.clone();
                        let repo = repo.clone();
                        let digest = digest.clone();
                        async move { dest.blob_exists(&repo, &digest).await }
                    })
                    .await?
            };
            if exists {
                continue;
            }

            let data = {
                let source = source.clone();
                let repo = item.source_repository.clone();
                let digest = blob.digest.clone();
                self.resilience
                    .execute(&src_name, token, move || {
                        let source = source.clone();
                        let repo = repo.clone();
                        let digest = digest.clone();
                        async move { source.get_blob(&repo, &digest).await }
                    })
                    .await?
            };
            bytes_transferred += data.len() as u64;

            {
                let dest = dest.clone();
                let repo = item.dest_repository.clone();
                let digest = blob.digest.clone();
                let data = data.clone();
                self.resilience
                    .execute(&dest_name, token, move || {
                        let dest = dest.clone();
                        let repo = repo.clone();
                        let digest = digest.clone();
                        let data = data.clone();
                        async move { dest.put_blob(&repo, &digest, data).await }
                    })
                    .await?;
            }
        }

        // Manifest last, so a partially-copied image is never tagged
        {
            let dest = dest.clone();
            let repo = item.dest_repository.clone();
            let tag = item.dest_tag.clone();
            let manifest = manifest.clone();
            self.resilience
                .execute(&dest_name, token, move || {
                    let dest = dest.clone();
                    let repo = repo.clone();
                    let tag = tag.clone();
                    let manifest = manifest.clone();
                    async move { dest.put_manifest(&repo, &tag, &manifest).await }
                })
                .await?;
        }

        info!(
            tag = %item.tag_key(),
            digest = %manifest.digest,
            bytes = bytes_transferred,
            "tag copied"
        );
        crate::metrics::tags_copied(&dest_name);
        crate::metrics::bytes_transferred(&dest_name, bytes_transferred);
        Ok(CopyOutcome {
            skipped: false,
            bytes: bytes_transferred,
        })
    }
}
