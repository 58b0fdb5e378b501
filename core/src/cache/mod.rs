// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Distributed cache
//!
//! Manifest, blob-descriptor, and tag-list metadata partitioned over the
//! consistent hash ring with N-way replication. Writes land on the primary
//! (hard error on failure) and fan out asynchronously to replicas
//! (log-only). Reads try the primary, then replicas in ring order; a miss
//! everywhere is `None`, not an error.

pub mod store;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;
use crate::ring::{HashRing, RingNode};
pub use store::{CacheStore, StoreConfig, StoreStats};

/// The three logical stores
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Image manifests, keyed by repository + tag + media type
    Manifests,
    /// Blob descriptors, keyed by digest
    Blobs,
    /// Tag lists, keyed by repository
    Tags,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manifests => write!(f, "manifests"),
            Self::Blobs => write!(f, "blobs"),
            Self::Tags => write!(f, "tags"),
        }
    }
}

/// Fingerprint key: SHA-256 of the canonical input tuple
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Canonical manifest key
pub fn manifest_key(repository: &str, tag: &str, media_type: &str) -> String {
    fingerprint(&["manifest", repository, tag, media_type])
}

/// Canonical blob-descriptor key
pub fn blob_key(digest: &str) -> String {
    fingerprint(&["blob", digest])
}

/// Canonical tag-list key
pub fn tag_list_key(repository: &str) -> String {
    fingerprint(&["tags", repository])
}

/// Transport to a peer node's cache stores.
///
/// The mesh provides the production implementation; tests supply an
/// in-memory one.
#[async_trait]
pub trait CacheTransport: Send + Sync {
    /// Read `key` from `node`'s store
    async fn get(&self, node: &RingNode, kind: StoreKind, key: &str) -> Result<Option<Bytes>>;
    /// Write `key` to `node`'s store
    async fn put(
        &self,
        node: &RingNode,
        kind: StoreKind,
        key: &str,
        payload: Bytes,
        ttl: Duration,
    ) -> Result<()>;
    /// Delete `key` from `node`'s store
    async fn delete(&self, node: &RingNode, kind: StoreKind, key: &str) -> Result<()>;
}

/// Distributed cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Replicas per key, including the primary
    pub replication: usize,
    pub manifests: StoreConfig,
    pub blobs: StoreConfig,
    pub tags: StoreConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            replication: 2,
            manifests: StoreConfig::default(),
            blobs: StoreConfig {
                ttl: Duration::from_secs(3600),
                ..StoreConfig::default()
            },
            tags: StoreConfig {
                ttl: Duration::from_secs(60),
                ..StoreConfig::default()
            },
        }
    }
}

/// Ring-partitioned replicated cache
pub struct DistributedCache {
    local_node_id: String,
    ring: Arc<HashRing>,
    transport: Arc<dyn CacheTransport>,
    config: CacheConfig,
    manifests: CacheStore,
    blobs: CacheStore,
    tags: CacheStore,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DistributedCache {
    /// Create a cache for the local node
    pub fn new(
        local_node_id: impl Into<String>,
        ring: Arc<HashRing>,
        transport: Arc<dyn CacheTransport>,
        config: CacheConfig,
    ) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            ring,
            transport,
            manifests: CacheStore::new("manifests", config.manifests.clone()),
            blobs: CacheStore::new("blobs", config.blobs.clone()),
            tags: CacheStore::new("tags", config.tags.clone()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn store(&self, kind: StoreKind) -> &CacheStore {
        match kind {
            StoreKind::Manifests => &self.manifests,
            StoreKind::Blobs => &self.blobs,
            StoreKind::Tags => &self.tags,
        }
    }

    fn ttl(&self, kind: StoreKind) -> Duration {
        match kind {
            StoreKind::Manifests => self.config.manifests.ttl,
            StoreKind::Blobs => self.config.blobs.ttl,
            StoreKind::Tags => self.config.tags.ttl,
        }
    }

    /// Direct access to a local store (serving peer RPCs)
    pub fn local_store(&self, kind: StoreKind) -> &CacheStore {
        self.store(kind)
    }

    /// Aggregate hit count across lookups through this node
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Aggregate miss count
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    async fn read_from(&self, node: &RingNode, kind: StoreKind, key: &str) -> Option<Bytes> {
        if node.id == self.local_node_id {
            self.store(kind).get(key)
        } else {
            match self.transport.get(node, kind, key).await {
                Ok(found) => found,
                Err(err) => {
                    debug!(node = %node.id, %err, "replica read failed");
                    None
                }
            }
        }
    }

    /// Read a key: primary first, replicas in ring order on miss or
    /// unhealthy primary. A miss everywhere is `None`.
    pub async fn get(&self, kind: StoreKind, key: &str) -> Option<Bytes> {
        let candidates = self.ring.nodes_for(key, self.config.replication.max(1));
        for node in &candidates {
            if !node.healthy {
                continue;
            }
            if let Some(found) = self.read_from(node, kind, key).await {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(found);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Write a key to its primary (hard error) and replicate asynchronously
    pub async fn put(self: &Arc<Self>, kind: StoreKind, key: &str, payload: Bytes) -> Result<()> {
        let replication = self.config.replication.max(1);
        let candidates = self.ring.nodes_for(key, replication);
        let Some(primary) = candidates.first() else {
            // No members: degrade to a purely local cache
            self.store(kind).put(key, payload);
            return Ok(());
        };

        let ttl = self.ttl(kind);
        if primary.id == self.local_node_id {
            self.store(kind).put_with_ttl(key, payload.clone(), ttl);
        } else {
            self.transport
                .put(primary, kind, key, payload.clone(), ttl)
                .await?;
        }

        // Replica fan-out happens after the primary write and off the
        // caller's path; failures are logged, never propagated
        let replicas: Vec<RingNode> = candidates.iter().skip(1).cloned().collect();
        if !replicas.is_empty() {
            let this = self.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                for node in replicas {
                    let outcome = if node.id == this.local_node_id {
                        this.store(kind).put_with_ttl(&key, payload.clone(), ttl);
                        Ok(())
                    } else {
                        this.transport
                            .put(&node, kind, &key, payload.clone(), ttl)
                            .await
                    };
                    if let Err(err) = outcome {
                        warn!(node = %node.id, %key, %err, "replica write failed");
                    }
                }
            });
        }
        Ok(())
    }

    /// Best-effort delete on primary and all replicas
    pub async fn delete(&self, kind: StoreKind, key: &str) {
        let candidates = self.ring.nodes_for(key, self.config.replication.max(1));
        if candidates.is_empty() {
            self.store(kind).delete(key);
            return;
        }
        for node in candidates {
            let outcome = if node.id == self.local_node_id {
                self.store(kind).delete(key);
                Ok(())
            } else {
                self.transport.delete(&node, kind, key).await
            };
            if let Err(err) = outcome {
                warn!(node = %node.id, %key, %err, "delete fan-out failed");
            }
        }
    }

    /// Re-home local keys whose primary moved after a membership change.
    ///
    /// Writes target the new primary; lookups during the window may return
    /// from either owner.
    pub async fn redistribute(self: &Arc<Self>) {
        for kind in [StoreKind::Manifests, StoreKind::Blobs, StoreKind::Tags] {
            let keys = self.store(kind).keys();
            for key in keys {
                let Some(primary) = self.ring.node_for(&key) else {
                    continue;
                };
                if primary.id == self.local_node_id {
                    continue;
                }
                let Some(payload) = self.store(kind).get(&key) else {
                    continue;
                };
                match self
                    .transport
                    .put(&primary, kind, &key, payload, self.ttl(kind))
                    .await
                {
                    Ok(()) => {
                        self.store(kind).delete(&key);
                        debug!(%key, new_primary = %primary.id, "re-homed cache key");
                    }
                    Err(err) => {
                        warn!(%key, %err, "re-home failed, keeping stale copy");
                    }
                }
            }
        }
    }

    /// Membership change entry point: spawns redistribution in the
    /// background
    pub fn on_membership_change(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.redistribute().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashmap::DashMap;

    /// Transport backed by shared in-memory node stores
    struct MemoryTransport {
        nodes: DashMap<String, Arc<DashMap<(String, String), Bytes>>>,
    }

    impl MemoryTransport {
        fn new(node_ids: &[&str]) -> Self {
            let nodes = DashMap::new();
            for id in node_ids {
                nodes.insert(id.to_string(), Arc::new(DashMap::new()));
            }
            Self { nodes }
        }

        fn node_store(&self, id: &str) -> Arc<DashMap<(String, String), Bytes>> {
            self.nodes.get(id).unwrap().clone()
        }
    }

    #[async_trait]
    impl CacheTransport for MemoryTransport {
        async fn get(
            &self,
            node: &RingNode,
            kind: StoreKind,
            key: &str,
        ) -> Result<Option<Bytes>> {
            Ok(self
                .node_store(&node.id)
                .get(&(kind.to_string(), key.to_string()))
                .map(|v| v.clone()))
        }

        async fn put(
            &self,
            node: &RingNode,
            kind: StoreKind,
            key: &str,
            payload: Bytes,
            _ttl: Duration,
        ) -> Result<()> {
            self.node_store(&node.id)
                .insert((kind.to_string(), key.to_string()), payload);
            Ok(())
        }

        async fn delete(&self, node: &RingNode, kind: StoreKind, key: &str) -> Result<()> {
            self.node_store(&node.id)
                .remove(&(kind.to_string(), key.to_string()));
            Ok(())
        }
    }

    fn three_node_ring() -> Arc<HashRing> {
        let ring = Arc::new(HashRing::new());
        for id in ["node-1", "node-2", "node-3"] {
            ring.add_node(RingNode::new(id, format!("{id}:7000"))).unwrap();
        }
        ring
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let ring = three_node_ring();
        let transport = Arc::new(MemoryTransport::new(&["node-1", "node-2", "node-3"]));
        let cache = Arc::new(DistributedCache::new(
            "node-1",
            ring,
            transport,
            CacheConfig {
                replication: 3,
                ..CacheConfig::default()
            },
        ));

        let key = tag_list_key("library/alpine");
        cache
            .put(StoreKind::Tags, &key, Bytes::from_static(b"[\"v1\"]"))
            .await
            .unwrap();

        let found = cache.get(StoreKind::Tags, &key).await;
        assert_eq!(found, Some(Bytes::from_static(b"[\"v1\"]")));
        assert_eq!(cache.hits(), 1);
    }

    #[tokio::test]
    async fn test_replica_serves_when_primary_unhealthy() {
        let ring = three_node_ring();
        let transport = Arc::new(MemoryTransport::new(&["node-1", "node-2", "node-3"]));
        let cache = Arc::new(DistributedCache::new(
            "node-1",
            ring.clone(),
            transport,
            CacheConfig {
                replication: 3,
                ..CacheConfig::default()
            },
        ));

        let key = blob_key("sha256:abc123");
        cache
            .put(StoreKind::Blobs, &key, Bytes::from_static(b"descriptor"))
            .await
            .unwrap();
        // Let the async replica fan-out land
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let primary = ring.node_for(&key).unwrap();
        ring.set_healthy(&primary.id, false);

        let misses_before = cache.misses();
        let found = cache.get(StoreKind::Blobs, &key).await;
        assert_eq!(found, Some(Bytes::from_static(b"descriptor")));
        assert_eq!(cache.misses(), misses_before);
        assert!(cache.hits() >= 1);
    }

    #[tokio::test]
    async fn test_miss_everywhere_is_none() {
        let ring = three_node_ring();
        let transport = Arc::new(MemoryTransport::new(&["node-1", "node-2", "node-3"]));
        let cache = Arc::new(DistributedCache::new(
            "node-1",
            ring,
            transport,
            CacheConfig::default(),
        ));

        assert!(cache.get(StoreKind::Manifests, "absent").await.is_none());
        assert_eq!(cache.misses(), 1);
    }

    #[tokio::test]
    async fn test_fingerprint_keys_are_canonical() {
        assert_eq!(
            manifest_key("library/alpine", "v1", "application/vnd.oci.image.manifest.v1+json"),
            manifest_key("library/alpine", "v1", "application/vnd.oci.image.manifest.v1+json"),
        );
        assert_ne!(
            manifest_key("library/alpine", "v1", "m"),
            manifest_key("library/alpine", "v2", "m"),
        );
        // Separator prevents ambiguous concatenation
        assert_ne!(fingerprint(&["ab", "c"]), fingerprint(&["a", "bc"]));
    }

    #[tokio::test]
    async fn test_redistribute_moves_keys_to_new_primary() {
        let ring = Arc::new(HashRing::new());
        ring.add_node(RingNode::new("node-1", "a:7000")).unwrap();
        let transport = Arc::new(MemoryTransport::new(&["node-1", "node-2"]));
        let cache = Arc::new(DistributedCache::new(
            "node-1",
            ring.clone(),
            transport.clone(),
            CacheConfig {
                replication: 1,
                ..CacheConfig::default()
            },
        ));

        // Seed several keys while node-1 owns the whole ring
        let keys: Vec<String> = (0..20).map(|i| tag_list_key(&format!("repo-{i}"))).collect();
        for key in &keys {
            cache
                .put(StoreKind::Tags, key, Bytes::from_static(b"x"))
                .await
                .unwrap();
        }

        ring.add_node(RingNode::new("node-2", "b:7000")).unwrap();
        cache.redistribute().await;

        // Keys whose primary moved now live on node-2
        let moved: Vec<_> = keys
            .iter()
            .filter(|k| ring.node_for(k).unwrap().id == "node-2")
            .collect();
        assert!(!moved.is_empty(), "expected some keys to move");
        let store2 = transport.node_store("node-2");
        for key in moved {
            assert!(store2.contains_key(&("tags".to_string(), key.to_string())));
            assert!(cache.local_store(StoreKind::Tags).get(key).is_none());
        }
    }
}
