// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Consistent hash ring with virtual nodes.
//!
//! Each physical node contributes `V` deterministic placements on a 32-bit
//! ring; key lookups binary-search the sorted placements and wrap at the
//! end. The ring is a pure function of membership: two nodes with identical
//! membership resolve any key to the same primary.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Default virtual nodes per physical node
pub const DEFAULT_VIRTUAL_NODES: u32 = 150;

/// A physical node on the ring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingNode {
    /// Node identifier
    pub id: String,
    /// Network address (host:port)
    pub address: String,
    /// Declared capacity
    pub capacity: usize,
    /// Relative weight (reserved; all nodes currently weigh equally)
    pub weight: u32,
    /// Health flag maintained by the mesh monitor
    pub healthy: bool,
}

impl RingNode {
    /// Create a healthy node descriptor
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            capacity: 0,
            weight: 1,
            healthy: true,
        }
    }
}

struct RingState {
    /// Sorted (position, node id) placements
    points: Vec<(u32, String)>,
    nodes: HashMap<String, RingNode>,
}

/// Consistent hash ring
pub struct HashRing {
    virtual_nodes: u32,
    state: RwLock<RingState>,
}

impl HashRing {
    /// Create an empty ring with the default virtual node count
    pub fn new() -> Self {
        Self::with_virtual_nodes(DEFAULT_VIRTUAL_NODES)
    }

    /// Create an empty ring with `virtual_nodes` placements per node
    pub fn with_virtual_nodes(virtual_nodes: u32) -> Self {
        Self {
            virtual_nodes,
            state: RwLock::new(RingState {
                points: Vec::new(),
                nodes: HashMap::new(),
            }),
        }
    }

    fn position(node_id: &str, v: u32) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(node_id.as_bytes());
        hasher.update(&v.to_be_bytes());
        hasher.finalize()
    }

    fn hash_key(key: &str) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(key.as_bytes());
        hasher.finalize()
    }

    /// Add a node; placements are rebuilt atomically
    pub fn add_node(&self, node: RingNode) -> Result<()> {
        let mut state = self.state.write();
        if state.nodes.contains_key(&node.id) {
            return Err(Error::already_exists(format!(
                "node {} already on ring",
                node.id
            )));
        }
        for v in 0..self.virtual_nodes {
            state.points.push((Self::position(&node.id, v), node.id.clone()));
        }
        state.points.sort();
        state.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Remove a node and all its placements
    pub fn remove_node(&self, node_id: &str) -> Result<RingNode> {
        let mut state = self.state.write();
        let node = state
            .nodes
            .remove(node_id)
            .ok_or_else(|| Error::not_found(format!("node {node_id} not on ring")))?;
        state.points.retain(|(_, id)| id != node_id);
        Ok(node)
    }

    /// Update a node's health flag
    pub fn set_healthy(&self, node_id: &str, healthy: bool) {
        let mut state = self.state.write();
        if let Some(node) = state.nodes.get_mut(node_id) {
            node.healthy = healthy;
        }
    }

    /// The primary node for a key
    pub fn node_for(&self, key: &str) -> Option<RingNode> {
        let state = self.state.read();
        if state.points.is_empty() {
            return None;
        }
        let hash = Self::hash_key(key);
        let idx = match state.points.binary_search_by(|(pos, _)| pos.cmp(&hash)) {
            Ok(i) => i,
            Err(i) => {
                if i == state.points.len() {
                    0
                } else {
                    i
                }
            }
        };
        let id = &state.points[idx].1;
        state.nodes.get(id).cloned()
    }

    /// Walk forward from the key's position collecting up to `count`
    /// distinct physical nodes
    pub fn nodes_for(&self, key: &str, count: usize) -> Vec<RingNode> {
        let state = self.state.read();
        if state.points.is_empty() || count == 0 {
            return Vec::new();
        }
        let hash = Self::hash_key(key);
        let start = match state.points.binary_search_by(|(pos, _)| pos.cmp(&hash)) {
            Ok(i) => i,
            Err(i) => {
                if i == state.points.len() {
                    0
                } else {
                    i
                }
            }
        };

        let mut found = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for offset in 0..state.points.len() {
            let (_, id) = &state.points[(start + offset) % state.points.len()];
            if seen.insert(id.clone()) {
                if let Some(node) = state.nodes.get(id) {
                    found.push(node.clone());
                }
                if found.len() == count {
                    break;
                }
            }
        }
        found
    }

    /// All member nodes
    pub fn nodes(&self) -> Vec<RingNode> {
        self.state.read().nodes.values().cloned().collect()
    }

    /// Number of physical nodes
    pub fn len(&self) -> usize {
        self.state.read().nodes.len()
    }

    /// Whether the ring has no members
    pub fn is_empty(&self) -> bool {
        self.state.read().nodes.is_empty()
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_with(nodes: &[&str]) -> HashRing {
        let ring = HashRing::new();
        for id in nodes {
            ring.add_node(RingNode::new(*id, format!("{id}:7000"))).unwrap();
        }
        ring
    }

    #[test]
    fn test_lookup_is_deterministic_across_rings() {
        let a = ring_with(&["node-1", "node-2", "node-3"]);
        let b = ring_with(&["node-3", "node-1", "node-2"]);

        for key in ["library/alpine", "prod/app:v1.2", "team/api"] {
            assert_eq!(
                a.node_for(key).unwrap().id,
                b.node_for(key).unwrap().id,
                "key {key} resolved differently"
            );
        }
    }

    #[test]
    fn test_virtual_node_count() {
        let ring = HashRing::with_virtual_nodes(150);
        ring.add_node(RingNode::new("node-1", "a:7000")).unwrap();
        assert_eq!(ring.state.read().points.len(), 150);
    }

    #[test]
    fn test_add_remove_round_trip() {
        let ring = ring_with(&["node-1", "node-2"]);
        let before: Vec<_> = ring.state.read().points.clone();

        ring.add_node(RingNode::new("node-3", "c:7000")).unwrap();
        ring.remove_node("node-3").unwrap();

        assert_eq!(ring.state.read().points, before);
    }

    #[test]
    fn test_replicas_are_distinct() {
        let ring = ring_with(&["node-1", "node-2", "node-3"]);

        let replicas = ring.nodes_for("some/repo", 3);
        assert_eq!(replicas.len(), 3);
        let ids: std::collections::HashSet<_> =
            replicas.iter().map(|n| n.id.clone()).collect();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_replica_walk_exhausts_small_ring() {
        let ring = ring_with(&["node-1"]);
        let replicas = ring.nodes_for("key", 3);
        assert_eq!(replicas.len(), 1);
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let ring = ring_with(&["node-1"]);
        let err = ring
            .add_node(RingNode::new("node-1", "a:7000"))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_remove_missing_rejected() {
        let ring = ring_with(&[]);
        let err = ring.remove_node("ghost").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn test_keys_spread_over_nodes() {
        let ring = ring_with(&["node-1", "node-2", "node-3"]);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for i in 0..1000 {
            let node = ring.node_for(&format!("repo-{i}")).unwrap();
            *counts.entry(node.id).or_default() += 1;
        }
        // Every node owns a meaningful share
        for (_, count) in counts {
            assert!(count > 100);
        }
    }
}
