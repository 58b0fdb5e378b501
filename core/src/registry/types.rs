// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Registry data types.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Registry flavor, used for endpoint and auth resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    Ecr,
    Gcr,
    Docker,
    Harbor,
    Quay,
    Gitlab,
    Ghcr,
    Acr,
    #[default]
    Generic,
}

impl fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ecr => "ecr",
            Self::Gcr => "gcr",
            Self::Docker => "docker",
            Self::Harbor => "harbor",
            Self::Quay => "quay",
            Self::Gitlab => "gitlab",
            Self::Ghcr => "ghcr",
            Self::Acr => "acr",
            Self::Generic => "generic",
        };
        write!(f, "{s}")
    }
}

/// Default OCI image manifest media type
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Docker schema2 manifest media type, still common in the wild
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

/// An image manifest as fetched from a registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Content digest (`sha256:<hex>`)
    pub digest: String,
    /// Media type reported by the registry
    pub media_type: String,
    /// Raw manifest bytes; pushed verbatim to preserve the digest
    pub bytes: Bytes,
}

impl Manifest {
    /// Build a manifest, computing the digest from the bytes
    pub fn from_bytes(media_type: impl Into<String>, bytes: Bytes) -> Self {
        let digest = digest_of(&bytes);
        Self {
            digest,
            media_type: media_type.into(),
            bytes,
        }
    }

    /// Digests of every blob the manifest references (config + layers)
    pub fn referenced_blobs(&self) -> Vec<BlobDescriptor> {
        let Ok(doc) = serde_json::from_slice::<ManifestDocument>(&self.bytes) else {
            return Vec::new();
        };
        let mut blobs = Vec::new();
        if let Some(config) = doc.config {
            blobs.push(config);
        }
        blobs.extend(doc.layers);
        blobs
    }
}

/// A blob reference inside a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobDescriptor {
    /// Content digest
    pub digest: String,
    /// Blob size in bytes
    #[serde(default)]
    pub size: u64,
    /// Media type
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
}

#[derive(Deserialize)]
struct ManifestDocument {
    #[serde(default)]
    config: Option<BlobDescriptor>,
    #[serde(default)]
    layers: Vec<BlobDescriptor>,
}

/// Compute the `sha256:<hex>` digest of a byte sequence
pub fn digest_of(bytes: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_format() {
        let d = digest_of(b"hello");
        assert!(d.starts_with("sha256:"));
        assert_eq!(d.len(), "sha256:".len() + 64);
    }

    #[test]
    fn test_manifest_blob_extraction() {
        let doc = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_MEDIA_TYPE,
            "config": {
                "digest": "sha256:cfg",
                "size": 100,
                "mediaType": "application/vnd.oci.image.config.v1+json"
            },
            "layers": [
                {"digest": "sha256:layer1", "size": 1000, "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip"},
                {"digest": "sha256:layer2", "size": 2000, "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip"}
            ]
        });
        let manifest = Manifest::from_bytes(
            MANIFEST_MEDIA_TYPE,
            Bytes::from(serde_json::to_vec(&doc).unwrap()),
        );

        let blobs = manifest.referenced_blobs();
        assert_eq!(blobs.len(), 3);
        assert_eq!(blobs[0].digest, "sha256:cfg");
        assert_eq!(blobs[2].size, 2000);
    }

    #[test]
    fn test_kind_serde_names() {
        assert_eq!(
            serde_yaml::from_str::<RegistryKind>("ecr").unwrap(),
            RegistryKind::Ecr
        );
        assert_eq!(
            serde_yaml::from_str::<RegistryKind>("ghcr").unwrap(),
            RegistryKind::Ghcr
        );
    }
}
