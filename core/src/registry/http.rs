// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Generic OCI v2 registry client over HTTP.

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::types::{digest_of, Manifest, DOCKER_MANIFEST_MEDIA_TYPE, MANIFEST_MEDIA_TYPE};
use super::RegistryClient;
use crate::error::{Error, Result};

/// Resolved credentials for one registry.
///
/// Explicit values win; otherwise `REGISTRY_USERNAME`/`REGISTRY_PASSWORD`
/// are consulted. Cloud-specific helpers (ECR tokens, GCP credential files)
/// resolve to a token before this point.
#[derive(Debug, Clone, Default)]
pub struct RegistryCredentials {
    /// Basic-auth username
    pub username: Option<String>,
    /// Basic-auth password
    pub password: Option<String>,
    /// Bearer token; wins over basic auth
    pub token: Option<String>,
}

impl RegistryCredentials {
    /// Fill unset fields from the process environment
    pub fn with_env_fallback(mut self) -> Self {
        if self.username.is_none() {
            self.username = std::env::var("REGISTRY_USERNAME").ok();
        }
        if self.password.is_none() {
            self.password = std::env::var("REGISTRY_PASSWORD").ok();
        }
        self
    }

    fn authorization(&self) -> Option<String> {
        if let Some(token) = &self.token {
            return Some(format!("Bearer {token}"));
        }
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            let encoded =
                base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
            return Some(format!("Basic {encoded}"));
        }
        None
    }
}

#[derive(Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct Catalog {
    #[serde(default)]
    repositories: Vec<String>,
}

/// OCI distribution v2 client for a single registry endpoint
pub struct HttpRegistryClient {
    endpoint: String,
    base_url: String,
    client: reqwest::Client,
    credentials: RegistryCredentials,
}

impl HttpRegistryClient {
    /// Create a client; `insecure` selects plain HTTP
    pub fn new(
        endpoint: impl Into<String>,
        credentials: RegistryCredentials,
        insecure: bool,
    ) -> Result<Self> {
        let endpoint = endpoint.into();
        let scheme = if insecure { "http" } else { "https" };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(Error::from)?;
        Ok(Self {
            base_url: format!("{scheme}://{endpoint}"),
            endpoint,
            client,
            credentials,
        })
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(auth) = self.credentials.authorization() {
            builder = builder.header(reqwest::header::AUTHORIZATION, auth);
        }
        builder
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let url = response.url().to_string();
        let kind = if status.as_u16() == 404 {
            return Err(Error::not_found(format!("{url}: {status}")));
        } else if status.as_u16() == 429 || status.is_server_error() {
            crate::error::ErrorKind::Transient
        } else {
            crate::error::ErrorKind::InvalidInput
        };
        Err(Error::new(kind, format!("{url}: {status}")))
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn list_repositories(&self, prefix: &str) -> Result<Vec<String>> {
        let url = format!("{}/v2/_catalog?n=10000", self.base_url);
        let response = self.request(reqwest::Method::GET, url).send().await?;
        let catalog: Catalog = self.check(response).await?.json().await?;
        Ok(catalog
            .repositories
            .into_iter()
            .filter(|r| r.starts_with(prefix))
            .collect())
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let url = format!("{}/v2/{repository}/tags/list", self.base_url);
        let response = self.request(reqwest::Method::GET, url).send().await?;
        let list: TagList = self.check(response).await?.json().await?;
        Ok(list.tags.unwrap_or_default())
    }

    async fn get_manifest(&self, repository: &str, reference: &str) -> Result<Manifest> {
        let url = format!("{}/v2/{repository}/manifests/{reference}", self.base_url);
        let response = self
            .request(reqwest::Method::GET, url)
            .header(
                reqwest::header::ACCEPT,
                format!("{MANIFEST_MEDIA_TYPE}, {DOCKER_MANIFEST_MEDIA_TYPE}"),
            )
            .send()
            .await?;
        let response = self.check(response).await?;

        let media_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(MANIFEST_MEDIA_TYPE)
            .to_string();
        let header_digest = response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let bytes = response.bytes().await?;

        let digest = header_digest.unwrap_or_else(|| digest_of(&bytes));
        debug!(repository, reference, %digest, "fetched manifest");
        Ok(Manifest {
            digest,
            media_type,
            bytes,
        })
    }

    async fn manifest_digest(&self, repository: &str, reference: &str)
        -> Result<Option<String>> {
        let url = format!("{}/v2/{repository}/manifests/{reference}", self.base_url);
        let response = self
            .request(reqwest::Method::HEAD, url)
            .header(
                reqwest::header::ACCEPT,
                format!("{MANIFEST_MEDIA_TYPE}, {DOCKER_MANIFEST_MEDIA_TYPE}"),
            )
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let response = self.check(response).await?;
        Ok(response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(String::from))
    }

    async fn put_manifest(&self, repository: &str, reference: &str, manifest: &Manifest)
        -> Result<()> {
        let url = format!("{}/v2/{repository}/manifests/{reference}", self.base_url);
        let response = self
            .request(reqwest::Method::PUT, url)
            .header(reqwest::header::CONTENT_TYPE, manifest.media_type.clone())
            .body(manifest.bytes.clone())
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    async fn blob_exists(&self, repository: &str, digest: &str) -> Result<bool> {
        let url = format!("{}/v2/{repository}/blobs/{digest}", self.base_url);
        let response = self.request(reqwest::Method::HEAD, url).send().await?;
        if response.status().as_u16() == 404 {
            return Ok(false);
        }
        self.check(response).await?;
        Ok(true)
    }

    async fn get_blob(&self, repository: &str, digest: &str) -> Result<Bytes> {
        let url = format!("{}/v2/{repository}/blobs/{digest}", self.base_url);
        let response = self.request(reqwest::Method::GET, url).send().await?;
        Ok(self.check(response).await?.bytes().await?)
    }

    async fn put_blob(&self, repository: &str, digest: &str, data: Bytes) -> Result<()> {
        // Two-step upload: start a session, then PUT with the digest
        let start_url = format!("{}/v2/{repository}/blobs/uploads/", self.base_url);
        let response = self.request(reqwest::Method::POST, start_url).send().await?;
        let response = self.check(response).await?;

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::internal("upload session missing Location header"))?;
        let upload_url = if location.starts_with("http") {
            location.to_string()
        } else {
            format!("{}{location}", self.base_url)
        };
        let separator = if upload_url.contains('?') { '&' } else { '?' };
        let put_url = format!("{upload_url}{separator}digest={digest}");

        let response = self
            .request(reqwest::Method::PUT, put_url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_wins() {
        let creds = RegistryCredentials {
            username: Some("u".into()),
            password: Some("p".into()),
            token: Some("tok".into()),
        };
        assert_eq!(creds.authorization(), Some("Bearer tok".to_string()));
    }

    #[test]
    fn test_basic_auth_encoding() {
        let creds = RegistryCredentials {
            username: Some("user".into()),
            password: Some("pass".into()),
            token: None,
        };
        let auth = creds.authorization().unwrap();
        assert!(auth.starts_with("Basic "));
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(auth.trim_start_matches("Basic "))
            .unwrap();
        assert_eq!(decoded, b"user:pass");
    }

    #[test]
    fn test_no_credentials_no_header() {
        assert_eq!(RegistryCredentials::default().authorization(), None);
    }

    #[test]
    fn test_insecure_scheme() {
        let client =
            HttpRegistryClient::new("localhost:5000", RegistryCredentials::default(), true)
                .unwrap();
        assert_eq!(client.base_url, "http://localhost:5000");
        assert_eq!(client.endpoint(), "localhost:5000");
    }
}
