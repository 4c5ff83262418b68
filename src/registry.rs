use std::collections::HashSet;
use std::sync::RwLock;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{ReferrerError, Result};
use crate::manifest::{self, Descriptor};
use crate::reference::ImageRef;

/// Narrow seam to the registry transport. The resolver and fetcher only see
/// this trait; tests substitute an in-memory implementation.
#[async_trait]
pub trait Remote: Send + Sync {
    /// List referrers of `subject` via the OCI referrers endpoint, returning
    /// the raw image-index bytes. Registries without the endpoint fail here.
    async fn list_referrers(&self, image: &ImageRef, subject: &str) -> Result<Vec<u8>>;

    /// Resolve a reference to the descriptor of its manifest.
    async fn resolve(&self, image: &ImageRef) -> Result<Descriptor>;

    /// Fetch the raw bytes of the manifest named by `desc`.
    async fn fetch_manifest(&self, image: &ImageRef, desc: &Descriptor) -> Result<Vec<u8>>;

    /// Fetch a blob's bytes by descriptor, verifying the content digest.
    async fn fetch_blob(&self, image: &ImageRef, desc: &Descriptor) -> Result<Vec<u8>>;

    /// Classify `err` after a failed operation against `image`'s registry.
    /// Returns true when the failure looks like HTTPS against a plain-HTTP
    /// registry and the client permits a downgrade; the registry is switched
    /// to plain HTTP so the caller's single whole-operation retry takes the
    /// insecure transport.
    fn should_retry_plain_http(&self, image: &ImageRef, err: &ReferrerError) -> bool;
}

// ---------------------------------------------------------------------------
// RegistryClient
// ---------------------------------------------------------------------------

/// OCI Distribution HTTP client with anonymous-then-bearer-token auth.
pub struct RegistryClient {
    client: reqwest::Client,
    /// Permit falling back to plain HTTP when TLS fails.
    insecure: bool,
    /// Registries downgraded to plain HTTP after a TLS failure.
    plain_http: RwLock<HashSet<String>>,
}

impl RegistryClient {
    pub fn new(insecure: bool) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("oci-referrer/0.1")
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            insecure,
            plain_http: RwLock::new(HashSet::new()),
        }
    }

    /// Base URL scheme for a registry host. Loopback registries and hosts
    /// downgraded after a TLS failure use HTTP; everything else HTTPS.
    fn scheme(&self, registry: &str) -> &'static str {
        let host = registry.split(':').next().unwrap_or(registry);
        if host == "localhost" || host == "127.0.0.1" || host == "::1" {
            return "http";
        }
        let downgraded = self
            .plain_http
            .read()
            .map(|set| set.contains(registry))
            .unwrap_or(false);
        if downgraded {
            "http"
        } else {
            "https"
        }
    }

    fn base_url(&self, image: &ImageRef) -> String {
        format!(
            "{}://{}/v2/{}",
            self.scheme(&image.registry),
            image.registry,
            image.repository,
        )
    }

    // -- internals ----------------------------------------------------------

    /// Perform a GET with anonymous-then-bearer-token auth flow. Returns the
    /// body and the response content type.
    async fn authenticated_get(
        &self,
        url: &str,
        image: &ImageRef,
        accept: Option<&str>,
    ) -> Result<(Vec<u8>, Option<String>)> {
        let mut req = self.client.get(url);
        if let Some(a) = accept {
            req = req.header(ACCEPT, a);
        }

        let resp = req.send().await?;

        let resp = if resp.status() == StatusCode::UNAUTHORIZED {
            // Extract www-authenticate and fetch a token.
            let www_auth = resp
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();

            let token = self.fetch_bearer_token(&www_auth, image).await?;

            let mut req2 = self
                .client
                .get(url)
                .header(AUTHORIZATION, format!("Bearer {token}"));
            if let Some(a) = accept {
                req2 = req2.header(ACCEPT, a);
            }
            req2.send().await?
        } else {
            resp
        };

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ReferrerError::Registry(format!(
                "GET {url} returned {status}: {body}"
            )));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        Ok((resp.bytes().await?.to_vec(), content_type))
    }

    /// Parse a `www-authenticate: Bearer realm="…",service="…",scope="…"`
    /// header and fetch an anonymous token.
    async fn fetch_bearer_token(&self, www_auth: &str, image: &ImageRef) -> Result<String> {
        let realm = extract_param(www_auth, "realm").unwrap_or_default();
        let service = extract_param(www_auth, "service").unwrap_or_default();
        let scope = extract_param(www_auth, "scope")
            .unwrap_or_else(|| format!("repository:{}:pull", image.repository));

        if realm.is_empty() {
            return Err(ReferrerError::Registry(
                "www-authenticate header missing realm".to_string(),
            ));
        }

        let token_url = format!("{realm}?service={service}&scope={scope}");
        debug!(%token_url, "fetching bearer token");

        let resp = self.client.get(&token_url).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ReferrerError::Registry(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let body: serde_json::Value = resp.json().await?;
        let token = body
            .get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ReferrerError::Registry("token response missing token field".to_string())
            })?;

        Ok(token.to_string())
    }
}

#[async_trait]
impl Remote for RegistryClient {
    async fn list_referrers(&self, image: &ImageRef, subject: &str) -> Result<Vec<u8>> {
        let url = format!("{}/referrers/{}", self.base_url(image), subject);
        let (body, _) = self
            .authenticated_get(&url, image, Some(manifest::MEDIA_TYPE_OCI_INDEX))
            .await?;
        Ok(body)
    }

    async fn resolve(&self, image: &ImageRef) -> Result<Descriptor> {
        let url = format!(
            "{}/manifests/{}",
            self.base_url(image),
            image.manifest_reference(),
        );
        let accept = [
            manifest::MEDIA_TYPE_OCI_MANIFEST,
            manifest::MEDIA_TYPE_DOCKER_MANIFEST,
        ]
        .join(", ");

        let (body, content_type) = self.authenticated_get(&url, image, Some(&accept)).await?;

        Ok(Descriptor {
            media_type: content_type.unwrap_or_else(|| manifest::MEDIA_TYPE_OCI_MANIFEST.into()),
            digest: sha256_digest(&body),
            size: body.len() as u64,
            annotations: Default::default(),
        })
    }

    async fn fetch_manifest(&self, image: &ImageRef, desc: &Descriptor) -> Result<Vec<u8>> {
        let url = format!("{}/manifests/{}", self.base_url(image), desc.digest);
        let accept = [
            manifest::MEDIA_TYPE_OCI_MANIFEST,
            manifest::MEDIA_TYPE_DOCKER_MANIFEST,
        ]
        .join(", ");
        let (body, _) = self.authenticated_get(&url, image, Some(&accept)).await?;
        Ok(body)
    }

    async fn fetch_blob(&self, image: &ImageRef, desc: &Descriptor) -> Result<Vec<u8>> {
        let url = format!("{}/blobs/{}", self.base_url(image), desc.digest);
        let (body, _) = self.authenticated_get(&url, image, None).await?;

        // Verify content digest before handing the bytes to the writer.
        if desc.digest.starts_with("sha256:") {
            let actual = sha256_digest(&body);
            if actual != desc.digest {
                return Err(ReferrerError::Validation(format!(
                    "blob digest mismatch: expected {}, got {actual}",
                    desc.digest,
                )));
            }
        }

        Ok(body)
    }

    fn should_retry_plain_http(&self, image: &ImageRef, err: &ReferrerError) -> bool {
        if !self.insecure || !err.is_transient() {
            return false;
        }
        // Already on plain HTTP; a downgrade cannot help.
        if self.scheme(&image.registry) == "http" {
            return false;
        }

        let msg = error_chain(err).to_lowercase();
        let tls_failure = ["tls", "handshake", "certificate", "http response to https"]
            .iter()
            .any(|marker| msg.contains(marker));
        if !tls_failure {
            return false;
        }

        if let Ok(mut set) = self.plain_http.write() {
            debug!(registry = %image.registry, "downgrading registry to plain HTTP");
            set.insert(image.registry.clone());
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Compute the `sha256:<hex>` digest of `data`.
pub(crate) fn sha256_digest(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    let hex: String = hash.iter().map(|b| format!("{b:02x}")).collect();
    format!("sha256:{hex}")
}

/// Flatten an error and its sources into one searchable message.
fn error_chain(err: &ReferrerError) -> String {
    let mut msg = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}

/// Extract a parameter value from a `www-authenticate` header.
/// E.g. `extract_param(header, "realm")` returns the value of `realm="…"`.
fn extract_param(header: &str, param: &str) -> Option<String> {
    let search = format!("{param}=\"");
    if let Some(start) = header.find(&search) {
        let value_start = start + search.len();
        if let Some(end) = header[value_start..].find('"') {
            return Some(header[value_start..value_start + end].to_string());
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory `Remote` serving canned manifests, indexes, and blobs.
    #[derive(Default)]
    pub struct MockRemote {
        /// Raw index bytes returned by `list_referrers`; `None` simulates a
        /// registry without the endpoint.
        pub referrers_index: Option<Vec<u8>>,
        /// Manifest bytes keyed by full reference string.
        manifests_by_ref: HashMap<String, Vec<u8>>,
        /// Manifest bytes keyed by digest.
        manifests_by_digest: HashMap<String, Vec<u8>>,
        /// Blob bytes keyed by digest.
        blobs: HashMap<String, Vec<u8>>,
        /// How many times `should_retry_plain_http` still answers true.
        pub plain_http_retries: Mutex<usize>,
        pub list_calls: AtomicUsize,
        pub resolve_calls: AtomicUsize,
        pub blob_calls: AtomicUsize,
    }

    impl MockRemote {
        pub fn new() -> Self {
            Self::default()
        }

        /// Register a manifest reachable both by reference and by digest.
        /// Returns the manifest digest.
        pub fn add_manifest(&mut self, reference: &str, bytes: &[u8]) -> String {
            let digest = sha256_digest(bytes);
            self.manifests_by_ref
                .insert(reference.to_string(), bytes.to_vec());
            self.manifests_by_digest
                .insert(digest.clone(), bytes.to_vec());
            digest
        }

        /// Register a blob, returning its digest.
        pub fn add_blob(&mut self, bytes: &[u8]) -> String {
            let digest = sha256_digest(bytes);
            self.blobs.insert(digest.clone(), bytes.to_vec());
            digest
        }
    }

    #[async_trait]
    impl Remote for MockRemote {
        async fn list_referrers(&self, _image: &ImageRef, _subject: &str) -> Result<Vec<u8>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            self.referrers_index.clone().ok_or_else(|| {
                ReferrerError::Registry("referrers endpoint not supported".to_string())
            })
        }

        async fn resolve(&self, image: &ImageRef) -> Result<Descriptor> {
            self.resolve_calls.fetch_add(1, Ordering::SeqCst);
            let key = image.to_string();
            let bytes = self
                .manifests_by_ref
                .get(&key)
                .ok_or_else(|| ReferrerError::Registry(format!("manifest {key} not found")))?;
            Ok(Descriptor {
                media_type: manifest::MEDIA_TYPE_OCI_MANIFEST.to_string(),
                digest: sha256_digest(bytes),
                size: bytes.len() as u64,
                annotations: Default::default(),
            })
        }

        async fn fetch_manifest(&self, _image: &ImageRef, desc: &Descriptor) -> Result<Vec<u8>> {
            self.manifests_by_digest
                .get(&desc.digest)
                .cloned()
                .ok_or_else(|| {
                    ReferrerError::Registry(format!("manifest {} not found", desc.digest))
                })
        }

        async fn fetch_blob(&self, _image: &ImageRef, desc: &Descriptor) -> Result<Vec<u8>> {
            self.blob_calls.fetch_add(1, Ordering::SeqCst);
            self.blobs
                .get(&desc.digest)
                .cloned()
                .ok_or_else(|| ReferrerError::Registry(format!("blob {} not found", desc.digest)))
        }

        fn should_retry_plain_http(&self, _image: &ImageRef, _err: &ReferrerError) -> bool {
            let mut left = self
                .plain_http_retries
                .lock()
                .expect("plain_http_retries lock poisoned");
            if *left > 0 {
                *left -= 1;
                true
            } else {
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_localhost_is_http() {
        let c = RegistryClient::new(false);
        assert_eq!(c.scheme("localhost:5000"), "http");
        assert_eq!(c.scheme("127.0.0.1:5000"), "http");
        assert_eq!(c.scheme("localhost"), "http");
    }

    #[test]
    fn scheme_remote_is_https() {
        let c = RegistryClient::new(false);
        assert_eq!(c.scheme("ghcr.io"), "https");
        assert_eq!(c.scheme("my.registry.io:443"), "https");
    }

    #[test]
    fn plain_http_downgrade_requires_insecure() {
        let secure = RegistryClient::new(false);
        let image = ImageRef::parse("my.registry.io/repo:tag").unwrap();
        let err = ReferrerError::Registry("tls handshake failed".to_string());
        assert!(!secure.should_retry_plain_http(&image, &err));

        let insecure = RegistryClient::new(true);
        assert!(insecure.should_retry_plain_http(&image, &err));
        // Host is downgraded; further failures do not retry again.
        assert_eq!(insecure.scheme("my.registry.io"), "http");
        assert!(!insecure.should_retry_plain_http(&image, &err));
    }

    #[test]
    fn plain_http_downgrade_ignores_deterministic_errors() {
        let c = RegistryClient::new(true);
        let image = ImageRef::parse("my.registry.io/repo:tag").unwrap();
        let err = ReferrerError::Parse("tls is not the problem here".to_string());
        assert!(!c.should_retry_plain_http(&image, &err));
    }

    #[test]
    fn plain_http_downgrade_ignores_non_tls_transport_errors() {
        let c = RegistryClient::new(true);
        let image = ImageRef::parse("my.registry.io/repo:tag").unwrap();
        let err = ReferrerError::Registry("GET https://… returned 500".to_string());
        assert!(!c.should_retry_plain_http(&image, &err));
    }

    #[test]
    fn sha256_digest_format() {
        let d = sha256_digest(b"hello");
        assert!(d.starts_with("sha256:"));
        assert_eq!(d.len(), "sha256:".len() + 64);
    }

    #[test]
    fn extract_param_works() {
        let header = r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:repo:pull""#;
        assert_eq!(
            extract_param(header, "realm"),
            Some("https://auth.example.com/token".to_string())
        );
        assert_eq!(
            extract_param(header, "service"),
            Some("registry.example.com".to_string())
        );
        assert_eq!(extract_param(header, "missing"), None);
    }
}
