use std::sync::Arc;

use tracing::debug;

use crate::error::{ReferrerError, Result};
use crate::label;
use crate::manifest::{validate_digest, Descriptor, ImageIndex, Manifest};
use crate::reference::ImageRef;
use crate::registry::Remote;

/// Containerd restricts the max size of a manifest index to 8M; follow it.
const MAX_MANIFEST_INDEX_SIZE: usize = 0x80_0000;

/// Outcome of one discovery strategy.
enum Probe {
    /// The metadata layer descriptor was located.
    Found(Descriptor),
    /// The strategy cannot produce a result; carries the soft failures that
    /// disqualified it so the blanket retry can classify them.
    Miss(Vec<ReferrerError>),
}

/// Locates the referrer artifact of an image manifest: standards-based
/// referrers listing first, conventionally-suffixed tags second.
pub struct Resolver {
    remote: Arc<dyn Remote>,
    tag_suffixes: Vec<String>,
}

impl Resolver {
    pub fn new(remote: Arc<dyn Remote>, tag_suffixes: Vec<String>) -> Self {
        Self {
            remote,
            tag_suffixes,
        }
    }

    /// Resolve the descriptor of the metadata layer attached to the manifest
    /// `expected` of `image`.
    ///
    /// Both discovery paths are tried in order; if either fails in a way the
    /// transport classifies as "retry over plain HTTP", the whole two-path
    /// resolution is re-run exactly once over the downgraded transport.
    pub async fn resolve(&self, image: &ImageRef, expected: &str) -> Result<Descriptor> {
        validate_digest(expected)?;

        let mut outcome = self.attempt(image, expected).await;

        let retry = match &outcome {
            Ok(Probe::Miss(misses)) => misses
                .iter()
                .any(|e| self.remote.should_retry_plain_http(image, e)),
            Err(e) => self.remote.should_retry_plain_http(image, e),
            Ok(Probe::Found(_)) => false,
        };
        if retry {
            debug!(image = %image, "retrying referrer resolution over plain HTTP");
            outcome = self.attempt(image, expected).await;
        }

        match outcome? {
            Probe::Found(desc) => Ok(desc),
            Probe::Miss(misses) => {
                let causes: Vec<String> = misses.iter().map(|e| e.to_string()).collect();
                Err(ReferrerError::NotFound(format!(
                    "no referrer for {image} ({})",
                    if causes.is_empty() {
                        "no discovery path applicable".to_string()
                    } else {
                        causes.join("; ")
                    },
                )))
            }
        }
    }

    /// One full pass over both discovery strategies. `Err` is a hard failure
    /// that must not fall through to the next strategy.
    async fn attempt(&self, image: &ImageRef, expected: &str) -> Result<Probe> {
        let mut misses = Vec::new();

        match self.check_standard(image, expected).await? {
            Probe::Found(desc) => return Ok(Probe::Found(desc)),
            Probe::Miss(errs) => misses.extend(errs),
        }

        match self.check_tag_based(image, expected).await? {
            Probe::Found(desc) => Ok(Probe::Found(desc)),
            Probe::Miss(errs) => {
                misses.extend(errs);
                Ok(Probe::Miss(misses))
            }
        }
    }

    /// Standards-based discovery via the registry's referrers endpoint.
    ///
    /// By convention the first listed manifest is fetched and its last layer
    /// taken as the candidate; there is no filtering by artifact type.
    async fn check_standard(&self, image: &ImageRef, expected: &str) -> Result<Probe> {
        let index_bytes = match self.remote.list_referrers(image, expected).await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(image = %image, error = %e, "referrers endpoint unavailable");
                return Ok(Probe::Miss(vec![e]));
            }
        };

        if index_bytes.len() > MAX_MANIFEST_INDEX_SIZE {
            return Err(ReferrerError::Validation(format!(
                "referrers index exceeds {MAX_MANIFEST_INDEX_SIZE} bytes"
            )));
        }

        let index: ImageIndex = match serde_json::from_slice(&index_bytes) {
            Ok(index) => index,
            Err(e) => return Ok(Probe::Miss(vec![e.into()])),
        };
        let Some(first) = index.manifests.first() else {
            return Ok(Probe::Miss(vec![ReferrerError::Validation(
                "empty referrer list".to_string(),
            )]));
        };

        let manifest_bytes = match self.remote.fetch_manifest(image, first).await {
            Ok(bytes) => bytes,
            Err(e) => return Ok(Probe::Miss(vec![e])),
        };
        let manifest: Manifest = match serde_json::from_slice(&manifest_bytes) {
            Ok(m) => m,
            Err(e) => return Ok(Probe::Miss(vec![e.into()])),
        };

        match metadata_layer(&manifest) {
            Ok(desc) => {
                debug!(image = %image, digest = %desc.digest, "referrer found via referrers endpoint");
                Ok(Probe::Found(desc))
            }
            Err(e) => Ok(Probe::Miss(vec![e])),
        }
    }

    /// Tag-based discovery: try each configured suffix in order and keep the
    /// first candidate whose manifest binds back to `expected`.
    async fn check_tag_based(&self, image: &ImageRef, expected: &str) -> Result<Probe> {
        if self.tag_suffixes.is_empty() {
            debug!(image = %image, "no tag suffixes configured; skipping tag-based discovery");
            return Ok(Probe::Miss(Vec::new()));
        }

        // Digest-only references cannot be extended with a suffix.
        let candidates = image.referrer_candidates(&self.tag_suffixes)?;

        let mut misses = Vec::new();
        for candidate in &candidates {
            match self.validate_candidate(candidate, expected).await {
                Ok(desc) => {
                    debug!(candidate = %candidate, digest = %desc.digest, "referrer found via tag");
                    return Ok(Probe::Found(desc));
                }
                Err(e) => {
                    debug!(candidate = %candidate, error = %e, "candidate rejected");
                    misses.push(e);
                }
            }
        }

        Ok(Probe::Miss(misses))
    }

    /// Check one candidate reference: it must resolve, its manifest must name
    /// `expected` as subject, and its last layer must carry the metadata
    /// marker. Tag-based discovery has no structural guarantee, so the
    /// subject binding is what proves the candidate refers to our manifest.
    async fn validate_candidate(&self, candidate: &ImageRef, expected: &str) -> Result<Descriptor> {
        let desc = self.remote.resolve(candidate).await?;
        let bytes = self.remote.fetch_manifest(candidate, &desc).await?;
        let manifest: Manifest = serde_json::from_slice(&bytes)?;

        let subject = manifest.subject.as_ref().ok_or_else(|| {
            ReferrerError::Validation(format!("{candidate} has no subject field"))
        })?;
        if subject.digest != expected {
            return Err(ReferrerError::Validation(format!(
                "{candidate} subject digest {} does not match {expected}",
                subject.digest,
            )));
        }

        metadata_layer(&manifest)
    }
}

/// The last layer of a referrer manifest, which must carry the metadata
/// marker annotation.
fn metadata_layer(manifest: &Manifest) -> Result<Descriptor> {
    let layer = manifest
        .last_layer()
        .ok_or_else(|| ReferrerError::Validation("manifest has no layers".to_string()))?;
    if !label::is_metadata_layer(&layer.annotations) {
        return Err(ReferrerError::Validation(
            "last layer is not a metadata layer".to_string(),
        ));
    }
    Ok(layer.clone())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
