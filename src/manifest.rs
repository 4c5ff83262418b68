use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ReferrerError, Result};

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// A content-addressable descriptor used in manifests, indexes, and as the
/// resolver's result type (the located metadata layer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    pub digest: String,

    #[serde(default)]
    pub size: u64,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// OCI Image Manifest
// ---------------------------------------------------------------------------

/// An OCI image manifest, including the `subject` field used by referrer
/// artifacts to bind themselves to the manifest they annotate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    #[serde(rename = "artifactType", default)]
    pub artifact_type: Option<String>,

    pub config: Descriptor,

    pub layers: Vec<Descriptor>,

    #[serde(default)]
    pub subject: Option<Descriptor>,
}

impl Manifest {
    /// The conventional location of the filesystem-metadata layer: appended
    /// last to the synthetic referrer manifest.
    pub fn last_layer(&self) -> Option<&Descriptor> {
        self.layers.last()
    }
}

// ---------------------------------------------------------------------------
// Image Index
// ---------------------------------------------------------------------------

/// An OCI image index, as returned by the referrers listing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    pub manifests: Vec<Descriptor>,
}

// ---------------------------------------------------------------------------
// Digest validation
// ---------------------------------------------------------------------------

/// Check that `digest` has a supported `<algorithm>:<hex>` form before it is
/// used in a registry URL or compared against manifest contents.
pub fn validate_digest(digest: &str) -> Result<()> {
    let (algo, hex) = digest
        .split_once(':')
        .ok_or_else(|| ReferrerError::Parse(format!("digest {digest:?} missing algorithm")))?;

    let expected_len = match algo {
        "sha256" => 64,
        "sha512" => 128,
        other => {
            return Err(ReferrerError::Parse(format!(
                "unsupported digest algorithm {other:?}"
            )))
        }
    };

    if hex.len() != expected_len || !hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
        return Err(ReferrerError::Parse(format!(
            "malformed {algo} digest {digest:?}"
        )));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Media type constants
// ---------------------------------------------------------------------------

pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_REFERRER_MANIFEST: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "artifactType": "application/vnd.example.metadata.v1",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": "sha256:aaaa",
            "size": 123
        },
        "layers": [
            {
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": "sha256:bbbb",
                "size": 456
            },
            {
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": "sha256:cccc",
                "size": 789,
                "annotations": { "containerd.io/snapshot/nydus-bootstrap": "true" }
            }
        ],
        "subject": {
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": "sha256:dddd",
            "size": 1011
        }
    }"#;

    #[test]
    fn parse_referrer_manifest() {
        let m: Manifest = serde_json::from_str(SAMPLE_REFERRER_MANIFEST).unwrap();
        assert_eq!(m.schema_version, 2);
        assert_eq!(m.layers.len(), 2);
        assert_eq!(m.subject.as_ref().unwrap().digest, "sha256:dddd");

        let last = m.last_layer().unwrap();
        assert_eq!(last.digest, "sha256:cccc");
        assert!(crate::label::is_metadata_layer(&last.annotations));
    }

    #[test]
    fn parse_manifest_without_subject() {
        let raw = r#"{
            "schemaVersion": 2,
            "config": { "mediaType": "c", "digest": "sha256:aa", "size": 1 },
            "layers": []
        }"#;
        let m: Manifest = serde_json::from_str(raw).unwrap();
        assert!(m.subject.is_none());
        assert!(m.last_layer().is_none());
    }

    #[test]
    fn parse_index() {
        let raw = r#"{
            "schemaVersion": 2,
            "manifests": [
                { "mediaType": "application/vnd.oci.image.manifest.v1+json",
                  "digest": "sha256:eeee", "size": 42 }
            ]
        }"#;
        let idx: ImageIndex = serde_json::from_str(raw).unwrap();
        assert_eq!(idx.manifests.len(), 1);
        assert_eq!(idx.manifests[0].digest, "sha256:eeee");
    }

    #[test]
    fn digest_validation_accepts_sha256() {
        let d = format!("sha256:{}", "a".repeat(64));
        assert!(validate_digest(&d).is_ok());
    }

    #[test]
    fn digest_validation_accepts_sha512() {
        let d = format!("sha512:{}", "0123456789abcdef".repeat(8));
        assert!(validate_digest(&d).is_ok());
    }

    #[test]
    fn digest_validation_rejects_bad_forms() {
        assert!(validate_digest("sha256:short").is_err());
        assert!(validate_digest("md5:abcd").is_err());
        assert!(validate_digest("not-a-digest").is_err());
        // Uppercase hex is not canonical.
        let d = format!("sha256:{}", "A".repeat(64));
        assert!(validate_digest(&d).is_err());
    }
}
