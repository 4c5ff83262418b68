use std::fmt;

use crate::{ReferrerError, Result};

/// A parsed OCI image reference: `registry/repository[:tag][@digest]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry hostname, possibly with a port (e.g. "localhost:5000").
    pub registry: String,
    /// Repository path (e.g. "library/alpine").
    pub repository: String,
    /// Tag component, if present.
    pub tag: Option<String>,
    /// Digest component, if present.
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parse a raw image reference string.
    ///
    /// Supported formats:
    /// - `alpine:latest`
    /// - `ubuntu`
    /// - `ghcr.io/foo/bar:v1`
    /// - `my.registry.io/org/repo@sha256:abc123`
    /// - `my.registry.io/org/repo:tag@sha256:abc123`
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ReferrerError::Parse("empty image reference".to_string()));
        }

        // Split off the digest first so a trailing `@sha256:…` never
        // confuses tag extraction.
        let (rest, digest) = match raw.find('@') {
            Some(at_pos) => (&raw[..at_pos], Some(raw[at_pos + 1..].to_string())),
            None => (raw, None),
        };
        if let Some(ref d) = digest {
            if !d.contains(':') {
                return Err(ReferrerError::Parse(format!("malformed digest in {raw:?}")));
            }
        }

        // Split off the tag. A tag colon always comes after the last '/';
        // a colon before it belongs to the registry port.
        let (name_part, tag) = match rest.rfind(':') {
            Some(colon_pos) => {
                let after_last_slash = rest.rfind('/').map(|p| p + 1).unwrap_or(0);
                if colon_pos >= after_last_slash {
                    (&rest[..colon_pos], Some(rest[colon_pos + 1..].to_string()))
                } else {
                    (rest, None)
                }
            }
            None => (rest, None),
        };

        if name_part.is_empty() {
            return Err(ReferrerError::Parse(format!("missing repository in {raw:?}")));
        }
        if let Some(ref t) = tag {
            if t.is_empty() || t.contains(':') || t.contains('/') {
                return Err(ReferrerError::Parse(format!("malformed tag in {raw:?}")));
            }
        }

        // Determine registry vs repository. A leading component is treated
        // as a registry hostname when it contains a dot or a colon (port).
        let (registry, repository) = match name_part.find('/') {
            Some(slash_pos) => {
                let first = &name_part[..slash_pos];
                if first.contains('.') || first.contains(':') {
                    (first.to_string(), name_part[slash_pos + 1..].to_string())
                } else {
                    ("registry-1.docker.io".to_string(), name_part.to_string())
                }
            }
            None => (
                "registry-1.docker.io".to_string(),
                format!("library/{}", name_part),
            ),
        };

        if repository.is_empty() || repository.contains(':') {
            return Err(ReferrerError::Parse(format!(
                "malformed repository in {raw:?}"
            )));
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Reference string used when requesting a manifest: the digest when one
    /// is present, otherwise the tag (defaulting to "latest").
    pub fn manifest_reference(&self) -> &str {
        match (&self.digest, &self.tag) {
            (Some(d), _) => d,
            (None, Some(t)) => t,
            (None, None) => "latest",
        }
    }

    /// Base tag used for suffix-based referrer discovery.
    ///
    /// A reference without a tag defaults to "latest", but a digest-only
    /// reference has no tag to extend with a suffix and is a hard error.
    pub fn fallback_tag(&self) -> Result<&str> {
        match (&self.tag, &self.digest) {
            (Some(t), _) => Ok(t),
            (None, None) => Ok("latest"),
            (None, Some(_)) => Err(ReferrerError::Parse(format!(
                "digest-only reference {self} has no tag for suffix-based discovery"
            ))),
        }
    }

    /// Derive the ordered list of fallback candidate references by appending
    /// each suffix to the base tag. Order is preserved: the first candidate
    /// that validates wins.
    pub fn referrer_candidates(&self, suffixes: &[String]) -> Result<Vec<ImageRef>> {
        let base = self.fallback_tag()?;
        Ok(suffixes
            .iter()
            .map(|suffix| ImageRef {
                registry: self.registry.clone(),
                repository: self.repository.clone(),
                tag: Some(format!("{base}{suffix}")),
                digest: None,
            })
            .collect())
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(ref t) = self.tag {
            write!(f, ":{t}")?;
        }
        if let Some(ref d) = self.digest {
            write!(f, "@{d}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
