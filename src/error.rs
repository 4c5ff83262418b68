/// Errors produced by the referrer fetcher.
#[derive(Debug, thiserror::Error)]
pub enum ReferrerError {
    /// Malformed image reference, digest, or manifest/index JSON.
    #[error("parse error: {0}")]
    Parse(String),

    /// No referrer artifact discoverable by either the standards-based or
    /// the tag-based path. Callers should not retry with the same inputs.
    #[error("no referrer found: {0}")]
    NotFound(String),

    /// A candidate looked like a referrer but failed a binding check
    /// (subject digest mismatch, missing artifact marker, digest mismatch).
    #[error("validation error: {0}")]
    Validation(String),

    /// Registry-side failure (unexpected status, malformed auth challenge).
    #[error("registry error: {0}")]
    Registry(String),

    /// Filesystem failure while persisting the metadata file.
    #[error("write error: {0}")]
    Write(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ReferrerError {
    /// Transport-level failures that a caller may retry; parse, validation
    /// and not-found errors are deterministic for the same inputs.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReferrerError::Http(_) | ReferrerError::Io(_) | ReferrerError::Registry(_)
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ReferrerError>;
