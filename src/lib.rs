//! oci-referrer: discovery and fetching of lazy-loading filesystem metadata
//! published as OCI referrer artifacts.
//!
//! An image optimized for lazy loading carries its filesystem metadata in a
//! side-artifact rather than in the image itself. This crate locates that
//! artifact for a given image manifest — via the OCI referrers endpoint when
//! the registry supports it, via conventionally-suffixed tags when it does
//! not — and extracts the metadata payload to a local path with crash-safe,
//! all-or-nothing visibility.
//!
//! ```no_run
//! use oci_referrer::{Config, ReferrerClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ReferrerClient::new(Config::default());
//!     client
//!         .fetch_metadata(
//!             "registry.example.com/app:v1",
//!             "sha256:6c3c624b58dbbcd3c0dd82b4c53f04194d1247c6eebdaab7c610cf7d66709b3b",
//!             "/var/lib/snapshots/1/image.boot".as_ref(),
//!         )
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! Callers that need a deadline wrap the calls in `tokio::time::timeout`;
//! cancellation aborts cleanly because staged data never becomes visible
//! under the final name.

pub mod error;
pub mod fetch;
pub mod label;
pub mod manifest;
pub mod reference;
pub mod referrer;
pub mod registry;
pub mod unpack;

pub use error::{ReferrerError, Result};
pub use fetch::{MetadataFetcher, PathLocks, METADATA_NAME_IN_LAYER};
pub use manifest::Descriptor;
pub use reference::ImageRef;

use std::path::Path;
use std::sync::Arc;

use tracing::info;

/// Configuration for [`ReferrerClient`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Tag suffixes tried in order by the fallback discovery path. An empty
    /// list disables tag-based discovery entirely.
    pub tag_suffixes: Vec<String>,
    /// Permit downgrading to plain HTTP after a TLS failure.
    pub insecure: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tag_suffixes: vec!["-nydus".to_string()],
            insecure: false,
        }
    }
}

/// High-level client: referrer discovery plus metadata materialization.
pub struct ReferrerClient {
    fetcher: MetadataFetcher,
}

impl ReferrerClient {
    pub fn new(config: Config) -> Self {
        let remote = Arc::new(registry::RegistryClient::new(config.insecure));
        Self {
            fetcher: MetadataFetcher::new(remote, config.tag_suffixes),
        }
    }

    /// Check whether a referrer artifact exists for the image manifest
    /// `manifest_digest` of `image_ref`, returning the descriptor of its
    /// metadata layer. No filesystem state is touched.
    pub async fn check_referrer(
        &self,
        image_ref: &str,
        manifest_digest: &str,
    ) -> Result<Descriptor> {
        let image = ImageRef::parse(image_ref)?;
        manifest::validate_digest(manifest_digest)?;
        self.fetcher.check_referrer(&image, manifest_digest).await
    }

    /// Fetch the referrer artifact of `manifest_digest` and extract its
    /// metadata payload to `dest`. Returns immediately when `dest` already
    /// exists; concurrent calls for the same `dest` fetch at most once.
    pub async fn fetch_metadata(
        &self,
        image_ref: &str,
        manifest_digest: &str,
        dest: &Path,
    ) -> Result<()> {
        let image = ImageRef::parse(image_ref)?;
        info!(
            image = %image,
            manifest_digest,
            path = %dest.display(),
            "fetching lazy-loading metadata",
        );
        self.fetcher.fetch_metadata(&image, manifest_digest, dest).await
    }
}
