use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::error::{ReferrerError, Result};
use crate::manifest::{validate_digest, Descriptor};
use crate::reference::ImageRef;
use crate::referrer::Resolver;
use crate::registry::Remote;
use crate::unpack;

/// Location of the metadata payload inside the artifact layer.
pub const METADATA_NAME_IN_LAYER: &str = "image/image.boot";

// ---------------------------------------------------------------------------
// PathLocks
// ---------------------------------------------------------------------------

/// Registry of per-destination-path gates, created lazily and retained for
/// the process lifetime. The key space is bounded by the number of distinct
/// metadata destinations the process manages, not by request volume, so
/// entries are never evicted.
pub struct PathLocks {
    locks: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Atomic get-or-create of the gate for `path`; exactly one gate exists
    /// per path even under concurrent first access.
    fn gate(&self, path: &Path) -> Arc<AsyncMutex<()>> {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(map.entry(path.to_path_buf()).or_default())
    }
}

impl Default for PathLocks {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// MetadataFetcher
// ---------------------------------------------------------------------------

/// Orchestrates referrer resolution, blob fetch, and atomic extraction,
/// deduplicating concurrent fetches for the same destination path.
pub struct MetadataFetcher {
    remote: Arc<dyn Remote>,
    resolver: Resolver,
    locks: PathLocks,
}

impl MetadataFetcher {
    pub fn new(remote: Arc<dyn Remote>, tag_suffixes: Vec<String>) -> Self {
        let resolver = Resolver::new(Arc::clone(&remote), tag_suffixes);
        Self {
            remote,
            resolver,
            locks: PathLocks::new(),
        }
    }

    /// Probe whether a referrer artifact exists for `expected` without
    /// touching the filesystem.
    pub async fn check_referrer(&self, image: &ImageRef, expected: &str) -> Result<Descriptor> {
        self.resolver.resolve(image, expected).await
    }

    /// Locate the referrer artifact of `expected`, fetch it, and extract the
    /// metadata payload to `dest`.
    ///
    /// Concurrent calls for the same `dest` are serialized by a per-path
    /// gate; once the file exists, callers return without any network work.
    /// The gate only avoids redundant fetches — the on-disk transitions in
    /// [`unpack`] are atomic on their own.
    pub async fn fetch_metadata(&self, image: &ImageRef, expected: &str, dest: &Path) -> Result<()> {
        validate_digest(expected)?;

        let gate = self.locks.gate(dest);
        let _guard = gate.lock().await;

        // Safe now that we hold the gate: a visible file is always a
        // completed fetch, never a partial one.
        if dest.exists() {
            debug!(path = %dest.display(), "metadata file already exists, skipping fetch");
            return Ok(());
        }

        let desc = self.resolver.resolve(image, expected).await?;

        let mut result = self.fetch_and_unpack(image, &desc, dest).await;
        if let Err(ref e) = result {
            if self.remote.should_retry_plain_http(image, e) {
                debug!(image = %image, "retrying metadata fetch over plain HTTP");
                result = self.fetch_and_unpack(image, &desc, dest).await;
            }
        }

        if let Err(e) = result {
            // Leave nothing a later existence check could mistake for a
            // completed fetch.
            let _ = std::fs::remove_file(dest);
            return Err(e);
        }
        Ok(())
    }

    async fn fetch_and_unpack(
        &self,
        image: &ImageRef,
        desc: &Descriptor,
        dest: &Path,
    ) -> Result<()> {
        info!(
            image = %image,
            digest = %desc.digest,
            path = %dest.display(),
            "fetching referrer metadata",
        );
        let bytes = self.remote.fetch_blob(image, desc).await?;

        // Decompression and tar scanning are CPU-bound; run on the blocking
        // pool the same way layer unpacking does.
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || {
            unpack::extract_and_write(&bytes[..], METADATA_NAME_IN_LAYER, &dest)
        })
        .await
        .map_err(|e| ReferrerError::Write(format!("unpack task panicked: {e}")))?
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
