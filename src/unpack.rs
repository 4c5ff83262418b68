use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::error::{ReferrerError, Result};

/// Attempts at picking a unique staging name before giving up.
#[cfg(target_os = "linux")]
const SALT_RETRIES: u32 = 16;

/// Gzip magic bytes (1f 8b).
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
/// Zstandard frame magic (28 b5 2f fd, little endian).
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Extract the entry named `entry_name` from a (possibly compressed) tar
/// stream and persist it at `target` with all-or-nothing visibility.
///
/// On success `target` holds exactly the entry's bytes. On any failure
/// `target` is either absent or keeps its pre-call contents; a partial or
/// empty file never becomes visible under the final name, even when the
/// process dies mid-write or several writers race for the same target.
pub fn extract_and_write(reader: impl Read, entry_name: &str, target: &Path) -> Result<()> {
    let decompressed = decompress_stream(Box::new(reader))?;
    let mut archive = tar::Archive::new(decompressed);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let matched = {
            let path = entry.path()?;
            let name = path.to_string_lossy();
            name.strip_prefix("./").unwrap_or(&name) == entry_name
        };
        if matched {
            return atomic_write(target, &mut entry);
        }
    }

    Err(ReferrerError::Validation(format!(
        "entry {entry_name:?} not found in layer archive"
    )))
}

// ---------------------------------------------------------------------------
// Decompression
// ---------------------------------------------------------------------------

enum Compression {
    Gzip,
    Zstd,
    Plain,
}

fn detect_compression(header: &[u8]) -> Compression {
    if header.len() >= GZIP_MAGIC.len() && header[..GZIP_MAGIC.len()] == GZIP_MAGIC {
        Compression::Gzip
    } else if header.len() >= ZSTD_MAGIC.len() && header[..ZSTD_MAGIC.len()] == ZSTD_MAGIC {
        Compression::Zstd
    } else {
        Compression::Plain
    }
}

/// Wrap `reader` in the right decompressor by sniffing its leading bytes;
/// streams that are neither gzip nor zstd pass through as plain tar.
fn decompress_stream<'a>(mut reader: Box<dyn Read + 'a>) -> Result<Box<dyn Read + 'a>> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    // Re-chain the sniffed bytes in front of the remaining stream.
    let rewound = io::Cursor::new(header[..filled].to_vec()).chain(reader);

    Ok(match detect_compression(&header[..filled]) {
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(rewound)),
        Compression::Zstd => Box::new(zstd::Decoder::new(rewound)?),
        Compression::Plain => Box::new(rewound),
    })
}

// ---------------------------------------------------------------------------
// Atomic persistence
// ---------------------------------------------------------------------------

/// Staging name salted with PID, fd number, timestamp, and attempt counter.
/// Collisions are astronomically unlikely but still retried a bounded number
/// of times.
#[cfg(target_os = "linux")]
fn salted_sibling(target: &Path, fd: i32, attempt: u32) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "metadata".to_string());
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    target.with_file_name(format!(
        ".{name}.{pid}.{fd}.{nanos}.{attempt}.tmp",
        pid = std::process::id(),
    ))
}

/// Persist `reader`'s bytes at `target`.
///
/// The bytes are staged into an anonymous file (no directory entry, so a
/// crash leaves nothing visible), fsynced, then linked at the final name via
/// `/proc/self/fd`. If the name already exists another writer got there
/// first; our complete copy is then surfaced through a salted staging entry
/// and renamed over the target, which replaces it atomically.
#[cfg(target_os = "linux")]
fn atomic_write(target: &Path, reader: &mut impl Read) -> Result<()> {
    use rustix::fs::{linkat, AtFlags, CWD};
    use std::os::fd::AsRawFd;

    let dir = parent_dir(target);
    // Same directory as the target so the link stays on one filesystem.
    let mut staged = tempfile::tempfile_in(dir)?;
    io::copy(reader, &mut staged)?;
    // Data must be durable before it can become visible.
    staged.sync_all()?;

    let fd = staged.as_raw_fd();
    let proc_path = format!("/proc/self/fd/{fd}");

    // AT_SYMLINK_FOLLOW is required when linking via /proc/self/fd.
    match linkat(
        CWD,
        proc_path.as_str(),
        CWD,
        target,
        AtFlags::SYMLINK_FOLLOW,
    ) {
        Ok(()) => return Ok(()),
        // Target already exists: a concurrent writer completed (or is
        // completing) it. Fall through and replace it with our full copy.
        Err(e) if e == rustix::io::Errno::EXIST => {}
        Err(e) => {
            return Err(ReferrerError::Write(format!(
                "link staged data to {}: {e}",
                target.display()
            )))
        }
    }

    for attempt in 0..SALT_RETRIES {
        let staging = salted_sibling(target, fd, attempt);
        match linkat(
            CWD,
            proc_path.as_str(),
            CWD,
            &staging,
            AtFlags::SYMLINK_FOLLOW,
        ) {
            Ok(()) => {
                // Rename consumes the staging entry on success; remove it on
                // failure so it cannot leak.
                if let Err(e) = fs::rename(&staging, target) {
                    let _ = fs::remove_file(&staging);
                    return Err(ReferrerError::Write(format!(
                        "rename staging onto {}: {e}",
                        target.display()
                    )));
                }
                return Ok(());
            }
            // Salt collision with another concurrent writer.
            Err(e) if e == rustix::io::Errno::EXIST => continue,
            Err(e) => {
                return Err(ReferrerError::Write(format!(
                    "link staged data to {}: {e}",
                    staging.display()
                )))
            }
        }
    }

    Err(ReferrerError::Write(format!(
        "could not stage a unique name next to {}",
        target.display()
    )))
}

/// Portable equivalent: a named temporary file that stays invisible under the
/// final name until the closing rename. The temp file is removed on drop, so
/// failures leave nothing behind either.
#[cfg(not(target_os = "linux"))]
fn atomic_write(target: &Path, reader: &mut impl Read) -> Result<()> {
    let dir = parent_dir(target);
    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    io::copy(reader, staged.as_file_mut())?;
    staged.as_file().sync_all()?;

    match staged.persist_noclobber(target) {
        Ok(_) => Ok(()),
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
            // Another writer completed the target; replace it atomically.
            e.file.persist(target).map(|_| ()).map_err(|e| {
                ReferrerError::Write(format!(
                    "rename staging onto {}: {}",
                    target.display(),
                    e.error
                ))
            })
        }
        Err(e) => Err(ReferrerError::Write(format!(
            "persist staging at {}: {}",
            target.display(),
            e.error
        ))),
    }
}

fn parent_dir(target: &Path) -> &Path {
    match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
