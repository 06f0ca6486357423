//! # Layer Blob Store
//!
//! Holds compressed layer blobs by their SHA-256 digest. The overlay engine
//! reads layer content from here when it materializes a layer; nothing else
//! touches blob paths.
//!
//! ## Storage Model
//!
//! ```text
//! <base>/blobs/
//! └── sha256/
//!     ├── ab/
//!     │   └── abcd1234...
//!     └── cd/
//!         └── cdef5678...
//! ```
//!
//! The first two hex characters form a shard directory.
//!
//! ## Integrity
//!
//! - [`BlobStore::put_blob`] hashes the content and rejects a mismatch with
//!   the declared digest before anything is written.
//! - Digests are parsed strictly: algorithm must be `sha256` and the hash
//!   exactly 64 lowercase hex characters, so a digest can never name a path
//!   outside the store.
//! - Writes go to a uniquely named temp file and are renamed into place.

use crate::constants::MAX_LAYER_SIZE;
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Length of a hex-encoded SHA-256 hash.
const SHA256_HEX_LEN: usize = 64;

/// Content-addressed blob store for layer archives.
#[derive(Debug, Clone)]
pub struct BlobStore {
    base_dir: PathBuf,
}

impl BlobStore {
    /// Opens (creating if needed) a blob store rooted at `base_dir`.
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        if let Err(e) = fs::create_dir_all(&base_dir) {
            return Err(Error::StorageInitFailed {
                path: base_dir,
                reason: e.to_string(),
            });
        }

        info!("Opened blob store at {}", base_dir.display());
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Canonical `sha256:<hex>` digest of `data`.
    pub fn digest_of(data: &[u8]) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(data)))
    }

    /// True when `digest` is well-formed and its blob is on disk.
    pub fn has_blob(&self, digest: &str) -> bool {
        matches!(self.blob_path(digest), Ok(path) if path.is_file())
    }

    /// Reads a blob, refusing anything larger than [`MAX_LAYER_SIZE`].
    pub fn get_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest)?;
        let missing = || Error::BlobNotFound {
            digest: digest.to_string(),
        };

        let size = fs::metadata(&path).map_err(|_| missing())?.len();
        let limit = MAX_LAYER_SIZE as u64;
        if size > limit {
            return Err(Error::ImageTooLarge { size, limit });
        }
        fs::read(&path).map_err(|_| missing())
    }

    /// Stores `data` under `digest` once its hash has been checked.
    pub fn put_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        let path = self.blob_path(digest)?;

        let actual = Self::digest_of(data);
        if actual != digest {
            return Err(Error::StorageWriteFailed(format!(
                "digest mismatch: {} was declared but content hashes to {}",
                digest, actual
            )));
        }
        if path.is_file() {
            debug!("Blob {} present, skipping write", digest);
            return Ok(());
        }

        write_atomic(&path, data).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        debug!("Wrote blob {} ({} bytes)", digest, data.len());
        Ok(())
    }

    /// Stores `data` and returns its digest.
    pub fn put_bytes(&self, data: &[u8]) -> Result<String> {
        let digest = Self::digest_of(data);
        self.put_blob(&digest, data)?;
        Ok(digest)
    }

    /// Removes a blob. Removing an absent blob is not an error.
    pub fn remove_blob(&self, digest: &str) -> Result<()> {
        let path = self.blob_path(digest)?;
        match fs::remove_file(&path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(Error::StorageWriteFailed(e.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// `<base>/sha256/<first two hex chars>/<hex>`.
    fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let hash = parse_digest(digest)?;
        Ok(self.base_dir.join("sha256").join(&hash[..2]).join(hash))
    }
}

/// Writes `data` next to `path` under a unique name and renames it over
/// `path`. Concurrent writers of identical content race harmlessly.
fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(shard) = path.parent() {
        fs::create_dir_all(shard)?;
    }
    let staging = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
    fs::write(&staging, data)?;
    fs::rename(&staging, path).inspect_err(|_| {
        let _ = fs::remove_file(&staging);
    })
}

/// Splits `sha256:<hex>` and returns the validated hex part.
pub(crate) fn parse_digest(digest: &str) -> Result<&str> {
    let invalid = |reason: &str| {
        Error::StorageWriteFailed(format!("invalid digest '{}': {}", digest, reason))
    };

    let (algo, hash) = digest
        .split_once(':')
        .ok_or_else(|| invalid("missing algorithm prefix"))?;
    if algo != "sha256" {
        return Err(invalid("only sha256 is supported"));
    }
    if hash.len() != SHA256_HEX_LEN
        || !hash.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        return Err(invalid("hash must be 64 lowercase hex characters"));
    }
    Ok(hash)
}
