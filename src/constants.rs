//! # Runtime Constants
//!
//! Resource limits, directory layout, file names and schema versions used
//! across the control plane. These constants are the **single source of
//! truth** for on-disk layout and security-critical bounds.
//!
//! ## Cross-References
//!
//! - [`crate::state`]: state directory layout and schema version
//! - [`crate::overlay`]: layer/mount layout and extraction limits
//! - [`crate::storage`]: blob directory layout
//! - [`crate::bundle`]: bundle file names and config size bound
//! - [`crate::runtimes`]: runtime binary and API defaults

use std::time::Duration;

// =============================================================================
// Size Limits
// =============================================================================
//
// Layer extraction limits bound the disk used by a single image. The
// cumulative worst-case is MAX_LAYERS × MAX_LAYER_SIZE compressed, but
// MAX_ROOTFS_SIZE is the effective bound on extracted content.
// =============================================================================

/// Maximum size of a single compressed layer blob (512 MiB).
///
/// **Security**: Checked before a blob is decompressed into the layer
/// repository.
pub const MAX_LAYER_SIZE: usize = 512 * 1024 * 1024;

/// Maximum total extracted size of one image (4 GiB).
///
/// **Attack Vector**: Compression bombs (small compressed, huge uncompressed).
/// Accumulated across every layer of a manifest during extraction.
pub const MAX_ROOTFS_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Maximum number of layers in one image manifest.
pub const MAX_LAYERS: usize = 128;

/// Maximum size of a bundle's `config.json` (1 MiB).
///
/// **Security**: Prevents memory exhaustion when parsing a hostile bundle.
/// Real configurations are typically under 20 KiB.
pub const MAX_CONFIG_SIZE: u64 = 1024 * 1024;

// =============================================================================
// Directory Layout
// =============================================================================
//
// All paths are relative to the configured base directory, which defaults
// to `~/.runplane` for user mode and `/var/lib/runplane` for root.
// =============================================================================

/// Directory name of the per-user base directory under `$HOME`.
pub const USER_BASE_DIR: &str = ".runplane";

/// Base directory used when running as root.
pub const SYSTEM_BASE_DIR: &str = "/var/lib/runplane";

/// Subdirectory for persisted container records.
///
/// Structure: `state/<container-id>/state.json`
pub const STATE_DIR: &str = "state";

/// Subdirectory for content-addressed blobs.
///
/// Structure: `blobs/sha256/<2-char-prefix>/<full-hash>`
pub const BLOB_STORE_DIR: &str = "blobs";

/// Subdirectory for unpacked overlay layers.
///
/// Structure: `layers/<hash>/layer.json` + `layers/<hash>/diff/`
pub const LAYER_DIR: &str = "layers";

/// Subdirectory for per-container overlay mounts.
///
/// Structure: `mounts/<container-id>/{lower,upper,work,merged}`
pub const MOUNT_DIR: &str = "mounts";

/// File holding a persisted container record.
pub const STATE_FILE: &str = "state.json";

/// Metadata file inside each layer directory.
pub const LAYER_METADATA_FILE: &str = "layer.json";

/// Directory holding a layer's unpacked content.
pub const LAYER_DIFF_DIR: &str = "diff";

/// Metadata file inside each mount directory.
pub const MOUNT_METADATA_FILE: &str = "mount.json";

/// Configuration document inside a bundle.
pub const CONFIG_FILE: &str = "config.json";

/// Root filesystem directory inside a bundle.
pub const ROOTFS_DIR: &str = "rootfs";

// =============================================================================
// Versions
// =============================================================================

/// Schema version stamped on every persisted container record.
///
/// Bump when the record layout changes incompatibly.
pub const STATE_SCHEMA_VERSION: &str = "1.0";

/// Major OCI runtime spec version accepted in `config.json`.
pub const SUPPORTED_OCI_MAJOR_VERSION: u64 = 1;

// =============================================================================
// Media Types
// =============================================================================

/// OCI layer media type (gzip-compressed tar archive).
pub const OCI_LAYER_MEDIA_TYPE_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// OCI layer media type (uncompressed tar archive).
pub const OCI_LAYER_MEDIA_TYPE_TAR: &str = "application/vnd.oci.image.layer.v1.tar";

/// Docker v2 layer media type (gzip-compressed tar archive).
pub const DOCKER_LAYER_MEDIA_TYPE_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

// =============================================================================
// Backends
// =============================================================================

/// Default low-level runtime binary for the subprocess backend.
pub const DEFAULT_RUNTIME_BINARY: &str = "crun";

/// Signal sent by the subprocess backend on stop.
pub const DEFAULT_STOP_SIGNAL: &str = "SIGTERM";

/// How long `stop` waits for the backend to report the container stopped.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between backend state queries while waiting for a stop.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Timeout for a single request to the virtualization-management service.
///
/// **Rationale**: The request itself is bounded; the lifecycle pipeline
/// has no timeouts of its own.
pub const VIRT_API_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// Validation Patterns
// =============================================================================

/// Characters allowed in a container ID: ASCII letters, digits, `-`, `_`.
///
/// No `/` and no `.`, so an ID is always a single safe path component for
/// the state and mount directories it names.
pub const CONTAINER_NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Upper bound on container ID length.
pub const MAX_CONTAINER_ID_LEN: usize = 128;

/// Checks that `id` can safely name on-disk state.
///
/// Returns the reason on rejection; callers wrap it in
/// [`Error::InvalidContainerId`](crate::Error::InvalidContainerId).
#[inline]
#[must_use = "an unchecked container ID may escape the state root"]
pub fn validate_container_id(id: &str) -> std::result::Result<(), &'static str> {
    match id.len() {
        0 => Err("container ID cannot be empty"),
        n if n > MAX_CONTAINER_ID_LEN => Err("container ID exceeds maximum length"),
        _ if id.chars().any(|c| !CONTAINER_NAME_VALID_CHARS.contains(c)) => {
            Err("container ID may only contain [A-Za-z0-9_-]")
        }
        _ => Ok(()),
    }
}
