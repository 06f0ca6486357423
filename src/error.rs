//! Error types for the runtime control plane.
//!
//! Every fallible operation returns [`Error`]. Variants are grouped by the
//! subsystem that raises them; [`Error::category`] collapses them into the
//! coarse [`ErrorCategory`] that callers branch on.

use std::path::PathBuf;

/// Result type alias for control-plane operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed or missing configuration document / runtime config.
    Configuration,
    /// Semantically invalid input (spec content, container id).
    Validation,
    /// Zero or multiple backends selected, or selected backend missing.
    RuntimeSelection,
    /// Backend invocation failed (nonzero exit, failed API call).
    RuntimeExecution,
    /// Layer or mount lookup / filesystem failure in the overlay engine.
    Storage,
    /// Container record lookup / (de)serialization failure.
    State,
    /// Bundle construction, validation or teardown failure.
    Bundle,
    /// Invariant violation inside the crate.
    Internal,
}

/// Errors that can occur in the control plane.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// The bundle's configuration document could not be read or parsed.
    #[error("failed to parse configuration {path}: {reason}")]
    ConfigurationParse { path: PathBuf, reason: String },

    /// Runtime configuration is invalid.
    #[error("invalid runtime configuration: {0}")]
    InvalidConfig(String),

    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// The parsed configuration is semantically invalid.
    #[error("invalid container spec: {0}")]
    Validation(String),

    /// Invalid container ID format.
    #[error("invalid container ID '{id}': {reason}")]
    InvalidContainerId { id: String, reason: String },

    // =========================================================================
    // Runtime Selection Errors
    // =========================================================================
    /// Backend selection did not resolve to exactly one configured backend.
    #[error("runtime selection failed: {0}")]
    RuntimeSelection(String),

    // =========================================================================
    // Runtime Execution Errors
    // =========================================================================
    /// Backend operation failed. Carries the captured diagnostics.
    #[error(
        "runtime {operation} failed for container '{id}' (exit code {}): {}",
        fmt_exit_code(.exit_code),
        diagnostic_summary(.stderr, .stdout)
    )]
    RuntimeExecution {
        id: String,
        operation: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// Backend could not be invoked at all.
    #[error("runtime '{runtime}' not available: {reason}")]
    RuntimeUnavailable { runtime: String, reason: String },

    /// Backend answered with output that could not be interpreted.
    #[error("unexpected response from {backend}: {reason}")]
    BackendProtocol { backend: String, reason: String },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Layer is not registered in the layer repository.
    #[error("layer not found: {0}")]
    LayerNotFound(String),

    /// Layer's declared parent is not registered.
    #[error("parent layer {parent} of layer {layer} is not registered")]
    ParentLayerMissing { layer: String, parent: String },

    /// No mount is registered for the container.
    #[error("no mount registered for container: {0}")]
    MountNotFound(String),

    /// A mount is already registered for the container.
    #[error("container already mounted: {0}")]
    AlreadyMounted(String),

    /// Blob not found in storage.
    #[error("blob not found: {digest}")]
    BlobNotFound { digest: String },

    /// Storage initialization failed.
    #[error("failed to initialize storage at {path}: {reason}")]
    StorageInitFailed { path: PathBuf, reason: String },

    /// Storage write failed.
    #[error("failed to write to storage: {0}")]
    StorageWriteFailed(String),

    /// Layer extraction failed.
    #[error("failed to extract layer {digest}: {reason}")]
    LayerExtractionFailed { digest: String, reason: String },

    /// Path traversal attempt detected in a layer archive.
    #[error("path traversal detected in layer: {path}")]
    PathTraversal { path: String },

    /// Image size exceeded limits.
    #[error("image exceeds size limit: {size} > {limit} bytes")]
    ImageTooLarge { size: u64, limit: u64 },

    /// Kernel overlay mount failed.
    #[error("failed to mount overlay at {target}: {reason}")]
    MountFailed { target: PathBuf, reason: String },

    /// Kernel unmount failed.
    #[error("failed to unmount {target}: {reason}")]
    UnmountFailed { target: PathBuf, reason: String },

    // =========================================================================
    // State Errors
    // =========================================================================
    /// No persisted record for the container.
    #[error("container state not found: {0}")]
    StateNotFound(String),

    /// A record already exists for the container.
    #[error("container already exists: {0}")]
    ContainerAlreadyExists(String),

    /// Requested status change would move the lifecycle backwards.
    #[error("container '{id}' cannot move from '{from}' to '{to}'")]
    InvalidStateTransition { id: String, from: String, to: String },

    /// Persisted record is unreadable or belongs to another id.
    #[error("corrupted state for container '{id}': {reason}")]
    StateCorrupted { id: String, reason: String },

    /// Persisting a record failed.
    #[error("failed to persist state for container '{id}': {reason}")]
    StateWriteFailed { id: String, reason: String },

    // =========================================================================
    // Bundle Errors
    // =========================================================================
    /// Invalid bundle (missing config.json or rootfs).
    #[error("invalid bundle at {path}: {reason}")]
    InvalidBundle { path: PathBuf, reason: String },

    /// Failed to build bundle.
    #[error("failed to build bundle: {0}")]
    BundleBuildFailed(String),

    /// Bundle teardown failed.
    #[error("failed to clean up bundle at {path}: {reason}")]
    BundleCleanupFailed { path: PathBuf, reason: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the coarse category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ConfigurationParse { .. } | Self::InvalidConfig(_) => {
                ErrorCategory::Configuration
            }
            Self::Validation(_) | Self::InvalidContainerId { .. } => ErrorCategory::Validation,
            Self::RuntimeSelection(_) => ErrorCategory::RuntimeSelection,
            Self::RuntimeExecution { .. }
            | Self::RuntimeUnavailable { .. }
            | Self::BackendProtocol { .. } => ErrorCategory::RuntimeExecution,
            Self::LayerNotFound(_)
            | Self::ParentLayerMissing { .. }
            | Self::MountNotFound(_)
            | Self::AlreadyMounted(_)
            | Self::BlobNotFound { .. }
            | Self::StorageInitFailed { .. }
            | Self::StorageWriteFailed(_)
            | Self::LayerExtractionFailed { .. }
            | Self::PathTraversal { .. }
            | Self::ImageTooLarge { .. }
            | Self::MountFailed { .. }
            | Self::UnmountFailed { .. } => ErrorCategory::Storage,
            Self::StateNotFound(_)
            | Self::ContainerAlreadyExists(_)
            | Self::InvalidStateTransition { .. }
            | Self::StateCorrupted { .. }
            | Self::StateWriteFailed { .. } => ErrorCategory::State,
            Self::InvalidBundle { .. }
            | Self::BundleBuildFailed(_)
            | Self::BundleCleanupFailed { .. } => ErrorCategory::Bundle,
            Self::Io(_) | Self::Serialization(_) | Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Returns true for lookups that failed because the target is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::StateNotFound(_)
                | Self::LayerNotFound(_)
                | Self::MountNotFound(_)
                | Self::BlobNotFound { .. }
        )
    }

    /// Returns the captured standard error of a failed backend invocation.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::RuntimeExecution { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

fn fmt_exit_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "none".to_string(), |c| c.to_string())
}

/// Picks the most useful line of captured output for the error message.
fn diagnostic_summary(stderr: &str, stdout: &str) -> String {
    let pick = |s: &str| {
        s.lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
    };
    pick(stderr)
        .or_else(|| pick(stdout))
        .unwrap_or_else(|| "no diagnostic output".to_string())
}
