//! Runtime backend trait - the seam between the orchestrator and the engines
//! that actually run containers.
//!
//! Two capability-equivalent backends implement [`RuntimeBackend`]:
//! - [`ProcessRuntime`](crate::runtimes::ProcessRuntime): invokes a low-level
//!   OCI runtime binary (crun, runc) as a subprocess
//! - [`RemoteVmRuntime`](crate::runtimes::RemoteVmRuntime): drives a
//!   virtualization-management service
//!
//! The orchestrator branches on the backend exactly once, when it resolves
//! [`BackendKind`] from the request flags. Everything after that goes
//! through the trait.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// =============================================================================
// Container Status
// =============================================================================

/// Lifecycle status of a container.
///
/// Ordered: a container only ever moves forward through these states.
///
/// ```text
/// Creating ──▶ Created ──▶ Running ──▶ Stopped ──▶ Deleted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container is being created.
    Creating,
    /// Container has been created but not started.
    Created,
    /// Container is running.
    Running,
    /// Container has stopped.
    Stopped,
    /// Container has been deleted from its backend.
    Deleted,
}

impl ContainerStatus {
    /// Parses the lowercase OCI status name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "creating" => Some(Self::Creating),
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }

    /// Returns true if moving from `self` to `next` keeps the lifecycle monotone.
    pub fn can_transition_to(self, next: Self) -> bool {
        next >= self
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

// =============================================================================
// Backend Kind
// =============================================================================

/// The two backend variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Low-level OCI runtime invoked as a subprocess.
    Subprocess,
    /// Remote virtualization-management API.
    Remote,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subprocess => write!(f, "subprocess"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

// =============================================================================
// Options and Results
// =============================================================================

/// Pass-through options for container creation.
///
/// Only the subprocess backend interprets these; the remote backend ignores
/// them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Do not use `pivot_root` to jail the process inside the rootfs.
    pub no_pivot: bool,
    /// Do not create a new session keyring for the container.
    pub no_new_keyring: bool,
    /// Extra file descriptors passed to the container.
    pub preserve_fds: Vec<i32>,
}

/// Captured outcome of one backend invocation.
///
/// Used for classification and diagnostics only, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Exit code of the process. Death by signal `n` is reported as `128 + n`.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl ExecutionResult {
    /// Returns true if the invocation succeeded (exit code 0).
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Backend view of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Container ID.
    pub id: String,
    /// Backend status mapped onto the canonical enum.
    pub status: ContainerStatus,
    /// Backend-assigned numeric identifier (PID or VM id), if any.
    pub numeric_id: Option<u64>,
    /// Bundle path as reported by the backend.
    pub bundle: Option<PathBuf>,
}

// =============================================================================
// Runtime Backend Trait
// =============================================================================

/// Container execution backend.
///
/// # Lifecycle
///
/// ```text
/// create_container → start_container → stop_container → delete_container
/// ```
///
/// Implementations do not retry. A failed invocation surfaces as
/// [`Error::RuntimeExecution`](crate::error::Error::RuntimeExecution) with
/// whatever diagnostics the backend produced.
#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    /// Returns the backend name used in logs and records.
    fn name(&self) -> &str;

    /// Returns which variant this backend is.
    fn kind(&self) -> BackendKind;

    /// Creates a container from a bundle without starting it.
    ///
    /// Returns the backend-assigned numeric identifier when the backend
    /// hands one out at creation time.
    async fn create_container(
        &self,
        id: &str,
        bundle: &Path,
        opts: &CreateOptions,
    ) -> Result<Option<u64>>;

    /// Starts a created container.
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stops a running container.
    async fn stop_container(&self, id: &str) -> Result<()>;

    /// Deletes a container. `force` also removes a running container.
    async fn delete_container(&self, id: &str, force: bool) -> Result<()>;

    /// Returns the container status.
    async fn get_container_state(&self, id: &str) -> Result<ContainerStatus>;

    /// Returns the backend's full view of the container.
    async fn get_container_info(&self, id: &str) -> Result<ContainerInfo>;
}
