//! # Container Lifecycle Orchestrator
//!
//! Turns a bundle into a created container on exactly one backend and
//! keeps the persisted record in step with what the backend did.
//!
//! ## Create Pipeline
//!
//! ```text
//! id check ─▶ bundle.create ─▶ bundle.validate ─▶ parse config.json
//!     ─▶ validate_spec ─▶ select backend ─▶ save record (creating)
//!     ─▶ mount image over bundle rootfs ─▶ backend.create ─▶ record → created
//! ```
//!
//! Each stage finishes before the next begins. Configuration, validation
//! and selection failures happen before any backend call and before any
//! record is written. Once the bundle stage has started, any failure runs a
//! best-effort recovery (release the mount, delete the partial record, clean
//! up the bundle) whose own errors are logged and dropped so the caller sees
//! the original failure.
//!
//! The image overlay is mounted before the backend's `create` because a
//! low-level runtime resolves the bundle rootfs at create time. It stays
//! mounted until the container is stopped or deleted.
//!
//! Callers serialize lifecycle calls per container id; the orchestrator
//! holds no per-id locks.

use crate::bundle::{ContainerBundle, load_config};
use crate::config::RuntimeConfig;
use crate::constants::{DEFAULT_STOP_TIMEOUT, STOP_POLL_INTERVAL, validate_container_id};
use crate::error::{Error, Result};
use crate::overlay::{OverlayEngine, SystemMounter};
use crate::runtime::{ContainerStatus, CreateOptions, RuntimeBackend};
use crate::runtimes::{BackendRegistry, RuntimeFlags};
use crate::state::{ContainerRecord, StateStore};
use crate::storage::BlobStore;
use crate::validate::{OciSpecValidator, SpecValidator};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Parameters of [`Orchestrator::create_container`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateRequest {
    /// Container ID.
    pub id: String,
    /// Which backend runs the container.
    pub flags: RuntimeFlags,
    /// Options passed through to the backend.
    pub options: CreateOptions,
    /// Overlay image mounted over the bundle rootfs before the backend
    /// creates the container.
    pub image: Option<String>,
}

impl CreateRequest {
    pub fn new(id: impl Into<String>, flags: RuntimeFlags) -> Self {
        Self {
            id: id.into(),
            flags,
            ..Default::default()
        }
    }

    pub fn with_options(mut self, options: CreateOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }
}

/// What a create attempt has done so far, for recovery.
#[derive(Default)]
struct CreateProgress {
    record_written: bool,
    mounted: bool,
    backend: Option<Arc<dyn RuntimeBackend>>,
}

/// Composes bundle handling, spec validation, backends, overlay storage and
/// persisted state.
pub struct Orchestrator {
    state: StateStore,
    backends: BackendRegistry,
    validator: Arc<dyn SpecValidator>,
    overlay: Option<Arc<OverlayEngine>>,
    stop_timeout: Duration,
}

impl Orchestrator {
    /// Creates an orchestrator with the default spec validator and no
    /// overlay storage.
    pub fn new(state: StateStore, backends: BackendRegistry) -> Self {
        Self {
            state,
            backends,
            validator: Arc::new(OciSpecValidator),
            overlay: None,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// Wires up state, backends and overlay storage from `config`.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let state = StateStore::open(config.state_dir())?;
        let backends = BackendRegistry::from_config(config)?;
        let blobs = BlobStore::open(config.blob_dir())?;
        let overlay = OverlayEngine::open(config.overlay_dir(), blobs, Arc::new(SystemMounter))?;

        Ok(Self::new(state, backends).with_overlay(Arc::new(overlay)))
    }

    pub fn with_validator(mut self, validator: Arc<dyn SpecValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_overlay(mut self, overlay: Arc<OverlayEngine>) -> Self {
        self.overlay = Some(overlay);
        self
    }

    /// How long [`stop_container`](Self::stop_container) waits for the
    /// backend to report the container stopped.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn state_store(&self) -> &StateStore {
        &self.state
    }

    pub fn overlay(&self) -> Option<&OverlayEngine> {
        self.overlay.as_deref()
    }

    /// Creates (but does not start) a container from `bundle`.
    ///
    /// Returns the persisted record in status `created`.
    pub async fn create_container(
        &self,
        request: &CreateRequest,
        bundle: &dyn ContainerBundle,
    ) -> Result<ContainerRecord> {
        let id = request.id.as_str();
        validate_container_id(id).map_err(|reason| Error::InvalidContainerId {
            id: id.to_string(),
            reason: reason.to_string(),
        })?;
        if self.state.state_exists(id) {
            return Err(Error::ContainerAlreadyExists(id.to_string()));
        }

        let mut progress = CreateProgress::default();
        match self.run_create(request, bundle, &mut progress).await {
            Ok(record) => {
                info!(
                    "Container {} created via {} backend",
                    id,
                    record.runtime.map_or_else(|| "?".to_string(), |k| k.to_string())
                );
                Ok(record)
            }
            Err(e) => {
                debug!("Create of {} failed: {}", id, e);
                self.recover_failed_create(id, bundle, progress).await;
                Err(e)
            }
        }
    }

    async fn run_create(
        &self,
        request: &CreateRequest,
        bundle: &dyn ContainerBundle,
        progress: &mut CreateProgress,
    ) -> Result<ContainerRecord> {
        let id = request.id.as_str();

        bundle.create_bundle()?;
        bundle.validate_bundle()?;
        debug!("Bundle for {} at {} is valid", id, bundle.path().display());

        let config = load_config(bundle.path())?;
        self.validator.validate_spec(&config)?;

        if let Some(image) = &request.image {
            let overlay = self.require_overlay()?;
            if !overlay.has_layer(image) {
                return Err(Error::LayerNotFound(image.clone()));
            }
        }

        let backend = self.backends.select(&request.flags)?;

        let mut record = self
            .state
            .create_state(id, 0, bundle.path(), ContainerStatus::Creating)?;
        record.runtime = Some(backend.kind());
        record.image = request.image.clone();
        self.state.save_state(&record)?;
        progress.record_written = true;

        if let Some(image) = &request.image {
            let rootfs = config.rootfs_path(bundle.path());
            if let Err(e) = self.require_overlay()?.mount_container_at(id, image, &rootfs) {
                // A failed mount can leave an inactive entry behind.
                progress.mounted = !matches!(e, Error::AlreadyMounted(_));
                return Err(e);
            }
            progress.mounted = true;
            debug!("Image {} mounted over {}", image, rootfs.display());
        }

        let numeric_id = backend
            .create_container(id, bundle.path(), &request.options)
            .await?;
        progress.backend = Some(backend);

        self.state
            .update_status(id, ContainerStatus::Created, numeric_id.unwrap_or(0))
    }

    /// Best-effort teardown after a failed create. Errors are logged only.
    async fn recover_failed_create(
        &self,
        id: &str,
        bundle: &dyn ContainerBundle,
        progress: CreateProgress,
    ) {
        if let Some(backend) = progress.backend
            && let Err(e) = backend.delete_container(id, true).await
        {
            warn!("Recovery: failed to delete {} from {}: {}", id, backend.name(), e);
        }
        if progress.mounted
            && let Err(e) = self.unmount_if_present(id)
        {
            warn!("Recovery: failed to release overlay of {}: {}", id, e);
        }
        if progress.record_written
            && let Err(e) = self.state.delete_state(id)
            && !e.is_not_found()
        {
            warn!("Recovery: failed to delete state of {}: {}", id, e);
        }
        if let Err(e) = bundle.cleanup_bundle() {
            warn!("Recovery: failed to clean up bundle of {}: {}", id, e);
        }
    }

    /// Tears down what a create left behind: overlay mount, record and
    /// bundle. Unlike the recovery path, failures are returned.
    pub async fn cleanup_container(&self, id: &str, bundle: &dyn ContainerBundle) -> Result<()> {
        self.unmount_if_present(id)?;
        match self.state.delete_state(id) {
            Ok(()) | Err(Error::StateNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        bundle.cleanup_bundle()?;
        info!("Cleaned up container {}", id);
        Ok(())
    }

    /// Starts a created container.
    pub async fn start_container(&self, id: &str) -> Result<ContainerRecord> {
        let record = self.state.load_state(id)?;
        if record.status != ContainerStatus::Created {
            return Err(Error::InvalidStateTransition {
                id: id.to_string(),
                from: record.status.to_string(),
                to: ContainerStatus::Running.to_string(),
            });
        }
        let backend = self.backend_for(&record)?;

        backend.start_container(id).await?;

        let numeric_id = match backend.get_container_info(id).await {
            Ok(info) => info.numeric_id.unwrap_or(record.numeric_id),
            Err(e) => {
                debug!("No backend info for {} after start: {}", id, e);
                record.numeric_id
            }
        };

        let record = self
            .state
            .update_status(id, ContainerStatus::Running, numeric_id)?;
        info!("Container {} running", id);
        Ok(record)
    }

    /// Stops a running container and releases its overlay mount.
    ///
    /// The record only moves to `stopped` once the backend stops reporting
    /// the container as running; past the stop timeout the call fails and
    /// the record is left as it was.
    pub async fn stop_container(&self, id: &str) -> Result<ContainerRecord> {
        let record = self.state.load_state(id)?;
        if !record.status.can_transition_to(ContainerStatus::Stopped) {
            return Err(Error::InvalidStateTransition {
                id: id.to_string(),
                from: record.status.to_string(),
                to: ContainerStatus::Stopped.to_string(),
            });
        }
        let backend = self.backend_for(&record)?;

        backend.stop_container(id).await?;
        self.wait_for_stop(id, backend.as_ref()).await?;
        let record = self
            .state
            .update_status(id, ContainerStatus::Stopped, record.numeric_id)?;
        self.unmount_if_present(id)?;

        info!("Container {} stopped", id);
        Ok(record)
    }

    /// Deletes a container from its backend and forgets it.
    pub async fn delete_container(&self, id: &str, force: bool) -> Result<()> {
        let record = self.state.load_state(id)?;
        let backend = self.backend_for(&record)?;

        backend.delete_container(id, force).await?;
        self.unmount_if_present(id)?;
        self.state
            .update_status(id, ContainerStatus::Deleted, record.numeric_id)?;
        self.state.delete_state(id)?;

        info!("Container {} deleted", id);
        Ok(())
    }

    /// Live status from the backend, or the persisted status when the
    /// backend no longer knows the container.
    pub async fn container_state(&self, id: &str) -> Result<ContainerStatus> {
        let record = self.state.load_state(id)?;
        let backend = self.backend_for(&record)?;

        match backend.get_container_state(id).await {
            Ok(status) => Ok(status),
            Err(e @ Error::RuntimeExecution { .. }) => {
                debug!(
                    "Backend has no state for {} ({}), using persisted {}",
                    id, e, record.status
                );
                Ok(record.status)
            }
            Err(e) => Err(e),
        }
    }

    /// All persisted records, sorted by id.
    pub fn list_containers(&self) -> Result<Vec<ContainerRecord>> {
        self.state.list_states()
    }

    /// Removes records a crashed process left in `creating`.
    ///
    /// Returns their ids so the caller can tear down the bundles.
    pub async fn recover_pending(&self) -> Result<Vec<String>> {
        let mut recovered = Vec::new();

        for record in self.state.list_states()? {
            if record.status != ContainerStatus::Creating {
                continue;
            }
            if let Ok(backend) = self.backend_for(&record)
                && let Err(e) = backend.delete_container(&record.id, true).await
            {
                debug!("Backend delete of pending {} failed: {}", record.id, e);
            }
            match self.state.delete_state(&record.id) {
                Ok(()) | Err(Error::StateNotFound(_)) => {}
                Err(e) => return Err(e),
            }
            warn!("Removed interrupted create of {}", record.id);
            recovered.push(record.id);
        }

        Ok(recovered)
    }

    /// Polls the backend until `id` is no longer running.
    async fn wait_for_stop(&self, id: &str, backend: &dyn RuntimeBackend) -> Result<()> {
        let deadline = Instant::now() + self.stop_timeout;
        loop {
            match backend.get_container_state(id).await {
                Ok(ContainerStatus::Running) => {}
                Ok(status) => {
                    debug!("Container {} reports {} after stop", id, status);
                    return Ok(());
                }
                // Already gone from the backend.
                Err(Error::RuntimeExecution { .. }) => return Ok(()),
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Err(Error::RuntimeExecution {
                    id: id.to_string(),
                    operation: "stop".to_string(),
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!(
                        "container still running {:?} after the stop signal",
                        self.stop_timeout
                    ),
                });
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
    }

    fn backend_for(&self, record: &ContainerRecord) -> Result<Arc<dyn RuntimeBackend>> {
        let kind = record.runtime.ok_or_else(|| {
            Error::RuntimeSelection(format!("record of '{}' names no backend", record.id))
        })?;
        self.backends.get(kind)
    }

    fn require_overlay(&self) -> Result<&OverlayEngine> {
        self.overlay
            .as_deref()
            .ok_or_else(|| Error::InvalidConfig("overlay storage is not configured".to_string()))
    }

    fn unmount_if_present(&self, id: &str) -> Result<()> {
        let Some(overlay) = self.overlay.as_deref() else {
            return Ok(());
        };
        match overlay.unmount_container(id) {
            Ok(()) | Err(Error::MountNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
