//! # Persistent Container State
//!
//! Durable, id-keyed records of every container the control plane knows
//! about. Records survive process restarts, so a crashed `create` can be
//! found again by its `creating` status.
//!
//! ## Layout
//!
//! ```text
//! <base>/state/
//! ├── c1/
//! │   └── state.json
//! └── web-01/
//!     └── state.json
//! ```
//!
//! The record path is a pure function of the container id, and ids are
//! validated against [`validate_container_id`] before any path is built, so
//! one id can never address another id's record.
//!
//! ## Atomicity
//!
//! Every write goes to `state.json.tmp.<uuid>` in the same directory, is
//! synced, then renamed over `state.json`. A concurrent reader sees either
//! the old record or the new one, never a torn write. There are no
//! cross-record transactions.

use crate::constants::{STATE_FILE, STATE_SCHEMA_VERSION, validate_container_id};
use crate::error::{Error, Result};
use crate::runtime::{BackendKind, ContainerStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Persisted record of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRecord {
    /// Record layout version.
    pub schema_version: String,
    /// Container ID.
    pub id: String,
    /// Backend-assigned numeric identifier (PID or VM id); 0 when unknown.
    pub numeric_id: u64,
    /// Bundle directory the container was created from.
    pub bundle: PathBuf,
    /// Lifecycle status.
    pub status: ContainerStatus,
    /// Backend that owns the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<BackendKind>,
    /// Overlay image mounted as the container's rootfs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// When the record was built.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

/// File-backed store of [`ContainerRecord`]s.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Opens (creating if needed) a state store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        create_private_dir(&root).map_err(|e| Error::StorageInitFailed {
            path: root.clone(),
            reason: e.to_string(),
        })?;

        info!("State store initialized at: {}", root.display());
        Ok(Self { root })
    }

    /// Returns the store's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Builds a new record. Nothing is written until [`save_state`](Self::save_state).
    pub fn create_state(
        &self,
        id: &str,
        numeric_id: u64,
        bundle: impl Into<PathBuf>,
        status: ContainerStatus,
    ) -> Result<ContainerRecord> {
        check_id(id)?;
        let now = Utc::now();
        Ok(ContainerRecord {
            schema_version: STATE_SCHEMA_VERSION.to_string(),
            id: id.to_string(),
            numeric_id,
            bundle: bundle.into(),
            status,
            runtime: None,
            image: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Atomically writes `record` to its id-derived location.
    pub fn save_state(&self, record: &ContainerRecord) -> Result<()> {
        let path = self.record_path(&record.id)?;
        let write_failed = |e: std::io::Error| Error::StateWriteFailed {
            id: record.id.clone(),
            reason: e.to_string(),
        };

        if let Some(dir) = path.parent() {
            create_private_dir(dir).map_err(write_failed)?;
        }

        let content = serde_json::to_vec_pretty(record)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let temp_path = path.with_extension(format!("json.tmp.{}", uuid::Uuid::now_v7()));
        let written = fs::File::create(&temp_path).and_then(|mut file| {
            file.write_all(&content)?;
            file.sync_all()
        });
        if let Err(e) = written.and_then(|()| fs::rename(&temp_path, &path)) {
            let _ = fs::remove_file(&temp_path);
            return Err(write_failed(e));
        }

        debug!("Saved state for {} ({})", record.id, record.status);
        Ok(())
    }

    /// Loads the record for `id`.
    pub fn load_state(&self, id: &str) -> Result<ContainerRecord> {
        let path = self.record_path(id)?;
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::StateNotFound(id.to_string()));
            }
            Err(e) => {
                return Err(Error::StateCorrupted {
                    id: id.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let record: ContainerRecord =
            serde_json::from_slice(&content).map_err(|e| Error::StateCorrupted {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        if record.id != id {
            return Err(Error::StateCorrupted {
                id: id.to_string(),
                reason: format!("record belongs to '{}'", record.id),
            });
        }
        Ok(record)
    }

    /// Moves `id` to `status` and records the backend's numeric identifier.
    ///
    /// Fails with [`Error::InvalidStateTransition`] if `status` precedes the
    /// current status.
    pub fn update_status(
        &self,
        id: &str,
        status: ContainerStatus,
        numeric_id: u64,
    ) -> Result<ContainerRecord> {
        let mut record = self.load_state(id)?;

        if !record.status.can_transition_to(status) {
            return Err(Error::InvalidStateTransition {
                id: id.to_string(),
                from: record.status.to_string(),
                to: status.to_string(),
            });
        }

        record.status = status;
        record.numeric_id = numeric_id;
        record.updated_at = Utc::now();
        self.save_state(&record)?;

        debug!("Container {} is now {}", id, status);
        Ok(record)
    }

    /// Removes the record for `id`.
    pub fn delete_state(&self, id: &str) -> Result<()> {
        let path = self.record_path(id)?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::StateNotFound(id.to_string()));
            }
            Err(e) => {
                return Err(Error::StateWriteFailed {
                    id: id.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        // The record is gone once state.json is; leftover temp files go with the dir.
        if let Some(dir) = path.parent()
            && let Err(e) = fs::remove_dir_all(dir)
        {
            debug!("Could not remove state dir for {}: {}", id, e);
        }

        info!("Deleted state for {}", id);
        Ok(())
    }

    /// Returns true if a record exists for `id`. Does not parse the record.
    pub fn state_exists(&self, id: &str) -> bool {
        self.record_path(id).is_ok_and(|p| p.is_file())
    }

    /// Returns every persisted record, sorted by id.
    pub fn list_states(&self) -> Result<Vec<ContainerRecord>> {
        let mut records = Vec::new();

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !self.state_exists(&id) {
                continue;
            }
            match self.load_state(&id) {
                Ok(record) => records.push(record),
                // Deleted between the existence check and the read.
                Err(Error::StateNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    fn record_path(&self, id: &str) -> Result<PathBuf> {
        check_id(id)?;
        Ok(self.root.join(id).join(STATE_FILE))
    }
}

fn check_id(id: &str) -> Result<()> {
    validate_container_id(id).map_err(|reason| Error::InvalidContainerId {
        id: id.to_string(),
        reason: reason.to_string(),
    })
}

/// Creates `dir` (and parents) readable only by the owner.
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir)
    }
}
