//! # runplane
//!
//! **Control Plane for OCI Container Runtimes**
//!
//! This crate turns OCI bundles into containers on one of two pluggable
//! execution backends, keeps a durable record of every container, and
//! composes layered root filesystems with overlayfs. It does not execute
//! containers itself: a low-level runtime (crun, runc) or a
//! virtualization-management service does.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                             runplane                                │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                       Orchestrator                          │    │
//! │  │  bundle → validate → parse config.json → validate_spec      │    │
//! │  │         → select backend → record → backend.create          │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │          │                        │                       │         │
//! │  ┌───────┴────────┐   ┌───────────┴──────────┐   ┌────────┴──────┐  │
//! │  │  StateStore    │   │    OverlayEngine     │   │ RuntimeBackend│  │
//! │  │ <id>/state.json│   │ layers │ mounts      │   │     trait     │  │
//! │  │ atomic writes  │   │ whiteouts │ limits   │   └───────┬───────┘  │
//! │  └────────────────┘   └───────────┬──────────┘           │          │
//! │                       ┌───────────┴──────────┐           │          │
//! │                       │      BlobStore       │           │          │
//! │                       │ sha256 verified blobs│           │          │
//! │                       └──────────────────────┘           │          │
//! ├──────────────────────────────────────────────────────────┼──────────┤
//! │                      Runtime Backends                    │          │
//! │  ┌──────────────────────┐      ┌─────────────────────────┴───┐      │
//! │  │    ProcessRuntime    │      │       RemoteVmRuntime       │      │
//! │  │ crun/runc subprocess │      │ VirtApi (HTTP + JSON)       │      │
//! │  └──────────────────────┘      └─────────────────────────────┘      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Container Lifecycle
//!
//! ```text
//!   ┌──────────┐  backend ok  ┌─────────┐  start  ┌─────────┐
//!   │ Creating │ ───────────► │ Created │ ──────► │ Running │
//!   └────┬─────┘              └─────────┘         └────┬────┘
//!        │ backend failed                              │ stop
//!        ▼                                             ▼
//!   record removed          ┌─────────┐  delete   ┌─────────┐
//!                           │ Deleted │ ◄──────── │ Stopped │
//!                           └─────────┘           └─────────┘
//! ```
//!
//! Status only moves forward. A record left in `creating` by a crash is
//! found and removed by [`Orchestrator::recover_pending`].
//!
//! ## Key Safety Properties
//!
//! - **Path Safety**: container ids are checked against
//!   [`validate_container_id`] before they name any directory; layer
//!   archives reject `..` and absolute entries.
//! - **Size Limits**: `MAX_LAYER_SIZE`, `MAX_ROOTFS_SIZE`, `MAX_LAYERS` and
//!   `MAX_CONFIG_SIZE` bound what a hostile image or bundle can consume.
//! - **Atomic Writes**: records, layer metadata and blobs are written to a
//!   temp file and renamed into place.
//! - **Digest Verification**: [`BlobStore::put_blob`] hashes content before
//!   storing it.
//!
//! # Example
//!
//! ```rust,ignore
//! use runplane::{CreateRequest, DirectoryBundle, Orchestrator, RuntimeConfig, RuntimeFlags};
//!
//! #[tokio::main]
//! async fn main() -> runplane::Result<()> {
//!     let config = RuntimeConfig::from_env()?;
//!     let orchestrator = Orchestrator::from_config(&config)?;
//!
//!     let bundle = DirectoryBundle::new("/tmp/b1");
//!     let request = CreateRequest::new("c1", RuntimeFlags::subprocess());
//!     let record = orchestrator.create_container(&request, &bundle).await?;
//!     orchestrator.start_container(&record.id).await?;
//!     Ok(())
//! }
//! ```

pub mod bundle;
pub mod config;
pub mod constants;
pub mod error;
pub mod orchestrator;
pub mod overlay;
pub mod runtime;
pub mod state;
pub mod storage;
pub mod validate;

pub mod runtimes;

// Re-exports
pub use bundle::{ContainerBundle, ContainerConfig, DirectoryBundle, load_config};
pub use config::RuntimeConfig;
pub use constants::*;
pub use error::{Error, ErrorCategory, Result};
pub use orchestrator::{CreateRequest, Orchestrator};
pub use overlay::{
    GcStats, ImageManifest, LayerDescriptor, Mounter, OverlayEngine, OverlayLayer, OverlayMount,
    SystemMounter, chain_id,
};
pub use runtime::{
    BackendKind, ContainerInfo, ContainerStatus, CreateOptions, ExecutionResult, RuntimeBackend,
};
pub use runtimes::{
    BackendRegistry, HttpVirtApi, ProcessRuntime, RemoteVmRuntime, RuntimeCommand, RuntimeFlags,
    VirtApi, VmCreateRequest, VmInfo,
};
pub use state::{ContainerRecord, StateStore};
pub use storage::BlobStore;
pub use validate::{OciSpecValidator, SpecValidator};
