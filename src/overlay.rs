//! # Overlay Storage Engine
//!
//! Composes container root filesystems out of shared, read-only image
//! layers plus a private writable layer per container.
//!
//! ## Layout
//!
//! ```text
//! <root>/
//! ├── layers/
//! │   └── <hex chain id>/
//! │       ├── layer.json     (id, digest, parent, size)
//! │       └── diff/          (unpacked layer content, whiteouts as markers)
//! └── mounts/
//!     └── <container-id>/
//!         ├── mount.json
//!         ├── lower/         (layer chain applied root-first)
//!         ├── upper/
//!         ├── work/
//!         └── merged/        (mount point unless a bundle rootfs is given)
//! ```
//!
//! ## Layer Identity
//!
//! A layer is keyed by its chain id, not by its blob digest. The base
//! layer's chain id is its digest; every layer above it hashes the chain id
//! below it together with its own digest (as OCI `ChainID` does over diff
//! ids). The same blob on top of different bases is therefore a different
//! layer, and an image id (the top chain id) names exactly one stack.
//!
//! ## Tables
//!
//! Two in-memory tables mirror the on-disk metadata: the layer repository
//! (chain id → [`OverlayLayer`]) and the mount table (container id →
//! [`OverlayMount`]). Both are rebuilt from disk by [`OverlayEngine::open`].
//! A layer's parent is always registered before the layer itself, and a
//! container id has at most one mount; the mount check-and-insert happens
//! under a single write lock.
//!
//! ## Kernel Mounts
//!
//! The engine never calls `mount(2)` directly. It goes through a
//! [`Mounter`], which is [`SystemMounter`] in production.

use crate::constants::{
    DOCKER_LAYER_MEDIA_TYPE_GZIP, LAYER_DIFF_DIR, LAYER_DIR, LAYER_METADATA_FILE, MAX_LAYER_SIZE,
    MAX_LAYERS, MAX_ROOTFS_SIZE, MOUNT_DIR, MOUNT_METADATA_FILE, OCI_LAYER_MEDIA_TYPE_GZIP,
    OCI_LAYER_MEDIA_TYPE_TAR, validate_container_id,
};
use crate::error::{Error, Result};
use crate::storage::{BlobStore, parse_digest};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tar::Archive;
use tracing::{debug, info, warn};

/// Whiteout prefix marking a deleted path from a lower layer.
const WHITEOUT_PREFIX: &str = ".wh.";

/// Opaque whiteout: hides every lower-layer entry of its directory.
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

// =============================================================================
// Manifest
// =============================================================================

/// Ordered layer list of an image, base layer first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    pub layers: Vec<LayerDescriptor>,
}

/// One layer blob of an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerDescriptor {
    /// Content digest of the compressed blob (`sha256:<hex>`).
    pub digest: String,
    /// OCI or Docker layer media type.
    pub media_type: String,
    /// Blob size in bytes. Zero skips the size check.
    #[serde(default)]
    pub size: u64,
}

// =============================================================================
// Repository Entries
// =============================================================================

/// A registered, unpacked image layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayLayer {
    /// Chain id: identifies this layer together with everything below it.
    pub id: String,
    /// Digest of the blob the content was unpacked from.
    pub digest: String,
    /// Chain id of the layer directly below this one.
    pub parent: Option<String>,
    /// Unpacked size in bytes.
    pub size: u64,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    diff: PathBuf,
}

impl OverlayLayer {
    /// Directory holding the unpacked content.
    pub fn diff_path(&self) -> &Path {
        &self.diff
    }
}

/// A container's overlay mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayMount {
    container_id: String,
    image_id: String,
    lower: PathBuf,
    upper: PathBuf,
    work: PathBuf,
    merged: PathBuf,
    active: bool,
}

impl OverlayMount {
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    pub fn lower(&self) -> &Path {
        &self.lower
    }

    pub fn upper(&self) -> &Path {
        &self.upper
    }

    pub fn work(&self) -> &Path {
        &self.work
    }

    /// The container's root filesystem once active.
    pub fn merged(&self) -> &Path {
        &self.merged
    }

    /// True once the kernel mount succeeded.
    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// Chain id of the layer with blob `digest` stacked on `parent`.
pub fn chain_id(parent: Option<&str>, digest: &str) -> String {
    match parent {
        None => digest.to_string(),
        Some(parent) => BlobStore::digest_of(format!("{} {}", parent, digest).as_bytes()),
    }
}

/// Outcome of [`OverlayEngine::gc`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub layers_removed: usize,
    pub bytes_freed: u64,
}

// =============================================================================
// Mounter
// =============================================================================

/// Kernel mount operations used by the engine.
pub trait Mounter: Send + Sync {
    /// Mounts an overlay of `lower` + `upper` (with `work`) at `merged`.
    fn mount_overlay(&self, lower: &Path, upper: &Path, work: &Path, merged: &Path) -> Result<()>;

    /// Unmounts `target`. A target that is not mounted is not an error.
    fn unmount(&self, target: &Path) -> Result<()>;
}

/// Real overlayfs mounts via `mount(2)` / `umount2(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMounter;

#[cfg(target_os = "linux")]
impl Mounter for SystemMounter {
    fn mount_overlay(&self, lower: &Path, upper: &Path, work: &Path, merged: &Path) -> Result<()> {
        use nix::mount::{MsFlags, mount};

        let data = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower.display(),
            upper.display(),
            work.display()
        );
        mount(
            Some("overlay"),
            merged,
            Some("overlay"),
            MsFlags::empty(),
            Some(data.as_str()),
        )
        .map_err(|e| Error::MountFailed {
            target: merged.to_path_buf(),
            reason: e.to_string(),
        })
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        use nix::errno::Errno;
        use nix::mount::{MntFlags, umount2};

        match umount2(target, MntFlags::empty()) {
            Ok(()) | Err(Errno::EINVAL) | Err(Errno::ENOENT) => Ok(()),
            Err(e) => Err(Error::UnmountFailed {
                target: target.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl Mounter for SystemMounter {
    fn mount_overlay(&self, _lower: &Path, _upper: &Path, _work: &Path, merged: &Path) -> Result<()> {
        Err(Error::MountFailed {
            target: merged.to_path_buf(),
            reason: "overlayfs requires Linux".to_string(),
        })
    }

    fn unmount(&self, _target: &Path) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Layer repository plus mount table.
pub struct OverlayEngine {
    root: PathBuf,
    blobs: BlobStore,
    mounter: Arc<dyn Mounter>,
    layers: RwLock<HashMap<String, OverlayLayer>>,
    mounts: RwLock<HashMap<String, OverlayMount>>,
}

impl OverlayEngine {
    /// Opens the engine at `root`, reloading layers and mounts from disk.
    pub fn open(root: impl Into<PathBuf>, blobs: BlobStore, mounter: Arc<dyn Mounter>) -> Result<Self> {
        let root = root.into();
        for dir in [root.join(LAYER_DIR), root.join(MOUNT_DIR)] {
            fs::create_dir_all(&dir).map_err(|e| Error::StorageInitFailed {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
        }

        let layers = load_layers(&root.join(LAYER_DIR))?;
        let mounts = load_mounts(&root.join(MOUNT_DIR))?;
        info!(
            "Overlay engine at {}: {} layers, {} mounts",
            root.display(),
            layers.len(),
            mounts.len()
        );

        Ok(Self {
            root,
            blobs,
            mounter,
            layers: RwLock::new(layers),
            mounts: RwLock::new(mounts),
        })
    }

    /// Returns the engine root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the blob store layers are read from.
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Registers every layer of `manifest`, unpacking those not yet present.
    ///
    /// Returns the image id, which is the chain id of the top layer. On
    /// failure, layers registered before the failing one stay registered.
    pub fn create_image_layers(&self, manifest: &ImageManifest) -> Result<String> {
        if manifest.layers.is_empty() {
            return Err(Error::Validation("image manifest has no layers".to_string()));
        }
        if manifest.layers.len() > MAX_LAYERS {
            return Err(Error::Validation(format!(
                "image has {} layers, limit is {}",
                manifest.layers.len(),
                MAX_LAYERS
            )));
        }

        let mut total_size = 0u64;
        let mut parent: Option<String> = None;

        for descriptor in &manifest.layers {
            parse_digest(&descriptor.digest)?;
            let id = chain_id(parent.as_deref(), &descriptor.digest);
            if let Some(existing) = self.layer(&id)? {
                debug!("Layer {} already registered", existing.id);
                total_size += existing.size;
            } else {
                let layer = self.unpack_layer(descriptor, &id, parent.clone(), &mut total_size)?;
                self.register_layer(layer)?;
            }
            parent = Some(id);
        }

        let image_id = parent.ok_or_else(|| Error::Internal("empty layer chain".to_string()))?;
        info!(
            "Image {} ready ({} layers, {} bytes)",
            image_id,
            manifest.layers.len(),
            total_size
        );
        Ok(image_id)
    }

    /// Prepares and mounts the overlay for `container_id` from `image_id`,
    /// with the merged view under the engine's own mount directory.
    ///
    /// A second mount of the same container id fails with
    /// [`Error::AlreadyMounted`]. If preparing or mounting fails, an inactive
    /// entry stays in the table for [`unmount_container`](Self::unmount_container)
    /// to clean up.
    pub fn mount_container(&self, container_id: &str, image_id: &str) -> Result<OverlayMount> {
        self.mount_onto(container_id, image_id, None)
    }

    /// Like [`mount_container`](Self::mount_container), but the merged view
    /// is mounted over `rootfs` (a bundle's root directory) so the backend
    /// runs on the image content. Unmounting leaves `rootfs` itself alone.
    pub fn mount_container_at(
        &self,
        container_id: &str,
        image_id: &str,
        rootfs: &Path,
    ) -> Result<OverlayMount> {
        self.mount_onto(container_id, image_id, Some(rootfs.to_path_buf()))
    }

    fn mount_onto(
        &self,
        container_id: &str,
        image_id: &str,
        target: Option<PathBuf>,
    ) -> Result<OverlayMount> {
        validate_container_id(container_id).map_err(|reason| Error::InvalidContainerId {
            id: container_id.to_string(),
            reason: reason.to_string(),
        })?;
        let chain = self.layer_chain(image_id)?;

        let dir = self.root.join(MOUNT_DIR).join(container_id);
        let mut mount = OverlayMount {
            container_id: container_id.to_string(),
            image_id: image_id.to_string(),
            lower: dir.join("lower"),
            upper: dir.join("upper"),
            work: dir.join("work"),
            merged: target.unwrap_or_else(|| dir.join("merged")),
            active: false,
        };

        {
            let mut mounts = self.write_mounts()?;
            if mounts.contains_key(container_id) {
                return Err(Error::AlreadyMounted(container_id.to_string()));
            }
            mounts.insert(container_id.to_string(), mount.clone());
        }

        self.prepare_mount(&mount, &chain)?;
        self.mounter
            .mount_overlay(&mount.lower, &mount.upper, &mount.work, &mount.merged)?;

        mount.active = true;
        write_json(&dir.join(MOUNT_METADATA_FILE), &mount)?;
        self.write_mounts()?
            .insert(container_id.to_string(), mount.clone());

        info!(
            "Mounted {} for container {} at {}",
            image_id,
            container_id,
            mount.merged.display()
        );
        Ok(mount)
    }

    /// Unmounts and removes the overlay of `container_id`.
    pub fn unmount_container(&self, container_id: &str) -> Result<()> {
        let mount = self
            .read_mounts()?
            .get(container_id)
            .cloned()
            .ok_or_else(|| Error::MountNotFound(container_id.to_string()))?;

        if mount.active {
            self.mounter.unmount(&mount.merged)?;
        }

        let dir = self.root.join(MOUNT_DIR).join(container_id);
        remove_dir_if_present(&dir)?;
        self.write_mounts()?.remove(container_id);

        info!("Unmounted container {}", container_id);
        Ok(())
    }

    /// Removes `image_id` and every ancestor no other layer builds on.
    ///
    /// Returns the number of layers removed.
    pub fn remove_image_layers(&self, image_id: &str) -> Result<usize> {
        let mut layers = self.write_layers()?;
        if !layers.contains_key(image_id) {
            return Err(Error::LayerNotFound(image_id.to_string()));
        }

        let mut removed = 0;
        let mut next = Some(image_id.to_string());
        while let Some(id) = next.take() {
            let has_children = layers.values().any(|l| l.parent.as_deref() == Some(&id));
            if has_children {
                break;
            }
            let Some(layer) = layers.get(&id).cloned() else {
                break;
            };
            self.remove_layer_dir(&layer)?;
            layers.remove(&id);
            removed += 1;
            next = layer.parent;
        }

        info!("Removed {} layers of image {}", removed, image_id);
        Ok(removed)
    }

    /// Removes layers that are not in `referenced`, not used by a mount, and
    /// not an ancestor of a kept layer.
    pub fn gc(&self, referenced: &[String]) -> Result<GcStats> {
        let mounted: Vec<String> = self
            .read_mounts()?
            .values()
            .map(|m| m.image_id.clone())
            .collect();

        let mut layers = self.write_layers()?;
        let mut keep = HashSet::new();
        for root in referenced.iter().chain(mounted.iter()) {
            let mut next = Some(root.clone());
            while let Some(id) = next.take() {
                if !keep.insert(id.clone()) {
                    break;
                }
                next = layers.get(&id).and_then(|l| l.parent.clone());
            }
        }

        let doomed: Vec<OverlayLayer> = layers
            .values()
            .filter(|l| !keep.contains(&l.id))
            .cloned()
            .collect();

        let mut stats = GcStats::default();
        for layer in doomed {
            self.remove_layer_dir(&layer)?;
            layers.remove(&layer.id);
            stats.layers_removed += 1;
            stats.bytes_freed += layer.size;
        }

        if stats.layers_removed > 0 {
            info!(
                "GC removed {} layers ({} bytes)",
                stats.layers_removed, stats.bytes_freed
            );
        }
        Ok(stats)
    }

    pub fn has_layer(&self, id: &str) -> bool {
        self.read_layers().is_ok_and(|l| l.contains_key(id))
    }

    pub fn layer(&self, id: &str) -> Result<Option<OverlayLayer>> {
        Ok(self.read_layers()?.get(id).cloned())
    }

    /// All registered layers, sorted by id.
    pub fn layers(&self) -> Result<Vec<OverlayLayer>> {
        let mut all: Vec<_> = self.read_layers()?.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    pub fn is_mounted(&self, container_id: &str) -> bool {
        self.read_mounts()
            .is_ok_and(|m| m.get(container_id).is_some_and(|m| m.active))
    }

    pub fn mount(&self, container_id: &str) -> Result<Option<OverlayMount>> {
        Ok(self.read_mounts()?.get(container_id).cloned())
    }

    /// Container ids with a mount table entry, sorted.
    pub fn mounted_containers(&self) -> Result<Vec<String>> {
        let mut ids: Vec<_> = self.read_mounts()?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    // -------------------------------------------------------------------------
    // Layers
    // -------------------------------------------------------------------------

    /// Fetches, verifies and unpacks one layer into a fresh directory.
    fn unpack_layer(
        &self,
        descriptor: &LayerDescriptor,
        id: &str,
        parent: Option<String>,
        total_size: &mut u64,
    ) -> Result<OverlayLayer> {
        let digest = &descriptor.digest;
        let hex = parse_digest(id)?;
        let extraction_failed = |reason: String| Error::LayerExtractionFailed {
            digest: digest.clone(),
            reason,
        };

        let gzip = match descriptor.media_type.as_str() {
            OCI_LAYER_MEDIA_TYPE_GZIP | DOCKER_LAYER_MEDIA_TYPE_GZIP => true,
            OCI_LAYER_MEDIA_TYPE_TAR => false,
            other => return Err(extraction_failed(format!("unsupported media type '{}'", other))),
        };

        let data = self.blobs.get_blob(digest)?;
        if data.len() > MAX_LAYER_SIZE {
            return Err(Error::ImageTooLarge {
                size: data.len() as u64,
                limit: MAX_LAYER_SIZE as u64,
            });
        }
        if descriptor.size != 0 && descriptor.size != data.len() as u64 {
            return Err(extraction_failed(format!(
                "blob is {} bytes, manifest declares {}",
                data.len(),
                descriptor.size
            )));
        }

        let layer_dir = self.root.join(LAYER_DIR).join(hex);
        let staging = self
            .root
            .join(LAYER_DIR)
            .join(format!("{}.tmp.{}", hex, uuid::Uuid::now_v7()));
        let diff = staging.join(LAYER_DIFF_DIR);
        fs::create_dir_all(&diff).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;

        let reader: Box<dyn Read + '_> = if gzip {
            Box::new(GzDecoder::new(&data[..]))
        } else {
            Box::new(&data[..])
        };

        let before = *total_size;
        let unpacked = unpack_archive(reader, &diff, digest, total_size).and_then(|()| {
            let layer = OverlayLayer {
                id: id.to_string(),
                digest: digest.clone(),
                parent,
                size: *total_size - before,
                created_at: Utc::now(),
                diff: layer_dir.join(LAYER_DIFF_DIR),
            };
            write_json(&staging.join(LAYER_METADATA_FILE), &layer)?;
            fs::rename(&staging, &layer_dir)
                .map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
            Ok(layer)
        });

        if unpacked.is_err() {
            let _ = fs::remove_dir_all(&staging);
        }
        let layer = unpacked?;
        debug!(
            "Unpacked blob {} as layer {} ({} bytes)",
            layer.digest, layer.id, layer.size
        );
        Ok(layer)
    }

    fn register_layer(&self, layer: OverlayLayer) -> Result<()> {
        let mut layers = self.write_layers()?;
        if let Some(parent) = &layer.parent
            && !layers.contains_key(parent)
        {
            return Err(Error::ParentLayerMissing {
                layer: layer.id.clone(),
                parent: parent.clone(),
            });
        }
        layers.entry(layer.id.clone()).or_insert(layer);
        Ok(())
    }

    /// Diff directories of `image_id` and its ancestors, base layer first.
    fn layer_chain(&self, image_id: &str) -> Result<Vec<PathBuf>> {
        let layers = self.read_layers()?;
        let mut chain = Vec::new();
        let mut current = layers
            .get(image_id)
            .ok_or_else(|| Error::LayerNotFound(image_id.to_string()))?;

        loop {
            chain.push(current.diff.clone());
            let Some(parent) = &current.parent else {
                break;
            };
            if chain.len() > MAX_LAYERS {
                return Err(Error::Internal(format!("layer chain of {} loops", image_id)));
            }
            current = layers.get(parent).ok_or_else(|| Error::ParentLayerMissing {
                layer: current.id.clone(),
                parent: parent.clone(),
            })?;
        }

        chain.reverse();
        Ok(chain)
    }

    fn remove_layer_dir(&self, layer: &OverlayLayer) -> Result<()> {
        let hex = parse_digest(&layer.id)?;
        remove_dir_if_present(&self.root.join(LAYER_DIR).join(hex))?;
        debug!("Removed layer {}", layer.id);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Mounts
    // -------------------------------------------------------------------------

    fn prepare_mount(&self, mount: &OverlayMount, chain: &[PathBuf]) -> Result<()> {
        for dir in [&mount.lower, &mount.upper, &mount.work, &mount.merged] {
            fs::create_dir_all(dir).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        }
        for diff in chain {
            apply_diff(diff, &mount.lower).map_err(|e| Error::MountFailed {
                target: mount.lower.clone(),
                reason: format!("seeding from {}: {}", diff.display(), e),
            })?;
        }
        write_json(
            &self
                .root
                .join(MOUNT_DIR)
                .join(&mount.container_id)
                .join(MOUNT_METADATA_FILE),
            mount,
        )
    }

    fn read_layers(&self) -> Result<RwLockReadGuard<'_, HashMap<String, OverlayLayer>>> {
        self.layers
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))
    }

    fn write_layers(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, OverlayLayer>>> {
        self.layers
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))
    }

    fn read_mounts(&self) -> Result<RwLockReadGuard<'_, HashMap<String, OverlayMount>>> {
        self.mounts
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))
    }

    fn write_mounts(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, OverlayMount>>> {
        self.mounts
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))
    }
}

// =============================================================================
// Extraction
// =============================================================================

/// Unpacks a tar stream into `dest`, keeping whiteouts as empty marker files.
fn unpack_archive(reader: impl Read, dest: &Path, digest: &str, total_size: &mut u64) -> Result<()> {
    let extraction_failed = |e: std::io::Error| Error::LayerExtractionFailed {
        digest: digest.to_string(),
        reason: e.to_string(),
    };

    let mut archive = Archive::new(reader);
    for entry in archive.entries().map_err(extraction_failed)? {
        let mut entry = entry.map_err(extraction_failed)?;
        let path = entry.path().map_err(extraction_failed)?.into_owned();

        // SECURITY: entries must stay inside the layer directory
        if path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::PathTraversal {
                path: path.to_string_lossy().to_string(),
            });
        }

        let is_whiteout = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(WHITEOUT_PREFIX));
        if is_whiteout {
            let marker = dest.join(&path);
            if let Some(parent) = marker.parent() {
                fs::create_dir_all(parent).map_err(extraction_failed)?;
            }
            fs::write(&marker, b"").map_err(extraction_failed)?;
            continue;
        }

        *total_size += entry.size();
        if *total_size > MAX_ROOTFS_SIZE {
            return Err(Error::ImageTooLarge {
                size: *total_size,
                limit: MAX_ROOTFS_SIZE,
            });
        }

        entry.unpack_in(dest).map_err(extraction_failed)?;
    }
    Ok(())
}

/// Applies one layer's diff on top of `target`.
///
/// Whiteouts of the layer are applied before its additions so they only
/// hide content from lower layers.
fn apply_diff(diff: &Path, target: &Path) -> std::io::Result<()> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(diff)? {
        entries.push(entry?);
    }

    if entries.iter().any(|e| e.file_name() == OPAQUE_WHITEOUT) {
        for existing in fs::read_dir(target)? {
            remove_path(&existing?.path())?;
        }
    }

    for entry in &entries {
        let name = entry.file_name();
        if let Some(hidden) = name
            .to_str()
            .and_then(|n| n.strip_prefix(WHITEOUT_PREFIX))
            && name != OPAQUE_WHITEOUT
        {
            remove_path(&target.join(hidden))?;
        }
    }

    for entry in &entries {
        let name = entry.file_name();
        if name.to_str().is_some_and(|n| n.starts_with(WHITEOUT_PREFIX)) {
            continue;
        }

        let src = entry.path();
        let dst = target.join(&name);
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            if !dst.is_dir() || dst.is_symlink() {
                remove_path(&dst)?;
                fs::create_dir(&dst)?;
                fs::set_permissions(&dst, fs::metadata(&src)?.permissions())?;
            }
            apply_diff(&src, &dst)?;
        } else if file_type.is_symlink() {
            remove_path(&dst)?;
            copy_symlink(&src, &dst)?;
        } else {
            remove_path(&dst)?;
            fs::copy(&src, &dst)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(src)?, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::copy(src, dst).map(|_| ())
}

/// Removes a file, symlink or directory tree. Absent paths are fine.
fn remove_path(path: &Path) -> std::io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn remove_dir_if_present(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::StorageWriteFailed(format!(
            "failed to remove {}: {}",
            dir.display(),
            e
        ))),
    }
}

// =============================================================================
// Metadata Persistence
// =============================================================================

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content =
        serde_json::to_vec_pretty(value).map_err(|e| Error::Serialization(e.to_string()))?;
    let temp_path = path.with_extension(format!("json.tmp.{}", uuid::Uuid::now_v7()));
    fs::write(&temp_path, content).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        Error::StorageWriteFailed(e.to_string())
    })
}

fn load_layers(dir: &Path) -> Result<HashMap<String, OverlayLayer>> {
    let mut layers = HashMap::new();
    for entry in fs::read_dir(dir)? {
        let layer_dir = entry?.path();
        let meta_path = layer_dir.join(LAYER_METADATA_FILE);
        if !meta_path.is_file() {
            // Staging leftovers from an interrupted unpack.
            if layer_dir.to_string_lossy().contains(".tmp.") {
                let _ = fs::remove_dir_all(&layer_dir);
            }
            continue;
        }
        match fs::read(&meta_path)
            .map_err(|e| e.to_string())
            .and_then(|c| serde_json::from_slice::<OverlayLayer>(&c).map_err(|e| e.to_string()))
        {
            Ok(mut layer) => {
                layer.diff = layer_dir.join(LAYER_DIFF_DIR);
                layers.insert(layer.id.clone(), layer);
            }
            Err(e) => warn!("Skipping unreadable layer {}: {}", layer_dir.display(), e),
        }
    }

    // Drop layers whose chain no longer resolves.
    let orphans: Vec<String> = layers
        .values()
        .filter(|l| l.parent.as_ref().is_some_and(|p| !layers.contains_key(p)))
        .map(|l| l.id.clone())
        .collect();
    for id in orphans {
        warn!("Ignoring layer {} with unregistered parent", id);
        layers.remove(&id);
    }
    Ok(layers)
}

fn load_mounts(dir: &Path) -> Result<HashMap<String, OverlayMount>> {
    let mut mounts = HashMap::new();
    for entry in fs::read_dir(dir)? {
        let meta_path = entry?.path().join(MOUNT_METADATA_FILE);
        if !meta_path.is_file() {
            continue;
        }
        match fs::read(&meta_path)
            .map_err(|e| e.to_string())
            .and_then(|c| serde_json::from_slice::<OverlayMount>(&c).map_err(|e| e.to_string()))
        {
            Ok(mount) => {
                mounts.insert(mount.container_id.clone(), mount);
            }
            Err(e) => warn!("Skipping unreadable mount {}: {}", meta_path.display(), e),
        }
    }
    Ok(mounts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_apply_diff_whiteouts_hide_lower_content() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("base");
        let top = temp.path().join("top");
        let target = temp.path().join("target");
        fs::create_dir_all(base.join("etc")).unwrap();
        fs::create_dir_all(base.join("var/cache")).unwrap();
        fs::write(base.join("etc/hosts"), "base").unwrap();
        fs::write(base.join("etc/motd"), "hello").unwrap();
        fs::write(base.join("var/cache/a"), "a").unwrap();

        fs::create_dir_all(top.join("etc")).unwrap();
        fs::create_dir_all(top.join("var/cache")).unwrap();
        fs::write(top.join("etc/.wh.motd"), "").unwrap();
        fs::write(top.join("etc/hosts"), "top").unwrap();
        fs::write(top.join("var/cache/.wh..wh..opq"), "").unwrap();
        fs::write(top.join("var/cache/b"), "b").unwrap();
        fs::create_dir_all(&target).unwrap();

        apply_diff(&base, &target).unwrap();
        apply_diff(&top, &target).unwrap();

        assert_eq!(fs::read_to_string(target.join("etc/hosts")).unwrap(), "top");
        assert!(!target.join("etc/motd").exists());
        assert!(!target.join("etc/.wh.motd").exists());
        assert!(!target.join("var/cache/a").exists());
        assert!(target.join("var/cache/b").is_file());
    }

    #[test]
    fn test_unpack_rejects_parent_components() {
        let temp = TempDir::new().unwrap();

        let mut header = tar::Header::new_gnu();
        let data = b"x";
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        // set_path refuses "..", so write the raw name bytes.
        let name = b"../escape";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_cksum();

        let mut builder = tar::Builder::new(Vec::new());
        builder.append(&header, &data[..]).unwrap();
        let archive = builder.into_inner().unwrap();

        let mut total = 0;
        let result = unpack_archive(&archive[..], temp.path(), "sha256:test", &mut total);
        assert!(matches!(result, Err(Error::PathTraversal { .. })));
    }
}
