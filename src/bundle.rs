//! OCI runtime bundles and their `config.json`.
//!
//! A bundle is a directory holding a root filesystem plus a `config.json`
//! describing the container. The orchestrator never builds bundles itself:
//! it drives a [`ContainerBundle`] collaborator through create → validate →
//! (later) cleanup, then parses the configuration document with
//! [`load_config`].
//!
//! # Configuration Document
//!
//! `config.json` is decoded into [`ContainerConfig`], which knows the OCI
//! fields the control plane inspects. Top-level keys it does not know are
//! kept verbatim in [`ContainerConfig::extra`] so nothing is silently lost.

use crate::constants::{CONFIG_FILE, MAX_CONFIG_SIZE, ROOTFS_DIR};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

// =============================================================================
// Bundle Collaborator
// =============================================================================

/// Bundle lifecycle collaborator.
///
/// Implementations own how a bundle directory comes to exist and how it is
/// torn down. The orchestrator only requires that `validate_bundle` passes
/// before any backend sees the bundle.
pub trait ContainerBundle: Send + Sync {
    /// Bundle directory.
    fn path(&self) -> &Path;

    /// Materializes the bundle.
    fn create_bundle(&self) -> Result<()>;

    /// Checks the bundle's structure.
    fn validate_bundle(&self) -> Result<()>;

    /// Tears down whatever `create_bundle` produced.
    fn cleanup_bundle(&self) -> Result<()>;
}

/// A bundle backed by a plain directory.
///
/// `create_bundle` creates the directory and its root filesystem when
/// missing and, if built with [`DirectoryBundle::with_config`], writes
/// `config.json`. The root filesystem is `root.path` of the config (the one
/// given, else the one on disk), defaulting to `rootfs/`.
/// `cleanup_bundle` removes exactly what `create_bundle` created, so a
/// caller-provided bundle is never deleted.
pub struct DirectoryBundle {
    path: PathBuf,
    config: Option<ContainerConfig>,
    created: Mutex<Vec<PathBuf>>,
}

impl DirectoryBundle {
    /// Wraps an existing (or to-be-created) bundle directory.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            config: None,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Wraps a bundle directory whose `config.json` is generated on create.
    pub fn with_config(path: impl Into<PathBuf>, config: ContainerConfig) -> Self {
        Self {
            config: Some(config),
            ..Self::new(path)
        }
    }

    /// Root filesystem directory: `root.path` of the generated config, else
    /// of the `config.json` on disk, else `rootfs/`.
    fn rootfs(&self) -> PathBuf {
        if let Some(config) = &self.config {
            return config.rootfs_path(&self.path);
        }
        let on_disk = fs::read(self.path.join(CONFIG_FILE))
            .ok()
            .filter(|raw| raw.len() as u64 <= MAX_CONFIG_SIZE)
            .and_then(|raw| serde_json::from_slice::<RootOnly>(&raw).ok())
            .and_then(|doc| doc.root);
        match on_disk {
            Some(root) if !root.path.trim().is_empty() => self.path.join(root.path),
            _ => self.path.join(ROOTFS_DIR),
        }
    }

    fn record_created(&self, path: PathBuf) -> Result<()> {
        self.created
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?
            .push(path);
        Ok(())
    }
}

impl ContainerBundle for DirectoryBundle {
    fn path(&self) -> &Path {
        &self.path
    }

    fn create_bundle(&self) -> Result<()> {
        if !self.path.exists() {
            fs::create_dir_all(&self.path)
                .map_err(|e| Error::BundleBuildFailed(format!("failed to create bundle: {}", e)))?;
            self.record_created(self.path.clone())?;
        }

        let rootfs = self.rootfs();
        if !rootfs.exists() {
            fs::create_dir_all(&rootfs)
                .map_err(|e| Error::BundleBuildFailed(format!("failed to create rootfs: {}", e)))?;
            self.record_created(rootfs)?;
        }

        let config_path = self.path.join(CONFIG_FILE);
        if let Some(config) = &self.config
            && !config_path.exists()
        {
            let json = serde_json::to_string_pretty(config).map_err(|e| {
                Error::BundleBuildFailed(format!("failed to serialize config: {}", e))
            })?;
            fs::write(&config_path, json).map_err(|e| {
                Error::BundleBuildFailed(format!("failed to write config.json: {}", e))
            })?;
            self.record_created(config_path)?;
        }

        debug!("Bundle ready at {}", self.path.display());
        Ok(())
    }

    fn validate_bundle(&self) -> Result<()> {
        let invalid = |reason: &str| Error::InvalidBundle {
            path: self.path.clone(),
            reason: reason.to_string(),
        };

        if !self.path.is_dir() {
            return Err(invalid("bundle directory does not exist"));
        }
        if !self.path.join(CONFIG_FILE).is_file() {
            return Err(invalid("config.json not found"));
        }
        if !self.rootfs().is_dir() {
            return Err(invalid("rootfs not found"));
        }
        Ok(())
    }

    fn cleanup_bundle(&self) -> Result<()> {
        let created = std::mem::take(
            &mut *self
                .created
                .lock()
                .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?,
        );

        // Reverse creation order: files and rootfs before the bundle dir.
        for path in created.iter().rev() {
            let result = if path.is_dir() {
                fs::remove_dir_all(path)
            } else {
                fs::remove_file(path)
            };
            match result {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(Error::BundleCleanupFailed {
                        path: path.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if !created.is_empty() {
            info!("Cleaned up bundle {}", self.path.display());
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Document
// =============================================================================

/// Reads and parses `<bundle>/config.json`.
///
/// Any failure to read or decode the document (missing file, oversized
/// file, malformed JSON, wrong field types, missing required fields) is an
/// [`Error::ConfigurationParse`]; semantic checks belong to
/// [`SpecValidator`](crate::validate::SpecValidator).
pub fn load_config(bundle: &Path) -> Result<ContainerConfig> {
    let path = bundle.join(CONFIG_FILE);
    let parse_error = |reason: String| Error::ConfigurationParse {
        path: path.clone(),
        reason,
    };

    let meta = fs::metadata(&path).map_err(|e| parse_error(e.to_string()))?;
    if meta.len() > MAX_CONFIG_SIZE {
        return Err(parse_error(format!(
            "document is {} bytes, limit is {}",
            meta.len(),
            MAX_CONFIG_SIZE
        )));
    }

    let content = fs::read_to_string(&path).map_err(|e| parse_error(e.to_string()))?;
    let config: ContainerConfig =
        serde_json::from_str(&content).map_err(|e| parse_error(e.to_string()))?;

    if !config.extra.is_empty() {
        warn!(
            "config.json at {} has unrecognized keys: {:?}",
            bundle.display(),
            config.extra.keys().collect::<Vec<_>>()
        );
    }

    Ok(config)
}

/// Parsed bundle configuration (OCI runtime spec subset).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    pub oci_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<OciRoot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<OciProcess>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<OciMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux: Option<OciLinux>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Top-level keys not modeled above.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ContainerConfig {
    /// Root filesystem of a bundle at `bundle` described by this config.
    /// A relative `root.path` is resolved against the bundle directory.
    pub fn rootfs_path(&self, bundle: &Path) -> PathBuf {
        match &self.root {
            Some(root) if !root.path.trim().is_empty() => bundle.join(&root.path),
            _ => bundle.join(ROOTFS_DIR),
        }
    }
}

/// Just the `root` of a `config.json`, read leniently for bundle checks.
#[derive(Deserialize)]
struct RootOnly {
    #[serde(default)]
    root: Option<OciRoot>,
}

/// OCI root filesystem config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciRoot {
    pub path: String,
    #[serde(default)]
    pub readonly: bool,
}

/// OCI process config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciProcess {
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub user: OciUser,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    pub cwd: String,
}

/// OCI user config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciUser {
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_gids: Vec<u32>,
}

/// OCI mount config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciMount {
    pub destination: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub mount_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

/// OCI Linux-specific config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OciLinux {
    #[serde(default)]
    pub namespaces: Vec<OciNamespace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<serde_json::Value>,
}

/// OCI namespace config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciNamespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_unknown_keys_go_to_extra() {
        let json = r#"{
            "ociVersion": "1.0.2",
            "root": {"path": "rootfs"},
            "vendorExtension": {"x": 1}
        }"#;
        let config: ContainerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.oci_version, "1.0.2");
        assert_eq!(config.root.unwrap().path, "rootfs");
        assert_eq!(config.extra.len(), 1);
        assert!(config.extra.contains_key("vendorExtension"));
    }

    #[test]
    fn test_missing_oci_version_is_parse_error() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(CONFIG_FILE), r#"{"root": {"path": "rootfs"}}"#).unwrap();

        let err = load_config(temp.path()).unwrap_err();
        assert!(matches!(err, Error::ConfigurationParse { .. }));
    }

    #[test]
    fn test_cleanup_only_removes_created_paths() {
        let temp = TempDir::new().unwrap();
        let existing = temp.path().join("existing");
        fs::create_dir_all(existing.join(ROOTFS_DIR)).unwrap();
        fs::write(existing.join(CONFIG_FILE), "{}").unwrap();

        let bundle = DirectoryBundle::new(&existing);
        bundle.create_bundle().unwrap();
        bundle.cleanup_bundle().unwrap();

        assert!(existing.join(ROOTFS_DIR).is_dir());
        assert!(existing.join(CONFIG_FILE).is_file());
    }
}
