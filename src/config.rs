//! Runtime configuration.
//!
//! [`RuntimeConfig`] decides where state, blobs and overlay layers live and
//! how the two backends are reached. It is assembled from defaults, an
//! optional JSON file, and `RUNPLANE_*` environment overrides, in that
//! order.
//!
//! | Variable                   | Field             |
//! |----------------------------|-------------------|
//! | `RUNPLANE_ROOT`            | `base_dir`        |
//! | `RUNPLANE_RUNTIME`         | `runtime_binary`  |
//! | `RUNPLANE_RUNTIME_ARGS`    | `runtime_args`    |
//! | `RUNPLANE_REMOTE_ENDPOINT` | `remote_endpoint` |
//! | `RUNPLANE_STOP_SIGNAL`     | `stop_signal`     |

use crate::constants::{
    BLOB_STORE_DIR, DEFAULT_RUNTIME_BINARY, DEFAULT_STOP_SIGNAL, STATE_DIR, SYSTEM_BASE_DIR,
    USER_BASE_DIR,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Control-plane configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    /// Root of all on-disk data.
    pub base_dir: PathBuf,
    /// Low-level OCI runtime binary for the subprocess backend.
    pub runtime_binary: String,
    /// Arguments placed before the subcommand on every invocation
    /// (e.g. `--root /run/crun`).
    pub runtime_args: Vec<String>,
    /// Base URL of the virtualization-management service. The remote backend
    /// is unavailable when unset.
    pub remote_endpoint: Option<String>,
    /// Signal the subprocess backend sends on stop.
    pub stop_signal: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            runtime_binary: DEFAULT_RUNTIME_BINARY.to_string(),
            runtime_args: Vec::new(),
            remote_endpoint: None,
            stop_signal: DEFAULT_STOP_SIGNAL.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Loads a configuration file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let parse_error = |reason: String| Error::ConfigurationParse {
            path: path.to_path_buf(),
            reason,
        };
        let content = fs::read_to_string(path).map_err(|e| parse_error(e.to_string()))?;
        let config: Self = serde_json::from_str(&content).map_err(|e| parse_error(e.to_string()))?;
        config.validate()?;

        debug!("Loaded runtime config from {}", path.display());
        Ok(config)
    }

    /// Defaults with `RUNPLANE_*` overrides from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`, keyed by environment variable name.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(root) = lookup("RUNPLANE_ROOT") {
            self.base_dir = PathBuf::from(root);
        }
        if let Some(binary) = lookup("RUNPLANE_RUNTIME") {
            self.runtime_binary = binary;
        }
        if let Some(args) = lookup("RUNPLANE_RUNTIME_ARGS") {
            self.runtime_args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Some(endpoint) = lookup("RUNPLANE_REMOTE_ENDPOINT") {
            self.remote_endpoint = Some(endpoint).filter(|e| !e.is_empty());
        }
        if let Some(signal) = lookup("RUNPLANE_STOP_SIGNAL") {
            self.stop_signal = signal;
        }
        self.validate()?;
        Ok(self)
    }

    /// Rejects values no backend can work with.
    pub fn validate(&self) -> Result<()> {
        if self.base_dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("baseDir must not be empty".to_string()));
        }
        if self.runtime_binary.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "runtimeBinary must not be empty".to_string(),
            ));
        }
        if self.stop_signal.trim().is_empty() {
            return Err(Error::InvalidConfig("stopSignal must not be empty".to_string()));
        }
        if let Some(endpoint) = &self.remote_endpoint
            && !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
        {
            return Err(Error::InvalidConfig(format!(
                "remoteEndpoint must be an http(s) URL, got '{}'",
                endpoint
            )));
        }
        Ok(())
    }

    /// Directory of persisted container records.
    pub fn state_dir(&self) -> PathBuf {
        self.base_dir.join(STATE_DIR)
    }

    /// Directory of content-addressed layer blobs.
    pub fn blob_dir(&self) -> PathBuf {
        self.base_dir.join(BLOB_STORE_DIR)
    }

    /// Root of the overlay engine (`layers/` and `mounts/`).
    pub fn overlay_dir(&self) -> PathBuf {
        self.base_dir.clone()
    }
}

/// `/var/lib/runplane` for root, `~/.runplane` otherwise.
fn default_base_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    if nix::unistd::geteuid().is_root() {
        return PathBuf::from(SYSTEM_BASE_DIR);
    }

    dirs::home_dir()
        .map(|h| h.join(USER_BASE_DIR))
        .unwrap_or_else(|| PathBuf::from(SYSTEM_BASE_DIR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        fs::write(&path, r#"{"runtimeBinary": "runc", "runtimeArgs": ["--root", "/run/runc"]}"#)
            .unwrap();

        let config = RuntimeConfig::load(&path).unwrap();
        assert_eq!(config.runtime_binary, "runc");
        assert_eq!(config.runtime_args, vec!["--root", "/run/runc"]);
        assert_eq!(config.stop_signal, DEFAULT_STOP_SIGNAL);
        assert!(config.remote_endpoint.is_none());
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            RuntimeConfig::load(&path),
            Err(Error::ConfigurationParse { .. })
        ));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("RUNPLANE_ROOT", "/srv/runplane"),
            ("RUNPLANE_RUNTIME_ARGS", "--root  /run/crun"),
            ("RUNPLANE_REMOTE_ENDPOINT", "http://127.0.0.1:8080"),
        ]
        .into_iter()
        .collect();

        let config = RuntimeConfig::default()
            .with_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.state_dir(), PathBuf::from("/srv/runplane/state"));
        assert_eq!(config.runtime_args, vec!["--root", "/run/crun"]);
        assert_eq!(config.remote_endpoint.as_deref(), Some("http://127.0.0.1:8080"));
    }

    #[test]
    fn test_bad_endpoint_rejected() {
        let result = RuntimeConfig::default().with_overrides(|k| {
            (k == "RUNPLANE_REMOTE_ENDPOINT").then(|| "unix:///run/virt.sock".to_string())
        });
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
