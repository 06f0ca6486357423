//! Backend implementations and backend selection.
//!
//! - [`ProcessRuntime`]: low-level OCI runtime binary as a subprocess
//! - [`RemoteVmRuntime`]: virtualization-management service
//!
//! Requests name their backend with [`RuntimeFlags`]; exactly one flag must
//! be set. The [`BackendRegistry`] maps the resolved [`BackendKind`] to a
//! configured backend.

pub mod process;
pub mod remote;

pub use self::process::{ProcessRuntime, RuntimeCommand};
pub use self::remote::{HttpVirtApi, RemoteVmRuntime, VirtApi, VmCreateRequest, VmInfo};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::runtime::{BackendKind, RuntimeBackend};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Backend choice carried by a create request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeFlags {
    /// Run through the subprocess backend.
    pub subprocess: bool,
    /// Run through the remote virtualization backend.
    pub remote: bool,
}

impl RuntimeFlags {
    pub fn subprocess() -> Self {
        Self {
            subprocess: true,
            remote: false,
        }
    }

    pub fn remote() -> Self {
        Self {
            subprocess: false,
            remote: true,
        }
    }

    /// Resolves the flags to exactly one backend.
    pub fn select(&self) -> Result<BackendKind> {
        match (self.subprocess, self.remote) {
            (true, false) => Ok(BackendKind::Subprocess),
            (false, true) => Ok(BackendKind::Remote),
            (false, false) => Err(Error::RuntimeSelection(
                "no runtime backend selected".to_string(),
            )),
            (true, true) => Err(Error::RuntimeSelection(
                "more than one runtime backend selected".to_string(),
            )),
        }
    }
}

/// Configured backends, keyed by kind.
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<BackendKind, Arc<dyn RuntimeBackend>>,
}

impl BackendRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the backends `config` describes. The subprocess backend is
    /// always present; the remote one only with an endpoint.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(ProcessRuntime::from_config(config)));
        if let Some(endpoint) = &config.remote_endpoint {
            registry.register(Arc::new(RemoteVmRuntime::connect(endpoint)?));
        }
        Ok(registry)
    }

    /// Adds `backend`, replacing any backend of the same kind.
    pub fn register(&mut self, backend: Arc<dyn RuntimeBackend>) {
        debug!("Registered {} backend", backend.kind());
        self.backends.insert(backend.kind(), backend);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, backend: Arc<dyn RuntimeBackend>) -> Self {
        self.register(backend);
        self
    }

    /// Returns the backend of `kind`, or a selection error if none is configured.
    pub fn get(&self, kind: BackendKind) -> Result<Arc<dyn RuntimeBackend>> {
        self.backends
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::RuntimeSelection(format!("{} backend is not configured", kind)))
    }

    /// Resolves `flags` and returns the matching backend.
    pub fn select(&self, flags: &RuntimeFlags) -> Result<Arc<dyn RuntimeBackend>> {
        self.get(flags.select()?)
    }

    /// Kinds with a configured backend.
    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<_> = self.backends.keys().copied().collect();
        kinds.sort_by_key(|k| *k == BackendKind::Remote);
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_requires_exactly_one_flag() {
        assert_eq!(RuntimeFlags::subprocess().select().unwrap(), BackendKind::Subprocess);
        assert_eq!(RuntimeFlags::remote().select().unwrap(), BackendKind::Remote);
        for flags in [
            RuntimeFlags::default(),
            RuntimeFlags {
                subprocess: true,
                remote: true,
            },
        ] {
            assert!(matches!(flags.select(), Err(Error::RuntimeSelection(_))));
        }
    }

    #[test]
    fn test_unconfigured_backend_is_selection_error() {
        let registry = BackendRegistry::new().with(Arc::new(ProcessRuntime::new("crun")));
        assert!(registry.select(&RuntimeFlags::subprocess()).is_ok());
        assert!(matches!(
            registry.select(&RuntimeFlags::remote()),
            Err(Error::RuntimeSelection(_))
        ));
        assert_eq!(registry.kinds(), vec![BackendKind::Subprocess]);
    }
}
