//! Semantic validation of a parsed bundle configuration.
//!
//! Parsing (`serde`) guarantees shape; a [`SpecValidator`] decides whether
//! the content makes sense. Failures here are [`Error::Validation`] and
//! always happen before any backend is selected.

use crate::bundle::ContainerConfig;
use crate::constants::SUPPORTED_OCI_MAJOR_VERSION;
use crate::error::{Error, Result};
use std::collections::HashSet;

/// Namespace types accepted in `linux.namespaces`.
const KNOWN_NAMESPACES: &[&str] = &[
    "pid", "network", "mount", "ipc", "uts", "user", "cgroup", "time",
];

/// Spec validation collaborator.
pub trait SpecValidator: Send + Sync {
    /// Validates a parsed configuration document.
    fn validate_spec(&self, config: &ContainerConfig) -> Result<()>;
}

/// Structural OCI checks that every backend relies on.
#[derive(Debug, Clone, Copy, Default)]
pub struct OciSpecValidator;

impl SpecValidator for OciSpecValidator {
    fn validate_spec(&self, config: &ContainerConfig) -> Result<()> {
        check_version(&config.oci_version)?;

        if let Some(root) = &config.root
            && root.path.trim().is_empty()
        {
            return Err(Error::Validation("root.path must not be empty".to_string()));
        }

        if let Some(process) = &config.process {
            if process.args.is_empty() {
                return Err(Error::Validation(
                    "process.args must contain at least one entry".to_string(),
                ));
            }
            if !process.cwd.starts_with('/') {
                return Err(Error::Validation(format!(
                    "process.cwd must be absolute, got '{}'",
                    process.cwd
                )));
            }
            if let Some(bad) = process.env.iter().find(|e| !e.contains('=')) {
                return Err(Error::Validation(format!(
                    "process.env entry '{}' is not KEY=VALUE",
                    bad
                )));
            }
        }

        for mount in &config.mounts {
            if !mount.destination.starts_with('/') {
                return Err(Error::Validation(format!(
                    "mount destination must be absolute, got '{}'",
                    mount.destination
                )));
            }
        }

        if let Some(linux) = &config.linux {
            let mut seen = HashSet::new();
            for ns in &linux.namespaces {
                if !KNOWN_NAMESPACES.contains(&ns.ns_type.as_str()) {
                    return Err(Error::Validation(format!(
                        "unknown namespace type '{}'",
                        ns.ns_type
                    )));
                }
                if !seen.insert(ns.ns_type.as_str()) {
                    return Err(Error::Validation(format!(
                        "namespace '{}' listed more than once",
                        ns.ns_type
                    )));
                }
            }
        }

        Ok(())
    }
}

fn check_version(version: &str) -> Result<()> {
    if version.trim().is_empty() {
        return Err(Error::Validation("ociVersion must not be empty".to_string()));
    }
    let major = version
        .split('.')
        .next()
        .and_then(|m| m.parse::<u64>().ok())
        .ok_or_else(|| Error::Validation(format!("ociVersion '{}' is not a version", version)))?;
    if major != SUPPORTED_OCI_MAJOR_VERSION {
        return Err(Error::Validation(format!(
            "unsupported ociVersion '{}' (expected {}.x)",
            version, SUPPORTED_OCI_MAJOR_VERSION
        )));
    }
    Ok(())
}
