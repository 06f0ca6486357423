//! Tests for OCI runtime bundles.
//!
//! Validates the directory bundle lifecycle (create, validate, cleanup),
//! config.json parsing and the semantic spec validator.

use runplane::{
    CONFIG_FILE, ContainerBundle, ContainerConfig, DirectoryBundle, Error, MAX_CONFIG_SIZE,
    OciSpecValidator, ROOTFS_DIR, SpecValidator, load_config,
};
use std::fs;
use tempfile::TempDir;

fn config(json: &str) -> ContainerConfig {
    serde_json::from_str(json).unwrap()
}

const MINIMAL: &str = r#"{"ociVersion": "1.0.2", "root": {"path": "rootfs"}}"#;

// =============================================================================
// DirectoryBundle Tests
// =============================================================================

#[test]
fn test_generated_bundle_lifecycle() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("b1");
    let bundle = DirectoryBundle::with_config(&path, config(MINIMAL));

    bundle.create_bundle().unwrap();
    assert!(path.join(ROOTFS_DIR).is_dir());
    assert!(path.join(CONFIG_FILE).is_file());
    bundle.validate_bundle().unwrap();

    let written = load_config(&path).unwrap();
    assert_eq!(written.oci_version, "1.0.2");

    bundle.cleanup_bundle().unwrap();
    assert!(!path.exists());
    // Intermediate parents are not tracked.
    assert!(temp_dir.path().join("nested").is_dir());
}

#[test]
fn test_custom_root_path_is_honoured() {
    let temp_dir = TempDir::new().unwrap();
    let bundle = DirectoryBundle::with_config(
        temp_dir.path().join("b1"),
        config(r#"{"ociVersion": "1.0.2", "root": {"path": "fs"}}"#),
    );

    bundle.create_bundle().unwrap();

    assert!(temp_dir.path().join("b1/fs").is_dir());
    assert!(!temp_dir.path().join("b1/rootfs").exists());
    bundle.validate_bundle().unwrap();
}

#[test]
fn test_on_disk_root_path_is_honoured() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("b1");
    fs::create_dir_all(&path).unwrap();
    fs::write(
        path.join(CONFIG_FILE),
        r#"{"ociVersion": "1.0.2", "root": {"path": "fs"}}"#,
    )
    .unwrap();
    let bundle = DirectoryBundle::new(&path);

    // Only the configured root satisfies validation.
    fs::create_dir_all(path.join(ROOTFS_DIR)).unwrap();
    assert!(matches!(
        bundle.validate_bundle(),
        Err(Error::InvalidBundle { .. })
    ));

    bundle.create_bundle().unwrap();
    assert!(path.join("fs").is_dir());
    bundle.validate_bundle().unwrap();

    bundle.cleanup_bundle().unwrap();
    assert!(!path.join("fs").exists());
    assert!(path.join(CONFIG_FILE).is_file());
}

#[test]
fn test_unreadable_config_falls_back_to_rootfs() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("b1");
    fs::create_dir_all(&path).unwrap();
    fs::write(path.join(CONFIG_FILE), "{ not json").unwrap();

    DirectoryBundle::new(&path).create_bundle().unwrap();
    assert!(path.join(ROOTFS_DIR).is_dir());
}

#[test]
fn test_existing_config_is_not_overwritten() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("b1");
    fs::create_dir_all(&path).unwrap();
    fs::write(path.join(CONFIG_FILE), MINIMAL).unwrap();

    let bundle = DirectoryBundle::with_config(
        &path,
        config(r#"{"ociVersion": "1.1.0", "root": {"path": "rootfs"}}"#),
    );
    bundle.create_bundle().unwrap();

    assert_eq!(fs::read_to_string(path.join(CONFIG_FILE)).unwrap(), MINIMAL);

    // Only rootfs was created, so only rootfs is removed.
    bundle.cleanup_bundle().unwrap();
    assert!(path.join(CONFIG_FILE).is_file());
    assert!(!path.join(ROOTFS_DIR).exists());
}

#[test]
fn test_validate_reports_what_is_missing() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("b1");
    let bundle = DirectoryBundle::new(&path);

    let reason = |bundle: &DirectoryBundle| match bundle.validate_bundle() {
        Err(Error::InvalidBundle { reason, .. }) => reason,
        other => panic!("expected InvalidBundle, got {other:?}"),
    };

    assert!(reason(&bundle).contains("does not exist"));
    fs::create_dir_all(&path).unwrap();
    assert!(reason(&bundle).contains("config.json"));
    fs::write(path.join(CONFIG_FILE), MINIMAL).unwrap();
    assert!(reason(&bundle).contains("rootfs"));
    fs::create_dir_all(path.join(ROOTFS_DIR)).unwrap();
    bundle.validate_bundle().unwrap();
}

#[test]
fn test_cleanup_without_create_is_noop() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("b1");
    fs::create_dir_all(path.join(ROOTFS_DIR)).unwrap();

    DirectoryBundle::new(&path).cleanup_bundle().unwrap();
    assert!(path.join(ROOTFS_DIR).is_dir());
}

// =============================================================================
// load_config Tests
// =============================================================================

#[test]
fn test_load_full_config() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join(CONFIG_FILE),
        r#"{
            "ociVersion": "1.0.2",
            "root": {"path": "rootfs", "readonly": true},
            "process": {
                "args": ["/bin/sh", "-c", "echo hi"],
                "env": ["PATH=/usr/bin"],
                "cwd": "/",
                "user": {"uid": 1000, "gid": 1000}
            },
            "hostname": "box",
            "mounts": [{"destination": "/proc", "type": "proc", "source": "proc"}],
            "linux": {"namespaces": [{"type": "pid"}, {"type": "network", "path": "/proc/1/ns/net"}]},
            "annotations": {"org.example/owner": "ops"}
        }"#,
    )
    .unwrap();

    let config = load_config(temp_dir.path()).unwrap();

    let root = config.root.as_ref().unwrap();
    assert!(root.readonly);
    let process = config.process.as_ref().unwrap();
    assert_eq!(process.args.len(), 3);
    assert_eq!(process.user.uid, 1000);
    assert_eq!(config.hostname.as_deref(), Some("box"));
    assert_eq!(config.mounts[0].mount_type.as_deref(), Some("proc"));
    let namespaces = &config.linux.as_ref().unwrap().namespaces;
    assert_eq!(namespaces[1].path.as_deref(), Some("/proc/1/ns/net"));
    assert_eq!(config.annotations["org.example/owner"], "ops");
    assert!(config.extra.is_empty());
}

#[test]
fn test_load_config_failures_are_parse_errors() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path();

    // Missing file.
    assert!(matches!(
        load_config(path),
        Err(Error::ConfigurationParse { .. })
    ));

    for bad in [
        "",
        "{",
        "[]",
        r#"{"ociVersion": true}"#,
        r#"{"ociVersion": "1.0.2", "process": {"args": []}}"#,
    ] {
        fs::write(path.join(CONFIG_FILE), bad).unwrap();
        assert!(
            matches!(load_config(path), Err(Error::ConfigurationParse { .. })),
            "{bad:?} should fail to parse"
        );
    }
}

#[test]
fn test_oversized_config_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let padding = " ".repeat(MAX_CONFIG_SIZE as usize + 1);
    fs::write(
        temp_dir.path().join(CONFIG_FILE),
        format!("{}{}", MINIMAL, padding),
    )
    .unwrap();

    let err = load_config(temp_dir.path()).unwrap_err();
    assert!(err.to_string().contains("limit"));
}

// =============================================================================
// Spec Validation Tests
// =============================================================================

#[test]
fn test_valid_specs_pass() {
    let validator = OciSpecValidator;
    for json in [
        MINIMAL,
        r#"{"ociVersion": "1.2.0"}"#,
        r#"{"ociVersion": "1.0.0-rc1", "process": {"args": ["sh"], "cwd": "/"}}"#,
        r#"{"ociVersion": "1.0.2", "linux": {"namespaces": [{"type": "pid"}, {"type": "mount"}]}}"#,
    ] {
        assert!(validator.validate_spec(&config(json)).is_ok(), "{json}");
    }
}

#[test]
fn test_invalid_specs_rejected() {
    let validator = OciSpecValidator;
    for json in [
        r#"{"ociVersion": ""}"#,
        r#"{"ociVersion": "2.0.0"}"#,
        r#"{"ociVersion": "latest"}"#,
        r#"{"ociVersion": "1.0.2", "root": {"path": " "}}"#,
        r#"{"ociVersion": "1.0.2", "process": {"args": [], "cwd": "/"}}"#,
        r#"{"ociVersion": "1.0.2", "process": {"args": ["sh"], "cwd": "relative"}}"#,
        r#"{"ociVersion": "1.0.2", "process": {"args": ["sh"], "cwd": "/", "env": ["NOEQUALS"]}}"#,
        r#"{"ociVersion": "1.0.2", "mounts": [{"destination": "proc"}]}"#,
        r#"{"ociVersion": "1.0.2", "linux": {"namespaces": [{"type": "bogus"}]}}"#,
        r#"{"ociVersion": "1.0.2", "linux": {"namespaces": [{"type": "pid"}, {"type": "pid"}]}}"#,
    ] {
        assert!(
            matches!(
                validator.validate_spec(&config(json)),
                Err(Error::Validation(_))
            ),
            "{json} should be rejected"
        );
    }
}
