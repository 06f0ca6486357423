//! Tests for constants module.
//!
//! Validates that security-critical limits have sane values and that
//! container id validation rejects anything that could name a path.

use runplane::*;
use std::time::Duration;

// =============================================================================
// Size Limit Tests
// =============================================================================

#[test]
fn test_layer_size_reasonable() {
    // Layers should support typical base images (100-500 MiB)
    assert!(
        MAX_LAYER_SIZE >= 100 * 1024 * 1024,
        "layer size limit too restrictive for base images"
    );
    assert!(
        MAX_LAYER_SIZE <= 1024 * 1024 * 1024,
        "layer size limit too permissive (> 1 GiB)"
    );
}

#[test]
fn test_rootfs_size_bounds_layers() {
    assert!(MAX_ROOTFS_SIZE >= MAX_LAYER_SIZE as u64);
    assert!(
        MAX_ROOTFS_SIZE <= 16 * 1024 * 1024 * 1024,
        "rootfs limit too permissive (> 16 GiB)"
    );
}

#[test]
fn test_layers_count_reasonable() {
    assert!(MAX_LAYERS >= 50, "layer count too restrictive");
    assert!(MAX_LAYERS <= 256, "layer count too permissive");
}

#[test]
fn test_config_size_reasonable() {
    // Real config.json documents are a few KiB.
    assert!(MAX_CONFIG_SIZE >= 64 * 1024);
    assert!(MAX_CONFIG_SIZE <= 16 * 1024 * 1024);
}

#[test]
fn test_virt_api_timeout_reasonable() {
    assert!(VIRT_API_TIMEOUT >= Duration::from_secs(5));
    assert!(VIRT_API_TIMEOUT <= Duration::from_secs(300));
}

#[test]
fn test_stop_wait_polls_several_times() {
    assert!(STOP_POLL_INTERVAL * 10 <= DEFAULT_STOP_TIMEOUT);
    assert!(DEFAULT_STOP_TIMEOUT <= Duration::from_secs(60));
}

// =============================================================================
// Layout Tests
// =============================================================================

#[test]
fn test_layout_names_are_single_components() {
    for name in [
        STATE_DIR,
        BLOB_STORE_DIR,
        LAYER_DIR,
        MOUNT_DIR,
        STATE_FILE,
        LAYER_METADATA_FILE,
        LAYER_DIFF_DIR,
        MOUNT_METADATA_FILE,
        CONFIG_FILE,
        ROOTFS_DIR,
    ] {
        assert!(!name.is_empty());
        assert!(!name.contains('/'), "{name} must not contain a separator");
        assert_ne!(name, "..");
    }
}

#[test]
fn test_system_base_dir_is_absolute() {
    assert!(SYSTEM_BASE_DIR.starts_with('/'));
    assert!(!USER_BASE_DIR.starts_with('/'));
}

#[test]
fn test_layer_media_types_are_distinct() {
    assert_ne!(OCI_LAYER_MEDIA_TYPE_GZIP, OCI_LAYER_MEDIA_TYPE_TAR);
    assert_ne!(OCI_LAYER_MEDIA_TYPE_GZIP, DOCKER_LAYER_MEDIA_TYPE_GZIP);
    assert!(OCI_LAYER_MEDIA_TYPE_GZIP.ends_with("+gzip"));
}

// =============================================================================
// Container ID Validation Tests
// =============================================================================

#[test]
fn test_valid_container_ids() {
    let longest = "x".repeat(MAX_CONTAINER_ID_LEN);
    for id in ["c1", "web-01", "db_primary", "A", longest.as_str()] {
        assert!(validate_container_id(id).is_ok(), "{id} should be valid");
    }
}

#[test]
fn test_path_like_container_ids_rejected() {
    for id in ["..", "../etc", "a/b", "/abs", "a.b", "c1\0", "c 1", "c1\n"] {
        assert!(
            validate_container_id(id).is_err(),
            "{id:?} should be rejected"
        );
    }
}

#[test]
fn test_container_id_length_limit() {
    let err = validate_container_id(&"x".repeat(MAX_CONTAINER_ID_LEN + 1)).unwrap_err();
    assert!(err.contains("maximum length"));
    assert!(validate_container_id("").unwrap_err().contains("empty"));
}

#[test]
fn test_valid_chars_exclude_separators() {
    assert!(!CONTAINER_NAME_VALID_CHARS.contains('/'));
    assert!(!CONTAINER_NAME_VALID_CHARS.contains('.'));
    assert!(!CONTAINER_NAME_VALID_CHARS.contains('\\'));
}
