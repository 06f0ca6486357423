//! Tests for blob storage module.
//!
//! Validates content-addressed storage, digest verification,
//! path traversal protection, and atomic writes.

use runplane::{BlobStore, Error};
use sha2::{Digest, Sha256};
use std::fs;
use tempfile::TempDir;

fn digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

// =============================================================================
// BlobStore Creation Tests
// =============================================================================

#[test]
fn test_blob_store_creates_nested_dirs() {
    let temp_dir = TempDir::new().unwrap();
    let store_path = temp_dir.path().join("deeply").join("nested").join("blobs");

    let store = BlobStore::open(&store_path).unwrap();

    assert!(store_path.is_dir(), "nested directories should be created");
    assert_eq!(store.base_dir(), store_path);
}

#[test]
fn test_open_over_a_file_fails() {
    let temp_dir = TempDir::new().unwrap();
    let file = temp_dir.path().join("not-a-dir");
    fs::write(&file, "x").unwrap();

    assert!(matches!(
        BlobStore::open(file.join("blobs")),
        Err(Error::StorageInitFailed { .. })
    ));
}

// =============================================================================
// Blob Storage Tests
// =============================================================================

#[test]
fn test_digest_of_matches_sha256() {
    assert_eq!(BlobStore::digest_of(b"layer"), digest(b"layer"));
}

#[test]
fn test_put_and_get_blob() {
    let temp_dir = TempDir::new().unwrap();
    let store = BlobStore::open(temp_dir.path()).unwrap();
    let data = b"layer content";
    let d = digest(data);

    store.put_blob(&d, data).unwrap();

    assert!(store.has_blob(&d));
    assert_eq!(store.get_blob(&d).unwrap(), data);
}

#[test]
fn test_blob_layout_is_sharded() {
    let temp_dir = TempDir::new().unwrap();
    let store = BlobStore::open(temp_dir.path()).unwrap();

    let d = store.put_bytes(b"sharded").unwrap();
    let hash = d.strip_prefix("sha256:").unwrap();

    assert!(
        temp_dir
            .path()
            .join("sha256")
            .join(&hash[..2])
            .join(hash)
            .is_file()
    );
}

#[test]
fn test_put_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let store = BlobStore::open(temp_dir.path()).unwrap();

    let first = store.put_bytes(b"same").unwrap();
    let second = store.put_bytes(b"same").unwrap();

    assert_eq!(first, second);
    assert_eq!(store.get_blob(&first).unwrap(), b"same");
}

#[test]
fn test_digest_mismatch_writes_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let store = BlobStore::open(temp_dir.path()).unwrap();
    let claimed = digest(b"expected");

    let err = store.put_blob(&claimed, b"tampered").unwrap_err();

    assert!(err.to_string().contains("digest mismatch"));
    assert!(!store.has_blob(&claimed));
    assert!(!temp_dir.path().join("sha256").exists());
}

#[test]
fn test_get_missing_blob() {
    let temp_dir = TempDir::new().unwrap();
    let store = BlobStore::open(temp_dir.path()).unwrap();

    let err = store.get_blob(&digest(b"absent")).unwrap_err();
    assert!(matches!(err, Error::BlobNotFound { .. }));
    assert!(err.is_not_found());
}

#[test]
fn test_remove_blob() {
    let temp_dir = TempDir::new().unwrap();
    let store = BlobStore::open(temp_dir.path()).unwrap();
    let d = store.put_bytes(b"short-lived").unwrap();

    store.remove_blob(&d).unwrap();
    assert!(!store.has_blob(&d));
    // Removing again is fine.
    store.remove_blob(&d).unwrap();
}

// =============================================================================
// Digest Safety Tests
// =============================================================================

#[test]
fn test_malformed_digests_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let store = BlobStore::open(temp_dir.path()).unwrap();

    let non_hex = format!("sha256:{}", "G".repeat(64));
    let upper_hex = format!("sha256:{}", "AB".repeat(32));
    for bad in [
        "sha256:../../etc/passwd",
        "sha256:abc",
        "md5:d41d8cd98f00b204e9800998ecf8427e",
        "no-algorithm",
        non_hex.as_str(),
        upper_hex.as_str(),
    ] {
        assert!(!store.has_blob(bad), "{bad}");
        assert!(store.get_blob(bad).is_err(), "{bad}");
        assert!(store.put_blob(bad, b"x").is_err(), "{bad}");
        assert!(store.remove_blob(bad).is_err(), "{bad}");
    }
}

#[test]
fn test_no_temp_files_left_behind() {
    let temp_dir = TempDir::new().unwrap();
    let store = BlobStore::open(temp_dir.path()).unwrap();
    let d = store.put_bytes(b"atomic").unwrap();
    let hash = d.strip_prefix("sha256:").unwrap();

    let shard = temp_dir.path().join("sha256").join(&hash[..2]);
    let names: Vec<String> = fs::read_dir(shard)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec![hash.to_string()]);
}

#[test]
fn test_concurrent_puts_of_same_blob() {
    let temp_dir = TempDir::new().unwrap();
    let store = BlobStore::open(temp_dir.path()).unwrap();
    let data = vec![7u8; 64 * 1024];

    std::thread::scope(|s| {
        for _ in 0..8 {
            let store = &store;
            let data = &data;
            s.spawn(move || {
                store.put_bytes(data).unwrap();
            });
        }
    });

    assert_eq!(store.get_blob(&digest(&data)).unwrap(), data);
}
