//! Tests for error types.
//!
//! Validates display formatting, category mapping and the helpers callers
//! branch on.

use runplane::{Error, ErrorCategory};
use std::path::PathBuf;

fn exec_error(exit_code: Option<i32>, stdout: &str, stderr: &str) -> Error {
    Error::RuntimeExecution {
        id: "c1".to_string(),
        operation: "create".to_string(),
        exit_code,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

// =============================================================================
// Display Tests
// =============================================================================

#[test]
fn test_invalid_container_id_display() {
    let err = Error::InvalidContainerId {
        id: "bad/../id".to_string(),
        reason: "contains invalid characters".to_string(),
    };
    let msg = err.to_string();

    assert!(msg.contains("bad/../id"), "should include container ID");
    assert!(msg.contains("contains invalid characters"));
}

#[test]
fn test_runtime_execution_display_uses_last_stderr_line() {
    let err = exec_error(
        Some(137),
        "some stdout",
        "warning: cgroup v1\ncontainer init failed: OOM\n\n",
    );
    let msg = err.to_string();

    assert!(msg.contains("create"));
    assert!(msg.contains("'c1'"));
    assert!(msg.contains("exit code 137"));
    assert!(msg.ends_with("container init failed: OOM"), "{msg}");
}

#[test]
fn test_runtime_execution_display_falls_back_to_stdout() {
    let msg = exec_error(Some(1), "error: bundle not found\n", "").to_string();
    assert!(msg.ends_with("error: bundle not found"), "{msg}");
}

#[test]
fn test_runtime_execution_display_without_output() {
    let msg = exec_error(None, "", "  \n").to_string();
    assert!(msg.contains("exit code none"));
    assert!(msg.contains("no diagnostic output"));
}

#[test]
fn test_configuration_parse_display() {
    let err = Error::ConfigurationParse {
        path: PathBuf::from("/tmp/b1/config.json"),
        reason: "expected value at line 1 column 3".to_string(),
    };
    let msg = err.to_string();

    assert!(msg.contains("/tmp/b1/config.json"));
    assert!(msg.contains("line 1 column 3"));
}

#[test]
fn test_state_transition_display() {
    let err = Error::InvalidStateTransition {
        id: "c1".to_string(),
        from: "stopped".to_string(),
        to: "running".to_string(),
    };
    assert_eq!(
        err.to_string(),
        "container 'c1' cannot move from 'stopped' to 'running'"
    );
}

// =============================================================================
// Category Tests
// =============================================================================

#[test]
fn test_categories() {
    let cases = [
        (
            Error::ConfigurationParse {
                path: PathBuf::from("config.json"),
                reason: String::new(),
            },
            ErrorCategory::Configuration,
        ),
        (Error::InvalidConfig("x".into()), ErrorCategory::Configuration),
        (Error::Validation("x".into()), ErrorCategory::Validation),
        (
            Error::InvalidContainerId {
                id: "..".into(),
                reason: "x".into(),
            },
            ErrorCategory::Validation,
        ),
        (
            Error::RuntimeSelection("none".into()),
            ErrorCategory::RuntimeSelection,
        ),
        (exec_error(Some(1), "", ""), ErrorCategory::RuntimeExecution),
        (
            Error::RuntimeUnavailable {
                runtime: "crun".into(),
                reason: "not found".into(),
            },
            ErrorCategory::RuntimeExecution,
        ),
        (
            Error::BackendProtocol {
                backend: "remote".into(),
                reason: "bad json".into(),
            },
            ErrorCategory::RuntimeExecution,
        ),
        (Error::LayerNotFound("sha256:x".into()), ErrorCategory::Storage),
        (Error::AlreadyMounted("c1".into()), ErrorCategory::Storage),
        (
            Error::PathTraversal {
                path: "../x".into(),
            },
            ErrorCategory::Storage,
        ),
        (Error::StateNotFound("c1".into()), ErrorCategory::State),
        (
            Error::StateCorrupted {
                id: "c1".into(),
                reason: "eof".into(),
            },
            ErrorCategory::State,
        ),
        (
            Error::InvalidBundle {
                path: PathBuf::from("/tmp/b1"),
                reason: "rootfs not found".into(),
            },
            ErrorCategory::Bundle,
        ),
        (Error::Internal("x".into()), ErrorCategory::Internal),
    ];

    for (err, category) in cases {
        assert_eq!(err.category(), category, "{err:?}");
    }
}

#[test]
fn test_io_errors_convert() {
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    let err: Error = io.into();

    assert!(matches!(err, Error::Io(_)));
    assert_eq!(err.category(), ErrorCategory::Internal);
}

// =============================================================================
// Helper Tests
// =============================================================================

#[test]
fn test_is_not_found() {
    assert!(Error::StateNotFound("c1".into()).is_not_found());
    assert!(Error::LayerNotFound("l".into()).is_not_found());
    assert!(Error::MountNotFound("c1".into()).is_not_found());
    assert!(
        Error::BlobNotFound {
            digest: "sha256:x".into()
        }
        .is_not_found()
    );
    assert!(!Error::ContainerAlreadyExists("c1".into()).is_not_found());
    assert!(!exec_error(Some(1), "", "not found").is_not_found());
}

#[test]
fn test_stderr_accessor() {
    assert_eq!(
        exec_error(Some(2), "out", "boom").stderr(),
        Some("boom")
    );
    assert_eq!(Error::Validation("x".into()).stderr(), None);
}
