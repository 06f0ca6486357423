//! Subprocess backend: drives a low-level OCI runtime binary (crun, runc).
//!
//! Every operation is one invocation of the binary:
//!
//! ```text
//! <binary> [global args] create --bundle <path> [--no-pivot] [--no-new-keyring]
//!                               [--preserve-fds <csv>] <id>
//! <binary> [global args] start <id>
//! <binary> [global args] kill <id> <signal>
//! <binary> [global args] delete [--force] <id>
//! <binary> [global args] state <id>
//! ```
//!
//! The child gets a null stdin and both output streams piped; they are
//! drained concurrently until exit, so a chatty runtime cannot fill a pipe
//! and stall. Output is logged on every invocation, success or not.

use crate::config::RuntimeConfig;
use crate::constants::DEFAULT_STOP_SIGNAL;
use crate::error::{Error, Result};
use crate::runtime::{
    BackendKind, ContainerInfo, ContainerStatus, CreateOptions, ExecutionResult, RuntimeBackend,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tracing::{debug, info};

/// One runtime invocation: a label for diagnostics plus the subcommand argv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeCommand {
    label: String,
    args: Vec<String>,
}

impl RuntimeCommand {
    /// `create --bundle <path> [flags] <id>`
    pub fn create(id: &str, bundle: &Path, opts: &CreateOptions) -> Self {
        let mut args = vec![
            "create".to_string(),
            "--bundle".to_string(),
            bundle.to_string_lossy().to_string(),
        ];
        if opts.no_pivot {
            args.push("--no-pivot".to_string());
        }
        if opts.no_new_keyring {
            args.push("--no-new-keyring".to_string());
        }
        if !opts.preserve_fds.is_empty() {
            args.push("--preserve-fds".to_string());
            args.push(
                opts.preserve_fds
                    .iter()
                    .map(|fd| fd.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
        args.push(id.to_string());
        Self::new("create", args)
    }

    /// `start <id>`
    pub fn start(id: &str) -> Self {
        Self::new("start", vec!["start".to_string(), id.to_string()])
    }

    /// `kill <id> <signal>`
    pub fn kill(id: &str, signal: &str) -> Self {
        Self::new(
            "kill",
            vec!["kill".to_string(), id.to_string(), signal.to_string()],
        )
    }

    /// `delete [--force] <id>`
    pub fn delete(id: &str, force: bool) -> Self {
        let mut args = vec!["delete".to_string()];
        if force {
            args.push("--force".to_string());
        }
        args.push(id.to_string());
        Self::new("delete", args)
    }

    /// `state <id>`
    pub fn state(id: &str) -> Self {
        Self::new("state", vec!["state".to_string(), id.to_string()])
    }

    fn new(label: &str, args: Vec<String>) -> Self {
        Self {
            label: label.to_string(),
            args,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

/// `state` output (OCI runtime state schema).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OciState {
    id: String,
    status: String,
    #[serde(default)]
    pid: Option<i64>,
    #[serde(default)]
    bundle: Option<String>,
}

/// Backend that shells out to an OCI runtime binary.
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    binary: PathBuf,
    global_args: Vec<String>,
    stop_signal: String,
}

impl ProcessRuntime {
    /// Creates a backend for `binary` with no global arguments.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            global_args: Vec::new(),
            stop_signal: DEFAULT_STOP_SIGNAL.to_string(),
        }
    }

    /// Builds the backend described by `config`.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(&config.runtime_binary)
            .with_global_args(config.runtime_args.clone())
            .with_stop_signal(&config.stop_signal)
    }

    /// Arguments placed before every subcommand.
    pub fn with_global_args(mut self, args: Vec<String>) -> Self {
        self.global_args = args;
        self
    }

    pub fn with_stop_signal(mut self, signal: &str) -> Self {
        self.stop_signal = signal.to_string();
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Full argv (after the binary) for `command`.
    pub fn argv(&self, command: &RuntimeCommand) -> Vec<String> {
        self.global_args
            .iter()
            .chain(command.args.iter())
            .cloned()
            .collect()
    }

    /// Runs `command` to completion and captures its output.
    ///
    /// A nonzero exit is not an error here; see [`ExecutionResult::is_success`].
    pub async fn execute(&self, id: &str, command: &RuntimeCommand) -> Result<ExecutionResult> {
        let argv = self.argv(command);
        debug!("Executing: {} {}", self.binary.display(), argv.join(" "));

        let output = Command::new(&self.binary)
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::RuntimeUnavailable {
                        runtime: self.binary.display().to_string(),
                        reason: e.to_string(),
                    }
                } else {
                    Error::RuntimeExecution {
                        id: id.to_string(),
                        operation: command.label.clone(),
                        exit_code: None,
                        stdout: String::new(),
                        stderr: format!("failed to spawn {}: {}", self.binary.display(), e),
                    }
                }
            })?;

        let result = ExecutionResult {
            exit_code: exit_code(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };

        debug!(
            "{} {} exited with {}",
            command.label, id, result.exit_code
        );
        if !result.stdout.trim().is_empty() {
            debug!("{} {} stdout: {}", command.label, id, result.stdout.trim_end());
        }
        if !result.stderr.trim().is_empty() {
            debug!("{} {} stderr: {}", command.label, id, result.stderr.trim_end());
        }

        Ok(result)
    }

    /// Runs `command` and turns a nonzero exit into [`Error::RuntimeExecution`].
    async fn run(&self, id: &str, command: RuntimeCommand) -> Result<ExecutionResult> {
        let result = self.execute(id, &command).await?;
        if !result.is_success() {
            return Err(Error::RuntimeExecution {
                id: id.to_string(),
                operation: command.label,
                exit_code: Some(result.exit_code),
                stdout: result.stdout,
                stderr: result.stderr,
            });
        }
        Ok(result)
    }

    async fn query_state(&self, id: &str) -> Result<OciState> {
        let result = self.run(id, RuntimeCommand::state(id)).await?;
        let state: OciState =
            serde_json::from_str(&result.stdout).map_err(|e| Error::BackendProtocol {
                backend: self.name().to_string(),
                reason: format!("invalid state output: {}", e),
            })?;
        if state.id != id {
            return Err(Error::BackendProtocol {
                backend: self.name().to_string(),
                reason: format!("state for '{}' returned container '{}'", id, state.id),
            });
        }
        Ok(state)
    }

    fn map_status(&self, status: &str) -> Result<ContainerStatus> {
        match status {
            // A paused container still holds its processes.
            "paused" => Ok(ContainerStatus::Running),
            other => ContainerStatus::parse(other).ok_or_else(|| Error::BackendProtocol {
                backend: self.name().to_string(),
                reason: format!("unknown container status '{}'", other),
            }),
        }
    }
}

/// Exit code of a finished child; death by signal `n` maps to `128 + n`.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[async_trait]
impl RuntimeBackend for ProcessRuntime {
    fn name(&self) -> &str {
        "subprocess"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Subprocess
    }

    async fn create_container(
        &self,
        id: &str,
        bundle: &Path,
        opts: &CreateOptions,
    ) -> Result<Option<u64>> {
        self.run(id, RuntimeCommand::create(id, bundle, opts))
            .await?;
        info!("Created container {} with {}", id, self.binary.display());
        // PIDs are picked up from `state` once the container runs.
        Ok(None)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.run(id, RuntimeCommand::start(id)).await?;
        info!("Started container {}", id);
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.run(id, RuntimeCommand::kill(id, &self.stop_signal))
            .await?;
        info!("Sent {} to container {}", self.stop_signal, id);
        Ok(())
    }

    async fn delete_container(&self, id: &str, force: bool) -> Result<()> {
        self.run(id, RuntimeCommand::delete(id, force)).await?;
        info!("Deleted container {}", id);
        Ok(())
    }

    async fn get_container_state(&self, id: &str) -> Result<ContainerStatus> {
        let state = self.query_state(id).await?;
        self.map_status(&state.status)
    }

    async fn get_container_info(&self, id: &str) -> Result<ContainerInfo> {
        let state = self.query_state(id).await?;
        Ok(ContainerInfo {
            id: state.id,
            status: self.map_status(&state.status)?,
            numeric_id: state.pid.filter(|p| *p > 0).map(|p| p as u64),
            bundle: state.bundle.map(PathBuf::from),
        })
    }
}
