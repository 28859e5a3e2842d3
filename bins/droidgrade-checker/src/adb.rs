//! Device control through the adb command-line tool.
//!
//! The pipeline only ever sees the `DeviceControl` trait and the typed
//! `AdbError` taxonomy; in particular a device dropping off the bus surfaces
//! as `AdbError::DeviceOffline`, which the pipeline treats as retryable
//! rather than as a grading failure.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::watch;

use crate::cancel::cancelled;
use crate::proc::{merge_output, read_pipe};

#[derive(Debug, Error)]
pub enum AdbError {
    #[error("adb executable not found (set ADB_PATH or ANDROID_SDK_ROOT)")]
    NotFound,
    #[error("device {0} went offline")]
    DeviceOffline(String),
    #[error("remote command cancelled")]
    Cancelled,
    #[error("adb i/o failure: {0}")]
    Io(String),
    #[error("adb exited with code {status}: {output}")]
    CommandFailed { status: i32, output: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub serial: String,
    pub state: DeviceState,
}

impl Device {
    pub fn is_online(&self) -> bool {
        self.state == DeviceState::Online
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Online,
    Offline,
    Unauthorized,
    Unknown,
}

impl DeviceState {
    fn from_adb(state: &str) -> Self {
        match state {
            "device" => DeviceState::Online,
            "offline" => DeviceState::Offline,
            "unauthorized" => DeviceState::Unauthorized,
            _ => DeviceState::Unknown,
        }
    }
}

/// External device-control collaborator contract.
#[async_trait]
pub trait DeviceControl: Send + Sync {
    async fn devices(&self) -> Result<Vec<Device>, AdbError>;
    async fn install_package(&self, serial: &str, apk: &Path) -> Result<(), AdbError>;
    async fn uninstall_package(&self, serial: &str, package: &str) -> Result<(), AdbError>;
    /// Run a shell command on the device and capture its combined
    /// stdout/stderr output.
    async fn run_remote_command(
        &self,
        serial: &str,
        command: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<String, AdbError>;
}

pub struct AdbClient {
    adb: PathBuf,
}

impl AdbClient {
    pub fn new(adb: PathBuf) -> Self {
        Self { adb }
    }

    async fn output(&self, args: &[&str]) -> Result<std::process::Output, AdbError> {
        Command::new(&self.adb)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    AdbError::NotFound
                } else {
                    AdbError::Io(e.to_string())
                }
            })
    }

    async fn checked_output(&self, serial: &str, args: &[&str]) -> Result<String, AdbError> {
        let output = self.output(args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if output.status.success() {
            return Ok(merge_output(&stdout, &stderr));
        }
        Err(classify_failure(
            serial,
            output.status.code().unwrap_or(-1),
            &stdout,
            &stderr,
        ))
    }
}

#[async_trait]
impl DeviceControl for AdbClient {
    async fn devices(&self) -> Result<Vec<Device>, AdbError> {
        let output = self.output(&["devices", "-l"]).await?;
        if !output.status.success() {
            return Err(AdbError::CommandFailed {
                status: output.status.code().unwrap_or(-1),
                output: merge_output(
                    &String::from_utf8_lossy(&output.stdout),
                    &String::from_utf8_lossy(&output.stderr),
                ),
            });
        }
        Ok(parse_devices(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn install_package(&self, serial: &str, apk: &Path) -> Result<(), AdbError> {
        let apk_arg = apk.display().to_string();
        let output = self
            .checked_output(serial, &["-s", serial, "install", &apk_arg])
            .await?;
        // Older adb versions report install failures on a zero exit code.
        if output.contains("Failure") {
            return Err(AdbError::CommandFailed { status: 0, output });
        }
        Ok(())
    }

    async fn uninstall_package(&self, serial: &str, package: &str) -> Result<(), AdbError> {
        self.checked_output(serial, &["-s", serial, "uninstall", package])
            .await?;
        Ok(())
    }

    async fn run_remote_command(
        &self,
        serial: &str,
        command: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<String, AdbError> {
        let mut child = Command::new(&self.adb)
            .args(["-s", serial, "shell", command])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    AdbError::NotFound
                } else {
                    AdbError::Io(e.to_string())
                }
            })?;

        // Drain both pipes off-task so a chatty instrumentation run cannot
        // dead-lock against a full pipe while we wait on the child.
        let stdout_task = tokio::spawn(read_pipe(child.stdout.take()));
        let stderr_task = tokio::spawn(read_pipe(child.stderr.take()));

        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancelled(cancel) => None,
        };

        let Some(status) = status else {
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            return Err(AdbError::Cancelled);
        };
        let status = status.map_err(|e| AdbError::Io(e.to_string()))?;

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let combined = merge_output(&stdout, &stderr);

        if !status.success() && is_offline_output(&combined) {
            return Err(AdbError::DeviceOffline(serial.to_string()));
        }
        // A non-zero runner exit still produced a transcript; whatever error
        // text it printed stays in the combined output for the parser.
        Ok(combined)
    }
}

fn classify_failure(serial: &str, status: i32, stdout: &str, stderr: &str) -> AdbError {
    let combined = merge_output(stdout, stderr);
    if is_offline_output(&combined) {
        return AdbError::DeviceOffline(serial.to_string());
    }
    AdbError::CommandFailed {
        status,
        output: combined,
    }
}

fn is_offline_output(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("device offline")
        || lower.contains("device is offline")
        || lower.contains("not found")
}

fn parse_devices(output: &str) -> Vec<Device> {
    let mut devices = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("List of devices attached") || line.starts_with('*')
        {
            continue;
        }

        let mut parts = line.split_whitespace();
        let (Some(serial), Some(state)) = (parts.next(), parts.next()) else {
            continue;
        };

        devices.push(Device {
            serial: serial.to_string(),
            state: DeviceState::from_adb(state),
        });
    }

    devices
}
