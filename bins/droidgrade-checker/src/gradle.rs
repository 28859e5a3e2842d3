//! Gradle invocation behind the global build permit.

use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use droidgrade_common::locks::{Lease, LockProvider};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cancel::{cancelled, is_cancelled};
use crate::error::CheckError;
use crate::proc::read_pipe;

pub const BUILD_LOCK_NAME: &str = "gradle";
const ACQUIRE_SLICE: Duration = Duration::from_secs(1);

#[cfg(windows)]
const GRADLEW: &str = "gradlew.bat";
#[cfg(not(windows))]
const GRADLEW: &str = "gradlew";

#[derive(Debug, Clone)]
pub struct GradleTaskResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GradleTaskResult {
    pub fn is_successful(&self) -> bool {
        self.exit_code == 0
    }

    /// Combined build log as reported to students on failure.
    pub fn combined_log(&self) -> String {
        format!("{}\n\n{}", self.stdout, self.stderr)
            .trim()
            .to_string()
    }
}

/// The single system-wide exclusive permit gating build-tool invocation.
///
/// Gradle's daemon and cache state under one working root are not safe for
/// concurrent invocation, including from sibling worker processes, so the
/// permit rides the shared lock provider instead of a process-local mutex.
pub struct BuildGate {
    locks: Arc<dyn LockProvider>,
}

impl BuildGate {
    pub fn new(locks: Arc<dyn LockProvider>) -> Self {
        Self { locks }
    }

    async fn acquire(&self, cancel: &watch::Receiver<bool>) -> Result<Box<dyn Lease>, CheckError> {
        let mut contended = false;
        loop {
            if is_cancelled(cancel) {
                return Err(CheckError::Cancelled);
            }
            match self.locks.try_acquire(BUILD_LOCK_NAME, ACQUIRE_SLICE).await? {
                Some(lease) => {
                    if contended {
                        debug!("build permit acquired after contention");
                    }
                    return Ok(lease);
                }
                None => {
                    if !contended {
                        debug!("waiting for build permit");
                        contended = true;
                    }
                }
            }
        }
    }

    /// Run `action` while holding the build permit.
    ///
    /// The permit is released on every exit path; if the returned future is
    /// dropped mid-flight, the lease's drop hook frees it instead.
    pub async fn run_exclusive<T, Fut>(
        &self,
        cancel: watch::Receiver<bool>,
        action: impl FnOnce() -> Fut,
    ) -> Result<T, CheckError>
    where
        Fut: Future<Output = Result<T, CheckError>>,
    {
        let lease = self.acquire(&cancel).await?;
        let result = action().await;
        if let Err(err) = lease.release().await {
            warn!(error = %err, "failed to release build permit");
        }
        result
    }
}

pub struct GradleRunner {
    gate: BuildGate,
    android_sdk_root: Option<String>,
}

impl GradleRunner {
    pub fn new(locks: Arc<dyn LockProvider>, android_sdk_root: Option<String>) -> Self {
        Self {
            gate: BuildGate::new(locks),
            android_sdk_root,
        }
    }

    pub fn gradlew_installed(project_dir: &Path) -> bool {
        project_dir.join(GRADLEW).is_file()
    }

    pub async fn execute_task(
        &self,
        project_dir: &Path,
        task: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<GradleTaskResult, CheckError> {
        let run_cancel = cancel.clone();
        self.gate
            .run_exclusive(cancel, || self.run_gradlew(project_dir, task, run_cancel))
            .await
    }

    async fn run_gradlew(
        &self,
        project_dir: &Path,
        task: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<GradleTaskResult, CheckError> {
        ensure_gradlew_executable(project_dir);

        info!(task, directory = %project_dir.display(), "started gradle task");

        let mut command = Command::new(project_dir.join(GRADLEW));
        command
            .arg(task)
            .current_dir(project_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(root) = &self.android_sdk_root {
            command.env("ANDROID_SDK_ROOT", root);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn gradle task {task}"))?;

        let stdout_task = tokio::spawn(read_pipe(child.stdout.take()));
        let stderr_task = tokio::spawn(read_pipe(child.stderr.take()));

        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancelled(cancel) => None,
        };

        let Some(status) = status else {
            warn!(task, "gradle task cancelled; killing child");
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            return Err(CheckError::Cancelled);
        };
        let status = status
            .with_context(|| format!("failed to wait for gradle task {task}"))?;

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let exit_code = status.code().unwrap_or(-1);

        info!(task, exit_code, "completed gradle task");

        Ok(GradleTaskResult {
            exit_code,
            stdout,
            stderr,
        })
    }
}

#[cfg(unix)]
fn ensure_gradlew_executable(project_dir: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let path = project_dir.join(GRADLEW);
    match std::fs::metadata(&path) {
        Ok(metadata) => {
            let mut permissions = metadata.permissions();
            permissions.set_mode(permissions.mode() | 0o755);
            if let Err(err) = std::fs::set_permissions(&path, permissions) {
                warn!(error = %err, "can't set gradlew execution rights");
            }
        }
        Err(err) => warn!(error = %err, "can't check gradlew execution rights"),
    }
}

#[cfg(not(unix))]
fn ensure_gradlew_executable(_project_dir: &Path) {}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use droidgrade_common::locks::MemoryLockProvider;

    use super::*;

    #[tokio::test]
    async fn build_permit_never_has_more_than_one_holder() {
        let gate = Arc::new(BuildGate::new(Arc::new(MemoryLockProvider::new())));
        let (_tx, cancel) = watch::channel(false);

        let held = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let cancel = cancel.clone();
            let held = held.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                gate.run_exclusive(cancel, || {
                    let held = held.clone();
                    let peak = peak.clone();
                    async move {
                        let now = held.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        held.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, CheckError>(())
                    }
                })
                .await
                .unwrap();
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn permit_is_released_when_the_action_fails() {
        let gate = BuildGate::new(Arc::new(MemoryLockProvider::new()));
        let (_tx, cancel) = watch::channel(false);

        let failed: Result<(), CheckError> = gate
            .run_exclusive(cancel.clone(), || async {
                Err(CheckError::Infra(anyhow::anyhow!("boom")))
            })
            .await;
        assert!(failed.is_err());

        let ok = gate
            .run_exclusive(cancel, || async { Ok::<_, CheckError>(42) })
            .await
            .unwrap();
        assert_eq!(ok, 42);
    }

    #[tokio::test]
    async fn acquire_respects_cancellation() {
        let locks = Arc::new(MemoryLockProvider::new());
        let blocker = locks
            .try_acquire(BUILD_LOCK_NAME, Duration::ZERO)
            .await
            .unwrap()
            .expect("acquire");

        let gate = BuildGate::new(locks.clone());
        let (tx, cancel) = watch::channel(false);

        let waiter = tokio::spawn(async move {
            gate.run_exclusive(cancel, || async { Ok::<_, CheckError>(()) })
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(CheckError::Cancelled)));
        drop(blocker);
    }
}
