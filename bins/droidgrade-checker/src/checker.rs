//! The submission pipeline: extract, validate, build, install, test, report.

use std::path::Path;
use std::sync::Arc;

use droidgrade_common::bus::EventBus;
use droidgrade_common::locks::LockProvider;
use droidgrade_common::types::{CheckRequest, CheckResult, ProcessingStatus, StatusEvent};
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::adb::{AdbError, DeviceControl};
use crate::archive;
use crate::devices::{DeviceRegistry, DeviceReservations, ReservedDevice};
use crate::error::CheckError;
use crate::files::{FileStore, FileStoreError};
use crate::gradle::GradleRunner;
use crate::instrument::parse_transcript;
use crate::workspace::BuildWorkspace;

const PACKAGE_NAME_PARAMETER: &str = "android_package_name";

const DEBUG_APK: &str = "app/build/outputs/apk/debug/app-debug.apk";
const ANDROID_TEST_APK: &str = "app/build/outputs/apk/androidTest/debug/app-debug-androidTest.apk";

/// Publishes versioned status events for one submission attempt.
///
/// The version counter lives and dies with the attempt: a retried
/// submission starts a fresh attempt with its own counter, and consumers
/// enforce the discard-stale-versions rule themselves.
pub struct StatusSetter {
    bus: Arc<dyn EventBus>,
    submission_id: Uuid,
    version: u32,
}

impl StatusSetter {
    pub fn new(bus: Arc<dyn EventBus>, submission_id: Uuid) -> Self {
        Self {
            bus,
            submission_id,
            version: 0,
        }
    }

    pub async fn set_status(&mut self, status: ProcessingStatus) -> Result<(), CheckError> {
        self.version += 1;
        let event = StatusEvent::new(self.submission_id, self.version, status);
        self.bus.publish_status(&event).await?;
        Ok(())
    }
}

pub struct AndroidChecker {
    control: Arc<dyn DeviceControl>,
    files: Arc<dyn FileStore>,
    reservations: DeviceReservations,
    gradle: GradleRunner,
    bus: Arc<dyn EventBus>,
}

impl AndroidChecker {
    pub fn new(
        control: Arc<dyn DeviceControl>,
        files: Arc<dyn FileStore>,
        locks: Arc<dyn LockProvider>,
        bus: Arc<dyn EventBus>,
        android_sdk_root: Option<String>,
    ) -> Self {
        let registry = DeviceRegistry::new(control.clone());
        Self {
            control,
            files,
            reservations: DeviceReservations::new(registry, locks.clone()),
            gradle: GradleRunner::new(locks, android_sdk_root),
            bus,
        }
    }

    /// Run one submission through the full pipeline.
    ///
    /// `Ok` carries a terminal result (including validation and compilation
    /// failures, which the student sees); `Err` means this attempt should
    /// be rescheduled and no result published.
    pub async fn check_submission(
        &self,
        request: &CheckRequest,
        cancel: watch::Receiver<bool>,
    ) -> Result<CheckResult, CheckError> {
        let mut status = StatusSetter::new(self.bus.clone(), request.submission_id);

        status
            .set_status(ProcessingStatus::stage("checking_started"))
            .await?;

        let workspace = BuildWorkspace::create().map_err(|e| CheckError::Infra(e.into()))?;
        info!(directory = %workspace.path().display(), "generated temporary directory");

        status
            .set_status(ProcessingStatus::stage("unzip_files"))
            .await?;

        for file_name in ["submission", "template"] {
            if let Some(result) = self
                .extract_archive(request, file_name, workspace.path())
                .await?
            {
                return Ok(result);
            }
        }

        if !GradleRunner::gradlew_installed(workspace.path()) {
            return Ok(CheckResult::validation_error(
                "Can't find Gradlew launcher. Please, check template and submission files.",
            ));
        }

        status
            .set_status(ProcessingStatus::stage("validate_submission"))
            .await?;

        let projects = self
            .gradle
            .execute_task(workspace.path(), "projects", cancel.clone())
            .await?;
        if !projects.is_successful() {
            return Ok(CheckResult::validation_error(format!(
                "Can't get project list of submission:\n\nStdErr:\n{}\n\nStdOut:\n{}",
                projects.stderr, projects.stdout
            )));
        }
        if projects
            .stdout
            .lines()
            .filter(|line| line.contains("Project '"))
            .count()
            > 1
        {
            return Ok(CheckResult::validation_error(
                "Submission must have only one project.",
            ));
        }
        if !projects.stdout.contains("Project ':app'") {
            return Ok(CheckResult::validation_error(
                "Submission must have project with the name 'app'.",
            ));
        }

        status
            .set_status(ProcessingStatus::stage("gradle_build"))
            .await?;

        for task in ["assembleDebug", "assembleDebugAndroidTest"] {
            let build = self
                .gradle
                .execute_task(workspace.path(), task, cancel.clone())
                .await?;
            if !build.is_successful() {
                return Ok(CheckResult::compilation_error(build.combined_log()));
            }
        }

        status
            .set_status(ProcessingStatus::stage("install_application"))
            .await?;

        let Some(package) = request.string_parameter(PACKAGE_NAME_PARAMETER) else {
            return Ok(CheckResult::validation_error(format!(
                "Missing required parameter '{PACKAGE_NAME_PARAMETER}'."
            )));
        };

        let reserved = self.reservations.reserve(cancel.clone()).await?;
        let run = self
            .install_and_test(&reserved, workspace.path(), package, &mut status, cancel)
            .await;
        // The lease goes back on both paths; a device-offline failure then
        // surfaces to the worker loop, which reschedules the submission.
        reserved.release().await;
        let transcript = run?;

        Ok(parse_transcript(&transcript))
    }

    async fn extract_archive(
        &self,
        request: &CheckRequest,
        file_name: &str,
        dest: &Path,
    ) -> Result<Option<CheckResult>, CheckError> {
        let Some(hash) = request.files.get(file_name) else {
            return Ok(Some(CheckResult::validation_error(format!(
                "Internal check error: can't find files for {file_name}."
            ))));
        };

        let bytes = match self.files.fetch(hash).await {
            Ok(bytes) => bytes,
            Err(FileStoreError::NotFound(_)) => {
                error!(file_name, "can't find files for submission");
                return Ok(Some(CheckResult::validation_error(format!(
                    "Internal check error: can't find files for {file_name}."
                ))));
            }
            Err(FileStoreError::Transport(err)) => return Err(CheckError::Infra(err)),
        };

        if let Err(err) = archive::extract_normalized(&bytes, dest) {
            if err.is_validation() {
                error!(file_name, error = %err, "cannot extract submitted file");
                return Ok(Some(CheckResult::validation_error(format!(
                    "Cannot extract submitted {file_name} file."
                ))));
            }
            return Err(CheckError::Infra(err.into()));
        }

        info!(file_name, "extracted submitted archive");
        Ok(None)
    }

    async fn install_and_test(
        &self,
        device: &ReservedDevice,
        workspace: &Path,
        package: &str,
        status: &mut StatusSetter,
        cancel: watch::Receiver<bool>,
    ) -> Result<String, CheckError> {
        let serial = device.serial();

        if let Err(err) = self.control.uninstall_package(serial, package).await {
            match err {
                AdbError::DeviceOffline(_) | AdbError::Cancelled => return Err(err.into()),
                err => warn!(serial, error = %err, "can't uninstall package"),
            }
        }

        self.control
            .install_package(serial, &workspace.join(DEBUG_APK))
            .await?;
        info!(serial, "installed debug application");

        self.control
            .install_package(serial, &workspace.join(ANDROID_TEST_APK))
            .await?;
        info!(serial, "installed androidTest application");

        status.set_status(ProcessingStatus::stage("test")).await?;

        info!(serial, "started instrumentation run");
        let transcript = self
            .control
            .run_remote_command(serial, &format!("am instrument -r -w {package}"), cancel)
            .await?;
        info!(serial, "completed instrumentation run");

        Ok(transcript)
    }
}
