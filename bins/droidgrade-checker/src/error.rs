use droidgrade_common::bus::BusError;
use droidgrade_common::locks::LockError;
use thiserror::Error;

use crate::adb::AdbError;

/// Failure taxonomy of one check attempt.
///
/// Validation and compilation failures are *results*, not errors - they are
/// reported to the student and never retried. Everything that reaches this
/// enum reschedules the submission: the worker fails open toward retry
/// rather than dropping a submission on an unclassified fault.
#[derive(Debug, Error)]
pub enum CheckError {
    /// The reserved device dropped off the bus mid-check. Distinguished so
    /// the pipeline releases the reservation and requeues instead of
    /// reporting a grading failure.
    #[error("device went offline during check")]
    DeviceOffline,
    #[error("check cancelled")]
    Cancelled,
    #[error(transparent)]
    Infra(#[from] anyhow::Error),
}

impl From<AdbError> for CheckError {
    fn from(err: AdbError) -> Self {
        match err {
            AdbError::DeviceOffline(_) => CheckError::DeviceOffline,
            AdbError::Cancelled => CheckError::Cancelled,
            other => CheckError::Infra(other.into()),
        }
    }
}

impl From<LockError> for CheckError {
    fn from(err: LockError) -> Self {
        CheckError::Infra(err.into())
    }
}

impl From<BusError> for CheckError {
    fn from(err: BusError) -> Self {
        CheckError::Infra(err.into())
    }
}
