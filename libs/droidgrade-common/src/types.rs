use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

/// One submission check request, produced by the scheduler and consumed by
/// exactly one checker worker per delivery attempt. Retries redeliver the
/// same request verbatim, so everything here must stay immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    pub submission_id: Uuid,
    /// Heterogeneous scalar parameters, e.g. `android_package_name`.
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    /// Logical file name ("submission", "template") to content hash,
    /// resolvable through the controller's file cache.
    #[serde(default)]
    pub files: HashMap<String, String>,
}

impl CheckRequest {
    pub fn string_parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).and_then(|value| value.as_str())
    }
}

/// A named processing stage plus a stage-specific payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingStatus {
    pub stage: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ProcessingStatus {
    pub fn stage(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            payload: serde_json::Value::Null,
        }
    }
}

/// Versioned status publication for one submission.
///
/// Versions are strictly increasing per submission attempt. The transport
/// may reorder or duplicate deliveries, so consumers must drop any event
/// with `version <=` the highest version already applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub submission_id: Uuid,
    pub version: u32,
    pub status: ProcessingStatus,
    pub occurred_at: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(submission_id: Uuid, version: u32, status: ProcessingStatus) -> Self {
        Self {
            submission_id,
            version,
            status,
            occurred_at: Utc::now(),
        }
    }
}

/// Terminal outcome event for one submission. Result delivery is
/// at-least-once; the payload is idempotent-safe (last write wins).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEvent {
    pub submission_id: Uuid,
    pub result: CheckResult,
    pub occurred_at: DateTime<Utc>,
}

impl ResultEvent {
    pub fn new(submission_id: Uuid, result: CheckResult) -> Self {
        Self {
            submission_id,
            result,
            occurred_at: Utc::now(),
        }
    }
}

/// Terminal outcome for one submission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CheckResult {
    ValidationError {
        validation_error: String,
    },
    CompilationError {
        compilation_error: String,
    },
    Success {
        grade: i32,
        total_grade: i32,
        test_results: Vec<TestOutcome>,
    },
}

impl CheckResult {
    pub fn validation_error(message: impl Into<String>) -> Self {
        CheckResult::ValidationError {
            validation_error: message.into(),
        }
    }

    pub fn compilation_error(log: impl Into<String>) -> Self {
        CheckResult::CompilationError {
            compilation_error: log.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CheckResult::ValidationError { .. } => "validation_error",
            CheckResult::CompilationError { .. } => "compilation_error",
            CheckResult::Success { .. } => "success",
        }
    }
}

/// One instrumentation test's outcome as reported by the on-device runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub class: String,
    pub test: String,
    pub stream: String,
    pub result_code: InstrumentationCode,
}

/// Numeric status codes of the Android instrumentation protocol.
///
/// These values are fixed by the external test runner and serialized as the
/// raw integer; they are a wire-compatibility surface, not an internal
/// choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentationCode {
    Start,
    Success,
    Error,
    Failure,
    Ignored,
}

impl InstrumentationCode {
    pub fn code(self) -> i32 {
        match self {
            InstrumentationCode::Start => 1,
            InstrumentationCode::Success => 0,
            InstrumentationCode::Error => -1,
            InstrumentationCode::Failure => -2,
            InstrumentationCode::Ignored => -3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(InstrumentationCode::Start),
            0 => Some(InstrumentationCode::Success),
            -1 => Some(InstrumentationCode::Error),
            -2 => Some(InstrumentationCode::Failure),
            -3 => Some(InstrumentationCode::Ignored),
            _ => None,
        }
    }
}

impl fmt::Display for InstrumentationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl Serialize for InstrumentationCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.code())
    }
}

impl<'de> Deserialize<'de> for InstrumentationCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = i32::deserialize(deserializer)?;
        InstrumentationCode::from_code(code)
            .ok_or_else(|| de::Error::custom(format!("unknown instrumentation code: {code}")))
    }
}
