// Worker configuration, resolved from the environment at boot.
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};

#[derive(Debug, Clone)]
pub struct CheckerConfig {
    pub redis_url: String,
    /// Base URL of the controller hosting the content-addressed file cache.
    pub controller_url: String,
    pub android_sdk_root: Option<String>,
    pub adb_path: PathBuf,
    /// Checker system name; keys the request queue this worker consumes.
    pub checker_name: String,
    /// Upper bound on submissions processed concurrently by this worker.
    pub max_parallel_checks: usize,
    /// Delay before a failed submission is redelivered.
    pub retry_delay: Duration,
}

impl CheckerConfig {
    pub fn from_env() -> Result<Self> {
        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let controller_url =
            env::var("CONTROLLER_URL").unwrap_or_else(|_| "http://127.0.0.1:5000".to_string());
        let android_sdk_root = env::var("ANDROID_SDK_ROOT").ok();
        let adb_path = resolve_adb_path(android_sdk_root.as_deref());
        let checker_name =
            env::var("CHECKER_SYSTEM_NAME").unwrap_or_else(|_| "android".to_string());

        let max_parallel_checks = env::var("MAX_PARALLEL_CHECKS")
            .ok()
            .map(|value| value.parse::<usize>())
            .transpose()
            .map_err(|e| anyhow::anyhow!("invalid MAX_PARALLEL_CHECKS: {e}"))?
            .unwrap_or(3);
        if max_parallel_checks == 0 {
            bail!("MAX_PARALLEL_CHECKS must be at least 1");
        }

        let retry_delay_seconds = env::var("RETRY_DELAY_SECONDS")
            .ok()
            .map(|value| value.parse::<u64>())
            .transpose()
            .map_err(|e| anyhow::anyhow!("invalid RETRY_DELAY_SECONDS: {e}"))?
            .unwrap_or(60);

        Ok(Self {
            redis_url,
            controller_url,
            android_sdk_root,
            adb_path,
            checker_name,
            max_parallel_checks,
            retry_delay: Duration::from_secs(retry_delay_seconds),
        })
    }
}

fn resolve_adb_path(sdk_root: Option<&str>) -> PathBuf {
    if let Ok(path) = env::var("ADB_PATH") {
        return PathBuf::from(path);
    }
    if let Some(root) = sdk_root {
        let candidate = Path::new(root).join("platform-tools").join("adb");
        if candidate.exists() {
            return candidate;
        }
    }
    PathBuf::from("adb")
}
