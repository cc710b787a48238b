//! Per-target build results.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use dsr_core::router::BuildMethod;
use dsr_core::target::Target;

/// Terminal status of a single target build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Success,
    Failed,
    Timeout,
    /// The target could not even be attempted (e.g. host unreachable).
    /// Skipped targets still appear in the manifest with a reason.
    Skipped,
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BuildStatus::Success => "success",
            BuildStatus::Failed => "failed",
            BuildStatus::Timeout => "timeout",
            BuildStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// The outcome of one target build. Created at dispatch, frozen once
/// the status is terminal; the executor owns it exclusively during
/// execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildResult {
    /// Run this result belongs to.
    pub run_id: String,

    pub target: Target,
    pub host: String,
    pub method: BuildMethod,
    pub status: BuildStatus,

    /// Exit code of the build command, when one ran.
    pub exit_code: Option<i32>,

    pub duration_seconds: f64,

    /// Flat per-run artifact directory, when artifacts were collected.
    pub artifact_dir: Option<PathBuf>,
    pub artifact_count: usize,

    /// Durable log capture for this target.
    pub log_file: Option<PathBuf>,

    /// Why the target failed or was skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BuildResult {
    /// A result shell at dispatch time; terminal fields filled later.
    pub fn dispatched(
        run_id: &str,
        target: Target,
        host: &str,
        method: BuildMethod,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            target,
            host: host.to_string(),
            method,
            status: BuildStatus::Skipped,
            exit_code: None,
            duration_seconds: 0.0,
            artifact_dir: None,
            artifact_count: 0,
            log_file: None,
            reason: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, BuildStatus::Success)
    }

    /// Freeze this result as skipped with a reason.
    pub fn skipped(mut self, reason: impl Into<String>) -> Self {
        self.status = BuildStatus::Skipped;
        self.reason = Some(reason.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&BuildStatus::Timeout).unwrap(),
            "\"timeout\""
        );
        assert_eq!(BuildStatus::Skipped.to_string(), "skipped");
    }

    #[test]
    fn test_result_json_shape() {
        let mut result = BuildResult::dispatched(
            "run-1",
            "linux/amd64".parse().unwrap(),
            "trj",
            BuildMethod::Act,
        );
        result.status = BuildStatus::Success;
        result.exit_code = Some(0);
        result.duration_seconds = 12.5;
        result.artifact_count = 2;

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["run_id"], "run-1");
        assert_eq!(json["target"], "linux/amd64");
        assert_eq!(json["status"], "success");
        assert_eq!(json["exit_code"], 0);
        assert_eq!(json["artifact_count"], 2);
        // reason is omitted when absent
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn test_skipped_carries_reason() {
        let result = BuildResult::dispatched(
            "run-1",
            "darwin/arm64".parse().unwrap(),
            "mmini",
            BuildMethod::Native,
        )
        .skipped("host unreachable");
        assert_eq!(result.status, BuildStatus::Skipped);
        assert_eq!(result.reason.as_deref(), Some("host unreachable"));
        assert!(!result.is_success());
    }
}
