//! CI workflow analysis.
//!
//! Reads a GitHub Actions workflow definition and classifies each job's
//! runner as container-compatible (runnable under the local act/Docker
//! runtime) or native-required. Only `jobs.<id>.runs-on` is interpreted;
//! the rest of the workflow is opaque to dsr.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{DsrError, Result};

/// Classification of a `runs-on` runner label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerClass {
    /// Linux-family runner; the job can execute inside the local
    /// container runtime.
    Compatible,
    /// macOS or Windows runner; the job needs a native host.
    NativeRequired,
    /// Unrecognized label. Never silently assumed compatible; the
    /// caller decides whether to accept it (see `Workflow::require_act_job`).
    Unknown,
}

/// Classify a `runs-on` label.
pub fn classify(runs_on: &str) -> RunnerClass {
    let label = runs_on.trim().to_ascii_lowercase();
    if label.starts_with("ubuntu-") {
        return RunnerClass::Compatible;
    }
    if label.starts_with("self-hosted") && label.contains("linux") {
        return RunnerClass::Compatible;
    }
    if label.starts_with("macos-") {
        return RunnerClass::NativeRequired;
    }
    if label.starts_with("windows-") {
        return RunnerClass::NativeRequired;
    }
    RunnerClass::Unknown
}

/// Summary of a workflow's jobs by runner family.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowAnalysis {
    pub linux_jobs: Vec<String>,
    pub macos_jobs: Vec<String>,
    pub windows_jobs: Vec<String>,
    /// Jobs whose runner label is unrecognized.
    pub other_jobs: Vec<String>,
    pub act_compatible_count: usize,
    pub native_required_count: usize,
}

/// A parsed workflow file.
#[derive(Debug, Clone)]
pub struct Workflow {
    jobs: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawWorkflow {
    #[serde(default)]
    jobs: BTreeMap<String, RawJob>,
}

#[derive(Debug, Deserialize)]
struct RawJob {
    #[serde(rename = "runs-on", default)]
    runs_on: Option<serde_yaml::Value>,
}

/// A `runs-on` value may be a single label or a label list; list form
/// flattens to a space-joined label string so `[self-hosted, linux]`
/// still reads as a Linux runner.
fn flatten_labels(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Sequence(seq) => {
            let labels: Vec<&str> = seq.iter().filter_map(|v| v.as_str()).collect();
            if labels.is_empty() {
                None
            } else {
                Some(labels.join(" "))
            }
        }
        _ => None,
    }
}

impl Workflow {
    /// Parse a workflow file. Fails with `InvalidArgs` if the file does
    /// not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DsrError::InvalidArgs(format!(
                "workflow file not found: {}",
                path.display()
            )));
        }
        let text = std::fs::read_to_string(path)?;
        let raw: RawWorkflow = serde_yaml::from_str(&text)?;
        let mut jobs = BTreeMap::new();
        for (id, job) in raw.jobs {
            let runs_on = job
                .runs_on
                .as_ref()
                .and_then(flatten_labels)
                .unwrap_or_default();
            jobs.insert(id, runs_on);
        }
        Ok(Self { jobs })
    }

    /// All job ids, in stable order.
    pub fn list_jobs(&self) -> Vec<String> {
        self.jobs.keys().cloned().collect()
    }

    /// The `runs-on` label of one job.
    pub fn runner(&self, job_id: &str) -> Result<&str> {
        self.jobs
            .get(job_id)
            .map(String::as_str)
            .ok_or_else(|| DsrError::InvalidArgs(format!("no such job: {job_id}")))
    }

    /// Verify that `job_id` exists and can run under the container
    /// runtime.
    ///
    /// Unknown runner labels are a hard `ConfigError` unless
    /// `allow_unknown` is set, in which case they are accepted with a
    /// warning.
    pub fn require_act_job(&self, job_id: &str, allow_unknown: bool) -> Result<()> {
        let runs_on = self.runner(job_id)?;
        match classify(runs_on) {
            RunnerClass::Compatible => Ok(()),
            RunnerClass::NativeRequired => Err(DsrError::Config(format!(
                "job {job_id} runs on {runs_on}, which cannot run in a container"
            ))),
            RunnerClass::Unknown if allow_unknown => {
                warn!(job = %job_id, runs_on = %runs_on, "unrecognized runner label, assuming container-compatible");
                Ok(())
            }
            RunnerClass::Unknown => Err(DsrError::Config(format!(
                "job {job_id} has unrecognized runner {runs_on:?}; pass --allow-unknown-runners to proceed"
            ))),
        }
    }

    /// Classify every job by runner family.
    pub fn analyze(&self) -> WorkflowAnalysis {
        let mut analysis = WorkflowAnalysis::default();
        for (id, runs_on) in &self.jobs {
            let label = runs_on.to_ascii_lowercase();
            match classify(runs_on) {
                RunnerClass::Compatible => {
                    analysis.linux_jobs.push(id.clone());
                    analysis.act_compatible_count += 1;
                }
                RunnerClass::NativeRequired if label.starts_with("macos-") => {
                    analysis.macos_jobs.push(id.clone());
                    analysis.native_required_count += 1;
                }
                RunnerClass::NativeRequired => {
                    analysis.windows_jobs.push(id.clone());
                    analysis.native_required_count += 1;
                }
                RunnerClass::Unknown => {
                    analysis.other_jobs.push(id.clone());
                }
            }
        }
        analysis
    }
}

/// Convenience wrapper: load and analyze in one step.
pub fn analyze(path: &Path) -> Result<WorkflowAnalysis> {
    Ok(Workflow::load(path)?.analyze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    const WORKFLOW_YAML: &str = r#"
name: release
on: push
jobs:
  build-linux:
    runs-on: ubuntu-latest
    steps: []
  build-linux-arm:
    runs-on: [self-hosted, linux, arm64]
    steps: []
  build-macos:
    runs-on: macos-14
    steps: []
  build-windows:
    runs-on: windows-2022
    steps: []
  exotic:
    runs-on: buildjet-4vcpu
    steps: []
"#;

    fn write_workflow(yaml: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("release.yml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_classify_runner_families() {
        assert_eq!(classify("ubuntu-latest"), RunnerClass::Compatible);
        assert_eq!(classify("ubuntu-22.04"), RunnerClass::Compatible);
        assert_eq!(classify("self-hosted-linux-arm64"), RunnerClass::Compatible);
        assert_eq!(classify("macos-14"), RunnerClass::NativeRequired);
        assert_eq!(classify("windows-2022"), RunnerClass::NativeRequired);
        assert_eq!(classify("buildjet-4vcpu"), RunnerClass::Unknown);
    }

    #[test]
    fn test_load_missing_file_is_invalid_args() {
        let err = Workflow::load(Path::new("/nonexistent/wf.yml")).unwrap_err();
        assert!(matches!(err, DsrError::InvalidArgs(_)));
    }

    #[test]
    fn test_list_jobs_and_runner() {
        let (_dir, path) = write_workflow(WORKFLOW_YAML);
        let wf = Workflow::load(&path).unwrap();
        let jobs = wf.list_jobs();
        assert_eq!(jobs.len(), 5);
        assert!(jobs.contains(&"build-linux".to_string()));
        assert_eq!(wf.runner("build-macos").unwrap(), "macos-14");
        // list-form runs-on flattens to a space-joined label string
        assert_eq!(wf.runner("build-linux-arm").unwrap(), "self-hosted linux arm64");
        assert!(wf.runner("nope").is_err());
    }

    #[test]
    fn test_analyze_buckets_jobs() {
        let (_dir, path) = write_workflow(WORKFLOW_YAML);
        let analysis = analyze(&path).unwrap();
        assert_eq!(analysis.linux_jobs, vec!["build-linux", "build-linux-arm"]);
        assert_eq!(analysis.macos_jobs, vec!["build-macos"]);
        assert_eq!(analysis.windows_jobs, vec!["build-windows"]);
        assert_eq!(analysis.other_jobs, vec!["exotic"]);
        assert_eq!(analysis.act_compatible_count, 2);
        assert_eq!(analysis.native_required_count, 2);
    }

    #[test]
    fn test_require_act_job_rejects_unknown_by_default() {
        let (_dir, path) = write_workflow(WORKFLOW_YAML);
        let wf = Workflow::load(&path).unwrap();
        assert!(wf.require_act_job("build-linux", false).is_ok());
        assert!(matches!(
            wf.require_act_job("build-macos", false),
            Err(DsrError::Config(_))
        ));
        assert!(matches!(
            wf.require_act_job("exotic", false),
            Err(DsrError::Config(_))
        ));
        assert!(wf.require_act_job("exotic", true).is_ok());
    }
}
