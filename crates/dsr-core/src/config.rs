//! Engine and per-tool configuration.
//!
//! [`EngineConfig`] is built once at process start and passed by
//! reference into every component; nothing in dsr reads environment
//! variables or ambient globals at call time. [`RepoConfig`] is the
//! typed form of a tool's YAML config, parsed once per run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DsrError, Result};
use crate::target::{Os, Target};

/// Connection details for a remote native build host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteHost {
    /// Logical host name (`mmini`, `wlap`).
    pub name: String,

    /// SSH destination, e.g. `builder@mmini.local`.
    pub ssh_destination: String,

    /// Absolute path of the tool checkout on the remote host.
    pub repo_path: String,

    /// Command run remotely by `check()` to probe the toolchain,
    /// e.g. `go version`. Empty disables the probe.
    #[serde(default)]
    pub toolchain_check: Vec<String>,
}

/// Engine-wide configuration, independent of any single tool.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// State directory root; manifests, logs and artifacts live under it.
    pub state_dir: PathBuf,

    /// Hard wall-clock limit for a single target build.
    pub build_timeout: Duration,

    /// Grace period between SIGTERM and SIGKILL on deadline expiry.
    pub grace_period: Duration,

    /// Age after which past run logs/artifacts are pruned.
    pub retention_days: u64,

    /// Retry budget for transient backend failures.
    pub max_retries: u32,

    /// Base delay for exponential backoff between retries.
    pub backoff_base_ms: u64,

    /// Remote native hosts, keyed by logical name.
    pub remote_hosts: BTreeMap<String, RemoteHost>,
}

impl EngineConfig {
    /// Build a config rooted at `state_dir` with the standard host pair.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        let mut remote_hosts = BTreeMap::new();
        for (name, dest) in [("mmini", "builder@mmini.local"), ("wlap", "builder@wlap.local")] {
            remote_hosts.insert(
                name.to_string(),
                RemoteHost {
                    name: name.to_string(),
                    ssh_destination: dest.to_string(),
                    repo_path: String::new(),
                    toolchain_check: Vec::new(),
                },
            );
        }
        Self {
            state_dir: state_dir.into(),
            build_timeout: Duration::from_secs(3600),
            grace_period: Duration::from_secs(10),
            retention_days: 7,
            max_retries: 2,
            backoff_base_ms: 500,
            remote_hosts,
        }
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.state_dir.join("manifests")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.state_dir.join("artifacts")
    }

    /// Look up a remote host by logical name.
    pub fn remote_host(&self, name: &str) -> Result<&RemoteHost> {
        self.remote_hosts
            .get(name)
            .ok_or_else(|| DsrError::Config(format!("no remote host configured: {name}")))
    }
}

/// Platform-specific overrides for containerized (act) builds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActOverrides {
    /// Custom runner image passed as `-P <platform>=<image>`.
    #[serde(default)]
    pub platform_image: Option<String>,

    /// Secrets file passed as `--secret-file`.
    #[serde(default)]
    pub secrets_file: Option<PathBuf>,

    /// Environment file passed as `--env-file`.
    #[serde(default)]
    pub env_file: Option<PathBuf>,

    /// Extra act flags applied only to linux/arm64 builds.
    #[serde(default)]
    pub linux_arm64_flags: Vec<String>,
}

/// Per-tool repository configuration, parsed once per run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoConfig {
    /// Tool name, e.g. `ntm`.
    pub tool: String,

    /// GitHub `owner/name` of the tool repository.
    pub repo: String,

    /// Local checkout path.
    pub local_path: PathBuf,

    /// Implementation language (informational; selects toolchain probes).
    pub language: String,

    /// Workflow file path, relative to `local_path`.
    pub workflow: PathBuf,

    /// Platform matrix to build.
    pub targets: Vec<Target>,

    /// Map from canonical target string to the act job that builds it.
    /// A null/absent entry means the target builds natively.
    #[serde(default)]
    pub act_job_map: BTreeMap<String, Option<String>>,

    /// Containerized build overrides.
    #[serde(default)]
    pub act_overrides: ActOverrides,

    /// Command template for native builds; `{os}`, `{arch}` and
    /// `{version}` are substituted per target.
    #[serde(default)]
    pub build_command: Vec<String>,

    /// Directory (relative to the remote checkout) where native builds
    /// leave their artifacts.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: String,
}

fn default_artifact_dir() -> String {
    "dist".to_string()
}

impl RepoConfig {
    /// Parse a tool config from a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DsrError::InvalidArgs(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let text = std::fs::read_to_string(path)?;
        let config: RepoConfig = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configs that cannot route every target.
    pub fn validate(&self) -> Result<()> {
        if self.tool.is_empty() {
            return Err(DsrError::Config("tool name must not be empty".to_string()));
        }
        if self.targets.is_empty() {
            return Err(DsrError::Config(format!(
                "{}: targets must not be empty",
                self.tool
            )));
        }
        for key in self.act_job_map.keys() {
            key.parse::<Target>().map_err(|_| {
                DsrError::Config(format!("{}: act_job_map key is not a target: {key}", self.tool))
            })?;
        }
        for target in &self.targets {
            if self.act_job(target).is_none() && self.build_command.is_empty() {
                return Err(DsrError::Config(format!(
                    "{}: target {target} builds natively but no build_command is set",
                    self.tool
                )));
            }
        }
        Ok(())
    }

    /// The act job mapped to `target`, if any.
    ///
    /// A key that is present but explicitly null means the same thing
    /// as an absent key: the target does not build under act.
    pub fn act_job(&self, target: &Target) -> Option<&str> {
        self.act_job_map
            .get(&target.canonical())
            .and_then(|job| job.as_deref())
            .filter(|job| !job.is_empty())
    }

    /// Workflow path resolved against the local checkout.
    pub fn workflow_path(&self) -> PathBuf {
        self.local_path.join(&self.workflow)
    }

    /// Render the native build command for one target.
    pub fn native_build_command(&self, target: &Target, version: &str) -> Vec<String> {
        self.build_command
            .iter()
            .map(|part| {
                part.replace("{os}", target.os.as_str())
                    .replace("{arch}", target.arch.as_str())
                    .replace("{version}", version)
            })
            .collect()
    }

    /// Whether any configured target belongs to `os`.
    pub fn has_os(&self, os: Os) -> bool {
        self.targets.iter().any(|t| t.os == os)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const NTM_YAML: &str = r#"
tool: ntm
repo: example/ntm
local_path: /src/ntm
language: go
workflow: .github/workflows/release.yml
targets:
  - linux/amd64
  - darwin/arm64
  - windows/amd64
act_job_map:
  linux/amd64: build-linux
  darwin/arm64: null
build_command: ["make", "release", "OS={os}", "ARCH={arch}", "VERSION={version}"]
act_overrides:
  platform_image: ghcr.io/example/runner:latest
  linux_arm64_flags: ["--container-architecture", "linux/arm64"]
"#;

    fn write_config(yaml: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ntm.yml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_repo_config_parses_typed_targets() {
        let (_dir, path) = write_config(NTM_YAML);
        let cfg = RepoConfig::from_yaml_file(&path).unwrap();
        assert_eq!(cfg.tool, "ntm");
        assert_eq!(cfg.targets.len(), 3);
        assert_eq!(cfg.targets[1].canonical(), "darwin/arm64");
        assert_eq!(
            cfg.act_overrides.platform_image.as_deref(),
            Some("ghcr.io/example/runner:latest")
        );
    }

    #[test]
    fn test_act_job_treats_null_as_absent() {
        let (_dir, path) = write_config(NTM_YAML);
        let cfg = RepoConfig::from_yaml_file(&path).unwrap();
        let linux: Target = "linux/amd64".parse().unwrap();
        let darwin: Target = "darwin/arm64".parse().unwrap();
        let windows: Target = "windows/amd64".parse().unwrap();
        assert_eq!(cfg.act_job(&linux), Some("build-linux"));
        assert_eq!(cfg.act_job(&darwin), None);
        assert_eq!(cfg.act_job(&windows), None);
    }

    #[test]
    fn test_native_build_command_substitution() {
        let (_dir, path) = write_config(NTM_YAML);
        let cfg = RepoConfig::from_yaml_file(&path).unwrap();
        let darwin: Target = "darwin/arm64".parse().unwrap();
        let cmd = cfg.native_build_command(&darwin, "1.2.3");
        assert_eq!(
            cmd,
            vec!["make", "release", "OS=darwin", "ARCH=arm64", "VERSION=1.2.3"]
        );
    }

    #[test]
    fn test_missing_config_file_is_invalid_args() {
        let err = RepoConfig::from_yaml_file(Path::new("/nonexistent/tool.yml")).unwrap_err();
        assert!(matches!(err, DsrError::InvalidArgs(_)));
    }

    #[test]
    fn test_native_target_without_build_command_rejected() {
        let yaml = r#"
tool: ntm
repo: example/ntm
local_path: /src/ntm
language: go
workflow: wf.yml
targets: ["darwin/arm64"]
"#;
        let (_dir, path) = write_config(yaml);
        let err = RepoConfig::from_yaml_file(&path).unwrap_err();
        assert!(matches!(err, DsrError::Config(_)));
    }

    #[test]
    fn test_bad_act_job_map_key_rejected() {
        let yaml = r#"
tool: ntm
repo: example/ntm
local_path: /src/ntm
language: go
workflow: wf.yml
targets: ["linux/amd64"]
act_job_map:
  not-a-target: build
"#;
        let (_dir, path) = write_config(yaml);
        let err = RepoConfig::from_yaml_file(&path).unwrap_err();
        assert!(matches!(err, DsrError::Config(_)));
    }

    #[test]
    fn test_engine_config_paths() {
        let cfg = EngineConfig::new("/var/lib/dsr");
        assert_eq!(cfg.manifests_dir(), PathBuf::from("/var/lib/dsr/manifests"));
        assert_eq!(cfg.logs_dir(), PathBuf::from("/var/lib/dsr/logs"));
        assert_eq!(cfg.retention_days, 7);
        assert!(cfg.remote_host("mmini").is_ok());
        assert!(cfg.remote_host("unknown").is_err());
    }
}
