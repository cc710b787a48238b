//! Platform routing: decide how and where each target builds.
//!
//! Strategies are pure functions of the parsed [`RepoConfig`] and a
//! [`Target`]; they are recomputed fresh every run and never cached,
//! since config can change between invocations.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::RepoConfig;
use crate::error::{DsrError, Result};
use crate::target::{Arch, Os, Target};

/// Logical host that owns the local container runtime.
pub const CONTAINER_HOST: &str = "trj";

/// How a single target builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMethod {
    /// Containerized local execution under act/Docker.
    Act,
    /// Remote native execution over SSH.
    Native,
}

impl std::fmt::Display for BuildMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildMethod::Act => f.write_str("act"),
            BuildMethod::Native => f.write_str("native"),
        }
    }
}

/// The routing decision for one (tool, target) pair.
///
/// Invariants: `method == Act` implies `host == "trj"` and a non-empty
/// `job`; `method == Native` implies an empty `job` and the fixed
/// native owner of the target's OS family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStrategy {
    pub tool: String,
    pub target: Target,
    pub method: BuildMethod,
    pub host: String,
    pub job: String,
}

/// Fixed host ownership table.
///
/// Unsupported combinations (e.g. windows/arm64) are a `ConfigError`.
pub fn owner_of(target: &Target) -> Result<&'static str> {
    match (target.os, target.arch) {
        (Os::Linux, _) => Ok("trj"),
        (Os::Darwin, _) => Ok("mmini"),
        (Os::Windows, Arch::Amd64) => Ok("wlap"),
        (Os::Windows, Arch::Arm64) => Err(DsrError::Config(format!(
            "unsupported platform: {target}"
        ))),
    }
}

/// True iff the config maps this target to an act job.
pub fn uses_container(config: &RepoConfig, target: &Target) -> bool {
    config.act_job(target).is_some()
}

/// Compute the deterministic strategy for one target.
pub fn strategy(config: &RepoConfig, target: &Target) -> Result<BuildStrategy> {
    if let Some(job) = config.act_job(target) {
        return Ok(BuildStrategy {
            tool: config.tool.clone(),
            target: *target,
            method: BuildMethod::Act,
            host: CONTAINER_HOST.to_string(),
            job: job.to_string(),
        });
    }
    Ok(BuildStrategy {
        tool: config.tool.clone(),
        target: *target,
        method: BuildMethod::Native,
        host: owner_of(target)?.to_string(),
        job: String::new(),
    })
}

/// Compute the execution plan: one strategy per configured target.
pub fn build_matrix(config: &RepoConfig) -> Result<Vec<BuildStrategy>> {
    config
        .targets
        .iter()
        .map(|target| strategy(config, target))
        .collect()
}

/// Merged per-target invocation options handed to a backend.
///
/// Override resolution happens here, in the router layer, so backends
/// receive a flat option set and never reach into the config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendOptions {
    /// Custom runner image (`-P <platform>=<image>` for act).
    pub platform_image: Option<String>,
    /// Secrets file path.
    pub secrets_file: Option<PathBuf>,
    /// Environment file path.
    pub env_file: Option<PathBuf>,
    /// Arch-specific extra flags.
    pub extra_flags: Vec<String>,
    /// Fully rendered build command for native targets.
    pub build_command: Vec<String>,
    /// Remote directory (relative to the checkout) holding artifacts.
    pub artifact_dir: String,
}

/// Resolve platform-specific overrides for one strategy.
pub fn resolve_options(
    config: &RepoConfig,
    strategy: &BuildStrategy,
    version: &str,
) -> BackendOptions {
    let overrides = &config.act_overrides;
    let extra_flags = if strategy.target.os == Os::Linux && strategy.target.arch == Arch::Arm64 {
        overrides.linux_arm64_flags.clone()
    } else {
        Vec::new()
    };

    BackendOptions {
        platform_image: overrides.platform_image.clone(),
        secrets_file: overrides.secrets_file.clone(),
        env_file: overrides.env_file.clone(),
        extra_flags,
        build_command: match strategy.method {
            BuildMethod::Native => config.native_build_command(&strategy.target, version),
            BuildMethod::Act => Vec::new(),
        },
        artifact_dir: config.artifact_dir.clone(),
    }
}
