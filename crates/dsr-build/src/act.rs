//! Containerized execution backend: local act/Docker builds.
//!
//! Runs the workflow job mapped to a target inside the local container
//! runtime, scoped to that single job, with a hard wall-clock timeout.
//! Output streams live and lands in a per-target log file; artifacts
//! are collected from a per-run artifact server directory that is
//! never shared across concurrent runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use dsr_core::error::{DsrError, Result};
use dsr_core::router::{BackendOptions, BuildStrategy};

use crate::artifacts::flatten_artifacts;
use crate::backend::{Backend, RunContext};
use crate::process::{run_logged, CommandSpec, ProcessOutcome};
use crate::result::{BuildResult, BuildStatus};

/// Local containerized backend driving `act`.
///
/// The checkout to build against arrives per run via
/// [`RunContext::workdir`]; the backend itself only knows which
/// workflow file to hand to the runner.
pub struct ContainerizedBackend {
    /// Workflow runner binary, normally `act`.
    pub act_binary: String,
    /// Container runtime binary, normally `docker`.
    pub docker_binary: String,
    /// Workflow file path relative to the run's workdir.
    pub workflow: PathBuf,
}

impl ContainerizedBackend {
    pub fn new(workflow: PathBuf) -> Self {
        Self {
            act_binary: "act".to_string(),
            docker_binary: "docker".to_string(),
            workflow,
        }
    }

    fn act_command(
        &self,
        strategy: &BuildStrategy,
        options: &BackendOptions,
        raw_artifact_dir: &Path,
        workdir: &Path,
    ) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.act_binary)
            .cwd(workdir)
            .args(["-W".to_string(), self.workflow.display().to_string()])
            .args(["-j".to_string(), strategy.job.clone()])
            .args([
                "--artifact-server-path".to_string(),
                raw_artifact_dir.display().to_string(),
            ]);

        if let Some(image) = &options.platform_image {
            spec = spec.args(["-P".to_string(), image.clone()]);
        }
        if let Some(secrets) = &options.secrets_file {
            spec = spec.args(["--secret-file".to_string(), secrets.display().to_string()]);
        }
        if let Some(env_file) = &options.env_file {
            spec = spec.args(["--env-file".to_string(), env_file.display().to_string()]);
        }
        spec.args(options.extra_flags.iter().cloned())
    }

    async fn probe(&self, program: &str, args: &[&str], what: &str) -> Result<()> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| DsrError::Dependency(format!("{what}: cannot run {program}: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DsrError::Dependency(format!(
                "{what}: {program} {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for ContainerizedBackend {
    fn name(&self) -> &str {
        "act"
    }

    /// Requires the act binary and a responsive Docker daemon.
    async fn check(&self) -> Result<()> {
        self.probe(&self.act_binary, &["--version"], "workflow runner missing")
            .await?;
        self.probe(&self.docker_binary, &["info"], "container daemon unavailable")
            .await
    }

    async fn run(
        &self,
        strategy: &BuildStrategy,
        options: &BackendOptions,
        ctx: &RunContext,
    ) -> BuildResult {
        let mut result =
            BuildResult::dispatched(&ctx.run_id, strategy.target, &strategy.host, strategy.method);
        let log_file = ctx.log_file(strategy);
        result.log_file = Some(log_file.clone());

        let out_dir = ctx.target_artifact_dir(strategy);
        let raw_dir = out_dir.join("raw");

        info!(
            target = %strategy.target,
            job = %strategy.job,
            version = %ctx.version,
            workdir = %ctx.workdir.display(),
            "starting containerized build"
        );

        let spec = self.act_command(strategy, options, &raw_dir, &ctx.workdir);
        let outcome = match run_logged(&spec, ctx.timeout, ctx.grace, &log_file, &ctx.shutdown).await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                result.reason = Some(e.to_string());
                result.status = BuildStatus::Skipped;
                return result;
            }
        };

        result.duration_seconds = outcome.duration.as_secs_f64();
        result.exit_code = outcome.exit_code;
        self.finish(strategy, &outcome, out_dir, raw_dir, result, ctx.timeout)
    }
}

impl ContainerizedBackend {
    fn finish(
        &self,
        strategy: &BuildStrategy,
        outcome: &ProcessOutcome,
        out_dir: PathBuf,
        raw_dir: PathBuf,
        mut result: BuildResult,
        timeout: Duration,
    ) -> BuildResult {
        if outcome.interrupted {
            result.status = BuildStatus::Failed;
            result.reason = Some("interrupted by operator".to_string());
            return result;
        }
        if outcome.timed_out {
            result.status = BuildStatus::Timeout;
            result.reason = Some(format!(
                "exceeded {}s wall-clock limit",
                timeout.as_secs()
            ));
            return result;
        }
        if outcome.exit_code != Some(0) {
            result.status = BuildStatus::Failed;
            result.reason = Some(format!(
                "act job {} exited with {:?}",
                strategy.job, outcome.exit_code
            ));
            return result;
        }

        match flatten_artifacts(&raw_dir, &out_dir) {
            Ok(count) => {
                result.status = BuildStatus::Success;
                result.artifact_count = count;
                result.artifact_dir = Some(out_dir);
            }
            Err(e) => {
                warn!(target = %strategy.target, error = %e, "artifact collection failed");
                result.status = BuildStatus::Failed;
                result.reason = Some(format!("artifact collection failed: {e}"));
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsr_core::router::BuildMethod;
    use dsr_core::target::Target;

    fn strategy() -> BuildStrategy {
        BuildStrategy {
            tool: "ntm".to_string(),
            target: "linux/amd64".parse::<Target>().unwrap(),
            method: BuildMethod::Act,
            host: "trj".to_string(),
            job: "build-linux".to_string(),
        }
    }

    #[test]
    fn test_act_command_scopes_to_job() {
        let backend = ContainerizedBackend::new(".github/workflows/release.yml".into());
        let spec = backend.act_command(
            &strategy(),
            &BackendOptions::default(),
            Path::new("/tmp/raw"),
            Path::new("/src/ntm"),
        );
        assert_eq!(spec.cwd.as_deref(), Some(Path::new("/src/ntm")));
        let rendered = spec.render();
        assert!(rendered.starts_with("act "));
        assert!(rendered.contains("-j build-linux"));
        assert!(rendered.contains("-W .github/workflows/release.yml"));
        assert!(rendered.contains("--artifact-server-path /tmp/raw"));
    }

    #[test]
    fn test_act_command_applies_overrides() {
        let backend = ContainerizedBackend::new("wf.yml".into());
        let options = BackendOptions {
            platform_image: Some("ubuntu-latest=ghcr.io/example/runner:latest".to_string()),
            secrets_file: Some("/etc/dsr/secrets.env".into()),
            env_file: Some("/etc/dsr/env".into()),
            extra_flags: vec!["--container-architecture".into(), "linux/arm64".into()],
            ..Default::default()
        };
        let rendered = backend
            .act_command(&strategy(), &options, Path::new("/tmp/raw"), Path::new("/src/ntm"))
            .render();
        assert!(rendered.contains("-P ubuntu-latest=ghcr.io/example/runner:latest"));
        assert!(rendered.contains("--secret-file /etc/dsr/secrets.env"));
        assert!(rendered.contains("--env-file /etc/dsr/env"));
        assert!(rendered.contains("--container-architecture linux/arm64"));
    }

    fn dispatched() -> BuildResult {
        let s = strategy();
        BuildResult::dispatched("run-1", s.target, &s.host, s.method)
    }

    #[test]
    fn test_finish_maps_timeout() {
        let backend = ContainerizedBackend::new("wf.yml".into());
        let outcome = ProcessOutcome {
            exit_code: None,
            timed_out: true,
            interrupted: false,
            duration: Duration::from_secs(60),
        };
        let result = backend.finish(
            &strategy(),
            &outcome,
            "/tmp/out".into(),
            "/tmp/out/raw".into(),
            dispatched(),
            Duration::from_secs(60),
        );
        assert_eq!(result.status, BuildStatus::Timeout);
        assert!(result.reason.as_deref().unwrap().contains("60s"));
        assert!(result.artifact_dir.is_none());
    }

    #[test]
    fn test_finish_collision_fails_the_target() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        std::fs::create_dir_all(raw.join("job-a")).unwrap();
        std::fs::create_dir_all(raw.join("job-b")).unwrap();
        std::fs::write(raw.join("job-a/ntm.tar.gz"), b"a").unwrap();
        std::fs::write(raw.join("job-b/ntm.tar.gz"), b"b").unwrap();

        let backend = ContainerizedBackend::new("wf.yml".into());
        let outcome = ProcessOutcome {
            exit_code: Some(0),
            timed_out: false,
            interrupted: false,
            duration: Duration::from_secs(5),
        };
        let result = backend.finish(
            &strategy(),
            &outcome,
            dir.path().to_path_buf(),
            raw,
            dispatched(),
            Duration::from_secs(60),
        );
        assert_eq!(result.status, BuildStatus::Failed);
        assert!(result.reason.as_deref().unwrap().contains("collision"));
    }
}
