//! Remote native execution backend: SSH-driven builds on dedicated
//! OS-specific hosts.
//!
//! Before building, the backend independently re-verifies that the
//! remote checkout sits on the exact commit the validator pinned; a
//! mismatch is a hard failure, never a silent rebuild from a different
//! commit. Build output streams back over the session and lands in the
//! same log/result shape as containerized builds.

use std::path::Path;

use async_trait::async_trait;
use tracing::{info, warn};

use dsr_core::config::RemoteHost;
use dsr_core::error::{DsrError, Result};
use dsr_core::router::{BackendOptions, BuildStrategy};

use crate::artifacts::count_artifacts;
use crate::backend::{Backend, RunContext};
use crate::process::{run_logged, CommandSpec};
use crate::result::{BuildResult, BuildStatus};

const SSH_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Remote native backend for one logical host.
pub struct NativeBackend {
    host: RemoteHost,
    ssh_binary: String,
    scp_binary: String,
}

impl NativeBackend {
    pub fn new(host: RemoteHost) -> Self {
        Self {
            host,
            ssh_binary: "ssh".to_string(),
            scp_binary: "scp".to_string(),
        }
    }

    fn ssh_base(&self) -> CommandSpec {
        CommandSpec::new(&self.ssh_binary).args([
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={SSH_CONNECT_TIMEOUT_SECS}"),
            self.host.ssh_destination.clone(),
        ])
    }

    async fn ssh_capture(&self, remote_command: &str) -> Result<String> {
        let spec = self.ssh_base();
        let output = tokio::process::Command::new(&spec.program)
            .args(&spec.args)
            .arg(remote_command)
            .output()
            .await
            .map_err(|e| DsrError::Dependency(format!("cannot run ssh: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DsrError::Dependency(format!(
                "{}: `{remote_command}` failed: {}",
                self.host.name,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// The commit the remote checkout currently sits on.
    async fn remote_head(&self) -> Result<String> {
        self.ssh_capture(&format!(
            "git -C {} rev-parse HEAD",
            shell_quote(&self.host.repo_path)
        ))
        .await
    }

    fn build_spec(&self, options: &BackendOptions) -> CommandSpec {
        let remote = format!(
            "cd {} && {}",
            shell_quote(&self.host.repo_path),
            options
                .build_command
                .iter()
                .map(|part| shell_quote(part))
                .collect::<Vec<_>>()
                .join(" ")
        );
        self.ssh_base().arg(remote)
    }

    /// Copy the remote artifact directory back into the local per-run
    /// artifact directory. Returns the artifact count.
    async fn fetch_artifacts(&self, options: &BackendOptions, dest: &Path) -> Result<usize> {
        tokio::fs::create_dir_all(dest).await?;
        let remote = format!(
            "{}:{}/{}/*",
            self.host.ssh_destination, self.host.repo_path, options.artifact_dir
        );
        let output = tokio::process::Command::new(&self.scp_binary)
            .args(["-o", "BatchMode=yes", "-r"])
            .arg(&remote)
            .arg(dest)
            .output()
            .await
            .map_err(|e| DsrError::Dependency(format!("cannot run scp: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DsrError::Execution(format!(
                "{}: artifact fetch failed: {}",
                self.host.name,
                stderr.trim()
            )));
        }
        Ok(count_artifacts(dest))
    }
}

/// Minimal POSIX single-quoting for remote command fragments.
fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:{}".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

#[async_trait]
impl Backend for NativeBackend {
    fn name(&self) -> &str {
        &self.host.name
    }

    /// Requires SSH reachability and, when configured, a working
    /// toolchain on the remote host.
    async fn check(&self) -> Result<()> {
        self.ssh_capture("true").await.map_err(|e| {
            DsrError::Dependency(format!("{} unreachable over ssh: {e}", self.host.name))
        })?;

        if !self.host.toolchain_check.is_empty() {
            let probe = self
                .host
                .toolchain_check
                .iter()
                .map(|part| shell_quote(part))
                .collect::<Vec<_>>()
                .join(" ");
            let version = self.ssh_capture(&probe).await?;
            info!(host = %self.host.name, toolchain = %version, "remote toolchain ready");
        }
        Ok(())
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

        // Hard gate: the remote checkout must be on the validated
        // commit before anything builds.
        match self.remote_head().await {
            Ok(remote_sha) if remote_sha == ctx.repo_state.git_sha => {}
            Ok(remote_sha) => {
                warn!(
                    host = %self.host.name,
                    expected = %ctx.repo_state.git_sha,
                    actual = %remote_sha,
                    "remote checkout mismatch"
                );
                result.status = BuildStatus::Failed;
                result.reason = Some(format!(
                    "remote checkout at {remote_sha}, expected {}",
                    ctx.repo_state.git_sha
                ));
                return result;
            }
            Err(e) => {
                return result.skipped(format!("cannot verify remote checkout: {e}"));
            }
        }

        info!(
            target = %strategy.target,
            host = %self.host.name,
            version = %ctx.version,
            "starting remote native build"
        );

        let spec = self.build_spec(options);
        let outcome = match run_logged(&spec, ctx.timeout, ctx.grace, &log_file, &ctx.shutdown).await
        {
            Ok(outcome) => outcome,
            Err(e) => return result.skipped(e.to_string()),
        };

        result.duration_seconds = outcome.duration.as_secs_f64();
        result.exit_code = outcome.exit_code;

        if outcome.interrupted {
            result.status = BuildStatus::Failed;
            result.reason = Some("interrupted by operator".to_string());
            return result;
        }
        if outcome.timed_out {
            result.status = BuildStatus::Timeout;
            result.reason = Some(format!(
                "exceeded {}s wall-clock limit",
                ctx.timeout.as_secs()
            ));
            return result;
        }
        if outcome.exit_code != Some(0) {
            result.status = BuildStatus::Failed;
            result.reason = Some(format!(
                "remote build on {} exited with {:?}",
                self.host.name, outcome.exit_code
            ));
            return result;
        }

        let out_dir = ctx.target_artifact_dir(strategy);
        match self.fetch_artifacts(options, &out_dir).await {
            Ok(count) => {
                result.status = BuildStatus::Success;
                result.artifact_count = count;
                result.artifact_dir = Some(out_dir);
            }
            Err(e) => {
                result.status = BuildStatus::Failed;
                result.reason = Some(e.to_string());
            }
        }
        result
    }
}
