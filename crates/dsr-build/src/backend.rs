//! The polymorphic execution backend contract.
//!
//! The containerized (act) backend and the remote native (SSH) backend
//! implement the same trait so the executor treats both uniformly: one
//! readiness probe, one `run` per target, identical result shape.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use dsr_core::error::Result;
use dsr_core::repo::RepoState;
use dsr_core::router::{BackendOptions, BuildStrategy};

use crate::result::BuildResult;

/// Shared, read-only context for one orchestrator run.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Unique id of this run.
    pub run_id: String,

    /// Version being released (tag without the `v` prefix).
    pub version: String,

    /// Repository state validated at the start of the run. Immutable
    /// for the duration of the run.
    pub repo_state: RepoState,

    /// Checkout the build executes against, pinned to
    /// `repo_state.git_sha`. For containerized builds this is a
    /// detached worktree, never the caller's live checkout, so a HEAD
    /// that moved after validation cannot leak into the build.
    pub workdir: PathBuf,

    /// Hard wall-clock limit per target build.
    pub timeout: Duration,

    /// SIGTERM-to-SIGKILL grace period.
    pub grace: Duration,

    /// Per-run log directory.
    pub log_dir: PathBuf,

    /// Per-run artifact directory, never shared across concurrent runs.
    pub artifact_dir: PathBuf,

    /// Flipped to `true` on operator interrupt; backends must kill
    /// their in-flight subprocess trees when it fires.
    pub shutdown: watch::Receiver<bool>,
}

impl RunContext {
    /// Log file path for one target.
    pub fn log_file(&self, strategy: &BuildStrategy) -> PathBuf {
        self.log_dir
            .join(format!("{}-{}.log", strategy.tool, strategy.target.slug()))
    }

    /// Artifact directory for one target.
    pub fn target_artifact_dir(&self, strategy: &BuildStrategy) -> PathBuf {
        self.artifact_dir.join(strategy.target.slug())
    }
}

/// One execution backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Probe that every runtime dependency of this backend is present
    /// and responsive. A `Dependency` error means targets routed here
    /// are skipped (with a reason), never silently dropped.
    async fn check(&self) -> Result<()>;

    /// Build one target.
    ///
    /// Never returns `Err`: every failure mode is captured inside the
    /// returned [`BuildResult`] so one target's failure cannot abort
    /// its siblings.
    async fn run(
        &self,
        strategy: &BuildStrategy,
        options: &BackendOptions,
        ctx: &RunContext,
    ) -> BuildResult;
}
