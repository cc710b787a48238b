//! The build executor.
//!
//! Validates the repository, cross-checks the workflow, computes the
//! execution plan, then dispatches every target concurrently while
//! serializing access to each physical host. One target's failure is
//! contained in its result; siblings keep running.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use dsr_core::config::{EngineConfig, RepoConfig};
use dsr_core::error::{DsrError, Result};
use dsr_core::repo::{self, RepoState};
use dsr_core::router::{self, BuildMethod, BuildStrategy};
use dsr_core::target::Target;
use dsr_core::workflow::Workflow;

use crate::backend::{Backend, RunContext};
use crate::manifest::{self, BuildManifest};
use crate::result::{BuildResult, BuildStatus};
use crate::retention::RetentionPolicy;

/// Per-invocation knobs.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Build from a dirty tree (the manifest records the dirty status).
    pub allow_dirty: bool,
    /// Downgrade unknown workflow runners from an error to a warning.
    pub allow_unknown_runners: bool,
    /// Restrict the run to a subset of the configured targets.
    pub targets: Option<Vec<Target>>,
}

/// Everything one run produced.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub repo_state: RepoState,
    /// One terminal result per planned target, sorted by target.
    pub results: Vec<BuildResult>,
    pub manifest: BuildManifest,
    pub manifest_path: PathBuf,
}

impl RunOutcome {
    /// Collapse per-target results into the run-level verdict.
    pub fn verdict(&self) -> Result<()> {
        let total = self.results.len();
        let failed = self.results.iter().filter(|r| !r.is_success()).count();
        if self
            .results
            .iter()
            .any(|r| matches!(r.reason.as_deref(), Some(reason) if reason.starts_with("interrupted")))
        {
            return Err(DsrError::Interrupted);
        }
        match failed {
            0 => Ok(()),
            f if f == total => {
                let timed_out = self
                    .results
                    .iter()
                    .filter(|r| r.status == BuildStatus::Timeout)
                    .count();
                if timed_out > 0 {
                    // Nothing succeeded and the deadline is what killed
                    // the run; surface the timeout exit class, not a
                    // build failure.
                    let seconds = self
                        .results
                        .iter()
                        .filter(|r| r.status == BuildStatus::Timeout)
                        .map(|r| r.duration_seconds as u64)
                        .max()
                        .unwrap_or(0);
                    Err(DsrError::Timeout {
                        context: format!("{timed_out} of {total} target builds timed out"),
                        seconds,
                    })
                } else {
                    Err(DsrError::Execution(format!(
                        "all {total} target builds failed"
                    )))
                }
            }
            f => Err(DsrError::PartialFailure { failed: f, total }),
        }
    }
}

/// True for failure reasons worth retrying.
///
/// Only connectivity-shaped failures qualify. A nonzero build exit or
/// a deadline expiry is deterministic and retrying it would just burn
/// the wall clock.
fn is_transient(result: &BuildResult) -> bool {
    if result.status != BuildStatus::Failed && result.status != BuildStatus::Skipped {
        return false;
    }
    let Some(reason) = result.reason.as_deref() else {
        return false;
    };
    let reason = reason.to_ascii_lowercase();
    ["unreachable", "connection refused", "connection reset", "connection closed", "broken pipe"]
        .iter()
        .any(|needle| reason.contains(needle))
}

/// Orchestrates one release build end to end.
pub struct BuildExecutor {
    engine: EngineConfig,
    config: RepoConfig,
    /// Backends keyed by logical host name (`trj`, `mmini`, `wlap`).
    backends: BTreeMap<String, Arc<dyn Backend>>,
}

impl BuildExecutor {
    pub fn new(
        engine: EngineConfig,
        config: RepoConfig,
        backends: BTreeMap<String, Arc<dyn Backend>>,
    ) -> Self {
        Self {
            engine,
            config,
            backends,
        }
    }

    /// Validate config, repository and workflow, and return the plan.
    ///
    /// Shared by `plan` (dry run) and `execute`; nothing here mutates
    /// state.
    pub fn plan(&self, version: &str, opts: &ExecuteOptions) -> Result<(RepoState, Vec<BuildStrategy>)> {
        self.config.validate()?;

        let repo_state =
            repo::validate_for_build(&self.config.local_path, version, opts.allow_dirty)
                .map_err(DsrError::Validation)?;

        let mut matrix = router::build_matrix(&self.config)?;
        if let Some(only) = &opts.targets {
            let requested: BTreeSet<&Target> = only.iter().collect();
            for target in only {
                if !self.config.targets.contains(target) {
                    return Err(DsrError::InvalidArgs(format!(
                        "target not configured for {}: {target}",
                        self.config.tool
                    )));
                }
            }
            matrix.retain(|s| requested.contains(&s.target));
        }

        // Every act job the plan references must exist in the workflow
        // and run on a container-compatible runner.
        if matrix.iter().any(|s| s.method == BuildMethod::Act) {
            let workflow = Workflow::load(&self.config.workflow_path())?;
            for strategy in matrix.iter().filter(|s| s.method == BuildMethod::Act) {
                workflow.require_act_job(&strategy.job, opts.allow_unknown_runners)?;
            }
        }

        Ok((repo_state, matrix))
    }

    /// Run the full build and assemble the manifest.
    pub async fn execute(
        &self,
        version: &str,
        opts: &ExecuteOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Result<RunOutcome> {
        let started = Instant::now();
        let (repo_state, matrix) = self.plan(version, opts)?;
        if matrix.is_empty() {
            return Err(DsrError::InvalidArgs("no targets to build".to_string()));
        }

        let run_id = Uuid::new_v4().to_string();
        let log_dir = self.engine.logs_dir().join(&run_id);
        let artifact_dir = self.engine.artifacts_dir().join(&run_id);
        std::fs::create_dir_all(&log_dir)?;
        std::fs::create_dir_all(&artifact_dir)?;

        // Containerized builds execute against a detached worktree
        // pinned to the validated commit, never against the caller's
        // live checkout, so a HEAD that moved after validation (or a
        // concurrent invocation) cannot leak into the build.
        let uses_container = matrix.iter().any(|s| s.method == BuildMethod::Act);
        let worktree = self.engine.state_dir.join("worktrees").join(&run_id);
        let workdir = if uses_container {
            if !repo_state.at_head {
                info!(
                    sha = %repo_state.git_sha,
                    head = %repo_state.head_sha,
                    "checkout HEAD differs from the requested ref, building the pinned commit"
                );
            }
            std::fs::create_dir_all(self.engine.state_dir.join("worktrees"))?;
            repo::create_build_worktree(&self.config.local_path, &repo_state.git_sha, &worktree)?
        } else {
            self.config.local_path.clone()
        };

        info!(
            run_id = %run_id,
            tool = %self.config.tool,
            version,
            sha = %repo_state.git_sha,
            targets = matrix.len(),
            "starting build run"
        );

        let ctx = RunContext {
            run_id: run_id.clone(),
            version: version.to_string(),
            repo_state: repo_state.clone(),
            workdir,
            timeout: self.engine.build_timeout,
            grace: self.engine.grace_period,
            log_dir,
            artifact_dir,
            shutdown,
        };

        let check_failures = self.probe_backends(&matrix).await;
        let host_locks = host_locks(&matrix);

        let futures = matrix.iter().map(|strategy| {
            let strategy = strategy.clone();
            let options = router::resolve_options(&self.config, &strategy, version);
            let ctx = ctx.clone();
            let lock = Arc::clone(&host_locks[&strategy.host]);
            let backend = self.backends.get(&strategy.host).cloned();
            let check_failure = check_failures.get(&strategy.host).cloned();
            let max_retries = self.engine.max_retries;
            let backoff_base = Duration::from_millis(self.engine.backoff_base_ms);

            async move {
                let shell = BuildResult::dispatched(
                    &ctx.run_id,
                    strategy.target,
                    &strategy.host,
                    strategy.method,
                );
                let Some(backend) = backend else {
                    return shell.skipped(format!("no backend for host {}", strategy.host));
                };
                if let Some(reason) = check_failure {
                    return shell.skipped(reason);
                }

                // One build at a time per physical host; targets on
                // different hosts proceed in parallel.
                let _guard = lock.lock().await;
                if *ctx.shutdown.borrow() {
                    return shell.skipped("interrupted before dispatch");
                }

                let mut attempt = 0u32;
                loop {
                    let result = backend.run(&strategy, &options, &ctx).await;
                    if result.is_success()
                        || attempt >= max_retries
                        || !is_transient(&result)
                        || *ctx.shutdown.borrow()
                    {
                        return result;
                    }
                    attempt += 1;
                    let delay = backoff_base * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        target = %strategy.target,
                        host = %strategy.host,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = result.reason.as_deref().unwrap_or(""),
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        });

        let mut results: Vec<BuildResult> = join_all(futures).await;
        results.sort_by_key(|r| r.target);

        if uses_container {
            repo::remove_build_worktree(&self.config.local_path, &worktree);
        }

        for result in &results {
            info!(
                target = %result.target,
                host = %result.host,
                status = %result.status,
                duration_s = result.duration_seconds,
                artifacts = result.artifact_count,
                "target finished"
            );
        }

        self.prune_state(&run_id);

        let duration_ms = started.elapsed().as_millis() as u64;
        let jobs: BTreeMap<String, String> = matrix
            .iter()
            .filter(|s| s.method == BuildMethod::Act)
            .map(|s| (s.target.canonical(), s.job.clone()))
            .collect();
        let built = manifest::assemble(
            &self.config.tool,
            version,
            &repo_state,
            &results,
            duration_ms,
        )?
        .with_jobs(&jobs);
        let manifest_path =
            manifest::write_manifest(&built, &self.engine.manifests_dir(), &run_id)?;

        Ok(RunOutcome {
            run_id,
            repo_state,
            results,
            manifest: built,
            manifest_path,
        })
    }

    /// Probe every backend the plan touches, once per host.
    ///
    /// A failed probe does not abort the run; it marks every target on
    /// that host as skipped with the probe error as the reason.
    async fn probe_backends(&self, matrix: &[BuildStrategy]) -> BTreeMap<String, String> {
        let hosts: BTreeSet<&String> = matrix.iter().map(|s| &s.host).collect();
        let mut failures = BTreeMap::new();
        for host in hosts {
            let Some(backend) = self.backends.get(host) else {
                continue;
            };
            if let Err(e) = backend.check().await {
                warn!(host = %host, backend = backend.name(), error = %e, "backend check failed");
                failures.insert(host.clone(), format!("{} check failed: {e}", backend.name()));
            }
        }
        failures
    }

    /// Apply the retention policy to past run state, keeping the
    /// current run. Retention is best-effort and never fails a build.
    fn prune_state(&self, current_run: &str) {
        let policy = RetentionPolicy {
            max_age_days: Some(self.engine.retention_days),
            max_runs: None,
        };
        for dir in [self.engine.logs_dir(), self.engine.artifacts_dir()] {
            match policy.prune(&dir, Some(current_run)) {
                Ok(0) => {}
                Ok(n) => info!(dir = %dir.display(), pruned = n, "pruned expired run state"),
                Err(e) => warn!(dir = %dir.display(), error = %e, "retention pruning failed"),
            }
        }
    }
}

/// One async mutex per distinct host in the plan.
fn host_locks(matrix: &[BuildStrategy]) -> BTreeMap<String, Arc<Mutex<()>>> {
    matrix
        .iter()
        .map(|s| (s.host.clone(), Arc::new(Mutex::new(()))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with(status: BuildStatus, reason: Option<&str>) -> BuildResult {
        let mut r = BuildResult::dispatched(
            "r1",
            "linux/amd64".parse().unwrap(),
            "trj",
            BuildMethod::Act,
        );
        r.status = status;
        r.reason = reason.map(str::to_string);
        r
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&result_with(
            BuildStatus::Failed,
            Some("ssh: connect to host mmini.local: Connection refused")
        )));
        assert!(is_transient(&result_with(
            BuildStatus::Skipped,
            Some("host unreachable")
        )));
        // Deterministic failures are never retried
        assert!(!is_transient(&result_with(
            BuildStatus::Failed,
            Some("build exited with code 2")
        )));
        assert!(!is_transient(&result_with(
            BuildStatus::Timeout,
            Some("connection reset")
        )));
        assert!(!is_transient(&result_with(BuildStatus::Failed, None)));
        assert!(!is_transient(&result_with(BuildStatus::Success, None)));
    }

    #[test]
    fn test_host_locks_one_per_host() {
        let strategies = vec![
            BuildStrategy {
                tool: "ntm".into(),
                target: "linux/amd64".parse().unwrap(),
                method: BuildMethod::Act,
                host: "trj".into(),
                job: "build-linux".into(),
            },
            BuildStrategy {
                tool: "ntm".into(),
                target: "linux/arm64".parse().unwrap(),
                method: BuildMethod::Act,
                host: "trj".into(),
                job: "build-linux-arm".into(),
            },
            BuildStrategy {
                tool: "ntm".into(),
                target: "darwin/arm64".parse().unwrap(),
                method: BuildMethod::Native,
                host: "mmini".into(),
                job: String::new(),
            },
        ];
        let locks = host_locks(&strategies);
        assert_eq!(locks.len(), 2);
        assert!(locks.contains_key("trj"));
        assert!(locks.contains_key("mmini"));
    }

    fn outcome(results: Vec<BuildResult>) -> RunOutcome {
        RunOutcome {
            run_id: "r1".into(),
            repo_state: dummy_repo_state(),
            results,
            manifest: dummy_manifest(),
            manifest_path: PathBuf::from("/tmp/m.json"),
        }
    }

    #[test]
    fn test_verdict_aggregation() {
        let ok = result_with(BuildStatus::Success, None);
        let bad = result_with(BuildStatus::Failed, Some("exit 1"));

        assert!(outcome(vec![ok.clone(), ok.clone()]).verdict().is_ok());
        assert!(matches!(
            outcome(vec![ok, bad.clone()]).verdict(),
            Err(DsrError::PartialFailure { failed: 1, total: 2 })
        ));
        assert!(matches!(
            outcome(vec![bad.clone(), bad]).verdict(),
            Err(DsrError::Execution(_))
        ));
    }

    #[test]
    fn test_verdict_all_timeouts_exit_timeout_class() {
        let mut timeout = result_with(
            BuildStatus::Timeout,
            Some("exceeded 3600s wall-clock limit"),
        );
        timeout.duration_seconds = 3600.0;

        let err = outcome(vec![timeout.clone()]).verdict().unwrap_err();
        assert!(matches!(err, DsrError::Timeout { .. }));
        assert_eq!(err.exit_code(), 5);

        // Mixed failures and timeouts with no success still report the timeout
        let bad = result_with(BuildStatus::Failed, Some("exit 1"));
        let err = outcome(vec![timeout.clone(), bad]).verdict().unwrap_err();
        assert_eq!(err.exit_code(), 5);

        // But any success makes it a plain partial failure (exit 1)
        let ok = result_with(BuildStatus::Success, None);
        assert!(matches!(
            outcome(vec![ok, timeout]).verdict(),
            Err(DsrError::PartialFailure { failed: 1, total: 2 })
        ));
    }

    fn dummy_repo_state() -> RepoState {
        use dsr_core::repo::{DirtyStatus, RefType};
        RepoState {
            repo_path: "/src/ntm".into(),
            requested_ref: "v1.0.0".into(),
            resolved_ref: "refs/tags/v1.0.0".into(),
            ref_type: RefType::Tag,
            git_sha: "a".repeat(40),
            head_sha: "a".repeat(40),
            current_branch: "main".into(),
            dirty_status: DirtyStatus::Clean,
            at_head: true,
        }
    }

    fn dummy_manifest() -> BuildManifest {
        manifest::assemble("ntm", "1.0.0", &dummy_repo_state(), &[], 0).unwrap()
    }
}
