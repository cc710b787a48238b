//! Supervised subprocess execution.
//!
//! Every backend invocation is one blocking subprocess bounded by a
//! deadline. The child runs in its own process group so that
//! termination reaches the whole tree (act spawns containers, ssh
//! spawns control children) and no orphans survive the orchestrator.
//!
//! Deadline expiry escalates: SIGTERM to the group, then SIGKILL after
//! the grace period. The caller is never blocked past
//! `timeout + grace`. Output is drained concurrently into both a
//! durable log file and the live diagnostic stream.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use dsr_core::error::{DsrError, Result};

/// A fully resolved command invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Shell-ish rendering for logs. Secrets never appear here; they
    /// travel via secret files, not argv.
    pub fn render(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// How a supervised subprocess ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// The deadline expired and the process was killed.
    pub timed_out: bool,
    /// A shutdown signal arrived and the process was killed.
    pub interrupted: bool,
    pub duration: Duration,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && !self.interrupted && self.exit_code == Some(0)
    }
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: libc::c_int) {
    if let Some(pid) = child.id() {
        // The child was spawned as its own process-group leader, so
        // pgid == pid.
        unsafe {
            libc::killpg(pid as libc::pid_t, signal);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _signal: i32) {}

/// SIGTERM the child's process group, wait out the grace period, then
/// SIGKILL whatever is left. Returns once the child has been reaped.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    signal_group(child, libc::SIGTERM);
    #[cfg(not(unix))]
    let _ = child.start_kill();

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => return,
        Err(_) => {
            warn!("process survived SIGTERM, escalating to SIGKILL");
        }
    }

    #[cfg(unix)]
    signal_group(child, libc::SIGKILL);
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Run a subprocess under a hard deadline with tee'd output capture.
///
/// Every output line is appended to `log_path` and echoed to stderr as
/// it arrives, so an operator watches progress live while the log file
/// retains everything up to the kill point.
///
/// `shutdown` is a watch channel flipped to `true` on operator
/// interrupt; the process group is killed the same way as on timeout.
pub async fn run_logged(
    spec: &CommandSpec,
    timeout: Duration,
    grace: Duration,
    log_path: &Path,
    shutdown: &watch::Receiver<bool>,
) -> Result<ProcessOutcome> {
    if let Some(parent) = log_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut log_file = tokio::fs::File::create(log_path).await?;

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &spec.envs {
        command.env(key, value);
    }
    #[cfg(unix)]
    command.process_group(0);

    debug!(command = %spec.render(), "spawning supervised subprocess");

    let start = Instant::now();
    let mut child = command
        .spawn()
        .map_err(|e| DsrError::Dependency(format!("failed to spawn {}: {e}", spec.program)))?;

    // Both pipes feed one writer through a channel so the log file has
    // a single owner.
    let (tx, mut rx) = mpsc::channel::<String>(256);

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let tx_out = tx.clone();
    let tx_err = tx;

    let stdout_task = tokio::spawn(async move {
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx_out.send(line).await.is_err() {
                    break;
                }
            }
        }
    });

    let stderr_task = tokio::spawn(async move {
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx_err.send(line).await.is_err() {
                    break;
                }
            }
        }
    });

    let writer_task = tokio::spawn(async move {
        let mut live = tokio::io::stderr();
        while let Some(line) = rx.recv().await {
            let _ = log_file.write_all(line.as_bytes()).await;
            let _ = log_file.write_all(b"\n").await;
            let _ = live.write_all(line.as_bytes()).await;
            let _ = live.write_all(b"\n").await;
        }
        let _ = log_file.flush().await;
    });

    let mut shutdown = shutdown.clone();
    let mut timed_out = false;
    let mut interrupted = false;

    let status = tokio::select! {
        status = child.wait() => Some(status),
        _ = tokio::time::sleep(timeout) => {
            timed_out = true;
            None
        }
        _ = async {
            // A dropped sender means shutdown can no longer be
            // requested, not that it was.
            if shutdown.wait_for(|stop| *stop).await.is_err() {
                std::future::pending::<()>().await;
            }
        } => {
            interrupted = true;
            None
        }
    };

    let exit_code = match status {
        Some(status) => {
            let status = status.map_err(DsrError::Io)?;
            status.code()
        }
        None => {
            terminate(&mut child, grace).await;
            None
        }
    };

    // Pipes close once the child is reaped; drain tasks finish on
    // their own and the writer flushes the log.
    let _ = stdout_task.await;
    let _ = stderr_task.await;
    let _ = writer_task.await;

    Ok(ProcessOutcome {
        exit_code,
        timed_out,
        interrupted,
        duration: start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn test_run_logged_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("build.log");
        let (_tx, rx) = no_shutdown();

        let spec = CommandSpec::new("sh")
            .arg("-c")
            .arg("echo out-line; echo err-line >&2");
        let outcome = run_logged(
            &spec,
            Duration::from_secs(10),
            Duration::from_secs(1),
            &log,
            &rx,
        )
        .await
        .unwrap();

        assert!(outcome.success());
        assert_eq!(outcome.exit_code, Some(0));
        let text = std::fs::read_to_string(&log).unwrap();
        assert!(text.contains("out-line"));
        assert!(text.contains("err-line"));
    }

    #[tokio::test]
    async fn test_run_logged_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = no_shutdown();

        let spec = CommandSpec::new("sh").arg("-c").arg("exit 3");
        let outcome = run_logged(
            &spec,
            Duration::from_secs(10),
            Duration::from_secs(1),
            &dir.path().join("build.log"),
            &rx,
        )
        .await
        .unwrap();

        assert!(!outcome.success());
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_run_logged_timeout_keeps_partial_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("build.log");
        let (_tx, rx) = no_shutdown();

        let spec = CommandSpec::new("sh")
            .arg("-c")
            .arg("echo started; sleep 30");
        let start = Instant::now();
        let outcome = run_logged(
            &spec,
            Duration::from_millis(300),
            Duration::from_millis(300),
            &log,
            &rx,
        )
        .await
        .unwrap();

        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, None);
        // Never blocks past timeout + grace (with some scheduler slack)
        assert!(start.elapsed() < Duration::from_secs(5));
        let text = std::fs::read_to_string(&log).unwrap();
        assert!(text.contains("started"), "log must keep output up to the kill point");
    }

    #[tokio::test]
    async fn test_run_logged_shutdown_interrupts() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = no_shutdown();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = tx.send(true);
        });

        let spec = CommandSpec::new("sleep").arg("30");
        let outcome = run_logged(
            &spec,
            Duration::from_secs(30),
            Duration::from_millis(300),
            &dir.path().join("build.log"),
            &rx,
        )
        .await
        .unwrap();

        assert!(outcome.interrupted);
        assert!(!outcome.timed_out);
        assert!(outcome.duration < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_dependency_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = no_shutdown();

        let spec = CommandSpec::new("definitely-not-a-real-binary-2718");
        let err = run_logged(
            &spec,
            Duration::from_secs(1),
            Duration::from_millis(100),
            &dir.path().join("build.log"),
            &rx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DsrError::Dependency(_)));
    }

    #[test]
    fn test_command_spec_render() {
        let spec = CommandSpec::new("act")
            .args(["-W", ".github/workflows/release.yml", "-j", "build-linux"])
            .cwd("/tmp");
        assert_eq!(spec.render(), "act -W .github/workflows/release.yml -j build-linux");
    }
}
