//! Retention policy for past run logs and artifacts.
//!
//! Each run leaves a subdirectory named by its run id under the logs
//! and artifacts directories. Pruning is routine housekeeping that
//! runs independently of the current run and never touches the run
//! in progress.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use dsr_core::error::Result;

/// Retention rules for per-run state directories.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Remove run directories older than this many days. `None` means
    /// no age limit.
    pub max_age_days: Option<u64>,
    /// Keep at most this many run directories (newest first). `None`
    /// means no count limit.
    pub max_runs: Option<usize>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age_days: Some(7),
            max_runs: None,
        }
    }
}

impl RetentionPolicy {
    /// Prune `dir`'s immediate subdirectories, skipping `keep` (the
    /// current run). Returns the number of pruned directories.
    ///
    /// Rules apply in order: age first, then count (oldest beyond the
    /// limit go). Unreadable entries are skipped, not fatal; cleanup
    /// must never mask a build result.
    pub fn prune(&self, dir: &Path, keep: Option<&str>) -> Result<usize> {
        let read_dir = match std::fs::read_dir(dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut entries: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in read_dir.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(keep) = keep {
                if entry.file_name().to_string_lossy() == keep {
                    continue;
                }
            }
            let modified = match entry.metadata().and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(_) => continue,
            };
            entries.push((modified, path));
        }

        // Newest first, for count-based pruning
        entries.sort_by(|a, b| b.0.cmp(&a.0));

        let mut pruned = 0usize;
        let now = SystemTime::now();

        if let Some(max_days) = self.max_age_days {
            let cutoff = now - Duration::from_secs(max_days * 24 * 60 * 60);
            entries.retain(|(modified, path)| {
                if *modified < cutoff {
                    match std::fs::remove_dir_all(path) {
                        Ok(()) => pruned += 1,
                        Err(e) => warn!(path = %path.display(), error = %e, "retention prune failed"),
                    }
                    false
                } else {
                    true
                }
            });
        }

        if let Some(max_runs) = self.max_runs {
            if entries.len() > max_runs {
                for (_, path) in entries.drain(max_runs..) {
                    match std::fs::remove_dir_all(&path) {
                        Ok(()) => pruned += 1,
                        Err(e) => warn!(path = %path.display(), error = %e, "retention prune failed"),
                    }
                }
            }
        }

        if pruned > 0 {
            debug!(dir = %dir.display(), pruned, "pruned expired run state");
        }
        Ok(pruned)
    }
}
