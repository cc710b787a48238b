//! Build manifest assembly.
//!
//! The manifest is the immutable post-build record of what was
//! produced, where, and its content hashes. It is assembled only once
//! every target has a terminal result, hashed against current on-disk
//! bytes, and persisted write-once. Downstream signing/SBOM/dispatch
//! stages read it and emit companion files; they never mutate the
//! manifest in place.

use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use dsr_core::error::{DsrError, Result};
use dsr_core::repo::RepoState;
use dsr_core::router::BuildMethod;
use dsr_core::target::Target;

use crate::result::{BuildResult, BuildStatus};

/// One produced artifact, content-addressed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactEntry {
    pub name: String,
    pub target: Target,
    /// SHA-256 of the artifact bytes at assembly time.
    pub sha256: String,
    pub size_bytes: u64,
    /// Set by the signing stage via a companion file, never by dsr.
    pub signed: bool,
}

/// Per-host build summary row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostSummary {
    pub host: String,
    pub target: Target,
    pub method: BuildMethod,
    pub status: BuildStatus,
    pub duration_seconds: f64,
    /// Originating workflow job for containerized builds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The immutable record of one orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildManifest {
    pub tool: String,
    pub version: String,
    pub git_sha: String,
    pub git_ref: String,
    pub built_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub artifacts: Vec<ArtifactEntry>,
    pub hosts: Vec<HostSummary>,
}

/// Stream-hash a file, returning `(sha256_hex, size_bytes)`.
pub fn hash_file(path: &Path) -> Result<(String, u64)> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        DsrError::Internal(format!(
            "artifact vanished before hashing: {}: {e}",
            path.display()
        ))
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

/// Assemble a manifest from terminal per-target results.
///
/// `jobs` maps canonical target strings to the act job that built them
/// (absent for native targets). Fails `Internal` if any successful
/// result points at artifacts that no longer exist on disk — no
/// manifest is better than a wrong one.
pub fn assemble(
    tool: &str,
    version: &str,
    repo_state: &RepoState,
    results: &[BuildResult],
    duration_ms: u64,
) -> Result<BuildManifest> {
    let mut results: Vec<BuildResult> = results.to_vec();
    // Completion order is irrelevant; the manifest is always sorted by
    // target.
    results.sort_by_key(|r| r.target);

    let mut artifacts = Vec::new();
    let mut hosts = Vec::new();

    for result in &results {
        if result.is_success() {
            let dir = result.artifact_dir.as_ref().ok_or_else(|| {
                DsrError::Internal(format!(
                    "successful result for {} has no artifact directory",
                    result.target
                ))
            })?;
            let mut names: Vec<String> = std::fs::read_dir(dir)
                .map_err(|e| {
                    DsrError::Internal(format!(
                        "artifact directory unreadable: {}: {e}",
                        dir.display()
                    ))
                })?
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                .filter_map(|e| e.file_name().into_string().ok())
                .collect();
            names.sort();

            if names.len() != result.artifact_count {
                return Err(DsrError::Internal(format!(
                    "{}: artifact count drifted between build and assembly ({} vs {})",
                    result.target,
                    result.artifact_count,
                    names.len()
                )));
            }

            for name in names {
                let (sha256, size_bytes) = hash_file(&dir.join(&name))?;
                artifacts.push(ArtifactEntry {
                    name,
                    target: result.target,
                    sha256,
                    size_bytes,
                    signed: false,
                });
            }
        }

        hosts.push(HostSummary {
            host: result.host.clone(),
            target: result.target,
            method: result.method,
            status: result.status,
            duration_seconds: result.duration_seconds,
            job: None,
            reason: result.reason.clone(),
        });
    }

    Ok(BuildManifest {
        tool: tool.to_string(),
        version: version.to_string(),
        git_sha: repo_state.git_sha.clone(),
        git_ref: repo_state.resolved_ref.clone(),
        built_at: Utc::now(),
        duration_ms,
        artifacts,
        hosts,
    })
}

impl BuildManifest {
    /// Attach originating job ids to the host breakdown.
    pub fn with_jobs(mut self, jobs: &std::collections::BTreeMap<String, String>) -> Self {
        for host in &mut self.hosts {
            if let Some(job) = jobs.get(&host.target.canonical()) {
                host.job = Some(job.clone());
            }
        }
        self
    }

    /// Verify every artifact hash against current on-disk bytes.
    ///
    /// `artifact_root` maps targets to the directories the entries were
    /// collected from.
    pub fn verify(&self, dirs: &std::collections::BTreeMap<Target, PathBuf>) -> Result<()> {
        for entry in &self.artifacts {
            let dir = dirs.get(&entry.target).ok_or_else(|| {
                DsrError::Internal(format!("no artifact directory for {}", entry.target))
            })?;
            let (sha256, size) = hash_file(&dir.join(&entry.name))?;
            if sha256 != entry.sha256 || size != entry.size_bytes {
                return Err(DsrError::Internal(format!(
                    "artifact {} changed after assembly (hash mismatch)",
                    entry.name
                )));
            }
        }
        Ok(())
    }
}

/// Persist a manifest, write-once.
///
/// The file is keyed by run id, so a re-run writes a new manifest and
/// can never edit an existing one; an existing path is a hard error.
pub fn write_manifest(manifest: &BuildManifest, dir: &Path, run_id: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!(
        "{}-{}-{}.manifest.json",
        manifest.tool, manifest.version, run_id
    ));

    let file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                DsrError::Internal(format!(
                    "manifest already exists, refusing to overwrite: {}",
                    path.display()
                ))
            } else {
                DsrError::Io(e)
            }
        })?;
    serde_json::to_writer_pretty(file, manifest)?;

    info!(path = %path.display(), "wrote build manifest");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsr_core::repo::{DirtyStatus, RefType};
    use std::collections::BTreeMap;

    fn repo_state() -> RepoState {
        RepoState {
            repo_path: "/src/ntm".into(),
            requested_ref: "v1.0.0".to_string(),
            resolved_ref: "refs/tags/v1.0.0".to_string(),
            ref_type: RefType::Tag,
            git_sha: "a".repeat(40),
            head_sha: "a".repeat(40),
            current_branch: "main".to_string(),
            dirty_status: DirtyStatus::Clean,
            at_head: true,
        }
    }

    fn success_result(run_id: &str, target: &str, host: &str, dir: &Path, count: usize) -> BuildResult {
        BuildResult {
            run_id: run_id.to_string(),
            target: target.parse().unwrap(),
            host: host.to_string(),
            method: BuildMethod::Native,
            status: BuildStatus::Success,
            exit_code: Some(0),
            duration_seconds: 10.0,
            artifact_dir: Some(dir.to_path_buf()),
            artifact_count: count,
            log_file: None,
            reason: None,
        }
    }

    #[test]
    fn test_hash_file_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        std::fs::write(&path, b"hello").unwrap();
        let (sha, size) = hash_file(&path).unwrap();
        assert_eq!(size, 5);
        assert_eq!(
            sha,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_hash_missing_file_is_internal_error() {
        let err = hash_file(Path::new("/nonexistent/artifact")).unwrap_err();
        assert!(matches!(err, DsrError::Internal(_)));
    }

    #[test]
    fn test_assemble_sorts_by_target_and_hashes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let darwin_dir = dir.path().join("darwin-arm64");
        let linux_dir = dir.path().join("linux-amd64");
        std::fs::create_dir_all(&darwin_dir).unwrap();
        std::fs::create_dir_all(&linux_dir).unwrap();
        std::fs::write(darwin_dir.join("ntm_darwin_arm64.tar.gz"), b"darwin").unwrap();
        std::fs::write(linux_dir.join("ntm_linux_amd64.tar.gz"), b"linux").unwrap();

        // Deliberately out of target order
        let results = vec![
            success_result("r1", "darwin/arm64", "mmini", &darwin_dir, 1),
            success_result("r1", "linux/amd64", "trj", &linux_dir, 1),
        ];

        let manifest = assemble("ntm", "1.0.0", &repo_state(), &results, 1234).unwrap();
        assert_eq!(manifest.hosts.len(), 2);
        assert_eq!(manifest.hosts[0].target.canonical(), "linux/amd64");
        assert_eq!(manifest.hosts[1].target.canonical(), "darwin/arm64");
        assert_eq!(manifest.artifacts.len(), 2);
        assert_eq!(manifest.artifacts[0].name, "ntm_linux_amd64.tar.gz");
        assert!(!manifest.artifacts[0].signed);
        assert_eq!(manifest.git_sha, "a".repeat(40));
    }

    #[test]
    fn test_assemble_keeps_failed_and_skipped_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let linux_dir = dir.path().join("linux-amd64");
        std::fs::create_dir_all(&linux_dir).unwrap();
        std::fs::write(linux_dir.join("ntm.tar.gz"), b"x").unwrap();

        let mut failed = success_result("r1", "darwin/arm64", "mmini", dir.path(), 0);
        failed.status = BuildStatus::Skipped;
        failed.artifact_dir = None;
        failed.reason = Some("host unreachable".to_string());

        let results = vec![
            success_result("r1", "linux/amd64", "trj", &linux_dir, 1),
            failed,
        ];
        let manifest = assemble("ntm", "1.0.0", &repo_state(), &results, 99).unwrap();
        // Unattempted targets still appear in the breakdown
        assert_eq!(manifest.hosts.len(), 2);
        assert_eq!(manifest.hosts[1].status, BuildStatus::Skipped);
        assert_eq!(manifest.hosts[1].reason.as_deref(), Some("host unreachable"));
        // But contribute no artifacts
        assert_eq!(manifest.artifacts.len(), 1);
    }

    #[test]
    fn test_assemble_fails_when_artifact_vanished() {
        let dir = tempfile::tempdir().unwrap();
        let linux_dir = dir.path().join("linux-amd64");
        std::fs::create_dir_all(&linux_dir).unwrap();
        // Claimed one artifact, directory is empty
        let results = vec![success_result("r1", "linux/amd64", "trj", &linux_dir, 1)];
        let err = assemble("ntm", "1.0.0", &repo_state(), &results, 1).unwrap_err();
        assert!(matches!(err, DsrError::Internal(_)));
    }

    #[test]
    fn test_write_manifest_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = assemble("ntm", "1.0.0", &repo_state(), &[], 5).unwrap();

        let path = write_manifest(&manifest, dir.path(), "run-1").unwrap();
        assert!(path.exists());
        let err = write_manifest(&manifest, dir.path(), "run-1").unwrap_err();
        assert!(matches!(err, DsrError::Internal(_)));

        // A new run id writes a new file
        let other = write_manifest(&manifest, dir.path(), "run-2").unwrap();
        assert_ne!(path, other);
    }

    #[test]
    fn test_verify_detects_post_assembly_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let linux_dir = dir.path().join("linux-amd64");
        std::fs::create_dir_all(&linux_dir).unwrap();
        std::fs::write(linux_dir.join("ntm.tar.gz"), b"original").unwrap();

        let results = vec![success_result("r1", "linux/amd64", "trj", &linux_dir, 1)];
        let manifest = assemble("ntm", "1.0.0", &repo_state(), &results, 1).unwrap();

        let mut dirs = BTreeMap::new();
        dirs.insert("linux/amd64".parse::<Target>().unwrap(), linux_dir.clone());
        manifest.verify(&dirs).unwrap();

        std::fs::write(linux_dir.join("ntm.tar.gz"), b"tampered").unwrap();
        assert!(manifest.verify(&dirs).is_err());
    }

    #[test]
    fn test_with_jobs_annotates_host_rows() {
        let dir = tempfile::tempdir().unwrap();
        let linux_dir = dir.path().join("linux-amd64");
        std::fs::create_dir_all(&linux_dir).unwrap();
        std::fs::write(linux_dir.join("ntm.tar.gz"), b"x").unwrap();

        let results = vec![success_result("r1", "linux/amd64", "trj", &linux_dir, 1)];
        let manifest = assemble("ntm", "1.0.0", &repo_state(), &results, 1).unwrap();

        let mut jobs = BTreeMap::new();
        jobs.insert("linux/amd64".to_string(), "build-linux".to_string());
        let manifest = manifest.with_jobs(&jobs);
        assert_eq!(manifest.hosts[0].job.as_deref(), Some("build-linux"));
    }
}
