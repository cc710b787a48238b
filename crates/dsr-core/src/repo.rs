//! Repository validation via git plumbing.
//!
//! Every check here shells out to git plumbing commands and inspects
//! exit codes or machine-readable output; human-facing `git status`
//! text is never parsed. The validator produces one immutable
//! [`RepoState`] per run, before any backend is invoked.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DsrError, Result, ValidationIssue};

/// Working-tree cleanliness. The tracked-change and untracked-file
/// signals are independent; both can be set at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirtyStatus {
    Clean,
    Modified,
    Untracked,
    #[serde(rename = "modified+untracked")]
    ModifiedUntracked,
}

impl DirtyStatus {
    fn from_signals(modified: bool, untracked: bool) -> Self {
        match (modified, untracked) {
            (false, false) => DirtyStatus::Clean,
            (true, false) => DirtyStatus::Modified,
            (false, true) => DirtyStatus::Untracked,
            (true, true) => DirtyStatus::ModifiedUntracked,
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, DirtyStatus::Clean)
    }
}

impl fmt::Display for DirtyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DirtyStatus::Clean => "clean",
            DirtyStatus::Modified => "modified",
            DirtyStatus::Untracked => "untracked",
            DirtyStatus::ModifiedUntracked => "modified+untracked",
        };
        f.write_str(s)
    }
}

/// How the requested ref was interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefType {
    Tag,
    Branch,
    Commit,
    Ref,
}

/// Immutable snapshot of repository state, computed once per run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoState {
    pub repo_path: PathBuf,
    pub requested_ref: String,
    pub resolved_ref: String,
    pub ref_type: RefType,
    /// Full commit id the build is pinned to.
    pub git_sha: String,
    /// Current HEAD of the checkout (may differ from `git_sha`).
    pub head_sha: String,
    pub current_branch: String,
    pub dirty_status: DirtyStatus,
    /// Whether the resolved ref is the current HEAD.
    pub at_head: bool,
}

fn git(repo: &Path, args: &[&str]) -> Result<std::process::Output> {
    Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .map_err(|e| DsrError::Git(format!("failed to run git: {e}")))
}

fn git_stdout(repo: &Path, args: &[&str]) -> Result<String> {
    let output = git(repo, args)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DsrError::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Whether `path` is inside a git work tree.
pub fn is_git_repo(path: &Path) -> bool {
    git(path, &["rev-parse", "--is-inside-work-tree"])
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Resolve a tag, branch or sha to a full commit id.
///
/// Resolution goes through `rev-parse --verify <ref>^{commit}`, so an
/// annotated tag resolves to the commit it points at; the operation is
/// therefore a fixed point (`resolve_ref(resolve_ref(r)) == resolve_ref(r)`).
pub fn resolve_ref(repo: &Path, reference: &str) -> Result<String> {
    let spec = format!("{reference}^{{commit}}");
    let output = git(repo, &["rev-parse", "--verify", "--quiet", &spec])?;
    if !output.status.success() {
        return Err(DsrError::Validation(vec![ValidationIssue::UnresolvedRef {
            reference: reference.to_string(),
        }]));
    }
    let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if sha.is_empty() {
        return Err(DsrError::Git(format!("rev-parse returned nothing for {reference}")));
    }
    Ok(sha)
}

/// Whether `tag` exists as a tag ref.
pub fn tag_exists(repo: &Path, tag: &str) -> bool {
    let refname = format!("refs/tags/{tag}");
    git(repo, &["show-ref", "--verify", "--quiet", &refname])
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Whether `branch` exists as a local branch ref.
pub fn branch_exists(repo: &Path, branch: &str) -> bool {
    let refname = format!("refs/heads/{branch}");
    git(repo, &["show-ref", "--verify", "--quiet", &refname])
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Full commit id of HEAD.
pub fn head_sha(repo: &Path) -> Result<String> {
    git_stdout(repo, &["rev-parse", "HEAD"])
}

/// Current branch name, or `HEAD` when detached.
pub fn current_branch(repo: &Path) -> Result<String> {
    git_stdout(repo, &["rev-parse", "--abbrev-ref", "HEAD"])
}

/// Determine working-tree cleanliness.
///
/// Tracked changes come from `diff-index --quiet HEAD` (exit code 1
/// means differences); untracked files from an `--exclude-standard`
/// listing. The two signals combine independently.
pub fn dirty_status(repo: &Path) -> Result<DirtyStatus> {
    // Refresh the stat cache first so touched-but-identical files do
    // not read as modified.
    let _ = git(repo, &["update-index", "-q", "--refresh"]);

    let diff = git(repo, &["diff-index", "--quiet", "HEAD", "--"])?;
    let modified = !diff.status.success();

    let untracked_list = git_stdout(repo, &["ls-files", "--others", "--exclude-standard"])?;
    let untracked = !untracked_list.is_empty();

    Ok(DirtyStatus::from_signals(modified, untracked))
}

fn looks_like_sha(reference: &str) -> bool {
    reference.len() >= 7
        && reference.len() <= 40
        && reference.chars().all(|c| c.is_ascii_hexdigit())
}

/// Resolve a requested ref with tag → branch → commit → generic-ref
/// priority and capture the surrounding repository state.
///
/// Refuses with a structured `Validation` error when the tree is dirty
/// and `allow_dirty` is not set.
pub fn build_info(repo: &Path, reference: &str, allow_dirty: bool) -> Result<RepoState> {
    if !is_git_repo(repo) {
        return Err(DsrError::Validation(vec![ValidationIssue::NotARepository {
            path: repo.display().to_string(),
        }]));
    }

    let (resolved_ref, ref_type) = if tag_exists(repo, reference) {
        (format!("refs/tags/{reference}"), RefType::Tag)
    } else if branch_exists(repo, reference) {
        (format!("refs/heads/{reference}"), RefType::Branch)
    } else if looks_like_sha(reference) {
        (reference.to_string(), RefType::Commit)
    } else {
        (reference.to_string(), RefType::Ref)
    };

    let git_sha = resolve_ref(repo, &resolved_ref)?;
    let head = head_sha(repo)?;
    let branch = current_branch(repo)?;
    let dirty = dirty_status(repo)?;

    if !dirty.is_clean() && !allow_dirty {
        return Err(DsrError::Validation(vec![ValidationIssue::DirtyTree {
            status: dirty.to_string(),
        }]));
    }

    debug!(reference, sha = %git_sha, ?ref_type, %dirty, "resolved build ref");

    Ok(RepoState {
        repo_path: repo.to_path_buf(),
        requested_ref: reference.to_string(),
        resolved_ref,
        ref_type,
        at_head: git_sha == head,
        git_sha,
        head_sha: head,
        current_branch: branch,
        dirty_status: dirty,
    })
}

/// Validate a repository for a versioned release build.
///
/// Checks that the tag `v<version>` exists and that the tree is clean
/// (or dirtiness is allowed). All problems are accumulated and
/// returned together rather than failing on the first, so the caller
/// sees the complete picture before deciding to override.
pub fn validate_for_build(
    repo: &Path,
    version: &str,
    allow_dirty: bool,
) -> std::result::Result<RepoState, Vec<ValidationIssue>> {
    let mut issues = Vec::new();

    if !is_git_repo(repo) {
        issues.push(ValidationIssue::NotARepository {
            path: repo.display().to_string(),
        });
        return Err(issues);
    }

    let tag = if version.starts_with('v') {
        version.to_string()
    } else {
        format!("v{version}")
    };

    if !tag_exists(repo, &tag) {
        issues.push(ValidationIssue::MissingTag { tag: tag.clone() });
    }

    let dirty = match dirty_status(repo) {
        Ok(d) => d,
        Err(e) => {
            issues.push(ValidationIssue::UnresolvedRef {
                reference: format!("HEAD ({e})"),
            });
            return Err(issues);
        }
    };
    if !dirty.is_clean() && !allow_dirty {
        issues.push(ValidationIssue::DirtyTree {
            status: dirty.to_string(),
        });
    }

    if !issues.is_empty() {
        return Err(issues);
    }

    build_info(repo, &tag, allow_dirty).map_err(|e| match e {
        DsrError::Validation(inner) => inner,
        other => vec![ValidationIssue::UnresolvedRef {
            reference: format!("{tag} ({other})"),
        }],
    })
}

/// Create a detached worktree at `dir` pinned to a resolved commit.
///
/// Builds run against the worktree, never against the caller's live
/// checkout, so a concurrent invocation cannot observe a half-built
/// tree.
pub fn create_build_worktree(repo: &Path, reference: &str, dir: &Path) -> Result<PathBuf> {
    let sha = resolve_ref(repo, reference)?;
    let dir_str = dir.display().to_string();
    git_stdout(repo, &["worktree", "add", "--detach", &dir_str, &sha])?;
    debug!(worktree = %dir_str, sha = %sha, "created build worktree");
    Ok(dir.to_path_buf())
}

/// Remove a build worktree. Best-effort: failures are logged and
/// swallowed so cleanup can never mask the primary build result.
pub fn remove_build_worktree(repo: &Path, dir: &Path) {
    let dir_str = dir.display().to_string();
    match git(repo, &["worktree", "remove", "--force", &dir_str]) {
        Ok(output) if output.status.success() => {
            debug!(worktree = %dir_str, "removed build worktree");
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(worktree = %dir_str, error = %stderr.trim(), "failed to remove build worktree");
        }
        Err(e) => {
            warn!(worktree = %dir_str, error = %e, "failed to remove build worktree");
        }
    }
}
