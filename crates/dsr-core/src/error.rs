//! Error taxonomy and process exit-code mapping for dsr.

use std::fmt;

/// A single repository validation problem.
///
/// `validate_for_build` accumulates every issue it finds instead of
/// stopping at the first, so the operator sees the complete picture
/// before deciding to override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    /// The release tag does not exist in the repository.
    MissingTag { tag: String },
    /// The requested ref could not be resolved to a commit.
    UnresolvedRef { reference: String },
    /// The working tree has uncommitted changes and dirty builds were
    /// not explicitly allowed.
    DirtyTree { status: String },
    /// The path is not a git repository at all.
    NotARepository { path: String },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::MissingTag { tag } => write!(f, "tag not found: {tag}"),
            ValidationIssue::UnresolvedRef { reference } => {
                write!(f, "cannot resolve ref: {reference}")
            }
            ValidationIssue::DirtyTree { status } => {
                write!(f, "working tree is dirty ({status}) and --allow-dirty not set")
            }
            ValidationIssue::NotARepository { path } => {
                write!(f, "not a git repository: {path}")
            }
        }
    }
}

/// dsr error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum DsrError {
    /// A required runtime is missing or unreachable (docker, act, ssh,
    /// remote toolchain).
    #[error("dependency error: {0}")]
    Dependency(String),

    /// Repository state problems, accumulated.
    #[error("validation failed: {}", format_issues(.0))]
    Validation(Vec<ValidationIssue>),

    /// Malformed configuration or an unsupported platform.
    #[error("config error: {0}")]
    Config(String),

    /// Bad CLI input, e.g. a workflow file that does not exist.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// A build command failed on every target.
    #[error("build failed: {0}")]
    Execution(String),

    /// A build exceeded its wall-clock deadline.
    #[error("timeout after {seconds}s: {context}")]
    Timeout { context: String, seconds: u64 },

    /// Aggregate-only: some but not all targets succeeded.
    #[error("partial failure: {failed} of {total} targets failed")]
    PartialFailure { failed: usize, total: usize },

    /// Manifest assembly inconsistency, e.g. an artifact vanished
    /// before it could be hashed.
    #[error("internal error: {0}")]
    Internal(String),

    /// A git plumbing command failed unexpectedly.
    #[error("git error: {0}")]
    Git(String),

    /// The run was interrupted by the operator.
    #[error("interrupted")]
    Interrupted,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl DsrError {
    /// Map this error to the dsr process exit-code contract.
    ///
    /// 0 success, 1 partial failure, 3 dependency error, 4 invalid
    /// arguments / unsupported platform / validation failure,
    /// 5 interrupted or timed out, 6 total build failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            DsrError::PartialFailure { .. } => 1,
            DsrError::Dependency(_) => 3,
            DsrError::Validation(_)
            | DsrError::Config(_)
            | DsrError::InvalidArgs(_)
            | DsrError::Yaml(_) => 4,
            DsrError::Timeout { .. } | DsrError::Interrupted => 5,
            DsrError::Execution(_)
            | DsrError::Internal(_)
            | DsrError::Git(_)
            | DsrError::Io(_)
            | DsrError::Serialization(_) => 6,
        }
    }
}

/// Result type for dsr operations.
pub type Result<T> = std::result::Result<T, DsrError>;
