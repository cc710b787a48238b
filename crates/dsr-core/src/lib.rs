//! dsr core library
//!
//! Domain types and leaf components for the dsr fallback release
//! orchestrator: build targets, per-tool configuration, workflow
//! analysis, platform routing and repository validation.

pub mod config;
pub mod error;
pub mod repo;
pub mod router;
pub mod target;
pub mod telemetry;
pub mod workflow;

pub use config::{ActOverrides, EngineConfig, RemoteHost, RepoConfig};
pub use error::{DsrError, Result, ValidationIssue};
pub use repo::{
    build_info, create_build_worktree, dirty_status, is_git_repo, remove_build_worktree,
    resolve_ref, validate_for_build, DirtyStatus, RefType, RepoState,
};
pub use router::{
    build_matrix, owner_of, resolve_options, strategy, uses_container, BackendOptions,
    BuildMethod, BuildStrategy, CONTAINER_HOST,
};
pub use target::{Arch, Os, Target};
pub use workflow::{analyze, classify, RunnerClass, Workflow, WorkflowAnalysis};
