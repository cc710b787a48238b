//! Build execution for dsr.
//!
//! Everything that actually runs a build lives here: the backend
//! abstraction with its containerized (act) and remote native (SSH)
//! implementations, subprocess supervision with timeouts and log
//! capture, the concurrent executor with per-host serialization, the
//! manifest assembler, and retention of past run state.

pub mod act;
pub mod artifacts;
pub mod backend;
pub mod executor;
pub mod manifest;
pub mod native;
pub mod process;
pub mod result;
pub mod retention;

pub use act::ContainerizedBackend;
pub use backend::{Backend, RunContext};
pub use executor::{BuildExecutor, ExecuteOptions, RunOutcome};
pub use manifest::{ArtifactEntry, BuildManifest, HostSummary};
pub use native::NativeBackend;
pub use result::{BuildResult, BuildStatus};
pub use retention::RetentionPolicy;
