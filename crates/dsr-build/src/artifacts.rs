//! Artifact collection.
//!
//! The workflow runner leaves artifacts in a nested tree
//! (`<job>/<name>/<file>`); dsr flattens that into one flat directory
//! per target, keyed by basename. A basename collision is a hard
//! error: silently overwriting one artifact with another would produce
//! a manifest that lies about what was built.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use dsr_core::error::{DsrError, Result};

fn walk_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            walk_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// Flatten every file under `src` into `dest`, keyed by basename.
///
/// Returns the number of artifacts collected. Fails with an
/// `Internal` error when two source files share a basename.
pub fn flatten_artifacts(src: &Path, dest: &Path) -> Result<usize> {
    std::fs::create_dir_all(dest)?;

    let mut files = Vec::new();
    if src.exists() {
        walk_files(src, &mut files)?;
    }
    files.sort();

    let mut seen: BTreeMap<String, PathBuf> = BTreeMap::new();
    for file in &files {
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DsrError::Internal(format!("artifact has no name: {}", file.display())))?
            .to_string();

        if let Some(previous) = seen.get(&name) {
            return Err(DsrError::Internal(format!(
                "artifact basename collision: {} and {} both flatten to {name}",
                previous.display(),
                file.display()
            )));
        }

        std::fs::copy(file, dest.join(&name))?;
        seen.insert(name, file.clone());
    }

    debug!(count = seen.len(), dest = %dest.display(), "collected artifacts");
    Ok(seen.len())
}

/// Number of regular files directly inside `dir`.
pub fn count_artifacts(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                .count()
        })
        .unwrap_or(0)
}
