use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{IoContext, Result};

pub(crate) fn resolve_repo_path(repo_root: &Path, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        repo_root.join(candidate)
    }
}

/// `path` anchored at the current directory. Does not touch the filesystem.
pub(crate) fn absolute_path(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).io_context(|| format!("resolving '{}'", path.display()))
}

/// Remove `dir` if present and create it empty.
pub(crate) fn recreate_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).io_context(|| format!("clearing '{}'", dir.display()))?;
    }
    fs::create_dir_all(dir).io_context(|| format!("creating '{}'", dir.display()))
}
