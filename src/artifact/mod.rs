//! Build artifacts: files a stage leaves in its artifact directory.
//!
//! - [`collect`] - enumerate a stage's outputs after its script finished
//! - [`sha256_file`] - content digest recorded in the artifact manifest
//! - [`bundle`] - deterministic `tar.zst` export of an image directory

pub mod bundle;

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;
use walkdir::WalkDir;

use crate::error::{BuildError, IoContext, Result};

/// A file produced by a stage, still inside that stage's workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Path relative to the artifact directory, `/`-separated.
    pub name: String,
    pub produced_by: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// An artifact that was handed off into the image directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactRecord {
    pub name: String,
    pub produced_by: String,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Regular files under `dir`, sorted by name. Symlinks and other special
/// files are not followed; each one skipped is logged.
pub fn collect(stage_id: &str, dir: &Path) -> Result<Vec<Artifact>> {
    let mut artifacts = Vec::new();
    if !dir.is_dir() {
        return Ok(artifacts);
    }

    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| BuildError::Io {
            context: format!("walking artifact directory '{}'", dir.display()),
            source: e.into(),
        })?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        if !file_type.is_file() {
            let kind = if file_type.is_symlink() { "symlink" } else { "special file" };
            warn!(
                stage = %stage_id,
                path = %entry.path().display(),
                kind,
                "skipping artifact that is not a regular file"
            );
            continue;
        }
        let rel = entry.path().strip_prefix(dir).map_err(|_| {
            BuildError::invalid_spec(format!(
                "artifact '{}' is outside '{}'",
                entry.path().display(),
                dir.display()
            ))
        })?;
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let size_bytes = entry
            .metadata()
            .map_err(|e| BuildError::Io {
                context: format!("reading metadata of '{}'", entry.path().display()),
                source: e.into(),
            })?
            .len();
        artifacts.push(Artifact {
            name,
            produced_by: stage_id.to_string(),
            path: entry.path().to_path_buf(),
            size_bytes,
        });
    }

    artifacts.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(artifacts)
}

/// Hex sha256 and size of a file.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).io_context(|| format!("opening '{}'", path.display()))?;
    let mut reader = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .io_context(|| format!("reading '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), total))
}

/// Copy `artifact` to `dest`, creating parent directories.
pub(crate) fn copy_to(artifact: &Artifact, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .io_context(|| format!("creating '{}'", parent.display()))?;
    }
    fs::copy(&artifact.path, dest).io_context(|| {
        format!(
            "copying artifact '{}' from stage '{}' to '{}'",
            artifact.name,
            artifact.produced_by,
            dest.display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    #[cfg(unix)]
    #[traced_test]
    #[test]
    fn symlinked_artifacts_are_skipped_with_a_warning() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(tmp.path().join("app-1.0.jar"), b"jar").unwrap();
        std::os::unix::fs::symlink(tmp.path().join("app-1.0.jar"), out.join("app.jar")).unwrap();
        fs::write(out.join("notes.txt"), b"notes").unwrap();

        let artifacts = collect("builder", &out).unwrap();
        let names: Vec<&str> = artifacts.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["notes.txt"]);
        assert!(logs_contain("skipping artifact that is not a regular file"));
        assert!(logs_contain("app.jar"));
    }

    #[test]
    fn collect_lists_nested_files_sorted() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path();
        fs::create_dir_all(out.join("lib")).unwrap();
        fs::write(out.join("app.jar"), b"jar").unwrap();
        fs::write(out.join("lib/dep.jar"), b"dep!").unwrap();
        fs::write(out.join("README"), b"").unwrap();

        let artifacts = collect("builder", out).unwrap();
        let names: Vec<&str> = artifacts.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["README", "app.jar", "lib/dep.jar"]);
        assert_eq!(artifacts[2].size_bytes, 4);
        assert!(artifacts.iter().all(|a| a.produced_by == "builder"));
    }

    #[test]
    fn collect_missing_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(collect("builder", &tmp.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn sha256_of_known_content() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("f");
        fs::write(&path, b"abc").unwrap();
        let (digest, size) = sha256_file(&path).unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(size, 3);
    }
}
