//! Stage executors - run a materialized build script somewhere.
//!
//! The runner prepares everything on the host (workspace, script file,
//! attached caches, flag environment) and hands an [`Invocation`] to a
//! [`StageExecutor`]. Executors decide where the script runs and how host
//! paths appear to it:
//!
//! - [`host::HostExecutor`] runs the script directly with a local shell.
//! - [`container::ContainerExecutor`] runs it inside the stage's base image
//!   through an external container engine.

pub mod container;
pub mod host;

use std::path::Path;

use crate::cache::AttachedCache;
use crate::error::Result;

pub use container::ContainerExecutor;
pub use host::HostExecutor;

/// Everything an executor needs to run one stage.
#[derive(Debug)]
pub struct Invocation<'a> {
    pub stage_id: &'a str,
    pub base_image: &'a str,
    /// Materialized script on the host.
    pub script_path: &'a Path,
    pub source_root: &'a Path,
    /// Host directory the script must write its artifacts into.
    pub artifact_dir: &'a Path,
    /// Flag and stage variables; path variables are added by the executor.
    pub env: &'a [(String, String)],
    pub caches: &'a [AttachedCache],
}

/// Result of a finished script.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub success: bool,
    pub code: Option<i32>,
    /// Human-readable termination status, e.g. `exit status: 2`.
    pub status: String,
    /// Captured stdout followed by stderr, one entry per line.
    pub log: Vec<String>,
}

pub trait StageExecutor {
    fn name(&self) -> &str;

    /// Fail with `EnvironmentUnavailable` when the stage cannot run at all.
    fn check_environment(&self, base_image: &str) -> Result<()>;

    fn execute(&self, invocation: &Invocation<'_>) -> Result<ExecOutcome>;
}

/// Path variables as seen from wherever the script runs.
pub(crate) fn path_env<F>(
    invocation: &Invocation<'_>,
    source_dir: &Path,
    artifact_dir: &Path,
    cache_dir: F,
) -> Vec<(String, String)>
where
    F: Fn(&AttachedCache) -> String,
{
    let mut env: Vec<(String, String)> = invocation.env.to_vec();
    env.push(("SOURCE_DIR".to_string(), source_dir.display().to_string()));
    env.push((
        "ARTIFACT_DIR".to_string(),
        artifact_dir.display().to_string(),
    ));
    for cache in invocation.caches {
        env.push((cache.mount.env_var(), cache_dir(cache)));
    }
    env
}

/// Split captured process output into log lines.
pub(crate) fn capture_lines(stdout: &[u8], stderr: &[u8]) -> Vec<String> {
    let mut lines = Vec::new();
    for stream in [stdout, stderr] {
        lines.extend(String::from_utf8_lossy(stream).lines().map(str::to_string));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_keeps_stdout_before_stderr() {
        let lines = capture_lines(b"one\ntwo\n", b"oops\n");
        assert_eq!(lines, vec!["one", "two", "oops"]);
    }

    #[test]
    fn capture_tolerates_invalid_utf8() {
        let lines = capture_lines(&[b'a', 0xff, b'\n'], b"");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with('a'));
    }
}
