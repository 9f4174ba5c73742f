use std::process::{Command, Stdio};

use tracing::debug;

use super::{capture_lines, path_env, ExecOutcome, Invocation, StageExecutor};
use crate::error::{BuildError, Result};
use crate::preflight;

pub const DEFAULT_SHELL: &str = "bash";

/// Runs build scripts directly on the host.
///
/// The base image reference is recorded but not enforced; the host itself is
/// the build environment.
#[derive(Debug, Clone)]
pub struct HostExecutor {
    shell: String,
}

impl HostExecutor {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for HostExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_SHELL)
    }
}

impl StageExecutor for HostExecutor {
    fn name(&self) -> &str {
        "host"
    }

    fn check_environment(&self, base_image: &str) -> Result<()> {
        debug!(shell = %self.shell, base_image = %base_image, "checking host interpreter");
        preflight::check_required_tools(&[(self.shell.as_str(), "a POSIX shell")])
    }

    fn execute(&self, invocation: &Invocation<'_>) -> Result<ExecOutcome> {
        let env = path_env(
            invocation,
            invocation.source_root,
            invocation.artifact_dir,
            |cache| cache.host_path.display().to_string(),
        );

        let output = Command::new(&self.shell)
            .arg(invocation.script_path)
            .current_dir(invocation.source_root)
            .envs(env)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                BuildError::unavailable(format!(
                    "cannot start '{}' for stage '{}': {}",
                    self.shell, invocation.stage_id, e
                ))
            })?;

        Ok(ExecOutcome {
            success: output.status.success(),
            code: output.status.code(),
            status: output.status.to_string(),
            log: capture_lines(&output.stdout, &output.stderr),
        })
    }
}
