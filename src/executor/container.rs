use std::ffi::OsString;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::{debug, info};

use super::{capture_lines, path_env, ExecOutcome, Invocation, StageExecutor};
use crate::error::{BuildError, Result};
use crate::preflight;

const CONTAINER_SOURCE_DIR: &str = "/src";
const CONTAINER_ARTIFACT_DIR: &str = "/artifacts";
const CONTAINER_SCRIPT_PATH: &str = "/stagehand/build.sh";

/// Exit status docker and podman use when the engine itself failed.
const ENGINE_FAILURE_CODE: i32 = 125;
/// Exit statuses for "command cannot be invoked" and "command not found".
/// A script exits with these too, so they only count as engine failures when
/// the engine says so on stderr.
const INVOKE_FAILURE_CODES: [i32; 2] = [126, 127];
const INVOKE_FAILURE_MARKERS: [&str; 3] =
    ["OCI runtime", "executable file not found", "exec failed"];

/// Runs build scripts inside the stage's base image via `docker` or `podman`.
#[derive(Debug, Clone)]
pub struct ContainerExecutor {
    engine: String,
    shell: String,
    pull: bool,
}

impl ContainerExecutor {
    pub fn new(engine: impl Into<String>, shell: impl Into<String>, pull: bool) -> Self {
        Self {
            engine: engine.into(),
            shell: shell.into(),
            pull,
        }
    }

    fn engine_status(&self, args: &[&str]) -> bool {
        Command::new(&self.engine)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Arguments passed to the engine for `invocation`.
    pub fn container_args(&self, invocation: &Invocation<'_>) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "run".into(),
            "--rm".into(),
            "-w".into(),
            CONTAINER_SOURCE_DIR.into(),
        ];
        let mut bind = |host: &Path, target: &str, read_only: bool| {
            let mut spec = OsString::from(host.as_os_str());
            spec.push(":");
            spec.push(target);
            if read_only {
                spec.push(":ro");
            }
            args.push("-v".into());
            args.push(spec);
        };
        bind(invocation.source_root, CONTAINER_SOURCE_DIR, false);
        bind(invocation.artifact_dir, CONTAINER_ARTIFACT_DIR, false);
        bind(invocation.script_path, CONTAINER_SCRIPT_PATH, true);
        for cache in invocation.caches {
            bind(
                &cache.host_path,
                &cache.mount.target.display().to_string(),
                false,
            );
        }

        let env = path_env(
            invocation,
            Path::new(CONTAINER_SOURCE_DIR),
            Path::new(CONTAINER_ARTIFACT_DIR),
            |cache| cache.mount.target.display().to_string(),
        );
        for (key, value) in env {
            args.push("-e".into());
            args.push(format!("{key}={value}").into());
        }

        args.push(invocation.base_image.into());
        args.push(self.shell.as_str().into());
        args.push(CONTAINER_SCRIPT_PATH.into());
        args
    }
}

impl StageExecutor for ContainerExecutor {
    fn name(&self) -> &str {
        &self.engine
    }

    fn check_environment(&self, base_image: &str) -> Result<()> {
        preflight::check_required_tools(&[(self.engine.as_str(), "a container engine")])?;

        if self.engine_status(&["image", "inspect", base_image]) {
            debug!(engine = %self.engine, image = %base_image, "base image present");
            return Ok(());
        }
        if self.pull {
            info!(engine = %self.engine, image = %base_image, "pulling base image");
            if self.engine_status(&["pull", base_image]) {
                return Ok(());
            }
        }
        Err(BuildError::unavailable(format!(
            "base image '{}' is not available to {}",
            base_image, self.engine
        )))
    }

    fn execute(&self, invocation: &Invocation<'_>) -> Result<ExecOutcome> {
        let args = self.container_args(invocation);
        debug!(engine = %self.engine, stage = %invocation.stage_id, "starting stage container");

        let output = Command::new(&self.engine)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                BuildError::unavailable(format!(
                    "cannot start {} for stage '{}': {}",
                    self.engine, invocation.stage_id, e
                ))
            })?;

        if let Some(reason) = engine_failure(output.status.code(), &output.stderr) {
            return Err(BuildError::unavailable(format!(
                "{} could not run stage '{}': {}",
                self.engine, invocation.stage_id, reason
            )));
        }

        Ok(ExecOutcome {
            success: output.status.success(),
            code: output.status.code(),
            status: output.status.to_string(),
            log: capture_lines(&output.stdout, &output.stderr),
        })
    }
}

/// The engine's own error when `code` means the container never ran the
/// script.
fn engine_failure(code: Option<i32>, stderr: &[u8]) -> Option<String> {
    let code = code?;
    let stderr = String::from_utf8_lossy(stderr);
    let engine_said_so = INVOKE_FAILURE_CODES.contains(&code)
        && INVOKE_FAILURE_MARKERS.iter().any(|m| stderr.contains(m));
    if code != ENGINE_FAILURE_CODE && !engine_said_so {
        return None;
    }
    let reason = stderr
        .lines()
        .map(str::trim)
        .rev()
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("exit status {code}"));
    Some(reason)
}
