use std::fs;
use std::path::Path;

use tracing::{debug, error, info};

use super::{Stage, StageOutput, StageWorkspace};
use crate::artifact;
use crate::cache::{AttachedCache, CacheStore};
use crate::error::{BuildError, IoContext, PipelineError};
use crate::executor::{Invocation, StageExecutor};

/// Executes stages one at a time through a [`StageExecutor`].
pub struct StageRunner<'a> {
    executor: &'a dyn StageExecutor,
    caches: &'a CacheStore,
    source_root: &'a Path,
    work_root: &'a Path,
    keep_workspaces: bool,
}

impl<'a> StageRunner<'a> {
    pub fn new(
        executor: &'a dyn StageExecutor,
        caches: &'a CacheStore,
        source_root: &'a Path,
        work_root: &'a Path,
    ) -> Self {
        Self {
            executor,
            caches,
            source_root,
            work_root,
            keep_workspaces: false,
        }
    }

    /// Keep stage workspaces on disk after their outputs are dropped.
    pub fn keep_workspaces(mut self, keep: bool) -> Self {
        self.keep_workspaces = keep;
        self
    }

    /// Run `stage` to completion. Stages are never retried.
    pub fn run(&self, stage: Stage) -> Result<StageOutput, PipelineError> {
        let in_stage = |err: BuildError| PipelineError::in_stage(&stage.id, err);

        info!(
            stage = %stage.id,
            role = %stage.role,
            executor = %self.executor.name(),
            base_image = %stage.base_image,
            origin = %stage.script_origin(),
            "running stage"
        );

        self.executor
            .check_environment(&stage.base_image)
            .map_err(in_stage)?;

        let workspace = StageWorkspace::create(self.work_root, &stage.id, self.keep_workspaces)
            .map_err(in_stage)?;
        let script_path = workspace.script_path();
        write_script(&script_path, stage.script.content()).map_err(in_stage)?;

        let attached = self.attach_caches(&stage, workspace.root()).map_err(in_stage)?;
        let env = stage.script_env();
        let artifact_dir = workspace.artifact_dir();

        let outcome = self.executor.execute(&Invocation {
            stage_id: &stage.id,
            base_image: &stage.base_image,
            script_path: &script_path,
            source_root: self.source_root,
            artifact_dir: &artifact_dir,
            env: &env,
            caches: &attached,
        });
        // Locks are released as soon as the script is done, success or not.
        drop(attached);
        let outcome = outcome.map_err(in_stage)?;

        for line in &outcome.log {
            debug!(stage = %stage.id, "{}", line);
        }

        if !outcome.success {
            error!(stage = %stage.id, status = %outcome.status, "build script failed");
            return Err(in_stage(BuildError::ScriptFailed {
                status: outcome.status,
                code: outcome.code,
            })
            .with_log_tail(&outcome.log));
        }

        let artifacts = artifact::collect(&stage.id, &artifact_dir)
            .map_err(|e| in_stage(e).with_log_tail(&outcome.log))?;
        info!(stage = %stage.id, artifacts = artifacts.len(), "stage complete");

        Ok(StageOutput::new(
            stage.id.clone(),
            workspace,
            artifacts,
            outcome.log,
        ))
    }

    fn attach_caches(
        &self,
        stage: &Stage,
        scratch: &Path,
    ) -> Result<Vec<AttachedCache>, BuildError> {
        stage
            .mounts
            .iter()
            .map(|mount| self.caches.attach(mount, scratch))
            .collect()
    }
}

fn write_script(path: &Path, content: &[u8]) -> Result<(), BuildError> {
    fs::write(path, content).io_context(|| format!("writing build script '{}'", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
            .io_context(|| format!("making '{}' executable", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheMount, SharingMode};
    use crate::error::ErrorKind;
    use crate::executor::HostExecutor;
    use crate::flags;
    use crate::handoff::HandoffFilter;
    use crate::script::fetch::{FetchError, ScriptFetcher};
    use crate::script::{ScriptCandidate, ScriptResolver};
    use crate::stage::{StagePlan, StageRole};
    use tempfile::TempDir;

    struct Offline;

    impl ScriptFetcher for Offline {
        fn fetch(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
            Err(FetchError::Transport("offline".to_string()))
        }
    }

    struct Env {
        tmp: TempDir,
        source: std::path::PathBuf,
    }

    impl Env {
        fn new(script: &str) -> Self {
            let tmp = TempDir::new().unwrap();
            let source = tmp.path().join("project");
            fs::create_dir_all(&source).unwrap();
            fs::write(source.join("build.sh"), script).unwrap();
            Self { tmp, source }
        }

        fn stage(&self, mounts: Vec<CacheMount>) -> Stage {
            let flags = flags::validate(&Default::default()).unwrap();
            let script = ScriptResolver::new(&self.source, &Offline)
                .resolve(&[ScriptCandidate::Project("build.sh".into())])
                .unwrap();
            StagePlan {
                id: "builder".to_string(),
                role: StageRole::Build,
                base_image: "maven:3".to_string(),
                mounts,
                search_order: None,
                handoff: HandoffFilter::default(),
            }
            .bind(&flags, script)
        }
    }

    #[test]
    fn successful_stage_yields_artifacts_and_log() {
        let env = Env::new(
            "echo \"stage=$STAGE_ID origin=$BUILD_SCRIPT_ORIGIN\"\n\
             mkdir -p \"$ARTIFACT_DIR/lib\"\n\
             echo jar > \"$ARTIFACT_DIR/app.jar\"\n\
             echo dep > \"$ARTIFACT_DIR/lib/dep.jar\"\n\
             echo cached > \"$CACHE_DIR_M2/marker\"\n",
        );
        let store = CacheStore::open(&env.tmp.path().join("caches"), "proj");
        let executor = HostExecutor::new("sh");
        let work = env.tmp.path().join("work");
        let runner = StageRunner::new(&executor, &store, &env.source, &work);

        let output = runner
            .run(env.stage(vec![CacheMount::new("m2", "/root/.m2", SharingMode::Locked)]))
            .unwrap();

        let names: Vec<&str> = output.artifacts().iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["app.jar", "lib/dep.jar"]);
        assert_eq!(output.log()[0], "stage=builder origin=project_default");
        assert!(store.root().join("data/m2/marker").is_file());

        let workspace = output.workspace().to_path_buf();
        drop(output);
        assert!(!workspace.exists());
    }

    #[test]
    fn failing_script_is_script_failed_with_tail() {
        let env = Env::new("for i in $(seq 1 30); do echo line $i; done\nexit 7\n");
        let store = CacheStore::open(&env.tmp.path().join("caches"), "proj");
        let executor = HostExecutor::new("sh");
        let work = env.tmp.path().join("work");

        let err = StageRunner::new(&executor, &store, &env.source, &work)
            .run(env.stage(Vec::new()))
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ScriptFailed);
        assert_eq!(err.stage.as_deref(), Some("builder"));
        assert_eq!(err.log_tail.len(), crate::error::LOG_TAIL_LINES);
        assert_eq!(err.log_tail.last().map(String::as_str), Some("line 30"));
        assert!(matches!(err.error, BuildError::ScriptFailed { code: Some(7), .. }));
        assert!(!work.join("builder").exists());
    }

    #[test]
    fn missing_interpreter_fails_before_workspace() {
        let env = Env::new("echo hi\n");
        let store = CacheStore::open(&env.tmp.path().join("caches"), "proj");
        let executor = HostExecutor::new("no-such-shell-4711");
        let work = env.tmp.path().join("work");

        let err = StageRunner::new(&executor, &store, &env.source, &work)
            .run(env.stage(Vec::new()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EnvironmentUnavailable);
        assert!(!work.exists());
        assert!(!store.root().exists());
    }
}
