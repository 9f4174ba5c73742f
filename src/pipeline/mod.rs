//! End-to-end build pipeline.
//!
//! ```text
//! Planned ──> Resolving ──> Building ──> Handoff ──> Assembling ──> Complete
//!     │           │            │            │             │
//!     └───────────┴────────────┴────────────┴─────────────┴──────> Failed
//! ```
//!
//! Every build stage's script is resolved before anything runs, so a missing
//! script fails the build without touching caches or workspaces. Build stages
//! then run in declared order, followed by the optional runtime provisioning
//! stage. Artifacts cross into the image directory only through the handoff
//! filters, and the image spec is assembled last.

pub mod config;
mod paths;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{error, info};

use crate::cache::{self, CacheStore};
use crate::error::{BuildError, IoContext, PipelineError};
use crate::executor::StageExecutor;
use crate::handoff;
use crate::image::{self, RuntimeImageSpec, StageMeta};
use crate::script::{HttpFetcher, ScriptFetcher, ScriptResolver};
use crate::stage::{Stage, StageOutput, StagePlan, StageRunner};

pub use config::{BuildSpec, ExecutorConfig};

pub const IMAGE_DIR: &str = "image";
pub const IMAGE_SPEC_FILENAME: &str = "image-spec.json";
pub const BUILD_LOG_FILENAME: &str = "build.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Planned,
    Resolving,
    Building,
    Handoff,
    Assembling,
    Complete,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Complete | PipelineState::Failed)
    }

    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (Complete | Failed, _) => false,
            (_, Failed) => true,
            (Planned, Resolving)
            | (Resolving, Building)
            | (Building, Handoff)
            | (Handoff, Assembling)
            | (Assembling, Complete) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Planned => "planned",
            PipelineState::Resolving => "resolving",
            PipelineState::Building => "building",
            PipelineState::Handoff => "handoff",
            PipelineState::Assembling => "assembling",
            PipelineState::Complete => "complete",
            PipelineState::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host locations used by one build.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Parent of the per-stage workspaces.
    pub work_root: PathBuf,
    /// Parent of every project's cache store.
    pub cache_root: PathBuf,
    /// Run directory receiving `image/`, `image-spec.json` and `build.log`.
    pub output_dir: PathBuf,
    pub keep_workspaces: bool,
}

impl BuildOptions {
    /// Same locations anchored at the current directory, so they stay valid
    /// once handed to a script running elsewhere.
    pub fn absolute(&self) -> Result<Self, BuildError> {
        Ok(Self {
            work_root: paths::absolute_path(&self.work_root)?,
            cache_root: paths::absolute_path(&self.cache_root)?,
            output_dir: paths::absolute_path(&self.output_dir)?,
            keep_workspaces: self.keep_workspaces,
        })
    }
}

#[derive(Debug)]
pub struct BuildReport {
    pub image_spec: RuntimeImageSpec,
    pub image_dir: PathBuf,
    pub spec_path: PathBuf,
    pub log_path: PathBuf,
    pub states: Vec<PipelineState>,
}

/// Script metadata captured before the stage consumes its script.
struct Bound {
    stage: Stage,
    meta: StageMeta,
}

pub struct Pipeline<'a> {
    spec: &'a BuildSpec,
    source_root: PathBuf,
    executor: Box<dyn StageExecutor>,
    fetcher: Box<dyn ScriptFetcher>,
    options: BuildOptions,
    state: PipelineState,
    history: Vec<PipelineState>,
    log: Vec<String>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        spec: &'a BuildSpec,
        executor: Box<dyn StageExecutor>,
        fetcher: Box<dyn ScriptFetcher>,
        options: BuildOptions,
    ) -> Self {
        Self {
            spec,
            source_root: spec.source_root.clone(),
            executor,
            fetcher,
            options,
            state: PipelineState::Planned,
            history: vec![PipelineState::Planned],
            log: Vec::new(),
        }
    }

    /// Pipeline with the executor the spec asks for and an HTTP fetcher.
    pub fn from_spec(spec: &'a BuildSpec, options: BuildOptions) -> Result<Self, BuildError> {
        let fetcher = HttpFetcher::new(spec.fetch_timeout)?;
        Ok(Self::new(spec, spec.executor.build(), Box::new(fetcher), options))
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Every state entered so far, starting with `Planned`.
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    fn transition(&mut self, next: PipelineState) {
        if !self.state.can_transition_to(next) {
            return;
        }
        info!(from = %self.state, to = %next, "pipeline state");
        self.state = next;
        self.history.push(next);
    }

    pub fn run(&mut self) -> Result<BuildReport, PipelineError> {
        if self.state != PipelineState::Planned {
            return Err(BuildError::invalid_spec(format!(
                "pipeline already ran (state: {})",
                self.state
            ))
            .into());
        }
        match self.execute() {
            Ok(report) => Ok(report),
            Err(err) => {
                self.transition(PipelineState::Failed);
                error!(error = %err, "build failed");
                self.log.push(format!("build failed: {err}"));
                self.log.extend(err.log_tail.iter().cloned());
                // The original error matters more than a failure to persist the log.
                let _ = self.write_log();
                Err(err)
            }
        }
    }

    fn execute(&mut self) -> Result<BuildReport, PipelineError> {
        let spec = self.spec;
        self.options = self.options.absolute()?;
        self.source_root = paths::absolute_path(&spec.source_root)?;

        self.transition(PipelineState::Resolving);
        let mut bound = Vec::with_capacity(spec.stages.len() + 1);
        for plan in &spec.stages {
            bound.push(self.resolve(plan)?);
        }
        if spec.runtime.provision {
            bound.push(self.resolve(&spec.runtime_stage)?);
        }

        self.transition(PipelineState::Building);
        let store = CacheStore::open(
            &self.options.cache_root,
            &cache::project_key(&self.source_root),
        );
        let runner = StageRunner::new(
            self.executor.as_ref(),
            &store,
            &self.source_root,
            &self.options.work_root,
        )
        .keep_workspaces(self.options.keep_workspaces);

        let mut finished: Vec<(StageOutput, StageMeta, &StagePlan)> = Vec::new();
        for Bound { stage, meta } in bound {
            let plan = self.plan_for(&stage.id);
            let output = runner.run(stage)?;
            for line in output.log() {
                self.log.push(format!("[{}] {}", output.stage_id(), line));
            }
            finished.push((output, meta, plan));
        }

        self.transition(PipelineState::Handoff);
        let image_dir = self.options.output_dir.join(IMAGE_DIR);
        paths::recreate_dir(&image_dir)?;
        let mut seen = BTreeMap::new();
        let mut records = Vec::new();
        let mut metas = Vec::new();
        for (output, mut meta, plan) in finished {
            let selected = handoff::select(&output, &plan.handoff);
            let transferred = handoff::transfer(&selected, &image_dir, &mut seen)
                .map_err(|e| PipelineError::in_stage(output.stage_id(), e))?;
            meta.artifacts_produced = output.artifacts().len();
            meta.artifacts_handed_off = transferred.len();
            records.extend(transferred);
            metas.push(meta);
            // Dropping the output removes the stage workspace.
        }

        self.transition(PipelineState::Assembling);
        let image_spec = image::assemble(records, &spec.flags, metas, &spec.runtime)?;
        let spec_path = self.options.output_dir.join(IMAGE_SPEC_FILENAME);
        write_json(&spec_path, &image_spec)?;
        let log_path = self.write_log()?;

        self.transition(PipelineState::Complete);
        info!(
            artifacts = image_spec.artifacts.len(),
            image_dir = %image_dir.display(),
            "build complete"
        );

        Ok(BuildReport {
            image_spec,
            image_dir,
            spec_path,
            log_path,
            states: self.history.clone(),
        })
    }

    fn resolve(&self, plan: &StagePlan) -> Result<Bound, PipelineError> {
        let resolver = ScriptResolver::new(&self.source_root, self.fetcher.as_ref())
            .with_flags(&self.spec.flags);
        let script = resolver
            .resolve(plan.search_order(&self.spec.search_order))
            .map_err(|e| PipelineError::in_stage(&plan.id, e))?;
        let meta = StageMeta {
            id: plan.id.clone(),
            role: plan.role,
            base_image: plan.base_image.clone(),
            script_origin: script.origin(),
            script_location: script.source_location().to_string(),
            script_sha256: script.sha256(),
            artifacts_produced: 0,
            artifacts_handed_off: 0,
        };
        Ok(Bound {
            stage: plan.bind(&self.spec.flags, script),
            meta,
        })
    }

    fn plan_for(&self, id: &str) -> &'a StagePlan {
        let spec = self.spec;
        spec.stages
            .iter()
            .find(|p| p.id == id)
            .unwrap_or(&spec.runtime_stage)
    }

    fn write_log(&self) -> Result<PathBuf, BuildError> {
        let dir = &self.options.output_dir;
        fs::create_dir_all(dir).io_context(|| format!("creating '{}'", dir.display()))?;
        let path = dir.join(BUILD_LOG_FILENAME);
        let mut text = self.log.join("\n");
        text.push('\n');
        fs::write(&path, text).io_context(|| format!("writing '{}'", path.display()))?;
        Ok(path)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), BuildError> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(io::Error::from)
        .io_context(|| format!("serializing '{}'", path.display()))?;
    fs::write(path, bytes).io_context(|| format!("writing '{}'", path.display()))
}
