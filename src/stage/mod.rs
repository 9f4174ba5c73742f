//! Build stages.
//!
//! A [`StagePlan`] is the validated description of a stage from the build
//! spec. Binding a plan to a resolved script yields a [`Stage`], which the
//! [`runner::StageRunner`] consumes exactly once. Each run gets a private
//! [`StageWorkspace`]; its artifacts stay inside that workspace until they are
//! explicitly handed off, and the workspace is deleted when the
//! [`StageOutput`] owning it is dropped.

pub mod runner;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::artifact::Artifact;
use crate::cache::CacheMount;
use crate::error::{BuildError, Result};
use crate::flags::FeatureFlagSet;
use crate::handoff::HandoffFilter;
use crate::script::{ResolvedScript, ScriptCandidate, ScriptOrigin};

pub use runner::StageRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRole {
    Build,
    Runtime,
}

impl StageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            StageRole::Build => "build",
            StageRole::Runtime => "runtime",
        }
    }
}

impl fmt::Display for StageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    pub id: String,
    pub role: StageRole,
    pub base_image: String,
    /// Planned mounts for this stage, already checked against every other stage.
    pub mounts: Vec<CacheMount>,
    /// Stage-specific search order; `None` uses the build-wide one.
    pub search_order: Option<Vec<ScriptCandidate>>,
    pub handoff: HandoffFilter,
}

impl StagePlan {
    pub fn search_order<'a>(&'a self, default: &'a [ScriptCandidate]) -> &'a [ScriptCandidate] {
        self.search_order.as_deref().unwrap_or(default)
    }

    pub fn bind(&self, flags: &FeatureFlagSet, script: ResolvedScript) -> Stage {
        Stage {
            id: self.id.clone(),
            role: self.role,
            base_image: self.base_image.clone(),
            flags: flags.clone(),
            mounts: self.mounts.clone(),
            script,
        }
    }
}

/// A stage ready to execute. Consumed by [`StageRunner::run`].
#[derive(Debug)]
pub struct Stage {
    pub id: String,
    pub role: StageRole,
    pub base_image: String,
    pub flags: FeatureFlagSet,
    pub mounts: Vec<CacheMount>,
    pub script: ResolvedScript,
}

impl Stage {
    pub fn script_origin(&self) -> ScriptOrigin {
        self.script.origin()
    }

    /// Flag variables plus stage identity, as exported to the script.
    pub fn script_env(&self) -> Vec<(String, String)> {
        let mut env = self.flags.script_env();
        env.push(("STAGE_ID".to_string(), self.id.clone()));
        env.push(("STAGE_ROLE".to_string(), self.role.as_str().to_string()));
        env.push((
            "BUILD_SCRIPT_ORIGIN".to_string(),
            self.script.origin().as_str().to_string(),
        ));
        env
    }
}

/// Private scratch directory of one stage run.
///
/// Layout: `script/build.sh`, `out/` (the artifact directory) and `caches/`
/// (exclusive cache mounts).
#[derive(Debug)]
pub struct StageWorkspace {
    root: PathBuf,
    keep: bool,
}

impl StageWorkspace {
    /// Create a fresh workspace at `work_root/<stage_id>`, replacing leftovers
    /// of an earlier run.
    pub fn create(work_root: &Path, stage_id: &str, keep: bool) -> Result<Self> {
        let root = work_root.join(stage_id);
        let unavailable = |e: std::io::Error| {
            BuildError::unavailable(format!(
                "cannot create workspace '{}': {}",
                root.display(),
                e
            ))
        };
        if root.exists() {
            fs::remove_dir_all(&root).map_err(unavailable)?;
        }
        fs::create_dir_all(root.join("script")).map_err(unavailable)?;
        fs::create_dir_all(root.join("out")).map_err(unavailable)?;
        debug!(workspace = %root.display(), "created stage workspace");
        Ok(Self { root, keep })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.root.join("out")
    }

    pub fn script_path(&self) -> PathBuf {
        self.root.join("script").join("build.sh")
    }
}

impl Drop for StageWorkspace {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(workspace = %self.root.display(), error = %e, "failed to remove stage workspace");
            }
        }
    }
}

/// What a successful stage leaves behind.
#[derive(Debug)]
pub struct StageOutput {
    stage_id: String,
    // Artifacts point into the workspace, so it must outlive them.
    workspace: StageWorkspace,
    artifacts: Vec<Artifact>,
    log: Vec<String>,
}

impl StageOutput {
    pub fn new(
        stage_id: impl Into<String>,
        workspace: StageWorkspace,
        artifacts: Vec<Artifact>,
        log: Vec<String>,
    ) -> Self {
        Self {
            stage_id: stage_id.into(),
            workspace,
            artifacts,
            log,
        }
    }

    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn log(&self) -> &[String] {
        &self.log
    }

    pub fn workspace(&self) -> &Path {
        self.workspace.root()
    }
}
