//! Parameterized container image builds.
//!
//! Given a source project and a set of feature flags, `stagehand` finds the
//! build script to run, executes it in isolated build stages with shared
//! caches, and assembles a runtime image description from the artifacts the
//! stages explicitly hand off.
//!
//! # Architecture
//!
//! ```text
//! BuildSpec (TOML) ──> flags::FlagSchema ──> FeatureFlagSet
//!                 └──> cache::plan ───────> [CacheMount]
//!
//! pipeline::Pipeline
//!     ├── script::ScriptResolver   local candidates, then remote fallback
//!     ├── stage::StageRunner       workspace + caches + executor
//!     │       └── executor::{HostExecutor, ContainerExecutor}
//!     ├── handoff::{select, transfer}
//!     └── image::assemble ──> RuntimeImageSpec (image-spec.json)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use stagehand::pipeline::{BuildOptions, BuildSpec, Pipeline};
//! use std::path::Path;
//!
//! let spec = BuildSpec::load(Path::new("stagehand.toml"), &[])?;
//! let options = BuildOptions {
//!     work_root: "/tmp/stagehand/work".into(),
//!     cache_root: stagehand::cache::default_cache_root(),
//!     output_dir: "out/run-1".into(),
//!     keep_workspaces: false,
//! };
//! let report = Pipeline::from_spec(&spec, options)?.run()?;
//! println!("{} artifacts", report.image_spec.artifacts.len());
//! ```

pub mod artifact;
pub mod cache;
pub mod error;
pub mod executor;
pub mod flags;
pub mod handoff;
pub mod image;
pub mod pipeline;
pub mod preflight;
pub mod script;
pub mod stage;
pub mod stage_runs;

pub use error::{BuildError, ErrorKind, PipelineError};
pub use flags::FeatureFlagSet;
pub use pipeline::{BuildOptions, BuildReport, BuildSpec, Pipeline, PipelineState};
