use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use stagehand::artifact::bundle;
use stagehand::cache;
use stagehand::flags::{self, RawFlagValue};
use stagehand::pipeline::{BuildOptions, BuildSpec, Pipeline};
use stagehand::script::{HttpFetcher, ScriptResolver};
use stagehand::stage_runs::{self, RunMetadata};
use stagehand::{BuildError, PipelineError};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_SPEC: &str = "stagehand.toml";
const DEFAULT_OUT: &str = "out";
const BUNDLE_FILENAME: &str = "image.tar.zst";

/// stagehand - parameterized container image builds
#[derive(Parser)]
#[command(name = "stagehand")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full build
    Build {
        #[arg(short, long, default_value = DEFAULT_SPEC)]
        spec: PathBuf,

        /// Flag override, e.g. --flag installFonts=true (repeatable)
        #[arg(long = "flag", value_name = "NAME=VALUE")]
        flags: Vec<String>,

        /// Directory holding one subdirectory per run
        #[arg(long, default_value = DEFAULT_OUT)]
        out: PathBuf,

        /// Stage workspace root (default: <out>/.work/<run id>)
        #[arg(long)]
        work: Option<PathBuf>,

        /// Cache root shared by all projects
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Leave stage workspaces on disk for inspection
        #[arg(long)]
        keep_workspaces: bool,

        /// Also write image.tar.zst next to the image directory
        #[arg(long)]
        bundle: bool,
    },

    /// Validate a build spec and print the resulting plan
    Plan {
        #[arg(short, long, default_value = DEFAULT_SPEC)]
        spec: PathBuf,

        #[arg(long = "flag", value_name = "NAME=VALUE")]
        flags: Vec<String>,
    },

    /// Resolve build scripts without running them
    Resolve {
        #[arg(short, long, default_value = DEFAULT_SPEC)]
        spec: PathBuf,

        #[arg(long = "flag", value_name = "NAME=VALUE")]
        flags: Vec<String>,

        /// Only resolve this stage
        #[arg(long)]
        stage: Option<String>,
    },

    /// Inspect or clean up previous runs
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },
}

#[derive(Subcommand)]
enum RunsCommand {
    /// List runs, newest first
    List {
        #[arg(long, default_value = DEFAULT_OUT)]
        out: PathBuf,
    },
    /// Delete all but the newest runs
    Prune {
        #[arg(long, default_value = DEFAULT_OUT)]
        out: PathBuf,

        #[arg(long, default_value_t = 5)]
        keep: usize,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Build {
            spec,
            flags,
            out,
            work,
            cache_dir,
            keep_workspaces,
            bundle,
        } => cmd_build(
            &spec,
            &flags,
            &out,
            work,
            cache_dir,
            keep_workspaces,
            bundle,
        ),
        Commands::Plan { spec, flags } => cmd_plan(&spec, &flags),
        Commands::Resolve { spec, flags, stage } => cmd_resolve(&spec, &flags, stage.as_deref()),
        Commands::Runs { command } => match command {
            RunsCommand::List { out } => cmd_runs_list(&out),
            RunsCommand::Prune { out, keep } => cmd_runs_prune(&out, keep),
        },
    }
}

/// Typed build failures keep their documented exit code; anything else is 1.
fn exit_code(err: &anyhow::Error) -> u8 {
    let code = if let Some(e) = err.downcast_ref::<PipelineError>() {
        e.exit_code()
    } else if let Some(e) = err.downcast_ref::<BuildError>() {
        e.exit_code()
    } else {
        1
    };
    u8::try_from(code).unwrap_or(1)
}

fn load_spec(path: &Path, raw_overrides: &[String]) -> Result<BuildSpec> {
    let overrides = raw_overrides
        .iter()
        .map(|arg| flags::parse_override(arg))
        .collect::<Result<Vec<(String, RawFlagValue)>, BuildError>>()?;
    Ok(BuildSpec::load(path, &overrides)?)
}

fn cmd_build(
    spec_path: &Path,
    raw_overrides: &[String],
    out: &Path,
    work: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    keep_workspaces: bool,
    make_bundle: bool,
) -> Result<()> {
    let spec = load_spec(spec_path, raw_overrides)?;

    let run_id = stage_runs::new_run_id()?;
    let run_dir = out.join(&run_id);
    let work_root = work.unwrap_or_else(|| out.join(".work").join(&run_id));
    let options = BuildOptions {
        work_root: work_root.clone(),
        cache_root: cache_dir.unwrap_or_else(cache::default_cache_root),
        output_dir: run_dir.clone(),
        keep_workspaces,
    };
    // Nothing is recorded until the pipeline exists, so every `running`
    // manifest is later rewritten with the outcome.
    let mut pipeline = Pipeline::from_spec(&spec, options)?;

    let metadata = RunMetadata::started(&run_id, spec.profile())?;
    stage_runs::write_manifest(&run_dir, &metadata)?;
    info!(run_id = %run_id, run_dir = %run_dir.display(), "starting build");

    let result = pipeline.run();

    if !keep_workspaces {
        // Only removes the root when every stage workspace is already gone.
        let _ = fs::remove_dir(&work_root);
    }

    let report = match result {
        Ok(report) => report,
        Err(err) => {
            stage_runs::write_manifest(&run_dir, &metadata.failed(&err)?)?;
            if !err.log_tail.is_empty() {
                eprintln!("--- last {} log lines ---", err.log_tail.len());
                for line in &err.log_tail {
                    eprintln!("{line}");
                }
            }
            return Err(err.into());
        }
    };

    if make_bundle {
        let bundle_path = run_dir.join(BUNDLE_FILENAME);
        if let Err(err) = bundle::create_tar_zst(&report.image_dir, &bundle_path) {
            let err = PipelineError::new(BuildError::Io {
                context: format!("bundling '{}'", report.image_dir.display()),
                source: io::Error::other(format!("{err:#}")),
            });
            stage_runs::write_manifest(&run_dir, &metadata.failed(&err)?)?;
            return Err(err.into());
        }
        info!(bundle = %bundle_path.display(), "wrote image bundle");
    }

    stage_runs::write_manifest(&run_dir, &metadata.succeeded()?)?;

    println!("run:        {run_id}");
    println!("image dir:  {}", report.image_dir.display());
    println!("image spec: {}", report.spec_path.display());
    println!("build log:  {}", report.log_path.display());
    for record in &report.image_spec.artifacts {
        println!(
            "  {} ({} bytes, from {})",
            record.name, record.size_bytes, record.produced_by
        );
    }
    Ok(())
}

fn cmd_plan(spec_path: &Path, raw_overrides: &[String]) -> Result<()> {
    let spec = load_spec(spec_path, raw_overrides)?;

    println!("source root: {}", spec.source_root.display());
    println!("profile:     {}", spec.profile());
    println!("executor:    {:?}", spec.executor);
    println!("flags:");
    for (name, value) in spec.flags.iter() {
        println!("  {name} = {value}");
    }
    println!("caches:");
    for mount in &spec.cache_mounts {
        println!(
            "  {} -> {} ({})",
            mount.id,
            mount.target.display(),
            mount.sharing
        );
    }
    println!("stages:");
    let runtime = spec.runtime.provision.then_some(&spec.runtime_stage);
    for plan in spec.stages.iter().chain(runtime) {
        let order: Vec<String> = plan
            .search_order(&spec.search_order)
            .iter()
            .map(ToString::to_string)
            .collect();
        println!("  {} [{}] on {}", plan.id, plan.role, plan.base_image);
        println!("    scripts: {}", order.join(", "));
        if !plan.handoff.include.is_empty() || !plan.handoff.exclude.is_empty() {
            println!(
                "    handoff: include [{}] exclude [{}]",
                plan.handoff.include.join(", "),
                plan.handoff.exclude.join(", ")
            );
        }
    }
    println!("runtime image: {}", spec.runtime.base_image);
    Ok(())
}

fn cmd_resolve(spec_path: &Path, raw_overrides: &[String], only: Option<&str>) -> Result<()> {
    let spec = load_spec(spec_path, raw_overrides)?;
    let fetcher = HttpFetcher::new(spec.fetch_timeout)?;
    let resolver = ScriptResolver::new(&spec.source_root, &fetcher).with_flags(&spec.flags);

    let plans: Vec<_> = spec
        .stages
        .iter()
        .chain(std::iter::once(&spec.runtime_stage))
        .filter(|plan| only.map_or(true, |id| plan.id == id))
        .collect();
    if plans.is_empty() {
        bail!("no stage named '{}'", only.unwrap_or_default());
    }

    for plan in plans {
        let script = resolver
            .resolve(plan.search_order(&spec.search_order))
            .map_err(|e| PipelineError::in_stage(&plan.id, e))?;
        println!(
            "{}: {} {} sha256={}",
            plan.id,
            script.origin(),
            script.source_location(),
            script.sha256()
        );
    }
    Ok(())
}

fn cmd_runs_list(out: &Path) -> Result<()> {
    let runs = stage_runs::load_runs_metadata(out)?;
    if runs.is_empty() {
        println!("no runs under '{}'", out.display());
        return Ok(());
    }
    match stage_runs::latest_successful_run_id(out)? {
        Some(run_id) => println!("latest successful: {run_id}"),
        None => println!("latest successful: none"),
    }
    for run in runs {
        let finished = run.finished_at_utc.as_deref().unwrap_or("-");
        let detail = match (&run.error_kind, &run.failed_stage) {
            (Some(kind), Some(stage)) => format!(" {kind} in {stage}"),
            (Some(kind), None) => format!(" {kind}"),
            _ => String::new(),
        };
        println!(
            "{}  {:<8} {}  {}  {}{}",
            run.run_id, run.status, run.profile, run.created_at_utc, finished, detail
        );
    }
    Ok(())
}

fn cmd_runs_prune(out: &Path, keep: usize) -> Result<()> {
    let removed = stage_runs::prune_old_runs(out, keep)?;
    if removed.is_empty() {
        println!("nothing to prune");
    }
    for run_id in removed {
        info!(run_id = %run_id, "removed run");
        println!("removed {run_id}");
    }
    Ok(())
}
