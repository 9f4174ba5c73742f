//! Run directories and their `run-manifest.json` bookkeeping.
//!
//! Every `build` invocation gets `<output_root>/<run_id>/`. The manifest is
//! written when the run starts and rewritten when it finishes, so interrupted
//! runs stay visible as `running`.

use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::PipelineError;

const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";
const RUN_ID_SALT_BITS: u32 = 32;
static RUN_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

pub const STATUS_RUNNING: &str = "running";
pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILED: &str = "failed";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RunMetadata {
    pub run_id: String,
    pub status: String,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    #[serde(default)]
    pub profile: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub exit_code: i32,
}

impl RunMetadata {
    pub fn started(run_id: &str, profile: &str) -> Result<Self> {
        Ok(Self {
            run_id: run_id.to_string(),
            status: STATUS_RUNNING.to_string(),
            created_at_utc: now_utc()?,
            finished_at_utc: None,
            profile: profile.to_string(),
            failed_stage: None,
            error_kind: None,
            exit_code: 0,
        })
    }

    pub fn succeeded(mut self) -> Result<Self> {
        self.status = STATUS_SUCCESS.to_string();
        self.finished_at_utc = Some(now_utc()?);
        Ok(self)
    }

    pub fn failed(mut self, err: &PipelineError) -> Result<Self> {
        self.status = STATUS_FAILED.to_string();
        self.finished_at_utc = Some(now_utc()?);
        self.failed_stage = err.stage.clone();
        self.error_kind = Some(err.kind().as_str().to_string());
        self.exit_code = err.exit_code();
        Ok(self)
    }
}

/// Whole-second RFC 3339 UTC timestamp; fixed width, so it sorts as text.
fn now_utc() -> Result<String> {
    let now = OffsetDateTime::now_utc()
        .replace_nanosecond(0)
        .context("truncating timestamp")?;
    now.format(&Rfc3339).context("formatting timestamp")
}

/// Sortable, collision-resistant run identifier.
pub fn new_run_id() -> Result<String> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before UNIX_EPOCH while generating run id")?
        .as_nanos();
    let pid_component = (std::process::id() as u128 & 0xFFFF) << 16;
    let seq_component = (RUN_ID_COUNTER.fetch_add(1, Ordering::Relaxed) as u128) & 0xFFFF;
    let entropy = (nanos << RUN_ID_SALT_BITS) | pid_component | seq_component;
    Ok(base62_encode_u128(entropy))
}

fn base62_encode_u128(mut value: u128) -> String {
    const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut bytes = Vec::new();
    while value > 0 {
        bytes.push(ALPHABET[(value % 62) as usize] as char);
        value /= 62;
    }
    bytes.iter().rev().collect()
}

pub fn manifest_path(run_dir: &Path) -> PathBuf {
    run_dir.join(RUN_MANIFEST_FILENAME)
}

pub fn write_manifest(run_dir: &Path, metadata: &RunMetadata) -> Result<()> {
    let path = manifest_path(run_dir);
    write_json_atomic(&path, metadata)
        .with_context(|| format!("writing run metadata '{}'", path.display()))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let payload = serde_json::to_vec_pretty(value).context("serializing run metadata")?;
    fs::write(&tmp, payload).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}

pub fn load_runs_metadata(output_root: &Path) -> Result<Vec<RunMetadata>> {
    Ok(load_runs(output_root)?
        .into_iter()
        .map(|(_, run)| run)
        .collect())
}

/// Manifests under `output_root` paired with the directory each was read
/// from, newest first.
fn load_runs(output_root: &Path) -> Result<Vec<(PathBuf, RunMetadata)>> {
    if !output_root.is_dir() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in fs::read_dir(output_root)
        .with_context(|| format!("reading runs directory '{}'", output_root.display()))?
    {
        let entry = entry
            .with_context(|| format!("iterating runs directory '{}'", output_root.display()))?;
        let run_dir = entry.path();
        if !run_dir.is_dir() {
            continue;
        }
        let Some(run_name) = run_dir.file_name().and_then(|part| part.to_str()) else {
            continue;
        };
        if run_name.starts_with('.') {
            continue;
        }
        let path = manifest_path(&run_dir);
        if !path.is_file() {
            continue;
        }
        let bytes = fs::read(&path)
            .with_context(|| format!("reading run metadata '{}'", path.display()))?;
        let parsed: RunMetadata = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing run metadata '{}'", path.display()))?;
        runs.push((run_dir, parsed));
    }
    runs.sort_by_key(|(_, run)| Reverse(run_sort_key(run)));
    Ok(runs)
}

pub fn latest_successful_run_id(output_root: &Path) -> Result<Option<String>> {
    let runs = load_runs_metadata(output_root)?;
    Ok(runs
        .into_iter()
        .find(|run| run.status == STATUS_SUCCESS)
        .map(|run| run.run_id))
}

/// Delete all but the `keep` most recent runs; returns the removed directory
/// names. Deletion goes by the directory a manifest was found in, never by
/// the `run_id` recorded inside it.
pub fn prune_old_runs(output_root: &Path, keep: usize) -> Result<Vec<String>> {
    let runs = load_runs(output_root)?;
    let mut removed = Vec::new();
    for (run_dir, _) in runs.into_iter().skip(keep) {
        fs::remove_dir_all(&run_dir)
            .with_context(|| format!("removing expired run directory '{}'", run_dir.display()))?;
        removed.push(
            run_dir
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );
    }
    Ok(removed)
}

fn run_sort_key(run: &RunMetadata) -> (String, String) {
    let at = run
        .finished_at_utc
        .clone()
        .unwrap_or_else(|| run.created_at_utc.clone());
    (at, run.run_id.clone())
}
