//! Runtime image assembly.
//!
//! [`assemble`] is pure composition: it takes what the build produced (handed
//! off artifacts, stage summaries) together with the flags and the runtime
//! configuration, and describes the final image. It performs no I/O; the
//! pipeline writes the result out as `image-spec.json`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::artifact::ArtifactRecord;
use crate::error::{BuildError, Result};
use crate::flags::{FeatureFlagSet, FlagValue};
use crate::script::ScriptOrigin;
use crate::stage::StageRole;

pub const DEFAULT_WORKDIR: &str = "/app";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthcheckConfig {
    pub command: Vec<String>,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_start_period")]
    pub start_period_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

fn default_interval() -> u64 {
    30
}

fn default_timeout() -> u64 {
    3
}

fn default_start_period() -> u64 {
    5
}

fn default_retries() -> u32 {
    3
}

/// Image-level settings of the runtime stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub base_image: String,
    pub workdir: PathBuf,
    pub entrypoint: Vec<String>,
    pub ports: Vec<u16>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub user: Option<String>,
    pub healthcheck: Option<HealthcheckConfig>,
    /// Run the build script once more in the runtime stage to perform
    /// flag-gated provisioning.
    pub provision: bool,
}

impl RuntimeConfig {
    pub fn new(base_image: impl Into<String>) -> Self {
        Self {
            base_image: base_image.into(),
            workdir: PathBuf::from(DEFAULT_WORKDIR),
            entrypoint: Vec::new(),
            ports: Vec::new(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            user: None,
            healthcheck: None,
            provision: true,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.base_image.trim().is_empty() {
            return Err(BuildError::invalid_spec("runtime base_image must not be empty"));
        }
        if !self.workdir.is_absolute() {
            return Err(BuildError::invalid_spec(format!(
                "runtime workdir '{}' must be absolute",
                self.workdir.display()
            )));
        }
        if self.ports.contains(&0) {
            return Err(BuildError::invalid_spec("runtime port 0 is not a valid port"));
        }
        if let Some(check) = &self.healthcheck {
            if check.command.is_empty() {
                return Err(BuildError::invalid_spec(
                    "healthcheck command must not be empty",
                ));
            }
            if check.retries == 0 || check.interval_secs == 0 || check.timeout_secs == 0 {
                return Err(BuildError::invalid_spec(
                    "healthcheck interval, timeout and retries must be positive",
                ));
            }
        }
        Ok(())
    }
}

/// Summary of one executed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageMeta {
    pub id: String,
    pub role: StageRole,
    pub base_image: String,
    pub script_origin: ScriptOrigin,
    pub script_location: String,
    pub script_sha256: String,
    pub artifacts_produced: usize,
    pub artifacts_handed_off: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisioningStep {
    pub step: String,
    pub flag: String,
    pub enabled: bool,
    pub ran: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeImageSpec {
    pub base_image: String,
    pub workdir: PathBuf,
    pub entrypoint: Vec<String>,
    pub exposed_ports: Vec<u16>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthcheckConfig>,
    pub profile: String,
    pub flags: BTreeMap<String, FlagValue>,
    pub provisioning: Vec<ProvisioningStep>,
    pub artifacts: Vec<ArtifactRecord>,
    pub stages: Vec<StageMeta>,
}

pub fn assemble(
    mut artifacts: Vec<ArtifactRecord>,
    flags: &FeatureFlagSet,
    stages: Vec<StageMeta>,
    runtime: &RuntimeConfig,
) -> Result<RuntimeImageSpec> {
    runtime.validate()?;

    artifacts.sort_by(|a, b| a.name.cmp(&b.name));
    if let Some(pair) = artifacts.windows(2).find(|w| w[0].name == w[1].name) {
        return Err(BuildError::invalid_spec(format!(
            "artifact '{}' is handed off by both '{}' and '{}'",
            pair[0].name, pair[0].produced_by, pair[1].produced_by
        )));
    }

    let mut exposed_ports = runtime.ports.clone();
    exposed_ports.sort_unstable();
    exposed_ports.dedup();

    let mut env = runtime.env.clone();
    env.extend(flags.runtime_env());

    let runtime_ran = stages.iter().any(|s| s.role == StageRole::Runtime);
    let provisioning = flags
        .provisioning_steps()
        .into_iter()
        .map(|(step, flag, enabled)| ProvisioningStep {
            step: step.to_string(),
            flag: flag.to_string(),
            enabled,
            ran: enabled && runtime_ran,
        })
        .collect();

    debug!(
        artifacts = artifacts.len(),
        stages = stages.len(),
        ports = exposed_ports.len(),
        "assembled runtime image spec"
    );

    Ok(RuntimeImageSpec {
        base_image: runtime.base_image.clone(),
        workdir: runtime.workdir.clone(),
        entrypoint: runtime.entrypoint.clone(),
        exposed_ports,
        env,
        labels: runtime.labels.clone(),
        user: runtime.user.clone(),
        healthcheck: runtime.healthcheck.clone(),
        profile: flags.profile().to_string(),
        flags: flags.snapshot(),
        provisioning,
        artifacts,
        stages,
    })
}
