//! Build spec loading.
//!
//! The TOML file is parsed into raw `*Toml` structs (unknown keys rejected)
//! and then validated into a [`BuildSpec`]. Every validation error is raised
//! here, before any stage executes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::cache::{self, CacheMount};
use crate::error::{BuildError, IoContext, Result};
use crate::executor::{ContainerExecutor, HostExecutor, StageExecutor};
use crate::flags::{self, FeatureFlagSet, FlagSchema, RawFlagValue, RawFlags};
use crate::handoff::HandoffFilter;
use crate::image::{HealthcheckConfig, RuntimeConfig, DEFAULT_WORKDIR};
use crate::pipeline::paths::{absolute_path, resolve_repo_path};
use crate::script::fetch::DEFAULT_FETCH_TIMEOUT_SECS;
use crate::script::ScriptCandidate;
use crate::stage::{StagePlan, StageRole};

pub const RUNTIME_STAGE_ID: &str = "runtime";
pub const DEFAULT_SEARCH_ORDER: &[&str] = &["root/opt/build.sh", "build.sh"];

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildSpecToml {
    #[serde(default)]
    project: ProjectToml,
    #[serde(default)]
    script: ScriptToml,
    #[serde(default)]
    flags: BTreeMap<String, toml::Value>,
    #[serde(default)]
    executor: ExecutorToml,
    #[serde(default)]
    stages: Vec<StageToml>,
    runtime: RuntimeToml,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProjectToml {
    source_root: Option<String>,
    #[serde(default)]
    profiles: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScriptToml {
    search_order: Option<Vec<ScriptCandidate>>,
    fetch_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExecutorToml {
    kind: Option<String>,
    shell: Option<String>,
    engine: Option<String>,
    #[serde(default)]
    pull: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StageToml {
    id: String,
    base_image: String,
    search_order: Option<Vec<ScriptCandidate>>,
    #[serde(default)]
    caches: Vec<CacheMount>,
    #[serde(default)]
    handoff: HandoffFilter,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuntimeToml {
    base_image: String,
    workdir: Option<PathBuf>,
    #[serde(default)]
    entrypoint: Vec<String>,
    #[serde(default)]
    ports: Vec<u16>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    user: Option<String>,
    healthcheck: Option<HealthcheckConfig>,
    provision: Option<bool>,
    search_order: Option<Vec<ScriptCandidate>>,
    #[serde(default)]
    caches: Vec<CacheMount>,
    #[serde(default)]
    handoff: HandoffFilter,
}

/// Where stage scripts run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorConfig {
    Host { shell: String },
    Container { engine: String, shell: String, pull: bool },
}

impl ExecutorConfig {
    pub fn build(&self) -> Box<dyn StageExecutor> {
        match self {
            ExecutorConfig::Host { shell } => Box::new(HostExecutor::new(shell.clone())),
            ExecutorConfig::Container { engine, shell, pull } => {
                Box::new(ContainerExecutor::new(engine.clone(), shell.clone(), *pull))
            }
        }
    }
}

/// A validated build description. Immutable once a build starts.
#[derive(Debug, Clone)]
pub struct BuildSpec {
    pub source_root: PathBuf,
    pub flags: FeatureFlagSet,
    /// Every cache used by any stage, deduplicated.
    pub cache_mounts: Vec<CacheMount>,
    pub search_order: Vec<ScriptCandidate>,
    pub fetch_timeout: Duration,
    /// Build stages in execution order.
    pub stages: Vec<StagePlan>,
    pub runtime_stage: StagePlan,
    pub runtime: RuntimeConfig,
    pub executor: ExecutorConfig,
}

impl BuildSpec {
    /// Load `path`, applying `overrides` on top of its `[flags]` table.
    pub fn load(path: &Path, overrides: &[(String, RawFlagValue)]) -> Result<Self> {
        let text = fs::read_to_string(path)
            .io_context(|| format!("reading build spec '{}'", path.display()))?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&text, base_dir, overrides).map_err(|err| match err {
            BuildError::InvalidSpec(msg) => {
                BuildError::InvalidSpec(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Parse a spec whose relative paths are anchored at `base_dir`.
    pub fn from_toml_str(
        text: &str,
        base_dir: &Path,
        overrides: &[(String, RawFlagValue)],
    ) -> Result<Self> {
        let parsed: BuildSpecToml =
            toml::from_str(text).map_err(|e| BuildError::invalid_spec(e.to_string()))?;

        let source_root = absolute_path(&resolve_repo_path(
            base_dir,
            parsed.project.source_root.as_deref().unwrap_or("."),
        ))?;

        let mut raw = raw_flags(parsed.flags)?;
        for (name, value) in overrides {
            flags::apply_override(&mut raw, name, value.clone());
        }
        let flags = FlagSchema::with_profiles(parsed.project.profiles)?.validate(&raw)?;

        let search_order = match parsed.script.search_order {
            Some(order) => order,
            None => DEFAULT_SEARCH_ORDER
                .iter()
                .map(|c| c.parse())
                .collect::<Result<Vec<_>>>()?,
        };
        let fetch_timeout_secs = parsed
            .script
            .fetch_timeout_secs
            .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS);
        if fetch_timeout_secs == 0 {
            return Err(BuildError::invalid_spec("fetch_timeout_secs must be positive"));
        }

        let executor = executor_config(parsed.executor)?;

        if parsed.stages.is_empty() {
            return Err(BuildError::invalid_spec("at least one [[stages]] entry is required"));
        }
        let cache_mounts = cache::plan(
            parsed
                .stages
                .iter()
                .flat_map(|s| s.caches.iter())
                .chain(parsed.runtime.caches.iter()),
        )?;

        let mut stages = Vec::with_capacity(parsed.stages.len());
        for stage in parsed.stages {
            validate_stage_id(&stage.id, &stages)?;
            if stage.base_image.trim().is_empty() {
                return Err(BuildError::invalid_spec(format!(
                    "stage '{}' has an empty base_image",
                    stage.id
                )));
            }
            stage.handoff.validate()?;
            stages.push(StagePlan {
                mounts: cache::plan(&stage.caches)?,
                id: stage.id,
                role: StageRole::Build,
                base_image: stage.base_image,
                search_order: stage.search_order,
                handoff: stage.handoff,
            });
        }

        let runtime_toml = parsed.runtime;
        runtime_toml.handoff.validate()?;
        let runtime = RuntimeConfig {
            base_image: runtime_toml.base_image,
            workdir: runtime_toml
                .workdir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKDIR)),
            entrypoint: runtime_toml.entrypoint,
            ports: runtime_toml.ports,
            env: runtime_toml.env,
            labels: runtime_toml.labels,
            user: runtime_toml.user,
            healthcheck: runtime_toml.healthcheck,
            provision: runtime_toml.provision.unwrap_or(true),
        };
        runtime.validate()?;
        let runtime_stage = StagePlan {
            id: RUNTIME_STAGE_ID.to_string(),
            role: StageRole::Runtime,
            base_image: runtime.base_image.clone(),
            mounts: cache::plan(&runtime_toml.caches)?,
            search_order: runtime_toml.search_order,
            handoff: runtime_toml.handoff,
        };

        debug!(
            source_root = %source_root.display(),
            stages = stages.len(),
            caches = cache_mounts.len(),
            profile = %flags.profile(),
            "loaded build spec"
        );

        Ok(Self {
            source_root,
            flags,
            cache_mounts,
            search_order,
            fetch_timeout: Duration::from_secs(fetch_timeout_secs),
            stages,
            runtime_stage,
            runtime,
            executor,
        })
    }

    pub fn profile(&self) -> &str {
        self.flags.profile()
    }
}

fn raw_flags(table: BTreeMap<String, toml::Value>) -> Result<RawFlags> {
    let mut raw = RawFlags::new();
    for (name, value) in table {
        let value = match value {
            toml::Value::Boolean(b) => RawFlagValue::Bool(b),
            toml::Value::String(s) => RawFlagValue::Text(s),
            toml::Value::Integer(i) => RawFlagValue::Text(i.to_string()),
            other => {
                return Err(BuildError::InvalidValue {
                    name,
                    value: other.to_string(),
                    expected: "a boolean or a string".to_string(),
                })
            }
        };
        raw.insert(name, value);
    }
    Ok(raw)
}

fn executor_config(raw: ExecutorToml) -> Result<ExecutorConfig> {
    let shell = raw
        .shell
        .unwrap_or_else(|| crate::executor::host::DEFAULT_SHELL.to_string());
    match raw.kind.as_deref().map(str::trim).unwrap_or("host") {
        "host" => {
            if raw.engine.is_some() || raw.pull {
                return Err(BuildError::invalid_spec(
                    "executor.engine and executor.pull only apply to kind = \"container\"",
                ));
            }
            Ok(ExecutorConfig::Host { shell })
        }
        "container" => Ok(ExecutorConfig::Container {
            engine: raw.engine.unwrap_or_else(|| "docker".to_string()),
            shell,
            pull: raw.pull,
        }),
        other => Err(BuildError::invalid_spec(format!(
            "unsupported executor kind '{other}' (expected 'host' or 'container')"
        ))),
    }
}

fn validate_stage_id(id: &str, existing: &[StagePlan]) -> Result<()> {
    if !flags::is_safe_name(id) {
        return Err(BuildError::invalid_spec(format!(
            "stage id '{id}' must be letters, digits, '.', '_' or '-'"
        )));
    }
    if id == RUNTIME_STAGE_ID {
        return Err(BuildError::invalid_spec(format!(
            "stage id '{RUNTIME_STAGE_ID}' is reserved for the runtime stage"
        )));
    }
    if existing.iter().any(|s| s.id == id) {
        return Err(BuildError::invalid_spec(format!("duplicate stage id '{id}'")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SharingMode;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    const MINIMAL: &str = r#"
[[stages]]
id = "builder"
base_image = "maven:3"

[runtime]
base_image = "eclipse-temurin:17-jre"
"#;

    fn parse(text: &str) -> Result<BuildSpec> {
        BuildSpec::from_toml_str(text, Path::new("/work/project"), &[])
    }

    #[test]
    fn minimal_spec_gets_defaults() {
        let spec = parse(MINIMAL).unwrap();
        assert_eq!(spec.source_root, PathBuf::from("/work/project"));
        assert_eq!(spec.profile(), "main");
        assert_eq!(spec.fetch_timeout, Duration::from_secs(30));
        assert_eq!(
            spec.search_order,
            vec![
                ScriptCandidate::Project("root/opt/build.sh".into()),
                ScriptCandidate::Project("build.sh".into()),
            ]
        );
        assert_eq!(spec.executor, ExecutorConfig::Host { shell: "bash".into() });
        assert!(spec.runtime.provision);
        assert_eq!(spec.runtime.workdir, PathBuf::from("/app"));
        assert_eq!(spec.runtime_stage.role, StageRole::Runtime);
    }

    #[test]
    fn full_spec_parses() {
        let text = r#"
[project]
source_root = "app"
profiles = ["main", "prod"]

[script]
search_order = ["override:/etc/stagehand/build.sh", "build.sh", "https://example.com/{profile}/build.sh"]
fetch_timeout_secs = 5

[flags]
profile = "prod"
installFonts = true
region = "restricted"

[executor]
kind = "container"
engine = "podman"
pull = true

[[stages]]
id = "builder"
base_image = "maven:3"
caches = [{ id = "dep-cache", target = "/root/.m2", sharing = "locked" }]
handoff = { include = ["*.jar"], exclude = ["framework-*.jar"] }

[runtime]
base_image = "eclipse-temurin:17-jre"
entrypoint = ["java", "-jar", "app.jar"]
ports = [8080, 8080, 443]
user = "app"
provision = false
caches = [{ id = "apt", target = "/var/cache/apt" }]

[runtime.healthcheck]
command = ["curl", "-f", "http://localhost:8080/health"]
"#;
        let spec = parse(text).unwrap();
        assert_eq!(spec.source_root, PathBuf::from("/work/project/app"));
        assert_eq!(spec.profile(), "prod");
        assert!(spec.flags.is_enabled("installFonts"));
        assert_eq!(spec.search_order.len(), 3);
        assert_eq!(
            spec.executor,
            ExecutorConfig::Container {
                engine: "podman".into(),
                shell: "bash".into(),
                pull: true
            }
        );
        assert_eq!(spec.cache_mounts.len(), 2);
        assert_eq!(spec.stages[0].mounts[0].sharing, SharingMode::Locked);
        assert_eq!(spec.runtime_stage.mounts[0].sharing, SharingMode::Shared);
        assert_eq!(spec.stages[0].handoff.exclude, vec!["framework-*.jar"]);
        assert_eq!(spec.runtime.healthcheck.as_ref().unwrap().interval_secs, 30);
        assert!(!spec.runtime.provision);
    }

    #[test]
    fn conflicting_caches_across_stages() {
        let text = r#"
[[stages]]
id = "builder"
base_image = "maven:3"
caches = [{ id = "dep-cache", target = "/root/.m2", sharing = "locked" }]

[[stages]]
id = "assets"
base_image = "node:20"
caches = [{ id = "dep-cache", target = "/root/.m2", sharing = "shared" }]

[runtime]
base_image = "eclipse-temurin:17-jre"
"#;
        assert_eq!(parse(text).unwrap_err().kind(), ErrorKind::CacheConflict);
    }

    #[test]
    fn unknown_flag_and_unknown_key() {
        let unknown_flag = format!("{MINIMAL}\n[flags]\ninstallJava = true\n");
        assert_eq!(parse(&unknown_flag).unwrap_err().kind(), ErrorKind::UnknownFlag);

        let unknown_key = format!("{MINIMAL}\n[project]\nname = \"x\"\n");
        assert_eq!(parse(&unknown_key).unwrap_err().kind(), ErrorKind::InvalidSpec);
    }

    #[test]
    fn non_scalar_flag_is_invalid_value() {
        let text = format!("{MINIMAL}\n[flags]\ninstallFonts = [true]\n");
        assert_eq!(parse(&text).unwrap_err().kind(), ErrorKind::InvalidValue);
    }

    #[test]
    fn overrides_win_over_file_flags() {
        let text = format!("{MINIMAL}\n[flags]\ninstallFonts = false\n");
        let overrides = vec![flags::parse_override("install_fonts=yes").unwrap()];
        let spec = BuildSpec::from_toml_str(&text, Path::new("/p"), &overrides).unwrap();
        assert!(spec.flags.is_enabled("installFonts"));
    }

    #[test]
    fn stage_ids_are_validated() {
        let duplicate = r#"
[[stages]]
id = "builder"
base_image = "a"

[[stages]]
id = "builder"
base_image = "b"

[runtime]
base_image = "c"
"#;
        assert_eq!(parse(duplicate).unwrap_err().kind(), ErrorKind::InvalidSpec);

        let reserved = MINIMAL.replace("\"builder\"", "\"runtime\"");
        assert_eq!(parse(&reserved).unwrap_err().kind(), ErrorKind::InvalidSpec);

        let escaping = MINIMAL.replace("\"builder\"", "\"../x\"");
        assert_eq!(parse(&escaping).unwrap_err().kind(), ErrorKind::InvalidSpec);
    }

    #[test]
    fn escaping_search_order_is_rejected() {
        let text = format!("[script]\nsearch_order = [\"../build.sh\"]\n{MINIMAL}");
        assert_eq!(parse(&text).unwrap_err().kind(), ErrorKind::InvalidSpec);
    }

    #[test]
    fn load_resolves_relative_to_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stagehand.toml");
        fs::write(&path, MINIMAL).unwrap();
        let spec = BuildSpec::load(&path, &[]).unwrap();
        assert!(spec.source_root.starts_with(tmp.path()));

        let missing = BuildSpec::load(&tmp.path().join("nope.toml"), &[]).unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::Io);
    }
}
