use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use stagehand::cache::{CacheMount, CacheStore, SharingMode};
use stagehand::executor::HostExecutor;
use stagehand::image::RuntimeImageSpec;
use stagehand::pipeline::{BuildOptions, BuildSpec, Pipeline, PipelineState};
use stagehand::script::{FetchError, ScriptFetcher};
use stagehand::{BuildError, ErrorKind};
use tempfile::TempDir;

/// Fetcher that fails every request and counts them.
struct CountingFetcher {
    calls: Arc<AtomicUsize>,
    status: u16,
}

impl ScriptFetcher for CountingFetcher {
    fn fetch(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(FetchError::Status(self.status))
    }
}

struct Workspace {
    tmp: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("project")).unwrap();
        Self { tmp }
    }

    fn root(&self) -> &Path {
        self.tmp.path()
    }

    fn project(&self) -> PathBuf {
        self.root().join("project")
    }

    fn write_script(&self, body: &str) {
        fs::write(self.project().join("build.sh"), body).unwrap();
    }

    fn spec(&self, toml: &str) -> Result<BuildSpec, BuildError> {
        BuildSpec::from_toml_str(toml, self.root(), &[])
    }

    fn options(&self) -> BuildOptions {
        BuildOptions {
            work_root: self.root().join("work"),
            cache_root: self.root().join("caches"),
            output_dir: self.root().join("out/run-1"),
            keep_workspaces: false,
        }
    }

    fn pipeline<'a>(&self, spec: &'a BuildSpec, calls: &Arc<AtomicUsize>) -> Pipeline<'a> {
        Pipeline::new(
            spec,
            Box::new(HostExecutor::new("sh")),
            Box::new(CountingFetcher {
                calls: Arc::clone(calls),
                status: 404,
            }),
            self.options(),
        )
    }
}

const APP_SPEC: &str = r#"
[project]
source_root = "project"

[script]
search_order = ["build.sh", "https://scripts.example.invalid/{profile}/build.sh"]

[flags]
installFonts = true

[[stages]]
id = "builder"
base_image = "maven:3-eclipse-temurin-17"
caches = [{ id = "dep-cache", target = "/root/.m2", sharing = "locked" }]
handoff = { include = ["*.jar"], exclude = ["framework-*.jar"] }

[runtime]
base_image = "eclipse-temurin:17-jre"
entrypoint = ["java", "-jar", "/app/app.jar"]
ports = [8080]
"#;

const APP_SCRIPT: &str = r#"
set -e
echo "role=$STAGE_ROLE profile=$MVN_PROFILE fonts=$INSTALL_FONTS"
if [ "$STAGE_ROLE" = "build" ]; then
    echo jar > "$ARTIFACT_DIR/app.jar"
    echo framework > "$ARTIFACT_DIR/framework-core.jar"
    echo notes > "$ARTIFACT_DIR/notes.txt"
    echo downloaded > "$CACHE_DIR_DEP_CACHE/dep.pom"
fi
"#;

#[test]
fn scenario_a_local_script_builds_and_hands_off_only_the_app() {
    let ws = Workspace::new();
    ws.write_script(APP_SCRIPT);
    let spec = ws.spec(APP_SPEC).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut pipeline = ws.pipeline(&spec, &calls);

    let report = pipeline.run().unwrap();

    assert_eq!(pipeline.state(), PipelineState::Complete);
    assert_eq!(
        report.states,
        vec![
            PipelineState::Planned,
            PipelineState::Resolving,
            PipelineState::Building,
            PipelineState::Handoff,
            PipelineState::Assembling,
            PipelineState::Complete,
        ]
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0, "local script must not hit the network");

    let names: Vec<&str> = report
        .image_spec
        .artifacts
        .iter()
        .map(|a| a.name.as_str())
        .collect();
    assert_eq!(names, vec!["app.jar"]);
    assert!(report.image_dir.join("app.jar").is_file());
    assert!(!report.image_dir.join("framework-core.jar").exists());

    let written: serde_json::Value =
        serde_json::from_slice(&fs::read(&report.spec_path).unwrap()).unwrap();
    assert_eq!(written["artifacts"][0]["name"], "app.jar");
    assert_eq!(written["exposed_ports"], serde_json::json!([8080]));
    assert_eq!(written["env"]["APP_PROFILE"], "main");

    let fonts = report
        .image_spec
        .provisioning
        .iter()
        .find(|s| s.step == "fonts")
        .unwrap();
    assert!(fonts.enabled && fonts.ran);
    assert_eq!(report.image_spec.stages.len(), 2);

    let log = fs::read_to_string(&report.log_path).unwrap();
    assert!(log.contains("[builder] role=build profile=main fonts=true"));
    assert!(log.contains("[runtime] role=runtime"));

    // Stage workspaces are gone, the persistent cache is not.
    assert!(!ws.root().join("work/builder").exists());
    let caches: Vec<_> = fs::read_dir(ws.root().join("caches")).unwrap().collect();
    assert_eq!(caches.len(), 1);
}

#[test]
fn scenario_b_missing_script_and_failed_fetch_is_script_not_found() {
    let ws = Workspace::new();
    let spec = ws.spec(APP_SPEC).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut pipeline = ws.pipeline(&spec, &calls);

    let err = pipeline.run().unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ScriptNotFound);
    assert_eq!(err.exit_code(), 10);
    assert_eq!(err.stage.as_deref(), Some("builder"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert_eq!(
        pipeline.history(),
        &[
            PipelineState::Planned,
            PipelineState::Resolving,
            PipelineState::Failed
        ]
    );
    assert!(!ws.root().join("caches").exists());
    assert!(!ws.root().join("work").exists());
    assert!(ws.root().join("out/run-1/build.log").is_file());
}

#[test]
fn scenario_c_conflicting_cache_declarations_fail_before_execution() {
    let ws = Workspace::new();
    ws.write_script("touch \"$SOURCE_DIR/executed\"\n");
    let toml = r#"
[project]
source_root = "project"

[[stages]]
id = "builder"
base_image = "maven:3"
caches = [{ id = "dep-cache", target = "/root/.m2", sharing = "locked" }]

[[stages]]
id = "docs"
base_image = "maven:3"
caches = [{ id = "dep-cache", target = "/root/.m2", sharing = "shared" }]

[runtime]
base_image = "eclipse-temurin:17-jre"
"#;

    let err = ws.spec(toml).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CacheConflict);
    assert_eq!(err.exit_code(), 13);
    assert!(!ws.project().join("executed").exists());
}

#[test]
fn failing_script_reports_tail_and_releases_cache_lock() {
    let ws = Workspace::new();
    ws.write_script("echo compiling\necho 'error: cannot find symbol' >&2\nexit 1\n");
    let spec = ws.spec(APP_SPEC).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut pipeline = ws.pipeline(&spec, &calls);

    let err = pipeline.run().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ScriptFailed);
    assert_eq!(err.stage.as_deref(), Some("builder"));
    assert_eq!(err.log_tail, vec!["compiling", "error: cannot find symbol"]);

    // The locked cache must be free again.
    let key = stagehand::cache::project_key(&spec.source_root);
    let store = CacheStore::open(&ws.root().join("caches"), &key);
    let attached = store
        .attach(
            &CacheMount::new("dep-cache", "/root/.m2", SharingMode::Locked),
            &ws.root().join("scratch"),
        )
        .unwrap();
    assert!(attached.is_locked());
}

#[test]
fn runtime_provisioning_can_be_disabled() {
    let ws = Workspace::new();
    ws.write_script(APP_SCRIPT);
    let toml = format!("{APP_SPEC}provision = false\n");
    let spec = ws.spec(&toml).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let report = ws.pipeline(&spec, &calls).run().unwrap();
    let image_spec: &RuntimeImageSpec = &report.image_spec;
    assert_eq!(image_spec.stages.len(), 1);
    assert!(image_spec.provisioning.iter().all(|s| !s.ran));
}

#[test]
fn pipeline_runs_only_once() {
    let ws = Workspace::new();
    ws.write_script(APP_SCRIPT);
    let spec = ws.spec(APP_SPEC).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut pipeline = ws.pipeline(&spec, &calls);

    pipeline.run().unwrap();
    let err = pipeline.run().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSpec);
    assert_eq!(pipeline.state(), PipelineState::Complete);
}
