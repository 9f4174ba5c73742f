//! Build script resolution.
//!
//! Resolution order:
//! 1. Local candidates, in declared order (explicit overrides and
//!    project-local defaults). Probing them never touches the network.
//! 2. Remote candidates, in declared order, only when no local candidate
//!    matched.
//!
//! A candidate that is missing, blank, or fails to fetch is skipped and its
//! reason recorded; running out of candidates is `ScriptNotFound`.

pub mod fetch;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{BuildError, Result};
use crate::flags::FeatureFlagSet;

pub use fetch::{FetchError, HttpFetcher, ScriptFetcher};

const OVERRIDE_PREFIX: &str = "override:";

/// One entry of a script search order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ScriptCandidate {
    /// Explicit override path, absolute or relative to the source root.
    Override(PathBuf),
    /// Project-local default, relative to the source root.
    Project(PathBuf),
    /// Remote URL template; `{profile}` and `{region}` are expanded.
    Remote(String),
}

impl ScriptCandidate {
    pub fn is_local(&self) -> bool {
        !matches!(self, ScriptCandidate::Remote(_))
    }
}

fn parse_relative_path(raw: &str) -> Result<PathBuf> {
    let candidate = Path::new(raw);
    for component in candidate.components() {
        if matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        ) {
            return Err(BuildError::invalid_spec(format!(
                "script candidate '{raw}' must stay inside the source root"
            )));
        }
    }
    Ok(candidate.to_path_buf())
}

impl FromStr for ScriptCandidate {
    type Err = BuildError;

    fn from_str(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(BuildError::invalid_spec("script candidate must not be empty"));
        }
        if let Some(path) = raw.strip_prefix(OVERRIDE_PREFIX) {
            let path = path.trim();
            if path.is_empty() {
                return Err(BuildError::invalid_spec(
                    "override script candidate has no path",
                ));
            }
            return Ok(ScriptCandidate::Override(PathBuf::from(path)));
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Ok(ScriptCandidate::Remote(raw.to_string()));
        }
        if Path::new(raw).is_absolute() {
            return Ok(ScriptCandidate::Override(PathBuf::from(raw)));
        }
        Ok(ScriptCandidate::Project(parse_relative_path(raw)?))
    }
}

impl TryFrom<String> for ScriptCandidate {
    type Error = BuildError;

    fn try_from(raw: String) -> Result<Self> {
        raw.parse()
    }
}

impl From<ScriptCandidate> for String {
    fn from(candidate: ScriptCandidate) -> Self {
        candidate.to_string()
    }
}

impl fmt::Display for ScriptCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptCandidate::Override(path) => write!(f, "{OVERRIDE_PREFIX}{}", path.display()),
            ScriptCandidate::Project(path) => write!(f, "{}", path.display()),
            ScriptCandidate::Remote(url) => f.write_str(url),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptOrigin {
    LocalOverride,
    ProjectDefault,
    RemoteFallback,
}

impl ScriptOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            ScriptOrigin::LocalOverride => "local_override",
            ScriptOrigin::ProjectDefault => "project_default",
            ScriptOrigin::RemoteFallback => "remote_fallback",
        }
    }
}

impl fmt::Display for ScriptOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A build script ready to run. Deliberately not `Clone`: each resolved
/// script is moved into exactly one stage.
#[derive(Debug)]
pub struct ResolvedScript {
    origin: ScriptOrigin,
    content: Vec<u8>,
    source_location: String,
}

impl ResolvedScript {
    pub fn origin(&self) -> ScriptOrigin {
        self.origin
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn source_location(&self) -> &str {
        &self.source_location
    }

    pub fn sha256(&self) -> String {
        format!("{:x}", Sha256::digest(&self.content))
    }
}

/// Outcome of probing one candidate.
enum Probe {
    Found(ResolvedScript),
    Skipped(String),
}

fn is_blank(content: &[u8]) -> bool {
    content.iter().all(u8::is_ascii_whitespace)
}

/// Resolves a search order against a source root and a fetcher.
pub struct ScriptResolver<'a> {
    source_root: &'a Path,
    fetcher: &'a dyn ScriptFetcher,
    template_vars: BTreeMap<&'static str, String>,
}

impl<'a> ScriptResolver<'a> {
    pub fn new(source_root: &'a Path, fetcher: &'a dyn ScriptFetcher) -> Self {
        Self {
            source_root,
            fetcher,
            template_vars: BTreeMap::new(),
        }
    }

    /// Expand `{profile}` and `{region}` in remote templates from `flags`.
    pub fn with_flags(mut self, flags: &FeatureFlagSet) -> Self {
        self.template_vars
            .insert("profile", flags.profile().to_string());
        self.template_vars
            .insert("region", flags.region().as_str().to_string());
        self
    }

    pub fn resolve(&self, search_order: &[ScriptCandidate]) -> Result<ResolvedScript> {
        let locals = search_order.iter().filter(|c| c.is_local());
        let remotes = search_order.iter().filter(|c| !c.is_local());

        let mut tried = Vec::new();
        for candidate in locals.chain(remotes) {
            match self.probe(candidate) {
                Probe::Found(script) => {
                    info!(
                        origin = %script.origin,
                        location = %script.source_location,
                        "resolved build script"
                    );
                    return Ok(script);
                }
                Probe::Skipped(reason) => {
                    debug!(candidate = %candidate, reason = %reason, "skipping script candidate");
                    tried.push(format!("{candidate} ({reason})"));
                }
            }
        }

        if tried.is_empty() {
            tried.push("empty search order".to_string());
        }
        Err(BuildError::ScriptNotFound { tried })
    }

    fn probe(&self, candidate: &ScriptCandidate) -> Probe {
        match candidate {
            ScriptCandidate::Override(path) => {
                self.probe_local(&self.local_path(path), ScriptOrigin::LocalOverride)
            }
            ScriptCandidate::Project(path) => {
                self.probe_local(&self.source_root.join(path), ScriptOrigin::ProjectDefault)
            }
            ScriptCandidate::Remote(template) => self.probe_remote(template),
        }
    }

    fn local_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.source_root.join(path)
        }
    }

    fn probe_local(&self, path: &Path, origin: ScriptOrigin) -> Probe {
        if !path.is_file() {
            return Probe::Skipped("not found".to_string());
        }
        match fs::read(path) {
            Ok(content) if is_blank(&content) => Probe::Skipped("empty".to_string()),
            Ok(content) => Probe::Found(ResolvedScript {
                origin,
                content,
                source_location: path.display().to_string(),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Probe::Skipped("not found".to_string())
            }
            Err(e) => Probe::Skipped(format!("unreadable: {e}")),
        }
    }

    fn probe_remote(&self, template: &str) -> Probe {
        let url = self.expand(template);
        match self.fetcher.fetch(&url) {
            Ok(content) if is_blank(&content) => Probe::Skipped("empty response".to_string()),
            Ok(content) => Probe::Found(ResolvedScript {
                origin: ScriptOrigin::RemoteFallback,
                content,
                source_location: url,
            }),
            Err(e) => {
                warn!(url = %url, error = %e, "remote build script fetch failed");
                Probe::Skipped(e.to_string())
            }
        }
    }

    fn expand(&self, template: &str) -> String {
        let mut url = template.to_string();
        for (key, value) in &self.template_vars {
            url = url.replace(&format!("{{{key}}}"), value);
        }
        url
    }
}
