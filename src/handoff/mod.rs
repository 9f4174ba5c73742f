//! Explicit artifact handoff from a finished stage into the image directory.
//!
//! Nothing crosses a stage boundary implicitly: [`select`] picks artifacts
//! out of a [`StageOutput`] using user-supplied include/exclude patterns and
//! [`transfer`] copies exactly those into the image directory. Whatever is
//! left behind is deleted together with the stage workspace.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::artifact::{self, Artifact, ArtifactRecord};
use crate::error::{BuildError, Result};
use crate::stage::StageOutput;

/// Include/exclude wildcard patterns.
///
/// `*` matches any run of characters and `?` a single one. A pattern without
/// `/` is matched against the file name only; a pattern containing `/` is
/// matched against the whole relative artifact name. An empty include list
/// selects everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandoffFilter {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl HandoffFilter {
    pub fn new<I, E>(include: I, exclude: E) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        Self {
            include: include.into_iter().map(Into::into).collect(),
            exclude: exclude.into_iter().map(Into::into).collect(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for pattern in self.include.iter().chain(&self.exclude) {
            if pattern.trim().is_empty() {
                return Err(BuildError::invalid_spec("handoff pattern must not be empty"));
            }
        }
        Ok(())
    }

    pub fn accepts(&self, name: &str) -> bool {
        let included =
            self.include.is_empty() || self.include.iter().any(|p| pattern_matches(p, name));
        included && !self.exclude.iter().any(|p| pattern_matches(p, name))
    }
}

fn pattern_matches(pattern: &str, name: &str) -> bool {
    let subject = if pattern.contains('/') {
        name
    } else {
        name.rsplit('/').next().unwrap_or(name)
    };
    wildcard(pattern.as_bytes(), subject.as_bytes())
}

/// Greedy `*`/`?` matcher with single-star backtracking.
fn wildcard(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == b'*')
}

/// Artifacts of `output` accepted by `filter`, sorted by name.
pub fn select<'a>(output: &'a StageOutput, filter: &HandoffFilter) -> Vec<&'a Artifact> {
    let mut selected: Vec<&Artifact> = output
        .artifacts()
        .iter()
        .filter(|a| filter.accepts(&a.name))
        .collect();
    selected.sort_by(|a, b| a.name.cmp(&b.name));
    debug!(
        stage = %output.stage_id(),
        produced = output.artifacts().len(),
        selected = selected.len(),
        "selected artifacts for handoff"
    );
    selected
}

/// Copy `selected` into `image_dir`.
///
/// `seen` maps every name already handed off in this build to its producer;
/// a second producer of the same name is rejected.
pub fn transfer(
    selected: &[&Artifact],
    image_dir: &Path,
    seen: &mut BTreeMap<String, String>,
) -> Result<Vec<ArtifactRecord>> {
    let mut records = Vec::with_capacity(selected.len());
    for artifact in selected {
        if let Some(previous) = seen.get(&artifact.name) {
            return Err(BuildError::invalid_spec(format!(
                "artifact '{}' is handed off by both '{}' and '{}'",
                artifact.name, previous, artifact.produced_by
            )));
        }
        let dest = image_dir.join(&artifact.name);
        artifact::copy_to(artifact, &dest)?;
        let (sha256, size_bytes) = artifact::sha256_file(&dest)?;
        seen.insert(artifact.name.clone(), artifact.produced_by.clone());
        info!(
            artifact = %artifact.name,
            stage = %artifact.produced_by,
            size = size_bytes,
            "handed off artifact"
        );
        records.push(ArtifactRecord {
            name: artifact.name.clone(),
            produced_by: artifact.produced_by.clone(),
            size_bytes,
            sha256,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::stage::{StageOutput, StageWorkspace};
    use std::fs;
    use tempfile::TempDir;

    fn output_with(tmp: &TempDir, stage: &str, files: &[&str]) -> StageOutput {
        let workspace = StageWorkspace::create(tmp.path(), stage, true).unwrap();
        for file in files {
            let path = workspace.artifact_dir().join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, file.as_bytes()).unwrap();
        }
        let artifacts = artifact::collect(stage, &workspace.artifact_dir()).unwrap();
        StageOutput::new(stage, workspace, artifacts, Vec::new())
    }

    fn names(selected: &[&Artifact]) -> Vec<String> {
        selected.iter().map(|a| a.name.clone()).collect()
    }

    #[test]
    fn wildcard_basics() {
        assert!(wildcard(b"*.jar", b"app.jar"));
        assert!(wildcard(b"app-?.jar", b"app-1.jar"));
        assert!(!wildcard(b"app-?.jar", b"app-10.jar"));
        assert!(wildcard(b"*-sources*", b"app-sources.jar"));
        assert!(wildcard(b"*", b""));
        assert!(!wildcard(b"*.jar", b"app.war"));
    }

    #[test]
    fn basename_patterns_ignore_directories() {
        let filter = HandoffFilter::new(["*.jar"], Vec::<String>::new());
        assert!(filter.accepts("lib/dep.jar"));
        let filter = HandoffFilter::new(["lib/*.jar"], Vec::<String>::new());
        assert!(filter.accepts("lib/dep.jar"));
        assert!(!filter.accepts("dep.jar"));
    }

    #[test]
    fn exclusion_wins_over_inclusion() {
        let tmp = TempDir::new().unwrap();
        let output = output_with(
            &tmp,
            "builder",
            &["app.jar", "framework-core.jar", "notes.txt", "lib/util.jar"],
        );
        let filter = HandoffFilter::new(["*.jar"], ["framework-*.jar"]);
        let selected = select(&output, &filter);
        assert_eq!(names(&selected), vec!["app.jar", "lib/util.jar"]);
    }

    #[test]
    fn empty_filter_selects_everything_deterministically() {
        let tmp = TempDir::new().unwrap();
        let output = output_with(&tmp, "builder", &["b.jar", "a.jar", "c/d.txt"]);
        let first = names(&select(&output, &HandoffFilter::default()));
        let second = names(&select(&output, &HandoffFilter::default()));
        assert_eq!(first, vec!["a.jar", "b.jar", "c/d.txt"]);
        assert_eq!(first, second);
    }

    #[test]
    fn transfer_copies_and_records_digests() {
        let tmp = TempDir::new().unwrap();
        let output = output_with(&tmp, "builder", &["app.jar", "lib/util.jar"]);
        let image = tmp.path().join("image");
        let mut seen = BTreeMap::new();

        let selected = select(&output, &HandoffFilter::default());
        let records = transfer(&selected, &image, &mut seen).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(fs::read(image.join("lib/util.jar")).unwrap(), b"lib/util.jar");
        assert_eq!(records[0].size_bytes, "app.jar".len() as u64);
        assert_eq!(records[0].sha256.len(), 64);
    }

    #[test]
    fn same_name_from_two_stages_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let first = output_with(&tmp, "builder", &["app.jar"]);
        let second = output_with(&tmp, "assets", &["app.jar"]);
        let image = tmp.path().join("image");
        let mut seen = BTreeMap::new();

        transfer(&select(&first, &HandoffFilter::default()), &image, &mut seen).unwrap();
        let err = transfer(&select(&second, &HandoffFilter::default()), &image, &mut seen)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSpec);
    }
}
