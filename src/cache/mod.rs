//! Cache mount planning and host-side cache storage.
//!
//! Stages declare the caches they want (dependency downloads, package manager
//! state). [`plan`] merges those declarations into one list and refuses
//! contradictions. [`CacheStore`] maps each planned mount onto a host
//! directory keyed by project, so repeated builds of one project reuse their
//! caches while unrelated projects never see each other's.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{BuildError, Result};

/// Whether concurrent builds may use the same cache at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharingMode {
    /// Private to one build invocation, discarded afterwards.
    Exclusive,
    /// Concurrent readers and writers allowed.
    #[default]
    Shared,
    /// One build at a time.
    Locked,
}

impl SharingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SharingMode::Exclusive => "exclusive",
            SharingMode::Shared => "shared",
            SharingMode::Locked => "locked",
        }
    }
}

impl fmt::Display for SharingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheMount {
    pub id: String,
    /// Mount point inside the stage environment.
    pub target: PathBuf,
    #[serde(default)]
    pub sharing: SharingMode,
}

impl CacheMount {
    pub fn new(id: impl Into<String>, target: impl Into<PathBuf>, sharing: SharingMode) -> Self {
        Self {
            id: id.into(),
            target: target.into(),
            sharing,
        }
    }

    /// Name of the variable exposing this cache's location to build scripts.
    pub fn env_var(&self) -> String {
        let suffix: String = self
            .id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("CACHE_DIR_{suffix}")
    }

    fn describe(&self) -> String {
        format!("target={} sharing={}", self.target.display(), self.sharing)
    }
}

fn validate_mount(mount: &CacheMount) -> Result<()> {
    let id = mount.id.as_str();
    if id.is_empty() {
        return Err(BuildError::invalid_spec("cache id must not be empty"));
    }
    if id.contains('/') || id.contains('\\') || id.contains("..") || id.starts_with('.') {
        return Err(BuildError::invalid_spec(format!(
            "cache id '{id}' must be a safe file name segment"
        )));
    }
    if !mount.target.is_absolute() {
        return Err(BuildError::invalid_spec(format!(
            "cache '{}' target '{}' must be an absolute path",
            id,
            mount.target.display()
        )));
    }
    Ok(())
}

/// Merge cache declarations, deduplicating by id in first-seen order.
///
/// Identical redeclarations collapse into one mount. The same id with a
/// different target or sharing mode is a [`BuildError::CacheConflict`], as
/// are two ids that would share one `CACHE_DIR_*` variable.
pub fn plan<'a, I>(declarations: I) -> Result<Vec<CacheMount>>
where
    I: IntoIterator<Item = &'a CacheMount>,
{
    let mut planned: Vec<CacheMount> = Vec::new();
    for mount in declarations {
        validate_mount(mount)?;
        match planned.iter().find(|existing| existing.id == mount.id) {
            Some(existing) if existing == mount => {}
            Some(existing) => {
                return Err(BuildError::CacheConflict {
                    id: mount.id.clone(),
                    first: existing.describe(),
                    second: mount.describe(),
                });
            }
            None => {
                let var = mount.env_var();
                if let Some(clash) = planned.iter().find(|existing| existing.env_var() == var) {
                    return Err(BuildError::CacheConflict {
                        id: mount.id.clone(),
                        first: format!("'{}' exported as {}", clash.id, var),
                        second: format!("'{}' exported as {}", mount.id, var),
                    });
                }
                planned.push(mount.clone());
            }
        }
    }
    Ok(planned)
}

/// Stable per-project key: the source directory name plus a digest of its
/// canonical path.
pub fn project_key(source_root: &Path) -> String {
    let canonical = fs::canonicalize(source_root).unwrap_or_else(|_| source_root.to_path_buf());
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    let hex = format!("{digest:x}");
    let stem: String = canonical
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("project")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}-{}", stem, &hex[..16])
}

/// Default host directory holding every project's caches.
pub fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("stagehand")
}

/// Host storage for one project's caches.
///
/// Opening the store touches nothing on disk; directories and lock files are
/// created only when a stage attaches a mount.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn open(cache_root: &Path, project_key: &str) -> Self {
        Self {
            root: cache_root.join(project_key),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn persistent_dir(&self, id: &str) -> PathBuf {
        self.root.join("data").join(id)
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.root.join("locks").join(format!("{id}.lock"))
    }

    /// Make `mount` available to a stage whose private workspace is `scratch`.
    ///
    /// The returned guard must live as long as the stage process; dropping it
    /// releases any lock held for the mount.
    pub fn attach(&self, mount: &CacheMount, scratch: &Path) -> Result<AttachedCache> {
        let (host_path, lock) = match mount.sharing {
            SharingMode::Exclusive => (scratch.join("caches").join(&mount.id), None),
            SharingMode::Shared => (self.persistent_dir(&mount.id), None),
            SharingMode::Locked => {
                let lock = self.acquire_lock(&mount.id)?;
                (self.persistent_dir(&mount.id), Some(lock))
            }
        };

        fs::create_dir_all(&host_path).map_err(|e| {
            BuildError::unavailable(format!(
                "cache '{}' directory '{}' is not accessible: {}",
                mount.id,
                host_path.display(),
                e
            ))
        })?;
        debug!(cache = %mount.id, sharing = %mount.sharing, path = %host_path.display(), "attached cache");

        Ok(AttachedCache {
            mount: mount.clone(),
            host_path,
            lock,
        })
    }

    fn acquire_lock(&self, id: &str) -> Result<CacheLock> {
        let lock_path = self.lock_path(id);
        let unavailable = |e: std::io::Error| {
            BuildError::unavailable(format!(
                "cache '{}' lock '{}' is not accessible: {}",
                id,
                lock_path.display(),
                e
            ))
        };
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).map_err(unavailable)?;
        }

        // The lock file is never unlinked: removing a still-locked file would
        // let another process lock a fresh inode at the same path.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(unavailable)?;

        if file.try_lock_exclusive().is_err() {
            info!(cache = %id, "waiting for cache lock held by another build");
            file.lock_exclusive().map_err(unavailable)?;
        }
        Ok(CacheLock { _file: file })
    }
}

/// A cache mount resolved to a host directory for the duration of a stage.
#[derive(Debug)]
pub struct AttachedCache {
    pub mount: CacheMount,
    pub host_path: PathBuf,
    lock: Option<CacheLock>,
}

impl AttachedCache {
    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }
}

/// RAII guard: the advisory lock is released when the file is closed.
#[derive(Debug)]
struct CacheLock {
    _file: File,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    fn mount(id: &str, target: &str, sharing: SharingMode) -> CacheMount {
        CacheMount::new(id, target, sharing)
    }

    #[test]
    fn identical_declarations_collapse() {
        let decls = vec![
            mount("dep-cache", "/var/maven/.m2", SharingMode::Locked),
            mount("apt", "/var/cache/apt", SharingMode::Shared),
            mount("dep-cache", "/var/maven/.m2", SharingMode::Locked),
        ];
        let planned = plan(&decls).unwrap();
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[0].id, "dep-cache");
        assert_eq!(planned[1].id, "apt");
    }

    #[test]
    fn differing_sharing_mode_conflicts() {
        let decls = vec![
            mount("dep-cache", "/var/maven/.m2", SharingMode::Locked),
            mount("dep-cache", "/var/maven/.m2", SharingMode::Shared),
        ];
        let err = plan(&decls).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CacheConflict);
        assert!(err.to_string().contains("dep-cache"));
    }

    #[test]
    fn ids_sharing_an_env_var_conflict() {
        let decls = vec![
            mount("dep-cache", "/root/.m2", SharingMode::Shared),
            mount("dep.cache", "/var/cache/deps", SharingMode::Shared),
        ];
        let err = plan(&decls).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CacheConflict);
        let message = err.to_string();
        assert!(message.contains("'dep-cache'") && message.contains("'dep.cache'"));
        assert!(message.contains("CACHE_DIR_DEP_CACHE"));
    }

    #[test]
    fn differing_target_conflicts() {
        let decls = vec![
            mount("dep-cache", "/root/.m2", SharingMode::Shared),
            mount("dep-cache", "/var/maven/.m2", SharingMode::Shared),
        ];
        assert_eq!(plan(&decls).unwrap_err().kind(), ErrorKind::CacheConflict);
    }

    #[test]
    fn unsafe_ids_and_relative_targets_are_rejected() {
        let bad_id = vec![mount("../x", "/cache", SharingMode::Shared)];
        assert_eq!(plan(&bad_id).unwrap_err().kind(), ErrorKind::InvalidSpec);

        let relative = vec![mount("x", "cache", SharingMode::Shared)];
        assert_eq!(plan(&relative).unwrap_err().kind(), ErrorKind::InvalidSpec);
    }

    #[test]
    fn env_var_is_sanitized() {
        let m = mount("dep-cache.v2", "/c", SharingMode::Shared);
        assert_eq!(m.env_var(), "CACHE_DIR_DEP_CACHE_V2");
    }

    #[test]
    fn project_key_is_stable_and_distinct() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("app-a");
        let b = tmp.path().join("app-b");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();

        assert_eq!(project_key(&a), project_key(&a));
        assert_ne!(project_key(&a), project_key(&b));
        assert!(project_key(&a).starts_with("app-a-"));
    }

    #[test]
    fn open_does_not_touch_disk() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("caches");
        let store = CacheStore::open(&root, "proj-0000");
        assert!(!root.exists());
        assert!(store.root().ends_with("proj-0000"));
    }

    #[test]
    fn shared_and_locked_persist_exclusive_is_scratch() {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::open(&tmp.path().join("caches"), "proj");
        let scratch = tmp.path().join("stage");

        let shared = store
            .attach(&mount("apt", "/var/cache/apt", SharingMode::Shared), &scratch)
            .unwrap();
        assert!(shared.host_path.starts_with(store.root()));
        assert!(!shared.is_locked());

        let locked = store
            .attach(&mount("m2", "/root/.m2", SharingMode::Locked), &scratch)
            .unwrap();
        assert!(locked.is_locked());
        assert!(store.root().join("locks/m2.lock").is_file());
        drop(locked);

        // Released: a second attach must not block.
        let again = store
            .attach(&mount("m2", "/root/.m2", SharingMode::Locked), &scratch)
            .unwrap();
        assert!(again.is_locked());

        let private = store
            .attach(&mount("tmp", "/tmp/build", SharingMode::Exclusive), &scratch)
            .unwrap();
        assert!(private.host_path.starts_with(&scratch));
    }
}
