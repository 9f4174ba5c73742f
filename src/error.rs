//! Error taxonomy for the build pipeline.
//!
//! Every failure maps onto an [`ErrorKind`], and every kind maps onto the
//! exit code the CLI reports. Validation kinds (`UnknownFlag`,
//! `InvalidValue`, `CacheConflict`, `InvalidSpec`) are raised while loading a
//! build spec, before anything executes. Execution kinds (`ScriptNotFound`,
//! `ScriptFailed`, `EnvironmentUnavailable`) abort the running build.

use std::fmt;
use std::io;

use thiserror::Error;

/// Number of captured log lines attached to a failure.
pub const LOG_TAIL_LINES: usize = 20;

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ScriptNotFound,
    ScriptFailed,
    EnvironmentUnavailable,
    CacheConflict,
    UnknownFlag,
    InvalidValue,
    InvalidSpec,
    Io,
}

impl ErrorKind {
    /// Process exit code reported for this kind of failure.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::InvalidSpec => 2,
            ErrorKind::Io => 3,
            ErrorKind::ScriptNotFound => 10,
            ErrorKind::ScriptFailed => 11,
            ErrorKind::EnvironmentUnavailable => 12,
            ErrorKind::CacheConflict => 13,
            ErrorKind::UnknownFlag => 14,
            ErrorKind::InvalidValue => 15,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ScriptNotFound => "script_not_found",
            ErrorKind::ScriptFailed => "script_failed",
            ErrorKind::EnvironmentUnavailable => "environment_unavailable",
            ErrorKind::CacheConflict => "cache_conflict",
            ErrorKind::UnknownFlag => "unknown_flag",
            ErrorKind::InvalidValue => "invalid_value",
            ErrorKind::InvalidSpec => "invalid_spec",
            ErrorKind::Io => "io",
        }
    }

    /// Validation kinds are detected before any stage runs.
    pub fn is_validation(self) -> bool {
        matches!(
            self,
            ErrorKind::CacheConflict
                | ErrorKind::UnknownFlag
                | ErrorKind::InvalidValue
                | ErrorKind::InvalidSpec
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    /// Every candidate in the search order was absent, empty or failed to fetch.
    #[error("no usable build script; tried: {}", tried.join("; "))]
    ScriptNotFound { tried: Vec<String> },

    /// The script ran and terminated unsuccessfully.
    #[error("build script terminated with {status}")]
    ScriptFailed { status: String, code: Option<i32> },

    /// A precondition of the stage environment does not hold.
    #[error("environment unavailable: {reason}")]
    EnvironmentUnavailable { reason: String },

    #[error("cache '{id}' declared with conflicting settings: {first} vs {second}")]
    CacheConflict {
        id: String,
        first: String,
        second: String,
    },

    #[error("unknown flag '{name}'")]
    UnknownFlag { name: String },

    #[error("invalid value '{value}' for flag '{name}': expected {expected}")]
    InvalidValue {
        name: String,
        value: String,
        expected: String,
    },

    #[error("invalid build spec: {0}")]
    InvalidSpec(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl BuildError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BuildError::ScriptNotFound { .. } => ErrorKind::ScriptNotFound,
            BuildError::ScriptFailed { .. } => ErrorKind::ScriptFailed,
            BuildError::EnvironmentUnavailable { .. } => ErrorKind::EnvironmentUnavailable,
            BuildError::CacheConflict { .. } => ErrorKind::CacheConflict,
            BuildError::UnknownFlag { .. } => ErrorKind::UnknownFlag,
            BuildError::InvalidValue { .. } => ErrorKind::InvalidValue,
            BuildError::InvalidSpec(_) => ErrorKind::InvalidSpec,
            BuildError::Io { .. } => ErrorKind::Io,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    pub(crate) fn unavailable(reason: impl Into<String>) -> Self {
        BuildError::EnvironmentUnavailable {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_spec(message: impl Into<String>) -> Self {
        BuildError::InvalidSpec(message.into())
    }
}

/// Attach a human-readable context to an `io::Error`.
pub trait IoContext<T> {
    fn io_context<F, S>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context<F, S>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| BuildError::Io {
            context: context().into(),
            source,
        })
    }
}

/// A build failure together with where it happened and what the script printed.
#[derive(Debug, Error)]
pub struct PipelineError {
    /// Stage that was resolving or running when the build failed.
    pub stage: Option<String>,
    /// Last lines of the captured log, oldest first.
    pub log_tail: Vec<String>,
    #[source]
    pub error: BuildError,
}

impl PipelineError {
    pub fn new(error: BuildError) -> Self {
        Self {
            stage: None,
            log_tail: Vec::new(),
            error,
        }
    }

    pub fn in_stage(stage: impl Into<String>, error: BuildError) -> Self {
        Self {
            stage: Some(stage.into()),
            log_tail: Vec::new(),
            error,
        }
    }

    pub fn with_log_tail(mut self, log: &[String]) -> Self {
        self.log_tail = tail(log, LOG_TAIL_LINES);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    pub fn exit_code(&self) -> i32 {
        self.error.exit_code()
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.stage {
            Some(stage) => write!(f, "stage '{}' failed ({}): {}", stage, self.kind(), self.error),
            None => write!(f, "build failed ({}): {}", self.kind(), self.error),
        }
    }
}

impl From<BuildError> for PipelineError {
    fn from(error: BuildError) -> Self {
        PipelineError::new(error)
    }
}

/// Last `n` entries of `lines`, oldest first.
pub fn tail(lines: &[String], n: usize) -> Vec<String> {
    let start = lines.len().saturating_sub(n);
    lines[start..].to_vec()
}
