//! Preflight checks for stage environments.
//!
//! Verifies that the host has the tools a stage needs before anything runs,
//! so a missing interpreter or container engine surfaces as
//! `EnvironmentUnavailable` rather than as a confusing script failure.
//!
//! # Example
//!
//! ```rust
//! use stagehand::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("docker") {
//!     println!("docker not installed");
//! }
//!
//! let tools = &[("sh", "a POSIX shell"), ("tar", "tar")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use std::path::PathBuf;

use tracing::debug;

use crate::error::{BuildError, Result};

/// Locate `cmd` on `PATH`.
pub fn locate(cmd: &str) -> Option<PathBuf> {
    which::which(cmd).ok()
}

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    locate(cmd).is_some()
}

/// Check that specific tools are available.
///
/// Each tuple is `(command, what provides it)`. All missing tools are
/// reported together.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, provider) in tools {
        match locate(tool) {
            Some(path) => debug!(tool = %tool, path = %path.display(), "found host tool"),
            None => missing.push((*tool, *provider)),
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("{} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join(", ");
        return Err(BuildError::unavailable(format!(
            "missing required host tools: {msg}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_success() {
        let tools = &[("sh", "posix shell"), ("cat", "coreutils")];
        assert!(check_required_tools(tools).is_ok());
    }

    #[test]
    fn test_check_required_tools_failure() {
        let tools = &[("nonexistent_command_xyz", "fake-package")];
        let err = check_required_tools(tools).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EnvironmentUnavailable);
        assert!(err.to_string().contains("nonexistent_command_xyz"));
    }
}
