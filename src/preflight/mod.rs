//! Host tool checks run from stage preflight.
//!
//! Validates that required tools are installed before any stage does
//! destructive work, so a missing `parted` fails the build up front instead
//! of leaving a half-written image behind.
//!
//! # Example
//!
//! ```rust
//! use debforge::preflight::{check_required_tools, command_exists};
//! use debforge::process::HostRunner;
//!
//! if !command_exists(&HostRunner, "systemd-repart") {
//!     println!("systemd-repart not installed");
//! }
//!
//! let tools = &[("sh", "dash")];
//! assert!(check_required_tools(&HostRunner, tools).is_ok());
//! ```

use std::path::PathBuf;

use crate::error::BuildError;
use crate::process::CommandRunner;

/// Check if a command exists on the host system.
pub fn command_exists(runner: &dyn CommandRunner, cmd: &str) -> bool {
    runner.which(cmd).is_some()
}

/// Locate a single required tool.
pub fn require_tool(
    runner: &dyn CommandRunner,
    tool: &str,
    package: &str,
) -> Result<PathBuf, BuildError> {
    runner
        .which(tool)
        .ok_or_else(|| BuildError::CommandNotFound {
            program: tool.to_string(),
            hint: format!("install: {}", package),
        })
}

/// Check that specific tools are available.
///
/// # Arguments
///
/// * `tools` - Slice of (command, package) tuples
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err(BuildError::CommandNotFound)` naming every missing tool and its package
pub fn check_required_tools(
    runner: &dyn CommandRunner,
    tools: &[(&str, &str)],
) -> Result<(), BuildError> {
    let missing: Vec<(&str, &str)> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(runner, tool))
        .copied()
        .collect();

    if missing.is_empty() {
        return Ok(());
    }

    Err(BuildError::CommandNotFound {
        program: missing
            .iter()
            .map(|(t, _)| *t)
            .collect::<Vec<_>>()
            .join(", "),
        hint: format!(
            "install: {}",
            missing
                .iter()
                .map(|(_, p)| *p)
                .collect::<Vec<_>>()
                .join(", ")
        ),
    })
}

/// True when the process runs with effective uid 0.
pub fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Log a warning when not running as root; loop devices and mounts will fail.
pub fn warn_unless_root(purpose: &str) {
    if !running_as_root() {
        tracing::warn!("not running as root; {} will likely fail", purpose);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::process::testing::RecordingRunner;
    use crate::process::HostRunner;

    #[test]
    fn test_command_exists() {
        assert!(command_exists(&HostRunner, "ls"));
        assert!(!command_exists(
            &HostRunner,
            "definitely_not_a_real_command_12345"
        ));
    }

    #[test]
    fn test_check_required_tools_success() {
        let tools = &[("ls", "coreutils"), ("cat", "coreutils")];
        assert!(check_required_tools(&HostRunner, tools).is_ok());
    }

    #[test]
    fn test_check_required_tools_names_every_missing_tool() {
        let runner = RecordingRunner::new()
            .without_tool("parted")
            .without_tool("losetup");
        let tools = &[
            ("parted", "parted"),
            ("mkfs", "util-linux"),
            ("losetup", "mount"),
        ];
        let err = check_required_tools(&runner, tools).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommandNotFound);
        let msg = err.to_string();
        assert!(msg.contains("parted"));
        assert!(msg.contains("losetup"));
        assert!(!msg.contains("mkfs"));
    }

    #[test]
    fn test_require_tool_returns_path() {
        let path = require_tool(&RecordingRunner::new(), "ostree", "ostree").unwrap();
        assert!(path.ends_with("ostree"));
    }
}
