//! Error types for manifest validation, tool invocation and stage execution.
//!
//! Stage code works in `anyhow::Result` and raises a [`BuildError`] wherever
//! the caller needs to tell failure kinds apart. The pipeline wraps every
//! stage failure in [`BuildError::Stage`]; [`BuildError::root_kind`] walks the
//! chain back down to the classification that caused it.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Lifecycle phase a stage failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Resolving the stage kind and validating its options.
    Load,
    PreflightCheck,
    Run,
    PostInstall,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Load => write!(f, "load"),
            Phase::PreflightCheck => write!(f, "preflight"),
            Phase::Run => write!(f, "run"),
            Phase::PostInstall => write!(f, "post-install"),
        }
    }
}

/// Coarse classification of a [`BuildError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    CommandNotFound,
    Schema,
    Command,
    Assertion,
    Io,
    /// A stage failed with an error that carries no [`BuildError`].
    Other,
}

/// Errors raised while building an artifact.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Malformed, missing or unsupported manifest or option values.
    #[error("configuration error: {0}")]
    Config(String),

    /// A required external tool is not installed.
    #[error("command not found: {program} ({hint})")]
    CommandNotFound { program: String, hint: String },

    /// Stage options failed structural validation. Every violation is listed.
    #[error("invalid options for stage '{kind}':\n  {}", .violations.join("\n  "))]
    Schema {
        kind: String,
        violations: Vec<String>,
    },

    /// An external tool exited unsuccessfully.
    #[error("'{command}' failed (exit code {status}){}", format_stderr(.stderr))]
    Command {
        command: String,
        status: i32,
        stderr: String,
    },

    /// A filesystem-layout invariant did not hold.
    #[error("assertion failed: {0}")]
    Assertion(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Creating the workspace or copying sources into it failed.
    #[error("workspace setup failed")]
    Workspace(#[source] anyhow::Error),

    /// A stage lifecycle call failed.
    #[error("stage {index} ('{kind}') failed during {phase}")]
    Stage {
        index: usize,
        kind: String,
        phase: Phase,
        #[source]
        source: anyhow::Error,
    },
}

fn format_stderr(stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(":\n{stderr}")
    }
}

impl BuildError {
    pub fn config(msg: impl Into<String>) -> Self {
        BuildError::Config(msg.into())
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        BuildError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn io_at(action: &str, path: &std::path::Path, source: io::Error) -> Self {
        Self::io(format!("{} '{}'", action, path.display()), source)
    }

    pub fn missing_path(what: &str, path: PathBuf) -> Self {
        BuildError::Config(format!("{} not found: {}", what, path.display()))
    }

    /// Classification of this error itself, without looking through `Stage`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BuildError::Config(_) => ErrorKind::Config,
            BuildError::CommandNotFound { .. } => ErrorKind::CommandNotFound,
            BuildError::Schema { .. } => ErrorKind::Schema,
            BuildError::Command { .. } => ErrorKind::Command,
            BuildError::Assertion(_) => ErrorKind::Assertion,
            BuildError::Io { .. } => ErrorKind::Io,
            BuildError::Workspace(_) => ErrorKind::Io,
            BuildError::Stage { .. } => ErrorKind::Other,
        }
    }

    /// Classification of the error that caused this one.
    ///
    /// For [`BuildError::Stage`] this searches the wrapped chain for the first
    /// typed error; plain `std::io::Error`s classify as [`ErrorKind::Io`].
    pub fn root_kind(&self) -> ErrorKind {
        match self {
            BuildError::Stage { source, .. } => classify(source),
            BuildError::Workspace(source) => match classify(source) {
                ErrorKind::Other => ErrorKind::Io,
                kind => kind,
            },
            other => other.kind(),
        }
    }

    /// Stage index (1-based) and kind, if this is a stage failure.
    pub fn stage(&self) -> Option<(usize, &str)> {
        match self {
            BuildError::Stage { index, kind, .. } => Some((*index, kind.as_str())),
            _ => None,
        }
    }
}

/// Classify an `anyhow` chain by its first [`BuildError`] or `io::Error`.
pub fn classify(err: &anyhow::Error) -> ErrorKind {
    for cause in err.chain() {
        if let Some(build) = cause.downcast_ref::<BuildError>() {
            return build.root_kind();
        }
        if cause.downcast_ref::<io::Error>().is_some() {
            return ErrorKind::Io;
        }
    }
    ErrorKind::Other
}

/// Render an error and all of its sources as `outer: inner: root`.
pub fn display_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut current = err.source();
    while let Some(cause) = current {
        parts.push(cause.to_string());
        current = cause.source();
    }
    parts.join(": ")
}
