//! Centralized command execution with consistent error handling.
//!
//! Every external tool call goes through a [`Cmd`] and a [`CommandRunner`].
//! The runner is the seam between stage logic and the host: [`HostRunner`]
//! spawns real processes, tests substitute a recording fake. Commands are
//! attempted exactly once; a non-zero exit becomes [`BuildError::Command`].

use anyhow::Result;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::BuildError;

/// Result of a command execution.
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    /// Exit code, or -1 if terminated by signal.
    pub code: i32,
    /// Captured stdout (empty for streamed commands).
    pub stdout: String,
    /// Captured stderr (empty for streamed commands).
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Builder for configuring command execution.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    /// If true, stdout/stderr go straight to the terminal.
    stream: bool,
    /// Custom error message prefix.
    error_prefix: Option<String>,
}

impl Cmd {
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            current_dir: None,
            stream: false,
            error_prefix: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Set the working directory.
    pub fn dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Inherit stdio instead of capturing it. Use for long-running tools
    /// (mmdebstrap, systemd-repart) where progress should be visible.
    pub fn stream(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Set a custom error message prefix.
    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn current_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    pub fn is_streamed(&self) -> bool {
        self.stream
    }

    /// Run through `runner`, failing on a non-zero exit.
    pub fn run(&self, runner: &dyn CommandRunner) -> Result<CommandResult> {
        tracing::debug!(command = %self, "running");
        let result = runner.execute(self)?;

        if !result.success() {
            let err = BuildError::Command {
                command: self.to_string(),
                status: result.code,
                stderr: result.stderr.clone(),
            };
            return Err(match &self.error_prefix {
                Some(prefix) => anyhow::Error::new(err).context(prefix.clone()),
                None => err.into(),
            });
        }

        Ok(result)
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Executes commands on behalf of stages.
pub trait CommandRunner: Send + Sync {
    /// Spawn the command and wait for it. Only failure to spawn is an error;
    /// exit status interpretation is left to [`Cmd::run`].
    fn execute(&self, cmd: &Cmd) -> Result<CommandResult>;

    /// Locate a program in PATH.
    fn which(&self, program: &str) -> Option<PathBuf>;
}

/// Runs commands on the build host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostRunner;

impl CommandRunner for HostRunner {
    fn execute(&self, cmd: &Cmd) -> Result<CommandResult> {
        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args);
        if let Some(dir) = &cmd.current_dir {
            command.current_dir(dir);
        }

        let spawn_error = |e: io::Error| -> anyhow::Error {
            if e.kind() == io::ErrorKind::NotFound {
                BuildError::CommandNotFound {
                    program: cmd.program.clone(),
                    hint: "is it installed?".to_string(),
                }
                .into()
            } else {
                BuildError::io(format!("Failed to execute '{}'", cmd.program), e).into()
            }
        };

        if cmd.stream {
            let status = command
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
                .map_err(spawn_error)?;
            return Ok(CommandResult {
                code: status.code().unwrap_or(-1),
                ..Default::default()
            });
        }

        let output = command.output().map_err(spawn_error)?;
        Ok(CommandResult {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn which(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }
}
