//! OSTree repository and sysroot operations via the `ostree` CLI.

pub mod convert;

pub use convert::{convert, BootArtifacts, ConvertedRootfs};

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::process::{Cmd, CommandRunner};

/// Repository storage mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum RepoMode {
    #[default]
    #[serde(rename = "archive-z2")]
    ArchiveZ2,
    #[serde(rename = "archive")]
    Archive,
    #[serde(rename = "bare")]
    Bare,
    #[serde(rename = "bare-user")]
    BareUser,
}

impl RepoMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoMode::ArchiveZ2 => "archive-z2",
            RepoMode::Archive => "archive",
            RepoMode::Bare => "bare",
            RepoMode::BareUser => "bare-user",
        }
    }
}

impl fmt::Display for RepoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata for one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    pub branch: String,
    pub subject: String,
    pub body: Option<String>,
    /// Parent commit checksum or ref.
    pub parent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OstreeRepo {
    path: PathBuf,
}

impl OstreeRepo {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// `ostree init --repo <path> --mode <mode>`.
    pub fn init(&self, runner: &dyn CommandRunner, mode: RepoMode) -> Result<()> {
        fs::create_dir_all(&self.path)
            .with_context(|| format!("creating repository '{}'", self.path.display()))?;
        Cmd::new("ostree")
            .arg("init")
            .arg("--repo")
            .arg_path(&self.path)
            .args(["--mode", mode.as_str()])
            .error_msg(format!("Failed to initialize {}", self.path.display()))
            .run(runner)?;
        tracing::info!("Initialized {} repository at {}", mode, self.path.display());
        Ok(())
    }

    /// Commit a converted rootfs. Returns the commit checksum.
    pub fn commit(
        &self,
        runner: &dyn CommandRunner,
        rootfs: &ConvertedRootfs,
        request: &CommitRequest,
    ) -> Result<String> {
        let mut cmd = Cmd::new("ostree")
            .args(["commit", "--skip-if-unchanged"])
            .arg(format!("--repo={}", self.path.display()))
            .arg(format!("--subject={}", request.subject));
        if let Some(body) = &request.body {
            cmd = cmd.arg(format!("--body={}", body));
        }
        cmd = cmd.arg(format!("--branch={}", request.branch));
        if let Some(parent) = &request.parent {
            cmd = cmd.arg(format!("--parent={}", parent));
        }
        cmd = cmd.arg(format!("--tree=dir={}", rootfs.path().display()));

        let result = cmd.run(runner).map_err(|e| {
            tracing::error!("Failed to commit to {}", request.branch);
            e
        })?;
        let checksum = result.stdout_trimmed().to_string();
        tracing::info!("Committed {} to {}", checksum, request.branch);
        Ok(checksum)
    }

    /// Copy `branch` from the repository at `source` into this one.
    pub fn pull_local(&self, runner: &dyn CommandRunner, source: &Path, branch: &str) -> Result<()> {
        tracing::info!("Pulling {} from {}", branch, source.display());
        Cmd::new("ostree")
            .arg("pull-local")
            .arg("--repo")
            .arg_path(&self.path)
            .arg_path(source)
            .arg(branch)
            .error_msg(format!("Failed to pull {}", branch))
            .run(runner)?;
        Ok(())
    }

    /// `ostree config --repo <path> set <key> <value>`.
    pub fn config_set(&self, runner: &dyn CommandRunner, key: &str, value: &str) -> Result<()> {
        Cmd::new("ostree")
            .arg("config")
            .arg("--repo")
            .arg_path(&self.path)
            .args(["set", key, value])
            .run(runner)?;
        Ok(())
    }
}

/// A physical sysroot being provisioned with `ostree admin`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sysroot {
    path: PathBuf,
}

impl Sysroot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The system repository inside the sysroot.
    pub fn repo(&self) -> OstreeRepo {
        OstreeRepo::new(self.path.join("ostree/repo"))
    }

    pub fn init_fs(&self, runner: &dyn CommandRunner) -> Result<()> {
        Cmd::new("ostree")
            .args(["admin", "init-fs"])
            .arg_path(&self.path)
            .run(runner)?;
        Ok(())
    }

    pub fn os_init(&self, runner: &dyn CommandRunner, os_name: &str) -> Result<()> {
        Cmd::new("ostree")
            .args(["admin", "os-init", "--sysroot"])
            .arg_path(&self.path)
            .arg(os_name)
            .run(runner)?;
        Ok(())
    }

    pub fn deploy(
        &self,
        runner: &dyn CommandRunner,
        os_name: &str,
        branch: &str,
        kernel_args: &[String],
    ) -> Result<()> {
        tracing::info!("Deploying {}", branch);
        Cmd::new("ostree")
            .args(["admin", "deploy", "--sysroot"])
            .arg_path(&self.path)
            .args(["--os", os_name, branch])
            .args(kernel_args.iter().map(|k| format!("--karg={}", k)))
            .error_msg(format!("Failed to deploy {}", branch))
            .run(runner)?;
        Ok(())
    }

    /// Deployment checkouts of `os_name`, sorted. Empty if none exist yet.
    pub fn deployments(&self, os_name: &str) -> Result<Vec<PathBuf>> {
        let dir = self.path.join("ostree/deploy").join(os_name).join("deploy");
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("reading '{}'", dir.display()))
            }
        };
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("reading '{}'", dir.display()))?;
            let is_checkout = entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
                && entry.file_name().to_string_lossy().ends_with(".0");
            if is_checkout {
                found.push(entry.path());
            }
        }
        found.sort();
        Ok(found)
    }
}
