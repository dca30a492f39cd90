//! `ostree-prep`: turn a rootfs tarball into an OSTree commit.
//!
//! The tarball is unpacked into the workspace rootfs, converted to the OSTree
//! layout with [`crate::ostree::convert`] and committed to `branch`. The
//! rootfs is removed once the commit succeeded.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_yaml::Value;

use super::existing_file;
use crate::archive::{self, UnpackOptions};
use crate::error::BuildError;
use crate::ostree::{self, CommitRequest, OstreeRepo};
use crate::preflight::require_tool;
use crate::schema::{parse_options, Field, FieldType, StageOptions};
use crate::stage::{Stage, StageContext};

const DEFAULT_SUBJECT: &str = "Initial commit";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OstreePrepOptions {
    pub repo: String,
    pub branch: String,
    /// Rootfs tarball, relative to the workspace.
    pub target: String,
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
}

fn default_subject() -> String {
    DEFAULT_SUBJECT.to_string()
}

impl StageOptions for OstreePrepOptions {
    const FIELDS: &'static [Field] = &[
        Field::required("repo", FieldType::String),
        Field::required("branch", FieldType::String),
        Field::required("target", FieldType::String),
        Field::optional("subject", FieldType::String),
        Field::optional("body", FieldType::String),
        Field::optional("parent", FieldType::String),
    ];

    fn validate(&self) -> Vec<String> {
        if self.branch.trim().is_empty() {
            vec!["branch: must not be empty".to_string()]
        } else {
            Vec::new()
        }
    }
}

pub struct OstreePrepStage {
    options: OstreePrepOptions,
    commit: Option<String>,
}

impl OstreePrepStage {
    pub fn create(options: &Value) -> Result<Box<dyn Stage>, BuildError> {
        let options = parse_options::<OstreePrepOptions>("ostree-prep", options)?;
        Ok(Box::new(Self {
            options,
            commit: None,
        }))
    }
}

impl Stage for OstreePrepStage {
    fn preflight_check(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        require_tool(ctx.runner, "ostree", "ostree")?;
        Ok(())
    }

    fn run(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        let target = existing_file(ctx.workspace, "rootfs tarball", &self.options.target)?;
        let repo = OstreeRepo::new(ctx.workspace.resolve(&self.options.repo));

        tracing::info!("Creating ostree branch {}", self.options.branch);
        let rootfs = ctx.workspace.reset_rootfs()?;
        archive::unpack(&target, rootfs, UnpackOptions { exclude_dev: true })
            .with_context(|| format!("unpacking {}", target.display()))?;

        let converted = ostree::convert(rootfs)?;
        tracing::info!(
            "Kernel {} (checksum {})",
            converted.boot().kernel.display(),
            converted.boot().checksum
        );

        let checksum = repo.commit(
            ctx.runner,
            &converted,
            &CommitRequest {
                branch: self.options.branch.clone(),
                subject: self.options.subject.clone(),
                body: self.options.body.clone(),
                parent: self.options.parent.clone(),
            },
        )?;
        self.commit = Some(checksum);
        Ok(())
    }

    fn post_install(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        if let Some(commit) = &self.commit {
            tracing::info!("{} is at {}", self.options.branch, commit);
        }
        tracing::info!("Cleaning up {}", ctx.workspace.rootfs().display());
        ctx.workspace.remove_rootfs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::fixtures::write_tarball;
    use crate::error::{classify, ErrorKind};
    use crate::process::testing::RecordingRunner;
    use crate::stages::testing::{yaml, Fixture};

    const OPTIONS: &str = "repo: ostree_repo\nbranch: debian/bookworm\ntarget: rootfs.tar.gz\n";

    #[test]
    fn test_convert_and_commit() {
        let fixture = Fixture::new();
        let ws = &fixture.workspace;
        write_tarball(
            &ws.root().join("rootfs.tar.gz"),
            &["./boot", "./etc", "./usr", "./opt"],
            &[
                ("./boot/vmlinuz-6.1.0-amd64", b"kernel", 0o644),
                ("./boot/initrd.img-6.1.0-amd64", b"initrd", 0o644),
                ("./boot/config-6.1.0-amd64", b"CONFIG_X=y", 0o644),
                ("./etc/hostname", b"debian", 0o644),
            ],
        );
        let runner = RecordingRunner::new().stdout_for("ostree", "f00d\n");
        let ctx = fixture.ctx(&runner);

        let mut stage = OstreePrepStage::create(&yaml(OPTIONS)).unwrap();
        stage.preflight_check(&ctx).unwrap();
        stage.run(&ctx).unwrap();

        let rootfs = ws.rootfs();
        assert!(rootfs.join("usr/etc/hostname").is_file());
        assert!(rootfs.join("usr/lib/ostree-boot/config-6.1.0-amd64").is_file());
        assert!(std::fs::read_link(rootfs.join("opt")).is_ok());
        let commands = runner.commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].starts_with(&format!(
            "ostree commit --skip-if-unchanged --repo={} '--subject=Initial commit' \
             --branch=debian/bookworm --tree=dir=",
            ws.root().join("ostree_repo").display()
        )));

        stage.post_install(&ctx).unwrap();
        assert!(!rootfs.exists());
    }

    #[test]
    fn test_two_kernels_never_commits() {
        let fixture = Fixture::new();
        write_tarball(
            &fixture.workspace.root().join("rootfs.tar.gz"),
            &["./boot"],
            &[
                ("./boot/vmlinuz-6.1.0-amd64", b"a", 0o644),
                ("./boot/vmlinuz-6.5.0-amd64", b"b", 0o644),
            ],
        );
        let runner = RecordingRunner::new();
        let mut stage = OstreePrepStage::create(&yaml(OPTIONS)).unwrap();
        let err = stage.run(&fixture.ctx(&runner)).unwrap_err();
        assert_eq!(classify(&err), ErrorKind::Assertion);
        assert!(runner.commands_for("ostree").is_empty());
    }

    #[test]
    fn test_commit_failure_is_fatal() {
        let fixture = Fixture::new();
        write_tarball(
            &fixture.workspace.root().join("rootfs.tar.gz"),
            &["./boot"],
            &[("./boot/vmlinuz-6.1.0-amd64", b"k", 0o644)],
        );
        let runner = RecordingRunner::new().fail_on("ostree");
        let mut stage = OstreePrepStage::create(&yaml(OPTIONS)).unwrap();
        let err = stage.run(&fixture.ctx(&runner)).unwrap_err();
        assert_eq!(classify(&err), ErrorKind::Command);
    }

    #[test]
    fn test_subject_and_parent_options() {
        let fixture = Fixture::new();
        write_tarball(
            &fixture.workspace.root().join("rootfs.tar.gz"),
            &["./boot"],
            &[("./boot/vmlinuz-6.1.0-amd64", b"k", 0o644)],
        );
        let runner = RecordingRunner::new();
        let mut stage = OstreePrepStage::create(&yaml(
            "repo: r\nbranch: b\ntarget: rootfs.tar.gz\nsubject: Nightly\nparent: abc\n",
        ))
        .unwrap();
        stage.run(&fixture.ctx(&runner)).unwrap();
        let cmd = &runner.commands()[0];
        assert!(cmd.contains("--subject=Nightly"));
        assert!(cmd.contains("--parent=abc"));
    }
}
