//! `ostree-deploy`: provision an OSTree sysroot inside a disk image.

use anyhow::Result;
use serde::Deserialize;
use serde_yaml::Value;
use std::path::Path;

use super::image_and_rootfs;
use crate::error::BuildError;
use crate::filesystem::{copy_dir_recursive, copy_file};
use crate::mount::DissectMount;
use crate::nspawn::Container;
use crate::ostree::{RepoMode, Sysroot};
use crate::preflight::{check_required_tools, warn_unless_root};
use crate::schema::{parse_options, Field, FieldType, StageOptions};
use crate::stage::{Stage, StageContext};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OstreeDeployOptions {
    /// Repository holding `branch`.
    pub repo: String,
    pub branch: String,
    /// Disk image whose partitions are mounted as the sysroot.
    pub image: String,
    #[serde(default)]
    pub kernel_args: Vec<String>,
    #[serde(default = "default_os_name")]
    pub os_name: String,
}

fn default_os_name() -> String {
    "debian".to_string()
}

impl StageOptions for OstreeDeployOptions {
    const FIELDS: &'static [Field] = &[
        Field::required("repo", FieldType::String),
        Field::required("branch", FieldType::String),
        Field::required("image", FieldType::String),
        Field::optional("kernel_args", FieldType::StringList),
        Field::optional("os_name", FieldType::String),
    ];
}

pub struct OstreeDeployStage {
    options: OstreeDeployOptions,
}

impl OstreeDeployStage {
    pub fn create(options: &Value) -> Result<Box<dyn Stage>, BuildError> {
        let options = parse_options::<OstreeDeployOptions>("ostree-deploy", options)?;
        Ok(Box::new(Self { options }))
    }

    fn deploy(&self, ctx: &StageContext<'_>, sysroot_path: &Path) -> Result<()> {
        let o = &self.options;
        let sysroot = Sysroot::new(sysroot_path);
        let repo = sysroot.repo();

        repo.init(ctx.runner, RepoMode::Bare)?;
        repo.pull_local(ctx.runner, &ctx.workspace.resolve(&o.repo), &o.branch)?;
        repo.config_set(ctx.runner, "sysroot.bootloader", "none")?;

        tracing::info!("Configuring {} for ostree", sysroot_path.display());
        sysroot.init_fs(ctx.runner)?;
        sysroot.os_init(ctx.runner, &o.os_name)?;
        sysroot.deploy(ctx.runner, &o.os_name, &o.branch, &o.kernel_args)?;

        let deployment = sysroot
            .deployments(&o.os_name)?
            .pop()
            .ok_or_else(|| {
                BuildError::Assertion(format!(
                    "no deployment of {} found under {}",
                    o.os_name,
                    sysroot_path.display()
                ))
            })?;

        tracing::info!("Setting up bootloader from {}", deployment.display());
        ctx.run(
            Container::new(&deployment)
                .with_efi(sysroot_path)
                .command(["bootctl", "install"])
                .error_msg("bootctl install failed"),
        )?;

        copy_dir_recursive(
            &sysroot_path.join("boot/ostree"),
            &sysroot_path.join("efi/ostree"),
        )?;
        copy_file(
            &sysroot_path
                .join("boot/loader/entries")
                .join(format!("ostree-1-{}.conf", o.os_name)),
            &sysroot_path.join("efi/loader/entries/ostree-0-1.conf"),
        )?;
        Ok(())
    }
}

impl Stage for OstreeDeployStage {
    fn preflight_check(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        check_required_tools(
            ctx.runner,
            &[
                ("ostree", "ostree"),
                ("systemd-dissect", "systemd-container"),
                ("systemd-nspawn", "systemd-container"),
            ],
        )?;
        warn_unless_root("mounting the image");
        Ok(())
    }

    fn run(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        let (image, rootfs) = image_and_rootfs(ctx, &self.options.image)?;
        ctx.workspace.remove_rootfs()?;

        tracing::info!("Deploying {} into {}", self.options.branch, image.display());
        let mount = DissectMount::mount(ctx.runner, &image, &rootfs)?;
        self.deploy(ctx, mount.path())?;
        mount.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{classify, ErrorKind};
    use crate::process::testing::RecordingRunner;
    use crate::process::{Cmd, CommandResult, CommandRunner};
    use crate::stages::testing::{yaml, Fixture};
    use std::fs;
    use std::path::PathBuf;

    /// Populates the mountpoint as if a prepared image had been mounted and
    /// `ostree admin deploy` had run.
    struct MountingRunner {
        inner: RecordingRunner,
        with_deployment: bool,
    }

    impl CommandRunner for MountingRunner {
        fn execute(&self, cmd: &Cmd) -> Result<CommandResult> {
            let args = cmd.get_args();
            if cmd.program() == "systemd-dissect" && args[0] == "-M" && self.with_deployment {
                let root = Path::new(&args[2]);
                fs::create_dir_all(root.join("ostree/deploy/debian/deploy/abc123.0")).unwrap();
                fs::create_dir_all(root.join("boot/ostree/debian-abc")).unwrap();
                fs::write(root.join("boot/ostree/debian-abc/vmlinuz-6.1"), "k").unwrap();
                fs::create_dir_all(root.join("boot/loader/entries")).unwrap();
                fs::write(
                    root.join("boot/loader/entries/ostree-1-debian.conf"),
                    "title Debian",
                )
                .unwrap();
            }
            self.inner.execute(cmd)
        }

        fn which(&self, program: &str) -> Option<PathBuf> {
            self.inner.which(program)
        }
    }

    const OPTIONS: &str = "\
repo: ostree_repo
branch: debian/bookworm
image: disk.img
kernel_args: [rw, quiet]
";

    #[test]
    fn test_deploy_sequence() {
        let fixture = Fixture::new();
        let ws = &fixture.workspace;
        fs::write(ws.root().join("disk.img"), "").unwrap();
        let runner = MountingRunner {
            inner: RecordingRunner::new(),
            with_deployment: true,
        };
        let ctx = StageContext::new(ws, &runner, crate::manifest::Architecture::Amd64);

        let mut stage = OstreeDeployStage::create(&yaml(OPTIONS)).unwrap();
        stage.preflight_check(&ctx).unwrap();
        stage.run(&ctx).unwrap();

        let rootfs = ws.rootfs().display().to_string();
        let sysrepo = ws.rootfs().join("ostree/repo").display().to_string();
        let deployment = ws
            .rootfs()
            .join("ostree/deploy/debian/deploy/abc123.0")
            .display()
            .to_string();
        assert_eq!(
            runner.inner.commands(),
            vec![
                format!("systemd-dissect -M {} {}", ws.root().join("disk.img").display(), rootfs),
                format!("ostree init --repo {} --mode bare", sysrepo),
                format!(
                    "ostree pull-local --repo {} {} debian/bookworm",
                    sysrepo,
                    ws.root().join("ostree_repo").display()
                ),
                format!("ostree config --repo {} set sysroot.bootloader none", sysrepo),
                format!("ostree admin init-fs {}", rootfs),
                format!("ostree admin os-init --sysroot {} debian", rootfs),
                format!(
                    "ostree admin deploy --sysroot {} --os debian debian/bookworm --karg=rw --karg=quiet",
                    rootfs
                ),
                format!(
                    "systemd-nspawn --quiet --as-pid2 -D {} --bind={}:/efi bootctl install",
                    deployment, rootfs
                ),
                format!("systemd-dissect -U {}", rootfs),
            ]
        );
        assert!(ws.rootfs().join("efi/ostree/debian-abc/vmlinuz-6.1").is_file());
        assert_eq!(
            fs::read_to_string(ws.rootfs().join("efi/loader/entries/ostree-0-1.conf")).unwrap(),
            "title Debian"
        );
    }

    #[test]
    fn test_missing_deployment_unmounts() {
        let fixture = Fixture::new();
        let ws = &fixture.workspace;
        fs::write(ws.root().join("disk.img"), "").unwrap();
        let runner = MountingRunner {
            inner: RecordingRunner::new(),
            with_deployment: false,
        };
        let ctx = StageContext::new(ws, &runner, crate::manifest::Architecture::Amd64);
        let mut stage = OstreeDeployStage::create(&yaml(OPTIONS)).unwrap();
        let err = stage.run(&ctx).unwrap_err();
        assert_eq!(classify(&err), ErrorKind::Assertion);
        assert!(runner
            .inner
            .commands()
            .last()
            .unwrap()
            .starts_with("systemd-dissect -U"));
        assert!(runner.inner.commands_for("systemd-nspawn").is_empty());
    }

    #[test]
    fn test_missing_image_is_config_error() {
        let fixture = Fixture::new();
        let runner = RecordingRunner::new();
        let mut stage = OstreeDeployStage::create(&yaml(OPTIONS)).unwrap();
        let err = stage.run(&fixture.ctx(&runner)).unwrap_err();
        assert_eq!(classify(&err), ErrorKind::Config);
        assert!(runner.commands().is_empty());
    }
}
