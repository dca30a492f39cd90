//! `bootloader`: install systemd-boot and register the kernel in a disk image.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_yaml::Value;
use std::fs;
use std::path::Path;

use super::image_and_rootfs;
use crate::error::BuildError;
use crate::mount::DissectMount;
use crate::nspawn::Container;
use crate::preflight::{check_required_tools, warn_unless_root};
use crate::schema::{parse_options, Field, FieldType, StageOptions};
use crate::stage::{Stage, StageContext};

/// Supported boot loaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum BootloaderType {
    #[serde(rename = "sd-boot")]
    SdBoot,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootloaderOptions {
    pub image: String,
    #[serde(rename = "type")]
    pub kind: BootloaderType,
    pub kernel_cmdline: String,
}

impl StageOptions for BootloaderOptions {
    const FIELDS: &'static [Field] = &[
        Field::required("image", FieldType::String),
        Field::required("type", FieldType::String),
        Field::required("kernel_cmdline", FieldType::String),
    ];
}

pub struct BootloaderStage {
    options: BootloaderOptions,
}

impl BootloaderStage {
    pub fn create(options: &Value) -> Result<Box<dyn Stage>, BuildError> {
        let options = parse_options::<BootloaderOptions>("bootloader", options)?;
        Ok(Box::new(Self { options }))
    }

    fn install_sd_boot(&self, ctx: &StageContext<'_>, rootfs: &Path) -> Result<()> {
        let container = Container::new(rootfs).with_efi(rootfs);

        tracing::info!("Installing bootloader via bootctl");
        ctx.run(
            container
                .command(["bootctl", "install", "--no-variables", "--entry-token", "os-id"])
                .error_msg("bootctl install failed"),
        )?;

        let kver = kernel_version(&rootfs.join("boot"))?;

        tracing::info!("Configuring kernel command-line");
        let cmdline = rootfs.join("etc/kernel/cmdline");
        if let Some(parent) = cmdline.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating '{}'", parent.display()))?;
        }
        fs::write(&cmdline, &self.options.kernel_cmdline)
            .with_context(|| format!("writing '{}'", cmdline.display()))?;

        tracing::info!("Installing kernel {}", kver);
        ctx.run(
            container
                .command(["kernel-install", "add", kver.as_str()])
                .arg(format!("/boot/vmlinuz-{}", kver))
                .error_msg(format!("kernel-install failed for {}", kver)),
        )?;
        Ok(())
    }
}

/// Version of the single `vmlinuz-<version>` in `boot_dir`.
fn kernel_version(boot_dir: &Path) -> Result<String> {
    let mut versions = Vec::new();
    for entry in
        fs::read_dir(boot_dir).with_context(|| format!("reading '{}'", boot_dir.display()))?
    {
        let entry = entry.with_context(|| format!("reading '{}'", boot_dir.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(version) = name.strip_prefix("vmlinuz-") {
            versions.push(version.to_string());
        }
    }
    versions.sort();

    match versions.len() {
        1 => Ok(versions.remove(0)),
        n => Err(BuildError::Assertion(format!(
            "expected exactly one kernel in {}, found {}: [{}]",
            boot_dir.display(),
            n,
            versions.join(", ")
        ))
        .into()),
    }
}

impl Stage for BootloaderStage {
    fn preflight_check(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        check_required_tools(
            ctx.runner,
            &[
                ("systemd-dissect", "systemd-container"),
                ("systemd-nspawn", "systemd-container"),
            ],
        )?;
        warn_unless_root("mounting the image");
        Ok(())
    }

    fn run(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        let (image, rootfs) = image_and_rootfs(ctx, &self.options.image)?;
        let mount = DissectMount::mount(ctx.runner, &image, &rootfs)?;
        match self.options.kind {
            BootloaderType::SdBoot => self.install_sd_boot(ctx, mount.path())?,
        }
        mount.release()
    }
}
