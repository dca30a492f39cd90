//! `deploy`: unpack a rootfs tarball into a disk image.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_yaml::Value;

use super::{existing_file, image_and_rootfs};
use crate::archive::{self, UnpackOptions};
use crate::error::BuildError;
use crate::mount::DissectMount;
use crate::preflight::{require_tool, warn_unless_root};
use crate::schema::{parse_options, Field, FieldType, StageOptions};
use crate::stage::{Stage, StageContext};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeployOptions {
    /// Rootfs tarball.
    pub target: String,
    pub image: String,
}

impl StageOptions for DeployOptions {
    const FIELDS: &'static [Field] = &[
        Field::required("target", FieldType::String),
        Field::required("image", FieldType::String),
    ];
}

pub struct DeployStage {
    options: DeployOptions,
}

impl DeployStage {
    pub fn create(options: &Value) -> Result<Box<dyn Stage>, BuildError> {
        let options = parse_options::<DeployOptions>("deploy", options)?;
        Ok(Box::new(Self { options }))
    }
}

impl Stage for DeployStage {
    fn preflight_check(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        require_tool(ctx.runner, "systemd-dissect", "systemd-container")?;
        warn_unless_root("mounting the image");
        Ok(())
    }

    fn run(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        let target = existing_file(ctx.workspace, "rootfs tarball", &self.options.target)?;
        let (image, rootfs) = image_and_rootfs(ctx, &self.options.image)?;

        tracing::info!("Deploying {} to {}", target.display(), image.display());
        let mount = DissectMount::mount(ctx.runner, &image, &rootfs)?;
        let count = archive::unpack(&target, mount.path(), UnpackOptions { exclude_dev: false })
            .with_context(|| format!("unpacking {}", target.display()))?;
        tracing::info!("Unpacked {} entries", count);
        mount.release()
    }
}
