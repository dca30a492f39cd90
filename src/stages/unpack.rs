//! `unpack`: extract a rootfs tarball into the workspace rootfs.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_yaml::Value;

use super::existing_file;
use crate::archive::{self, UnpackOptions};
use crate::error::BuildError;
use crate::schema::{parse_options, Field, FieldType, StageOptions};
use crate::stage::{Stage, StageContext};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnpackStageOptions {
    /// gzip-compressed tarball, relative to the workspace.
    pub target: String,
}

impl StageOptions for UnpackStageOptions {
    const FIELDS: &'static [Field] = &[Field::required("target", FieldType::String)];
}

pub struct UnpackStage {
    options: UnpackStageOptions,
}

impl UnpackStage {
    pub fn create(options: &Value) -> Result<Box<dyn Stage>, BuildError> {
        let options = parse_options::<UnpackStageOptions>("unpack", options)?;
        Ok(Box::new(Self { options }))
    }
}

impl Stage for UnpackStage {
    fn preflight_check(&mut self, _ctx: &StageContext<'_>) -> Result<()> {
        Ok(())
    }

    fn run(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        let target = existing_file(ctx.workspace, "tarball", &self.options.target)?;
        let rootfs = ctx.workspace.reset_rootfs()?;
        let count = archive::unpack(&target, rootfs, UnpackOptions { exclude_dev: true })
            .with_context(|| format!("unpacking {}", target.display()))?;
        tracing::info!("Unpacked {} entries into {}", count, rootfs.display());
        Ok(())
    }
}
