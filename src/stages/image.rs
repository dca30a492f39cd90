//! `image`: create, partition and format a raw disk image.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_yaml::Value;
use std::path::PathBuf;

use crate::disk::{
    self, parse_size, DiskLabel, FilesystemSpec, ImageSpec, LoopDevice, PartitionSpec,
    FILESYSTEM_FIELDS, IMAGE_FIELDS, PARTITION_FIELDS,
};
use crate::error::BuildError;
use crate::preflight::{check_required_tools, warn_unless_root};
use crate::schema::{parse_options, Field, FieldType, StageOptions};
use crate::stage::{Stage, StageContext};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageOptions {
    pub image: ImageSpec,
    #[serde(default)]
    pub partitions: Vec<PartitionSpec>,
    /// Paired by position with `partitions`.
    #[serde(default)]
    pub filesystems: Vec<FilesystemSpec>,
}

impl StageOptions for ImageOptions {
    const FIELDS: &'static [Field] = &[
        Field::required("image", FieldType::Mapping(IMAGE_FIELDS)),
        Field::optional("partitions", FieldType::MappingList(PARTITION_FIELDS)),
        Field::optional("filesystems", FieldType::MappingList(FILESYSTEM_FIELDS)),
    ];

    fn validate(&self) -> Vec<String> {
        let mut violations = Vec::new();
        if let Err(e) = parse_size(&self.image.size) {
            violations.push(format!("image.size: {}", e));
        }
        if self.filesystems.len() > self.partitions.len() {
            violations.push(format!(
                "filesystems: {} entries but only {} partitions",
                self.filesystems.len(),
                self.partitions.len()
            ));
        }
        violations
    }
}

pub struct ImageStage {
    options: ImageOptions,
    label: Option<DiskLabel>,
    dev_dir: PathBuf,
}

impl ImageStage {
    pub fn new(options: ImageOptions) -> Self {
        Self {
            options,
            label: None,
            dev_dir: PathBuf::from("/dev"),
        }
    }

    pub fn create(options: &Value) -> Result<Box<dyn Stage>, BuildError> {
        let options = parse_options::<ImageOptions>("image", options)?;
        Ok(Box::new(Self::new(options)))
    }

    /// Directory holding loop partition nodes; `/dev` unless overridden.
    pub fn with_dev_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dev_dir = dir.into();
        self
    }

    fn required_tools(&self) -> Vec<(&'static str, &'static str)> {
        let mut tools = vec![
            ("parted", "parted"),
            ("losetup", "util-linux"),
            ("mkfs", "util-linux"),
        ];
        if self.options.filesystems.iter().any(|f| f.fs == "vfat") {
            tools.push(("mkfs.vfat", "dosfstools"));
        }
        if self.options.partitions.iter().any(|p| p.part_type.is_some()) {
            tools.push(("sfdisk", "fdisk"));
        }
        tools
    }
}

impl Stage for ImageStage {
    fn preflight_check(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        self.label = Some(DiskLabel::parse(&self.options.image.label)?);
        check_required_tools(ctx.runner, &self.required_tools())?;
        warn_unless_root("loop device setup");
        Ok(())
    }

    fn run(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        let label = match self.label {
            Some(label) => label,
            None => DiskLabel::parse(&self.options.image.label)?,
        };
        let image = ctx.workspace.resolve(&self.options.image.name);
        let size = parse_size(&self.options.image.size)?;

        disk::create_image(&image, size)?;
        disk::write_label(ctx.runner, &image, label)?;
        disk::create_partitions(ctx.runner, &image, &self.options.partitions)?;

        if self.options.filesystems.is_empty() {
            return Ok(());
        }

        tracing::info!("Setting up loopback device for {}", image.display());
        let device =
            LoopDevice::attach(ctx.runner, &image)?.with_dev_dir(self.dev_dir.clone());
        let formatted = disk::format_filesystems(ctx.runner, &device, &self.options.filesystems)
            .with_context(|| format!("formatting filesystems on {}", device.device().display()))?;
        device.release()?;
        tracing::info!("Formatted {} filesystem(s) on {}", formatted, image.display());
        Ok(())
    }
}
