//! `repart`: build a discoverable disk image with systemd-repart.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_yaml::Value;
use std::fs;
use std::path::PathBuf;

use crate::error::BuildError;
use crate::preflight::require_tool;
use crate::process::Cmd;
use crate::schema::{parse_options, Field, FieldType, StageOptions};
use crate::stage::{Stage, StageContext};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepartOptions {
    pub image: String,
    /// Passed through to `--size` (e.g. `4G`, `auto`).
    pub size: String,
    /// Directory of `repart.d` partition definitions.
    pub definitions: String,
}

impl StageOptions for RepartOptions {
    const FIELDS: &'static [Field] = &[
        Field::required("image", FieldType::String),
        Field::required("size", FieldType::String),
        Field::required("definitions", FieldType::String),
    ];
}

pub struct RepartStage {
    options: RepartOptions,
    image: Option<PathBuf>,
}

impl RepartStage {
    pub fn create(options: &Value) -> Result<Box<dyn Stage>, BuildError> {
        let options = parse_options::<RepartOptions>("repart", options)?;
        Ok(Box::new(Self {
            options,
            image: None,
        }))
    }
}

impl Stage for RepartStage {
    fn preflight_check(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        require_tool(ctx.runner, "systemd-repart", "systemd-repart")?;
        let definitions = ctx.workspace.resolve(&self.options.definitions);
        if !definitions.is_dir() {
            return Err(BuildError::missing_path("repart definitions", definitions).into());
        }
        Ok(())
    }

    fn run(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        let image = ctx.workspace.resolve(&self.options.image);
        let definitions = ctx.workspace.resolve(&self.options.definitions);

        // systemd-repart refuses to create over an existing file.
        if image.exists() {
            tracing::info!("Removing {}", image.display());
            fs::remove_file(&image)
                .with_context(|| format!("removing '{}'", image.display()))?;
        }

        tracing::info!("Creating {} via systemd-repart", image.display());
        ctx.run(
            Cmd::new("systemd-repart")
                .arg("--definitions")
                .arg_path(&definitions)
                .arg("--empty=create")
                .args(["--size", self.options.size.as_str()])
                .args([
                    "--dry-run=no",
                    "--discard=no",
                    "--offline=true",
                    "--no-pager",
                ])
                .arg_path(&image)
                .dir(ctx.workspace.root())
                .stream(),
        )?;
        self.image = Some(image);
        Ok(())
    }

    fn post_install(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        if let Some(image) = &self.image {
            tracing::info!(
                "{} can be found at {}",
                image.display(),
                ctx.workspace.root().display()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{classify, ErrorKind};
    use crate::process::testing::RecordingRunner;
    use crate::stages::testing::{yaml, Fixture};

    const OPTIONS: &str = "image: disk.raw\nsize: 4G\ndefinitions: repart.d\n";

    #[test]
    fn test_repart_command() {
        let fixture = Fixture::new();
        let ws = &fixture.workspace;
        fs::create_dir_all(ws.root().join("repart.d")).unwrap();
        fs::write(ws.root().join("disk.raw"), "previous").unwrap();

        let runner = RecordingRunner::new();
        let ctx = fixture.ctx(&runner);
        let mut stage = RepartStage::create(&yaml(OPTIONS)).unwrap();
        stage.preflight_check(&ctx).unwrap();
        stage.run(&ctx).unwrap();
        stage.post_install(&ctx).unwrap();

        assert!(!ws.root().join("disk.raw").exists());
        let calls = runner.calls();
        assert_eq!(calls[0].current_dir(), Some(ws.root()));
        assert_eq!(
            runner.commands(),
            vec![format!(
                "systemd-repart --definitions {} --empty=create --size 4G --dry-run=no \
                 --discard=no --offline=true --no-pager {}",
                ws.root().join("repart.d").display(),
                ws.root().join("disk.raw").display()
            )]
        );
    }

    #[test]
    fn test_preflight_missing_definitions() {
        let fixture = Fixture::new();
        let runner = RecordingRunner::new();
        let mut stage = RepartStage::create(&yaml(OPTIONS)).unwrap();
        let err = stage.preflight_check(&fixture.ctx(&runner)).unwrap_err();
        assert_eq!(classify(&err), ErrorKind::Config);
    }

    #[test]
    fn test_preflight_missing_tool() {
        let fixture = Fixture::new();
        fs::create_dir_all(fixture.workspace.root().join("repart.d")).unwrap();
        let runner = RecordingRunner::new().without_tool("systemd-repart");
        let mut stage = RepartStage::create(&yaml(OPTIONS)).unwrap();
        let err = stage.preflight_check(&fixture.ctx(&runner)).unwrap_err();
        assert_eq!(classify(&err), ErrorKind::CommandNotFound);
    }
}
