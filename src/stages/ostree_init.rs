//! `ostree-init`: create the build's OSTree repository.

use anyhow::Result;
use serde::Deserialize;
use serde_yaml::Value;

use crate::error::BuildError;
use crate::ostree::{OstreeRepo, RepoMode};
use crate::preflight::require_tool;
use crate::schema::{parse_options, Field, FieldType, StageOptions};
use crate::stage::{Stage, StageContext};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OstreeInitOptions {
    pub repo: String,
    #[serde(default)]
    pub mode: RepoMode,
}

impl StageOptions for OstreeInitOptions {
    const FIELDS: &'static [Field] = &[
        Field::required("repo", FieldType::String),
        Field::optional("mode", FieldType::String),
    ];
}

pub struct OstreeInitStage {
    options: OstreeInitOptions,
}

impl OstreeInitStage {
    pub fn create(options: &Value) -> Result<Box<dyn Stage>, BuildError> {
        let options = parse_options::<OstreeInitOptions>("ostree-init", options)?;
        Ok(Box::new(Self { options }))
    }
}

impl Stage for OstreeInitStage {
    fn preflight_check(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        require_tool(ctx.runner, "ostree", "ostree")?;
        Ok(())
    }

    fn run(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        let repo = OstreeRepo::new(ctx.workspace.resolve(&self.options.repo));
        if repo.exists() {
            tracing::warn!("{} already exists, skipping", repo.path().display());
            return Ok(());
        }
        repo.init(ctx.runner, self.options.mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::RecordingRunner;
    use crate::stages::testing::{yaml, Fixture};
    use std::fs;

    #[test]
    fn test_init_with_mode() {
        let fixture = Fixture::new();
        let runner = RecordingRunner::new();
        let mut stage = OstreeInitStage::create(&yaml("repo: ostree_repo\nmode: bare-user\n")).unwrap();
        stage.run(&fixture.ctx(&runner)).unwrap();
        assert_eq!(
            runner.commands(),
            vec![format!(
                "ostree init --repo {} --mode bare-user",
                fixture.workspace.root().join("ostree_repo").display()
            )]
        );
    }

    #[test]
    fn test_existing_repo_skipped() {
        let fixture = Fixture::new();
        fs::create_dir_all(fixture.workspace.root().join("ostree_repo")).unwrap();
        let runner = RecordingRunner::new();
        let mut stage = OstreeInitStage::create(&yaml("repo: ostree_repo\n")).unwrap();
        stage.run(&fixture.ctx(&runner)).unwrap();
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn test_unknown_mode_rejected() {
        assert!(OstreeInitStage::create(&yaml("repo: r\nmode: compressed\n")).is_err());
    }
}
