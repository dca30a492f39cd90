use anyhow::Result;
use serde_yaml::Value;

use crate::error::BuildError;
use crate::stage::{Stage, StageContext};

/// Accepts any options mapping and logs it.
pub struct NoopStage {
    options: Value,
}

impl NoopStage {
    pub fn create(options: &Value) -> Result<Box<dyn Stage>, BuildError> {
        match options {
            Value::Mapping(_) | Value::Null => Ok(Box::new(Self {
                options: options.clone(),
            })),
            _ => Err(BuildError::Schema {
                kind: "noop".into(),
                violations: vec!["options must be a mapping".into()],
            }),
        }
    }
}

impl Stage for NoopStage {
    fn preflight_check(&mut self, _ctx: &StageContext<'_>) -> Result<()> {
        Ok(())
    }

    fn run(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        tracing::info!(
            workspace = %ctx.workspace.root().display(),
            "noop options: {:?}",
            self.options
        );
        Ok(())
    }
}
