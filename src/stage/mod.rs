//! Stage lifecycle.
//!
//! Every manifest entry becomes a [`Stage`] built by the [`StageRegistry`].
//! Options are validated when the stage is constructed, so a stage instance
//! always holds well-formed typed options. The pipeline then drives it
//! through `preflight_check`, `run` and `post_install`, in that order.

mod registry;

pub use registry::{StageFactory, StageRegistry};

use anyhow::Result;

use crate::manifest::Architecture;
use crate::process::{Cmd, CommandResult, CommandRunner};
use crate::workspace::Workspace;

/// Shared state handed to every lifecycle call.
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    pub workspace: &'a Workspace,
    pub runner: &'a dyn CommandRunner,
    pub architecture: Architecture,
}

impl<'a> StageContext<'a> {
    pub fn new(
        workspace: &'a Workspace,
        runner: &'a dyn CommandRunner,
        architecture: Architecture,
    ) -> Self {
        Self {
            workspace,
            runner,
            architecture,
        }
    }

    /// Run a command through this context's runner.
    pub fn run(&self, cmd: Cmd) -> Result<CommandResult> {
        cmd.run(self.runner)
    }
}

/// A build step.
///
/// `preflight_check` must not mutate the workspace: by default the pipeline
/// runs every stage's preflight before the first `run`, when earlier stages
/// have not produced their artifacts yet.
pub trait Stage {
    /// Verify tools and inputs.
    fn preflight_check(&mut self, ctx: &StageContext<'_>) -> Result<()>;

    /// Do the work.
    fn run(&mut self, ctx: &StageContext<'_>) -> Result<()>;

    /// Cleanup or reporting after a successful run.
    fn post_install(&mut self, _ctx: &StageContext<'_>) -> Result<()> {
        Ok(())
    }
}
