//! `bootstrap`: create a Debian rootfs with mmdebstrap.

use anyhow::Result;
use serde::Deserialize;
use serde_yaml::Value;

use crate::error::BuildError;
use crate::manifest::Architecture;
use crate::preflight::require_tool;
use crate::process::Cmd;
use crate::schema::{parse_options, Field, FieldType, StageOptions};
use crate::stage::{Stage, StageContext};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootstrapOptions {
    pub suite: String,
    /// Output path: a directory or a tarball, as mmdebstrap accepts.
    pub target: String,
    /// Defaults to the manifest architecture.
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub packages: Vec<String>,
    /// sources.list-style mirror file.
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub customize_hooks: Vec<String>,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub hooks: Vec<String>,
    #[serde(default)]
    pub setup_hooks: Vec<String>,
    #[serde(default)]
    pub extract_hooks: Vec<String>,
    #[serde(default)]
    pub essential_hooks: Vec<String>,
    #[serde(default)]
    pub apt_hooks: Vec<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub keyring: Vec<String>,
    #[serde(default)]
    pub dpkgopt: Vec<String>,
}

impl StageOptions for BootstrapOptions {
    const FIELDS: &'static [Field] = &[
        Field::required("suite", FieldType::String),
        Field::required("target", FieldType::String),
        Field::optional("architecture", FieldType::String),
        Field::optional("packages", FieldType::StringList),
        Field::optional("repo", FieldType::String),
        Field::optional("customize_hooks", FieldType::StringList),
        Field::optional("components", FieldType::StringList),
        Field::optional("variant", FieldType::String),
        Field::optional("hooks", FieldType::StringList),
        Field::optional("setup_hooks", FieldType::StringList),
        Field::optional("extract_hooks", FieldType::StringList),
        Field::optional("essential_hooks", FieldType::StringList),
        Field::optional("apt_hooks", FieldType::StringList),
        Field::optional("mode", FieldType::String),
        Field::optional("keyring", FieldType::StringList),
        Field::optional("dpkgopt", FieldType::StringList),
    ];

    fn validate(&self) -> Vec<String> {
        let mut violations = Vec::new();
        if self.suite.trim().is_empty() {
            violations.push("suite: must not be empty".to_string());
        }
        if self.target.trim().is_empty() {
            violations.push("target: must not be empty".to_string());
        }
        if let Some(arch) = &self.architecture {
            if let Err(e) = arch.parse::<Architecture>() {
                violations.push(format!("architecture: {}", e));
            }
        }
        violations
    }
}

pub struct BootstrapStage {
    options: BootstrapOptions,
}

impl BootstrapStage {
    pub fn create(options: &Value) -> Result<Box<dyn Stage>, BuildError> {
        let options = parse_options::<BootstrapOptions>("bootstrap", options)?;
        Ok(Box::new(Self { options }))
    }

    fn command(&self, ctx: &StageContext<'_>) -> Cmd {
        let o = &self.options;
        let arch = o
            .architecture
            .clone()
            .unwrap_or_else(|| ctx.architecture.as_str().to_string());

        let mut cmd = Cmd::new("mmdebstrap")
            .args(["--architecture", arch.as_str(), "--verbose"]);
        if !o.packages.is_empty() {
            cmd = cmd.arg(format!("--include={}", o.packages.join(",")));
        }
        cmd = cmd.args(o.customize_hooks.iter().map(|h| format!("--customize-hook={}", h)));
        if !o.components.is_empty() {
            cmd = cmd.arg(format!("--components={}", o.components.join(",")));
        }
        if let Some(variant) = &o.variant {
            cmd = cmd.arg(format!("--variant={}", variant));
        }
        cmd = cmd
            .args(o.hooks.iter().map(|h| format!("--hook-directory={}", h)))
            .args(o.setup_hooks.iter().map(|h| format!("--setup-hook={}", h)))
            .args(o.extract_hooks.iter().map(|h| format!("--extract-hook={}", h)))
            .args(o.essential_hooks.iter().map(|h| format!("--essential-hook={}", h)))
            .args(o.apt_hooks.iter().map(|h| format!("--aptopt={}", h)));
        if let Some(mode) = &o.mode {
            cmd = cmd.arg(format!("--mode={}", mode));
        }
        cmd = cmd
            .args(o.keyring.iter().map(|k| format!("--keyring={}", k)))
            .args(o.dpkgopt.iter().map(|d| format!("--dpkgopt={}", d)));

        cmd = cmd
            .arg(&o.suite)
            .arg_path(&ctx.workspace.resolve(&o.target));
        if let Some(repo) = &o.repo {
            cmd = cmd.arg_path(&ctx.workspace.resolve(repo));
        }
        cmd.stream()
            .error_msg(format!("mmdebstrap failed for {}", o.suite))
    }
}

impl Stage for BootstrapStage {
    fn preflight_check(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        require_tool(ctx.runner, "mmdebstrap", "mmdebstrap")?;
        if let Some(repo) = &self.options.repo {
            let path = ctx.workspace.resolve(repo);
            if !path.is_file() {
                return Err(BuildError::missing_path("repo configuration", path).into());
            }
        }
        Ok(())
    }

    fn run(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        tracing::info!(
            "Bootstrapping {} into {}",
            self.options.suite,
            self.options.target
        );
        ctx.run(self.command(ctx))?;
        Ok(())
    }
}
