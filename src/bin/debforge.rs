//! debforge - build Debian OS artifacts from a YAML manifest.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use debforge::{BuilderConfig, Manifest, Pipeline, StageRegistry};

#[derive(Parser)]
#[command(name = "debforge")]
#[command(about = "Build Debian rootfs tarballs, OSTree commits and disk images")]
#[command(
    after_help = "QUICK START:\n  debforge check -C debian.yaml   Validate a manifest\n  debforge build -C debian.yaml   Run every stage\n  debforge stages                 List stage kinds"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Settings file (default: <config dir>/debforge/config.toml)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the build described by a manifest
    Build {
        /// Manifest to build
        #[arg(short = 'C', long = "config")]
        manifest: PathBuf,

        /// Workspace base directory (overrides settings and DEBFORGE_WORKSPACE)
        #[arg(long)]
        workspace: Option<PathBuf>,

        /// Run each stage's preflight check right before the stage instead of
        /// checking every stage up front
        #[arg(long)]
        no_hoist_preflight: bool,
    },

    /// Validate a manifest and its stage options without building
    Check {
        #[arg(short = 'C', long = "config")]
        manifest: PathBuf,
    },

    /// List the available stage kinds
    Stages,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match dispatch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = if debug {
        EnvFilter::new(default)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
    };
    if let Err(e) = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init()
    {
        eprintln!("failed to initialize logging: {}", e);
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Build {
            manifest,
            workspace,
            no_hoist_preflight,
        } => {
            let mut config = BuilderConfig::load(cli.settings.as_deref())?;
            if let Some(workspace) = workspace {
                config.workspace = workspace;
            }
            if no_hoist_preflight {
                config.hoist_preflight = false;
            }
            let manifest = Manifest::load(&manifest)?;
            let pipeline = Pipeline::new(config);
            let report = pipeline.run(&manifest)?;
            println!(
                "{} {} ({}) built in {}",
                report.name,
                report.version,
                report.architecture,
                pipeline.workspace_for(&manifest).root().display()
            );
            Ok(())
        }
        Commands::Check { manifest } => {
            let config = BuilderConfig::load(cli.settings.as_deref())?;
            let manifest = Manifest::load(&manifest)?;
            let planned = Pipeline::new(config)
                .check(&manifest)
                .with_context(|| format!("checking manifest '{}'", manifest.name))?;
            println!(
                "{} {} ({}): {} stage(s) OK",
                manifest.name,
                manifest.version,
                manifest.architecture,
                planned.len()
            );
            for p in &planned {
                println!("  {:>2}. {}", p.index, p.spec.label());
            }
            Ok(())
        }
        Commands::Stages => {
            let registry = StageRegistry::with_builtins();
            for (kind, summary) in registry.summaries() {
                println!("{:<14} {}", kind, summary);
            }
            Ok(())
        }
    }
}
