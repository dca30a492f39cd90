//! Stage-pipeline builder for Debian-based OS artifacts.
//!
//! A YAML manifest lists build stages in order. Each entry is resolved to a
//! [`Stage`] through the [`StageRegistry`] and driven by the [`Pipeline`]
//! through `preflight_check`, `run` and `post_install` inside a per-build
//! [`workspace::Workspace`].
//!
//! # Architecture
//!
//! ```text
//! Manifest ──► Pipeline ──► StageRegistry ──► Box<dyn Stage>
//!                 │                                │
//!                 └── Workspace, CommandRunner ────┘
//!
//! stages/
//!     ├── bootstrap      mmdebstrap
//!     ├── unpack         tarball → rootfs
//!     ├── image          parted + losetup + mkfs      (disk/)
//!     ├── repart         systemd-repart
//!     ├── ostree-init    ostree init
//!     ├── ostree-prep    rootfs → OSTree layout → commit (ostree/)
//!     ├── ostree-deploy  sysroot provisioning in a disk image
//!     ├── bootloader     bootctl + kernel-install
//!     ├── deploy         tarball → mounted disk image
//!     └── noop
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use debforge::{BuilderConfig, Manifest, Pipeline};
//!
//! let manifest = Manifest::load("debian.yaml".as_ref())?;
//! let report = Pipeline::new(BuilderConfig::load(None)?).run(&manifest)?;
//! assert!(report.succeeded());
//! ```

pub mod archive;
pub mod config;
pub mod disk;
pub mod error;
pub mod filesystem;
pub mod manifest;
pub mod mount;
pub mod nspawn;
pub mod ostree;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod report;
pub mod schema;
pub mod stage;
pub mod stages;
pub mod workspace;

pub use config::BuilderConfig;
pub use error::{BuildError, ErrorKind, Phase};
pub use manifest::{Architecture, Manifest, StageSpec};
pub use pipeline::Pipeline;
pub use process::{Cmd, CommandRunner, HostRunner};
pub use report::BuildReport;
pub use stage::{Stage, StageContext, StageRegistry};
