//! Built-in stage kinds.
//!
//! Each kind parses its options with [`crate::schema::parse_options`] in its
//! constructor, so a constructed stage only ever holds valid options.

pub mod bootloader;
pub mod bootstrap;
pub mod deploy;
pub mod image;
pub mod noop;
pub mod ostree_deploy;
pub mod ostree_init;
pub mod ostree_prep;
pub mod repart;
pub mod unpack;

use std::path::PathBuf;

use serde_yaml::Value;

use crate::error::BuildError;
use crate::stage::{Stage, StageContext};
use crate::workspace::Workspace;

/// Resolve an option path that must already exist as a file.
///
/// Inputs produced by earlier stages are checked with this at the start of
/// `run`, since hoisted preflight checks happen before those stages ran.
pub(crate) fn existing_file(
    workspace: &Workspace,
    what: &str,
    path: &str,
) -> Result<PathBuf, BuildError> {
    let resolved = workspace.resolve(path);
    if resolved.is_file() {
        Ok(resolved)
    } else {
        Err(BuildError::missing_path(what, resolved))
    }
}

/// Resolve `image` and mount point for stages that work inside a disk image.
pub(crate) fn image_and_rootfs(
    ctx: &StageContext<'_>,
    image: &str,
) -> Result<(PathBuf, PathBuf), BuildError> {
    let image = existing_file(ctx.workspace, "image", image)?;
    Ok((image, ctx.workspace.rootfs().to_path_buf()))
}

/// Constructor of a built-in kind.
pub type CreateFn = fn(&Value) -> Result<Box<dyn Stage>, BuildError>;

/// A built-in kind as registered by [`crate::stage::StageRegistry::with_builtins`].
pub struct Builtin {
    pub kind: &'static str,
    pub summary: &'static str,
    pub create: CreateFn,
}

pub const BUILTINS: &[Builtin] = &[
    Builtin {
        kind: "bootloader",
        summary: "install systemd-boot and the kernel into a disk image",
        create: bootloader::BootloaderStage::create,
    },
    Builtin {
        kind: "bootstrap",
        summary: "bootstrap a Debian rootfs with mmdebstrap",
        create: bootstrap::BootstrapStage::create,
    },
    Builtin {
        kind: "deploy",
        summary: "unpack a rootfs tarball into a disk image",
        create: deploy::DeployStage::create,
    },
    Builtin {
        kind: "image",
        summary: "create, partition and format a raw disk image",
        create: image::ImageStage::create,
    },
    Builtin {
        kind: "noop",
        summary: "log the given options and do nothing",
        create: noop::NoopStage::create,
    },
    Builtin {
        kind: "ostree-deploy",
        summary: "deploy an OSTree branch into a disk image",
        create: ostree_deploy::OstreeDeployStage::create,
    },
    Builtin {
        kind: "ostree-init",
        summary: "initialize an OSTree repository",
        create: ostree_init::OstreeInitStage::create,
    },
    Builtin {
        kind: "ostree-prep",
        summary: "convert a rootfs tarball to the OSTree layout and commit it",
        create: ostree_prep::OstreePrepStage::create,
    },
    Builtin {
        kind: "repart",
        summary: "build a disk image from systemd-repart definitions",
        create: repart::RepartStage::create,
    },
    Builtin {
        kind: "unpack",
        summary: "extract a rootfs tarball into the workspace rootfs",
        create: unpack::UnpackStage::create,
    },
];
