//! Image mounts through `systemd-dissect`.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::process::{Cmd, CommandRunner};

/// An image mounted with `systemd-dissect -M`.
///
/// Unmounted with `systemd-dissect -U` when dropped. Call
/// [`release`](Self::release) on the success path to surface unmount errors.
pub struct DissectMount<'a> {
    runner: &'a dyn CommandRunner,
    mountpoint: PathBuf,
    mounted: bool,
}

impl<'a> DissectMount<'a> {
    /// Mount `image` on `mountpoint`, creating the directory if needed.
    pub fn mount(runner: &'a dyn CommandRunner, image: &Path, mountpoint: &Path) -> Result<Self> {
        fs::create_dir_all(mountpoint)
            .with_context(|| format!("creating mountpoint '{}'", mountpoint.display()))?;
        tracing::info!("Mounting {} on {}", image.display(), mountpoint.display());
        Cmd::new("systemd-dissect")
            .arg("-M")
            .arg_path(image)
            .arg_path(mountpoint)
            .error_msg(format!("Failed to mount {}", image.display()))
            .run(runner)?;
        Ok(Self {
            runner,
            mountpoint: mountpoint.to_path_buf(),
            mounted: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.mountpoint
    }

    /// Unmount now, returning any error.
    pub fn release(mut self) -> Result<()> {
        self.mounted = false;
        self.unmount()
    }

    fn unmount(&self) -> Result<()> {
        tracing::info!("Unmounting {}", self.mountpoint.display());
        Cmd::new("systemd-dissect")
            .arg("-U")
            .arg_path(&self.mountpoint)
            .error_msg(format!("Failed to unmount {}", self.mountpoint.display()))
            .run(self.runner)?;
        Ok(())
    }
}

impl Drop for DissectMount<'_> {
    fn drop(&mut self) {
        if !self.mounted {
            return;
        }
        if let Err(e) = self.unmount() {
            tracing::warn!("{:#}", e);
        }
    }
}
