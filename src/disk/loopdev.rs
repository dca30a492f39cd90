//! RAII-managed loop device.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

use crate::process::{Cmd, CommandRunner};

/// A loop device attached to an image file with partition scanning.
///
/// Detached with `losetup -d` when dropped. Call [`release`](Self::release)
/// on the success path to surface detach errors instead of only logging them.
pub struct LoopDevice<'a> {
    runner: &'a dyn CommandRunner,
    device: PathBuf,
    dev_dir: PathBuf,
    attached: bool,
}

impl<'a> LoopDevice<'a> {
    /// Attach `image` to the first free loop device.
    pub fn attach(runner: &'a dyn CommandRunner, image: &Path) -> Result<Self> {
        let result = Cmd::new("losetup")
            .args(["--find", "--show", "--partscan"])
            .arg_path(image)
            .error_msg(format!("Failed to attach {} to a loop device", image.display()))
            .run(runner)?;

        let device = result.stdout_trimmed();
        if device.is_empty() {
            bail!("losetup printed no device for {}", image.display());
        }
        tracing::info!("Attached {} to {}", image.display(), device);

        Ok(Self {
            runner,
            device: PathBuf::from(device),
            dev_dir: PathBuf::from("/dev"),
            attached: true,
        })
    }

    /// Look for partition nodes under `dir` instead of `/dev`.
    pub fn with_dev_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dev_dir = dir.into();
        self
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    /// Node of partition `index` (1-based): `<dev>/<loop name>p<index>`.
    pub fn partition_node(&self, index: usize) -> PathBuf {
        let base = self
            .device
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.dev_dir.join(format!("{}p{}", base, index))
    }

    /// Detach now, returning any error.
    pub fn release(mut self) -> Result<()> {
        self.attached = false;
        self.detach()
    }

    fn detach(&self) -> Result<()> {
        Cmd::new("losetup")
            .arg("-d")
            .arg_path(&self.device)
            .error_msg(format!("Failed to detach {}", self.device.display()))
            .run(self.runner)?;
        tracing::info!("Detached {}", self.device.display());
        Ok(())
    }
}

impl Drop for LoopDevice<'_> {
    fn drop(&mut self) {
        if !self.attached {
            return;
        }
        if let Err(e) = self.detach() {
            tracing::warn!("Failed to detach {}: {:#}", self.device.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::RecordingRunner;

    #[test]
    fn test_attach_and_release() {
        let runner = RecordingRunner::new().stdout_for("losetup", "/dev/loop7\n");
        let lo = LoopDevice::attach(&runner, Path::new("/ws/disk.img")).unwrap();
        assert_eq!(lo.device(), Path::new("/dev/loop7"));
        assert_eq!(lo.partition_node(2), Path::new("/dev/loop7p2"));
        lo.release().unwrap();
        assert_eq!(
            runner.commands(),
            vec![
                "losetup --find --show --partscan /ws/disk.img",
                "losetup -d /dev/loop7"
            ]
        );
    }

    #[test]
    fn test_drop_detaches() {
        let runner = RecordingRunner::new().stdout_for("losetup", "/dev/loop3");
        {
            let _lo = LoopDevice::attach(&runner, Path::new("disk.img")).unwrap();
        }
        assert_eq!(runner.commands_for("losetup").len(), 2);
        assert_eq!(runner.commands()[1], "losetup -d /dev/loop3");
    }

    #[test]
    fn test_empty_output_is_error() {
        let runner = RecordingRunner::new();
        assert!(LoopDevice::attach(&runner, Path::new("disk.img")).is_err());
    }

    #[test]
    fn test_custom_dev_dir() {
        let runner = RecordingRunner::new().stdout_for("losetup", "/dev/loop0");
        let lo = LoopDevice::attach(&runner, Path::new("disk.img"))
            .unwrap()
            .with_dev_dir("/tmp/fake-dev");
        assert_eq!(lo.partition_node(1), Path::new("/tmp/fake-dev/loop0p1"));
    }
}
