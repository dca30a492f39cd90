//! Partition table and filesystem creation.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use super::{DiskLabel, FilesystemSpec, LoopDevice, PartitionSpec};
use crate::process::{Cmd, CommandRunner};

/// Allocate a sparse image of `size` bytes, replacing any existing file.
pub fn create_image(path: &Path, size: u64) -> Result<()> {
    if path.symlink_metadata().is_ok() {
        tracing::info!("Found previous image, removing {}", path.display());
        fs::remove_file(path)
            .with_context(|| format!("removing previous image '{}'", path.display()))?;
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory '{}'", parent.display()))?;
    }

    tracing::info!("Creating {} ({} bytes)", path.display(), size);
    let file = fs::File::create(path)
        .with_context(|| format!("creating image '{}'", path.display()))?;
    file.set_len(size)
        .with_context(|| format!("sizing image '{}'", path.display()))?;
    Ok(())
}

pub fn write_label(runner: &dyn CommandRunner, image: &Path, label: DiskLabel) -> Result<()> {
    tracing::info!("Creating {} label for {}", label.as_str(), image.display());
    Cmd::new("parted")
        .arg("-s")
        .arg_path(image)
        .args(["mklabel", label.as_str()])
        .error_msg("parted mklabel failed")
        .run(runner)?;
    Ok(())
}

/// Create partitions in order. Partition `i` (1-based) is `partitions[i - 1]`.
pub fn create_partitions(
    runner: &dyn CommandRunner,
    image: &Path,
    partitions: &[PartitionSpec],
) -> Result<()> {
    for (index, part) in (1..).zip(partitions) {
        tracing::info!("Creating partition {} ({})", index, part.name);
        Cmd::new("parted")
            .arg("-s")
            .arg_path(image)
            .args(["--", "mkpart", part.name.as_str(), part.start.as_str(), part.end.as_str()])
            .error_msg(format!("creating partition {} ({})", index, part.name))
            .run(runner)?;

        for flag in &part.flags {
            Cmd::new("parted")
                .arg("-s")
                .arg_path(image)
                .args(["--", "set", index.to_string().as_str(), flag.as_str(), "on"])
                .error_msg(format!("setting flag '{}' on partition {}", flag, index))
                .run(runner)?;
        }

        if let Some(part_type) = &part.part_type {
            Cmd::new("sfdisk")
                .arg("--part-type")
                .arg_path(image)
                .args([index.to_string().as_str(), part_type.as_str()])
                .error_msg(format!("setting type of partition {}", index))
                .run(runner)?;
        }
    }
    Ok(())
}

/// `mkfs` invocation for one filesystem.
pub fn mkfs_command(fs_type: &str, label: &str, node: &Path) -> Cmd {
    if fs_type == "vfat" {
        Cmd::new("mkfs.vfat")
            .args(["-F", "32", "-n", label])
            .arg_path(node)
    } else {
        Cmd::new("mkfs")
            .args(["-t", fs_type, "-L", label])
            .arg_path(node)
    }
}

/// Format filesystem `i` onto partition `i` of `device`. Entries whose
/// partition node does not exist are skipped. Returns how many were formatted.
pub fn format_filesystems(
    runner: &dyn CommandRunner,
    device: &LoopDevice<'_>,
    filesystems: &[FilesystemSpec],
) -> Result<usize> {
    let mut formatted = 0;
    for (index, spec) in (1..).zip(filesystems) {
        let node = device.partition_node(index);
        if !node.exists() {
            tracing::debug!("{} does not exist, skipping {}", node.display(), spec.name);
            continue;
        }
        tracing::info!("Formatting {} as {} ({})", node.display(), spec.fs, spec.name);
        mkfs_command(&spec.fs, &spec.label, &node)
            .error_msg(format!("formatting {} for {}", node.display(), spec.name))
            .run(runner)?;
        formatted += 1;
    }
    Ok(formatted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::RecordingRunner;
    use tempfile::TempDir;

    fn part(name: &str, flags: &[&str], part_type: Option<&str>) -> PartitionSpec {
        PartitionSpec {
            name: name.into(),
            start: "1MiB".into(),
            end: "100%".into(),
            flags: flags.iter().map(|f| f.to_string()).collect(),
            part_type: part_type.map(str::to_string),
        }
    }

    #[test]
    fn test_create_image_replaces_previous() {
        let temp = TempDir::new().unwrap();
        let img = temp.path().join("disk.img");
        fs::write(&img, "old contents").unwrap();
        create_image(&img, 4 * 1024 * 1024).unwrap();
        assert_eq!(fs::metadata(&img).unwrap().len(), 4 * 1024 * 1024);
        assert!(fs::read(&img).unwrap().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_partition_index_is_position() {
        let runner = RecordingRunner::new();
        let img = Path::new("/ws/disk.img");
        create_partitions(
            &runner,
            img,
            &[
                part("esp", &["boot", "esp"], Some("U")),
                part("root", &[], None),
                part("home", &["msftdata"], Some("L")),
            ],
        )
        .unwrap();

        assert_eq!(
            runner.commands(),
            vec![
                "parted -s /ws/disk.img -- mkpart esp 1MiB 100%",
                "parted -s /ws/disk.img -- set 1 boot on",
                "parted -s /ws/disk.img -- set 1 esp on",
                "sfdisk --part-type /ws/disk.img 1 U",
                "parted -s /ws/disk.img -- mkpart root 1MiB 100%",
                "parted -s /ws/disk.img -- mkpart home 1MiB 100%",
                "parted -s /ws/disk.img -- set 3 msftdata on",
                "sfdisk --part-type /ws/disk.img 3 L",
            ]
        );
    }

    #[test]
    fn test_write_label() {
        let runner = RecordingRunner::new();
        write_label(&runner, Path::new("disk.img"), DiskLabel::Gpt).unwrap();
        assert_eq!(runner.commands(), vec!["parted -s disk.img mklabel gpt"]);
    }

    #[test]
    fn test_mkfs_command_vfat_special_case() {
        let node = Path::new("/dev/loop0p1");
        assert_eq!(
            mkfs_command("vfat", "ESP", node).to_string(),
            "mkfs.vfat -F 32 -n ESP /dev/loop0p1"
        );
        assert_eq!(
            mkfs_command("ext4", "root", node).to_string(),
            "mkfs -t ext4 -L root /dev/loop0p1"
        );
    }

    #[test]
    fn test_format_skips_missing_nodes() {
        let dev = TempDir::new().unwrap();
        fs::write(dev.path().join("loop4p2"), "").unwrap();
        let runner = RecordingRunner::new().stdout_for("losetup", "/dev/loop4");
        let lo = LoopDevice::attach(&runner, Path::new("disk.img"))
            .unwrap()
            .with_dev_dir(dev.path());

        let fss = vec![
            FilesystemSpec {
                fs: "vfat".into(),
                label: "ESP".into(),
                name: "esp".into(),
            },
            FilesystemSpec {
                fs: "ext4".into(),
                label: "root".into(),
                name: "root".into(),
            },
        ];
        let formatted = format_filesystems(&runner, &lo, &fss).unwrap();
        assert_eq!(formatted, 1);
        let mkfs = runner.commands_for("mkfs");
        assert_eq!(mkfs.len(), 1);
        assert!(mkfs[0].starts_with("mkfs -t ext4 -L root"));
        assert!(runner.commands_for("mkfs.vfat").is_empty());
        lo.release().unwrap();
    }
}
