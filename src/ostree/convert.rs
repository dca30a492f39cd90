//! Rootfs → OSTree layout conversion.
//!
//! Steps run in a fixed order:
//!
//! 1. boot artifacts move from `boot/` to `usr/lib/ostree-boot/`, with the
//!    kernel and initramfs renamed to carry a SHA-256 of their contents,
//! 2. kernel/initrd symlinks left by Debian are removed,
//! 3. `/etc` moves to `/usr/etc`,
//! 4. `ostree`, `sysroot` and `efi` are created,
//! 5. top-level directories that must live under `/var` become symlinks.
//!
//! Only [`convert`] produces a [`ConvertedRootfs`], and only a
//! `ConvertedRootfs` can be committed.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use crate::error::BuildError;

pub const OSTREE_BOOT_DIR: &str = "usr/lib/ostree-boot";

const CRUFT: &[&str] = &[
    "vmlinuz",
    "vmlinuz.old",
    "initrd.img",
    "initrd.img.old",
    "boot/vmlinuz",
    "boot/vmlinuz.old",
    "boot/initrd.img",
    "boot/initrd.img.old",
];

const REQUIRED_DIRS: &[&str] = &["ostree", "sysroot", "efi"];

const TOPLEVEL_LINKS: &[(&str, &str)] = &[
    ("media", "run/media"),
    ("mnt", "var/mnt"),
    ("opt", "var/opt"),
    ("ostree", "sysroot/ostree"),
    ("root", "var/roothome"),
    ("srv", "var/srv"),
    ("usr/local", "../var/usrlocal"),
];

/// Kernel and initramfs after relocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootArtifacts {
    pub kernel: PathBuf,
    pub initramfs: Option<PathBuf>,
    /// Hex SHA-256 over kernel bytes followed by initramfs bytes.
    pub checksum: String,
}

/// A rootfs in OSTree layout, ready to commit.
#[derive(Debug)]
pub struct ConvertedRootfs {
    path: PathBuf,
    boot: BootArtifacts,
}

impl ConvertedRootfs {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn boot(&self) -> &BootArtifacts {
        &self.boot
    }
}

/// Convert an unpacked Debian rootfs in place.
pub fn convert(rootfs: &Path) -> Result<ConvertedRootfs> {
    tracing::info!("Converting {} to OSTree layout", rootfs.display());
    let boot = relocate_boot_artifacts(&rootfs.join("boot"), &rootfs.join(OSTREE_BOOT_DIR))
        .context("relocating boot artifacts")?;
    remove_cruft(rootfs)?;
    relocate_etc(rootfs)?;
    ensure_dirs(rootfs)?;
    symlink_farm(rootfs)?;
    Ok(ConvertedRootfs {
        path: rootfs.to_path_buf(),
        boot,
    })
}

/// Move everything in `boot_dir` into `target_dir`, renaming the kernel and
/// initramfs to `<name>-<sha256>`.
///
/// Fails with [`BuildError::Assertion`] before moving anything unless there
/// is exactly one `vmlinuz*` and at most one `initrd.img*`/`initramfs*`.
pub fn relocate_boot_artifacts(boot_dir: &Path, target_dir: &Path) -> Result<BootArtifacts> {
    let mut kernels = Vec::new();
    let mut initrds = Vec::new();
    let mut others = Vec::new();

    let entries = match fs::read_dir(boot_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(BuildError::Assertion(format!(
                "{} does not exist; no kernel to relocate",
                boot_dir.display()
            ))
            .into())
        }
        Err(e) => return Err(BuildError::io_at("reading", boot_dir, e).into()),
    };
    for entry in entries {
        let entry = entry.map_err(|e| BuildError::io_at("reading", boot_dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with("vmlinuz") {
            kernels.push(name);
        } else if name.starts_with("initrd.img") || name.starts_with("initramfs") {
            initrds.push(name);
        } else {
            others.push(name);
        }
    }
    kernels.sort();
    initrds.sort();
    others.sort();

    if kernels.len() != 1 {
        return Err(BuildError::Assertion(format!(
            "expected exactly one kernel in {}, found {}: [{}]",
            boot_dir.display(),
            kernels.len(),
            kernels.join(", ")
        ))
        .into());
    }
    if initrds.len() > 1 {
        return Err(BuildError::Assertion(format!(
            "expected at most one initramfs in {}, found {}: [{}]",
            boot_dir.display(),
            initrds.len(),
            initrds.join(", ")
        ))
        .into());
    }
    let kernel = &kernels[0];
    let initrd = initrds.first();

    fs::create_dir_all(target_dir)
        .with_context(|| format!("creating '{}'", target_dir.display()))?;

    for name in &others {
        move_path(&boot_dir.join(name), &target_dir.join(name))?;
    }

    let mut hasher = Sha256::new();
    hash_file(&mut hasher, &boot_dir.join(kernel))?;
    if let Some(initrd) = initrd {
        hash_file(&mut hasher, &boot_dir.join(initrd))?;
    }
    let checksum = format!("{:x}", hasher.finalize());

    let kernel_dest = target_dir.join(format!("{}-{}", kernel, checksum));
    move_path(&boot_dir.join(kernel), &kernel_dest)?;
    tracing::info!("Kernel: {}", kernel_dest.display());

    let initramfs = match initrd {
        Some(initrd) => {
            let renamed = initrd.replacen("initrd.img", "initramfs", 1);
            let dest = target_dir.join(format!("{}-{}", renamed, checksum));
            move_path(&boot_dir.join(initrd), &dest)?;
            tracing::info!("Initramfs: {}", dest.display());
            Some(dest)
        }
        None => None,
    };

    Ok(BootArtifacts {
        kernel: kernel_dest,
        initramfs,
        checksum,
    })
}

fn hash_file(hasher: &mut Sha256, path: &Path) -> Result<()> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = r
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(())
}

fn move_path(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to)
        .with_context(|| format!("moving '{}' -> '{}'", from.display(), to.display()))
}

/// True if `path` exists without following symlinks. Only `NotFound` means absent.
fn entry_exists(path: &Path) -> Result<bool, BuildError> {
    match path.symlink_metadata() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(BuildError::io_at("inspecting", path, e)),
    }
}

/// Remove kernel/initrd symlinks. Missing entries are fine.
pub fn remove_cruft(rootfs: &Path) -> Result<()> {
    tracing::info!("Removing unnecessary files");
    for rel in CRUFT {
        let path = rootfs.join(rel);
        match fs::remove_file(&path) {
            Ok(()) => tracing::debug!("removed {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(BuildError::io_at("removing", &path, e).into()),
        }
    }
    Ok(())
}

/// Move `/etc` to `/usr/etc`. A missing `/etc` is tolerated.
pub fn relocate_etc(rootfs: &Path) -> Result<()> {
    let etc = rootfs.join("etc");
    let usr_etc = rootfs.join("usr/etc");

    if !entry_exists(&etc)? {
        tracing::info!("{} not present, nothing to move", etc.display());
        return Ok(());
    }
    if entry_exists(&usr_etc)? {
        return Err(BuildError::Assertion(format!(
            "both {} and {} exist",
            etc.display(),
            usr_etc.display()
        ))
        .into());
    }

    tracing::info!("Moving /etc to /usr/etc");
    fs::create_dir_all(rootfs.join("usr"))
        .with_context(|| format!("creating '{}'", rootfs.join("usr").display()))?;
    move_path(&etc, &usr_etc)
}

/// Create `ostree`, `sysroot` and `efi`. Existing entries are left alone.
pub fn ensure_dirs(rootfs: &Path) -> Result<()> {
    tracing::info!("Setting up /ostree, /sysroot and /efi");
    for dir in REQUIRED_DIRS {
        let path = rootfs.join(dir);
        if entry_exists(&path)? {
            continue;
        }
        fs::create_dir_all(&path).with_context(|| format!("creating '{}'", path.display()))?;
    }
    Ok(())
}

/// Replace top-level directories with symlinks into `/var`, `/run` and
/// `/sysroot`. Existing directories are removed with their contents.
pub fn symlink_farm(rootfs: &Path) -> Result<()> {
    tracing::info!("Setting up symlinks");
    for (link, target) in TOPLEVEL_LINKS {
        let path = rootfs.join(link);
        match path.symlink_metadata() {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path)
                .with_context(|| format!("removing '{}'", path.display()))?,
            Ok(_) => fs::remove_file(&path)
                .with_context(|| format!("removing '{}'", path.display()))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(BuildError::io_at("inspecting", &path, e).into()),
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating '{}'", parent.display()))?;
        }
        symlink(target, &path)
            .with_context(|| format!("linking '{}' -> '{}'", path.display(), target))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{classify, ErrorKind};
    use tempfile::TempDir;

    fn debian_rootfs() -> TempDir {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        for dir in ["boot", "etc", "usr/local/bin", "mnt", "opt/vendor", "root", "srv", "var"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        fs::write(root.join("boot/vmlinuz-6.1.0-18-amd64"), b"kernel-bytes").unwrap();
        fs::write(root.join("boot/initrd.img-6.1.0-18-amd64"), b"initrd-bytes").unwrap();
        fs::write(root.join("boot/config-6.1.0-18-amd64"), b"CONFIG_X=y").unwrap();
        fs::write(root.join("etc/hostname"), b"debian").unwrap();
        fs::write(root.join("opt/vendor/tool"), b"").unwrap();
        symlink("boot/vmlinuz-6.1.0-18-amd64", root.join("vmlinuz")).unwrap();
        symlink("boot/initrd.img-6.1.0-18-amd64", root.join("initrd.img")).unwrap();
        temp
    }

    fn expected_checksum() -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"kernel-bytes");
        hasher.update(b"initrd-bytes");
        format!("{:x}", hasher.finalize())
    }

    #[test]
    fn test_boot_artifacts_hashed_and_renamed() {
        let temp = debian_rootfs();
        let root = temp.path();
        let boot = relocate_boot_artifacts(&root.join("boot"), &root.join(OSTREE_BOOT_DIR))
            .unwrap();

        let sum = expected_checksum();
        assert_eq!(boot.checksum, sum);
        let target = root.join(OSTREE_BOOT_DIR);
        assert_eq!(boot.kernel, target.join(format!("vmlinuz-6.1.0-18-amd64-{sum}")));
        assert_eq!(
            boot.initramfs,
            Some(target.join(format!("initramfs-6.1.0-18-amd64-{sum}")))
        );
        assert_eq!(fs::read(&boot.kernel).unwrap(), b"kernel-bytes");
        assert!(target.join("config-6.1.0-18-amd64").is_file());
        assert_eq!(fs::read_dir(root.join("boot")).unwrap().count(), 0);
    }

    #[test]
    fn test_identical_unpacks_convert_to_same_checksum() {
        let first = debian_rootfs();
        let second = debian_rootfs();
        let a = convert(first.path()).unwrap();
        let b = convert(second.path()).unwrap();
        assert_eq!(a.boot().checksum, b.boot().checksum);
        assert_eq!(
            a.boot().kernel.file_name(),
            b.boot().kernel.file_name()
        );
    }

    #[test]
    fn test_kernel_without_initramfs() {
        let temp = TempDir::new().unwrap();
        let boot_dir = temp.path().join("boot");
        fs::create_dir_all(&boot_dir).unwrap();
        fs::write(boot_dir.join("vmlinuz-6.1"), b"k").unwrap();
        let boot = relocate_boot_artifacts(&boot_dir, &temp.path().join("out")).unwrap();
        assert!(boot.initramfs.is_none());
        assert_eq!(boot.checksum, format!("{:x}", Sha256::digest(b"k")));
    }

    #[test]
    fn test_two_kernels_fail_before_moving() {
        let temp = debian_rootfs();
        let root = temp.path();
        fs::write(root.join("boot/vmlinuz-6.1.0-17-amd64"), b"older").unwrap();

        let err = relocate_boot_artifacts(&root.join("boot"), &root.join(OSTREE_BOOT_DIR))
            .unwrap_err();
        assert_eq!(classify(&err), ErrorKind::Assertion);
        assert!(root.join("boot/config-6.1.0-18-amd64").exists());
        assert!(!root.join(OSTREE_BOOT_DIR).exists());
    }

    #[test]
    fn test_two_initramfs_fail() {
        let temp = debian_rootfs();
        let root = temp.path();
        fs::write(root.join("boot/initramfs-extra"), b"x").unwrap();
        let err = relocate_boot_artifacts(&root.join("boot"), &root.join(OSTREE_BOOT_DIR))
            .unwrap_err();
        assert_eq!(classify(&err), ErrorKind::Assertion);
    }

    #[test]
    fn test_no_kernel_fails() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("boot")).unwrap();
        let err = relocate_boot_artifacts(&temp.path().join("boot"), &temp.path().join("out"))
            .unwrap_err();
        assert_eq!(classify(&err), ErrorKind::Assertion);
    }

    #[test]
    fn test_relocate_etc_tolerates_missing_source() {
        let temp = TempDir::new().unwrap();
        relocate_etc(temp.path()).unwrap();
        assert!(!temp.path().join("usr/etc").exists());
    }

    #[test]
    fn test_relocate_etc_refuses_to_merge() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("etc")).unwrap();
        fs::create_dir_all(temp.path().join("usr/etc")).unwrap();
        let err = relocate_etc(temp.path()).unwrap_err();
        assert_eq!(classify(&err), ErrorKind::Assertion);
    }

    #[test]
    fn test_symlink_farm_replaces_dirs_and_links() {
        let temp = debian_rootfs();
        let root = temp.path();
        symlink("elsewhere", root.join("media")).unwrap();

        symlink_farm(root).unwrap();
        symlink_farm(root).unwrap();

        for (link, target) in TOPLEVEL_LINKS {
            assert_eq!(fs::read_link(root.join(link)).unwrap(), Path::new(target));
        }
    }

    #[test]
    fn test_full_conversion() {
        let temp = debian_rootfs();
        let root = temp.path();
        let converted = convert(root).unwrap();

        assert_eq!(converted.path(), root);
        assert_eq!(converted.boot().checksum, expected_checksum());
        assert!(root.join("usr/etc/hostname").is_file());
        assert!(!root.join("etc").exists());
        assert!(root.join("vmlinuz").symlink_metadata().is_err());
        assert!(root.join("initrd.img").symlink_metadata().is_err());
        assert!(root.join("sysroot").is_dir());
        assert!(root.join("efi").is_dir());
        assert_eq!(
            fs::read_link(root.join("ostree")).unwrap(),
            Path::new("sysroot/ostree")
        );
        assert_eq!(
            fs::read_link(root.join("usr/local")).unwrap(),
            Path::new("../var/usrlocal")
        );
    }

    #[test]
    fn test_ensure_dirs_tolerates_existing() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("efi")).unwrap();
        symlink("sysroot/ostree", temp.path().join("ostree")).unwrap();
        ensure_dirs(temp.path()).unwrap();
        assert!(temp.path().join("sysroot").is_dir());
    }

    #[test]
    fn test_symlink_farm_propagates_lookup_errors() {
        let temp = TempDir::new().unwrap();
        // `usr` is a file, so looking up `usr/local` fails with ENOTDIR.
        fs::write(temp.path().join("usr"), b"").unwrap();
        let err = symlink_farm(temp.path()).unwrap_err();
        assert_eq!(classify(&err), ErrorKind::Io);
        assert!(err.to_string().contains("inspecting"));
    }
}
