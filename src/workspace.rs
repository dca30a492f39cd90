//! Per-build working directory.
//!
//! Layout: `<base>/<manifest name>/` holds a copy of the manifest's source
//! directory, stage artifacts, the shared `rootfs/` and `build-report.json`.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const ROOTFS_DIR: &str = "rootfs";
pub const REPORT_FILE: &str = "build-report.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
    rootfs: PathBuf,
}

impl Workspace {
    pub fn new(base: &Path, name: &str) -> Self {
        let root = base.join(name);
        let rootfs = root.join(ROOTFS_DIR);
        Self { root, rootfs }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    pub fn report_path(&self) -> PathBuf {
        self.root.join(REPORT_FILE)
    }

    /// Create the workspace root. Existing contents are kept.
    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating workspace '{}'", self.root.display()))
    }

    /// Resolve an option path: absolute paths are kept, relative ones are
    /// joined onto the workspace root.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        }
    }

    /// Copy the contents of `source_dir` into the workspace root, overwriting
    /// files that already exist. Returns the number of files copied.
    pub fn import_sources(&self, source_dir: &Path) -> Result<usize> {
        let source = fs::canonicalize(source_dir)
            .with_context(|| format!("resolving source directory '{}'", source_dir.display()))?;
        let root = fs::canonicalize(&self.root)
            .with_context(|| format!("resolving workspace '{}'", self.root.display()))?;
        if source == root {
            return Ok(0);
        }

        let mut copied = 0;
        let walker = WalkDir::new(&source)
            .min_depth(1)
            .into_iter()
            // The workspace may live inside the source tree; skip it and its ancestors.
            .filter_entry(|e| !root.starts_with(e.path()));

        for entry in walker {
            let entry = entry
                .with_context(|| format!("walking source directory '{}'", source.display()))?;
            let rel = entry
                .path()
                .strip_prefix(&source)
                .with_context(|| format!("relativizing '{}'", entry.path().display()))?;
            let dest = root.join(rel);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                fs::create_dir_all(&dest)
                    .with_context(|| format!("creating directory '{}'", dest.display()))?;
            } else if file_type.is_symlink() {
                let target = fs::read_link(entry.path())
                    .with_context(|| format!("reading symlink '{}'", entry.path().display()))?;
                if dest.symlink_metadata().is_ok() {
                    fs::remove_file(&dest)
                        .with_context(|| format!("replacing '{}'", dest.display()))?;
                }
                symlink(&target, &dest)
                    .with_context(|| format!("creating symlink '{}'", dest.display()))?;
                copied += 1;
            } else {
                fs::copy(entry.path(), &dest).with_context(|| {
                    format!(
                        "copying '{}' -> '{}'",
                        entry.path().display(),
                        dest.display()
                    )
                })?;
                copied += 1;
            }
        }
        Ok(copied)
    }

    /// Discard the staged rootfs and create it empty.
    pub fn reset_rootfs(&self) -> Result<&Path> {
        self.remove_rootfs()?;
        fs::create_dir_all(&self.rootfs)
            .with_context(|| format!("creating rootfs '{}'", self.rootfs.display()))?;
        Ok(&self.rootfs)
    }

    /// Remove the staged rootfs if present.
    pub fn remove_rootfs(&self) -> Result<()> {
        if self.rootfs.symlink_metadata().is_ok() {
            fs::remove_dir_all(&self.rootfs)
                .with_context(|| format!("removing rootfs '{}'", self.rootfs.display()))?;
        }
        Ok(())
    }
}
