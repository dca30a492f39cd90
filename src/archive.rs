//! Rootfs tarball extraction.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path};
use tar::Archive;

use crate::preflight::running_as_root;

/// Extraction behaviour.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnpackOptions {
    /// Skip everything below `./dev/` (the directory itself is kept).
    pub exclude_dev: bool,
}

/// Extract the gzip-compressed tarball `archive` into `dest`.
///
/// Permissions are preserved; numeric ownership is preserved when running as
/// root. Returns the number of entries written.
pub fn unpack(archive: &Path, dest: &Path, options: UnpackOptions) -> Result<usize> {
    tracing::info!("Unpacking {} into {}", archive.display(), dest.display());
    let file =
        File::open(archive).with_context(|| format!("opening archive '{}'", archive.display()))?;
    let mut tar = Archive::new(GzDecoder::new(BufReader::new(file)));
    tar.set_preserve_permissions(true);
    tar.set_preserve_ownerships(running_as_root());
    tar.set_preserve_mtime(true);
    tar.set_overwrite(true);

    let mut written = 0;
    for entry in tar
        .entries()
        .with_context(|| format!("reading archive '{}'", archive.display()))?
    {
        let mut entry =
            entry.with_context(|| format!("reading entry of '{}'", archive.display()))?;
        let path = entry
            .path()
            .with_context(|| format!("decoding entry path in '{}'", archive.display()))?
            .into_owned();
        if options.exclude_dev && is_below_dev(&path) {
            continue;
        }
        let unpacked = entry
            .unpack_in(dest)
            .with_context(|| format!("extracting '{}'", path.display()))?;
        if unpacked {
            written += 1;
        } else {
            tracing::warn!("skipped entry escaping the target: {}", path.display());
        }
    }
    Ok(written)
}

/// True for `dev/<anything>` and `./dev/<anything>`, not for `dev` itself.
fn is_below_dev(path: &Path) -> bool {
    let mut parts = path.components().filter(|c| !matches!(c, Component::CurDir));
    matches!(parts.next(), Some(Component::Normal(first)) if first == "dev")
        && parts.next().is_some()
}
