//! Commands run inside a tree through `systemd-nspawn`.

use std::path::{Path, PathBuf};

use crate::process::Cmd;

/// A `systemd-nspawn` invocation against a directory tree.
#[derive(Debug, Clone)]
pub struct Container {
    root: PathBuf,
    efi: Option<PathBuf>,
}

impl Container {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            efi: None,
        }
    }

    /// Bind `dir` on `/efi` inside the container.
    pub fn with_efi(mut self, dir: &Path) -> Self {
        self.efi = Some(dir.to_path_buf());
        self
    }

    /// Build the command running `args` as PID 2 inside the tree.
    pub fn command<I, S>(&self, args: I) -> Cmd
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut cmd = Cmd::new("systemd-nspawn")
            .args(["--quiet", "--as-pid2", "-D"])
            .arg_path(&self.root);
        if let Some(efi) = &self.efi {
            cmd = cmd.arg(format!("--bind={}:/efi", efi.display()));
        }
        cmd.args(args)
    }
}
