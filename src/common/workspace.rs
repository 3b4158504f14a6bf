//! The transient build workspace.
//!
//! ```text
//! <workspace>/
//!     root/       the image tree, mounted or assembled
//!     var-tmp/    bound to /var/tmp inside containers
//!     <scratch>   pacman.conf, dnf.conf, temporary artifacts
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::warn;

use super::files::{mkdir_last, unlink_try_hard};
use crate::config::BuildConfig;
use crate::ui;

/// A temporary directory removed on drop, subvolumes included.
pub struct Workspace {
    dir: Option<TempDir>,
}

impl Workspace {
    /// Tree outputs are created next to the output so the final rename
    /// stays on one filesystem; everything else goes to `/var/tmp`.
    pub fn create(config: &BuildConfig) -> Result<Self> {
        ui::info("Setting up temporary workspace.");
        let dir = if config.format.is_tree() {
            tempfile::Builder::new()
                .prefix(".mkosi-")
                .tempdir_in(config.output_parent())
        } else {
            tempfile::Builder::new().prefix("mkosi-").tempdir_in("/var/tmp")
        }
        .context("Failed to create temporary workspace")?;
        ui::info(&format!(
            "Temporary workspace in {} is now set up.",
            dir.path().display()
        ));
        Ok(Self { dir: Some(dir) })
    }

    /// Workspace rooted in an arbitrary directory, for tests.
    pub fn in_dir(parent: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix(".mkosi-").tempdir_in(parent)?;
        Ok(Self { dir: Some(dir) })
    }

    pub fn path(&self) -> &Path {
        match &self.dir {
            Some(dir) => dir.path(),
            None => Path::new("/"),
        }
    }

    /// `<workspace>/root`.
    pub fn root(&self) -> PathBuf {
        self.path().join("root")
    }

    /// `<workspace>/var-tmp`, created on first use.
    pub fn var_tmp(&self) -> Result<PathBuf> {
        let path = self.path().join("var-tmp");
        mkdir_last(&path, 0o755)?;
        Ok(path)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        unlink_try_hard(&dir.path().join("root"));
        if let Err(e) = dir.close() {
            warn!("Failed to remove workspace: {}", e);
        }
    }
}
