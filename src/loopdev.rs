//! Loop devices backing raw images.

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::process::Cmd;
use crate::ui::{self, Step};

/// A partition-scanning loop device, detached when dropped.
#[derive(Debug)]
pub struct LoopDevice {
    path: PathBuf,
    detached: bool,
}

impl LoopDevice {
    /// `losetup --find --show --partscan <file>`.
    pub fn attach(file: &Path) -> Result<Self> {
        let step = Step::start("Attaching image file");
        let result = Cmd::new("losetup")
            .args(["--find", "--show", "--partscan"])
            .arg_path(file)
            .error_msg("Attaching image file failed")
            .run()?;
        let path = PathBuf::from(result.stdout_trimmed());
        drop(step);
        ui::info(&format!("Attached image file as {}.", path.display()));
        Ok(Self {
            path,
            detached: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Device node of partition `partno`.
    pub fn partition(&self, partno: u32) -> PathBuf {
        partition_path(&self.path, partno)
    }

    /// Re-read the backing file's size after it was grown.
    pub fn set_capacity(&self) -> Result<()> {
        Cmd::new("losetup")
            .arg("--set-capacity")
            .arg_path(&self.path)
            .error_msg("Updating loop device capacity failed")
            .run()?;
        Ok(())
    }

    /// Detach now. Failure is logged, never fatal: the image is complete
    /// by the time this runs.
    pub fn detach(mut self) {
        self.detached = true;
        let step = Step::start("Detaching image file");
        match Cmd::new("losetup").arg("--detach").arg_path(&self.path).run() {
            Ok(_) => step.finish(),
            Err(e) => warn!("Failed to detach {}: {:#}", self.path.display(), e),
        }
    }
}

impl Drop for LoopDevice {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Err(e) = Cmd::new("losetup").arg("--detach").arg_path(&self.path).run() {
            warn!("Failed to detach {}: {:#}", self.path.display(), e);
        }
    }
}

/// `<loopdev>p<N>`.
pub fn partition_path(loopdev: &Path, partno: u32) -> PathBuf {
    let mut s = loopdev.as_os_str().to_os_string();
    s.push(format!("p{}", partno));
    PathBuf::from(s)
}

/// Null-passthrough variant of [`partition_path`] for absent slots.
pub fn partition(loopdev: &Path, partno: Option<u32>) -> Option<PathBuf> {
    partno.map(|n| partition_path(loopdev, n))
}
