//! Process-wide setup before any image is touched.

use anyhow::{Context, Result};
use nix::sched::{unshare, CloneFlags};
use nix::sys::stat::{umask, Mode};
use nix::unistd::Uid;

use crate::error::MkosiError;
use crate::process::Cmd;

/// Fail unless running as root.
pub fn check_root() -> Result<()> {
    if !Uid::current().is_root() {
        return Err(MkosiError::NotRoot.into());
    }
    Ok(())
}

/// Clear the umask and move into a private mount namespace whose mounts
/// do not propagate back to the host. Returns the umask that was in
/// effect, which decides the mode of promoted outputs.
pub fn init_namespace() -> Result<u32> {
    let original = umask(Mode::empty());
    unshare(CloneFlags::CLONE_NEWNS).context("Failed to create mount namespace")?;
    Cmd::new("mount")
        .args(["--make-rslave", "/"])
        .error_msg("Failed to detach mount namespace")
        .run()?;
    Ok(original.bits() as u32)
}
