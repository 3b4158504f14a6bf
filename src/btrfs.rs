//! btrfs subvolume helpers for the `subvolume` and `raw_btrfs` formats.

use anyhow::{Context, Result};
use nix::sys::stat::{umask, Mode};
use std::path::{Component, Path, PathBuf};

use crate::process::Cmd;

/// Create a subvolume whose root directory gets `mode`.
pub fn subvol_create(path: &Path, mode: u32) -> Result<()> {
    let previous = umask(Mode::from_bits_truncate(!mode & 0o7777));
    let result = Cmd::new("btrfs")
        .args(["subvol", "create"])
        .arg_path(path)
        .quiet()
        .error_msg(format!("Creating subvolume {} failed", path.display()))
        .run();
    umask(previous);
    result?;
    Ok(())
}

/// Delete a subvolume and every subvolume nested below it.
pub fn subvol_delete(path: &Path) -> Result<()> {
    let show = Cmd::new("btrfs")
        .args(["subvol", "show"])
        .arg_path(path)
        .run()
        .with_context(|| format!("Querying subvolume {} failed", path.display()))?;
    let subvol_path = show.stdout.lines().next().unwrap_or_default().trim().to_string();

    // A read-only subvolume cannot be deleted.
    make_ro(path, false)?;

    let list = Cmd::new("btrfs")
        .args(["subvol", "list", "-o"])
        .arg_path(path)
        .run()
        .with_context(|| format!("Listing subvolumes below {} failed", path.display()))?;
    for line in list.stdout.lines().filter(|l| !l.is_empty()) {
        if let Some(child) = child_subvolume(path, &subvol_path, line) {
            subvol_delete(&child)?;
        }
    }

    Cmd::new("btrfs")
        .args(["subvol", "delete"])
        .arg_path(path)
        .quiet()
        .error_msg(format!("Deleting subvolume {} failed", path.display()))
        .run()?;
    Ok(())
}

/// Toggle the read-only property of a subvolume.
pub fn make_ro(path: &Path, read_only: bool) -> Result<()> {
    Cmd::new("btrfs")
        .arg("property")
        .arg("set")
        .arg_path(path)
        .arg("ro")
        .arg(if read_only { "true" } else { "false" })
        .error_msg(format!("Setting read-only property on {} failed", path.display()))
        .run()?;
    Ok(())
}

/// Map one `btrfs subvol list -o` line to a host path below `parent`.
///
/// The line ends with `path <subvolume path>` as the ninth space-separated
/// field; that path is relative to the filesystem, so it is rebased from
/// `parent_subvol` onto `parent`.
pub fn child_subvolume(parent: &Path, parent_subvol: &str, line: &str) -> Option<PathBuf> {
    let child_subvol = line.splitn(9, ' ').nth(8)?;
    let relative = Path::new(child_subvol).strip_prefix(parent_subvol).ok()?;
    Some(normalize(&parent.join(relative)))
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}
