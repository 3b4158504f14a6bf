//! File and tree operations used while assembling images.

use anyhow::{Context, Result};
use nix::errno::Errno;
use std::fs::{self, File, FileTimes, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{symlink, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::btrfs;

// FICLONE, `_IOW(0x94, 9, int)`.
nix::ioctl_write_int!(ficlone, 0x94, 9);

/// Inode number of a btrfs subvolume's root directory.
const BTRFS_SUBVOLUME_INO: u64 = 256;

/// Write a file, creating parent directories as needed.
pub fn write_file_with_dirs<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, content: C) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Write a file with specific Unix permissions, creating parent directories as needed.
///
/// # Arguments
/// * `path` - Path to the file to write
/// * `content` - Content to write
/// * `mode` - Unix permission bits (e.g., 0o644, 0o600)
pub fn write_file_mode<P: AsRef<Path>, C: AsRef<[u8]>>(
    path: P,
    content: C,
    mode: u32,
) -> Result<()> {
    let path = path.as_ref();
    write_file_with_dirs(path, content)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Create only the last component of `path`. An existing directory is fine,
/// anything else in the way is an error.
pub fn mkdir_last(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    match fs::DirBuilder::new().mode(mode).create(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to create {}", path.display())),
    }
}

/// Replace whatever is at `path` with a symlink to `target`.
pub fn symlink_f(target: impl AsRef<Path>, path: &Path) -> Result<()> {
    let target = target.as_ref();
    match symlink(target, path) {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            fs::remove_file(path)?;
            symlink(target, path)?;
        }
        other => other.with_context(|| format!("Failed to create symlink {}", path.display()))?,
    }
    Ok(())
}

/// Clone `src` into `dst`, sharing extents where the filesystem supports it.
pub fn reflink_or_copy(src: &File, dst: &mut File) -> Result<()> {
    // SAFETY: both descriptors stay open for the duration of the call and
    // FICLONE takes the source descriptor by value.
    match unsafe { ficlone(dst.as_raw_fd(), src.as_raw_fd() as _) } {
        Ok(_) => Ok(()),
        Err(Errno::EXDEV | Errno::EOPNOTSUPP | Errno::EINVAL | Errno::ENOTTY) => {
            let mut reader = src;
            io::copy(&mut reader, dst)?;
            Ok(())
        }
        Err(e) => Err(io::Error::from(e)).context("FICLONE failed"),
    }
}

/// Copy one regular file or symlink, keeping mode and modification time.
pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src).with_context(|| format!("Failed to stat {}", src.display()))?;
    if meta.file_type().is_symlink() {
        return symlink_f(fs::read_link(src)?, dst);
    }

    let source = File::open(src).with_context(|| format!("Failed to open {}", src.display()))?;
    if dst.exists() {
        fs::remove_file(dst)?;
    }
    let mut target = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(meta.mode() & 0o7777)
        .open(dst)
        .with_context(|| format!("Failed to create {}", dst.display()))?;

    reflink_or_copy(&source, &mut target)
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;

    target.set_permissions(meta.permissions())?;
    target.set_times(FileTimes::new().set_modified(meta.modified()?))?;
    Ok(())
}

/// Copy a directory tree. Directories that already exist in `dst` are
/// merged into; regular files and symlinks are replaced; special files
/// are skipped.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    match fs::symlink_metadata(dst) {
        Ok(m) if !m.is_dir() => fs::remove_file(dst)?,
        _ => {}
    }
    mkdir_last(dst, 0o755)?;

    for entry in fs::read_dir(src).with_context(|| format!("Failed to read {}", src.display()))? {
        let entry = entry?;
        let path = entry.path();
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            copy_tree(&path, &target)?;
        } else if file_type.is_symlink() {
            symlink_f(fs::read_link(&path)?, &target)?;
        } else if file_type.is_file() {
            copy_file(&path, &target)?;
        } else {
            debug!("Ignoring {}", path.display());
        }
    }

    let meta = fs::metadata(src)?;
    fs::set_permissions(dst, meta.permissions())?;
    Ok(())
}

/// Rewrite a text file line by line through `rewrite`, keeping its mode.
/// Each line handed to `rewrite` includes its trailing newline.
pub fn patch_file(path: &Path, rewrite: impl Fn(&str) -> String) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp.new");
    let tmp = Path::new(&tmp_name);

    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut out = File::create(tmp)?;
    for line in content.split_inclusive('\n') {
        out.write_all(rewrite(line).as_bytes())?;
    }
    drop(out);

    fs::set_permissions(tmp, fs::metadata(path)?.permissions())?;
    fs::rename(tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Hidden temporary file in `dir`, removed on drop unless persisted.
pub fn temp_file_in(dir: &Path, prefix: &str) -> Result<NamedTempFile> {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempfile_in(dir)
        .with_context(|| format!("Failed to create temporary file in {}", dir.display()))
}

/// Remove `path` whatever it is: file, btrfs subvolume or directory tree.
/// Failures are logged, never returned.
pub fn unlink_try_hard(path: &Path) {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return;
    };

    if !meta.is_dir() {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
        return;
    }

    if meta.ino() == BTRFS_SUBVOLUME_INO && btrfs::subvol_delete(path).is_ok() {
        return;
    }

    if let Err(e) = fs::remove_dir_all(path) {
        warn!("Failed to remove {}: {}", path.display(), e);
    }
}

/// Remove everything inside `path`, keeping `path` itself.
pub fn empty_directory(path: &Path) {
    let Ok(entries) = fs::read_dir(path) else {
        return;
    };
    for entry in entries.flatten() {
        unlink_try_hard(&entry.path());
    }
}

/// Allocated size of a tree in bytes. Symlinks are not followed.
pub fn dir_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.blocks() * 512)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_file_mode_creates_parents() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("etc/kernel/cmdline");
        write_file_mode(&path, "quiet\n", 0o600).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "quiet\n");
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn test_mkdir_last() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("var-tmp");
        mkdir_last(&dir, 0o755).unwrap();
        mkdir_last(&dir, 0o755).unwrap();
        assert!(dir.is_dir());

        assert!(mkdir_last(&temp.path().join("a/b"), 0o755).is_err());

        let file = temp.path().join("file");
        fs::write(&file, "").unwrap();
        assert!(mkdir_last(&file, 0o755).is_err());
    }

    #[test]
    fn test_copy_tree_preserves_links_and_modes() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("usr/bin")).unwrap();
        write_file_mode(src.join("usr/bin/tool"), "#!/bin/sh\n", 0o755).unwrap();
        symlink("usr/bin", src.join("bin")).unwrap();

        let dst = temp.path().join("dst");
        fs::create_dir_all(dst.join("etc")).unwrap();
        fs::write(dst.join("etc/keep"), "x").unwrap();

        copy_tree(&src, &dst).unwrap();

        assert_eq!(fs::read_to_string(dst.join("usr/bin/tool")).unwrap(), "#!/bin/sh\n");
        assert_eq!(
            fs::metadata(dst.join("usr/bin/tool")).unwrap().permissions().mode() & 0o777,
            0o755
        );
        assert_eq!(fs::read_link(dst.join("bin")).unwrap(), Path::new("usr/bin"));
        assert!(dst.join("etc/keep").exists());
    }

    #[test]
    fn test_copy_file_overwrites() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        fs::write(&a, "new").unwrap();
        fs::write(&b, "old contents").unwrap();
        copy_file(&a, &b).unwrap();
        assert_eq!(fs::read_to_string(&b).unwrap(), "new");
    }

    #[test]
    fn test_symlink_f_replaces() {
        let temp = TempDir::new().unwrap();
        let link = temp.path().join("resolv.conf");
        fs::write(&link, "nameserver 1.1.1.1\n").unwrap();
        symlink_f("../run/systemd/resolve/stub-resolv.conf", &link).unwrap();
        assert_eq!(
            fs::read_link(&link).unwrap(),
            Path::new("../run/systemd/resolve/stub-resolv.conf")
        );
    }

    #[test]
    fn test_patch_file_rewrites_lines() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mkinitcpio.conf");
        write_file_mode(&path, "MODULES=()\nHOOKS=(base udev)\n", 0o640).unwrap();

        patch_file(&path, |line| {
            if line.starts_with("HOOKS=") {
                "HOOKS=(systemd)\n".to_string()
            } else {
                line.to_string()
            }
        })
        .unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "MODULES=()\nHOOKS=(systemd)\n");
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o640);
        assert!(!temp.path().join("mkinitcpio.conf.tmp.new").exists());
    }

    #[test]
    fn test_unlink_try_hard_and_empty_directory() {
        let temp = TempDir::new().unwrap();
        let cache = temp.path().join("cache");
        fs::create_dir_all(cache.join("pkg/sub")).unwrap();
        fs::write(cache.join("a.rpm"), "x").unwrap();
        fs::write(cache.join("pkg/sub/b.rpm"), "y").unwrap();

        empty_directory(&cache);
        assert!(cache.is_dir());
        assert_eq!(fs::read_dir(&cache).unwrap().count(), 0);

        unlink_try_hard(&cache);
        assert!(!cache.exists());
        unlink_try_hard(&temp.path().join("missing"));
    }

    #[test]
    fn test_dir_size_counts_blocks() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("f"), vec![0u8; 8192]).unwrap();
        assert!(dir_size(temp.path()) >= 8192);
    }
}
