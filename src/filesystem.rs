//! Formatting and mounting of image partitions.
//!
//! Every mount made here is owned by a guard that unmounts on drop, so
//! an error unwinding out of the pipeline leaves no mounts behind in the
//! private namespace.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{BuildConfig, OutputFormat};
use crate::context::BuildContext;
use crate::loopdev::partition_path;
use crate::process::Cmd;
use crate::ui::Step;

/// Filesystem put on a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Ext4,
    Btrfs,
    Xfs,
    Fat32,
    Swap,
}

/// Formatter invocation for `kind`. `mount` is the ext4 last-mounted hint.
pub fn mkfs_command(kind: FsKind, label: &str, mount: &str, dev: &Path) -> Cmd {
    let cmd = match kind {
        FsKind::Ext4 => Cmd::new("mkfs.ext4").args(["-L", label, "-M", mount]),
        FsKind::Btrfs => {
            Cmd::new("mkfs.btrfs").args(["-L", label, "-d", "single", "-m", "single"])
        }
        FsKind::Xfs => Cmd::new("mkfs.xfs").args(["-n", "ftype=1", "-L", label]),
        FsKind::Fat32 => Cmd::new("mkfs.fat").arg(format!("-n{}", label)).arg("-F32"),
        FsKind::Swap => Cmd::new("mkswap").arg(format!("-L{}", label)),
    };
    cmd.arg_path(dev)
}

/// Create a filesystem of `kind` on `dev`.
pub fn format(kind: FsKind, label: &str, mount: &str, dev: &Path) -> Result<()> {
    mkfs_command(kind, label, mount, dev)
        .error_msg(format!("Formatting {} failed", dev.display()))
        .run()?;
    Ok(())
}

/// Filesystem of the root partition for a raw format.
pub fn root_fs_kind(format: OutputFormat) -> FsKind {
    match format {
        OutputFormat::RawBtrfs => FsKind::Btrfs,
        OutputFormat::RawXfs => FsKind::Xfs,
        _ => FsKind::Ext4,
    }
}

pub fn prepare_swap(ctx: &BuildContext, loopdev: Option<&Path>, cached: bool) -> Result<()> {
    let (Some(loopdev), Some(partno)) = (loopdev, ctx.partitions.swap) else {
        return Ok(());
    };
    if cached {
        return Ok(());
    }
    let step = Step::start("Formatting swap partition");
    format(FsKind::Swap, "swap", "", &partition_path(loopdev, partno))?;
    step.finish();
    Ok(())
}

pub fn prepare_esp(ctx: &BuildContext, loopdev: Option<&Path>, cached: bool) -> Result<()> {
    let (Some(loopdev), Some(partno)) = (loopdev, ctx.partitions.esp) else {
        return Ok(());
    };
    if cached {
        return Ok(());
    }
    let step = Step::start("Formatting ESP partition");
    format(FsKind::Fat32, "EFI", "", &partition_path(loopdev, partno))?;
    step.finish();
    Ok(())
}

pub fn prepare_root(config: &BuildConfig, dev: Option<&Path>, cached: bool) -> Result<()> {
    let Some(dev) = dev else {
        return Ok(());
    };
    if config.format == OutputFormat::RawSquashfs || cached {
        return Ok(());
    }
    let step = Step::start("Formatting root partition");
    format(root_fs_kind(config.format), "root", "/", dev)?;
    step.finish();
    Ok(())
}

pub fn prepare_home(dev: Option<&Path>, cached: bool) -> Result<()> {
    prepare_data(dev, cached, "home", "/home", "Formatting home partition")
}

pub fn prepare_srv(dev: Option<&Path>, cached: bool) -> Result<()> {
    prepare_data(dev, cached, "srv", "/srv", "Formatting server data partition")
}

fn prepare_data(dev: Option<&Path>, cached: bool, label: &str, mount: &str, text: &str) -> Result<()> {
    let Some(dev) = dev else {
        return Ok(());
    };
    if cached {
        return Ok(());
    }
    let step = Step::start(text);
    format(FsKind::Ext4, label, mount, dev)?;
    step.finish();
    Ok(())
}

/// `-o` option string for mounting an image partition.
pub fn mount_options(config: &BuildConfig, read_only: bool) -> String {
    let mut options = "-odiscard".to_string();
    if config.compress && config.format == OutputFormat::RawBtrfs {
        options.push_str(",compress");
    }
    if read_only {
        options.push_str(",ro");
    }
    options
}

pub fn mount_loop(config: &BuildConfig, dev: &Path, where_: &Path, read_only: bool) -> Result<()> {
    fs::create_dir_all(where_)?;
    Cmd::new("mount")
        .arg("-n")
        .arg_path(dev)
        .arg_path(where_)
        .arg(mount_options(config, read_only))
        .error_msg(format!("Mounting {} failed", dev.display()))
        .run()?;
    Ok(())
}

pub fn mount_bind(what: &Path, where_: &Path) -> Result<()> {
    fs::create_dir_all(what).with_context(|| format!("Failed to create {}", what.display()))?;
    fs::create_dir_all(where_).with_context(|| format!("Failed to create {}", where_.display()))?;
    Cmd::new("mount")
        .arg("--bind")
        .arg_path(what)
        .arg_path(where_)
        .error_msg(format!("Bind mounting {} failed", what.display()))
        .run()?;
    Ok(())
}

pub fn mount_tmpfs(where_: &Path) -> Result<()> {
    fs::create_dir_all(where_)?;
    Cmd::new("mount")
        .args(["tmpfs", "-t", "tmpfs"])
        .arg_path(where_)
        .error_msg(format!("Mounting tmpfs on {} failed", where_.display()))
        .run()?;
    Ok(())
}

/// Recursive unmount. Failures and output are ignored.
pub fn umount(where_: &Path) {
    let _ = Cmd::new("umount")
        .args(["--recursive", "-n"])
        .arg_path(where_)
        .quiet()
        .allow_fail()
        .run();
}

/// Partitions of a raw image mounted below the workspace root.
pub struct MountedImage {
    root: Option<PathBuf>,
}

impl MountedImage {
    /// Mount root, then home, srv and the ESP on top, then fresh tmpfs on
    /// `/run` and `/tmp` so neither ends up in the image. Without a loop
    /// device there is nothing to mount.
    pub fn mount(
        ctx: &BuildContext,
        root: &Path,
        loopdev: Option<&Path>,
        root_dev: Option<&Path>,
        home_dev: Option<&Path>,
        srv_dev: Option<&Path>,
        root_read_only: bool,
    ) -> Result<Self> {
        let Some(loopdev) = loopdev else {
            return Ok(Self { root: None });
        };
        let config = &ctx.config;

        let step = Step::start("Mounting image");
        let guard = Self {
            root: Some(root.to_path_buf()),
        };

        if config.format != OutputFormat::RawSquashfs {
            if let Some(dev) = root_dev {
                mount_loop(config, dev, root, root_read_only)?;
            }
        }
        if let Some(dev) = home_dev {
            mount_loop(config, dev, &root.join("home"), false)?;
        }
        if let Some(dev) = srv_dev {
            mount_loop(config, dev, &root.join("srv"), false)?;
        }
        if let Some(partno) = ctx.partitions.esp {
            mount_loop(config, &partition_path(loopdev, partno), &root.join("efi"), false)?;
        }
        mount_tmpfs(&root.join("run"))?;
        mount_tmpfs(&root.join("tmp"))?;

        step.finish();
        Ok(guard)
    }

    /// Unmount now.
    pub fn unmount(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(root) = self.root.take() {
            let step = Step::start("Unmounting image");
            umount(&root);
            step.finish();
        }
    }
}

impl Drop for MountedImage {
    fn drop(&mut self) {
        self.release();
    }
}

const API_VFS: [&str; 3] = ["proc", "dev", "sys"];

/// `/proc`, `/dev` and `/sys` of the host bound into the image tree.
pub struct ApiVfs {
    root: Option<PathBuf>,
}

impl ApiVfs {
    pub fn mount(root: &Path) -> Result<Self> {
        let step = Step::start("Mounting API VFS");
        let guard = Self {
            root: Some(root.to_path_buf()),
        };
        for dir in API_VFS {
            mount_bind(&Path::new("/").join(dir), &root.join(dir))?;
        }
        step.finish();
        Ok(guard)
    }
}

impl Drop for ApiVfs {
    fn drop(&mut self) {
        if let Some(root) = self.root.take() {
            let step = Step::start("Unmounting API VFS");
            for dir in API_VFS {
                umount(&root.join(dir));
            }
            step.finish();
        }
    }
}

/// Host package cache bound over the distribution's cache directories.
pub struct CacheMounts {
    targets: Vec<PathBuf>,
}

impl CacheMounts {
    /// With one cache directory the cache path is bound directly; with
    /// several, each gets a subdirectory named like its last component
    /// (`yum/`, `dnf/`).
    pub fn mount(cache: Option<&Path>, root: &Path, cache_paths: &[&str]) -> Result<Self> {
        let Some(cache) = cache else {
            return Ok(Self { targets: Vec::new() });
        };

        let step = Step::start("Mounting Package Cache");
        let mut guard = Self { targets: Vec::new() };
        for (source, target) in cache_bind_pairs(cache, root, cache_paths) {
            mount_bind(&source, &target)?;
            guard.targets.push(target);
        }
        step.finish();
        Ok(guard)
    }
}

/// Host directory and in-tree target for each package cache path.
pub fn cache_bind_pairs(cache: &Path, root: &Path, cache_paths: &[&str]) -> Vec<(PathBuf, PathBuf)> {
    cache_paths
        .iter()
        .map(|rel| {
            let source = if cache_paths.len() == 1 {
                cache.to_path_buf()
            } else {
                let name = Path::new(rel).file_name().unwrap_or_default();
                cache.join(name)
            };
            (source, root.join(rel))
        })
        .collect()
}

impl Drop for CacheMounts {
    fn drop(&mut self) {
        if self.targets.is_empty() {
            return;
        }
        let step = Step::start("Unmounting Package Cache");
        for target in self.targets.drain(..).rev() {
            umount(&target);
        }
        step.finish();
    }
}
