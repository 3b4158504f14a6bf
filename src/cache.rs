//! Incremental build caches and the package cache.
//!
//! Two snapshots live next to the output: `<output>.cache-pre-dev` and
//! `<output>.cache-pre-inst`, taken right after package installation in the
//! development and final passes. Raw images with a writable root are cached
//! as images, everything else as the populated tree.

use anyhow::{Context, Result};
use nix::errno::Errno;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::{NamedTempFile, TempDir};

use crate::common::{copy_tree, unlink_try_hard, Workspace};
use crate::config::BuildConfig;
use crate::context::BuildContext;
use crate::ui::Step;

/// Whether the cache passes have to run before the real ones.
///
/// A second `--force` rebuilds the snapshots even when both exist.
pub fn need_cache_images(config: &BuildConfig) -> bool {
    if !config.incremental {
        return false;
    }
    if config.force_count > 1 {
        return true;
    }
    let missing = |p: &Option<std::path::PathBuf>| p.as_deref().map_or(true, |p| !p.exists());
    missing(&config.cache_pre_dev) || missing(&config.cache_pre_inst)
}

/// Rename, falling back to copy and delete across filesystems.
fn move_tree(src: &Path, dest: &Path) -> Result<()> {
    match fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(Errno::EXDEV as i32) => {
            copy_tree(src, dest)?;
            unlink_try_hard(src);
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to move {} to {}", src.display(), dest.display())),
    }
}

/// Store this pass's snapshot at `dest`, replacing an older one.
pub fn save_cache(
    ctx: &BuildContext,
    workspace: &Workspace,
    raw: Option<NamedTempFile>,
    dest: Option<&Path>,
) -> Result<()> {
    let Some(dest) = dest else {
        return Ok(());
    };
    let is_image = ctx.config.format.is_raw_rw();
    if (is_image && raw.is_none()) || (!is_image && !workspace.root().exists()) {
        return Ok(());
    }

    let step = Step::with_done(
        "Installing cache copy",
        &format!("Successfully installed cache copy {}", dest.display()),
    );
    match raw {
        Some(raw) if is_image => {
            fs::set_permissions(raw.path(), fs::Permissions::from_mode(ctx.output_mode()))?;
            raw.persist(dest)
                .with_context(|| format!("Failed to install cache copy {}", dest.display()))?;
        }
        _ => {
            unlink_try_hard(dest);
            move_tree(&workspace.root(), dest)?;
        }
    }
    step.finish();
    Ok(())
}

/// Make sure a package cache directory exists. Without a configured one a
/// throwaway directory next to the output is used; keep the returned guard
/// alive for the whole build.
pub fn setup_package_cache(ctx: &mut BuildContext) -> Result<Option<TempDir>> {
    let mut guard = None;
    let path = match ctx.config.cache_path.clone() {
        Some(path) => {
            fs::create_dir_all(&path)
                .with_context(|| format!("Failed to create package cache {}", path.display()))?;
            path
        }
        None => {
            let dir = tempfile::Builder::new()
                .prefix(".mkosi-")
                .tempdir_in(ctx.config.output_parent())
                .context("Failed to create temporary package cache")?;
            let path = dir.path().to_path_buf();
            guard = Some(dir);
            path
        }
    };

    let step = Step::with_done(
        "Setting up package cache",
        &format!("Setting up package cache {} complete", path.display()),
    );
    ctx.package_cache = Some(path);
    step.finish();
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    fn incremental(base: &Path, force: u32) -> BuildConfig {
        test_config(base, |s| {
            s.format = Some("raw_ext4".to_string());
            s.incremental = Some(true);
            s.force_count = force;
        })
    }

    #[test]
    fn test_need_cache_images_both_present() {
        let temp = TempDir::new().unwrap();
        let config = incremental(temp.path(), 0);
        fs::write(config.cache_pre_dev.as_ref().unwrap(), "").unwrap();
        fs::write(config.cache_pre_inst.as_ref().unwrap(), "").unwrap();
        assert!(!need_cache_images(&config));

        // One --force keeps the snapshots, two rebuild them.
        assert!(!need_cache_images(&incremental(temp.path(), 1)));
        assert!(need_cache_images(&incremental(temp.path(), 2)));
    }

    #[test]
    fn test_need_cache_images_one_missing() {
        let temp = TempDir::new().unwrap();
        let config = incremental(temp.path(), 0);
        fs::write(config.cache_pre_inst.as_ref().unwrap(), "").unwrap();
        assert!(need_cache_images(&config));
    }

    #[test]
    fn test_not_incremental_never_needs_cache() {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path(), |s| s.force_count = 3);
        assert!(!need_cache_images(&config));
    }

    #[test]
    fn test_save_cache_persists_image() {
        let temp = TempDir::new().unwrap();
        let ctx = BuildContext::new(incremental(temp.path(), 0), 0o022);
        let workspace = Workspace::in_dir(temp.path()).unwrap();
        let raw = crate::common::temp_file_in(temp.path(), ".mkosi-").unwrap();
        fs::write(raw.path(), "image").unwrap();

        let dest = ctx.config.cache_pre_inst.clone().unwrap();
        save_cache(&ctx, &workspace, Some(raw), Some(&dest)).unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "image");
        assert_eq!(fs::metadata(&dest).unwrap().permissions().mode() & 0o777, 0o644);
    }

    #[test]
    fn test_save_cache_moves_tree() {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path(), |s| {
            s.format = Some("directory".to_string());
            s.incremental = Some(true);
        });
        let ctx = BuildContext::new(config, 0o022);
        let workspace = Workspace::in_dir(temp.path()).unwrap();
        fs::create_dir_all(workspace.root().join("etc")).unwrap();
        fs::write(workspace.root().join("etc/os-release"), "ID=fedora\n").unwrap();

        let dest = ctx.config.cache_pre_dev.clone().unwrap();
        save_cache(&ctx, &workspace, None, Some(&dest)).unwrap();
        assert!(dest.join("etc/os-release").exists());
        assert!(!workspace.root().exists());
    }

    #[test]
    fn test_temporary_package_cache() {
        let temp = TempDir::new().unwrap();
        let mut ctx = BuildContext::new(test_config(temp.path(), |_| {}), 0o022);
        let guard = setup_package_cache(&mut ctx).unwrap();
        let cache = ctx.package_cache.clone().unwrap();
        assert!(cache.is_dir());
        assert!(cache.file_name().unwrap().to_string_lossy().starts_with(".mkosi-"));
        drop(guard);
        assert!(!cache.exists());
    }
}
