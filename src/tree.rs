//! Populating the image tree under `<workspace>/root`.
//!
//! The steps run in a fixed order (see `pipeline::populate`): skeleton
//! trees before the distribution so packages win over skeleton defaults,
//! the hostname after it, read-only marking last.

use anyhow::{anyhow, Context, Result};
use sha_crypt::{sha512_simple, Sha512Params, ROUNDS_DEFAULT};
use std::fs;
use std::path::Path;

use crate::btrfs;
use crate::common::{copy_file, copy_tree, mkdir_last, patch_file, symlink_f, write_file_mode, Workspace};
use crate::config::{OutputFormat, RootPassword};
use crate::context::{BuildContext, Pass};
use crate::distro;
use crate::nspawn::run_workspace_command;
use crate::process::Cmd;
use crate::sources::{copy_filtered_tree, copy_git_files, use_git, SourceFilter};
use crate::ui::Step;

const EFI_DIRS: &[&str] = &[
    "efi/EFI",
    "efi/EFI/BOOT",
    "efi/EFI/Linux",
    "efi/EFI/systemd",
    "efi/loader",
    "efi/loader/entries",
];

fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

/// Create the root directory (or subvolume) and the skeleton every image
/// needs before packages are installed.
pub fn prepare_tree(ctx: &BuildContext, workspace: &Workspace, pass: Pass, cached: bool) -> Result<()> {
    let step = Step::start("Setting up basic OS tree");
    let config = &ctx.config;
    let root = workspace.root();

    if config.format == OutputFormat::Subvolume {
        btrfs::subvol_create(&root, 0o755)?;
    } else {
        mkdir_last(&root, 0o755)?;
    }

    let btrfs_layout = config.format == OutputFormat::Subvolume
        || (config.format == OutputFormat::RawBtrfs && !cached);
    if btrfs_layout {
        btrfs::subvol_create(&root.join("home"), 0o755)?;
        btrfs::subvol_create(&root.join("srv"), 0o755)?;
        btrfs::subvol_create(&root.join("var"), 0o755)?;
        btrfs::subvol_create(&root.join("var/tmp"), 0o1777)?;
        mkdir_last(&root.join("var/lib"), 0o755)?;
        btrfs::subvol_create(&root.join("var/lib/machines"), 0o700)?;
    }

    if cached {
        step.finish();
        return Ok(());
    }

    if config.bootable {
        // The machine id doubles as the boot loader entry directory name.
        mkdir_last(&root.join("etc"), 0o755)?;
        write_file_mode(root.join("etc/machine-id"), format!("{}\n", ctx.machine_id), 0o644)?;

        mkdir_last(&root.join("efi"), 0o755)?;
        for dir in EFI_DIRS {
            mkdir_last(&root.join(dir), 0o700)?;
        }
        mkdir_last(&root.join("efi").join(&ctx.machine_id), 0o700)?;

        mkdir_last(&root.join("boot"), 0o700)?;
        symlink_f("../efi", &root.join("boot/efi"))?;
        symlink_f("efi/loader", &root.join("boot/loader"))?;
        symlink_f(format!("efi/{}", ctx.machine_id), &root.join("boot").join(&ctx.machine_id))?;

        mkdir_last(&root.join("etc/kernel"), 0o755)?;
        write_file_mode(
            root.join("etc/kernel/cmdline"),
            format!("{}\n", config.kernel_command_line.as_deref().unwrap_or_default()),
            0o644,
        )?;
    }

    if pass.run_build_script {
        mkdir_last(&root.join("root"), 0o750)?;
        mkdir_last(&root.join("root/dest"), 0o755)?;
        if config.build_dir.is_some() {
            mkdir_last(&root.join("root/build"), 0o755)?;
        }
    }

    step.finish();
    Ok(())
}

/// Seed the tree from an incremental cache snapshot. Returns whether the
/// tree is now cached.
pub fn reuse_cache_tree(ctx: &BuildContext, workspace: &Workspace, pass: Pass, cached: bool) -> Result<bool> {
    if cached {
        return Ok(true);
    }
    let config = &ctx.config;
    if !config.incremental || pass.for_cache || config.format.is_raw_rw() {
        return Ok(false);
    }

    let cache = if pass.run_build_script {
        &config.cache_pre_dev
    } else {
        &config.cache_pre_inst
    };
    let Some(cache) = cache.as_deref().filter(|c| c.is_dir()) else {
        return Ok(false);
    };

    let step = Step::start(&format!("Copying in cached tree {}", cache.display()));
    copy_tree(cache, &workspace.root())?;
    step.finish();
    Ok(true)
}

/// Merge a directory or unpack an archive into the image root.
fn install_tree(tree: &Path, root: &Path) -> Result<()> {
    if tree.is_dir() {
        return copy_tree(tree, root);
    }
    Cmd::new("tar")
        .arg("-C")
        .arg_path(root)
        .arg("-xf")
        .arg_path(tree)
        .error_msg(format!("Failed to unpack {}", tree.display()))
        .run()?;
    Ok(())
}

pub fn install_skeleton_trees(ctx: &BuildContext, workspace: &Workspace) -> Result<()> {
    if ctx.config.skeleton_trees.is_empty() {
        return Ok(());
    }
    let step = Step::start("Copying in skeleton file trees");
    for tree in &ctx.config.skeleton_trees {
        install_tree(tree, &workspace.root())?;
    }
    step.finish();
    Ok(())
}

pub fn install_extra_trees(ctx: &BuildContext, workspace: &Workspace, pass: Pass) -> Result<()> {
    if ctx.config.extra_trees.is_empty() || pass.for_cache {
        return Ok(());
    }
    let step = Step::start("Copying in extra file trees");
    for tree in &ctx.config.extra_trees {
        install_tree(tree, &workspace.root())?;
    }
    step.finish();
    Ok(())
}

pub fn install_distribution(ctx: &mut BuildContext, workspace: &Workspace, pass: Pass, cached: bool) -> Result<()> {
    if cached {
        return Ok(());
    }
    distro::installer(ctx.config.distribution).install(ctx, workspace, pass.run_build_script)
}

pub fn install_etc_hostname(ctx: &BuildContext, workspace: &Workspace) -> Result<()> {
    let step = Step::start("Assigning hostname");
    let path = workspace.root().join("etc/hostname");
    remove_if_exists(&path)?;
    if let Some(hostname) = &ctx.config.hostname {
        write_file_mode(&path, format!("{}\n", hostname), 0o644)?;
    }
    step.finish();
    Ok(())
}

/// Copy systemd-boot into the ESP, then hand over to the distribution.
pub fn install_boot_loader(
    ctx: &BuildContext,
    workspace: &Workspace,
    loopdev: Option<&Path>,
    cached: bool,
) -> Result<()> {
    if !ctx.config.bootable || cached {
        return Ok(());
    }
    let step = Step::start("Installing boot loader");
    let root = workspace.root();
    let stub = root.join("usr/lib/systemd/boot/efi/systemd-bootx64.efi");
    copy_file(&stub, &root.join("boot/efi/EFI/systemd/systemd-bootx64.efi"))?;
    copy_file(&stub, &root.join("boot/efi/EFI/BOOT/bootx64.efi"))?;

    distro::installer(ctx.config.distribution).install_boot_loader(ctx, workspace, loopdev)?;
    step.finish();
    Ok(())
}

/// Build script to `/root/<name>`, sources to `/root/src`.
pub fn install_build_src(ctx: &BuildContext, workspace: &Workspace, pass: Pass) -> Result<()> {
    if !pass.run_build_script || pass.for_cache {
        return Ok(());
    }
    let config = &ctx.config;
    let Some(script) = &config.build_script else {
        return Ok(());
    };

    let step = Step::start("Copying in build script and sources");
    let root = workspace.root();
    let name = script
        .file_name()
        .with_context(|| format!("Invalid build script path {}", script.display()))?;
    copy_file(script, &root.join("root").join(name))?;

    if let Some(sources) = &config.build_sources {
        let target = root.join("root/src");
        if use_git(config, sources) {
            copy_git_files(sources, &target, config.git_files)?;
        } else {
            copy_filtered_tree(sources, &target, &SourceFilter::new(config))?;
        }
    }
    step.finish();
    Ok(())
}

/// Merge the build script's `$DESTDIR` into the final image.
pub fn install_build_dest(ctx: &BuildContext, workspace: &Workspace, pass: Pass) -> Result<()> {
    if pass.run_build_script || pass.for_cache || ctx.config.build_script.is_none() {
        return Ok(());
    }
    let step = Step::start("Copying in build tree");
    let dest = workspace.path().join("dest");
    if dest.is_dir() {
        copy_tree(&dest, &workspace.root())?;
    }
    step.finish();
    Ok(())
}

/// `root:` lines with field 2 replaced by `value`.
fn replace_root_field(line: &str, value: &str) -> String {
    if !line.starts_with("root:") {
        return line.to_string();
    }
    let rest: Vec<&str> = line.split(':').skip(2).collect();
    let mut out = format!("root:{}", value);
    for field in rest {
        out.push(':');
        out.push_str(field);
    }
    out
}

/// SHA-512 crypt hash of `password`, with a random salt.
fn hash_password(password: &str) -> Result<String> {
    let params = Sha512Params::new(ROUNDS_DEFAULT)
        .map_err(|e| anyhow!("Invalid SHA-512 crypt parameters: {:?}", e))?;
    sha512_simple(password, &params).map_err(|e| anyhow!("Failed to hash root password: {:?}", e))
}

pub fn set_root_password(ctx: &BuildContext, workspace: &Workspace, pass: Pass) -> Result<()> {
    if pass.run_build_script || pass.for_cache {
        return Ok(());
    }
    let root = workspace.root();
    match &ctx.root_password {
        RootPassword::Leave => {}
        RootPassword::Delete => {
            let step = Step::start("Deleting root password");
            patch_file(&root.join("etc/passwd"), |line| replace_root_field(line, ""))?;
            step.finish();
        }
        RootPassword::Set(password) => {
            let step = Step::start("Setting root password");
            let hash = hash_password(password)?;
            patch_file(&root.join("etc/shadow"), |line| replace_root_field(line, &hash))?;
            step.finish();
        }
    }
    Ok(())
}

pub fn run_postinst_script(ctx: &BuildContext, workspace: &Workspace, pass: Pass) -> Result<()> {
    let Some(script) = &ctx.config.postinst_script else {
        return Ok(());
    };
    if pass.for_cache {
        return Ok(());
    }

    let step = Step::start("Running postinstall script");
    let target = workspace.root().join("root/postinst");
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    copy_file(script, &target)?;
    let phase = if pass.run_build_script { "build" } else { "final" };
    run_workspace_command(ctx, workspace, &["/root/postinst", phase], ctx.config.with_network)?;
    fs::remove_file(&target)?;
    step.finish();
    Ok(())
}

/// Leave an empty `/etc/machine-id` so the first boot generates one.
pub fn reset_machine_id(workspace: &Workspace, pass: Pass) -> Result<()> {
    if pass.run_build_script || pass.for_cache {
        return Ok(());
    }
    let step = Step::start("Resetting machine ID");
    let root = workspace.root();
    let machine_id = root.join("etc/machine-id");
    remove_if_exists(&machine_id)?;
    if let Some(parent) = machine_id.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::File::create(&machine_id)?;

    let dbus_machine_id = root.join("var/lib/dbus/machine-id");
    if remove_if_exists(&dbus_machine_id)? {
        symlink_f("../../../etc/machine-id", &dbus_machine_id)?;
    }
    step.finish();
    Ok(())
}

pub fn reset_random_seed(workspace: &Workspace) -> Result<()> {
    let step = Step::start("Removing random seed");
    remove_if_exists(&workspace.root().join("var/lib/systemd/random-seed"))?;
    step.finish();
    Ok(())
}

pub fn make_read_only(ctx: &BuildContext, workspace: &Workspace, pass: Pass) -> Result<()> {
    let config = &ctx.config;
    if !config.read_only || pass.for_cache {
        return Ok(());
    }
    if !matches!(config.format, OutputFormat::RawBtrfs | OutputFormat::Subvolume) {
        return Ok(());
    }
    let step = Step::start("Marking root subvolume read-only");
    btrfs::make_ro(&workspace.root(), true)?;
    step.finish();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn setup(f: impl FnOnce(&mut crate::config::Settings)) -> (TempDir, BuildContext, Workspace) {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path(), f);
        let ctx = BuildContext::new(config, 0o022);
        let ws = Workspace::in_dir(temp.path()).unwrap();
        (temp, ctx, ws)
    }

    #[test]
    fn test_prepare_tree_bootable() {
        let (_temp, ctx, ws) = setup(|s| {
            s.bootable = Some(true);
            s.kernel_command_line = Some("quiet".to_string());
        });
        prepare_tree(&ctx, &ws, Pass::FINAL, false).unwrap();
        let root = ws.root();

        assert_eq!(
            fs::read_to_string(root.join("etc/machine-id")).unwrap(),
            format!("{}\n", ctx.machine_id)
        );
        assert_eq!(fs::read_to_string(root.join("etc/kernel/cmdline")).unwrap(), "quiet\n");
        assert!(root.join("efi/loader/entries").is_dir());
        assert!(root.join("efi").join(&ctx.machine_id).is_dir());
        assert_eq!(fs::read_link(root.join("boot/efi")).unwrap(), Path::new("../efi"));
        assert_eq!(
            fs::read_link(root.join("boot").join(&ctx.machine_id)).unwrap(),
            Path::new("efi").join(&ctx.machine_id)
        );
        assert_eq!(
            fs::metadata(root.join("efi/EFI")).unwrap().permissions().mode() & 0o777,
            0o700
        );
        assert!(!root.join("root/dest").exists());
    }

    #[test]
    fn test_cached_tree_skips_install_steps() {
        let (_temp, mut ctx, ws) = setup(|s| s.bootable = Some(true));
        fs::create_dir_all(ws.root()).unwrap();

        install_distribution(&mut ctx, &ws, Pass::FINAL, true).unwrap();
        install_boot_loader(&ctx, &ws, None, true).unwrap();
        assert_eq!(fs::read_dir(ws.root()).unwrap().count(), 0);

        // Uncached, the boot loader step goes looking for the systemd-boot stub.
        let err = install_boot_loader(&ctx, &ws, None, false).unwrap_err();
        assert!(format!("{:#}", err).contains("systemd-bootx64.efi"));
    }

    #[test]
    fn test_prepare_tree_build_pass() {
        let (_temp, ctx, ws) = setup(|s| {
            s.format = Some("directory".to_string());
            s.build_dir = Some("build".to_string());
        });
        prepare_tree(&ctx, &ws, Pass::new(true, false), false).unwrap();
        let root = ws.root();
        assert!(root.join("root/dest").is_dir());
        assert!(root.join("root/build").is_dir());
        assert!(!root.join("etc/machine-id").exists());
    }

    #[test]
    fn test_hostname_is_replaced() {
        let (_temp, ctx, ws) = setup(|s| s.hostname = Some("builder".to_string()));
        fs::create_dir_all(ws.root().join("etc")).unwrap();
        fs::write(ws.root().join("etc/hostname"), "localhost\n").unwrap();

        install_etc_hostname(&ctx, &ws).unwrap();
        assert_eq!(fs::read_to_string(ws.root().join("etc/hostname")).unwrap(), "builder\n");
    }

    #[test]
    fn test_hostname_removed_when_unset() {
        let (_temp, ctx, ws) = setup(|_| {});
        fs::create_dir_all(ws.root().join("etc")).unwrap();
        fs::write(ws.root().join("etc/hostname"), "localhost\n").unwrap();

        install_etc_hostname(&ctx, &ws).unwrap();
        assert!(!ws.root().join("etc/hostname").exists());
    }

    #[test]
    fn test_delete_root_password() {
        let (_temp, ctx, ws) = setup(|s| s.password = Some(String::new()));
        fs::create_dir_all(ws.root().join("etc")).unwrap();
        fs::write(
            ws.root().join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/bash\nbin:x:1:1:bin:/bin:/sbin/nologin\n",
        )
        .unwrap();

        set_root_password(&ctx, &ws, Pass::FINAL).unwrap();
        assert_eq!(
            fs::read_to_string(ws.root().join("etc/passwd")).unwrap(),
            "root::0:0:root:/root:/bin/bash\nbin:x:1:1:bin:/bin:/sbin/nologin\n"
        );
    }

    #[test]
    fn test_password_untouched_in_build_pass() {
        let (_temp, ctx, ws) = setup(|s| s.password = Some(String::new()));
        fs::create_dir_all(ws.root().join("etc")).unwrap();
        fs::write(ws.root().join("etc/passwd"), "root:x:0:0::/root:/bin/sh\n").unwrap();

        set_root_password(&ctx, &ws, Pass::new(true, false)).unwrap();
        set_root_password(&ctx, &ws, Pass::new(false, true)).unwrap();
        assert_eq!(
            fs::read_to_string(ws.root().join("etc/passwd")).unwrap(),
            "root:x:0:0::/root:/bin/sh\n"
        );
    }

    #[test]
    fn test_set_root_password_writes_sha512_hash() {
        let (_temp, ctx, ws) = setup(|s| s.password = Some("hunter2".to_string()));
        let root = ws.root();
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("etc/passwd"), "root:x:0:0:root:/root:/bin/bash\n").unwrap();
        fs::write(root.join("etc/shadow"), "root:!locked::0:99999:7:::\nbin:*:18000:0:99999:7:::\n").unwrap();

        set_root_password(&ctx, &ws, Pass::FINAL).unwrap();

        let shadow = fs::read_to_string(root.join("etc/shadow")).unwrap();
        let mut lines = shadow.lines();
        let hash = lines.next().unwrap().split(':').nth(1).unwrap().to_string();
        assert!(hash.starts_with("$6$"), "not a SHA-512 crypt hash: {}", hash);
        assert!(sha_crypt::sha512_check("hunter2", &hash).is_ok());
        assert_eq!(lines.next(), Some("bin:*:18000:0:99999:7:::"));
    }

    #[test]
    fn test_replace_root_field() {
        assert_eq!(
            replace_root_field("root:!locked:17000:0:99999:7:::\n", "$6$salt$hash"),
            "root:$6$salt$hash:17000:0:99999:7:::\n"
        );
        assert_eq!(replace_root_field("rooty:x:1\n", ""), "rooty:x:1\n");
        assert_eq!(replace_root_field("root::::::::", "h"), "root:h:::::::");
    }

    #[test]
    fn test_reset_machine_id_relinks_dbus() {
        let (_temp, _ctx, ws) = setup(|_| {});
        let root = ws.root();
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::create_dir_all(root.join("var/lib/dbus")).unwrap();
        fs::write(root.join("etc/machine-id"), "0123456789abcdef\n").unwrap();
        fs::write(root.join("var/lib/dbus/machine-id"), "0123456789abcdef\n").unwrap();

        reset_machine_id(&ws, Pass::FINAL).unwrap();
        assert_eq!(fs::read(root.join("etc/machine-id")).unwrap().len(), 0);
        assert_eq!(
            fs::read_link(root.join("var/lib/dbus/machine-id")).unwrap(),
            Path::new("../../../etc/machine-id")
        );
    }

    #[test]
    fn test_reset_machine_id_without_dbus() {
        let (_temp, _ctx, ws) = setup(|_| {});
        fs::create_dir_all(ws.root().join("etc")).unwrap();
        reset_machine_id(&ws, Pass::FINAL).unwrap();
        assert!(ws.root().join("etc/machine-id").exists());
        assert!(fs::symlink_metadata(ws.root().join("var/lib/dbus/machine-id")).is_err());
    }

    #[test]
    fn test_reuse_cache_tree() {
        let (temp, mut ctx, ws) = setup(|s| {
            s.format = Some("directory".to_string());
            s.incremental = Some(true);
        });
        fs::create_dir_all(ws.root()).unwrap();
        assert!(!reuse_cache_tree(&ctx, &ws, Pass::FINAL, false).unwrap());

        let cache = temp.path().join("image.cache-pre-inst");
        fs::create_dir_all(cache.join("usr/bin")).unwrap();
        fs::write(cache.join("usr/bin/sh"), "").unwrap();
        ctx.config.cache_pre_inst = Some(cache);

        assert!(reuse_cache_tree(&ctx, &ws, Pass::FINAL, false).unwrap());
        assert!(ws.root().join("usr/bin/sh").exists());
        assert!(!reuse_cache_tree(&ctx, &ws, Pass::new(false, true), false).unwrap());
    }

    #[test]
    fn test_extra_and_skeleton_trees() {
        let temp_trees = TempDir::new().unwrap();
        let skeleton = temp_trees.path().join("skeleton");
        let extra = temp_trees.path().join("extra");
        fs::create_dir_all(skeleton.join("etc")).unwrap();
        fs::create_dir_all(extra.join("etc")).unwrap();
        fs::write(skeleton.join("etc/issue"), "skeleton\n").unwrap();
        fs::write(extra.join("etc/motd"), "extra\n").unwrap();

        let (_temp, ctx, ws) = setup(|s| {
            s.skeleton_trees = vec![skeleton.display().to_string()];
            s.extra_trees = vec![extra.display().to_string()];
        });
        fs::create_dir_all(ws.root()).unwrap();

        install_skeleton_trees(&ctx, &ws).unwrap();
        install_extra_trees(&ctx, &ws, Pass::new(false, true)).unwrap();
        assert!(ws.root().join("etc/issue").exists());
        assert!(!ws.root().join("etc/motd").exists());

        install_extra_trees(&ctx, &ws, Pass::FINAL).unwrap();
        assert_eq!(fs::read_to_string(ws.root().join("etc/motd")).unwrap(), "extra\n");
    }
}
