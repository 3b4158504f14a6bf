//! The build driver.
//!
//! [`build_stuff`] runs up to four passes of [`build_image`]: optional
//! cache passes for the development and final images, the development pass
//! that runs the build script, and the final pass whose artifacts are
//! post-processed and promoted.
//!
//! Inside a pass, resources nest strictly:
//!
//! ```text
//! loop device
//!   LUKS volumes
//!     mounted image
//!       package cache bind mounts
//! ```
//!
//! Each level is a guard, so an error anywhere unwinds them innermost first.

use anyhow::Result;
use std::path::Path;
use tempfile::NamedTempFile;

use crate::boot;
use crate::cache;
use crate::common::{mkdir_last, unlink_try_hard, Workspace};
use crate::config::BuildConfig;
use crate::context::{BuildContext, Pass};
use crate::distro;
use crate::filesystem::{self, CacheMounts, MountedImage};
use crate::image;
use crate::loopdev::LoopDevice;
use crate::luks::{self, EncryptedVolumes};
use crate::nspawn;
use crate::output::{self, Sidecars};
use crate::tree;
use crate::ui::{self, Step};
use crate::verity;

/// What one pass leaves behind.
#[derive(Default)]
pub struct BuildOutput {
    pub raw: Option<NamedTempFile>,
    pub tar: Option<NamedTempFile>,
    pub root_hash: Option<String>,
}

pub fn make_output_dir(config: &BuildConfig) -> Result<()> {
    match &config.output_dir {
        Some(dir) => mkdir_last(dir, 0o755),
        None => Ok(()),
    }
}

pub fn make_build_dir(config: &BuildConfig) -> Result<()> {
    match &config.build_dir {
        Some(dir) => mkdir_last(dir, 0o755),
        None => Ok(()),
    }
}

/// Fill the mounted image tree.
///
/// Skeleton trees go in before the distribution so packages win over
/// skeleton defaults. The package cache is only mounted while packages and
/// scripts run; identity and read-only marking happen after it is gone.
pub fn populate(
    ctx: &mut BuildContext,
    workspace: &Workspace,
    loopdev: Option<&Path>,
    pass: Pass,
    cached: bool,
) -> Result<()> {
    tree::prepare_tree(ctx, workspace, pass, cached)?;

    {
        let installer = distro::installer(ctx.config.distribution);
        let _cache = CacheMounts::mount(
            ctx.package_cache.as_deref(),
            &workspace.root(),
            installer.package_cache_paths(),
        )?;

        let cached = tree::reuse_cache_tree(ctx, workspace, pass, cached)?;
        tree::install_skeleton_trees(ctx, workspace)?;
        tree::install_distribution(ctx, workspace, pass, cached)?;
        tree::install_etc_hostname(ctx, workspace)?;
        tree::install_boot_loader(ctx, workspace, loopdev, cached)?;
        tree::install_extra_trees(ctx, workspace, pass)?;
        tree::install_build_src(ctx, workspace, pass)?;
        tree::install_build_dest(ctx, workspace, pass)?;
        tree::set_root_password(ctx, workspace, pass)?;
        tree::run_postinst_script(ctx, workspace, pass)?;
    }

    tree::reset_machine_id(workspace, pass)?;
    tree::reset_random_seed(workspace)?;
    tree::make_read_only(ctx, workspace, pass)?;
    Ok(())
}

/// Run one pass. A development pass without a build script does nothing,
/// and so does a cache pass whose snapshot already exists.
pub fn build_image(ctx: &mut BuildContext, workspace: &Workspace, pass: Pass) -> Result<BuildOutput> {
    if ctx.config.build_script.is_none() && pass.run_build_script {
        return Ok(BuildOutput::default());
    }

    make_build_dir(&ctx.config)?;

    let (mut raw, cached) = image::reuse_cache_image(ctx, pass)?;
    if pass.for_cache && cached {
        return Ok(BuildOutput::default());
    }
    if !cached {
        raw = image::create_image(ctx)?;
    }

    let loopdev = raw.as_ref().map(|r| LoopDevice::attach(r.path())).transpose()?;
    let loop_path = loopdev.as_ref().map(LoopDevice::path);

    filesystem::prepare_swap(ctx, loop_path, cached)?;
    filesystem::prepare_esp(ctx, loop_path, cached)?;
    if let Some(dev) = loop_path {
        luks::format_root(ctx, dev, pass, cached, false)?;
        luks::format_home(ctx, dev, pass, cached)?;
        luks::format_srv(ctx, dev, pass, cached)?;
    }

    let volumes = EncryptedVolumes::setup(ctx, loop_path, pass)?;
    filesystem::prepare_root(&ctx.config, volumes.root_dev.as_deref(), cached)?;
    filesystem::prepare_home(volumes.home_dev.as_deref(), cached)?;
    filesystem::prepare_srv(volumes.srv_dev.as_deref(), cached)?;

    let root = workspace.root();
    let mounted = MountedImage::mount(
        ctx,
        &root,
        loop_path,
        volumes.root_dev.as_deref(),
        volumes.home_dev.as_deref(),
        volumes.srv_dev.as_deref(),
        false,
    )?;
    populate(ctx, workspace, loop_path, pass, cached)?;
    mounted.unmount();

    let squashfs = image::make_squashfs(ctx, workspace, pass)?;
    image::insert_squashfs(ctx, raw.as_ref(), loopdev.as_ref(), squashfs.as_ref(), pass)?;
    drop(squashfs);

    let verity = verity::make_verity(ctx, volumes.root_dev.as_deref(), pass)?;
    let root_hash = verity.as_ref().map(|(_, hash)| hash.clone());
    verity::patch_root_uuid(ctx, loopdev.as_ref(), root_hash.as_deref(), pass)?;
    verity::insert_verity(ctx, raw.as_ref(), loopdev.as_ref(), verity.as_ref(), pass)?;
    drop(verity);

    // The verity data is final, so the root stays read-only from here on.
    let mounted = MountedImage::mount(
        ctx,
        &root,
        loop_path,
        volumes.root_dev.as_deref(),
        volumes.home_dev.as_deref(),
        volumes.srv_dev.as_deref(),
        true,
    )?;
    boot::install_unified_kernel(ctx, workspace, pass, root_hash.as_deref())?;
    boot::secure_boot_sign(ctx, workspace, pass)?;
    mounted.unmount();

    volumes.close()?;
    if let Some(loopdev) = loopdev {
        loopdev.detach();
    }

    let tar = output::make_tar(ctx, workspace, pass)?;
    Ok(BuildOutput { raw, tar, root_hash })
}

/// Throw away what a cache or development pass produced. Final pass
/// artifacts are left alone.
pub fn remove_artifacts(workspace: &Workspace, raw: Option<NamedTempFile>, tar: Option<NamedTempFile>, pass: Pass) {
    let what = if pass.for_cache {
        "cache build"
    } else if pass.run_build_script {
        "development build"
    } else {
        return;
    };

    if let Some(raw) = raw {
        let step = Step::start(&format!("Removing disk image from {}", what));
        drop(raw);
        step.finish();
    }
    if let Some(tar) = tar {
        let step = Step::start(&format!("Removing tar image from {}", what));
        drop(tar);
        step.finish();
    }

    let step = Step::start(&format!("Removing artifacts from {}", what));
    unlink_try_hard(&workspace.root());
    unlink_try_hard(&workspace.path().join("var-tmp"));
    step.finish();
}

/// Run a cache pass and store its snapshot.
fn build_cache_pass(ctx: &mut BuildContext, workspace: &Workspace, pass: Pass) -> Result<()> {
    let out = build_image(ctx, workspace, pass)?;
    let dest = if pass.run_build_script {
        ctx.config.cache_pre_dev.clone()
    } else {
        ctx.config.cache_pre_inst.clone()
    };
    cache::save_cache(ctx, workspace, out.raw, dest.as_deref())?;
    remove_artifacts(workspace, None, out.tar, pass);
    Ok(())
}

/// Produce the output and its sidecars.
pub fn build_stuff(ctx: &mut BuildContext) -> Result<()> {
    make_output_dir(&ctx.config)?;
    let _package_cache = cache::setup_package_cache(ctx)?;
    let workspace = Workspace::create(&ctx.config)?;

    if cache::need_cache_images(&ctx.config) {
        if ctx.config.build_script.is_some() {
            build_cache_pass(ctx, &workspace, Pass::new(true, true))?;
        }
        build_cache_pass(ctx, &workspace, Pass::new(false, true))?;
    }

    if ctx.config.build_script.is_some() {
        let pass = Pass::new(true, false);
        let out = build_image(ctx, &workspace, pass)?;
        nspawn::run_build_script(ctx, &workspace, out.raw.as_ref().map(NamedTempFile::path))?;
        remove_artifacts(&workspace, out.raw, out.tar, pass);
    }

    let out = build_image(ctx, &workspace, Pass::FINAL)?;
    let config = &ctx.config;

    let raw = output::qcow2_output(config, out.raw)?;
    let raw = output::xz_output(config, raw)?;

    let mut sidecars = Sidecars {
        root_hash: output::write_root_hash_file(config, out.root_hash.as_deref())?,
        nspawn_settings: output::copy_nspawn_settings(config)?,
        ..Default::default()
    };
    sidecars.checksum = output::calculate_sha256sum(
        config,
        raw.as_ref().or(out.tar.as_ref()),
        sidecars.root_hash.as_ref(),
        sidecars.nspawn_settings.as_ref(),
    )?;
    sidecars.signature = output::calculate_signature(config, sidecars.checksum.as_ref())?;
    sidecars.bmap = output::calculate_bmap(config, raw.as_ref())?;

    output::link_output(ctx, &workspace, raw.as_ref(), out.tar.as_ref())?;
    output::link_sidecars(ctx, &sidecars)?;

    if let Some(hash) = &out.root_hash {
        ui::info(&format!("Root hash is {}.", hash));
    }
    Ok(())
}
