//! Shell, boot, qemu and withmount commands - use a built image.

use anyhow::{Context, Result};

use crate::common::Workspace;
use crate::config::BuildConfig;
use crate::context::{BuildContext, Pass};
use crate::error::MkosiError;
use crate::filesystem::MountedImage;
use crate::gpt;
use crate::loopdev::LoopDevice;
use crate::luks::EncryptedVolumes;
use crate::namespace;
use crate::process::Cmd;
use crate::qemu;

/// Execute `shell` or `boot`.
pub fn cmd_shell(config: &BuildConfig) -> Result<()> {
    qemu::run_shell(config)
}

/// Execute `qemu`.
pub fn cmd_qemu(config: &BuildConfig) -> Result<()> {
    qemu::run_qemu(config)
}

/// Execute `withmount`: mount the existing output and run the given command
/// from the mounted root. Tree outputs are used in place.
pub fn cmd_withmount(config: BuildConfig) -> Result<()> {
    namespace::check_root()?;
    let (program, args) = config
        .cmdline
        .split_first()
        .ok_or_else(|| MkosiError::config("'withmount' requires a command to run."))?;
    let (program, args) = (program.clone(), args.to_vec());

    if config.format.is_tree() {
        Cmd::new(&program).args(&args).dir(&config.output).visible().run()?;
        return Ok(());
    }

    let umask = namespace::init_namespace()?;
    let mut ctx = BuildContext::new(config, umask);
    let layout = gpt::determine_layout(&ctx.config)?;
    ctx.partitions = layout.partitions;
    ctx.ran_sfdisk = layout.needs_partitioning;

    let workspace = Workspace::create(&ctx.config)?;
    let root = workspace.root();
    std::fs::create_dir_all(&root)
        .with_context(|| format!("Failed to create {}", root.display()))?;

    let loopdev = LoopDevice::attach(&ctx.config.output)?;
    let volumes = EncryptedVolumes::setup(&ctx, Some(loopdev.path()), Pass::FINAL)?;
    let mounted = MountedImage::mount(
        &ctx,
        &root,
        Some(loopdev.path()),
        volumes.root_dev.as_deref(),
        volumes.home_dev.as_deref(),
        volumes.srv_dev.as_deref(),
        ctx.config.read_only,
    )?;

    let result = Cmd::new(&program).args(&args).dir(&root).visible().run();

    mounted.unmount();
    volumes.close()?;
    loopdev.detach();
    result.map(drop)
}
