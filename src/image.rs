//! The raw disk image backing file.
//!
//! A raw image is a hidden temporary file next to the output. It is either
//! created empty and partitioned here, or cloned from an incremental cache
//! snapshot. Squashfs and verity partitions are appended after the tree is
//! populated, growing the file as they go.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::Path;
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::common::files::reflink_or_copy;
use crate::common::{temp_file_in, Workspace};
use crate::config::{Encrypt, OutputFormat};
use crate::context::{BuildContext, Pass};
use crate::gpt::{self, Partition, PartitionTable, ATTR_READ_ONLY, GPT_HEADER_SIZE};
use crate::loopdev::LoopDevice;
use crate::luks;
use crate::process::Cmd;
use crate::ui::{self, format_bytes, Step};

/// Best effort: images on btrfs should not be copy-on-write.
fn disable_cow(path: &Path) {
    let _ = Cmd::new("chattr").arg("+C").arg_path(path).quiet().allow_fail().run();
}

/// Create the sparse backing file and write the initial partition table.
///
/// Returns `None` for non-raw formats.
pub fn create_image(ctx: &mut BuildContext) -> Result<Option<NamedTempFile>> {
    if !ctx.config.format.is_raw() {
        return Ok(None);
    }

    let file = temp_file_in(ctx.config.output_parent(), ".mkosi-")?;
    let step = Step::with_done(
        "Creating partition table",
        &format!("Created partition table as {}", file.path().display()),
    );

    disable_cow(file.path());
    file.as_file()
        .set_len(gpt::image_size(&ctx.config)?)
        .context("Failed to size image file")?;

    let layout = gpt::determine_layout(&ctx.config)?;
    if layout.needs_partitioning {
        gpt::write(file.path(), &layout.table)?;
    }
    ctx.partitions = layout.partitions;
    ctx.ran_sfdisk = layout.needs_partitioning;

    step.finish();
    Ok(Some(file))
}

/// Cache snapshot used to seed a raw image for this pass.
fn cache_image_path(ctx: &BuildContext, pass: Pass) -> Option<&Path> {
    if !ctx.config.incremental || !ctx.config.format.is_raw_rw() {
        return None;
    }
    if pass.run_build_script {
        ctx.config.cache_pre_dev.as_deref()
    } else {
        ctx.config.cache_pre_inst.as_deref()
    }
}

/// Clone the cached raw image for this pass, if there is one.
///
/// Returns the clone and whether the image is cached. Cache passes only
/// ask whether the snapshot exists and never clone it.
pub fn reuse_cache_image(ctx: &mut BuildContext, pass: Pass) -> Result<(Option<NamedTempFile>, bool)> {
    let Some(cache) = cache_image_path(ctx, pass).map(Path::to_path_buf) else {
        return Ok((None, false));
    };

    if pass.for_cache {
        return Ok((None, cache.exists()));
    }

    let step = Step::start(&format!("Basing off cached image {}", cache.display()));
    let source = match File::open(&cache) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((None, false)),
        Err(e) => return Err(e).with_context(|| format!("Failed to open {}", cache.display())),
    };

    let mut file = temp_file_in(ctx.config.output_parent(), ".mkosi-")?;
    disable_cow(file.path());
    reflink_or_copy(&source, file.as_file_mut())
        .with_context(|| format!("Failed to copy {}", cache.display()))?;

    let layout = gpt::determine_layout(&ctx.config)?;
    ctx.partitions = layout.partitions;
    ctx.ran_sfdisk = layout.needs_partitioning;

    step.finish();
    Ok((Some(file), true))
}

/// Compress the populated tree into a squashfs blob.
pub fn make_squashfs(ctx: &BuildContext, workspace: &Workspace, pass: Pass) -> Result<Option<NamedTempFile>> {
    if ctx.config.format != OutputFormat::RawSquashfs || pass.for_cache {
        return Ok(None);
    }

    let step = Step::start("Creating squashfs file system");
    let file = temp_file_in(ctx.config.output_parent(), ".mkosi-squashfs")?;
    Cmd::new("mksquashfs")
        .arg_path(&workspace.root())
        .arg_path(file.path())
        .args(["-comp", "lz4", "-noappend"])
        .error_msg("mksquashfs failed")
        .run()?;
    step.finish();
    Ok(Some(file))
}

/// A partition to append after the last one.
pub struct NewPartition<'a> {
    pub partno: u32,
    pub blob: &'a Path,
    pub name: &'a str,
    pub type_uuid: Uuid,
    pub uuid: Option<Uuid>,
}

/// The table to extend: the device's current one, or an empty table when
/// the image was never partitioned.
fn current_table(ctx: &BuildContext, loopdev: &LoopDevice) -> Result<(PartitionTable, u64)> {
    if ctx.ran_sfdisk {
        gpt::read(loopdev.path())
    } else {
        Ok((PartitionTable::new(), GPT_HEADER_SIZE))
    }
}

/// Grow the image, append a read-only partition and copy `blob` into it.
///
/// Returns the blob size rounded up to a sector.
pub fn insert_partition(
    ctx: &mut BuildContext,
    raw: &NamedTempFile,
    loopdev: &LoopDevice,
    new: NewPartition<'_>,
) -> Result<u64> {
    let (mut table, last) = current_table(ctx, loopdev)?;
    let blob_len = fs::metadata(new.blob)
        .with_context(|| format!("Failed to stat {}", new.blob.display()))?
        .len();
    let plan = gpt::plan_insertion(last, blob_len, ctx.config.encrypt == Some(Encrypt::All));

    ui::info(&format!("Resizing disk image to {}...", format_bytes(plan.new_file_size)));
    raw.as_file()
        .set_len(plan.new_file_size)
        .context("Failed to grow image file")?;
    loopdev.set_capacity()?;

    ui::info(&format!("Inserting partition of {}...", format_bytes(plan.blob_size)));
    table.push(Partition {
        size: Some(plan.sectors),
        type_uuid: Some(new.type_uuid),
        uuid: new.uuid,
        name: Some(new.name.to_string()),
        attrs: Some(ATTR_READ_ONLY.to_string()),
        ..Default::default()
    });
    gpt::write(loopdev.path(), &table)?;
    ctx.ran_sfdisk = true;

    ui::info("Writing partition...");
    let volume = if ctx.partitions.root == Some(new.partno) {
        luks::format_root(ctx, loopdev.path(), Pass::FINAL, false, true)?;
        luks::setup_root(ctx, loopdev.path(), Pass::FINAL, true)?
    } else {
        None
    };

    let target = match &volume {
        Some(v) => v.path().to_path_buf(),
        None => loopdev.partition(new.partno),
    };
    let copied = Cmd::new("dd")
        .arg(format!("if={}", new.blob.display()))
        .arg(format!("of={}", target.display()))
        .error_msg("Writing partition failed")
        .run();

    if let Some(volume) = volume {
        volume.close()?;
    }
    copied?;

    Ok(plan.blob_size)
}

/// Put the squashfs blob into the root slot reserved by the layout.
pub fn insert_squashfs(
    ctx: &mut BuildContext,
    raw: Option<&NamedTempFile>,
    loopdev: Option<&LoopDevice>,
    squashfs: Option<&NamedTempFile>,
    pass: Pass,
) -> Result<()> {
    if ctx.config.format != OutputFormat::RawSquashfs || pass.for_cache {
        return Ok(());
    }
    let (Some(raw), Some(loopdev), Some(squashfs)) = (raw, loopdev, squashfs) else {
        return Ok(());
    };
    let partno = ctx.partitions.root.context("No root partition number assigned")?;

    let step = Step::start("Inserting squashfs root partition");
    let type_uuid = gpt::gpt_root_native(&ctx.config.architecture)?.root;
    let size = insert_partition(
        ctx,
        raw,
        loopdev,
        NewPartition {
            partno,
            blob: squashfs.path(),
            name: "Root Partition",
            type_uuid,
            uuid: None,
        },
    )?;
    ctx.config.root_size = Some(size);
    step.finish();
    Ok(())
}
