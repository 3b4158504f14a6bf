//! dm-verity hash tree for read-only root partitions.
//!
//! The root hash ties the two partitions together: its first 128 bits
//! become the root partition UUID, its last 128 bits the verity partition
//! UUID, so the pair can be discovered from the hash alone.

use anyhow::{Context, Result};
use std::path::Path;
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::common::temp_file_in;
use crate::context::{BuildContext, Pass};
use crate::error::MkosiError;
use crate::gpt;
use crate::image::{insert_partition, NewPartition};
use crate::loopdev::LoopDevice;
use crate::process::Cmd;
use crate::ui::Step;

/// Root hash from `veritysetup format` output.
pub fn parse_root_hash(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("Root hash:"))
        .map(|hash| hash.trim().to_string())
}

/// Root partition UUID derived from the root hash.
pub fn root_uuid(root_hash: &str) -> Result<Uuid> {
    let head = root_hash.get(..32).context("Root hash too short")?;
    Uuid::parse_str(head).with_context(|| format!("Invalid root hash {}", root_hash))
}

/// Verity partition UUID derived from the root hash.
pub fn verity_uuid(root_hash: &str) -> Result<Uuid> {
    let tail = root_hash
        .len()
        .checked_sub(32)
        .and_then(|start| root_hash.get(start..))
        .context("Root hash too short")?;
    Uuid::parse_str(tail).with_context(|| format!("Invalid root hash {}", root_hash))
}

/// Hash the root device into a temporary file. Returns the hash file and
/// the root hash.
pub fn make_verity(
    ctx: &BuildContext,
    root_dev: Option<&Path>,
    pass: Pass,
) -> Result<Option<(NamedTempFile, String)>> {
    if pass.run_build_script || !ctx.config.verity || pass.for_cache {
        return Ok(None);
    }
    let dev = root_dev.context("No root device to generate verity hashes for")?;

    let step = Step::start("Generating verity hashes");
    let file = temp_file_in(ctx.config.output_parent(), ".mkosi-")?;
    let result = Cmd::new("veritysetup")
        .arg("format")
        .arg_path(dev)
        .arg_path(file.path())
        .error_msg("veritysetup format failed")
        .run()?;
    let root_hash = parse_root_hash(&result.stdout).ok_or(MkosiError::RootHashNotFound)?;
    step.finish();

    Ok(Some((file, root_hash)))
}

/// Append the hash tree as the verity partition.
pub fn insert_verity(
    ctx: &mut BuildContext,
    raw: Option<&NamedTempFile>,
    loopdev: Option<&LoopDevice>,
    verity: Option<&(NamedTempFile, String)>,
    pass: Pass,
) -> Result<()> {
    if pass.for_cache {
        return Ok(());
    }
    let (Some(raw), Some(loopdev), Some((hashes, root_hash))) = (raw, loopdev, verity) else {
        return Ok(());
    };
    let partno = ctx.partitions.verity.context("No verity partition number assigned")?;

    let step = Step::start("Inserting verity partition");
    let type_uuid = gpt::gpt_root_native(&ctx.config.architecture)?.verity;
    insert_partition(
        ctx,
        raw,
        loopdev,
        NewPartition {
            partno,
            blob: hashes.path(),
            name: "Verity Partition",
            type_uuid,
            uuid: Some(verity_uuid(root_hash)?),
        },
    )?;
    step.finish();
    Ok(())
}

/// Set the root partition UUID to the one derived from `root_hash`.
pub fn patch_root_uuid(
    ctx: &BuildContext,
    loopdev: Option<&LoopDevice>,
    root_hash: Option<&str>,
    pass: Pass,
) -> Result<()> {
    if pass.for_cache {
        return Ok(());
    }
    let (Some(loopdev), Some(root_hash)) = (loopdev, root_hash) else {
        return Ok(());
    };
    let partno = ctx.partitions.root.context("No root partition number assigned")?;

    let step = Step::start("Patching root partition UUID");
    Cmd::new("sfdisk")
        .arg("--part-uuid")
        .arg_path(loopdev.path())
        .arg(partno.to_string())
        .arg(root_uuid(root_hash)?.hyphenated().to_string())
        .error_msg("Patching root partition UUID failed")
        .run()?;
    step.finish();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "6f0b9d7ea9c8a2e1f3b4c5d6e7f80912a1b2c3d4e5f60718293a4b5c6d7e8f90";

    #[test]
    fn test_parse_root_hash() {
        let out = "VERITY header information for /tmp/.mkosi-abc\n\
                   UUID:            \t1a2b3c4d-0000-0000-0000-000000000000\n\
                   Hash type:       \t1\n\
                   Root hash:      \t6f0b9d7ea9c8a2e1f3b4c5d6e7f80912a1b2c3d4e5f60718293a4b5c6d7e8f90\n";
        assert_eq!(parse_root_hash(out).as_deref(), Some(HASH));
        assert_eq!(parse_root_hash("Hash type: 1\n"), None);
    }

    #[test]
    fn test_uuids_from_root_hash() {
        assert_eq!(
            root_uuid(HASH).unwrap().hyphenated().to_string(),
            "6f0b9d7e-a9c8-a2e1-f3b4-c5d6e7f80912"
        );
        assert_eq!(
            verity_uuid(HASH).unwrap().hyphenated().to_string(),
            "a1b2c3d4-e5f6-0718-293a-4b5c6d7e8f90"
        );
        assert!(root_uuid("abcd").is_err());
        assert!(verity_uuid("abcd").is_err());
    }
}
