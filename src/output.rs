//! Post-processing the final artifacts and promoting them to the output
//! paths.
//!
//! Every artifact is produced as a hidden temporary file next to its final
//! location. Promotion sets the mode from the original umask and hard-links
//! the temporary into place; the temporary itself is removed on drop.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use tempfile::NamedTempFile;

use crate::common::{dir_size, temp_file_in, Workspace};
use crate::config::{BuildConfig, OutputFormat};
use crate::context::{BuildContext, Pass};
use crate::error::MkosiError;
use crate::process::{self, Cmd};
use crate::ui::{self, format_bytes, Step};

fn parent_of(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new("/"))
}

fn reopen(file: &NamedTempFile) -> Result<File> {
    file.reopen()
        .with_context(|| format!("Failed to reopen {}", file.path().display()))
}

/// xz-compressed tarball of the image tree.
pub fn make_tar(ctx: &BuildContext, workspace: &Workspace, pass: Pass) -> Result<Option<NamedTempFile>> {
    if pass.run_build_script || ctx.config.format != OutputFormat::Tar || pass.for_cache {
        return Ok(None);
    }

    let step = Step::start("Creating archive");
    let file = temp_file_in(ctx.config.output_parent(), ".mkosi-")?;
    Cmd::new("tar")
        .arg("-C")
        .arg_path(&workspace.root())
        .args(["-c", "-J", "--xattrs", "--xattrs-include=*", "."])
        .stdout_file(reopen(&file)?)
        .error_msg("tar failed")
        .run()?;
    step.finish();
    Ok(Some(file))
}

/// Convert the raw image to qcow2 when requested.
pub fn qcow2_output(config: &BuildConfig, raw: Option<NamedTempFile>) -> Result<Option<NamedTempFile>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    if !config.format.is_raw() || !config.qcow2 {
        return Ok(Some(raw));
    }

    let step = Step::start("Converting image file to qcow2");
    let file = temp_file_in(config.output_parent(), ".mkosi-")?;
    Cmd::new("qemu-img")
        .args(["convert", "-fraw", "-Oqcow2"])
        .arg_path(raw.path())
        .arg_path(file.path())
        .error_msg("qemu-img convert failed")
        .run()?;
    step.finish();
    Ok(Some(file))
}

/// Compress the (possibly converted) image with xz when requested. pxz is
/// preferred when installed.
pub fn xz_output(config: &BuildConfig, raw: Option<NamedTempFile>) -> Result<Option<NamedTempFile>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    if !config.format.is_raw() || !config.xz {
        return Ok(Some(raw));
    }

    let xz = if process::exists("pxz") { "pxz" } else { "xz" };
    let step = Step::start("Compressing image file");
    let file = temp_file_in(config.output_parent(), ".mkosi-")?;
    Cmd::new(xz)
        .arg("-c")
        .arg_path(raw.path())
        .stdout_file(reopen(&file)?)
        .error_msg(format!("{} failed", xz))
        .run()?;
    step.finish();
    Ok(Some(file))
}

pub fn write_root_hash_file(config: &BuildConfig, root_hash: Option<&str>) -> Result<Option<NamedTempFile>> {
    let (Some(root_hash), Some(dest)) = (root_hash, config.output_root_hash_file.as_deref()) else {
        return Ok(None);
    };

    let step = Step::start("Writing .roothash file");
    let mut file = temp_file_in(parent_of(dest), ".mkosi-")?;
    writeln!(file, "{}", root_hash)?;
    file.flush()?;
    step.finish();
    Ok(Some(file))
}

pub fn copy_nspawn_settings(config: &BuildConfig) -> Result<Option<NamedTempFile>> {
    let (Some(src), Some(dest)) = (
        config.nspawn_settings.as_deref(),
        config.output_nspawn_settings.as_deref(),
    ) else {
        return Ok(None);
    };

    let step = Step::start("Copying nspawn settings file");
    let mut file = temp_file_in(parent_of(dest), ".mkosi-")?;
    let mut source = File::open(src).with_context(|| format!("Failed to open {}", src.display()))?;
    io::copy(&mut source, &mut file)?;
    file.flush()?;
    step.finish();
    Ok(Some(file))
}

/// One `SHA256SUMS` line: `<hex> *<name>`.
pub fn sha256sum_line(path: &Path, name: &str) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x} *{}\n", hasher.finalize(), name))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Sidecar files of the final pass, before promotion.
#[derive(Default)]
pub struct Sidecars {
    pub root_hash: Option<NamedTempFile>,
    pub nspawn_settings: Option<NamedTempFile>,
    pub checksum: Option<NamedTempFile>,
    pub signature: Option<NamedTempFile>,
    pub bmap: Option<NamedTempFile>,
}

/// `SHA256SUMS` over the image or archive and the root hash and nspawn
/// sidecars, each listed under its final name.
pub fn calculate_sha256sum(
    config: &BuildConfig,
    image: Option<&NamedTempFile>,
    root_hash: Option<&NamedTempFile>,
    nspawn_settings: Option<&NamedTempFile>,
) -> Result<Option<NamedTempFile>> {
    if config.format.is_tree() || !config.checksum {
        return Ok(None);
    }
    let Some(dest) = config.output_checksum.as_deref() else {
        return Ok(None);
    };

    let step = Step::start("Calculating SHA256SUMS");
    let mut file = temp_file_in(parent_of(dest), ".mkosi-")?;
    let entries = [
        (image, Some(config.output.as_path())),
        (root_hash, config.output_root_hash_file.as_deref()),
        (nspawn_settings, config.output_nspawn_settings.as_deref()),
    ];
    for (artifact, name) in entries {
        if let (Some(artifact), Some(name)) = (artifact, name) {
            file.write_all(sha256sum_line(artifact.path(), &file_name(name))?.as_bytes())?;
        }
    }
    file.flush()?;
    step.finish();
    Ok(Some(file))
}

fn gpg_args(key: Option<&str>) -> Vec<&str> {
    let mut args = vec!["--detach-sign"];
    if let Some(key) = key {
        args.extend(["--default-key", key]);
    }
    args
}

/// Detached gpg signature of `SHA256SUMS`.
pub fn calculate_signature(config: &BuildConfig, checksum: Option<&NamedTempFile>) -> Result<Option<NamedTempFile>> {
    if !config.sign {
        return Ok(None);
    }
    let (Some(checksum), Some(dest)) = (checksum, config.output_signature.as_deref()) else {
        return Ok(None);
    };

    let step = Step::start("Signing SHA256SUMS");
    let file = temp_file_in(parent_of(dest), ".mkosi-")?;
    Cmd::new("gpg")
        .args(gpg_args(config.key.as_deref()))
        .stdin_file(reopen(checksum)?)
        .stdout_file(reopen(&file)?)
        .error_msg("gpg failed")
        .run()?;
    step.finish();
    Ok(Some(file))
}

/// Block map of the raw image for bmaptool.
pub fn calculate_bmap(config: &BuildConfig, raw: Option<&NamedTempFile>) -> Result<Option<NamedTempFile>> {
    if !config.bmap || !config.format.is_raw_rw() {
        return Ok(None);
    }
    let (Some(raw), Some(dest)) = (raw, config.output_bmap.as_deref()) else {
        return Ok(None);
    };

    let step = Step::start("Creating BMAP file");
    let file = temp_file_in(parent_of(dest), ".mkosi-")?;
    Cmd::new("bmaptool")
        .arg("create")
        .arg_path(raw.path())
        .stdout_file(reopen(&file)?)
        .error_msg("bmaptool create failed")
        .run()?;
    step.finish();
    Ok(Some(file))
}

/// chmod to the output mode, then hard-link into place.
fn promote(ctx: &BuildContext, file: &Path, dest: &Path) -> Result<()> {
    fs::set_permissions(file, fs::Permissions::from_mode(ctx.output_mode()))?;
    fs::hard_link(file, dest)
        .with_context(|| format!("Failed to link {} to {}", file.display(), dest.display()))?;
    Ok(())
}

/// Move the image into its final place: the tree is renamed, files are
/// hard-linked.
pub fn link_output(
    ctx: &BuildContext,
    workspace: &Workspace,
    raw: Option<&NamedTempFile>,
    tar: Option<&NamedTempFile>,
) -> Result<()> {
    let output = ctx.output();
    let step = Step::with_done(
        "Linking image file",
        &format!("Successfully linked {}", output.display()),
    );
    if ctx.config.format.is_tree() {
        fs::rename(workspace.root(), output)
            .with_context(|| format!("Failed to move image tree to {}", output.display()))?;
    } else {
        let artifact = if ctx.config.format.is_raw() { raw } else { tar };
        let artifact = artifact.context("No image file to link")?;
        promote(ctx, artifact.path(), output)?;
    }
    step.finish();
    Ok(())
}

fn link_sidecar(ctx: &BuildContext, file: Option<&NamedTempFile>, dest: Option<&Path>, what: &str) -> Result<()> {
    let (Some(file), Some(dest)) = (file, dest) else {
        return Ok(());
    };
    let step = Step::with_done(
        &format!("Linking {} file", what),
        &format!("Successfully linked {}", dest.display()),
    );
    promote(ctx, file.path(), dest)?;
    step.finish();
    Ok(())
}

/// Promote every sidecar that was produced.
pub fn link_sidecars(ctx: &BuildContext, sidecars: &Sidecars) -> Result<()> {
    let config = &ctx.config;
    link_sidecar(ctx, sidecars.root_hash.as_ref(), config.output_root_hash_file.as_deref(), ".roothash")?;
    link_sidecar(ctx, sidecars.checksum.as_ref(), config.output_checksum.as_deref(), "SHA256SUMS")?;
    link_sidecar(ctx, sidecars.signature.as_ref(), config.output_signature.as_deref(), "SHA256SUMS.gpg")?;
    link_sidecar(ctx, sidecars.bmap.as_ref(), config.output_bmap.as_deref(), ".bmap")?;
    link_sidecar(
        ctx,
        sidecars.nspawn_settings.as_ref(),
        config.output_nspawn_settings.as_deref(),
        "nspawn settings",
    )?;
    Ok(())
}

/// Refuse to overwrite an existing output or enabled sidecar.
pub fn check_output(config: &BuildConfig) -> Result<()> {
    for file in config.output_files() {
        if fs::symlink_metadata(file).is_ok() {
            return Err(MkosiError::OutputExists(file.to_path_buf()).into());
        }
    }
    Ok(())
}

/// Apparent and allocated size of the promoted output.
pub fn print_output_size(config: &BuildConfig) -> Result<()> {
    if config.format.is_tree() {
        ui::info(&format!(
            "Resulting image size is {}.",
            format_bytes(dir_size(&config.output))
        ));
    } else {
        let meta = fs::metadata(&config.output)
            .with_context(|| format!("Failed to stat {}", config.output.display()))?;
        ui::info(&format!(
            "Resulting image size is {}, consumes {}.",
            format_bytes(meta.len()),
            format_bytes(meta.blocks() * 512)
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use tempfile::TempDir;

    #[test]
    fn test_sha256sum_line() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("blob");
        fs::write(&path, "abc").unwrap();
        assert_eq!(
            sha256sum_line(&path, "image.raw").unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad *image.raw\n"
        );
    }

    #[test]
    fn test_checksum_lists_final_names() {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path(), |s| {
            s.format = Some("raw_squashfs".to_string());
            s.checksum = Some(true);
            s.verity = Some(true);
        });

        let mut image = temp_file_in(temp.path(), ".mkosi-").unwrap();
        image.write_all(b"image").unwrap();
        let hash = write_root_hash_file(&config, Some("deadbeef")).unwrap().unwrap();
        assert_eq!(fs::read_to_string(hash.path()).unwrap(), "deadbeef\n");

        let sums = calculate_sha256sum(&config, Some(&image), Some(&hash), None)
            .unwrap()
            .unwrap();
        let text = fs::read_to_string(sums.path()).unwrap();
        let names: Vec<&str> = text
            .lines()
            .map(|l| l.split_once(" *").unwrap().1)
            .collect();
        assert_eq!(names, ["image.raw", "image.roothash"]);
    }

    #[test]
    fn test_no_checksum_for_trees() {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path(), |s| {
            s.format = Some("directory".to_string());
            s.checksum = Some(true);
        });
        assert!(calculate_sha256sum(&config, None, None, None).unwrap().is_none());
    }

    #[test]
    fn test_gpg_args() {
        assert_eq!(gpg_args(None), ["--detach-sign"]);
        assert_eq!(gpg_args(Some("ABCD")), ["--detach-sign", "--default-key", "ABCD"]);
    }

    #[test]
    fn test_check_output_refuses_existing_sidecar() {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path(), |s| {
            s.format = Some("raw_ext4".to_string());
            s.checksum = Some(true);
        });
        assert!(check_output(&config).is_ok());

        fs::write(config.output_checksum.as_ref().unwrap(), "").unwrap();
        let err = check_output(&config).unwrap_err();
        assert!(err.to_string().contains("SHA256SUMS exists already"));
        assert_eq!(crate::error::exit_code_for(&err), 3);
    }

    #[test]
    fn test_link_output_uses_output_mode() {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path(), |s| s.format = Some("raw_ext4".to_string()));
        let ctx = BuildContext::new(config, 0o027);
        let workspace = Workspace::in_dir(temp.path()).unwrap();

        let mut raw = temp_file_in(temp.path(), ".mkosi-").unwrap();
        raw.write_all(b"disk").unwrap();
        link_output(&ctx, &workspace, Some(&raw), None).unwrap();
        drop(raw);

        let meta = fs::metadata(ctx.output()).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o640);
        assert_eq!(fs::read(ctx.output()).unwrap(), b"disk");
    }

    #[test]
    fn test_untouched_when_not_requested() {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path(), |s| s.format = Some("raw_ext4".to_string()));
        let raw = temp_file_in(temp.path(), ".mkosi-").unwrap();
        let path = raw.path().to_path_buf();
        let raw = xz_output(&config, qcow2_output(&config, Some(raw)).unwrap()).unwrap().unwrap();
        assert_eq!(raw.path(), path);
    }
}
