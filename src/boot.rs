//! Unified kernel images and Secure Boot signing of the ESP.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::common::Workspace;
use crate::config::{BuildConfig, Distribution, OutputFormat};
use crate::context::{BuildContext, Pass};
use crate::nspawn::run_workspace_command;
use crate::process::Cmd;
use crate::ui::Step;

/// Files dracut does not pick up on its own yet; each is passed as
/// `-i <src> <dest>` with identical paths.
const DRACUT_INCLUDES: &[&str] = &[
    "/usr/lib/systemd/system/systemd-volatile-root.service",
    "/usr/lib/systemd/systemd-volatile-root",
    "/usr/lib/systemd/systemd-veritysetup",
    "/usr/lib/systemd/system-generators/systemd-veritysetup-generator",
];

fn kernel_cmdline(config: &BuildConfig, root_hash: Option<&str>) -> String {
    let mut cmdline = config.kernel_command_line.clone().unwrap_or_default();
    if let Some(hash) = root_hash {
        cmdline.push_str(" roothash=");
        cmdline.push_str(hash);
    }
    cmdline
}

/// `/efi/EFI/Linux/linux-<kver>[-<roothash>].efi`, as seen inside the image.
fn boot_binary(kver: &str, root_hash: Option<&str>) -> String {
    match root_hash {
        Some(hash) => format!("/efi/EFI/Linux/linux-{}-{}.efi", kver, hash),
        None => format!("/efi/EFI/Linux/linux-{}.efi", kver),
    }
}

/// dracut invocation producing one unified EFI binary for `kver`.
fn dracut_command(config: &BuildConfig, kver: &str, root_hash: Option<&str>) -> Vec<String> {
    let mut cmd: Vec<String> = [
        "/usr/bin/dracut",
        "-v",
        "--no-hostonly",
        "--uefi",
        "--kver",
        kver,
        "--kernel-cmdline",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    cmd.push(kernel_cmdline(config, root_hash));

    for path in DRACUT_INCLUDES {
        cmd.extend(["-i", path, path].map(String::from));
    }
    if config.format == OutputFormat::RawSquashfs {
        cmd.extend(["--add-drivers", "squashfs"].map(String::from));
    }
    cmd.extend(["--add", "qemu"].map(String::from));
    cmd.push(boot_binary(kver, root_hash));
    cmd
}

/// Kernel versions with a module directory in the image.
fn module_versions(root: &Path) -> Result<Vec<String>> {
    let dir = root.join("usr/lib/modules");
    let mut versions = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            versions.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    versions.sort();
    Ok(versions)
}

/// Build a kernel + initrd + cmdline EFI binary into the ESP for every
/// installed kernel. Only dracut-based distributions are handled.
pub fn install_unified_kernel(
    ctx: &BuildContext,
    workspace: &Workspace,
    pass: Pass,
    root_hash: Option<&str>,
) -> Result<()> {
    let config = &ctx.config;
    if !config.bootable || pass.for_cache || pass.run_build_script {
        return Ok(());
    }
    if !matches!(config.distribution, Distribution::Fedora | Distribution::Mageia) {
        return Ok(());
    }

    let step = Step::start("Generating combined kernel + initrd boot file");
    for kver in module_versions(&workspace.root())? {
        run_workspace_command(ctx, workspace, &dracut_command(config, &kver, root_hash), false)?;
    }
    step.finish();
    Ok(())
}

fn is_efi_binary(name: &str) -> bool {
    name.ends_with(".efi") || name.ends_with(".EFI")
}

/// EFI binaries anywhere below the ESP mount point.
fn efi_binaries(esp: &Path) -> Vec<PathBuf> {
    WalkDir::new(esp)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_efi_binary(&e.file_name().to_string_lossy()))
        .map(|e| e.into_path())
        .collect()
}

/// Sign every EFI binary in the ESP in place.
pub fn secure_boot_sign(ctx: &BuildContext, workspace: &Workspace, pass: Pass) -> Result<()> {
    let config = &ctx.config;
    if pass.run_build_script || !config.bootable || !config.secure_boot || pass.for_cache {
        return Ok(());
    }
    let key = config.secure_boot_key.as_deref().context("No Secure Boot key configured")?;
    let cert = config
        .secure_boot_certificate
        .as_deref()
        .context("No Secure Boot certificate configured")?;

    for binary in efi_binaries(&workspace.root().join("efi")) {
        let name = binary.file_name().unwrap_or_default().to_string_lossy().into_owned();
        let step = Step::start(&format!("Signing EFI binary {} in ESP", name));
        let signed = crate::config::append_suffix(&binary, ".signed");
        Cmd::new("sbsign")
            .arg("--key")
            .arg_path(key)
            .arg("--cert")
            .arg_path(cert)
            .arg("--output")
            .arg_path(&signed)
            .arg_path(&binary)
            .error_msg("sbsign failed")
            .run()?;
        fs::rename(&signed, &binary)
            .with_context(|| format!("Failed to replace {}", binary.display()))?;
        step.finish();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use tempfile::TempDir;

    #[test]
    fn test_dracut_command_with_root_hash() {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path(), |s| {
            s.format = Some("raw_squashfs".to_string());
            s.bootable = Some(true);
            s.kernel_command_line = Some("quiet".to_string());
        });
        let cmd = dracut_command(&config, "4.18.16-300.fc29.x86_64", Some("abc123"));

        assert_eq!(cmd[..5], ["/usr/bin/dracut", "-v", "--no-hostonly", "--uefi", "--kver"]);
        assert_eq!(cmd[5], "4.18.16-300.fc29.x86_64");
        assert_eq!(cmd[7], "quiet roothash=abc123");
        assert_eq!(cmd.iter().filter(|a| *a == "-i").count(), 4);
        let i = cmd.iter().position(|a| a == "-i").unwrap();
        assert_eq!(cmd[i + 1], cmd[i + 2]);
        assert!(cmd.windows(2).any(|w| w == ["--add-drivers", "squashfs"]));
        assert_eq!(
            cmd.last().unwrap(),
            "/efi/EFI/Linux/linux-4.18.16-300.fc29.x86_64-abc123.efi"
        );
    }

    #[test]
    fn test_dracut_command_plain() {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path(), |s| {
            s.format = Some("raw_ext4".to_string());
            s.bootable = Some(true);
            s.kernel_command_line = Some("rw".to_string());
        });
        let cmd = dracut_command(&config, "5.0.0", None);
        assert_eq!(cmd[7], "rw");
        assert!(!cmd.iter().any(|a| a == "--add-drivers"));
        assert_eq!(cmd.last().unwrap(), "/efi/EFI/Linux/linux-5.0.0.efi");
    }

    #[test]
    fn test_module_versions_skip_files() {
        let temp = TempDir::new().unwrap();
        let modules = temp.path().join("usr/lib/modules");
        fs::create_dir_all(modules.join("5.1.0")).unwrap();
        fs::create_dir_all(modules.join("4.19.0")).unwrap();
        fs::write(modules.join("stray"), "").unwrap();
        assert_eq!(module_versions(temp.path()).unwrap(), ["4.19.0", "5.1.0"]);
    }

    #[test]
    fn test_efi_binaries_walk() {
        let temp = TempDir::new().unwrap();
        let esp = temp.path().join("efi");
        fs::create_dir_all(esp.join("EFI/BOOT")).unwrap();
        fs::create_dir_all(esp.join("EFI/Linux")).unwrap();
        fs::write(esp.join("EFI/BOOT/BOOTX64.EFI"), "").unwrap();
        fs::write(esp.join("EFI/Linux/linux-5.0.efi"), "").unwrap();
        fs::write(esp.join("EFI/Linux/readme.txt"), "").unwrap();

        let found: Vec<String> = efi_binaries(&esp)
            .iter()
            .map(|p| p.strip_prefix(&esp).unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(found, ["EFI/BOOT/BOOTX64.EFI", "EFI/Linux/linux-5.0.efi"]);
    }
}
