//! Booting or entering a built image: systemd-nspawn for `shell`/`boot`,
//! QEMU with UEFI firmware for `qemu`.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::config::{BuildConfig, Verb};
use crate::error::MkosiError;
use crate::process::{self, Cmd};

/// systemd-nspawn arguments for `shell` and `boot`.
pub fn shell_args(config: &BuildConfig) -> Vec<String> {
    let target = if config.format.is_tree() {
        format!("--directory={}", config.output.display())
    } else {
        format!("--image={}", config.output.display())
    };
    let mut args = vec![target];
    if config.verb == Verb::Boot {
        args.push("--boot".to_string());
    }
    if !config.cmdline.is_empty() {
        args.push("--".to_string());
        args.extend(config.cmdline.iter().cloned());
    }
    args
}

/// Replace this process with a container running the image.
pub fn run_shell(config: &BuildConfig) -> Result<()> {
    Cmd::new("systemd-nspawn").args(shell_args(config)).exec()
}

/// QEMU candidates in order of preference, for the host architecture.
fn qemu_candidates(host_arch: &str) -> Vec<Vec<&'static str>> {
    let arch_binary = match host_arch {
        "x86_64" => Some("qemu-system-x86_64"),
        "x86" | "i386" | "i686" => Some("qemu-system-i386"),
        _ => None,
    };
    let mut candidates = Vec::new();
    if let Some(binary) = arch_binary {
        candidates.push(vec![binary, "-machine", "accel=kvm"]);
    }
    candidates.push(vec!["qemu", "-machine", "accel=kvm"]);
    candidates.push(vec!["qemu-kvm"]);
    candidates
}

/// OVMF locations. Architecture-specific paths come first since they are
/// almost certainly right when present.
fn firmware_candidates(host_arch: &str) -> Vec<&'static str> {
    let mut candidates = match host_arch {
        "x86_64" => vec!["/usr/share/ovmf/ovmf_code_x64.bin"],
        "x86" | "i386" | "i686" => vec![
            "/usr/share/ovmf/ovmf_code_ia32.bin",
            "/usr/share/edk2/ovmf-ia32/OVMF_CODE.fd",
        ],
        _ => Vec::new(),
    };
    candidates.extend(["/usr/share/edk2/ovmf/OVMF_CODE.fd", "/usr/share/qemu/OVMF_CODE.fd"]);
    candidates
}

fn find_qemu(host_arch: &str) -> Result<Vec<&'static str>> {
    qemu_candidates(host_arch)
        .into_iter()
        .find(|c| process::exists(c[0]))
        .ok_or_else(|| {
            MkosiError::ToolNotFound {
                tool: "QEMU/KVM binary".to_string(),
                hint: "Install qemu with KVM support.".to_string(),
            }
            .into()
        })
}

fn find_firmware(host_arch: &str) -> Result<PathBuf> {
    firmware_candidates(host_arch)
        .into_iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .ok_or_else(|| {
            MkosiError::ToolNotFound {
                tool: "OVMF UEFI firmware blob".to_string(),
                hint: "Install the ovmf or edk2-ovmf package.".to_string(),
            }
            .into()
        })
}

/// Arguments after the QEMU binary and its machine flags.
fn qemu_args(config: &BuildConfig, firmware: &Path) -> Vec<String> {
    let format = if config.qcow2 { "qcow2" } else { "raw" };
    let mut args: Vec<String> = vec![
        "-smp".into(),
        "2".into(),
        "-m".into(),
        "1024".into(),
        "-drive".into(),
        format!("if=pflash,format=raw,readonly,file={}", firmware.display()),
        "-drive".into(),
        format!("format={},file={}", format, config.output.display()),
    ];
    args.extend(config.cmdline.iter().cloned());
    args
}

/// Replace this process with QEMU booting the image through UEFI.
pub fn run_qemu(config: &BuildConfig) -> Result<()> {
    let host_arch = std::env::consts::ARCH;
    let qemu = find_qemu(host_arch)?;
    let firmware = find_firmware(host_arch)?;

    Cmd::new(qemu[0])
        .args(&qemu[1..])
        .args(qemu_args(config, &firmware))
        .exec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use tempfile::TempDir;

    #[test]
    fn test_shell_args() {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path(), |s| {
            s.verb = Verb::Boot;
            s.format = Some("directory".to_string());
            s.cmdline = vec!["systemd.unit=rescue.target".to_string()];
        });
        let args = shell_args(&config);
        assert_eq!(args[0], format!("--directory={}", temp.path().join("image").display()));
        assert_eq!(args[1..], ["--boot", "--", "systemd.unit=rescue.target"]);

        let config = test_config(temp.path(), |s| {
            s.verb = Verb::Shell;
            s.format = Some("raw_ext4".to_string());
        });
        assert_eq!(
            shell_args(&config),
            [format!("--image={}", temp.path().join("image.raw").display())]
        );
    }

    #[test]
    fn test_candidates_order() {
        assert_eq!(qemu_candidates("x86_64")[0][0], "qemu-system-x86_64");
        assert_eq!(qemu_candidates("aarch64")[0][0], "qemu");
        assert_eq!(qemu_candidates("aarch64").last().unwrap(), &vec!["qemu-kvm"]);

        let fw = firmware_candidates("x86_64");
        assert_eq!(fw[0], "/usr/share/ovmf/ovmf_code_x64.bin");
        assert_eq!(fw.last().unwrap(), &"/usr/share/qemu/OVMF_CODE.fd");
    }

    #[test]
    fn test_qemu_args() {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path(), |s| {
            s.verb = Verb::Qemu;
            s.format = Some("raw_btrfs".to_string());
            s.qcow2 = Some(true);
        });
        let args = qemu_args(&config, Path::new("/fw/OVMF_CODE.fd"));
        assert_eq!(args[5], "if=pflash,format=raw,readonly,file=/fw/OVMF_CODE.fd");
        assert_eq!(args[7], format!("format=qcow2,file={}", temp.path().join("image.qcow2").display()));
    }
}
