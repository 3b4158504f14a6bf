//! Arch Linux: pacstrap against a workspace-local pacman.conf.

use anyhow::Result;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::warn;

use super::{
    enable_networkd, enable_networkmanager, find_kernel_file, kernel_install_add, kernel_version,
    Installer,
};
use crate::common::{patch_file, write_file_with_dirs, Workspace};
use crate::config::{BuildConfig, Encrypt, OutputFormat};
use crate::context::BuildContext;
use crate::nspawn::run_workspace_command;
use crate::process::Cmd;
use crate::ui::Step;

/// Members of the `base` group left out of every image.
const BASE_EXCLUDED: &[&str] = &[
    "cryptsetup",
    "device-mapper",
    "dhcpcd",
    "e2fsprogs",
    "jfsutils",
    "linux",
    "lvm2",
    "man-db",
    "man-pages",
    "mdadm",
    "netctl",
    "reiserfsprogs",
    "xfsprogs",
];

const OFFICIAL_KERNELS: &[&str] = &["linux", "linux-lts", "linux-hardened", "linux-zen"];

fn server_line(mirror: &str, arch: &str) -> String {
    if arch == "aarch64" {
        format!("Server = {}/$arch/$repo", mirror)
    } else {
        format!("Server = {}/$repo/os/$arch", mirror)
    }
}

fn pacman_conf(root: &Path, server: &str) -> String {
    let root = root.display();
    format!(
        "[options]
RootDir     = {root}
LogFile     = /dev/null
CacheDir    = {root}/var/cache/pacman/pkg/
GPGDir      = {root}/etc/pacman.d/gnupg/
HookDir     = {root}/etc/pacman.d/hooks/
HoldPkg     = pacman glibc
Architecture = auto
UseSyslog
Color
CheckSpace
SigLevel    = Required DatabaseOptional

[core]
{server}

[extra]
{server}

[community]
{server}
"
    )
}

/// Packages for the first pacstrap: `base` minus the excluded members,
/// plus the kernel and whatever booting the chosen format requires.
fn base_packages(config: &BuildConfig, base_group: &str) -> BTreeSet<String> {
    let mut packages: BTreeSet<String> = base_group
        .split_whitespace()
        .filter(|p| !BASE_EXCLUDED.contains(p))
        .map(String::from)
        .collect();

    let kernels: BTreeSet<String> = config
        .packages
        .iter()
        .filter(|p| OFFICIAL_KERNELS.contains(&p.as_str()))
        .cloned()
        .collect();
    if kernels.len() > 1 {
        warn!(
            "More than one kernel will be installed: {}",
            kernels.iter().cloned().collect::<Vec<_>>().join(" ")
        );
    }
    packages.extend(kernels.iter().cloned());

    if config.bootable {
        match config.format {
            OutputFormat::RawExt4 => {
                packages.insert("e2fsprogs".to_string());
            }
            OutputFormat::RawBtrfs => {
                packages.insert("btrfs-progs".to_string());
            }
            OutputFormat::RawXfs => {
                packages.insert("xfsprogs".to_string());
            }
            _ => {}
        }
        if config.encrypt.is_some() {
            packages.insert("cryptsetup".to_string());
            packages.insert("device-mapper".to_string());
        }
        if kernels.is_empty() {
            packages.insert("linux".to_string());
        }
    }
    packages
}

/// Configured packages not already present after the base pacstrap.
fn user_packages(config: &BuildConfig, run_build_script: bool, installed: &str) -> BTreeSet<String> {
    let mut packages: BTreeSet<String> = config.packages.iter().cloned().collect();
    if run_build_script {
        packages.extend(config.build_packages.iter().cloned());
    }
    for p in installed.split_whitespace() {
        packages.remove(p);
    }
    packages
}

fn mkinitcpio_hooks(encrypt: Option<Encrypt>) -> &'static str {
    if encrypt == Some(Encrypt::All) {
        "HOOKS=\"systemd modconf block sd-encrypt filesystems keyboard fsck\"\n"
    } else {
        "HOOKS=\"systemd modconf block filesystems fsck\"\n"
    }
}

struct Pacman<'a> {
    conf: &'a Path,
    root: &'a Path,
}

impl Pacman<'_> {
    fn pacman(&self, args: &[&str]) -> Result<String> {
        let result = Cmd::new("pacman")
            .args(["--noconfirm", "--color", "never", "--config"])
            .arg_path(self.conf)
            .args(args)
            .error_msg("pacman failed")
            .run()?;
        Ok(result.stdout)
    }

    fn pacman_key(&self, args: &[&str]) -> Result<()> {
        Cmd::new("pacman-key")
            .args(["--nocolor", "--config"])
            .arg_path(self.conf)
            .args(args)
            .visible()
            .error_msg("pacman-key failed")
            .run()?;
        Ok(())
    }

    fn pacstrap(&self, packages: &BTreeSet<String>) -> Result<()> {
        Cmd::new("pacstrap")
            .arg("-C")
            .arg_path(self.conf)
            .arg("-dGM")
            .arg_path(self.root)
            .args(packages)
            .visible()
            .error_msg("pacstrap failed")
            .run()?;
        Ok(())
    }
}

pub struct Arch;

impl Installer for Arch {
    fn package_cache_paths(&self) -> &'static [&'static str] {
        &["var/cache/pacman/pkg"]
    }

    fn default_release(&self) -> Option<&'static str> {
        None
    }

    fn default_mirror(&self, arch: &str) -> Option<&'static str> {
        if arch == "aarch64" {
            Some("http://mirror.archlinuxarm.org")
        } else {
            Some("https://mirrors.kernel.org/archlinux")
        }
    }

    fn install(&self, ctx: &mut BuildContext, workspace: &Workspace, run_build_script: bool) -> Result<()> {
        let step = Step::start("Installing Arch Linux");
        let config = &ctx.config;
        if config.release.is_some() {
            warn!("Distribution release specification is not supported for Arch Linux, ignoring.");
        }

        let root = workspace.root();
        fs::create_dir_all(root.join("var/lib/pacman"))?;
        fs::create_dir_all(root.join("etc/pacman.d/gnupg"))?;

        let server = server_line(config.mirror.as_deref().unwrap_or_default(), &config.architecture);
        let conf = workspace.path().join("pacman.conf");
        write_file_with_dirs(&conf, pacman_conf(&root, &server))?;
        let pacman = Pacman { conf: &conf, root: &root };

        let keyring = if config.architecture == "aarch64" {
            "archlinuxarm"
        } else {
            "archlinux"
        };
        pacman.pacman_key(&["--init"])?;
        pacman.pacman_key(&["--populate", keyring])?;

        pacman.pacman(&["-Sy"])?;
        let base_group = pacman.pacman(&["-Sqg", "base"])?;
        pacman.pacstrap(&base_packages(config, &base_group))?;

        let installed = pacman.pacman(&["-Qq"])?;
        let extra = user_packages(config, run_build_script, &installed);
        if !extra.is_empty() {
            pacman.pacstrap(&extra)?;
        }

        Cmd::new("gpg-connect-agent")
            .arg("--homedir")
            .arg_path(&root.join("etc/pacman.d/gnupg"))
            .args(["KILLAGENT", "/bye"])
            .allow_fail()
            .run()?;

        if config.packages.iter().any(|p| p == "networkmanager") {
            enable_networkmanager(&root)?;
        } else {
            enable_networkd(&root)?;
        }

        write_file_with_dirs(root.join("etc/locale.gen"), "en_US.UTF-8 UTF-8\n")?;
        run_workspace_command(ctx, workspace, &["/usr/bin/locale-gen"], false)?;
        write_file_with_dirs(root.join("etc/locale.conf"), "LANG=en_US.UTF-8\n")?;

        // Nothing started by package scripts may outlive the install.
        Cmd::new("fuser")
            .arg("-c")
            .arg_path(&root)
            .arg("--kill")
            .quiet()
            .allow_fail()
            .run()?;

        step.finish();
        Ok(())
    }

    fn install_boot_loader(&self, ctx: &BuildContext, workspace: &Workspace, _: Option<&Path>) -> Result<()> {
        let root = workspace.root();
        let hooks = mkinitcpio_hooks(ctx.config.encrypt);
        patch_file(&root.join("etc/mkinitcpio.conf"), |line| {
            if line.starts_with("HOOKS=") {
                hooks.to_string()
            } else {
                line.to_string()
            }
        })?;

        let version = kernel_version(&root)?;
        kernel_install_add(ctx, workspace, &find_kernel_file(&root)?, &version)
    }
}
