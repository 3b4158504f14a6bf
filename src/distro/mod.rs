//! Distribution installers.
//!
//! Each supported distribution implements [`Installer`]; [`installer`] is
//! the registry mapping a [`Distribution`] to its implementation.

mod arch;
mod clear;
mod debian;
mod opensuse;
mod rpm;

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::common::{symlink_f, write_file_with_dirs, Workspace};
use crate::config::Distribution;
use crate::context::BuildContext;
use crate::nspawn::run_workspace_command;
use crate::process::Cmd;

pub use arch::Arch;
pub use clear::Clear;
pub use debian::{Debian, Ubuntu};
pub use opensuse::OpenSuse;
pub use rpm::{CentOs, Fedora, Mageia};

/// How one distribution gets its packages into `<workspace>/root`.
pub trait Installer: Sync {
    /// Package manager cache directories, relative to the image root.
    fn package_cache_paths(&self) -> &'static [&'static str];

    fn default_release(&self) -> Option<&'static str>;

    fn default_mirror(&self, arch: &str) -> Option<&'static str>;

    /// Populate the image tree. May adjust the root password action when
    /// the distribution seeds account files itself.
    fn install(&self, ctx: &mut BuildContext, workspace: &Workspace, run_build_script: bool) -> Result<()>;

    /// Distribution specific boot loader setup, after systemd-boot has been
    /// copied into the ESP.
    fn install_boot_loader(
        &self,
        ctx: &BuildContext,
        workspace: &Workspace,
        loopdev: Option<&Path>,
    ) -> Result<()>;
}

static ARCH: Arch = Arch;
static CENTOS: CentOs = CentOs;
static CLEAR: Clear = Clear;
static DEBIAN: Debian = Debian;
static FEDORA: Fedora = Fedora;
static MAGEIA: Mageia = Mageia;
static OPENSUSE: OpenSuse = OpenSuse;
static UBUNTU: Ubuntu = Ubuntu;

/// The installer registered for `distribution`.
pub fn installer(distribution: Distribution) -> &'static dyn Installer {
    match distribution {
        Distribution::Arch => &ARCH,
        Distribution::Centos => &CENTOS,
        Distribution::Clear => &CLEAR,
        Distribution::Debian => &DEBIAN,
        Distribution::Fedora => &FEDORA,
        Distribution::Mageia => &MAGEIA,
        Distribution::Opensuse => &OPENSUSE,
        Distribution::Ubuntu => &UBUNTU,
    }
}

/// First entry of `lib/modules` that looks like a kernel version.
pub fn kernel_version(root: &Path) -> Result<String> {
    let modules = root.join("lib/modules");
    let mut versions: Vec<String> = fs::read_dir(&modules)
        .with_context(|| format!("Failed to list {}", modules.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(|c: char| c.is_ascii_digit()))
        .collect();
    versions.sort();
    versions
        .into_iter()
        .next()
        .with_context(|| format!("No kernel found in {}", modules.display()))
}

/// First match of `/boot/vmlinuz-*` in the image, as a path inside it.
pub fn find_kernel_file(root: &Path) -> Result<PathBuf> {
    let boot = root.join("boot");
    let mut kernels: Vec<String> = fs::read_dir(&boot)
        .with_context(|| format!("Failed to list {}", boot.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("vmlinuz-"))
        .collect();
    kernels.sort();

    let first = kernels
        .first()
        .with_context(|| format!("No kernel image found in {}", boot.display()))?;
    let kernel = Path::new("/boot").join(first);
    if kernels.len() > 1 {
        warn!("More than one kernel file found, will use {}", kernel.display());
    }
    Ok(kernel)
}

/// Register the installed kernel through `kernel-install` inside the image.
pub fn kernel_install_add(ctx: &BuildContext, workspace: &Workspace, kernel: &Path, version: &str) -> Result<()> {
    let kernel = kernel.to_string_lossy();
    run_workspace_command(
        ctx,
        workspace,
        &["/usr/bin/kernel-install", "add", version, kernel.as_ref()],
        false,
    )
}

/// Enable systemd-networkd and resolved with DHCP on every ethernet link.
pub fn enable_networkd(root: &Path) -> Result<()> {
    Cmd::new("systemctl")
        .arg("--root")
        .arg_path(root)
        .args(["enable", "systemd-networkd", "systemd-resolved"])
        .error_msg("Enabling systemd-networkd failed")
        .run()?;

    symlink_f("../run/systemd/resolve/stub-resolv.conf", &root.join("etc/resolv.conf"))?;
    write_file_with_dirs(
        root.join("etc/systemd/network/all-ethernet.network"),
        "[Match]\nType=ether\n\n[Network]\nDHCP=yes\n",
    )?;
    Ok(())
}

pub fn enable_networkmanager(root: &Path) -> Result<()> {
    Cmd::new("systemctl")
        .arg("--root")
        .arg_path(root)
        .args(["enable", "NetworkManager"])
        .error_msg("Enabling NetworkManager failed")
        .run()?;
    Ok(())
}

/// `repositories` when configured, `defaults` otherwise.
pub fn repositories_or(ctx: &BuildContext, defaults: &[&str]) -> Vec<String> {
    if ctx.config.repositories.is_empty() {
        defaults.iter().map(|s| s.to_string()).collect()
    } else {
        ctx.config.repositories.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_registry_defaults() {
        assert_eq!(installer(Distribution::Fedora).default_release(), Some("29"));
        assert_eq!(installer(Distribution::Centos).default_release(), Some("7"));
        assert_eq!(installer(Distribution::Mageia).default_release(), Some("6"));
        assert_eq!(installer(Distribution::Debian).default_release(), Some("unstable"));
        assert_eq!(installer(Distribution::Ubuntu).default_release(), Some("artful"));
        assert_eq!(installer(Distribution::Opensuse).default_release(), Some("tumbleweed"));
        assert_eq!(installer(Distribution::Clear).default_release(), Some("latest"));
        assert_eq!(installer(Distribution::Arch).default_release(), None);
    }

    #[test]
    fn test_registry_mirrors() {
        assert_eq!(
            installer(Distribution::Debian).default_mirror("x86_64"),
            Some("http://deb.debian.org/debian")
        );
        assert_eq!(
            installer(Distribution::Ubuntu).default_mirror("aarch64"),
            Some("http://ports.ubuntu.com/")
        );
        assert_eq!(
            installer(Distribution::Arch).default_mirror("x86_64"),
            Some("https://mirrors.kernel.org/archlinux")
        );
        assert_eq!(installer(Distribution::Fedora).default_mirror("x86_64"), None);
    }

    #[test]
    fn test_package_cache_paths() {
        assert_eq!(
            installer(Distribution::Centos).package_cache_paths(),
            &["var/cache/yum", "var/cache/dnf"]
        );
        assert_eq!(
            installer(Distribution::Opensuse).package_cache_paths(),
            &["var/cache/zypp/packages"]
        );
        for d in Distribution::ALL {
            assert!(!installer(d).package_cache_paths().is_empty() || d == Distribution::Clear);
        }
    }

    #[test]
    fn test_kernel_version_and_file() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("lib/modules/extramodules")).unwrap();
        fs::create_dir_all(root.join("lib/modules/4.19.1-arch1")).unwrap();
        fs::create_dir_all(root.join("boot")).unwrap();
        fs::write(root.join("boot/vmlinuz-linux"), "").unwrap();

        assert_eq!(kernel_version(root).unwrap(), "4.19.1-arch1");
        assert_eq!(find_kernel_file(root).unwrap(), PathBuf::from("/boot/vmlinuz-linux"));
    }
}
