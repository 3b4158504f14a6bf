//! Debian and Ubuntu: debootstrap a minbase, then apt-get inside the tree.

use anyhow::Result;
use std::fs;
use std::path::Path;

use super::{kernel_install_add, kernel_version, Installer};
use crate::common::{write_file_mode, write_file_with_dirs, Workspace};
use crate::config::{BuildConfig, Distribution, OutputFormat};
use crate::context::BuildContext;
use crate::nspawn::WorkspaceCommand;
use crate::process::Cmd;
use crate::ui::Step;

const APT_CACHE_PATHS: &[&str] = &["var/cache/apt/archives"];

const DOC_PATHS: &[&str] = &[
    "/usr/share/locale",
    "/usr/share/doc",
    "/usr/share/man",
    "/usr/share/groff",
    "/usr/share/info",
    "/usr/share/lintian",
    "/usr/share/linda",
];

const NO_DRACUT_10_DEBIAN: &str = "\
# Work around \"Failed to find module 'crc32c'\" dracut issue
# See also:
# - https://github.com/antonio-petricca/buddy-linux/issues/2#issuecomment-404505527
# - https://bugs.launchpad.net/ubuntu/+source/dracut/+bug/1781143
path-exclude /etc/dracut.conf.d/10-debian.conf
";

/// Components passed to debootstrap. Ubuntu ships dracut in universe.
fn components(config: &BuildConfig) -> Vec<String> {
    let mut repos = if config.repositories.is_empty() {
        vec!["main".to_string()]
    } else {
        config.repositories.clone()
    };
    if config.distribution == Distribution::Ubuntu
        && config.bootable
        && !repos.iter().any(|r| r == "universe")
    {
        repos.push("universe".to_string());
    }
    repos
}

fn debootstrap_args(config: &BuildConfig, root: &Path) -> Vec<String> {
    let mut include = "--include=systemd-sysv".to_string();
    if config.bootable && config.format == OutputFormat::RawBtrfs {
        include.push_str(",btrfs-tools");
    }
    vec![
        "--verbose".to_string(),
        "--merged-usr".to_string(),
        "--variant=minbase".to_string(),
        include,
        "--exclude=sysv-rc,initscripts,startpar,lsb-base,insserv".to_string(),
        format!("--components={}", components(config).join(",")),
        config.release.clone().unwrap_or_default(),
        root.display().to_string(),
        config.mirror.clone().unwrap_or_default(),
    ]
}

/// Packages installed by apt after debootstrap, which resolves
/// alternative dependencies better.
fn extra_packages(config: &BuildConfig, run_build_script: bool) -> Vec<String> {
    let mut packages = vec!["dbus".to_string(), "libpam-systemd".to_string()];
    packages.extend(config.packages.iter().cloned());
    if run_build_script {
        packages.extend(config.build_packages.iter().cloned());
    }
    if config.bootable {
        packages.push("dracut".to_string());
        packages.push(match config.distribution {
            Distribution::Ubuntu => "linux-generic".to_string(),
            _ => "linux-image-amd64".to_string(),
        });
    }
    packages
}

fn nodoc_config() -> String {
    DOC_PATHS.iter().map(|d| format!("path-exclude {}/*\n", d)).collect()
}

fn install_debian_or_ubuntu(ctx: &BuildContext, workspace: &Workspace, run_build_script: bool) -> Result<()> {
    let config = &ctx.config;
    let root = workspace.root();

    Cmd::new("debootstrap")
        .args(debootstrap_args(config, &root))
        .visible()
        .error_msg("debootstrap failed")
        .run()?;

    write_file_with_dirs(root.join("etc/dracut.conf.d/99-generic.conf"), "hostonly=no")?;

    // Deny every daemon start requested by maintainer scripts.
    let policy_rc_d = root.join("usr/sbin/policy-rc.d");
    write_file_mode(&policy_rc_d, "#!/bin/sh\nexit 101", 0o755)?;

    write_file_with_dirs(
        root.join("etc/dpkg/dpkg.cfg.d/01_no_dracut_10-debian"),
        NO_DRACUT_10_DEBIAN,
    )?;

    if !config.with_docs {
        let mut rm = vec!["/bin/rm", "-rf"];
        rm.extend_from_slice(DOC_PATHS);
        WorkspaceCommand::new(ctx, workspace)?.run(&rm)?;
        write_file_with_dirs(root.join("etc/dpkg/dpkg.cfg.d/01_nodoc"), nodoc_config())?;
    }

    let mut apt = vec![
        "/usr/bin/apt-get".to_string(),
        "--assume-yes".to_string(),
        "--no-install-recommends".to_string(),
        "install".to_string(),
    ];
    apt.extend(extra_packages(config, run_build_script));
    WorkspaceCommand::new(ctx, workspace)?
        .network(true)
        .env("DEBIAN_FRONTEND", "noninteractive")
        .env("DEBCONF_NONINTERACTIVE_SEEN", "true")
        .run(&apt)?;

    fs::remove_file(&policy_rc_d)?;
    Ok(())
}

fn install_kernel(ctx: &BuildContext, workspace: &Workspace) -> Result<()> {
    let version = kernel_version(&workspace.root())?;
    let kernel = Path::new("/boot").join(format!("vmlinuz-{}", version));
    kernel_install_add(ctx, workspace, &kernel, &version)
}

pub struct Debian;

impl Installer for Debian {
    fn package_cache_paths(&self) -> &'static [&'static str] {
        APT_CACHE_PATHS
    }

    fn default_release(&self) -> Option<&'static str> {
        Some("unstable")
    }

    fn default_mirror(&self, _arch: &str) -> Option<&'static str> {
        Some("http://deb.debian.org/debian")
    }

    fn install(&self, ctx: &mut BuildContext, workspace: &Workspace, run_build_script: bool) -> Result<()> {
        let step = Step::start("Installing Debian");
        install_debian_or_ubuntu(ctx, workspace, run_build_script)?;
        step.finish();
        Ok(())
    }

    fn install_boot_loader(&self, ctx: &BuildContext, workspace: &Workspace, _: Option<&Path>) -> Result<()> {
        install_kernel(ctx, workspace)
    }
}

pub struct Ubuntu;

impl Installer for Ubuntu {
    fn package_cache_paths(&self) -> &'static [&'static str] {
        APT_CACHE_PATHS
    }

    fn default_release(&self) -> Option<&'static str> {
        Some("artful")
    }

    fn default_mirror(&self, arch: &str) -> Option<&'static str> {
        if arch == "aarch64" {
            Some("http://ports.ubuntu.com/")
        } else {
            Some("http://archive.ubuntu.com/ubuntu")
        }
    }

    fn install(&self, ctx: &mut BuildContext, workspace: &Workspace, run_build_script: bool) -> Result<()> {
        let step = Step::start("Installing Ubuntu");
        install_debian_or_ubuntu(ctx, workspace, run_build_script)?;
        step.finish();
        Ok(())
    }

    fn install_boot_loader(&self, ctx: &BuildContext, workspace: &Workspace, _: Option<&Path>) -> Result<()> {
        install_kernel(ctx, workspace)
    }
}
