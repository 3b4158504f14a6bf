//! Fedora, CentOS and Mageia: dnf or yum against an `--installroot`.

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::{repositories_or, Installer};
use crate::common::{mkdir_last, symlink_f, write_file_with_dirs, Workspace};
use crate::config::{BuildConfig, OutputFormat};
use crate::context::BuildContext;
use crate::error::MkosiError;
use crate::filesystem::ApiVfs;
use crate::process::{self, Cmd};
use crate::ui::Step;

const RPM_CACHE_PATHS: &[&str] = &["var/cache/dnf"];

/// kernel-install plugins masked while packages are installed. The unified
/// kernel image is assembled separately.
const KERNEL_INSTALL_PLUGINS: &[&str] = &[
    "50-dracut.install",
    "51-dracut-rescue.install",
    "90-loaderentry.install",
];

/// Release to signing key id, for keys fetched from getfedora.org.
const FEDORA_KEYS: &[(&str, &str)] = &[
    ("23", "34EC9CBA"),
    ("24", "81B46521"),
    ("25", "FDB19C98"),
    ("26", "64DAB85D"),
    ("27", "F5282EE4"),
    ("28", "9DB62FB1"),
    ("29", "429476B4"),
    ("30", "CFC659B9"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frontend {
    Dnf,
    Yum,
}

/// Everything a dnf/yum transaction needs besides the config file.
struct Transaction<'a> {
    frontend: Frontend,
    config_file: &'a Path,
    release: &'a str,
    root: &'a Path,
    repositories: &'a [String],
    base_packages: &'a [&'a str],
    boot_packages: &'a [&'a str],
}

impl Transaction<'_> {
    fn args(&self, config: &BuildConfig, run_build_script: bool) -> Vec<String> {
        let dnf = self.frontend == Frontend::Dnf;
        let mut args = vec!["-y".to_string(), format!("--config={}", self.config_file.display())];
        if dnf {
            args.push("--best".to_string());
            args.push("--allowerasing".to_string());
        }
        args.push(format!("--releasever={}", self.release));
        args.push(format!("--installroot={}", self.root.display()));
        args.push("--disablerepo=*".to_string());
        args.extend(self.repositories.iter().map(|r| format!("--enablerepo={}", r)));
        args.push("--setopt=keepcache=1".to_string());
        if dnf {
            args.push("--setopt=install_weak_deps=0".to_string());
        }
        if !config.with_docs && !run_build_script {
            args.push("--setopt=tsflags=nodocs".to_string());
        }

        args.push("install".to_string());
        args.extend(self.base_packages.iter().map(|p| p.to_string()));
        args.extend(config.packages.iter().cloned());
        if run_build_script {
            args.extend(config.build_packages.iter().cloned());
        }

        if config.bootable {
            args.extend(self.boot_packages.iter().map(|p| p.to_string()));
            if config.encrypt.is_some() || config.verity {
                args.push("cryptsetup".to_string());
            }
            match config.format {
                OutputFormat::RawExt4 => args.push("e2fsprogs".to_string()),
                OutputFormat::RawXfs if dnf => args.push("xfsprogs".to_string()),
                OutputFormat::RawBtrfs => args.push("btrfs-progs".to_string()),
                _ => {}
            }
        }
        args
    }

    fn run(&self, ctx: &BuildContext, run_build_script: bool) -> Result<()> {
        let program = match self.frontend {
            Frontend::Dnf => "dnf",
            Frontend::Yum => "yum",
        };
        let _vfs = ApiVfs::mount(self.root)?;
        Cmd::new(program)
            .args(self.args(&ctx.config, run_build_script))
            .visible()
            .error_msg(format!("{} failed", program))
            .run()?;
        Ok(())
    }
}

/// Mask the kernel-install plugins so installing a kernel does not try to
/// build an initrd or loader entry.
fn disable_kernel_install(ctx: &BuildContext, root: &Path) -> Result<()> {
    if !ctx.config.bootable {
        return Ok(());
    }
    for dir in ["etc", "etc/kernel", "etc/kernel/install.d"] {
        mkdir_last(&root.join(dir), 0o755)?;
    }
    for plugin in KERNEL_INSTALL_PLUGINS {
        symlink_f("/dev/null", &root.join("etc/kernel/install.d").join(plugin))?;
    }
    Ok(())
}

fn reenable_kernel_install(ctx: &BuildContext, root: &Path) -> Result<()> {
    if !ctx.config.bootable {
        return Ok(());
    }
    for plugin in KERNEL_INSTALL_PLUGINS {
        let path = root.join("etc/kernel/install.d").join(plugin);
        if fs::symlink_metadata(&path).is_ok() {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Whether `url` answers a HEAD request.
fn url_exists(url: &str) -> bool {
    Cmd::new("curl")
        .args(["--head", "--silent", "--fail", "--location", url])
        .quiet()
        .allow_fail()
        .run()
        .map(|r| r.success())
        .unwrap_or(false)
}

/// `rawhide` maps to the newest known release, `rawhide-N` pins it.
/// Returns the release to pass to dnf and the version used for keys.
fn fedora_release(release: &str) -> (String, String) {
    if release == "rawhide" {
        let latest = FEDORA_KEYS.last().map(|(r, _)| *r).unwrap_or("30");
        warn!(
            "Assuming rawhide is version {} -- You may specify otherwise with --release=rawhide-<version>",
            latest
        );
        ("rawhide".to_string(), latest.to_string())
    } else if let Some(version) = release.strip_prefix("rawhide-") {
        ("rawhide".to_string(), version.to_string())
    } else {
        (release.to_string(), release.to_string())
    }
}

fn fedora_gpg_key(releasever: &str) -> Result<String> {
    let local = format!("/etc/pki/rpm-gpg/RPM-GPG-KEY-fedora-{}-x86_64", releasever);
    if Path::new(&local).exists() {
        return Ok(format!("file://{}", local));
    }
    FEDORA_KEYS
        .iter()
        .find(|(r, _)| *r == releasever)
        .map(|(_, key)| format!("https://getfedora.org/static/{}.txt", key))
        .ok_or_else(|| {
            MkosiError::config(format!("No signing key known for Fedora {}", releasever)).into()
        })
}

/// `[section]` blocks of a dnf/yum config, preceded by `[main]`.
fn repo_config(sections: &[(&str, String, String)], gpgkey: &str) -> String {
    let mut out = String::from("[main]\ngpgcheck=1\n");
    for (id, name, source) in sections {
        out.push_str(&format!(
            "\n[{}]\nname={}\n{}\ngpgkey={}\n",
            id, name, source, gpgkey
        ));
    }
    out
}

fn fedora_sources(mirror: Option<&str>, release: &str) -> (String, String) {
    match mirror {
        Some(mirror) => {
            let mut baseurl = format!("{}/releases/{}/Everything/x86_64/os/", mirror, release);
            if !url_exists(&format!("{}media.repo", baseurl)) {
                baseurl = format!("{}/development/{}/Everything/x86_64/os/", mirror, release);
            }
            (
                format!("baseurl={}", baseurl),
                format!("baseurl={}/updates/{}/x86_64/", mirror, release),
            )
        }
        None => (
            format!(
                "metalink=https://mirrors.fedoraproject.org/metalink?repo=fedora-{}&arch=x86_64",
                release
            ),
            format!(
                "metalink=https://mirrors.fedoraproject.org/metalink?repo=updates-released-f{}&arch=x86_64",
                release
            ),
        ),
    }
}

fn mageia_sources(mirror: Option<&str>, release: &str) -> (String, String) {
    match mirror {
        Some(mirror) => {
            let base = format!("{}/distrib/{}/x86_64/media/core/", mirror, release);
            (format!("baseurl={}/release/", base), format!("baseurl={}/updates/", base))
        }
        None => {
            let base = format!(
                "mirrorlist=https://www.mageia.org/mirrorlist/?release={}&arch=x86_64&section=core",
                release
            );
            (format!("{}&repo=release", base), format!("{}&repo=updates", base))
        }
    }
}

fn centos_sources(mirror: Option<&str>, release: &str) -> (String, String) {
    match mirror {
        Some(mirror) => (
            format!("baseurl={}/centos/{}/os/x86_64", mirror, release),
            format!("baseurl={}/centos/{}/updates/x86_64/", mirror, release),
        ),
        None => (
            format!(
                "mirrorlist=http://mirrorlist.centos.org/?release={}&arch=x86_64&repo=os",
                release
            ),
            format!(
                "mirrorlist=http://mirrorlist.centos.org/?release={}&arch=x86_64&repo=updates",
                release
            ),
        ),
    }
}

fn release_of(ctx: &BuildContext) -> &str {
    ctx.config.release.as_deref().unwrap_or_default()
}

fn write_workspace_config(workspace: &Workspace, name: &str, content: &str) -> Result<PathBuf> {
    let path = workspace.path().join(name);
    write_file_with_dirs(&path, content)?;
    Ok(path)
}

pub struct Fedora;

impl Installer for Fedora {
    fn package_cache_paths(&self) -> &'static [&'static str] {
        RPM_CACHE_PATHS
    }

    fn default_release(&self) -> Option<&'static str> {
        Some("29")
    }

    fn default_mirror(&self, _arch: &str) -> Option<&'static str> {
        None
    }

    fn install(&self, ctx: &mut BuildContext, workspace: &Workspace, run_build_script: bool) -> Result<()> {
        let (release, releasever) = fedora_release(release_of(ctx));
        let step = Step::start(&format!("Installing Fedora Linux {}", release));
        let root = workspace.root();
        disable_kernel_install(ctx, &root)?;

        let gpgkey = fedora_gpg_key(&releasever)?;
        let (release_source, updates_source) = fedora_sources(ctx.config.mirror.as_deref(), &release);
        let conf = write_workspace_config(
            workspace,
            "dnf.conf",
            &repo_config(
                &[
                    ("fedora", format!("Fedora {} - base", release), release_source),
                    ("updates", format!("Fedora {} - updates", release), updates_source),
                ],
                &gpgkey,
            ),
        )?;

        let repositories = repositories_or(ctx, &["fedora", "updates"]);
        Transaction {
            frontend: Frontend::Dnf,
            config_file: &conf,
            release: &release,
            root: &root,
            repositories: &repositories,
            base_packages: &["systemd", "fedora-release", "passwd", "glibc-minimal-langpack"],
            boot_packages: &["kernel-core", "systemd-udev", "binutils"],
        }
        .run(ctx, run_build_script)?;

        write_file_with_dirs(root.join("etc/locale.conf"), "LANG=C.UTF-8\n")?;
        reenable_kernel_install(ctx, &root)?;
        step.finish();
        Ok(())
    }

    fn install_boot_loader(&self, _: &BuildContext, _: &Workspace, _: Option<&Path>) -> Result<()> {
        Ok(())
    }
}

pub struct Mageia;

impl Installer for Mageia {
    fn package_cache_paths(&self) -> &'static [&'static str] {
        RPM_CACHE_PATHS
    }

    fn default_release(&self) -> Option<&'static str> {
        Some("6")
    }

    fn default_mirror(&self, _arch: &str) -> Option<&'static str> {
        None
    }

    fn install(&self, ctx: &mut BuildContext, workspace: &Workspace, run_build_script: bool) -> Result<()> {
        let release = release_of(ctx).to_string();
        let step = Step::start(&format!("Installing Mageia {}", release));
        let root = workspace.root();
        disable_kernel_install(ctx, &root)?;

        let local_key = "/etc/pki/rpm-gpg/RPM-GPG-KEY-Mageia";
        let gpgkey = if Path::new(local_key).exists() {
            format!("file://{}", local_key)
        } else {
            String::new()
        };
        let (release_source, updates_source) = mageia_sources(ctx.config.mirror.as_deref(), &release);
        let conf = write_workspace_config(
            workspace,
            "dnf.conf",
            &repo_config(
                &[
                    ("mageia", format!("Mageia {} Core Release", release), release_source),
                    ("updates", format!("Mageia {} Core Updates", release), updates_source),
                ],
                &gpgkey,
            ),
        )?;

        let repositories = repositories_or(ctx, &["mageia", "updates"]);
        Transaction {
            frontend: Frontend::Dnf,
            config_file: &conf,
            release: &release,
            root: &root,
            repositories: &repositories,
            base_packages: &["basesystem-minimal"],
            boot_packages: &["kernel-server-latest", "binutils"],
        }
        .run(ctx, run_build_script)?;

        reenable_kernel_install(ctx, &root)?;
        step.finish();
        Ok(())
    }

    fn install_boot_loader(&self, _: &BuildContext, _: &Workspace, _: Option<&Path>) -> Result<()> {
        Ok(())
    }
}

pub struct CentOs;

impl Installer for CentOs {
    fn package_cache_paths(&self) -> &'static [&'static str] {
        &["var/cache/yum", "var/cache/dnf"]
    }

    fn default_release(&self) -> Option<&'static str> {
        Some("7")
    }

    fn default_mirror(&self, _arch: &str) -> Option<&'static str> {
        None
    }

    fn install(&self, ctx: &mut BuildContext, workspace: &Workspace, run_build_script: bool) -> Result<()> {
        let release = release_of(ctx).to_string();
        let step = Step::start(&format!("Installing CentOS {}", release));
        let root = workspace.root();
        disable_kernel_install(ctx, &root)?;

        let local_key = format!("/etc/pki/rpm-gpg/RPM-GPG-KEY-CentOS-{}", release);
        let gpgkey = if Path::new(&local_key).exists() {
            format!("file://{}", local_key)
        } else {
            format!("https://www.centos.org/keys/RPM-GPG-KEY-CentOS-{}", release)
        };
        let (release_source, updates_source) = centos_sources(ctx.config.mirror.as_deref(), &release);
        let conf = write_workspace_config(
            workspace,
            "yum.conf",
            &repo_config(
                &[
                    ("base", format!("CentOS-{} - Base", release), release_source),
                    ("updates", format!("CentOS-{} - Updates", release), updates_source),
                ],
                &gpgkey,
            ),
        )?;

        let frontend = if process::exists("dnf") {
            Frontend::Dnf
        } else {
            Frontend::Yum
        };
        let repositories = repositories_or(ctx, &["base", "updates"]);
        Transaction {
            frontend,
            config_file: &conf,
            release: &release,
            root: &root,
            repositories: &repositories,
            base_packages: &["systemd", "centos-release", "passwd"],
            boot_packages: &["kernel", "systemd-udev", "binutils"],
        }
        .run(ctx, run_build_script)?;

        reenable_kernel_install(ctx, &root)?;
        step.finish();
        Ok(())
    }

    fn install_boot_loader(&self, _: &BuildContext, _: &Workspace, _: Option<&Path>) -> Result<()> {
        Ok(())
    }
}
