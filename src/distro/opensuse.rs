//! openSUSE: zypper against `--root`.

use anyhow::Result;
use std::path::Path;

use super::{kernel_install_add, kernel_version, Installer};
use crate::common::{write_file_with_dirs, Workspace};
use crate::config::{BuildConfig, OutputFormat};
use crate::context::BuildContext;
use crate::process::Cmd;
use crate::ui::Step;

/// Main and update repository URLs. Digit-only releases are Tumbleweed
/// snapshots, `13.x` is the old numbering, anything else is Leap.
fn repository_urls(mirror: &str, release: &str) -> (String, String) {
    let release = release.trim_matches('"');
    if release == "tumbleweed" || (!release.is_empty() && release.chars().all(|c| c.is_ascii_digit())) {
        (
            format!("{}/tumbleweed/repo/oss/", mirror),
            format!("{}/update/tumbleweed/", mirror),
        )
    } else if release.starts_with("13.") {
        (
            format!("{}/distribution/{}/repo/oss/", mirror, release),
            format!("{}/update/{}/", mirror, release),
        )
    } else {
        (
            format!("{}/distribution/leap/{}/repo/oss/", mirror, release),
            format!("{}/update/leap/{}/oss/", mirror, release),
        )
    }
}

fn extra_packages(config: &BuildConfig, run_build_script: bool) -> Vec<String> {
    let mut packages = Vec::new();
    if config.bootable {
        packages.push("kernel-default".to_string());
    }
    if config.encrypt.is_some() {
        packages.push("device-mapper".to_string());
    }
    if matches!(config.format, OutputFormat::Subvolume | OutputFormat::RawBtrfs) {
        packages.push("btrfsprogs".to_string());
    }
    packages.extend(config.packages.iter().cloned());
    if run_build_script {
        packages.extend(config.build_packages.iter().cloned());
    }
    packages
}

fn zypper(root: &Path) -> Cmd {
    Cmd::new("zypper").arg("--root").arg_path(root)
}

fn zypper_install(root: &Path, packages: &[String]) -> Result<()> {
    zypper(root)
        .args(["--gpg-auto-import-keys", "install", "-y", "--no-recommends"])
        .args(packages)
        .visible()
        .error_msg("zypper install failed")
        .run()?;
    Ok(())
}

pub struct OpenSuse;

impl Installer for OpenSuse {
    fn package_cache_paths(&self) -> &'static [&'static str] {
        &["var/cache/zypp/packages"]
    }

    fn default_release(&self) -> Option<&'static str> {
        Some("tumbleweed")
    }

    fn default_mirror(&self, _arch: &str) -> Option<&'static str> {
        Some("http://download.opensuse.org")
    }

    fn install(&self, ctx: &mut BuildContext, workspace: &Workspace, run_build_script: bool) -> Result<()> {
        let step = Step::start("Installing openSUSE");
        let config = &ctx.config;
        let root = workspace.root();
        let (release_url, updates_url) = repository_urls(
            config.mirror.as_deref().unwrap_or_default(),
            config.release.as_deref().unwrap_or_default(),
        );

        // Caching stays on during the install so the package cache fills up.
        for (url, name) in [(&release_url, "Main"), (&updates_url, "Updates")] {
            zypper(&root)
                .args(["addrepo", "-ck", url.as_str(), name])
                .error_msg("zypper addrepo failed")
                .run()?;
        }

        if !config.with_docs {
            write_file_with_dirs(root.join("etc/zypp/zypp.conf"), "rpm.install.excludedocs = yes\n")?;
        }

        zypper_install(&root, &["patterns-base-minimal_base".to_string()])?;
        let extra = extra_packages(config, run_build_script);
        if !extra.is_empty() {
            zypper_install(&root, &extra)?;
        }

        for name in ["Main", "Updates"] {
            zypper(&root)
                .args(["modifyrepo", "-K", name])
                .error_msg("zypper modifyrepo failed")
                .run()?;
        }

        if config.bootable {
            write_file_with_dirs(root.join("etc/dracut.conf.d/99-mkosi.conf"), "hostonly=no\n")?;
            // This dracut cannot find the root partition through gpt-auto by itself.
            write_file_with_dirs(
                root.join("etc/kernel/cmdline"),
                format!(
                    "{} root=/dev/gpt-auto-root\n",
                    config.kernel_command_line.as_deref().unwrap_or_default()
                ),
            )?;
        }

        step.finish();
        Ok(())
    }

    fn install_boot_loader(&self, ctx: &BuildContext, workspace: &Workspace, _: Option<&Path>) -> Result<()> {
        let root = workspace.root();
        let version = kernel_version(&root)?;
        let kernel = Path::new("/boot").join(format!("vmlinuz-{}", version));
        kernel_install_add(ctx, workspace, &kernel, &version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    #[test]
    fn test_repository_urls() {
        let m = "http://download.opensuse.org";
        assert_eq!(
            repository_urls(m, "tumbleweed"),
            (
                "http://download.opensuse.org/tumbleweed/repo/oss/".to_string(),
                "http://download.opensuse.org/update/tumbleweed/".to_string()
            )
        );
        assert_eq!(repository_urls(m, "20181102").0, "http://download.opensuse.org/tumbleweed/repo/oss/");
        assert_eq!(
            repository_urls(m, "13.2"),
            (
                "http://download.opensuse.org/distribution/13.2/repo/oss/".to_string(),
                "http://download.opensuse.org/update/13.2/".to_string()
            )
        );
        assert_eq!(
            repository_urls(m, "\"15.0\""),
            (
                "http://download.opensuse.org/distribution/leap/15.0/repo/oss/".to_string(),
                "http://download.opensuse.org/update/leap/15.0/oss/".to_string()
            )
        );
    }

    #[test]
    fn test_extra_packages() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path(), |s| {
            s.distribution = Some("opensuse".to_string());
            s.format = Some("raw_btrfs".to_string());
            s.bootable = Some(true);
            s.encrypt = Some("all".to_string());
            s.packages = vec!["vim".to_string()];
            s.build_packages = vec!["gcc".to_string()];
        });
        assert_eq!(
            extra_packages(&config, true),
            ["kernel-default", "device-mapper", "btrfsprogs", "vim", "gcc"]
        );
        assert_eq!(
            extra_packages(&config, false),
            ["kernel-default", "device-mapper", "btrfsprogs", "vim"]
        );
    }
}
