//! Clear Linux: bundles unpacked with swupd-extract.

use anyhow::Result;
use std::path::Path;

use super::Installer;
use crate::common::{symlink_f, write_file_mode, Workspace};
use crate::config::{BuildConfig, RootPassword};
use crate::context::BuildContext;
use crate::error::MkosiError;
use crate::loopdev;
use crate::nspawn::WorkspaceCommand;
use crate::process::{self, Cmd};
use crate::ui::{self, Step};

const SWUPD_EXTRACT_HINT: &str = "Download (or update) it using:

  go get -u github.com/clearlinux/mixer-tools/swupd-extract

and it will be installed by default in ~/go/bin/swupd-extract. Also
ensure that you have openssl program in your system.";

fn release_name(release: &str) -> String {
    if release == "latest" {
        "clear".to_string()
    } else {
        format!("clear/{}", release)
    }
}

fn bundles(config: &BuildConfig, run_build_script: bool) -> Vec<String> {
    let mut bundles = vec!["os-core".to_string()];
    bundles.extend(config.packages.iter().cloned());
    if run_build_script {
        bundles.extend(config.build_packages.iter().cloned());
    }
    if config.bootable {
        bundles.push("kernel-native".to_string());
    }
    bundles
}

/// Device allow-list and mounts clr-boot-manager needs inside the container.
fn boot_manager_params(ctx: &BuildContext, workspace_root: &Path, loopdev: &Path) -> Vec<String> {
    let mut params = vec![
        "--bind-ro=/dev".to_string(),
        format!("--property=DeviceAllow={}", loopdev.display()),
    ];
    for partno in [ctx.partitions.esp, ctx.partitions.root] {
        if let Some(dev) = loopdev::partition(loopdev, partno) {
            params.push(format!("--property=DeviceAllow={}", dev.display()));
        }
    }
    params.push(format!("--bind={}:/boot", workspace_root.join("efi").display()));
    params
}

pub struct Clear;

impl Installer for Clear {
    /// swupd keeps its state in the cache directory itself.
    fn package_cache_paths(&self) -> &'static [&'static str] {
        &[]
    }

    fn default_release(&self) -> Option<&'static str> {
        Some("latest")
    }

    fn default_mirror(&self, _arch: &str) -> Option<&'static str> {
        None
    }

    fn install(&self, ctx: &mut BuildContext, workspace: &Workspace, run_build_script: bool) -> Result<()> {
        let step = Step::start("Installing Clear Linux");
        let root = workspace.root();

        let swupd_extract = process::which("swupd-extract").ok_or_else(|| MkosiError::ToolNotFound {
            tool: "swupd-extract".to_string(),
            hint: SWUPD_EXTRACT_HINT.to_string(),
        })?;
        ui::info(&format!("Using {}", swupd_extract.display()));

        let state = ctx.package_cache.clone().unwrap_or_else(|| workspace.path().join("swupd"));
        Cmd::new(&swupd_extract)
            .arg("-output")
            .arg_path(&root)
            .arg("-state")
            .arg_path(&state)
            .arg(release_name(ctx.config.release.as_deref().unwrap_or("latest")))
            .args(bundles(&ctx.config, run_build_script))
            .visible()
            .error_msg("swupd-extract failed")
            .run()?;

        symlink_f("../run/systemd/resolve/resolv.conf", &root.join("etc/resolv.conf"))?;

        // There is no /etc/shadow until the first login; seed one with an
        // empty root password so it can be set or left empty.
        if !run_build_script && ctx.root_password != RootPassword::Leave {
            write_file_mode(root.join("etc/shadow"), "root::::::::", 0o400)?;
            if ctx.root_password == RootPassword::Delete {
                ctx.root_password = RootPassword::Leave;
            }
        }

        step.finish();
        Ok(())
    }

    fn install_boot_loader(
        &self,
        ctx: &BuildContext,
        workspace: &Workspace,
        loopdev: Option<&Path>,
    ) -> Result<()> {
        let mut cmd = WorkspaceCommand::new(ctx, workspace)?;
        if let Some(loopdev) = loopdev {
            for param in boot_manager_params(ctx, &workspace.root(), loopdev) {
                cmd = cmd.param(param);
            }
        }
        cmd.run(&["/usr/bin/clr-boot-manager", "update", "-i"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    #[test]
    fn test_release_name() {
        assert_eq!(release_name("latest"), "clear");
        assert_eq!(release_name("25930"), "clear/25930");
    }

    #[test]
    fn test_boot_manager_params() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path(), |s| {
            s.distribution = Some("clear".to_string());
            s.bootable = Some(true);
        });
        let mut ctx = BuildContext::new(config, 0o022);
        ctx.partitions.esp = Some(1);
        ctx.partitions.root = Some(2);

        let params = boot_manager_params(&ctx, Path::new("/w/root"), Path::new("/dev/loop7"));
        assert_eq!(
            params,
            [
                "--bind-ro=/dev",
                "--property=DeviceAllow=/dev/loop7",
                "--property=DeviceAllow=/dev/loop7p1",
                "--property=DeviceAllow=/dev/loop7p2",
                "--bind=/w/root/efi:/boot",
            ]
        );
        assert_eq!(
            bundles(&ctx.config, false),
            ["os-core", "kernel-native"]
        );
    }
}
