//! Commands executed inside the image tree with systemd-nspawn.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::common::{mkdir_last, Workspace};
use crate::context::BuildContext;
use crate::process::Cmd;
use crate::ui::Step;

fn machine_name() -> String {
    format!("mkosi-{}", uuid::Uuid::new_v4().simple())
}

fn network_args(network: bool) -> &'static str {
    // With the host network the host resolver has to be visible too.
    if network {
        "--bind-ro=/etc/resolv.conf"
    } else {
        "--private-network"
    }
}

/// A command run in `<workspace>/root` as PID 2 of a throwaway container.
pub struct WorkspaceCommand {
    root: PathBuf,
    var_tmp: PathBuf,
    machine_id: String,
    network: bool,
    env: Vec<(String, String)>,
    params: Vec<String>,
}

impl WorkspaceCommand {
    pub fn new(ctx: &BuildContext, workspace: &Workspace) -> Result<Self> {
        Ok(Self::with_paths(&ctx.machine_id, &workspace.root(), &workspace.var_tmp()?))
    }

    pub fn with_paths(machine_id: &str, root: &Path, var_tmp: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            var_tmp: var_tmp.to_path_buf(),
            machine_id: machine_id.to_string(),
            network: false,
            env: Vec::new(),
            params: Vec::new(),
        }
    }

    /// Share the host network namespace.
    pub fn network(mut self, network: bool) -> Self {
        self.network = network;
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Extra raw nspawn parameter, e.g. `--property=DeviceAllow=...`.
    pub fn param(mut self, param: impl Into<String>) -> Self {
        self.params.push(param.into());
        self
    }

    /// Full argument vector after `systemd-nspawn`.
    pub fn args<S: AsRef<str>>(&self, cmd: &[S]) -> Vec<String> {
        let mut args = vec![
            "--quiet".to_string(),
            format!("--directory={}", self.root.display()),
            format!("--uuid={}", self.machine_id),
            format!("--machine={}", machine_name()),
            "--as-pid2".to_string(),
            "--register=no".to_string(),
            format!("--bind={}:/var/tmp", self.var_tmp.display()),
            "--setenv=SYSTEMD_OFFLINE=1".to_string(),
            network_args(self.network).to_string(),
        ];
        args.extend(self.env.iter().map(|(k, v)| format!("--setenv={}={}", k, v)));
        args.extend(self.params.iter().cloned());
        args.push("--".to_string());
        args.extend(cmd.iter().map(|s| s.as_ref().to_string()));
        args
    }

    pub fn run<S: AsRef<str>>(self, cmd: &[S]) -> Result<()> {
        let program = cmd.first().map(|s| s.as_ref().to_string()).unwrap_or_default();
        Cmd::new("systemd-nspawn")
            .args(self.args(cmd))
            .visible()
            .error_msg(format!("Running '{}' in the image failed", program))
            .run()?;
        Ok(())
    }
}

/// Run `cmd` inside the workspace tree.
pub fn run_workspace_command<S: AsRef<str>>(
    ctx: &BuildContext,
    workspace: &Workspace,
    cmd: &[S],
    network: bool,
) -> Result<()> {
    WorkspaceCommand::new(ctx, workspace)?.network(network).run(cmd)
}

/// What the build script container boots from.
#[derive(Debug, Clone, Copy)]
pub enum BuildTarget<'a> {
    Directory(&'a Path),
    Image(&'a Path),
}

/// Arguments for running the build script of the development image.
pub fn build_script_args(
    ctx: &BuildContext,
    target: BuildTarget<'_>,
    dest: &Path,
    var_tmp: &Path,
) -> Vec<String> {
    let config = &ctx.config;
    let flag = |b: bool| if b { "1" } else { "0" };

    let mut args = vec![
        "--quiet".to_string(),
        match target {
            BuildTarget::Directory(root) => format!("--directory={}", root.display()),
            BuildTarget::Image(image) => format!("--image={}", image.display()),
        },
        format!("--uuid={}", ctx.machine_id),
        format!("--machine={}", machine_name()),
        "--as-pid2".to_string(),
        "--register=no".to_string(),
        "--bind".to_string(),
        format!("{}:/root/dest", dest.display()),
        format!("--bind={}:/var/tmp", var_tmp.display()),
        format!("--setenv=WITH_DOCS={}", flag(config.with_docs)),
        format!("--setenv=WITH_TESTS={}", flag(config.with_tests)),
        "--setenv=DESTDIR=/root/dest".to_string(),
    ];

    if config.build_sources.is_some() {
        args.push("--setenv=SRCDIR=/root/src".to_string());
        args.push("--chdir=/root/src".to_string());
        if config.read_only {
            args.push("--overlay=+/root/src::/root/src".to_string());
        }
    } else {
        args.push("--chdir=/root".to_string());
    }

    if let Some(build_dir) = &config.build_dir {
        args.push("--setenv=BUILDDIR=/root/build".to_string());
        args.push(format!("--bind={}:/root/build", build_dir.display()));
    }

    args.push(network_args(config.with_network).to_string());

    if let Some(script) = &config.build_script {
        let name = script.file_name().unwrap_or_default().to_string_lossy();
        args.push(format!("/root/{}", name));
    }
    args
}

/// Run the build script in the development image, collecting its output
/// in `<workspace>/dest`.
pub fn run_build_script(ctx: &BuildContext, workspace: &Workspace, raw: Option<&Path>) -> Result<()> {
    if ctx.config.build_script.is_none() {
        return Ok(());
    }

    let step = Step::start("Running build script");
    let dest = workspace.path().join("dest");
    mkdir_last(&dest, 0o755)?;

    let root = workspace.root();
    let target = match raw {
        Some(image) => BuildTarget::Image(image),
        None => BuildTarget::Directory(&root),
    };
    let args = build_script_args(ctx, target, &dest, &workspace.var_tmp()?);
    Cmd::new("systemd-nspawn")
        .args(args)
        .visible()
        .error_msg("Build script failed")
        .run()?;
    step.finish();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_command_args() {
        let cmd = WorkspaceCommand::with_paths("0123", Path::new("/w/root"), Path::new("/w/var-tmp"))
            .env("DEBIAN_FRONTEND", "noninteractive")
            .param("--property=DeviceAllow=/dev/loop0");
        let args = cmd.args(&["apt-get", "update"]);

        assert_eq!(args[0], "--quiet");
        assert_eq!(args[1], "--directory=/w/root");
        assert_eq!(args[2], "--uuid=0123");
        assert!(args[3].starts_with("--machine=mkosi-"));
        assert_eq!(args[3].len(), "--machine=mkosi-".len() + 32);
        assert!(args.contains(&"--private-network".to_string()));
        assert!(args.contains(&"--setenv=DEBIAN_FRONTEND=noninteractive".to_string()));
        assert!(args.contains(&"--property=DeviceAllow=/dev/loop0".to_string()));
        assert_eq!(&args[args.len() - 3..], ["--", "apt-get", "update"]);
    }

    #[test]
    fn test_workspace_command_network() {
        let cmd = WorkspaceCommand::with_paths("0123", Path::new("/r"), Path::new("/v")).network(true);
        let args = cmd.args(&["true"]);
        assert!(args.contains(&"--bind-ro=/etc/resolv.conf".to_string()));
        assert!(!args.contains(&"--private-network".to_string()));
    }
}
