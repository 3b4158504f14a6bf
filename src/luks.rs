//! LUKS containers over image partitions.
//!
//! Each of root, home and srv goes Unformatted -> Formatted -> Opened ->
//! Closed independently. Opened volumes are [`LuksVolume`] guards, and
//! [`EncryptedVolumes`] closes them srv, home, root, the reverse of opening.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::config::{Encrypt, OutputFormat, Passphrase};
use crate::context::{BuildContext, Pass};
use crate::error::MkosiError;
use crate::loopdev::{partition, partition_path};
use crate::process::Cmd;
use crate::ui::Step;

fn passphrase_of(ctx: &BuildContext) -> Result<&Passphrase> {
    ctx.config
        .passphrase
        .as_ref()
        .ok_or_else(|| MkosiError::config("Encryption requested but no passphrase configured.").into())
}

fn stdin_content(content: &str) -> Vec<u8> {
    format!("{}\n", content).into_bytes()
}

/// Argument vector for `cryptsetup luksFormat`.
pub fn format_args(dev: &Path, passphrase: &Passphrase) -> Vec<String> {
    let mut args = vec![
        "luksFormat".to_string(),
        "--batch-mode".to_string(),
        dev.display().to_string(),
    ];
    if let Passphrase::File(keyfile) = passphrase {
        args.push(keyfile.display().to_string());
    }
    args
}

/// Argument vector for `cryptsetup open` under mapper name `name`.
pub fn open_args(dev: &Path, name: &str, passphrase: &Passphrase) -> Vec<String> {
    let mut args = Vec::new();
    if let Passphrase::File(keyfile) = passphrase {
        args.push("--key-file".to_string());
        args.push(keyfile.display().to_string());
    }
    args.extend([
        "open".to_string(),
        "--type".to_string(),
        "luks".to_string(),
        dev.display().to_string(),
        name.to_string(),
    ]);
    args
}

/// Initialize a LUKS header on `dev`.
pub fn format(dev: &Path, passphrase: &Passphrase) -> Result<()> {
    let mut cmd = Cmd::new("cryptsetup").args(format_args(dev, passphrase));
    if let Passphrase::Stdin(content) = passphrase {
        cmd = cmd.stdin_bytes(stdin_content(content));
    }
    cmd.error_msg(format!("LUKS formatting {} failed", dev.display())).run()?;
    Ok(())
}

/// Open `dev` under a random mapper name.
pub fn open(dev: &Path, passphrase: &Passphrase) -> Result<LuksVolume> {
    let name = uuid::Uuid::new_v4().to_string();
    let mut cmd = Cmd::new("cryptsetup").args(open_args(dev, &name, passphrase));
    if let Passphrase::Stdin(content) = passphrase {
        cmd = cmd.stdin_bytes(stdin_content(content));
    }
    cmd.error_msg(format!("Opening LUKS volume {} failed", dev.display())).run()?;

    Ok(LuksVolume {
        mapped: Path::new("/dev/mapper").join(name),
        description: String::new(),
        closed: false,
    })
}

/// `cryptsetup close <dev>`.
pub fn close(mapped: &Path) -> Result<()> {
    Cmd::new("cryptsetup")
        .arg("close")
        .arg_path(mapped)
        .error_msg(format!("Closing LUKS volume {} failed", mapped.display()))
        .run()?;
    Ok(())
}

/// An opened LUKS mapping. Closed by [`LuksVolume::close`], or on drop as a
/// best-effort fallback when unwinding from an error.
#[derive(Debug)]
pub struct LuksVolume {
    mapped: PathBuf,
    description: String,
    closed: bool,
}

impl LuksVolume {
    pub fn path(&self) -> &Path {
        &self.mapped
    }

    fn described(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        let step = Step::start(&format!("Closing LUKS {}", self.description));
        close(&self.mapped)?;
        step.finish();
        Ok(())
    }
}

impl Drop for LuksVolume {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = close(&self.mapped) {
            warn!("{:#}", e);
        }
    }
}

/// Whether the root partition gets a LUKS header in this pass.
pub fn should_format_root(ctx: &BuildContext, pass: Pass, cached: bool, inserting: bool) -> bool {
    ctx.config.encrypt == Some(Encrypt::All)
        && ctx.partitions.root.is_some()
        && (ctx.config.format != OutputFormat::RawSquashfs || inserting)
        && !pass.run_build_script
        && !cached
}

/// Whether a data partition (home/srv) gets a LUKS header in this pass.
pub fn should_format_data(ctx: &BuildContext, partno: Option<u32>, pass: Pass, cached: bool) -> bool {
    ctx.config.encrypt.is_some() && partno.is_some() && !pass.run_build_script && !cached
}

/// Whether the root partition is opened through LUKS in this pass.
pub fn should_open_root(ctx: &BuildContext, pass: Pass, inserting: bool) -> bool {
    should_format_root(ctx, pass, false, inserting)
}

/// Whether a data partition is opened through LUKS in this pass.
pub fn should_open_data(ctx: &BuildContext, partno: Option<u32>, pass: Pass) -> bool {
    should_format_data(ctx, partno, pass, false)
}

pub fn format_root(ctx: &BuildContext, loopdev: &Path, pass: Pass, cached: bool, inserting: bool) -> Result<()> {
    if !should_format_root(ctx, pass, cached, inserting) {
        return Ok(());
    }
    let Some(partno) = ctx.partitions.root else {
        return Ok(());
    };
    let step = Step::start("LUKS formatting root partition");
    format(&partition_path(loopdev, partno), passphrase_of(ctx)?)?;
    step.finish();
    Ok(())
}

pub fn format_home(ctx: &BuildContext, loopdev: &Path, pass: Pass, cached: bool) -> Result<()> {
    format_data(ctx, loopdev, ctx.partitions.home, pass, cached, "home partition")
}

pub fn format_srv(ctx: &BuildContext, loopdev: &Path, pass: Pass, cached: bool) -> Result<()> {
    format_data(ctx, loopdev, ctx.partitions.srv, pass, cached, "server data partition")
}

fn format_data(
    ctx: &BuildContext,
    loopdev: &Path,
    partno: Option<u32>,
    pass: Pass,
    cached: bool,
    what: &str,
) -> Result<()> {
    if !should_format_data(ctx, partno, pass, cached) {
        return Ok(());
    }
    let Some(partno) = partno else {
        return Ok(());
    };
    let step = Step::start(&format!("LUKS formatting {}", what));
    format(&partition_path(loopdev, partno), passphrase_of(ctx)?)?;
    step.finish();
    Ok(())
}

/// Open the root partition if it is encrypted in this pass.
pub fn setup_root(ctx: &BuildContext, loopdev: &Path, pass: Pass, inserting: bool) -> Result<Option<LuksVolume>> {
    if !should_open_root(ctx, pass, inserting) {
        return Ok(None);
    }
    let Some(partno) = ctx.partitions.root else {
        return Ok(None);
    };
    open_described(ctx, &partition_path(loopdev, partno), "root partition")
}

fn setup_data(
    ctx: &BuildContext,
    loopdev: &Path,
    partno: Option<u32>,
    pass: Pass,
    what: &str,
) -> Result<Option<LuksVolume>> {
    if !should_open_data(ctx, partno, pass) {
        return Ok(None);
    }
    let Some(partno) = partno else {
        return Ok(None);
    };
    open_described(ctx, &partition_path(loopdev, partno), what)
}

fn open_described(ctx: &BuildContext, dev: &Path, what: &str) -> Result<Option<LuksVolume>> {
    let step = Step::start(&format!("Opening LUKS {}", what));
    let volume = open(dev, passphrase_of(ctx)?)
        .with_context(|| format!("Opening LUKS {}", what))?
        .described(what);
    step.finish();
    Ok(Some(volume))
}

/// Root, home and srv devices for one pass: the LUKS mapping when the
/// partition is encrypted, the bare partition otherwise, or nothing.
///
/// Fields drop in declaration order, so srv is declared first.
#[derive(Debug, Default)]
pub struct EncryptedVolumes {
    srv: Option<LuksVolume>,
    home: Option<LuksVolume>,
    root: Option<LuksVolume>,
    pub root_dev: Option<PathBuf>,
    pub home_dev: Option<PathBuf>,
    pub srv_dev: Option<PathBuf>,
}

impl EncryptedVolumes {
    /// Open root, then home, then srv. A failure closes what was already
    /// opened.
    pub fn setup(ctx: &BuildContext, loopdev: Option<&Path>, pass: Pass) -> Result<Self> {
        let Some(loopdev) = loopdev else {
            return Ok(Self::default());
        };

        let root = setup_root(ctx, loopdev, pass, false)?;
        let home = setup_data(ctx, loopdev, ctx.partitions.home, pass, "home partition")?;
        let srv = setup_data(ctx, loopdev, ctx.partitions.srv, pass, "server data partition")?;

        let pick = |volume: &Option<LuksVolume>, partno: Option<u32>| match volume {
            Some(v) => Some(v.path().to_path_buf()),
            None => partition(loopdev, partno),
        };

        Ok(Self {
            root_dev: pick(&root, ctx.partitions.root),
            home_dev: pick(&home, ctx.partitions.home),
            srv_dev: pick(&srv, ctx.partitions.srv),
            srv,
            home,
            root,
        })
    }

    /// Close srv, home, root, stopping at the first failure.
    pub fn close(mut self) -> Result<()> {
        for volume in [self.srv.take(), self.home.take(), self.root.take()]
            .into_iter()
            .flatten()
        {
            volume.close()?;
        }
        Ok(())
    }
}
