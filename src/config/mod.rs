//! Build configuration.
//!
//! Raw values arrive as [`Settings`] (command line first, then
//! `mkosi.default` and its drop-ins), get completed by auto-discovery in the
//! working directory, and are resolved into an immutable [`BuildConfig`].

pub mod discover;
pub mod settings;

pub use settings::Settings;

use anyhow::{bail, Result};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

use crate::distro;
use crate::gpt;
use crate::error::MkosiError;

/// Operation requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Build,
    Clean,
    Summary,
    Shell,
    Boot,
    Qemu,
    Withmount,
}

impl Verb {
    /// Verbs that need root and honor `--force` before doing anything else.
    pub fn needs_root(self) -> bool {
        matches!(self, Verb::Build | Verb::Clean | Verb::Shell | Verb::Boot | Verb::Qemu)
    }

    /// Verbs that use the built image and build it first when it is missing.
    pub fn uses_image(self) -> bool {
        matches!(self, Verb::Shell | Verb::Boot | Verb::Qemu)
    }
}

/// Kind of artifact produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    RawExt4,
    RawBtrfs,
    RawSquashfs,
    RawXfs,
    Directory,
    Subvolume,
    Tar,
}

impl OutputFormat {
    /// A GPT disk image.
    pub fn is_raw(self) -> bool {
        matches!(
            self,
            Self::RawExt4 | Self::RawBtrfs | Self::RawSquashfs | Self::RawXfs
        )
    }

    /// A GPT disk image whose root is a writable filesystem.
    pub fn is_raw_rw(self) -> bool {
        matches!(self, Self::RawExt4 | Self::RawBtrfs | Self::RawXfs)
    }

    /// Output is a plain tree on the host (no loop device involved).
    pub fn is_tree(self) -> bool {
        matches!(self, Self::Directory | Self::Subvolume)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::RawExt4 => "raw_ext4",
            Self::RawBtrfs => "raw_btrfs",
            Self::RawSquashfs => "raw_squashfs",
            Self::RawXfs => "raw_xfs",
            Self::Directory => "directory",
            Self::Subvolume => "subvolume",
            Self::Tar => "tar",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = MkosiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "raw_ext4" | "raw_gpt" => Self::RawExt4,
            "raw_btrfs" => Self::RawBtrfs,
            "raw_squashfs" => Self::RawSquashfs,
            "raw_xfs" => Self::RawXfs,
            "directory" => Self::Directory,
            "subvolume" => Self::Subvolume,
            "tar" => Self::Tar,
            other => return Err(MkosiError::config(format!("Unknown output format: {}", other))),
        })
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Supported distributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    Fedora,
    Debian,
    Ubuntu,
    Arch,
    Opensuse,
    Mageia,
    Centos,
    Clear,
}

impl Distribution {
    pub const ALL: [Distribution; 8] = [
        Self::Fedora,
        Self::Debian,
        Self::Ubuntu,
        Self::Arch,
        Self::Opensuse,
        Self::Mageia,
        Self::Centos,
        Self::Clear,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Fedora => "fedora",
            Self::Debian => "debian",
            Self::Ubuntu => "ubuntu",
            Self::Arch => "arch",
            Self::Opensuse => "opensuse",
            Self::Mageia => "mageia",
            Self::Centos => "centos",
            Self::Clear => "clear",
        }
    }

    /// RPM-based distributions that honor `--with-docs`.
    pub fn is_rpm(self) -> bool {
        matches!(self, Self::Fedora | Self::Centos | Self::Mageia)
    }
}

impl FromStr for Distribution {
    type Err = MkosiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|d| d.name() == s)
            .ok_or_else(|| MkosiError::config(format!("Unknown distribution: {}", s)))
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which partitions get LUKS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Encrypt {
    /// Everything except the ESP.
    All,
    /// Everything except the ESP and root.
    Data,
}

impl FromStr for Encrypt {
    type Err = MkosiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "data" => Ok(Self::Data),
            other => Err(MkosiError::config(format!("Invalid encryption setting: {}", other))),
        }
    }
}

impl fmt::Display for Encrypt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::All => "all",
            Self::Data => "data",
        })
    }
}

/// Where cryptsetup gets the LUKS passphrase from.
#[derive(Clone, PartialEq, Eq)]
pub enum Passphrase {
    /// Piped on stdin, followed by a newline.
    Stdin(String),
    /// Passed as a key file path.
    File(PathBuf),
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdin(_) => f.write_str("Stdin(<redacted>)"),
            Self::File(p) => f.debug_tuple("File").field(p).finish(),
        }
    }
}

/// What to do with the root account's password.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum RootPassword {
    #[default]
    Leave,
    /// Empty the password field in `/etc/passwd`.
    Delete,
    /// Store a SHA-512 crypt hash in `/etc/shadow`.
    Set(String),
}

impl RootPassword {
    /// `None` leaves the account alone, `""` deletes, anything else sets.
    pub fn from_setting(value: Option<&str>) -> Self {
        match value {
            None => Self::Leave,
            Some("") => Self::Delete,
            Some(p) => Self::Set(p.to_string()),
        }
    }
}

impl fmt::Debug for RootPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leave => f.write_str("Leave"),
            Self::Delete => f.write_str("Delete"),
            Self::Set(_) => f.write_str("Set(<redacted>)"),
        }
    }
}

/// Which files `git ls-files` should hand over as build sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GitFiles {
    /// Tracked files only.
    Cached,
    /// Tracked plus untracked, non-ignored files.
    #[default]
    Others,
}

impl FromStr for GitFiles {
    type Err = MkosiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cached" => Ok(Self::Cached),
            "others" => Ok(Self::Others),
            other => Err(MkosiError::config(format!("Invalid git files setting: {}", other))),
        }
    }
}

pub const DEFAULT_KERNEL_COMMAND_LINE: &str = "rhgb quiet selinux=0 audit=0 rw";

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Fully resolved, validated configuration. Read-only for the rest of the run.
#[derive(Debug, Clone, Serialize)]
pub struct BuildConfig {
    pub verb: Verb,
    pub cmdline: Vec<String>,
    /// Directory the invocation was resolved against.
    pub directory: PathBuf,
    pub architecture: String,

    pub distribution: Distribution,
    pub release: Option<String>,
    pub mirror: Option<String>,
    pub repositories: Vec<String>,

    pub format: OutputFormat,
    pub output: PathBuf,
    pub output_dir: Option<PathBuf>,
    pub force_count: u32,
    pub bootable: bool,
    pub kernel_command_line: Option<String>,
    pub secure_boot: bool,
    pub secure_boot_key: Option<PathBuf>,
    pub secure_boot_certificate: Option<PathBuf>,
    pub read_only: bool,
    pub encrypt: Option<Encrypt>,
    pub verity: bool,
    pub compress: bool,
    pub xz: bool,
    pub qcow2: bool,
    pub incremental: bool,
    pub hostname: Option<String>,

    pub packages: Vec<String>,
    pub with_docs: bool,
    pub with_tests: bool,
    pub cache_path: Option<PathBuf>,
    pub extra_trees: Vec<PathBuf>,
    pub skeleton_trees: Vec<PathBuf>,
    pub build_script: Option<PathBuf>,
    pub build_sources: Option<PathBuf>,
    pub build_dir: Option<PathBuf>,
    pub build_packages: Vec<String>,
    pub postinst_script: Option<PathBuf>,
    pub use_git_files: Option<bool>,
    pub git_files: GitFiles,
    pub with_network: bool,
    pub nspawn_settings: Option<PathBuf>,

    pub root_size: Option<u64>,
    pub esp_size: Option<u64>,
    pub swap_size: Option<u64>,
    pub home_size: Option<u64>,
    pub srv_size: Option<u64>,

    pub checksum: bool,
    pub sign: bool,
    pub key: Option<String>,
    pub bmap: bool,
    #[serde(skip)]
    pub password: RootPassword,
    #[serde(skip)]
    pub passphrase: Option<Passphrase>,

    pub extra_search_paths: Vec<PathBuf>,

    pub cache_pre_dev: Option<PathBuf>,
    pub cache_pre_inst: Option<PathBuf>,
    pub output_checksum: Option<PathBuf>,
    pub output_signature: Option<PathBuf>,
    pub output_bmap: Option<PathBuf>,
    pub output_nspawn_settings: Option<PathBuf>,
    pub output_root_hash_file: Option<PathBuf>,
}

impl BuildConfig {
    /// Resolve settings against `base` (the working directory), prompting
    /// for a LUKS passphrase when encryption is on and no key file exists.
    pub fn resolve(settings: Settings, base: &Path) -> Result<Self> {
        let mut config = Self::resolve_without_secrets(settings, base)?;
        if config.encrypt.is_some() {
            config.passphrase = Some(discover::find_passphrase(base)?);
        }
        Ok(config)
    }

    /// Everything [`BuildConfig::resolve`] does except acquiring the passphrase.
    pub fn resolve_without_secrets(mut s: Settings, base: &Path) -> Result<Self> {
        discover::discover(&mut s, base);

        if !s.cmdline.is_empty()
            && !matches!(s.verb, Verb::Shell | Verb::Boot | Verb::Qemu | Verb::Withmount)
        {
            bail!(MkosiError::config(
                "Additional parameters only accepted for 'shell', 'boot', 'qemu', 'withmount' invocations."
            ));
        }

        let format = match s.format.as_deref() {
            Some(f) => f.parse()?,
            None => OutputFormat::RawExt4,
        };

        let mut distribution = s.distribution.as_deref().map(str::parse::<Distribution>).transpose()?;
        let mut release = s.release.clone();
        if distribution.is_none() || release.is_none() {
            let (detected, detected_release) = discover::detect_distribution();
            if distribution.is_none() {
                distribution = detected;
            }
            if distribution.is_some()
                && distribution == detected
                && detected != Some(Distribution::Clear)
                && release.is_none()
            {
                release = detected_release;
            }
        }
        let distribution = distribution
            .ok_or_else(|| MkosiError::config("Couldn't detect distribution."))?;

        let architecture = std::env::consts::ARCH.to_string();
        let installer = distro::installer(distribution);
        if release.is_none() {
            release = installer.default_release().map(String::from);
        }

        let cache_path = match s.cache_path.as_deref() {
            Some(p) => Some(absolute(base, p)),
            None => discover::find_cache(base, distribution, release.as_deref()),
        };

        let mirror = s
            .mirror
            .clone()
            .or_else(|| installer.default_mirror(&architecture).map(String::from));

        let bootable = s.bootable.unwrap_or(false);
        if bootable && !format.is_raw() {
            bail!(MkosiError::config("Directory, subvolume and tar images cannot be booted."));
        }

        let encrypt = s.encrypt.as_deref().map(str::parse::<Encrypt>).transpose()?;
        let verity = s.verity.unwrap_or(false);
        if let Some(encrypt) = encrypt {
            if !format.is_raw() {
                bail!(MkosiError::config(
                    "Encryption is only supported for raw ext4, btrfs or squashfs images."
                ));
            }
            if encrypt == Encrypt::Data && format == OutputFormat::RawBtrfs {
                bail!(MkosiError::config(
                    "'data' encryption mode not supported on btrfs, use 'all' instead."
                ));
            }
            if encrypt == Encrypt::All && verity {
                bail!(MkosiError::config(
                    "'all' encryption mode may not be combined with Verity."
                ));
            }
        }

        let sign = s.sign.unwrap_or(false);
        let checksum = s.checksum.unwrap_or(false) || sign;
        let qcow2 = s.qcow2.unwrap_or(false);
        let mut xz = s.xz.unwrap_or(false);

        let output_name = s.output.clone().unwrap_or_else(|| default_output_name(format, qcow2, xz));
        let output_dir = s.output_dir.as_deref().map(|d| absolute(base, d));
        let output = match &output_dir {
            Some(dir) if !output_name.contains('/') => dir.join(&output_name),
            Some(_) => {
                warn!("Ignoring configured output directory as output file is a qualified path.");
                absolute(base, &output_name)
            }
            None => absolute(base, &output_name),
        };

        let incremental = s.incremental.unwrap_or(false);
        let (cache_pre_dev, cache_pre_inst) = if incremental || s.verb == Verb::Clean {
            (
                Some(append_suffix(&output, ".cache-pre-dev")),
                Some(append_suffix(&output, ".cache-pre-inst")),
            )
        } else {
            (None, None)
        };

        if format == OutputFormat::Tar {
            xz = true;
        }

        let mut read_only = s.read_only.unwrap_or(false);
        let mut compress = s.compress.unwrap_or(false);
        let mut root_size = parse_bytes(s.root_size.as_deref())?;
        if format == OutputFormat::RawSquashfs {
            read_only = true;
            compress = true;
            root_size = None;
        }

        let mut output_root_hash_file = None;
        if verity {
            read_only = true;
            output_root_hash_file = Some(sidecar_path(&output, ".roothash"));
        }

        let output_parent = output.parent().map(Path::to_path_buf).unwrap_or_default();
        let output_checksum = checksum.then(|| output_parent.join("SHA256SUMS"));
        let output_signature = sign.then(|| output_parent.join("SHA256SUMS.gpg"));
        let bmap = s.bmap.unwrap_or(false);
        let output_bmap = bmap.then(|| append_suffix(&output, ".bmap"));

        let nspawn_settings = s.nspawn_settings.as_deref().map(|p| absolute(base, p));
        let output_nspawn_settings = nspawn_settings.as_ref().map(|_| sidecar_path(&output, ".nspawn"));

        let esp_size = match parse_bytes(s.esp_size.as_deref())? {
            None if bootable => Some(256 * MIB),
            other => other,
        };
        if root_size.is_none() {
            root_size = match format {
                OutputFormat::RawExt4 | OutputFormat::RawBtrfs => Some(GIB),
                OutputFormat::RawXfs => Some(1300 * MIB),
                _ => None,
            };
        }

        let kernel_command_line = match s.kernel_command_line.clone() {
            None if bootable => Some(DEFAULT_KERNEL_COMMAND_LINE.to_string()),
            other => other,
        };

        let secure_boot = s.secure_boot.unwrap_or(false);
        let secure_boot_key = s.secure_boot_key.as_deref().map(|p| absolute(base, p));
        let secure_boot_certificate = s.secure_boot_certificate.as_deref().map(|p| absolute(base, p));
        if secure_boot {
            if secure_boot_key.is_none() {
                bail!(MkosiError::config(
                    "UEFI SecureBoot enabled, but couldn't find private key. (Consider placing it in mkosi.secure-boot.key?)"
                ));
            }
            if secure_boot_certificate.is_none() {
                bail!(MkosiError::config(
                    "UEFI SecureBoot enabled, but couldn't find certificate. (Consider placing it in mkosi.secure-boot.crt?)"
                ));
            }
        }

        if s.verb.uses_image() {
            if format == OutputFormat::Tar {
                bail!(MkosiError::config("Sorry, can't acquire shell in or boot a tar archive."));
            }
            if xz {
                bail!(MkosiError::config(
                    "Sorry, can't acquire shell in or boot an XZ compressed image."
                ));
            }
        }
        if matches!(s.verb, Verb::Shell | Verb::Boot) && qcow2 {
            bail!(MkosiError::config("Sorry, can't acquire shell in or boot a qcow2 image."));
        }
        if s.verb == Verb::Qemu && !format.is_raw() {
            bail!(MkosiError::config("Sorry, can't boot non-raw images with qemu."));
        }
        if s.verb == Verb::Withmount && (format == OutputFormat::Tar || xz || qcow2) {
            bail!(MkosiError::config(
                "Sorry, can only mount uncompressed raw images and directory trees."
            ));
        }

        let git_files = match s.git_files.as_deref() {
            Some(g) => g.parse()?,
            None => GitFiles::default(),
        };

        let config = Self {
            verb: s.verb,
            cmdline: s.cmdline,
            directory: base.to_path_buf(),
            architecture,
            distribution,
            release,
            mirror,
            repositories: s.repositories,
            format,
            output,
            output_dir,
            force_count: s.force_count,
            bootable,
            kernel_command_line,
            secure_boot,
            secure_boot_key,
            secure_boot_certificate,
            read_only,
            encrypt,
            verity,
            compress,
            xz,
            qcow2,
            incremental,
            hostname: s.hostname,
            packages: s.packages,
            with_docs: s.with_docs.unwrap_or(false),
            with_tests: s.with_tests.unwrap_or(true),
            cache_path,
            extra_trees: s.extra_trees.iter().map(|p| absolute(base, p)).collect(),
            skeleton_trees: s.skeleton_trees.iter().map(|p| absolute(base, p)).collect(),
            build_script: s.build_script.as_deref().map(|p| absolute(base, p)),
            build_sources: s.build_sources.as_deref().map(|p| absolute(base, p)),
            build_dir: s.build_dir.as_deref().map(|p| absolute(base, p)),
            build_packages: s.build_packages,
            postinst_script: s.postinst_script.as_deref().map(|p| absolute(base, p)),
            use_git_files: s.use_git_files,
            git_files,
            with_network: s.with_network.unwrap_or(false),
            nspawn_settings,
            root_size,
            esp_size,
            swap_size: parse_bytes(s.swap_size.as_deref())?,
            home_size: parse_bytes(s.home_size.as_deref())?,
            srv_size: parse_bytes(s.srv_size.as_deref())?,
            checksum,
            sign,
            key: s.key,
            bmap,
            password: RootPassword::from_setting(s.password.as_deref()),
            passphrase: None,
            extra_search_paths: discover::expand_paths(&s.extra_search_paths),
            cache_pre_dev,
            cache_pre_inst,
            output_checksum,
            output_signature,
            output_bmap,
            output_nspawn_settings,
            output_root_hash_file,
        };
        if config.format.is_raw() {
            gpt::image_size(&config)?;
        }
        Ok(config)
    }

    /// Output plus every sidecar that is enabled, in a fixed order.
    pub fn output_files(&self) -> Vec<&Path> {
        let mut files = vec![self.output.as_path()];
        let sidecars = [
            &self.output_checksum,
            &self.output_signature,
            &self.output_bmap,
            &self.output_nspawn_settings,
            &self.output_root_hash_file,
        ];
        files.extend(sidecars.into_iter().flatten().map(PathBuf::as_path));
        files
    }

    /// Directory holding the output.
    pub fn output_parent(&self) -> &Path {
        self.output.parent().unwrap_or_else(|| Path::new("/"))
    }
}

/// Default output file name for a format.
fn default_output_name(format: OutputFormat, qcow2: bool, xz: bool) -> String {
    if format.is_raw() {
        let mut name = if qcow2 { "image.qcow2" } else { "image.raw" }.to_string();
        if xz {
            name.push_str(".xz");
        }
        name
    } else if format == OutputFormat::Tar {
        "image.tar.xz".to_string()
    } else {
        "image".to_string()
    }
}

fn absolute(base: &Path, p: impl AsRef<Path>) -> PathBuf {
    let p = p.as_ref();
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

/// `path` with `suffix` appended to its final component.
pub fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// Strip any trailing run of `.xz`, `.raw`, `.tar`, `.qcow2` suffixes.
pub fn strip_suffixes(path: &str) -> &str {
    let mut t = path;
    loop {
        let stripped = [".xz", ".raw", ".tar", ".qcow2"]
            .iter()
            .find_map(|suffix| t.strip_suffix(suffix));
        match stripped {
            Some(rest) => t = rest,
            None => return t,
        }
    }
}

/// Sidecar next to the output: suffixes stripped, then `suffix` appended.
pub fn sidecar_path(output: &Path, suffix: &str) -> PathBuf {
    let s = output.to_string_lossy();
    PathBuf::from(format!("{}{}", strip_suffixes(&s), suffix))
}

/// Parse a size with an optional `K`/`M`/`G` suffix. Must be positive and
/// a multiple of 512.
pub fn parse_bytes(value: Option<&str>) -> Result<Option<u64>> {
    let Some(value) = value else {
        return Ok(None);
    };

    let (digits, factor) = if let Some(d) = value.strip_suffix('G') {
        (d, GIB)
    } else if let Some(d) = value.strip_suffix('M') {
        (d, MIB)
    } else if let Some(d) = value.strip_suffix('K') {
        (d, 1024)
    } else {
        (value, 1)
    };

    let n: i64 = digits
        .trim()
        .parse()
        .map_err(|_| MkosiError::config(format!("Invalid size: {}", value)))?;
    if n <= 0 {
        bail!(MkosiError::config(format!("Size out of range: {}", value)));
    }
    let bytes = (n as u64)
        .checked_mul(factor)
        .ok_or_else(|| MkosiError::config(format!("Size out of range: {}", value)))?;
    if bytes % 512 != 0 {
        bail!(MkosiError::config(format!("Size not a multiple of 512: {}", value)));
    }
    Ok(Some(bytes))
}

/// Parse `1/true/yes` and `0/false/no`.
pub fn parse_boolean(s: &str) -> Result<bool> {
    match s {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(MkosiError::config(format!("Invalid literal for bool(): {:?}", other)).into()),
    }
}

/// A resolved Fedora build configuration rooted at `base`, adjusted by `f`.
#[cfg(test)]
pub(crate) fn test_config(base: &Path, f: impl FnOnce(&mut Settings)) -> BuildConfig {
    let mut s = Settings::new(Verb::Build);
    s.distribution = Some("fedora".to_string());
    f(&mut s);
    BuildConfig::resolve_without_secrets(s, base).expect("test settings resolve")
}
