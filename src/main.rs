//! mkosi - build legacy-free OS disk images.
//!
//! Produces GPT disk images (ext4, btrfs, xfs or squashfs root), plain
//! directory trees, btrfs subvolumes or tarballs from distribution
//! packages, optionally bootable through a signed unified kernel image and
//! protected by dm-verity or LUKS.

use anyhow::{Context, Result};
use clap::{ArgAction, CommandFactory, Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use mkosi::commands;
use mkosi::config::{BuildConfig, Settings, Verb};
use mkosi::error::exit_code_for;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CliVerb {
    Build,
    Clean,
    Summary,
    Shell,
    Boot,
    Qemu,
    Withmount,
    Help,
}

#[derive(Parser)]
#[command(name = "mkosi")]
#[command(about = "Build Legacy-Free OS Images")]
#[command(
    after_help = "QUICK START:\n  mkosi -d fedora -t raw_ext4 -b  Build a bootable Fedora image\n  mkosi summary                   Show the resolved configuration\n  mkosi qemu                      Boot the image in QEMU\n  mkosi -ff clean                 Remove outputs and caches"
)]
struct Cli {
    /// Operation to execute
    #[arg(value_enum, default_value = "build")]
    verb: CliVerb,

    /// Arguments for shell, boot, qemu or the command for withmount
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    cmdline: Vec<String>,

    /// Distribution to install
    #[arg(short = 'd', long)]
    distribution: Option<String>,

    /// Distribution release to install
    #[arg(short = 'r', long)]
    release: Option<String>,

    /// Distribution mirror to use
    #[arg(short = 'm', long)]
    mirror: Option<String>,

    /// Repositories to use
    #[arg(long = "repositories", value_delimiter = ',')]
    repositories: Vec<String>,

    /// Output format: raw_ext4, raw_btrfs, raw_squashfs, raw_xfs, directory, subvolume, tar
    #[arg(short = 't', long)]
    format: Option<String>,

    /// Output image path
    #[arg(short = 'o', long)]
    output: Option<String>,

    /// Output root directory
    #[arg(short = 'O', long = "output-dir")]
    output_dir: Option<String>,

    /// Delete existing image first; repeat to also remove caches
    #[arg(short = 'f', long, action = ArgAction::Count)]
    force: u8,

    /// Make image bootable on EFI (only raw_ext4, raw_btrfs, raw_squashfs, raw_xfs)
    #[arg(short = 'b', long)]
    bootable: bool,

    /// Set the kernel command line (only bootable images)
    #[arg(long = "kernel-command-line")]
    kernel_command_line: Option<String>,

    /// Sign the resulting kernel/initrd image for UEFI SecureBoot
    #[arg(long = "secure-boot")]
    secure_boot: bool,

    /// UEFI SecureBoot private key in PEM format
    #[arg(long = "secure-boot-key")]
    secure_boot_key: Option<String>,

    /// UEFI SecureBoot certificate in X509 format
    #[arg(long = "secure-boot-certificate")]
    secure_boot_certificate: Option<String>,

    /// Make root volume read-only (only raw_ext4, raw_btrfs, subvolume)
    #[arg(long = "read-only")]
    read_only: bool,

    /// Encrypt everything except the ESP, or only the data partitions
    #[arg(long, value_parser = ["all", "data"])]
    encrypt: Option<String>,

    /// Add integrity partition (implies --read-only)
    #[arg(long)]
    verity: bool,

    /// Enable compression in file system (only raw_btrfs, subvolume)
    #[arg(long)]
    compress: bool,

    /// Compress resulting image with xz (only raw_*, implied for tar)
    #[arg(long)]
    xz: bool,

    /// Convert resulting image to qcow2 (only raw_*)
    #[arg(long)]
    qcow2: bool,

    /// Set hostname
    #[arg(long)]
    hostname: Option<String>,

    /// Make use of and generate intermediary cache images
    #[arg(short = 'i', long)]
    incremental: bool,

    /// Add an additional package to the OS image
    #[arg(short = 'p', long = "package", value_delimiter = ',')]
    packages: Vec<String>,

    /// Install documentation (only Fedora, CentOS and Mageia)
    #[arg(long = "with-docs")]
    with_docs: bool,

    /// Do not run tests as part of the build script, if supported
    #[arg(short = 'T', long = "without-tests")]
    without_tests: bool,

    /// Package cache path
    #[arg(long)]
    cache: Option<String>,

    /// Copy an extra tree on top of image
    #[arg(long = "extra-tree")]
    extra_trees: Vec<String>,

    /// Use a skeleton tree to bootstrap the image before installing anything
    #[arg(long = "skeleton-tree")]
    skeleton_trees: Vec<String>,

    /// Build script to run inside image
    #[arg(long = "build-script")]
    build_script: Option<String>,

    /// Path for sources to build
    #[arg(long = "build-sources")]
    build_sources: Option<String>,

    /// Path to use as persistent build directory
    #[arg(long = "build-dir")]
    build_dir: Option<String>,

    /// Additional packages needed for build script
    #[arg(long = "build-package", value_delimiter = ',')]
    build_packages: Vec<String>,

    /// Postinstall script to run inside image
    #[arg(long = "postinst-script")]
    postinst_script: Option<String>,

    /// Ignore any files that git itself ignores (default: guess)
    #[arg(long = "use-git-files", value_parser = clap::builder::BoolishValueParser::new())]
    use_git_files: Option<bool>,

    /// Whether to include untracked files (cached or others)
    #[arg(long = "git-files")]
    git_files: Option<String>,

    /// Run build and postinst scripts with network access
    #[arg(long = "with-network")]
    with_network: bool,

    /// Add in .nspawn settings file
    #[arg(long = "settings")]
    nspawn_settings: Option<String>,

    /// Set size of root partition (only raw_ext4, raw_btrfs, raw_xfs)
    #[arg(long = "root-size")]
    root_size: Option<String>,

    /// Set size of EFI system partition (only bootable raw images)
    #[arg(long = "esp-size")]
    esp_size: Option<String>,

    /// Set size of swap partition (only raw images)
    #[arg(long = "swap-size")]
    swap_size: Option<String>,

    /// Set size of /home partition (only raw_ext4, raw_squashfs, raw_xfs)
    #[arg(long = "home-size")]
    home_size: Option<String>,

    /// Set size of /srv partition (only raw_ext4, raw_squashfs, raw_xfs)
    #[arg(long = "srv-size")]
    srv_size: Option<String>,

    /// Write SHA256SUMS file
    #[arg(long)]
    checksum: bool,

    /// Write and sign SHA256SUMS file
    #[arg(long)]
    sign: bool,

    /// GPG key to use for signing
    #[arg(long)]
    key: Option<String>,

    /// Write block map file (.bmap) for bmaptool usage (only raw_*)
    #[arg(long)]
    bmap: bool,

    /// Set the root password
    #[arg(long)]
    password: Option<String>,

    /// Change to specified directory before doing anything
    #[arg(short = 'C', long)]
    directory: Option<PathBuf>,

    /// Read configuration data from file
    #[arg(long = "default")]
    default_path: Option<PathBuf>,

    /// List of colon-separated paths to look for programs before looking in PATH
    #[arg(long = "extra-search-paths", value_delimiter = ':')]
    extra_search_paths: Vec<String>,

    /// Print the summary as JSON on stdout
    #[arg(long)]
    json: bool,
}

impl Cli {
    /// Command-line settings. Flags that were not given stay unset so
    /// configuration files can still provide them.
    fn into_settings(self, verb: Verb) -> Settings {
        let flag = |b: bool| b.then_some(true);
        let mut s = Settings::new(verb);
        s.cmdline = self.cmdline;
        s.default_path = self.default_path;
        s.distribution = self.distribution;
        s.release = self.release;
        s.mirror = self.mirror;
        s.repositories = self.repositories;
        s.format = self.format;
        s.output = self.output;
        s.output_dir = self.output_dir;
        s.force_count = u32::from(self.force);
        s.bootable = flag(self.bootable);
        s.kernel_command_line = self.kernel_command_line;
        s.secure_boot = flag(self.secure_boot);
        s.secure_boot_key = self.secure_boot_key;
        s.secure_boot_certificate = self.secure_boot_certificate;
        s.read_only = flag(self.read_only);
        s.encrypt = self.encrypt;
        s.verity = flag(self.verity);
        s.compress = flag(self.compress);
        s.xz = flag(self.xz);
        s.qcow2 = flag(self.qcow2);
        s.incremental = flag(self.incremental);
        s.hostname = self.hostname;
        s.packages = self.packages;
        s.with_docs = flag(self.with_docs);
        s.with_tests = self.without_tests.then_some(false);
        s.cache_path = self.cache;
        s.extra_trees = self.extra_trees;
        s.skeleton_trees = self.skeleton_trees;
        s.build_script = self.build_script;
        s.build_sources = self.build_sources;
        s.build_dir = self.build_dir;
        s.build_packages = self.build_packages;
        s.postinst_script = self.postinst_script;
        s.use_git_files = self.use_git_files;
        s.git_files = self.git_files;
        s.with_network = flag(self.with_network);
        s.nspawn_settings = self.nspawn_settings;
        s.root_size = self.root_size;
        s.esp_size = self.esp_size;
        s.swap_size = self.swap_size;
        s.home_size = self.home_size;
        s.srv_size = self.srv_size;
        s.checksum = flag(self.checksum);
        s.sign = flag(self.sign);
        s.key = self.key;
        s.bmap = flag(self.bmap);
        s.password = self.password;
        s.extra_search_paths = self.extra_search_paths;
        s
    }
}

fn verb(v: CliVerb) -> Option<Verb> {
    Some(match v {
        CliVerb::Build => Verb::Build,
        CliVerb::Clean => Verb::Clean,
        CliVerb::Summary => Verb::Summary,
        CliVerb::Shell => Verb::Shell,
        CliVerb::Boot => Verb::Boot,
        CliVerb::Qemu => Verb::Qemu,
        CliVerb::Withmount => Verb::Withmount,
        CliVerb::Help => return None,
    })
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("MKOSI_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn run(mut cli: Cli) -> Result<()> {
    let Some(verb) = verb(cli.verb) else {
        Cli::command().print_help()?;
        return Ok(());
    };
    let json = cli.json;

    if let Some(dir) = cli.directory.take() {
        std::env::set_current_dir(&dir)
            .with_context(|| format!("Failed to change to directory {}", dir.display()))?;
    }
    let base = std::env::current_dir().context("Failed to determine working directory")?;

    let mut settings = cli.into_settings(verb);
    settings.load_defaults(&base)?;

    // The summary never touches the image, so it never asks for a passphrase.
    let config = if verb == Verb::Summary {
        BuildConfig::resolve_without_secrets(settings, &base)?
    } else {
        BuildConfig::resolve(settings, &base)?
    };

    commands::dispatch(config, json)
}

fn main() -> ExitCode {
    // Load .env if present
    dotenvy::dotenv().ok();
    init_logging();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_verb_and_flags() {
        let cli = Cli::try_parse_from(["mkosi", "-ff", "-b", "-p", "vim,git", "-T"]).unwrap();
        assert_eq!(cli.verb, CliVerb::Build);
        let s = cli.into_settings(Verb::Build);
        assert_eq!(s.force_count, 2);
        assert_eq!(s.bootable, Some(true));
        assert_eq!(s.packages, ["vim", "git"]);
        assert_eq!(s.with_tests, Some(false));
        assert_eq!(s.xz, None);
    }

    #[test]
    fn test_verb_with_cmdline() {
        let cli = Cli::try_parse_from(["mkosi", "-t", "directory", "boot", "systemd.unit=rescue.target"]).unwrap();
        assert_eq!(cli.verb, CliVerb::Boot);
        assert_eq!(cli.cmdline, ["systemd.unit=rescue.target"]);

        let cli = Cli::try_parse_from(["mkosi", "withmount", "ls", "-la"]).unwrap();
        assert_eq!(verb(cli.verb), Some(Verb::Withmount));
        assert_eq!(cli.cmdline, ["ls", "-la"]);
    }

    #[test]
    fn test_extra_search_paths_split_on_colon() {
        let cli = Cli::try_parse_from(["mkosi", "--extra-search-paths", "/a/bin:/b/bin", "summary"]).unwrap();
        assert_eq!(cli.extra_search_paths, ["/a/bin", "/b/bin"]);
        assert_eq!(verb(cli.verb), Some(Verb::Summary));
    }

    #[test]
    fn test_help_verb() {
        let cli = Cli::try_parse_from(["mkosi", "help"]).unwrap();
        assert_eq!(verb(cli.verb), None);
    }
}
