//! Human-readable and JSON summaries of the resolved configuration.

use anyhow::Result;
use std::fmt::Write;
use std::path::{Path, PathBuf};

use crate::config::{BuildConfig, Distribution, OutputFormat, RootPassword};
use crate::ui::format_bytes;

const LIST_INDENT: &str = "\n                        ";

fn yes_no(b: bool) -> &'static str {
    if b {
        "yes"
    } else {
        "no"
    }
}

fn path_or(p: &Option<PathBuf>, fallback: &str) -> String {
    p.as_deref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| fallback.to_string())
}

fn bytes_or(size: Option<u64>, fallback: &str) -> String {
    size.map(format_bytes).unwrap_or_else(|| fallback.to_string())
}

fn join_list<T: AsRef<str>>(items: &[T]) -> String {
    if items.is_empty() {
        return "none".to_string();
    }
    items.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(LIST_INDENT)
}

fn join_paths(paths: &[PathBuf]) -> String {
    let items: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
    join_list(&items)
}

fn display(p: &Path) -> String {
    p.display().to_string()
}

/// Accumulates sections of right-aligned `Label: value` lines.
#[derive(Default)]
struct Summary {
    out: String,
}

impl Summary {
    fn header(&mut self, name: &str) {
        if !self.out.is_empty() {
            self.out.push('\n');
        }
        // `write!` into a String cannot fail.
        let _ = writeln!(self.out, "{}:", name);
    }

    fn line(&mut self, label: &str, value: &str) {
        let _ = writeln!(self.out, "{:>22}: {}", label, value);
    }
}

/// The configuration as grouped `Label: value` lines.
pub fn render(config: &BuildConfig) -> String {
    let mut summary = Summary::default();
    let raw = config.format.is_raw();
    let s = &mut summary;

    s.header("DISTRIBUTION");
    s.line("Distribution", config.distribution.name());
    s.line("Release", config.release.as_deref().unwrap_or("n/a"));
    if let Some(mirror) = &config.mirror {
        s.line("Mirror", mirror);
    }

    s.header("OUTPUT");
    if let Some(hostname) = &config.hostname {
        s.line("Hostname", hostname);
    }
    s.line("Output Format", config.format.name());
    if let Some(dir) = &config.output_dir {
        s.line("Output Directory", &display(dir));
    }
    s.line("Output", &display(&config.output));
    s.line("Output Checksum", &path_or(&config.output_checksum, "n/a"));
    s.line("Output Signature", &path_or(&config.output_signature, "n/a"));
    s.line("Output Bmap", &path_or(&config.output_bmap, "n/a"));
    s.line("Output nspawn Settings", &path_or(&config.output_nspawn_settings, "n/a"));
    s.line("Incremental", yes_no(config.incremental));

    if raw || config.format == OutputFormat::Subvolume {
        s.line("Read-only", yes_no(config.read_only));
        s.line("FS Compression", yes_no(config.compress));
    }
    if raw || config.format == OutputFormat::Tar {
        s.line("XZ Compression", yes_no(config.xz));
    }
    if raw {
        s.line("QCow2", yes_no(config.qcow2));
    }
    let encryption = config.encrypt.map(|e| e.to_string());
    s.line("Encryption", encryption.as_deref().unwrap_or("no"));
    s.line("Verity", yes_no(config.verity));

    if raw {
        s.line("Bootable", yes_no(config.bootable));
        if config.bootable {
            s.line("Kernel Command Line", config.kernel_command_line.as_deref().unwrap_or_default());
            s.line("UEFI SecureBoot", yes_no(config.secure_boot));
            if config.secure_boot {
                s.line("UEFI SecureBoot Key", &path_or(&config.secure_boot_key, "none"));
                s.line("UEFI SecureBoot Cert.", &path_or(&config.secure_boot_certificate, "none"));
            }
        }
    }

    s.header("PACKAGES");
    s.line("Packages", &join_list(&config.packages));
    if matches!(
        config.distribution,
        Distribution::Fedora | Distribution::Centos | Distribution::Mageia
    ) {
        s.line("With Documentation", yes_no(config.with_docs));
    }
    s.line("Package Cache", &path_or(&config.cache_path, "none"));
    s.line("Extra Trees", &join_paths(&config.extra_trees));
    s.line("Skeleton Trees", &join_paths(&config.skeleton_trees));
    s.line("Build Script", &path_or(&config.build_script, "none"));
    if config.build_script.is_some() {
        s.line("Run tests", yes_no(config.with_tests));
    }
    s.line("Build Sources", &path_or(&config.build_sources, "none"));
    s.line("Build Directory", &path_or(&config.build_dir, "none"));
    s.line("Build Packages", &join_list(&config.build_packages));
    s.line("Postinstall Script", &path_or(&config.postinst_script, "none"));
    s.line("Scripts with network", yes_no(config.with_network));
    s.line("nspawn Settings", &path_or(&config.nspawn_settings, "none"));

    if raw {
        s.header("PARTITIONS");
        s.line("Root Partition", &bytes_or(config.root_size, "(automatic)"));
        s.line("Swap Partition", &bytes_or(config.swap_size, "(disabled)"));
        s.line("ESP", &bytes_or(config.esp_size, "(disabled)"));
        s.line("/home Partition", &bytes_or(config.home_size, "(disabled)"));
        s.line("/srv Partition", &bytes_or(config.srv_size, "(disabled)"));

        s.header("VALIDATION");
        s.line("Checksum", yes_no(config.checksum));
        s.line("Sign", yes_no(config.sign));
        s.line("GPG Key", config.key.as_deref().unwrap_or("default"));
        let password = if config.password == RootPassword::Leave { "default" } else { "set" };
        s.line("Password", password);
    }

    s.header("HOST CONFIGURATION");
    s.line("Extra search paths", &join_paths(&config.extra_search_paths));

    summary.out
}

/// Print the summary to stderr.
pub fn print_summary(config: &BuildConfig) {
    eprint!("{}", render(config));
}

/// The configuration as JSON, secrets omitted.
pub fn to_json(config: &BuildConfig) -> Result<String> {
    Ok(serde_json::to_string_pretty(config)?)
}
