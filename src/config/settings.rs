//! Unresolved settings and the `mkosi.default` file format.
//!
//! The command line fills a [`Settings`] first; configuration files are
//! layered underneath with [`Settings::load_defaults`]. A scalar keeps the
//! first value it receives, list settings accumulate.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::{parse_boolean, Verb};

/// Raw, unvalidated settings. `None` means "not configured yet".
#[derive(Debug, Clone)]
pub struct Settings {
    pub verb: Verb,
    pub cmdline: Vec<String>,
    pub default_path: Option<PathBuf>,

    pub distribution: Option<String>,
    pub release: Option<String>,
    pub mirror: Option<String>,
    pub repositories: Vec<String>,

    pub format: Option<String>,
    pub output: Option<String>,
    pub output_dir: Option<String>,
    pub force_count: u32,
    pub bootable: Option<bool>,
    pub kernel_command_line: Option<String>,
    pub secure_boot: Option<bool>,
    pub secure_boot_key: Option<String>,
    pub secure_boot_certificate: Option<String>,
    pub read_only: Option<bool>,
    pub encrypt: Option<String>,
    pub verity: Option<bool>,
    pub compress: Option<bool>,
    pub xz: Option<bool>,
    pub qcow2: Option<bool>,
    pub incremental: Option<bool>,
    pub hostname: Option<String>,

    pub packages: Vec<String>,
    pub with_docs: Option<bool>,
    pub with_tests: Option<bool>,
    pub cache_path: Option<String>,
    pub extra_trees: Vec<String>,
    pub skeleton_trees: Vec<String>,
    pub build_script: Option<String>,
    pub build_sources: Option<String>,
    pub build_dir: Option<String>,
    pub build_packages: Vec<String>,
    pub postinst_script: Option<String>,
    pub use_git_files: Option<bool>,
    pub git_files: Option<String>,
    pub with_network: Option<bool>,
    pub nspawn_settings: Option<String>,

    pub root_size: Option<String>,
    pub esp_size: Option<String>,
    pub swap_size: Option<String>,
    pub home_size: Option<String>,
    pub srv_size: Option<String>,

    pub checksum: Option<bool>,
    pub sign: Option<bool>,
    pub key: Option<String>,
    pub bmap: Option<bool>,
    pub password: Option<String>,

    pub extra_search_paths: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(Verb::Build)
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T) {
    if slot.is_none() {
        *slot = Some(value);
    }
}

fn words(value: &str) -> impl Iterator<Item = String> + '_ {
    value.split_whitespace().map(String::from)
}

impl Settings {
    pub fn new(verb: Verb) -> Self {
        Self {
            verb,
            cmdline: Vec::new(),
            default_path: None,
            distribution: None,
            release: None,
            mirror: None,
            repositories: Vec::new(),
            format: None,
            output: None,
            output_dir: None,
            force_count: 0,
            bootable: None,
            kernel_command_line: None,
            secure_boot: None,
            secure_boot_key: None,
            secure_boot_certificate: None,
            read_only: None,
            encrypt: None,
            verity: None,
            compress: None,
            xz: None,
            qcow2: None,
            incremental: None,
            hostname: None,
            packages: Vec::new(),
            with_docs: None,
            with_tests: None,
            cache_path: None,
            extra_trees: Vec::new(),
            skeleton_trees: Vec::new(),
            build_script: None,
            build_sources: None,
            build_dir: None,
            build_packages: Vec::new(),
            postinst_script: None,
            use_git_files: None,
            git_files: None,
            with_network: None,
            nspawn_settings: None,
            root_size: None,
            esp_size: None,
            swap_size: None,
            home_size: None,
            srv_size: None,
            checksum: None,
            sign: None,
            key: None,
            bmap: None,
            password: None,
            extra_search_paths: Vec::new(),
        }
    }

    /// Layer `mkosi.default` (or the `--default` file) and every regular
    /// file in its `.d/` directory, in sorted name order.
    pub fn load_defaults(&mut self, base: &Path) -> Result<()> {
        let fname = match &self.default_path {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => base.join(p),
            None => base.join("mkosi.default"),
        };

        if fname.is_file() {
            self.load_file(&fname)?;
        }

        let mut dropin_dir = fname.into_os_string();
        dropin_dir.push(".d");
        let dropin_dir = PathBuf::from(dropin_dir);
        if dropin_dir.is_dir() {
            let mut entries: Vec<PathBuf> = fs::read_dir(&dropin_dir)
                .with_context(|| format!("Failed to read {}", dropin_dir.display()))?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.is_file())
                .collect();
            entries.sort();
            for path in entries {
                self.load_file(&path)?;
            }
        }

        Ok(())
    }

    /// Apply one configuration file.
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        for (section, entries) in parse_ini(&content) {
            if !is_known_section(&section) {
                warn!("Unknown section in {}, ignoring: [{}]", path.display(), section);
                continue;
            }
            for (key, value) in entries {
                let known = self
                    .apply(&section, &key, &value)
                    .with_context(|| format!("{}: [{}] {}=", path.display(), section, key))?;
                if !known {
                    warn!(
                        "Unknown key in section [{}] in {}, ignoring: {}=",
                        section,
                        path.display(),
                        key
                    );
                }
            }
        }
        Ok(())
    }

    /// Apply a single `Key=Value` from `[section]`. Returns false for
    /// unknown keys.
    pub fn apply(&mut self, section: &str, key: &str, value: &str) -> Result<bool> {
        let v = value.to_string();
        match (section, key) {
            ("Distribution", "Distribution") => set_once(&mut self.distribution, v),
            ("Distribution", "Release") => set_once(&mut self.release, v),
            ("Distribution", "Mirror") => set_once(&mut self.mirror, v),
            ("Distribution", "Repositories") => self.repositories.extend(words(value)),

            ("Output", "Format") => set_once(&mut self.format, v),
            ("Output", "Output") => set_once(&mut self.output, v),
            ("Output", "OutputDirectory") => set_once(&mut self.output_dir, v),
            ("Output", "Force") => {
                if self.force_count == 0 && parse_boolean(value)? {
                    self.force_count = 1;
                }
            }
            ("Output", "Bootable") => set_once(&mut self.bootable, parse_boolean(value)?),
            ("Output", "KernelCommandLine") => set_once(&mut self.kernel_command_line, v),
            ("Output", "SecureBoot") => set_once(&mut self.secure_boot, parse_boolean(value)?),
            ("Output", "SecureBootKey") => set_once(&mut self.secure_boot_key, v),
            ("Output", "SecureBootCertificate") => set_once(&mut self.secure_boot_certificate, v),
            ("Output", "ReadOnly") => set_once(&mut self.read_only, parse_boolean(value)?),
            ("Output", "Encrypt") => {
                if self.encrypt.is_none() {
                    value.parse::<super::Encrypt>()?;
                    self.encrypt = Some(v);
                }
            }
            ("Output", "Verity") => set_once(&mut self.verity, parse_boolean(value)?),
            ("Output", "Compress") => set_once(&mut self.compress, parse_boolean(value)?),
            ("Output", "XZ") => set_once(&mut self.xz, parse_boolean(value)?),
            ("Output", "QCow2") => set_once(&mut self.qcow2, parse_boolean(value)?),
            ("Output", "Hostname") => set_once(&mut self.hostname, v),

            ("Packages", "Packages") => self.packages.extend(words(value)),
            ("Packages", "WithDocs") => set_once(&mut self.with_docs, parse_boolean(value)?),
            ("Packages", "WithTests") => set_once(&mut self.with_tests, parse_boolean(value)?),
            ("Packages", "Cache") => set_once(&mut self.cache_path, v),
            ("Packages", "ExtraTrees") => self.extra_trees.extend(words(value)),
            ("Packages", "SkeletonTrees") => self.skeleton_trees.extend(words(value)),
            ("Packages", "BuildScript") => set_once(&mut self.build_script, v),
            ("Packages", "BuildSources") => set_once(&mut self.build_sources, v),
            ("Packages", "BuildDirectory") => set_once(&mut self.build_dir, v),
            ("Packages", "BuildPackages") => self.build_packages.extend(words(value)),
            ("Packages", "PostinstallScript") | ("Packages", "PostInstallationScript") => {
                set_once(&mut self.postinst_script, v)
            }
            ("Packages", "WithNetwork") => set_once(&mut self.with_network, parse_boolean(value)?),
            ("Packages", "NSpawnSettings") => set_once(&mut self.nspawn_settings, v),

            ("Partitions", "RootSize") => set_once(&mut self.root_size, v),
            ("Partitions", "ESPSize") => set_once(&mut self.esp_size, v),
            ("Partitions", "SwapSize") => set_once(&mut self.swap_size, v),
            ("Partitions", "HomeSize") => set_once(&mut self.home_size, v),
            ("Partitions", "SrvSize") => set_once(&mut self.srv_size, v),

            ("Validation", "CheckSum") => set_once(&mut self.checksum, parse_boolean(value)?),
            ("Validation", "Sign") => set_once(&mut self.sign, parse_boolean(value)?),
            ("Validation", "Key") => set_once(&mut self.key, v),
            ("Validation", "Bmap") => set_once(&mut self.bmap, parse_boolean(value)?),
            ("Validation", "Password") => set_once(&mut self.password, v),

            ("Host", "ExtraSearchPaths") => {
                for w in value.split_whitespace() {
                    self.extra_search_paths.extend(w.split(':').map(String::from));
                }
            }

            _ => return Ok(false),
        }
        Ok(true)
    }
}

fn is_known_section(section: &str) -> bool {
    matches!(
        section,
        "Distribution" | "Output" | "Packages" | "Partitions" | "Validation" | "Host"
    )
}

/// Parse INI text into `(section, [(key, value)])` in file order.
///
/// `#` and `;` start comment lines, indented lines continue the previous
/// value (joined with a newline), keys are case-sensitive.
pub fn parse_ini(content: &str) -> Vec<(String, Vec<(String, String)>)> {
    let mut sections: Vec<(String, Vec<(String, String)>)> = Vec::new();

    for raw in content.lines() {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }

        let continuation = raw.starts_with(char::is_whitespace);
        if continuation {
            if let Some((_, entries)) = sections.last_mut() {
                if let Some((_, value)) = entries.last_mut() {
                    if !value.is_empty() {
                        value.push('\n');
                    }
                    value.push_str(trimmed);
                    continue;
                }
            }
        }

        if let Some(name) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            sections.push((name.trim().to_string(), Vec::new()));
            continue;
        }

        if let Some((key, value)) = trimmed.split_once('=') {
            if let Some((_, entries)) = sections.last_mut() {
                entries.push((key.trim().to_string(), value.trim().to_string()));
            }
        }
    }

    sections
}
