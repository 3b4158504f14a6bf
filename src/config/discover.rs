//! Auto-discovery of `mkosi.*` files in the working directory, host
//! distribution detection, and secret acquisition.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::io::{self, BufRead, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::{Distribution, Passphrase, Settings};
use crate::error::MkosiError;

/// Fill in settings that have a conventional file in `base`.
pub fn discover(s: &mut Settings, base: &Path) {
    let has = |name: &str| base.join(name).exists();
    let as_string = |name: &str| base.join(name).to_string_lossy().into_owned();

    if s.nspawn_settings.is_none() && has("mkosi.nspawn") {
        s.nspawn_settings = Some(as_string("mkosi.nspawn"));
    }

    if base.join("mkosi.extra").is_dir() {
        s.extra_trees.push(as_string("mkosi.extra"));
    }
    if base.join("mkosi.extra.tar").is_file() {
        s.extra_trees.push(as_string("mkosi.extra.tar"));
    }
    if base.join("mkosi.skeleton").is_dir() {
        s.skeleton_trees.push(as_string("mkosi.skeleton"));
    }
    if base.join("mkosi.skeleton.tar").is_file() {
        s.skeleton_trees.push(as_string("mkosi.skeleton.tar"));
    }

    if s.build_script.is_none() && has("mkosi.build") {
        s.build_script = Some(as_string("mkosi.build"));
    }
    if s.build_sources.is_none() {
        s.build_sources = Some(base.to_string_lossy().into_owned());
    }
    if s.build_dir.is_none() && base.join("mkosi.builddir").is_dir() {
        s.build_dir = Some(as_string("mkosi.builddir"));
    }
    if s.postinst_script.is_none() && has("mkosi.postinst") {
        s.postinst_script = Some(as_string("mkosi.postinst"));
    }
    if s.output_dir.is_none() && base.join("mkosi.output").is_dir() {
        s.output_dir = Some(as_string("mkosi.output"));
    }

    if s.password.is_none() {
        let rootpw = base.join("mkosi.rootpw");
        if let Ok(content) = fs::read_to_string(&rootpw) {
            require_private_file(&rootpw, "root password");
            s.password = Some(content.trim().to_string());
        }
    }

    if s.secure_boot == Some(true) {
        if s.secure_boot_key.is_none() && has("mkosi.secure-boot.key") {
            s.secure_boot_key = Some(as_string("mkosi.secure-boot.key"));
        }
        if s.secure_boot_certificate.is_none() && has("mkosi.secure-boot.crt") {
            s.secure_boot_certificate = Some(as_string("mkosi.secure-boot.crt"));
        }
    }
}

/// `mkosi.cache/<distro>[~<release>]` when `mkosi.cache/` exists. Clear
/// Linux caches are valid across releases, so they get no suffix.
pub fn find_cache(base: &Path, distribution: Distribution, release: Option<&str>) -> Option<PathBuf> {
    let cache = base.join("mkosi.cache");
    if !cache.exists() {
        return None;
    }

    let mut name = distribution.name().to_string();
    if distribution != Distribution::Clear {
        if let Some(release) = release {
            name.push('~');
            name.push_str(release);
        }
    }
    Some(cache.join(name))
}

/// Warn when a secret file is readable by others.
pub fn require_private_file(path: &Path, description: &str) {
    let Ok(meta) = fs::metadata(path) else {
        return;
    };
    let mode = meta.permissions().mode() & 0o777;
    if mode & 0o007 != 0 {
        warn!(
            "Permissions of '{}' of '{:o}' are too open. When creating {} files use an access mode that restricts access to the owner only.",
            path.display(),
            mode,
            description
        );
    }
}

/// `mkosi.passphrase` if present, otherwise ask twice on the terminal.
pub fn find_passphrase(base: &Path) -> Result<Passphrase> {
    let file = base.join("mkosi.passphrase");
    if file.exists() {
        require_private_file(&file, "passphrase");
        return Ok(Passphrase::File(file));
    }

    loop {
        let passphrase = read_secret("Please enter passphrase: ")?;
        let confirmation = read_secret("Passphrase confirmation: ")?;
        if passphrase == confirmation {
            return Ok(Passphrase::Stdin(passphrase));
        }
        eprintln!("Passphrase doesn't match confirmation. Please try again.");
    }
}

/// Read one line from stdin with terminal echo disabled.
fn read_secret(prompt: &str) -> Result<String> {
    use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg};

    let stdin = io::stdin();
    let saved = tcgetattr(&stdin).ok();
    if let Some(ref original) = saved {
        let mut silent = original.clone();
        silent.local_flags.remove(LocalFlags::ECHO);
        tcsetattr(&stdin, SetArg::TCSANOW, &silent).context("Failed to disable terminal echo")?;
    }

    eprint!("{}", prompt);
    io::stderr().flush().ok();

    let mut line = String::new();
    let read = stdin.lock().read_line(&mut line);

    if let Some(ref original) = saved {
        tcsetattr(&stdin, SetArg::TCSANOW, original).context("Failed to restore terminal echo")?;
        eprintln!();
    }

    if read.context("Failed to read passphrase")? == 0 {
        bail!(MkosiError::config("No passphrase given."));
    }
    Ok(line.trim_end_matches('\n').to_string())
}

/// Distribution and release of the host, from os-release.
pub fn detect_distribution() -> (Option<Distribution>, Option<String>) {
    let content = fs::read_to_string("/etc/os-release")
        .or_else(|_| fs::read_to_string("/usr/lib/os-release"));
    match content {
        Ok(content) => parse_os_release(&content),
        Err(_) => (None, None),
    }
}

/// Parse os-release text. Debian reports its codename, since debootstrap
/// wants codenames rather than version numbers.
pub fn parse_os_release(content: &str) -> (Option<Distribution>, Option<String>) {
    let mut id = None;
    let mut version_id = None;
    let mut version_codename = None;
    let mut extracted_codename = None;

    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').trim_matches('\'').to_string();
        match key {
            "ID" => id = Some(value),
            "VERSION_ID" => version_id = Some(value),
            "VERSION_CODENAME" if !value.is_empty() => version_codename = Some(value),
            "VERSION" => extracted_codename = parenthesized(&value),
            _ => {}
        }
    }

    let id = id.map(|i| if i == "clear-linux-os" { "clear".to_string() } else { i });
    let distribution = id.and_then(|i| i.parse::<Distribution>().ok());

    if distribution == Some(Distribution::Debian) {
        if let Some(codename) = version_codename.or(extracted_codename) {
            version_id = Some(codename);
        }
    }

    (distribution, version_id)
}

/// The text inside the only `(...)` group, if there is exactly one.
fn parenthesized(s: &str) -> Option<String> {
    let mut groups = Vec::new();
    let mut rest = s;
    while let Some(open) = rest.find('(') {
        let after = &rest[open + 1..];
        let Some(close) = after.find(')') else {
            break;
        };
        groups.push(after[..close].to_string());
        rest = &after[close + 1..];
    }
    if groups.len() == 1 {
        groups.pop()
    } else {
        None
    }
}

/// Expand `$VAR`, `${VAR}` and a leading `~`. Paths that reference an
/// undefined variable are dropped.
pub fn expand_paths(paths: &[String]) -> Vec<PathBuf> {
    if paths.is_empty() {
        return Vec::new();
    }

    let mut environ: HashMap<String, String> = std::env::vars().collect();
    if let Ok(sudo_user) = std::env::var("SUDO_USER") {
        if !environ.contains_key("SUDO_HOME") {
            if let Ok(Some(user)) = nix::unistd::User::from_name(&sudo_user) {
                environ.insert("SUDO_HOME".into(), user.dir.to_string_lossy().into_owned());
            }
        }
    }

    paths
        .iter()
        .filter_map(|p| substitute(p, &environ))
        .map(|p| expand_home(&p))
        .collect()
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        if rest.is_empty() || rest.starts_with('/') {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest.trim_start_matches('/'));
            }
        }
    }
    PathBuf::from(path)
}

/// Template substitution where an unknown variable is a failure, not "".
pub fn substitute(template: &str, environ: &HashMap<String, String>) -> Option<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek().map(|&(_, c)| c) {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some('{') => {
                chars.next();
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some((_, '}')) => break,
                        Some((_, c)) => name.push(c),
                        None => return None,
                    }
                }
                out.push_str(environ.get(&name)?);
            }
            Some(c) if c == '_' || c.is_ascii_alphabetic() => {
                let mut name = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c == '_' || c.is_ascii_alphanumeric() {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(environ.get(&name)?);
            }
            _ => return None,
        }
    }

    Some(out)
}
