//! Shared test utilities for mkosi tests.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use mkosi::config::{BuildConfig, Settings, Verb};

/// A project directory (where `mkosi.*` files live) in a temporary
/// directory.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    /// Project directory the configuration is resolved against
    pub base: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base = temp_dir.path().join("project");
        fs::create_dir_all(&base).expect("Failed to create project dir");
        Self {
            _temp_dir: temp_dir,
            base,
        }
    }

    /// Settings for `verb` with the distribution pinned, so host detection
    /// never matters.
    pub fn settings(&self, verb: Verb) -> Settings {
        let mut s = Settings::new(verb);
        s.distribution = Some("fedora".to_string());
        s
    }

    /// Layer configuration files under `s` and resolve it.
    pub fn resolve(&self, mut s: Settings) -> anyhow::Result<BuildConfig> {
        s.load_defaults(&self.base)?;
        BuildConfig::resolve_without_secrets(s, &self.base)
    }

    /// Resolve a build configuration adjusted by `f`; panics on error.
    pub fn config(&self, f: impl FnOnce(&mut Settings)) -> BuildConfig {
        let mut s = self.settings(Verb::Build);
        f(&mut s);
        self.resolve(s).expect("settings should resolve")
    }

    /// Resolve against an arbitrary directory, as `-C` does.
    pub fn resolve_in(
        &self,
        dir: &Path,
        f: impl FnOnce(&mut Settings),
    ) -> anyhow::Result<BuildConfig> {
        let mut s = self.settings(Verb::Build);
        f(&mut s);
        s.load_defaults(dir)?;
        BuildConfig::resolve_without_secrets(s, dir)
    }

    /// Write a file below the project directory, creating parents.
    pub fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.base.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent dir");
        }
        fs::write(&path, content).expect("Failed to write file");
        path
    }

    /// Write an executable script below the project directory.
    pub fn write_script(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.write(rel, content);
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .expect("Failed to chmod script");
        path
    }

    pub fn mkdir(&self, rel: &str) -> PathBuf {
        let path = self.base.join(rel);
        fs::create_dir_all(&path).expect("Failed to create dir");
        path
    }
}

/// Create a minimal image tree with account databases.
pub fn create_mock_root(root: &Path) {
    fs::create_dir_all(root.join("etc")).expect("Failed to create etc");
    fs::write(
        root.join("etc/passwd"),
        "root:x:0:0:root:/root:/bin/bash\nbin:x:1:1:bin:/bin:/sbin/nologin\nrootless:x:1000:1000::/home/rootless:/bin/bash\n",
    )
    .expect("Failed to create passwd");
    fs::write(
        root.join("etc/shadow"),
        "root:!locked::0:99999:7:::\nbin:*:18000:0:99999:7:::\n",
    )
    .expect("Failed to create shadow");
}

/// Assert that a file exists.
pub fn assert_file_exists(path: &Path) {
    assert!(path.is_file(), "Expected file to exist: {}", path.display());
}

/// Assert that a file contains the given text.
pub fn assert_file_contains(path: &Path, needle: &str) {
    let content = fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("Failed to read {}: {}", path.display(), e));
    assert!(
        content.contains(needle),
        "Expected {} to contain {:?}, got:\n{}",
        path.display(),
        needle,
        content
    );
}

/// The `MkosiError` exit code of a failed result.
pub fn exit_code<T: std::fmt::Debug>(result: anyhow::Result<T>) -> u8 {
    let err = result.expect_err("expected an error");
    mkosi::error::exit_code_for(&err)
}
