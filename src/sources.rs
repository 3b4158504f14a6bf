//! Copying build sources into the development image.
//!
//! Sources come either from `git ls-files` (tracked, optionally untracked
//! non-ignored files, submodules included) or from a plain tree walk that
//! skips mkosi's own state directories.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::common::{copy_file, mkdir_last, symlink_f};
use crate::config::{BuildConfig, GitFiles};
use crate::process::Cmd;

fn ls_files_args(git_files: GitFiles) -> Vec<&'static str> {
    let mut args = vec!["ls-files", "-z", "--exclude-standard", "--cached"];
    if git_files == GitFiles::Others {
        args.extend(["--others", "--exclude=.mkosi-*"]);
    }
    args
}

fn ls_files(dir: &Path, git_files: GitFiles) -> Result<BTreeSet<String>> {
    let result = Cmd::new("git")
        .arg("-C")
        .arg_path(dir)
        .args(ls_files_args(git_files))
        .error_msg("git ls-files failed")
        .run()?;
    Ok(parse_nul_list(&result.stdout))
}

fn parse_nul_list(output: &str) -> BTreeSet<String> {
    output
        .split('\0')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Submodule paths from `git submodule status --recursive`.
fn parse_submodules(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(String::from)
        .collect()
}

/// Files git would hand over, relative to `src`.
pub fn git_file_list(src: &Path, git_files: GitFiles) -> Result<BTreeSet<String>> {
    let mut files = ls_files(src, git_files)?;

    let status = Cmd::new("git")
        .arg("-C")
        .arg_path(src)
        .args(["submodule", "status", "--recursive"])
        .error_msg("git submodule status failed")
        .run()?;
    let submodules = parse_submodules(&status.stdout);

    // ls-files lists each submodule as a single entry.
    for sm in &submodules {
        files.remove(sm);
    }
    for sm in &submodules {
        for file in ls_files(&src.join(sm), git_files)? {
            files.insert(format!("{}/{}", sm, file));
        }
    }
    for sm in &submodules {
        files.remove(sm);
    }
    Ok(files)
}

/// Copy every file git knows about from `src` to `dest`.
pub fn copy_git_files(src: &Path, dest: &Path, git_files: GitFiles) -> Result<()> {
    for file in git_file_list(src, git_files)? {
        let from = src.join(&file);
        let to = dest.join(&file);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        // Deleted but still tracked files show up in ls-files too.
        if fs::symlink_metadata(&from).is_err() {
            continue;
        }
        copy_file(&from, &to).with_context(|| format!("Failed to copy {}", file))?;
    }
    Ok(())
}

/// Names never copied by the tree walk: VCS data, mkosi temporaries and
/// the output, cache and build directories.
pub struct SourceFilter {
    names: Vec<String>,
}

impl SourceFilter {
    pub fn new(config: &BuildConfig) -> Self {
        let basename = |p: &Option<PathBuf>, default: &str| {
            p.as_deref()
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| default.to_string())
        };
        Self {
            names: vec![
                ".git".to_string(),
                basename(&config.output_dir, "mkosi.output"),
                basename(&config.cache_path, "mkosi.cache"),
                basename(&config.build_dir, "mkosi.builddir"),
            ],
        }
    }

    pub fn is_ignored(&self, name: &str) -> bool {
        name.starts_with(".mkosi-")
            || name.ends_with(".cache-pre-dev")
            || name.ends_with(".cache-pre-inst")
            || self.names.iter().any(|n| n == name)
    }
}

/// Copy `src` to `dest`, skipping anything the filter rejects at any depth.
pub fn copy_filtered_tree(src: &Path, dest: &Path, filter: &SourceFilter) -> Result<()> {
    mkdir_last(dest, 0o755)?;
    let walker = WalkDir::new(src).min_depth(1).into_iter().filter_entry(|e| {
        !filter.is_ignored(&e.file_name().to_string_lossy())
    });

    for entry in walker {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src)?;
        let target = dest.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            fs::set_permissions(&target, entry.metadata()?.permissions())?;
        } else if file_type.is_symlink() {
            symlink_f(fs::read_link(entry.path())?, &target)?;
        } else if file_type.is_file() {
            copy_file(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Whether sources should be collected through git.
pub fn use_git(config: &BuildConfig, sources: &Path) -> bool {
    config
        .use_git_files
        .unwrap_or_else(|| config.directory.join(".git").exists() || sources.join(".git").exists())
}
