//! Removing outputs and caches.

use anyhow::Result;

use crate::common::{empty_directory, unlink_try_hard};
use crate::config::{BuildConfig, Verb};
use crate::ui::Step;

/// What a forced build or a clean removes beyond the outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanLevel {
    pub build_cache: bool,
    pub package_cache: bool,
}

/// `clean` goes one level further than a forced build for the same number
/// of `--force` flags.
pub fn clean_level(verb: Verb, force_count: u32) -> CleanLevel {
    if verb == Verb::Clean {
        CleanLevel {
            build_cache: force_count > 0,
            package_cache: force_count > 1,
        }
    } else {
        CleanLevel {
            build_cache: force_count > 1,
            package_cache: force_count > 2,
        }
    }
}

/// Remove the output and its sidecars, then caches according to the force
/// level. Nothing happens for an unforced build.
pub fn unlink_output(config: &BuildConfig) -> Result<()> {
    if config.force_count == 0 && config.verb != Verb::Clean {
        return Ok(());
    }

    let step = Step::start("Removing output files");
    for file in config.output_files() {
        unlink_try_hard(file);
    }
    step.finish();

    let level = clean_level(config.verb, config.force_count);

    if level.build_cache {
        let caches: Vec<_> = [&config.cache_pre_dev, &config.cache_pre_inst]
            .into_iter()
            .flatten()
            .collect();
        if !caches.is_empty() {
            let step = Step::start("Removing incremental cache files");
            for cache in caches {
                unlink_try_hard(cache);
            }
            step.finish();
        }

        if let Some(build_dir) = &config.build_dir {
            let step = Step::start("Clearing out build directory");
            empty_directory(build_dir);
            step.finish();
        }
    }

    if level.package_cache {
        if let Some(cache) = &config.cache_path {
            let step = Step::start("Clearing out package cache");
            empty_directory(cache);
            step.finish();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_clean_levels() {
        let none = CleanLevel { build_cache: false, package_cache: false };
        let build = CleanLevel { build_cache: true, package_cache: false };
        let all = CleanLevel { build_cache: true, package_cache: true };

        assert_eq!(clean_level(Verb::Build, 1), none);
        assert_eq!(clean_level(Verb::Build, 2), build);
        assert_eq!(clean_level(Verb::Build, 3), all);
        assert_eq!(clean_level(Verb::Clean, 0), none);
        assert_eq!(clean_level(Verb::Clean, 1), build);
        assert_eq!(clean_level(Verb::Clean, 2), all);
    }

    #[test]
    fn test_unforced_build_keeps_output() {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path(), |_| {});
        fs::write(&config.output, "").unwrap();
        unlink_output(&config).unwrap();
        assert!(config.output.exists());
    }

    #[test]
    fn test_clean_removes_outputs_and_caches() {
        let temp = TempDir::new().unwrap();
        let cache = temp.path().join("pkgcache");
        fs::create_dir_all(cache.join("var")).unwrap();
        let config = test_config(temp.path(), |s| {
            s.verb = Verb::Clean;
            s.force_count = 1;
            s.checksum = Some(true);
            s.cache_path = Some(cache.to_string_lossy().into_owned());
        });
        fs::write(&config.output, "").unwrap();
        fs::write(config.output_checksum.as_ref().unwrap(), "").unwrap();
        fs::write(config.cache_pre_inst.as_ref().unwrap(), "").unwrap();

        unlink_output(&config).unwrap();
        assert!(!config.output.exists());
        assert!(!config.output_checksum.as_ref().unwrap().exists());
        assert!(!config.cache_pre_inst.as_ref().unwrap().exists());
        // A single --force on clean leaves the package cache alone.
        assert!(cache.join("var").exists());
    }
}
