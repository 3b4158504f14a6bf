//! Build command - produces the image, its sidecars and caches.

use anyhow::Result;
use std::env;
use std::ffi::OsString;

use crate::clean;
use crate::config::{BuildConfig, Verb};
use crate::context::BuildContext;
use crate::namespace;
use crate::output;
use crate::pipeline;
use crate::summary;

/// Whether this invocation has to build. `shell`, `boot` and `qemu` only
/// build when there is no output yet.
pub fn needs_build(config: &BuildConfig) -> bool {
    config.verb == Verb::Build || (config.verb.uses_image() && !config.output.exists())
}

/// `PATH` with the configured extra search paths in front.
pub fn search_path(config: &BuildConfig, current: Option<OsString>) -> Option<OsString> {
    if config.extra_search_paths.is_empty() {
        return current;
    }
    let current = current.unwrap_or_default();
    let paths = config
        .extra_search_paths
        .iter()
        .cloned()
        .chain(env::split_paths(&current));
    env::join_paths(paths).ok()
}

/// Execute the build command. Returns the configuration so `shell`, `boot`
/// and `qemu` can go on with the image.
pub fn cmd_build(config: BuildConfig) -> Result<BuildConfig> {
    namespace::check_root()?;
    clean::unlink_output(&config)?;
    if config.verb == Verb::Build {
        output::check_output(&config)?;
    }

    let build = needs_build(&config);
    if build {
        summary::print_summary(&config);
    }

    if let Some(path) = search_path(&config, env::var_os("PATH")) {
        env::set_var("PATH", path);
    }

    if !build {
        return Ok(config);
    }

    let umask = namespace::init_namespace()?;
    let mut ctx = BuildContext::new(config, umask);
    pipeline::build_stuff(&mut ctx)?;
    output::print_output_size(&ctx.config)?;
    Ok(ctx.config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_needs_build() {
        let temp = TempDir::new().unwrap();
        let build = test_config(temp.path(), |s| s.verb = Verb::Build);
        assert!(needs_build(&build));

        let shell = test_config(temp.path(), |s| s.verb = Verb::Shell);
        assert!(needs_build(&shell));
        fs::write(&shell.output, "").unwrap();
        assert!(!needs_build(&shell));

        let summary = test_config(temp.path(), |s| s.verb = Verb::Summary);
        assert!(!needs_build(&summary));
    }

    #[test]
    fn test_search_path_prepends() {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path(), |s| {
            s.extra_search_paths = vec!["/opt/tools/bin".to_string()];
        });
        let path = search_path(&config, Some(OsString::from("/usr/bin:/bin"))).unwrap();
        let parts: Vec<PathBuf> = env::split_paths(&path).collect();
        assert_eq!(
            parts,
            [PathBuf::from("/opt/tools/bin"), "/usr/bin".into(), "/bin".into()]
        );

        let plain = test_config(temp.path(), |_| {});
        assert_eq!(search_path(&plain, Some("/bin".into())), Some("/bin".into()));
    }
}
