//! Clean command - removes outputs and, with `--force`, caches.

use anyhow::Result;

use crate::clean;
use crate::config::BuildConfig;
use crate::namespace;

/// Execute the clean command.
pub fn cmd_clean(config: &BuildConfig) -> Result<()> {
    namespace::check_root()?;
    clean::unlink_output(config)
}
