//! Summary command - shows the resolved configuration.

use anyhow::Result;

use crate::config::BuildConfig;
use crate::summary;

/// Print the summary, as text on stderr or as JSON on stdout.
pub fn cmd_summary(config: &BuildConfig, json: bool) -> Result<()> {
    if json {
        println!("{}", summary::to_json(config)?);
    } else {
        summary::print_summary(config);
    }
    Ok(())
}
