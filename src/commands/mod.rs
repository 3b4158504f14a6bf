//! CLI verb handlers.
//!
//! - `build` - build the image (also used by `shell`/`boot`/`qemu` when the
//!   output is missing)
//! - `clean` - remove outputs and caches
//! - `show` - the `summary` verb
//! - `run` - `shell`, `boot`, `qemu` and `withmount`

pub mod build;
pub mod clean;
pub mod run;
pub mod show;

use anyhow::Result;

use crate::config::{BuildConfig, Verb};

pub use build::cmd_build;
pub use clean::cmd_clean;
pub use run::{cmd_qemu, cmd_shell, cmd_withmount};
pub use show::cmd_summary;

/// Run the verb the configuration was resolved for.
pub fn dispatch(config: BuildConfig, json: bool) -> Result<()> {
    match config.verb {
        Verb::Clean => cmd_clean(&config),
        Verb::Summary => cmd_summary(&config, json),
        Verb::Withmount => cmd_withmount(config),
        Verb::Build | Verb::Shell | Verb::Boot | Verb::Qemu => {
            let verb = config.verb;
            let config = cmd_build(config)?;
            match verb {
                Verb::Shell | Verb::Boot => cmd_shell(&config),
                Verb::Qemu => cmd_qemu(&config),
                _ => Ok(()),
            }
        }
    }
}
