//! Per-invocation build state shared by the pipeline stages.

use std::path::{Path, PathBuf};

use crate::config::{BuildConfig, RootPassword};
use crate::gpt::PartitionNumbers;

/// Which of the four build passes is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pass {
    /// Development pass that executes the build script inside the image.
    pub run_build_script: bool,
    /// Pass that only produces a reusable cache snapshot.
    pub for_cache: bool,
}

impl Pass {
    pub const fn new(run_build_script: bool, for_cache: bool) -> Self {
        Self {
            run_build_script,
            for_cache,
        }
    }

    /// The pass that produces the shipped artifact.
    pub const FINAL: Pass = Pass::new(false, false);
}

/// Shared context for all build operations.
///
/// The configuration is immutable; the remaining fields are set once per
/// invocation (umask, machine id) or updated as the image is laid out.
pub struct BuildContext {
    pub config: BuildConfig,
    /// Umask captured when the mount namespace was set up.
    pub original_umask: u32,
    /// Hex machine id shared by every nspawn invocation of this run.
    pub machine_id: String,
    /// Partition numbers of the current image layout.
    pub partitions: PartitionNumbers,
    /// Whether the current image carries a partition table.
    pub ran_sfdisk: bool,
    /// Root password action, which an installer may override.
    pub root_password: RootPassword,
    /// Package cache directory actually used for this run.
    pub package_cache: Option<PathBuf>,
}

impl BuildContext {
    /// Create a new build context with a fresh machine id.
    pub fn new(config: BuildConfig, original_umask: u32) -> Self {
        let root_password = config.password.clone();
        let package_cache = config.cache_path.clone();
        Self {
            config,
            original_umask,
            machine_id: uuid::Uuid::new_v4().simple().to_string(),
            partitions: PartitionNumbers::default(),
            ran_sfdisk: false,
            root_password,
            package_cache,
        }
    }

    /// Permission bits for promoted outputs: `0o666` minus the original umask.
    pub fn output_mode(&self) -> u32 {
        0o666 & !self.original_umask
    }

    pub fn output(&self) -> &Path {
        &self.config.output
    }
}
