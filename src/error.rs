//! Fatal error categories.
//!
//! Everything in the pipeline propagates `anyhow::Error`; the variants here
//! are the conditions `main` needs to tell apart when choosing an exit status.

use std::path::PathBuf;
use thiserror::Error;

/// A fatal condition that aborts the invocation.
#[derive(Debug, Error)]
pub enum MkosiError {
    /// Invalid flag or setting combination, detected before any resource is touched.
    #[error("{0}")]
    Config(String),

    /// An output (or enabled sidecar) exists and `--force` was not given.
    #[error("Output file {} exists already. (Consider invocation with --force.)", .0.display())]
    OutputExists(PathBuf),

    /// A required external command exited non-zero.
    #[error("{prefix} (exit code {code}){}", stderr_suffix(.stderr))]
    ToolFailed {
        prefix: String,
        code: i32,
        stderr: String,
    },

    /// A required external program could not be found.
    #[error("Couldn't find {tool}. {hint}")]
    ToolNotFound { tool: String, hint: String },

    /// `veritysetup format` did not print a root hash.
    #[error("Root hash not found")]
    RootHashNotFound,

    /// The verb needs root privileges.
    #[error("Must be invoked as root.")]
    NotRoot,

    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MkosiError {
    /// Shorthand for a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Exit status for this error, always within [1, 127].
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 2,
            Self::OutputExists(_) => 3,
            Self::ToolFailed { .. } => 4,
            Self::ToolNotFound { .. } => 5,
            Self::RootHashNotFound => 6,
            Self::NotRoot => 7,
            Self::Io(_) => 1,
        }
    }
}

/// Keep diagnostics on one line: only the last line of stderr is shown.
fn stderr_suffix(stderr: &str) -> String {
    match stderr.trim().lines().last() {
        Some(line) if !line.trim().is_empty() => format!(": {}", line.trim()),
        _ => String::new(),
    }
}

/// Exit status for an arbitrary error chain.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|e| e.downcast_ref::<MkosiError>())
        .map(MkosiError::exit_code)
        .unwrap_or(1)
}
