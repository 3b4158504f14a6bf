//! mkosi library exports.
//!
//! The binary in `main.rs` is a thin CLI over these modules; integration
//! tests in `tests/` use them directly.

pub mod boot;
pub mod btrfs;
pub mod cache;
pub mod clean;
pub mod commands;
pub mod common;
pub mod config;
pub mod context;
pub mod distro;
pub mod error;
pub mod filesystem;
pub mod gpt;
pub mod image;
pub mod loopdev;
pub mod luks;
pub mod namespace;
pub mod nspawn;
pub mod output;
pub mod pipeline;
pub mod process;
pub mod qemu;
pub mod sources;
pub mod summary;
pub mod tree;
pub mod ui;
pub mod verity;
