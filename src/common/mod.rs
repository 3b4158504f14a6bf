//! Shared utilities across mkosi modules.

pub mod files;
pub mod workspace;

pub use files::{
    copy_file, copy_tree, dir_size, empty_directory, mkdir_last, patch_file, symlink_f,
    temp_file_in, unlink_try_hard, write_file_mode, write_file_with_dirs,
};
pub use workspace::Workspace;
