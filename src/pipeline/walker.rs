//! Local tree enumeration for push.
//!
//! Depth-first, directory entries sorted lexicographically before recursing.
//! Symlinks are followed only when they resolve to a regular file; symlinked
//! directories are not descended into.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::types::error::TransferError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    /// Slash-separated path relative to the walk root.
    pub relpath: String,
    pub path: PathBuf,
    pub size: u64,
}

pub fn walk_local_tree(root: &Path) -> Result<Vec<LocalFile>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| {
            TransferError::Io(format!("failed to walk {}", root.display()))
        })?;

        let file_type = entry.file_type();
        let size = if file_type.is_file() {
            entry
                .metadata()
                .with_context(|| {
                    TransferError::Io(format!("failed to stat {}", entry.path().display()))
                })?
                .len()
        } else if file_type.is_symlink() {
            match std::fs::metadata(entry.path()) {
                Ok(resolved) if resolved.is_file() => resolved.len(),
                // Symlinks to directories and broken links are skipped.
                _ => continue,
            }
        } else {
            continue;
        };

        let relpath = entry
            .path()
            .strip_prefix(root)
            .with_context(|| {
                TransferError::Io(format!("failed to relativize {}", entry.path().display()))
            })?
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");
        if relpath.is_empty() {
            continue;
        }

        files.push(LocalFile {
            relpath,
            path: entry.path().to_path_buf(),
            size,
        });
    }

    Ok(files)
}
