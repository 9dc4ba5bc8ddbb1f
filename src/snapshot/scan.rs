//! Source tree scanner.

use super::{EntryKind, SourceEntry, SourceTree};
use crate::error::{Result, TapeStreamError};
use crate::utils::{archive_name, system_time_ns};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Walk every source root and collect regular files and symlinks.
///
/// Symlinks are recorded, not followed. Entries that disappear or cannot be
/// stat'ed while the walk runs are logged and left out; a missing root is a
/// configuration error.
pub fn scan(sources: &[PathBuf]) -> Result<SourceTree> {
    let mut tree = SourceTree::new();

    for root in sources {
        let root = fs::canonicalize(root).map_err(|e| {
            TapeStreamError::config(format!("Source {:?} is not accessible: {}", root, e))
        })?;
        debug!("Scanning {:?}", root);

        for entry in WalkDir::new(&root).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Skipping unreadable path during scan: {}", e);
                    continue;
                }
            };

            let file_type = entry.file_type();
            if file_type.is_dir() {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!("Cannot stat {:?}: {}", entry.path(), e);
                    continue;
                }
            };

            let kind = if file_type.is_symlink() {
                match fs::read_link(entry.path()) {
                    Ok(target) => EntryKind::Symlink {
                        target: target.to_string_lossy().into_owned(),
                    },
                    Err(e) => {
                        warn!("Cannot read link {:?}: {}", entry.path(), e);
                        continue;
                    }
                }
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                debug!("Skipping special file {:?}", entry.path());
                continue;
            };

            let size = match kind {
                EntryKind::File => metadata.len(),
                EntryKind::Symlink { .. } => 0,
            };
            let mtime = metadata.modified().map(system_time_ns).unwrap_or(0);
            let name = archive_name(entry.path());

            tree.insert(
                name.clone(),
                SourceEntry {
                    name,
                    path: entry.path().to_path_buf(),
                    kind,
                    size,
                    mtime,
                },
            );
        }
    }

    debug!("Scan found {} entries", tree.len());
    Ok(tree)
}
