//! The filesystem walker feeding the storage engine: yields each regular
//! file and symlink under a source tree together with the metadata the
//! manifest records.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use tracing::{debug, warn};
use walkdir::WalkDir;

use ebakup_types::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Symlink,
}

/// One walked item, ready to be fed to the snapshot builder.
#[derive(Debug)]
pub struct WalkedFile {
    /// Absolute path components, root slash stripped.
    pub components: Vec<Vec<u8>>,
    pub path: PathBuf,
    pub size: u64,
    pub mtime: NaiveDateTime,
    pub mtime_nsec: u32,
    pub kind: FileKind,
    /// Unix permission bits, when the platform has them.
    pub mode: Option<u32>,
}

/// Walk `source`, calling `visit` for every backable item. Unreadable
/// entries are logged and skipped rather than failing the whole backup
/// tree; other file types (sockets, fifos, devices) are skipped too.
pub fn walk_source(source: &Path, visit: &mut dyn FnMut(WalkedFile) -> Result<()>) -> Result<()> {
    let root = std::fs::canonicalize(source)?;
    for entry in WalkDir::new(&root).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("skipping unreadable entry: {e}");
                continue;
            }
        };
        let file_type = entry.file_type();
        let kind = if file_type.is_file() {
            FileKind::Regular
        } else if file_type.is_symlink() {
            FileKind::Symlink
        } else {
            if !file_type.is_dir() {
                debug!(path = %entry.path().display(), "skipping special file");
            }
            continue;
        };

        let meta = match std::fs::symlink_metadata(entry.path()) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %entry.path().display(), "skipping: {e}");
                continue;
            }
        };
        let (mtime, mtime_nsec) = match meta.modified() {
            Ok(modified) => {
                let stamp: DateTime<Utc> = modified.into();
                let naive = stamp.naive_utc();
                (
                    naive.with_nanosecond(0).unwrap_or(naive),
                    stamp.timestamp_subsec_nanos(),
                )
            }
            Err(_) => (NaiveDateTime::default(), 0),
        };

        visit(WalkedFile {
            components: path_components(entry.path()),
            path: entry.path().to_path_buf(),
            size: meta.len(),
            mtime,
            mtime_nsec,
            kind,
            mode: unix_mode(&meta),
        })?;
    }
    Ok(())
}

fn path_components(path: &Path) -> Vec<Vec<u8>> {
    path.components()
        .filter_map(|component| match component {
            std::path::Component::Normal(part) => Some(os_bytes(part)),
            _ => None,
        })
        .collect()
}

#[cfg(unix)]
fn os_bytes(part: &std::ffi::OsStr) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    part.as_bytes().to_vec()
}

#[cfg(not(unix))]
fn os_bytes(part: &std::ffi::OsStr) -> Vec<u8> {
    part.to_string_lossy().into_owned().into_bytes()
}

#[cfg(unix)]
fn unix_mode(meta: &std::fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.mode() & 0o7777)
}

#[cfg(not(unix))]
fn unix_mode(_meta: &std::fs::Metadata) -> Option<u32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_files_and_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("a.txt"), b"aaa").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("a.txt", dir.path().join("sub").join("link")).unwrap();

        let mut seen = Vec::new();
        walk_source(dir.path(), &mut |file| {
            seen.push((file.components.clone(), file.kind));
            Ok(())
        })
        .unwrap();

        let files: Vec<_> = seen
            .iter()
            .filter(|(_, kind)| *kind == FileKind::Regular)
            .collect();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0.last().unwrap(), b"a.txt");
        // Components reach back to the filesystem root.
        assert!(files[0].0.len() > 2);

        #[cfg(unix)]
        assert!(seen.iter().any(|(_, kind)| *kind == FileKind::Symlink));
    }

    #[test]
    fn regular_file_metadata_is_captured() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"12345").unwrap();
        let mut sizes = Vec::new();
        walk_source(dir.path(), &mut |file| {
            sizes.push(file.size);
            assert!(file.mode.is_some() || cfg!(not(unix)));
            Ok(())
        })
        .unwrap();
        assert_eq!(sizes, vec![5]);
    }
}
