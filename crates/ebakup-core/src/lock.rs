//! Advisory per-file read/write locks for the database directory.
//!
//! Locks compose in one rank order: `db/main` dominates every other lock in
//! `db/`. A holder of more than one lock acquired `main` first and releases
//! it last; `main` is never upgraded from read to write while any other
//! lock is held. After every acquisition the directory entry is re-checked
//! so a lock taken on a file that was atomically replaced in the meantime
//! is detected instead of trusted.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use ebakup_types::error::{EbakupError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Handle to one acquired lock. Released on drop; release errors at that
/// point are ignored deliberately.
#[derive(Debug)]
pub struct FileLock {
    file: std::fs::File,
    path: PathBuf,
    mode: LockMode,
}

impl FileLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Acquire a lock on `path`, blocking until it is granted, then verify the
/// directory entry still names the file we locked.
pub fn lock_file(path: &Path, mode: LockMode) -> Result<FileLock> {
    let file = OpenOptions::new().read(true).open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            EbakupError::NotFound(path.display().to_string())
        } else {
            e.into()
        }
    })?;
    match mode {
        LockMode::Shared => file.lock_shared(),
        LockMode::Exclusive => file.lock_exclusive(),
    }
    .map_err(|_| EbakupError::LockContention(path.to_path_buf()))?;

    let guard = FileLock {
        file,
        path: path.to_path_buf(),
        mode,
    };
    if !is_still_current(&guard)? {
        return Err(EbakupError::StaleReplaced(path.to_path_buf()));
    }
    Ok(guard)
}

/// True if `path` still refers to the file the guard holds open, i.e. the
/// file was not replaced between open and lock grant.
#[cfg(unix)]
fn is_still_current(guard: &FileLock) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let held = guard.file.metadata()?;
    let current = match std::fs::metadata(&guard.path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    Ok(held.dev() == current.dev() && held.ino() == current.ino())
}

#[cfg(not(unix))]
fn is_still_current(_guard: &FileLock) -> Result<bool> {
    Ok(true)
}

/// A lock on one database file plus the mandatory `main` rank lock.
///
/// Field order is the release order: the specific file first, `main` last.
#[derive(Debug)]
pub struct DbLock {
    _file: Option<FileLock>,
    _main: FileLock,
}

impl DbLock {
    /// Lock `db/main` itself.
    pub fn main(db_dir: &Path, mode: LockMode) -> Result<DbLock> {
        Ok(DbLock {
            _file: None,
            _main: lock_file(&db_dir.join("main"), mode)?,
        })
    }

    /// Lock `db/<name>` in `mode`, holding `main` shared for the duration.
    pub fn file(db_dir: &Path, name: &str, mode: LockMode) -> Result<DbLock> {
        let main = lock_file(&db_dir.join("main"), LockMode::Shared)?;
        let file = lock_file(&db_dir.join(name), mode)?;
        Ok(DbLock {
            _file: Some(file),
            _main: main,
        })
    }
}
