//! The storage façade: binds an on-disk directory into a `Storage`, owning
//! the open database handles and the locking discipline. All process-wide
//! state lives here and is threaded through explicitly.

use std::ffi::OsString;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{NaiveDateTime, Utc};
use tracing::{debug, warn};

use crate::blockfile::{BlockFile, DEFAULT_BLOCK_SIZE};
use crate::checklog::{IssuesFile, LastCheckFile};
use crate::checksum::ChecksumAlgorithm;
use crate::contentindex::{ContentIndexCache, ContentIndexFile, ContentInfo};
use crate::lock::{DbLock, LockMode};
use crate::manifest::{FileType, ManifestBuilder, ManifestReader};
use crate::objectstore::{ObjectSpool, ObjectStore};
use ebakup_types::cid::Cid;
use ebakup_types::error::{EbakupError, Result};
use ebakup_types::name::SnapshotName;

pub const MAIN_MAGIC: &[u8] = b"ebakup database v1";

/// A `.new` manifest older than this may be reclaimed.
pub const STALE_NEW_AGE: Duration = Duration::from_secs(2 * 60 * 60);

/// Bounded retries for the content-index append race.
const ADD_RETRIES: usize = 3;

/// An opened backup storage: `db/`, `content/`, `tmp/` under one root.
pub struct Storage {
    root: PathBuf,
    db_dir: PathBuf,
    blocksize: usize,
    block_algorithm: ChecksumAlgorithm,
    checksum_algorithm: ChecksumAlgorithm,
    store: ObjectStore,
    index: ContentIndexFile,
    index_cache: Option<ContentIndexCache>,
}

impl Storage {
    /// Create a new storage at `path` with the default checksum algorithm.
    /// Fails if the directory exists and is non-empty.
    pub fn create(path: &Path) -> Result<Storage> {
        Self::create_with_algorithm(path, ChecksumAlgorithm::default())
    }

    pub fn create_with_algorithm(path: &Path, algorithm: ChecksumAlgorithm) -> Result<Storage> {
        if path.exists() && fs::read_dir(path)?.next().is_some() {
            return Err(EbakupError::AlreadyExists(path.display().to_string()));
        }
        let db_dir = path.join("db");
        fs::create_dir_all(&db_dir)?;
        ObjectStore::create(path)?;

        let main = BlockFile::create(
            &db_dir.join("main"),
            MAIN_MAGIC,
            &[(b"checksum", algorithm.name().as_bytes())],
            algorithm,
            DEFAULT_BLOCK_SIZE,
        )?;
        main.sync()?;
        ContentIndexFile::create(&db_dir.join("content"), algorithm, DEFAULT_BLOCK_SIZE)?;
        LastCheckFile::create(&db_dir.join("lastcheck"), algorithm, DEFAULT_BLOCK_SIZE)?;
        IssuesFile::create(&db_dir.join("issues"), algorithm, DEFAULT_BLOCK_SIZE)?;

        debug!(path = %path.display(), algorithm = algorithm.name(), "created storage");
        Self::open(path)
    }

    /// Open an existing storage. Unknown settings in `db/main` are a
    /// refusal: they signal a format this implementation does not know.
    pub fn open(path: &Path) -> Result<Storage> {
        let db_dir = path.join("db");
        let main = BlockFile::open(&db_dir.join("main"))?;
        if main.magic() != MAIN_MAGIC {
            return Err(EbakupError::invalid_format(
                main.path(),
                format!("unexpected magic '{}'", String::from_utf8_lossy(main.magic())),
            ));
        }
        let mut checksum_algorithm = ChecksumAlgorithm::default();
        for (key, value) in main.settings().iter() {
            match key {
                b"edb-blocksize" | b"edb-blocksum" => {}
                b"checksum" => {
                    checksum_algorithm = ChecksumAlgorithm::from_name(value).ok_or_else(|| {
                        EbakupError::invalid_format(
                            main.path(),
                            format!(
                                "unknown checksum algorithm '{}'",
                                String::from_utf8_lossy(value)
                            ),
                        )
                    })?;
                }
                _ => {
                    return Err(EbakupError::invalid_format(
                        main.path(),
                        format!("unknown setting '{}'", String::from_utf8_lossy(key)),
                    ));
                }
            }
        }

        let index = ContentIndexFile::open(&db_dir.join("content"))?;
        Ok(Storage {
            root: path.to_path_buf(),
            db_dir,
            blocksize: main.blocksize(),
            block_algorithm: main.algorithm(),
            checksum_algorithm,
            store: ObjectStore::new(path),
            index,
            index_cache: None,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_dir(&self) -> &Path {
        &self.db_dir
    }

    pub fn blocksize(&self) -> usize {
        self.blocksize
    }

    pub fn block_algorithm(&self) -> ChecksumAlgorithm {
        self.block_algorithm
    }

    /// The algorithm content ids are derived with.
    pub fn checksum_algorithm(&self) -> ChecksumAlgorithm {
        self.checksum_algorithm
    }

    pub fn object_store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn content_index(&self) -> &ContentIndexFile {
        &self.index
    }

    /// All snapshot names, ordered by start time.
    pub fn snapshots(&self) -> Result<Vec<SnapshotName>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.db_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let year = entry.file_name();
            let Some(year) = year.to_str().filter(|y| y.len() == 4) else {
                continue;
            };
            if !year.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            for file in fs::read_dir(entry.path())? {
                let file = file?;
                if let Some(name) = file
                    .file_name()
                    .to_str()
                    .and_then(|f| SnapshotName::from_parts(year, f))
                {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn manifest_path(&self, name: &SnapshotName) -> PathBuf {
        self.db_dir.join(name.year_dir()).join(name.file_name())
    }

    /// Open the manifest of one snapshot.
    pub fn snapshot(&self, name: &SnapshotName) -> Result<ManifestReader> {
        ManifestReader::open(&self.manifest_path(name))
    }

    /// Begin a new snapshot. Fails with `AlreadyExists` when the minute
    /// slot is taken and `ConcurrentWriter` when a recent `.new` is
    /// present; a stale `.new` is reclaimed first.
    pub fn start_snapshot(&self, start: NaiveDateTime) -> Result<ManifestBuilder> {
        let name = SnapshotName::from_start_time(start);
        let final_path = self.manifest_path(&name);
        if final_path.exists() {
            return Err(EbakupError::AlreadyExists(name.to_string()));
        }
        let new_path = final_path.with_file_name(format!("{}.new", name.file_name()));
        if let Ok(meta) = fs::metadata(&new_path) {
            let age = meta
                .modified()
                .ok()
                .and_then(|m| SystemTime::now().duration_since(m).ok());
            match age {
                Some(age) if age > STALE_NEW_AGE => {
                    warn!(path = %new_path.display(), "reclaiming stale .new manifest");
                    fs::remove_file(&new_path)?;
                }
                _ => return Err(EbakupError::ConcurrentWriter(new_path)),
            }
        }
        ManifestBuilder::create(&self.db_dir, start, self.block_algorithm, self.blocksize)
    }

    /// Add a content stream, returning its cid. Dedup and collision
    /// handling per the object-store add protocol.
    pub fn add_content(&mut self, reader: &mut impl Read) -> Result<Cid> {
        self.add_content_at(reader, Utc::now().naive_utc())
    }

    pub fn add_content_at(&mut self, reader: &mut impl Read, now: NaiveDateTime) -> Result<Cid> {
        let mut spool = ObjectSpool::new(self.store.tmp_dir(), self.checksum_algorithm);
        spool.fill_from(reader)?;
        let (checksum, spooled) = spool.finish()?;

        let mut attempt = 0;
        loop {
            let _lock = match DbLock::file(&self.db_dir, "content", LockMode::Exclusive) {
                Err(EbakupError::StaleReplaced(path)) if attempt < ADD_RETRIES => {
                    attempt += 1;
                    debug!(path = %path.display(), attempt, "content index replaced under us; retrying");
                    continue;
                }
                other => other?,
            };

            // Re-read the index if it changed since our cache was built;
            // another process may have inserted entries in between.
            let stale = match &self.index_cache {
                Some(cache) => cache.is_stale(&self.index)?,
                None => true,
            };
            if stale {
                self.index_cache = Some(ContentIndexCache::load(&self.index)?);
            }
            let cache = match self.index_cache.as_mut() {
                Some(cache) => cache,
                None => unreachable!(),
            };

            // Identical content already present?
            for candidate in cache.with_checksum(&checksum) {
                if self.store.matches(&candidate.cid, &spooled)? {
                    let cid = candidate.cid.clone();
                    spooled.discard();
                    return Ok(cid);
                }
            }

            // A colliding checksum gets the shortest fresh suffix.
            let cid = allocate_cid(&checksum, cache);
            if cid.len() > checksum.len() {
                warn!(
                    checksum = %hex::encode(&checksum),
                    cid = %cid,
                    "checksum collision; extended content id"
                );
            }

            if self.store.exists(&cid) {
                // An unreferenced body from an interrupted add. Reuse it
                // when it matches, reclaim it otherwise.
                if self.store.matches(&cid, &spooled)? {
                    spooled.discard();
                } else {
                    warn!(cid = %cid, "replacing orphan object body");
                    fs::remove_file(self.store.path_for(&cid))?;
                    self.store.place(&cid, spooled)?;
                }
            } else {
                self.store.place(&cid, spooled)?;
            }

            let info = ContentInfo {
                cid: cid.clone(),
                checksum,
                first_seen: now,
                last_seen: now,
            };
            self.index.append(&info)?;
            cache.insert(info);
            cache.mark_current(&self.index)?;
            return Ok(cid);
        }
    }

    /// Look up one content item, under a read lock.
    pub fn content_info(&self, cid: &Cid) -> Result<Option<ContentInfo>> {
        let _lock = DbLock::file(&self.db_dir, "content", LockMode::Shared)?;
        self.index.lookup(cid)
    }

    /// Open an object body for reading.
    pub fn open_content(&self, cid: &Cid) -> Result<fs::File> {
        self.store.open(cid)
    }

    /// Recompute an object's digest and compare it to the recorded good
    /// checksum.
    pub fn verify_content(&self, info: &ContentInfo) -> Result<bool> {
        let seen = self
            .store
            .compute_checksum(&info.cid, self.checksum_algorithm)?;
        Ok(seen == info.checksum)
    }

    pub fn lastcheck(&self) -> Result<LastCheckFile> {
        LastCheckFile::open(&self.db_dir.join("lastcheck"))
    }

    pub fn issues(&self) -> Result<IssuesFile> {
        IssuesFile::open(&self.db_dir.join("issues"))
    }

    /// Take the storage-wide lock needed to mutate a verification log file.
    pub fn lock_log(&self, name: &str) -> Result<DbLock> {
        DbLock::file(&self.db_dir, name, LockMode::Exclusive)
    }

    /// Materialize a snapshot as a tree of hard links into the object
    /// store. Symlinks are recreated from their stored target; other
    /// special files are skipped.
    pub fn shadow_copy(&self, name: &SnapshotName, target: &Path) -> Result<ShadowStats> {
        let manifest = self.snapshot(name)?;
        fs::create_dir(target).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                EbakupError::AlreadyExists(target.display().to_string())
            } else {
                EbakupError::from(e)
            }
        })?;

        let mut stats = ShadowStats::default();
        for file in manifest.files() {
            let mut path = target.to_path_buf();
            for component in manifest.path_of(file) {
                path.push(component_to_os(&component));
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            match file.filetype {
                FileType::Regular => {
                    fs::hard_link(self.store.path_for(&file.cid), &path)?;
                    stats.files += 1;
                }
                FileType::Symlink if !file.cid.is_empty() => {
                    let mut body = Vec::new();
                    self.store.open(&file.cid)?.read_to_end(&mut body)?;
                    make_symlink(&body, &path)?;
                    stats.symlinks += 1;
                }
                _ => {
                    debug!(path = %path.display(), "skipping special file in shadow copy");
                    stats.skipped += 1;
                }
            }
        }
        // Empty directories still appear in the tree.
        let mut dir_paths: std::collections::HashMap<u64, PathBuf> = Default::default();
        dir_paths.insert(0, target.to_path_buf());
        let dirs: Vec<_> = manifest.directories().cloned().collect();
        let mut remaining = dirs;
        while !remaining.is_empty() {
            let before = remaining.len();
            remaining.retain(|dir| match dir_paths.get(&dir.parent) {
                Some(parent_path) => {
                    let path = parent_path.join(component_to_os(&dir.name));
                    dir_paths.insert(dir.dirid, path);
                    false
                }
                None => true,
            });
            if remaining.len() == before {
                return Err(EbakupError::invalid_format(
                    manifest.path(),
                    "unknown parent directory",
                ));
            }
        }
        for path in dir_paths.values() {
            fs::create_dir_all(path)?;
        }
        Ok(stats)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShadowStats {
    pub files: u64,
    pub symlinks: u64,
    pub skipped: u64,
}

/// Pick the cid for new content: the checksum itself when free, otherwise
/// extended by the shortest suffix of fresh octets that makes it unique.
fn allocate_cid(checksum: &[u8], cache: &ContentIndexCache) -> Cid {
    let mut candidate = Cid::from_bytes(checksum.to_vec());
    if cache.lookup(&candidate).is_none() {
        return candidate;
    }
    let mut suffix: Vec<u8> = vec![0];
    loop {
        let mut bytes = checksum.to_vec();
        bytes.extend_from_slice(&suffix);
        candidate = Cid::from_bytes(bytes);
        if cache.lookup(&candidate).is_none() {
            return candidate;
        }
        match suffix.last_mut() {
            Some(&mut 255) => suffix.push(0),
            Some(last) => *last += 1,
            None => suffix.push(0),
        }
    }
}

#[cfg(unix)]
pub(crate) fn component_to_os(bytes: &[u8]) -> OsString {
    use std::os::unix::ffi::OsStringExt;
    OsString::from_vec(bytes.to_vec())
}

#[cfg(not(unix))]
pub(crate) fn component_to_os(bytes: &[u8]) -> OsString {
    OsString::from(String::from_utf8_lossy(bytes).into_owned())
}

#[cfg(unix)]
fn make_symlink(target: &[u8], link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(component_to_os(target), link)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_symlink(_target: &[u8], link: &Path) -> Result<()> {
    Err(EbakupError::invalid_format(link, "symlinks unsupported on this platform"))
}
