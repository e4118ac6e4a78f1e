//! The content-addressed object store under `<root>/content/`.
//!
//! Object paths are derived from the cid alone: two hex digits, two hex
//! digits, then the remaining hex digits as the file name, so siblings in
//! one directory always have equal name lengths and the derivation is
//! recomputable. Bodies are immutable; placement goes through a temporary
//! file in `<root>/tmp/` that is fsynced and then linked into place, never
//! overwriting.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::checksum::{ChecksumAlgorithm, Checksummer};
use ebakup_types::cid::Cid;
use ebakup_types::error::{EbakupError, Result};

/// Streams larger than this spill from memory to a file under `tmp/`.
pub const SPILL_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Chunk size for comparisons and verification reads.
const READ_SIZE: usize = 10 * 1024 * 1024;

pub struct ObjectStore {
    content_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl ObjectStore {
    pub fn new(root: &Path) -> ObjectStore {
        ObjectStore {
            content_dir: root.join("content"),
            tmp_dir: root.join("tmp"),
        }
    }

    pub fn create(root: &Path) -> Result<ObjectStore> {
        let store = ObjectStore::new(root);
        fs::create_dir_all(&store.content_dir)?;
        fs::create_dir_all(&store.tmp_dir)?;
        Ok(store)
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// The object body path for a cid.
    pub fn path_for(&self, cid: &Cid) -> PathBuf {
        let bytes = cid.as_bytes();
        debug_assert!(bytes.len() > 2, "cids are at least a whole digest");
        let first = hex::encode(&bytes[..1]);
        let second = hex::encode(&bytes[1..2]);
        let rest = hex::encode(&bytes[2..]);
        self.content_dir.join(first).join(second).join(rest)
    }

    pub fn exists(&self, cid: &Cid) -> bool {
        self.path_for(cid).exists()
    }

    /// Open an object body for reading.
    pub fn open(&self, cid: &Cid) -> Result<File> {
        let path = self.path_for(cid);
        File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EbakupError::ContentMissing(cid.to_hex())
            } else {
                e.into()
            }
        })
    }

    pub fn size(&self, cid: &Cid) -> Result<u64> {
        let path = self.path_for(cid);
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EbakupError::ContentMissing(cid.to_hex()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Recompute the digest of the stored body. Used by verification; every
    /// full read compares against the recorded good checksum.
    pub fn compute_checksum(&self, cid: &Cid, algorithm: ChecksumAlgorithm) -> Result<Vec<u8>> {
        let mut file = self.open(cid)?;
        let mut hasher = algorithm.hasher();
        let mut buf = vec![0u8; READ_SIZE];
        loop {
            let got = file.read(&mut buf)?;
            if got == 0 {
                break;
            }
            hasher.update(&buf[..got]);
        }
        Ok(hasher.finalize())
    }

    /// Byte-for-byte comparison of spooled data against a stored object.
    pub fn matches(&self, cid: &Cid, spool: &SpooledContent) -> Result<bool> {
        let path = self.path_for(cid);
        let mut stored = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if stored.metadata()?.len() != spool.len() {
            return Ok(false);
        }
        let mut reader = spool.reader()?;
        let mut ours = vec![0u8; READ_SIZE];
        let mut theirs = vec![0u8; READ_SIZE];
        loop {
            let got = fill(&mut reader, &mut ours)?;
            if got == 0 {
                return Ok(true);
            }
            let stored_got = fill(&mut stored, &mut theirs[..got])?;
            if stored_got != got || ours[..got] != theirs[..got] {
                return Ok(false);
            }
        }
    }

    /// Move a finished spool into place as the body of `cid`. The body is
    /// fsynced before it becomes visible; the placement itself refuses to
    /// overwrite.
    pub fn place(&self, cid: &Cid, spool: SpooledContent) -> Result<()> {
        let target = self.path_for(cid);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = spool.into_tmp_file(&self.tmp_dir)?;
        let result = fs::hard_link(&tmp_path, &target).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                EbakupError::AlreadyExists(target.display().to_string())
            } else {
                EbakupError::from(e)
            }
        });
        let _ = fs::remove_file(&tmp_path);
        result
    }
}

fn fill(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Bounded-memory spool for an incoming content stream: bytes accumulate in
/// memory up to the spill threshold, then move to a temporary file. A
/// rolling checksum is maintained either way, so the candidate cid is ready
/// the moment the stream ends.
pub struct ObjectSpool {
    tmp_dir: PathBuf,
    threshold: u64,
    hasher: Checksummer,
    len: u64,
    mem: Vec<u8>,
    spill: Option<(File, PathBuf)>,
}

impl ObjectSpool {
    pub fn new(tmp_dir: &Path, algorithm: ChecksumAlgorithm) -> ObjectSpool {
        Self::with_threshold(tmp_dir, algorithm, SPILL_THRESHOLD)
    }

    pub fn with_threshold(
        tmp_dir: &Path,
        algorithm: ChecksumAlgorithm,
        threshold: u64,
    ) -> ObjectSpool {
        ObjectSpool {
            tmp_dir: tmp_dir.to_path_buf(),
            threshold,
            hasher: algorithm.hasher(),
            len: 0,
            mem: Vec::new(),
            spill: None,
        }
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.hasher.update(data);
        self.len += data.len() as u64;
        if self.spill.is_none() && self.len > self.threshold {
            let path = fresh_tmp_path(&self.tmp_dir);
            fs::create_dir_all(&self.tmp_dir)?;
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)?;
            file.write_all(&self.mem)?;
            self.mem = Vec::new();
            self.spill = Some((file, path));
        }
        match &mut self.spill {
            Some((file, _)) => file.write_all(data)?,
            None => self.mem.extend_from_slice(data),
        }
        Ok(())
    }

    /// Drain a reader into the spool.
    pub fn fill_from(&mut self, reader: &mut impl Read) -> Result<()> {
        let mut buf = vec![0u8; 1024 * 1024];
        loop {
            let got = match reader.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.write(&buf[..got])?;
        }
    }

    /// Finish the stream: the digest is the candidate cid.
    pub fn finish(self) -> Result<(Vec<u8>, SpooledContent)> {
        let ObjectSpool {
            hasher,
            len,
            mem,
            spill,
            ..
        } = self;
        let checksum = hasher.finalize();
        Ok((
            checksum,
            SpooledContent {
                len,
                data: match spill {
                    Some((file, path)) => SpoolData::File(file, path),
                    None => SpoolData::Memory(mem),
                },
            },
        ))
    }
}

enum SpoolData {
    Memory(Vec<u8>),
    File(File, PathBuf),
}

/// A completed spool: the authoritative bytes of a candidate object.
pub struct SpooledContent {
    len: u64,
    data: SpoolData,
}

impl SpooledContent {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A reader over the spooled bytes, restartable per call.
    pub fn reader(&self) -> Result<SpoolReader<'_>> {
        match &self.data {
            SpoolData::Memory(mem) => Ok(SpoolReader::Memory(&mem[..])),
            SpoolData::File(file, _) => {
                let mut file = file.try_clone()?;
                file.seek(SeekFrom::Start(0))?;
                Ok(SpoolReader::File(file))
            }
        }
    }

    /// Land the bytes in a freshly named, fsynced file under `tmp_dir`.
    fn into_tmp_file(self, tmp_dir: &Path) -> Result<PathBuf> {
        match self.data {
            SpoolData::File(file, path) => {
                file.sync_all()?;
                Ok(path)
            }
            SpoolData::Memory(mem) => {
                fs::create_dir_all(tmp_dir)?;
                let path = fresh_tmp_path(tmp_dir);
                let mut file = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&path)?;
                file.write_all(&mem)?;
                file.sync_all()?;
                Ok(path)
            }
        }
    }

    /// Remove any temporary file backing the spool.
    pub fn discard(self) {
        if let SpoolData::File(_, path) = self.data {
            let _ = fs::remove_file(path);
        }
    }
}

pub enum SpoolReader<'a> {
    Memory(&'a [u8]),
    File(File),
}

impl Read for SpoolReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            SpoolReader::Memory(slice) => slice.read(buf),
            SpoolReader::File(file) => file.read(buf),
        }
    }
}

fn fresh_tmp_path(tmp_dir: &Path) -> PathBuf {
    tmp_dir.join(format!("in-{:032x}.new", rand::random::<u128>()))
}
