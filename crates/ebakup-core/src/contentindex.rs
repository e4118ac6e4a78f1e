//! The content index: `db/content`, one record per object in the store.
//!
//! Opening only verifies the settings block; data blocks are verified
//! lazily as iteration reaches them, so one corrupt block spoils exactly
//! that block. Lookups are scans — entries may appear in any block.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, NaiveDateTime};

use crate::blockfile::BlockFile;
use crate::checksum::ChecksumAlgorithm;
use crate::wire;
use ebakup_types::cid::Cid;
use ebakup_types::error::{EbakupError, Result};

pub const CONTENT_MAGIC: &[u8] = b"ebakup content data";

const TAG_CONTENT: u8 = 0xdd;
// Historical entry types: recognized and skipped, never written.
const TAG_OLD_CONTENT: u8 = 0xd0;
const TAG_OLD_CLOSED: u8 = 0xcc;
// Historical per-entry checksum-timeline items: skipped, never written.
const TAG_CK_RESTORED: u8 = 0xa0;
const TAG_CK_CHANGED: u8 = 0xa1;

/// One active entry of the content index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentInfo {
    pub cid: Cid,
    /// The "good" checksum: the digest of the object's bytes at insertion.
    pub checksum: Vec<u8>,
    pub first_seen: NaiveDateTime,
    pub last_seen: NaiveDateTime,
}

impl ContentInfo {
    pub fn added_at(&self) -> NaiveDateTime {
        self.first_seen
    }
}

fn timestamp_to_naive(secs: u32) -> NaiveDateTime {
    DateTime::from_timestamp(i64::from(secs), 0)
        .map(|t| t.naive_utc())
        .unwrap_or_default()
}

fn naive_to_timestamp(t: NaiveDateTime) -> u32 {
    t.and_utc().timestamp().clamp(0, u32::MAX as i64) as u32
}

/// Encode one `0xdd` entry. The composite cid/cksum field carries
/// `max(cidlen, cklen)` octets; the checksum must be a prefix of the cid
/// (or equal to it), which is the only shape this writer produces.
fn encode_entry(info: &ContentInfo) -> Vec<u8> {
    debug_assert!(info.cid.extends(&info.checksum));
    let mut out = vec![TAG_CONTENT];
    wire::write_varuint(&mut out, info.cid.len() as u64);
    wire::write_varuint(&mut out, info.checksum.len() as u64);
    out.extend_from_slice(info.cid.as_bytes());
    wire::write_u32le(&mut out, naive_to_timestamp(info.first_seen));
    wire::write_u32le(&mut out, naive_to_timestamp(info.last_seen));
    out
}

/// Decode the next active entry in a block payload, silently consuming any
/// deprecated entries in the way. `Ok(None)` means the end of the block's
/// entries was reached cleanly.
fn next_entry(payload: &[u8], pos: &mut usize, path: &Path) -> Result<Option<ContentInfo>> {
    loop {
        if *pos >= payload.len() {
            return Ok(None);
        }
        match payload[*pos] {
            0 => {
                if !wire::rest_is_zeros(payload, *pos) {
                    return Err(EbakupError::invalid_format(
                        path,
                        "garbage after entry terminator",
                    ));
                }
                return Ok(None);
            }
            TAG_CONTENT => {
                *pos += 1;
                let truncated = || EbakupError::invalid_format(path, "truncated content entry");
                let cidlen = wire::read_varuint(payload, pos).ok_or_else(truncated)? as usize;
                let cklen = wire::read_varuint(payload, pos).ok_or_else(truncated)? as usize;
                let composite =
                    wire::take(payload, pos, cidlen.max(cklen)).ok_or_else(truncated)?;
                let cid = Cid::from_bytes(&composite[..cidlen]);
                let checksum = composite[..cklen].to_vec();
                let first = wire::read_u32le(payload, pos).ok_or_else(truncated)?;
                let last = wire::read_u32le(payload, pos).ok_or_else(truncated)?;
                skip_ckdata_items(payload, pos, cklen, path)?;
                return Ok(Some(ContentInfo {
                    cid,
                    checksum,
                    first_seen: timestamp_to_naive(first),
                    last_seen: timestamp_to_naive(last),
                }));
            }
            TAG_OLD_CONTENT => {
                *pos += 1;
                let truncated =
                    || EbakupError::invalid_format(path, "truncated deprecated entry");
                let len = wire::read_varuint(payload, pos).ok_or_else(truncated)? as usize;
                wire::take(payload, pos, len + 8).ok_or_else(truncated)?;
            }
            TAG_OLD_CLOSED => {
                *pos += 1;
                let truncated =
                    || EbakupError::invalid_format(path, "truncated deprecated entry");
                let len = wire::read_varuint(payload, pos).ok_or_else(truncated)? as usize;
                wire::take(payload, pos, len).ok_or_else(truncated)?;
            }
            other => {
                return Err(EbakupError::invalid_format(
                    path,
                    format!("unknown content entry type 0x{other:02x}"),
                ));
            }
        }
    }
}

/// Consume any historical `0xa0`/`0xa1` checksum-timeline items trailing an
/// entry. `0xa1` carries a checksum of the entry's `cklen`; both carry two
/// u32 timestamps.
fn skip_ckdata_items(payload: &[u8], pos: &mut usize, cklen: usize, path: &Path) -> Result<()> {
    let truncated = || EbakupError::invalid_format(path, "truncated checksum-timeline item");
    while let Some(&tag) = payload.get(*pos) {
        match tag {
            TAG_CK_CHANGED => {
                *pos += 1;
                wire::take(payload, pos, cklen + 8).ok_or_else(truncated)?;
            }
            TAG_CK_RESTORED => {
                *pos += 1;
                wire::take(payload, pos, 8).ok_or_else(truncated)?;
            }
            _ => break,
        }
    }
    Ok(())
}

/// Scan a block payload and return the offset one past its last entry,
/// deprecated entries included (they are preserved, just never rewritten).
fn used_len(payload: &[u8], path: &Path) -> Result<usize> {
    let mut pos = 0;
    while next_entry(payload, &mut pos, path)?.is_some() {}
    Ok(pos)
}

/// Handle to a content index file. Cheap to create; every read opens the
/// file fresh so iteration is restartable and always sees current data.
pub struct ContentIndexFile {
    path: PathBuf,
}

impl ContentIndexFile {
    pub fn create(path: &Path, algorithm: ChecksumAlgorithm, blocksize: usize) -> Result<()> {
        let file = BlockFile::create(path, CONTENT_MAGIC, &[], algorithm, blocksize)?;
        file.sync()
    }

    /// Open the index: verifies the settings block and refuses unknown
    /// settings, but does not touch data blocks.
    pub fn open(path: &Path) -> Result<ContentIndexFile> {
        let file = BlockFile::open(path)?;
        if file.magic() != CONTENT_MAGIC {
            return Err(EbakupError::invalid_format(
                path,
                format!("unexpected magic '{}'", String::from_utf8_lossy(file.magic())),
            ));
        }
        for (key, _) in file.settings().iter() {
            if key != b"edb-blocksize" && key != b"edb-blocksum" {
                return Err(EbakupError::invalid_format(
                    path,
                    format!("unknown setting '{}'", String::from_utf8_lossy(key)),
                ));
            }
        }
        Ok(ContentIndexFile {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lazy, restartable iteration in file order.
    pub fn entries(&self) -> Result<Entries> {
        let file = BlockFile::open(&self.path)?;
        let count = file.block_count()?;
        Ok(Entries {
            file,
            next_block: 1,
            block_count: count,
            block: Vec::new(),
            pos: 0,
            done: false,
        })
    }

    /// Scan for the entry with exactly this cid.
    pub fn lookup(&self, cid: &Cid) -> Result<Option<ContentInfo>> {
        for info in self.entries()? {
            let info = info?;
            if &info.cid == cid {
                return Ok(Some(info));
            }
        }
        Ok(None)
    }

    /// All entries whose good checksum is `checksum`.
    pub fn lookup_by_checksum(&self, checksum: &[u8]) -> Result<Vec<ContentInfo>> {
        let mut found = Vec::new();
        for info in self.entries()? {
            let info = info?;
            if info.checksum == checksum {
                found.push(info);
            }
        }
        Ok(found)
    }

    /// Append one entry, packing it into the trailing block when it fits.
    /// The caller must hold the write lock (with `main` held first).
    pub fn append(&self, info: &ContentInfo) -> Result<()> {
        let entry = encode_entry(info);
        let mut file = BlockFile::open_writable(&self.path)?;
        if entry.len() > file.data_size() {
            return Err(EbakupError::invalid_format(
                &self.path,
                "entry larger than a block",
            ));
        }
        let count = file.block_count()?;
        if count > 1 {
            let last = count - 1;
            let payload = file.read_block(last)?;
            let used = used_len(&payload, &self.path)?;
            if used + entry.len() <= file.data_size() {
                let mut payload = payload[..used].to_vec();
                payload.extend_from_slice(&entry);
                file.rewrite_block(last, &payload)?;
                file.sync()?;
                return Ok(());
            }
        }
        file.append_block(&entry)?;
        file.sync()?;
        Ok(())
    }

    /// Replace the whole file: write `content.new`, rotate the numbered
    /// generations to `depth`, hardlink the current file as generation 0,
    /// and rename the new file into place. The caller holds the write lock
    /// and must drop it afterwards (the lock now names a replaced file).
    pub fn replace_with(
        &self,
        entries: &[ContentInfo],
        depth: usize,
        algorithm: ChecksumAlgorithm,
        blocksize: usize,
    ) -> Result<()> {
        let new_path = self.path.with_extension("new");
        let _ = fs::remove_file(&new_path);
        let mut new_file =
            BlockFile::create(&new_path, CONTENT_MAGIC, &[], algorithm, blocksize)?;
        let datasize = new_file.data_size();
        let mut block: Vec<u8> = Vec::with_capacity(datasize);
        for info in entries {
            let entry = encode_entry(info);
            if entry.len() > datasize {
                return Err(EbakupError::invalid_format(&self.path, "entry larger than a block"));
            }
            if block.len() + entry.len() > datasize {
                new_file.append_block(&block)?;
                block.clear();
            }
            block.extend_from_slice(&entry);
        }
        if !block.is_empty() {
            new_file.append_block(&block)?;
        }
        new_file.sync()?;
        drop(new_file);

        if depth > 0 {
            for i in (0..depth.saturating_sub(1)).rev() {
                let from = rotation_path(&self.path, i);
                if from.exists() {
                    fs::rename(&from, rotation_path(&self.path, i + 1))?;
                }
            }
            fs::hard_link(&self.path, rotation_path(&self.path, 0))?;
        }
        fs::rename(&new_path, &self.path)?;
        Ok(())
    }

    pub fn mtime(&self) -> Result<SystemTime> {
        Ok(fs::metadata(&self.path)?.modified()?)
    }
}

fn rotation_path(path: &Path, generation: usize) -> PathBuf {
    let mut name = match path.file_name() {
        Some(name) => name.to_os_string(),
        None => std::ffi::OsString::new(),
    };
    name.push(format!(".{generation}"));
    path.with_file_name(name)
}

/// Iterator over index entries in file order. A corrupt block surfaces as
/// one `Err` and ends the iteration; blocks before it were already yielded.
pub struct Entries {
    file: BlockFile,
    next_block: u64,
    block_count: u64,
    block: Vec<u8>,
    pos: usize,
    done: bool,
}

impl Iterator for Entries {
    type Item = Result<ContentInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match next_entry(&self.block, &mut self.pos, self.file.path()) {
                Ok(Some(info)) => return Some(Ok(info)),
                Ok(None) => {
                    if self.next_block >= self.block_count {
                        self.done = true;
                        return None;
                    }
                    match self.file.read_block(self.next_block) {
                        Ok(payload) => {
                            self.next_block += 1;
                            self.block = payload;
                            self.pos = 0;
                        }
                        Err(e) => {
                            self.done = true;
                            return Some(Err(e));
                        }
                    }
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// In-memory view of the index used for deduplication during backup.
/// Remembers the file mtime it was loaded at so the façade can detect a
/// concurrent append and re-read before writing (see the storage module).
pub struct ContentIndexCache {
    infos: Vec<ContentInfo>,
    by_cid: HashMap<Vec<u8>, usize>,
    by_checksum: HashMap<Vec<u8>, Vec<usize>>,
    loaded_mtime: SystemTime,
}

impl ContentIndexCache {
    pub fn load(file: &ContentIndexFile) -> Result<ContentIndexCache> {
        let loaded_mtime = file.mtime()?;
        let mut cache = ContentIndexCache {
            infos: Vec::new(),
            by_cid: HashMap::new(),
            by_checksum: HashMap::new(),
            loaded_mtime,
        };
        for info in file.entries()? {
            let info = info?;
            if cache.by_cid.contains_key(info.cid.as_bytes()) {
                return Err(EbakupError::invalid_format(
                    file.path(),
                    format!("duplicate content id {}", info.cid),
                ));
            }
            cache.insert(info);
        }
        Ok(cache)
    }

    pub fn insert(&mut self, info: ContentInfo) {
        let idx = self.infos.len();
        self.by_cid.insert(info.cid.as_bytes().to_vec(), idx);
        self.by_checksum
            .entry(info.checksum.clone())
            .or_default()
            .push(idx);
        self.infos.push(info);
    }

    pub fn lookup(&self, cid: &Cid) -> Option<&ContentInfo> {
        self.by_cid.get(cid.as_bytes()).map(|&i| &self.infos[i])
    }

    pub fn with_checksum(&self, checksum: &[u8]) -> Vec<&ContentInfo> {
        self.by_checksum
            .get(checksum)
            .map(|v| v.iter().map(|&i| &self.infos[i]).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// True if the file has been modified since this cache was loaded.
    pub fn is_stale(&self, file: &ContentIndexFile) -> Result<bool> {
        Ok(file.mtime()? != self.loaded_mtime)
    }

    /// Refresh the recorded mtime after a write of our own.
    pub fn mark_current(&mut self, file: &ContentIndexFile) -> Result<()> {
        self.loaded_mtime = file.mtime()?;
        Ok(())
    }
}
