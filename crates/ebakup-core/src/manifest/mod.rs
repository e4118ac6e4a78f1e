//! Per-snapshot manifest files: `db/YYYY/MM-DDThh:mm`.
//!
//! A manifest carries three block sets in order: the settings block, the
//! definition blocks (interned key-value pairs and extra-data bundles) and
//! the data blocks (directories and files). Manifests are immutable once
//! their final name exists.

pub mod builder;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};

use crate::blockfile::BlockFile;
use crate::wire;
use ebakup_types::cid::Cid;
use ebakup_types::error::{EbakupError, Result};

pub use builder::ManifestBuilder;

pub const BACKUP_MAGIC: &[u8] = b"ebakup backup data";

/// Ids 0..=7 are reserved in every id space; 0 is the virtual root
/// directory and the "no extra data" bundle.
pub const FIRST_FREE_ID: u64 = 8;

const TAG_KEY_VALUE: u8 = 0x21;
const TAG_EXTRADEF: u8 = 0x22;
const TAG_DIR: u8 = 0x90;
const TAG_FILE: u8 = 0x91;
const TAG_DIR_EXTRA: u8 = 0x92;
const TAG_FILE_EXTRA: u8 = 0x93;
const TAG_FILE_SPECIAL: u8 = 0x94;

/// File-type codes for special-file records. Regular files carry no code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Unknown,
    Symlink,
    Socket,
    Pipe,
    Device,
}

impl FileType {
    pub fn code(&self) -> Option<u8> {
        match self {
            FileType::Regular => None,
            FileType::Unknown => Some(b'?'),
            FileType::Symlink => Some(b'L'),
            FileType::Socket => Some(b'S'),
            FileType::Pipe => Some(b'P'),
            FileType::Device => Some(b'D'),
        }
    }

    pub fn from_code(code: u8) -> Option<FileType> {
        match code {
            b'?' => Some(FileType::Unknown),
            b'L' => Some(FileType::Symlink),
            b'S' => Some(FileType::Socket),
            b'P' => Some(FileType::Pipe),
            b'D' => Some(FileType::Device),
            _ => None,
        }
    }
}

/// A directory record. Names are raw bytes: UTF-8 when the source was,
/// preserved verbatim when it was not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub dirid: u64,
    pub parent: u64,
    pub name: Vec<u8>,
    pub extra: u64,
}

/// A file record. `cid` is empty for content-less special files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub parent: u64,
    pub name: Vec<u8>,
    pub cid: Cid,
    pub size: u64,
    pub mtime: NaiveDateTime,
    pub mtime_nsec: u32,
    pub filetype: FileType,
    pub extra: u64,
}

pub(crate) fn encode_directory(entry: &DirectoryEntry) -> Vec<u8> {
    let mut out = vec![if entry.extra == 0 { TAG_DIR } else { TAG_DIR_EXTRA }];
    wire::write_varuint(&mut out, entry.dirid);
    wire::write_varuint(&mut out, entry.parent);
    wire::write_varuint(&mut out, entry.name.len() as u64);
    out.extend_from_slice(&entry.name);
    if entry.extra != 0 {
        wire::write_varuint(&mut out, entry.extra);
    }
    out
}

pub(crate) fn encode_file(entry: &FileEntry, path: &Path) -> Result<Vec<u8>> {
    let tag = match (entry.filetype, entry.extra) {
        (FileType::Regular, 0) => TAG_FILE,
        (FileType::Regular, _) => TAG_FILE_EXTRA,
        _ => TAG_FILE_SPECIAL,
    };
    let mut out = vec![tag];
    wire::write_varuint(&mut out, entry.parent);
    wire::write_varuint(&mut out, entry.name.len() as u64);
    out.extend_from_slice(&entry.name);
    wire::write_varuint(&mut out, entry.cid.len() as u64);
    out.extend_from_slice(entry.cid.as_bytes());
    wire::write_varuint(&mut out, entry.size);
    let mtime = wire::encode_mtime(&entry.mtime, entry.mtime_nsec)
        .ok_or_else(|| EbakupError::invalid_format(path, "mtime out of representable range"))?;
    out.extend_from_slice(&mtime);
    if tag == TAG_FILE_SPECIAL {
        // Regular never reaches here, so code() is always present.
        out.push(entry.filetype.code().unwrap_or(b'?'));
    }
    if tag != TAG_FILE {
        wire::write_varuint(&mut out, entry.extra);
    }
    Ok(out)
}

pub(crate) fn encode_key_value(kvid: u64, key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = vec![TAG_KEY_VALUE];
    wire::write_varuint(&mut out, kvid);
    wire::write_varuint(&mut out, key.len() as u64);
    out.extend_from_slice(key);
    wire::write_varuint(&mut out, value.len() as u64);
    out.extend_from_slice(value);
    out
}

pub(crate) fn encode_extradef(xid: u64, kvids: &[u64]) -> Vec<u8> {
    let mut out = vec![TAG_EXTRADEF];
    wire::write_varuint(&mut out, xid);
    wire::write_varuint(&mut out, kvids.len() as u64);
    for &kvid in kvids {
        wire::write_varuint(&mut out, kvid);
    }
    out
}

enum Entry {
    KeyValue(u64, Vec<u8>, Vec<u8>),
    ExtraDef(u64, Vec<u64>),
    Directory(DirectoryEntry),
    File(FileEntry),
}

impl Entry {
    fn is_definition(&self) -> bool {
        matches!(self, Entry::KeyValue(..) | Entry::ExtraDef(..))
    }
}

fn decode_entry(payload: &[u8], pos: &mut usize, path: &Path) -> Result<Option<Entry>> {
    if *pos >= payload.len() {
        return Ok(None);
    }
    let tag = payload[*pos];
    if tag == 0 {
        if !wire::rest_is_zeros(payload, *pos) {
            return Err(EbakupError::invalid_format(path, "garbage after entry terminator"));
        }
        return Ok(None);
    }
    *pos += 1;
    let truncated = || EbakupError::invalid_format(path, format!("truncated 0x{tag:02x} entry"));
    match tag {
        TAG_KEY_VALUE => {
            let kvid = wire::read_varuint(payload, pos).ok_or_else(truncated)?;
            let keylen = wire::read_varuint(payload, pos).ok_or_else(truncated)? as usize;
            let key = wire::take(payload, pos, keylen).ok_or_else(truncated)?.to_vec();
            let vallen = wire::read_varuint(payload, pos).ok_or_else(truncated)? as usize;
            let value = wire::take(payload, pos, vallen).ok_or_else(truncated)?.to_vec();
            Ok(Some(Entry::KeyValue(kvid, key, value)))
        }
        TAG_EXTRADEF => {
            let xid = wire::read_varuint(payload, pos).ok_or_else(truncated)?;
            let count = wire::read_varuint(payload, pos).ok_or_else(truncated)? as usize;
            let mut kvids = Vec::with_capacity(count);
            for _ in 0..count {
                kvids.push(wire::read_varuint(payload, pos).ok_or_else(truncated)?);
            }
            Ok(Some(Entry::ExtraDef(xid, kvids)))
        }
        TAG_DIR | TAG_DIR_EXTRA => {
            let dirid = wire::read_varuint(payload, pos).ok_or_else(truncated)?;
            let parent = wire::read_varuint(payload, pos).ok_or_else(truncated)?;
            let namelen = wire::read_varuint(payload, pos).ok_or_else(truncated)? as usize;
            let name = wire::take(payload, pos, namelen).ok_or_else(truncated)?.to_vec();
            let extra = if tag == TAG_DIR_EXTRA {
                wire::read_varuint(payload, pos).ok_or_else(truncated)?
            } else {
                0
            };
            Ok(Some(Entry::Directory(DirectoryEntry {
                dirid,
                parent,
                name,
                extra,
            })))
        }
        TAG_FILE | TAG_FILE_EXTRA | TAG_FILE_SPECIAL => {
            let parent = wire::read_varuint(payload, pos).ok_or_else(truncated)?;
            let namelen = wire::read_varuint(payload, pos).ok_or_else(truncated)? as usize;
            let name = wire::take(payload, pos, namelen).ok_or_else(truncated)?.to_vec();
            let cidlen = wire::read_varuint(payload, pos).ok_or_else(truncated)? as usize;
            let cid = Cid::from_bytes(wire::take(payload, pos, cidlen).ok_or_else(truncated)?);
            let size = wire::read_varuint(payload, pos).ok_or_else(truncated)?;
            let mtime_bytes = wire::take(payload, pos, 9).ok_or_else(truncated)?;
            let mut fixed = [0u8; 9];
            fixed.copy_from_slice(mtime_bytes);
            let (mtime, mtime_nsec) = wire::decode_mtime(&fixed)
                .ok_or_else(|| EbakupError::invalid_format(path, "invalid mtime encoding"))?;
            let filetype = if tag == TAG_FILE_SPECIAL {
                let code = *payload.get(*pos).ok_or_else(truncated)?;
                *pos += 1;
                FileType::from_code(code).ok_or_else(|| {
                    EbakupError::invalid_format(path, format!("unknown file type 0x{code:02x}"))
                })?
            } else {
                FileType::Regular
            };
            let extra = if tag != TAG_FILE {
                wire::read_varuint(payload, pos).ok_or_else(truncated)?
            } else {
                0
            };
            Ok(Some(Entry::File(FileEntry {
                parent,
                name,
                cid,
                size,
                mtime,
                mtime_nsec,
                filetype,
                extra,
            })))
        }
        other => Err(EbakupError::invalid_format(
            path,
            format!("unknown manifest entry type 0x{other:02x}"),
        )),
    }
}

fn parse_time_setting(value: &[u8], key: &str, path: &Path) -> Result<NaiveDateTime> {
    let bad = || EbakupError::invalid_format(path, format!("bad '{key}' setting"));
    let s = std::str::from_utf8(value).map_err(|_| bad())?;
    // YYYY-MM-DDThh:mm:ss
    let bytes = s.as_bytes();
    if bytes.len() != 19 || bytes[4] != b'-' || bytes[7] != b'-' || bytes[10] != b'T' {
        return Err(bad());
    }
    let field = |range: std::ops::Range<usize>| -> Result<u32> {
        s[range].parse().map_err(|_| bad())
    };
    let (year, month, day) = (field(0..4)?, field(5..7)?, field(8..10)?);
    let (hour, minute, second) = (field(11..13)?, field(14..16)?, field(17..19)?);
    NaiveDate::from_ymd_opt(year as i32, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .ok_or_else(bad)
}

pub(crate) fn format_time_setting(t: &NaiveDateTime) -> String {
    t.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// A fully parsed, finalized manifest.
#[derive(Debug)]
pub struct ManifestReader {
    path: PathBuf,
    start: NaiveDateTime,
    end: NaiveDateTime,
    directories: HashMap<u64, DirectoryEntry>,
    files: Vec<FileEntry>,
    kvdefs: HashMap<u64, (Vec<u8>, Vec<u8>)>,
    xdefs: HashMap<u64, Vec<u64>>,
    child_dirs: HashMap<u64, Vec<u64>>,
    child_files: HashMap<u64, Vec<usize>>,
}

impl ManifestReader {
    pub fn open(path: &Path) -> Result<ManifestReader> {
        let mut file = BlockFile::open(path)?;
        if file.magic() != BACKUP_MAGIC {
            return Err(EbakupError::invalid_format(
                path,
                format!("unexpected magic '{}'", String::from_utf8_lossy(file.magic())),
            ));
        }
        let mut start = None;
        let mut end = None;
        for (key, value) in file.settings().iter() {
            match key {
                b"edb-blocksize" | b"edb-blocksum" => {}
                b"start" => start = Some(parse_time_setting(value, "start", path)?),
                b"end" => end = Some(parse_time_setting(value, "end", path)?),
                _ => {
                    return Err(EbakupError::invalid_format(
                        path,
                        format!("unknown setting '{}'", String::from_utf8_lossy(key)),
                    ));
                }
            }
        }
        let start = start
            .ok_or_else(|| EbakupError::invalid_format(path, "no 'start' setting"))?;
        let end = end.ok_or_else(|| EbakupError::invalid_format(path, "no 'end' setting"))?;

        let mut this = ManifestReader {
            path: path.to_path_buf(),
            start,
            end,
            directories: HashMap::new(),
            files: Vec::new(),
            kvdefs: HashMap::new(),
            xdefs: HashMap::new(),
            child_dirs: HashMap::new(),
            child_files: HashMap::new(),
        };

        // Definition blocks first, then data blocks; a block never mixes
        // the two kinds.
        let mut in_data = false;
        let count = file.block_count()?;
        for index in 1..count {
            let payload = file.read_block(index)?;
            let mut pos = 0;
            let mut block_kind: Option<bool> = None; // Some(true) = definitions
            while let Some(entry) = decode_entry(&payload, &mut pos, path)? {
                let is_def = entry.is_definition();
                match block_kind {
                    None => {
                        if is_def && in_data {
                            return Err(EbakupError::invalid_format(
                                path,
                                "definition block after data blocks",
                            ));
                        }
                        if !is_def {
                            in_data = true;
                        }
                        block_kind = Some(is_def);
                    }
                    Some(kind) if kind != is_def => {
                        return Err(EbakupError::invalid_format(
                            path,
                            "mixed definition and data entries in one block",
                        ));
                    }
                    Some(_) => {}
                }
                this.add_entry(entry)?;
            }
        }

        this.link_tree()?;
        Ok(this)
    }

    fn add_entry(&mut self, entry: Entry) -> Result<()> {
        match entry {
            Entry::KeyValue(kvid, key, value) => {
                if kvid < FIRST_FREE_ID || self.kvdefs.insert(kvid, (key, value)).is_some() {
                    return Err(EbakupError::invalid_format(
                        &self.path,
                        format!("bad key-value id {kvid}"),
                    ));
                }
            }
            Entry::ExtraDef(xid, kvids) => {
                if xid < FIRST_FREE_ID || self.xdefs.insert(xid, kvids).is_some() {
                    return Err(EbakupError::invalid_format(
                        &self.path,
                        format!("bad extra-data id {xid}"),
                    ));
                }
            }
            Entry::Directory(dir) => {
                if dir.dirid < FIRST_FREE_ID {
                    return Err(EbakupError::invalid_format(
                        &self.path,
                        format!("reserved directory id {}", dir.dirid),
                    ));
                }
                if dir.parent != 0 && dir.parent < FIRST_FREE_ID {
                    return Err(EbakupError::invalid_format(
                        &self.path,
                        format!("reserved parent id {}", dir.parent),
                    ));
                }
                let dirid = dir.dirid;
                if self.directories.insert(dirid, dir).is_some() {
                    return Err(EbakupError::invalid_format(
                        &self.path,
                        format!("duplicate directory id {dirid}"),
                    ));
                }
            }
            Entry::File(file) => {
                if file.parent != 0 && file.parent < FIRST_FREE_ID {
                    return Err(EbakupError::invalid_format(
                        &self.path,
                        format!("reserved parent id {}", file.parent),
                    ));
                }
                if file.cid.is_empty() && file.filetype == FileType::Regular {
                    return Err(EbakupError::invalid_format(
                        &self.path,
                        format!(
                            "regular file '{}' without content",
                            String::from_utf8_lossy(&file.name)
                        ),
                    ));
                }
                self.files.push(file);
            }
        }
        Ok(())
    }

    /// Build the child maps, checking that every parent exists, every name
    /// is unique within its directory, every extra reference resolves, and
    /// the directory graph is a tree rooted at id 0.
    fn link_tree(&mut self) -> Result<()> {
        for dir in self.directories.values() {
            if dir.parent != 0 && !self.directories.contains_key(&dir.parent) {
                return Err(EbakupError::invalid_format(
                    &self.path,
                    format!("directory {} has unknown parent {}", dir.dirid, dir.parent),
                ));
            }
            self.resolve_extra(dir.extra)?;
            self.child_dirs.entry(dir.parent).or_default().push(dir.dirid);
        }

        // Acyclicity: every directory must reach the root.
        for dir in self.directories.values() {
            let mut seen = 0u32;
            let mut current = dir.parent;
            while current != 0 {
                seen += 1;
                if seen as usize > self.directories.len() {
                    return Err(EbakupError::invalid_format(
                        &self.path,
                        format!("directory cycle involving id {}", dir.dirid),
                    ));
                }
                current = self.directories[&current].parent;
            }
        }

        for (idx, file) in self.files.iter().enumerate() {
            if file.parent != 0 && !self.directories.contains_key(&file.parent) {
                return Err(EbakupError::invalid_format(
                    &self.path,
                    format!("file '{}' has unknown parent {}",
                        String::from_utf8_lossy(&file.name), file.parent),
                ));
            }
            self.resolve_extra(file.extra)?;
            self.child_files.entry(file.parent).or_default().push(idx);
        }

        for (parent, dirids) in &self.child_dirs {
            let mut names: Vec<&[u8]> = dirids
                .iter()
                .map(|id| self.directories[id].name.as_slice())
                .collect();
            if let Some(files) = self.child_files.get(parent) {
                names.extend(files.iter().map(|&i| self.files[i].name.as_slice()));
            }
            names.sort_unstable();
            if names.windows(2).any(|w| w[0] == w[1]) {
                return Err(EbakupError::invalid_format(
                    &self.path,
                    format!("duplicate name in directory {parent}"),
                ));
            }
        }
        for (_, files) in &self.child_files {
            let mut names: Vec<&[u8]> =
                files.iter().map(|&i| self.files[i].name.as_slice()).collect();
            names.sort_unstable();
            if names.windows(2).any(|w| w[0] == w[1]) {
                return Err(EbakupError::invalid_format(
                    &self.path,
                    "duplicate file name in a directory",
                ));
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn start_time(&self) -> NaiveDateTime {
        self.start
    }

    pub fn end_time(&self) -> NaiveDateTime {
        self.end
    }

    pub fn directories(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.directories.values()
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// Random access by `(parent, name)`.
    pub fn lookup_file(&self, parent: u64, name: &[u8]) -> Option<&FileEntry> {
        self.child_files.get(&parent)?.iter().map(|&i| &self.files[i]).find(|f| f.name == name)
    }

    pub fn lookup_directory(&self, parent: u64, name: &[u8]) -> Option<&DirectoryEntry> {
        self.child_dirs
            .get(&parent)?
            .iter()
            .map(|id| &self.directories[id])
            .find(|d| d.name == name)
    }

    /// Names in a directory, `(directories, files)`, byte-wise sorted.
    pub fn list_directory(&self, dirid: u64) -> (Vec<&[u8]>, Vec<&[u8]>) {
        let mut dirs: Vec<&[u8]> = self
            .child_dirs
            .get(&dirid)
            .map(|ids| ids.iter().map(|id| self.directories[id].name.as_slice()).collect())
            .unwrap_or_default();
        let mut files: Vec<&[u8]> = self
            .child_files
            .get(&dirid)
            .map(|idxs| idxs.iter().map(|&i| self.files[i].name.as_slice()).collect())
            .unwrap_or_default();
        dirs.sort_unstable();
        files.sort_unstable();
        (dirs, files)
    }

    /// Resolve an extra-data bundle to its key-value pairs. Bundle 0 is
    /// the empty bundle.
    pub fn resolve_extra(&self, xid: u64) -> Result<Vec<(&[u8], &[u8])>> {
        if xid == 0 {
            return Ok(Vec::new());
        }
        let kvids = self.xdefs.get(&xid).ok_or_else(|| {
            EbakupError::invalid_format(&self.path, format!("unknown extra-data id {xid}"))
        })?;
        let mut pairs = Vec::with_capacity(kvids.len());
        for kvid in kvids {
            let (key, value) = self.kvdefs.get(kvid).ok_or_else(|| {
                EbakupError::invalid_format(&self.path, format!("unknown key-value id {kvid}"))
            })?;
            pairs.push((key.as_slice(), value.as_slice()));
        }
        Ok(pairs)
    }

    /// Every non-empty cid referenced by this manifest.
    pub fn referenced_cids(&self) -> impl Iterator<Item = &Cid> {
        self.files.iter().map(|f| &f.cid).filter(|cid| !cid.is_empty())
    }

    /// Reconstruct the full path of a file entry as its components.
    pub fn path_of(&self, file: &FileEntry) -> Vec<Vec<u8>> {
        let mut components = vec![file.name.clone()];
        let mut current = file.parent;
        while current != 0 {
            let dir = &self.directories[&current];
            components.push(dir.name.clone());
            current = dir.parent;
        }
        components.reverse();
        components
    }
}
