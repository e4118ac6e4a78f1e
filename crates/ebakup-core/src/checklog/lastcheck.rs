//! `db/lastcheck`: closed, lexicographic ranges of items last checked at
//! some time. Range endpoints need not name extant items. Overlapping
//! ranges are legal on disk but writes coalesce them.

use std::path::{Path, PathBuf};

use crate::blockfile::BlockFile;
use crate::checklog::timestamp::{CheckTime, CHECK_TIME_LEN};
use crate::checksum::ChecksumAlgorithm;
use crate::wire;
use ebakup_types::error::{EbakupError, Result};

pub const LASTCHECK_MAGIC: &[u8] = b"ebakup last-check data";

const TAG_SNAPSHOTS: u8 = b'B';
const TAG_CONTENTS: u8 = b'C';

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RangeKind {
    /// Ranges over snapshot names.
    Snapshots,
    /// Ranges over content ids.
    Contents,
}

impl RangeKind {
    fn tag(&self) -> u8 {
        match self {
            RangeKind::Snapshots => TAG_SNAPSHOTS,
            RangeKind::Contents => TAG_CONTENTS,
        }
    }
}

/// One entry: a set of closed `[first, last]` ranges checked at `time`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckedRange {
    pub kind: RangeKind,
    pub time: CheckTime,
    pub ranges: Vec<(Vec<u8>, Vec<u8>)>,
}

fn encode_entry(entry: &CheckedRange) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&entry.time.encode());
    for (first, last) in &entry.ranges {
        wire::write_varuint(&mut body, first.len() as u64);
        body.extend_from_slice(first);
        wire::write_varuint(&mut body, last.len() as u64);
        body.extend_from_slice(last);
    }
    let mut out = vec![entry.kind.tag()];
    wire::write_varuint(&mut out, body.len() as u64);
    out.extend_from_slice(&body);
    out
}

fn decode_entry(payload: &[u8], pos: &mut usize, path: &Path) -> Result<Option<CheckedRange>> {
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
    let kind = match tag {
        TAG_SNAPSHOTS => RangeKind::Snapshots,
        TAG_CONTENTS => RangeKind::Contents,
        other => {
            return Err(EbakupError::invalid_format(
                path,
                format!("unknown lastcheck entry type 0x{other:02x}"),
            ));
        }
    };
    *pos += 1;
    let truncated = || EbakupError::invalid_format(path, "truncated lastcheck entry");
    let size = wire::read_varuint(payload, pos).ok_or_else(truncated)? as usize;
    let body = wire::take(payload, pos, size).ok_or_else(truncated)?;

    let mut bpos = 0;
    let time_bytes = wire::take(body, &mut bpos, CHECK_TIME_LEN).ok_or_else(truncated)?;
    let mut fixed = [0u8; CHECK_TIME_LEN];
    fixed.copy_from_slice(time_bytes);
    let time = CheckTime::decode(&fixed)
        .ok_or_else(|| EbakupError::invalid_format(path, "invalid check timestamp"))?;
    let mut ranges = Vec::new();
    while bpos < body.len() {
        let first_len = wire::read_varuint(body, &mut bpos).ok_or_else(truncated)? as usize;
        let first = wire::take(body, &mut bpos, first_len).ok_or_else(truncated)?.to_vec();
        let last_len = wire::read_varuint(body, &mut bpos).ok_or_else(truncated)? as usize;
        let last = wire::take(body, &mut bpos, last_len).ok_or_else(truncated)?.to_vec();
        ranges.push((first, last));
    }
    Ok(Some(CheckedRange { kind, time, ranges }))
}

/// Merge entries that share a kind and time, then merge their overlapping
/// or adjacent-by-equality ranges.
pub fn coalesce(entries: Vec<CheckedRange>) -> Vec<CheckedRange> {
    let mut grouped: Vec<CheckedRange> = Vec::new();
    for entry in entries {
        match grouped
            .iter_mut()
            .find(|g| g.kind == entry.kind && g.time == entry.time)
        {
            Some(group) => group.ranges.extend(entry.ranges),
            None => grouped.push(entry),
        }
    }
    for group in &mut grouped {
        group.ranges.sort();
        let mut merged: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        for (first, last) in group.ranges.drain(..) {
            match merged.last_mut() {
                Some((_, mlast)) if first.as_slice() <= mlast.as_slice() => {
                    if last > *mlast {
                        *mlast = last;
                    }
                }
                _ => merged.push((first, last)),
            }
        }
        group.ranges = merged;
    }
    grouped
}

pub struct LastCheckFile {
    path: PathBuf,
}

impl LastCheckFile {
    pub fn create(path: &Path, algorithm: ChecksumAlgorithm, blocksize: usize) -> Result<()> {
        BlockFile::create(path, LASTCHECK_MAGIC, &[], algorithm, blocksize)?.sync()
    }

    pub fn open(path: &Path) -> Result<LastCheckFile> {
        let file = BlockFile::open(path)?;
        if file.magic() != LASTCHECK_MAGIC {
            return Err(EbakupError::invalid_format(
                path,
                format!("unexpected magic '{}'", String::from_utf8_lossy(file.magic())),
            ));
        }
        Ok(LastCheckFile {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<Vec<CheckedRange>> {
        let mut file = BlockFile::open(&self.path)?;
        let mut entries = Vec::new();
        for index in 1..file.block_count()? {
            let payload = file.read_block(index)?;
            let mut pos = 0;
            while let Some(entry) = decode_entry(&payload, &mut pos, &self.path)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Replace the recorded ranges with the coalesced form of `entries`.
    /// Blocks are rewritten in place; the caller holds the write lock.
    pub fn write(&self, entries: Vec<CheckedRange>) -> Result<()> {
        let entries = coalesce(entries);
        let mut file = BlockFile::open_writable(&self.path)?;
        let datasize = file.data_size();

        let mut blocks: Vec<Vec<u8>> = Vec::new();
        let mut current: Vec<u8> = Vec::new();
        for entry in &entries {
            let encoded = encode_entry(entry);
            if encoded.len() > datasize {
                return Err(EbakupError::invalid_format(
                    &self.path,
                    "lastcheck entry larger than a block",
                ));
            }
            if current.len() + encoded.len() > datasize {
                blocks.push(std::mem::take(&mut current));
            }
            current.extend_from_slice(&encoded);
        }
        if !current.is_empty() {
            blocks.push(current);
        }

        let existing = file.block_count()?;
        for (i, block) in blocks.iter().enumerate() {
            let index = i as u64 + 1;
            if index < existing {
                file.rewrite_block(index, block)?;
            } else {
                file.append_block(block)?;
            }
        }
        file.truncate_blocks(blocks.len() as u64 + 1)?;
        file.sync()
    }
}
