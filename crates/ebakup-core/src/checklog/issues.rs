//! `db/issues`: per-item history of detected changes.
//!
//! Exactly one history entry exists per item. Updating an entry rewrites
//! the block that owns it; when the grown entry no longer fits, one other
//! entry is spilled from that block to a block with space. Blocks are never
//! re-ordered.

use std::path::{Path, PathBuf};

use crate::blockfile::BlockFile;
use crate::checklog::timestamp::{CheckTime, CHECK_TIME_LEN};
use crate::checksum::ChecksumAlgorithm;
use crate::wire;
use ebakup_types::cid::Cid;
use ebakup_types::error::{EbakupError, Result};

pub const ISSUES_MAGIC: &[u8] = b"ebakup issue data";

const TAG_MANIFEST: u8 = b'B';
const TAG_CONTENT: u8 = b'C';

/// Observed state of an object over one time span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentState {
    /// Believed good.
    Good,
    /// Checksum correct but provenance uncertain.
    ChecksumOk,
    Missing,
    /// Checksum mismatch; carries the checksum that was actually seen.
    Mismatch(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub before: CheckTime,
    pub after: CheckTime,
    pub state: ContentState,
}

/// What a verification pass found wrong with one manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestDetail {
    /// The whole file is bad.
    Bad,
    Blocks {
        /// Blocks now correct that were previously suspect.
        recovered: Vec<u64>,
        /// Blocks whose checksum is good but whose contents are not.
        logical_bad: Vec<u64>,
        /// Referenced cids missing from the content index.
        missing_cids: Vec<Cid>,
        /// Blocks failing their checksum. Mandatory trailer, possibly empty.
        bad_blocks: Vec<u64>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEvent {
    pub before: CheckTime,
    pub after: CheckTime,
    pub rewritten: bool,
    pub detail: ManifestDetail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentIssue {
    pub cid: Cid,
    pub events: Vec<ChangeEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestIssue {
    pub name: Vec<u8>,
    pub events: Vec<ManifestEvent>,
}

/// One history entry: either an object's or a manifest's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueItem {
    Content(ContentIssue),
    Manifest(ManifestIssue),
}

impl IssueItem {
    /// The identity the one-entry-per-item rule is keyed on.
    fn key(&self) -> (u8, &[u8]) {
        match self {
            IssueItem::Content(c) => (TAG_CONTENT, c.cid.as_bytes()),
            IssueItem::Manifest(m) => (TAG_MANIFEST, &m.name),
        }
    }
}

fn push_time(buf: &mut Vec<u8>, time: &CheckTime) {
    buf.extend_from_slice(&time.encode());
}

fn encode_item(item: &IssueItem) -> Vec<u8> {
    let mut body = Vec::new();
    let tag = match item {
        IssueItem::Content(issue) => {
            wire::write_varuint(&mut body, issue.cid.len() as u64);
            body.extend_from_slice(issue.cid.as_bytes());
            for event in &issue.events {
                push_time(&mut body, &event.before);
                push_time(&mut body, &event.after);
                match &event.state {
                    ContentState::Good => body.push(b'g'),
                    ContentState::ChecksumOk => body.push(b'k'),
                    ContentState::Missing => body.push(b'm'),
                    ContentState::Mismatch(checksum) => {
                        body.push(b'w');
                        wire::write_varuint(&mut body, checksum.len() as u64);
                        body.extend_from_slice(checksum);
                    }
                }
            }
            TAG_CONTENT
        }
        IssueItem::Manifest(issue) => {
            wire::write_varuint(&mut body, issue.name.len() as u64);
            body.extend_from_slice(&issue.name);
            for event in &issue.events {
                push_time(&mut body, &event.before);
                push_time(&mut body, &event.after);
                body.push(u8::from(event.rewritten));
                match &event.detail {
                    ManifestDetail::Bad => body.push(b'b'),
                    ManifestDetail::Blocks {
                        recovered,
                        logical_bad,
                        missing_cids,
                        bad_blocks,
                    } => {
                        if !recovered.is_empty() {
                            push_block_list(&mut body, b'k', recovered);
                        }
                        if !logical_bad.is_empty() {
                            push_block_list(&mut body, b'l', logical_bad);
                        }
                        for cid in missing_cids {
                            body.push(b'c');
                            wire::write_varuint(&mut body, cid.len() as u64);
                            body.extend_from_slice(cid.as_bytes());
                        }
                        push_block_list(&mut body, b'w', bad_blocks);
                    }
                }
            }
            TAG_MANIFEST
        }
    };
    let mut out = vec![tag];
    wire::write_varuint(&mut out, body.len() as u64);
    out.extend_from_slice(&body);
    out
}

fn push_block_list(buf: &mut Vec<u8>, tag: u8, blocks: &[u64]) {
    debug_assert!(blocks.windows(2).all(|w| w[0] < w[1]));
    buf.push(tag);
    wire::write_varuint(buf, blocks.len() as u64);
    for &index in blocks {
        wire::write_varuint(buf, index);
    }
}

fn read_time(body: &[u8], pos: &mut usize, path: &Path) -> Result<CheckTime> {
    let bytes = wire::take(body, pos, CHECK_TIME_LEN)
        .ok_or_else(|| EbakupError::invalid_format(path, "truncated issue entry"))?;
    let mut fixed = [0u8; CHECK_TIME_LEN];
    fixed.copy_from_slice(bytes);
    CheckTime::decode(&fixed)
        .ok_or_else(|| EbakupError::invalid_format(path, "invalid check timestamp"))
}

fn read_block_list(body: &[u8], pos: &mut usize, path: &Path) -> Result<Vec<u64>> {
    let truncated = || EbakupError::invalid_format(path, "truncated issue entry");
    let count = wire::read_varuint(body, pos).ok_or_else(truncated)? as usize;
    let mut blocks = Vec::with_capacity(count);
    for _ in 0..count {
        blocks.push(wire::read_varuint(body, pos).ok_or_else(truncated)?);
    }
    if !blocks.windows(2).all(|w| w[0] < w[1]) {
        return Err(EbakupError::invalid_format(
            path,
            "block index list not sorted and unique",
        ));
    }
    Ok(blocks)
}

fn decode_item(payload: &[u8], pos: &mut usize, path: &Path) -> Result<Option<IssueItem>> {
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
    if tag != TAG_CONTENT && tag != TAG_MANIFEST {
        return Err(EbakupError::invalid_format(
            path,
            format!("unknown issue entry type 0x{tag:02x}"),
        ));
    }
    *pos += 1;
    let truncated = || EbakupError::invalid_format(path, "truncated issue entry");
    let size = wire::read_varuint(payload, pos).ok_or_else(truncated)? as usize;
    let body = wire::take(payload, pos, size).ok_or_else(truncated)?;
    let mut bpos = 0;

    if tag == TAG_CONTENT {
        let cidlen = wire::read_varuint(body, &mut bpos).ok_or_else(truncated)? as usize;
        let cid = Cid::from_bytes(wire::take(body, &mut bpos, cidlen).ok_or_else(truncated)?);
        let mut events = Vec::new();
        while bpos < body.len() {
            let before = read_time(body, &mut bpos, path)?;
            let after = read_time(body, &mut bpos, path)?;
            let state = match *body.get(bpos).ok_or_else(truncated)? {
                b'g' => {
                    bpos += 1;
                    ContentState::Good
                }
                b'k' => {
                    bpos += 1;
                    ContentState::ChecksumOk
                }
                b'm' => {
                    bpos += 1;
                    ContentState::Missing
                }
                b'w' => {
                    bpos += 1;
                    let cklen =
                        wire::read_varuint(body, &mut bpos).ok_or_else(truncated)? as usize;
                    let checksum =
                        wire::take(body, &mut bpos, cklen).ok_or_else(truncated)?.to_vec();
                    ContentState::Mismatch(checksum)
                }
                other => {
                    return Err(EbakupError::invalid_format(
                        path,
                        format!("unknown content state 0x{other:02x}"),
                    ));
                }
            };
            events.push(ChangeEvent { before, after, state });
        }
        return Ok(Some(IssueItem::Content(ContentIssue { cid, events })));
    }

    let namelen = wire::read_varuint(body, &mut bpos).ok_or_else(truncated)? as usize;
    let name = wire::take(body, &mut bpos, namelen).ok_or_else(truncated)?.to_vec();
    let mut events = Vec::new();
    while bpos < body.len() {
        let before = read_time(body, &mut bpos, path)?;
        let after = read_time(body, &mut bpos, path)?;
        let rewritten = match *body.get(bpos).ok_or_else(truncated)? {
            0 => false,
            1 => true,
            other => {
                return Err(EbakupError::invalid_format(
                    path,
                    format!("bad rewritten flag 0x{other:02x}"),
                ));
            }
        };
        bpos += 1;
        let detail = if *body.get(bpos).ok_or_else(truncated)? == b'b' {
            bpos += 1;
            ManifestDetail::Bad
        } else {
            let mut recovered = Vec::new();
            let mut logical_bad = Vec::new();
            let mut missing_cids = Vec::new();
            if body.get(bpos) == Some(&b'k') {
                bpos += 1;
                recovered = read_block_list(body, &mut bpos, path)?;
            }
            if body.get(bpos) == Some(&b'l') {
                bpos += 1;
                logical_bad = read_block_list(body, &mut bpos, path)?;
            }
            while body.get(bpos) == Some(&b'c') {
                bpos += 1;
                let cidlen = wire::read_varuint(body, &mut bpos).ok_or_else(truncated)? as usize;
                missing_cids.push(Cid::from_bytes(
                    wire::take(body, &mut bpos, cidlen).ok_or_else(truncated)?,
                ));
            }
            if *body.get(bpos).ok_or_else(truncated)? != b'w' {
                return Err(EbakupError::invalid_format(
                    path,
                    "manifest change event missing its trailer",
                ));
            }
            bpos += 1;
            let bad_blocks = read_block_list(body, &mut bpos, path)?;
            ManifestDetail::Blocks {
                recovered,
                logical_bad,
                missing_cids,
                bad_blocks,
            }
        };
        events.push(ManifestEvent {
            before,
            after,
            rewritten,
            detail,
        });
    }
    Ok(Some(IssueItem::Manifest(ManifestIssue { name, events })))
}

/// The issues file, edited block-locally.
pub struct IssuesFile {
    path: PathBuf,
}

impl IssuesFile {
    pub fn create(path: &Path, algorithm: ChecksumAlgorithm, blocksize: usize) -> Result<()> {
        BlockFile::create(path, ISSUES_MAGIC, &[], algorithm, blocksize)?.sync()
    }

    pub fn open(path: &Path) -> Result<IssuesFile> {
        let file = BlockFile::open(path)?;
        if file.magic() != ISSUES_MAGIC {
            return Err(EbakupError::invalid_format(
                path,
                format!("unexpected magic '{}'", String::from_utf8_lossy(file.magic())),
            ));
        }
        Ok(IssuesFile {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<Vec<IssueItem>> {
        Ok(self.edit()?.blocks.into_iter().flatten().collect())
    }

    /// Load the file into a block-preserving editor. The caller holds the
    /// write lock across `edit` → mutate → `store`.
    pub fn edit(&self) -> Result<IssuesEditor> {
        let mut file = BlockFile::open_writable(&self.path)?;
        let mut blocks = Vec::new();
        for index in 1..file.block_count()? {
            let payload = file.read_block(index)?;
            let mut pos = 0;
            let mut items = Vec::new();
            while let Some(item) = decode_item(&payload, &mut pos, &self.path)? {
                items.push(item);
            }
            blocks.push(items);
        }
        let datasize = file.data_size();
        Ok(IssuesEditor {
            file,
            path: self.path.clone(),
            blocks,
            dirty: Vec::new(),
            datasize,
        })
    }
}

pub struct IssuesEditor {
    file: BlockFile,
    path: PathBuf,
    blocks: Vec<Vec<IssueItem>>,
    dirty: Vec<usize>,
    datasize: usize,
}

impl IssuesEditor {
    pub fn items(&self) -> impl Iterator<Item = &IssueItem> {
        self.blocks.iter().flatten()
    }

    pub fn find_content(&self, cid: &Cid) -> Option<&ContentIssue> {
        self.blocks.iter().flatten().find_map(|item| match item {
            IssueItem::Content(c) if &c.cid == cid => Some(c),
            _ => None,
        })
    }

    pub fn find_manifest(&self, name: &[u8]) -> Option<&ManifestIssue> {
        self.blocks.iter().flatten().find_map(|item| match item {
            IssueItem::Manifest(m) if m.name == name => Some(m),
            _ => None,
        })
    }

    /// Insert or replace the single history entry for an item. The owning
    /// block is rewritten; if the grown entry no longer fits there, one
    /// other entry is spilled to a block with space.
    pub fn upsert(&mut self, item: IssueItem) -> Result<()> {
        let key = {
            let (tag, bytes) = item.key();
            (tag, bytes.to_vec())
        };
        let encoded_len = encode_item(&item).len();
        if encoded_len > self.datasize {
            return Err(EbakupError::invalid_format(&self.path, "issue entry larger than a block"));
        }

        let owner = self
            .blocks
            .iter()
            .position(|items| items.iter().any(|i| i.key() == (key.0, key.1.as_slice())));
        match owner {
            Some(block) => {
                let slot = self.blocks[block]
                    .iter()
                    .position(|i| i.key() == (key.0, key.1.as_slice()))
                    .unwrap_or_default();
                self.blocks[block][slot] = item;
                self.mark_dirty(block);
                while self.encoded_len(block) > self.datasize {
                    // Spill an entry other than the one just updated.
                    let slot = self.blocks[block]
                        .iter()
                        .position(|i| i.key() == (key.0, key.1.as_slice()))
                        .unwrap_or_default();
                    let last = self.blocks[block].len() - 1;
                    let victim = if slot == last { 0 } else { last };
                    let spilled = self.blocks[block].remove(victim);
                    self.place_new(spilled, Some(block))?;
                }
            }
            None => self.place_new(item, None)?,
        }
        Ok(())
    }

    /// Put an entry into the first block with space (skipping `exclude`),
    /// else a new block at the end.
    fn place_new(&mut self, item: IssueItem, exclude: Option<usize>) -> Result<()> {
        let encoded_len = encode_item(&item).len();
        for block in 0..self.blocks.len() {
            if Some(block) == exclude {
                continue;
            }
            if self.encoded_len(block) + encoded_len <= self.datasize {
                self.blocks[block].push(item);
                self.mark_dirty(block);
                return Ok(());
            }
        }
        self.blocks.push(vec![item]);
        self.mark_dirty(self.blocks.len() - 1);
        Ok(())
    }

    fn encoded_len(&self, block: usize) -> usize {
        self.blocks[block].iter().map(|i| encode_item(i).len()).sum()
    }

    fn mark_dirty(&mut self, block: usize) {
        if !self.dirty.contains(&block) {
            self.dirty.push(block);
        }
    }

    /// Write every dirty block back, appending fresh blocks at the end.
    /// New blocks are created in order, so a dirty index past the current
    /// end is always the next one to append.
    pub fn store(&mut self) -> Result<()> {
        let mut dirty = std::mem::take(&mut self.dirty);
        dirty.sort_unstable();
        for block in dirty {
            let mut payload = Vec::with_capacity(self.datasize);
            for item in &self.blocks[block] {
                payload.extend_from_slice(&encode_item(item));
            }
            let index = block as u64 + 1;
            if index < self.file.block_count()? {
                self.file.rewrite_block(index, &payload)?;
            } else {
                self.file.append_block(&payload)?;
            }
        }
        self.file.sync()
    }
}
