//! The block-framed container every file under `db/` is built on.
//!
//! A file is a sequence of equal-sized blocks, each laid out as
//! `payload | zero padding | checksum`, where the checksum covers payload
//! and padding. Block 0 is the settings block: a magic line followed by
//! `key:value` lines. It declares `edb-blocksize` and `edb-blocksum`, which
//! is why opening starts with a bounded bootstrap scan of the file prefix
//! before the first verified read.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::checksum::ChecksumAlgorithm;
use ebakup_types::error::{EbakupError, Result};

pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Upper bound on the unverified prefix read used to locate the block size.
const BOOTSTRAP_PREFIX: usize = 10_000;

/// The parsed settings block: the magic line plus ordered `key:value`
/// pairs. Keys may repeat.
#[derive(Debug, Clone)]
pub struct Settings {
    magic: Vec<u8>,
    pairs: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Settings {
    pub fn new(magic: &[u8]) -> Self {
        Settings {
            magic: magic.to_vec(),
            pairs: Vec::new(),
        }
    }

    pub fn magic(&self) -> &[u8] {
        &self.magic
    }

    /// Append a `key:value` line. Keys and values must not contain `\n`,
    /// and keys must not contain `:`.
    pub fn append(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(!key.contains(&b'\n') && !key.contains(&b':'));
        debug_assert!(!value.contains(&b'\n'));
        self.pairs.push((key.to_vec(), value.to_vec()));
    }

    /// Replace the value of `key`, or append it if absent.
    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        if let Some(pair) = self.pairs.iter_mut().find(|(k, _)| k == key) {
            pair.1 = value.to_vec();
        } else {
            self.append(key, value);
        }
    }

    /// First value of `key`, if any.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.pairs.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.magic.clone();
        out.push(b'\n');
        for (key, value) in &self.pairs {
            out.extend_from_slice(key);
            out.push(b':');
            out.extend_from_slice(value);
            out.push(b'\n');
        }
        out
    }

    fn decode(payload: &[u8], path: &Path) -> Result<Self> {
        let used = payload
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(payload.len());
        if !crate::wire::rest_is_zeros(payload, used) {
            return Err(EbakupError::invalid_format(
                path,
                "trailing garbage in settings block",
            ));
        }
        let data = &payload[..used];
        let mut lines = data.split(|&b| b == b'\n');
        let magic = lines
            .next()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| EbakupError::invalid_format(path, "no magic line"))?;
        let mut settings = Settings::new(magic);
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let colon = line.iter().position(|&b| b == b':').ok_or_else(|| {
                EbakupError::invalid_format(path, "settings line without a colon")
            })?;
            settings.append(&line[..colon], &line[colon + 1..]);
        }
        Ok(settings)
    }
}

/// An open block-framed file. Read methods verify the block checksum before
/// returning any payload byte; write methods pad and checksum whole blocks.
#[derive(Debug)]
pub struct BlockFile {
    path: PathBuf,
    file: File,
    writable: bool,
    blocksize: usize,
    sumsize: usize,
    algorithm: ChecksumAlgorithm,
    settings: Settings,
}

impl BlockFile {
    /// Create a new file with exclusive creation and write its settings
    /// block: the magic line, `edb-blocksize`, `edb-blocksum`, then any
    /// `extra` settings in order.
    pub fn create(
        path: &Path,
        magic: &[u8],
        extra: &[(&[u8], &[u8])],
        algorithm: ChecksumAlgorithm,
        blocksize: usize,
    ) -> Result<Self> {
        let sumsize = algorithm.digest_len();
        let mut settings = Settings::new(magic);
        settings.append(b"edb-blocksize", blocksize.to_string().as_bytes());
        settings.append(b"edb-blocksum", algorithm.name().as_bytes());
        for (key, value) in extra {
            settings.append(key, value);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    EbakupError::AlreadyExists(path.display().to_string())
                }
                _ => e.into(),
            })?;

        let mut this = BlockFile {
            path: path.to_path_buf(),
            file,
            writable: true,
            blocksize,
            sumsize,
            algorithm,
            settings,
        };
        this.write_settings_block()?;
        Ok(this)
    }

    pub fn open(path: &Path) -> Result<Self> {
        Self::open_inner(path, false)
    }

    pub fn open_writable(path: &Path) -> Result<Self> {
        Self::open_inner(path, true)
    }

    fn open_inner(path: &Path, writable: bool) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    EbakupError::NotFound(path.display().to_string())
                }
                _ => e.into(),
            })?;

        // Bootstrap: an unverified bounded prefix read to learn the block
        // geometry, then a verified read of the aligned first block.
        let mut prefix = vec![0u8; BOOTSTRAP_PREFIX];
        let got = read_up_to(&mut file, &mut prefix)?;
        prefix.truncate(got);
        if prefix.is_empty() {
            return Err(EbakupError::invalid_format(path, "empty file"));
        }

        let blocksize = parse_bootstrap_value(&prefix, b"\nedb-blocksize:", path)?;
        let blocksize: usize = std::str::from_utf8(blocksize)
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&n| n > 0)
            .ok_or_else(|| EbakupError::invalid_format(path, "bad edb-blocksize value"))?;
        let sumname = parse_bootstrap_value(&prefix, b"\nedb-blocksum:", path)?;
        let algorithm = ChecksumAlgorithm::from_name(sumname).ok_or_else(|| {
            EbakupError::invalid_format(
                path,
                format!("unknown block checksum '{}'", String::from_utf8_lossy(sumname)),
            )
        })?;
        let sumsize = algorithm.digest_len();
        if blocksize <= sumsize {
            return Err(EbakupError::invalid_format(path, "block size too small"));
        }

        let size = file.metadata()?.len();
        if size % blocksize as u64 != 0 {
            return Err(EbakupError::invalid_format(
                path,
                "file is not a whole number of blocks",
            ));
        }

        let mut this = BlockFile {
            path: path.to_path_buf(),
            file,
            writable,
            blocksize,
            sumsize,
            algorithm,
            settings: Settings::new(b""),
        };
        let payload = this.read_block(0)?;
        this.settings = Settings::decode(&payload, &this.path)?;

        // The declared settings must agree with what the bootstrap found.
        if this.settings.get(b"edb-blocksize") != Some(blocksize.to_string().as_bytes()) {
            return Err(EbakupError::invalid_format(path, "inconsistent edb-blocksize"));
        }
        if this.settings.get(b"edb-blocksum") != Some(algorithm.name().as_bytes()) {
            return Err(EbakupError::invalid_format(path, "inconsistent edb-blocksum"));
        }
        Ok(this)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn magic(&self) -> &[u8] {
        self.settings.magic()
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn blocksize(&self) -> usize {
        self.blocksize
    }

    /// Payload bytes per block (block size minus checksum).
    pub fn data_size(&self) -> usize {
        self.blocksize - self.sumsize
    }

    pub fn block_count(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len() / self.blocksize as u64)
    }

    /// Read and verify one block, returning its payload region (padding
    /// included). The payload never escapes unverified.
    pub fn read_block(&mut self, index: u64) -> Result<Vec<u8>> {
        let mut block = vec![0u8; self.blocksize];
        self.file.seek(SeekFrom::Start(index * self.blocksize as u64))?;
        let got = read_up_to(&mut self.file, &mut block)?;
        if got == 0 {
            return Err(EbakupError::NotFound(format!(
                "block {index} of '{}'",
                self.path.display()
            )));
        }
        if got != self.blocksize {
            return Err(EbakupError::invalid_format(
                &self.path,
                "file is not a whole number of blocks",
            ));
        }
        let datasize = self.data_size();
        let digest = self.algorithm.digest(&block[..datasize]);
        if digest != block[datasize..] {
            return Err(EbakupError::BlockCorrupt {
                path: self.path.clone(),
                index,
            });
        }
        block.truncate(datasize);
        Ok(block)
    }

    /// Append a finalized block. Partial blocks are never written: the
    /// payload is padded to the full data size and checksummed here.
    pub fn append_block(&mut self, payload: &[u8]) -> Result<u64> {
        let index = self.block_count()?;
        let block = self.seal(payload)?;
        self.file.seek(SeekFrom::Start(index * self.blocksize as u64))?;
        self.file.write_all(&block)?;
        Ok(index)
    }

    /// Rewrite an existing block in place. Only valid on mutable files and
    /// only under a write lock held by the caller.
    pub fn rewrite_block(&mut self, index: u64, payload: &[u8]) -> Result<()> {
        debug_assert!(self.writable);
        if index >= self.block_count()? {
            return Err(EbakupError::NotFound(format!(
                "block {index} of '{}'",
                self.path.display()
            )));
        }
        let block = self.seal(payload)?;
        self.file.seek(SeekFrom::Start(index * self.blocksize as u64))?;
        self.file.write_all(&block)?;
        Ok(())
    }

    /// Mutate the settings and rewrite block 0.
    pub fn update_settings(&mut self, f: impl FnOnce(&mut Settings)) -> Result<()> {
        f(&mut self.settings);
        self.write_settings_block()
    }

    /// Drop all blocks past the first `count`.
    pub fn truncate_blocks(&mut self, count: u64) -> Result<()> {
        debug_assert!(self.writable);
        self.file.set_len(count * self.blocksize as u64)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn write_settings_block(&mut self) -> Result<()> {
        let payload = self.settings.encode();
        let block = self.seal(&payload)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&block)?;
        Ok(())
    }

    fn seal(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let datasize = self.data_size();
        if payload.len() > datasize {
            return Err(EbakupError::invalid_format(
                &self.path,
                format!(
                    "payload of {} bytes exceeds block data size {datasize}",
                    payload.len()
                ),
            ));
        }
        let mut block = Vec::with_capacity(self.blocksize);
        block.extend_from_slice(payload);
        block.resize(datasize, 0);
        let digest = self.algorithm.digest(&block);
        block.extend_from_slice(&digest);
        Ok(block)
    }
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Locate `\nkey:` in the bootstrap prefix and return the value up to the
/// next newline.
fn parse_bootstrap_value<'a>(prefix: &'a [u8], marker: &[u8], path: &Path) -> Result<&'a [u8]> {
    let start = find(prefix, marker).ok_or_else(|| {
        EbakupError::invalid_format(
            path,
            format!(
                "no {} setting in file prefix",
                String::from_utf8_lossy(&marker[1..marker.len() - 1])
            ),
        )
    })? + marker.len();
    let end = prefix[start..]
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| EbakupError::invalid_format(path, "unterminated setting line"))?;
    Ok(&prefix[start..start + end])
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
