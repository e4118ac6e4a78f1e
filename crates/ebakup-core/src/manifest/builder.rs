//! Building a new manifest through the `.new` + rename protocol.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use tracing::debug;

use crate::blockfile::BlockFile;
use crate::checksum::ChecksumAlgorithm;
use crate::lock::{lock_file, LockMode};
use crate::manifest::{
    encode_directory, encode_extradef, encode_file, encode_key_value, format_time_setting,
    DirectoryEntry, FileEntry, FileType, BACKUP_MAGIC, FIRST_FREE_ID,
};
use ebakup_types::cid::Cid;
use ebakup_types::error::{EbakupError, Result};
use ebakup_types::name::SnapshotName;

/// Accumulates a snapshot's records and writes them out as the three block
/// sets on commit. Directory ids are allocated left-to-right as new parents
/// appear; key-value pairs and extra bundles are interned per manifest.
///
/// The `.new` file created here is the exclusion token: it is written
/// without further locking and either renamed to the final name on commit
/// or removed on drop.
pub struct ManifestBuilder {
    file: BlockFile,
    new_path: PathBuf,
    final_path: PathBuf,
    name: SnapshotName,
    datasize: usize,
    def_entries: Vec<Vec<u8>>,
    data_blocks: Vec<Vec<u8>>,
    current: Vec<u8>,
    directories: HashMap<Vec<Vec<u8>>, u64>,
    next_dirid: u64,
    kv_ids: HashMap<(Vec<u8>, Vec<u8>), u64>,
    next_kvid: u64,
    x_ids: HashMap<Vec<u64>, u64>,
    next_xid: u64,
    committed: bool,
}

impl ManifestBuilder {
    /// Create the `.new` manifest for a snapshot starting at `start`.
    ///
    /// Fails with `AlreadyExists` when the minute slot is taken and
    /// `ConcurrentWriter` when a `.new` file is already present (staleness
    /// reclaim is the storage façade's concern, before it calls this).
    pub(crate) fn create(
        db_dir: &Path,
        start: NaiveDateTime,
        algorithm: ChecksumAlgorithm,
        blocksize: usize,
    ) -> Result<ManifestBuilder> {
        let name = SnapshotName::from_start_time(start);
        let year_dir = db_dir.join(name.year_dir());
        fs::create_dir_all(&year_dir)?;
        let final_path = year_dir.join(name.file_name());
        let new_path = year_dir.join(format!("{}.new", name.file_name()));

        if final_path.exists() {
            return Err(EbakupError::AlreadyExists(name.to_string()));
        }
        let start_setting = format_time_setting(&start);
        let file = BlockFile::create(
            &new_path,
            BACKUP_MAGIC,
            &[(b"start", start_setting.as_bytes())],
            algorithm,
            blocksize,
        )
        .map_err(|e| match e {
            EbakupError::AlreadyExists(_) => EbakupError::ConcurrentWriter(new_path.clone()),
            other => other,
        })?;

        // The write lock is held only around the bootstrap check: once the
        // settings block exists, the `.new` file itself is the exclusion
        // token and the remaining writes happen unlocked.
        {
            let _guard = lock_file(&new_path, LockMode::Exclusive)?;
            if final_path.exists() {
                let _ = fs::remove_file(&new_path);
                return Err(EbakupError::AlreadyExists(name.to_string()));
            }
        }

        let datasize = file.data_size();
        let mut directories = HashMap::new();
        directories.insert(Vec::new(), 0);
        debug!(name = %name, "started manifest");
        Ok(ManifestBuilder {
            file,
            new_path,
            final_path,
            name,
            datasize,
            def_entries: Vec::new(),
            data_blocks: Vec::new(),
            current: Vec::new(),
            directories,
            next_dirid: FIRST_FREE_ID,
            kv_ids: HashMap::new(),
            next_kvid: FIRST_FREE_ID,
            x_ids: HashMap::new(),
            next_xid: FIRST_FREE_ID,
            committed: false,
        })
    }

    pub fn name(&self) -> SnapshotName {
        self.name
    }

    /// Record a file. `path` is the full component path; missing parent
    /// directories are recorded on the way with no extra data.
    #[allow(clippy::too_many_arguments)]
    pub fn add_file(
        &mut self,
        path: &[Vec<u8>],
        cid: &Cid,
        size: u64,
        mtime: NaiveDateTime,
        mtime_nsec: u32,
        filetype: FileType,
        extra: &[(Vec<u8>, Vec<u8>)],
    ) -> Result<()> {
        let (name, parents) = path.split_last().ok_or_else(|| {
            EbakupError::invalid_format(&self.new_path, "empty file path")
        })?;
        let parent = self.intern_directory(parents, 0)?;
        let xid = self.intern_extra(extra);
        let entry = FileEntry {
            parent,
            name: name.clone(),
            cid: cid.clone(),
            size,
            mtime,
            mtime_nsec,
            filetype,
            extra: xid,
        };
        let encoded = encode_file(&entry, &self.new_path)?;
        self.push_data_entry(encoded)
    }

    /// Record a directory explicitly (needed for empty directories or for
    /// directories carrying extra data).
    pub fn add_directory(
        &mut self,
        path: &[Vec<u8>],
        extra: &[(Vec<u8>, Vec<u8>)],
    ) -> Result<u64> {
        let xid = self.intern_extra(extra);
        self.intern_directory(path, xid)
    }

    fn intern_directory(&mut self, path: &[Vec<u8>], xid: u64) -> Result<u64> {
        if let Some(&dirid) = self.directories.get(path) {
            return Ok(dirid);
        }
        // `path` is non-empty here: the root is pre-interned.
        let (name, parents) = match path.split_last() {
            Some(split) => split,
            None => return Ok(0),
        };
        let parent = self.intern_directory(parents, 0)?;
        let dirid = self.next_dirid;
        self.next_dirid += 1;
        self.directories.insert(path.to_vec(), dirid);
        let entry = DirectoryEntry {
            dirid,
            parent,
            name: name.clone(),
            extra: xid,
        };
        self.push_data_entry(encode_directory(&entry))?;
        Ok(dirid)
    }

    fn intern_extra(&mut self, extra: &[(Vec<u8>, Vec<u8>)]) -> u64 {
        if extra.is_empty() {
            return 0;
        }
        let mut kvids: Vec<u64> = extra
            .iter()
            .map(|(key, value)| {
                let pair = (key.clone(), value.clone());
                if let Some(&kvid) = self.kv_ids.get(&pair) {
                    return kvid;
                }
                let kvid = self.next_kvid;
                self.next_kvid += 1;
                self.def_entries.push(encode_key_value(kvid, key, value));
                self.kv_ids.insert(pair, kvid);
                kvid
            })
            .collect();
        kvids.sort_unstable();
        kvids.dedup();
        if let Some(&xid) = self.x_ids.get(&kvids) {
            return xid;
        }
        let xid = self.next_xid;
        self.next_xid += 1;
        self.def_entries.push(encode_extradef(xid, &kvids));
        self.x_ids.insert(kvids, xid);
        xid
    }

    /// Pack a data entry greedily: fill the current block, never split.
    fn push_data_entry(&mut self, entry: Vec<u8>) -> Result<()> {
        if entry.len() > self.datasize {
            return Err(EbakupError::invalid_format(
                &self.new_path,
                "entry larger than a block",
            ));
        }
        if self.current.len() + entry.len() > self.datasize {
            self.data_blocks.push(std::mem::take(&mut self.current));
        }
        self.current.extend_from_slice(&entry);
        Ok(())
    }

    /// Write all blocks, record the `end` setting, fsync and rename the
    /// manifest to its final, immutable name.
    pub fn commit(mut self, end: NaiveDateTime) -> Result<SnapshotName> {
        if !self.current.is_empty() {
            self.data_blocks.push(std::mem::take(&mut self.current));
        }

        // Definitions precede data in file order.
        let mut block = Vec::with_capacity(self.datasize);
        for entry in std::mem::take(&mut self.def_entries) {
            if block.len() + entry.len() > self.datasize {
                self.file.append_block(&block)?;
                block.clear();
            }
            block.extend_from_slice(&entry);
        }
        if !block.is_empty() {
            self.file.append_block(&block)?;
        }
        for data_block in std::mem::take(&mut self.data_blocks) {
            self.file.append_block(&data_block)?;
        }

        let end_setting = format_time_setting(&end);
        self.file
            .update_settings(|s| s.append(b"end", end_setting.as_bytes()))?;
        self.file.sync()?;

        // Link-then-unlink instead of rename: a plain rename would silently
        // overwrite a manifest that appeared in the meantime.
        fs::hard_link(&self.new_path, &self.final_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                EbakupError::AlreadyExists(self.name.to_string())
            } else {
                e.into()
            }
        })?;
        fs::remove_file(&self.new_path)?;
        sync_dir(self.final_path.parent());
        self.committed = true;
        debug!(name = %self.name, blocks = self.file.block_count().unwrap_or(0), "committed manifest");
        Ok(self.name)
    }

    /// Discard the partially written manifest.
    pub fn abort(self) {
        // Drop does the work.
    }
}

impl Drop for ManifestBuilder {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.new_path);
        }
    }
}

#[cfg(unix)]
fn sync_dir(dir: Option<&Path>) {
    if let Some(dir) = dir {
        if let Ok(handle) = fs::File::open(dir) {
            let _ = handle.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: Option<&Path>) {}
