//! One-way mirroring between storages: after a sync the destination holds
//! every snapshot of the source, with byte-identical manifests and all
//! referenced objects. The source is never mutated; the verification log
//! is storage-local and not synchronized.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::blockfile::BlockFile;
use crate::storage::Storage;
use ebakup_types::cid::Cid;
use ebakup_types::error::{EbakupError, Result};
use ebakup_types::name::SnapshotName;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub snapshots_copied: u64,
    pub objects_copied: u64,
    pub bytes_copied: u64,
}

/// Mirror every snapshot of `source` into the storage at `dest_path`,
/// creating it (with the source's checksum algorithm) if missing.
pub fn sync_to_path(source: &Storage, dest_path: &Path) -> Result<SyncStats> {
    let mut dest = if dest_path.join("db").join("main").exists() {
        Storage::open(dest_path)?
    } else {
        Storage::create_with_algorithm(dest_path, source.checksum_algorithm())?
    };
    sync(source, &mut dest)
}

/// Mirror every snapshot of `source` into `dest`.
pub fn sync(source: &Storage, dest: &mut Storage) -> Result<SyncStats> {
    if source.checksum_algorithm() != dest.checksum_algorithm() {
        return Err(EbakupError::Config(format!(
            "checksum algorithm mismatch: source uses {}, destination uses {}",
            source.checksum_algorithm().name(),
            dest.checksum_algorithm().name()
        )));
    }

    let have: Vec<SnapshotName> = dest.snapshots()?;
    let mut stats = SyncStats::default();

    // Oldest first, so an interrupted sync leaves a clean prefix.
    for name in source.snapshots()? {
        if have.contains(&name) {
            continue;
        }
        debug!(snapshot = %name, "syncing snapshot");
        let manifest = source.snapshot(&name)?;

        // Objects before the manifest that references them: a partial sync
        // must leave the destination self-consistent.
        for cid in manifest.referenced_cids() {
            stats += copy_object(source, dest, cid)?;
        }

        copy_manifest_verbatim(source, dest, &name)?;
        stats.snapshots_copied += 1;
    }
    Ok(stats)
}

fn copy_object(source: &Storage, dest: &mut Storage, cid: &Cid) -> Result<SyncStats> {
    let mut stats = SyncStats::default();
    if let Some(existing) = dest.content_info(cid)? {
        // Same cid must mean same bytes. Trust it when the good checksums
        // agree; anything else is a cross-storage collision we refuse to
        // paper over.
        let source_info = source.content_info(cid)?.ok_or_else(|| {
            EbakupError::ContentMissing(cid.to_hex())
        })?;
        if existing.checksum != source_info.checksum {
            return Err(EbakupError::CidCollision(cid.to_hex()));
        }
        return Ok(stats);
    }

    let source_info = source
        .content_info(cid)?
        .ok_or_else(|| EbakupError::ContentMissing(cid.to_hex()))?;
    let mut body = source.open_content(cid)?;
    let size = body.metadata()?.len();
    let copied = dest.add_content_at(&mut body, source_info.added_at())?;
    if &copied != cid {
        // The destination held different content under our checksum, so
        // the copy came back suffix-extended. The original's uniqueness
        // assumption is broken; surface it rather than rewrite manifests.
        warn!(expected = %cid, got = %copied, "object changed cid during sync");
        return Err(EbakupError::CidCollision(cid.to_hex()));
    }
    stats.objects_copied += 1;
    stats.bytes_copied += size;
    Ok(stats)
}

/// Copy a manifest block-for-block: every source block is checksum-verified
/// on read and the destination file is byte-identical to the source.
fn copy_manifest_verbatim(source: &Storage, dest: &Storage, name: &SnapshotName) -> Result<()> {
    let src_path = source.manifest_path(name);
    let mut src = BlockFile::open(&src_path)?;
    for index in 0..src.block_count()? {
        src.read_block(index)?;
    }
    let raw = fs::read(&src_path)?;

    let year_dir = dest.db_dir().join(name.year_dir());
    fs::create_dir_all(&year_dir)?;
    let final_path = year_dir.join(name.file_name());
    let new_path = year_dir.join(format!("{}.new", name.file_name()));
    if final_path.exists() {
        return Err(EbakupError::AlreadyExists(name.to_string()));
    }
    // A `.new` left by an interrupted sync is reclaimed once it is stale.
    if let Ok(meta) = fs::metadata(&new_path) {
        let age = meta
            .modified()
            .ok()
            .and_then(|m| std::time::SystemTime::now().duration_since(m).ok());
        match age {
            Some(age) if age > crate::storage::STALE_NEW_AGE => {
                warn!(path = %new_path.display(), "reclaiming stale .new manifest");
                fs::remove_file(&new_path)?;
            }
            _ => return Err(EbakupError::ConcurrentWriter(new_path)),
        }
    }

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&new_path)
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                EbakupError::ConcurrentWriter(new_path.clone())
            } else {
                EbakupError::from(e)
            }
        })?;
    let result = (|| -> Result<()> {
        use std::io::Write;
        file.write_all(&raw)?;
        file.sync_all()?;
        fs::hard_link(&new_path, &final_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                EbakupError::AlreadyExists(name.to_string())
            } else {
                EbakupError::from(e)
            }
        })?;
        Ok(())
    })();
    let _ = fs::remove_file(&new_path);
    result
}

impl std::ops::AddAssign for SyncStats {
    fn add_assign(&mut self, other: SyncStats) {
        self.snapshots_copied += other.snapshots_copied;
        self.objects_copied += other.objects_copied;
        self.bytes_copied += other.bytes_copied;
    }
}
