//! Whole-storage verification: every object is re-digested against its
//! good checksum, every database file is block-verified, and every
//! manifest's cid references are resolved against the content index.
//! Findings go to the verification log; a summary report comes back.

use chrono::NaiveDateTime;
use tracing::{debug, warn};

use crate::blockfile::BlockFile;
use crate::checklog::{
    ChangeEvent, CheckTime, CheckedRange, ContentIssue, ContentState, IssueItem, ManifestDetail,
    ManifestEvent, ManifestIssue, RangeKind,
};
use crate::storage::Storage;
use ebakup_types::cid::Cid;
use ebakup_types::error::{EbakupError, Result};

/// One problem found during verification.
#[derive(Debug)]
pub struct VerifyError {
    pub context: String,
    pub message: String,
}

/// Summary of a verification run.
#[derive(Debug, Default)]
pub struct VerifyReport {
    pub contents_checked: u64,
    pub snapshots_checked: u64,
    pub blocks_checked: u64,
    pub missing_objects: Vec<Cid>,
    pub corrupt_objects: Vec<Cid>,
    pub errors: Vec<VerifyError>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, context: impl Into<String>, message: impl Into<String>) {
        self.errors.push(VerifyError {
            context: context.into(),
            message: message.into(),
        });
    }
}

/// Run a full verification pass over `storage`, recording results in its
/// `lastcheck` and `issues` files.
pub fn verify_storage(storage: &Storage, now: NaiveDateTime) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();
    let check_time = CheckTime::from_datetime(now).unwrap_or_else(CheckTime::unknown);

    let content_range = verify_contents(storage, check_time, &mut report)?;
    let snapshot_range = verify_snapshots(storage, check_time, &mut report)?;
    verify_log_files(storage, &mut report)?;

    // Record what was covered, coalescing with earlier ranges.
    let mut ranges = Vec::new();
    if let Some((first, last)) = content_range {
        ranges.push(CheckedRange {
            kind: RangeKind::Contents,
            time: check_time,
            ranges: vec![(first, last)],
        });
    }
    if let Some((first, last)) = snapshot_range {
        ranges.push(CheckedRange {
            kind: RangeKind::Snapshots,
            time: check_time,
            ranges: vec![(first, last)],
        });
    }
    if !ranges.is_empty() {
        let lastcheck = storage.lastcheck()?;
        let _lock = storage.lock_log("lastcheck")?;
        let mut all = lastcheck.read()?;
        all.extend(ranges);
        lastcheck.write(all)?;
    }

    debug!(
        contents = report.contents_checked,
        snapshots = report.snapshots_checked,
        errors = report.errors.len(),
        "verification finished"
    );
    Ok(report)
}

type ByteRange = Option<(Vec<u8>, Vec<u8>)>;

fn widen(range: &mut ByteRange, value: &[u8]) {
    match range {
        None => *range = Some((value.to_vec(), value.to_vec())),
        Some((first, last)) => {
            if value < first.as_slice() {
                *first = value.to_vec();
            }
            if value > last.as_slice() {
                *last = value.to_vec();
            }
        }
    }
}

/// Check every content item: body present, digest equal to the good
/// checksum. Issues get one history entry per item.
fn verify_contents(
    storage: &Storage,
    check_time: CheckTime,
    report: &mut VerifyReport,
) -> Result<ByteRange> {
    let issues = storage.issues()?;
    let _lock = storage.lock_log("issues")?;
    let mut editor = issues.edit()?;
    let mut range: ByteRange = None;

    for info in storage.content_index().entries()? {
        let info = match info {
            Ok(info) => info,
            Err(e) => {
                report.error("content index", e.to_string());
                break;
            }
        };
        report.contents_checked += 1;
        widen(&mut range, info.cid.as_bytes());

        let state = if !storage.object_store().exists(&info.cid) {
            report.missing_objects.push(info.cid.clone());
            report.error(
                format!("content {}", info.cid),
                "object body missing".to_string(),
            );
            ContentState::Missing
        } else {
            let seen = storage
                .object_store()
                .compute_checksum(&info.cid, storage.checksum_algorithm())?;
            if seen == info.checksum {
                ContentState::Good
            } else {
                warn!(cid = %info.cid, "object checksum mismatch");
                report.corrupt_objects.push(info.cid.clone());
                report.error(
                    format!("content {}", info.cid),
                    "object checksum mismatch".to_string(),
                );
                ContentState::Mismatch(seen)
            }
        };

        let had_issue = editor.find_content(&info.cid).is_some();
        if state == ContentState::Good && !had_issue {
            continue;
        }
        let mut events = editor
            .find_content(&info.cid)
            .map(|issue| issue.events.clone())
            .unwrap_or_default();
        merge_event(&mut events, check_time, state);
        editor.upsert(IssueItem::Content(ContentIssue {
            cid: info.cid.clone(),
            events,
        }))?;
    }
    editor.store()?;
    Ok(range)
}

/// Extend the trailing event when the state is unchanged, else begin a new
/// time span.
fn merge_event(events: &mut Vec<ChangeEvent>, check_time: CheckTime, state: ContentState) {
    match events.last_mut() {
        Some(last) if last.state == state => last.after = check_time,
        _ => events.push(ChangeEvent {
            before: check_time,
            after: check_time,
            state,
        }),
    }
}

/// Block-verify every manifest and resolve its cid references.
fn verify_snapshots(
    storage: &Storage,
    check_time: CheckTime,
    report: &mut VerifyReport,
) -> Result<ByteRange> {
    let issues = storage.issues()?;
    let mut range: ByteRange = None;

    for name in storage.snapshots()? {
        report.snapshots_checked += 1;
        let name_bytes = name.to_string().into_bytes();
        widen(&mut range, &name_bytes);
        let path = storage.manifest_path(&name);

        let mut bad_blocks: Vec<u64> = Vec::new();
        match BlockFile::open(&path) {
            Ok(mut file) => {
                for index in 0..file.block_count()? {
                    report.blocks_checked += 1;
                    match file.read_block(index) {
                        Ok(_) => {}
                        Err(EbakupError::BlockCorrupt { index, .. }) => {
                            report.error(
                                format!("snapshot {name}"),
                                format!("block {index} corrupt"),
                            );
                            bad_blocks.push(index);
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            Err(e) => {
                report.error(format!("snapshot {name}"), e.to_string());
                continue;
            }
        }

        let mut missing_cids: Vec<Cid> = Vec::new();
        if bad_blocks.is_empty() {
            match storage.snapshot(&name) {
                Ok(manifest) => {
                    for cid in manifest.referenced_cids() {
                        if storage.content_index().lookup(cid)?.is_none() {
                            report.error(
                                format!("snapshot {name}"),
                                format!("referenced content {cid} not in index"),
                            );
                            missing_cids.push(cid.clone());
                        }
                    }
                }
                Err(e) => {
                    report.error(format!("snapshot {name}"), e.to_string());
                }
            }
        }

        if bad_blocks.is_empty() && missing_cids.is_empty() {
            continue;
        }
        missing_cids.sort();
        missing_cids.dedup();
        let _lock = storage.lock_log("issues")?;
        let mut editor = issues.edit()?;
        let mut events = editor
            .find_manifest(&name_bytes)
            .map(|issue| issue.events.clone())
            .unwrap_or_default();
        events.push(ManifestEvent {
            before: check_time,
            after: check_time,
            rewritten: false,
            detail: ManifestDetail::Blocks {
                recovered: Vec::new(),
                logical_bad: Vec::new(),
                missing_cids,
                bad_blocks,
            },
        });
        editor.upsert(IssueItem::Manifest(ManifestIssue {
            name: name_bytes,
            events,
        }))?;
        editor.store()?;
    }
    Ok(range)
}

/// Block-verify the mutable database files themselves.
fn verify_log_files(storage: &Storage, report: &mut VerifyReport) -> Result<()> {
    for file_name in ["main", "content", "lastcheck", "issues"] {
        let path = storage.db_dir().join(file_name);
        let mut file = match BlockFile::open(&path) {
            Ok(file) => file,
            Err(e) => {
                report.error(format!("db/{file_name}"), e.to_string());
                continue;
            }
        };
        for index in 0..file.block_count()? {
            report.blocks_checked += 1;
            match file.read_block(index) {
                Ok(_) => {}
                Err(EbakupError::BlockCorrupt { index, .. }) => {
                    report.error(format!("db/{file_name}"), format!("block {index} corrupt"));
                }
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}
