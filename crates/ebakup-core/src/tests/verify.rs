use crate::checklog::{ContentState, IssueItem, ManifestDetail, RangeKind};
use crate::manifest::FileType;
use crate::storage::Storage;
use crate::testutil::{dt, flip_bit};
use crate::verify::verify_storage;
use ebakup_types::cid::Cid;

fn storage_with_backup(root: &std::path::Path) -> (Storage, Cid) {
    let mut storage = Storage::create(root).unwrap();
    let start = dt(2025, 9, 1, 2, 0, 0);
    let cid = storage.add_content_at(&mut &b"verify me"[..], start).unwrap();
    let mut builder = storage.start_snapshot(start).unwrap();
    builder
        .add_file(
            &[b"file.txt".to_vec()],
            &cid,
            9,
            start,
            0,
            FileType::Regular,
            &[],
        )
        .unwrap();
    builder.commit(dt(2025, 9, 1, 2, 1, 0)).unwrap();
    (storage, cid)
}

#[test]
fn clean_storage_verifies_clean() {
    let dir = tempfile::tempdir().unwrap();
    let (storage, _) = storage_with_backup(&dir.path().join("store"));

    let report = verify_storage(&storage, dt(2025, 9, 2, 0, 0, 0)).unwrap();
    assert!(report.is_clean(), "errors: {:?}", report.errors);
    assert_eq!(report.contents_checked, 1);
    assert_eq!(report.snapshots_checked, 1);

    // Coverage was recorded for both item kinds.
    let ranges = storage.lastcheck().unwrap().read().unwrap();
    assert!(ranges.iter().any(|r| r.kind == RangeKind::Contents));
    assert!(ranges.iter().any(|r| r.kind == RangeKind::Snapshots));
    // Nothing misbehaved, so no issue histories.
    assert!(storage.issues().unwrap().read().unwrap().is_empty());
}

#[test]
fn missing_object_body_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let (storage, cid) = storage_with_backup(&dir.path().join("store"));
    std::fs::remove_file(storage.object_store().path_for(&cid)).unwrap();

    let report = verify_storage(&storage, dt(2025, 9, 2, 0, 0, 0)).unwrap();
    assert!(!report.is_clean());
    assert_eq!(report.missing_objects, vec![cid.clone()]);

    let items = storage.issues().unwrap().read().unwrap();
    assert_eq!(items.len(), 1);
    match &items[0] {
        IssueItem::Content(issue) => {
            assert_eq!(issue.cid, cid);
            assert_eq!(issue.events.last().unwrap().state, ContentState::Missing);
        }
        other => panic!("unexpected item {other:?}"),
    }
}

#[test]
fn corrupt_object_body_is_reported_with_seen_checksum() {
    let dir = tempfile::tempdir().unwrap();
    let (storage, cid) = storage_with_backup(&dir.path().join("store"));
    flip_bit(&storage.object_store().path_for(&cid), 0);

    let report = verify_storage(&storage, dt(2025, 9, 2, 0, 0, 0)).unwrap();
    assert_eq!(report.corrupt_objects, vec![cid.clone()]);

    let items = storage.issues().unwrap().read().unwrap();
    match &items[0] {
        IssueItem::Content(issue) => match &issue.events.last().unwrap().state {
            ContentState::Mismatch(seen) => {
                assert_eq!(seen.len(), 32);
                assert_ne!(seen.as_slice(), cid.as_bytes());
            }
            other => panic!("unexpected state {other:?}"),
        },
        other => panic!("unexpected item {other:?}"),
    }
}

#[test]
fn repeated_verification_extends_the_event_span() {
    let dir = tempfile::tempdir().unwrap();
    let (storage, cid) = storage_with_backup(&dir.path().join("store"));
    std::fs::remove_file(storage.object_store().path_for(&cid)).unwrap();

    verify_storage(&storage, dt(2025, 9, 2, 0, 0, 0)).unwrap();
    verify_storage(&storage, dt(2025, 9, 9, 0, 0, 0)).unwrap();

    let items = storage.issues().unwrap().read().unwrap();
    assert_eq!(items.len(), 1);
    match &items[0] {
        IssueItem::Content(issue) => {
            assert_eq!(issue.events.len(), 1);
            let event = &issue.events[0];
            assert_eq!(event.before.datetime(), Some(dt(2025, 9, 2, 0, 0, 0)));
            assert_eq!(event.after.datetime(), Some(dt(2025, 9, 9, 0, 0, 0)));
        }
        other => panic!("unexpected item {other:?}"),
    }
}

#[test]
fn corrupt_manifest_block_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let (storage, _) = storage_with_backup(&dir.path().join("store"));
    let name = storage.snapshots().unwrap()[0];
    // Flip a payload bit in the manifest's data block.
    flip_bit(&storage.manifest_path(&name), 4096 + 10);

    let report = verify_storage(&storage, dt(2025, 9, 2, 0, 0, 0)).unwrap();
    assert!(!report.is_clean());

    let items = storage.issues().unwrap().read().unwrap();
    let manifest_issue = items
        .iter()
        .find_map(|item| match item {
            IssueItem::Manifest(issue) => Some(issue),
            _ => None,
        })
        .expect("a manifest issue");
    assert_eq!(manifest_issue.name, name.to_string().into_bytes());
    match &manifest_issue.events.last().unwrap().detail {
        ManifestDetail::Blocks { bad_blocks, .. } => assert_eq!(bad_blocks, &vec![1]),
        other => panic!("unexpected detail {other:?}"),
    }
}

#[test]
fn dangling_manifest_reference_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("store");
    let (storage, _) = storage_with_backup(&root);

    // A second snapshot referencing a cid the index never saw.
    let ghost = Cid::from_bytes(vec![0x66; 32]);
    let start = dt(2025, 9, 3, 4, 0, 0);
    let mut builder = storage.start_snapshot(start).unwrap();
    builder
        .add_file(
            &[b"ghost.txt".to_vec()],
            &ghost,
            3,
            start,
            0,
            FileType::Regular,
            &[],
        )
        .unwrap();
    builder.commit(dt(2025, 9, 3, 4, 1, 0)).unwrap();

    let report = verify_storage(&storage, dt(2025, 9, 4, 0, 0, 0)).unwrap();
    assert!(!report.is_clean());

    let items = storage.issues().unwrap().read().unwrap();
    let manifest_issue = items
        .iter()
        .find_map(|item| match item {
            IssueItem::Manifest(issue) => Some(issue),
            _ => None,
        })
        .expect("a manifest issue");
    match &manifest_issue.events.last().unwrap().detail {
        ManifestDetail::Blocks { missing_cids, bad_blocks, .. } => {
            assert_eq!(missing_cids, &vec![ghost]);
            assert!(bad_blocks.is_empty());
        }
        other => panic!("unexpected detail {other:?}"),
    }
}
