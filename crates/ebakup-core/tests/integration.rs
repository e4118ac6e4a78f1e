//! End-to-end exercise of the public surface: create a storage, back up a
//! small tree, verify it, mirror it, and verify the mirror.

use chrono::NaiveDate;
use ebakup_core::manifest::FileType;
use ebakup_core::storage::Storage;
use ebakup_core::sync::sync_to_path;
use ebakup_core::verify::verify_storage;

fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> chrono::NaiveDateTime {
    NaiveDate::from_ymd_opt(y, mo, d)
        .unwrap()
        .and_hms_opt(h, mi, s)
        .unwrap()
}

#[test]
fn backup_verify_sync_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let primary_path = dir.path().join("primary");
    let mut primary = Storage::create(&primary_path).unwrap();

    // Back up a small tree across two snapshots with shared content.
    let t1 = dt(2025, 1, 2, 3, 4, 5);
    let readme = primary.add_content_at(&mut &b"# readme"[..], t1).unwrap();
    let config = primary.add_content_at(&mut &b"[core]\nkey = 1\n"[..], t1).unwrap();

    let mut builder = primary.start_snapshot(t1).unwrap();
    builder
        .add_file(
            &[b"project".to_vec(), b"README.md".to_vec()],
            &readme,
            8,
            t1,
            123_000_000,
            FileType::Regular,
            &[(b"unix-access".to_vec(), b"0644".to_vec())],
        )
        .unwrap();
    builder
        .add_file(
            &[b"project".to_vec(), b"app.conf".to_vec()],
            &config,
            15,
            t1,
            0,
            FileType::Regular,
            &[(b"unix-access".to_vec(), b"0644".to_vec())],
        )
        .unwrap();
    builder.commit(dt(2025, 1, 2, 3, 5, 0)).unwrap();

    let t2 = dt(2025, 1, 9, 3, 4, 5);
    let notes = primary.add_content_at(&mut &b"notes"[..], t2).unwrap();
    // Unchanged file dedupes to the same cid.
    let readme_again = primary.add_content_at(&mut &b"# readme"[..], t2).unwrap();
    assert_eq!(readme, readme_again);

    let mut builder = primary.start_snapshot(t2).unwrap();
    builder
        .add_file(
            &[b"project".to_vec(), b"README.md".to_vec()],
            &readme,
            8,
            t1,
            123_000_000,
            FileType::Regular,
            &[],
        )
        .unwrap();
    builder
        .add_file(
            &[b"project".to_vec(), b"NOTES".to_vec()],
            &notes,
            5,
            t2,
            0,
            FileType::Regular,
            &[],
        )
        .unwrap();
    builder.commit(dt(2025, 1, 9, 3, 5, 30)).unwrap();

    // Three distinct objects, two snapshots.
    assert_eq!(primary.content_index().entries().unwrap().count(), 3);
    let names = primary.snapshots().unwrap();
    assert_eq!(names.len(), 2);

    // Snapshot contents read back.
    let manifest = primary.snapshot(&names[1]).unwrap();
    let file = manifest.lookup_file(8, b"NOTES").unwrap();
    assert_eq!(file.cid, notes);
    let (dirs, _) = manifest.list_directory(0);
    assert_eq!(dirs, vec![&b"project"[..]]);

    // The primary verifies clean.
    let report = verify_storage(&primary, dt(2025, 1, 10, 0, 0, 0)).unwrap();
    assert!(report.is_clean(), "errors: {:?}", report.errors);
    assert_eq!(report.contents_checked, 3);
    assert_eq!(report.snapshots_checked, 2);

    // Mirror to a second storage and verify that too.
    let mirror_path = dir.path().join("mirror");
    let stats = sync_to_path(&primary, &mirror_path).unwrap();
    assert_eq!(stats.snapshots_copied, 2);
    assert_eq!(stats.objects_copied, 3);

    let mirror = Storage::open(&mirror_path).unwrap();
    assert_eq!(mirror.snapshots().unwrap(), names);
    for name in &names {
        assert_eq!(
            std::fs::read(primary.manifest_path(name)).unwrap(),
            std::fs::read(mirror.manifest_path(name)).unwrap(),
        );
    }
    let report = verify_storage(&mirror, dt(2025, 1, 10, 1, 0, 0)).unwrap();
    assert!(report.is_clean(), "errors: {:?}", report.errors);

    // The verification log stayed local: the primary's lastcheck reflects
    // its own run only.
    let primary_ranges = primary.lastcheck().unwrap().read().unwrap();
    let mirror_ranges = mirror.lastcheck().unwrap().read().unwrap();
    assert_ne!(primary_ranges, mirror_ranges);
}
