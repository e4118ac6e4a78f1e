use std::io::Read;

use crate::checksum::ChecksumAlgorithm;
use crate::objectstore::{ObjectSpool, ObjectStore};
use ebakup_types::cid::Cid;
use ebakup_types::error::EbakupError;

#[test]
fn paths_are_derived_from_the_cid_alone() {
    let dir = tempfile::tempdir().unwrap();
    let store = ObjectStore::new(dir.path());
    let cid = Cid::from_bytes(vec![0xaa, 0xbb, 0xcc, 0xdd]);
    let path = store.path_for(&cid);
    assert_eq!(
        path,
        dir.path().join("content").join("aa").join("bb").join("ccdd")
    );
}

#[test]
fn spool_stays_in_memory_below_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let store = ObjectStore::create(dir.path()).unwrap();
    let mut spool = ObjectSpool::new(store.tmp_dir(), ChecksumAlgorithm::Sha256);
    spool.write(b"hello").unwrap();
    let (checksum, spooled) = spool.finish().unwrap();
    assert_eq!(checksum, ChecksumAlgorithm::Sha256.digest(b"hello"));
    assert_eq!(spooled.len(), 5);
    // Nothing spilled.
    assert_eq!(std::fs::read_dir(store.tmp_dir()).unwrap().count(), 0);
    spooled.discard();
}

#[test]
fn spool_spills_past_threshold_and_reads_back() {
    let dir = tempfile::tempdir().unwrap();
    let store = ObjectStore::create(dir.path()).unwrap();
    let mut spool = ObjectSpool::with_threshold(store.tmp_dir(), ChecksumAlgorithm::Sha256, 8);
    spool.write(b"01234").unwrap();
    spool.write(b"56789").unwrap();
    let (checksum, spooled) = spool.finish().unwrap();
    assert_eq!(checksum, ChecksumAlgorithm::Sha256.digest(b"0123456789"));
    // The spill file exists in tmp/.
    assert_eq!(std::fs::read_dir(store.tmp_dir()).unwrap().count(), 1);

    let mut contents = Vec::new();
    spooled.reader().unwrap().read_to_end(&mut contents).unwrap();
    assert_eq!(contents, b"0123456789");
    spooled.discard();
    assert_eq!(std::fs::read_dir(store.tmp_dir()).unwrap().count(), 0);
}

#[test]
fn place_open_and_verify() {
    let dir = tempfile::tempdir().unwrap();
    let store = ObjectStore::create(dir.path()).unwrap();
    let algo = ChecksumAlgorithm::Sha256;

    let mut spool = ObjectSpool::new(store.tmp_dir(), algo);
    spool.write(b"body bytes").unwrap();
    let (checksum, spooled) = spool.finish().unwrap();
    let cid = Cid::from_bytes(checksum.clone());

    store.place(&cid, spooled).unwrap();
    assert!(store.exists(&cid));
    assert_eq!(store.size(&cid).unwrap(), 10);

    let mut body = Vec::new();
    store.open(&cid).unwrap().read_to_end(&mut body).unwrap();
    assert_eq!(body, b"body bytes");
    assert_eq!(store.compute_checksum(&cid, algo).unwrap(), checksum);
}

#[test]
fn place_refuses_to_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let store = ObjectStore::create(dir.path()).unwrap();
    let algo = ChecksumAlgorithm::Sha256;
    let cid = Cid::from_bytes(vec![0x77; 32]);

    let mut spool = ObjectSpool::new(store.tmp_dir(), algo);
    spool.write(b"one").unwrap();
    store.place(&cid, spool.finish().unwrap().1).unwrap();

    let mut spool = ObjectSpool::new(store.tmp_dir(), algo);
    spool.write(b"two").unwrap();
    assert!(matches!(
        store.place(&cid, spool.finish().unwrap().1),
        Err(EbakupError::AlreadyExists(_))
    ));
}

#[test]
fn matches_compares_byte_for_byte() {
    let dir = tempfile::tempdir().unwrap();
    let store = ObjectStore::create(dir.path()).unwrap();
    let algo = ChecksumAlgorithm::Sha256;
    let cid = Cid::from_bytes(vec![0x55; 32]);

    let mut spool = ObjectSpool::new(store.tmp_dir(), algo);
    spool.write(b"identical").unwrap();
    store.place(&cid, spool.finish().unwrap().1).unwrap();

    let mut same = ObjectSpool::new(store.tmp_dir(), algo);
    same.write(b"identical").unwrap();
    let (_, same) = same.finish().unwrap();
    assert!(store.matches(&cid, &same).unwrap());
    same.discard();

    let mut differs = ObjectSpool::new(store.tmp_dir(), algo);
    differs.write(b"different").unwrap();
    let (_, differs) = differs.finish().unwrap();
    assert!(!store.matches(&cid, &differs).unwrap());
    differs.discard();

    let mut shorter = ObjectSpool::new(store.tmp_dir(), algo);
    shorter.write(b"ident").unwrap();
    let (_, shorter) = shorter.finish().unwrap();
    assert!(!store.matches(&cid, &shorter).unwrap());
    shorter.discard();
}

#[test]
fn missing_object_reports_content_missing() {
    let dir = tempfile::tempdir().unwrap();
    let store = ObjectStore::create(dir.path()).unwrap();
    let cid = Cid::from_bytes(vec![0x99; 32]);
    assert!(matches!(
        store.open(&cid),
        Err(EbakupError::ContentMissing(_))
    ));
}
