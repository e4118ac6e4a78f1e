use crate::blockfile::BlockFile;
use crate::checksum::ChecksumAlgorithm;
use crate::manifest::{FileType, ManifestBuilder, ManifestReader};
use crate::testutil::dt;
use ebakup_types::cid::Cid;
use ebakup_types::error::EbakupError;

use sha2::{Digest, Sha256};

const CID_A: &[u8] = b"\x92!G\xa0\xbfQ\x8bQL\xb5\xc1\x1e\x1a\x10\xbf\xeb;y\x00\xe3/~\xd7\x1b\xf4C\x04\xd1a*\xf2^";
const CID_B: &[u8] = b"P\xcd\x91\x14\x0b\x0c\xd9\x95\xfb\xd1!\xe3\xf3\x05\xe7\xd1[\xe6\xc8\x1b\xc5&\x99\xe3L\xe9?\xdaJ\x0eF\xde";

/// The manifest of a known-good database, rebuilt byte for byte.
fn historical_manifest_bytes() -> Vec<u8> {
    let mut settings = b"ebakup backup data\n\
                         edb-blocksize:4096\n\
                         edb-blocksum:sha256\n\
                         start:2015-04-03T10:46:06\n\
                         end:2015-04-03T10:47:59\n"
        .to_vec();
    settings.resize(4064, 0);

    let mut data: Vec<u8> = Vec::new();
    data.extend_from_slice(b"\x90\x08\x00\x04path");
    data.extend_from_slice(b"\x90\x09\x08\x02to");
    data.extend_from_slice(b"\x91\x09\x04file\x20");
    data.extend_from_slice(CID_A);
    data.extend_from_slice(b"\xaa\x3d"); // size 7850
    data.extend_from_slice(b"\xdf\x07\x42\xa0\x42\x30\x23\x7e\xb6");
    data.extend_from_slice(b"\x91\x00\x04file\x20");
    data.extend_from_slice(CID_B);
    data.extend_from_slice(b"\x17"); // size 23
    data.extend_from_slice(b"\xdd\x07\xa0\xdb\x0a\x80\x00\x00\x00");
    data.resize(4064, 0);

    let mut raw = Vec::new();
    raw.extend_from_slice(&settings);
    raw.extend_from_slice(Sha256::digest(&settings).as_slice());
    raw.extend_from_slice(&data);
    raw.extend_from_slice(Sha256::digest(&data).as_slice());
    raw
}

#[test]
fn reads_historical_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("04-03T10:46");
    std::fs::write(&path, historical_manifest_bytes()).unwrap();

    let manifest = ManifestReader::open(&path).unwrap();
    assert_eq!(manifest.start_time(), dt(2015, 4, 3, 10, 46, 6));
    assert_eq!(manifest.end_time(), dt(2015, 4, 3, 10, 47, 59));

    let path_dir = manifest.lookup_directory(0, b"path").unwrap();
    assert_eq!(path_dir.dirid, 8);
    let to_dir = manifest.lookup_directory(8, b"to").unwrap();
    assert_eq!(to_dir.dirid, 9);

    let nested = manifest.lookup_file(9, b"file").unwrap();
    assert_eq!(nested.cid.as_bytes(), CID_A);
    assert_eq!(nested.size, 7850);
    assert_eq!(nested.mtime, dt(2015, 2, 20, 12, 53, 22));
    assert_eq!(nested.mtime_nsec, 765_430_000);
    assert_eq!(nested.filetype, FileType::Regular);

    let rooted = manifest.lookup_file(0, b"file").unwrap();
    assert_eq!(rooted.cid.as_bytes(), CID_B);
    assert_eq!(rooted.size, 23);
    assert_eq!(rooted.mtime, dt(2013, 7, 22, 10, 0, 0));
    assert_eq!(rooted.mtime_nsec, 0);

    assert_eq!(manifest.referenced_cids().count(), 2);
    assert_eq!(manifest.path_of(nested), vec![b"path".to_vec(), b"to".to_vec(), b"file".to_vec()]);
}

// The builder must reproduce the historical file byte for byte.
#[test]
fn builder_reproduces_historical_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let db_dir = dir.path().to_path_buf();

    let mut builder = ManifestBuilder::create(
        &db_dir,
        dt(2015, 4, 3, 10, 46, 6),
        ChecksumAlgorithm::Sha256,
        4096,
    )
    .unwrap();
    builder
        .add_file(
            &[b"path".to_vec(), b"to".to_vec(), b"file".to_vec()],
            &Cid::from_bytes(CID_A),
            7850,
            dt(2015, 2, 20, 12, 53, 22),
            765_430_000,
            FileType::Regular,
            &[],
        )
        .unwrap();
    builder
        .add_file(
            &[b"file".to_vec()],
            &Cid::from_bytes(CID_B),
            23,
            dt(2013, 7, 22, 10, 0, 0),
            0,
            FileType::Regular,
            &[],
        )
        .unwrap();
    let name = builder.commit(dt(2015, 4, 3, 10, 47, 59)).unwrap();
    assert_eq!(name.to_string(), "2015/04-03T10:46");

    let written = std::fs::read(db_dir.join("2015").join("04-03T10:46")).unwrap();
    assert_eq!(written, historical_manifest_bytes());
}

#[test]
fn extras_and_specials_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let db_dir = dir.path().to_path_buf();
    let mut builder = ManifestBuilder::create(
        &db_dir,
        dt(2025, 7, 1, 12, 0, 0),
        ChecksumAlgorithm::Sha256,
        4096,
    )
    .unwrap();

    let owner: &[(Vec<u8>, Vec<u8>)] = &[
        (b"owner".to_vec(), b"alice".to_vec()),
        (b"unix-access".to_vec(), b"0644".to_vec()),
    ];
    builder
        .add_file(
            &[b"home".to_vec(), b"doc.txt".to_vec()],
            &Cid::from_bytes(vec![0x42; 32]),
            100,
            dt(2025, 6, 30, 1, 2, 3),
            0,
            FileType::Regular,
            owner,
        )
        .unwrap();
    // Same bundle again: must intern to the same xid.
    builder
        .add_file(
            &[b"home".to_vec(), b"copy.txt".to_vec()],
            &Cid::from_bytes(vec![0x43; 32]),
            100,
            dt(2025, 6, 30, 1, 2, 3),
            0,
            FileType::Regular,
            owner,
        )
        .unwrap();
    builder
        .add_file(
            &[b"home".to_vec(), b"link".to_vec()],
            &Cid::from_bytes(vec![0x44; 32]),
            9,
            dt(2025, 6, 30, 1, 2, 4),
            500,
            FileType::Symlink,
            &[],
        )
        .unwrap();
    builder
        .add_file(
            &[b"home".to_vec(), b"sock".to_vec()],
            &Cid::empty(),
            0,
            dt(2025, 6, 30, 1, 2, 5),
            0,
            FileType::Socket,
            &[],
        )
        .unwrap();
    // Raw, non-UTF-8 name survives verbatim.
    builder
        .add_file(
            &[b"home".to_vec(), vec![0x66, 0xff, 0x6f]],
            &Cid::from_bytes(vec![0x45; 32]),
            1,
            dt(2025, 6, 30, 1, 2, 6),
            0,
            FileType::Regular,
            &[],
        )
        .unwrap();
    builder
        .add_directory(&[b"empty".to_vec()], &[(b"group".to_vec(), b"staff".to_vec())])
        .unwrap();
    builder.commit(dt(2025, 7, 1, 12, 5, 0)).unwrap();

    let manifest =
        ManifestReader::open(&db_dir.join("2025").join("07-01T12:00")).unwrap();

    let doc = manifest.lookup_file(8, b"doc.txt").unwrap();
    let copy = manifest.lookup_file(8, b"copy.txt").unwrap();
    assert_ne!(doc.extra, 0);
    assert_eq!(doc.extra, copy.extra);
    let mut pairs = manifest.resolve_extra(doc.extra).unwrap();
    pairs.sort();
    assert_eq!(
        pairs,
        vec![
            (&b"owner"[..], &b"alice"[..]),
            (&b"unix-access"[..], &b"0644"[..]),
        ]
    );

    let link = manifest.lookup_file(8, b"link").unwrap();
    assert_eq!(link.filetype, FileType::Symlink);
    let sock = manifest.lookup_file(8, b"sock").unwrap();
    assert_eq!(sock.filetype, FileType::Socket);
    assert!(sock.cid.is_empty());

    assert!(manifest.lookup_file(8, &[0x66, 0xff, 0x6f]).is_some());

    let empty = manifest.lookup_directory(0, b"empty").unwrap();
    assert_eq!(
        manifest.resolve_extra(empty.extra).unwrap(),
        vec![(&b"group"[..], &b"staff"[..])]
    );

    // Directory listings are byte-wise sorted; 0x66 'f' lands between
    // "doc.txt" and "link".
    let (dirs, files) = manifest.list_directory(8);
    assert!(dirs.is_empty());
    assert_eq!(
        files,
        vec![
            &b"copy.txt"[..],
            &b"doc.txt"[..],
            &[0x66, 0xff, 0x6f][..],
            &b"link"[..],
            &b"sock"[..],
        ]
    );
}

#[test]
fn definition_block_after_data_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("05-01T00:00");
    let mut file = BlockFile::create(
        &path,
        b"ebakup backup data",
        &[
            (b"start", b"2025-05-01T00:00:00"),
            (b"end", b"2025-05-01T00:01:00"),
        ],
        ChecksumAlgorithm::Sha256,
        4096,
    )
    .unwrap();
    // Data block first, then a definition block: wrong order.
    file.append_block(b"\x90\x08\x00\x01d").unwrap();
    let mut kv = vec![0x21u8, 8];
    kv.extend_from_slice(&[5]);
    kv.extend_from_slice(b"owner");
    kv.extend_from_slice(&[3]);
    kv.extend_from_slice(b"bob");
    file.append_block(&kv).unwrap();
    drop(file);

    match ManifestReader::open(&path) {
        Err(EbakupError::InvalidFormat { reason, .. }) => {
            assert!(reason.contains("definition block after data"), "{reason}");
        }
        other => panic!("expected InvalidFormat, got {other:?}"),
    }
}

#[test]
fn mixed_block_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("05-01T00:00");
    let mut file = BlockFile::create(
        &path,
        b"ebakup backup data",
        &[
            (b"start", b"2025-05-01T00:00:00"),
            (b"end", b"2025-05-01T00:01:00"),
        ],
        ChecksumAlgorithm::Sha256,
        4096,
    )
    .unwrap();
    let mut block = vec![0x21u8, 8, 5];
    block.extend_from_slice(b"owner");
    block.push(3);
    block.extend_from_slice(b"bob");
    block.extend_from_slice(b"\x90\x08\x00\x01d");
    file.append_block(&block).unwrap();
    drop(file);

    match ManifestReader::open(&path) {
        Err(EbakupError::InvalidFormat { reason, .. }) => {
            assert!(reason.contains("mixed"), "{reason}");
        }
        other => panic!("expected InvalidFormat, got {other:?}"),
    }
}

#[test]
fn unknown_setting_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("05-01T00:00");
    BlockFile::create(
        &path,
        b"ebakup backup data",
        &[
            (b"start", b"2025-05-01T00:00:00"),
            (b"end", b"2025-05-01T00:01:00"),
            (b"compression", b"zstd"),
        ],
        ChecksumAlgorithm::Sha256,
        4096,
    )
    .unwrap();
    assert!(matches!(
        ManifestReader::open(&path),
        Err(EbakupError::InvalidFormat { .. })
    ));
}

#[test]
fn abandoned_builder_removes_its_new_file() {
    let dir = tempfile::tempdir().unwrap();
    let db_dir = dir.path().to_path_buf();
    let builder = ManifestBuilder::create(
        &db_dir,
        dt(2025, 5, 1, 0, 0, 0),
        ChecksumAlgorithm::Sha256,
        4096,
    )
    .unwrap();
    let new_path = db_dir.join("2025").join("05-01T00:00.new");
    assert!(new_path.exists());
    builder.abort();
    assert!(!new_path.exists());
    assert!(!db_dir.join("2025").join("05-01T00:00").exists());
}

#[test]
fn existing_final_name_wins_over_commit() {
    let dir = tempfile::tempdir().unwrap();
    let db_dir = dir.path().to_path_buf();
    let builder = ManifestBuilder::create(
        &db_dir,
        dt(2025, 5, 1, 0, 0, 0),
        ChecksumAlgorithm::Sha256,
        4096,
    )
    .unwrap();
    // Somebody else publishes the final name first.
    std::fs::write(db_dir.join("2025").join("05-01T00:00"), b"taken").unwrap();
    assert!(matches!(
        builder.commit(dt(2025, 5, 1, 0, 1, 0)),
        Err(EbakupError::AlreadyExists(_))
    ));
}

#[test]
fn second_builder_for_same_minute_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let db_dir = dir.path().to_path_buf();
    let _first = ManifestBuilder::create(
        &db_dir,
        dt(2025, 5, 1, 0, 0, 0),
        ChecksumAlgorithm::Sha256,
        4096,
    )
    .unwrap();
    assert!(matches!(
        ManifestBuilder::create(
            &db_dir,
            dt(2025, 5, 1, 0, 0, 30),
            ChecksumAlgorithm::Sha256,
            4096,
        ),
        Err(EbakupError::ConcurrentWriter(_))
    ));
}
