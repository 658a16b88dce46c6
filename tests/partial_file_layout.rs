// Smoke tests for the on-disk conventions the engine relies on: partial
// transfers live next to their target and survive a process restart, and
// superseded versions are renamed, never overwritten.
// These don't hit any API; they exercise the filesystem patterns only.

use std::fs;
use std::io::{Seek, SeekFrom, Write};

#[test]
fn incomplete_file_renames_into_place() {
    let tmp = tempfile::tempdir().unwrap();
    let target = tmp.path().join("setup_game.sh");
    let incomplete = tmp.path().join("setup_game.sh.~incomplete");

    // a first run writes part of the payload
    {
        let mut f = fs::File::create(&incomplete).unwrap();
        f.write_all(&[1u8; 1000]).unwrap();
    }
    assert!(incomplete.exists());
    assert!(!target.exists());

    // a second run appends the remainder from the recorded offset
    {
        let mut f = fs::OpenOptions::new().write(true).open(&incomplete).unwrap();
        let offset = f.metadata().unwrap().len();
        assert_eq!(offset, 1000);
        f.seek(SeekFrom::Start(offset)).unwrap();
        f.write_all(&[2u8; 500]).unwrap();
    }

    fs::rename(&incomplete, &target).unwrap();
    assert_eq!(fs::metadata(&target).unwrap().len(), 1500);
    assert!(!incomplete.exists());
}

#[test]
fn superseded_version_keeps_old_copy() {
    let tmp = tempfile::tempdir().unwrap();
    let target = tmp.path().join("setup_game.sh");
    fs::write(&target, b"old version").unwrap();

    // version change: the old file moves aside before the new download
    let renamed = tmp.path().join("setup_game.sh.20240605T133336.old");
    fs::rename(&target, &renamed).unwrap();
    fs::write(&target, b"new version bytes").unwrap();

    assert_eq!(fs::read(&renamed).unwrap(), b"old version");
    assert_eq!(fs::read(&target).unwrap(), b"new version bytes");
    assert_ne!(
        fs::metadata(&renamed).unwrap().len(),
        fs::metadata(&target).unwrap().len()
    );
}

#[test]
fn append_only_chunk_writes_are_ordered() {
    let tmp = tempfile::tempdir().unwrap();
    let target = tmp.path().join("depot_item.bin");

    // the depot path appends decompressed chunks strictly in order
    for chunk in [&b"AAAA"[..], &b"BBB"[..], &b"CC"[..]] {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&target)
            .unwrap();
        f.write_all(chunk).unwrap();
    }
    assert_eq!(fs::read(&target).unwrap(), b"AAAABBBCC");
}
