use std::fs;

use crate::snapshot::SnapshotBuilder;
use crate::testutil::{sample_tree, write_file};

#[test]
fn snapshot_mirrors_the_source_tree() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("source");
    fs::create_dir_all(&source).unwrap();
    sample_tree(&source);

    let builder = SnapshotBuilder::new(tmp.path().join("snapshots"));
    let snapshot = builder.create(1, &source).unwrap();
    assert!(snapshot.is_consistent);
    assert!(snapshot
        .path
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("snap_1_"));

    let mut files = builder.list_files(&snapshot);
    files.sort();
    assert_eq!(files.len(), 5);
    assert_eq!(
        fs::read(snapshot.path.join("file1.txt")).unwrap(),
        b"Hello, World!\n"
    );
    assert_eq!(
        fs::read(snapshot.path.join("subdir/nested.txt")).unwrap(),
        b"Nested file content\n"
    );
}

#[test]
fn source_mutation_after_snapshot_is_invisible_to_the_walk() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("source");
    write_file(&source, "stable.txt", b"original contents");

    let builder = SnapshotBuilder::new(tmp.path().join("snapshots"));
    let snapshot = builder.create(1, &source).unwrap();

    // Replacing (not rewriting) the source file leaves the hardlinked
    // mirror pointing at the original inode.
    fs::remove_file(source.join("stable.txt")).unwrap();
    write_file(&source, "stable.txt", b"changed contents");

    assert_eq!(
        fs::read(snapshot.path.join("stable.txt")).unwrap(),
        b"original contents"
    );
}

#[test]
fn missing_source_is_inconsistent() {
    let tmp = tempfile::tempdir().unwrap();
    let builder = SnapshotBuilder::new(tmp.path().join("snapshots"));
    let snapshot = builder
        .create(7, &tmp.path().join("does-not-exist"))
        .unwrap();
    assert!(!snapshot.is_consistent);
}

#[test]
fn single_file_source_is_copied() {
    let tmp = tempfile::tempdir().unwrap();
    let file = write_file(tmp.path(), "lone.txt", b"just me");

    let builder = SnapshotBuilder::new(tmp.path().join("snapshots"));
    let snapshot = builder.create(2, &file).unwrap();
    assert!(snapshot.is_consistent);
    assert_eq!(fs::read(snapshot.path.join("lone.txt")).unwrap(), b"just me");
}

#[cfg(unix)]
#[test]
fn symlinks_are_not_followed() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("source");
    write_file(&source, "real.txt", b"real");
    let outside = write_file(tmp.path(), "outside.txt", b"outside");
    std::os::unix::fs::symlink(&outside, source.join("link.txt")).unwrap();

    let builder = SnapshotBuilder::new(tmp.path().join("snapshots"));
    let snapshot = builder.create(3, &source).unwrap();
    assert!(snapshot.is_consistent);
    assert!(!snapshot.path.join("link.txt").exists());
    assert_eq!(builder.list_files(&snapshot).len(), 1);
}

#[test]
fn remove_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("source");
    write_file(&source, "a.txt", b"a");

    let builder = SnapshotBuilder::new(tmp.path().join("snapshots"));
    let snapshot = builder.create(4, &source).unwrap();
    assert!(snapshot.path.exists());

    builder.remove(&snapshot).unwrap();
    assert!(!snapshot.path.exists());
    // A second removal of the same snapshot is a no-op.
    builder.remove(&snapshot).unwrap();
}
