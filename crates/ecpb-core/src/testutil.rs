use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use crate::chunkstore::ChunkStore;
use crate::config::DataDir;
use crate::db::MetaStore;
use crate::snapshot::SnapshotBuilder;

/// A throwaway repository rooted in a temp dir, with every engine
/// component wired the way the orchestrator wires them.
pub struct TestRepo {
    // Held for its Drop; the directory disappears with the struct.
    pub tmp: TempDir,
    pub data_dir: DataDir,
    pub store: Arc<MetaStore>,
    pub chunks: ChunkStore,
    pub snapshots: SnapshotBuilder,
}

pub fn test_repo() -> TestRepo {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    let data_dir = DataDir::new(tmp.path().join("data"));
    data_dir.ensure().expect("failed to create data dir");
    let store = Arc::new(MetaStore::open(&data_dir.db_path()).expect("failed to open store"));
    let chunks =
        ChunkStore::new(store.clone(), data_dir.storage_dir()).expect("failed to open chunks");
    let snapshots = SnapshotBuilder::new(data_dir.snapshots_dir());
    TestRepo {
        tmp,
        data_dir,
        store,
        chunks,
        snapshots,
    }
}

/// Write a file under `dir`, creating intermediate directories.
pub fn write_file(dir: &Path, relative: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("failed to create parent dirs");
    }
    fs::write(&path, contents).expect("failed to write test file");
    path
}

/// Deterministic, poorly-compressible bytes for chunk-boundary tests.
pub fn patterned_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).max(1);
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        // xorshift64
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let bytes = state.to_le_bytes();
        let take = bytes.len().min(len - out.len());
        out.extend_from_slice(&bytes[..take]);
    }
    out
}

/// The five-file sample tree used by the end-to-end tests.
pub fn sample_tree(dir: &Path) {
    write_file(dir, "file1.txt", b"Hello, World!\n");
    write_file(dir, "file2.txt", b"Enterprise Backup Test\n");
    write_file(dir, "binary.dat", &patterned_bytes(64 * 1024, 7));
    write_file(dir, "subdir/nested.txt", b"Nested file content\n");
    write_file(dir, "duplicate.txt", b"Hello, World!\n");
}

/// Recursively compare the regular files of two trees byte-for-byte.
pub fn assert_trees_equal(expected: &Path, actual: &Path) {
    let mut expected_files: Vec<PathBuf> = walkdir::WalkDir::new(expected)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().strip_prefix(expected).unwrap().to_path_buf())
        .collect();
    expected_files.sort();

    let mut actual_files: Vec<PathBuf> = walkdir::WalkDir::new(actual)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().strip_prefix(actual).unwrap().to_path_buf())
        .collect();
    actual_files.sort();

    assert_eq!(expected_files, actual_files, "file sets differ");
    for rel in expected_files {
        let want = fs::read(expected.join(&rel)).unwrap();
        let got = fs::read(actual.join(&rel)).unwrap();
        assert_eq!(want, got, "contents differ for {}", rel.display());
    }
}
