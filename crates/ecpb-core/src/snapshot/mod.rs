use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::types::now_epoch_ms;

/// A point-in-time mirror of a job's source tree. Exists only while the
/// job runs; the worker removes it afterwards.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub job_id: i64,
    pub path: PathBuf,
    pub created_at: i64,
    /// True iff every regular file was mirrored successfully.
    pub is_consistent: bool,
}

/// Builds hardlink-first mirrors of source trees under a snapshot root.
///
/// Hardlinking gives an O(1) "copy" on the common same-filesystem case
/// without blocking writers on the source; cross-filesystem sources fall
/// back to byte copies per file.
pub struct SnapshotBuilder {
    base_dir: PathBuf,
}

impl SnapshotBuilder {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Mirror `source` into `<base>/snap_<job_id>_<epoch_ms>/`.
    ///
    /// Symlinks are not followed; non-regular files are skipped. A source
    /// that is itself a regular file is copied into the snapshot root.
    pub fn create(&self, job_id: i64, source: &Path) -> Result<Snapshot> {
        let created_at = now_epoch_ms();
        let snap_dir = self
            .base_dir
            .join(format!("snap_{job_id}_{created_at}"));
        fs::create_dir_all(&snap_dir)?;

        let mut snapshot = Snapshot {
            job_id,
            path: snap_dir.clone(),
            created_at,
            is_consistent: false,
        };

        let meta = match fs::symlink_metadata(source) {
            Ok(m) => m,
            Err(e) => {
                error!(source = %source.display(), error = %e, "snapshot source does not exist");
                return Ok(snapshot);
            }
        };

        let ok = if meta.is_dir() {
            mirror_directory(source, &snap_dir)
        } else if meta.is_file() {
            let file_name = source
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("file"));
            mirror_file(source, &snap_dir.join(file_name))
        } else {
            warn!(source = %source.display(), "snapshot source is not a file or directory");
            false
        };

        snapshot.is_consistent = ok;
        if ok {
            info!(path = %snap_dir.display(), "snapshot created");
        } else {
            error!(job_id, "snapshot creation failed");
        }
        Ok(snapshot)
    }

    /// All regular files in the snapshot, as absolute paths. Order is
    /// arbitrary but stable within one call.
    pub fn list_files(&self, snapshot: &Snapshot) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(&snapshot.path).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "skipping snapshot entry");
                    continue;
                }
            };
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        files
    }

    /// Delete the mirror tree. Idempotent; never follows symlinks out of
    /// the mirror (`remove_dir_all` unlinks symlinks rather than descending
    /// through them).
    pub fn remove(&self, snapshot: &Snapshot) -> Result<()> {
        if !snapshot.path.exists() {
            return Ok(());
        }
        fs::remove_dir_all(&snapshot.path)?;
        debug!(path = %snapshot.path.display(), "snapshot removed");
        Ok(())
    }
}

fn mirror_directory(src: &Path, dst: &Path) -> bool {
    let entries = match fs::read_dir(src) {
        Ok(e) => e,
        Err(e) => {
            error!(dir = %src.display(), error = %e, "cannot read directory");
            return false;
        }
    };

    let mut ok = true;
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(dir = %src.display(), error = %e, "skipping unreadable entry");
                ok = false;
                continue;
            }
        };
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        let meta = match fs::symlink_metadata(&src_path) {
            Ok(m) => m,
            Err(_) => continue,
        };

        if meta.is_dir() {
            if fs::create_dir_all(&dst_path).is_err() {
                ok = false;
                continue;
            }
            if !mirror_directory(&src_path, &dst_path) {
                ok = false;
            }
        } else if meta.is_file() {
            if !mirror_file(&src_path, &dst_path) {
                ok = false;
            }
        }
        // Symlinks and special files are intentionally left behind.
    }
    ok
}

/// Hardlink `src` to `dst`, falling back to a byte copy when linking is
/// not possible (e.g. across filesystems).
fn mirror_file(src: &Path, dst: &Path) -> bool {
    if fs::hard_link(src, dst).is_ok() {
        return true;
    }
    match fs::copy(src, dst) {
        Ok(_) => true,
        Err(e) => {
            error!(src = %src.display(), error = %e, "failed to mirror file");
            false
        }
    }
}
