use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::chunkstore::ChunkStore;
use crate::crypto::aes_cbc::JobKey;
use crate::db::MetaStore;
use crate::error::Result;
use crate::types::{format_bytes, BackupJob, JobStatus};

/// Outcome of a whole-job restore. Per-file failures are counted but do
/// not abort the rest of the restore.
#[derive(Debug, Default)]
pub struct RestoreResult {
    pub success: bool,
    pub files_restored: usize,
    pub bytes_restored: u64,
    pub error: Option<String>,
    pub restored_files: Vec<PathBuf>,
}

/// Manifest-driven reassembly of completed backup jobs.
pub struct RestoreEngine<'a> {
    store: &'a Arc<MetaStore>,
    chunk_store: &'a ChunkStore,
}

impl<'a> RestoreEngine<'a> {
    pub fn new(store: &'a Arc<MetaStore>, chunk_store: &'a ChunkStore) -> Self {
        Self { store, chunk_store }
    }

    /// Restore every file of a COMPLETED job under `dest_root`. A failed
    /// file is logged and skipped; `success` holds when at least one file
    /// was restored, or when the job legitimately has no manifests.
    pub fn restore_job(&self, job_id: i64, dest_root: &Path) -> Result<RestoreResult> {
        let mut result = RestoreResult::default();

        let Some(job) = self.store.get_job(job_id)? else {
            result.error = Some(format!("Job not found: {job_id}"));
            error!(job_id, "restore: job not found");
            return Ok(result);
        };
        if job.status != JobStatus::Completed {
            result.error = Some(format!(
                "Job {job_id} is not completed (status: {})",
                job.status.as_str()
            ));
            error!(job_id, status = job.status.as_str(), "restore: job not restorable");
            return Ok(result);
        }

        let key = if job.encrypt {
            match self.store.get_encryption_key(job_id)? {
                Some(hex) => Some(JobKey::from_hex(&hex)?),
                None => {
                    result.error = Some(format!("Encryption key not found for job {job_id}"));
                    error!(job_id, "restore: encryption key missing");
                    return Ok(result);
                }
            }
        } else {
            None
        };

        let manifests = self.store.get_file_manifests(job_id)?;
        if manifests.is_empty() {
            warn!(job_id, "restore: job has no file manifests");
            result.success = true;
            return Ok(result);
        }

        info!(
            job_id,
            files = manifests.len(),
            dest = %dest_root.display(),
            "restoring job"
        );
        fs::create_dir_all(dest_root)?;

        for manifest in &manifests {
            let target = dest_root.join(&manifest.relative_path);
            match self.chunk_store.restore_file(manifest, &target, key.as_ref()) {
                Ok(()) => {
                    result.files_restored += 1;
                    result.bytes_restored += manifest.file_size;
                    result.restored_files.push(target);
                }
                Err(e) => {
                    error!(job_id, file = %manifest.relative_path, error = %e, "restore failed");
                    result.error = Some(format!("Failed to restore: {}", manifest.file_name));
                }
            }
        }

        result.success = result.files_restored > 0;
        info!(
            job_id,
            files = result.files_restored,
            bytes = %format_bytes(result.bytes_restored),
            "restore complete"
        );
        Ok(result)
    }

    /// Cheap integrity check: every referenced chunk must have a metadata
    /// row and its storage path must exist on disk. Chunk contents are not
    /// read.
    pub fn verify_backup(&self, job_id: i64) -> Result<bool> {
        let Some(job) = self.store.get_job(job_id)? else {
            return Ok(false);
        };
        if job.status != JobStatus::Completed {
            return Ok(false);
        }

        for manifest in self.store.get_file_manifests(job_id)? {
            for chunk in &manifest.chunks {
                let Some(meta) = self.store.get_chunk_meta(&chunk.hash)? else {
                    error!(job_id, hash = %chunk.hash, "verify: chunk not in metadata store");
                    return Ok(false);
                };
                if !Path::new(&meta.storage_path).exists() {
                    error!(job_id, path = %meta.storage_path, "verify: chunk file missing");
                    return Ok(false);
                }
            }
        }
        info!(job_id, "verify: backup integrity ok");
        Ok(true)
    }

    /// All jobs that can be restored.
    pub fn list_restorable(&self) -> Result<Vec<BackupJob>> {
        self.store.get_jobs_by_status(JobStatus::Completed)
    }
}
