use std::fs;
use std::path::Path;

use tracing::{error, info, warn};

use crate::chunkstore::ChunkStore;
use crate::crypto::aes_cbc::JobKey;
use crate::db::MetaStore;
use crate::error::{EcpbError, Result};
use crate::ipc::{ProgressChannel, ProgressKind, ProgressMessage, SharedRegion};
use crate::snapshot::SnapshotBuilder;
use crate::types::{format_bytes, BackupJob, JobCounters, JobStatus};

/// Executes exactly one backup job end-to-end: snapshot, chunk every file,
/// record the per-job key and final counters.
///
/// Per-file pipeline failures are isolated to that file; failures to record
/// metadata abort the whole job.
pub struct BackupWorker<'a> {
    store: &'a MetaStore,
    chunk_store: &'a ChunkStore,
    snapshots: &'a SnapshotBuilder,
}

impl<'a> BackupWorker<'a> {
    pub fn new(
        store: &'a MetaStore,
        chunk_store: &'a ChunkStore,
        snapshots: &'a SnapshotBuilder,
    ) -> Self {
        Self {
            store,
            chunk_store,
            snapshots,
        }
    }

    pub fn execute(
        &self,
        job: &BackupJob,
        key: Option<&JobKey>,
        progress: Option<&ProgressChannel>,
        board: Option<(&SharedRegion, usize)>,
    ) -> Result<JobCounters> {
        info!(job_id = job.job_id, source = %job.source_path, "starting backup job");

        self.store
            .update_job_status(job.job_id, JobStatus::Running, None)?;
        emit(progress, ProgressKind::JobStart, job.job_id, 0, 0);

        let snapshot = self
            .snapshots
            .create(job.job_id, Path::new(&job.source_path))?;
        if !snapshot.is_consistent {
            let message = "Failed to create snapshot";
            let _ = self.snapshots.remove(&snapshot);
            self.store
                .update_job_status(job.job_id, JobStatus::Failed, Some(message))?;
            emit(progress, ProgressKind::JobFailed, job.job_id, 0, 0);
            return Err(EcpbError::Worker(message.into()));
        }

        let files = self.snapshots.list_files(&snapshot);
        if files.is_empty() {
            warn!(job_id = job.job_id, source = %job.source_path, "no files in source");
        }

        let mut counters = JobCounters {
            file_count: files.len() as i64,
            ..JobCounters::default()
        };
        for file in &files {
            if let Ok(meta) = fs::metadata(file) {
                counters.total_bytes += meta.len();
            }
        }

        for file in &files {
            let relative = file
                .strip_prefix(&snapshot.path)
                .unwrap_or(file.as_path())
                .to_string_lossy()
                .into_owned();

            let manifest = match self.chunk_store.store_file(
                file,
                job.compression,
                job.encrypt,
                key,
                job.job_id,
                &relative,
            ) {
                Ok(m) => m,
                Err(e @ EcpbError::Metadata(_)) => return Err(e),
                Err(e) => {
                    error!(job_id = job.job_id, file = %relative, error = %e, "skipping file");
                    continue;
                }
            };

            for chunk in &manifest.chunks {
                if chunk.deduplicated {
                    counters.dedup_savings += u64::from(chunk.size);
                } else if let Some(meta) = self.store.get_chunk_meta(&chunk.hash)? {
                    counters.stored_bytes += u64::from(meta.stored_size);
                }
            }
            counters.processed_bytes += manifest.file_size;

            emit(
                progress,
                ProgressKind::JobProgress,
                job.job_id,
                counters.processed_bytes,
                counters.total_bytes,
            );
            if let Some((region, slot)) = board {
                region.publish(
                    slot,
                    job.job_id,
                    counters.processed_bytes,
                    counters.total_bytes,
                );
            }
        }

        if job.encrypt {
            let key =
                key.ok_or_else(|| EcpbError::Crypto("no key for encrypting job".into()))?;
            self.store.store_encryption_key(job.job_id, &key.to_hex())?;
        }

        self.store.update_job_stats(job.job_id, counters)?;
        self.store
            .update_job_status(job.job_id, JobStatus::Completed, None)?;

        if let Err(e) = self.snapshots.remove(&snapshot) {
            warn!(job_id = job.job_id, error = %e, "failed to remove snapshot");
        }
        emit(
            progress,
            ProgressKind::JobComplete,
            job.job_id,
            counters.processed_bytes,
            counters.total_bytes,
        );

        info!(
            job_id = job.job_id,
            files = counters.file_count,
            stored = %format_bytes(counters.stored_bytes),
            dedup = %format_bytes(counters.dedup_savings),
            "backup job completed"
        );
        Ok(counters)
    }
}

fn emit(channel: Option<&ProgressChannel>, kind: ProgressKind, job_id: i64, v1: u64, v2: u64) {
    if let Some(channel) = channel {
        channel.send(&ProgressMessage::new(kind, job_id, v1, v2));
    }
}
