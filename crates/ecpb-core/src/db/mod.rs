use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tracing::{debug, warn};

use crate::compress::Compression;
use crate::crypto::sha256::Hash;
use crate::error::{EcpbError, Result};
use crate::types::{
    now_epoch_ms, BackupJob, ChunkRecord, ChunkRef, FileManifest, JobCounters, JobPriority,
    JobStatus, SQLITE_BUSY_TIMEOUT_MS, SQLITE_MAX_RETRIES,
};

const MASTER_KEY_META: &str = "master_key_hex";

/// Aggregated repository counters for reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    pub total_jobs: i64,
    pub completed_jobs: i64,
    pub failed_jobs: i64,
    pub total_chunks: i64,
    pub total_stored_bytes: u64,
    pub total_dedup_savings: u64,
    pub total_files: i64,
}

/// Durable, transactional store for jobs, chunks, manifests, keys and
/// dependencies, backed by a single SQLite file in WAL mode.
///
/// Every public operation takes the store-wide mutex exactly once;
/// internal helpers borrow the already-locked connection, so operations
/// never nest through the public surface. Across processes, writers are
/// adjudicated by IMMEDIATE transactions plus the busy timeout, with
/// bounded statement retry on contention.
///
/// Not fork-safe: a child process must open its own `MetaStore` and must
/// never touch an inherited one.
pub struct MetaStore {
    conn: Mutex<Connection>,
}

impl MetaStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "wal_autocheckpoint", 1000)?;
        conn.pragma_update(None, "cache_size", -8000)?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_tables()?;
        debug!(path = %path.display(), "metadata store opened");
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned mutex only means another thread panicked mid-operation;
        // the connection itself rolls interrupted transactions back.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch(
            r#"
            BEGIN IMMEDIATE;
            CREATE TABLE IF NOT EXISTS jobs (
                job_id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_path TEXT NOT NULL,
                backup_name TEXT NOT NULL,
                status INTEGER NOT NULL DEFAULT 0,
                priority INTEGER NOT NULL DEFAULT 1,
                compression INTEGER NOT NULL DEFAULT 1,
                encrypt INTEGER NOT NULL DEFAULT 1,
                incremental INTEGER NOT NULL DEFAULT 0,
                parent_job_id INTEGER,
                created_at INTEGER NOT NULL DEFAULT 0,
                started_at INTEGER NOT NULL DEFAULT 0,
                completed_at INTEGER NOT NULL DEFAULT 0,
                total_bytes INTEGER NOT NULL DEFAULT 0,
                processed_bytes INTEGER NOT NULL DEFAULT 0,
                stored_bytes INTEGER NOT NULL DEFAULT 0,
                dedup_savings INTEGER NOT NULL DEFAULT 0,
                file_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT NOT NULL DEFAULT ''
            );
            CREATE TABLE IF NOT EXISTS chunks (
                hash TEXT PRIMARY KEY,
                storage_path TEXT NOT NULL,
                original_size INTEGER NOT NULL,
                stored_size INTEGER NOT NULL,
                compression INTEGER NOT NULL DEFAULT 0,
                encrypted INTEGER NOT NULL DEFAULT 0,
                ref_count INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS file_manifests (
                manifest_id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER NOT NULL,
                file_path TEXT NOT NULL,
                file_name TEXT NOT NULL,
                file_size INTEGER NOT NULL DEFAULT 0,
                modified_time INTEGER NOT NULL DEFAULT 0,
                file_hash TEXT NOT NULL DEFAULT '',
                FOREIGN KEY (job_id) REFERENCES jobs(job_id)
            );
            CREATE TABLE IF NOT EXISTS file_chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                manifest_id INTEGER NOT NULL,
                chunk_hash TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                offset INTEGER NOT NULL,
                size INTEGER NOT NULL,
                deduplicated INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (manifest_id) REFERENCES file_manifests(manifest_id)
            );
            CREATE TABLE IF NOT EXISTS encryption_keys (
                job_id INTEGER PRIMARY KEY,
                key_hex TEXT NOT NULL,
                FOREIGN KEY (job_id) REFERENCES jobs(job_id)
            );
            CREATE TABLE IF NOT EXISTS job_dependencies (
                job_id INTEGER NOT NULL,
                depends_on INTEGER NOT NULL,
                PRIMARY KEY (job_id, depends_on),
                FOREIGN KEY (job_id) REFERENCES jobs(job_id),
                FOREIGN KEY (depends_on) REFERENCES jobs(job_id)
            );
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_file_manifests_job ON file_manifests(job_id);
            CREATE INDEX IF NOT EXISTS idx_file_chunks_manifest ON file_chunks(manifest_id);
            COMMIT;
            "#,
        )?;
        Ok(())
    }

    // ─── Jobs ────────────────────────────────────────────────────────

    /// Insert a new job row; returns its assigned id.
    pub fn create_job(&self, job: &BackupJob) -> Result<i64> {
        let conn = self.conn();
        retry_busy("create_job", || {
            conn.execute(
                "INSERT INTO jobs (source_path, backup_name, status, priority, compression, \
                 encrypt, incremental, parent_job_id, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    job.source_path,
                    job.backup_name,
                    job.status.code(),
                    job.priority.code(),
                    job.compression.code(),
                    job.encrypt,
                    job.incremental,
                    job.parent_job_id,
                    now_epoch_ms(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Transition a job's status. RUNNING stamps `started_at`;
    /// COMPLETED/FAILED/CANCELLED stamp `completed_at` and the error message.
    pub fn update_job_status(
        &self,
        job_id: i64,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn();
        retry_busy("update_job_status", || {
            match status {
                JobStatus::Running => conn.execute(
                    "UPDATE jobs SET status = ?1, started_at = ?2 WHERE job_id = ?3",
                    params![status.code(), now_epoch_ms(), job_id],
                ),
                JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => conn.execute(
                    "UPDATE jobs SET status = ?1, completed_at = ?2, error_message = ?3 \
                     WHERE job_id = ?4",
                    params![status.code(), now_epoch_ms(), error.unwrap_or(""), job_id],
                ),
                JobStatus::Pending => conn.execute(
                    "UPDATE jobs SET status = ?1 WHERE job_id = ?2",
                    params![status.code(), job_id],
                ),
            }?;
            Ok(())
        })
    }

    pub fn update_job_stats(&self, job_id: i64, counters: JobCounters) -> Result<()> {
        let conn = self.conn();
        retry_busy("update_job_stats", || {
            conn.execute(
                "UPDATE jobs SET total_bytes = ?1, processed_bytes = ?2, stored_bytes = ?3, \
                 dedup_savings = ?4, file_count = ?5 WHERE job_id = ?6",
                params![
                    counters.total_bytes as i64,
                    counters.processed_bytes as i64,
                    counters.stored_bytes as i64,
                    counters.dedup_savings as i64,
                    counters.file_count,
                    job_id,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_job(&self, job_id: i64) -> Result<Option<BackupJob>> {
        let conn = self.conn();
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"),
                params![job_id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    pub fn get_all_jobs(&self) -> Result<Vec<BackupJob>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC"))?;
        let jobs = stmt
            .query_map([], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    pub fn get_jobs_by_status(&self, status: JobStatus) -> Result<Vec<BackupJob>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 \
             ORDER BY priority DESC, created_at ASC"
        ))?;
        let jobs = stmt
            .query_map(params![status.code()], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    // ─── Chunks ──────────────────────────────────────────────────────

    /// Record a stored chunk with insert-or-increment semantics: the first
    /// writer of a hash creates the row with `ref_count = 1`, every later
    /// writer bumps the count. Runs in one IMMEDIATE transaction so two
    /// concurrent insertions of the same hash cannot both create a row.
    pub fn store_chunk(&self, record: &ChunkRecord) -> Result<()> {
        let mut conn = self.conn();
        retry_busy("store_chunk", || {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO chunks \
                 (hash, storage_path, original_size, stored_size, compression, encrypted, ref_count) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
                params![
                    record.hash.to_hex(),
                    record.storage_path,
                    record.original_size,
                    record.stored_size,
                    record.compression.code(),
                    record.encrypted,
                ],
            )?;
            if inserted == 0 {
                tx.execute(
                    "UPDATE chunks SET ref_count = ref_count + 1 WHERE hash = ?1",
                    params![record.hash.to_hex()],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Bump the reference count of an existing chunk, e.g. when a new
    /// manifest references it without rewriting it.
    pub fn increment_chunk_ref(&self, hash: &Hash) -> Result<()> {
        let conn = self.conn();
        retry_busy("increment_chunk_ref", || {
            conn.execute(
                "UPDATE chunks SET ref_count = ref_count + 1 WHERE hash = ?1",
                params![hash.to_hex()],
            )?;
            Ok(())
        })
    }

    pub fn chunk_exists(&self, hash: &Hash) -> Result<bool> {
        let conn = self.conn();
        let found = conn
            .query_row(
                "SELECT 1 FROM chunks WHERE hash = ?1",
                params![hash.to_hex()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get_chunk_path(&self, hash: &Hash) -> Result<Option<String>> {
        let conn = self.conn();
        let path = conn
            .query_row(
                "SELECT storage_path FROM chunks WHERE hash = ?1",
                params![hash.to_hex()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(path)
    }

    pub fn get_chunk_meta(&self, hash: &Hash) -> Result<Option<ChunkRecord>> {
        let conn = self.conn();
        let record = conn
            .query_row(
                "SELECT hash, storage_path, original_size, stored_size, compression, encrypted, \
                 ref_count FROM chunks WHERE hash = ?1",
                params![hash.to_hex()],
                row_to_chunk_record,
            )
            .optional()?;
        Ok(record)
    }

    pub fn chunk_count(&self) -> Result<i64> {
        let conn = self.conn();
        Ok(conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?)
    }

    // ─── File manifests ──────────────────────────────────────────────

    /// Insert a manifest header and all of its chunk references in one
    /// transaction; partial failure rolls everything back.
    pub fn store_file_manifest(&self, job_id: i64, manifest: &FileManifest) -> Result<()> {
        let mut conn = self.conn();
        retry_busy("store_file_manifest", || {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT INTO file_manifests \
                 (job_id, file_path, file_name, file_size, modified_time, file_hash) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    job_id,
                    manifest.relative_path,
                    manifest.file_name,
                    manifest.file_size as i64,
                    manifest.modified_time,
                    manifest.file_hash.map(|h| h.to_hex()).unwrap_or_default(),
                ],
            )?;
            let manifest_id = tx.last_insert_rowid();

            let mut stmt = tx.prepare(
                "INSERT INTO file_chunks \
                 (manifest_id, chunk_hash, chunk_index, offset, size, deduplicated) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for chunk in &manifest.chunks {
                stmt.execute(params![
                    manifest_id,
                    chunk.hash.to_hex(),
                    chunk.index,
                    chunk.offset as i64,
                    chunk.size,
                    chunk.deduplicated,
                ])?;
            }
            drop(stmt);
            tx.commit()?;
            Ok(())
        })
    }

    /// All manifests of a job, each with its chunk refs in ascending index.
    pub fn get_file_manifests(&self, job_id: i64) -> Result<Vec<FileManifest>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT manifest_id, file_path, file_name, file_size, modified_time, file_hash \
             FROM file_manifests WHERE job_id = ?1 ORDER BY manifest_id",
        )?;
        let headers = stmt
            .query_map(params![job_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut chunk_stmt = conn.prepare(
            "SELECT chunk_hash, chunk_index, offset, size, deduplicated \
             FROM file_chunks WHERE manifest_id = ?1 ORDER BY chunk_index ASC",
        )?;

        let mut manifests = Vec::with_capacity(headers.len());
        for (manifest_id, file_path, file_name, file_size, modified_time, hash_hex) in headers {
            let chunks = chunk_stmt
                .query_map(params![manifest_id], row_to_chunk_ref)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let file_hash = if hash_hex.is_empty() {
                None
            } else {
                Some(Hash::from_hex(&hash_hex)?)
            };
            manifests.push(FileManifest {
                relative_path: file_path,
                file_name,
                file_size: file_size as u64,
                modified_time,
                file_hash,
                chunks,
            });
        }
        Ok(manifests)
    }

    // ─── Encryption keys ─────────────────────────────────────────────

    pub fn store_encryption_key(&self, job_id: i64, key_hex: &str) -> Result<()> {
        let conn = self.conn();
        retry_busy("store_encryption_key", || {
            conn.execute(
                "INSERT OR REPLACE INTO encryption_keys (job_id, key_hex) VALUES (?1, ?2)",
                params![job_id, key_hex],
            )?;
            Ok(())
        })
    }

    pub fn get_encryption_key(&self, job_id: i64) -> Result<Option<String>> {
        let conn = self.conn();
        let key = conn
            .query_row(
                "SELECT key_hex FROM encryption_keys WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(key)
    }

    /// Install `candidate_hex` as the repository master key unless one
    /// already exists; returns the winning key. Single IMMEDIATE transaction
    /// so concurrent first-time writers agree on one key.
    pub fn ensure_master_key(&self, candidate_hex: &str) -> Result<String> {
        let mut conn = self.conn();
        retry_busy("ensure_master_key", || {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT OR IGNORE INTO meta (key, value) VALUES (?1, ?2)",
                params![MASTER_KEY_META, candidate_hex],
            )?;
            let winner: String = tx.query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![MASTER_KEY_META],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(winner)
        })
    }

    // ─── Dependencies ────────────────────────────────────────────────

    pub fn add_dependency(&self, job_id: i64, depends_on: i64) -> Result<()> {
        let conn = self.conn();
        retry_busy("add_dependency", || {
            conn.execute(
                "INSERT OR IGNORE INTO job_dependencies (job_id, depends_on) VALUES (?1, ?2)",
                params![job_id, depends_on],
            )?;
            Ok(())
        })
    }

    pub fn get_dependencies(&self, job_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT depends_on FROM job_dependencies WHERE job_id = ?1")?;
        let deps = stmt
            .query_map(params![job_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(deps)
    }

    // ─── Statistics ──────────────────────────────────────────────────

    pub fn get_stats(&self) -> Result<StoreStats> {
        let conn = self.conn();
        let mut stats = StoreStats::default();

        stats.total_jobs = conn.query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))?;
        stats.completed_jobs = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            params![JobStatus::Completed.code()],
            |r| r.get(0),
        )?;
        stats.failed_jobs = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            params![JobStatus::Failed.code()],
            |r| r.get(0),
        )?;
        let (chunks, stored): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(stored_size), 0) FROM chunks",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        stats.total_chunks = chunks;
        stats.total_stored_bytes = stored as u64;
        let savings: i64 = conn.query_row(
            "SELECT COALESCE(SUM(dedup_savings), 0) FROM jobs",
            [],
            |r| r.get(0),
        )?;
        stats.total_dedup_savings = savings as u64;
        stats.total_files =
            conn.query_row("SELECT COUNT(*) FROM file_manifests", [], |r| r.get(0))?;
        Ok(stats)
    }
}

const JOB_COLUMNS: &str = "job_id, source_path, backup_name, status, priority, compression, \
                           encrypt, incremental, parent_job_id, created_at, started_at, \
                           completed_at, total_bytes, processed_bytes, stored_bytes, \
                           dedup_savings, file_count, error_message";

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<BackupJob> {
    Ok(BackupJob {
        job_id: row.get(0)?,
        source_path: row.get(1)?,
        backup_name: row.get(2)?,
        status: JobStatus::from_code(row.get(3)?).unwrap_or_default(),
        priority: JobPriority::from_code(row.get(4)?).unwrap_or_default(),
        compression: Compression::from_code(row.get(5)?).unwrap_or_default(),
        encrypt: row.get(6)?,
        incremental: row.get(7)?,
        parent_job_id: row.get(8)?,
        created_at: row.get(9)?,
        started_at: row.get(10)?,
        completed_at: row.get(11)?,
        total_bytes: row.get::<_, i64>(12)? as u64,
        processed_bytes: row.get::<_, i64>(13)? as u64,
        stored_bytes: row.get::<_, i64>(14)? as u64,
        dedup_savings: row.get::<_, i64>(15)? as u64,
        file_count: row.get(16)?,
        error_message: row.get(17)?,
        dependencies: Vec::new(),
    })
}

fn row_to_chunk_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRecord> {
    let hash_hex: String = row.get(0)?;
    let hash = Hash::from_hex(&hash_hex).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("bad chunk hash: {hash_hex}").into(),
        )
    })?;
    Ok(ChunkRecord {
        hash,
        storage_path: row.get(1)?,
        original_size: row.get(2)?,
        stored_size: row.get(3)?,
        compression: Compression::from_code(row.get(4)?).unwrap_or(Compression::None),
        encrypted: row.get(5)?,
        ref_count: row.get(6)?,
    })
}

fn row_to_chunk_ref(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRef> {
    let hash_hex: String = row.get(0)?;
    let hash = Hash::from_hex(&hash_hex).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("bad chunk hash: {hash_hex}").into(),
        )
    })?;
    Ok(ChunkRef {
        hash,
        index: row.get(1)?,
        offset: row.get::<_, i64>(2)? as u64,
        size: row.get(3)?,
        deduplicated: row.get(4)?,
    })
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}

/// Retry a write closure on SQLITE_BUSY with linear backoff
/// (50 ms x attempt, up to [`SQLITE_MAX_RETRIES`] attempts).
fn retry_busy<T>(op: &str, mut f: impl FnMut() -> rusqlite::Result<T>) -> Result<T> {
    let mut attempt = 0u32;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if is_busy(&e) && attempt + 1 < SQLITE_MAX_RETRIES => {
                attempt += 1;
                warn!(op, attempt, max = SQLITE_MAX_RETRIES, "metadata store busy, retrying");
                std::thread::sleep(Duration::from_millis(50 * u64::from(attempt)));
            }
            Err(e) => return Err(EcpbError::Metadata(e)),
        }
    }
}
