use serde::{Deserialize, Serialize};

use crate::compress::Compression;
use crate::crypto::sha256::Hash;

/// Fixed chunk size. The last chunk of a file may be smaller.
pub const CHUNK_SIZE: usize = 64 * 1024;

pub const AES_KEY_LEN: usize = 32;
pub const AES_IV_LEN: usize = 16;

pub const SQLITE_BUSY_TIMEOUT_MS: u64 = 5000;
pub const SQLITE_MAX_RETRIES: u32 = 10;

pub const MAX_WORKER_PROCESSES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn code(self) -> i64 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Completed => 2,
            JobStatus::Failed => 3,
            JobStatus::Cancelled => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(JobStatus::Pending),
            1 => Some(JobStatus::Running),
            2 => Some(JobStatus::Completed),
            3 => Some(JobStatus::Failed),
            4 => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl JobPriority {
    pub fn code(self) -> i64 {
        match self {
            JobPriority::Low => 0,
            JobPriority::Normal => 1,
            JobPriority::High => 2,
            JobPriority::Urgent => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(JobPriority::Low),
            1 => Some(JobPriority::Normal),
            2 => Some(JobPriority::High),
            3 => Some(JobPriority::Urgent),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobPriority::Low => "LOW",
            JobPriority::Normal => "NORMAL",
            JobPriority::High => "HIGH",
            JobPriority::Urgent => "URGENT",
        }
    }
}

/// One chunk's position inside a file manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub hash: Hash,
    /// 0-based, contiguous within the manifest.
    pub index: u32,
    /// Byte offset of this chunk in the original file.
    pub offset: u64,
    /// Size of the original (pre-transform) bytes.
    pub size: u32,
    /// True when an identical chunk already existed at store time.
    pub deduplicated: bool,
}

/// Describes a single backed-up file as an ordered list of chunks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileManifest {
    /// Path relative to the job's source root.
    pub relative_path: String,
    pub file_name: String,
    pub file_size: u64,
    /// Modification time, epoch milliseconds.
    pub modified_time: i64,
    pub file_hash: Option<Hash>,
    pub chunks: Vec<ChunkRef>,
}

/// Durable record of a stored chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub hash: Hash,
    pub storage_path: String,
    pub original_size: u32,
    pub stored_size: u32,
    pub compression: Compression,
    pub encrypted: bool,
    pub ref_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    pub job_id: i64,
    pub source_path: String,
    pub backup_name: String,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub compression: Compression,
    pub encrypt: bool,
    /// Persisted but reserved; the current pipeline always performs a full walk.
    pub incremental: bool,
    pub parent_job_id: Option<i64>,
    pub created_at: i64,
    pub started_at: i64,
    pub completed_at: i64,
    pub total_bytes: u64,
    pub processed_bytes: u64,
    pub stored_bytes: u64,
    pub dedup_savings: u64,
    pub file_count: i64,
    pub error_message: String,
    pub dependencies: Vec<i64>,
}

impl Default for BackupJob {
    fn default() -> Self {
        Self {
            job_id: -1,
            source_path: String::new(),
            backup_name: String::new(),
            status: JobStatus::Pending,
            priority: JobPriority::Normal,
            compression: Compression::Lz4,
            encrypt: true,
            incremental: false,
            parent_job_id: None,
            created_at: 0,
            started_at: 0,
            completed_at: 0,
            total_bytes: 0,
            processed_bytes: 0,
            stored_bytes: 0,
            dedup_savings: 0,
            file_count: 0,
            error_message: String::new(),
            dependencies: Vec::new(),
        }
    }
}

/// Aggregate byte and file counters for a finished (or running) job.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobCounters {
    pub total_bytes: u64,
    pub processed_bytes: u64,
    pub stored_bytes: u64,
    pub dedup_savings: u64,
    pub file_count: i64,
}

pub fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}
