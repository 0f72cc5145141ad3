use std::fs::OpenOptions;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use memmap2::MmapMut;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::Result;
use crate::types::now_epoch_ms;

// ─── Progress channel ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressKind {
    JobStart,
    JobProgress,
    JobComplete,
    JobFailed,
}

/// One progress datagram from a worker to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub kind: ProgressKind,
    pub job_id: i64,
    pub worker_pid: u32,
    /// Meaning depends on `kind`; for JobProgress: processed bytes.
    pub value1: u64,
    /// For JobProgress: total bytes.
    pub value2: u64,
}

impl ProgressMessage {
    pub fn new(kind: ProgressKind, job_id: i64, value1: u64, value2: u64) -> Self {
        Self {
            kind,
            job_id,
            worker_pid: std::process::id(),
            value1,
            value2,
        }
    }
}

/// Bounded parent<->child message channel over a socketpair. Both ends are
/// non-blocking: a full kernel buffer drops the message rather than stalling
/// a worker, which is acceptable for progress traffic.
///
/// Created before fork; the child keeps the write end, the parent drains
/// the read end.
pub struct ProgressChannel {
    tx: UnixDatagram,
    rx: UnixDatagram,
}

impl ProgressChannel {
    pub fn new() -> Result<Self> {
        let (tx, rx) = UnixDatagram::pair()?;
        tx.set_nonblocking(true)?;
        rx.set_nonblocking(true)?;
        Ok(Self { tx, rx })
    }

    /// Fire-and-forget send; losses are tolerated by design.
    pub fn send(&self, msg: &ProgressMessage) {
        let Ok(buf) = rmp_serde::to_vec(msg) else {
            return;
        };
        if let Err(e) = self.tx.send(&buf) {
            trace!(error = %e, "progress message dropped");
        }
    }

    /// Pull one pending message, if any.
    pub fn try_recv(&self) -> Option<ProgressMessage> {
        let mut buf = [0u8; 256];
        match self.rx.recv(&mut buf) {
            Ok(n) => rmp_serde::from_slice(&buf[..n]).ok(),
            Err(_) => None,
        }
    }
}

// ─── Worker semaphore ────────────────────────────────────────────────

/// Counting semaphore bounding concurrent worker processes. Only the
/// coordinator acquires and releases, so an in-process primitive suffices.
pub struct WorkerSemaphore {
    permits: Mutex<usize>,
    capacity: usize,
}

impl WorkerSemaphore {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Mutex::new(capacity),
            capacity,
        }
    }

    /// Take a permit without blocking; false when none are free.
    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    pub fn release(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        if *permits < self.capacity {
            *permits += 1;
        }
    }

    pub fn available(&self) -> usize {
        *self.permits.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ─── Shared progress board ───────────────────────────────────────────

/// Bytes per worker slot: four aligned u64 fields.
const SLOT_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotProgress {
    pub job_id: i64,
    pub processed: u64,
    pub total: u64,
    /// Epoch ms of the last publish; doubles as a heartbeat.
    pub updated_at: i64,
}

/// File-backed shared memory region holding one progress slot per worker
/// process. The mapping is created before fork and inherited by children,
/// so workers publish without the message channel and the coordinator
/// reads without syscalls. Relaxed atomics: readers may see a slightly
/// stale mix of fields, which progress reporting tolerates.
pub struct SharedRegion {
    mmap: MmapMut,
    slots: usize,
}

impl SharedRegion {
    pub fn create(path: &Path, slots: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len((slots * SLOT_SIZE) as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { mmap, slots })
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    fn slot(&self, idx: usize) -> &[AtomicU64; 4] {
        assert!(idx < self.slots, "slot index out of range");
        // The mapping is page-aligned and slots are 32-byte multiples, so
        // every field is naturally aligned for AtomicU64.
        unsafe { &*(self.mmap.as_ptr().add(idx * SLOT_SIZE) as *const [AtomicU64; 4]) }
    }

    pub fn publish(&self, idx: usize, job_id: i64, processed: u64, total: u64) {
        let slot = self.slot(idx);
        slot[0].store(job_id as u64, Ordering::Relaxed);
        slot[1].store(processed, Ordering::Relaxed);
        slot[2].store(total, Ordering::Relaxed);
        slot[3].store(now_epoch_ms() as u64, Ordering::Relaxed);
    }

    pub fn read(&self, idx: usize) -> SlotProgress {
        let slot = self.slot(idx);
        SlotProgress {
            job_id: slot[0].load(Ordering::Relaxed) as i64,
            processed: slot[1].load(Ordering::Relaxed),
            total: slot[2].load(Ordering::Relaxed),
            updated_at: slot[3].load(Ordering::Relaxed) as i64,
        }
    }

    pub fn clear(&self, idx: usize) {
        let slot = self.slot(idx);
        for field in slot {
            field.store(0, Ordering::Relaxed);
        }
    }
}
