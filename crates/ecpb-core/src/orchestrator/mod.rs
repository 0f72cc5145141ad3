use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, error, info};

use crate::chunkstore::ChunkStore;
use crate::config::DataDir;
use crate::crypto::aes_cbc::JobKey;
use crate::db::MetaStore;
use crate::error::{EcpbError, Result};
use crate::ipc::{ProgressChannel, ProgressKind, ProgressMessage, SharedRegion, WorkerSemaphore};
use crate::sched::JobScheduler;
use crate::snapshot::SnapshotBuilder;
use crate::types::{format_bytes, now_epoch_ms, BackupJob, JobStatus, MAX_WORKER_PROCESSES};
use crate::worker::BackupWorker;

/// Poll interval when the ready set is empty but work remains.
const IDLE_SLEEP: Duration = Duration::from_millis(100);

/// Name of the shared progress board file inside the data dir.
const BOARD_FILE: &str = ".worker_board";

struct ActiveWorker {
    job_id: i64,
    slot: usize,
    started_at: i64,
}

/// Drives jobs from the scheduler through workers, either inline in this
/// process or as forked worker processes bounded by a counting semaphore.
pub struct Orchestrator {
    data_dir: DataDir,
    store: Arc<MetaStore>,
    chunk_store: ChunkStore,
    snapshots: SnapshotBuilder,
    scheduler: JobScheduler,
    channel: ProgressChannel,
    semaphore: WorkerSemaphore,
    board: SharedRegion,
    running: AtomicBool,
    active: HashMap<Pid, ActiveWorker>,
}

impl Orchestrator {
    pub fn new(data_dir: DataDir) -> Result<Self> {
        data_dir.ensure()?;
        let store = Arc::new(MetaStore::open(&data_dir.db_path())?);
        let chunk_store = ChunkStore::new(store.clone(), data_dir.storage_dir())?;
        let snapshots = SnapshotBuilder::new(data_dir.snapshots_dir());
        let scheduler = JobScheduler::new(store.clone());
        let channel = ProgressChannel::new()?;
        let board = SharedRegion::create(&data_dir.root().join(BOARD_FILE), MAX_WORKER_PROCESSES)?;

        Ok(Self {
            data_dir,
            store,
            chunk_store,
            snapshots,
            scheduler,
            channel,
            semaphore: WorkerSemaphore::new(MAX_WORKER_PROCESSES),
            board,
            running: AtomicBool::new(false),
            active: HashMap::new(),
        })
    }

    pub fn store(&self) -> &Arc<MetaStore> {
        &self.store
    }

    pub fn chunk_store(&self) -> &ChunkStore {
        &self.chunk_store
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub fn submit_job(&self, mut job: BackupJob) -> Result<i64> {
        self.scheduler.submit(&mut job)
    }

    pub fn add_dependency(&self, job_id: i64, prerequisite: i64) -> Result<()> {
        self.scheduler.add_dependency(job_id, prerequisite)
    }

    pub fn active_worker_count(&self) -> usize {
        self.active.len()
    }

    /// Stop admitting new jobs. Running workers are left to finish.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Run every schedulable job inline in this process, in scheduler
    /// order, until no PENDING jobs remain.
    pub fn run_single_process(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!("orchestrator started (single-process mode)");

        while self.running.load(Ordering::SeqCst) {
            let ready = self.scheduler.get_ready_jobs()?;
            if ready.is_empty() {
                if self.store.get_jobs_by_status(JobStatus::Pending)?.is_empty() {
                    break;
                }
                thread::sleep(IDLE_SLEEP);
                continue;
            }

            for job in ready {
                if !self.running.load(Ordering::SeqCst) {
                    self.scheduler.requeue(job.job_id);
                    continue;
                }
                let key = resolve_job_key(&self.store, job.encrypt)?;
                let worker = BackupWorker::new(&self.store, &self.chunk_store, &self.snapshots);
                match worker.execute(&job, key.as_ref(), None, None) {
                    Ok(_) => self.scheduler.mark_completed(job.job_id),
                    Err(e) => {
                        error!(job_id = job.job_id, error = %e, "job failed");
                        self.scheduler.mark_failed(job.job_id)?;
                    }
                }
            }
        }

        info!("orchestrator stopped");
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Run jobs in isolated forked worker processes, at most
    /// [`MAX_WORKER_PROCESSES`] at a time. Each iteration reaps finished
    /// children, drains progress messages, then spawns ready jobs for
    /// which a semaphore permit is available.
    pub fn run_multi_worker(&mut self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!("orchestrator started (multi-worker mode)");

        loop {
            self.reap_children()?;
            self.drain_messages();

            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            let ready = self.scheduler.get_ready_jobs()?;
            if ready.is_empty() {
                if self.store.get_jobs_by_status(JobStatus::Pending)?.is_empty()
                    && self.active.is_empty()
                {
                    break;
                }
                self.log_board_progress();
                thread::sleep(IDLE_SLEEP);
                continue;
            }

            for job in ready {
                if !self.semaphore.try_acquire() {
                    // No free worker slot; hand the job back for the next pull.
                    self.scheduler.requeue(job.job_id);
                    continue;
                }
                if let Err(e) = self.spawn_worker(&job) {
                    error!(job_id = job.job_id, error = %e, "failed to spawn worker");
                    self.semaphore.release();
                    self.scheduler.mark_failed(job.job_id)?;
                }
            }
        }

        while !self.active.is_empty() {
            self.reap_children()?;
            self.drain_messages();
            thread::sleep(IDLE_SLEEP);
        }

        info!("orchestrator stopped");
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn spawn_worker(&mut self, job: &BackupJob) -> Result<()> {
        let slot = self.free_slot();

        match unsafe { fork() }.map_err(|e| EcpbError::Worker(format!("fork failed: {e}")))? {
            ForkResult::Child => {
                // The inherited database handle is unusable after fork; the
                // child opens everything fresh and exits without unwinding so
                // the parent's handles are never dropped here.
                let code =
                    match child_main(&self.data_dir, job, &self.channel, &self.board, slot) {
                        Ok(()) => 0,
                        Err(e) => {
                            error!(job_id = job.job_id, error = %e, "worker failed");
                            1
                        }
                    };
                std::process::exit(code);
            }
            ForkResult::Parent { child } => {
                info!(pid = child.as_raw(), job_id = job.job_id, "forked worker");
                self.active.insert(
                    child,
                    ActiveWorker {
                        job_id: job.job_id,
                        slot,
                        started_at: now_epoch_ms(),
                    },
                );
                Ok(())
            }
        }
    }

    fn free_slot(&self) -> usize {
        (0..MAX_WORKER_PROCESSES)
            .find(|slot| !self.active.values().any(|w| w.slot == *slot))
            .unwrap_or(0)
    }

    fn reap_children(&mut self) -> Result<()> {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => self.finish_worker(pid, code == 0)?,
                Ok(WaitStatus::Signaled(pid, _, _)) => self.finish_worker(pid, false)?,
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => break,
                Err(nix::errno::Errno::ECHILD) => break,
                Err(e) => return Err(EcpbError::Worker(format!("waitpid failed: {e}"))),
            }
        }
        Ok(())
    }

    fn finish_worker(&mut self, pid: Pid, success: bool) -> Result<()> {
        let Some(worker) = self.active.remove(&pid) else {
            return Ok(());
        };
        if success {
            info!(
                pid = pid.as_raw(),
                job_id = worker.job_id,
                runtime_ms = now_epoch_ms() - worker.started_at,
                "worker exited successfully"
            );
            self.scheduler.mark_completed(worker.job_id);
        } else {
            error!(pid = pid.as_raw(), job_id = worker.job_id, "worker failed");
            self.scheduler.mark_failed(worker.job_id)?;
        }
        self.board.clear(worker.slot);
        self.semaphore.release();
        Ok(())
    }

    fn drain_messages(&self) {
        while let Some(msg) = self.channel.try_recv() {
            self.log_message(&msg);
        }
    }

    fn log_message(&self, msg: &ProgressMessage) {
        match msg.kind {
            ProgressKind::JobStart => {
                debug!(job_id = msg.job_id, pid = msg.worker_pid, "job started")
            }
            ProgressKind::JobProgress => debug!(
                job_id = msg.job_id,
                processed = %format_bytes(msg.value1),
                total = %format_bytes(msg.value2),
                "job progress"
            ),
            ProgressKind::JobComplete => {
                info!(job_id = msg.job_id, pid = msg.worker_pid, "job reports completion")
            }
            ProgressKind::JobFailed => {
                error!(job_id = msg.job_id, pid = msg.worker_pid, "job reports failure")
            }
        }
    }

    fn log_board_progress(&self) {
        for worker in self.active.values() {
            let slot = self.board.read(worker.slot);
            if slot.job_id == worker.job_id && slot.total > 0 {
                debug!(
                    job_id = slot.job_id,
                    processed = %format_bytes(slot.processed),
                    total = %format_bytes(slot.total),
                    "worker progress"
                );
            }
        }
    }
}

/// Resolve the encryption key for a job: the repository master key,
/// created on first use and recorded per job for restore.
pub fn resolve_job_key(store: &MetaStore, encrypt: bool) -> Result<Option<JobKey>> {
    if !encrypt {
        return Ok(None);
    }
    let candidate = JobKey::generate();
    let winner_hex = store.ensure_master_key(&candidate.to_hex())?;
    Ok(Some(JobKey::from_hex(&winner_hex)?))
}

fn child_main(
    data_dir: &DataDir,
    job: &BackupJob,
    channel: &ProgressChannel,
    board: &SharedRegion,
    slot: usize,
) -> Result<()> {
    let store = Arc::new(MetaStore::open(&data_dir.db_path())?);
    let chunk_store = ChunkStore::new(store.clone(), data_dir.storage_dir())?;
    let snapshots = SnapshotBuilder::new(data_dir.snapshots_dir());
    let key = resolve_job_key(&store, job.encrypt)?;

    let worker = BackupWorker::new(&store, &chunk_store, &snapshots);
    worker.execute(job, key.as_ref(), Some(channel), Some((board, slot)))?;
    Ok(())
}
