pub mod dag;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::db::MetaStore;
use crate::error::{EcpbError, Result};
use crate::types::{now_epoch_ms, BackupJob, JobPriority, JobStatus};

use self::dag::JobDag;

#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    job_id: i64,
    priority: JobPriority,
    created_at: i64,
}

// Max-heap order: higher priority first, then older first.
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.job_id.cmp(&self.job_id))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct SchedulerState {
    queue: BinaryHeap<QueueEntry>,
    dag: JobDag,
    in_progress: HashSet<i64>,
}

/// In-memory coordinator over pending and running jobs: a priority heap
/// for ordering and a dependency DAG for readiness. All operations are
/// mutually exclusive under a single lock.
pub struct JobScheduler {
    store: Arc<MetaStore>,
    state: Mutex<SchedulerState>,
}

impl JobScheduler {
    pub fn new(store: Arc<MetaStore>) -> Self {
        Self {
            store,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Persist the job and enter it into the queue and DAG. A declared
    /// dependency that would close a cycle is rejected with a warning;
    /// the job itself still submits.
    pub fn submit(&self, job: &mut BackupJob) -> Result<i64> {
        let mut state = self.state();
        let job_id = self.store.create_job(job)?;
        job.job_id = job_id;

        state.queue.push(QueueEntry {
            job_id,
            priority: job.priority,
            created_at: now_epoch_ms(),
        });
        state.dag.add_node(job_id);

        for dep in job.dependencies.clone() {
            if let Err(e) = self.add_dependency_locked(&mut state, job_id, dep) {
                warn!(job_id, prerequisite = dep, error = %e, "dependency rejected");
            }
        }

        info!(
            job_id,
            name = %job.backup_name,
            priority = job.priority.as_str(),
            "job submitted"
        );
        Ok(job_id)
    }

    /// Declare that `job_id` must wait for `prerequisite`.
    pub fn add_dependency(&self, job_id: i64, prerequisite: i64) -> Result<()> {
        let mut state = self.state();
        self.add_dependency_locked(&mut state, job_id, prerequisite)
    }

    fn add_dependency_locked(
        &self,
        state: &mut SchedulerState,
        job_id: i64,
        prerequisite: i64,
    ) -> Result<()> {
        if !state.dag.add_edge(prerequisite, job_id) {
            return Err(EcpbError::CycleRejected {
                dependent: job_id,
                prerequisite,
            });
        }
        self.store.add_dependency(job_id, prerequisite)?;
        debug!(job_id, prerequisite, "dependency registered");
        Ok(())
    }

    /// The ready set: jobs with no unfinished prerequisites, persisted
    /// status PENDING, and not already handed out. Returned sorted by
    /// priority (descending) then age (oldest first), and atomically
    /// marked in-progress.
    pub fn get_ready_jobs(&self) -> Result<Vec<BackupJob>> {
        let mut state = self.state();
        let mut ready = Vec::new();
        for node in state.dag.ready_nodes() {
            if state.in_progress.contains(&node) {
                continue;
            }
            let Some(job) = self.store.get_job(node)? else {
                continue;
            };
            if job.status != JobStatus::Pending {
                continue;
            }
            state.in_progress.insert(node);
            ready.push(job);
        }

        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(ready)
    }

    /// Remove a finished job; its dependents' in-degrees drop, which may
    /// make them ready on the next pull.
    pub fn mark_completed(&self, job_id: i64) {
        let mut state = self.state();
        state.dag.remove_node(job_id);
        state.in_progress.remove(&job_id);
        state.queue.retain(|e| e.job_id != job_id);
        info!(job_id, "job marked completed");
    }

    /// Record a failure and cancel the job's direct dependents. Cancelled
    /// jobs never run; their own dependents become ready by in-degree but
    /// are filtered out of the ready set by their status.
    pub fn mark_failed(&self, job_id: i64) -> Result<()> {
        let mut state = self.state();

        // Keep a more specific error message if the worker already set one.
        let already_failed = self
            .store
            .get_job(job_id)?
            .map(|j| j.status == JobStatus::Failed)
            .unwrap_or(false);
        if !already_failed {
            self.store
                .update_job_status(job_id, JobStatus::Failed, Some("Worker process failed"))?;
        }

        for dependent in state.dag.dependents(job_id) {
            self.store.update_job_status(
                dependent,
                JobStatus::Cancelled,
                Some(&format!("Dependency job {job_id} failed")),
            )?;
            warn!(job_id = dependent, failed_dependency = job_id, "job cancelled");
        }

        state.dag.remove_node(job_id);
        state.in_progress.remove(&job_id);
        state.queue.retain(|e| e.job_id != job_id);
        Ok(())
    }

    /// Hand a job back after `get_ready_jobs` marked it in-progress but the
    /// orchestrator could not start it (e.g. no free worker slot).
    pub fn requeue(&self, job_id: i64) {
        self.state().in_progress.remove(&job_id);
    }

    pub fn pending_count(&self) -> usize {
        self.state().queue.len()
    }
}
