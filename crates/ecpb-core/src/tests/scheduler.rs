use crate::error::EcpbError;
use crate::sched::JobScheduler;
use crate::testutil::test_repo;
use crate::types::{BackupJob, JobPriority, JobStatus};

fn job(name: &str, priority: JobPriority) -> BackupJob {
    BackupJob {
        source_path: "/tmp/src".into(),
        backup_name: name.into(),
        priority,
        ..BackupJob::default()
    }
}

#[test]
fn submit_persists_and_queues() {
    let repo = test_repo();
    let sched = JobScheduler::new(repo.store.clone());

    let mut j = job("first", JobPriority::Normal);
    let id = sched.submit(&mut j).unwrap();
    assert_eq!(j.job_id, id);
    assert_eq!(sched.pending_count(), 1);
    assert_eq!(
        repo.store.get_job(id).unwrap().unwrap().status,
        JobStatus::Pending
    );
}

#[test]
fn ready_jobs_sorted_by_priority_then_age() {
    let repo = test_repo();
    let sched = JobScheduler::new(repo.store.clone());

    let low = sched.submit(&mut job("low", JobPriority::Low)).unwrap();
    let urgent = sched.submit(&mut job("urgent", JobPriority::Urgent)).unwrap();
    let normal_a = sched.submit(&mut job("na", JobPriority::Normal)).unwrap();
    let normal_b = sched.submit(&mut job("nb", JobPriority::Normal)).unwrap();

    let ready: Vec<i64> = sched
        .get_ready_jobs()
        .unwrap()
        .iter()
        .map(|j| j.job_id)
        .collect();
    assert_eq!(ready, vec![urgent, normal_a, normal_b, low]);
}

#[test]
fn ready_jobs_are_marked_in_progress() {
    let repo = test_repo();
    let sched = JobScheduler::new(repo.store.clone());
    sched.submit(&mut job("once", JobPriority::Normal)).unwrap();

    assert_eq!(sched.get_ready_jobs().unwrap().len(), 1);
    // Handed out once; not returned again until completed or requeued.
    assert!(sched.get_ready_jobs().unwrap().is_empty());
}

#[test]
fn requeue_returns_a_job_to_the_ready_set() {
    let repo = test_repo();
    let sched = JobScheduler::new(repo.store.clone());
    let id = sched.submit(&mut job("again", JobPriority::Normal)).unwrap();

    assert_eq!(sched.get_ready_jobs().unwrap().len(), 1);
    sched.requeue(id);
    assert_eq!(sched.get_ready_jobs().unwrap().len(), 1);
}

#[test]
fn dependencies_gate_readiness() {
    let repo = test_repo();
    let sched = JobScheduler::new(repo.store.clone());

    let first = sched.submit(&mut job("first", JobPriority::Normal)).unwrap();
    let mut second = job("second", JobPriority::Urgent);
    second.dependencies = vec![first];
    let second_id = sched.submit(&mut second).unwrap();

    let ready: Vec<i64> = sched
        .get_ready_jobs()
        .unwrap()
        .iter()
        .map(|j| j.job_id)
        .collect();
    assert_eq!(ready, vec![first]);

    repo.store
        .update_job_status(first, JobStatus::Completed, None)
        .unwrap();
    sched.mark_completed(first);

    let ready: Vec<i64> = sched
        .get_ready_jobs()
        .unwrap()
        .iter()
        .map(|j| j.job_id)
        .collect();
    assert_eq!(ready, vec![second_id]);
}

#[test]
fn cycle_closing_dependency_is_rejected() {
    let repo = test_repo();
    let sched = JobScheduler::new(repo.store.clone());

    let a = sched.submit(&mut job("a", JobPriority::Normal)).unwrap();
    let mut b = job("b", JobPriority::Normal);
    b.dependencies = vec![a];
    let b = sched.submit(&mut b).unwrap();

    let err = sched.add_dependency(a, b).unwrap_err();
    assert!(matches!(err, EcpbError::CycleRejected { .. }));
    // The rejected edge must not reach the metadata store.
    assert!(repo.store.get_dependencies(a).unwrap().is_empty());
}

#[test]
fn failure_cancels_direct_dependents() {
    let repo = test_repo();
    let sched = JobScheduler::new(repo.store.clone());

    let j1 = sched.submit(&mut job("j1", JobPriority::Normal)).unwrap();
    let mut second = job("j2", JobPriority::Normal);
    second.dependencies = vec![j1];
    let j2 = sched.submit(&mut second).unwrap();

    sched.mark_failed(j1).unwrap();

    let failed = repo.store.get_job(j1).unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);

    let cancelled = repo.store.get_job(j2).unwrap().unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(cancelled.error_message, format!("Dependency job {j1} failed"));

    // The cancelled job is ready by in-degree but filtered by status.
    assert!(sched.get_ready_jobs().unwrap().is_empty());
}

#[test]
fn mark_failed_keeps_worker_error_message() {
    let repo = test_repo();
    let sched = JobScheduler::new(repo.store.clone());
    let id = sched.submit(&mut job("j", JobPriority::Normal)).unwrap();

    repo.store
        .update_job_status(id, JobStatus::Failed, Some("Failed to create snapshot"))
        .unwrap();
    sched.mark_failed(id).unwrap();

    let failed = repo.store.get_job(id).unwrap().unwrap();
    assert_eq!(failed.error_message, "Failed to create snapshot");
}
