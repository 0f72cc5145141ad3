use crate::compress::Compression;
use crate::crypto::sha256;
use crate::testutil::test_repo;
use crate::types::{BackupJob, ChunkRecord, ChunkRef, FileManifest, JobCounters, JobStatus};

fn sample_job(name: &str) -> BackupJob {
    BackupJob {
        source_path: "/tmp/source".into(),
        backup_name: name.into(),
        ..BackupJob::default()
    }
}

fn sample_record(seed: u8) -> ChunkRecord {
    let hash = sha256::digest_bytes(&[seed; 16]);
    ChunkRecord {
        hash,
        storage_path: format!("/chunks/{}", hash.to_hex()),
        original_size: 16,
        stored_size: 12,
        compression: Compression::Lz4,
        encrypted: true,
        ref_count: 1,
    }
}

#[test]
fn create_and_get_job() {
    let repo = test_repo();
    let id = repo.store.create_job(&sample_job("nightly")).unwrap();
    assert!(id > 0);

    let job = repo.store.get_job(id).unwrap().unwrap();
    assert_eq!(job.job_id, id);
    assert_eq!(job.backup_name, "nightly");
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.created_at > 0);
    assert_eq!(job.started_at, 0);

    assert!(repo.store.get_job(9999).unwrap().is_none());
}

#[test]
fn job_ids_are_unique_and_increasing() {
    let repo = test_repo();
    let a = repo.store.create_job(&sample_job("a")).unwrap();
    let b = repo.store.create_job(&sample_job("b")).unwrap();
    assert!(b > a);
    assert_eq!(repo.store.get_all_jobs().unwrap().len(), 2);
}

#[test]
fn status_transitions_stamp_timestamps() {
    let repo = test_repo();
    let id = repo.store.create_job(&sample_job("stamps")).unwrap();

    repo.store
        .update_job_status(id, JobStatus::Running, None)
        .unwrap();
    let running = repo.store.get_job(id).unwrap().unwrap();
    assert_eq!(running.status, JobStatus::Running);
    assert!(running.started_at > 0);
    assert_eq!(running.completed_at, 0);

    repo.store
        .update_job_status(id, JobStatus::Failed, Some("disk on fire"))
        .unwrap();
    let failed = repo.store.get_job(id).unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.completed_at > 0);
    assert_eq!(failed.error_message, "disk on fire");
}

#[test]
fn jobs_filtered_by_status() {
    let repo = test_repo();
    let a = repo.store.create_job(&sample_job("a")).unwrap();
    let _b = repo.store.create_job(&sample_job("b")).unwrap();
    repo.store
        .update_job_status(a, JobStatus::Completed, None)
        .unwrap();

    let pending = repo.store.get_jobs_by_status(JobStatus::Pending).unwrap();
    assert_eq!(pending.len(), 1);
    let completed = repo.store.get_jobs_by_status(JobStatus::Completed).unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].job_id, a);
}

#[test]
fn update_job_stats_persists_counters() {
    let repo = test_repo();
    let id = repo.store.create_job(&sample_job("stats")).unwrap();
    repo.store
        .update_job_stats(
            id,
            JobCounters {
                total_bytes: 1000,
                processed_bytes: 900,
                stored_bytes: 300,
                dedup_savings: 600,
                file_count: 7,
            },
        )
        .unwrap();

    let job = repo.store.get_job(id).unwrap().unwrap();
    assert_eq!(job.total_bytes, 1000);
    assert_eq!(job.processed_bytes, 900);
    assert_eq!(job.stored_bytes, 300);
    assert_eq!(job.dedup_savings, 600);
    assert_eq!(job.file_count, 7);
}

#[test]
fn store_chunk_increments_ref_count() {
    let repo = test_repo();
    let record = sample_record(1);

    repo.store.store_chunk(&record).unwrap();
    assert!(repo.store.chunk_exists(&record.hash).unwrap());
    assert_eq!(
        repo.store.get_chunk_meta(&record.hash).unwrap().unwrap().ref_count,
        1
    );

    // Second and third writers of the same hash only bump the count.
    repo.store.store_chunk(&record).unwrap();
    repo.store.store_chunk(&record).unwrap();
    let meta = repo.store.get_chunk_meta(&record.hash).unwrap().unwrap();
    assert_eq!(meta.ref_count, 3);
    assert_eq!(repo.store.chunk_count().unwrap(), 1);
    assert_eq!(meta.storage_path, record.storage_path);
    assert_eq!(meta.compression, Compression::Lz4);
    assert!(meta.encrypted);
}

#[test]
fn chunk_lookups_miss_cleanly() {
    let repo = test_repo();
    let hash = sha256::digest_bytes(b"never stored");
    assert!(!repo.store.chunk_exists(&hash).unwrap());
    assert!(repo.store.get_chunk_path(&hash).unwrap().is_none());
    assert!(repo.store.get_chunk_meta(&hash).unwrap().is_none());
}

#[test]
fn manifest_roundtrip_preserves_chunk_order() {
    let repo = test_repo();
    let job_id = repo.store.create_job(&sample_job("manifests")).unwrap();

    let chunks: Vec<ChunkRef> = (0..5u32)
        .map(|i| ChunkRef {
            hash: sha256::digest_bytes(&[i as u8; 8]),
            index: i,
            offset: u64::from(i) * 64,
            size: 64,
            deduplicated: i % 2 == 0,
        })
        .collect();

    let manifest = FileManifest {
        relative_path: "subdir/data.bin".into(),
        file_name: "data.bin".into(),
        file_size: 320,
        modified_time: 1_700_000_000_000,
        file_hash: Some(sha256::digest_bytes(b"whole file")),
        chunks,
    };
    repo.store.store_file_manifest(job_id, &manifest).unwrap();

    let loaded = repo.store.get_file_manifests(job_id).unwrap();
    assert_eq!(loaded.len(), 1);
    let got = &loaded[0];
    assert_eq!(got.relative_path, manifest.relative_path);
    assert_eq!(got.file_size, 320);
    assert_eq!(got.file_hash, manifest.file_hash);
    assert_eq!(got.chunks.len(), 5);
    for (i, chunk) in got.chunks.iter().enumerate() {
        assert_eq!(chunk.index, i as u32);
        assert_eq!(chunk, &manifest.chunks[i]);
    }

    assert!(repo.store.get_file_manifests(job_id + 1).unwrap().is_empty());
}

#[test]
fn encryption_key_roundtrip() {
    let repo = test_repo();
    let id = repo.store.create_job(&sample_job("keys")).unwrap();
    assert!(repo.store.get_encryption_key(id).unwrap().is_none());

    let key_hex = "ab".repeat(32);
    repo.store.store_encryption_key(id, &key_hex).unwrap();
    assert_eq!(repo.store.get_encryption_key(id).unwrap().unwrap(), key_hex);
}

#[test]
fn master_key_first_writer_wins() {
    let repo = test_repo();
    let first = repo.store.ensure_master_key(&"aa".repeat(32)).unwrap();
    assert_eq!(first, "aa".repeat(32));
    // A later candidate must not replace the installed key.
    let second = repo.store.ensure_master_key(&"bb".repeat(32)).unwrap();
    assert_eq!(second, first);
}

#[test]
fn dependencies_roundtrip() {
    let repo = test_repo();
    let a = repo.store.create_job(&sample_job("a")).unwrap();
    let b = repo.store.create_job(&sample_job("b")).unwrap();
    let c = repo.store.create_job(&sample_job("c")).unwrap();

    repo.store.add_dependency(c, a).unwrap();
    repo.store.add_dependency(c, b).unwrap();
    repo.store.add_dependency(c, b).unwrap(); // duplicate ignored

    let mut deps = repo.store.get_dependencies(c).unwrap();
    deps.sort();
    assert_eq!(deps, vec![a, b]);
    assert!(repo.store.get_dependencies(a).unwrap().is_empty());
}

#[test]
fn stats_aggregate_jobs_chunks_and_files() {
    let repo = test_repo();
    let a = repo.store.create_job(&sample_job("a")).unwrap();
    let b = repo.store.create_job(&sample_job("b")).unwrap();
    repo.store
        .update_job_status(a, JobStatus::Completed, None)
        .unwrap();
    repo.store
        .update_job_status(b, JobStatus::Failed, Some("boom"))
        .unwrap();
    repo.store
        .update_job_stats(
            a,
            JobCounters {
                dedup_savings: 42,
                ..JobCounters::default()
            },
        )
        .unwrap();

    repo.store.store_chunk(&sample_record(1)).unwrap();
    repo.store.store_chunk(&sample_record(2)).unwrap();

    let manifest = FileManifest {
        relative_path: "f".into(),
        file_name: "f".into(),
        ..FileManifest::default()
    };
    repo.store.store_file_manifest(a, &manifest).unwrap();

    let stats = repo.store.get_stats().unwrap();
    assert_eq!(stats.total_jobs, 2);
    assert_eq!(stats.completed_jobs, 1);
    assert_eq!(stats.failed_jobs, 1);
    assert_eq!(stats.total_chunks, 2);
    assert_eq!(stats.total_stored_bytes, 24);
    assert_eq!(stats.total_dedup_savings, 42);
    assert_eq!(stats.total_files, 1);
}

#[test]
fn reopening_the_store_preserves_data() {
    let repo = test_repo();
    let id = repo.store.create_job(&sample_job("durable")).unwrap();
    let record = sample_record(9);
    repo.store.store_chunk(&record).unwrap();

    let reopened = crate::db::MetaStore::open(&repo.data_dir.db_path()).unwrap();
    assert_eq!(
        reopened.get_job(id).unwrap().unwrap().backup_name,
        "durable"
    );
    assert!(reopened.chunk_exists(&record.hash).unwrap());
}
