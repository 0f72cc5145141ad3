use std::io::{self, Write};
use std::path::Path;

use ecpb_core::orchestrator::Orchestrator;
use ecpb_core::restore::RestoreEngine;
use ecpb_core::types::{format_bytes, now_epoch_ms, BackupJob, JobPriority};

use crate::jobs_table;

type MenuResult = Result<(), Box<dyn std::error::Error>>;

/// Interactive front-end, started when no action flag is given.
pub fn run(orchestrator: &mut Orchestrator) -> MenuResult {
    loop {
        println!();
        println!("ECPB - Enterprise Backup");
        println!("  1) Submit backup job");
        println!("  2) Run queued jobs (multi-worker)");
        println!("  3) List jobs");
        println!("  4) Restore a backup");
        println!("  5) Verify a backup");
        println!("  6) Show statistics");
        println!("  0) Quit");

        match prompt("Select: ")?.as_str() {
            "1" => submit_backup(orchestrator)?,
            "2" => {
                orchestrator.run_multi_worker()?;
                println!("All queued jobs processed.");
            }
            "3" => list_jobs(orchestrator)?,
            "4" => restore_backup(orchestrator)?,
            "5" => verify_backup(orchestrator)?,
            "6" => crate::run_stats(orchestrator)?,
            "0" | "q" => break,
            other => println!("Unknown choice: {other}"),
        }
    }
    Ok(())
}

fn prompt(label: &str) -> io::Result<String> {
    print!("{label}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn submit_backup(orchestrator: &Orchestrator) -> MenuResult {
    let source = prompt("Source path: ")?;
    if source.is_empty() {
        println!("No source given.");
        return Ok(());
    }
    let mut name = prompt("Backup name (empty for default): ")?;
    if name.is_empty() {
        name = format!("backup_{}", now_epoch_ms());
    }
    let priority = match prompt("Priority [low/normal/high/urgent] (default normal): ")?.as_str() {
        "low" => JobPriority::Low,
        "high" => JobPriority::High,
        "urgent" => JobPriority::Urgent,
        _ => JobPriority::Normal,
    };

    let job_id = orchestrator.submit_job(BackupJob {
        source_path: source,
        backup_name: name,
        priority,
        ..BackupJob::default()
    })?;
    println!("Job #{job_id} queued. Use option 2 to run it.");
    Ok(())
}

fn list_jobs(orchestrator: &Orchestrator) -> MenuResult {
    let jobs = orchestrator.store().get_all_jobs()?;
    if jobs.is_empty() {
        println!("No jobs yet.");
    } else {
        println!("{}", jobs_table(&jobs));
    }
    Ok(())
}

fn restore_backup(orchestrator: &Orchestrator) -> MenuResult {
    let engine = RestoreEngine::new(orchestrator.store(), orchestrator.chunk_store());
    let restorable = engine.list_restorable()?;
    if restorable.is_empty() {
        println!("No completed backups to restore.");
        return Ok(());
    }
    for job in &restorable {
        println!(
            "  #{} {} ({} files, {})",
            job.job_id,
            job.backup_name,
            job.file_count,
            format_bytes(job.total_bytes),
        );
    }

    let job_id: i64 = match prompt("Job id: ")?.parse() {
        Ok(id) => id,
        Err(_) => {
            println!("Not a job id.");
            return Ok(());
        }
    };
    let dest = prompt("Destination directory: ")?;
    if dest.is_empty() {
        println!("No destination given.");
        return Ok(());
    }

    let result = engine.restore_job(job_id, Path::new(&dest))?;
    if result.success {
        println!(
            "Restored {} files ({}).",
            result.files_restored,
            format_bytes(result.bytes_restored),
        );
    } else {
        println!(
            "Restore failed: {}",
            result.error.unwrap_or_else(|| "unknown error".into())
        );
    }
    Ok(())
}

fn verify_backup(orchestrator: &Orchestrator) -> MenuResult {
    let job_id: i64 = match prompt("Job id: ")?.parse() {
        Ok(id) => id,
        Err(_) => {
            println!("Not a job id.");
            return Ok(());
        }
    };
    let engine = RestoreEngine::new(orchestrator.store(), orchestrator.chunk_store());
    let ok = engine.verify_backup(job_id)?;
    println!("Backup #{job_id}: {}", if ok { "VERIFIED" } else { "FAILED" });
    Ok(())
}
