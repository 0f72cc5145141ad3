mod menu;

use std::path::Path;

use clap::Parser;
use comfy_table::{presets::UTF8_FULL_CONDENSED, Table};

use ecpb_core::config::DataDir;
use ecpb_core::orchestrator::Orchestrator;
use ecpb_core::restore::RestoreEngine;
use ecpb_core::types::{format_bytes, now_epoch_ms, BackupJob, JobStatus};

#[derive(Parser)]
#[command(
    name = "ecpb",
    version,
    about = "Content-addressed, deduplicating, encrypted backups",
    after_help = "\
Without an action flag (--backup, --restore, --verify, --list, --stats)
the interactive menu is started."
)]
struct Cli {
    /// Repository root directory
    #[arg(long, default_value = "./ecpb_data")]
    data_dir: String,

    /// Log level: 0=DEBUG, 1=INFO, 2=WARN, 3=ERROR
    #[arg(long, default_value_t = 1)]
    log_level: u8,

    /// Submit and run a backup of this source tree
    #[arg(long, value_name = "SOURCE")]
    backup: Option<String>,

    /// Backup name (default: backup_<epoch_ms>)
    #[arg(long)]
    name: Option<String>,

    /// Restore this job
    #[arg(long, value_name = "JOB_ID")]
    restore: Option<i64>,

    /// Restore destination directory
    #[arg(long, value_name = "PATH")]
    dest: Option<String>,

    /// Verify the integrity of this job
    #[arg(long, value_name = "JOB_ID")]
    verify: Option<i64>,

    /// List all jobs
    #[arg(long)]
    list: bool,

    /// Show aggregate repository statistics
    #[arg(long)]
    stats: bool,
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.log_level {
        0 => "debug",
        1 => "info",
        2 => "warn",
        _ => "error",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let data_dir = DataDir::new(&cli.data_dir);
    let mut orchestrator = match Orchestrator::new(data_dir) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Error: failed to open repository at {}: {e}", cli.data_dir);
            std::process::exit(1);
        }
    };
    tracing::info!("Using data dir: {}", cli.data_dir);

    let result = if let Some(ref source) = cli.backup {
        run_backup(&orchestrator, source, cli.name.clone())
    } else if let Some(job_id) = cli.restore {
        run_restore(&orchestrator, job_id, cli.dest.as_deref())
    } else if let Some(job_id) = cli.verify {
        run_verify(&orchestrator, job_id)
    } else if cli.list {
        run_list(&orchestrator)
    } else if cli.stats {
        run_stats(&orchestrator)
    } else {
        menu::run(&mut orchestrator)
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn run_backup(orchestrator: &Orchestrator, source: &str, name: Option<String>) -> CliResult {
    let name = name.unwrap_or_else(|| format!("backup_{}", now_epoch_ms()));
    let job_id = orchestrator.submit_job(BackupJob {
        source_path: source.to_string(),
        backup_name: name.clone(),
        ..BackupJob::default()
    })?;
    println!("Backup job #{job_id} created. Running...");

    orchestrator.run_single_process()?;

    let job = orchestrator
        .store()
        .get_job(job_id)?
        .ok_or("job vanished from the metadata store")?;
    if job.status != JobStatus::Completed {
        return Err(format!("backup failed: {}", job.error_message).into());
    }
    println!(
        "Backup completed. Files: {}, Size: {}, Stored: {}, Dedup savings: {}",
        job.file_count,
        format_bytes(job.total_bytes),
        format_bytes(job.stored_bytes),
        format_bytes(job.dedup_savings),
    );
    Ok(())
}

fn run_restore(orchestrator: &Orchestrator, job_id: i64, dest: Option<&str>) -> CliResult {
    let dest = dest.ok_or("missing --dest for restore")?;
    let engine = RestoreEngine::new(orchestrator.store(), orchestrator.chunk_store());
    let result = engine.restore_job(job_id, Path::new(dest))?;
    if !result.success {
        return Err(format!(
            "restore failed: {}",
            result.error.unwrap_or_else(|| "unknown error".into())
        )
        .into());
    }
    println!(
        "Restored {} files ({}) to {dest}",
        result.files_restored,
        format_bytes(result.bytes_restored),
    );
    Ok(())
}

fn run_verify(orchestrator: &Orchestrator, job_id: i64) -> CliResult {
    let engine = RestoreEngine::new(orchestrator.store(), orchestrator.chunk_store());
    let ok = engine.verify_backup(job_id)?;
    println!("Backup #{job_id}: {}", if ok { "VERIFIED" } else { "FAILED" });
    if ok {
        Ok(())
    } else {
        Err("verification failed".into())
    }
}

fn run_list(orchestrator: &Orchestrator) -> CliResult {
    let jobs = orchestrator.store().get_all_jobs()?;
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }
    println!("{}", jobs_table(&jobs));
    Ok(())
}

fn run_stats(orchestrator: &Orchestrator) -> CliResult {
    let stats = orchestrator.store().get_stats()?;
    println!(
        "Jobs: {} (completed: {}, failed: {})",
        stats.total_jobs, stats.completed_jobs, stats.failed_jobs
    );
    println!("Files: {}", stats.total_files);
    println!("Chunks: {}", stats.total_chunks);
    println!("Stored: {}", format_bytes(stats.total_stored_bytes));
    println!("Dedup savings: {}", format_bytes(stats.total_dedup_savings));
    Ok(())
}

pub(crate) fn jobs_table(jobs: &[BackupJob]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec![
        "ID", "Name", "Status", "Priority", "Files", "Size", "Stored", "Created",
    ]);
    for job in jobs {
        table.add_row(vec![
            job.job_id.to_string(),
            job.backup_name.clone(),
            job.status.as_str().to_string(),
            job.priority.as_str().to_string(),
            job.file_count.to_string(),
            format_bytes(job.total_bytes),
            format_bytes(job.stored_bytes),
            format_epoch_ms(job.created_at),
        ]);
    }
    table
}

pub(crate) fn format_epoch_ms(epoch_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(epoch_ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}
