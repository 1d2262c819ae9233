//! Filerelay CLI
//!
//! Operator surface over the record store: inspect queue state, list
//! failures, re-enqueue records the pipeline gave up on.

use chrono::Utc;
use clap::{Parser, Subcommand};

use filerelay::storage::records;
use filerelay::storage::Storage;
use filerelay::types::ChangeRecord;
use filerelay::Result;

#[derive(Parser)]
#[command(name = "filerelay")]
#[command(about = "Filerelay queue inspection and repair")]
#[command(version)]
struct Cli {
    /// State database path
    #[arg(
        long,
        env = "FILERELAY_DB_PATH",
        default_value = "~/.local/share/filerelay/records.db"
    )]
    db_path: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show record counts per status
    Status,
    /// List records that exhausted their retries
    Failed {
        /// Maximum number to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
    /// Re-enqueue a failed record for another round of attempts
    Retry {
        /// Record path (as stored)
        path: String,
    },
    /// List recently touched records
    List {
        /// Maximum number to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
}

fn print_record(record: &ChangeRecord) {
    println!(
        "{:<12} {:<7} attempts={} {}",
        record.status.as_str(),
        record.op.as_str(),
        record.attempt_count,
        record.path
    );
    if let Some(error) = &record.last_error {
        println!("             last error: {}", error);
    }
    if let Some(at) = record.last_success_at {
        println!("             last success: {}", at.to_rfc3339());
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let db_path = shellexpand::tilde(&cli.db_path).into_owned();
    let storage = Storage::open(&db_path)?;

    match cli.command {
        Commands::Status => {
            let counts = storage.with_connection(records::queue_counts)?;
            println!("pending:     {}", counts.pending);
            println!("in progress: {}", counts.in_progress);
            println!("uploaded:    {}", counts.uploaded);
            println!("failed:      {}", counts.failed);
        }
        Commands::Failed { limit } => {
            let failed = storage.with_connection(|conn| records::list_failed(conn, limit))?;
            if failed.is_empty() {
                println!("No failed records.");
            }
            for record in &failed {
                print_record(record);
            }
        }
        Commands::Retry { path } => {
            let requeued =
                storage.with_connection(|conn| records::requeue_failed(conn, &path, Utc::now()))?;
            if requeued {
                println!("Re-enqueued: {}", path);
            } else {
                eprintln!("No failed record at: {}", path);
                std::process::exit(1);
            }
        }
        Commands::List { limit } => {
            let recent = storage.with_connection(|conn| records::list_recent(conn, limit))?;
            for record in &recent {
                print_record(record);
            }
        }
    }

    Ok(())
}
