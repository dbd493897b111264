//! tempo — maintenance commands for the task database.
//!
//! `backup` and `restore` move the store through the JSON document format;
//! `trim` applies retention on demand.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use tempo_core::store::Store;
use tempo_engine::backup;
use tempo_engine::RetentionJob;

#[derive(Parser)]
#[command(name = "tempo", about = "Task scheduler maintenance commands", version)]
struct Cli {
    /// SQLite database path. Falls back to DATABASE_URL, then tasks.db.
    #[arg(long, global = true)]
    database: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Export tasks, context, settings, and chat history to a JSON file.
    Backup {
        /// Output file.
        #[arg(long, default_value = "db_backup.json")]
        file: PathBuf,
    },
    /// Load a backup document into the database.
    Restore {
        /// Input file.
        #[arg(long, default_value = "db_backup.json")]
        file: PathBuf,
    },
    /// Delete chat and inference-log rows older than the given age.
    Trim {
        /// Retention horizon in days.
        #[arg(long)]
        days: i64,
    },
}

fn database_path(cli: &Cli) -> String {
    let raw = cli
        .database
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .unwrap_or_else(|| "tasks.db".to_string());
    raw.strip_prefix("sqlite://")
        .or_else(|| raw.strip_prefix("sqlite:"))
        .unwrap_or(&raw)
        .to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let path = database_path(&cli);
    let store = Arc::new(
        Store::open(&path)
            .await
            .with_context(|| format!("failed to open database at {path}"))?,
    );

    match cli.command {
        Command::Backup { file } => {
            let document = backup::export(&store).await?;
            let json = serde_json::to_string_pretty(&document)?;
            tokio::fs::write(&file, json)
                .await
                .with_context(|| format!("failed to write {}", file.display()))?;
            println!(
                "backed up {} task(s) to {}",
                document.tasks.len(),
                file.display()
            );
        }
        Command::Restore { file } => {
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let document: backup::BackupDocument =
                serde_json::from_str(&raw).context("invalid backup document")?;
            println!("restoring backup taken at {}", document.backup_time);
            let report = backup::restore(&store, &document).await?;
            println!(
                "restored {} task(s), {} chat message(s)",
                report.tasks_restored, report.chat_messages_restored
            );
        }
        Command::Trim { days } => {
            let job = RetentionJob::new(store, days);
            let report = job.run().await?;
            println!(
                "deleted {} inference row(s), {} chat row(s)",
                report.llm_calls_deleted, report.chat_messages_deleted
            );
        }
    }

    Ok(())
}
