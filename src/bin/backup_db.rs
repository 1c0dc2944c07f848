//! Snapshots the SQLite database or restores it from a snapshot.

use clap::{Parser, Subcommand};
use mindmap_pro::config::Config;
use mindmap_pro::db::Database;
use mindmap_pro::db_storage::{default_backup_file_name, LearningStore};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "backup-db")]
#[command(about = "Back up or restore the MindMap Pro database")]
struct Args {
    /// Overrides DATABASE_URL
    #[arg(long)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a consistent copy of the database
    Backup {
        /// Defaults to BACKUP_DIR/backup_mindmap_pro_<timestamp>.db
        path: Option<PathBuf>,
    },
    /// Replace every table's contents with those of a backup file
    Restore { path: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mindmap_pro=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;
    let database_url = args.database_url.unwrap_or(config.database_url);

    let db = Database::new(&database_url).await?;
    let store = LearningStore::new(db.pool);

    match args.command {
        Command::Backup { path } => {
            let path = path.unwrap_or_else(|| config.backup_dir.join(default_backup_file_name()));
            let written = store.backup_database(Some(path)).await?;
            println!("Backup written to {}", written.display());
        }
        Command::Restore { path } => {
            store.restore_database(&path).await?;
            println!("Database restored from {}", path.display());
        }
    }

    Ok(())
}
