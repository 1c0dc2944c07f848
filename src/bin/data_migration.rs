//! Command-line export and import of a single user's data.

use clap::{Parser, Subcommand};
use mindmap_pro::config::Config;
use mindmap_pro::db::Database;
use mindmap_pro::db_storage::LearningStore;
use mindmap_pro::migration::{DataMigrationTool, ExportKind};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "data-migration")]
#[command(about = "Export, import and CSV dumps of MindMap Pro user data")]
struct Args {
    /// Overrides DATABASE_URL
    #[arg(long)]
    database_url: Option<String>,

    /// Overrides BACKUP_DIR
    #[arg(long)]
    backup_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write one user's maps and logs to a JSON file
    Export {
        user_id: i64,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Load a JSON export, backing up the target user first
    Import {
        file: PathBuf,
        /// Import into this user instead of the one named in the file
        #[arg(long)]
        target_user: Option<i64>,
    },
    /// Dump study_records or mistake_records as CSV
    Csv {
        user_id: i64,
        data_type: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
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
    let backup_dir = args.backup_dir.unwrap_or(config.backup_dir);

    let db = Database::new(&database_url).await?;
    let tool = DataMigrationTool::new(LearningStore::new(db.pool), backup_dir);

    match args.command {
        Command::Export { user_id, output } => {
            let path = tool.export_user_data(user_id, output.as_deref()).await?;
            println!("Exported user {} to {}", user_id, path.display());
        }
        Command::Import { file, target_user } => {
            let summary = tool.import_user_data(&file, target_user).await?;
            println!(
                "Imported {} maps ({} concepts, {} links), {} study records and {} mistakes into user {}",
                summary.maps,
                summary.nodes,
                summary.edges,
                summary.study_records,
                summary.mistake_records,
                summary.user_id
            );
            println!("Previous data saved to {}", summary.backup_file.display());
        }
        Command::Csv {
            user_id,
            data_type,
            output,
        } => {
            let kind: ExportKind = data_type.parse()?;
            let path = tool.export_to_csv(user_id, kind, output.as_deref()).await?;
            println!("Wrote {} to {}", kind.as_str(), path.display());
        }
    }

    Ok(())
}
