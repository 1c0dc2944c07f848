use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

/// Schema bootstrap, applied on every start. Statements are idempotent.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        user_id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT UNIQUE NOT NULL,
        password_hash TEXT NOT NULL,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        last_login TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS knowledge_maps (
        map_id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        subject TEXT NOT NULL,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY (user_id) REFERENCES users (user_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS concept_nodes (
        node_id INTEGER PRIMARY KEY AUTOINCREMENT,
        map_id INTEGER NOT NULL,
        concept TEXT NOT NULL,
        subject TEXT NOT NULL,
        level INTEGER NOT NULL DEFAULT 1,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY (map_id) REFERENCES knowledge_maps (map_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS concept_edges (
        edge_id INTEGER PRIMARY KEY AUTOINCREMENT,
        map_id INTEGER NOT NULL,
        source_node_id INTEGER NOT NULL,
        target_node_id INTEGER NOT NULL,
        relationship_type TEXT,
        strength REAL NOT NULL DEFAULT 1.0,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY (map_id) REFERENCES knowledge_maps (map_id),
        FOREIGN KEY (source_node_id) REFERENCES concept_nodes (node_id),
        FOREIGN KEY (target_node_id) REFERENCES concept_nodes (node_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS study_records (
        record_id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        subject TEXT NOT NULL,
        concept TEXT,
        study_time INTEGER NOT NULL,
        score REAL,
        stress_level INTEGER,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY (user_id) REFERENCES users (user_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS mistake_records (
        mistake_id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        subject TEXT NOT NULL,
        mistake_type TEXT NOT NULL,
        problem_difficulty TEXT,
        time_spent INTEGER,
        is_repeated BOOLEAN NOT NULL DEFAULT 0,
        stress_level INTEGER,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY (user_id) REFERENCES users (user_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_knowledge_maps_user ON knowledge_maps (user_id)",
    "CREATE INDEX IF NOT EXISTS idx_concept_nodes_map ON concept_nodes (map_id)",
    "CREATE INDEX IF NOT EXISTS idx_concept_edges_map ON concept_edges (map_id)",
    "CREATE INDEX IF NOT EXISTS idx_study_records_user ON study_records (user_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_mistake_records_user ON mistake_records (user_id, created_at)",
];

pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // Every connection to `:memory:` opens its own database, so in-memory
        // pools are pinned to one connection that is never recycled.
        let pool = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(10)
                .connect_with(options)
                .await?
        };

        initialize_schema(&pool).await?;

        Ok(Self { pool })
    }
}

/// Creates all tables and indexes if they do not exist yet.
pub async fn initialize_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::debug!("Database schema ready ({} statements)", SCHEMA.len());
    Ok(())
}
