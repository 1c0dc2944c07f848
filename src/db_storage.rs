use crate::errors::{AppError, ResultExt};
use crate::models::*;
use chrono::Utc;
use sqlx::{Connection, SqliteConnection, SqlitePool};
use std::path::{Path, PathBuf};

/// Tables in foreign-key order: parents first.
const TABLES: [&str; 6] = [
    "users",
    "knowledge_maps",
    "concept_nodes",
    "concept_edges",
    "study_records",
    "mistake_records",
];

/// Storage service for accounts, knowledge maps and study logs.
#[derive(Clone)]
pub struct LearningStore {
    pool: SqlitePool,
}

/// `backup_mindmap_pro_<YYYYmmdd_HHMMSS>.db`, used when no backup path is given.
pub fn default_backup_file_name() -> String {
    format!(
        "backup_mindmap_pro_{}.db",
        Utc::now().format("%Y%m%d_%H%M%S")
    )
}

impl LearningStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============ Users ============

    pub async fn add_user(&self, username: &str, password_hash: &str) -> Result<i64, AppError> {
        let result = sqlx::query(
            "INSERT INTO users (username, password_hash, created_at) VALUES (?, ?, ?)",
        )
        .bind(username)
        .bind(password_hash)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db.is_unique_violation() {
                    return AppError::Conflict(format!("Username '{}' is already taken", username));
                }
            }
            AppError::DatabaseError(e)
        })?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_user(&self, username: &str) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn get_user_by_id(&self, user_id: i64) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    /// Fails with `NotFound` unless the user exists.
    pub async fn require_user(&self, user_id: i64) -> Result<User, AppError> {
        self.get_user_by_id(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))
    }

    pub async fn update_last_login(&self, user_id: i64) -> Result<(), AppError> {
        sqlx::query("UPDATE users SET last_login = ? WHERE user_id = ?")
            .bind(Utc::now())
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_password(&self, user_id: i64, password_hash: &str) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE users SET password_hash = ? WHERE user_id = ?")
            .bind(password_hash)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("User {} not found", user_id)));
        }
        Ok(())
    }

    // ============ Knowledge maps ============

    pub async fn add_knowledge_map(&self, user_id: i64, subject: &str) -> Result<i64, AppError> {
        let subject = require_text("subject", subject)?;
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO knowledge_maps (user_id, subject, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(&subject)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("creating knowledge map")?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_user_knowledge_maps(
        &self,
        user_id: i64,
    ) -> Result<Vec<KnowledgeMapRow>, AppError> {
        let maps = sqlx::query_as::<_, KnowledgeMapRow>(
            "SELECT * FROM knowledge_maps WHERE user_id = ? ORDER BY map_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(maps)
    }

    pub async fn get_knowledge_map_row(
        &self,
        map_id: i64,
    ) -> Result<Option<KnowledgeMapRow>, AppError> {
        let map = sqlx::query_as::<_, KnowledgeMapRow>(
            "SELECT * FROM knowledge_maps WHERE map_id = ?",
        )
        .bind(map_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(map)
    }

    /// Loads a map header, treating maps owned by someone else as missing.
    pub async fn get_map_for_user(
        &self,
        user_id: i64,
        map_id: i64,
    ) -> Result<KnowledgeMapRow, AppError> {
        match self.get_knowledge_map_row(map_id).await? {
            Some(map) if map.user_id == user_id => Ok(map),
            _ => Err(AppError::NotFound(format!(
                "Knowledge map {} not found",
                map_id
            ))),
        }
    }

    pub async fn touch_knowledge_map(&self, map_id: i64) -> Result<(), AppError> {
        sqlx::query("UPDATE knowledge_maps SET updated_at = ? WHERE map_id = ?")
            .bind(Utc::now())
            .bind(map_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn add_concept_node(
        &self,
        map_id: i64,
        concept: &str,
        subject: &str,
        level: i64,
    ) -> Result<i64, AppError> {
        let concept = require_text("concept", concept)?;
        let subject = require_text("subject", subject)?;
        if level < 1 {
            return Err(AppError::BadRequest("level must be at least 1".to_string()));
        }

        let result = sqlx::query(
            "INSERT INTO concept_nodes (map_id, concept, subject, level, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(map_id)
        .bind(&concept)
        .bind(&subject)
        .bind(level)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("adding concept node")?;

        self.touch_knowledge_map(map_id).await?;
        Ok(result.last_insert_rowid())
    }

    /// Links two concepts of the same map. Both endpoints must belong to `map_id`.
    pub async fn add_concept_edge(
        &self,
        map_id: i64,
        source_id: i64,
        target_id: i64,
        relationship_type: Option<&str>,
        strength: f64,
    ) -> Result<i64, AppError> {
        if source_id == target_id {
            return Err(AppError::BadRequest(
                "A concept cannot be linked to itself".to_string(),
            ));
        }
        if !strength.is_finite() || strength < 0.0 {
            return Err(AppError::BadRequest(
                "strength must be a non-negative number".to_string(),
            ));
        }

        let (endpoints,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM concept_nodes WHERE map_id = ? AND node_id IN (?, ?)",
        )
        .bind(map_id)
        .bind(source_id)
        .bind(target_id)
        .fetch_one(&self.pool)
        .await?;

        if endpoints != 2 {
            return Err(AppError::BadRequest(format!(
                "Both concepts must belong to knowledge map {}",
                map_id
            )));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO concept_edges
                (map_id, source_node_id, target_node_id, relationship_type, strength, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(map_id)
        .bind(source_id)
        .bind(target_id)
        .bind(relationship_type)
        .bind(strength)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("adding concept edge")?;

        self.touch_knowledge_map(map_id).await?;
        Ok(result.last_insert_rowid())
    }

    /// Removes a concept together with every edge touching it.
    pub async fn delete_concept_node(&self, map_id: i64, node_id: i64) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM concept_edges WHERE map_id = ? AND (source_node_id = ? OR target_node_id = ?)",
        )
        .bind(map_id)
        .bind(node_id)
        .bind(node_id)
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query("DELETE FROM concept_nodes WHERE map_id = ? AND node_id = ?")
            .bind(map_id)
            .bind(node_id)
            .execute(&mut *tx)
            .await?;

        if deleted.rows_affected() == 0 {
            // Dropping the transaction rolls back the edge deletion.
            return Err(AppError::NotFound(format!(
                "Concept {} not found in knowledge map {}",
                node_id, map_id
            )));
        }

        tx.commit().await?;
        self.touch_knowledge_map(map_id).await?;
        Ok(())
    }

    pub async fn get_map_nodes(&self, map_id: i64) -> Result<Vec<ConceptNode>, AppError> {
        let nodes = sqlx::query_as::<_, ConceptNode>(
            "SELECT * FROM concept_nodes WHERE map_id = ? ORDER BY node_id",
        )
        .bind(map_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(nodes)
    }

    pub async fn get_map_edges(&self, map_id: i64) -> Result<Vec<ConceptEdge>, AppError> {
        let edges = sqlx::query_as::<_, ConceptEdge>(
            "SELECT * FROM concept_edges WHERE map_id = ? ORDER BY edge_id",
        )
        .bind(map_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(edges)
    }

    pub async fn get_knowledge_map(&self, map_id: i64) -> Result<KnowledgeMapData, AppError> {
        Ok(KnowledgeMapData {
            nodes: self.get_map_nodes(map_id).await?,
            edges: self.get_map_edges(map_id).await?,
        })
    }

    // ============ Study and mistake logs ============

    pub async fn add_study_record(
        &self,
        user_id: i64,
        record: &NewStudyRecord,
    ) -> Result<i64, AppError> {
        record.validate()?;

        let result = sqlx::query(
            r#"
            INSERT INTO study_records
                (user_id, subject, concept, study_time, score, stress_level, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(record.subject.trim())
        .bind(record.concept.as_deref().map(str::trim))
        .bind(record.study_time)
        .bind(record.score)
        .bind(record.stress_level)
        .bind(record.created_at.unwrap_or_else(Utc::now))
        .execute(&self.pool)
        .await
        .context("adding study record")?;

        Ok(result.last_insert_rowid())
    }

    pub async fn add_mistake_record(
        &self,
        user_id: i64,
        record: &NewMistakeRecord,
    ) -> Result<i64, AppError> {
        record.validate()?;

        let result = sqlx::query(
            r#"
            INSERT INTO mistake_records
                (user_id, subject, mistake_type, problem_difficulty,
                 time_spent, is_repeated, stress_level, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(record.subject.trim())
        .bind(record.mistake_type.trim())
        .bind(record.problem_difficulty.as_deref())
        .bind(record.time_spent)
        .bind(record.is_repeated)
        .bind(record.stress_level)
        .bind(record.created_at.unwrap_or_else(Utc::now))
        .execute(&self.pool)
        .await
        .context("adding mistake record")?;

        Ok(result.last_insert_rowid())
    }

    /// Study records in `range`, newest first.
    pub async fn get_study_records(
        &self,
        user_id: i64,
        range: DateRange,
    ) -> Result<Vec<StudyRecord>, AppError> {
        range.validate()?;
        let records = sqlx::query_as::<_, StudyRecord>(
            r#"
            SELECT * FROM study_records
            WHERE user_id = ?1
              AND (?2 IS NULL OR created_at >= ?2)
              AND (?3 IS NULL OR created_at <= ?3)
            ORDER BY created_at DESC, record_id DESC
            "#,
        )
        .bind(user_id)
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Mistake records in `range`, newest first.
    pub async fn get_mistake_records(
        &self,
        user_id: i64,
        range: DateRange,
    ) -> Result<Vec<MistakeRecord>, AppError> {
        range.validate()?;
        let records = sqlx::query_as::<_, MistakeRecord>(
            r#"
            SELECT * FROM mistake_records
            WHERE user_id = ?1
              AND (?2 IS NULL OR created_at >= ?2)
              AND (?3 IS NULL OR created_at <= ?3)
            ORDER BY created_at DESC, mistake_id DESC
            "#,
        )
        .bind(user_id)
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    // ============ Aggregates ============

    /// Per-subject study statistics. Unknown users are `NotFound` rather than
    /// an empty list.
    pub async fn get_study_statistics(
        &self,
        user_id: i64,
        range: DateRange,
    ) -> Result<Vec<SubjectStatistics>, AppError> {
        range.validate()?;
        self.require_user(user_id).await?;

        let stats = sqlx::query_as::<_, SubjectStatistics>(
            r#"
            SELECT
                subject,
                COUNT(*) AS study_sessions,
                CAST(COALESCE(SUM(study_time), 0) AS INTEGER) AS total_time,
                CAST(AVG(study_time) AS REAL) AS avg_time,
                CAST(AVG(score) AS REAL) AS avg_score,
                CAST(AVG(stress_level) AS REAL) AS avg_stress
            FROM study_records
            WHERE user_id = ?1
              AND (?2 IS NULL OR created_at >= ?2)
              AND (?3 IS NULL OR created_at <= ?3)
            GROUP BY subject
            ORDER BY subject
            "#,
        )
        .bind(user_id)
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await
        .context("computing study statistics")?;

        Ok(stats)
    }

    pub async fn get_mistake_patterns(
        &self,
        user_id: i64,
        range: DateRange,
    ) -> Result<Vec<MistakePatternRow>, AppError> {
        range.validate()?;
        self.require_user(user_id).await?;

        let patterns = sqlx::query_as::<_, MistakePatternRow>(
            r#"
            SELECT
                subject,
                mistake_type,
                COUNT(*) AS frequency,
                CAST(AVG(time_spent) AS REAL) AS avg_time_spent,
                CAST(SUM(CASE WHEN is_repeated THEN 1 ELSE 0 END) AS INTEGER) AS repeated_count,
                CAST(AVG(stress_level) AS REAL) AS avg_stress
            FROM mistake_records
            WHERE user_id = ?1
              AND (?2 IS NULL OR created_at >= ?2)
              AND (?3 IS NULL OR created_at <= ?3)
            GROUP BY subject, mistake_type
            ORDER BY subject, mistake_type
            "#,
        )
        .bind(user_id)
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await
        .context("computing mistake patterns")?;

        Ok(patterns)
    }

    /// Score per study minute by subject, overall and for low-stress sessions.
    pub async fn get_learning_efficiency(
        &self,
        user_id: i64,
    ) -> Result<Vec<SubjectEfficiencyRow>, AppError> {
        self.require_user(user_id).await?;

        let rows = sqlx::query_as::<_, SubjectEfficiencyRow>(
            r#"
            SELECT
                subject,
                CAST(AVG(score / study_time) AS REAL) AS efficiency_score,
                CAST(
                    AVG(CASE WHEN stress_level <= 3 THEN score ELSE 0 END) /
                    AVG(CASE WHEN stress_level <= 3 THEN study_time ELSE NULL END)
                AS REAL) AS optimal_efficiency
            FROM study_records
            WHERE user_id = ? AND study_time > 0 AND score IS NOT NULL
            GROUP BY subject
            ORDER BY subject
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("computing learning efficiency")?;

        Ok(rows)
    }

    // ============ Backup / restore ============

    /// Writes a consistent copy of the database to `backup_path` (or a
    /// timestamped file in the working directory) and returns its path.
    pub async fn backup_database(&self, backup_path: Option<PathBuf>) -> Result<PathBuf, AppError> {
        let path = backup_path.unwrap_or_else(|| PathBuf::from(default_backup_file_name()));

        if tokio::fs::try_exists(&path).await? {
            return Err(AppError::Conflict(format!(
                "Backup file {} already exists",
                path.display()
            )));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        sqlx::query("VACUUM INTO ?")
            .bind(path.to_string_lossy().into_owned())
            .execute(&self.pool)
            .await
            .context("writing database backup")?;

        tracing::info!("Database backed up to {}", path.display());
        Ok(path)
    }

    /// Replaces all rows with the contents of a backup file, atomically.
    pub async fn restore_database(&self, backup_path: &Path) -> Result<(), AppError> {
        if !tokio::fs::try_exists(backup_path).await? {
            return Err(AppError::NotFound(format!(
                "Backup file {} not found",
                backup_path.display()
            )));
        }

        let mut conn = self.pool.acquire().await?;
        sqlx::query("ATTACH DATABASE ? AS backup")
            .bind(backup_path.to_string_lossy().into_owned())
            .execute(&mut *conn)
            .await
            .context("attaching backup database")?;

        let copied = copy_from_attached(&mut conn).await;

        sqlx::query("DETACH DATABASE backup")
            .execute(&mut *conn)
            .await?;

        copied?;
        tracing::info!("Database restored from {}", backup_path.display());
        Ok(())
    }
}

async fn copy_from_attached(conn: &mut SqliteConnection) -> Result<(), AppError> {
    let mut tx = conn.begin().await?;

    for table in TABLES.iter().rev() {
        sqlx::query(&format!("DELETE FROM main.{}", table))
            .execute(&mut *tx)
            .await?;
    }
    for table in TABLES {
        sqlx::query(&format!(
            "INSERT INTO main.{table} SELECT * FROM backup.{table}"
        ))
        .execute(&mut *tx)
        .await
        .with_context(|| format!("restoring table {}", table))?;
    }

    tx.commit().await?;
    Ok(())
}
