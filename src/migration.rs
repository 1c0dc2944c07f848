//! Export, import and CSV dumps of one user's data.

use crate::db_storage::LearningStore;
use crate::errors::{AppError, ResultExt};
use crate::models::*;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedMap {
    pub map: KnowledgeMapRow,
    pub nodes: Vec<ConceptNode>,
    pub edges: Vec<ConceptEdge>,
}

/// Everything stored for one user except the password hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserExport {
    pub user_info: UserProfile,
    pub knowledge_maps: Vec<ExportedMap>,
    pub study_records: Vec<StudyRecord>,
    pub mistake_records: Vec<MistakeRecord>,
    pub export_timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub user_id: i64,
    /// Export of the user's data taken before the import.
    pub backup_file: PathBuf,
    pub maps: usize,
    pub nodes: usize,
    pub edges: usize,
    pub study_records: usize,
    pub mistake_records: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    StudyRecords,
    MistakeRecords,
}

impl ExportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportKind::StudyRecords => "study_records",
            ExportKind::MistakeRecords => "mistake_records",
        }
    }
}

impl FromStr for ExportKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "study_records" => Ok(ExportKind::StudyRecords),
            "mistake_records" => Ok(ExportKind::MistakeRecords),
            other => Err(AppError::BadRequest(format!(
                "Unsupported data type: {}",
                other
            ))),
        }
    }
}

fn timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

#[derive(Clone)]
pub struct DataMigrationTool {
    store: LearningStore,
    backup_dir: PathBuf,
}

impl DataMigrationTool {
    pub fn new(store: LearningStore, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            backup_dir: backup_dir.into(),
        }
    }

    async fn output_dir(&self, output_dir: Option<&Path>) -> Result<PathBuf, AppError> {
        let dir = output_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.backup_dir.clone());
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        Ok(dir)
    }

    /// Collects the export document without writing it anywhere.
    pub async fn build_export(&self, user_id: i64) -> Result<UserExport, AppError> {
        let user = self.store.require_user(user_id).await?;

        let mut knowledge_maps = Vec::new();
        for map in self.store.get_user_knowledge_maps(user_id).await? {
            let data = self.store.get_knowledge_map(map.map_id).await?;
            knowledge_maps.push(ExportedMap {
                map,
                nodes: data.nodes,
                edges: data.edges,
            });
        }

        Ok(UserExport {
            user_info: UserProfile::from(&user),
            knowledge_maps,
            study_records: self
                .store
                .get_study_records(user_id, DateRange::default())
                .await?,
            mistake_records: self
                .store
                .get_mistake_records(user_id, DateRange::default())
                .await?,
            export_timestamp: timestamp(),
        })
    }

    /// Writes `user_{id}_data_{timestamp}.json` and returns its path.
    pub async fn export_user_data(
        &self,
        user_id: i64,
        output_dir: Option<&Path>,
    ) -> Result<PathBuf, AppError> {
        let export = self.build_export(user_id).await?;
        let dir = self.output_dir(output_dir).await?;
        let path = dir.join(format!(
            "user_{}_data_{}.json",
            user_id, export.export_timestamp
        ));

        let json = serde_json::to_string_pretty(&export)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("writing {}", path.display()))?;

        tracing::info!("Exported data for user {} to {}", user_id, path.display());
        Ok(path)
    }

    /// Imports an export file into `target_user` (default: the exported
    /// user). The target's current data is exported first, and nothing is
    /// written unless the whole file is consistent.
    pub async fn import_user_data(
        &self,
        path: &Path,
        target_user: Option<i64>,
    ) -> Result<ImportSummary, AppError> {
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            return Err(AppError::BadRequest(format!(
                "{} is not a .json export",
                path.display()
            )));
        }
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let export: UserExport = serde_json::from_str(&raw)?;

        let user_id = target_user.unwrap_or(export.user_info.user_id);
        self.store.require_user(user_id).await?;
        validate_export(&export)?;

        let backup_file = self.export_user_data(user_id, None).await?;
        let summary = self.write_export(user_id, &export, backup_file).await?;

        tracing::info!(
            "Imported {} maps, {} study records and {} mistakes for user {}",
            summary.maps,
            summary.study_records,
            summary.mistake_records,
            user_id
        );
        Ok(summary)
    }

    async fn write_export(
        &self,
        user_id: i64,
        export: &UserExport,
        backup_file: PathBuf,
    ) -> Result<ImportSummary, AppError> {
        let mut tx = self.store.pool().begin().await?;
        let mut summary = ImportSummary {
            user_id,
            backup_file,
            maps: 0,
            nodes: 0,
            edges: 0,
            study_records: 0,
            mistake_records: 0,
        };

        for exported in &export.knowledge_maps {
            let map_id = sqlx::query(
                "INSERT INTO knowledge_maps (user_id, subject, created_at, updated_at) VALUES (?, ?, ?, ?)",
            )
            .bind(user_id)
            .bind(exported.map.subject.trim())
            .bind(exported.map.created_at)
            .bind(exported.map.updated_at)
            .execute(&mut *tx)
            .await
            .context("importing knowledge map")?
            .last_insert_rowid();
            summary.maps += 1;

            let mut node_ids: HashMap<i64, i64> = HashMap::with_capacity(exported.nodes.len());
            for node in &exported.nodes {
                let new_id = sqlx::query(
                    "INSERT INTO concept_nodes (map_id, concept, subject, level, created_at) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(map_id)
                .bind(node.concept.trim())
                .bind(node.subject.trim())
                .bind(node.level)
                .bind(node.created_at)
                .execute(&mut *tx)
                .await
                .context("importing concept node")?
                .last_insert_rowid();
                node_ids.insert(node.node_id, new_id);
                summary.nodes += 1;
            }

            for edge in &exported.edges {
                let (Some(source), Some(target)) = (
                    node_ids.get(&edge.source_node_id),
                    node_ids.get(&edge.target_node_id),
                ) else {
                    return Err(AppError::BadRequest(format!(
                        "Edge {} references a node outside its map",
                        edge.edge_id
                    )));
                };
                sqlx::query(
                    r#"
                    INSERT INTO concept_edges
                        (map_id, source_node_id, target_node_id, relationship_type, strength, created_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(map_id)
                .bind(*source)
                .bind(*target)
                .bind(edge.relationship_type.as_deref())
                .bind(edge.strength)
                .bind(edge.created_at)
                .execute(&mut *tx)
                .await
                .context("importing concept edge")?;
                summary.edges += 1;
            }
        }

        for record in &export.study_records {
            sqlx::query(
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
            .bind(record.created_at)
            .execute(&mut *tx)
            .await
            .context("importing study record")?;
            summary.study_records += 1;
        }

        for record in &export.mistake_records {
            sqlx::query(
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
            .bind(record.created_at)
            .execute(&mut *tx)
            .await
            .context("importing mistake record")?;
            summary.mistake_records += 1;
        }

        tx.commit().await?;
        Ok(summary)
    }

    /// Writes one record table as `user_{id}_{kind}_{timestamp}.csv`.
    pub async fn export_to_csv(
        &self,
        user_id: i64,
        kind: ExportKind,
        output_dir: Option<&Path>,
    ) -> Result<PathBuf, AppError> {
        let range = DateRange::default();
        let body = match kind {
            ExportKind::StudyRecords => {
                to_csv(&self.store.get_study_records(user_id, range).await?)?
            }
            ExportKind::MistakeRecords => {
                to_csv(&self.store.get_mistake_records(user_id, range).await?)?
            }
        };
        let Some(body) = body else {
            return Err(AppError::NotFound("No data found".to_string()));
        };

        let dir = self.output_dir(output_dir).await?;
        let path = dir.join(format!(
            "user_{}_{}_{}.csv",
            user_id,
            kind.as_str(),
            timestamp()
        ));
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("writing {}", path.display()))?;

        tracing::info!("Exported {} for user {} to {}", kind.as_str(), user_id, path.display());
        Ok(path)
    }
}

/// `None` when there are no rows to write.
fn to_csv<T: Serialize>(rows: &[T]) -> Result<Option<Vec<u8>>, AppError> {
    if rows.is_empty() {
        return Ok(None);
    }
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row)?;
    }
    writer
        .into_inner()
        .map(Some)
        .map_err(|e| AppError::InternalError(format!("finishing CSV: {}", e)))
}

/// Rejects exports whose records would fail validation or whose edges point
/// outside their own map.
fn validate_export(export: &UserExport) -> Result<(), AppError> {
    for exported in &export.knowledge_maps {
        require_text("subject", &exported.map.subject)?;

        let node_ids: HashSet<i64> = exported.nodes.iter().map(|n| n.node_id).collect();
        for node in &exported.nodes {
            require_text("concept", &node.concept)?;
            require_text("subject", &node.subject)?;
        }
        for edge in &exported.edges {
            if !node_ids.contains(&edge.source_node_id) || !node_ids.contains(&edge.target_node_id)
            {
                return Err(AppError::BadRequest(format!(
                    "Edge {} of map {} references an unknown node",
                    edge.edge_id, exported.map.map_id
                )));
            }
            if edge.source_node_id == edge.target_node_id {
                return Err(AppError::BadRequest(format!(
                    "Edge {} links a concept to itself",
                    edge.edge_id
                )));
            }
        }
    }

    for record in &export.study_records {
        NewStudyRecord::from(record).validate()?;
    }
    for record in &export.mistake_records {
        NewMistakeRecord::from(record).validate()?;
    }
    Ok(())
}
