use crate::errors::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ============ Database Models ============

/// A registered account. Never serialised to clients; see [`UserProfile`].
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub user_id: i64,
    pub username: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

/// Public view of a [`User`], without the password hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: i64,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl From<&User> for UserProfile {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.user_id,
            username: user.username.clone(),
            created_at: user.created_at,
            last_login: user.last_login,
        }
    }
}

/// A knowledge map header; nodes and edges live in their own tables.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct KnowledgeMapRow {
    pub map_id: i64,
    pub user_id: i64,
    pub subject: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A concept inside a knowledge map.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct ConceptNode {
    pub node_id: i64,
    pub map_id: i64,
    pub concept: String,
    pub subject: String,
    pub level: i64,
    pub created_at: DateTime<Utc>,
}

/// A link between two concepts of the same map.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct ConceptEdge {
    pub edge_id: i64,
    pub map_id: i64,
    pub source_node_id: i64,
    pub target_node_id: i64,
    pub relationship_type: Option<String>,
    pub strength: f64,
    pub created_at: DateTime<Utc>,
}

/// Full contents of one knowledge map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeMapData {
    pub nodes: Vec<ConceptNode>,
    pub edges: Vec<ConceptEdge>,
}

/// One study session. `study_time` is in minutes.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct StudyRecord {
    pub record_id: i64,
    pub user_id: i64,
    pub subject: String,
    pub concept: Option<String>,
    pub study_time: i64,
    pub score: Option<f64>,
    pub stress_level: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// One logged mistake. `time_spent` is in minutes.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct MistakeRecord {
    pub mistake_id: i64,
    pub user_id: i64,
    pub subject: String,
    pub mistake_type: String,
    pub problem_difficulty: Option<String>,
    pub time_spent: Option<i64>,
    pub is_repeated: bool,
    pub stress_level: Option<i64>,
    pub created_at: DateTime<Utc>,
}

// ============ Aggregates ============

/// Per-subject aggregate over study records.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct SubjectStatistics {
    pub subject: String,
    pub study_sessions: i64,
    pub total_time: i64,
    pub avg_time: f64,
    pub avg_score: Option<f64>,
    pub avg_stress: Option<f64>,
}

/// Per (subject, mistake type) aggregate over mistake records.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct MistakePatternRow {
    pub subject: String,
    pub mistake_type: String,
    pub frequency: i64,
    pub avg_time_spent: Option<f64>,
    pub repeated_count: i64,
    pub avg_stress: Option<f64>,
}

/// Score per minute of study, overall and under low stress (level <= 3).
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct SubjectEfficiencyRow {
    pub subject: String,
    pub efficiency_score: Option<f64>,
    pub optimal_efficiency: Option<f64>,
}

// ============ Inputs ============

/// Trims `value` and rejects it when nothing is left.
pub fn require_text(field: &str, value: &str) -> Result<String, AppError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::BadRequest(format!("{} cannot be empty", field)));
    }
    Ok(trimmed.to_string())
}

/// Upper bound for `study_time` and `time_spent`: one day, in minutes.
pub const MAX_SESSION_MINUTES: i64 = 1440;

fn check_minutes(field: &str, minutes: i64) -> Result<(), AppError> {
    if !(0..=MAX_SESSION_MINUTES).contains(&minutes) {
        return Err(AppError::BadRequest(format!(
            "{} must be between 0 and {} minutes (got {})",
            field, MAX_SESSION_MINUTES, minutes
        )));
    }
    Ok(())
}

fn check_stress(stress_level: Option<i64>) -> Result<(), AppError> {
    match stress_level {
        Some(level) if !(1..=5).contains(&level) => Err(AppError::BadRequest(format!(
            "stress_level must be between 1 and 5 (got {})",
            level
        ))),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStudyRecord {
    pub subject: String,
    #[serde(default)]
    pub concept: Option<String>,
    pub study_time: i64,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub stress_level: Option<i64>,
    /// Defaults to now; set when backfilling or importing.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl NewStudyRecord {
    pub fn validate(&self) -> Result<(), AppError> {
        require_text("subject", &self.subject)?;
        if let Some(concept) = &self.concept {
            require_text("concept", concept)?;
        }
        check_minutes("study_time", self.study_time)?;
        if let Some(score) = self.score {
            if !score.is_finite() || !(0.0..=100.0).contains(&score) {
                return Err(AppError::BadRequest(format!(
                    "score must be between 0 and 100 (got {})",
                    score
                )));
            }
        }
        check_stress(self.stress_level)
    }
}

impl From<&StudyRecord> for NewStudyRecord {
    fn from(record: &StudyRecord) -> Self {
        Self {
            subject: record.subject.clone(),
            concept: record.concept.clone(),
            study_time: record.study_time,
            score: record.score,
            stress_level: record.stress_level,
            created_at: Some(record.created_at),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMistakeRecord {
    pub subject: String,
    pub mistake_type: String,
    #[serde(default)]
    pub problem_difficulty: Option<String>,
    #[serde(default)]
    pub time_spent: Option<i64>,
    #[serde(default)]
    pub is_repeated: bool,
    #[serde(default)]
    pub stress_level: Option<i64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl NewMistakeRecord {
    pub fn validate(&self) -> Result<(), AppError> {
        require_text("subject", &self.subject)?;
        require_text("mistake_type", &self.mistake_type)?;
        if let Some(minutes) = self.time_spent {
            check_minutes("time_spent", minutes)?;
        }
        check_stress(self.stress_level)
    }
}

impl From<&MistakeRecord> for NewMistakeRecord {
    fn from(record: &MistakeRecord) -> Self {
        Self {
            subject: record.subject.clone(),
            mistake_type: record.mistake_type.clone(),
            problem_difficulty: record.problem_difficulty.clone(),
            time_spent: record.time_spent,
            is_repeated: record.is_repeated,
            stress_level: record.stress_level,
            created_at: Some(record.created_at),
        }
    }
}

/// Optional inclusive time window used by record and statistics queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn since(start: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start > end {
                return Err(AppError::BadRequest(
                    "start must not be after end".to_string(),
                ));
            }
        }
        Ok(())
    }
}

// ============ API request bodies ============

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateMapRequest {
    pub subject: String,
}

/// Adds a concept and links it to concepts already on the map.
#[derive(Debug, Clone, Deserialize)]
pub struct AddConceptRequest {
    pub concept: String,
    /// Defaults to the map's subject.
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub level: Option<i64>,
    /// Names of existing concepts to connect to.
    #[serde(default)]
    pub related: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddEdgeRequest {
    pub source_node_id: i64,
    pub target_node_id: i64,
    #[serde(default)]
    pub relationship_type: Option<String>,
    #[serde(default)]
    pub strength: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatternsQuery {
    #[serde(default)]
    pub days: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictionQuery {
    pub subject: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn study(score: Option<f64>, stress: Option<i64>) -> NewStudyRecord {
        NewStudyRecord {
            subject: "수학".into(),
            concept: None,
            study_time: 60,
            score,
            stress_level: stress,
            created_at: None,
        }
    }

    #[test]
    fn study_record_bounds() {
        assert!(study(Some(90.0), Some(3)).validate().is_ok());
        assert!(study(None, None).validate().is_ok());
        assert!(study(Some(101.0), None).validate().is_err());
        assert!(study(Some(f64::NAN), None).validate().is_err());
        assert!(study(Some(50.0), Some(6)).validate().is_err());
        assert!(study(Some(50.0), Some(0)).validate().is_err());
    }

    #[test]
    fn blank_subject_rejected() {
        let mut record = study(None, None);
        record.subject = "   ".into();
        assert!(record.validate().is_err());
    }

    #[test]
    fn mistake_record_requires_type() {
        let record = NewMistakeRecord {
            subject: "물리".into(),
            mistake_type: "".into(),
            problem_difficulty: None,
            time_spent: Some(3),
            is_repeated: false,
            stress_level: None,
            created_at: None,
        };
        assert!(record.validate().is_err());
    }

    #[test]
    fn minutes_are_capped_at_one_day() {
        let mut record = study(None, None);
        record.study_time = MAX_SESSION_MINUTES;
        assert!(record.validate().is_ok());
        record.study_time = MAX_SESSION_MINUTES + 1;
        assert!(record.validate().is_err());
        record.study_time = i64::MAX;
        assert!(record.validate().is_err());
        record.study_time = -1;
        assert!(record.validate().is_err());

        let mut mistake = NewMistakeRecord {
            subject: "물리".into(),
            mistake_type: "계산 실수".into(),
            problem_difficulty: None,
            time_spent: Some(i64::MAX),
            is_repeated: false,
            stress_level: None,
            created_at: None,
        };
        assert!(mistake.validate().is_err());
        mistake.time_spent = Some(MAX_SESSION_MINUTES);
        assert!(mistake.validate().is_ok());
    }

    #[test]
    fn inverted_range_rejected() {
        let now = Utc::now();
        let range = DateRange {
            start: Some(now),
            end: Some(now - chrono::Duration::days(1)),
        };
        assert!(range.validate().is_err());
        assert!(DateRange::default().is_unbounded());
    }
}
