use crate::analysis::{LearningAnalyzer, DEFAULT_PATTERN_DAYS};
use crate::auth::{AuthManager, AuthUser};
use crate::cache_invalidator::CacheInvalidator;
use crate::cache_manager::{cache_key, CacheManager, CacheStats};
use crate::config::Config;
use crate::db_storage::LearningStore;
use crate::errors::AppError;
use crate::knowledge_map::{KnowledgeGraph, MapLayout, MapMetrics, MapSnapshot};
use crate::learning_analysis::LearningReport;
use crate::migration::{DataMigrationTool, UserExport};
use crate::mistake_pattern::MistakeReport;
use crate::models::*;
use crate::processor::{DataProcessor, LearningPatternSummary, StudySession};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Iterations used for map layouts served over the API.
const LAYOUT_ITERATIONS: usize = 50;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Storage service over the SQLite pool.
    pub store: LearningStore,
    /// Application configuration.
    pub config: Config,
    pub auth: AuthManager,
    pub analyzer: LearningAnalyzer,
    pub migration: DataMigrationTool,
    /// Checksummed TTL cache for profiles, maps and analysis results.
    pub cache: Arc<CacheManager>,
    /// Dependency-aware invalidation over `cache`.
    pub invalidator: Arc<CacheInvalidator>,
}

impl AppState {
    pub fn new(pool: SqlitePool, config: Config) -> Self {
        let store = LearningStore::new(pool);
        let cache = Arc::new(CacheManager::from_config(&config));
        Self {
            auth: AuthManager::new(store.clone(), &config),
            analyzer: LearningAnalyzer::new(store.clone()),
            migration: DataMigrationTool::new(store.clone(), config.backup_dir.clone()),
            invalidator: Arc::new(CacheInvalidator::new(cache.clone())),
            cache,
            store,
            config,
        }
    }
}

/// Health check endpoint.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "mindmap-pro",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

// ============ Auth ============

/// POST /api/v1/auth/register
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CredentialsRequest>,
) -> Result<(StatusCode, Json<crate::auth::AuthSession>), AppError> {
    tracing::info!("POST /auth/register - username: {}", body.username);

    let session = state.auth.register(body.username.trim(), &body.password).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// POST /api/v1/auth/login
///
/// Attempts are counted per username whatever address they come from; once
/// the limit is reached the endpoint answers 429 until the window passes.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CredentialsRequest>,
) -> Result<Json<crate::auth::AuthSession>, AppError> {
    tracing::info!("POST /auth/login - username: {}", body.username);

    let session = state.auth.login(body.username.trim(), &body.password).await?;
    state.invalidator.invalidate_user_data(session.user_id).await;

    Ok(Json(session))
}

/// POST /api/v1/auth/refresh
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let access_token = state.auth.refresh_access_token(&body.refresh_token).await?;
    Ok(Json(json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": state.config.jwt_expiration,
    })))
}

/// POST /api/v1/auth/change-password
pub async fn change_password(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(body): Json<ChangePasswordRequest>,
) -> Result<StatusCode, AppError> {
    state
        .auth
        .change_password(user.user_id, &body.old_password, &body.new_password)
        .await?;
    state.invalidator.invalidate_user_data(user.user_id).await;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/me
pub async fn me(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<UserProfile>, AppError> {
    if let Some(profile) = state.cache.get_user_data::<UserProfile>(user.user_id).await {
        return Ok(Json(profile));
    }

    let profile = UserProfile::from(&state.store.require_user(user.user_id).await?);
    state.cache.set_user_data(user.user_id, &profile, None).await;
    Ok(Json(profile))
}

// ============ Knowledge maps ============

/// Loads a map the caller owns, through the cache.
async fn load_map_snapshot(
    state: &AppState,
    user_id: i64,
    map_id: i64,
) -> Result<MapSnapshot, AppError> {
    if let Some(snapshot) = state.cache.get_cached_knowledge_map(map_id).await {
        if snapshot.map.user_id != user_id {
            return Err(AppError::NotFound(format!(
                "Knowledge map {} not found",
                map_id
            )));
        }
        return Ok(snapshot);
    }

    let map = state.store.get_map_for_user(user_id, map_id).await?;
    let data = state.store.get_knowledge_map(map_id).await?;
    let snapshot = MapSnapshot {
        map,
        nodes: data.nodes,
        edges: data.edges,
    };
    state.cache.cache_knowledge_map(map_id, &snapshot, None).await;
    Ok(snapshot)
}

/// Caches a view derived from a map and ties it to the map's key, so that
/// any write to the map drops the view as well.
async fn cache_map_view<T: Serialize>(state: &AppState, map_id: i64, view: &str, value: &T) {
    let key = cache_key(view, map_id);
    if state.cache.set_json(&key, value, None).await {
        state
            .invalidator
            .register_dependency(&cache_key("knowledge_map", map_id), [key])
            .await;
    }
}

/// POST /api/v1/maps
pub async fn create_map(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(body): Json<CreateMapRequest>,
) -> Result<(StatusCode, Json<KnowledgeMapRow>), AppError> {
    let map_id = state.store.add_knowledge_map(user.user_id, &body.subject).await?;
    let map = state.store.get_map_for_user(user.user_id, map_id).await?;
    tracing::info!("User {} created knowledge map {}", user.user_id, map_id);
    Ok((StatusCode::CREATED, Json(map)))
}

/// GET /api/v1/maps
pub async fn list_maps(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<Vec<KnowledgeMapRow>>, AppError> {
    Ok(Json(state.store.get_user_knowledge_maps(user.user_id).await?))
}

/// GET /api/v1/maps/:id
pub async fn get_map(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(map_id): Path<i64>,
) -> Result<Json<MapSnapshot>, AppError> {
    Ok(Json(load_map_snapshot(&state, user.user_id, map_id).await?))
}

#[derive(Debug, Serialize)]
pub struct AddConceptResponse {
    pub node_id: i64,
    /// False when the concept already existed and only links were added.
    pub created: bool,
    pub edge_ids: Vec<i64>,
}

/// POST /api/v1/maps/:id/concepts
///
/// Adds a concept (or reuses one with the same name) and links it to the
/// named related concepts already on the map.
pub async fn add_concept(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(map_id): Path<i64>,
    Json(body): Json<AddConceptRequest>,
) -> Result<(StatusCode, Json<AddConceptResponse>), AppError> {
    let map = state.store.get_map_for_user(user.user_id, map_id).await?;
    let concept = require_text("concept", &body.concept)?;
    let subject = match &body.subject {
        Some(subject) => require_text("subject", subject)?,
        None => map.subject.clone(),
    };

    let nodes = state.store.get_map_nodes(map_id).await?;
    let edges = state.store.get_map_edges(map_id).await?;

    let mut related_ids = Vec::new();
    for name in &body.related {
        let name = name.trim();
        if name == concept {
            return Err(AppError::BadRequest(
                "A concept cannot be linked to itself".to_string(),
            ));
        }
        let node = nodes
            .iter()
            .find(|n| n.concept == name)
            .ok_or_else(|| AppError::BadRequest(format!("Unknown concept '{}'", name)))?;
        if !related_ids.contains(&node.node_id) {
            related_ids.push(node.node_id);
        }
    }

    let existing = nodes.iter().find(|n| n.concept == concept).map(|n| n.node_id);
    let node_id = match existing {
        Some(id) => id,
        None => {
            state
                .store
                .add_concept_node(map_id, &concept, &subject, body.level.unwrap_or(1))
                .await?
        }
    };

    let mut edge_ids = Vec::new();
    for target in related_ids {
        let linked = edges.iter().any(|e| {
            (e.source_node_id == node_id && e.target_node_id == target)
                || (e.source_node_id == target && e.target_node_id == node_id)
        });
        if !linked {
            edge_ids.push(
                state
                    .store
                    .add_concept_edge(map_id, node_id, target, None, 1.0)
                    .await?,
            );
        }
    }

    state.invalidator.invalidate_knowledge_map(map_id).await;

    let status = if existing.is_none() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(AddConceptResponse {
            node_id,
            created: existing.is_none(),
            edge_ids,
        }),
    ))
}

/// POST /api/v1/maps/:id/edges
pub async fn add_edge(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(map_id): Path<i64>,
    Json(body): Json<AddEdgeRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    state.store.get_map_for_user(user.user_id, map_id).await?;
    let edge_id = state
        .store
        .add_concept_edge(
            map_id,
            body.source_node_id,
            body.target_node_id,
            body.relationship_type.as_deref(),
            body.strength.unwrap_or(1.0),
        )
        .await?;
    state.invalidator.invalidate_knowledge_map(map_id).await;

    Ok((StatusCode::CREATED, Json(json!({ "edge_id": edge_id }))))
}

/// DELETE /api/v1/maps/:id/concepts/:node_id
pub async fn delete_concept(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path((map_id, node_id)): Path<(i64, i64)>,
) -> Result<StatusCode, AppError> {
    state.store.get_map_for_user(user.user_id, map_id).await?;
    state.store.delete_concept_node(map_id, node_id).await?;
    state.invalidator.invalidate_knowledge_map(map_id).await;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/maps/:id/metrics
pub async fn map_metrics(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(map_id): Path<i64>,
) -> Result<Json<MapMetrics>, AppError> {
    let snapshot = load_map_snapshot(&state, user.user_id, map_id).await?;
    if let Some(metrics) = state.cache.get_json::<MapMetrics>(&cache_key("map_metrics", map_id)).await {
        return Ok(Json(metrics));
    }

    let metrics = KnowledgeGraph::from_snapshot(&snapshot)?.metrics();
    cache_map_view(&state, map_id, "map_metrics", &metrics).await;
    Ok(Json(metrics))
}

/// GET /api/v1/maps/:id/layout
pub async fn map_layout(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(map_id): Path<i64>,
) -> Result<Json<MapLayout>, AppError> {
    let snapshot = load_map_snapshot(&state, user.user_id, map_id).await?;
    if let Some(layout) = state.cache.get_json::<MapLayout>(&cache_key("map_layout", map_id)).await {
        return Ok(Json(layout));
    }

    let graph = KnowledgeGraph::from_snapshot(&snapshot)?;
    let layout = tokio::task::spawn_blocking(move || graph.spring_layout(LAYOUT_ITERATIONS))
        .await
        .map_err(|e| AppError::InternalError(format!("layout task failed: {}", e)))?;
    cache_map_view(&state, map_id, "map_layout", &layout).await;
    Ok(Json(layout))
}

// ============ Study and mistake logs ============

/// Drops every cached analysis and the statistics for `user_id`.
async fn invalidate_study_views(state: &AppState, user_id: i64) {
    state.invalidator.invalidate_analysis_cache(user_id, None).await;
    state.cache.delete(&cache_key("study_stats", user_id)).await;
}

/// POST /api/v1/study-records
pub async fn add_study_record(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(body): Json<NewStudyRecord>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let record_id = state.store.add_study_record(user.user_id, &body).await?;
    invalidate_study_views(&state, user.user_id).await;
    Ok((StatusCode::CREATED, Json(json!({ "record_id": record_id }))))
}

/// GET /api/v1/study-records?start&end
pub async fn list_study_records(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(range): Query<DateRange>,
) -> Result<Json<Vec<StudyRecord>>, AppError> {
    Ok(Json(state.store.get_study_records(user.user_id, range).await?))
}

/// POST /api/v1/mistakes
pub async fn add_mistake(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(body): Json<NewMistakeRecord>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let mistake_id = state.store.add_mistake_record(user.user_id, &body).await?;
    invalidate_study_views(&state, user.user_id).await;
    Ok((StatusCode::CREATED, Json(json!({ "mistake_id": mistake_id }))))
}

/// GET /api/v1/mistakes?start&end
pub async fn list_mistakes(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(range): Query<DateRange>,
) -> Result<Json<Vec<MistakeRecord>>, AppError> {
    Ok(Json(state.store.get_mistake_records(user.user_id, range).await?))
}

// ============ Analysis ============

/// GET /api/v1/analysis/statistics?start&end
///
/// Only the unbounded query is cached; ranged queries always hit the database.
pub async fn statistics(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(range): Query<DateRange>,
) -> Result<Json<Vec<SubjectStatistics>>, AppError> {
    if range.is_unbounded() {
        if let Some(stats) = state.cache.get_cached_study_statistics(user.user_id).await {
            return Ok(Json(stats));
        }
    }

    let stats = state.store.get_study_statistics(user.user_id, range).await?;
    if range.is_unbounded() {
        state.cache.cache_study_statistics(user.user_id, &stats, None).await;
    }
    Ok(Json(stats))
}

/// GET /api/v1/analysis/patterns?days
pub async fn patterns(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<PatternsQuery>,
) -> Result<Json<crate::analysis::StudyPatternReport>, AppError> {
    let days = query.days.unwrap_or(DEFAULT_PATTERN_DAYS);
    let cacheable = days == DEFAULT_PATTERN_DAYS;

    if cacheable {
        if let Some(report) = state.cache.get_cached_analysis(user.user_id, "patterns").await {
            return Ok(Json(report));
        }
    }

    let report = state.analyzer.analyze_study_patterns(user.user_id, days).await?;
    if cacheable {
        state
            .cache
            .cache_analysis_results(user.user_id, "patterns", &report, None)
            .await;
    }
    Ok(Json(report))
}

/// GET /api/v1/analysis/prediction?subject
pub async fn prediction(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<PredictionQuery>,
) -> Result<Json<crate::analysis::PerformancePrediction>, AppError> {
    let subject = require_text("subject", &query.subject)?;
    Ok(Json(
        state
            .analyzer
            .get_performance_prediction(user.user_id, &subject)
            .await?,
    ))
}

/// GET /api/v1/analysis/efficiency
pub async fn efficiency(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<Vec<SubjectEfficiencyRow>>, AppError> {
    Ok(Json(state.store.get_learning_efficiency(user.user_id).await?))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningAnalysisResponse {
    pub report: LearningReport,
    pub summary: LearningPatternSummary,
}

/// GET /api/v1/analysis/learning?start&end
pub async fn learning_report(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(range): Query<DateRange>,
) -> Result<Json<LearningAnalysisResponse>, AppError> {
    if range.is_unbounded() {
        if let Some(cached) = state.cache.get_cached_analysis(user.user_id, "learning").await {
            return Ok(Json(cached));
        }
    }

    let records = state.store.get_study_records(user.user_id, range).await?;
    let sessions: Vec<StudySession> = records.iter().map(StudySession::from).collect();
    let response = LearningAnalysisResponse {
        report: LearningReport::from_records(&records),
        summary: DataProcessor::analyze_learning_patterns(&sessions),
    };

    if range.is_unbounded() {
        state
            .cache
            .cache_analysis_results(user.user_id, "learning", &response, None)
            .await;
    }
    Ok(Json(response))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MistakeAnalysisResponse {
    pub report: MistakeReport,
    pub patterns: Vec<MistakePatternRow>,
}

/// GET /api/v1/analysis/mistakes?start&end
pub async fn mistake_report(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(range): Query<DateRange>,
) -> Result<Json<MistakeAnalysisResponse>, AppError> {
    if range.is_unbounded() {
        if let Some(cached) = state.cache.get_cached_analysis(user.user_id, "mistakes").await {
            return Ok(Json(cached));
        }
    }

    let records = state.store.get_mistake_records(user.user_id, range).await?;
    let response = MistakeAnalysisResponse {
        report: MistakeReport::from_records(&records),
        patterns: state.store.get_mistake_patterns(user.user_id, range).await?,
    };

    if range.is_unbounded() {
        state
            .cache
            .cache_analysis_results(user.user_id, "mistakes", &response, None)
            .await;
    }
    Ok(Json(response))
}

// ============ Export and cache ============

/// GET /api/v1/export
pub async fn export(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<UserExport>, AppError> {
    tracing::info!("GET /export - user {}", user.user_id);
    Ok(Json(state.migration.build_export(user.user_id).await?))
}

/// GET /api/v1/cache/stats
pub async fn cache_stats(
    State(state): State<Arc<AppState>>,
    _user: AuthUser,
) -> Json<CacheStats> {
    Json(state.cache.get_cache_stats().await)
}
