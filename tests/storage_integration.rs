//! Storage tests against an in-memory SQLite database.

use chrono::{Duration, TimeZone, Utc};
use mindmap_pro::db::Database;
use mindmap_pro::db_storage::{default_backup_file_name, LearningStore};
use mindmap_pro::errors::AppError;
use mindmap_pro::models::{DateRange, NewMistakeRecord, NewStudyRecord};

async fn store() -> LearningStore {
    let db = Database::new("sqlite::memory:").await.unwrap();
    LearningStore::new(db.pool)
}

fn study(subject: &str, minutes: i64, score: f64, stress: i64) -> NewStudyRecord {
    NewStudyRecord {
        subject: subject.to_string(),
        concept: None,
        study_time: minutes,
        score: Some(score),
        stress_level: Some(stress),
        created_at: None,
    }
}

#[tokio::test]
async fn usernames_are_unique() {
    let store = store().await;
    let id = store.add_user("alice", "hash").await.unwrap();

    let err = store.add_user("alice", "other").await.unwrap_err();
    assert!(matches!(err.root(), AppError::Conflict(_)));

    let user = store.get_user("alice").await.unwrap().unwrap();
    assert_eq!(user.user_id, id);
    assert!(user.last_login.is_none());

    store.update_last_login(id).await.unwrap();
    assert!(store.require_user(id).await.unwrap().last_login.is_some());
    assert!(matches!(
        store.require_user(999).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn maps_are_scoped_to_their_owner() {
    let store = store().await;
    let alice = store.add_user("alice", "hash").await.unwrap();
    let bob = store.add_user("bob", "hash").await.unwrap();

    let map_id = store.add_knowledge_map(alice, "수학").await.unwrap();
    assert!(store.get_map_for_user(alice, map_id).await.is_ok());
    assert!(matches!(
        store.get_map_for_user(bob, map_id).await,
        Err(AppError::NotFound(_))
    ));
    assert!(store.get_user_knowledge_maps(bob).await.unwrap().is_empty());
    assert!(matches!(
        store.add_knowledge_map(alice, "   ").await,
        Err(AppError::BadRequest(_))
    ));
}

#[tokio::test]
async fn edges_stay_inside_their_map() {
    let store = store().await;
    let user = store.add_user("alice", "hash").await.unwrap();
    let math = store.add_knowledge_map(user, "수학").await.unwrap();
    let physics = store.add_knowledge_map(user, "물리").await.unwrap();

    let derivative = store.add_concept_node(math, "미분", "수학", 1).await.unwrap();
    let integral = store.add_concept_node(math, "적분", "수학", 2).await.unwrap();
    let force = store.add_concept_node(physics, "힘", "물리", 1).await.unwrap();

    let edge = store
        .add_concept_edge(math, derivative, integral, Some("역연산"), 0.8)
        .await
        .unwrap();
    assert!(edge > 0);

    assert!(matches!(
        store.add_concept_edge(math, derivative, force, None, 1.0).await,
        Err(AppError::BadRequest(_))
    ));
    assert!(matches!(
        store.add_concept_edge(math, derivative, derivative, None, 1.0).await,
        Err(AppError::BadRequest(_))
    ));
    assert!(matches!(
        store.add_concept_edge(math, derivative, integral, None, -1.0).await,
        Err(AppError::BadRequest(_))
    ));

    let data = store.get_knowledge_map(math).await.unwrap();
    assert_eq!(data.nodes.len(), 2);
    assert_eq!(data.edges.len(), 1);
    assert_eq!(data.edges[0].relationship_type.as_deref(), Some("역연산"));
}

#[tokio::test]
async fn deleting_a_concept_drops_its_edges() {
    let store = store().await;
    let user = store.add_user("alice", "hash").await.unwrap();
    let map = store.add_knowledge_map(user, "화학").await.unwrap();
    let a = store.add_concept_node(map, "원자", "화학", 1).await.unwrap();
    let b = store.add_concept_node(map, "분자", "화학", 1).await.unwrap();
    store.add_concept_edge(map, a, b, None, 1.0).await.unwrap();

    store.delete_concept_node(map, a).await.unwrap();
    let data = store.get_knowledge_map(map).await.unwrap();
    assert_eq!(data.nodes.len(), 1);
    assert!(data.edges.is_empty());

    assert!(matches!(
        store.delete_concept_node(map, a).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn study_statistics_group_by_subject() {
    let store = store().await;
    let user = store.add_user("alice", "hash").await.unwrap();

    store.add_study_record(user, &study("수학", 60, 80.0, 2)).await.unwrap();
    store.add_study_record(user, &study("수학", 30, 90.0, 4)).await.unwrap();
    store.add_study_record(user, &study("영어", 45, 70.0, 3)).await.unwrap();

    let stats = store
        .get_study_statistics(user, DateRange::default())
        .await
        .unwrap();
    assert_eq!(stats.len(), 2);

    let math = stats.iter().find(|s| s.subject == "수학").unwrap();
    assert_eq!(math.study_sessions, 2);
    assert_eq!(math.total_time, 90);
    assert!((math.avg_time - 45.0).abs() < 1e-9);
    assert_eq!(math.avg_score, Some(85.0));
    assert_eq!(math.avg_stress, Some(3.0));

    let efficiency = store.get_learning_efficiency(user).await.unwrap();
    assert_eq!(efficiency.len(), 2);

    assert!(matches!(
        store.get_study_statistics(404, DateRange::default()).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn records_filter_by_date_range() {
    let store = store().await;
    let user = store.add_user("alice", "hash").await.unwrap();
    let old = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
    let recent = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();

    for at in [old, recent] {
        let mut record = study("물리", 40, 75.0, 3);
        record.created_at = Some(at);
        store.add_study_record(user, &record).await.unwrap();
    }

    let all = store.get_study_records(user, DateRange::default()).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].created_at, recent);

    let since = DateRange::since(recent - Duration::days(1));
    assert_eq!(store.get_study_records(user, since).await.unwrap().len(), 1);

    let inverted = DateRange {
        start: Some(recent),
        end: Some(old),
    };
    assert!(matches!(
        store.get_study_records(user, inverted).await,
        Err(AppError::BadRequest(_))
    ));
}

#[tokio::test]
async fn mistake_patterns_count_repeats() {
    let store = store().await;
    let user = store.add_user("alice", "hash").await.unwrap();

    for repeated in [false, true, true] {
        let record = NewMistakeRecord {
            subject: "수학".to_string(),
            mistake_type: "계산 실수".to_string(),
            problem_difficulty: Some("중".to_string()),
            time_spent: Some(6),
            is_repeated: repeated,
            stress_level: Some(4),
            created_at: None,
        };
        store.add_mistake_record(user, &record).await.unwrap();
    }

    let patterns = store
        .get_mistake_patterns(user, DateRange::default())
        .await
        .unwrap();
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].frequency, 3);
    assert_eq!(patterns[0].repeated_count, 2);

    let bad = NewMistakeRecord {
        subject: "수학".to_string(),
        mistake_type: "계산 실수".to_string(),
        problem_difficulty: None,
        time_spent: None,
        is_repeated: false,
        stress_level: Some(9),
        created_at: None,
    };
    assert!(matches!(
        store.add_mistake_record(user, &bad).await,
        Err(AppError::BadRequest(_))
    ));
}

#[tokio::test]
async fn backup_and_restore_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = store().await;
    let user = store.add_user("alice", "hash").await.unwrap();
    store.add_knowledge_map(user, "생물").await.unwrap();

    let path = dir.path().join("snapshot.db");
    let written = store.backup_database(Some(path.clone())).await.unwrap();
    assert_eq!(written, path);
    assert!(path.exists());

    // A second backup must not overwrite the first.
    let err = store.backup_database(Some(path.clone())).await.unwrap_err();
    assert!(matches!(err.root(), AppError::Conflict(_)));

    store.add_knowledge_map(user, "지구과학").await.unwrap();
    assert_eq!(store.get_user_knowledge_maps(user).await.unwrap().len(), 2);

    store.restore_database(&path).await.unwrap();
    let maps = store.get_user_knowledge_maps(user).await.unwrap();
    assert_eq!(maps.len(), 1);
    assert_eq!(maps[0].subject, "생물");

    assert!(matches!(
        store.restore_database(&dir.path().join("missing.db")).await,
        Err(AppError::NotFound(_))
    ));
}

#[test]
fn default_backup_names_are_timestamped() {
    let name = default_backup_file_name();
    let stamp = name
        .strip_prefix("backup_mindmap_pro_")
        .and_then(|rest| rest.strip_suffix(".db"))
        .unwrap();
    assert!(chrono::NaiveDateTime::parse_from_str(stamp, "%Y%m%d_%H%M%S").is_ok());
}
