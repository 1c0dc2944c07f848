//! End-to-end tests over the router, backed by an in-memory database.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use mindmap_pro::api;
use mindmap_pro::config::Config;
use mindmap_pro::db::Database;
use mindmap_pro::handlers::AppState;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const PASSWORD: &str = "Str0ng!pass";

async fn app() -> Router {
    let db = Database::new("sqlite::memory:").await.unwrap();
    let config = Config {
        bcrypt_cost: 4,
        login_max_attempts: 3,
        ..Config::default()
    };
    api::router(Arc::new(AppState::new(db.pool, config)))
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

/// Registers `username` and returns its access token.
async fn register(app: &Router, username: &str) -> String {
    let (status, body) = send(
        app,
        "POST",
        "/api/v1/auth/register",
        None,
        Some(json!({ "username": username, "password": PASSWORD })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    body["access_token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_is_public() {
    let app = app().await;
    let (status, body) = send(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn protected_routes_need_a_token() {
    let app = app().await;
    let (status, _) = send(&app, "GET", "/api/v1/maps", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, "GET", "/api/v1/maps", Some("not-a-jwt"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn registration_rules() {
    let app = app().await;
    register(&app, "student").await;

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/auth/register",
        None,
        Some(json!({ "username": "student", "password": PASSWORD })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/auth/register",
        None,
        Some(json!({ "username": "another", "password": "weak" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("8 characters"));
}

#[tokio::test]
async fn login_refresh_and_profile() {
    let app = app().await;
    register(&app, "student").await;

    let (status, session) = send(
        &app,
        "POST",
        "/api/v1/auth/login",
        None,
        Some(json!({ "username": "student", "password": PASSWORD })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["token_type"], "Bearer");
    let access = session["access_token"].as_str().unwrap();
    let refresh = session["refresh_token"].as_str().unwrap();

    let (status, profile) = send(&app, "GET", "/api/v1/me", Some(access), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(profile["username"], "student");
    assert!(profile.get("password_hash").is_none());

    let (status, refreshed) = send(
        &app,
        "POST",
        "/api/v1/auth/refresh",
        None,
        Some(json!({ "refresh_token": refresh })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let new_access = refreshed["access_token"].as_str().unwrap();
    let (status, _) = send(&app, "GET", "/api/v1/me", Some(new_access), None).await;
    assert_eq!(status, StatusCode::OK);

    // Token types are not interchangeable.
    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/auth/refresh",
        None,
        Some(json!({ "refresh_token": access })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(&app, "GET", "/api/v1/me", Some(refresh), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn repeated_failed_logins_are_throttled() {
    let app = app().await;
    register(&app, "student").await;
    let wrong = json!({ "username": "student", "password": "Wr0ng!pass" });

    for _ in 0..3 {
        let (status, _) = send(&app, "POST", "/api/v1/auth/login", None, Some(wrong.clone())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    // Even the right password is refused until the window passes.
    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/auth/login",
        None,
        Some(json!({ "username": "student", "password": PASSWORD })),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn forwarded_headers_do_not_reset_the_login_limit() {
    let app = app().await;
    register(&app, "student").await;

    let mut statuses = Vec::new();
    for i in 0..6 {
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/auth/login")
            .header("content-type", "application/json")
            .header("x-forwarded-for", format!("203.0.113.{}", i))
            .header("x-real-ip", format!("198.51.100.{}", i))
            .body(Body::from(
                json!({ "username": "student", "password": "Wr0ng!pass" }).to_string(),
            ))
            .unwrap();
        statuses.push(app.clone().oneshot(request).await.unwrap().status());
    }

    assert_eq!(&statuses[..3], &[StatusCode::UNAUTHORIZED; 3]);
    assert_eq!(&statuses[3..], &[StatusCode::TOO_MANY_REQUESTS; 3]);
}

#[tokio::test]
async fn change_password_flow() {
    let app = app().await;
    let token = register(&app, "student").await;

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/auth/change-password",
        Some(&token),
        Some(json!({ "old_password": "Wr0ng!pass", "new_password": "N3w!password" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/auth/change-password",
        Some(&token),
        Some(json!({ "old_password": PASSWORD, "new_password": "short" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/auth/change-password",
        Some(&token),
        Some(json!({ "old_password": PASSWORD, "new_password": "N3w!password" })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/auth/login",
        None,
        Some(json!({ "username": "student", "password": "N3w!password" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn knowledge_map_lifecycle() {
    let app = app().await;
    let token = register(&app, "student").await;
    let other = register(&app, "other").await;

    let (status, map) = send(
        &app,
        "POST",
        "/api/v1/maps",
        Some(&token),
        Some(json!({ "subject": "수학" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let map_id = map["map_id"].as_i64().unwrap();
    let concepts = format!("/api/v1/maps/{}/concepts", map_id);
    let metrics = format!("/api/v1/maps/{}/metrics", map_id);

    let (status, first) = send(
        &app,
        "POST",
        &concepts,
        Some(&token),
        Some(json!({ "concept": "미분" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["created"], true);
    let derivative_id = first["node_id"].as_i64().unwrap();

    let (status, second) = send(
        &app,
        "POST",
        &concepts,
        Some(&token),
        Some(json!({ "concept": "적분", "level": 2, "related": ["미분"] })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(second["edge_ids"].as_array().unwrap().len(), 1);

    // Re-adding an existing link is a no-op.
    let (status, again) = send(
        &app,
        "POST",
        &concepts,
        Some(&token),
        Some(json!({ "concept": "적분", "related": ["미분"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["created"], false);
    assert!(again["edge_ids"].as_array().unwrap().is_empty());

    let (status, _) = send(
        &app,
        "POST",
        &concepts,
        Some(&token),
        Some(json!({ "concept": "극한", "related": ["없는 개념"] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, "GET", &metrics, Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["node_count"], 2);
    assert_eq!(body["edge_count"], 1);

    let (status, layout) = send(
        &app,
        "GET",
        &format!("/api/v1/maps/{}/layout", map_id),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(layout["nodes"].as_array().unwrap().len(), 2);

    // Other users cannot see the map.
    let (status, _) = send(
        &app,
        "GET",
        &format!("/api/v1/maps/{}", map_id),
        Some(&other),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Deleting a concept invalidates the cached metrics.
    let (status, _) = send(
        &app,
        "DELETE",
        &format!("{}/{}", concepts, derivative_id),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = send(&app, "GET", &metrics, Some(&token), None).await;
    assert_eq!(body["node_count"], 1);
    assert_eq!(body["edge_count"], 0);

    let (status, maps) = send(&app, "GET", "/api/v1/maps", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(maps.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn study_logs_feed_the_analyses() {
    let app = app().await;
    let token = register(&app, "student").await;

    let (_, stats) = send(&app, "GET", "/api/v1/analysis/statistics", Some(&token), None).await;
    assert!(stats.as_array().unwrap().is_empty());

    for (subject, minutes, score, stress) in [
        ("math", 60, 80.0, 2),
        ("math", 30, 90.0, 4),
        ("english", 45, 70.0, 3),
    ] {
        let (status, _) = send(
            &app,
            "POST",
            "/api/v1/study-records",
            Some(&token),
            Some(json!({
                "subject": subject,
                "study_time": minutes,
                "score": score,
                "stress_level": stress
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    // Cached empty statistics were dropped by the writes.
    let (status, stats) = send(&app, "GET", "/api/v1/analysis/statistics", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats.as_array().unwrap().len(), 2);

    let (status, patterns) = send(&app, "GET", "/api/v1/analysis/patterns", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(patterns["period_days"], 30);
    assert_eq!(patterns["patterns"]["most_studied"], "math");

    let (status, _) = send(
        &app,
        "GET",
        "/api/v1/analysis/patterns?days=0",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // A window too large for the calendar is a client error, not a panic.
    let (status, _) = send(
        &app,
        "GET",
        "/api/v1/analysis/patterns?days=100000000",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, prediction) = send(
        &app,
        "GET",
        "/api/v1/analysis/prediction?subject=math",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(prediction["predicted_score"].as_f64().is_some());

    let (status, report) = send(&app, "GET", "/api/v1/analysis/learning", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["summary"]["total_study_time"], 135);

    let (status, efficiency) = send(&app, "GET", "/api/v1/analysis/efficiency", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(efficiency.as_array().unwrap().len(), 2);

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/study-records",
        Some(&token),
        Some(json!({ "subject": "math", "study_time": 10, "score": 140.0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    for minutes in [1441_i64, i64::MAX] {
        let (status, _) = send(
            &app,
            "POST",
            "/api/v1/study-records",
            Some(&token),
            Some(json!({ "subject": "math", "study_time": minutes, "score": 50.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // Rejected writes leave the totals readable.
    let (status, stats) = send(&app, "GET", "/api/v1/analysis/statistics", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn mistakes_and_export() {
    let app = app().await;
    let token = register(&app, "student").await;

    for kind in ["계산 실수", "계산 실수", "개념 오해"] {
        let (status, _) = send(
            &app,
            "POST",
            "/api/v1/mistakes",
            Some(&token),
            Some(json!({
                "subject": "수학",
                "mistake_type": kind,
                "time_spent": 5,
                "stress_level": 3
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, mistakes) = send(&app, "GET", "/api/v1/mistakes", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(mistakes.as_array().unwrap().len(), 3);

    let (status, analysis) = send(&app, "GET", "/api/v1/analysis/mistakes", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(analysis["report"]["total_mistakes"], 3);
    assert_eq!(
        analysis["report"]["suggestions"]["primary_mistake"],
        "계산 실수"
    );
    assert_eq!(analysis["patterns"].as_array().unwrap().len(), 2);

    let (status, export) = send(&app, "GET", "/api/v1/export", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(export["user_info"]["username"], "student");
    assert_eq!(export["mistake_records"].as_array().unwrap().len(), 3);
    assert!(!export.to_string().contains("password_hash"));

    let (status, stats) = send(&app, "GET", "/api/v1/cache/stats", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(stats.is_object());
}
