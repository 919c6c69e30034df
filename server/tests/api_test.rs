//! Router tests for the REST endpoints.

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use livesync_engine::Record;
use livesync_server::{app, config::Config, AppState};
use serde_json::{json, Value};
use tower::ServiceExt;

fn setup() -> (AppState, Router) {
    let state = AppState::new(Config::default());
    state.store.seed(
        "projects",
        vec![
            Record::new("1", json!({"title": "Education", "client_id": "X"})).unwrap(),
            Record::new("2", json!({"title": "Water", "client_id": "Y"})).unwrap(),
        ],
    );
    let router = app(state.clone());
    (state, router)
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => request.body(Body::from(body.to_string())).unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let (_state, router) = setup();
    let (status, body) = send(&router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 0);
    assert_eq!(body["collections"], json!(["projects"]));
}

#[tokio::test]
async fn test_query_all_and_filtered() {
    let (_state, router) = setup();

    let (status, body) = send(&router, "GET", "/rest/projects", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["records"].as_array().unwrap().len(), 2);
    assert!(body["sequence"].is_u64());

    let (status, body) = send(&router, "GET", "/rest/projects?client_id=eq.Y", None).await;
    assert_eq!(status, StatusCode::OK);
    let records = body["records"].as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["id"], "2");
}

#[tokio::test]
async fn test_query_null_filter_matches_missing_field() {
    let (state, router) = setup();
    state
        .store
        .insert(
            "projects",
            Record::new("3", json!({"title": "Health", "owner": "null"})).unwrap(),
        )
        .unwrap();

    let (status, body) = send(&router, "GET", "/rest/projects?owner=eq.null", None).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<_> = body["records"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].clone())
        .collect();
    assert_eq!(ids, vec![json!("1"), json!("2")]);

    let (_, body) = send(&router, "GET", "/rest/projects?owner=eq.%22null%22", None).await;
    assert_eq!(body["records"].as_array().unwrap().len(), 1);
    assert_eq!(body["records"][0]["id"], "3");
}

#[tokio::test]
async fn test_query_unknown_collection_is_empty() {
    let (_state, router) = setup();
    let (status, body) = send(&router, "GET", "/rest/tasks", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["records"], json!([]));
}

#[tokio::test]
async fn test_query_rejects_bad_filters() {
    let (_state, router) = setup();

    let (status, _) = send(&router, "GET", "/rest/projects?client_id=gt.X", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &router,
        "GET",
        "/rest/projects?client_id=eq.X&title=eq.Water",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_update_delete() {
    let (state, router) = setup();

    let (status, body) = send(
        &router,
        "POST",
        "/rest/projects",
        Some(json!({"id": "3", "title": "Health", "client_id": "X"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["id"], "3");

    let (status, _) = send(
        &router,
        "POST",
        "/rest/projects",
        Some(json!({"id": "3", "title": "Again"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(
        &router,
        "PATCH",
        "/rest/projects/3",
        Some(json!({"title": "Public Health"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["title"], "Public Health");
    assert_eq!(body["client_id"], "X");

    let (status, _) = send(&router, "DELETE", "/rest/projects/3", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&router, "DELETE", "/rest/projects/3", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    assert_eq!(state.store.records("projects").len(), 2);
}

#[tokio::test]
async fn test_create_requires_id() {
    let (_state, router) = setup();
    let (status, _) = send(
        &router,
        "POST",
        "/rest/projects",
        Some(json!({"title": "No id"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_patch_missing_record() {
    let (_state, router) = setup();
    let (status, _) = send(
        &router,
        "PATCH",
        "/rest/projects/99",
        Some(json!({"title": "Ghost"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
