//! End-to-end tests of the dispatch protocol against the real router.
//!
//! Unit tests passing != system works. These drive the HTTP surface the way
//! an agent and an operator would: register, queue, poll, report, ingest.

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use tower::ServiceExt;

use fleetguard::config::AppConfig;
use fleetguard::db;
use fleetguard::web::{create_router, AppState};

async fn test_app() -> Router {
    // Cheap hashing rounds; the vault's own tests cover the real cost.
    std::env::set_var("FLEETGUARD__AUTH__BCRYPT_COST", "4");
    let _ = AppConfig::init();

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    db::init_db(&pool).await.expect("Failed to init database");
    create_router(AppState { pool })
}

fn request(method: Method, uri: &str, api_key: Option<&str>, body: Option<&Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(key) = api_key {
        builder = builder.header("X-API-Key", key);
    }
    match body {
        Some(value) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

/// Register a client and return (client_id, api_key).
async fn register(app: &Router, name: &str) -> (String, String) {
    let (status, body) = send(
        app,
        request(
            Method::POST,
            "/api/v1/admin/clients",
            None,
            Some(&json!({ "client_name": name })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    (
        body["id"].as_str().unwrap().to_string(),
        body["api_key"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn test_full_dispatch_lifecycle() {
    let app = test_app().await;

    // register agent-1; the secret appears here and never again
    let (client_id, api_key) = register(&app, "agent-1").await;

    // admin queues a command
    let (status, command) = send(
        &app,
        request(
            Method::POST,
            "/api/v1/admin/commands",
            None,
            Some(&json!({
                "client_id": client_id,
                "command_type": "log_message",
                "payload": { "message": "hi" }
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(command["status"], "pending_dispatch");
    let command_id = command["id"].as_str().unwrap().to_string();

    // agent polls: the command comes back dispatched
    let (status, batch) = send(
        &app,
        request(Method::GET, "/api/v1/commands?limit=10", Some(&api_key), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let batch = batch.as_array().unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0]["id"], command_id.as_str());
    assert_eq!(batch[0]["status"], "dispatched");
    assert_eq!(batch[0]["payload"]["message"], "hi");

    // a second poll finds nothing; empty list, not an error
    let (status, batch) = send(
        &app,
        request(Method::GET, "/api/v1/commands?limit=10", Some(&api_key), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(batch.as_array().unwrap().is_empty());

    // agent reports completion
    let (status, updated) = send(
        &app,
        request(
            Method::PATCH,
            &format!("/api/v1/commands/{command_id}"),
            Some(&api_key),
            Some(&json!({ "status": "completed", "execution_result": "done" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["status"], "completed");
    assert_eq!(updated["execution_result"], "done");

    // terminal states are immutable, whatever the requested status
    let (status, body) = send(
        &app,
        request(
            Method::PATCH,
            &format!("/api/v1/commands/{command_id}"),
            Some(&api_key),
            Some(&json!({ "status": "in_progress" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("final state"));

    // admin read side agrees
    let (status, fetched) = send(
        &app,
        request(
            Method::GET,
            &format!("/api/v1/admin/commands/{command_id}"),
            None,
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["status"], "completed");
}

#[tokio::test]
async fn test_missing_and_invalid_api_key() {
    let app = test_app().await;
    register(&app, "agent-1").await;

    let (status, body) = send(
        &app,
        request(Method::POST, "/api/v1/clients/heartbeat", None, None),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 401);

    let (status, _) = send(
        &app,
        request(
            Method::POST,
            "/api/v1/clients/heartbeat",
            Some("not-a-real-key"),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_heartbeat_updates_client() {
    let app = test_app().await;
    let (_, api_key) = register(&app, "agent-1").await;

    let (status, first) = send(
        &app,
        request(Method::POST, "/api/v1/clients/heartbeat", Some(&api_key), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["status"], "active");
    assert!(first["last_heartbeat"].is_string());

    let (status, second) = send(
        &app,
        request(Method::POST, "/api/v1/clients/heartbeat", Some(&api_key), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["status"], "active");
    assert!(
        second["last_heartbeat"].as_str().unwrap() >= first["last_heartbeat"].as_str().unwrap()
    );
}

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let app = test_app().await;
    register(&app, "agent-1").await;

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/api/v1/admin/clients",
            None,
            Some(&json!({ "client_name": "agent-1" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("already exists"));
}

#[tokio::test]
async fn test_secret_never_resurfaces() {
    let app = test_app().await;
    let (client_id, api_key) = register(&app, "agent-1").await;
    assert_eq!(api_key.len(), 43);

    let (_, listed) = send(&app, request(Method::GET, "/api/v1/admin/clients", None, None)).await;
    let listed = &listed.as_array().unwrap()[0];
    assert!(listed.get("api_key").is_none());
    assert!(listed.get("api_key_hash").is_none());

    let (_, fetched) = send(
        &app,
        request(
            Method::GET,
            &format!("/api/v1/admin/clients/{client_id}"),
            None,
            None,
        ),
    )
    .await;
    assert!(fetched.get("api_key").is_none());
    assert!(fetched.get("api_key_hash").is_none());
}

#[tokio::test]
async fn test_foreign_command_update_forbidden() {
    let app = test_app().await;
    let (owner_id, _) = register(&app, "agent-1").await;
    let (_, intruder_key) = register(&app, "agent-2").await;

    let (_, command) = send(
        &app,
        request(
            Method::POST,
            "/api/v1/admin/commands",
            None,
            Some(&json!({ "client_id": owner_id, "command_type": "block_ip" })),
        ),
    )
    .await;
    let command_id = command["id"].as_str().unwrap();

    let (status, _) = send(
        &app,
        request(
            Method::PATCH,
            &format!("/api/v1/commands/{command_id}"),
            Some(&intruder_key),
            Some(&json!({ "status": "completed" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_unknown_ids_are_404() {
    let app = test_app().await;
    let (_, api_key) = register(&app, "agent-1").await;

    let (status, _) = send(
        &app,
        request(Method::GET, "/api/v1/admin/clients/nonexistent", None, None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        request(Method::GET, "/api/v1/admin/commands/nonexistent", None, None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        request(
            Method::PATCH,
            "/api/v1/commands/nonexistent",
            Some(&api_key),
            Some(&json!({ "status": "acknowledged" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        request(
            Method::POST,
            "/api/v1/admin/commands",
            None,
            Some(&json!({ "client_id": "nonexistent", "command_type": "noop" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_poll_limit_is_clamped_and_fifo() {
    let app = test_app().await;
    let (client_id, api_key) = register(&app, "agent-1").await;

    for i in 0..3 {
        send(
            &app,
            request(
                Method::POST,
                "/api/v1/admin/commands",
                None,
                Some(&json!({ "client_id": client_id, "command_type": format!("cmd-{i}") })),
            ),
        )
        .await;
    }

    // limit=0 clamps to 1 and delivers the oldest command
    let (status, batch) = send(
        &app,
        request(Method::GET, "/api/v1/commands?limit=0", Some(&api_key), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let batch = batch.as_array().unwrap().clone();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0]["command_type"], "cmd-0");

    // an oversized limit clamps to the cap and drains the rest in order
    let (status, rest) = send(
        &app,
        request(Method::GET, "/api/v1/commands?limit=9999", Some(&api_key), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let rest = rest.as_array().unwrap();
    assert_eq!(rest.len(), 2);
    assert_eq!(rest[0]["command_type"], "cmd-1");
    assert_eq!(rest[1]["command_type"], "cmd-2");
}

#[tokio::test]
async fn test_event_ingestion() {
    let app = test_app().await;
    let (client_id, api_key) = register(&app, "agent-1").await;

    // empty batch is a client error
    let (status, _) = send(
        &app,
        request(Method::POST, "/api/v1/events", Some(&api_key), Some(&json!([]))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // three events: all attributed to the caller, distinct ids, timestamps set
    let (status, created) = send(
        &app,
        request(
            Method::POST,
            "/api/v1/events",
            Some(&api_key),
            Some(&json!([
                { "event_type": "login_failure", "severity": "high", "source_ip": "203.0.113.45" },
                { "event_type": "firewall_block", "severity": "low" },
                { "event_type": "sql_injection_attempt", "severity": "critical",
                  "details": { "query": "1 OR 1=1" } }
            ])),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let created = created.as_array().unwrap();
    assert_eq!(created.len(), 3);
    let ids: std::collections::HashSet<_> =
        created.iter().map(|e| e["id"].as_str().unwrap()).collect();
    assert_eq!(ids.len(), 3);
    for event in created {
        assert_eq!(event["client_id"], client_id.as_str());
        assert!(event["timestamp"].is_string());
    }
    assert_eq!(created[2]["details"]["query"], "1 OR 1=1");

    // the admin read side can filter by severity
    let (status, listed) = send(
        &app,
        request(
            Method::GET,
            "/api/v1/admin/events?severity=critical",
            None,
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let listed = listed.as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["event_type"], "sql_injection_attempt");
}

#[tokio::test]
async fn test_events_require_authentication() {
    let app = test_app().await;

    let (status, _) = send(
        &app,
        request(
            Method::POST,
            "/api/v1/events",
            None,
            Some(&json!([{ "event_type": "x", "severity": "low" }])),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_health_and_root() {
    let app = test_app().await;

    let (status, body) = send(&app, request(Method::GET, "/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send(&app, request(Method::GET, "/", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["message"].as_str().unwrap().contains("Fleetguard"));
}
