//! The dispatch gateway: HTTP surface over the client registry, command
//! ledger, and event log. Agent routes authenticate first; admin routes are
//! trusted by network placement.

use crate::config::AppConfig;
use crate::db::models::*;
use crate::db::{ClientRepo, CommandRepo, EventFilter, EventRepo};
use crate::error::{AppError, AppResult};
use crate::web::auth::authenticate_agent;
use crate::web::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Poll size bounds for GET /commands
const DEFAULT_FETCH_LIMIT: i64 = 10;
const MAX_FETCH_LIMIT: i64 = 50;

/// Page size bound for admin listings
const MAX_PAGE_LIMIT: i64 = 200;

fn clamp_limit(limit: i64, max: i64) -> i64 {
    limit.clamp(1, max)
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Handler: GET /
pub async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "Welcome to Fleetguard" }))
}

// --- Agent-facing endpoints ---

/// Handler: POST /api/v1/clients/heartbeat
///
/// Idempotent: refreshes last_heartbeat and forces status back to active.
pub async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<ClientView>> {
    let client = authenticate_agent(&state.pool, &headers).await?;
    let updated = ClientRepo::touch_heartbeat(&state.pool, &client.id).await?;
    Ok(Json(updated.into()))
}

#[derive(Debug, Deserialize)]
pub struct FetchCommandsParams {
    #[serde(default = "default_fetch_limit")]
    pub limit: i64,
}

fn default_fetch_limit() -> i64 {
    DEFAULT_FETCH_LIMIT
}

/// Handler: GET /api/v1/commands?limit=N
///
/// Returns the caller's pending commands oldest first, transitioned to
/// `dispatched` on the way out. An empty list is a normal answer.
pub async fn fetch_commands(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<FetchCommandsParams>,
) -> AppResult<Json<Vec<CommandView>>> {
    let client = authenticate_agent(&state.pool, &headers).await?;
    let limit = clamp_limit(params.limit, MAX_FETCH_LIMIT);
    let commands = CommandRepo::fetch_and_dispatch(&state.pool, &client.id, limit).await?;
    Ok(Json(commands.into_iter().map(Into::into).collect()))
}

/// Handler: PATCH /api/v1/commands/{id}
///
/// The caller reports progress on its own command. Terminal commands are
/// immutable; foreign commands are off limits.
pub async fn update_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(command_id): Path<String>,
    Json(update): Json<CommandStatusUpdate>,
) -> AppResult<Json<CommandView>> {
    let client = authenticate_agent(&state.pool, &headers).await?;
    let updated = CommandRepo::apply_client_update(
        &state.pool,
        &command_id,
        &client.id,
        update.status,
        update.execution_result.as_deref(),
    )
    .await?;
    Ok(Json(updated.into()))
}

/// Handler: POST /api/v1/events
///
/// Batched telemetry ingestion, attributed to the authenticated caller.
pub async fn submit_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(events): Json<Vec<NewSecurityEvent>>,
) -> AppResult<(StatusCode, Json<Vec<SecurityEventView>>)> {
    let client = authenticate_agent(&state.pool, &headers).await?;
    if events.is_empty() {
        return Err(AppError::validation("No events provided"));
    }
    let created = EventRepo::create_batch(&state.pool, &client.id, events).await?;
    Ok((
        StatusCode::CREATED,
        Json(created.into_iter().map(Into::into).collect()),
    ))
}

// --- Administrative endpoints (operator network only) ---

/// Handler: POST /api/v1/admin/clients
///
/// Registers a client. The response is the only place the plaintext API key
/// ever appears; it is not retrievable again.
pub async fn register_client(
    State(state): State<AppState>,
    Json(new_client): Json<NewClient>,
) -> AppResult<(StatusCode, Json<ClientWithKey>)> {
    let cost = AppConfig::get().auth.bcrypt_cost;
    let (client, api_key) =
        ClientRepo::create_with_api_key(&state.pool, new_client, cost).await?;
    let response = ClientWithKey {
        client: client.into(),
        api_key: api_key.reveal().to_string(),
    };
    Ok((StatusCode::CREATED, Json(response)))
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_page_limit")]
    pub limit: i64,
}

fn default_page_limit() -> i64 {
    100
}

/// Handler: GET /api/v1/admin/clients
pub async fn list_clients(
    State(state): State<AppState>,
    Query(page): Query<Pagination>,
) -> AppResult<Json<Vec<ClientView>>> {
    let clients = ClientRepo::list(
        &state.pool,
        page.skip.max(0),
        clamp_limit(page.limit, MAX_PAGE_LIMIT),
    )
    .await?;
    Ok(Json(clients.into_iter().map(Into::into).collect()))
}

/// Handler: GET /api/v1/admin/clients/{id}
pub async fn get_client(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> AppResult<Json<ClientView>> {
    let client = ClientRepo::get(&state.pool, &client_id)
        .await?
        .ok_or_else(|| AppError::not_found("Client not found"))?;
    Ok(Json(client.into()))
}

/// Handler: POST /api/v1/admin/commands
///
/// Queues a command for a client; the target not being active queues it all
/// the same.
pub async fn create_command(
    State(state): State<AppState>,
    Json(new_command): Json<NewCommand>,
) -> AppResult<(StatusCode, Json<CommandView>)> {
    let command = CommandRepo::create(&state.pool, new_command).await?;
    Ok((StatusCode::CREATED, Json(command.into())))
}

#[derive(Debug, Deserialize)]
pub struct CommandListParams {
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_page_limit")]
    pub limit: i64,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub status: Option<CommandStatus>,
}

/// Handler: GET /api/v1/admin/commands
pub async fn list_commands(
    State(state): State<AppState>,
    Query(params): Query<CommandListParams>,
) -> AppResult<Json<Vec<CommandView>>> {
    let commands = CommandRepo::list_all(
        &state.pool,
        params.skip.max(0),
        clamp_limit(params.limit, MAX_PAGE_LIMIT),
        params.client_id.as_deref(),
        params.status,
    )
    .await?;
    Ok(Json(commands.into_iter().map(Into::into).collect()))
}

/// Handler: GET /api/v1/admin/commands/{id}
pub async fn get_command(
    State(state): State<AppState>,
    Path(command_id): Path<String>,
) -> AppResult<Json<CommandView>> {
    let command = CommandRepo::get(&state.pool, &command_id)
        .await?
        .ok_or_else(|| AppError::not_found("Command not found"))?;
    Ok(Json(command.into()))
}

/// Handler: PATCH /api/v1/admin/commands/{id}
///
/// Privileged field rewrite. Changing a terminal command's status requires
/// an explicit `force: true`.
pub async fn admin_update_command(
    State(state): State<AppState>,
    Path(command_id): Path<String>,
    Json(update): Json<AdminCommandUpdate>,
) -> AppResult<Json<CommandView>> {
    let updated = CommandRepo::update_by_admin(&state.pool, &command_id, update).await?;
    Ok(Json(updated.into()))
}

#[derive(Debug, Deserialize)]
pub struct EventListParams {
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_page_limit")]
    pub limit: i64,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
}

/// Handler: GET /api/v1/admin/events
pub async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<EventListParams>,
) -> AppResult<Json<Vec<SecurityEventView>>> {
    let events = EventRepo::list(
        &state.pool,
        EventFilter {
            skip: params.skip.max(0),
            limit: clamp_limit(params.limit, MAX_PAGE_LIMIT),
            client_id: params.client_id,
            event_type: params.event_type,
            severity: params.severity,
            start_date: params.start_date,
            end_date: params.end_date,
        },
    )
    .await?;
    Ok(Json(events.into_iter().map(Into::into).collect()))
}

/// Create the gateway router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/clients/heartbeat", post(heartbeat))
        .route("/commands", get(fetch_commands))
        .route("/commands/{id}", axum::routing::patch(update_command))
        .route("/events", post(submit_events))
        .route("/admin/clients", post(register_client).get(list_clients))
        .route("/admin/clients/{id}", get(get_client))
        .route("/admin/commands", post(create_command).get(list_commands))
        .route(
            "/admin/commands/{id}",
            get(get_command).patch(admin_update_command),
        )
        .route("/admin/events", get(list_events));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
