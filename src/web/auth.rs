//! Agent authentication for the dispatch gateway.
//!
//! Every agent-facing route resolves the caller here before touching the
//! ledger. The acting identity for any mutation is the returned client,
//! never an id taken from request input.

use axum::http::HeaderMap;

use crate::config::AppConfig;
use crate::db::models::Client;
use crate::db::{ClientRepo, DbPool};
use crate::error::{AppError, AppResult};

/// Bearer credential header presented by agents
pub const API_KEY_HEADER: &str = "x-api-key";

/// Resolve the calling agent from its `X-API-Key` header.
pub async fn authenticate_agent(pool: &DbPool, headers: &HeaderMap) -> AppResult<Client> {
    let api_key = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::unauthenticated("API key is missing"))?;

    let scan_limit = AppConfig::get().auth.registry_scan_limit;
    ClientRepo::authenticate(pool, api_key, scan_limit).await
}
