pub mod auth;
pub mod routes;

pub use routes::create_router;

use crate::db::DbPool;

/// Shared state for the dispatch gateway
#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
}
