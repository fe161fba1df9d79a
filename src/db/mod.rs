pub mod models;
pub mod queries;

pub use queries::{init_db, ClientRepo, CommandRepo, DbPool, EventFilter, EventRepo};
