use fleetguard::{config::AppConfig, db, web};
use sqlx::sqlite::SqlitePoolOptions;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging first
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleetguard=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Fleetguard v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::init()?;
    info!("Configuration loaded");

    // Initialize database
    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;
    info!("Database connected: {}", config.database.url);

    db::init_db(&pool).await?;

    // Deadline sweep: marks overdue dispatched commands as timed out. Just
    // another mutator under the ledger's terminal-state rules.
    if config.dispatch.reaper_enabled {
        let reaper_pool = pool.clone();
        let interval = Duration::from_secs(config.dispatch.reaper_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match db::CommandRepo::sweep_overdue(&reaper_pool, chrono::Utc::now()).await {
                    Ok(0) => {}
                    Ok(swept) => info!("Marked {} overdue commands as timed out", swept),
                    Err(e) => error!("Deadline sweep failed: {}", e),
                }
            }
        });
        info!(
            "Dispatch deadline reaper running every {}s",
            config.dispatch.reaper_interval_secs
        );
    }

    // Create web server state and router
    let state = web::AppState { pool };
    let app = web::create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
