use dotenvy::dotenv;
use invoicing_engine::config::get_configuration;
use invoicing_engine::services::Database;
use invoicing_engine::startup::build_router;
use service_core::observability::logging::init_tracing;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let configuration = get_configuration().map_err(|e| {
        eprintln!("Failed to read configuration: {}", e);
        anyhow::anyhow!("Configuration error: {}", e)
    })?;

    init_tracing(
        "invoicing-engine",
        &configuration.observability.log_level,
        &configuration.observability.otlp_endpoint,
    );

    invoicing_engine::services::metrics::init_metrics();

    let db = Database::new(
        &configuration.database.url,
        configuration.database.max_connections,
        configuration.database.min_connections,
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

    db.run_migrations()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;

    let app = build_router(Arc::new(db));

    let address = format!(
        "{}:{}",
        configuration.server.host, configuration.server.port
    );
    let listener = tokio::net::TcpListener::bind(&address).await.map_err(|e| {
        tracing::error!("Failed to bind TCP listener to {}: {}", address, e);
        anyhow::anyhow!("Failed to bind to address {}: {}", address, e)
    })?;

    info!("Starting invoicing-engine on {}", address);
    axum::serve(listener, app).await.map_err(|e| {
        tracing::error!("Server error: {}", e);
        anyhow::anyhow!("Server error: {}", e)
    })?;

    Ok(())
}
