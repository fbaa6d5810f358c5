use expense_assistant::{
    api::{start_server, ApiState},
    backend::build_backend,
    clock::SystemClock,
    config::AppConfig,
    store::Stores,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let config = AppConfig::from_env()?;

    info!("Expense Assistant - API Server");
    info!(port = config.port, backend = ?config.ai_backend, "Configuration loaded");

    // Create components
    let stores = match config.database_url.as_deref() {
        Some(url) => {
            info!("Using Postgres stores");
            Stores::postgres(url).await?
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory stores (data is lost on restart)");
            Stores::in_memory()
        }
    };
    let backend = build_backend(&config)?;
    let state = ApiState::new(&config, stores, backend, Arc::new(SystemClock))?;

    info!("Services initialized");

    // Start API server
    start_server(state, config.port).await?;

    Ok(())
}
