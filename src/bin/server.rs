//! mealsync sync server
//!
//! Stores each user's documents and reconciles pushes from all of their
//! devices.
//!
//! # Configuration
//!
//! Environment variables:
//! - `MEALSYNC_PORT`: Port to listen on (default: 8080)
//! - `MEALSYNC_DATA_DIR`: Directory to store documents (default: ~/.local/share/mealsync-server)
//! - `MEALSYNC_CONFIG`: Path to config file (default: ~/.config/mealsync-server/config.yaml)
//!
//! # Config File Format
//!
//! ```yaml
//! api_keys:
//!   - key: "your-secret-key-here"
//!     user_id: "user1"
//! ```
//!
//! # Endpoints
//!
//! - `GET /health`: Health check endpoint (no auth required)
//! - `POST /sync/push`, `GET /sync/pull`, `POST /sync/full` (auth required)

use mealsync::clock::SystemClock;
use mealsync::server::{router, ApiKeyStore, AppState, ReconciliationService, ServerConfig, ServerStorage};
use mealsync::sync::CollectionRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mealsync_server=info,mealsync=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::from_env();

    std::fs::create_dir_all(&config.data_dir)?;

    tracing::info!("Data directory: {}", config.data_dir.display());
    tracing::info!("Config file: {}", config.config_path.display());

    let api_keys = Arc::new(ApiKeyStore::load(&config.config_path));
    let service = ReconciliationService::new(
        ServerStorage::new(&config.data_dir),
        CollectionRegistry::default(),
        Arc::new(SystemClock),
    );

    let state = AppState {
        api_keys,
        service: Arc::new(service),
    };
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}
