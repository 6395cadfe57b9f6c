//! Docsync Server
//!
//! Persists collaborative documents, issues relay credentials and relays
//! live edits between connected clients.
//!
//! # Configuration
//!
//! Environment variables:
//! - `DOCSYNC_PORT`: Port to listen on (default: 8080)
//! - `DOCSYNC_DATA_DIR`: Directory for server state (default: ~/.local/share/docsync-server)
//! - `DOCSYNC_DATABASE_PATH`: SQLite database (default: `<data_dir>/docsync.db`)
//! - `DOCSYNC_PUBLIC_URL`: Base URL handed out in credentials (default: http://localhost:<port>)
//! - `DOCSYNC_CREDENTIAL_TTL_SECS`: Credential lifetime (default: 600)
//! - `DOCSYNC_CONFIG`: Path to config file (default: ~/.config/docsync-server/config.yaml)
//!
//! # Config File Format
//!
//! ```yaml
//! port: 8080
//! public_url: https://sync.example.com
//! api_keys:
//!   - key: "your-secret-key-here"
//!     name: "laptop"
//! ```

use std::net::SocketAddr;

use docsync::config::ServerConfig;
use docsync::server::{app, init_db, spawn_token_cleanup, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docsync=info,docsync_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::load(None)?;

    std::fs::create_dir_all(&config.data_dir)?;
    tracing::info!("Data directory: {}", config.data_dir.display());

    let database_path = config.database_path();
    tracing::info!("Database: {}", database_path.display());
    let pool = init_db(&database_path).await?;

    let state = AppState::new(&config, pool);
    if state.api_keys.is_open() {
        tracing::warn!("No API keys configured - /credentials and /sync are open to anyone");
    } else {
        tracing::info!("Loaded {} API key(s)", state.api_keys.len());
    }

    spawn_token_cleanup(state.credentials.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {} (public URL {})", addr, config.public_url());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state)).await?;

    Ok(())
}
