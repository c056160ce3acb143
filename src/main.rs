use std::path::PathBuf;

use anyhow::Context;
use axum::http::{HeaderValue, Method, header::CONTENT_TYPE};
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use s2s_gateway::{ServerConfig, routes, state::AppState};

/// Speech-to-speech relay server
#[derive(Parser, Debug)]
#[command(name = "s2s-gateway")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            ServerConfig::from_file(path)?
        }
        None => ServerConfig::from_env()?,
    };

    // Configure CORS: explicit origins when configured, otherwise open.
    // The browser demo client is served from an arbitrary origin.
    let cors_layer = if config.cors_allowed_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::OPTIONS])
            .allow_headers([CONTENT_TYPE])
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::OPTIONS])
            .allow_headers([CONTENT_TYPE])
    };

    let address = config.address();
    info!(
        address = %address,
        model_id = %config.model_id,
        log_path = %config.conversation_log_path.display(),
        "Starting s2s-gateway"
    );

    let app_state = AppState::new(config);
    let app = routes::create_router()
        .with_state(app_state)
        .layer(cors_layer);

    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {address}"))?;
    axum::serve(listener, app)
        .await
        .context("Server terminated unexpectedly")?;

    Ok(())
}
