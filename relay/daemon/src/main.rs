//! Chat Relay Daemon
//!
//! HTTP polling proxy in front of the Gemini streaming API. Clients start a
//! chat, then poll for response fragments until the stream is done.
//!
//! # Usage
//!
//! ```bash
//! # Listen on 0.0.0.0:3000 with the key from the environment or .env
//! GEMINI_API_KEY=... chat-relay
//!
//! # Custom port and model
//! chat-relay --port 8080 --model gemini-2.5-pro
//!
//! # With verbose logging
//! RUST_LOG=debug chat-relay
//! ```
//!
//! # Environment Variables
//!
//! - `GEMINI_API_KEY`: API key for the Generative Language API
//! - `GEMINI_BASE_URL`: API base URL
//! - `GEMINI_MODEL`: default model
//! - `HOST` / `PORT`: listen address (default: 0.0.0.0:3000)
//! - `RELAY_IDLE_TIMEOUT_SECS`: evict finished sessions after this idle time
//! - `CHAT_RELAY_CONFIG`: path to a TOML config file
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)
//!
//! # Signals
//!
//! - SIGTERM/SIGINT: Graceful shutdown

mod cli;
mod server;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use relay_core::{load_config, ChatService, GeminiBackend, SessionStore};

use crate::cli::Cli;
use crate::server::{shutdown_signal, RelayServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Missing .env is fine
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relay_daemon=info".parse()?)
                .add_directive("relay_core=info".parse()?),
        )
        .with_target(true)
        .init();

    if let Ok(path) = &dotenv {
        info!(path = %path.display(), "Loaded environment file");
    }

    let cli = Cli::parse();
    let (config, source) = load_config(cli.config.as_deref(), &cli.overrides())?;
    info!(%source, "Configuration loaded");

    let backend = GeminiBackend::from_settings(&config.backend)?;
    if !backend.has_api_key() {
        warn!("GEMINI_API_KEY is not set, every start request will fail");
    }

    let service = ChatService::new(Arc::new(backend), SessionStore::new())
        .with_default_model(config.backend.default_model.clone());

    let bind_addr = config.server.bind_addr();
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;

    info!(
        model = %service.default_model(),
        base_url = %config.backend.base_url,
        "Starting chat relay"
    );

    RelayServer::new(service, config.sessions)
        .run(listener, shutdown_signal())
        .await?;

    info!("Chat relay stopped");
    Ok(())
}
