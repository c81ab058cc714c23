//! # Parley Server
//!
//! Real-time direct messaging over WebSocket, with REST equivalents.
//!
//! ## Usage
//!
//! ```bash
//! # In-memory store, secret from the environment
//! PARLEY_JWT_SECRET=changeme parley
//!
//! # Postgres store
//! PARLEY_JWT_SECRET=changeme \
//! PARLEY__STORAGE__BACKEND=postgres \
//! PARLEY_DATABASE_URL=postgres://localhost/parley parley
//! ```

mod config;
mod gateway;
mod metrics;
mod rest;

use anyhow::{Context, Result};
use crate::config::{Config, StorageBackend};
use parley_core::{JwtValidator, MemoryStore, MessageStore};
use parley_storage::PgMessageStore;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,parley_core=debug,parley_storage=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;

    tracing::info!("Starting Parley server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    let store = open_store(&config).await?;
    let secret = config
        .jwt_secret()
        .context("No JWT secret configured")?
        .to_string();
    let validator = Arc::new(JwtValidator::new(&secret));

    let state = Arc::new(gateway::AppState::new(config, store, validator));
    gateway::run_server(state).await?;

    Ok(())
}

async fn open_store(config: &Config) -> Result<Arc<dyn MessageStore>> {
    match config.storage.backend {
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory message store; history is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackend::Postgres => {
            let url = config
                .database_url()
                .context("Postgres storage selected but no database URL")?;
            let pool = parley_storage::connect(url, config.storage.max_connections)
                .await
                .context("Failed to open the message database")?;
            Ok(Arc::new(PgMessageStore::new(pool)))
        }
    }
}
