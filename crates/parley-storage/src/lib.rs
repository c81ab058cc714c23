//! Postgres persistence for Parley.

use std::sync::Arc;

use anyhow::Result;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;

pub mod messages;

pub use messages::PgMessageStore;
pub use sqlx::PgPool;

/// Schema migrations shipped with the crate.
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// Shared handle to a Postgres pool.
#[derive(Clone, Debug)]
pub struct StoragePool {
    pool: Arc<PgPool>,
}

impl StoragePool {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Borrow the underlying `PgPool`.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl std::ops::Deref for StoragePool {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        self.pool()
    }
}

/// Open a pool and bring the schema up to date.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<StoragePool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    MIGRATOR.run(&pool).await?;
    tracing::info!(max_connections, "Connected to Postgres");

    Ok(StoragePool::new(pool))
}
