//! Persistence of per-phone provisioning status
//!
//! This module handles:
//! - The `EndpointStore` contract used by ingestion and the dispatcher
//! - A SQLite backend with one connection per unit of work
//! - A Postgres backend drawing one pooled connection per unit of work
//! - An in-memory backend for dry runs
//! - Selecting and verifying the backend once at startup

mod memory;
mod postgres;
mod sqlite;
mod traits;

pub use memory::MemoryStore;
pub use postgres::{PostgresSettings, PostgresStore};
pub use sqlite::SqliteStore;
pub use traits::{EndpointStore, StoreError};

use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Which backend holds the phone records
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    Sqlite {
        #[serde(default = "default_db_path")]
        path: PathBuf,
    },
    Postgres(PostgresSettings),
    Memory,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("phonedb.sqlite")
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Sqlite {
            path: default_db_path(),
        }
    }
}

/// Construct the configured backend and make sure it is usable
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn EndpointStore>, StoreError> {
    let store: Arc<dyn EndpointStore> = match config {
        StoreConfig::Sqlite { path } => Arc::new(SqliteStore::open(path.clone()).await?),
        StoreConfig::Postgres(settings) => Arc::new(PostgresStore::open(settings).await?),
        StoreConfig::Memory => Arc::new(MemoryStore::new()),
    };
    info!("Store ready: {}", store.name());
    Ok(store)
}
