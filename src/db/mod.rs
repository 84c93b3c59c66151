mod kv;
mod memory;

pub use kv::KvRepo;
pub use memory::MemoryStore;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};

use crate::error::StoreError;

/// Logical partition of the key-path store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Partition {
    /// Intended state: service definitions
    Configuration,
    /// Observed state: activation records, VLAN allocations
    Operational,
}

impl Partition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::Configuration => "configuration",
            Partition::Operational => "operational",
        }
    }
}

/// Paths used by the activation core
pub mod paths {
    pub const SERVICES: &str = "services/";
    pub const ACTIVATION: &str = "activation/";
    pub const VLAN_POOLS: &str = "vlan-pools/";

    pub fn service(service_id: &str) -> String {
        format!("{}{}", SERVICES, service_id)
    }

    pub fn activation(service_id: &str) -> String {
        format!("{}{}", ACTIVATION, service_id)
    }

    pub fn vlan_pool(pool: &str) -> String {
        format!("{}{}/", VLAN_POOLS, pool)
    }

    pub fn vlan_allocation(pool: &str, service_name: &str) -> String {
        format!("{}{}/{}", VLAN_POOLS, pool, service_name)
    }
}

/// DataStore is a key-path value store split into a configuration and an
/// operational partition. Writes complete before the future resolves.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn read(&self, partition: Partition, path: &str) -> Result<Option<Value>, StoreError>;

    async fn write(&self, partition: Partition, path: &str, value: Value) -> Result<(), StoreError>;

    /// Deleting a missing path is not an error
    async fn delete(&self, partition: Partition, path: &str) -> Result<(), StoreError>;

    /// Entries whose path starts with `prefix`, ordered by path
    async fn list(&self, partition: Partition, prefix: &str) -> Result<Vec<(String, Value)>, StoreError>;
}

/// Read and decode a typed value
pub async fn read_json<T: DeserializeOwned>(
    store: &dyn DataStore,
    partition: Partition,
    path: &str,
) -> Result<Option<T>, StoreError> {
    match store.read(partition, path).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|source| StoreError::Decode {
                path: path.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

/// Encode and write a typed value
pub async fn write_json<T: Serialize>(
    store: &dyn DataStore,
    partition: Partition,
    path: &str,
    value: &T,
) -> Result<(), StoreError> {
    let value = serde_json::to_value(value).map_err(|e| StoreError::persistence("encode", path, e))?;
    store.write(partition, path, value).await
}

/// Store is the SQLite-backed [`DataStore`]
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// Create a new database store with the default pool size
    pub async fn new(db_path: &str) -> Result<Self> {
        Self::with_pool_size(db_path, 5).await
    }

    /// Create a new database store with a specific pool size
    pub async fn with_pool_size(db_path: &str, max_connections: u32) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&db_url)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database, one connection so every query sees the same data
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Run database migrations
    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

fn store_path(partition: Partition, path: &str) -> String {
    format!("{}/{}", partition.as_str(), path)
}

#[async_trait]
impl DataStore for Store {
    async fn read(&self, partition: Partition, path: &str) -> Result<Option<Value>, StoreError> {
        let raw = KvRepo::get(&self.pool, partition, path)
            .await
            .map_err(|e| StoreError::persistence("read", store_path(partition, path), e))?;

        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| StoreError::Decode {
                    path: store_path(partition, path),
                    source,
                }),
            None => Ok(None),
        }
    }

    async fn write(&self, partition: Partition, path: &str, value: Value) -> Result<(), StoreError> {
        KvRepo::upsert(&self.pool, partition, path, &value.to_string())
            .await
            .map_err(|e| StoreError::persistence("write", store_path(partition, path), e))
    }

    async fn delete(&self, partition: Partition, path: &str) -> Result<(), StoreError> {
        KvRepo::delete(&self.pool, partition, path)
            .await
            .map(|_| ())
            .map_err(|e| StoreError::persistence("delete", store_path(partition, path), e))
    }

    async fn list(&self, partition: Partition, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let rows = KvRepo::list_prefix(&self.pool, partition, prefix)
            .await
            .map_err(|e| StoreError::persistence("list", store_path(partition, prefix), e))?;

        rows.into_iter()
            .map(|(path, raw)| {
                serde_json::from_str(&raw)
                    .map(|value| (path.clone(), value))
                    .map_err(|source| StoreError::Decode {
                        path: store_path(partition, &path),
                        source,
                    })
            })
            .collect()
    }
}
