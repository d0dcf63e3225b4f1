//! # Store Configuration
//!
//! Deployment settings for an [`ObjectStore`]: which backend holds the event
//! log, where object snapshots go, which container the store writes for, and
//! a few tuning knobs.
//!
//! ```json
//! {
//!   "storage": { "kind": "sqlite", "path": "data/store.db", "table": "events" },
//!   "itemStore": { "kind": "sqlite", "path": "data/store.db", "table": "items" },
//!   "containerId": "0190a3f2-0c1d-7e3a-8b4f-5a6b7c8d9e0f",
//!   "sweepInterval": 1024,
//!   "readPageSize": 256
//! }
//! ```
//!
//! Everything except `containerId` has a default. Without `itemStore` no
//! snapshots are kept.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::id::Identifier;
use crate::identity::DEFAULT_SWEEP_INTERVAL;
use crate::metadata::TypeMetadataProvider;
use crate::projection::ObjectStore;
use crate::storage::sqlite::DEFAULT_PAGE_SIZE;
use crate::storage::{
    AppendStorage, EventStorage, ItemSnapshot, ItemStorage, JsonlStorage, KeyFn, ShardedFileStorage,
    SqliteStorage, StorageItem, StorageKey,
};
use crate::types::Event;

/// Default root of the sharded-file backend.
pub const DEFAULT_STORAGE_ROOT: &str = "data/events";

// =============================================================================
// Storage Backend
// =============================================================================

/// Which [`AppendStorage`] holds the log or the item store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StorageBackend {
    /// One file per event under `root`.
    ShardedFiles { root: PathBuf },
    /// One JSON line per event in `path`.
    JsonLines { path: PathBuf },
    /// One row per event in `table` of the database at `path`.
    Sqlite { path: PathBuf, table: String },
}

impl Default for StorageBackend {
    fn default() -> Self {
        StorageBackend::ShardedFiles {
            root: PathBuf::from(DEFAULT_STORAGE_ROOT),
        }
    }
}

impl StorageBackend {
    /// Opens the event log described by this backend.
    pub async fn open_events(&self, read_page_size: usize) -> Result<Arc<EventStorage>> {
        self.open(Event::key, read_page_size).await
    }

    /// Opens an item store described by this backend.
    pub async fn open_items(&self, read_page_size: usize) -> Result<Arc<ItemStorage>> {
        self.open(ItemSnapshot::key, read_page_size).await
    }

    async fn open<T: StorageItem, K: StorageKey>(
        &self,
        key_of: KeyFn<T, K>,
        read_page_size: usize,
    ) -> Result<Arc<dyn AppendStorage<T, K>>> {
        let storage: Arc<dyn AppendStorage<T, K>> = match self {
            StorageBackend::ShardedFiles { root } => {
                Arc::new(ShardedFileStorage::open(root.clone(), key_of).await?)
            }
            StorageBackend::JsonLines { path } => {
                Arc::new(JsonlStorage::open(path.clone(), key_of).await?)
            }
            StorageBackend::Sqlite { path, table } => Arc::new(
                SqliteStorage::open(path.clone(), table, key_of)
                    .await?
                    .with_page_size(read_page_size),
            ),
        };
        Ok(storage)
    }
}

// =============================================================================
// Store Config
// =============================================================================

/// Settings for one object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// Event log backend.
    #[serde(default)]
    pub storage: StorageBackend,

    /// Optional snapshot store, one record per object version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_store: Option<StorageBackend>,

    /// Container stamped on commands the store builds.
    pub container_id: Identifier,

    /// Identity-table maintenance every N operations (0 disables).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u32,

    /// Rows per page when enumerating SQLite storage.
    #[serde(default = "default_read_page_size")]
    pub read_page_size: usize,
}

fn default_sweep_interval() -> u32 {
    DEFAULT_SWEEP_INTERVAL
}

fn default_read_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

impl Default for StoreConfig {
    /// Defaults with a freshly generated container id. Persistent
    /// deployments should configure `container_id` explicitly.
    fn default() -> Self {
        Self {
            storage: StorageBackend::default(),
            item_store: None,
            container_id: Identifier::new_v7(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            read_page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl StoreConfig {
    /// Parses a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Opens the storage and builds an [`ObjectStore`] over it. Does not
    /// replay; call [`ObjectStore::replay`] afterwards.
    pub async fn open(&self, metadata: Arc<dyn TypeMetadataProvider>) -> Result<ObjectStore> {
        let storage = self.storage.open_events(self.read_page_size).await?;
        let mut builder = ObjectStore::builder(storage, metadata)
            .container_id(self.container_id)
            .sweep_interval(self.sweep_interval);
        if let Some(items) = &self.item_store {
            builder = builder.item_store(items.open_items(self.read_page_size).await?);
        }
        builder.build()
    }
}

// =============================================================================
// Tests
// =============================================================================
