#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Once, OnceLock};

use synqra::model::{Model, ModelDescriptor};
use synqra::value::ValueKind;
use synqra::{Identifier, StorageBackend, StoreConfig, TypeRegistry};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Installs a fmt subscriber once per test binary. `RUST_LOG` overrides the
/// default `warn` filter.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub fn temp_dir() -> tempfile::TempDir {
    tempfile::TempDir::new().expect("create temp dir")
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Task {
    pub title: String,
    pub done: bool,
    pub priority: i64,
    pub owner: Identifier,
}

impl Model for Task {
    fn descriptor() -> &'static ModelDescriptor<Self> {
        static DESCRIPTOR: OnceLock<ModelDescriptor<Task>> = OnceLock::new();
        DESCRIPTOR.get_or_init(|| {
            ModelDescriptor::<Task>::new("synqra.tests.Task")
                .schema_id(21)
                .property("title", ValueKind::Text, |t| t.title.clone().into(), |t, v| {
                    t.title = v.coerce()?;
                    Ok(())
                })
                .property("done", ValueKind::Bool, |t| t.done.into(), |t, v| {
                    t.done = v.coerce()?;
                    Ok(())
                })
                .property("priority", ValueKind::Signed, |t| t.priority.into(), |t, v| {
                    t.priority = v.coerce()?;
                    Ok(())
                })
                .property("owner", ValueKind::Id, |t| t.owner.into(), |t, v| {
                    t.owner = v.coerce()?;
                    Ok(())
                })
        })
    }
}

pub fn task(title: &str, priority: i64) -> Task {
    Task {
        title: title.to_string(),
        priority,
        ..Task::default()
    }
}

pub fn registry() -> Arc<TypeRegistry> {
    let registry = TypeRegistry::new();
    registry.register::<Task>().expect("register Task");
    Arc::new(registry)
}

/// One configuration of each backend, rooted in `dir`.
pub fn backends(dir: &Path) -> Vec<StorageBackend> {
    vec![
        StorageBackend::ShardedFiles {
            root: dir.join("sharded"),
        },
        StorageBackend::JsonLines {
            path: dir.join("events.jsonl"),
        },
        StorageBackend::Sqlite {
            path: dir.join("store.db"),
            table: "events".to_string(),
        },
    ]
}

pub fn config(storage: StorageBackend, container_id: Identifier) -> StoreConfig {
    StoreConfig {
        storage,
        container_id,
        ..StoreConfig::default()
    }
}

/// An item store of the same kind as `events`, next to it in `dir`.
pub fn item_backend(dir: &Path, events: &StorageBackend) -> StorageBackend {
    match events {
        StorageBackend::ShardedFiles { .. } => StorageBackend::ShardedFiles {
            root: dir.join("items"),
        },
        StorageBackend::JsonLines { .. } => StorageBackend::JsonLines {
            path: dir.join("items.jsonl"),
        },
        StorageBackend::Sqlite { path, .. } => StorageBackend::Sqlite {
            path: path.clone(),
            table: "items".to_string(),
        },
    }
}
