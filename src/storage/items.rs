//! # Item Store Records
//!
//! The item store keeps the current state of every object next to the event
//! log, so a host can read objects without replaying events. It is an ordinary
//! [`AppendStorage`] holding [`ItemSnapshot`]s under [`CompositeKey`]s.
//!
//! Creating an object appends its first snapshot; every property change
//! appends a newer one. Nothing is overwritten: the snapshot with the highest
//! `version` of an object is its current state.
//!
//! ```text
//! (collection, object, version 1)  { title: "a", done: false }
//! (collection, object, version 2)  { title: "a", done: true }    <- current
//! ```

use std::collections::BTreeMap;

use futures::TryStreamExt;
use serde::{Deserialize, Serialize};

use super::{AppendStorage, CompositeKey, StorageItem};
use crate::codec::{Decode, Encode, Reader, Writer};
use crate::error::Result;
use crate::id::Identifier;
use crate::value::PropertyBag;

/// Item store as used by the projection.
pub type ItemStorage = dyn AppendStorage<ItemSnapshot, CompositeKey>;

/// One persisted version of an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSnapshot {
    /// Collection the object belongs to.
    pub collection_id: Identifier,
    /// The object's id.
    pub object_id: Identifier,
    /// Snapshot version; later snapshots of the same object sort higher.
    pub version: Identifier,
    /// Registered type of the object.
    pub type_id: Identifier,
    /// Every property, in declaration order.
    pub data: PropertyBag,
}

impl ItemSnapshot {
    /// A new snapshot version of `object_id`.
    pub fn new(
        collection_id: Identifier,
        object_id: Identifier,
        type_id: Identifier,
        data: PropertyBag,
    ) -> Self {
        Self {
            collection_id,
            object_id,
            version: Identifier::new_v7(),
            type_id,
            data,
        }
    }

    /// Storage key of this snapshot.
    pub fn key(&self) -> CompositeKey {
        CompositeKey::new(self.collection_id, self.object_id, self.version)
    }
}

impl StorageItem for ItemSnapshot {
    const TYPE_NAME: &'static str = "synqra.ItemSnapshot";
}

impl Encode for ItemSnapshot {
    fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        w.write_id(&self.collection_id)?;
        w.write_id(&self.object_id)?;
        w.write_id(&self.version)?;
        w.write_id(&self.type_id)?;
        self.data.encode(w)
    }
}

impl Decode for ItemSnapshot {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            collection_id: r.read_id()?,
            object_id: r.read_id()?,
            version: r.read_id()?,
            type_id: r.read_id()?,
            data: PropertyBag::decode(r)?,
        })
    }
}

/// Current snapshot of every object in `collection_id`, in object id order
/// (creation order for v7 ids).
///
/// Works on every backend: JSON-Lines enumerates in file order, so the
/// latest version is picked by comparison rather than by position.
pub async fn latest_items(
    storage: &ItemStorage,
    collection_id: Identifier,
) -> Result<Vec<ItemSnapshot>> {
    let mut latest: BTreeMap<Identifier, ItemSnapshot> = BTreeMap::new();
    let mut items = storage.get_all(Some(CompositeKey::first(collection_id, Identifier::NIL)));
    while let Some(item) = items.try_next().await? {
        if item.collection_id != collection_id {
            continue;
        }
        match latest.get(&item.object_id) {
            Some(current) if current.version >= item.version => {}
            _ => {
                latest.insert(item.object_id, item);
            }
        }
    }
    Ok(latest.into_values().collect())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{from_slice, Serializer};
    use crate::storage::{JsonlStorage, SqliteStorage};
    use crate::value::{ObjectValue, Value};

    fn versions(collection_id: Identifier, object_id: Identifier) -> Vec<ItemSnapshot> {
        (0..3i64)
            .map(|n| {
                ItemSnapshot::new(
                    collection_id,
                    object_id,
                    Identifier::new_v7(),
                    PropertyBag::new().with("n", n),
                )
            })
            .collect()
    }

    async fn assert_latest_wins(storage: &ItemStorage) {
        let inbox = Identifier::new_v7();
        let archive = Identifier::new_v7();
        let a = versions(inbox, Identifier::new_v7());
        let b = versions(inbox, Identifier::new_v7());
        let elsewhere = versions(archive, Identifier::new_v7());

        // Interleave so file order differs from key order.
        for i in 0..3 {
            storage.append(&b[i]).await.unwrap();
            storage.append(&a[i]).await.unwrap();
            storage.append(&elsewhere[i]).await.unwrap();
        }

        let latest = latest_items(storage, inbox).await.unwrap();
        assert_eq!(latest, vec![a[2].clone(), b[2].clone()]);
        assert_eq!(latest_items(storage, archive).await.unwrap(), vec![elsewhere[2].clone()]);
        assert!(latest_items(storage, Identifier::new_v7()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_latest_wins_on_sqlite() {
        let storage = SqliteStorage::open_in_memory("items", ItemSnapshot::key).unwrap();
        assert_latest_wins(&storage).await;
    }

    #[tokio::test]
    async fn test_latest_wins_on_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonlStorage::open(dir.path().join("items.jsonl"), ItemSnapshot::key)
            .await
            .unwrap();
        assert_latest_wins(&storage).await;
    }

    #[test]
    fn test_binary_form_keeps_nested_values() {
        let nested = ObjectValue::new("demo.Address", PropertyBag::new().with("city", "Oslo"));
        let item = ItemSnapshot::new(
            Identifier::new_v7(),
            Identifier::new_v7(),
            Identifier::new_v7(),
            PropertyBag::new()
                .with("title", "")
                .with("home", Value::from(nested)),
        );
        let bytes = Serializer::new().to_vec(&item).unwrap();
        assert_eq!(from_slice::<ItemSnapshot>(&bytes).unwrap(), item);
    }
}
