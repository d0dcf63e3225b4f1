//! # Append Storage
//!
//! A durable, ordered, insert-only `key -> item` store. Three interchangeable
//! backends implement [`AppendStorage`]:
//!
//! | Backend | Layout | `get_all(from)` |
//! |---------|--------|-----------------|
//! | [`ShardedFileStorage`] | one file per key, `root/<hex[..6]>/<hex[6..]>` | keys `>= from` |
//! | [`JsonlStorage`] | one JSON object per line after a header line | keys `> from` (cursor continuation) |
//! | [`SqliteStorage`] | `(id BLOB PRIMARY KEY, data BLOB) WITHOUT ROWID` | keys `>= from` |
//!
//! The event log is an `AppendStorage<Event, Identifier>`. The item store, an
//! optional per-object snapshot log, is an
//! `AppendStorage<ItemSnapshot, CompositeKey>`; see [`items`].
//!
//! ## Invariants
//!
//! - A key, once written, is never overwritten. Appending an existing key
//!   fails with [`Error::DuplicateKey`](crate::Error::DuplicateKey) on the
//!   sharded and SQLite backends.
//! - Enumeration order is key order. Keys are compared as big-endian bytes,
//!   which is chronological for v7 identifiers.
//! - One enumeration never yields the same item twice.
//!
//! ## Errors and Cancellation
//!
//! Backend errors propagate unchanged; nothing here retries. Enumeration is a
//! lazy [`BoxStream`]: dropping it cancels the read between files, lines or
//! pages. A write that has started is never cancelled half way.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::{Decode, Encode};
use crate::error::{Error, Result};
use crate::id::Identifier;
use crate::types::Event;

pub mod items;
pub mod jsonl;
pub mod sharded;
pub mod sqlite;

pub use items::{latest_items, ItemSnapshot, ItemStorage};
pub use jsonl::{JsonlCursor, JsonlStorage};
pub use sharded::ShardedFileStorage;
pub use sqlite::SqliteStorage;

// =============================================================================
// Keys
// =============================================================================

/// A storage key with a fixed-width big-endian byte form.
///
/// Byte order must equal `Ord` order so every backend can sort by bytes.
pub trait StorageKey: Copy + Ord + Send + Sync + fmt::Debug + 'static {
    /// Width of the byte form.
    const LEN: usize;

    /// Big-endian byte form.
    fn to_key_bytes(&self) -> Vec<u8>;

    /// Parses the byte form.
    fn from_key_bytes(bytes: &[u8]) -> Result<Self>;

    /// Lower-case hex of the byte form.
    fn to_hex(&self) -> String {
        hex::encode(self.to_key_bytes())
    }

    /// Parses the hex form.
    fn from_hex(s: &str) -> Result<Self> {
        let bytes =
            hex::decode(s).map_err(|e| Error::Format(format!("invalid key hex '{s}': {e}")))?;
        Self::from_key_bytes(&bytes)
    }
}

impl StorageKey for Identifier {
    const LEN: usize = 16;

    fn to_key_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn from_key_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 16] = bytes
            .try_into()
            .map_err(|_| Error::Format(format!("identifier key must be 16 bytes, got {}", bytes.len())))?;
        Ok(Identifier::from_bytes(array))
    }
}

/// Key of an object snapshot: the collection, then the object, then the
/// snapshot version.
///
/// Keys are never overwritten, so every re-persisted snapshot gets a fresh
/// v7 `version`. All versions of one object sort together, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeKey {
    /// Collection the object belongs to.
    pub collection_id: Identifier,
    /// The object's id.
    pub object_id: Identifier,
    /// Snapshot version.
    pub version: Identifier,
}

impl CompositeKey {
    /// Builds a composite key.
    pub fn new(collection_id: Identifier, object_id: Identifier, version: Identifier) -> Self {
        Self {
            collection_id,
            object_id,
            version,
        }
    }

    /// Lowest key of `object_id` in `collection_id`.
    pub fn first(collection_id: Identifier, object_id: Identifier) -> Self {
        Self::new(collection_id, object_id, Identifier::NIL)
    }

    /// True if both keys address the same object.
    pub fn same_object(&self, other: &CompositeKey) -> bool {
        self.collection_id == other.collection_id && self.object_id == other.object_id
    }
}

impl StorageKey for CompositeKey {
    const LEN: usize = 48;

    fn to_key_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::LEN);
        bytes.extend_from_slice(self.collection_id.as_bytes());
        bytes.extend_from_slice(self.object_id.as_bytes());
        bytes.extend_from_slice(self.version.as_bytes());
        bytes
    }

    fn from_key_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::LEN {
            return Err(Error::Format(format!(
                "composite key must be {} bytes, got {}",
                Self::LEN,
                bytes.len()
            )));
        }
        Ok(Self {
            collection_id: Identifier::from_key_bytes(&bytes[..16])?,
            object_id: Identifier::from_key_bytes(&bytes[16..32])?,
            version: Identifier::from_key_bytes(&bytes[32..])?,
        })
    }
}

// =============================================================================
// Items
// =============================================================================

/// Something an [`AppendStorage`] can hold: binary-encodable for the sharded
/// and SQLite backends, JSON-serializable for JSON-Lines.
pub trait StorageItem:
    Encode + Decode + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Fully-qualified type name recorded in storage headers.
    const TYPE_NAME: &'static str;
}

impl StorageItem for Event {
    const TYPE_NAME: &'static str = "synqra.Event";
}

/// Caller-supplied key extraction.
pub type KeyFn<T, K> = fn(&T) -> K;

// =============================================================================
// Storage Trait
// =============================================================================

/// Durable ordered append-only storage.
#[async_trait]
pub trait AppendStorage<T: StorageItem, K: StorageKey = Identifier>: Send + Sync {
    /// Appends one item.
    async fn append(&self, item: &T) -> Result<()>;

    /// Appends items in order. All-or-nothing where the backend supports it;
    /// every backend rejects the whole batch on a duplicate key it can detect.
    async fn append_batch(&self, items: &[T]) -> Result<()>;

    /// Lazily enumerates items in key order, starting at `from`.
    fn get_all(&self, from: Option<K>) -> BoxStream<'_, Result<T>>;

    /// Pushes buffered writes to durable storage.
    async fn flush(&self) -> Result<()>;

    /// Releases the storage. Later calls fail with
    /// [`Error::Closed`](crate::Error::Closed).
    async fn close(&self) -> Result<()>;
}

/// Event log storage as used by the projection.
pub type EventStorage = dyn AppendStorage<Event, Identifier>;

/// Rejects duplicate keys inside one batch before anything is written.
pub(crate) fn check_batch_keys<K: StorageKey>(keys: &[K]) -> Result<()> {
    let mut sorted: Vec<K> = keys.to_vec();
    sorted.sort_unstable();
    match sorted.windows(2).find(|pair| pair[0] == pair[1]) {
        Some(pair) => Err(Error::DuplicateKey {
            key: pair[0].to_hex(),
        }),
        None => Ok(()),
    }
}

/// Maps a failed blocking task to an I/O error.
pub(crate) fn join_error(err: tokio::task::JoinError) -> Error {
    Error::Io(std::io::Error::other(err))
}

// =============================================================================
// Tests
// =============================================================================
