//! # Synqra - Event-Sourced Object Runtime
//!
//! Synqra turns mutations of in-memory objects into durable events:
//!
//! - **Commands in, events out**: every mutation is a [`Command`], expanded
//!   deterministically into [`Event`]s by visitor dispatch
//! - **Append-only storage**: events are keyed by time-sortable v7
//!   identifiers and stored in file-per-key, JSON-Lines or SQLite backends
//! - **Replay**: state is rebuilt by re-applying the stored log in key order
//! - **Item store**: optionally, the current snapshot of every object is kept
//!   in a second append-only store
//! - **Compact binary codec**: varints, zigzag and schema ids for storage and
//!   the wire
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Application (Collection<T>, commands)           │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ submit_command
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        ObjectStore                              │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │  Expansion  │  │  Dry-run    │  │  Identity table +       │  │
//! │  │  (visitors) │  │  check      │  │  collections            │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘  │
//! └──────────────┬──────────────────────────────────┬───────────────┘
//!                │ append_batch / get_all           │ trigger
//!                ▼                                  ▼
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │   AppendStorage              │   │  ReplicationTrigger          │
//! │   sharded │ jsonl │ sqlite   │   │  (broadcast → transport)     │
//! └──────────────────────────────┘   └──────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Append-only**: a stored key is never overwritten
//! 2. **Ordered**: enumeration order is key order, which is generation order
//! 3. **Persist, then apply**: memory never holds an event the log does not
//! 4. **One id per object**: an attached object keeps its id for its lifetime
//!
//! ## Module Organization
//!
//! - [`error`]: the crate-wide error enum
//! - [`id`], [`value`], [`model`]: identifiers, property values, model descriptors
//! - [`codec`]: binary encoding
//! - [`metadata`]: type ids and collection ids
//! - [`types`]: commands, events and visitors
//! - [`identity`]: object identity tracking
//! - [`storage`]: append storage and its backends
//! - [`projection`]: the object store
//! - [`replication`], [`transport`]: hooks and wire envelope for replication
//! - [`config`]: deployment settings

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for Synqra operations.
pub mod error;

/// Time-sortable and namespaced identifiers.
pub mod id;

/// Dynamically typed property values and property bags.
pub mod value;

/// The capability trait implemented by stored model types.
///
/// A [`Model`] exposes its properties through a static
/// [`ModelDescriptor`], which the codec, the projection and replay use to
/// read and write properties by name without reflection.
pub mod model;

/// Binary codec: varints, NUL-terminated strings and three-level object
/// encoding.
pub mod codec;

/// Type ids, collection ids and the type registry.
pub mod metadata;

/// Commands, events and their visitor traits.
pub mod types;

/// Identity of attached objects.
///
/// Tracks which id each live object carries, without keeping the object
/// alive, under six explicit attach modes.
pub mod identity;

/// Append-only storage, its three backends and item store records.
pub mod storage;

/// The object store: command expansion, persistence, application and replay.
pub mod projection;

/// Replication trigger hook and broadcast fan-out.
pub mod replication;

/// Handshake and framing for shipping events between nodes.
pub mod transport;

/// Store configuration.
pub mod config;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{StorageBackend, StoreConfig};
pub use error::{Error, Result};
pub use id::Identifier;
pub use identity::AttachMode;
pub use metadata::{TypeMetadataProvider, TypeRegistry};
pub use model::{Model, ModelDescriptor, ObjectRef, Shared};
pub use projection::{Collection, ObjectStore};
pub use replication::{BroadcastTrigger, ReplicationTrigger};
pub use storage::{
    AppendStorage, CompositeKey, EventStorage, ItemSnapshot, ItemStorage, JsonlStorage,
    ShardedFileStorage, SqliteStorage,
};
pub use types::{Command, Event};
pub use value::{ObjectValue, PropertyBag, Value, ValueKind};
