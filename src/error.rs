//! # Error Handling for Synqra
//!
//! A single error enum ([`Error`]) covers every failure mode in the crate, the
//! same way the rest of the event store reports failures: one type to match
//! on, `?` everywhere, and `#[from]` conversions for the libraries underneath
//! (SQLite, file I/O, JSON).
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Validation | Missing target id, type mismatch | Fix the caller, never retry |
//! | Codec | Buffer too small, truncated varint | Retry encode with a bigger buffer; never retry decode |
//! | Storage | Disk full, duplicate key, corrupt header | Propagated as-is; host decides on retry |
//! | Identity | Re-attaching with a different id | Programming error |
//!
//! Nothing in the crate swallows or retries a storage error. A failed append
//! surfaces to the caller of `submit_command` unchanged.

use thiserror::Error;

use crate::id::Identifier;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in Synqra operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Validation Errors (malformed Command/Event, never retried)
    // =========================================================================

    /// A command or event failed an addressing or typing check.
    ///
    /// Raised synchronously by command expansion and by the before-visit hook
    /// of event application, before anything is persisted.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A caller passed an argument the operation cannot accept
    /// (for example a nil namespace for a namespaced identifier).
    #[error("invalid argument: {0}")]
    Argument(String),

    /// A property change addressed an object that is not attached to the store.
    #[error("cannot change property of unknown object {target_id} in collection {collection_id}")]
    UnknownObject {
        /// The object the event targeted.
        target_id: Identifier,
        /// The collection that was searched.
        collection_id: Identifier,
    },

    /// A property name is not part of the model's descriptor.
    #[error("type '{type_name}' has no property '{property}'")]
    UnknownProperty {
        /// The model's type name.
        type_name: String,
        /// The property that was requested.
        property: String,
    },

    /// The operation exists in the model but has no behavior yet.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// The operation is not defined for this input (for example reading the
    /// timestamp of an identifier version that does not embed one).
    #[error("not supported: {0}")]
    NotSupported(String),

    // =========================================================================
    // Codec Errors
    // =========================================================================

    /// The output buffer ran out while encoding.
    ///
    /// # Recovery
    ///
    /// Retry with a larger buffer. [`crate::codec::Serializer::to_vec`] does
    /// this automatically by doubling its pooled buffer.
    #[error("buffer too small: needed at least {needed_at_least} bytes")]
    BufferTooSmall {
        /// Lower bound on the buffer size required to make progress.
        needed_at_least: usize,
    },

    /// The bytes name a type the decoder does not know, or a value cannot be
    /// converted to the requested Rust type.
    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    /// The bytes are malformed: truncated varint, missing NUL terminator,
    /// invalid UTF-8, unknown tag. Permanently malformed; do not retry.
    #[error("format error: {0}")]
    Format(String),

    // =========================================================================
    // Storage Errors (propagated uncaught)
    // =========================================================================

    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// File system operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON-Lines record could not be (de)serialized.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An append hit a key that is already stored. Append storage never
    /// overwrites.
    #[error("duplicate key: {key}")]
    DuplicateKey {
        /// Hex rendering of the key.
        key: String,
    },

    /// On-disk header or schema metadata does not match what this build writes.
    #[error("schema error: {0}")]
    Schema(String),

    /// The storage was closed and cannot accept further operations.
    #[error("storage is closed")]
    Closed,

    /// A replication subscriber fell behind and the channel dropped batches.
    ///
    /// # Recovery
    ///
    /// Re-read the missed range from storage, then resubscribe.
    #[error("replication subscriber lagged, {missed} batches dropped")]
    Lagged {
        /// Number of batches the subscriber will never see.
        missed: u64,
    },

    // =========================================================================
    // Identity Errors (programming errors)
    // =========================================================================

    /// The object is already attached under a different id or collection.
    #[error("object already attached as {existing} in collection {collection_id}")]
    AlreadyAttached {
        /// The id the object already carries.
        existing: Identifier,
        /// The collection it is attached to.
        collection_id: Identifier,
    },

    /// The object has no identity but the call required one.
    #[error("object is not attached to the store")]
    NotAttached,

    /// The id is already bound to a different live object.
    #[error("identifier {id} is already bound to another live object")]
    IdInUse {
        /// The contested identifier.
        id: Identifier,
    },
}

impl Error {
    /// Builds a validation error from anything printable.
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Maps a rusqlite failure to [`Error::DuplicateKey`] when it is a
    /// uniqueness violation, keeping every other failure as [`Error::Sqlite`].
    pub(crate) fn from_sqlite_insert(err: rusqlite::Error, key_hex: impl FnOnce() -> String) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::DuplicateKey { key: key_hex() }
            }
            _ => Error::Sqlite(err),
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
