//! # Type Metadata
//!
//! Maps model types to stable identifiers and back.
//!
//! - **TypeId**: `namespaced(TYPE_NAMESPACE, type_name)`. Deterministic, so the
//!   same type gets the same id in every process and after every restart.
//! - **CollectionId**: `namespaced(TypeId, "col_" + collection_name)`. The
//!   default collection of a type has the empty name.
//!
//! The projection only needs the [`TypeMetadataProvider`] trait. The
//! [`TypeRegistry`] is the in-process implementation: models are registered
//! once at startup, which also records a factory used to materialize objects
//! during replay.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::id::Identifier;
use crate::model::{share, Model, ObjectRef};

// =============================================================================
// Constants
// =============================================================================

/// Namespace all type identifiers are derived from.
pub const TYPE_NAMESPACE: Identifier = Identifier::from_u128(0x5f1a_9c3e_4b7d_8e21_a3c4_d5e6_f708_192a);

/// Prefix applied to collection names before hashing.
const COLLECTION_PREFIX: &str = "col_";

/// Derives the TypeId for a fully-qualified type name.
pub fn type_id_for(type_name: &str) -> Result<Identifier> {
    Identifier::namespaced_str(TYPE_NAMESPACE, type_name)
}

/// Derives the CollectionId of `collection_name` within `type_id`.
pub fn collection_id_for(type_id: Identifier, collection_name: &str) -> Result<Identifier> {
    let name = format!("{COLLECTION_PREFIX}{collection_name}");
    Identifier::namespaced_str(type_id, &name)
}

// =============================================================================
// Provider Trait
// =============================================================================

/// Everything the store knows about one registered type.
#[derive(Clone, Copy)]
pub struct TypeInfo {
    /// Stable type identifier.
    pub type_id: Identifier,
    /// Fully-qualified type name.
    pub type_name: &'static str,
    /// The Rust type implementing [`Model`].
    pub rust_type: TypeId,
    /// Creates a default instance.
    pub factory: fn() -> ObjectRef,
}

impl std::fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeInfo")
            .field("type_id", &self.type_id)
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// `Type <-> Identifier` resolution consumed by the projection.
pub trait TypeMetadataProvider: Send + Sync {
    /// Looks up a type by its id.
    fn resolve(&self, type_id: Identifier) -> Option<TypeInfo>;

    /// Looks up the id registered for a Rust type.
    fn type_id_of(&self, rust_type: TypeId) -> Option<Identifier>;

    /// Derives a collection id. Pure; the default should rarely be replaced.
    fn collection_id(&self, type_id: Identifier, collection_name: &str) -> Result<Identifier> {
        collection_id_for(type_id, collection_name)
    }
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Default)]
struct RegistryInner {
    by_id: HashMap<Identifier, TypeInfo>,
    by_rust: HashMap<TypeId, Identifier>,
}

/// In-process [`TypeMetadataProvider`].
///
/// # Example
///
/// ```rust,ignore
/// let registry = TypeRegistry::new();
/// let task_type = registry.register::<Task>()?;
/// assert_eq!(registry.register::<Task>()?, task_type);
/// ```
#[derive(Default)]
pub struct TypeRegistry {
    inner: RwLock<RegistryInner>,
}

impl TypeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` and returns its TypeId. Registering twice is a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::Argument`] if a different Rust type already claimed the same
    /// type name.
    pub fn register<T: Model>(&self) -> Result<Identifier> {
        let rust_type = TypeId::of::<T>();
        if let Some(id) = self.inner.read().by_rust.get(&rust_type) {
            return Ok(*id);
        }

        let type_name = T::descriptor().type_name();
        let type_id = type_id_for(type_name)?;
        let mut inner = self.inner.write();
        if let Some(existing) = inner.by_id.get(&type_id) {
            if existing.rust_type != rust_type {
                return Err(Error::Argument(format!(
                    "type name '{type_name}' is already registered for another Rust type"
                )));
            }
            return Ok(type_id);
        }

        inner.by_id.insert(
            type_id,
            TypeInfo {
                type_id,
                type_name,
                rust_type,
                factory: new_object::<T>,
            },
        );
        inner.by_rust.insert(rust_type, type_id);
        debug!(%type_id, type_name, "registered model type");
        Ok(type_id)
    }

    /// The TypeId of a registered `T`.
    pub fn type_id<T: Model>(&self) -> Option<Identifier> {
        self.type_id_of(TypeId::of::<T>())
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TypeMetadataProvider for TypeRegistry {
    fn resolve(&self, type_id: Identifier) -> Option<TypeInfo> {
        self.inner.read().by_id.get(&type_id).copied()
    }

    fn type_id_of(&self, rust_type: TypeId) -> Option<Identifier> {
        self.inner.read().by_rust.get(&rust_type).copied()
    }
}

impl<P: TypeMetadataProvider + ?Sized> TypeMetadataProvider for Arc<P> {
    fn resolve(&self, type_id: Identifier) -> Option<TypeInfo> {
        (**self).resolve(type_id)
    }

    fn type_id_of(&self, rust_type: TypeId) -> Option<Identifier> {
        (**self).type_id_of(rust_type)
    }

    fn collection_id(&self, type_id: Identifier, collection_name: &str) -> Result<Identifier> {
        (**self).collection_id(type_id, collection_name)
    }
}

fn new_object<T: Model>() -> ObjectRef {
    share(T::default())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::Note;

    #[test]
    fn test_namespace_is_valid() {
        assert!(TYPE_NAMESPACE.is_rfc_variant());
        assert!(!TYPE_NAMESPACE.is_nil());
    }

    #[test]
    fn test_type_id_is_stable() {
        let registry = TypeRegistry::new();
        let id = registry.register::<Note>().unwrap();
        assert_eq!(id, type_id_for("synqra.tests.Note").unwrap());
        assert_eq!(registry.register::<Note>().unwrap(), id);
        assert_eq!(registry.len(), 1);

        // A fresh registry (a restarted process) derives the same id.
        let again = TypeRegistry::new().register::<Note>().unwrap();
        assert_eq!(again, id);
    }

    #[test]
    fn test_resolve_and_factory() {
        let registry = TypeRegistry::new();
        let id = registry.register::<Note>().unwrap();
        let info = registry.resolve(id).unwrap();
        assert_eq!(info.type_name, "synqra.tests.Note");
        let object = (info.factory)();
        assert_eq!(object.rust_type(), TypeId::of::<Note>());
        assert_eq!(registry.type_id::<Note>(), Some(id));
        assert!(registry.resolve(Identifier::new_v7()).is_none());
    }

    #[test]
    fn test_collection_ids() {
        let registry = TypeRegistry::new();
        let id = registry.register::<Note>().unwrap();
        let default = registry.collection_id(id, "").unwrap();
        let archive = registry.collection_id(id, "archive").unwrap();
        assert_ne!(default, archive);
        assert_eq!(default, collection_id_for(id, "").unwrap());
        assert_ne!(default, id);
    }
}
