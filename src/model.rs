//! # Model Descriptors
//!
//! Application types that live in the object store implement [`Model`]. A
//! model exposes a [`ModelDescriptor`]: a table of named properties, each with
//! a getter and a setter function pointer, built once per type. The codec and
//! the projection read and write objects through that table; there is no
//! runtime reflection.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::OnceLock;
//! use synqra::model::{Model, ModelDescriptor};
//! use synqra::value::ValueKind;
//!
//! #[derive(Debug, Default, Clone, PartialEq)]
//! struct Task {
//!     title: String,
//!     done: bool,
//! }
//!
//! impl Model for Task {
//!     fn descriptor() -> &'static ModelDescriptor<Self> {
//!         static DESCRIPTOR: OnceLock<ModelDescriptor<Task>> = OnceLock::new();
//!         DESCRIPTOR.get_or_init(|| {
//!             ModelDescriptor::<Task>::new("demo.Task")
//!                 .property("title", ValueKind::Text, |t| t.title.clone().into(), |t, v| {
//!                     t.title = v.coerce()?;
//!                     Ok(())
//!                 })
//!                 .property("done", ValueKind::Bool, |t| t.done.into(), |t, v| {
//!                     t.done = v.coerce()?;
//!                     Ok(())
//!                 })
//!         })
//!     }
//! }
//! ```
//!
//! ## Nested Models
//!
//! A property may hold another model. Declare it with [`ValueKind::Object`]
//! and convert through the nested type's descriptor:
//!
//! ```rust,ignore
//! .property("home", ValueKind::Object, |c| Address::descriptor().to_value(&c.home), |c, v| {
//!     c.home = Address::descriptor().from_value(v)?;
//!     Ok(())
//! })
//! ```
//!
//! ## Set-By-Name Capability
//!
//! A model may override [`Model::set_by_name`] to handle assignments itself
//! (computed properties, validation). When it returns `None` the descriptor's
//! setter is used.

use std::any::{Any, TypeId};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::value::{ObjectValue, PropertyBag, Value, ValueKind};

// =============================================================================
// Model Trait
// =============================================================================

/// A type the object store can create, snapshot, and mutate by property name.
pub trait Model: Default + Send + Sync + 'static {
    /// The per-type descriptor, built once.
    fn descriptor() -> &'static ModelDescriptor<Self>;

    /// Optional hand-written assignment hook.
    ///
    /// Return `None` to fall back to the descriptor's setter.
    fn set_by_name(&mut self, _name: &str, _value: &Value) -> Option<Result<()>> {
        None
    }
}

/// Getter function pointer.
pub type Getter<T> = fn(&T) -> Value;

/// Setter function pointer; coerces the value to the field's type.
pub type Setter<T> = fn(&mut T, Value) -> Result<()>;

/// One property of a model.
pub struct PropertyDescriptor<T> {
    /// Property name.
    pub name: &'static str,
    /// Declared kind; level-1 encodings write values of this kind untagged.
    pub kind: ValueKind,
    get: Getter<T>,
    set: Setter<T>,
}

impl<T> PropertyDescriptor<T> {
    /// Reads the property from `target`.
    pub fn get(&self, target: &T) -> Value {
        (self.get)(target)
    }

    /// Writes `value` to `target`, coercing to the field's type.
    pub fn set(&self, target: &mut T, value: Value) -> Result<()> {
        (self.set)(target, value)
    }
}

// =============================================================================
// Model Descriptor
// =============================================================================

/// Accessor table for one model type.
pub struct ModelDescriptor<T> {
    type_name: &'static str,
    schema_id: u32,
    properties: Vec<PropertyDescriptor<T>>,
}

impl<T: Model> ModelDescriptor<T> {
    /// Starts a descriptor for the fully-qualified `type_name`.
    ///
    /// Without [`ModelDescriptor::schema_id`] the type encodes
    /// self-describingly (type name plus named fields).
    pub fn new(type_name: &'static str) -> Self {
        Self {
            type_name,
            schema_id: 0,
            properties: Vec::new(),
        }
    }

    /// Declares a pre-shared schema id (must be non-zero).
    ///
    /// Types with a schema id encode positionally: the id, then every
    /// property in declaration order, no names.
    pub fn schema_id(mut self, schema_id: u32) -> Self {
        assert!(schema_id > 0, "schema id 0 is reserved for self-describing types");
        self.schema_id = schema_id;
        self
    }

    /// Adds a property.
    pub fn property(
        mut self,
        name: &'static str,
        kind: ValueKind,
        get: Getter<T>,
        set: Setter<T>,
    ) -> Self {
        assert!(
            !name.starts_with("//"),
            "property names starting with // are reserved"
        );
        self.properties.push(PropertyDescriptor {
            name,
            kind,
            get,
            set,
        });
        self
    }

    /// Fully-qualified type name.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Pre-shared schema id, or `None` for self-describing types.
    pub fn schema(&self) -> Option<u32> {
        (self.schema_id > 0).then_some(self.schema_id)
    }

    /// Properties in declaration order.
    pub fn properties(&self) -> &[PropertyDescriptor<T>] {
        &self.properties
    }

    /// Finds a property by name.
    pub fn find(&self, name: &str) -> Option<&PropertyDescriptor<T>> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Reads a property by name.
    pub fn get(&self, target: &T, name: &str) -> Result<Value> {
        self.find(name)
            .map(|p| p.get(target))
            .ok_or_else(|| self.unknown(name))
    }

    /// Assigns a property by name.
    ///
    /// Tries [`Model::set_by_name`] first, then the descriptor's setter.
    pub fn set(&self, target: &mut T, name: &str, value: Value) -> Result<()> {
        if let Some(handled) = target.set_by_name(name, &value) {
            return handled;
        }
        let property = self.find(name).ok_or_else(|| self.unknown(name))?;
        property.set(target, value)
    }

    /// Snapshot of every property, in declaration order.
    pub fn snapshot(&self, target: &T) -> PropertyBag {
        self.properties
            .iter()
            .map(|p| (p.name.to_string(), p.get(target)))
            .collect()
    }

    /// Properties of `target` whose value differs from the same property on
    /// `T::default()`, in declaration order.
    ///
    /// `None` is the default of an `Option`, so `Some(0)` and `Some("")` are
    /// kept.
    pub fn changes(&self, target: &T) -> PropertyBag {
        let defaults = T::default();
        self.properties
            .iter()
            .filter_map(|p| {
                let value = p.get(target);
                (value != p.get(&defaults)).then(|| (p.name.to_string(), value))
            })
            .collect()
    }

    /// Wraps `target` as a nested [`Value::Object`].
    pub fn to_value(&self, target: &T) -> Value {
        ObjectValue::new(self.type_name, self.changes(target)).into()
    }

    /// Rebuilds a nested model. Null yields `T::default()`.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedType`] if the value is not an object of this type.
    pub fn from_value(&self, value: Value) -> Result<T> {
        match value {
            Value::Null => Ok(T::default()),
            Value::Object(object) if object.type_name == self.type_name => {
                self.from_bag(&object.properties)
            }
            Value::Object(object) => Err(Error::UnsupportedType(format!(
                "expected nested '{}', found '{}'",
                self.type_name, object.type_name
            ))),
            other => Err(Error::UnsupportedType(format!(
                "cannot convert {other} to '{}'",
                self.type_name
            ))),
        }
    }

    /// Builds a default instance and assigns every entry of `bag`.
    pub fn from_bag(&self, bag: &PropertyBag) -> Result<T> {
        let mut target = T::default();
        for entry in bag.iter() {
            self.set(&mut target, &entry.name, entry.value.clone())?;
        }
        Ok(target)
    }

    fn unknown(&self, name: &str) -> Error {
        Error::UnknownProperty {
            type_name: self.type_name.to_string(),
            property: name.to_string(),
        }
    }
}

// =============================================================================
// Shared Objects
// =============================================================================

/// A live model instance shared between the store and application code.
pub type Shared<T> = Arc<RwLock<T>>;

/// Type-erased handle to a [`Shared`] model instance.
pub type ObjectRef = Arc<dyn DynObject>;

/// Object-safe view of a shared model, used where the concrete type is only
/// known by its type id (event application, replay, identity tracking).
pub trait DynObject: Send + Sync + 'static {
    /// The model's fully-qualified type name.
    fn type_name(&self) -> &'static str;

    /// The Rust type behind the lock.
    fn rust_type(&self) -> TypeId;

    /// All properties, in declaration order.
    fn snapshot(&self) -> PropertyBag;

    /// Reads one property.
    fn get_property(&self, name: &str) -> Result<Value>;

    /// Assigns one property.
    fn set_property(&self, name: &str, value: Value) -> Result<()>;

    /// Checks that `value` can be assigned to `name` without touching `self`.
    fn check_property(&self, name: &str, value: &Value) -> Result<()>;

    /// Assigns every entry of `bag`.
    fn load(&self, bag: &PropertyBag) -> Result<()>;

    /// Upcast for [`downcast`].
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Model> DynObject for RwLock<T> {
    fn type_name(&self) -> &'static str {
        T::descriptor().type_name()
    }

    fn rust_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn snapshot(&self) -> PropertyBag {
        T::descriptor().snapshot(&self.read())
    }

    fn get_property(&self, name: &str) -> Result<Value> {
        T::descriptor().get(&self.read(), name)
    }

    fn set_property(&self, name: &str, value: Value) -> Result<()> {
        T::descriptor().set(&mut self.write(), name, value)
    }

    fn check_property(&self, name: &str, value: &Value) -> Result<()> {
        let mut scratch = T::default();
        T::descriptor().set(&mut scratch, name, value.clone())
    }

    fn load(&self, bag: &PropertyBag) -> Result<()> {
        let descriptor = T::descriptor();
        let mut guard = self.write();
        for entry in bag.iter() {
            descriptor.set(&mut guard, &entry.name, entry.value.clone())?;
        }
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Wraps a model for sharing with the store.
pub fn share<T: Model>(value: T) -> Shared<T> {
    Arc::new(RwLock::new(value))
}

/// Recovers the concrete [`Shared`] handle from a type-erased one.
pub fn downcast<T: Model>(object: ObjectRef) -> Option<Shared<T>> {
    object.into_any().downcast::<RwLock<T>>().ok()
}

/// Address of the shared allocation; the identity key for attached objects.
pub fn object_key(object: &ObjectRef) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::OnceLock;

    use super::*;

    #[derive(Debug, Default, Clone, PartialEq)]
    pub(crate) struct Note {
        pub text: String,
        pub pinned: bool,
        pub views: u32,
    }

    impl Model for Note {
        fn descriptor() -> &'static ModelDescriptor<Self> {
            static DESCRIPTOR: OnceLock<ModelDescriptor<Note>> = OnceLock::new();
            DESCRIPTOR.get_or_init(|| {
                ModelDescriptor::<Note>::new("synqra.tests.Note")
                    .property("text", ValueKind::Text, |n| n.text.clone().into(), |n, v| {
                        n.text = v.coerce()?;
                        Ok(())
                    })
                    .property("pinned", ValueKind::Bool, |n| n.pinned.into(), |n, v| {
                        n.pinned = v.coerce()?;
                        Ok(())
                    })
                    .property("views", ValueKind::Unsigned, |n| n.views.into(), |n, v| {
                        n.views = v.coerce()?;
                        Ok(())
                    })
            })
        }

        fn set_by_name(&mut self, name: &str, value: &Value) -> Option<Result<()>> {
            // Text is always stored trimmed.
            match (name, value) {
                ("text", Value::Text(s)) => {
                    self.text = s.trim().to_string();
                    Some(Ok(()))
                }
                _ => None,
            }
        }
    }

    #[test]
    fn test_get_and_set_by_name() {
        let d = Note::descriptor();
        let mut note = Note::default();
        d.set(&mut note, "views", Value::Signed(3)).unwrap();
        d.set(&mut note, "text", Value::from("  hi  ")).unwrap();
        assert_eq!(note.views, 3);
        assert_eq!(note.text, "hi");
        assert_eq!(d.get(&note, "views").unwrap(), Value::Unsigned(3));
    }

    #[test]
    fn test_unknown_property() {
        let d = Note::descriptor();
        let mut note = Note::default();
        let err = d.set(&mut note, "colour", Value::Null).unwrap_err();
        assert!(matches!(err, Error::UnknownProperty { .. }));
    }

    #[test]
    fn test_snapshot_and_rebuild() {
        let d = Note::descriptor();
        let note = Note {
            text: "a".into(),
            pinned: true,
            views: 0,
        };
        let bag = d.snapshot(&note);
        assert_eq!(bag.len(), 3);
        assert_eq!(d.from_bag(&bag).unwrap(), note);
        assert!(d.schema().is_none());
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Quota {
        limit: Option<i64>,
        label: Option<String>,
        used: u32,
    }

    impl Model for Quota {
        fn descriptor() -> &'static ModelDescriptor<Self> {
            static DESCRIPTOR: OnceLock<ModelDescriptor<Quota>> = OnceLock::new();
            DESCRIPTOR.get_or_init(|| {
                ModelDescriptor::<Quota>::new("synqra.tests.Quota")
                    .property("limit", ValueKind::Signed, |q| q.limit.into(), |q, v| {
                        q.limit = v.coerce()?;
                        Ok(())
                    })
                    .property("label", ValueKind::Text, |q| q.label.clone().into(), |q, v| {
                        q.label = v.coerce()?;
                        Ok(())
                    })
                    .property("used", ValueKind::Unsigned, |q| q.used.into(), |q, v| {
                        q.used = v.coerce()?;
                        Ok(())
                    })
            })
        }
    }

    #[test]
    fn test_changes_compare_against_property_defaults() {
        let d = Quota::descriptor();
        let quota = Quota {
            limit: Some(0),
            label: Some(String::new()),
            used: 0,
        };
        let changes = d.changes(&quota);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes.get("limit"), Some(&Value::Signed(0)));
        assert_eq!(changes.get("label"), Some(&Value::from("")));
        assert_eq!(d.from_bag(&changes).unwrap(), quota);
        assert!(d.changes(&Quota::default()).is_empty());
    }

    #[test]
    fn test_nested_value_conversion() {
        let d = Quota::descriptor();
        let quota = Quota {
            limit: Some(5),
            ..Quota::default()
        };
        let value = d.to_value(&quota);
        assert_eq!(value.kind(), ValueKind::Object);
        assert_eq!(d.from_value(value).unwrap(), quota);
        assert_eq!(d.from_value(Value::Null).unwrap(), Quota::default());

        let other = Note::descriptor().to_value(&Note::default());
        assert!(matches!(d.from_value(other), Err(Error::UnsupportedType(_))));
        assert!(matches!(d.from_value(Value::Bool(true)), Err(Error::UnsupportedType(_))));
    }

    #[test]
    fn test_dyn_object_roundtrip() {
        let shared = share(Note::default());
        let erased: ObjectRef = shared.clone();
        assert_eq!(erased.type_name(), "synqra.tests.Note");
        assert_eq!(erased.rust_type(), TypeId::of::<Note>());

        erased.set_property("pinned", Value::Bool(true)).unwrap();
        assert!(shared.read().pinned);

        assert!(erased.check_property("views", &Value::Signed(-1)).is_err());
        assert!(erased.check_property("views", &Value::Signed(1)).is_ok());
        assert_eq!(shared.read().views, 0);

        let key = object_key(&erased);
        let back = downcast::<Note>(erased).unwrap();
        assert!(Arc::ptr_eq(&back, &shared));
        assert_eq!(key, Arc::as_ptr(&shared) as *const () as usize);
    }
}
