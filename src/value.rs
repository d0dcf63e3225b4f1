//! # Property Values
//!
//! Commands and events carry property values without knowing the Rust type
//! of the object they address. [`Value`] is that dynamic value: a closed set
//! of primitives, plus nested objects, that both the binary codec and JSON
//! can represent.
//!
//! A nested model travels as an [`ObjectValue`]: its type name and the
//! properties that differ from the type's defaults. See
//! [`ModelDescriptor::to_value`](crate::model::ModelDescriptor::to_value).
//!
//! A [`PropertyBag`] is an ordered list of named values. It is the snapshot
//! format inside `ObjectCreatedEvent` and the body of self-describing codec
//! objects.
//!
//! ## Coercion
//!
//! Wire values are converted to the target property's type with
//! [`FromValue`]. Conversions allowed:
//!
//! | From | To |
//! |------|----|
//! | `Signed` / `Unsigned` | any integer type, range-checked |
//! | `Signed` / `Unsigned` 0 or 1 | `bool` |
//! | `Bool` | integers (0/1) |
//! | `Text` | `Identifier` (parsed) |
//! | `Null` | the target's default |
//!
//! Enums stored as integers go through [`Value::to_enum`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::Identifier;

// =============================================================================
// Value
// =============================================================================

/// A dynamically typed property value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Value {
    /// Absent value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer (zigzag varint on the wire).
    Signed(i64),
    /// Unsigned integer (varint on the wire).
    Unsigned(u64),
    /// UTF-8 text (NUL-terminated on the wire).
    Text(String),
    /// An identifier (16 raw bytes on the wire).
    Id(Identifier),
    /// A nested model (self-describing object on the wire).
    Object(Box<ObjectValue>),
}

/// A nested model instance: its type name and the properties that differ from its defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectValue {
    /// Fully-qualified type name of the nested model.
    pub type_name: String,
    /// Properties that differ from the type's defaults.
    pub properties: PropertyBag,
}

impl ObjectValue {
    /// Builds a nested object value.
    pub fn new(type_name: impl Into<String>, properties: PropertyBag) -> Self {
        Self {
            type_name: type_name.into(),
            properties,
        }
    }
}

/// The kind of a [`Value`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// See [`Value::Null`].
    Null,
    /// See [`Value::Bool`].
    Bool,
    /// See [`Value::Signed`].
    Signed,
    /// See [`Value::Unsigned`].
    Unsigned,
    /// See [`Value::Text`].
    Text,
    /// See [`Value::Id`].
    Id,
    /// See [`Value::Object`].
    Object,
}

impl Value {
    /// Returns the kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Signed(_) => ValueKind::Signed,
            Value::Unsigned(_) => ValueKind::Unsigned,
            Value::Text(_) => ValueKind::Text,
            Value::Id(_) => ValueKind::Id,
            Value::Object(_) => ValueKind::Object,
        }
    }

    /// True for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True if this is the zero value of its kind: null, false, 0, "", nil id.
    /// An object is never a zero value.
    ///
    /// This is not the same as a property's default: an `Option<i64>`
    /// defaults to null, so `Some(0)` is a real value for it. Encodings and
    /// create expansions compare against the property's own default instead.
    pub fn is_default(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Bool(b) => !b,
            Value::Signed(v) => *v == 0,
            Value::Unsigned(v) => *v == 0,
            Value::Text(s) => s.is_empty(),
            Value::Id(id) => id.is_nil(),
            Value::Object(_) => false,
        }
    }

    /// Converts this value to `T`, applying the coercions in the module docs.
    pub fn coerce<T: FromValue>(self) -> Result<T> {
        T::from_value(self)
    }

    /// Converts an integer value to an enum through `TryFrom<i64>`.
    pub fn to_enum<E: TryFrom<i64>>(self) -> Result<E> {
        let raw: i64 = self.coerce()?;
        E::try_from(raw).map_err(|_| {
            Error::UnsupportedType(format!(
                "{raw} is not a valid {}",
                std::any::type_name::<E>()
            ))
        })
    }

    fn mismatch(&self, target: &str) -> Error {
        Error::UnsupportedType(format!("cannot convert {self} to {target}"))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Signed(v) => write!(f, "{v}"),
            Value::Unsigned(v) => write!(f, "{v}u"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Id(id) => write!(f, "{id}"),
            Value::Object(object) => {
                write!(f, "{} {{", object.type_name)?;
                for (i, p) in object.properties.iter().enumerate() {
                    let sep = if i == 0 { " " } else { ", " };
                    write!(f, "{sep}{}: {}", p.name, p.value)?;
                }
                write!(f, " }}")
            }
        }
    }
}

// =============================================================================
// Into Value
// =============================================================================

macro_rules! signed_into_value {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Signed(i64::from(v))
            }
        })*
    };
}

macro_rules! unsigned_into_value {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Unsigned(u64::from(v))
            }
        })*
    };
}

signed_into_value!(i8, i16, i32, i64);
unsigned_into_value!(u8, u16, u32, u64);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Identifier> for Value {
    fn from(v: Identifier) -> Self {
        Value::Id(v)
    }
}

impl From<ObjectValue> for Value {
    fn from(v: ObjectValue) -> Self {
        Value::Object(Box::new(v))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

// =============================================================================
// From Value
// =============================================================================

/// Conversion from a wire [`Value`] to a property's Rust type.
pub trait FromValue: Sized {
    /// Converts `value`, coercing between compatible kinds.
    fn from_value(value: Value) -> Result<Self>;
}

macro_rules! integer_from_value {
    ($($t:ty),*) => {
        $(impl FromValue for $t {
            fn from_value(value: Value) -> Result<Self> {
                let converted = match &value {
                    Value::Null => Some(0),
                    Value::Bool(b) => Some(<$t>::from(*b)),
                    Value::Signed(v) => <$t>::try_from(*v).ok(),
                    Value::Unsigned(v) => <$t>::try_from(*v).ok(),
                    _ => None,
                };
                converted.ok_or_else(|| value.mismatch(stringify!($t)))
            }
        })*
    };
}

integer_from_value!(i8, i16, i32, i64, u8, u16, u32, u64);

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(false),
            Value::Bool(b) => Ok(b),
            Value::Signed(0) | Value::Unsigned(0) => Ok(false),
            Value::Signed(1) | Value::Unsigned(1) => Ok(true),
            other => Err(other.mismatch("bool")),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(String::new()),
            Value::Text(s) => Ok(s),
            other => Err(other.mismatch("String")),
        }
    }
}

impl FromValue for Identifier {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Identifier::NIL),
            Value::Id(id) => Ok(id),
            Value::Text(s) => s.parse(),
            other => Err(other.mismatch("Identifier")),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl FromValue for ObjectValue {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(object) => Ok(*object),
            other => Err(other.mismatch("object")),
        }
    }
}

// =============================================================================
// Property Bag
// =============================================================================

/// One named value inside a [`PropertyBag`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    /// Property name as declared by the model.
    pub name: String,
    /// Property value.
    pub value: Value,
}

/// An ordered list of named property values.
///
/// Order is the model's declaration order; names are unique.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyBag(Vec<Property>);

impl PropertyBag {
    /// Creates an empty bag.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Sets `name` to `value`, replacing an existing entry in place.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|p| p.name == name) {
            Some(existing) => existing.value = value,
            None => self.0.push(Property { name, value }),
        }
    }

    /// Builder-style [`PropertyBag::insert`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Looks up a value by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    /// Removes an entry, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let index = self.0.iter().position(|p| p.name == name)?;
        Some(self.0.remove(index).value)
    }

    /// Iterates entries in order.
    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.0.iter()
    }

    /// Iterates entries whose value differs from the same-named entry of
    /// `defaults`. Names missing from `defaults` are always kept.
    pub fn differing_from<'a>(&'a self, defaults: &'a PropertyBag) -> impl Iterator<Item = &'a Property> {
        self.0
            .iter()
            .filter(move |p| defaults.get(&p.name) != Some(&p.value))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the bag has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Value)> for PropertyBag {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut bag = PropertyBag::new();
        for (name, value) in iter {
            bag.insert(name, value);
        }
        bag
    }
}

impl IntoIterator for PropertyBag {
    type Item = Property;
    type IntoIter = std::vec::IntoIter<Property>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

// =============================================================================
// Tests
// =============================================================================
