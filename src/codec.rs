//! # Binary Codec
//!
//! Compact encoding used for durable records (sharded files, SQLite blobs) and
//! for the binary wire envelope.
//!
//! ## Primitives
//!
//! | Type | Encoding |
//! |------|----------|
//! | unsigned integer | LEB128 varint, 7 bits per byte, high bit = continuation |
//! | signed integer | ZigZag, then varint |
//! | string | UTF-8 bytes, then a single `0x00` |
//! | identifier | 16 raw big-endian bytes |
//! | bool | one byte, `0` or `1` |
//!
//! ```text
//! signed    0  -> 00
//! signed   -1  -> 01
//! signed   64  -> 80 01
//! unsigned 127 -> 7F
//! unsigned 128 -> 80 01
//! "Hi"         -> 48 69 00
//! ```
//!
//! ## Typed Values
//!
//! A dynamically typed [`Value`] is written as a signed type code followed by
//! its payload. Negative codes are reserved for primitives; `0` and positive
//! codes introduce objects:
//!
//! | Code | Meaning |
//! |------|---------|
//! | `-1` | signed integer |
//! | `-2` | unsigned integer |
//! | `-3` | UTF-8 string |
//! | `-4` | as requested: same kind the reader expects, tag skipped |
//! | `-5` | null (no payload) |
//! | `-6` | bool |
//! | `-7` | identifier |
//! | `0` | self-describing object: type name, then named fields |
//! | `n > 0` | object with pre-shared schema `n` |
//!
//! ## Objects
//!
//! Three levels, picked from the model's descriptor:
//!
//! ```text
//! Level 1 (schema id):   [n] [value_1] [value_2] ... [value_k]      positional
//! Level 2 (type name):   [0] [type name\0] <level 3 body>
//! Level 3 (body):        [name\0][value] ... [//\0]                 defaults omitted
//! ```
//!
//! Level-3 decoding stops at the first field name starting with `//`. A
//! property is omitted only when it equals the same property on a default
//! instance, so an `Option` holding `Some(0)` is still written.
//!
//! A nested model inside a value slot ([`Value::Object`]) is always written at
//! level 2, type name and body, whatever the nested type's schema. A nested
//! object carrying a schema id cannot be decoded as a dynamic value.

use crate::error::{Error, Result};
use crate::id::Identifier;
use crate::model::Model;
use crate::value::{ObjectValue, Property, PropertyBag, Value, ValueKind};

// =============================================================================
// Constants
// =============================================================================

/// Reserved type codes written before dynamically typed values.
pub mod type_code {
    /// Signed integer.
    pub const SIGNED: i64 = -1;
    /// Unsigned integer.
    pub const UNSIGNED: i64 = -2;
    /// UTF-8 string.
    pub const UTF8_STRING: i64 = -3;
    /// Same kind as the reader's declared expectation; no separate tag.
    pub const AS_REQUESTED: i64 = -4;
    /// Null.
    pub const NULL: i64 = -5;
    /// Bool.
    pub const BOOL: i64 = -6;
    /// Identifier.
    pub const IDENTIFIER: i64 = -7;
    /// Self-describing object (type name follows).
    pub const BY_NAME: i64 = 0;
}

/// Field name that ends a level-3 body. Any name starting with `//` does.
pub const BODY_TERMINATOR: &str = "//";

/// Initial size of the [`Serializer`] scratch buffer.
pub const DEFAULT_INITIAL_BUFFER: usize = 1024;

/// Largest record [`Serializer::to_vec`] will grow its buffer to.
pub const DEFAULT_MAX_BUFFER: usize = 16 * 1024 * 1024;

/// Longest possible varint for a `u64`.
const MAX_VARINT_LEN: usize = 10;

// =============================================================================
// ZigZag
// =============================================================================

/// Maps signed to unsigned so small magnitudes stay small: 0, -1, 1, -2 ...
#[inline]
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Inverse of [`zigzag_encode`].
#[inline]
pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

// =============================================================================
// Writer
// =============================================================================

/// Cursor over a caller-owned output buffer.
///
/// Every write checks capacity first and fails with
/// [`Error::BufferTooSmall`] instead of writing a partial value.
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    /// Starts writing at offset 0.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Starts writing at `pos`.
    pub fn at(buf: &'a mut [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    /// Current write offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn reserve(&self, len: usize) -> Result<()> {
        let end = self.pos.saturating_add(len);
        if end > self.buf.len() {
            return Err(Error::BufferTooSmall {
                needed_at_least: end,
            });
        }
        Ok(())
    }

    /// Writes raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve(bytes.len())?;
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    /// Writes one byte.
    pub fn write_u8(&mut self, byte: u8) -> Result<()> {
        self.write_bytes(&[byte])
    }

    /// Writes an unsigned varint.
    pub fn write_unsigned(&mut self, mut value: u64) -> Result<()> {
        let mut tmp = [0u8; MAX_VARINT_LEN];
        let mut len = 0;
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                tmp[len] = byte;
                len += 1;
                break;
            }
            tmp[len] = byte | 0x80;
            len += 1;
        }
        self.write_bytes(&tmp[..len])
    }

    /// Writes a zigzag varint.
    pub fn write_signed(&mut self, value: i64) -> Result<()> {
        self.write_unsigned(zigzag_encode(value))
    }

    /// Writes a NUL-terminated UTF-8 string.
    ///
    /// # Errors
    ///
    /// [`Error::Format`] if `s` contains a NUL byte; the format has no escape.
    pub fn write_str(&mut self, s: &str) -> Result<()> {
        if s.as_bytes().contains(&0) {
            return Err(Error::Format(format!(
                "string {s:?} contains an embedded NUL and cannot be encoded"
            )));
        }
        self.reserve(s.len() + 1)?;
        self.write_bytes(s.as_bytes())?;
        self.write_u8(0)
    }

    /// Writes an identifier as 16 big-endian bytes.
    pub fn write_id(&mut self, id: &Identifier) -> Result<()> {
        self.write_bytes(id.as_bytes())
    }

    /// Writes a bool as one byte.
    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_u8(u8::from(value))
    }

    /// Writes a value with its type code.
    pub fn write_value(&mut self, value: &Value) -> Result<()> {
        self.write_signed(code_of(value.kind()))?;
        self.write_payload(value)
    }

    /// Writes a value for a slot whose kind the reader already knows.
    ///
    /// A matching kind is tagged [`type_code::AS_REQUESTED`]; anything else
    /// (usually null) carries its own code.
    pub fn write_value_as(&mut self, value: &Value, expected: ValueKind) -> Result<()> {
        if value.kind() == expected && expected != ValueKind::Null {
            self.write_signed(type_code::AS_REQUESTED)?;
            self.write_payload(value)
        } else {
            self.write_value(value)
        }
    }

    fn write_payload(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Null => Ok(()),
            Value::Bool(b) => self.write_bool(*b),
            Value::Signed(v) => self.write_signed(*v),
            Value::Unsigned(v) => self.write_unsigned(*v),
            Value::Text(s) => self.write_str(s),
            Value::Id(id) => self.write_id(id),
            Value::Object(object) => {
                self.write_str(&object.type_name)?;
                self.write_body(object.properties.iter())
            }
        }
    }

    /// Writes a level-3 body: `(name, value)` pairs, then the terminator.
    pub fn write_body<'p>(&mut self, fields: impl IntoIterator<Item = &'p Property>) -> Result<()> {
        for field in fields {
            self.write_str(&field.name)?;
            self.write_value(&field.value)?;
        }
        self.write_str(BODY_TERMINATOR)
    }
}

fn code_of(kind: ValueKind) -> i64 {
    match kind {
        ValueKind::Null => type_code::NULL,
        ValueKind::Bool => type_code::BOOL,
        ValueKind::Signed => type_code::SIGNED,
        ValueKind::Unsigned => type_code::UNSIGNED,
        ValueKind::Text => type_code::UTF8_STRING,
        ValueKind::Id => type_code::IDENTIFIER,
        ValueKind::Object => type_code::BY_NAME,
    }
}

fn kind_of(code: i64) -> Result<ValueKind> {
    match code {
        type_code::NULL => Ok(ValueKind::Null),
        type_code::BOOL => Ok(ValueKind::Bool),
        type_code::SIGNED => Ok(ValueKind::Signed),
        type_code::UNSIGNED => Ok(ValueKind::Unsigned),
        type_code::UTF8_STRING => Ok(ValueKind::Text),
        type_code::IDENTIFIER => Ok(ValueKind::Id),
        type_code::BY_NAME => Ok(ValueKind::Object),
        c if c > 0 => Err(Error::UnsupportedType(format!(
            "nested object with schema id {c}; nested objects must be self-describing"
        ))),
        c => Err(Error::Format(format!("unknown type code {c}"))),
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Cursor over an input buffer.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Starts reading at offset 0.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Starts reading at `pos`.
    pub fn at(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    /// Current read offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    /// Reads `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::Format(format!(
                "unexpected end of input at offset {}: wanted {len} bytes, {} left",
                self.pos,
                self.remaining()
            )));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    /// Reads an unsigned varint.
    ///
    /// # Errors
    ///
    /// [`Error::Format`] if the input ends mid-varint or the continuation
    /// bits run past 64 bits of payload.
    pub fn read_unsigned(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            if shift >= 64 {
                return Err(Error::Format("varint continues past 64 bits".to_string()));
            }
            let byte = self.read_u8()?;
            let bits = u64::from(byte & 0x7F);
            if shift == 63 && bits > 1 {
                return Err(Error::Format("varint overflows 64 bits".to_string()));
            }
            result |= bits << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Reads a zigzag varint.
    pub fn read_signed(&mut self) -> Result<i64> {
        self.read_unsigned().map(zigzag_decode)
    }

    /// Reads a NUL-terminated UTF-8 string.
    pub fn read_str(&mut self) -> Result<String> {
        let rest = &self.buf[self.pos.min(self.buf.len())..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::Format(format!("unterminated string at offset {}", self.pos)))?;
        let s = std::str::from_utf8(&rest[..end])
            .map_err(|e| Error::Format(format!("invalid UTF-8 at offset {}: {e}", self.pos)))?
            .to_string();
        self.pos += end + 1;
        Ok(s)
    }

    /// Reads a 16-byte identifier.
    pub fn read_id(&mut self) -> Result<Identifier> {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(self.read_bytes(16)?);
        Ok(Identifier::from_bytes(bytes))
    }

    /// Reads a one-byte bool.
    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(Error::Format(format!("invalid bool byte {b:#04x}"))),
        }
    }

    /// Reads a tagged value.
    ///
    /// `expected` resolves [`type_code::AS_REQUESTED`]; without it that tag is
    /// a format error.
    pub fn read_value(&mut self, expected: Option<ValueKind>) -> Result<Value> {
        let code = self.read_signed()?;
        let kind = if code == type_code::AS_REQUESTED {
            expected.ok_or_else(|| {
                Error::Format("as-requested value in a slot with no declared kind".to_string())
            })?
        } else {
            kind_of(code)?
        };
        self.read_payload(kind)
    }

    fn read_payload(&mut self, kind: ValueKind) -> Result<Value> {
        Ok(match kind {
            ValueKind::Null => Value::Null,
            ValueKind::Bool => Value::Bool(self.read_bool()?),
            ValueKind::Signed => Value::Signed(self.read_signed()?),
            ValueKind::Unsigned => Value::Unsigned(self.read_unsigned()?),
            ValueKind::Text => Value::Text(self.read_str()?),
            ValueKind::Id => Value::Id(self.read_id()?),
            ValueKind::Object => {
                let type_name = self.read_str()?;
                let properties = self.read_body()?;
                ObjectValue::new(type_name, properties).into()
            }
        })
    }

    /// Reads a level-3 body up to and including its terminator.
    pub fn read_body(&mut self) -> Result<PropertyBag> {
        let mut bag = PropertyBag::new();
        loop {
            let name = self.read_str()?;
            if name.starts_with(BODY_TERMINATOR) {
                return Ok(bag);
            }
            let value = self.read_value(None)?;
            bag.insert(name, value);
        }
    }
}

// =============================================================================
// Encode / Decode
// =============================================================================

/// A type with a binary encoding.
pub trait Encode {
    /// Writes `self` at the writer's position.
    fn encode(&self, w: &mut Writer<'_>) -> Result<()>;
}

/// A type that can be read back from its binary encoding.
pub trait Decode: Sized {
    /// Reads one value at the reader's position.
    fn decode(r: &mut Reader<'_>) -> Result<Self>;
}

impl Encode for u64 {
    fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        w.write_unsigned(*self)
    }
}

impl Decode for u64 {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        r.read_unsigned()
    }
}

impl Encode for u32 {
    fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        w.write_unsigned(u64::from(*self))
    }
}

impl Decode for u32 {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let v = r.read_unsigned()?;
        u32::try_from(v).map_err(|_| Error::Format(format!("{v} does not fit in u32")))
    }
}

impl Encode for i64 {
    fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        w.write_signed(*self)
    }
}

impl Decode for i64 {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        r.read_signed()
    }
}

impl Encode for i32 {
    fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        w.write_signed(i64::from(*self))
    }
}

impl Decode for i32 {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let v = r.read_signed()?;
        i32::try_from(v).map_err(|_| Error::Format(format!("{v} does not fit in i32")))
    }
}

impl Encode for bool {
    fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        w.write_bool(*self)
    }
}

impl Decode for bool {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        r.read_bool()
    }
}

impl Encode for str {
    fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        w.write_str(self)
    }
}

impl Encode for String {
    fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        w.write_str(self)
    }
}

impl Decode for String {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        r.read_str()
    }
}

impl Encode for Identifier {
    fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        w.write_id(self)
    }
}

impl Decode for Identifier {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        r.read_id()
    }
}

impl Encode for Value {
    fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        w.write_value(self)
    }
}

impl Decode for Value {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        r.read_value(None)
    }
}

/// A bag keeps every entry, including defaults: an explicit default is
/// information here, unlike an omitted model field.
impl Encode for PropertyBag {
    fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        w.write_body(self.iter())
    }
}

impl Decode for PropertyBag {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        r.read_body()
    }
}

// =============================================================================
// Model Objects
// =============================================================================

impl<T: Model> Encode for T {
    fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        let descriptor = T::descriptor();
        match descriptor.schema() {
            Some(schema_id) => {
                w.write_signed(i64::from(schema_id))?;
                for property in descriptor.properties() {
                    w.write_value_as(&property.get(self), property.kind)?;
                }
                Ok(())
            }
            None => {
                w.write_signed(type_code::BY_NAME)?;
                w.write_str(descriptor.type_name())?;
                w.write_body(descriptor.changes(self).iter())
            }
        }
    }
}

impl<T: Model> Decode for T {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let descriptor = T::descriptor();
        let code = r.read_signed()?;
        match code {
            type_code::BY_NAME => {
                let type_name = r.read_str()?;
                if type_name != descriptor.type_name() {
                    return Err(Error::UnsupportedType(format!(
                        "expected '{}', found '{type_name}'",
                        descriptor.type_name()
                    )));
                }
                let body = r.read_body()?;
                descriptor.from_bag(&body)
            }
            c if c > 0 => {
                if descriptor.schema().map(i64::from) != Some(c) {
                    return Err(Error::UnsupportedType(format!(
                        "schema id {c} does not describe '{}'",
                        descriptor.type_name()
                    )));
                }
                let mut target = T::default();
                for property in descriptor.properties() {
                    let value = r.read_value(Some(property.kind))?;
                    descriptor.set(&mut target, property.name, value)?;
                }
                Ok(target)
            }
            c => Err(Error::Format(format!(
                "type code {c} cannot start an object of type '{}'",
                descriptor.type_name()
            ))),
        }
    }
}

// =============================================================================
// Serializer
// =============================================================================

/// Reusable serializer with a pooled scratch buffer.
///
/// [`Serializer::serialize`] and [`Serializer::deserialize`] work on
/// caller-owned buffers at an explicit position. [`Serializer::to_vec`] grows
/// the pooled buffer on [`Error::BufferTooSmall`] and retries.
///
/// # Example
///
/// ```rust
/// use synqra::codec::Serializer;
///
/// let mut serializer = Serializer::new();
/// let mut buf = [0u8; 8];
/// let end = serializer.serialize(&mut buf, &64i64, 0).unwrap();
/// assert_eq!(&buf[..end], &[0x80, 0x01]);
///
/// let (back, _) = serializer.deserialize::<i64>(&buf, 0).unwrap();
/// assert_eq!(back, 64);
/// ```
pub struct Serializer {
    scratch: Vec<u8>,
    initial: usize,
    max: usize,
}

impl Serializer {
    /// Creates a serializer with the default buffer limits.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_INITIAL_BUFFER, DEFAULT_MAX_BUFFER)
    }

    /// Creates a serializer whose pooled buffer starts at `initial` bytes and
    /// never grows past `max`.
    pub fn with_limits(initial: usize, max: usize) -> Self {
        let initial = initial.max(1);
        Self {
            scratch: vec![0; initial],
            initial,
            max: max.max(initial),
        }
    }

    /// Writes `value` into `buffer` at `pos`; returns the end offset.
    pub fn serialize<T: Encode + ?Sized>(
        &self,
        buffer: &mut [u8],
        value: &T,
        pos: usize,
    ) -> Result<usize> {
        let mut w = Writer::at(buffer, pos);
        value.encode(&mut w)?;
        Ok(w.position())
    }

    /// Reads a `T` from `buffer` at `pos`; returns it with the end offset.
    pub fn deserialize<T: Decode>(&self, buffer: &[u8], pos: usize) -> Result<(T, usize)> {
        let mut r = Reader::at(buffer, pos);
        let value = T::decode(&mut r)?;
        Ok((value, r.position()))
    }

    /// Encodes `value` into a fresh vector using the pooled buffer.
    pub fn to_vec<T: Encode + ?Sized>(&mut self, value: &T) -> Result<Vec<u8>> {
        loop {
            let mut w = Writer::new(&mut self.scratch);
            match value.encode(&mut w) {
                Ok(()) => {
                    let end = w.position();
                    return Ok(self.scratch[..end].to_vec());
                }
                Err(Error::BufferTooSmall { needed_at_least }) if self.scratch.len() < self.max => {
                    let grown = (self.scratch.len() * 2).max(needed_at_least).min(self.max);
                    self.scratch.resize(grown, 0);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Shrinks the pooled buffer back to its initial size.
    pub fn reset(&mut self) {
        self.scratch.truncate(self.initial);
        self.scratch.shrink_to(self.initial);
    }

    /// Current size of the pooled buffer.
    pub fn capacity(&self) -> usize {
        self.scratch.len()
    }
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes one `T` that must span all of `bytes`.
pub fn from_slice<T: Decode>(bytes: &[u8]) -> Result<T> {
    let mut r = Reader::new(bytes);
    let value = T::decode(&mut r)?;
    if r.remaining() != 0 {
        return Err(Error::Format(format!(
            "{} trailing bytes after record",
            r.remaining()
        )));
    }
    Ok(value)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use super::*;
    use crate::model::tests::Note;
    use crate::model::ModelDescriptor;

    fn encode<T: Encode + ?Sized>(value: &T) -> Vec<u8> {
        Serializer::new().to_vec(value).unwrap()
    }

    #[test]
    fn test_signed_vectors() {
        assert_eq!(encode(&0i64), vec![0x00]);
        assert_eq!(encode(&-1i64), vec![0x01]);
        assert_eq!(encode(&1i64), vec![0x02]);
        assert_eq!(encode(&64i64), vec![0x80, 0x01]);
    }

    #[test]
    fn test_unsigned_vectors() {
        assert_eq!(encode(&0x7Fu64), vec![0x7F]);
        assert_eq!(encode(&0x80u64), vec![0x80, 0x01]);
        assert_eq!(encode(&u64::MAX).len(), MAX_VARINT_LEN);
    }

    #[test]
    fn test_string_vector() {
        assert_eq!(encode("Hi"), vec![0x48, 0x69, 0x00]);
        assert_eq!(encode(""), vec![0x00]);
    }

    #[test]
    fn test_primitive_extremes_roundtrip() {
        for v in [i64::MIN, -65, -64, 0, 63, 64, i64::MAX] {
            assert_eq!(from_slice::<i64>(&encode(&v)).unwrap(), v);
        }
        for v in [0u64, 127, 128, 16_383, 16_384, u64::MAX] {
            assert_eq!(from_slice::<u64>(&encode(&v)).unwrap(), v);
        }
        let text = "héllo wörld".to_string();
        assert_eq!(from_slice::<String>(&encode(&text)).unwrap(), text);
    }

    #[test]
    fn test_embedded_nul_rejected() {
        let err = Serializer::new().to_vec("a\0b").unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_buffer_too_small() {
        let mut buf = [0u8; 2];
        let err = Serializer::new().serialize(&mut buf, "abc", 0).unwrap_err();
        assert!(matches!(err, Error::BufferTooSmall { needed_at_least: 4 }));
    }

    #[test]
    fn test_serialize_at_position() {
        let s = Serializer::new();
        let mut buf = [0u8; 16];
        let mid = s.serialize(&mut buf, &300u64, 3).unwrap();
        let end = s.serialize(&mut buf, "x", mid).unwrap();
        let (n, next) = s.deserialize::<u64>(&buf, 3).unwrap();
        assert_eq!(n, 300);
        assert_eq!(next, mid);
        let (text, done) = s.deserialize::<String>(&buf, next).unwrap();
        assert_eq!(text, "x");
        assert_eq!(done, end);
    }

    #[test]
    fn test_truncated_varint() {
        let err = from_slice::<u64>(&[0x80, 0x80]).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_varint_past_64_bits() {
        let bytes = [0xFFu8; 11];
        let err = from_slice::<u64>(&bytes).unwrap_err();
        assert!(matches!(err, Error::Format(_)));

        let mut overflow = [0xFFu8; 10];
        overflow[9] = 0x02;
        assert!(matches!(from_slice::<u64>(&overflow), Err(Error::Format(_))));
    }

    #[test]
    fn test_unterminated_string() {
        assert!(matches!(from_slice::<String>(b"abc"), Err(Error::Format(_))));
    }

    #[test]
    fn test_value_tags() {
        assert_eq!(encode(&Value::Signed(-1)), vec![0x01, 0x01]);
        assert_eq!(encode(&Value::Null), vec![0x09]);
        for v in [
            Value::Null,
            Value::Bool(true),
            Value::Signed(-42),
            Value::Unsigned(42),
            Value::Text("t".into()),
            Value::Id(Identifier::new_v7()),
            ObjectValue::new("demo.Tag", PropertyBag::new().with("name", "x")).into(),
        ] {
            assert_eq!(from_slice::<Value>(&encode(&v)).unwrap(), v);
        }
    }

    #[test]
    fn test_as_requested_needs_expectation() {
        let mut buf = [0u8; 8];
        let end = {
            let mut w = Writer::new(&mut buf);
            w.write_value_as(&Value::Unsigned(5), ValueKind::Unsigned).unwrap();
            w.position()
        };
        assert_eq!(&buf[..end], &[0x07, 0x05]);

        let mut r = Reader::new(&buf[..end]);
        assert_eq!(r.read_value(Some(ValueKind::Unsigned)).unwrap(), Value::Unsigned(5));
        let mut r = Reader::new(&buf[..end]);
        assert!(matches!(r.read_value(None), Err(Error::Format(_))));
    }

    #[test]
    fn test_bag_keeps_defaults() {
        let bag = PropertyBag::new().with("a", 0i64).with("b", "x");
        assert_eq!(from_slice::<PropertyBag>(&encode(&bag)).unwrap(), bag);
    }

    #[test]
    fn test_self_describing_model_omits_defaults() {
        let note = Note {
            text: "hello".into(),
            pinned: false,
            views: 0,
        };
        let bytes = encode(&note);
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_signed().unwrap(), type_code::BY_NAME);
        assert_eq!(r.read_str().unwrap(), "synqra.tests.Note");
        let body = r.read_body().unwrap();
        assert_eq!(body.len(), 1);
        assert_eq!(body.get("text"), Some(&Value::from("hello")));

        assert_eq!(from_slice::<Note>(&bytes).unwrap(), note);
    }

    #[test]
    fn test_body_stops_at_comment_marker() {
        let mut buf = vec![0u8; 64];
        let end = {
            let mut w = Writer::new(&mut buf);
            w.write_str("views").unwrap();
            w.write_value(&Value::Unsigned(2)).unwrap();
            w.write_str("// end of fields").unwrap();
            w.position()
        };
        let bag = from_slice::<PropertyBag>(&buf[..end]).unwrap();
        assert_eq!(bag.get("views"), Some(&Value::Unsigned(2)));
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
        label: Option<String>,
    }

    impl Model for Point {
        fn descriptor() -> &'static ModelDescriptor<Self> {
            static DESCRIPTOR: OnceLock<ModelDescriptor<Point>> = OnceLock::new();
            DESCRIPTOR.get_or_init(|| {
                ModelDescriptor::<Point>::new("synqra.tests.Point")
                    .schema_id(7)
                    .property("x", ValueKind::Signed, |p| p.x.into(), |p, v| {
                        p.x = v.coerce()?;
                        Ok(())
                    })
                    .property("y", ValueKind::Signed, |p| p.y.into(), |p, v| {
                        p.y = v.coerce()?;
                        Ok(())
                    })
                    .property("label", ValueKind::Text, |p| p.label.clone().into(), |p, v| {
                        p.label = v.coerce()?;
                        Ok(())
                    })
            })
        }
    }

    #[test]
    fn test_schema_model_is_positional() {
        let point = Point {
            x: 1,
            y: -1,
            label: None,
        };
        let bytes = encode(&point);
        // [7] [as-requested 1] [as-requested -1] [null]
        assert_eq!(bytes, vec![0x0E, 0x07, 0x02, 0x07, 0x01, 0x09]);
        assert_eq!(from_slice::<Point>(&bytes).unwrap(), point);

        let labelled = Point {
            label: Some("p".into()),
            ..point
        };
        assert_eq!(from_slice::<Point>(&encode(&labelled)).unwrap(), labelled);
    }

    #[test]
    fn test_wrong_schema_is_unsupported() {
        let bytes = encode(&Point::default());
        assert!(matches!(from_slice::<Note>(&bytes), Err(Error::Format(_)) | Err(Error::UnsupportedType(_))));

        let note_bytes = encode(&Note::default());
        assert!(matches!(from_slice::<Point>(&note_bytes), Err(Error::UnsupportedType(_))));
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Limits {
        quota: Option<i64>,
        label: Option<String>,
        origin: Point,
        spare: Option<Point>,
    }

    impl Model for Limits {
        fn descriptor() -> &'static ModelDescriptor<Self> {
            static DESCRIPTOR: OnceLock<ModelDescriptor<Limits>> = OnceLock::new();
            DESCRIPTOR.get_or_init(|| {
                ModelDescriptor::<Limits>::new("synqra.tests.Limits")
                    .property("quota", ValueKind::Signed, |l| l.quota.into(), |l, v| {
                        l.quota = v.coerce()?;
                        Ok(())
                    })
                    .property("label", ValueKind::Text, |l| l.label.clone().into(), |l, v| {
                        l.label = v.coerce()?;
                        Ok(())
                    })
                    .property(
                        "origin",
                        ValueKind::Object,
                        |l| Point::descriptor().to_value(&l.origin),
                        |l, v| {
                            l.origin = Point::descriptor().from_value(v)?;
                            Ok(())
                        },
                    )
                    .property(
                        "spare",
                        ValueKind::Object,
                        |l| match &l.spare {
                            Some(p) => Point::descriptor().to_value(p),
                            None => Value::Null,
                        },
                        |l, v| {
                            l.spare = match v {
                                Value::Null => None,
                                v => Some(Point::descriptor().from_value(v)?),
                            };
                            Ok(())
                        },
                    )
            })
        }
    }

    #[test]
    fn test_self_describing_model_keeps_some_zero_and_empty() {
        let limits = Limits {
            quota: Some(0),
            label: Some(String::new()),
            ..Limits::default()
        };
        let bytes = encode(&limits);
        assert_eq!(from_slice::<Limits>(&bytes).unwrap(), limits);

        let bare = encode(&Limits::default());
        assert_eq!(from_slice::<Limits>(&bare).unwrap(), Limits::default());
        assert!(bare.len() < bytes.len());
    }

    #[test]
    fn test_nested_model_roundtrip() {
        let limits = Limits {
            quota: Some(3),
            origin: Point {
                x: 4,
                y: 0,
                label: Some("home".into()),
            },
            spare: Some(Point::default()),
            ..Limits::default()
        };
        let bytes = encode(&limits);
        assert_eq!(from_slice::<Limits>(&bytes).unwrap(), limits);

        // The nested point is written by name even though Point has a schema.
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_signed().unwrap(), type_code::BY_NAME);
        assert_eq!(r.read_str().unwrap(), "synqra.tests.Limits");
        let body = r.read_body().unwrap();
        match body.get("origin") {
            Some(Value::Object(origin)) => {
                assert_eq!(origin.type_name, "synqra.tests.Point");
                assert_eq!(origin.properties.get("x"), Some(&Value::Signed(4)));
                assert!(origin.properties.get("y").is_none());
            }
            other => panic!("expected nested object, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_schema_object_in_value_slot_is_unsupported() {
        let mut buf = [0u8; 8];
        let end = {
            let mut w = Writer::new(&mut buf);
            w.write_signed(7).unwrap();
            w.position()
        };
        let mut r = Reader::new(&buf[..end]);
        assert!(matches!(r.read_value(None), Err(Error::UnsupportedType(_))));
    }

    #[test]
    fn test_to_vec_grows_and_reset_shrinks() {
        let mut s = Serializer::with_limits(4, 1024);
        let long = "x".repeat(100);
        let bytes = s.to_vec(&long).unwrap();
        assert_eq!(bytes.len(), 101);
        assert!(s.capacity() >= 101);
        s.reset();
        assert_eq!(s.capacity(), 4);

        let mut tiny = Serializer::with_limits(4, 8);
        assert!(matches!(tiny.to_vec(&long), Err(Error::BufferTooSmall { .. })));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        assert!(matches!(from_slice::<u64>(&[0x01, 0x02]), Err(Error::Format(_))));
    }
}
