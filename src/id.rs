//! # Time-Sortable Identifiers
//!
//! Every key in Synqra is an [`Identifier`]: a 128-bit RFC 9562 UUID. Two
//! flavors are produced here:
//!
//! - **Version 7** (time-sortable): generated for commands, events and objects.
//! - **Version 8** (namespace-derived): deterministic ids for types and
//!   collections, computed from a SHA-256 digest.
//!
//! ## Version 7 Layout
//!
//! ```text
//!  0                   1                   2                   3
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     unix_ts_ms (48 bits)                      │
//! ├───────────────┬───────────────────────────────────────────────┤
//! │ ver=7 (4 bits)│ sub-ms counter (12 bits)                      │
//! ├───┬───────────┴───────────────────────────────────────────────┤
//! │var│                random (62 bits)                           │
//! └───┴───────────────────────────────────────────────────────────┘
//! ```
//!
//! The millisecond timestamp and the 12-bit counter together form a 60-bit
//! "stamp". The generator keeps the last emitted stamp in one process-wide
//! atomic and never emits a stamp less than or equal to it, so identifiers
//! from one process are strictly increasing even inside one tick.
//!
//! ## Byte Order
//!
//! [`Identifier::as_bytes`] is the RFC (big-endian) layout. Comparing those
//! bytes lexicographically, or their hex rendering, orders v7 ids by
//! generation time. Storage backends rely on this.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Bits of sub-millisecond counter below the millisecond timestamp.
const COUNTER_BITS: u32 = 12;

/// Mask for the 48-bit millisecond field.
const TIMESTAMP_MASK: u64 = (1 << 48) - 1;

/// Mask for the 62 random bits after the variant.
const RANDOM_MASK: u64 = (1 << 62) - 1;

/// RFC 9562 variant bits (`10`) in the top of the low 64 bits.
const RFC_VARIANT: u64 = 0b10 << 62;

/// Nanoseconds in one millisecond.
const NANOS_PER_MILLI: u64 = 1_000_000;

/// Last stamp (`ms << 12 | counter`) handed out by this process.
static LAST_STAMP: AtomicU64 = AtomicU64::new(0);

// =============================================================================
// Identifier
// =============================================================================

/// A 128-bit identifier; v7 ids sort by generation time.
///
/// # Example
///
/// ```rust
/// use synqra::id::Identifier;
///
/// let a = Identifier::new_v7();
/// let b = Identifier::new_v7();
/// assert!(a < b);
/// assert_eq!(a.version(), 7);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(Uuid);

impl Identifier {
    /// The all-zero identifier. Used as "absent" in addressing fields.
    pub const NIL: Identifier = Identifier(Uuid::nil());

    /// Generates a new monotonic v7 identifier from the current clock.
    pub fn new_v7() -> Self {
        let stamp = next_stamp(current_stamp());
        Self::from_stamp(stamp, rand::thread_rng().next_u64())
    }

    /// Builds a v7 identifier for an explicit instant.
    ///
    /// Unlike [`Identifier::new_v7`] this does not consult the process-wide
    /// last stamp: the caller chose the time, the counter comes from that
    /// time's sub-millisecond part, and only the random tail differs between
    /// two calls with the same instant.
    pub fn new_v7_at(timestamp: DateTime<Utc>) -> Result<Self> {
        let millis = u64::try_from(timestamp.timestamp_millis()).map_err(|_| {
            Error::Argument(format!("timestamp {timestamp} is before the unix epoch"))
        })?;
        let nanos = u64::from(timestamp.timestamp_subsec_nanos());
        let stamp = stamp_of(millis, nanos);
        Ok(Self::from_stamp(stamp, rand::thread_rng().next_u64()))
    }

    /// Derives a deterministic identifier from a namespace and a name.
    ///
    /// SHA-256 over `namespace bytes ++ name`, truncated to 16 bytes, with the
    /// version (8) and variant bits patched in. Same inputs, same output.
    ///
    /// # Errors
    ///
    /// [`Error::Argument`] if `namespace` is nil or does not carry the RFC
    /// variant; both would make unrelated namespaces collide.
    pub fn namespaced(namespace: Identifier, name: &[u8]) -> Result<Self> {
        if namespace.is_nil() {
            return Err(Error::Argument(
                "namespace for a derived identifier must not be nil".to_string(),
            ));
        }
        if !namespace.is_rfc_variant() {
            return Err(Error::Argument(format!(
                "namespace {namespace} does not carry the RFC 9562 variant"
            )));
        }

        let mut hasher = Sha256::new();
        hasher.update(namespace.as_bytes());
        hasher.update(name);
        let digest = hasher.finalize();

        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        bytes[6] = (bytes[6] & 0x0F) | 0x80;
        bytes[8] = (bytes[8] & 0x3F) | 0x80;

        Ok(Self(Uuid::from_bytes(bytes)))
    }

    /// [`Identifier::namespaced`] for UTF-8 names.
    pub fn namespaced_str(namespace: Identifier, name: &str) -> Result<Self> {
        Self::namespaced(namespace, name.as_bytes())
    }

    /// Decodes the embedded millisecond timestamp.
    ///
    /// # Errors
    ///
    /// [`Error::NotSupported`] for versions that embed no timestamp.
    pub fn timestamp(&self) -> Result<DateTime<Utc>> {
        if self.version() != 7 {
            return Err(Error::NotSupported(format!(
                "identifier version {} does not embed a timestamp",
                self.version()
            )));
        }
        let millis = (self.0.as_u128() >> 80) as i64;
        DateTime::<Utc>::from_timestamp_millis(millis)
            .ok_or_else(|| Error::Format(format!("timestamp {millis}ms is out of range")))
    }

    /// The version nibble (7 for time-sortable, 8 for namespace-derived).
    pub fn version(&self) -> usize {
        self.0.get_version_num()
    }

    /// True for [`Identifier::NIL`].
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// True if the variant bits are the RFC 9562 `10` pattern.
    pub fn is_rfc_variant(&self) -> bool {
        self.0.as_bytes()[8] & 0xC0 == 0x80
    }

    /// Big-endian (RFC) byte layout; sorts chronologically for v7.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Builds an identifier from its big-endian bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// The identifier as one big-endian integer.
    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }

    /// Builds an identifier from a big-endian integer.
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// Lower-case hex of the big-endian bytes, no separators.
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    fn from_stamp(stamp: u64, random: u64) -> Self {
        let millis = (stamp >> COUNTER_BITS) & TIMESTAMP_MASK;
        let counter = stamp & ((1 << COUNTER_BITS) - 1);
        let high = (millis << 16) | (0x7 << 12) | counter;
        let low = RFC_VARIANT | (random & RANDOM_MASK);
        Self(Uuid::from_u128((u128::from(high) << 64) | u128::from(low)))
    }
}

impl Default for Identifier {
    fn default() -> Self {
        Self::NIL
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({})", self.0.hyphenated())
    }
}

impl FromStr for Identifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::Format(format!("invalid identifier '{s}': {e}")))
    }
}

impl From<Uuid> for Identifier {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<Identifier> for Uuid {
    fn from(id: Identifier) -> Self {
        id.0
    }
}

// =============================================================================
// Stamp Generation
// =============================================================================

/// Combines milliseconds and the sub-millisecond part into a 60-bit stamp.
///
/// The sub-millisecond nanoseconds are scaled down to fit 12 bits.
fn stamp_of(millis: u64, subsec_nanos: u64) -> u64 {
    let ticks = (subsec_nanos % NANOS_PER_MILLI) * (1 << COUNTER_BITS) / NANOS_PER_MILLI;
    ((millis & TIMESTAMP_MASK) << COUNTER_BITS) | ticks
}

fn current_stamp() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    stamp_of(now.as_millis() as u64, u64::from(now.subsec_nanos()))
}

/// Commits `candidate`, or `last + 1` if the clock has not moved past the
/// last emitted stamp, with a compare-and-swap retry loop.
fn next_stamp(candidate: u64) -> u64 {
    let mut last = LAST_STAMP.load(Ordering::Acquire);
    loop {
        let next = if candidate > last { candidate } else { last + 1 };
        match LAST_STAMP.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
