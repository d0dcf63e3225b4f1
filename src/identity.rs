//! # Object Identity
//!
//! Every live object that takes part in commands carries at most one
//! [`Identifier`] for its lifetime. The [`IdentityTable`] associates object
//! identity (the address of the shared allocation, not equality) with
//! `{id, collection, just_created}`.
//!
//! The table holds only [`Weak`] references: dropping the last strong handle
//! lets the object go, and a periodic sweep removes its entry. A `Weak` keeps
//! the allocation reserved, so an address cannot be reused while its entry is
//! still in the table.
//!
//! ## Attach Modes
//!
//! [`IdentityTable::get_id`] takes one of six [`AttachMode`]s, the product of
//! "object already attached" × "object not attached":
//!
//! | Mode | Attached | Not attached |
//! |------|----------|--------------|
//! | `GetExisting` | return id | [`Error::NotAttached`] |
//! | `GetOrNil` | return id | return [`Identifier::NIL`] |
//! | `GetOrAttach` | return id | allocate and attach |
//! | `AttachNew` | [`Error::AlreadyAttached`] | allocate and attach |
//! | `EnsureDetached` | [`Error::AlreadyAttached`] | return [`Identifier::NIL`] |
//! | `Reject` | [`Error::AlreadyAttached`] | [`Error::NotAttached`] |

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::id::Identifier;
use crate::model::{object_key, DynObject, ObjectRef};

/// Default number of table operations between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: u32 = 1024;

// =============================================================================
// Attach Mode
// =============================================================================

/// What [`IdentityTable::get_id`] does when the object is already attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhenAttached {
    /// Fail with [`Error::AlreadyAttached`].
    Fail,
    /// Return the existing id.
    Return,
}

/// What [`IdentityTable::get_id`] does when the object is not attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhenMissing {
    /// Fail with [`Error::NotAttached`].
    Fail,
    /// Return [`Identifier::NIL`].
    Nil,
    /// Allocate a fresh id and attach.
    Attach,
}

/// The six identity lookup behaviors. See the module table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachMode {
    GetExisting,
    GetOrNil,
    GetOrAttach,
    AttachNew,
    EnsureDetached,
    Reject,
}

impl AttachMode {
    /// Behavior for an attached object.
    pub fn when_attached(self) -> WhenAttached {
        match self {
            AttachMode::GetExisting | AttachMode::GetOrNil | AttachMode::GetOrAttach => {
                WhenAttached::Return
            }
            AttachMode::AttachNew | AttachMode::EnsureDetached | AttachMode::Reject => {
                WhenAttached::Fail
            }
        }
    }

    /// Behavior for an object that is not attached.
    pub fn when_missing(self) -> WhenMissing {
        match self {
            AttachMode::GetExisting | AttachMode::Reject => WhenMissing::Fail,
            AttachMode::GetOrNil | AttachMode::EnsureDetached => WhenMissing::Nil,
            AttachMode::GetOrAttach | AttachMode::AttachNew => WhenMissing::Attach,
        }
    }
}

// =============================================================================
// Identity Table
// =============================================================================

/// Identity of one attached object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    /// The object's id.
    pub id: Identifier,
    /// The collection it belongs to.
    pub collection_id: Identifier,
    /// True between id allocation and the object's creation event.
    pub just_created: bool,
}

struct Entry {
    object: Weak<dyn DynObject>,
    attachment: Attachment,
}

/// Weak association from live objects to their ids.
pub struct IdentityTable {
    by_key: HashMap<usize, Entry>,
    by_id: HashMap<Identifier, usize>,
    ops: u32,
    sweep_interval: u32,
}

impl IdentityTable {
    /// Creates a table that sweeps every `sweep_interval` operations
    /// (0 disables automatic sweeps).
    pub fn new(sweep_interval: u32) -> Self {
        Self {
            by_key: HashMap::new(),
            by_id: HashMap::new(),
            ops: 0,
            sweep_interval,
        }
    }

    /// Resolves the id of `object` according to `mode`.
    ///
    /// `collection_id` is used when attaching. For an already attached object
    /// a non-nil `collection_id` must match the recorded one.
    pub fn get_id(
        &mut self,
        object: &ObjectRef,
        collection_id: Identifier,
        mode: AttachMode,
    ) -> Result<Identifier> {
        self.tick();
        if let Some(existing) = self.attachment_of(object) {
            return match mode.when_attached() {
                WhenAttached::Return => {
                    if !collection_id.is_nil() && collection_id != existing.collection_id {
                        return Err(Error::AlreadyAttached {
                            existing: existing.id,
                            collection_id: existing.collection_id,
                        });
                    }
                    Ok(existing.id)
                }
                WhenAttached::Fail => Err(Error::AlreadyAttached {
                    existing: existing.id,
                    collection_id: existing.collection_id,
                }),
            };
        }

        match mode.when_missing() {
            WhenMissing::Fail => Err(Error::NotAttached),
            WhenMissing::Nil => Ok(Identifier::NIL),
            WhenMissing::Attach => {
                let id = Identifier::new_v7();
                self.insert(object, id, collection_id, true);
                debug!(%id, %collection_id, "attached new object");
                Ok(id)
            }
        }
    }

    /// Binds `object` to an explicit `id` (creation events, replay).
    ///
    /// Re-attaching with the same id and collection is a no-op.
    pub fn attach(&mut self, object: &ObjectRef, id: Identifier, collection_id: Identifier) -> Result<()> {
        self.tick();
        if let Some(existing) = self.attachment_of(object) {
            if existing.id == id && existing.collection_id == collection_id {
                return Ok(());
            }
            return Err(Error::AlreadyAttached {
                existing: existing.id,
                collection_id: existing.collection_id,
            });
        }
        if self.lookup(id).is_some() {
            return Err(Error::IdInUse { id });
        }
        self.insert(object, id, collection_id, false);
        Ok(())
    }

    /// The attachment of `object`, if it is attached and alive.
    pub fn attachment_of(&self, object: &ObjectRef) -> Option<Attachment> {
        self.by_key
            .get(&object_key(object))
            .filter(|entry| entry.object.strong_count() > 0)
            .map(|entry| entry.attachment)
    }

    /// The live object bound to `id`.
    pub fn lookup(&self, id: Identifier) -> Option<ObjectRef> {
        let key = self.by_id.get(&id)?;
        self.by_key.get(key)?.object.upgrade()
    }

    /// Clears the just-created flag once the creation event is applied.
    pub fn mark_created(&mut self, id: Identifier) {
        if let Some(entry) = self.by_id.get(&id).and_then(|key| self.by_key.get_mut(key)) {
            entry.attachment.just_created = false;
        }
    }

    /// Drops the attachment of `object` if its creation never committed.
    ///
    /// Only a `just_created` entry is removed; returns whether one was.
    pub fn release(&mut self, object: &ObjectRef) -> bool {
        let key = object_key(object);
        let Some(entry) = self.by_key.get(&key) else {
            return false;
        };
        if !entry.attachment.just_created {
            return false;
        }
        let id = entry.attachment.id;
        self.by_key.remove(&key);
        if self.by_id.get(&id) == Some(&key) {
            self.by_id.remove(&id);
        }
        debug!(%id, "released uncommitted attachment");
        true
    }

    /// Removes entries whose object was dropped. Returns how many.
    pub fn sweep(&mut self) -> usize {
        let before = self.by_key.len();
        self.by_key.retain(|_, entry| entry.object.strong_count() > 0);
        let by_key = &self.by_key;
        self.by_id.retain(|_, key| by_key.contains_key(key));
        let swept = before - self.by_key.len();
        if swept > 0 {
            warn!(swept, remaining = self.by_key.len(), "swept dropped objects from identity table");
        }
        swept
    }

    /// Number of entries, including dropped objects not yet swept.
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// True if the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    fn insert(&mut self, object: &ObjectRef, id: Identifier, collection_id: Identifier, just_created: bool) {
        let key = object_key(object);
        // A dead entry under this id is replaced.
        if let Some(old_key) = self.by_id.insert(id, key) {
            if old_key != key {
                self.by_key.remove(&old_key);
            }
        }
        self.by_key.insert(
            key,
            Entry {
                object: Arc::downgrade(object),
                attachment: Attachment {
                    id,
                    collection_id,
                    just_created,
                },
            },
        );
    }

    fn tick(&mut self) {
        if self.sweep_interval == 0 {
            return;
        }
        self.ops += 1;
        if self.ops >= self.sweep_interval {
            self.ops = 0;
            self.sweep();
        }
    }
}

impl Default for IdentityTable {
    fn default() -> Self {
        Self::new(DEFAULT_SWEEP_INTERVAL)
    }
}

// =============================================================================
// Tests
// =============================================================================
