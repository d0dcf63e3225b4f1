//! # Commands and Events
//!
//! A [`Command`] is an intent to mutate state. An [`Event`] is an immutable
//! fact derived from exactly one command. Both are closed tagged unions:
//! adding a variant forces every visitor to handle it, because dispatch is an
//! exhaustive `match` in [`Command::accept`] / [`Event::accept`].
//!
//! ## Lifecycle
//!
//! ```text
//! Command ──expand──▶ [CommandCreated, ObjectCreated, PropertyChanged...]
//!                              │
//!                              ▼
//!                      append_batch ──▶ apply ──▶ in-memory objects
//! ```
//!
//! Commands are never persisted on their own. Each one is wrapped in a
//! [`CommandCreatedEvent`] that is stored ahead of the events it produced.
//!
//! ## Custom Types
//!
//! Hosts add their own commands and events through [`Command::Custom`] and
//! [`Event::Custom`]: a type name plus a property bag. The core visitors hand
//! those to an [`ExtraCommandVisitor`] / [`ExtraEventVisitor`] registered for
//! the type name.
//!
//! ## Encodings
//!
//! JSON (JSON-Lines storage, JSON wire envelope) uses a `$type` discriminator
//! and camelCase fields. The binary codec writes a schema id per variant:
//!
//! | Variant | Schema id |
//! |---------|-----------|
//! | `Event::CommandCreated` | 1 |
//! | `Event::ObjectCreated` | 2 |
//! | `Event::ObjectPropertyChanged` | 3 |
//! | `Event::ObjectDeleted` | 4 |
//! | `Command::CreateObject` | 11 |
//! | `Command::ChangeObjectProperty` | 12 |
//! | `Command::DeleteObject` | 13 |
//! | custom | 0, then the type name and a named-field body |

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codec::{type_code, Decode, Encode, Reader, Writer, BODY_TERMINATOR};
use crate::error::{Error, Result};
use crate::id::Identifier;
use crate::model::{object_key, ObjectRef};
use crate::value::{PropertyBag, Value};

// =============================================================================
// Schema Ids
// =============================================================================

const SCHEMA_COMMAND_CREATED: i64 = 1;
const SCHEMA_OBJECT_CREATED: i64 = 2;
const SCHEMA_PROPERTY_CHANGED: i64 = 3;
const SCHEMA_OBJECT_DELETED: i64 = 4;
const SCHEMA_CREATE_OBJECT: i64 = 11;
const SCHEMA_CHANGE_PROPERTY: i64 = 12;
const SCHEMA_DELETE_OBJECT: i64 = 13;

/// Reserved body entries of custom commands and events.
const FIELD_EVENT_ID: &str = "$eventId";
const FIELD_COMMAND_ID: &str = "$commandId";
const FIELD_CONTAINER_ID: &str = "$containerId";
const RESERVED_FIELDS: [&str; 3] = [FIELD_EVENT_ID, FIELD_COMMAND_ID, FIELD_CONTAINER_ID];

// =============================================================================
// Addressing
// =============================================================================

/// The object a single-object command or event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectAddress {
    /// Registered type of the object.
    pub target_type_id: Identifier,
    /// Collection the object lives in.
    pub collection_id: Identifier,
    /// The object's own id.
    pub target_id: Identifier,
}

/// The live object a create command was issued for.
///
/// Never serialized; only meaningful inside the process that built the
/// command.
#[derive(Clone)]
pub struct Target(pub ObjectRef);

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Target({})", self.0.type_name())
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        object_key(&self.0) == object_key(&other.0)
    }
}

// =============================================================================
// Commands
// =============================================================================

/// Creates an object in a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateObjectCommand {
    pub command_id: Identifier,
    pub container_id: Identifier,
    pub target_type_id: Identifier,
    pub collection_id: Identifier,
    pub target_id: Identifier,
    /// Full property snapshot of the new object.
    pub data: PropertyBag,
    /// The live instance, when the command originates in this process.
    #[serde(skip)]
    pub target: Option<Target>,
}

/// Sets one property of an existing object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeObjectPropertyCommand {
    pub command_id: Identifier,
    pub container_id: Identifier,
    pub target_type_id: Identifier,
    pub collection_id: Identifier,
    pub target_id: Identifier,
    pub property_name: String,
    pub old_value: Value,
    pub new_value: Value,
}

/// Deletes an object. Expansion is not implemented.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteObjectCommand {
    pub command_id: Identifier,
    pub container_id: Identifier,
    pub target_type_id: Identifier,
    pub collection_id: Identifier,
    pub target_id: Identifier,
}

/// A host-defined command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomCommand {
    pub command_id: Identifier,
    pub container_id: Identifier,
    pub type_name: String,
    pub data: PropertyBag,
}

/// An intent to mutate state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$type", rename_all = "camelCase")]
pub enum Command {
    CreateObject(CreateObjectCommand),
    ChangeObjectProperty(ChangeObjectPropertyCommand),
    DeleteObject(DeleteObjectCommand),
    Custom(CustomCommand),
}

impl CreateObjectCommand {
    /// Builds a create command with a fresh command id.
    pub fn new(container_id: Identifier, address: ObjectAddress, data: PropertyBag) -> Self {
        Self {
            command_id: Identifier::new_v7(),
            container_id,
            target_type_id: address.target_type_id,
            collection_id: address.collection_id,
            target_id: address.target_id,
            data,
            target: None,
        }
    }

    /// Attaches the live instance the command describes.
    pub fn with_target(mut self, target: ObjectRef) -> Self {
        self.target = Some(Target(target));
        self
    }
}

impl ChangeObjectPropertyCommand {
    /// Builds a property change with a fresh command id.
    pub fn new(
        container_id: Identifier,
        address: ObjectAddress,
        property_name: impl Into<String>,
        old_value: Value,
        new_value: Value,
    ) -> Self {
        Self {
            command_id: Identifier::new_v7(),
            container_id,
            target_type_id: address.target_type_id,
            collection_id: address.collection_id,
            target_id: address.target_id,
            property_name: property_name.into(),
            old_value,
            new_value,
        }
    }
}

impl DeleteObjectCommand {
    /// Builds a delete command with a fresh command id.
    pub fn new(container_id: Identifier, address: ObjectAddress) -> Self {
        Self {
            command_id: Identifier::new_v7(),
            container_id,
            target_type_id: address.target_type_id,
            collection_id: address.collection_id,
            target_id: address.target_id,
        }
    }
}

impl CustomCommand {
    /// Builds a custom command with a fresh command id.
    pub fn new(container_id: Identifier, type_name: impl Into<String>, data: PropertyBag) -> Self {
        Self {
            command_id: Identifier::new_v7(),
            container_id,
            type_name: type_name.into(),
            data,
        }
    }
}

impl Command {
    /// The command's id.
    pub fn command_id(&self) -> Identifier {
        match self {
            Command::CreateObject(c) => c.command_id,
            Command::ChangeObjectProperty(c) => c.command_id,
            Command::DeleteObject(c) => c.command_id,
            Command::Custom(c) => c.command_id,
        }
    }

    /// The tenant/partition scope.
    pub fn container_id(&self) -> Identifier {
        match self {
            Command::CreateObject(c) => c.container_id,
            Command::ChangeObjectProperty(c) => c.container_id,
            Command::DeleteObject(c) => c.container_id,
            Command::Custom(c) => c.container_id,
        }
    }

    /// Discriminator used in logs and errors.
    pub fn type_name(&self) -> &str {
        match self {
            Command::CreateObject(_) => "createObject",
            Command::ChangeObjectProperty(_) => "changeObjectProperty",
            Command::DeleteObject(_) => "deleteObject",
            Command::Custom(c) => &c.type_name,
        }
    }

    /// A copy without the live target, as it is recorded in the log.
    pub fn detached(&self) -> Command {
        match self {
            Command::CreateObject(c) => Command::CreateObject(CreateObjectCommand {
                target: None,
                ..c.clone()
            }),
            other => other.clone(),
        }
    }

    /// Dispatches to the visitor method for this variant, wrapped in the
    /// visitor's before/after hooks.
    pub fn accept<C, V>(&self, visitor: &V, ctx: &mut C) -> Result<()>
    where
        V: CommandVisitor<C> + ?Sized,
    {
        visitor.before_visit(self, ctx)?;
        match self {
            Command::CreateObject(c) => visitor.visit_create_object(c, ctx)?,
            Command::ChangeObjectProperty(c) => visitor.visit_change_object_property(c, ctx)?,
            Command::DeleteObject(c) => visitor.visit_delete_object(c, ctx)?,
            Command::Custom(c) => visitor.visit_custom(c, ctx)?,
        }
        visitor.after_visit(self, ctx)
    }
}

// =============================================================================
// Events
// =============================================================================

/// Records a command, ahead of the events it expanded into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandCreatedEvent {
    pub event_id: Identifier,
    pub command_id: Identifier,
    pub container_id: Identifier,
    pub command: Command,
}

/// An object came into existence with the given snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectCreatedEvent {
    pub event_id: Identifier,
    pub command_id: Identifier,
    pub container_id: Identifier,
    pub target_type_id: Identifier,
    pub collection_id: Identifier,
    pub target_id: Identifier,
    pub data: PropertyBag,
}

/// One property of an object changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectPropertyChangedEvent {
    pub event_id: Identifier,
    pub command_id: Identifier,
    pub container_id: Identifier,
    pub target_type_id: Identifier,
    pub collection_id: Identifier,
    pub target_id: Identifier,
    pub property_name: String,
    pub old_value: Value,
    pub new_value: Value,
}

/// An object was deleted. Application is not implemented.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDeletedEvent {
    pub event_id: Identifier,
    pub command_id: Identifier,
    pub container_id: Identifier,
    pub target_type_id: Identifier,
    pub collection_id: Identifier,
    pub target_id: Identifier,
}

/// A host-defined event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomEvent {
    pub event_id: Identifier,
    pub command_id: Identifier,
    pub container_id: Identifier,
    pub type_name: String,
    pub data: PropertyBag,
}

/// An immutable fact derived from one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$type", rename_all = "camelCase")]
pub enum Event {
    CommandCreated(CommandCreatedEvent),
    ObjectCreated(ObjectCreatedEvent),
    ObjectPropertyChanged(ObjectPropertyChangedEvent),
    ObjectDeleted(ObjectDeletedEvent),
    Custom(CustomEvent),
}

impl Event {
    /// The event's id; also its storage key.
    pub fn event_id(&self) -> Identifier {
        match self {
            Event::CommandCreated(e) => e.event_id,
            Event::ObjectCreated(e) => e.event_id,
            Event::ObjectPropertyChanged(e) => e.event_id,
            Event::ObjectDeleted(e) => e.event_id,
            Event::Custom(e) => e.event_id,
        }
    }

    /// Id of the command this event was derived from.
    pub fn command_id(&self) -> Identifier {
        match self {
            Event::CommandCreated(e) => e.command_id,
            Event::ObjectCreated(e) => e.command_id,
            Event::ObjectPropertyChanged(e) => e.command_id,
            Event::ObjectDeleted(e) => e.command_id,
            Event::Custom(e) => e.command_id,
        }
    }

    /// The tenant/partition scope.
    pub fn container_id(&self) -> Identifier {
        match self {
            Event::CommandCreated(e) => e.container_id,
            Event::ObjectCreated(e) => e.container_id,
            Event::ObjectPropertyChanged(e) => e.container_id,
            Event::ObjectDeleted(e) => e.container_id,
            Event::Custom(e) => e.container_id,
        }
    }

    /// The addressed object, for single-object events.
    pub fn target(&self) -> Option<ObjectAddress> {
        let (target_type_id, collection_id, target_id) = match self {
            Event::ObjectCreated(e) => (e.target_type_id, e.collection_id, e.target_id),
            Event::ObjectPropertyChanged(e) => (e.target_type_id, e.collection_id, e.target_id),
            Event::ObjectDeleted(e) => (e.target_type_id, e.collection_id, e.target_id),
            Event::CommandCreated(_) | Event::Custom(_) => return None,
        };
        Some(ObjectAddress {
            target_type_id,
            collection_id,
            target_id,
        })
    }

    /// Discriminator used in logs and errors.
    pub fn type_name(&self) -> &str {
        match self {
            Event::CommandCreated(_) => "commandCreated",
            Event::ObjectCreated(_) => "objectCreated",
            Event::ObjectPropertyChanged(_) => "objectPropertyChanged",
            Event::ObjectDeleted(_) => "objectDeleted",
            Event::Custom(e) => &e.type_name,
        }
    }

    /// Storage key extractor: the event id.
    pub fn key(&self) -> Identifier {
        self.event_id()
    }

    /// Rejects events that must never be applied: nil event id, or a
    /// single-object event without its type or target id.
    pub fn validate(&self) -> Result<()> {
        if self.event_id().is_nil() {
            return Err(Error::validation(format!(
                "{} event has an empty event id",
                self.type_name()
            )));
        }
        if let Some(address) = self.target() {
            if address.target_type_id.is_nil() {
                return Err(Error::validation(format!(
                    "{} event {} has no target type id",
                    self.type_name(),
                    self.event_id()
                )));
            }
            if address.target_id.is_nil() {
                return Err(Error::validation(format!(
                    "{} event {} has no target id",
                    self.type_name(),
                    self.event_id()
                )));
            }
        }
        Ok(())
    }

    /// Dispatches to the visitor method for this variant, wrapped in the
    /// visitor's before/after hooks.
    pub fn accept<C, V>(&self, visitor: &V, ctx: &mut C) -> Result<()>
    where
        V: EventVisitor<C> + ?Sized,
    {
        visitor.before_visit(self, ctx)?;
        match self {
            Event::CommandCreated(e) => visitor.visit_command_created(e, ctx)?,
            Event::ObjectCreated(e) => visitor.visit_object_created(e, ctx)?,
            Event::ObjectPropertyChanged(e) => visitor.visit_object_property_changed(e, ctx)?,
            Event::ObjectDeleted(e) => visitor.visit_object_deleted(e, ctx)?,
            Event::Custom(e) => visitor.visit_custom(e, ctx)?,
        }
        visitor.after_visit(self, ctx)
    }
}

// =============================================================================
// Visitors
// =============================================================================

/// Per-variant callbacks for [`Command::accept`].
pub trait CommandVisitor<C> {
    /// Runs before every visit.
    fn before_visit(&self, _command: &Command, _ctx: &mut C) -> Result<()> {
        Ok(())
    }

    /// Runs after every successful visit.
    fn after_visit(&self, _command: &Command, _ctx: &mut C) -> Result<()> {
        Ok(())
    }

    fn visit_create_object(&self, command: &CreateObjectCommand, ctx: &mut C) -> Result<()>;

    fn visit_change_object_property(
        &self,
        command: &ChangeObjectPropertyCommand,
        ctx: &mut C,
    ) -> Result<()>;

    fn visit_delete_object(&self, command: &DeleteObjectCommand, ctx: &mut C) -> Result<()>;

    /// Custom commands; visitors normally delegate to an
    /// [`ExtraCommandVisitor`].
    fn visit_custom(&self, command: &CustomCommand, _ctx: &mut C) -> Result<()> {
        Err(Error::UnsupportedType(format!(
            "no visitor handles custom command '{}'",
            command.type_name
        )))
    }
}

/// Per-variant callbacks for [`Event::accept`].
pub trait EventVisitor<C> {
    /// Runs before every visit.
    fn before_visit(&self, _event: &Event, _ctx: &mut C) -> Result<()> {
        Ok(())
    }

    /// Runs after every successful visit.
    fn after_visit(&self, _event: &Event, _ctx: &mut C) -> Result<()> {
        Ok(())
    }

    fn visit_command_created(&self, event: &CommandCreatedEvent, ctx: &mut C) -> Result<()>;

    fn visit_object_created(&self, event: &ObjectCreatedEvent, ctx: &mut C) -> Result<()>;

    fn visit_object_property_changed(
        &self,
        event: &ObjectPropertyChangedEvent,
        ctx: &mut C,
    ) -> Result<()>;

    fn visit_object_deleted(&self, event: &ObjectDeletedEvent, ctx: &mut C) -> Result<()>;

    /// Custom events; visitors normally delegate to an [`ExtraEventVisitor`].
    fn visit_custom(&self, event: &CustomEvent, _ctx: &mut C) -> Result<()> {
        Err(Error::UnsupportedType(format!(
            "no visitor handles custom event '{}'",
            event.type_name
        )))
    }
}

/// Handles one host-defined command type during expansion.
pub trait ExtraCommandVisitor<C>: Send + Sync {
    /// The [`CustomCommand::type_name`] this visitor handles.
    fn type_name(&self) -> &str;

    /// Expands the command, pushing events into `ctx`.
    fn visit(&self, command: &CustomCommand, ctx: &mut C) -> Result<()>;
}

/// Handles one host-defined event type during application.
pub trait ExtraEventVisitor<C>: Send + Sync {
    /// The [`CustomEvent::type_name`] this visitor handles.
    fn type_name(&self) -> &str;

    /// Checks the event can be applied, without side effects.
    fn check(&self, _event: &CustomEvent) -> Result<()> {
        Ok(())
    }

    /// Applies the event.
    fn visit(&self, event: &CustomEvent, ctx: &mut C) -> Result<()>;
}

/// Extra visitors keyed by the custom type name they handle.
pub struct ExtraVisitors<V: ?Sized> {
    by_name: HashMap<String, Arc<V>>,
}

impl<V: ?Sized> ExtraVisitors<V> {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self {
            by_name: HashMap::new(),
        }
    }

    /// Registers `visitor` for `type_name`, replacing any previous one.
    pub fn insert(&mut self, type_name: impl Into<String>, visitor: Arc<V>) {
        self.by_name.insert(type_name.into(), visitor);
    }

    /// The visitor registered for `type_name`.
    pub fn get(&self, type_name: &str) -> Option<&Arc<V>> {
        self.by_name.get(type_name)
    }
}

impl<V: ?Sized> Default for ExtraVisitors<V> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Binary Encoding
// =============================================================================

fn write_address(
    w: &mut Writer<'_>,
    type_id: &Identifier,
    collection: &Identifier,
    target: &Identifier,
) -> Result<()> {
    w.write_id(type_id)?;
    w.write_id(collection)?;
    w.write_id(target)
}

fn write_custom(
    w: &mut Writer<'_>,
    type_name: &str,
    reserved: &[(&str, Identifier)],
    data: &PropertyBag,
) -> Result<()> {
    let reserved_name =
        |name: &str| RESERVED_FIELDS.contains(&name) || name.starts_with(BODY_TERMINATOR);
    if let Some(clash) = data.iter().find(|p| reserved_name(&p.name)) {
        return Err(Error::Format(format!(
            "'{type_name}' data uses the reserved field name '{}'",
            clash.name
        )));
    }
    w.write_signed(type_code::BY_NAME)?;
    w.write_str(type_name)?;
    for (name, id) in reserved {
        w.write_str(name)?;
        w.write_value(&Value::Id(*id))?;
    }
    data.encode(w)
}

fn take_id(bag: &mut PropertyBag, name: &str) -> Result<Identifier> {
    match bag.remove(name) {
        Some(Value::Id(id)) => Ok(id),
        Some(other) => Err(Error::Format(format!("{name} must be an identifier, found {other}"))),
        None => Err(Error::Format(format!("custom record is missing {name}"))),
    }
}

impl Encode for Command {
    fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        match self {
            Command::CreateObject(c) => {
                w.write_signed(SCHEMA_CREATE_OBJECT)?;
                w.write_id(&c.command_id)?;
                w.write_id(&c.container_id)?;
                write_address(w, &c.target_type_id, &c.collection_id, &c.target_id)?;
                c.data.encode(w)
            }
            Command::ChangeObjectProperty(c) => {
                w.write_signed(SCHEMA_CHANGE_PROPERTY)?;
                w.write_id(&c.command_id)?;
                w.write_id(&c.container_id)?;
                write_address(w, &c.target_type_id, &c.collection_id, &c.target_id)?;
                w.write_str(&c.property_name)?;
                w.write_value(&c.old_value)?;
                w.write_value(&c.new_value)
            }
            Command::DeleteObject(c) => {
                w.write_signed(SCHEMA_DELETE_OBJECT)?;
                w.write_id(&c.command_id)?;
                w.write_id(&c.container_id)?;
                write_address(w, &c.target_type_id, &c.collection_id, &c.target_id)
            }
            Command::Custom(c) => write_custom(
                w,
                &c.type_name,
                &[(FIELD_COMMAND_ID, c.command_id), (FIELD_CONTAINER_ID, c.container_id)],
                &c.data,
            ),
        }
    }
}

impl Decode for Command {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let code = r.read_signed()?;
        if code == type_code::BY_NAME {
            let type_name = r.read_str()?;
            let mut data = r.read_body()?;
            let command_id = take_id(&mut data, FIELD_COMMAND_ID)?;
            let container_id = take_id(&mut data, FIELD_CONTAINER_ID)?;
            return Ok(Command::Custom(CustomCommand {
                command_id,
                container_id,
                type_name,
                data,
            }));
        }
        if !(SCHEMA_CREATE_OBJECT..=SCHEMA_DELETE_OBJECT).contains(&code) {
            return Err(Error::UnsupportedType(format!(
                "unknown command schema id {code}"
            )));
        }

        let command_id = r.read_id()?;
        let container_id = r.read_id()?;
        let target_type_id = r.read_id()?;
        let collection_id = r.read_id()?;
        let target_id = r.read_id()?;
        Ok(match code {
            SCHEMA_CREATE_OBJECT => Command::CreateObject(CreateObjectCommand {
                command_id,
                container_id,
                target_type_id,
                collection_id,
                target_id,
                data: PropertyBag::decode(r)?,
                target: None,
            }),
            SCHEMA_CHANGE_PROPERTY => Command::ChangeObjectProperty(ChangeObjectPropertyCommand {
                command_id,
                container_id,
                target_type_id,
                collection_id,
                target_id,
                property_name: r.read_str()?,
                old_value: r.read_value(None)?,
                new_value: r.read_value(None)?,
            }),
            _ => Command::DeleteObject(DeleteObjectCommand {
                command_id,
                container_id,
                target_type_id,
                collection_id,
                target_id,
            }),
        })
    }
}

impl Encode for Event {
    fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        match self {
            Event::CommandCreated(e) => {
                w.write_signed(SCHEMA_COMMAND_CREATED)?;
                w.write_id(&e.event_id)?;
                w.write_id(&e.command_id)?;
                w.write_id(&e.container_id)?;
                e.command.encode(w)
            }
            Event::ObjectCreated(e) => {
                w.write_signed(SCHEMA_OBJECT_CREATED)?;
                w.write_id(&e.event_id)?;
                w.write_id(&e.command_id)?;
                w.write_id(&e.container_id)?;
                write_address(w, &e.target_type_id, &e.collection_id, &e.target_id)?;
                e.data.encode(w)
            }
            Event::ObjectPropertyChanged(e) => {
                w.write_signed(SCHEMA_PROPERTY_CHANGED)?;
                w.write_id(&e.event_id)?;
                w.write_id(&e.command_id)?;
                w.write_id(&e.container_id)?;
                write_address(w, &e.target_type_id, &e.collection_id, &e.target_id)?;
                w.write_str(&e.property_name)?;
                w.write_value(&e.old_value)?;
                w.write_value(&e.new_value)
            }
            Event::ObjectDeleted(e) => {
                w.write_signed(SCHEMA_OBJECT_DELETED)?;
                w.write_id(&e.event_id)?;
                w.write_id(&e.command_id)?;
                w.write_id(&e.container_id)?;
                write_address(w, &e.target_type_id, &e.collection_id, &e.target_id)
            }
            Event::Custom(e) => write_custom(
                w,
                &e.type_name,
                &[
                    (FIELD_EVENT_ID, e.event_id),
                    (FIELD_COMMAND_ID, e.command_id),
                    (FIELD_CONTAINER_ID, e.container_id),
                ],
                &e.data,
            ),
        }
    }
}

impl Decode for Event {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let code = r.read_signed()?;
        if code == type_code::BY_NAME {
            let type_name = r.read_str()?;
            let mut data = r.read_body()?;
            return Ok(Event::Custom(CustomEvent {
                event_id: take_id(&mut data, FIELD_EVENT_ID)?,
                command_id: take_id(&mut data, FIELD_COMMAND_ID)?,
                container_id: take_id(&mut data, FIELD_CONTAINER_ID)?,
                type_name,
                data,
            }));
        }
        if !(SCHEMA_COMMAND_CREATED..=SCHEMA_OBJECT_DELETED).contains(&code) {
            return Err(Error::UnsupportedType(format!("unknown event schema id {code}")));
        }

        let event_id = r.read_id()?;
        let command_id = r.read_id()?;
        let container_id = r.read_id()?;
        if code == SCHEMA_COMMAND_CREATED {
            return Ok(Event::CommandCreated(CommandCreatedEvent {
                event_id,
                command_id,
                container_id,
                command: Command::decode(r)?,
            }));
        }

        let target_type_id = r.read_id()?;
        let collection_id = r.read_id()?;
        let target_id = r.read_id()?;
        Ok(match code {
            SCHEMA_OBJECT_CREATED => Event::ObjectCreated(ObjectCreatedEvent {
                event_id,
                command_id,
                container_id,
                target_type_id,
                collection_id,
                target_id,
                data: PropertyBag::decode(r)?,
            }),
            SCHEMA_PROPERTY_CHANGED => Event::ObjectPropertyChanged(ObjectPropertyChangedEvent {
                event_id,
                command_id,
                container_id,
                target_type_id,
                collection_id,
                target_id,
                property_name: r.read_str()?,
                old_value: r.read_value(None)?,
                new_value: r.read_value(None)?,
            }),
            _ => Event::ObjectDeleted(ObjectDeletedEvent {
                event_id,
                command_id,
                container_id,
                target_type_id,
                collection_id,
                target_id,
            }),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
