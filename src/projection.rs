//! # Projection and Object Store
//!
//! The [`ObjectStore`] turns commands into events, persists them, and keeps
//! the in-memory objects they describe.
//!
//! ## Command Pipeline
//!
//! ```text
//! submit_command(cmd)
//!   │
//!   ├─ 1. wrap      CommandCreatedEvent { command: cmd.detached() }
//!   ├─ 2. expand    CommandVisitor  ──▶ ObjectCreated, PropertyChanged...
//!   ├─ 3. check     EventVisitor (dry run against current state)
//!   ├─ 4. persist   storage.append_batch(events)          ◀── suspension point
//!   ├─ 5. apply     EventVisitor (mutates identity table + collections)
//!   ├─ 6. snapshot  item store: one ItemSnapshot per touched object
//!   └─ 7. notify    ReplicationTrigger::trigger(events)
//! ```
//!
//! Steps 1-3 fail before anything is written. If step 4 fails, memory is
//! untouched. Step 5 only runs events that passed step 3 against the same
//! state, which the command gate keeps stable in between.
//!
//! Step 6 only runs when the store was built with an item store. The log is
//! the source of truth: a failed snapshot append is logged and the command
//! still succeeds, since its events are already durable and applied.
//!
//! ## Expansion Rules
//!
//! | Command | Events (after the CommandCreatedEvent) |
//! |---------|----------------------------------------|
//! | `CreateObject` | one `ObjectCreated`, then one `ObjectPropertyChanged` per property that differs from the type's default |
//! | `ChangeObjectProperty` | one `ObjectPropertyChanged`, old/new copied verbatim |
//! | `DeleteObject` | not implemented |
//! | `Custom` | whatever the registered [`ExtraCommandVisitor`] emits |
//!
//! ## Replay
//!
//! [`ObjectStore::replay`] reads the log in key order and applies each event
//! once. Expansion is never re-run. Objects without a live instance are built
//! from their registered factory and loaded from the creation snapshot.
//! Replay does not write to the item store.
//!
//! ## Concurrency
//!
//! Commands are serialized by an async gate, so expansion order is
//! submission order. State sits behind a synchronous mutex that is never held
//! across an `.await`.

use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::TryStreamExt;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::id::Identifier;
use crate::identity::{AttachMode, Attachment, IdentityTable, DEFAULT_SWEEP_INTERVAL};
use crate::metadata::{TypeInfo, TypeMetadataProvider};
use crate::model::{downcast, object_key, Model, ObjectRef, Shared};
use crate::replication::ReplicationTrigger;
use crate::storage::{latest_items, EventStorage, ItemSnapshot, ItemStorage};
use crate::types::{
    ChangeObjectPropertyCommand, Command, CommandCreatedEvent, CommandVisitor,
    CreateObjectCommand, CustomCommand, CustomEvent, DeleteObjectCommand, Event, EventVisitor,
    ExtraCommandVisitor, ExtraEventVisitor, ExtraVisitors, ObjectAddress, ObjectCreatedEvent,
    ObjectDeletedEvent, ObjectPropertyChangedEvent,
};
use crate::value::{PropertyBag, Value};

type CommandExtras = ExtraVisitors<dyn ExtraCommandVisitor<Expansion>>;
type EventExtras = ExtraVisitors<dyn ExtraEventVisitor<ProjectionState>>;

// =============================================================================
// Projection State
// =============================================================================

/// In-memory state derived from the event log.
pub struct ProjectionState {
    identity: IdentityTable,
    collections: HashMap<Identifier, Vec<(Identifier, ObjectRef)>>,
}

impl ProjectionState {
    fn new(sweep_interval: u32) -> Self {
        Self {
            identity: IdentityTable::new(sweep_interval),
            collections: HashMap::new(),
        }
    }

    /// The live object bound to `id`.
    pub fn lookup(&self, id: Identifier) -> Option<ObjectRef> {
        self.identity.lookup(id)
    }

    /// Objects of a collection in creation order.
    pub fn collection(&self, collection_id: Identifier) -> &[(Identifier, ObjectRef)] {
        self.collections
            .get(&collection_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Finds `target_id` in `collection_id`, or fails with
    /// [`Error::UnknownObject`].
    fn object_in(&self, target_id: Identifier, collection_id: Identifier) -> Result<ObjectRef> {
        self.identity
            .lookup(target_id)
            .filter(|object| {
                self.identity
                    .attachment_of(object)
                    .is_some_and(|a| a.collection_id == collection_id && !a.just_created)
            })
            .ok_or(Error::UnknownObject {
                target_id,
                collection_id,
            })
    }
}

// =============================================================================
// Expansion
// =============================================================================

/// Per-command event buffer filled by command visitors.
pub struct Expansion {
    command_id: Identifier,
    container_id: Identifier,
    events: Vec<Event>,
    targets: HashMap<Identifier, ObjectRef>,
}

impl Expansion {
    fn new(command: &Command) -> Self {
        Self {
            command_id: command.command_id(),
            container_id: command.container_id(),
            events: Vec::new(),
            targets: HashMap::new(),
        }
    }

    /// The command being expanded.
    pub fn command_id(&self) -> Identifier {
        self.command_id
    }

    /// The command's container.
    pub fn container_id(&self) -> Identifier {
        self.container_id
    }

    /// Appends an event to the command's output.
    pub fn emit(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Events emitted so far.
    pub fn events(&self) -> &[Event] {
        &self.events
    }
}

/// Rejects an event whose type id is not the registered type of `object`.
fn check_target_type(
    metadata: &dyn TypeMetadataProvider,
    object: &ObjectRef,
    event: &ObjectPropertyChangedEvent,
) -> Result<()> {
    match metadata.type_id_of(object.rust_type()) {
        Some(type_id) if type_id == event.target_type_id => Ok(()),
        _ => Err(Error::validation(format!(
            "object {} is a '{}', not type {}",
            event.target_id,
            object.type_name(),
            event.target_type_id
        ))),
    }
}

fn require(id: Identifier, what: &str, command: &str) -> Result<()> {
    if id.is_nil() {
        return Err(Error::validation(format!("{command} command has an empty {what}")));
    }
    Ok(())
}

struct Expander<'a> {
    state: &'a ProjectionState,
    metadata: &'a dyn TypeMetadataProvider,
    extras: &'a CommandExtras,
}

impl Expander<'_> {
    fn resolve(&self, type_id: Identifier) -> Result<TypeInfo> {
        self.metadata
            .resolve(type_id)
            .ok_or_else(|| Error::validation(format!("type {type_id} is not registered")))
    }
}

impl CommandVisitor<Expansion> for Expander<'_> {
    fn before_visit(&self, command: &Command, _ctx: &mut Expansion) -> Result<()> {
        require(command.command_id(), "command id", command.type_name())?;
        require(command.container_id(), "container id", command.type_name())
    }

    fn visit_create_object(&self, command: &CreateObjectCommand, ctx: &mut Expansion) -> Result<()> {
        require(command.collection_id, "collection id", "createObject")?;
        require(command.target_id, "target id", "createObject")?;
        require(command.target_type_id, "target type id", "createObject")?;
        let info = self.resolve(command.target_type_id)?;

        if let Some(target) = &command.target {
            let target = &target.0;
            if target.rust_type() != info.rust_type {
                return Err(Error::validation(format!(
                    "target is a '{}', but type {} is '{}'",
                    target.type_name(),
                    info.type_id,
                    info.type_name
                )));
            }
            if let Some(attachment) = self.state.identity.attachment_of(target) {
                if attachment.id != command.target_id
                    || attachment.collection_id != command.collection_id
                {
                    return Err(Error::validation(format!(
                        "target is attached as {} in collection {}, command names {} in {}",
                        attachment.id,
                        attachment.collection_id,
                        command.target_id,
                        command.collection_id
                    )));
                }
            }
            ctx.targets.insert(command.target_id, Arc::clone(target));
        }

        ctx.emit(Event::ObjectCreated(ObjectCreatedEvent {
            event_id: Identifier::new_v7(),
            command_id: command.command_id,
            container_id: command.container_id,
            target_type_id: command.target_type_id,
            collection_id: command.collection_id,
            target_id: command.target_id,
            data: command.data.clone(),
        }));
        let defaults = (info.factory)().snapshot();
        for property in command.data.differing_from(&defaults) {
            ctx.emit(Event::ObjectPropertyChanged(ObjectPropertyChangedEvent {
                event_id: Identifier::new_v7(),
                command_id: command.command_id,
                container_id: command.container_id,
                target_type_id: command.target_type_id,
                collection_id: command.collection_id,
                target_id: command.target_id,
                property_name: property.name.clone(),
                old_value: Value::Null,
                new_value: property.value.clone(),
            }));
        }
        Ok(())
    }

    fn visit_change_object_property(
        &self,
        command: &ChangeObjectPropertyCommand,
        ctx: &mut Expansion,
    ) -> Result<()> {
        require(command.collection_id, "collection id", "changeObjectProperty")?;
        require(command.target_id, "target id", "changeObjectProperty")?;
        require(command.target_type_id, "target type id", "changeObjectProperty")?;
        if command.property_name.is_empty() {
            return Err(Error::validation("changeObjectProperty command has no property name"));
        }

        ctx.emit(Event::ObjectPropertyChanged(ObjectPropertyChangedEvent {
            event_id: Identifier::new_v7(),
            command_id: command.command_id,
            container_id: command.container_id,
            target_type_id: command.target_type_id,
            collection_id: command.collection_id,
            target_id: command.target_id,
            property_name: command.property_name.clone(),
            old_value: command.old_value.clone(),
            new_value: command.new_value.clone(),
        }));
        Ok(())
    }

    fn visit_delete_object(&self, _command: &DeleteObjectCommand, _ctx: &mut Expansion) -> Result<()> {
        Err(Error::NotImplemented("deleteObject command".into()))
    }

    fn visit_custom(&self, command: &CustomCommand, ctx: &mut Expansion) -> Result<()> {
        match self.extras.get(&command.type_name) {
            Some(visitor) => visitor.visit(command, ctx),
            None => Err(Error::UnsupportedType(format!(
                "no visitor registered for command '{}'",
                command.type_name
            ))),
        }
    }
}

// =============================================================================
// Dry-Run Check
// =============================================================================

/// Objects an in-flight batch will create, by id.
#[derive(Default)]
struct Pending {
    created: HashMap<Identifier, (Identifier, ObjectRef)>,
}

struct Checker<'a> {
    state: &'a ProjectionState,
    metadata: &'a dyn TypeMetadataProvider,
    extras: &'a EventExtras,
    targets: &'a HashMap<Identifier, ObjectRef>,
}

impl EventVisitor<Pending> for Checker<'_> {
    fn before_visit(&self, event: &Event, _ctx: &mut Pending) -> Result<()> {
        event.validate()
    }

    fn visit_command_created(&self, _event: &CommandCreatedEvent, _ctx: &mut Pending) -> Result<()> {
        Ok(())
    }

    fn visit_object_created(&self, event: &ObjectCreatedEvent, ctx: &mut Pending) -> Result<()> {
        let info = self.metadata.resolve(event.target_type_id).ok_or_else(|| {
            Error::validation(format!("type {} is not registered", event.target_type_id))
        })?;
        if ctx.created.contains_key(&event.target_id) {
            return Err(Error::IdInUse { id: event.target_id });
        }

        let scratch = match self.targets.get(&event.target_id) {
            Some(target) => {
                if let Some(existing) = self.state.identity.lookup(event.target_id) {
                    if object_key(&existing) != object_key(target) {
                        return Err(Error::IdInUse { id: event.target_id });
                    }
                }
                if let Some(attachment) = self.state.identity.attachment_of(target) {
                    if !attachment.just_created {
                        return Err(Error::AlreadyAttached {
                            existing: attachment.id,
                            collection_id: attachment.collection_id,
                        });
                    }
                }
                Arc::clone(target)
            }
            None => {
                if self.state.identity.lookup(event.target_id).is_some() {
                    return Err(Error::IdInUse { id: event.target_id });
                }
                let scratch = (info.factory)();
                scratch.load(&event.data)?;
                scratch
            }
        };
        ctx.created
            .insert(event.target_id, (event.collection_id, scratch));
        Ok(())
    }

    fn visit_object_property_changed(
        &self,
        event: &ObjectPropertyChangedEvent,
        ctx: &mut Pending,
    ) -> Result<()> {
        let object = match ctx.created.get(&event.target_id) {
            Some((collection_id, object)) if *collection_id == event.collection_id => {
                Arc::clone(object)
            }
            Some(_) => {
                return Err(Error::UnknownObject {
                    target_id: event.target_id,
                    collection_id: event.collection_id,
                })
            }
            None => self.state.object_in(event.target_id, event.collection_id)?,
        };
        check_target_type(self.metadata, &object, event)?;
        object.check_property(&event.property_name, &event.new_value)
    }

    fn visit_object_deleted(&self, _event: &ObjectDeletedEvent, _ctx: &mut Pending) -> Result<()> {
        Err(Error::NotImplemented("objectDeleted event".into()))
    }

    fn visit_custom(&self, event: &CustomEvent, _ctx: &mut Pending) -> Result<()> {
        match self.extras.get(&event.type_name) {
            Some(visitor) => visitor.check(event),
            None => Err(unknown_custom_event(event)),
        }
    }
}

fn unknown_custom_event(event: &CustomEvent) -> Error {
    Error::UnsupportedType(format!("no visitor registered for event '{}'", event.type_name))
}

// =============================================================================
// Application
// =============================================================================

struct Applier<'a> {
    metadata: &'a dyn TypeMetadataProvider,
    extras: &'a EventExtras,
    targets: &'a HashMap<Identifier, ObjectRef>,
}

impl EventVisitor<ProjectionState> for Applier<'_> {
    fn before_visit(&self, event: &Event, _state: &mut ProjectionState) -> Result<()> {
        event.validate()
    }

    fn visit_command_created(
        &self,
        _event: &CommandCreatedEvent,
        _state: &mut ProjectionState,
    ) -> Result<()> {
        Ok(())
    }

    fn visit_object_created(
        &self,
        event: &ObjectCreatedEvent,
        state: &mut ProjectionState,
    ) -> Result<()> {
        let object = match self.targets.get(&event.target_id) {
            Some(target) => Arc::clone(target),
            None => {
                let info = self.metadata.resolve(event.target_type_id).ok_or_else(|| {
                    Error::validation(format!("type {} is not registered", event.target_type_id))
                })?;
                let object = (info.factory)();
                object.load(&event.data)?;
                object
            }
        };

        state
            .identity
            .attach(&object, event.target_id, event.collection_id)?;
        state.identity.mark_created(event.target_id);
        state
            .collections
            .entry(event.collection_id)
            .or_default()
            .push((event.target_id, object));
        Ok(())
    }

    fn visit_object_property_changed(
        &self,
        event: &ObjectPropertyChangedEvent,
        state: &mut ProjectionState,
    ) -> Result<()> {
        let object = state.object_in(event.target_id, event.collection_id)?;
        check_target_type(self.metadata, &object, event)?;
        object.set_property(&event.property_name, event.new_value.clone())
    }

    fn visit_object_deleted(
        &self,
        _event: &ObjectDeletedEvent,
        _state: &mut ProjectionState,
    ) -> Result<()> {
        Err(Error::NotImplemented("objectDeleted event".into()))
    }

    fn visit_custom(&self, event: &CustomEvent, state: &mut ProjectionState) -> Result<()> {
        match self.extras.get(&event.type_name) {
            Some(visitor) => visitor.visit(event, state),
            None => Err(unknown_custom_event(event)),
        }
    }
}

// =============================================================================
// Object Store
// =============================================================================

/// Builder for [`ObjectStore`].
pub struct ObjectStoreBuilder {
    storage: Arc<EventStorage>,
    items: Option<Arc<ItemStorage>>,
    metadata: Arc<dyn TypeMetadataProvider>,
    container_id: Identifier,
    sweep_interval: u32,
    trigger: Option<Arc<dyn ReplicationTrigger>>,
    command_extras: CommandExtras,
    event_extras: EventExtras,
}

impl ObjectStoreBuilder {
    /// Container stamped on commands the store builds itself.
    pub fn container_id(mut self, container_id: Identifier) -> Self {
        self.container_id = container_id;
        self
    }

    /// Keeps a snapshot of every created or changed object in `items`.
    pub fn item_store(mut self, items: Arc<ItemStorage>) -> Self {
        self.items = Some(items);
        self
    }

    /// Identity-table maintenance interval (0 disables sweeps).
    pub fn sweep_interval(mut self, sweep_interval: u32) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    /// Hook notified after each acknowledged command.
    pub fn replication_trigger(mut self, trigger: Arc<dyn ReplicationTrigger>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Handles custom commands named `visitor.type_name()`.
    pub fn command_visitor(mut self, visitor: Arc<dyn ExtraCommandVisitor<Expansion>>) -> Self {
        let name = visitor.type_name().to_string();
        self.command_extras.insert(name, visitor);
        self
    }

    /// Handles custom events named `visitor.type_name()`.
    pub fn event_visitor(mut self, visitor: Arc<dyn ExtraEventVisitor<ProjectionState>>) -> Self {
        let name = visitor.type_name().to_string();
        self.event_extras.insert(name, visitor);
        self
    }

    /// Builds the store.
    ///
    /// # Errors
    ///
    /// [`Error::Argument`] if the container id is nil.
    pub fn build(self) -> Result<ObjectStore> {
        if self.container_id.is_nil() {
            return Err(Error::Argument("object store needs a non-nil container id".into()));
        }
        Ok(ObjectStore {
            storage: self.storage,
            items: self.items,
            metadata: self.metadata,
            container_id: self.container_id,
            gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(ProjectionState::new(self.sweep_interval)),
            trigger: self.trigger,
            command_extras: self.command_extras,
            event_extras: self.event_extras,
        })
    }
}

/// Event-sourced object store.
///
/// # Example
///
/// ```rust,ignore
/// let store = ObjectStore::builder(storage, registry).container_id(tenant).build()?;
/// store.replay(None).await?;
///
/// let tasks = store.collection::<Task>("tasks")?;
/// let task = tasks.add(Task { title: "write docs".into(), ..Default::default() }).await?;
/// tasks.set(&task, "done", true).await?;
/// ```
pub struct ObjectStore {
    storage: Arc<EventStorage>,
    items: Option<Arc<ItemStorage>>,
    metadata: Arc<dyn TypeMetadataProvider>,
    container_id: Identifier,
    gate: tokio::sync::Mutex<()>,
    state: Mutex<ProjectionState>,
    trigger: Option<Arc<dyn ReplicationTrigger>>,
    command_extras: CommandExtras,
    event_extras: EventExtras,
}

impl ObjectStore {
    /// Starts building a store over `storage` and `metadata`.
    pub fn builder(
        storage: Arc<EventStorage>,
        metadata: Arc<dyn TypeMetadataProvider>,
    ) -> ObjectStoreBuilder {
        ObjectStoreBuilder {
            storage,
            items: None,
            metadata,
            container_id: Identifier::NIL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            trigger: None,
            command_extras: ExtraVisitors::new(),
            event_extras: ExtraVisitors::new(),
        }
    }

    /// The container stamped on commands built by the store.
    pub fn container_id(&self) -> Identifier {
        self.container_id
    }

    /// The underlying event storage.
    pub fn storage(&self) -> &Arc<EventStorage> {
        &self.storage
    }

    /// The item store, if the store keeps one.
    pub fn item_storage(&self) -> Option<&Arc<ItemStorage>> {
        self.items.as_ref()
    }

    /// Current persisted snapshot of every object in `collection_id`, read
    /// from the item store. Empty when the store keeps no item store.
    pub async fn stored_items(&self, collection_id: Identifier) -> Result<Vec<ItemSnapshot>> {
        match &self.items {
            Some(items) => latest_items(items.as_ref(), collection_id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Expands, persists and applies one command. Returns the stored events.
    ///
    /// # Errors
    ///
    /// - validation, identity and codec errors before anything is written
    /// - storage errors from `append_batch`, with memory left untouched
    pub async fn submit_command(&self, command: Command) -> Result<Vec<Event>> {
        let _gate = self.gate.lock().await;

        let expansion = {
            let state = self.state.lock();
            let mut expansion = Expansion::new(&command);
            expansion.emit(Event::CommandCreated(CommandCreatedEvent {
                event_id: Identifier::new_v7(),
                command_id: command.command_id(),
                container_id: command.container_id(),
                command: command.detached(),
            }));

            let expander = Expander {
                state: &state,
                metadata: self.metadata.as_ref(),
                extras: &self.command_extras,
            };
            command.accept(&expander, &mut expansion)?;

            let checker = Checker {
                state: &state,
                metadata: self.metadata.as_ref(),
                extras: &self.event_extras,
                targets: &expansion.targets,
            };
            let mut pending = Pending::default();
            for event in &expansion.events {
                event.accept(&checker, &mut pending)?;
            }
            expansion
        };
        debug!(
            command = command.type_name(),
            command_id = %command.command_id(),
            events = expansion.events.len(),
            "expanded command"
        );

        self.storage.append_batch(&expansion.events).await?;

        let snapshots = {
            let mut state = self.state.lock();
            let applier = Applier {
                metadata: self.metadata.as_ref(),
                extras: &self.event_extras,
                targets: &expansion.targets,
            };
            for event in &expansion.events {
                event.accept(&applier, &mut *state)?;
            }
            if self.items.is_some() {
                snapshots_of(&state, &expansion.events)
            } else {
                Vec::new()
            }
        };

        if let Some(items) = &self.items {
            if !snapshots.is_empty() {
                if let Err(err) = items.append_batch(&snapshots).await {
                    warn!(
                        command_id = %command.command_id(),
                        error = %err,
                        "failed to persist item snapshots"
                    );
                }
            }
        }

        if let Some(trigger) = &self.trigger {
            trigger.trigger(&expansion.events);
        }
        Ok(expansion.events)
    }

    /// Applies stored events in key order, starting at `from`. Returns how
    /// many were applied.
    pub async fn replay(&self, from: Option<Identifier>) -> Result<usize> {
        let _gate = self.gate.lock().await;
        let no_targets = HashMap::new();
        let applier = Applier {
            metadata: self.metadata.as_ref(),
            extras: &self.event_extras,
            targets: &no_targets,
        };

        let mut events = self.storage.get_all(from);
        let mut applied = 0usize;
        while let Some(event) = events.try_next().await? {
            let mut state = self.state.lock();
            event.accept(&applier, &mut *state)?;
            applied += 1;
        }
        info!(applied, "replay complete");
        Ok(applied)
    }

    /// Resolves the id of `object` per `mode`, outside any collection.
    pub fn get_id(&self, object: &ObjectRef, mode: AttachMode) -> Result<Identifier> {
        self.get_id_in(object, Identifier::NIL, mode)
    }

    /// Resolves the id of `object` per `mode`, attaching into
    /// `collection_id` when the mode allocates.
    pub fn get_id_in(
        &self,
        object: &ObjectRef,
        collection_id: Identifier,
        mode: AttachMode,
    ) -> Result<Identifier> {
        self.state
            .lock()
            .identity
            .get_id(object, collection_id, mode)
    }

    /// Identity of `object`, if attached.
    pub fn attachment_of(&self, object: &ObjectRef) -> Option<Attachment> {
        self.state.lock().identity.attachment_of(object)
    }

    /// The live object bound to `id`.
    pub fn lookup(&self, id: Identifier) -> Option<ObjectRef> {
        self.state.lock().lookup(id)
    }

    /// Objects of `collection_id` in creation order.
    pub fn objects(&self, collection_id: Identifier) -> Vec<(Identifier, ObjectRef)> {
        self.state.lock().collection(collection_id).to_vec()
    }

    /// Creates `object` in `collection_id` with a freshly allocated id.
    pub async fn create(&self, collection_id: Identifier, object: ObjectRef) -> Result<Identifier> {
        let target_type_id = self
            .metadata
            .type_id_of(object.rust_type())
            .ok_or_else(|| {
                Error::validation(format!("type '{}' is not registered", object.type_name()))
            })?;
        let was_attached = self.attachment_of(&object).is_some();
        let target_id = self.get_id_in(&object, collection_id, AttachMode::GetOrAttach)?;
        let command = CreateObjectCommand::new(
            self.container_id,
            ObjectAddress {
                target_type_id,
                collection_id,
                target_id,
            },
            object.snapshot(),
        )
        .with_target(Arc::clone(&object));
        match self.submit_command(Command::CreateObject(command)).await {
            Ok(_) => Ok(target_id),
            Err(err) => {
                if !was_attached {
                    self.state.lock().identity.release(&object);
                }
                Err(err)
            }
        }
    }

    /// Changes one property of an attached object, recording its current
    /// value as the old value.
    pub async fn change_property(
        &self,
        object: &ObjectRef,
        property_name: &str,
        new_value: Value,
    ) -> Result<()> {
        let attachment = self.attachment_of(object).ok_or(Error::NotAttached)?;
        let target_type_id = self
            .metadata
            .type_id_of(object.rust_type())
            .ok_or_else(|| {
                Error::validation(format!("type '{}' is not registered", object.type_name()))
            })?;
        let old_value = object.get_property(property_name)?;
        let command = ChangeObjectPropertyCommand::new(
            self.container_id,
            ObjectAddress {
                target_type_id,
                collection_id: attachment.collection_id,
                target_id: attachment.id,
            },
            property_name,
            old_value,
            new_value,
        );
        self.submit_command(Command::ChangeObjectProperty(command)).await?;
        Ok(())
    }

    /// A typed view of the collection `name` of `T`.
    pub fn collection<T: Model>(&self, name: &str) -> Result<Collection<'_, T>> {
        let type_id = self.metadata.type_id_of(TypeId::of::<T>()).ok_or_else(|| {
            Error::validation(format!(
                "type '{}' is not registered",
                T::descriptor().type_name()
            ))
        })?;
        let collection_id = self.metadata.collection_id(type_id, name)?;
        Ok(Collection {
            store: self,
            collection_id,
            _model: PhantomData,
        })
    }
}

/// One snapshot per object the events created or changed, first touch order.
fn snapshots_of(state: &ProjectionState, events: &[Event]) -> Vec<ItemSnapshot> {
    let mut seen: Vec<Identifier> = Vec::new();
    let mut snapshots = Vec::new();
    for address in events.iter().filter_map(Event::target) {
        if seen.contains(&address.target_id) {
            continue;
        }
        seen.push(address.target_id);
        if let Some(object) = state.lookup(address.target_id) {
            snapshots.push(ItemSnapshot::new(
                address.collection_id,
                address.target_id,
                address.target_type_id,
                object.snapshot(),
            ));
        }
    }
    snapshots
}

// =============================================================================
// Typed Collections
// =============================================================================

/// Live, ordered view of one collection of `T`.
pub struct Collection<'s, T> {
    store: &'s ObjectStore,
    collection_id: Identifier,
    _model: PhantomData<fn() -> T>,
}

impl<T: Model> Collection<'_, T> {
    /// The collection's id.
    pub fn id(&self) -> Identifier {
        self.collection_id
    }

    /// Creates `value` in the collection and returns the live instance.
    pub async fn add(&self, value: T) -> Result<Shared<T>> {
        let shared = crate::model::share(value);
        let object: ObjectRef = shared.clone();
        self.store.create(self.collection_id, object).await?;
        Ok(shared)
    }

    /// Changes `property` of `object` through a command.
    pub async fn set(&self, object: &Shared<T>, property: &str, value: impl Into<Value>) -> Result<()> {
        let object: ObjectRef = object.clone();
        self.store.change_property(&object, property, value.into()).await
    }

    /// All objects in creation order.
    pub fn items(&self) -> Vec<Shared<T>> {
        self.store
            .objects(self.collection_id)
            .into_iter()
            .filter_map(|(_, object)| downcast::<T>(object))
            .collect()
    }

    /// The object with `id`.
    pub fn get(&self, id: Identifier) -> Option<Shared<T>> {
        self.store
            .objects(self.collection_id)
            .into_iter()
            .find(|(object_id, _)| *object_id == id)
            .and_then(|(_, object)| downcast::<T>(object))
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.store.state.lock().collection(self.collection_id).len()
    }

    /// True if the collection has no objects.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The id of `object` if it belongs to this collection.
    pub fn id_of(&self, object: &Shared<T>) -> Option<Identifier> {
        let object: ObjectRef = object.clone();
        self.store
            .attachment_of(&object)
            .filter(|a| a.collection_id == self.collection_id)
            .map(|a| a.id)
    }

    /// Snapshots of every object, for comparisons by value.
    pub fn snapshots(&self) -> Vec<PropertyBag> {
        self.items()
            .iter()
            .map(|item| T::descriptor().snapshot(&item.read()))
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use super::*;
    use crate::metadata::TypeRegistry;
    use crate::model::tests::Note;
    use crate::model::{share, ModelDescriptor};
    use crate::storage::{AppendStorage, CompositeKey, SqliteStorage};
    use crate::value::ValueKind;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Quota {
        limit: Option<i64>,
        label: Option<String>,
        owner: Note,
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
                    .property(
                        "owner",
                        ValueKind::Object,
                        |q| Note::descriptor().to_value(&q.owner),
                        |q, v| {
                            q.owner = Note::descriptor().from_value(v)?;
                            Ok(())
                        },
                    )
            })
        }
    }

    struct Fixture {
        storage: Arc<SqliteStorage<Event>>,
        registry: Arc<TypeRegistry>,
        note_type: Identifier,
        quota_type: Identifier,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(TypeRegistry::new());
        let note_type = registry.register::<Note>().unwrap();
        let quota_type = registry.register::<Quota>().unwrap();
        let storage = Arc::new(SqliteStorage::open_in_memory("events", Event::key).unwrap());
        Fixture {
            storage,
            registry,
            note_type,
            quota_type,
        }
    }

    fn store(f: &Fixture) -> ObjectStore {
        ObjectStore::builder(f.storage.clone(), f.registry.clone())
            .container_id(Identifier::new_v7())
            .build()
            .unwrap()
    }

    async fn stored(f: &Fixture) -> Vec<Event> {
        f.storage.get_all(None).try_collect().await.unwrap()
    }

    #[tokio::test]
    async fn test_create_expands_non_default_properties() {
        let f = fixture();
        let store = store(&f);
        let notes = store.collection::<Note>("inbox").unwrap();

        let note = notes
            .add(Note {
                text: "hello".into(),
                pinned: true,
                views: 0,
            })
            .await
            .unwrap();

        let events = stored(&f).await;
        let kinds: Vec<&str> = events.iter().map(Event::type_name).collect();
        assert_eq!(
            kinds,
            vec!["commandCreated", "objectCreated", "objectPropertyChanged", "objectPropertyChanged"]
        );
        assert_eq!(notes.len(), 1);
        assert_eq!(notes.id_of(&note), events[1].target().map(|a| a.target_id));
        assert!(events.iter().all(|e| e.command_id() == events[0].command_id()));
    }

    #[tokio::test]
    async fn test_change_emits_one_event_with_verbatim_values() {
        let f = fixture();
        let store = store(&f);
        let notes = store.collection::<Note>("inbox").unwrap();
        let note = notes.add(Note::default()).await.unwrap();
        let before = stored(&f).await.len();

        notes.set(&note, "views", 3u32).await.unwrap();

        let events = stored(&f).await;
        assert_eq!(events.len() - before, 2);
        match &events[before + 1] {
            Event::ObjectPropertyChanged(e) => {
                assert_eq!(e.property_name, "views");
                assert_eq!(e.old_value, Value::Unsigned(0));
                assert_eq!(e.new_value, Value::Unsigned(3));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(note.read().views, 3);
    }

    #[tokio::test]
    async fn test_replay_rebuilds_collections() {
        let f = fixture();
        let expected = {
            let store = store(&f);
            let notes = store.collection::<Note>("inbox").unwrap();
            let a = notes.add(Note { text: "a".into(), ..Default::default() }).await.unwrap();
            notes.add(Note { text: "b".into(), pinned: true, views: 2 }).await.unwrap();
            notes.set(&a, "views", 9u32).await.unwrap();
            notes.snapshots()
        };

        let fresh = store(&f);
        let applied = fresh.replay(None).await.unwrap();
        assert_eq!(applied, stored(&f).await.len());
        let notes = fresh.collection::<Note>("inbox").unwrap();
        assert_eq!(notes.snapshots(), expected);
    }

    #[tokio::test]
    async fn test_validation_failure_writes_nothing() {
        let f = fixture();
        let store = store(&f);
        let collection_id = store.collection::<Note>("inbox").unwrap().id();

        let missing_target = CreateObjectCommand::new(
            store.container_id(),
            ObjectAddress {
                target_type_id: f.note_type,
                collection_id,
                target_id: Identifier::NIL,
            },
            PropertyBag::new(),
        );
        assert!(matches!(
            store.submit_command(Command::CreateObject(missing_target)).await,
            Err(Error::Validation(_))
        ));

        let unknown = ChangeObjectPropertyCommand::new(
            store.container_id(),
            ObjectAddress {
                target_type_id: f.note_type,
                collection_id,
                target_id: Identifier::new_v7(),
            },
            "views",
            Value::Null,
            Value::Unsigned(1),
        );
        assert!(matches!(
            store.submit_command(Command::ChangeObjectProperty(unknown)).await,
            Err(Error::UnknownObject { .. })
        ));
        assert!(stored(&f).await.is_empty());
    }

    #[tokio::test]
    async fn test_type_mismatch_and_bad_property_rejected() {
        let f = fixture();
        let store = store(&f);
        let notes = store.collection::<Note>("inbox").unwrap();
        let note = notes.add(Note::default()).await.unwrap();
        let count = stored(&f).await.len();

        assert!(matches!(
            notes.set(&note, "views", "many").await,
            Err(Error::UnsupportedType(_))
        ));
        assert!(matches!(
            notes.set(&note, "colour", 1i64).await,
            Err(Error::UnknownProperty { .. })
        ));
        assert_eq!(stored(&f).await.len(), count);

        let wrong_type = CreateObjectCommand::new(
            store.container_id(),
            ObjectAddress {
                target_type_id: Identifier::new_v7(),
                collection_id: notes.id(),
                target_id: Identifier::new_v7(),
            },
            PropertyBag::new(),
        );
        assert!(store
            .submit_command(Command::CreateObject(wrong_type))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_persistence_failure_leaves_memory_untouched() {
        let f = fixture();
        let store = store(&f);
        let notes = store.collection::<Note>("inbox").unwrap();
        f.storage.close().await.unwrap();

        assert!(matches!(notes.add(Note::default()).await, Err(Error::Closed)));
        assert!(notes.is_empty());

        let note: ObjectRef = share(Note::default());
        assert!(matches!(store.create(notes.id(), note.clone()).await, Err(Error::Closed)));
        assert!(store.attachment_of(&note).is_none());
        assert!(matches!(store.get_id(&note, AttachMode::GetExisting), Err(Error::NotAttached)));
    }

    #[tokio::test]
    async fn test_some_zero_and_empty_survive_expansion_and_replay() {
        let f = fixture();
        let expected = {
            let store = store(&f);
            let quotas = store.collection::<Quota>("limits").unwrap();
            quotas
                .add(Quota {
                    limit: Some(0),
                    label: Some(String::new()),
                    owner: Note::default(),
                })
                .await
                .unwrap();
            quotas.snapshots()
        };

        let events = stored(&f).await;
        let changed: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                Event::ObjectPropertyChanged(c) => Some(c.property_name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(changed, vec!["limit", "label"]);

        let fresh = store(&f);
        fresh.replay(None).await.unwrap();
        let quotas = fresh.collection::<Quota>("limits").unwrap();
        assert_eq!(quotas.snapshots(), expected);
        let replayed = quotas.items();
        assert_eq!(replayed[0].read().limit, Some(0));
        assert_eq!(replayed[0].read().label.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_nested_model_property_is_expanded_changed_and_replayed() {
        let f = fixture();
        let expected = {
            let store = store(&f);
            let quotas = store.collection::<Quota>("limits").unwrap();
            let quota = quotas
                .add(Quota {
                    owner: Note {
                        text: "ops".into(),
                        ..Note::default()
                    },
                    ..Quota::default()
                })
                .await
                .unwrap();
            let reassigned = Note {
                text: "  infra ".into(),
                pinned: true,
                views: 2,
            };
            quotas
                .set(&quota, "owner", Note::descriptor().to_value(&reassigned))
                .await
                .unwrap();
            assert_eq!(quota.read().owner.text, "infra");
            assert!(quota.read().owner.pinned);
            quotas.snapshots()
        };

        let fresh = store(&f);
        fresh.replay(None).await.unwrap();
        let quotas = fresh.collection::<Quota>("limits").unwrap();
        assert_eq!(quotas.snapshots(), expected);
        assert_eq!(quotas.items()[0].read().owner.views, 2);
    }

    #[tokio::test]
    async fn test_property_change_with_wrong_type_id_is_rejected() {
        let f = fixture();
        let store = store(&f);
        let notes = store.collection::<Note>("inbox").unwrap();
        let note = notes.add(Note::default()).await.unwrap();
        let count = stored(&f).await.len();

        let mislabelled = ChangeObjectPropertyCommand::new(
            store.container_id(),
            ObjectAddress {
                target_type_id: f.quota_type,
                collection_id: notes.id(),
                target_id: notes.id_of(&note).unwrap(),
            },
            "views",
            Value::Unsigned(0),
            Value::Unsigned(4),
        );
        assert!(matches!(
            store.submit_command(Command::ChangeObjectProperty(mislabelled)).await,
            Err(Error::Validation(_))
        ));
        assert_eq!(stored(&f).await.len(), count);
        assert_eq!(note.read().views, 0);
    }

    #[tokio::test]
    async fn test_item_store_keeps_latest_snapshot_per_object() {
        let f = fixture();
        let items = Arc::new(SqliteStorage::open_in_memory("items", ItemSnapshot::key).unwrap());
        let store = ObjectStore::builder(f.storage.clone(), f.registry.clone())
            .container_id(Identifier::new_v7())
            .item_store(items.clone())
            .build()
            .unwrap();
        let notes = store.collection::<Note>("inbox").unwrap();

        let a = notes.add(Note { text: "a".into(), ..Default::default() }).await.unwrap();
        notes.add(Note { text: "b".into(), ..Default::default() }).await.unwrap();
        notes.set(&a, "views", 3u32).await.unwrap();

        // Two creations and one change, each stored as its own version.
        let all: Vec<ItemSnapshot> = items.get_all(None).try_collect().await.unwrap();
        assert_eq!(all.len(), 3);
        let a_id = notes.id_of(&a).unwrap();
        let a_versions: Vec<&ItemSnapshot> = all.iter().filter(|i| i.object_id == a_id).collect();
        assert_eq!(a_versions.len(), 2);
        assert!(a_versions[0].key() < a_versions[1].key());
        assert!(a_versions[0].key() > CompositeKey::first(notes.id(), a_id));

        let latest = store.stored_items(notes.id()).await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].object_id, a_id);
        assert_eq!(latest[0].type_id, f.note_type);
        assert_eq!(latest[0].data.get("views"), Some(&Value::Unsigned(3)));
        assert_eq!(latest[1].data.get("text"), Some(&Value::from("b")));
        assert_eq!(latest.iter().map(|i| i.data.clone()).collect::<Vec<_>>(), notes.snapshots());

        // Replay rebuilds memory without writing new versions.
        let fresh = ObjectStore::builder(f.storage.clone(), f.registry.clone())
            .container_id(Identifier::new_v7())
            .item_store(items.clone())
            .build()
            .unwrap();
        fresh.replay(None).await.unwrap();
        let count = items.get_all(None).try_collect::<Vec<_>>().await.unwrap().len();
        assert_eq!(count, 3);
        assert!(store.stored_items(Identifier::new_v7()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_item_store_failure_does_not_fail_the_command() {
        let f = fixture();
        let items = Arc::new(SqliteStorage::open_in_memory("items", ItemSnapshot::key).unwrap());
        let store = ObjectStore::builder(f.storage.clone(), f.registry.clone())
            .container_id(Identifier::new_v7())
            .item_store(items.clone())
            .build()
            .unwrap();
        items.close().await.unwrap();

        let notes = store.collection::<Note>("inbox").unwrap();
        notes.add(Note::default()).await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(stored(&f).await.len(), 2);
    }

    #[tokio::test]
    async fn test_creating_twice_is_rejected() {
        let f = fixture();
        let store = store(&f);
        let notes = store.collection::<Note>("inbox").unwrap();
        let note: ObjectRef = share(Note::default());
        store.create(notes.id(), note.clone()).await.unwrap();
        assert!(store.create(notes.id(), note).await.is_err());
        assert_eq!(notes.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_is_not_implemented() {
        let f = fixture();
        let store = store(&f);
        let notes = store.collection::<Note>("inbox").unwrap();
        let note = notes.add(Note::default()).await.unwrap();
        let delete = DeleteObjectCommand::new(
            store.container_id(),
            ObjectAddress {
                target_type_id: f.note_type,
                collection_id: notes.id(),
                target_id: notes.id_of(&note).unwrap(),
            },
        );
        assert!(matches!(
            store.submit_command(Command::DeleteObject(delete)).await,
            Err(Error::NotImplemented(_))
        ));
    }

    struct Stamp;

    impl ExtraCommandVisitor<Expansion> for Stamp {
        fn type_name(&self) -> &str {
            "test.Stamp"
        }

        fn visit(&self, command: &CustomCommand, ctx: &mut Expansion) -> Result<()> {
            ctx.emit(Event::Custom(CustomEvent {
                event_id: Identifier::new_v7(),
                command_id: command.command_id,
                container_id: command.container_id,
                type_name: "test.Stamped".into(),
                data: command.data.clone(),
            }));
            Ok(())
        }
    }

    struct Stamped;

    impl ExtraEventVisitor<ProjectionState> for Stamped {
        fn type_name(&self) -> &str {
            "test.Stamped"
        }

        fn visit(&self, _event: &CustomEvent, _state: &mut ProjectionState) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_custom_commands_use_registered_visitors() {
        let f = fixture();
        let bare = store(&f);
        let command = CustomCommand::new(bare.container_id(), "test.Stamp", PropertyBag::new());
        assert!(matches!(
            bare.submit_command(Command::Custom(command)).await,
            Err(Error::UnsupportedType(_))
        ));

        let store = ObjectStore::builder(f.storage.clone(), f.registry.clone())
            .container_id(Identifier::new_v7())
            .command_visitor(Arc::new(Stamp))
            .event_visitor(Arc::new(Stamped))
            .build()
            .unwrap();
        let command = CustomCommand::new(
            store.container_id(),
            "test.Stamp",
            PropertyBag::new().with("at", 5i64),
        );
        let events = store.submit_command(Command::Custom(command)).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].type_name(), "test.Stamped");
    }

    #[test]
    fn test_nil_container_is_rejected() {
        let f = fixture();
        assert!(matches!(
            ObjectStore::builder(f.storage.clone(), f.registry.clone()).build(),
            Err(Error::Argument(_))
        ));
    }
}
