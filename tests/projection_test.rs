mod common;

use std::sync::Arc;

use common::{task, Task};
use futures::TryStreamExt;
use synqra::codec::{from_slice, Serializer};
use synqra::types::{ChangeObjectPropertyCommand, ObjectAddress};
use synqra::{
    AttachMode, BroadcastTrigger, Command, Event, Identifier, Model, ObjectRef, ObjectStore,
    Value,
};

fn kinds(events: &[Event]) -> Vec<&str> {
    events.iter().map(Event::type_name).collect()
}

#[tokio::test]
async fn create_and_change_expand_into_expected_events() {
    common::init_tracing();
    let dir = common::temp_dir();

    for backend in common::backends(dir.path()) {
        let store = common::config(backend.clone(), Identifier::new_v7())
            .open(common::registry())
            .await
            .unwrap();
        let tasks = store.collection::<Task>("backlog").unwrap();

        let item = tasks.add(task("ship it", 2)).await.unwrap();
        let created: Vec<Event> = store.storage().get_all(None).try_collect().await.unwrap();
        assert_eq!(
            kinds(&created),
            vec![
                "commandCreated",
                "objectCreated",
                "objectPropertyChanged",
                "objectPropertyChanged"
            ],
            "backend {backend:?}"
        );

        let id = tasks.id_of(&item).unwrap();
        let command = ChangeObjectPropertyCommand::new(
            store.container_id(),
            ObjectAddress {
                target_type_id: created[1].target().unwrap().target_type_id,
                collection_id: tasks.id(),
                target_id: id,
            },
            "done",
            Value::Bool(false),
            Value::Bool(true),
        );
        let events = store
            .submit_command(Command::ChangeObjectProperty(command))
            .await
            .unwrap();
        assert_eq!(kinds(&events), vec!["commandCreated", "objectPropertyChanged"]);
        match &events[1] {
            Event::ObjectPropertyChanged(e) => {
                assert_eq!(e.old_value, Value::Bool(false));
                assert_eq!(e.new_value, Value::Bool(true));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(item.read().done);
    }
}

#[tokio::test]
async fn item_store_tracks_current_state_on_every_backend() {
    common::init_tracing();
    let dir = common::temp_dir();

    for backend in common::backends(dir.path()) {
        let mut config = common::config(backend.clone(), Identifier::new_v7());
        config.item_store = Some(common::item_backend(dir.path(), &backend));
        let store = config.open(common::registry()).await.unwrap();
        let tasks = store.collection::<Task>("backlog").unwrap();

        let first = tasks.add(task("a", 1)).await.unwrap();
        tasks.add(task("b", 0)).await.unwrap();
        tasks.set(&first, "done", true).await.unwrap();

        let items = store.stored_items(tasks.id()).await.unwrap();
        let data: Vec<_> = items.iter().map(|i| i.data.clone()).collect();
        assert_eq!(data, tasks.snapshots(), "backend {backend:?}");
        assert_eq!(items[0].object_id, tasks.id_of(&first).unwrap());
        assert_eq!(items[0].data.get("done"), Some(&Value::Bool(true)));
    }
}

#[tokio::test]
async fn replay_reproduces_live_state_on_every_backend() {
    common::init_tracing();
    let dir = common::temp_dir();
    let container = Identifier::new_v7();

    for backend in common::backends(dir.path()) {
        let config = common::config(backend.clone(), container);
        let (live, ids) = {
            let store = config.open(common::registry()).await.unwrap();
            let tasks = store.collection::<Task>("backlog").unwrap();
            let a = tasks.add(task("write docs", 1)).await.unwrap();
            let b = tasks.add(task("review", 5)).await.unwrap();
            tasks.set(&a, "done", true).await.unwrap();
            tasks.set(&b, "owner", Identifier::new_v7()).await.unwrap();
            tasks.set(&b, "priority", -3i64).await.unwrap();

            let done = store.collection::<Task>("done").unwrap();
            done.add(task("archived", 0)).await.unwrap();

            let ids: Vec<Identifier> = tasks.items().iter().filter_map(|t| tasks.id_of(t)).collect();
            store.storage().close().await.unwrap();
            (tasks.items().iter().map(|t| t.read().clone()).collect::<Vec<_>>(), ids)
        };

        let store = config.open(common::registry()).await.unwrap();
        assert!(store.replay(None).await.unwrap() > 0);
        let tasks = store.collection::<Task>("backlog").unwrap();
        let replayed: Vec<Task> = tasks.items().iter().map(|t| t.read().clone()).collect();
        assert_eq!(replayed, live, "backend {backend:?}");
        for id in ids {
            assert!(tasks.get(id).is_some());
        }
        assert_eq!(store.collection::<Task>("done").unwrap().len(), 1);

        // The replayed store keeps accepting commands.
        let first = tasks.items().remove(0);
        tasks.set(&first, "title", "rewritten").await.unwrap();
        assert_eq!(first.read().title, "rewritten");
    }
}

#[tokio::test]
async fn get_id_modes_follow_attachment() {
    common::init_tracing();
    let dir = common::temp_dir();
    let store = common::config(common::backends(dir.path()).remove(2), Identifier::new_v7())
        .open(common::registry())
        .await
        .unwrap();

    let loose: ObjectRef = synqra::model::share(task("loose", 0));
    assert_eq!(store.get_id(&loose, AttachMode::GetOrNil).unwrap(), Identifier::NIL);
    assert!(store.get_id(&loose, AttachMode::GetExisting).is_err());
    let id = store.get_id(&loose, AttachMode::GetOrAttach).unwrap();
    assert_eq!(store.get_id(&loose, AttachMode::GetExisting).unwrap(), id);
    assert!(store.get_id(&loose, AttachMode::EnsureDetached).is_err());
    assert!(store.get_id(&loose, AttachMode::AttachNew).is_err());

    let tasks = store.collection::<Task>("backlog").unwrap();
    let item = tasks.add(task("attached", 1)).await.unwrap();
    let as_object: ObjectRef = item.clone();
    assert_eq!(
        store.get_id(&as_object, AttachMode::GetExisting).unwrap(),
        tasks.id_of(&item).unwrap()
    );
}

#[tokio::test]
async fn replication_trigger_sees_each_acknowledged_command() {
    common::init_tracing();
    let dir = common::temp_dir();
    let trigger = Arc::new(BroadcastTrigger::default());
    let mut feed = trigger.subscribe();

    let storage = common::backends(dir.path())
        .remove(0)
        .open_events(16)
        .await
        .unwrap();
    let store = ObjectStore::builder(storage, common::registry())
        .container_id(Identifier::new_v7())
        .replication_trigger(trigger.clone())
        .build()
        .unwrap();
    let tasks = store.collection::<Task>("backlog").unwrap();

    let item = tasks.add(task("replicate me", 0)).await.unwrap();
    tasks.set(&item, "done", true).await.unwrap();
    // Rejected commands are never replicated.
    assert!(tasks.set(&item, "missing", 1i64).await.is_err());

    let first = feed.next().await.unwrap().unwrap();
    assert_eq!(first.len(), 3);
    let second = feed.next().await.unwrap().unwrap();
    assert_eq!(kinds(&second), vec!["commandCreated", "objectPropertyChanged"]);

    let stored: Vec<Event> = store.storage().get_all(None).try_collect().await.unwrap();
    assert_eq!(stored.len(), first.len() + second.len());
}

#[test]
fn schema_model_uses_positional_encoding() {
    let mut serializer = Serializer::new();
    let value = Task {
        title: "t".into(),
        done: true,
        priority: -1,
        owner: Identifier::NIL,
    };
    let bytes = serializer.to_vec(&value).unwrap();
    // Schema id 21 as a zigzag varint.
    assert_eq!(bytes[0], 42);
    let decoded: Task = from_slice(&bytes).unwrap();
    assert_eq!(decoded, value);
    assert_eq!(Task::descriptor().schema(), Some(21));
}
