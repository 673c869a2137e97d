/// Entity tests
///
/// Dirty tracking, delete / commit / rollback lifecycle and the events each
/// mutation announces.
/// Run with: cargo test --test entity_tests

use memorm::core::SubscriberId;
use memorm::prelude::*;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

fn fields(pairs: &[(&str, Value)]) -> FieldMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn user() -> Entity {
    Entity::new(
        "users",
        fields(&[("id", Value::from(1)), ("name", Value::from("a"))]),
    )
}

fn record(entity: &Entity, kinds: &[EventKind]) -> Rc<RefCell<Vec<Event>>> {
    let log = Rc::new(RefCell::new(Vec::new()));
    let subscriber = SubscriberId::next();
    for kind in kinds {
        let sink = Rc::clone(&log);
        entity.subscribe(
            *kind,
            subscriber,
            Rc::new(move |event: &Event| {
                sink.borrow_mut().push(event.clone());
                Ok(())
            }),
        );
    }
    log
}

#[test]
fn test_dirty_tracking_idempotence() {
    let entity = user();

    entity.set("name", "b").unwrap();
    assert_eq!(entity.changed_fields().unwrap(), fields(&[("name", Value::from("b"))]));

    entity.commit().unwrap();
    assert!(entity.changed_fields().unwrap().is_empty());

    entity.set("name", "b").unwrap();
    assert!(!entity.is_dirty());
    assert!(entity.changed_fields().unwrap().is_empty());
}

#[test]
fn test_concrete_lifecycle_scenario() {
    let entity = user();
    assert!(entity.dirty_fields().is_empty());

    entity.set("name", "b").unwrap();
    assert_eq!(entity.dirty_fields(), BTreeSet::from(["name".to_string()]));

    entity.commit().unwrap();
    assert!(entity.dirty_fields().is_empty());
    assert_eq!(entity.original("name"), Some(Value::from("b")));

    entity.delete().unwrap();
    assert_eq!(entity.get("id"), None);
    assert_eq!(entity.deleted_row_id(), RowId::new(1));

    entity.commit().unwrap();
    assert!(matches!(
        entity.rollback(),
        Err(OrmError::TerminalAccess { .. })
    ));
}

#[test]
fn test_deleted_entity_access() {
    let entity = user();
    entity.delete().unwrap();

    assert!(entity.is_deleted());
    assert!(!entity.has("id"));
    assert_eq!(entity.get("name"), None);
    assert_eq!(entity.deleted_row_id(), RowId::new(1));

    let err = entity.set("name", "x").unwrap_err();
    assert!(matches!(err, OrmError::DeletedAccess { .. }));
    assert!(err.is_recoverable());
    assert!(matches!(
        entity.changed_fields(),
        Err(OrmError::DeletedAccess { .. })
    ));
    assert!(matches!(entity.data(), Err(OrmError::DeletedAccess { .. })));

    // Second delete is a no-op.
    entity.delete().unwrap();
    assert_eq!(entity.deleted_row_id(), RowId::new(1));
}

#[test]
fn test_rollback_undoes_uncommitted_delete() {
    let entity = user();
    entity.delete().unwrap();
    entity.rollback().unwrap();

    assert!(!entity.is_deleted());
    assert_eq!(entity.row_id(), RowId::new(1));
    assert_eq!(entity.get("name"), Some(Value::from("a")));
    assert!(!entity.is_dirty());
    assert_eq!(entity.deleted_row_id(), None);
    entity.set("name", "c").unwrap();
}

#[test]
fn test_terminal_state_rejects_everything_but_reads() {
    let entity = user();
    entity.delete().unwrap();
    entity.commit().unwrap();

    assert!(entity.is_deleted_and_committed());
    assert_eq!(entity.get("id"), None);
    assert!(matches!(entity.set("name", "x"), Err(OrmError::TerminalAccess { .. })));
    assert!(matches!(entity.try_get("name"), Err(OrmError::TerminalAccess { .. })));
    assert!(!entity.rollback().unwrap_err().is_recoverable());
}

#[test]
fn test_rollback_reconciles_through_set() {
    let entity = Entity::new(
        "users",
        fields(&[
            ("age", Value::from(30)),
            ("id", Value::from(1)),
            ("name", Value::from("a")),
        ]),
    );
    entity.set("name", "b").unwrap();
    entity.unset("age").unwrap();
    entity.set("extra", "x").unwrap();

    let log = record(&entity, &[EventKind::DataChanged, EventKind::Rollback]);
    entity.rollback().unwrap();

    let events = log.borrow();
    assert_eq!(
        *events,
        vec![
            Event::DataChanged {
                field: "extra".into(),
                new: Value::Null,
                old: Value::from("x"),
            },
            Event::DataChanged {
                field: "age".into(),
                new: Value::from(30),
                old: Value::Null,
            },
            Event::DataChanged {
                field: "name".into(),
                new: Value::from("a"),
                old: Value::from("b"),
            },
            Event::Rollback(fields(&[
                ("age", Value::from(30)),
                ("id", Value::from(1)),
                ("name", Value::from("a")),
            ])),
        ]
    );
    assert_eq!(entity.get("extra"), None);
    assert!(!entity.is_dirty());
}

#[test]
fn test_set_announces_only_real_changes() {
    let entity = user();
    let log = record(&entity, &[EventKind::DataChanged, EventKind::IdChanged]);

    entity.set("name", "a").unwrap();
    entity.set("missing", Value::Null).unwrap();
    assert!(log.borrow().is_empty());

    entity.set("name", "b").unwrap();
    entity.set_id(Some(2)).unwrap();

    assert_eq!(
        *log.borrow(),
        vec![
            Event::DataChanged {
                field: "name".into(),
                new: Value::from("b"),
                old: Value::from("a"),
            },
            Event::DataChanged {
                field: "id".into(),
                new: Value::from(2),
                old: Value::from(1),
            },
            Event::IdChanged {
                new: Value::from(2),
                old: Value::from(1),
            },
        ]
    );
}

#[test]
fn test_delete_reports_old_id() {
    let entity = user();
    let log = record(&entity, &[EventKind::IdChanged, EventKind::Deleted]);

    entity.delete().unwrap();
    assert_eq!(
        *log.borrow(),
        vec![
            Event::IdChanged {
                new: Value::Null,
                old: Value::from(1),
            },
            Event::Deleted {
                row_id: RowId::new(1),
            },
        ]
    );
}

#[test]
fn test_commit_announces_snapshot() {
    let entity = user();
    let log = record(&entity, &[EventKind::Committed]);

    entity.set("name", "z").unwrap();
    entity.commit().unwrap();
    assert_eq!(
        *log.borrow(),
        vec![Event::Committed(fields(&[
            ("id", Value::from(1)),
            ("name", Value::from("z")),
        ]))]
    );
}

#[test]
fn test_set_data_respects_change_id_too() {
    let entity = user();

    entity
        .set_data(fields(&[("id", Value::from(5)), ("name", Value::from("z"))]), false)
        .unwrap();
    assert_eq!(entity.row_id(), RowId::new(1));
    assert_eq!(entity.get("name"), Some(Value::from("z")));

    entity
        .set_data(fields(&[("id", Value::from(5))]), true)
        .unwrap();
    assert_eq!(entity.row_id(), RowId::new(5));

    entity
        .set_data(fields(&[("id", Value::from(-1))]), true)
        .unwrap();
    assert!(entity.is_new());
    assert_eq!(entity.get("id"), None);
}

#[test]
fn test_force_insert_flag_is_opaque() {
    let entity = user();
    assert!(!entity.force_insert_on_next_save());
    entity.set_force_insert_on_next_save(true);
    assert!(entity.force_insert_on_next_save());
    entity.commit().unwrap();
    assert!(entity.force_insert_on_next_save());
}
