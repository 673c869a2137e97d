/// Manager tests
///
/// End-to-end flows through the in-memory manager: create, save, update,
/// remove, all against a shared repository.
/// Run with: cargo test --test manager_tests

use memorm::prelude::*;

fn fields(pairs: &[(&str, Value)]) -> FieldMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn users() -> MemoryManager {
    MemoryManager::new("users", "main", Repository::default())
}

#[test]
fn test_create_then_save_assigns_row_id() {
    let users = users();
    let draft = users
        .create(fields(&[("id", Value::from(99)), ("name", Value::from("alice"))]))
        .unwrap();
    assert!(draft.is_new());
    assert_eq!(users.repository().count(None), 1);

    users.save(&draft).unwrap();

    let id = draft.row_id().unwrap();
    assert_eq!(id.get(), 1);
    assert!(!draft.is_dirty());
    assert_eq!(users.row(id).unwrap().get("name"), Some(&Value::from("alice")));
    assert!(users.find(id).unwrap().unwrap().same_entity(&draft));
    assert_eq!(users.repository().count(None), 1);
}

#[test]
fn test_save_writes_only_changes() {
    let users = users();
    let id = users.insert_row(fields(&[
        ("name", Value::from("alice")),
        ("nickname", Value::from("al")),
    ])).unwrap();
    let entity = users.find(id).unwrap().unwrap();

    entity.set("name", "alicia").unwrap();
    entity.unset("nickname").unwrap();
    assert_eq!(
        entity.changed_fields().unwrap(),
        fields(&[("name", Value::from("alicia")), ("nickname", Value::Null)])
    );

    users.save(&entity).unwrap();

    let row = users.row(id).unwrap();
    assert_eq!(row.get("name"), Some(&Value::from("alicia")));
    assert_eq!(row.get("nickname"), None);
    assert!(entity.changed_fields().unwrap().is_empty());
}

#[test]
fn test_mapped_and_fresh_instances_diverge_until_saved() {
    let users = users();
    let id = users.insert_row(fields(&[("name", Value::from("alice"))])).unwrap();
    let mapped = users.find(id).unwrap().unwrap();

    mapped.set("name", "changed").unwrap();
    assert_eq!(
        users.find_fresh(id).unwrap().get("name"),
        Some(Value::from("alice"))
    );

    users.save(&mapped).unwrap();
    assert_eq!(
        users.find_fresh(id).unwrap().get("name"),
        Some(Value::from("changed"))
    );
}

#[test]
fn test_remove_is_terminal() {
    let users = users();
    let id = users.insert_row(FieldMap::new()).unwrap();
    let entity = users.find(id).unwrap().unwrap();

    users.remove(&entity).unwrap();

    assert_eq!(users.row_count(), 0);
    assert!(entity.is_deleted_and_committed());
    assert_eq!(entity.deleted_row_id(), Some(id));
    assert!(matches!(
        entity.rollback(),
        Err(OrmError::TerminalAccess { .. })
    ));
    assert!(users.repository().get_by_row_id(id, users.key()).is_none());
    assert!(users.find(id).unwrap().is_none());
}

#[test]
fn test_save_of_deleted_entity_removes_row() {
    let users = users();
    let id = users.insert_row(FieldMap::new()).unwrap();
    let entity = users.find(id).unwrap().unwrap();

    entity.delete().unwrap();
    assert_eq!(users.row_count(), 1);

    users.save(&entity).unwrap();
    assert_eq!(users.row_count(), 0);
    assert!(entity.is_deleted_and_committed());
}

#[test]
fn test_force_insert_keeps_row_id() {
    let users = users();
    let entity = Entity::new(
        "users",
        fields(&[("id", Value::from(10)), ("name", Value::from("imported"))]),
    );
    entity.set_force_insert_on_next_save(true);

    users.save(&entity).unwrap();

    assert_eq!(users.row(RowId::new(10).unwrap()).unwrap().get("name"), Some(&Value::from("imported")));
    assert!(!entity.force_insert_on_next_save());
    assert_eq!(users.insert_row(FieldMap::new()).unwrap().get(), 11);
}

#[test]
fn test_two_connections_map_separately() {
    let repo = Repository::default();
    let main = MemoryManager::new("users", "main", repo.clone());
    let replica = MemoryManager::new("users", "replica", repo.clone());
    let id = main.insert_row(fields(&[("name", Value::from("alice"))])).unwrap();
    replica.insert_row(fields(&[("id", Value::from(id)), ("name", Value::from("alice"))])).unwrap();

    let from_main = main.find(id).unwrap().unwrap();
    let from_replica = replica.find(id).unwrap().unwrap();

    assert!(!from_main.same_entity(&from_replica));
    assert_eq!(repo.count(None), 2);
    assert_eq!(repo.count(Some(main.key())), 1);
}
