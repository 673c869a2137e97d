use crate::core::{FieldMap, ID_FIELD, OrmError, Result, RowId, SubscriberId, Value};
use crate::entity::relation::{EntityLookup, Relation, RelationDef};
use crate::event::{Announceable, Announcer, Event, EventKind};
use log::{debug, warn};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Deref;
use std::rc::{Rc, Weak};

/// Mutable row state guarded by the entity cell.
#[derive(Debug, Default)]
struct EntityState {
    fields: FieldMap,
    baseline: FieldMap,
    dirty: BTreeSet<String>,
    deleted: bool,
    deleted_and_committed: bool,
    deleted_row_id: Option<RowId>,
    force_insert_on_next_save: bool,
}

impl EntityState {
    /// Absent and `Null` are interchangeable when comparing against the baseline.
    fn differs(current: Option<&Value>, baseline: Option<&Value>) -> bool {
        match (current, baseline) {
            (Some(current), Some(baseline)) => current != baseline,
            (Some(value), None) | (None, Some(value)) => !value.is_null(),
            (None, None) => false,
        }
    }

    fn refresh_dirty(&mut self, field: &str) {
        if Self::differs(self.fields.get(field), self.baseline.get(field)) {
            self.dirty.insert(field.to_string());
        } else {
            self.dirty.remove(field);
        }
    }

    fn ensure_active(&self, table: &str, operation: &str) -> Result<()> {
        if self.deleted_and_committed {
            Err(OrmError::terminal(table, operation))
        } else if self.deleted {
            Err(OrmError::deleted(table, operation))
        } else {
            Ok(())
        }
    }
}

pub(crate) struct EntityCell {
    instance: SubscriberId,
    table: String,
    announcer: Announcer,
    state: RefCell<EntityState>,
    relations: BTreeMap<String, Rc<Relation>>,
    destroyed: Cell<bool>,
}

impl Drop for EntityCell {
    fn drop(&mut self) {
        for relation in self.relations.values() {
            relation.release(self.instance);
        }
        if !self.destroyed.replace(true) {
            if let Err(err) = self.announcer.announce(&Event::Destroyed) {
                warn!(
                    "Destroyed handler failed for entity of table '{}': {}",
                    self.table, err
                );
            }
        }
    }
}

/// Shared handle to an in-memory row.
///
/// Cloning the handle does not copy the row: two `Entity` values are the same
/// entity iff [`Entity::same_entity`] holds.
#[derive(Clone)]
pub struct Entity(Rc<EntityCell>);

/// Non-owning handle; does not keep the entity alive.
#[derive(Clone)]
pub struct WeakEntity(Weak<EntityCell>);

impl WeakEntity {
    pub fn upgrade(&self) -> Option<Entity> {
        self.0.upgrade().map(Entity)
    }
}

impl Announceable for Entity {
    fn announcer(&self) -> &Announcer {
        &self.0.announcer
    }
}

impl Entity {
    pub fn builder(table: impl Into<String>) -> EntityBuilder {
        EntityBuilder::new(table)
    }

    /// Entity without relations whose baseline equals `fields`.
    pub fn new(table: impl Into<String>, fields: FieldMap) -> Self {
        EntityBuilder::new(table).fields(fields).build()
    }

    pub fn table(&self) -> &str {
        &self.0.table
    }

    /// Identity used when this entity subscribes to other announcers.
    pub fn instance_id(&self) -> SubscriberId {
        self.0.instance
    }

    pub fn same_entity(&self, other: &Entity) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> WeakEntity {
        WeakEntity(Rc::downgrade(&self.0))
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Current value of `field`. Never fails, even on a deleted entity.
    pub fn get(&self, field: &str) -> Option<Value> {
        self.0.state.borrow().fields.get(field).cloned()
    }

    /// `true` if `field` is present and not `Null`.
    pub fn has(&self, field: &str) -> bool {
        self.0
            .state
            .borrow()
            .fields
            .get(field)
            .is_some_and(|v| !v.is_null())
    }

    /// Like [`Entity::get`], but refuses to read a deleted-and-committed entity.
    pub fn try_get(&self, field: &str) -> Result<Option<Value>> {
        let state = self.0.state.borrow();
        if state.deleted_and_committed {
            return Err(OrmError::terminal(&self.0.table, &format!("read '{}'", field)));
        }
        Ok(state.fields.get(field).cloned())
    }

    pub fn row_id(&self) -> Option<RowId> {
        self.0
            .state
            .borrow()
            .fields
            .get(ID_FIELD)
            .and_then(RowId::from_value)
    }

    /// No row id assigned yet.
    pub fn is_new(&self) -> bool {
        self.row_id().is_none()
    }

    /// Snapshot of all current values.
    pub fn data(&self) -> Result<FieldMap> {
        let state = self.0.state.borrow();
        state.ensure_active(&self.0.table, "read data")?;
        Ok(state.fields.clone())
    }

    /// Baseline value of `field` as of the last commit (or construction).
    pub fn original(&self, field: &str) -> Option<Value> {
        self.0.state.borrow().baseline.get(field).cloned()
    }

    pub fn is_dirty(&self) -> bool {
        !self.0.state.borrow().dirty.is_empty()
    }

    pub fn dirty_fields(&self) -> BTreeSet<String> {
        self.0.state.borrow().dirty.clone()
    }

    pub fn changed_fields(&self) -> Result<FieldMap> {
        let state = self.0.state.borrow();
        state.ensure_active(&self.0.table, "read changed fields")?;
        Ok(state
            .dirty
            .iter()
            .map(|f| (f.clone(), state.fields.get(f).cloned().unwrap_or(Value::Null)))
            .collect())
    }

    pub fn is_deleted(&self) -> bool {
        self.0.state.borrow().deleted
    }

    pub fn is_deleted_and_committed(&self) -> bool {
        self.0.state.borrow().deleted_and_committed
    }

    /// Row id the entity had when `delete` was called.
    pub fn deleted_row_id(&self) -> Option<RowId> {
        self.0.state.borrow().deleted_row_id
    }

    pub fn force_insert_on_next_save(&self) -> bool {
        self.0.state.borrow().force_insert_on_next_save
    }

    pub fn set_force_insert_on_next_save(&self, force: bool) {
        self.0.state.borrow_mut().force_insert_on_next_save = force;
    }

    pub fn relation(&self, field: &str) -> Option<Rc<Relation>> {
        self.0.relations.get(field).cloned()
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Stores `value` in `field`.
    ///
    /// `DataChanged` (and `IdChanged` for `id`) is announced only when the
    /// stored value actually changes. If a subscriber rejects the change, the
    /// previous value is put back, subscribers are sent the inverse events so
    /// those that already applied the change can undo it, and the error is
    /// returned.
    pub fn set(&self, field: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let previous = {
            let mut state = self.0.state.borrow_mut();
            state.ensure_active(&self.0.table, &format!("set '{}'", field))?;
            let previous = state.fields.insert(field.to_string(), value.clone());
            state.refresh_dirty(field);
            previous
        };

        let old = previous.clone().unwrap_or(Value::Null);
        if old != value {
            if let Err(err) = self.announce(&Event::DataChanged {
                field: field.to_string(),
                new: value.clone(),
                old: old.clone(),
            }) {
                self.revert(field, previous, &value, false);
                return Err(err);
            }

            if field == ID_FIELD {
                if let Err(err) = self.announce(&Event::IdChanged {
                    new: value.clone(),
                    old,
                }) {
                    self.revert(field, previous, &value, true);
                    return Err(err);
                }
            }
        }

        if let Some(relation) = self.0.relations.get(field) {
            relation.owner_field_was_set(self, &value);
        }
        Ok(())
    }

    /// Sets `field` to `Null`, then removes it physically.
    pub fn unset(&self, field: &str) -> Result<()> {
        self.set(field, Value::Null)?;
        let mut state = self.0.state.borrow_mut();
        state.fields.remove(field);
        state.refresh_dirty(field);
        Ok(())
    }

    /// Assigns the row id. Non-positive ids (and `None`) remove the `id` field.
    pub fn set_id(&self, id: Option<i64>) -> Result<()> {
        match id.and_then(RowId::new) {
            Some(id) => self.set(ID_FIELD, id),
            None => self.unset(ID_FIELD),
        }
    }

    /// Bulk update. Keys absent from `data` are left alone; `id` is only
    /// touched when `change_id_too` is set.
    pub fn set_data(&self, data: FieldMap, change_id_too: bool) -> Result<()> {
        for (field, value) in data {
            if field == ID_FIELD {
                if change_id_too {
                    self.set_id(RowId::from_value(&value).map(RowId::get))?;
                }
            } else {
                self.set(&field, value)?;
            }
        }
        Ok(())
    }

    /// Convenience for `relation(field).get_ref_entity(self)`.
    pub fn ref_entity(&self, field: &str) -> Result<Option<Entity>> {
        match self.0.relations.get(field) {
            Some(relation) => relation.get_ref_entity(self),
            None => Ok(None),
        }
    }

    /// Convenience for `relation(field).set_ref_entity(self, target)`.
    pub fn set_ref_entity(&self, field: &str, target: Option<&Entity>) -> Result<()> {
        match self.0.relations.get(field) {
            Some(relation) => relation.set_ref_entity(self, target),
            None => Err(OrmError::InconsistentState(format!(
                "table '{}' declares no relation on field '{}'",
                self.0.table, field
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Marks the entity deleted. A second call is a no-op.
    ///
    /// The id is removed through `set_id` while the entity is still active, so
    /// `IdChanged` subscribers see the real old id.
    pub fn delete(&self) -> Result<()> {
        if self.is_deleted() {
            return Ok(());
        }
        let row_id = self.row_id();
        self.set_id(None)?;

        {
            let mut state = self.0.state.borrow_mut();
            state.deleted_row_id = row_id;
            state.deleted = true;
            state.fields.clear();
            state.dirty = state
                .baseline
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(f, _)| f.clone())
                .collect();
        }
        debug!("Deleted entity of table '{}' (row id {:?})", self.0.table, row_id);

        self.announce(&Event::Deleted { row_id })
    }

    /// Accepts the current state as the new baseline.
    ///
    /// Committing a deleted entity makes the deletion permanent.
    pub fn commit(&self) -> Result<()> {
        let snapshot = {
            let mut state = self.0.state.borrow_mut();
            if state.deleted {
                state.deleted_and_committed = true;
            }
            state.baseline = state.fields.clone();
            state.dirty.clear();
            state.fields.clone()
        };

        if self.has_subscribers(EventKind::Committed) {
            self.announce(&Event::Committed(snapshot))?;
        }
        Ok(())
    }

    /// Restores the baseline, undoing an uncommitted delete as well.
    ///
    /// Every field change goes through `set`, so relations and subscribers see
    /// the restored values.
    pub fn rollback(&self) -> Result<()> {
        let baseline = {
            let mut state = self.0.state.borrow_mut();
            if state.deleted_and_committed {
                return Err(OrmError::terminal(&self.0.table, "rollback"));
            }
            state.deleted = false;
            state.deleted_row_id = None;
            state.baseline.clone()
        };

        let added: Vec<String> = self
            .0
            .state
            .borrow()
            .fields
            .keys()
            .filter(|f| !baseline.contains_key(*f))
            .cloned()
            .collect();
        for field in added {
            self.unset(&field)?;
        }

        for (field, value) in &baseline {
            if self.get(field).as_ref() != Some(value) {
                self.set(field, value.clone())?;
            }
        }

        let snapshot = {
            let mut state = self.0.state.borrow_mut();
            state.dirty.clear();
            state.fields.clone()
        };
        debug!("Rolled back entity of table '{}'", self.0.table);

        if self.has_subscribers(EventKind::Rollback) {
            self.announce(&Event::Rollback(snapshot))?;
        }
        Ok(())
    }

    /// Announces `Destroyed` exactly once; later calls (and the final drop) are silent.
    pub fn dispose(&self) -> Result<()> {
        if self.0.destroyed.replace(true) {
            return Ok(());
        }
        self.announce(&Event::Destroyed)
    }

    pub fn is_disposed(&self) -> bool {
        self.0.destroyed.get()
    }

    /// Undoes a rejected write of `field`.
    ///
    /// The stored value goes back first, then the inverse `DataChanged` (and
    /// `IdChanged`, if it was sent) is announced. Failures while undoing are
    /// logged; the caller reports the original error.
    fn revert(&self, field: &str, previous: Option<Value>, rejected: &Value, id_announced: bool) {
        let restored = previous.clone().unwrap_or(Value::Null);
        {
            let mut state = self.0.state.borrow_mut();
            match previous {
                Some(value) => {
                    state.fields.insert(field.to_string(), value);
                }
                None => {
                    state.fields.remove(field);
                }
            }
            state.refresh_dirty(field);
        }
        debug!(
            "Reverting rejected write of {}.{} back to {}",
            self.0.table, field, restored
        );

        let mut inverse = vec![Event::DataChanged {
            field: field.to_string(),
            new: restored.clone(),
            old: rejected.clone(),
        }];
        if id_announced {
            inverse.push(Event::IdChanged {
                new: restored,
                old: rejected.clone(),
            });
        }
        for event in &inverse {
            if let Err(err) = self.announce(event) {
                warn!(
                    "Subscriber failed while undoing {:?} on table '{}': {}",
                    event.kind(),
                    self.0.table,
                    err
                );
            }
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state.borrow();
        f.debug_struct("Entity")
            .field("table", &self.0.table)
            .field("instance", &self.0.instance)
            .field("fields", &state.fields)
            .field("dirty", &state.dirty)
            .field("deleted", &state.deleted)
            .finish()
    }
}

/// Builds an entity with its initial field map and declared relations.
pub struct EntityBuilder {
    table: String,
    fields: FieldMap,
    relations: Vec<(RelationDef, Rc<dyn EntityLookup>)>,
}

impl EntityBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            fields: FieldMap::new(),
            relations: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn fields(mut self, fields: FieldMap) -> Self {
        self.fields.extend(fields);
        self
    }

    pub fn relation(mut self, def: RelationDef, lookup: Rc<dyn EntityLookup>) -> Self {
        self.relations.push((def, lookup));
        self
    }

    pub fn build(self) -> Entity {
        let relations = self
            .relations
            .into_iter()
            .map(|(def, lookup)| (def.owner_field.clone(), Rc::new(Relation::new(def, lookup))))
            .collect();

        Entity(Rc::new(EntityCell {
            instance: SubscriberId::next(),
            table: self.table,
            announcer: Announcer::new(),
            state: RefCell::new(EntityState {
                baseline: self.fields.clone(),
                fields: self.fields,
                ..EntityState::default()
            }),
            relations,
            destroyed: Cell::new(false),
        }))
    }
}

/// Disposes the wrapped entity when the guard goes out of scope.
pub struct DisposeGuard {
    entity: Entity,
}

impl DisposeGuard {
    pub fn new(entity: Entity) -> Self {
        Self { entity }
    }
}

impl Deref for DisposeGuard {
    type Target = Entity;

    fn deref(&self) -> &Entity {
        &self.entity
    }
}

impl Drop for DisposeGuard {
    fn drop(&mut self) {
        if let Err(err) = self.entity.dispose() {
            warn!(
                "Failed to dispose entity of table '{}': {}",
                self.entity.table(),
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> Entity {
        Entity::builder("users")
            .field("id", 1)
            .field("name", "a")
            .build()
    }

    #[test]
    fn test_dirty_rule_for_absent_baseline() {
        let entity = user();
        entity.set("nickname", Value::Null).unwrap();
        assert!(!entity.is_dirty());

        entity.set("nickname", "x").unwrap();
        assert_eq!(entity.dirty_fields(), BTreeSet::from(["nickname".to_string()]));

        entity.unset("nickname").unwrap();
        assert!(!entity.is_dirty());
        assert!(entity.get("nickname").is_none());
    }

    #[test]
    fn test_set_back_to_baseline_clears_dirty() {
        let entity = user();
        entity.set("name", "b").unwrap();
        assert!(entity.is_dirty());
        entity.set("name", "a").unwrap();
        assert!(!entity.is_dirty());
    }

    #[test]
    fn test_set_id_normalizes() {
        let entity = user();
        entity.set_id(Some(0)).unwrap();
        assert!(entity.get("id").is_none());
        assert!(entity.is_new());

        entity.set_id(Some(5)).unwrap();
        assert_eq!(entity.row_id(), RowId::new(5));
    }

    #[test]
    fn test_delete_keeps_dirty_consistent() {
        let entity = user();
        entity.delete().unwrap();
        assert_eq!(
            entity.dirty_fields(),
            BTreeSet::from(["id".to_string(), "name".to_string()])
        );
    }

    #[test]
    fn test_rejected_id_change_is_reverted() {
        let entity = user();
        let guard = SubscriberId::next();
        entity.subscribe(
            EventKind::IdChanged,
            guard,
            Rc::new(|_: &Event| Err(OrmError::InconsistentState("no".into()))),
        );

        assert!(entity.set_id(Some(2)).is_err());
        assert_eq!(entity.row_id(), RowId::new(1));
        assert!(!entity.is_dirty());
    }

    #[test]
    fn test_dispose_once() {
        let entity = user();
        let count = Rc::new(Cell::new(0));
        let seen = Rc::clone(&count);
        entity.subscribe(
            EventKind::Destroyed,
            SubscriberId::next(),
            Rc::new(move |_: &Event| {
                seen.set(seen.get() + 1);
                Ok(())
            }),
        );

        entity.dispose().unwrap();
        entity.dispose().unwrap();
        drop(entity);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_drop_announces_destroyed() {
        let count = Rc::new(Cell::new(0));
        {
            let entity = user();
            let seen = Rc::clone(&count);
            entity.subscribe(
                EventKind::Destroyed,
                SubscriberId::next(),
                Rc::new(move |_: &Event| {
                    seen.set(seen.get() + 1);
                    Ok(())
                }),
            );
            let _second_handle = entity.clone();
        }
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_dispose_guard() {
        let entity = user();
        {
            let guard = DisposeGuard::new(entity.clone());
            assert_eq!(guard.table(), "users");
        }
        assert!(entity.is_disposed());
    }
}
