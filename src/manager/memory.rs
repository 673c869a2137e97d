use crate::core::{FieldMap, ID_FIELD, OrmError, RepoKey, Result, RowId, Value};
use crate::entity::{Entity, EntityLookup, RelationDef};
use crate::repository::Repository;
use log::debug;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Manager over an in-memory row table.
///
/// Builds entities from stored rows, registers them with the repository and
/// drives `commit`/`delete` around its own writes. Used as the lookup side of
/// relations pointing at its table.
pub struct MemoryManager {
    key: RepoKey,
    repository: Repository,
    rows: RefCell<BTreeMap<RowId, FieldMap>>,
    relations: Vec<(RelationDef, Rc<dyn EntityLookup>)>,
}

impl MemoryManager {
    pub fn new(
        table: impl Into<String>,
        connection: impl Into<String>,
        repository: Repository,
    ) -> Self {
        Self {
            key: RepoKey::new(table, connection),
            repository,
            rows: RefCell::new(BTreeMap::new()),
            relations: Vec::new(),
        }
    }

    /// Declares a foreign key on every entity this manager builds.
    pub fn with_relation(mut self, def: RelationDef, lookup: Rc<dyn EntityLookup>) -> Self {
        self.relations.push((def, lookup));
        self
    }

    pub fn key(&self) -> &RepoKey {
        &self.key
    }

    pub fn table(&self) -> &str {
        &self.key.table
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn row_count(&self) -> usize {
        self.rows.borrow().len()
    }

    /// Stored copy of a row, bypassing entities entirely.
    pub fn row(&self, id: RowId) -> Option<FieldMap> {
        self.rows.borrow().get(&id).cloned()
    }

    /// Writes a row directly to storage; a missing or non-positive id is assigned.
    pub fn insert_row(&self, mut fields: FieldMap) -> Result<RowId> {
        let id = match fields.get(ID_FIELD).and_then(RowId::from_value) {
            Some(id) => id,
            None => self.next_row_id()?,
        };
        fields.insert(ID_FIELD.to_string(), id.into());
        self.rows.borrow_mut().insert(id, fields);
        Ok(id)
    }

    /// Identity-mapped load: returns the tracked entity if there is one.
    pub fn find(&self, id: RowId) -> Result<Option<Entity>> {
        if let Some(entity) = self.repository.get_by_row_id(id, &self.key) {
            return Ok(Some(entity));
        }

        let Some(fields) = self.row(id) else {
            return Ok(None);
        };
        let entity = self.build(fields);
        self.repository.add(&entity, self.key.clone())?;
        debug!("Loaded {} row {}", self.key, id);
        Ok(Some(entity))
    }

    /// Loads a distinct, untracked instance even if the row is already mapped.
    pub fn find_fresh(&self, id: RowId) -> Option<Entity> {
        self.row(id).map(|fields| self.build(fields))
    }

    /// First row whose `field` equals `value`, identity-mapped.
    pub fn find_by_field(&self, field: &str, value: &Value) -> Result<Option<Entity>> {
        if field == ID_FIELD {
            return match RowId::from_value(value) {
                Some(id) => self.find(id),
                None => Ok(None),
            };
        }

        let id = self
            .rows
            .borrow()
            .iter()
            .find(|(_, row)| row.get(field) == Some(value))
            .map(|(id, _)| *id);
        match id {
            Some(id) => self.find(id),
            None => Ok(None),
        }
    }

    /// New, unsaved entity tracked by token until `save` gives it a row id.
    pub fn create(&self, mut fields: FieldMap) -> Result<Entity> {
        fields.remove(ID_FIELD);
        let entity = self.build(fields);
        self.repository.add(&entity, self.key.clone())?;
        Ok(entity)
    }

    /// Persists the entity's state and commits it.
    ///
    /// New entities (and ones flagged for forced insert) are inserted; others
    /// get their changed fields written. A deleted entity is removed instead.
    pub fn save(&self, entity: &Entity) -> Result<()> {
        if entity.is_deleted() {
            return self.remove(entity);
        }

        let insert = entity.is_new() || entity.force_insert_on_next_save();
        if insert {
            let id = match entity.row_id() {
                Some(id) if entity.force_insert_on_next_save() => id,
                _ => self.next_row_id()?,
            };
            entity.set_id(Some(id.get()))?;
            self.rows.borrow_mut().insert(id, entity.data()?);
            entity.set_force_insert_on_next_save(false);
            debug!("Inserted {} row {}", self.key, id);
        } else if let Some(id) = entity.row_id() {
            let changes = entity.changed_fields()?;
            let mut rows = self.rows.borrow_mut();
            let row = rows.entry(id).or_default();
            for (field, value) in changes {
                if value.is_null() {
                    row.remove(&field);
                } else {
                    row.insert(field, value);
                }
            }
            debug!("Updated {} row {}", self.key, id);
        }

        entity.commit()
    }

    /// Deletes the entity and its row; the deletion is committed immediately.
    pub fn remove(&self, entity: &Entity) -> Result<()> {
        let id = entity.row_id().or(entity.deleted_row_id());
        entity.delete()?;
        if let Some(id) = id {
            self.rows.borrow_mut().remove(&id);
            debug!("Removed {} row {}", self.key, id);
        }
        entity.commit()
    }

    fn build(&self, fields: FieldMap) -> Entity {
        self.relations
            .iter()
            .fold(Entity::builder(self.key.table.clone()).fields(fields), |builder, (def, lookup)| {
                builder.relation(def.clone(), Rc::clone(lookup))
            })
            .build()
    }

    fn next_row_id(&self) -> Result<RowId> {
        let max = self.rows.borrow().keys().next_back().map_or(0, |id| id.get());
        max.checked_add(1)
            .and_then(RowId::new)
            .ok_or_else(|| OrmError::RowIdExhausted(self.key.clone()))
    }
}

impl EntityLookup for MemoryManager {
    fn find_by_field(&self, field: &str, value: &Value) -> Result<Option<Entity>> {
        MemoryManager::find_by_field(self, field, value)
    }
}
