use crate::core::{ID_FIELD, OrmError, Result, SubscriberId, Value};
use crate::entity::{Entity, WeakEntity};
use crate::event::{Announceable, Event, EventKind, Handler};
use log::debug;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Manager-side lookup used to resolve a relation lazily.
///
/// Implementations may hit storage; errors are propagated untouched.
pub trait EntityLookup {
    fn find_by_field(&self, field: &str, value: &Value) -> Result<Option<Entity>>;
}

/// Declaration of a foreign-key field on an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDef {
    /// Foreign-key field on the owning entity.
    pub owner_field: String,
    /// Referenced field on the target, usually its row id.
    pub target_field: String,
    /// Which entity type (and therefore which manager) the target belongs to.
    pub target_kind: String,
}

impl RelationDef {
    /// Relation pointing at the target's `id`.
    pub fn new(owner_field: impl Into<String>, target_kind: impl Into<String>) -> Self {
        Self {
            owner_field: owner_field.into(),
            target_field: ID_FIELD.to_string(),
            target_kind: target_kind.into(),
        }
    }

    pub fn target_field(mut self, field: impl Into<String>) -> Self {
        self.target_field = field.into();
        self
    }
}

/// Lazy, cached pointer from an owner's foreign-key field to the referenced entity.
///
/// The cache is never authoritative: the owner's field is. Whenever a target
/// is cached, the owner field equals the target field; the target's changes
/// are pushed into the owner through a subscription, and a direct write to
/// the owner field that breaks the equality drops the cache.
pub struct Relation {
    def: RelationDef,
    lookup: Rc<dyn EntityLookup>,
    cached: RefCell<Option<WeakEntity>>,
}

impl Relation {
    pub fn new(def: RelationDef, lookup: Rc<dyn EntityLookup>) -> Self {
        Self {
            def,
            lookup,
            cached: RefCell::new(None),
        }
    }

    pub fn def(&self) -> &RelationDef {
        &self.def
    }

    pub fn owner_field(&self) -> &str {
        &self.def.owner_field
    }

    pub fn target_field(&self) -> &str {
        &self.def.target_field
    }

    pub fn target_kind(&self) -> &str {
        &self.def.target_kind
    }

    /// Cached target, without attempting a lookup.
    pub fn cached(&self) -> Option<Entity> {
        self.cached.borrow().as_ref().and_then(WeakEntity::upgrade)
    }

    fn watched_kind(&self) -> EventKind {
        if self.def.target_field == ID_FIELD {
            EventKind::IdChanged
        } else {
            EventKind::DataChanged
        }
    }

    /// Points the relation at `target` (or at nothing) and copies the target's
    /// referenced value into the owner field.
    pub fn set_ref_entity(&self, owner: &Entity, target: Option<&Entity>) -> Result<()> {
        if let Some(previous) = self.cached() {
            if target.is_none_or(|t| !t.same_entity(&previous)) {
                previous.unsubscribe(self.watched_kind(), owner.instance_id());
            }
        }

        *self.cached.borrow_mut() = target.map(Entity::downgrade);

        if let Some(target) = target {
            if !target.same_entity(owner) {
                target.subscribe(self.watched_kind(), owner.instance_id(), self.target_handler(owner));
            }
        }

        let value = match target {
            Some(target) => match target.try_get(&self.def.target_field) {
                Ok(value) => value.unwrap_or(Value::Null),
                Err(OrmError::TerminalAccess { .. }) => Value::Null,
                Err(err) => return Err(err),
            },
            None => Value::Null,
        };
        owner.set(&self.def.owner_field, value)
    }

    /// Cached target, or the result of a fresh lookup by the owner's field value.
    ///
    /// A miss is not remembered: the next call asks the lookup again, so a row
    /// inserted after the miss is still found.
    pub fn get_ref_entity(&self, owner: &Entity) -> Result<Option<Entity>> {
        if let Some(target) = self.cached() {
            return Ok(Some(target));
        }

        let value = match owner.get(&self.def.owner_field) {
            Some(value) if !value.is_null() => value,
            _ => return Ok(None),
        };

        let found = self.lookup.find_by_field(&self.def.target_field, &value)?;
        if let Some(target) = &found {
            self.set_ref_entity(owner, Some(target))?;
        }
        Ok(found)
    }

    pub fn has_ref_entity(&self, owner: &Entity) -> Result<bool> {
        Ok(self.get_ref_entity(owner)?.is_some())
    }

    /// Drops the cached target (and its subscription) without touching the owner field.
    pub fn clear(&self, owner: &Entity) {
        self.release(owner.instance_id());
    }

    /// Called by the owner after its foreign-key field was written directly.
    pub(crate) fn owner_field_was_set(&self, owner: &Entity, value: &Value) {
        let Some(target) = self.cached() else {
            // The target may have been dropped; forget the dead handle.
            self.cached.borrow_mut().take();
            return;
        };

        let current = target.get(&self.def.target_field).unwrap_or(Value::Null);
        if current != *value {
            debug!(
                "Relation {}.{} no longer matches cached {} target; dropping cache",
                owner.table(),
                self.def.owner_field,
                self.def.target_kind
            );
            target.unsubscribe(self.watched_kind(), owner.instance_id());
            self.cached.borrow_mut().take();
        }
    }

    pub(crate) fn release(&self, owner: SubscriberId) {
        let previous = self.cached.borrow_mut().take();
        if let Some(target) = previous.as_ref().and_then(WeakEntity::upgrade) {
            target.unsubscribe(self.watched_kind(), owner);
        }
    }

    fn target_handler(&self, owner: &Entity) -> Handler {
        let owner = owner.downgrade();
        let owner_field = self.def.owner_field.clone();
        let target_field = self.def.target_field.clone();

        Rc::new(move |event: &Event| {
            let new = match event {
                Event::IdChanged { new, .. } => new,
                Event::DataChanged { field, new, .. } if *field == target_field => new,
                _ => return Ok(()),
            };
            match owner.upgrade() {
                Some(owner) if !owner.is_deleted() => owner.set(&owner_field, new.clone()),
                _ => Ok(()),
            }
        })
    }
}

impl fmt::Debug for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relation")
            .field("def", &self.def)
            .field("cached", &self.cached().is_some())
            .finish()
    }
}
