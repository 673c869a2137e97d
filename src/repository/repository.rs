use crate::core::{InstanceToken, OrmError, RepoKey, Result, RowId, SubscriberId};
use crate::entity::Entity;
use crate::event::{Announceable, Event, EventKind, Handler};
use crate::repository::RepositoryConfig;
use log::{debug, warn};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

struct Tracked {
    entity: Entity,
    /// Row id as last reported by the entity (`None` while it has none).
    row_id: Option<RowId>,
    /// Key this token occupies in `by_row_id`.
    indexed: Option<RowId>,
}

#[derive(Default)]
struct RepositoryState {
    by_token: HashMap<RepoKey, HashMap<InstanceToken, Tracked>>,
    by_row_id: HashMap<RepoKey, HashMap<RowId, (Entity, InstanceToken)>>,
    token_to_key: HashMap<InstanceToken, RepoKey>,
    by_instance: HashMap<SubscriberId, InstanceToken>,
    count: usize,
    next_token: u64,
}

impl RepositoryState {
    fn issue_token(&mut self) -> InstanceToken {
        self.next_token += 1;
        InstanceToken(self.next_token)
    }

    /// Removes every index entry of `token` and hands back the entity it held.
    fn remove_token(&mut self, token: InstanceToken) -> Option<Entity> {
        let key = self.token_to_key.remove(&token)?;
        let tracked = self.by_token.get_mut(&key).and_then(|m| m.remove(&token));
        if self.by_token.get(&key).is_some_and(HashMap::is_empty) {
            self.by_token.remove(&key);
        }

        let tracked = tracked?;
        if let Some(row_id) = tracked.indexed {
            if let Some(rows) = self.by_row_id.get_mut(&key) {
                if rows.get(&row_id).is_some_and(|(_, t)| *t == token) {
                    rows.remove(&row_id);
                }
                if rows.is_empty() {
                    self.by_row_id.remove(&key);
                }
            }
        }
        self.by_instance.remove(&tracked.entity.instance_id());
        self.count = self.token_to_key.len();
        Some(tracked.entity)
    }

    fn tokens(&self, key: Option<&RepoKey>) -> Vec<InstanceToken> {
        match key {
            Some(key) => self
                .by_token
                .get(key)
                .map(|m| m.keys().copied().collect())
                .unwrap_or_default(),
            None => self.token_to_key.keys().copied().collect(),
        }
    }
}

struct RepositoryInner {
    subscriber: SubscriberId,
    capacity: usize,
    state: RefCell<RepositoryState>,
}

impl Drop for RepositoryInner {
    fn drop(&mut self) {
        for tracked in self.state.get_mut().by_token.values().flat_map(HashMap::values) {
            tracked.entity.announcer().unsubscribe_all(self.subscriber);
        }
    }
}

/// Identity map: at most one tracked entity per `(table, connection, row id)`.
///
/// The repository owns a strong handle to every tracked entity and follows
/// each one's `IdChanged` and `Destroyed` events to keep its indices exact.
/// It is single-threaded; give every thread (or test) its own instance.
#[derive(Clone)]
pub struct Repository(Rc<RepositoryInner>);

impl Default for Repository {
    fn default() -> Self {
        Self::new(RepositoryConfig::default())
    }
}

impl Repository {
    pub fn new(config: RepositoryConfig) -> Self {
        Self(Rc::new(RepositoryInner {
            subscriber: SubscriberId::next(),
            capacity: config.max_entities,
            state: RefCell::new(RepositoryState::default()),
        }))
    }

    /// Repository sized from `MEMORM_MAX_TRACKED_ENTITIES`.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(RepositoryConfig::from_env()?))
    }

    pub fn capacity(&self) -> usize {
        self.0.capacity
    }

    /// Starts tracking `entity` under `key`.
    ///
    /// Reaching capacity is not an error: the whole repository (every key) is
    /// cleared first and the add proceeds.
    pub fn add(&self, entity: &Entity, key: RepoKey) -> Result<InstanceToken> {
        if self.count(None) >= self.0.capacity {
            warn!(
                "Repository reached capacity ({} of {}); clearing all tracked entities",
                self.count(None),
                self.0.capacity
            );
            self.clear(None);
        }

        let token = {
            let mut state = self.0.state.borrow_mut();
            if let Some(token) = state.by_instance.get(&entity.instance_id()) {
                return Err(OrmError::DuplicateToken { key, token: *token });
            }

            let token = state.issue_token();
            if state.token_to_key.contains_key(&token) {
                return Err(OrmError::DuplicateToken { key, token });
            }

            let row_id = if entity.is_deleted() {
                entity.deleted_row_id()
            } else {
                entity.row_id()
            };

            if let Some(row_id) = row_id {
                let rows = state.by_row_id.entry(key.clone()).or_default();
                if rows.contains_key(&row_id) {
                    return Err(OrmError::DuplicateRowId { key, row_id });
                }
                rows.insert(row_id, (entity.clone(), token));
            }

            state.by_token.entry(key.clone()).or_default().insert(
                token,
                Tracked {
                    entity: entity.clone(),
                    row_id: entity.row_id(),
                    indexed: row_id,
                },
            );
            state.token_to_key.insert(token, key.clone());
            state.by_instance.insert(entity.instance_id(), token);
            state.count += 1;
            token
        };

        entity.subscribe(EventKind::IdChanged, self.0.subscriber, self.id_changed_handler(token));
        entity.subscribe(EventKind::Destroyed, self.0.subscriber, self.destroyed_handler(token));
        debug!("Tracking entity {} under {}", token, key);

        Ok(token)
    }

    /// Stops tracking `entity` under `key`. Returns `false` if it was not tracked there.
    pub fn del(&self, entity: &Entity, key: &RepoKey) -> bool {
        let removed = {
            let mut state = self.0.state.borrow_mut();
            let token = state.by_instance.get(&entity.instance_id()).copied();
            match token {
                Some(token) if state.token_to_key.get(&token) == Some(key) => {
                    state.remove_token(token)
                }
                _ => None,
            }
        };

        match removed {
            Some(entity) => {
                debug!("Untracked entity of {}", key);
                self.release(vec![entity]);
                true
            }
            None => false,
        }
    }

    pub fn get_by_row_id(&self, row_id: RowId, key: &RepoKey) -> Option<Entity> {
        self.0
            .state
            .borrow()
            .by_row_id
            .get(key)
            .and_then(|rows| rows.get(&row_id))
            .map(|(entity, _)| entity.clone())
    }

    pub fn get_by_token(&self, token: InstanceToken, key: &RepoKey) -> Option<Entity> {
        self.0
            .state
            .borrow()
            .by_token
            .get(key)
            .and_then(|m| m.get(&token))
            .map(|tracked| tracked.entity.clone())
    }

    pub fn token_of(&self, entity: &Entity) -> Option<InstanceToken> {
        self.0
            .state
            .borrow()
            .by_instance
            .get(&entity.instance_id())
            .copied()
    }

    pub fn contains(&self, entity: &Entity) -> bool {
        self.token_of(entity).is_some()
    }

    /// Tracked entities under `key`, or in total.
    pub fn count(&self, key: Option<&RepoKey>) -> usize {
        let state = self.0.state.borrow();
        match key {
            Some(key) => state.by_token.get(key).map_or(0, HashMap::len),
            None => state.count,
        }
    }

    pub fn keys(&self) -> Vec<RepoKey> {
        let mut keys: Vec<RepoKey> = self.0.state.borrow().by_token.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Forgets every entity under `key`, or everything.
    pub fn clear(&self, key: Option<&RepoKey>) {
        let removed: Vec<Entity> = {
            let mut state = self.0.state.borrow_mut();
            let tokens = state.tokens(key);
            tokens
                .into_iter()
                .filter_map(|token| state.remove_token(token))
                .collect()
        };
        debug!("Cleared {} tracked entities", removed.len());
        self.release(removed);
    }

    /// Unsubscribes from entities that just left the repository.
    ///
    /// Runs after the state borrow is released: dropping the last handle of an
    /// entity announces `Destroyed`, and nothing may re-enter a borrowed state.
    fn release(&self, entities: Vec<Entity>) {
        for entity in entities {
            entity.unsubscribe(EventKind::IdChanged, self.0.subscriber);
            entity.unsubscribe(EventKind::Destroyed, self.0.subscriber);
        }
    }

    fn on_id_changed(
        &self,
        token: InstanceToken,
        new: Option<RowId>,
        old: Option<RowId>,
    ) -> Result<()> {
        let mut guard = self.0.state.borrow_mut();
        let state = &mut *guard;

        let key = state.token_to_key.get(&token).cloned().ok_or_else(|| {
            OrmError::InconsistentState(format!("id change for untracked token {}", token))
        })?;
        let tracked = state
            .by_token
            .get_mut(&key)
            .and_then(|m| m.get_mut(&token))
            .ok_or_else(|| {
                OrmError::InconsistentState(format!("token {} missing from {}", token, key))
            })?;

        // Undo of a change this repository rejected and never applied.
        if tracked.row_id == new && tracked.indexed == new {
            return Ok(());
        }

        if tracked.row_id != old {
            return Err(OrmError::InconsistentState(format!(
                "token {} under {} recorded row id {:?}, event reported {:?}",
                token, key, tracked.row_id, old
            )));
        }

        let rows = state.by_row_id.entry(key.clone()).or_default();
        if let Some(row_id) = new {
            if rows.get(&row_id).is_some_and(|(_, t)| *t != token) {
                return Err(OrmError::RowIdCollision { key, row_id });
            }
        }

        if let Some(previous) = tracked.indexed.take() {
            if rows.get(&previous).is_some_and(|(_, t)| *t == token) {
                rows.remove(&previous);
            }
        }
        if let Some(row_id) = new {
            rows.insert(row_id, (tracked.entity.clone(), token));
        }
        if rows.is_empty() {
            state.by_row_id.remove(&key);
        }

        tracked.indexed = new;
        tracked.row_id = new;
        state.count = state.token_to_key.len();
        debug!("Moved {} entity {} from row {:?} to {:?}", key, token, old, new);
        Ok(())
    }

    fn on_destroyed(&self, token: InstanceToken) {
        let removed = self.0.state.borrow_mut().remove_token(token);
        if let Some(entity) = removed {
            debug!("Destroyed entity {} left the repository", token);
            self.release(vec![entity]);
        }
    }

    fn id_changed_handler(&self, token: InstanceToken) -> Handler {
        let repository: Weak<RepositoryInner> = Rc::downgrade(&self.0);
        Rc::new(move |event: &Event| {
            let Event::IdChanged { new, old } = event else {
                return Ok(());
            };
            match repository.upgrade() {
                Some(inner) => Repository(inner).on_id_changed(
                    token,
                    RowId::from_value(new),
                    RowId::from_value(old),
                ),
                None => Ok(()),
            }
        })
    }

    fn destroyed_handler(&self, token: InstanceToken) -> Handler {
        let repository: Weak<RepositoryInner> = Rc::downgrade(&self.0);
        Rc::new(move |_: &Event| {
            if let Some(inner) = repository.upgrade() {
                Repository(inner).on_destroyed(token);
            }
            Ok(())
        })
    }
}
