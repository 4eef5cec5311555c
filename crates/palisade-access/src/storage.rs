//! Entity storage and change notifications.
//!
//! Readers get `Arc` snapshots of entities; a writer replaces the entity
//! wholesale and then notifies subscribers. Notifications carry
//! `(id, Some(new entity))` for inserts and updates and `(id, None)` for
//! removals. Handlers always run after every storage lock is released, so a
//! handler may read the storage or subscribe again.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use palisade_types::{EntityId, EntityKind};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::entities::Entity;
use crate::error::{AccessError, Result};

/// Callback invoked on entity changes.
pub type ChangeHandler = Arc<dyn Fn(EntityId, Option<Arc<Entity>>) + Send + Sync>;

/// Store of access entities keyed by id and by `(kind, name)`.
pub trait AccessStorage: Send + Sync {
    /// Looks an entity up by kind and name.
    fn find(&self, kind: EntityKind, name: &str) -> Option<EntityId>;

    fn try_read(&self, id: EntityId) -> Option<Arc<Entity>>;

    fn read(&self, id: EntityId) -> Result<Arc<Entity>> {
        self.try_read(id).ok_or(AccessError::EntityNotFound(id))
    }

    /// Reads an entity and checks its kind.
    fn read_kind(&self, id: EntityId, kind: EntityKind) -> Result<Arc<Entity>> {
        let entity = self.read(id)?;
        if entity.kind() == kind {
            Ok(entity)
        } else {
            Err(AccessError::WrongEntityKind { id, expected: kind })
        }
    }

    fn ids_of_kind(&self, kind: EntityKind) -> Vec<EntityId>;

    /// Inserts a new entity; fails if its name is taken.
    fn insert(&self, entity: Entity) -> Result<EntityId>;

    /// Inserts a new entity or replaces the one with the same kind and name,
    /// keeping its id.
    fn insert_or_replace(&self, entity: Entity) -> EntityId;

    /// Applies `f` to a copy of the entity and stores the result.
    ///
    /// Nothing is stored when `f` fails, changes the entity's kind or renames
    /// it onto a taken name. `f` may run under the storage's write lock and
    /// must not call back into the storage.
    fn update(&self, id: EntityId, f: &mut dyn FnMut(&mut Entity) -> Result<()>) -> Result<()>;

    fn remove(&self, id: EntityId) -> Result<()>;

    /// Calls `handler` whenever the entity `id` changes.
    fn subscribe(&self, id: EntityId, handler: ChangeHandler) -> Subscription;

    /// Calls `handler` whenever any entity of `kind` changes.
    fn subscribe_kind(&self, kind: EntityKind, handler: ChangeHandler) -> Subscription;
}

// ============================================================================
// Subscription
// ============================================================================

/// Keeps a change handler registered; dropping it unsubscribes.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// A subscription that holds nothing.
    pub fn empty() -> Self {
        Self { unsubscribe: None }
    }

    pub fn is_active(&self) -> bool {
        self.unsubscribe.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

// ============================================================================
// In-memory storage
// ============================================================================

#[derive(Clone, Default)]
struct Snapshot {
    entities: HashMap<EntityId, Arc<Entity>>,
    names: HashMap<(EntityKind, String), EntityId>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum Topic {
    Entity(EntityId),
    Kind(EntityKind),
}

#[derive(Default)]
struct Subscribers {
    next_token: u64,
    handlers: HashMap<Topic, Vec<(u64, ChangeHandler)>>,
}

impl Subscribers {
    fn add(&mut self, topic: Topic, handler: ChangeHandler) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        self.handlers.entry(topic).or_default().push((token, handler));
        token
    }

    fn remove(&mut self, topic: Topic, token: u64) {
        if let Some(list) = self.handlers.get_mut(&topic) {
            list.retain(|(t, _)| *t != token);
            if list.is_empty() {
                self.handlers.remove(&topic);
            }
        }
    }

    fn collect(&self, id: EntityId, kind: EntityKind) -> Vec<ChangeHandler> {
        [Topic::Entity(id), Topic::Kind(kind)]
            .iter()
            .filter_map(|topic| self.handlers.get(topic))
            .flatten()
            .map(|(_, handler)| Arc::clone(handler))
            .collect()
    }
}

type Notification = (Vec<ChangeHandler>, EntityId, Option<Arc<Entity>>);

/// Storage kept entirely in memory.
///
/// The entity map is a copy-on-write snapshot: readers clone an `Arc` and
/// never wait on writers for longer than that clone.
#[derive(Default)]
pub struct MemoryStorage {
    snapshot: RwLock<Arc<Snapshot>>,
    subscribers: Arc<Mutex<Subscribers>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn subscribe_topic(&self, topic: Topic, handler: ChangeHandler) -> Subscription {
        let token = self.subscribers.lock().add(topic, handler);
        let subscribers: Weak<Mutex<Subscribers>> = Arc::downgrade(&self.subscribers);
        Subscription::new(move || {
            if let Some(subscribers) = subscribers.upgrade() {
                subscribers.lock().remove(topic, token);
            }
        })
    }

    fn notification(&self, id: EntityId, kind: EntityKind, entity: Option<Arc<Entity>>) -> Notification {
        (self.subscribers.lock().collect(id, kind), id, entity)
    }

    fn notify((handlers, id, entity): Notification) {
        for handler in handlers {
            handler(id, entity.clone());
        }
    }
}

impl AccessStorage for MemoryStorage {
    fn find(&self, kind: EntityKind, name: &str) -> Option<EntityId> {
        self.snapshot.read().names.get(&(kind, name.to_string())).copied()
    }

    fn try_read(&self, id: EntityId) -> Option<Arc<Entity>> {
        self.snapshot.read().entities.get(&id).cloned()
    }

    fn ids_of_kind(&self, kind: EntityKind) -> Vec<EntityId> {
        let snapshot = Arc::clone(&*self.snapshot.read());
        let mut ids: Vec<EntityId> = snapshot
            .entities
            .iter()
            .filter(|(_, entity)| entity.kind() == kind)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn insert(&self, entity: Entity) -> Result<EntityId> {
        let kind = entity.kind();
        let name = entity.name();
        let entity = Arc::new(entity);
        let id = EntityId::generate();

        let notification = {
            let mut guard = self.snapshot.write();
            if guard.names.contains_key(&(kind, name.clone())) {
                return Err(AccessError::NameCollision { kind, name });
            }
            let snapshot = Arc::make_mut(&mut *guard);
            snapshot.names.insert((kind, name.clone()), id);
            snapshot.entities.insert(id, Arc::clone(&entity));
            self.notification(id, kind, Some(entity))
        };

        info!(%id, %kind, %name, "entity inserted");
        Self::notify(notification);
        Ok(id)
    }

    fn insert_or_replace(&self, entity: Entity) -> EntityId {
        let kind = entity.kind();
        let name = entity.name();
        let entity = Arc::new(entity);

        let (id, notification) = {
            let mut guard = self.snapshot.write();
            let existing = guard.names.get(&(kind, name.clone())).copied();
            let id = existing.unwrap_or_else(EntityId::generate);
            let snapshot = Arc::make_mut(&mut *guard);
            snapshot.names.insert((kind, name.clone()), id);
            snapshot.entities.insert(id, Arc::clone(&entity));
            (id, self.notification(id, kind, Some(entity)))
        };

        info!(%id, %kind, %name, "entity stored");
        Self::notify(notification);
        id
    }

    fn update(&self, id: EntityId, f: &mut dyn FnMut(&mut Entity) -> Result<()>) -> Result<()> {
        let (kind, name, notification) = {
            let mut guard = self.snapshot.write();
            let current = guard
                .entities
                .get(&id)
                .ok_or(AccessError::EntityNotFound(id))?;
            let kind = current.kind();
            let old_name = current.name();

            let mut updated = Entity::clone(current);
            f(&mut updated)?;
            if updated.kind() != kind {
                return Err(AccessError::WrongEntityKind { id, expected: kind });
            }
            let name = updated.name();
            if name != old_name && guard.names.contains_key(&(kind, name.clone())) {
                return Err(AccessError::NameCollision { kind, name });
            }

            let updated = Arc::new(updated);
            let snapshot = Arc::make_mut(&mut *guard);
            if name != old_name {
                snapshot.names.remove(&(kind, old_name));
                snapshot.names.insert((kind, name.clone()), id);
            }
            snapshot.entities.insert(id, Arc::clone(&updated));
            (kind, name, self.notification(id, kind, Some(updated)))
        };

        info!(%id, %kind, %name, "entity updated");
        Self::notify(notification);
        Ok(())
    }

    fn remove(&self, id: EntityId) -> Result<()> {
        let (kind, name, notification) = {
            let mut guard = self.snapshot.write();
            let snapshot = Arc::make_mut(&mut *guard);
            let entity = snapshot
                .entities
                .remove(&id)
                .ok_or(AccessError::EntityNotFound(id))?;
            let kind = entity.kind();
            let name = entity.name();
            snapshot.names.remove(&(kind, name.clone()));
            (kind, name, self.notification(id, kind, None))
        };

        info!(%id, %kind, %name, "entity removed");
        Self::notify(notification);
        Ok(())
    }

    fn subscribe(&self, id: EntityId, handler: ChangeHandler) -> Subscription {
        debug!(%id, "subscribed to entity");
        self.subscribe_topic(Topic::Entity(id), handler)
    }

    fn subscribe_kind(&self, kind: EntityKind, handler: ChangeHandler) -> Subscription {
        debug!(%kind, "subscribed to entity kind");
        self.subscribe_topic(Topic::Kind(kind), handler)
    }
}

impl fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("entities", &self.len())
            .finish_non_exhaustive()
    }
}

/// Storage whose first read of one entity is followed at once by an edit
/// of that entity, as if another writer got in right after the read.
#[cfg(test)]
pub(crate) struct RacingWriterStorage {
    inner: Arc<MemoryStorage>,
    target: EntityId,
    edit: Mutex<Option<Box<dyn FnMut(&mut Entity) + Send>>>,
}

#[cfg(test)]
impl RacingWriterStorage {
    pub(crate) fn new(
        inner: Arc<MemoryStorage>,
        target: EntityId,
        edit: impl FnMut(&mut Entity) + Send + 'static,
    ) -> Self {
        Self {
            inner,
            target,
            edit: Mutex::new(Some(Box::new(edit))),
        }
    }

    pub(crate) fn raced(&self) -> bool {
        self.edit.lock().is_none()
    }
}

#[cfg(test)]
impl AccessStorage for RacingWriterStorage {
    fn find(&self, kind: EntityKind, name: &str) -> Option<EntityId> {
        self.inner.find(kind, name)
    }

    fn try_read(&self, id: EntityId) -> Option<Arc<Entity>> {
        let entity = self.inner.try_read(id);
        if id == self.target {
            let edit = self.edit.lock().take();
            if let Some(mut edit) = edit {
                self.inner
                    .update(id, &mut |entity| {
                        edit(entity);
                        Ok(())
                    })
                    .unwrap();
            }
        }
        entity
    }

    fn ids_of_kind(&self, kind: EntityKind) -> Vec<EntityId> {
        self.inner.ids_of_kind(kind)
    }

    fn insert(&self, entity: Entity) -> Result<EntityId> {
        self.inner.insert(entity)
    }

    fn insert_or_replace(&self, entity: Entity) -> EntityId {
        self.inner.insert_or_replace(entity)
    }

    fn update(&self, id: EntityId, f: &mut dyn FnMut(&mut Entity) -> Result<()>) -> Result<()> {
        self.inner.update(id, f)
    }

    fn remove(&self, id: EntityId) -> Result<()> {
        self.inner.remove(id)
    }

    fn subscribe(&self, id: EntityId, handler: ChangeHandler) -> Subscription {
        self.inner.subscribe(id, handler)
    }

    fn subscribe_kind(&self, kind: EntityKind, handler: ChangeHandler) -> Subscription {
        self.inner.subscribe_kind(kind, handler)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::entities::{Role, User};

    fn counter() -> (Arc<AtomicUsize>, ChangeHandler) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let handler: ChangeHandler = Arc::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, handler)
    }

    #[test]
    fn insert_find_read() {
        let storage = MemoryStorage::new();
        let id = storage.insert(User::new("alice").into()).unwrap();

        assert_eq!(storage.find(EntityKind::User, "alice"), Some(id));
        assert_eq!(storage.find(EntityKind::Role, "alice"), None);
        assert_eq!(storage.read(id).unwrap().name(), "alice");
        assert_eq!(storage.ids_of_kind(EntityKind::User), vec![id]);
        assert!(storage.ids_of_kind(EntityKind::Role).is_empty());
        assert!(matches!(
            storage.read_kind(id, EntityKind::Role),
            Err(AccessError::WrongEntityKind { .. })
        ));
    }

    #[test]
    fn names_are_unique_per_kind() {
        let storage = MemoryStorage::new();
        storage.insert(User::new("x").into()).unwrap();
        storage.insert(Role::new("x").into()).unwrap();
        assert_eq!(
            storage.insert(User::new("x").into()),
            Err(AccessError::NameCollision {
                kind: EntityKind::User,
                name: "x".to_string()
            })
        );
        assert_eq!(storage.len(), 2);
    }

    #[test]
    fn insert_or_replace_keeps_id() {
        let storage = MemoryStorage::new();
        let id = storage.insert_or_replace(User::new("alice").into());
        let again = storage.insert_or_replace(User::new("alice").with_profile("web").into());
        assert_eq!(id, again);
        assert_eq!(
            storage.read(id).unwrap().as_user().unwrap().profile.as_deref(),
            Some("web")
        );
    }

    #[test]
    fn update_renames_and_rejects_collisions() {
        let storage = MemoryStorage::new();
        let a = storage.insert(Role::new("a").into()).unwrap();
        storage.insert(Role::new("b").into()).unwrap();

        storage
            .update(a, &mut |entity| {
                if let Entity::Role(role) = entity {
                    role.name = "c".to_string();
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(storage.find(EntityKind::Role, "c"), Some(a));
        assert_eq!(storage.find(EntityKind::Role, "a"), None);

        let err = storage.update(a, &mut |entity| {
            if let Entity::Role(role) = entity {
                role.name = "b".to_string();
            }
            Ok(())
        });
        assert!(matches!(err, Err(AccessError::NameCollision { .. })));
        assert_eq!(storage.read(a).unwrap().name(), "c");
    }

    #[test]
    fn failed_update_changes_nothing() {
        let storage = MemoryStorage::new();
        let id = storage.insert(Role::new("a").into()).unwrap();
        let (count, handler) = counter();
        let _sub = storage.subscribe(id, handler);

        let err = storage.update(id, &mut |entity| {
            *entity = User::new("a").into();
            Ok(())
        });
        assert!(matches!(err, Err(AccessError::WrongEntityKind { .. })));

        let err = storage.update(id, &mut |_| Err(AccessError::CurrentDatabaseNotSet));
        assert_eq!(err, Err(AccessError::CurrentDatabaseNotSet));

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(storage.read(id).unwrap().kind(), EntityKind::Role);
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let storage = MemoryStorage::new();
        let id = storage.insert(User::new("alice").into()).unwrap();
        let before = storage.read(id).unwrap();
        storage
            .update(id, &mut |entity| {
                if let Entity::User(user) = entity {
                    user.profile = Some("web".to_string());
                }
                Ok(())
            })
            .unwrap();
        assert!(before.as_user().unwrap().profile.is_none());
        assert!(storage.read(id).unwrap().as_user().unwrap().profile.is_some());
    }

    #[test]
    fn notifications_and_unsubscribe() {
        let storage = MemoryStorage::new();
        let id = storage.insert(Role::new("r").into()).unwrap();

        let (by_id, handler) = counter();
        let sub = storage.subscribe(id, handler);
        let (by_kind, kind_handler) = counter();
        let _kind_sub = storage.subscribe_kind(EntityKind::Role, kind_handler);

        storage.update(id, &mut |_| Ok(())).unwrap();
        assert_eq!(by_id.load(Ordering::SeqCst), 1);
        assert_eq!(by_kind.load(Ordering::SeqCst), 1);

        drop(sub);
        storage.insert(Role::new("other").into()).unwrap();
        storage.remove(id).unwrap();
        assert_eq!(by_id.load(Ordering::SeqCst), 1);
        assert_eq!(by_kind.load(Ordering::SeqCst), 3);
        assert_eq!(storage.remove(id), Err(AccessError::EntityNotFound(id)));
    }

    #[test]
    fn removal_notifies_none() {
        let storage = MemoryStorage::new();
        let id = storage.insert(Role::new("r").into()).unwrap();
        let removed = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&removed);
        let _sub = storage.subscribe(
            id,
            Arc::new(move |_, entity| {
                if entity.is_none() {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        storage.remove(id).unwrap();
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handlers_may_read_storage() {
        let storage = Arc::new(MemoryStorage::new());
        let id = storage.insert(Role::new("r").into()).unwrap();
        let reader = Arc::downgrade(&storage);
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        let _sub = storage.subscribe(
            id,
            Arc::new(move |id, _| {
                if let Some(storage) = reader.upgrade() {
                    *slot.lock() = storage.try_read(id).map(|e| e.name());
                }
            }),
        );
        storage
            .update(id, &mut |entity| {
                if let Entity::Role(role) = entity {
                    role.name = "renamed".to_string();
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(seen.lock().as_deref(), Some("renamed"));
    }

    #[test]
    fn subscription_outliving_storage_is_harmless() {
        let storage = MemoryStorage::new();
        let (_, handler) = counter();
        let sub = storage.subscribe_kind(EntityKind::User, handler);
        drop(storage);
        assert!(sub.is_active());
        drop(sub);
    }
}
