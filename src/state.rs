use std::collections::BTreeMap;

use crate::host::{EntityId, EntityLiveness};
use crate::store::{FlushReport, KeyedStore, Scope, StoreBackend};

/// WorldState plus one EntityState store per entity, all flushed through the same backend.
///
/// Releasing a dead entity only drops its in-memory store. Its backend scope is left in place, since
/// [`StoreBackend`] has no delete; pruning old `entity.<id>` scopes is up to the host.
#[derive(Debug, Default)]
pub struct PersistedState {
    world: KeyedStore,
    entities: BTreeMap<EntityId, KeyedStore>,
}

impl PersistedState {
    pub fn new() -> Self {
        Self { world: KeyedStore::new(Scope::World), entities: BTreeMap::new() }
    }

    /// Loads the world scope. Entity scopes load lazily on first mutable access.
    pub fn load_world(&mut self, backend: &mut dyn StoreBackend) {
        self.world.load(backend);
    }

    pub fn world(&self) -> &KeyedStore {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut KeyedStore {
        &mut self.world
    }

    pub fn entity(&self, id: EntityId) -> Option<&KeyedStore> {
        self.entities.get(&id)
    }

    /// Store for `id`, loading its persisted keys the first time it is touched.
    pub fn entity_mut(&mut self, id: EntityId, backend: &mut dyn StoreBackend) -> &mut KeyedStore {
        let store = self.entities.entry(id).or_insert_with(|| KeyedStore::new(Scope::Entity(id)));
        if !store.is_loaded() {
            store.load(backend);
        }
        store
    }

    /// Store for `id` without touching the backend. An unloaded store merges persisted keys under its local
    /// writes once [`PersistedState::entity_mut`] loads it.
    pub fn entity_unloaded_mut(&mut self, id: EntityId) -> &mut KeyedStore {
        self.entities.entry(id).or_insert_with(|| KeyedStore::new(Scope::Entity(id)))
    }

    pub fn tracked_entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys().copied()
    }

    pub fn release_entity(&mut self, id: EntityId) -> Option<KeyedStore> {
        self.entities.remove(&id)
    }

    /// Drops the in-memory store of every entity the host no longer knows about. Pending writes are flushed
    /// first; keys that still fail are logged and lost with the store.
    pub fn release_dead(&mut self, host: &dyn EntityLiveness, backend: &mut dyn StoreBackend) -> Vec<EntityId> {
        let dead: Vec<EntityId> = self.entities.keys().copied().filter(|id| !host.exists(*id)).collect();
        for id in &dead {
            let Some(mut store) = self.entities.remove(id) else {
                continue;
            };
            if store.dirty_count() == 0 {
                continue;
            }
            if !store.is_loaded() {
                store.load(backend);
            }
            let report = store.flush(backend);
            if !report.failed.is_empty() {
                log::warn!("[store] entity {id} released with {} unwritten keys", report.failed.len());
            }
        }
        dead
    }

    pub fn dirty_count(&self) -> usize {
        self.world.dirty_count() + self.entities.values().map(KeyedStore::dirty_count).sum::<usize>()
    }

    /// Flushes the world scope, then every entity scope in id order.
    pub fn flush(&mut self, backend: &mut dyn StoreBackend) -> FlushReport {
        let mut report = self.world.flush(backend);
        for (id, store) in self.entities.iter_mut() {
            if !store.is_loaded() {
                store.load(backend);
                log::debug!("[store] late-loaded entity {id} before flushing it");
            }
            report.merge(store.flush(backend));
        }
        report
    }
}
