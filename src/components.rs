use std::any::Any;
use std::collections::BTreeMap;

use thiserror::Error;

use crate::host::{EntityId, EntityLiveness};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ComponentError {
    #[error("entity {entity} already has a '{kind}' component")]
    AlreadyAttached { entity: EntityId, kind: String },
    #[error("entity {0} is not live")]
    EntityNotLive(EntityId),
}

pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Per-entity add-on state owned by the registry.
pub trait Component: AsAny {
    /// Called exactly once when the instance leaves the registry, whether detached explicitly or reconciled away.
    fn dispose(&mut self, _entity: EntityId) {}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub dead_entities: Vec<EntityId>,
    pub disposed: usize,
}

/// Maps `(entity, kind)` to one component instance, never outliving the entity by more than one reconciliation.
#[derive(Default)]
pub struct ComponentRegistry {
    entries: BTreeMap<EntityId, BTreeMap<String, Box<dyn Component>>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(
        &mut self,
        host: &dyn EntityLiveness,
        entity: EntityId,
        kind: impl Into<String>,
        instance: Box<dyn Component>,
    ) -> Result<(), ComponentError> {
        let kind = kind.into();
        if !host.exists(entity) {
            return Err(ComponentError::EntityNotLive(entity));
        }
        let components = self.entries.entry(entity).or_default();
        if components.contains_key(&kind) {
            return Err(ComponentError::AlreadyAttached { entity, kind });
        }
        components.insert(kind, instance);
        Ok(())
    }

    /// Disposes and removes one component. Returns `false` if the pair was not attached.
    pub fn detach(&mut self, entity: EntityId, kind: &str) -> bool {
        let Some(components) = self.entries.get_mut(&entity) else {
            return false;
        };
        let Some(mut instance) = components.remove(kind) else {
            return false;
        };
        if components.is_empty() {
            self.entries.remove(&entity);
        }
        instance.dispose(entity);
        true
    }

    /// Disposes every component of `entity` in kind order, returning how many were removed.
    pub fn detach_entity(&mut self, entity: EntityId) -> usize {
        let Some(components) = self.entries.remove(&entity) else {
            return 0;
        };
        let count = components.len();
        for (_, mut instance) in components {
            instance.dispose(entity);
        }
        count
    }

    pub fn get(&self, entity: EntityId, kind: &str) -> Option<&dyn Component> {
        self.entries.get(&entity)?.get(kind).map(|instance| instance.as_ref())
    }

    pub fn get_mut(&mut self, entity: EntityId, kind: &str) -> Option<&mut (dyn Component + 'static)> {
        self.entries.get_mut(&entity)?.get_mut(kind).map(|instance| instance.as_mut())
    }

    /// Like [`ComponentRegistry::get`], but hides components whose entity died and has not been reconciled yet.
    pub fn get_live(&self, host: &dyn EntityLiveness, entity: EntityId, kind: &str) -> Option<&dyn Component> {
        if !host.exists(entity) {
            return None;
        }
        self.get(entity, kind)
    }

    pub fn get_as<T: Component>(&self, entity: EntityId, kind: &str) -> Option<&T> {
        self.get(entity, kind)?.as_any().downcast_ref::<T>()
    }

    pub fn get_as_mut<T: Component>(&mut self, entity: EntityId, kind: &str) -> Option<&mut T> {
        self.get_mut(entity, kind)?.as_any_mut().downcast_mut::<T>()
    }

    pub fn has(&self, entity: EntityId, kind: &str) -> bool {
        self.entries.get(&entity).is_some_and(|components| components.contains_key(kind))
    }

    pub fn kinds_of(&self, entity: EntityId) -> Vec<&str> {
        self.entries.get(&entity).map(|components| components.keys().map(String::as_str).collect()).unwrap_or_default()
    }

    pub fn tracked_entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Detaches every component whose entity the host no longer reports as live.
    pub fn reconcile(&mut self, host: &dyn EntityLiveness) -> ReconcileReport {
        let mut report = ReconcileReport { checked: self.entries.len(), ..ReconcileReport::default() };
        let dead: Vec<EntityId> = self.entries.keys().copied().filter(|entity| !host.exists(*entity)).collect();
        for entity in dead {
            report.disposed += self.detach_entity(entity);
            report.dead_entities.push(entity);
        }
        if !report.dead_entities.is_empty() {
            log::debug!(
                "[components] reconciled {} dead entities, disposed {} components",
                report.dead_entities.len(),
                report.disposed
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::EcsHost;
    use glam::DVec2;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Health {
        hp: i32,
        disposed: Rc<RefCell<Vec<(EntityId, &'static str)>>>,
    }

    impl Component for Health {
        fn dispose(&mut self, entity: EntityId) {
            self.disposed.borrow_mut().push((entity, "health"));
        }
    }

    struct Tag;

    impl Component for Tag {}

    fn health(disposed: &Rc<RefCell<Vec<(EntityId, &'static str)>>>) -> Box<dyn Component> {
        Box::new(Health { hp: 20, disposed: Rc::clone(disposed) })
    }

    #[test]
    fn reconciliation_removes_components_of_dead_entities() {
        let mut host = EcsHost::new();
        let mut registry = ComponentRegistry::new();
        let disposed = Rc::new(RefCell::new(Vec::new()));
        let e1 = host.spawn("zombie", DVec2::ZERO);
        let e2 = host.spawn("villager", DVec2::ZERO);
        registry.attach(&host, e1, "health", health(&disposed)).expect("attach e1");
        registry.attach(&host, e1, "tag", Box::new(Tag)).expect("attach tag");
        registry.attach(&host, e2, "health", health(&disposed)).expect("attach e2");

        host.despawn(e1);
        assert!(registry.get(e1, "health").is_some(), "still present until reconciled");
        assert!(registry.get_live(&host, e1, "health").is_none(), "validity-gated lookup hides it");

        let report = registry.reconcile(&host);
        assert_eq!(report.checked, 2);
        assert_eq!(report.dead_entities, vec![e1]);
        assert_eq!(report.disposed, 2);
        assert!(registry.get(e1, "health").is_none());
        assert!(registry.get(e1, "tag").is_none());
        assert!(registry.get(e2, "health").is_some());
        assert_eq!(*disposed.borrow(), vec![(e1, "health")]);
    }

    #[test]
    fn double_attach_is_rejected() {
        let mut host = EcsHost::new();
        let mut registry = ComponentRegistry::new();
        let entity = host.spawn("zombie", DVec2::ZERO);
        registry.attach(&host, entity, "tag", Box::new(Tag)).expect("first attach");
        let err = registry.attach(&host, entity, "tag", Box::new(Tag)).unwrap_err();
        assert_eq!(err, ComponentError::AlreadyAttached { entity, kind: "tag".into() });
    }

    #[test]
    fn attach_requires_live_entity() {
        let mut host = EcsHost::new();
        let mut registry = ComponentRegistry::new();
        let entity = host.spawn("zombie", DVec2::ZERO);
        host.despawn(entity);
        assert_eq!(
            registry.attach(&host, entity, "tag", Box::new(Tag)),
            Err(ComponentError::EntityNotLive(entity))
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn never_attached_lookup_is_none() {
        let registry = ComponentRegistry::new();
        assert!(registry.get(EntityId::new(1), "health").is_none());
        assert!(registry.kinds_of(EntityId::new(1)).is_empty());
    }

    #[test]
    fn typed_access_and_explicit_detach() {
        let mut host = EcsHost::new();
        let mut registry = ComponentRegistry::new();
        let disposed = Rc::new(RefCell::new(Vec::new()));
        let entity = host.spawn("zombie", DVec2::ZERO);
        registry.attach(&host, entity, "health", health(&disposed)).expect("attach");

        if let Some(component) = registry.get_as_mut::<Health>(entity, "health") {
            component.hp -= 5;
        }
        assert_eq!(registry.get_as::<Health>(entity, "health").map(|h| h.hp), Some(15));
        assert!(registry.get_as::<Tag>(entity, "health").is_none());

        assert!(registry.detach(entity, "health"));
        assert!(!registry.detach(entity, "health"));
        assert_eq!(disposed.borrow().len(), 1);
        assert_eq!(registry.tracked_entities().count(), 0);
    }
}
