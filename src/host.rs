use std::fmt;

use bevy_ecs::prelude::{Component, Entity, World};
use glam::DVec2;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::bridge::HostEventKind;

/// Simulation step counter. Tick 0 is "before the first tick".
pub type Tick = u64;

/// Host-assigned entity identifier, stable for the lifetime of the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl EntityId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Entity> for EntityId {
    fn from(entity: Entity) -> Self {
        Self(entity.to_bits())
    }
}

/// Opaque handle for one listener registered with the host event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingHandle(pub u64);

/// Host-side listener: receives the raw event payload exactly as the host emits it.
pub type HostHandler = Box<dyn FnMut(&Value)>;

/// Answers "is this entity still around" for reconciliation and first-seen synthesis.
pub trait EntityLiveness {
    fn exists(&self, id: EntityId) -> bool;

    /// Every live entity id. Callers must not rely on the order.
    fn live_ids(&self) -> Vec<EntityId>;
}

pub trait EntityPositions {
    fn position(&self, id: EntityId) -> Option<DVec2>;
}

/// Where host events come from. Registration is per event kind; the bridge keeps at most one binding per kind.
pub trait HostEventSource {
    fn register(&mut self, kind: HostEventKind, handler: HostHandler) -> BindingHandle;

    /// Returns `false` when the handle was unknown or already released.
    fn unregister(&mut self, handle: BindingHandle) -> bool;
}

/// Everything the add-on runtime needs from the game host.
pub trait Host: EntityLiveness + EntityPositions + HostEventSource {
    fn liveness(&self) -> &dyn EntityLiveness;
    fn events(&mut self) -> &mut dyn HostEventSource;
}

impl<T: EntityLiveness + EntityPositions + HostEventSource> Host for T {
    fn liveness(&self) -> &dyn EntityLiveness {
        self
    }

    fn events(&mut self) -> &mut dyn HostEventSource {
        self
    }
}

#[derive(Component, Debug, Clone, Copy)]
pub struct HostPosition(pub DVec2);

#[derive(Component, Debug, Clone)]
pub struct HostKind(pub String);

struct HostBinding {
    handle: BindingHandle,
    kind: HostEventKind,
    handler: HostHandler,
}

/// In-process host backed by a `bevy_ecs` world.
///
/// Spawning, despawning and moving entities fire the matching host events to every registered listener, with
/// the same JSON payload shapes a scripting host would hand out.
pub struct EcsHost {
    pub world: World,
    bindings: Vec<HostBinding>,
    next_binding: u64,
}

impl Default for EcsHost {
    fn default() -> Self {
        Self::new()
    }
}

impl EcsHost {
    pub fn new() -> Self {
        Self { world: World::new(), bindings: Vec::new(), next_binding: 1 }
    }

    pub fn spawn(&mut self, kind: &str, position: DVec2) -> EntityId {
        let entity = self.world.spawn((HostPosition(position), HostKind(kind.to_string()))).id();
        let id = EntityId::from(entity);
        self.fire(
            HostEventKind::EntitySpawned,
            &json!({ "entity": id.raw(), "kind": kind, "x": position.x, "y": position.y }),
        );
        id
    }

    pub fn despawn(&mut self, id: EntityId) -> bool {
        let Some(entity) = self.entity(id) else {
            return false;
        };
        if !self.world.despawn(entity) {
            return false;
        }
        self.fire(HostEventKind::EntityDied, &json!({ "entity": id.raw() }));
        true
    }

    pub fn move_entity(&mut self, id: EntityId, position: DVec2) -> bool {
        let Some(entity) = self.entity(id) else {
            return false;
        };
        match self.world.get_mut::<HostPosition>(entity) {
            Some(mut current) => current.0 = position,
            None => return false,
        }
        self.fire(
            HostEventKind::EntityMoved,
            &json!({ "entity": id.raw(), "x": position.x, "y": position.y }),
        );
        true
    }

    pub fn chat(&mut self, player: EntityId, message: &str) {
        self.fire(HostEventKind::PlayerChat, &json!({ "player": player.raw(), "message": message }));
    }

    /// Delivers a raw payload to every listener bound to `kind`, in registration order.
    pub fn fire(&mut self, kind: HostEventKind, payload: &Value) {
        for binding in self.bindings.iter_mut().filter(|binding| binding.kind == kind) {
            (binding.handler)(payload);
        }
    }

    pub fn binding_count(&self, kind: HostEventKind) -> usize {
        self.bindings.iter().filter(|binding| binding.kind == kind).count()
    }

    pub fn kind_of(&self, id: EntityId) -> Option<&str> {
        let entity = self.entity(id)?;
        self.world.get::<HostKind>(entity).map(|kind| kind.0.as_str())
    }

    fn entity(&self, id: EntityId) -> Option<Entity> {
        let entity = Entity::try_from_bits(id.raw()).ok()?;
        self.world.entities().contains(entity).then_some(entity)
    }
}

impl EntityLiveness for EcsHost {
    fn exists(&self, id: EntityId) -> bool {
        self.entity(id).is_some()
    }

    fn live_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.world.iter_entities().map(|entity| EntityId::from(entity.id())).collect();
        ids.sort_unstable();
        ids
    }
}

impl EntityPositions for EcsHost {
    fn position(&self, id: EntityId) -> Option<DVec2> {
        let entity = self.entity(id)?;
        self.world.get::<HostPosition>(entity).map(|position| position.0)
    }
}

impl HostEventSource for EcsHost {
    fn register(&mut self, kind: HostEventKind, handler: HostHandler) -> BindingHandle {
        let handle = BindingHandle(self.next_binding);
        self.next_binding += 1;
        self.bindings.push(HostBinding { handle, kind, handler });
        handle
    }

    fn unregister(&mut self, handle: BindingHandle) -> bool {
        let before = self.bindings.len();
        self.bindings.retain(|binding| binding.handle != handle);
        self.bindings.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn despawned_entities_are_no_longer_live() {
        let mut host = EcsHost::new();
        let a = host.spawn("zombie", DVec2::new(1.0, 2.0));
        let b = host.spawn("cow", DVec2::ZERO);
        assert!(host.exists(a));
        assert_eq!(host.live_ids().len(), 2);
        assert!(host.despawn(a));
        assert!(!host.exists(a));
        assert!(!host.despawn(a), "second despawn should report nothing removed");
        assert_eq!(host.live_ids(), vec![b]);
        assert_eq!(host.kind_of(b), Some("cow"));
    }

    #[test]
    fn fire_reaches_only_matching_bindings() {
        let mut host = EcsHost::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let handle = host.register(
            HostEventKind::EntityDied,
            Box::new(move |payload| sink.borrow_mut().push(payload.clone())),
        );
        let id = host.spawn("zombie", DVec2::ZERO);
        host.despawn(id);
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0]["entity"], json!(id.raw()));

        assert!(host.unregister(handle));
        assert!(!host.unregister(handle));
        assert_eq!(host.binding_count(HostEventKind::EntityDied), 0);
    }

    #[test]
    fn move_updates_position() {
        let mut host = EcsHost::new();
        let id = host.spawn("arrow", DVec2::ZERO);
        assert!(host.move_entity(id, DVec2::new(4.0, -1.0)));
        assert_eq!(host.position(id), Some(DVec2::new(4.0, -1.0)));
        assert!(!host.move_entity(EntityId::new(u64::MAX), DVec2::ZERO));
    }
}
