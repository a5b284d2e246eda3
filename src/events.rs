use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

use crate::host::{EntityId, Tick};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GameEvent {
    EntitySpawned { entity: EntityId, kind: String, position: [f64; 2] },
    EntityDied { entity: EntityId },
    EntityMoved { entity: EntityId, position: [f64; 2] },
    PlayerChat { player: EntityId, message: String },
    EntityFirstSeen { entity: EntityId, tick: Tick },
    Script { name: String, payload: Value },
}

impl GameEvent {
    pub fn entity(&self) -> Option<EntityId> {
        match self {
            GameEvent::EntitySpawned { entity, .. }
            | GameEvent::EntityDied { entity }
            | GameEvent::EntityMoved { entity, .. }
            | GameEvent::EntityFirstSeen { entity, .. } => Some(*entity),
            GameEvent::PlayerChat { player, .. } => Some(*player),
            GameEvent::Script { .. } => None,
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl fmt::Display for GameEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameEvent::EntitySpawned { entity, kind, position } => {
                write!(f, "EntitySpawned entity={entity} kind={kind} pos=({:.2}, {:.2})", position[0], position[1])
            }
            GameEvent::EntityDied { entity } => write!(f, "EntityDied entity={entity}"),
            GameEvent::EntityMoved { entity, position } => {
                write!(f, "EntityMoved entity={entity} pos=({:.2}, {:.2})", position[0], position[1])
            }
            GameEvent::PlayerChat { player, message } => write!(f, "PlayerChat player={player} message={message}"),
            GameEvent::EntityFirstSeen { entity, tick } => write!(f, "EntityFirstSeen entity={entity} tick={tick}"),
            GameEvent::Script { name, payload } => write!(f, "Script {name} {payload}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Outcome of one `emit` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitReport {
    pub delivered: usize,
    pub failed: usize,
    pub skipped: usize,
}

type Callback<E> = Rc<RefCell<dyn FnMut(&E) -> Result<()>>>;

struct Subscriber<E> {
    id: SubscriptionId,
    callback: Callback<E>,
}

/// Synchronous publish/subscribe channel keyed by event name.
///
/// Every method takes `&self`, so a callback holding an `Rc<EventBus>` may subscribe, unsubscribe or emit while
/// an emission is in progress. An emission delivers to the subscriber list as it stood when `emit` was called:
/// subscriptions made mid-emission first run on the next emission, and subscribers removed mid-emission are
/// skipped if their turn has not come yet.
pub struct EventBus<E = GameEvent> {
    topics: RefCell<HashMap<String, Vec<Subscriber<E>>>>,
    owners: RefCell<HashMap<SubscriptionId, String>>,
    next_id: Cell<u64>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self { topics: RefCell::new(HashMap::new()), owners: RefCell::new(HashMap::new()), next_id: Cell::new(1) }
    }

    pub fn subscribe<F>(&self, name: &str, callback: F) -> SubscriptionId
    where
        F: FnMut(&E) -> Result<()> + 'static,
    {
        let id = SubscriptionId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        let callback: Callback<E> = Rc::new(RefCell::new(callback));
        self.topics.borrow_mut().entry(name.to_string()).or_default().push(Subscriber { id, callback });
        self.owners.borrow_mut().insert(id, name.to_string());
        id
    }

    /// Removes exactly one registration. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Some(name) = self.owners.borrow_mut().remove(&id) else {
            return false;
        };
        let mut topics = self.topics.borrow_mut();
        if let Some(subscribers) = topics.get_mut(&name) {
            subscribers.retain(|subscriber| subscriber.id != id);
            if subscribers.is_empty() {
                topics.remove(&name);
            }
        }
        true
    }

    pub fn is_subscribed(&self, id: SubscriptionId) -> bool {
        self.owners.borrow().contains_key(&id)
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        self.topics.borrow().get(name).map_or(0, Vec::len)
    }

    pub fn emit(&self, name: &str, event: &E) -> EmitReport {
        let snapshot: Vec<(SubscriptionId, Callback<E>)> = match self.topics.borrow().get(name) {
            Some(subscribers) => {
                subscribers.iter().map(|subscriber| (subscriber.id, Rc::clone(&subscriber.callback))).collect()
            }
            None => return EmitReport::default(),
        };

        let mut report = EmitReport::default();
        for (id, callback) in snapshot {
            if !self.is_subscribed(id) {
                report.skipped += 1;
                continue;
            }
            let Ok(mut guard) = callback.try_borrow_mut() else {
                log::warn!("[events] subscriber {:?} on '{name}' re-entered during its own delivery, skipping", id);
                report.skipped += 1;
                continue;
            };
            match panic::catch_unwind(AssertUnwindSafe(|| (&mut *guard)(event))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(err)) => {
                    log::warn!("[events] subscriber {:?} on '{name}' failed: {err:#}", id);
                    report.failed += 1;
                }
                Err(_) => {
                    log::error!("[events] subscriber {:?} on '{name}' panicked", id);
                    report.failed += 1;
                }
            }
        }
        report
    }
}
