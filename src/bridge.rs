use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;

use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;

use crate::events::{EmitReport, EventBus, GameEvent, SubscriptionId};
use crate::host::{BindingHandle, EntityId, EntityLiveness, HostEventSource, Tick};

/// Bus topic for the synthesized "entity appeared this tick" notification.
pub const FIRST_SEEN_EVENT: &str = "entity_first_seen";

/// The fixed table of host events the bridge knows how to wire, each with one payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HostEventKind {
    EntitySpawned,
    EntityDied,
    EntityMoved,
    PlayerChat,
}

#[derive(Deserialize)]
struct SpawnedArgs {
    entity: u64,
    #[serde(default)]
    kind: String,
    x: f64,
    y: f64,
}

#[derive(Deserialize)]
struct EntityArgs {
    entity: u64,
}

#[derive(Deserialize)]
struct MovedArgs {
    entity: u64,
    x: f64,
    y: f64,
}

#[derive(Deserialize)]
struct ChatArgs {
    player: u64,
    message: String,
}

impl HostEventKind {
    pub const ALL: [HostEventKind; 4] =
        [HostEventKind::EntitySpawned, HostEventKind::EntityDied, HostEventKind::EntityMoved, HostEventKind::PlayerChat];

    /// Bus topic the translated events are published under.
    pub const fn name(self) -> &'static str {
        match self {
            HostEventKind::EntitySpawned => "entity_spawned",
            HostEventKind::EntityDied => "entity_died",
            HostEventKind::EntityMoved => "entity_moved",
            HostEventKind::PlayerChat => "player_chat",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Converts a raw host payload into the typed event for this kind.
    pub fn decode(self, payload: &Value) -> Result<GameEvent, serde_json::Error> {
        let event = match self {
            HostEventKind::EntitySpawned => {
                let args = SpawnedArgs::deserialize(payload)?;
                GameEvent::EntitySpawned { entity: EntityId(args.entity), kind: args.kind, position: [args.x, args.y] }
            }
            HostEventKind::EntityDied => {
                let args = EntityArgs::deserialize(payload)?;
                GameEvent::EntityDied { entity: EntityId(args.entity) }
            }
            HostEventKind::EntityMoved => {
                let args = MovedArgs::deserialize(payload)?;
                GameEvent::EntityMoved { entity: EntityId(args.entity), position: [args.x, args.y] }
            }
            HostEventKind::PlayerChat => {
                let args = ChatArgs::deserialize(payload)?;
                GameEvent::PlayerChat { player: EntityId(args.player), message: args.message }
            }
        };
        Ok(event)
    }
}

impl fmt::Display for HostEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

struct HostBinding {
    handle: BindingHandle,
    subscribers: usize,
}

/// Shares one host registration per event kind between every local subscriber.
///
/// The host listener is registered when the first subscriber for a kind arrives and released when the last one
/// leaves. Host payloads are decoded through [`HostEventKind::decode`] and published on the bus under
/// [`HostEventKind::name`]. Every id the bridge hands out goes back through [`HostEventBridge::unsubscribe`];
/// the bus itself is not exposed, so a binding's count cannot be bypassed.
pub struct HostEventBridge {
    bus: Rc<EventBus>,
    bindings: HashMap<HostEventKind, HostBinding>,
    subscriptions: HashMap<SubscriptionId, HostEventKind>,
}

impl HostEventBridge {
    pub fn new(bus: Rc<EventBus>) -> Self {
        Self { bus, bindings: HashMap::new(), subscriptions: HashMap::new() }
    }

    /// Subscribes to a topic the host does not produce, straight on the bus.
    pub fn subscribe_topic<F>(&self, name: &str, callback: F) -> SubscriptionId
    where
        F: FnMut(&GameEvent) -> Result<()> + 'static,
    {
        self.bus.subscribe(name, callback)
    }

    pub fn emit(&self, name: &str, event: &GameEvent) -> EmitReport {
        self.bus.emit(name, event)
    }

    pub fn subscribe<F>(&mut self, host: &mut dyn HostEventSource, kind: HostEventKind, callback: F) -> SubscriptionId
    where
        F: FnMut(&GameEvent) -> Result<()> + 'static,
    {
        if !self.bindings.contains_key(&kind) {
            let handle = host.register(kind, self.translator(kind));
            log::debug!("[bridge] bound host event '{kind}'");
            self.bindings.insert(kind, HostBinding { handle, subscribers: 0 });
        }
        let id = self.bus.subscribe(kind.name(), callback);
        if let Some(binding) = self.bindings.get_mut(&kind) {
            binding.subscribers += 1;
        }
        self.subscriptions.insert(id, kind);
        id
    }

    /// Drops one subscription; the host binding goes with the last subscriber. Topic subscriptions are removed
    /// from the bus directly. Returns `false` for unknown ids.
    pub fn unsubscribe(&mut self, host: &mut dyn HostEventSource, id: SubscriptionId) -> bool {
        let Some(kind) = self.subscriptions.remove(&id) else {
            return self.bus.unsubscribe(id);
        };
        self.bus.unsubscribe(id);
        let remaining = match self.bindings.get_mut(&kind) {
            Some(binding) => {
                binding.subscribers = binding.subscribers.saturating_sub(1);
                binding.subscribers
            }
            None => return true,
        };
        if remaining == 0 {
            if let Some(binding) = self.bindings.remove(&kind) {
                if !host.unregister(binding.handle) {
                    log::warn!("[bridge] host no longer knew binding for '{kind}'");
                }
                log::debug!("[bridge] released host event '{kind}'");
            }
        }
        true
    }

    pub fn is_bound(&self, kind: HostEventKind) -> bool {
        self.bindings.contains_key(&kind)
    }

    pub fn subscriber_count(&self, kind: HostEventKind) -> usize {
        self.bindings.get(&kind).map_or(0, |binding| binding.subscribers)
    }

    /// Unsubscribes everything and releases every host binding.
    pub fn release_all(&mut self, host: &mut dyn HostEventSource) {
        for id in self.subscriptions.drain().map(|(id, _)| id) {
            self.bus.unsubscribe(id);
        }
        let mut bindings: Vec<_> = self.bindings.drain().collect();
        bindings.sort_by_key(|(kind, _)| *kind);
        for (kind, binding) in bindings {
            host.unregister(binding.handle);
            log::debug!("[bridge] released host event '{kind}'");
        }
    }

    fn translator(&self, kind: HostEventKind) -> Box<dyn FnMut(&Value)> {
        let bus = Rc::clone(&self.bus);
        Box::new(move |payload: &Value| match kind.decode(payload) {
            Ok(event) => {
                bus.emit(kind.name(), &event);
            }
            Err(err) => log::warn!("[bridge] dropping malformed '{kind}' payload {payload}: {err}"),
        })
    }
}

/// Synthesizes [`FIRST_SEEN_EVENT`] from the host's entity list.
///
/// Ids are tracked whether or not anyone listens, so a late subscriber only hears about entities that appear
/// after it subscribed.
#[derive(Debug, Default)]
pub struct FirstSeenTracker {
    known: BTreeSet<EntityId>,
}

impl FirstSeenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emits one event per newly live id, ascending, and forgets ids that died. Returns the number of new ids.
    pub fn scan(&mut self, host: &dyn EntityLiveness, bus: &EventBus, tick: Tick) -> usize {
        let live: BTreeSet<EntityId> = host.live_ids().into_iter().collect();
        let fresh: Vec<EntityId> = live.difference(&self.known).copied().collect();
        self.known = live;
        for entity in &fresh {
            bus.emit(FIRST_SEEN_EVENT, &GameEvent::EntityFirstSeen { entity: *entity, tick });
        }
        fresh.len()
    }

    pub fn is_known(&self, id: EntityId) -> bool {
        self.known.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{EcsHost, HostHandler};
    use glam::DVec2;
    use serde_json::json;
    use std::cell::RefCell;

    /// Host that only counts registrations.
    #[derive(Default)]
    struct CountingHost {
        live: HashMap<BindingHandle, HostEventKind>,
        next: u64,
        registrations: usize,
    }

    impl HostEventSource for CountingHost {
        fn register(&mut self, kind: HostEventKind, _handler: HostHandler) -> BindingHandle {
            self.next += 1;
            self.registrations += 1;
            let handle = BindingHandle(self.next);
            self.live.insert(handle, kind);
            handle
        }

        fn unregister(&mut self, handle: BindingHandle) -> bool {
            self.live.remove(&handle).is_some()
        }
    }

    impl CountingHost {
        fn bindings_for(&self, kind: HostEventKind) -> usize {
            self.live.values().filter(|bound| **bound == kind).count()
        }
    }

    #[test]
    fn binding_count_tracks_local_subscriptions() {
        let bus = Rc::new(EventBus::new());
        let mut bridge = HostEventBridge::new(Rc::clone(&bus));
        let mut host = CountingHost::default();
        let kind = HostEventKind::EntityDied;

        // Interleave subscribes and unsubscribes in a fixed but irregular order.
        let mut live = Vec::new();
        let script = [true, true, false, true, false, false, true, false, true, true, false, false];
        for subscribe in script {
            if subscribe {
                live.push(bridge.subscribe(&mut host, kind, |_| Ok(())));
            } else {
                let id = live.remove(0);
                assert!(bridge.unsubscribe(&mut host, id));
            }
            let expected = usize::from(!live.is_empty());
            assert_eq!(host.bindings_for(kind), expected, "live subscriptions: {}", live.len());
            assert_eq!(bridge.is_bound(kind), !live.is_empty());
        }
        assert_eq!(host.registrations, 3, "a binding is only created when none exists");
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = Rc::new(EventBus::new());
        let mut bridge = HostEventBridge::new(bus);
        let mut host = CountingHost::default();
        let id = bridge.subscribe(&mut host, HostEventKind::PlayerChat, |_| Ok(()));
        assert!(bridge.unsubscribe(&mut host, id));
        assert!(!bridge.unsubscribe(&mut host, id));
        assert!(host.live.is_empty());
    }

    #[test]
    fn topic_subscriptions_share_the_removal_path() {
        let bus = Rc::new(EventBus::new());
        let mut bridge = HostEventBridge::new(Rc::clone(&bus));
        let mut host = CountingHost::default();
        let bound = bridge.subscribe(&mut host, HostEventKind::EntityDied, |_| Ok(()));
        let topic = bridge.subscribe_topic("bell", |_| Ok(()));
        let report = bridge.emit("bell", &GameEvent::Script { name: "bell".into(), payload: json!(1) });
        assert_eq!(report.delivered, 1);

        assert!(bridge.unsubscribe(&mut host, topic));
        assert_eq!(bus.subscriber_count("bell"), 0);
        assert_eq!(host.bindings_for(HostEventKind::EntityDied), 1);
        assert!(bridge.unsubscribe(&mut host, bound));
        assert_eq!(host.bindings_for(HostEventKind::EntityDied), 0);
    }

    #[test]
    fn host_payloads_arrive_as_typed_events() {
        let bus = Rc::new(EventBus::new());
        let mut bridge = HostEventBridge::new(Rc::clone(&bus));
        let mut host = EcsHost::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        bridge.subscribe(&mut host, HostEventKind::EntitySpawned, move |event| {
            sink.borrow_mut().push(event.clone());
            Ok(())
        });

        let id = host.spawn("zombie", DVec2::new(2.0, 3.0));
        assert_eq!(
            *seen.borrow(),
            vec![GameEvent::EntitySpawned { entity: id, kind: "zombie".into(), position: [2.0, 3.0] }]
        );
    }

    #[test]
    fn malformed_payload_is_dropped() {
        let bus = Rc::new(EventBus::new());
        let mut bridge = HostEventBridge::new(Rc::clone(&bus));
        let mut host = EcsHost::new();
        let count = Rc::new(RefCell::new(0));
        let sink = Rc::clone(&count);
        bridge.subscribe(&mut host, HostEventKind::PlayerChat, move |_| {
            *sink.borrow_mut() += 1;
            Ok(())
        });
        host.fire(HostEventKind::PlayerChat, &json!({ "player": "not-a-number" }));
        assert_eq!(*count.borrow(), 0);
    }

    #[test]
    fn release_all_drops_every_binding() {
        let bus = Rc::new(EventBus::new());
        let mut bridge = HostEventBridge::new(Rc::clone(&bus));
        let mut host = CountingHost::default();
        for kind in HostEventKind::ALL {
            bridge.subscribe(&mut host, kind, |_| Ok(()));
        }
        bridge.release_all(&mut host);
        assert!(host.live.is_empty());
        assert_eq!(bus.subscriber_count(HostEventKind::EntityDied.name()), 0);
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in HostEventKind::ALL {
            assert_eq!(HostEventKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(HostEventKind::from_name("weather_changed"), None);
    }

    #[test]
    fn first_seen_fires_once_per_entity() {
        let bus = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        bus.subscribe(FIRST_SEEN_EVENT, move |event: &GameEvent| {
            sink.borrow_mut().push(event.entity());
            Ok(())
        });
        let mut host = EcsHost::new();
        let mut tracker = FirstSeenTracker::new();
        let a = host.spawn("a", DVec2::ZERO);
        assert_eq!(tracker.scan(&host, &bus, 1), 1);
        assert_eq!(tracker.scan(&host, &bus, 2), 0);
        let b = host.spawn("b", DVec2::ZERO);
        host.despawn(a);
        assert_eq!(tracker.scan(&host, &bus, 3), 1);
        assert!(!tracker.is_known(a));
        assert_eq!(*seen.borrow(), vec![Some(a), Some(b)]);
    }
}
