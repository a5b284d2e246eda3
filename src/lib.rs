pub mod bridge;
pub mod components;
pub mod config;
pub mod events;
pub mod host;
pub mod runtime;
pub mod scheduler;
#[cfg(feature = "scripts")]
pub mod scripts;
pub mod spatial;
pub mod state;
pub mod store;

pub use bridge::{FirstSeenTracker, HostEventBridge, HostEventKind, FIRST_SEEN_EVENT};
pub use components::{Component, ComponentError, ComponentRegistry, ReconcileReport};
pub use config::AddonConfig;
pub use events::{EmitReport, EventBus, GameEvent, SubscriptionId};
pub use host::{EcsHost, EntityId, Host, Tick};
pub use runtime::{AddonCore, AddonRuntime, SharedBackend};
pub use scheduler::{IntervalHandle, Scheduler, SchedulerError};
pub use spatial::{SpatialError, SpatialIndex2D};
pub use state::PersistedState;
pub use store::{FlushReport, JsonFileBackend, KeyedStore, MemoryBackend, Scope, StoreBackend, StoreError};
