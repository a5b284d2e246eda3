use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use anyhow::{Context, Result};

use crate::bridge::{FirstSeenTracker, HostEventBridge};
use crate::components::{ComponentRegistry, ReconcileReport};
use crate::config::AddonConfig;
use crate::events::EventBus;
use crate::host::{EntityId, Host, Tick};
#[cfg(feature = "scripts")]
use crate::scripts::{ScriptEnv, ScriptHost};
use crate::scheduler::{IntervalHandle, Scheduler};
use crate::spatial::{SpatialError, SpatialIndex2D};
use crate::state::PersistedState;
use crate::store::{FlushReport, JsonFileBackend, KeyedStore, StoreBackend};

/// Backend shared between the runtime and anything that needs to inspect or swap it.
pub type SharedBackend = Rc<RefCell<dyn StoreBackend>>;

/// Everything the per-tick callbacks work on. Passed explicitly to every interval; there is no global instance.
pub struct AddonCore {
    pub state: PersistedState,
    pub backend: SharedBackend,
    pub bus: Rc<EventBus>,
    pub bridge: HostEventBridge,
    pub first_seen: FirstSeenTracker,
    pub spatial: SpatialIndex2D,
    pub components: ComponentRegistry,
    #[cfg(feature = "scripts")]
    pub scripts: Vec<ScriptHost>,
}

impl AddonCore {
    pub fn new(backend: SharedBackend, cell_size: f64) -> Result<Self, SpatialError> {
        let bus = Rc::new(EventBus::new());
        let mut state = PersistedState::new();
        state.load_world(&mut *backend.borrow_mut());
        Ok(Self {
            state,
            backend,
            bridge: HostEventBridge::new(Rc::clone(&bus)),
            bus,
            first_seen: FirstSeenTracker::new(),
            spatial: SpatialIndex2D::new(cell_size)?,
            components: ComponentRegistry::new(),
            #[cfg(feature = "scripts")]
            scripts: Vec::new(),
        })
    }

    /// Entity-scoped store, loaded from the backend on first use.
    pub fn entity_state_mut(&mut self, id: EntityId) -> &mut KeyedStore {
        self.state.entity_mut(id, &mut *self.backend.borrow_mut())
    }

    /// Mirrors host positions into the spatial index and drops points whose entity is gone.
    pub fn sync_spatial(&mut self, host: &dyn Host) {
        let live: BTreeSet<EntityId> = host.live_ids().into_iter().collect();
        for id in &live {
            match host.position(*id) {
                Some(position) => {
                    if let Err(err) = self.spatial.upsert(*id, position) {
                        log::warn!("[spatial] skipping entity {id}: {err}");
                    }
                }
                None => self.forget_point(*id),
            }
        }
        let stale: Vec<EntityId> = self.spatial.ids().into_iter().filter(|id| !live.contains(id)).collect();
        for id in stale {
            self.forget_point(id);
        }
    }

    fn forget_point(&mut self, id: EntityId) {
        match self.spatial.remove(id) {
            Ok(_) | Err(SpatialError::UnknownId(_)) => {}
            Err(err) => log::warn!("[spatial] could not remove entity {id}: {err}"),
        }
    }

    pub fn scan_first_seen(&mut self, host: &dyn Host, tick: Tick) -> usize {
        self.first_seen.scan(host.liveness(), &self.bus, tick)
    }

    #[cfg(feature = "scripts")]
    pub fn run_scripts(&mut self, host: &mut dyn Host, tick: Tick) {
        let mut env = ScriptEnv {
            state: &mut self.state,
            spatial: &mut self.spatial,
            backend: &self.backend,
            bridge: &mut self.bridge,
            host: host.events(),
        };
        for script in &mut self.scripts {
            script.tick(&mut env, tick);
        }
    }

    /// Disposes components of dead entities and releases their entity state.
    pub fn reconcile(&mut self, host: &dyn Host) -> ReconcileReport {
        let report = self.components.reconcile(host.liveness());
        let released = self.state.release_dead(host.liveness(), &mut *self.backend.borrow_mut());
        if !released.is_empty() {
            log::debug!("[store] released entity state for {} dead entities", released.len());
        }
        report
    }

    pub fn flush(&mut self) -> FlushReport {
        let report = self.state.flush(&mut *self.backend.borrow_mut());
        if report.written > 0 {
            log::debug!("[store] flushed {} keys", report.written);
        }
        report
    }
}

/// Per-tick driver: owns the core plus the scheduler that runs spatial sync, first-seen synthesis, scripts,
/// reconciliation and flushing.
pub struct AddonRuntime {
    core: AddonCore,
    scheduler: Scheduler<AddonCore, dyn Host>,
    config: AddonConfig,
}

impl AddonRuntime {
    pub fn new(config: AddonConfig, backend: SharedBackend) -> Result<Self> {
        config.validate()?;
        #[allow(unused_mut)]
        let mut core = AddonCore::new(backend, config.spatial.cell_size).context("Creating spatial index")?;
        #[cfg(feature = "scripts")]
        core.scripts.extend(config.scripts.paths.iter().map(ScriptHost::new));
        #[cfg(not(feature = "scripts"))]
        {
            if !config.scripts.paths.is_empty() {
                log::warn!("[script] {} scripts configured but scripting is disabled", config.scripts.paths.len());
            }
        }

        let mut scheduler: Scheduler<AddonCore, dyn Host> = Scheduler::new();
        scheduler.run_every(1, "spatial sync", |core, host, _| {
            core.sync_spatial(host);
            Ok(())
        })?;
        scheduler.run_every(1, "first seen", |core, host, tick| {
            core.scan_first_seen(host, tick);
            Ok(())
        })?;
        #[cfg(feature = "scripts")]
        scheduler.run_every(1, "scripts", |core, host, tick| {
            core.run_scripts(host, tick);
            Ok(())
        })?;
        scheduler.run_every(config.components.reconcile_interval_ticks, "reconcile", |core, host, _| {
            core.reconcile(host);
            Ok(())
        })?;
        scheduler.run_every(config.store.flush_interval_ticks, "flush", |core, _, _| {
            core.flush();
            Ok(())
        })?;
        Ok(Self { core, scheduler, config })
    }

    /// Runtime persisting to JSON files under `config.store.data_dir`.
    pub fn with_json_backend(config: AddonConfig) -> Result<Self> {
        let backend: SharedBackend = Rc::new(RefCell::new(JsonFileBackend::new(&config.store.data_dir)));
        Self::new(config, backend)
    }

    pub fn config(&self) -> &AddonConfig {
        &self.config
    }

    pub fn core(&self) -> &AddonCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut AddonCore {
        &mut self.core
    }

    pub fn bus(&self) -> &Rc<EventBus> {
        &self.core.bus
    }

    pub fn current_tick(&self) -> Tick {
        self.scheduler.current_tick()
    }

    /// Registers an extra interval that runs after the built-in ones on the same tick.
    pub fn run_every<F>(&mut self, interval: Tick, label: &str, callback: F) -> Result<IntervalHandle>
    where
        F: FnMut(&mut AddonCore, &mut (dyn Host + 'static), Tick) -> Result<()> + 'static,
    {
        Ok(self.scheduler.run_every(interval, label, callback)?)
    }

    pub fn cancel(&mut self, handle: IntervalHandle) -> bool {
        self.scheduler.cancel(handle)
    }

    /// Called once from the host's tick callback.
    pub fn tick(&mut self, host: &mut (dyn Host + 'static)) -> Tick {
        self.scheduler.advance(&mut self.core, host)
    }

    /// Flushes every pending write and releases all host bindings.
    pub fn shutdown(&mut self, host: &mut (dyn Host + 'static)) -> FlushReport {
        #[cfg(feature = "scripts")]
        for script in &mut self.core.scripts {
            script.release(&mut self.core.bridge, host.events());
        }
        self.core.bridge.release_all(host.events());
        let report = self.core.flush();
        if !report.failed.is_empty() {
            log::error!("[store] shutdown left {} keys unwritten", report.failed.len());
        }
        report
    }
}
