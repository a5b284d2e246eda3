use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::SystemTime;

use anyhow::{anyhow, Context, Result};
use glam::DVec2;
use rhai::{Array, CallFnOptions, Dynamic, Engine, EvalAltResult, FuncArgs, Scope, AST, FLOAT, INT};
use serde_json::Value;

use crate::bridge::{HostEventBridge, HostEventKind, FIRST_SEEN_EVENT};
use crate::events::{GameEvent, SubscriptionId};
use crate::host::{EntityId, HostEventSource, Tick};
use crate::spatial::SpatialIndex2D;
use crate::state::PersistedState;
use crate::store::StoreBackend;

/// Runtime pieces a script call reads and writes.
pub struct ScriptEnv<'a> {
    pub state: &'a mut PersistedState,
    pub spatial: &'a mut SpatialIndex2D,
    pub backend: &'a Rc<RefCell<dyn StoreBackend>>,
    pub bridge: &'a mut HostEventBridge,
    pub host: &'a mut dyn HostEventSource,
}

/// State lent to the script for one host call. Side effects wait here until the call returns.
#[derive(Default)]
struct ScriptFrame {
    state: PersistedState,
    spatial: SpatialIndex2D,
    backend: Option<Rc<RefCell<dyn StoreBackend>>>,
    emits: Vec<(String, Value)>,
    listens: Vec<String>,
    logs: Vec<String>,
}

/// The `world` value handed to `init`, `tick` and `on_event`.
#[derive(Clone)]
pub struct ScriptWorld {
    frame: Rc<RefCell<ScriptFrame>>,
}

type ScriptResult<T> = std::result::Result<T, Box<EvalAltResult>>;

impl ScriptWorld {
    fn get(&mut self, key: &str) -> Dynamic {
        self.frame.borrow().state.world().get(key).map(to_dynamic).unwrap_or(Dynamic::UNIT)
    }

    fn get_or(&mut self, key: &str, default: Dynamic) -> Dynamic {
        self.frame.borrow().state.world().get(key).map(to_dynamic).unwrap_or(default)
    }

    fn set(&mut self, key: &str, value: Dynamic) -> ScriptResult<()> {
        let value = to_json(&value)?;
        self.frame.borrow_mut().state.world_mut().set(key, value);
        Ok(())
    }

    fn entity_get(&mut self, id: INT, key: &str) -> ScriptResult<Dynamic> {
        let id = entity_id(id)?;
        let mut frame = self.frame.borrow_mut();
        let frame = &mut *frame;
        let store = match &frame.backend {
            Some(backend) => frame.state.entity_mut(id, &mut *backend.borrow_mut()),
            None => frame.state.entity_unloaded_mut(id),
        };
        Ok(store.get(key).map(to_dynamic).unwrap_or(Dynamic::UNIT))
    }

    fn entity_set(&mut self, id: INT, key: &str, value: Dynamic) -> ScriptResult<()> {
        let id = entity_id(id)?;
        let value = to_json(&value)?;
        let mut frame = self.frame.borrow_mut();
        let frame = &mut *frame;
        let store = match &frame.backend {
            Some(backend) => frame.state.entity_mut(id, &mut *backend.borrow_mut()),
            None => frame.state.entity_unloaded_mut(id),
        };
        store.set(key, value);
        Ok(())
    }

    fn nearby(&mut self, x: FLOAT, y: FLOAT, radius: FLOAT) -> Array {
        let frame = self.frame.borrow();
        frame.spatial.query_radius(DVec2::new(x, y), radius).map(|id| Dynamic::from(id.raw() as INT)).collect()
    }

    fn nearest(&mut self, x: FLOAT, y: FLOAT, radius: FLOAT) -> Dynamic {
        let frame = self.frame.borrow();
        match frame.spatial.nearest(DVec2::new(x, y), radius) {
            Some((id, _)) => Dynamic::from(id.raw() as INT),
            None => Dynamic::UNIT,
        }
    }

    fn emit(&mut self, name: &str, payload: Dynamic) -> ScriptResult<()> {
        if is_reserved_event(name) {
            return Err(format!("'{name}' is reserved for host events").into());
        }
        let payload = to_json(&payload)?;
        self.frame.borrow_mut().emits.push((name.to_string(), payload));
        Ok(())
    }

    fn listen(&mut self, name: &str) {
        self.frame.borrow_mut().listens.push(name.to_string());
    }

    fn log(&mut self, message: &str) {
        self.frame.borrow_mut().logs.push(message.to_string());
    }
}

/// Host event names and the first-seen topic carry fixed payload shapes that scripts cannot produce.
fn is_reserved_event(name: &str) -> bool {
    name == FIRST_SEEN_EVENT || HostEventKind::from_name(name).is_some()
}

fn entity_id(raw: INT) -> ScriptResult<EntityId> {
    u64::try_from(raw).map(EntityId::new).map_err(|_| format!("invalid entity id {raw}").into())
}

fn to_dynamic(value: &Value) -> Dynamic {
    rhai::serde::to_dynamic(value).unwrap_or(Dynamic::UNIT)
}

fn to_json(value: &Dynamic) -> ScriptResult<Value> {
    rhai::serde::from_dynamic(value)
}

/// What `on_event` receives as payload: script events carry their own payload, host events their JSON form.
fn event_payload(event: &GameEvent) -> Value {
    match event {
        GameEvent::Script { payload, .. } => payload.clone(),
        other => other.to_json(),
    }
}

/// One rhai add-on file, reloaded whenever its modification time advances.
pub struct ScriptHost {
    engine: Engine,
    ast: Option<AST>,
    scope: Scope<'static>,
    script_path: PathBuf,
    last_modified: Option<SystemTime>,
    error: Option<String>,
    enabled: bool,
    initialized: bool,
    frame: Rc<RefCell<ScriptFrame>>,
    inbox: Rc<RefCell<VecDeque<(String, Value)>>>,
    listening: BTreeMap<String, SubscriptionId>,
}

impl ScriptHost {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let mut engine = Engine::new();
        engine.set_fast_operators(true);
        register_api(&mut engine);
        Self {
            engine,
            ast: None,
            scope: Scope::new(),
            script_path: path.as_ref().to_path_buf(),
            last_modified: None,
            error: None,
            enabled: true,
            initialized: false,
            frame: Rc::new(RefCell::new(ScriptFrame::default())),
            inbox: Rc::new(RefCell::new(VecDeque::new())),
            listening: BTreeMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enable: bool) {
        self.enabled = enable;
    }

    pub fn last_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    pub fn is_listening(&self, name: &str) -> bool {
        self.listening.contains_key(name)
    }

    pub fn pending_events(&self) -> usize {
        self.inbox.borrow().len()
    }

    pub fn force_reload(&mut self) -> Result<()> {
        self.load_script()
    }

    /// Runs `init` if needed, then `on_event` for every queued event, then `tick`.
    pub fn tick(&mut self, env: &mut ScriptEnv<'_>, tick: Tick) {
        if let Err(err) = self.reload_if_needed() {
            self.record_error(format!("{err:#}"));
            return;
        }
        if !self.enabled || self.ast.is_none() {
            return;
        }

        self.lend(env);
        let outcome = self.run_entry_points(tick);
        self.restore(env);

        match outcome {
            Ok(()) => self.error = None,
            Err(message) => self.record_error(message),
        }
    }

    /// Drops every subscription this script made through `listen`.
    pub fn release(&mut self, bridge: &mut HostEventBridge, host: &mut dyn HostEventSource) {
        for (name, id) in mem::take(&mut self.listening) {
            if !bridge.unsubscribe(host, id) {
                log::debug!("[script] '{name}' subscription was already gone");
            }
        }
        self.inbox.borrow_mut().clear();
    }

    /// A failed `init` discards the inbox and skips the rest. A failing `on_event` does not stop the remaining
    /// events or `tick`; the first error is reported.
    fn run_entry_points(&mut self, tick: Tick) -> std::result::Result<(), String> {
        let world = ScriptWorld { frame: Rc::clone(&self.frame) };
        if !self.initialized {
            if let Err(err) = self.call("init", 1, (world.clone(),)) {
                self.inbox.borrow_mut().clear();
                return Err(err);
            }
            self.initialized = true;
        }
        let mut first_error = None;
        let queued: Vec<(String, Value)> = self.inbox.borrow_mut().drain(..).collect();
        for (name, payload) in queued {
            if let Err(err) = self.call("on_event", 3, (world.clone(), name, to_dynamic(&payload))) {
                first_error.get_or_insert(err);
            }
        }
        if let Err(err) = self.call("tick", 2, (world, tick as INT)) {
            first_error.get_or_insert(err);
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Calls an optional entry point. A script that does not define it is not an error.
    fn call(&mut self, name: &str, arity: usize, args: impl FuncArgs) -> std::result::Result<(), String> {
        let Some(ast) = &self.ast else {
            return Ok(());
        };
        if !ast.iter_functions().any(|f| f.name == name && f.params.len() == arity) {
            return Ok(());
        }
        let options = CallFnOptions::new().eval_ast(false);
        self.engine
            .call_fn_with_options::<Dynamic>(options, &mut self.scope, ast, name, args)
            .map(|_| ())
            .map_err(|err| format!("{name}: {err}"))
    }

    fn lend(&mut self, env: &mut ScriptEnv<'_>) {
        let mut frame = self.frame.borrow_mut();
        frame.state = mem::take(env.state);
        frame.spatial = mem::take(env.spatial);
        frame.backend = Some(Rc::clone(env.backend));
    }

    fn restore(&mut self, env: &mut ScriptEnv<'_>) {
        let (emits, listens, logs) = {
            let mut frame = self.frame.borrow_mut();
            *env.state = mem::take(&mut frame.state);
            *env.spatial = mem::take(&mut frame.spatial);
            frame.backend = None;
            (mem::take(&mut frame.emits), mem::take(&mut frame.listens), mem::take(&mut frame.logs))
        };
        let path = self.script_path.display().to_string();
        for line in logs {
            log::info!("[script] {path}: {line}");
        }
        for name in listens {
            self.subscribe(env, name);
        }
        for (name, payload) in emits {
            env.bridge.emit(&name, &GameEvent::Script { name: name.clone(), payload });
        }
    }

    fn subscribe(&mut self, env: &mut ScriptEnv<'_>, name: String) {
        if self.listening.contains_key(&name) {
            return;
        }
        let inbox = Rc::clone(&self.inbox);
        let queued_name = name.clone();
        let callback = move |event: &GameEvent| -> Result<()> {
            inbox.borrow_mut().push_back((queued_name.clone(), event_payload(event)));
            Ok(())
        };
        let id = match HostEventKind::from_name(&name) {
            Some(kind) => env.bridge.subscribe(&mut *env.host, kind, callback),
            None => env.bridge.subscribe_topic(&name, callback),
        };
        log::debug!("[script] {} listening for '{name}'", self.script_path.display());
        self.listening.insert(name, id);
    }

    fn record_error(&mut self, message: String) {
        if self.error.as_deref() != Some(message.as_str()) {
            log::warn!("[script] {}: {message}", self.script_path.display());
        }
        self.error = Some(message);
    }

    fn reload_if_needed(&mut self) -> Result<()> {
        let metadata = match fs::metadata(&self.script_path) {
            Ok(meta) => meta,
            Err(err) => {
                return Err(anyhow!("Script file not accessible: {err}"));
            }
        };
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if self.ast.is_none() || self.last_modified.map_or(true, |prev| modified > prev) {
            self.load_script()?;
        }
        Ok(())
    }

    fn load_script(&mut self) -> Result<()> {
        let source = fs::read_to_string(&self.script_path)
            .with_context(|| format!("Reading {}", self.script_path.display()))?;
        let ast = self.engine.compile(source).with_context(|| "Compiling Rhai script")?;
        let mut scope = Scope::new();
        self.engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|err| anyhow!("Running top-level statements: {err}"))?;
        self.scope = scope;
        self.last_modified = fs::metadata(&self.script_path).ok().and_then(|meta| meta.modified().ok());
        self.initialized = false;
        self.error = None;
        self.ast = Some(ast);
        log::info!("[script] loaded {}", self.script_path.display());
        Ok(())
    }
}

fn register_api(engine: &mut Engine) {
    engine.register_type_with_name::<ScriptWorld>("World");
    engine.register_fn("get", ScriptWorld::get);
    engine.register_fn("get", ScriptWorld::get_or);
    engine.register_fn("set", ScriptWorld::set);
    engine.register_fn("entity_get", ScriptWorld::entity_get);
    engine.register_fn("entity_set", ScriptWorld::entity_set);
    engine.register_fn("nearby", ScriptWorld::nearby);
    engine.register_fn("nearest", ScriptWorld::nearest);
    engine.register_fn("emit", ScriptWorld::emit);
    engine.register_fn("listen", ScriptWorld::listen);
    engine.register_fn("log", ScriptWorld::log);
    engine.on_print(|text| log::info!("[script] {text}"));
}
