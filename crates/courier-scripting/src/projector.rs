//! Lazy projection of the workspace graph into the dynamic engine
//!
//! `workspaces.<name>` creates the workspace namespace on first access.
//! Reading an undefined member of a namespace resolves the script of that
//! name (own, then ancestors, then root scripts), compiles it into a closure
//! capturing its owning workspace, stores it raw on the namespace and
//! memoizes it so every later access is a plain table read.

use crate::bridge::{CompiledWrapperDef, NativeBridge};
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::engine::{CacheStats, HostValue};
use crate::error::{Result, ScriptError};
use crate::lua_engine::{json_to_lua, lua_to_json, snippet_source};
use courier_config::ScriptingSettings;
use courier_core::{Ancestry, RequestDefinition, ScriptDefinition, ScriptLanguage, ScriptingConfig};
use mlua::{Function, Lua, MultiValue, RegistryKey, Table, Value, Variadic};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Lua global holding workspace namespaces
pub const WORKSPACES_GLOBAL: &str = "workspaces";
/// Lua global holding root scripts
pub const SCRIPTS_GLOBAL: &str = "scripts";
/// Lua global calling a script by workspace and name
pub const CALL_SCRIPT_GLOBAL: &str = "call_script";

const WORKSPACES_KEY: &str = "courier.workspaces";
const SCRIPTS_KEY: &str = "courier.scripts";

/// Namespace fields scripts and requests may not shadow
pub const RESERVED_MEMBERS: &[&str] = &[
    "name",
    "extends",
    "base_url",
    "properties",
    "hidden",
    "requests",
    "parent",
];

/// Host callback performing a request: `(workspace, request, args) -> result`
pub type RequestExecutor = Arc<dyn Fn(&str, &str, Vec<HostValue>) -> Result<HostValue> + Send + Sync>;

/// Replaceable slot for the request executor
#[derive(Default)]
pub struct ExecutorSlot {
    executor: RwLock<Option<RequestExecutor>>,
}

impl ExecutorSlot {
    /// Create an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `executor`, replacing any previous one
    pub fn set(&self, executor: RequestExecutor) {
        *self.executor.write() = Some(executor);
    }

    /// Current executor
    pub fn get(&self) -> Option<RequestExecutor> {
        self.executor.read().clone()
    }

    /// Whether an executor is installed
    pub fn is_set(&self) -> bool {
        self.executor.read().is_some()
    }

    /// Run the executor, failing when none is installed
    pub fn execute(&self, workspace: &str, request: &str, args: Vec<HostValue>) -> Result<HostValue> {
        let executor = self
            .get()
            .ok_or_else(|| ScriptError::MissingExecutor("request executor".to_string()))?;
        executor(workspace, request, args)
    }
}

impl fmt::Debug for ExecutorSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorSlot")
            .field("installed", &self.is_set())
            .finish()
    }
}

/// Script recorded for lazy compilation
#[derive(Debug, Clone)]
struct RecordedScript {
    key: String,
    name: String,
    owner: Option<String>,
    definition: ScriptDefinition,
}

fn script_key(owner: Option<&str>, name: &str) -> String {
    match owner {
        Some(owner) => format!("{owner}::{name}"),
        None => format!("::{name}"),
    }
}

/// Lazy projector over the dynamic engine
#[derive(Debug, Clone)]
pub struct LazyProjector {
    shared: Arc<Shared>,
}

struct Shared {
    config: Arc<ScriptingConfig>,
    diagnostics: Diagnostics,
    executor: Arc<ExecutorSlot>,
    bridge: Option<Arc<NativeBridge>>,
    active_chain: Option<Ancestry>,
    recorded: BTreeMap<String, RecordedScript>,
    compiled: Mutex<BTreeSet<String>>,
    memo: Mutex<HashMap<String, RegistryKey>>,
    compiles: AtomicU64,
    hits: AtomicU64,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyProjector")
            .field("recorded", &self.recorded.len())
            .field("compiled", &self.compiled.lock().len())
            .field("compiles", &self.compiles.load(Ordering::Relaxed))
            .field("native_bridge", &self.bridge.is_some())
            .finish()
    }
}

impl LazyProjector {
    /// Record every script in `config`
    ///
    /// Scripts named like a reserved namespace member or like a request the
    /// workspace can see are reported and left out.
    pub fn new(
        config: Arc<ScriptingConfig>,
        settings: &ScriptingSettings,
        diagnostics: Diagnostics,
        executor: Arc<ExecutorSlot>,
        bridge: Option<Arc<NativeBridge>>,
    ) -> Self {
        let mut recorded = BTreeMap::new();

        for (name, definition) in &config.scripts {
            let key = script_key(None, name);
            recorded.insert(
                key.clone(),
                RecordedScript {
                    key,
                    name: name.clone(),
                    owner: None,
                    definition: definition.clone(),
                },
            );
        }

        for workspace in &config.workspaces {
            for request in workspace.requests.keys() {
                if RESERVED_MEMBERS.contains(&request.as_str()) {
                    diagnostics.record(
                        DiagnosticKind::ConfigShape,
                        Some(&workspace.name),
                        format!("request '{request}' collides with a namespace field and is only reachable through 'requests'"),
                    );
                }
            }

            for (name, definition) in &workspace.scripts {
                if RESERVED_MEMBERS.contains(&name.as_str()) {
                    diagnostics.record(
                        DiagnosticKind::ConfigShape,
                        Some(&workspace.name),
                        format!("script '{name}' collides with a namespace field and is skipped"),
                    );
                    continue;
                }
                let shares_request = config
                    .ancestry(&workspace.name)
                    .chain
                    .iter()
                    .filter_map(|owner| config.workspace(owner))
                    .any(|owner| owner.requests.contains_key(name));
                if shares_request {
                    diagnostics.record(
                        DiagnosticKind::ConfigShape,
                        Some(&workspace.name),
                        format!("script '{name}' shares its name with a request and is skipped"),
                    );
                    continue;
                }

                let key = script_key(Some(&workspace.name), name);
                recorded.insert(
                    key.clone(),
                    RecordedScript {
                        key,
                        name: name.clone(),
                        owner: Some(workspace.name.clone()),
                        definition: definition.clone(),
                    },
                );
            }
        }

        let active_chain = settings
            .limit_to_active_chain
            .then(|| config.active_workspace.as_deref().map(|a| config.ancestry(a)))
            .flatten();

        Self {
            shared: Arc::new(Shared {
                config,
                diagnostics,
                executor,
                bridge,
                active_chain,
                recorded,
                compiled: Mutex::new(BTreeSet::new()),
                memo: Mutex::new(HashMap::new()),
                compiles: AtomicU64::new(0),
                hits: AtomicU64::new(0),
            }),
        }
    }

    /// Install `workspaces`, `scripts` and `call_script` into `lua`
    pub fn install(&self, lua: &Lua) -> Result<()> {
        self.shared.install(lua)?;
        debug!(recorded = self.shared.recorded.len(), "Workspace projection installed");
        Ok(())
    }

    /// Namespace table for `name`, created on first use
    ///
    /// `None` for unknown workspaces and, when projection is limited, for
    /// workspaces outside the active chain.
    pub fn namespace<'lua>(&self, lua: &'lua Lua, name: &str) -> Result<Option<Table<'lua>>> {
        Ok(self.shared.ensure_namespace(lua, name)?)
    }

    /// Host view of a namespace's workspace value for Lua callers
    pub fn namespace_value<'lua>(&self, lua: &'lua Lua, name: Option<&str>) -> Result<Value<'lua>> {
        Ok(match name {
            Some(name) => self.namespace(lua, name)?.map_or(Value::Nil, Value::Table),
            None => Value::Nil,
        })
    }

    /// Definition and owner of the script `name` as seen from `workspace`
    pub fn script(&self, workspace: Option<&str>, name: &str) -> Option<(Option<String>, ScriptDefinition)> {
        self.shared
            .find_script(workspace, name)
            .map(|r| (r.owner.clone(), r.definition.clone()))
    }

    /// Names of scripts recorded on `workspace` itself (or root scripts for `None`)
    pub fn own_scripts(&self, workspace: Option<&str>) -> Vec<String> {
        self.shared
            .recorded
            .values()
            .filter(|r| r.owner.as_deref() == workspace)
            .map(|r| r.name.clone())
            .collect()
    }

    /// Resolve and compile `name` without calling it
    ///
    /// Returns whether this call compiled it.
    pub fn compile(&self, lua: &Lua, workspace: Option<&str>, name: &str) -> Result<bool> {
        let before = self.compile_count();
        self.shared.resolve_script(lua, workspace, name)?;
        Ok(self.compile_count() > before)
    }

    /// Recorded native wrapper behind script `name` as seen from `workspace`
    ///
    /// Present once the script has been resolved and its primary body is
    /// written for the native engine.
    pub fn native_wrapper(&self, workspace: Option<&str>, name: &str) -> Option<Arc<CompiledWrapperDef>> {
        let recorded = self.shared.find_script(workspace, name)?;
        match recorded.definition.body.primary() {
            Some((ScriptLanguage::Rhai, _)) => self.shared.bridge.as_ref()?.registry().get(&recorded.key),
            _ => None,
        }
    }

    /// Call script `name` with host arguments, returning its first result
    pub fn call(&self, lua: &Lua, workspace: Option<&str>, name: &str, args: Vec<HostValue>) -> Result<HostValue> {
        let function = self.shared.lookup(lua, workspace, name)?;
        let args = args
            .iter()
            .map(|a| json_to_lua(lua, a))
            .collect::<mlua::Result<Vec<_>>>()?;
        let results = function.call::<_, MultiValue>(MultiValue::from_vec(args))?;
        let first = results.into_iter().next().unwrap_or(Value::Nil);
        Ok(lua_to_json(&first)?)
    }

    /// Whether the script `name` owned by `owner` has been compiled
    pub fn is_compiled(&self, owner: Option<&str>, name: &str) -> bool {
        self.shared.compiled.lock().contains(&script_key(owner, name))
    }

    /// Number of script compilations so far
    pub fn compile_count(&self) -> u64 {
        self.shared.compiles.load(Ordering::Relaxed)
    }

    /// Projection cache statistics
    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            cached_scripts: self.shared.compiled.lock().len(),
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.compile_count(),
        }
    }
}

impl Shared {
    fn install(self: &Arc<Self>, lua: &Lua) -> mlua::Result<()> {
        let globals = lua.globals();

        let workspaces = lua.create_table()?;
        let meta = lua.create_table()?;
        let shared = Arc::clone(self);
        meta.set(
            "__index",
            lua.create_function(move |lua, (_, key): (Table, Value)| match key {
                Value::String(name) => {
                    let name = name.to_str()?.to_string();
                    Ok(shared.ensure_namespace(lua, &name)?.map_or(Value::Nil, Value::Table))
                }
                _ => Ok(Value::Nil),
            })?,
        )?;
        workspaces.set_metatable(Some(meta));
        lua.set_named_registry_value(WORKSPACES_KEY, workspaces.clone())?;
        globals.set(WORKSPACES_GLOBAL, workspaces)?;

        let scripts = lua.create_table()?;
        let meta = lua.create_table()?;
        let shared = Arc::clone(self);
        meta.set(
            "__index",
            lua.create_function(move |lua, (_, key): (Table, Value)| match key {
                Value::String(name) => {
                    let name = name.to_str()?.to_string();
                    Ok(Value::Function(shared.resolve_script(lua, None, &name)?))
                }
                _ => Ok(Value::Nil),
            })?,
        )?;
        scripts.set_metatable(Some(meta));
        lua.set_named_registry_value(SCRIPTS_KEY, scripts.clone())?;
        globals.set(SCRIPTS_GLOBAL, scripts)?;

        let shared = Arc::clone(self);
        globals.set(
            CALL_SCRIPT_GLOBAL,
            lua.create_function(
                move |lua, (workspace, name, args): (Option<String>, String, Variadic<Value>)| {
                    let function = shared.lookup(lua, workspace.as_deref(), &name)?;
                    function.call::<_, MultiValue>(MultiValue::from_vec(args.to_vec()))
                },
            )?,
        )?;

        Ok(())
    }

    fn ensure_namespace<'lua>(self: &Arc<Self>, lua: &'lua Lua, name: &str) -> mlua::Result<Option<Table<'lua>>> {
        let root: Table = lua.named_registry_value(WORKSPACES_KEY)?;
        if let Value::Table(existing) = root.raw_get::<_, Value>(name)? {
            return Ok(Some(existing));
        }

        let Some(workspace) = self.config.workspace(name) else {
            return Ok(None);
        };
        if let Some(chain) = &self.active_chain {
            if !chain.contains(name) {
                self.diagnostics.record(
                    DiagnosticKind::ConfigShape,
                    Some(name),
                    "workspace is outside the active chain and is not projected",
                );
                return Ok(None);
            }
        }

        let namespace = lua.create_table()?;
        namespace.raw_set("name", name)?;
        namespace.raw_set("extends", workspace.extend.clone())?;
        namespace.raw_set("base_url", workspace.base_url.clone())?;
        namespace.raw_set("hidden", workspace.is_hidden)?;
        namespace.raw_set(
            "properties",
            json_to_lua(lua, &HostValue::Object(workspace.properties.clone()))?,
        )?;

        let requests = lua.create_table()?;
        for (request_name, request) in self.visible_requests(name) {
            let shim = self.request_table(lua, name, &request_name, request)?;
            requests.raw_set(request_name.as_str(), shim.clone())?;
            if !RESERVED_MEMBERS.contains(&request_name.as_str()) {
                namespace.raw_set(request_name.as_str(), shim)?;
            }
        }
        namespace.raw_set("requests", requests)?;

        namespace.set_metatable(Some(self.namespace_meta(lua, name)?));
        root.raw_set(name, namespace.clone())?;
        debug!(workspace = name, "Workspace namespace projected");
        Ok(Some(namespace))
    }

    /// Parent of `name`, when it names another defined workspace
    fn parent_of(&self, name: &str) -> Option<String> {
        self.config
            .workspace(name)?
            .extend
            .as_ref()
            .filter(|parent| parent.as_str() != name && self.config.workspace(parent).is_some())
            .cloned()
    }

    /// Requests of `name` and its ancestors, child definitions winning
    fn visible_requests(&self, name: &str) -> BTreeMap<String, &RequestDefinition> {
        let mut visible = BTreeMap::new();
        for owner in self.config.ancestry(name).chain {
            if let Some(workspace) = self.config.workspace(&owner) {
                for (key, request) in &workspace.requests {
                    visible.insert(key.clone(), request);
                }
            }
        }
        visible
    }

    fn request_table<'lua>(
        &self,
        lua: &'lua Lua,
        workspace: &str,
        name: &str,
        request: &RequestDefinition,
    ) -> mlua::Result<Table<'lua>> {
        let table = lua.create_table()?;
        table.raw_set("name", name)?;
        table.raw_set("method", request.method.as_str())?;
        table.raw_set("endpoint", request.endpoint.as_str())?;

        let executor = Arc::clone(&self.executor);
        let workspace = workspace.to_string();
        let name = name.to_string();
        let shim = lua.create_function(move |lua, args: Variadic<Value>| {
            let args = args.iter().map(lua_to_json).collect::<mlua::Result<Vec<_>>>()?;
            trace!(workspace = %workspace, request = %name, "Request shim invoked");
            let result = executor
                .execute(&workspace, &name, args)
                .map_err(mlua::Error::external)?;
            json_to_lua(lua, &result)
        })?;
        table.raw_set("execute", shim.clone())?;
        table.raw_set("exec", shim)?;
        Ok(table)
    }

    fn namespace_meta<'lua>(self: &Arc<Self>, lua: &'lua Lua, name: &str) -> mlua::Result<Table<'lua>> {
        let meta = lua.create_table()?;
        let shared = Arc::clone(self);
        let workspace = name.to_string();
        meta.set(
            "__index",
            lua.create_function(move |lua, (namespace, key): (Table, Value)| {
                let Value::String(key) = key else {
                    return Ok(Value::Nil);
                };
                let key = key.to_str()?.to_string();

                if key == "parent" {
                    let base = shared.parent_of(&workspace);
                    let parent = match base {
                        Some(base) => shared.ensure_namespace(lua, &base)?,
                        None => None,
                    };
                    return Ok(match parent {
                        Some(parent) => {
                            namespace.raw_set("parent", parent.clone())?;
                            Value::Table(parent)
                        }
                        None => Value::Nil,
                    });
                }
                if RESERVED_MEMBERS.contains(&key.as_str()) {
                    return Ok(Value::Nil);
                }

                Ok(Value::Function(shared.resolve_script(lua, Some(&workspace), &key)?))
            })?,
        )?;
        Ok(meta)
    }

    /// Recorded script `name` as seen from `workspace`: own, ancestors, root
    fn find_script(&self, workspace: Option<&str>, name: &str) -> Option<&RecordedScript> {
        if let Some(workspace) = workspace {
            let ancestry = self.config.ancestry(workspace);
            for owner in ancestry.chain.iter().rev() {
                if let Some(recorded) = self.recorded.get(&script_key(Some(owner), name)) {
                    return Some(recorded);
                }
            }
        }
        self.recorded.get(&script_key(None, name))
    }

    fn resolve_script<'lua>(
        self: &Arc<Self>,
        lua: &'lua Lua,
        workspace: Option<&str>,
        name: &str,
    ) -> mlua::Result<Function<'lua>> {
        let Some(recorded) = self.find_script(workspace, name) else {
            return self.missing_script(lua, workspace, name);
        };
        let function = self.compiled_function(lua, recorded)?;

        let holder = match workspace {
            Some(workspace) => self.ensure_namespace(lua, workspace)?,
            None => Some(lua.named_registry_value::<Table>(SCRIPTS_KEY)?),
        };
        if let Some(holder) = holder {
            holder.raw_set(name, function.clone())?;
        }
        Ok(function)
    }

    fn compiled_function<'lua>(self: &Arc<Self>, lua: &'lua Lua, recorded: &RecordedScript) -> mlua::Result<Function<'lua>> {
        let cached = self
            .memo
            .lock()
            .get(&recorded.key)
            .map(|key| lua.registry_value::<Function>(key))
            .transpose()?;
        if let Some(function) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(function);
        }

        let function = match recorded.definition.body.primary() {
            Some((ScriptLanguage::Lua, body)) => self.compile_lua(lua, recorded, body),
            Some((ScriptLanguage::Rhai, body)) => self.native_shim(lua, recorded, body),
            None => Err(mlua::Error::external(ScriptError::compilation(
                format!("script '{}'", recorded.key),
                "no body for a known engine",
            ))),
        }?;

        self.compiles.fetch_add(1, Ordering::Relaxed);
        self.compiled.lock().insert(recorded.key.clone());
        let key = lua.create_registry_value(function.clone())?;
        self.memo.lock().insert(recorded.key.clone(), key);
        debug!(script = %recorded.key, "Script compiled");
        Ok(function)
    }

    fn compile_lua<'lua>(self: &Arc<Self>, lua: &'lua Lua, recorded: &RecordedScript, body: &str) -> mlua::Result<Function<'lua>> {
        let params: Vec<String> = recorded
            .definition
            .arguments
            .iter()
            .map(|a| lua_identifier(&a.name))
            .collect();
        let locals = if params.is_empty() {
            String::new()
        } else {
            format!("local {} = ...\n", params.join(", "))
        };
        let source = format!(
            "return function(workspace)\nreturn function(...)\n{locals}{}\nend\nend",
            snippet_source(lua, body)
        );

        let factory = lua
            .load(source)
            .set_name(format!("={}", recorded.key))
            .into_function()
            .map_err(|e| {
                mlua::Error::external(ScriptError::from(e).with_context(format!("script '{}'", recorded.key)))
            })?;
        let outer: Function = factory.call(())?;

        let owner = match &recorded.owner {
            Some(owner) => self.ensure_namespace(lua, owner)?.map_or(Value::Nil, Value::Table),
            None => Value::Nil,
        };
        outer.call(owner)
    }

    fn native_shim<'lua>(&self, lua: &'lua Lua, recorded: &RecordedScript, body: &str) -> mlua::Result<Function<'lua>> {
        let bridge = self
            .bridge
            .clone()
            .ok_or_else(|| mlua::Error::external(ScriptError::NativeUnavailable))?;

        let id = recorded.key.clone();
        if !bridge.registry().contains(&id) {
            bridge.registry().register(CompiledWrapperDef {
                id: id.clone(),
                origin: format!("script '{id}'"),
                body: body.to_string(),
                inject_workspace: true,
                workspace: recorded.owner.clone(),
                arguments: recorded.definition.arguments.clone(),
            });
        }

        let owner = recorded.owner.clone();
        lua.create_function(move |lua, args: Variadic<Value>| {
            let args = args.iter().map(lua_to_json).collect::<mlua::Result<Vec<_>>>()?;
            let result = bridge
                .call(&id, owner.as_deref(), args)
                .map_err(mlua::Error::external)?;
            json_to_lua(lua, &result)
        })
    }

    fn missing_script<'lua>(&self, lua: &'lua Lua, workspace: Option<&str>, name: &str) -> mlua::Result<Function<'lua>> {
        let qualified = match workspace {
            Some(workspace) => format!("{workspace}.{name}"),
            None => name.to_string(),
        };
        lua.create_function(move |_, _: MultiValue| -> mlua::Result<()> {
            Err(mlua::Error::external(ScriptError::ScriptNotFound(qualified.clone())))
        })
    }

    fn lookup<'lua>(self: &Arc<Self>, lua: &'lua Lua, workspace: Option<&str>, name: &str) -> mlua::Result<Function<'lua>> {
        let holder = match workspace {
            Some(workspace) => self
                .ensure_namespace(lua, workspace)?
                .ok_or_else(|| mlua::Error::external(ScriptError::WorkspaceNotFound(workspace.to_string())))?,
            None => lua.named_registry_value::<Table>(SCRIPTS_KEY)?,
        };
        match holder.get::<_, Value>(name)? {
            Value::Function(function) => Ok(function),
            _ => Err(mlua::Error::external(ScriptError::ScriptNotFound(name.to_string()))),
        }
    }
}

fn lua_identifier(name: &str) -> String {
    let mut ident: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if ident.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        ident.insert(0, '_');
    }
    ident
}
