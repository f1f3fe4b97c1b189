//! Override chains for init, pre-request and post-response hooks
//!
//! Levels stack base-first: global, then each workspace on its parent (root
//! workspaces on the global level), then a request on its workspace. A level
//! whose hook is absent, or written for the other engine, passes through to
//! the level below. Bodies reach the level below through `base`.

use crate::bridge::workspace_value;
use crate::context::{PostResponseContext, PreRequestContext};
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::engine::{render_text, HostValue};
use crate::error::{Result, ScriptError};
use crate::lua_engine::{json_to_lua, lua_to_json, snippet_source};
use crate::projector::LazyProjector;
use crate::rhai_engine::{dynamic_to_json, json_to_dynamic, RhaiEngine};
use courier_core::{ScriptBlock, ScriptLanguage, ScriptingConfig};
use dashmap::DashMap;
use mlua::{Function, Lua, RegistryKey, Table, Value};
use parking_lot::Mutex;
use rhai::{Dynamic, AST};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Lua global holding every built hook function by name
pub const HOOKS_GLOBAL: &str = "__hooks";

const ROOT_ID: &str = "root";
const GLOBAL_ID: &str = "global";

/// Which scope a chain level belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChainKey {
    /// Global hooks
    Global,
    /// Workspace hooks
    Workspace(String),
    /// Request hooks on a workspace
    Request {
        /// Workspace the request is invoked on
        workspace: String,
        /// Request name
        request: String,
    },
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Workspace(workspace) => write!(f, "workspace '{workspace}'"),
            Self::Request { workspace, request } => write!(f, "request '{workspace}/{request}'"),
        }
    }
}

/// Hook stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    /// Before the request is sent
    PreRequest,
    /// After the response is received
    PostResponse,
}

impl HookStage {
    fn prefix(self) -> &'static str {
        match self {
            Self::PreRequest => "pre",
            Self::PostResponse => "post",
        }
    }
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PreRequest => "pre-request",
            Self::PostResponse => "post-response",
        })
    }
}

/// Dynamic-engine functions of one level
#[derive(Debug)]
pub struct DynamicLevel {
    pre: RegistryKey,
    post: RegistryKey,
}

/// Native-engine declarations of one level
///
/// `ast` holds this level's functions merged over every level below it.
#[derive(Debug, Clone)]
pub struct NativeLevel {
    /// Level identifier
    pub id: String,
    /// Cumulative AST
    pub ast: AST,
    /// Pre-request function name
    pub pre_fn: String,
    /// Post-response function name
    pub post_fn: String,
    /// Identifier of the level below
    pub base: Option<String>,
}

/// One built level of a handler chain
#[derive(Debug)]
pub struct ChainLevel {
    /// Scope of this level
    pub key: ChainKey,
    /// Unique identifier
    pub id: String,
    /// Identifier of the level below
    pub base: Option<String>,
    /// Workspace whose value hooks receive
    pub workspace: Option<String>,
    dynamic: DynamicLevel,
    native: Option<Arc<NativeLevel>>,
}

impl ChainLevel {
    /// Native declarations, when the native engine is running
    pub fn native(&self) -> Option<&Arc<NativeLevel>> {
        self.native.as_ref()
    }

    /// Run the dynamic pre-request chain on `ctx`
    pub fn dynamic_pre(&self, lua: &Lua, ctx: &mut PreRequestContext) -> Result<()> {
        let function: Function = lua.registry_value(&self.dynamic.pre)?;
        let table = json_to_lua(lua, &ctx.to_host())?;
        function
            .call::<_, ()>(table.clone())
            .map_err(|e| ScriptError::from(e).with_context(format!("{} pre-request", self.key)))?;
        ctx.apply_host(&lua_to_json(&table)?)
    }

    /// Run the dynamic post-response chain, returning the resulting body
    pub fn dynamic_post(&self, lua: &Lua, ctx: &PostResponseContext) -> Result<String> {
        let function: Function = lua.registry_value(&self.dynamic.post)?;
        let table = json_to_lua(lua, &ctx.to_host())?;
        let value: Value = function
            .call(table)
            .map_err(|e| ScriptError::from(e).with_context(format!("{} post-response", self.key)))?;
        Ok(match value {
            Value::Nil => ctx.body.clone(),
            other => render_text(&lua_to_json(&other)?),
        })
    }

    /// Run the native pre-request chain on `ctx`
    pub fn native_pre(&self, native: &RhaiEngine, workspace: &HostValue, ctx: &mut PreRequestContext) -> Result<()> {
        let Some(level) = &self.native else {
            return Ok(());
        };
        let mut this = hook_context(ctx.to_host(), workspace)?;
        native
            .call_hook(&level.ast, &level.pre_fn, &mut this)
            .map_err(|e| e.with_context(format!("{} pre-request", self.key)))?;
        ctx.apply_host(&dynamic_to_json(&this))
    }

    /// Run the native post-response chain, returning the resulting body
    pub fn native_post(&self, native: &RhaiEngine, workspace: &HostValue, ctx: &PostResponseContext) -> Result<String> {
        let Some(level) = &self.native else {
            return Ok(ctx.body.clone());
        };
        let mut this = hook_context(ctx.to_host(), workspace)?;
        let result = native
            .call_hook(&level.ast, &level.post_fn, &mut this)
            .map_err(|e| e.with_context(format!("{} post-response", self.key)))?;
        Ok(if result.is_unit() {
            ctx.body.clone()
        } else {
            render_text(&dynamic_to_json(&result))
        })
    }
}

fn hook_context(mut host: HostValue, workspace: &HostValue) -> Result<Dynamic> {
    if let HostValue::Object(map) = &mut host {
        map.insert("workspace".to_string(), workspace.clone());
    }
    json_to_dynamic(&host)
}

/// Lua source of one level of a stage
///
/// The body sees `ctx`, `base`, `next` and `workspace`. A post-response body
/// returning nothing leaves the body unchanged.
pub fn dynamic_level_source(lua: &Lua, stage: HookStage, body: Option<&str>) -> String {
    let body = match body {
        Some(body) => snippet_source(lua, body),
        None => "return base(ctx)".to_string(),
    };
    let tail = match stage {
        HookStage::PreRequest => "return nil",
        HookStage::PostResponse => "if __result == nil then return ctx.body end\nreturn __result",
    };
    format!(
        "return function(__lower, workspace)\n\
         return function(ctx)\n\
         local base = function(c) return __lower(c or ctx) end\n\
         local next = base\n\
         local __result = (function()\n{body}\nend)()\n\
         {tail}\n\
         end\n\
         end"
    )
}

/// Native source of one level
///
/// Hooks run with `this` bound to the context map; `base` points at the
/// level below and is invoked as `this.call(base)`.
pub fn native_level_source(id: &str, lower: &str, pre: Option<&str>, post: Option<&str>) -> String {
    let pre = pre.unwrap_or("this.call(base);");
    let post = post.unwrap_or("this.call(base)");
    format!(
        "fn pre_{id}() {{\n\
         let base = Fn(\"pre_{lower}\");\n\
         {pre}\n\
         }}\n\
         fn post_{id}() {{\n\
         let base = Fn(\"post_{lower}\");\n\
         let hook_result = {{\n{post}\n}};\n\
         if type_of(hook_result) == \"()\" {{ this.body }} else {{ hook_result }}\n\
         }}\n"
    )
}

fn native_root_source() -> String {
    format!("fn pre_{ROOT_ID}() {{ }}\nfn post_{ROOT_ID}() {{ this.body }}\n")
}

/// Builds and caches chain levels
pub struct HandlerChains {
    config: Arc<ScriptingConfig>,
    diagnostics: Diagnostics,
    projector: LazyProjector,
    native: Option<Arc<RhaiEngine>>,
    global: Mutex<Option<Arc<ChainLevel>>>,
    workspaces: DashMap<String, Arc<ChainLevel>>,
    requests: DashMap<(String, String), Arc<ChainLevel>>,
    workspace_lock: Mutex<()>,
    request_lock: Mutex<()>,
    initialized: Mutex<HashSet<String>>,
    sequence: AtomicU64,
}

impl fmt::Debug for HandlerChains {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerChains")
            .field("workspaces", &self.workspaces.len())
            .field("requests", &self.requests.len())
            .field("initialized", &self.initialized.lock().len())
            .field("native", &self.native.is_some())
            .finish()
    }
}

impl HandlerChains {
    /// Create an empty chain cache
    pub fn new(
        config: Arc<ScriptingConfig>,
        diagnostics: Diagnostics,
        projector: LazyProjector,
        native: Option<Arc<RhaiEngine>>,
    ) -> Self {
        Self {
            config,
            diagnostics,
            projector,
            native,
            global: Mutex::new(None),
            workspaces: DashMap::new(),
            requests: DashMap::new(),
            workspace_lock: Mutex::new(()),
            request_lock: Mutex::new(()),
            initialized: Mutex::new(HashSet::new()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Global level, built on first use
    pub fn global_level(&self, lua: &Lua) -> Result<Arc<ChainLevel>> {
        let mut global = self.global.lock();
        if let Some(level) = global.as_ref() {
            return Ok(Arc::clone(level));
        }

        let terminal_pre: Function = lua.load("return function(ctx) end").set_name("=root pre").call(())?;
        let terminal_post: Function = lua
            .load("return function(ctx) return ctx.body end")
            .set_name("=root post")
            .call(())?;
        let terminal = (terminal_pre, terminal_post);

        let native_root = match &self.native {
            Some(native) => Some(Arc::new(NativeLevel {
                id: ROOT_ID.to_string(),
                ast: native.compile("chain root", &native_root_source())?,
                pre_fn: format!("pre_{ROOT_ID}"),
                post_fn: format!("post_{ROOT_ID}"),
                base: None,
            })),
            None => None,
        };

        let level = Arc::new(self.build_level(
            lua,
            ChainKey::Global,
            GLOBAL_ID.to_string(),
            None,
            terminal,
            native_root.as_deref(),
            &self.config.pre_request,
            &self.config.post_response,
        )?);
        *global = Some(Arc::clone(&level));
        Ok(level)
    }

    /// Level of workspace `name`, building its ancestors first
    pub fn workspace_level(&self, lua: &Lua, name: &str) -> Result<Arc<ChainLevel>> {
        if let Some(level) = self.workspaces.get(name) {
            return Ok(Arc::clone(level.value()));
        }
        let _guard = self.workspace_lock.lock();
        self.build_workspace(lua, name, &mut Vec::new())
    }

    /// Level of `request` invoked on `workspace`
    ///
    /// A request no workspace in the chain declares uses the workspace level.
    pub fn request_level(&self, lua: &Lua, workspace: &str, request: &str) -> Result<Arc<ChainLevel>> {
        let key = (workspace.to_string(), request.to_string());
        if let Some(level) = self.requests.get(&key) {
            return Ok(Arc::clone(level.value()));
        }

        let _guard = self.request_lock.lock();
        if let Some(level) = self.requests.get(&key) {
            return Ok(Arc::clone(level.value()));
        }

        let lower = self.workspace_level(lua, workspace)?;
        let Some((_, definition)) = self.config.find_request(workspace, request) else {
            debug!(workspace, request, "Request not declared, using workspace hooks");
            return Ok(lower);
        };

        let id = format!(
            "r{}_{}_{}",
            self.sequence.fetch_add(1, Ordering::Relaxed),
            identifier(workspace),
            identifier(request)
        );
        let level = Arc::new(self.build_level_on(
            lua,
            ChainKey::Request {
                workspace: workspace.to_string(),
                request: request.to_string(),
            },
            id,
            Some(workspace),
            &lower,
            &definition.pre_request,
            &definition.post_response,
        )?);
        self.requests.insert(key, Arc::clone(&level));
        Ok(level)
    }

    /// Level for `workspace`, or for `request` on it when given
    pub fn level(&self, lua: &Lua, workspace: &str, request: Option<&str>) -> Result<Arc<ChainLevel>> {
        if self.config.workspace(workspace).is_none() {
            return Err(ScriptError::WorkspaceNotFound(workspace.to_string()));
        }
        match request {
            Some(request) => self.request_level(lua, workspace, request),
            None => self.workspace_level(lua, workspace),
        }
    }

    /// Run init bodies for `name` and its uninitialized ancestors, base-first
    ///
    /// Returns the workspaces initialized by this call, in run order. The
    /// pending workspaces are claimed before any body runs, so a body that
    /// re-enters activation sees them as initialized. A failing body releases
    /// its claim and the claims of the workspaces after it.
    pub fn initialize_workspace(&self, lua: &Lua, name: &str) -> Result<Vec<String>> {
        let order = {
            let mut initialized = self.initialized.lock();
            let mut order = Vec::new();
            self.pending_inits(name, &mut Vec::new(), &initialized, &mut order)?;
            initialized.extend(order.iter().cloned());
            order
        };

        for (index, workspace) in order.iter().enumerate() {
            if let Err(e) = self.run_init(lua, workspace) {
                let mut initialized = self.initialized.lock();
                for pending in &order[index..] {
                    initialized.remove(pending);
                }
                return Err(e);
            }
            debug!(workspace = %workspace, "Workspace initialized");
        }
        Ok(order)
    }

    /// Whether `name` has run, or is running, its init chain
    pub fn is_initialized(&self, name: &str) -> bool {
        self.initialized.lock().contains(name)
    }

    fn pending_inits(
        &self,
        name: &str,
        resolving: &mut Vec<String>,
        initialized: &HashSet<String>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        if initialized.contains(name) || order.iter().any(|o| o == name) {
            return Ok(());
        }
        let workspace = self
            .config
            .workspace(name)
            .ok_or_else(|| ScriptError::WorkspaceNotFound(name.to_string()))?;

        resolving.push(name.to_string());
        if let Some(parent) = &workspace.extend {
            if resolving.iter().any(|r| r == parent) {
                self.record_cycle(name, parent, resolving);
            } else if self.config.workspace(parent).is_none() {
                self.record_unresolved(name, parent);
            } else {
                self.pending_inits(parent, resolving, initialized, order)?;
            }
        }
        resolving.pop();

        order.push(name.to_string());
        Ok(())
    }

    fn run_init(&self, lua: &Lua, name: &str) -> Result<()> {
        let Some(workspace) = self.config.workspace(name) else {
            return Err(ScriptError::WorkspaceNotFound(name.to_string()));
        };

        if let (Some(native), Some(body)) = (&self.native, workspace.init.body_for(ScriptLanguage::Rhai)) {
            native.set_variable("workspace", json_to_dynamic(&workspace_value(&self.config, Some(name)))?);
            native
                .run_in_session(body)
                .map_err(|e| e.with_context(format!("workspace '{name}' init")))?;
        }
        if let Some(body) = workspace.init.body_for(ScriptLanguage::Lua) {
            let source = format!("return function(workspace)\n{body}\nend");
            let init: Function = lua
                .load(source)
                .set_name(format!("={name} init"))
                .call(())
                .map_err(|e| ScriptError::from(e).with_context(format!("workspace '{name}' init")))?;
            let namespace = self.projector.namespace_value(lua, Some(name))?;
            init.call::<_, ()>(namespace)
                .map_err(|e| ScriptError::from(e).with_context(format!("workspace '{name}' init")))?;
        }
        Ok(())
    }

    fn build_workspace(&self, lua: &Lua, name: &str, resolving: &mut Vec<String>) -> Result<Arc<ChainLevel>> {
        if let Some(level) = self.workspaces.get(name) {
            return Ok(Arc::clone(level.value()));
        }
        let workspace = self
            .config
            .workspace(name)
            .ok_or_else(|| ScriptError::WorkspaceNotFound(name.to_string()))?;

        resolving.push(name.to_string());
        let lower = match &workspace.extend {
            None => self.global_level(lua),
            Some(parent) if resolving.iter().any(|r| r == parent) => {
                self.record_cycle(name, parent, resolving);
                self.global_level(lua)
            }
            Some(parent) if self.config.workspace(parent).is_none() => {
                self.record_unresolved(name, parent);
                self.global_level(lua)
            }
            Some(parent) => self.build_workspace(lua, parent, resolving),
        };
        resolving.pop();
        let lower = lower?;

        let id = format!(
            "w{}_{}",
            self.sequence.fetch_add(1, Ordering::Relaxed),
            identifier(name)
        );
        let level = Arc::new(self.build_level_on(
            lua,
            ChainKey::Workspace(name.to_string()),
            id,
            Some(name),
            &lower,
            &workspace.pre_request,
            &workspace.post_response,
        )?);
        trace!(workspace = name, level = %level.id, base = ?level.base, "Workspace chain level built");
        self.workspaces.insert(name.to_string(), Arc::clone(&level));
        Ok(level)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_level_on(
        &self,
        lua: &Lua,
        key: ChainKey,
        id: String,
        workspace: Option<&str>,
        lower: &ChainLevel,
        pre: &ScriptBlock,
        post: &ScriptBlock,
    ) -> Result<ChainLevel> {
        let lower_pre: Function = lua.registry_value(&lower.dynamic.pre)?;
        let lower_post: Function = lua.registry_value(&lower.dynamic.post)?;
        let mut level = self.build_level(
            lua,
            key,
            id,
            workspace,
            (lower_pre, lower_post),
            lower.native.as_deref(),
            pre,
            post,
        )?;
        level.base = Some(lower.id.clone());
        Ok(level)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_level<'lua>(
        &self,
        lua: &'lua Lua,
        key: ChainKey,
        id: String,
        workspace: Option<&str>,
        lower: (Function<'lua>, Function<'lua>),
        lower_native: Option<&NativeLevel>,
        pre: &ScriptBlock,
        post: &ScriptBlock,
    ) -> Result<ChainLevel> {
        let namespace = self.projector.namespace_value(lua, workspace)?;
        let hooks = hooks_table(lua)?;

        let pre_fn = self.dynamic_function(lua, &key, HookStage::PreRequest, pre, lower.0, namespace.clone())?;
        let post_fn = self.dynamic_function(lua, &key, HookStage::PostResponse, post, lower.1, namespace)?;
        hooks.raw_set(format!("pre_{id}"), pre_fn.clone())?;
        hooks.raw_set(format!("post_{id}"), post_fn.clone())?;
        let dynamic = DynamicLevel {
            pre: lua.create_registry_value(pre_fn)?,
            post: lua.create_registry_value(post_fn)?,
        };

        let native = match (&self.native, lower_native) {
            (Some(native), Some(lower)) => {
                let source = native_level_source(
                    &id,
                    &lower.id,
                    pre.body_for(ScriptLanguage::Rhai),
                    post.body_for(ScriptLanguage::Rhai),
                );
                let compiled = native
                    .compile(&key.to_string(), &source)
                    .map_err(|e| e.with_context(format!("{key} hooks")))?;
                Some(Arc::new(NativeLevel {
                    id: id.clone(),
                    ast: lower.ast.merge(&compiled),
                    pre_fn: format!("pre_{id}"),
                    post_fn: format!("post_{id}"),
                    base: Some(lower.id.clone()),
                }))
            }
            _ => None,
        };

        debug!(level = %id, scope = %key, "Chain level built");
        Ok(ChainLevel {
            key,
            id,
            base: None,
            workspace: workspace.map(str::to_string),
            dynamic,
            native,
        })
    }

    fn dynamic_function<'lua>(
        &self,
        lua: &'lua Lua,
        key: &ChainKey,
        stage: HookStage,
        block: &ScriptBlock,
        lower: Function<'lua>,
        workspace: Value<'lua>,
    ) -> Result<Function<'lua>> {
        let source = dynamic_level_source(lua, stage, block.body_for(ScriptLanguage::Lua));
        let factory: Function = lua
            .load(source)
            .set_name(format!("={key} {}", stage.prefix()))
            .call(())
            .map_err(|e| ScriptError::from(e).with_context(format!("{key} {stage}")))?;
        Ok(factory.call((lower, workspace))?)
    }

    fn record_cycle(&self, name: &str, parent: &str, resolving: &[String]) {
        let mut path = resolving.to_vec();
        path.push(parent.to_string());
        self.diagnostics.record(
            DiagnosticKind::InheritanceCycle,
            Some(name),
            format!("inheritance cycle {}; '{name}' sits on the global level", path.join(" -> ")),
        );
    }

    fn record_unresolved(&self, name: &str, parent: &str) {
        self.diagnostics.record(
            DiagnosticKind::UnresolvedParent,
            Some(name),
            format!("parent workspace '{parent}' does not exist; '{name}' sits on the global level"),
        );
    }
}

fn hooks_table<'lua>(lua: &'lua Lua) -> mlua::Result<Table<'lua>> {
    let globals = lua.globals();
    match globals.raw_get::<_, Value>(HOOKS_GLOBAL)? {
        Value::Table(table) => Ok(table),
        _ => {
            let table = lua.create_table()?;
            globals.raw_set(HOOKS_GLOBAL, table.clone())?;
            Ok(table)
        }
    }
}

fn identifier(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
