//! Cross-engine bridge: Lua callers reaching native-engine wrappers
//!
//! A wrapper is recorded as body text plus a declared signature and is only
//! compiled into the native engine the first time it is called. Arguments are
//! coerced to their declared types on every call.

use crate::coercion::{bind_arguments, EnumRegistry};
use crate::engine::HostValue;
use crate::error::{Result, ScriptError};
use crate::lua_engine::{json_to_lua, lua_to_json};
use crate::rhai_engine::{dynamic_to_json, json_to_dynamic, RhaiEngine};
use courier_core::{Argument, ScriptingConfig};
use dashmap::DashMap;
use mlua::{Lua, Table, Value};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use rhai::AST;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Name of the Lua global that routes into the native engine
pub const NATIVE_CALL: &str = "native_call";

static RETURN_KEYWORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\breturn\b").expect("valid regex"));

/// Recorded native wrapper, compiled on first call
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledWrapperDef {
    /// Registry key
    pub id: String,
    /// Human-readable origin for diagnostics
    pub origin: String,
    /// Body text as written
    pub body: String,
    /// Pass the owning workspace as a leading `workspace` parameter
    pub inject_workspace: bool,
    /// Owning workspace, if any
    pub workspace: Option<String>,
    /// Declared arguments, in order
    pub arguments: Vec<Argument>,
}

impl CompiledWrapperDef {
    /// Declared `(type token, name)` pairs
    pub fn signature(&self) -> Vec<(String, String)> {
        self.arguments
            .iter()
            .map(|a| (a.type_token.clone(), a.name.clone()))
            .collect()
    }

    /// Name of the generated native function
    pub fn function_name(&self) -> String {
        format!("wrapper_{}", identifier(&self.id))
    }

    /// Generated native source for this wrapper
    pub fn source(&self, native: &RhaiEngine) -> String {
        let mut params = Vec::with_capacity(self.arguments.len() + 1);
        if self.inject_workspace {
            params.push("workspace".to_string());
        }
        params.extend(self.arguments.iter().map(|a| identifier(&a.name)));

        format!(
            "fn {}({}) {{\n{}\n}}\n",
            self.function_name(),
            params.join(", "),
            wrapper_body(native, &self.body)
        )
    }
}

/// Body of a generated wrapper
///
/// A bare expression is returned; other bodies return unit unless they
/// contain an explicit `return`. The body is closed with an empty statement
/// first, so a trailing unterminated expression still parses.
pub fn wrapper_body(native: &RhaiEngine, body: &str) -> String {
    if native.is_bare_expression(body) {
        format!("return ({});", body.trim())
    } else if RETURN_KEYWORD.is_match(body) {
        body.to_string()
    } else {
        format!("{}\n;\nreturn ();", body.trim_end())
    }
}

fn identifier(name: &str) -> String {
    let mut ident: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if ident.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        ident.insert(0, '_');
    }
    ident
}

/// Recorded wrappers and their compiled forms
#[derive(Debug, Default)]
pub struct WrapperRegistry {
    defs: DashMap<String, Arc<CompiledWrapperDef>>,
    compiled: DashMap<String, Arc<AST>>,
    compile_lock: Mutex<()>,
    compile_count: AtomicU64,
}

impl WrapperRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a wrapper, dropping any compiled form of a previous definition
    pub fn register(&self, def: CompiledWrapperDef) {
        self.compiled.remove(&def.id);
        trace!(wrapper = %def.id, "Wrapper recorded");
        self.defs.insert(def.id.clone(), Arc::new(def));
    }

    /// Look up a recorded wrapper
    pub fn get(&self, id: &str) -> Option<Arc<CompiledWrapperDef>> {
        self.defs.get(id).map(|d| Arc::clone(d.value()))
    }

    /// Whether `id` is recorded
    pub fn contains(&self, id: &str) -> bool {
        self.defs.contains_key(id)
    }

    /// Whether `id` has been compiled
    pub fn is_compiled(&self, id: &str) -> bool {
        self.compiled.contains_key(id)
    }

    /// Number of wrapper compilations so far
    pub fn compile_count(&self) -> u64 {
        self.compile_count.load(Ordering::Relaxed)
    }

    /// Compiled form of `def`, compiling it on first use
    pub fn compiled(&self, def: &CompiledWrapperDef, native: &RhaiEngine) -> Result<Arc<AST>> {
        if let Some(ast) = self.compiled.get(&def.id) {
            return Ok(Arc::clone(ast.value()));
        }

        let _guard = self.compile_lock.lock();
        if let Some(ast) = self.compiled.get(&def.id) {
            return Ok(Arc::clone(ast.value()));
        }

        let ast = Arc::new(
            native
                .compile(&def.origin, &def.source(native))
                .map_err(|e| e.with_context(format!("wrapper '{}'", def.id)))?,
        );
        self.compile_count.fetch_add(1, Ordering::Relaxed);
        self.compiled.insert(def.id.clone(), Arc::clone(&ast));
        debug!(wrapper = %def.id, "Wrapper compiled");
        Ok(ast)
    }

    /// Drop every wrapper
    pub fn clear(&self) {
        self.compiled.clear();
        self.defs.clear();
    }
}

/// Routes calls into native wrappers
#[derive(Debug)]
pub struct NativeBridge {
    registry: WrapperRegistry,
    native: Arc<RhaiEngine>,
    config: Arc<ScriptingConfig>,
    enums: RwLock<EnumRegistry>,
}

impl NativeBridge {
    /// Create a bridge over `native`
    pub fn new(native: Arc<RhaiEngine>, config: Arc<ScriptingConfig>) -> Self {
        Self {
            registry: WrapperRegistry::new(),
            native,
            config,
            enums: RwLock::new(EnumRegistry::default()),
        }
    }

    /// Use `enums` for argument coercion
    pub fn with_enums(self, enums: EnumRegistry) -> Self {
        *self.enums.write() = enums;
        self
    }

    /// Wrapper registry
    pub fn registry(&self) -> &WrapperRegistry {
        &self.registry
    }

    /// Register or replace enumeration `name` for argument coercion
    pub fn register_enum<S: Into<String>>(&self, name: &str, members: impl IntoIterator<Item = (S, i64)>) {
        self.enums.write().register(name, members);
    }

    /// Native engine behind the bridge
    pub fn native(&self) -> &Arc<RhaiEngine> {
        &self.native
    }

    /// Call wrapper `id` with positional host values
    ///
    /// `workspace` overrides the wrapper's owning workspace for the injected
    /// parameter.
    pub fn call(&self, id: &str, workspace: Option<&str>, args: Vec<HostValue>) -> Result<HostValue> {
        let def = self
            .registry
            .get(id)
            .ok_or_else(|| ScriptError::ScriptNotFound(id.to_string()))?;
        let ast = self.registry.compiled(&def, &self.native)?;

        let mut values = Vec::with_capacity(def.arguments.len() + 1);
        if def.inject_workspace {
            let owner = workspace.or(def.workspace.as_deref());
            values.push(json_to_dynamic(&workspace_value(&self.config, owner))?);
        }
        let bound = bind_arguments(id, &def.arguments, args, &self.enums.read())?;
        for coerced in bound {
            values.push(coerced.into_dynamic()?);
        }

        trace!(wrapper = %id, args = values.len(), "Calling native wrapper");
        let result = self
            .native
            .call_fn(&ast, &def.function_name(), values)
            .map_err(|e| e.with_context(format!("wrapper '{id}'")))?;
        Ok(dynamic_to_json(&result))
    }

    /// Install `native_call(wrapper_id, args_table [, workspace])` into Lua
    pub fn install(self: &Arc<Self>, lua: &Lua) -> mlua::Result<()> {
        let bridge = Arc::clone(self);
        let native_call = lua.create_function(
            move |lua, (id, args, workspace): (String, Option<Table>, Option<String>)| {
                let args = match args {
                    Some(table) => match lua_to_json(&Value::Table(table))? {
                        HostValue::Array(items) => items,
                        HostValue::Object(map) if map.is_empty() => Vec::new(),
                        _ => {
                            return Err(mlua::Error::external(ScriptError::Bridge(format!(
                                "native_call('{id}') expects a sequence of arguments"
                            ))))
                        }
                    },
                    None => Vec::new(),
                };
                let result = bridge
                    .call(&id, workspace.as_deref(), args)
                    .map_err(mlua::Error::external)?;
                json_to_lua(lua, &result)
            },
        )?;
        lua.globals().set(NATIVE_CALL, native_call)
    }
}

/// Host view of a workspace passed to wrappers and init bodies
pub fn workspace_value(config: &ScriptingConfig, name: Option<&str>) -> HostValue {
    match name.and_then(|n| config.workspace(n)) {
        Some(workspace) => json!({
            "name": workspace.name,
            "extends": workspace.extend,
            "base_url": workspace.base_url,
            "hidden": workspace.is_hidden,
            "properties": workspace.properties,
        }),
        None => HostValue::Null,
    }
}
