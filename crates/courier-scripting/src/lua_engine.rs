//! Dynamic engine: Lua 5.4 via mlua

use crate::engine::{CacheStats, HostValue, ScriptEngine};
use crate::error::{Result, ScriptError};
use courier_core::ScriptLanguage;
use mlua::{Function, Lua, MultiValue, RegistryKey, Table, Value, Variadic};
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info, trace, warn};

/// Lua engine with a snippet cache
///
/// The state sits behind a re-entrant lock: host callbacks invoked from Lua
/// (request shims, the native bridge) may call back into the engine on the
/// same thread.
pub struct LuaEngine {
    lua: ReentrantMutex<Lua>,
    installed: AtomicBool,
    /// Compiled snippets (source -> function)
    chunks: Mutex<HashMap<String, RegistryKey>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl fmt::Debug for LuaEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LuaEngine")
            .field("installed", &self.installed.load(Ordering::Relaxed))
            .field("cached_chunks", &self.chunks.lock().len())
            .finish()
    }
}

impl LuaEngine {
    /// Create a fresh Lua state with the safe standard libraries
    pub fn new() -> Self {
        Self {
            lua: ReentrantMutex::new(Lua::new()),
            installed: AtomicBool::new(false),
            chunks: Mutex::new(HashMap::new()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    /// Run `f` with exclusive (re-entrant) access to the Lua state
    pub fn with_lua<R>(&self, f: impl FnOnce(&Lua) -> R) -> R {
        let guard = self.lua.lock();
        f(&guard)
    }

    /// Register `log`, `json` and `uuid` helpers
    fn install_helpers(lua: &Lua) -> mlua::Result<()> {
        let globals = lua.globals();

        let log = lua.create_table()?;
        log.set(
            "debug",
            lua.create_function(|_, args: Variadic<Value>| {
                debug!(script_log = %join_values(&args));
                Ok(())
            })?,
        )?;
        log.set(
            "info",
            lua.create_function(|_, args: Variadic<Value>| {
                info!(script_log = %join_values(&args));
                Ok(())
            })?,
        )?;
        log.set(
            "warn",
            lua.create_function(|_, args: Variadic<Value>| {
                warn!(script_log = %join_values(&args));
                Ok(())
            })?,
        )?;
        log.set(
            "error",
            lua.create_function(|_, args: Variadic<Value>| {
                error!(script_log = %join_values(&args));
                Ok(())
            })?,
        )?;
        globals.set("log", log)?;

        let json = lua.create_table()?;
        json.set(
            "encode",
            lua.create_function(|_, value: Value| Ok(lua_to_json(&value)?.to_string()))?,
        )?;
        json.set(
            "decode",
            lua.create_function(|lua, text: String| {
                let parsed: HostValue =
                    serde_json::from_str(&text).map_err(mlua::Error::external)?;
                json_to_lua(lua, &parsed)
            })?,
        )?;
        globals.set("json", json)?;

        globals.set(
            "uuid",
            lua.create_function(|_, ()| Ok(uuid::Uuid::new_v4().to_string()))?,
        )?;

        Ok(())
    }

    /// Compile `code` through the snippet cache
    fn compile_cached<'lua>(&self, lua: &'lua Lua, code: &str) -> mlua::Result<Function<'lua>> {
        let mut chunks = self.chunks.lock();
        if let Some(key) = chunks.get(code) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            trace!("Lua chunk cache hit");
            return lua.registry_value(key);
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let function = compile_snippet(lua, "=eval", code)?;
        let key = lua.create_registry_value(function.clone())?;
        chunks.insert(code.to_string(), key);
        debug!("Lua chunk compiled and cached");
        Ok(function)
    }
}

impl Default for LuaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptEngine for LuaEngine {
    fn language(&self) -> ScriptLanguage {
        ScriptLanguage::Lua
    }

    fn initialize_environment(&self) -> Result<()> {
        if self.installed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.with_lua(Self::install_helpers)?;
        debug!("Lua environment initialized");
        Ok(())
    }

    fn evaluate(&self, code: &str) -> Result<HostValue> {
        self.with_lua(|lua| -> Result<HostValue> {
            let function = self.compile_cached(lua, code)?;
            let value: Value = function.call(())?;
            Ok(lua_to_json(&value)?)
        })
    }

    fn invoke(&self, name: &str, args: &[HostValue]) -> Result<Option<HostValue>> {
        self.with_lua(|lua| -> Result<Option<HostValue>> {
            let target: Value = lua.globals().get(name)?;
            let function = match target {
                Value::Nil => return Ok(None),
                Value::Function(function) => function,
                other => {
                    return Err(ScriptError::type_error(format!(
                        "global '{name}' is a {}, not a function",
                        other.type_name()
                    )))
                }
            };
            let args = args
                .iter()
                .map(|arg| json_to_lua(lua, arg))
                .collect::<mlua::Result<Vec<_>>>()?;
            let value: Value = function.call(MultiValue::from_vec(args))?;
            Ok(Some(lua_to_json(&value)?))
        })
    }

    fn set_global(&self, name: &str, value: HostValue) -> Result<()> {
        self.with_lua(|lua| -> Result<()> {
            lua.globals().set(name, json_to_lua(lua, &value)?)?;
            Ok(())
        })
    }

    fn add_host_object(&self, name: &str, value: HostValue) -> Result<()> {
        self.with_lua(|lua| -> Result<()> {
            let value = match json_to_lua(lua, &value)? {
                Value::Table(table) => Value::Table(read_only(lua, table)?),
                other => other,
            };
            lua.globals().set(name, value)?;
            Ok(())
        })
    }

    fn clear_cache(&self) -> Result<()> {
        self.with_lua(|lua| -> Result<()> {
            for (_, key) in self.chunks.lock().drain() {
                lua.remove_registry_value(key)?;
            }
            debug!("Lua chunk cache cleared");
            Ok(())
        })
    }

    fn cache_stats(&self) -> CacheStats {
        CacheStats {
            cached_scripts: self.chunks.lock().len(),
            hits: self.cache_hits.load(Ordering::Relaxed),
            misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}

/// Whether `body` parses as a single Lua expression
pub fn is_bare_expression(lua: &Lua, body: &str) -> bool {
    let trimmed = body.trim();
    !trimmed.is_empty()
        && lua
            .load(format!("return (\n{trimmed}\n)"))
            .into_function()
            .is_ok()
}

/// Source for a snippet: bare expressions become `return (<expr>)`
pub fn snippet_source(lua: &Lua, body: &str) -> String {
    if is_bare_expression(lua, body) {
        format!("return (\n{}\n)", body.trim())
    } else {
        body.to_string()
    }
}

/// Compile a snippet into a function, applying the bare-expression rule
pub fn compile_snippet<'lua>(lua: &'lua Lua, name: &str, body: &str) -> mlua::Result<Function<'lua>> {
    lua.load(snippet_source(lua, body))
        .set_name(name)
        .into_function()
}

/// Wrap a table in a proxy that rejects writes
pub fn read_only<'lua>(lua: &'lua Lua, table: Table<'lua>) -> mlua::Result<Table<'lua>> {
    let proxy = lua.create_table()?;
    let metatable = lua.create_table()?;
    metatable.set("__index", table)?;
    metatable.set(
        "__newindex",
        lua.create_function(|_, (_, key): (Value, Value)| -> mlua::Result<()> {
            Err(mlua::Error::RuntimeError(format!(
                "attempt to modify read-only host object field '{}'",
                describe(&key)
            )))
        })?,
    )?;
    metatable.set("__metatable", false)?;
    proxy.set_metatable(Some(metatable));
    Ok(proxy)
}

/// Convert a Lua value into a host value
pub fn lua_to_json(value: &Value<'_>) -> mlua::Result<HostValue> {
    Ok(match value {
        Value::Nil => HostValue::Null,
        Value::Boolean(b) => HostValue::Bool(*b),
        Value::Integer(i) => HostValue::from(*i),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(HostValue::Number)
            .unwrap_or(HostValue::Null),
        Value::String(s) => HostValue::String(s.to_str()?.to_string()),
        Value::Table(table) => table_to_json(table)?,
        other => {
            return Err(mlua::Error::RuntimeError(format!(
                "cannot convert a Lua {} to a host value",
                other.type_name()
            )))
        }
    })
}

fn table_to_json(table: &Table<'_>) -> mlua::Result<HostValue> {
    let len = table.raw_len() as usize;
    let mut pairs = Vec::new();
    for pair in table.clone().pairs::<Value, Value>() {
        pairs.push(pair?);
    }

    if len > 0 && pairs.len() == len {
        let mut items = Vec::with_capacity(len);
        for index in 1..=len {
            let item: Value = table.raw_get(index)?;
            items.push(lua_to_json(&item)?);
        }
        return Ok(HostValue::Array(items));
    }

    let mut map = serde_json::Map::new();
    for (key, value) in pairs {
        let key = match &key {
            Value::String(s) => s.to_str()?.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Boolean(b) => b.to_string(),
            other => {
                return Err(mlua::Error::RuntimeError(format!(
                    "cannot use a Lua {} as an object key",
                    other.type_name()
                )))
            }
        };
        map.insert(key, lua_to_json(&value)?);
    }
    Ok(HostValue::Object(map))
}

/// Convert a host value into a Lua value
pub fn json_to_lua<'lua>(lua: &'lua Lua, value: &HostValue) -> mlua::Result<Value<'lua>> {
    Ok(match value {
        HostValue::Null => Value::Nil,
        HostValue::Bool(b) => Value::Boolean(*b),
        HostValue::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => n.as_f64().map(Value::Number).unwrap_or(Value::Nil),
        },
        HostValue::String(s) => Value::String(lua.create_string(s)?),
        HostValue::Array(items) => {
            let table = lua.create_table()?;
            for (index, item) in items.iter().enumerate() {
                table.raw_set(index + 1, json_to_lua(lua, item)?)?;
            }
            Value::Table(table)
        }
        HostValue::Object(map) => {
            let table = lua.create_table()?;
            for (key, item) in map {
                table.raw_set(key.as_str(), json_to_lua(lua, item)?)?;
            }
            Value::Table(table)
        }
    })
}

/// Short text form of a Lua value for logs and messages
pub fn describe(value: &Value<'_>) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::String(s) => s.to_string_lossy().into_owned(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.type_name().to_string(),
    }
}

fn join_values(values: &[Value<'_>]) -> String {
    values.iter().map(describe).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> LuaEngine {
        let engine = LuaEngine::new();
        engine.initialize_environment().unwrap();
        engine
    }

    #[test]
    fn test_evaluate_bare_expression() {
        let engine = engine();
        assert_eq!(engine.evaluate("1 + 2").unwrap(), json!(3));
        assert_eq!(engine.evaluate("'a' .. 'b'").unwrap(), json!("ab"));
    }

    #[test]
    fn test_statement_without_return_is_absent() {
        let engine = engine();
        assert_eq!(engine.evaluate("x = 41").unwrap(), HostValue::Null);
        assert_eq!(engine.evaluate("return x + 1").unwrap(), json!(42));
    }

    #[test]
    fn test_execute_renders_text() {
        let engine = engine();
        assert_eq!(engine.execute("'hello'").unwrap(), "hello");
        assert_eq!(engine.execute("return {1, 2}").unwrap(), "[1,2]");
    }

    #[test]
    fn test_invoke_undefined_is_none() {
        let engine = engine();
        assert_eq!(engine.invoke("missing", &[]).unwrap(), None);

        engine
            .execute("function add(a, b) return a + b end")
            .unwrap();
        assert_eq!(
            engine.invoke("add", &[json!(2), json!(3)]).unwrap(),
            Some(json!(5))
        );
    }

    #[test]
    fn test_host_object_is_read_only() {
        let engine = engine();
        engine
            .add_host_object("env", json!({"region": "eu"}))
            .unwrap();
        assert_eq!(engine.evaluate("env.region").unwrap(), json!("eu"));
        assert!(engine.execute("env.region = 'us'").is_err());

        engine.set_global("counter", json!(1)).unwrap();
        engine.execute("counter = counter + 1").unwrap();
        assert_eq!(engine.evaluate("counter").unwrap(), json!(2));
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let engine = engine();
        engine.execute("log.marker = true").unwrap();
        engine.initialize_environment().unwrap();
        assert_eq!(engine.evaluate("log.marker").unwrap(), json!(true));
    }

    #[test]
    fn test_json_helpers() {
        let engine = engine();
        assert_eq!(
            engine.evaluate(r#"json.decode('{"a":[1,2]}').a[2]"#).unwrap(),
            json!(2)
        );
        assert_eq!(engine.execute("json.encode({ok = true})").unwrap(), r#"{"ok":true}"#);
    }

    #[test]
    fn test_snippet_cache() {
        let engine = engine();
        engine.evaluate("1").unwrap();
        engine.evaluate("1").unwrap();
        let stats = engine.cache_stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);

        engine.clear_cache().unwrap();
        assert_eq!(engine.cache_stats().cached_scripts, 0);
    }

    #[test]
    fn test_syntax_error_is_compilation() {
        let engine = engine();
        let err = engine.execute("if then").unwrap_err();
        assert!(matches!(err, ScriptError::Compilation { .. }));
    }

    #[test]
    fn test_round_trip_nested_value() {
        let engine = engine();
        let value = json!({"headers": {"X": "1"}, "items": [1, "two", false]});
        engine.set_global("payload", value.clone()).unwrap();
        assert_eq!(engine.evaluate("payload").unwrap(), value);
    }
}
