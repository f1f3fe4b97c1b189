//! Native engine: Rhai with a persistent session
//!
//! Successive `execute`/`evaluate` calls chain onto the same session: global
//! `let` variables stay in the session scope and `fn` declarations are merged
//! into the session library, so later snippets, wrappers and hooks can use
//! them.

use crate::engine::{CacheStats, HostValue, ScriptEngine};
use crate::error::{Result, ScriptError};
use chrono::{DateTime, Datelike, FixedOffset};
use courier_core::ScriptLanguage;
use courier_config::ScriptingSettings;
use parking_lot::Mutex;
use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, Scope, AST};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace, warn};
use url::Url;
use uuid::Uuid;

/// Value of a registered enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumValue {
    /// Enumeration type name
    pub type_name: String,
    /// Member name, or the number as text for unnamed values
    pub member: String,
    /// Underlying integral value
    pub value: i64,
}

/// Scope and accumulated function library of the native session
#[derive(Debug)]
struct NativeSession {
    scope: Scope<'static>,
    lib: AST,
}

impl NativeSession {
    fn new() -> Self {
        Self {
            scope: Scope::new(),
            lib: AST::empty(),
        }
    }
}

/// Rhai engine with a REPL-style session
#[derive(Debug)]
pub struct RhaiEngine {
    /// Rhai engine instance
    engine: Engine,
    session: Mutex<NativeSession>,
    compilations: AtomicU64,
}

impl RhaiEngine {
    /// Create new Rhai engine with default settings
    pub fn new() -> Self {
        Self::with_settings(&ScriptingSettings::default())
    }

    /// Create engine honoring the operation budget in `settings`
    pub fn with_settings(settings: &ScriptingSettings) -> Self {
        let mut engine = Engine::new();

        engine.set_max_expr_depths(64, 32);
        engine.set_max_operations(settings.max_operations);
        engine.set_max_string_size(1024 * 1024);
        engine.set_max_array_size(10_000);
        engine.set_max_map_size(10_000);

        engine.on_print(|text| info!(script_log = text));
        engine.on_debug(|text, source, pos| {
            debug!(script_log = text, source = ?source, position = %pos);
        });

        Self::register_types(&mut engine);
        Self::register_functions(&mut engine);

        Self {
            engine,
            session: Mutex::new(NativeSession::new()),
            compilations: AtomicU64::new(0),
        }
    }

    /// Register the typed values arguments are coerced into
    fn register_types(engine: &mut Engine) {
        engine
            .register_type_with_name::<Uuid>("Guid")
            .register_fn("to_string", |g: &mut Uuid| g.to_string())
            .register_fn("==", |a: Uuid, b: Uuid| a == b)
            .register_fn("!=", |a: Uuid, b: Uuid| a != b)
            .register_fn("parse_guid", |s: &str| -> std::result::Result<Uuid, Box<EvalAltResult>> {
                Uuid::parse_str(s).map_err(|e| format!("invalid Guid '{s}': {e}").into())
            });

        engine
            .register_type_with_name::<DateTime<FixedOffset>>("DateTime")
            .register_fn("to_string", |d: &mut DateTime<FixedOffset>| d.to_rfc3339())
            .register_get("year", |d: &mut DateTime<FixedOffset>| d.year() as i64)
            .register_get("month", |d: &mut DateTime<FixedOffset>| d.month() as i64)
            .register_get("day", |d: &mut DateTime<FixedOffset>| d.day() as i64)
            .register_get("timestamp", |d: &mut DateTime<FixedOffset>| d.timestamp());

        engine
            .register_type_with_name::<Url>("Uri")
            .register_fn("to_string", |u: &mut Url| u.to_string())
            .register_get("scheme", |u: &mut Url| u.scheme().to_string())
            .register_get("host", |u: &mut Url| u.host_str().unwrap_or_default().to_string())
            .register_get("path", |u: &mut Url| u.path().to_string());

        engine
            .register_type_with_name::<EnumValue>("Enum")
            .register_fn("to_string", |e: &mut EnumValue| e.member.clone())
            .register_get("name", |e: &mut EnumValue| e.member.clone())
            .register_get("value", |e: &mut EnumValue| e.value)
            .register_fn("==", |a: EnumValue, b: EnumValue| a == b)
            .register_fn("==", |a: EnumValue, b: &str| a.member.eq_ignore_ascii_case(b));
    }

    /// Register helper functions available to every native body
    fn register_functions(engine: &mut Engine) {
        engine.register_fn("base64_encode", |s: &str| -> String {
            use base64::{engine::general_purpose, Engine as _};
            general_purpose::STANDARD.encode(s.as_bytes())
        });

        engine.register_fn(
            "base64_decode",
            |s: &str| -> std::result::Result<String, Box<EvalAltResult>> {
                use base64::{engine::general_purpose, Engine as _};
                let bytes = general_purpose::STANDARD
                    .decode(s.as_bytes())
                    .map_err(|e| format!("invalid base64: {e}"))?;
                String::from_utf8(bytes).map_err(|e| format!("invalid UTF-8: {e}").into())
            },
        );

        engine.register_fn("unix_time", || -> i64 { chrono::Utc::now().timestamp() });

        engine.register_fn("uuid", Uuid::new_v4);

        engine.register_fn("log_debug", |msg: &str| {
            debug!(script_log = msg);
        });

        engine.register_fn("log_info", |msg: &str| {
            info!(script_log = msg);
        });

        engine.register_fn("log_warn", |msg: &str| {
            warn!(script_log = msg);
        });
    }

    /// Borrow the underlying Rhai engine
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Compile a script into an AST
    pub fn compile(&self, origin: &str, source: &str) -> Result<AST> {
        self.compilations.fetch_add(1, Ordering::Relaxed);
        trace!(origin, "Compiling native body");
        self.engine
            .compile(source)
            .map_err(|e| ScriptError::compilation(origin, e))
    }

    /// Whether `body` is a single expression without a terminator
    pub fn is_bare_expression(&self, body: &str) -> bool {
        let trimmed = body.trim();
        !trimmed.is_empty()
            && !trimmed.ends_with(';')
            && self.engine.compile_expression(trimmed).is_ok()
    }

    /// Run `code` in the session, keeping its globals and functions
    pub fn run_in_session(&self, code: &str) -> Result<Dynamic> {
        let mut session = self.session.lock();
        let ast = self
            .engine
            .compile_with_scope(&session.scope, code)
            .map_err(|e| ScriptError::compilation("rhai session", e))?;
        self.compilations.fetch_add(1, Ordering::Relaxed);

        let program = session.lib.merge(&ast);
        let NativeSession { scope, .. } = &mut *session;
        let value = self
            .engine
            .eval_ast_with_scope::<Dynamic>(scope, &program)
            .map_err(|e| ScriptError::from(e).with_context("rhai session"))?;

        session.lib = session.lib.merge(&ast.clone_functions_only());
        Ok(value)
    }

    /// Set a session variable, replacing any previous value
    ///
    /// Constants of the same name (host objects, `const` declarations) are
    /// replaced as well.
    pub fn set_variable(&self, name: &str, value: Dynamic) {
        let mut session = self.session.lock();
        forget(&mut session.scope, name);
        session.scope.push_dynamic(name.to_string(), value);
    }

    /// Whether the session library defines `name`
    pub fn has_function(&self, name: &str) -> bool {
        self.session
            .lock()
            .lib
            .iter_functions()
            .any(|f| f.name == name)
    }

    /// Call `name` in `ast`, with session functions in reach
    pub fn call_fn(&self, ast: &AST, name: &str, args: Vec<Dynamic>) -> Result<Dynamic> {
        let mut session = self.session.lock();
        let program = session.lib.merge(ast);
        let options = CallFnOptions::new().eval_ast(false);
        self.engine
            .call_fn_with_options::<Dynamic>(options, &mut session.scope, &program, name, args)
            .map_err(ScriptError::from)
    }

    /// Call `name` in `ast` with `this` bound to `context`
    pub fn call_hook(&self, ast: &AST, name: &str, context: &mut Dynamic) -> Result<Dynamic> {
        let mut session = self.session.lock();
        let program = session.lib.merge(ast);
        let options = CallFnOptions::new().eval_ast(false).bind_this_ptr(context);
        self.engine
            .call_fn_with_options::<Dynamic>(options, &mut session.scope, &program, name, ())
            .map_err(ScriptError::from)
    }

    /// Drop the session scope and library
    pub fn reset_session(&self) {
        *self.session.lock() = NativeSession::new();
        debug!("Native session reset");
    }
}

impl Default for RhaiEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptEngine for RhaiEngine {
    fn language(&self) -> ScriptLanguage {
        ScriptLanguage::Rhai
    }

    fn initialize_environment(&self) -> Result<()> {
        self.reset_session();
        Ok(())
    }

    fn evaluate(&self, code: &str) -> Result<HostValue> {
        Ok(dynamic_to_json(&self.run_in_session(code)?))
    }

    fn invoke(&self, name: &str, args: &[HostValue]) -> Result<Option<HostValue>> {
        if !self.has_function(name) {
            return Ok(None);
        }
        let args = args
            .iter()
            .map(json_to_dynamic)
            .collect::<Result<Vec<_>>>()?;
        let lib = self.session.lock().lib.clone();
        let value = self.call_fn(&lib, name, args)?;
        Ok(Some(dynamic_to_json(&value)))
    }

    fn set_global(&self, name: &str, value: HostValue) -> Result<()> {
        self.set_variable(name, json_to_dynamic(&value)?);
        Ok(())
    }

    fn add_host_object(&self, name: &str, value: HostValue) -> Result<()> {
        let value = json_to_dynamic(&value)?;
        let mut session = self.session.lock();
        forget(&mut session.scope, name);
        session.scope.push_constant_dynamic(name.to_string(), value);
        Ok(())
    }

    fn cache_stats(&self) -> CacheStats {
        let session = self.session.lock();
        CacheStats {
            cached_scripts: session.lib.iter_functions().count(),
            hits: 0,
            misses: self.compilations.load(Ordering::Relaxed),
        }
    }
}

/// Drop every scope entry named `name`, shadowed ones included
fn forget(scope: &mut Scope<'static>, name: &str) {
    while scope.contains(name) && scope.remove::<Dynamic>(name).is_some() {}
}

/// Convert a host value into a Rhai value
pub fn json_to_dynamic(value: &HostValue) -> Result<Dynamic> {
    rhai::serde::to_dynamic(value).map_err(|e| ScriptError::type_error(e))
}

/// Convert a Rhai value (including registered types) into a host value
pub fn dynamic_to_json(value: &Dynamic) -> HostValue {
    if value.is_unit() {
        return HostValue::Null;
    }
    if let Ok(b) = value.as_bool() {
        return HostValue::Bool(b);
    }
    if let Ok(i) = value.as_int() {
        return HostValue::from(i);
    }
    if let Ok(f) = value.as_float() {
        return serde_json::Number::from_f64(f)
            .map(HostValue::Number)
            .unwrap_or(HostValue::Null);
    }
    if let Ok(c) = value.as_char() {
        return HostValue::String(c.to_string());
    }
    if value.is_string() {
        return HostValue::String(value.to_string());
    }
    if let Some(guid) = value.clone().try_cast::<Uuid>() {
        return HostValue::String(guid.to_string());
    }
    if let Some(date) = value.clone().try_cast::<DateTime<FixedOffset>>() {
        return HostValue::String(date.to_rfc3339());
    }
    if let Some(url) = value.clone().try_cast::<Url>() {
        return HostValue::String(url.to_string());
    }
    if let Some(member) = value.clone().try_cast::<EnumValue>() {
        return HostValue::String(member.member);
    }
    if let Some(array) = value.clone().try_cast::<rhai::Array>() {
        return HostValue::Array(array.iter().map(dynamic_to_json).collect());
    }
    if let Some(map) = value.clone().try_cast::<rhai::Map>() {
        return HostValue::Object(
            map.iter()
                .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
                .collect(),
        );
    }
    HostValue::String(value.to_string())
}
