//! Script engine trait and abstractions

use crate::error::Result;
use courier_core::{ScriptBlock, ScriptLanguage};
use serde_json::Value;
use std::fmt;

/// Value exchanged between the host and either engine
pub type HostValue = Value;

/// Script engine trait
///
/// This trait abstracts over the dynamic (Lua) and native (Rhai) engines.
/// Implementations are single-threaded interpreters guarded by an internal
/// lock, so every method takes `&self`.
pub trait ScriptEngine: Send + Sync + fmt::Debug {
    /// Get the language this engine runs
    fn language(&self) -> ScriptLanguage;

    /// Prepare globals and helpers
    ///
    /// Repeat calls must leave the engine in the same state as a single call.
    fn initialize_environment(&self) -> Result<()>;

    /// Evaluate a snippet and return its value
    fn evaluate(&self, code: &str) -> Result<HostValue>;

    /// Execute a snippet and return its value rendered as text
    fn execute(&self, code: &str) -> Result<String> {
        Ok(render_text(&self.evaluate(code)?))
    }

    /// Call a global function, returning `None` if it is not defined
    fn invoke(&self, name: &str, args: &[HostValue]) -> Result<Option<HostValue>>;

    /// Assign a mutable global
    fn set_global(&self, name: &str, value: HostValue) -> Result<()>;

    /// Expose a read-only host object
    fn add_host_object(&self, name: &str, value: HostValue) -> Result<()>;

    /// Run the body tagged for this engine, if any
    ///
    /// Returns whether a body ran.
    fn run_init_body(&self, block: &ScriptBlock) -> Result<bool> {
        match block.body_for(self.language()) {
            Some(body) => {
                self.execute(body)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Clear cached compiled chunks
    fn clear_cache(&self) -> Result<()> {
        Ok(())
    }

    /// Get cache statistics (compiled scripts, hit rate, etc.)
    fn cache_stats(&self) -> CacheStats {
        CacheStats::default()
    }
}

/// Render a host value the way `execute` reports it
pub fn render_text(value: &HostValue) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Cache statistics for script engines
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of compiled scripts in cache
    pub cached_scripts: usize,
    /// Cache hits
    pub hits: u64,
    /// Cache misses (each one is a compilation)
    pub misses: u64,
}

impl CacheStats {
    /// Get cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
