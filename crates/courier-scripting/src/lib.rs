//! # Courier Scripting
//!
//! Dual-engine scripting for Courier workspaces.
//!
//! ## Engines
//!
//! - **Lua 5.4** (dynamic) - always running; workspaces and scripts are
//!   projected into it lazily
//! - **Rhai** (native) - started only when some body targets it; typed
//!   arguments (`Guid`, `DateTime`, `Uri`, enumerations) reach it through the
//!   cross-engine bridge
//!
//! ## Features
//!
//! - Lazy workspace namespaces with compile-once script resolution
//! - Init, pre-request and post-response override chains following workspace
//!   inheritance, with cycle detection
//! - Argument coercion from loosely-typed values
//! - Diagnostics for configuration-shape problems

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod bridge;
pub mod chain;
pub mod coercion;
pub mod context;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod lua_engine;
pub mod orchestrator;
pub mod projector;
pub mod rhai_engine;

pub use bridge::{CompiledWrapperDef, NativeBridge, WrapperRegistry};
pub use chain::{ChainKey, HandlerChains, HookStage};
pub use coercion::{Coerced, EnumRegistry, TypeToken};
pub use context::{PostResponseContext, PreRequestContext};
pub use diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
pub use engine::{CacheStats, HostValue, ScriptEngine};
pub use error::{Result, ScriptError};
pub use lua_engine::LuaEngine;
pub use orchestrator::{merge_post_results, ScriptOrchestrator, WarmupReport};
pub use projector::{ExecutorSlot, LazyProjector, RequestExecutor};
pub use rhai_engine::{EnumValue, RhaiEngine};

/// Prelude with commonly used types
pub mod prelude {
    pub use crate::context::{PostResponseContext, PreRequestContext};
    pub use crate::diagnostics::{Diagnostic, DiagnosticKind};
    pub use crate::engine::{HostValue, ScriptEngine};
    pub use crate::error::{Result, ScriptError};
    pub use crate::orchestrator::{ScriptOrchestrator, WarmupReport};
}
